//! OpenQuota Engine - Entitlement Resolution and Quota Accounting
//!
//! Decides, for a workspace and a feature, whether an action is allowed and
//! how much quota remains, merging package grants, boosts and period usage
//! into one verdict.
//!
//! ```text
//!                      ┌─────────────────────┐
//!                      │  EntitlementEngine  │
//!                      └──────────┬──────────┘
//!                                 │
//!                      ┌──────────▼──────────┐
//!        reload ──────▶│ EntitlementResolver │◀────── resolve / record
//!                      └──────────┬──────────┘
//!              ┌─────────────────┼─────────────────┐
//!    ┌─────────▼────────┐ ┌──────▼──────────┐ ┌────▼────────┐
//!    │  FeatureCatalog  │ │ WorkspaceGrant  │ │ UsageLedger │
//!    │  (arc-swap snap) │ │ Store           │ │ (counters + │
//!    │                  │ │ (assignments,   │ │  events)    │
//!    │                  │ │  boosts)        │ │             │
//!    └──────────────────┘ └─────────────────┘ └─────────────┘
//! ```
//!
//! Reference data (features, packages) is immutable per snapshot and swapped
//! wholesale on reload; grant state and usage mutate under their own locks.
//! Denials are data, not errors: the decision path returns a verdict struct
//! and reserves `Result` for integrity defects.

#![warn(missing_docs)]

pub mod catalog;
pub mod grants;
pub mod ledger;
pub mod model;
pub mod period;
pub mod resolver;

pub use catalog::{CatalogDocument, CatalogSnapshot, FeatureCatalog};
pub use grants::{GrantError, WorkspaceGrantStore};
pub use ledger::{LedgerError, UsageLedger};
pub use model::{
    AssignmentStatus, Boost, BoostDuration, BoostKind, BoostStatus, Feature, FeatureKind,
    GrantValue, Package, PackageAssignment, PackageGrant, ResetPolicy, UsageRecord, WorkspaceId,
};
pub use period::{current_period, Period, ALL_TIME_KEY};
pub use resolver::{EntitlementResolver, EntitlementResult, RecordError};

use std::sync::Arc;

use chrono::{DateTime, Utc};

use quota_common::events::EventSink;
use quota_common::EngineResult;

/// Fully wired engine
///
/// Owns one catalog, one grant store and one ledger, and exposes the two
/// hot-path calls plus handles to the underlying stores for administrative
/// work.
pub struct EntitlementEngine {
    catalog: Arc<FeatureCatalog>,
    grants: Arc<WorkspaceGrantStore>,
    ledger: Arc<UsageLedger>,
    resolver: EntitlementResolver,
}

impl EntitlementEngine {
    /// Build an engine from catalog contents and an event sink
    pub fn new(
        features: Vec<Feature>,
        packages: Vec<Package>,
        events: Arc<dyn EventSink>,
    ) -> EngineResult<Self> {
        let catalog = Arc::new(FeatureCatalog::new(features, packages)?);
        let grants = Arc::new(WorkspaceGrantStore::new(catalog.clone(), events.clone()));
        let ledger = Arc::new(UsageLedger::new());
        let resolver = EntitlementResolver::new(
            catalog.clone(),
            grants.clone(),
            ledger.clone(),
            events,
        );
        Ok(Self {
            catalog,
            grants,
            ledger,
            resolver,
        })
    }

    /// Resolve one unit for (workspace, feature)
    pub fn resolve(&self, workspace_id: WorkspaceId, feature_code: &str) -> EntitlementResult {
        self.resolver.resolve(workspace_id, feature_code)
    }

    /// Record consumption after a successful action
    pub fn record_usage(
        &self,
        workspace_id: WorkspaceId,
        feature_code: &str,
        quantity: u64,
    ) -> Result<UsageRecord, RecordError> {
        self.resolver.record_usage(workspace_id, feature_code, quantity)
    }

    /// Swap in new catalog contents; the old snapshot stays on failure
    pub fn reload_catalog(
        &self,
        features: Vec<Feature>,
        packages: Vec<Package>,
    ) -> EngineResult<()> {
        self.catalog.reload(features, packages)
    }

    /// Persist Expired status for boosts past their expiry
    pub fn sweep_expired_boosts(&self, now: DateTime<Utc>) -> usize {
        self.grants.sweep_expired(now)
    }

    /// The resolver, for explicit-instant and quantity-aware calls
    pub fn resolver(&self) -> &EntitlementResolver {
        &self.resolver
    }

    /// Catalog handle
    pub fn catalog(&self) -> &FeatureCatalog {
        &self.catalog
    }

    /// Grant store handle
    pub fn grants(&self) -> &WorkspaceGrantStore {
        &self.grants
    }

    /// Usage ledger handle
    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use quota_common::events::EventBuffer;
    use resolver::{REASON_LIMIT_EXCEEDED, REASON_NOT_ENTITLED};
    use uuid::Uuid;

    fn engine_with(features: Vec<Feature>, packages: Vec<Package>) -> EntitlementEngine {
        EntitlementEngine::new(features, packages, Arc::new(EventBuffer::new())).unwrap()
    }

    #[test]
    fn test_bio_pages_scenario() {
        let engine = engine_with(
            vec![Feature::limited("bio.pages", ResetPolicy::Monthly)],
            vec![Package::base("starter").with_grant("bio.pages", Some(10))],
        );
        let ws = Uuid::new_v4();
        let now = Utc::now();

        engine.grants().assign_package(ws, "starter", now).unwrap();

        let fresh = engine.resolver().resolve_at(ws, "bio.pages", 1, now);
        assert!(fresh.allowed);
        assert_eq!(fresh.limit, Some(10));
        assert_eq!(fresh.used, Some(0));
        assert_eq!(fresh.remaining, Some(10));

        engine.resolver().record_usage_at(ws, "bio.pages", 10, now).unwrap();
        let spent = engine.resolver().resolve_at(ws, "bio.pages", 1, now);
        assert!(!spent.allowed);
        assert_eq!(spent.reason.as_deref(), Some(REASON_LIMIT_EXCEEDED));
        assert_eq!(spent.limit, Some(10));
        assert_eq!(spent.used, Some(10));

        engine.grants().grant_boost(Boost::add_limit(ws, "bio.pages", 5));
        let boosted = engine.resolver().resolve_at(ws, "bio.pages", 1, now);
        assert!(boosted.allowed);
        assert_eq!(boosted.limit, Some(15));
        assert_eq!(boosted.used, Some(10));
        assert_eq!(boosted.remaining, Some(5));
    }

    #[test]
    fn test_pool_aggregation_scenario() {
        let engine = engine_with(
            vec![
                Feature::limited("api.calls", ResetPolicy::Monthly),
                Feature::limited("api.calls.search", ResetPolicy::Monthly)
                    .pooled_under("api.calls"),
            ],
            vec![Package::base("pro")
                .with_grant("api.calls", Some(100))
                .with_grant("api.calls.search", Some(25))],
        );
        let ws = Uuid::new_v4();
        let now = Utc::now();

        engine.grants().assign_package(ws, "pro", now).unwrap();
        for _ in 0..3 {
            engine
                .resolver()
                .record_usage_at(ws, "api.calls.search", 10, now)
                .unwrap();
        }

        let parent = engine.resolver().resolve_at(ws, "api.calls", 1, now);
        assert_eq!(parent.used, Some(30));
        assert!(parent.allowed);

        // The child's own limit of 25 fires even though the pool still has
        // headroom.
        let child = engine.resolver().resolve_at(ws, "api.calls.search", 10, now);
        assert!(!child.allowed);
        assert_eq!(child.reason.as_deref(), Some(REASON_LIMIT_EXCEEDED));
        assert_eq!(child.limit, Some(25));
        assert_eq!(child.used, Some(30));
    }

    #[test]
    fn test_boost_exhaustion_falls_back_to_package_limits() {
        let engine = engine_with(
            vec![Feature::limited("bio.pages", ResetPolicy::Monthly)],
            vec![],
        );
        let ws = Uuid::new_v4();
        let now = Utc::now();

        let boost = engine
            .grants()
            .grant_boost(Boost::add_limit(ws, "bio.pages", 5));

        for _ in 0..5 {
            assert!(engine.resolver().resolve_at(ws, "bio.pages", 1, now).allowed);
            engine
                .resolver()
                .record_usage_at(ws, "bio.pages", 1, now)
                .unwrap();
        }

        let stored = engine.grants().boost(boost.id).unwrap();
        assert_eq!(stored.consumed, 5);
        assert_eq!(stored.status, BoostStatus::Exhausted);

        // No package grants back the feature, so resolution falls all the
        // way back to not entitled.
        let after = engine.resolver().resolve_at(ws, "bio.pages", 1, now);
        assert_eq!(after.reason.as_deref(), Some(REASON_NOT_ENTITLED));
    }

    #[test]
    fn test_monthly_rollover_starts_a_fresh_period() {
        let engine = engine_with(
            vec![Feature::limited("bio.pages", ResetPolicy::Monthly)],
            vec![Package::base("starter").with_grant("bio.pages", Some(10))],
        );
        let ws = Uuid::new_v4();
        let august = Utc.with_ymd_and_hms(2026, 8, 20, 12, 0, 0).unwrap();
        let september = Utc.with_ymd_and_hms(2026, 9, 2, 12, 0, 0).unwrap();

        engine.grants().assign_package(ws, "starter", august).unwrap();
        engine
            .resolver()
            .record_usage_at(ws, "bio.pages", 10, august)
            .unwrap();
        assert!(!engine.resolver().resolve_at(ws, "bio.pages", 1, august).allowed);

        let next_month = engine.resolver().resolve_at(ws, "bio.pages", 1, september);
        assert!(next_month.allowed);
        assert_eq!(next_month.remaining, Some(10));
    }

    #[test]
    fn test_expired_boost_stops_granting_without_a_sweep() {
        let engine = engine_with(
            vec![Feature::limited("bio.pages", ResetPolicy::Monthly)],
            vec![],
        );
        let ws = Uuid::new_v4();
        let now = Utc::now();

        engine.grants().grant_boost(
            Boost::add_limit(ws, "bio.pages", 5).expiring_at(now + Duration::hours(1)),
        );

        assert!(engine.resolver().resolve_at(ws, "bio.pages", 1, now).allowed);
        let later = now + Duration::hours(2);
        assert!(!engine.resolver().resolve_at(ws, "bio.pages", 1, later).allowed);

        assert_eq!(engine.sweep_expired_boosts(later), 1);
    }

    #[test]
    fn test_catalog_reload_changes_verdicts() {
        let engine = engine_with(
            vec![Feature::boolean("custom.domain")],
            vec![Package::base("pro").with_grant("custom.domain", None)],
        );
        let ws = Uuid::new_v4();

        engine.grants().assign_package(ws, "pro", Utc::now()).unwrap();
        assert!(engine.resolve(ws, "custom.domain").allowed);

        // Reload drops the grant from the package; entitlement disappears.
        engine
            .reload_catalog(vec![Feature::boolean("custom.domain")], vec![Package::base("pro")])
            .unwrap();
        assert!(!engine.resolve(ws, "custom.domain").allowed);
    }

    #[test]
    fn test_parallel_recording_never_overshoots() {
        use std::sync::atomic::{AtomicU64, Ordering};

        let engine = Arc::new(engine_with(
            vec![Feature::limited("bio.pages", ResetPolicy::Monthly)],
            vec![Package::base("starter").with_grant("bio.pages", Some(50))],
        ));
        let ws = Uuid::new_v4();
        let now = Utc::now();
        engine.grants().assign_package(ws, "starter", now).unwrap();

        let accepted = Arc::new(AtomicU64::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let accepted = Arc::clone(&accepted);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        if engine
                            .resolver()
                            .record_usage_at(ws, "bio.pages", 1, now)
                            .is_ok()
                        {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 50);
        let result = engine.resolver().resolve_at(ws, "bio.pages", 1, now);
        assert_eq!(result.used, Some(50));
        assert!(!result.allowed);
    }
}
