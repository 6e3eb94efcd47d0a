//! Entitlement Resolver
//!
//! Merges catalog definitions, active package assignments, live boosts and
//! period usage into one verdict per (workspace, feature) query, and owns the
//! usage-recording entry point consumers call after a successful action.
//!
//! Pooled features substitute an accounting feature: usage lands in a single
//! cell keyed by the pool root, and every level of the chain checks its own
//! effective limit against that shared pooled total. The strictest level
//! fires first.
//!
//! Every decision-path outcome is data (`EntitlementResult`); the only errors
//! on this path are integrity defects raised long before a request runs.
//!
//! Accounting note: the ledger cell receives the recorded quantity net of
//! what add-limit boosts absorbed. Effective limits are computed from boost
//! headroom, so counting drained units in the cell as well would subtract
//! them twice and `remaining = limit - used` would no longer hold.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use quota_common::events::{EventMetadata, EventSink, QuotaLimitReached};

use crate::catalog::{CatalogSnapshot, FeatureCatalog};
use crate::grants::WorkspaceGrantStore;
use crate::ledger::UsageLedger;
use crate::model::{Feature, FeatureKind, GrantValue, ResetPolicy, UsageRecord, WorkspaceId};
use crate::period::current_period;

/// Denial reason: feature code unknown or deactivated
pub const REASON_FEATURE_UNKNOWN: &str = "feature_unknown";
/// Denial reason: no active grant or boost covers the feature
pub const REASON_NOT_ENTITLED: &str = "not_entitled";
/// Denial reason: the current period's quota is spent
pub const REASON_LIMIT_EXCEEDED: &str = "limit_exceeded";

/// The verdict for one (workspace, feature) query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementResult {
    /// Whether the action may proceed
    pub allowed: bool,
    /// Entitled without any quota accounting
    pub unlimited: bool,
    /// Effective limit, when quota-bound
    pub limit: Option<u64>,
    /// Current-period usage, when quota-bound
    pub used: Option<u64>,
    /// `limit - used`, when quota-bound
    pub remaining: Option<u64>,
    /// Populated on denial
    pub reason: Option<String>,
    /// The queried feature
    pub feature_code: String,
}

impl EntitlementResult {
    /// Allowed with quota figures
    pub fn allowed(feature_code: &str, limit: u64, used: u64) -> Self {
        Self {
            allowed: true,
            unlimited: false,
            limit: Some(limit),
            used: Some(used),
            remaining: Some(limit.saturating_sub(used)),
            reason: None,
            feature_code: feature_code.to_string(),
        }
    }

    /// Allowed with no quota figures (boolean features)
    pub fn allowed_flag(feature_code: &str) -> Self {
        Self {
            allowed: true,
            unlimited: false,
            limit: None,
            used: None,
            remaining: None,
            reason: None,
            feature_code: feature_code.to_string(),
        }
    }

    /// Allowed without bound; no accounting performed
    pub fn unlimited(feature_code: &str) -> Self {
        Self {
            allowed: true,
            unlimited: true,
            limit: None,
            used: None,
            remaining: None,
            reason: None,
            feature_code: feature_code.to_string(),
        }
    }

    /// Denied without quota figures
    pub fn denied(feature_code: &str, reason: &str) -> Self {
        Self {
            allowed: false,
            unlimited: false,
            limit: None,
            used: None,
            remaining: None,
            reason: Some(reason.to_string()),
            feature_code: feature_code.to_string(),
        }
    }

    /// Denied carrying the limit/used pair that fired
    pub fn denied_with_usage(feature_code: &str, reason: &str, limit: u64, used: u64) -> Self {
        Self {
            allowed: false,
            unlimited: false,
            limit: Some(limit),
            used: Some(used),
            remaining: None,
            reason: Some(reason.to_string()),
            feature_code: feature_code.to_string(),
        }
    }
}

/// Errors from the recording entry point
#[derive(Debug, Error)]
pub enum RecordError {
    /// Feature code unknown or deactivated
    #[error("unknown feature: {0}")]
    UnknownFeature(String),

    /// A capped counter refused the increment even after one retry
    #[error("quota exceeded for {feature_code}: limit {limit}, used {used}")]
    QuotaExceeded {
        /// The accounting feature whose cap fired
        feature_code: String,
        /// Effective limit at the failed attempt
        limit: u64,
        /// Cell value at the failed attempt
        used: u64,
    },
}

/// The engine core
pub struct EntitlementResolver {
    catalog: Arc<FeatureCatalog>,
    grants: Arc<WorkspaceGrantStore>,
    ledger: Arc<UsageLedger>,
    events: Arc<dyn EventSink>,
}

impl EntitlementResolver {
    /// Wire the resolver to its collaborators
    pub fn new(
        catalog: Arc<FeatureCatalog>,
        grants: Arc<WorkspaceGrantStore>,
        ledger: Arc<UsageLedger>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            catalog,
            grants,
            ledger,
            events,
        }
    }

    /// Resolve for a single unit
    pub fn resolve(&self, workspace_id: WorkspaceId, feature_code: &str) -> EntitlementResult {
        self.resolve_quantity(workspace_id, feature_code, 1)
    }

    /// Resolve for `quantity` units at the current instant
    pub fn resolve_quantity(
        &self,
        workspace_id: WorkspaceId,
        feature_code: &str,
        quantity: u64,
    ) -> EntitlementResult {
        self.resolve_at(workspace_id, feature_code, quantity, Utc::now())
    }

    /// Resolve at an explicit instant
    pub fn resolve_at(
        &self,
        workspace_id: WorkspaceId,
        feature_code: &str,
        quantity: u64,
        now: DateTime<Utc>,
    ) -> EntitlementResult {
        let snapshot = self.catalog.snapshot();
        let feature = match snapshot.feature(feature_code) {
            Some(feature) if feature.is_active => feature,
            _ => {
                tracing::debug!(
                    workspace_id = %workspace_id,
                    feature = feature_code,
                    "resolve: unknown or inactive feature"
                );
                return EntitlementResult::denied(feature_code, REASON_FEATURE_UNKNOWN);
            }
        };

        let value = match self.effective_value(&snapshot, workspace_id, feature, now) {
            Some(value) => value,
            None => {
                return EntitlementResult::denied(feature_code, REASON_NOT_ENTITLED);
            }
        };

        match feature.kind {
            FeatureKind::Boolean => EntitlementResult::allowed_flag(feature_code),
            FeatureKind::Unlimited => EntitlementResult::unlimited(feature_code),
            FeatureKind::Limit => {
                self.resolve_limited(&snapshot, workspace_id, feature, value, quantity, now)
            }
        }
    }

    fn resolve_limited(
        &self,
        snapshot: &CatalogSnapshot,
        workspace_id: WorkspaceId,
        feature: &Feature,
        value: GrantValue,
        quantity: u64,
        now: DateTime<Utc>,
    ) -> EntitlementResult {
        // Every level of the pool chain must be entitled; each level's
        // effective limit is checked against the shared pooled total.
        let mut limits = Vec::new();
        if let Some(limit) = Self::numeric_limit(value) {
            limits.push(limit);
        }

        let chain = snapshot.parent_chain(&feature.code);
        for parent in &chain {
            match self.effective_value(snapshot, workspace_id, parent, now) {
                Some(parent_value) => {
                    if let Some(limit) = Self::numeric_limit(parent_value) {
                        limits.push(limit);
                    }
                }
                None => {
                    // Pooled feature whose pool grants no capacity.
                    return EntitlementResult::denied(&feature.code, REASON_NOT_ENTITLED);
                }
            }
        }

        if limits.is_empty() {
            return EntitlementResult::unlimited(&feature.code);
        }

        let accounting = chain.last().copied().unwrap_or(feature);
        let used = self.usage_for(accounting, workspace_id, now);

        // Shared pooled total: the smallest limit is the strictest level.
        let binding = limits.iter().copied().min().unwrap_or(0);
        if binding.saturating_sub(used) >= quantity {
            EntitlementResult::allowed(&feature.code, binding, used)
        } else {
            tracing::debug!(
                workspace_id = %workspace_id,
                feature = feature.code.as_str(),
                limit = binding,
                used,
                quantity,
                "resolve: limit exceeded"
            );
            EntitlementResult::denied_with_usage(
                &feature.code,
                REASON_LIMIT_EXCEEDED,
                binding,
                used,
            )
        }
    }

    /// Numeric constraint carried by a merged grant value, if any
    ///
    /// A bare flag on a quota feature (e.g. an enable boost) proves
    /// entitlement but contributes no capacity.
    fn numeric_limit(value: GrantValue) -> Option<u64> {
        match value {
            GrantValue::Unlimited => None,
            GrantValue::Limited(limit) => Some(limit),
            GrantValue::Flag => Some(0),
        }
    }

    /// Record consumption after a successful action
    ///
    /// Resolves the accounting feature (pool substitution), drains add-limit
    /// boosts oldest-first, and atomically increments the accounting cell
    /// with the remainder. Returns the updated cell.
    pub fn record_usage(
        &self,
        workspace_id: WorkspaceId,
        feature_code: &str,
        quantity: u64,
    ) -> Result<UsageRecord, RecordError> {
        self.record_usage_at(workspace_id, feature_code, quantity, Utc::now())
    }

    /// Record consumption at an explicit instant
    pub fn record_usage_at(
        &self,
        workspace_id: WorkspaceId,
        feature_code: &str,
        quantity: u64,
        now: DateTime<Utc>,
    ) -> Result<UsageRecord, RecordError> {
        let snapshot = self.catalog.snapshot();
        let feature = match snapshot.feature(feature_code) {
            Some(feature) if feature.is_active => feature,
            _ => return Err(RecordError::UnknownFeature(feature_code.to_string())),
        };

        let accounting = snapshot
            .parent_chain(feature_code)
            .last()
            .copied()
            .unwrap_or(feature);

        // Expiring boosts drain before permanent grants are touched; the
        // remainder rides on package quota and lands in the accounting cell.
        // Draining happens at the accounting feature so that boost-funded
        // consumption by pooled children stays visible in the pooled total;
        // a boost on a child widens the child's own limit without draining.
        let net = if accounting.kind == FeatureKind::Limit {
            let drained =
                self.grants
                    .consume_from_boosts(workspace_id, &accounting.code, quantity, now);
            quantity - drained
        } else {
            quantity
        };
        let cap = match self.effective_value(&snapshot, workspace_id, accounting, now) {
            Some(GrantValue::Limited(limit)) if accounting.kind == FeatureKind::Limit => {
                Some(limit)
            }
            _ => None,
        };

        let (period_key, used_after) =
            self.bump_accounting_cell(workspace_id, accounting, net, cap, now)?;

        if let Some(cap) = cap {
            let used_before = used_after.saturating_sub(net);
            if used_after >= cap && used_before < cap {
                self.events.emit(Box::new(QuotaLimitReached {
                    metadata: EventMetadata::new(workspace_id),
                    feature_code: accounting.code.clone(),
                    limit: cap,
                    used: used_after,
                }));
            }
        }

        Ok(UsageRecord {
            workspace_id,
            feature_code: accounting.code.clone(),
            period_key,
            used: used_after,
            updated_at: now,
        })
    }

    /// Operator reset of the current period for one feature
    ///
    /// Pool substitution applies: resetting a pooled child resets the shared
    /// accounting cell.
    pub fn reset_current_period(
        &self,
        workspace_id: WorkspaceId,
        feature_code: &str,
        now: DateTime<Utc>,
    ) {
        let snapshot = self.catalog.snapshot();
        let feature = match snapshot.feature(feature_code) {
            Some(feature) => feature,
            None => return,
        };
        let accounting = snapshot
            .parent_chain(feature_code)
            .last()
            .copied()
            .unwrap_or(feature);
        match accounting.reset_policy {
            ResetPolicy::Rolling { .. } => {
                // Rolling usage lives in the event stream; clearing this
                // one stream is equivalent to a reset.
                self.ledger.clear_stream(workspace_id, &accounting.code);
            }
            policy => {
                let period = current_period(policy, now);
                self.ledger.reset(workspace_id, &accounting.code, &period.key);
            }
        }
    }

    /// Increment the accounting cell, capped when the feature is quota-bound.
    /// A conflicting capped increment is retried once with fresh state before
    /// it surfaces as quota exhaustion.
    fn bump_accounting_cell(
        &self,
        workspace_id: WorkspaceId,
        accounting: &Feature,
        net: u64,
        cap: Option<u64>,
        now: DateTime<Utc>,
    ) -> Result<(String, u64), RecordError> {
        let period = current_period(accounting.reset_policy, now);
        let rolling = matches!(accounting.reset_policy, ResetPolicy::Rolling { .. });

        let attempt = |cap: u64| -> Result<u64, crate::ledger::LedgerError> {
            if rolling {
                self.ledger.record_event_capped(
                    workspace_id,
                    &accounting.code,
                    now,
                    net,
                    period.start,
                    cap,
                )
            } else {
                self.ledger
                    .increment_capped(workspace_id, &accounting.code, &period.key, net, cap)
            }
        };

        let used_after = match cap {
            None => {
                if rolling {
                    self.ledger
                        .record_event(workspace_id, &accounting.code, now, net);
                    self.ledger
                        .range_sum(workspace_id, &accounting.code, period.start, period.end)
                } else {
                    self.ledger
                        .increment(workspace_id, &accounting.code, &period.key, net)
                }
            }
            Some(cap_value) => match attempt(cap_value) {
                Ok(used) => used,
                Err(_) => {
                    // A concurrent recorder may have filled the cell, or a
                    // boost may have landed meanwhile; re-read and retry once.
                    let snapshot = self.catalog.snapshot();
                    let fresh_cap =
                        match self.effective_value(&snapshot, workspace_id, accounting, now) {
                            Some(GrantValue::Limited(limit)) => limit,
                            Some(GrantValue::Unlimited) => u64::MAX,
                            _ => cap_value,
                        };
                    match attempt(fresh_cap) {
                        Ok(used) => used,
                        Err(err) => {
                            tracing::warn!(
                                workspace_id = %workspace_id,
                                feature = accounting.code.as_str(),
                                %err,
                                "capped increment conflict, surfacing as quota exhaustion"
                            );
                            let used = if rolling {
                                self.ledger.range_sum(
                                    workspace_id,
                                    &accounting.code,
                                    period.start,
                                    period.end,
                                )
                            } else {
                                self.ledger.get(workspace_id, &accounting.code, &period.key)
                            };
                            return Err(RecordError::QuotaExceeded {
                                feature_code: accounting.code.clone(),
                                limit: fresh_cap,
                                used,
                            });
                        }
                    }
                }
            },
        };

        Ok((period.key, used_after))
    }

    /// Current-period usage for one feature, shape chosen by its reset policy
    fn usage_for(&self, feature: &Feature, workspace_id: WorkspaceId, now: DateTime<Utc>) -> u64 {
        let period = current_period(feature.reset_policy, now);
        match feature.reset_policy {
            ResetPolicy::Rolling { .. } => {
                self.ledger
                    .range_sum(workspace_id, &feature.code, period.start, period.end)
            }
            _ => self.ledger.get(workspace_id, &feature.code, &period.key),
        }
    }

    /// Merge everything the workspace holds for one feature
    ///
    /// `None` means no grant of any kind — not entitled. The single active
    /// base package contributes at most once by construction (the grant store
    /// refuses a second active base assignment); stackable addons sum.
    fn effective_value(
        &self,
        snapshot: &CatalogSnapshot,
        workspace_id: WorkspaceId,
        feature: &Feature,
        now: DateTime<Utc>,
    ) -> Option<GrantValue> {
        let mut acc: Option<GrantValue> = None;
        let mut fold = |value: GrantValue| {
            acc = Some(match acc {
                Some(current) => current.merge(value),
                None => value,
            });
        };

        for assignment in self.grants.active_assignments(workspace_id, now) {
            let package = match snapshot.package(&assignment.package_code) {
                Some(package) if package.is_active => package,
                _ => continue,
            };
            for grant in &package.grants {
                if grant.feature_code != feature.code {
                    continue;
                }
                let value = match feature.kind {
                    FeatureKind::Limit => match grant.limit {
                        Some(limit) => GrantValue::Limited(limit),
                        // No numeric limit on a quota feature: unlimited via
                        // this package.
                        None => GrantValue::Unlimited,
                    },
                    _ => GrantValue::Flag,
                };
                fold(value);
            }
        }

        for boost in self.grants.live_boosts(workspace_id, &feature.code, now) {
            let value = match boost.kind {
                crate::model::BoostKind::Enable => GrantValue::Flag,
                crate::model::BoostKind::Unlimited => GrantValue::Unlimited,
                crate::model::BoostKind::AddLimit => GrantValue::Limited(boost.headroom()),
            };
            fold(value);
        }

        acc
    }
}
