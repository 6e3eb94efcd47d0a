//! Workspace Grant Store
//!
//! Mutable assignment state: which packages a workspace subscribes to and
//! which boosts it holds. Assignments and boosts are never physically
//! deleted; terminal statuses keep the audit trail. Boost expiry is computed
//! at read time from `expires_at` — the sweep only persists the status for
//! reporting and is never required for correctness.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use uuid::Uuid;

use quota_common::events::{
    BoostExhausted, BoostExpired, BoostGranted, EventMetadata, EventSink, PackageAssigned,
    PackageCancelled,
};

use crate::catalog::FeatureCatalog;
use crate::model::{
    AssignmentStatus, Boost, BoostKind, BoostStatus, PackageAssignment, WorkspaceId,
};

/// Grant mutation errors
#[derive(Debug, Error)]
pub enum GrantError {
    /// Package code not in the catalog
    #[error("unknown package: {0}")]
    UnknownPackage(String),

    /// Package exists but is deactivated
    #[error("package is not active: {0}")]
    PackageInactive(String),

    /// The workspace already holds an active base package
    #[error("workspace already has an active base package ({0})")]
    BaseConflict(String),

    /// Non-stackable package already actively assigned
    #[error("package {0} is not stackable")]
    NotStackable(String),

    /// Assignment id not found
    #[error("assignment not found: {0}")]
    AssignmentNotFound(Uuid),

    /// Transition requires an active assignment
    #[error("assignment is not active: {0}")]
    NotActive(Uuid),

    /// Transition requires a suspended assignment
    #[error("assignment is not suspended: {0}")]
    NotSuspended(Uuid),

    /// Assignment already reached its terminal status
    #[error("assignment already cancelled: {0}")]
    AlreadyCancelled(Uuid),

    /// Boost id not found
    #[error("boost not found: {0}")]
    BoostNotFound(Uuid),

    /// Transition requires a pending boost
    #[error("boost is not pending: {0}")]
    BoostNotPending(Uuid),

    /// Boost already reached a terminal status
    #[error("boost already in a terminal status: {0}")]
    BoostTerminal(Uuid),
}

/// Store of package assignments and boosts per workspace
pub struct WorkspaceGrantStore {
    catalog: Arc<FeatureCatalog>,
    assignments: RwLock<HashMap<Uuid, PackageAssignment>>,
    boosts: RwLock<HashMap<Uuid, Boost>>,
    events: Arc<dyn EventSink>,
}

impl WorkspaceGrantStore {
    /// New store bound to a catalog and an event sink
    pub fn new(catalog: Arc<FeatureCatalog>, events: Arc<dyn EventSink>) -> Self {
        Self {
            catalog,
            assignments: RwLock::new(HashMap::new()),
            boosts: RwLock::new(HashMap::new()),
            events,
        }
    }

    // === Package assignments ===

    /// Subscribe a workspace to a package
    ///
    /// Enforces the single-active-base-package invariant and rejects a second
    /// active assignment of a non-stackable package.
    pub fn assign_package(
        &self,
        workspace_id: WorkspaceId,
        package_code: &str,
        now: DateTime<Utc>,
    ) -> Result<PackageAssignment, GrantError> {
        let snapshot = self.catalog.snapshot();
        let package = snapshot
            .package(package_code)
            .ok_or_else(|| GrantError::UnknownPackage(package_code.to_string()))?;
        if !package.is_active {
            return Err(GrantError::PackageInactive(package_code.to_string()));
        }

        let mut assignments = self.assignments.write();
        self.check_conflicts(&assignments, workspace_id, package_code, None, now)?;

        let assignment = PackageAssignment::new(workspace_id, package_code, now);
        assignments.insert(assignment.id, assignment.clone());
        drop(assignments);

        tracing::info!(
            workspace_id = %workspace_id,
            package = package_code,
            assignment_id = %assignment.id,
            "package assigned"
        );
        self.events.emit(Box::new(PackageAssigned {
            metadata: EventMetadata::new(workspace_id),
            assignment_id: assignment.id,
            package_code: package_code.to_string(),
        }));

        Ok(assignment)
    }

    /// Suspend an active assignment
    pub fn suspend(&self, assignment_id: Uuid) -> Result<(), GrantError> {
        let mut assignments = self.assignments.write();
        let assignment = assignments
            .get_mut(&assignment_id)
            .ok_or(GrantError::AssignmentNotFound(assignment_id))?;
        if assignment.status != AssignmentStatus::Active {
            return Err(GrantError::NotActive(assignment_id));
        }
        assignment.status = AssignmentStatus::Suspended;
        assignment.updated_at = Utc::now();
        Ok(())
    }

    /// Reactivate a suspended assignment
    ///
    /// Re-runs the assignment invariants: another base package may have been
    /// assigned while this one was suspended.
    pub fn reactivate(&self, assignment_id: Uuid, now: DateTime<Utc>) -> Result<(), GrantError> {
        let mut assignments = self.assignments.write();
        let current = assignments
            .get(&assignment_id)
            .ok_or(GrantError::AssignmentNotFound(assignment_id))?;
        if current.status != AssignmentStatus::Suspended {
            return Err(GrantError::NotSuspended(assignment_id));
        }
        let workspace_id = current.workspace_id;
        let package_code = current.package_code.clone();
        self.check_conflicts(
            &assignments,
            workspace_id,
            &package_code,
            Some(assignment_id),
            now,
        )?;

        let assignment = assignments
            .get_mut(&assignment_id)
            .ok_or(GrantError::AssignmentNotFound(assignment_id))?;
        assignment.status = AssignmentStatus::Active;
        assignment.updated_at = now;
        Ok(())
    }

    /// Cancel an assignment (terminal; row stays for the audit trail)
    pub fn cancel(&self, assignment_id: Uuid, now: DateTime<Utc>) -> Result<(), GrantError> {
        let mut assignments = self.assignments.write();
        let assignment = assignments
            .get_mut(&assignment_id)
            .ok_or(GrantError::AssignmentNotFound(assignment_id))?;
        if assignment.status == AssignmentStatus::Cancelled {
            return Err(GrantError::AlreadyCancelled(assignment_id));
        }
        assignment.status = AssignmentStatus::Cancelled;
        assignment.ends_at = Some(now);
        assignment.updated_at = now;
        let workspace_id = assignment.workspace_id;
        let package_code = assignment.package_code.clone();
        drop(assignments);

        self.events.emit(Box::new(PackageCancelled {
            metadata: EventMetadata::new(workspace_id),
            assignment_id,
            package_code,
        }));
        Ok(())
    }

    /// Assignments granting at `now` for one workspace
    pub fn active_assignments(
        &self,
        workspace_id: WorkspaceId,
        now: DateTime<Utc>,
    ) -> Vec<PackageAssignment> {
        self.assignments
            .read()
            .values()
            .filter(|a| a.workspace_id == workspace_id && a.is_active_at(now))
            .cloned()
            .collect()
    }

    /// Look up one assignment
    pub fn assignment(&self, assignment_id: Uuid) -> Option<PackageAssignment> {
        self.assignments.read().get(&assignment_id).cloned()
    }

    fn check_conflicts(
        &self,
        assignments: &HashMap<Uuid, PackageAssignment>,
        workspace_id: WorkspaceId,
        package_code: &str,
        exclude: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<(), GrantError> {
        let snapshot = self.catalog.snapshot();
        let package = snapshot
            .package(package_code)
            .ok_or_else(|| GrantError::UnknownPackage(package_code.to_string()))?;

        for other in assignments.values() {
            if Some(other.id) == exclude
                || other.workspace_id != workspace_id
                || !other.is_active_at(now)
            {
                continue;
            }
            if package.is_base {
                let other_is_base = snapshot
                    .package(&other.package_code)
                    .map_or(false, |p| p.is_base);
                if other_is_base {
                    return Err(GrantError::BaseConflict(other.package_code.clone()));
                }
            }
            if !package.is_stackable && other.package_code == package_code {
                return Err(GrantError::NotStackable(package_code.to_string()));
            }
        }
        Ok(())
    }

    // === Boosts ===

    /// Grant a boost
    pub fn grant_boost(&self, boost: Boost) -> Boost {
        self.boosts.write().insert(boost.id, boost.clone());

        tracing::info!(
            workspace_id = %boost.workspace_id,
            feature = boost.feature_code.as_str(),
            kind = boost.kind.as_str(),
            boost_id = %boost.id,
            "boost granted"
        );
        self.events.emit(Box::new(BoostGranted {
            metadata: EventMetadata::new(boost.workspace_id),
            boost_id: boost.id,
            feature_code: boost.feature_code.clone(),
            kind: boost.kind.as_str().to_string(),
            limit_value: boost.limit_value,
        }));

        boost
    }

    /// Activate a staged boost
    pub fn activate_boost(&self, boost_id: Uuid) -> Result<(), GrantError> {
        let mut boosts = self.boosts.write();
        let boost = boosts
            .get_mut(&boost_id)
            .ok_or(GrantError::BoostNotFound(boost_id))?;
        if boost.status != BoostStatus::Pending {
            return Err(GrantError::BoostNotPending(boost_id));
        }
        boost.status = BoostStatus::Active;
        Ok(())
    }

    /// Revoke a pending or active boost (terminal; row stays for the audit
    /// trail)
    ///
    /// Terminal statuses are never rewritten.
    pub fn cancel_boost(&self, boost_id: Uuid) -> Result<(), GrantError> {
        let mut boosts = self.boosts.write();
        let boost = boosts
            .get_mut(&boost_id)
            .ok_or(GrantError::BoostNotFound(boost_id))?;
        if !matches!(boost.status, BoostStatus::Pending | BoostStatus::Active) {
            return Err(GrantError::BoostTerminal(boost_id));
        }
        boost.status = BoostStatus::Cancelled;
        Ok(())
    }

    /// Look up one boost
    pub fn boost(&self, boost_id: Uuid) -> Option<Boost> {
        self.boosts.read().get(&boost_id).cloned()
    }

    /// Boosts granting at `now` for one (workspace, feature), oldest first
    pub fn live_boosts(
        &self,
        workspace_id: WorkspaceId,
        feature_code: &str,
        now: DateTime<Utc>,
    ) -> Vec<Boost> {
        let mut live: Vec<Boost> = self
            .boosts
            .read()
            .values()
            .filter(|b| {
                b.workspace_id == workspace_id
                    && b.feature_code == feature_code
                    && b.is_live_at(now)
            })
            .cloned()
            .collect();
        live.sort_by_key(|b| b.granted_at);
        live
    }

    /// Drain add-limit boosts by `quantity`, oldest first
    ///
    /// Runs in one write-lock section so concurrent recorders cannot consume
    /// the same headroom twice. Boosts reaching `consumed == limit_value`
    /// transition to Exhausted and are skipped thereafter, never deleted.
    /// Returns the quantity actually drained (the remainder, if any, rides on
    /// package quota).
    pub fn consume_from_boosts(
        &self,
        workspace_id: WorkspaceId,
        feature_code: &str,
        quantity: u64,
        now: DateTime<Utc>,
    ) -> u64 {
        let mut boosts = self.boosts.write();

        let mut order: Vec<(DateTime<Utc>, Uuid)> = boosts
            .values()
            .filter(|b| {
                b.workspace_id == workspace_id
                    && b.feature_code == feature_code
                    && b.kind == BoostKind::AddLimit
                    && b.is_live_at(now)
            })
            .map(|b| (b.granted_at, b.id))
            .collect();
        order.sort();

        let mut remaining = quantity;
        let mut exhausted = Vec::new();
        for (_, id) in order {
            if remaining == 0 {
                break;
            }
            if let Some(boost) = boosts.get_mut(&id) {
                let take = remaining.min(boost.headroom());
                boost.consumed += take;
                remaining -= take;
                if boost.headroom() == 0 {
                    boost.status = BoostStatus::Exhausted;
                    exhausted.push((id, boost.limit_value.unwrap_or(0)));
                }
            }
        }
        drop(boosts);

        for (id, limit_value) in exhausted {
            tracing::info!(
                workspace_id = %workspace_id,
                feature = feature_code,
                boost_id = %id,
                "boost exhausted"
            );
            self.events.emit(Box::new(BoostExhausted {
                metadata: EventMetadata::new(workspace_id),
                boost_id: id,
                feature_code: feature_code.to_string(),
                limit_value,
            }));
        }

        quantity - remaining
    }

    /// Persist the Expired status for boosts past their expiry
    ///
    /// Reporting only — liveness checks already treat expiry as a read-time
    /// property, so correctness never depends on this running.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> usize {
        let mut boosts = self.boosts.write();
        let mut swept = Vec::new();
        for boost in boosts.values_mut() {
            if boost.status == BoostStatus::Active && boost.is_expired_at(now) {
                boost.status = BoostStatus::Expired;
                swept.push((boost.workspace_id, boost.id, boost.feature_code.clone()));
            }
        }
        drop(boosts);

        for (workspace_id, boost_id, feature_code) in &swept {
            self.events.emit(Box::new(BoostExpired {
                metadata: EventMetadata::new(*workspace_id),
                boost_id: *boost_id,
                feature_code: feature_code.clone(),
            }));
        }
        if !swept.is_empty() {
            tracing::info!(count = swept.len(), "expired boosts swept");
        }
        swept.len()
    }
}
