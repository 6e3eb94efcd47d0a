//! Entitlement Data Model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workspace ID
pub type WorkspaceId = Uuid;

/// Feature semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Pure allow/deny, no numbers
    Boolean,
    /// Numeric quota per accounting period
    Limit,
    /// Always allowed once entitled, no accounting
    Unlimited,
}

/// When a feature's usage counter starts over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Single all-time bucket, no rollover
    None,
    /// Calendar-month buckets (UTC)
    Monthly,
    /// Sliding window over the trailing N days
    Rolling {
        /// Window length in days
        window_days: u32,
    },
}

/// A named capability
///
/// Identity is the `code` and never changes. Features are soft-deactivated,
/// never hard-deleted, while packages, boosts or usage still reference them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feature {
    /// Unique string key, e.g. `bio.pages`
    pub code: String,
    /// Display name
    pub name: String,
    /// Feature semantics
    pub kind: FeatureKind,
    /// Usage reset policy
    pub reset_policy: ResetPolicy,
    /// Pool parent: usage on this feature also counts toward the parent
    pub parent_code: Option<String>,
    /// Soft-deactivation flag
    pub is_active: bool,
}

impl Feature {
    /// Boolean feature
    pub fn boolean(code: &str) -> Self {
        Self::new(code, FeatureKind::Boolean, ResetPolicy::None)
    }

    /// Quota-bound feature
    pub fn limited(code: &str, reset_policy: ResetPolicy) -> Self {
        Self::new(code, FeatureKind::Limit, reset_policy)
    }

    /// Unlimited feature
    pub fn unlimited(code: &str) -> Self {
        Self::new(code, FeatureKind::Unlimited, ResetPolicy::None)
    }

    fn new(code: &str, kind: FeatureKind, reset_policy: ResetPolicy) -> Self {
        Self {
            code: code.to_string(),
            name: code.to_string(),
            kind,
            reset_policy,
            parent_code: None,
            is_active: true,
        }
    }

    /// Attach this feature to a quota pool
    pub fn pooled_under(mut self, parent_code: &str) -> Self {
        self.parent_code = Some(parent_code.to_string());
        self
    }

    /// Soft-deactivate
    pub fn deactivated(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// One feature grant inside a package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageGrant {
    /// Granted feature
    pub feature_code: String,
    /// Quota granted; `None` on a limit feature means unlimited via this package
    pub limit: Option<u64>,
}

/// A sellable bundle of feature grants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    /// Unique string key
    pub code: String,
    /// Display name
    pub name: String,
    /// At most one active base package per workspace
    pub is_base: bool,
    /// Whether several active assignments of this package may coexist
    pub is_stackable: bool,
    /// Soft-deactivation flag
    pub is_active: bool,
    /// Visible in self-service listings
    pub is_public: bool,
    /// Ordered feature grants
    pub grants: Vec<PackageGrant>,
}

impl Package {
    /// Base plan package
    pub fn base(code: &str) -> Self {
        Self::new(code, true, false)
    }

    /// Stackable addon package
    pub fn addon(code: &str) -> Self {
        Self::new(code, false, true)
    }

    fn new(code: &str, is_base: bool, is_stackable: bool) -> Self {
        Self {
            code: code.to_string(),
            name: code.to_string(),
            is_base,
            is_stackable,
            is_active: true,
            is_public: true,
            grants: Vec::new(),
        }
    }

    /// Add a feature grant
    pub fn with_grant(mut self, feature_code: &str, limit: Option<u64>) -> Self {
        self.grants.push(PackageGrant {
            feature_code: feature_code.to_string(),
            limit,
        });
        self
    }

    /// Mark non-stackable (single active assignment per workspace)
    pub fn exclusive(mut self) -> Self {
        self.is_stackable = false;
        self
    }
}

/// Assignment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    /// Grants apply
    Active,
    /// Temporarily withheld, may be reactivated
    Suspended,
    /// Terminal; kept for the audit trail
    Cancelled,
}

/// Links a workspace to a package
///
/// Created on subscription, mutated on suspend/reactivate/cancel, never
/// physically deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageAssignment {
    /// Assignment identifier
    pub id: Uuid,
    /// Owning workspace
    pub workspace_id: WorkspaceId,
    /// Assigned package
    pub package_code: String,
    /// Lifecycle status
    pub status: AssignmentStatus,
    /// Grants apply from this instant
    pub starts_at: DateTime<Utc>,
    /// Grants stop applying at this instant, when set
    pub ends_at: Option<DateTime<Utc>>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp
    pub updated_at: DateTime<Utc>,
}

impl PackageAssignment {
    /// New active assignment starting now
    pub fn new(workspace_id: WorkspaceId, package_code: &str, starts_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            package_code: package_code.to_string(),
            status: AssignmentStatus::Active,
            starts_at,
            ends_at: None,
            created_at: starts_at,
            updated_at: starts_at,
        }
    }

    /// Whether the assignment grants anything at `now`
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == AssignmentStatus::Active
            && self.starts_at <= now
            && self.ends_at.map_or(true, |end| now < end)
    }
}

/// Boost semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoostKind {
    /// Turns a boolean feature on
    Enable,
    /// Adds quota headroom to a limit feature
    AddLimit,
    /// Removes all numeric limits for the feature
    Unlimited,
}

impl BoostKind {
    /// Wire string used in event payloads
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::AddLimit => "add_limit",
            Self::Unlimited => "unlimited",
        }
    }
}

/// How long a boost lasts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoostDuration {
    /// Never expires on its own
    Permanent,
    /// Expires once `now` passes the timestamp
    Until(DateTime<Utc>),
}

/// Boost lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoostStatus {
    /// Staged by an operator, not yet live
    Pending,
    /// Live (subject to read-time expiry)
    Active,
    /// Past its expiry timestamp; persisted by the sweep for reporting
    Expired,
    /// Revoked by an operator
    Cancelled,
    /// Fully consumed add-limit boost; skipped, never deleted
    Exhausted,
}

/// A direct, package-independent grant to one workspace for one feature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Boost {
    /// Boost identifier
    pub id: Uuid,
    /// Receiving workspace
    pub workspace_id: WorkspaceId,
    /// Target feature
    pub feature_code: String,
    /// Boost semantics
    pub kind: BoostKind,
    /// Lifetime
    pub duration: BoostDuration,
    /// Quota carried; only meaningful for add-limit boosts
    pub limit_value: Option<u64>,
    /// Running consumption counter; invariant `consumed <= limit_value`
    pub consumed: u64,
    /// Lifecycle status
    pub status: BoostStatus,
    /// Grant timestamp; drives FIFO consumption order
    pub granted_at: DateTime<Utc>,
}

impl Boost {
    /// Enable boost for a boolean feature
    pub fn enable(workspace_id: WorkspaceId, feature_code: &str) -> Self {
        Self::new(workspace_id, feature_code, BoostKind::Enable, None)
    }

    /// Add-limit boost carrying `limit_value` extra units
    pub fn add_limit(workspace_id: WorkspaceId, feature_code: &str, limit_value: u64) -> Self {
        Self::new(
            workspace_id,
            feature_code,
            BoostKind::AddLimit,
            Some(limit_value),
        )
    }

    /// Unlimited boost, dominates every numeric grant
    pub fn unlimited(workspace_id: WorkspaceId, feature_code: &str) -> Self {
        Self::new(workspace_id, feature_code, BoostKind::Unlimited, None)
    }

    fn new(
        workspace_id: WorkspaceId,
        feature_code: &str,
        kind: BoostKind,
        limit_value: Option<u64>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id,
            feature_code: feature_code.to_string(),
            kind,
            duration: BoostDuration::Permanent,
            limit_value,
            consumed: 0,
            status: BoostStatus::Active,
            granted_at: Utc::now(),
        }
    }

    /// Stage the boost instead of activating it immediately
    pub fn staged(mut self) -> Self {
        self.status = BoostStatus::Pending;
        self
    }

    /// Time-bound the boost
    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.duration = BoostDuration::Until(expires_at);
        self
    }

    /// Backdate the grant timestamp (FIFO ordering in tests and imports)
    pub fn granted_at(mut self, at: DateTime<Utc>) -> Self {
        self.granted_at = at;
        self
    }

    /// Expiry timestamp, if time-bounded
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self.duration {
            BoostDuration::Permanent => None,
            BoostDuration::Until(at) => Some(at),
        }
    }

    /// Read-time expiry: true once `now` passes `expires_at`
    ///
    /// The stored status is not consulted; a stale `Active` row must never
    /// grant access past expiry.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map_or(false, |at| now > at)
    }

    /// Unconsumed headroom (add-limit boosts only)
    pub fn headroom(&self) -> u64 {
        self.limit_value.unwrap_or(0).saturating_sub(self.consumed)
    }

    /// Whether the boost grants anything at `now`
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != BoostStatus::Active || self.is_expired_at(now) {
            return false;
        }
        match self.kind {
            BoostKind::AddLimit => self.headroom() > 0,
            _ => true,
        }
    }
}

/// Cumulative consumption for one (workspace, feature, period) cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Consuming workspace
    pub workspace_id: WorkspaceId,
    /// Accounted feature
    pub feature_code: String,
    /// Accounting period key
    pub period_key: String,
    /// Cumulative quantity consumed in the period
    pub used: u64,
    /// Last increment timestamp
    pub updated_at: DateTime<Utc>,
}

/// What a workspace holds for one feature, merged across sources
///
/// The merge operator is total and encodes the stacking policy in one place:
/// unlimited dominates everything, numeric limits sum, and a bare flag is the
/// neutral floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantValue {
    /// Entitled with no numeric quota (boolean features)
    Flag,
    /// Entitled up to a summed quota
    Limited(u64),
    /// Entitled without bound
    Unlimited,
}

impl GrantValue {
    /// Highest-privilege-wins merge
    pub fn merge(self, other: GrantValue) -> GrantValue {
        use GrantValue::*;
        match (self, other) {
            (Unlimited, _) | (_, Unlimited) => Unlimited,
            (Limited(a), Limited(b)) => Limited(a.saturating_add(b)),
            (Limited(a), Flag) | (Flag, Limited(a)) => Limited(a),
            (Flag, Flag) => Flag,
        }
    }
}
