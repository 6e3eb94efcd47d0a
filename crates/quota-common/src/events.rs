//! Domain Events - Record significant occurrences in the engine
//!
//! Events are:
//! - Immutable records of past occurrences
//! - Named in past tense
//! - Emitted at the boundary to downstream consumers (webhook delivery,
//!   analytics); delivery and retry are entirely the receiver's concern

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Base event metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Unique event ID
    pub event_id: Uuid,
    /// Emission timestamp
    pub timestamp: DateTime<Utc>,
    /// Workspace the event concerns
    pub workspace_id: Uuid,
}

impl EventMetadata {
    /// Metadata stamped with a fresh id and the current time
    pub fn new(workspace_id: Uuid) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            workspace_id,
        }
    }
}

/// Domain event trait
pub trait DomainEvent: Send + Sync {
    /// Dotted event-type string, e.g. `boost.granted`
    fn event_type(&self) -> &'static str;
    /// Shared metadata
    fn metadata(&self) -> &EventMetadata;
}

// === Boost events ===

/// A boost was granted to a workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostGranted {
    /// Event metadata
    pub metadata: EventMetadata,
    /// Boost identifier
    pub boost_id: Uuid,
    /// Target feature
    pub feature_code: String,
    /// Boost kind as a string (`enable`, `add_limit`, `unlimited`)
    pub kind: String,
    /// Quota added, for add-limit boosts
    pub limit_value: Option<u64>,
}

impl DomainEvent for BoostGranted {
    fn event_type(&self) -> &'static str {
        "boost.granted"
    }
    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// A boost passed its expiry timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostExpired {
    /// Event metadata
    pub metadata: EventMetadata,
    /// Boost identifier
    pub boost_id: Uuid,
    /// Target feature
    pub feature_code: String,
}

impl DomainEvent for BoostExpired {
    fn event_type(&self) -> &'static str {
        "boost.expired"
    }
    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// An add-limit boost was fully consumed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoostExhausted {
    /// Event metadata
    pub metadata: EventMetadata,
    /// Boost identifier
    pub boost_id: Uuid,
    /// Target feature
    pub feature_code: String,
    /// The quota the boost carried
    pub limit_value: u64,
}

impl DomainEvent for BoostExhausted {
    fn event_type(&self) -> &'static str {
        "boost.exhausted"
    }
    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

// === Package events ===

/// A package was assigned to a workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageAssigned {
    /// Event metadata
    pub metadata: EventMetadata,
    /// Assignment identifier
    pub assignment_id: Uuid,
    /// Package code
    pub package_code: String,
}

impl DomainEvent for PackageAssigned {
    fn event_type(&self) -> &'static str {
        "package.assigned"
    }
    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

/// A package assignment was cancelled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageCancelled {
    /// Event metadata
    pub metadata: EventMetadata,
    /// Assignment identifier
    pub assignment_id: Uuid,
    /// Package code
    pub package_code: String,
}

impl DomainEvent for PackageCancelled {
    fn event_type(&self) -> &'static str {
        "package.cancelled"
    }
    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

// === Quota events ===

/// Recorded usage reached the effective limit for a feature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaLimitReached {
    /// Event metadata
    pub metadata: EventMetadata,
    /// Feature whose quota filled up
    pub feature_code: String,
    /// Effective limit at the time of the crossing
    pub limit: u64,
    /// Usage after the crossing increment
    pub used: u64,
}

impl DomainEvent for QuotaLimitReached {
    fn event_type(&self) -> &'static str {
        "quota.limit_reached"
    }
    fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }
}

// === Sinks ===

/// Receiver for engine events
///
/// The engine only emits; whatever sits behind the sink owns delivery.
pub trait EventSink: Send + Sync {
    /// Accept one event
    fn emit(&self, event: Box<dyn DomainEvent>);
}

/// In-memory sink, used as the default buffer and as a test double
pub struct EventBuffer {
    events: RwLock<Vec<Box<dyn DomainEvent>>>,
}

impl EventBuffer {
    /// Empty buffer
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }

    /// Number of buffered events
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// True when nothing has been emitted
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Event-type strings in emission order
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.read().iter().map(|e| e.event_type()).collect()
    }

    /// Run a closure over each buffered event
    pub fn for_each(&self, mut f: impl FnMut(&dyn DomainEvent)) {
        for event in self.events.read().iter() {
            f(event.as_ref());
        }
    }

    /// Drop all buffered events
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl Default for EventBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBuffer {
    fn emit(&self, event: Box<dyn DomainEvent>) {
        self.events.write().push(event);
    }
}

/// Sink that discards everything
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Box<dyn DomainEvent>) {}
}
