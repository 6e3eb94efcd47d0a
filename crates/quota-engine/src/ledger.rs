//! Usage Ledger
//!
//! Two storage shapes, chosen per feature by its reset policy:
//!
//! - pre-aggregated atomic counters per (workspace, feature, period) cell for
//!   `none`/`monthly` features
//! - raw timestamped usage events with range sums for `rolling` features
//!
//! Counter updates are single atomic operations (fetch-add or a conditional
//! compare-and-swap), never a read followed by a write, so concurrent
//! recorders cannot lose updates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::WorkspaceId;

/// Counter cell address
type CounterKey = (WorkspaceId, String, String);

/// Event stream address
type StreamKey = (WorkspaceId, String);

/// One timestamped usage event (rolling-window features)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UsageStamp {
    /// When the usage happened
    pub at: DateTime<Utc>,
    /// Units consumed
    pub quantity: u64,
}

/// Ledger errors
#[derive(Debug, Error)]
pub enum LedgerError {
    /// A capped increment would push the cell past its cap
    #[error("increment of {requested} would exceed cap {cap} (current {current})")]
    CapExceeded {
        /// Cell value at the failed attempt
        current: u64,
        /// Quantity that was requested
        requested: u64,
        /// Hard cap for the cell
        cap: u64,
    },
}

/// Append/aggregate store of consumption per (workspace, feature, period)
pub struct UsageLedger {
    counters: DashMap<CounterKey, AtomicU64>,
    streams: RwLock<HashMap<StreamKey, Vec<UsageStamp>>>,
}

impl UsageLedger {
    /// Empty ledger
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            streams: RwLock::new(HashMap::new()),
        }
    }

    /// Current value of a counter cell, 0 when absent
    pub fn get(&self, workspace_id: WorkspaceId, feature_code: &str, period_key: &str) -> u64 {
        let key = (
            workspace_id,
            feature_code.to_string(),
            period_key.to_string(),
        );
        self.counters
            .get(&key)
            .map(|cell| cell.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Atomically add to a cell, creating it lazily; returns the new value
    pub fn increment(
        &self,
        workspace_id: WorkspaceId,
        feature_code: &str,
        period_key: &str,
        quantity: u64,
    ) -> u64 {
        let key = (
            workspace_id,
            feature_code.to_string(),
            period_key.to_string(),
        );
        let cell = self.counters.entry(key).or_insert_with(|| AtomicU64::new(0));
        cell.fetch_add(quantity, Ordering::SeqCst) + quantity
    }

    /// Atomically add to a cell only if the result stays within `cap`
    ///
    /// Single compare-and-swap; on contention the loop re-reads, and on a
    /// value that would cross the cap it fails without mutating.
    pub fn increment_capped(
        &self,
        workspace_id: WorkspaceId,
        feature_code: &str,
        period_key: &str,
        quantity: u64,
        cap: u64,
    ) -> Result<u64, LedgerError> {
        let key = (
            workspace_id,
            feature_code.to_string(),
            period_key.to_string(),
        );
        let cell = self.counters.entry(key).or_insert_with(|| AtomicU64::new(0));
        cell.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            current
                .checked_add(quantity)
                .filter(|next| *next <= cap)
        })
        .map(|previous| previous + quantity)
        .map_err(|current| LedgerError::CapExceeded {
            current,
            requested: quantity,
            cap,
        })
    }

    /// Zero a cell (operator action, e.g. a manual period reset)
    pub fn reset(&self, workspace_id: WorkspaceId, feature_code: &str, period_key: &str) {
        let key = (
            workspace_id,
            feature_code.to_string(),
            period_key.to_string(),
        );
        if let Some(cell) = self.counters.get(&key) {
            cell.store(0, Ordering::SeqCst);
        }
        tracing::info!(
            workspace_id = %workspace_id,
            feature = feature_code,
            period = period_key,
            "usage cell reset"
        );
    }

    /// Append a timestamped usage event (rolling-window features)
    pub fn record_event(
        &self,
        workspace_id: WorkspaceId,
        feature_code: &str,
        at: DateTime<Utc>,
        quantity: u64,
    ) {
        let mut streams = self.streams.write();
        streams
            .entry((workspace_id, feature_code.to_string()))
            .or_default()
            .push(UsageStamp { at, quantity });
    }

    /// Append an event only if the trailing-window sum stays within `cap`
    ///
    /// The sum and the append happen under one write-lock section, so two
    /// concurrent recorders cannot both slip under the cap.
    pub fn record_event_capped(
        &self,
        workspace_id: WorkspaceId,
        feature_code: &str,
        at: DateTime<Utc>,
        quantity: u64,
        window_start: DateTime<Utc>,
        cap: u64,
    ) -> Result<u64, LedgerError> {
        let mut streams = self.streams.write();
        let stream = streams
            .entry((workspace_id, feature_code.to_string()))
            .or_default();
        let current: u64 = stream
            .iter()
            .filter(|stamp| stamp.at >= window_start && stamp.at <= at)
            .map(|stamp| stamp.quantity)
            .sum();
        match current.checked_add(quantity) {
            Some(next) if next <= cap => {
                stream.push(UsageStamp { at, quantity });
                Ok(next)
            }
            _ => Err(LedgerError::CapExceeded {
                current,
                requested: quantity,
                cap,
            }),
        }
    }

    /// Sum of events within `[start, end]`
    pub fn range_sum(
        &self,
        workspace_id: WorkspaceId,
        feature_code: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> u64 {
        let streams = self.streams.read();
        streams
            .get(&(workspace_id, feature_code.to_string()))
            .map(|stream| {
                stream
                    .iter()
                    .filter(|stamp| stamp.at >= start && stamp.at <= end)
                    .map(|stamp| stamp.quantity)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Drop every event in one (workspace, feature) stream
    ///
    /// Operator action, the event-stream counterpart of [`reset`](Self::reset).
    /// Other streams are untouched.
    pub fn clear_stream(&self, workspace_id: WorkspaceId, feature_code: &str) -> usize {
        let mut streams = self.streams.write();
        let dropped = streams
            .remove(&(workspace_id, feature_code.to_string()))
            .map(|stream| stream.len())
            .unwrap_or(0);
        tracing::info!(
            workspace_id = %workspace_id,
            feature = feature_code,
            dropped,
            "usage stream cleared"
        );
        dropped
    }

    /// Drop events older than `cutoff` across all streams (retention maintenance)
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut streams = self.streams.write();
        let mut dropped = 0;
        for stream in streams.values_mut() {
            let before = stream.len();
            stream.retain(|stamp| stamp.at >= cutoff);
            dropped += before - stream.len();
        }
        dropped
    }
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    #[test]
    fn test_get_absent_cell_is_zero() {
        let ledger = UsageLedger::new();
        assert_eq!(ledger.get(Uuid::new_v4(), "bio.pages", "2026-08"), 0);
    }

    #[test]
    fn test_increment_accumulates() {
        let ledger = UsageLedger::new();
        let ws = Uuid::new_v4();

        assert_eq!(ledger.increment(ws, "bio.pages", "2026-08", 3), 3);
        assert_eq!(ledger.increment(ws, "bio.pages", "2026-08", 4), 7);
        assert_eq!(ledger.get(ws, "bio.pages", "2026-08"), 7);

        // Other periods are independent cells.
        assert_eq!(ledger.get(ws, "bio.pages", "2026-09"), 0);
    }

    #[test]
    fn test_increment_capped_refuses_crossing() {
        let ledger = UsageLedger::new();
        let ws = Uuid::new_v4();

        assert_eq!(
            ledger.increment_capped(ws, "bio.pages", "*", 8, 10).unwrap(),
            8
        );
        let err = ledger
            .increment_capped(ws, "bio.pages", "*", 3, 10)
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::CapExceeded {
                current: 8,
                requested: 3,
                cap: 10
            }
        ));
        // The failed attempt must not have mutated the cell.
        assert_eq!(ledger.get(ws, "bio.pages", "*"), 8);
    }

    #[test]
    fn test_reset_zeroes_cell() {
        let ledger = UsageLedger::new();
        let ws = Uuid::new_v4();

        ledger.increment(ws, "bio.pages", "2026-08", 9);
        ledger.reset(ws, "bio.pages", "2026-08");
        assert_eq!(ledger.get(ws, "bio.pages", "2026-08"), 0);
    }

    #[test]
    fn test_range_sum_over_events() {
        let ledger = UsageLedger::new();
        let ws = Uuid::new_v4();
        let now = Utc::now();

        ledger.record_event(ws, "exports", now - Duration::days(10), 5);
        ledger.record_event(ws, "exports", now - Duration::days(3), 2);
        ledger.record_event(ws, "exports", now - Duration::hours(1), 1);

        assert_eq!(ledger.range_sum(ws, "exports", now - Duration::days(7), now), 3);
        assert_eq!(
            ledger.range_sum(ws, "exports", now - Duration::days(30), now),
            8
        );
    }

    #[test]
    fn test_clear_stream_leaves_other_streams_alone() {
        let ledger = UsageLedger::new();
        let ws1 = Uuid::new_v4();
        let ws2 = Uuid::new_v4();
        let now = Utc::now();

        ledger.record_event(ws1, "exports", now, 3);
        ledger.record_event(ws2, "exports", now, 4);

        assert_eq!(ledger.clear_stream(ws1, "exports"), 1);
        assert_eq!(
            ledger.range_sum(ws1, "exports", now - Duration::days(1), now),
            0
        );
        assert_eq!(
            ledger.range_sum(ws2, "exports", now - Duration::days(1), now),
            4
        );
    }

    #[test]
    fn test_prune_drops_old_events() {
        let ledger = UsageLedger::new();
        let ws = Uuid::new_v4();
        let now = Utc::now();

        ledger.record_event(ws, "exports", now - Duration::days(60), 5);
        ledger.record_event(ws, "exports", now - Duration::days(1), 2);

        assert_eq!(ledger.prune_before(now - Duration::days(30)), 1);
        assert_eq!(
            ledger.range_sum(ws, "exports", now - Duration::days(90), now),
            2
        );
    }

    #[test]
    fn test_concurrent_capped_increments_never_overshoot() {
        use std::sync::Arc;

        let ledger = Arc::new(UsageLedger::new());
        let ws = Uuid::new_v4();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    let mut wins = 0;
                    for _ in 0..100 {
                        if ledger.increment_capped(ws, "bio.pages", "*", 1, 50).is_ok() {
                            wins += 1;
                        }
                    }
                    wins
                })
            })
            .collect();

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(ledger.get(ws, "bio.pages", "*"), 50);
    }
}
