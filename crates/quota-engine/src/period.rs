//! Quota Period Calculator
//!
//! Pure mapping from (reset policy, now) to the current accounting period.
//! Monthly buckets are calendar months in UTC; rolling policies are true
//! sliding windows and never key a counter cell (their usage is range-summed
//! over timestamped events instead).

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ResetPolicy;

/// Period key for features that never reset
pub const ALL_TIME_KEY: &str = "*";

/// One accounting window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    /// Ledger bucket key (`*`, `YYYY-MM`, or a rolling label)
    pub key: String,
    /// Inclusive window start
    pub start: DateTime<Utc>,
    /// Exclusive window end
    pub end: DateTime<Utc>,
}

/// Current accounting period for a reset policy at `now`
pub fn current_period(policy: ResetPolicy, now: DateTime<Utc>) -> Period {
    match policy {
        ResetPolicy::None => Period {
            key: ALL_TIME_KEY.to_string(),
            start: DateTime::<Utc>::MIN_UTC,
            end: DateTime::<Utc>::MAX_UTC,
        },
        ResetPolicy::Monthly => {
            let start = Utc
                .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
                .unwrap();
            let (end_year, end_month) = if now.month() == 12 {
                (now.year() + 1, 1)
            } else {
                (now.year(), now.month() + 1)
            };
            let end = Utc.with_ymd_and_hms(end_year, end_month, 1, 0, 0, 0).unwrap();
            Period {
                key: now.format("%Y-%m").to_string(),
                start,
                end,
            }
        }
        ResetPolicy::Rolling { window_days } => Period {
            key: format!("rolling:{}d", window_days),
            start: now - Duration::days(i64::from(window_days)),
            end: now,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_a_single_all_time_bucket() {
        let period = current_period(ResetPolicy::None, Utc::now());
        assert_eq!(period.key, "*");
        assert!(period.start < period.end);
    }

    #[test]
    fn test_monthly_key_is_idempotent_within_a_month() {
        let t1 = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 8, 31, 23, 59, 59).unwrap();
        assert_eq!(
            current_period(ResetPolicy::Monthly, t1),
            current_period(ResetPolicy::Monthly, t2)
        );
    }

    #[test]
    fn test_monthly_boundaries() {
        let now = Utc.with_ymd_and_hms(2026, 8, 15, 12, 0, 0).unwrap();
        let period = current_period(ResetPolicy::Monthly, now);

        assert_eq!(period.key, "2026-08");
        assert_eq!(period.start, Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap());
        assert_eq!(period.end, Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_monthly_december_rolls_into_next_year() {
        let now = Utc.with_ymd_and_hms(2026, 12, 20, 0, 0, 0).unwrap();
        let period = current_period(ResetPolicy::Monthly, now);

        assert_eq!(period.key, "2026-12");
        assert_eq!(period.end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    mod period_props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn monthly_key_is_stable_within_a_month(
                year in 2020i32..2100,
                month in 1u32..=12,
                day_a in 1u32..=28,
                day_b in 1u32..=28,
                hour in 0u32..24,
            ) {
                let a = Utc.with_ymd_and_hms(year, month, day_a, hour, 0, 0).unwrap();
                let b = Utc.with_ymd_and_hms(year, month, day_b, 23, 59, 59).unwrap();
                prop_assert_eq!(
                    current_period(ResetPolicy::Monthly, a),
                    current_period(ResetPolicy::Monthly, b)
                );
            }

            #[test]
            fn rolling_window_length_is_exact(days in 1u32..365) {
                let now = Utc::now();
                let period = current_period(ResetPolicy::Rolling { window_days: days }, now);
                prop_assert_eq!(period.end - period.start, Duration::days(i64::from(days)));
            }
        }
    }

    #[test]
    fn test_rolling_window_slides_with_now() {
        let now = Utc.with_ymd_and_hms(2026, 8, 15, 12, 0, 0).unwrap();
        let period = current_period(ResetPolicy::Rolling { window_days: 7 }, now);

        assert_eq!(period.key, "rolling:7d");
        assert_eq!(period.end, now);
        assert_eq!(period.start, now - Duration::days(7));

        let later = now + Duration::hours(6);
        let shifted = current_period(ResetPolicy::Rolling { window_days: 7 }, later);
        assert_eq!(shifted.start, later - Duration::days(7));
    }
}
