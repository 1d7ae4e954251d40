//! Leakage-free rolling windows over daily outcome counts.
//!
//! Events are pre-aggregated to one row per `(partition, day)`, turned into
//! a per-partition running sum sorted by day, and then probed twice per
//! target: once at `as_of - 1` (right edge) and once at `as_of - w` (left
//! edge). The difference covers strictly prior days only, so nothing from
//! the target's own day or later can leak into its history.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CumulativeRow<const N: usize> {
    day: NaiveDate,
    totals: [i64; N],
}

/// Per-partition prefix sums of `N` tracked quantities, one row per day.
#[derive(Debug, Clone)]
pub struct CumulativeTable<K, const N: usize> {
    partitions: HashMap<K, Vec<CumulativeRow<N>>>,
}

/// Counts inside one `(as_of - w, as_of - 1]` window plus probe outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowedCounts<const N: usize> {
    pub counts: [i64; N],
    pub right_missing: bool,
    pub left_missing: bool,
}

impl<const N: usize> WindowedCounts<N> {
    fn empty() -> Self {
        Self {
            counts: [0; N],
            right_missing: true,
            left_missing: true,
        }
    }

    /// True whenever the window is not backed by a full history on both edges.
    pub fn no_history(&self) -> bool {
        self.right_missing || self.left_missing
    }
}

impl<K, const N: usize> CumulativeTable<K, N>
where
    K: Eq + Hash,
{
    /// Events with no day are left out; they cannot be placed on the timeline.
    pub fn build<I>(events: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<NaiveDate>, [i64; N])>,
    {
        let mut daily: HashMap<K, BTreeMap<NaiveDate, [i64; N]>> = HashMap::new();
        for (key, day, values) in events {
            let Some(day) = day else {
                continue;
            };
            let slot = daily.entry(key).or_default().entry(day).or_insert([0; N]);
            for (acc, value) in slot.iter_mut().zip(values) {
                *acc += value;
            }
        }

        let partitions = daily
            .into_iter()
            .map(|(key, days)| {
                let mut running = [0i64; N];
                let rows = days
                    .into_iter()
                    .map(|(day, values)| {
                        for (acc, value) in running.iter_mut().zip(values) {
                            *acc += value;
                        }
                        CumulativeRow {
                            day,
                            totals: running,
                        }
                    })
                    .collect();
                (key, rows)
            })
            .collect();

        Self { partitions }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Running totals of the latest row with `day <= cutoff`.
    pub fn probe(&self, key: &K, cutoff: NaiveDate) -> Option<[i64; N]> {
        let rows = self.partitions.get(key)?;
        let idx = rows.partition_point(|row| row.day <= cutoff);
        idx.checked_sub(1).map(|i| rows[i].totals)
    }

    /// Counts over days in `(as_of - w, as_of - 1]`, i.e. the difference
    /// between the probes at `as_of - 1` and `as_of - w`. An unknown
    /// `as_of` behaves as if both probes missed.
    pub fn window(&self, key: &K, as_of: Option<NaiveDate>, w: u32) -> WindowedCounts<N> {
        let Some(as_of) = as_of else {
            return WindowedCounts::empty();
        };

        let right = days_before(as_of, 1).and_then(|cutoff| self.probe(key, cutoff));
        let left = days_before(as_of, w).and_then(|cutoff| self.probe(key, cutoff));

        let right_totals = right.unwrap_or([0; N]);
        let left_totals = left.unwrap_or([0; N]);
        let mut counts = [0i64; N];
        for (i, slot) in counts.iter_mut().enumerate() {
            *slot = right_totals[i] - left_totals[i];
        }

        WindowedCounts {
            counts,
            right_missing: right.is_none(),
            left_missing: left.is_none(),
        }
    }
}

fn days_before(day: NaiveDate, n: u32) -> Option<NaiveDate> {
    day.checked_sub_days(Days::new(u64::from(n)))
}

/// Rounds half away from zero to three decimals.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// `numerator / denominator` rounded to three decimals; 0.0 for an empty window.
pub fn rate(numerator: i64, denominator: i64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        round3(numerator as f64 / denominator as f64)
    }
}

/// Historical receipt outcome rates for one lookback window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRates {
    pub lookback_days: u32,
    pub no_history: bool,
    pub rate_invalid: f64,
    pub rate_fh_redeem: f64,
    pub rate_st_redeem: f64,
}

/// Invalid/fh/st outcome counting over labelled receipts, shared by the
/// segment and user instantiations.
pub(crate) mod outcomes {
    use super::*;
    use crate::model::LabelRecord;

    pub const INVALID: usize = 0;
    pub const FH: usize = 1;
    pub const ST: usize = 2;
    pub const VOLUME: usize = 3;
    pub const WIDTH: usize = 4;

    pub fn values(record: &LabelRecord) -> [i64; WIDTH] {
        let mut values = [0i64; WIDTH];
        values[INVALID] = i64::from(record.label_invalid());
        values[FH] = i64::from(record.label_same_user_fh);
        values[ST] = i64::from(record.label_same_user_st);
        values[VOLUME] = 1;
        values
    }

    pub fn table<K, F>(records: &[LabelRecord], key_of: F) -> CumulativeTable<K, WIDTH>
    where
        K: Eq + Hash,
        F: Fn(&LabelRecord) -> K,
    {
        CumulativeTable::build(
            records
                .iter()
                .map(|record| (key_of(record), record.receive_date, values(record))),
        )
    }

    pub fn rates(lookback_days: u32, window: &WindowedCounts<WIDTH>) -> OutcomeRates {
        let volume = window.counts[VOLUME];
        OutcomeRates {
            lookback_days,
            no_history: window.no_history(),
            rate_invalid: rate(window.counts[INVALID], volume),
            rate_fh_redeem: rate(window.counts[FH], volume),
            rate_st_redeem: rate(window.counts[ST], volume),
        }
    }
}
