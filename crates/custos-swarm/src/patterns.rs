//! Per-counterparty pattern counters over a sliding window

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use custos_core::CarrierId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

/// Pattern being counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pattern {
    /// Incidents, failovers away from, disputes lost
    RepeatedFailure,
    /// Evidence contradicting the counterparty's claims
    SuspectedFraud,
}

impl Pattern {
    /// Stable tag
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RepeatedFailure => "repeated_failure",
            Self::SuspectedFraud => "suspected_fraud",
        }
    }
}

/// Sliding-window counters
#[derive(Debug, Clone)]
pub struct PatternTracker {
    window: ChronoDuration,
    hits: BTreeMap<(CarrierId, Pattern), VecDeque<DateTime<Utc>>>,
    blacklisted: BTreeSet<CarrierId>,
}

impl PatternTracker {
    /// Create new tracker over `window`
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window: ChronoDuration::from_std(window).unwrap_or(ChronoDuration::MAX),
            hits: BTreeMap::new(),
            blacklisted: BTreeSet::new(),
        }
    }

    /// Record one hit at `at` and return the count inside the window ending at `at`
    pub fn record(&mut self, counterparty: &CarrierId, pattern: Pattern, at: DateTime<Utc>) -> usize {
        let cutoff = at - self.window;
        let hits = self
            .hits
            .entry((counterparty.clone(), pattern))
            .or_default();
        let position = hits.partition_point(|t| *t <= at);
        hits.insert(position, at);
        while hits.front().is_some_and(|t| *t <= cutoff) {
            hits.pop_front();
        }
        hits.len()
    }

    /// Hits inside the window ending at `now`
    #[must_use]
    pub fn count(&self, counterparty: &CarrierId, pattern: Pattern, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.window;
        self.hits
            .get(&(counterparty.clone(), pattern))
            .map_or(0, |hits| hits.iter().filter(|t| **t > cutoff && **t <= now).count())
    }

    /// Mark a counterparty blacklisted; `false` if it already was
    pub fn mark_blacklisted(&mut self, counterparty: &CarrierId) -> bool {
        self.blacklisted.insert(counterparty.clone())
    }

    /// Withdraw a mark whose containment never happened; `false` if it was not set
    pub fn unmark_blacklisted(&mut self, counterparty: &CarrierId) -> bool {
        self.blacklisted.remove(counterparty)
    }

    #[must_use]
    pub fn is_blacklisted(&self, counterparty: &CarrierId) -> bool {
        self.blacklisted.contains(counterparty)
    }

    /// Blacklisted counterparties, ordered
    #[must_use]
    pub fn blacklisted(&self) -> Vec<CarrierId> {
        self.blacklisted.iter().cloned().collect()
    }

    /// Current counts for every tracked counterparty
    #[must_use]
    pub fn snapshot(&self, pattern: Pattern, now: DateTime<Utc>) -> BTreeMap<CarrierId, usize> {
        self.hits
            .keys()
            .filter(|(_, p)| *p == pattern)
            .map(|(carrier, _)| (carrier.clone(), self.count(carrier, pattern, now)))
            .filter(|(_, count)| *count > 0)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 0, 0, 0).unwrap()
    }

    #[test]
    fn old_hits_fall_out_of_the_window() {
        let mut tracker = PatternTracker::new(Duration::from_secs(24 * 3600));
        let brt = CarrierId::new("BRT");
        assert_eq!(tracker.record(&brt, Pattern::RepeatedFailure, t0()), 1);
        assert_eq!(
            tracker.record(&brt, Pattern::RepeatedFailure, t0() + ChronoDuration::hours(23)),
            2
        );
        assert_eq!(
            tracker.record(&brt, Pattern::RepeatedFailure, t0() + ChronoDuration::hours(25)),
            2
        );
        assert_eq!(tracker.count(&brt, Pattern::SuspectedFraud, t0()), 0);
    }

    #[test]
    fn blacklist_marks_once() {
        let mut tracker = PatternTracker::new(Duration::from_secs(60));
        let brt = CarrierId::new("BRT");
        assert!(tracker.mark_blacklisted(&brt));
        assert!(!tracker.mark_blacklisted(&brt));
        assert_eq!(tracker.blacklisted(), vec![brt.clone()]);
        assert!(tracker.unmark_blacklisted(&brt));
        assert!(!tracker.is_blacklisted(&brt));
        assert!(tracker.mark_blacklisted(&brt));
    }

    proptest! {
        #[test]
        fn in_order_count_matches_the_window(mut offsets in proptest::collection::vec(0i64..600, 1..40)) {
            offsets.sort_unstable();
            let mut tracker = PatternTracker::new(Duration::from_secs(60));
            let sda = CarrierId::new("SDA");
            for (i, offset) in offsets.iter().enumerate() {
                let counted = tracker.record(&sda, Pattern::SuspectedFraud, t0() + ChronoDuration::seconds(*offset));
                let expected = offsets[..=i].iter().filter(|o| **o > offset - 60).count();
                prop_assert_eq!(counted, expected);
            }
        }
    }
}
