//! Bandwidth rules and the rolling usage tracker that gates maintenance work.
//!
//! The tracker keeps one bucket list per (dimension, granularity). A window is
//! answered from the coarsest granularity fine enough to cover it, so every
//! query scans a bounded number of buckets.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// What a rule counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    /// Weighted job completions
    Requests,
    /// Bytes of file data touched
    Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Granularity {
    Second,
    Minute,
    Hour,
    Day,
    Month,
}

impl Granularity {
    const ALL: [Granularity; 5] = [
        Granularity::Second,
        Granularity::Minute,
        Granularity::Hour,
        Granularity::Day,
        Granularity::Month,
    ];

    const fn seconds(self) -> u64 {
        match self {
            Granularity::Second => 1,
            Granularity::Minute => 60,
            Granularity::Hour => 3_600,
            Granularity::Day => 86_400,
            Granularity::Month => 30 * 86_400,
        }
    }

    /// How far back buckets of this size are kept.
    const fn retention(self) -> u64 {
        match self {
            Granularity::Second => 2 * 60,
            Granularity::Minute => 2 * 3_600,
            Granularity::Hour => 2 * 86_400,
            Granularity::Day => 62 * 86_400,
            Granularity::Month => 24 * 30 * 86_400,
        }
    }

    fn for_window(window: u64) -> Granularity {
        Self::ALL
            .into_iter()
            .find(|g| window <= g.retention())
            .unwrap_or(Granularity::Month)
    }
}

/// One (dimension, rolling window, ceiling) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthRule {
    pub dimension: Dimension,
    pub window: Duration,
    pub ceiling: u64,
}

/// A set of rules; work may start only while every rule has headroom.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BandwidthRules {
    rules: Vec<BandwidthRule>,
}

impl BandwidthRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rule(mut self, dimension: Dimension, window: Duration, ceiling: u64) -> Self {
        self.rules.push(BandwidthRule {
            dimension,
            window,
            ceiling,
        });
        self
    }

    pub fn rules(&self) -> &[BandwidthRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// True if one more unit of work fits under every rule.
    pub fn can_start(&self, tracker: &BandwidthTracker, now: u64) -> bool {
        self.rules.iter().all(|rule| {
            tracker.usage_at(rule.dimension, rule.window, now) < rule.ceiling
        })
    }
}

/// Rolling usage counters.
#[derive(Debug, Default)]
pub struct BandwidthTracker {
    buckets: HashMap<(Dimension, Granularity), VecDeque<(u64, u64)>>,
    lifetime: HashMap<Dimension, u64>,
}

impl BandwidthTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed unit of work now.
    pub fn report_work(&mut self, requests: u64, bytes: u64) {
        self.report_work_at(requests, bytes, unix_now());
    }

    pub fn report_work_at(&mut self, requests: u64, bytes: u64, now: u64) {
        self.report(Dimension::Requests, requests, now);
        self.report(Dimension::Bytes, bytes, now);
    }

    fn report(&mut self, dimension: Dimension, amount: u64, now: u64) {
        if amount == 0 {
            return;
        }
        *self.lifetime.entry(dimension).or_default() += amount;

        for granularity in Granularity::ALL {
            let bucket_start = now - now % granularity.seconds();
            let list = self.buckets.entry((dimension, granularity)).or_default();

            match list.back_mut() {
                Some((start, total)) if *start == bucket_start => *total += amount,
                _ => list.push_back((bucket_start, amount)),
            }

            let horizon = now.saturating_sub(granularity.retention());
            while list.front().is_some_and(|(start, _)| start + granularity.seconds() <= horizon) {
                list.pop_front();
            }
        }
    }

    /// Usage over the trailing `window` ending at `now`.
    ///
    /// Buckets that straddle the window start count in full, so the answer
    /// errs on the side of throttling.
    pub fn usage_at(&self, dimension: Dimension, window: Duration, now: u64) -> u64 {
        let window = window.as_secs().max(1);
        let granularity = Granularity::for_window(window);
        let since = now.saturating_sub(window);

        self.buckets
            .get(&(dimension, granularity))
            .map(|list| {
                list.iter()
                    .rev()
                    .take_while(|(start, _)| start + granularity.seconds() > since)
                    .filter(|(start, _)| *start <= now)
                    .map(|(_, amount)| amount)
                    .sum()
            })
            .unwrap_or(0)
    }

    pub fn usage(&self, dimension: Dimension, window: Duration) -> u64 {
        self.usage_at(dimension, window, unix_now())
    }

    pub fn lifetime(&self, dimension: Dimension) -> u64 {
        self.lifetime.get(&dimension).copied().unwrap_or(0)
    }
}

/// Seconds since the unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: u64 = 1_700_000_000;

    #[test]
    fn test_usage_rolls_off() {
        let mut tracker = BandwidthTracker::new();
        tracker.report_work_at(10, 0, T0);
        tracker.report_work_at(5, 0, T0 + 3);

        let window = Duration::from_secs(5);
        assert_eq!(tracker.usage_at(Dimension::Requests, window, T0 + 3), 15);
        assert_eq!(tracker.usage_at(Dimension::Requests, window, T0 + 6), 5);
        assert_eq!(tracker.usage_at(Dimension::Requests, window, T0 + 20), 0);
        assert_eq!(tracker.lifetime(Dimension::Requests), 15);
    }

    #[test]
    fn test_long_windows_use_coarse_buckets() {
        let mut tracker = BandwidthTracker::new();
        tracker.report_work_at(0, 1_000, T0);
        tracker.report_work_at(0, 2_000, T0 + 3 * 86_400);

        let day = Duration::from_secs(86_400);
        let week = Duration::from_secs(7 * 86_400);
        assert_eq!(tracker.usage_at(Dimension::Bytes, day, T0 + 3 * 86_400), 2_000);
        assert_eq!(tracker.usage_at(Dimension::Bytes, week, T0 + 3 * 86_400), 3_000);
    }

    #[test]
    fn test_rules_gate_on_every_rule() {
        let rules = BandwidthRules::new()
            .with_rule(Dimension::Requests, Duration::from_secs(10), 100)
            .with_rule(Dimension::Bytes, Duration::from_secs(3_600), 1_000);

        let mut tracker = BandwidthTracker::new();
        assert!(rules.can_start(&tracker, T0));

        tracker.report_work_at(50, 999, T0);
        assert!(rules.can_start(&tracker, T0));

        tracker.report_work_at(0, 1, T0);
        assert!(!rules.can_start(&tracker, T0));

        tracker.report_work_at(60, 0, T0 + 7_200);
        assert!(rules.can_start(&tracker, T0 + 7_200));
        tracker.report_work_at(40, 0, T0 + 7_201);
        assert!(!rules.can_start(&tracker, T0 + 7_201));
    }

    #[test]
    fn test_empty_rules_always_admit() {
        let mut tracker = BandwidthTracker::new();
        tracker.report_work_at(u32::MAX as u64, u32::MAX as u64, T0);
        assert!(BandwidthRules::new().can_start(&tracker, T0));
    }
}
