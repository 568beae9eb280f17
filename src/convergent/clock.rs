//! Causal ordering via vector clocks
//!
//! A VectorClock records, per device, how many operations from that device
//! its holder had absorbed. Comparing two clocks tells us whether one
//! operation "happened before" another or whether they were concurrent
//! (neither author knew about the other's edit).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use super::device::DeviceId;
use crate::error::SyncError;

/// How two clocks relate under the causal partial order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CausalOrder {
    Before,
    After,
    Equal,
    Concurrent,
}

/// Per-device logical clock.
///
/// Devices absent from the map read as 0, so `{A:0}` and `{}` are equal.
/// Clock values are never mutated in place by the public API: increments
/// and merges return a new clock.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<DeviceId, u64>,
}

impl VectorClock {
    /// Create an empty clock (knows nothing)
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a clock for a device at session start
    pub fn for_device(device: &DeviceId) -> Self {
        Self::seeded([device])
    }

    /// Create a clock with every known device at 0
    pub fn seeded<'a>(devices: impl IntoIterator<Item = &'a DeviceId>) -> Self {
        Self {
            counters: devices.into_iter().map(|d| (d.clone(), 0)).collect(),
        }
    }

    /// Build a clock from raw (device, counter) pairs, as decoded from an
    /// untyped source.
    pub fn from_map<K, I>(entries: I) -> Result<Self, SyncError>
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, i64)>,
    {
        let mut counters = BTreeMap::new();
        for (device, counter) in entries {
            let device = DeviceId::new(device.as_ref())
                .map_err(|e| SyncError::InvalidClock(e.to_string()))?;
            if counter < 0 {
                return Err(SyncError::InvalidClock(format!(
                    "counter for {} is negative ({})",
                    device, counter
                )));
            }
            counters.insert(device, counter as u64);
        }
        Ok(Self { counters })
    }

    /// Counter for a device (0 if never seen)
    pub fn get(&self, device: &DeviceId) -> u64 {
        self.counters.get(device).copied().unwrap_or(0)
    }

    /// Return a new clock with `device` advanced by one
    pub fn increment_for_device(&self, device: &DeviceId) -> Result<Self, SyncError> {
        let next = self.get(device).checked_add(1).ok_or_else(|| {
            SyncError::InvalidClock(format!("counter overflow for device {}", device))
        })?;
        let mut clock = self.clone();
        clock.counters.insert(device.clone(), next);
        Ok(clock)
    }

    /// Componentwise maximum of both clocks
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut merged = self.clone();
        for (device, &counter) in &other.counters {
            let entry = merged.counters.entry(device.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
        merged
    }

    pub fn compare(&self, other: &VectorClock) -> CausalOrder {
        let mut less = false;
        let mut greater = false;
        for device in self.counters.keys().chain(other.counters.keys()) {
            match self.get(device).cmp(&other.get(device)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
            if less && greater {
                return CausalOrder::Concurrent;
            }
        }
        match (less, greater) {
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (false, false) => CausalOrder::Equal,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    pub fn happens_before(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Before
    }

    pub fn happens_after(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::After
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == CausalOrder::Concurrent
    }

    /// Check if this clock has absorbed everything `other` has
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), CausalOrder::After | CausalOrder::Equal)
    }

    /// Get all devices this clock knows about
    pub fn devices(&self) -> impl Iterator<Item = &DeviceId> {
        self.counters.keys()
    }

    /// Iterate (device, counter) pairs in device order
    pub fn entries(&self) -> impl Iterator<Item = (&DeviceId, u64)> {
        self.counters.iter().map(|(d, c)| (d, *c))
    }

    /// Sum of all counters; a rough measure of how much history a clock has seen
    pub fn total(&self) -> u64 {
        self.counters.values().sum()
    }
}

impl PartialEq for VectorClock {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == CausalOrder::Equal
    }
}

impl Eq for VectorClock {}

impl Hash for VectorClock {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Zero entries are skipped to stay consistent with PartialEq
        for (device, counter) in self.counters.iter().filter(|(_, c)| **c > 0) {
            device.hash(state);
            counter.hash(state);
        }
    }
}

/// A (device, wall-clock hint, clock) triple used for audit and
/// tie-breaking. Correctness never depends on the wall-clock part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalTimestamp {
    pub device: DeviceId,
    /// Milliseconds since the Unix epoch, as reported by the device
    pub wall_clock: i64,
    pub clock: VectorClock,
}

impl LogicalTimestamp {
    pub fn new(device: DeviceId, wall_clock: i64, clock: VectorClock) -> Self {
        Self {
            device,
            wall_clock,
            clock,
        }
    }

    /// Stamp with the current wall clock
    pub fn now(device: DeviceId, clock: VectorClock) -> Self {
        Self::new(device, chrono::Utc::now().timestamp_millis(), clock)
    }

    /// Deterministic total order matching the operation order: causal
    /// order first, then device id. The wall clock only separates stamps
    /// that agree on both.
    pub fn total_cmp(&self, other: &LogicalTimestamp) -> Ordering {
        match self.clock.compare(&other.clock) {
            CausalOrder::Before => Ordering::Less,
            CausalOrder::After => Ordering::Greater,
            CausalOrder::Equal | CausalOrder::Concurrent => self
                .device
                .cmp(&other.device)
                .then_with(|| self.wall_clock.cmp(&other.wall_clock)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(id: &str) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    fn clock(entries: &[(&str, i64)]) -> VectorClock {
        VectorClock::from_map(entries.iter().copied()).unwrap()
    }

    #[test]
    fn test_for_device_starts_at_zero() {
        let c = VectorClock::for_device(&dev("A"));
        assert_eq!(c.get(&dev("A")), 0);
        assert_eq!(c.devices().count(), 1);
        assert_eq!(c, VectorClock::new());
    }

    #[test]
    fn test_increment_is_monotonic_and_local() {
        let base = clock(&[("A", 3), ("B", 7)]);
        for d in ["A", "B", "C"] {
            let next = base.increment_for_device(&dev(d)).unwrap();
            assert_eq!(next.get(&dev(d)), base.get(&dev(d)) + 1);
            for other in ["A", "B", "C"].iter().filter(|o| **o != d) {
                assert_eq!(next.get(&dev(other)), base.get(&dev(other)));
            }
            assert!(next.happens_after(&base));
        }
        // The input clock is untouched
        assert_eq!(base.get(&dev("A")), 3);
    }

    #[test]
    fn test_increment_overflow_is_reported() {
        let mut c = VectorClock::new();
        c.counters.insert(dev("A"), u64::MAX);
        assert!(matches!(
            c.increment_for_device(&dev("A")),
            Err(SyncError::InvalidClock(_))
        ));
    }

    #[test]
    fn test_from_map_rejects_negative_and_bad_devices() {
        assert!(matches!(
            VectorClock::from_map([("A", -1)]),
            Err(SyncError::InvalidClock(_))
        ));
        assert!(matches!(
            VectorClock::from_map([("not valid", 1)]),
            Err(SyncError::InvalidClock(_))
        ));
    }

    #[test]
    fn test_relations() {
        let a = clock(&[("A", 1)]);
        let b = clock(&[("A", 0), ("B", 1)]);
        let ab = clock(&[("A", 1), ("B", 1)]);

        assert!(a.is_concurrent_with(&b));
        assert!(b.is_concurrent_with(&a));
        assert!(a.happens_before(&ab));
        assert!(ab.happens_after(&b));
        assert!(!ab.is_concurrent_with(&a));
        assert_eq!(a.merge(&b), ab);
    }

    #[test]
    fn test_exactly_one_relation_holds() {
        let samples = [
            clock(&[]),
            clock(&[("A", 1)]),
            clock(&[("A", 0), ("B", 0)]),
            clock(&[("A", 2), ("B", 1)]),
            clock(&[("B", 3)]),
            clock(&[("A", 1), ("C", 1)]),
            clock(&[("A", 2), ("B", 3), ("C", 1)]),
        ];
        for x in &samples {
            for y in &samples {
                let holds = [
                    x.happens_before(y),
                    x.happens_after(y),
                    x.is_concurrent_with(y),
                    x == y,
                ];
                assert_eq!(
                    holds.iter().filter(|h| **h).count(),
                    1,
                    "{:?} vs {:?}",
                    x,
                    y
                );
            }
        }
    }

    #[test]
    fn test_merge_is_commutative_and_dominates_inputs() {
        let x = clock(&[("A", 4), ("B", 1)]);
        let y = clock(&[("B", 5), ("C", 2)]);
        let m = x.merge(&y);
        assert_eq!(m, y.merge(&x));
        assert!(m.dominates(&x));
        assert!(m.dominates(&y));
        assert_eq!(m.total(), 11);
    }

    #[test]
    fn test_timestamp_total_order() {
        let early = LogicalTimestamp::new(dev("B"), 50, clock(&[("A", 1)]));
        let late = LogicalTimestamp::new(dev("A"), 10, clock(&[("A", 2)]));
        // Causal order beats wall clock
        assert_eq!(early.total_cmp(&late), Ordering::Less);

        let x = LogicalTimestamp::new(dev("A"), 10, clock(&[("A", 1)]));
        let y = LogicalTimestamp::new(dev("B"), 10, clock(&[("B", 1)]));
        assert_eq!(x.total_cmp(&y), Ordering::Less);
        assert_eq!(y.total_cmp(&x), Ordering::Greater);

        // Concurrent stamps order by device, never by a skewed wall clock
        let skewed = LogicalTimestamp::new(dev("A"), 99_999, clock(&[("A", 1)]));
        assert_eq!(skewed.total_cmp(&y), Ordering::Less);
    }
}
