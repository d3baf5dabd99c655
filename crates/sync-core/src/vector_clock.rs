//! VectorClock: per-device counters for causality tracking between note versions.
//!
//! Missing entries read as 0. A device only ever increments its own entry, so
//! comparing two clocks tells us whether one version has seen everything the
//! other has (`is_behind`), or whether they diverged.
//!
//! Only partial-order queries are provided. Two clocks can be concurrent, in
//! which case each `is_behind` the other.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

/// Map of device ID to that device's write counter.
///
/// Serializes as a plain JSON object (`{"a1b2...": 3}`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a device (0 if absent).
    pub fn get(&self, device: &str) -> u64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    /// Set a device's counter explicitly.
    pub fn set(&mut self, device: &str, count: u64) {
        self.0.insert(device.to_string(), count);
    }

    /// Increment a device's counter by one.
    pub fn increment(&mut self, device: &str) {
        *self.0.entry(device.to_string()).or_insert(0) += 1;
    }

    /// Builder form of `set`.
    pub fn with(mut self, device: &str, count: u64) -> Self {
        self.set(device, count);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// True if `source` has seen a write from some device that `self` has not.
    ///
    /// `target.is_behind(&source)` answers "does target need source's changes?".
    /// Used in both directions by sync planning: server-behind-client means
    /// upload, client-behind-server means download.
    pub fn is_behind(&self, source: &VectorClock) -> bool {
        source
            .0
            .iter()
            .any(|(device, &count)| self.get(device) < count)
    }

    /// True iff `candidate` differs from `self` only by a strictly larger
    /// counter at `device`.
    ///
    /// Every other device present in either clock must carry the same value in
    /// both (missing reads as 0). This is the optimistic-concurrency check: a
    /// write based on `self` is safe without a merge only if nobody else wrote
    /// in between.
    pub fn only_advanced_by(&self, candidate: &VectorClock, device: &str) -> bool {
        if candidate.get(device) <= self.get(device) {
            return false;
        }

        self.0
            .keys()
            .chain(candidate.0.keys())
            .filter(|key| key.as_str() != device)
            .all(|key| self.get(key) == candidate.get(key))
    }

    /// Pointwise maximum of two clocks.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut result = self.clone();
        for (device, &count) in &other.0 {
            let entry = result.0.entry(device.clone()).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
        result
    }

    /// Merge with `base`, then make sure `device` is strictly ahead of `base`.
    ///
    /// This is the clock for a version that contains everything in `base` plus
    /// local-only changes from `device`. If `self` is already ahead at
    /// `device` no extra increment happens, so repeated calls against the same
    /// base are stable.
    pub fn advanced_past(&self, base: &VectorClock, device: &str) -> VectorClock {
        let mut result = self.merged(base);
        if result.get(device) <= base.get(device) {
            result.set(device, base.get(device) + 1);
        }
        result
    }
}

impl Display for VectorClock {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (device, count)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", device, count)?;
        }
        write!(f, "}}")
    }
}

impl<K: Into<String>> FromIterator<(K, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (K, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}
