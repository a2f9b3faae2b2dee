//! # Sliding-TTL Sets
//!
//! [`VolatileSet`] is a set whose members expire a fixed time after their
//! last insertion. Re-inserting an existing member re-stamps it, so members
//! survive as long as they keep being touched (sliding window).
//!
//! Expiry is pull-based: nothing is removed until the owner calls
//! [`VolatileSet::trim`], which the overlay does from its periodic sweeps.
//! This keeps the set free of background tasks and makes expiry observable
//! at well-defined points. `contains` reflects the map as-is between trims.
//!
//! The survival time is exposed because callers size their burst guards
//! relative to it (events beyond `cap × survival-minutes` are dropped).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Minimum interval between two expiry scans.
///
/// Trim is called from 1s-tick loops; scanning the whole map that often is
/// wasted work when survival times are minutes to hours.
const TRIM_THROTTLE: Duration = Duration::from_secs(10);

/// A set whose entries expire `survival` after their most recent insertion.
#[derive(Debug)]
pub struct VolatileSet<T> {
    entries: HashMap<T, Instant>,
    survival: Duration,
    last_trim: Option<Instant>,
}

impl<T: Eq + Hash + Clone> VolatileSet<T> {
    pub fn new(survival: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            survival,
            last_trim: None,
        }
    }

    /// The sliding window length entries live for.
    pub fn survival_time(&self) -> Duration {
        self.survival
    }

    /// Inserts `value`, re-stamping it if already present.
    /// Returns true when the value was not in the set before.
    pub fn insert(&mut self, value: T) -> bool {
        self.entries.insert(value, Instant::now()).is_none()
    }

    pub fn extend<I: IntoIterator<Item = T>>(&mut self, values: I) {
        let now = Instant::now();
        for value in values {
            self.entries.insert(value, now);
        }
    }

    pub fn contains(&self, value: &T) -> bool {
        self.entries.contains_key(value)
    }

    pub fn remove(&mut self, value: &T) -> bool {
        self.entries.remove(value).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Owned copy of the current members, unordered.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.keys().cloned().collect()
    }

    /// Drops entries older than the survival time.
    ///
    /// Throttled internally; at most one scan per [`TRIM_THROTTLE`]. The
    /// first call after construction always scans.
    pub fn trim(&mut self) {
        let now = Instant::now();

        if let Some(last) = self.last_trim {
            if now.duration_since(last) < TRIM_THROTTLE {
                return;
            }
        }
        self.last_trim = Some(now);

        let survival = self.survival;
        self.entries
            .retain(|_, stamp| now.duration_since(*stamp) < survival);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn entry_expires_after_survival_time() {
        let mut set = VolatileSet::new(Duration::from_millis(50));
        set.insert("a");

        sleep(Duration::from_millis(20));
        assert!(set.contains(&"a"), "present before the window closes");

        sleep(Duration::from_millis(50));
        set.trim();
        assert!(!set.contains(&"a"), "absent after a trim past the window");
        assert!(set.is_empty());
    }

    #[test]
    fn reinsert_slides_the_window() {
        let mut set = VolatileSet::new(Duration::from_millis(60));
        set.insert(1u32);

        sleep(Duration::from_millis(40));
        assert!(!set.insert(1), "re-insert of a live entry returns false");

        // 70ms after the first stamp but only 30ms after the second.
        sleep(Duration::from_millis(30));
        set.trim();
        assert!(set.contains(&1));
    }

    #[test]
    fn trim_is_throttled_between_scans() {
        let mut set = VolatileSet::new(Duration::from_millis(10));
        set.insert("x");
        set.trim();

        sleep(Duration::from_millis(30));
        // Second trim inside the throttle window must not scan.
        set.trim();
        assert!(set.contains(&"x"));
    }

    #[test]
    fn snapshot_is_owned_and_complete() {
        let mut set = VolatileSet::new(Duration::from_secs(60));
        set.extend([1, 2, 3]);

        let mut snap = set.snapshot();
        snap.sort_unstable();
        assert_eq!(snap, vec![1, 2, 3]);

        set.remove(&2);
        assert_eq!(set.len(), 2);
    }
}
