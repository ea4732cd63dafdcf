//! Lamport clocks for causal ordering.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A per-writer logical timestamp.
///
/// Clocks order by `time` first and fall back to the writer `id`, which gives a
/// deterministic total order for entries that were written concurrently.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clock {
    /// Writer id the clock belongs to.
    pub id: String,
    pub time: u64,
}

impl Clock {
    pub fn new(id: impl Into<String>, time: u64) -> Self {
        Self {
            id: id.into(),
            time,
        }
    }

    /// Returns the clock that follows both `self` and every clock in `seen`.
    pub fn tick_past<'a>(&self, seen: impl IntoIterator<Item = &'a Clock>) -> Clock {
        let max = seen
            .into_iter()
            .map(|clock| clock.time)
            .fold(self.time, u64::max);
        Clock::new(self.id.clone(), max + 1)
    }

    /// Advance this clock so it is at least as late as `other`.
    pub fn merge(&mut self, other: &Clock) {
        self.time = self.time.max(other.time);
    }
}

impl PartialOrd for Clock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Clock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.id.cmp(&other.id))
    }
}
