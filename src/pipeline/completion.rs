//! Per-collection completion tracking.
//!
//! The validator's end-of-collection marker and the executors' outcome
//! events arrive in any order. Each collection moves through:
//!
//! ```text
//!   (absent) ──outcome──▶ Unknown{current}
//!   (absent) ──marker───▶ Known{expected, current = 0}
//!   Unknown  ──marker───▶ Known{expected, current}
//!   Known    ──outcome──▶ Known{expected, current + 1}
//!   Known    ── current == expected ──▶ Complete (entry removed, reported once)
//! ```
//!
//! A later marker for a tracked collection overwrites the expected count and
//! scratch directory.

use std::collections::HashMap;
use std::path::PathBuf;

/// Expected completion count of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    /// No marker seen yet.
    Unknown,
    Known(u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionCompletionState {
    pub expected: Expected,
    pub current: u64,
    pub scratch_dir: Option<PathBuf>,
}

/// A collection whose work has all finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCollection {
    pub base_collection_key: String,
    pub scratch_dir: PathBuf,
}

#[derive(Debug, Default)]
pub struct CompletionTracker {
    states: HashMap<String, CollectionCompletionState>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the end-of-collection marker.
    pub fn record_marker(
        &mut self,
        base_collection_key: &str,
        expected: u64,
        scratch_dir: PathBuf,
    ) -> Option<CompletedCollection> {
        let state = self
            .states
            .entry(base_collection_key.to_string())
            .or_insert(CollectionCompletionState {
                expected: Expected::Unknown,
                current: 0,
                scratch_dir: None,
            });
        state.expected = Expected::Known(expected);
        state.scratch_dir = Some(scratch_dir);

        self.check(base_collection_key)
    }

    /// Records one finished task.
    pub fn record_outcome(&mut self, base_collection_key: &str) -> Option<CompletedCollection> {
        self.states
            .entry(base_collection_key.to_string())
            .and_modify(|state| state.current += 1)
            .or_insert(CollectionCompletionState {
                expected: Expected::Unknown,
                current: 1,
                scratch_dir: None,
            });

        self.check(base_collection_key)
    }

    fn check(&mut self, base_collection_key: &str) -> Option<CompletedCollection> {
        let state = self.states.get(base_collection_key)?;
        let Expected::Known(expected) = state.expected else {
            return None;
        };
        if state.current != expected {
            return None;
        }

        let state = self.states.remove(base_collection_key)?;
        Some(CompletedCollection {
            base_collection_key: base_collection_key.to_string(),
            scratch_dir: state.scratch_dir?,
        })
    }

    pub fn state(&self, base_collection_key: &str) -> Option<&CollectionCompletionState> {
        self.states.get(base_collection_key)
    }

    /// Collections still being tracked.
    pub fn pending(&self) -> Vec<(&str, &CollectionCompletionState)> {
        let mut pending: Vec<_> = self
            .states
            .iter()
            .map(|(key, state)| (key.as_str(), state))
            .collect();
        pending.sort_by(|a, b| a.0.cmp(b.0));
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_sequence(expected: u64, marker_at: usize) -> Vec<CompletedCollection> {
        let mut tracker = CompletionTracker::new();
        let mut completed = Vec::new();
        let total = expected as usize;

        for step in 0..=total {
            if step == marker_at {
                completed.extend(tracker.record_marker("AAAA_1", expected, PathBuf::from("/scratch/a")));
            }
            if step < total {
                completed.extend(tracker.record_outcome("AAAA_1"));
            }
        }
        assert!(tracker.state("AAAA_1").is_none());
        completed
    }

    #[test]
    fn test_every_marker_position_completes_once() {
        for expected in 0..6u64 {
            for marker_at in 0..=expected as usize {
                let completed = run_sequence(expected, marker_at);
                assert_eq!(
                    completed,
                    vec![CompletedCollection {
                        base_collection_key: "AAAA_1".to_string(),
                        scratch_dir: PathBuf::from("/scratch/a"),
                    }],
                    "expected={} marker_at={}",
                    expected,
                    marker_at
                );
            }
        }
    }

    #[test]
    fn test_unknown_until_marker() {
        let mut tracker = CompletionTracker::new();
        assert!(tracker.record_outcome("AAAA_1").is_none());
        assert!(tracker.record_outcome("AAAA_1").is_none());

        let state = tracker.state("AAAA_1").unwrap();
        assert_eq!(state.expected, Expected::Unknown);
        assert_eq!(state.current, 2);
        assert_eq!(state.scratch_dir, None);

        let done = tracker.record_marker("AAAA_1", 2, PathBuf::from("/s"));
        assert_eq!(done.unwrap().scratch_dir, PathBuf::from("/s"));
    }

    #[test]
    fn test_zero_expected_completes_on_marker() {
        let mut tracker = CompletionTracker::new();
        let done = tracker.record_marker("EMPTY_1", 0, PathBuf::from("/scratch/e"));
        assert!(done.is_some());
        assert!(tracker.pending().is_empty());
    }

    #[test]
    fn test_interleaved_collections_are_independent() {
        let mut tracker = CompletionTracker::new();
        let mut done = Vec::new();

        done.extend(tracker.record_outcome("B_2"));
        done.extend(tracker.record_marker("A_1", 2, PathBuf::from("/a")));
        done.extend(tracker.record_outcome("A_1"));
        done.extend(tracker.record_marker("B_2", 1, PathBuf::from("/b")));
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].base_collection_key, "B_2");

        assert_eq!(tracker.pending().len(), 1);
        done.extend(tracker.record_outcome("A_1"));
        assert_eq!(done.len(), 2);
        assert_eq!(done[1].base_collection_key, "A_1");
        assert!(tracker.pending().is_empty());
    }

    #[test]
    fn test_later_marker_overwrites_expected() {
        let mut tracker = CompletionTracker::new();
        assert!(tracker.record_marker("A_1", 3, PathBuf::from("/old")).is_none());
        assert!(tracker.record_outcome("A_1").is_none());
        let done = tracker.record_marker("A_1", 1, PathBuf::from("/new")).unwrap();
        assert_eq!(done.scratch_dir, PathBuf::from("/new"));
    }
}
