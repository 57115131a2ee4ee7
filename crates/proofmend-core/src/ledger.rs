//! Line ledger for a harness file under repeated single-line insertions.
//!
//! Each entry is the current 1-based line number of a line we inserted. When a
//! new line goes in at `L`, entries at or below `L` shift down by one before
//! `L` is recorded, so the entries always name the inserted lines in the
//! current file.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineLedger {
    inserted: Vec<usize>,
}

impl LineLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a line was inserted so that it now sits at current line `line`.
    pub fn record_insertion(&mut self, line: usize) {
        for entry in self.inserted.iter_mut() {
            if *entry >= line {
                *entry += 1;
            }
        }
        self.inserted.push(line);
    }

    /// Current position of a line that sat at `raw` before any insertion.
    pub fn to_current(&self, raw: usize) -> usize {
        let mut current = raw;
        loop {
            let next = raw + self.inserted.iter().filter(|e| **e <= current).count();
            if next == current {
                return current;
            }
            current = next;
        }
    }

    /// Original position of current line `current`, or `None` when it is one
    /// of our inserted lines.
    pub fn to_raw(&self, current: usize) -> Option<usize> {
        if self.is_inserted(current) {
            return None;
        }
        Some(current - self.inserted.iter().filter(|e| **e < current).count())
    }

    pub fn is_inserted(&self, current: usize) -> bool {
        self.inserted.contains(&current)
    }

    /// Inserted lines in insertion order, at their current positions.
    pub fn entries(&self) -> &[usize] {
        &self.inserted
    }

    pub fn len(&self) -> usize {
        self.inserted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn insertion_above_shifts_error_line() {
        let mut ledger = LineLedger::new();
        ledger.record_insertion(5);
        assert_eq!(ledger.to_current(8), 9);
        assert_eq!(ledger.to_current(4), 4);
        assert_eq!(ledger.to_raw(9), Some(8));
        assert_eq!(ledger.to_raw(5), None);
    }

    #[test]
    fn earlier_entries_shift_when_inserting_above_them() {
        let mut ledger = LineLedger::new();
        ledger.record_insertion(10);
        ledger.record_insertion(3);
        assert_eq!(ledger.entries(), &[11, 3]);
        // raw 9 sits below the first insertion point only
        assert_eq!(ledger.to_current(9), 10);
        assert_eq!(ledger.to_current(10), 12);
    }

    #[test]
    fn insertion_between_raw_and_shifted_position() {
        let mut ledger = LineLedger::new();
        ledger.record_insertion(2);
        // raw 5 is now at 6; insert at 6 pushes it to 7
        ledger.record_insertion(6);
        assert_eq!(ledger.to_current(5), 7);
        assert_eq!(ledger.to_raw(7), Some(5));
    }

    proptest! {
        /// Build the file in a model line by line and compare.
        #[test]
        fn ledger_tracks_model_file(
            original_len in 1usize..40,
            picks in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            // `Some(raw)` for original lines, `None` for inserted ones
            let mut file: Vec<Option<usize>> = (1..=original_len).map(Some).collect();
            let mut ledger = LineLedger::new();
            for pick in picks {
                let at = pick.index(file.len() + 1) + 1;
                file.insert(at - 1, None);
                ledger.record_insertion(at);
            }
            for (idx, line) in file.iter().enumerate() {
                let current = idx + 1;
                match line {
                    Some(raw) => {
                        prop_assert_eq!(ledger.to_current(*raw), current);
                        prop_assert_eq!(ledger.to_raw(current), Some(*raw));
                    }
                    None => prop_assert!(ledger.is_inserted(current)),
                }
            }
        }
    }
}
