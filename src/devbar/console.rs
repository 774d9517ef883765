//! Bounded console capture ring.
//!
//! The page runtime wraps the four console methods plus the global error and
//! unhandled-rejection hooks and feeds every entry here. The ring keeps the
//! newest [`CONSOLE_RING_CAP`] entries in insertion order; overflow drops the
//! oldest. Error and warning totals survive eviction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::protocol::now_ms;
use crate::types::{ConsoleLogEntry, LogLevel};

/// Maximum captured entries per page.
pub const CONSOLE_RING_CAP: usize = 500;

/// In-memory ring of captured console entries.
#[derive(Debug, Default)]
pub struct ConsoleRing {
    entries: Mutex<VecDeque<ConsoleLogEntry>>,
    errors: AtomicUsize,
    warnings: AtomicUsize,
}

impl ConsoleRing {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry stamped with the current wall clock.
    pub fn record(&self, level: LogLevel, message: impl Into<String>, source: Option<String>) {
        self.push(ConsoleLogEntry {
            level,
            message: message.into(),
            timestamp: now_ms(),
            source,
        });
    }

    /// Append a pre-stamped entry, evicting the oldest past the cap.
    pub fn push(&self, entry: ConsoleLogEntry) {
        match entry.level {
            LogLevel::Error => {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
            LogLevel::Warn => {
                self.warnings.fetch_add(1, Ordering::Relaxed);
            }
            LogLevel::Log | LogLevel::Info => {}
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(entry);
        while entries.len() > CONSOLE_RING_CAP {
            entries.pop_front();
        }
    }

    /// Every captured entry, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConsoleLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.iter().cloned().collect()
    }

    /// Entries filtered by level and message substring, newest-last; `limit`
    /// keeps only the most recent matches.
    #[must_use]
    pub fn filtered(
        &self,
        level: Option<LogLevel>,
        contains: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<ConsoleLogEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<ConsoleLogEntry> = entries
            .iter()
            .filter(|e| level.is_none_or(|l| e.level == l))
            .filter(|e| contains.is_none_or(|needle| e.message.contains(needle)))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            let drop = matched.len().saturating_sub(limit);
            matched.drain(..drop);
        }
        matched
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total errors observed, including evicted ones.
    #[must_use]
    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::Relaxed)
    }

    /// Total warnings observed, including evicted ones.
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.warnings.load(Ordering::Relaxed)
    }

    /// Empty the ring and reset the counters (destroy semantics).
    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
        self.errors.store(0, Ordering::Relaxed);
        self.warnings.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring_with(messages: &[(&str, LogLevel)]) -> ConsoleRing {
        let ring = ConsoleRing::new();
        for (message, level) in messages {
            ring.record(*level, *message, None);
        }
        ring
    }

    #[test]
    fn test_ring_preserves_insertion_order() {
        let ring = ring_with(&[
            ("first", LogLevel::Log),
            ("second", LogLevel::Warn),
            ("third", LogLevel::Error),
        ]);
        let snapshot = ring.snapshot();
        let messages: Vec<&str> = snapshot.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_ring_bound_drops_oldest() {
        let ring = ConsoleRing::new();
        for i in 0..650u32 {
            ring.record(LogLevel::Log, format!("entry-{i}"), None);
        }
        assert_eq!(ring.len(), CONSOLE_RING_CAP);
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.first().expect("first").message, "entry-150");
        assert_eq!(snapshot.last().expect("last").message, "entry-649");
    }

    #[test]
    fn test_counts_survive_eviction() {
        let ring = ConsoleRing::new();
        for _ in 0..600u32 {
            ring.record(LogLevel::Error, "boom", None);
        }
        ring.record(LogLevel::Warn, "careful", None);
        assert_eq!(ring.error_count(), 600);
        assert_eq!(ring.warning_count(), 1);
        assert_eq!(ring.len(), CONSOLE_RING_CAP);
    }

    #[test]
    fn test_filtered_by_level_and_substring() {
        let ring = ring_with(&[
            ("TypeError x", LogLevel::Warn),
            ("TypeError y", LogLevel::Error),
            ("RangeError z", LogLevel::Error),
        ]);

        let errors = ring.filtered(Some(LogLevel::Error), None, None);
        assert_eq!(errors.len(), 2);

        let type_errors = ring.filtered(Some(LogLevel::Error), Some("TypeError"), None);
        assert_eq!(type_errors.len(), 1);
        assert_eq!(type_errors[0].message, "TypeError y");
    }

    #[test]
    fn test_filtered_limit_keeps_most_recent() {
        let ring = ring_with(&[
            ("a", LogLevel::Log),
            ("b", LogLevel::Log),
            ("c", LogLevel::Log),
        ]);
        let limited = ring.filtered(None, None, Some(2));
        let messages: Vec<&str> = limited.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["b", "c"]);
    }

    #[test]
    fn test_clear_resets_everything() {
        let ring = ring_with(&[("boom", LogLevel::Error)]);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.error_count(), 0);
    }
}
