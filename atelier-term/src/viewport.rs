//! Trailing-edge coalescing for viewport dimension changes.
//!
//! Continuous container resizing produces a burst of dimension updates;
//! only the final `{cols, rows}` of a burst is worth a `resize-terminal`
//! message. The coalescer keeps the latest pending dimensions; the first
//! submission of a burst asks the caller to schedule a flush, later ones
//! just overwrite the pending value.

use std::sync::Mutex;

pub(crate) struct ResizeCoalescer {
    pending: Mutex<Option<(u16, u16)>>,
}

impl ResizeCoalescer {
    pub(crate) fn new() -> Self {
        Self {
            pending: Mutex::new(None),
        }
    }

    /// Record new dimensions. Returns `true` when this submission opened a
    /// new burst and the caller must schedule a flush.
    pub(crate) fn submit(&self, cols: u16, rows: u16) -> bool {
        let mut pending = self.pending.lock().unwrap();
        let starts_burst = pending.is_none();
        *pending = Some((cols, rows));
        starts_burst
    }

    /// Take the final dimensions of the burst, closing it.
    pub(crate) fn take(&self) -> Option<(u16, u16)> {
        self.pending.lock().unwrap().take()
    }

    /// Drop any pending flush payload (teardown).
    pub(crate) fn reset(&self) {
        self.pending.lock().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_submit_starts_burst() {
        let coalescer = ResizeCoalescer::new();
        assert!(coalescer.submit(80, 24));
        assert!(!coalescer.submit(100, 30));
        assert!(!coalescer.submit(120, 40));
    }

    #[test]
    fn test_take_returns_latest_and_closes_burst() {
        let coalescer = ResizeCoalescer::new();
        coalescer.submit(80, 24);
        coalescer.submit(120, 40);
        assert_eq!(coalescer.take(), Some((120, 40)));
        assert_eq!(coalescer.take(), None);
        // Next submission is a fresh burst.
        assert!(coalescer.submit(90, 25));
    }

    #[test]
    fn test_reset_discards_pending() {
        let coalescer = ResizeCoalescer::new();
        coalescer.submit(80, 24);
        coalescer.reset();
        assert_eq!(coalescer.take(), None);
    }
}
