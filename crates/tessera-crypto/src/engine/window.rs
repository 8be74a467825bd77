//! Decoder sequence window bookkeeping.
//!
//! `base` is the lowest sequence number the decoder can still accept.
//! In async mode `seen` remembers which sequences at or ahead of `base`
//! (bit `i` is `base + i`) have already been decoded.

use serde::{Deserialize, Serialize};

/// Largest supported window magnitude. The async replay mask is one `u64`.
pub const MAX_WINDOW: u8 = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub(crate) struct WindowTracker {
    window: i32,
    base: u64,
    seen: u64,
}

/// Whether `window` fits the replay mask.
pub(crate) fn window_in_range(window: i32) -> bool {
    window.unsigned_abs() <= u32::from(MAX_WINDOW)
}

impl WindowTracker {
    pub(crate) const fn new(window: i32) -> Self {
        Self {
            window,
            base: 0,
            seen: 0,
        }
    }

    pub(crate) const fn window(&self) -> i32 {
        self.window
    }

    #[cfg(test)]
    pub(crate) const fn base(&self) -> u64 {
        self.base
    }

    /// Sequence numbers the decoder should try, lowest first.
    pub(crate) fn candidates(&self) -> Vec<u64> {
        let reach = match self.window {
            0 => 0,
            w if w > 0 => u64::from(w.unsigned_abs()),
            w => 2 * u64::from(w.unsigned_abs()),
        };
        let last = self.base.saturating_add(reach);
        (self.base..=last)
            .filter(|&seq| !self.is_seen(seq))
            .collect()
    }

    /// Record a successful decode of `seq` and return how far ahead of the
    /// base it was.
    pub(crate) fn accept(&mut self, seq: u64) -> u32 {
        let offset = seq.saturating_sub(self.base);
        let skipped = u32::try_from(offset).unwrap_or(u32::MAX);

        if self.window >= 0 {
            self.base = seq.saturating_add(1);
            self.seen = 0;
            return skipped;
        }

        let n = u64::from(self.window.unsigned_abs());
        if offset <= n {
            self.seen |= 1 << offset;
        } else {
            let shift = offset - n;
            self.base = self.base.saturating_add(shift);
            self.seen = if shift >= 64 { 0 } else { self.seen >> shift };
            self.seen |= 1 << n;
        }
        self.skip_seen();
        skipped
    }

    /// Reserve the next sequence number for a chunk stream.
    pub(crate) fn reserve_next(&mut self) -> u64 {
        let seq = self.base;
        self.accept(seq);
        seq
    }

    fn is_seen(&self, seq: u64) -> bool {
        let offset = seq - self.base;
        offset < 64 && self.seen & (1 << offset) != 0
    }

    fn skip_seen(&mut self) {
        while self.seen & 1 == 1 {
            self.seen >>= 1;
            self.base = self.base.saturating_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn try_decode(tracker: &mut WindowTracker, seq: u64) -> bool {
        if tracker.candidates().contains(&seq) {
            tracker.accept(seq);
            true
        } else {
            false
        }
    }

    #[test]
    fn verification_only_accepts_exactly_next() {
        let mut t = WindowTracker::new(0);
        assert!(try_decode(&mut t, 0));
        assert!(!try_decode(&mut t, 0));
        assert!(!try_decode(&mut t, 2));
        assert!(try_decode(&mut t, 1));
        assert!(try_decode(&mut t, 2));
    }

    #[test]
    fn forward_only_is_monotonic() {
        let mut t = WindowTracker::new(2);
        assert!(try_decode(&mut t, 0));
        assert!(!try_decode(&mut t, 0));
        assert!(try_decode(&mut t, 2));
        assert!(!try_decode(&mut t, 1));
        assert!(!try_decode(&mut t, 2));
        assert!(try_decode(&mut t, 3));
    }

    #[test]
    fn forward_only_rejects_beyond_window() {
        let mut t = WindowTracker::new(2);
        assert!(!try_decode(&mut t, 3));
        assert!(try_decode(&mut t, 2));
    }

    #[test]
    fn async_accepts_reordering_and_collapses() {
        let mut t = WindowTracker::new(-2);
        assert!(try_decode(&mut t, 0));
        assert!(try_decode(&mut t, 2));
        assert!(try_decode(&mut t, 1));
        assert_eq!(t.base(), 3);
        assert!(!try_decode(&mut t, 1));
    }

    #[test]
    fn async_far_ahead_shifts_base() {
        let mut t = WindowTracker::new(-2);
        assert!(try_decode(&mut t, 3));
        assert_eq!(t.base(), 1);
        assert!(!try_decode(&mut t, 0));
        assert!(!try_decode(&mut t, 3));
        assert!(try_decode(&mut t, 2));
        assert!(try_decode(&mut t, 1));
        assert_eq!(t.base(), 4);
    }

    #[test]
    fn async_rejects_beyond_twice_window() {
        let mut t = WindowTracker::new(-2);
        assert!(!try_decode(&mut t, 5));
        assert!(try_decode(&mut t, 4));
    }

    #[test]
    fn skipped_is_distance_from_base() {
        let mut t = WindowTracker::new(5);
        assert_eq!(t.accept(3), 3);
        assert_eq!(t.accept(4), 0);
    }

    #[test]
    fn reserve_takes_the_base() {
        let mut t = WindowTracker::new(0);
        assert_eq!(t.reserve_next(), 0);
        assert_eq!(t.reserve_next(), 1);
    }
}
