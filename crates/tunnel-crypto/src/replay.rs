//! Sliding window for replay protection.
//!
//! Tracks the highest accepted counter and a bitmap of the counters just
//! below it. Counters older than the window, or already marked in the
//! bitmap, are rejected. Counter 0 is an ordinary first counter.
//!
//! Only authenticated counters may be fed into the window; otherwise a
//! forged header could slide it forward and cause valid traffic to be
//! dropped.
//!
//! Not thread-safe. The peer session keeps it behind a mutex.

use crate::CryptoError;

#[derive(Debug, Clone)]
pub struct ReplayWindow {
    /// Highest counter accepted so far. Meaningless until `seen_any`.
    highest: u64,
    /// Bit `n` set means `highest - n` was accepted.
    bitmap: u128,
    size: u64,
    seen_any: bool,
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self {
            highest: 0,
            bitmap: 0,
            size: Self::MAX_SIZE,
            seen_any: false,
        }
    }
}

impl ReplayWindow {
    pub const MAX_SIZE: u64 = 128;

    pub fn new(size: u64) -> Result<Self, CryptoError> {
        if size == 0 || size > Self::MAX_SIZE {
            return Err(CryptoError::InvalidWindow(size));
        }
        Ok(Self {
            size,
            ..Self::default()
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Highest accepted counter, if any.
    pub fn highest(&self) -> Option<u64> {
        self.seen_any.then_some(self.highest)
    }

    /// Whether `counter` would be accepted. Does not mark it.
    pub fn check(&self, counter: u64) -> bool {
        if !self.seen_any || counter > self.highest {
            return true;
        }

        let offset = self.highest - counter;
        offset < self.size && self.bitmap & (1u128 << offset) == 0
    }

    /// Accept and mark `counter`, or return false for a replay.
    pub fn check_and_update(&mut self, counter: u64) -> bool {
        if !self.seen_any {
            self.seen_any = true;
            self.highest = counter;
            self.bitmap = 1;
            return true;
        }

        if counter > self.highest {
            let shift = counter - self.highest;
            self.bitmap = if shift >= 128 {
                1
            } else {
                (self.bitmap << shift) | 1
            };
            self.highest = counter;
            return true;
        }

        let offset = self.highest - counter;
        if offset >= self.size {
            return false;
        }

        let mask = 1u128 << offset;
        if self.bitmap & mask != 0 {
            return false;
        }
        self.bitmap |= mask;
        true
    }

    pub fn reset(&mut self) {
        self.highest = 0;
        self.bitmap = 0;
        self.seen_any = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_counters() {
        let mut window = ReplayWindow::default();

        for i in 0..=300 {
            assert!(window.check_and_update(i), "counter {} should be valid", i);
        }
        assert_eq!(window.highest(), Some(300));
    }

    #[test]
    fn test_zero_is_tracked() {
        let mut window = ReplayWindow::default();

        assert!(window.check_and_update(0));
        assert!(!window.check(0));
        assert!(!window.check_and_update(0));
        assert!(window.check_and_update(1));
        assert!(!window.check_and_update(0));
    }

    #[test]
    fn test_replay_detection() {
        let mut window = ReplayWindow::default();

        assert!(window.check_and_update(1));
        assert!(window.check_and_update(2));
        assert!(window.check_and_update(3));

        assert!(!window.check_and_update(1));
        assert!(!window.check_and_update(2));
        assert!(!window.check_and_update(3));
    }

    #[test]
    fn test_out_of_order() {
        let mut window = ReplayWindow::default();

        assert!(window.check_and_update(5));
        assert!(window.check_and_update(3));
        assert!(window.check_and_update(4));
        assert!(window.check_and_update(0));
        assert!(window.check_and_update(2));

        for i in [0, 2, 3, 4, 5] {
            assert!(!window.check_and_update(i));
        }
        assert!(window.check_and_update(1));
    }

    #[test]
    fn test_old_counter_rejected() {
        let mut window = ReplayWindow::default();

        for i in 1..200 {
            assert!(window.check_and_update(i));
        }

        assert!(!window.check(0));
        assert!(!window.check_and_update(50));
    }

    #[test]
    fn test_small_window_slides() {
        let mut window = ReplayWindow::new(10).unwrap();

        assert!(window.check_and_update(10));
        assert!(window.check(1));
        assert!(!window.check(0));

        assert!(window.check_and_update(11));
        assert!(!window.check(1));
        assert!(!window.check_and_update(1));
    }

    #[test]
    fn test_large_jump() {
        let mut window = ReplayWindow::default();

        assert!(window.check_and_update(1));
        assert!(window.check_and_update(1000));

        assert!(!window.check_and_update(1));
        assert!(window.check_and_update(999));
    }

    #[test]
    fn test_check_without_update() {
        let mut window = ReplayWindow::default();

        assert!(window.check_and_update(1));
        assert!(window.check(3));
        assert!(window.check(3));

        assert!(window.check_and_update(3));
        assert!(!window.check(3));
    }

    #[test]
    fn test_invalid_sizes() {
        assert!(matches!(ReplayWindow::new(0), Err(CryptoError::InvalidWindow(0))));
        assert!(matches!(ReplayWindow::new(129), Err(CryptoError::InvalidWindow(129))));
        assert_eq!(ReplayWindow::new(128).unwrap().size(), 128);
    }

    #[test]
    fn test_reset() {
        let mut window = ReplayWindow::default();
        assert!(window.check_and_update(7));
        window.reset();

        assert_eq!(window.highest(), None);
        assert!(window.check_and_update(7));
    }
}
