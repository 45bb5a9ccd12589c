//! Anti-replay window
//!
//! A sliding bitmap of width 2048 tracking accepted 64-bit counters. The
//! check-and-update must be atomic per session; callers wrap the window in
//! a mutex.

use crate::protocol::{REJECT_AFTER_MESSAGES, REPLAY_WINDOW};

const BLOCK_BITS: usize = 64;
const BLOCKS: usize = REPLAY_WINDOW / BLOCK_BITS;

/// Sliding-window replay filter for received counters
#[derive(Clone)]
pub struct ReplayWindow {
    /// Largest accepted counter
    last: u64,
    /// Ring bitmap over the window, indexed by counter modulo the width
    bitmap: [u64; BLOCKS],
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self {
            last: 0,
            bitmap: [0u64; BLOCKS],
        }
    }

    fn bit_set(&self, counter: u64) -> bool {
        let idx = (counter % REPLAY_WINDOW as u64) as usize;
        self.bitmap[idx / BLOCK_BITS] >> (idx % BLOCK_BITS) & 1 == 1
    }

    fn set_bit(&mut self, counter: u64) {
        let idx = (counter % REPLAY_WINDOW as u64) as usize;
        self.bitmap[idx / BLOCK_BITS] |= 1 << (idx % BLOCK_BITS);
    }

    fn clear_bit(&mut self, counter: u64) {
        let idx = (counter % REPLAY_WINDOW as u64) as usize;
        self.bitmap[idx / BLOCK_BITS] &= !(1 << (idx % BLOCK_BITS));
    }

    /// Check whether `counter` is acceptable and record it if so.
    ///
    /// Accepts a counter exactly once; rejects counters at or beyond the
    /// receive quota, counters that fell out of the window, and counters
    /// already recorded.
    pub fn check_and_update(&mut self, counter: u64) -> bool {
        if counter >= REJECT_AFTER_MESSAGES {
            return false;
        }

        if counter > self.last {
            // Advance the window, clearing the bits it vacates
            let diff = counter - self.last;
            if diff >= REPLAY_WINDOW as u64 {
                self.bitmap = [0u64; BLOCKS];
            } else {
                for c in (self.last + 1)..counter {
                    self.clear_bit(c);
                }
            }
            self.last = counter;
            self.set_bit(counter);
            return true;
        }

        if self.last - counter >= REPLAY_WINDOW as u64 {
            return false;
        }

        if self.bit_set(counter) {
            return false;
        }
        self.set_bit(counter);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_packet_and_replay() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(0));
        assert!(!window.check_and_update(0));

        assert!(window.check_and_update(1));
        assert!(window.check_and_update(5));
        assert!(window.check_and_update(10));

        assert!(!window.check_and_update(5));
        assert!(!window.check_and_update(10));
    }

    #[test]
    fn test_out_of_order_within_window() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(5));
        assert!(window.check_and_update(3));
        assert!(window.check_and_update(7));
        assert!(window.check_and_update(4));

        assert!(!window.check_and_update(3));
        assert!(!window.check_and_update(4));
        assert!(!window.check_and_update(5));
        assert!(!window.check_and_update(7));

        // 6 was never seen
        assert!(window.check_and_update(6));
    }

    #[test]
    fn test_too_old_rejected() {
        let mut window = ReplayWindow::new();

        let w = REPLAY_WINDOW as u64;
        assert!(window.check_and_update(w + 10));

        // Exactly at the window edge and beyond
        assert!(!window.check_and_update(10));
        assert!(!window.check_and_update(0));

        // Just inside the window
        assert!(window.check_and_update(11));
    }

    #[test]
    fn test_large_jump_clears_window() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(1));
        assert!(window.check_and_update(1 + 10 * REPLAY_WINDOW as u64));

        // The old counter is far outside the window now
        assert!(!window.check_and_update(1));
        // Fresh counters just inside the new window are accepted
        assert!(window.check_and_update(1 + 10 * REPLAY_WINDOW as u64 - 5));
    }

    #[test]
    fn test_vacated_bits_cleared() {
        let mut window = ReplayWindow::new();

        assert!(window.check_and_update(10));
        // Advance by a bit more than one full window so bit positions wrap
        let next = 10 + REPLAY_WINDOW as u64 + 3;
        assert!(window.check_and_update(next));
        // A counter that maps to the same ring slot as 10 but was never
        // received must be accepted
        assert!(window.check_and_update(10 + REPLAY_WINDOW as u64));
    }

    #[test]
    fn test_receive_quota() {
        let mut window = ReplayWindow::new();

        assert!(!window.check_and_update(REJECT_AFTER_MESSAGES));
        assert!(!window.check_and_update(u64::MAX));
        assert!(window.check_and_update(REJECT_AFTER_MESSAGES - 1));
    }
}
