/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use crate::vl1::protocol::{COUNTER_MAX_SKIP_AHEAD, COUNTER_WINDOW_SIZE};

/// Per-peer replay filter over the session's send counters.
///
/// Each packet's counter doubles as its AEAD nonce, so accepting a counter
/// twice would both replay traffic and reuse a GCM nonce. The filter tracks
/// the highest counter that has authenticated plus a one-bit-per-counter map
/// of the window just below it, which tolerates UDP reordering within
/// `COUNTER_WINDOW_SIZE` packets. A counter can jump ahead of the highest
/// seen by at most `COUNTER_MAX_SKIP_AHEAD`, which bounds how far a burst of
/// loss can move the window.
///
/// `check` is the cheap pre-decryption filter; `update` claims the counter
/// and must only be called once the packet's tag has verified, since an
/// attacker who could claim counters with garbage packets would deny the
/// legitimate ones.
pub struct CounterWindow {
    /// Highest counter that has passed authentication.
    top: u64,
    /// Bit `i` set means `top - i` has been accepted.
    seen: u64,
}

impl CounterWindow {
    pub fn new() -> Self {
        Self { top: 0, seen: 0 }
    }

    /// Would this counter be acceptable right now?
    pub fn check(&self, counter: u64) -> bool {
        if counter > self.top {
            counter - self.top <= COUNTER_MAX_SKIP_AHEAD
        } else {
            let behind = self.top - counter;
            behind < COUNTER_WINDOW_SIZE as u64 && self.seen & (1u64 << behind) == 0
        }
    }

    /// Claim a counter after authentication, sliding the window forward if
    /// it is the new highest. False if it was already claimed or out of range.
    pub fn update(&mut self, counter: u64) -> bool {
        if !self.check(counter) {
            return false;
        }
        if counter > self.top {
            let advance = counter - self.top;
            self.seen = if advance >= u64::BITS as u64 { 0 } else { self.seen << advance };
            self.seen |= 1;
            self.top = counter;
        } else {
            self.seen |= 1u64 << (self.top - counter);
        }
        true
    }
}

impl Default for CounterWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_rejected() {
        let mut w = CounterWindow::new();
        assert!(w.update(5));
        assert!(!w.update(5));
        assert!(w.update(6));
        assert!(!w.check(6));
    }

    #[test]
    fn out_of_order_within_window_accepted() {
        let mut w = CounterWindow::new();
        assert!(w.update(10));
        assert!(w.update(8));
        assert!(w.update(9));
        assert!(!w.update(8));
    }

    #[test]
    fn counters_below_the_window_rejected() {
        let mut w = CounterWindow::new();
        assert!(w.update(COUNTER_WINDOW_SIZE as u64 + 10));
        assert!(!w.check(9));
        assert!(w.check(COUNTER_WINDOW_SIZE as u64 + 9));
    }

    #[test]
    fn excessive_skip_ahead_rejected() {
        let mut w = CounterWindow::new();
        assert!(w.update(1));
        assert!(!w.check(COUNTER_MAX_SKIP_AHEAD + 2));
        assert!(w.check(COUNTER_MAX_SKIP_AHEAD + 1));
    }

    #[test]
    fn window_slides_with_the_top() {
        let mut w = CounterWindow::new();
        assert!(w.update(1));
        assert!(w.update(2));
        // A large jump discards the old window entirely.
        let far = 2 + u64::BITS as u64 + 5;
        assert!(w.update(far));
        assert!(!w.check(2));
        assert!(w.update(far - 1));
        assert!(!w.update(far - 1));
    }
}
