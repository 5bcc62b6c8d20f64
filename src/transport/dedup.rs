/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

/// Number of counters below the highest one tracked by the window
pub const MSG_RX_STATE_BITMAP_LEN: u32 = 32;

/// Outcome of checking a received message counter against the replay window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxVerdict {
    /// First time this counter is seen; the window has recorded it
    Accept,
    /// Seen before; the window is unchanged
    Duplicate,
    /// Too far behind the highest seen counter to tell
    Stale,
}

impl RxVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accept)
    }
}

/// Sliding replay window for one (session, direction) pair.
///
/// Bit `i` of the bitmap stands for counter `max_ctr - 1 - i`.
#[derive(Debug, Clone)]
pub struct RxCtrState {
    max_ctr: u32,
    ctr_bitmap: u32,
}

impl RxCtrState {
    /// Create the window from the first counter received from a peer.
    ///
    /// Everything below that counter is considered already seen.
    pub fn new(max_ctr: u32) -> Self {
        Self {
            max_ctr,
            ctr_bitmap: u32::MAX,
        }
    }

    pub fn max_ctr(&self) -> u32 {
        self.max_ctr
    }

    fn contains(&self, bit_number: u32) -> bool {
        (self.ctr_bitmap & (1 << bit_number)) != 0
    }

    fn insert(&mut self, bit_number: u32) {
        self.ctr_bitmap |= 1 << bit_number;
    }

    /// Check a received counter and record it if it is new.
    ///
    /// For unencrypted sessions a counter far behind the window is taken as a
    /// peer reboot: the window restarts at that counter.
    pub fn post_recv(&mut self, msg_ctr: u32, is_encrypted: bool) -> RxVerdict {
        if msg_ctr == self.max_ctr {
            RxVerdict::Duplicate
        } else if msg_ctr > self.max_ctr {
            let diff = msg_ctr - self.max_ctr;

            self.ctr_bitmap = self.ctr_bitmap.checked_shl(diff).unwrap_or(0)
                | 1u32.checked_shl(diff - 1).unwrap_or(0);
            self.max_ctr = msg_ctr;

            RxVerdict::Accept
        } else {
            let diff = self.max_ctr - msg_ctr;

            if diff <= MSG_RX_STATE_BITMAP_LEN {
                let index = diff - 1;
                if self.contains(index) {
                    RxVerdict::Duplicate
                } else {
                    self.insert(index);
                    RxVerdict::Accept
                }
            } else if !is_encrypted {
                self.max_ctr = msg_ctr;
                self.ctr_bitmap = u32::MAX;
                RxVerdict::Accept
            } else {
                RxVerdict::Stale
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::collections::BTreeSet;

    use rstest::rstest;

    use super::*;

    const ENCRYPTED: bool = true;
    const NOT_ENCRYPTED: bool = false;

    #[test]
    fn new_msg_ctr() {
        let mut s = RxCtrState::new(101);

        assert_eq!(s.post_recv(103, ENCRYPTED), RxVerdict::Accept);
        assert_eq!(s.post_recv(104, ENCRYPTED), RxVerdict::Accept);
        assert_eq!(s.post_recv(106, ENCRYPTED), RxVerdict::Accept);
        assert_eq!(s.max_ctr, 106);
        assert_eq!(s.ctr_bitmap, 0xffff_fff6);

        assert_eq!(s.post_recv(138, ENCRYPTED), RxVerdict::Accept);
        assert_eq!(s.ctr_bitmap, 0x8000_0000);
        assert_eq!(s.post_recv(139, ENCRYPTED), RxVerdict::Accept);
        assert_eq!(s.ctr_bitmap, 0x0000_0001);
        assert_eq!(s.post_recv(1000, ENCRYPTED), RxVerdict::Accept);
        assert_eq!(s.ctr_bitmap, 0);
    }

    #[test]
    fn dup_max_ctr() {
        let mut s = RxCtrState::new(101);

        assert_eq!(s.post_recv(103, ENCRYPTED), RxVerdict::Accept);
        assert_eq!(s.post_recv(103, ENCRYPTED), RxVerdict::Duplicate);
        assert_eq!(s.post_recv(103, NOT_ENCRYPTED), RxVerdict::Duplicate);

        assert_eq!(s.max_ctr, 103);
        assert_eq!(s.ctr_bitmap, 0xffff_fffe);
    }

    #[test]
    fn valid_corners_in_rx_bitmap() {
        let mut s = RxCtrState::new(100);
        assert_eq!(s.post_recv(200, ENCRYPTED), RxVerdict::Accept);

        // left corner, exactly one window below
        assert_eq!(s.post_recv(168, ENCRYPTED), RxVerdict::Accept);
        assert_eq!(s.post_recv(168, ENCRYPTED), RxVerdict::Duplicate);

        // right corner
        assert_eq!(s.post_recv(199, ENCRYPTED), RxVerdict::Accept);
        assert_eq!(s.post_recv(199, ENCRYPTED), RxVerdict::Duplicate);

        // just outside
        assert_eq!(s.post_recv(167, ENCRYPTED), RxVerdict::Stale);
    }

    #[rstest]
    #[case(110, RxVerdict::Duplicate)]
    #[case(109, RxVerdict::Accept)]
    #[case(108, RxVerdict::Duplicate)]
    #[case(105, RxVerdict::Accept)]
    #[case(78, RxVerdict::Accept)]
    #[case(77, RxVerdict::Stale)]
    #[case(10, RxVerdict::Stale)]
    #[case(111, RxVerdict::Accept)]
    fn classify_after_history(#[case] ctr: u32, #[case] verdict: RxVerdict) {
        let mut s = RxCtrState::new(100);
        s.ctr_bitmap = 0;
        for c in [108, 110] {
            assert_eq!(s.post_recv(c, ENCRYPTED), RxVerdict::Accept);
        }

        assert_eq!(s.post_recv(ctr, ENCRYPTED), verdict);
    }

    #[test]
    fn unencrypted_peer_reboot() {
        let mut s = RxCtrState::new(20010);

        assert_eq!(s.post_recv(20011, NOT_ENCRYPTED), RxVerdict::Accept);
        assert_eq!(s.post_recv(5, NOT_ENCRYPTED), RxVerdict::Accept);
        assert_eq!(s.max_ctr, 5);
        assert_eq!(s.post_recv(5, NOT_ENCRYPTED), RxVerdict::Duplicate);
        assert_eq!(s.post_recv(6, NOT_ENCRYPTED), RxVerdict::Accept);
    }

    #[test]
    fn encrypted_never_wraps() {
        let mut s = RxCtrState::new(u32::MAX - 1);

        assert_eq!(s.post_recv(u32::MAX, ENCRYPTED), RxVerdict::Accept);
        assert_eq!(s.post_recv(0, ENCRYPTED), RxVerdict::Stale);
    }

    #[test]
    fn accepted_at_most_once() {
        let mut s = RxCtrState::new(1000);
        let mut accepted = BTreeSet::new();
        let mut highest = 1000;

        // xorshift, jittering around a slowly increasing base
        let mut x: u32 = 0x1234_5678;
        for step in 0..5000u32 {
            x ^= x << 13;
            x ^= x >> 17;
            x ^= x << 5;

            let ctr = 1000 + step / 2 + (x % 80) - 40;
            let verdict = s.post_recv(ctr, ENCRYPTED);

            if ctr + MSG_RX_STATE_BITMAP_LEN < highest {
                assert_eq!(verdict, RxVerdict::Stale);
            }

            if verdict.is_accepted() {
                assert!(ctr > 1000);
                assert!(accepted.insert(ctr), "counter {} accepted twice", ctr);
            }

            highest = highest.max(ctr);
        }
    }
}
