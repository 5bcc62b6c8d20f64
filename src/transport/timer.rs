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

//! Cancellable one-shot timers, driven by the owner of the transport.
//!
//! Nothing here sleeps: the event loop asks for [`TimerQueue::next_deadline`],
//! waits on its own, and then drains [`TimerQueue::pop_expired`].

use alloc::collections::BinaryHeap;
use alloc::rc::Rc;
use core::cell::Cell;
use core::cmp::{Ordering, Reverse};
use core::time::Duration;

/// Handle to a scheduled timer.
///
/// Cancelling is idempotent, and a cancelled timer never fires even if it
/// was already due.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Rc<Cell<bool>>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }
}

struct TimerEntry<T> {
    deadline: Duration,
    seq: u64,
    token: CancellationToken,
    event: T,
}

impl<T> TimerEntry<T> {
    fn key(&self) -> (Duration, u64) {
        (self.deadline, self.seq)
    }
}

impl<T> PartialEq for TimerEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<T> Eq for TimerEntry<T> {}

impl<T> PartialOrd for TimerEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for TimerEntry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Timers firing in deadline order; timers with equal deadlines fire in scheduling order
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<TimerEntry<T>>>,
    seq: u64,
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn schedule_after(&mut self, now: Duration, delay: Duration, event: T) -> CancellationToken {
        let token = CancellationToken::new();

        self.seq += 1;
        self.heap.push(Reverse(TimerEntry {
            deadline: now.saturating_add(delay),
            seq: self.seq,
            token: token.clone(),
            event,
        }));

        token
    }

    /// Remove and return the earliest timer due at `now`, skipping cancelled ones
    pub fn pop_expired(&mut self, now: Duration) -> Option<T> {
        loop {
            let Reverse(entry) = self.heap.peek()?;

            if entry.token.is_cancelled() {
                self.heap.pop();
            } else if entry.deadline <= now {
                return self.heap.pop().map(|Reverse(entry)| entry.event);
            } else {
                return None;
            }
        }
    }

    /// The earliest deadline among the timers not cancelled yet
    pub fn next_deadline(&self) -> Option<Duration> {
        self.heap
            .iter()
            .filter(|Reverse(entry)| !entry.token.is_cancelled())
            .map(|Reverse(entry)| entry.deadline)
            .min()
    }

    /// Drop cancelled timers
    pub fn purge(&mut self) {
        self.heap.retain(|Reverse(entry)| !entry.token.is_cancelled());
    }

    /// Number of scheduled timers, cancelled ones which were not purged yet included
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn fires_in_deadline_order() {
        let mut timers = TimerQueue::new();
        timers.schedule_after(ms(0), ms(300), "c");
        timers.schedule_after(ms(0), ms(100), "a");
        timers.schedule_after(ms(0), ms(200), "b");
        timers.schedule_after(ms(0), ms(100), "a2");

        assert_eq!(timers.next_deadline(), Some(ms(100)));
        assert_eq!(timers.pop_expired(ms(50)), None);
        assert_eq!(timers.pop_expired(ms(250)), Some("a"));
        assert_eq!(timers.pop_expired(ms(250)), Some("a2"));
        assert_eq!(timers.pop_expired(ms(250)), Some("b"));
        assert_eq!(timers.pop_expired(ms(250)), None);
        assert_eq!(timers.next_deadline(), Some(ms(300)));
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let mut timers = TimerQueue::new();
        let a = timers.schedule_after(ms(0), ms(100), 1);
        timers.schedule_after(ms(0), ms(200), 2);

        a.cancel();
        a.cancel();
        assert!(a.is_cancelled());

        assert_eq!(timers.next_deadline(), Some(ms(200)));
        assert_eq!(timers.pop_expired(ms(1000)), Some(2));
        assert_eq!(timers.pop_expired(ms(1000)), None);
        assert!(timers.is_empty());

        let b = timers.schedule_after(ms(0), ms(10), 3);
        timers.schedule_after(ms(0), ms(20), 4);
        b.cancel();
        assert_eq!(timers.len(), 2);
        timers.purge();
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn cancel_after_expiry_is_noop() {
        let mut timers = TimerQueue::new();
        let a = timers.schedule_after(ms(0), ms(10), ());

        assert_eq!(timers.pop_expired(ms(10)), Some(()));
        a.cancel();
        assert_eq!(timers.next_deadline(), None);
    }
}
