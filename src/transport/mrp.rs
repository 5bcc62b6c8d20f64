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

use core::time::Duration;

use log::{error, warn};

use crate::error::*;

use super::timer::CancellationToken;

/// Timing of the reliable message protocol.
///
/// Factors are expressed in per-mille (1600 == 1.6).
#[derive(Debug, Clone)]
pub struct MrpConfig {
    /// Base retransmission interval when the peer is idle
    pub idle_retrans_interval: Duration,
    /// Base retransmission interval when the peer is active
    pub active_retrans_interval: Duration,
    /// How long after its last message a peer is still considered active
    pub active_threshold: Duration,
    /// Total number of transmissions of a message, the first one included
    pub max_transmissions: usize,
    pub backoff_base_permille: u64,
    pub backoff_threshold: usize,
    pub backoff_jitter_permille: u64,
    pub backoff_margin_permille: u64,
    /// How long a pending acknowledgement waits for a message to piggyback on
    pub standalone_ack_timeout: Duration,
}

impl MrpConfig {
    pub const fn new() -> Self {
        Self {
            idle_retrans_interval: Duration::from_millis(500),
            active_retrans_interval: Duration::from_millis(300),
            active_threshold: Duration::from_millis(4000),
            max_transmissions: 5,
            backoff_base_permille: 1600,
            backoff_threshold: 1,
            backoff_jitter_permille: 250,
            backoff_margin_permille: 1100,
            standalone_ack_timeout: Duration::from_millis(200),
        }
    }

    /// How long to wait for an acknowledgement of a message retransmitted `retries` times so far.
    ///
    /// `interval * margin * base^max(0, retries - threshold) * (1 + jitter * rnd / 256)`
    pub fn backoff(&self, interval: Duration, retries: usize, rnd: u8) -> Duration {
        let mut ms = interval.as_millis() as u64 * self.backoff_margin_permille / 1000;

        for _ in 0..retries.saturating_sub(self.backoff_threshold) {
            ms = ms.saturating_mul(self.backoff_base_permille) / 1000;
        }

        ms = ms.saturating_add(
            ms.saturating_mul(self.backoff_jitter_permille)
                .saturating_mul(rnd as u64)
                / (1000 * 256),
        );

        Duration::from_millis(ms)
    }

    /// Pick the base interval for a peer, preferring what the peer advertised.
    ///
    /// `last_rx` is when we last heard from the peer, `None` if never.
    pub fn base_interval(
        &self,
        peer: Option<&SessionParameters>,
        last_rx: Option<Duration>,
        now: Duration,
    ) -> Duration {
        let (idle, active, threshold) = match peer {
            Some(params) => (
                params
                    .idle_retrans_interval
                    .unwrap_or(self.idle_retrans_interval),
                params
                    .active_retrans_interval
                    .unwrap_or(self.active_retrans_interval),
                params.active_threshold.unwrap_or(self.active_threshold),
            ),
            None => (
                self.idle_retrans_interval,
                self.active_retrans_interval,
                self.active_threshold,
            ),
        };

        let is_active = last_rx
            .map(|at| now.saturating_sub(at) < threshold)
            .unwrap_or(false);

        if is_active {
            active
        } else {
            idle
        }
    }
}

impl Default for MrpConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// MRP timing announced by a node during session establishment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionParameters {
    pub idle_retrans_interval: Option<Duration>,
    pub active_retrans_interval: Option<Duration>,
    pub active_threshold: Option<Duration>,
}

impl From<&MrpConfig> for SessionParameters {
    fn from(config: &MrpConfig) -> Self {
        Self {
            idle_retrans_interval: Some(config.idle_retrans_interval),
            active_retrans_interval: Some(config.active_retrans_interval),
            active_threshold: Some(config.active_threshold),
        }
    }
}

/// A reliable message waiting for its acknowledgement
#[derive(Debug)]
pub struct RetransEntry {
    msg_ctr: u32,
    // The encrypted message, resent as is
    data: alloc::vec::Vec<u8>,
    tx_count: usize,
    token: CancellationToken,
}

impl RetransEntry {
    pub fn new(msg_ctr: u32, data: alloc::vec::Vec<u8>, token: CancellationToken) -> Self {
        Self {
            msg_ctr,
            data,
            tx_count: 1,
            token,
        }
    }

    pub fn msg_ctr(&self) -> u32 {
        self.msg_ctr
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of transmissions so far, the original one included
    pub fn tx_count(&self) -> usize {
        self.tx_count
    }

    /// Account for one more transmission, re-armed with `token`
    pub fn pre_resend(&mut self, max_transmissions: usize, token: CancellationToken) -> Result<(), Error> {
        if self.tx_count >= max_transmissions {
            Err(ErrorCode::TransportFailure)?;
        }

        self.tx_count += 1;
        self.token = token;

        Ok(())
    }
}

impl Drop for RetransEntry {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// A received reliable message we still owe an acknowledgement for
#[derive(Debug)]
pub struct AckEntry {
    msg_ctr: u32,
    token: CancellationToken,
}

impl AckEntry {
    pub fn new(msg_ctr: u32, token: CancellationToken) -> Self {
        Self { msg_ctr, token }
    }

    pub fn msg_ctr(&self) -> u32 {
        self.msg_ctr
    }
}

impl Drop for AckEntry {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// The MRP state of one exchange.
///
/// There is at most one unacknowledged outgoing message and at most one
/// pending acknowledgement per exchange. Duplicate detection is per session
/// and happens before this state is consulted.
#[derive(Debug, Default)]
pub struct ReliableMessage {
    retrans: Option<RetransEntry>,
    ack: Option<AckEntry>,
}

impl ReliableMessage {
    pub const fn new() -> Self {
        Self {
            retrans: None,
            ack: None,
        }
    }

    pub fn is_retrans_pending(&self) -> bool {
        self.retrans.is_some()
    }

    pub fn is_ack_pending(&self) -> bool {
        self.ack.is_some()
    }

    pub fn retrans(&self) -> Option<&RetransEntry> {
        self.retrans.as_ref()
    }

    pub fn retrans_mut(&mut self) -> Option<&mut RetransEntry> {
        self.retrans.as_mut()
    }

    pub fn set_retrans(&mut self, entry: RetransEntry) -> Result<(), Error> {
        if self.retrans.is_some() {
            Err(ErrorCode::InvalidState)?;
        }

        self.retrans = Some(entry);

        Ok(())
    }

    /// Drop the pending retransmission, cancelling its timer
    pub fn clear_retrans(&mut self) {
        self.retrans = None;
    }

    /// Take the pending acknowledgement so that it can be piggybacked on an outgoing message
    pub fn take_ack(&mut self) -> Option<u32> {
        self.ack.take().map(|ack| ack.msg_ctr())
    }

    /// Process the acknowledgement carried by a received message.
    ///
    /// Returns `true` if it acknowledged our pending message.
    pub fn on_ack(&mut self, ack_msg_ctr: u32) -> bool {
        match &self.retrans {
            Some(entry) if entry.msg_ctr() == ack_msg_ctr => {
                self.retrans = None;
                true
            }
            Some(entry) => {
                // A retransmission by the peer of a message acknowledging something we sent earlier
                warn!(
                    "Ack for {:x} does not match the pending message {:x}, ignoring",
                    ack_msg_ctr,
                    entry.msg_ctr()
                );
                false
            }
            None => false,
        }
    }

    /// Record that a received reliable message needs an acknowledgement.
    ///
    /// If an older acknowledgement was still pending, its counter is returned
    /// and has to be sent right away as a standalone acknowledgement.
    pub fn on_reliable_rx(&mut self, msg_ctr: u32, token: CancellationToken) -> Option<u32> {
        let prev = self.ack.replace(AckEntry::new(msg_ctr, token));

        prev.map(|prev| {
            error!(
                "Acknowledgement for {:x} still pending, flushing it",
                prev.msg_ctr()
            );
            prev.msg_ctr()
        })
    }

    pub fn clear(&mut self) {
        self.retrans = None;
        self.ack = None;
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;

    #[test]
    fn backoff_schedule() {
        let config = MrpConfig::new();
        let i = Duration::from_millis(300);

        assert_eq!(config.backoff(i, 0, 0), Duration::from_millis(330));
        assert_eq!(config.backoff(i, 1, 0), Duration::from_millis(330));
        assert_eq!(config.backoff(i, 2, 0), Duration::from_millis(528));
        assert_eq!(config.backoff(i, 3, 0), Duration::from_millis(844));

        // Maximum jitter adds just under 25%
        assert_eq!(config.backoff(i, 0, 255), Duration::from_millis(330 + 82));
    }

    #[test]
    fn backoff_is_configurable() {
        let config = MrpConfig {
            backoff_margin_permille: 1000,
            backoff_base_permille: 2000,
            backoff_threshold: 0,
            ..MrpConfig::new()
        };

        assert_eq!(
            config.backoff(Duration::from_millis(100), 3, 0),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn active_vs_idle() {
        let config = MrpConfig::new();
        let now = Duration::from_secs(100);

        assert_eq!(
            config.base_interval(None, None, now),
            Duration::from_millis(500)
        );
        assert_eq!(
            config.base_interval(None, Some(now - Duration::from_secs(1)), now),
            Duration::from_millis(300)
        );
        assert_eq!(
            config.base_interval(None, Some(now - Duration::from_secs(5)), now),
            Duration::from_millis(500)
        );

        let peer = SessionParameters {
            idle_retrans_interval: Some(Duration::from_millis(5000)),
            active_retrans_interval: None,
            active_threshold: None,
        };
        assert_eq!(
            config.base_interval(Some(&peer), None, now),
            Duration::from_millis(5000)
        );
    }

    #[test]
    fn retransmission_budget() {
        let mut entry = RetransEntry::new(7, vec![1, 2, 3], CancellationToken::new());

        for _ in 1..5 {
            entry.pre_resend(5, CancellationToken::new()).unwrap();
        }
        assert_eq!(entry.tx_count(), 5);
        assert_eq!(
            entry.pre_resend(5, CancellationToken::new()).unwrap_err().code(),
            ErrorCode::TransportFailure
        );
    }

    #[test]
    fn ack_clears_matching_retrans_only() {
        let token = CancellationToken::new();
        let mut rm = ReliableMessage::new();
        rm.set_retrans(RetransEntry::new(10, vec![0], token.clone()))
            .unwrap();

        assert!(!rm.on_ack(9));
        assert!(rm.is_retrans_pending());
        assert!(!token.is_cancelled());

        assert!(rm.on_ack(10));
        assert!(!rm.is_retrans_pending());
        assert!(token.is_cancelled());
    }

    #[test]
    fn pending_ack_is_piggybacked_once() {
        let token = CancellationToken::new();
        let mut rm = ReliableMessage::new();

        assert_eq!(rm.on_reliable_rx(33, token.clone()), None);
        assert!(rm.is_ack_pending());
        assert_eq!(rm.on_reliable_rx(34, CancellationToken::new()), Some(33));
        assert!(token.is_cancelled());

        assert_eq!(rm.take_ack(), Some(34));
        assert_eq!(rm.take_ack(), None);
    }
}
