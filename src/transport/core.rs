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

//! The transport manager: ties sessions, handshakes, MRP and exchanges together.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use core::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::error::{Error, ErrorCode};
use crate::persist::KvStore;
use crate::secure_channel::case::{CaseInitiator, CaseResponder};
use crate::secure_channel::common::{sc_write, OpCode, SCStatusCodes, PROTO_ID_SECURE_CHANNEL};
use crate::secure_channel::credentials::{FabricTable, LocalFabric};
use crate::secure_channel::handshake::{
    Handshake, HandshakeAction, HandshakeActions, HandshakeDelegate, HandshakeEnv, HandshakeKind,
    NewSessionData,
};
use crate::secure_channel::pake::{PaseProver, PaseVerifier};
use crate::secure_channel::spake2p::{VerifierData, SPAKE2_ITERATION_COUNT};
use crate::secure_channel::status_report::StatusReport;
use crate::utils::epoch::Epoch;
use crate::utils::rand::Rand;

use super::dedup::RxVerdict;
use super::exchange::{
    CloseReason, Exchange, ExchangeContext, ExchangeDelegate, ExchangeHandle, ExchangeOwner,
    MessageMeta, Role, UnsolicitedHandler,
};
use super::mrp::{MrpConfig, RetransEntry, SessionParameters};
use super::msg_ctr::PersistedCounter;
use super::network::{Address, NetworkReceive, NetworkSend, MAX_RX_BUF_SIZE};
use super::packet::{encode_tx, RxPacket};
use super::plain_hdr::PlainHdr;
use super::proto_hdr::ProtoHdr;
use super::session::{
    Session, SessionHandle, SessionHolder, SessionMode, SessionState, SessionTable, MAX_EXCHANGES,
    MAX_SESSIONS,
};
use super::session_crypto::SessionRole;
use super::timer::{CancellationToken, TimerQueue};

/// Tunables of a [`TransportMgr`]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Capped at [`MAX_SESSIONS`]
    pub max_sessions: usize,
    /// Capped at [`MAX_EXCHANGES`]
    pub max_exchanges_per_session: usize,
    pub mrp: MrpConfig,
    /// Default response timeout of the exchanges we initiate. `None` waits forever.
    pub response_timeout: Option<Duration>,
    /// A handshake not complete after this long is abandoned
    pub handshake_timeout: Duration,
    /// PBKDF2 iterations used when a commissioning window is opened from a passcode
    pub pase_iterations: u32,
    /// Minimum wait advertised to peers turned away with Busy
    pub busy_wait: Duration,
    /// MRP parameters advertised to peers during session establishment
    pub local_params: SessionParameters,
}

impl Default for TransportConfig {
    fn default() -> Self {
        let mrp = MrpConfig::default();
        let local_params = SessionParameters::from(&mrp);

        Self {
            max_sessions: MAX_SESSIONS,
            max_exchanges_per_session: MAX_EXCHANGES,
            mrp,
            response_timeout: Some(Duration::from_secs(30)),
            handshake_timeout: Duration::from_secs(60),
            pase_iterations: SPAKE2_ITERATION_COUNT,
            busy_wait: Duration::from_millis(500),
            local_params,
        }
    }
}

/// Traffic counters, mostly useful to tests and diagnostics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransportStats {
    pub rx_messages: u64,
    /// Messages dropped for any reason, duplicates excluded
    pub rx_dropped: u64,
    pub rx_duplicates: u64,
    pub rx_auth_failures: u64,
    pub tx_messages: u64,
    pub tx_failures: u64,
    pub retransmissions: u64,
    pub standalone_acks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerEvent {
    Retransmit(ExchangeHandle),
    StandaloneAck(ExchangeHandle),
    ResponseTimeout(ExchangeHandle),
    HandshakeTimeout(u32),
}

struct HandshakeSlot {
    machine: Box<dyn Handshake>,
    role: Role,
    peer: Address,
    /// The encrypted session reserved for the outcome
    session: SessionHandle,
    /// The exchange the handshake runs on, over an unsecured session
    exchange: ExchangeHandle,
    /// `None` for responders; those report to the incoming session delegate
    delegate: Option<Box<dyn HandshakeDelegate>>,
    timeout: CancellationToken,
}

enum Target {
    App,
    Handshake(u32),
    Detached,
}

/// The Matter transport.
///
/// Owns the session table, all exchanges, the in-flight handshakes and the
/// timers driving MRP. Not thread-safe: a single event loop feeds it received
/// datagrams with [`TransportMgr::handle_rx`] and wakes it up at
/// [`TransportMgr::next_deadline`] to call [`TransportMgr::poll_timers`].
pub struct TransportMgr {
    config: TransportConfig,
    epoch: Epoch,
    rand: Rand,
    network: Box<dyn NetworkSend>,
    store: Box<dyn KvStore>,
    unsec_ctr: PersistedCounter,
    sessions: SessionTable,
    exchanges: BTreeMap<ExchangeHandle, Exchange>,
    next_exchange: u32,
    next_exch_id: u16,
    timers: TimerQueue<TimerEvent>,
    handshakes: BTreeMap<u32, HandshakeSlot>,
    next_handshake: u32,
    fabrics: FabricTable,
    pase_verifier: Option<VerifierData>,
    incoming: Option<Box<dyn HandshakeDelegate>>,
    unsolicited: BTreeMap<u16, Box<dyn UnsolicitedHandler>>,
    // Closes of exchanges whose delegate was out for a callback at the time
    orphan_closes: Vec<(ExchangeHandle, CloseReason)>,
    stats: TransportStats,
}

impl TransportMgr {
    pub fn new(
        config: TransportConfig,
        epoch: Epoch,
        rand: Rand,
        network: Box<dyn NetworkSend>,
        mut store: Box<dyn KvStore>,
    ) -> Result<Self, Error> {
        let unsec_ctr = PersistedCounter::load(&mut *store, rand)?;

        let mut exch_id = [0; 2];
        rand(&mut exch_id);

        let sessions = SessionTable::new(config.max_sessions);

        Ok(Self {
            config,
            epoch,
            rand,
            network,
            store,
            unsec_ctr,
            sessions,
            exchanges: BTreeMap::new(),
            next_exchange: 0,
            next_exch_id: u16::from_le_bytes(exch_id),
            timers: TimerQueue::new(),
            handshakes: BTreeMap::new(),
            next_handshake: 0,
            fabrics: FabricTable::new(),
            pase_verifier: None,
            incoming: None,
            unsolicited: BTreeMap::new(),
            orphan_closes: Vec::new(),
            stats: TransportStats::default(),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn stats(&self) -> TransportStats {
        self.stats
    }

    pub fn fabrics(&self) -> &FabricTable {
        &self.fabrics
    }

    pub fn add_fabric(&mut self, fabric: LocalFabric) -> Result<u8, Error> {
        let idx = self.fabrics.add(fabric)?;
        info!("Added fabric {}", idx);

        Ok(idx)
    }

    pub fn remove_fabric(&mut self, fabric_idx: u8) -> Option<LocalFabric> {
        self.fabrics.remove(fabric_idx)
    }

    /// Accept incoming PASE requests, verifying them against `verifier`
    pub fn set_pase_verifier(&mut self, verifier: VerifierData) {
        info!("Accepting PASE requests");
        self.pase_verifier = Some(verifier);
    }

    /// Accept incoming PASE requests for `passcode`, with a freshly salted verifier
    pub fn set_pase_passcode(&mut self, passcode: u32) -> Result<(), Error> {
        let verifier = VerifierData::new_with_pw(passcode, self.config.pase_iterations, self.rand)?;
        self.set_pase_verifier(verifier);

        Ok(())
    }

    pub fn clear_pase_verifier(&mut self) {
        if self.pase_verifier.take().is_some() {
            info!("No longer accepting PASE requests");
        }
    }

    /// Set the delegate told about sessions established by peers
    pub fn set_incoming_session_delegate(&mut self, delegate: Box<dyn HandshakeDelegate>) {
        self.incoming = Some(delegate);
    }

    /// Route the unsolicited messages of `proto_id` to `handler`
    pub fn register_unsolicited(
        &mut self,
        proto_id: u16,
        handler: Box<dyn UnsolicitedHandler>,
    ) -> Result<(), Error> {
        if proto_id == PROTO_ID_SECURE_CHANNEL {
            Err(ErrorCode::InvalidProto)?;
        }

        self.unsolicited.insert(proto_id, handler);

        Ok(())
    }

    pub fn session(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions.get(handle)
    }

    pub fn session_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.sessions.get_mut(handle)
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.iter()
    }

    pub fn find_session(&self, local_sess_id: u16) -> Option<SessionHandle> {
        self.sessions.find(local_sess_id)
    }

    pub fn session_holder(&mut self, handle: SessionHandle) -> Result<SessionHolder, Error> {
        self.sessions.holder(handle)
    }

    /// Stop all traffic on a session. Its exchanges are closed, and it is
    /// evicted once nothing holds on to it anymore.
    pub fn mark_defunct(&mut self, handle: SessionHandle) -> bool {
        if !self.sessions.mark_defunct(handle) {
            return false;
        }

        self.release_session_state(handle);
        self.reap_sessions();

        true
    }

    /// Destroy a session right away
    pub fn evict_session(&mut self, handle: SessionHandle) -> bool {
        info!("Evicting session {}", handle);

        self.release_session_state(handle);
        self.sessions.evict(handle).is_some()
    }

    /// Tell the peer we are done with a session, then mark it defunct
    pub fn close_session(&mut self, handle: SessionHandle) -> Result<(), Error> {
        let session = self.sessions.get(handle).ok_or(ErrorCode::NoSession)?;

        if session.is_active() && session.is_encrypted() {
            if let Err(e) = self.send_close_session(handle) {
                warn!("Failed to send CloseSession on {}: {}", handle, e);
            }
        }

        self.mark_defunct(handle);

        Ok(())
    }

    /// Start a PASE handshake with `peer`. The outcome is reported to `delegate`.
    pub fn establish_pase(
        &mut self,
        peer: Address,
        passcode: u32,
        delegate: Box<dyn HandshakeDelegate>,
    ) -> Result<(), Error> {
        self.initiate(
            peer,
            Box::new(PaseProver::new(passcode)),
            SessionMode::Pase,
            delegate,
        )
    }

    /// Start a CASE handshake with node `peer_node_id` of our fabric `fabric_idx`.
    ///
    /// A resumption is attempted if a resumption record for that node exists.
    pub fn establish_case(
        &mut self,
        peer: Address,
        fabric_idx: u8,
        peer_node_id: u64,
        delegate: Box<dyn HandshakeDelegate>,
    ) -> Result<(), Error> {
        if self.fabrics.get(fabric_idx).is_none() {
            Err(ErrorCode::NotFound)?;
        }

        self.initiate(
            peer,
            Box::new(CaseInitiator::new(fabric_idx, peer_node_id)),
            SessionMode::Case { fabric_idx },
            delegate,
        )
    }

    /// Open an exchange on an established session
    pub fn new_exchange(
        &mut self,
        session: SessionHandle,
        delegate: Box<dyn ExchangeDelegate>,
    ) -> Result<ExchangeHandle, Error> {
        let sess = self.sessions.get(session).ok_or(ErrorCode::NoSession)?;
        if !sess.is_active() || !sess.is_encrypted() {
            Err(ErrorCode::InvalidState)?;
        }

        let exch_id = self.alloc_exch_id();

        self.add_exchange(
            session,
            exch_id,
            Role::Initiator,
            ExchangeOwner::App(Some(delegate)),
            self.config.response_timeout,
        )
    }

    pub fn exchange_session(&self, exchange: ExchangeHandle) -> Option<SessionHandle> {
        self.exchanges.get(&exchange).map(|exch| exch.session)
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.len()
    }

    /// Send an application message on an open exchange
    pub fn send_message(
        &mut self,
        exchange: ExchangeHandle,
        meta: MessageMeta,
        payload: &[u8],
    ) -> Result<(), Error> {
        let exch = self
            .exchanges
            .get(&exchange)
            .filter(|exch| !exch.closing)
            .ok_or(ErrorCode::InvalidState)?;

        if !matches!(exch.owner, ExchangeOwner::App(_)) || meta.is_standalone_ack() {
            Err(ErrorCode::InvalidState)?;
        }

        self.send_on_exchange(exchange, meta, payload)
    }

    /// Change the response timeout of an exchange. `None` disables it.
    pub fn set_response_timeout(
        &mut self,
        exchange: ExchangeHandle,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        let exch = self
            .exchanges
            .get_mut(&exchange)
            .filter(|exch| !exch.closing)
            .ok_or(ErrorCode::InvalidState)?;

        exch.response_timeout = timeout;
        if timeout.is_none() {
            exch.set_response_timer(None);
        }

        Ok(())
    }

    /// Close an exchange. A pending acknowledgement is flushed and a message
    /// still awaiting its acknowledgement keeps being retransmitted.
    pub fn close_exchange(&mut self, exchange: ExchangeHandle) {
        self.close_exchange_with(exchange, CloseReason::Closed);
    }

    /// When [`TransportMgr::poll_timers`] needs to be called next
    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    pub fn poll_timers(&mut self) {
        let now = (self.epoch)();

        while let Some(event) = self.timers.pop_expired(now) {
            match event {
                TimerEvent::Retransmit(exch) => self.on_retransmit(exch, now),
                TimerEvent::StandaloneAck(exch) => self.flush_ack(exch),
                TimerEvent::ResponseTimeout(exch) => self.on_response_timeout(exch),
                TimerEvent::HandshakeTimeout(slot) => {
                    self.handshake_failed(slot, ErrorCode::Timeout.into(), CloseReason::ResponseTimeout)
                }
            }
        }

        self.timers.purge();
        self.reap_sessions();
    }

    /// Drain all pending datagrams from `network`
    pub fn process_rx<R>(&mut self, network: &mut R) -> Result<usize, Error>
    where
        R: NetworkReceive,
    {
        let mut buf = vec![0; MAX_RX_BUF_SIZE];
        let mut count = 0;

        while let Some((len, peer)) = network.recv_from(&mut buf)? {
            self.handle_rx(peer, &mut buf[..len]);
            count += 1;
        }

        Ok(count)
    }

    /// Process one received datagram. The buffer is decrypted in place.
    pub fn handle_rx(&mut self, peer: Address, buf: &mut [u8]) {
        self.stats.rx_messages += 1;

        if let Err(e) = self.rx(peer, buf) {
            self.stats.rx_dropped += 1;
            if e.is_auth_failure() {
                self.stats.rx_auth_failures += 1;
            }

            warn!("Dropping message from {}: {}", peer, e);
        }

        self.reap_sessions();
    }

    fn rx(&mut self, peer: Address, buf: &mut [u8]) -> Result<(), Error> {
        let now = (self.epoch)();

        let mut rx = RxPacket::new(peer, buf);
        rx.plain_hdr_decode()?;

        if rx.plain.is_group_session() {
            debug!("Group messages are not supported");
            Err(ErrorCode::NoSession)?;
        }

        let sess = if rx.plain.is_encrypted() {
            let sess = self
                .sessions
                .find(rx.plain.sess_id)
                .ok_or(ErrorCode::NoSession)?;
            let session = self.sessions.get(sess).ok_or(ErrorCode::NoSession)?;

            if !session.is_active() || !session.is_encrypted() {
                debug!("Session {} is not active", sess);
                Err(ErrorCode::NoSession)?;
            }

            rx.decrypt(session.crypto(), session.peer_nodeid().unwrap_or(0))?;
            rx.proto_hdr_decode()?;

            sess
        } else {
            rx.proto_hdr_decode()?;

            match self.sessions.find_plain(&peer, &rx.plain) {
                Some(sess) => sess,
                None if opens_handshake(&rx.proto) => self.new_plain_session(
                    SessionRole::Responder,
                    peer,
                    0,
                    rx.plain.get_src_nodeid(),
                )?,
                None => {
                    self.send_ephemeral_ack(None, peer, &rx.plain, &rx.proto);
                    Err(ErrorCode::NoSession)?
                }
            }
        };

        trace!(
            "Rx from {} on {}: {:?} {:?}",
            peer,
            sess,
            rx.plain,
            rx.proto
        );

        let session = self.sessions.get_mut(sess).ok_or(ErrorCode::NoSession)?;
        match session.post_recv_ctr(rx.plain.ctr) {
            RxVerdict::Accept => session.touch_rx(now),
            RxVerdict::Duplicate => {
                debug!("Duplicate message {:x} on {}", rx.plain.ctr, sess);
                self.stats.rx_duplicates += 1;
                self.send_ephemeral_ack(Some(sess), peer, &rx.plain, &rx.proto);

                return Ok(());
            }
            RxVerdict::Stale => Err(ErrorCode::StaleCounter)?,
        }

        let meta = MessageMeta::from(&rx.proto);
        let found = self.find_exchange(sess, &rx.proto);

        if let (Some(exch), Some(ack)) = (found, rx.proto.get_ack()) {
            self.on_ack(exch, ack);
        }

        let exch = match found.filter(|exch| self.exchanges.contains_key(exch)) {
            Some(exch) => exch,
            None if rx.proto.is_initiator() && !meta.is_standalone_ack() => {
                match self.accept_unsolicited(sess, &meta, &rx.plain, &rx.proto, rx.payload()) {
                    Some(exch) => exch,
                    None => return Ok(()),
                }
            }
            None => {
                if !meta.is_standalone_ack() {
                    debug!("No exchange for {} on {}", meta, sess);
                }
                self.send_ephemeral_ack(Some(sess), peer, &rx.plain, &rx.proto);

                return Ok(());
            }
        };

        if rx.proto.is_reliable() {
            self.schedule_ack(exch, rx.plain.ctr, now);
        }

        if meta.is_standalone_ack() {
            return Ok(());
        }

        if let Some(exchange) = self.exchanges.get_mut(&exch) {
            exchange.set_response_timer(None);
        }

        self.deliver(exch, &meta, rx.payload());

        Ok(())
    }

    fn accept_unsolicited(
        &mut self,
        sess: SessionHandle,
        meta: &MessageMeta,
        rx_plain: &PlainHdr,
        rx_proto: &ProtoHdr,
        payload: &[u8],
    ) -> Option<ExchangeHandle> {
        let session = self.sessions.get(sess)?;
        let encrypted = session.is_encrypted();
        let peer = session.peer_addr();

        let owner = if meta.is_sc() {
            match meta.opcode::<OpCode>() {
                Ok(opcode) if opcode.is_handshake_start() && !encrypted => ExchangeOwner::Detached,
                Ok(OpCode::StatusReport) if encrypted => {
                    self.send_ephemeral_ack(Some(sess), peer, rx_plain, rx_proto);
                    self.on_session_status(sess, payload);

                    return None;
                }
                _ => {
                    debug!("Unsolicited {} on {} dropped", meta, sess);
                    self.send_ephemeral_ack(Some(sess), peer, rx_plain, rx_proto);

                    return None;
                }
            }
        } else if !encrypted {
            warn!("Application message {} on an unsecured session, dropping", meta);

            return None;
        } else {
            let delegate = self
                .unsolicited
                .get_mut(&meta.proto_id)
                .and_then(|handler| handler.on_unsolicited(meta, sess));

            match delegate {
                Some(delegate) => ExchangeOwner::App(Some(delegate)),
                None => {
                    warn!("No handler for unsolicited {} on {}", meta, sess);
                    self.send_ephemeral_ack(Some(sess), peer, rx_plain, rx_proto);

                    return None;
                }
            }
        };

        match self.add_exchange(sess, rx_proto.exch_id, Role::Responder, owner, None) {
            Ok(exch) => Some(exch),
            Err(e) => {
                warn!("Cannot accept exchange {} on {}: {}", rx_proto.exch_id, sess, e);
                None
            }
        }
    }

    fn on_session_status(&mut self, sess: SessionHandle, payload: &[u8]) {
        let Ok(report) = StatusReport::read(payload) else {
            warn!("Malformed status report on {}", sess);
            return;
        };

        if report.proto_id == PROTO_ID_SECURE_CHANNEL as u32
            && report.proto_code == SCStatusCodes::CloseSession as u16
        {
            info!("Peer closed session {}", sess);
            self.mark_defunct(sess);
        } else {
            debug!("Ignoring status report {:?} on {}", report, sess);
        }
    }

    fn deliver(&mut self, exch: ExchangeHandle, meta: &MessageMeta, payload: &[u8]) {
        let Some(exchange) = self.exchanges.get(&exch) else {
            return;
        };

        if exchange.closing {
            debug!("Exchange {} is closing, dropping {}", exchange, meta);
            return;
        }

        let target = match &exchange.owner {
            ExchangeOwner::App(_) => Target::App,
            ExchangeOwner::Handshake(slot) => Target::Handshake(*slot),
            ExchangeOwner::Detached => Target::Detached,
        };

        match target {
            Target::App => self.dispatch(exch, |delegate, ctx| {
                if let Err(e) = delegate.on_message_received(ctx, meta, payload) {
                    warn!("Exchange {}: handler failed: {}", exch, e);
                }
            }),
            Target::Handshake(slot) => self.handshake_rx(slot, meta, payload),
            Target::Detached => self.start_responder(exch, meta, payload),
        }
    }

    /// Call into the delegate of `exch` with a context giving it access to the manager
    fn dispatch<F>(&mut self, exch: ExchangeHandle, f: F)
    where
        F: FnOnce(&mut dyn ExchangeDelegate, &mut ExchangeContext),
    {
        let Some(mut delegate) = self.exchanges.get_mut(&exch).and_then(Exchange::take_delegate)
        else {
            return;
        };

        f(delegate.as_mut(), &mut ExchangeContext::new(self, exch));

        if let Some(pos) = self.orphan_closes.iter().position(|(e, _)| *e == exch) {
            let (_, reason) = self.orphan_closes.swap_remove(pos);
            delegate.on_exchange_closing(reason);
        } else if let Some(exchange) = self.exchanges.get_mut(&exch) {
            exchange.restore_delegate(delegate);
        }
    }

    fn find_exchange(&self, sess: SessionHandle, rx_proto: &ProtoHdr) -> Option<ExchangeHandle> {
        self.sessions.get(sess)?.exchanges.iter().copied().find(|exch| {
            self.exchanges
                .get(exch)
                .map(|exchange| exchange.is_for_rx(sess, rx_proto))
                .unwrap_or(false)
        })
    }

    fn alloc_exch_id(&mut self) -> u16 {
        self.next_exch_id = self.next_exch_id.wrapping_add(1);
        self.next_exch_id
    }

    fn add_exchange(
        &mut self,
        sess: SessionHandle,
        exch_id: u16,
        role: Role,
        owner: ExchangeOwner,
        response_timeout: Option<Duration>,
    ) -> Result<ExchangeHandle, Error> {
        let limit = self.config.max_exchanges_per_session.min(MAX_EXCHANGES);
        let session = self.sessions.get_mut(sess).ok_or(ErrorCode::NoSession)?;

        if session.exchanges.len() >= limit {
            warn!("No space for a new exchange on {}", sess);
            Err(ErrorCode::NoSpaceExchanges)?;
        }

        self.next_exchange = self.next_exchange.wrapping_add(1);
        let handle = ExchangeHandle::new(self.next_exchange);

        session
            .exchanges
            .push(handle)
            .map_err(|_| ErrorCode::NoSpaceExchanges)?;

        let exchange = Exchange::new(handle, exch_id, role, sess, owner, response_timeout);
        debug!("New exchange {}", exchange);

        self.exchanges.insert(handle, exchange);

        Ok(handle)
    }

    fn remove_exchange(&mut self, exch: ExchangeHandle) {
        let Some(exchange) = self.exchanges.remove(&exch) else {
            return;
        };

        debug!("Removing exchange {}", exchange);

        if let Some(session) = self.sessions.get_mut(exchange.session) {
            session.exchanges.retain(|e| *e != exch);

            // Unsecured sessions only live as long as the handshake using them
            if !session.is_encrypted() && session.exchanges.is_empty() {
                self.sessions.mark_defunct(exchange.session);
            }
        }
    }

    fn close_exchange_with(&mut self, exch: ExchangeHandle, reason: CloseReason) {
        let Some(exchange) = self.exchanges.get_mut(&exch) else {
            return;
        };

        if exchange.closing {
            if reason != CloseReason::Closed {
                self.remove_exchange(exch);
            }

            return;
        }

        exchange.closing = true;
        exchange.set_response_timer(None);

        let owner = core::mem::replace(&mut exchange.owner, ExchangeOwner::Detached);
        let graceful = reason == CloseReason::Closed;
        let linger = graceful && exchange.mrp.is_retrans_pending();

        if graceful {
            self.flush_ack(exch);
        }

        if linger {
            debug!("Exchange {} closing, waiting for the last acknowledgement", exch);
        } else {
            self.remove_exchange(exch);
        }

        match owner {
            ExchangeOwner::App(Some(mut delegate)) => delegate.on_exchange_closing(reason),
            ExchangeOwner::App(None) => self.orphan_closes.push((exch, reason)),
            ExchangeOwner::Handshake(slot) => {
                if self.handshakes.contains_key(&slot) {
                    self.handshake_failed(slot, reason.as_error(), reason);
                }
            }
            ExchangeOwner::Detached => (),
        }
    }

    fn on_ack(&mut self, exch: ExchangeHandle, ack: u32) {
        let Some(exchange) = self.exchanges.get_mut(&exch) else {
            return;
        };

        if exchange.mrp.on_ack(ack) {
            trace!("Exchange {}: {:x} acknowledged", exch, ack);

            if exchange.closing {
                self.flush_ack(exch);
                self.remove_exchange(exch);
            }
        }
    }

    fn schedule_ack(&mut self, exch: ExchangeHandle, ctr: u32, now: Duration) {
        let Some(exchange) = self.exchanges.get_mut(&exch) else {
            return;
        };

        let token = self.timers.schedule_after(
            now,
            self.config.mrp.standalone_ack_timeout,
            TimerEvent::StandaloneAck(exch),
        );

        if let Some(prev) = exchange.mrp.on_reliable_rx(ctr, token) {
            self.send_standalone_ack(exch, prev);
        }
    }

    fn flush_ack(&mut self, exch: ExchangeHandle) {
        if let Some(ack) = self
            .exchanges
            .get_mut(&exch)
            .and_then(|exchange| exchange.mrp.take_ack())
        {
            self.send_standalone_ack(exch, ack);
        }
    }

    fn send_standalone_ack(&mut self, exch: ExchangeHandle, ack: u32) {
        let Some(exchange) = self.exchanges.get(&exch) else {
            return;
        };

        let mut proto = ProtoHdr::new();
        proto.exch_id = exchange.exch_id;
        proto.set_initiator(exchange.role.is_initiator());
        OpCode::MRPStandAloneAck.meta().set_into(&mut proto);
        proto.set_ack(Some(ack));

        let sess = exchange.session;
        let result = match self.sessions.get_mut(sess) {
            Some(session) => encode_for(session, &proto, &[], &mut self.unsec_ctr, &mut *self.store)
                .and_then(|(_, data)| self.network.send_to(&data, session.peer_addr())),
            None => Err(ErrorCode::NoSession.into()),
        };

        match result {
            Ok(()) => {
                trace!("Exchange {}: standalone ack for {:x}", exch, ack);
                self.stats.standalone_acks += 1;
            }
            Err(e) => {
                self.stats.tx_failures += 1;
                warn!("Exchange {}: failed to acknowledge {:x}: {}", exch, ack, e);

                self.retire_if_exhausted(sess, &e);
            }
        }
    }

    /// Acknowledge a reliable message which has no exchange to go with
    fn send_ephemeral_ack(
        &mut self,
        sess: Option<SessionHandle>,
        peer: Address,
        rx_plain: &PlainHdr,
        rx_proto: &ProtoHdr,
    ) {
        if !rx_proto.is_reliable() {
            return;
        }

        let mut proto = ProtoHdr::new();
        proto.exch_id = rx_proto.exch_id;
        proto.set_initiator(!rx_proto.is_initiator());
        OpCode::MRPStandAloneAck.meta().set_into(&mut proto);
        proto.set_ack(Some(rx_plain.ctr));

        let data = match sess.and_then(|sess| self.sessions.get_mut(sess)) {
            Some(session) => {
                encode_for(session, &proto, &[], &mut self.unsec_ctr, &mut *self.store).map(|(_, data)| data)
            }
            None => self.unsec_ctr.next(&mut *self.store).and_then(|ctr| {
                let mut plain = PlainHdr::new();
                plain.ctr = ctr;
                plain.set_src_nodeid(rx_plain.get_dst_unicast_nodeid());
                plain.set_dst_unicast_nodeid(rx_plain.get_src_nodeid());

                encode_tx(&plain, &proto, &[], None)
            }),
        };

        match data.and_then(|data| self.network.send_to(&data, peer)) {
            Ok(()) => self.stats.standalone_acks += 1,
            Err(e) => {
                warn!("Failed to acknowledge {:x} from {}: {}", rx_plain.ctr, peer, e);

                if let Some(sess) = sess {
                    self.retire_if_exhausted(sess, &e);
                }
            }
        }
    }

    fn send_on_exchange(
        &mut self,
        exch: ExchangeHandle,
        meta: MessageMeta,
        payload: &[u8],
    ) -> Result<(), Error> {
        let sess = self
            .exchanges
            .get(&exch)
            .map(|exchange| exchange.session)
            .ok_or(ErrorCode::InvalidState)?;

        let result = self.tx_on_exchange(exch, meta, payload);

        if let Err(e) = &result {
            self.retire_if_exhausted(sess, e);
        }

        result
    }

    fn tx_on_exchange(
        &mut self,
        exch: ExchangeHandle,
        meta: MessageMeta,
        payload: &[u8],
    ) -> Result<(), Error> {
        let now = (self.epoch)();

        let exchange = self
            .exchanges
            .get_mut(&exch)
            .ok_or(ErrorCode::InvalidState)?;
        let session = self
            .sessions
            .get_mut(exchange.session)
            .ok_or(ErrorCode::NoSession)?;

        if session.state() != SessionState::Active {
            Err(ErrorCode::InvalidState)?;
        }

        let peer = session.peer_addr();
        let reliable = meta.reliable && !peer.is_reliable();

        if reliable && exchange.mrp.is_retrans_pending() {
            error!("Exchange {}: previous message not acknowledged yet", exch);
            Err(ErrorCode::InvalidState)?;
        }

        let mut proto = ProtoHdr::new();
        proto.exch_id = exchange.exch_id;
        proto.set_initiator(exchange.role.is_initiator());
        meta.set_into(&mut proto);
        proto.set_reliable(reliable);
        proto.set_ack(exchange.mrp.take_ack());
        proto.adjust_reliability(false, &peer);

        let (ctr, data) = encode_for(session, &proto, payload, &mut self.unsec_ctr, &mut *self.store)?;

        if reliable {
            let interval =
                self.config
                    .mrp
                    .base_interval(session.peer_params(), session.last_rx(), now);
            let delay = self.config.mrp.backoff(interval, 0, jitter(self.rand));
            let token = self
                .timers
                .schedule_after(now, delay, TimerEvent::Retransmit(exch));

            exchange
                .mrp
                .set_retrans(RetransEntry::new(ctr, data.clone(), token))?;
        }

        if let Some(timeout) = exchange.response_timeout {
            let token = self
                .timers
                .schedule_after(now, timeout, TimerEvent::ResponseTimeout(exch));
            exchange.set_response_timer(Some(token));
        }

        session.touch(now);

        trace!("Tx {} on {} to {}: {:x}", meta, exch, peer, ctr);
        self.stats.tx_messages += 1;

        if let Err(e) = self.network.send_to(&data, peer) {
            self.stats.tx_failures += 1;

            if reliable {
                warn!("Exchange {}: send failed, will retry: {}", exch, e);
            } else {
                return Err(e);
            }
        }

        Ok(())
    }

    fn on_retransmit(&mut self, exch: ExchangeHandle, now: Duration) {
        let Some(exchange) = self.exchanges.get_mut(&exch) else {
            return;
        };
        let Some(session) = self.sessions.get_mut(exchange.session) else {
            return;
        };
        let Some(entry) = exchange.mrp.retrans_mut() else {
            return;
        };

        let interval = self
            .config
            .mrp
            .base_interval(session.peer_params(), session.last_rx(), now);
        let delay = self
            .config
            .mrp
            .backoff(interval, entry.tx_count(), jitter(self.rand));
        let token = self
            .timers
            .schedule_after(now, delay, TimerEvent::Retransmit(exch));

        if entry.pre_resend(self.config.mrp.max_transmissions, token.clone()).is_ok() {
            debug!(
                "Exchange {}: retransmitting {:x} ({}/{})",
                exch,
                entry.msg_ctr(),
                entry.tx_count(),
                self.config.mrp.max_transmissions
            );

            self.stats.retransmissions += 1;
            if let Err(e) = self.network.send_to(entry.data(), session.peer_addr()) {
                self.stats.tx_failures += 1;
                warn!("Exchange {}: retransmission failed: {}", exch, e);
            }

            return;
        }

        token.cancel();

        error!(
            "Exchange {}: {:x} not acknowledged after {} transmissions, giving up",
            exch,
            entry.msg_ctr(),
            entry.tx_count()
        );

        exchange.mrp.clear_retrans();

        let sess = exchange.session;
        let encrypted = session.is_encrypted();

        self.close_exchange_with(exch, CloseReason::TransportFailure);

        if encrypted {
            self.mark_defunct(sess);
        }
    }

    fn on_response_timeout(&mut self, exch: ExchangeHandle) {
        let Some(exchange) = self.exchanges.get_mut(&exch) else {
            return;
        };

        if exchange.closing {
            return;
        }

        exchange.response_timer = None;
        warn!("Exchange {}: response timeout", exch);

        self.dispatch(exch, |delegate, _| delegate.on_response_timeout());
        self.close_exchange_with(exch, CloseReason::ResponseTimeout);
    }

    fn send_close_session(&mut self, sess: SessionHandle) -> Result<(), Error> {
        let (meta, payload) = sc_write(SCStatusCodes::CloseSession, &[])?;
        let exch_id = self.alloc_exch_id();

        let session = self.sessions.get_mut(sess).ok_or(ErrorCode::NoSession)?;

        let mut proto = ProtoHdr::new();
        proto.exch_id = exch_id;
        proto.set_initiator(true);
        meta.set_into(&mut proto);

        let (_, data) = encode_for(session, &proto, &payload, &mut self.unsec_ctr, &mut *self.store)?;

        info!("Closing session {}", sess);

        self.network.send_to(&data, session.peer_addr())
    }

    fn send_sc_status(&mut self, exch: ExchangeHandle, status: SCStatusCodes, data: &[u8]) {
        let result = sc_write(status, data)
            .and_then(|(meta, payload)| self.send_on_exchange(exch, meta, &payload));

        if let Err(e) = result {
            warn!("Exchange {}: failed to send {:?}: {}", exch, status, e);
        }
    }

    fn send_busy(&mut self, exch: ExchangeHandle) {
        let wait = u16::try_from(self.config.busy_wait.as_millis()).unwrap_or(u16::MAX);

        info!("Sending Busy on {}", exch);

        self.send_sc_status(exch, SCStatusCodes::Busy, &wait.to_le_bytes());
        self.close_exchange(exch);
    }

    /// A session which ran out of message counters can never send again
    fn retire_if_exhausted(&mut self, sess: SessionHandle, err: &Error) {
        if err.code() == ErrorCode::CounterExhausted {
            error!("Session {} ran out of message counters", sess);
            self.mark_defunct(sess);
        }
    }

    /// Reserve a session slot, tearing down the least recently active
    /// Defunct session if the table is full
    fn create_session(
        &mut self,
        role: SessionRole,
        mode: SessionMode,
        peer: Address,
        now: Duration,
    ) -> Result<SessionHandle, Error> {
        if self.sessions.is_full() {
            let Some(victim) = self.sessions.get_session_for_eviction() else {
                warn!("Session table full, no Defunct session to evict");
                return Err(ErrorCode::NoSpaceSessions.into());
            };

            self.evict_session(victim);
        }

        self.sessions.create(role, mode, peer, now, self.rand)
    }

    fn new_plain_session(
        &mut self,
        role: SessionRole,
        peer: Address,
        local_nodeid: u64,
        peer_nodeid: Option<u64>,
    ) -> Result<SessionHandle, Error> {
        let now = (self.epoch)();
        let sess = self.create_session(role, SessionMode::PlainText, peer, now)?;

        if let Some(session) = self.sessions.get_mut(sess) {
            session.set_local_nodeid(local_nodeid);
            session.set_peer_nodeid(peer_nodeid);
        }

        Ok(sess)
    }

    fn release_session_state(&mut self, sess: SessionHandle) {
        let exchanges: Vec<ExchangeHandle> = self
            .sessions
            .get(sess)
            .map(|session| session.exchanges.iter().copied().collect())
            .unwrap_or_default();

        for exch in exchanges {
            self.close_exchange_with(exch, CloseReason::SessionReleased);
        }

        let slots: Vec<u32> = self
            .handshakes
            .iter()
            .filter(|(_, slot)| slot.session == sess)
            .map(|(id, _)| *id)
            .collect();

        for slot in slots {
            self.handshake_failed(slot, ErrorCode::NoSession.into(), CloseReason::SessionReleased);
        }
    }

    /// Evict the defunct sessions nobody uses anymore
    fn reap_sessions(&mut self) {
        let victims: Vec<SessionHandle> = self
            .sessions
            .iter()
            .filter(|session| {
                session.state() == SessionState::Defunct
                    && session.exchange_count() == 0
                    && !self.sessions.has_live_holders(session.handle())
            })
            .map(Session::handle)
            .collect();

        for sess in victims {
            self.sessions.evict(sess);
        }
    }

    fn next_handshake_id(&mut self) -> u32 {
        self.next_handshake = self.next_handshake.wrapping_add(1);
        self.next_handshake
    }

    fn initiate(
        &mut self,
        peer: Address,
        machine: Box<dyn Handshake>,
        mode: SessionMode,
        delegate: Box<dyn HandshakeDelegate>,
    ) -> Result<(), Error> {
        let kind = machine.kind();

        if self
            .handshakes
            .values()
            .any(|slot| slot.role == Role::Initiator && slot.peer == peer && slot.machine.kind() == kind)
        {
            warn!("{} with {} already in progress", kind, peer);
            Err(ErrorCode::Busy)?;
        }

        let now = (self.epoch)();
        let session = self.create_session(SessionRole::Initiator, mode, peer, now)?;

        let plain = match self.new_plain_session(
            SessionRole::Initiator,
            peer,
            ephemeral_node_id(self.rand),
            None,
        ) {
            Ok(plain) => plain,
            Err(e) => {
                self.sessions.evict(session);
                return Err(e);
            }
        };

        let id = self.next_handshake_id();
        let exch_id = self.alloc_exch_id();

        let exchange = match self.add_exchange(
            plain,
            exch_id,
            Role::Initiator,
            ExchangeOwner::Handshake(id),
            None,
        ) {
            Ok(exchange) => exchange,
            Err(e) => {
                self.sessions.evict(plain);
                self.sessions.evict(session);
                return Err(e);
            }
        };

        let timeout = self.timers.schedule_after(
            now,
            self.config.handshake_timeout,
            TimerEvent::HandshakeTimeout(id),
        );

        self.handshakes.insert(
            id,
            HandshakeSlot {
                machine,
                role: Role::Initiator,
                peer,
                session,
                exchange,
                delegate: Some(delegate),
                timeout,
            },
        );

        info!("Starting {} with {} for session {}", kind, peer, session);

        let actions = self.run_handshake(id, |machine, env| machine.start(env));
        self.apply_handshake_actions(id, actions);

        Ok(())
    }

    fn start_responder(&mut self, exch: ExchangeHandle, meta: &MessageMeta, payload: &[u8]) {
        let Some(kind) = meta
            .opcode::<OpCode>()
            .ok()
            .and_then(HandshakeKind::from_opening)
        else {
            return;
        };

        let Some(peer) = self
            .exchange_session(exch)
            .and_then(|sess| self.sessions.get(sess))
            .map(Session::peer_addr)
        else {
            return;
        };

        if self
            .handshakes
            .values()
            .any(|slot| slot.role == Role::Responder && slot.peer == peer && slot.machine.kind() == kind)
        {
            warn!("{} with {} already in progress", kind, peer);
            self.send_busy(exch);
            return;
        }

        let machine: Box<dyn Handshake> = match kind {
            HandshakeKind::Pase => match &self.pase_verifier {
                Some(verifier) => Box::new(PaseVerifier::new(verifier.clone())),
                None => {
                    warn!("PASE requested by {}, but no commissioning window is open", peer);
                    self.send_sc_status(exch, SCStatusCodes::InvalidParameter, &[]);
                    self.close_exchange(exch);
                    return;
                }
            },
            HandshakeKind::Case => Box::new(CaseResponder::new()),
        };

        let mode = match kind {
            HandshakeKind::Pase => SessionMode::Pase,
            // The fabric is only known once Sigma1 is processed
            HandshakeKind::Case => SessionMode::Case { fabric_idx: 0 },
        };

        let now = (self.epoch)();
        let session = match self.create_session(SessionRole::Responder, mode, peer, now) {
            Ok(session) => session,
            Err(e) => {
                warn!("Cannot reserve a session for {} with {}: {}", kind, peer, e);
                self.send_busy(exch);
                return;
            }
        };

        let id = self.next_handshake_id();

        if let Some(exchange) = self.exchanges.get_mut(&exch) {
            exchange.owner = ExchangeOwner::Handshake(id);
        }

        let timeout = self.timers.schedule_after(
            now,
            self.config.handshake_timeout,
            TimerEvent::HandshakeTimeout(id),
        );

        self.handshakes.insert(
            id,
            HandshakeSlot {
                machine,
                role: Role::Responder,
                peer,
                session,
                exchange: exch,
                delegate: None,
                timeout,
            },
        );

        debug!("{} requested by {}, reserved session {}", kind, peer, session);

        self.handshake_rx(id, meta, payload);
    }

    fn handshake_rx(&mut self, id: u32, meta: &MessageMeta, payload: &[u8]) {
        let opcode = match meta.opcode::<OpCode>() {
            Ok(opcode) if meta.is_sc() => opcode,
            _ => {
                warn!("Unexpected {} on a handshake exchange", meta);
                return;
            }
        };

        let actions = self.run_handshake(id, |machine, env| machine.handle(opcode, payload, env));
        self.apply_handshake_actions(id, actions);
    }

    fn run_handshake<F>(&mut self, id: u32, f: F) -> HandshakeActions
    where
        F: FnOnce(&mut dyn Handshake, &mut HandshakeEnv) -> HandshakeActions,
    {
        let Some(slot) = self.handshakes.get_mut(&id) else {
            return HandshakeActions::new();
        };

        let mut env = HandshakeEnv {
            rand: self.rand,
            store: &mut *self.store,
            fabrics: &self.fabrics,
            local_params: self.config.local_params.clone(),
            local_sess_id: slot.session.local_sess_id(),
        };

        f(slot.machine.as_mut(), &mut env)
    }

    fn apply_handshake_actions(&mut self, id: u32, actions: HandshakeActions) {
        for action in actions {
            match action {
                HandshakeAction::Send { opcode, payload } => {
                    self.handshake_send(id, opcode.meta(), &payload)
                }
                HandshakeAction::SendStatus(status) => match sc_write(status, &[]) {
                    Ok((meta, payload)) => self.handshake_send(id, meta, &payload),
                    Err(e) => error!("Cannot encode {:?}: {}", status, e),
                },
                HandshakeAction::Established(data) => self.handshake_established(id, *data),
                HandshakeAction::Failed(e) => self.handshake_failed(id, e, CloseReason::Closed),
            }
        }
    }

    fn handshake_send(&mut self, id: u32, meta: MessageMeta, payload: &[u8]) {
        let Some(exch) = self.handshakes.get(&id).map(|slot| slot.exchange) else {
            return;
        };

        if let Err(e) = self.send_on_exchange(exch, meta, payload) {
            error!("Handshake {}: failed to send {}: {}", id, meta, e);
            self.handshake_failed(id, e, CloseReason::TransportFailure);
        }
    }

    fn handshake_established(&mut self, id: u32, data: NewSessionData) {
        let Some(mut slot) = self.handshakes.remove(&id) else {
            return;
        };

        slot.timeout.cancel();

        let now = (self.epoch)();
        let result = match self.sessions.get_mut(slot.session) {
            Some(session) => session.set_mode(data.mode).and_then(|_| {
                session.activate(
                    data.peer_sess_id,
                    data.peer_nodeid,
                    data.local_nodeid,
                    (data.i2r_key(), data.r2i_key(), data.att_challenge()),
                    data.peer_params.clone(),
                    now,
                )
            }),
            None => Err(ErrorCode::NoSession.into()),
        };

        self.close_exchange_with(slot.exchange, CloseReason::Closed);

        match result {
            Ok(()) => {
                info!(
                    "{} session {} established with {}{}",
                    slot.machine.kind(),
                    slot.session,
                    slot.peer,
                    if data.resumed { " (resumed)" } else { "" }
                );

                let sess = slot.session;
                self.notify_handshake(slot.delegate.take(), |delegate| delegate.on_established(sess));
            }
            Err(e) => {
                error!("Cannot activate session {}: {}", slot.session, e);

                self.sessions.evict(slot.session);
                self.notify_handshake(slot.delegate.take(), |delegate| delegate.on_failed(e));
            }
        }
    }

    fn handshake_failed(&mut self, id: u32, err: Error, reason: CloseReason) {
        let Some(mut slot) = self.handshakes.remove(&id) else {
            return;
        };

        slot.timeout.cancel();
        slot.machine.abort();

        warn!("{} with {} failed: {}", slot.machine.kind(), slot.peer, err);

        self.sessions.evict(slot.session);
        self.close_exchange_with(slot.exchange, reason);
        self.notify_handshake(slot.delegate.take(), |delegate| delegate.on_failed(err));
    }

    fn notify_handshake<F>(&mut self, delegate: Option<Box<dyn HandshakeDelegate>>, f: F)
    where
        F: FnOnce(&mut dyn HandshakeDelegate),
    {
        match delegate {
            Some(mut delegate) => f(delegate.as_mut()),
            None => {
                if let Some(incoming) = self.incoming.as_mut() {
                    f(incoming.as_mut());
                }
            }
        }
    }
}

fn opens_handshake(proto: &ProtoHdr) -> bool {
    proto.proto_id == PROTO_ID_SECURE_CHANNEL
        && proto.is_initiator()
        && proto
            .opcode::<OpCode>()
            .map(|opcode| opcode.is_handshake_start())
            .unwrap_or(false)
}

/// Build the headers and the wire image of a message on `session`
fn encode_for(
    session: &mut Session,
    proto: &ProtoHdr,
    payload: &[u8],
    unsec_ctr: &mut PersistedCounter,
    store: &mut dyn KvStore,
) -> Result<(u32, Vec<u8>), Error> {
    let mut plain = PlainHdr::new();

    if session.is_encrypted() {
        plain.sess_id = session.peer_sess_id();
        plain.ctr = session.next_tx_ctr()?;
    } else {
        plain.ctr = unsec_ctr.next(store)?;
        if session.local_nodeid() != 0 {
            plain.set_src_nodeid(Some(session.local_nodeid()));
        }
        plain.set_dst_unicast_nodeid(session.peer_nodeid());
    }

    let crypto = session
        .is_encrypted()
        .then(|| (session.crypto(), session.local_nodeid()));

    let data = encode_tx(&plain, proto, payload, crypto)?;

    Ok((plain.ctr, data))
}

fn jitter(rand: Rand) -> u8 {
    let mut rnd = [0];
    rand(&mut rnd);

    rnd[0]
}

/// A random, non-zero node id identifying us on an unsecured session
fn ephemeral_node_id(rand: Rand) -> u64 {
    let mut buf = [0; 8];
    rand(&mut buf);

    u64::from_le_bytes(buf).max(1)
}

#[cfg(test)]
mod tests {
    use alloc::rc::Rc;
    use core::cell::{Cell, RefCell};

    use super::*;

    use crate::persist::MemKvStore;
    use crate::transport::network::{IpAddr, Ipv4Addr, SocketAddr};
    use crate::utils::rand::sys_rand;

    std::thread_local! {
        static NOW: Cell<Duration> = const { Cell::new(Duration::ZERO) };
    }

    fn clock() -> Duration {
        NOW.with(|now| now.get())
    }

    fn advance(by: Duration) {
        NOW.with(|now| now.set(now.get() + by));
    }

    type Sent = Rc<RefCell<Vec<(Vec<u8>, Address)>>>;

    struct Capture(Sent);

    impl NetworkSend for Capture {
        fn send_to(&mut self, data: &[u8], addr: Address) -> Result<(), Error> {
            self.0.borrow_mut().push((data.to_vec(), addr));
            Ok(())
        }
    }

    #[derive(Default, Clone)]
    struct Outcome(Rc<RefCell<Vec<Result<SessionHandle, ErrorCode>>>>);

    impl HandshakeDelegate for Outcome {
        fn on_established(&mut self, session: SessionHandle) {
            self.0.borrow_mut().push(Ok(session));
        }

        fn on_failed(&mut self, err: Error) {
            self.0.borrow_mut().push(Err(err.code()));
        }
    }

    struct Ignore;

    impl ExchangeDelegate for Ignore {
        fn on_message_received(
            &mut self,
            _ctx: &mut ExchangeContext,
            _meta: &MessageMeta,
            _payload: &[u8],
        ) -> Result<(), Error> {
            Ok(())
        }
    }

    struct Never;

    impl UnsolicitedHandler for Never {
        fn on_unsolicited(
            &mut self,
            _meta: &MessageMeta,
            _session: SessionHandle,
        ) -> Option<Box<dyn ExchangeDelegate>> {
            None
        }
    }

    fn peer(port: u16) -> Address {
        Address::Udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    fn mgr() -> (TransportMgr, Sent) {
        let sent = Sent::default();
        let mgr = TransportMgr::new(
            TransportConfig::default(),
            clock,
            sys_rand,
            Box::new(Capture(sent.clone())),
            Box::new(MemKvStore::new()),
        )
        .unwrap();

        (mgr, sent)
    }

    fn decode(data: &[u8]) -> (MessageMeta, Vec<u8>) {
        let mut buf = data.to_vec();
        let mut rx = RxPacket::new(peer(1), &mut buf);
        rx.plain_hdr_decode().unwrap();
        rx.proto_hdr_decode().unwrap();

        (MessageMeta::from(&rx.proto), rx.payload().to_vec())
    }

    #[test]
    fn secure_channel_is_not_for_applications() {
        let (mut mgr, _) = mgr();

        assert_eq!(
            mgr.register_unsolicited(PROTO_ID_SECURE_CHANNEL, Box::new(Never))
                .map_err(|e| e.code()),
            Err(ErrorCode::InvalidProto)
        );
        assert!(mgr.register_unsolicited(0x0001, Box::new(Never)).is_ok());
    }

    #[test]
    fn establishing_session_has_no_exchanges() {
        let (mut mgr, sent) = mgr();
        let outcome = Outcome::default();

        mgr.establish_pase(peer(5540), 20202021, Box::new(outcome.clone()))
            .unwrap();

        assert_eq!(sent.borrow().len(), 1);
        let (meta, _) = decode(&sent.borrow()[0].0);
        assert_eq!(meta.opcode::<OpCode>().unwrap(), OpCode::PBKDFParamRequest);
        assert!(meta.reliable);

        let reserved = mgr
            .sessions()
            .find(|sess| sess.mode() == SessionMode::Pase)
            .map(Session::handle)
            .unwrap();
        assert_eq!(
            mgr.session(reserved).unwrap().state(),
            SessionState::Establishing
        );
        assert_eq!(
            mgr.new_exchange(reserved, Box::new(Ignore))
                .map_err(|e| e.code()),
            Err(ErrorCode::InvalidState)
        );

        // Only one PASE towards a given peer at a time
        assert_eq!(
            mgr.establish_pase(peer(5540), 20202021, Box::new(outcome.clone()))
                .map_err(|e| e.code()),
            Err(ErrorCode::Busy)
        );
        assert!(outcome.0.borrow().is_empty());
    }

    #[test]
    fn unknown_exchange_is_invalid() {
        let (mut mgr, sent) = mgr();

        assert_eq!(
            mgr.send_message(
                ExchangeHandle::new(42),
                MessageMeta::new(0x0001, 1, true),
                b"hello"
            )
            .map_err(|e| e.code()),
            Err(ErrorCode::InvalidState)
        );
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn pase_is_refused_without_commissioning_window() {
        let (mut initiator, to_responder) = mgr();
        let (mut responder, to_initiator) = mgr();
        let outcome = Outcome::default();

        initiator
            .establish_pase(peer(5540), 20202021, Box::new(outcome.clone()))
            .unwrap();

        let (mut request, _) = to_responder.borrow_mut().remove(0);
        responder.handle_rx(peer(5541), &mut request);

        let replies = to_initiator.borrow().clone();
        assert_eq!(replies.len(), 1);

        let (meta, payload) = decode(&replies[0].0);
        assert_eq!(meta.opcode::<OpCode>().unwrap(), OpCode::StatusReport);
        let report = StatusReport::read(&payload).unwrap();
        assert_eq!(report.proto_code, SCStatusCodes::InvalidParameter as u16);

        // Nothing was reserved on the responder for this
        assert!(responder
            .sessions()
            .all(|sess| sess.mode() == SessionMode::PlainText));

        let (mut reply, _) = replies[0].clone();
        initiator.handle_rx(peer(5540), &mut reply);

        assert_eq!(
            outcome.0.borrow().as_slice(),
            &[Err(ErrorCode::HandshakeFailed)]
        );
        assert_eq!(initiator.exchange_count(), 0);
    }

    #[test]
    fn concurrent_pase_from_same_peer_is_busy() {
        let (mut first, to_responder) = mgr();
        let (mut second, to_responder_too) = mgr();
        let (mut responder, to_initiators) = mgr();

        responder.set_pase_passcode(20202021).unwrap();

        first
            .establish_pase(peer(5540), 20202021, Box::new(Outcome::default()))
            .unwrap();
        second
            .establish_pase(peer(5540), 20202021, Box::new(Outcome::default()))
            .unwrap();

        // Both initiators sit behind the same address
        let (mut request, _) = to_responder.borrow_mut().remove(0);
        responder.handle_rx(peer(5541), &mut request);
        let (mut request, _) = to_responder_too.borrow_mut().remove(0);
        responder.handle_rx(peer(5541), &mut request);

        let replies = to_initiators.borrow().clone();
        assert_eq!(replies.len(), 2);

        let (meta, _) = decode(&replies[0].0);
        assert_eq!(meta.opcode::<OpCode>().unwrap(), OpCode::PBKDFParamResponse);

        let (meta, payload) = decode(&replies[1].0);
        assert_eq!(meta.opcode::<OpCode>().unwrap(), OpCode::StatusReport);
        assert!(!meta.reliable);
        let report = StatusReport::read(&payload).unwrap();
        assert_eq!(report.proto_code, SCStatusCodes::Busy as u16);
        assert_eq!(report.busy_wait_ms(), Some(500));
    }

    #[test]
    fn unanswered_handshake_releases_everything() {
        let (mut mgr, sent) = mgr();
        let outcome = Outcome::default();

        mgr.establish_pase(peer(5540), 20202021, Box::new(outcome.clone()))
            .unwrap();

        for _ in 0..120 {
            advance(Duration::from_secs(1));
            mgr.poll_timers();
        }

        // The request was retransmitted until MRP gave up
        assert_eq!(sent.borrow().len(), mgr.config().mrp.max_transmissions);
        assert_eq!(
            outcome.0.borrow().as_slice(),
            &[Err(ErrorCode::TransportFailure)]
        );
        assert_eq!(mgr.sessions().count(), 0);
        assert_eq!(mgr.exchange_count(), 0);
        assert!(mgr.next_deadline().is_none());
    }
}
