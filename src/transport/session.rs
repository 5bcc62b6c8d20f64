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

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::rc::{Rc, Weak};
use alloc::vec::Vec;
use core::cell::RefCell;
use core::fmt;
use core::time::Duration;

use cfg_if::cfg_if;
use log::{debug, info, warn};

use crate::error::*;
use crate::utils::rand::Rand;

use super::dedup::{RxCtrState, RxVerdict};
use super::exchange::ExchangeHandle;
use super::msg_ctr::MessageCounter;
use super::mrp::SessionParameters;
use super::network::Address;
use super::plain_hdr::PlainHdr;
use super::session_crypto::{CryptoContext, SessionRole};

cfg_if! {
    if #[cfg(feature = "max-sessions-64")] {
        /// Max number of supported sessions
        pub const MAX_SESSIONS: usize = 64;
    } else if #[cfg(feature = "max-sessions-32")] {
        /// Max number of supported sessions
        pub const MAX_SESSIONS: usize = 32;
    } else if #[cfg(feature = "max-sessions-16")] {
        /// Max number of supported sessions
        pub const MAX_SESSIONS: usize = 16;
    } else if #[cfg(feature = "max-sessions-8")] {
        /// Max number of supported sessions
        pub const MAX_SESSIONS: usize = 8;
    } else if #[cfg(feature = "max-sessions-7")] {
        /// Max number of supported sessions
        pub const MAX_SESSIONS: usize = 7;
    } else if #[cfg(feature = "max-sessions-6")] {
        /// Max number of supported sessions
        pub const MAX_SESSIONS: usize = 6;
    } else if #[cfg(feature = "max-sessions-5")] {
        /// Max number of supported sessions
        pub const MAX_SESSIONS: usize = 5;
    } else if #[cfg(feature = "max-sessions-4")] {
        /// Max number of supported sessions
        pub const MAX_SESSIONS: usize = 4;
    } else if #[cfg(feature = "max-sessions-3")] {
        /// Max number of supported sessions
        pub const MAX_SESSIONS: usize = 3;
    } else {
        /// Max number of supported sessions
        pub const MAX_SESSIONS: usize = 16;
    }
}

cfg_if! {
    if #[cfg(feature = "max-exchanges-per-session-16")] {
        /// Max number of supported exchanges per session
        pub const MAX_EXCHANGES: usize = 16;
    } else if #[cfg(feature = "max-exchanges-per-session-8")] {
        /// Max number of supported exchanges per session
        pub const MAX_EXCHANGES: usize = 8;
    } else if #[cfg(feature = "max-exchanges-per-session-7")] {
        /// Max number of supported exchanges per session
        pub const MAX_EXCHANGES: usize = 7;
    } else if #[cfg(feature = "max-exchanges-per-session-6")] {
        /// Max number of supported exchanges per session
        pub const MAX_EXCHANGES: usize = 6;
    } else if #[cfg(feature = "max-exchanges-per-session-5")] {
        /// Max number of supported exchanges per session
        pub const MAX_EXCHANGES: usize = 5;
    } else if #[cfg(feature = "max-exchanges-per-session-4")] {
        /// Max number of supported exchanges per session
        pub const MAX_EXCHANGES: usize = 4;
    } else if #[cfg(feature = "max-exchanges-per-session-3")] {
        /// Max number of supported exchanges per session
        pub const MAX_EXCHANGES: usize = 3;
    } else {
        /// Max number of supported exchanges per session
        pub const MAX_EXCHANGES: usize = 5;
    }
}

/// Identifies a session in the table.
///
/// Local session ids get reused; the generation makes sure a handle to a
/// destroyed session never resolves to its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionHandle {
    local_sess_id: u16,
    gen: u32,
}

impl SessionHandle {
    pub fn local_sess_id(&self) -> u16 {
        self.local_sess_id
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}/{}", self.local_sess_id, self.gen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Reserved for a handshake in progress, no keys yet
    Establishing,
    Active,
    /// No new traffic; waiting to be evicted
    Defunct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    PlainText,
    Pase,
    Case { fabric_idx: u8 },
}

impl SessionMode {
    pub fn is_encrypted(&self) -> bool {
        !matches!(self, Self::PlainText)
    }
}

struct HolderInner {
    handle: Option<SessionHandle>,
    on_release: Option<Box<dyn FnMut(SessionHandle)>>,
}

/// A weak reference to a session.
///
/// When the table destroys the session, the holder is invalidated and its
/// release callback (if any) invoked.
#[derive(Clone)]
pub struct SessionHolder(Rc<RefCell<HolderInner>>);

impl SessionHolder {
    fn new(handle: SessionHandle) -> Self {
        Self(Rc::new(RefCell::new(HolderInner {
            handle: Some(handle),
            on_release: None,
        })))
    }

    pub fn get(&self) -> Option<SessionHandle> {
        self.0.borrow().handle
    }

    pub fn is_valid(&self) -> bool {
        self.get().is_some()
    }

    /// Register a callback invoked once the session is destroyed
    pub fn on_release<F>(&self, f: F)
    where
        F: FnMut(SessionHandle) + 'static,
    {
        self.0.borrow_mut().on_release = Some(Box::new(f));
    }

    /// Stop referring to the session, without invoking the callback
    pub fn release(&self) {
        let mut inner = self.0.borrow_mut();
        inner.handle = None;
        inner.on_release = None;
    }

    fn invalidate(holder: &Rc<RefCell<HolderInner>>) {
        let (handle, callback) = {
            let mut inner = holder.borrow_mut();
            (inner.handle.take(), inner.on_release.take())
        };

        if let (Some(handle), Some(mut callback)) = (handle, callback) {
            callback(handle);
        }
    }
}

impl fmt::Debug for SessionHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionHolder({:?})", self.get())
    }
}

pub struct Session {
    handle: SessionHandle,
    state: SessionState,
    mode: SessionMode,
    peer_addr: Address,
    local_nodeid: u64,
    peer_nodeid: Option<u64>,
    peer_sess_id: u16,
    crypto: CryptoContext,
    tx_ctr: MessageCounter,
    rx_ctr: Option<RxCtrState>,
    peer_params: Option<SessionParameters>,
    last_activity: Duration,
    last_rx: Option<Duration>,
    pub(crate) exchanges: heapless::Vec<ExchangeHandle, MAX_EXCHANGES>,
    holders: Vec<Weak<RefCell<HolderInner>>>,
}

impl Session {
    fn new(
        handle: SessionHandle,
        role: SessionRole,
        mode: SessionMode,
        peer_addr: Address,
        now: Duration,
        rand: Rand,
    ) -> Self {
        Self {
            handle,
            state: if mode.is_encrypted() {
                SessionState::Establishing
            } else {
                SessionState::Active
            },
            mode,
            peer_addr,
            local_nodeid: 0,
            peer_nodeid: None,
            peer_sess_id: 0,
            crypto: CryptoContext::new(role),
            tx_ctr: MessageCounter::new(rand),
            rx_ctr: None,
            peer_params: None,
            last_activity: now,
            last_rx: None,
            exchanges: heapless::Vec::new(),
            holders: Vec::new(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn local_sess_id(&self) -> u16 {
        self.handle.local_sess_id
    }

    pub fn peer_sess_id(&self) -> u16 {
        self.peer_sess_id
    }

    pub fn peer_addr(&self) -> Address {
        self.peer_addr
    }

    pub fn local_nodeid(&self) -> u64 {
        self.local_nodeid
    }

    pub fn peer_nodeid(&self) -> Option<u64> {
        self.peer_nodeid
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> SessionRole {
        self.crypto.role()
    }

    pub fn is_encrypted(&self) -> bool {
        self.mode.is_encrypted()
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn crypto(&self) -> &CryptoContext {
        &self.crypto
    }

    pub fn att_challenge(&self) -> Option<&[u8; 16]> {
        self.crypto.att_challenge()
    }

    pub fn peer_params(&self) -> Option<&SessionParameters> {
        self.peer_params.as_ref()
    }

    pub fn last_activity(&self) -> Duration {
        self.last_activity
    }

    pub fn last_rx(&self) -> Option<Duration> {
        self.last_rx
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.len()
    }

    pub(crate) fn set_local_nodeid(&mut self, nodeid: u64) {
        self.local_nodeid = nodeid;
    }

    pub(crate) fn set_peer_nodeid(&mut self, nodeid: Option<u64>) {
        self.peer_nodeid = nodeid;
    }

    /// Refine the mode of a session still being established, e.g. with its CASE fabric
    pub(crate) fn set_mode(&mut self, mode: SessionMode) -> Result<(), Error> {
        if self.state != SessionState::Establishing || !mode.is_encrypted() {
            Err(ErrorCode::InvalidState)?;
        }

        self.mode = mode;

        Ok(())
    }

    /// Install the outcome of a successful handshake and activate the session
    pub(crate) fn activate(
        &mut self,
        peer_sess_id: u16,
        peer_nodeid: Option<u64>,
        local_nodeid: u64,
        keys: (&[u8], &[u8], &[u8]),
        peer_params: Option<SessionParameters>,
        now: Duration,
    ) -> Result<(), Error> {
        if self.state != SessionState::Establishing {
            Err(ErrorCode::InvalidState)?;
        }

        self.crypto.activate(keys.0, keys.1, keys.2)?;
        self.peer_sess_id = peer_sess_id;
        self.peer_nodeid = peer_nodeid;
        self.local_nodeid = local_nodeid;
        self.peer_params = peer_params;
        self.last_activity = now;
        self.state = SessionState::Active;

        Ok(())
    }

    /// The next outgoing message counter.
    ///
    /// Fails with `CounterExhausted` once the counter would wrap; retiring the
    /// session is then up to its owner.
    pub fn next_tx_ctr(&mut self) -> Result<u32, Error> {
        let ctr = self.tx_ctr.next();

        if ctr.is_err() {
            warn!("Session {}: message counter exhausted", self.handle);
        }

        ctr
    }

    /// Force the outgoing counter, such that the next one handed out is `last + 1`
    pub fn set_tx_ctr(&mut self, last: u32) {
        self.tx_ctr.set(last);
    }

    /// Run a received counter through the replay window, trusting the first one seen
    pub fn post_recv_ctr(&mut self, ctr: u32) -> RxVerdict {
        let encrypted = self.is_encrypted();

        match &mut self.rx_ctr {
            Some(rx_ctr) => rx_ctr.post_recv(ctr, encrypted),
            None => {
                self.rx_ctr = Some(RxCtrState::new(ctr));
                RxVerdict::Accept
            }
        }
    }

    pub(crate) fn touch_rx(&mut self, now: Duration) {
        self.last_rx = Some(now);
        self.last_activity = now;
    }

    pub(crate) fn touch(&mut self, now: Duration) {
        self.last_activity = now;
    }

    /// Whether an unsecured message belongs to this plain text session
    fn is_for_plain_rx(&self, rx_peer: &Address, rx_plain: &PlainHdr) -> bool {
        if self.is_encrypted() || self.state != SessionState::Active || self.peer_addr != *rx_peer
        {
            return false;
        }

        if let Some(dst) = rx_plain.get_dst_unicast_nodeid() {
            dst == self.local_nodeid
        } else {
            self.peer_nodeid == rx_plain.get_src_nodeid()
        }
    }

    fn has_live_holders(&self) -> bool {
        self.holders.iter().any(|holder| {
            holder
                .upgrade()
                .map(|holder| holder.borrow().handle.is_some())
                .unwrap_or(false)
        })
    }

    fn release_holders(&mut self) {
        for holder in self.holders.drain(..) {
            if let Some(holder) = holder.upgrade() {
                SessionHolder::invalidate(&holder);
            }
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {:?} peer {} sid {:04x}->{:04x}",
            self.handle,
            self.mode,
            self.state,
            self.peer_addr,
            self.local_sess_id(),
            self.peer_sess_id
        )
    }
}

/// All sessions of a node, keyed by local session id.
///
/// Plain text sessions get a local id too, even though it never travels on
/// the wire; that keeps a single id space for handles.
pub struct SessionTable {
    sessions: BTreeMap<u16, Session>,
    capacity: usize,
    next_sess_id: u16,
    next_gen: u32,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: BTreeMap::new(),
            capacity: capacity.min(MAX_SESSIONS),
            next_sess_id: 1,
            next_gen: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    fn get_next_sess_id(&mut self) -> u16 {
        loop {
            let next_sess_id = self.next_sess_id;

            self.next_sess_id = self.next_sess_id.wrapping_add(1);
            if self.next_sess_id == 0 {
                self.next_sess_id = 1;
            }

            if !self.sessions.contains_key(&next_sess_id) {
                break next_sess_id;
            }
        }
    }

    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.capacity
    }

    /// The least recently active Defunct session, if any
    pub fn get_session_for_eviction(&self) -> Option<SessionHandle> {
        self.sessions
            .values()
            .filter(|sess| sess.state == SessionState::Defunct)
            .min_by_key(|sess| sess.last_activity)
            .map(|sess| sess.handle)
    }

    /// Create a new session.
    ///
    /// Encrypted sessions start as `Establishing`, plain text ones as `Active`.
    /// A full table is never evicted from here: the owner picks a victim with
    /// [`SessionTable::get_session_for_eviction`] and tears it down first.
    pub fn create(
        &mut self,
        role: SessionRole,
        mode: SessionMode,
        peer_addr: Address,
        now: Duration,
        rand: Rand,
    ) -> Result<SessionHandle, Error> {
        if self.is_full() {
            warn!("Session table full");
            Err(ErrorCode::NoSpaceSessions)?;
        }

        self.next_gen = self.next_gen.wrapping_add(1);

        let handle = SessionHandle {
            local_sess_id: self.get_next_sess_id(),
            gen: self.next_gen,
        };

        self.sessions.insert(
            handle.local_sess_id,
            Session::new(handle, role, mode, peer_addr, now, rand),
        );

        debug!("Created session {} {:?} for {}", handle, mode, peer_addr);

        Ok(handle)
    }

    /// Look up a session by its local session id
    pub fn find(&self, local_sess_id: u16) -> Option<SessionHandle> {
        self.sessions.get(&local_sess_id).map(|sess| sess.handle)
    }

    pub(crate) fn find_plain(&self, rx_peer: &Address, rx_plain: &PlainHdr) -> Option<SessionHandle> {
        self.sessions
            .values()
            .find(|sess| sess.is_for_plain_rx(rx_peer, rx_plain))
            .map(|sess| sess.handle)
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions
            .get(&handle.local_sess_id)
            .filter(|sess| sess.handle == handle)
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.sessions
            .get_mut(&handle.local_sess_id)
            .filter(|sess| sess.handle == handle)
    }

    pub fn holder(&mut self, handle: SessionHandle) -> Result<SessionHolder, Error> {
        let sess = self.get_mut(handle).ok_or(ErrorCode::NoSession)?;

        let holder = SessionHolder::new(handle);
        sess.holders.retain(|weak| weak.strong_count() > 0);
        sess.holders.push(Rc::downgrade(&holder.0));

        Ok(holder)
    }

    pub fn has_live_holders(&self, handle: SessionHandle) -> bool {
        self.get(handle)
            .map(Session::has_live_holders)
            .unwrap_or(false)
    }

    /// Mark the session Defunct. Its exchanges are the caller's to close.
    pub fn mark_defunct(&mut self, handle: SessionHandle) -> bool {
        if let Some(sess) = self.get_mut(handle) {
            if sess.state != SessionState::Defunct {
                info!("Session {} is now defunct", handle);
                sess.state = SessionState::Defunct;
            }

            true
        } else {
            false
        }
    }

    /// Destroy the session, invalidating all its holders
    pub fn evict(&mut self, handle: SessionHandle) -> Option<Session> {
        if self.get(handle).is_none() {
            return None;
        }

        let mut sess = self.sessions.remove(&handle.local_sess_id)?;
        debug!("Destroying session {}", sess);
        sess.release_holders();

        Some(sess)
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;
    use core::net::{IpAddr, Ipv4Addr, SocketAddr};

    use super::*;

    use crate::utils::rand::dummy_rand;

    fn peer(port: u16) -> Address {
        Address::Udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn secure(table: &mut SessionTable, port: u16, now: u64) -> Result<SessionHandle, Error> {
        table.create(
            SessionRole::Responder,
            SessionMode::Pase,
            peer(port),
            ms(now),
            dummy_rand,
        )
    }

    #[test]
    fn ids_are_unique_and_nonzero() {
        let mut table = SessionTable::new(3);
        let a = secure(&mut table, 1, 0).unwrap();
        let b = secure(&mut table, 2, 0).unwrap();

        assert_ne!(a.local_sess_id(), 0);
        assert_ne!(a.local_sess_id(), b.local_sess_id());
        assert_eq!(table.find(a.local_sess_id()), Some(a));
        assert_eq!(table.get(a).unwrap().state(), SessionState::Establishing);
        assert_eq!(table.find(0x7777), None);
    }

    #[test]
    fn full_table_names_lru_defunct_victim() {
        let mut table = SessionTable::new(3);
        let a = secure(&mut table, 1, 10).unwrap();
        let b = secure(&mut table, 2, 5).unwrap();
        let c = secure(&mut table, 3, 20).unwrap();

        assert!(table.is_full());
        assert_eq!(table.get_session_for_eviction(), None);

        table.mark_defunct(a);
        table.mark_defunct(c);

        // `a` is the least recently active Defunct session; `b` is older but not Defunct
        assert_eq!(table.get_session_for_eviction(), Some(a));

        // Creating never evicts on its own
        assert_eq!(
            secure(&mut table, 4, 30).unwrap_err().code(),
            ErrorCode::NoSpaceSessions
        );
        assert!(table.get(a).is_some());

        table.evict(a);
        let d = secure(&mut table, 4, 30).unwrap();
        assert!(table.get(b).is_some());
        assert!(table.get(c).is_some());
        assert!(table.get(d).is_some());
    }

    #[test]
    fn stale_handles_do_not_resolve() {
        let mut table = SessionTable::new(1);
        let a = secure(&mut table, 1, 0).unwrap();
        table.evict(a).unwrap();

        table.next_sess_id = a.local_sess_id();
        let b = secure(&mut table, 1, 0).unwrap();

        assert_eq!(a.local_sess_id(), b.local_sess_id());
        assert!(table.get(a).is_none());
        assert!(table.get(b).is_some());
        assert!(table.evict(a).is_none());
    }

    #[test]
    fn holders_are_invalidated_on_eviction() {
        let mut table = SessionTable::new(2);
        let a = secure(&mut table, 1, 0).unwrap();

        let holder = table.holder(a).unwrap();
        let released = Rc::new(Cell::new(None));
        let released2 = released.clone();
        holder.on_release(move |handle| released2.set(Some(handle)));

        assert!(holder.is_valid());
        assert!(table.has_live_holders(a));

        table.evict(a);
        assert!(!holder.is_valid());
        assert_eq!(holder.get(), None);
        assert_eq!(released.get(), Some(a));
    }

    #[test]
    fn released_holders_are_not_live() {
        let mut table = SessionTable::new(2);
        let a = secure(&mut table, 1, 0).unwrap();

        let holder = table.holder(a).unwrap();
        holder.release();
        assert!(!table.has_live_holders(a));

        let holder = table.holder(a).unwrap();
        drop(holder);
        assert!(!table.has_live_holders(a));
    }

    #[test]
    fn counter_exhaustion_leaves_state_alone() {
        let mut table = SessionTable::new(1);
        let a = secure(&mut table, 1, 0).unwrap();

        let sess = table.get_mut(a).unwrap();
        sess.set_tx_ctr(u32::MAX - 1);
        assert_eq!(sess.next_tx_ctr().unwrap(), u32::MAX);
        assert_eq!(
            sess.next_tx_ctr().unwrap_err().code(),
            ErrorCode::CounterExhausted
        );
        assert_eq!(sess.state(), SessionState::Establishing);
    }

    #[test]
    fn plain_sessions_by_node_id() {
        let mut table = SessionTable::new(4);

        let ours = table
            .create(
                SessionRole::Initiator,
                SessionMode::PlainText,
                peer(1),
                ms(0),
                dummy_rand,
            )
            .unwrap();
        table.get_mut(ours).unwrap().set_local_nodeid(0xaaaa);

        let theirs = table
            .create(
                SessionRole::Responder,
                SessionMode::PlainText,
                peer(1),
                ms(0),
                dummy_rand,
            )
            .unwrap();
        table.get_mut(theirs).unwrap().set_peer_nodeid(Some(0xbbbb));

        let mut hdr = PlainHdr::new();
        hdr.set_dst_unicast_nodeid(Some(0xaaaa));
        assert_eq!(table.find_plain(&peer(1), &hdr), Some(ours));
        assert_eq!(table.find_plain(&peer(2), &hdr), None);

        let mut hdr = PlainHdr::new();
        hdr.set_src_nodeid(Some(0xbbbb));
        assert_eq!(table.find_plain(&peer(1), &hdr), Some(theirs));

        hdr.set_src_nodeid(Some(0xcccc));
        assert_eq!(table.find_plain(&peer(1), &hdr), None);
    }

    #[test]
    fn first_counter_is_trusted() {
        let mut table = SessionTable::new(1);
        let a = secure(&mut table, 1, 0).unwrap();
        let sess = table.get_mut(a).unwrap();

        assert_eq!(sess.post_recv_ctr(5000), RxVerdict::Accept);
        assert_eq!(sess.post_recv_ctr(5000), RxVerdict::Duplicate);
        assert_eq!(sess.post_recv_ctr(4999), RxVerdict::Duplicate);
        assert_eq!(sess.post_recv_ctr(5001), RxVerdict::Accept);
    }
}
