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

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use rs_matter_session::error::{Error, ErrorCode};
use rs_matter_session::persist::MemKvStore;
use rs_matter_session::secure_channel::credentials::{LocalFabric, RootAuthority};
use rs_matter_session::secure_channel::handshake::HandshakeDelegate;
use rs_matter_session::transport::core::{TransportConfig, TransportMgr};
use rs_matter_session::transport::exchange::{
    CloseReason, ExchangeContext, ExchangeDelegate, MessageMeta, UnsolicitedHandler,
};
use rs_matter_session::transport::network::{Address, IpAddr, Ipv4Addr, NetworkSend, SocketAddr};
use rs_matter_session::transport::session::SessionHandle;
use rs_matter_session::utils::rand::sys_rand;

pub const PASSCODE: u32 = 20202021;
pub const ECHO_PROTO: u16 = 0xfff1;
pub const IPK: [u8; 16] = [0x5a; 16];

pub fn init_env_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

thread_local! {
    static NOW: Cell<Duration> = const { Cell::new(Duration::ZERO) };
}

/// The simulated clock; every test runs on its own thread, hence its own clock
pub fn clock() -> Duration {
    NOW.with(|now| now.get())
}

fn set_clock(at: Duration) {
    NOW.with(|now| now.set(now.get().max(at)));
}

pub fn addr(port: u16) -> Address {
    Address::Udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
}

#[derive(Clone)]
pub struct Packet {
    pub from: Address,
    pub to: Address,
    pub data: Vec<u8>,
}

type DropFilter = Box<dyn FnMut(usize, &Packet) -> bool>;

/// An in-memory datagram network
#[derive(Default)]
pub struct Wire {
    queue: VecDeque<Packet>,
    drop: Option<DropFilter>,
    /// Every packet ever sent, lost ones included, by index
    pub history: Vec<Packet>,
    pub sent: usize,
    pub dropped: usize,
}

pub type SharedWire = Rc<RefCell<Wire>>;

struct WireSender {
    from: Address,
    wire: SharedWire,
}

impl NetworkSend for WireSender {
    fn send_to(&mut self, data: &[u8], to: Address) -> Result<(), Error> {
        let mut wire = self.wire.borrow_mut();
        let packet = Packet {
            from: self.from,
            to,
            data: data.to_vec(),
        };

        let idx = wire.sent;
        wire.sent += 1;
        wire.history.push(packet.clone());

        let dropped = wire.drop.as_mut().map(|f| f(idx, &packet)).unwrap_or(false);
        if dropped {
            wire.dropped += 1;
        } else {
            wire.queue.push_back(packet);
        }

        Ok(())
    }
}

pub struct Node {
    pub addr: Address,
    pub mgr: TransportMgr,
}

/// A handful of transport managers talking over a [`Wire`]
pub struct Sim {
    pub wire: SharedWire,
    pub nodes: Vec<Node>,
}

impl Sim {
    pub fn new(count: usize) -> Self {
        Self::with_configs((0..count).map(|_| config()).collect())
    }

    pub fn with_configs(configs: Vec<TransportConfig>) -> Self {
        init_env_logger();

        let wire = SharedWire::default();
        let nodes = configs
            .into_iter()
            .enumerate()
            .map(|(i, config)| {
                let addr = addr(5540 + i as u16);
                let mgr = TransportMgr::new(
                    config,
                    clock,
                    sys_rand,
                    Box::new(WireSender {
                        from: addr,
                        wire: wire.clone(),
                    }),
                    Box::new(MemKvStore::new()),
                )
                .unwrap();

                Node { addr, mgr }
            })
            .collect();

        Self { wire, nodes }
    }

    pub fn addr(&self, node: usize) -> Address {
        self.nodes[node].addr
    }

    pub fn mgr(&mut self, node: usize) -> &mut TransportMgr {
        &mut self.nodes[node].mgr
    }

    /// Drop the packets for which `f` (given the packet index on the wire) returns `true`
    pub fn set_drop<F>(&mut self, f: F)
    where
        F: FnMut(usize, &Packet) -> bool + 'static,
    {
        self.wire.borrow_mut().drop = Some(Box::new(f));
    }

    pub fn clear_drop(&mut self) {
        self.wire.borrow_mut().drop = None;
    }

    /// Swap the order of the packets in flight
    pub fn reverse_in_flight(&mut self) {
        self.wire.borrow_mut().queue.make_contiguous().reverse();
    }

    /// Deliver the oldest packet in flight, if any
    pub fn deliver_one(&mut self) -> bool {
        let packet = self.wire.borrow_mut().queue.pop_front();
        let Some(mut packet) = packet else {
            return false;
        };

        if let Some(node) = self.nodes.iter_mut().find(|node| node.addr == packet.to) {
            node.mgr.handle_rx(packet.from, &mut packet.data);
        }

        true
    }

    /// Deliver everything in flight, including what gets sent while delivering
    pub fn deliver(&mut self) -> usize {
        let mut count = 0;

        while self.deliver_one() {
            count += 1;
        }

        count
    }

    /// Deliver packets and fire timers until `done` holds or `limit` of
    /// simulated time passes
    pub fn run_until<F>(&mut self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&Sim) -> bool,
    {
        let until = clock() + limit;

        loop {
            self.deliver();

            if done(self) {
                return true;
            }

            let next = self
                .nodes
                .iter()
                .filter_map(|node| node.mgr.next_deadline())
                .min();

            match next {
                Some(deadline) if deadline <= until => {
                    set_clock(deadline);
                    for node in &mut self.nodes {
                        node.mgr.poll_timers();
                    }
                }
                _ => {
                    set_clock(until);
                    return done(self);
                }
            }
        }
    }

    /// Run for `limit` of simulated time
    pub fn run(&mut self, limit: Duration) {
        self.run_until(limit, |_| false);
    }

    /// PASE from `initiator` to `responder`; returns both ends of the new session
    pub fn pase(&mut self, initiator: usize, responder: usize) -> (SessionHandle, SessionHandle) {
        let (iev, rev) = self.start_pase(initiator, responder, PASSCODE);

        assert!(self.run_until(Duration::from_secs(30), |_| iev.done() && rev.done()));

        (iev.established().unwrap(), rev.established().unwrap())
    }

    pub fn start_pase(
        &mut self,
        initiator: usize,
        responder: usize,
        passcode: u32,
    ) -> (SessionEvents, SessionEvents) {
        let iev = SessionEvents::default();
        let rev = SessionEvents::default();

        let peer = self.addr(responder);

        let mgr = self.mgr(responder);
        mgr.set_pase_passcode(PASSCODE).unwrap();
        mgr.set_incoming_session_delegate(Box::new(rev.clone()));

        self.mgr(initiator)
            .establish_pase(peer, passcode, Box::new(iev.clone()))
            .unwrap();

        (iev, rev)
    }

    /// Put `nodes[i]` on a fabric of `ca` as node `node_id(i)`; returns the fabric indexes
    pub fn commission(&mut self, ca: &RootAuthority, nodes: &[usize]) -> Vec<u8> {
        nodes
            .iter()
            .map(|&i| {
                let fabric = fabric(ca, node_id(i));
                self.mgr(i).add_fabric(fabric).unwrap()
            })
            .collect()
    }

    /// CASE from `initiator` to `responder`, both on the fabric at `fabric_idx` of the initiator
    pub fn start_case(
        &mut self,
        initiator: usize,
        responder: usize,
        fabric_idx: u8,
    ) -> (SessionEvents, SessionEvents) {
        let iev = SessionEvents::default();
        let rev = SessionEvents::default();

        let peer = self.addr(responder);

        self.mgr(responder)
            .set_incoming_session_delegate(Box::new(rev.clone()));
        self.mgr(initiator)
            .establish_case(peer, fabric_idx, node_id(responder), Box::new(iev.clone()))
            .unwrap();

        (iev, rev)
    }
}

pub fn config() -> TransportConfig {
    TransportConfig {
        pase_iterations: 1000,
        ..Default::default()
    }
}

pub fn node_id(node: usize) -> u64 {
    0x1000 + node as u64
}

pub fn fabric(ca: &RootAuthority, node_id: u64) -> LocalFabric {
    ca.new_fabric(node_id, IPK, sys_rand).unwrap()
}

/// Records the outcome of session establishment
#[derive(Default, Clone)]
pub struct SessionEvents(Rc<RefCell<Vec<Result<SessionHandle, ErrorCode>>>>);

impl SessionEvents {
    pub fn done(&self) -> bool {
        !self.0.borrow().is_empty()
    }

    pub fn all(&self) -> Vec<Result<SessionHandle, ErrorCode>> {
        self.0.borrow().clone()
    }

    pub fn established(&self) -> Option<SessionHandle> {
        self.0.borrow().iter().rev().find_map(|r| r.ok())
    }

    pub fn failed(&self) -> Option<ErrorCode> {
        self.0.borrow().iter().rev().find_map(|r| r.err())
    }
}

impl HandshakeDelegate for SessionEvents {
    fn on_established(&mut self, session: SessionHandle) {
        self.0.borrow_mut().push(Ok(session));
    }

    fn on_failed(&mut self, err: Error) {
        self.0.borrow_mut().push(Err(err.code()));
    }
}

#[derive(Default)]
pub struct InboxState {
    pub messages: Vec<(MessageMeta, Vec<u8>)>,
    pub closed: Vec<CloseReason>,
    pub timeouts: usize,
}

/// An exchange delegate recording what happens on its exchange
#[derive(Default, Clone)]
pub struct Inbox(pub Rc<RefCell<InboxState>>);

impl Inbox {
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.0
            .borrow()
            .messages
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    pub fn closed(&self) -> Vec<CloseReason> {
        self.0.borrow().closed.clone()
    }

    pub fn timeouts(&self) -> usize {
        self.0.borrow().timeouts
    }
}

impl ExchangeDelegate for Inbox {
    fn on_message_received(
        &mut self,
        _ctx: &mut ExchangeContext,
        meta: &MessageMeta,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.0
            .borrow_mut()
            .messages
            .push((*meta, payload.to_vec()));

        Ok(())
    }

    fn on_response_timeout(&mut self) {
        self.0.borrow_mut().timeouts += 1;
    }

    fn on_exchange_closing(&mut self, reason: CloseReason) {
        self.0.borrow_mut().closed.push(reason);
    }
}

/// Answers each request with the same payload, then closes the exchange
struct Echo(Inbox);

impl ExchangeDelegate for Echo {
    fn on_message_received(
        &mut self,
        ctx: &mut ExchangeContext,
        meta: &MessageMeta,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.0.on_message_received(ctx, meta, payload)?;

        ctx.send(
            MessageMeta::new(meta.proto_id, meta.proto_opcode + 1, true),
            payload,
        )?;
        ctx.close();

        Ok(())
    }

    fn on_exchange_closing(&mut self, reason: CloseReason) {
        self.0.on_exchange_closing(reason);
    }
}

/// Opens an [`Echo`] exchange for every unsolicited request
#[derive(Default, Clone)]
pub struct EchoServer(pub Inbox);

impl UnsolicitedHandler for EchoServer {
    fn on_unsolicited(
        &mut self,
        _meta: &MessageMeta,
        _session: SessionHandle,
    ) -> Option<Box<dyn ExchangeDelegate>> {
        Some(Box::new(Echo(self.0.clone())))
    }
}

/// Keeps every unsolicited exchange open, recording what happens on it
#[derive(Default, Clone)]
pub struct Sink(pub Inbox);

impl UnsolicitedHandler for Sink {
    fn on_unsolicited(
        &mut self,
        _meta: &MessageMeta,
        _session: SessionHandle,
    ) -> Option<Box<dyn ExchangeDelegate>> {
        Some(Box::new(self.0.clone()))
    }
}

pub fn request(payload: &[u8]) -> (MessageMeta, Vec<u8>) {
    (MessageMeta::new(ECHO_PROTO, 1, true), payload.to_vec())
}
