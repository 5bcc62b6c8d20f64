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

//! Exchanges: the request/response conversations multiplexed over a session.

use alloc::boxed::Box;
use core::fmt::{self, Display};
use core::time::Duration;

use crate::error::{Error, ErrorCode};
use crate::secure_channel::common::{OpCode, PROTO_ID_SECURE_CHANNEL};

use super::core::TransportMgr;
use super::mrp::ReliableMessage;
use super::proto_hdr::ProtoHdr;
use super::session::SessionHandle;
use super::timer::CancellationToken;

/// Identifies an exchange within a [`TransportMgr`].
///
/// Handles are never reused, so a handle of a closed exchange stays invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExchangeHandle(u32);

impl ExchangeHandle {
    pub(crate) const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u32 {
        self.0
    }
}

impl Display for ExchangeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn is_initiator(&self) -> bool {
        matches!(self, Self::Initiator)
    }
}

/// Meta-data when sending/receving messages via an Exchange.
/// Basically, the protocol ID, the protocol opcode and whether the message should be set in a reliable manner.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct MessageMeta {
    pub proto_id: u16,
    pub proto_opcode: u8,
    pub reliable: bool,
}

impl MessageMeta {
    pub const fn new(proto_id: u16, proto_opcode: u8, reliable: bool) -> Self {
        Self {
            proto_id,
            proto_opcode,
            reliable,
        }
    }

    /// Try to cast the protocol opcode to a specific type
    pub fn opcode<T: num::FromPrimitive>(&self) -> Result<T, Error> {
        num::FromPrimitive::from_u8(self.proto_opcode).ok_or(ErrorCode::InvalidOpcode.into())
    }

    pub fn check_opcode<T: num::FromPrimitive + PartialEq>(&self, opcode: T) -> Result<(), Error> {
        if self.opcode::<T>()? == opcode {
            Ok(())
        } else {
            Err(ErrorCode::InvalidOpcode.into())
        }
    }

    pub fn from(proto: &ProtoHdr) -> Self {
        Self {
            proto_id: proto.proto_id,
            proto_opcode: proto.proto_opcode,
            reliable: proto.is_reliable(),
        }
    }

    pub fn set_into(&self, proto: &mut ProtoHdr) {
        proto.proto_id = self.proto_id;
        proto.proto_opcode = self.proto_opcode;
        proto.set_vendor(None);
        proto.set_reliable(self.reliable);
    }

    pub fn reliable(self, reliable: bool) -> Self {
        Self { reliable, ..self }
    }

    pub fn is_sc(&self) -> bool {
        self.proto_id == PROTO_ID_SECURE_CHANNEL
    }

    pub fn is_standalone_ack(&self) -> bool {
        self.is_sc() && self.proto_opcode == OpCode::MRPStandAloneAck as u8
    }
}

impl Display for MessageMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "P:{:x},OP:{:x}{}",
            self.proto_id,
            self.proto_opcode,
            if self.reliable { ",R" } else { "" }
        )
    }
}

/// Why an exchange went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by its owner
    Closed,
    /// No response arrived in time
    ResponseTimeout,
    /// A reliable message was never acknowledged
    TransportFailure,
    /// The session of the exchange became defunct or was evicted
    SessionReleased,
}

impl CloseReason {
    /// The error a pending operation on the exchange fails with
    pub fn as_error(&self) -> Error {
        match self {
            Self::Closed | Self::SessionReleased => ErrorCode::NoSession.into(),
            Self::ResponseTimeout => ErrorCode::Timeout.into(),
            Self::TransportFailure => ErrorCode::TransportFailure.into(),
        }
    }
}

/// The consumer of the messages of one exchange.
///
/// The callbacks run on the event loop with the transport manager borrowed
/// through the [`ExchangeContext`], so a delegate can reply right away.
pub trait ExchangeDelegate {
    fn on_message_received(
        &mut self,
        ctx: &mut ExchangeContext,
        meta: &MessageMeta,
        payload: &[u8],
    ) -> Result<(), Error>;

    /// The response timeout elapsed. The exchange closes right after.
    fn on_response_timeout(&mut self) {}

    fn on_exchange_closing(&mut self, _reason: CloseReason) {}
}

/// Accepts exchanges opened by peers for one protocol
pub trait UnsolicitedHandler {
    /// Return the delegate for the new exchange, or `None` to reject the message
    fn on_unsolicited(
        &mut self,
        meta: &MessageMeta,
        session: SessionHandle,
    ) -> Option<Box<dyn ExchangeDelegate>>;
}

/// What an [`ExchangeDelegate`] gets to act on its exchange
pub struct ExchangeContext<'a> {
    mgr: &'a mut TransportMgr,
    exchange: ExchangeHandle,
}

impl<'a> ExchangeContext<'a> {
    pub(crate) fn new(mgr: &'a mut TransportMgr, exchange: ExchangeHandle) -> Self {
        Self { mgr, exchange }
    }

    pub fn exchange(&self) -> ExchangeHandle {
        self.exchange
    }

    pub fn session(&self) -> Option<SessionHandle> {
        self.mgr.exchange_session(self.exchange)
    }

    pub fn send(&mut self, meta: MessageMeta, payload: &[u8]) -> Result<(), Error> {
        self.mgr.send_message(self.exchange, meta, payload)
    }

    pub fn set_response_timeout(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        self.mgr.set_response_timeout(self.exchange, timeout)
    }

    pub fn close(&mut self) {
        self.mgr.close_exchange(self.exchange);
    }

    pub fn mgr(&mut self) -> &mut TransportMgr {
        self.mgr
    }
}

/// Who gets the messages of an exchange
pub(crate) enum ExchangeOwner {
    /// An application delegate; `None` while it is being called
    App(Option<Box<dyn ExchangeDelegate>>),
    /// A session establishment slot
    Handshake(u32),
    /// Nobody; the exchange only lives to answer or acknowledge
    Detached,
}

pub(crate) struct Exchange {
    pub handle: ExchangeHandle,
    pub exch_id: u16,
    pub role: Role,
    pub session: SessionHandle,
    pub mrp: ReliableMessage,
    pub owner: ExchangeOwner,
    pub response_timeout: Option<Duration>,
    pub response_timer: Option<CancellationToken>,
    /// Closed by its owner, kept until the last reliable message is acknowledged
    pub closing: bool,
}

impl Exchange {
    pub fn new(
        handle: ExchangeHandle,
        exch_id: u16,
        role: Role,
        session: SessionHandle,
        owner: ExchangeOwner,
        response_timeout: Option<Duration>,
    ) -> Self {
        Self {
            handle,
            exch_id,
            role,
            session,
            mrp: ReliableMessage::new(),
            owner,
            response_timeout,
            response_timer: None,
            closing: false,
        }
    }

    /// Whether a message received on `session` belongs to this exchange
    pub fn is_for_rx(&self, session: SessionHandle, rx_proto: &ProtoHdr) -> bool {
        self.session == session
            && self.exch_id == rx_proto.exch_id
            && rx_proto.is_initiator() == (self.role == Role::Responder)
    }

    pub fn set_response_timer(&mut self, token: Option<CancellationToken>) {
        if let Some(prev) = core::mem::replace(&mut self.response_timer, token) {
            prev.cancel();
        }
    }

    pub fn take_delegate(&mut self) -> Option<Box<dyn ExchangeDelegate>> {
        match &mut self.owner {
            ExchangeOwner::App(delegate) => delegate.take(),
            _ => None,
        }
    }

    pub fn restore_delegate(&mut self, delegate: Box<dyn ExchangeDelegate>) {
        if let ExchangeOwner::App(slot) = &mut self.owner {
            *slot = Some(delegate);
        }
    }
}

impl Drop for Exchange {
    fn drop(&mut self) {
        self.set_response_timer(None);
    }
}

impl Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [S:{},EID:{:x},{:?}]",
            self.handle, self.session, self.exch_id, self.role
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::transport::session::SessionTable;
    use crate::transport::session::SessionMode;
    use crate::transport::session_crypto::SessionRole;
    use crate::transport::network::Address;
    use crate::utils::rand::dummy_rand;

    fn session() -> SessionHandle {
        let mut table = SessionTable::new(2);
        table
            .create(
                SessionRole::Initiator,
                SessionMode::PlainText,
                Address::default(),
                Duration::ZERO,
                dummy_rand,
            )
            .unwrap()
    }

    #[test]
    fn meta_from_proto() {
        let mut proto = ProtoHdr::new();
        proto.proto_id = 0x0001;
        proto.proto_opcode = 0x02;
        proto.set_reliable(true);

        let meta = MessageMeta::from(&proto);
        assert_eq!(meta, MessageMeta::new(1, 2, true));

        let mut other = ProtoHdr::new();
        meta.reliable(false).set_into(&mut other);
        assert_eq!(other.proto_id, 1);
        assert_eq!(other.proto_opcode, 2);
        assert!(!other.is_reliable());
    }

    #[test]
    fn standalone_ack_meta() {
        let meta = OpCode::MRPStandAloneAck.meta();
        assert!(meta.is_standalone_ack());
        assert!(!meta.reliable);

        assert!(!MessageMeta::new(1, OpCode::MRPStandAloneAck as u8, false).is_standalone_ack());
        assert_eq!(
            meta.check_opcode(OpCode::StatusReport).unwrap_err().code(),
            ErrorCode::InvalidOpcode
        );
    }

    #[test]
    fn rx_matches_role_complement() {
        let sess = session();
        let exch = Exchange::new(
            ExchangeHandle::new(1),
            7,
            Role::Initiator,
            sess,
            ExchangeOwner::Detached,
            None,
        );

        let mut proto = ProtoHdr::new();
        proto.exch_id = 7;

        // A response from the peer's responder side
        proto.set_initiator(false);
        assert!(exch.is_for_rx(sess, &proto));

        // The peer opening its own exchange 7
        proto.set_initiator(true);
        assert!(!exch.is_for_rx(sess, &proto));

        proto.set_initiator(false);
        proto.exch_id = 8;
        assert!(!exch.is_for_rx(sess, &proto));
    }

    #[test]
    fn replacing_response_timer_cancels() {
        let mut exch = Exchange::new(
            ExchangeHandle::new(1),
            7,
            Role::Initiator,
            session(),
            ExchangeOwner::Detached,
            Some(Duration::from_secs(1)),
        );

        let first = CancellationToken::new();
        exch.set_response_timer(Some(first.clone()));
        exch.set_response_timer(Some(CancellationToken::new()));
        assert!(first.is_cancelled());

        let second = exch.response_timer.clone().unwrap();
        drop(exch);
        assert!(second.is_cancelled());
    }
}
