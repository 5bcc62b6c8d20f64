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

//! The session establishment state machines.
//!
//! A handshake never does I/O itself: every input (a received message, a
//! start request) yields the list of actions the transport has to carry out.
//! This keeps PASE and CASE testable by simply shuttling the `Send` payloads
//! of one machine into the other.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use log::{error, info};

use crate::crypto::{CryptoSensitive, SYMM_KEY_LEN_BYTES};
use crate::error::{Error, ErrorCode};
use crate::persist::KvStore;
use crate::tlv::TLVWriter;
use crate::transport::mrp::SessionParameters;
use crate::transport::session::{SessionHandle, SessionMode};
use crate::utils::rand::Rand;
use crate::utils::writebuf::WriteBuf;

use super::common::{check_sc_status, OpCode, SCStatusCodes};
use super::credentials::FabricTable;
use super::status_report::StatusReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakeKind {
    Pase,
    Case,
}

impl HandshakeKind {
    /// The kind of handshake an unsolicited secure channel message opens, if any
    pub fn from_opening(opcode: OpCode) -> Option<Self> {
        match opcode {
            OpCode::PBKDFParamRequest => Some(Self::Pase),
            OpCode::CASESigma1 => Some(Self::Case),
            _ => None,
        }
    }
}

impl fmt::Display for HandshakeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pase => write!(f, "PASE"),
            Self::Case => write!(f, "CASE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Sent1,
    Sent2,
    Sent3,
    Complete,
    Errored,
}

impl HandshakeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Errored)
    }
}

/// The I2R key, the R2I key and the attestation challenge, in that order
pub type SessionKeyMaterial = CryptoSensitive<{ 3 * SYMM_KEY_LEN_BYTES }>;

/// Everything needed to turn a reserved session into an active one
#[derive(Debug)]
pub struct NewSessionData {
    pub mode: SessionMode,
    pub peer_sess_id: u16,
    pub local_nodeid: u64,
    pub peer_nodeid: Option<u64>,
    pub keys: SessionKeyMaterial,
    pub peer_params: Option<SessionParameters>,
    pub resumed: bool,
}

impl NewSessionData {
    pub fn i2r_key(&self) -> &[u8] {
        &self.keys.access()[..SYMM_KEY_LEN_BYTES]
    }

    pub fn r2i_key(&self) -> &[u8] {
        &self.keys.access()[SYMM_KEY_LEN_BYTES..2 * SYMM_KEY_LEN_BYTES]
    }

    pub fn att_challenge(&self) -> &[u8] {
        &self.keys.access()[2 * SYMM_KEY_LEN_BYTES..]
    }
}

#[derive(Debug)]
pub enum HandshakeAction {
    /// Send a handshake message on the handshake exchange
    Send { opcode: OpCode, payload: Vec<u8> },
    /// Send a status report on the handshake exchange
    SendStatus(SCStatusCodes),
    /// Activate the reserved session with this material
    Established(Box<NewSessionData>),
    /// The handshake is over and failed
    Failed(Error),
}

pub type HandshakeActions = Vec<HandshakeAction>;

/// What a handshake may use from its surroundings while processing an input
pub struct HandshakeEnv<'a> {
    pub rand: Rand,
    pub store: &'a mut dyn KvStore,
    pub fabrics: &'a FabricTable,
    /// MRP parameters we advertise
    pub local_params: SessionParameters,
    /// The id of the session reserved for the outcome
    pub local_sess_id: u16,
}

pub trait Handshake {
    fn kind(&self) -> HandshakeKind;

    fn state(&self) -> HandshakeState;

    /// Produce the opening message. Only initiators open; responders return
    /// no actions.
    fn start(&mut self, env: &mut HandshakeEnv) -> HandshakeActions;

    /// Process a secure channel message received on the handshake exchange
    fn handle(&mut self, opcode: OpCode, payload: &[u8], env: &mut HandshakeEnv) -> HandshakeActions;

    /// Give up, e.g. on timeout, dropping all transient key material
    fn abort(&mut self);
}

/// Notified of the outcome of a handshake
pub trait HandshakeDelegate {
    fn on_established(&mut self, session: SessionHandle);

    fn on_failed(&mut self, err: Error);
}

/// The result of one successful state machine step
pub(crate) struct Step {
    pub next: HandshakeState,
    pub actions: HandshakeActions,
}

impl Step {
    pub fn send(next: HandshakeState, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            next,
            actions: vec![HandshakeAction::Send { opcode, payload }],
        }
    }

    /// Report success to the peer and activate the session
    pub fn establish_with_status(data: NewSessionData) -> Self {
        Self {
            next: HandshakeState::Complete,
            actions: vec![
                HandshakeAction::SendStatus(SCStatusCodes::SessionEstablishmentSuccess),
                HandshakeAction::Established(Box::new(data)),
            ],
        }
    }

    pub fn establish(data: NewSessionData) -> Self {
        Self {
            next: HandshakeState::Complete,
            actions: vec![HandshakeAction::Established(Box::new(data))],
        }
    }
}

/// Apply the outcome of a step.
///
/// Local failures move the machine to `Errored` and report a status to the
/// peer, so its own handshake does not have to time out.
pub(crate) fn conclude(
    kind: HandshakeKind,
    state: &mut HandshakeState,
    result: Result<Step, Error>,
) -> HandshakeActions {
    match result {
        Ok(step) => {
            if step.next == HandshakeState::Complete {
                info!("{} handshake complete", kind);
            }

            *state = step.next;
            step.actions
        }
        Err(e) => {
            error!("{} handshake failed in state {:?}: {}", kind, state, e);

            *state = HandshakeState::Errored;

            let status = SCStatusCodes::from_error(&e);
            vec![
                HandshakeAction::SendStatus(status),
                HandshakeAction::Failed(e.map_invalid(ErrorCode::HandshakeFailed.into())),
            ]
        }
    }
}

/// Apply a failure that must not be reported to the peer, because the peer
/// either reported it or was never contacted.
pub(crate) fn conclude_silently(
    kind: HandshakeKind,
    state: &mut HandshakeState,
    err: Error,
) -> HandshakeActions {
    error!("{} handshake failed in state {:?}: {}", kind, state, err);

    *state = HandshakeState::Errored;
    vec![HandshakeAction::Failed(err)]
}

/// Interpret a status report received in the middle of a handshake
pub(crate) fn peer_status(payload: &[u8]) -> Result<(), Error> {
    let report = StatusReport::read(payload)?;

    if let Some(wait) = report.busy_wait_ms() {
        info!("Peer is busy, asks to wait {} ms", wait);
    }

    check_sc_status(&report)
}

pub(crate) const MAX_HANDSHAKE_PAYLOAD: usize = 1024;

/// Serialize a TLV payload through `f` into a right-sized vector
pub(crate) fn tlv_payload<F>(max_len: usize, f: F) -> Result<Vec<u8>, Error>
where
    F: FnOnce(&mut TLVWriter) -> Result<(), Error>,
{
    let mut buf = vec![0; max_len];

    let len = {
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);
        f(&mut tw)?;

        wb.len()
    };

    buf.truncate(len);

    Ok(buf)
}

pub(crate) fn expect_opcode(received: OpCode, expected: OpCode) -> Result<(), Error> {
    if received != expected {
        error!("Expected {:?}, received {:?}", expected, received);
        Err(ErrorCode::InvalidOpcode)?;
    }

    Ok(())
}
