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

use alloc::vec::Vec;

use num_derive::FromPrimitive;

use crate::error::*;
use crate::tlv::{TLVElement, TLVWriter, TagType};
use crate::transport::exchange::MessageMeta;
use crate::transport::mrp::SessionParameters;
use crate::utils::writebuf::WriteBuf;

use super::status_report::{GeneralCode, StatusReport};

/* Secure Channel Protocol ID as per the Matter Spec */
pub const PROTO_ID_SECURE_CHANNEL: u16 = 0x00;

/// Largest secure channel payload this implementation produces
pub const MAX_SC_PAYLOAD_LEN: usize = 1024;

#[derive(FromPrimitive, Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
    MsgCounterSyncReq = 0x00,
    MsgCounterSyncResp = 0x01,
    MRPStandAloneAck = 0x10,
    PBKDFParamRequest = 0x20,
    PBKDFParamResponse = 0x21,
    PASEPake1 = 0x22,
    PASEPake2 = 0x23,
    PASEPake3 = 0x24,
    CASESigma1 = 0x30,
    CASESigma2 = 0x31,
    CASESigma3 = 0x32,
    CASESigma2Resume = 0x33,
    StatusReport = 0x40,
}

impl OpCode {
    pub fn meta(&self) -> MessageMeta {
        MessageMeta {
            proto_id: PROTO_ID_SECURE_CHANNEL,
            proto_opcode: *self as u8,
            reliable: !matches!(self, Self::MRPStandAloneAck),
        }
    }

    pub fn is_tlv(&self) -> bool {
        !matches!(
            self,
            Self::MRPStandAloneAck
                | Self::StatusReport
                | Self::MsgCounterSyncReq
                | Self::MsgCounterSyncResp
        )
    }

    /// Whether the message opens a new session establishment
    pub fn is_handshake_start(&self) -> bool {
        matches!(self, Self::PBKDFParamRequest | Self::CASESigma1)
    }
}

impl From<OpCode> for MessageMeta {
    fn from(op: OpCode) -> Self {
        op.meta()
    }
}

#[derive(FromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
pub enum SCStatusCodes {
    SessionEstablishmentSuccess = 0,
    NoSharedTrustRoots = 1,
    InvalidParameter = 2,
    CloseSession = 3,
    Busy = 4,
    SessionNotFound = 5,
}

impl SCStatusCodes {
    pub fn reliable(&self) -> bool {
        // CloseSession and Busy are sent without the R flag raised
        !matches!(self, SCStatusCodes::CloseSession | SCStatusCodes::Busy)
    }

    pub fn as_report<'a>(&self, payload: &'a [u8]) -> StatusReport<'a> {
        let general_code = match self {
            SCStatusCodes::SessionEstablishmentSuccess => GeneralCode::Success,
            SCStatusCodes::CloseSession => GeneralCode::Success,
            SCStatusCodes::Busy => GeneralCode::Busy,
            SCStatusCodes::InvalidParameter
            | SCStatusCodes::NoSharedTrustRoots
            | SCStatusCodes::SessionNotFound => GeneralCode::Failure,
        };

        StatusReport {
            general_code,
            proto_id: PROTO_ID_SECURE_CHANNEL as u32,
            proto_code: *self as u16,
            proto_data: payload,
        }
    }

    /// The status to report to the peer when a handshake fails locally with `err`
    pub fn from_error(err: &Error) -> Self {
        match err.code() {
            ErrorCode::NoSharedTrustRoots | ErrorCode::NotFound => Self::NoSharedTrustRoots,
            ErrorCode::Busy | ErrorCode::NoSpaceSessions => Self::Busy,
            _ => Self::InvalidParameter,
        }
    }
}

/// Encode a secure channel status report
pub fn sc_write(status_code: SCStatusCodes, payload: &[u8]) -> Result<(MessageMeta, Vec<u8>), Error> {
    let mut buf = [0; 64];
    let mut wb = WriteBuf::new(&mut buf);
    status_code.as_report(payload).write(&mut wb)?;

    let mut meta = OpCode::StatusReport.meta();
    meta.reliable = status_code.reliable();

    Ok((meta, wb.as_slice().to_vec()))
}

/// Map a status report received from the peer during a handshake to a local outcome
pub fn check_sc_status(report: &StatusReport) -> Result<(), Error> {
    if report.general_code == GeneralCode::Success
        && report.proto_id == PROTO_ID_SECURE_CHANNEL as u32
        && report.proto_code == SCStatusCodes::SessionEstablishmentSuccess as u16
    {
        return Ok(());
    }

    let code = match num::FromPrimitive::from_u16(report.proto_code) {
        Some(SCStatusCodes::Busy) => ErrorCode::Busy,
        Some(SCStatusCodes::NoSharedTrustRoots) => ErrorCode::NoSharedTrustRoots,
        Some(SCStatusCodes::SessionNotFound) => ErrorCode::NoSession,
        _ => ErrorCode::HandshakeFailed,
    };

    Err(code.into())
}

const PARAMS_TAG_IDLE_INTERVAL: u8 = 1;
const PARAMS_TAG_ACTIVE_INTERVAL: u8 = 2;
const PARAMS_TAG_ACTIVE_THRESHOLD: u8 = 3;

/// Write the MRP session parameters structure
pub fn write_session_params(
    tw: &mut TLVWriter,
    tag: TagType,
    params: &SessionParameters,
) -> Result<(), Error> {
    tw.start_struct(tag)?;

    if let Some(idle) = params.idle_retrans_interval {
        tw.u32(
            TagType::Context(PARAMS_TAG_IDLE_INTERVAL),
            idle.as_millis().min(u32::MAX as u128) as u32,
        )?;
    }

    if let Some(active) = params.active_retrans_interval {
        tw.u32(
            TagType::Context(PARAMS_TAG_ACTIVE_INTERVAL),
            active.as_millis().min(u32::MAX as u128) as u32,
        )?;
    }

    if let Some(threshold) = params.active_threshold {
        tw.u16(
            TagType::Context(PARAMS_TAG_ACTIVE_THRESHOLD),
            threshold.as_millis().min(u16::MAX as u128) as u16,
        )?;
    }

    tw.end_container()
}

pub fn read_session_params(element: &TLVElement) -> Result<SessionParameters, Error> {
    let element = element.confirm_struct()?;

    Ok(SessionParameters {
        idle_retrans_interval: element
            .opt_find_tag(PARAMS_TAG_IDLE_INTERVAL)?
            .map(|e| e.u32())
            .transpose()?
            .map(|ms| Duration::from_millis(ms as u64)),
        active_retrans_interval: element
            .opt_find_tag(PARAMS_TAG_ACTIVE_INTERVAL)?
            .map(|e| e.u32())
            .transpose()?
            .map(|ms| Duration::from_millis(ms as u64)),
        active_threshold: element
            .opt_find_tag(PARAMS_TAG_ACTIVE_THRESHOLD)?
            .map(|e| e.u16())
            .transpose()?
            .map(|ms| Duration::from_millis(ms as u64)),
    })
}
