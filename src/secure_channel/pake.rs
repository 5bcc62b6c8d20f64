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

use alloc::vec::Vec;

use log::{debug, error};

use crate::crypto::{self, EC_POINT_LEN_BYTES};
use crate::error::{Error, ErrorCode};
use crate::tlv::{get_root_node_struct, TLVElement, TagType};
use crate::transport::mrp::SessionParameters;
use crate::transport::session::SessionMode;

use super::common::{read_session_params, write_session_params, OpCode};
use super::handshake::{
    conclude, conclude_silently, expect_opcode, peer_status, tlv_payload, Handshake,
    HandshakeActions, HandshakeEnv, HandshakeKind, HandshakeState, NewSessionData,
    SessionKeyMaterial, Step, MAX_HANDSHAKE_PAYLOAD,
};
use super::spake2p::{
    Spake2P, VerifierData, CONFIRM_LEN_BYTES, KE_LEN_BYTES, MAX_ITERATION_COUNT,
    MAX_SALT_SIZE_BYTES, MIN_ITERATION_COUNT, MIN_SALT_SIZE_BYTES,
};

const SPAKE2_SESSION_KEYS_INFO: &[u8] = b"SessionKeys";

const RANDOM_LEN: usize = 32;

fn session_keys(ke: &[u8; KE_LEN_BYTES]) -> Result<SessionKeyMaterial, Error> {
    let mut keys = SessionKeyMaterial::new();
    crypto::hkdf_sha256(&[], ke, SPAKE2_SESSION_KEYS_INFO, keys.access_mut())?;

    Ok(keys)
}

fn pake_payload(first: &[u8], second: Option<&[u8]>) -> Result<Vec<u8>, Error> {
    tlv_payload(MAX_HANDSHAKE_PAYLOAD, |tw| {
        tw.start_struct(TagType::Anonymous)?;
        tw.str8(TagType::Context(1), first)?;
        if let Some(second) = second {
            tw.str8(TagType::Context(2), second)?;
        }
        tw.end_container()
    })
}

fn opt_session_params(root: &TLVElement, tag: u8) -> Result<Option<SessionParameters>, Error> {
    root.opt_find_tag(tag)?
        .map(|params| read_session_params(&params))
        .transpose()
}

struct PBKDFParamReq<'a> {
    initiator_random: &'a [u8],
    initiator_ssid: u16,
    passcode_id: u16,
    has_params: bool,
    params: Option<SessionParameters>,
}

impl<'a> PBKDFParamReq<'a> {
    fn read(payload: &'a [u8]) -> Result<Self, Error> {
        let root = get_root_node_struct(payload)?;

        let initiator_random = root.find_tag(1)?.slice()?;
        if initiator_random.len() != RANDOM_LEN {
            Err(ErrorCode::InvalidData)?;
        }

        Ok(Self {
            initiator_random,
            initiator_ssid: root.find_tag(2)?.u16()?,
            passcode_id: root.find_tag(3)?.u16()?,
            has_params: root.find_tag(4)?.bool()?,
            params: opt_session_params(&root, 5)?,
        })
    }
}

struct PBKDFParamResp<'a> {
    initiator_random: &'a [u8],
    responder_sessid: u16,
    iterations: u32,
    salt: &'a [u8],
    params: Option<SessionParameters>,
}

impl<'a> PBKDFParamResp<'a> {
    fn read(payload: &'a [u8]) -> Result<Self, Error> {
        let root = get_root_node_struct(payload)?;

        let pbkdf = root.find_tag(4)?.confirm_struct()?;

        Ok(Self {
            initiator_random: root.find_tag(1)?.slice()?,
            responder_sessid: root.find_tag(3)?.u16()?,
            iterations: pbkdf.find_tag(1)?.u32()?,
            salt: pbkdf.find_tag(2)?.slice()?,
            params: opt_session_params(&root, 5)?,
        })
    }
}

/// The commissioner side of PASE: knows the passcode, proves it to the device
pub struct PaseProver {
    state: HandshakeState,
    passcode: u32,
    spake2p: Spake2P,
    our_random: [u8; RANDOM_LEN],
    peer_sess_id: u16,
    peer_params: Option<SessionParameters>,
    keys: Option<SessionKeyMaterial>,
}

impl PaseProver {
    pub fn new(passcode: u32) -> Self {
        Self {
            state: HandshakeState::Idle,
            passcode,
            spake2p: Spake2P::new(),
            our_random: [0; RANDOM_LEN],
            peer_sess_id: 0,
            peer_params: None,
            keys: None,
        }
    }

    fn send_param_request(&mut self, env: &mut HandshakeEnv) -> Result<Step, Error> {
        (env.rand)(&mut self.our_random);

        let payload = tlv_payload(MAX_HANDSHAKE_PAYLOAD, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str8(TagType::Context(1), &self.our_random)?;
            tw.u16(TagType::Context(2), env.local_sess_id)?;
            tw.u16(TagType::Context(3), 0)?;
            tw.bool(TagType::Context(4), false)?;
            write_session_params(tw, TagType::Context(5), &env.local_params)?;
            tw.end_container()
        })?;

        self.spake2p.set_context()?;
        self.spake2p.update_context(&payload)?;

        Ok(Step::send(
            HandshakeState::Sent1,
            OpCode::PBKDFParamRequest,
            payload,
        ))
    }

    fn handle_param_response(&mut self, payload: &[u8], env: &mut HandshakeEnv) -> Result<Step, Error> {
        let resp = PBKDFParamResp::read(payload)?;

        if resp.initiator_random != self.our_random {
            error!("PBKDFParamResponse does not echo our random");
            Err(ErrorCode::InvalidData)?;
        }

        if !(MIN_ITERATION_COUNT..=MAX_ITERATION_COUNT).contains(&resp.iterations)
            || !(MIN_SALT_SIZE_BYTES..=MAX_SALT_SIZE_BYTES).contains(&resp.salt.len())
        {
            error!(
                "Unacceptable PBKDF parameters: {} iterations, {} byte salt",
                resp.iterations,
                resp.salt.len()
            );
            Err(ErrorCode::InvalidData)?;
        }

        self.peer_sess_id = resp.responder_sessid;
        self.peer_params = resp.params;

        self.spake2p.update_context(payload)?;

        #[allow(non_snake_case)]
        let pA = self
            .spake2p
            .start_prover(self.passcode, resp.salt, resp.iterations, env.rand)?;

        Ok(Step::send(
            HandshakeState::Sent2,
            OpCode::PASEPake1,
            pake_payload(&pA, None)?,
        ))
    }

    #[allow(non_snake_case)]
    fn handle_pake2(&mut self, payload: &[u8]) -> Result<Step, Error> {
        let root = get_root_node_struct(payload)?;
        let pB = root.find_tag(1)?.slice()?;
        let cB = root.find_tag(2)?.slice()?;

        if pB.len() != EC_POINT_LEN_BYTES || cB.len() != CONFIRM_LEN_BYTES {
            Err(ErrorCode::InvalidData)?;
        }

        let cA = self.spake2p.handle_pB_cB(pB, cB)?;
        self.keys = Some(session_keys(&self.spake2p.prover_ke()?)?);

        Ok(Step::send(
            HandshakeState::Sent3,
            OpCode::PASEPake3,
            pake_payload(&cA, None)?,
        ))
    }

    fn step(&mut self, opcode: OpCode, payload: &[u8], env: &mut HandshakeEnv) -> Result<Step, Error> {
        match self.state {
            HandshakeState::Sent1 => {
                expect_opcode(opcode, OpCode::PBKDFParamResponse)?;
                self.handle_param_response(payload, env)
            }
            HandshakeState::Sent2 => {
                expect_opcode(opcode, OpCode::PASEPake2)?;
                self.handle_pake2(payload)
            }
            _ => Err(ErrorCode::InvalidState.into()),
        }
    }

    fn established(&mut self) -> Result<Step, Error> {
        if self.state != HandshakeState::Sent3 {
            Err(ErrorCode::InvalidState)?;
        }

        let keys = self.keys.take().ok_or(ErrorCode::InvalidState)?;

        Ok(Step::establish(NewSessionData {
            mode: SessionMode::Pase,
            peer_sess_id: self.peer_sess_id,
            local_nodeid: 0,
            peer_nodeid: None,
            keys,
            peer_params: self.peer_params.clone(),
            resumed: false,
        }))
    }
}

impl Handshake for PaseProver {
    fn kind(&self) -> HandshakeKind {
        HandshakeKind::Pase
    }

    fn state(&self) -> HandshakeState {
        self.state
    }

    fn start(&mut self, env: &mut HandshakeEnv) -> HandshakeActions {
        if self.state != HandshakeState::Idle {
            return conclude_silently(
                HandshakeKind::Pase,
                &mut self.state,
                ErrorCode::InvalidState.into(),
            );
        }

        match self.send_param_request(env) {
            Ok(step) => conclude(HandshakeKind::Pase, &mut self.state, Ok(step)),
            Err(e) => conclude_silently(HandshakeKind::Pase, &mut self.state, e),
        }
    }

    fn handle(&mut self, opcode: OpCode, payload: &[u8], env: &mut HandshakeEnv) -> HandshakeActions {
        if self.state.is_terminal() {
            debug!("PASE: ignoring {:?} in state {:?}", opcode, self.state);
            return HandshakeActions::new();
        }

        let actions = if opcode == OpCode::StatusReport {
            match peer_status(payload) {
                Ok(()) => {
                    let result = self.established();
                    conclude(HandshakeKind::Pase, &mut self.state, result)
                }
                Err(e) => conclude_silently(HandshakeKind::Pase, &mut self.state, e),
            }
        } else {
            let result = self.step(opcode, payload, env);
            conclude(HandshakeKind::Pase, &mut self.state, result)
        };

        if self.state == HandshakeState::Errored {
            self.abort();
        }

        actions
    }

    fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = HandshakeState::Errored;
        }

        self.keys = None;
        self.spake2p = Spake2P::new();
    }
}

/// The commissionee side of PASE: holds a verifier for the passcode
pub struct PaseVerifier {
    state: HandshakeState,
    verifier: VerifierData,
    spake2p: Spake2P,
    peer_sess_id: u16,
    peer_params: Option<SessionParameters>,
}

impl PaseVerifier {
    pub fn new(verifier: VerifierData) -> Self {
        Self {
            state: HandshakeState::Idle,
            verifier,
            spake2p: Spake2P::new(),
            peer_sess_id: 0,
            peer_params: None,
        }
    }

    fn handle_param_request(&mut self, payload: &[u8], env: &mut HandshakeEnv) -> Result<Step, Error> {
        let req = PBKDFParamReq::read(payload)?;
        if req.passcode_id != 0 {
            error!("Can't yet handle passcode_id != 0");
            Err(ErrorCode::InvalidData)?;
        }

        self.peer_sess_id = req.initiator_ssid;
        self.peer_params = req.params;

        let mut our_random = [0; RANDOM_LEN];
        (env.rand)(&mut our_random);

        let verifier = &self.verifier;
        let resp = tlv_payload(MAX_HANDSHAKE_PAYLOAD, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str8(TagType::Context(1), req.initiator_random)?;
            tw.str8(TagType::Context(2), &our_random)?;
            tw.u16(TagType::Context(3), env.local_sess_id)?;
            if !req.has_params {
                tw.start_struct(TagType::Context(4))?;
                tw.u32(TagType::Context(1), verifier.count)?;
                tw.str8(TagType::Context(2), &verifier.salt)?;
                tw.end_container()?;
            }
            write_session_params(tw, TagType::Context(5), &env.local_params)?;
            tw.end_container()
        })?;

        self.spake2p.set_context()?;
        self.spake2p.update_context(payload)?;
        self.spake2p.update_context(&resp)?;
        self.spake2p.start_verifier(&self.verifier)?;

        Ok(Step::send(
            HandshakeState::Sent1,
            OpCode::PBKDFParamResponse,
            resp,
        ))
    }

    #[allow(non_snake_case)]
    fn handle_pake1(&mut self, payload: &[u8], env: &mut HandshakeEnv) -> Result<Step, Error> {
        let root = get_root_node_struct(payload)?;
        let pA = root.find_tag(1)?.slice()?;
        if pA.len() != EC_POINT_LEN_BYTES {
            Err(ErrorCode::InvalidData)?;
        }

        let (pB, cB) = self.spake2p.handle_pA(pA, env.rand)?;

        Ok(Step::send(
            HandshakeState::Sent2,
            OpCode::PASEPake2,
            pake_payload(&pB, Some(&cB))?,
        ))
    }

    #[allow(non_snake_case)]
    fn handle_pake3(&mut self, payload: &[u8]) -> Result<Step, Error> {
        let root = get_root_node_struct(payload)?;
        let cA = root.find_tag(1)?.slice()?;

        let ke = self.spake2p.handle_cA(cA)?;

        Ok(Step::establish_with_status(NewSessionData {
            mode: SessionMode::Pase,
            peer_sess_id: self.peer_sess_id,
            local_nodeid: 0,
            peer_nodeid: None,
            keys: session_keys(&ke)?,
            peer_params: self.peer_params.clone(),
            resumed: false,
        }))
    }

    fn step(&mut self, opcode: OpCode, payload: &[u8], env: &mut HandshakeEnv) -> Result<Step, Error> {
        match self.state {
            HandshakeState::Idle => {
                expect_opcode(opcode, OpCode::PBKDFParamRequest)?;
                self.handle_param_request(payload, env)
            }
            HandshakeState::Sent1 => {
                expect_opcode(opcode, OpCode::PASEPake1)?;
                self.handle_pake1(payload, env)
            }
            HandshakeState::Sent2 => {
                expect_opcode(opcode, OpCode::PASEPake3)?;
                self.handle_pake3(payload)
            }
            _ => Err(ErrorCode::InvalidState.into()),
        }
    }
}

impl Handshake for PaseVerifier {
    fn kind(&self) -> HandshakeKind {
        HandshakeKind::Pase
    }

    fn state(&self) -> HandshakeState {
        self.state
    }

    fn start(&mut self, _env: &mut HandshakeEnv) -> HandshakeActions {
        HandshakeActions::new()
    }

    fn handle(&mut self, opcode: OpCode, payload: &[u8], env: &mut HandshakeEnv) -> HandshakeActions {
        if self.state.is_terminal() {
            debug!("PASE: ignoring {:?} in state {:?}", opcode, self.state);
            return HandshakeActions::new();
        }

        let actions = if opcode == OpCode::StatusReport {
            // Whatever the prover reports, it gave up
            let err = peer_status(payload)
                .err()
                .unwrap_or_else(|| ErrorCode::InvalidState.into());
            conclude_silently(HandshakeKind::Pase, &mut self.state, err)
        } else {
            let result = self.step(opcode, payload, env);
            conclude(HandshakeKind::Pase, &mut self.state, result)
        };

        if self.state == HandshakeState::Errored {
            self.abort();
        }

        actions
    }

    fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = HandshakeState::Errored;
        }

        self.spake2p = Spake2P::new();
    }
}
