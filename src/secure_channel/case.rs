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

use log::{debug, error, info, warn};

use crate::crypto::{
    self, CryptoSensitive, KeyPair, Sha256, AEAD_MIC_LEN_BYTES, AEAD_NONCE_LEN_BYTES,
    ECDH_SHARED_SECRET_LEN_BYTES, EC_POINT_LEN_BYTES, SHA256_HASH_LEN_BYTES, SYMM_KEY_LEN_BYTES,
};
use crate::error::{Error, ErrorCode};
use crate::tlv::{get_root_node_struct, TLVElement, TagType};
use crate::transport::mrp::SessionParameters;
use crate::transport::session::SessionMode;

use super::common::{read_session_params, write_session_params, OpCode};
use super::credentials::{FabricTable, LocalFabric, MAX_CERT_LEN};
use super::handshake::{
    conclude, conclude_silently, expect_opcode, peer_status, tlv_payload, Handshake,
    HandshakeActions, HandshakeEnv, HandshakeKind, HandshakeState, NewSessionData,
    SessionKeyMaterial, Step,
};
use super::resumption::{ResumptionRecord, RESUMPTION_ID_LEN};

const S2K_INFO: &[u8] = b"Sigma2";
const S3K_INFO: &[u8] = b"Sigma3";
const SEKEYS_INFO: &[u8] = b"SessionKeys";
const S1RK_INFO: &[u8] = b"Sigma1_Resume";
const S2RK_INFO: &[u8] = b"Sigma2_Resume";
const RESUME_SEKEYS_INFO: &[u8] = b"SessionResumptionKeys";

const TBE2_NONCE: &[u8; AEAD_NONCE_LEN_BYTES] = b"NCASE_Sigma2N";
const TBE3_NONCE: &[u8; AEAD_NONCE_LEN_BYTES] = b"NCASE_Sigma3N";
const RESUME1_MIC_NONCE: &[u8; AEAD_NONCE_LEN_BYTES] = b"NCASE_SigmaS1";
const RESUME2_MIC_NONCE: &[u8; AEAD_NONCE_LEN_BYTES] = b"NCASE_SigmaS2";

const RANDOM_LEN: usize = 32;

type SharedSecret = CryptoSensitive<ECDH_SHARED_SECRET_LEN_BYTES>;

const MAX_TBS_SIZE: usize = 2 * MAX_CERT_LEN + 2 * EC_POINT_LEN_BYTES + 16;
const MAX_TBE_SIZE: usize = 2 * MAX_CERT_LEN + 128;
const MAX_SIGMA_SIZE: usize = MAX_TBE_SIZE + 256;

fn tt_hash(tt: &Sha256) -> Result<[u8; SHA256_HASH_LEN_BYTES], Error> {
    let mut hash = [0; SHA256_HASH_LEN_BYTES];
    tt.clone().finish(&mut hash)?;

    Ok(hash)
}

/// HKDF with a salt made of the concatenation of `salt`
fn kdf(salt: &[&[u8]], ikm: &[u8], info: &[u8], key: &mut [u8]) -> Result<(), Error> {
    let mut concat = heapless::Vec::<u8, 256>::new();
    for part in salt {
        concat
            .extend_from_slice(part)
            .map_err(|_| ErrorCode::NoSpace)?;
    }

    crypto::hkdf_sha256(&concat, ikm, info, key)
}

fn symm_key(salt: &[&[u8]], ikm: &[u8], info: &[u8]) -> Result<[u8; SYMM_KEY_LEN_BYTES], Error> {
    let mut key = [0; SYMM_KEY_LEN_BYTES];
    kdf(salt, ikm, info, &mut key)?;

    Ok(key)
}

/// A resumption MIC is the tag of an AES-CCM encryption of nothing
fn resume_mic(key: &[u8], nonce: &[u8]) -> Result<[u8; AEAD_MIC_LEN_BYTES], Error> {
    let mut mic = [0; AEAD_MIC_LEN_BYTES];
    crypto::encrypt_in_place(key, nonce, &[], &mut mic, 0)?;

    Ok(mic)
}

fn check_resume_mic(key: &[u8], nonce: &[u8], mic: &[u8]) -> Result<(), Error> {
    let mut buf: [u8; AEAD_MIC_LEN_BYTES] = mic.try_into().map_err(|_| ErrorCode::InvalidData)?;
    crypto::decrypt_in_place(key, nonce, &[], &mut buf)?;

    Ok(())
}

fn write_tbs(noc: &[u8], icac: Option<&[u8]>, our_key: &[u8], peer_key: &[u8]) -> Result<Vec<u8>, Error> {
    tlv_payload(MAX_TBS_SIZE, |tw| {
        tw.start_struct(TagType::Anonymous)?;
        tw.str16(TagType::Context(1), noc)?;
        if let Some(icac) = icac {
            tw.str16(TagType::Context(2), icac)?;
        }
        tw.str8(TagType::Context(3), our_key)?;
        tw.str8(TagType::Context(4), peer_key)?;
        tw.end_container()
    })
}

/// Encrypt a TBE structure whose trailing member is written by `f`
fn encrypt_tbe<F>(fabric: &LocalFabric, key: &[u8], nonce: &[u8], f: F) -> Result<Vec<u8>, Error>
where
    F: FnOnce(&mut crate::tlv::TLVWriter) -> Result<(), Error>,
{
    let mut tbe = tlv_payload(MAX_TBE_SIZE, |tw| {
        tw.start_struct(TagType::Anonymous)?;
        tw.str16(TagType::Context(1), fabric.noc())?;
        if let Some(icac) = fabric.icac() {
            tw.str16(TagType::Context(2), icac)?;
        }
        f(tw)?;
        tw.end_container()
    })?;

    let len = tbe.len();
    tbe.resize(len + AEAD_MIC_LEN_BYTES, 0);
    crypto::encrypt_in_place(key, nonce, &[], &mut tbe, len)?;

    Ok(tbe)
}

fn decrypt_tbe(key: &[u8], nonce: &[u8], encrypted: &[u8]) -> Result<Vec<u8>, Error> {
    if encrypted.len() <= AEAD_MIC_LEN_BYTES || encrypted.len() > MAX_TBE_SIZE + AEAD_MIC_LEN_BYTES {
        error!("Encrypted TBE of unexpected size {}", encrypted.len());
        Err(ErrorCode::InvalidData)?;
    }

    let mut decrypted = encrypted.to_vec();
    let len = crypto::decrypt_in_place(key, nonce, &[], &mut decrypted)?;
    decrypted.truncate(len);

    Ok(decrypted)
}

fn opt_session_params(root: &TLVElement, tag: u8) -> Result<Option<SessionParameters>, Error> {
    root.opt_find_tag(tag)?
        .map(|params| read_session_params(&params))
        .transpose()
}

fn check_pub_key(key: &[u8]) -> Result<&[u8; EC_POINT_LEN_BYTES], Error> {
    key.try_into().map_err(|_| {
        error!("Invalid public key length {}", key.len());
        ErrorCode::InvalidData.into()
    })
}

struct Sigma1<'a> {
    initiator_random: &'a [u8],
    initiator_sessid: u16,
    dest_id: &'a [u8],
    peer_pub_key: &'a [u8; EC_POINT_LEN_BYTES],
    params: Option<SessionParameters>,
    resumption: Option<(&'a [u8], &'a [u8])>,
}

impl<'a> Sigma1<'a> {
    fn read(payload: &'a [u8]) -> Result<Self, Error> {
        let root = get_root_node_struct(payload)?;

        let initiator_random = root.find_tag(1)?.slice()?;
        if initiator_random.len() != RANDOM_LEN {
            Err(ErrorCode::InvalidData)?;
        }

        let resumption_id = root.opt_find_tag(6)?.map(|e| e.slice()).transpose()?;
        let resume_mic = root.opt_find_tag(7)?.map(|e| e.slice()).transpose()?;

        let resumption = match (resumption_id, resume_mic) {
            (Some(id), Some(mic)) if id.len() == RESUMPTION_ID_LEN => Some((id, mic)),
            (None, None) => None,
            _ => {
                error!("Sigma1 with an incomplete resumption request");
                Err(ErrorCode::InvalidData)?
            }
        };

        Ok(Self {
            initiator_random,
            initiator_sessid: root.find_tag(2)?.u16()?,
            dest_id: root.find_tag(3)?.slice()?,
            peer_pub_key: check_pub_key(root.find_tag(4)?.slice()?)?,
            params: opt_session_params(&root, 5)?,
            resumption,
        })
    }
}

/// The initiator of CASE towards a given node of one of our fabrics
pub struct CaseInitiator {
    state: HandshakeState,
    fabric_idx: u8,
    peer_node_id: u64,
    eph_key: Option<KeyPair>,
    our_pub_key: [u8; EC_POINT_LEN_BYTES],
    initiator_random: [u8; RANDOM_LEN],
    tt: Option<Sha256>,
    shared_secret: SharedSecret,
    resumption: Option<ResumptionRecord>,
    pending: Option<NewSessionData>,
    new_record: Option<ResumptionRecord>,
}

impl CaseInitiator {
    pub fn new(fabric_idx: u8, peer_node_id: u64) -> Self {
        Self {
            state: HandshakeState::Idle,
            fabric_idx,
            peer_node_id,
            eph_key: None,
            our_pub_key: [0; EC_POINT_LEN_BYTES],
            initiator_random: [0; RANDOM_LEN],
            tt: None,
            shared_secret: SharedSecret::new(),
            resumption: None,
            pending: None,
            new_record: None,
        }
    }

    fn fabric<'a>(&self, fabrics: &'a FabricTable) -> Result<&'a LocalFabric, Error> {
        fabrics.get(self.fabric_idx).ok_or_else(|| {
            error!("Fabric index {} not found", self.fabric_idx);
            ErrorCode::NotFound.into()
        })
    }

    fn send_sigma1(&mut self, env: &mut HandshakeEnv) -> Result<Step, Error> {
        let fabric = self.fabric(env.fabrics)?;

        (env.rand)(&mut self.initiator_random);

        let eph_key = KeyPair::new(env.rand)?;
        self.our_pub_key = eph_key.public_key_bytes()?;
        self.eph_key = Some(eph_key);

        let dest_id = fabric.dest_id(&self.initiator_random, self.peer_node_id)?;

        self.resumption =
            ResumptionRecord::load_by_peer(&*env.store, self.fabric_idx, self.peer_node_id)?;

        let resume = match &self.resumption {
            Some(record) => {
                let s1rk = symm_key(
                    &[&self.initiator_random, &record.resumption_id],
                    &record.shared_secret,
                    S1RK_INFO,
                )?;

                debug!("Attempting CASE resumption with {:016x}", self.peer_node_id);
                Some((record.resumption_id, resume_mic(&s1rk, RESUME1_MIC_NONCE)?))
            }
            None => None,
        };

        let payload = tlv_payload(MAX_SIGMA_SIZE, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str8(TagType::Context(1), &self.initiator_random)?;
            tw.u16(TagType::Context(2), env.local_sess_id)?;
            tw.str8(TagType::Context(3), &dest_id)?;
            tw.str8(TagType::Context(4), &self.our_pub_key)?;
            write_session_params(tw, TagType::Context(5), &env.local_params)?;
            if let Some((resumption_id, mic)) = &resume {
                tw.str8(TagType::Context(6), resumption_id)?;
                tw.str8(TagType::Context(7), mic)?;
            }
            tw.end_container()
        })?;

        let mut tt = Sha256::new()?;
        tt.update(&payload)?;
        self.tt = Some(tt);

        Ok(Step::send(HandshakeState::Sent1, OpCode::CASESigma1, payload))
    }

    fn handle_sigma2(&mut self, payload: &[u8], env: &mut HandshakeEnv) -> Result<Step, Error> {
        let fabric = self.fabric(env.fabrics)?;

        let root = get_root_node_struct(payload)?;
        let responder_random = root.find_tag(1)?.slice()?;
        let responder_sessid = root.find_tag(2)?.u16()?;
        let responder_pub_key = check_pub_key(root.find_tag(3)?.slice()?)?;
        let encrypted = root.find_tag(4)?.slice()?;
        let peer_params = opt_session_params(&root, 5)?;

        let eph_key = self.eph_key.take().ok_or(ErrorCode::InvalidState)?;
        eph_key.derive_secret(responder_pub_key, self.shared_secret.access_mut())?;

        let tt = self.tt.as_mut().ok_or(ErrorCode::InvalidState)?;

        let s2k = symm_key(
            &[fabric.ipk(), responder_random, responder_pub_key, &tt_hash(tt)?],
            self.shared_secret.access(),
            S2K_INFO,
        )?;

        let decrypted = decrypt_tbe(&s2k, TBE2_NONCE, encrypted)?;
        let tbe = get_root_node_struct(&decrypted)?;
        let responder_noc = tbe.find_tag(1)?.slice()?;
        let responder_icac = tbe.opt_find_tag(2)?.map(|e| e.slice()).transpose()?;
        let signature = tbe.find_tag(3)?.slice()?;
        let resumption_id: [u8; RESUMPTION_ID_LEN] = tbe.find_tag(4)?.slice()?.try_into()?;

        let peer = fabric.validate_peer(responder_noc, responder_icac)?;
        if peer.node_id != self.peer_node_id {
            error!(
                "Responder is node {:016x}, expected {:016x}",
                peer.node_id, self.peer_node_id
            );
            Err(ErrorCode::InvalidData)?;
        }

        let tbs = write_tbs(
            responder_noc,
            responder_icac,
            responder_pub_key,
            &self.our_pub_key,
        )?;
        KeyPair::new_from_public(&peer.pub_key)?.verify_msg(&tbs, signature)?;

        // Only now do we add this message to the TT Hash
        tt.update(payload)?;

        let tbs = write_tbs(
            fabric.noc(),
            fabric.icac(),
            &self.our_pub_key,
            responder_pub_key,
        )?;
        let signature = fabric.sign_msg(&tbs)?;

        let s3k = symm_key(
            &[fabric.ipk(), &tt_hash(tt)?],
            self.shared_secret.access(),
            S3K_INFO,
        )?;

        let encrypted = encrypt_tbe(fabric, &s3k, TBE3_NONCE, |tw| {
            tw.str8(TagType::Context(3), &signature)
        })?;

        let sigma3 = tlv_payload(MAX_SIGMA_SIZE, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str16(TagType::Context(1), &encrypted)?;
            tw.end_container()
        })?;

        tt.update(&sigma3)?;

        let mut keys = SessionKeyMaterial::new();
        kdf(
            &[fabric.ipk(), &tt_hash(tt)?],
            self.shared_secret.access(),
            SEKEYS_INFO,
            keys.access_mut(),
        )?;

        self.pending = Some(NewSessionData {
            mode: SessionMode::Case {
                fabric_idx: self.fabric_idx,
            },
            peer_sess_id: responder_sessid,
            local_nodeid: fabric.node_id(),
            peer_nodeid: Some(peer.node_id),
            keys,
            peer_params,
            resumed: false,
        });

        self.new_record = Some(ResumptionRecord {
            resumption_id,
            shared_secret: *self.shared_secret.access(),
            fabric_idx: self.fabric_idx,
            peer_node_id: self.peer_node_id,
        });

        Ok(Step::send(HandshakeState::Sent3, OpCode::CASESigma3, sigma3))
    }

    fn handle_sigma2_resume(&mut self, payload: &[u8], env: &mut HandshakeEnv) -> Result<Step, Error> {
        let fabric = self.fabric(env.fabrics)?;

        let Some(record) = self.resumption.as_ref() else {
            error!("Sigma2Resume without a resumption attempt");
            return Err(ErrorCode::InvalidOpcode.into());
        };

        let root = get_root_node_struct(payload)?;
        let resumption_id: [u8; RESUMPTION_ID_LEN] = root.find_tag(1)?.slice()?.try_into()?;
        let mic = root.find_tag(2)?.slice()?;
        let responder_sessid = root.find_tag(3)?.u16()?;
        let peer_params = opt_session_params(&root, 4)?;

        let salt: [&[u8]; 2] = [&self.initiator_random, &resumption_id];

        let s2rk = symm_key(&salt, &record.shared_secret, S2RK_INFO)?;
        check_resume_mic(&s2rk, RESUME2_MIC_NONCE, mic)?;

        let mut keys = SessionKeyMaterial::new();
        kdf(&salt, &record.shared_secret, RESUME_SEKEYS_INFO, keys.access_mut())?;

        let new_record = ResumptionRecord {
            resumption_id,
            shared_secret: record.shared_secret,
            fabric_idx: self.fabric_idx,
            peer_node_id: self.peer_node_id,
        };
        if let Err(e) = new_record.save(env.store) {
            warn!("Failed to persist the resumption record: {}", e);
        }

        info!("CASE session with {:016x} resumed", self.peer_node_id);

        Ok(Step::establish_with_status(NewSessionData {
            mode: SessionMode::Case {
                fabric_idx: self.fabric_idx,
            },
            peer_sess_id: responder_sessid,
            local_nodeid: fabric.node_id(),
            peer_nodeid: Some(self.peer_node_id),
            keys,
            peer_params,
            resumed: true,
        }))
    }

    fn established(&mut self, env: &mut HandshakeEnv) -> Result<Step, Error> {
        if self.state != HandshakeState::Sent3 {
            Err(ErrorCode::InvalidState)?;
        }

        let pending = self.pending.take().ok_or(ErrorCode::InvalidState)?;

        if let Some(record) = self.new_record.take() {
            if let Err(e) = record.save(env.store) {
                warn!("Failed to persist the resumption record: {}", e);
            }
        }

        Ok(Step::establish(pending))
    }

    fn step(&mut self, opcode: OpCode, payload: &[u8], env: &mut HandshakeEnv) -> Result<Step, Error> {
        match (self.state, opcode) {
            (HandshakeState::Sent1, OpCode::CASESigma2) => {
                if self.resumption.is_some() {
                    debug!("Responder declined resumption, continuing with a full CASE");
                }

                self.handle_sigma2(payload, env)
            }
            (HandshakeState::Sent1, OpCode::CASESigma2Resume) => {
                self.handle_sigma2_resume(payload, env)
            }
            _ => {
                error!("Unexpected {:?} in state {:?}", opcode, self.state);
                Err(ErrorCode::InvalidOpcode.into())
            }
        }
    }

    fn wipe(&mut self) {
        self.eph_key = None;
        self.tt = None;
        self.shared_secret = SharedSecret::new();
        self.resumption = None;
        self.pending = None;
        self.new_record = None;
    }
}

impl Handshake for CaseInitiator {
    fn kind(&self) -> HandshakeKind {
        HandshakeKind::Case
    }

    fn state(&self) -> HandshakeState {
        self.state
    }

    fn start(&mut self, env: &mut HandshakeEnv) -> HandshakeActions {
        let result = if self.state == HandshakeState::Idle {
            self.send_sigma1(env)
        } else {
            Err(ErrorCode::InvalidState.into())
        };

        match result {
            Ok(step) => conclude(HandshakeKind::Case, &mut self.state, Ok(step)),
            Err(e) => {
                self.wipe();
                conclude_silently(HandshakeKind::Case, &mut self.state, e)
            }
        }
    }

    fn handle(&mut self, opcode: OpCode, payload: &[u8], env: &mut HandshakeEnv) -> HandshakeActions {
        if self.state.is_terminal() {
            debug!("CASE: ignoring {:?} in state {:?}", opcode, self.state);
            return HandshakeActions::new();
        }

        let actions = if opcode == OpCode::StatusReport {
            match peer_status(payload) {
                Ok(()) => {
                    let result = self.established(env);
                    conclude(HandshakeKind::Case, &mut self.state, result)
                }
                Err(e) => conclude_silently(HandshakeKind::Case, &mut self.state, e),
            }
        } else {
            let result = self.step(opcode, payload, env);
            conclude(HandshakeKind::Case, &mut self.state, result)
        };

        if self.state.is_terminal() {
            self.wipe();
        }

        actions
    }

    fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = HandshakeState::Errored;
        }

        self.wipe();
    }
}

/// The responder side of CASE, for whichever of our fabrics Sigma1 designates
pub struct CaseResponder {
    state: HandshakeState,
    fabric_idx: u8,
    peer_sess_id: u16,
    peer_params: Option<SessionParameters>,
    peer_pub_key: [u8; EC_POINT_LEN_BYTES],
    our_pub_key: [u8; EC_POINT_LEN_BYTES],
    tt: Option<Sha256>,
    shared_secret: SharedSecret,
    resumption_id: [u8; RESUMPTION_ID_LEN],
    pending: Option<NewSessionData>,
    new_record: Option<ResumptionRecord>,
}

impl CaseResponder {
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
            fabric_idx: 0,
            peer_sess_id: 0,
            peer_params: None,
            peer_pub_key: [0; EC_POINT_LEN_BYTES],
            our_pub_key: [0; EC_POINT_LEN_BYTES],
            tt: None,
            shared_secret: SharedSecret::new(),
            resumption_id: [0; RESUMPTION_ID_LEN],
            pending: None,
            new_record: None,
        }
    }

    fn handle_sigma1(&mut self, payload: &[u8], env: &mut HandshakeEnv) -> Result<Step, Error> {
        let sigma1 = Sigma1::read(payload)?;

        self.peer_sess_id = sigma1.initiator_sessid;
        self.peer_params = sigma1.params.clone();

        if let Some((resumption_id, mic)) = sigma1.resumption {
            if let Some(step) = self.try_resume(&sigma1, resumption_id, mic, env)? {
                return Ok(step);
            }
        }

        let fabrics = env.fabrics;

        self.fabric_idx = fabrics
            .match_dest_id(sigma1.initiator_random, sigma1.dest_id)
            .map_err(|e| {
                error!("Fabric Index mismatch");
                e
            })?;
        let fabric = fabrics
            .get(self.fabric_idx)
            .ok_or(ErrorCode::NoSharedTrustRoots)?;

        debug!("Destination ID matched to fabric index {}", self.fabric_idx);

        self.peer_pub_key = *sigma1.peer_pub_key;

        let mut tt = Sha256::new()?;
        tt.update(payload)?;

        // Create an ephemeral Key Pair and derive the shared secret
        let eph_key = KeyPair::new(env.rand)?;
        self.our_pub_key = eph_key.public_key_bytes()?;
        eph_key.derive_secret(&self.peer_pub_key, self.shared_secret.access_mut())?;

        let mut our_random = [0; RANDOM_LEN];
        (env.rand)(&mut our_random);
        (env.rand)(&mut self.resumption_id);

        let tbs = write_tbs(
            fabric.noc(),
            fabric.icac(),
            &self.our_pub_key,
            &self.peer_pub_key,
        )?;
        let signature = fabric.sign_msg(&tbs)?;

        let s2k = symm_key(
            &[fabric.ipk(), &our_random, &self.our_pub_key, &tt_hash(&tt)?],
            self.shared_secret.access(),
            S2K_INFO,
        )?;

        let resumption_id = self.resumption_id;
        let encrypted = encrypt_tbe(fabric, &s2k, TBE2_NONCE, |tw| {
            tw.str8(TagType::Context(3), &signature)?;
            tw.str8(TagType::Context(4), &resumption_id)
        })?;

        let sigma2 = tlv_payload(MAX_SIGMA_SIZE, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str8(TagType::Context(1), &our_random)?;
            tw.u16(TagType::Context(2), env.local_sess_id)?;
            tw.str8(TagType::Context(3), &self.our_pub_key)?;
            tw.str16(TagType::Context(4), &encrypted)?;
            write_session_params(tw, TagType::Context(5), &env.local_params)?;
            tw.end_container()
        })?;

        tt.update(&sigma2)?;
        self.tt = Some(tt);

        Ok(Step::send(HandshakeState::Sent2, OpCode::CASESigma2, sigma2))
    }

    /// Answer with Sigma2Resume if the resumption request checks out
    fn try_resume(
        &mut self,
        sigma1: &Sigma1,
        resumption_id: &[u8],
        mic: &[u8],
        env: &mut HandshakeEnv,
    ) -> Result<Option<Step>, Error> {
        let Some(record) = ResumptionRecord::load_by_id(&*env.store, resumption_id)? else {
            debug!("Unknown resumption id, falling back to a full CASE");
            return Ok(None);
        };

        let Some(fabric) = env.fabrics.get(record.fabric_idx) else {
            debug!("Resumption record for a removed fabric");
            return Ok(None);
        };

        let s1rk = symm_key(
            &[sigma1.initiator_random, resumption_id],
            &record.shared_secret,
            S1RK_INFO,
        )?;
        if check_resume_mic(&s1rk, RESUME1_MIC_NONCE, mic).is_err() {
            warn!("Invalid Sigma1 resumption MIC, falling back to a full CASE");
            return Ok(None);
        }

        let mut new_id = [0; RESUMPTION_ID_LEN];
        (env.rand)(&mut new_id);

        let salt: [&[u8]; 2] = [sigma1.initiator_random, &new_id];

        let s2rk = symm_key(&salt, &record.shared_secret, S2RK_INFO)?;
        let mic = resume_mic(&s2rk, RESUME2_MIC_NONCE)?;

        let mut keys = SessionKeyMaterial::new();
        kdf(&salt, &record.shared_secret, RESUME_SEKEYS_INFO, keys.access_mut())?;

        let payload = tlv_payload(MAX_SIGMA_SIZE, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str8(TagType::Context(1), &new_id)?;
            tw.str8(TagType::Context(2), &mic)?;
            tw.u16(TagType::Context(3), env.local_sess_id)?;
            write_session_params(tw, TagType::Context(4), &env.local_params)?;
            tw.end_container()
        })?;

        self.fabric_idx = record.fabric_idx;
        self.pending = Some(NewSessionData {
            mode: SessionMode::Case {
                fabric_idx: record.fabric_idx,
            },
            peer_sess_id: self.peer_sess_id,
            local_nodeid: fabric.node_id(),
            peer_nodeid: Some(record.peer_node_id),
            keys,
            peer_params: self.peer_params.clone(),
            resumed: true,
        });
        self.new_record = Some(ResumptionRecord {
            resumption_id: new_id,
            shared_secret: record.shared_secret,
            fabric_idx: record.fabric_idx,
            peer_node_id: record.peer_node_id,
        });

        Ok(Some(Step::send(
            HandshakeState::Sent2,
            OpCode::CASESigma2Resume,
            payload,
        )))
    }

    fn handle_sigma3(&mut self, payload: &[u8], env: &mut HandshakeEnv) -> Result<Step, Error> {
        let fabric = env
            .fabrics
            .get(self.fabric_idx)
            .ok_or(ErrorCode::NoSharedTrustRoots)?;

        let root = get_root_node_struct(payload)?;
        let encrypted = root.find_tag(1)?.slice()?;

        let tt = self.tt.as_mut().ok_or(ErrorCode::InvalidState)?;

        let s3k = symm_key(
            &[fabric.ipk(), &tt_hash(tt)?],
            self.shared_secret.access(),
            S3K_INFO,
        )?;

        let decrypted = decrypt_tbe(&s3k, TBE3_NONCE, encrypted)?;
        let tbe = get_root_node_struct(&decrypted)?;
        let initiator_noc = tbe.find_tag(1)?.slice()?;
        let initiator_icac = tbe.opt_find_tag(2)?.map(|e| e.slice()).transpose()?;
        let signature = tbe.find_tag(3)?.slice()?;

        let peer = fabric.validate_peer(initiator_noc, initiator_icac).map_err(|e| {
            error!("Certificate Chain doesn't match: {}", e);
            e
        })?;

        let tbs = write_tbs(
            initiator_noc,
            initiator_icac,
            &self.peer_pub_key,
            &self.our_pub_key,
        )?;
        KeyPair::new_from_public(&peer.pub_key)?
            .verify_msg(&tbs, signature)
            .map_err(|e| {
                error!("Sigma3 Signature doesn't match: {}", e);
                e
            })?;

        // Only now do we add this message to the TT Hash
        tt.update(payload)?;

        let mut keys = SessionKeyMaterial::new();
        kdf(
            &[fabric.ipk(), &tt_hash(tt)?],
            self.shared_secret.access(),
            SEKEYS_INFO,
            keys.access_mut(),
        )?;

        let record = ResumptionRecord {
            resumption_id: self.resumption_id,
            shared_secret: *self.shared_secret.access(),
            fabric_idx: self.fabric_idx,
            peer_node_id: peer.node_id,
        };
        if let Err(e) = record.save(env.store) {
            warn!("Failed to persist the resumption record: {}", e);
        }

        Ok(Step::establish_with_status(NewSessionData {
            mode: SessionMode::Case {
                fabric_idx: self.fabric_idx,
            },
            peer_sess_id: self.peer_sess_id,
            local_nodeid: fabric.node_id(),
            peer_nodeid: Some(peer.node_id),
            keys,
            peer_params: self.peer_params.clone(),
            resumed: false,
        }))
    }

    /// The initiator confirmed a resumption
    fn resumed(&mut self, env: &mut HandshakeEnv) -> Result<Step, Error> {
        let pending = self.pending.take().ok_or(ErrorCode::InvalidState)?;

        if let Some(record) = self.new_record.take() {
            if let Err(e) = record.save(env.store) {
                warn!("Failed to persist the resumption record: {}", e);
            }
        }

        Ok(Step::establish(pending))
    }

    fn step(&mut self, opcode: OpCode, payload: &[u8], env: &mut HandshakeEnv) -> Result<Step, Error> {
        match self.state {
            HandshakeState::Idle => {
                expect_opcode(opcode, OpCode::CASESigma1)?;
                self.handle_sigma1(payload, env)
            }
            HandshakeState::Sent2 if self.pending.is_none() => {
                expect_opcode(opcode, OpCode::CASESigma3)?;
                self.handle_sigma3(payload, env)
            }
            _ => Err(ErrorCode::InvalidOpcode.into()),
        }
    }

    fn wipe(&mut self) {
        self.tt = None;
        self.shared_secret = SharedSecret::new();
        self.pending = None;
        self.new_record = None;
    }
}

impl Default for CaseResponder {
    fn default() -> Self {
        Self::new()
    }
}

impl Handshake for CaseResponder {
    fn kind(&self) -> HandshakeKind {
        HandshakeKind::Case
    }

    fn state(&self) -> HandshakeState {
        self.state
    }

    fn start(&mut self, _env: &mut HandshakeEnv) -> HandshakeActions {
        HandshakeActions::new()
    }

    fn handle(&mut self, opcode: OpCode, payload: &[u8], env: &mut HandshakeEnv) -> HandshakeActions {
        if self.state.is_terminal() {
            debug!("CASE: ignoring {:?} in state {:?}", opcode, self.state);
            return HandshakeActions::new();
        }

        let actions = if opcode == OpCode::StatusReport {
            match peer_status(payload) {
                Ok(()) if self.pending.is_some() => {
                    let result = self.resumed(env);
                    conclude(HandshakeKind::Case, &mut self.state, result)
                }
                Ok(()) => conclude_silently(
                    HandshakeKind::Case,
                    &mut self.state,
                    ErrorCode::InvalidState.into(),
                ),
                Err(e) => conclude_silently(HandshakeKind::Case, &mut self.state, e),
            }
        } else {
            let result = self.step(opcode, payload, env);
            conclude(HandshakeKind::Case, &mut self.state, result)
        };

        if self.state.is_terminal() {
            self.wipe();
        }

        actions
    }

    fn abort(&mut self) {
        if !self.state.is_terminal() {
            self.state = HandshakeState::Errored;
        }

        self.wipe();
    }
}
