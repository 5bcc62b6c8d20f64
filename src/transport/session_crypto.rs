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

//! Per-session AEAD state.
//!
//! Each direction of a session has its own key: the initiator encrypts with the
//! I2R key and decrypts with the R2I key, the responder the other way round.
//! Since the keys differ per direction, equal counters in both directions never
//! reuse a (key, nonce) pair.

use byteorder::{ByteOrder, LittleEndian};

use crate::crypto::{self, AeadKey, AttChallenge, AEAD_NONCE_LEN_BYTES, SYMM_KEY_LEN_BYTES};
use crate::error::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Initiator,
    Responder,
}

#[derive(Debug)]
struct SessionKeys {
    enc: AeadKey,
    dec: AeadKey,
    att_challenge: AttChallenge,
}

#[derive(Debug)]
pub struct CryptoContext {
    role: SessionRole,
    keys: Option<SessionKeys>,
}

impl CryptoContext {
    pub const fn new(role: SessionRole) -> Self {
        Self { role, keys: None }
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn is_keyed(&self) -> bool {
        self.keys.is_some()
    }

    /// Install the keys derived by the handshake. Keys can only be set once.
    pub fn activate(&mut self, i2r: &[u8], r2i: &[u8], att_challenge: &[u8]) -> Result<(), Error> {
        if self.keys.is_some() {
            Err(ErrorCode::KeysAlreadySet)?;
        }

        let (enc, dec) = match self.role {
            SessionRole::Initiator => (i2r, r2i),
            SessionRole::Responder => (r2i, i2r),
        };

        self.keys = Some(SessionKeys {
            enc: AeadKey::new_from_slice(enc).ok_or(ErrorCode::InvalidData)?,
            dec: AeadKey::new_from_slice(dec).ok_or(ErrorCode::InvalidData)?,
            att_challenge: AttChallenge::new_from_slice(att_challenge)
                .ok_or(ErrorCode::InvalidData)?,
        });

        Ok(())
    }

    pub fn att_challenge(&self) -> Option<&[u8; SYMM_KEY_LEN_BYTES]> {
        self.keys.as_ref().map(|keys| keys.att_challenge.access())
    }

    /// Encrypt the first `data_len` bytes of `data` in place, appending the tag.
    ///
    /// `node_id` is the node id of the sender, i.e. ours.
    pub fn encrypt(
        &self,
        sec_flags: u8,
        ctr: u32,
        node_id: u64,
        aad: &[u8],
        data: &mut [u8],
        data_len: usize,
    ) -> Result<usize, Error> {
        let keys = self.keys.as_ref().ok_or(ErrorCode::InvalidState)?;
        let nonce = nonce(sec_flags, ctr, node_id);

        crypto::encrypt_in_place(keys.enc.access(), &nonce, aad, data, data_len)
    }

    /// Decrypt `data` (cipher text followed by the tag) in place.
    ///
    /// `node_id` is the node id of the sender, i.e. the peer.
    pub fn decrypt(
        &self,
        sec_flags: u8,
        ctr: u32,
        node_id: u64,
        aad: &[u8],
        data: &mut [u8],
    ) -> Result<usize, Error> {
        let keys = self.keys.as_ref().ok_or(ErrorCode::InvalidState)?;
        let nonce = nonce(sec_flags, ctr, node_id);

        crypto::decrypt_in_place(keys.dec.access(), &nonce, aad, data)
    }
}

/// Security flags || message counter || source node id
pub fn nonce(sec_flags: u8, ctr: u32, node_id: u64) -> [u8; AEAD_NONCE_LEN_BYTES] {
    let mut nonce = [0; AEAD_NONCE_LEN_BYTES];

    nonce[0] = sec_flags;
    LittleEndian::write_u32(&mut nonce[1..5], ctr);
    LittleEndian::write_u64(&mut nonce[5..], node_id);

    nonce
}
