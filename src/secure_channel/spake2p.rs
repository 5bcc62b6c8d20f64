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

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::crypto::{self, pbkdf2_hmac, HmacSha256, Sha256, EC_POINT_LEN_BYTES};
use crate::error::{Error, ErrorCode};
use crate::utils::rand::Rand;

use super::crypto_spake2::{CryptoSpake2, CRYPTO_GROUP_SIZE_BYTES};

// This file handles the Spake2+ protocol steps. The EC operations live in
// `CryptoSpake2`.
//
// Neither side releases Ke before the peer's confirmation has been checked.

pub const SPAKE2_ITERATION_COUNT: u32 = 2000;
pub const MIN_ITERATION_COUNT: u32 = 1000;
pub const MAX_ITERATION_COUNT: u32 = 100000;
pub const MIN_SALT_SIZE_BYTES: usize = 16;
pub const MAX_SALT_SIZE_BYTES: usize = 32;

const SPAKE2P_KEY_CONFIRM_INFO: &[u8] = b"ConfirmationKeys";
const SPAKE2P_CONTEXT_PREFIX: &[u8] = b"CHIP PAKE V1 Commissioning";
const CRYPTO_W_SIZE_BYTES: usize = CRYPTO_GROUP_SIZE_BYTES + 8;

pub const VERIFIER_SIZE_BYTES: usize = CRYPTO_GROUP_SIZE_BYTES + EC_POINT_LEN_BYTES;

pub const KE_LEN_BYTES: usize = 16;
pub const CONFIRM_LEN_BYTES: usize = 32;

#[derive(PartialEq, Copy, Clone, Debug)]
pub enum Spake2VerifierState {
    // Initialised - w0, L are set
    Init,
    // Pending Confirmation - Keys are derived but pending confirmation
    PendingConfirmation,
    // Confirmed
    Confirmed,
}

#[derive(PartialEq, Copy, Clone, Debug)]
pub enum Spake2ProverState {
    // w0, w1 are set and pA has been sent
    Init,
    // The verifier's confirmation checked out
    Confirmed,
}

#[derive(PartialEq, Debug)]
pub enum Spake2Mode {
    Unknown,
    Prover(Spake2ProverState),
    Verifier(Spake2VerifierState),
}

#[allow(non_snake_case)]
pub struct Spake2P {
    mode: Spake2Mode,
    context: Option<Sha256>,
    Ke: [u8; KE_LEN_BYTES],
    cA: [u8; CONFIRM_LEN_BYTES],
    cB: [u8; CONFIRM_LEN_BYTES],
    pA: [u8; EC_POINT_LEN_BYTES],
    crypto_spake2: Option<CryptoSpake2>,
}

impl Spake2P {
    pub const fn new() -> Self {
        Self {
            mode: Spake2Mode::Unknown,
            context: None,
            Ke: [0; KE_LEN_BYTES],
            cA: [0; CONFIRM_LEN_BYTES],
            cB: [0; CONFIRM_LEN_BYTES],
            pA: [0; EC_POINT_LEN_BYTES],
            crypto_spake2: None,
        }
    }

    pub fn mode(&self) -> &Spake2Mode {
        &self.mode
    }

    pub fn set_context(&mut self) -> Result<(), Error> {
        let mut context = Sha256::new()?;
        context.update(SPAKE2P_CONTEXT_PREFIX)?;
        self.context = Some(context);
        Ok(())
    }

    pub fn update_context(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.context
            .as_mut()
            .ok_or(ErrorCode::InvalidState)?
            .update(buf)
    }

    fn finish_context(&mut self) -> Result<[u8; crypto::SHA256_HASH_LEN_BYTES], Error> {
        let context = self.context.take().ok_or(ErrorCode::InvalidState)?;

        let mut hash = [0u8; crypto::SHA256_HASH_LEN_BYTES];
        context.finish(&mut hash)?;

        Ok(hash)
    }

    fn get_w0w1s(pw: u32, iter: u32, salt: &[u8]) -> Result<[u8; 2 * CRYPTO_W_SIZE_BYTES], Error> {
        let mut w0w1s = [0; 2 * CRYPTO_W_SIZE_BYTES];
        pbkdf2_hmac(&pw.to_le_bytes(), iter as usize, salt, &mut w0w1s)?;

        Ok(w0w1s)
    }

    pub(crate) fn start_verifier(&mut self, verifier: &VerifierData) -> Result<(), Error> {
        let mut crypto_spake2 = CryptoSpake2::new()?;

        let (w0, l) = verifier.verifier.split_at(CRYPTO_GROUP_SIZE_BYTES);
        crypto_spake2.set_w0(w0.try_into()?)?;
        crypto_spake2.set_L(l)?;

        self.crypto_spake2 = Some(crypto_spake2);
        self.mode = Spake2Mode::Verifier(Spake2VerifierState::Init);
        Ok(())
    }

    /// Derive w0 and w1 from the passcode and compute our share.
    ///
    /// Returns `pA`, to be sent in Pake1.
    #[allow(non_snake_case)]
    pub(crate) fn start_prover(
        &mut self,
        passcode: u32,
        salt: &[u8],
        count: u32,
        rand: Rand,
    ) -> Result<[u8; EC_POINT_LEN_BYTES], Error> {
        let mut w0w1s = Self::get_w0w1s(passcode, count, salt)?;
        let (w0s, w1s) = w0w1s.split_at(CRYPTO_W_SIZE_BYTES);

        let mut crypto_spake2 = CryptoSpake2::new()?;
        crypto_spake2.set_w0_from_w0s(w0s);
        crypto_spake2.set_w1_from_w1s(w1s);
        w0w1s.zeroize();

        self.pA = crypto_spake2.get_pA(rand)?;
        self.crypto_spake2 = Some(crypto_spake2);
        self.mode = Spake2Mode::Prover(Spake2ProverState::Init);

        Ok(self.pA)
    }

    /// Verifier: consume Pake1 and produce the `pB` and `cB` of Pake2
    #[allow(non_snake_case)]
    pub fn handle_pA(
        &mut self,
        pA: &[u8],
        rand: Rand,
    ) -> Result<([u8; EC_POINT_LEN_BYTES], [u8; CONFIRM_LEN_BYTES]), Error> {
        if self.mode != Spake2Mode::Verifier(Spake2VerifierState::Init) {
            Err(ErrorCode::InvalidState)?;
        }

        let context = self.finish_context()?;

        // We are finished with using the crypto_spake2 after this
        let mut crypto_spake2 = self.crypto_spake2.take().ok_or(ErrorCode::InvalidState)?;
        let pB = crypto_spake2.get_pB(rand)?;
        let TT = crypto_spake2.get_TT_as_verifier(&context, pA, &pB)?;

        let (Ke, cA, cB) = Self::get_Ke_and_cAcB(&TT, pA, &pB)?;
        self.Ke = Ke;
        self.cA = cA;

        self.mode = Spake2Mode::Verifier(Spake2VerifierState::PendingConfirmation);

        Ok((pB, cB))
    }

    /// Verifier: check the prover's confirmation from Pake3 and release Ke
    #[allow(non_snake_case)]
    pub fn handle_cA(&mut self, cA: &[u8]) -> Result<[u8; KE_LEN_BYTES], Error> {
        if self.mode != Spake2Mode::Verifier(Spake2VerifierState::PendingConfirmation) {
            Err(ErrorCode::InvalidState)?;
        }

        self.mode = Spake2Mode::Verifier(Spake2VerifierState::Confirmed);

        if cA.ct_eq(&self.cA).unwrap_u8() == 1 {
            Ok(self.Ke)
        } else {
            Err(ErrorCode::AuthenticationFailed.into())
        }
    }

    /// Prover: consume Pake2, check the verifier's confirmation and produce `cA`
    /// for Pake3
    #[allow(non_snake_case)]
    pub fn handle_pB_cB(&mut self, pB: &[u8], cB: &[u8]) -> Result<[u8; CONFIRM_LEN_BYTES], Error> {
        if self.mode != Spake2Mode::Prover(Spake2ProverState::Init) {
            Err(ErrorCode::InvalidState)?;
        }

        let context = self.finish_context()?;

        let crypto_spake2 = self.crypto_spake2.take().ok_or(ErrorCode::InvalidState)?;
        let TT = crypto_spake2.get_TT_as_prover(&context, &self.pA, pB)?;

        let (Ke, cA, expected_cB) = Self::get_Ke_and_cAcB(&TT, &self.pA, pB)?;

        if cB.ct_eq(&expected_cB).unwrap_u8() != 1 {
            Err(ErrorCode::AuthenticationFailed)?;
        }

        self.Ke = Ke;
        self.cB = expected_cB;
        self.mode = Spake2Mode::Prover(Spake2ProverState::Confirmed);

        Ok(cA)
    }

    /// Prover: Ke, available once the verifier's confirmation checked out
    pub fn prover_ke(&self) -> Result<[u8; KE_LEN_BYTES], Error> {
        if self.mode != Spake2Mode::Prover(Spake2ProverState::Confirmed) {
            Err(ErrorCode::InvalidState)?;
        }

        Ok(self.Ke)
    }

    #[allow(non_snake_case)]
    #[allow(clippy::type_complexity)]
    fn get_Ke_and_cAcB(
        TT: &[u8],
        pA: &[u8],
        pB: &[u8],
    ) -> Result<
        (
            [u8; KE_LEN_BYTES],
            [u8; CONFIRM_LEN_BYTES],
            [u8; CONFIRM_LEN_BYTES],
        ),
        Error,
    > {
        // Step 1: Ka || Ke = Hash(TT)
        let KaKe = TT;
        let KaKe_len = KaKe.len();
        let Ka = &KaKe[0..KaKe_len / 2];
        let Ke: [u8; KE_LEN_BYTES] = KaKe[(KaKe_len / 2)..].try_into()?;

        // Step 2: KcA || KcB = KDF(nil, Ka, "ConfirmationKeys")
        let mut KcAKcB: [u8; 32] = [0; 32];
        crypto::hkdf_sha256(&[], Ka, SPAKE2P_KEY_CONFIRM_INFO, &mut KcAKcB)?;

        let KcA = &KcAKcB[0..(KcAKcB.len() / 2)];
        let KcB = &KcAKcB[(KcAKcB.len() / 2)..];

        // Step 3: cA = HMAC(KcA, pB), cB = HMAC(KcB, pA)
        let mut cA = [0; CONFIRM_LEN_BYTES];
        let mut mac = HmacSha256::new(KcA)?;
        mac.update(pB)?;
        mac.finish(&mut cA)?;

        let mut cB = [0; CONFIRM_LEN_BYTES];
        let mut mac = HmacSha256::new(KcB)?;
        mac.update(pA)?;
        mac.finish(&mut cB)?;

        KcAKcB.zeroize();

        Ok((Ke, cA, cB))
    }
}

impl Default for Spake2P {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Spake2P {
    fn drop(&mut self) {
        self.Ke.zeroize();
        self.cA.zeroize();
        self.cB.zeroize();
    }
}

/// What a commissionee holds to verify a PASE prover: `w0 || L`, plus the
/// PBKDF parameters it hands out in the PBKDFParamResponse.
#[derive(Clone)]
pub struct VerifierData {
    /// Only kept for information; the handshake works off `verifier`
    pub password: Option<u32>,
    pub verifier: [u8; VERIFIER_SIZE_BYTES],
    pub salt: heapless::Vec<u8, MAX_SALT_SIZE_BYTES>,
    pub count: u32,
}

impl VerifierData {
    /// Build a verifier from a passcode, with a random salt
    pub fn new_with_pw(password: u32, count: u32, rand: Rand) -> Result<Self, Error> {
        let mut salt = [0; MAX_SALT_SIZE_BYTES];
        rand(&mut salt);

        let mut this = Self::new(&Self::compute(password, &salt, count)?, &salt, count)?;
        this.password = Some(password);

        Ok(this)
    }

    /// Use a pre-computed `w0 || L` verifier
    pub fn new(verifier: &[u8], salt: &[u8], count: u32) -> Result<Self, Error> {
        if verifier.len() != VERIFIER_SIZE_BYTES
            || !(MIN_SALT_SIZE_BYTES..=MAX_SALT_SIZE_BYTES).contains(&salt.len())
            || !(MIN_ITERATION_COUNT..=MAX_ITERATION_COUNT).contains(&count)
        {
            Err(ErrorCode::InvalidData)?;
        }

        Ok(Self {
            password: None,
            verifier: verifier.try_into()?,
            salt: heapless::Vec::from_slice(salt).map_err(|_| ErrorCode::InvalidData)?,
            count,
        })
    }

    /// Compute `w0 || L` for a passcode
    pub fn compute(
        password: u32,
        salt: &[u8],
        count: u32,
    ) -> Result<[u8; VERIFIER_SIZE_BYTES], Error> {
        let mut w0w1s = Spake2P::get_w0w1s(password, count, salt)?;
        let (w0s, w1s) = w0w1s.split_at(CRYPTO_W_SIZE_BYTES);

        let mut crypto_spake2 = CryptoSpake2::new()?;
        crypto_spake2.set_w0_from_w0s(w0s);
        crypto_spake2.set_L_from_w1s(w1s);
        w0w1s.zeroize();

        let mut verifier = [0; VERIFIER_SIZE_BYTES];
        verifier[..CRYPTO_GROUP_SIZE_BYTES].copy_from_slice(&crypto_spake2.w0_bytes());
        verifier[CRYPTO_GROUP_SIZE_BYTES..].copy_from_slice(&crypto_spake2.L_bytes()?);

        Ok(verifier)
    }
}

impl Drop for VerifierData {
    fn drop(&mut self) {
        self.verifier.zeroize();
        self.password = None;
    }
}

impl core::fmt::Debug for VerifierData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VerifierData")
            .field("salt", &self.salt)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}
