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

use elliptic_curve::ff::{Field, PrimeField};
use elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar};
use zeroize::Zeroize;

use crate::crypto::{RandRngCore, Sha256, EC_POINT_LEN_BYTES, SHA256_HASH_LEN_BYTES};
use crate::error::{Error, ErrorCode};
use crate::utils::rand::Rand;

pub const CRYPTO_GROUP_SIZE_BYTES: usize = 32;

// The M and N points of the SPAKE2+ P-256 ciphersuite
pub const MATTER_M_BIN: [u8; EC_POINT_LEN_BYTES] = [
    0x04, 0x88, 0x6e, 0x2f, 0x97, 0xac, 0xe4, 0x6e, 0x55, 0xba, 0x9d, 0xd7, 0x24, 0x25, 0x79, 0xf2,
    0x99, 0x3b, 0x64, 0xe1, 0x6e, 0xf3, 0xdc, 0xab, 0x95, 0xaf, 0xd4, 0x97, 0x33, 0x3d, 0x8f, 0xa1,
    0x2f, 0x5f, 0xf3, 0x55, 0x16, 0x3e, 0x43, 0xce, 0x22, 0x4e, 0x0b, 0x0e, 0x65, 0xff, 0x02, 0xac,
    0x8e, 0x5c, 0x7b, 0xe0, 0x94, 0x19, 0xc7, 0x85, 0xe0, 0xca, 0x54, 0x7d, 0x55, 0xa1, 0x2e, 0x2d,
    0x20,
];
pub const MATTER_N_BIN: [u8; EC_POINT_LEN_BYTES] = [
    0x04, 0xd8, 0xbb, 0xd6, 0xc6, 0x39, 0xc6, 0x29, 0x37, 0xb0, 0x4d, 0x99, 0x7f, 0x38, 0xc3, 0x77,
    0x07, 0x19, 0xc6, 0x29, 0xd7, 0x01, 0x4d, 0x49, 0xa2, 0x4b, 0x4f, 0x98, 0xba, 0xa1, 0x29, 0x2b,
    0x49, 0x07, 0xd6, 0x0a, 0xa6, 0xbf, 0xad, 0xe4, 0x50, 0x08, 0xa6, 0x36, 0x33, 0x7f, 0x51, 0x68,
    0xc6, 0x4d, 0x9b, 0xd3, 0x60, 0x34, 0x80, 0x8c, 0xd5, 0x64, 0x49, 0x0b, 0x1e, 0x65, 0x6e, 0xdb,
    0xe7,
];

fn point_from_bytes(bytes: &[u8]) -> Result<ProjectivePoint, Error> {
    let encoded = EncodedPoint::from_bytes(bytes).map_err(|_| ErrorCode::InvalidData)?;
    let affine: Option<AffinePoint> = AffinePoint::from_encoded_point(&encoded).into();

    Ok(ProjectivePoint::from(affine.ok_or(ErrorCode::InvalidData)?))
}

fn point_to_bytes(point: &ProjectivePoint) -> Result<[u8; EC_POINT_LEN_BYTES], Error> {
    let encoded = point.to_affine().to_encoded_point(false);
    // The identity point encodes to a single byte
    encoded.as_bytes().try_into().map_err(|_| ErrorCode::Crypto.into())
}

fn scalar_from_bytes(bytes: &[u8; CRYPTO_GROUP_SIZE_BYTES]) -> Result<Scalar, Error> {
    Option::from(Scalar::from_repr(FieldBytes::clone_from_slice(bytes)))
        .ok_or(ErrorCode::InvalidData.into())
}

/// Reduce a big-endian integer of any length modulo the group order
fn scalar_reduce(bytes: &[u8]) -> Scalar {
    let radix = Scalar::from(256u64);

    bytes.iter().fold(Scalar::ZERO, |acc, byte| {
        acc * radix + Scalar::from(*byte as u64)
    })
}

fn add_to_tt(tt: &mut Sha256, buf: &[u8]) -> Result<(), Error> {
    tt.update(&(buf.len() as u64).to_le_bytes())?;
    if !buf.is_empty() {
        tt.update(buf)?;
    }

    Ok(())
}

/// The elliptic curve half of SPAKE2+ over P-256.
///
/// Holds the password-derived scalars, the verifier's `L` point and our
/// ephemeral share; all of it is wiped on drop.
#[allow(non_snake_case)]
pub struct CryptoSpake2 {
    xy: Scalar,
    w0: Scalar,
    w1: Option<Scalar>,
    L: Option<ProjectivePoint>,
    M: ProjectivePoint,
    N: ProjectivePoint,
}

impl CryptoSpake2 {
    #[allow(non_snake_case)]
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            xy: Scalar::ZERO,
            w0: Scalar::ZERO,
            w1: None,
            L: None,
            M: point_from_bytes(&MATTER_M_BIN)?,
            N: point_from_bytes(&MATTER_N_BIN)?,
        })
    }

    /// w0 = w0s mod p, where p is the order of the curve
    pub fn set_w0_from_w0s(&mut self, w0s: &[u8]) {
        self.w0 = scalar_reduce(w0s);
    }

    /// w1 = w1s mod p, where p is the order of the curve
    pub fn set_w1_from_w1s(&mut self, w1s: &[u8]) {
        self.w1 = Some(scalar_reduce(w1s));
    }

    pub fn set_w0(&mut self, w0: &[u8; CRYPTO_GROUP_SIZE_BYTES]) -> Result<(), Error> {
        self.w0 = scalar_from_bytes(w0)?;
        Ok(())
    }

    pub fn set_w1(&mut self, w1: &[u8; CRYPTO_GROUP_SIZE_BYTES]) -> Result<(), Error> {
        self.w1 = Some(scalar_from_bytes(w1)?);
        Ok(())
    }

    #[allow(non_snake_case)]
    pub fn set_L(&mut self, l: &[u8]) -> Result<(), Error> {
        self.L = Some(point_from_bytes(l)?);
        Ok(())
    }

    /// L = w1 * P, where P is the generator of the curve
    #[allow(non_snake_case)]
    pub fn set_L_from_w1s(&mut self, w1s: &[u8]) {
        let w1 = scalar_reduce(w1s);
        self.L = Some(ProjectivePoint::GENERATOR * w1);
    }

    pub fn w0_bytes(&self) -> [u8; CRYPTO_GROUP_SIZE_BYTES] {
        self.w0.to_repr().into()
    }

    #[allow(non_snake_case)]
    pub fn L_bytes(&self) -> Result<[u8; EC_POINT_LEN_BYTES], Error> {
        point_to_bytes(self.L.as_ref().ok_or(ErrorCode::InvalidState)?)
    }

    fn random_scalar(rand: Rand) -> Scalar {
        Scalar::random(&mut RandRngCore(rand))
    }

    /// X = x*P + w0*M
    #[allow(non_snake_case)]
    pub fn get_pA(&mut self, rand: Rand) -> Result<[u8; EC_POINT_LEN_BYTES], Error> {
        self.set_xy(Self::random_scalar(rand));
        self.compute_pA()
    }

    /// Y = y*P + w0*N
    #[allow(non_snake_case)]
    pub fn get_pB(&mut self, rand: Rand) -> Result<[u8; EC_POINT_LEN_BYTES], Error> {
        self.set_xy(Self::random_scalar(rand));
        self.compute_pB()
    }

    fn set_xy(&mut self, xy: Scalar) {
        self.xy = xy;
    }

    #[allow(non_snake_case)]
    fn compute_pA(&self) -> Result<[u8; EC_POINT_LEN_BYTES], Error> {
        point_to_bytes(&(ProjectivePoint::GENERATOR * self.xy + self.M * self.w0))
    }

    #[allow(non_snake_case)]
    fn compute_pB(&self) -> Result<[u8; EC_POINT_LEN_BYTES], Error> {
        point_to_bytes(&(ProjectivePoint::GENERATOR * self.xy + self.N * self.w0))
    }

    /// Z = x*(Y - w0*N), V = w1*(Y - w0*N)
    #[allow(non_snake_case)]
    fn get_ZV_as_prover(&self, pB: &[u8]) -> Result<(ProjectivePoint, ProjectivePoint), Error> {
        let Y = point_from_bytes(pB)?;
        let w1 = self.w1.ok_or(ErrorCode::InvalidState)?;

        let unblinded = Y - self.N * self.w0;

        // The cofactor of P-256 is 1
        Ok((unblinded * self.xy, unblinded * w1))
    }

    /// Z = y*(X - w0*M), V = y*L
    #[allow(non_snake_case)]
    fn get_ZV_as_verifier(&self, pA: &[u8]) -> Result<(ProjectivePoint, ProjectivePoint), Error> {
        let X = point_from_bytes(pA)?;
        let L = self.L.ok_or(ErrorCode::InvalidState)?;

        let unblinded = X - self.M * self.w0;

        Ok((unblinded * self.xy, L * self.xy))
    }

    #[allow(non_snake_case)]
    pub fn get_TT_as_prover(
        &self,
        context: &[u8],
        pA: &[u8],
        pB: &[u8],
    ) -> Result<[u8; SHA256_HASH_LEN_BYTES], Error> {
        let (Z, V) = self.get_ZV_as_prover(pB)?;
        self.get_TT(context, pA, pB, &Z, &V)
    }

    #[allow(non_snake_case)]
    pub fn get_TT_as_verifier(
        &self,
        context: &[u8],
        pA: &[u8],
        pB: &[u8],
    ) -> Result<[u8; SHA256_HASH_LEN_BYTES], Error> {
        let (Z, V) = self.get_ZV_as_verifier(pA)?;
        self.get_TT(context, pA, pB, &Z, &V)
    }

    #[allow(non_snake_case)]
    fn get_TT(
        &self,
        context: &[u8],
        pA: &[u8],
        pB: &[u8],
        Z: &ProjectivePoint,
        V: &ProjectivePoint,
    ) -> Result<[u8; SHA256_HASH_LEN_BYTES], Error> {
        let mut TT = Sha256::new()?;

        // Context
        add_to_tt(&mut TT, context)?;
        // 2 empty identifiers
        add_to_tt(&mut TT, &[])?;
        add_to_tt(&mut TT, &[])?;
        // M
        add_to_tt(&mut TT, &MATTER_M_BIN)?;
        // N
        add_to_tt(&mut TT, &MATTER_N_BIN)?;
        // X = pA
        add_to_tt(&mut TT, pA)?;
        // Y = pB
        add_to_tt(&mut TT, pB)?;

        let mut z = point_to_bytes(Z)?;
        let mut v = point_to_bytes(V)?;
        let mut w0 = self.w0_bytes();

        add_to_tt(&mut TT, &z)?;
        add_to_tt(&mut TT, &v)?;
        add_to_tt(&mut TT, &w0)?;

        z.zeroize();
        v.zeroize();
        w0.zeroize();

        let mut out = [0; SHA256_HASH_LEN_BYTES];
        TT.finish(&mut out)?;

        Ok(out)
    }
}

impl Drop for CryptoSpake2 {
    fn drop(&mut self) {
        self.xy = Scalar::ZERO;
        self.w0 = Scalar::ZERO;
        self.w1 = None;
        self.L = None;
    }
}
