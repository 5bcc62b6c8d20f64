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

//! The cryptographic primitives used by the secure channel and the session layer.
//!
//! All of them are implemented on top of the RustCrypto crates.

use rand_core::{CryptoRng, RngCore};

use crate::utils::rand::Rand;

mod canon;
mod crypto_rustcrypto;

pub use canon::*;
pub use crypto_rustcrypto::*;

pub const SYMM_KEY_LEN_BITS: usize = 128;
pub const SYMM_KEY_LEN_BYTES: usize = SYMM_KEY_LEN_BITS / 8;

pub const AEAD_MIC_LEN_BYTES: usize = 16;
pub const AEAD_NONCE_LEN_BYTES: usize = 13;

pub const SHA256_HASH_LEN_BYTES: usize = 256 / 8;

pub const EC_POINT_LEN_BYTES: usize = 65;
pub const EC_SIGNATURE_LEN_BYTES: usize = 64;
pub const EC_PRIVATE_KEY_LEN_BYTES: usize = 32;
pub const ECDH_SHARED_SECRET_LEN_BYTES: usize = 32;

/// Adapts a [`Rand`] callback to the `rand_core` traits expected by the RustCrypto crates
pub struct RandRngCore(pub Rand);

impl RngCore for RandRngCore {
    fn next_u32(&mut self) -> u32 {
        let mut buf = [0; 4];
        self.fill_bytes(&mut buf);

        u32::from_le_bytes(buf)
    }

    fn next_u64(&mut self) -> u64 {
        let mut buf = [0; 8];
        self.fill_bytes(&mut buf);

        u64::from_le_bytes(buf)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        (self.0)(dest);
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for RandRngCore {}
