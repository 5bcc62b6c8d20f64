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

use core::fmt;

use zeroize::Zeroize;

use super::{SHA256_HASH_LEN_BYTES, SYMM_KEY_LEN_BYTES};

/// Secret key material of a fixed length.
///
/// The bytes are wiped when the value is dropped, are never printed by `Debug`,
/// and are only reachable through `access`/`access_mut`.
#[derive(Clone)]
pub struct CryptoSensitive<const N: usize> {
    data: [u8; N],
}

impl<const N: usize> CryptoSensitive<N> {
    pub const fn new() -> Self {
        Self { data: [0; N] }
    }

    pub fn new_from_slice(data: &[u8]) -> Option<Self> {
        let mut this = Self::new();
        this.load(data).then_some(this)
    }

    /// Load the material from `data`, returning `false` on a length mismatch
    pub fn load(&mut self, data: &[u8]) -> bool {
        if data.len() == N {
            self.data.copy_from_slice(data);
            true
        } else {
            false
        }
    }

    pub fn access(&self) -> &[u8; N] {
        &self.data
    }

    pub fn access_mut(&mut self) -> &mut [u8; N] {
        &mut self.data
    }
}

impl<const N: usize> Default for CryptoSensitive<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Drop for CryptoSensitive<N> {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl<const N: usize> fmt::Debug for CryptoSensitive<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CryptoSensitive<{}>(**hidden**)", N)
    }
}

/// A 128-bit AES-CCM session key
pub type AeadKey = CryptoSensitive<SYMM_KEY_LEN_BYTES>;

/// The attestation challenge derived alongside the session keys
pub type AttChallenge = CryptoSensitive<SYMM_KEY_LEN_BYTES>;

/// A shared secret, as produced by ECDH or kept for session resumption
pub type SharedSecret = CryptoSensitive<SHA256_HASH_LEN_BYTES>;
