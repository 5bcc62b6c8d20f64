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

use aes::Aes128;
use ccm::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    consts::{U13, U16},
    Ccm,
};
use elliptic_curve::sec1::ToEncodedPoint;
use hmac::Mac;
use log::error;
use p256::{
    ecdsa::{
        signature::{Signer, Verifier},
        Signature, SigningKey, VerifyingKey,
    },
    PublicKey, SecretKey,
};
use sha2::Digest;

use crate::error::{Error, ErrorCode};
use crate::utils::rand::Rand;

use super::{
    RandRngCore, AEAD_MIC_LEN_BYTES, AEAD_NONCE_LEN_BYTES, EC_POINT_LEN_BYTES,
    EC_PRIVATE_KEY_LEN_BYTES, EC_SIGNATURE_LEN_BYTES, ECDH_SHARED_SECRET_LEN_BYTES,
    SYMM_KEY_LEN_BYTES,
};

type HmacSha256I = hmac::Hmac<sha2::Sha256>;
type AesCcm = Ccm<Aes128, U16, U13>;

#[derive(Debug, Clone)]
pub struct Sha256 {
    hasher: sha2::Sha256,
}

impl Sha256 {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            hasher: sha2::Sha256::new(),
        })
    }

    pub fn update(&mut self, data: &[u8]) -> Result<(), Error> {
        self.hasher.update(data);
        Ok(())
    }

    pub fn finish(self, digest: &mut [u8]) -> Result<(), Error> {
        let output = self.hasher.finalize();
        if digest.len() != output.len() {
            Err(ErrorCode::NoSpace)?;
        }

        digest.copy_from_slice(output.as_slice());
        Ok(())
    }
}

pub struct HmacSha256 {
    inner: HmacSha256I,
}

impl HmacSha256 {
    pub fn new(key: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            inner: <HmacSha256I as Mac>::new_from_slice(key).map_err(|e| {
                error!("Error creating HmacSha256 {}", e);
                ErrorCode::Crypto
            })?,
        })
    }

    pub fn update(&mut self, data: &[u8]) -> Result<(), Error> {
        self.inner.update(data);
        Ok(())
    }

    pub fn finish(self, out: &mut [u8]) -> Result<(), Error> {
        let result = self.inner.finalize().into_bytes();
        if out.len() != result.len() {
            Err(ErrorCode::NoSpace)?;
        }

        out.copy_from_slice(&result);
        Ok(())
    }
}

#[derive(Debug)]
enum KeyType {
    Private(SecretKey),
    Public(PublicKey),
}

/// A NIST P-256 key pair, or just the public half of one
#[derive(Debug)]
pub struct KeyPair {
    key: KeyType,
}

impl KeyPair {
    pub fn new(rand: Rand) -> Result<Self, Error> {
        let mut rng = RandRngCore(rand);
        let secret_key = SecretKey::random(&mut rng);

        Ok(Self {
            key: KeyType::Private(secret_key),
        })
    }

    pub fn new_from_components(pub_key: &[u8], priv_key: &[u8]) -> Result<Self, Error> {
        let secret_key = SecretKey::from_slice(priv_key).map_err(|_| ErrorCode::Crypto)?;
        let public_key = PublicKey::from_sec1_bytes(pub_key).map_err(|_| ErrorCode::Crypto)?;

        if public_key != secret_key.public_key() {
            error!("Public key does not match the private key");
            Err(ErrorCode::Crypto)?;
        }

        Ok(Self {
            key: KeyType::Private(secret_key),
        })
    }

    pub fn new_from_public(pub_key: &[u8]) -> Result<Self, Error> {
        let public_key = PublicKey::from_sec1_bytes(pub_key).map_err(|_| ErrorCode::Crypto)?;

        Ok(Self {
            key: KeyType::Public(public_key),
        })
    }

    fn public_key(&self) -> PublicKey {
        match &self.key {
            KeyType::Private(k) => k.public_key(),
            KeyType::Public(k) => k.clone(),
        }
    }

    fn private_key(&self) -> Result<&SecretKey, Error> {
        match &self.key {
            KeyType::Private(key) => Ok(key),
            KeyType::Public(_) => Err(ErrorCode::Crypto.into()),
        }
    }

    /// Write the uncompressed SEC1 encoding of the public key into `pub_key`
    pub fn get_public_key(&self, pub_key: &mut [u8]) -> Result<usize, Error> {
        let point = self.public_key().to_encoded_point(false);
        let bytes = point.as_bytes();
        if pub_key.len() < bytes.len() {
            Err(ErrorCode::NoSpace)?;
        }

        pub_key[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    pub fn public_key_bytes(&self) -> Result<[u8; EC_POINT_LEN_BYTES], Error> {
        let mut out = [0; EC_POINT_LEN_BYTES];
        self.get_public_key(&mut out)?;

        Ok(out)
    }

    pub fn get_private_key(&self, priv_key: &mut [u8]) -> Result<usize, Error> {
        let bytes = self.private_key()?.to_bytes();
        if priv_key.len() < EC_PRIVATE_KEY_LEN_BYTES {
            Err(ErrorCode::NoSpace)?;
        }

        priv_key[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    /// ECDH with the peer's (uncompressed SEC1) public key
    pub fn derive_secret(&self, peer_pub_key: &[u8], secret: &mut [u8]) -> Result<usize, Error> {
        let peer_pubkey =
            PublicKey::from_sec1_bytes(peer_pub_key).map_err(|_| ErrorCode::InvalidData)?;
        let private_key = self.private_key()?;
        let shared_secret = p256::ecdh::diffie_hellman(
            private_key.to_nonzero_scalar(),
            peer_pubkey.as_affine(),
        );

        let bytes = shared_secret.raw_secret_bytes();
        if secret.len() < ECDH_SHARED_SECRET_LEN_BYTES {
            Err(ErrorCode::NoSpace)?;
        }

        secret[..bytes.len()].copy_from_slice(bytes.as_slice());
        Ok(bytes.len())
    }

    /// ECDSA-SHA256 signature in the raw `r || s` format
    pub fn sign_msg(&self, msg: &[u8], signature: &mut [u8]) -> Result<usize, Error> {
        if signature.len() < EC_SIGNATURE_LEN_BYTES {
            Err(ErrorCode::NoSpace)?;
        }

        let signing_key = SigningKey::from(self.private_key()?);
        let sig: Signature = signing_key.sign(msg);
        let bytes = sig.to_bytes();

        signature[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    pub fn verify_msg(&self, msg: &[u8], signature: &[u8]) -> Result<(), Error> {
        let verifying_key = VerifyingKey::from(&self.public_key());
        let signature = Signature::from_slice(signature).map_err(|_| ErrorCode::InvalidSignature)?;

        verifying_key
            .verify(msg, &signature)
            .map_err(|_| ErrorCode::InvalidSignature)?;

        Ok(())
    }
}

pub fn pbkdf2_hmac(pass: &[u8], iter: usize, salt: &[u8], key: &mut [u8]) -> Result<(), Error> {
    pbkdf2::pbkdf2::<HmacSha256I>(pass, salt, iter as u32, key).map_err(|e| {
        error!("Error with pbkdf2_hmac {}", e);
        ErrorCode::Crypto
    })?;

    Ok(())
}

pub fn hkdf_sha256(salt: &[u8], ikm: &[u8], info: &[u8], key: &mut [u8]) -> Result<(), Error> {
    hkdf::Hkdf::<sha2::Sha256>::new(Some(salt), ikm)
        .expand(info, key)
        .map_err(|e| {
            error!("Error with hkdf_sha256 {}", e);
            ErrorCode::Crypto.into()
        })
}

fn aead_cipher(key: &[u8], nonce: &[u8]) -> Result<AesCcm, Error> {
    if key.len() != SYMM_KEY_LEN_BYTES || nonce.len() != AEAD_NONCE_LEN_BYTES {
        Err(ErrorCode::Crypto)?;
    }

    AesCcm::new_from_slice(key).map_err(|_| ErrorCode::Crypto.into())
}

/// AES-CCM encrypt the first `data_len` bytes of `data` in place and append the tag.
///
/// Returns the length of the ciphertext including the tag.
pub fn encrypt_in_place(
    key: &[u8],
    nonce: &[u8],
    ad: &[u8],
    data: &mut [u8],
    data_len: usize,
) -> Result<usize, Error> {
    let cipher = aead_cipher(key, nonce)?;
    if data.len() < data_len + AEAD_MIC_LEN_BYTES {
        Err(ErrorCode::NoSpace)?;
    }

    let (text, rest) = data.split_at_mut(data_len);
    let tag = cipher.encrypt_in_place_detached(GenericArray::from_slice(nonce), ad, text)?;
    rest[..AEAD_MIC_LEN_BYTES].copy_from_slice(&tag);

    Ok(data_len + AEAD_MIC_LEN_BYTES)
}

/// AES-CCM decrypt `data` (ciphertext followed by the tag) in place.
///
/// Returns the length of the plain text, which starts at offset 0 of `data`.
pub fn decrypt_in_place(
    key: &[u8],
    nonce: &[u8],
    ad: &[u8],
    data: &mut [u8],
) -> Result<usize, Error> {
    let cipher = aead_cipher(key, nonce)?;
    if data.len() < AEAD_MIC_LEN_BYTES {
        Err(ErrorCode::TruncatedPacket)?;
    }

    let text_len = data.len() - AEAD_MIC_LEN_BYTES;
    let (text, tag) = data.split_at_mut(text_len);
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            ad,
            text,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| ErrorCode::AuthenticationFailed)?;

    Ok(text_len)
}
