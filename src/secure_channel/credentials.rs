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

//! Operational identities used by CASE.
//!
//! Certificates are opaque to this crate: a fabric carries its NOC (and
//! optional ICAC) as blobs, and an [`OperationalCredentials`] implementation
//! decides whether a peer's chain is acceptable and which key and node id it
//! binds. [`RootAuthority`] provides a compact TLV-encoded credential format
//! for deployments and tests that do not need X.509.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use log::{error, info};
use subtle::ConstantTimeEq;

use crate::crypto::{
    HmacSha256, KeyPair, EC_POINT_LEN_BYTES, EC_SIGNATURE_LEN_BYTES, SHA256_HASH_LEN_BYTES,
    SYMM_KEY_LEN_BYTES,
};
use crate::error::{Error, ErrorCode};
use crate::tlv::{get_root_node_struct, TLVWriter, TagType};
use crate::utils::rand::Rand;
use crate::utils::writebuf::WriteBuf;

pub const MAX_CERT_LEN: usize = 600;
pub const DEST_ID_LEN: usize = SHA256_HASH_LEN_BYTES;

/// What a validated peer certificate chain binds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    pub node_id: u64,
    pub fabric_id: u64,
    pub pub_key: [u8; EC_POINT_LEN_BYTES],
}

/// Validates a peer's operational certificate chain against a trust root
pub trait OperationalCredentials {
    fn validate_peer(
        &self,
        root_pubkey: &[u8; EC_POINT_LEN_BYTES],
        noc: &[u8],
        icac: Option<&[u8]>,
    ) -> Result<PeerIdentity, Error>;
}

/// Our membership in a fabric: operational key, certificates and the IPK
pub struct LocalFabric {
    fabric_id: u64,
    node_id: u64,
    root_pubkey: [u8; EC_POINT_LEN_BYTES],
    ipk: [u8; SYMM_KEY_LEN_BYTES],
    key_pair: KeyPair,
    noc: Vec<u8>,
    icac: Option<Vec<u8>>,
    credentials: Box<dyn OperationalCredentials>,
}

impl LocalFabric {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fabric_id: u64,
        node_id: u64,
        root_pubkey: [u8; EC_POINT_LEN_BYTES],
        ipk: [u8; SYMM_KEY_LEN_BYTES],
        key_pair: KeyPair,
        noc: Vec<u8>,
        icac: Option<Vec<u8>>,
        credentials: Box<dyn OperationalCredentials>,
    ) -> Result<Self, Error> {
        if noc.len() > MAX_CERT_LEN || icac.as_ref().map(|c| c.len()).unwrap_or(0) > MAX_CERT_LEN {
            Err(ErrorCode::NoSpace)?;
        }

        Ok(Self {
            fabric_id,
            node_id,
            root_pubkey,
            ipk,
            key_pair,
            noc,
            icac,
            credentials,
        })
    }

    pub fn fabric_id(&self) -> u64 {
        self.fabric_id
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn root_pubkey(&self) -> &[u8; EC_POINT_LEN_BYTES] {
        &self.root_pubkey
    }

    pub fn ipk(&self) -> &[u8; SYMM_KEY_LEN_BYTES] {
        &self.ipk
    }

    pub fn noc(&self) -> &[u8] {
        &self.noc
    }

    pub fn icac(&self) -> Option<&[u8]> {
        self.icac.as_deref()
    }

    pub fn sign_msg(&self, msg: &[u8]) -> Result<[u8; EC_SIGNATURE_LEN_BYTES], Error> {
        let mut signature = [0; EC_SIGNATURE_LEN_BYTES];
        self.key_pair.sign_msg(msg, &mut signature)?;

        Ok(signature)
    }

    /// HMAC(IPK, random || root public key || fabric id || node id)
    pub fn dest_id(&self, initiator_random: &[u8], node_id: u64) -> Result<[u8; DEST_ID_LEN], Error> {
        let mut mac = HmacSha256::new(&self.ipk)?;

        mac.update(initiator_random)?;
        mac.update(&self.root_pubkey)?;
        mac.update(&self.fabric_id.to_le_bytes())?;
        mac.update(&node_id.to_le_bytes())?;

        let mut id = [0; DEST_ID_LEN];
        mac.finish(&mut id)?;

        Ok(id)
    }

    /// Validate a peer chain and check it belongs to this fabric
    pub fn validate_peer(&self, noc: &[u8], icac: Option<&[u8]>) -> Result<PeerIdentity, Error> {
        let peer = self
            .credentials
            .validate_peer(&self.root_pubkey, noc, icac)?;

        if peer.fabric_id != self.fabric_id {
            error!(
                "Peer fabric {:x} does not match ours {:x}",
                peer.fabric_id, self.fabric_id
            );
            Err(ErrorCode::NoSharedTrustRoots)?;
        }

        Ok(peer)
    }
}

impl fmt::Debug for LocalFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFabric")
            .field("fabric_id", &self.fabric_id)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// The fabrics this node is a member of, keyed by fabric index
#[derive(Debug, Default)]
pub struct FabricTable {
    fabrics: BTreeMap<u8, LocalFabric>,
}

impl FabricTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, fabric: LocalFabric) -> Result<u8, Error> {
        let fabric_idx = (1..=u8::MAX)
            .find(|idx| !self.fabrics.contains_key(idx))
            .ok_or(ErrorCode::NoSpace)?;

        info!(
            "Adding fabric {:x} node {:x} at index {}",
            fabric.fabric_id, fabric.node_id, fabric_idx
        );

        self.fabrics.insert(fabric_idx, fabric);

        Ok(fabric_idx)
    }

    pub fn remove(&mut self, fabric_idx: u8) -> Option<LocalFabric> {
        self.fabrics.remove(&fabric_idx)
    }

    pub fn get(&self, fabric_idx: u8) -> Option<&LocalFabric> {
        self.fabrics.get(&fabric_idx)
    }

    pub fn len(&self) -> usize {
        self.fabrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fabrics.is_empty()
    }

    /// The index of the fabric a Sigma1 destination id designates us in
    pub fn match_dest_id(&self, initiator_random: &[u8], dest_id: &[u8]) -> Result<u8, Error> {
        for (fabric_idx, fabric) in &self.fabrics {
            let candidate = fabric.dest_id(initiator_random, fabric.node_id)?;

            if candidate.ct_eq(dest_id).unwrap_u8() == 1 {
                return Ok(*fabric_idx);
            }
        }

        Err(ErrorCode::NoSharedTrustRoots.into())
    }
}

const CRED_TAG_NODE_ID: u8 = 1;
const CRED_TAG_FABRIC_ID: u8 = 2;
const CRED_TAG_PUB_KEY: u8 = 3;
const CRED_TAG_SIGNATURE: u8 = 4;

/// A trust root issuing compact operational credentials.
///
/// A credential is a TLV structure of node id, fabric id and public key,
/// signed by the root key. There is no intermediate: an ICAC is rejected.
pub struct RootAuthority {
    fabric_id: u64,
    key_pair: KeyPair,
}

impl RootAuthority {
    pub fn new(fabric_id: u64, rand: Rand) -> Result<Self, Error> {
        Ok(Self {
            fabric_id,
            key_pair: KeyPair::new(rand)?,
        })
    }

    pub fn fabric_id(&self) -> u64 {
        self.fabric_id
    }

    pub fn root_pubkey(&self) -> Result<[u8; EC_POINT_LEN_BYTES], Error> {
        self.key_pair.public_key_bytes()
    }

    fn write_tbs(
        wb: &mut WriteBuf,
        node_id: u64,
        fabric_id: u64,
        pub_key: &[u8],
    ) -> Result<(), Error> {
        let mut tw = TLVWriter::new(wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.u64(TagType::Context(CRED_TAG_NODE_ID), node_id)?;
        tw.u64(TagType::Context(CRED_TAG_FABRIC_ID), fabric_id)?;
        tw.str8(TagType::Context(CRED_TAG_PUB_KEY), pub_key)?;
        tw.end_container()
    }

    /// Issue a credential binding `pub_key` to `node_id` in our fabric
    pub fn issue(&self, node_id: u64, pub_key: &[u8; EC_POINT_LEN_BYTES]) -> Result<Vec<u8>, Error> {
        let mut tbs = [0; 128];
        let mut wb = WriteBuf::new(&mut tbs);
        Self::write_tbs(&mut wb, node_id, self.fabric_id, pub_key)?;

        let mut signature = [0; EC_SIGNATURE_LEN_BYTES];
        self.key_pair.sign_msg(wb.as_slice(), &mut signature)?;

        let mut buf = [0; 256];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.u64(TagType::Context(CRED_TAG_NODE_ID), node_id)?;
        tw.u64(TagType::Context(CRED_TAG_FABRIC_ID), self.fabric_id)?;
        tw.str8(TagType::Context(CRED_TAG_PUB_KEY), pub_key)?;
        tw.str8(TagType::Context(CRED_TAG_SIGNATURE), &signature)?;
        tw.end_container()?;

        Ok(wb.as_slice().to_vec())
    }

    /// Create a fresh operational identity for `node_id` and wrap it as a fabric
    pub fn new_fabric(
        &self,
        node_id: u64,
        ipk: [u8; SYMM_KEY_LEN_BYTES],
        rand: Rand,
    ) -> Result<LocalFabric, Error> {
        let key_pair = KeyPair::new(rand)?;
        let noc = self.issue(node_id, &key_pair.public_key_bytes()?)?;

        LocalFabric::new(
            self.fabric_id,
            node_id,
            self.root_pubkey()?,
            ipk,
            key_pair,
            noc,
            None,
            Box::new(CompactCredentials),
        )
    }
}

/// Validates credentials issued by a [`RootAuthority`]
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactCredentials;

impl OperationalCredentials for CompactCredentials {
    fn validate_peer(
        &self,
        root_pubkey: &[u8; EC_POINT_LEN_BYTES],
        noc: &[u8],
        icac: Option<&[u8]>,
    ) -> Result<PeerIdentity, Error> {
        if icac.is_some() {
            error!("Intermediate certificates are not supported");
            Err(ErrorCode::InvalidData)?;
        }

        let root = get_root_node_struct(noc)?;
        let node_id = root.find_tag(CRED_TAG_NODE_ID)?.u64()?;
        let fabric_id = root.find_tag(CRED_TAG_FABRIC_ID)?.u64()?;
        let pub_key: [u8; EC_POINT_LEN_BYTES] =
            root.find_tag(CRED_TAG_PUB_KEY)?.slice()?.try_into()?;
        let signature = root.find_tag(CRED_TAG_SIGNATURE)?.slice()?;

        let mut tbs = [0; 128];
        let mut wb = WriteBuf::new(&mut tbs);
        RootAuthority::write_tbs(&mut wb, node_id, fabric_id, &pub_key)?;

        KeyPair::new_from_public(root_pubkey)?.verify_msg(wb.as_slice(), signature)?;

        Ok(PeerIdentity {
            node_id,
            fabric_id,
            pub_key,
        })
    }
}
