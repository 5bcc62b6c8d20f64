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

//! CASE session resumption records.
//!
//! After a full CASE both sides keep the resumption id and the shared secret
//! of the session. The responder looks a record up by resumption id, the
//! initiator by peer.

use alloc::format;
use alloc::string::String;

use log::{debug, warn};
use zeroize::Zeroize;

use crate::crypto::ECDH_SHARED_SECRET_LEN_BYTES;
use crate::error::{Error, ErrorCode};
use crate::persist::KvStore;

pub const RESUMPTION_ID_LEN: usize = 16;

const RECORD_LEN: usize = RESUMPTION_ID_LEN + ECDH_SHARED_SECRET_LEN_BYTES + 1 + 8;

#[derive(Clone, PartialEq, Eq)]
pub struct ResumptionRecord {
    pub resumption_id: [u8; RESUMPTION_ID_LEN],
    pub shared_secret: [u8; ECDH_SHARED_SECRET_LEN_BYTES],
    pub fabric_idx: u8,
    pub peer_node_id: u64,
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

impl ResumptionRecord {
    fn id_key(resumption_id: &[u8]) -> String {
        format!("case-res-{}", hex(resumption_id))
    }

    fn peer_key(fabric_idx: u8, peer_node_id: u64) -> String {
        format!("case-peer-{}-{:016x}", fabric_idx, peer_node_id)
    }

    fn encode(&self) -> [u8; RECORD_LEN] {
        let mut buf = [0; RECORD_LEN];

        let (id, rest) = buf.split_at_mut(RESUMPTION_ID_LEN);
        id.copy_from_slice(&self.resumption_id);
        let (secret, rest) = rest.split_at_mut(ECDH_SHARED_SECRET_LEN_BYTES);
        secret.copy_from_slice(&self.shared_secret);
        rest[0] = self.fabric_idx;
        rest[1..].copy_from_slice(&self.peer_node_id.to_le_bytes());

        buf
    }

    fn decode(data: &[u8]) -> Result<Self, Error> {
        if data.len() != RECORD_LEN {
            Err(ErrorCode::InvalidData)?;
        }

        let (id, rest) = data.split_at(RESUMPTION_ID_LEN);
        let (secret, rest) = rest.split_at(ECDH_SHARED_SECRET_LEN_BYTES);

        Ok(Self {
            resumption_id: id.try_into()?,
            shared_secret: secret.try_into()?,
            fabric_idx: rest[0],
            peer_node_id: u64::from_le_bytes(rest[1..].try_into()?),
        })
    }

    fn load(store: &dyn KvStore, key: &str) -> Result<Option<Self>, Error> {
        let mut buf = [0; RECORD_LEN];

        let record = match store.load(key, &mut buf)? {
            Some(data) => Some(Self::decode(data)),
            None => None,
        };
        buf.zeroize();

        match record {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => {
                warn!("Dropping corrupted resumption record {}: {}", key, e);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    pub fn load_by_id(store: &dyn KvStore, resumption_id: &[u8]) -> Result<Option<Self>, Error> {
        Self::load(store, &Self::id_key(resumption_id))
    }

    pub fn load_by_peer(
        store: &dyn KvStore,
        fabric_idx: u8,
        peer_node_id: u64,
    ) -> Result<Option<Self>, Error> {
        Self::load(store, &Self::peer_key(fabric_idx, peer_node_id))
    }

    /// Persist the record, replacing whatever the same peer had before
    pub fn save(&self, store: &mut dyn KvStore) -> Result<(), Error> {
        if let Some(previous) =
            Self::load_by_peer(&*store, self.fabric_idx, self.peer_node_id)?
        {
            if previous.resumption_id != self.resumption_id {
                store.remove(&Self::id_key(&previous.resumption_id))?;
            }
        }

        let mut data = self.encode();
        store.store(&Self::id_key(&self.resumption_id), &data)?;
        store.store(&Self::peer_key(self.fabric_idx, self.peer_node_id), &data)?;
        data.zeroize();

        debug!(
            "Saved resumption record for node {:016x} on fabric {}",
            self.peer_node_id, self.fabric_idx
        );

        Ok(())
    }

    pub fn forget(&self, store: &mut dyn KvStore) -> Result<(), Error> {
        store.remove(&Self::id_key(&self.resumption_id))?;
        store.remove(&Self::peer_key(self.fabric_idx, self.peer_node_id))
    }
}

impl Drop for ResumptionRecord {
    fn drop(&mut self) {
        self.shared_secret.zeroize();
    }
}

impl core::fmt::Debug for ResumptionRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResumptionRecord")
            .field("resumption_id", &self.resumption_id)
            .field("fabric_idx", &self.fabric_idx)
            .field("peer_node_id", &self.peer_node_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::persist::MemKvStore;

    fn record(id: u8) -> ResumptionRecord {
        ResumptionRecord {
            resumption_id: [id; RESUMPTION_ID_LEN],
            shared_secret: [0x5e; ECDH_SHARED_SECRET_LEN_BYTES],
            fabric_idx: 1,
            peer_node_id: 0x1234,
        }
    }

    #[test]
    fn lookups() {
        let mut store = MemKvStore::new();
        record(1).save(&mut store).unwrap();

        assert_eq!(
            ResumptionRecord::load_by_id(&store, &[1; RESUMPTION_ID_LEN]).unwrap(),
            Some(record(1))
        );
        assert_eq!(
            ResumptionRecord::load_by_peer(&store, 1, 0x1234).unwrap(),
            Some(record(1))
        );
        assert_eq!(ResumptionRecord::load_by_peer(&store, 2, 0x1234).unwrap(), None);
    }

    #[test]
    fn newer_record_replaces_older() {
        let mut store = MemKvStore::new();
        record(1).save(&mut store).unwrap();
        record(2).save(&mut store).unwrap();

        assert_eq!(
            ResumptionRecord::load_by_id(&store, &[1; RESUMPTION_ID_LEN]).unwrap(),
            None
        );
        assert_eq!(
            ResumptionRecord::load_by_peer(&store, 1, 0x1234).unwrap(),
            Some(record(2))
        );
        assert_eq!(store.len(), 2);

        record(2).forget(&mut store).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn corrupted_record_is_ignored() {
        let mut store = MemKvStore::new();
        store.store("case-peer-1-0000000000001234", &[1, 2, 3]).unwrap();

        assert_eq!(ResumptionRecord::load_by_peer(&store, 1, 0x1234).unwrap(), None);
    }
}
