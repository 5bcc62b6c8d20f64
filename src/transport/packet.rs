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

use alloc::vec;
use alloc::vec::Vec;

use log::trace;

use crate::crypto::AEAD_MIC_LEN_BYTES;
use crate::error::*;
use crate::utils::{parsebuf::ParseBuf, writebuf::WriteBuf};

use super::network::{Address, MAX_TX_BUF_SIZE};
use super::plain_hdr::{self, PlainHdr};
use super::proto_hdr::ProtoHdr;
use super::session_crypto::CryptoContext;

/// A received message, decoded in place.
///
/// Decoding goes in three steps since the session (and hence the key) is
/// only known once the plain header is parsed.
pub struct RxPacket<'a> {
    pub peer: Address,
    pub plain: PlainHdr,
    pub proto: ProtoHdr,
    pb: ParseBuf<'a>,
}

impl<'a> RxPacket<'a> {
    pub fn new(peer: Address, buf: &'a mut [u8]) -> Self {
        Self {
            peer,
            plain: PlainHdr::new(),
            proto: ProtoHdr::new(),
            pb: ParseBuf::new(buf),
        }
    }

    pub fn plain_hdr_decode(&mut self) -> Result<(), Error> {
        self.plain.decode(&mut self.pb)
    }

    /// Authenticate and decrypt the rest of the message.
    ///
    /// `node_id` is the node id of the sender as known to the session.
    pub fn decrypt(&mut self, crypto: &CryptoContext, node_id: u64) -> Result<(), Error> {
        let sec_flags = self.plain.sec_flags.bits();
        let ctr = self.plain.ctr;

        let (aad, data) = self.pb.split_parsed_mut();
        let len = crypto.decrypt(sec_flags, ctr, node_id, aad, data)?;

        self.pb.tail(self.pb.remaining() - len)?;

        Ok(())
    }

    pub fn proto_hdr_decode(&mut self) -> Result<(), Error> {
        self.proto.decode(&mut self.pb)?;
        self.proto.adjust_reliability(true, &self.peer);

        Ok(())
    }

    /// Range of the application payload within the original buffer
    pub fn payload_range(&self) -> (usize, usize) {
        self.pb.slice_range()
    }

    pub fn payload(&self) -> &[u8] {
        self.pb.as_slice()
    }
}

/// Encode (and, for secure sessions, encrypt) an outgoing message.
///
/// `crypto` carries the session context and our own node id, which goes into the nonce.
pub fn encode_tx(
    plain: &PlainHdr,
    proto: &ProtoHdr,
    payload: &[u8],
    crypto: Option<(&CryptoContext, u64)>,
) -> Result<Vec<u8>, Error> {
    let mut hdr_buf = [0; plain_hdr::max_plain_hdr_len()];
    let mut hdr = WriteBuf::new(&mut hdr_buf);
    plain.encode(&mut hdr)?;

    let mut buf = vec![0; MAX_TX_BUF_SIZE];
    let mut wb = WriteBuf::new(&mut buf);
    wb.reserve(plain_hdr::max_plain_hdr_len())?;

    proto.encode(&mut wb)?;
    wb.append(payload)?;

    if let Some((ctx, local_nodeid)) = crypto {
        let data_len = wb.len();
        wb.append(&[0; AEAD_MIC_LEN_BYTES])?;

        ctx.encrypt(
            plain.sec_flags.bits(),
            plain.ctr,
            local_nodeid,
            hdr.as_slice(),
            wb.as_mut_slice(),
            data_len,
        )?;
    }

    wb.prepend(hdr.as_slice())?;
    trace!("[tx] {} {}: {} bytes", plain, proto, wb.len());

    Ok(wb.as_slice().to_vec())
}
