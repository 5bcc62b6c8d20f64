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

use byteorder::{ByteOrder, LittleEndian};
use num_derive::FromPrimitive;

use crate::error::*;
use crate::utils::writebuf::WriteBuf;

#[allow(dead_code)]
#[derive(FromPrimitive, PartialEq, Eq, Debug, Copy, Clone)]
pub enum GeneralCode {
    Success = 0,
    Failure = 1,
    BadPrecondition = 2,
    OutOfRange = 3,
    BadRequest = 4,
    Unsupported = 5,
    Unexpected = 6,
    ResourceExhausted = 7,
    Busy = 8,
    Timeout = 9,
    Continue = 10,
    Aborted = 11,
    InvalidArgument = 12,
    NotFound = 13,
    AlreadyExists = 14,
    PermissionDenied = 15,
    DataLoss = 16,
}

/// A Status Report message, as per "Appendix D: Status Report Messages" of the Matter Spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport<'a> {
    pub general_code: GeneralCode,
    pub proto_id: u32,
    pub proto_code: u16,
    pub proto_data: &'a [u8],
}

impl<'a> StatusReport<'a> {
    pub const LEN: usize = 8;

    pub fn read(data: &'a [u8]) -> Result<Self, Error> {
        if data.len() < Self::LEN {
            Err(ErrorCode::TruncatedPacket)?;
        }

        Ok(Self {
            general_code: num::FromPrimitive::from_u16(LittleEndian::read_u16(&data[0..2]))
                .ok_or(ErrorCode::InvalidData)?,
            proto_id: LittleEndian::read_u32(&data[2..6]),
            proto_code: LittleEndian::read_u16(&data[6..8]),
            proto_data: &data[Self::LEN..],
        })
    }

    pub fn write(&self, wb: &mut WriteBuf) -> Result<(), Error> {
        wb.le_u16(self.general_code as u16)?;
        wb.le_u32(self.proto_id)?;
        wb.le_u16(self.proto_code)?;
        wb.append(self.proto_data)?;

        Ok(())
    }

    /// The minimum wait a Busy responder asks for, if present
    pub fn busy_wait_ms(&self) -> Option<u16> {
        (self.general_code == GeneralCode::Busy && self.proto_data.len() >= 2)
            .then(|| LittleEndian::read_u16(self.proto_data))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, Error> {
        let mut buf = alloc::vec![0; Self::LEN + self.proto_data.len()];
        let mut wb = WriteBuf::new(&mut buf);
        self.write(&mut wb)?;

        Ok(buf)
    }
}
