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

use log::error;

use super::{ElementTypeId, TagType, TAG_CTL_ANONYMOUS, TAG_CTL_CONTEXT, TAG_SHIFT_BITS};
use crate::{error::*, utils::writebuf::WriteBuf};

pub struct TLVWriter<'a, 'b> {
    buf: &'a mut WriteBuf<'b>,
}

impl<'a, 'b> TLVWriter<'a, 'b> {
    pub fn new(buf: &'a mut WriteBuf<'b>) -> Self {
        TLVWriter { buf }
    }

    fn put_control_tag(&mut self, tag_type: TagType, val_type: ElementTypeId) -> Result<(), Error> {
        match tag_type {
            TagType::Anonymous => self
                .buf
                .le_u8((TAG_CTL_ANONYMOUS << TAG_SHIFT_BITS) | val_type as u8),
            TagType::Context(tag) => {
                self.buf
                    .le_u8((TAG_CTL_CONTEXT << TAG_SHIFT_BITS) | val_type as u8)?;
                self.buf.le_u8(tag)
            }
        }
    }

    pub fn u8(&mut self, tag_type: TagType, data: u8) -> Result<(), Error> {
        self.put_control_tag(tag_type, ElementTypeId::U8)?;
        self.buf.le_u8(data)
    }

    pub fn u16(&mut self, tag_type: TagType, data: u16) -> Result<(), Error> {
        if data <= 0xff {
            self.u8(tag_type, data as u8)
        } else {
            self.put_control_tag(tag_type, ElementTypeId::U16)?;
            self.buf.le_u16(data)
        }
    }

    pub fn u32(&mut self, tag_type: TagType, data: u32) -> Result<(), Error> {
        if data <= 0xffff {
            self.u16(tag_type, data as u16)
        } else {
            self.put_control_tag(tag_type, ElementTypeId::U32)?;
            self.buf.le_u32(data)
        }
    }

    pub fn u64(&mut self, tag_type: TagType, data: u64) -> Result<(), Error> {
        if data <= 0xffff_ffff {
            self.u32(tag_type, data as u32)
        } else {
            self.put_control_tag(tag_type, ElementTypeId::U64)?;
            self.buf.le_u64(data)
        }
    }

    pub fn str8(&mut self, tag_type: TagType, data: &[u8]) -> Result<(), Error> {
        if data.len() > 0xff {
            error!("use str16() instead");
            Err(ErrorCode::Invalid)?;
        }

        self.put_control_tag(tag_type, ElementTypeId::Str8l)?;
        self.buf.le_u8(data.len() as u8)?;
        self.buf.append(data)
    }

    pub fn str16(&mut self, tag_type: TagType, data: &[u8]) -> Result<(), Error> {
        if data.len() <= 0xff {
            self.str8(tag_type, data)
        } else if data.len() <= 0xffff {
            self.put_control_tag(tag_type, ElementTypeId::Str16l)?;
            self.buf.le_u16(data.len() as u16)?;
            self.buf.append(data)
        } else {
            Err(ErrorCode::Invalid.into())
        }
    }

    pub fn utf8(&mut self, tag_type: TagType, data: &str) -> Result<(), Error> {
        if data.len() > 0xff {
            Err(ErrorCode::Invalid)?;
        }

        self.put_control_tag(tag_type, ElementTypeId::Utf8l)?;
        self.buf.le_u8(data.len() as u8)?;
        self.buf.append(data.as_bytes())
    }

    pub fn bool(&mut self, tag_type: TagType, val: bool) -> Result<(), Error> {
        if val {
            self.put_control_tag(tag_type, ElementTypeId::True)
        } else {
            self.put_control_tag(tag_type, ElementTypeId::False)
        }
    }

    pub fn null(&mut self, tag_type: TagType) -> Result<(), Error> {
        self.put_control_tag(tag_type, ElementTypeId::Null)
    }

    pub fn start_struct(&mut self, tag_type: TagType) -> Result<(), Error> {
        self.put_control_tag(tag_type, ElementTypeId::Struct)
    }

    pub fn start_array(&mut self, tag_type: TagType) -> Result<(), Error> {
        self.put_control_tag(tag_type, ElementTypeId::Array)
    }

    pub fn end_container(&mut self) -> Result<(), Error> {
        self.put_control_tag(TagType::Anonymous, ElementTypeId::EndCnt)
    }

    pub fn get_tail(&self) -> usize {
        self.buf.get_tail()
    }

    pub fn rewind_to(&mut self, anchor: usize) {
        self.buf.rewind_tail_to(anchor);
    }
}
