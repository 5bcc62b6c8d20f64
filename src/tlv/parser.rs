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

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, ErrorCode};

use super::{ElementTypeId, TagType, TAG_CTL_ANONYMOUS, TAG_CTL_CONTEXT, TAG_SHIFT_BITS, TYPE_MASK};

// Secure channel payloads never nest deeper than this
const MAX_DEPTH: usize = 8;

#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ElementType<'a> {
    S8(i8),
    S16(i16),
    S32(i32),
    S64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    False,
    True,
    Utf8l(&'a [u8]),
    Utf16l(&'a [u8]),
    Str8l(&'a [u8]),
    Str16l(&'a [u8]),
    Null,
    /// The encoded members, without the end-of-container marker
    Struct(&'a [u8]),
    Array(&'a [u8]),
    List(&'a [u8]),
    EndCnt,
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TLVElement<'a> {
    tag_type: TagType,
    element_type: ElementType<'a>,
}

fn take(buf: &[u8], off: usize, len: usize) -> Result<&[u8], Error> {
    buf.get(off..off + len)
        .ok_or_else(|| ErrorCode::InvalidData.into())
}

/// Parse a single element at the start of `buf`, returning it with its encoded length.
fn parse_element(buf: &[u8], depth: usize) -> Result<(TLVElement<'_>, usize), Error> {
    let control = *buf.first().ok_or(ErrorCode::InvalidData)?;
    let mut off = 1;

    let tag_type = match control >> TAG_SHIFT_BITS {
        TAG_CTL_ANONYMOUS => TagType::Anonymous,
        TAG_CTL_CONTEXT => {
            off += 1;
            TagType::Context(take(buf, 1, 1)?[0])
        }
        _ => Err(ErrorCode::InvalidData)?,
    };

    let type_id = ElementTypeId::from_u8(control & TYPE_MASK).ok_or(ErrorCode::InvalidData)?;

    let (element_type, len) = match type_id {
        ElementTypeId::S8 => (ElementType::S8(take(buf, off, 1)?[0] as i8), 1),
        ElementTypeId::S16 => (
            ElementType::S16(LittleEndian::read_i16(take(buf, off, 2)?)),
            2,
        ),
        ElementTypeId::S32 => (
            ElementType::S32(LittleEndian::read_i32(take(buf, off, 4)?)),
            4,
        ),
        ElementTypeId::S64 => (
            ElementType::S64(LittleEndian::read_i64(take(buf, off, 8)?)),
            8,
        ),
        ElementTypeId::U8 => (ElementType::U8(take(buf, off, 1)?[0]), 1),
        ElementTypeId::U16 => (
            ElementType::U16(LittleEndian::read_u16(take(buf, off, 2)?)),
            2,
        ),
        ElementTypeId::U32 => (
            ElementType::U32(LittleEndian::read_u32(take(buf, off, 4)?)),
            4,
        ),
        ElementTypeId::U64 => (
            ElementType::U64(LittleEndian::read_u64(take(buf, off, 8)?)),
            8,
        ),
        ElementTypeId::False => (ElementType::False, 0),
        ElementTypeId::True => (ElementType::True, 0),
        ElementTypeId::Null => (ElementType::Null, 0),
        ElementTypeId::EndCnt => (ElementType::EndCnt, 0),
        ElementTypeId::Utf8l | ElementTypeId::Str8l => {
            let len = take(buf, off, 1)?[0] as usize;
            let data = take(buf, off + 1, len)?;
            let value = if type_id == ElementTypeId::Utf8l {
                ElementType::Utf8l(data)
            } else {
                ElementType::Str8l(data)
            };

            (value, 1 + len)
        }
        ElementTypeId::Utf16l | ElementTypeId::Str16l => {
            let len = LittleEndian::read_u16(take(buf, off, 2)?) as usize;
            let data = take(buf, off + 2, len)?;
            let value = if type_id == ElementTypeId::Utf16l {
                ElementType::Utf16l(data)
            } else {
                ElementType::Str16l(data)
            };

            (value, 2 + len)
        }
        ElementTypeId::Struct | ElementTypeId::Array | ElementTypeId::List => {
            if depth >= MAX_DEPTH {
                Err(ErrorCode::InvalidData)?;
            }

            let members_len = container_len(&buf[off..], depth + 1)?;
            let members = &buf[off..off + members_len];
            let value = match type_id {
                ElementTypeId::Struct => ElementType::Struct(members),
                ElementTypeId::Array => ElementType::Array(members),
                _ => ElementType::List(members),
            };

            // Skip the end-of-container marker as well
            (value, members_len + 1)
        }
    };

    Ok((
        TLVElement {
            tag_type,
            element_type,
        },
        off + len,
    ))
}

/// The length of the container members starting at `buf`, up to the matching end marker
fn container_len(buf: &[u8], depth: usize) -> Result<usize, Error> {
    let mut off = 0;

    loop {
        let (element, len) = parse_element(&buf[off..], depth)?;
        if element.element_type == ElementType::EndCnt {
            return Ok(off);
        }

        off += len;
    }
}

impl<'a> TLVElement<'a> {
    pub fn new(tag: TagType, value: ElementType<'a>) -> Self {
        Self {
            tag_type: tag,
            element_type: value,
        }
    }

    pub fn enter(&self) -> Option<TLVContainerIterator<'a>> {
        match self.element_type {
            ElementType::Struct(buf) | ElementType::Array(buf) | ElementType::List(buf) => {
                Some(TLVContainerIterator { buf, current: 0 })
            }
            _ => None,
        }
    }

    pub fn u8(&self) -> Result<u8, Error> {
        match self.element_type {
            ElementType::U8(a) => Ok(a),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn u16(&self) -> Result<u16, Error> {
        match self.element_type {
            ElementType::U8(a) => Ok(a.into()),
            ElementType::U16(a) => Ok(a),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn u32(&self) -> Result<u32, Error> {
        match self.element_type {
            ElementType::U8(a) => Ok(a.into()),
            ElementType::U16(a) => Ok(a.into()),
            ElementType::U32(a) => Ok(a),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn u64(&self) -> Result<u64, Error> {
        match self.element_type {
            ElementType::U8(a) => Ok(a.into()),
            ElementType::U16(a) => Ok(a.into()),
            ElementType::U32(a) => Ok(a.into()),
            ElementType::U64(a) => Ok(a),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn i64(&self) -> Result<i64, Error> {
        match self.element_type {
            ElementType::S8(a) => Ok(a.into()),
            ElementType::S16(a) => Ok(a.into()),
            ElementType::S32(a) => Ok(a.into()),
            ElementType::S64(a) => Ok(a),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn slice(&self) -> Result<&'a [u8], Error> {
        match self.element_type {
            ElementType::Str8l(s)
            | ElementType::Utf8l(s)
            | ElementType::Str16l(s)
            | ElementType::Utf16l(s) => Ok(s),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn bool(&self) -> Result<bool, Error> {
        match self.element_type {
            ElementType::False => Ok(false),
            ElementType::True => Ok(true),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn null(&self) -> Result<(), Error> {
        match self.element_type {
            ElementType::Null => Ok(()),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn confirm_struct(&self) -> Result<TLVElement<'a>, Error> {
        match self.element_type {
            ElementType::Struct(_) => Ok(*self),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn confirm_array(&self) -> Result<TLVElement<'a>, Error> {
        match self.element_type {
            ElementType::Array(_) => Ok(*self),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    /// Find the member with context tag `tag` in this struct
    pub fn find_tag(&self, tag: u8) -> Result<TLVElement<'a>, Error> {
        let match_tag = TagType::Context(tag);

        let iter = self.enter().ok_or(ErrorCode::TLVTypeMismatch)?;
        for a in iter {
            if match_tag == a.tag_type {
                return Ok(a);
            }
        }

        Err(ErrorCode::TLVNotFound.into())
    }

    /// Same as `find_tag`, but a missing member is not an error
    pub fn opt_find_tag(&self, tag: u8) -> Result<Option<TLVElement<'a>>, Error> {
        match self.find_tag(tag) {
            Ok(e) => Ok(Some(e)),
            Err(e) if e.code() == ErrorCode::TLVNotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn get_tag(&self) -> TagType {
        self.tag_type
    }

    pub fn check_ctx_tag(&self, tag: u8) -> bool {
        self.tag_type == TagType::Context(tag)
    }

    pub fn get_element_type(&self) -> ElementType<'a> {
        self.element_type
    }
}

pub struct TLVContainerIterator<'a> {
    buf: &'a [u8],
    current: usize,
}

impl<'a> Iterator for TLVContainerIterator<'a> {
    type Item = TLVElement<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current >= self.buf.len() {
            return None;
        }

        // The members were validated when the container was parsed
        let buf: &'a [u8] = self.buf;
        let (element, len) = parse_element(&buf[self.current..], 1).ok()?;
        self.current += len;

        Some(element)
    }
}

pub fn get_root_node(b: &[u8]) -> Result<TLVElement<'_>, Error> {
    parse_element(b, 0).map(|(element, _)| element)
}

pub fn get_root_node_struct(b: &[u8]) -> Result<TLVElement<'_>, Error> {
    get_root_node(b)?.confirm_struct()
}
