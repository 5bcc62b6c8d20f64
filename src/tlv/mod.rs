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

//! The subset of the Matter TLV encoding used by the secure channel payloads.
//!
//! Only anonymous and context-specific tags are supported, which is all the
//! PASE and CASE messages ever use.

mod parser;
mod writer;

pub use parser::*;
pub use writer::*;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum TagType {
    Anonymous,
    Context(u8),
}

pub const TAG_SHIFT_BITS: u8 = 5;
pub const TAG_MASK: u8 = 0xe0;
pub const TYPE_MASK: u8 = 0x1f;

// Tag control values
const TAG_CTL_ANONYMOUS: u8 = 0;
const TAG_CTL_CONTEXT: u8 = 1;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
enum ElementTypeId {
    S8 = 0,
    S16 = 1,
    S32 = 2,
    S64 = 3,
    U8 = 4,
    U16 = 5,
    U32 = 6,
    U64 = 7,
    False = 8,
    True = 9,
    Utf8l = 12,
    Utf16l = 13,
    Str8l = 16,
    Str16l = 17,
    Null = 20,
    Struct = 21,
    Array = 22,
    List = 23,
    EndCnt = 24,
}

impl ElementTypeId {
    fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::S8,
            1 => Self::S16,
            2 => Self::S32,
            3 => Self::S64,
            4 => Self::U8,
            5 => Self::U16,
            6 => Self::U32,
            7 => Self::U64,
            8 => Self::False,
            9 => Self::True,
            12 => Self::Utf8l,
            13 => Self::Utf16l,
            16 => Self::Str8l,
            17 => Self::Str16l,
            20 => Self::Null,
            21 => Self::Struct,
            22 => Self::Array,
            23 => Self::List,
            24 => Self::EndCnt,
            _ => return None,
        })
    }
}
