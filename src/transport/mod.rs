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

//! The secure session and transport layer.
//!
//! Everything in here is driven by [`core::TransportMgr`].

pub mod core;
pub mod dedup;
pub mod exchange;
pub mod mrp;
pub mod msg_ctr;
pub mod network;
pub mod packet;
pub mod plain_hdr;
pub mod proto_hdr;
pub mod session;
pub mod session_crypto;
pub mod timer;
#[cfg(all(feature = "std", feature = "async-io"))]
pub mod udp;
