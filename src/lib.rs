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

//! Native Rust implementation of the Matter secure session and transport layer
//!
//! This crate turns an unreliable datagram (or a reliable stream) transport into an
//! authenticated, encrypted, replay-protected and retried message channel between two
//! Matter nodes, and multiplexes that channel into request/response exchanges.
//!
//! The building blocks, leaf-first:
//! - [`transport::plain_hdr`] / [`transport::proto_hdr`]: the wire header codecs
//! - [`transport::session_crypto`]: per-session AES-CCM keys and nonces
//! - [`transport::dedup`] / [`transport::msg_ctr`]: replay window and outgoing counters
//! - [`transport::session`]: the session table
//! - [`secure_channel`]: the PASE and CASE handshakes
//! - [`transport::mrp`]: acknowledgements and retransmissions
//! - [`transport::exchange`]: exchanges and their delegates
//! - [`transport::network`]: the transport adapter boundary
//!
//! Everything is driven by a single [`TransportMgr`] instance, which is expected to be
//! owned by one event loop. The loop feeds it received datagrams
//! ([`TransportMgr::handle_rx`]) and timer ticks ([`TransportMgr::poll_timers`]).
//!
//! # Examples
//! ```
//! use rs_matter_session::persist::MemKvStore;
//! use rs_matter_session::transport::core::{TransportConfig, TransportMgr};
//! use rs_matter_session::transport::network::NoNetwork;
//! use rs_matter_session::utils::{epoch::dummy_epoch, rand::sys_rand};
//!
//! let mgr = TransportMgr::new(
//!     TransportConfig::default(),
//!     dummy_epoch,
//!     sys_rand,
//!     Box::new(NoNetwork),
//!     Box::new(MemKvStore::new()),
//! )
//! .unwrap();
//!
//! assert!(mgr.next_deadline().is_none());
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod crypto;
pub mod error;
pub mod persist;
pub mod secure_channel;
pub mod tlv;
pub mod transport;
pub mod utils;

pub use crate::transport::core::{TransportConfig, TransportMgr};

/// The default Matter UDP port
pub const MATTER_PORT: u16 = 5540;
