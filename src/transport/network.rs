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

use core::fmt::{self, Debug, Display};

pub use core::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::Error;

// Maximum UDP RX packet size per Matter spec
pub const MAX_RX_BUF_SIZE: usize = 1583;

// Maximum UDP TX packet size per Matter spec
pub const MAX_TX_BUF_SIZE: usize = 1280 - 40/*IPV6 header size*/ - 8/*UDP header size*/;

/// A BLE peer, identified by its 48-bit device address
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Copy, Clone, Default)]
pub struct BtAddr(pub [u8; 6]);

impl Display for BtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Copy, Clone)]
pub enum Address {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    Btp(BtAddr),
}

impl Address {
    pub const fn new() -> Self {
        Self::Udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// TCP and BTP deliver in order and retransmit on their own, so MRP is off for them
    pub fn is_reliable(&self) -> bool {
        matches!(self, Self::Tcp(_) | Self::Btp(_))
    }

    pub fn udp(&self) -> Option<SocketAddr> {
        match self {
            Self::Udp(addr) => Some(*addr),
            _ => None,
        }
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Udp(addr) => write!(f, "UDP {}", addr),
            Address::Tcp(addr) => write!(f, "TCP {}", addr),
            Address::Btp(addr) => write!(f, "BTP {}", addr),
        }
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

/// The sending half of a transport adapter.
///
/// Framing (TCP length prefixes, BTP segmentation) is the adapter's business;
/// the transport manager hands over complete Matter messages only.
pub trait NetworkSend {
    fn send_to(&mut self, data: &[u8], addr: Address) -> Result<(), Error>;
}

impl<T> NetworkSend for &mut T
where
    T: NetworkSend,
{
    fn send_to(&mut self, data: &[u8], addr: Address) -> Result<(), Error> {
        (*self).send_to(data, addr)
    }
}

/// The receiving half of a transport adapter.
///
/// `recv_from` never blocks: `Ok(None)` means nothing is pending.
pub trait NetworkReceive {
    fn recv_from(&mut self, buffer: &mut [u8]) -> Result<Option<(usize, Address)>, Error>;
}

impl<T> NetworkReceive for &mut T
where
    T: NetworkReceive,
{
    fn recv_from(&mut self, buffer: &mut [u8]) -> Result<Option<(usize, Address)>, Error> {
        (*self).recv_from(buffer)
    }
}

/// A transport which silently discards everything sent and never receives
#[derive(Debug, Default, Clone, Copy)]
pub struct NoNetwork;

impl NetworkSend for NoNetwork {
    fn send_to(&mut self, _data: &[u8], _addr: Address) -> Result<(), Error> {
        Ok(())
    }
}

impl NetworkReceive for NoNetwork {
    fn recv_from(&mut self, _buffer: &mut [u8]) -> Result<Option<(usize, Address)>, Error> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reliability_by_transport() {
        let sock = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5540);

        assert!(!Address::Udp(sock).is_reliable());
        assert!(Address::Tcp(sock).is_reliable());
        assert!(Address::Btp(BtAddr([1, 2, 3, 4, 5, 6])).is_reliable());
    }

    #[test]
    fn display() {
        let sock = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5540);
        assert_eq!(format!("{}", Address::Udp(sock)), "UDP 127.0.0.1:5540");
        assert_eq!(
            format!("{}", Address::Btp(BtAddr([0xaa, 0, 0, 0, 0, 0x01]))),
            "BTP AA:00:00:00:00:01"
        );
    }
}
