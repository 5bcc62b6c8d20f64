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

#![cfg(all(feature = "std", feature = "async-io"))]

//! A UDP transport adapter on top of async-io.
//!
//! The socket is registered with the async-io reactor, so waiting for a
//! datagram and waiting for the next timer of the [`TransportMgr`] is a single
//! `block_on` over whichever completes first.

use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::rc::Rc;
use std::time::Duration;

use async_io::{Async, Timer};
use futures_lite::future;

use log::{debug, info};

use crate::error::{Error, ErrorCode};

use super::core::TransportMgr;
use super::network::{Address, NetworkReceive, NetworkSend};

/// A bound UDP socket. Receiving never blocks.
pub struct UdpTransport {
    socket: Rc<Async<UdpSocket>>,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Error> {
        let socket = Async::new(UdpSocket::bind(addr)?)?;

        info!("Listening on UDP {}", socket.get_ref().local_addr()?);

        Ok(Self {
            socket: Rc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.get_ref().local_addr()?)
    }

    /// A handle sending through the same socket, to be given to a [`TransportMgr`]
    pub fn sender(&self) -> UdpSender {
        UdpSender {
            socket: self.socket.clone(),
        }
    }

    /// Wait until the socket is readable or `timeout` passes
    pub async fn wait_available(&self, timeout: Duration) -> Result<(), Error> {
        future::or(
            async {
                self.socket.readable().await?;
                Ok::<_, Error>(())
            },
            async {
                Timer::after(timeout).await;
                Ok::<_, Error>(())
            },
        )
        .await
    }

    /// Wait for a datagram or the next timer of `mgr`, whichever comes first,
    /// then process everything that is due.
    ///
    /// `idle` bounds the wait when no timer is armed.
    pub fn run_once(
        &mut self,
        mgr: &mut TransportMgr,
        now: Duration,
        idle: Duration,
    ) -> Result<usize, Error> {
        let wait = mgr
            .next_deadline()
            .map(|deadline| deadline.saturating_sub(now).min(idle))
            .unwrap_or(idle);

        if !wait.is_zero() {
            future::block_on(self.wait_available(wait))?;
        }

        let count = mgr.process_rx(self)?;
        mgr.poll_timers();

        Ok(count)
    }
}

impl NetworkReceive for UdpTransport {
    fn recv_from(&mut self, buffer: &mut [u8]) -> Result<Option<(usize, Address)>, Error> {
        match self.socket.get_ref().recv_from(buffer) {
            Ok((len, addr)) => {
                debug!("Received {} bytes from {}", len, addr);
                Ok(Some((len, Address::Udp(addr))))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

pub struct UdpSender {
    socket: Rc<Async<UdpSocket>>,
}

impl NetworkSend for UdpSender {
    fn send_to(&mut self, data: &[u8], addr: Address) -> Result<(), Error> {
        let addr = addr.udp().ok_or(ErrorCode::InvalidData)?;

        match self.socket.get_ref().send_to(data, addr) {
            Ok(_) => Ok(()),
            // The socket buffer is full; MRP takes care of reliable messages
            Err(e) if e.kind() == ErrorKind::WouldBlock => Err(ErrorCode::TransportFailure.into()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    use crate::persist::MemKvStore;
    use crate::transport::core::TransportConfig;
    use crate::utils::{epoch::sys_epoch, rand::sys_rand};

    #[test]
    fn loopback() {
        let mut a = UdpTransport::bind("127.0.0.1:0").unwrap();
        let b = UdpTransport::bind("127.0.0.1:0").unwrap();

        let mut buf = [0; 16];
        assert!(a.recv_from(&mut buf).unwrap().is_none());

        b.sender()
            .send_to(b"ping", Address::Udp(a.local_addr().unwrap()))
            .unwrap();

        future::block_on(a.wait_available(Duration::from_secs(5))).unwrap();

        let (len, from) = a.recv_from(&mut buf).unwrap().unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, Address::Udp(b.local_addr().unwrap()));
    }

    #[test]
    fn run_once_wakes_up_on_traffic() {
        let mut a = UdpTransport::bind("127.0.0.1:0").unwrap();
        let b = UdpTransport::bind("127.0.0.1:0").unwrap();

        let mut mgr = TransportMgr::new(
            TransportConfig::default(),
            sys_epoch,
            sys_rand,
            Box::new(a.sender()),
            Box::new(MemKvStore::new()),
        )
        .unwrap();

        // Nothing to do: returns once the idle time is over
        let start = Instant::now();
        let idle = Duration::from_millis(50);
        assert_eq!(a.run_once(&mut mgr, sys_epoch(), idle).unwrap(), 0);
        assert!(start.elapsed() >= idle);

        b.sender()
            .send_to(b"not a matter message", Address::Udp(a.local_addr().unwrap()))
            .unwrap();

        let count = a
            .run_once(&mut mgr, sys_epoch(), Duration::from_secs(5))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(mgr.stats().rx_dropped, 1);
    }

    #[test]
    fn only_udp_peers() {
        let a = UdpTransport::bind("127.0.0.1:0").unwrap();
        let tcp = Address::Tcp(a.local_addr().unwrap());

        assert_eq!(
            a.sender().send_to(b"ping", tcp).map_err(|e| e.code()),
            Err(ErrorCode::InvalidData)
        );
    }
}
