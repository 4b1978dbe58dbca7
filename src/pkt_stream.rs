use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use log::*;
use parking_lot::Mutex;
use tokio::net::UdpSocket;

use crate::model::Address;

/// datagram operations addressed per packet
#[async_trait]
pub trait PktStream: fmt::Debug + Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Address)>;
    async fn send_to(&self, buf: &[u8], addr: &Address) -> io::Result<usize>;
}

pub type BoxedPktStream = Arc<dyn PktStream>;

#[derive(Debug)]
pub struct UdpPktStream {
    socket: UdpSocket,
}

impl UdpPktStream {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }

    pub async fn bind(local: SocketAddr) -> io::Result<Self> {
        Ok(Self::new(UdpSocket::bind(local).await?))
    }
}

#[async_trait]
impl PktStream for UdpPktStream {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Address)> {
        let (size, peer) = self.socket.recv_from(buf).await?;
        Ok((size, peer.into()))
    }

    async fn send_to(&self, buf: &[u8], addr: &Address) -> io::Result<usize> {
        match addr {
            Address::IpAddr(ip, port) => self.socket.send_to(buf, (*ip, *port)).await,
            Address::Domain(host, port) => self.socket.send_to(buf, (host.as_str(), *port)).await,
        }
    }
}

/// Replays packets read during sniffing before reading from `inner`.
#[derive(Debug)]
pub struct CachedPktStream {
    cache: Mutex<VecDeque<(Bytes, Address)>>,
    inner: BoxedPktStream,
}

impl CachedPktStream {
    pub fn wrap(inner: BoxedPktStream, cache: Vec<(Bytes, Address)>) -> BoxedPktStream {
        if cache.is_empty() {
            inner
        } else {
            Arc::new(Self {
                cache: Mutex::new(cache.into()),
                inner,
            })
        }
    }
}

#[async_trait]
impl PktStream for CachedPktStream {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Address)> {
        let cached = self.cache.lock().pop_front();
        if let Some((data, addr)) = cached {
            let size = data.len().min(buf.len());
            buf[..size].copy_from_slice(&data[..size]);
            return Ok((size, addr));
        }
        self.inner.recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], addr: &Address) -> io::Result<usize> {
        self.inner.send_to(buf, addr).await
    }
}

/// Address translation between the literal peer (`origin`) and the address
/// the other side of the flow knows it by (`destination`).
///
/// Writes to `destination` go to `origin`. Unless unidirectional, packets read
/// from `origin` are reported as coming from `destination`.
#[derive(Debug)]
pub struct NatPktStream {
    inner: BoxedPktStream,
    origin: Address,
    destination: Address,
    unidirectional: bool,
}

impl NatPktStream {
    pub fn new(inner: BoxedPktStream, origin: Address, destination: Address) -> Self {
        Self {
            inner,
            origin,
            destination,
            unidirectional: false,
        }
    }

    pub fn unidirectional(inner: BoxedPktStream, origin: Address, destination: Address) -> Self {
        Self {
            unidirectional: true,
            ..Self::new(inner, origin, destination)
        }
    }
}

#[async_trait]
impl PktStream for NatPktStream {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Address)> {
        let (size, addr) = self.inner.recv_from(buf).await?;
        if !self.unidirectional && addr == self.origin {
            trace!("nat: {} => {}", addr, self.destination);
            return Ok((size, self.destination.clone()));
        }
        Ok((size, addr))
    }

    async fn send_to(&self, buf: &[u8], addr: &Address) -> io::Result<usize> {
        if addr == &self.destination {
            return self.inner.send_to(buf, &self.origin).await;
        }
        self.inner.send_to(buf, addr).await
    }
}
