use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::*;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

use crate::byte_stream::BoxedStream;
use crate::dialer::NetworkInterface;
use crate::error::{Error, Result};
use crate::model::{Address, Network};
use crate::pkt_stream::{BoxedPktStream, UdpPktStream};

/// Transport used by a leaf outbound.
///
/// Protocol clients implement this; the router only sees the resulting
/// streams.
#[async_trait]
pub trait Connector: fmt::Debug + Send + Sync {
    fn networks(&self) -> &[Network] {
        &Network::ALL
    }

    /// interfaces available to `*_via` dials
    fn interfaces(&self) -> &[NetworkInterface] {
        &[]
    }

    async fn connect_byte_stream(&self, addr: &Address) -> Result<BoxedStream>;
    async fn connect_pkt_stream(&self, addr: &Address) -> Result<BoxedPktStream>;

    async fn connect_byte_stream_via(
        &self,
        _addr: &Address,
        _iface: &NetworkInterface,
    ) -> Result<BoxedStream> {
        Err(Error::not_supported("interface bound dial"))
    }

    async fn connect_pkt_stream_via(
        &self,
        _addr: &Address,
        _iface: &NetworkInterface,
    ) -> Result<BoxedPktStream> {
        Err(Error::not_supported("interface bound listen"))
    }
}

/// Connects with plain tokio sockets.
#[derive(Debug, Clone, Default)]
pub struct DirectConnector {
    connect_timeout: Option<Duration>,
    interfaces: Vec<NetworkInterface>,
}

impl DirectConnector {
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        Self {
            connect_timeout,
            interfaces: vec![],
        }
    }

    pub fn set_interfaces(&mut self, interfaces: Vec<NetworkInterface>) -> &mut Self {
        self.interfaces = interfaces;
        self
    }

    async fn with_timeout<T>(&self, fut: impl Future<Output = io::Result<T>>) -> Result<T> {
        match self.connect_timeout {
            Some(timeout) => Ok(tokio::time::timeout(timeout, fut).await??),
            None => Ok(fut.await?),
        }
    }
}

async fn resolve(addr: &Address) -> Result<SocketAddr> {
    match addr {
        Address::IpAddr(ip, port) => Ok(SocketAddr::new(*ip, *port)),
        Address::Domain(host, port) => tokio::net::lookup_host((host.as_str(), *port))
            .await
            .map_err(|err| Error::dns_lookup(host.as_str(), err))?
            .next()
            .ok_or_else(|| Error::dns_lookup(host.as_str(), "no address")),
    }
}

fn unspecified_for(target: &Address) -> SocketAddr {
    let ip = if target.is_ipv6() {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    SocketAddr::new(ip, 0)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_to_interface(socket: &Socket, iface: &NetworkInterface, _target: SocketAddr) -> io::Result<()> {
    socket.bind_device(Some(iface.name.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_to_interface(socket: &Socket, iface: &NetworkInterface, target: SocketAddr) -> io::Result<()> {
    let local = iface
        .addresses
        .iter()
        .map(|net| net.addr())
        .find(|ip| ip.is_ipv4() == target.is_ipv4())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no usable address on {}", iface.name),
            )
        })?;
    socket.bind(&SocketAddr::new(local, 0).into())
}

#[async_trait]
impl Connector for DirectConnector {
    fn interfaces(&self) -> &[NetworkInterface] {
        &self.interfaces
    }

    async fn connect_byte_stream(&self, addr: &Address) -> Result<BoxedStream> {
        let strm = match addr {
            Address::IpAddr(ip, port) => self.with_timeout(TcpStream::connect((*ip, *port))).await,
            Address::Domain(host, port) => {
                self.with_timeout(TcpStream::connect((host.as_str(), *port)))
                    .await
            }
        }?;
        strm.set_nodelay(true)?;
        debug!("connected: {} ({:?})", addr, strm.peer_addr().ok());
        Ok(Box::new(strm))
    }

    async fn connect_pkt_stream(&self, addr: &Address) -> Result<BoxedPktStream> {
        let pkt = UdpPktStream::bind(unspecified_for(addr)).await?;
        Ok(Arc::new(pkt))
    }

    async fn connect_byte_stream_via(
        &self,
        addr: &Address,
        iface: &NetworkInterface,
    ) -> Result<BoxedStream> {
        let target = resolve(addr).await?;
        let socket = Socket::new(Domain::for_address(target), Type::STREAM, Some(Protocol::TCP))?;
        bind_to_interface(&socket, iface, target)?;
        socket.set_nonblocking(true)?;
        let socket = TcpSocket::from_std_stream(socket.into());
        let strm = self.with_timeout(socket.connect(target)).await?;
        debug!("connected via {}: {}", iface.name, target);
        Ok(Box::new(strm))
    }

    async fn connect_pkt_stream_via(
        &self,
        addr: &Address,
        iface: &NetworkInterface,
    ) -> Result<BoxedPktStream> {
        let target = resolve(addr).await?;
        let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))?;
        bind_to_interface(&socket, iface, target)?;
        // elsewhere bind_to_interface already bound the interface address
        if cfg!(any(target_os = "linux", target_os = "android")) {
            socket.bind(&unspecified_for(&target.into()).into())?;
        }
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        Ok(Arc::new(UdpPktStream::new(socket)))
    }
}

/// Refuses every dial.
#[derive(Debug, Clone, Default)]
pub struct BlockConnector;

fn blocked() -> Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "blocked").into()
}

#[async_trait]
impl Connector for BlockConnector {
    async fn connect_byte_stream(&self, addr: &Address) -> Result<BoxedStream> {
        debug!("blocked connection to {}", addr);
        Err(blocked())
    }

    async fn connect_pkt_stream(&self, addr: &Address) -> Result<BoxedPktStream> {
        debug!("blocked packet connection to {}", addr);
        Err(blocked())
    }
}
