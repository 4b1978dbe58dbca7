use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::*;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::byte_stream::ByteStream;
use crate::config::InboundConfig;
use crate::error::Result;
use crate::server_command::ServerCommand;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Source of accepted streams.
#[async_trait]
pub trait Acceptor: Send + 'static {
    type Stream: ByteStream + 'static;
    async fn accept(&mut self) -> io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    type Stream = TcpStream;
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        let (tcp, addr) = TcpListener::accept(self).await?;
        tcp.set_nodelay(true)?;
        Ok((tcp, addr))
    }
}

pub trait Binder {
    type Stream: ByteStream + 'static;
    type Acceptor: Acceptor<Stream = Self::Stream>;
    fn bind(&self, addr: SocketAddr) -> Result<Self::Acceptor>;
}

#[derive(Debug, Clone, Default)]
pub struct TcpBinder;

impl Binder for TcpBinder {
    type Stream = TcpStream;
    type Acceptor = TcpListener;
    fn bind(&self, addr: SocketAddr) -> Result<TcpListener> {
        let tcp = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        tcp.set_reuse_address(true)?;
        tcp.set_nonblocking(true)?;
        tcp.bind(&addr.into())?;

        // passed to listen(2) as is
        tcp.listen(256)?;
        Ok(TcpListener::from_std(tcp.into())?)
    }
}

/// Spawns a task sending every accepted stream to `tx` until `cancel` fires.
pub fn spawn_acceptor<A: Acceptor>(
    mut acceptor: A,
    inbound: Arc<InboundConfig>,
    tx: UnboundedSender<ServerCommand<A::Stream>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    use ServerCommand::*;
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = acceptor.accept() => accepted,
            };
            match accepted {
                Ok((strm, addr)) => {
                    if tx.send(Connect(strm, addr, inbound.clone())).is_err() {
                        info!("disconnected ServerCommand chan");
                        break;
                    }
                }
                Err(err) => {
                    error!("inbound/forward[{}]: accept error: {}", inbound.tag, err);
                    trace!("accept error: {:?}", err);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            }
        }
        debug!("inbound/forward[{}]: acceptor stopped", inbound.tag);
    })
}
