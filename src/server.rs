use std::collections::HashMap;
use std::sync::Arc;

use log::*;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::acceptor::{spawn_acceptor, Binder, TcpBinder};
use crate::config::{Config, InboundConfig};
use crate::error::Result;
use crate::metadata::Metadata;
use crate::model::Network;
use crate::router::Router;
use crate::server_command::ServerCommand;
use crate::session::{CloseHandler, ConnectionId};

pub const INBOUND_TYPE: &str = "forward";

pub struct Server<B: Binder> {
    inbounds: Vec<Arc<InboundConfig>>,
    router: Arc<Router>,
    /// bind inbound addresses
    binder: B,
    tx_cmd: UnboundedSender<ServerCommand<B::Stream>>,
    rx_cmd: UnboundedReceiver<ServerCommand<B::Stream>>,
    /// parent of every acceptor and flow context
    cancel: CancellationToken,
    connections: HashMap<ConnectionId, JoinHandle<()>>,
}

impl Server<TcpBinder> {
    pub fn new(config: Config) -> Result<(Self, UnboundedSender<ServerCommand<TcpStream>>)> {
        let router = Router::new(&config)?;
        Ok(Server::with_binder(&config.inbounds, Arc::new(router), TcpBinder))
    }
}

impl<B: Binder> Server<B> {
    pub fn with_binder(
        inbounds: &[InboundConfig],
        router: Arc<Router>,
        binder: B,
    ) -> (Self, UnboundedSender<ServerCommand<B::Stream>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                inbounds: inbounds.iter().cloned().map(Arc::new).collect(),
                router,
                binder,
                tx_cmd: tx.clone(),
                rx_cmd: rx,
                cancel: CancellationToken::new(),
                connections: HashMap::new(),
            },
            tx,
        )
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub async fn serve(&mut self) -> Result<()> {
        self.router.start().await?;
        let mut acceptors = vec![];
        for inbound in &self.inbounds {
            let acceptor = self.binder.bind(inbound.listen)?;
            info!("inbound/{}[{}]: listening on {}", INBOUND_TYPE, inbound.tag, inbound.listen);
            acceptors.push(spawn_acceptor(
                acceptor,
                inbound.clone(),
                self.tx_cmd.clone(),
                self.cancel.child_token(),
            ));
        }

        while let Some(cmd) = self.rx_cmd.recv().await {
            use ServerCommand::*;
            debug!("cmd: {:?}", cmd);
            match cmd {
                Terminate => {
                    trace!("stopping acceptors...");
                    self.cancel.cancel();
                    for acceptor in acceptors.drain(..) {
                        acceptor.await.ok();
                    }
                    trace!("closing connections...");
                    self.router.close();
                    for (_, handle) in self.connections.drain() {
                        handle.abort();
                        handle.await.ok();
                    }
                    trace!("connections are closed");
                    break;
                }
                Connect(strm, addr, inbound) => {
                    let id = self.router.connections().next_id();
                    let mut metadata = Metadata::new(Network::Tcp, addr, inbound.destination.clone());
                    metadata.set_inbound(inbound.tag.as_str(), INBOUND_TYPE);
                    let tx = self.tx_cmd.clone();
                    let on_close = CloseHandler::new(id, move |_| {
                        tx.send(Disconnect(id)).ok();
                    });
                    let router = self.router.clone();
                    let ctx = self.cancel.child_token();
                    let handle = tokio::spawn(async move {
                        router
                            .route_connection(Some(ctx), Box::new(strm), metadata, on_close)
                            .await;
                    });
                    self.connections.insert(id, handle);
                }
                Disconnect(id) => {
                    if self.connections.remove(&id).is_some() {
                        debug!("connection is closed: {}", id);
                    } else {
                        trace!("connection not found: {}", id);
                    }
                }
            }
        }
        info!("server shutdown");
        Ok(())
    }
}
