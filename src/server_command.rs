//! Server control command
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::InboundConfig;
use crate::session::ConnectionId;

pub enum ServerCommand<T> {
    /// terminate
    Terminate,
    /// accepted stream, client address and the inbound that accepted it
    Connect(T, SocketAddr, Arc<InboundConfig>),
    Disconnect(ConnectionId),
}

impl<T> fmt::Debug for ServerCommand<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ServerCommand::*;
        match self {
            Terminate => write!(f, "Terminate"),
            Connect(_, addr, inbound) => write!(f, "Connect(_, {}, {})", addr, inbound.tag),
            Disconnect(id) => write!(f, "Disconnect({})", id),
        }
    }
}
