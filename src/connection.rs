//! Dispatches routed flows: dial the outbound, then wire the copy engine.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::*;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use crate::byte_stream::BoxedStream;
use crate::error::Error;
use crate::metadata::Metadata;
use crate::model::{Address, Network};
use crate::monitor::ConnectionMonitor;
use crate::outbound::Outbound;
use crate::pkt_stream::{BoxedPktStream, NatPktStream};
use crate::relay::{self, RelayHandle, Traffic};
use crate::session::{CloseHandler, ConnectionId};
use crate::sniff::{PROTOCOL_DNS, PROTOCOL_QUIC};

pub const DNS_UDP_TIMEOUT: Duration = Duration::from_secs(10);
pub const QUIC_UDP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// An active flow as listed by [`ConnectionManager::connections`].
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub network: Network,
    pub inbound: String,
    pub outbound: String,
    pub destination: Address,
    pub created_at: SystemTime,
    pub upload: u64,
    pub download: u64,
}

#[derive(Debug)]
struct Tracked {
    network: Network,
    inbound: String,
    outbound: String,
    destination: Address,
    created_at: SystemTime,
    traffic: Arc<Traffic>,
}

type ConnectionList = Arc<RwLock<BTreeMap<ConnectionId, Tracked>>>;

#[derive(Debug)]
pub struct ConnectionManager {
    monitor: ConnectionMonitor,
    connections: ConnectionList,
    next_id: AtomicU64,
}

impl ConnectionManager {
    pub fn new(monitor: ConnectionMonitor) -> Self {
        Self {
            monitor,
            connections: Arc::new(RwLock::new(BTreeMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Snapshot of the active flows, oldest first.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .read()
            .iter()
            .map(|(id, tracked)| ConnectionInfo {
                id: *id,
                network: tracked.network,
                inbound: tracked.inbound.clone(),
                outbound: tracked.outbound.clone(),
                destination: tracked.destination.clone(),
                created_at: tracked.created_at,
                upload: tracked.traffic.upload(),
                download: tracked.traffic.download(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dials `outbound` and relays `inbound` through it. Every outcome,
    /// including dial failure, is reported through `on_close`.
    ///
    /// With `ctx`, the flow is registered with the monitor and closed once
    /// `ctx` is cancelled.
    pub async fn new_connection(
        &self,
        ctx: Option<CancellationToken>,
        mut inbound: BoxedStream,
        metadata: Metadata,
        outbound: Arc<Outbound>,
        on_close: CloseHandler,
    ) -> Option<RelayHandle> {
        let remote = match outbound.dial(&metadata).await {
            Ok(remote) => remote,
            Err(err) => {
                close_untracked(on_close, dial_error(&metadata, &outbound, err));
                return None;
            }
        };
        if let Err(err) = inbound.handshake_success() {
            close_untracked(on_close, err.into());
            return None;
        }
        info!(
            "[{}] {} => {} using outbound/{}[{}]",
            on_close.id(),
            metadata.source,
            metadata.destination,
            outbound.kind(),
            outbound.tag()
        );
        let (traffic, cancel, handler) = self.track(ctx, &metadata, &outbound, on_close);
        Some(relay::spawn_relay(inbound, remote, traffic, handler, cancel))
    }

    /// Datagram counterpart of [`ConnectionManager::new_connection`].
    ///
    /// Replies from a resolved address are reported as coming from the
    /// destination domain, and packets for a fake-IP destination are sent
    /// to the real domain.
    pub async fn new_packet_connection(
        &self,
        ctx: Option<CancellationToken>,
        mut inbound: BoxedPktStream,
        metadata: Metadata,
        outbound: Arc<Outbound>,
        on_close: CloseHandler,
    ) -> Option<RelayHandle> {
        let mut remote = match outbound.listen_packet(&metadata).await {
            Ok(remote) => remote,
            Err(err) => {
                close_untracked(on_close, dial_error(&metadata, &outbound, err));
                return None;
            }
        };
        if let (true, Some(ip)) = (metadata.destination.is_domain(), metadata.destination_addresses.first()) {
            let resolved = Address::IpAddr(*ip, metadata.destination.port());
            remote = if metadata.udp_disable_domain_unmapping {
                Arc::new(NatPktStream::unidirectional(remote, resolved, metadata.destination.clone()))
            } else {
                Arc::new(NatPktStream::new(remote, resolved, metadata.destination.clone()))
            };
        }
        if let (true, Some(origin)) = (metadata.fake_ip, &metadata.origin_destination) {
            inbound = Arc::new(NatPktStream::new(inbound, origin.clone(), metadata.destination.clone()));
        }
        let idle_timeout = udp_timeout(&metadata);
        info!(
            "[{}] {} => {} using outbound/{}[{}], idle timeout {:?}",
            on_close.id(),
            metadata.source,
            metadata.destination,
            outbound.kind(),
            outbound.tag(),
            idle_timeout
        );
        let (traffic, cancel, handler) = self.track(ctx, &metadata, &outbound, on_close);
        Some(relay::spawn_packet_relay(
            inbound,
            remote,
            traffic,
            handler,
            cancel,
            idle_timeout,
        ))
    }

    /// Lists the flow and wraps `on_close` so closing unlists it.
    fn track(
        &self,
        ctx: Option<CancellationToken>,
        metadata: &Metadata,
        outbound: &Outbound,
        on_close: CloseHandler,
    ) -> (Arc<Traffic>, CancellationToken, CloseHandler) {
        let id = on_close.id();
        let traffic = Arc::new(Traffic::default());
        let cancel = CancellationToken::new();
        self.connections.write().insert(
            id,
            Tracked {
                network: metadata.network,
                inbound: metadata.inbound.clone(),
                outbound: outbound.tag().to_owned(),
                destination: metadata.destination.clone(),
                created_at: SystemTime::now(),
                traffic: traffic.clone(),
            },
        );
        let entry = ctx.map(|ctx| {
            let cancel = cancel.clone();
            self.monitor.add(ctx, move || cancel.cancel())
        });
        let connections = self.connections.clone();
        let handler = CloseHandler::new(id, move |err| {
            connections.write().remove(&id);
            drop(entry);
            match &err {
                None => debug!("[{}] connection closed", id),
                Some(err) => log!(close_level(err), "[{}] connection closed: {}", id, err),
            }
            on_close.close(err);
        });
        (traffic, cancel, handler)
    }
}

fn close_level(err: &Error) -> Level {
    if err.is_closed_or_canceled() {
        Level::Trace
    } else {
        Level::Error
    }
}

/// Reports a flow that failed before it was listed.
fn close_untracked(on_close: CloseHandler, err: Error) {
    log!(close_level(&err), "[{}] open connection: {}", on_close.id(), err);
    on_close.close(Some(err));
}

/// Idle timeout of a datagram flow.
pub fn udp_timeout(metadata: &Metadata) -> Duration {
    if let Some(timeout) = metadata.udp_timeout.filter(|t| !t.is_zero()) {
        return timeout;
    }
    match metadata.protocol.as_deref() {
        Some(PROTOCOL_DNS) => DNS_UDP_TIMEOUT,
        Some(PROTOCOL_QUIC) => QUIC_UDP_TIMEOUT,
        _ => DEFAULT_UDP_TIMEOUT,
    }
}

fn dial_error(metadata: &Metadata, outbound: &Outbound, err: Error) -> Error {
    let addrs = if metadata.destination_addresses.is_empty() {
        metadata.destination.to_string()
    } else {
        let port = metadata.destination.port();
        metadata
            .destination_addresses
            .iter()
            .map(|ip| Address::IpAddr(*ip, port).to_string())
            .collect::<Vec<_>>()
            .join(",")
    };
    Error::Dial {
        addrs,
        outbound: format!("{}[{}]", outbound.kind(), outbound.tag()),
        source: Box::new(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;

    use crate::byte_stream::test::PipeStream;
    use crate::connector::test::BufferConnector;
    use crate::outbound::LeafOutbound;
    use crate::pkt_stream::test::ChannelPktStream;
    use crate::pkt_stream::PktStream;

    fn handler(id: u64) -> (CloseHandler, oneshot::Receiver<Option<Error>>) {
        let (tx, rx) = oneshot::channel();
        let handler = CloseHandler::new(ConnectionId(id), move |err| {
            tx.send(err).ok();
        });
        (handler, rx)
    }

    fn outbound(connector: BufferConnector) -> (Arc<Outbound>, Arc<BufferConnector>) {
        let connector = Arc::new(connector);
        let outbound = Outbound::Leaf(LeafOutbound::new("proxy", "buffer", connector.clone()));
        (Arc::new(outbound), connector)
    }

    fn metadata(network: Network, destination: &str) -> Metadata {
        let mut metadata = Metadata::new(network, "10.0.0.2:50000".parse().unwrap(), destination.parse().unwrap());
        metadata.set_inbound("forward-in", "forward");
        metadata
    }

    #[tokio::test]
    async fn stream_flow() {
        let manager = ConnectionManager::new(ConnectionMonitor::default());
        let (outbound, connector) = outbound(BufferConnector::new(&Network::ALL));
        let (inbound, mut client) = PipeStream::pair(1024);
        let reported = inbound.handshake_reported.clone();
        let (on_close, closed) = handler(1);

        manager
            .new_connection(None, Box::new(inbound), metadata(Network::Tcp, "example.com:80"), outbound, on_close)
            .await
            .unwrap();
        assert!(reported.load(Ordering::SeqCst));
        let listed = manager.connections();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].outbound, "proxy");
        assert_eq!(listed[0].inbound, "forward-in");

        let mut server = connector.take_peer(&"example.com:80".parse().unwrap()).unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        client.shutdown().await.unwrap();
        server.shutdown().await.unwrap();
        assert!(closed.await.unwrap().is_none());
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn dial_failure() {
        let manager = ConnectionManager::new(ConnectionMonitor::default());
        let mut connector = BufferConnector::new(&Network::ALL);
        connector.refused.insert("93.184.216.34:80".parse().unwrap());
        let (outbound, _) = outbound(connector);
        let (inbound, _client) = PipeStream::pair(1024);
        let reported = inbound.handshake_reported.clone();
        let mut metadata = metadata(Network::Tcp, "example.com:80");
        metadata.destination_addresses = vec!["93.184.216.34".parse().unwrap()];
        let (on_close, closed) = handler(2);

        let relay = manager
            .new_connection(None, Box::new(inbound), metadata, outbound, on_close)
            .await;
        assert!(relay.is_none());
        let err = closed.await.unwrap().unwrap();
        assert!(
            err.to_string()
                .starts_with("open connection to 93.184.216.34:80 using outbound/buffer[proxy]: "),
            "{}",
            err
        );
        assert!(!reported.load(Ordering::SeqCst));
        assert!(manager.is_empty());
        assert_eq!(close_level(&err), Level::Error);
    }

    #[test]
    fn teardown_logged_quietly() {
        assert_eq!(close_level(&Error::Canceled), Level::Trace);
        let reset = std::io::Error::from(std::io::ErrorKind::ConnectionReset);
        assert_eq!(close_level(&reset.into()), Level::Trace);
        let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert_eq!(close_level(&refused.into()), Level::Error);
    }

    #[tokio::test]
    async fn handshake_failure() {
        let manager = ConnectionManager::new(ConnectionMonitor::default());
        let (outbound, _) = outbound(BufferConnector::new(&Network::ALL));
        let (mut inbound, _client) = PipeStream::pair(1024);
        inbound.fail_handshake = true;
        let (on_close, closed) = handler(3);
        let relay = manager
            .new_connection(None, Box::new(inbound), metadata(Network::Tcp, "example.com:80"), outbound, on_close)
            .await;
        assert!(relay.is_none());
        assert!(matches!(closed.await.unwrap(), Some(Error::Io(_))));
        assert!(manager.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_context_closes_flow() {
        let monitor = ConnectionMonitor::new(Duration::from_millis(100));
        monitor.start();
        let manager = ConnectionManager::new(monitor);
        let (outbound, _) = outbound(BufferConnector::new(&Network::ALL));
        let (inbound, _client) = PipeStream::pair(1024);
        let (on_close, closed) = handler(4);
        let ctx = CancellationToken::new();
        manager
            .new_connection(
                Some(ctx.clone()),
                Box::new(inbound),
                metadata(Network::Tcp, "example.com:80"),
                outbound,
                on_close,
            )
            .await
            .unwrap();
        assert_eq!(manager.monitor().len(), 1);

        ctx.cancel();
        assert!(matches!(closed.await.unwrap(), Some(Error::Canceled)));
        assert!(manager.is_empty());
        assert!(manager.monitor().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn packet_flow_translates_addresses() {
        let manager = ConnectionManager::new(ConnectionMonitor::default());
        let (outbound, connector) = outbound(BufferConnector::new(&Network::ALL));
        let (inbound, client) = ChannelPktStream::pair();

        let fake: Address = "198.18.0.1:53".parse().unwrap();
        let resolved: Address = "1.1.1.1:53".parse().unwrap();
        let mut metadata = metadata(Network::Udp, "dns.example:53");
        metadata.fake_ip = true;
        metadata.origin_destination = Some(fake.clone());
        metadata.destination_addresses = vec!["1.1.1.1".parse().unwrap()];
        metadata.protocol = Some(PROTOCOL_DNS.to_owned());
        let (on_close, closed) = handler(5);

        manager
            .new_packet_connection(None, Arc::new(inbound), metadata, outbound, on_close)
            .await
            .unwrap();
        let server = connector.take_pkt_peer(&resolved).unwrap();

        let mut buf = [0u8; 64];
        client.send_to(b"query", &fake).await.unwrap();
        let (n, to) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!((&buf[..n], to), (&b"query"[..], resolved.clone()));

        server.send_to(b"answer", &resolved).await.unwrap();
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!((&buf[..n], from), (&b"answer"[..], fake));

        // dns flows idle out after 10s
        assert!(closed.await.unwrap().is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn idle_timeouts() {
        let mut metadata = metadata(Network::Udp, "1.1.1.1:443");
        assert_eq!(udp_timeout(&metadata), DEFAULT_UDP_TIMEOUT);
        metadata.protocol = Some(PROTOCOL_QUIC.to_owned());
        assert_eq!(udp_timeout(&metadata), QUIC_UDP_TIMEOUT);
        metadata.udp_timeout = Some(Duration::from_secs(3));
        assert_eq!(udp_timeout(&metadata), Duration::from_secs(3));
    }
}
