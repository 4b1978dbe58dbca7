//! Copy engine: moves bytes and datagrams between the two sides of a flow.
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::*;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::byte_stream::BoxedStream;
use crate::error::{Error, Result};
use crate::pkt_stream::BoxedPktStream;
use crate::session::CloseHandler;

const BUFFER_SIZE: usize = 32 * 1024;
const PACKET_BUFFER_SIZE: usize = 64 * 1024;

/// Byte counters of one flow, upload is inbound to outbound.
#[derive(Debug, Default)]
pub struct Traffic {
    upload: AtomicU64,
    download: AtomicU64,
}

impl Traffic {
    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct RelayHandle {
    /// inbound -> outbound
    upload: JoinHandle<()>,
    /// inbound <- outbound
    download: JoinHandle<()>,
}

impl RelayHandle {
    pub async fn join(self) -> std::result::Result<(), JoinError> {
        self.upload.await?;
        self.download.await
    }
}

/// State shared by the two directions of a relay.
#[derive(Debug)]
struct Completion {
    handler: CloseHandler,
    done: AtomicBool,
    first_error: Mutex<Option<Error>>,
    /// cancelled from outside the relay
    external: CancellationToken,
    /// cancelled to tear down both directions
    local: CancellationToken,
}

impl Completion {
    fn new(handler: CloseHandler, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            handler,
            done: AtomicBool::new(false),
            first_error: Mutex::new(None),
            local: cancel.child_token(),
            external: cancel,
        })
    }

    fn fail(&self, err: Error) {
        let own_teardown = matches!(err, Error::Canceled) && !self.external.is_cancelled();
        if !own_teardown {
            let mut first = self.first_error.lock();
            if first.is_none() {
                *first = Some(err);
            }
        }
        self.local.cancel();
    }

    /// The second caller reports the flow closed.
    fn finish(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            let err = self.first_error.lock().take();
            self.handler.close(err);
        }
    }
}

/// Spawns the two copy tasks of a stream flow.
///
/// Bytes cached by the inbound during sniffing are sent first. With duplex
/// streams an EOF half-closes the other side; otherwise it ends the whole
/// flow. The handler is called once both directions are done, with the
/// first error either direction hit.
pub fn spawn_relay(
    mut inbound: BoxedStream,
    outbound: BoxedStream,
    traffic: Arc<Traffic>,
    handler: CloseHandler,
    cancel: CancellationToken,
) -> RelayHandle {
    let id = handler.id();
    let duplex = inbound.is_duplex() && outbound.is_duplex();
    let cached = inbound.take_cached();
    let (read_inbound, write_inbound) = tokio::io::split(inbound);
    let (read_outbound, mut write_outbound) = tokio::io::split(outbound);
    let completion = Completion::new(handler, cancel);

    let upload = {
        let completion = completion.clone();
        let traffic = traffic.clone();
        tokio::spawn(async move {
            let copy = async {
                for chunk in cached {
                    write_outbound.write_all(&chunk).await?;
                    traffic.upload.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                copy_half(read_inbound, write_outbound, &traffic.upload, duplex).await
            };
            run_half(&completion, "upload", id, copy).await;
        })
    };
    let download = {
        let completion = completion.clone();
        tokio::spawn(async move {
            let copy = copy_half(read_outbound, write_inbound, &traffic.download, duplex);
            run_half(&completion, "download", id, copy).await;
        })
    };
    RelayHandle { upload, download }
}

async fn run_half<F>(completion: &Completion, direction: &str, id: impl std::fmt::Display, copy: F)
where
    F: std::future::Future<Output = Result<()>>,
{
    let res = tokio::select! {
        _ = completion.local.cancelled() => Err(Error::Canceled),
        res = copy => res,
    };
    match res {
        Ok(()) => debug!("connection {} {} finished", id, direction),
        Err(err) => {
            trace!("connection {} {} stopped: {}", id, direction, err);
            completion.fail(err);
        }
    }
    completion.finish();
}

async fn copy_half<R, W>(mut src: R, mut dst: W, counter: &AtomicU64, duplex: bool) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let size = src.read(&mut buf).await?;
        if size == 0 {
            break;
        }
        dst.write_all(&buf[..size]).await?;
        counter.fetch_add(size as u64, Ordering::Relaxed);
    }
    if duplex {
        dst.shutdown().await?;
        Ok(())
    } else {
        // tears down the other direction
        Err(Error::Canceled)
    }
}

/// Spawns the two copy tasks of a datagram flow.
///
/// The flow ends without error after `idle_timeout` without a packet in
/// either direction.
pub fn spawn_packet_relay(
    inbound: BoxedPktStream,
    outbound: BoxedPktStream,
    traffic: Arc<Traffic>,
    handler: CloseHandler,
    cancel: CancellationToken,
    idle_timeout: Duration,
) -> RelayHandle {
    let id = handler.id();
    let completion = Completion::new(handler, cancel);
    let last_active = Arc::new(Mutex::new(Instant::now()));

    tokio::spawn({
        let completion = completion.clone();
        let last_active = last_active.clone();
        async move {
            loop {
                let deadline = *last_active.lock() + idle_timeout;
                tokio::select! {
                    _ = completion.local.cancelled() => return,
                    _ = tokio::time::sleep_until(deadline) => {}
                }
                if last_active.lock().elapsed() >= idle_timeout {
                    debug!("connection {} idle for {:?}", id, idle_timeout);
                    completion.local.cancel();
                    return;
                }
            }
        }
    });

    let upload = {
        let completion = completion.clone();
        let (src, dst) = (inbound.clone(), outbound.clone());
        let (traffic, last_active) = (traffic.clone(), last_active.clone());
        tokio::spawn(async move {
            let copy = copy_packets(src, dst, &traffic.upload, &last_active);
            run_half(&completion, "upload", id, copy).await;
        })
    };
    let download = tokio::spawn(async move {
        let copy = copy_packets(outbound, inbound, &traffic.download, &last_active);
        run_half(&completion, "download", id, copy).await;
    });
    RelayHandle { upload, download }
}

async fn copy_packets(
    src: BoxedPktStream,
    dst: BoxedPktStream,
    counter: &AtomicU64,
    last_active: &Mutex<Instant>,
) -> Result<()> {
    let mut buf = vec![0u8; PACKET_BUFFER_SIZE];
    loop {
        let (size, addr) = src.recv_from(&mut buf).await?;
        dst.send_to(&buf[..size], &addr).await?;
        counter.fetch_add(size as u64, Ordering::Relaxed);
        *last_active.lock() = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::DuplexStream;
    use tokio::sync::oneshot;

    use crate::byte_stream::test::PipeStream;
    use crate::byte_stream::CachedStream;
    use crate::model::Address;
    use crate::pkt_stream::test::ChannelPktStream;
    use crate::pkt_stream::PktStream;

    fn handler() -> (CloseHandler, oneshot::Receiver<Option<Error>>) {
        let (tx, rx) = oneshot::channel();
        let handler = CloseHandler::new(1.into(), move |err| {
            tx.send(err).ok();
        });
        (handler, rx)
    }

    fn pipes(duplex: bool) -> (BoxedStream, DuplexStream, BoxedStream, DuplexStream) {
        let (mut inbound, client) = PipeStream::pair(1024);
        inbound.duplex = duplex;
        let (outbound, server) = tokio::io::duplex(1024);
        (Box::new(inbound), client, Box::new(outbound), server)
    }

    #[tokio::test]
    async fn relays_both_directions() {
        let (inbound, mut client, outbound, mut server) = pipes(true);
        let inbound = CachedStream::wrap(inbound, vec![Bytes::from_static(b"GET ")]);
        let traffic = Arc::new(Traffic::default());
        let (handler, closed) = handler();
        let relay = spawn_relay(inbound, outbound, traffic.clone(), handler, CancellationToken::new());

        client.write_all(b"hello").await.unwrap();
        client.shutdown().await.unwrap();
        let mut received = vec![];
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"GET hello");

        server.write_all(b"world").await.unwrap();
        server.shutdown().await.unwrap();
        let mut received = vec![];
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"world");

        assert!(closed.await.unwrap().is_none());
        relay.join().await.unwrap();
        assert_eq!(traffic.upload(), 9);
        assert_eq!(traffic.download(), 5);
    }

    #[tokio::test]
    async fn one_way_close_ends_flow() {
        let (inbound, mut client, outbound, _server) = pipes(false);
        let (handler, closed) = handler();
        spawn_relay(inbound, outbound, Arc::default(), handler, CancellationToken::new());
        client.shutdown().await.unwrap();
        assert!(closed.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn external_cancel() {
        let (inbound, _client, outbound, _server) = pipes(true);
        let (handler, closed) = handler();
        let cancel = CancellationToken::new();
        spawn_relay(inbound, outbound, Arc::default(), handler, cancel.clone());
        cancel.cancel();
        assert!(matches!(closed.await.unwrap(), Some(Error::Canceled)));
    }

    #[tokio::test]
    async fn first_error_reported() {
        let (inbound, mut client, outbound, server) = pipes(true);
        let (handler, closed) = handler();
        spawn_relay(inbound, outbound, Arc::default(), handler, CancellationToken::new());
        drop(server);
        client.write_all(b"lost").await.unwrap();
        let err = closed.await.unwrap().unwrap();
        assert!(matches!(err, Error::Io(_)), "{}", err);
        assert!(err.is_closed_or_canceled());
    }

    #[tokio::test(start_paused = true)]
    async fn packets_until_idle() {
        let (inbound, client) = ChannelPktStream::pair();
        let (outbound, server) = ChannelPktStream::pair();
        let traffic = Arc::new(Traffic::default());
        let (handler, mut closed) = handler();
        spawn_packet_relay(
            Arc::new(inbound),
            Arc::new(outbound),
            traffic.clone(),
            handler,
            CancellationToken::new(),
            Duration::from_secs(10),
        );

        let dns: Address = "1.1.1.1:53".parse().unwrap();
        let mut buf = [0u8; 64];
        client.send_to(b"query", &dns).await.unwrap();
        let (n, to) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!((&buf[..n], to), (&b"query"[..], dns.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        server.send_to(b"answer!", &dns).await.unwrap();
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!((&buf[..n], from), (&b"answer!"[..], dns));

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(closed.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(closed.await.unwrap().is_none());
        assert_eq!(traffic.upload(), 5);
        assert_eq!(traffic.download(), 7);
    }
}
