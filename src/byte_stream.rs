use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// read/write operations on byte stream
pub trait ByteStream: fmt::Debug + AsyncRead + AsyncWrite + Send + Unpin {
    /// Whether `shutdown` closes only the write side, leaving reads open.
    fn is_duplex(&self) -> bool {
        true
    }

    /// Drains bytes captured before dispatch (sniffing) that have not been
    /// delivered through `poll_read` yet.
    fn take_cached(&mut self) -> Vec<Bytes> {
        vec![]
    }

    /// Called once the outbound side is connected. Inbounds that owe their
    /// client a handshake reply send it here.
    fn handshake_success(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// byte stream on tcp connection
impl ByteStream for TcpStream {}

/// in-memory pipe
impl ByteStream for DuplexStream {}

/// Boxed stream
impl<S: ByteStream + ?Sized> ByteStream for Box<S> {
    fn is_duplex(&self) -> bool {
        (**self).is_duplex()
    }

    fn take_cached(&mut self) -> Vec<Bytes> {
        (**self).take_cached()
    }

    fn handshake_success(&mut self) -> io::Result<()> {
        (**self).handshake_success()
    }
}

pub type BoxedStream = Box<dyn ByteStream>;

/// Stream whose first reads replay bytes that were consumed while sniffing.
#[derive(Debug)]
pub struct CachedStream {
    cache: Vec<Bytes>,
    inner: BoxedStream,
}

impl CachedStream {
    pub fn new(inner: BoxedStream, cache: Vec<Bytes>) -> Self {
        let cache = cache.into_iter().filter(|b| !b.is_empty()).collect();
        Self { cache, inner }
    }

    /// Wraps `inner` only when there is something to replay.
    pub fn wrap(inner: BoxedStream, cache: Vec<Bytes>) -> BoxedStream {
        if cache.iter().all(Bytes::is_empty) {
            inner
        } else {
            Box::new(Self::new(inner, cache))
        }
    }
}

impl AsyncRead for CachedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(front) = self.cache.first_mut() {
            let n = front.len().min(buf.remaining());
            buf.put_slice(&front[..n]);
            front.advance(n);
            if front.is_empty() {
                self.cache.remove(0);
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CachedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl ByteStream for CachedStream {
    fn is_duplex(&self) -> bool {
        self.inner.is_duplex()
    }

    fn take_cached(&mut self) -> Vec<Bytes> {
        let mut cached = std::mem::take(&mut self.cache);
        cached.extend(self.inner.take_cached());
        cached
    }

    fn handshake_success(&mut self) -> io::Result<()> {
        self.inner.handshake_success()
    }
}
