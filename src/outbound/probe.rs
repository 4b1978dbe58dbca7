use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use log::*;
use reqwest::Url;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::model::{Address, Network};
use crate::outbound::Outbound;

/// Measures the round trip through an outbound.
#[async_trait]
pub trait Prober: fmt::Debug + Send + Sync {
    async fn probe(&self, outbound: &Outbound) -> Result<Duration>;
}

/// Probes by fetching a URL through the outbound.
#[derive(Debug, Clone)]
pub struct UrlProber {
    url: String,
    timeout: Duration,
}

impl UrlProber {
    pub fn new<S: Into<String>>(url: S, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Prober for UrlProber {
    async fn probe(&self, outbound: &Outbound) -> Result<Duration> {
        tokio::time::timeout(self.timeout, url_test(outbound, &self.url)).await?
    }
}

/// `http` links are requested with HEAD and must answer with a status
/// line; for `https` links the connection handshake is the measurement.
pub async fn url_test(outbound: &Outbound, link: &str) -> Result<Duration> {
    let url = Url::parse(link).map_err(|err| Error::config_fmt(format_args!("parse url {}: {}", link, err)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::config_fmt(format_args!("missing host in url: {}", link)))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::config_fmt(format_args!("missing port in url: {}", link)))?;
    let destination = Address::from_host(host.trim_start_matches('[').trim_end_matches(']'), port);
    let metadata = Metadata::new(
        Network::Tcp,
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        destination,
    );

    let start = Instant::now();
    let mut strm = outbound.dial(&metadata).await?;
    match url.scheme() {
        "https" => {}
        "http" => {
            let request = format!(
                "HEAD {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: switchyard\r\nConnection: close\r\n\r\n",
                url.path(),
                host
            );
            strm.write_all(request.as_bytes()).await?;
            strm.flush().await?;
            let mut status = String::new();
            BufReader::new(&mut strm).read_line(&mut status).await?;
            if !status.starts_with("HTTP/") {
                return Err(Error::not_supported(format!("unexpected response from {}", link)));
            }
            trace!("url test {}: {}", link, status.trim_end());
        }
        scheme => return Err(Error::not_supported(format!("url test scheme: {}", scheme))),
    }
    Ok(start.elapsed())
}

#[cfg(test)]
pub mod test {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::outbound::LeafOutbound;

    /// Answers with configured delays per outbound tag; unknown tags fail.
    #[derive(Debug, Default)]
    pub struct FixedProber {
        pub delays: Mutex<HashMap<String, Duration>>,
        pub probed: Mutex<Vec<String>>,
    }

    impl FixedProber {
        pub fn new(delays: &[(&str, u64)]) -> Self {
            let prober = Self::default();
            for (tag, millis) in delays {
                prober.set(tag, Some(*millis));
            }
            prober
        }

        pub fn set(&self, tag: &str, millis: Option<u64>) {
            let mut delays = self.delays.lock();
            match millis {
                Some(millis) => delays.insert(tag.to_owned(), Duration::from_millis(millis)),
                None => delays.remove(tag),
            };
        }

        pub fn probed(&self) -> Vec<String> {
            let mut probed = self.probed.lock().clone();
            probed.sort();
            probed
        }
    }

    #[async_trait]
    impl Prober for FixedProber {
        async fn probe(&self, outbound: &Outbound) -> Result<Duration> {
            let tag = outbound.real_tag();
            self.probed.lock().push(tag.clone());
            self.delays
                .lock()
                .get(&tag)
                .copied()
                .ok_or_else(|| io_error("unreachable"))
        }
    }

    fn io_error(msg: &str) -> Error {
        std::io::Error::new(std::io::ErrorKind::TimedOut, msg.to_owned()).into()
    }

    fn direct() -> Outbound {
        Outbound::Leaf(LeafOutbound::new(
            "direct",
            "direct",
            Arc::new(crate::connector::DirectConnector::default()),
        ))
    }

    #[tokio::test]
    async fn http_head() {
        use tokio::io::AsyncReadExt;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = conn.read(&mut buf).await.unwrap();
            conn.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        url_test(&direct(), &format!("http://{}/generate_204", addr))
            .await
            .unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("HEAD /generate_204 HTTP/1.1\r\n"), "{}", request);
    }

    #[tokio::test]
    async fn https_measures_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        url_test(&direct(), &format!("https://127.0.0.1:{}/", port))
            .await
            .unwrap();
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejects_other_schemes() {
        assert!(url_test(&direct(), "not a url").await.is_err());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let err = url_test(&direct(), &format!("ftp://127.0.0.1:{}/", port))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "not supported: url test scheme: ftp");
    }

    #[tokio::test]
    async fn fixed_prober() {
        let prober = FixedProber::new(&[("direct", 20)]);
        assert_eq!(prober.probe(&direct()).await.unwrap(), Duration::from_millis(20));
        prober.set("direct", None);
        assert!(prober.probe(&direct()).await.is_err());
        assert_eq!(prober.probed(), ["direct", "direct"]);
    }
}
