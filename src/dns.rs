//! DNS collaborators used while routing.
//!
//! Resolution itself lives behind [`DnsResolver`]; the crate ships only a
//! system resolver. Fake-IP and reverse-mapping stores are likewise
//! consulted through narrow traits.
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use log::*;
use serde::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::byte_stream::BoxedStream;
use crate::error::{Error, Result};
use crate::model::Address;
use crate::pkt_stream::BoxedPktStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStrategy {
    #[default]
    AsIs,
    PreferIpv4,
    PreferIpv6,
    Ipv4Only,
    Ipv6Only,
}

impl DomainStrategy {
    /// Filters or reorders `addrs` for this strategy.
    pub fn apply(&self, mut addrs: Vec<IpAddr>) -> Vec<IpAddr> {
        match self {
            DomainStrategy::AsIs => addrs,
            DomainStrategy::Ipv4Only => addrs.into_iter().filter(IpAddr::is_ipv4).collect(),
            DomainStrategy::Ipv6Only => addrs.into_iter().filter(IpAddr::is_ipv6).collect(),
            DomainStrategy::PreferIpv4 => {
                addrs.sort_by_key(|addr| !addr.is_ipv4());
                addrs
            }
            DomainStrategy::PreferIpv6 => {
                addrs.sort_by_key(|addr| !addr.is_ipv6());
                addrs
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupOptions {
    pub strategy: DomainStrategy,
    /// tag of the DNS server to ask, resolver default when unset
    pub server: Option<String>,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<IpNet>,
}

#[async_trait]
pub trait DnsResolver: fmt::Debug + Send + Sync {
    async fn lookup(&self, domain: &str, options: &LookupOptions) -> Result<Vec<IpAddr>>;

    /// Answers a raw DNS message.
    async fn exchange(&self, query: &[u8], options: &LookupOptions) -> Result<Vec<u8>>;
}

/// Fake-IP address pool.
pub trait FakeIpStore: fmt::Debug + Send + Sync {
    /// whether `ip` belongs to the fake range
    fn contains(&self, ip: IpAddr) -> bool;
    fn lookup(&self, ip: IpAddr) -> Option<String>;
}

/// Addresses recently returned by DNS, mapped back to the asked domain.
pub trait DnsReverseMapping: fmt::Debug + Send + Sync {
    fn query(&self, ip: IpAddr) -> Option<String>;
}

/// Resolves with the operating system's resolver.
#[derive(Debug, Clone, Default)]
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn lookup(&self, domain: &str, options: &LookupOptions) -> Result<Vec<IpAddr>> {
        if let Some(server) = &options.server {
            debug!("system resolver ignores server {}", server);
        }
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((domain, 0))
            .await
            .map_err(|err| Error::dns_lookup(domain, err))?
            .map(|addr| addr.ip())
            .collect();
        let addrs = options.strategy.apply(addrs);
        if addrs.is_empty() {
            return Err(Error::dns_lookup(domain, "empty result"));
        }
        Ok(addrs)
    }

    async fn exchange(&self, _query: &[u8], _options: &LookupOptions) -> Result<Vec<u8>> {
        Err(Error::not_supported("raw dns exchange by system resolver"))
    }
}

/// Serves length-prefixed DNS queries on a stream until the client closes.
pub async fn hijack_stream(
    strm: &mut BoxedStream,
    resolver: &dyn DnsResolver,
    options: &LookupOptions,
) -> Result<()> {
    loop {
        let len = match strm.read_u16().await {
            Ok(len) => len as usize,
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let mut query = vec![0u8; len];
        strm.read_exact(&mut query).await?;
        let response = resolver.exchange(&query, options).await?;
        let len = u16::try_from(response.len())
            .map_err(|_| Error::dns_lookup("<hijack>", "response too large"))?;
        strm.write_u16(len).await?;
        strm.write_all(&response).await?;
        strm.flush().await?;
    }
}

/// Answers datagram queries one by one until no query arrives for
/// `idle_timeout`.
pub async fn hijack_packets(
    pkt: BoxedPktStream,
    resolver: &dyn DnsResolver,
    options: &LookupOptions,
    idle_timeout: Duration,
) -> Result<()> {
    let mut buf = vec![0u8; 65535];
    loop {
        let (size, from): (usize, Address) =
            match tokio::time::timeout(idle_timeout, pkt.recv_from(&mut buf)).await {
                Err(_) => return Ok(()),
                Ok(res) => res?,
            };
        match resolver.exchange(&buf[..size], options).await {
            Ok(response) => {
                pkt.send_to(&response, &from).await?;
            }
            Err(err) => debug!("hijacked dns query from {}: {}", from, err),
        }
    }
}

#[cfg(test)]
pub mod test {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Resolver answering from a fixed table; `exchange` echoes the query
    /// with the response bit set.
    #[derive(Debug, Default)]
    pub struct StaticResolver {
        pub records: HashMap<String, Vec<IpAddr>>,
        pub lookups: Mutex<Vec<(String, LookupOptions)>>,
    }

    impl StaticResolver {
        pub fn new<I>(records: I) -> Self
        where
            I: IntoIterator<Item = (&'static str, Vec<IpAddr>)>,
        {
            Self {
                records: records
                    .into_iter()
                    .map(|(name, addrs)| (name.to_owned(), addrs))
                    .collect(),
                lookups: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl DnsResolver for StaticResolver {
        async fn lookup(&self, domain: &str, options: &LookupOptions) -> Result<Vec<IpAddr>> {
            self.lookups.lock().push((domain.to_owned(), options.clone()));
            match self.records.get(domain) {
                Some(addrs) => Ok(options.strategy.apply(addrs.clone())),
                None => Err(Error::dns_lookup(domain, "no such host")),
            }
        }

        async fn exchange(&self, query: &[u8], _options: &LookupOptions) -> Result<Vec<u8>> {
            let mut response = query.to_vec();
            if response.len() > 2 {
                response[2] |= 0x80;
            }
            Ok(response)
        }
    }

    #[derive(Debug)]
    pub struct StaticFakeIp {
        pub range: IpNet,
        pub records: HashMap<IpAddr, String>,
    }

    impl FakeIpStore for StaticFakeIp {
        fn contains(&self, ip: IpAddr) -> bool {
            self.range.contains(&ip)
        }

        fn lookup(&self, ip: IpAddr) -> Option<String> {
            self.records.get(&ip).cloned()
        }
    }

    #[derive(Debug, Default)]
    pub struct StaticReverseMapping(pub HashMap<IpAddr, String>);

    impl DnsReverseMapping for StaticReverseMapping {
        fn query(&self, ip: IpAddr) -> Option<String> {
            self.0.get(&ip).cloned()
        }
    }

    #[test]
    fn strategies() {
        let v4: IpAddr = "1.1.1.1".parse().unwrap();
        let v6: IpAddr = "2606:4700::1111".parse().unwrap();
        let addrs = vec![v6, v4];
        assert_eq!(DomainStrategy::PreferIpv4.apply(addrs.clone()), [v4, v6]);
        assert_eq!(DomainStrategy::Ipv6Only.apply(addrs.clone()), [v6]);
        assert_eq!(DomainStrategy::AsIs.apply(addrs), [v6, v4]);
    }

    #[test]
    fn strategy_names() {
        let s: DomainStrategy = serde_yaml::from_str("prefer_ipv6").unwrap();
        assert_eq!(s, DomainStrategy::PreferIpv6);
    }

    #[tokio::test]
    async fn hijack_stream_answers_each_query() {
        use crate::sniff::test::dns_query;
        let (client, server) = tokio::io::duplex(1024);
        let mut server: BoxedStream = Box::new(server);
        let resolver = StaticResolver::default();
        let task = tokio::spawn(async move {
            hijack_stream(&mut server, &resolver, &LookupOptions::default()).await
        });

        let (mut rd, mut wr) = tokio::io::split(client);
        for id in 1..=2u16 {
            let query = dns_query(id, "example.com");
            wr.write_u16(query.len() as u16).await.unwrap();
            wr.write_all(&query).await.unwrap();
            let len = rd.read_u16().await.unwrap() as usize;
            let mut response = vec![0u8; len];
            rd.read_exact(&mut response).await.unwrap();
            assert_eq!(u16::from_be_bytes([response[0], response[1]]), id);
            assert!(response[2] & 0x80 != 0);
        }
        drop(wr);
        drop(rd);
        task.await.unwrap().unwrap();
    }
}
