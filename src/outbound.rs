//! Outbounds: leaf transports and the groups that choose among them.
//!
//! An outbound is addressed by its tag. Groups hold their members as
//! `Arc<Outbound>`, so the members must exist before the group is built;
//! [`manager::OutboundManager`] builds everything in dependency order.
pub mod balancer;
pub mod manager;
pub mod probe;
pub mod selector;
pub mod strategy;
pub mod urltest;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::*;

use crate::byte_stream::BoxedStream;
use crate::connector::{BlockConnector, Connector, DirectConnector};
use crate::dialer::{self, InterfacePreference, NetworkInterface};
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::model::{Address, Network};
use crate::pkt_stream::BoxedPktStream;

pub use self::balancer::{Balancer, BalancerOptions};
pub use self::manager::OutboundManager;
pub use self::selector::{Selector, SelectorOptions};
pub use self::urltest::{HistoryStore, UrlTestGroup, UrlTestOptions};

pub const TYPE_DIRECT: &str = "direct";
pub const TYPE_BLOCK: &str = "block";
pub const TYPE_SELECTOR: &str = "selector";
pub const TYPE_URLTEST: &str = "urltest";
pub const TYPE_BALANCER: &str = "balancer";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DirectOptions {
    #[serde(default, with = "crate::config::duration_opt")]
    pub connect_timeout: Option<Duration>,
    /// interfaces usable by the parallel-interface dial
    #[serde(default)]
    pub interfaces: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundKind {
    Direct(DirectOptions),
    Block,
    Selector(SelectorOptions),
    Urltest(UrlTestOptions),
    Balancer(BalancerOptions),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OutboundOptions {
    pub tag: String,
    #[serde(flatten)]
    pub kind: OutboundKind,
}

impl OutboundOptions {
    /// Tags that must be built first.
    pub fn dependencies(&self) -> Vec<String> {
        match &self.kind {
            OutboundKind::Direct(_) | OutboundKind::Block => vec![],
            OutboundKind::Selector(options) => options.outbounds.clone(),
            OutboundKind::Urltest(options) => options.outbounds.clone(),
            OutboundKind::Balancer(options) => {
                let mut deps = options.outbounds.clone();
                if let Some(fallback) = &options.fallback {
                    if !deps.contains(fallback) {
                        deps.push(fallback.clone());
                    }
                }
                deps
            }
        }
    }
}

/// Outbound that dials through a [`Connector`].
#[derive(Debug)]
pub struct LeafOutbound {
    tag: String,
    kind: String,
    connector: Arc<dyn Connector>,
}

impl LeafOutbound {
    pub fn new<S: Into<String>>(tag: S, kind: S, connector: Arc<dyn Connector>) -> Self {
        Self {
            tag: tag.into(),
            kind: kind.into(),
            connector,
        }
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    async fn dial(&self, metadata: &Metadata) -> Result<BoxedStream> {
        let connector = self.connector.as_ref();
        match InterfacePreference::from_metadata(metadata) {
            Some(pref) => {
                dialer::dial_parallel_interface(
                    connector,
                    &metadata.destination,
                    &metadata.destination_addresses,
                    &pref,
                )
                .await
            }
            None => {
                dialer::dial_serial(connector, &metadata.destination, &metadata.destination_addresses)
                    .await
            }
        }
    }

    async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedPktStream> {
        let destination = match metadata.destination_addresses.first() {
            Some(ip) => Address::IpAddr(*ip, metadata.destination.port()),
            None => metadata.destination.clone(),
        };
        match InterfacePreference::from_metadata(metadata) {
            Some(pref) => dialer::listen_serial_interface(self.connector.as_ref(), &destination, &pref).await,
            None => self.connector.connect_pkt_stream(&destination).await,
        }
    }
}

#[derive(Debug)]
pub enum Outbound {
    Leaf(LeafOutbound),
    Selector(Selector),
    UrlTest(UrlTestGroup),
    Balancer(Balancer),
}

impl Outbound {
    /// Builds a configured outbound; group members are looked up in `built`.
    pub fn new(
        options: &OutboundOptions,
        built: &HashMap<String, Arc<Outbound>>,
        history: &Arc<HistoryStore>,
    ) -> Result<Self> {
        let tag = options.tag.as_str();
        let outbound = match &options.kind {
            OutboundKind::Direct(direct) => {
                let mut connector = DirectConnector::new(direct.connect_timeout);
                connector.set_interfaces(direct.interfaces.clone());
                Outbound::Leaf(LeafOutbound::new(tag, TYPE_DIRECT, Arc::new(connector)))
            }
            OutboundKind::Block => Outbound::Leaf(LeafOutbound::new(tag, TYPE_BLOCK, Arc::new(BlockConnector))),
            OutboundKind::Selector(selector) => Outbound::Selector(Selector::new(tag, selector, built)?),
            OutboundKind::Urltest(urltest) => {
                Outbound::UrlTest(UrlTestGroup::new(tag, urltest, built, history.clone())?)
            }
            OutboundKind::Balancer(balancer) => Outbound::Balancer(Balancer::new(tag, balancer, built)?),
        };
        Ok(outbound)
    }

    /// Direct outbound with default options.
    pub fn direct<S: Into<String>>(tag: S) -> Self {
        Outbound::Leaf(LeafOutbound::new(tag.into(), TYPE_DIRECT.to_owned(), Arc::new(DirectConnector::default())))
    }

    pub fn tag(&self) -> &str {
        match self {
            Outbound::Leaf(leaf) => &leaf.tag,
            Outbound::Selector(group) => group.tag(),
            Outbound::UrlTest(group) => group.tag(),
            Outbound::Balancer(group) => group.tag(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Outbound::Leaf(leaf) => &leaf.kind,
            Outbound::Selector(_) => TYPE_SELECTOR,
            Outbound::UrlTest(_) => TYPE_URLTEST,
            Outbound::Balancer(_) => TYPE_BALANCER,
        }
    }

    pub fn networks(&self) -> Vec<Network> {
        match self {
            Outbound::Leaf(leaf) => leaf.connector.networks().to_vec(),
            Outbound::Selector(group) => group.selected().networks(),
            Outbound::UrlTest(group) => union_networks(group.outbounds()),
            Outbound::Balancer(group) => {
                let mut networks = union_networks(group.outbounds());
                for network in group.fallback().networks() {
                    if !networks.contains(&network) {
                        networks.push(network);
                    }
                }
                networks
            }
        }
    }

    pub fn supports(&self, network: Network) -> bool {
        self.networks().contains(&network)
    }

    pub fn dependencies(&self) -> Vec<String> {
        let tags = |outbounds: &[Arc<Outbound>]| outbounds.iter().map(|o| o.tag().to_owned()).collect();
        match self {
            Outbound::Leaf(_) => vec![],
            Outbound::Selector(group) => tags(group.outbounds()),
            Outbound::UrlTest(group) => tags(group.outbounds()),
            Outbound::Balancer(group) => {
                let mut deps: Vec<String> = tags(group.outbounds());
                deps.push(group.fallback().tag().to_owned());
                deps
            }
        }
    }

    /// Tag of the member a group currently routes through.
    pub fn now(&self) -> Option<String> {
        match self {
            Outbound::Leaf(_) => None,
            Outbound::Selector(group) => Some(group.now()),
            Outbound::UrlTest(group) => Some(group.now()),
            Outbound::Balancer(group) => Some(group.now()),
        }
    }

    /// Follows group selections down to a leaf.
    pub fn real_tag(&self) -> String {
        match self {
            Outbound::Leaf(leaf) => leaf.tag.clone(),
            Outbound::Selector(group) => group.selected().real_tag(),
            Outbound::UrlTest(group) => match group.current().or_else(|| group.select(Network::Tcp)) {
                Some(outbound) => outbound.real_tag(),
                None => group.tag().to_owned(),
            },
            Outbound::Balancer(group) => group.current().real_tag(),
        }
    }

    pub fn dial<'a>(&'a self, metadata: &'a Metadata) -> BoxFuture<'a, Result<BoxedStream>> {
        match self {
            Outbound::Leaf(leaf) => leaf.dial(metadata).boxed(),
            Outbound::Selector(group) => group.dial(metadata).boxed(),
            Outbound::UrlTest(group) => group.dial(metadata).boxed(),
            Outbound::Balancer(group) => group.dial(metadata).boxed(),
        }
    }

    pub fn listen_packet<'a>(&'a self, metadata: &'a Metadata) -> BoxFuture<'a, Result<BoxedPktStream>> {
        match self {
            Outbound::Leaf(leaf) => leaf.listen_packet(metadata).boxed(),
            Outbound::Selector(group) => group.listen_packet(metadata).boxed(),
            Outbound::UrlTest(group) => group.listen_packet(metadata).boxed(),
            Outbound::Balancer(group) => group.listen_packet(metadata).boxed(),
        }
    }

    /// Starts background work: probe loops of health-aware groups.
    pub fn start(&self) {
        match self {
            Outbound::UrlTest(group) => group.start(),
            Outbound::Balancer(group) => group.start(),
            Outbound::Leaf(_) | Outbound::Selector(_) => {}
        }
    }

    pub fn close(&self) {
        match self {
            Outbound::UrlTest(group) => group.close(),
            Outbound::Balancer(group) => group.close(),
            Outbound::Leaf(_) | Outbound::Selector(_) => {}
        }
    }
}

fn union_networks(outbounds: &[Arc<Outbound>]) -> Vec<Network> {
    let mut networks = vec![];
    for network in Network::ALL {
        if outbounds.iter().any(|outbound| outbound.supports(network)) {
            networks.push(network);
        }
    }
    networks
}

/// Resolves the member tags of a group.
fn lookup_members(
    group: &str,
    tags: &[String],
    built: &HashMap<String, Arc<Outbound>>,
) -> Result<Vec<Arc<Outbound>>> {
    if tags.is_empty() {
        return Err(Error::config_fmt(format_args!("outbound[{}]: missing tags", group)));
    }
    tags.iter()
        .map(|tag| {
            built.get(tag).cloned().ok_or_else(|| {
                Error::config_fmt(format_args!("outbound[{}]: outbound not found: {}", group, tag))
            })
        })
        .collect()
}

#[cfg(test)]
pub mod test {
    use super::*;
    use crate::connector::test::BufferConnector;

    /// Leaf backed by a [`BufferConnector`], kept for inspecting dials.
    pub fn buffer_outbound(tag: &str, networks: &[Network]) -> (Arc<Outbound>, Arc<BufferConnector>) {
        let connector = Arc::new(BufferConnector::new(networks));
        let outbound = Outbound::Leaf(LeafOutbound::new(tag, "buffer", connector.clone()));
        (Arc::new(outbound), connector)
    }

    pub fn members(outbounds: &[&Arc<Outbound>]) -> HashMap<String, Arc<Outbound>> {
        outbounds
            .iter()
            .map(|outbound| (outbound.tag().to_owned(), Arc::clone(outbound)))
            .collect()
    }

    #[test]
    fn parse_options() {
        let options: Vec<OutboundOptions> = serde_yaml::from_str(
            r#"
- {tag: direct, type: direct, connect_timeout: 3s}
- {tag: block, type: block}
- {tag: pick, type: selector, outbounds: [direct, block], default: block}
- {tag: lb, type: balancer, outbounds: [direct], fallback: block, strategy: {type: least_ping}}
"#,
        )
        .unwrap();
        assert_eq!(
            options[0].kind,
            OutboundKind::Direct(DirectOptions {
                connect_timeout: Some(Duration::from_secs(3)),
                interfaces: vec![],
            })
        );
        assert_eq!(options[1].kind, OutboundKind::Block);
        assert_eq!(options[2].dependencies(), ["direct", "block"]);
        assert_eq!(options[3].dependencies(), ["direct", "block"]);
    }

    #[test]
    fn unknown_type() {
        assert!(serde_yaml::from_str::<OutboundOptions>("{tag: x, type: teleport}").is_err());
    }

    #[tokio::test]
    async fn leaf_dials_resolved_candidates() {
        let (outbound, connector) = buffer_outbound("proxy", &Network::ALL);
        let mut metadata = Metadata::new(
            Network::Tcp,
            "10.0.0.2:50000".parse().unwrap(),
            "example.com:443".parse().unwrap(),
        );
        metadata.destination_addresses = vec!["93.184.216.34".parse().unwrap()];
        outbound.dial(&metadata).await.unwrap();
        assert_eq!(connector.dialed(), ["93.184.216.34:443"]);
        assert_eq!(outbound.real_tag(), "proxy");
        assert!(outbound.now().is_none());
    }

    #[tokio::test]
    async fn block_outbound() {
        let options: OutboundOptions = serde_yaml::from_str("{tag: deny, type: block}").unwrap();
        let outbound = Outbound::new(&options, &HashMap::new(), &Arc::default()).unwrap();
        assert_eq!(outbound.kind(), TYPE_BLOCK);
        let metadata = Metadata::new(
            Network::Tcp,
            "10.0.0.2:50000".parse().unwrap(),
            "example.com:443".parse().unwrap(),
        );
        assert!(outbound.dial(&metadata).await.is_err());
    }

    #[test]
    fn missing_members() {
        let options: OutboundOptions =
            serde_yaml::from_str("{tag: pick, type: selector, outbounds: [nowhere]}").unwrap();
        let err = Outbound::new(&options, &HashMap::new(), &Arc::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "config error: outbound[pick]: outbound not found: nowhere"
        );
    }
}
