//! Walks the route rules for each flow and carries out the matched action.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::*;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::byte_stream::{BoxedStream, CachedStream};
use crate::config::Config;
use crate::connection::{self, ConnectionManager};
use crate::dns::{self, DnsResolver, DnsReverseMapping, FakeIpStore, LookupOptions};
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::model::{self, Address};
use crate::monitor::ConnectionMonitor;
use crate::outbound::manager::OutboundManager;
use crate::outbound::Outbound;
use crate::pkt_stream::{BoxedPktStream, CachedPktStream};
use crate::process::ProcessSearcher;
use crate::rule::action::{RejectMethod, ResolveAction, SniffAction};
use crate::rule::{Matcher, Rule, RuleAction, RuleContext};
use crate::rule_set::{RuleSet, RuleSetRegistry};
use crate::session::CloseHandler;
use crate::sniff::{self, PacketSniffer, SniffResult, Sniffed, DEFAULT_SNIFF_TIMEOUT};

const PACKET_BUFFER_SIZE: usize = 64 * 1024;

/// Wireless network the host is attached to.
pub trait WifiState: fmt::Debug + Send + Sync {
    fn ssid(&self) -> Option<String>;
    fn bssid(&self) -> Option<String>;
}

/// The inbound side as seen by sniffers.
enum Conn {
    Stream(BoxedStream),
    Packet(BoxedPktStream),
    None,
}

enum Decision {
    Route(Arc<Outbound>),
    HijackDns,
}

#[derive(Debug)]
pub struct Router {
    rules: Vec<Rule>,
    registry: RuleSetRegistry,
    /// rule-sets the rules refer to
    referenced: Vec<Arc<RuleSet>>,
    outbounds: OutboundManager,
    connections: ConnectionManager,
    resolver: Option<Arc<dyn DnsResolver>>,
    fake_ip: Option<Arc<dyn FakeIpStore>>,
    reverse_mapping: Option<Arc<dyn DnsReverseMapping>>,
    process_searcher: Option<Arc<dyn ProcessSearcher>>,
    wifi: Option<Arc<dyn WifiState>>,
    default_sniff_timeout: Duration,
}

impl Router {
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_context(config, RuleContext::default())
    }

    /// Builds the router with `ctx` supplying the geoip and geosite
    /// databases; configured rule-sets are added to it.
    pub fn with_context(config: &Config, mut ctx: RuleContext) -> Result<Self> {
        let registry = RuleSetRegistry::new(&config.route.rule_set, &ctx)?;
        for set in registry.sets() {
            ctx.add_rule_set(set.clone());
        }
        let rules = config
            .route
            .rules
            .iter()
            .map(|options| Rule::new(options, &ctx))
            .collect::<Result<Vec<_>>>()?;
        let outbounds = OutboundManager::new(&config.outbounds, config.route.final_outbound.as_deref())?;
        let mut router = Self::with_parts(
            rules,
            registry,
            outbounds,
            ConnectionMonitor::new(config.route.monitor_throttle),
        )?;
        router.set_default_sniff_timeout(config.route.default_sniff_timeout);
        Ok(router)
    }

    pub fn with_parts(
        rules: Vec<Rule>,
        registry: RuleSetRegistry,
        outbounds: OutboundManager,
        monitor: ConnectionMonitor,
    ) -> Result<Self> {
        for (index, rule) in rules.iter().enumerate() {
            if let RuleAction::Route { outbound, .. } = rule.action() {
                if outbounds.outbound(outbound).is_none() {
                    return Err(Error::config_fmt(format_args!(
                        "outbound not found for rule[{}]: {}",
                        index, outbound
                    )));
                }
            }
        }
        let mut referenced: Vec<Arc<RuleSet>> = vec![];
        let mut found = vec![];
        for rule in &rules {
            rule.matcher().collect_rule_sets(&mut found);
        }
        for set in found {
            if !referenced.iter().any(|other| Arc::ptr_eq(other, &set)) {
                referenced.push(set);
            }
        }
        Ok(Self {
            rules,
            registry,
            referenced,
            outbounds,
            connections: ConnectionManager::new(monitor),
            resolver: None,
            fake_ip: None,
            reverse_mapping: None,
            process_searcher: None,
            wifi: None,
            default_sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
        })
    }

    pub fn set_resolver(&mut self, resolver: Arc<dyn DnsResolver>) -> &mut Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn set_fake_ip(&mut self, store: Arc<dyn FakeIpStore>) -> &mut Self {
        self.fake_ip = Some(store);
        self
    }

    pub fn set_reverse_mapping(&mut self, mapping: Arc<dyn DnsReverseMapping>) -> &mut Self {
        self.reverse_mapping = Some(mapping);
        self
    }

    pub fn set_process_searcher(&mut self, searcher: Arc<dyn ProcessSearcher>) -> &mut Self {
        self.process_searcher = Some(searcher);
        self
    }

    pub fn set_wifi_state(&mut self, wifi: Arc<dyn WifiState>) -> &mut Self {
        self.wifi = Some(wifi);
        self
    }

    pub fn set_default_sniff_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.default_sniff_timeout = timeout;
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rule_sets(&self) -> &RuleSetRegistry {
        &self.registry
    }

    pub fn outbounds(&self) -> &OutboundManager {
        &self.outbounds
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Loads the rule-sets, then starts outbounds and the monitor.
    pub async fn start(&self) -> Result<()> {
        self.registry.start().await?;
        for set in &self.referenced {
            set.inc_ref();
        }
        self.registry.cleanup();
        self.outbounds.start();
        self.connections.monitor().start();
        info!(
            "router started: {} rules, {} outbounds",
            self.rules.len(),
            self.outbounds.outbounds().len()
        );
        Ok(())
    }

    pub fn close(&self) {
        self.connections.monitor().close();
        self.outbounds.close();
        self.registry.close();
    }

    /// Routes a stream flow. Every outcome is reported through `on_close`.
    pub async fn route_connection(
        &self,
        ctx: Option<CancellationToken>,
        strm: BoxedStream,
        mut metadata: Metadata,
        on_close: CloseHandler,
    ) {
        let label = on_close.id().to_string();
        let mut conn = Conn::Stream(strm);
        let decision = self.decide(&mut metadata, &mut conn, &label).await;
        let mut strm = match conn {
            Conn::Stream(strm) => strm,
            _ => return on_close.close(Some(Error::Closed)),
        };
        match decision {
            Ok(Decision::Route(outbound)) => {
                self.connections
                    .new_connection(ctx, strm, metadata, outbound, on_close)
                    .await;
            }
            Ok(Decision::HijackDns) => {
                let res = match &self.resolver {
                    None => Err(Error::DnsNotConfigured),
                    Some(resolver) => match strm.handshake_success() {
                        Ok(()) => dns::hijack_stream(&mut strm, resolver.as_ref(), &LookupOptions::default()).await,
                        Err(err) => Err(err.into()),
                    },
                };
                on_close.close(res.err());
            }
            Err(err) => {
                log_route_error(&label, &err);
                on_close.close(Some(err));
            }
        }
    }

    /// Routes a datagram flow. Every outcome is reported through `on_close`.
    pub async fn route_packet_connection(
        &self,
        ctx: Option<CancellationToken>,
        pkt: BoxedPktStream,
        mut metadata: Metadata,
        on_close: CloseHandler,
    ) {
        let label = on_close.id().to_string();
        let mut conn = Conn::Packet(pkt);
        let decision = self.decide(&mut metadata, &mut conn, &label).await;
        let pkt = match conn {
            Conn::Packet(pkt) => pkt,
            _ => return on_close.close(Some(Error::Closed)),
        };
        match decision {
            Ok(Decision::Route(outbound)) => {
                self.connections
                    .new_packet_connection(ctx, pkt, metadata, outbound, on_close)
                    .await;
            }
            Ok(Decision::HijackDns) => {
                let res = match &self.resolver {
                    None => Err(Error::DnsNotConfigured),
                    Some(resolver) => {
                        let idle = connection::udp_timeout(&metadata);
                        dns::hijack_packets(pkt, resolver.as_ref(), &LookupOptions::default(), idle).await
                    }
                };
                on_close.close(res.err());
            }
            Err(err) => {
                log_route_error(&label, &err);
                on_close.close(Some(err));
            }
        }
    }

    /// Evaluates the rules before the inbound has accepted the flow. Sniff
    /// and resolve actions are skipped; only a reject is reported.
    pub async fn pre_match(&self, metadata: &mut Metadata) -> Result<()> {
        if let Err(err) = self.prepare(metadata) {
            debug!("[pre-match] {}", err);
            return Ok(());
        }
        let rule = match self.match_rules(metadata, &mut Conn::None, true, "pre-match", 0).await {
            Ok(matched) => matched.map(|(_, rule)| rule),
            Err(err) => {
                debug!("[pre-match] {}", err);
                return Ok(());
            }
        };
        match rule.map(Rule::action) {
            Some(RuleAction::Reject(reject)) => Err(reject
                .error()
                .unwrap_or_else(|| Error::rejected(RejectMethod::Reply))),
            _ => Ok(()),
        }
    }

    /// Continues the rule walk at `start` for a flow without a connection
    /// attached, e.g. `index + 1` after a rule the caller has handled itself.
    /// Sniff actions have nothing to peek at and are passed over.
    pub async fn match_from(&self, metadata: &mut Metadata, start: usize) -> Result<Option<(usize, &Rule)>> {
        self.match_rules(metadata, &mut Conn::None, false, "match", start).await
    }

    async fn decide(&self, metadata: &mut Metadata, conn: &mut Conn, label: &str) -> Result<Decision> {
        self.prepare(metadata)?;
        let rule = self
            .match_rules(metadata, conn, false, label, 0)
            .await?
            .map(|(_, rule)| rule);
        let outbound = match rule.map(Rule::action) {
            Some(RuleAction::Reject(reject)) => {
                return Err(reject.error().unwrap_or(Error::RejectReplyNotSupported {
                    network: metadata.network,
                }));
            }
            Some(RuleAction::HijackDns) => return Ok(Decision::HijackDns),
            Some(RuleAction::Route { outbound, .. }) => self
                .outbounds
                .outbound(outbound)
                .ok_or_else(|| Error::outbound_not_found(outbound.as_str()))?,
            _ => self.outbounds.default_for(metadata.network)?,
        };
        if !outbound.supports(metadata.network) {
            return Err(Error::network_not_supported(metadata.network, outbound.tag()));
        }
        Ok(Decision::Route(outbound))
    }

    fn needs_process(&self) -> bool {
        self.rules.iter().any(|rule| rule.matcher().contains_process_item())
            || self.referenced.iter().any(|set| set.metadata().contains_process_rule)
    }

    fn needs_wifi(&self) -> bool {
        self.rules.iter().any(|rule| rule.matcher().contains_wifi_item())
            || self.referenced.iter().any(|set| set.metadata().contains_wifi_rule)
    }

    /// Fills what the rules may ask about before the first one runs.
    fn prepare(&self, metadata: &mut Metadata) -> Result<()> {
        if let Some(searcher) = &self.process_searcher {
            if metadata.process_info.is_none() && self.needs_process() {
                match searcher.find(metadata.network, metadata.source, metadata.destination.socket_addr()) {
                    Ok(info) => {
                        debug!("found process path: {}", info.process_path);
                        metadata.process_info = Some(info);
                    }
                    Err(err) => debug!("search process: {}", err),
                }
            }
        }
        if let (Some(store), Some(ip)) = (&self.fake_ip, metadata.destination.ip()) {
            if store.contains(ip) {
                let domain = store.lookup(ip).ok_or(Error::FakeIpNotFound { addr: ip })?;
                let port = metadata.destination.port();
                metadata.origin_destination = Some(metadata.destination.clone());
                metadata.destination = Address::Domain(domain, port);
                metadata.fake_ip = true;
                debug!("found fakeip domain: {}", metadata.destination);
            }
        }
        if let (Some(mapping), Some(ip), None) = (&self.reverse_mapping, metadata.destination.ip(), &metadata.domain) {
            if let Some(domain) = mapping.query(ip) {
                debug!("found reserve mapped domain: {}", domain);
                metadata.domain = Some(domain);
            }
        }
        metadata.ip_version = match &metadata.destination {
            Address::IpAddr(ip, _) if ip.is_ipv4() => Some(4),
            Address::IpAddr(_, _) => Some(6),
            Address::Domain(_, _) => None,
        };
        if let Some(wifi) = &self.wifi {
            if self.needs_wifi() {
                metadata.wifi_ssid = wifi.ssid();
                metadata.wifi_bssid = wifi.bssid();
            }
        }
        Ok(())
    }

    /// First rule with a terminal action at or after `start`, with its
    /// index. Route options of every matched rule are merged on the way.
    async fn match_rules(
        &self,
        metadata: &mut Metadata,
        conn: &mut Conn,
        pre_match: bool,
        label: &str,
        start: usize,
    ) -> Result<Option<(usize, &Rule)>> {
        for (index, rule) in self.rules.iter().enumerate().skip(start) {
            if !rule.r#match(metadata) {
                continue;
            }
            debug!("[{}] match[{}] {}", label, index, rule);
            match rule.action() {
                RuleAction::RouteOptions(options) => metadata.apply_route_options(options),
                RuleAction::Sniff(action) => {
                    if !pre_match {
                        self.sniff(metadata, conn, action, label).await;
                    }
                }
                RuleAction::Resolve(action) => {
                    if !pre_match {
                        self.resolve(metadata, action, label).await?;
                    }
                }
                RuleAction::Route { options, .. } => {
                    metadata.apply_route_options(options);
                    return Ok(Some((index, rule)));
                }
                RuleAction::Reject(_) | RuleAction::HijackDns => return Ok(Some((index, rule))),
            }
        }
        if !pre_match && metadata.destination.is_unspecified() {
            let action = SniffAction {
                override_destination: true,
                ..SniffAction::default()
            };
            self.sniff(metadata, conn, &action, label).await;
        }
        Ok(None)
    }

    async fn sniff(&self, metadata: &mut Metadata, conn: &mut Conn, action: &SniffAction, label: &str) {
        if sniff::skip(metadata) {
            trace!("[{}] sniff skipped", label);
            return;
        }
        let timeout = action.timeout_or(self.default_sniff_timeout);
        let sniffed = match std::mem::replace(conn, Conn::None) {
            Conn::Stream(mut strm) => {
                let mut buffer = BytesMut::new();
                let sniffed = sniff::peek_stream(&mut strm, &mut buffer, timeout, &action.stream_sniffers).await;
                *conn = Conn::Stream(CachedStream::wrap(strm, vec![buffer.freeze()]));
                sniffed
            }
            Conn::Packet(pkt) => {
                let (sniffed, cache) = peek_packets(&pkt, timeout, &action.packet_sniffers).await;
                *conn = Conn::Packet(CachedPktStream::wrap(pkt, cache));
                sniffed
            }
            Conn::None => return,
        };
        let sniffed = match sniffed {
            Some(sniffed) => sniffed,
            None => {
                trace!("[{}] sniffed nothing", label);
                return;
            }
        };
        debug!(
            "[{}] sniffed protocol: {}, domain: {}",
            label,
            sniffed.protocol,
            sniffed.domain.as_deref().unwrap_or("-")
        );
        let domain = sniffed.domain.clone();
        sniffed.apply(metadata);
        if !action.override_destination {
            return;
        }
        if let Some(domain) = domain.filter(|domain| model::is_domain_name(domain)) {
            if metadata.origin_destination.is_none() {
                metadata.origin_destination = Some(metadata.destination.clone());
            }
            metadata.destination = Address::Domain(domain, metadata.destination.port());
            metadata.destination_addresses.clear();
            debug!("[{}] override destination: {}", label, metadata.destination);
        }
    }

    async fn resolve(&self, metadata: &mut Metadata, action: &ResolveAction, label: &str) -> Result<()> {
        let domain = match metadata.destination.domain() {
            Some(domain) => domain.to_owned(),
            None => return Ok(()),
        };
        let resolver = self.resolver.as_ref().ok_or(Error::DnsNotConfigured)?;
        let addrs = resolver.lookup(&domain, &action.lookup_options()).await?;
        debug!("[{}] resolved {} => {:?}", label, domain, addrs);
        metadata.destination_addresses = addrs;
        Ok(())
    }
}

/// Reads datagrams until a sniffer decides or `timeout` elapses; every
/// packet read is returned for replay.
async fn peek_packets(
    pkt: &BoxedPktStream,
    timeout: Duration,
    sniffers: &[PacketSniffer],
) -> (Option<Sniffed>, Vec<(Bytes, Address)>) {
    let deadline = Instant::now() + timeout;
    let mut cache = vec![];
    let mut buf = vec![0u8; PACKET_BUFFER_SIZE];
    loop {
        let (size, addr) = match tokio::time::timeout_at(deadline, pkt.recv_from(&mut buf)).await {
            Err(_) => return (None, cache),
            Ok(Err(err)) => {
                debug!("read packet while sniffing: {}", err);
                return (None, cache);
            }
            Ok(Ok(received)) => received,
        };
        let packet = Bytes::copy_from_slice(&buf[..size]);
        let result = sniff::sniff_packet(&packet, sniffers);
        cache.push((packet, addr));
        match result {
            SniffResult::Matched(sniffed) => return (Some(sniffed), cache),
            SniffResult::NoMatch => return (None, cache),
            SniffResult::NeedMoreData => {}
        }
    }
}

fn log_route_error(label: &str, err: &Error) {
    if err.is_rejected() {
        info!("[{}] {}", label, err);
    } else {
        error!("[{}] {}", label, err);
    }
}
