use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;
use log::*;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::dialer::{InterfaceType, NetworkStrategy};
use crate::dns::{DomainStrategy, LookupOptions};
use crate::error::{Error, Result};
use crate::model::Address;
use crate::rule::format::ActionOptions;
use crate::sniff::{self, PacketSniffer, StreamSniffer};

const REJECT_FLOOD_WINDOW: Duration = Duration::from_secs(30);
const REJECT_FLOOD_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RejectMethod {
    /// reset the connection
    #[default]
    Default,
    Drop,
    /// answer with a protocol level refusal where the inbound supports it
    Reply,
}

impl fmt::Display for RejectMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RejectMethod::Default => write!(f, "reset"),
            RejectMethod::Drop => write!(f, "drop"),
            RejectMethod::Reply => write!(f, "reply"),
        }
    }
}

impl FromStr for RejectMethod {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "default" => Ok(RejectMethod::Default),
            "drop" => Ok(RejectMethod::Drop),
            "reply" => Ok(RejectMethod::Reply),
            _ => Err(Error::config_fmt(format_args!("unknown reject method: {}", s))),
        }
    }
}

/// Per-flow overrides carried by `route` and `route-options` actions.
///
/// Only the fields that are set are merged into the metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteOptions {
    pub override_address: Option<Address>,
    pub override_port: Option<u16>,
    pub network_strategy: Option<NetworkStrategy>,
    pub network_type: Vec<InterfaceType>,
    pub fallback_network_type: Vec<InterfaceType>,
    pub fallback_delay: Option<Duration>,
    pub udp_disable_domain_unmapping: bool,
    pub udp_connect: bool,
    pub udp_timeout: Option<Duration>,
    pub tls_fragment: bool,
    pub tls_fragment_fallback_delay: Option<Duration>,
    pub tls_record_fragment: bool,
}

impl RouteOptions {
    fn from_options(options: &ActionOptions) -> Result<Self> {
        let override_address = match options.override_address.as_deref() {
            None | Some("") => None,
            Some(host) => Some(Address::from_host(host, 0)),
        };
        Ok(Self {
            override_address,
            override_port: options.override_port.filter(|port| *port != 0),
            network_strategy: options.network_strategy,
            network_type: options.network_type.to_vec(),
            fallback_network_type: options.fallback_network_type.to_vec(),
            fallback_delay: options.fallback_delay,
            udp_disable_domain_unmapping: options.udp_disable_domain_unmapping,
            udp_connect: options.udp_connect,
            udp_timeout: options.udp_timeout,
            tls_fragment: options.tls_fragment,
            tls_fragment_fallback_delay: options.tls_fragment_fallback_delay,
            tls_record_fragment: options.tls_record_fragment,
        })
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    fn descriptions(&self) -> Vec<String> {
        let mut desc = vec![];
        if let Some(address) = &self.override_address {
            desc.push(format!("override-address={}", address.host()));
        }
        if let Some(port) = self.override_port {
            desc.push(format!("override-port={}", port));
        }
        if let Some(strategy) = self.network_strategy {
            desc.push(format!("network-strategy={:?}", strategy).to_lowercase());
        }
        if !self.network_type.is_empty() {
            desc.push(format!("network-type={:?}", self.network_type).to_lowercase());
        }
        if !self.fallback_network_type.is_empty() {
            desc.push(format!("fallback-network-type={:?}", self.fallback_network_type).to_lowercase());
        }
        if let Some(delay) = self.fallback_delay {
            desc.push(format!("fallback-delay={}", humantime::format_duration(delay)));
        }
        if self.udp_disable_domain_unmapping {
            desc.push("udp-disable-domain-unmapping".into());
        }
        if self.udp_connect {
            desc.push("udp-connect".into());
        }
        if let Some(timeout) = self.udp_timeout {
            desc.push(format!("udp-timeout={}", humantime::format_duration(timeout)));
        }
        if self.tls_fragment {
            desc.push("tls-fragment".into());
        }
        if self.tls_record_fragment {
            desc.push("tls-record-fragment".into());
        }
        desc
    }
}

#[derive(Debug)]
pub struct RejectAction {
    pub method: RejectMethod,
    pub no_drop: bool,
    rejected_at: Mutex<VecDeque<Instant>>,
}

impl RejectAction {
    pub fn new(method: RejectMethod, no_drop: bool) -> Self {
        Self {
            method,
            no_drop,
            rejected_at: Mutex::new(VecDeque::new()),
        }
    }

    /// Error the flow is closed with, `None` when the inbound should reply.
    ///
    /// Unless `no_drop` is set, a rule rejecting more than 50 flows within
    /// 30 seconds starts dropping them instead.
    pub fn error(&self) -> Option<Error> {
        let method = match self.method {
            RejectMethod::Reply => return None,
            RejectMethod::Drop => RejectMethod::Drop,
            RejectMethod::Default if self.no_drop => RejectMethod::Default,
            RejectMethod::Default => {
                let now = Instant::now();
                let mut rejected_at = self.rejected_at.lock();
                while let Some(front) = rejected_at.front() {
                    if now.duration_since(*front) <= REJECT_FLOOD_WINDOW {
                        break;
                    }
                    rejected_at.pop_front();
                }
                rejected_at.push_back(now);
                if rejected_at.len() > REJECT_FLOOD_LIMIT {
                    debug!("dropped due to flooding");
                    RejectMethod::Drop
                } else {
                    RejectMethod::Default
                }
            }
        };
        Some(Error::rejected(method))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SniffAction {
    /// configured names, empty for every sniffer
    pub names: Vec<String>,
    pub stream_sniffers: Vec<StreamSniffer>,
    pub packet_sniffers: Vec<PacketSniffer>,
    pub timeout: Option<Duration>,
    pub override_destination: bool,
}

impl Default for SniffAction {
    fn default() -> Self {
        Self {
            names: vec![],
            stream_sniffers: StreamSniffer::ALL.to_vec(),
            packet_sniffers: PacketSniffer::ALL.to_vec(),
            timeout: None,
            override_destination: false,
        }
    }
}

impl SniffAction {
    pub fn new(names: Vec<String>, timeout: Option<Duration>, override_destination: bool) -> Result<Self> {
        let (stream_sniffers, packet_sniffers) = sniff::parse_sniffers(&names)?;
        Ok(Self {
            names,
            stream_sniffers,
            packet_sniffers,
            timeout,
            override_destination,
        })
    }

    pub fn timeout_or(&self, default: Duration) -> Duration {
        self.timeout.filter(|t| !t.is_zero()).unwrap_or(default)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveAction {
    pub server: Option<String>,
    pub strategy: DomainStrategy,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<IpNet>,
}

impl ResolveAction {
    pub fn lookup_options(&self) -> LookupOptions {
        LookupOptions {
            strategy: self.strategy,
            server: self.server.clone(),
            disable_cache: self.disable_cache,
            rewrite_ttl: self.rewrite_ttl,
            client_subnet: self.client_subnet,
        }
    }
}

/// What a matched rule does with the flow.
#[derive(Debug)]
pub enum RuleAction {
    Route {
        outbound: String,
        options: RouteOptions,
    },
    RouteOptions(RouteOptions),
    Reject(RejectAction),
    HijackDns,
    Sniff(SniffAction),
    Resolve(ResolveAction),
}

impl RuleAction {
    /// Builds the action of a route rule; `route` needs an outbound.
    pub fn from_options(options: &ActionOptions) -> Result<Self> {
        let action = match options.action.as_deref().unwrap_or("route") {
            "" | "route" => {
                let outbound = options
                    .outbound
                    .clone()
                    .filter(|tag| !tag.is_empty())
                    .ok_or_else(|| Error::config("missing outbound field"))?;
                RuleAction::Route {
                    outbound,
                    options: RouteOptions::from_options(options)?,
                }
            }
            "route-options" => RuleAction::RouteOptions(RouteOptions::from_options(options)?),
            "reject" => {
                let method = options.method.as_deref().unwrap_or_default().parse()?;
                RuleAction::Reject(RejectAction::new(method, options.no_drop))
            }
            "hijack-dns" => RuleAction::HijackDns,
            "sniff" => RuleAction::Sniff(SniffAction::new(
                options.sniffer.to_vec(),
                options.timeout,
                options.override_destination,
            )?),
            "resolve" => RuleAction::Resolve(ResolveAction {
                server: options.server.clone().filter(|s| !s.is_empty()),
                strategy: options.strategy.unwrap_or_default(),
                disable_cache: options.disable_cache,
                rewrite_ttl: options.rewrite_ttl,
                client_subnet: options.client_subnet.map(|cidr| cidr.0),
            }),
            other => {
                return Err(Error::config_fmt(format_args!("unknown rule action: {}", other)));
            }
        };
        Ok(action)
    }

    /// route, reject and hijack-dns end rule evaluation
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RuleAction::Route { .. } | RuleAction::Reject(_) | RuleAction::HijackDns
        )
    }

    pub fn route_options(&self) -> Option<&RouteOptions> {
        match self {
            RuleAction::Route { options, .. } | RuleAction::RouteOptions(options) => Some(options),
            _ => None,
        }
    }
}

impl fmt::Display for RuleAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RuleAction::Route { outbound, options } => {
                let mut desc = vec![outbound.clone()];
                desc.extend(options.descriptions());
                write!(f, "route({})", desc.join(","))
            }
            RuleAction::RouteOptions(options) => {
                write!(f, "route-options({})", options.descriptions().join(","))
            }
            RuleAction::Reject(reject) => match reject.method {
                RejectMethod::Default => write!(f, "reject"),
                method => write!(f, "reject({})", method),
            },
            RuleAction::HijackDns => write!(f, "hijack-dns"),
            RuleAction::Sniff(sniff) => {
                let mut desc = sniff.names.clone();
                if let Some(timeout) = sniff.timeout {
                    desc.push(humantime::format_duration(timeout).to_string());
                }
                if desc.is_empty() {
                    write!(f, "sniff")
                } else {
                    write!(f, "sniff({})", desc.join(","))
                }
            }
            RuleAction::Resolve(resolve) => {
                let mut desc = vec![];
                if let Some(server) = &resolve.server {
                    desc.push(server.clone());
                }
                if resolve.strategy != DomainStrategy::AsIs {
                    desc.push(format!("{:?}", resolve.strategy).to_lowercase());
                }
                if desc.is_empty() {
                    write!(f, "resolve")
                } else {
                    write!(f, "resolve({})", desc.join(","))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(yaml: &str) -> Result<RuleAction> {
        let options: ActionOptions = serde_yaml::from_str(yaml).unwrap();
        RuleAction::from_options(&options)
    }

    #[test]
    fn route_needs_outbound() {
        let err = action("action: route").unwrap_err();
        assert_eq!(err.to_string(), "config error: missing outbound field");
        let route = action("outbound: proxy\noverride_port: 8443").unwrap();
        assert!(route.is_terminal());
        assert_eq!(route.to_string(), "route(proxy,override-port=8443)");
        assert_eq!(route.route_options().unwrap().override_port, Some(8443));
    }

    #[test]
    fn descriptions() {
        assert_eq!(action("action: hijack-dns").unwrap().to_string(), "hijack-dns");
        assert_eq!(action("action: reject").unwrap().to_string(), "reject");
        assert_eq!(
            action("action: reject\nmethod: drop").unwrap().to_string(),
            "reject(drop)"
        );
        assert_eq!(action("action: sniff").unwrap().to_string(), "sniff");
        assert_eq!(
            action("action: sniff\nsniffer: [tls, http]\ntimeout: 1s")
                .unwrap()
                .to_string(),
            "sniff(tls,http,1s)"
        );
        assert_eq!(
            action("action: resolve\nstrategy: ipv4_only").unwrap().to_string(),
            "resolve(ipv4only)"
        );
    }

    #[test]
    fn non_terminal_actions() {
        assert!(!action("action: sniff").unwrap().is_terminal());
        assert!(!action("action: resolve").unwrap().is_terminal());
        assert!(!action("action: route-options\nudp_timeout: 1m")
            .unwrap()
            .is_terminal());
    }

    #[test]
    fn unknown_names() {
        assert!(action("action: teleport").is_err());
        assert!(action("action: reject\nmethod: shout").is_err());
        assert_eq!(
            action("action: sniff\nsniffer: gopher").unwrap_err().to_string(),
            "config error: unknown sniffer: gopher"
        );
    }

    #[test]
    fn reply_is_not_an_error() {
        let reject = RejectAction::new(RejectMethod::Reply, false);
        assert!(reject.error().is_none());
        let reject = RejectAction::new(RejectMethod::Drop, false);
        assert_eq!(reject.error().unwrap().to_string(), "rejected: drop");
    }

    #[tokio::test(start_paused = true)]
    async fn flooding_turns_into_drop() {
        let reject = RejectAction::new(RejectMethod::Default, false);
        for _ in 0..REJECT_FLOOD_LIMIT {
            assert!(matches!(
                reject.error(),
                Some(Error::Rejected {
                    method: RejectMethod::Default
                })
            ));
        }
        assert!(matches!(
            reject.error(),
            Some(Error::Rejected {
                method: RejectMethod::Drop
            })
        ));

        tokio::time::advance(REJECT_FLOOD_WINDOW + Duration::from_secs(1)).await;
        assert!(matches!(
            reject.error(),
            Some(Error::Rejected {
                method: RejectMethod::Default
            })
        ));
    }

    #[test]
    fn no_drop_never_floods() {
        let reject = RejectAction::new(RejectMethod::Default, true);
        for _ in 0..=REJECT_FLOOD_LIMIT * 2 {
            assert!(matches!(
                reject.error(),
                Some(Error::Rejected {
                    method: RejectMethod::Default
                })
            ));
        }
    }
}
