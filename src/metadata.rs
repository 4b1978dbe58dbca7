use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use log::*;

use crate::dialer::{InterfaceType, NetworkStrategy};
use crate::model::{Address, Network};
use crate::process::ProcessInfo;
use crate::rule::action::RouteOptions;

/// Scratch flags written while one rule is evaluated.
///
/// Reset before every top-level rule test and before every sub-rule of a
/// logical rule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleCache {
    pub source_address_match: bool,
    pub source_port_match: bool,
    pub destination_address_match: bool,
    pub destination_port_match: bool,
    pub did_match: bool,
}

/// Per-flow routing record.
///
/// Owned by the dispatch path: the router takes it by value, mutates it while
/// walking the rules, then moves it into the dispatcher. Byte counters live in
/// [`crate::relay::Traffic`], not here.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub network: Network,
    /// inbound tag
    pub inbound: String,
    pub inbound_type: String,
    pub ip_version: Option<u8>,
    pub source: SocketAddr,
    pub destination: Address,
    /// destination before the first override or fake-ip unmapping
    pub origin_destination: Option<Address>,
    /// filled by the resolve action
    pub destination_addresses: Vec<IpAddr>,
    /// authenticated inbound user
    pub user: Option<String>,

    pub protocol: Option<String>,
    pub domain: Option<String>,
    pub client: Option<String>,

    pub process_info: Option<ProcessInfo>,
    pub source_geoip_code: Option<String>,
    pub geoip_code: Option<String>,
    pub fake_ip: bool,
    pub wifi_ssid: Option<String>,
    pub wifi_bssid: Option<String>,

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

    pub(crate) ip_cidr_match_source: bool,
    pub(crate) ip_cidr_accept_empty: bool,
    pub(crate) rule_cache: RuleCache,
}

impl Metadata {
    pub fn new(network: Network, source: SocketAddr, destination: Address) -> Self {
        Self {
            network,
            inbound: String::new(),
            inbound_type: String::new(),
            ip_version: None,
            source,
            destination,
            origin_destination: None,
            destination_addresses: vec![],
            user: None,
            protocol: None,
            domain: None,
            client: None,
            process_info: None,
            source_geoip_code: None,
            geoip_code: None,
            fake_ip: false,
            wifi_ssid: None,
            wifi_bssid: None,
            network_strategy: None,
            network_type: vec![],
            fallback_network_type: vec![],
            fallback_delay: None,
            udp_disable_domain_unmapping: false,
            udp_connect: false,
            udp_timeout: None,
            tls_fragment: false,
            tls_fragment_fallback_delay: None,
            tls_record_fragment: false,
            ip_cidr_match_source: false,
            ip_cidr_accept_empty: false,
            rule_cache: RuleCache::default(),
        }
    }

    pub fn set_inbound<S: Into<String>>(&mut self, tag: S, kind: S) -> &mut Self {
        self.inbound = tag.into();
        self.inbound_type = kind.into();
        self
    }

    pub fn set_user<S: Into<String>>(&mut self, user: S) -> &mut Self {
        self.user = Some(user.into());
        self
    }

    pub fn reset_rule_cache(&mut self) {
        self.rule_cache = RuleCache::default();
    }

    pub fn rule_cache(&self) -> RuleCache {
        self.rule_cache
    }

    /// Host name used by domain predicates: the sniffed domain when present,
    /// else the literal destination hostname.
    pub fn match_domain(&self) -> Option<&str> {
        self.domain
            .as_deref()
            .filter(|domain| !domain.is_empty())
            .or_else(|| self.destination.domain())
    }

    /// Merges a route-options payload; only fields the payload specifies are
    /// written.
    pub fn apply_route_options(&mut self, options: &RouteOptions) {
        if let Some(address) = &options.override_address {
            self.save_origin_destination();
            let port = self.destination.port();
            self.destination = address.with_port(port);
            self.destination_addresses.clear();
            debug!("override destination address: {}", self.destination);
        }
        if let Some(port) = options.override_port {
            self.save_origin_destination();
            self.destination = self.destination.with_port(port);
            debug!("override destination port: {}", port);
        }
        if let Some(strategy) = options.network_strategy {
            self.network_strategy = Some(strategy);
        }
        if !options.network_type.is_empty() {
            self.network_type = options.network_type.clone();
        }
        if !options.fallback_network_type.is_empty() {
            self.fallback_network_type = options.fallback_network_type.clone();
        }
        if let Some(delay) = options.fallback_delay {
            self.fallback_delay = Some(delay);
        }
        if options.udp_disable_domain_unmapping {
            self.udp_disable_domain_unmapping = true;
        }
        if options.udp_connect {
            self.udp_connect = true;
        }
        if let Some(timeout) = options.udp_timeout {
            self.udp_timeout = Some(timeout);
        }
        if options.tls_fragment {
            self.tls_fragment = true;
        }
        if let Some(delay) = options.tls_fragment_fallback_delay {
            self.tls_fragment_fallback_delay = Some(delay);
        }
        if options.tls_record_fragment {
            self.tls_record_fragment = true;
        }
    }

    fn save_origin_destination(&mut self) {
        if self.origin_destination.is_none() {
            self.origin_destination = Some(self.destination.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> Metadata {
        Metadata::new(
            Network::Tcp,
            "10.0.0.2:50000".parse().unwrap(),
            "example.com:443".parse().unwrap(),
        )
    }

    #[test]
    fn origin_saved_on_first_override_only() {
        let mut m = metadata();
        m.apply_route_options(&RouteOptions {
            override_port: Some(8443),
            ..RouteOptions::default()
        });
        assert_eq!(m.destination, "example.com:8443".parse().unwrap());
        m.apply_route_options(&RouteOptions {
            override_address: Some("1.1.1.1:0".parse().unwrap()),
            ..RouteOptions::default()
        });
        assert_eq!(m.destination, "1.1.1.1:8443".parse().unwrap());
        assert_eq!(m.origin_destination, Some("example.com:443".parse().unwrap()));
    }

    #[test]
    fn unspecified_options_keep_values() {
        let mut m = metadata();
        m.udp_timeout = Some(Duration::from_secs(9));
        m.apply_route_options(&RouteOptions {
            tls_fragment: true,
            ..RouteOptions::default()
        });
        assert_eq!(m.udp_timeout, Some(Duration::from_secs(9)));
        assert!(m.tls_fragment);
        assert!(m.origin_destination.is_none());
    }

    #[test]
    fn sniffed_domain_wins() {
        let mut m = metadata();
        assert_eq!(m.match_domain(), Some("example.com"));
        m.domain = Some("www.example.org".into());
        assert_eq!(m.match_domain(), Some("www.example.org"));
    }
}
