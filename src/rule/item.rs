use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use regex::Regex;

use crate::error::{Error, Result};
use crate::geoip::{GeoIpReader, GeositeItem, GeositeReader};
use crate::metadata::Metadata;
use crate::model::{normalize_domain, Network};
use crate::rule::Matcher;
use crate::rule_set::RuleSet;

/// exact names and suffixes, matched against the normalized domain
#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    domains: HashSet<String>,
    /// suffix with a leading dot: subdomains only
    suffixes: Vec<String>,
}

impl DomainMatcher {
    pub fn new<S: AsRef<str>>(domains: &[S], suffixes: &[S]) -> Self {
        let mut matcher = Self::default();
        for domain in domains {
            matcher.domains.insert(normalize_domain(domain.as_ref()));
        }
        for suffix in suffixes {
            let suffix = normalize_domain(suffix.as_ref());
            if suffix.starts_with('.') {
                matcher.suffixes.push(suffix);
            } else {
                matcher.suffixes.push(format!(".{}", suffix));
                matcher.domains.insert(suffix);
            }
        }
        matcher
    }

    pub fn r#match(&self, domain: &str) -> bool {
        let domain = normalize_domain(domain);
        self.domains.contains(&domain) || self.suffixes.iter().any(|s| domain.ends_with(s.as_str()))
    }

    fn is_empty(&self) -> bool {
        self.domains.is_empty() && self.suffixes.is_empty()
    }
}

/// Inclusive port range from `a:b`, `a:` or `:b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn parse(s: &str) -> Result<Self> {
        let bad = || Error::config_fmt(format_args!("bad port range: {}", s));
        let (start, end) = s.split_once(':').ok_or_else(bad)?;
        let start = match start.trim() {
            "" => 0,
            start => start.parse().map_err(|_| bad())?,
        };
        let end = match end.trim() {
            "" => u16::MAX,
            end => end.parse().map_err(|_| bad())?,
        };
        if start > end {
            return Err(bad());
        }
        Ok(Self { start, end })
    }

    fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }
}

/// Loopback, link-local, private, CGNAT, unique-local and other addresses that
/// are not routed on the public internet.
pub fn is_private_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                || v4.is_multicast()
                || (a == 100 && (64..128).contains(&b))
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_private_ip(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Code reported for private addresses, before the reader is asked.
const GEOIP_PRIVATE: &str = "private";

fn geoip_code(reader: &dyn GeoIpReader, addr: IpAddr) -> Option<String> {
    if is_private_ip(addr) {
        Some(GEOIP_PRIVATE.to_owned())
    } else {
        reader.lookup(addr)
    }
}

/// The rule-sets referenced by a rule, with the ip-cidr flags they are
/// matched under.
#[derive(Debug, Clone)]
pub struct RuleSetItem {
    pub tags: Vec<String>,
    sets: Vec<Arc<RuleSet>>,
    ip_cidr_match_source: bool,
    ip_cidr_accept_empty: bool,
}

impl RuleSetItem {
    pub fn new(sets: Vec<Arc<RuleSet>>, ip_cidr_match_source: bool, ip_cidr_accept_empty: bool) -> Self {
        Self {
            tags: sets.iter().map(|set| set.tag().to_owned()).collect(),
            sets,
            ip_cidr_match_source,
            ip_cidr_accept_empty,
        }
    }

    pub fn sets(&self) -> &[Arc<RuleSet>] {
        &self.sets
    }

    fn r#match(&self, metadata: &mut Metadata) -> bool {
        metadata.ip_cidr_match_source = self.ip_cidr_match_source;
        metadata.ip_cidr_accept_empty = self.ip_cidr_accept_empty;
        let matched = self.sets.iter().any(|set| set.r#match(metadata));
        metadata.ip_cidr_match_source = false;
        metadata.ip_cidr_accept_empty = false;
        matched
    }
}

/// One predicate of a default rule.
#[derive(Debug, Clone)]
pub enum RuleItem {
    Inbound(Vec<String>),
    IpVersion(u8),
    Network(Vec<Network>),
    AuthUser(Vec<String>),
    Protocol(Vec<String>),
    Client(Vec<String>),
    Domain(DomainMatcher),
    DomainKeyword(Vec<String>),
    DomainRegex(Vec<Regex>),
    GeoIp {
        source: bool,
        codes: Vec<String>,
        reader: Arc<dyn GeoIpReader>,
    },
    IpCidr {
        source: bool,
        nets: Vec<IpNet>,
    },
    IpIsPrivate {
        source: bool,
    },
    Port {
        source: bool,
        ports: Vec<u16>,
    },
    PortRange {
        source: bool,
        ranges: Vec<PortRange>,
    },
    ProcessName(Vec<String>),
    ProcessPath(Vec<String>),
    ProcessPathRegex(Vec<Regex>),
    PackageName(Vec<String>),
    User(Vec<String>),
    UserId(Vec<u32>),
    WifiSsid(Vec<String>),
    WifiBssid(Vec<String>),
    RuleSet(RuleSetItem),
}

impl RuleItem {
    pub fn ip_version(version: u8) -> Result<Self> {
        match version {
            4 | 6 => Ok(RuleItem::IpVersion(version)),
            _ => Err(Error::config_fmt(format_args!("invalid ip version: {}", version))),
        }
    }

    pub fn port_range(source: bool, ranges: &[String]) -> Result<Self> {
        Ok(RuleItem::PortRange {
            source,
            ranges: ranges
                .iter()
                .map(|range| PortRange::parse(range))
                .collect::<Result<_>>()?,
        })
    }

    /// Domain items of a geosite category; one item per non-empty kind.
    pub fn geosite(reader: &dyn GeositeReader, codes: &[String]) -> Result<Vec<Self>> {
        let mut domains = vec![];
        let mut suffixes = vec![];
        let mut keywords = vec![];
        let mut regexes = vec![];
        for code in codes {
            let entries = reader
                .read(code)
                .ok_or_else(|| Error::config_fmt(format_args!("geosite code not found: {}", code)))?;
            for entry in entries {
                match entry {
                    GeositeItem::Domain(domain) => domains.push(domain),
                    GeositeItem::Suffix(suffix) => suffixes.push(suffix),
                    GeositeItem::Keyword(keyword) => keywords.push(keyword),
                    GeositeItem::Regex(pattern) => regexes.push(Regex::new(&pattern).map_err(|err| {
                        Error::config_fmt(format_args!("geosite {}: {}", code, err))
                    })?),
                }
            }
        }
        let mut items = vec![];
        let matcher = DomainMatcher::new(domains.as_slice(), suffixes.as_slice());
        if !matcher.is_empty() {
            items.push(RuleItem::Domain(matcher));
        }
        if !keywords.is_empty() {
            items.push(RuleItem::DomainKeyword(keywords));
        }
        if !regexes.is_empty() {
            items.push(RuleItem::DomainRegex(regexes));
        }
        Ok(items)
    }

    pub fn is_process_item(&self) -> bool {
        matches!(
            self,
            RuleItem::ProcessName(_)
                | RuleItem::ProcessPath(_)
                | RuleItem::ProcessPathRegex(_)
                | RuleItem::PackageName(_)
                | RuleItem::User(_)
                | RuleItem::UserId(_)
        ) || self.rule_sets().iter().any(|set| set.metadata().contains_process_rule)
    }

    pub fn is_wifi_item(&self) -> bool {
        matches!(self, RuleItem::WifiSsid(_) | RuleItem::WifiBssid(_))
            || self.rule_sets().iter().any(|set| set.metadata().contains_wifi_rule)
    }

    pub fn is_ip_cidr_item(&self) -> bool {
        matches!(self, RuleItem::IpCidr { .. } | RuleItem::IpIsPrivate { .. })
            || self.rule_sets().iter().any(|set| set.metadata().contains_ip_cidr_rule)
    }

    pub(crate) fn rule_sets(&self) -> &[Arc<RuleSet>] {
        match self {
            RuleItem::RuleSet(item) => item.sets(),
            _ => &[],
        }
    }

    fn destination_ips(metadata: &Metadata) -> Vec<IpAddr> {
        match metadata.destination.ip() {
            Some(ip) => vec![ip],
            None => metadata.destination_addresses.clone(),
        }
    }
}

impl Matcher for RuleItem {
    fn r#match(&self, metadata: &mut Metadata) -> bool {
        use RuleItem::*;
        match self {
            Inbound(tags) => tags.contains(&metadata.inbound),
            IpVersion(version) => metadata.ip_version == Some(*version),
            Network(networks) => networks.contains(&metadata.network),
            AuthUser(users) => metadata.user.as_ref().map_or(false, |user| users.contains(user)),
            Protocol(protocols) => metadata
                .protocol
                .as_ref()
                .map_or(false, |protocol| protocols.contains(protocol)),
            Client(clients) => metadata
                .client
                .as_ref()
                .map_or(false, |client| clients.contains(client)),
            Domain(matcher) => metadata.match_domain().map_or(false, |domain| matcher.r#match(domain)),
            DomainKeyword(keywords) => metadata.match_domain().map_or(false, |domain| {
                let domain = normalize_domain(domain);
                keywords.iter().any(|keyword| domain.contains(keyword.as_str()))
            }),
            DomainRegex(regexes) => metadata.match_domain().map_or(false, |domain| {
                let domain = normalize_domain(domain);
                regexes.iter().any(|regex| regex.is_match(&domain))
            }),
            GeoIp {
                source: true,
                codes,
                reader,
            } => {
                if metadata.source_geoip_code.is_none() {
                    metadata.source_geoip_code = geoip_code(reader.as_ref(), metadata.source.ip());
                }
                metadata
                    .source_geoip_code
                    .as_ref()
                    .map_or(false, |code| codes.contains(code))
            }
            GeoIp {
                source: false,
                codes,
                reader,
            } => match metadata.destination.ip() {
                Some(ip) => {
                    if metadata.geoip_code.is_none() {
                        metadata.geoip_code = geoip_code(reader.as_ref(), ip);
                    }
                    metadata.geoip_code.as_ref().map_or(false, |code| codes.contains(code))
                }
                None => metadata
                    .destination_addresses
                    .iter()
                    .filter_map(|addr| geoip_code(reader.as_ref(), *addr))
                    .any(|code| codes.contains(&code)),
            },
            IpCidr { source, nets } => {
                if *source || metadata.ip_cidr_match_source {
                    let ip = metadata.source.ip();
                    return nets.iter().any(|net| net.contains(&ip));
                }
                let candidates = Self::destination_ips(metadata);
                if candidates.is_empty() {
                    return metadata.ip_cidr_accept_empty;
                }
                candidates.iter().any(|ip| nets.iter().any(|net| net.contains(ip)))
            }
            IpIsPrivate { source: true } => is_private_ip(metadata.source.ip()),
            IpIsPrivate { source: false } => Self::destination_ips(metadata)
                .into_iter()
                .any(is_private_ip),
            Port { source, ports } => {
                let port = if *source {
                    metadata.source.port()
                } else {
                    metadata.destination.port()
                };
                ports.contains(&port)
            }
            PortRange { source, ranges } => {
                let port = if *source {
                    metadata.source.port()
                } else {
                    metadata.destination.port()
                };
                ranges.iter().any(|range| range.contains(port))
            }
            ProcessName(names) => metadata
                .process_info
                .as_ref()
                .map_or(false, |info| names.iter().any(|name| name == info.process_name())),
            ProcessPath(paths) => metadata
                .process_info
                .as_ref()
                .map_or(false, |info| paths.contains(&info.process_path)),
            ProcessPathRegex(regexes) => metadata.process_info.as_ref().map_or(false, |info| {
                regexes.iter().any(|regex| regex.is_match(&info.process_path))
            }),
            PackageName(names) => metadata
                .process_info
                .as_ref()
                .map_or(false, |info| names.contains(&info.package_name)),
            User(users) => metadata
                .process_info
                .as_ref()
                .map_or(false, |info| users.contains(&info.user)),
            UserId(ids) => metadata
                .process_info
                .as_ref()
                .and_then(|info| info.user_id)
                .map_or(false, |uid| ids.contains(&uid)),
            WifiSsid(ssids) => metadata
                .wifi_ssid
                .as_ref()
                .map_or(false, |ssid| ssids.contains(ssid)),
            WifiBssid(bssids) => metadata
                .wifi_bssid
                .as_ref()
                .map_or(false, |bssid| bssids.iter().any(|b| b.eq_ignore_ascii_case(bssid))),
            RuleSet(item) => item.r#match(metadata),
        }
    }
}

fn join<T: fmt::Display>(values: &[T]) -> String {
    match values {
        [value] => value.to_string(),
        values => format!(
            "[{}]",
            values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
        ),
    }
}

impl fmt::Display for RuleItem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use RuleItem::*;
        let prefix = |source: bool| if source { "source_" } else { "" };
        match self {
            Inbound(tags) => write!(f, "inbound={}", join(tags)),
            IpVersion(version) => write!(f, "ip_version={}", version),
            Network(networks) => write!(f, "network={}", join(networks)),
            AuthUser(users) => write!(f, "auth_user={}", join(users)),
            Protocol(protocols) => write!(f, "protocol={}", join(protocols)),
            Client(clients) => write!(f, "client={}", join(clients)),
            Domain(matcher) => write!(
                f,
                "domain=[{} names, {} suffixes]",
                matcher.domains.len(),
                matcher.suffixes.len()
            ),
            DomainKeyword(keywords) => write!(f, "domain_keyword={}", join(keywords)),
            DomainRegex(regexes) => {
                let patterns: Vec<&str> = regexes.iter().map(Regex::as_str).collect();
                write!(f, "domain_regex={}", join(&patterns))
            }
            GeoIp { source, codes, .. } => write!(f, "{}geoip={}", prefix(*source), join(codes)),
            IpCidr { source, nets } => write!(f, "{}ip_cidr={}", prefix(*source), join(nets)),
            IpIsPrivate { source } => write!(f, "{}ip_is_private", prefix(*source)),
            Port { source, ports } => write!(f, "{}port={}", prefix(*source), join(ports)),
            PortRange { source, ranges } => {
                let ranges: Vec<String> = ranges
                    .iter()
                    .map(|range| format!("{}:{}", range.start, range.end))
                    .collect();
                write!(f, "{}port_range={}", prefix(*source), join(&ranges))
            }
            ProcessName(names) => write!(f, "process_name={}", join(names)),
            ProcessPath(paths) => write!(f, "process_path={}", join(paths)),
            ProcessPathRegex(regexes) => {
                let patterns: Vec<&str> = regexes.iter().map(Regex::as_str).collect();
                write!(f, "process_path_regex={}", join(&patterns))
            }
            PackageName(names) => write!(f, "package_name={}", join(names)),
            User(users) => write!(f, "user={}", join(users)),
            UserId(ids) => write!(f, "user_id={}", join(ids)),
            WifiSsid(ssids) => write!(f, "wifi_ssid={}", join(ssids)),
            WifiBssid(bssids) => write!(f, "wifi_bssid={}", join(bssids)),
            RuleSet(item) => write!(f, "rule_set={}", join(&item.tags)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geoip::test::{StaticGeoIp, StaticGeosite};
    use crate::process::ProcessInfo;

    fn metadata(destination: &str) -> Metadata {
        Metadata::new(
            Network::Tcp,
            "192.168.1.10:40000".parse().unwrap(),
            destination.parse().unwrap(),
        )
    }

    fn nets(nets: &[&str]) -> Vec<IpNet> {
        nets.iter().map(|n| n.parse().unwrap()).collect()
    }

    #[test]
    fn domain_suffix_forms() {
        let matcher = DomainMatcher::new(&["exact.org"], &["example.com", ".sub.net"]);
        assert!(matcher.r#match("example.com"));
        assert!(matcher.r#match("www.Example.com."));
        assert!(!matcher.r#match("badexample.com"));
        assert!(matcher.r#match("a.sub.net"));
        assert!(!matcher.r#match("sub.net"));
        assert!(matcher.r#match("exact.org"));
        assert!(!matcher.r#match("www.exact.org"));
    }

    #[test]
    fn domain_items_prefer_sniffed_domain() {
        let item = RuleItem::Domain(DomainMatcher::new::<&str>(&[], &["example.com"]));
        let mut m = metadata("1.2.3.4:443");
        assert!(!item.r#match(&mut m));
        m.domain = Some("cdn.example.com".into());
        assert!(item.r#match(&mut m));

        let keyword = RuleItem::DomainKeyword(vec!["ample".into()]);
        assert!(keyword.r#match(&mut m));
        let regex = RuleItem::DomainRegex(vec![Regex::new(r"^cdn\.").unwrap()]);
        assert!(regex.r#match(&mut m));
    }

    #[test]
    fn port_ranges() {
        assert_eq!(PortRange::parse("1000:2000").unwrap(), PortRange { start: 1000, end: 2000 });
        assert_eq!(PortRange::parse(":80").unwrap(), PortRange { start: 0, end: 80 });
        assert_eq!(PortRange::parse("8000:").unwrap(), PortRange { start: 8000, end: 65535 });
        assert!(PortRange::parse("80").is_err());
        assert!(PortRange::parse("90:80").is_err());

        let item = RuleItem::port_range(false, &["400:500".into()]).unwrap();
        assert!(item.r#match(&mut metadata("example.com:443")));
        let item = RuleItem::port_range(true, &["400:500".into()]).unwrap();
        assert!(!item.r#match(&mut metadata("example.com:443")));
    }

    #[test]
    fn ip_cidr_candidates() {
        let item = RuleItem::IpCidr {
            source: false,
            nets: nets(&["93.184.0.0/16"]),
        };
        assert!(item.r#match(&mut metadata("93.184.216.34:443")));

        let mut m = metadata("example.com:443");
        assert!(!item.r#match(&mut m));
        m.ip_cidr_accept_empty = true;
        assert!(item.r#match(&mut m));
        m.ip_cidr_accept_empty = false;
        m.destination_addresses = vec!["10.0.0.1".parse().unwrap(), "93.184.216.34".parse().unwrap()];
        assert!(item.r#match(&mut m));

        let source = RuleItem::IpCidr {
            source: true,
            nets: nets(&["192.168.0.0/16"]),
        };
        assert!(source.r#match(&mut m));
        let dest = RuleItem::IpCidr {
            source: false,
            nets: nets(&["192.168.0.0/16"]),
        };
        assert!(!dest.r#match(&mut m));
        m.ip_cidr_match_source = true;
        assert!(dest.r#match(&mut m));
    }

    #[test]
    fn private_addresses() {
        for ip in ["10.1.1.1", "127.0.0.1", "100.64.0.1", "169.254.1.1", "fd00::1", "fe80::1", "::1"] {
            assert!(is_private_ip(ip.parse().unwrap()), "{}", ip);
        }
        for ip in ["1.1.1.1", "100.128.0.1", "2606:4700::1111"] {
            assert!(!is_private_ip(ip.parse().unwrap()), "{}", ip);
        }
        assert!(RuleItem::IpIsPrivate { source: true }.r#match(&mut metadata("1.1.1.1:53")));
        assert!(!RuleItem::IpIsPrivate { source: false }.r#match(&mut metadata("1.1.1.1:53")));
    }

    #[test]
    fn geoip_code_is_cached() {
        let reader = Arc::new(StaticGeoIp {
            entries: vec![("1.0.0.0/8".parse().unwrap(), "au".into())],
        });
        let item = RuleItem::GeoIp {
            source: false,
            codes: vec!["au".into()],
            reader: reader.clone(),
        };
        let mut m = metadata("1.1.1.1:443");
        assert!(item.r#match(&mut m));
        assert_eq!(m.geoip_code.as_deref(), Some("au"));

        let source = RuleItem::GeoIp {
            source: true,
            codes: vec!["private".into()],
            reader,
        };
        assert!(source.r#match(&mut m));
        assert_eq!(m.source_geoip_code.as_deref(), Some("private"));
    }

    #[test]
    fn geosite_expansion() {
        let mut geosite = StaticGeosite::default();
        geosite.sites.insert(
            "ads".into(),
            vec![
                GeositeItem::Suffix("ads.example".into()),
                GeositeItem::Keyword("tracker".into()),
            ],
        );
        let items = RuleItem::geosite(&geosite, &["ads".into()]).unwrap();
        assert_eq!(items.len(), 2);
        let mut m = metadata("x.ads.example:443");
        assert!(items[0].r#match(&mut m));
        assert!(RuleItem::geosite(&geosite, &["nope".into()]).is_err());
    }

    #[test]
    fn process_items() {
        let mut m = metadata("example.com:443");
        let name = RuleItem::ProcessName(vec!["curl".into()]);
        assert!(!name.r#match(&mut m));
        m.process_info = Some(ProcessInfo {
            process_path: "/usr/bin/curl".into(),
            user_id: Some(1000),
            ..ProcessInfo::default()
        });
        assert!(name.r#match(&mut m));
        assert!(RuleItem::UserId(vec![1000]).r#match(&mut m));
        assert!(RuleItem::ProcessPathRegex(vec![Regex::new("^/usr/").unwrap()]).r#match(&mut m));
        assert!(name.is_process_item());
    }

    #[test]
    fn ip_version_values() {
        assert!(RuleItem::ip_version(5).is_err());
        let item = RuleItem::ip_version(6).unwrap();
        let mut m = metadata("[::1]:53");
        assert!(!item.r#match(&mut m));
        m.ip_version = Some(6);
        assert!(item.r#match(&mut m));
    }

    #[test]
    fn descriptions() {
        assert_eq!(RuleItem::Port { source: false, ports: vec![443] }.to_string(), "port=443");
        assert_eq!(
            RuleItem::Network(vec![Network::Tcp, Network::Udp]).to_string(),
            "network=[tcp udp]"
        );
        assert_eq!(RuleItem::IpIsPrivate { source: true }.to_string(), "source_ip_is_private");
    }
}
