//! Configuration shapes of rules and rule actions.
//!
//! Every list field also accepts a single scalar:
//!
//! ```
//! # use switchyard::rule::format::HeadlessRuleOptions;
//! let rule: HeadlessRuleOptions = serde_yaml::from_str("domain_suffix: example.com").unwrap();
//! match rule {
//!     HeadlessRuleOptions::Default(rule) => assert_eq!(&rule.domain_suffix[..], ["example.com"]),
//!     _ => unreachable!(),
//! }
//! ```
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;
use regex::Regex;
use serde::*;

use crate::dialer::{InterfaceType, NetworkStrategy};
use crate::dns::DomainStrategy;
use crate::model::{IpAddr, Network};

/// One value or a list of values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listable<T>(pub Vec<T>);

impl<T> Default for Listable<T> {
    fn default() -> Self {
        Listable(vec![])
    }
}

impl<T> Deref for Listable<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.0
    }
}

impl<T> From<Vec<T>> for Listable<T> {
    fn from(values: Vec<T>) -> Self {
        Listable(values)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Listable<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum ListableDef<T> {
            One(T),
            Many(Vec<T>),
        }
        match ListableDef::deserialize(deserializer)? {
            ListableDef::One(value) => Ok(Listable(vec![value])),
            ListableDef::Many(values) => Ok(Listable(values)),
        }
    }
}

/// A network prefix; a bare address stands for a single host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr(pub IpNet);

impl FromStr for Cidr {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            s.parse::<IpNet>()
                .map(|net| Cidr(net.trunc()))
                .map_err(|err| format!("{}: {}", s, err))
        } else {
            s.parse::<IpAddr>()
                .map(|addr| Cidr(IpNet::from(addr)))
                .map_err(|err| format!("{}: {}", s, err))
        }
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?
            .parse()
            .map_err(de::Error::custom)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegexPattern(#[serde(with = "serde_regex")] pub Regex);

impl PartialEq for RegexPattern {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalMode {
    And,
    Or,
}

impl fmt::Display for LogicalMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogicalMode::And => write!(f, "and"),
            LogicalMode::Or => write!(f, "or"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DefaultRuleOptions {
    pub inbound: Listable<String>,
    pub ip_version: Option<u8>,
    pub network: Listable<Network>,
    pub auth_user: Listable<String>,
    pub protocol: Listable<String>,
    pub client: Listable<String>,
    pub domain: Listable<String>,
    pub domain_suffix: Listable<String>,
    pub domain_keyword: Listable<String>,
    pub domain_regex: Listable<RegexPattern>,
    pub geosite: Listable<String>,
    pub source_geoip: Listable<String>,
    pub geoip: Listable<String>,
    pub source_ip_cidr: Listable<Cidr>,
    pub source_ip_is_private: bool,
    pub ip_cidr: Listable<Cidr>,
    pub ip_is_private: bool,
    pub source_port: Listable<u16>,
    pub source_port_range: Listable<String>,
    pub port: Listable<u16>,
    pub port_range: Listable<String>,
    pub process_name: Listable<String>,
    pub process_path: Listable<String>,
    pub process_path_regex: Listable<RegexPattern>,
    pub package_name: Listable<String>,
    pub user: Listable<String>,
    pub user_id: Listable<u32>,
    pub wifi_ssid: Listable<String>,
    pub wifi_bssid: Listable<String>,
    pub rule_set: Listable<String>,
    pub rule_set_ip_cidr_match_source: bool,
    pub rule_set_ip_cidr_accept_empty: bool,
    pub invert: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogicalRuleOptions {
    pub mode: LogicalMode,
    pub rules: Vec<HeadlessRuleOptions>,
    pub invert: bool,
}

/// A rule without an action: `type` is `default` (or absent) or `logical`.
#[derive(Debug, Clone, PartialEq)]
pub enum HeadlessRuleOptions {
    Default(DefaultRuleOptions),
    Logical(LogicalRuleOptions),
}

impl Default for HeadlessRuleOptions {
    fn default() -> Self {
        HeadlessRuleOptions::Default(DefaultRuleOptions::default())
    }
}

/// Options of every rule action, flattened into the rule itself.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ActionOptions {
    /// `route` when absent
    pub action: Option<String>,
    pub outbound: Option<String>,

    pub override_address: Option<String>,
    pub override_port: Option<u16>,
    pub network_strategy: Option<NetworkStrategy>,
    pub network_type: Listable<InterfaceType>,
    pub fallback_network_type: Listable<InterfaceType>,
    #[serde(with = "crate::config::duration_opt")]
    pub fallback_delay: Option<Duration>,
    pub udp_disable_domain_unmapping: bool,
    pub udp_connect: bool,
    #[serde(with = "crate::config::duration_opt")]
    pub udp_timeout: Option<Duration>,
    pub tls_fragment: bool,
    #[serde(with = "crate::config::duration_opt")]
    pub tls_fragment_fallback_delay: Option<Duration>,
    pub tls_record_fragment: bool,

    pub method: Option<String>,
    pub no_drop: bool,

    pub sniffer: Listable<String>,
    #[serde(with = "crate::config::duration_opt")]
    pub timeout: Option<Duration>,
    pub override_destination: bool,

    pub server: Option<String>,
    pub strategy: Option<DomainStrategy>,
    pub disable_cache: bool,
    pub rewrite_ttl: Option<u32>,
    pub client_subnet: Option<Cidr>,
}

/// A route rule: conditions plus an action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOptions {
    pub rule: HeadlessRuleOptions,
    pub action: ActionOptions,
}

// dummy type for acquiring the derived deserializer
#[derive(Debug, Deserialize)]
struct HeadlessRuleDef {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    mode: Option<LogicalMode>,
    #[serde(default)]
    rules: Vec<HeadlessRuleOptions>,
    #[serde(flatten)]
    default: DefaultRuleOptions,
}

impl HeadlessRuleDef {
    fn into_options(self) -> Result<HeadlessRuleOptions, String> {
        match self.kind.as_deref().unwrap_or_default() {
            "" | "default" => Ok(HeadlessRuleOptions::Default(self.default)),
            "logical" => {
                let mode = self.mode.ok_or("missing logical mode")?;
                if self.rules.is_empty() {
                    return Err("missing conditions".into());
                }
                Ok(HeadlessRuleOptions::Logical(LogicalRuleOptions {
                    mode,
                    rules: self.rules,
                    invert: self.default.invert,
                }))
            }
            other => Err(format!("unknown rule type: {}", other)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RuleDef {
    #[serde(flatten)]
    rule: HeadlessRuleDef,
    #[serde(flatten)]
    action: ActionOptions,
}

impl<'de> Deserialize<'de> for HeadlessRuleOptions {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        HeadlessRuleDef::deserialize(deserializer)?
            .into_options()
            .map_err(de::Error::custom)
    }
}

impl<'de> Deserialize<'de> for RuleOptions {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let RuleDef { rule, action } = RuleDef::deserialize(deserializer)?;
        Ok(RuleOptions {
            rule: rule.into_options().map_err(de::Error::custom)?,
            action,
        })
    }
}
