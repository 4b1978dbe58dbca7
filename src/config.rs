use std::fs::File;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::*;

use crate::error::Result;
use crate::model::Address;
use crate::outbound::OutboundOptions;
use crate::rule::format::RuleOptions;
use crate::rule_set::RuleSetOptions;
use crate::sniff::DEFAULT_SNIFF_TIMEOUT;

pub const DEFAULT_MONITOR_THROTTLE: Duration = Duration::from_secs(1);

/// `humantime` strings such as "300ms" or "24h"
pub mod duration {
    use std::time::Duration;

    use serde::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(de::Error::custom)
    }
}

/// optional variant of [`duration`]; use with `#[serde(default)]`
pub mod duration_opt {
    use std::time::Duration;

    use serde::*;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => super::duration::serialize(value, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(s) if !s.is_empty() => humantime::parse_duration(&s).map(Some).map_err(de::Error::custom),
            _ => Ok(None),
        }
    }
}

/// A listener forwarding every accepted connection to a fixed destination.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundConfig {
    pub tag: String,
    pub listen: SocketAddr,
    pub destination: Address,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub rules: Vec<RuleOptions>,
    #[serde(default)]
    pub rule_set: Vec<RuleSetOptions>,
    /// default outbound tag
    #[serde(rename = "final", default)]
    pub final_outbound: Option<String>,
    #[serde(default = "default_monitor_throttle", with = "duration")]
    pub monitor_throttle: Duration,
    #[serde(default = "default_sniff_timeout", with = "duration")]
    pub default_sniff_timeout: Duration,
}

fn default_monitor_throttle() -> Duration {
    DEFAULT_MONITOR_THROTTLE
}

fn default_sniff_timeout() -> Duration {
    DEFAULT_SNIFF_TIMEOUT
}

impl Default for RouteConfig {
    fn default() -> Self {
        Self {
            rules: vec![],
            rule_set: vec![],
            final_outbound: None,
            monitor_throttle: DEFAULT_MONITOR_THROTTLE,
            default_sniff_timeout: DEFAULT_SNIFF_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub inbounds: Vec<InboundConfig>,
    #[serde(default)]
    pub outbounds: Vec<OutboundOptions>,
    #[serde(default)]
    pub route: RouteConfig,
}

impl Config {
    pub fn with_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn set_final_outbound<S: Into<String>>(&mut self, tag: S) -> &mut Self {
        self.route.final_outbound = Some(tag.into());
        self
    }

    pub fn set_monitor_throttle(&mut self, throttle: Duration) -> &mut Self {
        self.route.monitor_throttle = throttle;
        self
    }

    pub fn set_default_sniff_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.route.default_sniff_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
inbounds:
  - tag: forward-in
    listen: 127.0.0.1:10800
    destination: example.com:443
outbounds:
  - tag: proxy
    type: direct
    connect_timeout: 5s
  - tag: blocked
    type: block
  - tag: auto
    type: urltest
    outbounds: [proxy]
    interval: 1m
route:
  final: proxy
  monitor_throttle: 200ms
  rule_set:
    - tag: ads
      type: inline
      rules:
        - domain_suffix: ads.example
  rules:
    - domain_suffix: example.com
      action: sniff
    - rule_set: ads
      action: reject
    - port: [53, 853]
      outbound: proxy
"#;

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let config = Config::with_file(file.path()).unwrap();
        assert_eq!(config.inbounds[0].destination, "example.com:443".parse().unwrap());
        assert_eq!(config.outbounds.len(), 3);
        assert_eq!(config.route.final_outbound.as_deref(), Some("proxy"));
        assert_eq!(config.route.monitor_throttle, Duration::from_millis(200));
        assert_eq!(config.route.default_sniff_timeout, Duration::from_millis(300));
        assert_eq!(config.route.rules.len(), 3);
        assert_eq!(config.route.rule_set[0].tag, "ads");
    }

    #[test]
    fn defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert!(config.outbounds.is_empty());
        assert_eq!(config.route.monitor_throttle, DEFAULT_MONITOR_THROTTLE);
        assert!(config.route.final_outbound.is_none());
    }

    #[test]
    fn setters_chain() {
        let mut config = Config::default();
        config
            .set_final_outbound("direct")
            .set_monitor_throttle(Duration::from_millis(10));
        assert_eq!(config.route.final_outbound.as_deref(), Some("direct"));
        assert_eq!(config.route.monitor_throttle, Duration::from_millis(10));
    }

    #[test]
    fn bad_duration() {
        assert!(serde_yaml::from_str::<RouteConfig>("monitor_throttle: soon").is_err());
        let route: RouteConfig = serde_yaml::from_str("default_sniff_timeout: 1m 30s").unwrap();
        assert_eq!(route.default_sniff_timeout, Duration::from_secs(90));
    }

    #[test]
    fn missing_file() {
        assert!(Config::with_file(Path::new("/nonexistent/switchyard.yaml")).is_err());
    }
}
