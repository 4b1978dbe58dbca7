//! Outbound dialing helpers layered over a [`Connector`].
//!
//! `dial_serial` walks the resolved candidates of a destination in order.
//! `dial_parallel_interface` races the same dial across network interfaces
//! chosen by a [`NetworkStrategy`]: the primary set starts at once, the
//! fallback set after `fallback_delay` (or as soon as every primary attempt
//! has failed).
use std::net::IpAddr;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use ipnet::IpNet;
use log::*;
use serde::*;

use crate::byte_stream::BoxedStream;
use crate::connector::Connector;
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::model::Address;
use crate::pkt_stream::BoxedPktStream;

pub const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStrategy {
    Default,
    Hybrid,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    Wifi,
    Cellular,
    Ethernet,
    #[default]
    Other,
}

/// Interface an outbound is allowed to bind to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    #[serde(default)]
    pub index: u32,
    #[serde(rename = "type", default)]
    pub kind: InterfaceType,
    #[serde(default)]
    pub addresses: Vec<IpNet>,
    /// the interface the system routes through; dials on it are not bound
    #[serde(default)]
    pub default: bool,
}

impl NetworkInterface {
    fn label(&self) -> String {
        format!("{} ({})", self.name, self.index)
    }
}

/// Per-flow interface preference, taken from route options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfacePreference {
    pub strategy: NetworkStrategy,
    pub network_type: Vec<InterfaceType>,
    pub fallback_network_type: Vec<InterfaceType>,
    pub fallback_delay: Duration,
}

impl InterfacePreference {
    pub fn from_metadata(metadata: &Metadata) -> Option<Self> {
        let strategy = metadata.network_strategy?;
        Some(Self {
            strategy,
            network_type: metadata.network_type.clone(),
            fallback_network_type: metadata.fallback_network_type.clone(),
            fallback_delay: metadata
                .fallback_delay
                .filter(|delay| !delay.is_zero())
                .unwrap_or(DEFAULT_FALLBACK_DELAY),
        })
    }
}

/// Splits `interfaces` into the primary and fallback dial sets.
pub fn select_interfaces(
    interfaces: &[NetworkInterface],
    pref: &InterfacePreference,
) -> (Vec<NetworkInterface>, Vec<NetworkInterface>) {
    let by_type = |types: &[InterfaceType]| -> Vec<NetworkInterface> {
        interfaces
            .iter()
            .filter(|iface| types.contains(&iface.kind))
            .cloned()
            .collect()
    };
    let default_or_all = || -> Vec<NetworkInterface> {
        match interfaces.iter().find(|iface| iface.default) {
            Some(iface) => vec![iface.clone()],
            None => interfaces.to_vec(),
        }
    };

    match pref.strategy {
        NetworkStrategy::Default if pref.network_type.is_empty() => (default_or_all(), vec![]),
        NetworkStrategy::Default => (by_type(&pref.network_type), vec![]),
        NetworkStrategy::Hybrid if pref.network_type.is_empty() => (interfaces.to_vec(), vec![]),
        NetworkStrategy::Hybrid => (by_type(&pref.network_type), vec![]),
        NetworkStrategy::Fallback => {
            let primary = if pref.network_type.is_empty() {
                default_or_all()
            } else {
                by_type(&pref.network_type)
            };
            let fallback = if pref.fallback_network_type.is_empty() {
                interfaces
                    .iter()
                    .filter(|iface| {
                        !primary
                            .iter()
                            .any(|p| p.index == iface.index && p.name == iface.name)
                    })
                    .cloned()
                    .collect()
            } else {
                by_type(&pref.fallback_network_type)
            };
            (primary, fallback)
        }
    }
}

/// Dials the destination, or each resolved candidate in turn when there are
/// any. Fails with every collected error when no candidate connects.
pub async fn dial_serial(
    connector: &dyn Connector,
    destination: &Address,
    addresses: &[IpAddr],
) -> Result<BoxedStream> {
    dial_addresses(connector, destination, addresses, None).await
}

async fn dial_addresses(
    connector: &dyn Connector,
    destination: &Address,
    addresses: &[IpAddr],
    iface: Option<&NetworkInterface>,
) -> Result<BoxedStream> {
    let dial_one = move |addr: Address| async move {
        match iface {
            Some(iface) if !iface.default => connector.connect_byte_stream_via(&addr, iface).await,
            _ => connector.connect_byte_stream(&addr).await,
        }
    };
    if addresses.is_empty() {
        return dial_one(destination.clone()).await;
    }
    let mut errors = vec![];
    for ip in addresses {
        let addr = Address::IpAddr(*ip, destination.port());
        match dial_one(addr).await {
            Ok(strm) => return Ok(strm),
            Err(err) => {
                debug!("dial {} failed: {}", ip, err);
                errors.push(err);
            }
        }
    }
    Err(Error::aggregate(errors))
}

pub async fn dial_parallel_interface(
    connector: &dyn Connector,
    destination: &Address,
    addresses: &[IpAddr],
    pref: &InterfacePreference,
) -> Result<BoxedStream> {
    let (primary, fallback) = select_interfaces(connector.interfaces(), pref);
    if primary.is_empty() && fallback.is_empty() {
        return Err(Error::NoInterface);
    }
    let racer = move |iface: NetworkInterface| async move {
        dial_addresses(connector, destination, addresses, Some(&iface))
            .await
            .map_err(|err| Error::InterfaceDial {
                interface: iface.label(),
                source: Box::new(err),
            })
    };

    let mut pending = FuturesUnordered::new();
    for iface in primary {
        pending.push(racer(iface));
    }
    let mut fallback = if fallback.is_empty() {
        None
    } else {
        Some(fallback)
    };
    let fallback_timer = tokio::time::sleep(pref.fallback_delay);
    tokio::pin!(fallback_timer);
    let mut errors = vec![];

    loop {
        if pending.is_empty() {
            match fallback.take() {
                Some(ifaces) => {
                    debug!("primary interfaces exhausted, starting fallback");
                    pending.extend(ifaces.into_iter().map(racer));
                }
                None => return Err(Error::aggregate(errors)),
            }
        }
        tokio::select! {
            res = pending.next() => match res {
                Some(Ok(strm)) => return Ok(strm),
                Some(Err(err)) => {
                    debug!("{}", err);
                    errors.push(err);
                }
                None => {}
            },
            _ = &mut fallback_timer, if fallback.is_some() => {
                if let Some(ifaces) = fallback.take() {
                    pending.extend(ifaces.into_iter().map(racer));
                }
            }
        }
    }
}

/// Packet counterpart of [`dial_parallel_interface`]: tries primary then
/// fallback interfaces one after another.
pub async fn listen_serial_interface(
    connector: &dyn Connector,
    destination: &Address,
    pref: &InterfacePreference,
) -> Result<BoxedPktStream> {
    let (primary, fallback) = select_interfaces(connector.interfaces(), pref);
    if primary.is_empty() && fallback.is_empty() {
        return Err(Error::NoInterface);
    }
    let mut errors = vec![];
    for iface in primary.iter().chain(fallback.iter()) {
        let res = if iface.default {
            connector.connect_pkt_stream(destination).await
        } else {
            connector.connect_pkt_stream_via(destination, iface).await
        };
        match res {
            Ok(pkt) => return Ok(pkt),
            Err(err) => errors.push(Error::InterfaceDial {
                interface: iface.label(),
                source: Box::new(err),
            }),
        }
    }
    Err(Error::aggregate(errors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::test::BufferConnector;
    use crate::model::Network;

    fn iface(name: &str, index: u32, kind: InterfaceType, default: bool) -> NetworkInterface {
        NetworkInterface {
            name: name.into(),
            index,
            kind,
            addresses: vec![],
            default,
        }
    }

    fn interfaces() -> Vec<NetworkInterface> {
        vec![
            iface("wlan0", 1, InterfaceType::Wifi, true),
            iface("rmnet0", 2, InterfaceType::Cellular, false),
            iface("eth0", 3, InterfaceType::Ethernet, false),
        ]
    }

    fn pref(strategy: NetworkStrategy, types: &[InterfaceType]) -> InterfacePreference {
        InterfacePreference {
            strategy,
            network_type: types.to_vec(),
            fallback_network_type: vec![],
            fallback_delay: DEFAULT_FALLBACK_DELAY,
        }
    }

    fn names(ifaces: &[NetworkInterface]) -> Vec<&str> {
        ifaces.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn select_default_strategy() {
        let (p, f) = select_interfaces(&interfaces(), &pref(NetworkStrategy::Default, &[]));
        assert_eq!(names(&p), ["wlan0"]);
        assert!(f.is_empty());
        let (p, _) = select_interfaces(
            &interfaces(),
            &pref(NetworkStrategy::Default, &[InterfaceType::Cellular]),
        );
        assert_eq!(names(&p), ["rmnet0"]);
    }

    #[test]
    fn select_hybrid_uses_everything() {
        let (p, f) = select_interfaces(&interfaces(), &pref(NetworkStrategy::Hybrid, &[]));
        assert_eq!(names(&p), ["wlan0", "rmnet0", "eth0"]);
        assert!(f.is_empty());
    }

    #[test]
    fn select_fallback_rest() {
        let (p, f) = select_interfaces(&interfaces(), &pref(NetworkStrategy::Fallback, &[]));
        assert_eq!(names(&p), ["wlan0"]);
        assert_eq!(names(&f), ["rmnet0", "eth0"]);

        let mut preference = pref(NetworkStrategy::Fallback, &[InterfaceType::Ethernet]);
        preference.fallback_network_type = vec![InterfaceType::Cellular];
        let (p, f) = select_interfaces(&interfaces(), &preference);
        assert_eq!(names(&p), ["eth0"]);
        assert_eq!(names(&f), ["rmnet0"]);
    }

    #[tokio::test]
    async fn serial_tries_candidates_in_order() {
        let mut connector = BufferConnector::new(&Network::ALL);
        connector.refused.insert("10.0.0.1:80".parse().unwrap());
        let dst: Address = "example.com:80".parse().unwrap();
        let addrs: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        dial_serial(&connector, &dst, &addrs).await.unwrap();
        assert_eq!(connector.dialed(), ["10.0.0.1:80", "10.0.0.2:80"]);
    }

    #[tokio::test]
    async fn serial_aggregates_failures() {
        let mut connector = BufferConnector::new(&Network::ALL);
        connector.refused.insert("10.0.0.1:80".parse().unwrap());
        connector.refused.insert("10.0.0.2:80".parse().unwrap());
        let dst: Address = "example.com:80".parse().unwrap();
        let addrs: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
        let err = dial_serial(&connector, &dst, &addrs).await.unwrap_err();
        assert!(matches!(err, Error::Aggregate(ref errs) if errs.len() == 2));
    }

    #[tokio::test]
    async fn no_interface() {
        let connector = BufferConnector::new(&Network::ALL);
        let dst: Address = "1.1.1.1:443".parse().unwrap();
        let err = dial_parallel_interface(&connector, &dst, &[], &pref(NetworkStrategy::Hybrid, &[]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "no available network interface");
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_starts_after_primary_failure() {
        let mut connector = BufferConnector::new(&Network::ALL);
        connector.interfaces = interfaces();
        // wlan0 is the default interface, dialed without binding
        connector.default_route_down = true;
        connector.delays.insert("rmnet0".into(), Duration::from_secs(1));
        let dst: Address = "1.1.1.1:443".parse().unwrap();
        dial_parallel_interface(&connector, &dst, &[], &pref(NetworkStrategy::Fallback, &[]))
            .await
            .unwrap();
        let dialed = connector.dialed();
        assert_eq!(dialed[0], "1.1.1.1:443");
        assert!(dialed.contains(&"eth0/1.1.1.1:443".to_owned()));
        assert!(connector.take_peer(&dst).is_some());
    }

    #[tokio::test]
    async fn all_interfaces_failed() {
        let mut connector = BufferConnector::new(&Network::ALL);
        connector.interfaces = interfaces();
        connector.refused.insert("1.1.1.1:443".parse().unwrap());
        connector.down_interfaces.extend(["rmnet0".to_owned(), "eth0".to_owned()]);
        let dst: Address = "1.1.1.1:443".parse().unwrap();
        let err = dial_parallel_interface(&connector, &dst, &[], &pref(NetworkStrategy::Hybrid, &[]))
            .await
            .unwrap_err();
        match err {
            Error::Aggregate(errs) => {
                assert_eq!(errs.len(), 3);
                assert!(errs[0].to_string().starts_with("dial "));
            }
            other => panic!("unexpected: {}", other),
        }
    }
}
