use std::collections::HashMap;
use std::sync::Arc;

use log::*;

use crate::error::{Error, Result};
use crate::model::Network;
use crate::outbound::urltest::HistoryStore;
use crate::outbound::{Outbound, OutboundOptions, TYPE_DIRECT};

/// Registry of every outbound, built and started in dependency order.
#[derive(Debug)]
pub struct OutboundManager {
    outbounds: Vec<Arc<Outbound>>,
    by_tag: HashMap<String, Arc<Outbound>>,
    default: Arc<Outbound>,
    history: Arc<HistoryStore>,
}

impl OutboundManager {
    pub fn new(options: &[OutboundOptions], final_outbound: Option<&str>) -> Result<Self> {
        Self::with_leaves(vec![], options, final_outbound)
    }

    /// `leaves` are registered ahead of the configured outbounds and may be
    /// referenced by groups.
    pub fn with_leaves(
        leaves: Vec<Arc<Outbound>>,
        options: &[OutboundOptions],
        final_outbound: Option<&str>,
    ) -> Result<Self> {
        let history = Arc::new(HistoryStore::default());
        let mut built: HashMap<String, Arc<Outbound>> = HashMap::new();
        let mut order: Vec<String> = vec![];

        let mut pending: HashMap<&str, &OutboundOptions> = HashMap::new();
        for leaf in leaves {
            let tag = leaf.tag().to_owned();
            if built.insert(tag.clone(), leaf).is_some() {
                return Err(Error::config_fmt(format_args!("duplicate outbound tag: {}", tag)));
            }
            order.push(tag);
        }
        for option in options {
            if built.contains_key(&option.tag) || pending.insert(option.tag.as_str(), option).is_some() {
                return Err(Error::config_fmt(format_args!("duplicate outbound tag: {}", option.tag)));
            }
        }
        for option in options {
            for dependency in option.dependencies() {
                if !built.contains_key(&dependency) && !pending.contains_key(dependency.as_str()) {
                    return Err(Error::config_fmt(format_args!(
                        "dependency[{}] not found for outbound[{}]",
                        dependency, option.tag
                    )));
                }
            }
        }

        let mut configured: Vec<String> = vec![];
        while !pending.is_empty() {
            let ready: Vec<&OutboundOptions> = options
                .iter()
                .filter(|option| pending.contains_key(option.tag.as_str()))
                .filter(|option| option.dependencies().iter().all(|dep| built.contains_key(dep)))
                .collect();
            if ready.is_empty() {
                let mut stuck: Vec<&str> = pending.keys().copied().collect();
                stuck.sort_unstable();
                return Err(Error::config_fmt(format_args!(
                    "circular dependency between outbounds: {}",
                    stuck.join(", ")
                )));
            }
            for option in ready {
                let outbound = Outbound::new(option, &built, &history)?;
                built.insert(option.tag.clone(), Arc::new(outbound));
                pending.remove(option.tag.as_str());
                configured.push(option.tag.clone());
            }
        }
        order.extend(configured);

        if built.is_empty() {
            let direct = Arc::new(Outbound::direct(TYPE_DIRECT));
            built.insert(TYPE_DIRECT.to_owned(), direct);
            order.push(TYPE_DIRECT.to_owned());
        }

        let default = match final_outbound.filter(|s| !s.is_empty()) {
            Some(tag) => built
                .get(tag)
                .cloned()
                .ok_or_else(|| Error::config_fmt(format_args!("default outbound not found: {}", tag)))?,
            None => {
                let first = options.first().map(|o| o.tag.as_str()).unwrap_or(order[0].as_str());
                built[first].clone()
            }
        };

        let outbounds = order.iter().map(|tag| built[tag].clone()).collect();
        Ok(Self {
            outbounds,
            by_tag: built,
            default,
            history,
        })
    }

    pub fn outbound(&self, tag: &str) -> Option<Arc<Outbound>> {
        self.by_tag.get(tag).cloned()
    }

    pub fn default_outbound(&self) -> &Arc<Outbound> {
        &self.default
    }

    /// Default outbound for `network`: the default itself when it supports
    /// the network, else the first registered outbound that does.
    pub fn default_for(&self, network: Network) -> Result<Arc<Outbound>> {
        if self.default.supports(network) {
            return Ok(self.default.clone());
        }
        self.outbounds
            .iter()
            .find(|outbound| outbound.supports(network))
            .cloned()
            .ok_or(Error::MissingDefaultOutbound { network })
    }

    /// In dependency order.
    pub fn outbounds(&self) -> &[Arc<Outbound>] {
        &self.outbounds
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn start(&self) {
        for outbound in &self.outbounds {
            debug!("start outbound/{}[{}]", outbound.kind(), outbound.tag());
            outbound.start();
        }
    }

    pub fn close(&self) {
        for outbound in self.outbounds.iter().rev() {
            outbound.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::test::buffer_outbound;

    fn parse(yaml: &str) -> Vec<OutboundOptions> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn dependency_order() {
        let options = parse(
            r#"
- {tag: pick, type: selector, outbounds: [auto, direct]}
- {tag: auto, type: urltest, outbounds: [direct, deny]}
- {tag: direct, type: direct}
- {tag: deny, type: block}
"#,
        );
        let manager = OutboundManager::new(&options, None).unwrap();
        let order: Vec<&str> = manager.outbounds().iter().map(|o| o.tag()).collect();
        assert_eq!(order, ["direct", "deny", "auto", "pick"]);
        // first configured, not first built
        assert_eq!(manager.default_outbound().tag(), "pick");
        assert!(manager.outbound("auto").is_some());
        assert!(manager.outbound("nowhere").is_none());
    }

    #[test]
    fn configuration_errors() {
        let err = OutboundManager::new(&parse("[{tag: a, type: direct}, {tag: a, type: block}]"), None).unwrap_err();
        assert_eq!(err.to_string(), "config error: duplicate outbound tag: a");

        let err = OutboundManager::new(&parse("[{tag: pick, type: selector, outbounds: [x]}]"), None).unwrap_err();
        assert_eq!(err.to_string(), "config error: dependency[x] not found for outbound[pick]");

        let err = OutboundManager::new(
            &parse(
                r#"
- {tag: a, type: selector, outbounds: [b]}
- {tag: b, type: selector, outbounds: [a]}
"#,
            ),
            None,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "config error: circular dependency between outbounds: a, b"
        );

        let err = OutboundManager::new(&parse("[{tag: a, type: direct}]"), Some("b")).unwrap_err();
        assert_eq!(err.to_string(), "config error: default outbound not found: b");
    }

    #[test]
    fn empty_gets_direct() {
        let manager = OutboundManager::new(&[], None).unwrap();
        assert_eq!(manager.default_outbound().tag(), "direct");
        assert_eq!(manager.default_outbound().kind(), TYPE_DIRECT);
    }

    #[test]
    fn default_for_network() {
        let (tcp_only, _) = buffer_outbound("tcp-only", &[Network::Tcp]);
        let (both, _) = buffer_outbound("both", &Network::ALL);
        let manager = OutboundManager::with_leaves(vec![tcp_only, both], &[], Some("tcp-only")).unwrap();
        assert_eq!(manager.default_for(Network::Tcp).unwrap().tag(), "tcp-only");
        assert_eq!(manager.default_for(Network::Udp).unwrap().tag(), "both");

        let (tcp_only, _) = buffer_outbound("tcp-only", &[Network::Tcp]);
        let manager = OutboundManager::with_leaves(vec![tcp_only], &[], None).unwrap();
        assert_eq!(
            manager.default_for(Network::Udp).unwrap_err().to_string(),
            "missing default outbound with UDP support"
        );
    }
}
