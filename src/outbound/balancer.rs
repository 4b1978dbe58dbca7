use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::*;
use parking_lot::{Mutex, RwLock};
use rand::seq::SliceRandom;
use serde::*;
use tokio_util::sync::CancellationToken;

use crate::byte_stream::BoxedStream;
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::model::Network;
use crate::outbound::probe::{Prober, UrlProber};
use crate::outbound::strategy::{HealthCheckOptions, HealthChecker, Strategy, StrategyOptions};
use crate::outbound::{lookup_members, Outbound};
use crate::pkt_stream::BoxedPktStream;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BalancerOptions {
    pub outbounds: Vec<String>,
    #[serde(default)]
    pub fallback: Option<String>,
    pub strategy: StrategyOptions,
    #[serde(default)]
    pub health_check: HealthCheckOptions,
}

/// Spreads flows over its members following a health-checked strategy.
///
/// Until [`Balancer::start`] there is no health data, so members are picked
/// at random. When the strategy finds no usable member the fallback is used.
#[derive(Debug)]
pub struct Balancer {
    tag: String,
    outbounds: Vec<Arc<Outbound>>,
    fallback: Arc<Outbound>,
    strategy: Strategy,
    started: AtomicBool,
    last: RwLock<Option<Arc<Outbound>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Balancer {
    pub fn new(tag: &str, options: &BalancerOptions, built: &HashMap<String, Arc<Outbound>>) -> Result<Self> {
        let check = &options.health_check;
        let prober = Arc::new(UrlProber::new(check.destination(), check.timeout()));
        Self::with_prober(tag, options, built, prober)
    }

    pub fn with_prober(
        tag: &str,
        options: &BalancerOptions,
        built: &HashMap<String, Arc<Outbound>>,
        prober: Arc<dyn Prober>,
    ) -> Result<Self> {
        let outbounds = lookup_members(tag, &options.outbounds, built)?;
        let fallback_tag = options
            .fallback
            .as_deref()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::config_fmt(format_args!("outbound[{}]: fallback not set", tag)))?;
        let fallback = built.get(fallback_tag).cloned().ok_or_else(|| {
            Error::config_fmt(format_args!(
                "outbound[{}]: fallback outbound not found: {}",
                tag, fallback_tag
            ))
        })?;
        let checker = Arc::new(HealthChecker::new(
            options.health_check.clone(),
            outbounds.clone(),
            prober,
        ));
        Ok(Self {
            tag: tag.to_owned(),
            outbounds,
            fallback,
            strategy: Strategy::new(options.strategy.clone(), checker),
            started: AtomicBool::new(false),
            last: RwLock::new(None),
            cancel: Mutex::new(None),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn outbounds(&self) -> &[Arc<Outbound>] {
        &self.outbounds
    }

    pub fn fallback(&self) -> &Arc<Outbound> {
        &self.fallback
    }

    pub fn strategy(&self) -> &Strategy {
        &self.strategy
    }

    /// The member picked last, the fallback before any pick.
    pub fn current(&self) -> Arc<Outbound> {
        self.last.read().clone().unwrap_or_else(|| self.fallback.clone())
    }

    pub fn now(&self) -> String {
        self.current().tag().to_owned()
    }

    pub fn pick(&self, network: Network) -> Arc<Outbound> {
        let picked = if self.started.load(Ordering::Acquire) {
            self.strategy.pick(&self.outbounds, network)
        } else {
            let candidates: Vec<&Arc<Outbound>> =
                self.outbounds.iter().filter(|o| o.supports(network)).collect();
            candidates.choose(&mut rand::thread_rng()).map(|o| Arc::clone(o))
        };
        let outbound = match picked {
            Some(outbound) => outbound,
            None => {
                debug!("balancer[{}]: no member available, using fallback", self.tag);
                self.fallback.clone()
            }
        };
        *self.last.write() = Some(outbound.clone());
        outbound
    }

    pub async fn dial(&self, metadata: &Metadata) -> Result<BoxedStream> {
        let outbound = self.pick(Network::Tcp);
        if !outbound.supports(Network::Tcp) {
            return Err(Error::network_not_supported(Network::Tcp, outbound.tag()));
        }
        outbound.dial(metadata).await
    }

    pub async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedPktStream> {
        let outbound = self.pick(Network::Udp);
        if !outbound.supports(Network::Udp) {
            return Err(Error::network_not_supported(Network::Udp, outbound.tag()));
        }
        outbound.listen_packet(metadata).await
    }

    pub fn start(&self) {
        let mut cancel = self.cancel.lock();
        if cancel.is_some() {
            return;
        }
        let token = CancellationToken::new();
        tokio::spawn(self.strategy.checker().clone().run(token.clone()));
        *cancel = Some(token);
        self.started.store(true, Ordering::Release);
    }

    pub fn close(&self) {
        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        self.started.store(false, Ordering::Release);
    }
}
