//! Health-checked selection strategies for the balancer.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use log::*;
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use serde::*;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::model::Network;
use crate::outbound::probe::Prober;
use crate::outbound::Outbound;

pub const DEFAULT_DESTINATION: &str = "http://www.google.com/gen_204";
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_SAMPLING: usize = 10;
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const CHECK_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HealthCheckOptions {
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default, with = "crate::config::duration_opt")]
    pub interval: Option<Duration>,
    #[serde(default)]
    pub sampling: Option<usize>,
    #[serde(default, with = "crate::config::duration_opt")]
    pub timeout: Option<Duration>,
}

impl HealthCheckOptions {
    pub fn destination(&self) -> &str {
        self.destination
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_DESTINATION)
    }

    pub fn interval(&self) -> Duration {
        self.interval.unwrap_or(DEFAULT_CHECK_INTERVAL).max(MIN_CHECK_INTERVAL)
    }

    pub fn sampling(&self) -> usize {
        self.sampling.filter(|n| *n > 0).unwrap_or(DEFAULT_SAMPLING)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout.filter(|d| !d.is_zero()).unwrap_or(DEFAULT_CHECK_TIMEOUT)
    }

    /// Age after which a sample no longer counts.
    pub fn validity(&self) -> Duration {
        let sampling = u32::try_from(self.sampling()).unwrap_or(u32::MAX);
        self.interval()
            .checked_mul(sampling)
            .and_then(|d| d.checked_mul(2))
            .unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyOptions {
    LeastLoad {
        #[serde(default, with = "crate::config::duration_opt")]
        max_rtt: Option<Duration>,
        /// accepted failure ratio, 0.0 to 1.0
        #[serde(default)]
        tolerance: f32,
        #[serde(default)]
        expected: Option<usize>,
    },
    LeastPing,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    rtt: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthStats {
    pub all: usize,
    pub fail: usize,
    pub average: Duration,
    pub deviation: Duration,
}

impl HealthStats {
    fn alive(&self) -> bool {
        self.all > self.fail
    }
}

/// Keeps the most recent probe samples of every member.
#[derive(Debug)]
pub struct HealthChecker {
    options: HealthCheckOptions,
    outbounds: Vec<Arc<Outbound>>,
    prober: Arc<dyn Prober>,
    samples: RwLock<HashMap<String, Vec<Sample>>>,
}

impl HealthChecker {
    pub fn new(options: HealthCheckOptions, outbounds: Vec<Arc<Outbound>>, prober: Arc<dyn Prober>) -> Self {
        Self {
            options,
            outbounds,
            prober,
            samples: RwLock::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &HealthCheckOptions {
        &self.options
    }

    pub async fn check(&self) {
        let probed: Vec<(String, Result<Duration>)> = stream::iter(self.outbounds.iter().cloned())
            .map(|outbound: Arc<Outbound>| {
                let prober = self.prober.clone();
                async move { (outbound.tag().to_owned(), prober.probe(&outbound).await) }
            })
            .buffer_unordered(CHECK_CONCURRENCY)
            .collect()
            .await;

        let now = Instant::now();
        let validity = self.options.validity();
        let sampling = self.options.sampling();
        let mut samples = self.samples.write();
        for (tag, res) in probed {
            let rtt = match res {
                Ok(rtt) => Some(rtt),
                Err(err) => {
                    debug!("health check {}: {}", tag, err);
                    None
                }
            };
            let entry = samples.entry(tag).or_default();
            entry.push(Sample { at: now, rtt });
            entry.retain(|sample| now.duration_since(sample.at) <= validity);
            if entry.len() > sampling {
                let excess = entry.len() - sampling;
                entry.drain(..excess);
            }
        }
    }

    pub fn stats(&self, tag: &str) -> HealthStats {
        let samples = self.samples.read();
        let samples = match samples.get(tag) {
            Some(samples) => samples,
            None => return HealthStats::default(),
        };
        let validity = self.options.validity();
        let mut stats = HealthStats::default();
        let mut rtts = vec![];
        for sample in samples.iter().filter(|s| s.at.elapsed() <= validity) {
            stats.all += 1;
            match sample.rtt {
                Some(rtt) => rtts.push(rtt.as_secs_f64()),
                None => stats.fail += 1,
            }
        }
        if !rtts.is_empty() {
            let n = rtts.len() as f64;
            let mean = rtts.iter().sum::<f64>() / n;
            let variance = rtts.iter().map(|rtt| (rtt - mean).powi(2)).sum::<f64>() / n;
            stats.average = Duration::from_secs_f64(mean);
            stats.deviation = Duration::from_secs_f64(variance.sqrt());
        }
        stats
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.options.interval();
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.check().await,
            }
        }
    }
}

#[derive(Debug)]
pub struct Strategy {
    options: StrategyOptions,
    checker: Arc<HealthChecker>,
}

impl Strategy {
    pub fn new(options: StrategyOptions, checker: Arc<HealthChecker>) -> Self {
        Self { options, checker }
    }

    pub fn checker(&self) -> &Arc<HealthChecker> {
        &self.checker
    }

    /// Best member able to carry `network`, `None` when no member qualifies.
    pub fn pick(&self, outbounds: &[Arc<Outbound>], network: Network) -> Option<Arc<Outbound>> {
        let mut candidates: Vec<(&Arc<Outbound>, HealthStats)> = outbounds
            .iter()
            .filter(|outbound| outbound.supports(network))
            .map(|outbound| (outbound, self.checker.stats(outbound.tag())))
            .filter(|(_, stats)| stats.alive())
            .collect();
        match &self.options {
            StrategyOptions::LeastPing => candidates
                .into_iter()
                .min_by_key(|(_, stats)| stats.average)
                .map(|(outbound, _)| outbound.clone()),
            StrategyOptions::LeastLoad {
                max_rtt,
                tolerance,
                expected,
            } => {
                candidates.retain(|(_, stats)| {
                    if stats.fail > 0 && stats.fail as f32 / stats.all as f32 > *tolerance {
                        return false;
                    }
                    !matches!(max_rtt, Some(max) if stats.average > *max)
                });
                candidates.sort_by_key(|(_, stats)| (stats.deviation, stats.average));
                let expected = expected.filter(|n| *n > 0).unwrap_or(1);
                candidates.truncate(expected);
                candidates
                    .choose(&mut rand::thread_rng())
                    .map(|(outbound, _)| Arc::clone(outbound))
            }
        }
    }
}
