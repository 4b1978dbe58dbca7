use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use log::*;
use parking_lot::{Mutex, RwLock};
use serde::*;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::byte_stream::BoxedStream;
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::model::Network;
use crate::outbound::probe::{Prober, UrlProber};
use crate::outbound::{lookup_members, Outbound};
use crate::pkt_stream::BoxedPktStream;

pub const DEFAULT_URL: &str = "https://www.gstatic.com/generate_204";
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3 * 60);
pub const DEFAULT_TOLERANCE: Duration = Duration::from_millis(50);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(15);
const PROBE_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UrlTestOptions {
    pub outbounds: Vec<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, with = "crate::config::duration_opt")]
    pub interval: Option<Duration>,
    /// milliseconds
    #[serde(default)]
    pub tolerance: Option<u16>,
    #[serde(default, with = "crate::config::duration_opt")]
    pub idle_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UrlTestHistory {
    pub tested_at: Instant,
    pub delay: Duration,
}

/// Probe results shared by every group, keyed by real tag.
#[derive(Debug, Default)]
pub struct HistoryStore {
    records: RwLock<HashMap<String, UrlTestHistory>>,
}

impl HistoryStore {
    pub fn load(&self, tag: &str) -> Option<UrlTestHistory> {
        self.records.read().get(tag).copied()
    }

    /// Keeps the newer of the stored and the given record.
    pub fn store(&self, tag: &str, history: UrlTestHistory) {
        let mut records = self.records.write();
        match records.get(tag) {
            Some(old) if old.tested_at > history.tested_at => {}
            _ => {
                records.insert(tag.to_owned(), history);
            }
        }
    }

    pub fn delete(&self, tag: &str) {
        self.records.write().remove(tag);
    }
}

#[derive(Debug)]
struct LoopState {
    started: bool,
    running: bool,
    last_active: Instant,
    cancel: CancellationToken,
}

/// Picks the member with the lowest measured delay.
///
/// Members are probed when the group starts and then every `interval`. After
/// `idle_timeout` without a dial the probing pauses; the next dial resumes
/// it.
#[derive(Debug)]
pub struct UrlTestGroup(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    tag: String,
    outbounds: Vec<Arc<Outbound>>,
    prober: Arc<dyn Prober>,
    interval: Duration,
    tolerance: Duration,
    idle_timeout: Duration,
    history: Arc<HistoryStore>,
    selected_tcp: RwLock<Option<Arc<Outbound>>>,
    selected_udp: RwLock<Option<Arc<Outbound>>>,
    state: Mutex<LoopState>,
    checking: AtomicBool,
}

impl UrlTestGroup {
    pub fn new(
        tag: &str,
        options: &UrlTestOptions,
        built: &HashMap<String, Arc<Outbound>>,
        history: Arc<HistoryStore>,
    ) -> Result<Self> {
        let url = options.url.as_deref().filter(|url| !url.is_empty()).unwrap_or(DEFAULT_URL);
        let prober = Arc::new(UrlProber::new(url, PROBE_TIMEOUT));
        Self::with_prober(tag, options, built, history, prober)
    }

    pub fn with_prober(
        tag: &str,
        options: &UrlTestOptions,
        built: &HashMap<String, Arc<Outbound>>,
        history: Arc<HistoryStore>,
        prober: Arc<dyn Prober>,
    ) -> Result<Self> {
        let outbounds = lookup_members(tag, &options.outbounds, built)?;
        let interval = options.interval.filter(|d| !d.is_zero()).unwrap_or(DEFAULT_INTERVAL);
        let idle_timeout = options
            .idle_timeout
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);
        if interval > idle_timeout {
            return Err(Error::config_fmt(format_args!(
                "outbound[{}]: interval must be less or equal than idle_timeout",
                tag
            )));
        }
        let tolerance = options
            .tolerance
            .map(|ms| Duration::from_millis(ms.into()))
            .unwrap_or(DEFAULT_TOLERANCE);
        Ok(Self(Arc::new(Inner {
            tag: tag.to_owned(),
            outbounds,
            prober,
            interval,
            tolerance,
            idle_timeout,
            history,
            selected_tcp: RwLock::new(None),
            selected_udp: RwLock::new(None),
            state: Mutex::new(LoopState {
                started: false,
                running: false,
                last_active: Instant::now(),
                cancel: CancellationToken::new(),
            }),
            checking: AtomicBool::new(false),
        })))
    }

    pub fn tag(&self) -> &str {
        &self.0.tag
    }

    pub fn outbounds(&self) -> &[Arc<Outbound>] {
        &self.0.outbounds
    }

    pub fn all(&self) -> Vec<String> {
        self.0.outbounds.iter().map(|o| o.tag().to_owned()).collect()
    }

    /// Current TCP choice, else the UDP one.
    pub fn current(&self) -> Option<Arc<Outbound>> {
        let tcp = self.0.selected_tcp.read().clone();
        tcp.or_else(|| self.0.selected_udp.read().clone())
    }

    pub fn now(&self) -> String {
        match self.current() {
            Some(outbound) => outbound.tag().to_owned(),
            None => self.0.outbounds.first().map(|o| o.tag().to_owned()).unwrap_or_default(),
        }
    }

    pub fn select(&self, network: Network) -> Option<Arc<Outbound>> {
        self.0.select(network)
    }

    pub async fn check_outbounds(&self, force: bool) -> HashMap<String, Duration> {
        self.0.check_outbounds(force).await
    }

    pub fn start(&self) {
        {
            let mut state = self.0.state.lock();
            state.started = true;
            state.last_active = Instant::now();
        }
        self.0.update_selected();
        self.0.spawn_loop();
    }

    /// Marks the group active, resuming a paused probe loop.
    pub fn touch(&self) {
        self.0.state.lock().last_active = Instant::now();
        self.0.spawn_loop();
    }

    pub fn close(&self) {
        let mut state = self.0.state.lock();
        state.started = false;
        state.running = false;
        state.cancel.cancel();
    }

    pub fn is_checking_scheduled(&self) -> bool {
        self.0.state.lock().running
    }

    fn pick(&self, network: Network) -> Result<Arc<Outbound>> {
        self.touch();
        let selected = match network {
            Network::Tcp => self.0.selected_tcp.read().clone(),
            Network::Udp => self.0.selected_udp.read().clone(),
        };
        selected
            .filter(|outbound| outbound.supports(network))
            .or_else(|| self.0.select(network))
            .ok_or_else(|| Error::network_not_supported(network, self.tag()))
    }

    pub async fn dial(&self, metadata: &Metadata) -> Result<BoxedStream> {
        let outbound = self.pick(Network::Tcp)?;
        match outbound.dial(metadata).await {
            Ok(strm) => Ok(strm),
            Err(err) => {
                self.0.history.delete(&outbound.real_tag());
                Err(err)
            }
        }
    }

    pub async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedPktStream> {
        let outbound = self.pick(Network::Udp)?;
        match outbound.listen_packet(metadata).await {
            Ok(pkt) => Ok(pkt),
            Err(err) => {
                self.0.history.delete(&outbound.real_tag());
                Err(err)
            }
        }
    }
}

impl Inner {
    fn select(&self, network: Network) -> Option<Arc<Outbound>> {
        let candidates: Vec<(usize, &Arc<Outbound>, UrlTestHistory)> = self
            .outbounds
            .iter()
            .enumerate()
            .filter(|(_, outbound)| outbound.supports(network))
            .filter_map(|(i, outbound)| {
                self.history
                    .load(&outbound.real_tag())
                    .map(|history| (i, outbound, history))
            })
            .collect();
        let min_delay = match candidates.iter().map(|(_, _, history)| history.delay).min() {
            Some(delay) => delay,
            None => {
                return self
                    .outbounds
                    .iter()
                    .find(|outbound| outbound.supports(network))
                    .cloned()
            }
        };
        let limit = min_delay + self.tolerance;

        let current = match network {
            Network::Tcp => self.selected_tcp.read().clone(),
            Network::Udp => self.selected_udp.read().clone(),
        };
        if let Some(current) = current {
            let within = candidates
                .iter()
                .any(|(_, outbound, history)| Arc::ptr_eq(outbound, &current) && history.delay <= limit);
            if within {
                return Some(current);
            }
        }

        candidates
            .iter()
            .filter(|(_, _, history)| history.delay <= limit)
            .min_by_key(|(i, _, history)| (history.tested_at, history.delay, *i))
            .map(|(_, outbound, _)| Arc::clone(outbound))
    }

    fn update_selected(&self) {
        for network in Network::ALL {
            let next = self.select(network);
            let slot = match network {
                Network::Tcp => &self.selected_tcp,
                Network::Udp => &self.selected_udp,
            };
            let mut selected = slot.write();
            let changed = match (&*selected, &next) {
                (Some(old), Some(new)) => !Arc::ptr_eq(old, new),
                (None, None) => false,
                _ => true,
            };
            if changed {
                if let Some(next) = &next {
                    info!("urltest[{}]: selected {} for {}", self.tag, next.tag(), network);
                }
                *selected = next;
            }
        }
    }

    async fn check_outbounds(&self, force: bool) -> HashMap<String, Duration> {
        let mut result = HashMap::new();
        if self.checking.swap(true, Ordering::AcqRel) {
            return result;
        }
        let mut seen = HashSet::new();
        let mut targets = vec![];
        for outbound in &self.outbounds {
            let real_tag = outbound.real_tag();
            if !seen.insert(real_tag.clone()) {
                continue;
            }
            if !force {
                if let Some(history) = self.history.load(&real_tag) {
                    if history.tested_at.elapsed() < self.interval {
                        continue;
                    }
                }
            }
            targets.push((real_tag, outbound.clone()));
        }

        let prober = &self.prober;
        let probed: Vec<(String, Result<Duration>)> = stream::iter(targets)
            .map(|(real_tag, outbound)| async move {
                let res = prober.probe(&outbound).await;
                (real_tag, res)
            })
            .buffer_unordered(PROBE_CONCURRENCY)
            .collect()
            .await;

        for (real_tag, res) in probed {
            match res {
                Ok(delay) => {
                    debug!("urltest[{}]: outbound {} available: {}ms", self.tag, real_tag, delay.as_millis());
                    self.history.store(
                        &real_tag,
                        UrlTestHistory {
                            tested_at: Instant::now(),
                            delay,
                        },
                    );
                    result.insert(real_tag, delay);
                }
                Err(err) => {
                    debug!("urltest[{}]: outbound {} unavailable: {}", self.tag, real_tag, err);
                    self.history.delete(&real_tag);
                }
            }
        }
        self.checking.store(false, Ordering::Release);
        self.update_selected();
        result
    }

    fn spawn_loop(self: &Arc<Self>) {
        let cancel = {
            let mut state = self.state.lock();
            if !state.started || state.running {
                return;
            }
            state.running = true;
            state.cancel.child_token()
        };
        tokio::spawn(self.clone().run(cancel));
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.check_outbounds(false).await;
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            {
                let mut state = self.state.lock();
                if state.last_active.elapsed() > self.idle_timeout {
                    debug!("urltest[{}]: idle, checks paused", self.tag);
                    state.running = false;
                    return;
                }
            }
            self.check_outbounds(false).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::probe::test::FixedProber;
    use crate::outbound::test::{buffer_outbound, members};

    fn options(outbounds: &[&str]) -> UrlTestOptions {
        UrlTestOptions {
            outbounds: outbounds.iter().map(|s| s.to_string()).collect(),
            url: None,
            interval: Some(Duration::from_secs(60)),
            tolerance: Some(50),
            idle_timeout: Some(Duration::from_secs(120)),
        }
    }

    fn group(prober: Arc<FixedProber>) -> (UrlTestGroup, Arc<HistoryStore>) {
        let (a, _) = buffer_outbound("a", &Network::ALL);
        let (b, _) = buffer_outbound("b", &Network::ALL);
        let history = Arc::new(HistoryStore::default());
        let group = UrlTestGroup::with_prober("auto", &options(&["a", "b"]), &members(&[&a, &b]), history.clone(), prober)
            .unwrap();
        (group, history)
    }

    fn record(history: &HistoryStore, tag: &str, millis: u64) {
        history.store(
            tag,
            UrlTestHistory {
                tested_at: Instant::now(),
                delay: Duration::from_millis(millis),
            },
        );
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_record_within_tolerance_wins() {
        let (group, history) = group(Arc::default());
        record(&history, "b", 100);
        tokio::time::advance(Duration::from_secs(4)).await;
        record(&history, "a", 120);
        assert_eq!(group.select(Network::Tcp).unwrap().tag(), "b");
        // unchanged data, same answer
        assert_eq!(group.select(Network::Tcp).unwrap().tag(), "b");
    }

    #[tokio::test(start_paused = true)]
    async fn current_kept_until_beaten_by_tolerance() {
        let (group, history) = group(Arc::default());
        record(&history, "a", 100);
        group.0.update_selected();
        assert_eq!(group.now(), "a");

        record(&history, "b", 70);
        group.0.update_selected();
        assert_eq!(group.now(), "a");

        record(&history, "b", 40);
        group.0.update_selected();
        assert_eq!(group.now(), "b");
    }

    #[tokio::test]
    async fn first_member_without_history() {
        let (group, _) = group(Arc::default());
        assert_eq!(group.select(Network::Udp).unwrap().tag(), "a");
        assert_eq!(group.now(), "a");
    }

    #[tokio::test(start_paused = true)]
    async fn check_skips_fresh_records() {
        let prober = Arc::new(FixedProber::new(&[("a", 30)]));
        let (group, history) = group(prober.clone());

        let result = group.check_outbounds(false).await;
        assert_eq!(result.len(), 1);
        assert_eq!(prober.probed(), ["a", "b"]);
        assert!(history.load("b").is_none());
        assert_eq!(group.now(), "a");

        // "a" is fresh, "b" has no record
        group.check_outbounds(false).await;
        assert_eq!(prober.probed(), ["a", "b", "b"]);

        prober.set("a", None);
        group.check_outbounds(true).await;
        assert!(history.load("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn members_deduplicated_by_real_tag() {
        let prober = Arc::new(FixedProber::new(&[("a", 30)]));
        let (a, _) = buffer_outbound("a", &Network::ALL);
        let inner = UrlTestGroup::with_prober(
            "inner",
            &options(&["a"]),
            &members(&[&a]),
            Arc::default(),
            prober.clone(),
        )
        .unwrap();
        let inner = Arc::new(Outbound::UrlTest(inner));
        let group = UrlTestGroup::with_prober(
            "outer",
            &options(&["a", "inner"]),
            &members(&[&a, &inner]),
            Arc::default(),
            prober.clone(),
        )
        .unwrap();
        group.check_outbounds(true).await;
        assert_eq!(prober.probed(), ["a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn dial_failure_evicts_record() {
        let destination: crate::model::Address = "example.com:443".parse().unwrap();
        let mut connector = crate::connector::test::BufferConnector::new(&Network::ALL);
        connector.refused.insert(destination.clone());
        let a = Arc::new(Outbound::Leaf(crate::outbound::LeafOutbound::new(
            "a",
            "buffer",
            Arc::new(connector),
        )));
        let history = Arc::new(HistoryStore::default());
        let group = UrlTestGroup::with_prober(
            "auto",
            &options(&["a"]),
            &members(&[&a]),
            history.clone(),
            Arc::new(FixedProber::default()),
        )
        .unwrap();
        record(&history, "a", 10);
        let metadata = Metadata::new(Network::Tcp, "10.0.0.2:50000".parse().unwrap(), destination);
        assert!(group.dial(&metadata).await.is_err());
        assert!(history.load("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn probing_pauses_when_idle() {
        let prober = Arc::new(FixedProber::new(&[("a", 30), ("b", 40)]));
        let (group, _) = group(prober.clone());
        group.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(prober.probed().len(), 2);
        assert!(group.is_checking_scheduled());

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(!group.is_checking_scheduled());
        let probes = prober.probed().len();

        group.touch();
        assert!(group.is_checking_scheduled());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(prober.probed().len() > probes);
        group.close();
    }

    #[test]
    fn interval_longer_than_idle() {
        let (a, _) = buffer_outbound("a", &Network::ALL);
        let mut options = options(&["a"]);
        options.interval = Some(Duration::from_secs(600));
        let err = UrlTestGroup::new("auto", &options, &members(&[&a]), Arc::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "config error: outbound[auto]: interval must be less or equal than idle_timeout"
        );
    }

    #[test]
    fn history_never_moves_backwards() {
        let store = HistoryStore::default();
        let now = Instant::now();
        store.store(
            "a",
            UrlTestHistory {
                tested_at: now + Duration::from_secs(1),
                delay: Duration::from_millis(10),
            },
        );
        store.store(
            "a",
            UrlTestHistory {
                tested_at: now,
                delay: Duration::from_millis(99),
            },
        );
        assert_eq!(store.load("a").unwrap().delay, Duration::from_millis(10));
    }
}
