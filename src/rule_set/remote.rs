use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::*;
use parking_lot::Mutex;
use reqwest::{header, StatusCode};
use serde::*;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::rule::RuleContext;
use crate::rule_set::{parse_rules, RuleSet};

pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Content of the cache file kept next to a remote rule-set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedRuleSet {
    pub content: String,
    pub last_updated: SystemTime,
    #[serde(default)]
    pub last_etag: Option<String>,
}

impl SavedRuleSet {
    fn load(path: &Path) -> Result<Option<Self>> {
        match std::fs::read(path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FetchState {
    last_updated: Option<SystemTime>,
    last_etag: Option<String>,
}

/// Keeps a rule-set in sync with a URL, revalidating with the last ETag.
#[derive(Debug)]
pub struct RemoteLoader {
    set: Arc<RuleSet>,
    url: String,
    format: String,
    ctx: RuleContext,
    client: reqwest::Client,
    update_interval: Duration,
    cache_path: Option<PathBuf>,
    state: Mutex<FetchState>,
}

impl RemoteLoader {
    pub fn new(set: Arc<RuleSet>, url: String, format: String, ctx: RuleContext, client: reqwest::Client) -> Self {
        Self {
            set,
            url,
            format,
            ctx,
            client,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            cache_path: None,
            state: Mutex::new(FetchState::default()),
        }
    }

    pub fn set_update_interval(&mut self, interval: Duration) -> &mut Self {
        if !interval.is_zero() {
            self.update_interval = interval;
        }
        self
    }

    pub fn set_cache_path(&mut self, path: PathBuf) -> &mut Self {
        self.cache_path = Some(path);
        self
    }

    pub fn last_updated(&self) -> Option<SystemTime> {
        self.state.lock().last_updated
    }

    pub fn last_etag(&self) -> Option<String> {
        self.state.lock().last_etag.clone()
    }

    /// Restores the cached content, fetching only when there was none.
    pub async fn start(&self) -> Result<()> {
        if let Some(path) = &self.cache_path {
            if let Some(saved) = SavedRuleSet::load(path)? {
                self.load(saved.content.as_bytes())
                    .map_err(|err| Error::rule_set(self.set.tag(), format_args!("restore cached rule-set: {}", err)))?;
                let mut state = self.state.lock();
                state.last_updated = Some(saved.last_updated);
                state.last_etag = saved.last_etag;
            }
        }
        if self.last_updated().is_none() {
            self.fetch().await?;
        }
        Ok(())
    }

    fn load(&self, content: &[u8]) -> Result<()> {
        let rules = parse_rules(content, &self.format, &self.ctx)?;
        self.set.reload(rules);
        Ok(())
    }

    pub async fn fetch(&self) -> Result<()> {
        debug!("updating rule-set {} from URL: {}", self.set.tag(), self.url);
        let mut request = self.client.get(&self.url);
        if let Some(etag) = self.last_etag() {
            request = request.header(header::IF_NONE_MATCH, etag);
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_MODIFIED => {
                let now = SystemTime::now();
                self.state.lock().last_updated = Some(now);
                if let Some(path) = &self.cache_path {
                    if let Some(mut saved) = SavedRuleSet::load(path)? {
                        saved.last_updated = now;
                        if let Err(err) = saved.save(path) {
                            error!("save rule-set updated time: {}", err);
                        }
                    }
                }
                info!("update rule-set {}: not modified", self.set.tag());
                return Ok(());
            }
            status => {
                return Err(Error::UnexpectedStatus {
                    status: status.as_u16(),
                })
            }
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let content = response.bytes().await?;
        self.load(&content)?;

        let now = SystemTime::now();
        let last_etag = {
            let mut state = self.state.lock();
            if etag.is_some() {
                state.last_etag = etag;
            }
            state.last_updated = Some(now);
            state.last_etag.clone()
        };
        if let Some(path) = &self.cache_path {
            let saved = SavedRuleSet {
                content: String::from_utf8_lossy(&content).into_owned(),
                last_updated: now,
                last_etag,
            };
            if let Err(err) = saved.save(path) {
                error!("save rule-set cache: {}", err);
            }
        }
        info!("updated rule-set {}", self.set.tag());
        Ok(())
    }

    fn fetch_succeeded(&self) {
        if self.set.refs() == 0 {
            self.set.cleanup();
        }
    }

    /// Refetches every update interval until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let stale = self
            .last_updated()
            .and_then(|at| at.elapsed().ok())
            .map_or(true, |age| age > self.update_interval);
        if stale {
            match self.fetch().await {
                Ok(()) => self.fetch_succeeded(),
                Err(err) => error!("fetch rule-set {}: {}", self.set.tag(), err),
            }
        }
        let start = tokio::time::Instant::now() + self.update_interval;
        let mut ticker = tokio::time::interval_at(start, self.update_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => match self.fetch().await {
                    Ok(()) => self.fetch_succeeded(),
                    Err(err) => error!("fetch rule-set {}: {}", self.set.tag(), err),
                },
            }
        }
    }
}
