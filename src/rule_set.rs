//! Named collections of headless rules shared by route rules.
//!
//! A [`RuleSet`] owns the rules and the bookkeeping every source shares;
//! [`local`] and [`remote`] keep its content current.
pub mod local;
pub mod remote;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::*;
use parking_lot::{Mutex, RwLock};
use serde::*;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::rule::format::HeadlessRuleOptions;
use crate::rule::{HeadlessRule, Matcher, RuleContext};

pub use self::local::LocalLoader;
pub use self::remote::RemoteLoader;

pub const FORMAT_SOURCE: &str = "source";
pub const FORMAT_BINARY: &str = "binary";
pub const MAX_SOURCE_VERSION: u8 = 3;

/// Which expensive lookups the rules of a set depend on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleSetMetadata {
    pub contains_process_rule: bool,
    pub contains_wifi_rule: bool,
    pub contains_ip_cidr_rule: bool,
}

impl RuleSetMetadata {
    fn of(rules: &[HeadlessRule]) -> Self {
        Self {
            contains_process_rule: rules.iter().any(HeadlessRule::contains_process_item),
            contains_wifi_rule: rules.iter().any(HeadlessRule::contains_wifi_item),
            contains_ip_cidr_rule: rules.iter().any(HeadlessRule::contains_ip_cidr_item),
        }
    }
}

/// Rule-set file in the source format.
#[derive(Debug, Clone, Deserialize)]
pub struct PlainRuleSet {
    pub version: u8,
    #[serde(default)]
    pub rules: Vec<HeadlessRuleOptions>,
}

/// Builds the rules of a rule-set file.
pub fn parse_rules(content: &[u8], format: &str, ctx: &RuleContext) -> Result<Vec<HeadlessRule>> {
    let plain: PlainRuleSet = match format {
        FORMAT_SOURCE => serde_json::from_slice(content)?,
        FORMAT_BINARY => return Err(Error::config("binary rule-set format is not supported")),
        _ => {
            return Err(Error::config_fmt(format_args!(
                "unknown rule-set format: {}",
                format
            )))
        }
    };
    if plain.version == 0 || plain.version > MAX_SOURCE_VERSION {
        return Err(Error::config_fmt(format_args!(
            "unknown rule-set version: {}",
            plain.version
        )));
    }
    build_rules(&plain.rules, ctx)
}

fn build_rules(options: &[HeadlessRuleOptions], ctx: &RuleContext) -> Result<Vec<HeadlessRule>> {
    options
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            HeadlessRule::new(rule, ctx).map_err(|err| {
                Error::config_fmt(format_args!("parse rule_set.rules.[{}]: {}", i, err))
            })
        })
        .collect()
}

pub type UpdateCallback = Arc<dyn Fn(&RuleSet) + Send + Sync>;

/// Handle returned by [`RuleSet::register_callback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

#[derive(Debug, Default)]
struct Content {
    rules: Vec<HeadlessRule>,
    metadata: RuleSetMetadata,
}

pub struct RuleSet {
    tag: String,
    content: RwLock<Content>,
    callbacks: Mutex<Vec<(CallbackId, UpdateCallback)>>,
    next_callback: AtomicU64,
    refs: AtomicI32,
}

impl fmt::Debug for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RuleSet")
            .field("tag", &self.tag)
            .field("rules", &self.content.read().rules.len())
            .field("refs", &self.refs.load(Ordering::Relaxed))
            .finish()
    }
}

impl RuleSet {
    pub fn new<S: Into<String>>(tag: S) -> Self {
        Self {
            tag: tag.into(),
            content: RwLock::new(Content::default()),
            callbacks: Mutex::new(vec![]),
            next_callback: AtomicU64::new(0),
            refs: AtomicI32::new(0),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn metadata(&self) -> RuleSetMetadata {
        self.content.read().metadata
    }

    pub fn len(&self) -> usize {
        self.content.read().rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Swaps in new rules, then notifies the registered callbacks.
    pub fn reload(&self, rules: Vec<HeadlessRule>) {
        {
            let mut content = self.content.write();
            content.metadata = RuleSetMetadata::of(&rules);
            content.rules = rules;
        }
        let callbacks: Vec<UpdateCallback> = self
            .callbacks
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback(self);
        }
    }

    pub fn register_callback(&self, callback: UpdateCallback) -> CallbackId {
        let id = CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed));
        self.callbacks.lock().push((id, callback));
        id
    }

    pub fn unregister_callback(&self, id: CallbackId) {
        self.callbacks.lock().retain(|(other, _)| *other != id);
    }

    pub fn inc_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_ref(&self) {
        if self.refs.fetch_sub(1, Ordering::SeqCst) <= 0 {
            panic!("rule-set: negative refs");
        }
    }

    pub fn refs(&self) -> i32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Drops the rules when nothing references the set.
    pub fn cleanup(&self) {
        if self.refs() == 0 {
            *self.content.write() = Content::default();
        }
    }
}

impl Matcher for RuleSet {
    /// Any rule matching. A rule that fails leaves the rule cache as it
    /// found it.
    fn r#match(&self, metadata: &mut Metadata) -> bool {
        let content = self.content.read();
        for rule in &content.rules {
            let saved = metadata.rule_cache;
            if rule.r#match(metadata) {
                return true;
            }
            metadata.rule_cache = saved;
        }
        false
    }
}

impl fmt::Display for RuleSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let content = self.content.read();
        let rules: Vec<String> = content.rules.iter().map(|rule| rule.to_string()).collect();
        write!(f, "{}", rules.join(" "))
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RuleSetSource {
    Inline {
        #[serde(default)]
        rules: Vec<HeadlessRuleOptions>,
    },
    Local {
        path: PathBuf,
        #[serde(default)]
        watch: bool,
    },
    Remote {
        url: String,
        #[serde(default, with = "crate::config::duration_opt")]
        update_interval: Option<Duration>,
        /// where the last fetched content is kept between runs
        #[serde(default)]
        cache_path: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RuleSetOptions {
    pub tag: String,
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(flatten)]
    pub source: RuleSetSource,
}

fn default_format() -> String {
    FORMAT_SOURCE.to_owned()
}

#[derive(Debug)]
enum Loader {
    Inline,
    Local(Arc<LocalLoader>),
    Remote(Arc<RemoteLoader>),
}

/// Every configured rule-set, keyed by tag.
#[derive(Debug)]
pub struct RuleSetRegistry {
    sets: HashMap<String, Arc<RuleSet>>,
    loaders: Vec<(Arc<RuleSet>, Loader)>,
    cancel: CancellationToken,
}

impl RuleSetRegistry {
    /// Creates the sets; inline rules are built right away, the others are
    /// filled by [`RuleSetRegistry::start`].
    pub fn new(options: &[RuleSetOptions], ctx: &RuleContext) -> Result<Self> {
        let mut sets = HashMap::new();
        let mut loaders = vec![];
        let mut client: Option<reqwest::Client> = None;
        for options in options {
            if sets.contains_key(&options.tag) {
                return Err(Error::config_fmt(format_args!(
                    "duplicate rule-set tag: {}",
                    options.tag
                )));
            }
            let set = Arc::new(RuleSet::new(options.tag.clone()));
            let loader = match &options.source {
                RuleSetSource::Inline { rules } => {
                    if rules.is_empty() {
                        return Err(Error::rule_set(&options.tag, "empty inline rule-set"));
                    }
                    set.reload(build_rules(rules, ctx)?);
                    Loader::Inline
                }
                RuleSetSource::Local { path, watch } => Loader::Local(Arc::new(LocalLoader::new(
                    set.clone(),
                    path.clone(),
                    options.format.clone(),
                    *watch,
                    ctx.clone(),
                ))),
                RuleSetSource::Remote {
                    url,
                    update_interval,
                    cache_path,
                } => {
                    if client.is_none() {
                        client = Some(
                            reqwest::Client::builder()
                                .user_agent(concat!("switchyard/", env!("CARGO_PKG_VERSION")))
                                .build()?,
                        );
                    }
                    let http = client.clone().unwrap_or_default();
                    let mut loader =
                        RemoteLoader::new(set.clone(), url.clone(), options.format.clone(), ctx.clone(), http);
                    if let Some(interval) = update_interval {
                        loader.set_update_interval(*interval);
                    }
                    if let Some(path) = cache_path {
                        loader.set_cache_path(path.clone());
                    }
                    Loader::Remote(Arc::new(loader))
                }
            };
            sets.insert(options.tag.clone(), set.clone());
            loaders.push((set, loader));
        }
        Ok(Self {
            sets,
            loaders,
            cancel: CancellationToken::new(),
        })
    }

    pub fn get(&self, tag: &str) -> Option<Arc<RuleSet>> {
        self.sets.get(tag).cloned()
    }

    pub fn sets(&self) -> impl Iterator<Item = &Arc<RuleSet>> {
        self.sets.values()
    }

    /// Loads every set, then spawns the watchers and update loops.
    pub async fn start(&self) -> Result<()> {
        for (set, loader) in &self.loaders {
            match loader {
                Loader::Inline => {}
                Loader::Local(local) => {
                    local.reload()?;
                    local.clone().spawn_watch(self.cancel.child_token())?;
                }
                Loader::Remote(remote) => {
                    remote
                        .start()
                        .await
                        .map_err(|err| Error::rule_set(set.tag(), format_args!("initial rule-set: {}", err)))?;
                    tokio::spawn(remote.clone().run(self.cancel.child_token()));
                }
            }
            info!("rule-set[{}]: {} rules loaded", set.tag(), set.len());
        }
        Ok(())
    }

    /// Releases the rules of sets nothing references.
    pub fn cleanup(&self) {
        for set in self.sets.values() {
            set.cleanup();
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RuleSetRegistry {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Network;
    use std::sync::atomic::AtomicUsize;

    fn metadata(destination: &str) -> Metadata {
        Metadata::new(
            Network::Tcp,
            "10.0.0.2:50000".parse().unwrap(),
            destination.parse().unwrap(),
        )
    }

    fn registry(yaml: &str) -> Result<RuleSetRegistry> {
        let options: Vec<RuleSetOptions> = serde_yaml::from_str(yaml).unwrap();
        RuleSetRegistry::new(&options, &RuleContext::default())
    }

    #[test]
    fn inline_rule_set() {
        let registry = registry(
            r#"
- tag: ads
  type: inline
  rules:
    - domain_suffix: ads.example
    - process_name: tracker
"#,
        )
        .unwrap();
        let set = registry.get("ads").unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.metadata().contains_process_rule);
        assert!(!set.metadata().contains_ip_cidr_rule);
        assert!(set.r#match(&mut metadata("x.ads.example:443")));
        assert!(!set.r#match(&mut metadata("example.com:443")));
    }

    #[test]
    fn registry_errors() {
        let err = registry("- {tag: a, type: inline, rules: []}").unwrap_err();
        assert_eq!(err.to_string(), "rule-set[a]: empty inline rule-set");
        let err = registry(
            "- {tag: a, type: inline, rules: [{port: 1}]}\n- {tag: a, type: inline, rules: [{port: 2}]}",
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "config error: duplicate rule-set tag: a");
    }

    #[test]
    fn formats() {
        let ctx = RuleContext::default();
        let rules = parse_rules(br#"{"version": 1, "rules": [{"port": 53}]}"#, FORMAT_SOURCE, &ctx).unwrap();
        assert_eq!(rules.len(), 1);
        assert!(parse_rules(b"", FORMAT_BINARY, &ctx).is_err());
        let err = parse_rules(b"{}", "xml", &ctx).unwrap_err();
        assert_eq!(err.to_string(), "config error: unknown rule-set format: xml");
        assert!(parse_rules(br#"{"version": 9, "rules": []}"#, FORMAT_SOURCE, &ctx).is_err());
        let err = parse_rules(
            br#"{"version": 1, "rules": [{"ip_version": 5}]}"#,
            FORMAT_SOURCE,
            &ctx,
        )
        .unwrap_err();
        assert!(err.to_string().contains("rule_set.rules.[0]"), "{}", err);
    }

    #[test]
    fn failed_rule_keeps_cache() {
        let set = RuleSet::new("s");
        let ctx = RuleContext::default();
        set.reload(
            parse_rules(
                br#"{"version": 1, "rules": [{"domain": "a.example", "port": 80}, {"port": 443}]}"#,
                FORMAT_SOURCE,
                &ctx,
            )
            .unwrap(),
        );
        let mut m = metadata("a.example:443");
        m.reset_rule_cache();
        assert!(set.r#match(&mut m));
        assert!(!m.rule_cache().destination_address_match);
        assert!(m.rule_cache().destination_port_match);
    }

    #[test]
    fn callbacks_and_refs() {
        let set = RuleSet::new("s");
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = set.register_callback(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        set.reload(vec![]);
        set.unregister_callback(id);
        set.reload(vec![]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        set.inc_ref();
        set.reload(build_rules(&[HeadlessRuleOptions::default()], &RuleContext::default()).unwrap());
        set.cleanup();
        assert_eq!(set.len(), 1);
        set.dec_ref();
        set.cleanup();
        assert!(set.is_empty());
    }

    #[test]
    #[should_panic(expected = "rule-set: negative refs")]
    fn negative_refs() {
        RuleSet::new("s").dec_ref();
    }
}
