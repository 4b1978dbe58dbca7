//! Route rules: predicates over [`Metadata`] bound to a [`RuleAction`].
//!
//! A rule is built from its configuration shape in [`format`] against a
//! [`RuleContext`] holding the databases and rule-sets it may reference.
//!
//! ```
//! # use switchyard::metadata::Metadata;
//! # use switchyard::model::Network;
//! # use switchyard::rule::{Matcher, Rule, RuleContext};
//! let options = serde_yaml::from_str("domain_suffix: example.com\noutbound: proxy").unwrap();
//! let rule = Rule::new(&options, &RuleContext::default()).unwrap();
//! let mut metadata = Metadata::new(
//!     Network::Tcp,
//!     "10.0.0.2:50000".parse().unwrap(),
//!     "www.example.com:443".parse().unwrap(),
//! );
//! assert!(rule.r#match(&mut metadata));
//! assert_eq!(rule.action().to_string(), "route(proxy)");
//! ```
pub mod action;
pub mod default;
pub mod format;
pub mod item;
pub mod logical;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::geoip::{GeoIpReader, GeositeReader};
use crate::metadata::Metadata;
use crate::rule_set::RuleSet;

pub use self::action::RuleAction;
pub use self::default::DefaultRule;
pub use self::logical::LogicalRule;
use self::format::{HeadlessRuleOptions, RuleOptions};

pub trait Matcher {
    /// Tests `metadata`; may only write the rule cache and memoized codes.
    fn r#match(&self, metadata: &mut Metadata) -> bool;
}

/// What rules may reference while they are built.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    pub geoip: Option<Arc<dyn GeoIpReader>>,
    pub geosite: Option<Arc<dyn GeositeReader>>,
    pub rule_sets: HashMap<String, Arc<RuleSet>>,
}

impl RuleContext {
    pub fn set_geoip(&mut self, reader: Arc<dyn GeoIpReader>) -> &mut Self {
        self.geoip = Some(reader);
        self
    }

    pub fn set_geosite(&mut self, reader: Arc<dyn GeositeReader>) -> &mut Self {
        self.geosite = Some(reader);
        self
    }

    pub fn add_rule_set(&mut self, set: Arc<RuleSet>) -> &mut Self {
        self.rule_sets.insert(set.tag().to_owned(), set);
        self
    }

    fn geoip(&self) -> Result<Arc<dyn GeoIpReader>> {
        self.geoip
            .clone()
            .ok_or_else(|| Error::config("geoip database not configured"))
    }

    fn rule_set(&self, tag: &str) -> Result<Arc<RuleSet>> {
        self.rule_sets
            .get(tag)
            .cloned()
            .ok_or_else(|| Error::config_fmt(format_args!("rule-set not found: {}", tag)))
    }
}

/// A rule without an action, as found in rule-sets and logical rules.
#[derive(Debug, Clone)]
pub enum HeadlessRule {
    Default(DefaultRule),
    Logical(LogicalRule),
}

impl HeadlessRule {
    pub fn new(options: &HeadlessRuleOptions, ctx: &RuleContext) -> Result<Self> {
        match options {
            HeadlessRuleOptions::Default(options) => Ok(HeadlessRule::Default(DefaultRule::new(options, ctx)?)),
            HeadlessRuleOptions::Logical(options) => Ok(HeadlessRule::Logical(LogicalRule::new(options, ctx)?)),
        }
    }

    pub fn contains_process_item(&self) -> bool {
        match self {
            HeadlessRule::Default(rule) => rule.contains_process_item(),
            HeadlessRule::Logical(rule) => rule.rules().iter().any(HeadlessRule::contains_process_item),
        }
    }

    pub fn contains_wifi_item(&self) -> bool {
        match self {
            HeadlessRule::Default(rule) => rule.contains_wifi_item(),
            HeadlessRule::Logical(rule) => rule.rules().iter().any(HeadlessRule::contains_wifi_item),
        }
    }

    pub fn contains_ip_cidr_item(&self) -> bool {
        match self {
            HeadlessRule::Default(rule) => rule.contains_ip_cidr_item(),
            HeadlessRule::Logical(rule) => rule.rules().iter().any(HeadlessRule::contains_ip_cidr_item),
        }
    }

    /// Appends every rule-set this rule refers to.
    pub fn collect_rule_sets(&self, sets: &mut Vec<Arc<RuleSet>>) {
        match self {
            HeadlessRule::Default(rule) => sets.extend(rule.rule_sets().cloned()),
            HeadlessRule::Logical(rule) => rule.rules().iter().for_each(|rule| rule.collect_rule_sets(sets)),
        }
    }
}

impl Matcher for HeadlessRule {
    fn r#match(&self, metadata: &mut Metadata) -> bool {
        match self {
            HeadlessRule::Default(rule) => rule.r#match(metadata),
            HeadlessRule::Logical(rule) => rule.r#match(metadata),
        }
    }
}

impl fmt::Display for HeadlessRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeadlessRule::Default(rule) => fmt::Display::fmt(rule, f),
            HeadlessRule::Logical(rule) => fmt::Display::fmt(rule, f),
        }
    }
}

/// Conditions and the action taken when they hold.
#[derive(Debug)]
pub struct Rule {
    matcher: HeadlessRule,
    action: RuleAction,
}

impl Rule {
    pub fn new(options: &RuleOptions, ctx: &RuleContext) -> Result<Self> {
        Ok(Self {
            matcher: HeadlessRule::new(&options.rule, ctx)?,
            action: RuleAction::from_options(&options.action)?,
        })
    }

    pub fn with_action(matcher: HeadlessRule, action: RuleAction) -> Self {
        Self { matcher, action }
    }

    pub fn action(&self) -> &RuleAction {
        &self.action
    }

    pub fn matcher(&self) -> &HeadlessRule {
        &self.matcher
    }
}

impl Matcher for Rule {
    fn r#match(&self, metadata: &mut Metadata) -> bool {
        metadata.reset_rule_cache();
        self.matcher.r#match(metadata)
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} => {}", self.matcher, self.action)
    }
}
