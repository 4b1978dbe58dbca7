use std::fmt;

use crate::error::Result;
use crate::metadata::Metadata;
use crate::rule::format::{LogicalMode, LogicalRuleOptions};
use crate::rule::{HeadlessRule, Matcher, RuleContext};

/// AND / OR over sub-rules, each tested with a fresh rule cache.
#[derive(Debug, Clone)]
pub struct LogicalRule {
    mode: LogicalMode,
    rules: Vec<HeadlessRule>,
    invert: bool,
}

impl LogicalRule {
    pub fn new(options: &LogicalRuleOptions, ctx: &RuleContext) -> Result<Self> {
        let rules = options
            .rules
            .iter()
            .map(|rule| HeadlessRule::new(rule, ctx))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            mode: options.mode,
            rules,
            invert: options.invert,
        })
    }

    pub fn rules(&self) -> &[HeadlessRule] {
        &self.rules
    }
}

impl Matcher for LogicalRule {
    fn r#match(&self, metadata: &mut Metadata) -> bool {
        let mut test = |rule: &HeadlessRule| {
            metadata.reset_rule_cache();
            rule.r#match(metadata)
        };
        let matched = match self.mode {
            LogicalMode::And => self.rules.iter().all(&mut test),
            LogicalMode::Or => self.rules.iter().any(&mut test),
        };
        matched != self.invert
    }
}

impl fmt::Display for LogicalRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let op = match self.mode {
            LogicalMode::And => " && ",
            LogicalMode::Or => " || ",
        };
        let desc: Vec<String> = self.rules.iter().map(|rule| format!("({})", rule)).collect();
        if self.invert {
            write!(f, "!({})", desc.join(op))
        } else {
            write!(f, "{}", desc.join(op))
        }
    }
}
