use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::rule::format::DefaultRuleOptions;
use crate::rule::item::{DomainMatcher, RuleItem, RuleSetItem};
use crate::rule::{Matcher, RuleContext};
use crate::rule_set::RuleSet;

/// Conjunction of generic items and the four address/port OR-groups.
///
/// Items in the same group are alternatives: `domain` and `ip_cidr` both
/// describe the destination address, so either may satisfy it.
#[derive(Debug, Clone, Default)]
pub struct DefaultRule {
    items: Vec<RuleItem>,
    source_address_items: Vec<RuleItem>,
    source_port_items: Vec<RuleItem>,
    destination_address_items: Vec<RuleItem>,
    /// only tried when no domain item matched
    destination_ip_cidr_items: Vec<RuleItem>,
    destination_port_items: Vec<RuleItem>,
    rule_set_items: Vec<RuleItem>,
    invert: bool,
}

impl DefaultRule {
    pub fn new(options: &DefaultRuleOptions, ctx: &RuleContext) -> Result<Self> {
        let mut rule = DefaultRule {
            invert: options.invert,
            ..Default::default()
        };

        if !options.inbound.is_empty() {
            rule.items.push(RuleItem::Inbound(options.inbound.to_vec()));
        }
        if let Some(version) = options.ip_version {
            rule.items.push(RuleItem::ip_version(version)?);
        }
        if !options.network.is_empty() {
            rule.items.push(RuleItem::Network(options.network.to_vec()));
        }
        if !options.auth_user.is_empty() {
            rule.items.push(RuleItem::AuthUser(options.auth_user.to_vec()));
        }
        if !options.protocol.is_empty() {
            rule.items.push(RuleItem::Protocol(options.protocol.to_vec()));
        }
        if !options.client.is_empty() {
            rule.items.push(RuleItem::Client(options.client.to_vec()));
        }

        if !options.domain.is_empty() || !options.domain_suffix.is_empty() {
            rule.destination_address_items.push(RuleItem::Domain(DomainMatcher::new(
                &options.domain[..],
                &options.domain_suffix[..],
            )));
        }
        if !options.domain_keyword.is_empty() {
            let keywords = options.domain_keyword.iter().map(|k| k.to_ascii_lowercase()).collect();
            rule.destination_address_items.push(RuleItem::DomainKeyword(keywords));
        }
        if !options.domain_regex.is_empty() {
            let regexes = options.domain_regex.iter().map(|r| r.0.clone()).collect();
            rule.destination_address_items.push(RuleItem::DomainRegex(regexes));
        }
        if !options.geosite.is_empty() {
            let reader = ctx
                .geosite
                .as_deref()
                .ok_or_else(|| Error::config("geosite database not configured"))?;
            rule.destination_address_items
                .extend(RuleItem::geosite(reader, &options.geosite)?);
        }

        if !options.source_geoip.is_empty() {
            rule.source_address_items.push(RuleItem::GeoIp {
                source: true,
                codes: lower(&options.source_geoip),
                reader: ctx.geoip()?,
            });
        }
        if !options.source_ip_cidr.is_empty() {
            rule.source_address_items.push(RuleItem::IpCidr {
                source: true,
                nets: options.source_ip_cidr.iter().map(|cidr| cidr.0).collect(),
            });
        }
        if options.source_ip_is_private {
            rule.source_address_items.push(RuleItem::IpIsPrivate { source: true });
        }

        if !options.geoip.is_empty() {
            rule.destination_ip_cidr_items.push(RuleItem::GeoIp {
                source: false,
                codes: lower(&options.geoip),
                reader: ctx.geoip()?,
            });
        }
        if !options.ip_cidr.is_empty() {
            rule.destination_ip_cidr_items.push(RuleItem::IpCidr {
                source: false,
                nets: options.ip_cidr.iter().map(|cidr| cidr.0).collect(),
            });
        }
        if options.ip_is_private {
            rule.destination_ip_cidr_items.push(RuleItem::IpIsPrivate { source: false });
        }

        if !options.source_port.is_empty() {
            rule.source_port_items.push(RuleItem::Port {
                source: true,
                ports: options.source_port.to_vec(),
            });
        }
        if !options.source_port_range.is_empty() {
            rule.source_port_items
                .push(RuleItem::port_range(true, &options.source_port_range)?);
        }
        if !options.port.is_empty() {
            rule.destination_port_items.push(RuleItem::Port {
                source: false,
                ports: options.port.to_vec(),
            });
        }
        if !options.port_range.is_empty() {
            rule.destination_port_items
                .push(RuleItem::port_range(false, &options.port_range)?);
        }

        if !options.process_name.is_empty() {
            rule.items.push(RuleItem::ProcessName(options.process_name.to_vec()));
        }
        if !options.process_path.is_empty() {
            rule.items.push(RuleItem::ProcessPath(options.process_path.to_vec()));
        }
        if !options.process_path_regex.is_empty() {
            let regexes = options.process_path_regex.iter().map(|r| r.0.clone()).collect();
            rule.items.push(RuleItem::ProcessPathRegex(regexes));
        }
        if !options.package_name.is_empty() {
            rule.items.push(RuleItem::PackageName(options.package_name.to_vec()));
        }
        if !options.user.is_empty() {
            rule.items.push(RuleItem::User(options.user.to_vec()));
        }
        if !options.user_id.is_empty() {
            rule.items.push(RuleItem::UserId(options.user_id.to_vec()));
        }
        if !options.wifi_ssid.is_empty() {
            rule.items.push(RuleItem::WifiSsid(options.wifi_ssid.to_vec()));
        }
        if !options.wifi_bssid.is_empty() {
            rule.items.push(RuleItem::WifiBssid(options.wifi_bssid.to_vec()));
        }

        if !options.rule_set.is_empty() {
            let sets = options
                .rule_set
                .iter()
                .map(|tag| ctx.rule_set(tag))
                .collect::<Result<Vec<_>>>()?;
            rule.rule_set_items.push(RuleItem::RuleSet(RuleSetItem::new(
                sets,
                options.rule_set_ip_cidr_match_source,
                options.rule_set_ip_cidr_accept_empty,
            )));
        }
        Ok(rule)
    }

    pub fn is_empty(&self) -> bool {
        self.all_items().next().is_none()
    }

    fn all_items(&self) -> impl Iterator<Item = &RuleItem> {
        self.items
            .iter()
            .chain(&self.source_address_items)
            .chain(&self.source_port_items)
            .chain(&self.destination_address_items)
            .chain(&self.destination_ip_cidr_items)
            .chain(&self.destination_port_items)
            .chain(&self.rule_set_items)
    }

    pub fn contains_process_item(&self) -> bool {
        self.all_items().any(RuleItem::is_process_item)
    }

    pub fn contains_wifi_item(&self) -> bool {
        self.all_items().any(RuleItem::is_wifi_item)
    }

    pub fn contains_ip_cidr_item(&self) -> bool {
        self.all_items().any(RuleItem::is_ip_cidr_item)
    }

    pub fn rule_sets(&self) -> impl Iterator<Item = &Arc<RuleSet>> {
        self.rule_set_items.iter().flat_map(RuleItem::rule_sets)
    }
}

fn lower(codes: &[String]) -> Vec<String> {
    codes.iter().map(|code| code.to_ascii_lowercase()).collect()
}

/// whether any item of an OR-group matches; marks the rule as tested
fn match_group(items: &[RuleItem], metadata: &mut Metadata) -> bool {
    metadata.rule_cache.did_match = true;
    items.iter().any(|item| item.r#match(metadata))
}

impl Matcher for DefaultRule {
    fn r#match(&self, metadata: &mut Metadata) -> bool {
        if self.is_empty() {
            return true;
        }

        for item in &self.items {
            metadata.rule_cache.did_match = true;
            if !item.r#match(metadata) {
                return self.invert;
            }
        }

        if !self.source_address_items.is_empty()
            && !metadata.rule_cache.source_address_match
            && match_group(&self.source_address_items, metadata)
        {
            metadata.rule_cache.source_address_match = true;
        }
        if !self.source_port_items.is_empty()
            && !metadata.rule_cache.source_port_match
            && match_group(&self.source_port_items, metadata)
        {
            metadata.rule_cache.source_port_match = true;
        }
        if !self.destination_address_items.is_empty()
            && !metadata.rule_cache.destination_address_match
            && match_group(&self.destination_address_items, metadata)
        {
            metadata.rule_cache.destination_address_match = true;
        }
        if !self.destination_ip_cidr_items.is_empty()
            && !metadata.rule_cache.destination_address_match
            && match_group(&self.destination_ip_cidr_items, metadata)
        {
            metadata.rule_cache.destination_address_match = true;
        }
        if !self.destination_port_items.is_empty()
            && !metadata.rule_cache.destination_port_match
            && match_group(&self.destination_port_items, metadata)
        {
            metadata.rule_cache.destination_port_match = true;
        }

        for item in &self.rule_set_items {
            if !item.r#match(metadata) {
                return self.invert;
            }
        }

        let cache = metadata.rule_cache;
        if !self.source_address_items.is_empty() && !cache.source_address_match {
            return self.invert;
        }
        if !self.source_port_items.is_empty() && !cache.source_port_match {
            return self.invert;
        }
        if (!self.destination_address_items.is_empty() || !self.destination_ip_cidr_items.is_empty())
            && !cache.destination_address_match
        {
            return self.invert;
        }
        if !self.destination_port_items.is_empty() && !cache.destination_port_match {
            return self.invert;
        }
        if !cache.did_match {
            return true;
        }
        !self.invert
    }
}

impl fmt::Display for DefaultRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let desc: Vec<String> = self.all_items().map(|item| item.to_string()).collect();
        if self.invert {
            write!(f, "!({})", desc.join(" "))
        } else {
            write!(f, "{}", desc.join(" "))
        }
    }
}
