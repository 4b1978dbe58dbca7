use std::collections::HashMap;
use std::sync::Arc;

use log::*;
use parking_lot::RwLock;
use serde::*;

use crate::byte_stream::BoxedStream;
use crate::error::{Error, Result};
use crate::metadata::Metadata;
use crate::outbound::{lookup_members, Outbound};
use crate::pkt_stream::BoxedPktStream;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SelectorOptions {
    pub outbounds: Vec<String>,
    #[serde(default)]
    pub default: Option<String>,
}

/// Routes through a member picked by the operator.
#[derive(Debug)]
pub struct Selector {
    tag: String,
    outbounds: Vec<Arc<Outbound>>,
    selected: RwLock<Arc<Outbound>>,
}

impl Selector {
    pub fn new(tag: &str, options: &SelectorOptions, built: &HashMap<String, Arc<Outbound>>) -> Result<Self> {
        let outbounds = lookup_members(tag, &options.outbounds, built)?;
        let selected = match options.default.as_deref().filter(|s| !s.is_empty()) {
            Some(default) => outbounds
                .iter()
                .find(|o| o.tag() == default)
                .cloned()
                .ok_or_else(|| {
                    Error::config_fmt(format_args!("outbound[{}]: default outbound not found: {}", tag, default))
                })?,
            None => outbounds[0].clone(),
        };
        Ok(Self {
            tag: tag.to_owned(),
            outbounds,
            selected: RwLock::new(selected),
        })
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn outbounds(&self) -> &[Arc<Outbound>] {
        &self.outbounds
    }

    pub fn all(&self) -> Vec<String> {
        self.outbounds.iter().map(|o| o.tag().to_owned()).collect()
    }

    pub fn selected(&self) -> Arc<Outbound> {
        self.selected.read().clone()
    }

    pub fn now(&self) -> String {
        self.selected.read().tag().to_owned()
    }

    /// Returns false when `tag` is not a member.
    pub fn select(&self, tag: &str) -> bool {
        match self.outbounds.iter().find(|o| o.tag() == tag) {
            Some(outbound) => {
                *self.selected.write() = outbound.clone();
                info!("selector[{}]: selected {}", self.tag, tag);
                true
            }
            None => false,
        }
    }

    pub async fn dial(&self, metadata: &Metadata) -> Result<BoxedStream> {
        let outbound = self.selected();
        if !outbound.supports(metadata.network) {
            return Err(Error::network_not_supported(metadata.network, outbound.tag()));
        }
        outbound.dial(metadata).await
    }

    pub async fn listen_packet(&self, metadata: &Metadata) -> Result<BoxedPktStream> {
        let outbound = self.selected();
        if !outbound.supports(metadata.network) {
            return Err(Error::network_not_supported(metadata.network, outbound.tag()));
        }
        outbound.listen_packet(metadata).await
    }
}
