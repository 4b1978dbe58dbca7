//! Process lookup for process/package/user rule items.
use std::fmt;
use std::net::SocketAddr;

use crate::error::Result;
use crate::model::Network;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub process_path: String,
    pub package_name: String,
    pub user: String,
    pub user_id: Option<u32>,
}

impl ProcessInfo {
    /// file name of `process_path`
    pub fn process_name(&self) -> &str {
        self.process_path
            .rsplit(|c| c == '/' || c == '\\')
            .next()
            .unwrap_or_default()
    }
}

/// Platform-specific owner lookup for a local socket pair.
pub trait ProcessSearcher: fmt::Debug + Send + Sync {
    fn find(
        &self,
        network: Network,
        source: SocketAddr,
        destination: Option<SocketAddr>,
    ) -> Result<ProcessInfo>;
}
