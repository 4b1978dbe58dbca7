//! GeoIP / Geosite database seams.
//!
//! The readers themselves live outside this crate; rules only need a country
//! code per address and the domain items behind a geosite code.
use std::fmt;
use std::net::IpAddr;

/// One domain predicate of a geosite category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeositeItem {
    Domain(String),
    Suffix(String),
    Keyword(String),
    Regex(String),
}

pub trait GeoIpReader: fmt::Debug + Send + Sync {
    /// lower-case country code
    fn lookup(&self, addr: IpAddr) -> Option<String>;
}

pub trait GeositeReader: fmt::Debug + Send + Sync {
    fn read(&self, code: &str) -> Option<Vec<GeositeItem>>;
}
