#![allow(non_local_definitions)]

use std::fmt;
use std::io;
use std::net::IpAddr;

use thiserror::Error;

use crate::model::Network;
use crate::rule::action::RejectMethod;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("config error: {message}")]
    Config { message: String },
    #[error("outbound not found: {tag}")]
    OutboundNotFound { tag: String },
    #[error("missing default outbound with {} support", .network.upper())]
    MissingDefaultOutbound { network: Network },
    #[error("{} is not supported by outbound: {tag}", .network.upper())]
    NetworkNotSupported { network: Network, tag: String },
    /// terminal reject action
    #[error("rejected: {method}")]
    Rejected { method: RejectMethod },
    #[error("reject method reply is not supported by {network} connection")]
    RejectReplyNotSupported { network: Network },
    #[error("dns resolver not configured")]
    DnsNotConfigured,
    #[error("lookup {domain}: {message}")]
    DnsLookup { domain: String, message: String },
    #[error("missing fakeip record for {addr}")]
    FakeIpNotFound { addr: IpAddr },
    #[error("open connection to {addrs} using outbound/{outbound}: {source}")]
    Dial {
        addrs: String,
        outbound: String,
        #[source]
        source: Box<Error>,
    },
    #[error("dial {interface}: {source}")]
    InterfaceDial {
        interface: String,
        #[source]
        source: Box<Error>,
    },
    #[error("no available network interface")]
    NoInterface,
    #[error("{}", AggregateDisplay(.0))]
    Aggregate(Vec<Error>),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status}")]
    UnexpectedStatus { status: u16 },
    #[error("rule-set[{tag}]: {message}")]
    RuleSet { tag: String, message: String },
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("connection closed")]
    Closed,
    #[error("canceled")]
    Canceled,
    #[error("timeout")]
    Timeout,
}

struct AggregateDisplay<'a>(&'a [Error]);

impl fmt::Display for AggregateDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " | ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl Error {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn config_fmt(message: fmt::Arguments) -> Self {
        Self::Config {
            message: message.to_string(),
        }
    }

    pub fn outbound_not_found<S: Into<String>>(tag: S) -> Self {
        Self::OutboundNotFound { tag: tag.into() }
    }

    pub fn network_not_supported<S: Into<String>>(network: Network, tag: S) -> Self {
        Self::NetworkNotSupported {
            network,
            tag: tag.into(),
        }
    }

    pub fn rejected(method: RejectMethod) -> Self {
        Self::Rejected { method }
    }

    pub fn dns_lookup<S: Into<String>>(domain: S, message: impl fmt::Display) -> Self {
        Self::DnsLookup {
            domain: domain.into(),
            message: message.to_string(),
        }
    }

    pub fn rule_set<S: Into<String>>(tag: S, message: impl fmt::Display) -> Self {
        Self::RuleSet {
            tag: tag.into(),
            message: message.to_string(),
        }
    }

    pub fn not_supported<S: Into<String>>(what: S) -> Self {
        Self::NotSupported(what.into())
    }

    /// Collapses a list of failures; a single failure is returned as is.
    pub fn aggregate(mut errors: Vec<Error>) -> Self {
        if errors.len() == 1 {
            errors.remove(0)
        } else {
            Self::Aggregate(errors)
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Error::Rejected { .. })
    }

    /// Normal teardown, as opposed to a failure worth an error log.
    pub fn is_closed_or_canceled(&self) -> bool {
        use io::ErrorKind as K;
        match self {
            Error::Closed | Error::Canceled => true,
            Error::Io(err) => matches!(
                err.kind(),
                K::BrokenPipe
                    | K::ConnectionReset
                    | K::ConnectionAborted
                    | K::UnexpectedEof
                    | K::NotConnected
            ),
            Error::Aggregate(errors) => {
                !errors.is_empty() && errors.iter().all(Error::is_closed_or_canceled)
            }
            _ => false,
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_time_messages() {
        assert_eq!(
            Error::outbound_not_found("proxy").to_string(),
            "outbound not found: proxy"
        );
        assert_eq!(
            Error::MissingDefaultOutbound {
                network: Network::Tcp
            }
            .to_string(),
            "missing default outbound with TCP support"
        );
        assert_eq!(
            Error::network_not_supported(Network::Udp, "block").to_string(),
            "UDP is not supported by outbound: block"
        );
    }

    #[test]
    fn classify_teardown() {
        assert!(Error::Canceled.is_closed_or_canceled());
        assert!(Error::Io(io::ErrorKind::BrokenPipe.into()).is_closed_or_canceled());
        assert!(!Error::Io(io::ErrorKind::PermissionDenied.into()).is_closed_or_canceled());
        assert!(Error::Aggregate(vec![Error::Closed, Error::Canceled]).is_closed_or_canceled());
        assert!(!Error::Aggregate(vec![Error::Closed, Error::Timeout]).is_closed_or_canceled());
    }

    #[test]
    fn aggregate_message() {
        let err = Error::aggregate(vec![Error::Timeout, Error::NoInterface]);
        assert_eq!(err.to_string(), "timeout | no available network interface");
        assert!(matches!(Error::aggregate(vec![Error::Closed]), Error::Closed));
    }
}
