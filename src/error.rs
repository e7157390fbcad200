//! Error types shared by resolution, routing and dispatch.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Errors produced while resolving, routing or dialing a request.
#[derive(Debug, Error)]
pub enum Error {
    /// Every resolution strategy ran and none produced an address.
    #[error("couldn't find ip")]
    IpNotFound,

    /// A literal address conflicts with the requested family.
    #[error("ip version error")]
    IpVersion,

    /// IPv6 resolution was requested while IPv6 is disabled.
    #[error("ipv6 disabled")]
    Ipv6Disabled,

    /// The inbound request carries neither a host nor a destination IP.
    #[error("invalid metadata")]
    InvalidMetadata,

    /// A fake IP arrived with no host mapping behind it.
    #[error("fake DNS record {0} missing")]
    FakeRecordMissing(IpAddr),

    /// The routing table has no adapter under this name.
    #[error("proxy {0} not found")]
    ProxyNotFound(String),

    /// A rule line or payload could not be parsed.
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// The underlying host lookup failed.
    #[error("lookup failed: {0}")]
    Lookup(#[source] io::Error),

    /// An outbound adapter failed to dial.
    #[error("dial {proxy} error: {source}")]
    Dial {
        proxy: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) | Error::Lookup(e) => e,
            Error::Dial { source, .. } => source,
            other => io::Error::other(other),
        }
    }
}
