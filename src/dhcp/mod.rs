//! Dynamic Host Configuration Protocol client, per IETF-RFC-2131.
//!
//! `protocol` holds the wire codec (fixed BOOTP-style payload plus the
//! variable-length options list); `client` drives the
//! DISCOVER/OFFER/REQUEST/ACK exchange as an async state machine.

pub mod client;
pub mod protocol;

pub use client::{DhcpSession, DhcpSessionResult};
pub use protocol::*;

use thiserror::Error;

/// Failure modes for a single DHCP exchange.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DhcpErrorKind {
    #[error("no response within the retry budget")]
    Timeout,
    #[error("server sent DHCPNAK")]
    Nak,
    #[error("response transaction id did not match the request")]
    XidMismatch,
    #[error("response was too short to contain a DHCP payload")]
    Truncated,
    #[error("response was missing a required option")]
    MissingOption,
}

/// A DHCP protocol error, with the kind for programmatic matching.
#[derive(Debug, Error)]
#[error("dhcp error: {kind}")]
pub struct DhcpError {
    pub kind: DhcpErrorKind,
}

impl From<DhcpErrorKind> for DhcpError {
    fn from(kind: DhcpErrorKind) -> Self {
        DhcpError { kind }
    }
}
