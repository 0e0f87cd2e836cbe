//! Structural error types.
//!
//! Per-packet problems (malformed headers, a full bridge table, a dropped
//! datagram) are logged and the packet is discarded in place — they never
//! reach here. `GatewayError` only covers failures that stop a whole
//! subsystem from doing its job: a socket that won't bind, a config key
//! that's missing, a DNS name that won't resolve.

use thiserror::Error;

/// Errors that can terminate a gateway subsystem's setup or a single
/// request/response exchange.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("missing required configuration key: {0}")]
    MissingConfig(&'static str),

    #[error("configuration value for {key} could not be parsed: {reason}")]
    InvalidConfig {
        key: &'static str,
        reason: String,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dns resolution failed for {0}")]
    DnsResolution(String),

    #[error("bridge table is full ({0} entries)")]
    BridgeTableFull(usize),

    #[error("dhcp session timed out after {0} retries")]
    DhcpTimeout(u32),

    #[error("dhcp session failed: {0}")]
    DhcpFailed(&'static str),

    #[error("no route for {0}")]
    NoRoute(crate::IpV4Addr),
}

/// Convenience alias for fallible gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
