//! DHCP client state machine: DISCOVER -> OFFER -> REQUEST -> ACK, run as
//! an async task against a [`crate::net::UdpTransport`].
//!
//! Timeout and retry behavior mirrors `dhcp_client_thread` in the
//! reference gateway: each wait starts at 500ms and grows by 500ms per
//! round up to a 4000ms cap (500, 1000, 1500, ..., 4000, 4000, ...), and
//! the exchange never gives up on its own — a caller that wants to stop
//! retrying drops the session.

use tokio::time::{timeout, Duration};

use crate::net::{Rng, UdpTransport};
use crate::{IpV4Addr, MacAddr};

use super::protocol::{self, DhcpData, DhcpMessageKind, DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use super::{DhcpError, DhcpErrorKind};

const INITIAL_TIMEOUT_MS: u64 = 500;
const TIMEOUT_STEP_MS: u64 = 500;
const MAX_TIMEOUT_MS: u64 = 4000;
/// Upper bound on retransmissions per `send_and_await`, high enough that it
/// is never reached in practice (the reference client's `while (state ==
/// UNCONFIGURED)` never gives up); this only guards against spinning
/// forever inside a single exchange if the caller wants to bound it some
/// other way.
const MAX_RETRIES: u32 = u32::MAX;

/// Configuration handed back once a lease is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpSessionResult {
    pub ip_addr: IpV4Addr,
    pub subnet_mask: IpV4Addr,
    pub server_ip: IpV4Addr,
    pub router_ip: Option<IpV4Addr>,
    pub dns_server_ip: Option<IpV4Addr>,
    pub ip_lease_time: u32,
}

/// Drives one full DHCP exchange to completion (or failure) over the given
/// transport.
pub struct DhcpSession<'a, T: UdpTransport> {
    transport: &'a T,
    chaddr: MacAddr,
    client_id: Vec<u8>,
    hostname: String,
    requested_ip: Option<IpV4Addr>,
}

impl<'a, T: UdpTransport> DhcpSession<'a, T> {
    /// Build a new session. `client_id` is typically the node's MAC address
    /// prefixed by a bridge-table slot index, matching `ip_pool_thread`'s
    /// construction in the reference gateway.
    pub fn new(
        transport: &'a T,
        chaddr: MacAddr,
        client_id: Vec<u8>,
        hostname: String,
        requested_ip: Option<IpV4Addr>,
    ) -> Self {
        DhcpSession {
            transport,
            chaddr,
            client_id,
            hostname,
            requested_ip,
        }
    }

    /// Run DISCOVER -> OFFER -> REQUEST -> ACK to completion.
    pub async fn run(&self, rng: &mut impl Rng) -> Result<DhcpSessionResult, DhcpError> {
        let xid = rng.next_u32();

        let discover = protocol::build_discover(
            xid,
            self.chaddr,
            &self.client_id,
            &self.hostname,
            self.requested_ip,
        );
        let offer_data = self
            .send_and_await(&discover, xid, DhcpMessageKind::Offer)
            .await?;

        let offered_ip = offer_data
            .1
            .yiaddr;
        let server_ip = offer_data
            .0
            .server_ip
            .ok_or(DhcpErrorKind::MissingOption)?;

        let request = protocol::build_request(
            xid,
            self.chaddr,
            &self.client_id,
            &self.hostname,
            offered_ip,
            server_ip,
        );
        let (ack_data, ack_fixed) = self
            .send_and_await(&request, xid, DhcpMessageKind::Ack)
            .await?;

        Ok(DhcpSessionResult {
            ip_addr: ack_fixed.yiaddr,
            subnet_mask: ack_data.subnet_mask.ok_or(DhcpErrorKind::MissingOption)?,
            server_ip: ack_data.server_ip.unwrap_or(server_ip),
            router_ip: ack_data.router,
            dns_server_ip: ack_data.dns_server,
            ip_lease_time: ack_data.ip_lease_time.ok_or(DhcpErrorKind::MissingOption)?,
        })
    }

    /// Broadcast `message`, retrying with a growing timeout, until a
    /// response carrying `expect_kind` (or DHCPNAK) arrives for our `xid`.
    async fn send_and_await(
        &self,
        message: &[u8],
        xid: u32,
        expect_kind: DhcpMessageKind,
    ) -> Result<(DhcpData, protocol::DhcpFixedPayload), DhcpError> {
        let mut timeout_ms = INITIAL_TIMEOUT_MS;

        for _ in 0..MAX_RETRIES {
            self.transport
                .send_to((IpV4Addr::BROADCAST, DHCP_SERVER_PORT), message)
                .await
                .map_err(|_| DhcpErrorKind::Timeout)?;

            match timeout(Duration::from_millis(timeout_ms), self.transport.recv_from()).await {
                Ok(Ok((bytes, _from))) => match protocol::parse_message(&bytes, xid) {
                    Ok((fixed, data)) => {
                        if data.message_kind == Some(DhcpMessageKind::Nak) {
                            return Err(DhcpErrorKind::Nak.into());
                        }
                        if data.message_kind == Some(expect_kind) {
                            return Ok((data, fixed));
                        }
                        // Unrelated or mismatched reply; keep waiting out
                        // this round's timeout budget by retrying the send.
                    }
                    Err(_) => {}
                },
                Ok(Err(_)) | Err(_) => {}
            }

            timeout_ms = (timeout_ms + TIMEOUT_STEP_MS).min(MAX_TIMEOUT_MS);
        }

        Err(DhcpErrorKind::Timeout.into())
    }
}

#[allow(dead_code)]
fn _assert_ports_are_bootp() {
    debug_assert_eq!(DHCP_CLIENT_PORT, 68);
    debug_assert_eq!(DHCP_SERVER_PORT, 67);
}
