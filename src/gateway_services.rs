//! UDP control-plane server: the protocol mesh nodes use to request an IP
//! lease, poll for the gateway's token, and read back NTP/mesh time.
//!
//! Grounded on `gateway_services.h` (message layouts) and
//! `gateway_server.c` (`message_handler`, the token beacon thread). Two
//! listeners share the same handler, one on the plain UDP port and one on
//! the UDPX-reliable port; only the transport differs.

use byte_struct::*;

use crate::bridging::{BridgeFlags, BridgeTable};
use crate::device_db::{DeviceInfo, DeviceStore};
use crate::net::{Clock, Rng, UdpTransport, WirelessPort};
use crate::sntp::NetworkClock;
use crate::IpV4Addr;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

pub const GATEWAY_SERVICES_PORT: u16 = 25002;
pub const GATEWAY_SERVICES_UDPX_PORT: u16 = 25003;

/// Token beacon interval grows by one second per tick up to this cap,
/// matching `gateway_token_thread`.
const TOKEN_BEACON_MAX_INTERVAL: Duration = Duration::from_millis(60_000);
const TOKEN_BEACON_STEP: Duration = Duration::from_millis(1_000);

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RequestIpFlags: u8 {
        const MANUAL_IP = 0x01;
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NetworkTimeFlags: u8 {
        const WCOM_NETWORK_SYNC = 0x01;
        const NTP_SYNC = 0x02;
        const VALID = 0x04;
    }
}

#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct PollMsg {
    pub short_addr: u16,
}

#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct TokenMsg {
    pub token: u32,
    pub short_addr: u16,
    pub device_id: u64,
}

#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct RequestIpConfigMsg {
    pub flags: u8,
    pub short_addr: u16,
    pub ip: IpV4Addr,
    pub device_id: u64,
}

#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct IpConfigMsg {
    pub short_addr: u16,
    pub ip: IpV4Addr,
    pub subnet: IpV4Addr,
    pub dns_server: IpV4Addr,
    pub internet_gateway: IpV4Addr,
    pub token: u32,
}

#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct CurrentTimeMsg {
    pub time: u32,
}

#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct ResetIpConfigMsg {
    pub short_addr: u16,
}

#[derive(ByteStruct, Clone, Copy, Debug, PartialEq, Eq)]
#[byte_struct_be]
pub struct NetworkTimeMsg {
    pub flags: u8,
    pub ntp_time: u64,
    pub wcom_network_time: u32,
}

/// A parsed inbound message, tagged by the byte this protocol leads every
/// datagram with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayRequest {
    PollGateway(PollMsg),
    RequestIpConfig(RequestIpConfigMsg),
    RequestTime,
    ResetIpConfig(ResetIpConfigMsg),
    GetNetworkTime,
}

const MSG_POLL_GATEWAY: u8 = 1;
const MSG_GATEWAY_TOKEN: u8 = 2;
const MSG_REQUEST_IP_CONFIG: u8 = 3;
const MSG_IP_CONFIG: u8 = 4;
const MSG_REQUEST_TIME: u8 = 5;
const MSG_CURRENT_TIME: u8 = 6;
const MSG_RESET_IP_CONFIG: u8 = 7;
const MSG_RESET_IP_CONFIRM: u8 = 8;
const MSG_GET_NETWORK_TIME: u8 = 9;
const MSG_NETWORK_TIME: u8 = 10;

impl GatewayRequest {
    /// Parse a received datagram into a request this server handles, or
    /// `None` if it's a reply-only type or truncated.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (tag, body) = bytes.split_first()?;
        match *tag {
            MSG_POLL_GATEWAY if body.len() >= PollMsg::BYTE_LEN => {
                Some(GatewayRequest::PollGateway(PollMsg::read_bytes(body)))
            }
            MSG_REQUEST_IP_CONFIG if body.len() >= RequestIpConfigMsg::BYTE_LEN => Some(
                GatewayRequest::RequestIpConfig(RequestIpConfigMsg::read_bytes(body)),
            ),
            MSG_REQUEST_TIME => Some(GatewayRequest::RequestTime),
            MSG_RESET_IP_CONFIG if body.len() >= ResetIpConfigMsg::BYTE_LEN => Some(
                GatewayRequest::ResetIpConfig(ResetIpConfigMsg::read_bytes(body)),
            ),
            MSG_GET_NETWORK_TIME => Some(GatewayRequest::GetNetworkTime),
            _ => None,
        }
    }
}

fn frame(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 1);
    out.push(tag);
    out.extend_from_slice(body);
    out
}

/// Upstream network parameters handed out in IP_CONFIG responses, sourced
/// from whichever means (DHCP or manual config) acquired this gateway's own
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamNetworkInfo {
    pub subnet_mask: IpV4Addr,
    pub dns_server: IpV4Addr,
    pub internet_gateway: IpV4Addr,
}

/// Handles gateway-service requests against the shared bridge table and
/// device registry, and runs the token beacon. Cheap to clone: every field
/// is an `Rc` or a `Copy`/`Cell` value, so each spawned task (the two
/// listeners plus the token beacon) gets its own handle onto the same
/// underlying state.
pub struct GatewayServicesServer<D: DeviceStore> {
    bridge_table: Rc<RefCell<BridgeTable>>,
    device_store: Rc<RefCell<D>>,
    network_clock: Rc<NetworkClock>,
    our_short_addr: u16,
    our_device_id: u64,
    token: Cell<u32>,
}

/// Hand-written so cloning never requires `D: Clone` — every field here is
/// already shared via `Rc`.
impl<D: DeviceStore> Clone for GatewayServicesServer<D> {
    fn clone(&self) -> Self {
        GatewayServicesServer {
            bridge_table: self.bridge_table.clone(),
            device_store: self.device_store.clone(),
            network_clock: self.network_clock.clone(),
            our_short_addr: self.our_short_addr,
            our_device_id: self.our_device_id,
            token: Cell::new(self.token.get()),
        }
    }
}

impl<D: DeviceStore> GatewayServicesServer<D> {
    pub fn new(
        bridge_table: Rc<RefCell<BridgeTable>>,
        device_store: Rc<RefCell<D>>,
        network_clock: Rc<NetworkClock>,
        our_short_addr: u16,
        our_device_id: u64,
    ) -> Self {
        GatewayServicesServer {
            bridge_table,
            device_store,
            network_clock,
            our_short_addr,
            our_device_id,
            token: Cell::new(0),
        }
    }

    /// Draw a nonzero token, matching `gateway_server0_thread`'s
    /// reject-zero init loop.
    pub fn init_token(&self, rng: &mut impl Rng) {
        let mut token = 0;
        while token == 0 {
            token = rng.next_u32();
        }
        self.token.set(token);
    }

    pub fn token(&self) -> u32 {
        self.token.get()
    }

    /// Handle one received datagram, sending any reply on `sock`.
    pub async fn handle_datagram(
        &self,
        sock: &impl UdpTransport,
        from: (IpV4Addr, u16),
        bytes: &[u8],
        clock: &impl Clock,
        wireless: &impl WirelessPort,
        network_info: &UpstreamNetworkInfo,
    ) -> std::io::Result<()> {
        let Some(request) = GatewayRequest::parse(bytes) else {
            return Ok(());
        };

        match request {
            GatewayRequest::PollGateway(msg) => {
                let response = TokenMsg {
                    token: self.token.get(),
                    short_addr: self.our_short_addr,
                    device_id: self.our_device_id,
                };
                let _ = msg.short_addr;
                sock.send_to(from, &frame(MSG_GATEWAY_TOKEN, &response.to_be_bytes()))
                    .await
            }

            GatewayRequest::RequestIpConfig(msg) => {
                self.handle_request_ip_config(sock, from, msg, network_info)
                    .await
            }

            GatewayRequest::RequestTime => {
                let now = self.network_clock.now(clock);
                let response = CurrentTimeMsg { time: now.seconds };
                sock.send_to(from, &frame(MSG_CURRENT_TIME, &response.to_be_bytes()))
                    .await
            }

            GatewayRequest::ResetIpConfig(msg) => {
                if msg.short_addr == self.our_short_addr {
                    let response = [MSG_RESET_IP_CONFIRM];
                    sock.send_to(from, &response).await?;
                }
                Ok(())
            }

            GatewayRequest::GetNetworkTime => {
                let ntp_now = self.network_clock.now(clock);
                let wcom_now = wireless.network_time_us();

                let mut flags = NetworkTimeFlags::empty();
                if wireless.is_network_time_synced() {
                    flags.insert(NetworkTimeFlags::WCOM_NETWORK_SYNC);
                }
                if self.network_clock.status() == crate::sntp::SyncStatus::Synchronized {
                    flags.insert(NetworkTimeFlags::NTP_SYNC);
                }
                if flags.contains(NetworkTimeFlags::WCOM_NETWORK_SYNC | NetworkTimeFlags::NTP_SYNC)
                {
                    flags.insert(NetworkTimeFlags::VALID);
                }

                let response = NetworkTimeMsg {
                    flags: flags.bits(),
                    ntp_time: ((ntp_now.seconds as u64) << 32) | ntp_now.fraction as u64,
                    wcom_network_time: wcom_now as u32,
                };
                sock.send_to(from, &frame(MSG_NETWORK_TIME, &response.to_be_bytes()))
                    .await
            }
        }
    }

    async fn handle_request_ip_config(
        &self,
        sock: &impl UdpTransport,
        from: (IpV4Addr, u16),
        msg: RequestIpConfigMsg,
        network_info: &UpstreamNetworkInfo,
    ) -> std::io::Result<()> {
        let flags = RequestIpFlags::from_bits_truncate(msg.flags);
        let mut table = self.bridge_table.borrow_mut();

        let Some(bridge) = table.get_or_allocate(msg.short_addr) else {
            log::warn!("bridge table full, dropping request from {}", msg.short_addr);
            return Ok(());
        };

        let reply_addr: (IpV4Addr, u16);

        if flags.contains(RequestIpFlags::MANUAL_IP) {
            bridge.ip = msg.ip;
            bridge.flags = BridgeFlags::MANUAL_IP | BridgeFlags::IP_VALID;
            bridge.lease = 0;
            reply_addr = (msg.ip, from.1);
        } else if !bridge.flags.contains(BridgeFlags::IP_VALID) {
            bridge.flags.remove(BridgeFlags::MANUAL_IP);
            bridge.flags.insert(BridgeFlags::REQUEST_IP);
            bridge.lease = 0;
            bridge.time_left = 0;
            // No reply until the IP pool resolves a lease for this node.
            return Ok(());
        } else {
            reply_addr = (IpV4Addr::BROADCAST, from.1);
        }

        let ip = bridge.ip;
        let short_addr = bridge.short_addr;
        drop(table);

        self.device_store.borrow_mut().add_device(DeviceInfo {
            short_addr,
            device_id: msg.device_id,
            ip,
        });

        let response = IpConfigMsg {
            short_addr,
            ip,
            subnet: network_info.subnet_mask,
            dns_server: network_info.dns_server,
            internet_gateway: network_info.internet_gateway,
            token: self.token.get(),
        };
        sock.send_to(reply_addr, &frame(MSG_IP_CONFIG, &response.to_be_bytes()))
            .await
    }

    /// Run the token beacon forever: broadcast the current token on a
    /// growing interval, capped at one per minute.
    pub async fn run_token_beacon(&self, sock: &impl UdpTransport) {
        let mut interval = TOKEN_BEACON_STEP;
        loop {
            tokio::time::sleep(interval).await;
            if interval < TOKEN_BEACON_MAX_INTERVAL {
                interval += TOKEN_BEACON_STEP;
            }

            let msg = TokenMsg {
                token: self.token.get(),
                short_addr: self.our_short_addr,
                device_id: self.our_device_id,
            };
            if let Err(e) = sock
                .send_to(
                    (IpV4Addr::BROADCAST, GATEWAY_SERVICES_PORT),
                    &frame(MSG_GATEWAY_TOKEN, &msg.to_be_bytes()),
                )
                .await
            {
                log::warn!("token beacon send failed: {e}");
            }
        }
    }
}

trait ToBeBytesExt: ByteStruct + ByteStructLen {
    fn to_be_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut buf);
        buf
    }
}
impl<T: ByteStruct + ByteStructLen> ToBeBytesExt for T {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device_db::JsonDeviceStore;
    use crate::net::SystemClock;
    use async_trait::async_trait;
    use std::cell::RefCell;

    struct FixedRng(u32);
    impl Rng for FixedRng {
        fn next_u16(&mut self) -> u16 {
            (self.0 >> 16) as u16
        }
        fn next_u32(&mut self) -> u32 {
            self.0
        }
    }

    struct RecordingTransport {
        sent: RefCell<Vec<((IpV4Addr, u16), Vec<u8>)>>,
    }

    #[async_trait(?Send)]
    impl UdpTransport for RecordingTransport {
        async fn send_to(&self, dst: (IpV4Addr, u16), data: &[u8]) -> std::io::Result<()> {
            self.sent.borrow_mut().push((dst, data.to_vec()));
            Ok(())
        }

        async fn recv_from(&self) -> std::io::Result<(Vec<u8>, (IpV4Addr, u16))> {
            std::future::pending().await
        }
    }

    struct NullWireless;
    #[async_trait(?Send)]
    impl WirelessPort for NullWireless {
        async fn send(&self, _s: Option<u16>, _p: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
        async fn recv(&self) -> std::io::Result<(u16, Vec<u8>)> {
            std::future::pending().await
        }
        async fn publish_time(&self, _s: u16, _seq: u8, _local_us: u64, _ntp_now_us: u64) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn network_info() -> UpstreamNetworkInfo {
        UpstreamNetworkInfo {
            subnet_mask: IpV4Addr::new([255, 255, 255, 0]),
            dns_server: IpV4Addr::new([8, 8, 8, 8]),
            internet_gateway: IpV4Addr::new([10, 0, 0, 1]),
        }
    }

    #[test]
    fn parses_poll_gateway_message() {
        let bytes = frame(MSG_POLL_GATEWAY, &PollMsg { short_addr: 7 }.to_be_bytes());
        assert_eq!(
            GatewayRequest::parse(&bytes),
            Some(GatewayRequest::PollGateway(PollMsg { short_addr: 7 }))
        );
    }

    #[tokio::test]
    async fn poll_gateway_replies_with_current_token() {
        let bridge_table = Rc::new(RefCell::new(BridgeTable::new()));
        let device_store = Rc::new(RefCell::new(JsonDeviceStore::in_memory()));
        let network_clock = Rc::new(NetworkClock::new(false));
        let server = GatewayServicesServer::new(bridge_table.clone(), device_store.clone(), network_clock.clone(), 42, 9);
        server.init_token(&mut FixedRng(0xDEAD_BEEF));

        let sock = RecordingTransport {
            sent: RefCell::new(Vec::new()),
        };
        let clock = SystemClock::new();
        let wireless = NullWireless;

        let request = frame(MSG_POLL_GATEWAY, &PollMsg { short_addr: 1 }.to_be_bytes());
        server
            .handle_datagram(
                &sock,
                (IpV4Addr::new([10, 0, 0, 5]), 9000),
                &request,
                &clock,
                &wireless,
                &network_info(),
            )
            .await
            .unwrap();

        let sent = sock.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1[0], MSG_GATEWAY_TOKEN);
        let token_msg = TokenMsg::read_bytes(&sent[0].1[1..]);
        assert_eq!(token_msg.token, server.token());
    }

    #[tokio::test]
    async fn request_ip_config_with_manual_ip_unicasts_immediately() {
        let bridge_table = Rc::new(RefCell::new(BridgeTable::new()));
        let device_store = Rc::new(RefCell::new(JsonDeviceStore::in_memory()));
        let network_clock = Rc::new(NetworkClock::new(false));
        let server = GatewayServicesServer::new(bridge_table.clone(), device_store.clone(), network_clock.clone(), 42, 9);

        let sock = RecordingTransport {
            sent: RefCell::new(Vec::new()),
        };
        let clock = SystemClock::new();
        let wireless = NullWireless;

        let msg = RequestIpConfigMsg {
            flags: RequestIpFlags::MANUAL_IP.bits(),
            short_addr: 3,
            ip: IpV4Addr::new([10, 0, 0, 77]),
            device_id: 555,
        };
        let request = frame(MSG_REQUEST_IP_CONFIG, &msg.to_be_bytes());
        server
            .handle_datagram(
                &sock,
                (IpV4Addr::new([10, 0, 0, 5]), 9000),
                &request,
                &clock,
                &wireless,
                &network_info(),
            )
            .await
            .unwrap();

        let sent = sock.sent.borrow();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0 .0, IpV4Addr::new([10, 0, 0, 77]));
        let config = IpConfigMsg::read_bytes(&sent[0].1[1..]);
        assert_eq!(config.ip, IpV4Addr::new([10, 0, 0, 77]));
        assert_eq!(device_store.borrow().count(), 1);
    }

    #[tokio::test]
    async fn request_ip_config_without_valid_lease_withholds_reply() {
        let bridge_table = Rc::new(RefCell::new(BridgeTable::new()));
        let device_store = Rc::new(RefCell::new(JsonDeviceStore::in_memory()));
        let network_clock = Rc::new(NetworkClock::new(false));
        let server = GatewayServicesServer::new(bridge_table.clone(), device_store.clone(), network_clock.clone(), 42, 9);

        let sock = RecordingTransport {
            sent: RefCell::new(Vec::new()),
        };
        let clock = SystemClock::new();
        let wireless = NullWireless;

        let msg = RequestIpConfigMsg {
            flags: 0,
            short_addr: 4,
            ip: IpV4Addr::ANY,
            device_id: 1,
        };
        let request = frame(MSG_REQUEST_IP_CONFIG, &msg.to_be_bytes());
        server
            .handle_datagram(
                &sock,
                (IpV4Addr::new([10, 0, 0, 5]), 9000),
                &request,
                &clock,
                &wireless,
                &network_info(),
            )
            .await
            .unwrap();

        assert!(sock.sent.borrow().is_empty());
        assert!(bridge_table
            .borrow()
            .get_by_short_addr(4)
            .unwrap()
            .flags
            .contains(BridgeFlags::REQUEST_IP));
    }
}
