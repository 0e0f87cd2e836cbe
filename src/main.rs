//! Gateway daemon entry point: reads configuration, brings up the control
//! and data plane, and runs every cooperative task to completion (which is
//! to say, forever) on a single-threaded `tokio` runtime.
//!
//! Grounded on `gateway_main.c`'s protothread scheduler: one `LocalSet`
//! stands in for the protothread loop, and each `tokio::task::spawn_local`
//! call below is one of its protothreads. Nothing here needs a second OS
//! thread because none of the state in [`mesh_uplink_gateway::core`] is ever
//! touched from two tasks at once — cooperative scheduling serializes every
//! borrow.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use mesh_uplink_gateway::config::{ConfigKey, ConfigStore, EnvConfigStore};
use mesh_uplink_gateway::core::{GatewayCore, GatewayIdentity};
use mesh_uplink_gateway::device_db::{DeviceStore, JsonDeviceStore};
use mesh_uplink_gateway::dhcp::DhcpSession;
use mesh_uplink_gateway::forwarding::BroadcastPortRule;
use mesh_uplink_gateway::gateway_services::{GATEWAY_SERVICES_PORT, GATEWAY_SERVICES_UDPX_PORT};
use mesh_uplink_gateway::net::{
    EthernetPort, Rng, SystemClock, SystemDnsResolver, ThreadRng, UdpSocketTransport, UdpTransport, WirelessPort,
};
use mesh_uplink_gateway::sntp;
use mesh_uplink_gateway::time_source::TimeSourcePublisher;
use mesh_uplink_gateway::{GatewayError, GatewayResult, IpV4Addr, MacAddr};

const DHCP_CLIENT_PORT: u16 = 68;
const DEFAULT_DEVICE_DB_PATH: &str = "gateway_devices.json";
/// How often the IP pool scans the bridge table for entries due for
/// renewal, matching `ip_pool_thread`'s polling cadence.
const IP_POOL_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Stand-in for the real link-layer driver: no NIC binding ships in this
/// crate (see [`mesh_uplink_gateway::net`]'s module doc), so until a
/// platform-specific [`EthernetPort`] is wired in, frames are only logged.
/// A real deployment swaps this for a raw-socket or TAP-backed adapter.
struct UnconnectedEthernet {
    mac: MacAddr,
}

#[async_trait::async_trait(?Send)]
impl EthernetPort for UnconnectedEthernet {
    fn mac_address(&self) -> MacAddr {
        self.mac
    }

    async fn send(&self, frame: &[u8]) -> std::io::Result<()> {
        log::debug!("no ethernet driver bound, dropping outbound frame ({} bytes)", frame.len());
        Ok(())
    }

    async fn recv(&self) -> std::io::Result<Vec<u8>> {
        std::future::pending().await
    }
}

/// Stand-in for the real mesh radio driver, for the same reason as
/// [`UnconnectedEthernet`].
struct UnconnectedWireless;

#[async_trait::async_trait(?Send)]
impl WirelessPort for UnconnectedWireless {
    async fn send(&self, _short_addr: Option<u16>, packet: &[u8]) -> std::io::Result<()> {
        log::debug!("no wireless driver bound, dropping outbound packet ({} bytes)", packet.len());
        Ok(())
    }

    async fn recv(&self) -> std::io::Result<(u16, Vec<u8>)> {
        std::future::pending().await
    }

    async fn publish_time(
        &self,
        _short_addr: u16,
        _sequence: u8,
        _local_us: u64,
        _ntp_now_us: u64,
    ) -> std::io::Result<()> {
        log::debug!("no wireless driver bound, dropping time-sync publication");
        Ok(())
    }
}

fn read_identity(config: &impl ConfigStore) -> GatewayResult<GatewayIdentity> {
    let mac = config
        .get_mac(ConfigKey::EthernetMac)?
        .ok_or(GatewayError::MissingConfig("ethernet_mac"))?;

    let short_addr = std::env::var("GATEWAY_SHORT_ADDR")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let device_id = std::env::var("GATEWAY_DEVICE_ID")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| mac.0.iter().fold(0_u64, |acc, b| (acc << 8) | *b as u64));

    Ok(GatewayIdentity {
        mac,
        short_addr,
        device_id,
    })
}

fn read_broadcast_ports(config: &impl ConfigStore) -> [Option<BroadcastPortRule>; 4] {
    let mut rules = [None, None, None, None];
    for (n, slot) in rules.iter_mut().enumerate() {
        if let Some(port) = config.get_u16(ConfigKey::BroadcastPort(n as u8)) {
            let local_only = config.get_bool(ConfigKey::BroadcastPortLocal(n as u8), false);
            *slot = Some(BroadcastPortRule { port, local_only });
        }
    }
    rules
}

/// How often the gateway's own lease countdown ticks while waiting out a
/// held lease, matching `local_dhcp_lease_thread`'s 4-second tick.
const LEASE_TICK_INTERVAL: Duration = Duration::from_secs(4);
/// Fraction of the lease remaining at which renewal begins (`lease/8`),
/// matching the T2-style renewal window in `local_dhcp_lease_thread`.
const LEASE_RENEWAL_FRACTION: u32 = 8;
/// Backoff between failed acquisition attempts (NAK, malformed ACK, socket
/// bind failure) before the whole DISCOVER/REQUEST exchange is retried.
const LEASE_RETRY_BACKOFF: Duration = Duration::from_secs(4);

/// Acquire and continuously renew this gateway's own upstream lease,
/// matching `local_dhcp_lease_thread`: an infinite loop that never gives up
/// on a failed exchange, and once configured, renews at the T2-style
/// `lease/8` window rather than waiting for outright expiry. Exits
/// immediately if a manual IP is configured, matching the original (there
/// is nothing to renew). Publishes every update through `network_info` so
/// the gateway-services listeners always see the current values.
async fn run_gateway_lease_task<D: DeviceStore>(
    core: GatewayCore<D>,
    config: EnvConfigStore,
    network_info: Rc<Cell<mesh_uplink_gateway::gateway_services::UpstreamNetworkInfo>>,
) {
    if !config.get_bool(ConfigKey::EnableDhcp, true) {
        if let Err(e) = acquire_manual_network(&core, &config, &network_info) {
            log::error!("manual upstream network configuration invalid: {e}");
        }
        return;
    }

    let mut rng = ThreadRng;
    loop {
        let lease_seconds = match acquire_dhcp_lease(&core, &mut rng, &network_info).await {
            Ok(seconds) => seconds,
            Err(e) => {
                log::warn!("gateway lease acquisition failed, retrying: {e}");
                tokio::time::sleep(LEASE_RETRY_BACKOFF).await;
                continue;
            }
        };

        let renewal_threshold = lease_seconds / LEASE_RENEWAL_FRACTION;
        let mut remaining = lease_seconds;
        while remaining > renewal_threshold {
            tokio::time::sleep(LEASE_TICK_INTERVAL).await;
            remaining = remaining.saturating_sub(LEASE_TICK_INTERVAL.as_secs() as u32);
        }
    }
}

/// Run one DISCOVER/REQUEST/ACK exchange for this gateway's own address and
/// publish the result, returning the lease time in seconds.
async fn acquire_dhcp_lease<D: DeviceStore>(
    core: &GatewayCore<D>,
    rng: &mut impl Rng,
    network_info: &Rc<Cell<mesh_uplink_gateway::gateway_services::UpstreamNetworkInfo>>,
) -> GatewayResult<u32> {
    use mesh_uplink_gateway::gateway_services::UpstreamNetworkInfo;

    let transport = UdpSocketTransport::bind(DHCP_CLIENT_PORT).await?;
    let client_id = core.identity.mac.0.to_vec();
    let session = DhcpSession::new(
        &transport,
        core.identity.mac,
        client_id,
        format!("gateway-{:012x}", core.identity.device_id),
        None,
    );
    let result = session
        .run(rng)
        .await
        .map_err(|_| GatewayError::DhcpFailed("uplink lease acquisition failed"))?;

    let router = result.router_ip.unwrap_or(IpV4Addr::ANY);
    core.set_upstream_network(result.ip_addr, result.subnet_mask, router);
    network_info.set(UpstreamNetworkInfo {
        subnet_mask: result.subnet_mask,
        dns_server: result.dns_server_ip.unwrap_or(IpV4Addr::ANY),
        internet_gateway: router,
    });
    log::info!(
        "acquired upstream address {} via dhcp (lease {}s)",
        result.ip_addr,
        result.ip_lease_time
    );

    Ok(result.ip_lease_time)
}

/// Apply a manually configured upstream address once, with no renewal loop.
fn acquire_manual_network<D: DeviceStore>(
    core: &GatewayCore<D>,
    config: &impl ConfigStore,
    network_info: &Rc<Cell<mesh_uplink_gateway::gateway_services::UpstreamNetworkInfo>>,
) -> GatewayResult<()> {
    use mesh_uplink_gateway::gateway_services::UpstreamNetworkInfo;

    let ip = config
        .get_ipv4(ConfigKey::ManualIp)?
        .ok_or(GatewayError::MissingConfig("manual_ip"))?;
    let subnet = config
        .get_ipv4(ConfigKey::ManualSubnet)?
        .ok_or(GatewayError::MissingConfig("manual_subnet"))?;
    let router = config.get_ipv4(ConfigKey::ManualRouter)?.unwrap_or(IpV4Addr::ANY);
    core.set_upstream_network(ip, subnet, router);
    network_info.set(UpstreamNetworkInfo {
        subnet_mask: subnet,
        dns_server: IpV4Addr::ANY,
        internet_gateway: router,
    });
    log::info!("using manually configured upstream address {ip}");

    Ok(())
}

/// Renew DHCP leases for any bridge table entry due for it, matching
/// `ip_pool_thread`'s periodic scan. Each mesh node is given a synthetic
/// MAC (this gateway's OUI plus its short address and device id) since it
/// has no Ethernet hardware of its own.
async fn run_ip_pool<D: DeviceStore>(core: GatewayCore<D>, our_device_id: u64) {
    let mut rng = ThreadRng;
    loop {
        tokio::time::sleep(IP_POOL_SCAN_INTERVAL).await;

        for short_addr in core.entries_needing_renewal() {
            let node_mac = MacAddr::new([
                0x02,
                0x00,
                (short_addr >> 8) as u8,
                short_addr as u8,
                (our_device_id >> 8) as u8,
                our_device_id as u8,
            ]);
            let client_id = {
                let mut id = vec![(short_addr & 0xFF) as u8];
                id.extend_from_slice(&node_mac.0);
                id
            };

            let transport = match UdpSocketTransport::bind(0).await {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("ip pool: failed to bind renewal socket: {e}");
                    continue;
                }
            };
            let requested_ip = core
                .bridge_table
                .borrow()
                .get_by_short_addr(short_addr)
                .map(|e| e.ip)
                .filter(|ip| !ip.is_zero());

            let session = DhcpSession::new(
                &transport,
                node_mac,
                client_id,
                format!("node-{short_addr:04x}"),
                requested_ip,
            );
            match session.run(&mut rng).await {
                Ok(result) => {
                    core.bridge_table.borrow_mut().apply_lease(
                        short_addr,
                        result.ip_addr,
                        result.ip_lease_time,
                    );
                    log::info!("renewed lease for mesh node {short_addr:#06x}: {}", result.ip_addr);
                }
                Err(e) => log::warn!("lease renewal failed for {short_addr:#06x}: {e}"),
            }
        }
    }
}

async fn run_gateway_services_listener<D: DeviceStore>(
    core: GatewayCore<D>,
    port: u16,
    wireless: Rc<impl WirelessPort>,
    network_info: Rc<Cell<mesh_uplink_gateway::gateway_services::UpstreamNetworkInfo>>,
) -> std::io::Result<()> {
    let socket = UdpSocketTransport::bind(port).await?;
    let clock = SystemClock::new();
    loop {
        let (bytes, from) = socket.recv_from().await?;
        let info = network_info.get();
        if let Err(e) = core
            .services
            .handle_datagram(&socket, from, &bytes, &clock, wireless.as_ref(), &info)
            .await
        {
            log::warn!("gateway services on port {port} failed to reply: {e}");
        }
    }
}

async fn run_sntp_client(network_clock: Rc<sntp::NetworkClock>, server_name: String, poll_interval_secs: u32) {
    let interval = Duration::from_secs(sntp::clamp_poll_interval(poll_interval_secs) as u64);
    let clock = SystemClock::new();
    let resolver = SystemDnsResolver;
    let transport = match UdpSocketTransport::bind(0).await {
        Ok(t) => t,
        Err(e) => {
            log::warn!("sntp client: failed to bind socket: {e}");
            return;
        }
    };
    loop {
        if sntp::sync_once(network_clock.as_ref(), &clock, &transport, &resolver, &server_name).await {
            log::info!("sntp sync succeeded (offset {}ms)", network_clock.last_offset_ms());
        } else {
            log::warn!("sntp sync attempt failed");
        }
        tokio::time::sleep(interval).await;
    }
}

async fn run_ethernet_rx<D: DeviceStore>(
    core: GatewayCore<D>,
    ethernet: Rc<impl EthernetPort>,
    wireless: Rc<impl WirelessPort>,
) {
    loop {
        match ethernet.recv().await {
            Ok(frame) => {
                core.forwarding
                    .on_ethernet_frame(&frame, ethernet.as_ref(), wireless.as_ref())
                    .await;
            }
            Err(e) => log::warn!("ethernet recv failed: {e}"),
        }
    }
}

async fn run_wireless_rx<D: DeviceStore>(core: GatewayCore<D>, ethernet: Rc<impl EthernetPort>, wireless: Rc<impl WirelessPort>) {
    loop {
        match wireless.recv().await {
            Ok((_short_addr, packet)) => {
                core.forwarding
                    .on_wireless_packet(&packet, ethernet.as_ref(), wireless.as_ref())
                    .await;
            }
            Err(e) => log::warn!("wireless recv failed: {e}"),
        }
    }
}

async fn run() -> GatewayResult<()> {
    let config = EnvConfigStore::from_env();
    let identity = read_identity(&config)?;
    let broadcast_ports = read_broadcast_ports(&config);
    let sntp_enabled = config.get_bool(ConfigKey::EnableSntp, false);
    let time_source_enabled = config.get_bool(ConfigKey::EnableTimeSource, false);

    let db_path = std::env::var("GATEWAY_DEVICE_DB_PATH").unwrap_or_else(|_| DEFAULT_DEVICE_DB_PATH.to_string());
    let device_store = JsonDeviceStore::open(&db_path)?;

    let core = GatewayCore::new(device_store, identity, sntp_enabled, broadcast_ports);
    core.preload_bridge_table();
    core.init_token(&mut ThreadRng);

    let network_info = Rc::new(Cell::new(mesh_uplink_gateway::gateway_services::UpstreamNetworkInfo {
        subnet_mask: IpV4Addr::ANY,
        dns_server: IpV4Addr::ANY,
        internet_gateway: IpV4Addr::ANY,
    }));

    let ethernet = Rc::new(UnconnectedEthernet { mac: identity.mac });
    let wireless = Rc::new(UnconnectedWireless);

    tokio::task::spawn_local({
        let core = core.clone();
        async move { core.run_aging_ticks().await }
    });

    tokio::task::spawn_local(run_ip_pool(core.clone(), identity.device_id));

    tokio::task::spawn_local(run_gateway_lease_task(
        core.clone(),
        config.clone(),
        network_info.clone(),
    ));

    tokio::task::spawn_local({
        let core = core.clone();
        let wireless = wireless.clone();
        let network_info = network_info.clone();
        async move {
            if let Err(e) =
                run_gateway_services_listener(core, GATEWAY_SERVICES_PORT, wireless, network_info).await
            {
                log::warn!("gateway services (plain) listener exited: {e}");
            }
        }
    });
    tokio::task::spawn_local({
        let core = core.clone();
        let wireless = wireless.clone();
        let network_info = network_info.clone();
        async move {
            if let Err(e) =
                run_gateway_services_listener(core, GATEWAY_SERVICES_UDPX_PORT, wireless, network_info).await
            {
                log::warn!("gateway services (udpx) listener exited: {e}");
            }
        }
    });

    tokio::task::spawn_local({
        let core = core.clone();
        async move {
            if let Ok(beacon_socket) = UdpSocketTransport::bind(0).await {
                core.services.run_token_beacon(&beacon_socket).await;
            } else {
                log::warn!("token beacon: failed to bind socket");
            }
        }
    });

    if sntp_enabled {
        let server_name = config
            .get_raw(ConfigKey::SntpServer)
            .unwrap_or_else(|| "pool.ntp.org".to_string());
        let poll_interval = config
            .get_u16(ConfigKey::SntpSyncInterval)
            .map(|v| v as u32)
            .unwrap_or(sntp::SNTP_DEFAULT_POLL_INTERVAL_SECS);
        let network_clock = core.network_clock.clone();
        tokio::task::spawn_local(run_sntp_client(network_clock, server_name, poll_interval));
    }

    if time_source_enabled {
        let wireless = wireless.clone();
        let network_clock = core.network_clock.clone();
        let short_addr = identity.short_addr;
        tokio::task::spawn_local(async move {
            let publisher = TimeSourcePublisher::new();
            let clock = SystemClock::new();
            publisher
                .run(wireless.as_ref(), &clock, network_clock.as_ref(), short_addr)
                .await;
        });
    }

    tokio::task::spawn_local(run_ethernet_rx(core.clone(), ethernet.clone(), wireless.clone()));
    tokio::task::spawn_local(run_wireless_rx(core.clone(), ethernet.clone(), wireless.clone()));

    // Every protothread above runs forever; this task's job is done once
    // they're all spawned.
    std::future::pending::<()>().await;
    Ok(())
}

fn main() {
    env_logger::init();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build tokio runtime");

    let local = tokio::task::LocalSet::new();
    if let Err(e) = local.block_on(&runtime, run()) {
        log::error!("gateway exited: {e}");
        std::process::exit(1);
    }
}
