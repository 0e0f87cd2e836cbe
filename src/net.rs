//! Traits for the external collaborators this gateway sits between.
//!
//! The Ethernet driver, the wireless MAC/routing stack, the UDP socket
//! layer, and DNS resolution are all out of scope for this crate (see the
//! non-goals) — they're modeled here as traits so the core logic can be
//! exercised and tested without any of them, and so a real deployment can
//! plug in whatever hardware/OS binding it has.

use async_trait::async_trait;
use std::time::Duration;

use crate::{IpV4Addr, MacAddr};

/// Sends and receives raw Ethernet II frames on the upstream LAN interface.
#[async_trait(?Send)]
pub trait EthernetPort {
    /// This interface's own MAC address.
    fn mac_address(&self) -> MacAddr;

    /// Transmit a complete Ethernet II frame (header included).
    async fn send(&self, frame: &[u8]) -> std::io::Result<()>;

    /// Receive the next complete Ethernet II frame.
    async fn recv(&self) -> std::io::Result<Vec<u8>>;
}

/// Sends IPv4 packets to the wireless mesh and exposes the mesh's own
/// notion of network time, addressed by short (mesh) address.
#[async_trait(?Send)]
pub trait WirelessPort {
    /// Transmit an IPv4 packet (no link-layer framing) to a mesh node,
    /// identified by its short address, or broadcast if `None`.
    async fn send(&self, short_addr: Option<u16>, packet: &[u8]) -> std::io::Result<()>;

    /// Receive the next IPv4 packet from the mesh, along with the sending
    /// node's short address.
    async fn recv(&self) -> std::io::Result<(u16, Vec<u8>)>;

    /// Publish a network-time sync sample to the mesh (see
    /// [`crate::time_source`]): `local_us` is this gateway's own wall
    /// clock at the moment of publication, and `ntp_now_us` is the
    /// NTP-disciplined estimate of the same instant, distinct so a
    /// receiving node can discipline its own clock against the gateway's
    /// NTP sync rather than just its unsynced local time.
    async fn publish_time(
        &self,
        short_addr: u16,
        sequence: u8,
        local_us: u64,
        ntp_now_us: u64,
    ) -> std::io::Result<()>;

    /// Mesh network time in microseconds, as maintained by the wireless
    /// stack's own clock-sync subsystem, distinct from NTP. Used to answer
    /// the GET_NETWORK_TIME gateway service. Defaults to `0`/unsynced for
    /// implementations that don't track mesh time separately.
    fn network_time_us(&self) -> u64 {
        0
    }

    /// Whether the wireless stack's own clock-sync subsystem considers
    /// itself synchronized.
    fn is_network_time_synced(&self) -> bool {
        false
    }
}

/// A UDP datagram socket, abstracted so the gateway-services server and the
/// DHCP/SNTP clients can be tested against an in-memory double.
#[async_trait(?Send)]
pub trait UdpTransport {
    /// Send a datagram to `dst` (which may be a broadcast address).
    async fn send_to(&self, dst: (IpV4Addr, u16), data: &[u8]) -> std::io::Result<()>;

    /// Receive the next datagram and its source.
    async fn recv_from(&self) -> std::io::Result<(Vec<u8>, (IpV4Addr, u16))>;
}

/// Resolves a hostname to an IPv4 address.
#[async_trait(?Send)]
pub trait DnsResolver {
    /// Resolve `name`, or return `None` if resolution failed (the caller
    /// retries after a delay, matching the reference SNTP client).
    async fn resolve(&self, name: &str) -> Option<IpV4Addr>;
}

/// Wall-clock and monotonic time, abstracted for deterministic tests.
pub trait Clock {
    /// Milliseconds since an arbitrary epoch, monotonically increasing.
    fn monotonic_ms(&self) -> u64;

    /// Microseconds since the Unix epoch, per the system's best current
    /// estimate (may jump if disciplined by [`crate::sntp`]).
    fn wall_clock_us(&self) -> u64;
}

/// Source of randomness for DHCP transaction IDs and the gateway token.
pub trait Rng {
    /// A random 16-bit value.
    fn next_u16(&mut self) -> u16;

    /// A random 32-bit value, built from two 16-bit draws the same way the
    /// reference gateway's `rnd_u16_get_int()`-based callers do.
    fn next_u32(&mut self) -> u32 {
        ((self.next_u16() as u32) << 16) | self.next_u16() as u32
    }
}

/// [`Clock`] backed by [`std::time::Instant`]/[`std::time::SystemTime`].
pub struct SystemClock {
    start: std::time::Instant,
    wall_start_us: u64,
}

impl SystemClock {
    /// Build a clock anchored to the current instant.
    pub fn new() -> Self {
        let wall_start_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_micros() as u64;
        SystemClock {
            start: std::time::Instant::now(),
            wall_start_us,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    fn wall_clock_us(&self) -> u64 {
        self.wall_start_us + self.start.elapsed().as_micros() as u64
    }
}

/// [`Rng`] backed by the `rand` crate's thread-local generator.
#[derive(Default)]
pub struct ThreadRng;

impl Rng for ThreadRng {
    fn next_u16(&mut self) -> u16 {
        rand::random()
    }
}

/// [`UdpTransport`] backed by a bound [`tokio::net::UdpSocket`]. Used for
/// every control-plane role (DHCP client, SNTP client, gateway-services
/// listeners) since none of them need anything beyond a plain datagram
/// socket; only the link-layer/mesh-radio ports are hardware-specific
/// enough to be left to the deployment.
pub struct UdpSocketTransport {
    socket: tokio::net::UdpSocket,
}

impl UdpSocketTransport {
    /// Bind a UDP socket, enabling broadcast sends (every control-plane
    /// protocol here relies on `255.255.255.255`).
    pub async fn bind(port: u16) -> std::io::Result<Self> {
        let socket = tokio::net::UdpSocket::bind(("0.0.0.0", port)).await?;
        socket.set_broadcast(true)?;
        Ok(UdpSocketTransport { socket })
    }
}

#[async_trait(?Send)]
impl UdpTransport for UdpSocketTransport {
    async fn send_to(&self, dst: (IpV4Addr, u16), data: &[u8]) -> std::io::Result<()> {
        let addr = std::net::SocketAddrV4::new(dst.0.to_u32().into(), dst.1);
        self.socket.send_to(data, addr).await.map(|_| ())
    }

    async fn recv_from(&self) -> std::io::Result<(Vec<u8>, (IpV4Addr, u16))> {
        let mut buf = vec![0_u8; 2048];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        let ip = match from {
            std::net::SocketAddr::V4(v4) => IpV4Addr::from_u32((*v4.ip()).into()),
            std::net::SocketAddr::V6(_) => IpV4Addr::ANY,
        };
        Ok((buf, (ip, from.port())))
    }
}

/// [`DnsResolver`] backed by the system resolver via
/// [`tokio::net::lookup_host`].
#[derive(Default)]
pub struct SystemDnsResolver;

#[async_trait(?Send)]
impl DnsResolver for SystemDnsResolver {
    async fn resolve(&self, name: &str) -> Option<IpV4Addr> {
        let addrs = tokio::net::lookup_host((name, 0)).await.ok()?;
        addrs.into_iter().find_map(|addr| match addr {
            std::net::SocketAddr::V4(v4) => Some(IpV4Addr::from_u32((*v4.ip()).into())),
            std::net::SocketAddr::V6(_) => None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct FixedRng(u16, u16);
    impl Rng for FixedRng {
        fn next_u16(&mut self) -> u16 {
            let v = self.0;
            self.0 = self.1;
            v
        }
    }

    #[test]
    fn next_u32_combines_two_u16_draws() {
        let mut rng = FixedRng(0x1234, 0x5678);
        assert_eq!(rng.next_u32(), 0x1234_5678);
    }

    #[test]
    fn system_clock_monotonic_is_non_decreasing() {
        let clock = SystemClock::new();
        let a = clock.monotonic_ms();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.monotonic_ms();
        assert!(b >= a);
    }
}
