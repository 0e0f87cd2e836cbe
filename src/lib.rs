//! Wireless-to-Ethernet IPv4 bridging gateway.
//!
//! Joins an upstream Ethernet LAN via DHCP, brokers IPv4 addresses and
//! network time for nodes on a wireless mesh, and forwards IPv4 traffic
//! between the two sides under policy (proxy ARP, TTL-scoped multicast,
//! DHCP-proxying via a bridge table).
//!
//! The on-wire codecs (Ethernet/IP/UDP/ARP/DHCP headers) are built on
//! [`byte_struct`], same as the packet layer this crate grew out of; the
//! gateway logic above them runs as a set of cooperative `tokio` tasks on a
//! single-threaded runtime rather than real OS threads, since none of the
//! state below ever needs to survive a preemption.

#![allow(dead_code)]

pub use byte_struct::{ByteStruct, ByteStructLen};
pub use ufmt::{derive::uDebug, uDebug, uDisplay, uWrite};

pub mod enet; // Link layer
pub mod ip; // Internet layer
pub mod udp; // Transport layer

pub mod arp; // Address resolution + proxy-ARP cache
pub mod icmp; // ICMP echo/TTL-exceeded/dest-unreachable
pub mod dhcp; // DHCP client state machine + wire codec

pub mod bridging; // Bridge table / mesh-node IP leasing
pub mod config; // Typed configuration store
pub mod core; // GatewayCore aggregate
pub mod device_db; // Persisted device registry
pub mod error;
pub mod forwarding; // Forwarding plane
pub mod gateway_services; // UDP control-plane server
pub mod net; // External-collaborator traits (sockets, ports, clock, rng)
pub mod sntp; // SNTP client + network clock
pub mod stats; // Counters
pub mod time_source; // Periodic NTP-to-mesh time publisher

pub use error::{GatewayError, GatewayResult};

/// Standard 6-byte MAC address.
///
/// Split 24/24 format, Block ID | Device ID. Locally-administered addresses
/// start with `0x02`, `0x06`, `0x0A`, or `0x0E`.
pub type MacAddr = ByteArray<6>;

impl MacAddr {
    /// New from bytes.
    pub fn new(v: [u8; 6]) -> Self {
        ByteArray(v)
    }

    /// Broadcast address (all ones).
    pub const BROADCAST: MacAddr = ByteArray([0xFF_u8; 6]);

    /// Any address (all zeroes).
    pub const ANY: MacAddr = ByteArray([0x0_u8; 6]);
}

/// IPv4 address as bytes.
pub type IpV4Addr = ByteArray<4>;

impl IpV4Addr {
    /// New from bytes.
    pub fn new(v: [u8; 4]) -> Self {
        ByteArray(v)
    }

    /// Broadcast address (all ones).
    pub const BROADCAST: IpV4Addr = ByteArray([0xFF_u8; 4]);

    /// Any address (all zeroes).
    pub const ANY: IpV4Addr = ByteArray([0x0_u8; 4]);

    /// As a plain `u32` in host order, for subnet/mask arithmetic.
    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    /// From a plain `u32` in host order.
    pub fn from_u32(v: u32) -> Self {
        ByteArray(v.to_be_bytes())
    }

    /// `true` if this address is `0.0.0.0`.
    pub fn is_zero(&self) -> bool {
        self.0 == [0_u8; 4]
    }

    /// `true` if this is the all-subnets broadcast address (`255.255.255.255`)
    /// or the directed broadcast for `mask` (host bits all set).
    pub fn is_broadcast(&self, mask: IpV4Addr) -> bool {
        if *self == IpV4Addr::BROADCAST {
            return true;
        }
        let host_bits = !mask.to_u32();
        (self.to_u32() & host_bits) == host_bits && host_bits != 0
    }

    /// `true` if `self` and `other` are on the same subnet under `mask`.
    pub fn same_subnet(&self, other: IpV4Addr, mask: IpV4Addr) -> bool {
        (self.to_u32() & mask.to_u32()) == (other.to_u32() & mask.to_u32())
    }

    /// `true` for the loopback range `127.0.0.0/8`.
    pub fn is_loopback(&self) -> bool {
        self.0[0] == 127
    }
}

/// Common choices of transport-layer protocols and their IP header values.
///
/// There are many more protocols not listed here; see
/// <https://en.wikipedia.org/wiki/List_of_IP_protocol_numbers>.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Protocol {
    /// Internet Control Message Protocol
    Icmp = 0x01,
    /// Transmission Control Protocol
    Tcp = 0x06,
    /// User Datagram Protocol
    Udp = 0x11,
    /// Unimplemented / not one of the protocols this gateway forwards
    Unimplemented,
}

impl uDebug for Protocol {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: uWrite + ?Sized,
    {
        match self {
            Protocol::Icmp => f.write_str("Icmp"),
            Protocol::Tcp => f.write_str("Tcp"),
            Protocol::Udp => f.write_str("Udp"),
            Protocol::Unimplemented => f.write_str("Unimplemented"),
        }
    }
}

impl ByteStructLen for Protocol {
    const BYTE_LEN: usize = 1;
}

impl ByteStruct for Protocol {
    fn read_bytes(bytes: &[u8]) -> Self {
        match bytes[0] {
            x if x == (Protocol::Icmp as u8) => Protocol::Icmp,
            x if x == (Protocol::Tcp as u8) => Protocol::Tcp,
            x if x == (Protocol::Udp as u8) => Protocol::Udp,
            _ => Protocol::Unimplemented,
        }
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = *self as u8;
    }
}

/// Type-of-service for networks with differentiated services.
///
/// See <https://en.wikipedia.org/wiki/Differentiated_services>.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DSCP {
    /// Standard is almost always fine
    Standard = 0,
    /// Realtime is rarely used
    Realtime = 32 << 2,
    /// Catch-all for the many other kinds or invalid bit patterns
    Unimplemented,
}

impl uDebug for DSCP {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: uWrite + ?Sized,
    {
        match self {
            DSCP::Standard => f.write_str("Standard"),
            DSCP::Realtime => f.write_str("Realtime"),
            DSCP::Unimplemented => f.write_str("Unimplemented"),
        }
    }
}

impl ByteStructLen for DSCP {
    const BYTE_LEN: usize = 1;
}

impl ByteStruct for DSCP {
    fn read_bytes(bytes: &[u8]) -> Self {
        match bytes[0] {
            x if x == (DSCP::Standard as u8) => DSCP::Standard,
            x if x == (DSCP::Realtime as u8) => DSCP::Realtime,
            _ => DSCP::Unimplemented,
        }
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0] = *self as u8;
    }
}

/// Newtype for `[u8; N]` in order to implement external traits on it.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ByteArray<const N: usize>(pub [u8; N]);

impl<const N: usize> ByteStructLen for ByteArray<N> {
    const BYTE_LEN: usize = N;
}

impl<const N: usize> ByteStruct for ByteArray<N> {
    fn read_bytes(bytes: &[u8]) -> Self {
        let mut out = [0_u8; N];
        out.copy_from_slice(&bytes[0..N]);
        ByteArray(out)
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        bytes[0..N].copy_from_slice(&self.0);
    }
}

impl<const N: usize> ByteArray<N> {
    /// Convert to big-endian byte array.
    pub fn to_be_bytes(&self) -> [u8; N] {
        self.0
    }
}

impl uDebug for ByteArray<4> {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: uWrite + ?Sized,
    {
        <[u8; 4] as uDebug>::fmt(&self.0, f)
    }
}

impl uDebug for ByteArray<6> {
    fn fmt<W>(&self, f: &mut ufmt::Formatter<'_, W>) -> Result<(), W::Error>
    where
        W: uWrite + ?Sized,
    {
        <[u8; 6] as uDebug>::fmt(&self.0, f)
    }
}

impl ::core::fmt::Display for IpV4Addr {
    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

impl ::core::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Derive To/From with an added "Unknown" variant catch-all for converting
/// from numerical values that do not match a valid variant, avoiding either
/// a panic or cumbersome error handling.
///
/// Yoinked shamelessly (with some modification) from smoltcp.
#[macro_export]
macro_rules! enum_with_unknown {
    (
        $( #[$enum_attr:meta] )*
        pub enum $name:ident($ty:ty) {
            $(
              $( #[$variant_attr:meta] )*
              $variant:ident = $value:expr
            ),+ $(,)?
        }
    ) => {
        #[derive(Debug, $crate::uDebug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
        $( #[$enum_attr] )*
        pub enum $name {
            $(
              $( #[$variant_attr] )*
              $variant
            ),*,
            /// Catch-all for values that do not match a variant
            Unknown($ty)
        }

        impl ::core::convert::From<$ty> for $name {
            fn from(value: $ty) -> Self {
                match value {
                    $( $value => $name::$variant ),*,
                    other => $name::Unknown(other)
                }
            }
        }

        impl ::core::convert::From<$name> for $ty {
            fn from(value: $name) -> Self {
                match value {
                    $( $name::$variant => $value ),*,
                    $name::Unknown(other) => other
                }
            }
        }
    }
}

/// Calculate an IP checksum per IETF-RFC-1071 section 4.1.
///
/// See <https://datatracker.ietf.org/doc/html/rfc1071#section-4>.
pub fn calc_ip_checksum(data: &[u8]) -> u16 {
    calc_ip_checksum_finalize(calc_ip_checksum_incomplete(data))
}

/// Finalize an IP checksum by folding the accumulator from a `u32` down to a
/// `u16` and taking the one's complement.
pub fn calc_ip_checksum_finalize(sum: u32) -> u16 {
    let mut sum = sum;
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Accumulate an IP checksum over a byte slice without finalizing it, so
/// that multiple disjoint regions (e.g. a pseudo-header and a payload) can
/// be summed before folding.
pub fn calc_ip_checksum_incomplete(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn checksum_of_self_embedded_checksum_is_zero() {
        let mut header = crate::ip::IpV4Header {
            version_and_length: crate::ip::VersionAndHeaderLength::new()
                .with_version(4)
                .with_header_length(5),
            dscp: DSCP::Standard,
            total_length: 20,
            identification: 0,
            fragmentation: crate::ip::Fragmentation::new(),
            time_to_live: 64,
            protocol: Protocol::Udp,
            checksum: 0,
            src_ipaddr: IpV4Addr::new([10, 0, 0, 1]),
            dst_ipaddr: IpV4Addr::new([10, 0, 0, 2]),
        };
        header.checksum = calc_ip_checksum(&header.to_be_bytes());
        assert_eq!(calc_ip_checksum(&header.to_be_bytes()), 0);
    }

    #[test]
    fn checksum_handles_odd_length_input() {
        // A single trailing byte must be folded in as the high byte of a
        // pair, matching the original implementation's behavior.
        let odd = [0x12_u8, 0x34, 0x56];
        let sum = calc_ip_checksum_incomplete(&odd);
        assert_eq!(sum, 0x1234 + 0x5600);
    }

    #[test]
    fn ip_and_mac_display() {
        assert_eq!(format!("{}", IpV4Addr::new([10, 0, 0, 1])), "10.0.0.1");
        assert_eq!(
            format!("{}", MacAddr::new([0, 1, 2, 3, 4, 5])),
            "00:01:02:03:04:05"
        );
    }

    #[test]
    fn broadcast_and_subnet_helpers() {
        let mask = IpV4Addr::new([255, 255, 255, 0]);
        let dir_bcast = IpV4Addr::new([10, 0, 0, 255]);
        let host = IpV4Addr::new([10, 0, 0, 42]);
        assert!(dir_bcast.is_broadcast(mask));
        assert!(!host.is_broadcast(mask));
        assert!(host.same_subnet(dir_bcast, mask));
        assert!(!host.same_subnet(IpV4Addr::new([10, 0, 1, 42]), mask));
    }
}
