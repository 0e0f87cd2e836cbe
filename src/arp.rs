//! Address Resolution Protocol: wire codec, lookup cache, and proxy-ARP
//! responder.
//!
//! ARP is not a distinct layer, but nearly every Ethernet-attached host
//! needs it before it can address an IP packet to a MAC address. On this
//! gateway it also carries proxy-ARP duty: when an Ethernet host asks for a
//! mesh node's IP, or for the gateway's own IP, we answer on that node's
//! behalf since mesh nodes never see Ethernet ARP traffic directly.

use crate::{IpV4Addr, MacAddr};

use byte_struct::*;
use static_assertions::const_assert;
use ufmt::derive::uDebug;

const_assert!(ArpPayload::BYTE_LEN == 46); // minimum ethernet payload size

/// Fixed-size cache of resolved IP-to-MAC mappings, aged on a periodic tick
/// and evicted by oldest-first replacement when full, matching the original
/// gateway's 16-entry cache ticked every 100ms.
pub const ARP_MAX_CACHE_ENTRIES: usize = 16;
/// One aging tick happens on this period.
pub const ARP_AGING_TICK_MS: u64 = 100;
/// An entry this many ticks old (10 seconds) is preferentially evicted.
pub const ARP_MAX_AGE_TICKS: u32 = 100;

/// An ARP request or response with IPv4 addresses and standard MAC
/// addresses.
///
/// See <https://en.wikipedia.org/wiki/Address_Resolution_Protocol>. Hardware
/// type is always 1 (ethernet) here.
#[derive(ByteStruct, Clone, Copy, uDebug, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[byte_struct_be]
pub struct ArpPayload {
    /// Hardware type (1 for ethernet)
    pub htype: u16,
    /// Protocol type (same as ethertype from ethernet header)
    pub ptype: ProtocolType,
    /// Hardware address length (6 for standard MAC)
    pub hlen: u8,
    /// Protocol address length (4 for IPv4)
    pub plen: u8,
    /// ARP operation type
    pub operation: ArpOperation,
    /// Source MAC address
    pub src_mac: MacAddr,
    /// Source IP address
    pub src_ipaddr: IpV4Addr,
    /// Destination MAC address
    pub dst_mac: MacAddr,
    /// Destination IP address
    pub dst_ipaddr: IpV4Addr,
    /// Pad to minimum frame size
    _pad0: u128,
    _pad1: u16,
}

impl ArpPayload {
    /// Create a new ARP payload for IPv4 on ethernet.
    pub fn new(
        src_mac: MacAddr,
        src_ipaddr: IpV4Addr,
        dst_mac: MacAddr,
        dst_ipaddr: IpV4Addr,
        operation: ArpOperation,
    ) -> Self {
        ArpPayload {
            htype: 1,
            ptype: ProtocolType::IpV4,
            hlen: 6,
            plen: 4,
            operation,
            src_mac,
            src_ipaddr,
            dst_mac,
            dst_ipaddr,
            _pad0: 0,
            _pad1: 0,
        }
    }

    /// Convert to a big-endian byte array.
    pub fn to_be_bytes(&self) -> [u8; Self::BYTE_LEN] {
        let mut bytes = [0_u8; Self::BYTE_LEN];
        self.write_bytes(&mut bytes);
        bytes
    }

    /// Build the reply to a request we're answering on behalf of
    /// `answered_ip` (ourselves or a bridged mesh node), carrying
    /// `answered_mac` as the resolved hardware address.
    ///
    /// The original gateway's proxy replies set the sender protocol address
    /// to the *target* address of the request, not the gateway's own
    /// address — this preserves that quirk so a packet capture looks the
    /// same as the reference implementation's.
    pub fn proxy_reply(request: &ArpPayload, answered_mac: MacAddr) -> ArpPayload {
        ArpPayload::new(
            answered_mac,
            request.dst_ipaddr,
            request.src_mac,
            request.src_ipaddr,
            ArpOperation::Response,
        )
    }
}

/// ARP request or response flag values.
#[derive(Clone, Copy, uDebug, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum ArpOperation {
    /// This is a request to confirm target IP address and acquire the
    /// associated MAC address
    Request = 1,
    /// This is a response to confirm our IP address and provide the
    /// associated MAC address
    Response = 2,
    /// Invalid operation
    Unimplemented,
}

impl From<u16> for ArpOperation {
    fn from(value: u16) -> Self {
        match value {
            x if x == ArpOperation::Request as u16 => ArpOperation::Request,
            x if x == ArpOperation::Response as u16 => ArpOperation::Response,
            _ => ArpOperation::Unimplemented,
        }
    }
}

impl ByteStructLen for ArpOperation {
    const BYTE_LEN: usize = 2;
}

impl ByteStruct for ArpOperation {
    fn read_bytes(bytes: &[u8]) -> Self {
        ArpOperation::from(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        let out = (*self as u16).to_be_bytes();
        bytes[0] = out[0];
        bytes[1] = out[1];
    }
}

/// Protocol Type flags, identical in value to EtherType but kept distinct
/// to avoid a circular dependency between the arp and enet modules.
#[derive(Clone, Copy, uDebug, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum ProtocolType {
    /// Internet protocol version 4
    IpV4 = 0x0800,
    /// Address resolution protocol
    Arp = 0x0806,
    /// Catch-all for uncommon types not handled here
    Unimplemented = 0x0,
}

impl From<u16> for ProtocolType {
    fn from(value: u16) -> Self {
        match value {
            x if x == ProtocolType::Arp as u16 => ProtocolType::Arp,
            x if x == ProtocolType::IpV4 as u16 => ProtocolType::IpV4,
            _ => ProtocolType::Unimplemented,
        }
    }
}

impl ByteStructLen for ProtocolType {
    const BYTE_LEN: usize = 2;
}

impl ByteStruct for ProtocolType {
    fn read_bytes(bytes: &[u8]) -> Self {
        ProtocolType::from(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn write_bytes(&self, bytes: &mut [u8]) {
        let out = (*self as u16).to_be_bytes();
        bytes[0] = out[0];
        bytes[1] = out[1];
    }
}

/// One resolved IP-to-MAC mapping and its age, in [`ArpCache::tick`] units.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpEntry {
    pub ip: IpV4Addr,
    pub mac: MacAddr,
    pub age_ticks: u32,
}

/// Fixed-size, age-ordered ARP cache. Entries are never actively expired;
/// an aging tick only makes older entries more likely to be evicted the
/// next time a new mapping needs a slot and the table is full, matching
/// `arp_v_tmr_callback`/`arp_v_recv` in the reference gateway.
#[derive(Debug, Clone)]
pub struct ArpCache {
    entries: [Option<ArpEntry>; ARP_MAX_CACHE_ENTRIES],
}

impl Default for ArpCache {
    fn default() -> Self {
        ArpCache {
            entries: [None; ARP_MAX_CACHE_ENTRIES],
        }
    }
}

impl ArpCache {
    /// New, empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance every live entry's age by one tick. Call this once per
    /// [`ARP_AGING_TICK_MS`].
    pub fn tick(&mut self) {
        for entry in self.entries.iter_mut().flatten() {
            entry.age_ticks = entry.age_ticks.saturating_add(1);
        }
    }

    /// Look up a live mapping by IP address.
    pub fn lookup(&self, ip: IpV4Addr) -> Option<MacAddr> {
        self.entries
            .iter()
            .flatten()
            .find(|e| e.ip == ip)
            .map(|e| e.mac)
    }

    /// Record or refresh a mapping, matching the reference implementation's
    /// slot-selection order: reuse an existing entry for the same IP if one
    /// exists, else take the first empty slot, else evict the oldest entry
    /// (ties broken in favor of the lowest index, since the scan keeps the
    /// first entry whose age is *strictly* greater than the current
    /// maximum).
    pub fn insert(&mut self, ip: IpV4Addr, mac: MacAddr) {
        if let Some(existing) = self.entries.iter_mut().flatten().find(|e| e.ip == ip) {
            existing.mac = mac;
            existing.age_ticks = 0;
            return;
        }

        if let Some(slot) = self.entries.iter_mut().find(|e| e.is_none()) {
            *slot = Some(ArpEntry {
                ip,
                mac,
                age_ticks: 0,
            });
            return;
        }

        let mut oldest_index = 0;
        let mut oldest_age = 0_u32;
        for (i, entry) in self.entries.iter().enumerate() {
            if let Some(e) = entry {
                if e.age_ticks > oldest_age {
                    oldest_age = e.age_ticks;
                    oldest_index = i;
                }
            }
        }
        self.entries[oldest_index] = Some(ArpEntry {
            ip,
            mac,
            age_ticks: 0,
        });
    }

    /// Snapshot the live entries, for the `arp_cache` diagnostic dump.
    pub fn snapshot(&self) -> impl Iterator<Item = &ArpEntry> {
        self.entries.iter().flatten()
    }
}

/// Resolution for an inbound ARP request against this gateway's own
/// knowledge of who it should answer for.
pub enum ArpAnswer {
    /// Reply with our own MAC, for our own IP.
    Ourselves,
    /// Reply on behalf of a bridged mesh node with this MAC.
    Proxy(MacAddr),
    /// Not an address we know anything about; do not reply.
    NotOurs,
}

/// Decide how to answer an ARP request, given our own IP/MAC and a lookup
/// function for the bridge table (by IP -> mesh node's assigned MAC is not
/// meaningful on the wireless side, so bridged replies carry the gateway's
/// own Ethernet MAC — the gateway always proxies on the node's behalf).
pub fn answer_for(
    request: &ArpPayload,
    our_ip: IpV4Addr,
    our_mac: MacAddr,
    is_bridged: impl FnOnce(IpV4Addr) -> bool,
) -> ArpAnswer {
    if request.dst_ipaddr == our_ip {
        ArpAnswer::Ourselves
    } else if is_bridged(request.dst_ipaddr) {
        ArpAnswer::Proxy(our_mac)
    } else {
        ArpAnswer::NotOurs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_round_trip() {
        let msg = ArpPayload::new(
            MacAddr::new([7_u8; 6]),
            IpV4Addr::new([8_u8; 4]),
            MacAddr::new([9_u8; 6]),
            IpV4Addr::new([10_u8; 4]),
            ArpOperation::Request,
        );
        let bytes: [u8; ArpPayload::BYTE_LEN] = msg.to_be_bytes();
        let parsed = ArpPayload::read_bytes(&bytes);
        assert_eq!(msg, parsed);
    }

    #[test]
    fn proxy_reply_uses_target_as_sender_protocol_address() {
        let request = ArpPayload::new(
            MacAddr::new([1; 6]),
            IpV4Addr::new([10, 0, 0, 5]),
            MacAddr::BROADCAST,
            IpV4Addr::new([10, 0, 0, 1]),
            ArpOperation::Request,
        );
        let our_mac = MacAddr::new([2; 6]);
        let reply = ArpPayload::proxy_reply(&request, our_mac);
        assert_eq!(reply.operation, ArpOperation::Response);
        assert_eq!(reply.src_mac, our_mac);
        assert_eq!(reply.src_ipaddr, request.dst_ipaddr);
        assert_eq!(reply.dst_mac, request.src_mac);
        assert_eq!(reply.dst_ipaddr, request.src_ipaddr);
    }

    #[test]
    fn cache_refreshes_existing_entry_in_place() {
        let mut cache = ArpCache::new();
        let ip = IpV4Addr::new([10, 0, 0, 5]);
        cache.insert(ip, MacAddr::new([1; 6]));
        cache.tick();
        cache.tick();
        cache.insert(ip, MacAddr::new([2; 6]));
        assert_eq!(cache.lookup(ip), Some(MacAddr::new([2; 6])));
    }

    #[test]
    fn cache_evicts_oldest_entry_when_full() {
        let mut cache = ArpCache::new();
        for i in 0..ARP_MAX_CACHE_ENTRIES {
            cache.insert(IpV4Addr::new([10, 0, 0, i as u8]), MacAddr::new([i as u8; 6]));
        }
        // age entry 0 the most so it's evicted first
        for _ in 0..5 {
            cache.tick();
        }
        // refresh everything except entry 0
        for i in 1..ARP_MAX_CACHE_ENTRIES {
            cache.insert(IpV4Addr::new([10, 0, 0, i as u8]), MacAddr::new([i as u8; 6]));
        }
        cache.insert(IpV4Addr::new([10, 0, 1, 0]), MacAddr::new([99; 6]));
        assert_eq!(cache.lookup(IpV4Addr::new([10, 0, 0, 0])), None);
        assert_eq!(
            cache.lookup(IpV4Addr::new([10, 0, 1, 0])),
            Some(MacAddr::new([99; 6]))
        );
    }

    #[test]
    fn answer_for_proxies_bridged_nodes_only() {
        let our_ip = IpV4Addr::new([10, 0, 0, 1]);
        let our_mac = MacAddr::new([1; 6]);
        let bridged_ip = IpV4Addr::new([10, 0, 0, 50]);
        let request = ArpPayload::new(
            MacAddr::new([2; 6]),
            IpV4Addr::new([10, 0, 0, 2]),
            MacAddr::BROADCAST,
            bridged_ip,
            ArpOperation::Request,
        );
        assert!(matches!(
            answer_for(&request, our_ip, our_mac, |ip| ip == bridged_ip),
            ArpAnswer::Proxy(_)
        ));
        assert!(matches!(
            answer_for(&request, our_ip, our_mac, |_| false),
            ArpAnswer::NotOurs
        ));
    }
}
