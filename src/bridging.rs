//! Bridge table: the gateway's record of which mesh nodes have been handed
//! an IP address, and the DHCP-proxying tasks that keep it populated.
//!
//! Grounded on `bridging.c`: a fixed-size table of [`BridgeEntry`], looked
//! up either by IP (for forwarding and proxy-ARP) or by mesh short address
//! (for the per-node DHCP lease renewal loop).

use crate::IpV4Addr;

/// Maximum number of concurrently bridged mesh nodes.
pub const BRIDGE_TABLE_SIZE: usize = 32;

bitflags::bitflags! {
    /// Per-entry flags, packed the way `BRIDGE_FLAGS_*` are in the reference
    /// implementation.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct BridgeFlags: u8 {
        /// This node's IP was set manually and must never be renewed or
        /// reassigned by the IP pool.
        const MANUAL_IP = 0x01;
        /// The IP pool should (re)request a DHCP lease for this entry the
        /// next time it scans the table.
        const REQUEST_IP = 0x02;
        /// `ip` holds a currently valid lease.
        const IP_VALID = 0x04;
    }
}

/// One bridged mesh node's lease state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BridgeEntry {
    pub short_addr: u16,
    pub ip: IpV4Addr,
    /// Lease duration in seconds, as granted by DHCP.
    pub lease: u32,
    /// Seconds remaining before renewal is due.
    pub time_left: u32,
    pub flags: BridgeFlags,
}

impl BridgeEntry {
    fn empty() -> Self {
        BridgeEntry {
            short_addr: 0,
            ip: IpV4Addr::ANY,
            lease: 0,
            time_left: 0,
            flags: BridgeFlags::empty(),
        }
    }

    fn is_free(&self) -> bool {
        self.short_addr == 0
    }

    /// `true` once `time_left` has dropped to an eighth of the lease or
    /// less and this entry isn't manually configured — the point at which
    /// the reference gateway's `ip_pool_thread` starts a renewal.
    pub fn needs_renewal(&self) -> bool {
        !self.flags.contains(BridgeFlags::MANUAL_IP)
            && self.flags.contains(BridgeFlags::REQUEST_IP)
            && self.time_left <= self.lease / 8
    }
}

/// Fixed-size table of bridged mesh nodes.
#[derive(Debug, Clone)]
pub struct BridgeTable {
    entries: [BridgeEntry; BRIDGE_TABLE_SIZE],
}

impl Default for BridgeTable {
    fn default() -> Self {
        BridgeTable {
            entries: [BridgeEntry::empty(); BRIDGE_TABLE_SIZE],
        }
    }
}

impl BridgeTable {
    /// New, empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a bridged node by its currently leased IP.
    pub fn get_by_ip(&self, ip: IpV4Addr) -> Option<&BridgeEntry> {
        self.entries
            .iter()
            .find(|e| !e.is_free() && e.flags.contains(BridgeFlags::IP_VALID) && e.ip == ip)
    }

    /// Find a bridged node by its mesh short address.
    pub fn get_by_short_addr(&self, short_addr: u16) -> Option<&BridgeEntry> {
        self.entries
            .iter()
            .find(|e| !e.is_free() && e.short_addr == short_addr)
    }

    /// Find the existing entry for `short_addr`, or allocate the first free
    /// slot for it. This merges the reference implementation's
    /// `bridge_b_get_bridge2`-then-`bridge_b_get_new` duplication into one
    /// routine, closing the race where two callers could both see the same
    /// "free" slot and add_to_bridge would scan for a free slot a second
    /// time without re-checking the short address (see DESIGN.md).
    pub fn get_or_allocate(&mut self, short_addr: u16) -> Option<&mut BridgeEntry> {
        if let Some(i) = self
            .entries
            .iter()
            .position(|e| !e.is_free() && e.short_addr == short_addr)
        {
            return Some(&mut self.entries[i]);
        }
        let i = self.entries.iter().position(|e| e.is_free())?;
        self.entries[i] = BridgeEntry {
            short_addr,
            ..BridgeEntry::empty()
        };
        Some(&mut self.entries[i])
    }

    /// Iterate over occupied entries, for the `bridge` diagnostic dump.
    pub fn snapshot(&self) -> impl Iterator<Item = &BridgeEntry> {
        self.entries.iter().filter(|e| !e.is_free())
    }

    /// Advance every entry's `time_left` by one second, saturating at zero.
    /// Entries flagged [`BridgeFlags::MANUAL_IP`] are excluded since they
    /// never expire.
    pub fn tick_one_second(&mut self) {
        for e in self.entries.iter_mut() {
            if !e.is_free() && !e.flags.contains(BridgeFlags::MANUAL_IP) && e.time_left > 0 {
                e.time_left -= 1;
            }
        }
    }

    /// Apply a freshly (re)acquired DHCP lease to `short_addr`'s entry.
    pub fn apply_lease(&mut self, short_addr: u16, ip: IpV4Addr, lease_seconds: u32) {
        if let Some(entry) = self.get_or_allocate(short_addr) {
            entry.ip = ip;
            entry.lease = lease_seconds;
            entry.time_left = lease_seconds;
            entry.flags.insert(BridgeFlags::IP_VALID);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_or_allocate_reuses_existing_entry_for_short_addr() {
        let mut table = BridgeTable::new();
        let first = table.get_or_allocate(7).unwrap() as *mut BridgeEntry;
        let second = table.get_or_allocate(7).unwrap() as *mut BridgeEntry;
        assert_eq!(first, second);
    }

    #[test]
    fn apply_lease_marks_entry_valid_and_sets_timers() {
        let mut table = BridgeTable::new();
        table.apply_lease(3, IpV4Addr::new([10, 0, 0, 9]), 3600);
        let entry = table.get_by_ip(IpV4Addr::new([10, 0, 0, 9])).unwrap();
        assert!(entry.flags.contains(BridgeFlags::IP_VALID));
        assert_eq!(entry.lease, 3600);
        assert_eq!(entry.time_left, 3600);
    }

    #[test]
    fn needs_renewal_respects_manual_ip_flag() {
        let mut entry = BridgeEntry::empty();
        entry.short_addr = 1;
        entry.lease = 3600;
        entry.time_left = 100;
        entry.flags = BridgeFlags::REQUEST_IP;
        assert!(entry.needs_renewal());
        entry.flags.insert(BridgeFlags::MANUAL_IP);
        assert!(!entry.needs_renewal());
    }

    #[test]
    fn tick_decrements_time_left_but_not_below_zero() {
        let mut table = BridgeTable::new();
        table.apply_lease(1, IpV4Addr::new([10, 0, 0, 1]), 1);
        table.tick_one_second();
        table.tick_one_second();
        assert_eq!(table.get_by_short_addr(1).unwrap().time_left, 0);
    }

    #[test]
    fn table_fills_up_and_returns_none_when_full() {
        let mut table = BridgeTable::new();
        for i in 1..=BRIDGE_TABLE_SIZE as u16 {
            assert!(table.get_or_allocate(i).is_some());
        }
        assert!(table.get_or_allocate(BRIDGE_TABLE_SIZE as u16 + 1).is_none());
    }
}
