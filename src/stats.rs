//! Forwarding-plane counters, read-only outside this module.
//!
//! The reference gateway calls `stats_v_increment` at a handful of points
//! in `gateway.c`/`icmp.c`; this mirrors those call sites as named
//! saturating counters rather than a generic keyed map, so a caller can't
//! typo a stat name.

use std::cell::Cell;

/// Process-wide forwarding statistics. Lives inside [`crate::core::GatewayCore`]
/// and is incremented inline from the forwarding plane; never causes a
/// packet to be dropped or a task to fail, so every increment is
/// saturating.
#[derive(Default)]
pub struct Stats {
    pub bad_packet: Cell<u32>,
    pub icmp_created: Cell<u32>,
    pub icmp_received: Cell<u32>,
    pub ttl_expired: Cell<u32>,
    pub arp_received: Cell<u32>,
    pub dest_unreachable: Cell<u32>,
    pub forwarded_to_ethernet: Cell<u32>,
    pub forwarded_to_wireless: Cell<u32>,
}

macro_rules! counter_method {
    ($incr:ident, $get:ident, $field:ident) => {
        /// Increment this counter by one, saturating.
        pub fn $incr(&self) {
            self.$field.set(self.$field.get().saturating_add(1));
        }

        /// Current value.
        pub fn $get(&self) -> u32 {
            self.$field.get()
        }
    };
}

impl Stats {
    counter_method!(incr_bad_packet, bad_packet, bad_packet);
    counter_method!(incr_icmp_created, icmp_created, icmp_created);
    counter_method!(incr_icmp_received, icmp_received, icmp_received);
    counter_method!(incr_ttl_expired, ttl_expired, ttl_expired);
    counter_method!(incr_arp_received, arp_received, arp_received);
    counter_method!(incr_dest_unreachable, dest_unreachable, dest_unreachable);
    counter_method!(
        incr_forwarded_to_ethernet,
        forwarded_to_ethernet,
        forwarded_to_ethernet
    );
    counter_method!(
        incr_forwarded_to_wireless,
        forwarded_to_wireless,
        forwarded_to_wireless
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let stats = Stats::default();
        assert_eq!(stats.bad_packet(), 0);
        stats.incr_bad_packet();
        stats.incr_bad_packet();
        assert_eq!(stats.bad_packet(), 2);
    }

    #[test]
    fn counters_saturate_instead_of_panicking() {
        let stats = Stats::default();
        stats.bad_packet.set(u32::MAX);
        stats.incr_bad_packet();
        assert_eq!(stats.bad_packet(), u32::MAX);
    }
}
