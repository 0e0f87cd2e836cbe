//! Ties the gateway's shared tables together into the one aggregate every
//! cooperative task is spawned with.
//!
//! Grounded on `gateway_v_init` in `gateway.c`, which allocates the bridge
//! table, ARP cache, and device registry once at startup and hands every
//! protothread a pointer into the same structures. Here the equivalent is
//! `Rc<RefCell<_>>`-guarded state shared by cheap clones of `GatewayCore`:
//! every field is either an `Rc` or a `Copy` value, so handing a clone to
//! `tokio::task::spawn_local` costs a handful of refcount bumps, never a
//! deep copy, and every task still observes the same tables. This is safe
//! without locking because the whole gateway runs as cooperative tasks on
//! one `tokio::task::LocalSet` and mutation is never interrupted mid-borrow
//! by another task.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use crate::arp::ArpCache;
use crate::bridging::{BridgeFlags, BridgeTable};
use crate::device_db::DeviceStore;
use crate::forwarding::{BroadcastPortRule, ForwardingPlane};
use crate::gateway_services::GatewayServicesServer;
use crate::net::Rng;
use crate::sntp::NetworkClock;
use crate::stats::Stats;
use crate::{IpV4Addr, MacAddr};

/// How often the ARP cache ages out stale entries and bridge-table lease
/// timers tick down. Matches `arp.c`/`bridging.c`'s one-second cadence.
pub const AGING_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// This gateway's own identity, resolved once at startup and handed to
/// [`GatewayCore::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayIdentity {
    pub mac: MacAddr,
    pub short_addr: u16,
    pub device_id: u64,
}

/// The gateway's shared state, plus the two higher-level views
/// ([`ForwardingPlane`], [`GatewayServicesServer`]) built on top of it.
/// Cloning is shallow: every task gets its own `GatewayCore` handle onto the
/// same underlying tables.
pub struct GatewayCore<D: DeviceStore> {
    pub bridge_table: Rc<RefCell<BridgeTable>>,
    pub arp_cache: Rc<RefCell<ArpCache>>,
    pub device_store: Rc<RefCell<D>>,
    pub network_clock: Rc<NetworkClock>,
    pub stats: Rc<Stats>,
    pub identity: GatewayIdentity,
    pub forwarding: ForwardingPlane,
    pub services: GatewayServicesServer<D>,
}

impl<D: DeviceStore> Clone for GatewayCore<D> {
    fn clone(&self) -> Self {
        GatewayCore {
            bridge_table: self.bridge_table.clone(),
            arp_cache: self.arp_cache.clone(),
            device_store: self.device_store.clone(),
            network_clock: self.network_clock.clone(),
            stats: self.stats.clone(),
            identity: self.identity,
            forwarding: self.forwarding.clone(),
            services: self.services.clone(),
        }
    }
}

impl<D: DeviceStore> GatewayCore<D> {
    pub fn new(
        device_store: D,
        identity: GatewayIdentity,
        sntp_enabled: bool,
        broadcast_ports: [Option<BroadcastPortRule>; 4],
    ) -> Self {
        let bridge_table = Rc::new(RefCell::new(BridgeTable::new()));
        let arp_cache = Rc::new(RefCell::new(ArpCache::new()));
        let device_store = Rc::new(RefCell::new(device_store));
        let network_clock = Rc::new(NetworkClock::new(sntp_enabled));
        let stats = Rc::new(Stats::default());

        let forwarding = ForwardingPlane::new(
            bridge_table.clone(),
            arp_cache.clone(),
            stats.clone(),
            identity.mac,
            broadcast_ports,
        );
        let services = GatewayServicesServer::new(
            bridge_table.clone(),
            device_store.clone(),
            network_clock.clone(),
            identity.short_addr,
            identity.device_id,
        );

        GatewayCore {
            bridge_table,
            arp_cache,
            device_store,
            network_clock,
            stats,
            identity,
            forwarding,
            services,
        }
    }

    /// Draw this gateway's token, matching `gateway_server0_thread`'s
    /// reject-zero init loop.
    pub fn init_token(&self, rng: &mut impl Rng) {
        self.services.init_token(rng);
    }

    /// Learn about this gateway's upstream address (from DHCP or manual
    /// config) and propagate it to the forwarding plane.
    pub fn set_upstream_network(&self, our_ip: IpV4Addr, subnet_mask: IpV4Addr, router: IpV4Addr) {
        self.forwarding
            .set_upstream_network(our_ip, subnet_mask, router);
    }

    /// Re-seed the bridge table from the persisted device registry at
    /// startup, matching `gateway_v_init`'s walk of the device table: every
    /// previously-seen node is re-added with [`BridgeFlags::REQUEST_IP`] so
    /// the IP pool renews its lease rather than waiting for the node to ask
    /// again from scratch.
    pub fn preload_bridge_table(&self) {
        let store = self.device_store.borrow();
        let mut table = self.bridge_table.borrow_mut();
        let mut index = 0;
        while let Some(device) = store.get_by_index(index) {
            if let Some(entry) = table.get_or_allocate(device.short_addr) {
                entry.ip = device.ip;
                entry.flags.insert(BridgeFlags::REQUEST_IP);
            }
            index += 1;
        }
    }

    /// Bridge table entries due for DHCP lease renewal right now.
    pub fn entries_needing_renewal(&self) -> Vec<u16> {
        self.bridge_table
            .borrow()
            .snapshot()
            .filter(|e| e.needs_renewal())
            .map(|e| e.short_addr)
            .collect()
    }

    /// Age the ARP cache and decrement bridge-table lease timers forever,
    /// matching the reference gateway's one-second `arp.c`/`bridging.c`
    /// ticks. Intended to be `spawn_local`'d as its own task.
    pub async fn run_aging_ticks(&self) {
        loop {
            tokio::time::sleep(AGING_TICK_INTERVAL).await;
            self.arp_cache.borrow_mut().tick();
            self.bridge_table.borrow_mut().tick_one_second();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device_db::{DeviceInfo, JsonDeviceStore};

    fn identity() -> GatewayIdentity {
        GatewayIdentity {
            mac: MacAddr::new([2, 0, 0, 0, 0, 1]),
            short_addr: 1,
            device_id: 42,
        }
    }

    #[test]
    fn preload_bridge_table_marks_known_devices_for_renewal() {
        let mut device_store = JsonDeviceStore::in_memory();
        device_store.add_device(DeviceInfo {
            short_addr: 7,
            device_id: 99,
            ip: IpV4Addr::new([10, 0, 0, 44]),
        });

        let core = GatewayCore::new(device_store, identity(), false, [None, None, None, None]);
        core.preload_bridge_table();

        let table = core.bridge_table.borrow();
        let entry = table.get_by_short_addr(7).unwrap();
        assert_eq!(entry.ip, IpV4Addr::new([10, 0, 0, 44]));
        assert!(entry.flags.contains(BridgeFlags::REQUEST_IP));
    }

    #[test]
    fn entries_needing_renewal_reports_expired_leases() {
        let core = GatewayCore::new(
            JsonDeviceStore::in_memory(),
            identity(),
            false,
            [None, None, None, None],
        );
        core.bridge_table
            .borrow_mut()
            .apply_lease(3, IpV4Addr::new([10, 0, 0, 9]), 3600);
        {
            let mut table = core.bridge_table.borrow_mut();
            let entry = table.get_or_allocate(3).unwrap();
            entry.flags.insert(BridgeFlags::REQUEST_IP);
            entry.time_left = 0;
        }

        assert_eq!(core.entries_needing_renewal(), vec![3]);
    }

    #[test]
    fn cloned_core_shares_the_same_bridge_table() {
        let core = GatewayCore::new(
            JsonDeviceStore::in_memory(),
            identity(),
            false,
            [None, None, None, None],
        );
        let handle = core.clone();
        handle
            .bridge_table
            .borrow_mut()
            .apply_lease(5, IpV4Addr::new([10, 0, 0, 12]), 60);

        assert!(core.bridge_table.borrow().get_by_short_addr(5).is_some());
    }
}
