//! Typed configuration store.
//!
//! Generalizes the reference gateway's static `KV_SECTION_META` key table
//! (`appcfg.c`) into a Rust enum of typed keys plus a small trait so the
//! backing store (environment variables, a config file, a test double) is
//! swappable.

use std::collections::HashMap;

use crate::{GatewayError, GatewayResult, IpV4Addr, MacAddr};

/// One configuration parameter this gateway reads at startup. Names mirror
/// the original key strings so an operator migrating a deployment can reuse
/// their existing config file layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    /// `ethernet_mac` — this gateway's own Ethernet MAC address.
    EthernetMac,
    /// `sntp_server` — hostname or address of the upstream SNTP server.
    SntpServer,
    /// `sntp_sync_interval` — seconds between SNTP synchronization attempts.
    SntpSyncInterval,
    /// `enable_sntp` — whether the SNTP client runs at all.
    EnableSntp,
    /// `enable_dhcp` — whether this gateway acquires its upstream address
    /// via DHCP (false means a manually configured address is used).
    EnableDhcp,
    /// `broadcast_port_N` (N in 0..4) — UDP ports eligible for the
    /// poor-man's-multicast TTL=2 treatment on broadcast egress.
    BroadcastPort(u8),
    /// `broadcast_port_N_local` — as above, but additionally restricted to
    /// one wireless hop even when it originates locally.
    BroadcastPortLocal(u8),
    /// `enable_time_source` — whether the periodic NTP-to-mesh time
    /// publisher runs.
    EnableTimeSource,
    /// `network_channel` — wireless channel to use, if the hardware allows
    /// selecting one.
    NetworkChannel,
    /// `manual_ip` — statically assigned IP address, used when
    /// `enable_dhcp` is false.
    ManualIp,
    /// `manual_subnet` — statically assigned subnet mask.
    ManualSubnet,
    /// `manual_router` — statically assigned default router/gateway.
    ManualRouter,
}

impl ConfigKey {
    /// The string name this key is stored under, matching the reference
    /// gateway's key table.
    pub fn name(&self) -> String {
        match self {
            ConfigKey::EthernetMac => "ethernet_mac".to_string(),
            ConfigKey::SntpServer => "sntp_server".to_string(),
            ConfigKey::SntpSyncInterval => "sntp_sync_interval".to_string(),
            ConfigKey::EnableSntp => "enable_sntp".to_string(),
            ConfigKey::EnableDhcp => "enable_dhcp".to_string(),
            ConfigKey::BroadcastPort(n) => format!("broadcast_port_{n}"),
            ConfigKey::BroadcastPortLocal(n) => format!("broadcast_port_{n}_local"),
            ConfigKey::EnableTimeSource => "enable_time_source".to_string(),
            ConfigKey::NetworkChannel => "network_channel".to_string(),
            ConfigKey::ManualIp => "manual_ip".to_string(),
            ConfigKey::ManualSubnet => "manual_subnet".to_string(),
            ConfigKey::ManualRouter => "manual_router".to_string(),
        }
    }
}

/// A typed key/value configuration backend.
pub trait ConfigStore {
    /// Raw string lookup; `None` if the key was never set.
    fn get_raw(&self, key: ConfigKey) -> Option<String>;

    /// Set (or overwrite) a raw string value.
    fn set_raw(&mut self, key: ConfigKey, value: String);

    /// Typed bool lookup, accepting `"1"/"true"/"yes"` as true.
    fn get_bool(&self, key: ConfigKey, default: bool) -> bool {
        match self.get_raw(key).as_deref() {
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            _ => default,
        }
    }

    /// Typed u16 lookup.
    fn get_u16(&self, key: ConfigKey) -> Option<u16> {
        self.get_raw(key).and_then(|v| v.parse().ok())
    }

    /// Typed u8 lookup.
    fn get_u8(&self, key: ConfigKey) -> Option<u8> {
        self.get_raw(key).and_then(|v| v.parse().ok())
    }

    /// Typed IPv4 lookup, `a.b.c.d` dotted-decimal.
    fn get_ipv4(&self, key: ConfigKey) -> GatewayResult<Option<IpV4Addr>> {
        match self.get_raw(key) {
            None => Ok(None),
            Some(v) => Ok(Some(parse_ipv4(&v).ok_or_else(|| GatewayError::InvalidConfig {
                key: "ipv4",
                reason: v,
            })?)),
        }
    }

    /// Typed MAC address lookup, `aa:bb:cc:dd:ee:ff`.
    fn get_mac(&self, key: ConfigKey) -> GatewayResult<Option<MacAddr>> {
        match self.get_raw(key) {
            None => Ok(None),
            Some(v) => Ok(Some(parse_mac(&v).ok_or_else(|| GatewayError::InvalidConfig {
                key: "mac",
                reason: v,
            })?)),
        }
    }
}

fn parse_ipv4(s: &str) -> Option<IpV4Addr> {
    let mut out = [0_u8; 4];
    let mut parts = s.split('.');
    for slot in out.iter_mut() {
        *slot = parts.next()?.parse().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(IpV4Addr::new(out))
}

fn parse_mac(s: &str) -> Option<MacAddr> {
    let mut out = [0_u8; 6];
    let mut parts = s.split(':');
    for slot in out.iter_mut() {
        *slot = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(MacAddr::new(out))
}

/// In-memory [`ConfigStore`], seeded from environment variables at startup
/// (`GATEWAY_<KEY_UPPERCASE>`). Suitable as the default backend for a
/// daemon and as a fully controllable test double.
#[derive(Debug, Default, Clone)]
pub struct EnvConfigStore {
    values: HashMap<String, String>,
}

impl EnvConfigStore {
    /// Build a store pre-populated from the process environment.
    pub fn from_env() -> Self {
        let mut store = EnvConfigStore::default();
        for key in ALL_SCALAR_KEYS {
            let env_name = format!("GATEWAY_{}", key.name().to_uppercase());
            if let Ok(value) = std::env::var(&env_name) {
                store.values.insert(key.name(), value);
            }
        }
        for n in 0..4 {
            for key in [ConfigKey::BroadcastPort(n), ConfigKey::BroadcastPortLocal(n)] {
                let env_name = format!("GATEWAY_{}", key.name().to_uppercase());
                if let Ok(value) = std::env::var(&env_name) {
                    store.values.insert(key.name(), value);
                }
            }
        }
        store
    }
}

const ALL_SCALAR_KEYS: &[ConfigKey] = &[
    ConfigKey::EthernetMac,
    ConfigKey::SntpServer,
    ConfigKey::SntpSyncInterval,
    ConfigKey::EnableSntp,
    ConfigKey::EnableDhcp,
    ConfigKey::EnableTimeSource,
    ConfigKey::NetworkChannel,
    ConfigKey::ManualIp,
    ConfigKey::ManualSubnet,
    ConfigKey::ManualRouter,
];

impl ConfigStore for EnvConfigStore {
    fn get_raw(&self, key: ConfigKey) -> Option<String> {
        self.values.get(&key.name()).cloned()
    }

    fn set_raw(&mut self, key: ConfigKey, value: String) {
        self.values.insert(key.name(), value);
    }
}
