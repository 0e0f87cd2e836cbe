//! Persisted registry of mesh nodes this gateway has ever seen.
//!
//! Grounded on `devicedb.h`: a device is identified by its mesh short
//! address and carries a stable 64-bit device id plus the last IP it was
//! assigned. Unlike the bridge table (which only holds currently-leased
//! entries and is rebuilt from this store at startup), the device DB is
//! append-mostly and persists across restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{GatewayResult, IpV4Addr};

/// One device DB record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub short_addr: u16,
    pub device_id: u64,
    pub ip: IpV4Addr,
}

/// A persisted, short-address-keyed device registry.
pub trait DeviceStore {
    /// Insert or update a device's record.
    fn add_device(&mut self, info: DeviceInfo);

    /// Look up a device by its mesh short address.
    fn get_by_short(&self, short_addr: u16) -> Option<DeviceInfo>;

    /// Look up a device by its index in insertion order, for iteration.
    fn get_by_index(&self, index: usize) -> Option<DeviceInfo>;

    /// Total number of known devices.
    fn count(&self) -> usize;

    /// Flush to persistent storage.
    fn save(&self) -> GatewayResult<()>;
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:#06x} {:#018x} {}",
            self.short_addr, self.device_id, self.ip
        )
    }
}

/// JSON-file backed [`DeviceStore`]. Order of insertion is preserved so
/// `get_by_index` behaves like scanning the original's fixed device table
/// front to back.
#[derive(Debug, Default)]
pub struct JsonDeviceStore {
    path: Option<PathBuf>,
    by_short: HashMap<u16, usize>,
    devices: Vec<DeviceInfo>,
}

impl JsonDeviceStore {
    /// Load from `path` if it exists, otherwise start empty; `path` is used
    /// for subsequent [`DeviceStore::save`] calls.
    pub fn open(path: impl AsRef<Path>) -> GatewayResult<Self> {
        let path = path.as_ref().to_path_buf();
        let devices: Vec<DeviceInfo> = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        let mut by_short = HashMap::new();
        for (i, d) in devices.iter().enumerate() {
            by_short.insert(d.short_addr, i);
        }
        Ok(JsonDeviceStore {
            path: Some(path),
            by_short,
            devices,
        })
    }

    /// An in-memory store with no backing file, for tests.
    pub fn in_memory() -> Self {
        JsonDeviceStore::default()
    }
}

impl DeviceStore for JsonDeviceStore {
    fn add_device(&mut self, info: DeviceInfo) {
        if let Some(&i) = self.by_short.get(&info.short_addr) {
            self.devices[i] = info;
        } else {
            self.by_short.insert(info.short_addr, self.devices.len());
            self.devices.push(info);
        }
    }

    fn get_by_short(&self, short_addr: u16) -> Option<DeviceInfo> {
        self.by_short.get(&short_addr).map(|&i| self.devices[i])
    }

    fn get_by_index(&self, index: usize) -> Option<DeviceInfo> {
        self.devices.get(index).copied()
    }

    fn count(&self) -> usize {
        self.devices.len()
    }

    fn save(&self) -> GatewayResult<()> {
        if let Some(path) = &self.path {
            let contents = serde_json::to_string_pretty(&self.devices)
                .expect("device records are always serializable");
            std::fs::write(path, contents)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn add_device_is_idempotent_by_short_addr() {
        let mut store = JsonDeviceStore::in_memory();
        store.add_device(DeviceInfo {
            short_addr: 7,
            device_id: 1,
            ip: IpV4Addr::new([10, 0, 0, 1]),
        });
        store.add_device(DeviceInfo {
            short_addr: 7,
            device_id: 1,
            ip: IpV4Addr::new([10, 0, 0, 2]),
        });
        assert_eq!(store.count(), 1);
        assert_eq!(
            store.get_by_short(7).unwrap().ip,
            IpV4Addr::new([10, 0, 0, 2])
        );
    }

    #[test]
    fn get_by_index_matches_insertion_order() {
        let mut store = JsonDeviceStore::in_memory();
        store.add_device(DeviceInfo {
            short_addr: 1,
            device_id: 1,
            ip: IpV4Addr::ANY,
        });
        store.add_device(DeviceInfo {
            short_addr: 2,
            device_id: 2,
            ip: IpV4Addr::ANY,
        });
        assert_eq!(store.get_by_index(0).unwrap().short_addr, 1);
        assert_eq!(store.get_by_index(1).unwrap().short_addr, 2);
    }

    #[test]
    fn persists_across_reopen() {
        let path = std::env::temp_dir().join(format!(
            "gateway_devdb_test_{}_{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let mut store = JsonDeviceStore::open(&path).unwrap();
        store.add_device(DeviceInfo {
            short_addr: 42,
            device_id: 0xdead_beef,
            ip: IpV4Addr::new([192, 168, 1, 1]),
        });
        store.save().unwrap();

        let reopened = JsonDeviceStore::open(&path).unwrap();
        assert_eq!(reopened.get_by_short(42).unwrap().device_id, 0xdead_beef);
        let _ = std::fs::remove_file(&path);
    }
}
