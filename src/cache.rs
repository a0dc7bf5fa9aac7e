//! Last-known device identity, keyed by address.
//!
//! A cached identity lets the handshake skip the component-info round-trip on
//! reconnection. The default implementation lives for the process lifetime
//! and is invalidated only by explicit `put`.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::protocol::DeviceIdentity;
use crate::signal::lock;

/// Identity cache consumed by the handshake.
pub trait DeviceInfoCache: Send + Sync {
    fn get(&self, address: &str) -> Option<DeviceIdentity>;
    fn put(&self, address: &str, identity: DeviceIdentity);
}

/// In-memory, process-lifetime cache.
#[derive(Default)]
pub struct MemoryDeviceInfoCache {
    entries: Mutex<HashMap<String, DeviceIdentity>>,
}

impl MemoryDeviceInfoCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceInfoCache for MemoryDeviceInfoCache {
    fn get(&self, address: &str) -> Option<DeviceIdentity> {
        lock(&self.entries).get(address).cloned()
    }

    fn put(&self, address: &str, identity: DeviceIdentity) {
        lock(&self.entries).insert(address.to_string(), identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(serial: &str) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: 1,
            product_id: 2,
            serial_number: serial.into(),
            firmware_revision: "1.0.0".into(),
        }
    }

    #[test]
    fn put_then_get_and_overwrite() {
        let cache = MemoryDeviceInfoCache::new();
        assert!(cache.get("aa:bb").is_none());

        cache.put("aa:bb", identity("one"));
        assert_eq!(cache.get("aa:bb").unwrap().serial_number, "one");

        cache.put("aa:bb", identity("two"));
        assert_eq!(cache.get("aa:bb").unwrap().serial_number, "two");
        assert!(cache.get("cc:dd").is_none());
    }
}
