//! Three-level handle cache: device, service, characteristic.
//!
//! The cache exclusively owns platform handles once inserted; callers only
//! ever see clones of the handle type, never the entries themselves. One
//! mutex guards the whole tree. A resolved handle must always be served
//! from here instead of re-queried; re-querying a characteristic whose
//! service handle has been dropped fails with access-denied on some
//! platforms.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::ident::CacheKey;

struct ServiceEntry<S, C> {
    handle: S,
    characteristics: HashMap<CacheKey, C>,
}

struct DeviceEntry<D, S, C> {
    handle: D,
    services: HashMap<CacheKey, ServiceEntry<S, C>>,
}

pub struct ResourceCache<D, S, C> {
    devices: Mutex<HashMap<CacheKey, DeviceEntry<D, S, C>>>,
}

impl<D: Clone, S: Clone, C: Clone> ResourceCache<D, S, C> {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn device(&self, device: CacheKey) -> Option<D> {
        let devices = self.devices.lock().unwrap();
        devices.get(&device).map(|entry| entry.handle.clone())
    }

    /// Inserts a device entry, replacing any previous one for the same key.
    /// Concurrent misses are not deduplicated; the last insert wins.
    pub fn insert_device(&self, device: CacheKey, handle: D) {
        let mut devices = self.devices.lock().unwrap();
        devices.insert(
            device,
            DeviceEntry {
                handle,
                services: HashMap::new(),
            },
        );
    }

    pub fn service(&self, device: CacheKey, service: CacheKey) -> Option<S> {
        let devices = self.devices.lock().unwrap();
        devices
            .get(&device)
            .and_then(|entry| entry.services.get(&service))
            .map(|entry| entry.handle.clone())
    }

    /// Returns false if the parent device entry is gone, which happens when
    /// a disconnect races the insert.
    pub fn insert_service(&self, device: CacheKey, service: CacheKey, handle: S) -> bool {
        let mut devices = self.devices.lock().unwrap();
        match devices.get_mut(&device) {
            Some(entry) => {
                entry.services.insert(
                    service,
                    ServiceEntry {
                        handle,
                        characteristics: HashMap::new(),
                    },
                );
                true
            }
            None => false,
        }
    }

    pub fn characteristic(
        &self,
        device: CacheKey,
        service: CacheKey,
        characteristic: CacheKey,
    ) -> Option<C> {
        let devices = self.devices.lock().unwrap();
        devices
            .get(&device)
            .and_then(|entry| entry.services.get(&service))
            .and_then(|entry| entry.characteristics.get(&characteristic))
            .cloned()
    }

    pub fn insert_characteristic(
        &self,
        device: CacheKey,
        service: CacheKey,
        characteristic: CacheKey,
        handle: C,
    ) -> bool {
        let mut devices = self.devices.lock().unwrap();
        match devices
            .get_mut(&device)
            .and_then(|entry| entry.services.get_mut(&service))
        {
            Some(entry) => {
                entry.characteristics.insert(characteristic, handle);
                true
            }
            None => false,
        }
    }

    /// Removes a device entry. The device handle is returned ahead of its
    /// service handles so the caller closes the device first; closing a
    /// service whose device is already gone is safe, the reverse is not.
    pub fn remove_device(&self, device: CacheKey) -> Option<(D, Vec<S>)> {
        let mut devices = self.devices.lock().unwrap();
        devices.remove(&device).map(flatten_entry)
    }

    /// Empties the cache, returning every entry for closing. Shutdown only.
    pub fn take_all(&self) -> Vec<(D, Vec<S>)> {
        let mut devices = self.devices.lock().unwrap();
        devices.drain().map(|(_, entry)| flatten_entry(entry)).collect()
    }
}

fn flatten_entry<D, S, C>(entry: DeviceEntry<D, S, C>) -> (D, Vec<S>) {
    let services = entry
        .services
        .into_values()
        .map(|service| service.handle)
        .collect();
    (entry.handle, services)
}

impl<D: Clone, S: Clone, C: Clone> Default for ResourceCache<D, S, C> {
    fn default() -> Self {
        Self::new()
    }
}
