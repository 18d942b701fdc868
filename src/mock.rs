//! Scripted in-memory stack for engine tests. Peripherals are declared up
//! front with [`MockStack::add_device`]; advertisements and notifications
//! are injected from the test thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineError;
use crate::stack::{AdvertisementSink, BleStack, NotificationSink};
use crate::types::{CharacteristicInfo, DeviceUpdate, NotificationData, ServiceInfo};

/// How often each stack operation was actually reached. Resolution caching
/// is asserted through these.
#[derive(Default)]
pub struct Counters {
    pub device_queries: AtomicUsize,
    pub service_queries: AtomicUsize,
    pub characteristic_queries: AtomicUsize,
    pub subscribes: AtomicUsize,
    pub revoked: AtomicUsize,
    pub watch_stops: AtomicUsize,
    pub closed_devices: AtomicUsize,
    pub closed_services: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCharacteristic {
    device: String,
    service: Uuid,
    uuid: Uuid,
}

#[derive(Default)]
pub struct MockStack {
    devices: Mutex<HashMap<String, Vec<(Uuid, Vec<Uuid>)>>>,
    advert_sink: Mutex<Option<AdvertisementSink>>,
    watch_fails: AtomicBool,
    subscriptions: Mutex<HashMap<usize, (MockCharacteristic, NotificationSink)>>,
    next_token: AtomicUsize,
    write_log: Mutex<Vec<(Uuid, Vec<u8>)>>,
    pub counters: Counters,
}

impl MockStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device_id: &str, service: Uuid, characteristics: &[Uuid]) {
        self.devices
            .lock()
            .unwrap()
            .entry(device_id.to_string())
            .or_default()
            .push((service, characteristics.to_vec()));
    }

    /// True while an advertisement watch is armed.
    pub fn watching(&self) -> bool {
        self.advert_sink.lock().unwrap().is_some()
    }

    /// Makes every following watch arm attempt fail.
    pub fn fail_watch(&self) {
        self.watch_fails.store(true, Ordering::SeqCst);
    }

    /// Injects one advertisement into the armed watch; dropped silently
    /// when no watch is running.
    pub fn advertise(&self, update: DeviceUpdate) {
        let sink = self.advert_sink.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(update);
        }
    }

    /// Injects one value-changed event into every live subscription on the
    /// given characteristic.
    pub fn notify(&self, characteristic: Uuid, payload: &[u8]) {
        let sinks: Vec<(MockCharacteristic, NotificationSink)> = self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|(c, _)| c.uuid == characteristic)
            .cloned()
            .collect();
        for (c, sink) in sinks {
            sink(NotificationData {
                device_id: c.device.clone(),
                service_uuid: c.service.to_string(),
                characteristic_uuid: c.uuid.to_string(),
                payload: payload.to_vec(),
            });
        }
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.write_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl BleStack for MockStack {
    type Device = String;
    type Service = Uuid;
    type Characteristic = MockCharacteristic;
    type SubscriptionToken = usize;
    type WatchToken = ();

    async fn connect_device(&self, device_id: &str) -> Result<Option<String>, EngineError> {
        self.counters.device_queries.fetch_add(1, Ordering::SeqCst);
        let known = self.devices.lock().unwrap().contains_key(device_id);
        Ok(known.then(|| device_id.to_string()))
    }

    async fn find_service(&self, device: &String, service: Uuid) -> Result<Option<Uuid>, EngineError> {
        self.counters.service_queries.fetch_add(1, Ordering::SeqCst);
        let devices = self.devices.lock().unwrap();
        let found = devices
            .get(device)
            .map_or(false, |services| services.iter().any(|(s, _)| *s == service));
        Ok(found.then_some(service))
    }

    async fn find_characteristic(
        &self,
        device: &String,
        service: &Uuid,
        characteristic: Uuid,
    ) -> Result<Option<MockCharacteristic>, EngineError> {
        self.counters
            .characteristic_queries
            .fetch_add(1, Ordering::SeqCst);
        let devices = self.devices.lock().unwrap();
        let found = devices.get(device).map_or(false, |services| {
            services
                .iter()
                .any(|(s, cs)| s == service && cs.contains(&characteristic))
        });
        Ok(found.then(|| MockCharacteristic {
            device: device.clone(),
            service: *service,
            uuid: characteristic,
        }))
    }

    async fn enumerate_services(&self, device: &String) -> Result<Vec<ServiceInfo>, EngineError> {
        let devices = self.devices.lock().unwrap();
        Ok(devices
            .get(device)
            .into_iter()
            .flatten()
            .map(|(s, _)| ServiceInfo {
                uuid: s.to_string(),
            })
            .collect())
    }

    async fn enumerate_characteristics(
        &self,
        device: &String,
        service: &Uuid,
    ) -> Result<Vec<CharacteristicInfo>, EngineError> {
        let devices = self.devices.lock().unwrap();
        Ok(devices
            .get(device)
            .into_iter()
            .flatten()
            .filter(|(s, _)| s == service)
            .flat_map(|(_, cs)| cs.iter())
            .map(|c| CharacteristicInfo {
                uuid: c.to_string(),
                user_description: "mock characteristic".to_string(),
            })
            .collect())
    }

    async fn start_advertisement_watch(
        &self,
        _required_services: Vec<Uuid>,
        sink: AdvertisementSink,
    ) -> Result<(), EngineError> {
        if self.watch_fails.load(Ordering::SeqCst) {
            return Err(EngineError::Communication {
                operation: "scan start",
                detail: "adapter unavailable".to_string(),
            });
        }
        *self.advert_sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    async fn stop_advertisement_watch(&self, _token: ()) {
        self.counters.watch_stops.fetch_add(1, Ordering::SeqCst);
        self.advert_sink.lock().unwrap().take();
    }

    async fn subscribe(
        &self,
        _device: &String,
        characteristic: &MockCharacteristic,
        sink: NotificationSink,
    ) -> Result<usize, EngineError> {
        self.counters.subscribes.fetch_add(1, Ordering::SeqCst);
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .unwrap()
            .insert(token, (characteristic.clone(), sink));
        Ok(token)
    }

    async fn unsubscribe(&self, token: usize) {
        if self.subscriptions.lock().unwrap().remove(&token).is_some() {
            self.counters.revoked.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn write_without_response(
        &self,
        _device: &String,
        characteristic: &MockCharacteristic,
        payload: &[u8],
    ) -> Result<(), EngineError> {
        self.write_log
            .lock()
            .unwrap()
            .push((characteristic.uuid, payload.to_vec()));
        Ok(())
    }

    async fn close_device(&self, _device: String) {
        self.counters.closed_devices.fetch_add(1, Ordering::SeqCst);
    }

    async fn close_service(&self, _service: Uuid) {
        self.counters.closed_services.fetch_add(1, Ordering::SeqCst);
    }
}
