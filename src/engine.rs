//! The engine context: cache, queues, subscription registry and shutdown
//! coordinator behind the public polling API.
//!
//! Public operations are synchronous and may be invoked from any number of
//! foreign caller threads; asynchronous producer work runs as detached
//! tasks on the engine-owned Tokio runtime, and task completion is observed
//! only through the queues and completion signals, never through task
//! handles.

use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, select, Receiver};
use tokio::runtime::Runtime;

use crate::btle::BtleStack;
use crate::config::EngineConfig;
use crate::error::{EngineError, LastError};
use crate::ident::{parse_uuid, CacheKey};
use crate::queue::{ScanQueue, ScanStatus};
use crate::quit::QuitFlag;
use crate::resolve::{HandleCache, Resolver};
use crate::stack::{AdvertisementSink, BleStack, NotificationSink};
use crate::types::{
    bounded_payload, CharacteristicInfo, DeviceUpdate, NotificationData, ServiceInfo,
};

/// One live notification subscription, held only for revocation. Created
/// by a successful subscribe, destroyed at shutdown; there is no
/// individual unsubscribe in the public surface.
struct Subscription<S: BleStack> {
    token: S::SubscriptionToken,
}

/// Engine backed by the system Bluetooth adapter.
pub type BleEngine = Engine<BtleStack>;

pub struct Engine<S: BleStack> {
    rt: Runtime,
    stack: Arc<S>,
    resolver: Resolver<S>,
    cache: Arc<HandleCache<S>>,
    quit: Arc<QuitFlag>,
    last_error: Arc<LastError>,
    device_queue: Arc<ScanQueue<DeviceUpdate>>,
    service_queue: Arc<ScanQueue<ServiceInfo>>,
    characteristic_queue: Arc<ScanQueue<CharacteristicInfo>>,
    data_queue: Arc<ScanQueue<NotificationData>>,
    subscriptions: Arc<Mutex<Vec<Subscription<S>>>>,
    watch: Arc<Mutex<Option<S::WatchToken>>>,
    config: EngineConfig,
}

impl Engine<BtleStack> {
    /// Builds an engine bound to the first system Bluetooth adapter, with
    /// its own multi-threaded runtime.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let rt = Runtime::new().map_err(|e| EngineError::Communication {
            operation: "runtime init",
            detail: e.to_string(),
        })?;
        let stack = rt.block_on(BtleStack::new(config.clone()))?;
        Ok(Self::with_stack(rt, stack, config))
    }
}

impl<S: BleStack> Engine<S> {
    /// Builds an engine over an arbitrary stack implementation.
    pub fn with_stack(rt: Runtime, stack: S, config: EngineConfig) -> Self {
        let stack = Arc::new(stack);
        let quit = Arc::new(QuitFlag::new());
        let last_error = Arc::new(LastError::new());
        let cache: Arc<HandleCache<S>> = Arc::new(HandleCache::<S>::new());
        let resolver = Resolver::new(
            stack.clone(),
            cache.clone(),
            last_error.clone(),
            config.clone(),
        );
        Self {
            rt,
            stack,
            resolver,
            cache,
            device_queue: Arc::new(ScanQueue::new(quit.clone())),
            service_queue: Arc::new(ScanQueue::new(quit.clone())),
            characteristic_queue: Arc::new(ScanQueue::new(quit.clone())),
            data_queue: Arc::new(ScanQueue::new(quit.clone())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            watch: Arc::new(Mutex::new(None)),
            quit,
            last_error,
            config,
        }
    }

    /// Arms the advertisement watcher. Matching advertisements land in the
    /// device queue until [`Engine::stop_device_scan`].
    ///
    /// This is also the restart point after [`Engine::quit`]: the first
    /// scan of a session clears the shutdown flag and the error slot.
    pub fn start_device_scan(&self, required_service_ids: &[String]) {
        log::info!("Starting device scan");
        self.quit.reset();
        self.last_error.clear();
        self.device_queue.begin();

        let mut filters = Vec::new();
        for id in required_service_ids {
            match parse_uuid(id) {
                Some(uuid) => filters.push(uuid),
                None => log::warn!("Ignoring unparsable service filter {}", id),
            }
        }

        let queue = self.device_queue.clone();
        let sink: AdvertisementSink = Arc::new(move |update| {
            queue.push(update);
        });
        let stack = self.stack.clone();
        let watch = self.watch.clone();
        let last_error = self.last_error.clone();
        let queue = self.device_queue.clone();
        // A restart without an intervening stop replaces the watcher, so
        // the displaced one must be revoked or it keeps feeding the queue.
        let previous = self.watch.lock().unwrap().take();
        self.rt.spawn(async move {
            if let Some(token) = previous {
                stack.stop_advertisement_watch(token).await;
            }
            match stack.start_advertisement_watch(filters, sink).await {
                Ok(token) => {
                    *watch.lock().unwrap() = Some(token);
                }
                Err(err) => {
                    last_error.record(&err);
                    // The scan never started; seal the queue so blocked
                    // pollers observe the failure as a finished scan.
                    queue.finish();
                }
            }
        });
    }

    pub fn poll_device(&self, block: bool) -> ScanStatus<DeviceUpdate> {
        self.device_queue.poll(block)
    }

    pub fn stop_device_scan(&self) {
        log::info!("Stopping device scan");
        if let Some(token) = self.watch.lock().unwrap().take() {
            let stack = self.stack.clone();
            self.rt.spawn(async move {
                stack.stop_advertisement_watch(token).await;
            });
        }
        self.device_queue.finish();
    }

    /// Enumerates the services of a device into the service queue.
    pub fn scan_services(&self, device_id: &str) {
        self.service_queue.begin();
        let resolver = self.resolver.clone();
        let stack = self.stack.clone();
        let queue = self.service_queue.clone();
        let last_error = self.last_error.clone();
        let settle_ms = self.config.service_settle_ms;
        let device_id = device_id.to_string();
        self.rt.spawn(async move {
            log::info!("Scanning services of {}", device_id);
            if let Ok(device) = resolver.device(&device_id).await {
                resolver.settle(settle_ms).await;
                match stack.enumerate_services(&device).await {
                    Ok(services) => {
                        for service in services {
                            if !queue.push(service) {
                                break;
                            }
                        }
                    }
                    Err(err) => last_error.record(&err),
                }
            }
            queue.finish();
        });
    }

    pub fn poll_service(&self, block: bool) -> ScanStatus<ServiceInfo> {
        self.service_queue.poll(block)
    }

    /// Enumerates the characteristics of a service into the characteristic
    /// queue.
    pub fn scan_characteristics(&self, device_id: &str, service_id: &str) {
        self.characteristic_queue.begin();
        let resolver = self.resolver.clone();
        let stack = self.stack.clone();
        let queue = self.characteristic_queue.clone();
        let last_error = self.last_error.clone();
        let settle_ms = self.config.characteristic_settle_ms;
        let device_id = device_id.to_string();
        let service_id = service_id.to_string();
        self.rt.spawn(async move {
            log::info!("Scanning characteristics of {}", service_id);
            if let Ok(service) = resolver.service(&device_id, &service_id).await {
                if let Ok(device) = resolver.device(&device_id).await {
                    resolver.settle(settle_ms).await;
                    match stack.enumerate_characteristics(&device, &service).await {
                        Ok(characteristics) => {
                            for characteristic in characteristics {
                                if !queue.push(characteristic) {
                                    break;
                                }
                            }
                        }
                        Err(err) => last_error.record(&err),
                    }
                }
            }
            queue.finish();
        });
    }

    pub fn poll_characteristic(&self, block: bool) -> ScanStatus<CharacteristicInfo> {
        self.characteristic_queue.poll(block)
    }

    /// Resolves the characteristic, enables notifications on it and records
    /// the subscription for revocation at shutdown. Incoming value-changed
    /// events land in the data queue.
    ///
    /// The return value is only meaningful when `block` is set; a
    /// non-blocking call always returns false while the work continues in
    /// the background. Subscribing twice to the same characteristic records
    /// two registry entries.
    pub fn subscribe_characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        block: bool,
    ) -> bool {
        log::info!("Subscribing to {}", characteristic_id);
        let (done_tx, done_rx) = bounded::<bool>(1);
        let resolver = self.resolver.clone();
        let stack = self.stack.clone();
        let subscriptions = self.subscriptions.clone();
        let data_queue = self.data_queue.clone();
        let quit = self.quit.clone();
        let device_id = device_id.to_string();
        let service_id = service_id.to_string();
        let characteristic_id = characteristic_id.to_string();
        self.rt.spawn(async move {
            let ok = async {
                let (device, characteristic) = resolver
                    .characteristic(&device_id, &service_id, &characteristic_id)
                    .await?;
                let sink: NotificationSink = Arc::new(move |data| {
                    data_queue.push(data);
                });
                let token = stack.subscribe(&device, &characteristic, sink).await?;
                // Shutdown sets the flag before it drains the registry, so
                // checking under the lock guarantees no entry is added once
                // revocation has begun.
                let stale = {
                    let mut subs = subscriptions.lock().unwrap();
                    if quit.is_set() {
                        Some(token)
                    } else {
                        subs.push(Subscription { token });
                        None
                    }
                };
                if let Some(token) = stale {
                    stack.unsubscribe(token).await;
                    return Err(EngineError::Cancelled);
                }
                Ok::<(), EngineError>(())
            }
            .await;
            let ok = match ok {
                Ok(()) => {
                    log::info!("Subscription successful");
                    true
                }
                Err(err) => {
                    resolver.note(&err);
                    false
                }
            };
            let _ = done_tx.send(ok);
        });
        if block {
            self.wait_for(done_rx)
        } else {
            false
        }
    }

    pub fn poll_data(&self, block: bool) -> Option<NotificationData> {
        match self.data_queue.poll(block) {
            ScanStatus::Available(data) => Some(data),
            _ => None,
        }
    }

    /// Writes a payload (truncated to the maximum attribute size) to a
    /// characteristic, without response. The return value is only
    /// meaningful when `block` is set.
    pub fn send_data(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
        payload: &[u8],
        block: bool,
    ) -> bool {
        let (done_tx, done_rx) = bounded::<bool>(1);
        let resolver = self.resolver.clone();
        let stack = self.stack.clone();
        let payload = bounded_payload(payload);
        let device_id = device_id.to_string();
        let service_id = service_id.to_string();
        let characteristic_id = characteristic_id.to_string();
        self.rt.spawn(async move {
            let ok = async {
                let (device, characteristic) = resolver
                    .characteristic(&device_id, &service_id, &characteristic_id)
                    .await?;
                stack
                    .write_without_response(&device, &characteristic, &payload)
                    .await
            }
            .await;
            let ok = match ok {
                Ok(()) => true,
                Err(err) => {
                    resolver.note(&err);
                    false
                }
            };
            let _ = done_tx.send(ok);
        });
        if block {
            self.wait_for(done_rx)
        } else {
            false
        }
    }

    /// Removes the cached device entry, closing its handle and every
    /// descendant service handle. No-op when the device was never resolved.
    /// The next resolution of the same identifier runs a fresh discovery.
    pub fn disconnect(&self, device_id: &str) {
        log::info!("Disconnecting {}", device_id);
        if let Some((device, services)) = self.cache.remove_device(CacheKey::of(device_id)) {
            let stack = self.stack.clone();
            self.rt.block_on(async move {
                stack.close_device(device).await;
                for service in services {
                    stack.close_service(service).await;
                }
            });
        }
    }

    /// Cooperative shutdown: stops scanning, drains every queue (waking any
    /// blocked poller), revokes every subscription and closes every cached
    /// handle, device before its services. Idempotent; the second call
    /// returns immediately. In-flight stack operations are not aborted,
    /// their results are discarded at the next quit check.
    pub fn quit(&self) {
        if self.quit.request() {
            return;
        }
        log::info!("Engine shutdown");
        self.stop_device_scan();
        self.device_queue.cancel();
        self.service_queue.cancel();
        self.characteristic_queue.cancel();

        // Flag is already set, so no subscribe task can append past this
        // drain; revocation itself happens outside the lock.
        let subscriptions: Vec<Subscription<S>> = {
            let mut subs = self.subscriptions.lock().unwrap();
            subs.drain(..).collect()
        };
        let stack = self.stack.clone();
        self.rt.block_on(async move {
            for subscription in subscriptions {
                stack.unsubscribe(subscription.token).await;
            }
        });
        self.data_queue.cancel();

        let entries = self.cache.take_all();
        let stack = self.stack.clone();
        self.rt.block_on(async move {
            for (device, services) in entries {
                stack.close_device(device).await;
                for service in services {
                    stack.close_service(service).await;
                }
            }
        });
    }

    /// Human-readable cause of the most recent failure, `"Ok"` when the
    /// last recorded operation succeeded.
    pub fn last_error(&self) -> String {
        self.last_error.get()
    }

    /// Blocks the calling thread until the spawned operation reports back
    /// or shutdown is requested, whichever comes first.
    fn wait_for(&self, done: Receiver<bool>) -> bool {
        if self.quit.is_set() {
            return false;
        }
        let quit = self.quit.watcher();
        select! {
            recv(done) -> result => result.unwrap_or(false),
            recv(quit) -> _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockStack;
    use std::sync::atomic::Ordering;
    use std::thread;
    use std::time::Duration;
    use uuid::Uuid;

    const HEART_RATE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
    const HR_MEASUREMENT: Uuid = Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
    const DEVICE: &str = "AA:BB:CC:DD:EE:FF";

    fn test_config() -> EngineConfig {
        EngineConfig {
            connect_settle_ms: 0,
            service_settle_ms: 0,
            characteristic_settle_ms: 0,
            ..EngineConfig::default()
        }
    }

    fn engine_with(stack: MockStack) -> Engine<MockStack> {
        let rt = Runtime::new().unwrap();
        Engine::with_stack(rt, stack, test_config())
    }

    fn hr_stack() -> MockStack {
        let stack = MockStack::new();
        stack.add_device(DEVICE, HEART_RATE, &[HR_MEASUREMENT]);
        stack
    }

    fn wait_until(what: &str, mut ready: impl FnMut() -> bool) {
        for _ in 0..200 {
            if ready() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn test_device_scan_delivers_advertisement() {
        let engine = engine_with(hr_stack());
        engine.start_device_scan(&[]);
        wait_until("watch armed", || engine.stack.watching());

        engine.stack.advertise(DeviceUpdate {
            id: DEVICE.to_string(),
            name: "Sensor1".to_string(),
            is_connectable: true,
            manufacturer_data: Vec::new(),
        });
        match engine.poll_device(true) {
            ScanStatus::Available(update) => {
                assert_eq!(update.id, DEVICE);
                assert_eq!(update.name, "Sensor1");
            }
            other => panic!("expected advertisement, got {:?}", other),
        }
        assert_eq!(engine.poll_device(false), ScanStatus::Processing);

        engine.stop_device_scan();
        assert_eq!(engine.poll_device(true), ScanStatus::Finished);
        engine.quit();
    }

    #[test]
    fn test_failed_scan_start_finishes_queue() {
        let stack = hr_stack();
        stack.fail_watch();
        let engine = engine_with(stack);
        engine.start_device_scan(&[]);
        // The watcher never armed; a blocked poll must still return
        // instead of waiting for items that can never arrive.
        assert_eq!(engine.poll_device(true), ScanStatus::Finished);
        assert!(engine.last_error().contains("scan start"));
        engine.quit();
    }

    #[test]
    fn test_scan_restart_replaces_watcher() {
        let engine = engine_with(hr_stack());
        engine.start_device_scan(&[]);
        wait_until("watch armed", || engine.stack.watching());

        // Restart without an intervening stop revokes the old watcher
        // before arming the new one.
        engine.start_device_scan(&[]);
        wait_until("previous watcher revoked", || {
            engine.stack.counters.watch_stops.load(Ordering::SeqCst) == 1
        });
        wait_until("watch rearmed", || engine.stack.watching());

        engine.stack.advertise(DeviceUpdate {
            id: DEVICE.to_string(),
            name: "Sensor1".to_string(),
            is_connectable: true,
            manufacturer_data: Vec::new(),
        });
        assert!(matches!(
            engine.poll_device(true),
            ScanStatus::Available(_)
        ));
        assert_eq!(engine.poll_device(false), ScanStatus::Processing);
        engine.quit();
    }

    #[test]
    fn test_service_scan_streams_in_order() {
        let stack = MockStack::new();
        stack.add_device(DEVICE, HEART_RATE, &[HR_MEASUREMENT]);
        let engine = engine_with(stack);

        engine.scan_services(DEVICE);
        match engine.poll_service(true) {
            ScanStatus::Available(service) => {
                assert_eq!(service.uuid, HEART_RATE.to_string());
            }
            other => panic!("expected service, got {:?}", other),
        }
        assert_eq!(engine.poll_service(true), ScanStatus::Finished);
        // Finished stays finished.
        assert_eq!(engine.poll_service(false), ScanStatus::Finished);
        engine.quit();
    }

    #[test]
    fn test_characteristic_scan_reports_description() {
        let engine = engine_with(hr_stack());
        engine.scan_characteristics(DEVICE, &HEART_RATE.to_string());
        match engine.poll_characteristic(true) {
            ScanStatus::Available(characteristic) => {
                assert_eq!(characteristic.uuid, HR_MEASUREMENT.to_string());
                assert!(!characteristic.user_description.is_empty());
            }
            other => panic!("expected characteristic, got {:?}", other),
        }
        assert_eq!(engine.poll_characteristic(true), ScanStatus::Finished);
        engine.quit();
    }

    #[test]
    fn test_resolution_is_cached() {
        let engine = engine_with(hr_stack());
        let service_id = HEART_RATE.to_string();
        let characteristic_id = HR_MEASUREMENT.to_string();

        assert!(engine.subscribe_characteristic(DEVICE, &service_id, &characteristic_id, true));
        assert!(engine.subscribe_characteristic(DEVICE, &service_id, &characteristic_id, true));

        let counters = &engine.stack.counters;
        // Second subscribe is served entirely from the cache.
        assert_eq!(counters.device_queries.load(Ordering::SeqCst), 1);
        assert_eq!(counters.service_queries.load(Ordering::SeqCst), 1);
        assert_eq!(counters.characteristic_queries.load(Ordering::SeqCst), 1);
        // Repeated subscribes are not deduplicated.
        assert_eq!(counters.subscribes.load(Ordering::SeqCst), 2);
        engine.quit();
    }

    #[test]
    fn test_disconnect_forces_rediscovery() {
        let engine = engine_with(hr_stack());
        let service_id = HEART_RATE.to_string();
        let characteristic_id = HR_MEASUREMENT.to_string();

        assert!(engine.subscribe_characteristic(DEVICE, &service_id, &characteristic_id, true));
        engine.disconnect(DEVICE);
        assert_eq!(engine.stack.counters.closed_devices.load(Ordering::SeqCst), 1);

        assert!(engine.subscribe_characteristic(DEVICE, &service_id, &characteristic_id, true));
        assert_eq!(engine.stack.counters.device_queries.load(Ordering::SeqCst), 2);
        engine.quit();
    }

    #[test]
    fn test_subscribe_missing_characteristic_records_error() {
        let engine = engine_with(hr_stack());
        let missing = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb).to_string();

        assert!(!engine.subscribe_characteristic(DEVICE, &HEART_RATE.to_string(), &missing, true));
        assert!(engine.last_error().contains(&missing));
        engine.quit();
    }

    #[test]
    fn test_subscribe_unknown_device_records_error() {
        let engine = engine_with(MockStack::new());
        let result = engine.subscribe_characteristic(
            "11:22:33:44:55:66",
            &HEART_RATE.to_string(),
            &HR_MEASUREMENT.to_string(),
            true,
        );
        assert!(!result);
        assert!(engine.last_error().contains("11:22:33:44:55:66"));
        engine.quit();
    }

    #[test]
    fn test_nonblocking_subscribe_returns_immediately() {
        let engine = engine_with(hr_stack());
        // Contract: the result of a non-blocking subscribe carries no
        // meaning; completion is only observable through later calls.
        engine.subscribe_characteristic(
            DEVICE,
            &HEART_RATE.to_string(),
            &HR_MEASUREMENT.to_string(),
            false,
        );
        wait_until("subscription registered", || {
            engine.stack.counters.subscribes.load(Ordering::SeqCst) == 1
        });
        engine.quit();
    }

    #[test]
    fn test_notifications_reach_data_queue() {
        let engine = engine_with(hr_stack());
        let service_id = HEART_RATE.to_string();
        let characteristic_id = HR_MEASUREMENT.to_string();
        assert!(engine.subscribe_characteristic(DEVICE, &service_id, &characteristic_id, true));

        engine.stack.notify(HR_MEASUREMENT, &[0x06, 0x48]);
        let data = engine.poll_data(true).expect("notification expected");
        assert_eq!(data.device_id, DEVICE);
        assert_eq!(data.characteristic_uuid, characteristic_id);
        assert_eq!(data.payload, vec![0x06, 0x48]);
        assert!(engine.poll_data(false).is_none());
        engine.quit();
    }

    #[test]
    fn test_send_data_writes_bounded_payload() {
        let engine = engine_with(hr_stack());
        let service_id = HEART_RATE.to_string();
        let characteristic_id = HR_MEASUREMENT.to_string();
        let oversized = vec![0x55u8; crate::types::MAX_ATTRIBUTE_LEN + 64];

        assert!(engine.send_data(DEVICE, &service_id, &characteristic_id, &oversized, true));
        let writes = engine.stack.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, HR_MEASUREMENT);
        assert_eq!(writes[0].1.len(), crate::types::MAX_ATTRIBUTE_LEN);
        engine.quit();
    }

    #[test]
    fn test_quit_unblocks_waiting_poll() {
        let engine = Arc::new(engine_with(hr_stack()));
        engine.start_device_scan(&[]);
        wait_until("watch armed", || engine.stack.watching());

        let poller = {
            let engine = engine.clone();
            thread::spawn(move || engine.poll_device(true))
        };
        thread::sleep(Duration::from_millis(30));
        engine.quit();
        // No advertisement was ever produced; the poll still finishes.
        assert_eq!(poller.join().unwrap(), ScanStatus::Finished);
    }

    #[test]
    fn test_quit_is_idempotent() {
        let engine = engine_with(hr_stack());
        assert!(engine.subscribe_characteristic(
            DEVICE,
            &HEART_RATE.to_string(),
            &HR_MEASUREMENT.to_string(),
            true,
        ));
        engine.quit();
        engine.quit();

        let counters = &engine.stack.counters;
        assert_eq!(counters.revoked.load(Ordering::SeqCst), 1);
        assert_eq!(counters.closed_devices.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_quit_drops_incoming_notifications() {
        let engine = engine_with(hr_stack());
        assert!(engine.subscribe_characteristic(
            DEVICE,
            &HEART_RATE.to_string(),
            &HR_MEASUREMENT.to_string(),
            true,
        ));
        engine.quit();
        engine.stack.notify(HR_MEASUREMENT, &[1, 2, 3]);
        assert!(engine.poll_data(false).is_none());
    }

    #[test]
    fn test_scan_restarts_after_quit() {
        let engine = engine_with(hr_stack());
        engine.quit();
        engine.start_device_scan(&[]);
        wait_until("watch armed", || engine.stack.watching());
        assert_eq!(engine.last_error(), "Ok");

        engine.stack.advertise(DeviceUpdate {
            id: DEVICE.to_string(),
            name: "Sensor1".to_string(),
            is_connectable: true,
            manufacturer_data: Vec::new(),
        });
        assert!(matches!(
            engine.poll_device(true),
            ScanStatus::Available(_)
        ));
        engine.quit();
    }
}
