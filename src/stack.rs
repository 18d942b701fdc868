//! The adapter seam: everything the engine needs from the platform BLE
//! stack, expressed as one async trait so tests can run against a scripted
//! double.
//!
//! Every operation may fail or hang indefinitely; the engine adds no
//! timeouts of its own. Discovery methods distinguish "the stack answered
//! but found nothing" (`Ok(None)`) from "the call itself failed" (`Err`),
//! leaving identifier context to the caller.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineError;
use crate::types::{CharacteristicInfo, DeviceUpdate, NotificationData, ServiceInfo};

/// Delivers advertisement events into the engine's device queue.
pub type AdvertisementSink = Arc<dyn Fn(DeviceUpdate) + Send + Sync>;

/// Delivers value-changed events into the engine's data queue.
pub type NotificationSink = Arc<dyn Fn(NotificationData) + Send + Sync>;

#[async_trait]
pub trait BleStack: Send + Sync + 'static {
    /// Opaque handle to a connected device.
    type Device: Clone + Send + Sync;
    /// Opaque handle to a discovered service.
    type Service: Clone + Send + Sync;
    /// Opaque handle to a discovered characteristic.
    type Characteristic: Clone + Send + Sync;
    /// Capability that revokes one live notification subscription when
    /// passed back to [`BleStack::unsubscribe`].
    type SubscriptionToken: Send;
    /// Capability that stops a running advertisement watch when passed back
    /// to [`BleStack::stop_advertisement_watch`].
    type WatchToken: Send;

    /// Connects to the device with the given identifier. `Ok(None)` when no
    /// such device is known to the adapter.
    async fn connect_device(&self, device_id: &str) -> Result<Option<Self::Device>, EngineError>;

    /// Looks up one service by UUID on a connected device.
    async fn find_service(
        &self,
        device: &Self::Device,
        service: Uuid,
    ) -> Result<Option<Self::Service>, EngineError>;

    /// Looks up one characteristic by UUID under a resolved service.
    async fn find_characteristic(
        &self,
        device: &Self::Device,
        service: &Self::Service,
        characteristic: Uuid,
    ) -> Result<Option<Self::Characteristic>, EngineError>;

    /// Enumerates every service of a connected device.
    async fn enumerate_services(
        &self,
        device: &Self::Device,
    ) -> Result<Vec<ServiceInfo>, EngineError>;

    /// Enumerates every characteristic of a resolved service.
    async fn enumerate_characteristics(
        &self,
        device: &Self::Device,
        service: &Self::Service,
    ) -> Result<Vec<CharacteristicInfo>, EngineError>;

    /// Arms the advertisement watcher. Every matching advertisement is
    /// handed to the sink until the returned token is passed to
    /// [`BleStack::stop_advertisement_watch`].
    async fn start_advertisement_watch(
        &self,
        required_services: Vec<Uuid>,
        sink: AdvertisementSink,
    ) -> Result<Self::WatchToken, EngineError>;

    async fn stop_advertisement_watch(&self, token: Self::WatchToken);

    /// Enables notifications on a characteristic and routes every
    /// value-changed event to the sink.
    async fn subscribe(
        &self,
        device: &Self::Device,
        characteristic: &Self::Characteristic,
        sink: NotificationSink,
    ) -> Result<Self::SubscriptionToken, EngineError>;

    async fn unsubscribe(&self, token: Self::SubscriptionToken);

    /// Writes a payload to a characteristic without waiting for a response
    /// from the peripheral.
    async fn write_without_response(
        &self,
        device: &Self::Device,
        characteristic: &Self::Characteristic,
        payload: &[u8],
    ) -> Result<(), EngineError>;

    /// Closes a device handle. Must precede closing its services.
    async fn close_device(&self, device: Self::Device);

    /// Closes a service handle.
    async fn close_service(&self, service: Self::Service);
}
