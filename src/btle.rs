//! btleplug-backed implementation of the adapter seam.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::ident::format_bluetooth_address;
use crate::stack::{AdvertisementSink, BleStack, NotificationSink};
use crate::types::{bounded_payload, CharacteristicInfo, DeviceUpdate, ServiceInfo};

/// Characteristic User Description descriptor.
const USER_DESCRIPTION_UUID: Uuid = Uuid::from_u128(0x00002901_0000_1000_8000_00805f9b34fb);

const NO_DESCRIPTION: &str = "no description available";

pub struct BtleStack {
    adapter: Adapter,
    config: EngineConfig,
}

/// Stops the advertisement watch task when passed back to the stack.
pub struct WatchHandle {
    task: JoinHandle<()>,
}

/// Revokes one live subscription: aborts the notification forwarding task
/// and disables notifications on the characteristic.
pub struct SubscriptionHandle {
    peripheral: Peripheral,
    characteristic: Characteristic,
    task: JoinHandle<()>,
}

impl BtleStack {
    /// Binds to the first system Bluetooth adapter.
    pub async fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let manager = Manager::new().await.map_err(comm("manager init"))?;
        let adapters = manager.adapters().await.map_err(comm("adapter lookup"))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Communication {
                operation: "adapter lookup",
                detail: "No Bluetooth adapter found".to_string(),
            })?;
        Ok(Self { adapter, config })
    }
}

/// Engine-facing device identifier: the radio address in "AA:BB:CC:DD:EE:FF"
/// form.
fn device_ident(peripheral: &Peripheral) -> String {
    let bytes = peripheral.address().into_inner();
    let mut address: u64 = 0;
    for byte in bytes {
        address = (address << 8) | byte as u64;
    }
    format_bluetooth_address(address)
}

fn comm(operation: &'static str) -> impl FnOnce(btleplug::Error) -> EngineError {
    move |err| EngineError::Communication {
        operation,
        detail: err.to_string(),
    }
}

fn find_service_by_uuid(peripheral: &Peripheral, uuid: Uuid) -> Option<Service> {
    peripheral
        .services()
        .into_iter()
        .find(|service| service.uuid == uuid)
}

#[async_trait]
impl BleStack for BtleStack {
    type Device = Peripheral;
    type Service = Service;
    type Characteristic = Characteristic;
    type SubscriptionToken = SubscriptionHandle;
    type WatchToken = WatchHandle;

    async fn connect_device(&self, device_id: &str) -> Result<Option<Peripheral>, EngineError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(comm("device lookup"))?;
        for peripheral in peripherals {
            if device_ident(&peripheral).eq_ignore_ascii_case(device_id) {
                peripheral.connect().await.map_err(comm("device connect"))?;
                // GATT resolution happens here, once per connection; later
                // lookups are served from the resolved set.
                peripheral
                    .discover_services()
                    .await
                    .map_err(comm("service discovery"))?;
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }

    async fn find_service(
        &self,
        device: &Peripheral,
        service: Uuid,
    ) -> Result<Option<Service>, EngineError> {
        if let Some(found) = find_service_by_uuid(device, service) {
            return Ok(Some(found));
        }
        // Not in the resolved set; re-discover once in case the peripheral
        // changed its table after connection.
        device
            .discover_services()
            .await
            .map_err(comm("service discovery"))?;
        Ok(find_service_by_uuid(device, service))
    }

    async fn find_characteristic(
        &self,
        _device: &Peripheral,
        service: &Service,
        characteristic: Uuid,
    ) -> Result<Option<Characteristic>, EngineError> {
        Ok(service
            .characteristics
            .iter()
            .find(|c| c.uuid == characteristic)
            .cloned())
    }

    async fn enumerate_services(
        &self,
        device: &Peripheral,
    ) -> Result<Vec<ServiceInfo>, EngineError> {
        device
            .discover_services()
            .await
            .map_err(comm("service discovery"))?;
        Ok(device
            .services()
            .into_iter()
            .map(|service| ServiceInfo {
                uuid: service.uuid.to_string(),
            })
            .collect())
    }

    async fn enumerate_characteristics(
        &self,
        device: &Peripheral,
        service: &Service,
    ) -> Result<Vec<CharacteristicInfo>, EngineError> {
        let mut found = Vec::new();
        for characteristic in &service.characteristics {
            let descriptor = characteristic
                .descriptors
                .iter()
                .find(|d| d.uuid == USER_DESCRIPTION_UUID);
            let user_description = match descriptor {
                Some(descriptor) => match device.read_descriptor(descriptor).await {
                    Ok(value) => String::from_utf8_lossy(&value).into_owned(),
                    Err(err) => {
                        log::warn!(
                            "Couldn't read user description for characteristic {}: {}",
                            characteristic.uuid,
                            err
                        );
                        NO_DESCRIPTION.to_string()
                    }
                },
                None => NO_DESCRIPTION.to_string(),
            };
            found.push(CharacteristicInfo {
                uuid: characteristic.uuid.to_string(),
                user_description,
            });
        }
        Ok(found)
    }

    async fn start_advertisement_watch(
        &self,
        required_services: Vec<Uuid>,
        sink: AdvertisementSink,
    ) -> Result<WatchHandle, EngineError> {
        let mut events = self.adapter.events().await.map_err(comm("watcher events"))?;
        self.adapter
            .start_scan(ScanFilter {
                services: required_services.clone(),
            })
            .await
            .map_err(comm("scan start"))?;

        let adapter = self.adapter.clone();
        let company_id = self.config.manufacturer_company_id;
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(props)) = peripheral.properties().await else {
                    continue;
                };
                // Some backends don't apply the service filter to scan
                // response data, so filter again here.
                if !required_services.is_empty()
                    && !required_services
                        .iter()
                        .any(|uuid| props.services.contains(uuid))
                {
                    continue;
                }
                let name = props.local_name.unwrap_or_default();
                let manufacturer_data = props
                    .manufacturer_data
                    .get(&company_id)
                    .map(|data| bounded_payload(data))
                    .unwrap_or_default();
                log::debug!("Scan received {}", name);
                sink(DeviceUpdate {
                    id: device_ident(&peripheral),
                    name,
                    is_connectable: true,
                    manufacturer_data,
                });
            }
        });
        Ok(WatchHandle { task })
    }

    async fn stop_advertisement_watch(&self, token: WatchHandle) {
        token.task.abort();
        if let Err(err) = self.adapter.stop_scan().await {
            log::warn!("Failed to stop scan: {}", err);
        }
    }

    async fn subscribe(
        &self,
        device: &Peripheral,
        characteristic: &Characteristic,
        sink: NotificationSink,
    ) -> Result<SubscriptionHandle, EngineError> {
        device
            .subscribe(characteristic)
            .await
            .map_err(comm("subscribe"))?;
        let mut notifications = device
            .notifications()
            .await
            .map_err(comm("notification stream"))?;

        let device_id = device_ident(device);
        let service_uuid = characteristic.service_uuid.to_string();
        let characteristic_uuid = characteristic.uuid.to_string();
        let target = characteristic.uuid;
        // The notifications stream is multiplexed across all subscribed
        // characteristics of the peripheral; one forwarding task per
        // subscription filters for its own.
        let task = tokio::spawn(async move {
            while let Some(event) = notifications.next().await {
                if event.uuid != target {
                    continue;
                }
                sink(crate::types::NotificationData {
                    device_id: device_id.clone(),
                    service_uuid: service_uuid.clone(),
                    characteristic_uuid: characteristic_uuid.clone(),
                    payload: bounded_payload(&event.value),
                });
            }
        });
        Ok(SubscriptionHandle {
            peripheral: device.clone(),
            characteristic: characteristic.clone(),
            task,
        })
    }

    async fn unsubscribe(&self, token: SubscriptionHandle) {
        token.task.abort();
        if let Err(err) = token.peripheral.unsubscribe(&token.characteristic).await {
            log::warn!(
                "Failed to unsubscribe from {}: {}",
                token.characteristic.uuid,
                err
            );
        }
    }

    async fn write_without_response(
        &self,
        device: &Peripheral,
        characteristic: &Characteristic,
        payload: &[u8],
    ) -> Result<(), EngineError> {
        device
            .write(characteristic, payload, WriteType::WithoutResponse)
            .await
            .map_err(comm("characteristic write"))
    }

    async fn close_device(&self, device: Peripheral) {
        if let Err(err) = device.disconnect().await {
            log::warn!("Failed to disconnect {}: {}", device_ident(&device), err);
        }
    }

    async fn close_service(&self, _service: Service) {
        // btleplug services are plain values; the device disconnect above
        // releases the platform resources.
    }
}
