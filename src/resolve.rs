//! Cache-first resolution of textual identifiers into platform handles.
//!
//! Each resolver checks the cache, and only on a miss issues one discovery
//! call against the stack, inserting the result on success. The chain runs
//! characteristic -> service -> device, so resolving a characteristic warms
//! the two levels above it. Resolution is re-entrant; only the cache
//! mutation is serialized, and the cache lock is never held across an
//! await. Concurrent misses for the same key each query the stack and the
//! last insert wins.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::cache::ResourceCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, LastError};
use crate::ident::{parse_uuid, CacheKey};
use crate::stack::BleStack;

pub type HandleCache<S> = ResourceCache<
    <S as BleStack>::Device,
    <S as BleStack>::Service,
    <S as BleStack>::Characteristic,
>;

pub struct Resolver<S: BleStack> {
    stack: Arc<S>,
    cache: Arc<HandleCache<S>>,
    last_error: Arc<LastError>,
    config: EngineConfig,
}

// Manual impl: S itself is not Clone, only the Arcs are.
impl<S: BleStack> Clone for Resolver<S> {
    fn clone(&self) -> Self {
        Self {
            stack: self.stack.clone(),
            cache: self.cache.clone(),
            last_error: self.last_error.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: BleStack> Resolver<S> {
    pub fn new(
        stack: Arc<S>,
        cache: Arc<HandleCache<S>>,
        last_error: Arc<LastError>,
        config: EngineConfig,
    ) -> Self {
        Self {
            stack,
            cache,
            last_error,
            config,
        }
    }

    /// Explicit settle stage between a parent resolution and a child query;
    /// without it the stack answers the child query with an empty result.
    pub async fn settle(&self, ms: u64) {
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    pub async fn device(&self, device_id: &str) -> Result<S::Device, EngineError> {
        let key = CacheKey::of(device_id);
        if let Some(handle) = self.cache.device(key) {
            log::debug!("Using cached connection for {}", device_id);
            return Ok(handle);
        }
        match self.stack.connect_device(device_id).await {
            Ok(Some(handle)) => {
                self.last_error.clear();
                self.settle(self.config.connect_settle_ms).await;
                self.cache.insert_device(key, handle.clone());
                log::info!("Connected {}", device_id);
                Ok(handle)
            }
            Ok(None) => Err(self.record(EngineError::DeviceNotFound {
                device: device_id.to_string(),
            })),
            Err(err) => Err(self.record(err)),
        }
    }

    pub async fn service(
        &self,
        device_id: &str,
        service_id: &str,
    ) -> Result<S::Service, EngineError> {
        let device = self.device(device_id).await?;
        let dkey = CacheKey::of(device_id);
        let skey = CacheKey::of(service_id);
        if let Some(handle) = self.cache.service(dkey, skey) {
            log::debug!("Using cached service {}", service_id);
            return Ok(handle);
        }
        let uuid = self.identifier(service_id)?;
        match self.stack.find_service(&device, uuid).await {
            Ok(Some(handle)) => {
                self.last_error.clear();
                if !self.cache.insert_service(dkey, skey, handle.clone()) {
                    log::debug!(
                        "Device entry for {} removed while service {} resolved",
                        device_id,
                        service_id
                    );
                }
                Ok(handle)
            }
            Ok(None) => Err(self.record(EngineError::ServiceNotFound {
                service: service_id.to_string(),
            })),
            Err(err) => Err(self.record(err)),
        }
    }

    /// Resolves a characteristic, returning the owning device handle with it
    /// since subscribe and write operations are issued against the device.
    pub async fn characteristic(
        &self,
        device_id: &str,
        service_id: &str,
        characteristic_id: &str,
    ) -> Result<(S::Device, S::Characteristic), EngineError> {
        let service = self.service(device_id, service_id).await?;
        // Cache hit after the service resolved above.
        let device = self.device(device_id).await?;
        let dkey = CacheKey::of(device_id);
        let skey = CacheKey::of(service_id);
        let ckey = CacheKey::of(characteristic_id);
        if let Some(handle) = self.cache.characteristic(dkey, skey, ckey) {
            log::debug!("Using cached characteristic {}", characteristic_id);
            return Ok((device, handle));
        }
        let uuid = self.identifier(characteristic_id)?;
        match self.stack.find_characteristic(&device, &service, uuid).await {
            Ok(Some(handle)) => {
                self.last_error.clear();
                if !self
                    .cache
                    .insert_characteristic(dkey, skey, ckey, handle.clone())
                {
                    log::debug!(
                        "Service entry for {} removed while characteristic {} resolved",
                        service_id,
                        characteristic_id
                    );
                }
                Ok((device, handle))
            }
            Ok(None) => Err(self.record(EngineError::CharacteristicNotFound {
                characteristic: characteristic_id.to_string(),
                service: service_id.to_string(),
            })),
            Err(err) => Err(self.record(err)),
        }
    }

    fn identifier(&self, text: &str) -> Result<Uuid, EngineError> {
        parse_uuid(text).ok_or_else(|| {
            self.record(EngineError::InvalidIdentifier {
                identifier: text.to_string(),
            })
        })
    }

    /// Records a failure from a caller that already owns the error.
    pub fn note(&self, err: &EngineError) {
        self.last_error.record(err);
    }

    fn record(&self, err: EngineError) -> EngineError {
        self.last_error.record(&err);
        err
    }
}
