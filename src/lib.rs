//! Client-side BLE GATT engine with a polling surface.
//!
//! The engine connects to peripherals, caches resolved GATT handles,
//! streams scan results through bounded-latency queues and forwards
//! characteristic notifications, all driven by plain synchronous calls
//! from the embedding application. Asynchronous work runs on an internal
//! Tokio runtime; callers only ever see queue polls and completion flags.

mod btle;
mod cache;
mod config;
mod engine;
mod error;
mod ident;
#[cfg(test)]
mod mock;
mod queue;
mod quit;
mod resolve;
mod stack;
mod types;

pub use btle::BtleStack;
pub use config::EngineConfig;
pub use engine::{BleEngine, Engine};
pub use error::{ConfigError, EngineError};
pub use queue::ScanStatus;
pub use stack::{AdvertisementSink, BleStack, NotificationSink};
pub use types::{
    CharacteristicInfo, DeviceUpdate, NotificationData, ServiceInfo, MAX_ATTRIBUTE_LEN,
};
