//! # Error Types Module
//!
//! Centralized error handling for the engine.
//!
//! ## Error Types
//! - `EngineError`: resolution, discovery and stack call failures
//! - `ConfigError`: configuration file I/O and parsing errors
//!
//! No error crosses the engine boundary as a panic or a `Result`: public
//! operations return null/false results and record the cause in the shared
//! [`LastError`] slot, which the caller reads on demand.

use std::fmt;
use std::sync::Mutex;

/// Errors raised by resolution, scanning, subscription and write paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// No device answered to the given identifier.
    DeviceNotFound { device: String },
    /// Device resolved, but it exposes no such service.
    ServiceNotFound { service: String },
    /// Service resolved, but it exposes no such characteristic.
    CharacteristicNotFound {
        characteristic: String,
        service: String,
    },
    /// The identifier is not a parsable UUID.
    InvalidIdentifier { identifier: String },
    /// A stack call failed or returned a non-success status. Also covers
    /// consent prompts and access-denied answers from the platform.
    Communication {
        operation: &'static str,
        detail: String,
    },
    /// The operation observed shutdown mid-flight.
    Cancelled,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::DeviceNotFound { device } => {
                write!(f, "Failed to connect to device {}", device)
            }
            EngineError::ServiceNotFound { service } => {
                write!(f, "No service found with uuid {}", service)
            }
            EngineError::CharacteristicNotFound {
                characteristic,
                service,
            } => {
                write!(
                    f,
                    "No characteristic found with uuid {} for service {}",
                    characteristic, service
                )
            }
            EngineError::InvalidIdentifier { identifier } => {
                write!(f, "Identifier {} is not a valid uuid", identifier)
            }
            EngineError::Communication { operation, detail } => {
                write!(f, "{} failed: {}", operation, detail)
            }
            EngineError::Cancelled => {
                write!(f, "Operation cancelled by shutdown")
            }
        }
    }
}

impl std::error::Error for EngineError {}

/// Single-slot "last error" store.
///
/// Every failing operation overwrites the slot; successful resolutions reset
/// it to `"Ok"`. The slot is not correlated to any particular call, so a
/// caller that needs the cause of a failure must read it right after the
/// failing call returns. Concurrent failures race and the most recent one
/// wins. Known limitation.
pub struct LastError {
    slot: Mutex<String>,
}

impl LastError {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new("Ok".to_string()),
        }
    }

    /// Overwrites the slot with the error's message and logs it.
    pub fn record(&self, err: &EngineError) {
        log::error!("{}", err);
        *self.slot.lock().unwrap() = err.to_string();
    }

    /// Resets the slot to `"Ok"`.
    pub fn clear(&self) {
        *self.slot.lock().unwrap() = "Ok".to_string();
    }

    pub fn get(&self) -> String {
        self.slot.lock().unwrap().clone()
    }
}

impl Default for LastError {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors that can occur during configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read config file
    ReadFailed(std::io::Error),
    /// Failed to write config file
    WriteFailed(std::io::Error),
    /// Failed to parse config file
    ParseFailed(toml::de::Error),
    /// Failed to serialize config
    SerializeFailed(toml::ser::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ReadFailed(e) => {
                write!(f, "Failed to read config file: {}", e)
            }
            ConfigError::WriteFailed(e) => {
                write!(f, "Failed to write config file: {}", e)
            }
            ConfigError::ParseFailed(e) => {
                write!(f, "Failed to parse config file: {}", e)
            }
            ConfigError::SerializeFailed(e) => {
                write!(f, "Failed to serialize config: {}", e)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::ReadFailed(e) => Some(e),
            ConfigError::WriteFailed(e) => Some(e),
            ConfigError::ParseFailed(e) => Some(e),
            ConfigError::SerializeFailed(e) => Some(e),
        }
    }
}
