//! Value types crossing the engine boundary.
//!
//! These are plain records copied into and out of the scan queues. They
//! carry no platform handles and no shared ownership, so a foreign caller
//! can hold them for as long as it likes.

/// Largest attribute payload the engine carries, matching the platform's
/// maximum attribute value size. Longer payloads are truncated.
pub const MAX_ATTRIBUTE_LEN: usize = 512;

/// One advertisement observed during a device scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUpdate {
    pub id: String,
    pub name: String,
    pub is_connectable: bool,
    /// Manufacturer data for the configured company identifier, empty when
    /// the advertisement carried none.
    pub manufacturer_data: Vec<u8>,
}

/// One service reported by a service scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: String,
}

/// One characteristic reported by a characteristic scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: String,
    pub user_description: String,
}

/// One value-changed event delivered by a live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationData {
    pub device_id: String,
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub payload: Vec<u8>,
}

/// Copies a payload, truncating it at [`MAX_ATTRIBUTE_LEN`].
pub fn bounded_payload(bytes: &[u8]) -> Vec<u8> {
    bytes[..bytes.len().min(MAX_ATTRIBUTE_LEN)].to_vec()
}
