//! Validated device identity

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::SyncError;

pub const MAX_DEVICE_ID_LEN: usize = 64;

/// Opaque identifier for a participating device.
///
/// 1 to 64 characters drawn from ASCII letters, digits, `-` and `_`.
/// Ordered lexically; that order is the second tie-breaker between
/// concurrent operations.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Result<Self, SyncError> {
        let id = id.into();
        let valid_chars = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if id.is_empty() || id.len() > MAX_DEVICE_ID_LEN || !valid_chars {
            return Err(SyncError::InvalidDeviceId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceId {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DeviceId::new(value)
    }
}

impl TryFrom<&str> for DeviceId {
    type Error = SyncError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        DeviceId::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
