//! Local device identity

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Identity of this installation, used as registry key and envelope `deviceId`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_name: String,
}

impl DeviceIdentity {
    /// Generate a fresh identity; `name` overrides the derived display name
    pub fn generate(name: Option<&str>) -> Self {
        let device_id = format!("device_{}", uuid::Uuid::new_v4().simple());
        let device_name = match name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => default_name(&device_id),
        };
        Self {
            device_id,
            device_name,
        }
    }

    /// Identity with a fixed id (tests, restored installations)
    pub fn with_id(device_id: impl Into<String>, name: Option<&str>) -> Self {
        let device_id = device_id.into();
        let device_name = name
            .map(str::to_string)
            .unwrap_or_else(|| default_name(&device_id));
        Self {
            device_id,
            device_name,
        }
    }

    /// Snapshot for display and debugging
    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.device_id.clone(),
            name: self.device_name.clone(),
            timestamp: now_millis(),
        }
    }
}

/// `{id, name, timestamp}` view of the local identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub timestamp: u64,
}

fn default_name(device_id: &str) -> String {
    let chars: Vec<char> = device_id.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(6)..].iter().collect();
    format!("Device_{}", tail)
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
