/**
 * MODELS - Device identity and MQTT payloads for the netwatch kernel
 *
 * ROLE: Typed views of everything that crosses the bus (detections, registrations,
 * status changes) plus the persisted `Device` record.
 *
 * CONTRACTS:
 * - netwatch/devices/detected@v1      (inbound)  -> DetectionEvent
 * - netwatch/devices/registration@v1  (inbound)  -> Registration
 * - netwatch/devices/status@v1        (outbound) <- DeviceStatusChanged
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

pub const DETECTED_TOPIC: &str = "netwatch/devices/detected@v1";
pub const REGISTRATION_TOPIC: &str = "netwatch/devices/registration@v1";
pub const STATUS_TOPIC: &str = "netwatch/devices/status@v1";

/// Sentinel carried in the `event_type` field of every detection payload.
pub const DETECTION_EVENT_TYPE: &str = "device.detected";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("invalid JSON payload: {0}")]
    Json(String),
    #[error("unsupported event type '{0}', expected 'device.detected'")]
    UnsupportedEventType(String),
    #[error("missing or empty field: {0}")]
    MissingField(&'static str),
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),
    #[error("invalid network address: {0}")]
    InvalidAddress(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Hardware address of a device, normalized to `AA:BB:CC:DD:EE:FF`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Accepts `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff`, `aabb.ccdd.eeff` or 12
    /// bare hex digits, in any case. Separators must be consistent.
    pub fn parse(raw: &str) -> Result<Self, EventError> {
        let raw = raw.trim();
        let invalid = || EventError::InvalidMac(raw.to_string());

        let groups: Vec<&str> = if raw.contains(':') {
            raw.split(':').collect()
        } else if raw.contains('-') {
            raw.split('-').collect()
        } else if raw.contains('.') {
            raw.split('.').collect()
        } else {
            vec![raw]
        };
        let group_len = match groups.len() {
            6 => 2,
            3 if raw.contains('.') => 4,
            1 => 12,
            _ => return Err(invalid()),
        };
        let well_formed = groups
            .iter()
            .all(|g| g.len() == group_len && g.chars().all(|c| c.is_ascii_hexdigit()));
        if !well_formed || (group_len == 2 && raw.contains('.')) {
            return Err(invalid());
        }

        let hex = groups.concat().to_ascii_uppercase();
        let pairs: Vec<&str> = (0..6).map(|i| &hex[i * 2..i * 2 + 2]).collect();
        Ok(Self(pairs.join(":")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceId {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeviceId {
    type Error = EventError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

/// Reachability of a device as last verified by a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Never probed.
    #[default]
    Unknown,
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn from_probe(alive: bool) -> Self {
        if alive {
            DeviceStatus::Online
        } else {
            DeviceStatus::Offline
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted device record owned by the device store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub mac_address: DeviceId,
    pub ip_address: Option<String>,
    pub hostname: Option<String>,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_checked: Option<OffsetDateTime>,
}

impl Device {
    pub fn new(mac_address: DeviceId, ip_address: Option<String>) -> Self {
        Self {
            mac_address,
            ip_address,
            hostname: None,
            status: DeviceStatus::Unknown,
            registered_at: OffsetDateTime::now_utc(),
            last_seen: None,
            last_checked: None,
        }
    }
}

// Wire shape of netwatch/devices/detected@v1; every field optional so that a
// missing field is reported by name instead of as a serde error.
#[derive(Debug, Deserialize)]
struct DetectionPayload {
    event_type: Option<String>,
    event_id: Option<String>,
    mac_address: Option<String>,
    ip_address: Option<String>,
    timestamp: Option<String>,
}

/// A "device detected" notification, validated and normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionEvent {
    pub event_id: String,
    pub device_id: DeviceId,
    /// `host` or `host:port`, ready to be placed in a URL authority.
    pub address: String,
    pub detected_at: OffsetDateTime,
}

impl DetectionEvent {
    pub fn new(event_id: impl Into<String>, device_id: DeviceId, address: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            device_id,
            address: address.into(),
            detected_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, EventError> {
        let raw: DetectionPayload =
            serde_json::from_slice(payload).map_err(|e| EventError::Json(e.to_string()))?;

        let event_type = required(raw.event_type, "event_type")?;
        if event_type != DETECTION_EVENT_TYPE {
            return Err(EventError::UnsupportedEventType(event_type));
        }

        let event_id = required(raw.event_id, "event_id")?;
        let device_id = DeviceId::parse(&required(raw.mac_address, "mac_address")?)?;
        let address = normalize_address(&required(raw.ip_address, "ip_address")?)?;
        let detected_at = match raw.timestamp {
            Some(ts) => OffsetDateTime::parse(&ts, &Rfc3339)
                .map_err(|e| EventError::InvalidTimestamp(format!("{ts}: {e}")))?,
            None => OffsetDateTime::now_utc(),
        };

        Ok(Self {
            event_id,
            device_id,
            address,
            detected_at,
        })
    }

    /// Structural check for events built in code rather than parsed from the bus.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.event_id.trim().is_empty() {
            return Err(EventError::MissingField("event_id"));
        }
        normalize_address(&self.address)?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RegistrationPayload {
    mac_address: Option<String>,
    ip_address: Option<String>,
    hostname: Option<String>,
}

/// Payload of netwatch/devices/registration@v1.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub device_id: DeviceId,
    pub address: Option<String>,
    pub hostname: Option<String>,
}

impl Registration {
    pub fn from_payload(payload: &[u8]) -> Result<Self, EventError> {
        let raw: RegistrationPayload =
            serde_json::from_slice(payload).map_err(|e| EventError::Json(e.to_string()))?;

        let device_id = DeviceId::parse(&required(raw.mac_address, "mac_address")?)?;
        let address = match raw.ip_address {
            Some(ip) if !ip.trim().is_empty() => Some(normalize_address(&ip)?),
            _ => None,
        };

        Ok(Self {
            device_id,
            address,
            hostname: raw.hostname.filter(|h| !h.trim().is_empty()),
        })
    }
}

/// Outbound notification emitted when a probe changes a device's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusChanged {
    pub event_id: String,
    pub mac_address: DeviceId,
    pub ip_address: String,
    pub previous_status: DeviceStatus,
    pub status: DeviceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub changed_at: OffsetDateTime,
}

impl DeviceStatusChanged {
    pub fn new(device_id: DeviceId, address: &str, previous_status: DeviceStatus, status: DeviceStatus) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            mac_address: device_id,
            ip_address: address.to_string(),
            previous_status,
            status,
            changed_at: OffsetDateTime::now_utc(),
        }
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, EventError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(EventError::MissingField(field)),
    }
}

/// Accepts an IP or `IP:port`; bare IPv6 addresses get brackets.
pub fn normalize_address(raw: &str) -> Result<String, EventError> {
    let raw = raw.trim();
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return Ok(match ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{v6}]"),
        });
    }
    if let Ok(sock) = raw.parse::<SocketAddr>() {
        return Ok(sock.to_string());
    }
    Err(EventError::InvalidAddress(raw.to_string()))
}
