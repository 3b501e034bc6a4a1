/*!
Bus payloads shaped like the ones detectors and registrars publish.
*/

use netwatch_kernel::models::{DetectionEvent, DeviceId, DETECTION_EVENT_TYPE};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

static NEXT_EVENT: AtomicU64 = AtomicU64::new(1);

/// Unique within the test process.
pub fn next_event_id() -> String {
    format!("evt-{}", NEXT_EVENT.fetch_add(1, Ordering::Relaxed))
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

pub fn detection_json(mac: &str, ip: &str) -> Value {
    json!({
        "event_type": DETECTION_EVENT_TYPE,
        "event_id": next_event_id(),
        "mac_address": mac,
        "ip_address": ip,
        "timestamp": now_rfc3339(),
    })
}

pub fn detection_payload(mac: &str, ip: &str) -> Vec<u8> {
    detection_json(mac, ip).to_string().into_bytes()
}

pub fn registration_payload(mac: &str, ip: &str, hostname: Option<&str>) -> Vec<u8> {
    let mut body = json!({
        "mac_address": mac,
        "ip_address": ip,
    });
    if let Some(name) = hostname {
        body["hostname"] = json!(name);
    }
    body.to_string().into_bytes()
}

/// Already-validated event, for driving the orchestrator directly.
/// Panics on a malformed MAC; meant for literals in tests.
pub fn detection_event(mac: &str, address: &str) -> DetectionEvent {
    let id = DeviceId::parse(mac).unwrap_or_else(|e| panic!("bad fixture MAC {mac}: {e}"));
    DetectionEvent::new(next_event_id(), id, address)
}
