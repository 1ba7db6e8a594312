//! Typed message envelope exchanged over the relay.
//!
//! Every frame on the wire is an [`Envelope`]: an id, a type string, an
//! ISO-8601 timestamp, an opaque JSON payload, and a metadata map that may
//! carry routing targets (`target_session` / `target_user` / `target_device`).

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Which class of device a session belongs to.
///
/// PWA clients are `Mobile` or `Web`; the workstation sidecar is `Desktop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Mobile,
    Web,
    Desktop,
}

impl DeviceClass {
    /// Parse a device-class string. Accepts the plain lowercase names and the
    /// legacy `DEVICE_*` spellings some clients still send.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "mobile" | "device_mobile" => Some(Self::Mobile),
            "web" | "device_web" => Some(Self::Web),
            "desktop" | "device_desktop" => Some(Self::Desktop),
            _ => None,
        }
    }

    /// True for the PWA-facing classes (mobile + web).
    pub fn is_client(self) -> bool {
        matches!(self, Self::Mobile | Self::Web)
    }
}

impl std::fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mobile => write!(f, "mobile"),
            Self::Web => write!(f, "web"),
            Self::Desktop => write!(f, "desktop"),
        }
    }
}

/// A routed message. Produced by a sender, consumed by the router, never
/// stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Filled by `ensure_identity` when a sender omits it.
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: kind.into(),
            timestamp: Utc::now().to_rfc3339(),
            payload,
            metadata: Map::new(),
        }
    }

    /// Fill in `id` and `timestamp` if the sender omitted them.
    pub fn ensure_identity(&mut self) {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.timestamp.is_empty() {
            self.timestamp = Utc::now().to_rfc3339();
        }
    }

    fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn target_session(&self) -> Option<&str> {
        self.metadata_str("target_session")
    }

    pub fn target_user(&self) -> Option<&str> {
        self.metadata_str("target_user")
    }

    pub fn target_device(&self) -> Option<&str> {
        self.metadata_str("target_device")
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// The error envelope returned to a sender when no sidecar session is
    /// available to take its message.
    pub fn no_sidecar_error(original_message_id: &str) -> Self {
        Self::new(
            "error",
            serde_json::json!({
                "original_message_id": original_message_id,
                "error": "No available Sidecar found",
                "code": "NO_SIDECAR",
            }),
        )
    }
}

/// Milliseconds since the Unix epoch. Used as the logical timestamp on
/// counter updates cluster-wide.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_class_including_legacy_spellings() {
        assert_eq!(DeviceClass::parse("desktop"), Some(DeviceClass::Desktop));
        assert_eq!(
            DeviceClass::parse("DEVICE_MOBILE"),
            Some(DeviceClass::Mobile)
        );
        assert_eq!(DeviceClass::parse("web"), Some(DeviceClass::Web));
        assert_eq!(DeviceClass::parse("toaster"), None);
    }

    #[test]
    fn envelope_roundtrips_with_type_field() {
        let env = Envelope::new("runPlan", serde_json::json!({"plan": []}))
            .with_metadata("target_user", Value::String("u1".into()));
        let text = serde_json::to_string(&env).unwrap();
        assert!(text.contains("\"type\":\"runPlan\""));
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back.kind, "runPlan");
        assert_eq!(back.target_user(), Some("u1"));
        assert_eq!(back.target_session(), None);
    }

    #[test]
    fn ensure_identity_fills_missing_fields_only() {
        let mut env: Envelope =
            serde_json::from_str(r#"{"id":"","type":"chat","timestamp":""}"#).unwrap();
        env.ensure_identity();
        assert!(!env.id.is_empty());
        assert!(!env.timestamp.is_empty());

        let mut fixed = Envelope::new("chat", Value::Null);
        fixed.id = "m1".into();
        fixed.ensure_identity();
        assert_eq!(fixed.id, "m1");
    }
}
