//! Tunnel wire types.
//!
//! Every frame on the tunnel is one [`Envelope`], a JSON object internally
//! tagged by `"type"`:
//!
//! | `type`         | Direction        | Payload                                  |
//! |----------------|------------------|------------------------------------------|
//! | `register`     | agent → broker   | [`Registration`] (must be the first frame) |
//! | `register_ack` | broker → agent   | [`RegistrationAck`]                      |
//! | `request`      | both             | [`RequestEnvelope`]                      |
//! | `response`     | both             | [`ResponseEnvelope`] (one per body chunk) |
//! | `cancel`       | broker → agent   | correlation ID of an abandoned request   |
//! | `ping`/`pong`  | both             | sender timestamp (unix ms), echoed back  |
//! | `error`        | both             | [`ErrorEnvelope`]                        |
//! | `shutdown`     | broker → agent   | broker is going away, reconnect promptly |
//!
//! Body bytes travel base64-encoded (standard alphabet).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Protocol version spoken by this build. Registrations with any other
/// version are rejected.
pub const PROTOCOL_VERSION: u32 = 1;

/// Error codes carried in [`ErrorEnvelope::code`].
pub mod codes {
    pub const AUTH_REJECTED: &str = "AUTH_REJECTED";
    pub const UNSUPPORTED_VERSION: &str = "UNSUPPORTED_VERSION";
    pub const REGISTRATION_REQUIRED: &str = "REGISTRATION_REQUIRED";
    pub const INVALID_FRAME: &str = "INVALID_FRAME";
}

/// Header name/value pairs. Order carries no meaning.
pub type Headers = Vec<(String, String)>;

/// Scheduling tier of a request. Ordered so that `High > Normal > Low`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// All tiers, highest first.
    pub const DESCENDING: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    /// Parse a tier name case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// First frame an agent sends after the transport is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub tenant_id: String,
    pub auth_token: String,
    pub protocol_version: u32,
}

/// Broker's acceptance of a [`Registration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationAck {
    pub session_id: String,
    /// Broker wall clock, unix ms.
    pub server_time: u64,
}

/// An HTTP request travelling down (or, for agent-originated calls, up) the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub correlation_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: Headers,
    /// `None` means an empty body.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64_opt")]
    pub body: Option<Vec<u8>>,
    #[serde(default)]
    pub priority: Priority,
    /// When the request was created, unix ms.
    pub enqueued_at_ms: u64,
}

impl RequestEnvelope {
    /// Build a request with a fresh correlation ID, stamped with the current time.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            path: path.into(),
            headers: Vec::new(),
            body: None,
            priority: Priority::Normal,
            enqueued_at_ms: unix_ms(),
        }
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }
}

/// One chunk of an HTTP response. Chunks of one correlation ID are numbered
/// from zero by `seq`; status and headers are authoritative on `seq == 0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub correlation_id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub seq: u64,
    #[serde(default, with = "b64")]
    pub body: Vec<u8>,
    pub is_final: bool,
    /// Set by the forwarder when the tunnel side failed (runtime unreachable,
    /// local timeout). Application errors from the runtime leave this empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// A single, final response chunk.
    pub fn complete(correlation_id: impl Into<String>, status: u16, headers: Headers, body: Vec<u8>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status,
            headers,
            seq: 0,
            body,
            is_final: true,
            error: None,
        }
    }

    /// A terminal tunnel-side failure with a JSON error body.
    pub fn failure(correlation_id: impl Into<String>, status: u16, seq: u64, message: impl Into<String>) -> Self {
        let message = message.into();
        let body = serde_json::to_vec(&serde_json::json!({
            "error": message,
            "code": "LOCAL_RUNTIME_ERROR",
        }))
        .unwrap_or_default();
        Self {
            correlation_id: correlation_id.into(),
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            seq,
            body,
            is_final: true,
            error: Some(message),
        }
    }
}

/// Protocol-level error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// A single tunnel frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Register(Registration),
    RegisterAck(RegistrationAck),
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
    Cancel { correlation_id: String },
    Ping { ts: u64 },
    Pong { ts: u64 },
    Error(ErrorEnvelope),
    Shutdown { reason: String },
}

impl Envelope {
    /// The `type` discriminant as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::RegisterAck(_) => "register_ack",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Cancel { .. } => "cancel",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Error(_) => "error",
            Self::Shutdown { .. } => "shutdown",
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error(ErrorEnvelope {
            code: code.to_string(),
            message: message.into(),
            correlation_id: None,
        })
    }
}

/// Wall clock as unix milliseconds.
pub fn unix_ms() -> u64 {
    #[allow(clippy::cast_possible_truncation)]
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_str(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
