//! Envelope encoding and fail-closed decoding.
//!
//! [`decode`] never hands back a partially-populated envelope: a frame is
//! either a complete, semantically valid [`Envelope`] or a [`DecodeError`].
//! Decode errors are connection-fatal on both sides of the tunnel.

use thiserror::Error;

use super::protocol::Envelope;

/// Largest frame either side accepts (16 MiB).
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Encode an envelope as frame bytes.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    serde_json::to_vec(envelope).expect("envelope types always serialize")
}

/// Encode an envelope as a text frame payload.
pub fn encode_text(envelope: &Envelope) -> String {
    serde_json::to_string(envelope).expect("envelope types always serialize")
}

/// Decode one frame.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(DecodeError::TooLarge {
            len: bytes.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let envelope: Envelope = serde_json::from_slice(bytes)?;
    validate(&envelope)?;
    Ok(envelope)
}

fn invalid(field: &'static str, reason: impl Into<String>) -> DecodeError {
    DecodeError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn require(field: &'static str, value: &str) -> Result<(), DecodeError> {
    if value.trim().is_empty() {
        Err(invalid(field, "must not be empty"))
    } else {
        Ok(())
    }
}

fn validate(envelope: &Envelope) -> Result<(), DecodeError> {
    match envelope {
        Envelope::Register(reg) => {
            require("tenant_id", &reg.tenant_id)?;
            require("auth_token", &reg.auth_token)
        }
        Envelope::RegisterAck(ack) => require("session_id", &ack.session_id),
        Envelope::Request(req) => {
            require("correlation_id", &req.correlation_id)?;
            require("method", &req.method)?;
            if !req.method.bytes().all(|b| b.is_ascii_alphabetic()) {
                return Err(invalid("method", format!("{:?} is not an HTTP method", req.method)));
            }
            if !req.path.starts_with('/') {
                return Err(invalid("path", "must start with '/'"));
            }
            Ok(())
        }
        Envelope::Response(resp) => {
            require("correlation_id", &resp.correlation_id)?;
            if !(100..=999).contains(&resp.status) {
                return Err(invalid("status", format!("{} out of range", resp.status)));
            }
            Ok(())
        }
        Envelope::Cancel { correlation_id } => require("correlation_id", correlation_id),
        Envelope::Error(err) => require("code", &err.code),
        Envelope::Ping { .. } | Envelope::Pong { .. } | Envelope::Shutdown { .. } => Ok(()),
    }
}
