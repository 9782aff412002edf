//! WebChat input envelopes
//!
//! Chat input arrives as a JSON envelope carrying text plus attachment
//! metadata. The serialized envelope (newline-terminated) is what goes
//! to the PTY; it is also recorded so its immediate echo can be
//! suppressed on the output stream.

use crate::error::{Result, RouterError};
use crate::session::Tab;
use serde::{Deserialize, Serialize};

/// Envelope marker value.
pub const ENVELOPE_MARKER: u8 = 1;

/// One attachment reference inside an envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub mime: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

/// The WebChat input envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Envelope {
    #[serde(rename = "__webchatMessage")]
    pub marker: u8,
    pub version: u32,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Parse and validate an input body as an envelope.
pub fn parse_envelope(body: &[u8]) -> Result<Envelope> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| RouterError::BadRequest(format!("invalid webchat envelope: {e}")))?;
    if envelope.marker != ENVELOPE_MARKER {
        return Err(RouterError::BadRequest(
            "missing __webchatMessage marker".to_string(),
        ));
    }
    Ok(envelope)
}

/// Write an envelope to the tab's PTY (newline-terminated) and record
/// it for echo suppression.
pub async fn write_envelope(tab: &Tab, body: &[u8]) -> Result<()> {
    let envelope = parse_envelope(body)?;
    let serialized = serde_json::to_string(&envelope)
        .map_err(|e| RouterError::Internal(e.to_string()))?;

    tab.record_echo(&serialized);
    tab.write(format!("{serialized}\n").as_bytes()).await
}
