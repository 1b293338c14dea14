//! Wire shapes for the overlay socket.
//!
//! Inbound payloads arrive in two shapes: a JSON-RPC envelope with the
//! payload under `params`, and a flat legacy form. Both are normalized into
//! one [`InboundEvent`] immediately; nothing downstream branches on field
//! presence. Outbound messages always use the enveloped shape.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct InboundPayload {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub speaker: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InboundFrame {
    Enveloped {
        jsonrpc: String,
        params: InboundPayload,
    },
    Legacy(InboundPayload),
}

/// A classified inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    /// Chat comment; generates a reply immediately, bypassing buffering.
    Comment {
        text: String,
        speaker: Option<String>,
    },
    /// Subtitle line; accumulated per speaker until flushed.
    Subtitle {
        text: String,
        speaker: Option<String>,
    },
    /// Unknown type, empty text, or unrecognized envelope.
    Ignored,
}

/// Parse and classify a raw inbound message. Returns an error only for
/// non-JSON input; recognized-but-unusable payloads classify as `Ignored`.
pub fn classify(raw: &str) -> Result<InboundEvent, serde_json::Error> {
    let frame: InboundFrame = serde_json::from_str(raw)?;
    let payload = match frame {
        InboundFrame::Enveloped { jsonrpc, params } if jsonrpc == "2.0" => params,
        InboundFrame::Enveloped { jsonrpc, .. } => {
            tracing::debug!(%jsonrpc, "skip message with unsupported envelope");
            return Ok(InboundEvent::Ignored);
        }
        InboundFrame::Legacy(payload) => payload,
    };

    match payload.kind.as_deref() {
        Some("comment") => {
            if payload.text.is_empty() {
                tracing::info!(speaker = ?payload.speaker, "chat: (empty)");
                return Ok(InboundEvent::Ignored);
            }
            Ok(InboundEvent::Comment {
                text: payload.text,
                speaker: payload.speaker,
            })
        }
        Some("subtitle") => {
            if payload.text.is_empty() {
                tracing::info!(speaker = ?payload.speaker, "subtitle: (empty)");
                return Ok(InboundEvent::Ignored);
            }
            Ok(InboundEvent::Subtitle {
                text: payload.text,
                speaker: payload.speaker,
            })
        }
        other => {
            tracing::debug!(kind = ?other, "skip message type");
            Ok(InboundEvent::Ignored)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OutboundFrame {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: OutboundParams,
}

#[derive(Debug, Serialize)]
pub struct OutboundParams {
    pub text: String,
    pub speaker: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub language: &'static str,
}

/// Build the outbound comment notification for the configured display name.
pub fn comment_frame(text: &str, speaker_name: &str) -> OutboundFrame {
    OutboundFrame {
        jsonrpc: "2.0",
        method: "notifications/subtitle",
        params: OutboundParams {
            text: text.to_string(),
            speaker: speaker_name.to_string(),
            kind: "comment",
            language: "ja",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_enveloped_subtitle() {
        let raw = r#"{"jsonrpc":"2.0","params":{"type":"subtitle","text":"hi","speaker":"a"}}"#;
        assert_eq!(
            classify(raw).unwrap(),
            InboundEvent::Subtitle {
                text: "hi".to_string(),
                speaker: Some("a".to_string()),
            }
        );
    }

    #[test]
    fn classifies_legacy_comment() {
        let raw = r#"{"type":"comment","text":"yo","speaker":null}"#;
        assert_eq!(
            classify(raw).unwrap(),
            InboundEvent::Comment {
                text: "yo".to_string(),
                speaker: None,
            }
        );
    }

    #[test]
    fn unknown_type_is_ignored() {
        let raw = r#"{"type":"presence","text":"x"}"#;
        assert_eq!(classify(raw).unwrap(), InboundEvent::Ignored);
    }

    #[test]
    fn missing_type_is_ignored() {
        assert_eq!(classify(r#"{"text":"x"}"#).unwrap(), InboundEvent::Ignored);
    }

    #[test]
    fn empty_text_is_dropped() {
        let raw = r#"{"jsonrpc":"2.0","params":{"type":"subtitle","text":""}}"#;
        assert_eq!(classify(raw).unwrap(), InboundEvent::Ignored);
        let raw = r#"{"type":"comment","text":""}"#;
        assert_eq!(classify(raw).unwrap(), InboundEvent::Ignored);
    }

    #[test]
    fn non_json_is_an_error() {
        assert!(classify("not json").is_err());
    }

    #[test]
    fn outbound_frame_uses_envelope_shape() {
        let frame = comment_frame("ナイス", "wipe");
        let json = serde_json::to_string(&frame).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "notifications/subtitle");
        assert_eq!(value["params"]["text"], "ナイス");
        assert_eq!(value["params"]["speaker"], "wipe");
        assert_eq!(value["params"]["type"], "comment");
        assert_eq!(value["params"]["language"], "ja");
    }
}
