//! Wire protocol types for the signaling channel.
//!
//! JSON frames dispatched on a `type` tag. Unknown inbound frame types are
//! logged and dropped for forward compatibility with new server frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Classification of a message payload, carried alongside streamed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentKind {
    PlainText,
    GeneratedUi,
    Markup,
}

/// A complete conversation message. Immutable once emitted to consumers: a
/// streamed message is represented by partial snapshots and one final
/// snapshot, each a distinct value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub kind: ContentKind,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            content: content.into(),
            kind: ContentKind::PlainText,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(id: impl Into<String>, content: impl Into<String>, kind: ContentKind) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            content: content.into(),
            kind,
            created_at: Utc::now(),
        }
    }
}

/// Frames sent FROM the client TO the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Free-text chat send, tagged with the active thread.
    Chat {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        id: String,
    },
    /// Structured UI-driven interaction. Field casing matches the backend's
    /// historical contract for this frame, which differs from `chat`.
    StructuredAction {
        prompt: serde_json::Value,
        #[serde(rename = "threadId", default, skip_serializing_if = "Option::is_none")]
        thread_id: Option<String>,
        #[serde(rename = "responseId")]
        response_id: String,
    },
    /// Sent once per fresh connection; skipped for thread-scoped endpoints.
    ClientConfig {
        #[serde(flatten)]
        config: serde_json::Value,
    },
}

/// Frames pushed FROM the server TO the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Server-issued session identifier; arrives asynchronously after the
    /// channel opens and gates media negotiation and thread-scoped sends.
    SessionEstablished { connection_id: String },
    /// Backend-side session state change (e.g. "disconnecting").
    SessionState {
        state: String,
        #[serde(default)]
        message: Option<String>,
    },
    /// Complete assistant message.
    AssistantResponse {
        id: String,
        content: String,
        #[serde(rename = "contentType", default)]
        content_type: Option<ContentKind>,
    },
    /// Complete user message echoed by the backend (e.g. cross-device sync).
    UserResponse {
        id: String,
        content: String,
        #[serde(rename = "contentType", default)]
        content_type: Option<ContentKind>,
    },
    /// Partial markup token for the stream tagged by `id`.
    TokenChunk { id: String, content: String },
    /// Partial generative-UI token for the stream tagged by `id`.
    UiTokenChunk { id: String, content: String },
    /// End-of-stream marker for `id`.
    StreamDone { id: String },
    /// Informational: the backend started an enhancement pass.
    EnhancementStarted,
    /// Explicit backend error. Does not by itself close the channel.
    Error { message: String },
}

impl ServerFrame {
    /// Parse one inbound text payload.
    ///
    /// Malformed JSON and unrecognized `type` tags return `None` after a
    /// warn log; one bad frame must never crash the channel.
    pub fn parse(raw: &str) -> Option<Self> {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "malformed inbound frame, dropping");
                return None;
            }
        };

        let frame_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("<missing>")
            .to_string();

        match serde_json::from_value::<ServerFrame>(value) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(
                    frame_type = %frame_type,
                    error = %e,
                    "unknown or malformed inbound frame type, dropping"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chat_frame_wire_shape() {
        let frame = ClientFrame::Chat {
            message: "hi".into(),
            thread_id: Some("t1".into()),
            id: "m-42".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type": "chat", "message": "hi", "thread_id": "t1", "id": "m-42"})
        );
    }

    #[test]
    fn chat_frame_omits_missing_thread() {
        let frame = ClientFrame::Chat {
            message: "hi".into(),
            thread_id: None,
            id: "m-1".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert!(value.get("thread_id").is_none());
    }

    #[test]
    fn structured_action_uses_camel_case_fields() {
        let frame = ClientFrame::StructuredAction {
            prompt: json!({"action": "pick", "option": 2}),
            thread_id: Some("t1".into()),
            response_id: "r-7".into(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "structured-action");
        assert_eq!(value["threadId"], "t1");
        assert_eq!(value["responseId"], "r-7");
        assert_eq!(value["prompt"]["action"], "pick");
    }

    #[test]
    fn session_established_parses() {
        let frame =
            ServerFrame::parse(r#"{"type":"session-established","connection_id":"abc"}"#).unwrap();
        match frame {
            ServerFrame::SessionEstablished { connection_id } => {
                assert_eq!(connection_id, "abc");
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn token_chunk_variants_parse() {
        let markup = ServerFrame::parse(r#"{"type":"token-chunk","id":"m1","content":"He"}"#);
        assert!(matches!(markup, Some(ServerFrame::TokenChunk { .. })));
        let ui = ServerFrame::parse(r#"{"type":"ui-token-chunk","id":"m1","content":"<c"}"#);
        assert!(matches!(ui, Some(ServerFrame::UiTokenChunk { .. })));
    }

    #[test]
    fn response_content_type_is_optional() {
        let frame = ServerFrame::parse(
            r#"{"type":"assistant-response","id":"m1","content":"done","contentType":"markup"}"#,
        )
        .unwrap();
        match frame {
            ServerFrame::AssistantResponse { content_type, .. } => {
                assert_eq!(content_type, Some(ContentKind::Markup));
            }
            other => panic!("wrong frame: {other:?}"),
        }

        let bare =
            ServerFrame::parse(r#"{"type":"assistant-response","id":"m1","content":"done"}"#)
                .unwrap();
        match bare {
            ServerFrame::AssistantResponse { content_type, .. } => {
                assert_eq!(content_type, None);
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_frame_type_is_dropped() {
        assert!(ServerFrame::parse(r#"{"type":"hologram-v2","payload":{}}"#).is_none());
    }

    #[test]
    fn malformed_json_is_dropped() {
        assert!(ServerFrame::parse("{not json").is_none());
        assert!(ServerFrame::parse(r#"{"no_type_field":1}"#).is_none());
    }
}
