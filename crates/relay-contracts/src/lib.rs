use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header carrying the base64 HMAC-SHA256 of the raw webhook body.
pub const SIGNATURE_HEADER: &str = "x-line-signature";

/// Upper bound the reply API accepts for a single text message, in characters.
pub const MAX_TEXT_LENGTH: usize = 5000;

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackRequest {
    #[serde(default)]
    pub destination: String,
    pub events: Vec<Event>,
}

/// One webhook notification. Everything other than a message event is
/// accepted on the wire and then ignored by the relay.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Message(MessageEvent),
    #[serde(other)]
    Unsupported,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Message(_) => "message",
            Event::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    #[serde(default)]
    pub reply_token: Option<String>,
    pub source: Source,
    pub message: MessageContent,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub webhook_event_id: String,
}

impl MessageEvent {
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Source {
    User {
        user_id: String,
    },
    Group {
        group_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    Room {
        room_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

impl Source {
    pub fn kind(&self) -> &'static str {
        match self {
            Source::User { .. } => "user",
            Source::Group { .. } => "group",
            Source::Room { .. } => "room",
            Source::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MessageContent {
    Text(TextMessageContent),
    #[serde(other)]
    Unsupported,
}

impl MessageContent {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageContent::Text(_) => "text",
            MessageContent::Unsupported => "unsupported",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMessageContent {
    #[serde(default)]
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub quote_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplyMessageRequest {
    pub reply_token: String,
    pub messages: Vec<OutgoingMessage>,
}

impl ReplyMessageRequest {
    /// Single text reply. Text longer than [`MAX_TEXT_LENGTH`] is cut at a
    /// character boundary.
    pub fn text(reply_token: &str, text: &str, quote_token: Option<&str>) -> Self {
        let text = match text.char_indices().nth(MAX_TEXT_LENGTH) {
            Some((idx, _)) => text[..idx].to_string(),
            None => text.to_string(),
        };
        Self {
            reply_token: reply_token.to_string(),
            messages: vec![OutgoingMessage::Text {
                text,
                quote_token: quote_token.map(|v| v.to_string()),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutgoingMessage {
    Text {
        text: String,
        #[serde(rename = "quoteToken", skip_serializing_if = "Option::is_none")]
        quote_token: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

impl ErrorResponse {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code: code.to_string(),
                message: message.into(),
                details: None,
            },
        }
    }
}
