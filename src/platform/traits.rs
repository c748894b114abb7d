use crate::error::PlatformError;
use async_trait::async_trait;
use serde_json::Value;

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTarget {
    /// Post into a chat, optionally under an existing thread root.
    Chat {
        chat_id: String,
        root_id: Option<String>,
    },
    /// Reply to a specific message; `in_thread` asks the platform to open a
    /// thread anchored on it.
    Reply { message_id: String, in_thread: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Text(String),
    /// Interactive card JSON.
    Card(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendMessage {
    pub target: MessageTarget,
    pub body: MessageBody,
}

impl SendMessage {
    pub fn text(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            target: MessageTarget::Chat {
                chat_id: chat_id.into(),
                root_id: None,
            },
            body: MessageBody::Text(text.into()),
        }
    }

    pub fn card(chat_id: impl Into<String>, card: Value) -> Self {
        Self {
            target: MessageTarget::Chat {
                chat_id: chat_id.into(),
                root_id: None,
            },
            body: MessageBody::Card(card),
        }
    }

    pub fn card_in_thread(chat_id: impl Into<String>, root_id: impl Into<String>, card: Value) -> Self {
        Self {
            target: MessageTarget::Chat {
                chat_id: chat_id.into(),
                root_id: Some(root_id.into()),
            },
            body: MessageBody::Card(card),
        }
    }

    /// Card reply that opens a thread on `message_id`.
    pub fn thread_opening_reply(message_id: impl Into<String>, card: Value) -> Self {
        Self {
            target: MessageTarget::Reply {
                message_id: message_id.into(),
                in_thread: true,
            },
            body: MessageBody::Card(card),
        }
    }

    pub fn msg_type(&self) -> &'static str {
        match self.body {
            MessageBody::Text(_) => "text",
            MessageBody::Card(_) => "interactive",
        }
    }

    /// Platform `content` field: a JSON-encoded string for both kinds.
    pub fn content(&self) -> String {
        match &self.body {
            MessageBody::Text(text) => serde_json::json!({ "text": text }).to_string(),
            MessageBody::Card(card) => card.to_string(),
        }
    }

    pub fn is_card(&self) -> bool {
        matches!(self.body, MessageBody::Card(_))
    }
}

/// What the platform reported back for a delivered message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: Option<String>,
    /// Present when the message opened (or landed in) a thread.
    pub thread_id: Option<String>,
}

/// Outbound side of the chat platform.
#[async_trait]
pub trait Messenger: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &SendMessage) -> Result<Delivery, PlatformError>;
}
