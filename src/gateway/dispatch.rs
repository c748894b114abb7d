//! Event routing: private chats go to the agent gateway, group chats are
//! classified and handed to the task runner.

use crate::bridge::{BridgeRequest, GatewayBridge};
use crate::classifier::{classify, TaskKind};
use crate::platform::{Messenger, SendMessage};
use crate::security::RateLimiter;
use crate::tasks::{Requester, Task, TaskRunner, TaskSpawner};
use crate::util::truncate_with_ellipsis;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const MESSAGE_RECEIVE_EVENT: &str = "im.message.receive_v1";
/// Placeholder the platform substitutes for the bot mention in group text.
pub const MENTION_PLACEHOLDER: &str = "@_user_1";
pub const PRIVATE_NOTICE_TEXT: &str = "⏳ 正在处理，请稍候...";
pub const GATEWAY_DISABLED_TEXT: &str = "❌ 智能体网关暂时不可用，请稍后重试";
const DEFAULT_SENDER_NAME: &str = "用户";

/// Body returned to the platform for an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventResponse {
    Challenge { challenge: Value },
    Ack { code: i64, msg: String },
}

impl EventResponse {
    pub fn ack(msg: impl Into<String>) -> Self {
        Self::Ack {
            code: 0,
            msg: msg.into(),
        }
    }

    pub fn reject(msg: impl Into<String>) -> Self {
        Self::Ack {
            code: -1,
            msg: msg.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Ack { code, .. } if *code != 0)
    }
}

// Every field is optional: the platform sends explicit nulls for ids the
// bot lacks scope to read.
#[derive(Debug, Default, Deserialize)]
struct RawEvent {
    event: Option<RawEventBody>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEventBody {
    message: Option<RawMessage>,
    sender: Option<RawSender>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMessage {
    chat_id: Option<String>,
    chat_type: Option<String>,
    message_id: Option<String>,
    message_type: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSender {
    sender_id: Option<RawSenderId>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSenderId {
    open_id: Option<String>,
    user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatType {
    Private,
    Group,
}

/// The fields of a message event the bot acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub text: String,
    pub chat_id: String,
    pub chat_type: Option<ChatType>,
    pub message_id: String,
    pub sender_open_id: String,
    pub sender_name: String,
    pub is_text: bool,
}

impl InboundMessage {
    /// Extract from an `im.message.receive_v1` payload. `content` is itself a
    /// JSON-encoded string.
    pub fn from_event(event: &Value) -> Result<Self, String> {
        let raw = RawEvent::deserialize(event).map_err(|e| format!("Invalid event: {e}"))?;
        let body = raw.event.unwrap_or_default();
        let message = body.message.unwrap_or_default();
        let sender = body
            .sender
            .and_then(|s| s.sender_id)
            .unwrap_or_default();
        let content = message.content.unwrap_or_default();

        let is_text = message.message_type.as_deref().map_or(true, |t| t == "text");
        let text = if is_text {
            let content = if content.trim().is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str::<Value>(&content)
                    .map_err(|e| format!("Invalid message content: {e}"))?
            };
            content
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        } else {
            String::new()
        };

        let chat_type = match message.chat_type.as_deref().unwrap_or_default() {
            "p2p" => Some(ChatType::Private),
            "group" => Some(ChatType::Group),
            _ => None,
        };

        Ok(Self {
            text,
            chat_id: message.chat_id.unwrap_or_default(),
            chat_type,
            message_id: message.message_id.unwrap_or_default(),
            sender_name: sender
                .user_id
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_SENDER_NAME.to_string()),
            sender_open_id: sender.open_id.unwrap_or_default(),
            is_text,
        })
    }
}

/// Remove the bot mention placeholder and surrounding whitespace.
pub fn strip_mention(text: &str) -> String {
    text.replace(MENTION_PLACEHOLDER, "").trim().to_string()
}

pub struct InboundDispatcher {
    bot_open_id: String,
    messenger: Arc<dyn Messenger>,
    bridge: Option<Arc<GatewayBridge>>,
    runner: TaskRunner,
    rate_limiter: Arc<RateLimiter>,
    spawner: Arc<dyn TaskSpawner>,
}

impl InboundDispatcher {
    pub fn new(
        bot_open_id: impl Into<String>,
        messenger: Arc<dyn Messenger>,
        bridge: Option<Arc<GatewayBridge>>,
        runner: TaskRunner,
        rate_limiter: Arc<RateLimiter>,
        spawner: Arc<dyn TaskSpawner>,
    ) -> Self {
        Self {
            bot_open_id: bot_open_id.into(),
            messenger,
            bridge,
            runner,
            rate_limiter,
            spawner,
        }
    }

    /// Route a verified event body. Never blocks on downstream work.
    pub fn dispatch(&self, event: &Value) -> EventResponse {
        if let Some(challenge) = event.get("challenge") {
            tracing::info!("Answering URL verification challenge");
            return EventResponse::Challenge {
                challenge: challenge.clone(),
            };
        }

        let event_type = event
            .pointer("/header/event_type")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if event_type != MESSAGE_RECEIVE_EVENT {
            tracing::info!(event_type, "Unhandled event type");
            return EventResponse::ack("Event ignored");
        }

        self.dispatch_message(event)
    }

    /// Handle an `im.message.receive_v1` payload.
    pub fn dispatch_message(&self, event: &Value) -> EventResponse {
        let message = match InboundMessage::from_event(event) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!("{err}");
                return EventResponse::reject(err);
            }
        };

        if !self.bot_open_id.is_empty() && message.sender_open_id == self.bot_open_id {
            tracing::debug!("Ignoring message sent by the bot itself");
            return EventResponse::ack("Ignored");
        }

        if !message.is_text {
            tracing::info!(chat_id = %message.chat_id, "Ignoring non-text message");
            return EventResponse::ack("Non-text message ignored");
        }

        let Some(chat_type) = message.chat_type else {
            tracing::warn!(chat_id = %message.chat_id, "Unknown chat type");
            return EventResponse::ack("Unknown chat type");
        };

        if !self.rate_limiter.allow(&message.sender_open_id) {
            return EventResponse::reject("Rate limit exceeded");
        }

        tracing::info!(
            chat_id = %message.chat_id,
            sender = %message.sender_name,
            "Received message: {}",
            truncate_with_ellipsis(&message.text, 100)
        );

        match chat_type {
            ChatType::Private => self.dispatch_private(message),
            ChatType::Group => self.dispatch_group(message),
        }
    }

    fn dispatch_private(&self, message: InboundMessage) -> EventResponse {
        let text = message.text.trim().to_string();
        if text.is_empty() {
            return EventResponse::ack("Empty message ignored");
        }

        let messenger = Arc::clone(&self.messenger);
        let Some(bridge) = self.bridge.clone() else {
            tracing::error!("Agent gateway bridge is disabled; cannot answer private chat");
            let notice = SendMessage::text(&message.chat_id, GATEWAY_DISABLED_TEXT);
            self.spawner.spawn_detached(
                "gateway-disabled-notice",
                Box::pin(async move {
                    if let Err(err) = messenger.send(&notice).await {
                        tracing::error!("Failed to send gateway notice: {err}");
                    }
                }),
            );
            return EventResponse::reject("Agent gateway not available");
        };

        let request = BridgeRequest {
            text,
            sender_id: message.sender_open_id,
            sender_name: message.sender_name,
            chat_id: message.chat_id,
            message_id: message.message_id,
        };
        self.spawner.spawn_detached(
            "private-chat",
            Box::pin(async move {
                let chat_id = request.chat_id.clone();
                if let Err(err) = messenger
                    .send(&SendMessage::text(&chat_id, PRIVATE_NOTICE_TEXT))
                    .await
                {
                    tracing::warn!("Failed to send processing notice: {err}");
                }

                let reply = bridge.dispatch(&request).await;
                if reply.success {
                    tracing::info!(strategy = reply.strategy.unwrap_or(""), "Agent gateway answered");
                } else {
                    tracing::error!("Agent gateway unavailable for private chat");
                }
                if let Err(err) = messenger
                    .send(&SendMessage::text(&chat_id, reply.reply_text))
                    .await
                {
                    tracing::error!("Failed to deliver agent reply: {err}");
                }
            }),
        );
        EventResponse::ack("Processing")
    }

    fn dispatch_group(&self, message: InboundMessage) -> EventResponse {
        let text = strip_mention(&message.text);
        if text.is_empty() {
            return EventResponse::ack("Empty message ignored");
        }

        let kind = classify(&text);
        match kind {
            TaskKind::Complex => tracing::info!("Complex task, opening a thread"),
            TaskKind::Simple => tracing::info!("Simple task, replying directly"),
        }

        let task = Task {
            description: text,
            requester: Requester {
                display_name: message.sender_name,
                stable_id: message.sender_open_id,
            },
            origin_chat: message.chat_id,
            origin_message: message.message_id,
            kind,
        };
        self.runner.spawn(task, self.spawner.as_ref());
        EventResponse::ack("Processing")
    }
}

/// Synthetic message event used by the diagnostics route.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulatedMessage {
    #[serde(default = "default_sim_message")]
    pub message: String,
    #[serde(default = "default_sim_chat_id")]
    pub chat_id: String,
    #[serde(default = "default_sim_chat_type")]
    pub chat_type: String,
    #[serde(default = "default_sim_message_id")]
    pub message_id: String,
    #[serde(default = "default_sim_user_id")]
    pub user_id: String,
    #[serde(default = "default_sim_user_name")]
    pub user_name: String,
}

fn default_sim_message() -> String {
    "测试消息".into()
}
fn default_sim_chat_id() -> String {
    "test_chat".into()
}
fn default_sim_chat_type() -> String {
    "p2p".into()
}
fn default_sim_message_id() -> String {
    format!("test_msg_{}", uuid::Uuid::new_v4().simple())
}
fn default_sim_user_id() -> String {
    "test_user".into()
}
fn default_sim_user_name() -> String {
    "测试用户".into()
}

impl SimulatedMessage {
    pub fn to_event(&self) -> Value {
        serde_json::json!({
            "header": { "event_type": MESSAGE_RECEIVE_EVENT },
            "event": {
                "message": {
                    "chat_id": self.chat_id,
                    "chat_type": self.chat_type,
                    "message_id": self.message_id,
                    "message_type": "text",
                    "content": serde_json::json!({ "text": self.message }).to_string(),
                },
                "sender": {
                    "sender_id": {
                        "open_id": self.user_id,
                        "user_id": self.user_name,
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentGatewayConfig;
    use crate::platform::{MessageBody, MessageTarget};
    use crate::stats::StatsCollector;
    use crate::tasks::testing::{CountingCompleter, JoiningSpawner, RecordingMessenger};
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        dispatcher: InboundDispatcher,
        messenger: Arc<RecordingMessenger>,
        completer: Arc<CountingCompleter>,
        spawner: Arc<JoiningSpawner>,
        stats: Arc<StatsCollector>,
    }

    fn harness(bridge: Option<GatewayBridge>, rate_limit: u32) -> Harness {
        let messenger = Arc::new(RecordingMessenger::with_thread("omt_1"));
        let completer = Arc::new(CountingCompleter::ok("分析完成"));
        let spawner = Arc::new(JoiningSpawner::default());
        let stats = Arc::new(StatsCollector::new());
        let runner = TaskRunner::new(messenger.clone(), completer.clone(), stats.clone());
        let dispatcher = InboundDispatcher::new(
            "ou_bot",
            messenger.clone(),
            bridge.map(Arc::new),
            runner,
            Arc::new(RateLimiter::per_minute(rate_limit)),
            spawner.clone(),
        );
        Harness {
            dispatcher,
            messenger,
            completer,
            spawner,
            stats,
        }
    }

    fn message_event(chat_type: &str, text: &str, sender: &str) -> Value {
        json!({
            "schema": "2.0",
            "header": { "event_type": MESSAGE_RECEIVE_EVENT },
            "event": {
                "message": {
                    "chat_id": "oc_chat",
                    "chat_type": chat_type,
                    "message_id": "om_origin",
                    "message_type": "text",
                    "content": json!({ "text": text }).to_string(),
                },
                "sender": { "sender_id": { "open_id": sender, "user_id": "alice" } }
            }
        })
    }

    fn texts(messages: &[SendMessage]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| match &m.body {
                MessageBody::Text(text) => Some(text.clone()),
                MessageBody::Card(_) => None,
            })
            .collect()
    }

    #[test]
    fn challenge_is_echoed_verbatim() {
        let h = harness(None, 0);
        let response = h.dispatcher.dispatch(&json!({"challenge": "abc123", "type": "url_verification"}));
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({"challenge": "abc123"})
        );
    }

    #[test]
    fn unknown_event_type_is_ignored() {
        let h = harness(None, 0);
        let response = h
            .dispatcher
            .dispatch(&json!({"header": {"event_type": "im.chat.member.bot.added_v1"}}));
        assert_eq!(response, EventResponse::ack("Event ignored"));
    }

    #[test]
    fn extracts_text_and_sender() {
        let message = InboundMessage::from_event(&message_event("group", "@_user_1 hi", "ou_x")).unwrap();
        assert_eq!(message.text, "@_user_1 hi");
        assert_eq!(message.chat_type, Some(ChatType::Group));
        assert_eq!(message.sender_open_id, "ou_x");
        assert_eq!(message.sender_name, "alice");
        assert_eq!(strip_mention(&message.text), "hi");
    }

    #[test]
    fn null_ids_fall_back_to_defaults() {
        let mut event = message_event("p2p", "你好", "ou_x");
        event["event"]["sender"]["sender_id"]["user_id"] = Value::Null;
        event["event"]["message"]["root_id"] = Value::Null;
        event["event"]["message"]["parent_id"] = Value::Null;
        let message = InboundMessage::from_event(&event).unwrap();
        assert_eq!(message.sender_name, "用户");
        assert_eq!(message.sender_open_id, "ou_x");
        assert_eq!(message.chat_type, Some(ChatType::Private));
        assert_eq!(message.text, "你好");
    }

    #[test]
    fn empty_user_id_uses_default_name() {
        let mut event = message_event("group", "hi", "ou_x");
        event["event"]["sender"]["sender_id"]["user_id"] = json!("");
        let message = InboundMessage::from_event(&event).unwrap();
        assert_eq!(message.sender_name, "用户");
    }

    #[test]
    fn malformed_content_is_rejected() {
        let h = harness(None, 0);
        let mut event = message_event("group", "x", "ou_x");
        event["event"]["message"]["content"] = json!("{not json");
        assert!(!h.dispatcher.dispatch(&event).is_ok());
    }

    #[tokio::test]
    async fn self_messages_are_dropped() {
        let h = harness(None, 0);
        let response = h.dispatcher.dispatch(&message_event("group", "分析数据", "ou_bot"));
        assert_eq!(response, EventResponse::ack("Ignored"));
        assert!(h.spawner.labels().is_empty());
    }

    #[tokio::test]
    async fn non_text_and_unknown_chat_types_are_acknowledged() {
        let h = harness(None, 0);
        let mut image = message_event("group", "", "ou_x");
        image["event"]["message"]["message_type"] = json!("image");
        image["event"]["message"]["content"] = json!("{\"image_key\":\"img_1\"}");
        assert_eq!(h.dispatcher.dispatch(&image), EventResponse::ack("Non-text message ignored"));

        let topic = message_event("topic_group", "hi", "ou_x");
        assert_eq!(h.dispatcher.dispatch(&topic), EventResponse::ack("Unknown chat type"));
        assert!(h.spawner.labels().is_empty());
    }

    #[tokio::test]
    async fn mention_only_group_message_is_ignored() {
        let h = harness(None, 0);
        let response = h.dispatcher.dispatch(&message_event("group", " @_user_1 ", "ou_x"));
        assert_eq!(response, EventResponse::ack("Empty message ignored"));
        assert!(h.spawner.labels().is_empty());
    }

    #[tokio::test]
    async fn group_analysis_request_runs_threaded_flow() {
        let h = harness(None, 0);
        let response = h.dispatcher.dispatch(&message_event(
            "group",
            "@_user_1 帮我分析一下这份数据并生成报表",
            "ou_x",
        ));
        assert_eq!(response, EventResponse::ack("Processing"));
        assert_eq!(h.spawner.labels(), ["complex-task"]);
        h.spawner.join_all().await;

        let sent = h.messenger.sent();
        assert_eq!(sent.len(), 3);
        assert!(matches!(
            sent[0].target,
            MessageTarget::Reply { in_thread: true, .. }
        ));
        assert_eq!(
            sent[2].target,
            MessageTarget::Chat {
                chat_id: "oc_chat".into(),
                root_id: Some("omt_1".into())
            }
        );
        let MessageBody::Card(card) = &sent[2].body else {
            panic!("expected a card");
        };
        assert_eq!(card["header"]["template"], "green");
        assert_eq!(h.completer.calls(), 1);
        assert_eq!(h.stats.snapshot().tasks_processed, 1);
    }

    #[tokio::test]
    async fn short_group_question_is_simple() {
        let h = harness(None, 0);
        h.dispatcher.dispatch(&message_event("group", "@_user_1 你好", "ou_x"));
        assert_eq!(h.spawner.labels(), ["simple-task"]);
        h.spawner.join_all().await;
        assert_eq!(h.messenger.sent().len(), 1);
    }

    #[tokio::test]
    async fn private_message_goes_to_bridge_not_completer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"reply": "来自智能体"})))
            .expect(1)
            .mount(&server)
            .await;
        let bridge = GatewayBridge::new(&AgentGatewayConfig {
            gateway_url: server.uri(),
            ..AgentGatewayConfig::default()
        })
        .with_timeouts(Duration::from_millis(500), Duration::from_millis(500));

        let h = harness(Some(bridge), 0);
        let response = h.dispatcher.dispatch(&message_event("p2p", "你好", "ou_x"));
        assert_eq!(response, EventResponse::ack("Processing"));
        assert_eq!(h.spawner.labels(), ["private-chat"]);
        h.spawner.join_all().await;

        assert_eq!(texts(&h.messenger.sent()), [PRIVATE_NOTICE_TEXT, "来自智能体"]);
        assert_eq!(h.completer.calls(), 0);
    }

    #[tokio::test]
    async fn unreachable_gateway_sends_canned_message() {
        let server = MockServer::start().await;
        let bridge = GatewayBridge::new(&AgentGatewayConfig {
            gateway_url: server.uri(),
            ..AgentGatewayConfig::default()
        })
        .with_timeouts(Duration::from_millis(200), Duration::from_millis(200));

        let h = harness(Some(bridge), 0);
        h.dispatcher.dispatch(&message_event("p2p", "你好", "ou_x"));
        h.spawner.join_all().await;

        let sent = texts(&h.messenger.sent());
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1], crate::bridge::UNAVAILABLE_MESSAGE);
        assert_eq!(h.completer.calls(), 0);
    }

    #[tokio::test]
    async fn disabled_bridge_rejects_private_chat() {
        let h = harness(None, 0);
        let response = h.dispatcher.dispatch(&message_event("p2p", "你好", "ou_x"));
        assert_eq!(response, EventResponse::reject("Agent gateway not available"));
        h.spawner.join_all().await;
        assert_eq!(texts(&h.messenger.sent()), [GATEWAY_DISABLED_TEXT]);
        assert_eq!(h.completer.calls(), 0);
    }

    #[tokio::test]
    async fn senders_over_the_limit_are_rejected() {
        let h = harness(None, 2);
        for _ in 0..2 {
            assert!(h.dispatcher.dispatch(&message_event("group", "你好", "ou_x")).is_ok());
        }
        assert_eq!(
            h.dispatcher.dispatch(&message_event("group", "你好", "ou_x")),
            EventResponse::reject("Rate limit exceeded")
        );
        assert!(h.dispatcher.dispatch(&message_event("group", "你好", "ou_y")).is_ok());
        h.spawner.join_all().await;
    }

    #[test]
    fn simulated_message_builds_receive_event() {
        let simulated: SimulatedMessage =
            serde_json::from_value(json!({"message": "hi", "chat_type": "group"})).unwrap();
        let event = simulated.to_event();
        let message = InboundMessage::from_event(&event).unwrap();
        assert_eq!(message.text, "hi");
        assert_eq!(message.chat_type, Some(ChatType::Group));
        assert_eq!(message.chat_id, "test_chat");
        assert_eq!(message.sender_name, "测试用户");
    }
}
