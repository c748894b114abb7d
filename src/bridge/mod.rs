//! Bridge to an agent gateway whose HTTP API shape is not known in advance.
//!
//! The bridge walks an ordered table of protocol guesses. Each strategy owns
//! one or more endpoints and one or more payload shapes; candidates are tried
//! endpoint-major in declaration order and the first 200/201 answer wins.
//! Failures of a single candidate are never retried.

pub mod extract;
pub mod prober;

use crate::config::AgentGatewayConfig;
use crate::util::truncate_with_ellipsis;
use prober::{EndpointProber, ProbeOutcome};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Timeout for status-endpoint probes, independent of message dispatch.
pub const HEALTH_TIMEOUT_SECS: u64 = 5;

/// Status endpoints probed by [`GatewayBridge::health_check`], in order.
pub const HEALTH_ENDPOINTS: &[&str] = &["/health", "/status", "/api/health", "/api/status", "/"];

/// Channel name reported to the gateway in every payload.
const CHANNEL: &str = "feishu";

/// Returned to the user when every candidate failed.
pub const UNAVAILABLE_MESSAGE: &str = "⚠️ 智能体网关暂时不可用\n\n\
请检查：\n\
1. 网关服务是否运行\n\
2. 网关地址是否正确\n\
3. 网络连接是否正常\n\n\
管理员请查看服务器日志获取详细信息。";

/// Payload family a strategy speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolFamily {
    /// JSON-RPC envelope with a method name and structured params.
    StructuredCall,
    /// Replays the inbound chat-platform event schema.
    EventReplay,
    /// Plain message objects, simplest schema first.
    GenericMessage,
    /// Chat-completion shaped `messages` array.
    CompletionStyle,
}

/// One named protocol guess: endpoints to try with this family's payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayStrategy {
    pub name: &'static str,
    pub family: ProtocolFamily,
    pub endpoints: Vec<String>,
}

impl GatewayStrategy {
    pub fn new(name: &'static str, family: ProtocolFamily, endpoints: &[&str]) -> Self {
        Self {
            name,
            family,
            endpoints: endpoints.iter().map(|e| (*e).to_string()).collect(),
        }
    }
}

/// The built-in strategy table, in the order it is tried.
pub fn default_strategies() -> Vec<GatewayStrategy> {
    vec![
        GatewayStrategy::new("structured-call", ProtocolFamily::StructuredCall, &["/rpc"]),
        GatewayStrategy::new(
            "event-replay",
            ProtocolFamily::EventReplay,
            &["/webhook", "/api/webhook", "/webhooks"],
        ),
        GatewayStrategy::new(
            "generic-message",
            ProtocolFamily::GenericMessage,
            &["/api/messages", "/messages", "/api/message"],
        ),
        GatewayStrategy::new(
            "completion-style",
            ProtocolFamily::CompletionStyle,
            &["/api/chat", "/chat", "/v1/chat/completions"],
        ),
    ]
}

/// A message to hand to the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeRequest {
    pub text: String,
    pub sender_id: String,
    pub sender_name: String,
    pub chat_id: String,
    pub message_id: String,
}

impl ProtocolFamily {
    /// Payload shapes for this family, labelled for logging, in try order.
    fn payloads(self, req: &BridgeRequest, agent_id: &str) -> Vec<(&'static str, Value)> {
        match self {
            Self::StructuredCall => vec![(
                "json-rpc",
                json!({
                    "jsonrpc": "2.0",
                    "method": "processMessage",
                    "params": {
                        "message": req.text,
                        "userId": req.sender_id,
                        "userName": req.sender_name,
                        "chatId": req.chat_id,
                        "messageId": req.message_id,
                        "channel": CHANNEL,
                        "agentId": agent_id,
                    },
                    "id": 1,
                }),
            )],
            Self::EventReplay => {
                let content = json!({ "text": req.text }).to_string();
                vec![(
                    "im.message.receive_v1",
                    json!({
                        "schema": "2.0",
                        "header": {
                            "event_type": "im.message.receive_v1",
                            "event_id": req.message_id,
                        },
                        "event": {
                            "sender": {
                                "sender_id": {
                                    "open_id": req.sender_id,
                                    "user_id": req.sender_name,
                                }
                            },
                            "message": {
                                "message_id": req.message_id,
                                "chat_id": req.chat_id,
                                "chat_type": "p2p",
                                "content": content,
                            }
                        }
                    }),
                )]
            }
            Self::GenericMessage => vec![
                (
                    "message-user",
                    json!({ "message": req.text, "user": req.sender_id }),
                ),
                (
                    "text-user-channel",
                    json!({ "text": req.text, "user": req.sender_id, "channel": CHANNEL }),
                ),
                (
                    "message-full",
                    json!({
                        "message": req.text,
                        "userId": req.sender_id,
                        "userName": req.sender_name,
                        "chatId": req.chat_id,
                        "messageId": req.message_id,
                        "channel": CHANNEL,
                        "agentId": agent_id,
                    }),
                ),
            ],
            Self::CompletionStyle => vec![(
                "chat-messages",
                json!({
                    "messages": [{ "role": "user", "content": req.text }],
                    "user": req.sender_id,
                    "metadata": {
                        "userName": req.sender_name,
                        "chatId": req.chat_id,
                        "messageId": req.message_id,
                        "channel": CHANNEL,
                        "agentId": agent_id,
                    }
                }),
            )],
        }
    }
}

/// One probe, logged and dropped.
#[derive(Debug)]
struct DispatchAttempt<'a> {
    strategy_name: &'static str,
    endpoint_url: &'a str,
    payload_shape: &'static str,
    outcome: &'a ProbeOutcome,
    extracted_reply: Option<&'a str>,
}

impl DispatchAttempt<'_> {
    fn reply_preview(&self) -> Option<String> {
        self.extracted_reply
            .map(|reply| truncate_with_ellipsis(reply, 100))
    }

    fn log(&self) {
        match self.outcome {
            ProbeOutcome::Accepted { status, .. } => tracing::info!(
                strategy = self.strategy_name,
                endpoint = self.endpoint_url,
                payload = self.payload_shape,
                status,
                reply = %self.reply_preview().unwrap_or_default(),
                "Agent gateway accepted message"
            ),
            ProbeOutcome::Rejected { reason } => tracing::debug!(
                strategy = self.strategy_name,
                endpoint = self.endpoint_url,
                payload = self.payload_shape,
                %reason,
                "Agent gateway candidate failed"
            ),
        }
    }
}

/// Outcome of [`GatewayBridge::dispatch`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BridgeReply {
    pub success: bool,
    pub reply_text: String,
    pub raw: Option<Value>,
    pub strategy: Option<&'static str>,
    pub endpoint: Option<String>,
    pub error: Option<String>,
}

impl BridgeReply {
    fn unavailable() -> Self {
        Self {
            success: false,
            reply_text: UNAVAILABLE_MESSAGE.to_string(),
            raw: None,
            strategy: None,
            endpoint: None,
            error: Some("no agent gateway endpoint accepted the message".to_string()),
        }
    }
}

/// Outcome of [`GatewayBridge::health_check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub gateway_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GatewayBridge {
    base_url: String,
    agent_id: String,
    strategies: Vec<GatewayStrategy>,
    prober: EndpointProber,
    dispatch_timeout: Duration,
    health_timeout: Duration,
}

impl GatewayBridge {
    pub fn new(config: &AgentGatewayConfig) -> Self {
        let base_url = config.gateway_url.trim().trim_end_matches('/').to_string();
        tracing::info!("Agent gateway bridge targets {base_url}");
        Self {
            base_url,
            agent_id: config.agent_id.clone(),
            strategies: default_strategies(),
            prober: EndpointProber::new(Some(config.token.clone())),
            dispatch_timeout: Duration::from_secs(config.timeout_secs.max(1)),
            health_timeout: Duration::from_secs(HEALTH_TIMEOUT_SECS),
        }
    }

    /// Replace the strategy table.
    pub fn with_strategies(mut self, strategies: Vec<GatewayStrategy>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn with_timeouts(mut self, dispatch: Duration, health: Duration) -> Self {
        self.dispatch_timeout = dispatch;
        self.health_timeout = health;
        self
    }

    pub fn gateway_url(&self) -> &str {
        &self.base_url
    }

    pub fn strategies(&self) -> &[GatewayStrategy] {
        &self.strategies
    }

    /// Deliver a message, trying every candidate until one is accepted.
    ///
    /// Never fails: when nothing accepts the message the reply carries
    /// [`UNAVAILABLE_MESSAGE`] and `success == false`.
    pub async fn dispatch(&self, request: &BridgeRequest) -> BridgeReply {
        tracing::info!(
            sender = %request.sender_name,
            "Forwarding message to agent gateway: {}",
            truncate_with_ellipsis(&request.text, 50)
        );

        for strategy in &self.strategies {
            let payloads = strategy.family.payloads(request, &self.agent_id);
            for endpoint in &strategy.endpoints {
                let url = format!("{}{}", self.base_url, endpoint);
                for (shape, payload) in &payloads {
                    let outcome = self.prober.post(&url, payload, self.dispatch_timeout).await;
                    let extracted = match &outcome {
                        ProbeOutcome::Accepted { body, .. } => Some(extract::extract_reply(body)),
                        ProbeOutcome::Rejected { .. } => None,
                    };
                    DispatchAttempt {
                        strategy_name: strategy.name,
                        endpoint_url: &url,
                        payload_shape: *shape,
                        outcome: &outcome,
                        extracted_reply: extracted.as_ref().map(|(text, _)| text.as_str()),
                    }
                    .log();

                    if let Some((reply_text, raw)) = extracted {
                        return BridgeReply {
                            success: true,
                            reply_text,
                            raw: Some(raw),
                            strategy: Some(strategy.name),
                            endpoint: Some(endpoint.clone()),
                            error: None,
                        };
                    }
                }
            }
        }

        tracing::warn!("Every agent gateway strategy failed");
        BridgeReply::unavailable()
    }

    /// Probe the status endpoints with the short health timeout.
    pub async fn health_check(&self) -> HealthReport {
        for endpoint in HEALTH_ENDPOINTS {
            let url = format!("{}{}", self.base_url, endpoint);
            if let ProbeOutcome::Accepted { status, .. } =
                self.prober.get(&url, self.health_timeout).await
            {
                tracing::info!("Agent gateway health check passed via {endpoint}");
                return HealthReport {
                    healthy: true,
                    gateway_url: self.base_url.clone(),
                    endpoint: Some((*endpoint).to_string()),
                    status_code: Some(status),
                    error: None,
                };
            }
        }

        HealthReport {
            healthy: false,
            gateway_url: self.base_url.clone(),
            endpoint: None,
            status_code: None,
            error: Some("no health endpoint reachable".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn accepted_attempt_keeps_a_truncated_reply() {
        let outcome = ProbeOutcome::Accepted {
            status: 200,
            body: String::new(),
        };
        let reply = "好".repeat(150);
        let attempt = DispatchAttempt {
            strategy_name: "webhook",
            endpoint_url: "http://gw/webhook",
            payload_shape: "message-user",
            outcome: &outcome,
            extracted_reply: Some(reply.as_str()),
        };
        let preview = attempt.reply_preview().unwrap();
        assert_eq!(preview.chars().count(), 103);
        assert!(preview.ends_with("..."));

        let rejected = ProbeOutcome::Rejected {
            reason: "HTTP 404".into(),
        };
        let attempt = DispatchAttempt {
            outcome: &rejected,
            extracted_reply: None,
            ..attempt
        };
        assert_eq!(attempt.reply_preview(), None);
    }

    fn bridge_for(server: &MockServer) -> GatewayBridge {
        let config = AgentGatewayConfig {
            gateway_url: format!("{}/", server.uri()),
            token: "gw-token".into(),
            ..AgentGatewayConfig::default()
        };
        GatewayBridge::new(&config)
            .with_timeouts(Duration::from_millis(300), Duration::from_millis(300))
    }

    fn request() -> BridgeRequest {
        BridgeRequest {
            text: "hello".into(),
            sender_id: "ou_user".into(),
            sender_name: "Alice".into(),
            chat_id: "oc_chat".into(),
            message_id: "om_msg".into(),
        }
    }

    async fn requested_paths(server: &MockServer) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .map(|r| r.url.path().to_string())
            .collect()
    }

    #[test]
    fn default_table_order_is_fixed() {
        let names: Vec<_> = default_strategies().iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            ["structured-call", "event-replay", "generic-message", "completion-style"]
        );
    }

    #[test]
    fn generic_message_offers_simplest_schema_first() {
        let shapes = ProtocolFamily::GenericMessage.payloads(&request(), "main");
        assert_eq!(shapes.len(), 3);
        assert_eq!(shapes[0].1, json!({"message": "hello", "user": "ou_user"}));
        assert_eq!(shapes[2].1["agentId"], "main");
    }

    #[test]
    fn event_replay_embeds_text_as_json_string() {
        let shapes = ProtocolFamily::EventReplay.payloads(&request(), "main");
        let content = shapes[0].1["event"]["message"]["content"].as_str().unwrap();
        assert_eq!(content, r#"{"text":"hello"}"#);
    }

    #[tokio::test]
    async fn stops_at_first_success_in_declared_order() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"reply": "pong"})))
            .expect(1)
            .mount(&server)
            .await;

        let reply = bridge_for(&server).dispatch(&request()).await;

        assert!(reply.success);
        assert_eq!(reply.reply_text, "pong");
        assert_eq!(reply.strategy, Some("event-replay"));
        assert_eq!(reply.endpoint.as_deref(), Some("/webhook"));
        assert_eq!(requested_paths(&server).await, ["/rpc", "/webhook"]);
    }

    #[tokio::test]
    async fn generic_message_probes_endpoints_times_payloads() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/message"))
            .and(body_partial_json(json!({"text": "hello"})))
            .respond_with(ResponseTemplate::new(201).set_body_string("done"))
            .mount(&server)
            .await;

        let reply = bridge_for(&server).dispatch(&request()).await;

        assert!(reply.success);
        assert_eq!(reply.reply_text, "done");
        let paths = requested_paths(&server).await;
        // rpc + 3 webhook + 3x3 generic (last one succeeds on 2nd shape)
        assert_eq!(paths.len(), 1 + 3 + 3 + 3 + 2);
        assert_eq!(paths.last().map(String::as_str), Some("/api/message"));
    }

    #[tokio::test]
    async fn all_failures_return_canned_message() {
        let server = MockServer::start().await;

        let reply = bridge_for(&server).dispatch(&request()).await;

        assert!(!reply.success);
        assert_eq!(reply.reply_text, UNAVAILABLE_MESSAGE);
        assert!(!reply.reply_text.is_empty());
        assert_eq!(requested_paths(&server).await.len(), 1 + 3 + 9 + 3);
    }

    #[tokio::test]
    async fn slow_candidate_is_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .respond_with(ResponseTemplate::new(200).set_body_string("fast"))
            .mount(&server)
            .await;

        let reply = bridge_for(&server).dispatch(&request()).await;
        assert_eq!(reply.endpoint.as_deref(), Some("/webhook"));
        assert_eq!(reply.reply_text, "fast");
    }

    #[tokio::test]
    async fn custom_strategy_table_is_respected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"choices": [{"message": {"content": "hi"}}]}),
            ))
            .mount(&server)
            .await;

        let bridge = bridge_for(&server).with_strategies(vec![GatewayStrategy::new(
            "completion-only",
            ProtocolFamily::CompletionStyle,
            &["/v1/chat/completions"],
        )]);
        let reply = bridge.dispatch(&request()).await;

        assert_eq!(reply.reply_text, "hi");
        assert_eq!(requested_paths(&server).await, ["/v1/chat/completions"]);
    }

    #[tokio::test]
    async fn health_check_returns_first_reachable_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let report = bridge_for(&server).health_check().await;
        assert!(report.healthy);
        assert_eq!(report.endpoint.as_deref(), Some("/status"));
        assert_eq!(report.status_code, Some(200));
        assert_eq!(requested_paths(&server).await, ["/health", "/status"]);
    }

    #[tokio::test]
    async fn health_check_reports_unreachable_gateway() {
        let server = MockServer::start().await;
        let report = bridge_for(&server).health_check().await;
        assert!(!report.healthy);
        assert!(report.error.is_some());
        assert_eq!(requested_paths(&server).await.len(), HEALTH_ENDPOINTS.len());
    }
}
