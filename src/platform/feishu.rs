use super::traits::{Delivery, MessageTarget, Messenger, SendMessage};
use crate::config::FeishuConfig;
use crate::error::PlatformError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Tokens are refreshed this long before the platform says they expire.
pub const TOKEN_REFRESH_MARGIN_SECS: u64 = 300;
const DEFAULT_TOKEN_TTL_SECS: u64 = 7200;
const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    code: i64,
    #[serde(default)]
    msg: String,
    tenant_access_token: Option<String>,
    expire: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Option<MessageData>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageData {
    message_id: Option<String>,
    thread_id: Option<String>,
}

/// Feishu open-platform client for tenant-scoped bot messages.
pub struct FeishuClient {
    client: reqwest::Client,
    api_base: String,
    app_id: String,
    app_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl FeishuClient {
    pub fn new(config: &FeishuConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: config.api_base.trim().trim_end_matches('/').to_string(),
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
            token: Mutex::new(None),
        }
    }

    /// Cached tenant access token, fetched again once inside the refresh margin.
    pub async fn tenant_access_token(&self) -> Result<String, PlatformError> {
        if let Some(cached) = self.token.lock().as_ref() {
            if Instant::now() < cached.refresh_at {
                return Ok(cached.value.clone());
            }
        }

        let url = format!("{}/auth/v3/tenant_access_token/internal", self.api_base);
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({
                "app_id": self.app_id,
                "app_secret": self.app_secret,
            }))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| PlatformError::Decode(e.to_string()))?;

        let token = match (body.code, body.tenant_access_token) {
            (0, Some(token)) if !token.is_empty() => token,
            (code, _) => {
                tracing::error!(code, msg = %body.msg, "Tenant access token request rejected");
                return Err(PlatformError::Token(format!("code {code}: {}", body.msg)));
            }
        };

        let ttl = body
            .expire
            .unwrap_or(DEFAULT_TOKEN_TTL_SECS)
            .saturating_sub(TOKEN_REFRESH_MARGIN_SECS);
        *self.token.lock() = Some(CachedToken {
            value: token.clone(),
            refresh_at: Instant::now() + Duration::from_secs(ttl),
        });
        tracing::info!("Obtained tenant access token");
        Ok(token)
    }

    async fn post_message(
        &self,
        request: reqwest::RequestBuilder,
        body: serde_json::Value,
    ) -> Result<Delivery, PlatformError> {
        let token = self.tenant_access_token().await?;
        let response = request
            .bearer_auth(token)
            .json(&body)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .send()
            .await?;
        let envelope: ApiEnvelope = response
            .json()
            .await
            .map_err(|e| PlatformError::Decode(e.to_string()))?;

        if envelope.code != 0 {
            return Err(PlatformError::Api {
                code: envelope.code,
                msg: envelope.msg,
            });
        }

        let data = envelope.data.unwrap_or_default();
        Ok(Delivery {
            message_id: data.message_id,
            thread_id: data.thread_id,
        })
    }
}

#[async_trait]
impl Messenger for FeishuClient {
    fn name(&self) -> &str {
        "feishu"
    }

    async fn send(&self, message: &SendMessage) -> Result<Delivery, PlatformError> {
        let mut body = serde_json::json!({
            "msg_type": message.msg_type(),
            "content": message.content(),
        });

        let result = match &message.target {
            MessageTarget::Chat { chat_id, root_id } => {
                body["receive_id"] = serde_json::Value::String(chat_id.clone());
                if let Some(root_id) = root_id {
                    body["root_id"] = serde_json::Value::String(root_id.clone());
                }
                let url = format!("{}/im/v1/messages", self.api_base);
                let request = self
                    .client
                    .post(url)
                    .query(&[("receive_id_type", "chat_id")]);
                self.post_message(request, body).await
            }
            MessageTarget::Reply {
                message_id,
                in_thread,
            } => {
                if *in_thread {
                    body["reply_in_thread"] = serde_json::Value::Bool(true);
                }
                let url = format!("{}/im/v1/messages/{message_id}/reply", self.api_base);
                self.post_message(self.client.post(url), body).await
            }
        };

        match &result {
            Ok(delivery) => tracing::info!(
                msg_type = message.msg_type(),
                message_id = delivery.message_id.as_deref().unwrap_or(""),
                "Message delivered"
            ),
            Err(err) => tracing::error!(msg_type = message.msg_type(), "Message delivery failed: {err}"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_token(server: &MockServer, expect: u64) {
        Mock::given(method("POST"))
            .and(path("/auth/v3/tenant_access_token/internal"))
            .and(body_partial_json(json!({"app_id": "cli_test", "app_secret": "s3cret"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "msg": "ok",
                "tenant_access_token": "t-abc",
                "expire": 7200
            })))
            .expect(expect)
            .mount(server)
            .await;
    }

    fn client_for(server: &MockServer) -> FeishuClient {
        FeishuClient::new(&FeishuConfig {
            app_id: "cli_test".into(),
            app_secret: "s3cret".into(),
            api_base: server.uri(),
            ..FeishuConfig::default()
        })
    }

    #[tokio::test]
    async fn token_is_cached_across_sends() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/im/v1/messages"))
            .and(query_param("receive_id_type", "chat_id"))
            .and(header("authorization", "Bearer t-abc"))
            .and(body_partial_json(json!({
                "receive_id": "oc_1",
                "msg_type": "text",
                "content": "{\"text\":\"hi\"}"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"message_id": "om_1"}
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let first = client.send(&SendMessage::text("oc_1", "hi")).await.unwrap();
        let second = client.send(&SendMessage::text("oc_1", "hi")).await.unwrap();
        assert_eq!(first.message_id.as_deref(), Some("om_1"));
        assert_eq!(second.thread_id, None);
    }

    #[tokio::test]
    async fn thread_reply_returns_thread_id() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/im/v1/messages/om_origin/reply"))
            .and(body_partial_json(json!({
                "msg_type": "interactive",
                "reply_in_thread": true
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 0,
                "data": {"message_id": "om_2", "thread_id": "omt_9"}
            })))
            .mount(&server)
            .await;

        let delivery = client_for(&server)
            .send(&SendMessage::thread_opening_reply("om_origin", json!({"elements": []})))
            .await
            .unwrap();
        assert_eq!(delivery.thread_id.as_deref(), Some("omt_9"));
    }

    #[tokio::test]
    async fn root_id_is_forwarded_for_thread_posts() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/im/v1/messages"))
            .and(body_partial_json(json!({"root_id": "omt_9"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0})))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .send(&SendMessage::card_in_thread("oc_1", "omt_9", json!({})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nonzero_code_is_api_error() {
        let server = MockServer::start().await;
        mount_token(&server, 1).await;
        Mock::given(method("POST"))
            .and(path("/im/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 230002,
                "msg": "bot not in chat"
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .send(&SendMessage::text("oc_1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Api { code: 230002, .. }));
    }

    #[tokio::test]
    async fn rejected_token_request_fails_send() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v3/tenant_access_token/internal"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 10003,
                "msg": "invalid app_secret"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/im/v1/messages"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let err = client_for(&server)
            .send(&SendMessage::text("oc_1", "hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlatformError::Token(_)));
    }
}
