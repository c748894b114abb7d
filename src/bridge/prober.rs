use serde_json::Value;
use std::time::Duration;

const USER_AGENT: &str = concat!("feishu-taskbot/", env!("CARGO_PKG_VERSION"));

/// Result of one HTTP call against one candidate endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The endpoint answered 200 or 201.
    Accepted { status: u16, body: String },
    /// Network error, timeout or any other status.
    Rejected { reason: String },
}

impl ProbeOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Issues single, unretried HTTP calls to candidate gateway endpoints.
#[derive(Debug, Clone)]
pub struct EndpointProber {
    client: reqwest::Client,
    token: Option<String>,
}

impl EndpointProber {
    pub fn new(token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        }
    }

    fn authed(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(reqwest::header::USER_AGENT, USER_AGENT);
        match self.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub async fn post(&self, url: &str, payload: &Value, timeout: Duration) -> ProbeOutcome {
        let request = self.authed(self.client.post(url)).json(payload).timeout(timeout);
        Self::finish(request).await
    }

    pub async fn get(&self, url: &str, timeout: Duration) -> ProbeOutcome {
        let request = self.authed(self.client.get(url)).timeout(timeout);
        Self::finish(request).await
    }

    async fn finish(request: reqwest::RequestBuilder) -> ProbeOutcome {
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                let reason = if err.is_timeout() {
                    "timed out".to_string()
                } else {
                    err.to_string()
                };
                return ProbeOutcome::Rejected { reason };
            }
        };

        let status = response.status().as_u16();
        if status != 200 && status != 201 {
            return ProbeOutcome::Rejected {
                reason: format!("status {status}"),
            };
        }

        match response.text().await {
            Ok(body) => ProbeOutcome::Accepted { status, body },
            Err(err) => ProbeOutcome::Rejected {
                reason: format!("body read failed: {err}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn accepts_only_200_and_201() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(201).set_body_string("made"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/accepted"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&server)
            .await;

        let prober = EndpointProber::new(None);
        let timeout = Duration::from_secs(5);
        let ok = prober
            .post(&format!("{}/ok", server.uri()), &serde_json::json!({}), timeout)
            .await;
        assert_eq!(
            ok,
            ProbeOutcome::Accepted {
                status: 201,
                body: "made".into()
            }
        );

        let accepted = prober
            .post(&format!("{}/accepted", server.uri()), &serde_json::json!({}), timeout)
            .await;
        assert!(!accepted.is_accepted());
    }

    #[tokio::test]
    async fn sends_bearer_token_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .and(header("authorization", "Bearer gw-token"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let prober = EndpointProber::new(Some(" gw-token ".into()));
        let outcome = prober
            .get(&format!("{}/health", server.uri()), Duration::from_secs(5))
            .await;
        assert!(outcome.is_accepted());
    }

    #[tokio::test]
    async fn timeout_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let prober = EndpointProber::new(None);
        let outcome = prober
            .post(&server.uri(), &serde_json::json!({}), Duration::from_millis(50))
            .await;
        assert_eq!(
            outcome,
            ProbeOutcome::Rejected {
                reason: "timed out".into()
            }
        );
    }
}
