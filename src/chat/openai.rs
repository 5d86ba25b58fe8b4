//! OpenAI-compatible chat-completion client.
//!
//! Each attempt is bounded by the client timeout and the whole exchange by
//! `total_timeout_secs`. Rate limiting (429), upstream 5xx, timeouts and
//! connection failures (refused, reset, closed mid-response) are retried with
//! exponential backoff; any other failure (bad request, bad key, unknown
//! model, malformed body) is returned immediately.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ChatMessage, ChatProvider};
use crate::config::ChatConfig;
use crate::error::{ApiError, ApiResult};

/// Upper bound on any single backoff, including server-provided `Retry-After`.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Upstream error bodies are truncated to this many characters in logs.
const ERROR_BODY_PREVIEW: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `initial * 2^retry`,
    /// or the server's `Retry-After`, whichever is larger, capped.
    pub fn delay(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(retry.min(16)));
        exp.max(retry_after.unwrap_or_default()).min(MAX_BACKOFF)
    }
}

#[derive(Debug)]
enum Failure {
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
    Permanent(String),
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

pub struct OpenAiCompatibleProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    temperature: f64,
    retry: RetryPolicy,
    total_timeout: Duration,
}

impl OpenAiCompatibleProvider {
    pub fn from_config(cfg: &ChatConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            endpoint: format!("{}/v1/chat/completions", cfg.base_url.trim_end_matches('/')),
            api_key: cfg.api_key.clone().filter(|k| !k.trim().is_empty()),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            retry: RetryPolicy {
                max_retries: cfg.max_retries,
                initial_backoff: Duration::from_millis(cfg.initial_backoff_ms),
            },
            total_timeout: Duration::from_secs(cfg.total_timeout_secs),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    async fn send_once(&self, api_key: &str, messages: &[ChatMessage]) -> Result<String, Failure> {
        let body = CompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
        };

        let resp = match self
            .http
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            // `is_request` covers connections reset or closed before a response.
            Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                return Err(Failure::Transient {
                    reason: format!("transport: {e}"),
                    retry_after: None,
                });
            }
            Err(e) => return Err(Failure::Permanent(format!("transport: {e}"))),
        };

        let status = resp.status();
        if status.is_success() {
            let parsed: CompletionResponse = resp
                .json()
                .await
                .map_err(|e| Failure::Permanent(format!("malformed completion body: {e}")))?;
            return parsed
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| Failure::Permanent("completion had no choices".into()));
        }

        let retry_after = resp
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = resp.text().await.unwrap_or_default();
        let preview: String = text.chars().take(ERROR_BODY_PREVIEW).collect();
        let reason = format!("HTTP {status}: {preview}");

        if is_transient_status(status) {
            Err(Failure::Transient {
                reason,
                retry_after,
            })
        } else {
            Err(Failure::Permanent(reason))
        }
    }

    async fn complete_with_retries(
        &self,
        api_key: &str,
        messages: &[ChatMessage],
    ) -> ApiResult<String> {
        let mut retry = 0;
        loop {
            match self.send_once(api_key, messages).await {
                Ok(reply) => return Ok(reply),
                Err(Failure::Transient {
                    reason,
                    retry_after,
                }) if retry < self.retry.max_retries => {
                    let delay = self.retry.delay(retry, retry_after);
                    tracing::warn!(
                        attempt = retry + 1,
                        delay_ms = delay.as_millis() as u64,
                        %reason,
                        "transient chat upstream failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(Failure::Transient { reason, .. }) => {
                    return Err(ApiError::Upstream(format!(
                        "giving up after {} attempts: {reason}",
                        retry + 1
                    )));
                }
                Err(Failure::Permanent(reason)) => return Err(ApiError::Upstream(reason)),
            }
        }
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

#[async_trait]
impl ChatProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn complete(&self, messages: &[ChatMessage]) -> ApiResult<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ApiError::Configuration("chat API key is not configured".into()))?;

        let attempts = self.complete_with_retries(api_key, messages);
        match tokio::time::timeout(self.total_timeout, attempts).await {
            Ok(result) => result,
            Err(_) => Err(ApiError::Upstream(format!(
                "no reply within {}s",
                self.total_timeout.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: &str, max_retries: u32) -> ChatConfig {
        ChatConfig {
            base_url: base_url.into(),
            api_key: Some("sk-test".into()),
            request_timeout_secs: 5,
            max_retries,
            initial_backoff_ms: 1,
            total_timeout_secs: 30,
            ..ChatConfig::default()
        }
    }

    fn ok_body(reply: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": reply } }]
        })
    }

    async fn request_count(server: &MockServer) -> usize {
        server.received_requests().await.map(|r| r.len()).unwrap_or(0)
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.delay(0, None), Duration::from_millis(500));
        assert_eq!(policy.delay(1, None), Duration::from_millis(1_000));
        assert_eq!(policy.delay(2, None), Duration::from_millis(2_000));
        assert_eq!(policy.delay(20, None), MAX_BACKOFF);
        assert_eq!(
            policy.delay(0, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(policy.delay(0, Some(Duration::from_secs(600))), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn succeeds_after_rate_limiting() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("I'm here for you.")))
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::from_config(&config(&server.uri(), 3)).unwrap();
        let reply = provider
            .complete(&[ChatMessage::user("hello")])
            .await
            .unwrap();

        assert_eq!(reply, "I'm here for you.");
        assert_eq!(request_count(&server).await, 3);
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad model"))
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::from_config(&config(&server.uri(), 3)).unwrap();
        let err = provider.complete(&[ChatMessage::user("hi")]).await.unwrap_err();

        assert!(matches!(err, ApiError::Upstream(ref m) if m.contains("400")));
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::from_config(&config(&server.uri(), 3)).unwrap();
        assert!(provider.complete(&[ChatMessage::user("hi")]).await.is_err());
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn persistent_unavailability_gives_up_after_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::from_config(&config(&server.uri(), 2)).unwrap();
        let err = provider.complete(&[ChatMessage::user("hi")]).await.unwrap_err();

        assert!(matches!(err, ApiError::Upstream(ref m) if m.contains("3 attempts")));
        assert_eq!(request_count(&server).await, 3);
    }

    #[tokio::test]
    async fn empty_choices_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"choices": []})),
            )
            .mount(&server)
            .await;

        let provider = OpenAiCompatibleProvider::from_config(&config(&server.uri(), 3)).unwrap();
        assert!(provider.complete(&[ChatMessage::user("hi")]).await.is_err());
        assert_eq!(request_count(&server).await, 1);
    }

    #[tokio::test]
    async fn missing_api_key_fails_without_calling_upstream() {
        let server = MockServer::start().await;
        let mut cfg = config(&server.uri(), 3);
        cfg.api_key = None;

        let provider = OpenAiCompatibleProvider::from_config(&cfg).unwrap();
        let err = provider.complete(&[ChatMessage::user("hi")]).await.unwrap_err();

        assert!(matches!(err, ApiError::Configuration(_)));
        assert_eq!(request_count(&server).await, 0);
    }

    #[tokio::test]
    async fn dropped_connections_are_retried() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                drop(socket);
            }
        });

        let provider =
            OpenAiCompatibleProvider::from_config(&config(&format!("http://{addr}"), 3)).unwrap();
        let err = provider.complete(&[ChatMessage::user("hi")]).await.unwrap_err();

        assert!(matches!(err, ApiError::Upstream(ref m) if m.contains("4 attempts")), "{err}");
        assert_eq!(accepted.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn total_budget_bounds_all_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let mut cfg = config(&server.uri(), 50);
        cfg.initial_backoff_ms = 400;
        cfg.total_timeout_secs = 1;
        let provider = OpenAiCompatibleProvider::from_config(&cfg).unwrap();

        let started = std::time::Instant::now();
        let err = provider.complete(&[ChatMessage::user("hi")]).await.unwrap_err();

        assert!(matches!(err, ApiError::Upstream(ref m) if m.contains("within 1s")), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(request_count(&server).await < 5);
    }
}
