//! LLM invoker: one bounded-timeout, bounded-retry call per request.
//!
//! Failures never propagate as errors past this boundary. Transport errors,
//! timeouts and unparsable output all come back as a [`DegradationReason`].

use crate::config::InferenceConfig;
use crate::error::DegradationReason;
use crate::json_repair;
use crate::openrouter::{CompletionClient, CompletionRequest, Message};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct LlmInvoker {
    client: Arc<dyn CompletionClient>,
    timeout: Duration,
    max_retries: usize,
    temperature: f32,
    max_tokens: u32,
}

impl LlmInvoker {
    pub fn new(client: Arc<dyn CompletionClient>, config: &InferenceConfig) -> Self {
        Self {
            client,
            timeout: config.llm_timeout(),
            max_retries: config.llm_max_retries,
            temperature: config.llm_temperature,
            max_tokens: config.llm_max_tokens,
        }
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Raw completion text. Retries transport failures and timeouts only.
    pub async fn complete(
        &self,
        model: &str,
        messages: Vec<Message>,
    ) -> Result<String, DegradationReason> {
        let attempts = self.max_retries + 1;
        let mut last_reason = DegradationReason::NoResult("no attempt made".to_string());

        for attempt in 1..=attempts {
            let request = CompletionRequest {
                model: model.to_string(),
                messages: messages.clone(),
                temperature: self.temperature,
                max_tokens: self.max_tokens,
            };

            let outcome = tokio::time::timeout(self.timeout, self.client.complete(request)).await;
            let reason = match outcome {
                Ok(Ok(content)) if content.trim().is_empty() => {
                    DegradationReason::NoResult("empty completion".to_string())
                }
                Ok(Ok(content)) => {
                    debug!(
                        "LLM {} answered on attempt {}/{} ({} chars)",
                        model,
                        attempt,
                        attempts,
                        content.len()
                    );
                    return Ok(content);
                }
                Ok(Err(e)) => DegradationReason::Upstream(format!("{:#}", e)),
                Err(_) => DegradationReason::Timeout(self.timeout),
            };

            warn!(
                "LLM {} attempt {}/{} degraded: {}",
                model, attempt, attempts, reason
            );
            let retryable = matches!(
                reason,
                DegradationReason::Upstream(_) | DegradationReason::Timeout(_)
            );
            last_reason = reason;
            if !retryable {
                break;
            }
        }

        Err(last_reason)
    }

    /// Completion recovered as JSON and deserialized into `T`.
    pub async fn complete_json<T: DeserializeOwned>(
        &self,
        model: &str,
        messages: Vec<Message>,
    ) -> Result<T, DegradationReason> {
        let content = self.complete(model, messages).await?;
        json_repair::recover_as(&content).map_err(|reason| {
            warn!("LLM {} response unusable: {}", model, reason);
            reason
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted completion client shared by unit tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    pub(crate) enum Scripted {
        Reply(String),
        Fail(String),
        Hang,
    }

    #[derive(Default)]
    pub(crate) struct ScriptedClient {
        replies: Mutex<VecDeque<Scripted>>,
        pub(crate) requests: Mutex<Vec<CompletionRequest>>,
    }

    impl ScriptedClient {
        pub(crate) fn new(replies: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn replies(texts: &[&str]) -> Arc<Self> {
            Self::new(
                texts
                    .iter()
                    .map(|t| Scripted::Reply(t.to_string()))
                    .collect(),
            )
        }

        pub(crate) fn call_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait::async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(&self, request: CompletionRequest) -> anyhow::Result<String> {
            self.requests.lock().push(request);
            let next = self.replies.lock().pop_front();
            match next {
                Some(Scripted::Reply(text)) => Ok(text),
                Some(Scripted::Fail(msg)) => Err(anyhow::anyhow!(msg)),
                Some(Scripted::Hang) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(String::new())
                }
                None => Err(anyhow::anyhow!("no scripted reply left")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Scripted, ScriptedClient};
    use super::*;

    fn invoker(client: Arc<ScriptedClient>, retries: usize) -> LlmInvoker {
        let config = InferenceConfig {
            llm_max_retries: retries,
            ..InferenceConfig::default()
        };
        LlmInvoker::new(client, &config).with_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_complete_json_recovers() {
        let client = ScriptedClient::replies(&["Result:\n```json\n{\"n\": 2,}\n```"]);
        let llm = invoker(client.clone(), 0);

        let value: serde_json::Value = llm.complete_json("m", vec![Message::user("q")]).await.unwrap();
        assert_eq!(value["n"], 2);
        assert_eq!(client.call_count(), 1);
        assert_eq!(client.requests.lock()[0].temperature, 0.1);
    }

    #[tokio::test]
    async fn test_timeout_is_degradation() {
        let client = ScriptedClient::new(vec![Scripted::Hang]);
        let llm = invoker(client, 0);

        let err = llm.complete("m", vec![Message::user("q")]).await.unwrap_err();
        assert!(matches!(err, DegradationReason::Timeout(_)));
    }

    #[tokio::test]
    async fn test_upstream_failure_is_retried_once() {
        let client = ScriptedClient::new(vec![
            Scripted::Fail("502 bad gateway".into()),
            Scripted::Reply("{\"ok\": true}".into()),
        ]);
        let llm = invoker(client.clone(), 1);

        let text = llm.complete("m", vec![Message::user("q")]).await.unwrap();
        assert_eq!(text, "{\"ok\": true}");
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let client = ScriptedClient::new(vec![
            Scripted::Fail("down".into()),
            Scripted::Fail("down".into()),
            Scripted::Fail("down".into()),
        ]);
        let llm = invoker(client.clone(), 1);

        let err = llm.complete("m", vec![Message::user("q")]).await.unwrap_err();
        assert!(matches!(err, DegradationReason::Upstream(_)));
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_prose_only_is_parse_failure() {
        let client = ScriptedClient::replies(&["I am not sure about this sheet."]);
        let llm = invoker(client, 0);

        let err = llm
            .complete_json::<serde_json::Value>("m", vec![Message::user("q")])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "parse_failure");
    }
}
