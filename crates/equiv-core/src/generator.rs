//! Text-generation collaborator boundary.
//!
//! The engine never talks to a model directly; it talks to [`TextGenerator`],
//! a one-method interface satisfied by an adapter around a real chat API and
//! by a deterministic stub for tests and collaborator-less runs.

use async_trait::async_trait;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Narrow collaborator contract: one prompt in, one text response out.
///
/// `system_override` replaces the adapter's default system instruction for
/// this single call (used by strategies that carry their own role prompt).
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, system_override: Option<&str>)
        -> anyhow::Result<String>;

    fn name(&self) -> &'static str;
}

/// Deterministic generator for tests and collaborator-less pipelines.
///
/// Responses are served from a queue; once the queue is empty every call
/// returns the fixed default. Never fails.
pub struct StubGenerator {
    responses: Mutex<VecDeque<String>>,
    default: String,
}

impl StubGenerator {
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            default: default.into(),
        }
    }

    /// Queue a one-shot response, served before the default.
    #[must_use]
    pub fn with_response(self, response: impl Into<String>) -> Self {
        self.responses
            .lock()
            .expect("stub response queue lock")
            .push_back(response.into());
        self
    }
}

impl Default for StubGenerator {
    fn default() -> Self {
        // An empty JSON object is the least-surprising probe output: it
        // parses, and downstream comparison treats it as "captured nothing".
        Self::new("print(\"{}\")")
    }
}

#[async_trait]
impl TextGenerator for StubGenerator {
    async fn generate(
        &self,
        _prompt: &str,
        _system_override: Option<&str>,
    ) -> anyhow::Result<String> {
        let queued = self
            .responses
            .lock()
            .expect("stub response queue lock")
            .pop_front();
        Ok(queued.unwrap_or_else(|| self.default.clone()))
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_RETRIES: u32 = 5;

/// Adapter for OpenAI-compatible chat-completions endpoints.
pub struct OpenAiGenerator {
    pub model: String,
    pub api_key: String,
    pub base_url: String,
    client: reqwest::Client,
}

impl OpenAiGenerator {
    pub fn new(model: String, api_key: String, base_url: Option<String>) -> Self {
        Self {
            model,
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: reqwest::Client::new(),
        }
    }

    /// Construct from `EQUIV_API_KEY` / `EQUIV_BASE_URL`.
    pub fn from_env(model: String) -> anyhow::Result<Self> {
        let api_key = std::env::var("EQUIV_API_KEY")
            .map_err(|_| anyhow::anyhow!("config error: EQUIV_API_KEY not set"))?;
        let base_url = std::env::var("EQUIV_BASE_URL").ok();
        Ok(Self::new(model, api_key, base_url))
    }

    async fn complete_once(
        &self,
        prompt: &str,
        system_override: Option<&str>,
    ) -> anyhow::Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut messages = Vec::new();
        if let Some(system) = system_override {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));

        let body = json!({
            "model": self.model,
            "messages": messages,
        });

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let payload: serde_json::Value = resp.json().await?;
        if !status.is_success() {
            anyhow::bail!("generator API error (status {status}): {payload}");
        }

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| anyhow::anyhow!("generator response missing message content"))
    }
}

#[async_trait]
impl TextGenerator for OpenAiGenerator {
    async fn generate(
        &self,
        prompt: &str,
        system_override: Option<&str>,
    ) -> anyhow::Result<String> {
        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            match self.complete_once(prompt, system_override).await {
                Ok(text) => return Ok(text),
                Err(e) if is_rate_limited(&e) && attempt < MAX_RETRIES => {
                    let base = 5u64 << attempt; // 5, 10, 20, 40, 80s
                    let jitter = rand::random::<u64>() % 1000;
                    tracing::warn!(
                        attempt = attempt + 1,
                        wait_secs = base,
                        "generator rate limited, backing off"
                    );
                    tokio::time::sleep(Duration::from_secs(base) + Duration::from_millis(jitter))
                        .await;
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("generator retries exhausted")))
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

fn is_rate_limited(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    msg.contains("429") || msg.to_lowercase().contains("rate limit")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_serves_queued_then_default() {
        let g = StubGenerator::new("default").with_response("first");
        assert_eq!(g.generate("p", None).await.unwrap(), "first");
        assert_eq!(g.generate("p", None).await.unwrap(), "default");
        assert_eq!(g.generate("p", None).await.unwrap(), "default");
    }

    #[test]
    fn rate_limit_detection() {
        assert!(is_rate_limited(&anyhow::anyhow!(
            "generator API error (status 429 Too Many Requests): {{}}"
        )));
        assert!(!is_rate_limited(&anyhow::anyhow!("connection refused")));
    }
}
