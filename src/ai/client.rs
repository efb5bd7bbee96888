// Anthropic Messages API client.
//
// Two request shapes: `create_message` for free-text output and `call_tool`
// for structured output via a single forced tool call. Rate limits, server
// errors, and transport failures are retried with exponential backoff.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use tracing::{debug, warn};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_MAX: Duration = Duration::from_secs(30);

pub struct AnthropicClient {
    http: reqwest::Client,
    api_key: String,
    api_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: &str) -> Self {
        Self::with_api_url(api_key, ANTHROPIC_API_URL)
    }

    /// Construct against a custom endpoint. Used by tests with a local
    /// mock server.
    pub fn with_api_url(api_key: &str, api_url: &str) -> Self {
        AnthropicClient {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            api_url: api_url.to_string(),
        }
    }

    /// One free-text completion. Returns the concatenated text blocks.
    pub async fn create_message(
        &self,
        model: &str,
        temperature: f64,
        max_tokens: u32,
        prompt: &str,
    ) -> Result<String> {
        let body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let response = self.request(&body).await?;

        let text = collect_text(&response["content"]);
        if text.trim().is_empty() {
            bail!(
                "model returned no text content (blocks: {})",
                block_types(&response["content"])
            );
        }
        Ok(text)
    }

    /// One structured completion: the model is forced to call `tool` and the
    /// tool input is returned as JSON.
    pub async fn call_tool(
        &self,
        model: &str,
        temperature: f64,
        max_tokens: u32,
        prompt: &str,
        tool: &Value,
    ) -> Result<Value> {
        let body = json!({
            "model": model,
            "max_tokens": max_tokens,
            "temperature": temperature,
            "tools": [tool],
            "tool_choice": { "type": "any" },
            "messages": [{ "role": "user", "content": prompt }],
        });
        let response = self.request(&body).await?;

        find_tool_input(&response["content"]).ok_or_else(|| {
            anyhow!(
                "model did not return a tool_use block (blocks: {})",
                block_types(&response["content"])
            )
        })
    }

    /// Cheap connectivity and credential check, used at startup.
    pub async fn ping(&self, model: &str) -> Result<()> {
        let body = json!({
            "model": model,
            "max_tokens": 1,
            "messages": [{ "role": "user", "content": "ping" }],
        });
        self.request(&body).await?;
        Ok(())
    }

    async fn request(&self, body: &Value) -> Result<Value> {
        let mut backoff = RETRY_BASE;
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let result = self
                .http
                .post(&self.api_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<Value>()
                            .await
                            .context("failed to decode Anthropic response body");
                    }
                    let text = resp.text().await.unwrap_or_default();
                    let message = api_error_message(&text);
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(
                            status = status.as_u16(),
                            attempt, "anthropic request failed, retrying"
                        );
                        last_error = Some(anyhow!("anthropic returned {status}: {message}"));
                    } else {
                        bail!("anthropic returned {status}: {message}");
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt, "anthropic request error, retrying");
                    last_error = Some(anyhow!(e).context("anthropic request failed"));
                }
            }

            if attempt < MAX_ATTEMPTS {
                debug!(backoff_secs = backoff.as_secs(), "backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_MAX);
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("anthropic request failed")))
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn collect_text(content: &Value) -> String {
    let mut text = String::new();
    for block in content.as_array().into_iter().flatten() {
        if block["type"] == "text" {
            text.push_str(block["text"].as_str().unwrap_or_default());
        }
    }
    text
}

fn find_tool_input(content: &Value) -> Option<Value> {
    content
        .as_array()?
        .iter()
        .find(|b| b["type"] == "tool_use")
        .map(|b| b["input"].clone())
}

fn block_types(content: &Value) -> String {
    let types: Vec<&str> = content
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|b| b["type"].as_str())
        .collect();
    if types.is_empty() {
        "none".to_string()
    } else {
        types.join(", ")
    }
}

fn api_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = value["error"]["message"].as_str() {
            return msg.to_string();
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no error body".to_string()
    } else {
        trimmed.chars().take(200).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
