// Outbound sending: routes approved replies back through the channel the
// conversation lives on, behind per-channel rate limits.

pub mod rate_limiter;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::models::SourceChannel;
use crate::sources::gmail::GmailSource;

pub use rate_limiter::RateLimiter;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_MAX: Duration = Duration::from_secs(30);

/// Everything a send might need; channel-specific fields stay empty for the
/// other channel.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub to_email: String,
    pub subject: String,
    pub body: String,
    pub thread_id: String,
    pub in_reply_to: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct SentMessage {
    pub message_id: String,
    pub thread_id: String,
}

/// Seam for the outbound cycle; [`MessageSender`] is the live
/// implementation.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, channel: SourceChannel, request: &SendRequest) -> Result<SentMessage>;
}

#[async_trait]
impl Transport for MessageSender {
    async fn send(&self, channel: SourceChannel, request: &SendRequest) -> Result<SentMessage> {
        MessageSender::send(self, channel, request).await
    }
}

pub struct MessageSender {
    gmail: Option<Arc<GmailSource>>,
    http: reqwest::Client,
    unipile_base_url: String,
    unipile_api_key: String,
    limiter: Arc<RateLimiter>,
}

impl MessageSender {
    pub fn new(
        gmail: Option<Arc<GmailSource>>,
        unipile_dsn: &str,
        unipile_api_key: &str,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        MessageSender {
            gmail,
            http: reqwest::Client::new(),
            unipile_base_url: if unipile_dsn.is_empty() {
                String::new()
            } else {
                format!("https://{unipile_dsn}/api/v1")
            },
            unipile_api_key: unipile_api_key.to_string(),
            limiter,
        }
    }

    #[cfg(test)]
    pub fn with_unipile_base_url(
        base_url: &str,
        unipile_api_key: &str,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        MessageSender {
            gmail: None,
            http: reqwest::Client::new(),
            unipile_base_url: base_url.trim_end_matches('/').to_string(),
            unipile_api_key: unipile_api_key.to_string(),
            limiter,
        }
    }

    /// Route to the right channel. `Both` is not a sendable channel.
    pub async fn send(&self, channel: SourceChannel, request: &SendRequest) -> Result<SentMessage> {
        match channel {
            SourceChannel::Gmail => self.send_gmail(request).await,
            SourceChannel::LinkedIn => self.send_linkedin(request).await,
            SourceChannel::Both => bail!("cannot send on merged channel"),
        }
    }

    async fn send_gmail(&self, request: &SendRequest) -> Result<SentMessage> {
        let gmail = self
            .gmail
            .as_ref()
            .ok_or_else(|| anyhow!("gmail sending not configured"))?;
        if request.to_email.is_empty() {
            bail!("gmail send requires a recipient address");
        }
        if !self.limiter.acquire(SourceChannel::Gmail).await {
            bail!("gmail send rate limit exceeded");
        }

        let sent = gmail
            .send_reply(
                &request.to_email,
                &request.subject,
                &request.body,
                non_empty(&request.thread_id),
                non_empty(&request.in_reply_to),
            )
            .await?;
        Ok(SentMessage {
            message_id: sent["id"].as_str().unwrap_or_default().to_string(),
            thread_id: sent["threadId"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn send_linkedin(&self, request: &SendRequest) -> Result<SentMessage> {
        if self.unipile_base_url.is_empty() || self.unipile_api_key.is_empty() {
            bail!("linkedin sending not configured");
        }
        if request.chat_id.is_empty() {
            bail!("linkedin send requires a chat id");
        }
        if !self.limiter.acquire(SourceChannel::LinkedIn).await {
            bail!("linkedin send rate limit exceeded");
        }

        let url = format!("{}/chats/{}/messages", self.unipile_base_url, request.chat_id);
        let payload = json!({ "text": request.body });
        let mut backoff = RETRY_BASE;
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let result = self
                .http
                .post(&url)
                .header("X-API-KEY", &self.unipile_api_key)
                .json(&payload)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let sent: Value = resp.json().await.unwrap_or_else(|_| json!({}));
                    let message_id = sent["id"]
                        .as_str()
                        .or(sent["message_id"].as_str())
                        .unwrap_or_default()
                        .to_string();
                    info!(chat_id = %request.chat_id, message_id = %message_id, "linkedin message sent");
                    return Ok(SentMessage {
                        message_id,
                        thread_id: request.chat_id.clone(),
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_client_error() && status.as_u16() != 429 {
                        bail!("linkedin send rejected with {status}");
                    }
                    warn!(status = status.as_u16(), attempt, "linkedin send failed");
                    last_error = Some(anyhow!("linkedin send returned {status}"));
                }
                Err(e) => {
                    warn!(error = %e, attempt, "linkedin send error");
                    last_error = Some(anyhow!(e).context("linkedin send failed"));
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_MAX);
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("linkedin send failed")))
    }
}

fn non_empty(s: &str) -> Option<&str> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}
