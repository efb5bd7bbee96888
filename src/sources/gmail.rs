// Gmail message source.
//
// Authenticates with a stored OAuth refresh token and polls the inbox. The
// first sync lists recent inbox messages; after that, history.list gives
// cheap incremental updates keyed by the persisted history id.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::models::{InboundMessage, SourceChannel};

use super::MessageSource;

const GMAIL_API_URL: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_MAX: Duration = Duration::from_secs(10);

/// Messages fetched on the very first sync (no history id yet).
const INITIAL_SYNC_MAX_RESULTS: u32 = 25;

const STATE_KEY: &str = "gmail";

/// OAuth client credentials plus a long-lived refresh token, stored as JSON
/// at the configured credentials path.
#[derive(Debug, Clone, Deserialize)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

impl GmailCredentials {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read Gmail credentials at {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("invalid Gmail credentials file {}", path.display()))
    }
}

pub struct GmailSource {
    http: reqwest::Client,
    credentials: GmailCredentials,
    db: Arc<Database>,
    api_url: String,
    token_url: String,
    /// (access_token, expiry) cache for the refresh-token flow.
    access_token: tokio::sync::Mutex<Option<(String, Instant)>>,
    /// The authenticated mailbox address, resolved lazily; used to skip
    /// messages we sent ourselves.
    user_email: tokio::sync::Mutex<Option<String>>,
}

impl GmailSource {
    pub fn new(credentials: GmailCredentials, db: Arc<Database>) -> Self {
        Self::with_urls(credentials, db, GMAIL_API_URL, GOOGLE_TOKEN_URL)
    }

    /// Construct against custom endpoints. Used by tests with a local
    /// mock server.
    pub fn with_urls(
        credentials: GmailCredentials,
        db: Arc<Database>,
        api_url: &str,
        token_url: &str,
    ) -> Self {
        GmailSource {
            http: reqwest::Client::new(),
            credentials,
            db,
            api_url: api_url.trim_end_matches('/').to_string(),
            token_url: token_url.to_string(),
            access_token: tokio::sync::Mutex::new(None),
            user_email: tokio::sync::Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------

    /// Return a valid access token, refreshing via the token endpoint when
    /// the cached one is missing or near expiry.
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.access_token.lock().await;
        if let Some((token, expiry)) = cached.as_ref() {
            if Instant::now() < *expiry {
                return Ok(token.clone());
            }
        }

        debug!("refreshing gmail access token");
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", self.credentials.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .context("gmail token refresh request failed")?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("failed to decode gmail token response")?;
        if !status.is_success() {
            bail!(
                "gmail token refresh returned {status}: {}",
                body["error_description"]
                    .as_str()
                    .or(body["error"].as_str())
                    .unwrap_or("no error body")
            );
        }

        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| anyhow!("gmail token response missing access_token"))?
            .to_string();
        // Renew a minute before the reported expiry.
        let expires_in = body["expires_in"].as_u64().unwrap_or(3600).saturating_sub(60);
        *cached = Some((token.clone(), Instant::now() + Duration::from_secs(expires_in)));
        Ok(token)
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.api_url, path);
        let mut backoff = RETRY_BASE;
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let token = self.access_token().await?;
            let result = self
                .http
                .get(&url)
                .bearer_auth(&token)
                .query(query)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<Value>()
                        .await
                        .context("failed to decode gmail response body");
                }
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 401 {
                        // Token may have been revoked mid-flight; force a refresh.
                        *self.access_token.lock().await = None;
                    }
                    warn!(status = status.as_u16(), attempt, url = %url, "gmail request failed");
                    last_error = Some(anyhow!("gmail returned {status} for {path}"));
                }
                Err(e) => {
                    warn!(error = %e, attempt, "gmail request error");
                    last_error = Some(anyhow!(e).context("gmail request failed"));
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_MAX);
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("gmail request failed")))
    }

    async fn user_email(&self) -> Result<String> {
        let mut cached = self.user_email.lock().await;
        if let Some(email) = cached.as_ref() {
            return Ok(email.clone());
        }
        let profile = self.get_json("/profile", &[]).await?;
        let email = profile["emailAddress"]
            .as_str()
            .unwrap_or_default()
            .to_lowercase();
        info!(user = %email, "gmail service ready");
        *cached = Some(email.clone());
        Ok(email)
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Send a reply through the Gmail API. Threading headers keep the reply
    /// inside the original conversation.
    pub async fn send_reply(
        &self,
        to_email: &str,
        subject: &str,
        body: &str,
        thread_id: Option<&str>,
        in_reply_to: Option<&str>,
    ) -> Result<Value> {
        let raw = URL_SAFE_NO_PAD.encode(build_mime_message(to_email, subject, body, in_reply_to));
        let mut payload = serde_json::json!({ "raw": raw });
        if let Some(thread_id) = thread_id {
            payload["threadId"] = serde_json::json!(thread_id);
        }

        let url = format!("{}/messages/send", self.api_url);
        let mut backoff = RETRY_BASE;
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let token = self.access_token().await?;
            let result = self
                .http
                .post(&url)
                .bearer_auth(&token)
                .json(&payload)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    let sent: Value = resp
                        .json()
                        .await
                        .context("failed to decode gmail send response")?;
                    info!(
                        to = to_email,
                        message_id = sent["id"].as_str().unwrap_or_default(),
                        thread_id = sent["threadId"].as_str().unwrap_or_default(),
                        "gmail message sent"
                    );
                    return Ok(sent);
                }
                Ok(resp) => {
                    let status = resp.status();
                    if status.as_u16() == 401 {
                        *self.access_token.lock().await = None;
                    }
                    if status.is_client_error() && status.as_u16() != 401 && status.as_u16() != 429 {
                        bail!("gmail send rejected with {status}");
                    }
                    warn!(status = status.as_u16(), attempt, "gmail send failed");
                    last_error = Some(anyhow!("gmail send returned {status}"));
                }
                Err(e) => {
                    warn!(error = %e, attempt, "gmail send error");
                    last_error = Some(anyhow!(e).context("gmail send failed"));
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_MAX);
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("gmail send failed")))
    }

    // ------------------------------------------------------------------
    // Polling strategies
    // ------------------------------------------------------------------

    /// Incremental poll via history.list. Returns new inbox message ids and
    /// persists the newest history id.
    async fn poll_with_history(&self, start_history_id: &str) -> Result<Vec<String>> {
        debug!(start_history_id, "gmail incremental poll");

        let mut message_ids = Vec::new();
        let mut latest_history_id = start_history_id.to_string();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("startHistoryId", start_history_id.to_string()),
                ("historyTypes", "messageAdded".to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let response = self.get_json("/history", &query).await?;

            if let Some(id) = response["historyId"].as_str() {
                latest_history_id = id.to_string();
            }
            collect_added_inbox_ids(&response, &mut message_ids);

            match response["nextPageToken"].as_str() {
                Some(token) => page_token = Some(token.to_string()),
                None => break,
            }
        }

        self.save_history_id(&latest_history_id)?;
        Ok(dedup_preserving_order(message_ids))
    }

    /// First sync: list recent inbox messages (last 24 hours) and seed the
    /// history id from the newest one.
    async fn poll_initial(&self) -> Result<Vec<String>> {
        info!("gmail initial sync");

        let after_epoch = (Utc::now() - chrono::Duration::days(1)).timestamp();
        let response = self
            .get_json(
                "/messages",
                &[
                    ("labelIds", "INBOX".to_string()),
                    ("q", format!("after:{after_epoch}")),
                    ("maxResults", INITIAL_SYNC_MAX_RESULTS.to_string()),
                ],
            )
            .await?;

        let message_ids: Vec<String> = response["messages"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|m| m["id"].as_str().map(str::to_string))
            .collect();

        if let Some(first_id) = message_ids.first() {
            let msg = self
                .get_json(
                    &format!("/messages/{first_id}"),
                    &[
                        ("format", "metadata".to_string()),
                        ("metadataHeaders", "From".to_string()),
                    ],
                )
                .await?;
            if let Some(history_id) = msg["historyId"].as_str() {
                self.save_history_id(history_id)?;
            }
        }

        Ok(message_ids)
    }

    fn save_history_id(&self, history_id: &str) -> Result<()> {
        self.db
            .save_source_state(STATE_KEY, None, Some(history_id))?;
        debug!(history_id, "gmail history id saved");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Message processing
    // ------------------------------------------------------------------

    /// Fetch, filter, and normalize one Gmail message. Returns `None` for
    /// sent mail, non-inbox mail, and our own messages.
    async fn process_message(&self, message_id: &str) -> Result<Option<InboundMessage>> {
        let msg = self
            .get_json(
                &format!("/messages/{message_id}"),
                &[("format", "full".to_string())],
            )
            .await?;

        let labels = label_ids(&msg);
        if labels.iter().any(|l| l == "SENT") || !labels.iter().any(|l| l == "INBOX") {
            return Ok(None);
        }

        let from_header = header_value(&msg["payload"], "From").unwrap_or_default();
        let (sender_name, sender_email) = parse_from_header(&from_header);

        let user_email = self.user_email().await?;
        if !sender_email.is_empty() && sender_email.to_lowercase() == user_email {
            return Ok(None);
        }

        let subject = header_value(&msg["payload"], "Subject").unwrap_or_default();
        let body = extract_body(&msg["payload"]);

        let internal_ms = msg["internalDate"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let received_at = DateTime::<Utc>::from_timestamp_millis(internal_ms)
            .unwrap_or_else(Utc::now);

        let thread_id = msg["threadId"].as_str().unwrap_or_default().to_string();
        let thread_context = if thread_id.is_empty() {
            String::new()
        } else {
            self.build_thread_context(&thread_id, message_id).await
        };

        let mut inbound = InboundMessage::new(
            SourceChannel::Gmail,
            message_id,
            sender_name,
            body,
            received_at,
        );
        inbound.sender_email = sender_email;
        inbound.subject = subject;
        inbound.thread_context = thread_context;
        inbound.thread_id = thread_id;
        Ok(Some(inbound))
    }

    /// Prior conversation turns from the thread, oldest first, excluding the
    /// current message. Best effort: failures yield an empty context.
    async fn build_thread_context(&self, thread_id: &str, current_message_id: &str) -> String {
        let thread = match self
            .get_json(
                &format!("/threads/{thread_id}"),
                &[("format", "full".to_string())],
            )
            .await
        {
            Ok(thread) => thread,
            Err(e) => {
                warn!(thread_id, error = %e, "gmail thread fetch failed");
                return String::new();
            }
        };

        format_thread_context(&thread, current_message_id)
    }
}

#[async_trait]
impl MessageSource for GmailSource {
    fn name(&self) -> &'static str {
        "gmail"
    }

    async fn poll(&self) -> Result<Vec<InboundMessage>> {
        let state = self.db.get_source_state(STATE_KEY)?.unwrap_or_default();

        let message_ids = match state.gmail_history_id.as_deref() {
            Some(history_id) => self.poll_with_history(history_id).await?,
            None => self.poll_initial().await?,
        };

        if message_ids.is_empty() {
            debug!("gmail poll found no new messages");
            return Ok(Vec::new());
        }
        info!(count = message_ids.len(), "gmail poll found new messages");

        let mut messages = Vec::new();
        for id in &message_ids {
            match self.process_message(id).await {
                Ok(Some(inbound)) => messages.push(inbound),
                Ok(None) => {}
                Err(e) => warn!(message_id = %id, error = %e, "failed to process gmail message"),
            }
        }
        Ok(messages)
    }

    async fn is_available(&self) -> bool {
        match self.get_json("/profile", &[]).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "gmail health check failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn label_ids(msg: &Value) -> Vec<String> {
    msg["labelIds"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|l| l.as_str().map(str::to_string))
        .collect()
}

fn header_value(payload: &Value, name: &str) -> Option<String> {
    payload["headers"]
        .as_array()?
        .iter()
        .find(|h| {
            h["name"]
                .as_str()
                .is_some_and(|n| n.eq_ignore_ascii_case(name))
        })
        .and_then(|h| h["value"].as_str())
        .map(str::to_string)
}

/// Split a From header into `(display_name, email)`.
///
/// `"Jane Doe <jane@example.com>"` yields `("Jane Doe", "jane@example.com")`;
/// a bare address is used as both name and email.
fn parse_from_header(from_header: &str) -> (String, String) {
    let trimmed = from_header.trim();
    if let Some(open) = trimmed.rfind('<') {
        if let Some(close) = trimmed.rfind('>') {
            if close > open {
                let email = trimmed[open + 1..close].trim().to_string();
                let name = trimmed[..open].trim().trim_matches('"').trim().to_string();
                if name.is_empty() {
                    let fallback = if email.is_empty() {
                        "Unknown".to_string()
                    } else {
                        email.clone()
                    };
                    return (fallback, email);
                }
                return (name, email);
            }
        }
    }
    if trimmed.is_empty() {
        ("Unknown".to_string(), String::new())
    } else {
        (trimmed.to_string(), trimmed.to_string())
    }
}

fn decode_body_data(data: &str) -> String {
    URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}

/// Extract the text body from a Gmail payload. Walks the MIME part tree,
/// preferring text/plain over text/html.
fn extract_body(payload: &Value) -> String {
    let mime_type = payload["mimeType"].as_str().unwrap_or_default();
    let body_data = payload["body"]["data"].as_str();

    if let Some(data) = body_data {
        if mime_type == "text/plain" {
            return decode_body_data(data);
        }
    }

    let mut plain: Option<String> = None;
    let mut html: Option<String> = None;

    let mut stack: Vec<&Value> = payload["parts"].as_array().into_iter().flatten().collect();
    while let Some(part) = stack.pop() {
        let part_mime = part["mimeType"].as_str().unwrap_or_default();
        if let Some(data) = part["body"]["data"].as_str() {
            if part_mime == "text/plain" && plain.is_none() {
                plain = Some(decode_body_data(data));
            } else if part_mime == "text/html" && html.is_none() {
                html = Some(decode_body_data(data));
            }
        }
        stack.extend(part["parts"].as_array().into_iter().flatten());
    }

    if let Some(text) = plain {
        return text;
    }
    if let Some(text) = html {
        return text;
    }
    body_data.map(decode_body_data).unwrap_or_default()
}

/// Pull new inbox message ids out of a history.list response page.
/// Build an RFC 2822 text message for the Gmail raw-send endpoint.
fn build_mime_message(
    to_email: &str,
    subject: &str,
    body: &str,
    in_reply_to: Option<&str>,
) -> String {
    let mut lines = vec![
        format!("To: {to_email}"),
        format!("Subject: {subject}"),
        "Content-Type: text/plain; charset=\"utf-8\"".to_string(),
        "MIME-Version: 1.0".to_string(),
    ];
    if let Some(message_id) = in_reply_to {
        lines.push(format!("In-Reply-To: {message_id}"));
        lines.push(format!("References: {message_id}"));
    }
    lines.push(String::new());
    lines.push(body.to_string());
    lines.join("\r\n")
}

fn collect_added_inbox_ids(response: &Value, out: &mut Vec<String>) {
    for record in response["history"].as_array().into_iter().flatten() {
        for added in record["messagesAdded"].as_array().into_iter().flatten() {
            let msg = &added["message"];
            let labels = label_ids(msg);
            if labels.iter().any(|l| l == "INBOX") && !labels.iter().any(|l| l == "SENT") {
                if let Some(id) = msg["id"].as_str() {
                    out.push(id.to_string());
                }
            }
        }
    }
}

fn dedup_preserving_order(ids: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(id.clone())).collect()
}

/// Format prior thread turns chronologically, excluding the current message.
fn format_thread_context(thread: &Value, current_message_id: &str) -> String {
    let mut messages: Vec<&Value> = thread["messages"].as_array().into_iter().flatten().collect();
    messages.sort_by_key(|m| {
        m["internalDate"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0)
    });

    let mut parts = Vec::new();
    for msg in messages {
        if msg["id"].as_str() == Some(current_message_id) {
            continue;
        }
        let from = header_value(&msg["payload"], "From").unwrap_or_else(|| "Unknown".to_string());
        let date = header_value(&msg["payload"], "Date").unwrap_or_default();
        let body = extract_body(&msg["payload"]);
        parts.push(format!("From: {from}\nDate: {date}\n\n{}", body.trim()));
    }
    parts.join("\n---\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
