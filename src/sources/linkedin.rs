// LinkedIn message source via the Unipile REST API.
//
// Polls chats per connected account, each with its own cursor, and
// normalizes DMs and connection-request messages to `InboundMessage`.
// Unipile keeps attendee names on the chat object rather than on messages,
// so sender resolution goes through a per-chat attendee map.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::models::{InboundMessage, SourceChannel};

use super::MessageSource;

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_MAX: Duration = Duration::from_secs(30);

const CHATS_PAGE_LIMIT: u32 = 50;
const MESSAGES_PER_CHAT: u32 = 10;

pub struct LinkedInSource {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    db: Arc<Database>,
}

impl LinkedInSource {
    pub fn new(dsn: &str, api_key: &str, db: Arc<Database>) -> Self {
        Self::with_base_url(&format!("https://{dsn}/api/v1"), api_key, db)
    }

    /// Construct against a custom endpoint. Used by tests with a local
    /// mock server.
    pub fn with_base_url(base_url: &str, api_key: &str, db: Arc<Database>) -> Self {
        LinkedInSource {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            db,
        }
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let mut backoff = RETRY_BASE;
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let result = self
                .http
                .get(&url)
                .header("X-API-KEY", &self.api_key)
                .header("accept", "application/json")
                .query(query)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    return resp
                        .json::<Value>()
                        .await
                        .context("failed to decode Unipile response body");
                }
                Ok(resp) => {
                    let status = resp.status();
                    warn!(status = status.as_u16(), attempt, url = %url, "unipile request failed");
                    last_error = Some(anyhow!("unipile returned {status} for {path}"));
                }
                Err(e) => {
                    warn!(error = %e, attempt, "unipile request error");
                    last_error = Some(anyhow!(e).context("unipile request failed"));
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_MAX);
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("unipile request failed")))
    }

    /// All connected LinkedIn accounts. Empty on failure so polling can fall
    /// back to the global cursor.
    async fn fetch_accounts(&self) -> Vec<String> {
        match self.get_json("/accounts", &[]).await {
            Ok(data) => {
                let accounts: Vec<String> = items(&data)
                    .iter()
                    .filter_map(|a| a["id"].as_str().map(str::to_string))
                    .collect();
                info!(count = accounts.len(), "unipile accounts fetched");
                accounts
            }
            Err(e) => {
                warn!(error = %e, "failed to fetch unipile accounts");
                Vec::new()
            }
        }
    }

    /// Poll chats for one account (or all accounts when `None`), advancing
    /// that account's cursor.
    async fn poll_account(&self, account_id: Option<&str>) -> Result<Vec<InboundMessage>> {
        let state_key = match account_id {
            Some(id) => format!("linkedin_{id}"),
            None => "linkedin".to_string(),
        };
        let cursor = self
            .db
            .get_source_state(&state_key)?
            .and_then(|s| s.cursor);

        let mut query = vec![("limit", CHATS_PAGE_LIMIT.to_string())];
        if let Some(cursor) = &cursor {
            query.push(("cursor", cursor.clone()));
        }
        if let Some(id) = account_id {
            query.push(("account_id", id.to_string()));
        }

        let data = self.get_json("/chats", &query).await?;
        let chats = items(&data);
        let new_cursor = data["cursor"]
            .as_str()
            .or(data["next_cursor"].as_str())
            .map(str::to_string);

        let mut messages = Vec::new();
        for chat in &chats {
            match self.fetch_chat_messages(chat, account_id).await {
                Ok(chat_messages) => messages.extend(chat_messages),
                Err(e) => {
                    warn!(chat_id = chat["id"].as_str().unwrap_or_default(), error = %e,
                          "failed to fetch chat messages");
                }
            }
        }

        self.db
            .save_source_state(&state_key, new_cursor.as_deref(), None)?;

        Ok(messages)
    }

    /// Fetch and normalize the recent messages of one chat, skipping our own
    /// messages and anything already processed.
    async fn fetch_chat_messages(
        &self,
        chat: &Value,
        account_id: Option<&str>,
    ) -> Result<Vec<InboundMessage>> {
        let chat_id = chat["id"].as_str().unwrap_or_default().to_string();
        let chat_account_id = account_id
            .map(str::to_string)
            .or_else(|| chat["account_id"].as_str().map(str::to_string))
            .unwrap_or_default();

        let data = self
            .get_json(
                &format!("/chats/{chat_id}/messages"),
                &[("limit", MESSAGES_PER_CHAT.to_string())],
            )
            .await?;
        let chat_messages = items(&data);

        let thread_context = build_thread_context(chat, &chat_messages);

        let mut messages = Vec::new();
        for msg in &chat_messages {
            let Some(msg_id) = msg["id"].as_str() else {
                continue;
            };
            if self.db.is_message_processed(SourceChannel::LinkedIn, msg_id)? {
                continue;
            }
            if msg["is_sender"].as_bool().unwrap_or(false) || msg["direction"] == "outbound" {
                continue;
            }
            if let Some(inbound) =
                normalize_message(chat, msg, &chat_id, &thread_context, &chat_account_id)
            {
                messages.push(inbound);
            }
        }
        Ok(messages)
    }
}

#[async_trait]
impl MessageSource for LinkedInSource {
    fn name(&self) -> &'static str {
        "linkedin"
    }

    async fn poll(&self) -> Result<Vec<InboundMessage>> {
        let accounts = self.fetch_accounts().await;
        if accounts.is_empty() {
            return self.poll_account(None).await;
        }

        let mut messages = Vec::new();
        for account_id in &accounts {
            match self.poll_account(Some(account_id)).await {
                Ok(account_msgs) => messages.extend(account_msgs),
                Err(e) => warn!(account_id = %account_id, error = %e, "account poll failed"),
            }
        }
        debug!(message_count = messages.len(), "linkedin poll complete");
        Ok(messages)
    }

    async fn is_available(&self) -> bool {
        match self.get_json("/accounts", &[]).await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "linkedin health check failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Normalization helpers
// ---------------------------------------------------------------------------

/// Unipile wraps lists as `items` or `data` depending on the endpoint.
fn items(data: &Value) -> Vec<Value> {
    data["items"]
        .as_array()
        .or(data["data"].as_array())
        .cloned()
        .unwrap_or_default()
}

fn attendee<'a>(chat: &'a Value, attendee_id: &str) -> Option<&'a Value> {
    chat["attendees"]
        .as_array()?
        .iter()
        .find(|a| a["id"].as_str() == Some(attendee_id))
}

/// Sender display name with fallback chain: attendee display_name, name,
/// first+last, then the message's own sender object, then "Unknown".
fn resolve_sender_name(chat: &Value, msg: &Value) -> String {
    let sender_id = msg["sender_id"].as_str().unwrap_or_default();
    if let Some(att) = attendee(chat, sender_id) {
        for key in ["display_name", "name"] {
            if let Some(name) = att[key].as_str() {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
        let first = att["first_name"].as_str().unwrap_or_default();
        let last = att["last_name"].as_str().unwrap_or_default();
        let joined = format!("{first} {last}").trim().to_string();
        if !joined.is_empty() {
            return joined;
        }
    }
    for key in ["name", "display_name"] {
        if let Some(name) = msg["sender"][key].as_str() {
            if !name.is_empty() {
                return name.to_string();
            }
        }
    }
    "Unknown".to_string()
}

fn attendee_or_sender_field(chat: &Value, msg: &Value, keys: &[&str]) -> String {
    let sender_id = msg["sender_id"].as_str().unwrap_or_default();
    if let Some(att) = attendee(chat, sender_id) {
        for key in keys {
            if let Some(value) = att[*key].as_str() {
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }
    }
    for key in keys {
        if let Some(value) = msg["sender"][*key].as_str() {
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    String::new()
}

/// Render recent chat turns oldest first as `Name: text` lines.
fn build_thread_context(chat: &Value, chat_messages: &[Value]) -> String {
    let mut parts = Vec::with_capacity(chat_messages.len());
    for msg in chat_messages.iter().rev() {
        let sender_name = resolve_sender_name(chat, msg);
        let body = msg["text"].as_str().or(msg["body"].as_str()).unwrap_or_default();
        parts.push(format!("{sender_name}: {body}"));
    }
    parts.join("\n---\n")
}

fn parse_timestamp(msg: &Value) -> DateTime<Utc> {
    let raw = if !msg["created_at"].is_null() {
        &msg["created_at"]
    } else {
        &msg["timestamp"]
    };
    if let Some(epoch) = raw.as_i64() {
        if let Some(dt) = DateTime::<Utc>::from_timestamp(epoch, 0) {
            return dt;
        }
    }
    if let Some(text) = raw.as_str() {
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return dt.with_timezone(&Utc);
        }
    }
    Utc::now()
}

fn normalize_message(
    chat: &Value,
    msg: &Value,
    chat_id: &str,
    thread_context: &str,
    account_id: &str,
) -> Option<InboundMessage> {
    let msg_id = msg["id"].as_str()?;
    let body = msg["text"].as_str().or(msg["body"].as_str())?;
    if body.is_empty() {
        return None;
    }

    let sender_name = resolve_sender_name(chat, msg);
    let linkedin_url = attendee_or_sender_field(chat, msg, &["profile_url", "linkedin_url"]);
    let email = attendee_or_sender_field(chat, msg, &["email"]);
    let headline = attendee_or_sender_field(chat, msg, &["headline"]);
    let (title, company) = parse_headline(&headline);

    let is_connection_request =
        msg["type"] == "connection_request" || chat_id.starts_with("conn_");

    let mut inbound = InboundMessage::new(
        SourceChannel::LinkedIn,
        msg_id,
        sender_name,
        body,
        parse_timestamp(msg),
    );
    inbound.sender_email = email;
    inbound.sender_linkedin_url = linkedin_url;
    inbound.sender_title = if title.is_empty() { headline } else { title };
    inbound.sender_company = company;
    inbound.thread_context = thread_context.to_string();
    inbound.is_connection_request = is_connection_request;
    inbound.thread_id = chat_id.to_string();
    inbound.account_id = account_id.to_string();
    Some(inbound)
}

/// Split a LinkedIn headline into `(title, company)`.
///
/// Handles "CEO at Acme Corp", "VP Sales | Growth Co", and
/// "Founder & CEO, Startup Inc.". An unsplittable headline comes back as
/// the title with an empty company.
pub(crate) fn parse_headline(headline: &str) -> (String, String) {
    if headline.is_empty() {
        return (String::new(), String::new());
    }

    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"(?i)^(.+?)\s+(?:at|@)\s+(.+)$",
            r"^(.+?)\s*[|\u{2013}\u{2014}-]\s*(.+)$",
            r"^(.+?),\s+(.+)$",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    });

    for re in patterns {
        if let Some(caps) = re.captures(headline) {
            return (
                caps[1].trim().to_string(),
                caps[2].trim().to_string(),
            );
        }
    }
    (headline.to_string(), String::new())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn headline_title_at_company() {
        assert_eq!(
            parse_headline("CEO at Acme Corp"),
            ("CEO".to_string(), "Acme Corp".to_string())
        );
        assert_eq!(
            parse_headline("Head of Growth @ Beta"),
            ("Head of Growth".to_string(), "Beta".to_string())
        );
    }

    #[test]
    fn headline_separator_variants() {
        assert_eq!(
            parse_headline("VP Sales | Growth Company"),
            ("VP Sales".to_string(), "Growth Company".to_string())
        );
        assert_eq!(
            parse_headline("CTO - DevTools Inc"),
            ("CTO".to_string(), "DevTools Inc".to_string())
        );
        assert_eq!(
            parse_headline("Founder & CEO, Startup Inc."),
            ("Founder & CEO".to_string(), "Startup Inc.".to_string())
        );
    }

    #[test]
    fn headline_unsplittable_is_title_only() {
        assert_eq!(
            parse_headline("Building things"),
            ("Building things".to_string(), String::new())
        );
        assert_eq!(parse_headline(""), (String::new(), String::new()));
    }

    fn sample_chat() -> Value {
        json!({
            "id": "chat_1",
            "account_id": "acc_9",
            "attendees": [
                {
                    "id": "att_1",
                    "display_name": "Sarah Chen",
                    "profile_url": "https://linkedin.com/in/sarahchen",
                    "headline": "VP Engineering at Acme",
                },
                { "id": "att_2", "first_name": "Li", "last_name": "Wu" },
            ],
        })
    }

    #[test]
    fn sender_name_fallback_chain() {
        let chat = sample_chat();
        assert_eq!(
            resolve_sender_name(&chat, &json!({ "sender_id": "att_1" })),
            "Sarah Chen"
        );
        assert_eq!(
            resolve_sender_name(&chat, &json!({ "sender_id": "att_2" })),
            "Li Wu"
        );
        assert_eq!(
            resolve_sender_name(
                &chat,
                &json!({ "sender_id": "nope", "sender": { "name": "From Message" } })
            ),
            "From Message"
        );
        assert_eq!(
            resolve_sender_name(&chat, &json!({ "sender_id": "nope" })),
            "Unknown"
        );
    }

    #[test]
    fn thread_context_is_oldest_first() {
        let chat = sample_chat();
        // API returns newest first
        let msgs = vec![
            json!({ "sender_id": "att_2", "text": "newest" }),
            json!({ "sender_id": "att_1", "text": "oldest" }),
        ];
        let context = build_thread_context(&chat, &msgs);
        assert_eq!(context, "Sarah Chen: oldest\n---\nLi Wu: newest");
    }

    #[test]
    fn normalize_fills_profile_fields() {
        let chat = sample_chat();
        let msg = json!({
            "id": "msg_1",
            "sender_id": "att_1",
            "text": "Hi, interested in your product",
            "timestamp": "2026-08-20T10:00:00Z",
        });
        let inbound = normalize_message(&chat, &msg, "chat_1", "ctx", "acc_9").unwrap();
        assert_eq!(inbound.source, SourceChannel::LinkedIn);
        assert_eq!(inbound.sender_name, "Sarah Chen");
        assert_eq!(inbound.sender_linkedin_url, "https://linkedin.com/in/sarahchen");
        assert_eq!(inbound.sender_title, "VP Engineering");
        assert_eq!(inbound.sender_company, "Acme");
        assert_eq!(inbound.thread_id, "chat_1");
        assert_eq!(inbound.account_id, "acc_9");
        assert!(!inbound.is_connection_request);
    }

    #[test]
    fn normalize_skips_empty_body() {
        let chat = sample_chat();
        assert!(normalize_message(
            &chat,
            &json!({ "id": "m", "sender_id": "att_1", "text": "" }),
            "chat_1",
            "",
            ""
        )
        .is_none());
        assert!(normalize_message(
            &chat,
            &json!({ "sender_id": "att_1", "text": "no id" }),
            "chat_1",
            "",
            ""
        )
        .is_none());
    }

    #[test]
    fn connection_request_detection() {
        let chat = sample_chat();
        let typed = json!({
            "id": "m1", "sender_id": "att_1", "text": "hi", "type": "connection_request",
        });
        assert!(normalize_message(&chat, &typed, "chat_1", "", "")
            .unwrap()
            .is_connection_request);

        let by_chat_id = json!({ "id": "m2", "sender_id": "att_1", "text": "hi" });
        assert!(normalize_message(&chat, &by_chat_id, "conn_42", "", "")
            .unwrap()
            .is_connection_request);
    }

    #[test]
    fn timestamp_epoch_and_iso() {
        let epoch = parse_timestamp(&json!({ "timestamp": 1700000000 }));
        assert_eq!(epoch.timestamp(), 1700000000);
        let iso = parse_timestamp(&json!({ "created_at": "2026-08-20T10:00:00Z" }));
        assert_eq!(iso.to_rfc3339(), "2026-08-20T10:00:00+00:00");
    }

    #[test]
    fn items_accepts_both_wrappers() {
        assert_eq!(items(&json!({ "items": [1, 2] })).len(), 2);
        assert_eq!(items(&json!({ "data": [1] })).len(), 1);
        assert!(items(&json!({})).is_empty());
    }
}
