// Airtable REST client: the system of record for contacts, messages, and
// the audit trail.
//
// Three tables live in one base: Contacts, Messages (linked to Contacts),
// and Audit Log. All requests go through a shared throttle (Airtable allows
// 5 requests/second per base) and a retry loop with exponential backoff.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::crm::{Crm, EditedMessage};
use crate::models::{
    AuditLogEntry, ContactRecord, ConversationStage, LeadCategory, MessageDirection,
    MessageRecord, MessageStatus, SourceChannel,
};

const AIRTABLE_API_URL: &str = "https://api.airtable.com/v0";

pub const CONTACTS_TABLE: &str = "Contacts";
pub const MESSAGES_TABLE: &str = "Messages";
pub const AUDIT_TABLE: &str = "Audit Log";

/// Minimum spacing between requests: 5 rps per base.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(200);

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(16);

pub struct AirtableCrm {
    http: reqwest::Client,
    api_key: String,
    base_id: String,
    api_url: String,
    /// Timestamp of the last request issued, for the rate throttle.
    last_request: tokio::sync::Mutex<Option<Instant>>,
}

impl AirtableCrm {
    pub fn new(api_key: &str, base_id: &str) -> Self {
        Self::with_api_url(api_key, base_id, AIRTABLE_API_URL)
    }

    /// Construct against a custom endpoint. Used by tests with a local
    /// mock server.
    pub fn with_api_url(api_key: &str, base_id: &str, api_url: &str) -> Self {
        AirtableCrm {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            base_id: base_id.to_string(),
            api_url: api_url.trim_end_matches('/').to_string(),
            last_request: tokio::sync::Mutex::new(None),
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!(
            "{}/{}/{}",
            self.api_url,
            self.base_id,
            urlencode(table)
        )
    }

    fn record_url(&self, table: &str, record_id: &str) -> String {
        format!("{}/{}", self.table_url(table), record_id)
    }

    /// Wait out the per-base request throttle.
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < MIN_REQUEST_INTERVAL {
                tokio::time::sleep(MIN_REQUEST_INTERVAL - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    /// Issue a request, retrying on 429, 5xx, and transport errors with
    /// exponential backoff. `build` constructs a fresh request per attempt.
    async fn send_with_retry<F>(&self, build: F) -> Result<Value>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut backoff = BACKOFF_BASE;
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            self.throttle().await;

            let request = build(&self.http)
                .bearer_auth(&self.api_key)
                .header("Content-Type", "application/json");

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp
                            .json::<Value>()
                            .await
                            .context("failed to decode Airtable response body");
                    }
                    let body = resp.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(
                            status = status.as_u16(),
                            attempt, "airtable request throttled or failed, retrying"
                        );
                        last_error = Some(anyhow!(
                            "airtable returned {status}: {}",
                            extract_error_message(&body)
                        ));
                    } else {
                        bail!(
                            "airtable returned {status}: {}",
                            extract_error_message(&body)
                        );
                    }
                }
                Err(e) => {
                    warn!(error = %e, attempt, "airtable request error, retrying");
                    last_error = Some(anyhow!(e).context("airtable request failed"));
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_MAX);
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("airtable request failed")))
    }

    /// List all records in `table` matching `formula`, following pagination
    /// offsets. Records come back as `(id, fields, created_time)` triples.
    async fn list_all(
        &self,
        table: &str,
        formula: Option<&str>,
    ) -> Result<Vec<(String, Value, String)>> {
        let mut records = Vec::new();
        let mut offset: Option<String> = None;

        loop {
            let url = self.table_url(table);
            let formula_owned = formula.map(str::to_string);
            let offset_owned = offset.clone();
            let page = self
                .send_with_retry(move |http| {
                    let mut req = http.get(&url);
                    if let Some(f) = &formula_owned {
                        req = req.query(&[("filterByFormula", f.as_str())]);
                    }
                    if let Some(o) = &offset_owned {
                        req = req.query(&[("offset", o.as_str())]);
                    }
                    req
                })
                .await?;

            for record in page["records"].as_array().into_iter().flatten() {
                let id = record["id"].as_str().unwrap_or_default().to_string();
                let created = record["createdTime"].as_str().unwrap_or_default().to_string();
                records.push((id, record["fields"].clone(), created));
            }

            match page["offset"].as_str() {
                Some(next) => offset = Some(next.to_string()),
                None => break,
            }
        }

        Ok(records)
    }

    /// First record matching `formula`, or `None`.
    async fn find_first(
        &self,
        table: &str,
        formula: &str,
    ) -> Result<Option<(String, Value)>> {
        let url = self.table_url(table);
        let formula_owned = formula.to_string();
        let page = self
            .send_with_retry(move |http| {
                http.get(&url)
                    .query(&[("filterByFormula", formula_owned.as_str())])
                    .query(&[("maxRecords", "1")])
            })
            .await?;

        let record = page["records"].as_array().and_then(|r| r.first());
        Ok(record.map(|r| {
            (
                r["id"].as_str().unwrap_or_default().to_string(),
                r["fields"].clone(),
            )
        }))
    }

    async fn create_record(&self, table: &str, fields: Value) -> Result<(String, Value)> {
        let url = self.table_url(table);
        let body = json!({ "records": [{ "fields": fields }] });
        let resp = self
            .send_with_retry(move |http| http.post(&url).json(&body))
            .await?;
        let record = resp["records"]
            .as_array()
            .and_then(|r| r.first())
            .ok_or_else(|| anyhow!("airtable create returned no records"))?;
        Ok((
            record["id"]
                .as_str()
                .ok_or_else(|| anyhow!("airtable create returned record without id"))?
                .to_string(),
            record["fields"].clone(),
        ))
    }

    async fn update_record(&self, table: &str, record_id: &str, fields: Value) -> Result<()> {
        let url = self.record_url(table, record_id);
        let body = json!({ "fields": fields });
        self.send_with_retry(move |http| http.patch(&url).json(&body))
            .await?;
        Ok(())
    }

    async fn get_record(&self, table: &str, record_id: &str) -> Result<Option<(String, Value)>> {
        let url = self.record_url(table, record_id);
        match self.send_with_retry(move |http| http.get(&url)).await {
            Ok(record) => Ok(record["id"].as_str().map(|id| {
                (id.to_string(), record["fields"].clone())
            })),
            // A deleted or unknown record id surfaces as a 404 model error
            Err(e) if e.to_string().contains("404") => Ok(None),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Schema management
    // ------------------------------------------------------------------

    /// Create any missing tables and fields via the metadata API. Existing
    /// tables and fields are left untouched.
    pub async fn ensure_schema(&self) -> Result<()> {
        let meta_url = format!("{}/meta/bases/{}/tables", self.api_url, self.base_id);
        let url = meta_url.clone();
        let existing = self
            .send_with_retry(move |http| http.get(&url))
            .await
            .context("failed to read base schema; check the API key has schema access")?;

        let mut table_ids = std::collections::HashMap::new();
        let mut table_fields: std::collections::HashMap<String, Vec<String>> =
            std::collections::HashMap::new();
        for table in existing["tables"].as_array().into_iter().flatten() {
            let name = table["name"].as_str().unwrap_or_default().to_string();
            let id = table["id"].as_str().unwrap_or_default().to_string();
            let fields = table["fields"]
                .as_array()
                .into_iter()
                .flatten()
                .filter_map(|f| f["name"].as_str().map(str::to_string))
                .collect();
            table_ids.insert(name.clone(), id);
            table_fields.insert(name, fields);
        }

        // Contacts first: the other tables link to it.
        if !table_ids.contains_key(CONTACTS_TABLE) {
            let id = self
                .create_table(&meta_url, CONTACTS_TABLE, contact_field_specs())
                .await?;
            info!(table = CONTACTS_TABLE, "created CRM table");
            table_ids.insert(CONTACTS_TABLE.to_string(), id);
            table_fields.insert(CONTACTS_TABLE.to_string(), vec![]);
        }
        let contacts_id = table_ids[CONTACTS_TABLE].clone();

        for (table, specs) in [
            (MESSAGES_TABLE, message_field_specs(&contacts_id)),
            (AUDIT_TABLE, audit_field_specs(&contacts_id)),
        ] {
            match table_ids.get(table) {
                None => {
                    self.create_table(&meta_url, table, specs).await?;
                    info!(table, "created CRM table");
                }
                Some(table_id) => {
                    let have = table_fields.get(table).cloned().unwrap_or_default();
                    for spec in specs {
                        let name = spec["name"].as_str().unwrap_or_default();
                        if have.iter().any(|f| f == name) {
                            continue;
                        }
                        // The primary field always exists; skip it for
                        // pre-existing tables.
                        if have.is_empty() {
                            continue;
                        }
                        let field_url = format!(
                            "{}/meta/bases/{}/tables/{}/fields",
                            self.api_url, self.base_id, table_id
                        );
                        let body = spec.clone();
                        self.send_with_retry(move |http| http.post(&field_url).json(&body))
                            .await
                            .with_context(|| format!("failed to create field {name} in {table}"))?;
                        info!(table, field = name, "created CRM field");
                    }
                }
            }
        }

        // Same missing-field pass for a pre-existing Contacts table.
        if let Some(have) = table_fields.get(CONTACTS_TABLE) {
            if !have.is_empty() {
                for spec in contact_field_specs() {
                    let name = spec["name"].as_str().unwrap_or_default();
                    if have.iter().any(|f| f == name) {
                        continue;
                    }
                    let field_url = format!(
                        "{}/meta/bases/{}/tables/{}/fields",
                        self.api_url, self.base_id, contacts_id
                    );
                    let body = spec.clone();
                    self.send_with_retry(move |http| http.post(&field_url).json(&body))
                        .await
                        .with_context(|| {
                            format!("failed to create field {name} in {CONTACTS_TABLE}")
                        })?;
                    info!(table = CONTACTS_TABLE, field = name, "created CRM field");
                }
            }
        }

        Ok(())
    }

    async fn create_table(
        &self,
        meta_url: &str,
        name: &str,
        fields: Vec<Value>,
    ) -> Result<String> {
        let url = meta_url.to_string();
        let body = json!({ "name": name, "fields": fields });
        let resp = self
            .send_with_retry(move |http| http.post(&url).json(&body))
            .await
            .with_context(|| format!("failed to create table {name}"))?;
        resp["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("table create response missing id"))
    }
}

// ---------------------------------------------------------------------------
// Crm trait implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl Crm for AirtableCrm {
    async fn create_contact(&self, fields: Value) -> Result<ContactRecord> {
        let (id, fields) = self.create_record(CONTACTS_TABLE, fields).await?;
        debug!(contact_id = %id, "created contact");
        Ok(contact_from_record(&id, &fields))
    }

    async fn update_contact(&self, contact_id: &str, fields: Value) -> Result<()> {
        self.update_record(CONTACTS_TABLE, contact_id, fields).await
    }

    async fn get_contact(&self, contact_id: &str) -> Result<Option<ContactRecord>> {
        let record = self.get_record(CONTACTS_TABLE, contact_id).await?;
        Ok(record.map(|(id, fields)| contact_from_record(&id, &fields)))
    }

    async fn find_contact_by_email(&self, email: &str) -> Result<Option<ContactRecord>> {
        let formula = format!(
            "LOWER({{Email}}) = '{}'",
            formula_quote(&email.to_lowercase())
        );
        let record = self.find_first(CONTACTS_TABLE, &formula).await?;
        Ok(record.map(|(id, fields)| contact_from_record(&id, &fields)))
    }

    async fn find_contact_by_linkedin_url(&self, url: &str) -> Result<Option<ContactRecord>> {
        let formula = format!("{{LinkedIn URL}} = '{}'", formula_quote(url));
        let record = self.find_first(CONTACTS_TABLE, &formula).await?;
        Ok(record.map(|(id, fields)| contact_from_record(&id, &fields)))
    }

    async fn find_contacts_by_name(&self, name: &str) -> Result<Vec<ContactRecord>> {
        let formula = format!(
            "LOWER({{Name}}) = '{}'",
            formula_quote(&name.to_lowercase())
        );
        let records = self.list_all(CONTACTS_TABLE, Some(&formula)).await?;
        Ok(records
            .iter()
            .map(|(id, fields, _)| contact_from_record(id, fields))
            .collect())
    }

    async fn get_stale_contacts(&self, days: i64) -> Result<Vec<ContactRecord>> {
        let cutoff = (Utc::now() - ChronoDuration::days(days)).format("%Y-%m-%d");
        let formula = format!(
            "AND(\
             IS_BEFORE({{Last Contact}}, '{cutoff}'), \
             OR({{Follow-Up Status}} = '', {{Follow-Up Status}} = BLANK()), \
             {{Conversation Stage}} != 'Closed Won', \
             {{Conversation Stage}} != 'Closed Lost', \
             {{Lead Category}} != 'Not a Lead')"
        );
        let records = self.list_all(CONTACTS_TABLE, Some(&formula)).await?;
        Ok(records
            .iter()
            .map(|(id, fields, _)| contact_from_record(id, fields))
            .collect())
    }

    async fn get_contacts_for_followup(&self) -> Result<Vec<ContactRecord>> {
        let formula = "AND(\
             {Follow-Up Status} = 'Active', \
             NOT(IS_AFTER({Next Follow-Up Date}, TODAY())))";
        let records = self.list_all(CONTACTS_TABLE, Some(formula)).await?;
        Ok(records
            .iter()
            .map(|(id, fields, _)| contact_from_record(id, fields))
            .collect())
    }

    async fn create_message(&self, record: &MessageRecord) -> Result<String> {
        let fields = message_fields(record);
        let (id, _) = self.create_record(MESSAGES_TABLE, fields).await?;
        debug!(message_id = %id, "created message");
        Ok(id)
    }

    async fn update_message(&self, message_id: &str, fields: Value) -> Result<()> {
        self.update_record(MESSAGES_TABLE, message_id, fields).await
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        let record = self.get_record(MESSAGES_TABLE, message_id).await?;
        Ok(record.map(|(id, fields)| message_from_record(&id, &fields)))
    }

    async fn get_approved_messages(&self) -> Result<Vec<MessageRecord>> {
        let records = self
            .list_all(MESSAGES_TABLE, Some("{Status} = 'Approved'"))
            .await?;
        Ok(records
            .iter()
            .map(|(id, fields, _)| message_from_record(id, fields))
            .collect())
    }

    async fn get_contact_for_message(&self, message_id: &str) -> Result<Option<ContactRecord>> {
        let Some(message) = self.get_message(message_id).await? else {
            return Ok(None);
        };
        if message.contact_id.is_empty() {
            return Ok(None);
        }
        self.get_contact(&message.contact_id).await
    }

    async fn get_messages_for_contact(
        &self,
        contact_id: &str,
        direction: Option<MessageDirection>,
    ) -> Result<Vec<MessageRecord>> {
        let mut formula = format!(
            "SEARCH('{}', ARRAYJOIN({{Contact}}))",
            formula_quote(contact_id)
        );
        if let Some(d) = direction {
            formula = format!("AND({formula}, {{Direction}} = '{}')", d.as_str());
        }
        let mut records = self.list_all(MESSAGES_TABLE, Some(&formula)).await?;
        // Newest first; the API exposes creation time per record.
        records.sort_by(|a, b| b.2.cmp(&a.2));
        Ok(records
            .iter()
            .map(|(id, fields, _)| message_from_record(id, fields))
            .collect())
    }

    async fn find_message_by_source_id(
        &self,
        source_message_id: &str,
    ) -> Result<Option<MessageRecord>> {
        let formula = format!(
            "{{Source Message ID}} = '{}'",
            formula_quote(source_message_id)
        );
        let record = self.find_first(MESSAGES_TABLE, &formula).await?;
        Ok(record.map(|(id, fields)| message_from_record(&id, &fields)))
    }

    async fn find_edited_messages(&self, lookback_days: i64) -> Result<Vec<EditedMessage>> {
        let cutoff = (Utc::now() - ChronoDuration::days(lookback_days)).format("%Y-%m-%d");
        let formula = format!(
            "AND(\
             {{Status}} = 'Sent', \
             {{Edit Distance}} > 0.05, \
             {{AI Draft Version}} != '', \
             IS_AFTER({{Sent At}}, '{cutoff}'))"
        );
        let records = self.list_all(MESSAGES_TABLE, Some(&formula)).await?;

        let mut pairs = Vec::with_capacity(records.len());
        for (_, fields, _) in &records {
            let message = message_from_record("", fields);
            // The lead category lives on the linked contact.
            let mut lead_category = String::new();
            if !message.contact_id.is_empty() {
                if let Some(contact) = self.get_contact(&message.contact_id).await? {
                    if let Some(cat) = contact.lead_category {
                        lead_category = cat.as_str().to_string();
                    }
                }
            }
            pairs.push(EditedMessage {
                ai_draft: message.ai_draft_version,
                human_edit: message.draft_reply,
                channel: message.source.map(|s| s.as_str().to_string()).unwrap_or_default(),
                lead_category,
                edit_distance: message.edit_distance.unwrap_or(0.0),
            });
        }
        Ok(pairs)
    }

    async fn log_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        let mut fields = json!({
            "Action": entry.action,
            "Actor": entry.actor,
        });
        if !entry.details.is_empty() {
            fields["Details"] = json!(entry.details);
        }
        if !entry.trace_id.is_empty() {
            fields["Trace ID"] = json!(entry.trace_id);
        }
        if !entry.message_id.is_empty() {
            fields["Message"] = json!([entry.message_id]);
        }
        if !entry.contact_id.is_empty() {
            fields["Contact"] = json!([entry.contact_id]);
        }
        self.create_record(AUDIT_TABLE, fields).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Record mapping
// ---------------------------------------------------------------------------

fn str_field(fields: &Value, name: &str) -> String {
    fields[name].as_str().unwrap_or_default().to_string()
}

fn f64_field(fields: &Value, name: &str) -> f64 {
    fields[name].as_f64().unwrap_or(0.0)
}

fn i64_field(fields: &Value, name: &str) -> i64 {
    fields[name].as_i64().unwrap_or(0)
}

fn date_field(fields: &Value, name: &str) -> Option<DateTime<Utc>> {
    let raw = fields[name].as_str()?;
    // Airtable date fields come back as either a full timestamp or a
    // bare YYYY-MM-DD.
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn link_field(fields: &Value, name: &str) -> String {
    fields[name]
        .as_array()
        .and_then(|a| a.first())
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

pub(crate) fn contact_from_record(id: &str, fields: &Value) -> ContactRecord {
    ContactRecord {
        id: id.to_string(),
        name: str_field(fields, "Name"),
        email: str_field(fields, "Email"),
        linkedin_url: str_field(fields, "LinkedIn URL"),
        company: str_field(fields, "Company"),
        title: str_field(fields, "Title"),
        source_channel: SourceChannel::parse(&str_field(fields, "Source Channel")),
        lead_category: LeadCategory::parse(&str_field(fields, "Lead Category")),
        conversation_stage: ConversationStage::parse(&str_field(fields, "Conversation Stage")),
        icp_match_score: f64_field(fields, "ICP Match Score"),
        interaction_count: i64_field(fields, "Interaction Count"),
        last_contact: date_field(fields, "Last Contact"),
        last_outbound_at: date_field(fields, "Last Outbound At"),
        enrichment_data: str_field(fields, "Enrichment Data"),
        follow_up_status: str_field(fields, "Follow-Up Status"),
        follow_up_count: i64_field(fields, "Follow-Up Count"),
        next_follow_up_date: date_field(fields, "Next Follow-Up Date"),
        follow_up_channel: str_field(fields, "Follow-Up Channel"),
    }
}

pub(crate) fn message_from_record(id: &str, fields: &Value) -> MessageRecord {
    MessageRecord {
        id: id.to_string(),
        contact_id: link_field(fields, "Contact"),
        direction: MessageDirection::parse(&str_field(fields, "Direction")),
        source: SourceChannel::parse(&str_field(fields, "Source")),
        subject: str_field(fields, "Subject"),
        body: str_field(fields, "Body"),
        status: MessageStatus::parse(&str_field(fields, "Status")),
        draft_reply: str_field(fields, "Draft Reply"),
        ai_draft_version: str_field(fields, "AI Draft Version"),
        strategy_notes: str_field(fields, "Strategy Notes"),
        lead_category: LeadCategory::parse(&str_field(fields, "Lead Category")),
        ai_confidence: f64_field(fields, "AI Confidence"),
        detected_intent: str_field(fields, "Detected Intent"),
        source_message_id: str_field(fields, "Source Message ID"),
        thread_id: str_field(fields, "Thread ID"),
        chat_id: str_field(fields, "Chat ID"),
        account_id: str_field(fields, "Account ID"),
        received_at: date_field(fields, "Received At"),
        sent_at: date_field(fields, "Sent At"),
        edit_distance: fields["Edit Distance"].as_f64(),
        follow_up_number: i64_field(fields, "Follow-Up Number"),
    }
}

/// Build the Airtable field map for a new message record. Empty strings are
/// omitted so Airtable doesn't store blank select options.
pub(crate) fn message_fields(record: &MessageRecord) -> Value {
    let mut fields = json!({});
    if !record.contact_id.is_empty() {
        fields["Contact"] = json!([record.contact_id]);
    }
    if let Some(d) = record.direction {
        fields["Direction"] = json!(d.as_str());
    }
    if let Some(s) = record.source {
        fields["Source"] = json!(s.as_str());
    }
    if let Some(s) = record.status {
        fields["Status"] = json!(s.as_str());
    }
    if let Some(c) = record.lead_category {
        fields["Lead Category"] = json!(c.as_str());
    }
    for (name, value) in [
        ("Subject", &record.subject),
        ("Body", &record.body),
        ("Draft Reply", &record.draft_reply),
        ("AI Draft Version", &record.ai_draft_version),
        ("Strategy Notes", &record.strategy_notes),
        ("Detected Intent", &record.detected_intent),
        ("Source Message ID", &record.source_message_id),
        ("Thread ID", &record.thread_id),
        ("Chat ID", &record.chat_id),
        ("Account ID", &record.account_id),
    ] {
        if !value.is_empty() {
            fields[name] = json!(value);
        }
    }
    if record.ai_confidence > 0.0 {
        fields["AI Confidence"] = json!(record.ai_confidence);
    }
    if record.follow_up_number > 0 {
        fields["Follow-Up Number"] = json!(record.follow_up_number);
    }
    if let Some(received_at) = record.received_at {
        fields["Received At"] = json!(received_at.to_rfc3339());
    }
    if let Some(sent_at) = record.sent_at {
        fields["Sent At"] = json!(sent_at.to_rfc3339());
    }
    if let Some(d) = record.edit_distance {
        fields["Edit Distance"] = json!(d);
    }
    fields
}

// ---------------------------------------------------------------------------
// Schema field specs
// ---------------------------------------------------------------------------

fn select_options(labels: &[&str]) -> Value {
    json!({ "choices": labels.iter().map(|l| json!({"name": l})).collect::<Vec<_>>() })
}

fn contact_field_specs() -> Vec<Value> {
    vec![
        json!({"name": "Name", "type": "singleLineText"}),
        json!({"name": "Email", "type": "email"}),
        json!({"name": "LinkedIn URL", "type": "url"}),
        json!({"name": "Company", "type": "singleLineText"}),
        json!({"name": "Title", "type": "singleLineText"}),
        json!({"name": "Source Channel", "type": "singleSelect",
               "options": select_options(&["Gmail", "LinkedIn", "Both"])}),
        json!({"name": "Lead Category", "type": "singleSelect",
               "options": select_options(&LeadCategory::all_labels())}),
        json!({"name": "Conversation Stage", "type": "singleSelect",
               "options": select_options(&ConversationStage::all_labels())}),
        json!({"name": "ICP Match Score", "type": "number", "options": {"precision": 2}}),
        json!({"name": "AI Confidence", "type": "number", "options": {"precision": 2}}),
        json!({"name": "AI Reasoning", "type": "multilineText"}),
        json!({"name": "Detected Intent", "type": "singleLineText"}),
        json!({"name": "Signal Stack", "type": "multilineText"}),
        json!({"name": "Interaction Count", "type": "number", "options": {"precision": 0}}),
        json!({"name": "First Contact", "type": "dateTime",
               "options": {"dateFormat": {"name": "iso"},
                           "timeFormat": {"name": "24hour"},
                           "timeZone": "utc"}}),
        json!({"name": "Last Contact", "type": "dateTime",
               "options": {"dateFormat": {"name": "iso"},
                           "timeFormat": {"name": "24hour"},
                           "timeZone": "utc"}}),
        json!({"name": "Last Outbound At", "type": "dateTime",
               "options": {"dateFormat": {"name": "iso"},
                           "timeFormat": {"name": "24hour"},
                           "timeZone": "utc"}}),
        json!({"name": "Enrichment Data", "type": "multilineText"}),
        json!({"name": "Follow-Up Status", "type": "singleSelect",
               "options": select_options(&["Active", "Paused", "Exhausted"])}),
        json!({"name": "Follow-Up Count", "type": "number", "options": {"precision": 0}}),
        json!({"name": "Next Follow-Up Date", "type": "date",
               "options": {"dateFormat": {"name": "iso"}}}),
        json!({"name": "Follow-Up Channel", "type": "singleSelect",
               "options": select_options(&["Email", "LinkedIn"])}),
    ]
}

fn message_field_specs(contacts_table_id: &str) -> Vec<Value> {
    vec![
        json!({"name": "Subject", "type": "singleLineText"}),
        json!({"name": "Contact", "type": "multipleRecordLinks",
               "options": {"linkedTableId": contacts_table_id}}),
        json!({"name": "Direction", "type": "singleSelect",
               "options": select_options(&["Inbound", "Outbound"])}),
        json!({"name": "Source", "type": "singleSelect",
               "options": select_options(&["Gmail", "LinkedIn"])}),
        json!({"name": "Body", "type": "multilineText"}),
        json!({"name": "Status", "type": "singleSelect",
               "options": select_options(&MessageStatus::all_labels())}),
        json!({"name": "Draft Reply", "type": "multilineText"}),
        json!({"name": "AI Draft Version", "type": "multilineText"}),
        json!({"name": "Strategy Notes", "type": "multilineText"}),
        json!({"name": "Lead Category", "type": "singleSelect",
               "options": select_options(&LeadCategory::all_labels())}),
        json!({"name": "AI Confidence", "type": "number", "options": {"precision": 2}}),
        json!({"name": "Detected Intent", "type": "singleLineText"}),
        json!({"name": "Source Message ID", "type": "singleLineText"}),
        json!({"name": "Thread ID", "type": "singleLineText"}),
        json!({"name": "Chat ID", "type": "singleLineText"}),
        json!({"name": "Account ID", "type": "singleLineText"}),
        json!({"name": "Received At", "type": "dateTime",
               "options": {"dateFormat": {"name": "iso"},
                           "timeFormat": {"name": "24hour"},
                           "timeZone": "utc"}}),
        json!({"name": "Sent At", "type": "dateTime",
               "options": {"dateFormat": {"name": "iso"},
                           "timeFormat": {"name": "24hour"},
                           "timeZone": "utc"}}),
        json!({"name": "Edit Distance", "type": "number", "options": {"precision": 3}}),
        json!({"name": "Follow-Up Number", "type": "number", "options": {"precision": 0}}),
    ]
}

fn audit_field_specs(contacts_table_id: &str) -> Vec<Value> {
    vec![
        json!({"name": "Action", "type": "singleLineText"}),
        json!({"name": "Actor", "type": "singleLineText"}),
        json!({"name": "Details", "type": "multilineText"}),
        json!({"name": "Trace ID", "type": "singleLineText"}),
        json!({"name": "Contact", "type": "multipleRecordLinks",
               "options": {"linkedTableId": contacts_table_id}}),
        json!({"name": "Timestamp", "type": "createdTime"}),
    ]
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Escape a value for interpolation into a single-quoted formula string.
fn formula_quote(s: &str) -> String {
    s.replace('\'', "\\'")
}

/// Percent-encode a table name for the URL path (spaces in "Audit Log").
fn urlencode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Pull the human-readable error message out of an Airtable error body.
fn extract_error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        if let Some(msg) = value["error"]["message"].as_str() {
            return msg.to_string();
        }
        if let Some(kind) = value["error"]["type"].as_str() {
            return kind.to_string();
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
