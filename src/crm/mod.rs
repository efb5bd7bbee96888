// CRM access: the `Crm` trait seam, the Airtable implementation, and
// cross-channel contact deduplication.

pub mod airtable;
pub mod dedup;
#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{AuditLogEntry, ContactRecord, MessageDirection, MessageRecord};

/// An (AI draft, human edit) pair harvested for the learning cycle.
#[derive(Debug, Clone)]
pub struct EditedMessage {
    pub ai_draft: String,
    pub human_edit: String,
    pub channel: String,
    pub lead_category: String,
    pub edit_distance: f64,
}

/// Operations the rest of the system needs from the CRM. Implemented by
/// [`airtable::AirtableCrm`]; cycles and the pipeline depend on this trait
/// so tests can substitute an in-memory fake.
///
/// Field maps passed to the update methods use the CRM's column labels
/// ("Email", "Lead Category", ...) as keys.
#[async_trait]
pub trait Crm: Send + Sync {
    // --- Contacts ---
    async fn create_contact(&self, fields: serde_json::Value) -> Result<ContactRecord>;
    async fn update_contact(&self, contact_id: &str, fields: serde_json::Value) -> Result<()>;
    async fn get_contact(&self, contact_id: &str) -> Result<Option<ContactRecord>>;
    async fn find_contact_by_email(&self, email: &str) -> Result<Option<ContactRecord>>;
    async fn find_contact_by_linkedin_url(&self, url: &str) -> Result<Option<ContactRecord>>;
    async fn find_contacts_by_name(&self, name: &str) -> Result<Vec<ContactRecord>>;
    /// Contacts with no inbound activity for `days` days, no follow-up
    /// sequence yet, and a conversation still worth pursuing.
    async fn get_stale_contacts(&self, days: i64) -> Result<Vec<ContactRecord>>;
    /// Contacts with an active follow-up sequence due today or earlier.
    async fn get_contacts_for_followup(&self) -> Result<Vec<ContactRecord>>;

    // --- Messages ---
    /// Create a message row; returns the new record id.
    async fn create_message(&self, record: &MessageRecord) -> Result<String>;
    async fn update_message(&self, message_id: &str, fields: serde_json::Value) -> Result<()>;
    async fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>>;
    async fn get_approved_messages(&self) -> Result<Vec<MessageRecord>>;
    async fn get_contact_for_message(&self, message_id: &str) -> Result<Option<ContactRecord>>;
    async fn get_messages_for_contact(
        &self,
        contact_id: &str,
        direction: Option<MessageDirection>,
    ) -> Result<Vec<MessageRecord>>;
    async fn find_message_by_source_id(
        &self,
        source_message_id: &str,
    ) -> Result<Option<MessageRecord>>;
    /// Sent messages from the lookback window where the human materially
    /// edited the AI draft (edit distance above the noise floor).
    async fn find_edited_messages(&self, lookback_days: i64) -> Result<Vec<EditedMessage>>;

    // --- Audit ---
    async fn log_audit(&self, entry: &AuditLogEntry) -> Result<()>;
}
