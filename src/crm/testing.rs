// In-memory `Crm` fake for unit tests. Stores records in mutex-guarded
// vectors and logs every update so tests can assert on the field maps
// written by the code under test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

use crate::crm::airtable::contact_from_record;
use crate::crm::{Crm, EditedMessage};
use crate::models::{
    AuditLogEntry, ContactRecord, MessageDirection, MessageRecord, MessageStatus,
};

#[derive(Default)]
pub(crate) struct MockCrm {
    pub contacts: Mutex<Vec<ContactRecord>>,
    pub messages: Mutex<Vec<MessageRecord>>,
    /// (contact_id, fields) pairs from `update_contact` calls, in order.
    pub contact_updates: Mutex<Vec<(String, Value)>>,
    /// (message_id, fields) pairs from `update_message` calls, in order.
    pub message_updates: Mutex<Vec<(String, Value)>>,
    pub audit_entries: Mutex<Vec<AuditLogEntry>>,
    /// Canned results for `get_stale_contacts`.
    pub stale_contacts: Mutex<Vec<ContactRecord>>,
    /// Canned results for `get_contacts_for_followup`.
    pub followup_due: Mutex<Vec<ContactRecord>>,
    /// Canned results for `find_edited_messages`.
    pub edited_messages: Mutex<Vec<EditedMessage>>,
    next_id: AtomicU64,
}

impl MockCrm {
    pub fn new() -> Self {
        MockCrm::default()
    }

    pub fn push_contact(&self, contact: ContactRecord) {
        self.contacts.lock().unwrap().push(contact);
    }

    pub fn push_message(&self, message: MessageRecord) {
        self.messages.lock().unwrap().push(message);
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}{n:03}")
    }

    /// Field maps written to `message_id`, merged in call order.
    pub fn merged_message_updates(&self, message_id: &str) -> Value {
        let mut merged = serde_json::json!({});
        for (id, fields) in self.message_updates.lock().unwrap().iter() {
            if id != message_id {
                continue;
            }
            if let Some(map) = fields.as_object() {
                for (k, v) in map {
                    merged[k] = v.clone();
                }
            }
        }
        merged
    }
}

#[async_trait]
impl Crm for MockCrm {
    async fn create_contact(&self, fields: Value) -> Result<ContactRecord> {
        let contact = contact_from_record(&self.fresh_id("recC"), &fields);
        self.contacts.lock().unwrap().push(contact.clone());
        Ok(contact)
    }

    async fn update_contact(&self, contact_id: &str, fields: Value) -> Result<()> {
        self.contact_updates
            .lock()
            .unwrap()
            .push((contact_id.to_string(), fields));
        Ok(())
    }

    async fn get_contact(&self, contact_id: &str) -> Result<Option<ContactRecord>> {
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == contact_id)
            .cloned())
    }

    async fn find_contact_by_email(&self, email: &str) -> Result<Option<ContactRecord>> {
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .iter()
            .find(|c| !c.email.is_empty() && c.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn find_contact_by_linkedin_url(&self, url: &str) -> Result<Option<ContactRecord>> {
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .iter()
            .find(|c| !c.linkedin_url.is_empty() && c.linkedin_url == url)
            .cloned())
    }

    async fn find_contacts_by_name(&self, name: &str) -> Result<Vec<ContactRecord>> {
        Ok(self
            .contacts
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.name.eq_ignore_ascii_case(name))
            .cloned()
            .collect())
    }

    async fn get_stale_contacts(&self, _days: i64) -> Result<Vec<ContactRecord>> {
        Ok(self.stale_contacts.lock().unwrap().clone())
    }

    async fn get_contacts_for_followup(&self) -> Result<Vec<ContactRecord>> {
        Ok(self.followup_due.lock().unwrap().clone())
    }

    async fn create_message(&self, record: &MessageRecord) -> Result<String> {
        let id = self.fresh_id("recM");
        let mut stored = record.clone();
        stored.id = id.clone();
        self.messages.lock().unwrap().push(stored);
        Ok(id)
    }

    async fn update_message(&self, message_id: &str, fields: Value) -> Result<()> {
        self.message_updates
            .lock()
            .unwrap()
            .push((message_id.to_string(), fields));
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> Result<Option<MessageRecord>> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == message_id)
            .cloned())
    }

    async fn get_approved_messages(&self) -> Result<Vec<MessageRecord>> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.status == Some(MessageStatus::Approved))
            .cloned()
            .collect())
    }

    async fn get_contact_for_message(&self, message_id: &str) -> Result<Option<ContactRecord>> {
        let Some(message) = self.get_message(message_id).await? else {
            return Ok(None);
        };
        self.get_contact(&message.contact_id).await
    }

    async fn get_messages_for_contact(
        &self,
        contact_id: &str,
        direction: Option<MessageDirection>,
    ) -> Result<Vec<MessageRecord>> {
        let mut matches: Vec<MessageRecord> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.contact_id == contact_id)
            .filter(|m| direction.is_none() || m.direction == direction)
            .cloned()
            .collect();
        // Newest first, matching the live implementation.
        matches.reverse();
        Ok(matches)
    }

    async fn find_message_by_source_id(
        &self,
        source_message_id: &str,
    ) -> Result<Option<MessageRecord>> {
        Ok(self
            .messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.source_message_id == source_message_id)
            .cloned())
    }

    async fn find_edited_messages(&self, _lookback_days: i64) -> Result<Vec<EditedMessage>> {
        Ok(self.edited_messages.lock().unwrap().clone())
    }

    async fn log_audit(&self, entry: &AuditLogEntry) -> Result<()> {
        self.audit_entries.lock().unwrap().push(entry.clone());
        Ok(())
    }
}
