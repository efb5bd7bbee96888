// Cross-channel contact deduplication.
//
// An inbound message is matched against existing contacts by email first,
// then LinkedIn URL, then exact name. Name matching is skipped for the
// literal "Unknown" so unresolved LinkedIn senders never collapse into one
// record.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::crm::Crm;
use crate::models::{ContactRecord, InboundMessage, SourceChannel};

pub struct ContactDeduplicator {
    crm: Arc<dyn Crm>,
}

impl ContactDeduplicator {
    pub fn new(crm: Arc<dyn Crm>) -> Self {
        ContactDeduplicator { crm }
    }

    /// Find an existing contact matching the message sender, or `None`.
    pub async fn find_existing_contact(
        &self,
        message: &InboundMessage,
    ) -> Result<Option<ContactRecord>> {
        if !message.sender_email.is_empty() {
            if let Some(found) = self.crm.find_contact_by_email(&message.sender_email).await? {
                info!(email = %message.sender_email, contact_id = %found.id, "dedup matched by email");
                return Ok(Some(found));
            }
        }

        if !message.sender_linkedin_url.is_empty() {
            if let Some(found) = self
                .crm
                .find_contact_by_linkedin_url(&message.sender_linkedin_url)
                .await?
            {
                info!(
                    linkedin_url = %message.sender_linkedin_url,
                    contact_id = %found.id,
                    "dedup matched by linkedin url"
                );
                return Ok(Some(found));
            }
        }

        if !message.sender_name.is_empty() && message.sender_name != "Unknown" {
            let candidates = self.crm.find_contacts_by_name(&message.sender_name).await?;
            match candidates.len() {
                0 => {}
                1 => {
                    let found = candidates.into_iter().next().unwrap_or_default();
                    info!(name = %message.sender_name, contact_id = %found.id, "dedup matched by name");
                    return Ok(Some(found));
                }
                count => {
                    if !message.sender_company.is_empty() {
                        for candidate in &candidates {
                            if !candidate.company.is_empty()
                                && candidate
                                    .company
                                    .eq_ignore_ascii_case(&message.sender_company)
                            {
                                info!(
                                    name = %message.sender_name,
                                    company = %message.sender_company,
                                    contact_id = %candidate.id,
                                    "dedup matched by name and company"
                                );
                                return Ok(Some(candidate.clone()));
                            }
                        }
                    }
                    warn!(name = %message.sender_name, count, "ambiguous name match, not merging");
                }
            }
        }

        info!(sender = %message.sender_name, "no existing contact matched");
        Ok(None)
    }

    /// Whether a cross-channel message should flip the contact's source
    /// channel to `Both`.
    pub fn should_update_source_channel(
        &self,
        existing: &ContactRecord,
        message: &InboundMessage,
    ) -> bool {
        match existing.source_channel {
            Some(SourceChannel::Both) | None => false,
            Some(SourceChannel::Gmail) => message.source == SourceChannel::LinkedIn,
            Some(SourceChannel::LinkedIn) => message.source == SourceChannel::Gmail,
        }
    }

    /// Field map to apply to the existing contact. Fills missing identity
    /// fields without overwriting, flips the source channel when the message
    /// crossed channels, and always bumps last contact and the interaction
    /// count.
    pub fn merge_contact_data(
        &self,
        existing: &ContactRecord,
        message: &InboundMessage,
    ) -> Value {
        let mut updates = json!({});

        if existing.email.is_empty() && !message.sender_email.is_empty() {
            updates["Email"] = json!(message.sender_email);
        }
        if existing.linkedin_url.is_empty() && !message.sender_linkedin_url.is_empty() {
            updates["LinkedIn URL"] = json!(message.sender_linkedin_url);
        }
        if existing.company.is_empty() && !message.sender_company.is_empty() {
            updates["Company"] = json!(message.sender_company);
        }
        if existing.title.is_empty() && !message.sender_title.is_empty() {
            updates["Title"] = json!(message.sender_title);
        }

        if self.should_update_source_channel(existing, message) {
            updates["Source Channel"] = json!(SourceChannel::Both.as_str());
        }

        updates["Last Contact"] = json!(message.received_at.format("%Y-%m-%d").to_string());
        updates["Interaction Count"] = json!(existing.interaction_count + 1);

        updates
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
