// Follow-up cadence engine. Runs daily: activates cadences for stale
// leads, drafts due follow-ups, pauses when the lead replied, auto-approves
// once the team has sent AI drafts unchanged, and closes out leads after
// the final touch.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{error, info};

use crate::ai::Draft;
use crate::config::FollowupConfig;
use crate::crm::Crm;
use crate::models::{
    AuditAction, AuditLogEntry, ContactRecord, MessageDirection, MessageRecord, MessageStatus,
    SourceChannel,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FollowupStats {
    pub activated: usize,
    pub drafted: usize,
    pub auto_approved: usize,
    pub paused: usize,
    pub exhausted: usize,
    pub skipped: usize,
}

pub struct FollowupEngine {
    crm: Arc<dyn Crm>,
    drafter: Arc<dyn Draft>,
    config: FollowupConfig,
}

impl FollowupEngine {
    pub fn new(crm: Arc<dyn Crm>, drafter: Arc<dyn Draft>, config: FollowupConfig) -> Self {
        FollowupEngine { crm, drafter, config }
    }

    pub async fn run_cycle(&self) -> Result<FollowupStats> {
        info!("follow-up cycle started");
        let activated = self.activate_stale_leads().await?;
        let mut stats = self.process_due_followups().await?;
        stats.activated = activated;
        info!(
            activated = stats.activated,
            drafted = stats.drafted,
            auto_approved = stats.auto_approved,
            paused = stats.paused,
            exhausted = stats.exhausted,
            skipped = stats.skipped,
            "follow-up cycle complete"
        );
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    async fn activate_stale_leads(&self) -> Result<usize> {
        let stale = self
            .crm
            .get_stale_contacts(self.config.days_before_activation)
            .await?;
        let mut activated = 0;

        for contact in &stale {
            if self.has_recent_inbound(contact).await? {
                continue;
            }

            let channel = if contact.linkedin_url.is_empty() {
                "Email"
            } else {
                "LinkedIn"
            };
            self.crm
                .update_contact(
                    &contact.id,
                    json!({
                        "Follow-Up Status": "Active",
                        "Follow-Up Count": 0,
                        "Next Follow-Up Date": Utc::now().format("%Y-%m-%d").to_string(),
                        "Follow-Up Channel": channel,
                    }),
                )
                .await?;
            activated += 1;
            info!(contact_id = %contact.id, name = %contact.name, channel, "cadence activated");
        }

        Ok(activated)
    }

    // ------------------------------------------------------------------
    // Due follow-ups
    // ------------------------------------------------------------------

    async fn process_due_followups(&self) -> Result<FollowupStats> {
        let due = self.crm.get_contacts_for_followup().await?;
        let mut stats = FollowupStats::default();

        for contact in &due {
            match self.process_contact(contact, &mut stats).await {
                Ok(()) => {}
                Err(e) => {
                    error!(contact_id = %contact.id, error = %e, "follow-up processing failed");
                    stats.skipped += 1;
                }
            }
        }

        Ok(stats)
    }

    async fn process_contact(
        &self,
        contact: &ContactRecord,
        stats: &mut FollowupStats,
    ) -> Result<()> {
        // A reply pauses the cadence.
        if contact.last_outbound_at.is_some() && self.has_recent_inbound(contact).await? {
            self.crm
                .update_contact(&contact.id, json!({ "Follow-Up Status": "Paused" }))
                .await?;
            self.crm
                .log_audit(
                    &AuditLogEntry::new(AuditAction::FollowUpPaused)
                        .with_contact(&contact.id)
                        .with_details(json!({ "reason": "inbound_received" }).to_string()),
                )
                .await?;
            stats.paused += 1;
            return Ok(());
        }

        if self.has_pending_outbound(&contact.id).await? {
            stats.skipped += 1;
            return Ok(());
        }

        let Some(channel) = determine_channel(contact, &self.config) else {
            stats.skipped += 1;
            return Ok(());
        };

        let history = self.conversation_history(&contact.id).await?;
        let followup_number = contact.follow_up_count + 1;

        let draft = self
            .drafter
            .draft_followup(contact, channel, &history, followup_number)
            .await?;

        let auto_approve = self.should_auto_approve(&contact.id).await?;
        let status = if auto_approve {
            MessageStatus::Approved
        } else {
            MessageStatus::DraftReady
        };

        let source = if channel == "LinkedIn" {
            SourceChannel::LinkedIn
        } else {
            SourceChannel::Gmail
        };
        let routing = self.routing_info(&contact.id, source).await?;
        let record = MessageRecord {
            contact_id: contact.id.clone(),
            source: Some(source),
            direction: Some(MessageDirection::Outbound),
            draft_reply: draft.reply_text.clone(),
            ai_draft_version: draft.reply_text.clone(),
            strategy_notes: draft.strategy_notes.clone(),
            status: Some(status),
            thread_id: routing.thread_id,
            chat_id: routing.chat_id,
            account_id: routing.account_id,
            follow_up_number: followup_number,
            ..Default::default()
        };
        let message_id = self.crm.create_message(&record).await?;

        let next_date = (Utc::now() + Duration::days(self.config.days_between))
            .format("%Y-%m-%d")
            .to_string();
        let mut updates = json!({
            "Follow-Up Count": followup_number,
            "Next Follow-Up Date": next_date,
            "Follow-Up Channel": channel,
        });
        if followup_number >= self.config.total_followups {
            updates["Follow-Up Status"] = json!("Exhausted");
            updates["Conversation Stage"] = json!("Closed Lost");
            self.crm
                .log_audit(
                    &AuditLogEntry::new(AuditAction::FollowUpExhausted)
                        .with_contact(&contact.id)
                        .with_details(
                            json!({ "total_followups": followup_number }).to_string(),
                        ),
                )
                .await?;
            stats.exhausted += 1;
        }
        self.crm.update_contact(&contact.id, updates).await?;

        self.crm
            .log_audit(
                &AuditLogEntry::new(AuditAction::FollowUpCreated)
                    .with_contact(&contact.id)
                    .with_message(&message_id)
                    .with_details(
                        json!({
                            "followup_number": followup_number,
                            "channel": channel,
                            "auto_approved": auto_approve,
                        })
                        .to_string(),
                    ),
            )
            .await?;

        if auto_approve {
            stats.auto_approved += 1;
        } else {
            stats.drafted += 1;
        }
        info!(
            contact_id = %contact.id,
            name = %contact.name,
            followup_number,
            channel,
            auto_approve,
            "follow-up created"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checks
    // ------------------------------------------------------------------

    async fn has_recent_inbound(&self, contact: &ContactRecord) -> Result<bool> {
        let Some(since) = contact.last_outbound_at else {
            return Ok(false);
        };
        let inbound = self
            .crm
            .get_messages_for_contact(&contact.id, Some(MessageDirection::Inbound))
            .await?;
        Ok(inbound
            .iter()
            .any(|m| m.received_at.is_some_and(|at| at >= since)))
    }

    async fn has_pending_outbound(&self, contact_id: &str) -> Result<bool> {
        let outbound = self
            .crm
            .get_messages_for_contact(contact_id, Some(MessageDirection::Outbound))
            .await?;
        Ok(outbound.iter().any(|m| {
            matches!(
                m.status,
                Some(MessageStatus::DraftReady) | Some(MessageStatus::Approved)
            )
        }))
    }

    /// True when the last N sent drafts for this contact went out verbatim.
    async fn should_auto_approve(&self, contact_id: &str) -> Result<bool> {
        let threshold = self.config.auto_approve_after_clean_sends;
        if threshold == 0 {
            return Ok(false);
        }
        let outbound = self
            .crm
            .get_messages_for_contact(contact_id, Some(MessageDirection::Outbound))
            .await?;
        let mut sent: Vec<&MessageRecord> = outbound
            .iter()
            .filter(|m| m.status == Some(MessageStatus::Sent) && m.edit_distance.is_some())
            .collect();
        if sent.len() < threshold {
            return Ok(false);
        }
        sent.sort_by_key(|m| std::cmp::Reverse(m.sent_at));
        Ok(sent[..threshold]
            .iter()
            .all(|m| m.edit_distance == Some(0.0)))
    }

    async fn conversation_history(&self, contact_id: &str) -> Result<String> {
        let messages = self.crm.get_messages_for_contact(contact_id, None).await?;
        Ok(format_conversation_history(&messages))
    }

    /// Thread and chat ids from the newest message on the chosen channel so
    /// the follow-up lands in the existing conversation.
    async fn routing_info(&self, contact_id: &str, source: SourceChannel) -> Result<Routing> {
        let messages = self.crm.get_messages_for_contact(contact_id, None).await?;
        let mut channel_messages: Vec<&MessageRecord> = messages
            .iter()
            .filter(|m| m.source == Some(source))
            .filter(|m| !m.thread_id.is_empty() || !m.chat_id.is_empty())
            .collect();
        channel_messages.sort_by_key(|m| std::cmp::Reverse(m.sent_at.or(m.received_at)));

        Ok(match channel_messages.first() {
            Some(latest) => Routing {
                thread_id: latest.thread_id.clone(),
                chat_id: latest.chat_id.clone(),
                account_id: latest.account_id.clone(),
            },
            None => Routing::default(),
        })
    }
}

#[derive(Debug, Default)]
struct Routing {
    thread_id: String,
    chat_id: String,
    account_id: String,
}

/// LinkedIn for the first `linkedin_followups` touches, then email, with
/// fallback to whichever handle the contact actually has.
fn determine_channel(contact: &ContactRecord, config: &FollowupConfig) -> Option<&'static str> {
    let prefer_linkedin = contact.follow_up_count < config.linkedin_followups;
    let has_linkedin = !contact.linkedin_url.is_empty();
    let has_email = !contact.email.is_empty();

    if prefer_linkedin {
        if has_linkedin {
            Some("LinkedIn")
        } else if has_email {
            Some("Email")
        } else {
            None
        }
    } else if has_email {
        Some("Email")
    } else if has_linkedin {
        Some("LinkedIn")
    } else {
        None
    }
}

fn format_conversation_history(messages: &[MessageRecord]) -> String {
    if messages.is_empty() {
        return "No prior messages".to_string();
    }

    let mut ordered: Vec<&MessageRecord> = messages.iter().collect();
    ordered.sort_by_key(|m| m.received_at.or(m.sent_at));

    ordered
        .iter()
        .map(|m| {
            let direction = m.direction.map(|d| d.as_str()).unwrap_or("Unknown");
            let channel = m.source.map(|s| s.as_str()).unwrap_or("Unknown");
            let timestamp = m
                .sent_at
                .or(m.received_at)
                .map(|at| at.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            // Outbound rows carry their text in the draft, inbound in the body.
            let text = if m.direction == Some(MessageDirection::Outbound)
                && !m.draft_reply.is_empty()
            {
                &m.draft_reply
            } else {
                &m.body
            };
            format!("[{timestamp}] {direction} ({channel}): {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
