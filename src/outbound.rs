// Outbound cycle: picks up Approved CRM messages and sends them back
// through the original channel, recording how far the human edited the AI
// draft before approving it.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::crm::Crm;
use crate::models::{AuditAction, AuditLogEntry, ConversationStage, MessageStatus, SourceChannel};
use crate::sending::{SendRequest, Transport};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundStats {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
}

/// Edit distance as a fraction of the longer text, 0.0 for verbatim and 1.0
/// for a complete rewrite. Normalized Levenshtein over characters, rounded
/// to three places.
pub fn compute_edit_distance(original: &str, edited: &str) -> f64 {
    if original.is_empty() && edited.is_empty() {
        return 0.0;
    }
    if original.is_empty() || edited.is_empty() {
        return 1.0;
    }

    let a: Vec<char> = original.chars().collect();
    let b: Vec<char> = edited.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }

    let distance = prev[b.len()] as f64 / a.len().max(b.len()) as f64;
    (distance * 1000.0).round() / 1000.0
}

pub async fn process_approved_messages(
    crm: &Arc<dyn Crm>,
    sender: &Arc<dyn Transport>,
) -> OutboundStats {
    let approved = match crm.get_approved_messages().await {
        Ok(approved) => approved,
        Err(e) => {
            error!(error = %e, "failed to fetch approved messages");
            return OutboundStats::default();
        }
    };
    if approved.is_empty() {
        return OutboundStats::default();
    }

    info!(count = approved.len(), "approved messages found");
    let mut stats = OutboundStats {
        total: approved.len(),
        ..Default::default()
    };

    for message in &approved {
        match send_one(crm, sender, &message.id).await {
            Ok(true) => stats.sent += 1,
            Ok(false) => {}
            Err(e) => {
                error!(message_id = %message.id, error = %e, "send failed");
                stats.failed += 1;
                let update = crm
                    .update_message(
                        &message.id,
                        json!({
                            "Status": MessageStatus::Failed.as_str(),
                            "Send Error": e.to_string(),
                        }),
                    )
                    .await;
                if let Err(update_err) = update {
                    error!(message_id = %message.id, error = %update_err, "failed to mark message failed");
                }
            }
        }
    }

    info!(total = stats.total, sent = stats.sent, failed = stats.failed, "outbound cycle complete");
    stats
}

/// Send one approved message. `Ok(false)` means skipped without sending
/// (status changed, or a terminal problem already recorded on the record).
async fn send_one(
    crm: &Arc<dyn Crm>,
    sender: &Arc<dyn Transport>,
    message_id: &str,
) -> anyhow::Result<bool> {
    // Re-check right before sending; the human may have pulled the approval.
    let Some(current) = crm.get_message(message_id).await? else {
        warn!(message_id, "approved message disappeared");
        return Ok(false);
    };
    if current.status != Some(MessageStatus::Approved) {
        warn!(
            message_id,
            status = current.status.map(|s| s.as_str()).unwrap_or("none"),
            "status changed before send"
        );
        return Ok(false);
    }

    let reply_text = current.draft_reply.clone();
    if reply_text.is_empty() {
        warn!(message_id, "approved message has empty draft");
        crm.update_message(
            message_id,
            json!({
                "Status": MessageStatus::Failed.as_str(),
                "Send Error": "Draft reply is empty",
            }),
        )
        .await?;
        return Ok(false);
    }

    let edit_distance = if current.ai_draft_version.is_empty() {
        None
    } else {
        Some(compute_edit_distance(&current.ai_draft_version, &reply_text))
    };

    let Some(channel) = current.source else {
        anyhow::bail!("approved message has no source channel");
    };

    let contact = crm.get_contact_for_message(message_id).await?;
    let request = match channel {
        SourceChannel::Gmail => {
            let Some(email) = contact.as_ref().map(|c| c.email.clone()).filter(|e| !e.is_empty())
            else {
                warn!(message_id, "no recipient email on linked contact");
                crm.update_message(
                    message_id,
                    json!({
                        "Status": MessageStatus::Failed.as_str(),
                        "Send Error": "No recipient email found on linked contact",
                    }),
                )
                .await?;
                return Ok(false);
            };
            SendRequest {
                to_email: email,
                subject: reply_subject(&current.subject),
                body: reply_text.clone(),
                thread_id: current.thread_id.clone(),
                ..Default::default()
            }
        }
        SourceChannel::LinkedIn => SendRequest {
            body: reply_text.clone(),
            chat_id: if current.chat_id.is_empty() {
                current.thread_id.clone()
            } else {
                current.chat_id.clone()
            },
            ..Default::default()
        },
        SourceChannel::Both => anyhow::bail!("message record has merged source channel"),
    };

    let started = Instant::now();
    sender.send(channel, &request).await?;
    let duration_ms = started.elapsed().as_millis() as i64;

    let mut update = json!({
        "Status": MessageStatus::Sent.as_str(),
        "Sent At": Utc::now().to_rfc3339(),
    });
    if let Some(edit_distance) = edit_distance {
        update["Edit Distance"] = json!(edit_distance);
    }
    crm.update_message(message_id, update).await?;

    if let Some(contact) = &contact {
        let mut contact_updates = json!({
            "Last Outbound At": Utc::now().format("%Y-%m-%d").to_string(),
        });
        if contact.conversation_stage == Some(ConversationStage::New) {
            contact_updates["Conversation Stage"] = json!(ConversationStage::Engaging.as_str());
        }
        crm.update_contact(&contact.id, contact_updates).await?;
    }

    crm.log_audit(
        &AuditLogEntry::new(AuditAction::Sent)
            .with_trace(&format!("out_{message_id}"))
            .with_message(message_id)
            .with_contact(contact.as_ref().map(|c| c.id.as_str()).unwrap_or_default())
            .with_details(
                json!({
                    "channel": channel.as_str(),
                    "edit_distance": edit_distance,
                    "duration_ms": duration_ms,
                })
                .to_string(),
            ),
    )
    .await?;

    info!(
        message_id,
        channel = channel.as_str(),
        edit_distance = ?edit_distance,
        duration_ms,
        "message sent"
    );
    Ok(true)
}

fn reply_subject(subject: &str) -> String {
    if subject.is_empty() {
        "Re:".to_string()
    } else if subject.starts_with("Re:") {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
