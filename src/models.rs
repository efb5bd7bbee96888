// Domain model: message sources, lead classification, CRM record shapes.
//
// The string forms of these enums are the wire labels used by the CRM
// (single-select field options) and by the LLM tool schemas, so the
// serde renames and `as_str` values must stay in sync with both.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Channel a message arrived on, or `Both` for a contact seen on both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceChannel {
    Gmail,
    LinkedIn,
    Both,
}

impl SourceChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceChannel::Gmail => "Gmail",
            SourceChannel::LinkedIn => "LinkedIn",
            SourceChannel::Both => "Both",
        }
    }

    pub fn parse(s: &str) -> Option<SourceChannel> {
        match s {
            "Gmail" => Some(SourceChannel::Gmail),
            "LinkedIn" => Some(SourceChannel::LinkedIn),
            "Both" => Some(SourceChannel::Both),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Inbound => "Inbound",
            MessageDirection::Outbound => "Outbound",
        }
    }

    pub fn parse(s: &str) -> Option<MessageDirection> {
        match s {
            "Inbound" => Some(MessageDirection::Inbound),
            "Outbound" => Some(MessageDirection::Outbound),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadCategory {
    Hot,
    Warm,
    Cold,
    #[serde(rename = "Not a Lead")]
    NotALead,
}

impl LeadCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadCategory::Hot => "Hot",
            LeadCategory::Warm => "Warm",
            LeadCategory::Cold => "Cold",
            LeadCategory::NotALead => "Not a Lead",
        }
    }

    pub fn parse(s: &str) -> Option<LeadCategory> {
        match s {
            "Hot" => Some(LeadCategory::Hot),
            "Warm" => Some(LeadCategory::Warm),
            "Cold" => Some(LeadCategory::Cold),
            "Not a Lead" => Some(LeadCategory::NotALead),
            _ => None,
        }
    }

    pub fn all_labels() -> [&'static str; 4] {
        ["Hot", "Warm", "Cold", "Not a Lead"]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationStage {
    New,
    Engaging,
    Qualifying,
    Booking,
    #[serde(rename = "Follow Up")]
    FollowUp,
    Nurture,
    #[serde(rename = "Closed Won")]
    ClosedWon,
    #[serde(rename = "Closed Lost")]
    ClosedLost,
}

impl ConversationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStage::New => "New",
            ConversationStage::Engaging => "Engaging",
            ConversationStage::Qualifying => "Qualifying",
            ConversationStage::Booking => "Booking",
            ConversationStage::FollowUp => "Follow Up",
            ConversationStage::Nurture => "Nurture",
            ConversationStage::ClosedWon => "Closed Won",
            ConversationStage::ClosedLost => "Closed Lost",
        }
    }

    pub fn parse(s: &str) -> Option<ConversationStage> {
        match s {
            "New" => Some(ConversationStage::New),
            "Engaging" => Some(ConversationStage::Engaging),
            "Qualifying" => Some(ConversationStage::Qualifying),
            "Booking" => Some(ConversationStage::Booking),
            "Follow Up" => Some(ConversationStage::FollowUp),
            "Nurture" => Some(ConversationStage::Nurture),
            "Closed Won" => Some(ConversationStage::ClosedWon),
            "Closed Lost" => Some(ConversationStage::ClosedLost),
            _ => None,
        }
    }

    pub fn all_labels() -> [&'static str; 8] {
        [
            "New",
            "Engaging",
            "Qualifying",
            "Booking",
            "Follow Up",
            "Nurture",
            "Closed Won",
            "Closed Lost",
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    New,
    Processing,
    #[serde(rename = "Draft Ready")]
    DraftReady,
    Approved,
    Rejected,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::New => "New",
            MessageStatus::Processing => "Processing",
            MessageStatus::DraftReady => "Draft Ready",
            MessageStatus::Approved => "Approved",
            MessageStatus::Rejected => "Rejected",
            MessageStatus::Sent => "Sent",
            MessageStatus::Failed => "Failed",
        }
    }

    pub fn parse(s: &str) -> Option<MessageStatus> {
        match s {
            "New" => Some(MessageStatus::New),
            "Processing" => Some(MessageStatus::Processing),
            "Draft Ready" => Some(MessageStatus::DraftReady),
            "Approved" => Some(MessageStatus::Approved),
            "Rejected" => Some(MessageStatus::Rejected),
            "Sent" => Some(MessageStatus::Sent),
            "Failed" => Some(MessageStatus::Failed),
            _ => None,
        }
    }

    pub fn all_labels() -> [&'static str; 7] {
        [
            "New",
            "Processing",
            "Draft Ready",
            "Approved",
            "Rejected",
            "Sent",
            "Failed",
        ]
    }
}

/// Actions recorded in the audit trail (CRM table and local SQLite).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    MessageReceived,
    ContactCreated,
    ContactUpdated,
    Classified,
    DraftCreated,
    Approved,
    Rejected,
    Sent,
    AutoAccepted,
    AutoRejected,
    Enriched,
    FollowUpCreated,
    FollowUpPaused,
    FollowUpExhausted,
    LearningCycle,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::MessageReceived => "message_received",
            AuditAction::ContactCreated => "contact_created",
            AuditAction::ContactUpdated => "contact_updated",
            AuditAction::Classified => "classified",
            AuditAction::DraftCreated => "draft_created",
            AuditAction::Approved => "approved",
            AuditAction::Rejected => "rejected",
            AuditAction::Sent => "sent",
            AuditAction::AutoAccepted => "auto_accepted",
            AuditAction::AutoRejected => "auto_rejected",
            AuditAction::Enriched => "enriched",
            AuditAction::FollowUpCreated => "follow_up_created",
            AuditAction::FollowUpPaused => "follow_up_paused",
            AuditAction::FollowUpExhausted => "follow_up_exhausted",
            AuditAction::LearningCycle => "learning_cycle",
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound message
// ---------------------------------------------------------------------------

/// A normalized inbound message from any source channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub source: SourceChannel,
    /// Provider message id, unique within the source.
    pub source_message_id: String,
    pub sender_name: String,
    #[serde(default)]
    pub sender_email: String,
    #[serde(default)]
    pub sender_linkedin_url: String,
    #[serde(default)]
    pub sender_company: String,
    #[serde(default)]
    pub sender_title: String,
    #[serde(default)]
    pub subject: String,
    pub body: String,
    /// Earlier turns in the conversation, oldest first, joined with "\n---\n".
    #[serde(default)]
    pub thread_context: String,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub is_connection_request: bool,
    /// Gmail thread id or Unipile chat id, used for reply routing.
    #[serde(default)]
    pub thread_id: String,
    /// Unipile account the message arrived through (LinkedIn only).
    #[serde(default)]
    pub account_id: String,
}

impl InboundMessage {
    pub fn new(
        source: SourceChannel,
        source_message_id: impl Into<String>,
        sender_name: impl Into<String>,
        body: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        InboundMessage {
            source,
            source_message_id: source_message_id.into(),
            sender_name: sender_name.into(),
            sender_email: String::new(),
            sender_linkedin_url: String::new(),
            sender_company: String::new(),
            sender_title: String::new(),
            subject: String::new(),
            body: body.into(),
            thread_context: String::new(),
            received_at,
            is_connection_request: false,
            thread_id: String::new(),
            account_id: String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// AI outputs
// ---------------------------------------------------------------------------

/// Structured classification returned by the lead classifier tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadClassification {
    pub category: LeadCategory,
    /// 0.0 to 1.0.
    pub confidence: f64,
    pub reasoning: String,
    pub detected_intent: String,
    #[serde(default)]
    pub detected_signals: Vec<String>,
    pub should_reply: bool,
    pub conversation_stage: ConversationStage,
    /// How well the sender matches the ICP, 0.0 to 1.0.
    #[serde(default)]
    pub icp_match_score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DraftReply {
    pub reply_text: String,
    pub strategy_notes: String,
}

/// Accept/reject verdict for a LinkedIn connection request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEvaluation {
    pub accept: bool,
    pub reasoning: String,
    pub lead_category: LeadCategory,
    /// 0.0 to 1.0.
    pub confidence: f64,
}

// ---------------------------------------------------------------------------
// CRM records
// ---------------------------------------------------------------------------

/// A contact row as read from the CRM.
#[derive(Debug, Clone, Default)]
pub struct ContactRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    pub linkedin_url: String,
    pub company: String,
    pub title: String,
    pub source_channel: Option<SourceChannel>,
    pub lead_category: Option<LeadCategory>,
    pub conversation_stage: Option<ConversationStage>,
    pub icp_match_score: f64,
    pub interaction_count: i64,
    pub last_contact: Option<DateTime<Utc>>,
    pub last_outbound_at: Option<DateTime<Utc>>,
    pub enrichment_data: String,
    pub follow_up_status: String,
    pub follow_up_count: i64,
    pub next_follow_up_date: Option<DateTime<Utc>>,
    pub follow_up_channel: String,
}

/// A message row as written to / read from the CRM.
#[derive(Debug, Clone, Default)]
pub struct MessageRecord {
    pub id: String,
    pub contact_id: String,
    pub direction: Option<MessageDirection>,
    pub source: Option<SourceChannel>,
    pub subject: String,
    pub body: String,
    pub status: Option<MessageStatus>,
    /// Editable draft shown to the human reviewer.
    pub draft_reply: String,
    /// Immutable copy of the draft as the model produced it.
    pub ai_draft_version: String,
    pub strategy_notes: String,
    pub lead_category: Option<LeadCategory>,
    pub ai_confidence: f64,
    pub detected_intent: String,
    pub source_message_id: String,
    pub thread_id: String,
    pub chat_id: String,
    pub account_id: String,
    pub received_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub edit_distance: Option<f64>,
    pub follow_up_number: i64,
}

/// One audit trail entry.
#[derive(Debug, Clone, Default)]
pub struct AuditLogEntry {
    pub action: String,
    pub message_id: String,
    pub contact_id: String,
    pub actor: String,
    pub details: String,
    pub trace_id: String,
}

impl AuditLogEntry {
    pub fn new(action: AuditAction) -> Self {
        AuditLogEntry {
            action: action.as_str().to_string(),
            actor: "system".to_string(),
            ..Default::default()
        }
    }

    pub fn with_trace(mut self, trace_id: &str) -> Self {
        self.trace_id = trace_id.to_string();
        self
    }

    pub fn with_message(mut self, message_id: &str) -> Self {
        self.message_id = message_id.to_string();
        self
    }

    pub fn with_contact(mut self, contact_id: &str) -> Self {
        self.contact_id = contact_id.to_string();
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_channel_round_trips() {
        for label in ["Gmail", "LinkedIn", "Both"] {
            let parsed = SourceChannel::parse(label).unwrap();
            assert_eq!(parsed.as_str(), label);
        }
        assert!(SourceChannel::parse("Telegram").is_none());
    }

    #[test]
    fn lead_category_multiword_label() {
        assert_eq!(LeadCategory::NotALead.as_str(), "Not a Lead");
        assert_eq!(
            LeadCategory::parse("Not a Lead"),
            Some(LeadCategory::NotALead)
        );
    }

    #[test]
    fn classification_deserializes_from_tool_input() {
        let input = serde_json::json!({
            "category": "Warm",
            "confidence": 0.82,
            "reasoning": "Asked about pricing",
            "detected_intent": "pricing_inquiry",
            "detected_signals": ["mentions budget"],
            "should_reply": true,
            "conversation_stage": "Qualifying",
            "icp_match_score": 0.7,
        });
        let c: LeadClassification = serde_json::from_value(input).unwrap();
        assert_eq!(c.category, LeadCategory::Warm);
        assert_eq!(c.conversation_stage, ConversationStage::Qualifying);
        assert!(c.should_reply);
    }

    #[test]
    fn classification_defaults_optional_fields() {
        let input = serde_json::json!({
            "category": "Cold",
            "confidence": 0.5,
            "reasoning": "Vague",
            "detected_intent": "unclear",
            "should_reply": false,
            "conversation_stage": "New",
        });
        let c: LeadClassification = serde_json::from_value(input).unwrap();
        assert!(c.detected_signals.is_empty());
        assert_eq!(c.icp_match_score, 0.0);
    }

    #[test]
    fn message_status_labels_match_parse() {
        for label in MessageStatus::all_labels() {
            assert_eq!(MessageStatus::parse(label).unwrap().as_str(), label);
        }
    }

    #[test]
    fn conversation_stage_labels_match_parse() {
        for label in ConversationStage::all_labels() {
            assert_eq!(ConversationStage::parse(label).unwrap().as_str(), label);
        }
    }

    #[test]
    fn audit_entry_builder_sets_fields() {
        let entry = AuditLogEntry::new(AuditAction::Sent)
            .with_trace("msg_abcd1234")
            .with_message("recM1")
            .with_contact("recC1")
            .with_details("{\"channel\":\"Gmail\"}");
        assert_eq!(entry.action, "sent");
        assert_eq!(entry.actor, "system");
        assert_eq!(entry.trace_id, "msg_abcd1234");
        assert_eq!(entry.message_id, "recM1");
    }
}
