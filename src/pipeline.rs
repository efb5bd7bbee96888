// Inbound pipeline: message to enrichment to CRM to classification to draft.
//
// Each message runs through, in order: idempotency check, contact upsert
// with cross-channel dedup, enrichment, classification, reply drafting when
// warranted, CRM message creation, contact update, and audit logging. A
// failure anywhere marks the message failed in SQLite so the next poll can
// retry it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::ai::{Classify, Draft};
use crate::crm::dedup::ContactDeduplicator;
use crate::crm::Crm;
use crate::db::Database;
use crate::enrichment::{ContactEnricher, EnrichmentQuery};
use crate::models::{
    AuditAction, AuditLogEntry, ContactRecord, DraftReply, InboundMessage, LeadClassification,
    MessageDirection, MessageRecord, MessageStatus,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub total: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct InboundPipeline {
    crm: Arc<dyn Crm>,
    dedup: ContactDeduplicator,
    classifier: Arc<dyn Classify>,
    drafter: Arc<dyn Draft>,
    enricher: Option<Arc<ContactEnricher>>,
    db: Arc<Database>,
}

impl InboundPipeline {
    pub fn new(
        crm: Arc<dyn Crm>,
        classifier: Arc<dyn Classify>,
        drafter: Arc<dyn Draft>,
        enricher: Option<Arc<ContactEnricher>>,
        db: Arc<Database>,
    ) -> Self {
        InboundPipeline {
            dedup: ContactDeduplicator::new(Arc::clone(&crm)),
            crm,
            classifier,
            drafter,
            enricher,
            db,
        }
    }

    /// Process one message end to end. Returns the CRM message record id,
    /// or `None` when the message was skipped or failed.
    pub async fn process_message(&self, message: &InboundMessage) -> Option<String> {
        let trace_id = new_trace_id();
        let started = Instant::now();

        match self
            .db
            .is_message_processed(message.source, &message.source_message_id)
        {
            Ok(true) => {
                debug!(
                    trace_id = %trace_id,
                    source_message_id = %message.source_message_id,
                    "message already processed"
                );
                return None;
            }
            Ok(false) => {}
            Err(e) => {
                error!(trace_id = %trace_id, error = %e, "idempotency check failed");
                return None;
            }
        }

        info!(
            trace_id = %trace_id,
            source = message.source.as_str(),
            source_message_id = %message.source_message_id,
            sender = %message.sender_name,
            "pipeline started"
        );

        match self.run(message, &trace_id, started).await {
            Ok(message_id) => Some(message_id),
            Err(e) => {
                error!(trace_id = %trace_id, error = %e, "pipeline failed");
                if let Err(db_err) = self.db.mark_message_failed(
                    message.source,
                    &message.source_message_id,
                    &e.to_string(),
                ) {
                    error!(trace_id = %trace_id, error = %db_err, "failed to record failure");
                }
                None
            }
        }
    }

    async fn run(
        &self,
        message: &InboundMessage,
        trace_id: &str,
        started: Instant,
    ) -> Result<String> {
        let contact = self.upsert_contact(message, trace_id).await?;

        let enrichment_data = match &self.enricher {
            Some(enricher) => {
                self.enrich_contact(enricher, &contact, trace_id)
                    .await
                    .unwrap_or_default()
            }
            None => String::new(),
        };

        let classification = self.classify(message, &enrichment_data, &contact).await?;

        let mut draft = DraftReply {
            reply_text: String::new(),
            strategy_notes: String::new(),
        };
        let status = if classification.should_reply {
            draft = self.draft_reply(message, &classification, &enrichment_data).await?;
            MessageStatus::DraftReady
        } else {
            info!(trace_id = %trace_id, reason = %classification.reasoning, "no reply needed");
            MessageStatus::New
        };

        let record = MessageRecord {
            contact_id: contact.id.clone(),
            direction: Some(MessageDirection::Inbound),
            source: Some(message.source),
            subject: message.subject.clone(),
            body: message.body.clone(),
            status: Some(status),
            draft_reply: draft.reply_text.clone(),
            ai_draft_version: draft.reply_text.clone(),
            strategy_notes: draft.strategy_notes.clone(),
            lead_category: Some(classification.category),
            ai_confidence: classification.confidence,
            detected_intent: classification.detected_intent.clone(),
            source_message_id: message.source_message_id.clone(),
            thread_id: message.thread_id.clone(),
            chat_id: if message.source == crate::models::SourceChannel::LinkedIn {
                message.thread_id.clone()
            } else {
                String::new()
            },
            account_id: message.account_id.clone(),
            received_at: Some(message.received_at),
            ..Default::default()
        };
        let message_id = self.crm.create_message(&record).await?;
        info!(trace_id = %trace_id, message_id = %message_id, status = status.as_str(), "message record created");

        self.crm
            .update_contact(
                &contact.id,
                json!({
                    "Lead Category": classification.category.as_str(),
                    "Conversation Stage": classification.conversation_stage.as_str(),
                    "AI Confidence": classification.confidence,
                    "Detected Intent": classification.detected_intent,
                    "Signal Stack": serde_json::to_string(&classification.detected_signals)
                        .unwrap_or_default(),
                    "AI Reasoning": classification.reasoning,
                    "Last Contact": message.received_at.format("%Y-%m-%d").to_string(),
                }),
            )
            .await
            .context("failed to update contact with classification")?;

        self.db.mark_message_processed(
            message.source,
            &message.source_message_id,
            Some(&message_id),
            Some(&contact.id),
        )?;

        self.crm
            .log_audit(
                &AuditLogEntry::new(AuditAction::MessageReceived)
                    .with_trace(trace_id)
                    .with_contact(&contact.id)
                    .with_message(&message_id)
                    .with_details(
                        json!({
                            "source": message.source.as_str(),
                            "sender": message.sender_name,
                        })
                        .to_string(),
                    ),
            )
            .await?;
        self.crm
            .log_audit(
                &AuditLogEntry::new(AuditAction::Classified)
                    .with_trace(trace_id)
                    .with_contact(&contact.id)
                    .with_message(&message_id)
                    .with_details(
                        json!({
                            "category": classification.category.as_str(),
                            "confidence": classification.confidence,
                            "intent": classification.detected_intent,
                            "stage": classification.conversation_stage.as_str(),
                            "icp_score": classification.icp_match_score,
                        })
                        .to_string(),
                    ),
            )
            .await?;
        if !draft.reply_text.is_empty() {
            self.crm
                .log_audit(
                    &AuditLogEntry::new(AuditAction::DraftCreated)
                        .with_trace(trace_id)
                        .with_contact(&contact.id)
                        .with_message(&message_id)
                        .with_details(
                            json!({
                                "word_count": draft.reply_text.split_whitespace().count(),
                            })
                            .to_string(),
                        ),
                )
                .await?;
        }

        let duration_ms = started.elapsed().as_millis() as i64;
        self.db.log_local_audit(
            Some(trace_id),
            "pipeline_complete",
            Some(&message_id),
            Some(&contact.id),
            Some(duration_ms),
            Some(&json!({
                "category": classification.category.as_str(),
                "confidence": classification.confidence,
                "should_reply": classification.should_reply,
                "status": status.as_str(),
            })),
        )?;

        info!(
            trace_id = %trace_id,
            duration_ms,
            category = classification.category.as_str(),
            status = status.as_str(),
            "pipeline complete"
        );
        Ok(message_id)
    }

    async fn upsert_contact(
        &self,
        message: &InboundMessage,
        trace_id: &str,
    ) -> Result<ContactRecord> {
        if let Some(existing) = self.dedup.find_existing_contact(message).await? {
            let updates = self.dedup.merge_contact_data(&existing, message);
            let updated_keys: Vec<String> = updates
                .as_object()
                .map(|m| m.keys().cloned().collect())
                .unwrap_or_default();
            self.crm.update_contact(&existing.id, updates).await?;
            info!(
                trace_id = %trace_id,
                contact_id = %existing.id,
                updates = ?updated_keys,
                "contact updated"
            );
            self.crm
                .log_audit(
                    &AuditLogEntry::new(AuditAction::ContactUpdated)
                        .with_trace(trace_id)
                        .with_contact(&existing.id)
                        .with_details(json!({ "updates": updated_keys }).to_string()),
                )
                .await?;
            return Ok(existing);
        }

        let contact = self
            .crm
            .create_contact(json!({
                "Name": message.sender_name,
                "Email": message.sender_email,
                "LinkedIn URL": message.sender_linkedin_url,
                "Company": message.sender_company,
                "Title": message.sender_title,
                "Source Channel": message.source.as_str(),
                "Conversation Stage": "New",
                "First Contact": message.received_at.format("%Y-%m-%d").to_string(),
                "Last Contact": message.received_at.format("%Y-%m-%d").to_string(),
                "Interaction Count": 1,
            }))
            .await?;
        info!(trace_id = %trace_id, contact_id = %contact.id, "contact created");
        self.crm
            .log_audit(
                &AuditLogEntry::new(AuditAction::ContactCreated)
                    .with_trace(trace_id)
                    .with_contact(&contact.id)
                    .with_details(json!({ "name": contact.name }).to_string()),
            )
            .await?;
        Ok(contact)
    }

    /// Returns the enrichment JSON for prompt context, or `None` when every
    /// provider came up empty. Enrichment failures never fail the pipeline.
    async fn enrich_contact(
        &self,
        enricher: &ContactEnricher,
        contact: &ContactRecord,
        trace_id: &str,
    ) -> Option<String> {
        let started = Instant::now();
        let query = EnrichmentQuery {
            email: contact.email.clone(),
            linkedin_url: contact.linkedin_url.clone(),
            name: contact.name.clone(),
            company: contact.company.clone(),
        };
        let data = enricher.enrich(&query).await?;
        let duration_ms = started.elapsed().as_millis() as i64;

        let enrichment_json = data.to_string();
        let mut updates = json!({ "Enrichment Data": enrichment_json });
        for (key, field, current) in [
            ("title", "Title", &contact.title),
            ("company", "Company", &contact.company),
            ("linkedin_url", "LinkedIn URL", &contact.linkedin_url),
            ("email", "Email", &contact.email),
        ] {
            if current.is_empty() {
                if let Some(value) = data[key].as_str().filter(|v| !v.is_empty()) {
                    updates[field] = json!(value);
                }
            }
        }

        if let Err(e) = self.crm.update_contact(&contact.id, updates).await {
            error!(trace_id = %trace_id, error = %e, "failed to store enrichment");
            return Some(enrichment_json);
        }
        let _ = self
            .crm
            .log_audit(
                &AuditLogEntry::new(AuditAction::Enriched)
                    .with_trace(trace_id)
                    .with_contact(&contact.id)
                    .with_details(json!({ "duration_ms": duration_ms }).to_string()),
            )
            .await;
        info!(trace_id = %trace_id, contact_id = %contact.id, duration_ms, "contact enriched");
        Some(enrichment_json)
    }

    async fn classify(
        &self,
        message: &InboundMessage,
        enrichment_data: &str,
        contact: &ContactRecord,
    ) -> Result<LeadClassification> {
        let started = Instant::now();
        let current_stage = contact
            .conversation_stage
            .map(|s| s.as_str())
            .unwrap_or_default();
        let classification = self
            .classifier
            .classify(message, enrichment_data, current_stage)
            .await?;
        info!(
            category = classification.category.as_str(),
            confidence = classification.confidence,
            intent = %classification.detected_intent,
            duration_ms = started.elapsed().as_millis() as i64,
            "lead classified"
        );
        Ok(classification)
    }

    async fn draft_reply(
        &self,
        message: &InboundMessage,
        classification: &LeadClassification,
        enrichment_data: &str,
    ) -> Result<DraftReply> {
        let started = Instant::now();
        let draft = self
            .drafter
            .draft(message, classification, enrichment_data)
            .await?;
        info!(
            word_count = draft.reply_text.split_whitespace().count(),
            duration_ms = started.elapsed().as_millis() as i64,
            "reply drafted"
        );
        Ok(draft)
    }

    pub async fn process_batch(&self, messages: &[InboundMessage]) -> BatchStats {
        let mut stats = BatchStats {
            total: messages.len(),
            ..Default::default()
        };

        for message in messages {
            if self.process_message(message).await.is_some() {
                stats.processed += 1;
            } else if self
                .db
                .is_message_processed(message.source, &message.source_message_id)
                .unwrap_or(false)
            {
                stats.skipped += 1;
            } else {
                stats.failed += 1;
            }
        }

        info!(
            total = stats.total,
            processed = stats.processed,
            skipped = stats.skipped,
            failed = stats.failed,
            "batch complete"
        );
        stats
    }
}

fn new_trace_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("msg_{:08x}", (nanos as u32) ^ ((nanos >> 32) as u32))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::crm::testing::MockCrm;
    use crate::models::{ConversationStage, LeadCategory, SourceChannel};

    struct FakeClassifier {
        classification: LeadClassification,
    }

    #[async_trait]
    impl Classify for FakeClassifier {
        async fn classify(
            &self,
            _message: &InboundMessage,
            _enrichment_data: &str,
            _current_stage: &str,
        ) -> Result<LeadClassification> {
            Ok(self.classification.clone())
        }
    }

    struct FakeDrafter;

    #[async_trait]
    impl Draft for FakeDrafter {
        async fn draft(
            &self,
            _message: &InboundMessage,
            _classification: &LeadClassification,
            _enrichment_data: &str,
        ) -> Result<DraftReply> {
            Ok(DraftReply {
                reply_text: "Thanks for reaching out, happy to chat.".into(),
                strategy_notes: "Keep it short.".into(),
            })
        }

        async fn draft_followup(
            &self,
            _contact: &ContactRecord,
            _channel: &str,
            _history: &str,
            _followup_number: i64,
        ) -> Result<DraftReply> {
            Ok(DraftReply {
                reply_text: "Just circling back.".into(),
                strategy_notes: String::new(),
            })
        }
    }

    struct FailingClassifier;

    #[async_trait]
    impl Classify for FailingClassifier {
        async fn classify(
            &self,
            _message: &InboundMessage,
            _enrichment_data: &str,
            _current_stage: &str,
        ) -> Result<LeadClassification> {
            anyhow::bail!("model unavailable")
        }
    }

    fn warm_classification(should_reply: bool) -> LeadClassification {
        LeadClassification {
            category: LeadCategory::Warm,
            confidence: 0.82,
            reasoning: "Asked about pricing".into(),
            detected_intent: "pricing_inquiry".into(),
            detected_signals: vec!["mentions budget".into()],
            should_reply,
            conversation_stage: ConversationStage::Qualifying,
            icp_match_score: 0.7,
        }
    }

    fn pipeline_with(
        crm: Arc<MockCrm>,
        classification: LeadClassification,
    ) -> (InboundPipeline, Arc<Database>) {
        let db = Arc::new(Database::open(":memory:").unwrap());
        let pipeline = InboundPipeline::new(
            crm,
            Arc::new(FakeClassifier { classification }),
            Arc::new(FakeDrafter),
            None,
            Arc::clone(&db),
        );
        (pipeline, db)
    }

    fn inbound(id: &str) -> InboundMessage {
        let mut message = InboundMessage::new(
            SourceChannel::Gmail,
            id,
            "Sarah Chen",
            "What does pricing look like for 50 seats?",
            Utc::now(),
        );
        message.sender_email = "sarah@acme.com".into();
        message.subject = "Pricing question".into();
        message.thread_id = "thread-1".into();
        message
    }

    #[tokio::test]
    async fn new_message_creates_contact_and_draft() {
        let crm = Arc::new(MockCrm::new());
        let (pipeline, db) = pipeline_with(Arc::clone(&crm), warm_classification(true));

        let message_id = pipeline.process_message(&inbound("g-1")).await.unwrap();

        let messages = crm.messages.lock().unwrap();
        let record = messages.iter().find(|m| m.id == message_id).unwrap();
        assert_eq!(record.status, Some(MessageStatus::DraftReady));
        assert_eq!(record.draft_reply, "Thanks for reaching out, happy to chat.");
        assert_eq!(record.ai_draft_version, record.draft_reply);
        assert_eq!(record.lead_category, Some(LeadCategory::Warm));
        drop(messages);

        assert_eq!(crm.contacts.lock().unwrap().len(), 1);
        assert!(db
            .is_message_processed(SourceChannel::Gmail, "g-1")
            .unwrap());

        let actions: Vec<String> = crm
            .audit_entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.action.clone())
            .collect();
        assert!(actions.contains(&"contact_created".to_string()));
        assert!(actions.contains(&"message_received".to_string()));
        assert!(actions.contains(&"classified".to_string()));
        assert!(actions.contains(&"draft_created".to_string()));
    }

    #[tokio::test]
    async fn no_reply_needed_leaves_status_new() {
        let crm = Arc::new(MockCrm::new());
        let (pipeline, _db) = pipeline_with(Arc::clone(&crm), warm_classification(false));

        pipeline.process_message(&inbound("g-2")).await.unwrap();

        let messages = crm.messages.lock().unwrap();
        assert_eq!(messages[0].status, Some(MessageStatus::New));
        assert!(messages[0].draft_reply.is_empty());
        drop(messages);

        let actions: Vec<String> = crm
            .audit_entries
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.action.clone())
            .collect();
        assert!(!actions.contains(&"draft_created".to_string()));
    }

    #[tokio::test]
    async fn existing_contact_is_updated_not_duplicated() {
        let crm = Arc::new(MockCrm::new());
        crm.push_contact(ContactRecord {
            id: "recC900".into(),
            name: "Sarah Chen".into(),
            email: "sarah@acme.com".into(),
            source_channel: Some(SourceChannel::Gmail),
            interaction_count: 3,
            ..Default::default()
        });
        let (pipeline, _db) = pipeline_with(Arc::clone(&crm), warm_classification(true));

        pipeline.process_message(&inbound("g-3")).await.unwrap();

        assert_eq!(crm.contacts.lock().unwrap().len(), 1);
        let updates = crm.contact_updates.lock().unwrap();
        // Dedup merge plus the classification write-back
        assert!(updates.iter().all(|(id, _)| id == "recC900"));
        assert!(updates
            .iter()
            .any(|(_, fields)| fields["Interaction Count"] == 4));
        assert!(updates
            .iter()
            .any(|(_, fields)| fields["Lead Category"] == "Warm"));
    }

    #[tokio::test]
    async fn already_processed_message_is_skipped() {
        let crm = Arc::new(MockCrm::new());
        let (pipeline, db) = pipeline_with(Arc::clone(&crm), warm_classification(true));
        db.mark_message_processed(SourceChannel::Gmail, "g-4", None, None)
            .unwrap();

        assert!(pipeline.process_message(&inbound("g-4")).await.is_none());
        assert!(crm.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn classifier_failure_marks_message_failed() {
        let crm = Arc::new(MockCrm::new());
        let db = Arc::new(Database::open(":memory:").unwrap());
        let pipeline = InboundPipeline::new(
            Arc::clone(&crm) as Arc<dyn Crm>,
            Arc::new(FailingClassifier),
            Arc::new(FakeDrafter),
            None,
            Arc::clone(&db),
        );

        assert!(pipeline.process_message(&inbound("g-5")).await.is_none());
        assert!(!db
            .is_message_processed(SourceChannel::Gmail, "g-5")
            .unwrap());
        assert_eq!(db.message_attempts(SourceChannel::Gmail, "g-5").unwrap(), 1);
        assert!(crm.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_stats_split_processed_skipped_failed() {
        let crm = Arc::new(MockCrm::new());
        let (pipeline, db) = pipeline_with(Arc::clone(&crm), warm_classification(true));
        db.mark_message_processed(SourceChannel::Gmail, "g-7", None, None)
            .unwrap();

        let stats = pipeline
            .process_batch(&[inbound("g-6"), inbound("g-7")])
            .await;
        assert_eq!(
            stats,
            BatchStats {
                total: 2,
                processed: 1,
                skipped: 1,
                failed: 0,
            }
        );
    }
}
