// AI layer: the Anthropic API client, prompt rendering, and the four
// model-backed components (classifier, reply drafter, connection evaluator,
// self-learner).

pub mod classifier;
pub mod client;
pub mod connection_eval;
pub mod drafter;
pub mod learner;
pub mod prompts;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    ConnectionEvaluation, ContactRecord, DraftReply, InboundMessage, LeadClassification,
};

/// Profile data attached to a LinkedIn connection request under evaluation.
#[derive(Debug, Clone, Default)]
pub struct ConnectionProfile {
    pub name: String,
    pub headline: String,
    pub company: String,
    pub location: String,
    pub mutual_connections: i64,
    pub request_message: String,
    pub profile_summary: String,
}

/// Lead classification seam. Implemented by [`classifier::LeadClassifier`];
/// the pipeline depends on the trait so tests can use a canned classifier.
#[async_trait]
pub trait Classify: Send + Sync {
    async fn classify(
        &self,
        message: &InboundMessage,
        enrichment_data: &str,
        current_stage: &str,
    ) -> Result<LeadClassification>;
}

/// Reply drafting seam, covering both inbound replies and follow-up nudges.
#[async_trait]
pub trait Draft: Send + Sync {
    async fn draft(
        &self,
        message: &InboundMessage,
        classification: &LeadClassification,
        enrichment_data: &str,
    ) -> Result<DraftReply>;

    async fn draft_followup(
        &self,
        contact: &ContactRecord,
        channel: &str,
        conversation_history: &str,
        followup_number: i64,
    ) -> Result<DraftReply>;
}

/// Connection request evaluation seam.
#[async_trait]
pub trait EvaluateConnection: Send + Sync {
    async fn evaluate(&self, profile: &ConnectionProfile) -> Result<ConnectionEvaluation>;
}
