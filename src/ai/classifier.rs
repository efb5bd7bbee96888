// Lead classification via forced tool call.
//
// The tool schema mirrors `LeadClassification`; the model's tool input
// deserializes straight into it.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::models::{ConversationStage, InboundMessage, LeadCategory, LeadClassification};

use super::client::AnthropicClient;
use super::prompts::PromptLibrary;
use super::Classify;

const MAX_TOKENS: u32 = 1024;

pub struct LeadClassifier {
    client: Arc<AnthropicClient>,
    prompts: Arc<PromptLibrary>,
    model: String,
    temperature: f64,
}

impl LeadClassifier {
    pub fn new(
        client: Arc<AnthropicClient>,
        prompts: Arc<PromptLibrary>,
        model: &str,
        temperature: f64,
    ) -> Self {
        LeadClassifier {
            client,
            prompts,
            model: model.to_string(),
            temperature,
        }
    }
}

#[async_trait]
impl Classify for LeadClassifier {
    async fn classify(
        &self,
        message: &InboundMessage,
        enrichment_data: &str,
        current_stage: &str,
    ) -> Result<LeadClassification> {
        let prompt =
            self.prompts
                .build_classification_prompt(message, enrichment_data, current_stage)?;

        debug!(
            sender = %message.sender_name,
            source = message.source.as_str(),
            body_length = message.body.len(),
            "classifying message"
        );

        let input = self
            .client
            .call_tool(
                &self.model,
                self.temperature,
                MAX_TOKENS,
                &prompt,
                &classification_tool(),
            )
            .await?;

        let classification: LeadClassification =
            serde_json::from_value(input).context("classification tool input did not match schema")?;

        info!(
            sender = %message.sender_name,
            category = classification.category.as_str(),
            confidence = classification.confidence,
            should_reply = classification.should_reply,
            stage = classification.conversation_stage.as_str(),
            icp_score = classification.icp_match_score,
            "message classified"
        );
        Ok(classification)
    }
}

pub fn classification_tool() -> Value {
    json!({
        "name": "classify_lead",
        "description": "Classify an inbound sales lead based on the message content, \
                        sender information, and sales context. Return structured classification.",
        "input_schema": {
            "type": "object",
            "properties": {
                "category": {
                    "type": "string",
                    "enum": LeadCategory::all_labels(),
                    "description": "Lead category: Hot, Warm, Cold, or Not a Lead.",
                },
                "confidence": {
                    "type": "number",
                    "minimum": 0.0,
                    "maximum": 1.0,
                    "description": "Confidence in the classification (0.0 to 1.0).",
                },
                "reasoning": {
                    "type": "string",
                    "description": "Brief explanation of why this classification was chosen.",
                },
                "detected_intent": {
                    "type": "string",
                    "description": "The primary intent detected in the message \
                                    (e.g., 'buying signal', 'information request', 'spam').",
                },
                "detected_signals": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "List of specific buying/interest signals detected.",
                },
                "should_reply": {
                    "type": "boolean",
                    "description": "Whether this message warrants a reply.",
                },
                "conversation_stage": {
                    "type": "string",
                    "enum": ConversationStage::all_labels(),
                    "description": "Current stage in the sales conversation.",
                },
                "icp_match_score": {
                    "type": "number",
                    "minimum": 0.0,
                    "maximum": 1.0,
                    "description": "How well the sender matches the Ideal Customer Profile (0.0 to 1.0).",
                },
            },
            "required": [
                "category",
                "confidence",
                "reasoning",
                "detected_intent",
                "detected_signals",
                "should_reply",
                "conversation_stage",
                "icp_match_score",
            ],
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_schema_lists_all_enum_labels() {
        let tool = classification_tool();
        assert_eq!(tool["name"], "classify_lead");
        let categories = tool["input_schema"]["properties"]["category"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(categories.len(), 4);
        assert!(categories.contains(&json!("Not a Lead")));
        let stages = tool["input_schema"]["properties"]["conversation_stage"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(stages.len(), 8);
    }

    #[test]
    fn tool_input_deserializes_into_classification() {
        let input = json!({
            "category": "Hot",
            "confidence": 0.92,
            "reasoning": "explicit demo request",
            "detected_intent": "buying signal",
            "detected_signals": ["asked for demo", "mentioned budget"],
            "should_reply": true,
            "conversation_stage": "Qualifying",
            "icp_match_score": 0.88,
        });
        let classification: LeadClassification = serde_json::from_value(input).unwrap();
        assert_eq!(classification.category, LeadCategory::Hot);
        assert_eq!(classification.detected_signals.len(), 2);
        assert!(classification.should_reply);
    }

    #[test]
    fn schema_mismatch_is_an_error() {
        let input = json!({ "category": "Volcanic", "confidence": 0.9 });
        assert!(serde_json::from_value::<LeadClassification>(input).is_err());
    }
}
