// Connection request evaluation against the ICP, via forced tool call.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::models::{ConnectionEvaluation, LeadCategory};

use super::client::AnthropicClient;
use super::prompts::PromptLibrary;
use super::{ConnectionProfile, EvaluateConnection};

const MAX_TOKENS: u32 = 1024;

pub struct ConnectionEvaluator {
    client: Arc<AnthropicClient>,
    prompts: Arc<PromptLibrary>,
    model: String,
    temperature: f64,
}

impl ConnectionEvaluator {
    pub fn new(
        client: Arc<AnthropicClient>,
        prompts: Arc<PromptLibrary>,
        model: &str,
        temperature: f64,
    ) -> Self {
        ConnectionEvaluator {
            client,
            prompts,
            model: model.to_string(),
            temperature,
        }
    }
}

#[async_trait]
impl EvaluateConnection for ConnectionEvaluator {
    async fn evaluate(&self, profile: &ConnectionProfile) -> Result<ConnectionEvaluation> {
        let prompt = self.prompts.build_connection_eval_prompt(profile)?;

        debug!(
            name = %profile.name,
            headline = %profile.headline,
            company = %profile.company,
            "evaluating connection request"
        );

        let input = self
            .client
            .call_tool(
                &self.model,
                self.temperature,
                MAX_TOKENS,
                &prompt,
                &connection_eval_tool(),
            )
            .await?;

        let evaluation: ConnectionEvaluation = serde_json::from_value(input)
            .context("connection evaluation tool input did not match schema")?;

        info!(
            name = %profile.name,
            company = %profile.company,
            accept = evaluation.accept,
            lead_category = evaluation.lead_category.as_str(),
            confidence = evaluation.confidence,
            "connection request evaluated"
        );
        Ok(evaluation)
    }
}

pub fn connection_eval_tool() -> Value {
    json!({
        "name": "evaluate_connection",
        "description": "Evaluate a LinkedIn connection request against the Ideal Customer Profile. \
                        Decide whether to accept or reject and assign a lead category.",
        "input_schema": {
            "type": "object",
            "properties": {
                "accept": {
                    "type": "boolean",
                    "description": "Whether to accept the connection request.",
                },
                "reasoning": {
                    "type": "string",
                    "description": "Brief explanation of why the connection should be accepted or rejected.",
                },
                "lead_category": {
                    "type": "string",
                    "enum": LeadCategory::all_labels(),
                    "description": "Lead category for the requester: Hot, Warm, Cold, or Not a Lead.",
                },
                "confidence": {
                    "type": "number",
                    "minimum": 0.0,
                    "maximum": 1.0,
                    "description": "Confidence in the evaluation (0.0 to 1.0).",
                },
            },
            "required": ["accept", "reasoning", "lead_category", "confidence"],
        },
    })
}
