// Self-learning cycle.
//
// Runs daily: pulls recently sent messages where the human materially edited
// the AI draft, asks the model to extract up to two writing rules from the
// (draft, edit) pairs, and stores high-confidence rules in SQLite. Active
// rules are injected into future reply and follow-up prompts; the active set
// is capped by deactivating the oldest rules.

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::LearningConfig;
use crate::crm::Crm;
use crate::db::{Database, LearnedRule};
use crate::models::AuditAction;

use super::client::AnthropicClient;
use super::prompts::PromptLibrary;

const MAX_TOKENS: u32 = 1024;

/// Confidence floor for storing an extracted rule.
const MIN_RULE_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Deserialize)]
struct ExtractedRule {
    rule_text: String,
    confidence: f64,
}

#[derive(Debug, Default, Deserialize)]
struct ExtractedRules {
    #[serde(default)]
    rules: Vec<ExtractedRule>,
}

#[derive(Debug, Clone, Default)]
pub struct LearningStats {
    pub messages_analyzed: usize,
    pub new_rules: usize,
    pub skipped_reason: Option<String>,
}

pub struct SelfLearner {
    client: Arc<AnthropicClient>,
    prompts: Arc<PromptLibrary>,
    crm: Arc<dyn Crm>,
    db: Arc<Database>,
    model: String,
    temperature: f64,
    config: LearningConfig,
}

impl SelfLearner {
    pub fn new(
        client: Arc<AnthropicClient>,
        prompts: Arc<PromptLibrary>,
        crm: Arc<dyn Crm>,
        db: Arc<Database>,
        model: &str,
        temperature: f64,
        config: LearningConfig,
    ) -> Self {
        SelfLearner {
            client,
            prompts,
            crm,
            db,
            model: model.to_string(),
            temperature,
            config,
        }
    }

    pub async fn run_learning_cycle(&self) -> Result<LearningStats> {
        info!(lookback_days = self.config.lookback_days, "learning cycle started");

        let edit_pairs = self.crm.find_edited_messages(self.config.lookback_days).await?;
        if edit_pairs.len() < self.config.min_messages_for_learning {
            let reason = format!(
                "only {} edited messages (need {})",
                edit_pairs.len(),
                self.config.min_messages_for_learning
            );
            info!(
                found = edit_pairs.len(),
                required = self.config.min_messages_for_learning,
                "learning cycle skipped"
            );
            return Ok(LearningStats {
                messages_analyzed: 0,
                new_rules: 0,
                skipped_reason: Some(reason),
            });
        }

        let existing_rules = self.db.get_active_learned_rules()?;
        let new_rules = self.analyze_patterns(&edit_pairs, &existing_rules).await?;

        let mut stored = 0;
        for rule in &new_rules {
            if rule.confidence > MIN_RULE_CONFIDENCE {
                self.db.insert_learned_rule(&rule.rule_text, rule.confidence)?;
                stored += 1;
                info!(rule = %rule.rule_text, confidence = rule.confidence, "learned rule stored");
            }
        }

        // Oldest rules fall off the end of the active set.
        let all_active = self.db.get_active_learned_rules()?;
        if all_active.len() > self.config.max_active_rules {
            let excess = all_active.len() - self.config.max_active_rules;
            for rule in &all_active[..excess] {
                self.db.deactivate_learned_rule(rule.id)?;
                info!(rule_id = rule.id, "learned rule deactivated");
            }
        }

        self.db.log_local_audit(
            None,
            AuditAction::LearningCycle.as_str(),
            None,
            None,
            None,
            Some(&json!({
                "messages_analyzed": edit_pairs.len(),
                "new_rules": stored,
                "total_active_rules": self.db.get_active_learned_rules()?.len(),
            })),
        )?;

        let stats = LearningStats {
            messages_analyzed: edit_pairs.len(),
            new_rules: stored,
            skipped_reason: None,
        };
        info!(
            messages_analyzed = stats.messages_analyzed,
            new_rules = stats.new_rules,
            "learning cycle complete"
        );
        Ok(stats)
    }

    async fn analyze_patterns(
        &self,
        edit_pairs: &[crate::crm::EditedMessage],
        existing_rules: &[LearnedRule],
    ) -> Result<Vec<ExtractedRule>> {
        let prompt = self
            .prompts
            .build_edit_analysis_prompt(edit_pairs, existing_rules)?;

        let input = self
            .client
            .call_tool(&self.model, self.temperature, MAX_TOKENS, &prompt, &learning_tool())
            .await?;

        match serde_json::from_value::<ExtractedRules>(input) {
            Ok(extracted) => Ok(extracted.rules),
            Err(e) => {
                warn!(error = %e, "rule extraction returned malformed input");
                Ok(Vec::new())
            }
        }
    }
}

pub fn learning_tool() -> Value {
    json!({
        "name": "extract_rules",
        "description": "Extract writing rules from patterns observed in human edits to AI drafts. \
                        Return up to 2 rules with confidence scores.",
        "input_schema": {
            "type": "object",
            "properties": {
                "rules": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "rule_text": {
                                "type": "string",
                                "description": "A concise, actionable writing rule (one sentence).",
                            },
                            "confidence": {
                                "type": "number",
                                "minimum": 0.0,
                                "maximum": 1.0,
                                "description": "How confident you are in this pattern (0.0 to 1.0).",
                            },
                        },
                        "required": ["rule_text", "confidence"],
                    },
                    "maxItems": 2,
                    "description": "Extracted rules (max 2). Empty array if no clear patterns found.",
                },
            },
            "required": ["rules"],
        },
    })
}
