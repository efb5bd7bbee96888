// Reply drafting.
//
// One model call walks through three phases inside the prompt: analyze the
// lead, draft a reply for the channel, then self-critique and emit the final
// version between <FINAL_REPLY> markers. Only the final text comes back.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::ReplyDraftingConfig;
use crate::models::{
    ContactRecord, DraftReply, InboundMessage, LeadClassification, SourceChannel,
};

use super::client::AnthropicClient;
use super::prompts::PromptLibrary;
use super::Draft;

const REPLY_MAX_TOKENS: u32 = 1024;
const FOLLOWUP_MAX_TOKENS: u32 = 512;

pub struct ReplyDrafter {
    client: Arc<AnthropicClient>,
    prompts: Arc<PromptLibrary>,
    config: ReplyDraftingConfig,
}

impl ReplyDrafter {
    pub fn new(
        client: Arc<AnthropicClient>,
        prompts: Arc<PromptLibrary>,
        config: ReplyDraftingConfig,
    ) -> Self {
        ReplyDrafter {
            client,
            prompts,
            config,
        }
    }

    fn max_words_for(&self, channel: SourceChannel) -> usize {
        match channel {
            SourceChannel::Gmail => self.config.max_reply_words_email,
            _ => self.config.max_reply_words_linkedin,
        }
    }

    async fn complete(&self, mut prompt: String, max_tokens: u32) -> Result<DraftReply> {
        if !self.config.self_critique_enabled {
            prompt.push_str(
                "\n\nIMPORTANT: Skip the self-critique step. \
                 Output your draft directly as the final reply.",
            );
        }

        let raw = self
            .client
            .create_message(&self.config.model, self.config.temperature, max_tokens, &prompt)
            .await?;

        let (reply_text, strategy_notes) = parse_response(&raw);
        if reply_text.is_empty() {
            bail!("drafting produced an empty reply");
        }
        Ok(DraftReply {
            reply_text,
            strategy_notes,
        })
    }
}

#[async_trait]
impl Draft for ReplyDrafter {
    async fn draft(
        &self,
        message: &InboundMessage,
        classification: &LeadClassification,
        enrichment_data: &str,
    ) -> Result<DraftReply> {
        let prompt = self.prompts.build_reply_prompt(
            message,
            classification,
            enrichment_data,
            self.max_words_for(message.source),
        )?;

        debug!(
            sender = %message.sender_name,
            category = classification.category.as_str(),
            source = message.source.as_str(),
            "drafting reply"
        );

        let draft = self.complete(prompt, REPLY_MAX_TOKENS).await?;
        info!(
            sender = %message.sender_name,
            reply_length = draft.reply_text.len(),
            has_strategy_notes = !draft.strategy_notes.is_empty(),
            "reply drafted"
        );
        Ok(draft)
    }

    async fn draft_followup(
        &self,
        contact: &ContactRecord,
        channel: &str,
        conversation_history: &str,
        followup_number: i64,
    ) -> Result<DraftReply> {
        let max_words = if channel == "Email" {
            self.config.max_reply_words_email
        } else {
            self.config.max_reply_words_linkedin
        };
        let prompt = self.prompts.build_followup_prompt(
            contact,
            channel,
            conversation_history,
            followup_number,
            max_words,
        )?;

        debug!(contact = %contact.name, channel, followup_number, "drafting follow-up");

        let draft = self.complete(prompt, FOLLOWUP_MAX_TOKENS).await?;
        info!(
            contact = %contact.name,
            followup_number,
            reply_length = draft.reply_text.len(),
            "follow-up drafted"
        );
        Ok(draft)
    }
}

/// Extract `(reply_text, strategy_notes)` from the raw model output.
///
/// Looks for <STRATEGY_NOTES>...</STRATEGY_NOTES> and
/// <FINAL_REPLY>...</FINAL_REPLY> markers; when the reply markers are absent
/// the whole response is treated as the reply.
fn parse_response(raw: &str) -> (String, String) {
    let strategy_notes = between(raw, "<STRATEGY_NOTES>", "</STRATEGY_NOTES>")
        .unwrap_or_default()
        .trim()
        .to_string();

    let reply_text = between(raw, "<FINAL_REPLY>", "</FINAL_REPLY>")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| raw.trim().to_string());

    (reply_text, strategy_notes)
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(&text[start..end])
}
