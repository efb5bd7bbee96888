// Prompt rendering.
//
// Templates live as .txt files in the configured prompts directory and use
// `{{PLACEHOLDER}}` markers. Every prompt gets the flattened sales context;
// reply and follow-up prompts additionally get the active learned rules and
// few-shot examples.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{debug, warn};

use crate::config::SalesContext;
use crate::crm::EditedMessage;
use crate::db::{Database, LearnedRule};
use crate::models::{ContactRecord, InboundMessage, LeadClassification};

use super::ConnectionProfile;

pub struct PromptLibrary {
    prompts_dir: PathBuf,
    examples_dir: PathBuf,
    sales_context: SalesContext,
    db: Arc<Database>,
}

impl PromptLibrary {
    pub fn new(
        prompts_dir: &Path,
        examples_dir: &Path,
        sales_context: SalesContext,
        db: Arc<Database>,
    ) -> Self {
        PromptLibrary {
            prompts_dir: prompts_dir.to_path_buf(),
            examples_dir: examples_dir.to_path_buf(),
            sales_context,
            db,
        }
    }

    /// Read a template by name (without the .txt extension).
    pub fn load_prompt(&self, name: &str) -> Result<String> {
        let path = self.prompts_dir.join(format!("{name}.txt"));
        if !path.exists() {
            bail!("prompt template not found: {}", path.display());
        }
        std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read prompt template {}", path.display()))
    }

    /// All .txt files from the examples directory, concatenated with
    /// `--- Example: name ---` headers. Empty string when none exist.
    pub fn load_examples(&self) -> String {
        let entries = match std::fs::read_dir(&self.examples_dir) {
            Ok(entries) => entries,
            Err(_) => {
                warn!(path = %self.examples_dir.display(), "examples directory missing");
                return String::new();
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "txt"))
            .collect();
        files.sort();

        let mut parts = Vec::new();
        for path in &files {
            let Ok(content) = std::fs::read_to_string(path) else {
                continue;
            };
            let content = content.trim();
            if content.is_empty() {
                continue;
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            parts.push(format!("--- Example: {stem} ---\n{content}"));
        }

        debug!(count = parts.len(), "loaded few-shot examples");
        parts.join("\n\n")
    }

    fn learned_rules_block(&self) -> String {
        match self.db.get_active_learned_rules() {
            Ok(rules) if !rules.is_empty() => format_rules(&rules),
            Ok(_) => "No learned preferences yet.".to_string(),
            Err(e) => {
                warn!(error = %e, "failed to load learned rules for prompt");
                "No learned preferences yet.".to_string()
            }
        }
    }

    pub fn build_classification_prompt(
        &self,
        message: &InboundMessage,
        enrichment_data: &str,
        current_stage: &str,
    ) -> Result<String> {
        let mut prompt = self.load_prompt("classify_lead")?;
        fill(&mut prompt, "SALES_CONTEXT", &format_sales_context(&self.sales_context));
        fill(&mut prompt, "EXAMPLES", &self.load_examples());

        fill(&mut prompt, "SOURCE", message.source.as_str());
        fill(&mut prompt, "SENDER_NAME", or_default(&message.sender_name, "Unknown"));
        fill(&mut prompt, "SENDER_EMAIL", or_default(&message.sender_email, "N/A"));
        fill(&mut prompt, "SENDER_TITLE", or_default(&message.sender_title, "N/A"));
        fill(&mut prompt, "SENDER_COMPANY", or_default(&message.sender_company, "N/A"));
        fill(
            &mut prompt,
            "SENDER_LINKEDIN_URL",
            or_default(&message.sender_linkedin_url, "N/A"),
        );
        fill(&mut prompt, "SUBJECT", or_default(&message.subject, "N/A"));
        fill(&mut prompt, "BODY", &message.body);
        fill(&mut prompt, "THREAD_CONTEXT", or_default(&message.thread_context, "N/A"));
        fill(&mut prompt, "RECEIVED_AT", &message.received_at.to_rfc3339());

        fill(&mut prompt, "ENRICHMENT_DATA", or_default(enrichment_data, "None available"));
        fill(&mut prompt, "CURRENT_STAGE", or_default(current_stage, "New"));

        Ok(prompt)
    }

    pub fn build_reply_prompt(
        &self,
        message: &InboundMessage,
        classification: &LeadClassification,
        enrichment_data: &str,
        max_words: usize,
    ) -> Result<String> {
        let mut prompt = self.load_prompt("draft_reply")?;
        fill(&mut prompt, "MAX_WORDS", &max_words.to_string());
        fill(&mut prompt, "SALES_CONTEXT", &format_sales_context(&self.sales_context));
        fill(&mut prompt, "EXAMPLES", &self.load_examples());

        fill(&mut prompt, "SOURCE", message.source.as_str());
        fill(&mut prompt, "SENDER_NAME", or_default(&message.sender_name, "Unknown"));
        fill(&mut prompt, "SENDER_EMAIL", or_default(&message.sender_email, "N/A"));
        fill(&mut prompt, "SENDER_TITLE", or_default(&message.sender_title, "N/A"));
        fill(&mut prompt, "SENDER_COMPANY", or_default(&message.sender_company, "N/A"));
        fill(&mut prompt, "SUBJECT", or_default(&message.subject, "N/A"));
        fill(&mut prompt, "BODY", &message.body);
        fill(&mut prompt, "THREAD_CONTEXT", or_default(&message.thread_context, "N/A"));

        fill(&mut prompt, "LEAD_CATEGORY", classification.category.as_str());
        fill(&mut prompt, "CONFIDENCE", &format!("{:.2}", classification.confidence));
        fill(&mut prompt, "DETECTED_INTENT", &classification.detected_intent);
        fill(&mut prompt, "DETECTED_SIGNALS", &classification.detected_signals.join(", "));
        fill(
            &mut prompt,
            "CONVERSATION_STAGE",
            classification.conversation_stage.as_str(),
        );
        fill(
            &mut prompt,
            "ICP_MATCH_SCORE",
            &format!("{:.2}", classification.icp_match_score),
        );
        fill(&mut prompt, "AI_REASONING", &classification.reasoning);

        fill(&mut prompt, "ENRICHMENT_DATA", or_default(enrichment_data, "None available"));
        fill(&mut prompt, "LEARNED_RULES", &self.learned_rules_block());

        Ok(prompt)
    }

    pub fn build_connection_eval_prompt(&self, profile: &ConnectionProfile) -> Result<String> {
        let mut prompt = self.load_prompt("evaluate_connection")?;
        fill(&mut prompt, "SALES_CONTEXT", &format_sales_context(&self.sales_context));

        fill(&mut prompt, "NAME", &profile.name);
        fill(&mut prompt, "HEADLINE", &profile.headline);
        fill(&mut prompt, "COMPANY", &profile.company);
        fill(&mut prompt, "LOCATION", or_default(&profile.location, "N/A"));
        fill(
            &mut prompt,
            "MUTUAL_CONNECTIONS",
            &profile.mutual_connections.to_string(),
        );
        fill(
            &mut prompt,
            "REQUEST_MESSAGE",
            or_default(&profile.request_message, "No message"),
        );
        fill(
            &mut prompt,
            "PROFILE_SUMMARY",
            or_default(&profile.profile_summary, "N/A"),
        );

        Ok(prompt)
    }

    pub fn build_followup_prompt(
        &self,
        contact: &ContactRecord,
        channel: &str,
        conversation_history: &str,
        followup_number: i64,
        max_words: usize,
    ) -> Result<String> {
        let mut prompt = self.load_prompt("draft_followup")?;
        fill(&mut prompt, "MAX_WORDS", &max_words.to_string());
        fill(&mut prompt, "SALES_CONTEXT", &format_sales_context(&self.sales_context));

        fill(&mut prompt, "CONTACT_NAME", or_default(&contact.name, "Unknown"));
        fill(&mut prompt, "CONTACT_EMAIL", or_default(&contact.email, "N/A"));
        fill(&mut prompt, "CONTACT_TITLE", or_default(&contact.title, "N/A"));
        fill(&mut prompt, "CONTACT_COMPANY", or_default(&contact.company, "N/A"));
        fill(
            &mut prompt,
            "LEAD_CATEGORY",
            contact.lead_category.map(|c| c.as_str()).unwrap_or("Warm"),
        );
        fill(
            &mut prompt,
            "CONVERSATION_STAGE",
            contact
                .conversation_stage
                .map(|s| s.as_str())
                .unwrap_or("New"),
        );
        fill(
            &mut prompt,
            "ENRICHMENT_DATA",
            or_default(&contact.enrichment_data, "None available"),
        );

        fill(&mut prompt, "CHANNEL", channel);
        fill(&mut prompt, "FOLLOWUP_NUMBER", &followup_number.to_string());
        fill(
            &mut prompt,
            "CONVERSATION_HISTORY",
            or_default(conversation_history, "No prior messages"),
        );

        fill(&mut prompt, "LEARNED_RULES", &self.learned_rules_block());

        Ok(prompt)
    }

    pub fn build_edit_analysis_prompt(
        &self,
        edit_pairs: &[EditedMessage],
        existing_rules: &[LearnedRule],
    ) -> Result<String> {
        let mut prompt = self.load_prompt("analyze_edits")?;
        fill(&mut prompt, "SALES_CONTEXT", &format_sales_context(&self.sales_context));

        let rules_text = if existing_rules.is_empty() {
            "No rules yet.".to_string()
        } else {
            format_rules(existing_rules)
        };
        fill(&mut prompt, "EXISTING_RULES", &rules_text);

        let mut pairs_text = String::with_capacity(2048);
        for (i, pair) in edit_pairs.iter().enumerate() {
            let category_info = if pair.lead_category.is_empty() {
                String::new()
            } else {
                format!(", Lead Category: {}", pair.lead_category)
            };
            pairs_text.push_str(&format!(
                "### Edit {} (Channel: {}{}, Edit Distance: {:.2})\n\
                 **AI Draft:**\n{}\n\n\
                 **Human Edit:**\n{}\n\n",
                i + 1,
                pair.channel,
                category_info,
                pair.edit_distance,
                pair.ai_draft,
                pair.human_edit,
            ));
        }
        fill(&mut prompt, "EDIT_PAIRS", &pairs_text);

        Ok(prompt)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fill(prompt: &mut String, key: &str, value: &str) {
    let marker = format!("{{{{{key}}}}}");
    if prompt.contains(&marker) {
        *prompt = prompt.replace(&marker, value);
    }
}

fn or_default<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

fn format_rules(rules: &[LearnedRule]) -> String {
    rules
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {}", i + 1, r.rule_text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Flatten the sales context into a readable block for prompt injection.
pub fn format_sales_context(ctx: &SalesContext) -> String {
    let mut out = String::with_capacity(2048);

    out.push_str("## Company\n");
    out.push_str(&format!("  name: {}\n", ctx.company.name));
    out.push_str(&format!("  website: {}\n", ctx.company.website));
    out.push_str(&format!("  description: {}\n", ctx.company.description));

    out.push_str("\n## Product\n");
    out.push_str(&format!("  name: {}\n", ctx.product.name));
    out.push_str(&format!("  description: {}\n", ctx.product.description));
    out.push_str(&format!("  value_props: {}\n", ctx.product.value_props.join(", ")));

    out.push_str("\n## ICP\n");
    out.push_str(&format!("  industries: {}\n", ctx.icp.industries.join(", ")));
    out.push_str(&format!("  company_sizes: {}\n", ctx.icp.company_sizes.join(", ")));
    out.push_str(&format!("  roles: {}\n", ctx.icp.roles.join(", ")));
    out.push_str(&format!("  buying_signals: {}\n", ctx.icp.buying_signals.join(", ")));

    out.push_str("\n## Style\n");
    out.push_str(&format!("  tone: {}\n", ctx.style.tone));
    out.push_str(&format!("  signoff: {}\n", ctx.style.signoff));
    out.push_str(&format!("  calendar_link: {}", ctx.style.calendar_link));

    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationStage, LeadCategory, SourceChannel};
    use chrono::{TimeZone, Utc};

    fn library_with_templates(templates: &[(&str, &str)]) -> (PromptLibrary, tempfile_dir::Dir) {
        let dir = tempfile_dir::Dir::new("sdr-prompts-test");
        let prompts = dir.path().join("prompts");
        let examples = dir.path().join("examples");
        std::fs::create_dir_all(&prompts).unwrap();
        std::fs::create_dir_all(&examples).unwrap();
        for (name, body) in templates {
            std::fs::write(prompts.join(format!("{name}.txt")), body).unwrap();
        }

        let mut ctx = SalesContext::default();
        ctx.company.name = "Growlancer".into();
        ctx.product.value_props = vec!["saves time".into(), "books calls".into()];
        ctx.icp.roles = vec!["Founder".into(), "VP Sales".into()];
        ctx.style.tone = "casual".into();

        let db = Arc::new(Database::open(":memory:").unwrap());
        let library = PromptLibrary::new(&prompts, &examples, ctx, db);
        (library, dir)
    }

    // Small self-cleaning temp dir helper.
    mod tempfile_dir {
        use std::path::{Path, PathBuf};

        pub struct Dir(PathBuf);

        impl Dir {
            pub fn new(prefix: &str) -> Self {
                let path = std::env::temp_dir().join(format!(
                    "{prefix}-{}-{:?}",
                    std::process::id(),
                    std::thread::current().id()
                ));
                std::fs::create_dir_all(&path).unwrap();
                Dir(path)
            }

            pub fn path(&self) -> &Path {
                &self.0
            }
        }

        impl Drop for Dir {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.0);
            }
        }
    }

    fn sample_message() -> InboundMessage {
        let mut msg = InboundMessage::new(
            SourceChannel::Gmail,
            "m1",
            "Sarah Chen",
            "We need help with outbound.",
            Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
        );
        msg.sender_email = "sarah@acme.com".into();
        msg.subject = "Question about Growlancer".into();
        msg
    }

    fn sample_classification() -> LeadClassification {
        LeadClassification {
            category: LeadCategory::Warm,
            confidence: 0.85,
            reasoning: "clear buying intent".into(),
            detected_intent: "buying signal".into(),
            detected_signals: vec!["asked about pricing".into()],
            should_reply: true,
            conversation_stage: ConversationStage::Qualifying,
            icp_match_score: 0.9,
        }
    }

    #[test]
    fn classification_prompt_fills_placeholders() {
        let (library, _dir) = library_with_templates(&[(
            "classify_lead",
            "Context: {{SALES_CONTEXT}}\nFrom: {{SENDER_NAME}} <{{SENDER_EMAIL}}>\n\
             Title: {{SENDER_TITLE}}\nBody: {{BODY}}\nStage: {{CURRENT_STAGE}}\n\
             Enrichment: {{ENRICHMENT_DATA}}",
        )]);

        let prompt = library
            .build_classification_prompt(&sample_message(), "", "")
            .unwrap();
        assert!(prompt.contains("Growlancer"));
        assert!(prompt.contains("From: Sarah Chen <sarah@acme.com>"));
        // Empty optional fields fall back to placeholders
        assert!(prompt.contains("Title: N/A"));
        assert!(prompt.contains("Stage: New"));
        assert!(prompt.contains("Enrichment: None available"));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn reply_prompt_includes_classification_and_rules() {
        let (library, _dir) = library_with_templates(&[(
            "draft_reply",
            "Category: {{LEAD_CATEGORY}} ({{CONFIDENCE}})\nSignals: {{DETECTED_SIGNALS}}\n\
             Rules:\n{{LEARNED_RULES}}",
        )]);

        let prompt = library
            .build_reply_prompt(&sample_message(), &sample_classification(), "", 150)
            .unwrap();
        assert!(prompt.contains("Category: Warm (0.85)"));
        assert!(prompt.contains("Signals: asked about pricing"));
        assert!(prompt.contains("No learned preferences yet."));
    }

    #[test]
    fn reply_prompt_numbers_active_rules() {
        let (library, _dir) =
            library_with_templates(&[("draft_reply", "Rules:\n{{LEARNED_RULES}}")]);
        library.db.insert_learned_rule("Keep replies under 60 words", 0.9).unwrap();
        library.db.insert_learned_rule("Never use exclamation marks", 0.8).unwrap();

        let prompt = library
            .build_reply_prompt(&sample_message(), &sample_classification(), "", 150)
            .unwrap();
        assert!(prompt.contains("1. Keep replies under 60 words"));
        assert!(prompt.contains("2. Never use exclamation marks"));
    }

    #[test]
    fn missing_template_is_an_error() {
        let (library, _dir) = library_with_templates(&[]);
        let err = library
            .build_classification_prompt(&sample_message(), "", "")
            .unwrap_err();
        assert!(err.to_string().contains("classify_lead"));
    }

    #[test]
    fn examples_concatenate_with_headers() {
        let (library, dir) = library_with_templates(&[]);
        let examples_dir = dir.path().join("examples");
        std::fs::write(examples_dir.join("cold_reply.txt"), "Short and direct.").unwrap();
        std::fs::write(examples_dir.join("warm_reply.txt"), "Friendly opener.").unwrap();
        std::fs::write(examples_dir.join("ignore.md"), "not a txt file").unwrap();

        let examples = library.load_examples();
        assert!(examples.contains("--- Example: cold_reply ---\nShort and direct."));
        assert!(examples.contains("--- Example: warm_reply ---"));
        assert!(!examples.contains("not a txt file"));
        // Sorted by filename
        assert!(examples.find("cold_reply").unwrap() < examples.find("warm_reply").unwrap());
    }

    #[test]
    fn edit_analysis_prompt_formats_pairs() {
        let (library, _dir) = library_with_templates(&[(
            "analyze_edits",
            "Existing:\n{{EXISTING_RULES}}\n\nPairs:\n{{EDIT_PAIRS}}",
        )]);

        let pairs = vec![EditedMessage {
            ai_draft: "Hi there! Excited to connect!!".into(),
            human_edit: "Hi, thanks for reaching out.".into(),
            channel: "Gmail".into(),
            lead_category: "Warm".into(),
            edit_distance: 0.42,
        }];
        let prompt = library.build_edit_analysis_prompt(&pairs, &[]).unwrap();
        assert!(prompt.contains("No rules yet."));
        assert!(prompt.contains("### Edit 1 (Channel: Gmail, Lead Category: Warm, Edit Distance: 0.42)"));
        assert!(prompt.contains("**AI Draft:**\nHi there! Excited to connect!!"));
    }

    #[test]
    fn sales_context_flattens_sections() {
        let mut ctx = SalesContext::default();
        ctx.company.name = "Growlancer".into();
        ctx.icp.industries = vec!["SaaS".into(), "Agencies".into()];
        let block = format_sales_context(&ctx);
        assert!(block.contains("## Company"));
        assert!(block.contains("  name: Growlancer"));
        assert!(block.contains("  industries: SaaS, Agencies"));
        assert!(block.contains("## Style"));
    }
}
