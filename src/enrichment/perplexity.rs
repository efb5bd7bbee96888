// Perplexity web-search enrichment, the last-resort tier. Asks the sonar
// model to research the person online and return a JSON object.

use serde_json::{json, Value};
use tracing::{debug, warn};

use super::EnrichmentQuery;

const PERPLEXITY_API_URL: &str = "https://api.perplexity.ai/chat/completions";
const MODEL: &str = "sonar";

pub struct PerplexityEnricher {
    http: reqwest::Client,
    api_key: String,
    api_url: String,
}

impl PerplexityEnricher {
    pub fn new(api_key: &str) -> Self {
        PerplexityEnricher {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            api_url: PERPLEXITY_API_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_api_url(api_key: &str, api_url: &str) -> Self {
        PerplexityEnricher {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            api_url: api_url.to_string(),
        }
    }

    pub async fn enrich(&self, query: &EnrichmentQuery) -> Option<Value> {
        let prompt = research_prompt(query)?;

        let payload = json!({
            "model": MODEL,
            "temperature": 0.1,
            "messages": [
                { "role": "user", "content": prompt },
            ],
        });

        let result = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .timeout(std::time::Duration::from_secs(30))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                let data: Value = resp.json().await.ok()?;
                let content = data["choices"][0]["message"]["content"].as_str()?;
                parse_response(content)
            }
            Ok(resp) => {
                debug!(status = resp.status().as_u16(), "perplexity search returned no data");
                None
            }
            Err(e) => {
                warn!(error = %e, "perplexity search failed");
                None
            }
        }
    }
}

fn research_prompt(query: &EnrichmentQuery) -> Option<String> {
    let mut subject = Vec::new();
    if !query.name.is_empty() && query.name != "Unknown" {
        subject.push(query.name.clone());
    }
    if !query.company.is_empty() {
        subject.push(format!("at {}", query.company));
    }
    if !query.email.is_empty() {
        subject.push(format!("(email: {})", query.email));
    }
    if !query.linkedin_url.is_empty() {
        subject.push(format!("(LinkedIn: {})", query.linkedin_url));
    }
    if subject.is_empty() {
        return None;
    }

    Some(format!(
        "Research this person online: {}.\n\n\
         Return ONLY a JSON object with these fields (use empty string when unknown):\n\
         {{\"name\": \"\", \"title\": \"\", \"company\": \"\", \"linkedin_url\": \"\", \
         \"city\": \"\", \"country\": \"\", \"company_industry\": \"\", \
         \"company_size_estimate\": \"\", \"recent_news\": \"\"}}\n\n\
         No prose, no markdown, just the JSON object.",
        subject.join(" ")
    ))
}

/// Extract the JSON object from the model reply, tolerating markdown fences
/// and surrounding prose.
fn parse_response(content: &str) -> Option<Value> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    let mut parsed: Value = serde_json::from_str(&content[start..=end]).ok()?;
    if !parsed.is_object() {
        return None;
    }
    parsed["source"] = json!("perplexity");
    Some(parsed)
}
