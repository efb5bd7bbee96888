// Contact enrichment with a three-tier cascade.
//
// Priority order: RapidAPI real-time people/company data, then Apollo.io
// people match (good for email to LinkedIn URL discovery), then Perplexity
// web search as a last resort. Tier results merge without overwriting, and
// company intelligence is fetched on top whenever a company is known.

pub mod apollo;
pub mod perplexity;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use apollo::ApolloEnricher;
use perplexity::PerplexityEnricher;

const RAPIDAPI_HOST: &str = "real-time-people-company-data.p.rapidapi.com";

/// Identity hints available for an enrichment lookup. Empty fields are
/// simply not used.
#[derive(Debug, Clone, Default)]
pub struct EnrichmentQuery {
    pub email: String,
    pub linkedin_url: String,
    pub name: String,
    pub company: String,
}

pub struct ContactEnricher {
    http: reqwest::Client,
    rapidapi_key: String,
    rapidapi_url: String,
    apollo: Option<ApolloEnricher>,
    perplexity: Option<PerplexityEnricher>,
}

impl ContactEnricher {
    pub fn new(rapidapi_key: &str, apollo_api_key: &str, perplexity_api_key: &str) -> Self {
        ContactEnricher {
            http: reqwest::Client::new(),
            rapidapi_key: rapidapi_key.to_string(),
            rapidapi_url: format!("https://{RAPIDAPI_HOST}"),
            apollo: if apollo_api_key.is_empty() {
                None
            } else {
                Some(ApolloEnricher::new(apollo_api_key))
            },
            perplexity: if perplexity_api_key.is_empty() {
                None
            } else {
                Some(PerplexityEnricher::new(perplexity_api_key))
            },
        }
    }

    pub fn is_available(&self) -> bool {
        !self.rapidapi_key.is_empty() || self.apollo.is_some() || self.perplexity.is_some()
    }

    /// Run the cascade. Returns the merged enrichment object, or `None` when
    /// every tier came up empty.
    pub async fn enrich(&self, query: &EnrichmentQuery) -> Option<Value> {
        if !self.is_available() {
            debug!("no enrichment providers configured");
            return None;
        }

        let mut result = json!({});
        let mut discovered_linkedin_url = query.linkedin_url.clone();

        // Tier 1: RapidAPI person lookup.
        if !query.linkedin_url.is_empty() {
            if let Some(data) = self.rapidapi_person(&[("linkedin_url", &query.linkedin_url)]).await {
                merge(&mut result, &data, "rapidapi_linkedin");
            }
        }
        if is_empty_object(&result) && !query.email.is_empty() {
            if let Some(data) = self.rapidapi_person(&[("email", &query.email)]).await {
                if let Some(url) = data["linkedin_url"].as_str() {
                    if !url.is_empty() {
                        discovered_linkedin_url = url.to_string();
                    }
                }
                merge(&mut result, &data, "rapidapi_email");
            }
        }

        // Tier 2: Apollo people match, when the title is still unknown.
        if let Some(apollo) = &self.apollo {
            let missing_title = result["title"].as_str().unwrap_or_default().is_empty();
            if missing_title && (!query.email.is_empty() || !query.name.is_empty()) {
                if let Some(data) = apollo.enrich(query).await {
                    let apollo_linkedin =
                        data["linkedin_url"].as_str().unwrap_or_default().to_string();
                    merge(&mut result, &data, "apollo");
                    // A discovered URL unlocks a deeper RapidAPI lookup.
                    if !apollo_linkedin.is_empty() && discovered_linkedin_url.is_empty() {
                        discovered_linkedin_url = apollo_linkedin;
                        if let Some(deeper) = self
                            .rapidapi_person(&[("linkedin_url", &discovered_linkedin_url)])
                            .await
                        {
                            merge(&mut result, &deeper, "rapidapi_linkedin");
                        }
                    }
                }
            }
        }

        // Tier 3: Perplexity web search fallback.
        if is_empty_object(&result) {
            if let Some(perplexity) = &self.perplexity {
                if let Some(data) = perplexity.enrich(query).await {
                    merge(&mut result, &data, "perplexity");
                }
            }
        }

        // Company intelligence on top of whatever the tiers found.
        let company_name = result["company"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| {
                if query.company.is_empty() {
                    None
                } else {
                    Some(query.company.clone())
                }
            });
        let company_domain = result["company_domain"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        if company_name.is_some() || company_domain.is_some() {
            if let Some(company_data) = self
                .rapidapi_company(company_name.as_deref(), company_domain.as_deref())
                .await
            {
                result["company_data"] = company_data;
            }
        }

        if !discovered_linkedin_url.is_empty()
            && result["linkedin_url"].as_str().unwrap_or_default().is_empty()
        {
            result["linkedin_url"] = json!(discovered_linkedin_url);
        }

        if is_empty_object(&result) {
            return None;
        }
        info!(
            sources = %result["_sources"],
            has_title = !result["title"].as_str().unwrap_or_default().is_empty(),
            has_company = !result["company"].as_str().unwrap_or_default().is_empty(),
            "enrichment cascade complete"
        );
        Some(result)
    }

    // ------------------------------------------------------------------
    // RapidAPI lookups
    // ------------------------------------------------------------------

    async fn rapidapi_get(&self, path: &str, query: &[(&str, &str)]) -> Option<Value> {
        if self.rapidapi_key.is_empty() {
            return None;
        }
        let url = format!("{}{}", self.rapidapi_url, path);
        let result = self
            .http
            .get(&url)
            .header("X-RapidAPI-Key", &self.rapidapi_key)
            .header("X-RapidAPI-Host", RAPIDAPI_HOST)
            .query(query)
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                let data: Value = resp.json().await.ok()?;
                if data["status"] == "OK" {
                    Some(if data["data"].is_null() {
                        data
                    } else {
                        data["data"].clone()
                    })
                } else {
                    None
                }
            }
            Ok(resp) => {
                debug!(status = resp.status().as_u16(), path, "rapidapi lookup returned no data");
                None
            }
            Err(e) => {
                warn!(error = %e, path, "rapidapi lookup failed");
                None
            }
        }
    }

    async fn rapidapi_person(&self, query: &[(&str, &str)]) -> Option<Value> {
        let person = self.rapidapi_get("/search-person", query).await?;
        Some(normalize_rapidapi_person(&person))
    }

    async fn rapidapi_company(&self, name: Option<&str>, domain: Option<&str>) -> Option<Value> {
        let query: Vec<(&str, &str)> = match (domain, name) {
            (Some(domain), _) => vec![("domain", domain)],
            (None, Some(name)) => vec![("name", name)],
            (None, None) => return None,
        };
        self.rapidapi_get("/search-company", &query).await
    }
}

// ---------------------------------------------------------------------------
// Normalization and merge
// ---------------------------------------------------------------------------

fn is_empty_object(value: &Value) -> bool {
    value.as_object().is_none_or(|m| m.is_empty())
}

pub(crate) fn str_of(person: &Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(s) = person[*key].as_str() {
            if !s.is_empty() {
                return s.to_string();
            }
        }
    }
    String::new()
}

pub(crate) fn normalize_rapidapi_person(person: &Value) -> Value {
    json!({
        "source": "rapidapi",
        "name": str_of(person, &["full_name"]),
        "first_name": str_of(person, &["first_name"]),
        "last_name": str_of(person, &["last_name"]),
        "title": str_of(person, &["job_title", "title"]),
        "linkedin_url": str_of(person, &["linkedin_url"]),
        "email": str_of(person, &["email"]),
        "city": str_of(person, &["city"]),
        "state": str_of(person, &["state"]),
        "country": str_of(person, &["country"]),
        "company": str_of(person, &["company", "company_name"]),
        "company_domain": str_of(person, &["company_domain"]),
        "company_industry": str_of(person, &["industry"]),
        "headline": str_of(person, &["headline"]),
    })
}

/// Merge `new_data` into `existing` without overwriting non-empty values,
/// appending `source` to the `_sources` list.
pub(crate) fn merge(existing: &mut Value, new_data: &Value, source: &str) {
    if !existing.is_object() {
        *existing = json!({});
    }

    let mut sources = existing["_sources"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    if !source.is_empty() {
        sources.push(json!(source));
    }
    existing["_sources"] = Value::Array(sources);

    if let Some(map) = new_data.as_object() {
        for (key, value) in map {
            if key == "_sources" {
                continue;
            }
            let current_empty = match &existing[key] {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                _ => false,
            };
            let new_empty = match value {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::Array(a) => a.is_empty(),
                _ => false,
            };
            if current_empty && !new_empty {
                existing[key] = value.clone();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
