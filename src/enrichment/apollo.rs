// Apollo.io people match. Strong at resolving an email address to a
// LinkedIn profile and pulling company firmographics.

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::{str_of, EnrichmentQuery};

const APOLLO_MATCH_URL: &str = "https://api.apollo.io/api/v1/people/match";

pub struct ApolloEnricher {
    http: reqwest::Client,
    api_key: String,
    api_url: String,
}

impl ApolloEnricher {
    pub fn new(api_key: &str) -> Self {
        ApolloEnricher {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            api_url: APOLLO_MATCH_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub fn with_api_url(api_key: &str, api_url: &str) -> Self {
        ApolloEnricher {
            http: reqwest::Client::new(),
            api_key: api_key.to_string(),
            api_url: api_url.to_string(),
        }
    }

    pub async fn enrich(&self, query: &EnrichmentQuery) -> Option<Value> {
        let payload = match_payload(query);
        if payload.is_empty() {
            return None;
        }

        let result = self
            .http
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .json(&Value::Object(payload))
            .timeout(std::time::Duration::from_secs(15))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                let data: Value = resp.json().await.ok()?;
                let person = &data["person"];
                if person.is_object() {
                    Some(normalize_apollo_person(person))
                } else {
                    debug!("apollo found no match");
                    None
                }
            }
            Ok(resp) if resp.status().as_u16() == 429 => {
                warn!("apollo rate limit hit");
                None
            }
            Ok(resp) => {
                debug!(status = resp.status().as_u16(), "apollo match returned no data");
                None
            }
            Err(e) => {
                warn!(error = %e, "apollo match failed");
                None
            }
        }
    }
}

fn match_payload(query: &EnrichmentQuery) -> Map<String, Value> {
    let mut payload = Map::new();
    if !query.email.is_empty() {
        payload.insert("email".into(), json!(query.email));
    }
    if !query.linkedin_url.is_empty() {
        payload.insert("linkedin_url".into(), json!(query.linkedin_url));
    }
    if !query.name.is_empty() {
        let mut parts = query.name.splitn(2, ' ');
        if let Some(first) = parts.next() {
            payload.insert("first_name".into(), json!(first));
        }
        if let Some(last) = parts.next() {
            payload.insert("last_name".into(), json!(last));
        }
        if !query.company.is_empty() {
            payload.insert("organization_name".into(), json!(query.company));
        }
    }
    payload
}

fn normalize_apollo_person(person: &Value) -> Value {
    let org = &person["organization"];
    let mut normalized = json!({
        "source": "apollo",
        "name": str_of(person, &["name"]),
        "first_name": str_of(person, &["first_name"]),
        "last_name": str_of(person, &["last_name"]),
        "title": str_of(person, &["title"]),
        "linkedin_url": str_of(person, &["linkedin_url"]),
        "email": str_of(person, &["email"]),
        "city": str_of(person, &["city"]),
        "state": str_of(person, &["state"]),
        "country": str_of(person, &["country"]),
        "company": str_of(org, &["name"]),
        "company_domain": str_of(org, &["primary_domain"]),
        "company_industry": str_of(org, &["industry"]),
        "headline": str_of(person, &["headline"]),
    });
    if let Some(size) = org["estimated_num_employees"].as_i64() {
        normalized["company_size"] = json!(size);
    }
    if let Some(history) = person["employment_history"].as_array() {
        if !history.is_empty() {
            normalized["employment_history"] = json!(history
                .iter()
                .take(3)
                .map(|job| {
                    json!({
                        "title": str_of(job, &["title"]),
                        "company": str_of(job, &["organization_name"]),
                    })
                })
                .collect::<Vec<_>>());
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_splits_name_into_first_last() {
        let query = EnrichmentQuery {
            name: "Sarah Chen".into(),
            company: "Acme".into(),
            ..Default::default()
        };
        let payload = match_payload(&query);
        assert_eq!(payload["first_name"], "Sarah");
        assert_eq!(payload["last_name"], "Chen");
        assert_eq!(payload["organization_name"], "Acme");
    }

    #[test]
    fn payload_single_word_name_has_no_last() {
        let query = EnrichmentQuery {
            name: "Madonna".into(),
            ..Default::default()
        };
        let payload = match_payload(&query);
        assert_eq!(payload["first_name"], "Madonna");
        assert!(!payload.contains_key("last_name"));
    }

    #[test]
    fn payload_empty_query_is_empty() {
        assert!(match_payload(&EnrichmentQuery::default()).is_empty());
    }

    #[test]
    fn apollo_normalization_pulls_organization_fields() {
        let person = json!({
            "name": "Sarah Chen",
            "title": "VP Engineering",
            "linkedin_url": "https://linkedin.com/in/sarahchen",
            "organization": {
                "name": "Acme Corp",
                "primary_domain": "acme.com",
                "industry": "Software",
                "estimated_num_employees": 250,
            },
            "employment_history": [
                { "title": "VP Engineering", "organization_name": "Acme Corp" },
                { "title": "Director", "organization_name": "Beta Inc" },
            ],
        });
        let normalized = normalize_apollo_person(&person);
        assert_eq!(normalized["source"], "apollo");
        assert_eq!(normalized["company"], "Acme Corp");
        assert_eq!(normalized["company_domain"], "acme.com");
        assert_eq!(normalized["company_size"], 250);
        assert_eq!(normalized["employment_history"].as_array().unwrap().len(), 2);
        assert_eq!(normalized["employment_history"][1]["company"], "Beta Inc");
    }
}
