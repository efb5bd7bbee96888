// LinkedIn connection request handling. Polls Unipile for pending
// requests, evaluates each sender against the ICP, and auto-accepts or
// rejects with a full audit trail.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::ai::{ConnectionProfile, EvaluateConnection};
use crate::crm::Crm;
use crate::models::{AuditAction, AuditLogEntry, ConnectionEvaluation};

const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub total: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub errors: usize,
}

pub struct ConnectionRequestHandler {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    evaluator: Arc<dyn EvaluateConnection>,
    crm: Arc<dyn Crm>,
    auto_accept: bool,
    min_icp_confidence: f64,
}

impl ConnectionRequestHandler {
    pub fn new(
        unipile_dsn: &str,
        unipile_api_key: &str,
        evaluator: Arc<dyn EvaluateConnection>,
        crm: Arc<dyn Crm>,
        auto_accept: bool,
        min_icp_confidence: f64,
    ) -> Self {
        Self::with_base_url(
            &format!("https://{unipile_dsn}/api/v1"),
            unipile_api_key,
            evaluator,
            crm,
            auto_accept,
            min_icp_confidence,
        )
    }

    pub fn with_base_url(
        base_url: &str,
        unipile_api_key: &str,
        evaluator: Arc<dyn EvaluateConnection>,
        crm: Arc<dyn Crm>,
        auto_accept: bool,
        min_icp_confidence: f64,
    ) -> Self {
        ConnectionRequestHandler {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: unipile_api_key.to_string(),
            evaluator,
            crm,
            auto_accept,
            min_icp_confidence,
        }
    }

    pub async fn process_requests(&self) -> ConnectionStats {
        let mut stats = ConnectionStats::default();

        let pending = match self.fetch_pending_requests().await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "failed to fetch connection requests");
                return stats;
            }
        };

        stats.total = pending.len();
        if pending.is_empty() {
            return stats;
        }
        info!(count = pending.len(), "pending connection requests found");

        for request in &pending {
            if let Err(e) = self.process_single_request(request, &mut stats).await {
                error!(
                    request_id = request["id"].as_str().unwrap_or_default(),
                    error = %e,
                    "connection request processing failed"
                );
                stats.errors += 1;
            }
        }

        info!(
            total = stats.total,
            accepted = stats.accepted,
            rejected = stats.rejected,
            errors = stats.errors,
            "connection batch complete"
        );
        stats
    }

    async fn process_single_request(
        &self,
        request: &Value,
        stats: &mut ConnectionStats,
    ) -> Result<()> {
        let request_id = request["id"].as_str().unwrap_or_default().to_string();
        let profile = profile_from_request(request);
        let linkedin_url = field(request, &["linkedin_url", "profile_url"]);

        let evaluation = self.evaluator.evaluate(&profile).await?;
        info!(
            request_id = %request_id,
            name = %profile.name,
            accept = evaluation.accept,
            confidence = evaluation.confidence,
            category = evaluation.lead_category.as_str(),
            "connection request evaluated"
        );

        if evaluation.accept && self.auto_accept && evaluation.confidence >= self.min_icp_confidence
        {
            self.accept_request(&request_id).await?;
            info!(request_id = %request_id, "connection auto-accepted");

            let contact = self
                .crm
                .create_contact(json!({
                    "Name": profile.name,
                    "LinkedIn URL": linkedin_url,
                    "Company": profile.company,
                    "Title": profile.headline,
                    "Source Channel": "LinkedIn",
                    "Lead Category": evaluation.lead_category.as_str(),
                    "Conversation Stage": "New",
                    "AI Confidence": evaluation.confidence,
                    "AI Reasoning": evaluation.reasoning,
                }))
                .await?;
            self.crm
                .log_audit(
                    &AuditLogEntry::new(AuditAction::AutoAccepted)
                        .with_contact(&contact.id)
                        .with_details(audit_details(&profile, &evaluation)),
                )
                .await?;
            stats.accepted += 1;
        } else {
            if !evaluation.accept {
                self.reject_request(&request_id).await?;
                info!(request_id = %request_id, "connection auto-rejected");
                self.crm
                    .log_audit(
                        &AuditLogEntry::new(AuditAction::AutoRejected)
                            .with_details(audit_details(&profile, &evaluation)),
                    )
                    .await?;
            } else {
                // ICP fit but low confidence: accept without CRM promotion.
                self.accept_request(&request_id).await?;
                info!(request_id = %request_id, "connection accepted with low confidence");
            }
            stats.rejected += 1;
        }

        Ok(())
    }

    // ------------------------------------------------------------------
    // Unipile API
    // ------------------------------------------------------------------

    async fn fetch_pending_requests(&self) -> Result<Vec<Value>> {
        let url = format!("{}/connection_requests", self.base_url);
        let data = self
            .request(|http| http.get(&url).query(&[("status", "pending")]))
            .await?;
        Ok(data["items"]
            .as_array()
            .or(data["data"].as_array())
            .cloned()
            .unwrap_or_default())
    }

    async fn accept_request(&self, request_id: &str) -> Result<()> {
        let url = format!("{}/connection_requests/{request_id}/accept", self.base_url);
        self.request(|http| http.post(&url)).await?;
        Ok(())
    }

    async fn reject_request(&self, request_id: &str) -> Result<()> {
        let url = format!("{}/connection_requests/{request_id}/reject", self.base_url);
        self.request(|http| http.post(&url)).await?;
        Ok(())
    }

    async fn request<F>(&self, build: F) -> Result<Value>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut backoff = RETRY_BASE;
        let mut last_error = None;

        for attempt in 1..=MAX_ATTEMPTS {
            let result = build(&self.http)
                .header("X-API-KEY", &self.api_key)
                .send()
                .await;

            match result {
                Ok(resp) if resp.status().is_success() => {
                    return Ok(resp.json().await.unwrap_or_else(|_| json!({})));
                }
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_client_error() && status.as_u16() != 429 {
                        bail!("unipile returned {status}");
                    }
                    last_error = Some(anyhow!("unipile returned {status}"));
                }
                Err(e) => {
                    last_error = Some(anyhow!(e).context("unipile request failed"));
                }
            }

            if attempt < MAX_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RETRY_MAX);
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("unipile request failed")))
    }
}

fn field(request: &Value, keys: &[&str]) -> String {
    for key in keys {
        if let Some(s) = request[*key].as_str() {
            if !s.is_empty() {
                return s.to_string();
            }
        }
    }
    String::new()
}

fn profile_from_request(request: &Value) -> ConnectionProfile {
    ConnectionProfile {
        name: field(request, &["name", "sender_name"]),
        headline: field(request, &["headline"]),
        company: field(request, &["company"]),
        location: field(request, &["location"]),
        mutual_connections: request["mutual_connections"].as_i64().unwrap_or(0),
        request_message: field(request, &["message"]),
        profile_summary: field(request, &["summary"]),
    }
}

fn audit_details(profile: &ConnectionProfile, evaluation: &ConnectionEvaluation) -> String {
    json!({
        "name": profile.name,
        "headline": profile.headline,
        "company": profile.company,
        "confidence": evaluation.confidence,
        "reasoning": evaluation.reasoning,
    })
    .to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
