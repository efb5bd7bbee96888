// Orchestration: the polling cycles, per-source circuit breaker and daily
// job scheduling that keep the system running unattended.
//
// `main.rs` builds a `Components` bundle and hands it to `run`, which loops
// until ctrl-c: inbound + outbound + connection cycles every poll interval,
// learning and follow-up once a day at their configured times.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::ai::client::AnthropicClient;
use crate::ai::learner::SelfLearner;
use crate::config::{self, Config};
use crate::connections::ConnectionRequestHandler;
use crate::crm::Crm;
use crate::followup::FollowupEngine;
use crate::outbound;
use crate::pipeline::InboundPipeline;
use crate::sending::Transport;
use crate::sources::MessageSource;

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Per-source circuit breaker for inbound polling. A run of consecutive
/// failures opens the breaker for a cooldown period; any success closes it.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    failures: HashMap<&'static str, u32>,
    open_until: HashMap<&'static str, Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        CircuitBreaker {
            threshold,
            cooldown,
            failures: HashMap::new(),
            open_until: HashMap::new(),
        }
    }

    pub fn record_failure(&mut self, source: &'static str) {
        let count = self.failures.entry(source).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            self.open_until.insert(source, Instant::now() + self.cooldown);
            warn!(
                source,
                cooldown_seconds = self.cooldown.as_secs(),
                "circuit breaker opened"
            );
        }
    }

    pub fn record_success(&mut self, source: &'static str) {
        self.failures.insert(source, 0);
        self.open_until.remove(source);
    }

    /// Whether polling should be skipped. An expired cooldown closes the
    /// breaker and resets the failure count.
    pub fn is_open(&mut self, source: &'static str) -> bool {
        match self.open_until.get(source) {
            None => false,
            Some(until) if Instant::now() >= *until => {
                self.open_until.remove(source);
                self.failures.insert(source, 0);
                false
            }
            Some(_) => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Daily scheduling
// ---------------------------------------------------------------------------

/// Time until the next daily occurrence of an "HH:MM" schedule string,
/// relative to `now`. A time earlier than or equal to `now` rolls over to
/// tomorrow. Returns `None` for an unparseable schedule.
pub fn duration_until_daily(run_at: &str, now: DateTime<Local>) -> Option<Duration> {
    let (hour, minute) = config::parse_run_at(run_at)?;
    let today = now.date_naive().and_hms_opt(hour, minute, 0)?;
    let target = if today > now.naive_local() {
        today
    } else {
        today + chrono::Duration::days(1)
    };
    (target - now.naive_local()).to_std().ok()
}

/// Deadline for the next daily run, or `None` when the job is disabled or
/// the schedule string is invalid (logged once at startup).
fn next_daily_deadline(enabled: bool, run_at: &str) -> Option<Instant> {
    if !enabled {
        return None;
    }
    match duration_until_daily(run_at, Local::now()) {
        Some(wait) => Some(Instant::now() + wait),
        None => {
            warn!(run_at, "invalid daily schedule time, job disabled");
            None
        }
    }
}

/// Sleep until an optional deadline; never wakes when there is none.
async fn sleep_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Everything the main loop needs, wired up by `main.rs`.
pub struct Components {
    pub config: Config,
    pub crm: Arc<dyn Crm>,
    pub pipeline: InboundPipeline,
    pub sources: Vec<Arc<dyn MessageSource>>,
    pub sender: Arc<dyn Transport>,
    pub connections: Option<ConnectionRequestHandler>,
    pub followup: Option<FollowupEngine>,
    pub learner: Option<SelfLearner>,
}

impl Components {
    /// Poll every source and push new messages through the inbound pipeline.
    /// A failing source trips its breaker instead of aborting the cycle.
    pub async fn run_inbound_cycle(&self, breaker: &mut CircuitBreaker) {
        for source in &self.sources {
            let name = source.name();
            if breaker.is_open(name) {
                debug!(source = name, "circuit open, skipping poll");
                continue;
            }
            match source.poll().await {
                Ok(messages) => {
                    if !messages.is_empty() {
                        info!(source = name, count = messages.len(), "new inbound messages");
                        let stats = self.pipeline.process_batch(&messages).await;
                        info!(
                            source = name,
                            processed = stats.processed,
                            skipped = stats.skipped,
                            failed = stats.failed,
                            "inbound batch complete"
                        );
                    }
                    breaker.record_success(name);
                }
                Err(e) => {
                    error!(source = name, error = %e, "inbound poll failed");
                    breaker.record_failure(name);
                }
            }
        }
    }

    pub async fn run_outbound_cycle(&self) {
        let stats = outbound::process_approved_messages(&self.crm, &self.sender).await;
        if stats.total > 0 {
            info!(sent = stats.sent, failed = stats.failed, "outbound cycle complete");
        }
    }

    pub async fn run_connection_cycle(&self) {
        if let Some(handler) = &self.connections {
            let stats = handler.process_requests().await;
            if stats.total > 0 {
                info!(
                    accepted = stats.accepted,
                    rejected = stats.rejected,
                    errors = stats.errors,
                    "connection cycle complete"
                );
            }
        }
    }

    pub async fn run_learning_cycle(&self) {
        if let Some(learner) = &self.learner {
            match learner.run_learning_cycle().await {
                Ok(stats) => info!(
                    messages_analyzed = stats.messages_analyzed,
                    new_rules = stats.new_rules,
                    "learning cycle complete"
                ),
                Err(e) => error!(error = %e, "learning cycle failed"),
            }
        }
    }

    pub async fn run_followup_cycle(&self) {
        if let Some(engine) = &self.followup {
            match engine.run_cycle().await {
                Ok(stats) => info!(
                    activated = stats.activated,
                    drafted = stats.drafted,
                    auto_approved = stats.auto_approved,
                    exhausted = stats.exhausted,
                    "follow-up cycle complete"
                ),
                Err(e) => error!(error = %e, "follow-up cycle failed"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Startup validation
// ---------------------------------------------------------------------------

/// Fail fast on missing secrets or an unreachable Anthropic API. Airtable
/// reachability is covered by `ensure_schema`, which runs right after.
pub async fn validate_startup(config: &Config, client: &AnthropicClient) -> Result<()> {
    config::validate_credentials(&config.credentials)
        .context("missing required credentials")?;

    client
        .ping(&config.classification.model)
        .await
        .context("Anthropic API unreachable")?;
    info!("Anthropic API ok");

    Ok(())
}

// ---------------------------------------------------------------------------
// Main loop
// ---------------------------------------------------------------------------

/// Run until ctrl-c. The first polling cycle fires immediately; in-flight
/// cycles finish before shutdown.
pub async fn run(components: Components) -> Result<()> {
    let error_handling = &components.config.error_handling;
    let mut breaker = CircuitBreaker::new(
        error_handling.circuit_breaker_threshold,
        Duration::from_secs(error_handling.circuit_breaker_cooldown_seconds),
    );

    let mut poll = interval(Duration::from_secs(
        components.config.polling.interval_seconds,
    ));
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let learning = &components.config.learning;
    let followup = &components.config.followup;
    let mut learning_deadline = next_daily_deadline(
        learning.enabled && components.learner.is_some(),
        &learning.run_at,
    );
    let mut followup_deadline = next_daily_deadline(
        followup.enabled && components.followup.is_some(),
        &followup.run_at,
    );
    if learning_deadline.is_some() {
        info!(run_at = %learning.run_at, "learning cycle scheduled daily");
    }
    if followup_deadline.is_some() {
        info!(run_at = %followup.run_at, "follow-up cycle scheduled daily");
    }

    loop {
        tokio::select! {
            _ = poll.tick() => {
                components.run_inbound_cycle(&mut breaker).await;
                components.run_outbound_cycle().await;
                components.run_connection_cycle().await;
            }
            _ = sleep_opt(learning_deadline) => {
                components.run_learning_cycle().await;
                learning_deadline =
                    next_daily_deadline(true, &components.config.learning.run_at);
            }
            _ = sleep_opt(followup_deadline) => {
                components.run_followup_cycle().await;
                followup_deadline =
                    next_daily_deadline(true, &components.config.followup.run_at);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    info!("shutdown complete");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn breaker_opens_after_threshold_failures() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(600));
        breaker.record_failure("gmail");
        breaker.record_failure("gmail");
        assert!(!breaker.is_open("gmail"));
        breaker.record_failure("gmail");
        assert!(breaker.is_open("gmail"));
    }

    #[tokio::test]
    async fn breaker_tracks_sources_independently() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(600));
        breaker.record_failure("gmail");
        breaker.record_failure("gmail");
        assert!(breaker.is_open("gmail"));
        assert!(!breaker.is_open("linkedin"));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_secs(600));
        breaker.record_failure("gmail");
        breaker.record_success("gmail");
        breaker.record_failure("gmail");
        assert!(!breaker.is_open("gmail"));
    }

    #[tokio::test(start_paused = true)]
    async fn breaker_closes_after_cooldown() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(600));
        breaker.record_failure("gmail");
        assert!(breaker.is_open("gmail"));

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(!breaker.is_open("gmail"));

        // The expired breaker also reset the failure count.
        breaker.record_failure("gmail");
        assert!(breaker.is_open("gmail"));
    }

    #[test]
    fn daily_wait_same_day() {
        let now = Local.with_ymd_and_hms(2025, 6, 10, 1, 0, 0).unwrap();
        let wait = duration_until_daily("03:30", now).unwrap();
        assert_eq!(wait, Duration::from_secs(2 * 3600 + 30 * 60));
    }

    #[test]
    fn daily_wait_rolls_to_tomorrow() {
        let now = Local.with_ymd_and_hms(2025, 6, 10, 4, 0, 0).unwrap();
        let wait = duration_until_daily("03:30", now).unwrap();
        assert_eq!(wait, Duration::from_secs(23 * 3600 + 30 * 60));
    }

    #[test]
    fn daily_wait_exact_time_is_tomorrow() {
        let now = Local.with_ymd_and_hms(2025, 6, 10, 3, 30, 0).unwrap();
        let wait = duration_until_daily("03:30", now).unwrap();
        assert_eq!(wait, Duration::from_secs(24 * 3600));
    }

    #[test]
    fn daily_wait_rejects_bad_schedule() {
        let now = Local.with_ymd_and_hms(2025, 6, 10, 3, 30, 0).unwrap();
        assert!(duration_until_daily("3:30", now).is_none());
        assert!(duration_until_daily("25:00", now).is_none());
        assert!(duration_until_daily("soon", now).is_none());
    }
}
