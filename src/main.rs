// SDR assistant entry point.
//
// Startup sequence:
// 1. Initialize tracing (timestamped file under data/logs/)
// 2. Seed config from defaults, load and validate it
// 3. Open the local SQLite store
// 4. Validate secrets and ping the Anthropic API
// 5. Ensure the Airtable schema
// 6. Build sources, AI components, sender, handlers
// 7. Hand everything to the orchestration loop (runs until ctrl-c)

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{info, warn};

use sdr::ai::classifier::LeadClassifier;
use sdr::ai::client::AnthropicClient;
use sdr::ai::connection_eval::ConnectionEvaluator;
use sdr::ai::drafter::ReplyDrafter;
use sdr::ai::learner::SelfLearner;
use sdr::ai::prompts::PromptLibrary;
use sdr::ai::{Classify, Draft};
use sdr::app::{self, Components};
use sdr::config::{self, Config};
use sdr::connections::ConnectionRequestHandler;
use sdr::crm::airtable::AirtableCrm;
use sdr::crm::Crm;
use sdr::db::Database;
use sdr::enrichment::ContactEnricher;
use sdr::followup::FollowupEngine;
use sdr::pipeline::InboundPipeline;
use sdr::sending::rate_limiter::RateLimiter;
use sdr::sending::{MessageSender, Transport};
use sdr::sources::gmail::{GmailCredentials, GmailSource};
use sdr::sources::linkedin::LinkedInSource;
use sdr::sources::MessageSource;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;
    info!("SDR assistant starting up");

    // Seed config/ from defaults/ on first run, then load.
    let base_dir = std::env::current_dir().context("cannot determine working directory")?;
    let copied = config::ensure_config_files(&base_dir)?;
    for path in &copied {
        info!(path = %path.display(), "seeded config file from defaults");
    }
    let config = config::load_config().context("failed to load configuration")?;
    info!(
        polling_interval = config.polling.interval_seconds,
        enrichment_enabled = config.enrichment.enabled,
        connections_auto_accept = config.connections.auto_accept,
        "config loaded"
    );

    std::fs::create_dir_all("data").context("failed to create data directory")?;
    let db = Arc::new(Database::open("data/sdr.db").context("failed to open database")?);

    let client = Arc::new(AnthropicClient::new(secret(
        &config.credentials.anthropic_api_key,
    )));
    app::validate_startup(&config, &client)
        .await
        .context("startup validation failed")?;

    let airtable = AirtableCrm::new(
        secret(&config.credentials.airtable_api_key),
        secret(&config.credentials.airtable_base_id),
    );
    airtable
        .ensure_schema()
        .await
        .context("failed to ensure Airtable schema")?;
    info!("Airtable schema ready");
    let crm: Arc<dyn Crm> = Arc::new(airtable);

    let components = build_components(config, crm, db, client).await;

    let interval = components.config.polling.interval_seconds;
    println!("SDR assistant is running. Polling every {interval}s, press ctrl-c to stop.");

    app::run(components).await?;
    println!("Shutdown complete.");
    Ok(())
}

/// Wire up every component from config and credentials. Optional pieces
/// (Gmail, LinkedIn, enrichment, learner, follow-up) degrade to `None`
/// rather than failing startup.
async fn build_components(
    config: Config,
    crm: Arc<dyn Crm>,
    db: Arc<Database>,
    client: Arc<AnthropicClient>,
) -> Components {
    let prompts = Arc::new(PromptLibrary::new(
        &config.prompts_dir,
        &config.examples_dir,
        config.sales_context.clone(),
        Arc::clone(&db),
    ));

    let classifier: Arc<dyn Classify> = Arc::new(LeadClassifier::new(
        Arc::clone(&client),
        Arc::clone(&prompts),
        &config.classification.model,
        config.classification.temperature,
    ));
    let drafter: Arc<dyn Draft> = Arc::new(ReplyDrafter::new(
        Arc::clone(&client),
        Arc::clone(&prompts),
        config.reply_drafting.clone(),
    ));

    let enricher = build_enricher(&config);

    // Sources. Each one is polled only when its credentials check out.
    let mut sources: Vec<Arc<dyn MessageSource>> = Vec::new();

    let gmail = build_gmail(&config, &db).await;
    if let Some(source) = &gmail {
        sources.push(Arc::clone(source) as Arc<dyn MessageSource>);
    }

    let unipile_dsn = secret(&config.credentials.unipile_dsn).to_string();
    let unipile_api_key = secret(&config.credentials.unipile_api_key).to_string();
    let mut linkedin_ok = false;
    if !unipile_dsn.is_empty() && !unipile_api_key.is_empty() {
        let source = Arc::new(LinkedInSource::new(
            &unipile_dsn,
            &unipile_api_key,
            Arc::clone(&db),
        ));
        if source.is_available().await {
            info!("LinkedIn source available");
            linkedin_ok = true;
            sources.push(source);
        } else {
            warn!("LinkedIn source not available, check Unipile credentials");
        }
    }
    if sources.is_empty() {
        warn!("no inbound sources configured, polling will be idle");
    }

    let limiter = Arc::new(RateLimiter::new(
        config.sending.gmail_per_hour,
        config.sending.linkedin_per_hour,
    ));
    let sender: Arc<dyn Transport> = Arc::new(MessageSender::new(
        gmail,
        &unipile_dsn,
        &unipile_api_key,
        limiter,
    ));

    let connections = if linkedin_ok {
        let evaluator = Arc::new(ConnectionEvaluator::new(
            Arc::clone(&client),
            Arc::clone(&prompts),
            &config.classification.model,
            config.classification.temperature,
        ));
        Some(ConnectionRequestHandler::new(
            &unipile_dsn,
            &unipile_api_key,
            evaluator,
            Arc::clone(&crm),
            config.connections.auto_accept,
            config.connections.min_icp_confidence,
        ))
    } else {
        None
    };

    let learner = if config.learning.enabled {
        Some(SelfLearner::new(
            Arc::clone(&client),
            Arc::clone(&prompts),
            Arc::clone(&crm),
            Arc::clone(&db),
            &config.classification.model,
            config.classification.temperature,
            config.learning.clone(),
        ))
    } else {
        None
    };

    let followup = if config.followup.enabled {
        Some(FollowupEngine::new(
            Arc::clone(&crm),
            Arc::clone(&drafter),
            config.followup.clone(),
        ))
    } else {
        None
    };

    let pipeline = InboundPipeline::new(
        Arc::clone(&crm),
        classifier,
        drafter,
        enricher,
        Arc::clone(&db),
    );

    Components {
        config,
        crm,
        pipeline,
        sources,
        sender,
        connections,
        followup,
        learner,
    }
}

fn build_enricher(config: &Config) -> Option<Arc<ContactEnricher>> {
    if !config.enrichment.enabled {
        return None;
    }
    let enricher = ContactEnricher::new(
        secret(&config.credentials.rapidapi_key),
        secret(&config.credentials.apollo_api_key),
        secret(&config.credentials.perplexity_api_key),
    );
    if enricher.is_available() {
        info!("contact enrichment enabled");
        Some(Arc::new(enricher))
    } else {
        warn!("enrichment enabled but no provider keys configured");
        None
    }
}

async fn build_gmail(config: &Config, db: &Arc<Database>) -> Option<Arc<GmailSource>> {
    let path = config.credentials.gmail_credentials_path.as_deref()?;
    match GmailCredentials::from_file(Path::new(path)) {
        Ok(credentials) => {
            let source = Arc::new(GmailSource::new(credentials, Arc::clone(db)));
            if source.is_available().await {
                info!("Gmail source available");
                Some(source)
            } else {
                warn!("Gmail source not available, check OAuth credentials");
                None
            }
        }
        Err(e) => {
            warn!(error = %e, "Gmail credentials not loaded");
            None
        }
    }
}

fn secret(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("")
}

/// Log to a timestamped file so the terminal stays quiet while the loop
/// runs in the background.
fn init_tracing() -> Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = Path::new("data").join("logs");
    std::fs::create_dir_all(&log_dir).context("failed to create log directory")?;
    let log_path = log_dir.join(format!("sdr-{}.log", Local::now().format("%Y%m%d-%H%M%S")));
    let log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("failed to create log file {}", log_path.display()))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sdr=info,warn")),
        )
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}
