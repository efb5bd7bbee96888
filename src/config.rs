// Configuration loading and parsing (config.toml, sales_context.toml,
// credentials.toml) plus prompt template seeding from defaults/.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("validation error for field `{field}`: {message}")]
    ValidationError { field: String, message: String },

    #[error("failed to initialize config from defaults: {message}")]
    DefaultsCopyError { message: String },
}

// ---------------------------------------------------------------------------
// Top-level assembled Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    pub polling: PollingConfig,
    pub classification: ClassificationConfig,
    pub reply_drafting: ReplyDraftingConfig,
    pub sending: SendingConfig,
    pub connections: ConnectionsConfig,
    pub enrichment: EnrichmentConfig,
    pub error_handling: ErrorHandlingConfig,
    pub learning: LearningConfig,
    pub followup: FollowupConfig,
    pub sales_context: SalesContext,
    pub credentials: Credentials,
    /// Directory holding prompt templates (normally `config/prompts`).
    pub prompts_dir: PathBuf,
    /// Directory holding few-shot example files (normally `config/examples`).
    pub examples_dir: PathBuf,
}

// ---------------------------------------------------------------------------
// config.toml structs
// ---------------------------------------------------------------------------

/// Raw deserialization target for the entire config.toml file.
#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    polling: PollingConfig,
    #[serde(default)]
    classification: ClassificationConfig,
    #[serde(default)]
    reply_drafting: ReplyDraftingConfig,
    #[serde(default)]
    sending: SendingConfig,
    #[serde(default)]
    connections: ConnectionsConfig,
    #[serde(default)]
    enrichment: EnrichmentConfig,
    #[serde(default)]
    error_handling: ErrorHandlingConfig,
    #[serde(default)]
    learning: LearningConfig,
    #[serde(default)]
    followup: FollowupConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_seconds: u64,
    pub gmail_max_results: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        PollingConfig {
            interval_seconds: 120,
            gmail_max_results: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub model: String,
    pub temperature: f64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        ClassificationConfig {
            model: "claude-sonnet-4-5-20250929".into(),
            temperature: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplyDraftingConfig {
    pub model: String,
    pub temperature: f64,
    pub max_reply_words_linkedin: usize,
    pub max_reply_words_email: usize,
    pub self_critique_enabled: bool,
}

impl Default for ReplyDraftingConfig {
    fn default() -> Self {
        ReplyDraftingConfig {
            model: "claude-sonnet-4-5-20250929".into(),
            temperature: 0.7,
            max_reply_words_linkedin: 60,
            max_reply_words_email: 150,
            self_critique_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SendingConfig {
    pub auto_send: bool,
    pub auto_send_min_confidence: f64,
    pub auto_send_categories: Vec<String>,
    pub max_auto_sends_per_day: u32,
    pub gmail_per_hour: u32,
    pub linkedin_per_hour: u32,
}

impl Default for SendingConfig {
    fn default() -> Self {
        SendingConfig {
            auto_send: false,
            auto_send_min_confidence: 0.85,
            auto_send_categories: vec!["Warm".into(), "Cold".into()],
            max_auto_sends_per_day: 50,
            gmail_per_hour: 20,
            linkedin_per_hour: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionsConfig {
    pub auto_accept: bool,
    pub min_icp_confidence: f64,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        ConnectionsConfig {
            auto_accept: true,
            min_icp_confidence: 0.7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub enabled: bool,
    pub provider: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        EnrichmentConfig {
            enabled: true,
            provider: "rapidapi".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ErrorHandlingConfig {
    pub max_retries: u32,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_cooldown_seconds: u64,
}

impl Default for ErrorHandlingConfig {
    fn default() -> Self {
        ErrorHandlingConfig {
            max_retries: 3,
            circuit_breaker_threshold: 5,
            circuit_breaker_cooldown_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub enabled: bool,
    pub run_at: String,
    pub lookback_days: i64,
    pub max_active_rules: usize,
    pub min_messages_for_learning: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        LearningConfig {
            enabled: true,
            run_at: "06:00".into(),
            lookback_days: 7,
            max_active_rules: 10,
            min_messages_for_learning: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FollowupConfig {
    pub enabled: bool,
    pub run_at: String,
    pub total_followups: i64,
    pub linkedin_followups: i64,
    pub days_between: i64,
    pub days_before_activation: i64,
    pub auto_approve_after_clean_sends: usize,
}

impl Default for FollowupConfig {
    fn default() -> Self {
        FollowupConfig {
            enabled: true,
            run_at: "08:00".into(),
            total_followups: 8,
            linkedin_followups: 4,
            days_between: 3,
            days_before_activation: 3,
            auto_approve_after_clean_sends: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// sales_context.toml structs
// ---------------------------------------------------------------------------

/// Company/product/ICP description injected into every LLM prompt.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct SalesContext {
    #[serde(default)]
    pub company: CompanySection,
    #[serde(default)]
    pub product: ProductSection,
    #[serde(default)]
    pub icp: IcpSection,
    #[serde(default)]
    pub style: StyleSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct CompanySection {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProductSection {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub value_props: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IcpSection {
    #[serde(default)]
    pub industries: Vec<String>,
    #[serde(default)]
    pub company_sizes: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub buying_signals: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StyleSection {
    #[serde(default)]
    pub tone: String,
    #[serde(default)]
    pub signoff: String,
    #[serde(default)]
    pub calendar_link: String,
}

// ---------------------------------------------------------------------------
// credentials.toml structs
// ---------------------------------------------------------------------------

/// Secrets. Each field can come from config/credentials.toml or from the
/// environment variable of the same name uppercased; the environment wins.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Credentials {
    pub airtable_api_key: Option<String>,
    pub airtable_base_id: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub unipile_dsn: Option<String>,
    pub unipile_api_key: Option<String>,
    pub rapidapi_key: Option<String>,
    pub apollo_api_key: Option<String>,
    pub perplexity_api_key: Option<String>,
    pub gmail_credentials_path: Option<String>,
}

const CREDENTIAL_ENV_VARS: &[&str] = &[
    "airtable_api_key",
    "airtable_base_id",
    "anthropic_api_key",
    "unipile_dsn",
    "unipile_api_key",
    "rapidapi_key",
    "apollo_api_key",
    "perplexity_api_key",
    "gmail_credentials_path",
];

impl Credentials {
    fn field_mut(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            "airtable_api_key" => Some(&mut self.airtable_api_key),
            "airtable_base_id" => Some(&mut self.airtable_base_id),
            "anthropic_api_key" => Some(&mut self.anthropic_api_key),
            "unipile_dsn" => Some(&mut self.unipile_dsn),
            "unipile_api_key" => Some(&mut self.unipile_api_key),
            "rapidapi_key" => Some(&mut self.rapidapi_key),
            "apollo_api_key" => Some(&mut self.apollo_api_key),
            "perplexity_api_key" => Some(&mut self.perplexity_api_key),
            "gmail_credentials_path" => Some(&mut self.gmail_credentials_path),
            _ => None,
        }
    }

    /// Apply overrides from an environment lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for name in CREDENTIAL_ENV_VARS {
            let env_name = name.to_uppercase();
            if let Some(value) = get(&env_name) {
                if !value.is_empty() {
                    if let Some(field) = self.field_mut(name) {
                        *field = Some(value);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Loading logic
// ---------------------------------------------------------------------------

/// Load and validate configuration from `config/config.toml`,
/// `config/sales_context.toml`, and (optionally) `config/credentials.toml`,
/// all relative to the given `base_dir`.
///
/// This is the lower-level loading primitive that does not auto-copy defaults.
/// Prefer `load_config()` which handles default initialization automatically.
pub fn load_config_from(base_dir: &Path) -> Result<Config, ConfigError> {
    let config_dir = base_dir.join("config");

    // --- config.toml (required) ---
    let config_path = config_dir.join("config.toml");
    let config_text = read_file(&config_path)?;
    let config_file: ConfigFile =
        toml::from_str(&config_text).map_err(|e| ConfigError::ParseError {
            path: config_path.clone(),
            source: e,
        })?;

    // --- sales_context.toml (required) ---
    let sales_path = config_dir.join("sales_context.toml");
    let sales_text = read_file(&sales_path)?;
    let sales_context: SalesContext =
        toml::from_str(&sales_text).map_err(|e| ConfigError::ParseError {
            path: sales_path.clone(),
            source: e,
        })?;

    // --- credentials.toml (optional) ---
    let credentials_path = config_dir.join("credentials.toml");
    let mut credentials: Credentials = if credentials_path.exists() {
        let cred_text = read_file(&credentials_path)?;
        toml::from_str(&cred_text).map_err(|e| ConfigError::ParseError {
            path: credentials_path.clone(),
            source: e,
        })?
    } else {
        Credentials::default()
    };
    credentials.apply_env(|name| std::env::var(name).ok());

    let config = Config {
        polling: config_file.polling,
        classification: config_file.classification,
        reply_drafting: config_file.reply_drafting,
        sending: config_file.sending,
        connections: config_file.connections,
        enrichment: config_file.enrichment,
        error_handling: config_file.error_handling,
        learning: config_file.learning,
        followup: config_file.followup,
        sales_context,
        credentials,
        prompts_dir: config_dir.join("prompts"),
        examples_dir: config_dir.join("examples"),
    };

    validate(&config)?;

    Ok(config)
}

/// Ensure all config files exist by copying missing ones from `defaults/`.
/// Copies top-level files and one level of subdirectories (prompts/,
/// examples/). Returns the list of files that were copied. Skips `.example`
/// files and never overwrites an existing file.
pub fn ensure_config_files(base_dir: &Path) -> Result<Vec<PathBuf>, ConfigError> {
    let defaults_dir = base_dir.join("defaults");
    let config_dir = base_dir.join("config");

    if !defaults_dir.exists() {
        if !config_dir.exists() {
            return Err(ConfigError::DefaultsCopyError {
                message: format!(
                    "neither defaults/ nor config/ directory found in {}; \
                     run from the project root or ensure defaults/ is present",
                    base_dir.display()
                ),
            });
        }
        return Ok(vec![]);
    }

    let mut copied = Vec::new();
    copy_missing(&defaults_dir, &config_dir, &mut copied)?;
    Ok(copied)
}

fn copy_missing(
    from: &Path,
    to: &Path,
    copied: &mut Vec<PathBuf>,
) -> Result<(), ConfigError> {
    std::fs::create_dir_all(to).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to create {}: {e}", to.display()),
    })?;

    let entries = std::fs::read_dir(from).map_err(|e| ConfigError::DefaultsCopyError {
        message: format!("failed to read {}: {e}", from.display()),
    })?;

    for entry in entries {
        let entry = entry.map_err(|e| ConfigError::DefaultsCopyError {
            message: format!("failed to read defaults entry: {e}"),
        })?;
        let path = entry.path();
        let Some(file_name) = path.file_name() else {
            continue;
        };

        if path.is_dir() {
            copy_missing(&path, &to.join(file_name), copied)?;
            continue;
        }
        if !path.is_file() {
            continue;
        }

        // Skip .example template files
        if file_name.to_str().is_some_and(|n| n.ends_with(".example")) {
            continue;
        }
        let target = to.join(file_name);

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
        {
            Ok(mut dest) => {
                let content = std::fs::read(&path).map_err(|e| ConfigError::DefaultsCopyError {
                    message: format!("failed to read {}: {e}", path.display()),
                })?;
                std::io::Write::write_all(&mut dest, &content).map_err(|e| {
                    ConfigError::DefaultsCopyError {
                        message: format!("failed to write {}: {e}", target.display()),
                    }
                })?;
                copied.push(target);
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // File already exists in config/, skip it
            }
            Err(e) => {
                return Err(ConfigError::DefaultsCopyError {
                    message: format!("failed to create {}: {e}", target.display()),
                });
            }
        }
    }

    Ok(())
}

/// Convenience wrapper: loads config relative to the current working directory.
/// Ensures default config files are copied before loading.
pub fn load_config() -> Result<Config, ConfigError> {
    let cwd = std::env::current_dir().map_err(|_| ConfigError::FileNotFound {
        path: PathBuf::from("."),
    })?;
    ensure_config_files(&cwd)?;
    load_config_from(&cwd)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_path_buf(),
    })
}

/// Parse an "HH:MM" schedule time into (hour, minute).
pub fn parse_run_at(s: &str) -> Option<(u32, u32)> {
    let (h, m) = s.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.polling.interval_seconds == 0 {
        return Err(ConfigError::ValidationError {
            field: "polling.interval_seconds".into(),
            message: "must be greater than 0".into(),
        });
    }

    let temperature_fields: &[(&str, f64)] = &[
        ("classification.temperature", config.classification.temperature),
        ("reply_drafting.temperature", config.reply_drafting.temperature),
    ];
    for (name, val) in temperature_fields {
        if !(0.0..=1.0).contains(val) {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: format!("must be between 0.0 and 1.0 inclusive, got {val}"),
            });
        }
    }

    let confidence_fields: &[(&str, f64)] = &[
        (
            "sending.auto_send_min_confidence",
            config.sending.auto_send_min_confidence,
        ),
        (
            "connections.min_icp_confidence",
            config.connections.min_icp_confidence,
        ),
    ];
    for (name, val) in confidence_fields {
        if !(0.0..=1.0).contains(val) {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: format!("must be between 0.0 and 1.0 inclusive, got {val}"),
            });
        }
    }

    for (name, val) in [
        ("learning.run_at", &config.learning.run_at),
        ("followup.run_at", &config.followup.run_at),
    ] {
        if parse_run_at(val).is_none() {
            return Err(ConfigError::ValidationError {
                field: name.to_string(),
                message: format!("must be HH:MM, got `{val}`"),
            });
        }
    }

    if config.followup.linkedin_followups > config.followup.total_followups {
        return Err(ConfigError::ValidationError {
            field: "followup.linkedin_followups".into(),
            message: format!(
                "must not exceed total_followups ({} > {})",
                config.followup.linkedin_followups, config.followup.total_followups
            ),
        });
    }

    Ok(())
}

/// Check that the secrets required for core operation are present.
/// Called at startup, separately from `load_config`, so config files can
/// be loaded and inspected without secrets in the environment.
pub fn validate_credentials(creds: &Credentials) -> Result<(), ConfigError> {
    let required: &[(&str, &Option<String>)] = &[
        ("airtable_api_key", &creds.airtable_api_key),
        ("airtable_base_id", &creds.airtable_base_id),
        ("anthropic_api_key", &creds.anthropic_api_key),
    ];
    for (name, value) in required {
        if value.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::ValidationError {
                field: format!("credentials.{name}"),
                message: format!(
                    "required; set it in config/credentials.toml or the {} environment variable",
                    name.to_uppercase()
                ),
            });
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_minimal_config(config_dir: &Path) {
        fs::create_dir_all(config_dir).unwrap();
        fs::write(config_dir.join("config.toml"), "").unwrap();
        fs::write(
            config_dir.join("sales_context.toml"),
            "[company]\nname = \"Acme\"\n",
        )
        .unwrap();
    }

    #[test]
    fn defaults_fill_every_section() {
        let tmp = std::env::temp_dir().join("sdr_config_test_defaults");
        let _ = fs::remove_dir_all(&tmp);
        write_minimal_config(&tmp.join("config"));

        let config = load_config_from(&tmp).expect("should load with empty config.toml");

        assert_eq!(config.polling.interval_seconds, 120);
        assert_eq!(config.polling.gmail_max_results, 50);
        assert_eq!(config.classification.model, "claude-sonnet-4-5-20250929");
        assert!((config.classification.temperature - 0.1).abs() < f64::EPSILON);
        assert!((config.reply_drafting.temperature - 0.7).abs() < f64::EPSILON);
        assert_eq!(config.reply_drafting.max_reply_words_linkedin, 60);
        assert_eq!(config.reply_drafting.max_reply_words_email, 150);
        assert!(config.reply_drafting.self_critique_enabled);
        assert!(!config.sending.auto_send);
        assert!((config.sending.auto_send_min_confidence - 0.85).abs() < f64::EPSILON);
        assert_eq!(config.sending.auto_send_categories, vec!["Warm", "Cold"]);
        assert_eq!(config.sending.gmail_per_hour, 20);
        assert_eq!(config.sending.linkedin_per_hour, 10);
        assert!(config.connections.auto_accept);
        assert_eq!(config.error_handling.circuit_breaker_threshold, 5);
        assert_eq!(config.error_handling.circuit_breaker_cooldown_seconds, 600);
        assert_eq!(config.learning.run_at, "06:00");
        assert_eq!(config.learning.lookback_days, 7);
        assert_eq!(config.followup.total_followups, 8);
        assert_eq!(config.followup.linkedin_followups, 4);
        assert_eq!(config.followup.auto_approve_after_clean_sends, 2);
        assert_eq!(config.sales_context.company.name, "Acme");

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn overrides_replace_defaults() {
        let tmp = std::env::temp_dir().join("sdr_config_test_overrides");
        let _ = fs::remove_dir_all(&tmp);
        let config_dir = tmp.join("config");
        write_minimal_config(&config_dir);
        fs::write(
            config_dir.join("config.toml"),
            r#"
[polling]
interval_seconds = 30

[reply_drafting]
self_critique_enabled = false
max_reply_words_linkedin = 40

[followup]
total_followups = 6
linkedin_followups = 3
"#,
        )
        .unwrap();

        let config = load_config_from(&tmp).expect("should load");
        assert_eq!(config.polling.interval_seconds, 30);
        assert!(!config.reply_drafting.self_critique_enabled);
        assert_eq!(config.reply_drafting.max_reply_words_linkedin, 40);
        assert_eq!(config.followup.total_followups, 6);
        // Untouched sections keep defaults
        assert_eq!(config.sending.gmail_per_hour, 20);

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn missing_credentials_toml_is_ok() {
        let tmp = std::env::temp_dir().join("sdr_config_test_no_creds");
        let _ = fs::remove_dir_all(&tmp);
        write_minimal_config(&tmp.join("config"));

        let config = load_config_from(&tmp).expect("should load without credentials.toml");
        assert!(config.credentials.unipile_api_key.is_none());

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn credentials_toml_parses_keys() {
        let tmp = std::env::temp_dir().join("sdr_config_test_with_creds");
        let _ = fs::remove_dir_all(&tmp);
        let config_dir = tmp.join("config");
        write_minimal_config(&config_dir);
        fs::write(
            config_dir.join("credentials.toml"),
            "airtable_api_key = \"pat-test\"\nairtable_base_id = \"appTEST\"\nanthropic_api_key = \"sk-ant-test\"\n",
        )
        .unwrap();

        let config = load_config_from(&tmp).expect("should load with credentials.toml");
        assert_eq!(config.credentials.airtable_api_key.as_deref(), Some("pat-test"));
        assert_eq!(config.credentials.airtable_base_id.as_deref(), Some("appTEST"));

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn env_overrides_win_and_skip_empty() {
        let mut creds = Credentials {
            anthropic_api_key: Some("from-file".into()),
            airtable_api_key: Some("file-key".into()),
            ..Default::default()
        };
        creds.apply_env(|name| match name {
            "ANTHROPIC_API_KEY" => Some("from-env".into()),
            "AIRTABLE_API_KEY" => Some(String::new()),
            "UNIPILE_DSN" => Some("api1.unipile.com:13111".into()),
            _ => None,
        });
        assert_eq!(creds.anthropic_api_key.as_deref(), Some("from-env"));
        // Empty env value does not clobber the file value
        assert_eq!(creds.airtable_api_key.as_deref(), Some("file-key"));
        assert_eq!(creds.unipile_dsn.as_deref(), Some("api1.unipile.com:13111"));
    }

    #[test]
    fn rejects_zero_polling_interval() {
        let tmp = std::env::temp_dir().join("sdr_config_test_zero_interval");
        let _ = fs::remove_dir_all(&tmp);
        let config_dir = tmp.join("config");
        write_minimal_config(&config_dir);
        fs::write(
            config_dir.join("config.toml"),
            "[polling]\ninterval_seconds = 0\n",
        )
        .unwrap();

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ValidationError { field, .. } => {
                assert_eq!(field, "polling.interval_seconds");
            }
            other => panic!("expected ValidationError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_temperature_out_of_range() {
        let tmp = std::env::temp_dir().join("sdr_config_test_bad_temp");
        let _ = fs::remove_dir_all(&tmp);
        let config_dir = tmp.join("config");
        write_minimal_config(&config_dir);
        fs::write(
            config_dir.join("config.toml"),
            "[classification]\ntemperature = 1.5\n",
        )
        .unwrap();

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ValidationError { field, .. } => {
                assert_eq!(field, "classification.temperature");
            }
            other => panic!("expected ValidationError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_malformed_run_at() {
        let tmp = std::env::temp_dir().join("sdr_config_test_bad_run_at");
        let _ = fs::remove_dir_all(&tmp);
        let config_dir = tmp.join("config");
        write_minimal_config(&config_dir);
        fs::write(
            config_dir.join("config.toml"),
            "[learning]\nrun_at = \"6am\"\n",
        )
        .unwrap();

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ValidationError { field, .. } => {
                assert_eq!(field, "learning.run_at");
            }
            other => panic!("expected ValidationError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn rejects_linkedin_followups_above_total() {
        let tmp = std::env::temp_dir().join("sdr_config_test_followup_cap");
        let _ = fs::remove_dir_all(&tmp);
        let config_dir = tmp.join("config");
        write_minimal_config(&config_dir);
        fs::write(
            config_dir.join("config.toml"),
            "[followup]\ntotal_followups = 2\nlinkedin_followups = 4\n",
        )
        .unwrap();

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ValidationError { field, .. } => {
                assert_eq!(field, "followup.linkedin_followups");
            }
            other => panic!("expected ValidationError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn file_not_found_for_missing_config_toml() {
        let tmp = std::env::temp_dir().join("sdr_config_test_missing_config");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(tmp.join("config")).unwrap();

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::FileNotFound { path } => {
                assert!(path.ends_with("config.toml"));
            }
            other => panic!("expected FileNotFound, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn parse_error_for_invalid_toml() {
        let tmp = std::env::temp_dir().join("sdr_config_test_invalid_toml");
        let _ = fs::remove_dir_all(&tmp);
        let config_dir = tmp.join("config");
        write_minimal_config(&config_dir);
        fs::write(config_dir.join("config.toml"), "this is not valid [[[ toml").unwrap();

        let err = load_config_from(&tmp).unwrap_err();
        match &err {
            ConfigError::ParseError { path, .. } => {
                assert!(path.ends_with("config.toml"));
            }
            other => panic!("expected ParseError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_copies_missing_files_and_subdirs() {
        let tmp = std::env::temp_dir().join("sdr_config_test_ensure_copies");
        let _ = fs::remove_dir_all(&tmp);

        let defaults_dir = tmp.join("defaults");
        fs::create_dir_all(defaults_dir.join("prompts")).unwrap();
        fs::write(defaults_dir.join("config.toml"), "").unwrap();
        fs::write(defaults_dir.join("sales_context.toml"), "").unwrap();
        fs::write(defaults_dir.join("prompts/classify_lead.txt"), "{{MESSAGE}}").unwrap();
        // An example file that should NOT be copied
        fs::write(
            defaults_dir.join("credentials.toml.example"),
            "anthropic_api_key = \"sk-ant-...\"\n",
        )
        .unwrap();

        assert!(!tmp.join("config").exists());

        let copied = ensure_config_files(&tmp).expect("should succeed");
        assert_eq!(copied.len(), 3);

        assert!(tmp.join("config/config.toml").exists());
        assert!(tmp.join("config/sales_context.toml").exists());
        assert!(tmp.join("config/prompts/classify_lead.txt").exists());
        assert!(!tmp.join("config/credentials.toml.example").exists());

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_skips_existing() {
        let tmp = std::env::temp_dir().join("sdr_config_test_ensure_skips");
        let _ = fs::remove_dir_all(&tmp);

        let defaults_dir = tmp.join("defaults");
        let config_dir = tmp.join("config");
        fs::create_dir_all(&defaults_dir).unwrap();
        fs::create_dir_all(&config_dir).unwrap();
        fs::write(defaults_dir.join("config.toml"), "# default\n").unwrap();
        fs::write(defaults_dir.join("sales_context.toml"), "").unwrap();

        // Pre-create config.toml with custom content
        fs::write(config_dir.join("config.toml"), "# custom\n").unwrap();

        let copied = ensure_config_files(&tmp).expect("should succeed");
        assert_eq!(copied.len(), 1);
        assert!(copied[0].ends_with("sales_context.toml"));

        let content = fs::read_to_string(config_dir.join("config.toml")).unwrap();
        assert_eq!(content, "# custom\n");

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn ensure_config_files_errors_when_both_dirs_missing() {
        let tmp = std::env::temp_dir().join("sdr_config_test_both_missing");
        let _ = fs::remove_dir_all(&tmp);
        fs::create_dir_all(&tmp).unwrap();

        let err = ensure_config_files(&tmp).unwrap_err();
        match &err {
            ConfigError::DefaultsCopyError { message } => {
                assert!(message.contains("neither defaults/ nor config/"));
            }
            other => panic!("expected DefaultsCopyError, got: {other}"),
        }

        let _ = fs::remove_dir_all(&tmp);
    }

    #[test]
    fn parse_run_at_accepts_and_rejects() {
        assert_eq!(parse_run_at("06:00"), Some((6, 0)));
        assert_eq!(parse_run_at("23:59"), Some((23, 59)));
        assert_eq!(parse_run_at("24:00"), None);
        assert_eq!(parse_run_at("08:60"), None);
        assert_eq!(parse_run_at("8:00"), None);
        assert_eq!(parse_run_at("0800"), None);
    }

    #[test]
    fn validate_credentials_requires_core_keys() {
        let mut creds = Credentials::default();
        let err = validate_credentials(&creds).unwrap_err();
        match &err {
            ConfigError::ValidationError { field, .. } => {
                assert_eq!(field, "credentials.airtable_api_key");
            }
            other => panic!("expected ValidationError, got: {other}"),
        }

        creds.airtable_api_key = Some("pat".into());
        creds.airtable_base_id = Some("app".into());
        creds.anthropic_api_key = Some("sk-ant".into());
        validate_credentials(&creds).expect("all required keys present");
    }
}
