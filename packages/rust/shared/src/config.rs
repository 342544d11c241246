//! Application configuration for LeadGarage.
//!
//! User config lives at `~/.leadgarage/leadgarage.toml`.
//! CLI flags override config file values, which override defaults.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LeadGarageError, Result};
use crate::types::{Bay, Capability, Disposition};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "leadgarage.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".leadgarage";

/// Default database file name inside the config directory.
const DB_FILE_NAME: &str = "leadgarage.db";

// ---------------------------------------------------------------------------
// Config structs (matching leadgarage.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Batch, concurrency and chronic-failure policy.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Record store location.
    #[serde(default)]
    pub storage: StorageConfig,

    /// External capability endpoints.
    #[serde(default)]
    pub services: ServicesConfig,

    /// Capability profiles, in declaration (tie-break) order.
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentProfile>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            orchestrator: OrchestratorConfig::default(),
            storage: StorageConfig::default(),
            services: ServicesConfig::default(),
            agents: default_agents(),
        }
    }
}

/// What happens to a record once it is chronically bad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChronicPolicy {
    ManualFix,
    Discard,
}

impl ChronicPolicy {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::ManualFix => Disposition::ManualFix,
            Self::Discard => Disposition::Discard,
        }
    }
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Records pulled per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Concurrent record-processing tasks, shared across all capabilities.
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: u32,

    /// Ceiling on a single capability invocation.
    #[serde(default = "default_max_time_per_record")]
    pub max_time_per_record_seconds: u64,

    /// Counted failures after which a record is chronically bad.
    #[serde(default = "default_chronic_threshold")]
    pub chronic_threshold: u32,

    /// Disposition for chronically bad records.
    #[serde(default = "default_chronic_policy")]
    pub chronic_policy: ChronicPolicy,

    /// Continuous mode sleep when a cycle finds nothing to process.
    #[serde(default = "default_idle_interval")]
    pub idle_interval_secs: u64,

    /// Overall spend cap for one process run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_run_spend: Option<f64>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_concurrent_agents: default_max_concurrent_agents(),
            max_time_per_record_seconds: default_max_time_per_record(),
            chronic_threshold: default_chronic_threshold(),
            chronic_policy: default_chronic_policy(),
            idle_interval_secs: default_idle_interval(),
            max_run_spend: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn max_time_per_record(&self) -> Duration {
        Duration::from_secs(self.max_time_per_record_seconds)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.idle_interval_secs)
    }
}

fn default_batch_size() -> u32 {
    50
}
fn default_max_concurrent_agents() -> u32 {
    4
}
fn default_max_time_per_record() -> u64 {
    30
}
fn default_chronic_threshold() -> u32 {
    3
}
fn default_chronic_policy() -> ChronicPolicy {
    ChronicPolicy::ManualFix
}
fn default_idle_interval() -> u64 {
    60
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file path. Defaults to `~/.leadgarage/leadgarage.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
}

impl StorageConfig {
    /// Resolve the database path, expanding a leading `~/`.
    pub fn resolve_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(p) => expand_home(p),
            None => Ok(config_dir()?.join(DB_FILE_NAME)),
        }
    }
}

/// `[services]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Bulk email-verification API base URL.
    #[serde(default = "default_verifier_url")]
    pub verifier_url: String,

    /// Name of the env var holding the verifier API key (never store the key itself).
    #[serde(default = "default_verifier_key_env")]
    pub verifier_api_key_env: String,

    /// Business-directory search API base URL.
    #[serde(default = "default_directory_url")]
    pub directory_url: String,

    /// Name of the env var holding the directory API key.
    #[serde(default = "default_directory_key_env")]
    pub directory_api_key_env: String,

    /// OpenAI-compatible chat completion base URL.
    #[serde(default = "default_ai_base_url")]
    pub ai_base_url: String,

    /// Name of the env var holding the AI API key.
    #[serde(default = "default_ai_key_env")]
    pub ai_api_key_env: String,

    /// Model used by the AI extractor.
    #[serde(default = "default_ai_model")]
    pub ai_model: String,

    /// Per-request HTTP timeout inside a spoke.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            verifier_url: default_verifier_url(),
            verifier_api_key_env: default_verifier_key_env(),
            directory_url: default_directory_url(),
            directory_api_key_env: default_directory_key_env(),
            ai_base_url: default_ai_base_url(),
            ai_api_key_env: default_ai_key_env(),
            ai_model: default_ai_model(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_verifier_url() -> String {
    "https://api.millionverifier.com/api/v3".into()
}
fn default_verifier_key_env() -> String {
    "EMAIL_VERIFIER_API_KEY".into()
}
fn default_directory_url() -> String {
    "https://api.opencorporates.com/v0.4".into()
}
fn default_directory_key_env() -> String {
    "DIRECTORY_API_KEY".into()
}
fn default_ai_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_ai_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_ai_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_request_timeout() -> u64 {
    20
}

/// `[[agents]]` entry: static metadata for one capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Capability this profile configures.
    pub name: Capability,

    /// Disabled agents are never routed to.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Declared cost of one invocation.
    pub cost_per_call: f64,

    /// Confidence multiplier in `[0, 1]`.
    pub confidence_multiplier: f64,

    /// Cost tier.
    pub bay: Bay,

    /// Maximum in-flight invocations of this capability.
    #[serde(default = "default_concurrency_ceiling")]
    pub concurrency_ceiling: u32,

    /// Minimum ms between two invocations of this capability.
    #[serde(default)]
    pub min_interval_ms: u64,

    /// Cumulative spend cap for this capability over one run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spend_cap: Option<f64>,
}

impl AgentProfile {
    /// A profile with default throttle settings.
    pub fn new(name: Capability, bay: Bay, cost_per_call: f64, confidence_multiplier: f64) -> Self {
        Self {
            name,
            enabled: true,
            cost_per_call,
            confidence_multiplier,
            bay,
            concurrency_ceiling: default_concurrency_ceiling(),
            min_interval_ms: 0,
            spend_cap: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

fn default_true() -> bool {
    true
}
fn default_concurrency_ceiling() -> u32 {
    2
}

fn default_agents() -> Vec<AgentProfile> {
    vec![
        AgentProfile {
            concurrency_ceiling: 4,
            min_interval_ms: 100,
            ..AgentProfile::new(Capability::EmailDiscovery, Bay::BayA, 0.004, 0.85)
        },
        AgentProfile {
            concurrency_ceiling: 4,
            min_interval_ms: 250,
            ..AgentProfile::new(Capability::WebScraper, Bay::BayA, 0.001, 0.6)
        },
        AgentProfile {
            concurrency_ceiling: 2,
            min_interval_ms: 500,
            ..AgentProfile::new(Capability::DirectoryLookup, Bay::BayA, 0.01, 0.75)
        },
        AgentProfile {
            concurrency_ceiling: 2,
            spend_cap: Some(25.0),
            ..AgentProfile::new(Capability::AiExtractor, Bay::BayB, 0.05, 0.7)
        },
    ]
}

impl AppConfig {
    /// Check invariants the rest of the system relies on.
    pub fn validate(&self) -> Result<()> {
        let orch = &self.orchestrator;
        if orch.batch_size == 0 {
            return Err(LeadGarageError::config("orchestrator.batch_size must be > 0"));
        }
        if orch.max_concurrent_agents == 0 {
            return Err(LeadGarageError::config(
                "orchestrator.max_concurrent_agents must be > 0",
            ));
        }
        if orch.max_time_per_record_seconds == 0 {
            return Err(LeadGarageError::config(
                "orchestrator.max_time_per_record_seconds must be > 0",
            ));
        }
        if orch.chronic_threshold == 0 {
            return Err(LeadGarageError::config(
                "orchestrator.chronic_threshold must be > 0",
            ));
        }
        if let Some(cap) = orch.max_run_spend {
            if !(cap >= 0.0) {
                return Err(LeadGarageError::config(
                    "orchestrator.max_run_spend must be >= 0",
                ));
            }
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            let name = agent.name.as_str();
            if !seen.insert(agent.name) {
                return Err(LeadGarageError::config(format!("duplicate agent '{name}'")));
            }
            if !(agent.cost_per_call >= 0.0) {
                return Err(LeadGarageError::config(format!(
                    "agent '{name}': cost_per_call must be >= 0"
                )));
            }
            if !(0.0..=1.0).contains(&agent.confidence_multiplier) {
                return Err(LeadGarageError::config(format!(
                    "agent '{name}': confidence_multiplier must be within [0, 1]"
                )));
            }
            if agent.concurrency_ceiling == 0 {
                return Err(LeadGarageError::config(format!(
                    "agent '{name}': concurrency_ceiling must be > 0"
                )));
            }
            if let Some(cap) = agent.spend_cap {
                if !(cap >= 0.0) {
                    return Err(LeadGarageError::config(format!(
                        "agent '{name}': spend_cap must be >= 0"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Profile for a capability, if declared.
    pub fn agent(&self, capability: Capability) -> Option<&AgentProfile> {
        self.agents.iter().find(|a| a.name == capability)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.leadgarage/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| LeadGarageError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.leadgarage/leadgarage.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load and validate the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| LeadGarageError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        LeadGarageError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| LeadGarageError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| LeadGarageError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| LeadGarageError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read an API key from the env var named in config. Empty counts as unset.
pub fn read_api_key(var_name: &str) -> Option<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Some(val),
        _ => None,
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| LeadGarageError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
