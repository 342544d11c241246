//! Shared types, error model, and configuration for LeadGarage.
//!
//! This crate is the foundation depended on by all other LeadGarage crates.
//! It provides:
//! - [`LeadGarageError`], the unified error type
//! - Domain types ([`Record`], [`ValidationResult`], [`RoutingDecision`],
//!   [`SpokeResult`], [`RoutingLogEntry`])
//! - Configuration ([`AppConfig`], [`AgentProfile`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AgentProfile, AppConfig, ChronicPolicy, OrchestratorConfig, ServicesConfig, StorageConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from, read_api_key,
};
pub use error::{LeadGarageError, Result};
pub use types::{
    AgentStatus, Bay, Capability, Contradiction, Disposition, FailureType, HubSignal, Record,
    RecordId, RecordStatus, RecordType, RoutingDecision, RoutingLogEntry, RoutingReason,
    SpokeResult, SpokeStatus, ValidationResult, fields, normalize_domain,
};
