//! CLI command definitions, routing, and tracing setup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use leadgarage_core::{
    BatchStats, CycleOutcome, Orchestrator, ProgressReporter, SystemClock, validate_unclassified,
};
use leadgarage_shared::{
    AppConfig, Record, RecordId, RecordType, init_config, load_config, load_config_from,
};
use leadgarage_spokes::SpokeRegistry;
use leadgarage_storage::Storage;
use tokio::sync::watch;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// LeadGarage: route invalid lead records to the cheapest capable repair.
#[derive(Parser)]
#[command(
    name = "leadgarage",
    version,
    about = "Validate lead records and route invalid ones to enrichment spokes under budget.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.leadgarage/leadgarage.toml).
    #[arg(long, global = true, env = "LEADGARAGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database file (overrides [storage].database_path).
    #[arg(long, global = true, env = "LEADGARAGE_DB")]
    pub db: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Record type selector.
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub(crate) enum RecordTypeArg {
    Company,
    Person,
}

impl From<RecordTypeArg> for RecordType {
    fn from(arg: RecordTypeArg) -> Self {
        match arg {
            RecordTypeArg::Company => RecordType::Company,
            RecordTypeArg::Person => RecordType::Person,
        }
    }
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process one batch per record type and exit.
    Run {
        /// Record types to process (repeatable). Defaults to both.
        #[arg(long = "record-type", value_enum)]
        record_types: Vec<RecordTypeArg>,

        /// Records pulled per batch (defaults to [orchestrator].batch_size).
        #[arg(long)]
        batch_size: Option<u32>,
    },

    /// Process batches continuously until Ctrl-C.
    Watch {
        /// Record types to process (repeatable). Defaults to both.
        #[arg(long = "record-type", value_enum)]
        record_types: Vec<RecordTypeArg>,

        /// Records pulled per batch (defaults to [orchestrator].batch_size).
        #[arg(long)]
        batch_size: Option<u32>,

        /// Sleep between idle cycles (defaults to [orchestrator].idle_interval_secs).
        #[arg(long)]
        idle_secs: Option<u64>,

        /// Stop after this many cycles.
        #[arg(long)]
        max_cycles: Option<u64>,
    },

    /// Seed records from a JSON-lines file.
    Import {
        /// File with one JSON object of field values per line.
        file: PathBuf,

        /// Type for lines without a `record_type` key.
        #[arg(long, value_enum)]
        record_type: Option<RecordTypeArg>,
    },

    /// Summarize record statuses and the routing log.
    Stats,

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "leadgarage=info",
        1 => "leadgarage=debug",
        _ => "leadgarage=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    let db_path = cli.db.as_deref();
    match cli.command {
        Command::Run {
            record_types,
            batch_size,
        } => cmd_run(config_path, db_path, &record_types, batch_size).await,
        Command::Watch {
            record_types,
            batch_size,
            idle_secs,
            max_cycles,
        } => {
            cmd_watch(
                config_path,
                db_path,
                &record_types,
                batch_size,
                idle_secs,
                max_cycles,
            )
            .await
        }
        Command::Import { file, record_type } => {
            cmd_import(config_path, db_path, &file, record_type.map(RecordType::from)).await
        }
        Command::Stats => cmd_stats(config_path, db_path).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show(config_path).await,
        },
    }
}

// ---------------------------------------------------------------------------
// Startup helpers
// ---------------------------------------------------------------------------

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    };
    Ok(config)
}

fn resolve_db_path(config: &AppConfig, db: Option<&Path>) -> Result<PathBuf> {
    match db {
        Some(p) => Ok(p.to_path_buf()),
        None => Ok(config.storage.resolve_database_path()?),
    }
}

async fn open_storage(config: &AppConfig, db: Option<&Path>) -> Result<Storage> {
    let path = resolve_db_path(config, db)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .wrap_err_with(|| format!("cannot create {}", parent.display()))?;
    }
    let storage = Storage::open(&path).await?;
    Ok(storage)
}

fn record_types_or_all(args: &[RecordTypeArg]) -> Vec<RecordType> {
    if args.is_empty() {
        vec![RecordType::Company, RecordType::Person]
    } else {
        let mut types: Vec<RecordType> = Vec::new();
        for t in args.iter().copied().map(RecordType::from) {
            if !types.contains(&t) {
                types.push(t);
            }
        }
        types
    }
}

async fn build_orchestrator(config: &AppConfig, db: Option<&Path>) -> Result<Orchestrator> {
    let storage = open_storage(config, db).await?;
    let registry = SpokeRegistry::from_config(config)?;
    info!(
        spokes = registry.capabilities().count(),
        "spoke registry ready"
    );
    Ok(Orchestrator::new(
        config,
        Arc::new(storage),
        registry,
        Arc::new(SystemClock),
    ))
}

/// Log hub signals as they arrive.
fn spawn_signal_logger(orchestrator: &Orchestrator) -> tokio::task::JoinHandle<()> {
    let mut signals = orchestrator.subscribe();
    tokio::spawn(async move {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match signals.recv().await {
                Ok(event) => info!(
                    record_id = %event.record_id,
                    capability = %event.capability,
                    signal = event.signal.as_str(),
                    "hub signal"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "hub signals dropped"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_stats(title: &str, stats: &BatchStats) {
    println!();
    println!("  {title}");
    println!("  Processed:   {}", stats.processed);
    println!("  Enriched:    {}", stats.enriched);
    println!("  Promoted:    {}", stats.promoted);
    println!("  Failed:      {}", stats.failed);
    println!("  Deferred:    {}", stats.deferred);
    println!("  Chronic:     {}", stats.chronic_bad);
    println!("  Manual fix:  {}", stats.manual_fix);
    println!("  Cost:        {:.4}", stats.total_cost);
    println!();
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(
    config_path: Option<&Path>,
    db: Option<&Path>,
    record_types: &[RecordTypeArg],
    batch_size: Option<u32>,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let orchestrator = build_orchestrator(&config, db).await?;
    let batch_size = batch_size.unwrap_or(config.orchestrator.batch_size);
    let signal_logger = spawn_signal_logger(&orchestrator);

    let reporter = CliProgress::new();
    let mut total = BatchStats::default();
    for record_type in record_types_or_all(record_types) {
        match orchestrator
            .run_batch(record_type, batch_size, &reporter)
            .await
        {
            Ok(stats) => total.merge(&stats),
            Err(e) => warn!(%record_type, error = %e, "batch failed"),
        }
    }
    reporter.finish();
    signal_logger.abort();

    print_stats("Batch complete", &total);
    Ok(())
}

async fn cmd_watch(
    config_path: Option<&Path>,
    db: Option<&Path>,
    record_types: &[RecordTypeArg],
    batch_size: Option<u32>,
    idle_secs: Option<u64>,
    max_cycles: Option<u64>,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let orchestrator = build_orchestrator(&config, db).await?;
    let batch_size = batch_size.unwrap_or(config.orchestrator.batch_size);
    let idle = idle_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.orchestrator.idle_interval());
    let signal_logger = spawn_signal_logger(&orchestrator);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, finishing current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    let types = record_types_or_all(record_types);
    info!(
        types = ?types,
        batch_size,
        idle_secs = idle.as_secs(),
        "watching for invalid records"
    );

    let reporter = CliProgress::new();
    let total = orchestrator
        .run_continuous(&types, batch_size, idle, shutdown_rx, max_cycles, &reporter)
        .await?;
    reporter.finish();
    signal_logger.abort();

    print_stats("Watch stopped", &total);
    Ok(())
}

/// Tally of one import run.
#[derive(Debug, Default)]
struct ImportSummary {
    imported: u64,
    unclassifiable: u64,
    malformed: u64,
}

async fn cmd_import(
    config_path: Option<&Path>,
    db: Option<&Path>,
    file: &Path,
    default_type: Option<RecordType>,
) -> Result<()> {
    let config = resolve_config(config_path)?;
    let storage = open_storage(&config, db).await?;
    let content = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("cannot read {}", file.display()))?;

    let mut summary = ImportSummary::default();
    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }
        let (declared, fields) = match parse_import_line(line) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(line = line_no, error = %e, "skipping malformed line");
                summary.malformed += 1;
                continue;
            }
        };

        let record_type = match declared.as_deref() {
            Some(raw) => raw.parse::<RecordType>().ok(),
            None => default_type,
        };
        let Some(record_type) = record_type else {
            let result = validate_unclassified(&fields);
            warn!(
                line = line_no,
                declared = declared.as_deref().unwrap_or(""),
                missing = result.missing_fields.len(),
                "unclassifiable record skipped"
            );
            summary.unclassifiable += 1;
            continue;
        };

        let record = Record::new(record_type, fields);
        storage.insert_record(&record).await?;
        summary.imported += 1;
    }

    info!(
        file = %file.display(),
        imported = summary.imported,
        unclassifiable = summary.unclassifiable,
        malformed = summary.malformed,
        "import complete"
    );
    println!();
    println!("  Imported:        {}", summary.imported);
    println!("  Unclassifiable:  {}", summary.unclassifiable);
    println!("  Malformed:       {}", summary.malformed);
    println!();
    Ok(())
}

/// Split one JSON-lines object into its optional `record_type` and string fields.
///
/// Scalars are stringified; nulls, arrays and objects are dropped.
fn parse_import_line(line: &str) -> Result<(Option<String>, BTreeMap<String, String>)> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let serde_json::Value::Object(map) = value else {
        return Err(eyre!("expected a JSON object"));
    };

    let mut declared = None;
    let mut fields = BTreeMap::new();
    for (key, value) in map {
        let text = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            _ => continue,
        };
        if key == "record_type" {
            declared = Some(text);
        } else {
            fields.insert(key, text);
        }
    }
    Ok((declared, fields))
}

async fn cmd_stats(config_path: Option<&Path>, db: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let path = resolve_db_path(&config, db)?;
    if !path.exists() {
        return Err(eyre!("no database at '{}', run `leadgarage import` first", path.display()));
    }
    let storage = Storage::open_readonly(&path).await?;

    let by_status = storage.count_records_by_status().await?;
    let summary = storage.routing_summary().await?;

    println!();
    println!("  Records");
    for (status, count) in &by_status {
        println!("    {:<12} {count}", status.as_str());
    }
    println!();
    println!("  Routing log ({} entries)", summary.total_entries);
    for (status, count, cost) in &summary.by_status {
        println!("    {:<12} {count:>6}  cost {cost:.4}", status.as_str());
    }
    println!("  Total cost:  {:.4}", summary.total_cost);
    println!();
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = resolve_config(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{pos}] {msg}")
                .unwrap()
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl ProgressReporter for CliProgress {
    fn batch_started(&self, record_type: RecordType, records: usize) {
        self.spinner
            .set_message(format!("Processing {records} {record_type} records"));
    }

    fn record_finished(&self, record_id: &RecordId, outcome: &CycleOutcome) {
        self.spinner.inc(1);
        let label = match outcome {
            CycleOutcome::Promoted => "promoted".to_string(),
            CycleOutcome::Enriched { promoted: true, .. } => "repaired, promoted".to_string(),
            CycleOutcome::Enriched { .. } => "repaired".to_string(),
            CycleOutcome::Failed { failure, .. } => format!("failed ({failure})"),
            CycleOutcome::Deferred(denial) => format!("deferred ({denial})"),
            CycleOutcome::ChronicBad(disposition) => format!("chronic ({})", disposition.as_str()),
            CycleOutcome::ManualFix => "manual fix".to_string(),
            CycleOutcome::StoreError => "store error".to_string(),
        };
        self.spinner.set_message(format!("{record_id}: {label}"));
    }

    fn batch_finished(&self, record_type: RecordType, stats: &BatchStats) {
        self.spinner.set_message(format!(
            "{record_type}: {} processed, {} enriched, {} deferred",
            stats.processed, stats.enriched, stats.deferred
        ));
    }
}
