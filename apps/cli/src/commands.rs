//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use stepledger_core::document_pipeline::{fetch_document_steps, initial_context};
use stepledger_core::fetch::FetchOptions;
use stepledger_core::migrate::{MigrationOptions, Migrator};
use stepledger_core::report::status_report;
use stepledger_core::{
    AppendOutcome, PipelineConfig, PipelineRun, ProcessingStateMachine, ProgressReporter,
    TransitionRequest, run_pipeline,
};
use stepledger_format::{FormatAdapter, KeyCase, adapt_keys};
use stepledger_shared::{
    AppConfig, ProcessingState, ProcessingStatus, StepStatus, TransitionCondition,
    TransitionReason, TriggerSource, init_config, load_config,
};
use tracing::info;
use url::Url;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// stepledger: crash-resumable step pipelines with a durable audit trail.
#[derive(Parser)]
#[command(
    name = "stepledger",
    version,
    about = "Run resumable step pipelines and manage document processing-state files.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
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

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run a built-in pipeline.
    Run {
        #[command(subcommand)]
        pipeline: RunPipeline,
    },

    /// Summarise a progress file.
    Status {
        /// Directory holding the progress file (defaults to config).
        #[arg(long)]
        progress_dir: Option<PathBuf>,

        /// Progress file name (defaults to config).
        #[arg(long)]
        progress_file: Option<String>,

        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Inspect and drive a processing-state file.
    State {
        #[command(subcommand)]
        action: StateAction,
    },

    /// Convert legacy dict-based state files to the audit-trail format.
    Migrate {
        /// File or directory to search.
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Report what would change without writing.
        #[arg(long)]
        dry_run: bool,

        /// Keep backups in this directory.
        #[arg(long)]
        backup_dir: Option<PathBuf>,

        /// Delete backups after a verified migration.
        #[arg(long)]
        cleanup_backups: bool,

        /// Do not re-read and verify migrated files.
        #[arg(long)]
        skip_verification: bool,

        /// File name to search for (defaults to config).
        #[arg(long)]
        file_name: Option<String>,
    },

    /// Rewrite the object keys of a JSON file in another casing.
    Adapt {
        /// JSON file to read.
        file: PathBuf,

        /// Target casing: camel or snake.
        #[arg(long)]
        to: KeyCase,

        /// Leave `data`, `error` and `meta` payloads untouched.
        #[arg(long)]
        envelope: bool,

        /// Write here instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Built-in pipelines.
#[derive(Subcommand)]
pub(crate) enum RunPipeline {
    /// Download a document, checksum it and write a manifest.
    Fetch {
        /// Document URL.
        url: String,

        /// Directory for the downloaded file.
        #[arg(short, long, default_value = "downloads")]
        out: PathBuf,

        /// Directory for the progress file and step logs (defaults to config).
        #[arg(long)]
        progress_dir: Option<PathBuf>,

        /// Ignore earlier iterations and run every step.
        #[arg(long)]
        fresh: bool,
    },
}

/// Processing-state subcommands.
#[derive(Subcommand)]
pub(crate) enum StateAction {
    /// Create a state file at NOT_STARTED if none exists.
    Init { file: PathBuf },

    /// Print the audit trail.
    Show {
        file: PathBuf,

        /// Print the file as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check the audit trail for consistency.
    Check { file: PathBuf },

    /// Append a validated transition.
    Transition {
        file: PathBuf,

        /// Target state, e.g. LOCAL_EXTRACTION.
        target: ProcessingState,

        /// Status of the new entry.
        #[arg(long, default_value = "SUCCESS")]
        status: ProcessingStatus,

        /// Branch condition: has_tables or no_tables.
        #[arg(long)]
        condition: Option<TransitionCondition>,

        #[arg(long, default_value = "automatic_progression")]
        reason: TransitionReason,

        #[arg(long, default_value = "user")]
        triggered_by: TriggerSource,

        /// Entry data as a JSON object.
        #[arg(long)]
        data: Option<String>,
    },

    /// Move back to an earlier state.
    Rollback {
        file: PathBuf,
        target: ProcessingState,

        /// Free-text note stored in the entry's meta.
        #[arg(long)]
        note: Option<String>,
    },

    /// Check a transition against the table without touching any file.
    Validate {
        from: ProcessingState,
        to: ProcessingState,

        #[arg(long)]
        status: Option<ProcessingStatus>,

        #[arg(long)]
        condition: Option<TransitionCondition>,
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
        0 => "stepledger=info",
        1 => "stepledger=debug",
        _ => "stepledger=trace",
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
    match cli.command {
        Command::Run { pipeline } => match pipeline {
            RunPipeline::Fetch {
                url,
                out,
                progress_dir,
                fresh,
            } => cmd_run_fetch(&url, out, progress_dir, fresh).await,
        },
        Command::Status {
            progress_dir,
            progress_file,
            json,
        } => cmd_status(progress_dir, progress_file, json).await,
        Command::State { action } => cmd_state(action).await,
        Command::Migrate {
            path,
            dry_run,
            backup_dir,
            cleanup_backups,
            skip_verification,
            file_name,
        } => {
            let config = load_config()?;
            let options = MigrationOptions {
                dry_run,
                backup_dir,
                cleanup_backups,
                skip_verification,
                file_name: file_name.unwrap_or(config.migration.progress_file_name),
                key_case: config.storage.state_key_case,
            };
            cmd_migrate(path, options).await
        }
        Command::Adapt {
            file,
            to,
            envelope,
            out,
        } => cmd_adapt(file, to, envelope, out).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// run / status
// ---------------------------------------------------------------------------

async fn cmd_run_fetch(
    url: &str,
    out: PathBuf,
    progress_dir: Option<PathBuf>,
    fresh: bool,
) -> Result<()> {
    let config = load_config()?;
    let parsed_url = Url::parse(url).map_err(|e| eyre!("invalid URL '{url}': {e}"))?;

    let mut pipeline = PipelineConfig::from(&config);
    if let Some(dir) = progress_dir {
        pipeline = pipeline.with_progress_dir(dir);
    }
    if fresh {
        pipeline = pipeline.with_resume(false);
    }

    info!(
        url,
        out = %out.display(),
        progress_dir = %pipeline.progress_dir.display(),
        fresh,
        "running fetch pipeline"
    );

    let mut steps = fetch_document_steps(FetchOptions::from(&config.fetch))?;
    let reporter = CliProgress::new();
    let result = run_pipeline(
        &mut steps,
        initial_context(&parsed_url, &out),
        &pipeline,
        &reporter,
    )
    .await;
    reporter.clear();
    let run = result?;

    println!();
    if run.replayed {
        println!("  Nothing to do: iteration {} already complete.", run.iteration);
    } else {
        println!("  Pipeline completed.");
    }
    println!("  Iteration: {}", run.iteration);
    println!("  Run:       {}", run.run_id);
    println!("  Executed:  {}", run.executed.len());
    println!("  Reused:    {}", run.reused.len());
    for key in ["file_path", "sha256", "manifest_path"] {
        if let Some(value) = run.context.get(key).and_then(Value::as_str) {
            println!("  {key:<10} {value}");
        }
    }
    println!();

    Ok(())
}

async fn cmd_status(
    progress_dir: Option<PathBuf>,
    progress_file: Option<String>,
    json: bool,
) -> Result<()> {
    let config = load_config()?;
    let mut pipeline = PipelineConfig::from(&config);
    if let Some(dir) = progress_dir {
        pipeline = pipeline.with_progress_dir(dir);
    }
    if let Some(file) = progress_file {
        pipeline.progress_file = file;
    }

    let report = status_report(&pipeline.store()).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
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
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn clear(&self) {
        if !self.spinner.is_finished() {
            self.spinner.finish_and_clear();
        }
    }
}

impl ProgressReporter for CliProgress {
    fn step_started(&self, index: usize, name: &str, total: usize) {
        self.spinner
            .set_message(format!("[{}/{total}] {name}", index + 1));
    }

    fn step_reused(&self, index: usize, name: &str) {
        self.spinner
            .println(format!("  reused   [{}] {name}", index + 1));
    }

    fn step_finished(&self, index: usize, name: &str, status: StepStatus) {
        self.spinner
            .println(format!("  {:<8} [{}] {name}", status.as_str().to_lowercase(), index + 1));
    }

    fn replayed(&self, iteration: u32) {
        self.spinner
            .set_message(format!("Replaying iteration {iteration}"));
    }

    fn done(&self, _run: &PipelineRun) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// state
// ---------------------------------------------------------------------------

fn state_machine(config: &AppConfig, file: PathBuf) -> ProcessingStateMachine {
    ProcessingStateMachine::new(file).with_key_case(config.storage.state_key_case)
}

async fn cmd_state(action: StateAction) -> Result<()> {
    let config = load_config()?;

    match action {
        StateAction::Init { file } => {
            let machine = state_machine(&config, file);
            let state = machine.initialize().await?;
            println!(
                "{}: {} ({} entries)",
                machine.path().display(),
                state.current_state,
                state.states.len()
            );
        }

        StateAction::Show { file, json } => {
            let machine = state_machine(&config, file);
            let state = machine.load().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&state)?);
                return Ok(());
            }
            println!("Current state: {}", state.current_state);
            println!("Updated:       {}", state.updated_at.to_rfc3339());
            for (i, entry) in state.states.iter().enumerate() {
                let from = entry
                    .previous_state
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "-".into());
                let reason = entry
                    .transition_reason
                    .map(|r| format!("{r:?}"))
                    .unwrap_or_default();
                println!(
                    "  {i:>3}  {from:<18} -> {:<18} {:<8} {}  {reason}",
                    entry.state.as_str(),
                    entry.status.as_str(),
                    entry.timestamp.to_rfc3339(),
                );
                for error in &entry.errors {
                    println!("         error: {error}");
                }
            }
        }

        StateAction::Check { file } => {
            let machine = state_machine(&config, file);
            let problems = machine.check_integrity().await?;
            if problems.is_empty() {
                println!("{}: ok", machine.path().display());
            } else {
                for problem in &problems {
                    println!("  {problem}");
                }
                return Err(eyre!(
                    "{}: {} integrity problem(s)",
                    machine.path().display(),
                    problems.len()
                ));
            }
        }

        StateAction::Transition {
            file,
            target,
            status,
            condition,
            reason,
            triggered_by,
            data,
        } => {
            let machine = state_machine(&config, file);
            let mut request = TransitionRequest::new(target)
                .status(status)
                .reason(reason)
                .triggered_by(triggered_by);
            if let Some(condition) = condition {
                request = request.condition(condition);
            }
            if let Some(raw) = data {
                let data: Map<String, Value> = serde_json::from_str(&raw)
                    .map_err(|e| eyre!("--data must be a JSON object: {e}"))?;
                request = request.data(data);
            }
            report_append(machine.append_transition(request).await?)?;
        }

        StateAction::Rollback { file, target, note } => {
            let machine = state_machine(&config, file);
            report_append(
                machine
                    .rollback_to(target, TriggerSource::User, note)
                    .await?,
            )?;
        }

        StateAction::Validate {
            from,
            to,
            status,
            condition,
        } => {
            let verdict = ProcessingStateMachine::validate_transition(from, to, status, condition);
            if !verdict.valid {
                return Err(eyre!("denied: {}", verdict.reason));
            }
            println!("allowed: {}", verdict.reason);
        }
    }

    Ok(())
}

fn report_append(outcome: AppendOutcome) -> Result<()> {
    match outcome {
        AppendOutcome::Applied(entry) => {
            let from = entry
                .previous_state
                .map(|s| s.to_string())
                .unwrap_or_default();
            println!("{from} -> {} ({})", entry.state, entry.status);
            Ok(())
        }
        AppendOutcome::Rejected(verdict) => Err(eyre!("transition rejected: {}", verdict.reason)),
    }
}

// ---------------------------------------------------------------------------
// migrate / adapt / config
// ---------------------------------------------------------------------------

async fn cmd_migrate(path: PathBuf, options: MigrationOptions) -> Result<()> {
    let dry_run = options.dry_run;
    let stats = tokio::task::spawn_blocking(move || Migrator::new(options).migrate_all(&path))
        .await??;

    println!();
    if dry_run {
        println!("  Dry run, nothing was written.");
    }
    println!("  Found:     {}", stats.files_found);
    println!("  Migrated:  {}", stats.files_migrated);
    println!("  Skipped:   {}", stats.files_skipped);
    println!("  Failed:    {}", stats.files_failed);
    println!("  Backups:   {}", stats.backups_created);
    println!(
        "  Verified:  {} ok, {} failed",
        stats.verifications_succeeded, stats.verifications_failed
    );
    println!();

    if stats.files_failed > 0 {
        return Err(eyre!("{} file(s) failed to migrate", stats.files_failed));
    }
    Ok(())
}

async fn cmd_adapt(file: PathBuf, to: KeyCase, envelope: bool, out: Option<PathBuf>) -> Result<()> {
    let raw = tokio::fs::read_to_string(&file)
        .await
        .map_err(|e| eyre!("cannot read {}: {e}", file.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| eyre!("{} is not valid JSON: {e}", file.display()))?;

    let adapted = if envelope {
        FormatAdapter::new(to)
            .with_opaque(["data", "error", "meta"])
            .to_disk(&value)
    } else {
        adapt_keys(&value, to)
    };
    let body = serde_json::to_string_pretty(&adapted)?;

    match out {
        Some(path) => {
            tokio::fs::write(&path, body)
                .await
                .map_err(|e| eyre!("cannot write {}: {e}", path.display()))?;
            info!(from = %file.display(), to = %path.display(), case = %to, "adapted keys");
        }
        None => println!("{body}"),
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
