//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use plancrawl_core::{
    ProgressReporter, RunSummary, ShutdownCoordinator, SilentProgress, StatusReport, crawl_status,
    export_state, run_crawl,
};
use plancrawl_crawler::http_collaborators;
use plancrawl_shared::{AppConfig, CrawlConfig, init_config, load_config, load_config_from};
use tracing::info;

use crate::input::load_inputs;
use crate::progress::CliProgress;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// plancrawl: resumable crawler for plan catalogs keyed by zipcode.
#[derive(Parser)]
#[command(
    name = "plancrawl",
    version,
    about = "Crawl plan listings and plan details per zipcode, resumably.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.plancrawl/plancrawl.toml).
    #[arg(long, global = true, env = "PLANCRAWL_CONFIG")]
    pub config: Option<PathBuf>,

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

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Crawl every zipcode in the input file, resuming previous progress.
    Run {
        /// CSV file with a zipcode column (state and city optional).
        #[arg(short, long)]
        input: PathBuf,

        /// Concurrent workers per phase.
        #[arg(short, long)]
        workers: Option<usize>,

        /// Only schedule the first N input rows.
        #[arg(long)]
        limit: Option<usize>,

        /// Archive existing state and exports, then start over.
        #[arg(long)]
        reset: bool,

        /// Output directory for state and exports.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Disable progress bars.
        #[arg(long)]
        no_progress: bool,
    },

    /// Show progress recorded in an output directory.
    Status {
        /// Output directory (defaults to the configured one).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Rewrite the JSON and CSV exports from the saved state.
    Export {
        /// Output directory (defaults to the configured one).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

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
        0 => "plancrawl=info,plancrawl_core=info,plancrawl_crawler=warn,plancrawl_storage=warn",
        1 => "plancrawl=debug,plancrawl_core=debug,plancrawl_crawler=info,plancrawl_storage=info",
        _ => "plancrawl=trace,plancrawl_core=trace,plancrawl_crawler=debug,plancrawl_storage=debug,plancrawl_shared=debug",
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
    let show_progress = matches!(cli.log_format, LogFormat::Text);
    match cli.command {
        Command::Run {
            input,
            workers,
            limit,
            reset,
            output,
            no_progress,
        } => {
            let config = resolve_config(cli.config.as_deref())?;
            let overrides = RunOverrides {
                workers,
                limit,
                reset,
                output,
            };
            cmd_run(&config, &input, overrides, show_progress && !no_progress).await
        }
        Command::Status { output } => {
            let config = resolve_config(cli.config.as_deref())?;
            cmd_status(&output_dir(&config, output))
        }
        Command::Export { output } => {
            let config = resolve_config(cli.config.as_deref())?;
            cmd_export(&output_dir(&config, output))
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(cli.config.as_deref()),
        },
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

fn output_dir(config: &AppConfig, flag: Option<PathBuf>) -> PathBuf {
    flag.unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir))
}

/// Flags of `run` that override the config file.
struct RunOverrides {
    workers: Option<usize>,
    limit: Option<usize>,
    reset: bool,
    output: Option<PathBuf>,
}

impl RunOverrides {
    fn apply(self, config: &AppConfig) -> CrawlConfig {
        let mut crawl = CrawlConfig::from(config);
        if let Some(workers) = self.workers {
            crawl.workers = workers;
        }
        if let Some(output) = self.output {
            crawl.output_dir = output;
        }
        crawl.limit = self.limit;
        crawl.reset = self.reset;
        crawl
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, input: &Path, overrides: RunOverrides, progress: bool) -> Result<()> {
    let crawl = overrides.apply(config);
    crawl.validate()?;

    let inputs = load_inputs(input)?;
    if inputs.is_empty() {
        return Err(eyre!("no zipcodes found in {}", input.display()));
    }

    let kit = http_collaborators(&config.site)?;

    info!(
        input = %input.display(),
        zipcodes = inputs.len(),
        workers = crawl.workers,
        limit = crawl.limit,
        output = %crawl.output_dir.display(),
        "starting crawl"
    );

    let shutdown = ShutdownCoordinator::new();
    let listener = shutdown.listen_for_signals();

    let reporter: Arc<dyn ProgressReporter> = if progress {
        Arc::new(CliProgress::new())
    } else {
        Arc::new(SilentProgress)
    };

    let result = run_crawl(&crawl, inputs, kit, &shutdown, reporter).await;
    listener.abort();

    let summary = result?;
    print_run_summary(&summary);
    Ok(())
}

fn print_run_summary(summary: &RunSummary) {
    let meta = &summary.metadata;
    println!();
    if summary.interrupted() {
        println!("  Crawl interrupted; progress saved.");
    } else {
        println!("  Crawl finished.");
    }
    if let Some(archive) = &summary.archived {
        println!("  Archived:   {}", archive.display());
    }
    println!("  Resumed:    {}", summary.source.label());
    println!("  Zipcodes:   {} ({} scheduled this run)", meta.total_zipcodes, summary.scoped);
    println!(
        "  Phase 1:    {} processed, {} ok, {} failed",
        meta.phase1_completed, summary.discovery.succeeded, summary.discovery.failed
    );
    println!(
        "  Phase 2:    {} completed, {} ok, {} failed",
        meta.phase2_completed, summary.detail.succeeded, summary.detail.failed
    );
    println!(
        "  Plans:      {} found, {} filled, {} failed",
        meta.total_plans_found, meta.plans_filled, meta.plans_failed
    );
    println!(
        "  Pending:    {} zipcodes, {} plans",
        summary.pending.zipcodes, summary.pending.plans
    );
    println!("  Output:     {}", summary.output_dir.display());
    println!("  Time:       {:.1}s", summary.elapsed.as_secs_f64());
    if summary.final_save_failed {
        println!("  Warning:    final save failed; the last periodic save is on disk.");
    }
    if summary.has_remaining_work() {
        println!();
        println!("  Work remains. Run the same command again to resume.");
    }
    println!();
}

fn cmd_status(output: &Path) -> Result<()> {
    let report = crawl_status(output)?;
    print_status(output, &report);
    Ok(())
}

fn print_status(output: &Path, report: &StatusReport) {
    let meta = &report.metadata;
    let c = &report.counts;
    println!();
    println!("  Output:     {}", output.display());
    println!("  Loaded:     {}", report.source.label());
    println!("  Started:    {}", meta.started_at.to_rfc3339());
    println!("  Updated:    {}", meta.updated_at.to_rfc3339());
    println!("  Workers:    {}", meta.workers);
    println!();
    println!("  Zipcodes:   {}", meta.total_zipcodes);
    println!("    pending         {}", c.zipcodes_pending);
    println!("    urls_collected  {}", c.zipcodes_collected);
    println!("    completed       {}", c.zipcodes_completed);
    println!("    error           {}", c.zipcodes_error);
    println!("  Plans:      {}", meta.total_plans_found);
    println!("    pending         {}", c.plans_pending);
    println!("    completed       {}", c.plans_completed);
    println!("    error           {}", c.plans_error);
    println!();
    let finished = |at: Option<chrono::DateTime<chrono::Utc>>| {
        at.map_or_else(|| "not finished".to_string(), |t| t.to_rfc3339())
    };
    println!("  Phase 1:    {}", finished(meta.phase1_finished_at));
    println!("  Phase 2:    {}", finished(meta.phase2_finished_at));
    println!(
        "  Pending:    {} zipcodes, {} plans",
        report.pending.zipcodes, report.pending.plans
    );
    println!();
}

fn cmd_export(output: &Path) -> Result<()> {
    let entries = export_state(output)?;
    println!("Exports rewritten for {entries} zipcodes in {}", output.display());
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
