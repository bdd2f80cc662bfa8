use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use orca_runtime::{CheckRegistry, ModuleRegistry, Orchestrator, RunSummary, RuntimeConfig};
use shared_audit::{AuditSink, AuditTrail, NullAuditSink};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "orca", version, about = "Runs ORCA module configurations")]
struct Cli {
    /// Enables debug logging unless RUST_LOG is set.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Runs a configuration to completion.
    Run(RunArgs),
    /// Parses a configuration and instantiates its modules without running them.
    Validate {
        #[arg(long)]
        config: PathBuf,
    },
    /// Lists the module types and property checks this binary knows.
    List,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    /// Audit file; defaults to `<log-dir>/audit_<timestamp>.jsonl`.
    #[arg(long)]
    audit_log: Option<PathBuf>,
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
    /// Overrides `workers` from the configuration.
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Run(args) => handle_run(&args),
        Commands::Validate { config } => handle_validate(&config),
        Commands::List => {
            let registry = module_registry(Arc::new(NullAuditSink));
            println!("module types: {}", registry.type_tags().join(", "));
            println!("checks: {}", CheckRegistry::builtin().names().join(", "));
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn module_registry(audit: Arc<dyn AuditSink>) -> ModuleRegistry {
    let mut registry = ModuleRegistry::new(Arc::clone(&audit));
    orca_thermostat::register_all(&mut registry, audit);
    registry
}

fn load_config(path: &Path) -> Result<RuntimeConfig> {
    RuntimeConfig::from_path(path).with_context(|| format!("loading {}", path.display()))
}

fn handle_run(args: &RunArgs) -> Result<()> {
    let mut config = load_config(&args.config)?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    let audit_path = args.audit_log.clone().unwrap_or_else(|| default_audit_path(&args.log_dir));
    let trail = Arc::new(
        AuditTrail::builder("orca")
            .log_path(&audit_path)
            .build()
            .with_context(|| format!("opening audit log {}", audit_path.display()))?,
    );
    info!(audit = %audit_path.display(), mode = %config.mode, "starting run");

    let audit: Arc<dyn AuditSink> = trail.clone();
    let registry = module_registry(Arc::clone(&audit));
    let outcome = Orchestrator::from_config(&config, &registry, &CheckRegistry::builtin(), audit)
        .context("building orchestrator")
        .and_then(|mut orchestrator| orchestrator.run().context("running configuration"));
    trail.shutdown();

    let summary = outcome?;
    print_summary(&summary, &audit_path);
    Ok(())
}

fn handle_validate(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let registry = module_registry(Arc::new(NullAuditSink));
    let orchestrator = Orchestrator::from_config(
        &config,
        &registry,
        &CheckRegistry::builtin(),
        Arc::new(NullAuditSink),
    )?;
    println!("mode: {}", config.mode);
    println!("budget: {:?}", config.budget()?);
    println!("min cycle: {}", orchestrator.engine().min_cycle());
    for module in &config.modules {
        println!(
            "  {:<12} {:<14} cycle={:<6} in={:?} out={:?}{}",
            module.id,
            module.type_tag,
            module.cycle.unwrap_or_default(),
            module.inputs,
            module.outputs,
            if module.is_env { " [env]" } else { "" }
        );
    }
    Ok(())
}

fn default_audit_path(log_dir: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d_%H%M%S");
    log_dir.join(format!("audit_{stamp}.jsonl"))
}

fn print_summary(summary: &RunSummary, audit_path: &Path) {
    println!(
        "cycles={} episodes={} dispatched={} deadlocks={}",
        summary.cycles, summary.episodes, summary.dispatched, summary.deadlocks
    );
    println!("audit log: {}", audit_path.display());
}
