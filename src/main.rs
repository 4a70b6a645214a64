use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use opsguard::config::{Config, SandboxBackend};
use opsguard::gateway::Gateway;
use opsguard::orchestrator::{Orchestrator, OrchestratorOptions, RunOutcome, RunRequest, Status};
use opsguard::report::{summary_text, ArtifactWriter, FinalReport};
use opsguard::sandbox::{create_sandbox, VerificationMode};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    /// Run the entry file with the interpreter
    Entry,
    /// Install pytest and run the test suite
    Pytest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SandboxArg {
    Docker,
    Process,
}

#[derive(Parser, Debug)]
#[command(
    name = "opsguard",
    about = "Reproduce a reported failure, generate a fix, keep it only if it verifies",
    version
)]
struct Args {
    /// Path to the repository to repair
    #[arg(long)]
    repo: PathBuf,

    /// Description of the reported error
    #[arg(long)]
    error: String,

    /// Entry file relative to the repository; also the file being fixed
    #[arg(long, default_value = "app.py")]
    entry: PathBuf,

    /// How a fix is verified
    #[arg(long, value_enum, default_value = "entry")]
    mode: ModeArg,

    /// Test directory for pytest mode
    #[arg(long, default_value = "tests")]
    tests_dir: PathBuf,

    /// Config file (defaults to ./opsguard.toml, then the user config)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Where run artifacts are written
    #[arg(long)]
    artifacts: Option<PathBuf>,

    /// Sandbox backend
    #[arg(long, value_enum)]
    sandbox: Option<SandboxArg>,

    /// Sandbox timeout per execution, in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    json: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(verbose: bool, json: bool) {
    let default = if verbose { "opsguard=debug" } else { "opsguard=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(backend) = args.sandbox {
        config.sandbox.backend = match backend {
            SandboxArg::Docker => SandboxBackend::Docker,
            SandboxArg::Process => SandboxBackend::Process,
        };
    }
    if let Some(timeout) = args.timeout {
        config.sandbox.timeout_secs = timeout;
    }
    if let Some(dir) = &args.artifacts {
        config.artifacts.dir = dir.clone();
    }
}

fn print_banner(outcome: &RunOutcome, artifacts: &std::path::Path) {
    let marker = match outcome.status {
        Status::Success => "✅",
        Status::NotReproducible => "🔍",
        Status::InfraStop => "🛑",
        _ => "❌",
    };
    eprintln!();
    eprintln!("{} {}", marker, outcome.status);
    for line in summary_text(outcome).lines() {
        eprintln!("  {}", line);
    }
    if !outcome.diff.is_empty() {
        eprintln!();
        eprintln!("{}", outcome.diff);
    }
    eprintln!("  Artifacts: {}", artifacts.display());
}

async fn run(args: Args) -> Result<i32> {
    let (mut config, source) = Config::load(args.config.as_deref())?;
    apply_overrides(&mut config, &args);
    config.validate()?;
    tracing::info!(config = %source, backend = ?config.sandbox.backend, "Configuration loaded");

    let sandbox = create_sandbox(&config.sandbox);
    let gateway = Gateway::from_config(&config.providers)
        .context("Failed to set up generation providers")?;
    let orchestrator = Orchestrator::new(sandbox, gateway, OrchestratorOptions::from_config(&config));

    let mode = match args.mode {
        ModeArg::Entry => VerificationMode::Entry,
        ModeArg::Pytest => VerificationMode::Pytest {
            tests_dir: args.tests_dir.clone(),
        },
    };
    let request = RunRequest {
        repo: args.repo.clone(),
        error_description: args.error.clone(),
        entry: args.entry.clone(),
        mode,
    };

    let outcome = orchestrator.run(request).await;

    let writer = ArtifactWriter::new(config.artifacts.dir.join(&outcome.run_id));
    let written = writer.write(&outcome);
    for failure in &written.failures {
        eprintln!("Warning: artifact not written: {}", failure);
    }

    if args.json {
        let report = FinalReport::from_outcome(&outcome);
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_banner(&outcome, writer.root());
    }

    Ok(outcome.status.exit_code())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose, args.log_json);

    let code = match run(args).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            Status::Failed.exit_code()
        }
    };
    std::process::exit(code);
}
