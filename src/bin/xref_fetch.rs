use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use xref_fetch::app::App;
use xref_fetch::cancel::CancellationToken;
use xref_fetch::config::ConfigLoader;
use xref_fetch::error::XrefError;
use xref_fetch::output::JsonOutput;

#[derive(Parser)]
#[command(name = "xref-fetch")]
#[command(about = "Batch retrieval of cross-reference mappings from external services")]
#[command(version, author)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run every enabled retriever and print the run report")]
    Run(RunArgs),
    #[command(about = "Print the tasks a run would schedule, without network access")]
    Plan(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: Option<String>,

    /// Restrict the run to these retrievers (repeatable).
    #[arg(long = "only")]
    only: Vec<String>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(xref) = report.downcast_ref::<XrefError>() {
            return ExitCode::from(map_exit_code(xref));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &XrefError) -> u8 {
    match error {
        XrefError::Configuration(_)
        | XrefError::MissingConfig
        | XrefError::ConfigRead(_)
        | XrefError::ConfigParse(_)
        | XrefError::InvalidSpecies(_)
        | XrefError::InvalidReferenceDb(_) => 2,
        XrefError::ConnectionFailure { .. }
        | XrefError::HostUnreachable { .. }
        | XrefError::IoFailure { .. }
        | XrefError::ServiceStatus { .. }
        | XrefError::QueryFailed { .. }
        | XrefError::RateLimitExhausted { .. } => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            let app = build_app(&args)?;
            let report = app.run()?;
            JsonOutput::print_report(&report).into_diagnostic()?;
        }
        Commands::Plan(args) => {
            let app = build_app(&args)?;
            let plan = app.plan()?;
            JsonOutput::print_plan(&plan).into_diagnostic()?;
        }
    }
    Ok(())
}

fn build_app(args: &RunArgs) -> Result<App, XrefError> {
    let mut resolved = ConfigLoader::resolve(args.config.as_deref())?;
    resolved.retain_only(&args.only)?;
    Ok(App::new(resolved, CancellationToken::new()))
}
