//! Command line interface of the `impala-loadtest` binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use argh::FromArgs;
use loadtest_core::client::ClientFactory;
use loadtest_core::events::Stats;

use crate::config::Config;
use crate::{confirm, observability, report, scenarios};

/// Load tests for Impala clusters.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Confirm(ConfirmCommand),
    Validate(ValidateCommand),
    Version(VersionCommand),
}

/// run the configured load test and print a report
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {
    /// write <prefix>_requests.csv and <prefix>_failures.csv
    #[argh(option)]
    csv: Option<PathBuf>,
}

/// compare query results of a reference and a test cluster
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "confirm")]
struct ConfirmCommand {
    /// compare a hash of every row instead of every value
    #[argh(switch)]
    by_hash: bool,

    /// only compare the query in this file of the query directory
    #[argh(option)]
    query: Option<String>,
}

/// check the configuration and print it with all defaults applied
///
/// Secrets are redacted in the output.
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "validate")]
struct ValidateCommand {}

/// print the load test runner version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    // Special switch to just print the version and exit.
    if let Command::Version(_) = args.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = Config::load(args.config.as_deref())?;

    let csv = match args.command {
        Command::Validate(ValidateCommand {}) => {
            config.validate()?;
            print!("{}", serde_yaml::to_string(&config)?);
            return Ok(());
        }
        Command::Run(RunCommand { csv }) => csv,
        Command::Confirm(command) => return run_confirm(config, command),
        Command::Version(_) => unreachable!(),
    };
    if csv.is_some() {
        config.report.csv = csv;
    }

    let runtime = build_runtime()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    let factory = ClientFactory::new(config.client.to_client_config(config.seed));
    let stats = Arc::new(Stats::new());

    let summary = runtime.block_on(async {
        let spinner = report::spinner("running load test")?;
        let result = scenarios::run(&config, factory, Arc::clone(&stats)).await;
        spinner.finish_and_clear();
        result
    })?;

    report::print(&summary, &stats);
    if let Some(prefix) = &config.report.csv {
        report::write_csv(prefix, &stats, summary.elapsed)?;
    }

    let failed = summary.failed_users().count();
    if failed > 0 {
        bail!("{failed} of {} users ended with an error", summary.users);
    }
    Ok(())
}

fn run_confirm(config: Config, command: ConfirmCommand) -> Result<()> {
    let runtime = build_runtime()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    let factory = ClientFactory::new(config.client.to_client_config(config.seed));
    let result = runtime.block_on(async {
        let spinner = report::spinner("comparing results")?;
        let result =
            confirm::run(&config, &factory, command.by_hash, command.query.as_deref()).await;
        spinner.finish_and_clear();
        result
    })?;

    confirm::print(&result);

    let mismatches = result.mismatches().count();
    if mismatches > 0 {
        bail!("{mismatches} of {} queries did not match", result.results.len());
    }
    Ok(())
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("loadtest-rt")
        .enable_all()
        .build()?;
    Ok(runtime)
}
