use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use apptrust_client::{HttpRegistryClient, JfCliRegistryClient, RegistryClient};
use clap::{Parser, ValueEnum};

use apptrust_rollback::logging::{self, LogConfig, LogFormat};
use apptrust_rollback::report::{self, Report};
use apptrust_rollback::{rollback_in_prod, RollbackError};

#[derive(Debug, Parser)]
#[command(name = "apptrust-rollback")]
#[command(about = "AppTrust PROD rollback utility.", long_about = None)]
struct Cli {
    /// Application key.
    #[arg(long, value_name = "APP_KEY")]
    app: String,

    /// Target version to roll back, matched literally against the registry.
    #[arg(long, value_name = "VERSION")]
    version: String,

    /// Log intended changes without mutating.
    #[arg(long)]
    dry_run: bool,

    /// Registry backend. `auto` uses HTTP when a base URL and token are configured, else `jf`.
    #[arg(long, value_enum, default_value_t = Backend::Auto)]
    backend: Backend,

    /// AppTrust API base URL (default: APPTRUST_BASE_URL, or JFROG_URL + /apptrust/api/v1/).
    #[arg(long, value_name = "URL")]
    base_url: Option<String>,

    /// HTTP timeout per request.
    #[arg(long, value_name = "SECS", default_value_t = 30, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_secs: u64,

    /// Print a JSON report to stdout instead of status lines.
    #[arg(long)]
    json: bool,

    /// Log filter for stderr logs (overridden by RUST_LOG).
    #[arg(long, value_name = "LEVEL", default_value = "warn")]
    log_level: String,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Auto,
    Http,
    Jf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let log_config = LogConfig {
        level: cli.log_level.clone(),
        format: cli.log_format,
    };
    if let Err(err) = logging::init_logging(&log_config) {
        eprintln!("warning: {err}");
    }
    run(&cli)
}

fn run(cli: &Cli) -> ExitCode {
    let start = Instant::now();
    let result = match build_client(cli) {
        Ok(client) => rollback_in_prod(client.as_ref(), &cli.app, &cli.version, cli.dry_run),
        Err(err) => Err(RollbackError::InvalidInput(format!("{err:#}"))),
    };

    match result {
        Ok(outcome) => {
            if cli.json {
                print_report(&Report::success(&outcome));
            } else {
                for line in report::status_lines(&outcome) {
                    println!("{line}");
                }
                println!("Done in {:.2}s", start.elapsed().as_secs_f64());
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            if cli.json {
                print_report(&Report::failure(&err));
            }
            eprintln!("ERROR: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn print_report(report: &Report<'_>) {
    match serde_json::to_string(report) {
        Ok(text) => println!("{text}"),
        Err(err) => eprintln!("encode report: {err}"),
    }
}

fn build_client(cli: &Cli) -> Result<Box<dyn RegistryClient>> {
    let api_url = apptrust_client::resolve_api_url(cli.base_url.as_deref())?;
    let timeout = Duration::from_secs(cli.timeout_secs);

    match cli.backend {
        Backend::Http => {
            let Some(api_url) = api_url else {
                bail!("--backend http needs --base-url, APPTRUST_BASE_URL or JFROG_URL");
            };
            let Some(token) = apptrust_client::resolve_token(&api_url)? else {
                bail!("--backend http needs APPTRUST_TOKEN, JFROG_ACCESS_TOKEN or a credentials entry for {api_url}");
            };
            let client = HttpRegistryClient::new(&api_url, Some(token))?.with_timeout(timeout);
            Ok(Box::new(client))
        }
        Backend::Jf => Ok(Box::new(JfCliRegistryClient::from_env()?)),
        Backend::Auto => {
            if let Some(api_url) = api_url {
                if let Some(token) = apptrust_client::resolve_token(&api_url)? {
                    let client =
                        HttpRegistryClient::new(&api_url, Some(token))?.with_timeout(timeout);
                    return Ok(Box::new(client));
                }
            }
            Ok(Box::new(JfCliRegistryClient::from_env()?))
        }
    }
}
