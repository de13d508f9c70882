//! Diagnostic commands for the helpdesk recovery layer.
//!
//! ## Commands
//!
//! - `helpdesk-recovery probe` - Check backend reachability
//! - `helpdesk-recovery classify <MESSAGE>` - Show how an error would be handled
//! - `helpdesk-recovery backoff` - Print the configured retry schedule
//!
//! ## Exit Codes
//!
//! - 0: Success (for `probe`: backend reachable)
//! - 1: Backend unreachable
//! - 2: Configuration error

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use helpdesk_recovery::config::{ConfigLoader, RecoveryConfig};
use helpdesk_recovery::{
    ErrorClassification, ErrorClassifier, ErrorDescriptor, ErrorRecoveryService, SessionStore,
};
use serde::Serialize;

/// Exit codes for all commands
pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const UNREACHABLE: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

#[derive(Debug, Parser)]
#[command(name = "helpdesk-recovery", version, about = "Helpdesk backend error recovery diagnostics")]
pub struct Cli {
    /// Config file (default: ./helpdesk-recovery.toml, then user config dirs)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Check whether the backend answers its probe endpoint
    ///
    /// Exits 0 when reachable, 1 otherwise.
    Probe(ProbeArgs),

    /// Classify an error message and show whether it would be retried
    Classify(ClassifyArgs),

    /// Print the delay before each retry under the configured policy
    Backoff(BackoffArgs),
}

#[derive(Debug, Parser)]
pub struct ProbeArgs {
    /// Override backend.url
    #[arg(long, value_name = "URL")]
    pub url: Option<String>,

    /// Output as JSON for automation
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ClassifyArgs {
    /// Error message as reported by the backend
    pub message: String,

    /// Machine-readable error code (e.g. PGRST301, 42501, ECONNREFUSED)
    #[arg(long)]
    pub code: Option<String>,

    /// HTTP status of the failed response
    #[arg(long)]
    pub status: Option<u16>,

    /// Output as JSON for automation
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct BackoffArgs {
    /// Number of retries to show (default: retry.max_retries)
    #[arg(long, value_name = "N")]
    pub attempts: Option<u32>,

    /// Output as JSON for automation
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct ProbeReport {
    reachable: bool,
    url: String,
    session_id: String,
    latency_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct Classification {
    pub classification: ErrorClassification,
    pub retryable: bool,
    pub user_message: &'static str,
}

#[derive(Debug, Serialize)]
struct BackoffStep {
    retry: u32,
    delay_ms: u64,
}

impl Cli {
    pub async fn run(self) -> i32 {
        let config = match load_config(self.config.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Configuration error: {e:#}");
                return exit_codes::CONFIG_ERROR;
            }
        };

        match self.command {
            Command::Probe(args) => run_probe(config, args).await,
            Command::Classify(args) => run_classify(&config, args),
            Command::Backoff(args) => run_backoff(&config, args),
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RecoveryConfig> {
    let config = match path {
        Some(path) => ConfigLoader::new().with_file(path).load()?,
        None => ConfigLoader::load_default()?,
    };
    Ok(config)
}

async fn run_probe(mut config: RecoveryConfig, args: ProbeArgs) -> i32 {
    if let Some(url) = args.url {
        config.backend.url = url;
    }
    let url = config.backend.endpoint(&config.backend.probe_path);

    let service = match ErrorRecoveryService::from_config(&config, SessionStore::new()) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return exit_codes::CONFIG_ERROR;
        }
    };

    let start = std::time::Instant::now();
    let reachable = service.test_connectivity().await;
    let report = ProbeReport {
        reachable,
        url,
        session_id: service.session_id().to_string(),
        latency_ms: start.elapsed().as_millis() as u64,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
    } else if reachable {
        println!("✓ Backend reachable");
        println!("  URL: {}", report.url);
        println!("  Latency: {}ms", report.latency_ms);
    } else {
        println!("✗ Backend unreachable");
        println!("  URL: {}", report.url);
    }

    if reachable {
        exit_codes::OK
    } else {
        exit_codes::UNREACHABLE
    }
}

/// Classification of `args` under the keyword table and retry policy in `config`.
pub fn classify(config: &RecoveryConfig, args: &ClassifyArgs) -> anyhow::Result<Classification> {
    let classifier = ErrorClassifier::new(config.keyword_table());
    let mut descriptor = ErrorDescriptor::new(args.message.clone());
    if let Some(code) = &args.code {
        descriptor = descriptor.with_code(code.clone());
    }
    if let Some(status) = args.status {
        descriptor = descriptor.with_status(status);
    }

    let classification = classifier.classify_descriptor(&descriptor);
    let policy = config.retry_policy()?;
    Ok(Classification {
        classification,
        retryable: policy.is_retryable(classification),
        user_message: classification.user_message(),
    })
}

fn run_classify(config: &RecoveryConfig, args: ClassifyArgs) -> i32 {
    let result = match classify(config, &args) {
        Ok(result) => result,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return exit_codes::CONFIG_ERROR;
        }
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result).unwrap_or_default());
    } else {
        println!("{}", result.classification);
        println!(
            "  Retryable: {}",
            if result.retryable { "yes" } else { "no" }
        );
        println!("  User message: {}", result.user_message);
    }
    exit_codes::OK
}

/// Delay before each retry, without jitter.
pub fn backoff_schedule(
    config: &RecoveryConfig,
    attempts: Option<u32>,
) -> anyhow::Result<Vec<Duration>> {
    let policy = config.retry_policy()?;
    Ok(match attempts {
        Some(retries) => policy.schedule_for(retries),
        None => policy.schedule(),
    })
}

fn run_backoff(config: &RecoveryConfig, args: BackoffArgs) -> i32 {
    let schedule = match backoff_schedule(config, args.attempts) {
        Ok(schedule) => schedule,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return exit_codes::CONFIG_ERROR;
        }
    };

    if args.json {
        let steps: Vec<BackoffStep> = schedule
            .iter()
            .zip(1..)
            .map(|(delay, retry)| BackoffStep {
                retry,
                delay_ms: delay.as_millis() as u64,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&steps).unwrap_or_default());
    } else {
        for (retry, delay) in (1..).zip(&schedule) {
            println!("retry {retry}: {}ms", delay.as_millis());
        }
        if config.retry.jitter_factor > 0.0 {
            println!("  (plus up to {:.0}% jitter)", config.retry.jitter_factor * 100.0);
        }
    }
    exit_codes::OK
}
