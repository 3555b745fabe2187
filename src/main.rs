use std::convert::Infallible;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::{BucketManager, InterceptError, MemoryBucketStore, RateLimitInterceptor};
use tollgate::service::{self, DemoService};

/// Invoke rate limited demo operations.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Cli {
    /// YAML configuration file (defaults to the built-in demo buckets)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Call a protected operation
    Invoke {
        /// Operation name (call1 or call2)
        operation: String,
        /// Number of calls to make
        #[arg(short = 'n', long, default_value_t = 1)]
        times: u32,
        /// Issue all calls at once instead of one after another
        #[arg(long)]
        concurrent: bool,
    },
    /// Show the configured buckets
    Buckets,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => TollgateConfig::from_file(path)?,
        None => TollgateConfig {
            buckets: service::default_buckets(),
            ..TollgateConfig::default()
        },
    };
    let definitions = Arc::new(config.definitions()?);
    info!(buckets = definitions.len(), "Configuration loaded");

    let mut manager = BucketManager::new(Arc::new(MemoryBucketStore::new()))
        .with_store_timeout(config.store.timeout());
    if let Some(instance_id) = &config.store.instance_id {
        manager = manager.with_instance_id(instance_id);
    }
    let interceptor = Arc::new(RateLimitInterceptor::new(
        definitions.clone(),
        Arc::new(manager),
    ));

    let mut operations = service::declared_operations();
    operations.extend(config.operations.clone());
    let undefined = operations.undefined_buckets(&definitions);
    for (operation, bucket) in &undefined {
        warn!(operation = %operation, bucket = %bucket, "Operation uses an undefined bucket");
    }

    match cli.command {
        Command::Buckets => {
            for definition in definitions.iter() {
                let line = match definition.bandwidth() {
                    Ok(bandwidth) => json!({
                        "name": definition.name,
                        "capacity": bandwidth.capacity(),
                        "refill_tokens": bandwidth.refill_tokens(),
                        "refill_period_secs": bandwidth.refill_period().as_secs(),
                    }),
                    Err(e) => json!({ "name": definition.name, "error": e.to_string() }),
                };
                println!("{}", line);
            }
            for (operation, bucket) in &undefined {
                println!(
                    "{}",
                    json!({ "name": bucket, "operation": operation, "error": "bucket is not defined" })
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Invoke {
            operation,
            times,
            concurrent,
        } => {
            let service = DemoService::new(interceptor, &operations);
            if service.limit(&operation).is_none() {
                anyhow::bail!(
                    "unknown operation '{}', expected one of {:?}",
                    operation,
                    service::OPERATIONS
                );
            }

            let outcomes = if concurrent {
                let service = &service;
                let operation = operation.as_str();
                futures::future::join_all((1..=times).map(|attempt| async move {
                    (attempt, service.invoke(operation).await)
                }))
                .await
            } else {
                let mut outcomes = Vec::with_capacity(times as usize);
                for attempt in 1..=times {
                    outcomes.push((attempt, service.invoke(&operation).await));
                }
                outcomes
            };

            let mut exit = 0;
            for (attempt, outcome) in outcomes {
                let outcome = outcome.context("operation disappeared")?;
                let (line, code) = report(&operation, attempt, outcome);
                println!("{}", line);
                // failures take precedence over denials
                if code == 1 || exit == 0 {
                    exit = code;
                }
            }
            Ok(ExitCode::from(exit))
        }
    }
}

/// Render one call outcome and the exit code it maps to.
///
/// Denials (2) and failures (1) are kept apart so callers can tell
/// "over budget" from "not working".
fn report(
    operation: &str,
    attempt: u32,
    outcome: Result<String, InterceptError<Infallible>>,
) -> (serde_json::Value, u8) {
    match outcome {
        Ok(value) => (
            json!({ "operation": operation, "attempt": attempt, "outcome": "granted", "result": value }),
            0,
        ),
        Err(InterceptError::Guard(e)) if e.is_rate_limited() => {
            let retry_after_ms = e
                .retry_after()
                .map(|wait| u64::try_from(wait.as_millis()).unwrap_or(u64::MAX));
            (
                json!({
                    "operation": operation,
                    "attempt": attempt,
                    "outcome": "rate_limited",
                    "retry_after_ms": retry_after_ms,
                }),
                2,
            )
        }
        Err(e) => {
            warn!(operation = %operation, error = %e, "Call failed");
            (
                json!({ "operation": operation, "attempt": attempt, "outcome": "error", "error": e.to_string() }),
                1,
            )
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
