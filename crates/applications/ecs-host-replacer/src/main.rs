//! ecs-replace - swap the single EC2 host behind an ECS cluster
//!
//! ## Usage
//!
//! ```bash
//! # Look at what a replacement would act on (no changes)
//! ecs-replace inspect my-cluster
//!
//! # Replace the host, asking before the drain and before the scale-in
//! ecs-replace --profile prod --region eu-west-1 replace my-cluster
//!
//! # Bounded waits, machine-readable report
//! ecs-replace --max-poll-attempts 30 --json replace my-cluster
//! ```
//!
//! Exit codes: 0 on success or operator decline, 2 when the cluster is not in
//! a replaceable state, 1 on any other failure.

use anyhow::Context;
use clap::{Parser, Subcommand};
use ecs_host_replacer::{
    AutoScalingCapacityApi, EcsClusterApi, Orchestrator, PromptGate, ReplacementConfig,
    ReplacementOutcome, ReplacementPlan, ReplacementReport, RetryPolicy, load_sdk_config,
    waiter::DEFAULT_POLL_INTERVAL_SECS,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Exit code for a cluster that is not in a replaceable state
const EXIT_NOT_REPLACEABLE: u8 = 2;

/// ecs-replace: replace the single EC2 host behind an ECS cluster
#[derive(Parser)]
#[command(name = "ecs-replace")]
#[command(about = "Replace the single EC2 host behind an ECS cluster", long_about = None)]
struct Cli {
    /// Named AWS profile
    #[arg(long, global = true, env = "ECS_REPLACE_PROFILE")]
    profile: Option<String>,

    /// AWS region (default: from the profile/environment)
    #[arg(long, global = true, env = "ECS_REPLACE_REGION")]
    region: Option<String>,

    /// Seconds between polls
    #[arg(long, global = true, env = "ECS_REPLACE_POLL_INTERVAL_SECS", default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    poll_interval_secs: u64,

    /// Give up a wait after this many polls (default: never)
    #[arg(long, global = true, env = "ECS_REPLACE_MAX_POLL_ATTEMPTS")]
    max_poll_attempts: Option<u32>,

    /// Double the delay after each poll, up to this many seconds
    #[arg(long, global = true, env = "ECS_REPLACE_BACKOFF_MAX_SECS")]
    backoff_max_secs: Option<u64>,

    /// Also write logs to this file
    #[arg(long, global = true, env = "ECS_REPLACE_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Print the final report as JSON
    #[arg(long, global = true, env = "ECS_REPLACE_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replace the cluster's host (prompts twice before destructive steps)
    Replace {
        /// ECS cluster name
        cluster: String,
    },

    /// Show the instance and group a replacement would act on
    Inspect {
        /// ECS cluster name
        cluster: String,
    },
}

impl Cli {
    fn retry_policy(&self) -> anyhow::Result<RetryPolicy> {
        anyhow::ensure!(self.poll_interval_secs > 0, "--poll-interval-secs must be at least 1");

        let mut policy = RetryPolicy::unbounded(Duration::from_secs(self.poll_interval_secs));

        if let Some(attempts) = self.max_poll_attempts {
            anyhow::ensure!(attempts > 0, "--max-poll-attempts must be at least 1");
            policy = policy.with_max_attempts(attempts);
        }

        if let Some(max_secs) = self.backoff_max_secs {
            anyhow::ensure!(
                max_secs >= self.poll_interval_secs,
                "--backoff-max-secs must not be below --poll-interval-secs"
            );
            policy = policy.with_exponential_backoff(2, Duration::from_secs(max_secs));
        }

        Ok(policy)
    }
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file_name = path
                .file_name()
                .with_context(|| format!("--log-file {} does not name a file", path.display()))?;
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));

            let appender = tracing_appender::rolling::never(dir, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    // Logs go to stderr so stdout carries only prompts and reports
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ecs_host_replacer=info,info".into()),
        )
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_file.as_deref())?;

    let config = ReplacementConfig::default().with_retry_policy(cli.retry_policy()?);

    let sdk_config = load_sdk_config(cli.profile.as_deref(), cli.region.as_deref()).await;
    info!(
        region = sdk_config.region().map(|r| r.as_ref()).unwrap_or("unset"),
        profile = cli.profile.as_deref().unwrap_or("default"),
        "Loaded AWS configuration"
    );

    let orchestrator = Orchestrator::new(
        Arc::new(EcsClusterApi::from_config(&sdk_config)),
        Arc::new(AutoScalingCapacityApi::from_config(&sdk_config)),
        Arc::new(PromptGate::stdio()),
    )
    .with_config(config);

    match cli.command {
        Commands::Replace { cluster } => {
            let report = orchestrator
                .run(&cluster)
                .await
                .with_context(|| format!("Host replacement in cluster {} failed", cluster))?;
            print_report(&report, cli.json)?;

            Ok(match report.outcome {
                ReplacementOutcome::Aborted { .. } => ExitCode::from(EXIT_NOT_REPLACEABLE),
                _ => ExitCode::SUCCESS,
            })
        }

        Commands::Inspect { cluster } => {
            let plan = orchestrator
                .plan(&cluster)
                .await
                .with_context(|| format!("Inspecting cluster {} failed", cluster))?;
            print_plan(&plan, cli.json)?;

            Ok(if plan.is_ready() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_NOT_REPLACEABLE)
            })
        }
    }
}

fn print_report(report: &ReplacementReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Session:  {}", report.session_id);
    println!("Cluster:  {}", report.cluster_name);
    if let Some(host) = &report.target_host {
        println!("Old host: {}", host);
    }
    if let Some(group) = &report.group_name {
        println!("Group:    {}", group);
    }

    match &report.outcome {
        ReplacementOutcome::Completed { replacement_host } => {
            println!("Result:   replaced by {}", replacement_host)
        }
        ReplacementOutcome::Aborted { reason } => println!("Result:   not replaced ({})", reason),
        ReplacementOutcome::Declined { checkpoint } => {
            println!("Result:   stopped by operator at {:?}", checkpoint)
        }
    }
    println!("Elapsed:  {:.0}s", report.total_time_secs);

    Ok(())
}

fn print_plan(plan: &ReplacementPlan, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(plan)?);
        return Ok(());
    }

    println!("Cluster:  {}", plan.cluster_name);
    if let Some(target) = &plan.target {
        println!(
            "Host:     {} ({}, {} running, {} pending)",
            target.host_id, target.status, target.running_task_count, target.pending_task_count
        );
    }
    if let Some(membership) = &plan.membership {
        println!(
            "Group:    {} (scale-in protected: {})",
            membership.group_name, membership.protected_from_scale_in
        );
    }

    match &plan.blocked_by {
        None => println!("Ready for replacement"),
        Some(reason) => println!("Not replaceable: {}", reason),
    }

    Ok(())
}
