use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use dialoguer::{Confirm, theme::ColorfulTheme};
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{BenchSettings, default_config_path};
use crate::helper::{DockerStatus, HelperClient, HelperStatus};
use crate::history::{HistoryKind, RunHistory};
use crate::identifier::{self, InputShape};
use crate::lint;
use crate::metrics::{self, format_metric};
use crate::orchestrator::{RunOrchestrator, RunOutcome};
use crate::session::BenchSession;
use crate::telemetry;
use crate::upload::UploadController;

#[derive(Parser, Debug)]
#[command(name = "sweperf-bench", version, about = "Run SWE-Perf workloads through the local bench helper", long_about = None)]
pub struct Cli {
    /// Increase logging verbosity.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Custom config path.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the helper endpoint from the config file.
    #[arg(long, global = true, value_name = "URL")]
    pub endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check that the helper is reachable.
    Health,
    /// Ask the helper whether Docker is available.
    DockerCheck,
    /// Resolve a PR URL, image tag or instance id and print the docker command.
    Resolve {
        #[arg(value_name = "INPUT")]
        input: String,
    },
    /// Print workload hints for a file.
    Lint {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Prepare and run a workload, optionally uploading the result.
    Run(RunArgs),
    /// Start GitHub device authorization for uploads.
    Auth,
    /// Show recent runs and uploads (optionally specify COUNT entries).
    History {
        #[arg(value_name = "COUNT", default_value_t = 10)]
        count: usize,
    },
    /// Print the resolved configuration.
    Config,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// GitHub PR URL, image tag or bare instance id.
    #[arg(long)]
    pub input: String,

    /// Python workload file.
    #[arg(long, value_name = "FILE")]
    pub code: PathBuf,

    /// Notes sent with the submission.
    #[arg(long, default_value = "")]
    pub notes: String,

    /// Agree to upload the result to SWEf-data.
    #[arg(long, action = ArgAction::SetTrue)]
    pub agree: bool,

    /// Submit and upload once the run completes.
    #[arg(long, action = ArgAction::SetTrue)]
    pub upload: bool,

    /// Stay alive until scheduled upload retries settle.
    #[arg(long, action = ArgAction::SetTrue)]
    pub follow: bool,
}

struct AppContext {
    settings: BenchSettings,
    config_path: PathBuf,
    helper: HelperClient,
}

fn bootstrap(cli: &Cli) -> Result<AppContext> {
    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let mut settings = BenchSettings::load_or_default(&config_path)?;
    if let Some(endpoint) = &cli.endpoint {
        settings.helper.endpoint = endpoint.clone();
        settings.helper.endpoint_url()?;
    }

    telemetry::init_tracing("sweperf-bench", cli.verbose, &settings.logging)?;
    info!(path = %config_path.display(), endpoint = %settings.helper.endpoint, "using bench config");

    let helper = HelperClient::from_settings(&settings.helper)?;
    Ok(AppContext {
        settings,
        config_path,
        helper,
    })
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let ctx = bootstrap(&cli)?;

    match cli.command {
        Command::Health => print_health(&ctx.helper).await,
        Command::DockerCheck => print_docker(&ctx.helper).await,
        Command::Resolve { input } => print_resolution(&input),
        Command::Lint { file } => print_lint(&file),
        Command::Run(args) => run_workload(&ctx, args).await,
        Command::Auth => authenticate(&ctx).await,
        Command::History { count } => print_history(&ctx.settings, count),
        Command::Config => print_config(&ctx),
    }
}

async fn print_health(helper: &HelperClient) -> Result<()> {
    match helper.health().await {
        HelperStatus::Connected(payload) => {
            println!("Connected to {}", helper.endpoint());
            print_payload(&payload);
            Ok(())
        }
        HelperStatus::Offline(error) => {
            bail!("Helper offline at {}: {error}", helper.endpoint())
        }
    }
}

async fn print_docker(helper: &HelperClient) -> Result<()> {
    match helper.docker_check().await {
        DockerStatus::Available(payload) => {
            println!("Docker available");
            print_payload(&payload);
        }
        DockerStatus::Unavailable(payload) => {
            println!("Docker unavailable");
            print_payload(&payload);
        }
        DockerStatus::Error(error) => println!("Docker check failed: {error}"),
    }
    Ok(())
}

fn print_payload(payload: &Value) {
    if let Ok(rendered) = serde_json::to_string_pretty(payload) {
        println!("{rendered}");
    }
}

fn print_resolution(input: &str) -> Result<()> {
    let Some((instance, shape)) = identifier::resolve_with_shape(input) else {
        bail!("Could not resolve an instance id from '{}'", input.trim());
    };
    let shape = match shape {
        InputShape::GithubPull => "GitHub pull request",
        InputShape::ContainerTag => "container tag",
        InputShape::Bare => "instance id",
    };
    let image = instance.image();
    println!("Instance : {instance} (from {shape})");
    println!("Image    : {image}");
    println!("Command  : {}", identifier::docker_command(None, &image));
    Ok(())
}

fn read_workload(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("failed to read workload {}", path.display()))
}

fn print_lint(path: &Path) -> Result<()> {
    let code = read_workload(path)?;
    let hints = lint::lint(&code);
    println!("{}", lint::summarize(&hints));
    Ok(())
}

fn confirm_consent(args: &RunArgs) -> Result<bool> {
    if args.agree || !args.upload {
        return Ok(args.agree);
    }
    if !std::io::stdin().is_terminal() {
        warn!("upload requested without --agree on a non-interactive terminal");
        return Ok(false);
    }
    let agreed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("I agree to upload to SWEf-data")
        .default(false)
        .interact()?;
    Ok(agreed)
}

async fn run_workload(ctx: &AppContext, args: RunArgs) -> Result<()> {
    let code = read_workload(&args.code)?;
    let consent = confirm_consent(&args)?;

    let session = BenchSession::new();
    session.set_input(args.input.clone());
    session.set_code(code);
    session.set_notes(args.notes.clone());
    session.set_consent(consent);

    let history = RunHistory::new(ctx.settings.resolve_history_path()?);
    let orchestrator = RunOrchestrator::new(ctx.helper.clone(), session.clone())
        .with_history(history.clone());

    let outcome = {
        let run = orchestrator.run_benchmark();
        tokio::pin!(run);
        tokio::select! {
            outcome = &mut run => outcome,
            _ = tokio::signal::ctrl_c() => {
                orchestrator.cancel();
                run.await
            }
        }
    };
    print_run(&session, &outcome);

    if !matches!(outcome, RunOutcome::Complete { .. }) {
        bail!("benchmark did not complete");
    }
    if !args.upload {
        return Ok(());
    }

    let uploads = UploadController::with_history(
        ctx.helper.clone(),
        session.clone(),
        ctx.settings.upload,
        history,
        orchestrator.session_id(),
    );
    let report = uploads.one_click_submit().await;
    println!("Submit   : {}", report.submit_log);
    println!("Upload   : {}", report.upload);
    if let Some(message) = session.snapshot().upload_log {
        println!("           {message}");
    }

    if args.follow && uploads.has_pending_retry() {
        println!(
            "Waiting for upload retries (every {}s, up to {} attempts)...",
            ctx.settings.upload.backoff_secs, ctx.settings.upload.max_attempts
        );
        tokio::select! {
            _ = uploads.wait_idle() => {}
            _ = tokio::signal::ctrl_c() => uploads.stop(),
        }
        if let Some(step) = uploads.last_step() {
            println!("Upload   : {step}");
        }
        if let Some(message) = session.snapshot().upload_log {
            println!("           {message}");
        }
    }
    Ok(())
}

fn print_run(session: &BenchSession, outcome: &RunOutcome) {
    let state = session.snapshot();
    if let Some(instance) = &state.instance {
        println!("Instance : {instance}");
    }
    println!("Lint     : {}", lint::summarize(&state.hints));
    if let Some(command) = &state.docker_command {
        println!("Command  : {command}");
    }
    for line in &state.pull_log {
        println!("Pull     : {line}");
    }
    println!("Before   : {}", state.before.summary());
    println!("After    : {}", state.after.summary());
    println!("{}", state.improvement);
    if let Some(factor) = metrics::speedup(state.before.mean, state.after.mean) {
        println!("Speedup  : {factor:.2}x");
    }
    for (side, view) in [("before", &state.before), ("after", &state.after)] {
        if let Some(log) = view.log.as_deref().filter(|_| view.errored) {
            println!("Error ({side}): {log}");
        }
    }
    if let Some(log) = &state.run_log {
        println!("Log      : {log}");
    }
    match outcome {
        RunOutcome::Cancelled => println!("Run cancelled."),
        RunOutcome::Superseded => println!("Run replaced by a newer one."),
        _ => {}
    }
}

async fn authenticate(ctx: &AppContext) -> Result<()> {
    let session = BenchSession::new();
    let uploads = UploadController::new(ctx.helper.clone(), session.clone(), ctx.settings.upload);
    let device = uploads.start_auth().await?;
    info!(user_code = %device.user_code, "device code issued");
    if let Some(message) = session.snapshot().upload_log {
        println!("{message}");
    }
    uploads.stop();
    Ok(())
}

fn print_history(settings: &BenchSettings, limit: usize) -> Result<()> {
    let history = RunHistory::new(settings.resolve_history_path()?);
    let entries = history.read_recent(limit)?;

    if entries.is_empty() {
        println!(
            "No runs recorded yet. Log file: {}",
            history.log_path().display()
        );
        return Ok(());
    }

    println!(
        "Recent {} entr(ies) (showing up to {} requested) from {}",
        entries.len(),
        limit,
        history.log_path().display()
    );
    for entry in entries.iter().rev() {
        let kind = match entry.kind {
            HistoryKind::Run => "run",
            HistoryKind::Upload => "upload",
        };
        println!(
            "- {} [{kind}] {} before={} after={} improvement={}",
            entry.timestamp.to_rfc3339(),
            entry.instance.as_deref().unwrap_or(metrics::PLACEHOLDER),
            format_metric(entry.before_mean),
            format_metric(entry.after_mean),
            entry
                .improvement
                .map(|percent| format!("{percent:.2}%"))
                .unwrap_or_else(|| metrics::PLACEHOLDER.to_string()),
        );
        println!("    outcome : {}", entry.outcome);
    }
    Ok(())
}

fn print_config(ctx: &AppContext) -> Result<()> {
    println!("Config   : {}", ctx.config_path.display());
    println!("History  : {}", ctx.settings.resolve_history_path()?.display());
    if let Some(path) = telemetry::current_log_file() {
        println!("Log file : {}", path.display());
    }
    println!("{}", serde_json::to_string_pretty(&ctx.settings)?);
    Ok(())
}
