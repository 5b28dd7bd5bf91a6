use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use optq_runner::config::CONFIG_TEMPLATE;
use optq_runner::logging::init_logging;
use optq_runner::{
    CaseApi, CaseRunner, Dispatcher, HttpDispatcher, PipelineConfig, Scheduler, SchedulerConfig,
    StagedPipeline,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod http;

#[derive(Parser)]
#[command(name = "optq", version = "0.3.0", about = "Fair-share optimization case scheduler")]
struct Cli {
    /// Scheduler configuration file.
    #[arg(long, global = true, default_value = "optq.yaml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a commented configuration template.
    Init {
        #[arg(long)]
        force: bool,
    },
    Submit {
        case: String,
        #[arg(long)]
        json: bool,
    },
    Withdraw {
        case: String,
        #[arg(long)]
        json: bool,
    },
    Status {
        case: String,
        #[arg(long)]
        json: bool,
    },
    Progress {
        case: String,
        #[arg(long)]
        json: bool,
    },
    Log {
        case: String,
        #[arg(long)]
        max_chars: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    List {
        #[arg(long)]
        json: bool,
    },
    /// Run the scheduler loop until interrupted.
    Serve,
    /// Serve submit and status endpoints over HTTP.
    Http {
        #[arg(long, default_value = "127.0.0.1:8080")]
        bind: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(&cli.config, cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(config_path: &Path, command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Init { force } => {
            if !force && config_path.exists() {
                return Err(anyhow!(
                    "config file already exists (use --force): {}",
                    config_path.display()
                ));
            }
            if let Some(parent) = config_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            std::fs::write(config_path, CONFIG_TEMPLATE)?;
            println!("wrote: {}", config_path.display());
            println!(
                "next: edit pipeline.stages and queue.cases_root in {}",
                config_path.display()
            );
            println!("next: optq --config {} serve", config_path.display());
        }
        Commands::Submit { case, json } => {
            let api = load_api(config_path)?;
            let reply = api.submit_case(&case)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "submit",
                    "case_id": reply.case_id,
                    "added": reply.added,
                    "message": reply.message
                })));
            }
            println!("{}", reply.message);
        }
        Commands::Withdraw { case, json } => {
            let api = load_api(config_path)?;
            let withdrawn = api.withdraw_case(&case)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "withdraw",
                    "case_id": case,
                    "withdrawn": withdrawn
                })));
            }
            if withdrawn {
                println!("withdrawn: {}", case);
            } else {
                println!("not waiting, nothing withdrawn: {}", case);
            }
        }
        Commands::Status { case, json } => {
            let api = load_api(config_path)?;
            let status = api.get_status(&case)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "case_id": case,
                    "status": status
                })));
            }
            match status {
                Some(status) => println!("{}: {}", case, status),
                None => println!("{}: not in queue", case),
            }
        }
        Commands::Progress { case, json } => {
            let api = load_api(config_path)?;
            let progress = api.get_progress(&case)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "progress",
                    "progress": progress
                })));
            }
            print!("{}: {}% {}", case, progress.percent, progress.message);
            if let Some(secs) = progress.elapsed_secs {
                print!(" (elapsed {})", format_elapsed(secs));
            }
            println!();
        }
        Commands::Log {
            case,
            max_chars,
            json,
        } => {
            let api = load_api(config_path)?;
            let tail = api.get_log_tail(&case, max_chars)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "log",
                    "case_id": case,
                    "log": tail
                })));
            }
            match tail {
                Some(text) => print!("{}", text),
                None => println!("no log yet: {}", case),
            }
        }
        Commands::List { json } => {
            let api = load_api(config_path)?;
            let cases = api.list_cases()?;
            let counts = api.counts()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "cases": cases,
                    "counts": counts
                })));
            }
            for record in &cases {
                println!(
                    "{:<8} {} submitted={}",
                    record.status.as_str(),
                    record.case_id,
                    record.submitted_at.to_rfc3339()
                );
            }
            println!(
                "waiting={} running={} done={} failed={}",
                counts.waiting, counts.running, counts.done, counts.failed
            );
        }
        Commands::Serve => {
            let config = SchedulerConfig::load(config_path)?;
            init_logging(&config.logging)?;
            let runner: Arc<dyn CaseRunner> = match &config.pipeline {
                PipelineConfig::Staged(staged) => Arc::new(StagedPipeline::new(staged.clone())),
                PipelineConfig::Iterative(_) => {
                    return Err(anyhow!(
                        "pipeline kind 'iterative' needs an optimization plan from an embedding program; optq serve runs staged pipelines"
                    ))
                }
            };
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let dispatcher: Arc<dyn Dispatcher> =
                    Arc::new(HttpDispatcher::new(&config.dispatcher)?);
                let scheduler = Scheduler::from_config(&config, dispatcher, runner);
                scheduler
                    .run(async {
                        if let Err(err) = tokio::signal::ctrl_c().await {
                            tracing::error!(error = %err, "failed to listen for shutdown signal");
                            std::future::pending::<()>().await;
                        }
                    })
                    .await
            })?;
        }
        Commands::Http { bind } => {
            let config = SchedulerConfig::load(config_path)?;
            init_logging(&config.logging)?;
            http::serve(&bind, CaseApi::from_config(&config))?;
        }
    }
    Ok(None)
}

fn load_api(config_path: &Path) -> Result<CaseApi> {
    let config = SchedulerConfig::load(config_path)?;
    Ok(CaseApi::from_config(&config))
}

fn format_elapsed(secs: i64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

pub(crate) fn error_code(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<optq_runner::Error>()
        .map(|e| e.code())
        .unwrap_or("command_failed")
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

pub(crate) fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Submit { json, .. }
        | Commands::Withdraw { json, .. }
        | Commands::Status { json, .. }
        | Commands::Progress { json, .. }
        | Commands::Log { json, .. }
        | Commands::List { json } => *json,
        _ => false,
    }
}
