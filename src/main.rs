use agent_term::process::ShellSpec;
use agent_term::utils::path_utils::expand_tilde_path_buf;
use agent_term::{AppError, Config, RunOptions, TerminalRegistry};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

const CLI_OWNER: &str = "cli";

fn setup_logging(log_level_str: &str) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("agent_term={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

/// `agent-term [--cwd DIR] <command...>`
fn parse_args() -> Result<(Option<String>, String)> {
    let mut args = std::env::args().skip(1);
    let mut cwd = None;
    let mut words = Vec::new();
    while let Some(arg) = args.next() {
        if words.is_empty() && arg == "--cwd" {
            cwd = Some(args.next().context("--cwd needs a directory")?);
            continue;
        }
        words.push(arg);
    }
    if words.is_empty() {
        anyhow::bail!("usage: agent-term [--cwd DIR] <command...>");
    }
    Ok((cwd, words.join(" ")))
}

fn exit_code_of(outcome: &agent_term::RunOutcome) -> i32 {
    let exit = outcome.exit();
    match (exit.exit_code, exit.signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => agent_term::UNKNOWN_EXIT_CODE,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()
        .context("Failed to load configuration")
        .map_err(AppError::from)?;
    setup_logging(&config.log_level);

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting agent-term");
    tracing::debug!("Loaded configuration: {:?}", config);

    let shell = ShellSpec::resolve(config.default_shell.as_deref());
    if which::which(&shell.program).is_err() {
        tracing::warn!(shell = %shell.program, "Configured shell not found in PATH, commands will fail to spawn");
    }

    let (cwd, command) = parse_args()?;
    let cwd: PathBuf = match cwd {
        Some(raw) => expand_tilde_path_buf(&raw)?,
        None => config.default_cwd.clone(),
    };

    let config = Arc::new(config);
    let registry = TerminalRegistry::new(Arc::clone(&config));
    let terminal = registry.acquire(&cwd, CLI_OWNER)?;
    let mut run = match terminal.run(&command, RunOptions::from_config(&config)) {
        Ok(run) => run,
        Err(e) if e.is_admission() => {
            tracing::error!(error = %e, "Command not admitted");
            std::process::exit(2);
        }
        Err(e) => return Err(e.into()),
    };

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);
    let mut aborting = false;
    loop {
        tokio::select! {
            event = run.next_event() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            _ = &mut interrupted, if !aborting => {
                tracing::warn!("Interrupted, aborting command");
                aborting = true;
                run.abort().await;
            }
        }
    }

    let outcome = run.outcome().await;
    println!("{}", serde_json::to_string(&outcome)?);
    registry.shutdown().await;

    tracing::info!("Shutdown.");
    std::process::exit(exit_code_of(&outcome));
}
