use anyhow::{Context, Result};
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;

use crate::utils::path_utils::{expand_tilde_path_buf, normalize_cwd};

/// Delays and limits used by the engine's timers.
#[derive(Debug, Clone)]
pub struct EngineTimings {
    /// Minimum spacing between two `line` emissions of one command.
    pub flush_interval: Duration,
    pub hot_timeout: Duration,
    pub hot_timeout_compiling: Duration,
    pub pid_resolve_delay: Duration,
    pub compound_finalize_timeout: Duration,
    pub abort_grace: Duration,
    pub kill_verify_delay: Duration,
    /// How long an integrated stream may stay open after its completions were aggregated.
    pub stream_drain_timeout: Duration,
    pub taskkill_attempts: u32,
    pub taskkill_backoff: Duration,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(500),
            hot_timeout: Duration::from_secs(2),
            hot_timeout_compiling: Duration::from_secs(15),
            pid_resolve_delay: Duration::from_millis(100),
            compound_finalize_timeout: Duration::from_secs(10),
            abort_grace: Duration::from_secs(5),
            kill_verify_delay: Duration::from_millis(500),
            stream_drain_timeout: Duration::from_secs(2),
            taskkill_attempts: 3,
            taskkill_backoff: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub default_cwd: PathBuf,
    pub default_shell: Option<String>,
    pub log_level: String,
    pub blocked_commands: Vec<Regex>,
    pub background_commands: Vec<String>,
    pub command_timeout_secs: u64,
    pub output_line_limit: usize,
    pub timings: EngineTimings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            default_shell: None,
            log_level: "info".to_string(),
            blocked_commands: Vec::new(),
            background_commands: Vec::new(),
            command_timeout_secs: 0,
            output_line_limit: 500,
            timings: EngineTimings::default(),
        }
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(|s| s.trim()).filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid {}: {}", name, raw)),
        _ => Ok(default),
    }
}

/// Compiles blocked command names into regexes matching the command word,
/// optionally preceded by `VAR=value` assignments.
pub fn compile_blocked_commands<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Vec<Regex>> {
    names
        .into_iter()
        .map(|s| {
            Regex::new(&format!(
                r"^(?:[a-zA-Z_][a-zA-Z0-9_]*=[^ ]* )*{}(?:\s.*|$)",
                regex::escape(s)
            ))
            .context(format!("Invalid regex for blocked command: {}", s))
        })
        .collect()
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let default_cwd = match std::env::var("DEFAULT_CWD").ok().filter(|s| !s.is_empty()) {
            Some(raw) => {
                let expanded = expand_tilde_path_buf(&raw)?;
                let cwd = normalize_cwd(&expanded)?;
                if !cwd.is_dir() {
                    anyhow::bail!("DEFAULT_CWD is not a valid directory: {:?}", cwd);
                }
                cwd
            }
            None => std::env::current_dir().context("Failed to read the current directory")?,
        };

        let default_shell = std::env::var("DEFAULT_SHELL").ok().filter(|s| !s.is_empty());
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let blocked_commands_str = std::env::var("BLOCKED_COMMANDS").unwrap_or_default();
        let blocked_commands = compile_blocked_commands(split_list(&blocked_commands_str))?;

        let background_commands = split_list(&std::env::var("BACKGROUND_COMMANDS").unwrap_or_default())
            .map(String::from)
            .collect();

        let command_timeout_secs = env_parse("COMMAND_TIMEOUT_SECS", 0u64)?;
        let output_line_limit = env_parse("OUTPUT_LINE_LIMIT", 500usize)?;

        let mut timings = EngineTimings::default();
        timings.compound_finalize_timeout = Duration::from_millis(env_parse(
            "COMPOUND_FINALIZE_TIMEOUT_MS",
            timings.compound_finalize_timeout.as_millis() as u64,
        )?);
        timings.abort_grace = Duration::from_millis(env_parse(
            "ABORT_GRACE_MS",
            timings.abort_grace.as_millis() as u64,
        )?);

        Ok(Config {
            default_cwd,
            default_shell,
            log_level,
            blocked_commands,
            background_commands,
            command_timeout_secs,
            output_line_limit,
            timings,
        })
    }

    /// Checks the first word that is not a `VAR=value` assignment against the blocklist.
    pub fn is_command_blocked(&self, command: &str) -> bool {
        let effective_command = command
            .trim_start()
            .split_whitespace()
            .find(|s| !s.contains('='))
            .unwrap_or("");
        if effective_command.is_empty() {
            return false;
        }
        self.blocked_commands
            .iter()
            .any(|regex| regex.is_match(effective_command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_command_skips_env_assignments() {
        let config = Config {
            blocked_commands: compile_blocked_commands(["sudo", "rm"]).unwrap(),
            ..Config::default()
        };
        assert!(config.is_command_blocked("sudo ls"));
        assert!(config.is_command_blocked("FOO=1 rm -rf build"));
        assert!(!config.is_command_blocked("rmdir build"));
        assert!(!config.is_command_blocked("echo sudo"));
        assert!(!config.is_command_blocked("   "));
    }

    #[test]
    fn default_timings() {
        let timings = EngineTimings::default();
        assert_eq!(timings.flush_interval, Duration::from_millis(500));
        assert_eq!(timings.compound_finalize_timeout, Duration::from_secs(10));
        assert_eq!(timings.taskkill_attempts, 3);
    }
}
