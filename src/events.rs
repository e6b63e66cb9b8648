use serde::Serialize;

/// Exit code reported when a command could not be spawned or its exit
/// status could not be determined.
pub const UNKNOWN_EXIT_CODE: i32 = -1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitDetails {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub signal_name: Option<String>,
    pub core_dump_possible: Option<bool>,
}

impl ExitDetails {
    pub fn unknown() -> Self {
        Self {
            exit_code: Some(UNKNOWN_EXIT_CODE),
            ..Default::default()
        }
    }

    /// Interprets a shell-reported exit code, where values above 128 mean
    /// the command died from signal `code - 128`.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(code) if code > 128 && code < 128 + 65 => {
                let signal = code - 128;
                Self {
                    exit_code: Some(code),
                    signal: Some(signal),
                    signal_name: signal_name(signal),
                    core_dump_possible: Some(signal_dumps_core(signal)),
                }
            }
            Some(code) => Self {
                exit_code: Some(code),
                ..Default::default()
            },
            None => Self::default(),
        }
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self {
                    exit_code: None,
                    signal: Some(signal),
                    signal_name: signal_name(signal),
                    core_dump_possible: Some(status.core_dumped()),
                };
            }
        }
        Self {
            exit_code: status.code(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> Option<String> {
    nix::sys::signal::Signal::try_from(signal)
        .ok()
        .map(|s| s.as_str().to_string())
}

#[cfg(not(unix))]
fn signal_name(signal: i32) -> Option<String> {
    let name = match signal {
        1 => "SIGHUP",
        2 => "SIGINT",
        3 => "SIGQUIT",
        4 => "SIGILL",
        6 => "SIGABRT",
        8 => "SIGFPE",
        9 => "SIGKILL",
        11 => "SIGSEGV",
        13 => "SIGPIPE",
        14 => "SIGALRM",
        15 => "SIGTERM",
        _ => return None,
    };
    Some(name.to_string())
}

// SIGQUIT, SIGILL, SIGTRAP, SIGABRT, SIGBUS, SIGFPE, SIGSEGV, SIGSYS, SIGXCPU, SIGXFSZ
fn signal_dumps_core(signal: i32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;
        matches!(
            Signal::try_from(signal),
            Ok(Signal::SIGQUIT
                | Signal::SIGILL
                | Signal::SIGTRAP
                | Signal::SIGABRT
                | Signal::SIGBUS
                | Signal::SIGFPE
                | Signal::SIGSEGV
                | Signal::SIGSYS
                | Signal::SIGXCPU
                | Signal::SIGXFSZ)
        )
    }
    #[cfg(not(unix))]
    {
        matches!(signal, 3 | 4 | 5 | 6 | 7 | 8 | 11 | 31)
    }
}

/// Everything a run reports to its caller, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TerminalEvent {
    /// Zero or more complete lines of output since the previous emission.
    Line(String),
    Completed(String),
    ShellExecutionComplete(ExitDetails),
    CommandTimeout(String),
    BackgroundCommand(String),
    /// The command process will emit nothing further.
    Continue,
}

/// The single final result of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { output: String, exit: ExitDetails },
    Aborted { output: String, exit: ExitDetails },
    Failed { error: String, exit: ExitDetails },
}

impl RunOutcome {
    pub fn exit(&self) -> &ExitDetails {
        match self {
            RunOutcome::Completed { exit, .. }
            | RunOutcome::Aborted { exit, .. }
            | RunOutcome::Failed { exit, .. } => exit,
        }
    }

    pub fn output(&self) -> &str {
        match self {
            RunOutcome::Completed { output, .. } | RunOutcome::Aborted { output, .. } => output,
            RunOutcome::Failed { .. } => "",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_exit_code() {
        let details = ExitDetails::from_exit_code(Some(2));
        assert_eq!(details.exit_code, Some(2));
        assert_eq!(details.signal, None);
        assert!(!details.is_success());
        assert!(ExitDetails::from_exit_code(Some(0)).is_success());
    }

    #[test]
    fn high_exit_code_maps_to_signal() {
        let details = ExitDetails::from_exit_code(Some(130));
        assert_eq!(details.signal, Some(2));
        assert_eq!(details.signal_name.as_deref(), Some("SIGINT"));
        assert_eq!(details.core_dump_possible, Some(false));

        let segv = ExitDetails::from_exit_code(Some(139));
        assert_eq!(segv.signal_name.as_deref(), Some("SIGSEGV"));
        assert_eq!(segv.core_dump_possible, Some(true));
    }

    #[test]
    fn missing_code_is_empty() {
        assert_eq!(ExitDetails::from_exit_code(None), ExitDetails::default());
        assert_eq!(ExitDetails::unknown().exit_code, Some(UNKNOWN_EXIT_CODE));
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_string(&TerminalEvent::Line("hi\n".into())).unwrap();
        assert_eq!(json, r#"{"type":"line","data":"hi\n"}"#);
        let json = serde_json::to_string(&TerminalEvent::Continue).unwrap();
        assert_eq!(json, r#"{"type":"continue"}"#);
    }
}
