use tokio::time::Instant;

use crate::events::ExitDetails;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionRecord {
    pub exit_details: ExitDetails,
    pub sub_command: String,
}

/// Splits a command line on top-level `&&` and `;`. Separators inside
/// quotes or escaped with a backslash do not split; `||` and `|` never do.
pub fn split_compound_command(command: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' if !in_single => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            ';' if !in_single && !in_double => {
                parts.push(std::mem::take(&mut current));
            }
            '&' if !in_single && !in_double && chars.peek() == Some(&'&') => {
                chars.next();
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    parts.push(current);

    parts
        .into_iter()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Compound-command bookkeeping of the terminal's current run.
#[derive(Debug, Default)]
pub struct CompoundState {
    pub is_compound: bool,
    pub expected: usize,
    pub sub_commands: Vec<String>,
    pub completions: Vec<CompletionRecord>,
    pub finalize_deadline: Option<Instant>,
}

/// Result of recording one sub-command completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompoundProgress {
    /// All expected completions arrived; carries the last one's exit details.
    Complete(ExitDetails),
    Pending { received: usize, expected: usize },
    /// No command is running on the terminal.
    Inactive,
}

impl CompoundState {
    pub fn detect(command: &str) -> Self {
        let sub_commands = split_compound_command(command);
        let expected = sub_commands.len().max(1);
        Self {
            is_compound: expected > 1,
            expected,
            sub_commands,
            completions: Vec::new(),
            finalize_deadline: None,
        }
    }

    /// Sub-command text for the next completion when the shell did not name it.
    pub fn next_sub_command(&self) -> String {
        self.sub_commands
            .get(self.completions.len())
            .or_else(|| self.sub_commands.last())
            .cloned()
            .unwrap_or_default()
    }

    pub fn last_exit(&self) -> Option<ExitDetails> {
        self.completions.last().map(|r| r.exit_details.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_and_and_semicolon() {
        assert_eq!(split_compound_command("cd src && ls"), vec!["cd src", "ls"]);
        assert_eq!(split_compound_command("a; b ;c"), vec!["a", "b", "c"]);
        assert_eq!(split_compound_command("a && b; c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn quoted_and_escaped_separators_do_not_split() {
        assert_eq!(split_compound_command(r#"echo "a && b"; ls"#), vec![r#"echo "a && b""#, "ls"]);
        assert_eq!(split_compound_command("echo 'x;y'"), vec!["echo 'x;y'"]);
        assert_eq!(split_compound_command(r"echo a\;b"), vec![r"echo a\;b"]);
    }

    #[test]
    fn pipes_and_or_are_single_commands() {
        assert_eq!(split_compound_command("make || echo failed"), vec!["make || echo failed"]);
        assert_eq!(split_compound_command("ls | grep rs"), vec!["ls | grep rs"]);
        assert_eq!(split_compound_command("sleep 1 &"), vec!["sleep 1 &"]);
    }

    #[test]
    fn empty_parts_are_dropped() {
        assert_eq!(split_compound_command("ls;"), vec!["ls"]);
        assert!(split_compound_command("  ").is_empty());
        let state = CompoundState::detect("  ");
        assert_eq!(state.expected, 1);
        assert!(!state.is_compound);
    }

    #[test]
    fn detect_counts_sub_commands() {
        let state = CompoundState::detect("cd src && ls");
        assert!(state.is_compound);
        assert_eq!(state.expected, 2);
        assert_eq!(state.next_sub_command(), "cd src");
    }
}
