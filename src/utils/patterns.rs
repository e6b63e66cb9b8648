/// One "should not wait" pattern: an exact command, or a prefix when the
/// pattern ends with `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CommandPattern {
    Exact(String),
    Prefix(String),
}

/// Background command patterns, compiled once per run.
#[derive(Debug, Clone, Default)]
pub struct CommandPatterns {
    patterns: Vec<CommandPattern>,
}

impl CommandPatterns {
    pub fn compile<S: AsRef<str>>(raw: &[S]) -> Self {
        let patterns = raw
            .iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .map(|p| match p.strip_suffix('*') {
                Some(prefix) => CommandPattern::Prefix(prefix.to_string()),
                None => CommandPattern::Exact(p),
            })
            .collect();
        Self { patterns }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Case-insensitive match of the trimmed command.
    pub fn matches(&self, command: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let command = command.trim().to_lowercase();
        self.patterns.iter().any(|pattern| match pattern {
            CommandPattern::Exact(exact) => command == *exact,
            CommandPattern::Prefix(prefix) => command.starts_with(prefix.as_str()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_wildcard_matches_any_suffix() {
        let patterns = CommandPatterns::compile(&["npm run *"]);
        assert!(patterns.matches("npm run dev"));
        assert!(patterns.matches("  NPM RUN build  "));
        assert!(!patterns.matches("npm install"));
        assert!(!patterns.matches("npm run"));
    }

    #[test]
    fn exact_patterns_need_the_whole_command() {
        let patterns = CommandPatterns::compile(&["cargo watch", ""]);
        assert!(patterns.matches("Cargo Watch"));
        assert!(!patterns.matches("cargo watch -x test"));
    }

    #[test]
    fn lone_star_matches_everything() {
        let patterns = CommandPatterns::compile(&["*"]);
        assert!(patterns.matches("anything at all"));
    }

    #[test]
    fn empty_set_matches_nothing() {
        let patterns = CommandPatterns::compile::<&str>(&[]);
        assert!(patterns.is_empty());
        assert!(!patterns.matches("npm run dev"));
    }
}
