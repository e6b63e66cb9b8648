use regex::Regex;
use std::sync::OnceLock;

fn escape_regex() -> &'static Regex {
    static ESCAPES: OnceLock<Regex> = OnceLock::new();
    ESCAPES.get_or_init(|| {
        // OSC (terminated by BEL or ST), CSI, and two-byte ESC sequences
        Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b\[[0-?]*[ -/]*[@-~]|\x1b[@-Z\\-_]")
            .expect("escape sequence regex is valid")
    })
}

/// Removes terminal escape sequences; output is otherwise passed through untouched.
pub fn strip_ansi(text: &str) -> String {
    if !text.contains('\x1b') {
        return text.to_string();
    }
    escape_regex().replace_all(text, "").into_owned()
}

/// Keeps the first and last halves of `line_limit` lines, eliding the middle.
/// A limit of 0 disables truncation.
pub fn compress_output(output: &str, line_limit: usize) -> String {
    if line_limit == 0 {
        return output.to_string();
    }
    let lines: Vec<&str> = output.split_inclusive('\n').collect();
    if lines.len() <= line_limit {
        return output.to_string();
    }
    let head = line_limit / 2;
    let tail = line_limit - head;
    let omitted = lines.len() - head - tail;
    let mut compressed = String::with_capacity(output.len().min(line_limit * 120));
    for line in &lines[..head] {
        compressed.push_str(line);
    }
    if !compressed.is_empty() && !compressed.ends_with('\n') {
        compressed.push('\n');
    }
    compressed.push_str(&format!("\n[...{} lines omitted...]\n\n", omitted));
    for line in &lines[lines.len() - tail..] {
        compressed.push_str(line);
    }
    compressed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_color_and_osc_sequences() {
        let raw = "\x1b[32mok\x1b[0m done\x1b]633;P;Cwd=/tmp\x07\n";
        assert_eq!(strip_ansi(raw), "ok done\n");
    }

    #[test]
    fn plain_text_untouched() {
        assert_eq!(strip_ansi("hello\nworld"), "hello\nworld");
    }

    #[test]
    fn compress_keeps_head_and_tail() {
        let output: String = (1..=10).map(|i| format!("line {}\n", i)).collect();
        let compressed = compress_output(&output, 4);
        assert!(compressed.starts_with("line 1\nline 2\n"));
        assert!(compressed.contains("[...6 lines omitted...]"));
        assert!(compressed.ends_with("line 9\nline 10\n"));
    }

    #[test]
    fn compress_disabled_or_short() {
        assert_eq!(compress_output("a\nb\n", 0), "a\nb\n");
        assert_eq!(compress_output("a\nb\n", 5), "a\nb\n");
    }
}
