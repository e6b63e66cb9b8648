const ESC: u8 = 0x1b;
const BEL: u8 = 0x07;
const OSC_PREFIX: &[u8] = b"\x1b]";
// Longest OSC sequence held back while waiting for its terminator.
const MAX_PENDING_SEQUENCE: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerEvent {
    Output(Vec<u8>),
    CommandStart,
    CommandEnd(Option<i32>),
}

/// Splits a shell-integration data stream into output and command markers
/// (`OSC 633;C`/`633;D[;code]` and their `133` equivalents). Sequences cut
/// across chunk boundaries are buffered until complete.
#[derive(Debug, Default)]
pub struct MarkerParser {
    pending: Vec<u8>,
}

impl MarkerParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<MarkerEvent> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        let mut text = Vec::new();
        let mut i = 0;
        while i < buf.len() {
            if buf[i] != ESC {
                text.push(buf[i]);
                i += 1;
                continue;
            }
            let rest = &buf[i..];
            if rest.len() < OSC_PREFIX.len() {
                // lone ESC at the end, might start an OSC
                break;
            }
            if !rest.starts_with(OSC_PREFIX) {
                text.push(ESC);
                i += 1;
                continue;
            }
            match find_terminator(&rest[OSC_PREFIX.len()..]) {
                Some((body_len, term_len)) => {
                    let body = &rest[OSC_PREFIX.len()..OSC_PREFIX.len() + body_len];
                    match classify(body) {
                        Sequence::Marker(marker) => {
                            flush_text(&mut text, &mut events);
                            events.push(marker);
                        }
                        Sequence::Integration => {}
                        Sequence::Other => {
                            text.extend_from_slice(&rest[..OSC_PREFIX.len() + body_len + term_len]);
                        }
                    }
                    i += OSC_PREFIX.len() + body_len + term_len;
                }
                None if rest.len() > MAX_PENDING_SEQUENCE => {
                    text.push(ESC);
                    i += 1;
                }
                None => break,
            }
        }
        if i < buf.len() {
            self.pending = buf[i..].to_vec();
        }
        flush_text(&mut text, &mut events);
        events
    }

    /// Releases whatever is still buffered once the stream ended.
    pub fn finish(&mut self) -> Option<MarkerEvent> {
        if self.pending.is_empty() {
            None
        } else {
            Some(MarkerEvent::Output(std::mem::take(&mut self.pending)))
        }
    }
}

enum Sequence {
    Marker(MarkerEvent),
    /// Other shell-integration bookkeeping (prompt start, cwd reports, ...).
    Integration,
    Other,
}

fn flush_text(text: &mut Vec<u8>, events: &mut Vec<MarkerEvent>) {
    if !text.is_empty() {
        events.push(MarkerEvent::Output(std::mem::take(text)));
    }
}

// Returns (body length, terminator length) for BEL or ST (ESC \).
fn find_terminator(body: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < body.len() {
        match body[i] {
            BEL => return Some((i, 1)),
            ESC => {
                if i + 1 >= body.len() {
                    return None;
                }
                if body[i + 1] == b'\\' {
                    return Some((i, 2));
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn classify(body: &[u8]) -> Sequence {
    let body = String::from_utf8_lossy(body);
    let Some(rest) = body.strip_prefix("633;").or_else(|| body.strip_prefix("133;")) else {
        return Sequence::Other;
    };
    let mut parts = rest.split(';');
    match parts.next() {
        Some("C") => Sequence::Marker(MarkerEvent::CommandStart),
        Some("D") => {
            let code = parts.next().and_then(|c| c.trim().parse::<i32>().ok());
            Sequence::Marker(MarkerEvent::CommandEnd(code))
        }
        _ => Sequence::Integration,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(text: &str) -> MarkerEvent {
        MarkerEvent::Output(text.as_bytes().to_vec())
    }

    #[test]
    fn recognizes_start_and_end_markers() {
        let mut parser = MarkerParser::new();
        let events = parser.feed(b"$ prompt\x1b]633;C\x07hello\n\x1b]633;D;3\x07");
        assert_eq!(
            events,
            vec![
                output("$ prompt"),
                MarkerEvent::CommandStart,
                output("hello\n"),
                MarkerEvent::CommandEnd(Some(3)),
            ]
        );
    }

    #[test]
    fn marker_split_across_chunks() {
        let mut parser = MarkerParser::new();
        let first = parser.feed(b"out\n\x1b]63");
        assert_eq!(first, vec![output("out\n")]);
        let second = parser.feed(b"3;D;0");
        assert!(second.is_empty());
        let third = parser.feed(b"\x07tail");
        assert_eq!(third, vec![MarkerEvent::CommandEnd(Some(0)), output("tail")]);
    }

    #[test]
    fn lone_escape_at_chunk_end_is_held() {
        let mut parser = MarkerParser::new();
        assert_eq!(parser.feed(b"x\x1b"), vec![output("x")]);
        assert_eq!(parser.feed(b"]133;C\x1b\\y"), vec![MarkerEvent::CommandStart, output("y")]);
    }

    #[test]
    fn other_sequences_pass_through() {
        let mut parser = MarkerParser::new();
        let events = parser.feed(b"\x1b[31mred\x1b]0;title\x07");
        assert_eq!(events, vec![output("\x1b[31mred\x1b]0;title\x07")]);
    }

    #[test]
    fn integration_bookkeeping_is_dropped() {
        let mut parser = MarkerParser::new();
        let events = parser.feed(b"\x1b]633;A\x07\x1b]633;P;Cwd=/tmp\x07ok");
        assert_eq!(events, vec![output("ok")]);
    }

    #[test]
    fn end_without_code() {
        let mut parser = MarkerParser::new();
        assert_eq!(parser.feed(b"\x1b]633;D\x07"), vec![MarkerEvent::CommandEnd(None)]);
    }

    #[test]
    fn unterminated_sequence_released_on_finish() {
        let mut parser = MarkerParser::new();
        assert!(parser.feed(b"\x1b]633;D;1").is_empty());
        assert_eq!(parser.finish(), Some(output("\x1b]633;D;1")));
        assert_eq!(parser.finish(), None);
    }
}
