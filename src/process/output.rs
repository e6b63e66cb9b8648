/// Accumulated output of one command with a retrieval checkpoint.
///
/// Bytes are decoded as UTF-8 incrementally: an incomplete multi-byte
/// sequence at the end of a chunk is held back until the next chunk, invalid
/// bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct OutputStream {
    full: String,
    last_retrieved: usize,
    pending: Vec<u8>,
}

impl OutputStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: &[u8]) {
        if self.pending.is_empty() {
            self.decode(chunk);
        } else {
            let mut joined = std::mem::take(&mut self.pending);
            joined.extend_from_slice(chunk);
            self.decode(&joined);
        }
    }

    fn decode(&mut self, mut bytes: &[u8]) {
        loop {
            match std::str::from_utf8(bytes) {
                Ok(valid) => {
                    self.full.push_str(valid);
                    return;
                }
                Err(e) => {
                    let (valid, rest) = bytes.split_at(e.valid_up_to());
                    // from_utf8 already validated this prefix
                    self.full.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            self.full.push(char::REPLACEMENT_CHARACTER);
                            bytes = &rest[bad..];
                        }
                        None => {
                            self.pending.extend_from_slice(rest);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn flush_pending(&mut self) {
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            self.full.push_str(&String::from_utf8_lossy(&pending));
        }
    }

    /// Best-effort flush of an incomplete trailing sequence once the producer ended.
    pub fn finish(&mut self) {
        self.flush_pending();
    }

    pub fn full_output(&self) -> &str {
        &self.full
    }

    pub fn len(&self) -> usize {
        self.full.len()
    }

    pub fn is_empty(&self) -> bool {
        self.full.is_empty()
    }

    pub fn last_retrieved_index(&self) -> usize {
        self.last_retrieved
    }

    pub fn has_unretrieved(&self) -> bool {
        self.last_retrieved < self.full.len()
    }

    /// Returns output since the checkpoint up to and including the last
    /// newline. A trailing partial line stays unretrieved.
    pub fn drain(&mut self) -> String {
        let unretrieved = &self.full[self.last_retrieved..];
        match unretrieved.rfind('\n') {
            Some(idx) => {
                let end = self.last_retrieved + idx + 1;
                let drained = self.full[self.last_retrieved..end].to_string();
                self.last_retrieved = end;
                drained
            }
            None => String::new(),
        }
    }

    /// Returns everything since the checkpoint, partial line included.
    pub fn drain_all(&mut self) -> String {
        self.flush_pending();
        let drained = self.full[self.last_retrieved..].to_string();
        self.last_retrieved = self.full.len();
        drained
    }
}
