/// Splits a byte stream into lines as chunks arrive. A partial line is held
/// until its terminator shows up or the stream ends.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
    max_pending_bytes: Option<usize>,
    dropped_bytes: usize,
}

impl LineBuffer {
    pub fn new(max_pending_bytes: Option<usize>) -> Self {
        Self {
            pending: String::new(),
            max_pending_bytes,
            dropped_bytes: 0,
        }
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);

        let mut lines = Vec::new();
        while let Some(idx) = self.pending.find(['\n', '\r']) {
            let line = self.pending[..idx].to_string();
            let crlf = self.pending[idx..].starts_with("\r\n");
            self.pending.drain(..idx + if crlf { 2 } else { 1 });
            lines.push(line);
        }

        if let Some(max) = self.max_pending_bytes {
            if self.pending.len() > max {
                let mut excess = self.pending.len() - max;
                while !self.pending.is_char_boundary(excess) {
                    excess += 1;
                }
                self.pending.drain(..excess);
                self.dropped_bytes = self.dropped_bytes.saturating_add(excess);
            }
        }
        lines
    }

    pub fn take_dropped_bytes(&mut self) -> usize {
        std::mem::take(&mut self.dropped_bytes)
    }

    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}
