/// Incremental decoder for `text/event-stream` bodies.
///
/// Bytes are pushed in whatever chunk sizes the connection delivers; complete
/// `data` payloads come out once their terminating blank line arrives. The
/// event envelope is self-describing JSON, so SSE `event:`/`id:`/`retry:`
/// fields and comment lines are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one body chunk and returns every data payload completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let mut line = &line[..line.len() - 1];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }

            if line.is_empty() {
                if let Some(payload) = self.take_payload() {
                    payloads.push(payload);
                }
                continue;
            }
            if line.first() == Some(&b':') {
                continue;
            }

            let line = String::from_utf8_lossy(line);
            if let Some(value) = line.strip_prefix("data:") {
                self.data_lines
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
        }
        payloads
    }

    /// Flushes a payload left unterminated when the body ends.
    pub fn finish(&mut self) -> Option<String> {
        self.take_payload()
    }

    fn take_payload(&mut self) -> Option<String> {
        if self.data_lines.is_empty() {
            return None;
        }
        let payload = self.data_lines.join("\n");
        self.data_lines.clear();
        Some(payload)
    }
}
