//! Incremental Server-Sent Events parser.
//!
//! Feeds on raw body chunks (which can split frames at any byte) and emits
//! complete frames. Comment lines — the server's keep-alives — are dropped
//! here so the controller never sees them.

/// One complete SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

#[derive(Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk and return every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut frames = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.flush() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                // id and retry are irrelevant to this consumer
                _ => {}
            }
        }
        frames
    }

    fn flush(&mut self) -> Option<SseFrame> {
        let event = self.event.take().unwrap_or_else(|| "message".to_string());
        if self.data.is_empty() {
            return None;
        }
        let data = self.data.drain(..).collect::<Vec<_>>().join("\n");
        Some(SseFrame { event, data })
    }
}
