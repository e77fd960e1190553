//! Incremental Server-Sent Events framing over a chunked HTTP body.

use thiserror::Error;

/// One dispatched SSE event. Multiple `data:` lines are joined with `\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

impl SseFrame {
    /// Parses one blank-line-delimited block. Blocks without `data:` lines
    /// (comments, keep-alives) produce nothing.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut event = None;
        let mut id = None;
        let mut data_lines: Vec<&str> = Vec::new();

        for line in raw.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "data" => data_lines.push(value),
                "event" => event = Some(value.to_string()),
                "id" => id = Some(value.to_string()),
                _ => {}
            }
        }

        if data_lines.is_empty() {
            return None;
        }
        Some(Self {
            event: event.filter(|name| !name.is_empty()),
            data: data_lines.join("\n"),
            id,
        })
    }
}

/// Largest block the decoder buffers while waiting for its blank line.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("SSE frame exceeds {limit} bytes")]
pub struct FrameTooLarge {
    pub limit: usize,
}

#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    scanned: usize,
    limit: usize,
    discarding: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            limit,
            discarding: false,
        }
    }

    /// Returns every block completed by `bytes`. An oversized block is
    /// reported once and skipped up to its terminating blank line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<SseFrame, FrameTooLarge>> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        loop {
            // a terminator may straddle the previous push
            let start = self.scanned.saturating_sub(1);
            let found = self.buffer[start..]
                .windows(2)
                .position(|window| window == b"\n\n")
                .map(|offset| start + offset);

            let Some(end) = found else {
                self.scanned = self.buffer.len();
                if self.buffer.len() > self.limit {
                    if !self.discarding {
                        frames.push(Err(FrameTooLarge { limit: self.limit }));
                        self.discarding = true;
                    }
                    let tail = self.buffer.split_off(self.buffer.len() - 1);
                    self.buffer = tail;
                    self.scanned = self.buffer.len();
                }
                return frames;
            };

            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            self.scanned = 0;
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            if end > self.limit {
                frames.push(Err(FrameTooLarge { limit: self.limit }));
                continue;
            }
            if let Some(frame) = SseFrame::parse(&String::from_utf8_lossy(&block[..end])) {
                frames.push(Ok(frame));
            }
        }
    }

    /// Flushes a trailing block left without its terminating blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        SseFrame::parse(&String::from_utf8_lossy(&rest))
    }
}
