//! Hybrid interactive + structured output.
//!
//! Agents in hybrid mode interleave JSON event lines with free-form
//! terminal output on the same stream. A cheap `^{ … }$` test per complete
//! line decides which is which; lines failing the test are left to the
//! terminal viewer and never parsed further.

use serde_json::Value;

/// Test one complete line. No attempt is made to recover structure from
/// partially valid lines.
pub fn parse_json_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        serde_json::from_str(trimmed).ok()
    } else {
        None
    }
}

/// Accumulates raw stdout chunks and yields the JSON values found on
/// complete lines.
#[derive(Debug, Default)]
pub struct HybridLineBuffer {
    buffer: String,
}

impl HybridLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Value> {
        self.buffer.push_str(chunk);
        let mut out = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            if let Some(value) = parse_json_line(&line) {
                out.push(value);
            }
        }
        out
    }

    /// Drain the final partial line at end of stream.
    pub fn flush(&mut self) -> Option<Value> {
        let rest = std::mem::take(&mut self.buffer);
        parse_json_line(&rest)
    }
}
