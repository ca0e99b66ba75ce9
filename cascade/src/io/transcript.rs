//! Incremental reader for the assistant's `stream-json` output.
//!
//! Each stdout line is one JSON event. `assistant` events carry `text` and
//! `tool_use` content items; the closing `result` event repeats the final
//! answer. Lines that are not JSON objects are kept verbatim so plain-text
//! agents still produce parseable output. Only the last `limit` bytes of text
//! are kept; completion markers and verdicts come at the end.

use std::time::Instant;

use serde_json::Value;

use crate::core::types::ActionRecord;

#[derive(Debug)]
pub struct Transcript {
    text: String,
    limit: usize,
}

impl Transcript {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
        }
    }

    /// Consume one stdout line, returning the tool actions it reports.
    pub fn push_line(&mut self, line: &str, at: Instant) -> Vec<ActionRecord> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let event = match serde_json::from_str::<Value>(trimmed) {
            Ok(value @ Value::Object(_)) => value,
            _ => {
                self.append(line);
                return Vec::new();
            }
        };

        let mut actions = Vec::new();
        match event.get("type").and_then(Value::as_str) {
            Some("assistant") => {
                let content = event
                    .pointer("/message/content")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                for item in content {
                    match item.get("type").and_then(Value::as_str) {
                        Some("tool_use") => {
                            let tool = item
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown");
                            actions.push(ActionRecord::new(tool, at));
                        }
                        Some("text") => {
                            if let Some(text) = item.get("text").and_then(Value::as_str) {
                                self.append(text);
                            }
                        }
                        _ => {}
                    }
                }
            }
            Some("result") => {
                if let Some(result) = event.get("result").and_then(Value::as_str) {
                    self.append(result);
                }
            }
            _ => {}
        }
        actions
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    fn append(&mut self, chunk: &str) {
        if !self.text.is_empty() && !self.text.ends_with('\n') {
            self.text.push('\n');
        }
        self.text.push_str(chunk);
        if self.text.len() > self.limit {
            let mut cut = self.text.len() - self.limit;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
        }
    }
}
