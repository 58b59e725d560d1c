//! Incremental decoder for `text/event-stream` provider responses.
//!
//! Network reads hand the decoder arbitrary byte slices; it buffers until a
//! blank line completes an event and then yields the event name (if any)
//! and the joined `data:` payload. UTF-8 sequences split across reads are
//! handled by buffering raw bytes and only decoding whole events.

use std::collections::VecDeque;

/// One decoded SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    /// Value of the `event:` field, if present.
    pub event: Option<String>,
    /// Joined `data:` lines.
    pub data: String,
}

/// Buffering decoder. Feed bytes with [`SseDecoder::push`], drain complete
/// frames from the returned queue.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes and return every frame completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> VecDeque<SseFrame> {
        self.buffer.extend_from_slice(bytes);

        let mut frames = VecDeque::new();
        while let Some(boundary) = find_event_boundary(&self.buffer) {
            let record: Vec<u8> = self.buffer.drain(..boundary.end).collect();
            let record = &record[..boundary.start];
            if let Some(frame) = parse_record(record) {
                frames.push_back(frame);
            }
        }
        frames
    }
}

struct Boundary {
    /// End of the record content.
    start: usize,
    /// End of the separator; everything before this is consumed.
    end: usize,
}

/// Find the first blank-line separator (`\n\n` or `\r\n\r\n`).
fn find_event_boundary(buffer: &[u8]) -> Option<Boundary> {
    let mut i = 0;
    while i + 1 < buffer.len() {
        if buffer[i] == b'\n' && buffer[i + 1] == b'\n' {
            return Some(Boundary {
                start: i,
                end: i + 2,
            });
        }
        if i + 3 < buffer.len() && &buffer[i..i + 4] == b"\r\n\r\n" {
            return Some(Boundary {
                start: i,
                end: i + 4,
            });
        }
        i += 1;
    }
    None
}

fn parse_record(record: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(record);
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();

    for line in text.lines() {
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        }
        // Comment lines (leading ':') and unknown fields are ignored.
    }

    if event.is_none() && data_lines.is_empty() {
        return None;
    }

    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}
