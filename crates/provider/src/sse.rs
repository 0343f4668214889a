//! Incremental SSE decoding for provider byte streams.

use claudish_core::error::ProxyError;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    pub fn is_done_sentinel(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Push parser for the SSE wire format: feed raw bytes as they arrive,
/// drain decoded events.
///
/// Input is split on line boundaries before UTF-8 decoding, so a
/// multi-byte character cut across two network chunks never corrupts
/// the stream. Field lines accumulate into the current event; a blank
/// line dispatches it.
#[derive(Debug, Default)]
pub struct SseParser {
    pending_line: Vec<u8>,
    event_type: Option<String>,
    data_lines: Vec<String>,
    ready: VecDeque<SseEvent>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Result<(), ProxyError> {
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.pending_line.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];

            let raw = std::mem::take(&mut self.pending_line);
            let line = std::str::from_utf8(&raw).map_err(|e| {
                ProxyError::Translation(format!("invalid UTF-8 in SSE stream: {e}"))
            })?;
            self.accept_line(line.trim_end_matches('\r'));
        }
        self.pending_line.extend_from_slice(rest);
        Ok(())
    }

    pub fn next_event(&mut self) -> Option<SseEvent> {
        self.ready.pop_front()
    }

    /// Dispatch a final event terminated by end-of-stream instead of a
    /// blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.pending_line.is_empty()
            && let Ok(raw) = String::from_utf8(std::mem::take(&mut self.pending_line))
        {
            self.accept_line(raw.trim_end_matches('\r'));
        }
        self.dispatch();
        self.ready.pop_front()
    }

    fn accept_line(&mut self, line: &str) {
        if line.is_empty() {
            self.dispatch();
            return;
        }
        // Comment lines double as keep-alives; drop them.
        if line.starts_with(':') {
            return;
        }
        // A line without a colon is a field with an empty value. At most
        // one leading space of the value is part of the separator.
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event_type = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            // id, retry, and unknown fields are irrelevant here.
            _ => {}
        }
    }

    fn dispatch(&mut self) {
        if self.data_lines.is_empty() {
            self.event_type = None;
            return;
        }
        self.ready.push_back(SseEvent {
            event: self.event_type.take(),
            data: std::mem::take(&mut self.data_lines).join("\n"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(parser: &mut SseParser) -> Vec<SseEvent> {
        let mut events = Vec::new();
        while let Some(event) = parser.next_event() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_data_only_event() {
        let mut parser = SseParser::new();
        parser.feed(b"data: {\"hello\": \"world\"}\n\n").unwrap();
        let events = drain(&mut parser);
        assert_eq!(events.len(), 1);
        assert!(events[0].event.is_none());
        assert_eq!(events[0].data, "{\"hello\": \"world\"}");
    }

    #[test]
    fn test_typed_event_and_crlf() {
        let mut parser = SseParser::new();
        parser
            .feed(b"event: message_start\r\ndata: {\"type\": \"message_start\"}\r\n\r\n")
            .unwrap();
        let events = drain(&mut parser);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"type\": \"message_start\"}");
    }

    #[test]
    fn test_event_type_does_not_leak() {
        let mut parser = SseParser::new();
        parser
            .feed(b"event: ping\ndata: a\n\ndata: b\n\n")
            .unwrap();
        let events = drain(&mut parser);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
        assert!(events[1].event.is_none());
    }

    #[test]
    fn test_multiline_data_joined() {
        let mut parser = SseParser::new();
        parser.feed(b"data: line1\ndata: line2\n\n").unwrap();
        assert_eq!(drain(&mut parser)[0].data, "line1\nline2");
    }

    #[test]
    fn test_comments_and_blank_blocks_ignored() {
        let mut parser = SseParser::new();
        parser.feed(b": keep-alive\n\nid: 7\nretry: 100\n\n").unwrap();
        assert!(drain(&mut parser).is_empty());
    }

    #[test]
    fn test_done_sentinel() {
        let mut parser = SseParser::new();
        parser.feed(b"data: [DONE]\n\n").unwrap();
        assert!(drain(&mut parser)[0].is_done_sentinel());
    }

    #[test]
    fn test_only_one_separator_space_stripped() {
        let mut parser = SseParser::new();
        parser.feed(b"data:  padded\n\n").unwrap();
        assert_eq!(drain(&mut parser)[0].data, " padded");
    }

    #[test]
    fn test_chunk_split_inside_multibyte_char() {
        // "é" is 0xC3 0xA9; split between the two bytes.
        let mut parser = SseParser::new();
        parser.feed(b"data: caf\xc3").unwrap();
        parser.feed(b"\xa9\n\n").unwrap();
        assert_eq!(drain(&mut parser)[0].data, "café");
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        parser.feed(b"data: tail").unwrap();
        assert!(parser.next_event().is_none());
        let last = parser.finish().unwrap();
        assert_eq!(last.data, "tail");
        assert!(parser.finish().is_none());
    }
}
