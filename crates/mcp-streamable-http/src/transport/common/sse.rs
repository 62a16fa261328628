//! Server-Sent Events wire codec.
//!
//! Events are `field: value` lines terminated by a blank line. The decoder is
//! a line-buffering parser: TCP does not align chunks with event boundaries,
//! so partial lines are kept until the terminating `\n` arrives and partial
//! events until the blank line that ends them.

use bytes::Bytes;

/// One decoded (or to-be-encoded) SSE record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: Option<String>,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    /// A `message` event carrying a serialized JSON-RPC payload.
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: Some("message".to_string()),
            data: Some(data.into()),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// True for records the message pipeline should parse: either no event
    /// name or the default `message` name.
    pub fn is_message(&self) -> bool {
        match self.event.as_deref() {
            None | Some("") | Some("message") => true,
            _ => false,
        }
    }

    /// Encode as a wire frame: `event:`/`id:`/`retry:`/`data:` lines followed
    /// by the blank separator line. Multi-line data is split into one `data:`
    /// line per line, which the decoder rejoins.
    pub fn encode(&self) -> Bytes {
        let mut out = String::new();
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        if let Some(id) = &self.id {
            out.push_str("id: ");
            out.push_str(id);
            out.push('\n');
        }
        if let Some(retry) = self.retry {
            out.push_str(&format!("retry: {retry}\n"));
        }
        if let Some(data) = &self.data {
            for line in data.split('\n') {
                out.push_str("data: ");
                out.push_str(line);
                out.push('\n');
            }
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// Keep-alive comment frame; ignored by any conforming decoder.
pub const PING_FRAME: &[u8] = b": ping\n\n";

/// Incremental SSE decoder.
///
/// Feed raw byte chunks in; complete events come out. Bytes are buffered
/// until a full line is available, so chunk boundaries may fall anywhere,
/// including inside a multi-byte UTF-8 sequence. A trailing event that was
/// never terminated by a blank line is discarded when the stream ends.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    pending: SseEvent,
    pending_data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let rest = self.buffer.split_off(newline + 1);
            let mut line = std::mem::replace(&mut self.buffer, rest);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            // `\n` is a single byte and never occurs inside a multi-byte
            // UTF-8 sequence, so a complete line decodes cleanly even when
            // the chunks that delivered it split a character.
            let line = String::from_utf8_lossy(&line);
            if line.is_empty() {
                if let Some(event) = self.take_pending() {
                    events.push(event);
                }
            } else {
                self.parse_field(&line);
            }
        }
        events
    }

    fn take_pending(&mut self) -> Option<SseEvent> {
        let mut event = std::mem::take(&mut self.pending);
        let data_lines = std::mem::take(&mut self.pending_data);
        if !data_lines.is_empty() {
            event.data = Some(data_lines.join("\n"));
        }
        if event == SseEvent::default() {
            None
        } else {
            Some(event)
        }
    }

    fn parse_field(&mut self, line: &str) {
        // Comments start with a colon.
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            // A field name with no colon has an empty value.
            None => (line, ""),
        };
        match field {
            "data" => self.pending_data.push(value.to_string()),
            "event" => self.pending.event = Some(value.to_string()),
            "id" => self.pending.id = Some(value.to_string()),
            "retry" => {
                if let Ok(retry) = value.parse() {
                    self.pending.retry = Some(retry);
                }
            }
            // Unknown fields are ignored.
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_whole(input: &str) -> Vec<SseEvent> {
        SseDecoder::new().feed(input.as_bytes())
    }

    #[test]
    fn test_single_event() {
        let events = decode_whole("event: message\ndata: {\"jsonrpc\":\"2.0\"}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].data.as_deref(), Some("{\"jsonrpc\":\"2.0\"}"));
        assert!(events[0].is_message());
    }

    #[test]
    fn test_id_and_default_event() {
        let events = decode_whole("id: e42\ndata: {}\n\n");
        assert_eq!(events[0].id.as_deref(), Some("e42"));
        assert!(events[0].event.is_none());
        assert!(events[0].is_message());
    }

    #[test]
    fn test_comments_and_unknown_fields_ignored() {
        let events = decode_whole(": ping\n\nfoo: bar\ndata: 1\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.as_deref(), Some("1"));
    }

    #[test]
    fn test_value_without_leading_space() {
        let events = decode_whole("data:payload\n\n");
        assert_eq!(events[0].data.as_deref(), Some("payload"));
    }

    #[test]
    fn test_multiline_data_joined() {
        let events = decode_whole("data: a\ndata: b\n\n");
        assert_eq!(events[0].data.as_deref(), Some("a\nb"));
    }

    #[test]
    fn test_crlf_line_endings() {
        let events = decode_whole("event: message\r\ndata: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data.as_deref(), Some("x"));
    }

    #[test]
    fn test_incomplete_event_not_emitted() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: half").is_empty());
        assert!(decoder.feed(b"-done\n").is_empty());
        let events = decoder.feed(b"\n");
        assert_eq!(events[0].data.as_deref(), Some("half-done"));
    }

    /// Feeding the same stream in arbitrary chunk splits yields the same
    /// event sequence as feeding it whole. The third event carries
    /// multi-byte UTF-8, so 1-byte chunking splits characters mid-sequence.
    #[test]
    fn test_chunking_is_transparent() {
        let stream = "event: message\ndata: {\"a\":1}\n\nid: 7\ndata: two\ndata: lines\n\n: keep-alive\n\ndata: {\"name\":\"héllo wörld ⚙ ツ\"}\n\nevent: other\ndata: skipped\n\n";
        let whole = decode_whole(stream);
        assert_eq!(whole.len(), 4);
        assert_eq!(
            whole[2].data.as_deref(),
            Some("{\"name\":\"héllo wörld ⚙ ツ\"}")
        );

        for chunk_size in 1..=stream.len() {
            let mut decoder = SseDecoder::new();
            let mut events = Vec::new();
            for chunk in stream.as_bytes().chunks(chunk_size) {
                events.extend(decoder.feed(chunk));
            }
            assert_eq!(events, whole, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let event = SseEvent::message("{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}").with_id("e1");
        let frame = event.encode();
        let decoded = SseDecoder::new().feed(&frame);
        assert_eq!(decoded, vec![event]);
    }

    #[test]
    fn test_ping_frame_decodes_to_nothing() {
        assert!(SseDecoder::new().feed(PING_FRAME).is_empty());
    }
}
