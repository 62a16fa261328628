pub const HEADER_SESSION_ID: &str = "Mcp-Session-Id";
pub const HEADER_LAST_EVENT_ID: &str = "Last-Event-ID";

pub const JSON_MIME_TYPE: &str = "application/json";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";

/// Accept value the client sends on POST: it must be able to consume both
/// response shapes.
pub const ACCEPT_POST: &str = "application/json, text/event-stream";
