//! Server end of the streamable HTTP transport.
//!
//! The transport is driven by a host HTTP framework: every inbound request is
//! handed to [`StreamableHttpServerTransport::handle_request`], which
//! enforces the session and header rules and dispatches parsed messages to
//! the [`TransportHandler`]. For POSTs that carry requests it opens an SSE
//! response and retains its sending half keyed by request id, so that later
//! [`send`](StreamableHttpServerTransport::send) calls route each reply to
//! the HTTP connection its request arrived on.

pub mod session;

use std::{
    borrow::Cow,
    collections::HashMap,
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use axum::{body::Body, extract::State, response::Response, routing::any, Router};
use bytes::Bytes;
use futures::StreamExt;
use http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use serde_json::Value;
use tokio::sync::mpsc::{self, Receiver, Sender};

use self::session::{SessionId, SessionIdGenerator, SessionState};
use super::{
    common::{
        http_header::{
            EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_SESSION_ID, JSON_MIME_TYPE,
        },
        sse::{SseEvent, PING_FRAME},
    },
    TransportHandler,
};
use crate::{
    error::TransportError,
    model::{
        ErrorCode, ErrorData, JsonRpcBatch, JsonRpcError, JsonRpcMessage, JsonRpcVersion2_0,
        RequestId,
    },
};

/// Upper bound on a POST body read from the wire.
pub const MAX_POST_BODY_BYTES: usize = 4 * 1024 * 1024;

const RESPONSE_CHANNEL_CAPACITY: usize = 16;

/// Configuration for the server transport.
#[derive(Clone)]
pub struct StreamableHttpServerConfig {
    /// Invoked once at initialize. `Some` selects stateful mode: the
    /// generated id is advertised via `Mcp-Session-Id` and required on every
    /// later request. `None` selects stateless mode.
    pub session_id_generator: Option<Arc<SessionIdGenerator>>,
    /// Interval for `: ping` comment frames on open SSE responses. `None`
    /// disables keep-alive.
    pub sse_keep_alive: Option<Duration>,
}

impl StreamableHttpServerConfig {
    pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);

    /// Stateful mode with uuid-v4 session ids.
    pub fn stateful() -> Self {
        Self {
            session_id_generator: Some(Arc::new(session::session_id)),
            sse_keep_alive: Some(Self::DEFAULT_KEEP_ALIVE),
        }
    }

    /// Stateless mode: no session ids are issued or checked.
    pub fn stateless() -> Self {
        Self {
            session_id_generator: None,
            sse_keep_alive: Some(Self::DEFAULT_KEEP_ALIVE),
        }
    }
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self::stateful()
    }
}

impl std::fmt::Debug for StreamableHttpServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpServerConfig")
            .field("stateful", &self.session_id_generator.is_some())
            .field("sse_keep_alive", &self.sse_keep_alive)
            .finish()
    }
}

/// The sending half of one open SSE response. A multi-request batch shares a
/// single connection: its ids hold clones of the same sender, and the
/// response ends once the last clone is dropped.
#[derive(Clone)]
struct ResponseSlot {
    conn_id: u64,
    tx: Sender<SseEvent>,
}

type ResponseMap = Arc<Mutex<HashMap<RequestId, ResponseSlot>>>;
type StandaloneSlot = Arc<Mutex<Option<ResponseSlot>>>;

/// Cheaply cloneable handle; clones share all session and routing state.
#[derive(Clone)]
pub struct StreamableHttpServerTransport {
    config: StreamableHttpServerConfig,
    handler: Arc<dyn TransportHandler>,
    started: Arc<AtomicBool>,
    state: Arc<Mutex<SessionState>>,
    /// Request id → open SSE response. Entries are inserted before the
    /// request is dispatched and removed when its response is sent, when the
    /// peer disconnects, or on `close()`.
    response_map: ResponseMap,
    /// The standalone GET stream, if one is open.
    standalone: StandaloneSlot,
    next_conn_id: Arc<AtomicU64>,
    event_counter: Arc<AtomicU64>,
}

impl StreamableHttpServerTransport {
    pub fn new(config: StreamableHttpServerConfig, handler: Arc<dyn TransportHandler>) -> Self {
        Self {
            config,
            handler,
            started: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(SessionState::Fresh)),
            response_map: Arc::new(Mutex::new(HashMap::new())),
            standalone: Arc::new(Mutex::new(None)),
            next_conn_id: Arc::new(AtomicU64::new(0)),
            event_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Mark the transport started. The transport does no network work of its
    /// own; requests arrive through [`handle_request`](Self::handle_request).
    pub fn start(&self) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }
        Ok(())
    }

    /// An axum router serving this transport at `/`.
    pub fn router(&self) -> Router {
        async fn dispatch(
            State(transport): State<StreamableHttpServerTransport>,
            request: Request<Body>,
        ) -> Response {
            transport.handle_request(request, None).await
        }
        Router::new()
            .route("/", any(dispatch))
            .with_state(self.clone())
    }

    /// Single entry point from the host framework. A pre-parsed body may be
    /// passed by trusted integrations that already consumed the request body.
    pub async fn handle_request(
        &self,
        request: Request<Body>,
        parsed_body: Option<JsonRpcBatch>,
    ) -> Response {
        let method = request.method().clone();
        if method == Method::POST {
            self.handle_post(request, parsed_body).await
        } else if method == Method::DELETE {
            self.handle_delete(request).await
        } else if method == Method::GET {
            self.handle_get(request).await
        } else {
            let mut response = jsonrpc_error_response(
                StatusCode::METHOD_NOT_ALLOWED,
                ErrorCode::BAD_REQUEST,
                "Method not allowed.",
                None,
            );
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, POST, DELETE"));
            response
        }
    }

    async fn handle_post(
        &self,
        request: Request<Body>,
        parsed_body: Option<JsonRpcBatch>,
    ) -> Response {
        let (parts, body) = request.into_parts();

        let accept = parts
            .headers
            .get(header::ACCEPT)
            .and_then(|h| h.to_str().ok());
        if !accept.is_some_and(|accept| {
            accept.contains(JSON_MIME_TYPE) && accept.contains(EVENT_STREAM_MIME_TYPE)
        }) {
            return jsonrpc_error_response(
                StatusCode::NOT_ACCEPTABLE,
                ErrorCode::BAD_REQUEST,
                "Not Acceptable: Client must accept both application/json and text/event-stream",
                None,
            );
        }

        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|h| h.to_str().ok());
        let Some(content_type) = content_type.filter(|ct| mime_essence(ct) == JSON_MIME_TYPE)
        else {
            return jsonrpc_error_response(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                ErrorCode::BAD_REQUEST,
                "Unsupported Media Type: Content-Type must be application/json",
                None,
            );
        };

        let batch = match parsed_body {
            Some(batch) => batch,
            None => match read_json_body(content_type, body).await {
                Ok(batch) => batch,
                Err(error) => {
                    let response = jsonrpc_error_response(
                        StatusCode::BAD_REQUEST,
                        ErrorCode::PARSE_ERROR,
                        "Parse error",
                        Some(Value::String(error.to_string())),
                    );
                    self.handler.on_error(&error);
                    return response;
                }
            },
        };

        tracing::debug!(messages = batch.len(), "inbound POST batch");

        if batch.contains_initialize() {
            if !self.state.lock().unwrap().is_fresh() {
                return jsonrpc_error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::INVALID_REQUEST,
                    "Invalid Request: Server already initialized",
                    None,
                );
            }
            if batch.len() > 1 {
                return jsonrpc_error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::INVALID_REQUEST,
                    "Invalid Request: Only one initialization request is allowed",
                    None,
                );
            }
            let session_id = self
                .config
                .session_id_generator
                .as_ref()
                .map(|generator| generator());
            if let Some(session_id) = &session_id {
                tracing::info!(%session_id, "session initialized");
            }
            *self.state.lock().unwrap() = SessionState::Initialized { session_id };
        } else if let Err(response) = self.validate_session(&parts.headers) {
            return response;
        }

        if batch.only_notifications_or_responses() {
            for message in batch.into_messages() {
                self.handler.on_message(message);
            }
            return empty_response(StatusCode::ACCEPTED);
        }

        // At least one request: open the SSE response and register every
        // request id on it before any message is dispatched, so synchronous
        // replies always find their route.
        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let slot = ResponseSlot { conn_id, tx };
        {
            let mut map = self.response_map.lock().unwrap();
            for message in batch.messages() {
                if let JsonRpcMessage::Request(request) = message {
                    map.insert(request.id.clone(), slot.clone());
                }
            }
        }
        drop(slot);

        for message in batch.into_messages() {
            self.handler.on_message(message);
        }

        let guard = StreamGuard::Requests {
            map: self.response_map.clone(),
            conn_id,
        };
        self.sse_response(rx, guard)
    }

    async fn handle_get(&self, request: Request<Body>) -> Response {
        let accept = request
            .headers()
            .get(header::ACCEPT)
            .and_then(|h| h.to_str().ok());
        if !accept.is_some_and(|accept| accept.contains(EVENT_STREAM_MIME_TYPE)) {
            return jsonrpc_error_response(
                StatusCode::NOT_ACCEPTABLE,
                ErrorCode::BAD_REQUEST,
                "Not Acceptable: Client must accept text/event-stream",
                None,
            );
        }

        if let Err(response) = self.validate_session(request.headers()) {
            return response;
        }

        // The last event id is forwarded to the application; the transport
        // itself keeps no replay buffer.
        if let Some(last_event_id) = request
            .headers()
            .get(HEADER_LAST_EVENT_ID)
            .and_then(|h| h.to_str().ok())
        {
            tracing::debug!(last_event_id, "standalone stream resume requested");
            self.handler.on_resume(last_event_id);
        }

        let (tx, rx) = mpsc::channel(RESPONSE_CHANNEL_CAPACITY);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut standalone = self.standalone.lock().unwrap();
            if standalone.as_ref().is_some_and(|slot| !slot.tx.is_closed()) {
                return jsonrpc_error_response(
                    StatusCode::CONFLICT,
                    ErrorCode::BAD_REQUEST,
                    "Conflict: Only one SSE stream is allowed per session",
                    None,
                );
            }
            *standalone = Some(ResponseSlot { conn_id, tx });
        }

        let guard = StreamGuard::Standalone {
            slot: self.standalone.clone(),
            conn_id,
        };
        self.sse_response(rx, guard)
    }

    async fn handle_delete(&self, request: Request<Body>) -> Response {
        if let Err(response) = self.validate_session(request.headers()) {
            return response;
        }
        tracing::info!("session terminated by DELETE");
        self.close();
        empty_response(StatusCode::OK)
    }

    /// Route an outbound message. Responses are routed by their own id; other
    /// messages go to the standalone stream, if open.
    pub async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.send_message(message, None).await
    }

    /// Route an outbound message onto the SSE response of the request it
    /// relates to (progress notifications, server-initiated requests).
    pub async fn send_related(
        &self,
        message: JsonRpcMessage,
        related_request_id: RequestId,
    ) -> Result<(), TransportError> {
        self.send_message(message, Some(related_request_id)).await
    }

    async fn send_message(
        &self,
        message: JsonRpcMessage,
        related_request_id: Option<RequestId>,
    ) -> Result<(), TransportError> {
        let is_response = message.is_response();
        let routing_id = if is_response {
            message.request_id().cloned()
        } else {
            related_request_id
        };
        let data = serde_json::to_string(&message)?;

        let Some(id) = routing_id else {
            return self.send_standalone(data).await;
        };

        let slot = self
            .response_map
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| TransportError::NoConnection(id.clone()))?;

        if slot.tx.send(SseEvent::message(data)).await.is_err() {
            // The peer disconnected under us; drop every route into the dead
            // connection in case the stream guard has not run yet.
            self.response_map
                .lock()
                .unwrap()
                .retain(|_, s| s.conn_id != slot.conn_id);
            return Err(TransportError::NoConnection(id));
        }

        if is_response {
            // The terminal message for this request. The response ends once
            // no other request still routes to the same connection.
            self.response_map.lock().unwrap().remove(&id);
        }
        Ok(())
    }

    async fn send_standalone(&self, data: String) -> Result<(), TransportError> {
        let slot = self.standalone.lock().unwrap().clone();
        let Some(slot) = slot else {
            return Err(TransportError::NoRequestId);
        };
        let event = SseEvent::message(data).with_id(self.next_event_id());
        if slot.tx.send(event).await.is_err() {
            let mut standalone = self.standalone.lock().unwrap();
            if standalone.as_ref().is_some_and(|s| s.conn_id == slot.conn_id) {
                standalone.take();
            }
            return Err(TransportError::NoRequestId);
        }
        Ok(())
    }

    /// End every open SSE response, clear the routing state and notify the
    /// handler. The session moves to its terminal state: later requests
    /// carrying the old session id are answered with 404.
    pub fn close(&self) {
        self.response_map.lock().unwrap().clear();
        self.standalone.lock().unwrap().take();
        *self.state.lock().unwrap() = SessionState::Closed;
        self.handler.on_close();
    }

    /// The session id assigned at initialize, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        self.state.lock().unwrap().session_id().cloned()
    }

    fn validate_session(&self, headers: &HeaderMap) -> Result<(), Response> {
        let expected = match &*self.state.lock().unwrap() {
            SessionState::Fresh => {
                return Err(jsonrpc_error_response(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::BAD_REQUEST,
                    "Bad Request: Server not initialized",
                    None,
                ));
            }
            SessionState::Closed => {
                return Err(jsonrpc_error_response(
                    StatusCode::NOT_FOUND,
                    ErrorCode::SESSION_NOT_FOUND,
                    "Session not found",
                    None,
                ));
            }
            // Stateless mode: nothing to compare.
            SessionState::Initialized { session_id: None } => return Ok(()),
            SessionState::Initialized {
                session_id: Some(session_id),
            } => session_id.clone(),
        };

        let mut values = headers.get_all(HEADER_SESSION_ID).iter();
        let value = values.next();
        if values.next().is_some() {
            return Err(jsonrpc_error_response(
                StatusCode::BAD_REQUEST,
                ErrorCode::BAD_REQUEST,
                "Mcp-Session-Id header must be a single value",
                None,
            ));
        }
        match value.and_then(|v| v.to_str().ok()) {
            None => Err(jsonrpc_error_response(
                StatusCode::BAD_REQUEST,
                ErrorCode::BAD_REQUEST,
                "Mcp-Session-Id header is required",
                None,
            )),
            Some(value) if value != expected.as_ref() => Err(jsonrpc_error_response(
                StatusCode::NOT_FOUND,
                ErrorCode::SESSION_NOT_FOUND,
                "Session not found",
                None,
            )),
            Some(_) => Ok(()),
        }
    }

    fn next_event_id(&self) -> String {
        (self.event_counter.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    fn sse_response(&self, mut rx: Receiver<SseEvent>, guard: StreamGuard) -> Response {
        let keep_alive = self.config.sse_keep_alive;
        let stream = async_stream::stream! {
            let _guard = guard;
            let mut keep_alive_timer = keep_alive.map(tokio::time::interval);
            loop {
                tokio::select! {
                    event = rx.recv() => {
                        match event {
                            Some(event) => yield Ok::<_, Infallible>(event.encode()),
                            None => break,
                        }
                    }
                    _ = async {
                        match keep_alive_timer.as_mut() {
                            Some(timer) => {
                                timer.tick().await;
                            }
                            None => {
                                std::future::pending::<()>().await;
                            }
                        }
                    } => {
                        yield Ok(Bytes::from_static(PING_FRAME));
                    }
                }
            }
        };

        let mut response = Response::new(Body::from_stream(stream));
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        if let Some(session_id) = self.state.lock().unwrap().session_id() {
            if let Ok(value) = HeaderValue::from_str(session_id) {
                headers.insert(HEADER_SESSION_ID, value);
            } else {
                tracing::error!(%session_id, "session id is not a valid header value");
            }
        }
        response
    }
}

/// Purges routing entries for one connection when its SSE body stream is
/// dropped, whether by completion or by peer disconnect.
enum StreamGuard {
    Requests { map: ResponseMap, conn_id: u64 },
    Standalone { slot: StandaloneSlot, conn_id: u64 },
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        match self {
            StreamGuard::Requests { map, conn_id } => {
                map.lock()
                    .unwrap()
                    .retain(|_, slot| slot.conn_id != *conn_id);
                tracing::debug!(conn_id = *conn_id, "request sse response closed");
            }
            StreamGuard::Standalone { slot, conn_id } => {
                let mut standalone = slot.lock().unwrap();
                if standalone.as_ref().is_some_and(|s| s.conn_id == *conn_id) {
                    standalone.take();
                }
                tracing::debug!(conn_id = *conn_id, "standalone sse response closed");
            }
        }
    }
}

async fn read_json_body(content_type: &str, body: Body) -> Result<JsonRpcBatch, TransportError> {
    if let Some(charset) = charset_param(content_type) {
        if !charset.eq_ignore_ascii_case("utf-8") && !charset.eq_ignore_ascii_case("us-ascii") {
            return Err(TransportError::UnsupportedCharset(charset.to_string()));
        }
    }

    let mut stream = body.into_data_stream();
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        if buf.len() + chunk.len() > MAX_POST_BODY_BYTES {
            return Err(TransportError::BodyTooLarge {
                limit: MAX_POST_BODY_BYTES,
            });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(serde_json::from_slice(&buf)?)
}

fn mime_essence(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or_default().trim()
}

fn charset_param(content_type: &str) -> Option<&str> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"'))
        } else {
            None
        }
    })
}

fn jsonrpc_error_response(
    status: StatusCode,
    code: ErrorCode,
    message: impl Into<Cow<'static, str>>,
    data: Option<Value>,
) -> Response {
    let envelope = JsonRpcError {
        jsonrpc: JsonRpcVersion2_0,
        id: None,
        error: ErrorData::new(code, message, data),
    };
    let body = serde_json::to_vec(&envelope).unwrap_or_default();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(JSON_MIME_TYPE),
    );
    response
}

fn empty_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_essence() {
        assert_eq!(mime_essence("application/json"), "application/json");
        assert_eq!(
            mime_essence("application/json; charset=utf-8"),
            "application/json"
        );
        assert_eq!(mime_essence("text/html;q=0.9"), "text/html");
    }

    #[test]
    fn test_charset_param() {
        assert_eq!(charset_param("application/json"), None);
        assert_eq!(
            charset_param("application/json; charset=utf-8"),
            Some("utf-8")
        );
        assert_eq!(
            charset_param("application/json; boundary=x; charset=\"UTF-8\""),
            Some("UTF-8")
        );
    }

    #[test]
    fn test_error_response_envelope() {
        let response = jsonrpc_error_response(
            StatusCode::BAD_REQUEST,
            ErrorCode::INVALID_REQUEST,
            "Invalid Request: Server already initialized",
            None,
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            JSON_MIME_TYPE
        );
    }
}
