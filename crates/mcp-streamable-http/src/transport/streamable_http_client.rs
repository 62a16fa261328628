//! Client end of the streamable HTTP transport.
//!
//! Messages go out as HTTP POSTs; what comes back is negotiated per request:
//! `202 Accepted` for fire-and-forget batches, a plain JSON body, or an SSE
//! stream that is decoded in a background task. The client learns its session
//! id from the first response that carries `Mcp-Session-Id` and attaches it
//! to everything afterwards.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use futures::StreamExt;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use tokio_util::sync::CancellationToken;

use super::{
    auth::{AuthorizationOutcome, AuthorizationProvider},
    common::{
        http_header::{
            ACCEPT_POST, EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_SESSION_ID,
            JSON_MIME_TYPE,
        },
        sse::{SseDecoder, SseEvent},
    },
    TransportHandler,
};
use crate::{
    error::TransportError,
    model::{JsonRpcBatch, JsonRpcMessage},
};

#[derive(Clone, Default)]
pub struct StreamableHttpClientTransportConfig {
    /// The server endpoint.
    pub uri: Arc<str>,
    /// Optional bearer-token/redirect provider. Without one, a `401` is an
    /// ordinary transport error.
    pub auth_provider: Option<Arc<dyn AuthorizationProvider>>,
    /// Caller-tuned HTTP client (timeouts, proxies, extra defaults). A stock
    /// client is built when absent.
    pub http_client: Option<reqwest::Client>,
}

impl StreamableHttpClientTransportConfig {
    pub fn with_uri(uri: impl Into<Arc<str>>) -> Self {
        Self {
            uri: uri.into(),
            ..Default::default()
        }
    }

    pub fn with_auth_provider(mut self, provider: Arc<dyn AuthorizationProvider>) -> Self {
        self.auth_provider = Some(provider);
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }
}

impl std::fmt::Debug for StreamableHttpClientTransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpClientTransportConfig")
            .field("uri", &self.uri)
            .field("auth_provider", &self.auth_provider.is_some())
            .finish()
    }
}

#[derive(Default)]
struct ClientState {
    /// Learned from the server's `Mcp-Session-Id` response header; attached
    /// to every request once known.
    session_id: Option<Arc<str>>,
    /// Last SSE `id:` observed on any stream, forwarded on reconnect.
    last_event_id: Option<String>,
}

/// Cheaply cloneable handle; clones share session identity, the stream
/// registry and the abort scope.
#[derive(Clone)]
pub struct StreamableHttpClientTransport {
    http: reqwest::Client,
    uri: Arc<str>,
    auth_provider: Option<Arc<dyn AuthorizationProvider>>,
    handler: Arc<dyn TransportHandler>,
    state: Arc<Mutex<ClientState>>,
    /// Live SSE readers by synthetic stream id, each with its cancel hook.
    streams: Arc<Mutex<HashMap<String, CancellationToken>>>,
    /// Abort scope for the whole session; cancelled on `close()`.
    abort: Arc<Mutex<Option<CancellationToken>>>,
}

impl StreamableHttpClientTransport {
    pub fn new(
        config: StreamableHttpClientTransportConfig,
        handler: Arc<dyn TransportHandler>,
    ) -> Self {
        Self {
            http: config.http_client.unwrap_or_default(),
            uri: config.uri,
            auth_provider: config.auth_provider,
            handler,
            state: Arc::new(Mutex::new(ClientState::default())),
            streams: Arc::new(Mutex::new(HashMap::new())),
            abort: Arc::new(Mutex::new(None)),
        }
    }

    /// Open the optional standalone SSE listener. A `405` means the server
    /// does not offer one, which is allowed.
    pub async fn start(&self) -> Result<(), TransportError> {
        if !self.streams.lock().unwrap().is_empty() {
            return Err(TransportError::AlreadyStarted);
        }
        *self.abort.lock().unwrap() = Some(CancellationToken::new());

        let mut retried = false;
        loop {
            let mut headers = self.common_headers().await;
            headers.insert(
                header::ACCEPT,
                HeaderValue::from_static(EVENT_STREAM_MIME_TYPE),
            );
            let last_event_id = self.state.lock().unwrap().last_event_id.clone();
            if let Some(last_event_id) = last_event_id {
                if let Ok(value) = HeaderValue::from_str(&last_event_id) {
                    headers.insert(HEADER_LAST_EVENT_ID, value);
                }
            }

            let response = self
                .http
                .get(self.uri.as_ref())
                .headers(headers)
                .send()
                .await?;
            let status = response.status();
            if status == StatusCode::METHOD_NOT_ALLOWED {
                tracing::debug!("server does not offer a standalone SSE stream");
                return Ok(());
            }
            if status == StatusCode::UNAUTHORIZED && self.auth_provider.is_some() {
                if retried {
                    return Err(TransportError::Unauthorized);
                }
                self.run_auth_flow(None).await?;
                retried = true;
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TransportError::UnexpectedStatus { status, body });
            }
            self.spawn_sse_reader(response, format!("initial-{}", timestamp_millis()));
            return Ok(());
        }
    }

    pub async fn send(&self, message: JsonRpcMessage) -> Result<(), TransportError> {
        self.send_batch(message).await
    }

    pub async fn send_batch(
        &self,
        batch: impl Into<JsonRpcBatch>,
    ) -> Result<(), TransportError> {
        let batch = batch.into();
        match self.post_batch(&batch).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.handler.on_error(&error);
                Err(error)
            }
        }
    }

    async fn post_batch(&self, batch: &JsonRpcBatch) -> Result<(), TransportError> {
        let mut retried = false;
        loop {
            let mut headers = self.common_headers().await;
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_MIME_TYPE));
            headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT_POST));

            let response = self
                .http
                .post(self.uri.as_ref())
                .headers(headers)
                .json(batch)
                .send()
                .await?;

            // Stateful sessions are learned here.
            if let Some(session_id) = response
                .headers()
                .get(HEADER_SESSION_ID)
                .and_then(|v| v.to_str().ok())
            {
                self.state.lock().unwrap().session_id = Some(session_id.into());
            }

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && self.auth_provider.is_some() {
                if retried {
                    return Err(TransportError::Unauthorized);
                }
                self.run_auth_flow(None).await?;
                retried = true;
                continue;
            }
            if status == StatusCode::ACCEPTED {
                return Ok(());
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(TransportError::UnexpectedStatus { status, body });
            }

            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            return match content_type.as_deref() {
                Some(ct) if ct.contains(EVENT_STREAM_MIME_TYPE) => {
                    self.spawn_sse_reader(response, request_stream_id(batch));
                    Ok(())
                }
                Some(ct) if ct.contains(JSON_MIME_TYPE) => {
                    let bytes = response.bytes().await?;
                    let inbound: JsonRpcBatch = serde_json::from_slice(&bytes)?;
                    for message in inbound.into_messages() {
                        self.handler.on_message(message);
                    }
                    Ok(())
                }
                // No content type: nothing to interpret, drop the body.
                None => Ok(()),
                Some(_) => Err(TransportError::UnexpectedContentType(content_type)),
            };
        }
    }

    /// Cancel every SSE reader, abort in-flight work and terminate the
    /// session with a best-effort DELETE. `on_close` fires regardless of the
    /// DELETE outcome.
    pub async fn close(&self) -> Result<(), TransportError> {
        let cancelled: Vec<CancellationToken> = self
            .streams
            .lock()
            .unwrap()
            .drain()
            .map(|(_, ct)| ct)
            .collect();
        for ct in cancelled {
            ct.cancel();
        }
        if let Some(ct) = self.abort.lock().unwrap().take() {
            ct.cancel();
        }

        let session_id = self.state.lock().unwrap().session_id.clone();
        if let Some(session_id) = session_id {
            match self.delete_session().await {
                Ok(()) => tracing::info!(%session_id, "session deleted"),
                Err(TransportError::UnexpectedStatus { status, .. })
                    if status == StatusCode::METHOD_NOT_ALLOWED =>
                {
                    tracing::info!(%session_id, "server does not support explicit session termination");
                }
                Err(error) => {
                    tracing::error!(%session_id, "failed to delete session: {error}");
                    self.handler.on_error(&error);
                }
            }
        }

        self.handler.on_close();
        Ok(())
    }

    /// Complete a pending redirect flow with the authorization code captured
    /// by the application.
    pub async fn finish_auth(&self, authorization_code: &str) -> Result<(), TransportError> {
        self.run_auth_flow(Some(authorization_code)).await
    }

    pub fn session_id(&self) -> Option<Arc<str>> {
        self.state.lock().unwrap().session_id.clone()
    }

    pub fn last_event_id(&self) -> Option<String> {
        self.state.lock().unwrap().last_event_id.clone()
    }

    async fn run_auth_flow(&self, authorization_code: Option<&str>) -> Result<(), TransportError> {
        let provider = self
            .auth_provider
            .as_ref()
            .ok_or(TransportError::Unauthorized)?;
        match provider
            .authorize(self.uri.as_ref(), authorization_code)
            .await
        {
            AuthorizationOutcome::Authorized => Ok(()),
            _ => Err(TransportError::Unauthorized),
        }
    }

    async fn delete_session(&self) -> Result<(), TransportError> {
        let headers = self.common_headers().await;
        let response = self
            .http
            .delete(self.uri.as_ref())
            .headers(headers)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::UnexpectedStatus { status, body })
    }

    async fn common_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(provider) = &self.auth_provider {
            if let Some(tokens) = provider.tokens().await {
                if let Ok(value) =
                    HeaderValue::from_str(&format!("Bearer {}", tokens.access_token))
                {
                    headers.insert(header::AUTHORIZATION, value);
                }
            }
        }
        let session_id = self.state.lock().unwrap().session_id.clone();
        if let Some(session_id) = session_id {
            if let Ok(value) = HeaderValue::from_str(&session_id) {
                headers.insert(HEADER_SESSION_ID, value);
            }
        }
        headers
    }

    fn spawn_sse_reader(&self, response: reqwest::Response, stream_id: String) {
        let ct = self
            .abort
            .lock()
            .unwrap()
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        self.streams
            .lock()
            .unwrap()
            .insert(stream_id.clone(), ct.clone());

        let transport = self.clone();
        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut body = response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    chunk = body.next() => chunk,
                    _ = ct.cancelled() => {
                        tracing::debug!(%stream_id, "sse stream cancelled");
                        break;
                    }
                };
                match chunk {
                    Some(Ok(bytes)) => {
                        for event in decoder.feed(&bytes) {
                            transport.handle_sse_event(event);
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(%stream_id, "sse stream error: {error}");
                        transport.handler.on_error(&TransportError::Client(error));
                        break;
                    }
                    None => {
                        tracing::debug!(%stream_id, "sse stream terminated");
                        break;
                    }
                }
            }
            transport.streams.lock().unwrap().remove(&stream_id);
        });
    }

    fn handle_sse_event(&self, event: SseEvent) {
        // Ids are session-global resumption tokens: track them regardless of
        // the event type, before the payload is acted on.
        if let Some(id) = &event.id {
            if !id.is_empty() {
                self.state.lock().unwrap().last_event_id = Some(id.clone());
            }
        }
        let Some(data) = &event.data else {
            return;
        };
        if data.is_empty() || !event.is_message() {
            return;
        }
        match serde_json::from_str::<JsonRpcMessage>(data) {
            Ok(message) => self.handler.on_message(message),
            Err(error) => {
                tracing::warn!("failed to deserialize server message: {error}");
                self.handler.on_error(&TransportError::Json(error));
            }
        }
    }
}

fn request_stream_id(batch: &JsonRpcBatch) -> String {
    let ids: Vec<String> = batch
        .messages()
        .iter()
        .filter_map(|message| match message {
            JsonRpcMessage::Request(request) => Some(request.id.to_string()),
            _ => None,
        })
        .collect();
    format!("req-{}-{}", ids.join(","), timestamp_millis())
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_stream_id_lists_request_ids() {
        let batch = JsonRpcBatch::from(vec![
            JsonRpcMessage::request(1, "ping", None),
            JsonRpcMessage::notification("notifications/progress", Some(json!({}))),
            JsonRpcMessage::request("b", "tools/call", None),
        ]);
        let stream_id = request_stream_id(&batch);
        assert!(stream_id.starts_with("req-1,b-"), "{stream_id}");
    }

    #[test]
    fn test_config_builder() {
        let config = StreamableHttpClientTransportConfig::with_uri("http://localhost:1234/mcp");
        assert_eq!(config.uri.as_ref(), "http://localhost:1234/mcp");
        assert!(config.auth_provider.is_none());
    }
}
