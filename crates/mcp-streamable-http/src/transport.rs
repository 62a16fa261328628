//! Transport implementations for MCP over streamable HTTP.
//!
//! Both ends deliver inbound traffic to a [`TransportHandler`] supplied at
//! construction; the higher protocol layer implements it and calls back into
//! the transport (`send`, `close`) to produce outbound traffic.

pub mod auth;
pub mod common;
pub mod streamable_http_client;
pub mod streamable_http_server;

use std::sync::Arc;

pub use streamable_http_client::{
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
};
pub use streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpServerTransport,
};

use crate::{error::TransportError, model::JsonRpcMessage};

/// The consumer interface of a transport.
///
/// Inbound messages arrive through [`on_message`](Self::on_message) in the
/// order they appeared in the received batch or stream. Handlers are called
/// inline from transport tasks and must not block.
pub trait TransportHandler: Send + Sync + 'static {
    fn on_message(&self, message: JsonRpcMessage);

    fn on_error(&self, error: &TransportError);

    /// Invoked exactly once when the transport closes, including close paths
    /// that also reported errors.
    fn on_close(&self);

    /// A client reopened the standalone stream with a `Last-Event-ID`. The
    /// transport does not buffer events; replay is up to the application.
    fn on_resume(&self, last_event_id: &str) {
        let _ = last_event_id;
    }
}

impl<T: TransportHandler + ?Sized> TransportHandler for Arc<T> {
    fn on_message(&self, message: JsonRpcMessage) {
        (**self).on_message(message)
    }

    fn on_error(&self, error: &TransportError) {
        (**self).on_error(error)
    }

    fn on_close(&self) {
        (**self).on_close()
    }

    fn on_resume(&self, last_event_id: &str) {
        (**self).on_resume(last_event_id)
    }
}
