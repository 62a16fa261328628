//! Streamable HTTP transport for the Model Context Protocol.
//!
//! Bidirectional JSON-RPC 2.0 over plain HTTP: clients POST messages, servers
//! answer over per-request Server-Sent-Events streams, and an optional
//! standalone GET stream carries server-initiated traffic. Session identity
//! travels in the `Mcp-Session-Id` header.
//!
//! The two halves mirror each other:
//!
//! * [`StreamableHttpServerTransport`] plugs into a host HTTP framework as a
//!   request handler and multiplexes replies back onto the right connection.
//! * [`StreamableHttpClientTransport`] issues the POSTs, interprets
//!   `202`/JSON/SSE responses and manages session identity and authorization.
//!
//! Both deliver inbound traffic to a [`TransportHandler`] supplied at
//! construction.

mod error;
pub use error::TransportError;

pub mod model;
pub mod transport;

pub use transport::{
    auth::{AuthorizationOutcome, AuthorizationProvider, OAuthTokens},
    StreamableHttpClientTransport, StreamableHttpClientTransportConfig,
    StreamableHttpServerConfig, StreamableHttpServerTransport, TransportHandler,
};
