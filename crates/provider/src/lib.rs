//! Provider executors for upstream chat APIs
//!
//! Defines the `Executor` trait that decouples the dispatch loop from each
//! provider's wire details. The generic `HttpExecutor` covers every
//! HTTP/JSON provider via per-provider URL, header, and body transforms;
//! `CursorExecutor` overrides the whole call path with the binary
//! ConnectRPC codec.
//!
//! Executors never touch the connection store: they receive a connection
//! snapshot, make the upstream call, and hand back either an event stream
//! or an error envelope for the dispatch loop to classify.

pub mod config;
pub mod cursor;
pub mod events;
pub mod http;
pub mod registry;
pub mod sse;
pub mod transform;

pub use config::{ProviderConfig, default_config};
pub use cursor::CursorExecutor;
pub use events::ChatEvent;
pub use http::HttpExecutor;
pub use registry::Registry;

use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use gateway_auth::{Connection, ProviderKind, RefreshedTokens};
use serde_json::Value;

/// Errors from executor operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection lacks a credential field the provider requires
    #[error("{0}")]
    MissingCredential(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request transform failed: {0}")]
    Transform(String),

    #[error("internal executor error: {0}")]
    Internal(String),
}

/// Result alias for executor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Normalised event stream handed to the response assemblers.
pub type EventStream = Pin<Box<dyn Stream<Item = ChatEvent> + Send>>;

/// Transformed request body, JSON for HTTP providers and raw frames for Cursor.
#[derive(Debug, Clone)]
pub enum RequestPayload {
    Json(Value),
    Bytes(Vec<u8>),
}

/// Inputs for one upstream call.
#[derive(Debug, Clone)]
pub struct ExecuteArgs {
    pub model: String,
    pub body: Value,
    pub stream: bool,
    pub connection: Connection,
}

/// Result of one upstream call.
pub enum Outcome {
    /// HTTP-level success; consume the events to build the response
    Stream(EventStream),
    /// Upstream rejected the request; the dispatch loop classifies this
    Error { status: u16, body: String },
}

/// Abstraction over per-provider upstream call strategies.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Executor>` in the registry cache).
pub trait Executor: Send + Sync {
    /// Provider tag this executor serves.
    fn kind(&self) -> ProviderKind;

    /// Upstream URL for the given base-URL index.
    fn build_url(&self, model: &str, stream: bool, url_index: usize, conn: &Connection) -> String;

    /// Request headers from the connection's credentials.
    fn build_headers(&self, conn: &Connection, stream: bool) -> Result<reqwest::header::HeaderMap>;

    /// Translate the OpenAI-shaped body into the provider's native shape.
    fn transform_request(
        &self,
        model: &str,
        body: &Value,
        stream: bool,
        conn: &Connection,
    ) -> Result<RequestPayload>;

    /// Make the upstream call, iterating fallback base URLs.
    fn execute<'a>(
        &'a self,
        args: &'a ExecuteArgs,
    ) -> Pin<Box<dyn Future<Output = Result<Outcome>> + Send + 'a>>;

    /// Refresh the connection's tokens (None when the provider has no flow).
    fn refresh_credentials<'a>(
        &'a self,
        client: &'a reqwest::Client,
        conn: &'a Connection,
    ) -> Pin<Box<dyn Future<Output = gateway_auth::Result<Option<RefreshedTokens>>> + Send + 'a>>;
}
