//! Gateways: the storage/network boundary
//!
//! A gateway stores envelopes under URLs. Concrete backends (memory, file)
//! implement [`Gateway`]; [`InterceptorGateway`] wraps any gateway with a
//! [`GatewayInterceptor`] that may rewrite or answer each call.
//!
//! URL conventions:
//! - `build_url(base, key)` appends `key` as the last path segment
//! - the query is not part of the storage key; `?store=data|meta|wal`
//!   restricts which envelope types `get` accepts

mod file;
mod interceptor;
mod memory;
mod uri;

pub use file::FileGateway;
pub use interceptor::{GatewayInterceptor, Interception, InterceptorGateway, PassThroughInterceptor};
pub use memory::MemoryGateway;
pub use uri::{UriInterceptor, UriMapper};

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::envelope::{Envelope, EnvelopeError, EnvelopeType};

/// Gateway errors.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Nothing stored under the URL
    #[error("Not found: {0}")]
    NotFound(String),

    /// URL cannot be used by this gateway
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Verb not supported by this gateway
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Backend I/O failure
    #[error("Gateway I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored bytes are not a valid envelope
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// An interceptor refused the call
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// True for [`GatewayError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound(_))
    }
}

impl From<GatewayError> for ember_core::Error {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Io(io) => ember_core::Error::IoError(io),
            other => ember_core::Error::GatewayError(other.to_string()),
        }
    }
}

/// Result type alias for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Storage backend contract.
///
/// Every verb returns a result; no verb panics.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// URL for `key` under `base`.
    async fn build_url(&self, base: &Url, key: &str) -> GatewayResult<Url> {
        join_key(base, key)
    }

    /// Prepare the backend for `url`; returns the URL to use from now on.
    async fn start(&self, url: &Url) -> GatewayResult<Url>;

    /// Release resources held for `url`.
    async fn close(&self, url: &Url) -> GatewayResult<()>;

    /// Remove the value stored under `url`.
    async fn delete(&self, url: &Url) -> GatewayResult<()>;

    /// Remove everything stored under `url` and below it.
    async fn destroy(&self, url: &Url) -> GatewayResult<()>;

    /// Store an envelope.
    async fn put(&self, url: &Url, envelope: Envelope) -> GatewayResult<()>;

    /// Load an envelope.
    async fn get(&self, url: &Url) -> GatewayResult<Envelope>;

    /// Stream every meta envelope put under `url` from now on.
    async fn subscribe(&self, url: &Url) -> GatewayResult<Subscription>;
}

/// Append `key` as the last path segment of `base`.
pub fn join_key(base: &Url, key: &str) -> GatewayResult<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| GatewayError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .push(key);
    Ok(url)
}

/// Storage key for `url`: the URL without query or fragment.
pub fn storage_key(url: &Url) -> String {
    let mut key = url.clone();
    key.set_query(None);
    key.set_fragment(None);
    key.to_string()
}

/// Envelope types accepted for `url` according to its `store` parameter.
///
/// An empty result accepts every type.
pub fn accepted_types(url: &Url) -> Vec<EnvelopeType> {
    match url
        .query_pairs()
        .find(|(k, _)| k == "store")
        .map(|(_, v)| v.into_owned())
        .as_deref()
    {
        Some("data") => vec![EnvelopeType::Car, EnvelopeType::File],
        Some("meta") => vec![EnvelopeType::Meta],
        Some("wal") => vec![EnvelopeType::Wal],
        _ => Vec::new(),
    }
}

/// Cancellable stream of meta envelopes.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Envelope>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Subscription over `rx`; `cancel` runs once on unsubscribe.
    pub fn new(
        rx: mpsc::UnboundedReceiver<Envelope>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Next envelope; `None` once the gateway side is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Next envelope if one is already queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving.
    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}
