//! URL-rewriting interceptor
//!
//! Mappers run on the URL of every verb in registration order. The first
//! mapper error stops the chain and fails the call.

use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use super::interceptor::{GatewayInterceptor, Interception};
use super::{GatewayResult, Subscription};
use crate::envelope::Envelope;

/// One URL rewrite step.
pub type UriMapper = Arc<dyn Fn(Url) -> GatewayResult<Url> + Send + Sync>;

/// Interceptor applying an ordered list of URL mappers.
#[derive(Clone, Default)]
pub struct UriInterceptor {
    mappers: Vec<UriMapper>,
}

impl UriInterceptor {
    /// Interceptor with no mappers
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mapper.
    pub fn add_mapper<F>(&mut self, mapper: F) -> &mut Self
    where
        F: Fn(Url) -> GatewayResult<Url> + Send + Sync + 'static,
    {
        self.mappers.push(Arc::new(mapper));
        self
    }

    /// Builder form of [`UriInterceptor::add_mapper`].
    pub fn with_mapper<F>(mut self, mapper: F) -> Self
    where
        F: Fn(Url) -> GatewayResult<Url> + Send + Sync + 'static,
    {
        self.add_mapper(mapper);
        self
    }

    /// Number of registered mappers.
    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    /// True if no mapper is registered.
    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }

    /// Run every mapper over `url`.
    pub fn map(&self, url: Url) -> GatewayResult<Url> {
        self.mappers.iter().try_fold(url, |url, mapper| mapper(url))
    }
}

impl std::fmt::Debug for UriInterceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UriInterceptor")
            .field("mappers", &self.mappers.len())
            .finish()
    }
}

#[async_trait]
impl GatewayInterceptor for UriInterceptor {
    async fn build_url(
        &self,
        base: Url,
        key: String,
    ) -> GatewayResult<Interception<(Url, String), Url>> {
        Ok(Interception::Continue((self.map(base)?, key)))
    }

    async fn start(&self, url: Url) -> GatewayResult<Interception<Url, Url>> {
        Ok(Interception::Continue(self.map(url)?))
    }

    async fn close(&self, url: Url) -> GatewayResult<Interception<Url, ()>> {
        Ok(Interception::Continue(self.map(url)?))
    }

    async fn delete(&self, url: Url) -> GatewayResult<Interception<Url, ()>> {
        Ok(Interception::Continue(self.map(url)?))
    }

    async fn destroy(&self, url: Url) -> GatewayResult<Interception<Url, ()>> {
        Ok(Interception::Continue(self.map(url)?))
    }

    async fn put(
        &self,
        url: Url,
        envelope: Envelope,
    ) -> GatewayResult<Interception<(Url, Envelope), ()>> {
        Ok(Interception::Continue((self.map(url)?, envelope)))
    }

    async fn get(&self, url: Url) -> GatewayResult<Interception<Url, Envelope>> {
        Ok(Interception::Continue(self.map(url)?))
    }

    async fn subscribe(&self, url: Url) -> GatewayResult<Interception<Url, Subscription>> {
        Ok(Interception::Continue(self.map(url)?))
    }
}
