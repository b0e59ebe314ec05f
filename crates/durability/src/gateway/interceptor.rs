//! Interceptor chain in front of a gateway
//!
//! Each verb first asks the interceptor. The interceptor either lets the
//! call continue, possibly with rewritten arguments, or stops it with a
//! final value that is returned without touching the inner gateway. An
//! interceptor error short-circuits the same way.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::{Gateway, GatewayResult, Subscription};
use crate::envelope::Envelope;

/// Decision of an interceptor for one call.
#[derive(Debug)]
pub enum Interception<Op, Out> {
    /// Forward to the inner gateway with these arguments
    Continue(Op),
    /// Return this value without calling the inner gateway
    Stop(Out),
}

/// Hooks run before each gateway verb.
///
/// Every hook defaults to passing its arguments through unchanged.
#[async_trait]
pub trait GatewayInterceptor: Send + Sync {
    /// Before `build_url`.
    async fn build_url(
        &self,
        base: Url,
        key: String,
    ) -> GatewayResult<Interception<(Url, String), Url>> {
        Ok(Interception::Continue((base, key)))
    }

    /// Before `start`.
    async fn start(&self, url: Url) -> GatewayResult<Interception<Url, Url>> {
        Ok(Interception::Continue(url))
    }

    /// Before `close`.
    async fn close(&self, url: Url) -> GatewayResult<Interception<Url, ()>> {
        Ok(Interception::Continue(url))
    }

    /// Before `delete`.
    async fn delete(&self, url: Url) -> GatewayResult<Interception<Url, ()>> {
        Ok(Interception::Continue(url))
    }

    /// Before `destroy`.
    async fn destroy(&self, url: Url) -> GatewayResult<Interception<Url, ()>> {
        Ok(Interception::Continue(url))
    }

    /// Before `put`.
    async fn put(
        &self,
        url: Url,
        envelope: Envelope,
    ) -> GatewayResult<Interception<(Url, Envelope), ()>> {
        Ok(Interception::Continue((url, envelope)))
    }

    /// Before `get`.
    async fn get(&self, url: Url) -> GatewayResult<Interception<Url, Envelope>> {
        Ok(Interception::Continue(url))
    }

    /// Before `subscribe`.
    async fn subscribe(&self, url: Url) -> GatewayResult<Interception<Url, Subscription>> {
        Ok(Interception::Continue(url))
    }
}

/// Interceptor that forwards everything unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughInterceptor;

impl GatewayInterceptor for PassThroughInterceptor {}

/// A gateway wrapped by an interceptor.
#[derive(Clone)]
pub struct InterceptorGateway {
    inner: Arc<dyn Gateway>,
    interceptor: Arc<dyn GatewayInterceptor>,
}

impl InterceptorGateway {
    /// Wrap `inner` with `interceptor`.
    pub fn new(inner: Arc<dyn Gateway>, interceptor: Arc<dyn GatewayInterceptor>) -> Self {
        Self { inner, interceptor }
    }

    /// The wrapped gateway.
    pub fn inner(&self) -> &Arc<dyn Gateway> {
        &self.inner
    }
}

impl std::fmt::Debug for InterceptorGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptorGateway").finish_non_exhaustive()
    }
}

#[async_trait]
impl Gateway for InterceptorGateway {
    async fn build_url(&self, base: &Url, key: &str) -> GatewayResult<Url> {
        match self
            .interceptor
            .build_url(base.clone(), key.to_string())
            .await?
        {
            Interception::Continue((base, key)) => self.inner.build_url(&base, &key).await,
            Interception::Stop(url) => Ok(url),
        }
    }

    async fn start(&self, url: &Url) -> GatewayResult<Url> {
        match self.interceptor.start(url.clone()).await? {
            Interception::Continue(url) => self.inner.start(&url).await,
            Interception::Stop(url) => Ok(url),
        }
    }

    async fn close(&self, url: &Url) -> GatewayResult<()> {
        match self.interceptor.close(url.clone()).await? {
            Interception::Continue(url) => self.inner.close(&url).await,
            Interception::Stop(()) => Ok(()),
        }
    }

    async fn delete(&self, url: &Url) -> GatewayResult<()> {
        match self.interceptor.delete(url.clone()).await? {
            Interception::Continue(url) => self.inner.delete(&url).await,
            Interception::Stop(()) => Ok(()),
        }
    }

    async fn destroy(&self, url: &Url) -> GatewayResult<()> {
        match self.interceptor.destroy(url.clone()).await? {
            Interception::Continue(url) => self.inner.destroy(&url).await,
            Interception::Stop(()) => Ok(()),
        }
    }

    async fn put(&self, url: &Url, envelope: Envelope) -> GatewayResult<()> {
        match self.interceptor.put(url.clone(), envelope).await? {
            Interception::Continue((url, envelope)) => self.inner.put(&url, envelope).await,
            Interception::Stop(()) => {
                debug!(target: "ember::gateway", url = %url, "put answered by interceptor");
                Ok(())
            }
        }
    }

    async fn get(&self, url: &Url) -> GatewayResult<Envelope> {
        match self.interceptor.get(url.clone()).await? {
            Interception::Continue(url) => self.inner.get(&url).await,
            Interception::Stop(envelope) => Ok(envelope),
        }
    }

    async fn subscribe(&self, url: &Url) -> GatewayResult<Subscription> {
        match self.interceptor.subscribe(url.clone()).await? {
            Interception::Continue(url) => self.inner.subscribe(&url).await,
            Interception::Stop(sub) => Ok(sub),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayError, MemoryGateway};

    /// Fails every put; answers gets for `memory://db/fixed` itself.
    struct FaultInjector;

    #[async_trait]
    impl GatewayInterceptor for FaultInjector {
        async fn put(
            &self,
            url: Url,
            _envelope: Envelope,
        ) -> GatewayResult<Interception<(Url, Envelope), ()>> {
            Err(GatewayError::Rejected(format!("put {} refused", url)))
        }

        async fn get(&self, url: Url) -> GatewayResult<Interception<Url, Envelope>> {
            if url.path() == "/fixed" {
                return Ok(Interception::Stop(Envelope::File(b"canned".to_vec())));
            }
            Ok(Interception::Continue(url))
        }
    }

    #[tokio::test]
    async fn test_pass_through() {
        let memory = MemoryGateway::new();
        let gw = InterceptorGateway::new(Arc::new(memory.clone()), Arc::new(PassThroughInterceptor));
        let url = gw
            .build_url(&Url::parse("memory://db/car").unwrap(), "k")
            .await
            .unwrap();
        gw.put(&url, Envelope::Car(vec![3])).await.unwrap();
        assert_eq!(memory.get(&url).await.unwrap(), Envelope::Car(vec![3]));
        assert_eq!(gw.get(&url).await.unwrap(), Envelope::Car(vec![3]));
    }

    #[tokio::test]
    async fn test_error_short_circuits() {
        let memory = MemoryGateway::new();
        let gw = InterceptorGateway::new(Arc::new(memory.clone()), Arc::new(FaultInjector));
        let url = Url::parse("memory://db/car/k").unwrap();
        assert!(matches!(
            gw.put(&url, Envelope::Car(vec![1])).await,
            Err(GatewayError::Rejected(_))
        ));
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn test_stop_returns_value_without_inner() {
        let gw = InterceptorGateway::new(Arc::new(MemoryGateway::new()), Arc::new(FaultInjector));
        let fixed = Url::parse("memory://db/fixed").unwrap();
        assert_eq!(
            gw.get(&fixed).await.unwrap(),
            Envelope::File(b"canned".to_vec())
        );
        let other = Url::parse("memory://db/other").unwrap();
        assert!(gw.get(&other).await.unwrap_err().is_not_found());
    }
}
