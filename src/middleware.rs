//! Tower middleware that gates a service on the distributed bucket.
//!
//! Each request costs one token by default; supply a [`RequestCost`] to weigh requests
//! differently. A denied request never reaches the inner service and fails with
//! [`AdmissionError::Denied`]. A limiter failure (store down, initialization failed) fails
//! with [`AdmissionError::Infrastructure`] rather than letting traffic through.

use crate::error::AdmissionError;
use crate::limiter::DistributedRateLimiter;
use crate::store::BucketStore;
use crate::telemetry::TelemetrySink;
use futures::future::BoxFuture;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// Computes the token cost of a request.
pub trait RequestCost<Req>: Clone + Send + Sync + 'static {
    /// Tokens `req` consumes.
    fn cost(&self, req: &Req) -> f64;
}

/// Every request costs one token.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnitCost;

impl<Req> RequestCost<Req> for UnitCost {
    fn cost(&self, _req: &Req) -> f64 {
        1.0
    }
}

impl<Req, F> RequestCost<Req> for F
where
    F: Fn(&Req) -> f64 + Clone + Send + Sync + 'static,
{
    fn cost(&self, req: &Req) -> f64 {
        self(req)
    }
}

/// A layer that admits requests through a [`DistributedRateLimiter`].
#[derive(Clone, Debug)]
pub struct AdmissionLayer<St, T, C = UnitCost> {
    limiter: DistributedRateLimiter<St, T>,
    cost: C,
}

impl<St, T> AdmissionLayer<St, T, UnitCost> {
    /// Admit each request for one token.
    pub fn new(limiter: DistributedRateLimiter<St, T>) -> Self {
        Self { limiter, cost: UnitCost }
    }
}

impl<St, T, C> AdmissionLayer<St, T, C> {
    /// Charge requests according to `cost` instead.
    pub fn with_cost<C2>(self, cost: C2) -> AdmissionLayer<St, T, C2> {
        AdmissionLayer { limiter: self.limiter, cost }
    }
}

impl<S, St, T, C> Layer<S> for AdmissionLayer<St, T, C>
where
    C: Clone,
{
    type Service = AdmissionService<S, St, T, C>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            limiter: self.limiter.clone(),
            cost: self.cost.clone(),
        }
    }
}

/// Middleware service produced by [`AdmissionLayer`].
#[derive(Clone, Debug)]
pub struct AdmissionService<S, St, T, C = UnitCost> {
    inner: S,
    limiter: DistributedRateLimiter<St, T>,
    cost: C,
}

impl<S, St, T, C, Req> Service<Req> for AdmissionService<S, St, T, C>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    St: BucketStore + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
    C: RequestCost<Req>,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let requested = self.cost.cost(&req);
        // Take the instance that was driven ready; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match limiter.try_remove_tokens(requested).await {
                Ok(true) => inner.call(req).await.map_err(AdmissionError::Inner),
                Ok(false) => Err(AdmissionError::Denied { requested }),
                Err(e) => Err(AdmissionError::Infrastructure(e)),
            }
        })
    }
}
