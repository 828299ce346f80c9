//! Concurrency limit for command handlers.
//!
//! A semaphore caps the number of handlers running at once. Under
//! [`OverflowPolicy::Queue`] a request waits for a permit until its deadline;
//! under [`OverflowPolicy::Reject`] it is answered with `StateInvalid` at once.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::ProtocolError;
use tokio::sync::Semaphore;
use tower::{Layer, Service, ServiceExt};

use crate::command::handler::Invocation;
use crate::config::OverflowPolicy;
use crate::wire::EXECUTION_TIMEOUT;

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
    policy: OverflowPolicy,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32, policy: OverflowPolicy) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
            policy,
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: Arc::clone(&self.semaphore),
            policy: self.policy,
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
    policy: OverflowPolicy,
}

impl<S, Req> Service<Invocation<Req>> for LoadShedService<S>
where
    S: Service<Invocation<Req>, Error = ProtocolError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = ProtocolError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, ProtocolError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation<Req>) -> Self::Future {
        match self.policy {
            OverflowPolicy::Reject => {
                let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                    return Box::pin(async { Err(overloaded()) });
                };
                let fut = self.inner.call(invocation);
                Box::pin(async move {
                    let result = fut.await;
                    drop(permit);
                    result
                })
            }
            OverflowPolicy::Queue => {
                // A ready clone is driven once the permit is held.
                let clone = self.inner.clone();
                let mut inner = std::mem::replace(&mut self.inner, clone);
                let semaphore = Arc::clone(&self.semaphore);
                Box::pin(async move {
                    let deadline = invocation.deadline;
                    let started = tokio::time::Instant::now();
                    let permit =
                        match tokio::time::timeout_at(deadline, semaphore.acquire_owned()).await {
                            Ok(Ok(permit)) => permit,
                            Ok(Err(_closed)) => return Err(overloaded()),
                            Err(_elapsed) => {
                                return Err(ProtocolError::timeout(
                                    EXECUTION_TIMEOUT,
                                    deadline.saturating_duration_since(started),
                                ))
                            }
                        };
                    let result = ServiceExt::<Invocation<Req>>::ready(&mut inner)
                        .await?
                        .call(invocation)
                        .await;
                    drop(permit);
                    result
                })
            }
        }
    }
}

fn overloaded() -> ProtocolError {
    ProtocolError::state_invalid(
        Some("max_concurrent_handlers".to_string()),
        "executor is at its handler concurrency limit",
    )
}
