//! The innermost service of the execution pipeline: the user's handler.
//!
//! The handler runs on its own task, bounded by the request deadline inside
//! that task. A call resolves only once the handler future has finished or
//! been dropped, so the concurrency permit and in-flight guard held by the
//! outer layers always outlive the handler.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use courier_core::ProtocolError;
use futures_util::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower::Service;
use uuid::Uuid;

use super::request::{ApplicationError, CommandRequest, CommandResponse};
use crate::wire::EXECUTION_TIMEOUT;

/// One request travelling through the execution pipeline.
#[derive(Debug)]
pub struct Invocation<Req> {
    pub command_name: Arc<str>,
    pub correlation_id: Uuid,
    /// Point at which the request expires and the invoker stops waiting.
    pub deadline: Instant,
    pub request: CommandRequest<Req>,
}

/// Type-erased command handler.
pub type Handler<Req, Resp> = Arc<
    dyn Fn(CommandRequest<Req>) -> BoxFuture<'static, Result<CommandResponse<Resp>, ApplicationError>>
        + Send
        + Sync,
>;

/// Boxes a handler closure.
pub fn handler_fn<Req, Resp, F, Fut>(f: F) -> Handler<Req, Resp>
where
    F: Fn(CommandRequest<Req>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CommandResponse<Resp>, ApplicationError>> + Send + 'static,
{
    Arc::new(
        move |request: CommandRequest<Req>| -> BoxFuture<
            'static,
            Result<CommandResponse<Resp>, ApplicationError>,
        > { Box::pin(f(request)) },
    )
}

/// Aborts the handler task if the call is abandoned before it finishes.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs the handler on its own task so a panic is contained and reported,
/// and stops it at the request deadline with `Timeout` (status 408).
pub struct HandlerService<Req, Resp> {
    handler: Handler<Req, Resp>,
}

impl<Req, Resp> HandlerService<Req, Resp> {
    #[must_use]
    pub fn new(handler: Handler<Req, Resp>) -> Self {
        Self { handler }
    }
}

impl<Req, Resp> Clone for HandlerService<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<Req, Resp> Service<Invocation<Req>> for HandlerService<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Response = CommandResponse<Resp>;
    type Error = ProtocolError;
    type Future = Pin<Box<dyn Future<Output = Result<CommandResponse<Resp>, ProtocolError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation<Req>) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        let deadline = invocation.deadline;
        let budget = deadline.saturating_duration_since(Instant::now());
        let request = invocation.request;
        let mut task = AbortOnDrop(tokio::spawn(async move {
            tokio::time::timeout_at(deadline, handler(request)).await
        }));
        Box::pin(async move {
            match (&mut task.0).await {
                Ok(Ok(Ok(response))) => Ok(response),
                Ok(Ok(Err(app_err))) => Err(app_err.into()),
                Ok(Err(_elapsed)) => Err(ProtocolError::timeout(EXECUTION_TIMEOUT, budget)),
                Err(join_err) if join_err.is_panic() => Err(ProtocolError::invocation_exception(
                    "command handler panicked",
                    false,
                )),
                Err(_) => Err(ProtocolError::invocation_exception(
                    "command handler was cancelled",
                    false,
                )),
            }
        })
    }
}
