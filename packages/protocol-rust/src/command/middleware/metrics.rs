//! Per-execution tracing span and counter.
//!
//! Each handler run gets an `execution` span carrying the command name,
//! correlation id, duration and outcome, and bumps `courier_executions_total`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use courier_core::ProtocolError;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::command::handler::Invocation;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S, Req> Service<Invocation<Req>> for MetricsService<S>
where
    S: Service<Invocation<Req>, Error = ProtocolError> + Send,
    S::Future: Send + 'static,
    S::Response: 'static,
{
    type Response = S::Response;
    type Error = ProtocolError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, ProtocolError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation<Req>) -> Self::Future {
        let command = invocation.command_name.clone();
        let correlation_id = invocation.correlation_id;

        let span = info_span!(
            "execution",
            command = %command,
            correlation_id = %correlation_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(invocation);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(err) => err.kind().as_str(),
                };
                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;

                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);
                tracing::debug!(duration_ms, outcome, "command executed");

                metrics::counter!(
                    "courier_executions_total",
                    "command" => command.to_string(),
                    "outcome" => outcome
                )
                .increment(1);

                result
            }
            .instrument(span),
        )
    }
}
