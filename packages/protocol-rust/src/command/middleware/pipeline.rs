//! Composes the middleware layers around a command handler.

use courier_core::ProtocolError;
use tower::util::BoxCloneService;
use tower::ServiceBuilder;

use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use crate::command::handler::{HandlerService, Invocation};
use crate::command::request::CommandResponse;
use crate::config::ExecutorOptions;

/// Boxed, cloneable execution pipeline; one clone serves each request.
pub type ExecutionPipeline<Req, Resp> =
    BoxCloneService<Invocation<Req>, CommandResponse<Resp>, ProtocolError>;

/// Wraps `handler` with the execution middleware.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- concurrency limit, queue or reject
/// 2. `MetricsLayer` -- span and counter around the handler itself
///
/// The handler service stops the handler at the request's expiry.
#[must_use]
pub fn build_execution_pipeline<Req, Resp>(
    handler: HandlerService<Req, Resp>,
    options: &ExecutorOptions,
) -> ExecutionPipeline<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    BoxCloneService::new(
        ServiceBuilder::new()
            .layer(LoadShedLayer::new(
                options.max_concurrent_handlers,
                options.overflow_policy,
            ))
            .layer(MetricsLayer)
            .service(handler),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use courier_core::ErrorKind;
    use tokio::time::Instant;
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::command::handler::handler_fn;
    use crate::command::request::CommandRequest;
    use crate::config::OverflowPolicy;

    fn invocation(sleep_ms: u64, budget: Duration) -> Invocation<u64> {
        Invocation {
            command_name: Arc::from("sleep"),
            correlation_id: Uuid::new_v4(),
            deadline: Instant::now() + budget,
            request: CommandRequest::new(sleep_ms),
        }
    }

    fn pipeline(policy: OverflowPolicy) -> ExecutionPipeline<u64, u64> {
        let options = ExecutorOptions {
            command_name: "sleep".into(),
            max_concurrent_handlers: 1,
            overflow_policy: policy,
            ..ExecutorOptions::default()
        };
        let handler = HandlerService::new(handler_fn(|req: CommandRequest<u64>| async move {
            tokio::time::sleep(Duration::from_millis(req.payload)).await;
            Ok(CommandResponse::new(req.payload))
        }));
        build_execution_pipeline(handler, &options)
    }

    #[tokio::test]
    async fn full_stack_returns_response() {
        let response = pipeline(OverflowPolicy::Queue)
            .oneshot(invocation(1, Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(response.payload, 1);
    }

    #[tokio::test]
    async fn full_stack_enforces_deadline() {
        let err = pipeline(OverflowPolicy::Queue)
            .oneshot(invocation(300, Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn clones_share_the_concurrency_limit() {
        let svc = pipeline(OverflowPolicy::Reject);
        let busy = tokio::spawn(svc.clone().oneshot(invocation(200, Duration::from_secs(1))));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = svc
            .oneshot(invocation(1, Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateInvalid);
        assert!(busy.await.unwrap().is_ok());
    }

    /// Decrements the running count when the handler future goes away.
    struct Running(Arc<AtomicUsize>);

    impl Drop for Running {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn timed_out_handler_keeps_its_slot_until_stopped() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let options = ExecutorOptions {
            command_name: "sleep".into(),
            max_concurrent_handlers: 1,
            overflow_policy: OverflowPolicy::Reject,
            ..ExecutorOptions::default()
        };
        let handler = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            HandlerService::new(handler_fn(move |req: CommandRequest<u64>| {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let slot = Running(Arc::clone(&running));
                async move {
                    let _slot = slot;
                    tokio::time::sleep(Duration::from_millis(req.payload)).await;
                    Ok(CommandResponse::new(req.payload))
                }
            }))
        };
        let svc = build_execution_pipeline(handler, &options);

        let first = svc
            .clone()
            .oneshot(invocation(500, Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(first.kind(), ErrorKind::Timeout);
        assert_eq!(running.load(Ordering::SeqCst), 0);

        let second = svc.oneshot(invocation(10, Duration::from_secs(1))).await;
        assert!(second.is_ok());
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
