//! Command executor: receives requests, runs the handler, publishes responses.
//!
//! One dispatch task reads the request subscription and spawns a task per
//! message, so a slow handler never holds up the stream. Each request is
//! validated header by header, deduplicated through the [`ResponseCache`],
//! run through the tower execution pipeline and answered on its response
//! topic.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use courier_core::headers;
use courier_core::{
    ErrorKind, InboundMessage, PayloadCodec, ProtocolError, ProtocolVersion, PubSubTransport,
    PublishProperties, Subscription, Timestamp, TopicPattern,
};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tower::ServiceExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::cache::{CacheSweeper, CachedResponse, Lookup, ResponseCache, SweepTask};
use super::handler::{handler_fn, HandlerService, Invocation};
use super::middleware::{build_execution_pipeline, ExecutionPipeline};
use super::request::{check_user_data, ApplicationError, CommandRequest, CommandResponse};
use crate::clock::SharedHlc;
use crate::config::{shared_filter, ExecutorOptions};
use crate::fencing::FencingToken;
use crate::shutdown::{LifecycleState, ShutdownController};
use crate::wire::{self, expiry_seconds};
use crate::worker::BackgroundWorker;

/// Request headers that passed validation.
struct RequestContext {
    correlation_id: Uuid,
    correlation_data: Bytes,
    response_topic: String,
    deadline: Instant,
    idempotent: bool,
    invoker_id: String,
    timestamp: Option<Timestamp>,
    fencing_token: Option<FencingToken>,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct ExecutorInner<Req, Resp, QC, PC> {
    options: ExecutorOptions,
    command_name: Arc<str>,
    transport: Arc<dyn PubSubTransport>,
    hlc: SharedHlc,
    request_codec: QC,
    response_codec: PC,
    handler: HandlerService<Req, Resp>,
    request_pattern: TopicPattern,
    subscribe_filter: String,
    cache: Arc<ResponseCache>,
    shutdown: ShutdownController,
}

impl<Req, Resp, QC, PC> ExecutorInner<Req, Resp, QC, PC>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    QC: PayloadCodec<Req>,
    PC: PayloadCodec<Resp>,
{
    async fn process(&self, mut message: InboundMessage, pipeline: ExecutionPipeline<Req, Resp>) {
        let ack = message.take_ack();
        self.handle(message, pipeline).await;
        if let Some(ack) = ack {
            ack.ack();
        }
    }

    async fn handle(&self, message: InboundMessage, pipeline: ExecutionPipeline<Req, Resp>) {
        let received_at = Instant::now();
        let Some(response_topic) = message.properties.response_topic.clone() else {
            warn!(
                command = %self.command_name,
                topic = %message.topic,
                "request has no response topic, dropping"
            );
            return;
        };

        let context = match self.validate(&message, response_topic, received_at) {
            Ok(context) => context,
            Err(err) => {
                warn!(
                    command = %self.command_name,
                    topic = %message.topic,
                    error = %err,
                    "rejecting malformed request"
                );
                self.publish_rejection(&message, &err).await;
                return;
            }
        };

        if context.deadline <= received_at {
            warn!(
                command = %self.command_name,
                correlation_id = %context.correlation_id,
                "request arrived already expired, answering with timeout"
            );
            let budget = context.deadline.saturating_duration_since(received_at);
            self.publish_rejection(&message, &ProtocolError::timeout(wire::EXECUTION_TIMEOUT, budget))
                .await;
            return;
        }

        match self.cache.begin(context.correlation_id, context.deadline) {
            Lookup::Hit(cached) => {
                self.replay(&context, cached).await;
                return;
            }
            Lookup::Pending(mut rx) => {
                let waited = tokio::time::timeout_at(context.deadline, async {
                    rx.wait_for(Option::is_some).await.map(|value| value.clone())
                })
                .await;
                match waited {
                    Ok(Ok(Some(cached))) => self.replay(&context, cached).await,
                    _ => debug!(
                        command = %self.command_name,
                        correlation_id = %context.correlation_id,
                        "duplicate request expired while the first copy was executing"
                    ),
                }
                return;
            }
            Lookup::Miss => {}
        }

        let result = match self.request_codec.decode(
            &message.payload,
            message.properties.content_type.as_deref(),
            message.properties.format_indicator,
        ) {
            Ok(payload) => {
                let invocation = self.invocation(&context, &message, payload);
                pipeline.oneshot(invocation).await
            }
            Err(err) => Err(wire::decode_error(err)),
        };

        self.respond(&context, result).await;
    }

    /// Header checks, in the order peers rely on.
    fn validate(
        &self,
        message: &InboundMessage,
        response_topic: String,
        received_at: Instant,
    ) -> Result<RequestContext, ProtocolError> {
        let properties = &message.properties;

        let correlation_data = properties
            .correlation_data
            .clone()
            .ok_or_else(|| ProtocolError::header_missing(headers::CORRELATION_DATA))?;
        let correlation_id = Uuid::from_slice(&correlation_data).map_err(|_| {
            ProtocolError::header_invalid(headers::CORRELATION_DATA, hex(&correlation_data))
        })?;

        let expiry = properties
            .message_expiry_interval
            .ok_or_else(|| ProtocolError::header_missing(headers::MESSAGE_EXPIRY))?;

        wire::check_version(properties, ProtocolError::unsupported_request_version)?;

        self.request_codec
            .check_declared(properties.content_type.as_deref(), properties.format_indicator)
            .map_err(wire::decode_error)?;

        let invoker_id = properties
            .user_property(headers::SOURCE_ID)
            .ok_or_else(|| ProtocolError::header_missing(headers::SOURCE_ID))?
            .to_string();

        let timestamp = properties
            .user_property(headers::TIMESTAMP)
            .map(|raw| self.hlc.observe_header(raw))
            .transpose()?;

        let fencing_token = properties
            .user_property(headers::FENCING_TOKEN)
            .map(|raw| {
                raw.parse::<FencingToken>().map_err(|err| {
                    ProtocolError::header_invalid(headers::FENCING_TOKEN, raw).with_source(err)
                })
            })
            .transpose()?;

        Ok(RequestContext {
            correlation_id,
            correlation_data,
            response_topic,
            deadline: received_at + Duration::from_secs(u64::from(expiry)),
            idempotent: properties.user_property(headers::IDEMPOTENT) == Some("true"),
            invoker_id,
            timestamp,
            fencing_token,
        })
    }

    fn invocation(
        &self,
        context: &RequestContext,
        message: &InboundMessage,
        payload: Req,
    ) -> Invocation<Req> {
        let request = CommandRequest {
            payload,
            custom_user_data: headers::custom_user_data(&message.properties.user_properties, &[]),
            topic_tokens: self
                .request_pattern
                .match_topic(&message.topic)
                .unwrap_or_default(),
            timeout: context.deadline.saturating_duration_since(Instant::now()),
            idempotent: context.idempotent,
            fencing_token: context.fencing_token.clone(),
            invoker_id: Some(context.invoker_id.clone()),
            timestamp: context.timestamp.clone(),
            correlation_id: Some(context.correlation_id),
        };
        Invocation {
            command_name: Arc::clone(&self.command_name),
            correlation_id: context.correlation_id,
            deadline: context.deadline,
            request,
        }
    }

    /// Encodes the outcome, completes the cache entry and publishes it.
    async fn respond(
        &self,
        context: &RequestContext,
        result: Result<CommandResponse<Resp>, ProtocolError>,
    ) {
        let outcome = result.and_then(|response| {
            check_user_data(&response.custom_user_data).map_err(|err| {
                ProtocolError::internal_logic(
                    "custom_user_data",
                    format!("handler response carries a reserved user property: {err}"),
                )
            })?;
            let payload = self.response_codec.encode(&response.payload).map_err(|err| {
                ProtocolError::internal_logic(
                    "payload",
                    format!("failed to encode command response: {err}"),
                )
                .with_source(err)
            })?;
            Ok((payload, response.custom_user_data))
        });

        let (cached, cacheable) = match outcome {
            Ok((payload, user_data)) => {
                let content_type = self.response_codec.content_type();
                let mut properties = PublishProperties {
                    content_type: (!content_type.is_empty()).then(|| content_type.to_string()),
                    format_indicator: self.response_codec.format_indicator(),
                    user_properties: user_data,
                    ..PublishProperties::default()
                };
                properties.push_user_property(headers::STATUS, "200");
                (self.finish_properties(context, payload, properties), true)
            }
            Err(err) => {
                debug!(
                    command = %self.command_name,
                    correlation_id = %context.correlation_id,
                    error = %err,
                    "command failed"
                );
                let mut properties = PublishProperties::default();
                wire::write_error(&err, &mut properties);
                let cacheable = !matches!(err.kind(), ErrorKind::Timeout | ErrorKind::StateInvalid);
                (self.finish_properties(context, Bytes::new(), properties), cacheable)
            }
        };

        let cache_until = if context.idempotent {
            context.deadline + self.options.idempotent_cache_ttl()
        } else {
            context.deadline
        };
        self.cache
            .complete(context.correlation_id, cached.clone(), cacheable, cache_until);

        self.publish(context, cached).await;
    }

    fn finish_properties(
        &self,
        context: &RequestContext,
        payload: Bytes,
        mut properties: PublishProperties,
    ) -> CachedResponse {
        properties.correlation_data = Some(context.correlation_data.clone());
        properties.push_user_property(headers::PROTOCOL_VERSION, ProtocolVersion::CURRENT.to_string());
        properties.push_user_property(headers::TIMESTAMP, self.hlc.now().to_string());
        CachedResponse { payload, properties }
    }

    async fn replay(&self, context: &RequestContext, cached: CachedResponse) {
        debug!(
            command = %self.command_name,
            correlation_id = %context.correlation_id,
            "replaying cached response"
        );
        metrics::counter!("courier_cache_replays_total", "command" => self.command_name.to_string())
            .increment(1);
        self.publish(context, cached).await;
    }

    async fn publish(&self, context: &RequestContext, response: CachedResponse) {
        let remaining = context.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            debug!(
                command = %self.command_name,
                correlation_id = %context.correlation_id,
                "request expired before the response was ready, not publishing"
            );
            return;
        }

        let mut properties = response.properties;
        properties.message_expiry_interval = expiry_seconds(remaining);
        if let Err(err) = self
            .transport
            .publish(&context.response_topic, response.payload, properties)
            .await
        {
            warn!(
                command = %self.command_name,
                correlation_id = %context.correlation_id,
                error = %err,
                "failed to publish command response"
            );
        }
    }

    /// Answers a request that failed validation. Nothing is cached.
    async fn publish_rejection(&self, message: &InboundMessage, err: &ProtocolError) {
        let Some(topic) = message.properties.response_topic.as_deref() else {
            return;
        };
        let mut properties = PublishProperties {
            correlation_data: message.properties.correlation_data.clone(),
            message_expiry_interval: message.properties.message_expiry_interval.filter(|s| *s > 0),
            ..PublishProperties::default()
        };
        wire::write_error(err, &mut properties);
        properties.push_user_property(headers::PROTOCOL_VERSION, ProtocolVersion::CURRENT.to_string());
        properties.push_user_property(headers::TIMESTAMP, self.hlc.now().to_string());

        if let Err(publish_err) = self.transport.publish(topic, Bytes::new(), properties).await {
            warn!(
                command = %self.command_name,
                error = %publish_err,
                "failed to publish rejection"
            );
        }
    }
}

async fn dispatch_requests<Req, Resp, QC, PC>(
    inner: Arc<ExecutorInner<Req, Resp, QC, PC>>,
    mut subscription: Subscription,
    pipeline: ExecutionPipeline<Req, Resp>,
    mut shutdown: watch::Receiver<bool>,
) where
    Req: Send + 'static,
    Resp: Send + 'static,
    QC: PayloadCodec<Req>,
    PC: PayloadCodec<Resp>,
{
    loop {
        let message = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            next = subscription.recv() => match next {
                Some(message) => message,
                None => {
                    warn!(command = %inner.command_name, "request subscription closed by transport");
                    break;
                }
            },
        };

        let guard = inner.shutdown.in_flight_guard();
        let inner = Arc::clone(&inner);
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            inner.process(message, pipeline).await;
            drop(guard);
        });
    }
    debug!(command = %inner.command_name, "request dispatch stopped");
}

// ---------------------------------------------------------------------------
// CommandExecutor
// ---------------------------------------------------------------------------

/// Serves one kind of command with a user-supplied handler.
///
/// `QC` decodes request payloads, `PC` encodes response payloads.
pub struct CommandExecutor<Req, Resp, QC, PC> {
    inner: Arc<ExecutorInner<Req, Resp, QC, PC>>,
    sweeper: tokio::sync::Mutex<Option<BackgroundWorker<CacheSweeper>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl<Req, Resp, QC, PC> CommandExecutor<Req, Resp, QC, PC>
where
    Req: Send + 'static,
    Resp: Send + 'static,
    QC: PayloadCodec<Req>,
    PC: PayloadCodec<Resp>,
{
    /// Builds an executor around `handler`. Call [`start`](Self::start) to
    /// begin serving.
    ///
    /// # Errors
    ///
    /// `ConfigurationInvalid` if the options are incomplete or the request
    /// topic pattern is malformed.
    pub fn new<F, Fut>(
        transport: Arc<dyn PubSubTransport>,
        hlc: SharedHlc,
        options: ExecutorOptions,
        request_codec: QC,
        response_codec: PC,
        handler: F,
    ) -> Result<Self, ProtocolError>
    where
        F: Fn(CommandRequest<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CommandResponse<Resp>, ApplicationError>> + Send + 'static,
    {
        options.validate()?;
        let tokens = options.construction_tokens(transport.client_id());
        let request_pattern = TopicPattern::new(
            "request_topic_pattern",
            &options.request_topic_pattern,
            &tokens,
        )?;
        let subscribe_filter = shared_filter(
            options.service_group_id.as_deref(),
            request_pattern.as_subscribe_topic(),
        );

        Ok(Self {
            inner: Arc::new(ExecutorInner {
                command_name: Arc::from(options.command_name.as_str()),
                options,
                transport,
                hlc,
                request_codec,
                response_codec,
                handler: HandlerService::new(handler_fn(handler)),
                request_pattern,
                subscribe_filter,
                cache: Arc::new(ResponseCache::new()),
                shutdown: ShutdownController::new(),
            }),
            sweeper: tokio::sync::Mutex::new(None),
            dispatch: Mutex::new(None),
        })
    }

    /// Subscribes to the request topic and starts dispatching.
    ///
    /// # Errors
    ///
    /// `StateInvalid` if the executor was already started; `TransportError`
    /// if the subscription fails.
    pub async fn start(&self) -> Result<(), ProtocolError> {
        if self.inner.shutdown.state() != LifecycleState::Starting || self.dispatch.lock().is_some()
        {
            return Err(ProtocolError::state_invalid(None, "executor has already been started")
                .into_shallow());
        }

        let subscription = self
            .inner
            .transport
            .subscribe(&self.inner.subscribe_filter)
            .await
            .map_err(|err| {
                ProtocolError::transport("failed to subscribe to request topic", err).into_shallow()
            })?;

        let pipeline = build_execution_pipeline(self.inner.handler.clone(), &self.inner.options);
        let sweeper = BackgroundWorker::start(
            CacheSweeper::new(Arc::clone(&self.inner.cache)),
            Duration::from_millis(self.inner.options.cache_sweep_interval_ms),
        );
        *self.sweeper.lock().await = Some(sweeper);

        let handle = tokio::spawn(dispatch_requests(
            Arc::clone(&self.inner),
            subscription,
            pipeline,
            self.inner.shutdown.shutdown_receiver(),
        ));
        *self.dispatch.lock() = Some(handle);
        self.inner.shutdown.set_running();

        info!(
            command = %self.inner.command_name,
            filter = %self.inner.subscribe_filter,
            "command executor started"
        );
        Ok(())
    }

    /// Stops accepting requests, waits up to the drain timeout for running
    /// handlers, stops the cache sweeper and unsubscribes.
    ///
    /// # Errors
    ///
    /// `TransportError` if the unsubscribe fails.
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        self.inner.shutdown.trigger_shutdown();

        let dispatch = self.dispatch.lock().take();
        if let Some(handle) = dispatch {
            let _ = handle.await;
        }

        let drained = self
            .inner
            .shutdown
            .wait_for_drain(self.inner.options.drain_timeout())
            .await;
        if !drained {
            warn!(
                command = %self.inner.command_name,
                in_flight = self.inner.shutdown.in_flight_count(),
                "drain timeout elapsed with handlers still running"
            );
        }

        let sweeper = self.sweeper.lock().await.take();
        if let Some(mut sweeper) = sweeper {
            sweeper.stop().await;
        }

        self.inner
            .transport
            .unsubscribe(&self.inner.subscribe_filter)
            .await
            .map_err(|err| ProtocolError::transport("failed to unsubscribe from request topic", err))?;

        info!(command = %self.inner.command_name, drained, "command executor stopped");
        Ok(())
    }

    /// Asks the sweeper to evict expired cache entries now.
    ///
    /// # Errors
    ///
    /// `StateInvalid` if the executor is not running.
    pub async fn sweep_cache(&self) -> Result<(), ProtocolError> {
        let sweeper = self.sweeper.lock().await;
        let Some(sweeper) = sweeper.as_ref() else {
            return Err(ProtocolError::state_invalid(None, "executor is not running").into_shallow());
        };
        sweeper
            .submit(SweepTask::SweepNow)
            .await
            .map_err(|err| ProtocolError::state_invalid(None, err.to_string()).into_shallow())
    }

    #[must_use]
    pub fn command_name(&self) -> &str {
        &self.inner.command_name
    }

    /// Filter the request subscription uses.
    #[must_use]
    pub fn subscribe_filter(&self) -> &str {
        &self.inner.subscribe_filter
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.inner.shutdown.state()
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.inner.shutdown.in_flight_count()
    }

    /// Entries currently held by the response cache.
    #[must_use]
    pub fn cached_responses(&self) -> usize {
        self.inner.cache.len()
    }
}

impl<Req, Resp, QC, PC> Drop for CommandExecutor<Req, Resp, QC, PC> {
    fn drop(&mut self) {
        self.inner.shutdown.trigger_shutdown();
    }
}

impl<Req, Resp, QC, PC> std::fmt::Debug for CommandExecutor<Req, Resp, QC, PC> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("command_name", &self.inner.command_name)
            .field("subscribe_filter", &self.inner.subscribe_filter)
            .field("state", &self.inner.shutdown.state())
            .finish_non_exhaustive()
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
