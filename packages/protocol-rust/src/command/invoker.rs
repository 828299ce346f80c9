//! Command invoker: publishes requests and correlates their responses.
//!
//! Each call gets a fresh UUID correlation id and a `oneshot` waiter in a
//! `DashMap`. A single background task reads the response subscription and
//! resolves waiters; whichever of response, timeout or cancellation comes
//! first removes the waiter, so every call resolves exactly once.
//!
//! If the transport ends the response subscription, every pending call fails
//! with `TransportError` and the next call subscribes again.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use courier_core::headers;
use courier_core::{
    InboundMessage, PayloadCodec, ProtocolError, ProtocolVersion, PubSubTransport,
    PublishProperties, RetryPolicy, Subscription, TopicPattern, TopicTokens,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::request::{check_user_data, CommandRequest, CommandResponse};
use crate::clock::SharedHlc;
use crate::config::InvokerOptions;
use crate::wire::{self, expiry_seconds};

/// Timeout name reported when no response arrives in time.
pub const COMMAND_TIMEOUT: &str = "CommandTimeout";

type Waiter<Resp> = oneshot::Sender<Result<CommandResponse<Resp>, ProtocolError>>;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct InvokerShared<Resp, PC> {
    command_name: String,
    transport: Arc<dyn PubSubTransport>,
    hlc: SharedHlc,
    response_codec: PC,
    response_filter: String,
    pending: DashMap<Uuid, Waiter<Resp>>,
    /// Held across subscribe so concurrent first calls subscribe once.
    subscribed: AsyncMutex<bool>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    closed: CancellationToken,
}

impl<Resp, PC> InvokerShared<Resp, PC>
where
    PC: PayloadCodec<Resp>,
    Resp: Send + 'static,
{
    fn route_response(&self, message: &InboundMessage) {
        let Some(correlation_id) = message
            .properties
            .correlation_data
            .as_deref()
            .and_then(|data| Uuid::from_slice(data).ok())
        else {
            debug!(topic = %message.topic, "discarding response without usable correlation data");
            return;
        };

        let Some((_, waiter)) = self.pending.remove(&correlation_id) else {
            debug!(
                command = %self.command_name,
                correlation_id = %correlation_id,
                "discarding late or unknown response"
            );
            return;
        };

        // The caller may have stopped listening in the meantime.
        let _ = waiter.send(self.parse_response(message));
    }

    fn parse_response(&self, message: &InboundMessage) -> Result<CommandResponse<Resp>, ProtocolError> {
        let properties = &message.properties;

        let timestamp = properties
            .user_property(headers::TIMESTAMP)
            .map(|raw| self.hlc.observe_header(raw))
            .transpose()?;

        wire::check_version(properties, ProtocolError::unsupported_response_version)?;
        wire::read_status(properties)?;

        let payload = self
            .response_codec
            .decode(
                &message.payload,
                properties.content_type.as_deref(),
                properties.format_indicator,
            )
            .map_err(wire::decode_error)?;

        Ok(CommandResponse {
            payload,
            custom_user_data: headers::custom_user_data(&properties.user_properties, &[]),
            timestamp,
        })
    }

    fn fail_pending(&self, error: impl Fn() -> ProtocolError) -> usize {
        let ids: Vec<Uuid> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.send(Err(error()));
                failed += 1;
            }
        }
        failed
    }
}

async fn dispatch_responses<Resp, PC>(
    shared: Arc<InvokerShared<Resp, PC>>,
    mut subscription: Subscription,
) where
    PC: PayloadCodec<Resp>,
    Resp: Send + 'static,
{
    loop {
        let mut message = tokio::select! {
            () = shared.closed.cancelled() => break,
            next = subscription.recv() => match next {
                Some(message) => message,
                None => {
                    // Reset before failing waiters so their retries resubscribe.
                    *shared.subscribed.lock().await = false;
                    let filter = shared.response_filter.clone();
                    let failed = shared.fail_pending(|| {
                        ProtocolError::transport(
                            "response subscription closed by transport",
                            anyhow::anyhow!("subscription to {filter} ended"),
                        )
                    });
                    warn!(
                        command = %shared.command_name,
                        failed_pending = failed,
                        "response subscription closed by transport"
                    );
                    break;
                }
            },
        };

        shared.route_response(&message);
        if let Some(ack) = message.take_ack() {
            ack.ack();
        }
    }
    debug!(command = %shared.command_name, "response dispatch stopped");
}

/// Removes a waiter when its attempt ends without a response.
struct PendingGuard<'a, Resp> {
    pending: &'a DashMap<Uuid, Waiter<Resp>>,
    correlation_id: Uuid,
}

impl<Resp> Drop for PendingGuard<'_, Resp> {
    fn drop(&mut self) {
        self.pending.remove(&self.correlation_id);
    }
}

/// A request encoded once and published by one or more attempts.
struct PreparedRequest {
    topic: String,
    payload: Bytes,
    properties: PublishProperties,
    timeout: Duration,
    idempotent: bool,
}

// ---------------------------------------------------------------------------
// CommandInvoker
// ---------------------------------------------------------------------------

/// Sends one kind of command and awaits its response.
///
/// `QC` encodes request payloads, `PC` decodes response payloads.
pub struct CommandInvoker<Req, Resp, QC, PC> {
    shared: Arc<InvokerShared<Resp, PC>>,
    request_codec: QC,
    request_pattern: TopicPattern,
    response_prefix: Option<String>,
    response_suffix: Option<String>,
    _request: PhantomData<fn(Req)>,
}

impl<Req, Resp, QC, PC> CommandInvoker<Req, Resp, QC, PC>
where
    QC: PayloadCodec<Req>,
    PC: PayloadCodec<Resp>,
    Resp: Send + 'static,
{
    /// Builds an invoker. Nothing is subscribed until the first call.
    ///
    /// # Errors
    ///
    /// `ConfigurationInvalid` if the options are incomplete, a pattern is
    /// malformed, or the response topic prefix and suffix leave a token
    /// unresolved.
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        hlc: SharedHlc,
        options: InvokerOptions,
        request_codec: QC,
        response_codec: PC,
    ) -> Result<Self, ProtocolError> {
        options.validate()?;
        let tokens = options.construction_tokens(transport.client_id());

        let request_pattern = TopicPattern::new(
            "request_topic_pattern",
            &options.request_topic_pattern,
            &tokens,
        )?;
        let response_prefix = resolve_affix(
            "response_topic_prefix",
            options.response_topic_prefix.as_deref(),
            &tokens,
        )?;
        let response_suffix = resolve_affix(
            "response_topic_suffix",
            options.response_topic_suffix.as_deref(),
            &tokens,
        )?;
        if response_prefix.is_none() && response_suffix.is_none() {
            return Err(ProtocolError::configuration_invalid(
                "response_topic_prefix",
                None,
                "a response topic prefix or suffix is required to tell responses from requests",
            ));
        }

        let response_filter = response_topic(
            response_prefix.as_deref(),
            &request_pattern.as_subscribe_topic(),
            response_suffix.as_deref(),
        );

        Ok(Self {
            shared: Arc::new(InvokerShared {
                command_name: options.command_name,
                transport,
                hlc,
                response_codec,
                response_filter,
                pending: DashMap::new(),
                subscribed: AsyncMutex::new(false),
                dispatch: Mutex::new(None),
                closed: CancellationToken::new(),
            }),
            request_codec,
            request_pattern,
            response_prefix,
            response_suffix,
            _request: PhantomData,
        })
    }

    #[must_use]
    pub fn command_name(&self) -> &str {
        &self.shared.command_name
    }

    /// Filter the response subscription uses.
    #[must_use]
    pub fn response_filter(&self) -> &str {
        &self.shared.response_filter
    }

    /// Calls currently awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Sends `request` and waits for its response.
    ///
    /// # Errors
    ///
    /// Shallow `ArgumentInvalid`, `ConfigurationInvalid` or `PayloadInvalid`
    /// if the request cannot be built; `TransportError` if it cannot be
    /// published; `Timeout` if no response arrives in time; any remote error
    /// the executor reports.
    pub async fn invoke(
        &self,
        request: CommandRequest<Req>,
    ) -> Result<CommandResponse<Resp>, ProtocolError> {
        let result = match self.prepare(request) {
            Ok(prepared) => self.attempt(&prepared, Uuid::new_v4(), None).await,
            Err(err) => Err(err),
        };
        self.finish(result)
    }

    /// Like [`invoke`](Self::invoke), but gives up with `Cancellation` once
    /// `cancel` fires. A request already published is not retracted.
    ///
    /// # Errors
    ///
    /// As [`invoke`](Self::invoke), plus `Cancellation`.
    pub async fn invoke_with_cancellation(
        &self,
        request: CommandRequest<Req>,
        cancel: &CancellationToken,
    ) -> Result<CommandResponse<Resp>, ProtocolError> {
        let result = match self.prepare(request) {
            Ok(prepared) => self.attempt(&prepared, Uuid::new_v4(), Some(cancel)).await,
            Err(err) => Err(err),
        };
        self.finish(result)
    }

    /// Like [`invoke`](Self::invoke), consulting `policy` after each failure.
    ///
    /// Only idempotent requests are retried. Every attempt reuses the same
    /// correlation id, so an executor that already ran the request replays
    /// its cached response.
    ///
    /// # Errors
    ///
    /// The error of the last attempt.
    pub async fn invoke_with_retry(
        &self,
        request: CommandRequest<Req>,
        policy: &dyn RetryPolicy,
    ) -> Result<CommandResponse<Resp>, ProtocolError> {
        let prepared = match self.prepare(request) {
            Ok(prepared) => prepared,
            Err(err) => return self.finish(Err(err)),
        };
        let correlation_id = Uuid::new_v4();

        let mut attempt_count = 0u32;
        let result = loop {
            attempt_count += 1;
            let result = self.attempt(&prepared, correlation_id, None).await;
            let err = match result {
                Ok(response) => break Ok(response),
                Err(err) => err,
            };
            if !prepared.idempotent || err.is_shallow() {
                break Err(err);
            }
            let decision = policy.should_retry(attempt_count, &err);
            if !decision.retry {
                break Err(err);
            }
            debug!(
                command = %self.shared.command_name,
                correlation_id = %correlation_id,
                attempt = attempt_count,
                delay = ?decision.delay,
                error = %err,
                "retrying command"
            );
            tokio::select! {
                () = tokio::time::sleep(decision.delay) => {}
                () = self.shared.closed.cancelled() => {
                    break Err(ProtocolError::cancellation("invoker shut down during retry backoff"));
                }
            }
        };
        self.finish(result)
    }

    /// Stops the response dispatch, fails every pending call with
    /// `Cancellation` and unsubscribes.
    ///
    /// # Errors
    ///
    /// `TransportError` if the unsubscribe fails.
    pub async fn shutdown(&self) -> Result<(), ProtocolError> {
        self.shared.closed.cancel();

        let handle = self.shared.dispatch.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let failed = self
            .shared
            .fail_pending(|| ProtocolError::cancellation("invoker shut down"));

        if *self.shared.subscribed.lock().await {
            self.shared
                .transport
                .unsubscribe(&self.shared.response_filter)
                .await
                .map_err(|err| {
                    ProtocolError::transport("failed to unsubscribe from response topic", err)
                })?;
        }

        info!(
            command = %self.shared.command_name,
            failed_pending = failed,
            "command invoker stopped"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn prepare(&self, request: CommandRequest<Req>) -> Result<PreparedRequest, ProtocolError> {
        if self.shared.closed.is_cancelled() {
            return Err(ProtocolError::cancellation("invoker has been shut down").into_shallow());
        }

        let expiry = validate_timeout(request.timeout)?;
        check_user_data(&request.custom_user_data)?;

        let topic = self.request_pattern.resolve(&request.topic_tokens)?;
        let response_topic = response_topic(
            self.response_prefix.as_deref(),
            &topic,
            self.response_suffix.as_deref(),
        );

        let payload = self.request_codec.encode(&request.payload).map_err(|err| {
            ProtocolError::payload_invalid(format!("failed to encode request: {err}"))
                .with_source(err)
                .into_shallow()
        })?;

        let content_type = self.request_codec.content_type();
        let mut properties = PublishProperties {
            content_type: (!content_type.is_empty()).then(|| content_type.to_string()),
            format_indicator: self.request_codec.format_indicator(),
            response_topic: Some(response_topic),
            message_expiry_interval: Some(expiry),
            user_properties: request.custom_user_data,
            ..PublishProperties::default()
        };
        properties.push_user_property(headers::PROTOCOL_VERSION, ProtocolVersion::CURRENT.to_string());
        properties.push_user_property(headers::SOURCE_ID, self.shared.transport.client_id());
        if request.idempotent {
            properties.push_user_property(headers::IDEMPOTENT, "true");
        }
        if let Some(token) = &request.fencing_token {
            properties.push_user_property(headers::FENCING_TOKEN, token.to_string());
        }

        Ok(PreparedRequest {
            topic,
            payload,
            properties,
            timeout: request.timeout,
            idempotent: request.idempotent,
        })
    }

    async fn ensure_subscribed(&self) -> Result<(), ProtocolError> {
        let shared = &self.shared;
        let mut subscribed = shared.subscribed.lock().await;
        if *subscribed {
            return Ok(());
        }

        let subscription = shared
            .transport
            .subscribe(&shared.response_filter)
            .await
            .map_err(|err| {
                ProtocolError::transport("failed to subscribe to response topic", err)
                    .into_shallow()
            })?;
        let handle = tokio::spawn(dispatch_responses(Arc::clone(shared), subscription));
        *shared.dispatch.lock() = Some(handle);
        *subscribed = true;
        info!(
            command = %shared.command_name,
            filter = %shared.response_filter,
            "command invoker subscribed to responses"
        );
        Ok(())
    }

    async fn attempt(
        &self,
        prepared: &PreparedRequest,
        correlation_id: Uuid,
        cancel: Option<&CancellationToken>,
    ) -> Result<CommandResponse<Resp>, ProtocolError> {
        let deadline = Instant::now() + prepared.timeout;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(correlation_id, tx);
        let _registration = PendingGuard {
            pending: &self.shared.pending,
            correlation_id,
        };
        // Registered first: a subscription that closes from here on either
        // fails this waiter or is already reset and gets resubscribed.
        self.ensure_subscribed().await?;

        let mut properties = prepared.properties.clone();
        properties.correlation_data = Some(Bytes::copy_from_slice(correlation_id.as_bytes()));
        properties.push_user_property(headers::TIMESTAMP, self.shared.hlc.now().to_string());

        self.shared
            .transport
            .publish(&prepared.topic, prepared.payload.clone(), properties)
            .await
            .map_err(|err| ProtocolError::transport("failed to publish command request", err))?;

        debug!(
            command = %self.shared.command_name,
            correlation_id = %correlation_id,
            topic = %prepared.topic,
            "command request published"
        );

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            outcome = rx => outcome.unwrap_or_else(|_| {
                Err(ProtocolError::cancellation("invoker shut down while awaiting the response"))
            }),
            () = tokio::time::sleep_until(deadline) => {
                Err(ProtocolError::timeout(COMMAND_TIMEOUT, prepared.timeout))
            }
            () = cancelled => Err(ProtocolError::cancellation("command invocation was cancelled")),
        }
    }

    fn finish(
        &self,
        result: Result<CommandResponse<Resp>, ProtocolError>,
    ) -> Result<CommandResponse<Resp>, ProtocolError> {
        let outcome = match &result {
            Ok(_) => "ok",
            Err(err) => err.kind().as_str(),
        };
        metrics::counter!(
            "courier_invocations_total",
            "command" => self.shared.command_name.clone(),
            "outcome" => outcome
        )
        .increment(1);
        result.map_err(|err| err.with_command_name(self.shared.command_name.clone()))
    }
}

impl<Req, Resp, QC, PC> Drop for CommandInvoker<Req, Resp, QC, PC> {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

impl<Req, Resp, QC, PC> std::fmt::Debug for CommandInvoker<Req, Resp, QC, PC> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandInvoker")
            .field("command_name", &self.shared.command_name)
            .field("response_filter", &self.shared.response_filter)
            .field("pending", &self.shared.pending.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn validate_timeout(timeout: Duration) -> Result<u32, ProtocolError> {
    let invalid = |message: &str| {
        ProtocolError::argument_invalid(
            "timeout",
            Some(format!("{}ms", timeout.as_millis())),
            message,
        )
    };
    if timeout.is_zero() {
        return Err(invalid("command timeout must be positive"));
    }
    expiry_seconds(timeout).ok_or_else(|| invalid("command timeout exceeds u32::MAX seconds"))
}

/// Resolves a response topic prefix or suffix, which may only use tokens
/// known when the invoker is built.
fn resolve_affix(
    property_name: &str,
    affix: Option<&str>,
    tokens: &TopicTokens,
) -> Result<Option<String>, ProtocolError> {
    let Some(affix) = affix.filter(|a| !a.is_empty()) else {
        return Ok(None);
    };
    let pattern = TopicPattern::new(property_name, affix, tokens)?;
    pattern.resolve(&TopicTokens::new()).map(Some)
}

fn response_topic(prefix: Option<&str>, request_topic: &str, suffix: Option<&str>) -> String {
    let mut topic = String::new();
    if let Some(prefix) = prefix {
        topic.push_str(prefix);
        topic.push('/');
    }
    topic.push_str(request_topic);
    if let Some(suffix) = suffix {
        topic.push('/');
        topic.push_str(suffix);
    }
    topic
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use courier_core::topic::tokens;
    use courier_core::{ErrorKind, JsonCodec, RetryDecision};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::transport::{MemoryBroker, MemoryClient};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Echo {
        text: String,
    }

    type EchoInvoker = CommandInvoker<Echo, Echo, JsonCodec<Echo>, JsonCodec<Echo>>;

    fn options() -> InvokerOptions {
        InvokerOptions {
            command_name: "echo".into(),
            request_topic_pattern: "svc/{executorId}/{commandName}".into(),
            ..InvokerOptions::default()
        }
    }

    fn invoker(broker: &MemoryBroker) -> (EchoInvoker, Arc<MemoryClient>) {
        let client = Arc::new(broker.client("caller"));
        let invoker = CommandInvoker::new(
            Arc::clone(&client) as Arc<dyn PubSubTransport>,
            SharedHlc::new("caller"),
            options(),
            JsonCodec::default(),
            JsonCodec::default(),
        )
        .unwrap();
        (invoker, client)
    }

    fn echo(text: &str) -> CommandRequest<Echo> {
        CommandRequest::new(Echo { text: text.into() })
            .with_topic_token(tokens::EXECUTOR_ID, "exec-1")
            .with_timeout(Duration::from_secs(2))
    }

    /// Answers a captured request with `status` and the request's own payload.
    async fn reply(responder: &MemoryClient, request: &InboundMessage, status: &str) {
        let mut props = PublishProperties {
            content_type: request.properties.content_type.clone(),
            format_indicator: request.properties.format_indicator,
            correlation_data: request.properties.correlation_data.clone(),
            ..PublishProperties::default()
        };
        props.push_user_property(headers::STATUS, status);
        props.push_user_property(headers::TIMESTAMP, "1:0:exec-1");
        props.push_user_property("region", "eu");
        let topic = request.properties.response_topic.clone().unwrap();
        responder
            .publish(&topic, request.payload.clone(), props)
            .await
            .unwrap();
    }

    async fn responder(broker: &MemoryBroker) -> (MemoryClient, Subscription) {
        let client = broker.client("exec-1");
        let sub = client.subscribe("svc/exec-1/echo").await.unwrap();
        (client, sub)
    }

    #[test]
    fn response_topic_joins_prefix_and_suffix() {
        assert_eq!(response_topic(Some("clients/a"), "svc/x", None), "clients/a/svc/x");
        assert_eq!(response_topic(None, "svc/x", Some("reply")), "svc/x/reply");
    }

    #[tokio::test]
    async fn construction_validates_options() {
        let broker = MemoryBroker::new();
        let transport: Arc<dyn PubSubTransport> = Arc::new(broker.client("caller"));

        let missing_name = EchoInvoker::new(
            Arc::clone(&transport),
            SharedHlc::new("caller"),
            InvokerOptions { command_name: String::new(), ..options() },
            JsonCodec::default(),
            JsonCodec::default(),
        )
        .unwrap_err();
        assert_eq!(missing_name.kind(), ErrorKind::ConfigurationInvalid);

        let no_affix = EchoInvoker::new(
            Arc::clone(&transport),
            SharedHlc::new("caller"),
            InvokerOptions { response_topic_prefix: None, ..options() },
            JsonCodec::default(),
            JsonCodec::default(),
        )
        .unwrap_err();
        assert_eq!(no_affix.property_name(), Some("response_topic_prefix"));

        let unresolved_prefix = EchoInvoker::new(
            transport,
            SharedHlc::new("caller"),
            InvokerOptions { response_topic_prefix: Some("r/{ex:zone}".into()), ..options() },
            JsonCodec::default(),
            JsonCodec::default(),
        )
        .unwrap_err();
        assert_eq!(unresolved_prefix.kind(), ErrorKind::ConfigurationInvalid);
        assert!(unresolved_prefix.is_shallow());
    }

    #[tokio::test]
    async fn response_filter_wildcards_per_call_tokens() {
        let broker = MemoryBroker::new();
        let (invoker, _client) = invoker(&broker);
        assert_eq!(invoker.response_filter(), "clients/caller/svc/+/echo");
    }

    #[tokio::test]
    async fn round_trip_merges_clock_and_user_data() {
        let broker = MemoryBroker::new();
        let (invoker, _client) = invoker(&broker);
        let (exec, mut sub) = responder(&broker).await;

        let server = tokio::spawn(async move {
            let request = sub.recv().await.unwrap();
            let props = &request.properties;
            assert_eq!(props.user_property(headers::SOURCE_ID), Some("caller"));
            assert_eq!(props.user_property(headers::PROTOCOL_VERSION), Some("1.0"));
            assert!(props.user_property(headers::TIMESTAMP).is_some());
            assert_eq!(props.message_expiry_interval, Some(2));
            assert_eq!(
                props.response_topic.as_deref(),
                Some("clients/caller/svc/exec-1/echo")
            );
            reply(&exec, &request, "200").await;
        });

        let response = invoker.invoke(echo("hi")).await.unwrap();
        server.await.unwrap();

        assert_eq!(response.payload.text, "hi");
        assert_eq!(response.timestamp.unwrap().node_id, "exec-1");
        assert_eq!(
            response.custom_user_data,
            vec![("region".to_string(), "eu".to_string())]
        );
        assert_eq!(invoker.pending_count(), 0);
    }

    #[tokio::test]
    async fn no_response_times_out_and_clears_waiter() {
        let broker = MemoryBroker::new();
        let (invoker, _client) = invoker(&broker);

        let err = invoker
            .invoke(echo("lost").with_timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.timeout_name(), Some(COMMAND_TIMEOUT));
        assert_eq!(err.timeout_value(), Some(Duration::from_millis(50)));
        assert_eq!(err.command_name(), Some("echo"));
        assert!(!err.is_remote());
        assert_eq!(invoker.pending_count(), 0);
    }

    #[tokio::test]
    async fn late_response_is_discarded() {
        let broker = MemoryBroker::new();
        let (invoker, _client) = invoker(&broker);
        let (exec, mut sub) = responder(&broker).await;

        let err = invoker
            .invoke(echo("slow").with_timeout(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);

        let request = sub.recv().await.unwrap();
        reply(&exec, &request, "200").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(invoker.pending_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_resolves_the_call() {
        let broker = MemoryBroker::new();
        let (invoker, _client) = invoker(&broker);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = invoker
            .invoke_with_cancellation(echo("stop"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancellation);
        assert_eq!(invoker.pending_count(), 0);
    }

    #[tokio::test]
    async fn shallow_errors_are_raised_before_publishing() {
        let broker = MemoryBroker::new();
        let (invoker, _client) = invoker(&broker);

        let zero = invoker
            .invoke(echo("x").with_timeout(Duration::ZERO))
            .await
            .unwrap_err();
        assert_eq!(zero.kind(), ErrorKind::ArgumentInvalid);
        assert!(zero.is_shallow());

        let huge = invoker
            .invoke(echo("x").with_timeout(Duration::from_secs(u64::from(u32::MAX) + 1)))
            .await
            .unwrap_err();
        assert_eq!(huge.kind(), ErrorKind::ArgumentInvalid);

        let unresolved = invoker
            .invoke(CommandRequest::new(Echo { text: "x".into() }))
            .await
            .unwrap_err();
        assert_eq!(unresolved.kind(), ErrorKind::ConfigurationInvalid);
        assert_eq!(unresolved.property_name(), Some("executorId"));
        assert!(unresolved.is_shallow());

        let reserved = invoker
            .invoke(echo("x").with_user_data("__mine", "1"))
            .await
            .unwrap_err();
        assert_eq!(reserved.kind(), ErrorKind::ArgumentInvalid);

        assert_eq!(broker.published_count(), 0);
    }

    #[tokio::test]
    async fn encode_failure_is_shallow_payload_invalid() {
        let broker = MemoryBroker::new();
        let invoker: CommandInvoker<BTreeMap<Vec<u8>, u8>, Echo, _, _> = CommandInvoker::new(
            Arc::new(broker.client("caller")),
            SharedHlc::new("caller"),
            options(),
            JsonCodec::default(),
            JsonCodec::<Echo>::default(),
        )
        .unwrap();

        let mut map = BTreeMap::new();
        map.insert(vec![1u8], 1u8);
        let err = invoker
            .invoke(CommandRequest::new(map).with_topic_token(tokens::EXECUTOR_ID, "exec-1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PayloadInvalid);
        assert!(err.is_shallow());
    }

    #[tokio::test]
    async fn publish_failure_is_deep_transport_error() {
        let broker = MemoryBroker::new();
        let (invoker, client) = invoker(&broker);
        client.fail_next_publishes(1);

        let err = invoker.invoke(echo("x")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportError);
        assert!(!err.is_shallow());
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(invoker.pending_count(), 0);
    }

    #[tokio::test]
    async fn remote_status_becomes_remote_error() {
        let broker = MemoryBroker::new();
        let (invoker, _client) = invoker(&broker);
        let (exec, mut sub) = responder(&broker).await;

        tokio::spawn(async move {
            let request = sub.recv().await.unwrap();
            reply(&exec, &request, "503").await;
        });

        let err = invoker.invoke(echo("busy")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateInvalid);
        assert!(err.is_remote());
        assert!(!err.is_shallow());
    }

    #[tokio::test]
    async fn unsupported_response_version_is_rejected() {
        let broker = MemoryBroker::new();
        let (invoker, _client) = invoker(&broker);
        let exec = broker.client("exec-1");
        let mut sub = exec.subscribe("svc/exec-1/echo").await.unwrap();

        tokio::spawn(async move {
            let request = sub.recv().await.unwrap();
            let mut props = PublishProperties {
                correlation_data: request.properties.correlation_data.clone(),
                ..PublishProperties::default()
            };
            props.push_user_property(headers::PROTOCOL_VERSION, "2.0");
            props.push_user_property(headers::STATUS, "200");
            let topic = request.properties.response_topic.clone().unwrap();
            exec.publish(&topic, request.payload.clone(), props).await.unwrap();
        });

        let err = invoker.invoke(echo("v2")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedResponseVersion);
        assert_eq!(err.protocol_version(), Some("2.0"));
        assert_eq!(err.supported_major_versions(), &[1]);
    }

    struct RetryTwice;

    impl RetryPolicy for RetryTwice {
        fn should_retry(&self, attempt_count: u32, last_error: &ProtocolError) -> RetryDecision {
            if attempt_count < 3 && last_error.is_transient() {
                RetryDecision::after(Duration::from_millis(5))
            } else {
                RetryDecision::STOP
            }
        }
    }

    #[tokio::test]
    async fn idempotent_retry_reuses_correlation_id() {
        let broker = MemoryBroker::new();
        let (invoker, _client) = invoker(&broker);
        let (exec, mut sub) = responder(&broker).await;

        let server = tokio::spawn(async move {
            let first = sub.recv().await.unwrap();
            let second = sub.recv().await.unwrap();
            assert_eq!(
                first.properties.correlation_data,
                second.properties.correlation_data
            );
            assert_eq!(second.properties.user_property(headers::IDEMPOTENT), Some("true"));
            reply(&exec, &second, "200").await;
        });

        let response = invoker
            .invoke_with_retry(
                echo("again")
                    .idempotent(true)
                    .with_timeout(Duration::from_millis(100)),
                &RetryTwice,
            )
            .await
            .unwrap();
        server.await.unwrap();
        assert_eq!(response.payload.text, "again");
    }

    #[tokio::test]
    async fn non_idempotent_requests_are_attempted_once() {
        let broker = MemoryBroker::new();
        let (invoker, _client) = invoker(&broker);
        let seen = Arc::new(AtomicU32::new(0));
        let exec = broker.client("exec-1");
        let mut sub = exec.subscribe("svc/exec-1/echo").await.unwrap();

        let counter = Arc::clone(&seen);
        tokio::spawn(async move {
            while sub.recv().await.is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let err = invoker
            .invoke_with_retry(echo("once").with_timeout(Duration::from_millis(40)), &RetryTwice)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn closed_response_subscription_fails_pending_and_resubscribes() {
        let broker = MemoryBroker::new();
        let (invoker, client) = invoker(&broker);
        let invoker = Arc::new(invoker);
        let (exec, mut sub) = responder(&broker).await;

        let call = {
            let invoker = Arc::clone(&invoker);
            tokio::spawn(async move {
                invoker
                    .invoke(echo("stranded").with_timeout(Duration::from_secs(30)))
                    .await
            })
        };
        let stranded = sub.recv().await.unwrap();
        assert_eq!(invoker.pending_count(), 1);

        client.disconnect();
        let err = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportError);
        assert!(!err.is_shallow());
        assert_eq!(err.command_name(), Some("echo"));
        assert_eq!(invoker.pending_count(), 0);

        // An answer to the failed call has nobody left to reach.
        reply(&exec, &stranded, "200").await;

        let server = tokio::spawn(async move {
            let request = sub.recv().await.unwrap();
            reply(&exec, &request, "200").await;
        });
        let response = invoker.invoke(echo("again")).await.unwrap();
        server.await.unwrap();
        assert_eq!(response.payload.text, "again");
        assert_eq!(broker.subscription_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_fails_pending_calls() {
        let broker = MemoryBroker::new();
        let (invoker, _client) = invoker(&broker);
        let invoker = Arc::new(invoker);

        let call = {
            let invoker = Arc::clone(&invoker);
            tokio::spawn(async move { invoker.invoke(echo("pending")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(invoker.pending_count(), 1);

        invoker.shutdown().await.unwrap();
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancellation);
        assert_eq!(broker.subscription_count(), 0);

        let after = invoker.invoke(echo("late")).await.unwrap_err();
        assert_eq!(after.kind(), ErrorKind::Cancellation);
        assert!(after.is_shallow());
    }
}
