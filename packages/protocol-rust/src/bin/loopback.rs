//! Courier loopback demo
//!
//! Runs an executor, an invoker, a telemetry sender and a telemetry receiver
//! against one in-memory broker in a single process.
//!
//! # Example
//!
//! ```bash
//! RUST_LOG=debug courier-loopback --requests 20 --readings 5
//! ```

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use courier_core::{ExponentialBackoff, JsonCodec, PubSubTransport, RetryOptions};
use courier_protocol::config::ExecutorOptions;
use courier_protocol::{
    ApplicationError, CloudEvent, CommandExecutor, CommandInvoker, CommandRequest,
    CommandResponse, InvokerOptions, MemoryBroker, ReceiverOptions, SenderOptions, SharedHlc,
    TelemetryMessage, TelemetryReceiver, TelemetrySender,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const REQUEST_PATTERN: &str = "demo/{executorId}/{commandName}";
const TELEMETRY_PATTERN: &str = "demo/{senderId}/{telemetryName}";

/// Courier loopback
///
/// Exercises commands and telemetry end to end over the in-memory broker.
#[derive(Parser, Debug)]
#[command(name = "courier-loopback")]
#[command(version, about, long_about = None)]
struct Args {
    /// Number of increment commands to invoke
    #[arg(short = 'n', long, default_value = "10")]
    requests: u32,

    /// Number of telemetry readings to publish
    #[arg(short = 'r', long, default_value = "3")]
    readings: u32,

    /// Per-command timeout in milliseconds
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,

    /// Concurrent handler slots on the executor
    #[arg(long, default_value = "4", env = "COURIER_MAX_HANDLERS")]
    max_handlers: u32,

    /// Send increments as idempotent requests retried with exponential backoff
    #[arg(long)]
    idempotent: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Increment {
    by: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Counter {
    value: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Reading {
    sequence: u32,
    celsius: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(
        requests = args.requests,
        readings = args.readings,
        timeout_ms = args.timeout_ms,
        idempotent = args.idempotent,
        "starting loopback"
    );

    let broker = MemoryBroker::new();
    run_commands(&broker, &args).await?;
    run_telemetry(&broker, args.readings).await?;

    info!(
        published = broker.published_count(),
        delivered = broker.delivered_count(),
        dropped = broker.dropped_count(),
        acknowledged = broker.acknowledged_count(),
        "loopback finished"
    );
    Ok(())
}

async fn run_commands(broker: &MemoryBroker, args: &Args) -> anyhow::Result<()> {
    let total = Arc::new(AtomicI64::new(0));
    let counter = Arc::clone(&total);
    let executor = CommandExecutor::new(
        Arc::new(broker.client("counter")),
        SharedHlc::new("counter"),
        ExecutorOptions {
            command_name: "increment".into(),
            request_topic_pattern: REQUEST_PATTERN.into(),
            max_concurrent_handlers: args.max_handlers,
            ..ExecutorOptions::default()
        },
        JsonCodec::default(),
        JsonCodec::default(),
        move |req: CommandRequest<Increment>| {
            let counter = Arc::clone(&counter);
            async move {
                if req.payload.by < 0 {
                    return Err(ApplicationError::new("increment must not be negative")
                        .with_property("by", Some(req.payload.by.to_string())));
                }
                let value = counter.fetch_add(req.payload.by, Ordering::SeqCst) + req.payload.by;
                Ok(CommandResponse::new(Counter { value }))
            }
        },
    )
    .context("failed to build executor")?;
    executor.start().await.context("failed to start executor")?;

    let invoker: CommandInvoker<Increment, Counter, _, _> = CommandInvoker::new(
        Arc::new(broker.client("caller")),
        SharedHlc::new("caller"),
        InvokerOptions {
            command_name: "increment".into(),
            request_topic_pattern: REQUEST_PATTERN.into(),
            ..InvokerOptions::default()
        },
        JsonCodec::default(),
        JsonCodec::default(),
    )
    .context("failed to build invoker")?;

    let backoff = ExponentialBackoff::new(RetryOptions {
        max_retries: 3,
        ..RetryOptions::default()
    });
    let timeout = Duration::from_millis(args.timeout_ms);

    for i in 1..=args.requests {
        let request = CommandRequest::new(Increment { by: i64::from(i) })
            .with_topic_token("executorId", "counter")
            .with_timeout(timeout)
            .idempotent(args.idempotent);
        let result = if args.idempotent {
            invoker.invoke_with_retry(request, &backoff).await
        } else {
            invoker.invoke(request).await
        };
        match result {
            Ok(response) => info!(request = i, value = response.payload.value, "increment answered"),
            Err(err) => warn!(request = i, kind = ?err.kind(), error = %err, "increment failed"),
        }
    }

    // One rejected call to show a remote application error.
    let rejected = invoker
        .invoke(
            CommandRequest::new(Increment { by: -1 })
                .with_topic_token("executorId", "counter")
                .with_timeout(timeout),
        )
        .await;
    if let Err(err) = rejected {
        info!(
            kind = ?err.kind(),
            remote = err.is_remote(),
            property = ?err.property_name(),
            "negative increment rejected"
        );
    }

    invoker.shutdown().await.context("failed to shut down invoker")?;
    executor.shutdown().await.context("failed to shut down executor")?;
    info!(total = total.load(Ordering::SeqCst), "command phase finished");
    Ok(())
}

async fn run_telemetry(broker: &MemoryBroker, readings: u32) -> anyhow::Result<()> {
    let receiver: TelemetryReceiver<Reading, _> = TelemetryReceiver::new(
        Arc::new(broker.client("dashboard")),
        SharedHlc::new("dashboard"),
        ReceiverOptions {
            telemetry_name: "temperature".into(),
            topic_pattern: TELEMETRY_PATTERN.into(),
            ..ReceiverOptions::default()
        },
        JsonCodec::default(),
    )
    .context("failed to build telemetry receiver")?;
    receiver.start().await.context("failed to subscribe telemetry receiver")?;

    let transport: Arc<dyn PubSubTransport> = Arc::new(broker.client("thermometer"));
    let sender = TelemetrySender::new(
        transport,
        SharedHlc::new("thermometer"),
        SenderOptions {
            telemetry_name: "temperature".into(),
            topic_pattern: TELEMETRY_PATTERN.into(),
            ..SenderOptions::default()
        },
        JsonCodec::default(),
    )
    .context("failed to build telemetry sender")?;

    for sequence in 0..readings {
        let reading = Reading {
            sequence,
            celsius: 20.0 + f64::from(sequence) * 0.5,
        };
        sender
            .send(
                TelemetryMessage::new(reading).with_cloud_event(
                    CloudEvent::new("urn:courier:thermometer")
                        .with_type("reading")
                        .with_data_schema("schemas/reading.json"),
                ),
            )
            .await
            .context("failed to send telemetry")?;
    }

    for _ in 0..readings {
        let Ok(Some(delivery)) = tokio::time::timeout(Duration::from_secs(1), receiver.recv()).await
        else {
            warn!("telemetry stream ended early");
            break;
        };
        match delivery {
            Ok(delivery) => info!(
                sender = ?delivery.sender_id,
                sequence = delivery.payload.sequence,
                celsius = delivery.payload.celsius,
                event_id = ?delivery.cloud_event.as_ref().and_then(|e| e.id.as_deref()),
                "telemetry received"
            ),
            Err(err) => warn!(error = %err, "telemetry rejected"),
        }
    }

    receiver.shutdown().await.context("failed to shut down telemetry receiver")?;
    Ok(())
}
