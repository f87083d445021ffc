// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Dead Letter Consumer
//!
//! Terminal sink of the dead-letter queue. Every message that reaches it has
//! already exhausted its retries or expired, so it is only logged, handed to
//! an optional [`DeadLetterSink`] and acknowledged. Nothing here retries.

use crate::{
    channel::{
        discard_channel, open_channel, release_consumer, watch_channel, ChannelSlot,
        ManagedChannel,
    },
    config::RabbitMqConfig,
    connection::ConnectionProvider,
    delivery::{field_string, Acknowledge, InboundMessage},
    errors::AmqpError,
    topology::{set_prefetch, Topology},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::BasicConsumeOptions,
    types::{AMQPValue, FieldTable},
    Channel,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header the broker attaches to dead-lettered messages
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Count field of an x-death entry
pub const AMQP_HEADERS_COUNT: &str = "count";

const OWNER: &str = "dead_letter_consumer";
const DEAD_LETTER_PREFETCH: u16 = 1;

/// One entry of the broker's `x-death` header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeathRecord {
    pub count: i64,
    pub reason: String,
    pub queue: String,
    pub exchange: String,
    pub routing_keys: Vec<String>,
}

impl DeathRecord {
    fn from_table(table: &FieldTable) -> DeathRecord {
        let fields = table.inner();
        let text = |key: &str| fields.get(key).and_then(field_string).unwrap_or_default();

        DeathRecord {
            count: fields.get(AMQP_HEADERS_COUNT).and_then(field_int).unwrap_or_default(),
            reason: text("reason"),
            queue: text("queue"),
            exchange: text("exchange"),
            routing_keys: match fields.get("routing-keys") {
                Some(AMQPValue::FieldArray(keys)) => {
                    keys.as_slice().iter().filter_map(field_string).collect()
                }
                _ => Vec::new(),
            },
        }
    }
}

fn field_int(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        _ => None,
    }
}

/// Parses the `x-death` chain of a dead-lettered message, most recent first.
pub fn death_records(headers: Option<&FieldTable>) -> Vec<DeathRecord> {
    match headers.and_then(|h| h.inner().get(AMQP_HEADERS_X_DEATH)) {
        Some(AMQPValue::FieldArray(entries)) => entries
            .as_slice()
            .iter()
            .filter_map(|entry| match entry {
                AMQPValue::FieldTable(table) => Some(DeathRecord::from_table(table)),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Body of a dead letter: structured when it parses as JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum DeadLetterBody {
    Json(serde_json::Value),
    Raw(String),
}

impl DeadLetterBody {
    pub fn parse(payload: &[u8]) -> DeadLetterBody {
        match serde_json::from_slice(payload) {
            Ok(value) => DeadLetterBody::Json(value),
            Err(_) => DeadLetterBody::Raw(String::from_utf8_lossy(payload).into_owned()),
        }
    }
}

impl std::fmt::Display for DeadLetterBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterBody::Json(value) => write!(f, "{value}"),
            DeadLetterBody::Raw(raw) => f.write_str(raw),
        }
    }
}

/// A parsed dead-lettered message.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub event_type: Option<String>,
    pub deaths: Vec<DeathRecord>,
    pub body: DeadLetterBody,
}

impl DeadLetter {
    pub fn from_delivery<D: InboundMessage + ?Sized>(delivery: &D) -> DeadLetter {
        DeadLetter {
            message_id: delivery.message_id().map(str::to_owned),
            correlation_id: delivery.correlation_id().map(str::to_owned),
            event_type: delivery.event_type(),
            deaths: death_records(delivery.headers()),
            body: DeadLetterBody::parse(delivery.payload()),
        }
    }
}

/// Hook for persisting or alerting on dead letters. Called before the ack;
/// its failure is logged and does not prevent the ack.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: &DeadLetter) -> Result<(), AmqpError>;
}

/// Logs a dead letter, passes it to `sink` and acknowledges it.
pub(crate) async fn handle_dead_letter<D>(
    delivery: &D,
    sink: Option<&dyn DeadLetterSink>,
) -> Result<(), AmqpError>
where
    D: Acknowledge + InboundMessage + Send + Sync,
{
    let letter = DeadLetter::from_delivery(delivery);
    let message_id = letter.message_id.as_deref().unwrap_or_default();

    error!(
        message_id,
        correlation_id = letter.correlation_id.as_deref().unwrap_or_default(),
        event_type = letter.event_type.as_deref().unwrap_or_default(),
        "dead letter received"
    );

    if letter.deaths.is_empty() {
        warn!(message_id, "no x-death header found or header format incorrect");
    }
    for (i, death) in letter.deaths.iter().enumerate() {
        warn!(
            index = i,
            count = death.count,
            reason = death.reason,
            queue = death.queue,
            exchange = death.exchange,
            routing_keys = death.routing_keys.join(", "),
            "x-death"
        );
    }

    match &letter.body {
        DeadLetterBody::Json(_) => warn!(message_id, body = %letter.body, "dead letter body (parsed)"),
        DeadLetterBody::Raw(_) => warn!(message_id, body = %letter.body, "dead letter body (raw)"),
    }

    if let Some(sink) = sink {
        if let Err(err) = sink.record(&letter).await {
            error!(message_id, error = err.to_string(), "dead letter sink failed");
        }
    }

    delivery.ack().await
}

struct DeadLetterSession {
    tag: String,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Consumes the dead-letter queue of a [`Topology`].
pub struct DeadLetterConsumer {
    provider: ConnectionProvider,
    topology: Topology,
    sink: Option<Arc<dyn DeadLetterSink>>,
    channel: ChannelSlot<ManagedChannel>,
    session: Mutex<Option<DeadLetterSession>>,
    generations: AtomicU64,
}

impl DeadLetterConsumer {
    /// The dead-letter exchange falls back to the configured one when
    /// `topology` leaves it unset.
    pub fn new(
        provider: ConnectionProvider,
        cfg: &RabbitMqConfig,
        topology: Topology,
    ) -> DeadLetterConsumer {
        DeadLetterConsumer {
            provider,
            topology: topology.with_config(cfg),
            sink: None,
            channel: Arc::new(Mutex::new(None)),
            session: Mutex::new(None),
            generations: AtomicU64::new(0),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub async fn is_consuming(&self) -> bool {
        match self.session.lock().await.as_ref() {
            Some(session) => !session.task.is_finished(),
            None => false,
        }
    }

    /// Opens the channel with a prefetch of one and declares the dead-letter
    /// exchange, queue and binding. Does nothing when an open channel is held.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<(), AmqpError> {
        let mut slot = self.channel.lock().await;
        self.ensure_channel(&mut slot, cancel).await.map(|_| ())
    }

    /// Starts consuming in the background and returns once the broker-side
    /// consumer exists. The loop ends on `cancel`, on shutdown or when the
    /// delivery stream closes.
    pub async fn start_consuming(&self, cancel: &CancellationToken) -> Result<(), AmqpError> {
        let mut session = self.session.lock().await;
        if session.as_ref().is_some_and(|s| !s.task.is_finished()) {
            return Err(AmqpError::AlreadyConsuming);
        }

        let tag = format!("dlq-consumer-{}", Uuid::new_v4());
        let queue = self.topology.dead_letter_queue_def();

        let mut deliveries = {
            let mut slot = self.channel.lock().await;
            let managed = self.ensure_channel(&mut slot, cancel).await?;

            match managed
                .channel
                .basic_consume(
                    queue.name(),
                    &tag,
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: false,
                        exclusive: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "failure to create the dead letter consumer");
                    Err(AmqpError::ConsumerDeclarationError(err.to_string()))
                }
                Ok(c) => Ok(c),
            }?
        };

        info!(queue = queue.name(), tag, "dead letter consumer started");

        let stop = cancel.child_token();
        let sink = self.sink.clone();
        let task = tokio::spawn({
            let stop = stop.clone();
            let tag = tag.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => {
                            warn!(tag, "dead letter consumer stopping");
                            break;
                        }
                        next = deliveries.next() => match next {
                            Some(Ok(delivery)) => {
                                if let Err(err) = handle_dead_letter(&delivery, sink.as_deref()).await {
                                    error!(tag, error = err.to_string(), "failure to ack dead letter");
                                }
                            }
                            Some(Err(err)) => {
                                error!(tag, error = err.to_string(), "dead letter stream error")
                            }
                            None => {
                                error!(tag, "dead letter delivery stream closed unexpectedly");
                                break;
                            }
                        },
                    }
                }
            }
        });

        *session = Some(DeadLetterSession { tag, stop, task });
        Ok(())
    }

    /// Stops the background loop, cancels the consumer tag and closes the
    /// channel.
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), AmqpError> {
        let session = self.session.lock().await.take();

        let tag = match session {
            Some(session) => {
                session.stop.cancel();
                tokio::select! {
                    _ = cancel.cancelled() => return Err(AmqpError::Cancelled),
                    joined = session.task => {
                        if let Err(err) = joined {
                            error!(error = err.to_string(), "dead letter consumer task failed");
                        }
                    }
                }
                Some(session.tag)
            }
            None => None,
        };

        release_consumer(OWNER, &self.channel, tag.as_deref()).await
    }

    async fn ensure_channel<'s>(
        &self,
        slot: &'s mut Option<ManagedChannel>,
        cancel: &CancellationToken,
    ) -> Result<&'s ManagedChannel, AmqpError> {
        let usable = slot.as_ref().map(|c| c.is_open()).unwrap_or(false);

        if !usable {
            if let Some(stale) = slot.take() {
                let _ = stale.close(OWNER).await;
            }

            let managed = self.open(cancel).await?;
            watch_channel(OWNER, &managed, &self.channel);
            *slot = Some(managed);
        }

        slot.as_ref().ok_or(AmqpError::InternalError)
    }

    async fn open(&self, cancel: &CancellationToken) -> Result<ManagedChannel, AmqpError> {
        let channel = open_channel(&self.provider, cancel).await?;

        if let Err(err) = self.declare(&channel).await {
            discard_channel(OWNER, &channel).await;
            return Err(err);
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(generation, "dead letter channel initialized");

        Ok(ManagedChannel::new(channel, generation))
    }

    async fn declare(&self, channel: &Channel) -> Result<(), AmqpError> {
        set_prefetch(channel, DEAD_LETTER_PREFETCH).await?;
        self.topology.install_dead_letter(channel).await
    }
}
