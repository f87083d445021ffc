// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Durable, concurrent, retrying consumption of one queue. The consumer owns
//! its channel, declares its topology on every channel it opens and feeds
//! deliveries to a pool of workers that apply the handler with bounded
//! retries. Deliveries that exhaust their retries are rejected without
//! requeue and reach the dead-letter queue through the queue arguments.

use crate::{
    channel::{
        discard_channel, open_channel, release_consumer, watch_channel, ChannelSlot,
        ManagedChannel,
    },
    config::RabbitMqConfig,
    connection::ConnectionProvider,
    delivery::MessageHandler,
    errors::AmqpError,
    topology::{set_prefetch, Topology},
    worker::{run_worker_pool, RetrySettings, ATTEMPT_TIMEOUT},
};
use futures_util::StreamExt;
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const OWNER: &str = "consumer";

/// How long `shutdown` waits for in-flight deliveries to settle.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);
/// Upper bound for cancelling the consumer tag and closing the channel.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct ConsumeSession {
    tag: String,
    stop: CancellationToken,
    finished: CancellationToken,
}

/// Ends a consume session when `start_consuming` returns or its future is
/// dropped, so a later call can start a new one.
struct SessionGuard<'a> {
    slot: &'a StdMutex<Option<ConsumeSession>>,
    session: ConsumeSession,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.session.stop.cancel();
        self.session.finished.cancel();

        let mut current = lock_session(self.slot);
        if current
            .as_ref()
            .is_some_and(|active| active.tag == self.session.tag)
        {
            *current = None;
        }
    }
}

fn lock_session(
    slot: &StdMutex<Option<ConsumeSession>>,
) -> MutexGuard<'_, Option<ConsumeSession>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Consumes one queue with a pool of retrying workers.
pub struct Consumer {
    provider: ConnectionProvider,
    topology: Topology,
    prefetch: u16,
    settings: RetrySettings,
    channel: ChannelSlot<ManagedChannel>,
    session: StdMutex<Option<ConsumeSession>>,
    generations: AtomicU64,
}

impl Consumer {
    /// The dead-letter exchange and message TTL fall back to the configured
    /// values when `topology` leaves them unset.
    pub fn new(provider: ConnectionProvider, cfg: &RabbitMqConfig, topology: Topology) -> Consumer {
        Consumer {
            provider,
            topology: topology.with_config(cfg),
            prefetch: cfg.prefetch_count,
            settings: RetrySettings {
                workers: cfg.concurrent_consumers,
                retry_count: cfg.retry_count,
                policy: cfg.retry_policy(),
                attempt_timeout: ATTEMPT_TIMEOUT,
            },
            channel: Arc::new(Mutex::new(None)),
            session: StdMutex::new(None),
            generations: AtomicU64::new(0),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn is_consuming(&self) -> bool {
        lock_session(&self.session).is_some()
    }

    /// Opens the channel, sets QoS and declares the topology. Does nothing
    /// when an open channel is already held.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<(), AmqpError> {
        let mut slot = self.channel.lock().await;
        self.ensure_channel(&mut slot, cancel).await.map(|_| ())
    }

    /// Consumes the queue until the delivery stream closes, `cancel` fires or
    /// [`Consumer::shutdown`] is called. Returns once every worker has exited.
    pub async fn start_consuming(
        &self,
        cancel: &CancellationToken,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), AmqpError> {
        let guard = {
            let mut current = lock_session(&self.session);
            if current.is_some() {
                return Err(AmqpError::AlreadyConsuming);
            }

            let session = ConsumeSession {
                tag: consumer_tag(self.topology.queue_name()),
                stop: CancellationToken::new(),
                finished: CancellationToken::new(),
            };
            *current = Some(session.clone());
            SessionGuard {
                slot: &self.session,
                session,
            }
        };

        self.consume(cancel, handler, &guard.session).await
    }

    async fn consume(
        &self,
        cancel: &CancellationToken,
        handler: Arc<dyn MessageHandler>,
        session: &ConsumeSession,
    ) -> Result<(), AmqpError> {
        let queue = self.topology.queue_name();

        let consumer = {
            let mut slot = self.channel.lock().await;
            let managed = self.ensure_channel(&mut slot, cancel).await?;

            match managed
                .channel
                .basic_consume(
                    queue,
                    &session.tag,
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
                    error!(error = err.to_string(), queue, "error to create the consumer");
                    Err(AmqpError::ConsumerDeclarationError(err.to_string()))
                }
                Ok(c) => Ok(c),
            }?
        };

        info!(
            queue,
            tag = session.tag,
            workers = self.settings.workers,
            "started consuming"
        );

        let deliveries =
            consumer.map(|result| result.map_err(|err| AmqpError::ConsumerError(err.to_string())));

        run_worker_pool(
            deliveries,
            handler,
            self.settings.clone(),
            cancel,
            &session.stop,
        )
        .await
    }

    /// Stops the workers, waits up to the grace period for them to settle,
    /// then cancels the consumer tag and closes the channel.
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), AmqpError> {
        let session = lock_session(&self.session).clone();

        if let Some(session) = &session {
            session.stop.cancel();

            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("shutdown cancelled during consumer shutdown");
                    return Err(AmqpError::Cancelled);
                }
                _ = session.finished.cancelled() => debug!("consumer workers stopped"),
                _ = tokio::time::sleep(SHUTDOWN_GRACE_PERIOD) => {
                    debug!("consumer shutdown grace period expired")
                }
            }
        }

        let tag = session.as_ref().map(|s| s.tag.as_str());
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, release_consumer(OWNER, &self.channel, tag))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!("shutdown timeout exceeded");
                Err(AmqpError::ShutdownTimeout)
            }
        }
    }

    /// Closes the channel if open.
    pub async fn close(&self) -> Result<(), AmqpError> {
        release_consumer(OWNER, &self.channel, None).await
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
        info!(
            queue = self.topology.queue_name(),
            generation, "consumer channel initialized"
        );

        Ok(ManagedChannel::new(channel, generation))
    }

    async fn declare(&self, channel: &Channel) -> Result<(), AmqpError> {
        set_prefetch(channel, self.prefetch).await?;
        self.topology.install(channel).await
    }
}

fn consumer_tag(queue: &str) -> String {
    format!("{}-{}", queue, Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        delivery::HandlerError,
        queue::{AMQP_HEADERS_DEAD_LETTER_EXCHANGE, AMQP_HEADERS_MESSAGE_TTL},
    };
    use async_trait::async_trait;
    use futures_util::FutureExt;
    use lapin::{
        message::Delivery,
        types::{AMQPValue, LongString},
    };
    use tokio::time::Instant;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        async fn handle(
            &self,
            _cancel: &CancellationToken,
            _delivery: &Delivery,
        ) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn consumer() -> Consumer {
        let cfg = RabbitMqConfig {
            prefetch_count: 25,
            concurrent_consumers: 4,
            retry_count: 5,
            ..RabbitMqConfig::default()
        };
        let provider = ConnectionProvider::new(&cfg);
        Consumer::new(
            provider,
            &cfg,
            Topology::new("platform-exchange", "scheduling-events-queue")
                .bind("payment.to.scheduling.#"),
        )
    }

    fn install_session(consumer: &Consumer) -> ConsumeSession {
        let session = ConsumeSession {
            tag: consumer_tag(consumer.topology.queue_name()),
            stop: CancellationToken::new(),
            finished: CancellationToken::new(),
        };
        *consumer.session.lock().unwrap() = Some(session.clone());
        session
    }

    #[test]
    fn settings_follow_configuration() {
        let consumer = consumer();
        assert_eq!(consumer.prefetch, 25);
        assert_eq!(consumer.settings.workers, 4);
        assert_eq!(consumer.settings.retry_count, 5);
        assert_eq!(consumer.settings.attempt_timeout, ATTEMPT_TIMEOUT);
    }

    #[test]
    fn consumer_tags_are_unique_per_queue() {
        let a = consumer_tag("scheduling-events-queue");
        let b = consumer_tag("scheduling-events-queue");
        assert!(a.starts_with("scheduling-events-queue-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn second_session_is_rejected() {
        let consumer = consumer();
        install_session(&consumer);

        let result = consumer
            .start_consuming(&CancellationToken::new(), Arc::new(Noop))
            .await;
        assert_eq!(result, Err(AmqpError::AlreadyConsuming));
        assert!(consumer.is_consuming());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_start_consuming_releases_the_session() {
        let consumer = consumer();

        // Holding the channel slot keeps the call pending before any broker I/O.
        let held = consumer.channel.lock().await;
        let pending = consumer
            .start_consuming(&CancellationToken::new(), Arc::new(Noop))
            .now_or_never();
        assert!(pending.is_none());
        drop(held);

        assert!(!consumer.is_consuming());

        let started = Instant::now();
        assert_eq!(consumer.shutdown(&CancellationToken::new()).await, Ok(()));
        assert!(started.elapsed() < SHUTDOWN_GRACE_PERIOD);
    }

    #[tokio::test]
    async fn session_guard_only_clears_its_own_session() {
        let consumer = consumer();
        let newer = install_session(&consumer);
        let stale = ConsumeSession {
            tag: consumer_tag(consumer.topology.queue_name()),
            stop: CancellationToken::new(),
            finished: CancellationToken::new(),
        };

        drop(SessionGuard {
            slot: &consumer.session,
            session: stale.clone(),
        });

        assert!(stale.finished.is_cancelled());
        assert!(stale.stop.is_cancelled());
        assert_eq!(
            consumer.session.lock().unwrap().as_ref().map(|s| s.tag.clone()),
            Some(newer.tag)
        );
    }

    #[test]
    fn configured_dead_letter_settings_reach_consumer_topology() {
        let cfg = RabbitMqConfig {
            exchange: "platform-exchange".to_owned(),
            dead_letter_exchange: "platform-dlx".to_owned(),
            message_ttl: 45_000,
            ..RabbitMqConfig::default()
        };
        let consumer = Consumer::new(
            ConnectionProvider::new(&cfg),
            &cfg,
            Topology::new("platform-exchange", "scheduling-events-queue"),
        );

        let args = consumer.topology().main_queue().arguments();
        assert_eq!(
            args.inner().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&AMQPValue::LongString(LongString::from("platform-dlx")))
        );
        assert_eq!(
            args.inner().get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongLongInt(45_000))
        );
    }

    #[tokio::test]
    async fn shutdown_without_session_or_channel_is_a_noop() {
        let consumer = consumer();
        assert_eq!(consumer.shutdown(&CancellationToken::new()).await, Ok(()));
        assert_eq!(consumer.close().await, Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_signals_workers_and_waits_for_them() {
        let consumer = consumer();
        let session = install_session(&consumer);

        let workers = tokio::spawn({
            let session = session.clone();
            async move {
                session.stop.cancelled().await;
                tokio::time::sleep(Duration::from_secs(1)).await;
                session.finished.cancel();
            }
        });

        let started = Instant::now();
        assert_eq!(consumer.shutdown(&CancellationToken::new()).await, Ok(()));
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < SHUTDOWN_GRACE_PERIOD);
        workers.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_gives_up_waiting_after_grace_period() {
        let consumer = consumer();
        let session = install_session(&consumer);

        let started = Instant::now();
        assert_eq!(consumer.shutdown(&CancellationToken::new()).await, Ok(()));
        assert!(started.elapsed() >= SHUTDOWN_GRACE_PERIOD);
        assert!(session.stop.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_shutdown_returns_early() {
        let consumer = consumer();
        install_session(&consumer);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(consumer.shutdown(&cancel).await, Err(AmqpError::Cancelled));
    }
}
