// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Publishes events to the main exchange on a channel in publisher-confirm
//! mode. Each publish is mandatory and waits for the broker confirmation, so
//! a successful return means the broker took responsibility for the message.
//! Messages the broker could not route come back with the confirmation and
//! are logged by a background drain tied to the channel.
//!
//! Publishes on one publisher are serialized: the channel slot is held for
//! the whole publish-and-confirm exchange.

use crate::{
    channel::{discard_channel, open_channel, watch_channel, ChannelSlot, Generational, ManagedChannel},
    config::RabbitMqConfig,
    connection::ConnectionProvider,
    errors::AmqpError,
    events::{Event, OutboundMessage},
    exchange::ExchangeDefinition,
    topology::declare_exchange,
};
use lapin::{
    message::BasicReturnMessage,
    options::{BasicPublishOptions, ConfirmSelectOptions},
    publisher_confirm::Confirmation,
    Channel,
};
use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const OWNER: &str = "publisher";

struct PublisherChannel {
    managed: ManagedChannel,
    returns: mpsc::UnboundedSender<BasicReturnMessage>,
}

impl Generational for PublisherChannel {
    fn generation(&self) -> u64 {
        self.managed.generation()
    }
}

/// Confirmed publisher of events to the main exchange.
pub struct Publisher {
    provider: ConnectionProvider,
    exchange: ExchangeDefinition,
    timeout: Duration,
    channel: ChannelSlot<PublisherChannel>,
    generations: AtomicU64,
}

impl Publisher {
    /// Creates a publisher writing to `cfg.exchange`. No channel is opened
    /// until [`Publisher::initialize`] or the first publish.
    pub fn new(provider: ConnectionProvider, cfg: &RabbitMqConfig) -> Publisher {
        Publisher {
            provider,
            exchange: ExchangeDefinition::new(&cfg.exchange),
            timeout: cfg.publish_confirm_timeout(),
            channel: Arc::new(Mutex::new(None)),
            generations: AtomicU64::new(0),
        }
    }

    /// Opens a confirm-mode channel and declares the exchange. Does nothing
    /// when an open channel is already held.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<(), AmqpError> {
        let mut slot = self.channel.lock().await;
        self.ensure_channel(&mut slot, cancel).await.map(|_| ())
    }

    /// Publishes `event` with `routing_key` and waits for the broker
    /// confirmation. Nothing is retried here; retrying is up to the caller.
    pub async fn publish<E: Event>(
        &self,
        cancel: &CancellationToken,
        routing_key: &str,
        event: &E,
    ) -> Result<(), AmqpError> {
        let mut slot = self.channel.lock().await;
        let current = self.ensure_channel(&mut slot, cancel).await?;

        let msg = OutboundMessage::new(routing_key, event)?;

        let confirm = match current
            .managed
            .channel
            .basic_publish(
                self.exchange.name(),
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    immediate: false,
                },
                &msg.payload,
                msg.properties(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange = self.exchange.name(),
                    routing_key,
                    "error publishing message"
                );
                return Err(AmqpError::PublishingError(err.to_string()));
            }
            Ok(confirm) => confirm,
        };

        if let Some(returned) = await_confirmation(confirm, self.timeout, cancel).await? {
            let _ = current.returns.send(*returned);
        }

        debug!(
            exchange = self.exchange.name(),
            routing_key,
            event_type = msg.event_type,
            message_id = msg.message_id,
            "message published and confirmed"
        );

        Ok(())
    }

    /// Closes the channel if open.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let current = self.channel.lock().await.take();
        match current {
            Some(current) => current.managed.close(OWNER).await,
            None => Ok(()),
        }
    }

    async fn ensure_channel<'s>(
        &self,
        slot: &'s mut Option<PublisherChannel>,
        cancel: &CancellationToken,
    ) -> Result<&'s PublisherChannel, AmqpError> {
        let usable = slot.as_ref().map(|c| c.managed.is_open()).unwrap_or(false);

        if !usable {
            if let Some(stale) = slot.take() {
                let _ = stale.managed.close(OWNER).await;
            }

            let current = self.open(cancel).await?;
            watch_channel(OWNER, &current.managed, &self.channel);
            *slot = Some(current);
        }

        slot.as_ref().ok_or(AmqpError::InternalError)
    }

    async fn open(&self, cancel: &CancellationToken) -> Result<PublisherChannel, AmqpError> {
        let channel = open_channel(&self.provider, cancel).await?;

        if let Err(err) = self.declare(&channel).await {
            discard_channel(OWNER, &channel).await;
            return Err(err);
        }

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let managed = ManagedChannel::new(channel, generation);
        let returns = drain_returns(managed.supervisor());

        info!(
            exchange = self.exchange.name(),
            generation, "publisher channel initialized"
        );

        Ok(PublisherChannel { managed, returns })
    }

    async fn declare(&self, channel: &Channel) -> Result<(), AmqpError> {
        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
        {
            error!(error = err.to_string(), "failure to put channel in confirm mode");
            return Err(AmqpError::ConfirmSelectError(err.to_string()));
        }

        declare_exchange(channel, &self.exchange).await
    }
}

/// Waits for the broker confirmation of one publish. A returned (unroutable)
/// message is handed back alongside a positive confirmation.
pub(crate) async fn await_confirmation<F>(
    confirm: F,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Option<Box<BasicReturnMessage>>, AmqpError>
where
    F: Future<Output = Result<Confirmation, lapin::Error>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(AmqpError::Cancelled),
        result = tokio::time::timeout(timeout, confirm) => match result {
            Err(_) => {
                error!(timeout_ms = timeout.as_millis() as u64, "publisher confirmation timeout");
                Err(AmqpError::PublishConfirmTimeout(timeout))
            }
            Ok(Err(err)) => {
                error!(error = err.to_string(), "error waiting for publisher confirmation");
                Err(AmqpError::PublishingError(err.to_string()))
            }
            Ok(Ok(confirmation)) => interpret(confirmation),
        },
    }
}

fn interpret(confirmation: Confirmation) -> Result<Option<Box<BasicReturnMessage>>, AmqpError> {
    match confirmation {
        Confirmation::Ack(returned) => Ok(returned),
        Confirmation::Nack(_) => {
            error!("message not acknowledged by server");
            Err(AmqpError::PublishNotAcknowledged)
        }
        Confirmation::NotRequested => Err(AmqpError::ConfirmSelectError(
            "channel is not in confirm mode".to_owned(),
        )),
    }
}

/// Logs messages returned by the broker until `supervisor` is cancelled.
fn drain_returns(supervisor: CancellationToken) -> mpsc::UnboundedSender<BasicReturnMessage> {
    let (returns, mut returned) = mpsc::unbounded_channel::<BasicReturnMessage>();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = supervisor.cancelled() => break,
                msg = returned.recv() => match msg {
                    Some(msg) => warn!(
                        reply_code = msg.reply_code,
                        reply_text = msg.reply_text.as_str(),
                        exchange = msg.delivery.exchange.as_str(),
                        routing_key = msg.delivery.routing_key.as_str(),
                        body = %String::from_utf8_lossy(&msg.delivery.data),
                        "message returned by broker"
                    ),
                    None => break,
                },
            }
        }
        debug!("return drain stopped");
    });

    returns
}
