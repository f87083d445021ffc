// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Ownership
//!
//! Each component (publisher, consumer, dead-letter consumer) owns exactly one
//! channel at a time. A channel is never repaired: when the broker closes it,
//! the owner's slot is emptied and the next access opens a fresh one.
//!
//! Every opened channel carries a generation number and a supervisor token.
//! Background tasks tied to that channel (close watcher, return drain) stop
//! when the token is cancelled, and a watcher only clears the slot if the
//! slot still holds its own generation.

use crate::{
    connection::{BrokerConnection, ConnectionProvider},
    errors::AmqpError,
};
use lapin::{options::BasicCancelOptions, Channel};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Slot holding the channel currently owned by a component.
pub(crate) type ChannelSlot<T> = Arc<Mutex<Option<T>>>;

pub(crate) trait Generational {
    fn generation(&self) -> u64;
}

/// A channel together with the token scoping its background tasks.
pub(crate) struct ManagedChannel {
    pub(crate) channel: Channel,
    generation: u64,
    supervisor: CancellationToken,
}

impl ManagedChannel {
    pub(crate) fn new(channel: Channel, generation: u64) -> Self {
        ManagedChannel {
            channel,
            generation,
            supervisor: CancellationToken::new(),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    pub(crate) fn supervisor(&self) -> CancellationToken {
        self.supervisor.clone()
    }

    /// Stops the background tasks of this channel and closes it if still open.
    pub(crate) async fn close(self, owner: &'static str) -> Result<(), AmqpError> {
        self.supervisor.cancel();

        if !self.is_open() {
            return Ok(());
        }

        debug!(owner, generation = self.generation, "closing channel");
        self.channel.close(200, "closing").await.map_err(|err| {
            error!(owner, error = err.to_string(), "failure to close the channel");
            AmqpError::ChannelError(err.to_string())
        })
    }
}

impl Generational for ManagedChannel {
    fn generation(&self) -> u64 {
        self.generation
    }
}

/// Opens a raw channel on the provider's live connection.
pub(crate) async fn open_channel(
    provider: &ConnectionProvider,
    cancel: &CancellationToken,
) -> Result<Channel, AmqpError> {
    let conn = provider.get_connection(cancel).await?;
    if !conn.is_open() {
        return Err(AmqpError::ConnectionUnavailable);
    }

    conn.create_channel().await
}

/// Closes a channel that failed its set-up, logging rather than surfacing
/// the close error so the set-up error reaches the caller.
pub(crate) async fn discard_channel(owner: &'static str, channel: &Channel) {
    if let Err(err) = channel.close(200, "setup failed").await {
        debug!(owner, error = err.to_string(), "failure to discard channel");
    }
}

/// Watches `managed` for a broker-side close and empties `slot` when it
/// happens, unless the slot has moved on to a newer generation.
pub(crate) fn watch_channel<T>(owner: &'static str, managed: &ManagedChannel, slot: &ChannelSlot<T>)
where
    T: Generational + Send + 'static,
{
    let (notify, mut closed) = mpsc::unbounded_channel::<String>();
    managed.channel.on_error(move |err| {
        let _ = notify.send(err.to_string());
    });

    let generation = managed.generation;
    let supervisor = managed.supervisor();
    let slot: Weak<Mutex<Option<T>>> = Arc::downgrade(slot);

    tokio::spawn(async move {
        tokio::select! {
            _ = supervisor.cancelled() => {
                debug!(owner, generation, "channel watcher stopped");
            }
            reason = closed.recv() => {
                let Some(slot) = slot.upgrade() else { return };
                let mut current = slot.lock().await;
                if current.as_ref().map(|c| c.generation()) == Some(generation) {
                    *current = None;
                    warn!(
                        owner,
                        generation,
                        reason = reason.unwrap_or_default(),
                        "channel closed"
                    );
                }
                supervisor.cancel();
            }
        }
    });
}

/// Cancels the broker-side consumer `tag`, if any, and closes the channel
/// held in `slot`.
pub(crate) async fn release_consumer(
    owner: &'static str,
    slot: &ChannelSlot<ManagedChannel>,
    tag: Option<&str>,
) -> Result<(), AmqpError> {
    let Some(managed) = slot.lock().await.take() else {
        return Ok(());
    };

    if let Some(tag) = tag.filter(|_| managed.is_open()) {
        match managed
            .channel
            .basic_cancel(tag, BasicCancelOptions { nowait: false })
            .await
        {
            Err(err) => warn!(owner, tag, error = err.to_string(), "failure to cancel consumer"),
            _ => debug!(owner, tag, "consumer cancelled"),
        }
    }

    managed.close(owner).await
}
