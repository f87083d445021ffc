// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Dispatcher
//!
//! Routes each delivery to the handler registered for the value of its
//! `__TypeId__` header. The dispatcher is itself a [`MessageHandler`], so it
//! plugs into [`crate::consumer::Consumer::start_consuming`] directly.
//!
//! A delivery without the header, or with a type nobody registered, is a
//! handler failure: it goes through the retry policy and ends up in the
//! dead-letter queue, where it can be inspected.

use crate::delivery::{HandlerError, InboundMessage, MessageHandler};
use async_trait::async_trait;
use lapin::message::Delivery;
use std::{collections::HashMap, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct EventDispatcher<D = Delivery>
where
    D: Send + Sync,
{
    handlers: HashMap<String, Arc<dyn MessageHandler<D>>>,
}

impl<D> Default for EventDispatcher<D>
where
    D: Send + Sync,
{
    fn default() -> Self {
        EventDispatcher {
            handlers: HashMap::default(),
        }
    }
}

impl<D> EventDispatcher<D>
where
    D: InboundMessage + Send + Sync,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `event_type`, replacing any previous one.
    pub fn register(mut self, event_type: &str, handler: Arc<dyn MessageHandler<D>>) -> Self {
        if self
            .handlers
            .insert(event_type.to_owned(), handler)
            .is_some()
        {
            warn!(event_type, "handler replaced");
        }
        self
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

#[async_trait]
impl<D> MessageHandler<D> for EventDispatcher<D>
where
    D: InboundMessage + Send + Sync,
{
    async fn handle(&self, cancel: &CancellationToken, delivery: &D) -> Result<(), HandlerError> {
        let Some(event_type) = delivery.event_type() else {
            warn!(
                message_id = delivery.message_id().unwrap_or_default(),
                "message missing type header"
            );
            return Err(HandlerError::MissingEventType);
        };

        let Some(handler) = self.handlers.get(&event_type) else {
            warn!(event_type, "unknown message type");
            return Err(HandlerError::UnknownEventType(event_type));
        };

        debug!(
            event_type,
            message_id = delivery.message_id().unwrap_or_default(),
            "dispatching message"
        );

        handler.handle(cancel, delivery).await
    }
}
