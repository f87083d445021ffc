// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Inbound Deliveries and Handlers
//!
//! The consumer only needs two things from a delivery: read access to its
//! payload and headers, and a way to terminate it. Both are traits so that the
//! retry machinery works the same over lapin deliveries and test doubles.

use crate::{errors::AmqpError, events::TYPE_ID_HEADER};
use async_trait::async_trait;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
    types::{AMQPValue, FieldTable},
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Terminates a delivery. Every delivery is acked or nacked exactly once.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Rejects the delivery. With `requeue == false` the broker routes it to
    /// the queue's dead-letter exchange.
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// Read access to an inbound message.
pub trait InboundMessage {
    fn payload(&self) -> &[u8];

    fn headers(&self) -> Option<&FieldTable>;

    fn message_id(&self) -> Option<&str>;

    fn correlation_id(&self) -> Option<&str>;

    /// Value of the `__TypeId__` discriminator header.
    fn event_type(&self) -> Option<String> {
        self.headers()
            .and_then(|headers| headers.inner().get(TYPE_ID_HEADER))
            .and_then(field_string)
    }
}

/// Reads a string-like AMQP field value.
pub(crate) fn field_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_owned()),
        _ => None,
    }
}

#[async_trait]
impl Acknowledge for Delivery {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

impl InboundMessage for Delivery {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    fn headers(&self) -> Option<&FieldTable> {
        self.properties.headers().as_ref()
    }

    fn message_id(&self) -> Option<&str> {
        self.properties.message_id().as_ref().map(|id| id.as_str())
    }

    fn correlation_id(&self) -> Option<&str> {
        self.properties
            .correlation_id()
            .as_ref()
            .map(|id| id.as_str())
    }
}

/// Failure reported by a message handler. Any error triggers the retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("message missing type header")]
    MissingEventType,

    #[error("unknown message type: {0}")]
    UnknownEventType(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        HandlerError::Failed(reason.to_string())
    }
}

/// Application logic applied to each consumed message. Implementations must
/// be idempotent: a message can be delivered and processed more than once.
#[async_trait]
pub trait MessageHandler<D = Delivery>: Send + Sync
where
    D: Send + Sync,
{
    /// Processes `delivery`. `cancel` fires when the attempt times out or the
    /// consumer stops.
    async fn handle(&self, cancel: &CancellationToken, delivery: &D) -> Result<(), HandlerError>;
}

/// Decodes the JSON payload of `delivery` into `T`.
pub fn decode<T, D>(delivery: &D) -> Result<T, HandlerError>
where
    T: DeserializeOwned,
    D: InboundMessage + ?Sized,
{
    serde_json::from_slice(delivery.payload()).map_err(|err| HandlerError::Decode(err.to_string()))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::events::TYPE_ID_HEADER;
    use lapin::types::{LongString, ShortString};
    use std::collections::BTreeMap;

    /// In-memory delivery whose termination is checked through a mock.
    pub(crate) struct TestDelivery {
        pub(crate) id: String,
        pub(crate) payload: Vec<u8>,
        pub(crate) headers: Option<FieldTable>,
        pub(crate) acker: MockAcknowledge,
    }

    impl TestDelivery {
        pub(crate) fn new(id: &str, payload: &[u8]) -> Self {
            TestDelivery {
                id: id.to_owned(),
                payload: payload.to_vec(),
                headers: None,
                acker: MockAcknowledge::new(),
            }
        }

        pub(crate) fn with_type(mut self, event_type: &str) -> Self {
            let mut headers = BTreeMap::new();
            headers.insert(
                ShortString::from(TYPE_ID_HEADER),
                AMQPValue::LongString(LongString::from(event_type)),
            );
            self.headers = Some(FieldTable::from(headers));
            self
        }

        pub(crate) fn with_headers(mut self, headers: FieldTable) -> Self {
            self.headers = Some(headers);
            self
        }
    }

    #[async_trait]
    impl Acknowledge for TestDelivery {
        async fn ack(&self) -> Result<(), AmqpError> {
            self.acker.ack().await
        }

        async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
            self.acker.nack(requeue).await
        }
    }

    impl InboundMessage for TestDelivery {
        fn payload(&self) -> &[u8] {
            &self.payload
        }

        fn headers(&self) -> Option<&FieldTable> {
            self.headers.as_ref()
        }

        fn message_id(&self) -> Option<&str> {
            Some(&self.id)
        }

        fn correlation_id(&self) -> Option<&str> {
            None
        }
    }
}
