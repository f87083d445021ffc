// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Event Envelope
//!
//! Outbound events are serialized to JSON and wrapped in an AMQP envelope
//! carrying the `__TypeId__` discriminator header consumers dispatch on, a
//! generated message id and correlation id, a timestamp and the persistent
//! delivery mode.

use crate::{errors::AmqpError, otel};
use chrono::{SecondsFormat, Utc};
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::error;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header carrying the event type consumers dispatch on
pub const TYPE_ID_HEADER: &str = "__TypeId__";
/// AMQP delivery mode of messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A domain event that can be published.
pub trait Event: Serialize + Send + Sync {
    /// Value of the type-discriminator header.
    fn event_type(&self) -> &str;
}

/// Common fields of every event exchanged between services.
///
/// Domain events embed it with `#[serde(flatten)]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseEvent {
    pub event_id: String,
    pub event_type: String,
    pub correlation_id: String,
    pub timestamp: String,
}

impl BaseEvent {
    pub fn new(event_type: &str) -> Self {
        BaseEvent {
            event_id: Uuid::new_v4().to_string(),
            event_type: event_type.to_owned(),
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

impl Event for BaseEvent {
    fn event_type(&self) -> &str {
        &self.event_type
    }
}

/// A message ready to be handed to the broker. Lives for one publish call.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub routing_key: String,
    pub event_type: String,
    pub message_id: String,
    pub correlation_id: String,
    pub timestamp: u64,
    pub payload: Vec<u8>,
    headers: BTreeMap<ShortString, AMQPValue>,
}

impl OutboundMessage {
    pub fn new<E: Event>(routing_key: &str, event: &E) -> Result<Self, AmqpError> {
        let payload = serde_json::to_vec(event).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize event");
            AmqpError::SerializationError(err.to_string())
        })?;

        let mut headers = BTreeMap::new();
        otel::inject_current(&mut headers);
        headers.insert(
            ShortString::from(TYPE_ID_HEADER),
            AMQPValue::LongString(LongString::from(event.event_type())),
        );

        let timestamp = u64::try_from(Utc::now().timestamp()).unwrap_or_default();

        Ok(OutboundMessage {
            routing_key: routing_key.to_owned(),
            event_type: event.event_type().to_owned(),
            message_id: Uuid::new_v4().to_string(),
            correlation_id: Uuid::new_v4().to_string(),
            timestamp,
            payload,
            headers,
        })
    }

    pub fn properties(&self) -> BasicProperties {
        BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_timestamp(self.timestamp)
            .with_message_id(ShortString::from(self.message_id.as_str()))
            .with_correlation_id(ShortString::from(self.correlation_id.as_str()))
            .with_headers(FieldTable::from(self.headers.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct BookingCompleted {
        #[serde(flatten)]
        base: BaseEvent,
        user_id: String,
        enrollment_id: i64,
    }

    impl Event for BookingCompleted {
        fn event_type(&self) -> &str {
            &self.base.event_type
        }
    }

    fn booking() -> BookingCompleted {
        BookingCompleted {
            base: BaseEvent::new("BOOKING_COMPLETED"),
            user_id: "user-1".to_owned(),
            enrollment_id: 42,
        }
    }

    #[test]
    fn base_event_serializes_camel_case() {
        let json = serde_json::to_value(BaseEvent::new("EVENT_SCHEDULED")).unwrap();
        assert_eq!(json["eventType"], "EVENT_SCHEDULED");
        assert!(json["eventId"].is_string());
        assert!(json["correlationId"].is_string());
        assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn envelope_carries_type_header_and_persistence() {
        let msg = OutboundMessage::new("scheduling.to.learning.booking.completed", &booking())
            .unwrap();
        let props = msg.properties();

        assert_eq!(msg.routing_key, "scheduling.to.learning.booking.completed");
        assert_eq!(*props.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));
        assert_eq!(
            props.content_type().as_ref().map(|c| c.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert_eq!(
            props.message_id().as_ref().map(|id| id.as_str()),
            Some(msg.message_id.as_str())
        );
        assert_ne!(msg.message_id, msg.correlation_id);
        assert_eq!(*props.timestamp(), Some(msg.timestamp));
        assert!(Utc::now().timestamp().abs_diff(msg.timestamp as i64) <= 5);

        let headers = props.headers().clone().unwrap_or_default();
        assert_eq!(
            headers.inner().get(TYPE_ID_HEADER),
            Some(&AMQPValue::LongString(LongString::from("BOOKING_COMPLETED")))
        );
    }

    #[test]
    fn payload_round_trips() {
        let event = booking();
        let msg = OutboundMessage::new("k", &event).unwrap();

        let decoded: BookingCompleted = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(decoded.base, event.base);
        assert_eq!(decoded.user_id, "user-1");
        assert_eq!(decoded.enrollment_id, 42);
    }

    #[test]
    fn every_message_gets_fresh_ids() {
        let event = booking();
        let a = OutboundMessage::new("k", &event).unwrap();
        let b = OutboundMessage::new("k", &event).unwrap();
        assert_ne!(a.message_id, b.message_id);
        assert_ne!(a.correlation_id, b.correlation_id);
    }
}
