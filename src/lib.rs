// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Reliability Layer
//!
//! Connection management, confirmed publishing and retrying consumption over
//! RabbitMQ. One [`ConnectionProvider`] is shared by a [`Publisher`], any
//! number of [`Consumer`]s and a [`DeadLetterConsumer`]; each component owns
//! its own channel and re-opens it when the broker closes it.

mod channel;
mod otel;
mod worker;

pub mod config;
pub mod connection;
pub mod consumer;
pub mod dead_letter;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod events;
pub mod exchange;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod topology;

pub use config::RabbitMqConfig;
pub use connection::ConnectionProvider;
pub use consumer::Consumer;
pub use dead_letter::{DeadLetter, DeadLetterConsumer, DeadLetterSink};
pub use delivery::{decode, HandlerError, MessageHandler};
pub use dispatcher::EventDispatcher;
pub use errors::AmqpError;
pub use events::{BaseEvent, Event};
pub use publisher::Publisher;
pub use retry::RetryPolicy;
pub use topology::Topology;
