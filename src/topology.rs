// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Management
//!
//! `Topology` describes the exchanges, queues and bindings a consumer relies
//! on. It is immutable once built and is re-declared on every channel the
//! owning component opens; every declaration is idempotent on the broker side.

use crate::{
    config::RabbitMqConfig,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use lapin::{
    options::{BasicQosOptions, QueueBindOptions},
    types::FieldTable,
    Channel, ExchangeKind,
};
use std::collections::BTreeSet;
use tracing::{debug, error, warn};

/// Topology descriptor of one consumed queue and its dead-letter path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    exchange: String,
    queue: String,
    routing_patterns: BTreeSet<String>,
    dead_letter_exchange: Option<String>,
    dead_letter_queue: String,
    dead_letter_routing_key: String,
    message_ttl: Option<u32>,
}

/// TTL of the main queue when neither the builder nor the configuration set one.
pub const DEFAULT_MESSAGE_TTL: u32 = 30_000;

impl Topology {
    /// Starts a topology for `queue` bound to `exchange`. The dead-letter
    /// queue defaults to `<queue>-dlq` with routing key `dlq.<queue>`, and the
    /// dead-letter exchange to `<exchange>.dlx` unless set explicitly or
    /// through [`Topology::with_config`].
    pub fn new(exchange: &str, queue: &str) -> Topology {
        Topology {
            exchange: exchange.to_owned(),
            queue: queue.to_owned(),
            routing_patterns: BTreeSet::new(),
            dead_letter_exchange: None,
            dead_letter_queue: format!("{queue}-dlq"),
            dead_letter_routing_key: format!("dlq.{queue}"),
            message_ttl: None,
        }
    }

    /// Topology for `queue` on the configured exchange, dead-letter exchange
    /// and message TTL.
    pub fn from_config(cfg: &RabbitMqConfig, queue: &str) -> Topology {
        Topology::new(&cfg.exchange, queue).with_config(cfg)
    }

    /// Fills the dead-letter exchange and TTL from `cfg` where the builder
    /// left them unset. An empty configured exchange name is ignored.
    pub fn with_config(mut self, cfg: &RabbitMqConfig) -> Self {
        if self.dead_letter_exchange.is_none() && !cfg.dead_letter_exchange.is_empty() {
            self.dead_letter_exchange = Some(cfg.dead_letter_exchange.clone());
        }
        if self.message_ttl.is_none() {
            self.message_ttl = Some(cfg.message_ttl);
        }
        self
    }

    /// Adds a topic pattern the main queue is bound with.
    pub fn bind(mut self, pattern: &str) -> Self {
        self.routing_patterns.insert(pattern.to_owned());
        self
    }

    pub fn dead_letter_exchange(mut self, exchange: &str) -> Self {
        self.dead_letter_exchange = Some(exchange.to_owned());
        self
    }

    pub fn dead_letter_queue(mut self, queue: &str, routing_key: &str) -> Self {
        self.dead_letter_queue = queue.to_owned();
        self.dead_letter_routing_key = routing_key.to_owned();
        self
    }

    pub fn message_ttl(mut self, ttl_ms: u32) -> Self {
        self.message_ttl = Some(ttl_ms);
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn routing_patterns(&self) -> impl Iterator<Item = &str> {
        self.routing_patterns.iter().map(String::as_str)
    }

    pub fn exchange(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.exchange)
    }

    fn dead_letter_exchange_name(&self) -> String {
        match &self.dead_letter_exchange {
            Some(name) => name.clone(),
            None => format!("{}.dlx", self.exchange),
        }
    }

    pub fn dead_letter(&self) -> ExchangeDefinition {
        ExchangeDefinition::new(&self.dead_letter_exchange_name())
    }

    /// Main queue, carrying the dead-letter exchange, routing key and TTL.
    pub fn main_queue(&self) -> QueueDefinition {
        QueueDefinition::new(&self.queue)
            .dead_letter(
                &self.dead_letter_exchange_name(),
                &self.dead_letter_routing_key,
            )
            .ttl(self.message_ttl.unwrap_or(DEFAULT_MESSAGE_TTL))
    }

    pub fn dead_letter_queue_def(&self) -> QueueDefinition {
        QueueDefinition::new(&self.dead_letter_queue)
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.routing_patterns
            .iter()
            .map(|pattern| {
                QueueBinding::new(&self.queue)
                    .exchange(&self.exchange)
                    .routing_key(pattern)
            })
            .collect()
    }

    pub fn dead_letter_binding(&self) -> QueueBinding {
        QueueBinding::new(&self.dead_letter_queue)
            .exchange(&self.dead_letter_exchange_name())
            .routing_key(&self.dead_letter_routing_key)
    }

    /// Declares the dead-letter exchange and queue, then the main exchange,
    /// the main queue and its bindings.
    pub(crate) async fn install(&self, channel: &Channel) -> Result<(), AmqpError> {
        declare_exchange(channel, &self.dead_letter()).await?;
        declare_queue(channel, &self.dead_letter_queue_def()).await?;
        declare_exchange(channel, &self.exchange()).await?;
        declare_queue(channel, &self.main_queue()).await?;

        if self.routing_patterns.is_empty() {
            warn!(
                queue = self.queue,
                "no routing patterns provided, the queue will not receive messages"
            );
        }

        for binding in self.bindings() {
            bind_queue(channel, &binding).await?;
        }

        Ok(())
    }

    /// Declares only the dead-letter path and binds the dead-letter queue.
    pub(crate) async fn install_dead_letter(&self, channel: &Channel) -> Result<(), AmqpError> {
        declare_exchange(channel, &self.dead_letter()).await?;
        declare_queue(channel, &self.dead_letter_queue_def()).await?;
        bind_queue(channel, &self.dead_letter_binding()).await
    }
}

pub(crate) async fn set_prefetch(channel: &Channel, prefetch: u16) -> Result<(), AmqpError> {
    match channel
        .basic_qos(prefetch, BasicQosOptions { global: false })
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), prefetch, "failure to set qos");
            Err(AmqpError::QoSDeclarationError(err.to_string()))
        }
        _ => Ok(()),
    }
}

pub(crate) async fn declare_exchange(
    channel: &Channel,
    exch: &ExchangeDefinition,
) -> Result<(), AmqpError> {
    debug!("creating exchange: {}", exch.name);

    match channel
        .exchange_declare(
            &exch.name,
            ExchangeKind::Topic,
            exch.options(),
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(
                error = err.to_string(),
                name = exch.name,
                "error to declare the exchange"
            );
            Err(AmqpError::DeclareExchangeError(exch.name.clone()))
        }
        _ => {
            debug!("exchange: {} was created", exch.name);
            Ok(())
        }
    }
}

pub(crate) async fn declare_queue(channel: &Channel, def: &QueueDefinition) -> Result<(), AmqpError> {
    debug!("creating queue: {}", def.name);

    match channel
        .queue_declare(&def.name, def.options(), def.arguments())
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), name = def.name, "error to declare the queue");
            Err(AmqpError::DeclareQueueError(def.name.clone()))
        }
        _ => {
            debug!("queue: {} was created", def.name);
            Ok(())
        }
    }
}

pub(crate) async fn bind_queue(channel: &Channel, binding: &QueueBinding) -> Result<(), AmqpError> {
    debug!(
        "binding queue: {} to the exchange: {} with the key: {}",
        binding.queue_name, binding.exchange_name, binding.routing_key
    );

    match channel
        .queue_bind(
            &binding.queue_name,
            &binding.exchange_name,
            &binding.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
    {
        Err(err) => {
            error!(error = err.to_string(), "error to bind queue to exchange");
            Err(AmqpError::BindingExchangeToQueueError(
                binding.exchange_name.clone(),
                binding.queue_name.clone(),
                binding.routing_key.clone(),
            ))
        }
        _ => Ok(()),
    }
}
