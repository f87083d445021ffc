// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Worker Pool
//!
//! N workers pull from one shared delivery stream. Each worker runs the
//! handler with a per-attempt timeout and retries failures with backoff until
//! the retry budget is spent, then nacks without requeue so the broker routes
//! the message to the dead-letter exchange. A delivery taken off the stream is
//! always terminated by the worker that took it, even when the pool stops.

use crate::{
    delivery::{Acknowledge, HandlerError, InboundMessage, MessageHandler},
    errors::AmqpError,
    otel,
    retry::RetryPolicy,
};
use futures_util::{Stream, StreamExt};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, sync::Arc, time::Duration};
use tokio::{sync::Mutex, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Deadline of a single handler invocation.
pub(crate) const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub(crate) struct RetrySettings {
    pub(crate) workers: usize,
    pub(crate) retry_count: u32,
    pub(crate) policy: RetryPolicy,
    pub(crate) attempt_timeout: Duration,
}

/// Terminal state of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Acked { attempts: u32 },
    DeadLettered { attempts: u32 },
    /// Cancellation or shutdown during a retry wait; the delivery was nacked.
    Interrupted { attempts: u32 },
}

/// Worker tasks of one pool. Dropping the set before the pool returns stops
/// the workers and detaches them, so each still terminates the delivery it
/// holds instead of being aborted mid-handler.
struct WorkerSet {
    tasks: JoinSet<Result<(), AmqpError>>,
    cancel: CancellationToken,
}

impl Drop for WorkerSet {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.tasks.detach_all();
    }
}

/// Runs the worker pool until a worker hits a closed stream, `cancel` fires
/// or `stop` is requested, and returns only after every worker has exited.
pub(crate) async fn run_worker_pool<S, D>(
    stream: S,
    handler: Arc<dyn MessageHandler<D>>,
    settings: RetrySettings,
    cancel: &CancellationToken,
    stop: &CancellationToken,
) -> Result<(), AmqpError>
where
    S: Stream<Item = Result<D, AmqpError>> + Send + Unpin + 'static,
    D: Acknowledge + InboundMessage + Send + Sync + 'static,
{
    let stream = Arc::new(Mutex::new(stream));
    let workers_cancel = cancel.child_token();
    let mut workers = WorkerSet {
        tasks: JoinSet::new(),
        cancel: workers_cancel.clone(),
    };

    for id in 0..settings.workers.max(1) {
        workers.tasks.spawn(worker(
            id,
            Arc::clone(&stream),
            Arc::clone(&handler),
            settings.clone(),
            workers_cancel.clone(),
            stop.clone(),
        ));
    }

    let mut result = tokio::select! {
        Some(joined) = workers.tasks.join_next() => match joined {
            Ok(result) => result,
            Err(err) => {
                error!(error = err.to_string(), "consumer worker panicked");
                Err(AmqpError::InternalError)
            }
        },
        _ = cancel.cancelled() => {
            debug!("all consumers stopping due to context cancellation");
            Err(AmqpError::Cancelled)
        }
        _ = stop.cancelled() => {
            debug!("all consumers stopping due to shutdown request");
            Ok(())
        }
    };

    workers_cancel.cancel();
    while let Some(joined) = workers.tasks.join_next().await {
        match joined {
            Ok(Err(err)) => debug!(error = err.to_string(), "consumer worker exited with error"),
            Err(err) => error!(error = err.to_string(), "consumer worker panicked"),
            _ => {}
        }
    }

    if result.is_ok() && cancel.is_cancelled() && !stop.is_cancelled() {
        result = Err(AmqpError::Cancelled);
    }

    if let Err(err) = &result {
        if *err != AmqpError::Cancelled {
            error!(error = err.to_string(), "consumer error");
        }
    }

    result
}

async fn worker<S, D>(
    id: usize,
    stream: Arc<Mutex<S>>,
    handler: Arc<dyn MessageHandler<D>>,
    settings: RetrySettings,
    cancel: CancellationToken,
    stop: CancellationToken,
) -> Result<(), AmqpError>
where
    S: Stream<Item = Result<D, AmqpError>> + Send + Unpin + 'static,
    D: Acknowledge + InboundMessage + Send + Sync + 'static,
{
    info!(worker = id, "starting consumer");

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(worker = id, "consumer stopping: context cancelled");
                return Ok(());
            }
            _ = stop.cancelled() => {
                debug!(worker = id, "consumer stopping: shutdown requested");
                return Ok(());
            }
            next = next_delivery(&stream) => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                warn!(worker = id, error = err.to_string(), "delivery stream failed");
                return Err(err);
            }
            None => {
                warn!(worker = id, "messages channel closed");
                return Err(AmqpError::ConsumerError(format!(
                    "consumer {id}: messages channel closed"
                )));
            }
        };

        match process_delivery(id, &delivery, handler.as_ref(), &settings, &cancel, &stop).await {
            Outcome::Interrupted { attempts } => {
                debug!(worker = id, attempts, "consumer stopping after interrupted delivery");
                return Ok(());
            }
            Outcome::Acked { attempts } | Outcome::DeadLettered { attempts } => {
                debug!(worker = id, attempts, "delivery settled")
            }
        }
    }
}

async fn next_delivery<S>(stream: &Mutex<S>) -> Option<S::Item>
where
    S: Stream + Unpin,
{
    stream.lock().await.next().await
}

/// Applies the handler to one delivery with bounded retries and terminates
/// the delivery exactly once.
pub(crate) async fn process_delivery<D>(
    worker: usize,
    delivery: &D,
    handler: &dyn MessageHandler<D>,
    settings: &RetrySettings,
    cancel: &CancellationToken,
    stop: &CancellationToken,
) -> Outcome
where
    D: Acknowledge + InboundMessage + Send + Sync,
{
    let message_id = delivery.message_id().unwrap_or_default().to_owned();
    let event_type = delivery.event_type().unwrap_or_default();
    let max_attempts = settings.retry_count + 1;

    let tracer = global::tracer("amqp consumer");
    let mut span = otel::new_span(delivery.headers(), &tracer, &event_type);

    let mut attempt: u32 = 0;
    loop {
        let attempt_cancel = cancel.child_token();
        let result = match tokio::time::timeout(
            settings.attempt_timeout,
            handler.handle(&attempt_cancel, delivery),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(HandlerError::Timeout(settings.attempt_timeout)),
        };
        attempt_cancel.cancel();

        let err = match result {
            Ok(()) => {
                match delivery.ack().await {
                    Err(err) => {
                        error!(
                            worker,
                            message_id,
                            error = err.to_string(),
                            "failed to ack message after successful processing"
                        );
                        span.record_error(&err);
                    }
                    _ => debug!(worker, message_id, "successfully processed and acked message"),
                }
                span.set_status(Status::Ok);
                return Outcome::Acked {
                    attempts: attempt + 1,
                };
            }
            Err(err) => err,
        };

        warn!(
            worker,
            message_id,
            attempt = attempt + 1,
            max_attempts,
            error = err.to_string(),
            "error processing message"
        );
        span.record_error(&err);

        if attempt >= settings.retry_count {
            error!(worker, message_id, "final attempt failed, nacking to dlq");
            reject(worker, &message_id, delivery).await;
            span.set_status(Status::Error {
                description: Cow::from("retries exhausted, message dead-lettered"),
            });
            return Outcome::DeadLettered {
                attempts: attempt + 1,
            };
        }

        let delay = settings.policy.backoff(attempt + 1);
        info!(
            worker,
            message_id,
            delay_ms = delay.as_millis() as u64,
            "retrying message"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(worker, message_id, "context cancelled during retry delay, nacking");
                reject(worker, &message_id, delivery).await;
                span.set_status(Status::Error {
                    description: Cow::from("cancelled during retry"),
                });
                return Outcome::Interrupted { attempts: attempt + 1 };
            }
            _ = stop.cancelled() => {
                warn!(worker, message_id, "shutdown requested during retry delay, nacking");
                reject(worker, &message_id, delivery).await;
                span.set_status(Status::Error {
                    description: Cow::from("shutdown during retry"),
                });
                return Outcome::Interrupted { attempts: attempt + 1 };
            }
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

async fn reject<D: Acknowledge>(worker: usize, message_id: &str, delivery: &D) {
    if let Err(err) = delivery.nack(false).await {
        error!(
            worker,
            message_id,
            error = err.to_string(),
            "failed to nack message"
        );
    }
}
