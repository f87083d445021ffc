// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! `ConnectionProvider` owns the single broker connection shared by the
//! publisher and the consumers. It dials with bounded retries, hands out the
//! live connection, watches for broker-side closure and re-dials in the
//! background when the connection is lost unexpectedly.
//!
//! The connection handle lives in one slot guarded by a read/write lock.
//! Readers take the read lock for the fast path; dialing happens only under
//! the write lock, so concurrent callers never start duplicate dial sequences.
//! Every successful dial bumps a generation counter and gets its own watcher
//! token, which lets a newer connection supersede the watcher of an older one.

use crate::{config::RabbitMqConfig, errors::AmqpError, retry::RetryPolicy};
use async_trait::async_trait;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Establishes new broker connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Performs a single dial attempt.
    async fn connect(&self) -> Result<Self::Connection, AmqpError>;
}

/// A live broker connection as seen by the provider.
#[async_trait]
pub trait BrokerConnection: Clone + Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Registers `notify` to receive the error that closes this connection
    /// without the provider asking for it.
    fn notify_close(&self, notify: mpsc::UnboundedSender<AmqpError>);

    async fn close(&self) -> Result<(), AmqpError>;
}

/// lapin-backed [`Connector`] dialing the configured broker URI.
pub struct AmqpConnector {
    uri: String,
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(cfg: &RabbitMqConfig) -> Self {
        AmqpConnector {
            uri: cfg.uri(),
            connection_name: cfg.connection_name.clone(),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Connection = AmqpConnection;

    async fn connect(&self) -> Result<AmqpConnection, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        match Connection::connect(&self.uri, options).await {
            Ok(conn) => {
                debug!("amqp connected");
                Ok(AmqpConnection {
                    inner: Arc::new(conn),
                })
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }
    }
}

/// Shared handle to a lapin connection.
#[derive(Clone)]
pub struct AmqpConnection {
    inner: Arc<Connection>,
}

impl AmqpConnection {
    /// Opens a new channel multiplexed over this connection.
    pub async fn create_channel(&self) -> Result<Channel, AmqpError> {
        debug!("creating amqp channel...");
        match self.inner.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(channel)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn notify_close(&self, notify: mpsc::UnboundedSender<AmqpError>) {
        self.inner.on_error(move |err| {
            let _ = notify.send(AmqpError::ConnectionError(err.to_string()));
        });
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.inner.close(200, "closing").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::ConnectionError(err.to_string())
        })
    }
}

struct ConnectionSlot<T> {
    current: Option<T>,
    generation: u64,
    last_error: Option<AmqpError>,
    watcher: Option<CancellationToken>,
    reconnect: CancellationToken,
}

struct ProviderInner<C: Connector> {
    connector: C,
    policy: RetryPolicy,
    retry_count: u32,
    /// Number of dial sequences that have finished, successfully or not.
    completed: AtomicU64,
    slot: RwLock<ConnectionSlot<C::Connection>>,
}

/// Owns the broker connection shared by every component of the crate.
pub struct ConnectionProvider<C: Connector = AmqpConnector> {
    inner: Arc<ProviderInner<C>>,
}

impl<C: Connector> Clone for ConnectionProvider<C> {
    fn clone(&self) -> Self {
        ConnectionProvider {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl ConnectionProvider<AmqpConnector> {
    pub fn new(cfg: &RabbitMqConfig) -> Self {
        Self::with_connector(AmqpConnector::new(cfg), cfg.retry_policy(), cfg.retry_count)
    }
}

impl<C: Connector> ConnectionProvider<C> {
    /// Builds a provider over any [`Connector`]. `retry_count` is the number
    /// of dial attempts per connect sequence (at least one is always made).
    pub fn with_connector(connector: C, policy: RetryPolicy, retry_count: u32) -> Self {
        ConnectionProvider {
            inner: Arc::new(ProviderInner {
                connector,
                policy,
                retry_count,
                completed: AtomicU64::new(0),
                slot: RwLock::new(ConnectionSlot {
                    current: None,
                    generation: 0,
                    last_error: None,
                    watcher: None,
                    reconnect: CancellationToken::new(),
                }),
            }),
        }
    }

    /// Dials the broker unless an open connection already exists.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), AmqpError> {
        let observed = self.inner.completed.load(Ordering::SeqCst);
        self.inner.connect(cancel, observed).await.map(|_| ())
    }

    /// Returns the live connection, dialing first if none is open.
    pub async fn get_connection(
        &self,
        cancel: &CancellationToken,
    ) -> Result<C::Connection, AmqpError> {
        let observed = self.inner.completed.load(Ordering::SeqCst);
        if let Some(conn) = self.inner.current(cancel).await? {
            return Ok(conn);
        }

        let conn = self.inner.connect(cancel, observed).await.map_err(|err| {
            warn!(error = err.to_string(), "failed to get or re-establish connection");
            err
        })?;

        if !conn.is_open() {
            return Err(AmqpError::ConnectionUnavailable);
        }

        Ok(conn)
    }

    /// Closes the connection if open. Closing does not trigger the
    /// background reconnect; the next `get_connection` dials again.
    pub async fn close(&self) -> Result<(), AmqpError> {
        let mut slot = self.inner.slot.write().await;

        std::mem::replace(&mut slot.reconnect, CancellationToken::new()).cancel();
        if let Some(watcher) = slot.watcher.take() {
            watcher.cancel();
        }

        match slot.current.take() {
            Some(conn) if conn.is_open() => {
                warn!("closing amqp connection");
                conn.close().await
            }
            _ => Ok(()),
        }
    }

    /// Generation of the current connection; incremented on every successful dial.
    pub async fn generation(&self) -> u64 {
        self.inner.slot.read().await.generation
    }
}

impl<C: Connector> ProviderInner<C> {
    async fn current(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<C::Connection>, AmqpError> {
        let slot = tokio::select! {
            _ = cancel.cancelled() => return Err(AmqpError::Cancelled),
            slot = self.slot.read() => slot,
        };
        Ok(slot.current.as_ref().filter(|conn| conn.is_open()).cloned())
    }

    /// Runs a dial sequence under the write lock. Callers that observed
    /// `observed` finished sequences before queueing on the lock and find a
    /// newer failed sequence get that sequence's error instead of dialing again.
    async fn connect(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        observed: u64,
    ) -> Result<C::Connection, AmqpError> {
        let mut slot = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("cancelled while waiting for the connection lock");
                return Err(AmqpError::Cancelled);
            }
            slot = self.slot.write() => slot,
        };

        if let Some(conn) = slot.current.as_ref().filter(|conn| conn.is_open()) {
            return Ok(conn.clone());
        }

        if self.completed.load(Ordering::SeqCst) != observed {
            if let Some(err) = slot.last_error.clone() {
                return Err(err);
            }
        }

        let result = self.dial(cancel).await;
        self.completed.fetch_add(1, Ordering::SeqCst);

        match result {
            Ok(conn) => {
                slot.generation += 1;
                if let Some(previous) = slot.watcher.take() {
                    previous.cancel();
                }

                let watcher = CancellationToken::new();
                self.watch(conn.clone(), slot.generation, watcher.clone());

                slot.watcher = Some(watcher);
                slot.current = Some(conn.clone());
                slot.last_error = None;

                info!(generation = slot.generation, "amqp connection established");
                Ok(conn)
            }
            Err(AmqpError::Cancelled) => {
                slot.last_error = None;
                Err(AmqpError::Cancelled)
            }
            Err(err) => {
                slot.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    async fn dial(&self, cancel: &CancellationToken) -> Result<C::Connection, AmqpError> {
        let attempts = self.retry_count.max(1);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(AmqpError::Cancelled);
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(AmqpError::Cancelled),
                result = self.connector.connect() => result,
            };

            let err = match result {
                Ok(conn) => return Ok(conn),
                Err(err) => err,
            };

            if attempt >= attempts {
                error!(
                    attempts,
                    error = err.to_string(),
                    "failure to connect, retries exhausted"
                );
                return Err(AmqpError::ConnectionError(format!(
                    "failed to connect after {attempts} attempts: {err}"
                )));
            }

            let delay = self.policy.backoff(attempt);
            warn!(
                attempt,
                attempts,
                error = err.to_string(),
                delay_ms = delay.as_millis() as u64,
                "failure to connect, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(AmqpError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
        }
    }

    fn watch(self: &Arc<Self>, conn: C::Connection, generation: u64, token: CancellationToken) {
        let (notify, mut closed) = mpsc::unbounded_channel();
        conn.notify_close(notify);

        let provider = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(generation, "connection watcher stopped");
                }
                reason = closed.recv() => {
                    let Some(provider) = provider.upgrade() else { return };
                    match reason {
                        Some(err) => {
                            error!(generation, error = err.to_string(), "connection closed with error");
                            if let Some(reconnect) = provider.invalidate(generation).await {
                                Self::reconnect_in_background(Arc::downgrade(&provider), reconnect);
                            }
                        }
                        None => {
                            warn!(generation, "connection closed gracefully");
                            provider.invalidate(generation).await;
                        }
                    }
                }
            }
        });
    }

    /// Drops the connection of `generation` if it is still the current one
    /// and returns the token that scopes background reconnects.
    async fn invalidate(&self, generation: u64) -> Option<CancellationToken> {
        let mut slot = self.slot.write().await;
        if slot.generation != generation || slot.current.is_none() {
            debug!(generation, "stale connection watcher, ignoring");
            return None;
        }

        slot.current = None;
        slot.watcher = None;
        Some(slot.reconnect.clone())
    }

    fn reconnect_in_background(provider: Weak<Self>, token: CancellationToken) {
        tokio::spawn(async move {
            let mut round: u64 = 0;
            loop {
                let Some(inner) = provider.upgrade() else { return };

                let observed = inner.completed.load(Ordering::SeqCst);
                match inner.connect(&token, observed).await {
                    Ok(_) => {
                        info!(round, "amqp connection re-established");
                        return;
                    }
                    Err(AmqpError::Cancelled) => {
                        debug!("background reconnect cancelled");
                        return;
                    }
                    Err(err) => {
                        round += 1;
                        warn!(round, error = err.to_string(), "rabbitmq connection lost, retrying");
                    }
                }

                let delay = inner.policy.max_delay();
                drop(inner);

                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize},
        Mutex,
    };
    use std::time::Duration;

    #[derive(Clone)]
    struct FakeConnection {
        id: usize,
        open: Arc<AtomicBool>,
        notify: Arc<Mutex<Option<mpsc::UnboundedSender<AmqpError>>>>,
    }

    impl FakeConnection {
        fn new(id: usize) -> Self {
            FakeConnection {
                id,
                open: Arc::new(AtomicBool::new(true)),
                notify: Arc::new(Mutex::new(None)),
            }
        }

        fn fail(&self, reason: &str) {
            self.open.store(false, Ordering::SeqCst);
            if let Some(notify) = self.notify.lock().unwrap().take() {
                let _ = notify.send(AmqpError::ConnectionError(reason.to_owned()));
            }
        }
    }

    #[async_trait]
    impl BrokerConnection for FakeConnection {
        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }

        fn notify_close(&self, notify: mpsc::UnboundedSender<AmqpError>) {
            *self.notify.lock().unwrap() = Some(notify);
        }

        async fn close(&self) -> Result<(), AmqpError> {
            self.open.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeConnector {
        dials: Arc<AtomicUsize>,
        failures: usize,
        latency: Duration,
        last: Arc<Mutex<Option<FakeConnection>>>,
    }

    impl FakeConnector {
        fn new(failures: usize, latency: Duration) -> Self {
            FakeConnector {
                dials: Arc::new(AtomicUsize::new(0)),
                failures,
                latency,
                last: Arc::new(Mutex::new(None)),
            }
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        type Connection = FakeConnection;

        async fn connect(&self) -> Result<FakeConnection, AmqpError> {
            tokio::time::sleep(self.latency).await;
            let n = self.dials.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(AmqpError::ConnectionError(format!("dial {n} refused")));
            }

            let conn = FakeConnection::new(n);
            *self.last.lock().unwrap() = Some(conn.clone());
            Ok(conn)
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(1000), 2.0)
    }

    fn provider(
        failures: usize,
        latency: Duration,
        retry_count: u32,
    ) -> (
        ConnectionProvider<FakeConnector>,
        Arc<AtomicUsize>,
        Arc<Mutex<Option<FakeConnection>>>,
    ) {
        let connector = FakeConnector::new(failures, latency);
        let dials = Arc::clone(&connector.dials);
        let last = Arc::clone(&connector.last);
        (
            ConnectionProvider::with_connector(connector, policy(), retry_count),
            dials,
            last,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let (provider, dials, _) = provider(0, Duration::ZERO, 3);
        let cancel = CancellationToken::new();

        provider.connect(&cancel).await.unwrap();
        provider.connect(&cancel).await.unwrap();
        let conn = provider.get_connection(&cancel).await.unwrap();

        assert_eq!(dials.load(Ordering::SeqCst), 1);
        assert_eq!(conn.id, 0);
        assert_eq!(provider.generation().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_dial_failures_are_retried() {
        let (provider, dials, _) = provider(2, Duration::ZERO, 3);

        let conn = provider
            .get_connection(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(dials.load(Ordering::SeqCst), 3);
        assert_eq!(conn.id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_returns_last_dial_error() {
        let (provider, dials, _) = provider(usize::MAX, Duration::ZERO, 3);

        let err = provider
            .connect(&CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(dials.load(Ordering::SeqCst), 3);
        match err {
            AmqpError::ConnectionError(msg) => {
                assert!(msg.contains("after 3 attempts"), "{msg}");
                assert!(msg.contains("dial 2 refused"), "{msg}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retry_count_still_dials_once() {
        let (provider, dials, _) = provider(0, Duration::ZERO, 0);
        provider.connect(&CancellationToken::new()).await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_aborts_the_retry_loop() {
        let (provider, dials, _) = provider(usize::MAX, Duration::ZERO, 10);
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let err = provider.connect(&cancel).await.unwrap_err();

        assert_eq!(err, AmqpError::Cancelled);
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_dial() {
        let (provider, dials, _) = provider(0, Duration::from_millis(50), 3);

        let mut callers = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            callers.push(tokio::spawn(async move {
                provider
                    .get_connection(&CancellationToken::new())
                    .await
                    .map(|conn| conn.id)
            }));
        }

        for caller in callers {
            assert_eq!(caller.await.unwrap(), Ok(0));
        }
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_does_not_wait_for_running_dial() {
        let (provider, dials, _) = provider(0, Duration::from_secs(60), 3);

        let dialing = tokio::spawn({
            let provider = provider.clone();
            async move {
                provider
                    .get_connection(&CancellationToken::new())
                    .await
                    .map(|conn| conn.id)
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let started = tokio::time::Instant::now();
        assert_eq!(
            provider.get_connection(&cancel).await.map(|conn| conn.id),
            Err(AmqpError::Cancelled)
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!dialing.is_finished());

        assert_eq!(dialing.await.unwrap(), Ok(0));
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_failure() {
        let (provider, dials, _) = provider(usize::MAX, Duration::from_millis(50), 2);

        let mut callers = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            callers.push(tokio::spawn(async move {
                provider
                    .get_connection(&CancellationToken::new())
                    .await
                    .map(|conn| conn.id)
            }));
        }

        let mut errors = Vec::new();
        for caller in callers {
            errors.push(caller.await.unwrap().unwrap_err());
        }

        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert!(errors.iter().all(|err| *err == errors[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn unexpected_close_reconnects_in_background() {
        let (provider, dials, last) = provider(0, Duration::ZERO, 3);
        provider.connect(&CancellationToken::new()).await.unwrap();

        let first = last.lock().unwrap().clone().unwrap();
        first.fail("connection reset by peer");

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_eq!(provider.generation().await, 2);

        let conn = provider
            .get_connection(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(conn.id, 1);
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_close_waits_for_next_access() {
        let (provider, dials, _) = provider(0, Duration::ZERO, 3);
        let cancel = CancellationToken::new();
        provider.connect(&cancel).await.unwrap();

        provider.close().await.unwrap();
        provider.close().await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(dials.load(Ordering::SeqCst), 1);

        let conn = provider.get_connection(&cancel).await.unwrap();
        assert_eq!(conn.id, 1);
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_watcher_does_not_drop_newer_connection() {
        let (provider, dials, last) = provider(0, Duration::ZERO, 3);
        let cancel = CancellationToken::new();
        provider.connect(&cancel).await.unwrap();
        let first = last.lock().unwrap().clone().unwrap();

        first.open.store(false, Ordering::SeqCst);
        provider.get_connection(&cancel).await.unwrap();
        assert_eq!(provider.generation().await, 2);

        first.fail("late close notification");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(dials.load(Ordering::SeqCst), 2);
        assert_eq!(provider.get_connection(&cancel).await.unwrap().id, 1);
    }
}
