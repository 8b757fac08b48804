//! WebSocket JSON-RPC provider with endpoint rotation, auto-reconnect and
//! resubscription.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::future::{self, FutureExt};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

use subrpc_core::codec::canonical_method;
use subrpc_core::events::ProviderEventData;
use subrpc_core::policy::BackoffPolicy;
use subrpc_core::provider::{attach_handler, subscription_key};
use subrpc_core::stats::{ActiveStats, EndpointStats, StatsRecorder};
use subrpc_core::{
    CallCache, EventHandler, HealthStatus, Inbound, ProviderEmitter, ProviderEvent,
    ProviderListener, ProviderStats, RpcCodec, RpcProvider, SubscriptionCallback, SubscriptionId,
    TransportError,
};

use crate::config::WsProviderConfig;
use crate::connector::{Connection, Connector, TungsteniteConnector};
use crate::subscriptions::{Activation, ResubscribeEntry, SubscriptionTable};

/// Subscriptions of this family watch a submitted extrinsic and are not
/// issued again after a reconnect.
const AUTHOR_PREFIX: &str = "author_";

type Outcome = Result<Value, TransportError>;

/// Lifecycle of the single logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Command sent from callers to the background connection task.
enum WsCommand {
    Send(String),
    Close,
}

struct SubscriptionContext {
    entry: ResubscribeEntry,
    /// Durable key this request re-issues after a reconnect.
    replaces: Option<String>,
}

struct PendingRequest {
    method: String,
    issued_at: Instant,
    tx: oneshot::Sender<Outcome>,
    subscription: Option<SubscriptionContext>,
}

struct State {
    status: ConnectionState,
    /// Connect attempts so far; attempt `k` uses endpoint `k mod N`.
    attempts: u64,
    endpoint_index: Option<usize>,
    /// Bumped on every successful open so a stale close is ignored.
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<WsCommand>>,
    pending: HashMap<u64, PendingRequest>,
    subscriptions: SubscriptionTable,
    stats: StatsRecorder,
    user_closed: bool,
    reconnecting: bool,
}

struct Inner {
    config: WsProviderConfig,
    connector: Arc<dyn Connector>,
    codec: RpcCodec,
    cache: Option<CallCache>,
    events: ProviderEmitter,
    backoff: Option<BackoffPolicy>,
    state: Mutex<State>,
}

/// WebSocket JSON-RPC provider.
///
/// A background task owns the socket for each connection. Callers talk to it
/// through a command channel and wait on per-request oneshot channels; the
/// task routes replies by id and notifications by `kind::subscription`.
/// When the connection drops every pending caller fails with
/// [`TransportError::Disconnected`], and unless the provider was closed on
/// purpose it reconnects to the next endpoint and issues every durable
/// subscription again.
pub struct WsProvider {
    inner: Arc<Inner>,
}

impl WsProvider {
    /// Build an unconnected provider using `tokio-tungstenite`.
    pub fn new(config: WsProviderConfig) -> Result<Self, TransportError> {
        Self::with_connector(config, Arc::new(TungsteniteConnector))
    }

    /// Build an unconnected provider over a custom socket connector.
    pub fn with_connector(
        config: WsProviderConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let cache = CallCache::with_capacity(config.cache_capacity, config.cache_ttl())?;
        let backoff = config.backoff();
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector,
                codec: RpcCodec::new(),
                cache,
                events: ProviderEmitter::new(),
                backoff,
                state: Mutex::new(State {
                    status: ConnectionState::Idle,
                    attempts: 0,
                    endpoint_index: None,
                    generation: 0,
                    outbound: None,
                    pending: HashMap::new(),
                    subscriptions: SubscriptionTable::new(),
                    stats: StatsRecorder::default(),
                    user_closed: false,
                    reconnecting: false,
                }),
            }),
        })
    }

    /// Build a provider and connect it.
    pub async fn open(config: WsProviderConfig) -> Result<Self, TransportError> {
        let provider = Self::new(config)?;
        provider.connect().await?;
        Ok(provider)
    }

    /// A fresh, unconnected provider with the same configuration.
    pub fn duplicate(&self) -> Result<Self, TransportError> {
        Self::with_connector(self.inner.config.clone(), self.inner.connector.clone())
    }

    pub fn config(&self) -> &WsProviderConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().status
    }

    /// Every configured endpoint, in rotation order.
    pub fn endpoints(&self) -> &[String] {
        &self.inner.config.endpoints
    }

    /// Counters for the current connection only.
    pub fn endpoint_stats(&self) -> EndpointStats {
        self.inner.lock().stats.endpoint()
    }

    /// Subscribe and receive notifications on a channel instead of a callback.
    pub async fn subscribe_stream(
        &self,
        kind: &str,
        method: &str,
        params: Vec<Value>,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<Outcome>), TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: SubscriptionCallback = Arc::new(move |outcome: Outcome| {
            let _ = tx.send(outcome);
        });
        let id = self.subscribe(kind, method, params, callback).await?;
        Ok((id, rx))
    }
}

impl Drop for WsProvider {
    fn drop(&mut self) {
        let outbound = match self.inner.state.lock() {
            Ok(mut state) => {
                state.user_closed = true;
                state.outbound.clone()
            }
            Err(_) => None,
        };
        if let Some(tx) = outbound {
            let _ = tx.send(WsCommand::Close);
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn record(&self, update: impl Fn(&mut EndpointStats)) {
        self.lock().stats.record(update);
    }

    /// Open the next endpoint in rotation. The caller has already moved the
    /// state to `Connecting`.
    async fn open_next(self: &Arc<Self>) -> Result<(), TransportError> {
        let endpoint = {
            let mut state = self.lock();
            let index = (state.attempts % self.config.endpoints.len() as u64) as usize;
            state.attempts += 1;
            state.endpoint_index = Some(index);
            self.config.endpoints[index].clone()
        };

        tracing::info!(endpoint = %endpoint, "connecting via WebSocket");
        let connection = match self.connector.open(&endpoint, &self.config.headers).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(endpoint = %endpoint, error = %e, "WS connect failed");
                self.lock().status = ConnectionState::Closed;
                self.events.emit(ProviderEvent::Error, &Some(e.clone()));
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let opened = {
            let mut state = self.lock();
            if state.user_closed {
                state.status = ConnectionState::Closed;
                None
            } else {
                state.generation += 1;
                state.status = ConnectionState::Open;
                state.outbound = Some(tx);
                state.reconnecting = false;
                state.stats.reset_endpoint();
                Some((state.generation, state.subscriptions.durable_count() > 0))
            }
        };
        let Some((generation, resubscribe)) = opened else {
            let Connection { mut sink, .. } = connection;
            let _ = sink.close().await;
            tracing::info!(endpoint = %endpoint, "closed while connecting");
            return Err(TransportError::disconnected("closed by client while connecting"));
        };

        tracing::info!(endpoint = %endpoint, generation, "WS connected");
        tokio::spawn(self.clone().run_connection(generation, connection, rx));
        self.events.emit(ProviderEvent::Connected, &None);
        if resubscribe {
            tokio::spawn(self.clone().resubscribe());
        }
        Ok(())
    }

    /// Own one connection until it closes.
    async fn run_connection(
        self: Arc<Self>,
        generation: u64,
        connection: Connection,
        mut commands: mpsc::UnboundedReceiver<WsCommand>,
    ) {
        let Connection {
            mut sink,
            mut stream,
        } = connection;
        let period = self.config.sweep_interval();
        let mut sweep = time::interval_at(Instant::now() + period, period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (reason, requested) = loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(WsCommand::Send(text)) => {
                        if let Err(e) = sink.send(text).await {
                            break (e.to_string(), false);
                        }
                    }
                    Some(WsCommand::Close) | None => {
                        let _ = sink.close().await;
                        break ("closed by client".to_string(), true);
                    }
                },
                msg = stream.next() => match msg {
                    Some(Ok(text)) => self.handle_message(generation, &text),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "WS receive error");
                        self.record(|s| s.errors += 1);
                        self.events.emit(ProviderEvent::Error, &Some(e));
                    }
                    None => break ("connection closed by remote".to_string(), false),
                },
                _ = sweep.tick() => self.sweep_stale(),
            }
        };

        self.on_closed(generation, &reason, requested);
    }

    /// Route one inbound message. Callbacks run after the state lock is
    /// released, the subscribing caller first, then parked notifications.
    fn handle_message(&self, generation: u64, raw: &str) {
        let inbound = match self.codec.decode(raw) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::debug!(error = %e, "dropping uncorrelatable message");
                self.record(|s| {
                    s.bytes_recv += raw.len() as u64;
                    s.errors += 1;
                });
                return;
            }
        };

        let mut reply: Option<(oneshot::Sender<Outcome>, Outcome)> = None;
        let mut deliveries: Vec<(SubscriptionCallback, Outcome)> = Vec::new();
        {
            let mut state = self.lock();
            if state.generation != generation || state.status != ConnectionState::Open {
                return;
            }
            state.stats.record(|s| s.bytes_recv += raw.len() as u64);

            match inbound {
                Inbound::Reply { id, outcome } => {
                    let Some(pending) = state.pending.remove(&id) else {
                        tracing::debug!(id, "dropping reply for unknown or expired request");
                        return;
                    };
                    if outcome.is_err() {
                        state.stats.record(|s| s.errors += 1);
                    }
                    let outcome = match (pending.subscription, outcome) {
                        (Some(ctx), Ok(value)) => match SubscriptionId::from_value(&value) {
                            Some(id) => {
                                let key = subscription_key(&ctx.entry.kind, &id);
                                let callback = ctx.entry.callback.clone();
                                match state.subscriptions.activate(
                                    key,
                                    ctx.entry,
                                    ctx.replaces.as_deref(),
                                ) {
                                    Activation::Live(parked) => {
                                        state.stats.record(|s| s.subscriptions += 1);
                                        deliveries.extend(
                                            parked.into_iter().map(|o| (callback.clone(), o)),
                                        );
                                    }
                                    Activation::Cancelled(unsubscribe) => {
                                        tracing::debug!(
                                            method = %pending.method,
                                            "subscription cancelled before it was re-established"
                                        );
                                        if let Some(unsubscribe) = unsubscribe {
                                            self.send_detached(
                                                &mut state,
                                                &unsubscribe,
                                                vec![id.to_value()],
                                            );
                                        }
                                    }
                                }
                                Ok(value)
                            }
                            None => Err(TransportError::Protocol(format!(
                                "{} returned {value} instead of a subscription id",
                                pending.method
                            ))),
                        },
                        (_, outcome) => outcome,
                    };
                    reply = Some((pending.tx, outcome));
                }
                Inbound::Notification {
                    method,
                    subscription,
                    outcome,
                } => {
                    let key = subscription_key(&method, &subscription);
                    if let Some(delivery) = state.subscriptions.route(&key, outcome) {
                        deliveries.push(delivery);
                    }
                }
            }
        }

        if let Some((tx, outcome)) = reply {
            let _ = tx.send(outcome);
        }
        for (callback, outcome) in deliveries {
            callback(outcome);
        }
    }

    /// Fail every pending request older than the configured timeout.
    fn sweep_stale(&self) {
        let timeout = self.config.timeout();
        let now = Instant::now();
        let expired: Vec<(u64, PendingRequest)> = {
            let mut state = self.lock();
            let ids: Vec<u64> = state
                .pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.issued_at) > timeout)
                .map(|(id, _)| *id)
                .collect();
            let expired: Vec<_> = ids
                .into_iter()
                .filter_map(|id| state.pending.remove(&id).map(|p| (id, p)))
                .collect();
            let count = expired.len() as u64;
            if count > 0 {
                state.stats.record(|s| s.timeout += count);
            }
            expired
        };

        for (id, pending) in expired {
            tracing::warn!(id, method = %pending.method, "request timed out");
            let _ = pending.tx.send(Err(TransportError::Timeout {
                ms: self.config.timeout_ms,
            }));
        }
    }

    /// Tear down after a close. Ignored unless `generation` is the live
    /// connection and it has not been torn down already.
    fn on_closed(self: &Arc<Self>, generation: u64, reason: &str, requested: bool) {
        let (failed, reconnect) = {
            let mut state = self.lock();
            if state.generation != generation
                || matches!(state.status, ConnectionState::Closed | ConnectionState::Idle)
            {
                return;
            }
            state.status = ConnectionState::Closed;
            state.outbound = None;
            let failed: Vec<oneshot::Sender<Outcome>> =
                state.pending.drain().map(|(_, p)| p.tx).collect();
            state.subscriptions.drop_live();
            state.stats.reset_endpoint();
            let reconnect = !state.user_closed && self.backoff.is_some() && !state.reconnecting;
            if reconnect {
                state.reconnecting = true;
            }
            (failed, reconnect)
        };

        if requested {
            tracing::info!(reason, failed = failed.len(), "WS disconnected");
        } else {
            tracing::warn!(reason, failed = failed.len(), "WS connection lost");
        }
        for tx in failed {
            let _ = tx.send(Err(TransportError::disconnected(reason)));
        }
        let payload: ProviderEventData =
            (!requested).then(|| TransportError::disconnected(reason));
        self.events.emit(ProviderEvent::Disconnected, &payload);

        if reconnect {
            tokio::spawn(self.clone().reconnect_loop());
        }
    }

    /// Retry the next endpoint after each backoff delay until one opens or
    /// the provider is closed on purpose.
    async fn reconnect_loop(self: Arc<Self>) {
        let Some(backoff) = self.backoff.clone() else {
            return;
        };
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let delay = backoff.next_delay(attempt);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "WS reconnecting");
            time::sleep(delay).await;

            {
                let mut state = self.lock();
                if state.user_closed || state.status != ConnectionState::Closed {
                    state.reconnecting = false;
                    return;
                }
                state.status = ConnectionState::Connecting;
            }

            match self.open_next().await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "WS reconnect failed");
                    let mut state = self.lock();
                    if state.user_closed {
                        state.reconnecting = false;
                        return;
                    }
                }
            }
        }
    }

    /// Issue every durable subscription again on the fresh connection.
    async fn resubscribe(self: Arc<Self>) {
        let snapshot = self.lock().subscriptions.resubscribe_snapshot();
        let mut calls = Vec::with_capacity(snapshot.len());
        for (key, entry) in snapshot {
            if entry.kind.starts_with(AUTHOR_PREFIX) {
                tracing::debug!(key = %key, "not resubscribing extrinsic watch");
                self.lock().subscriptions.forget(&key);
                continue;
            }
            let method = entry.method.clone();
            let params = entry.params.clone();
            let inner = self.clone();
            calls.push(async move {
                inner.record(|s| s.requests += 1);
                let result = inner
                    .dispatch(
                        &method,
                        params,
                        Some(SubscriptionContext {
                            entry,
                            replaces: Some(key.clone()),
                        }),
                    )
                    .await;
                if let Err(e) = result {
                    tracing::error!(key = %key, method = %method, error = %e, "resubscribe failed");
                }
            });
        }
        future::join_all(calls).await;
    }

    /// Write a request nobody waits on. Its reply, timeout or disconnect
    /// is dropped when it arrives.
    fn send_detached(&self, state: &mut State, method: &str, params: Vec<Value>) {
        let Some(outbound) = state.outbound.clone() else {
            return;
        };
        let (id, body) = match self.codec.encode(method, params) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(method, error = %e, "failed to encode request");
                return;
            }
        };
        let len = body.len() as u64;
        if outbound.send(WsCommand::Send(body)).is_err() {
            return;
        }
        let (tx, _) = oneshot::channel();
        state.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                issued_at: Instant::now(),
                tx,
                subscription: None,
            },
        );
        state.stats.record(|s| {
            s.requests += 1;
            s.bytes_sent += len;
        });
    }

    /// Write one request and wait for its correlated outcome.
    async fn dispatch(
        &self,
        method: &str,
        params: Vec<Value>,
        subscription: Option<SubscriptionContext>,
    ) -> Outcome {
        let (id, body) = self.codec.encode(method, params)?;
        let rx = {
            let mut state = self.lock();
            if state.status != ConnectionState::Open {
                return Err(TransportError::NotConnected);
            }
            let outbound = state.outbound.clone().ok_or(TransportError::NotConnected)?;
            let len = body.len() as u64;
            if outbound.send(WsCommand::Send(body)).is_err() {
                return Err(TransportError::NotConnected);
            }
            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                id,
                PendingRequest {
                    method: method.to_string(),
                    issued_at: Instant::now(),
                    tx,
                    subscription,
                },
            );
            state.stats.record(|s| s.bytes_sent += len);
            rx
        };
        rx.await
            .unwrap_or_else(|_| Err(TransportError::disconnected("request dropped")))
    }
}

#[async_trait]
impl RpcProvider for WsProvider {
    async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut state = self.inner.lock();
            if !matches!(state.status, ConnectionState::Idle | ConnectionState::Closed) {
                return Err(TransportError::InvalidState(
                    "WebSocket is already connecting or connected".into(),
                ));
            }
            state.status = ConnectionState::Connecting;
            state.user_closed = false;
        }

        let result = self.inner.open_next().await;
        if result.is_err() {
            let reconnect = {
                let mut state = self.inner.lock();
                let reconnect =
                    !state.user_closed && self.inner.backoff.is_some() && !state.reconnecting;
                if reconnect {
                    state.reconnecting = true;
                }
                reconnect
            };
            if reconnect {
                tokio::spawn(self.inner.clone().reconnect_loop());
            }
        }
        result
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let (generation, outbound) = {
            let mut state = self.inner.lock();
            state.user_closed = true;
            if state.status != ConnectionState::Open {
                return Ok(());
            }
            state.status = ConnectionState::Closing;
            (state.generation, state.outbound.take())
        };
        if let Some(tx) = outbound {
            let _ = tx.send(WsCommand::Close);
        }
        self.inner.on_closed(generation, "closed by client", true);
        Ok(())
    }

    async fn send(
        &self,
        method: &str,
        params: Vec<Value>,
        cacheable: bool,
    ) -> Result<Value, TransportError> {
        self.inner.record(|s| s.requests += 1);
        match &self.inner.cache {
            Some(cache) if cacheable => {
                let key = CallCache::key(method, &params);
                let inner = self.inner.clone();
                let method = method.to_string();
                let (outcome, hit) = cache.get_or_start(&key, move || {
                    async move { inner.dispatch(&method, params, None).await }.boxed()
                });
                if hit {
                    self.inner.record(|s| s.cached += 1);
                }
                cache.settle(&key, outcome).await
            }
            _ => self.inner.dispatch(method, params, None).await,
        }
    }

    async fn subscribe(
        &self,
        kind: &str,
        method: &str,
        params: Vec<Value>,
        callback: SubscriptionCallback,
    ) -> Result<SubscriptionId, TransportError> {
        self.inner.record(|s| s.requests += 1);
        let entry = ResubscribeEntry {
            kind: canonical_method(kind).to_string(),
            method: method.to_string(),
            params: params.clone(),
            callback,
        };
        let value = self
            .inner
            .dispatch(
                method,
                params,
                Some(SubscriptionContext {
                    entry,
                    replaces: None,
                }),
            )
            .await?;
        // the reply was validated as an id before it was handed back
        SubscriptionId::from_value(&value).ok_or_else(|| {
            TransportError::Protocol(format!("{method} returned {value} instead of a subscription id"))
        })
    }

    async fn unsubscribe(
        &self,
        kind: &str,
        method: &str,
        id: &SubscriptionId,
    ) -> Result<bool, TransportError> {
        let key = subscription_key(canonical_method(kind), id);
        let live = {
            let mut state = self.inner.lock();
            let open = state.status == ConnectionState::Open;
            let live = state.subscriptions.is_live(&key) && open;
            if !state.subscriptions.remove(&key) {
                tracing::debug!(key = %key, "unsubscribe for unknown subscription");
                return Ok(false);
            }
            if open && !live {
                // re-issued but not yet acknowledged; cancel the new id on reply
                state
                    .subscriptions
                    .cancel_reissue(&key, canonical_method(method));
            }
            live
        };
        if !live {
            return Ok(true);
        }
        self.inner.record(|s| s.requests += 1);
        let result = self
            .inner
            .dispatch(canonical_method(method), vec![id.to_value()], None)
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    fn on(
        &self,
        event: ProviderEvent,
        handler: EventHandler<ProviderEventData>,
    ) -> ProviderListener {
        attach_handler(&self.inner.events, event, handler, self.is_connected())
    }

    fn stats(&self) -> ProviderStats {
        let state = self.inner.lock();
        state.stats.snapshot(ActiveStats {
            requests: state.pending.len() as u64,
            subscriptions: state.subscriptions.live_count() as u64,
        })
    }

    fn has_subscriptions(&self) -> bool {
        true
    }

    fn is_clonable(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().status == ConnectionState::Open
    }

    fn health(&self) -> HealthStatus {
        let state = self.inner.lock();
        match state.status {
            ConnectionState::Open => HealthStatus::Healthy,
            ConnectionState::Connecting => HealthStatus::Degraded,
            _ if state.reconnecting => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }

    fn endpoint(&self) -> String {
        let index = self.inner.lock().endpoint_index.unwrap_or(0);
        self.inner.config.endpoints[index].clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::connector::mock::{MockConnector, MockServer};

    const A: &str = "ws://node-a:9944";
    const B: &str = "ws://node-b:9944";
    const C: &str = "ws://node-c:9944";

    fn config(endpoints: &[&str]) -> WsProviderConfig {
        WsProviderConfig {
            auto_connect_ms: 0,
            timeout_ms: 1_000,
            sweep_interval_ms: 100,
            ..WsProviderConfig::with_endpoints(endpoints.iter().copied())
        }
    }

    fn provider(
        config: WsProviderConfig,
    ) -> (WsProvider, Arc<MockConnector>, mpsc::UnboundedReceiver<MockServer>) {
        let (connector, servers) = MockConnector::new();
        let provider = WsProvider::with_connector(config, connector.clone()).unwrap();
        (provider, connector, servers)
    }

    async fn connected(
        config: WsProviderConfig,
    ) -> (WsProvider, Arc<MockConnector>, mpsc::UnboundedReceiver<MockServer>, MockServer) {
        let (provider, connector, mut servers) = provider(config);
        provider.connect().await.unwrap();
        let server = servers.recv().await.unwrap();
        (provider, connector, servers, server)
    }

    /// Let spawned tasks run until they are all idle.
    async fn settle() {
        time::sleep(Duration::from_millis(1)).await;
    }

    fn counter(hits: &Arc<AtomicUsize>) -> Arc<dyn Fn(&ProviderEventData) + Send + Sync> {
        let hits = hits.clone();
        Arc::new(move |_: &ProviderEventData| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn endpoints_rotate_per_connect_attempt() {
        let (provider, connector, mut servers) = provider(config(&[A, B, C]));
        for expected in [A, B, C, A] {
            provider.connect().await.unwrap();
            let server = servers.recv().await.unwrap();
            assert_eq!(server.endpoint, expected);
            assert_eq!(provider.endpoint(), expected);
            provider.disconnect().await.unwrap();
        }
        assert_eq!(connector.attempts(), vec![A, B, C, A]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_skips_refused_endpoint() {
        let mut cfg = config(&[A, B]);
        cfg.auto_connect_ms = 100;
        let (provider, connector, mut servers, mut first) = connected(cfg).await;
        assert_eq!(first.endpoint, A);

        connector.refuse_next(1);
        first.close();
        let second = servers.recv().await.unwrap();
        settle().await;

        assert_eq!(second.endpoint, A);
        assert_eq!(connector.attempts(), vec![A, B, A]);
        assert!(provider.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connect_without_auto_reconnect_is_not_retried() {
        let (provider, connector, _servers) = provider(config(&[A]));
        connector.refuse_next(1);

        assert!(matches!(
            provider.connect().await,
            Err(TransportError::WebSocket(_))
        ));
        time::sleep(Duration::from_secs(30)).await;

        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(provider.state(), ConnectionState::Closed);
        assert_eq!(provider.health(), HealthStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn round_trip_and_lifecycle_errors() {
        let (provider, _connector, mut servers) = provider(config(&[A]));
        assert!(matches!(
            provider.send("system_name", vec![], false).await,
            Err(TransportError::NotConnected)
        ));
        assert!(provider.disconnect().await.is_ok());

        provider.connect().await.unwrap();
        assert!(matches!(
            provider.connect().await,
            Err(TransportError::InvalidState(_))
        ));
        assert_eq!(provider.health(), HealthStatus::Healthy);
        let mut server = servers.recv().await.unwrap();

        let (result, _) = tokio::join!(provider.call::<String>("system_chain", vec![]), async {
            let req = server.recv().await;
            assert_eq!(req["jsonrpc"], "2.0");
            assert_eq!(req["method"], "system_chain");
            assert_eq!(req["params"], json!([]));
            server.reply(&req, json!("Bittensor"));
        });
        assert_eq!(result.unwrap(), "Bittensor");

        // the refused send before connecting still counts towards the totals
        let stats = provider.stats();
        assert_eq!(stats.total.requests, 2);
        assert_eq!(provider.endpoint_stats().requests, 1);
        assert!(stats.total.bytes_sent > 0);
        assert!(stats.total.bytes_recv > 0);
        assert_eq!(stats.active.requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn server_error_reaches_caller() {
        let (provider, _connector, _servers, mut server) = connected(config(&[A])).await;

        let (result, _) = tokio::join!(provider.send("foo_bar", vec![], false), async {
            let req = server.recv().await;
            server.reply_error(&req, -32601, "Method not found");
        });

        let err = result.unwrap_err();
        assert!(err.is_execution_error());
        assert_eq!(err.rpc_code(), Some(-32601));
        assert_eq!(provider.stats().total.errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_cacheable_calls_share_one_request() {
        let (provider, _connector, _servers, mut server) = connected(config(&[A])).await;

        let (a, b, _) = tokio::join!(
            provider.send("chain_getBlockHash", vec![json!(0)], true),
            provider.send("chain_getBlockHash", vec![json!(0)], true),
            async {
                let req = server.recv().await;
                server.reply(&req, json!("0x2f05"));
            },
        );
        assert_eq!(a.unwrap(), json!("0x2f05"));
        assert_eq!(b.unwrap(), json!("0x2f05"));
        settle().await;
        assert!(server.drain().is_empty());

        // served from cache without touching the socket
        let c = provider.send("chain_getBlockHash", vec![json!(0)], true).await;
        assert_eq!(c.unwrap(), json!("0x2f05"));
        settle().await;
        assert!(server.drain().is_empty());

        let stats = provider.stats().total;
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.cached, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn uncacheable_calls_are_not_shared() {
        let (provider, _connector, _servers, mut server) = connected(config(&[A])).await;

        let (a, b, _) = tokio::join!(
            provider.send("system_health", vec![], false),
            provider.send("system_health", vec![], false),
            async {
                let first = server.recv().await;
                let second = server.recv().await;
                assert_ne!(first["id"], second["id"]);
                server.reply(&second, json!({"peers": 2}));
                server.reply(&first, json!({"peers": 1}));
            },
        );
        assert_eq!(a.unwrap()["peers"], 1);
        assert_eq!(b.unwrap()["peers"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn close_fails_every_pending_request_once() {
        let (provider, _connector, _servers, mut server) = connected(config(&[A])).await;
        let disconnects = Arc::new(AtomicUsize::new(0));
        let _listener = provider.on(ProviderEvent::Disconnected, counter(&disconnects));

        let (a, b, _) = tokio::join!(
            provider.send("system_name", vec![], false),
            provider.send("system_version", vec![], false),
            async {
                server.recv().await;
                server.recv().await;
                server.close();
            },
        );
        assert!(matches!(a, Err(TransportError::Disconnected { .. })));
        assert!(matches!(b, Err(TransportError::Disconnected { .. })));

        time::sleep(Duration::from_secs(5)).await;
        let stats = provider.stats();
        assert_eq!(stats.total.timeout, 0);
        assert_eq!(stats.active.requests, 0);
        assert_eq!(provider.state(), ConnectionState::Closed);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_request_times_out_and_late_reply_is_ignored() {
        let (provider, _connector, _servers, mut server) = connected(config(&[A])).await;

        let start = Instant::now();
        let (result, req) = tokio::join!(
            provider.send("state_getStorage", vec![json!("0x01")], false),
            server.recv(),
        );
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(TransportError::Timeout { ms: 1_000 })));
        assert!(elapsed >= Duration::from_millis(1_000));
        assert!(elapsed <= Duration::from_millis(1_100));

        server.reply(&req, json!("0xlate"));
        settle().await;
        let stats = provider.stats();
        assert_eq!(stats.total.timeout, 1);
        assert_eq!(stats.active.requests, 0);
        assert!(provider.is_connected());

        let (next, _) = tokio::join!(provider.send("system_name", vec![], false), async {
            let req = server.recv().await;
            server.reply(&req, json!("subtensor"));
        });
        assert_eq!(next.unwrap(), json!("subtensor"));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_reply_only_fails_its_caller() {
        let (provider, _connector, _servers, mut server) = connected(config(&[A])).await;

        let (a, b, _) = tokio::join!(
            provider.send("system_name", vec![], false),
            provider.send("system_chain", vec![], false),
            async {
                let first = server.recv().await;
                let second = server.recv().await;
                assert_eq!(first["method"], "system_name");
                server.send_raw(json!("not an envelope"));
                server.send_raw(json!({"jsonrpc": "1.0", "id": first["id"], "result": "x"}));
                server.reply(&second, json!("Bittensor"));
            },
        );

        assert!(matches!(a, Err(TransportError::Protocol(_))));
        assert_eq!(b.unwrap(), json!("Bittensor"));
        assert!(provider.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_is_reported_without_failing_requests() {
        let (provider, _connector, _servers, mut server) = connected(config(&[A])).await;
        let errors = Arc::new(AtomicUsize::new(0));
        let _listener = provider.on(ProviderEvent::Error, counter(&errors));

        let (result, _) = tokio::join!(provider.send("system_name", vec![], false), async {
            let req = server.recv().await;
            server.fail(TransportError::WebSocket("frame too large".into()));
            server.reply(&req, json!("subtensor"));
        });

        assert_eq!(result.unwrap(), json!("subtensor"));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(provider.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn connected_handler_sees_current_state() {
        let (provider, _connector, _servers) = provider(config(&[A]));
        let early = Arc::new(AtomicUsize::new(0));
        let late = Arc::new(AtomicUsize::new(0));

        let _early = provider.on(ProviderEvent::Connected, counter(&early));
        assert_eq!(early.load(Ordering::SeqCst), 0);

        provider.connect().await.unwrap();
        assert_eq!(early.load(Ordering::SeqCst), 1);

        let _late = provider.on(ProviderEvent::Connected, counter(&late));
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_before_ack_are_replayed_in_order() {
        let (provider, _connector, _servers, mut server) = connected(config(&[A])).await;

        let (sub, _) = tokio::join!(
            provider.subscribe_stream("chain_newHead", "chain_subscribeNewHeads", vec![]),
            async {
                let req = server.recv().await;
                assert_eq!(req["method"], "chain_subscribeNewHeads");
                server.notify("chain_newHead", "0xa", json!({"number": "0x1"}));
                server.notify("chain_newHead", "0xa", json!({"number": "0x2"}));
                server.reply(&req, json!("0xa"));
            },
        );
        let (id, mut heads) = sub.unwrap();
        assert_eq!(id, SubscriptionId::from("0xa"));

        server.notify("chain_newHead", "0xa", json!({"number": "0x3"}));
        for expected in ["0x1", "0x2", "0x3"] {
            let head = heads.recv().await.unwrap().unwrap();
            assert_eq!(head["number"], expected);
        }

        let stats = provider.stats();
        assert_eq!(stats.active.subscriptions, 1);
        assert_eq!(stats.total.subscriptions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn finalised_alias_routes_to_finalized_subscription() {
        let (provider, _connector, _servers, mut server) = connected(config(&[A])).await;

        let (sub, _) = tokio::join!(
            provider.subscribe_stream(
                "chain_finalizedHead",
                "chain_subscribeFinalizedHeads",
                vec![]
            ),
            async {
                let req = server.recv().await;
                server.reply(&req, json!(7));
            },
        );
        let (id, mut heads) = sub.unwrap();
        assert_eq!(id, SubscriptionId::Number(7));

        server.send_raw(json!({
            "jsonrpc": "2.0",
            "method": "chain_finalisedHead",
            "params": {"subscription": 7, "result": {"number": "0x10"}}
        }));
        assert_eq!(heads.recv().await.unwrap().unwrap()["number"], "0x10");
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_rejects_non_id_result() {
        let (provider, _connector, _servers, mut server) = connected(config(&[A])).await;

        let (sub, _) = tokio::join!(
            provider.subscribe_stream("chain_newHead", "chain_subscribeNewHeads", vec![]),
            async {
                let req = server.recv().await;
                server.reply(&req, json!({"unexpected": true}));
            },
        );
        assert!(matches!(sub, Err(TransportError::Protocol(_))));
        assert_eq!(provider.stats().active.subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn subscriptions_are_reissued_after_reconnect() {
        let mut cfg = config(&[A, B]);
        cfg.auto_connect_ms = 100;
        let (provider, _connector, mut servers, mut first) = connected(cfg).await;

        let (heads, _) = tokio::join!(
            provider.subscribe_stream("chain_newHead", "chain_subscribeNewHeads", vec![]),
            async {
                let req = first.recv().await;
                first.reply(&req, json!("0xa"));
            },
        );
        let (watch, _) = tokio::join!(
            provider.subscribe_stream(
                "author_extrinsicUpdate",
                "author_submitAndWatchExtrinsic",
                vec![json!("0xdeadbeef")]
            ),
            async {
                let req = first.recv().await;
                first.reply(&req, json!("0xt"));
            },
        );
        let (_, mut heads) = heads.unwrap();
        assert!(watch.is_ok());
        assert_eq!(provider.stats().active.subscriptions, 2);

        first.close();
        let mut second = servers.recv().await.unwrap();
        assert_eq!(second.endpoint, B);

        let req = second.recv().await;
        assert_eq!(req["method"], "chain_subscribeNewHeads");
        second.reply(&req, json!("0xb"));
        settle().await;
        // the extrinsic watch is left to the caller
        assert!(second.drain().is_empty());

        second.notify("chain_newHead", "0xa", json!(1));
        second.notify("chain_newHead", "0xb", json!(2));
        assert_eq!(heads.recv().await.unwrap().unwrap(), json!(2));

        assert_eq!(provider.stats().active.subscriptions, 1);
        assert_eq!(provider.endpoint_stats().requests, 1);
        assert_eq!(provider.stats().total.requests, 3);

        let new_id = SubscriptionId::from("0xb");
        let (done, _) = tokio::join!(
            provider.unsubscribe("chain_newHead", "chain_unsubscribeNewHeads", &new_id),
            async {
                let req = second.recv().await;
                assert_eq!(req["method"], "chain_unsubscribeNewHeads");
                assert_eq!(req["params"], json!(["0xb"]));
                second.reply(&req, json!(true));
            },
        );
        assert!(done.unwrap());
        assert_eq!(provider.stats().active.subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_while_disconnected_cancels_resubscription() {
        let mut cfg = config(&[A]);
        cfg.auto_connect_ms = 100;
        let (provider, _connector, mut servers, mut first) = connected(cfg).await;

        let (heads, _) = tokio::join!(
            provider.subscribe_stream("chain_newHead", "chain_subscribeNewHeads", vec![]),
            async {
                let req = first.recv().await;
                first.reply(&req, json!("0xa"));
            },
        );
        let (id, _heads) = heads.unwrap();

        first.close();
        settle().await;
        assert_eq!(provider.health(), HealthStatus::Degraded);
        assert!(provider
            .unsubscribe("chain_newHead", "chain_unsubscribeNewHeads", &id)
            .await
            .unwrap());

        let mut second = servers.recv().await.unwrap();
        settle().await;
        assert!(second.drain().is_empty());
        assert_eq!(provider.stats().active.subscriptions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_during_resubscribe_cancels_new_id() {
        let mut cfg = config(&[A]);
        cfg.auto_connect_ms = 100;
        let (provider, _connector, mut servers, mut first) = connected(cfg).await;

        let (heads, _) = tokio::join!(
            provider.subscribe_stream("chain_newHead", "chain_subscribeNewHeads", vec![]),
            async {
                let req = first.recv().await;
                first.reply(&req, json!("0xa"));
            },
        );
        let (id, mut heads) = heads.unwrap();

        first.close();
        let mut second = servers.recv().await.unwrap();
        let resubscribe = second.recv().await;
        assert_eq!(resubscribe["method"], "chain_subscribeNewHeads");

        assert!(provider
            .unsubscribe("chain_newHead", "chain_unsubscribeNewHeads", &id)
            .await
            .unwrap());

        second.notify("chain_newHead", "0xb", json!(1));
        second.reply(&resubscribe, json!("0xb"));
        let cancel = second.recv().await;
        assert_eq!(cancel["method"], "chain_unsubscribeNewHeads");
        assert_eq!(cancel["params"], json!(["0xb"]));
        second.reply(&cancel, json!(true));

        second.notify("chain_newHead", "0xb", json!(2));
        settle().await;
        assert!(heads.try_recv().is_err());
        assert_eq!(provider.stats().active.subscriptions, 0);
        assert_eq!(provider.stats().active.requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_unknown_id_sends_nothing() {
        let (provider, _connector, _servers, mut server) = connected(config(&[A])).await;

        let removed = provider
            .unsubscribe("chain_newHead", "chain_unsubscribeNewHeads", &"0xzz".into())
            .await
            .unwrap();
        assert!(!removed);
        settle().await;
        assert!(server.drain().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_reconnecting() {
        let mut cfg = config(&[A]);
        cfg.auto_connect_ms = 100;
        let (provider, connector, _servers, _server) = connected(cfg).await;

        provider.disconnect().await.unwrap();
        time::sleep(Duration::from_secs(5)).await;

        assert_eq!(connector.attempts().len(), 1);
        assert_eq!(provider.state(), ConnectionState::Closed);
        assert!(matches!(
            provider.send("system_name", vec![], false).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_provider_closes_socket() {
        let (provider, _connector, _servers, mut server) = connected(config(&[A])).await;
        drop(provider);
        assert!(server.client_closed().await);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_is_unconnected_with_same_endpoints() {
        let (provider, _connector, _servers, _server) = connected(config(&[A, B])).await;
        let copy = provider.duplicate().unwrap();

        assert!(provider.is_clonable());
        assert!(provider.has_subscriptions());
        assert!(!copy.is_connected());
        assert_eq!(copy.endpoints(), provider.endpoints());
        assert_eq!(copy.stats().total.requests, 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let (connector, _servers) = MockConnector::new();
        let err = WsProvider::with_connector(
            WsProviderConfig::new("http://127.0.0.1:9944"),
            connector.clone(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, TransportError::Config(_)));

        let mut cfg = WsProviderConfig::new(A);
        cfg.cache_ttl_ms = Some(0);
        assert!(WsProvider::with_connector(cfg, connector).is_err());
    }

    #[test]
    fn provider_is_send_sync() {
        fn check<T: Send + Sync>() {}
        check::<WsProvider>();
    }
}
