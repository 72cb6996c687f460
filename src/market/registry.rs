use crate::auth::AccessTokenProvider;
use crate::error::MarketError;
use crate::market::config::MarketCoreConfig;
use crate::market::multiplexer::{classify_wire_frame, dispatch, InboundFrame, Subscriber};
use crate::market::transport::{Connection, Transport, WireFrame};
use crate::market::types::{
    AuthFrame, ChannelEvent, ConnectionFault, ConnectionState, ConnectionStatus, SubscriptionKey,
    AUTH_POLICY_CLOSE_CODE, NORMAL_CLOSE_CODE,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const AUTH_TIMEOUT_REASON: &str = "authentication timed out";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    pub auth_timeout: Duration,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self::from(&MarketCoreConfig::default())
    }
}

impl From<&MarketCoreConfig> for RegistrySettings {
    fn from(config: &MarketCoreConfig) -> Self {
        Self {
            auth_timeout: config.auth_timeout(),
            auto_reconnect: config.auto_reconnect,
            max_reconnect_attempts: config.max_reconnect_attempts,
        }
    }
}

struct ConnectionEntry {
    connection_id: u64,
    // Replaced wholesale on every change so dispatch can iterate a snapshot.
    subscribers: Arc<Vec<Subscriber>>,
    status: Arc<watch::Sender<ConnectionStatus>>,
    cancel: CancellationToken,
}

struct RegistryInner {
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn AccessTokenProvider>,
    settings: RegistrySettings,
    entries: Mutex<HashMap<SubscriptionKey, ConnectionEntry>>,
    next_id: AtomicU64,
}

/// Owns at most one physical connection per subscription key and shares it
/// between all subscribers of that key.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

/// Keeps one subscriber registered. Dropping the handle releases it.
pub struct SubscriptionHandle {
    key: SubscriptionKey,
    connection_id: u64,
    subscriber_id: u64,
    registry: Weak<RegistryInner>,
    status: watch::Receiver<ConnectionStatus>,
    released: bool,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn release(mut self) {
        self.release_subscriber();
    }

    fn release_subscriber(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some(inner) = self.registry.upgrade() {
            inner.remove_subscriber(&self.key, self.connection_id, self.subscriber_id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release_subscriber();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("key", &self.key)
            .field("connection_id", &self.connection_id)
            .field("subscriber_id", &self.subscriber_id)
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn AccessTokenProvider>,
        settings: RegistrySettings,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                tokens,
                settings,
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Registers `callback` for `key`, opening the physical connection if this
    /// is the first subscriber. Must be called inside a tokio runtime.
    pub fn acquire<F>(&self, key: SubscriptionKey, callback: F) -> Result<SubscriptionHandle, MarketError>
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| MarketError::NoRuntime)?;
        let token = self.inner.tokens.access_token();
        let subscriber = Subscriber {
            id: self.inner.next_id(),
            callback: Arc::new(callback),
        };
        let subscriber_id = subscriber.id;

        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            let mut subscribers = entry.subscribers.as_ref().clone();
            subscribers.push(subscriber);
            entry.subscribers = Arc::new(subscribers);
            tracing::debug!(%key, subscribers = entry.subscribers.len(), "joined existing connection");

            return Ok(SubscriptionHandle {
                key,
                connection_id: entry.connection_id,
                subscriber_id,
                registry: Arc::downgrade(&self.inner),
                status: entry.status.subscribe(),
                released: false,
            });
        }

        let token = token.ok_or(MarketError::Unauthenticated)?;
        let connection_id = self.inner.next_id();
        let (status_tx, status_rx) =
            watch::channel(ConnectionStatus::new(key.clone(), ConnectionState::Connecting));
        let status = Arc::new(status_tx);
        let cancel = CancellationToken::new();
        entries.insert(
            key.clone(),
            ConnectionEntry {
                connection_id,
                subscribers: Arc::new(vec![subscriber]),
                status: Arc::clone(&status),
                cancel: cancel.clone(),
            },
        );
        drop(entries);

        tracing::info!(%key, connection_id, "opening connection");
        runtime.spawn(drive_connection(
            Arc::clone(&self.inner),
            key.clone(),
            connection_id,
            token,
            status,
            cancel,
        ));

        Ok(SubscriptionHandle {
            key,
            connection_id,
            subscriber_id,
            registry: Arc::downgrade(&self.inner),
            status: status_rx,
            released: false,
        })
    }

    pub fn release(&self, handle: SubscriptionHandle) {
        handle.release();
    }

    pub fn subscriber_count(&self, key: &SubscriptionKey) -> usize {
        self.inner
            .entries
            .lock()
            .get(key)
            .map_or(0, |entry| entry.subscribers.len())
    }

    pub fn has_connection(&self, key: &SubscriptionKey) -> bool {
        self.inner.entries.lock().contains_key(key)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Tears down every connection regardless of outstanding handles.
    pub fn shutdown(&self) {
        let drained: Vec<_> = self.inner.entries.lock().drain().collect();
        for (key, entry) in drained {
            tracing::info!(%key, "closing connection on shutdown");
            entry.cancel.cancel();
        }
    }
}

impl RegistryInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn remove_subscriber(&self, key: &SubscriptionKey, connection_id: u64, subscriber_id: u64) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        if entry.connection_id != connection_id {
            return;
        }

        let subscribers: Vec<Subscriber> = entry
            .subscribers
            .iter()
            .filter(|subscriber| subscriber.id != subscriber_id)
            .cloned()
            .collect();
        if !subscribers.is_empty() {
            entry.subscribers = Arc::new(subscribers);
            return;
        }

        if let Some(entry) = entries.remove(key) {
            tracing::info!(%key, connection_id, "last subscriber released, closing connection");
            entry.cancel.cancel();
        }
    }

    fn snapshot(&self, key: &SubscriptionKey, connection_id: u64) -> Option<Arc<Vec<Subscriber>>> {
        self.entries
            .lock()
            .get(key)
            .filter(|entry| entry.connection_id == connection_id)
            .map(|entry| Arc::clone(&entry.subscribers))
    }

    fn remove_entry(&self, key: &SubscriptionKey, connection_id: u64) -> Option<Arc<Vec<Subscriber>>> {
        let mut entries = self.entries.lock();
        if entries
            .get(key)
            .is_some_and(|entry| entry.connection_id == connection_id)
        {
            return entries.remove(key).map(|entry| entry.subscribers);
        }
        None
    }

    fn publish(
        &self,
        key: &SubscriptionKey,
        connection_id: u64,
        status: &watch::Sender<ConnectionStatus>,
        next: ConnectionStatus,
    ) {
        status.send_replace(next.clone());
        if let Some(subscribers) = self.snapshot(key, connection_id) {
            dispatch(&key.to_string(), &subscribers, &ChannelEvent::Status(next));
        }
    }
}

enum SessionEnd {
    Released,
    Failed(ConnectionFault),
}

enum AuthOutcome {
    Authenticated,
    Rejected(String),
    TimedOut,
    Cancelled,
    Lost(String),
}

async fn drive_connection(
    inner: Arc<RegistryInner>,
    key: SubscriptionKey,
    connection_id: u64,
    mut token: String,
    status: Arc<watch::Sender<ConnectionStatus>>,
    cancel: CancellationToken,
) {
    let mut attempt = 0_u32;
    loop {
        let fault = match run_session(&inner, &key, connection_id, &token, &status, &cancel, &mut attempt)
            .await
        {
            SessionEnd::Released => {
                status.send_replace(ConnectionStatus::new(key.clone(), ConnectionState::Closed));
                tracing::info!(%key, connection_id, "connection closed");
                return;
            }
            SessionEnd::Failed(fault) => fault,
        };

        let retry = inner.settings.auto_reconnect
            && !matches!(fault, ConnectionFault::AuthenticationFailed(_))
            && attempt < inner.settings.max_reconnect_attempts
            && !cancel.is_cancelled();
        if !retry {
            fail_connection(&inner, &key, connection_id, &status, fault);
            return;
        }

        attempt = attempt.saturating_add(1);
        let delay = reconnect_delay(attempt);
        tracing::warn!(%key, attempt, delay_ms = delay.as_millis() as u64, ?fault, "reconnecting");
        inner.publish(
            &key,
            connection_id,
            &status,
            ConnectionStatus {
                key: key.clone(),
                state: ConnectionState::Reconnecting,
                fault: Some(fault),
            },
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                status.send_replace(ConnectionStatus::new(key.clone(), ConnectionState::Closed));
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        match inner.tokens.access_token() {
            Some(next_token) => token = next_token,
            None => {
                fail_connection(
                    &inner,
                    &key,
                    connection_id,
                    &status,
                    ConnectionFault::AuthenticationFailed(MarketError::Unauthenticated.to_string()),
                );
                return;
            }
        }
    }
}

fn fail_connection(
    inner: &RegistryInner,
    key: &SubscriptionKey,
    connection_id: u64,
    status: &watch::Sender<ConnectionStatus>,
    fault: ConnectionFault,
) {
    tracing::warn!(%key, connection_id, ?fault, "connection failed");
    let failed = ConnectionStatus::failed(key.clone(), fault);
    status.send_replace(failed.clone());
    let subscribers = inner.remove_entry(key, connection_id);
    if let Some(subscribers) = subscribers {
        dispatch(&key.to_string(), &subscribers, &ChannelEvent::Status(failed));
    }
}

async fn run_session(
    inner: &RegistryInner,
    key: &SubscriptionKey,
    connection_id: u64,
    token: &str,
    status: &watch::Sender<ConnectionStatus>,
    cancel: &CancellationToken,
    attempt: &mut u32,
) -> SessionEnd {
    inner.publish(
        key,
        connection_id,
        status,
        ConnectionStatus::new(key.clone(), ConnectionState::Connecting),
    );

    let connected = tokio::select! {
        _ = cancel.cancelled() => return SessionEnd::Released,
        connected = inner.transport.connect(key) => connected,
    };
    let mut connection = match connected {
        Ok(connection) => connection,
        Err(error) => return SessionEnd::Failed(ConnectionFault::ConnectFailed(error.to_string())),
    };

    inner.publish(
        key,
        connection_id,
        status,
        ConnectionStatus::new(key.clone(), ConnectionState::Authenticating),
    );
    let auth_frame = match simd_json::to_string(&AuthFrame { token }) {
        Ok(frame) => frame,
        Err(error) => return SessionEnd::Failed(ConnectionFault::ConnectFailed(error.to_string())),
    };
    if let Err(error) = connection.send_text(auth_frame).await {
        return SessionEnd::Failed(ConnectionFault::Lost(error.to_string()));
    }

    match await_authentication(connection.as_mut(), key, inner.settings.auth_timeout, cancel).await {
        AuthOutcome::Authenticated => {}
        AuthOutcome::Rejected(reason) => {
            tracing::warn!(%key, %reason, "server rejected access token");
            close_quietly(connection.as_mut(), key, AUTH_POLICY_CLOSE_CODE, &reason).await;
            inner.tokens.on_token_expired();
            return SessionEnd::Failed(ConnectionFault::AuthenticationFailed(reason));
        }
        AuthOutcome::TimedOut => {
            close_quietly(connection.as_mut(), key, AUTH_POLICY_CLOSE_CODE, AUTH_TIMEOUT_REASON).await;
            return SessionEnd::Failed(ConnectionFault::AuthenticationFailed(
                AUTH_TIMEOUT_REASON.to_string(),
            ));
        }
        AuthOutcome::Cancelled => {
            close_quietly(connection.as_mut(), key, NORMAL_CLOSE_CODE, "released").await;
            return SessionEnd::Released;
        }
        AuthOutcome::Lost(reason) => return SessionEnd::Failed(ConnectionFault::Lost(reason)),
    }

    *attempt = 0;
    tracing::info!(%key, connection_id, "connection authenticated");
    inner.publish(
        key,
        connection_id,
        status,
        ConnectionStatus::new(key.clone(), ConnectionState::Open),
    );

    let key_label = key.to_string();
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => {
                status.send_replace(ConnectionStatus::new(key.clone(), ConnectionState::Closing));
                close_quietly(connection.as_mut(), key, NORMAL_CLOSE_CODE, "released").await;
                return SessionEnd::Released;
            }
            next = connection.recv() => next,
        };

        let frame = match next {
            None => return SessionEnd::Failed(ConnectionFault::Lost("connection closed by peer".to_string())),
            Some(Err(error)) => return SessionEnd::Failed(ConnectionFault::Lost(error.to_string())),
            Some(Ok(WireFrame::Close(code))) => {
                return SessionEnd::Failed(ConnectionFault::Lost(match code {
                    Some(code) => format!("server closed the connection with code {code}"),
                    None => "server closed the connection".to_string(),
                }))
            }
            Some(Ok(frame)) => frame,
        };

        match classify_wire_frame(key.channel(), frame) {
            Ok(InboundFrame::Heartbeat) => {}
            Ok(InboundFrame::Authenticated) => {
                tracing::debug!(%key, "ignoring repeated authentication ack");
            }
            Ok(InboundFrame::Rejected { message }) => {
                close_quietly(connection.as_mut(), key, AUTH_POLICY_CLOSE_CODE, &message).await;
                return SessionEnd::Failed(ConnectionFault::Lost(message));
            }
            Ok(InboundFrame::Payload(event)) => {
                if let Some(subscribers) = inner.snapshot(key, connection_id) {
                    dispatch(&key_label, &subscribers, &event);
                }
            }
            Err(error) => {
                tracing::warn!(%key, %error, "dropping unparseable frame");
            }
        }
    }
}

async fn await_authentication(
    connection: &mut dyn Connection,
    key: &SubscriptionKey,
    timeout: Duration,
    cancel: &CancellationToken,
) -> AuthOutcome {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return AuthOutcome::Cancelled,
            _ = &mut deadline => return AuthOutcome::TimedOut,
            next = connection.recv() => next,
        };

        let frame = match next {
            None => return AuthOutcome::Lost("connection closed during authentication".to_string()),
            Some(Err(error)) => return AuthOutcome::Lost(error.to_string()),
            Some(Ok(WireFrame::Close(_))) => {
                return AuthOutcome::Lost("server closed the connection during authentication".to_string())
            }
            Some(Ok(frame)) => frame,
        };

        match classify_wire_frame(key.channel(), frame) {
            Ok(InboundFrame::Authenticated) => return AuthOutcome::Authenticated,
            Ok(InboundFrame::Rejected { message }) => return AuthOutcome::Rejected(message),
            Ok(InboundFrame::Heartbeat) => {}
            Ok(InboundFrame::Payload(_)) => {
                tracing::debug!(%key, "dropping payload received before authentication");
            }
            Err(error) => {
                tracing::warn!(%key, %error, "dropping unparseable frame during authentication");
            }
        }
    }
}

async fn close_quietly(connection: &mut dyn Connection, key: &SubscriptionKey, code: u16, reason: &str) {
    if let Err(error) = connection.close(code, reason).await {
        tracing::debug!(%key, code, %error, "close handshake failed");
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = 200_u64.saturating_mul(1_u64 << exponent);
    let jitter_ms = (chrono::Utc::now().timestamp_millis().unsigned_abs() % 250).min(249);
    Duration::from_millis((base_ms + jitter_ms).min(5_000))
}
