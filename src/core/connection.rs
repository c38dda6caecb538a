//! The real-time connection manager
//!
//! One [`ConnectionManager`] owns the single logical transport to the
//! chat server. It authenticates through an injected
//! [`CredentialProvider`], opens transports through an injected
//! [`TransportFactory`], reconnects with bounded exponential backoff
//! after unexpected drops, maintains the shared online-presence set,
//! and fans every inbound frame out to subscribers.
//!
//! All network faults are absorbed here and translated into the
//! connection-state flag; the one caller-visible failure mode is
//! [`ConnectionManager::send`] on a missing or closed transport.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::CredentialProvider;
use crate::core::frame::{
    InboundFrame, OutboundFrame, KIND_PRESENCE_SNAPSHOT, KIND_USER_PRESENCE, STATUS_OFFLINE,
    STATUS_ONLINE,
};
use crate::core::presence::{OnlineUser, PresenceSet};
use crate::core::transport::{Transport, TransportError, TransportEvent, TransportFactory};
use crate::utils::url::websocket_url;

/// Automatic reconnection stops after this many failed attempts.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

const BASE_RECONNECT_DELAY_MS: u64 = 1000;
const MAX_RECONNECT_DELAY_MS: u64 = 30_000;

/// Backoff delay before reconnect attempt number `attempt` (zero-based,
/// read before the counter is incremented).
pub fn reconnect_delay(attempt: u32) -> Duration {
    let factor = 1u64 << attempt.min(31);
    Duration::from_millis((BASE_RECONNECT_DELAY_MS * factor).min(MAX_RECONNECT_DELAY_MS))
}

/// Failure modes of [`ConnectionManager::send`].
#[derive(Debug)]
pub enum SendError {
    /// No transport has been established (or it was torn down).
    NotInitialized,
    /// A transport exists but is no longer open; a reconnect may be pending.
    NotConnected,
    /// The frame could not be serialized to wire JSON.
    Serialize(serde_json::Error),
    /// The frame was handed to an open transport and transmission failed.
    Transport(TransportError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::NotInitialized => write!(f, "connection not initialized"),
            SendError::NotConnected => write!(f, "connection not open"),
            SendError::Serialize(source) => write!(f, "frame serialization failed: {}", source),
            SendError::Transport(source) => write!(f, "send failed: {}", source),
        }
    }
}

impl StdError for SendError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            SendError::Serialize(source) => Some(source),
            SendError::Transport(source) => Some(source),
            _ => None,
        }
    }
}

struct Link {
    transport: Option<Box<dyn Transport>>,
    open: bool,
}

struct RetryState {
    attempts: u32,
    timer: Option<JoinHandle<()>>,
}

struct Registry {
    subscribers: BTreeMap<u64, mpsc::UnboundedSender<InboundFrame>>,
    next_id: u64,
}

/// One registration's view of the inbound frame stream.
///
/// Dropping the subscription removes its registration; it receives
/// nothing from the next dispatch onward.
pub struct FrameSubscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<InboundFrame>,
    registry: Weak<Mutex<Registry>>,
}

impl FrameSubscription {
    /// Wait for the next inbound frame. Returns `None` once the
    /// subscription has been disposed and the buffer drained.
    pub async fn recv(&mut self) -> Option<InboundFrame> {
        self.rx.recv().await
    }

    /// Non-blocking variant for polling consumers.
    pub fn try_recv(&mut self) -> Option<InboundFrame> {
        self.rx.try_recv().ok()
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.lock() {
                registry.subscribers.remove(&self.id);
            }
        }
    }
}

struct ManagerInner {
    ws_endpoint: String,
    credentials: Arc<dyn CredentialProvider>,
    transports: Arc<dyn TransportFactory>,
    link: AsyncMutex<Link>,
    /// Bumped whenever the transport slot changes hands; stale reader
    /// tasks compare against it and stand down.
    epoch: AtomicU64,
    retry: Mutex<RetryState>,
    presence: Mutex<PresenceSet>,
    registry: Arc<Mutex<Registry>>,
    connected: watch::Sender<bool>,
}

/// Handle to the shared connection service. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Build a manager for the server behind `base_url`. Nothing is
    /// opened until [`ConnectionManager::connect`] is called.
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
        transports: Arc<dyn TransportFactory>,
    ) -> ConnectionManager {
        let (connected, _) = watch::channel(false);
        ConnectionManager {
            inner: Arc::new(ManagerInner {
                ws_endpoint: websocket_url(base_url),
                credentials,
                transports,
                link: AsyncMutex::new(Link {
                    transport: None,
                    open: false,
                }),
                epoch: AtomicU64::new(0),
                retry: Mutex::new(RetryState {
                    attempts: 0,
                    timer: None,
                }),
                presence: Mutex::new(PresenceSet::default()),
                registry: Arc::new(Mutex::new(Registry {
                    subscribers: BTreeMap::new(),
                    next_id: 0,
                })),
                connected,
            }),
        }
    }

    /// Establish the transport if a registered credential is available.
    ///
    /// Failures are absorbed: a missing or incomplete credential closes
    /// any existing transport and clears presence; an unreachable
    /// endpoint feeds the reconnection policy.
    pub async fn connect(&self) {
        ManagerInner::connect(&self.inner).await;
    }

    /// Explicit reconnect request (e.g. right after registration).
    /// Cancels any pending automatic retry and starts the attempt
    /// counter over.
    pub async fn reconnect(&self) {
        {
            let mut retry = self.inner.lock_retry();
            if let Some(timer) = retry.timer.take() {
                timer.abort();
            }
            retry.attempts = 0;
        }
        ManagerInner::connect(&self.inner).await;
    }

    /// Serialize and transmit one frame. Fails fast when the transport
    /// is absent or not open; nothing is queued.
    pub async fn send(&self, frame: &OutboundFrame) -> Result<(), SendError> {
        let mut link = self.inner.link.lock().await;
        if link.transport.is_none() {
            return Err(SendError::NotInitialized);
        }
        if !link.open {
            return Err(SendError::NotConnected);
        }
        let text = serde_json::to_string(frame).map_err(SendError::Serialize)?;
        let transport = link.transport.as_mut().ok_or(SendError::NotInitialized)?;
        transport.send(text).await.map_err(SendError::Transport)
    }

    /// Register for every inbound frame from the next dispatch on.
    pub fn subscribe(&self) -> FrameSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self
            .inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);
        FrameSubscription {
            id,
            rx,
            registry: Arc::downgrade(&self.inner.registry),
        }
    }

    /// Snapshot of the currently-online users.
    pub fn online_users(&self) -> Vec<OnlineUser> {
        self.inner
            .presence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .to_vec()
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Watch handle over the connection-state flag, for connectivity
    /// indicators.
    pub fn connection_state(&self) -> watch::Receiver<bool> {
        self.inner.connected.subscribe()
    }

    /// Tear the connection down: cancel any pending reconnect, close
    /// the transport, clear presence. Live subscriptions stay
    /// registered but receive nothing further.
    pub async fn shutdown(&self) {
        self.inner.cancel_retry();
        self.inner.teardown_link("shutdown").await;
    }
}

impl ManagerInner {
    async fn connect(inner: &Arc<ManagerInner>) {
        let credential = match inner.credentials.credential(false).await {
            Ok(Some(credential)) => credential,
            Ok(None) => {
                info!("no credential available, leaving connection down");
                inner.teardown_link("missing credential").await;
                return;
            }
            Err(error) => {
                warn!(error = %error, "credential fetch failed, abandoning connect");
                return;
            }
        };
        if !credential.registration_complete() {
            info!("registration incomplete, skipping connection");
            inner.teardown_link("registration incomplete").await;
            return;
        }

        let url = format!("{}?token={}", inner.ws_endpoint, credential.token);
        debug!(endpoint = %inner.ws_endpoint, "opening transport");
        let (transport, events) = match inner.transports.open(&url).await {
            Ok(pair) => pair,
            Err(error) => {
                warn!(error = %error, "transport open failed");
                // A healthy link stays authoritative; only a dead or
                // missing one puts the manager into the retry cycle.
                if inner.link.lock().await.open {
                    return;
                }
                inner.connected.send_replace(false);
                Self::schedule_retry(inner);
                return;
            }
        };

        let epoch = {
            let mut link = inner.link.lock().await;
            // Close-before-open inside one critical section: at most one
            // live transport, last writer wins.
            if let Some(mut old) = link.transport.take() {
                old.close().await;
            }
            link.transport = Some(transport);
            link.open = true;
            inner.epoch.fetch_add(1, Ordering::AcqRel) + 1
        };

        inner.lock_retry().attempts = 0;
        inner.connected.send_replace(true);
        info!("connected to chat server");

        let weak = Arc::downgrade(inner);
        tokio::spawn(Self::read_loop(weak, events, epoch));
    }

    async fn read_loop(
        weak: Weak<ManagerInner>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        epoch: u64,
    ) {
        loop {
            let event = events.recv().await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.epoch.load(Ordering::Acquire) != epoch {
                // A newer transport took over; drop leftovers silently.
                return;
            }
            match event {
                Some(TransportEvent::Message(text)) => inner.dispatch(&text),
                Some(TransportEvent::Closed { reason }) => {
                    inner.on_disconnect(epoch, reason.as_deref()).await;
                    return;
                }
                None => {
                    inner.on_disconnect(epoch, None).await;
                    return;
                }
            }
        }
    }

    async fn on_disconnect(self: &Arc<ManagerInner>, epoch: u64, reason: Option<&str>) {
        {
            let mut link = self.link.lock().await;
            if self.epoch.load(Ordering::Acquire) != epoch {
                return;
            }
            // The dead handle stays in the slot until replaced; send()
            // reports NotConnected rather than NotInitialized.
            link.open = false;
        }
        self.connected.send_replace(false);
        warn!(reason = reason.unwrap_or("connection dropped"), "disconnected from chat server");
        Self::schedule_retry(self);
    }

    fn schedule_retry(inner: &Arc<ManagerInner>) {
        let mut retry = inner.lock_retry();
        if retry.attempts >= MAX_RECONNECT_ATTEMPTS {
            error!(
                attempts = retry.attempts,
                "max reconnection attempts reached, giving up"
            );
            retry.timer = None;
            return;
        }
        let delay = reconnect_delay(retry.attempts);
        info!(
            attempt = retry.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        // Only one pending retry timer at a time.
        if let Some(stale) = retry.timer.take() {
            stale.abort();
        }
        let weak = Arc::downgrade(inner);
        retry.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.lock_retry().attempts += 1;
            ManagerInner::connect(&inner).await;
        }));
    }

    /// Apply one inbound frame: presence updates first, fan-out second,
    /// so subscribers always observe presence state consistent with the
    /// frame in hand.
    fn dispatch(&self, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(error = %error, "discarding undecodable frame");
                return;
            }
        };

        match frame.kind.as_str() {
            KIND_PRESENCE_SNAPSHOT => match frame.presence_snapshot() {
                Ok(snapshot) => self.lock_presence().replace(snapshot.users),
                Err(error) => {
                    warn!(error = %error, "ignoring malformed presence snapshot")
                }
            },
            KIND_USER_PRESENCE => match frame.presence_user() {
                Ok(user) => match frame.status.as_deref() {
                    Some(STATUS_ONLINE) => self.lock_presence().upsert(user),
                    Some(STATUS_OFFLINE) => {
                        self.lock_presence().remove(&user.user_id);
                    }
                    other => warn!(status = ?other, "unknown presence status"),
                },
                Err(error) => {
                    warn!(error = %error, "ignoring malformed presence update")
                }
            },
            _ => {}
        }

        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.subscribers.retain(|id, tx| {
            if tx.send(frame.clone()).is_ok() {
                true
            } else {
                debug!(subscriber = id, "pruning disposed subscription");
                false
            }
        });
    }

    async fn teardown_link(&self, reason: &str) {
        self.cancel_retry();
        {
            let mut link = self.link.lock().await;
            self.epoch.fetch_add(1, Ordering::AcqRel);
            if let Some(mut transport) = link.transport.take() {
                transport.close().await;
            }
            link.open = false;
        }
        self.lock_presence().clear();
        self.connected.send_replace(false);
        debug!(reason, "connection torn down");
    }

    fn cancel_retry(&self) {
        let mut retry = self.lock_retry();
        if let Some(timer) = retry.timer.take() {
            timer.abort();
        }
    }

    fn lock_retry(&self) -> std::sync::MutexGuard<'_, RetryState> {
        self.retry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_presence(&self) -> std::sync::MutexGuard<'_, PresenceSet> {
        self.presence
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Credential, CredentialStoreError, StaticCredentials};
    use async_trait::async_trait;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicBool;
    use tokio::time::advance;

    fn token_with_claims(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{}.{}.sig", header, payload)
    }

    fn registered_token() -> String {
        token_with_claims(serde_json::json!({"name": "Alice", "profile": 1}))
    }

    struct ScriptedTransport {
        sent: Arc<Mutex<Vec<String>>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&mut self, text: String) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(text);
            Ok(())
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FactoryState {
        plan: VecDeque<bool>,
        urls: Vec<String>,
        handles: Vec<mpsc::UnboundedSender<TransportEvent>>,
        sent: Vec<Arc<Mutex<Vec<String>>>>,
        closed: Vec<Arc<AtomicBool>>,
    }

    struct MockFactory {
        state: Mutex<FactoryState>,
        default_ok: bool,
    }

    impl MockFactory {
        fn always_ok() -> Arc<MockFactory> {
            Arc::new(MockFactory {
                state: Mutex::new(FactoryState::default()),
                default_ok: true,
            })
        }

        /// Planned outcomes for successive opens; once the plan runs out
        /// every further open fails.
        fn then_failures(plan: Vec<bool>) -> Arc<MockFactory> {
            Arc::new(MockFactory {
                state: Mutex::new(FactoryState {
                    plan: plan.into(),
                    ..FactoryState::default()
                }),
                default_ok: false,
            })
        }

        fn opens(&self) -> usize {
            self.state.lock().unwrap().urls.len()
        }

        fn url(&self, index: usize) -> String {
            self.state.lock().unwrap().urls[index].clone()
        }

        fn push_text(&self, index: usize, text: &str) {
            let handle = self.state.lock().unwrap().handles[index].clone();
            handle
                .send(TransportEvent::Message(text.to_string()))
                .unwrap();
        }

        fn push_frame(&self, index: usize, frame: serde_json::Value) {
            self.push_text(index, &frame.to_string());
        }

        fn close_transport(&self, index: usize) {
            let handle = self.state.lock().unwrap().handles[index].clone();
            handle
                .send(TransportEvent::Closed { reason: None })
                .unwrap();
        }

        fn sent_on(&self, index: usize) -> Vec<String> {
            self.state.lock().unwrap().sent[index].lock().unwrap().clone()
        }

        fn was_closed(&self, index: usize) -> bool {
            self.state.lock().unwrap().closed[index].load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TransportFactory for MockFactory {
        async fn open(
            &self,
            url: &str,
        ) -> Result<(Box<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>), TransportError>
        {
            let mut state = self.state.lock().unwrap();
            state.urls.push(url.to_string());
            let ok = state.plan.pop_front().unwrap_or(self.default_ok);
            if !ok {
                return Err(TransportError::Closed);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let sent = Arc::new(Mutex::new(Vec::new()));
            let closed = Arc::new(AtomicBool::new(false));
            state.handles.push(tx);
            state.sent.push(sent.clone());
            state.closed.push(closed.clone());
            Ok((Box::new(ScriptedTransport { sent, closed }), rx))
        }
    }

    struct FailingCredentials;

    #[async_trait]
    impl crate::auth::CredentialProvider for FailingCredentials {
        async fn credential(
            &self,
            _force_refresh: bool,
        ) -> Result<Option<Credential>, CredentialStoreError> {
            Err(CredentialStoreError::Permanent(keyring::Error::NoEntry))
        }
    }

    fn manager_with(factory: Arc<MockFactory>, token: Option<String>) -> ConnectionManager {
        ConnectionManager::new(
            "http://localhost:8080",
            Arc::new(StaticCredentials::new(token)),
            factory,
        )
    }

    /// Let spawned tasks run without parking the paused-time driver.
    async fn settle() {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    fn snapshot_frame(users: &[(&str, &str)]) -> serde_json::Value {
        let users: Vec<_> = users
            .iter()
            .map(|(id, name)| serde_json::json!({"userId": id, "name": name, "profile": 1}))
            .collect();
        serde_json::json!({"type": "presence_snapshot", "data": {"users": users}})
    }

    fn presence_frame(status: &str, id: &str, name: &str) -> serde_json::Value {
        serde_json::json!({
            "type": "user_presence",
            "status": status,
            "data": {"userId": id, "name": name, "profile": 2}
        })
    }

    #[test]
    fn reconnect_delay_doubles_then_caps() {
        let delays: Vec<u64> = (0..7).map(|a| reconnect_delay(a).as_millis() as u64).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[tokio::test]
    async fn connect_opens_transport_with_token_query() {
        let factory = MockFactory::always_ok();
        let manager = manager_with(factory.clone(), Some(registered_token()));

        assert!(!manager.is_connected());
        manager.connect().await;

        assert!(manager.is_connected());
        assert_eq!(factory.opens(), 1);
        let url = factory.url(0);
        assert!(url.starts_with("ws://localhost:8080/ws?token="), "url: {url}");
    }

    #[tokio::test]
    async fn connect_declines_without_credential() {
        let factory = MockFactory::always_ok();
        let manager = manager_with(factory.clone(), None);

        manager.connect().await;

        assert!(!manager.is_connected());
        assert_eq!(factory.opens(), 0);
    }

    #[tokio::test]
    async fn connect_declines_on_incomplete_claims_and_clears_presence() {
        let factory = MockFactory::always_ok();
        let manager = manager_with(
            factory.clone(),
            Some(token_with_claims(serde_json::json!({"name": "Alice"}))),
        );

        // Seed presence as if a previous session had populated it.
        manager
            .inner
            .dispatch(&snapshot_frame(&[("a", "Alice")]).to_string());
        assert_eq!(manager.online_users().len(), 1);

        manager.connect().await;

        assert!(!manager.is_connected());
        assert_eq!(factory.opens(), 0);
        assert!(manager.online_users().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn credential_fetch_failure_schedules_no_retry() {
        let factory = MockFactory::always_ok();
        let manager = ConnectionManager::new(
            "http://localhost:8080",
            Arc::new(FailingCredentials),
            factory.clone(),
        );

        manager.connect().await;
        advance(Duration::from_secs(120)).await;
        settle().await;

        assert_eq!(factory.opens(), 0);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn presence_snapshot_replaces_and_deltas_upsert() {
        let factory = MockFactory::always_ok();
        let manager = manager_with(factory.clone(), Some(registered_token()));
        manager.connect().await;

        factory.push_frame(0, snapshot_frame(&[("a", "Alice"), ("b", "Bob")]));
        settle().await;
        assert_eq!(manager.online_users().len(), 2);

        // Duplicate online deltas stay idempotent by user id.
        factory.push_frame(0, presence_frame("online", "c", "Carol"));
        factory.push_frame(0, presence_frame("online", "c", "Carol"));
        settle().await;
        assert_eq!(manager.online_users().len(), 3);

        // Offline for an unknown id is a no-op.
        factory.push_frame(0, presence_frame("offline", "ghost", "Ghost"));
        settle().await;
        assert_eq!(manager.online_users().len(), 3);

        factory.push_frame(0, presence_frame("offline", "b", "Bob"));
        settle().await;
        let users = manager.online_users();
        assert_eq!(users.len(), 2);
        assert!(users.iter().all(|u| u.user_id != "b"));

        // A snapshot wipes everything that came before it.
        factory.push_frame(0, snapshot_frame(&[("z", "Zoe")]));
        settle().await;
        let users = manager.online_users();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].user_id, "z");
    }

    #[tokio::test]
    async fn frames_fan_out_to_all_live_subscriptions() {
        let factory = MockFactory::always_ok();
        let manager = manager_with(factory.clone(), Some(registered_token()));
        manager.connect().await;

        let mut first = manager.subscribe();
        let mut second = manager.subscribe();

        factory.push_frame(0, presence_frame("online", "a", "Alice"));
        settle().await;

        assert_eq!(first.try_recv().unwrap().kind, "user_presence");
        assert_eq!(second.try_recv().unwrap().kind, "user_presence");

        // Presence was already applied when subscribers saw the frame.
        assert_eq!(manager.online_users().len(), 1);

        drop(second);
        factory.push_frame(0, presence_frame("online", "b", "Bob"));
        settle().await;

        assert_eq!(first.try_recv().unwrap().kind, "user_presence");
        assert!(first.try_recv().is_none());
        let live = manager.inner.registry.lock().unwrap().subscribers.len();
        assert_eq!(live, 1);
    }

    #[tokio::test]
    async fn malformed_payload_skips_presence_but_still_fans_out() {
        let factory = MockFactory::always_ok();
        let manager = manager_with(factory.clone(), Some(registered_token()));
        manager.connect().await;
        let mut sub = manager.subscribe();

        factory.push_text(
            0,
            r#"{"type":"user_presence","status":"online","data":"{broken"}"#,
        );
        settle().await;

        assert!(manager.online_users().is_empty());
        let frame = sub.try_recv().unwrap();
        assert_eq!(frame.kind, "user_presence");
    }

    #[tokio::test]
    async fn undecodable_frame_is_dropped_entirely() {
        let factory = MockFactory::always_ok();
        let manager = manager_with(factory.clone(), Some(registered_token()));
        manager.connect().await;
        let mut sub = manager.subscribe();

        factory.push_text(0, "not json at all");
        settle().await;

        assert!(sub.try_recv().is_none());
        assert!(manager.online_users().is_empty());
    }

    #[tokio::test]
    async fn send_fails_fast_without_transport() {
        let factory = MockFactory::always_ok();
        let manager = manager_with(factory.clone(), Some(registered_token()));

        let frame = OutboundFrame::JoinRoom {
            room_id: "room-1".to_string(),
        };
        assert!(matches!(
            manager.send(&frame).await,
            Err(SendError::NotInitialized)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn send_fails_after_close_until_reconnected() {
        let factory = MockFactory::always_ok();
        let manager = manager_with(factory.clone(), Some(registered_token()));
        manager.connect().await;

        let frame = OutboundFrame::Message {
            content: "hi".to_string(),
            room_id: "room-1".to_string(),
            reply_content: None,
        };
        manager.send(&frame).await.unwrap();
        assert_eq!(factory.sent_on(0).len(), 1);

        factory.close_transport(0);
        settle().await;

        assert!(!manager.is_connected());
        assert!(matches!(
            manager.send(&frame).await,
            Err(SendError::NotConnected)
        ));

        // Retry fires at 1000ms, not before.
        advance(Duration::from_millis(999)).await;
        settle().await;
        assert_eq!(factory.opens(), 1);

        advance(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(factory.opens(), 2);
        assert!(manager.is_connected());
        manager.send(&frame).await.unwrap();
        assert_eq!(factory.sent_on(1).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sequence_then_gives_up() {
        let factory = MockFactory::then_failures(vec![true]);
        let manager = manager_with(factory.clone(), Some(registered_token()));
        manager.connect().await;
        assert_eq!(factory.opens(), 1);

        factory.close_transport(0);
        settle().await;
        assert!(!manager.is_connected());

        for (round, delay_ms) in [1000u64, 2000, 4000, 8000, 16000].iter().enumerate() {
            advance(Duration::from_millis(delay_ms - 1)).await;
            settle().await;
            assert_eq!(factory.opens(), 1 + round, "attempt fired early");

            advance(Duration::from_millis(1)).await;
            settle().await;
            assert_eq!(factory.opens(), 2 + round, "attempt did not fire");
        }

        // Five failed attempts: the cycle stops for good.
        advance(Duration::from_secs(300)).await;
        settle().await;
        assert_eq!(factory.opens(), 6);
        assert!(!manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_reconnect_restarts_after_give_up() {
        let factory = MockFactory::then_failures(vec![true]);
        let manager = manager_with(factory.clone(), Some(registered_token()));
        manager.connect().await;
        factory.close_transport(0);
        settle().await;

        // Walk the whole retry schedule; each failed attempt arms the
        // next timer relative to the already-advanced clock.
        for delay_ms in [1000u64, 2000, 4000, 8000, 16000] {
            advance(Duration::from_millis(delay_ms)).await;
            settle().await;
        }
        assert_eq!(factory.opens(), 6);
        advance(Duration::from_secs(300)).await;
        settle().await;
        assert_eq!(factory.opens(), 6);

        manager.reconnect().await;
        assert_eq!(factory.opens(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconnect_keeps_healthy_link() {
        let factory = MockFactory::then_failures(vec![true]);
        let manager = manager_with(factory.clone(), Some(registered_token()));
        manager.connect().await;
        assert!(manager.is_connected());

        // Second open fails while the first transport is still up.
        manager.reconnect().await;
        settle().await;

        assert!(manager.is_connected());
        assert!(!factory.was_closed(0));
        let frame = OutboundFrame::JoinRoom {
            room_id: "room-1".to_string(),
        };
        manager.send(&frame).await.unwrap();
        assert_eq!(factory.sent_on(0).len(), 1);

        // No retry cycle was started against the live link.
        advance(Duration::from_secs(300)).await;
        settle().await;
        assert_eq!(factory.opens(), 2);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn overlapping_connect_replaces_transport_last_writer_wins() {
        let factory = MockFactory::always_ok();
        let manager = manager_with(factory.clone(), Some(registered_token()));
        manager.connect().await;
        manager.connect().await;
        settle().await;

        assert_eq!(factory.opens(), 2);
        assert!(factory.was_closed(0));
        assert!(!factory.was_closed(1));

        // Leftover traffic from the replaced transport goes nowhere.
        let mut sub = manager.subscribe();
        factory.push_frame(0, presence_frame("online", "a", "Alice"));
        settle().await;
        assert!(sub.try_recv().is_none());
        assert!(manager.online_users().is_empty());

        factory.push_frame(1, presence_frame("online", "b", "Bob"));
        settle().await;
        assert_eq!(sub.try_recv().unwrap().kind, "user_presence");

        let frame = OutboundFrame::JoinRoom {
            room_id: "room-1".to_string(),
        };
        manager.send(&frame).await.unwrap();
        assert!(factory.sent_on(0).is_empty());
        assert_eq!(factory.sent_on(1).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_retry_and_clears_state() {
        let factory = MockFactory::always_ok();
        let manager = manager_with(factory.clone(), Some(registered_token()));
        manager.connect().await;
        factory.push_frame(0, snapshot_frame(&[("a", "Alice")]));
        settle().await;
        assert_eq!(manager.online_users().len(), 1);

        factory.close_transport(0);
        settle().await;

        manager.shutdown().await;
        advance(Duration::from_secs(300)).await;
        settle().await;

        assert_eq!(factory.opens(), 1);
        assert!(!manager.is_connected());
        assert!(manager.online_users().is_empty());

        let frame = OutboundFrame::JoinRoom {
            room_id: "room-1".to_string(),
        };
        assert!(matches!(
            manager.send(&frame).await,
            Err(SendError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn connection_state_watch_tracks_lifecycle() {
        let factory = MockFactory::always_ok();
        let manager = manager_with(factory.clone(), Some(registered_token()));
        let state = manager.connection_state();
        assert!(!*state.borrow());

        manager.connect().await;
        assert!(*state.borrow());

        factory.close_transport(0);
        settle().await;
        assert!(!*state.borrow());
    }
}
