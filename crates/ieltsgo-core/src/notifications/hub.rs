//! Notification hub
//!
//! Shares one stream connection among any number of subscribers. The
//! connection opens after a short debounce once the first subscriber
//! arrives, reconnects with backoff while anyone is listening, and closes
//! after a grace period once the last subscriber leaves.
//!
//! State machine:
//!
//! ```text
//! Idle       --(subscriber, debounce elapsed, subscribers > 0)--> Connecting
//! Connecting --(stream opens)-------------------------------------> Open
//! Connecting --(error)--> Closed (retry scheduled if subscribers remain)
//! Open       --(stream ends or errors)--> Closed (retry scheduled if subscribers remain)
//! Open       --(last subscriber gone, grace elapsed, still none)--> Idle
//! any        --(destroy)--> Idle
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::ReconnectPolicy;
use super::connection::{HttpTransport, StreamConnection, StreamEnd, StreamTransport};
use super::types::{Notification, StreamEvent};
use crate::auth::TokenSource;
use crate::config::{ClientConfig, StreamSettings};
use crate::error::{ConfigError, StreamError};

/// Receives every notification delivered on the stream
pub type Listener = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Receives transport failures (best effort, informational)
pub type ErrorListener = Arc<dyn Fn(&StreamError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Ended or failed; a retry may be pending
    Closed,
}

struct HubState {
    status: ConnectionState,
    /// Keyed by subscription id, so snapshots follow subscription order
    listeners: BTreeMap<u64, Listener>,
    error_listeners: BTreeMap<u64, ErrorListener>,
    next_id: u64,
    should_reconnect: bool,
    /// Debounce timer armed and not yet fired
    start_pending: bool,
    abort: Option<CancellationToken>,
    retry: Option<JoinHandle<()>>,
    backoff: ReconnectPolicy,
    /// Bumped on every start and disconnect; stale tasks compare and bail
    generation: u64,
    connections_started: u64,
}

impl HubState {
    fn is_active(&self) -> bool {
        matches!(
            self.status,
            ConnectionState::Connecting | ConnectionState::Open
        )
    }
}

struct HubInner {
    state: Mutex<HubState>,
    transport: Arc<dyn StreamTransport>,
    tokens: Arc<dyn TokenSource>,
    settings: StreamSettings,
}

/// Shared realtime notification connection
///
/// Cheap to clone; all clones drive the same connection. Must be used from
/// within a tokio runtime.
#[derive(Clone)]
pub struct NotificationHub {
    inner: Arc<HubInner>,
}

impl NotificationHub {
    pub fn new(
        transport: Arc<dyn StreamTransport>,
        tokens: Arc<dyn TokenSource>,
        settings: StreamSettings,
    ) -> Self {
        let state = HubState {
            status: ConnectionState::Idle,
            listeners: BTreeMap::new(),
            error_listeners: BTreeMap::new(),
            next_id: 0,
            should_reconnect: true,
            start_pending: false,
            abort: None,
            retry: None,
            backoff: ReconnectPolicy::from_settings(&settings),
            generation: 0,
            connections_started: 0,
        };
        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(state),
                transport,
                tokens,
                settings,
            }),
        }
    }

    /// Hub talking HTTP to `{api_base_url}/notifications/stream`
    pub fn from_config(
        config: &ClientConfig,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(config.stream_url()?);
        Ok(Self::new(
            Arc::new(transport),
            tokens,
            config.stream.clone(),
        ))
    }

    /// Subscribe to notifications
    ///
    /// Never fails. Dropping the returned handle, or calling
    /// [`Subscription::unsubscribe`], removes the listener.
    pub fn connect<F>(&self, on_event: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.register(Arc::new(on_event), None)
    }

    /// Subscribe to notifications and to transport failures
    pub fn connect_with_errors<F, E>(&self, on_event: F, on_error: E) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
        E: Fn(&StreamError) + Send + Sync + 'static,
    {
        let on_error: ErrorListener = Arc::new(on_error);
        self.register(Arc::new(on_event), Some(on_error))
    }

    /// Subscribe and receive notifications on a channel instead of a callback
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.connect(move |notification: &Notification| {
            let _ = tx.send(notification.clone());
        });
        (subscription, rx)
    }

    fn register(&self, listener: Listener, error_listener: Option<ErrorListener>) -> Subscription {
        let mut state = self.inner.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.listeners.insert(id, listener);
        if let Some(error_listener) = error_listener {
            state.error_listeners.insert(id, error_listener);
        }
        debug!("Hub: subscriber {} added ({} total)", id, state.listeners.len());

        if !state.is_active() && !state.start_pending && state.retry.is_none() {
            state.start_pending = true;
            drop(state);
            self.inner.schedule_start();
        }

        Subscription {
            hub: Arc::downgrade(&self.inner),
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Drop every subscriber and close the connection now (logout, shutdown)
    pub fn destroy(&self) {
        let mut state = self.inner.state.lock();
        state.listeners.clear();
        state.error_listeners.clear();
        info!("Hub: destroyed");
        disconnect(&mut state);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn listener_count(&self) -> usize {
        self.inner.state.lock().listeners.len()
    }

    /// Delay the next reconnect would wait
    pub fn next_retry_delay(&self) -> Duration {
        self.inner.state.lock().backoff.current_delay()
    }

    /// Connection attempts made over the hub's lifetime
    pub fn connections_started(&self) -> u64 {
        self.inner.state.lock().connections_started
    }
}

fn spawn<F>(future: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(future)),
        Err(_) => {
            error!("Hub: no tokio runtime, cannot schedule notification stream work");
            None
        }
    }
}

/// Close the connection and cancel any pending retry
fn disconnect(state: &mut HubState) {
    state.should_reconnect = false;
    state.status = ConnectionState::Idle;
    state.generation += 1;
    state.backoff.reset();
    if let Some(abort) = state.abort.take() {
        abort.cancel();
    }
    if let Some(retry) = state.retry.take() {
        retry.abort();
    }
}

impl HubInner {
    fn schedule_start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.settings.connect_delay();
        let scheduled = spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.finish_debounce();
            }
        });
        if scheduled.is_none() {
            self.state.lock().start_pending = false;
        }
    }

    fn finish_debounce(self: &Arc<Self>) {
        let mut state = self.state.lock();
        state.start_pending = false;
        if state.listeners.is_empty() {
            debug!("Hub: subscribers left during debounce, not connecting");
            return;
        }
        if state.is_active() || state.retry.is_some() {
            return;
        }
        self.start_connection(&mut state);
    }

    fn start_connection(self: &Arc<Self>, state: &mut HubState) {
        let Some(token) = self.tokens.token() else {
            debug!("Hub: no access token, not connecting");
            return;
        };

        state.should_reconnect = true;
        state.status = ConnectionState::Connecting;
        state.generation += 1;
        state.connections_started += 1;

        let connection = StreamConnection::new(self.transport.clone());
        state.abort = Some(connection.abort_handle());
        let generation = state.generation;
        info!(
            "Hub: connecting (attempt {}, {} subscribers)",
            state.connections_started,
            state.listeners.len()
        );

        let weak = Arc::downgrade(self);
        if spawn(run_connection(weak, connection, token, generation)).is_none() {
            state.status = ConnectionState::Idle;
            state.abort = None;
        }
    }

    fn mark_open(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.status = ConnectionState::Open;
        true
    }

    fn handle_event(&self, generation: u64, event: StreamEvent) {
        let listeners: Vec<Listener> = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.backoff.reset();
            match &event {
                StreamEvent::Notification(_) => state.listeners.values().cloned().collect(),
                StreamEvent::Connected { user_id, .. } => {
                    debug!("Hub: stream confirmed for user {:?}", user_id);
                    return;
                }
                StreamEvent::Heartbeat { .. } => {
                    debug!("Hub: heartbeat");
                    return;
                }
            }
        };

        if let StreamEvent::Notification(notification) = event {
            debug!(
                "Hub: notification {} to {} subscribers",
                notification.id,
                listeners.len()
            );
            for listener in listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(&notification))).is_err() {
                    error!("Hub: notification listener panicked");
                }
            }
        }
    }

    fn handle_end(self: &Arc<Self>, generation: u64, error: Option<StreamError>) {
        let error_listeners: Vec<ErrorListener> = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.status = ConnectionState::Closed;
            state.abort = None;

            if state.should_reconnect && !state.listeners.is_empty() {
                let delay = state.backoff.record_failure();
                info!("Hub: reconnecting in {:?}", delay);
                state.retry = self.schedule_retry(delay, generation);
            }

            if error.is_some() {
                state.error_listeners.values().cloned().collect()
            } else {
                Vec::new()
            }
        };

        if let Some(error) = error {
            warn!("Hub: notification stream error: {}", error);
            for listener in error_listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(&error))).is_err() {
                    error!("Hub: error listener panicked");
                }
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, delay: Duration, generation: u64) -> Option<JoinHandle<()>> {
        let weak = Arc::downgrade(self);
        spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut state = inner.state.lock();
            if state.generation != generation {
                return;
            }
            state.retry = None;
            if !state.should_reconnect || state.listeners.is_empty() || state.is_active() {
                return;
            }
            inner.start_connection(&mut state);
        })
    }

    fn remove(self: &Arc<Self>, id: u64) {
        let mut state = self.state.lock();
        let removed = state.listeners.remove(&id).is_some();
        state.error_listeners.remove(&id);
        if !removed {
            return;
        }
        debug!("Hub: subscriber {} removed ({} left)", id, state.listeners.len());
        if !state.listeners.is_empty() {
            return;
        }
        drop(state);

        let weak = Arc::downgrade(self);
        let grace = self.settings.teardown_grace();
        spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut state = inner.state.lock();
            if state.listeners.is_empty() {
                info!("Hub: no subscribers, closing notification stream");
                disconnect(&mut state);
            }
        });
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        disconnect(self.state.get_mut());
    }
}

async fn run_connection(
    hub: Weak<HubInner>,
    connection: StreamConnection,
    token: String,
    generation: u64,
) {
    let open = match connection.open(&token).await {
        Ok(open) => open,
        Err(StreamError::Cancelled) => return,
        Err(e) => {
            if let Some(inner) = hub.upgrade() {
                inner.handle_end(generation, Some(e));
            }
            return;
        }
    };

    match hub.upgrade() {
        Some(inner) if inner.mark_open(generation) => {}
        _ => return,
    }

    let events_hub = hub.clone();
    let end = open
        .run(move |event| {
            if let Some(inner) = events_hub.upgrade() {
                inner.handle_event(generation, event);
            }
        })
        .await;

    let Some(inner) = hub.upgrade() else {
        return;
    };
    match end {
        StreamEnd::Cancelled => {}
        StreamEnd::Closed => inner.handle_end(generation, None),
        StreamEnd::Failed(e) => inner.handle_end(generation, Some(e)),
    }
}

/// Handle for one subscriber
///
/// Unsubscribes on drop. Unsubscribing more than once is harmless.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    hub: Weak<HubInner>,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(inner) = self.hub.upgrade() {
            inner.remove(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::MemoryTokenSource;
    use crate::notifications::connection::ByteStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    type BodySender = mpsc::UnboundedSender<Result<Bytes, StreamError>>;

    struct ActiveGuard(Arc<AtomicUsize>);

    impl Drop for ActiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// In-process transport: every open hands the test a body sender
    #[derive(Default)]
    struct FakeTransport {
        opens: AtomicUsize,
        active: Arc<AtomicUsize>,
        max_active: AtomicUsize,
        fail_next: AtomicUsize,
        bodies: Mutex<Vec<BodySender>>,
    }

    impl FakeTransport {
        fn opens(&self) -> usize {
            self.opens.load(Ordering::SeqCst)
        }

        fn active(&self) -> usize {
            self.active.load(Ordering::SeqCst)
        }

        fn latest(&self) -> BodySender {
            self.bodies.lock().last().cloned().expect("no stream opened")
        }

        fn send(&self, frame: &str) {
            let _ = self.latest().send(Ok(Bytes::from(frame.to_string())));
        }

        /// End every open body cleanly
        fn close_all(&self) {
            self.bodies.lock().clear();
        }
    }

    #[async_trait]
    impl StreamTransport for FakeTransport {
        async fn open(&self, _token: &str) -> Result<ByteStream, StreamError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StreamError::Status {
                    status: 503,
                    reason: "Service Unavailable".to_string(),
                });
            }

            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            let guard = ActiveGuard(self.active.clone());

            let (tx, rx) = mpsc::unbounded_channel();
            self.bodies.lock().push(tx);
            let body = UnboundedReceiverStream::new(rx).map(move |item| {
                let _keep_alive = &guard;
                item
            });
            Ok(Box::pin(body))
        }
    }

    fn hub_with(token: Option<&str>) -> (NotificationHub, Arc<FakeTransport>, Arc<MemoryTokenSource>) {
        let transport = Arc::new(FakeTransport::default());
        let tokens = Arc::new(MemoryTokenSource::new(token.map(str::to_string)));
        let hub = NotificationHub::new(
            transport.clone(),
            tokens.clone(),
            StreamSettings::default(),
        );
        (hub, transport, tokens)
    }

    fn notification_frame(id: &str) -> String {
        format!("event: notification\ndata: {{\"id\":\"{}\"}}\n\n", id)
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&Notification) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |n: &Notification| sink.lock().push(n.id.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_connection_when_subscriber_leaves_during_debounce() {
        let (hub, transport, _) = hub_with(Some("tok"));
        let sub = hub.connect(|_| {});
        sleep(Duration::from_millis(100)).await;
        drop(sub);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.opens(), 0);
        assert_eq!(hub.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_after_debounce() {
        let (hub, transport, _) = hub_with(Some("tok"));
        let _sub = hub.connect(|_| {});
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(transport.opens(), 0);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.opens(), 1);
        assert!(hub.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_connection_shared_by_late_authenticated_subscribers() {
        let (hub, transport, tokens) = hub_with(None);
        let (seen_a, a) = recorder();
        let (seen_b, b) = recorder();
        let (seen_c, c) = recorder();

        let _sub_a = hub.connect(a);
        sleep(Duration::from_millis(100)).await;
        let _sub_b = hub.connect(b);
        sleep(Duration::from_millis(100)).await;
        let _sub_c = hub.connect(c);
        tokens.set("tok");

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(transport.opens(), 1);

        transport.send(&notification_frame("n1"));
        transport.send(&notification_frame("n2"));
        sleep(Duration::from_millis(10)).await;

        for seen in [seen_a, seen_b, seen_c] {
            assert_eq!(*seen.lock(), vec!["n1".to_string(), "n2".to_string()]);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_token_makes_no_attempt_and_no_error() {
        let (hub, transport, _) = hub_with(None);
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let _sub = hub.connect_with_errors(
            |_| {},
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );
        sleep(Duration::from_secs(10)).await;
        assert_eq!(transport.opens(), 0);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert_eq!(hub.state(), ConnectionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_after_grace() {
        let (hub, transport, _) = hub_with(Some("tok"));
        let sub = hub.connect(|_| {});
        sleep(Duration::from_millis(1300)).await;
        assert_eq!(transport.active(), 1);

        sub.unsubscribe();
        sleep(Duration::from_millis(400)).await;
        assert_eq!(transport.active(), 1);
        sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.active(), 0);
        assert_eq!(hub.state(), ConnectionState::Idle);

        // No reconnect once everyone has left
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_within_grace_keeps_connection() {
        let (hub, transport, _) = hub_with(Some("tok"));
        let first = hub.connect(|_| {});
        sleep(Duration::from_millis(1300)).await;

        drop(first);
        sleep(Duration::from_millis(200)).await;
        let (seen, listener) = recorder();
        let _second = hub.connect(listener);
        sleep(Duration::from_secs(2)).await;

        assert_eq!(transport.opens(), 1);
        assert_eq!(transport.active(), 1);
        transport.send(&notification_frame("kept"));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(*seen.lock(), vec!["kept".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_exponential_backoff() {
        let (hub, transport, _) = hub_with(Some("tok"));
        transport.fail_next.store(2, Ordering::SeqCst);
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let _sub = hub.connect_with_errors(
            |_| {},
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        // t=1200 first attempt fails, retry after 1s
        sleep(Duration::from_millis(1300)).await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(hub.state(), ConnectionState::Closed);

        // t=2200 second attempt fails, retry after 2s
        sleep(Duration::from_millis(1000)).await;
        assert_eq!(transport.opens(), 2);

        sleep(Duration::from_millis(1800)).await;
        assert_eq!(transport.opens(), 2);

        // t=4200 third attempt succeeds
        sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.opens(), 3);
        assert!(hub.is_connected());
        assert_eq!(errors.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_event_resets_backoff() {
        let (hub, transport, _) = hub_with(Some("tok"));
        transport.fail_next.store(2, Ordering::SeqCst);
        let _sub = hub.connect(|_| {});

        sleep(Duration::from_millis(4300)).await;
        assert!(hub.is_connected());
        assert_eq!(hub.next_retry_delay(), Duration::from_secs(4));

        transport.send("event: connected\ndata: {\"message\":\"hi\"}\n\n");
        sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.next_retry_delay(), Duration::from_secs(1));
    }

    /// Connected after two failures, so the next retry would wait 4s
    async fn connected_after_two_failures() -> (NotificationHub, Arc<FakeTransport>, Subscription) {
        let (hub, transport, _) = hub_with(Some("tok"));
        transport.fail_next.store(2, Ordering::SeqCst);
        let sub = hub.connect(|_| {});
        sleep(Duration::from_millis(4300)).await;
        assert!(hub.is_connected());
        assert_eq!(hub.next_retry_delay(), Duration::from_secs(4));
        (hub, transport, sub)
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_resets_backoff() {
        let (hub, transport, _sub) = connected_after_two_failures().await;
        transport.send("event: heartbeat\ndata: {\"timestamp\": 1700000000}\n\n");
        sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.next_retry_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_with_empty_data_resets_backoff() {
        let (hub, transport, _sub) = connected_after_two_failures().await;
        transport.send("event: heartbeat\ndata: \n\n");
        sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.next_retry_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_notification_resets_backoff() {
        let (hub, transport, _sub) = connected_after_two_failures().await;
        transport.send(&notification_frame("n1"));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.next_retry_delay(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_notification_keeps_backoff() {
        let (hub, transport, _sub) = connected_after_two_failures().await;
        transport.send("event: notification\ndata: {not json\n\n");
        sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.next_retry_delay(), Duration::from_secs(4));
        assert!(hub.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_close_reconnects() {
        let (hub, transport, _) = hub_with(Some("tok"));
        let (seen, listener) = recorder();
        let _sub = hub.connect(listener);
        sleep(Duration::from_millis(1300)).await;

        transport.close_all();
        sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.state(), ConnectionState::Closed);

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(transport.opens(), 2);
        transport.send(&notification_frame("after"));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(*seen.lock(), vec!["after".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_listener_does_not_block_others() {
        let (hub, transport, _) = hub_with(Some("tok"));
        let _bad = hub.connect(|_| panic!("listener bug"));
        let (seen, listener) = recorder();
        let _good = hub.connect(listener);
        sleep(Duration::from_millis(1300)).await;

        transport.send(&notification_frame("1"));
        transport.send(&notification_frame("2"));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(*seen.lock(), vec!["1".to_string(), "2".to_string()]);
        assert!(hub.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_idempotent() {
        let (hub, _, _) = hub_with(Some("tok"));
        let a = hub.connect(|_| {});
        let _b = hub.connect(|_| {});
        a.unsubscribe();
        a.unsubscribe();
        assert!(!a.is_active());
        assert_eq!(hub.listener_count(), 1);
        drop(a);
        assert_eq!(hub.listener_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_during_dispatch() {
        let (hub, transport, _) = hub_with(Some("tok"));
        let self_removing_calls = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let calls = self_removing_calls.clone();
        let own = slot.clone();
        let sub = hub.connect(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            if let Some(sub) = own.lock().as_ref() {
                sub.unsubscribe();
            }
        });
        *slot.lock() = Some(sub);
        let (seen, listener) = recorder();
        let _other = hub.connect(listener);
        sleep(Duration::from_millis(1300)).await;

        transport.send(&notification_frame("1"));
        sleep(Duration::from_millis(10)).await;
        transport.send(&notification_frame("2"));
        sleep(Duration::from_millis(10)).await;

        assert_eq!(self_removing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock(), vec!["1".to_string(), "2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_skipped() {
        let (hub, transport, _) = hub_with(Some("tok"));
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        let (seen, listener) = recorder();
        let _sub = hub.connect_with_errors(listener, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sleep(Duration::from_millis(1300)).await;

        transport.send("event: notification\ndata: {not json\n\n");
        transport.send(&notification_frame("ok"));
        sleep(Duration::from_millis(10)).await;

        assert_eq!(*seen.lock(), vec!["ok".to_string()]);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
        assert!(hub.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_disconnects_without_grace() {
        let (hub, transport, _) = hub_with(Some("tok"));
        let sub = hub.connect(|_| {});
        sleep(Duration::from_millis(1300)).await;
        assert_eq!(transport.active(), 1);

        hub.destroy();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.active(), 0);
        assert_eq!(hub.listener_count(), 0);
        assert_eq!(hub.state(), ConnectionState::Idle);

        // Old handle is inert
        sub.unsubscribe();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_pending_retry() {
        let (hub, transport, _) = hub_with(Some("tok"));
        transport.fail_next.store(1, Ordering::SeqCst);
        let _sub = hub.connect(|_| {});
        sleep(Duration::from_millis(1300)).await;
        assert_eq!(transport.opens(), 1);

        hub.destroy();
        sleep(Duration::from_secs(60)).await;
        assert_eq!(transport.opens(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_churn_keeps_single_connection() {
        let (hub, transport, _) = hub_with(Some("tok"));
        let mut subs = Vec::new();
        for round in 0..20u64 {
            subs.push(hub.connect(|_| {}));
            if round % 3 == 0 {
                subs.clear();
            }
            sleep(Duration::from_millis(150 + (round * 37) % 400)).await;
        }
        sleep(Duration::from_secs(3)).await;
        assert!(transport.max_active.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_subscription() {
        let (hub, transport, _) = hub_with(Some("tok"));
        let (_sub, mut rx) = hub.subscribe_channel();
        sleep(Duration::from_millis(1300)).await;

        transport.send(&notification_frame("via-channel"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, "via-channel");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_new_subscriber_when_token_arrives() {
        let (hub, transport, tokens) = hub_with(None);
        let first = hub.connect(|_| {});
        sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.opens(), 0);

        tokens.set("tok");
        drop(first);
        let _second = hub.connect(|_| {});
        sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.opens(), 1);
    }
}
