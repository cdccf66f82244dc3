//! Named-event publish/subscribe over a single realtime connection.
//!
//! One `EventBus` is built at startup and cloned into whoever needs it.
//! Consumers never see the websocket: they subscribe by event name and
//! write through [`EventBus::send`] / [`ChatTransport`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::api::events::InboundEvent;
use crate::api::models::OutboundChat;
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// What the bus does after the connection drops. Missed events are never
/// replayed under either policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    #[default]
    Never,
    Fixed { max_attempts: u32, delay_ms: u64 },
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (zero based), or
    /// `None` once the policy gives up.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        match *self {
            Self::Never => None,
            Self::Fixed { max_attempts, delay_ms } => {
                (attempt < max_attempts).then(|| Duration::from_millis(delay_ms))
            }
        }
    }
}

/// Outbound half of the realtime channel as seen by chat consumers.
pub trait ChatTransport: Send + Sync {
    fn send_chat(&self, frame: &OutboundChat) -> Result<()>;
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: HashMap<String, Vec<(u64, Callback)>>,
}

struct Inner {
    url: Url,
    reconnect: ReconnectPolicy,
    registry: Mutex<Registry>,
    state: Mutex<Option<ConnectionState>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    connect_called: AtomicBool,
    closing: AtomicBool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn set_state(&self, state: Option<ConnectionState>) {
        *lock(&self.state) = state;
    }

    fn dispatch(&self, raw: &str) -> usize {
        let event = match InboundEvent::decode(raw) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("dropping inbound frame: {e}");
                return 0;
            }
        };

        // Snapshot so callbacks may (un)subscribe without deadlocking.
        let callbacks: Vec<Callback> = match lock(&self.registry).handlers.get(&event.name) {
            Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => {
                log::debug!("no subscribers for {}", event.name);
                return 0;
            }
        };
        for cb in &callbacks {
            cb(&event.payload);
        }
        callbacks.len()
    }

    fn remove(&self, event_name: &str, id: u64) {
        let mut reg = lock(&self.registry);
        if let Some(list) = reg.handlers.get_mut(event_name) {
            list.retain(|(i, _)| *i != id);
            if list.is_empty() {
                reg.handlers.remove(event_name);
            }
        }
    }

    /// Starts the writer task for `stream` and hands back its read half.
    fn open(&self, stream: WsStream) -> SplitStream<WsStream> {
        let (mut sink, source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let is_close = matches!(frame, WsMessage::Close(_));
                if let Err(e) = sink.send(frame).await {
                    log::warn!("websocket write failed: {e}");
                    break;
                }
                if is_close {
                    break;
                }
            }
        });
        *lock(&self.outbound) = Some(tx);
        self.set_state(Some(ConnectionState::Open));
        source
    }

    async fn read(&self, mut source: SplitStream<WsStream>) {
        while let Some(frame) = source.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => {
                    self.dispatch(&text);
                }
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        self.dispatch(&text);
                    }
                    Err(_) => log::warn!("dropping non-utf8 binary frame"),
                },
                Ok(WsMessage::Close(_)) => {
                    log::info!("websocket closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("websocket read failed: {e}");
                    break;
                }
            }
        }
        // Dropping the sender ends the writer task.
        lock(&self.outbound).take();
    }

    async fn drive(self: Arc<Self>, first: SplitStream<WsStream>) {
        let mut source = Some(first);
        let mut attempt = 0u32;
        loop {
            if let Some(s) = source.take() {
                self.read(s).await;
                attempt = 0;
            }
            self.set_state(Some(ConnectionState::Closed));
            if self.closing.load(Ordering::SeqCst) {
                break;
            }
            let Some(delay) = self.reconnect.delay_for(attempt) else {
                log::warn!("websocket to {} closed; not reconnecting", self.url);
                break;
            };
            attempt += 1;
            log::info!("reconnecting to {} in {delay:?} (attempt {attempt})", self.url);
            tokio::time::sleep(delay).await;
            if self.closing.load(Ordering::SeqCst) {
                break;
            }
            self.set_state(Some(ConnectionState::Connecting));
            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => source = Some(self.open(stream)),
                Err(e) => log::warn!("reconnect attempt {attempt} failed: {e}"),
            }
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(url: Url) -> Self {
        Self::with_reconnect(url, ReconnectPolicy::Never)
    }

    pub fn with_reconnect(url: Url, reconnect: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                url,
                reconnect,
                registry: Mutex::new(Registry::default()),
                state: Mutex::new(None),
                outbound: Mutex::new(None),
                driver: Mutex::new(None),
                connect_called: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// `None` until `connect` is called, and again after a failed connect.
    pub fn state(&self) -> Option<ConnectionState> {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == Some(ConnectionState::Open)
    }

    /// Opens the transport. Only the first call per bus does anything;
    /// later calls fail with `AlreadyConnected` even if the first one failed.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.connect_called.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyConnected);
        }
        self.inner.set_state(Some(ConnectionState::Connecting));

        let mut stream = match connect_async(self.inner.url.as_str()).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::error!("websocket connect to {} failed: {e}", self.inner.url);
                self.inner.set_state(None);
                return Err(e.into());
            }
        };
        if self.inner.closing.load(Ordering::SeqCst) {
            let _ = stream.close(None).await;
            self.inner.set_state(Some(ConnectionState::Closed));
            return Ok(());
        }

        log::info!("websocket connected to {}", self.inner.url);
        let source = self.inner.open(stream);
        let handle = tokio::spawn(Arc::clone(&self.inner).drive(source));
        *lock(&self.inner.driver) = Some(handle);
        Ok(())
    }

    /// Registers `callback` for `event_name`. Callbacks for one name run in
    /// registration order.
    pub fn subscribe<F>(&self, event_name: impl Into<String>, callback: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let event_name = event_name.into();
        let mut reg = lock(&self.inner.registry);
        reg.next_id += 1;
        let id = reg.next_id;
        reg.handlers
            .entry(event_name.clone())
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(&self.inner),
            event_name,
            id,
        }
    }

    pub fn subscriber_count(&self, event_name: &str) -> usize {
        lock(&self.inner.registry)
            .handlers
            .get(event_name)
            .map_or(0, Vec::len)
    }

    pub fn has_entry(&self, event_name: &str) -> bool {
        lock(&self.inner.registry).handlers.contains_key(event_name)
    }

    /// Decodes one raw frame and runs its subscribers. Returns how many ran;
    /// undecodable frames are logged and run nothing.
    pub fn dispatch(&self, raw: &str) -> usize {
        self.inner.dispatch(raw)
    }

    pub fn send<T: Serialize>(&self, frame: &T) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        let guard = lock(&self.inner.outbound);
        let tx = guard.as_ref().ok_or(Error::NotConnected)?;
        tx.send(WsMessage::Text(text)).map_err(|_| Error::NotConnected)
    }

    /// Closes the transport and forgets every subscription. Safe to call
    /// more than once.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        let first = !inner.closing.swap(true, Ordering::SeqCst);
        if let Some(tx) = lock(&inner.outbound).take() {
            let _ = tx.send(WsMessage::Close(None));
        }
        if let Some(driver) = lock(&inner.driver).take() {
            driver.abort();
        }
        lock(&inner.registry).handlers.clear();
        {
            let mut state = lock(&inner.state);
            if state.is_some() {
                *state = Some(ConnectionState::Closed);
            }
        }
        if first {
            log::info!("event bus for {} disconnected", inner.url);
        }
    }
}

impl ChatTransport for EventBus {
    fn send_chat(&self, frame: &OutboundChat) -> Result<()> {
        self.send(frame)
    }
}

/// Handle for one registration. Dropping it keeps the callback registered;
/// call [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    bus: Weak<Inner>,
    event_name: String,
    id: u64,
}

impl Subscription {
    pub fn event_name(&self) -> &str {
        &self.event_name
    }

    pub fn unsubscribe(self) {
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(&self.event_name, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn bus() -> EventBus {
        EventBus::new(Url::parse("ws://127.0.0.1:9/ws").unwrap())
    }

    #[test]
    fn subscribers_fire_once_in_registration_order() {
        let bus = bus();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen);
        let first = bus.subscribe("ping", move |p: &Value| s1.lock().unwrap().push(("first", p.clone())));
        let s2 = Arc::clone(&seen);
        let _second = bus.subscribe("ping", move |p: &Value| s2.lock().unwrap().push(("second", p.clone())));

        assert_eq!(bus.dispatch(r#"{"event":"ping","payload":1}"#), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("first", Value::from(1)), ("second", Value::from(1))]
        );

        first.unsubscribe();
        assert_eq!(bus.dispatch(r#"{"type":"ping","data":2}"#), 1);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[2], ("second", Value::from(2)));
    }

    #[test]
    fn removing_last_subscriber_drops_entry() {
        let bus = bus();
        let sub = bus.subscribe("gone", |_: &Value| {});
        assert!(bus.has_entry("gone"));
        sub.unsubscribe();
        assert!(!bus.has_entry("gone"));
        assert_eq!(bus.subscriber_count("gone"), 0);
    }

    #[test]
    fn malformed_frames_reach_nobody() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let _sub = bus.subscribe("ping", move |_: &Value| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.dispatch("{not json"), 0);
        assert_eq!(bus.dispatch(r#"{"payload":"no name"}"#), 0);
        assert_eq!(bus.dispatch(r#"{"event":"other"}"#), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // A bad frame does not poison later good ones.
        assert_eq!(bus.dispatch(r#"{"event":"ping"}"#), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_may_subscribe_during_dispatch() {
        let bus = bus();
        let inner_bus = bus.clone();
        let _sub = bus.subscribe("grow", move |_: &Value| {
            let _ = inner_bus.subscribe("grow", |_: &Value| {});
        });
        assert_eq!(bus.dispatch(r#"{"event":"grow"}"#), 1);
        assert_eq!(bus.subscriber_count("grow"), 2);
    }

    #[test]
    fn send_requires_connection() {
        let bus = bus();
        let frame = OutboundChat { recipient_id: "peer".into(), content: "hi".into() };
        assert!(matches!(bus.send_chat(&frame), Err(Error::NotConnected)));
    }

    #[test]
    fn disconnect_is_idempotent_and_clears_registry() {
        let bus = bus();
        let _sub = bus.subscribe("ping", |_: &Value| {});
        bus.disconnect();
        bus.disconnect();
        assert!(!bus.has_entry("ping"));
        assert_eq!(bus.state(), None);
    }

    #[tokio::test]
    async fn failed_connect_leaves_state_unset_and_is_not_retried() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let bus = EventBus::new(Url::parse(&format!("ws://127.0.0.1:{port}/ws")).unwrap());
        assert!(bus.connect().await.is_err());
        assert_eq!(bus.state(), None);
        assert!(matches!(bus.connect().await, Err(Error::AlreadyConnected)));
    }

    #[test]
    fn reconnect_policy_delays() {
        assert_eq!(ReconnectPolicy::Never.delay_for(0), None);
        let fixed = ReconnectPolicy::Fixed { max_attempts: 2, delay_ms: 250 };
        assert_eq!(fixed.delay_for(0), Some(Duration::from_millis(250)));
        assert_eq!(fixed.delay_for(1), Some(Duration::from_millis(250)));
        assert_eq!(fixed.delay_for(2), None);
    }
}
