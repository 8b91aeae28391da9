//! Server-side session identity.
//!
//! A [`Session`] is a cheap, cloneable handle (`Arc` inside) shared by the
//! registry, the channel tree and the transport. Remote sessions buffer
//! deliveries in an outbound queue that the transport drains; local sessions
//! hand deliveries to an in-process listener.

use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, Notify};
use uuid::Uuid;

use crate::channel::ChannelId;
use crate::error::BayeuxError;
use crate::message::Message;
use crate::types::*;
use crate::utils::{catch, timestamp_millis};
use crate::Result;

pub type RemoveListener = Box<dyn Fn(&Session, RemoveReason) + Send + Sync>;
pub type LocalListener = Arc<dyn Fn(&Session, &Message) + Send + Sync>;

#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

pub struct SessionInner {
    pub id: SessionId,
    pub kind: SessionKind,
    pub created_at: TimestampMillis,
    attrs: DashMap<String, Value>,
    remove_listeners: Mutex<Vec<RemoveListener>>,
    removed: Mutex<Option<RemoveReason>>,
    closing: AtomicBool,
    subscriptions: DashSet<ChannelId>,
    handshook: AtomicBool,
    connected: AtomicBool,
    broadcast_to_publisher: AtomicBool,
    last_active: AtomicI64,
    sink: Sink,
    processing: AsyncMutex<()>,
}

enum Sink {
    Local(RwLock<Option<LocalListener>>),
    Remote(Queue),
}

struct Queue {
    messages: Mutex<VecDeque<Message>>,
    notify: Notify,
    max: usize,
}

impl Deref for Session {
    type Target = SessionInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session {{ id: {}, kind: {:?} }}", self.id, self.kind)
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Session {}

/// 122 random bits from a v4 uuid plus 64 more from the thread rng, suffixed with creation time.
fn generate_id(now: TimestampMillis) -> SessionId {
    let uuid = Uuid::new_v4();
    let extra: u64 = rand::random();
    SessionId::from(format!("{}{:016x}{:x}", uuid.as_simple(), extra, now))
}

impl Session {
    fn build(kind: SessionKind, sink: Sink, broadcast_to_publisher: bool) -> Self {
        let now = timestamp_millis();
        Session(Arc::new(SessionInner {
            id: generate_id(now),
            kind,
            created_at: now,
            attrs: DashMap::default(),
            remove_listeners: Mutex::new(Vec::new()),
            removed: Mutex::new(None),
            closing: AtomicBool::new(false),
            subscriptions: DashSet::default(),
            handshook: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            broadcast_to_publisher: AtomicBool::new(broadcast_to_publisher),
            last_active: AtomicI64::new(now),
            sink,
            processing: AsyncMutex::new(()),
        }))
    }

    /// A network-attached session whose outbound queue holds at most `max_queue` messages (0 = unbounded).
    #[inline]
    pub fn new_remote(max_queue: usize, broadcast_to_publisher: bool) -> Self {
        let queue = Queue { messages: Mutex::new(VecDeque::new()), notify: Notify::new(), max: max_queue };
        Self::build(SessionKind::Remote, Sink::Remote(queue), broadcast_to_publisher)
    }

    #[inline]
    pub fn new_local(broadcast_to_publisher: bool) -> Self {
        Self::build(SessionKind::Local, Sink::Local(RwLock::new(None)), broadcast_to_publisher)
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        matches!(self.kind, SessionKind::Local)
    }

    #[inline]
    pub fn is_handshook(&self) -> bool {
        self.handshook.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_handshook(&self, b: bool) {
        self.handshook.store(b, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn set_connected(&self, b: bool) {
        self.connected.store(b, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_removed(&self) -> bool {
        self.removed.lock().is_some()
    }

    /// Set once removal has started, before subscriptions are torn down.
    #[inline]
    pub(crate) fn set_closing(&self) {
        self.closing.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst) || self.is_removed()
    }

    #[inline]
    pub fn broadcast_to_publisher(&self) -> bool {
        self.broadcast_to_publisher.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_broadcast_to_publisher(&self, b: bool) {
        self.broadcast_to_publisher.store(b, Ordering::SeqCst);
    }

    /// Refreshes the activity timestamp checked by the sweeper.
    #[inline]
    pub fn touch(&self) {
        self.last_active.store(timestamp_millis(), Ordering::SeqCst);
    }

    #[inline]
    pub fn last_active(&self) -> TimestampMillis {
        self.last_active.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn idle_for(&self, now: TimestampMillis) -> Duration {
        Duration::from_millis((now - self.last_active()).max(0) as u64)
    }

    #[inline]
    pub fn attribute(&self, key: &str) -> Option<Value> {
        self.attrs.get(key).map(|v| v.value().clone())
    }

    #[inline]
    pub fn set_attribute<K: Into<String>>(&self, key: K, value: Value) -> Option<Value> {
        self.attrs.insert(key.into(), value)
    }

    #[inline]
    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.attrs.remove(key).map(|(_, v)| v)
    }

    #[inline]
    pub fn attribute_names(&self) -> Vec<String> {
        self.attrs.iter().map(|e| e.key().clone()).collect()
    }

    /// Adds a listener fired once when the session leaves the registry.
    /// On an already removed session the listener runs immediately.
    pub fn add_remove_listener<F>(&self, f: F)
    where
        F: Fn(&Session, RemoveReason) + Send + Sync + 'static,
    {
        let reason = {
            let removed = self.removed.lock();
            if removed.is_none() {
                self.remove_listeners.lock().push(Box::new(f));
                return;
            }
            *removed
        };
        if let Some(reason) = reason {
            if let Err(e) = catch(|| f(self, reason)) {
                log::error!("{} remove listener panicked, {}", self.id, e);
            }
        }
    }

    /// Marks the session removed and runs its removal listeners. Only the first call does anything.
    pub(crate) fn fire_removed(&self, reason: RemoveReason) -> bool {
        let listeners = {
            let mut removed = self.removed.lock();
            if removed.is_some() {
                return false;
            }
            *removed = Some(reason);
            std::mem::take(&mut *self.remove_listeners.lock())
        };
        self.set_connected(false);
        for (idx, listener) in listeners.iter().enumerate() {
            if let Err(e) = catch(|| listener(self, reason)) {
                log::error!("{} remove listener #{} panicked, {}", self.id, idx, e);
            }
        }
        if let Sink::Remote(queue) = &self.sink {
            queue.notify.notify_waiters();
        }
        true
    }

    #[inline]
    pub fn subscriptions(&self) -> Vec<ChannelId> {
        self.subscriptions.iter().map(|c| c.key().clone()).collect()
    }

    #[inline]
    pub fn is_subscribed(&self, channel: &ChannelId) -> bool {
        self.subscriptions.contains(channel)
    }

    #[inline]
    pub(crate) fn subscriptions_add(&self, channel: ChannelId) -> bool {
        self.subscriptions.insert(channel)
    }

    #[inline]
    pub(crate) fn subscriptions_remove(&self, channel: &ChannelId) -> bool {
        self.subscriptions.remove(channel).is_some()
    }

    /// Installs the in-process callback of a local session.
    pub fn set_local_listener<F>(&self, f: F) -> Result<()>
    where
        F: Fn(&Session, &Message) + Send + Sync + 'static,
    {
        match &self.sink {
            Sink::Local(listener) => {
                *listener.write() = Some(Arc::new(f));
                Ok(())
            }
            Sink::Remote(_) => Err(BayeuxError::from("a remote session has no local listener")),
        }
    }

    /// Hands a message to the session: local sessions get a callback, remote ones a queue entry.
    pub fn deliver(&self, msg: Message) -> Result<()> {
        if self.is_removed() {
            return Err(BayeuxError::SessionRemoved(self.id.clone()));
        }
        match &self.sink {
            Sink::Local(listener) => {
                let listener = listener.read().clone();
                let Some(listener) = listener else {
                    log::debug!("{} local session has no listener, message on {} ignored", self.id, msg.channel);
                    return Ok(());
                };
                catch(|| listener(self, &msg)).map_err(|e| {
                    log::info!("{} local listener panicked on {}, {}", self.id, msg.channel, e);
                    BayeuxError::ListenerPanic(self.id.clone(), e)
                })
            }
            Sink::Remote(queue) => {
                {
                    let mut messages = queue.messages.lock();
                    if queue.max > 0 && messages.len() >= queue.max {
                        return Err(BayeuxError::QueueFull(self.id.clone()));
                    }
                    messages.push_back(msg);
                }
                queue.notify.notify_waiters();
                Ok(())
            }
        }
    }

    #[inline]
    pub fn queue_len(&self) -> usize {
        match &self.sink {
            Sink::Remote(queue) => queue.messages.lock().len(),
            Sink::Local(_) => 0,
        }
    }

    /// Takes every queued message, oldest first.
    #[inline]
    pub fn drain(&self) -> Vec<Message> {
        match &self.sink {
            Sink::Remote(queue) => queue.messages.lock().drain(..).collect(),
            Sink::Local(_) => Vec::new(),
        }
    }

    /// Long-poll helper for transports: waits up to `timeout` for at least one
    /// queued message, then drains. Returns early, empty, if the session is removed.
    pub async fn wait(&self, timeout: Duration) -> Vec<Message> {
        let queue = match &self.sink {
            Sink::Remote(queue) => queue,
            Sink::Local(_) => return Vec::new(),
        };
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let msgs = self.drain();
            if !msgs.is_empty() || self.is_removed() {
                return msgs;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.drain();
            }
        }
    }

    /// Serializes message processing for this session; held for the whole of one request.
    #[inline]
    pub(crate) async fn processing(&self) -> AsyncMutexGuard<'_, ()> {
        self.processing.lock().await
    }
}
