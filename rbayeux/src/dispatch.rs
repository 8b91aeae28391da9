//! Channel tree and message dispatch.
//!
//! Channels live in a concurrent map keyed by id. Each channel keeps its
//! subscribers and service handlers as copy-on-write snapshots, so a publish
//! that is already walking a channel keeps the lists it started with while
//! subscribe, unsubscribe and mapping changes build new ones.
//!
//! A publish to `/a/b/c` resolves the literal channel first and then its
//! wildcard ancestors `/a/b/*`, `/a/b/**`, `/a/**` and `/**`. Service handlers
//! run before subscribers get their copies.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::channel::{ChannelError, ChannelId};
use crate::error::BayeuxError;
use crate::extension::ExtensionManager;
use crate::message::{Message, ServerMessage};
use crate::session::Session;
use crate::stats::Stats;
use crate::types::*;
use crate::utils::catch;
use crate::Result;

/// Service callback, invoked with the publishing session and the message.
pub type Handler = Arc<dyn Fn(&Session, &Message) -> Result<()> + Send + Sync>;
pub type HandlerId = u64;

#[derive(Clone)]
pub struct HandlerEntry {
    pub id: HandlerId,
    pub pattern: ChannelId,
    pub service: ServiceName,
    pub owner: Session,
    handler: Handler,
}

impl HandlerEntry {
    #[inline]
    fn call(&self, from: &Session, msg: &Message) -> std::result::Result<Result<()>, String> {
        catch(|| (self.handler)(from, msg))
    }
}

pub struct Channel {
    id: ChannelId,
    persistent: AtomicBool,
    subscribers: RwLock<Arc<Vec<Session>>>,
    handlers: RwLock<Arc<Vec<HandlerEntry>>>,
}

impl Channel {
    fn new(id: ChannelId, persistent: bool) -> Self {
        Self {
            id,
            persistent: AtomicBool::new(persistent),
            subscribers: RwLock::new(Arc::new(Vec::new())),
            handlers: RwLock::new(Arc::new(Vec::new())),
        }
    }

    #[inline]
    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    #[inline]
    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn subscribers(&self) -> Arc<Vec<Session>> {
        self.subscribers.read().clone()
    }

    #[inline]
    pub fn handlers(&self) -> Arc<Vec<HandlerEntry>> {
        self.handlers.read().clone()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty() && self.handlers.read().is_empty()
    }

    fn add_subscriber(&self, session: &Session) -> bool {
        let mut subs = self.subscribers.write();
        if subs.iter().any(|s| s == session) {
            return false;
        }
        let mut updated = subs.as_ref().clone();
        updated.push(session.clone());
        *subs = Arc::new(updated);
        true
    }

    fn remove_subscriber(&self, session: &Session) -> bool {
        let mut subs = self.subscribers.write();
        if !subs.iter().any(|s| s == session) {
            return false;
        }
        *subs = Arc::new(subs.iter().filter(|s| *s != session).cloned().collect());
        true
    }

    fn add_handler(&self, entry: HandlerEntry) {
        let mut handlers = self.handlers.write();
        let mut updated = handlers.as_ref().clone();
        updated.push(entry);
        *handlers = Arc::new(updated);
    }

    fn remove_handlers<F: Fn(&HandlerEntry) -> bool>(&self, f: F) -> usize {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        let updated: Vec<HandlerEntry> = handlers.iter().filter(|h| !f(h)).cloned().collect();
        let removed = before - updated.len();
        if removed > 0 {
            *handlers = Arc::new(updated);
        }
        removed
    }
}

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Published {
    pub handlers: usize,
    pub delivered: usize,
    pub dropped: usize,
}

pub struct Dispatcher {
    channels: DashMap<ChannelId, Arc<Channel>>,
    extensions: Arc<ExtensionManager>,
    stats: Arc<Stats>,
    next_handler_id: AtomicU64,
}

impl Dispatcher {
    pub fn new(extensions: Arc<ExtensionManager>, stats: Arc<Stats>) -> Self {
        Self { channels: DashMap::default(), extensions, stats, next_handler_id: AtomicU64::new(1) }
    }

    #[inline]
    pub fn channel(&self, id: &ChannelId) -> Option<Arc<Channel>> {
        self.channels.get(id).map(|c| c.value().clone())
    }

    #[inline]
    pub fn has_channel(&self, id: &ChannelId) -> bool {
        self.channels.contains_key(id)
    }

    #[inline]
    pub fn channels(&self) -> Vec<ChannelId> {
        self.channels.iter().map(|c| c.key().clone()).collect()
    }

    /// Gets or creates `id`; asking for a persistent channel marks an existing one persistent.
    pub fn create_channel(&self, id: ChannelId, persistent: bool) -> Arc<Channel> {
        let mut created = false;
        let channel = self
            .channels
            .entry(id.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(Channel::new(id.clone(), persistent))
            })
            .value()
            .clone();
        if persistent {
            channel.persistent.store(true, Ordering::SeqCst);
        }
        if created {
            self.stats.channels.inc();
            log::debug!("channel {} created, persistent: {}", id, persistent);
        }
        channel
    }

    /// Clearing the flag removes the channel right away when it is empty.
    pub fn set_persistent(&self, id: &ChannelId, persistent: bool) {
        if let Some(c) = self.channel(id) {
            c.persistent.store(persistent, Ordering::SeqCst);
        }
        if !persistent {
            self.try_remove_channel(id);
        }
    }

    fn try_remove_channel(&self, id: &ChannelId) {
        if self.channels.remove_if(id, |_, c| !c.is_persistent() && c.is_empty()).is_some() {
            self.stats.channels.dec();
            log::debug!("channel {} removed", id);
        }
    }

    /// Runs `f` on the channel while the map entry is held, creating the channel if needed.
    fn with_channel<R, F: FnOnce(&Channel) -> R>(&self, id: &ChannelId, f: F) -> R {
        let mut created = false;
        let entry = self.channels.entry(id.clone()).or_insert_with(|| {
            created = true;
            Arc::new(Channel::new(id.clone(), false))
        });
        let r = f(entry.value().as_ref());
        drop(entry);
        if created {
            self.stats.channels.inc();
            log::debug!("channel {} created", id);
        }
        r
    }

    /// Returns false if the session was already subscribed.
    pub fn subscribe(&self, session: &Session, id: &ChannelId) -> Result<bool> {
        if id.is_meta() {
            return Err(ChannelError::InvalidChannel(id.to_string(), "meta channels are not subscribable").into());
        }
        if session.is_closing() {
            return Err(BayeuxError::SessionRemoved(session.id.clone()));
        }
        // The session records the subscription while the channel entry is held. A removal
        // that started meanwhile either sees it in `unsubscribe_all` or is seen here.
        let added = self.with_channel(id, |c| {
            if !c.add_subscriber(session) {
                return Ok(false);
            }
            session.subscriptions_add(id.clone());
            if session.is_closing() {
                c.remove_subscriber(session);
                session.subscriptions_remove(id);
                return Err(BayeuxError::SessionRemoved(session.id.clone()));
            }
            Ok(true)
        });
        let added = match added {
            Ok(added) => added,
            Err(e) => {
                self.try_remove_channel(id);
                return Err(e);
            }
        };
        if added {
            self.stats.subscriptions.inc();
            log::debug!("{} subscribed to {}", session.id, id);
        }
        Ok(added)
    }

    pub fn unsubscribe(&self, session: &Session, id: &ChannelId) -> bool {
        let removed = self.channel(id).map(|c| c.remove_subscriber(session)).unwrap_or(false);
        session.subscriptions_remove(id);
        if removed {
            self.stats.subscriptions.dec();
            log::debug!("{} unsubscribed from {}", session.id, id);
            self.try_remove_channel(id);
        }
        removed
    }

    /// Drops every subscription of the session. Returns the number removed.
    pub fn unsubscribe_all(&self, session: &Session) -> usize {
        session.subscriptions().iter().filter(|id| self.unsubscribe(session, id)).count()
    }

    pub fn add_handler(&self, owner: &Session, service: ServiceName, pattern: ChannelId, handler: Handler) -> HandlerId {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        log::debug!("service '{}' mapped on {}, handler: {}", service, pattern, id);
        let entry = HandlerEntry { id, pattern: pattern.clone(), service, owner: owner.clone(), handler };
        self.with_channel(&pattern, |c| c.add_handler(entry));
        self.stats.handlers.inc();
        id
    }

    pub fn remove_handler(&self, pattern: &ChannelId, id: HandlerId) -> bool {
        self.remove_handlers_by(pattern, |h| h.id == id) > 0
    }

    /// Removes every handler `owner` has on `pattern`.
    pub fn remove_handlers(&self, pattern: &ChannelId, owner: &Session) -> usize {
        self.remove_handlers_by(pattern, |h| &h.owner == owner)
    }

    fn remove_handlers_by<F: Fn(&HandlerEntry) -> bool>(&self, pattern: &ChannelId, f: F) -> usize {
        let removed = self.channel(pattern).map(|c| c.remove_handlers(f)).unwrap_or(0);
        if removed > 0 {
            self.stats.handlers.decs(removed as isize);
            log::debug!("{} handler(s) removed from {}", removed, pattern);
            self.try_remove_channel(pattern);
        }
        removed
    }

    /// The literal channel and its wildcard ancestors that currently exist.
    fn matching(&self, id: &ChannelId) -> Vec<Arc<Channel>> {
        std::iter::once(id.clone()).chain(id.wilds()).filter_map(|c| self.channel(&c)).collect()
    }

    /// Routes `msg` to every matching service handler, then to every matching
    /// subscriber except `from` (unless it asked for its own messages).
    /// Messages on `/service/**` reach handlers only.
    pub async fn publish(&self, from: &Session, msg: &Message) -> Result<Published> {
        let id = msg.channel_id()?;
        if id.is_meta() || id.is_wildcard() {
            return Err(ChannelError::InvalidChannel(id.to_string(), "not a publishable channel").into());
        }
        self.stats.publishes.inc();

        let channels = self.matching(&id);
        let handlers: Vec<Arc<Vec<HandlerEntry>>> = channels.iter().map(|c| c.handlers()).collect();
        let subscribers: Vec<(ChannelId, Arc<Vec<Session>>)> = if id.is_service() {
            Vec::new()
        } else {
            channels.iter().map(|c| (c.id.clone(), c.subscribers())).collect()
        };

        let mut published = Published::default();
        for h in handlers.iter().flat_map(|hs| hs.iter()) {
            published.handlers += 1;
            match h.call(from, msg) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.stats.handler_faults.inc();
                    log::info!("service '{}' handler on {} failed for {}, {}", h.service, h.pattern, id, e);
                }
                Err(e) => {
                    self.stats.handler_faults.inc();
                    log::info!("service '{}' handler on {} panicked for {}, {}", h.service, h.pattern, id, e);
                }
            }
        }

        let mut seen = HashSet::default();
        let mut gone = Vec::new();
        for (channel, subs) in subscribers.iter() {
            for to in subs.iter() {
                if !seen.insert(to.id.clone()) {
                    continue;
                }
                if to == from && !from.broadcast_to_publisher() {
                    continue;
                }
                if to.is_removed() {
                    gone.push((channel.clone(), to.clone()));
                    continue;
                }
                if self.deliver(Some(from), to, msg.clone()).await {
                    published.delivered += 1;
                } else {
                    published.dropped += 1;
                }
            }
        }
        for (channel, session) in gone {
            log::debug!("{} is gone, dropping its subscription to {}", session.id, channel);
            self.unsubscribe(&session, &channel);
        }
        log::debug!("publish on {} by {}, {:?}", id, from.id, published);
        Ok(published)
    }

    /// Runs the outgoing extensions on `msg` and hands it to `to`. False if it was dropped.
    pub async fn deliver(&self, from: Option<&Session>, to: &Session, msg: Message) -> bool {
        let mut out = ServerMessage::new(msg);
        if !self.extensions.run_outgoing(from, Some(to), &mut out).await {
            self.stats.deliveries_dropped.inc();
            return false;
        }
        match to.deliver(out.into_message()) {
            Ok(()) => {
                self.stats.deliveries.inc();
                true
            }
            Err(BayeuxError::SessionRemoved(id)) => {
                log::debug!("{} is gone, delivery dropped", id);
                self.stats.deliveries_dropped.inc();
                false
            }
            Err(e) => {
                log::warn!("{} delivery dropped, {}", to.id, e);
                self.stats.deliveries_dropped.inc();
                false
            }
        }
    }
}
