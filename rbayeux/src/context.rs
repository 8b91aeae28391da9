use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::conf::Settings;
use crate::dispatch::{Dispatcher, Published};
use crate::error::BayeuxError;
use crate::extension::ExtensionManager;
use crate::message::{Message, ServerMessage};
use crate::presence::UserSessions;
use crate::registry::SessionRegistry;
use crate::security::{SecurityGate, SecurityPolicy};
use crate::session::Session;
use crate::stats::Stats;
use crate::types::RemoveReason;
use crate::Result;

/// Owns every shared component of one server instance.
#[derive(Clone)]
pub struct ServerContext {
    inner: Arc<ServerContextInner>,
}

pub struct ServerContextInner {
    pub settings: Settings,
    pub registry: SessionRegistry,
    pub dispatcher: Dispatcher,
    pub extensions: Arc<ExtensionManager>,
    pub security: SecurityGate,
    pub users: Arc<UserSessions>,
    pub stats: Arc<Stats>,
}

impl Deref for ServerContext {
    type Target = ServerContextInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Default for ServerContext {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl ServerContext {
    pub fn new(settings: Settings) -> Self {
        let extensions = Arc::new(ExtensionManager::new());
        let stats = Arc::new(Stats::new());
        let security = SecurityGate::new(settings.bayeux.security_timeout);
        ServerContext {
            inner: Arc::new(ServerContextInner {
                registry: SessionRegistry::new(),
                dispatcher: Dispatcher::new(extensions.clone(), stats.clone()),
                extensions,
                security,
                users: UserSessions::new(),
                stats,
                settings,
            }),
        }
    }

    #[inline]
    pub fn set_security_policy(&self, policy: Arc<dyn SecurityPolicy>) {
        self.security.set_policy(policy);
    }

    /// A remote session with the configured queue bound and self-delivery default.
    #[inline]
    pub fn new_remote_session(&self) -> Session {
        Session::new_remote(self.settings.bayeux.max_queue, self.settings.bayeux.broadcast_to_publisher)
    }

    #[inline]
    pub fn new_local_session(&self) -> Session {
        Session::new_local(self.settings.bayeux.broadcast_to_publisher)
    }

    /// Registers a session that has passed the handshake check.
    pub fn register_session(&self, session: &Session) -> Result<()> {
        self.registry.register(session.clone())?;
        session.set_handshook(true);
        session.touch();
        self.stats.sessions.inc();
        Ok(())
    }

    #[inline]
    pub fn find_session(&self, id: &str) -> Option<Session> {
        self.registry.find(id)
    }

    /// Takes the session out of the registry, drops its subscriptions and only
    /// then fires removal listeners. A second call for the same id does nothing.
    pub fn remove_session(&self, id: &str, reason: RemoveReason) -> Option<Session> {
        let session = self.registry.take(id)?;
        let unsubscribed = self.dispatcher.unsubscribe_all(&session);
        self.stats.sessions.dec();
        if reason == RemoveReason::Expired {
            self.stats.expired.inc();
        }
        log::debug!("{} removing, reason: {}, subscriptions dropped: {}", id, reason, unsubscribed);
        self.registry.notify_removed(&session, reason);
        Some(session)
    }

    /// Server-originated publish from a session living in this process.
    ///
    /// Goes through the incoming extensions and the security gate like a
    /// transport publish. `Ok(None)` means an extension or the gate stopped it;
    /// a removed sender is an error.
    pub async fn publish_local(&self, from: &Session, msg: Message) -> Result<Option<Published>> {
        if from.is_closing() {
            return Err(BayeuxError::SessionRemoved(from.id.clone()));
        }
        let mut msg = ServerMessage::new(msg);
        if !self.extensions.run_incoming(Some(from), &mut msg).await {
            self.stats.vetoes.inc();
            return Ok(None);
        }
        let channel = msg.channel_id()?;
        if !self.dispatcher.has_channel(&channel) && !self.security.can_create(from, &channel, &mut msg).await {
            return Ok(None);
        }
        if !self.security.can_publish(from, &channel, &mut msg).await {
            self.stats.publishes_denied.inc();
            return Ok(None);
        }
        self.dispatcher.publish(from, msg.message()).await.map(Some)
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ServerContext ...")?;
        Ok(())
    }
}
