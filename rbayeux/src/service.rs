//! Application services.
//!
//! A [`Service`] owns a local session registered under the service name and
//! maps handlers onto channel patterns explicitly:
//!
//! ```rust,ignore
//! let echo = Service::new(&scx, "echo").await?;
//! let replier = echo.clone();
//! echo.add_mapping("/service/echo", move |from, msg| {
//!     let (replier, from, data) = (replier.clone(), from.clone(), msg.data.clone());
//!     tokio::spawn(async move { replier.deliver(&from, "/service/echo", data).await });
//!     Ok(())
//! })?;
//! ```

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::channel::{ChannelId, MetaChannel};
use crate::context::ServerContext;
use crate::dispatch::{HandlerId, Published};
use crate::error::BayeuxError;
use crate::message::{Message, ServerMessage};
use crate::session::Session;
use crate::types::{RemoveReason, ServiceName};
use crate::Result;

#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    name: ServiceName,
    session: Session,
    scx: ServerContext,
    mappings: Mutex<Vec<(ChannelId, HandlerId)>>,
}

impl Service {
    /// Creates and registers the service's local session.
    pub async fn new<N: Into<ServiceName>>(scx: &ServerContext, name: N) -> Result<Service> {
        let name = name.into();
        let session = scx.new_local_session();
        let mut handshake = ServerMessage::request(Message::new(MetaChannel::HANDSHAKE));
        if !scx.security.can_handshake(&session, &mut handshake).await {
            return Err(BayeuxError::from(format!("service '{}' handshake denied", name)));
        }
        scx.register_session(&session)?;
        session.set_connected(true);
        session.set_attribute("service", json!(&*name));
        log::info!("service '{}' started, session: {}", name, session.id);
        Ok(Service {
            inner: Arc::new(ServiceInner { name, session, scx: scx.clone(), mappings: Mutex::new(Vec::new()) }),
        })
    }

    #[inline]
    pub fn name(&self) -> &ServiceName {
        &self.inner.name
    }

    #[inline]
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    #[inline]
    pub fn context(&self) -> &ServerContext {
        &self.inner.scx
    }

    /// Maps `handler` on `pattern`. It runs for every later publish on a matching channel.
    pub fn add_mapping<F>(&self, pattern: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(&Session, &Message) -> Result<()> + Send + Sync + 'static,
    {
        let pattern = ChannelId::parse(pattern)?;
        let id = self.inner.scx.dispatcher.add_handler(
            &self.inner.session,
            self.inner.name.clone(),
            pattern.clone(),
            Arc::new(handler),
        );
        self.inner.mappings.lock().push((pattern, id));
        Ok(id)
    }

    /// Removes every handler this service has on `pattern`.
    pub fn remove_mapping(&self, pattern: &str) -> Result<usize> {
        let pattern = ChannelId::parse(pattern)?;
        self.inner.mappings.lock().retain(|(p, _)| p != &pattern);
        Ok(self.inner.scx.dispatcher.remove_handlers(&pattern, &self.inner.session))
    }

    pub fn remove_all_mappings(&self) -> usize {
        let mappings = std::mem::take(&mut *self.inner.mappings.lock());
        mappings.iter().filter(|(p, id)| self.inner.scx.dispatcher.remove_handler(p, *id)).count()
    }

    #[inline]
    pub fn mappings(&self) -> Vec<ChannelId> {
        self.inner.mappings.lock().iter().map(|(p, _)| p.clone()).collect()
    }

    /// Publishes from the service session to everything matching `channel`.
    pub async fn publish(&self, channel: &str, data: Value) -> Result<Option<Published>> {
        let msg = Message::new(channel).with_data(data);
        self.inner.scx.publish_local(&self.inner.session, msg).await
    }

    /// Sends one message straight to `to`, bypassing channel subscriptions.
    pub async fn deliver(&self, to: &Session, channel: &str, data: Option<Value>) -> bool {
        let mut msg = Message::new(channel);
        msg.data = data;
        self.inner.scx.dispatcher.deliver(Some(&self.inner.session), to, msg).await
    }

    /// Removes every mapping and the service session.
    pub fn stop(&self) {
        let removed = self.remove_all_mappings();
        self.inner.scx.remove_session(&self.inner.session.id, RemoveReason::Disconnected);
        log::info!("service '{}' stopped, mappings removed: {}", self.inner.name, removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityPolicy;
    use crate::types::Allowed;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct DenyAll;

    #[async_trait]
    impl SecurityPolicy for DenyAll {
        async fn can_handshake(&self, _s: &Session, _m: &mut ServerMessage) -> Allowed {
            false
        }
        async fn can_create(&self, _s: &Session, _c: &ChannelId, _m: &mut ServerMessage) -> Allowed {
            false
        }
        async fn can_publish(&self, _s: &Session, _c: &ChannelId, _m: &mut ServerMessage) -> Allowed {
            false
        }
    }

    #[tokio::test]
    async fn test_service_lifecycle() {
        let scx = ServerContext::default();
        scx.set_security_policy(Arc::new(DenyAll));
        let svc = Service::new(&scx, "orders").await.unwrap();
        assert!(svc.session().is_local());
        assert!(scx.find_session(&svc.session().id).is_some());
        assert_eq!(svc.session().attribute("service"), Some(json!("orders")));

        let hits = Arc::new(AtomicUsize::new(0));
        for pattern in ["/orders/*", "/orders/**"] {
            let hits = hits.clone();
            svc.add_mapping(pattern, move |_, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        }
        assert!(svc.add_mapping("orders", |_, _| Ok(())).is_err());

        let watcher = scx.new_remote_session();
        scx.register_session(&watcher).unwrap();
        scx.dispatcher.subscribe(&watcher, &ChannelId::parse("/orders/new").unwrap()).unwrap();

        let published = svc.publish("/orders/new", json!({"id": 7})).await.unwrap().unwrap();
        assert_eq!(published.handlers, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(watcher.drain()[0].data, Some(json!({"id": 7})));

        assert!(svc.deliver(&watcher, "/orders/direct", Some(json!("hi"))).await);
        assert_eq!(watcher.drain()[0].channel, "/orders/direct");

        assert_eq!(svc.remove_mapping("/orders/**").unwrap(), 1);
        assert_eq!(svc.mappings(), vec![ChannelId::parse("/orders/*").unwrap()]);
        svc.stop();
        assert!(scx.find_session(&svc.session().id).is_none());
        assert!(scx.dispatcher.channel(&ChannelId::parse("/orders/*").unwrap()).is_none());
        assert!(matches!(svc.publish("/orders/new", json!(1)).await, Err(BayeuxError::SessionRemoved(_))));
        assert!(watcher.drain().is_empty());
    }
}
