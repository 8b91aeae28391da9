//! Protocol processor.
//!
//! Takes one parsed message from a transport, runs it through the extension
//! chain, the security gate and the dispatcher, and returns the reply the
//! transport should send back. Deliveries for other sessions end up in their
//! outbound queues or local listeners.

use crate::channel::{ChannelId, MetaChannel};
use crate::context::ServerContext;
use crate::dispatch::Published;
use crate::message::*;
use crate::session::Session;
use crate::types::*;
use crate::Result;

#[derive(Clone)]
pub struct BayeuxServer {
    scx: ServerContext,
}

impl BayeuxServer {
    #[inline]
    pub fn new(scx: ServerContext) -> Self {
        Self { scx }
    }

    #[inline]
    pub fn context(&self) -> &ServerContext {
        &self.scx
    }

    /// Handles a batch in order, skipping replies the outgoing chain dropped.
    pub async fn handle_batch(&self, msgs: Vec<Message>) -> Vec<Message> {
        let mut replies = Vec::with_capacity(msgs.len());
        for msg in msgs {
            if let Some(reply) = self.handle(msg).await {
                replies.push(reply);
            }
        }
        replies
    }

    /// Processes one message and returns its reply, or `None` if an outgoing
    /// extension vetoed the reply. Messages from one session are handled one
    /// at a time, in arrival order.
    pub async fn handle(&self, msg: Message) -> Option<Message> {
        // Local sessions never come through a transport.
        let session = msg.client_id.as_ref().and_then(|id| self.scx.find_session(id)).filter(|s| !s.is_local());
        let _processing = match session.as_ref() {
            Some(s) => Some(s.processing().await),
            None => None,
        };
        if let Some(s) = session.as_ref() {
            s.touch();
        }

        let meta = MetaChannel::from_channel(&msg.channel);
        let mut msg = ServerMessage::request(msg);
        if self.extensions_apply(&msg.channel) && !self.scx.extensions.run_incoming(session.as_ref(), &mut msg).await {
            self.scx.stats.vetoes.inc();
            Self::fail(&mut msg, ERR_MESSAGE_DELETED);
            return self.reply(session.as_ref(), msg).await;
        }

        let to = match meta {
            Some(MetaChannel::Handshake) => Some(self.handshake(&mut msg).await),
            Some(MetaChannel::Connect) => self.connect(session.clone(), &mut msg),
            Some(MetaChannel::Subscribe) => self.subscribe(session.clone(), &mut msg).await,
            Some(MetaChannel::Unsubscribe) => self.unsubscribe(session.clone(), &mut msg),
            Some(MetaChannel::Disconnect) => self.disconnect(session.clone(), &mut msg),
            None => self.publish(session.clone(), &mut msg).await,
        };
        self.reply(to.as_ref(), msg).await
    }

    /// Server-originated publish on behalf of a local session.
    #[inline]
    pub async fn publish_local(&self, from: &Session, msg: Message) -> Result<Option<Published>> {
        self.scx.publish_local(from, msg).await
    }

    #[inline]
    fn extensions_apply(&self, channel: &str) -> bool {
        !channel.starts_with("/meta/") || self.scx.settings.bayeux.extensions_apply_to_meta(channel)
    }

    async fn reply(&self, to: Option<&Session>, mut msg: ServerMessage) -> Option<Message> {
        let reply = msg.take_associated()?;
        if !self.extensions_apply(&reply.channel) {
            return Some(reply);
        }
        let mut reply = ServerMessage::new(reply);
        if self.scx.extensions.run_outgoing(to, to, &mut reply).await {
            Some(reply.into_message())
        } else {
            log::debug!("reply on {} dropped by an outgoing extension", reply.channel);
            None
        }
    }

    fn advice_retry(&self) -> Advice {
        let bayeux = &self.scx.settings.bayeux;
        Advice {
            reconnect: Some(Reconnect::Retry),
            interval: Some(bayeux.handshake_interval.as_millis() as u64),
            timeout: Some(bayeux.connect_timeout.as_millis() as u64),
        }
    }

    /// Always yields the new session so outgoing extensions can see it; it is
    /// registered only when the gate allowed the handshake.
    async fn handshake(&self, msg: &mut ServerMessage) -> Session {
        let session = self.scx.new_remote_session();
        self.scx.stats.handshakes.inc();
        let allowed = self.scx.security.can_handshake(&session, msg).await;
        let registered = if allowed {
            match self.scx.register_session(&session) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("{} register failed, {}", session.id, e);
                    false
                }
            }
        } else {
            false
        };

        if !registered {
            self.scx.stats.handshakes_denied.inc();
            Self::fail(msg, ERR_HANDSHAKE_DENIED);
            if let Some(reply) = msg.associated_mut() {
                reply.advice.get_or_insert_with(|| Advice::reconnect(Reconnect::Handshake));
                reply.client_id = None;
            }
            // Listeners the policy attached to the rejected session still fire once.
            session.fire_removed(RemoveReason::Disconnected);
            log::info!("handshake denied, session: {}", session.id);
            return session;
        }

        let advice = self.advice_retry();
        if let Some(reply) = msg.associated_mut() {
            reply.succeed();
            reply.client_id = Some(session.id.clone());
            reply.version = Some(BAYEUX_VERSION.into());
            reply.minimum_version = Some(BAYEUX_MINIMUM_VERSION.into());
            reply.supported_connection_types = Some(SUPPORTED_CONNECTION_TYPES.iter().map(|c| c.to_string()).collect());
            reply.advice = Some(advice);
        }
        log::debug!("{} handshake succeeded", session.id);
        session
    }

    /// Fails the reply as unknown and asks the client to handshake again.
    fn unknown(&self, msg: &mut ServerMessage) -> Option<Session> {
        if let Some(reply) = msg.associated_mut() {
            reply.fail(ERR_SESSION_UNKNOWN);
            reply.advice = Some(Advice::reconnect(Reconnect::Handshake));
        }
        None
    }

    fn fail(msg: &mut ServerMessage, error: &str) {
        if let Some(reply) = msg.associated_mut() {
            if reply.error.is_none() {
                reply.fail(error);
            } else {
                reply.successful = Some(false);
            }
        }
    }

    fn succeed(msg: &mut ServerMessage) {
        if let Some(reply) = msg.associated_mut() {
            reply.succeed();
        }
    }

    fn connect(&self, session: Option<Session>, msg: &mut ServerMessage) -> Option<Session> {
        let Some(session) = session.filter(|s| s.is_handshook()) else {
            return self.unknown(msg);
        };
        session.set_connected(true);
        let advice = self.advice_retry();
        if let Some(reply) = msg.associated_mut() {
            reply.succeed();
            reply.advice = Some(advice);
        }
        Some(session)
    }

    fn subscription(msg: &mut ServerMessage) -> Option<ChannelId> {
        let Some(subscription) = msg.subscription.clone() else {
            Self::fail(msg, ERR_MISSING_SUBSCRIPTION);
            return None;
        };
        match ChannelId::parse(&subscription) {
            Ok(id) => Some(id),
            Err(e) => {
                log::debug!("invalid subscription {}, {}", subscription, e);
                Self::fail(msg, ERR_INVALID_CHANNEL);
                None
            }
        }
    }

    async fn subscribe(&self, session: Option<Session>, msg: &mut ServerMessage) -> Option<Session> {
        let Some(session) = session else {
            return self.unknown(msg);
        };
        let Some(channel) = Self::subscription(msg) else {
            return Some(session);
        };
        if channel.is_meta() {
            Self::fail(msg, ERR_SUBSCRIBE_DENIED);
            return Some(session);
        }
        let security = &self.scx.security;
        if !self.scx.dispatcher.has_channel(&channel) && !security.can_create(&session, &channel, msg).await {
            Self::fail(msg, ERR_CREATE_DENIED);
            return Some(session);
        }
        if !security.can_subscribe(&session, &channel, msg).await {
            Self::fail(msg, ERR_SUBSCRIBE_DENIED);
            return Some(session);
        }
        match self.scx.dispatcher.subscribe(&session, &channel) {
            Ok(_) => Self::succeed(msg),
            Err(e) => {
                log::debug!("{} subscribe to {} failed, {}", session.id, channel, e);
                Self::fail(msg, ERR_SUBSCRIBE_DENIED);
            }
        }
        Some(session)
    }

    fn unsubscribe(&self, session: Option<Session>, msg: &mut ServerMessage) -> Option<Session> {
        let Some(session) = session else {
            return self.unknown(msg);
        };
        if let Some(channel) = Self::subscription(msg) {
            self.scx.dispatcher.unsubscribe(&session, &channel);
            Self::succeed(msg);
        }
        Some(session)
    }

    fn disconnect(&self, session: Option<Session>, msg: &mut ServerMessage) -> Option<Session> {
        let Some(session) = session else {
            return self.unknown(msg);
        };
        self.scx.remove_session(&session.id, RemoveReason::Disconnected);
        Self::succeed(msg);
        Some(session)
    }

    async fn publish(&self, session: Option<Session>, msg: &mut ServerMessage) -> Option<Session> {
        let Some(session) = session else {
            return self.unknown(msg);
        };
        let channel = match msg.channel_id() {
            Ok(c) if !c.is_meta() && !c.is_wildcard() => c,
            _ => {
                Self::fail(msg, ERR_INVALID_CHANNEL);
                return Some(session);
            }
        };
        let security = &self.scx.security;
        if !self.scx.dispatcher.has_channel(&channel) && !security.can_create(&session, &channel, msg).await {
            Self::fail(msg, ERR_CREATE_DENIED);
            return Some(session);
        }
        if !security.can_publish(&session, &channel, msg).await {
            self.scx.stats.publishes_denied.inc();
            Self::fail(msg, ERR_PUBLISH_DENIED);
            return Some(session);
        }

        // Recipients do not learn the publisher's session id.
        let mut outgoing = msg.message().clone();
        outgoing.client_id = None;
        match self.scx.dispatcher.publish(&session, &outgoing).await {
            Ok(_) => Self::succeed(msg),
            Err(e) => {
                log::debug!("{} publish on {} failed, {}", session.id, channel, e);
                Self::fail(msg, ERR_INVALID_CHANNEL);
            }
        }
        Some(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Settings;
    use crate::extension::Extension;
    use crate::security::SecurityPolicy;
    use crate::types::{Allowed, Proceed};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct TokenPolicy;

    #[async_trait]
    impl SecurityPolicy for TokenPolicy {
        async fn can_handshake(&self, _s: &Session, msg: &mut ServerMessage) -> Allowed {
            msg.ext_get("token") == Some(&json!("letmein"))
        }
        async fn can_publish(&self, _s: &Session, channel: &ChannelId, _m: &mut ServerMessage) -> Allowed {
            !channel.as_str().starts_with("/readonly")
        }
    }

    fn server(toml: &str) -> BayeuxServer {
        let _ = simple_logger::SimpleLogger::new().with_level(log::LevelFilter::Info).init();
        BayeuxServer::new(ServerContext::new(Settings::from_toml(toml).unwrap()))
    }

    async fn handshake(server: &BayeuxServer) -> SessionId {
        let reply = server.handle(Message::new("/meta/handshake")).await.unwrap();
        assert!(reply.is_successful());
        reply.client_id.unwrap()
    }

    fn meta(channel: &str, id: &SessionId) -> Message {
        Message::new(channel).with_client_id(id.clone())
    }

    #[tokio::test]
    async fn test_handshake_denied() {
        let server = server("");
        server.context().set_security_policy(Arc::new(TokenPolicy));

        let reply = server.handle(Message::new("/meta/handshake").with_ext("token", json!("nope"))).await.unwrap();
        assert!(!reply.is_successful());
        assert_eq!(reply.error.as_deref(), Some(ERR_HANDSHAKE_DENIED));
        assert_eq!(reply.advice.and_then(|a| a.reconnect), Some(Reconnect::Handshake));
        assert!(reply.client_id.is_none());
        assert!(server.context().registry.is_empty());

        let reply = server.handle(Message::new("/meta/handshake").with_ext("token", json!("letmein"))).await.unwrap();
        assert!(reply.is_successful());
        assert_eq!(reply.version.as_deref(), Some(BAYEUX_VERSION));
        assert_eq!(reply.advice.as_ref().and_then(|a| a.reconnect), Some(Reconnect::Retry));
        assert_eq!(reply.advice.as_ref().and_then(|a| a.timeout), Some(30_000));
        let id = reply.client_id.unwrap();
        assert!(server.context().find_session(&id).unwrap().is_handshook());
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let server = server("");
        let ghost = SessionId::from("ghost");
        for channel in ["/meta/connect", "/meta/subscribe", "/meta/unsubscribe", "/meta/disconnect", "/chat/x"] {
            let reply = server.handle(meta(channel, &ghost).with_subscription("/chat/x")).await.unwrap();
            assert_eq!(reply.error.as_deref(), Some(ERR_SESSION_UNKNOWN), "{}", channel);
            assert_eq!(reply.advice.and_then(|a| a.reconnect), Some(Reconnect::Handshake));
        }
    }

    #[tokio::test]
    async fn test_local_session_not_usable_from_transport() {
        let server = server("");
        server.context().set_security_policy(Arc::new(TokenPolicy));
        let svc = crate::service::Service::new(server.context(), "audit").await.unwrap();
        let local_id = svc.session().id.clone();

        let reply = server.handle(meta("/meta/subscribe", &local_id).with_subscription("/audit/log")).await.unwrap();
        assert_eq!(reply.error.as_deref(), Some(ERR_SESSION_UNKNOWN));
        let reply =
            server.handle(Message::new("/audit/log").with_client_id(local_id.clone()).with_data(json!(1))).await.unwrap();
        assert_eq!(reply.error.as_deref(), Some(ERR_SESSION_UNKNOWN));
        let reply = server.handle(meta("/meta/disconnect", &local_id)).await.unwrap();
        assert_eq!(reply.error.as_deref(), Some(ERR_SESSION_UNKNOWN));

        assert!(svc.session().subscriptions().is_empty());
        assert!(server.context().find_session(&local_id).is_some());
    }

    #[tokio::test]
    async fn test_chat_scenario() {
        for self_delivery in [false, true] {
            let server = server(&format!("[bayeux]\nbroadcast_to_publisher = {}\n", self_delivery));
            let a = handshake(&server).await;
            let b = handshake(&server).await;
            for id in [&a, &b] {
                let reply = server.handle(meta("/meta/connect", id)).await.unwrap();
                assert!(reply.is_successful());
                let reply = server.handle(meta("/meta/subscribe", id).with_subscription("/chat/room1")).await.unwrap();
                assert!(reply.is_successful());
                assert_eq!(reply.subscription.as_deref(), Some("/chat/room1"));
            }

            let publish = meta("/chat/room1", &a).with_data(json!({"text": "hi"}));
            let reply = server.handle(publish).await.unwrap();
            assert!(reply.is_successful());
            assert!(reply.data.is_none());

            let sa = server.context().find_session(&a).unwrap();
            let sb = server.context().find_session(&b).unwrap();
            let got_b = sb.drain();
            assert_eq!(got_b.len(), 1);
            assert_eq!(got_b[0].data, Some(json!({"text": "hi"})));
            assert!(got_b[0].client_id.is_none());
            assert_eq!(sa.drain().len(), usize::from(self_delivery));
        }
    }

    #[tokio::test]
    async fn test_subscribe_rules() {
        let server = server("");
        let a = handshake(&server).await;
        let reply = server.handle(meta("/meta/subscribe", &a)).await.unwrap();
        assert_eq!(reply.error.as_deref(), Some(ERR_MISSING_SUBSCRIPTION));
        let reply = server.handle(meta("/meta/subscribe", &a).with_subscription("chat")).await.unwrap();
        assert_eq!(reply.error.as_deref(), Some(ERR_INVALID_CHANNEL));
        let reply = server.handle(meta("/meta/subscribe", &a).with_subscription("/meta/connect")).await.unwrap();
        assert_eq!(reply.error.as_deref(), Some(ERR_SUBSCRIBE_DENIED));
        let reply = server.handle(meta("/meta/subscribe", &a).with_subscription("/news/**")).await.unwrap();
        assert!(reply.is_successful());
        let reply = server.handle(meta("/meta/unsubscribe", &a).with_subscription("/news/**")).await.unwrap();
        assert!(reply.is_successful());
        assert!(server.context().dispatcher.channels().is_empty());
    }

    #[tokio::test]
    async fn test_publish_denied_and_disconnect() {
        let server = server("");
        server.context().set_security_policy(Arc::new(TokenPolicy));
        let a = {
            let reply = server
                .handle(Message::new("/meta/handshake").with_ext("token", json!("letmein")))
                .await
                .unwrap();
            reply.client_id.unwrap()
        };
        let reply = server.handle(meta("/readonly/feed", &a).with_data(json!(1))).await.unwrap();
        assert_eq!(reply.error.as_deref(), Some(ERR_PUBLISH_DENIED));
        let reply = server.handle(meta("/chat/*", &a).with_data(json!(1))).await.unwrap();
        assert_eq!(reply.error.as_deref(), Some(ERR_INVALID_CHANNEL));

        let reply = server.handle(meta("/meta/disconnect", &a)).await.unwrap();
        assert!(reply.is_successful());
        assert!(server.context().find_session(&a).is_none());
        let reply = server.handle(meta("/meta/connect", &a)).await.unwrap();
        assert_eq!(reply.error.as_deref(), Some(ERR_SESSION_UNKNOWN));
    }

    /// Vetoes publishes on `/blocked/**` and every handshake carrying `ext.spam`.
    struct Filter;

    #[async_trait]
    impl Extension for Filter {
        fn name(&self) -> &str {
            "filter"
        }

        async fn incoming(&self, _from: Option<&Session>, msg: &mut ServerMessage) -> Result<Proceed> {
            Ok(!msg.channel.starts_with("/blocked") && msg.ext_get("spam").is_none())
        }
    }

    #[tokio::test]
    async fn test_incoming_veto_never_dispatches() {
        let server = server("");
        server.context().extensions.add(Arc::new(Filter));
        let a = handshake(&server).await;
        let b = handshake(&server).await;
        server.handle(meta("/meta/subscribe", &b).with_subscription("/blocked/room")).await.unwrap();

        let reply = server.handle(meta("/blocked/room", &a).with_data(json!(1))).await.unwrap();
        assert!(!reply.is_successful());
        assert_eq!(reply.error.as_deref(), Some(ERR_MESSAGE_DELETED));
        let sb = server.context().find_session(&b).unwrap();
        assert_eq!(sb.queue_len(), 0);

        let reply = server.handle(Message::new("/meta/handshake").with_ext("spam", json!(true))).await.unwrap();
        assert_eq!(reply.error.as_deref(), Some(ERR_MESSAGE_DELETED));
        assert_eq!(server.context().registry.len(), 2);
    }

    #[tokio::test]
    async fn test_meta_extension_filter() {
        let server = server("[bayeux]\nextension_meta_channels = [\"/meta/subscribe\"]\n");
        server.context().extensions.add(Arc::new(Filter));
        let reply = server.handle(Message::new("/meta/handshake").with_ext("spam", json!(true))).await.unwrap();
        assert!(reply.is_successful());
        let a = reply.client_id.unwrap();
        let reply =
            server.handle(meta("/meta/subscribe", &a).with_subscription("/x").with_ext("spam", json!(1))).await.unwrap();
        assert_eq!(reply.error.as_deref(), Some(ERR_MESSAGE_DELETED));
    }

    #[tokio::test]
    async fn test_batch() {
        let server = server("");
        let a = handshake(&server).await;
        let replies = server
            .handle_batch(vec![
                meta("/meta/subscribe", &a).with_subscription("/x"),
                meta("/meta/connect", &a),
                meta("/meta/disconnect", &a),
            ])
            .await;
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(|r| r.is_successful()));
        assert_eq!(replies[1].channel, "/meta/connect");
    }
}
