//! Authorization checkpoint for handshake, channel creation, subscribe and publish.
//!
//! A deployment installs one [`SecurityPolicy`]; the [`SecurityGate`] wraps it
//! so that local sessions are always allowed, a slow policy is cut off after
//! the configured timeout, and a panicking policy counts as a denial.
//!
//! Policies that resolve through callbacks rather than `async` code can use
//! [`Promise`]: completing it consumes it, and dropping it unresolved denies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::oneshot;

use crate::channel::ChannelId;
use crate::message::ServerMessage;
use crate::session::Session;
use crate::types::Allowed;
use crate::utils::catch_async;

#[async_trait]
pub trait SecurityPolicy: Send + Sync {
    fn name(&self) -> &str {
        "default"
    }

    /// `session` is not registered yet; the reply is reachable through `msg.associated_mut()`.
    async fn can_handshake(&self, _session: &Session, _msg: &mut ServerMessage) -> Allowed {
        true
    }

    async fn can_create(&self, _session: &Session, _channel: &ChannelId, _msg: &mut ServerMessage) -> Allowed {
        true
    }

    async fn can_subscribe(
        &self,
        _session: &Session,
        _channel: &ChannelId,
        _msg: &mut ServerMessage,
    ) -> Allowed {
        true
    }

    async fn can_publish(&self, _session: &Session, _channel: &ChannelId, _msg: &mut ServerMessage) -> Allowed {
        true
    }
}

/// Allows everything.
pub struct DefaultSecurityPolicy;

#[async_trait]
impl SecurityPolicy for DefaultSecurityPolicy {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Handshake,
    Create,
    Subscribe,
    Publish,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Handshake => f.write_str("handshake"),
            Operation::Create => f.write_str("create"),
            Operation::Subscribe => f.write_str("subscribe"),
            Operation::Publish => f.write_str("publish"),
        }
    }
}

/// Write side of a single-fire authorization decision.
pub struct Promise {
    tx: oneshot::Sender<Allowed>,
}

/// Read side of a [`Promise`].
pub struct PromiseReceiver {
    rx: oneshot::Receiver<Allowed>,
}

impl Promise {
    #[inline]
    pub fn new() -> (Promise, PromiseReceiver) {
        let (tx, rx) = oneshot::channel();
        (Promise { tx }, PromiseReceiver { rx })
    }

    #[inline]
    pub fn complete(self, allowed: Allowed) {
        if self.tx.send(allowed).is_err() {
            log::debug!("authorization decision arrived after the requester gave up");
        }
    }

    #[inline]
    pub fn allow(self) {
        self.complete(true)
    }

    #[inline]
    pub fn deny(self) {
        self.complete(false)
    }
}

impl PromiseReceiver {
    /// Waits for the decision. A dropped promise or an elapsed `timeout` is a denial.
    pub async fn resolve(self, timeout: Duration) -> Allowed {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(allowed)) => allowed,
            Ok(Err(_)) => {
                log::warn!("authorization promise dropped without a decision, denied");
                false
            }
            Err(_) => {
                log::warn!("authorization promise not completed within {:?}, denied", timeout);
                false
            }
        }
    }
}

pub struct SecurityGate {
    policy: RwLock<Arc<dyn SecurityPolicy>>,
    timeout: Duration,
}

impl SecurityGate {
    /// `timeout` bounds every policy decision; `Duration::ZERO` leaves it unbounded.
    #[inline]
    pub fn new(timeout: Duration) -> Self {
        Self { policy: RwLock::new(Arc::new(DefaultSecurityPolicy)), timeout }
    }

    #[inline]
    pub fn set_policy(&self, policy: Arc<dyn SecurityPolicy>) {
        log::info!("security policy set to '{}'", policy.name());
        *self.policy.write() = policy;
    }

    #[inline]
    pub fn policy(&self) -> Arc<dyn SecurityPolicy> {
        self.policy.read().clone()
    }

    /// Runs one decision through the policy. `channel` is ignored for handshake.
    pub async fn check(
        &self,
        op: Operation,
        session: &Session,
        channel: Option<&ChannelId>,
        msg: &mut ServerMessage,
    ) -> Allowed {
        if session.is_local() {
            return true;
        }
        let policy = self.policy();
        let decision = async {
            match (op, channel) {
                (Operation::Handshake, _) => policy.can_handshake(session, msg).await,
                (Operation::Create, Some(c)) => policy.can_create(session, c, msg).await,
                (Operation::Subscribe, Some(c)) => policy.can_subscribe(session, c, msg).await,
                (Operation::Publish, Some(c)) => policy.can_publish(session, c, msg).await,
                (op, None) => {
                    log::warn!("{} {} check without a channel, denied", session.id, op);
                    false
                }
            }
        };

        let result = if self.timeout.is_zero() {
            Ok(catch_async(decision).await)
        } else {
            tokio::time::timeout(self.timeout, catch_async(decision)).await
        };

        let allowed = match result {
            Ok(Ok(allowed)) => allowed,
            Ok(Err(e)) => {
                log::error!("{} security policy '{}' panicked on {}, denied, {}", session.id, policy.name(), op, e);
                false
            }
            Err(_) => {
                log::warn!(
                    "{} security policy '{}' did not decide {} within {:?}, denied",
                    session.id,
                    policy.name(),
                    op,
                    self.timeout
                );
                false
            }
        };
        log::debug!("{} {} {:?} allowed: {}", session.id, op, channel, allowed);
        allowed
    }

    #[inline]
    pub async fn can_handshake(&self, session: &Session, msg: &mut ServerMessage) -> Allowed {
        self.check(Operation::Handshake, session, None, msg).await
    }

    #[inline]
    pub async fn can_create(&self, session: &Session, channel: &ChannelId, msg: &mut ServerMessage) -> Allowed {
        self.check(Operation::Create, session, Some(channel), msg).await
    }

    #[inline]
    pub async fn can_subscribe(&self, session: &Session, channel: &ChannelId, msg: &mut ServerMessage) -> Allowed {
        self.check(Operation::Subscribe, session, Some(channel), msg).await
    }

    #[inline]
    pub async fn can_publish(&self, session: &Session, channel: &ChannelId, msg: &mut ServerMessage) -> Allowed {
        self.check(Operation::Publish, session, Some(channel), msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use serde_json::json;

    struct DenyAll;

    #[async_trait]
    impl SecurityPolicy for DenyAll {
        fn name(&self) -> &str {
            "deny-all"
        }
        async fn can_handshake(&self, _s: &Session, _m: &mut ServerMessage) -> Allowed {
            false
        }
        async fn can_subscribe(&self, _s: &Session, _c: &ChannelId, _m: &mut ServerMessage) -> Allowed {
            false
        }
        async fn can_publish(&self, _s: &Session, _c: &ChannelId, _m: &mut ServerMessage) -> Allowed {
            false
        }
    }

    /// Decides through a promise completed from another task after inspecting credentials.
    struct TokenLookup;

    #[async_trait]
    impl SecurityPolicy for TokenLookup {
        async fn can_handshake(&self, _s: &Session, msg: &mut ServerMessage) -> Allowed {
            let token = msg.ext_get("token").and_then(|t| t.as_str()).map(String::from);
            let (promise, rx) = Promise::new();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                promise.complete(token.as_deref() == Some("secret"));
            });
            rx.resolve(Duration::from_secs(1)).await
        }
    }

    struct Slow;

    #[async_trait]
    impl SecurityPolicy for Slow {
        async fn can_handshake(&self, _s: &Session, _m: &mut ServerMessage) -> Allowed {
            tokio::time::sleep(Duration::from_secs(10)).await;
            true
        }
    }

    struct Panics;

    #[async_trait]
    impl SecurityPolicy for Panics {
        async fn can_publish(&self, _s: &Session, _c: &ChannelId, _m: &mut ServerMessage) -> Allowed {
            panic!("policy bug")
        }
    }

    fn handshake(ext: serde_json::Value) -> ServerMessage {
        let mut m = Message::new("/meta/handshake");
        m.ext = ext.as_object().cloned();
        ServerMessage::request(m)
    }

    #[tokio::test]
    async fn test_default_allows() {
        let gate = SecurityGate::new(Duration::from_secs(1));
        let s = Session::new_remote(0, false);
        let c = ChannelId::parse("/a").unwrap();
        assert!(gate.can_handshake(&s, &mut handshake(json!({}))).await);
        assert!(gate.can_create(&s, &c, &mut handshake(json!({}))).await);
        assert!(gate.can_subscribe(&s, &c, &mut handshake(json!({}))).await);
        assert!(gate.can_publish(&s, &c, &mut handshake(json!({}))).await);
    }

    #[tokio::test]
    async fn test_local_session_bypasses_policy() {
        let gate = SecurityGate::new(Duration::from_secs(1));
        gate.set_policy(Arc::new(DenyAll));
        let c = ChannelId::parse("/a").unwrap();

        let remote = Session::new_remote(0, false);
        assert!(!gate.can_handshake(&remote, &mut handshake(json!({"token": "bogus"}))).await);
        assert!(!gate.can_subscribe(&remote, &c, &mut handshake(json!({}))).await);

        let local = Session::new_local(false);
        assert!(gate.can_handshake(&local, &mut handshake(json!({"token": "bogus"}))).await);
        assert!(gate.can_subscribe(&local, &c, &mut handshake(json!({}))).await);
        assert!(gate.can_publish(&local, &c, &mut handshake(json!({}))).await);
    }

    #[tokio::test]
    async fn test_promise_decision() {
        let gate = SecurityGate::new(Duration::from_secs(1));
        gate.set_policy(Arc::new(TokenLookup));
        let s = Session::new_remote(0, false);
        assert!(gate.can_handshake(&s, &mut handshake(json!({"token": "secret"}))).await);
        assert!(!gate.can_handshake(&s, &mut handshake(json!({"token": "guess"}))).await);
    }

    #[tokio::test]
    async fn test_promise_dropped_or_late() {
        let (promise, rx) = Promise::new();
        drop(promise);
        assert!(!rx.resolve(Duration::from_secs(1)).await);

        let (promise, rx) = Promise::new();
        assert!(!rx.resolve(Duration::from_millis(10)).await);
        promise.allow();

        let (promise, rx) = Promise::new();
        promise.allow();
        assert!(rx.resolve(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_timeout_denies() {
        let gate = SecurityGate::new(Duration::from_millis(20));
        gate.set_policy(Arc::new(Slow));
        let s = Session::new_remote(0, false);
        assert!(!gate.can_handshake(&s, &mut handshake(json!({}))).await);
    }

    #[tokio::test]
    async fn test_panic_denies() {
        let gate = SecurityGate::new(Duration::from_secs(1));
        gate.set_policy(Arc::new(Panics));
        let s = Session::new_remote(0, false);
        let c = ChannelId::parse("/a").unwrap();
        assert!(!gate.can_publish(&s, &c, &mut handshake(json!({}))).await);
        assert!(gate.can_subscribe(&s, &c, &mut handshake(json!({}))).await);
    }
}
