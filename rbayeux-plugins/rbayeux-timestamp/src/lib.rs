#![deny(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use rbayeux::context::ServerContext;
use rbayeux::extension::{Extension, ExtensionId};
use rbayeux::message::ServerMessage;
use rbayeux::session::Session;
use rbayeux::types::{Priority, Proceed};
use rbayeux::utils::{format_timestamp_millis, timestamp_millis};
use rbayeux::Result;

pub const EXT_TIMESTAMP: &str = "timestamp";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginConfig {
    ///Also stamp messages received from clients, before dispatch
    #[serde(default)]
    pub stamp_incoming: bool,

    #[serde(default = "PluginConfig::priority_default")]
    pub priority: Priority,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self { stamp_incoming: false, priority: Self::priority_default() }
    }
}

impl PluginConfig {
    fn priority_default() -> Priority {
        10
    }
}

/// Loads the plugin configuration named `name` and adds the extension.
pub fn register(scx: &ServerContext, name: &str) -> Result<ExtensionId> {
    let cfg: PluginConfig = scx.settings.plugins.load_config_default(name)?;
    log::debug!("{} PluginConfig: {:?}", name, cfg);
    let id = scx.extensions.add_priority(cfg.priority, Arc::new(TimestampExtension::new(cfg)));
    log::info!("{} registered, extension id: {}", name, id);
    Ok(id)
}

/// Stamps `ext.timestamp` on non-meta messages with the server time.
pub struct TimestampExtension {
    cfg: PluginConfig,
}

impl TimestampExtension {
    #[inline]
    pub fn new(cfg: PluginConfig) -> Self {
        Self { cfg }
    }

    #[inline]
    fn stamp(msg: &mut ServerMessage) {
        if !msg.is_meta() {
            msg.ext_mut().insert(EXT_TIMESTAMP.into(), json!(format_timestamp_millis(timestamp_millis())));
        }
    }
}

#[async_trait]
impl Extension for TimestampExtension {
    fn name(&self) -> &str {
        "timestamp"
    }

    async fn incoming(&self, _from: Option<&Session>, msg: &mut ServerMessage) -> Result<Proceed> {
        if self.cfg.stamp_incoming {
            Self::stamp(msg);
        }
        Ok(true)
    }

    async fn outgoing(&self, _from: Option<&Session>, _to: Option<&Session>, msg: &mut ServerMessage) -> Result<Proceed> {
        Self::stamp(msg);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbayeux::message::Message;
    use rbayeux::server::BayeuxServer;

    async fn client(server: &BayeuxServer, channel: &str) -> Session {
        let reply = server.handle(Message::new("/meta/handshake")).await.unwrap();
        assert!(reply.ext_get(EXT_TIMESTAMP).is_none());
        let id = reply.client_id.unwrap();
        server.handle(Message::new("/meta/subscribe").with_client_id(id.clone()).with_subscription(channel)).await;
        server.context().find_session(&id).unwrap()
    }

    #[tokio::test]
    async fn test_outgoing_stamp() {
        let scx = ServerContext::default();
        scx.extensions.add(Arc::new(TimestampExtension::new(PluginConfig::default())));
        let server = BayeuxServer::new(scx);
        let alice = client(&server, "/news").await;
        let bob = client(&server, "/news").await;

        let reply = server
            .handle(Message::new("/news").with_client_id(alice.id.clone()).with_data(json!("hi")))
            .await
            .unwrap();
        assert!(reply.is_successful());
        let delivered = bob.drain();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].ext_get(EXT_TIMESTAMP).and_then(|v| v.as_str()).is_some());
    }

    #[tokio::test]
    async fn test_incoming_stamp() {
        let ext = TimestampExtension::new(PluginConfig { stamp_incoming: true, ..Default::default() });
        let mut msg = ServerMessage::new(Message::new("/chat/a"));
        assert!(ext.incoming(None, &mut msg).await.unwrap());
        assert!(msg.ext_get(EXT_TIMESTAMP).is_some());

        let mut meta = ServerMessage::new(Message::new("/meta/connect"));
        assert!(ext.incoming(None, &mut meta).await.unwrap());
        assert!(meta.ext.is_none());

        let ext = TimestampExtension::new(PluginConfig::default());
        let mut msg = ServerMessage::new(Message::new("/chat/a"));
        ext.incoming(None, &mut msg).await.unwrap();
        assert!(msg.ext.is_none());
    }

    #[test]
    fn test_register() {
        let scx = ServerContext::default();
        let id = register(&scx, "rbayeux-timestamp").unwrap();
        assert_eq!(scx.extensions.names(), vec!["timestamp".to_string()]);
        assert!(scx.extensions.remove(id).is_some());
    }
}
