//! Protocol message model.
//!
//! [`Message`] mirrors the JSON wire object. [`ServerMessage`] is what flows
//! through the server: a message plus, for requests, the reply that is being
//! built for it (the *associated* message), so extensions can rewrite the
//! reply while they process the request.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::channel::{ChannelError, ChannelId};
use crate::types::SessionId;

pub const ERR_SESSION_UNKNOWN: &str = "402::session_unknown";
pub const ERR_HANDSHAKE_DENIED: &str = "403::handshake_denied";
pub const ERR_SUBSCRIBE_DENIED: &str = "403::subscribe_denied";
pub const ERR_PUBLISH_DENIED: &str = "403::publish_denied";
pub const ERR_CREATE_DENIED: &str = "403::create_denied";
pub const ERR_MESSAGE_DELETED: &str = "404::message_deleted";
pub const ERR_INVALID_CHANNEL: &str = "400::invalid_channel";
pub const ERR_MISSING_SUBSCRIPTION: &str = "400::missing_subscription";

pub type Ext = Map<String, Value>;

/// Reconnect directive carried in advice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reconnect {
    Retry,
    Handshake,
    None,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<Reconnect>,
    /// Milliseconds the client should wait before the next request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<u64>,
    /// Milliseconds the server may hold a long-poll
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

impl Advice {
    #[inline]
    pub fn reconnect(reconnect: Reconnect) -> Self {
        Self { reconnect: Some(reconnect), ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Ext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advice: Option<Advice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supported_connection_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
}

impl Message {
    #[inline]
    pub fn new<C: Into<String>>(channel: C) -> Self {
        Self { channel: channel.into(), ..Default::default() }
    }

    #[inline]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[inline]
    pub fn with_client_id(mut self, client_id: SessionId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    #[inline]
    pub fn with_ext<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.ext_mut().insert(key.into(), value);
        self
    }

    #[inline]
    pub fn with_subscription<S: Into<String>>(mut self, subscription: S) -> Self {
        self.subscription = Some(subscription.into());
        self
    }

    #[inline]
    pub fn channel_id(&self) -> Result<ChannelId, ChannelError> {
        ChannelId::parse(&self.channel)
    }

    #[inline]
    pub fn is_meta(&self) -> bool {
        self.channel.starts_with("/meta/")
    }

    #[inline]
    pub fn is_successful(&self) -> bool {
        self.successful.unwrap_or(false)
    }

    /// The extension map, created on first access.
    #[inline]
    pub fn ext_mut(&mut self) -> &mut Ext {
        self.ext.get_or_insert_with(Map::new)
    }

    #[inline]
    pub fn ext_get(&self, key: &str) -> Option<&Value> {
        self.ext.as_ref().and_then(|ext| ext.get(key))
    }

    /// The advice, created on first access.
    #[inline]
    pub fn advice_mut(&mut self) -> &mut Advice {
        self.advice.get_or_insert_with(Advice::default)
    }

    /// A reply skeleton for this request: same channel, id and client id.
    pub fn reply(&self) -> Message {
        Message {
            channel: self.channel.clone(),
            id: self.id.clone(),
            client_id: self.client_id.clone(),
            subscription: self.subscription.clone(),
            ..Default::default()
        }
    }

    /// Marks this message as a failed reply with a `code::reason` error.
    #[inline]
    pub fn fail<E: Into<String>>(&mut self, error: E) {
        self.successful = Some(false);
        self.error = Some(error.into());
    }

    #[inline]
    pub fn succeed(&mut self) {
        self.successful = Some(true);
        self.error = None;
    }

    #[inline]
    pub fn from_json(s: &str) -> crate::Result<Message> {
        Ok(serde_json::from_str(s)?)
    }

    #[inline]
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A message in flight through the server, optionally carrying its reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerMessage {
    message: Message,
    associated: Option<Box<Message>>,
}

impl ServerMessage {
    /// A request with a freshly built reply attached.
    #[inline]
    pub fn request(message: Message) -> Self {
        let reply = message.reply();
        Self { message, associated: Some(Box::new(reply)) }
    }

    /// A message without a reply: deliveries and replies themselves.
    #[inline]
    pub fn new(message: Message) -> Self {
        Self { message, associated: None }
    }

    #[inline]
    pub fn message(&self) -> &Message {
        &self.message
    }

    #[inline]
    pub fn associated(&self) -> Option<&Message> {
        self.associated.as_deref()
    }

    #[inline]
    pub fn associated_mut(&mut self) -> Option<&mut Message> {
        self.associated.as_deref_mut()
    }

    #[inline]
    pub fn take_associated(&mut self) -> Option<Message> {
        self.associated.take().map(|m| *m)
    }

    #[inline]
    pub fn into_parts(self) -> (Message, Option<Message>) {
        (self.message, self.associated.map(|m| *m))
    }

    #[inline]
    pub fn into_message(self) -> Message {
        self.message
    }
}

impl Deref for ServerMessage {
    type Target = Message;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.message
    }
}

impl DerefMut for ServerMessage {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.message
    }
}

impl From<Message> for ServerMessage {
    fn from(message: Message) -> Self {
        ServerMessage::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_names() {
        let m = Message::from_json(
            r#"{"channel":"/meta/handshake","id":"1","clientId":"abc","version":"1.0",
                "supportedConnectionTypes":["long-polling"],
                "ext":{"com.example.auth":{"token":"t"}},
                "advice":{"reconnect":"handshake","interval":0}}"#,
        )
        .unwrap();
        assert_eq!(m.channel, "/meta/handshake");
        assert_eq!(m.client_id.as_deref(), Some("abc"));
        assert_eq!(m.supported_connection_types, Some(vec!["long-polling".to_string()]));
        assert_eq!(m.ext_get("com.example.auth"), Some(&json!({"token": "t"})));
        assert_eq!(m.advice.as_ref().and_then(|a| a.reconnect), Some(Reconnect::Handshake));
        assert!(m.is_meta());

        let mut reply = m.reply();
        reply.succeed();
        let v: Value = serde_json::from_str(&reply.to_json().unwrap()).unwrap();
        assert_eq!(v, json!({"channel": "/meta/handshake", "id": "1", "clientId": "abc", "successful": true}));
    }

    #[test]
    fn test_associated_reply() {
        let mut m = ServerMessage::request(Message::new("/chat/room1").with_data(json!({"text": "hi"})));
        m.associated_mut().unwrap().fail(ERR_PUBLISH_DENIED);
        m.ext_mut().insert("k".into(), json!(1));
        let (msg, reply) = m.into_parts();
        assert_eq!(msg.ext_get("k"), Some(&json!(1)));
        let reply = reply.unwrap();
        assert_eq!(reply.channel, "/chat/room1");
        assert!(!reply.is_successful());
        assert_eq!(reply.error.as_deref(), Some(ERR_PUBLISH_DENIED));
        assert!(reply.data.is_none());

        assert!(ServerMessage::new(Message::new("/a")).associated().is_none());
    }
}
