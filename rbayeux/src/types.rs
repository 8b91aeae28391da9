use std::fmt;

use serde::{Deserialize, Serialize};

pub use rbayeux_utils::{Timestamp, TimestampMillis};

pub type DashMap<K, V> = dashmap::DashMap<K, V, ahash::RandomState>;
pub type DashSet<K> = dashmap::DashSet<K, ahash::RandomState>;
pub type HashMap<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type HashSet<K> = std::collections::HashSet<K, ahash::RandomState>;

pub type SessionId = bytestring::ByteString;
pub type ServiceName = bytestring::ByteString;
pub type UserName = bytestring::ByteString;
pub type Priority = u32;
pub type Proceed = bool;
pub type Allowed = bool;

/// Why a session left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoveReason {
    /// Explicit `/meta/disconnect` or administrative removal
    Disconnected,
    /// The transport stopped refreshing the session
    Expired,
}

impl fmt::Display for RemoveReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoveReason::Disconnected => f.write_str("disconnected"),
            RemoveReason::Expired => f.write_str("expired"),
        }
    }
}

/// Local sessions live in-process and belong to a service; remote ones sit behind a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Local,
    Remote,
}

pub const BAYEUX_VERSION: &str = "1.0";
pub const BAYEUX_MINIMUM_VERSION: &str = "1.0";
pub const SUPPORTED_CONNECTION_TYPES: [&str; 3] = ["websocket", "long-polling", "callback-polling"];
