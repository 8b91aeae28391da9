use serde::{Deserialize, Serialize};

use rbayeux::Result;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PluginConfig {
    ///Handshake `ext` key holding `{"user": .., "token": ..}`
    #[serde(default = "PluginConfig::ext_key_default")]
    pub ext_key: String,

    ///Allow handshakes without credentials; such sessions have no channel restrictions
    #[serde(default)]
    pub allow_anonymous: bool,

    #[serde(default)]
    pub users: Vec<User>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct User {
    pub name: String,
    pub token: String,
    ///Patterns the user may subscribe to, empty means any
    #[serde(default)]
    pub subscribe: Vec<String>,
    ///Patterns the user may publish to, empty means any
    #[serde(default)]
    pub publish: Vec<String>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self { ext_key: Self::ext_key_default(), allow_anonymous: false, users: Vec::new() }
    }
}

impl PluginConfig {
    fn ext_key_default() -> String {
        "com.rbayeux.auth".into()
    }

    #[inline]
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
