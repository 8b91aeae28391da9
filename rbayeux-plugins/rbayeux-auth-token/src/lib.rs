#![deny(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use rbayeux::channel::ChannelId;
use rbayeux::context::ServerContext;
use rbayeux::message::ServerMessage;
use rbayeux::presence::UserSessions;
use rbayeux::security::SecurityPolicy;
use rbayeux::session::Session;
use rbayeux::types::{Allowed, HashMap, UserName};
use rbayeux::Result;

use config::PluginConfig;

mod config;

pub use config::User;

pub const ERR_INVALID_CREDENTIALS: &str = "401::invalid_credentials";
pub const ERR_MISSING_CREDENTIALS: &str = "401::missing_credentials";

const USER_ATTRIBUTE: &str = "user";

/// Loads the plugin configuration named `name` and installs the policy.
pub fn register(scx: &ServerContext, name: &str) -> Result<()> {
    let cfg: PluginConfig = scx.settings.plugins.load_config_default(name)?;
    log::debug!("{} PluginConfig: {:?}", name, cfg);
    let policy = TokenPolicy::new(cfg, scx.users.clone())?;
    log::info!("{} loaded, users: {}", name, policy.users.len());
    scx.set_security_policy(Arc::new(policy));
    Ok(())
}

struct Rules {
    token: String,
    subscribe: Vec<ChannelId>,
    publish: Vec<ChannelId>,
}

impl Rules {
    fn allowed(patterns: &[ChannelId], channel: &ChannelId) -> bool {
        patterns.is_empty() || patterns.iter().any(|p| p == channel || p.matches(channel))
    }
}

/// Authenticates handshakes against a static user/token table and restricts
/// each user to its configured channel patterns.
pub struct TokenPolicy {
    ext_key: String,
    allow_anonymous: bool,
    users: HashMap<UserName, Rules>,
    index: Arc<UserSessions>,
}

impl TokenPolicy {
    pub fn new(cfg: PluginConfig, index: Arc<UserSessions>) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<ChannelId>> {
            patterns.iter().map(|p| Ok(ChannelId::parse(p)?)).collect()
        };
        let mut users = HashMap::default();
        for u in &cfg.users {
            let rules =
                Rules { token: u.token.clone(), subscribe: compile(&u.subscribe)?, publish: compile(&u.publish)? };
            users.insert(UserName::from(u.name.as_str()), rules);
        }
        Ok(Self { ext_key: cfg.ext_key, allow_anonymous: cfg.allow_anonymous, users, index })
    }

    fn credentials<'a>(&self, msg: &'a ServerMessage) -> Option<(&'a str, &'a str)> {
        let auth = msg.ext_get(&self.ext_key)?;
        let user = auth.get("user").and_then(Value::as_str)?;
        let token = auth.get("token").and_then(Value::as_str)?;
        Some((user, token))
    }

    fn rules(&self, session: &Session) -> Option<&Rules> {
        let user = session.attribute(USER_ATTRIBUTE)?;
        self.users.get(user.as_str()?)
    }

    fn reject(msg: &mut ServerMessage, error: &str) -> Allowed {
        if let Some(reply) = msg.associated_mut() {
            reply.fail(error);
        }
        false
    }
}

#[async_trait]
impl SecurityPolicy for TokenPolicy {
    fn name(&self) -> &str {
        "auth-token"
    }

    async fn can_handshake(&self, session: &Session, msg: &mut ServerMessage) -> Allowed {
        let credentials = self.credentials(msg).map(|(user, token)| (UserName::from(user), token.to_owned()));
        let (user, token) = match credentials {
            Some(credentials) => credentials,
            None if self.allow_anonymous => return true,
            None => return Self::reject(msg, ERR_MISSING_CREDENTIALS),
        };
        match self.users.get(&user) {
            Some(rules) if rules.token == token => {
                session.set_attribute(USER_ATTRIBUTE, json!(&*user));
                self.index.bind(user, session);
                true
            }
            _ => {
                log::info!("{} handshake rejected, user: {}", session.id, user);
                Self::reject(msg, ERR_INVALID_CREDENTIALS)
            }
        }
    }

    async fn can_subscribe(&self, session: &Session, channel: &ChannelId, _msg: &mut ServerMessage) -> Allowed {
        self.rules(session).map(|r| Rules::allowed(&r.subscribe, channel)).unwrap_or(true)
    }

    async fn can_publish(&self, session: &Session, channel: &ChannelId, _msg: &mut ServerMessage) -> Allowed {
        self.rules(session).map(|r| Rules::allowed(&r.publish, channel)).unwrap_or(true)
    }
}
