//! User identity to session index.
//!
//! Bindings are dropped automatically through the session's removal listener,
//! so a user with no live session disappears from the index.

use std::sync::{Arc, Weak};

use crate::session::Session;
use crate::types::*;

#[derive(Default)]
pub struct UserSessions {
    users: DashMap<UserName, Vec<Session>>,
}

impl UserSessions {
    #[inline]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Associates `session` with `user` until the session is removed.
    pub fn bind(self: &Arc<Self>, user: UserName, session: &Session) {
        {
            let mut sessions = self.users.entry(user.clone()).or_default();
            if sessions.iter().any(|s| s == session) {
                return;
            }
            sessions.push(session.clone());
        }
        log::debug!("{} bound to user {}", session.id, user);

        let index: Weak<Self> = Arc::downgrade(self);
        session.add_remove_listener(move |s, _reason| {
            if let Some(index) = index.upgrade() {
                index.unbind(&user, s);
            }
        });
    }

    pub fn unbind(&self, user: &str, session: &Session) -> bool {
        let removed = match self.users.get_mut(user) {
            Some(mut sessions) => {
                let before = sessions.len();
                sessions.retain(|s| s != session);
                before != sessions.len()
            }
            None => false,
        };
        self.users.remove_if(user, |_, sessions| sessions.is_empty());
        if removed {
            log::debug!("{} unbound from user {}", session.id, user);
        }
        removed
    }

    #[inline]
    pub fn sessions(&self, user: &str) -> Vec<Session> {
        self.users.get(user).map(|s| s.value().clone()).unwrap_or_default()
    }

    #[inline]
    pub fn is_online(&self, user: &str) -> bool {
        self.users.get(user).map(|s| !s.is_empty()).unwrap_or(false)
    }

    #[inline]
    pub fn users(&self) -> Vec<UserName> {
        self.users.iter().map(|e| e.key().clone()).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}
