//! Concurrent session store.
//!
//! Holds every live session, local and remote, keyed by session id, and
//! notifies registry-wide listeners when sessions come and go. Removal takes
//! the session out of the map before any listener runs, so listeners always
//! observe it as gone.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;

use crate::error::BayeuxError;
use crate::session::Session;
use crate::types::*;
use crate::utils::catch;
use crate::Result;

/// Registry-wide lifecycle notifications.
pub trait SessionListener: Send + Sync {
    fn name(&self) -> &str {
        "session-listener"
    }

    fn session_added(&self, _session: &Session) {}

    fn session_removed(&self, _session: &Session, _reason: RemoveReason) {}
}

pub type ListenerId = u64;

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    listeners: RwLock<Arc<Vec<(ListenerId, Arc<dyn SessionListener>)>>>,
    next_listener_id: parking_lot::Mutex<ListenerId>,
}

impl SessionRegistry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) -> ListenerId {
        let id = {
            let mut next = self.next_listener_id.lock();
            *next += 1;
            *next
        };
        let mut listeners = self.listeners.write();
        let mut updated = listeners.as_ref().clone();
        updated.push((id, listener));
        *listeners = Arc::new(updated);
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        let updated: Vec<_> = listeners.iter().filter(|(lid, _)| *lid != id).cloned().collect();
        let removed = updated.len() != before;
        *listeners = Arc::new(updated);
        removed
    }

    #[inline]
    fn listeners(&self) -> Arc<Vec<(ListenerId, Arc<dyn SessionListener>)>> {
        self.listeners.read().clone()
    }

    /// Inserts the session and fires `session_added`. An id already present is rejected.
    pub fn register(&self, session: Session) -> Result<()> {
        if session.is_removed() {
            return Err(BayeuxError::SessionRemoved(session.id.clone()));
        }
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(_) => return Err(BayeuxError::DuplicateSession(session.id.clone())),
            Entry::Vacant(entry) => {
                entry.insert(session.clone());
            }
        }
        log::debug!("{} registered, kind: {:?}", session.id, session.kind);
        for (_, listener) in self.listeners().iter() {
            if let Err(e) = catch(|| listener.session_added(&session)) {
                log::error!("{} session listener '{}' panicked on add, {}", session.id, listener.name(), e);
            }
        }
        Ok(())
    }

    /// Takes the session out of the map and returns it; listeners are fired by
    /// [`SessionRegistry::notify_removed`] once the caller has finished cleanup.
    #[inline]
    pub(crate) fn take(&self, id: &str) -> Option<Session> {
        let (_, session) = self.sessions.remove(id)?;
        session.set_closing();
        Some(session)
    }

    /// Fires registry-wide listeners, then the session's own removal listeners.
    pub(crate) fn notify_removed(&self, session: &Session, reason: RemoveReason) {
        log::debug!("{} removed, reason: {}", session.id, reason);
        for (_, listener) in self.listeners().iter() {
            if let Err(e) = catch(|| listener.session_removed(session, reason)) {
                log::error!("{} session listener '{}' panicked on remove, {}", session.id, listener.name(), e);
            }
        }
        session.fire_removed(reason);
    }

    /// Removes the session and fires every listener exactly once. A second call is a no-op.
    ///
    /// Channel subscriptions are not touched here. Outside this crate sessions are
    /// removed through `ServerContext::remove_session`, which also clears them
    /// from the dispatcher.
    pub(crate) fn remove(&self, id: &str, reason: RemoveReason) -> Option<Session> {
        let session = self.take(id)?;
        self.notify_removed(&session, reason);
        Some(session)
    }

    #[inline]
    pub fn find(&self, id: &str) -> Option<Session> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    #[inline]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Point-in-time copy of every session.
    #[inline]
    pub fn sessions(&self) -> Vec<Session> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        registry: parking_lot::Mutex<Option<Arc<SessionRegistry>>>,
        added: AtomicUsize,
        removed: AtomicUsize,
        absent_on_remove: AtomicUsize,
    }

    impl SessionListener for Recorder {
        fn session_added(&self, _session: &Session) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }

        fn session_removed(&self, session: &Session, _reason: RemoveReason) {
            self.removed.fetch_add(1, Ordering::SeqCst);
            if let Some(r) = self.registry.lock().as_ref() {
                if r.find(&session.id).is_none() {
                    self.absent_on_remove.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    }

    struct Faulty;

    impl SessionListener for Faulty {
        fn name(&self) -> &str {
            "faulty"
        }
        fn session_removed(&self, _session: &Session, _reason: RemoveReason) {
            panic!("faulty listener");
        }
    }

    #[test]
    fn test_register_find_remove() {
        let registry = Arc::new(SessionRegistry::new());
        let recorder = Arc::new(Recorder::default());
        *recorder.registry.lock() = Some(registry.clone());
        registry.add_listener(Arc::new(Faulty));
        registry.add_listener(recorder.clone());

        let s = Session::new_remote(0, false);
        let local_absent = Arc::new(AtomicUsize::new(0));
        {
            let registry = registry.clone();
            let local_absent = local_absent.clone();
            s.add_remove_listener(move |s, reason| {
                assert_eq!(reason, RemoveReason::Disconnected);
                if registry.find(&s.id).is_none() {
                    local_absent.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        registry.register(s.clone()).unwrap();
        assert!(matches!(registry.register(s.clone()), Err(BayeuxError::DuplicateSession(_))));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find(&s.id), Some(s.clone()));
        assert_eq!(recorder.added.load(Ordering::SeqCst), 1);

        assert!(registry.remove(&s.id, RemoveReason::Disconnected).is_some());
        assert!(registry.remove(&s.id, RemoveReason::Disconnected).is_none());
        assert!(registry.find(&s.id).is_none());
        assert!(registry.is_empty());
        assert_eq!(recorder.removed.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.absent_on_remove.load(Ordering::SeqCst), 1);
        assert_eq!(local_absent.load(Ordering::SeqCst), 1);

        assert!(matches!(registry.register(s), Err(BayeuxError::SessionRemoved(_))));
    }

    #[test]
    fn test_remove_listener() {
        let registry = SessionRegistry::new();
        let recorder = Arc::new(Recorder::default());
        let id = registry.add_listener(recorder.clone());
        assert!(registry.remove_listener(id));
        assert!(!registry.remove_listener(id));
        registry.register(Session::new_local(false)).unwrap();
        assert_eq!(recorder.added.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_concurrent_register_remove() {
        let registry = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let s = Session::new_remote(0, false);
                        registry.register(s.clone()).unwrap();
                        assert!(registry.find(&s.id).is_some());
                        assert!(registry.remove(&s.id, RemoveReason::Expired).is_some());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
