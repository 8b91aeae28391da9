//! Ordered interceptor chain applied to incoming and outgoing messages.
//!
//! Every extension sees every message; an extension interested in a single
//! channel checks `msg.channel` itself. Returning `Ok(false)` vetoes the
//! message and stops the chain, an `Err` or a panic is treated the same way
//! but logged as an error.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::message::ServerMessage;
use crate::session::Session;
use crate::types::{Priority, Proceed};
use crate::utils::catch_async;
use crate::Result;

#[async_trait]
pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    ///Message received from a transport or a local session, before dispatch
    async fn incoming(&self, _from: Option<&Session>, _msg: &mut ServerMessage) -> Result<Proceed> {
        Ok(true)
    }

    ///Reply or delivery about to leave the server; `to` is `None` for replies to unknown sessions
    async fn outgoing(
        &self,
        _from: Option<&Session>,
        _to: Option<&Session>,
        _msg: &mut ServerMessage,
    ) -> Result<Proceed> {
        Ok(true)
    }
}

pub type ExtensionId = u64;

type Key = (Reverse<Priority>, ExtensionId);
type Chain = Arc<BTreeMap<Key, Arc<dyn Extension>>>;

#[derive(Default)]
pub struct ExtensionManager {
    chain: RwLock<Chain>,
    next_id: AtomicU64,
}

impl ExtensionManager {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&self, ext: Arc<dyn Extension>) -> ExtensionId {
        self.add_priority(0, ext)
    }

    /// Higher priorities run first; equal priorities run in registration order.
    pub fn add_priority(&self, priority: Priority, ext: Arc<dyn Extension>) -> ExtensionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        log::info!("extension '{}' added, priority: {}, id: {}", ext.name(), priority, id);
        let mut chain = self.chain.write();
        let mut updated = chain.as_ref().clone();
        updated.insert((Reverse(priority), id), ext);
        *chain = Arc::new(updated);
        id
    }

    pub fn remove(&self, id: ExtensionId) -> Option<Arc<dyn Extension>> {
        let mut chain = self.chain.write();
        let key = chain.keys().find(|(_, eid)| *eid == id).copied()?;
        let mut updated = chain.as_ref().clone();
        let removed = updated.remove(&key);
        *chain = Arc::new(updated);
        if let Some(ext) = &removed {
            log::info!("extension '{}' removed, id: {}", ext.name(), id);
        }
        removed
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.chain.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chain.read().is_empty()
    }

    /// Extension names in execution order.
    #[inline]
    pub fn names(&self) -> Vec<String> {
        self.snapshot().values().map(|e| e.name().to_string()).collect()
    }

    #[inline]
    fn snapshot(&self) -> Chain {
        self.chain.read().clone()
    }

    pub async fn run_incoming(&self, from: Option<&Session>, msg: &mut ServerMessage) -> Proceed {
        let chain = self.snapshot();
        for ext in chain.values() {
            let res = catch_async(ext.incoming(from, msg)).await;
            if !Self::proceed(ext.as_ref(), "incoming", &msg.channel, res) {
                return false;
            }
        }
        true
    }

    pub async fn run_outgoing(&self, from: Option<&Session>, to: Option<&Session>, msg: &mut ServerMessage) -> Proceed {
        let chain = self.snapshot();
        for ext in chain.values() {
            let res = catch_async(ext.outgoing(from, to, msg)).await;
            if !Self::proceed(ext.as_ref(), "outgoing", &msg.channel, res) {
                return false;
            }
        }
        true
    }

    fn proceed(
        ext: &dyn Extension,
        direction: &str,
        channel: &str,
        res: std::result::Result<Result<Proceed>, String>,
    ) -> Proceed {
        match res {
            Ok(Ok(true)) => true,
            Ok(Ok(false)) => {
                log::debug!("{} message on {} vetoed by extension '{}'", direction, channel, ext.name());
                false
            }
            Ok(Err(e)) => {
                log::error!("extension '{}' failed on {} message on {}, {}", ext.name(), direction, channel, e);
                false
            }
            Err(e) => {
                log::error!("extension '{}' panicked on {} message on {}, {}", ext.name(), direction, channel, e);
                false
            }
        }
    }
}
