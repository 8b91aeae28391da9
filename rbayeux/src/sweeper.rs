//! Removes remote sessions whose transport stopped refreshing them.

use std::time::Duration;

use itertools::Itertools;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::context::ServerContext;
use crate::session::Session;
use crate::types::RemoveReason;
use crate::utils::timestamp_millis;

pub struct Sweeper {
    scx: ServerContext,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    #[inline]
    pub fn new(scx: ServerContext) -> Self {
        Self { scx, task: Mutex::new(None) }
    }

    /// Spawns the periodic sweep on the current tokio runtime. A running sweep is kept.
    pub fn start(&self) {
        let mut task = self.task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let scx = self.scx.clone();
        let interval = scx.settings.bayeux.sweep_interval.max(Duration::from_millis(10));
        log::info!(
            "session sweeper started, interval: {:?}, max idle: {:?}",
            interval,
            scx.settings.bayeux.max_session_idle
        );
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweep(&scx);
            }
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            log::info!("session sweeper stopped");
        }
    }

    #[inline]
    pub fn sweep_once(&self) -> usize {
        sweep(&self.scx)
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep(scx: &ServerContext) -> usize {
    let max_idle = scx.settings.bayeux.max_session_idle;
    let now = timestamp_millis();
    let expired = scx
        .registry
        .sessions()
        .into_iter()
        .filter(|s| !s.is_local() && s.idle_for(now) > max_idle)
        .collect_vec();
    let removed = expired.iter().filter_map(|s: &Session| scx.remove_session(&s.id, RemoveReason::Expired)).count();
    if removed > 0 {
        log::info!("{} idle session(s) expired", removed);
    }
    removed
}
