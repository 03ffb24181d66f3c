//! Idle session reaper
//!
//! One task, independent of both dataplane loops, sweeping the
//! repository on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::Result;
use crate::session::repository::SessionRepository;

pub struct IdleReaper {
    repo: Arc<SessionRepository>,
    idle_timeout: Duration,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl IdleReaper {
    pub fn new(
        repo: Arc<SessionRepository>,
        idle_timeout: Duration,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            repo,
            idle_timeout,
            interval,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        let mut shutdown = self.shutdown.clone();
        // The first tick fires immediately; skip it so a fresh server
        // doesn't sweep before anyone had a chance to talk.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    tracing::info!("idle reaper stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    let reaped = self.repo.reap_idle(self.idle_timeout);
                    if reaped > 0 {
                        tracing::info!(count = reaped, "reaped idle sessions");
                    }
                }
            }
        }
    }
}
