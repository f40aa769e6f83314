use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Receiving end of a named tick subscription.
///
/// Delivers one monotonic timestamp per interval. Ticks a slow consumer has
/// not drained yet are coalesced rather than queued without bound.
#[derive(Debug)]
pub struct TickChannel {
    name: String,
    rx: mpsc::Receiver<Instant>,
    cancel: CancellationToken,
}

impl TickChannel {
    /// Name this subscription is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the next tick. Returns `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Instant> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for draining pending ticks.
    pub fn try_recv(&mut self) -> Option<Instant> {
        self.rx.try_recv().ok()
    }
}

/// Process-wide clock service handing out named interval channels.
///
/// Channel names are unique for the lifetime of the subscription; a name is
/// only reusable after `unsubscribe`.
pub struct Ticker {
    names: Mutex<HashSet<String>>,
}

impl Ticker {
    pub fn new() -> Self {
        Self {
            names: Mutex::new(HashSet::new()),
        }
    }

    /// Registers a named subscription and spawns its timer task.
    ///
    /// Fails if `name` is already subscribed. Must be called from within a
    /// tokio runtime.
    pub fn subscribe(&self, interval: Duration, name: &str) -> Result<TickChannel> {
        if interval.is_zero() {
            bail!("tick interval must be positive for channel {name}");
        }

        {
            let mut names = self.names.lock();
            if !names.insert(name.to_string()) {
                bail!("tick channel name already in use: {name}");
            }
        }

        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let timer_cancel = cancel.clone();
        let timer_name = name.to_string();

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of a fresh interval completes immediately;
            // consume it so subscribers only see real interval boundaries.
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer_cancel.cancelled() => {
                        debug!(channel = %timer_name, "tick channel stopped");
                        return;
                    }
                    _ = timer.tick() => {
                        // Coalesce when the subscriber is behind.
                        let _ = tx.try_send(Instant::now());
                    }
                }
            }
        });

        Ok(TickChannel {
            name: name.to_string(),
            rx,
            cancel,
        })
    }

    /// Stops the timer task and releases the channel name for reuse.
    pub fn unsubscribe(&self, chan: TickChannel) {
        chan.cancel.cancel();
        self.names.lock().remove(&chan.name);
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}
