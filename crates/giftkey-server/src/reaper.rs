//! Background expiry sweep for license keys.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::keys::KeyManager;

/// Default pause between sweeps.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(600);

/// Shortest pause the loop accepts; smaller values are raised to this.
pub const MIN_REAPER_INTERVAL: Duration = Duration::from_secs(1);

/// Running reaper task. Dropping the handle also ends the loop, without
/// waiting for it.
pub struct ReaperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReaperHandle {
    /// Signal the loop and wait for the in-flight sweep, if any, to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "reaper task ended abnormally");
        }
    }
}

/// Spawn the sweep loop. The first sweep runs immediately.
///
/// Store errors are logged and the loop waits for the next tick; a sweep only
/// deletes already-expired keys, so repeating it later is always safe.
pub fn spawn_reaper(keys: KeyManager, clock: Arc<dyn Clock>, interval: Duration) -> ReaperHandle {
    let (shutdown, mut stopped) = watch::channel(false);
    let interval = effective_interval(interval);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stopped.changed() => break,
            }

            let now = clock.now();
            match keys.sweep_expired(now) {
                Ok(0) => debug!("reaper: nothing expired"),
                Ok(n) => info!(removed = n, "reaper: expired keys removed"),
                Err(e) => warn!(error = %e, "reaper: sweep failed, retrying next interval"),
            }
        }
        debug!("reaper stopped");
    });

    ReaperHandle { shutdown, task }
}

fn effective_interval(requested: Duration) -> Duration {
    if requested < MIN_REAPER_INTERVAL {
        warn!(
            requested_ms = requested.as_millis() as u64,
            "reaper interval too short, using {}s",
            MIN_REAPER_INTERVAL.as_secs()
        );
        MIN_REAPER_INTERVAL
    } else {
        requested
    }
}
