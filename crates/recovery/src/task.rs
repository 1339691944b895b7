//! Periodic background recovery

use crate::recoverer::Recoverer;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Start the background recovery task
///
/// The first run happens right away, then once per interval. Runs are
/// blocking and go through `spawn_blocking`. Abort the handle to stop.
pub fn start(recoverer: Arc<Recoverer>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let recoverer = recoverer.clone();
            if let Err(e) = tokio::task::spawn_blocking(move || recoverer.run()).await {
                tracing::warn!("Background recovery run did not complete: {}", e);
            }
        }
    })
}
