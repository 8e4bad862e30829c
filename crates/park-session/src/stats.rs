use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::controller::{lock, StateHandle};
use crate::now_unix_ms;
use crate::sink::StatsSink;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub interval_secs: u64,
    /// JSON-lines output.
    pub path: String,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { interval_secs: 3600, path: "logs/stats.jsonl".into() }
    }
}

/// Records a snapshot every `interval` while the session runs. Abort the
/// returned handle to stop it.
pub fn spawn_stats_worker(shared: StateHandle, sink: Arc<dyn StatsSink>, interval: Duration) -> JoinHandle<()> {
    let interval = interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot = {
                let g = lock(&shared);
                g.state.running.then(|| g.state.to_snapshot(now_unix_ms()))
            };
            match snapshot {
                Some(s) => sink.record_snapshot(&s),
                None => debug!("stats: session stopped, skipping snapshot"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Shared;
    use crate::sink::MemoryStats;
    use crate::SessionState;
    use std::sync::Mutex;

    fn handle(running: bool) -> StateHandle {
        let mut state = SessionState::default();
        state.running = running;
        state.vehicle_counter = 4;
        Arc::new(Mutex::new(Shared { state, regions: Arc::from(Vec::new()), latest: None }))
    }

    #[tokio::test(start_paused = true)]
    async fn records_only_while_running() {
        let shared = handle(true);
        let sink = Arc::new(MemoryStats::default());
        let task = spawn_stats_worker(shared.clone(), sink.clone(), Duration::from_secs(3600));

        tokio::time::sleep(Duration::from_secs(3600 * 2 + 1)).await;
        assert_eq!(sink.snapshots().len(), 2);
        assert_eq!(sink.snapshots()[0].vehicle_counter, 4);

        lock(&shared).state.running = false;
        tokio::time::sleep(Duration::from_secs(3600 * 3)).await;
        assert_eq!(sink.snapshots().len(), 2);
        task.abort();
    }
}
