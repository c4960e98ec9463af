//! Background reconnect supervisor for the bus session.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use homelink_core::MessageBus;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Counters exposed by a running supervisor.
#[derive(Debug, Default)]
pub struct SupervisorStats {
    reconnect_attempts: AtomicU64,
    recoveries: AtomicU64,
}

impl SupervisorStats {
    pub fn reconnect_attempts(&self) -> u64 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Times the session was seen connected again after being lost.
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::SeqCst)
    }
}

/// Polls the bus at a fixed interval and asks it to reconnect while the
/// session is down.
pub struct ConnectionSupervisor {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
    stats: Arc<SupervisorStats>,
}

impl ConnectionSupervisor {
    /// Start supervising `bus`. The first check happens one interval after start.
    pub fn spawn(bus: Arc<dyn MessageBus>, every: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let stats = Arc::new(SupervisorStats::default());
        let task_stats = stats.clone();

        let task = tokio::spawn(async move {
            let mut timer = interval(every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer.tick().await; // Skip first tick

            let mut was_connected = true;
            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                if bus.is_connected() {
                    if !was_connected {
                        tracing::info!("MQTT connection reconnected");
                        task_stats.recoveries.fetch_add(1, Ordering::SeqCst);
                    }
                    was_connected = true;
                    continue;
                }

                was_connected = false;
                task_stats.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                tracing::debug!("Trying to reconnect to MQTT broker");
                match tokio::time::timeout(every, bus.reconnect()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!("Reconnect attempt failed: {}", e),
                    Err(_) => tracing::warn!("Reconnect attempt timed out"),
                }
            }
            tracing::debug!("Connection supervisor stopped");
        });

        Self { stop, task, stats }
    }

    pub fn stats(&self) -> Arc<SupervisorStats> {
        self.stats.clone()
    }

    /// Signal the task to stop and wait up to `timeout` for it to finish.
    /// Returns false when the task had to be aborted.
    pub async fn shutdown(self, timeout: Duration) -> bool {
        let _ = self.stop.send(true);
        let mut task = self.task;
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!("Connection supervisor did not stop in time, aborting");
                task.abort();
                false
            }
        }
    }
}
