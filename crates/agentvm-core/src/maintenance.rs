//! Periodic maintenance loops
//!
//! Each loop is an independent task that runs one tick per period until
//! the shared shutdown flag flips. The first tick fires immediately.

use crate::agent::AgentRegistry;
use crate::config::SystemSettings;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Run `tick` every `period` until `shutdown` turns true or its sender
/// goes away. Overrunning ticks skip missed periods instead of bursting.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(period.max(MIN_PERIOD));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("{} loop started (every {:?})", name, period);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    tick().await;
                }
            }
        }

        info!("{} loop stopped", name);
    })
}

/// Handle to the registry's background loops
pub struct Maintenance {
    shutdown_tx: watch::Sender<bool>,
    loops: Vec<(&'static str, JoinHandle<()>)>,
}

impl Maintenance {
    /// Launch auto-spawn (when enabled), cleanup and health loops
    pub fn start(registry: Arc<AgentRegistry>, settings: &SystemSettings) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut loops = Vec::new();

        if settings.auto_spawn {
            let registry = Arc::clone(&registry);
            let handle = spawn_periodic(
                "auto_spawn",
                settings.auto_spawn_interval(),
                shutdown_rx.clone(),
                move || {
                    let registry = Arc::clone(&registry);
                    async move {
                        if let Err(e) = registry.auto_spawn_check().await {
                            error!("Auto-spawn check failed: {}", e);
                        }
                    }
                },
            );
            loops.push(("auto_spawn", handle));
        }

        {
            let registry = Arc::clone(&registry);
            let retention = settings.result_retention();
            let purge = settings.purge_task_history;
            let handle = spawn_periodic(
                "cleanup",
                settings.cleanup_interval(),
                shutdown_rx.clone(),
                move || {
                    let registry = Arc::clone(&registry);
                    async move {
                        registry.cleanup_completed_tasks(retention);
                        if purge {
                            registry.purge_task_history(retention);
                        }
                    }
                },
            );
            loops.push(("cleanup", handle));
        }

        {
            let handle = spawn_periodic(
                "health",
                settings.health_check_interval(),
                shutdown_rx,
                move || {
                    let registry = Arc::clone(&registry);
                    async move {
                        let Some(adapter) = registry.adapter() else {
                            return;
                        };
                        if adapter.health_check().await {
                            debug!("Backend healthy");
                        } else {
                            warn!("Backend health check failed");
                        }
                    }
                },
            );
            loops.push(("health", handle));
        }

        Self { shutdown_tx, loops }
    }

    pub fn loop_names(&self) -> Vec<&'static str> {
        self.loops.iter().map(|(name, _)| *name).collect()
    }

    /// Signal every loop and wait for them to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, handle) in self.loops {
            if let Err(e) = handle.await {
                error!("{} loop ended abnormally: {}", name, e);
            }
        }
    }
}
