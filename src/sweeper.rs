//! src/sweeper.rs
//! Okresowe odzyskiwanie pamięci orkiestratora. Trzyma tylko `Weak`, więc drop
//! orkiestratora kończy też task.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::orchestrator::SecurityOrchestrator;
use crate::window::now_ms;

#[derive(Debug)]
pub struct SweepHandle {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweepHandle {
    /// Daje sygnał taskowi i czeka, aż skończy bieżący przebieg.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "sweep task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Startuje sweep na bieżącym runtime tokio.
pub fn spawn(shield: &Arc<SecurityOrchestrator>, every: Duration) -> SweepHandle {
    let weak: Weak<SecurityOrchestrator> = Arc::downgrade(shield);
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // pierwszy tick strzela od razu; nie ma jeszcze czego sprzątać
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let Some(shield) = weak.upgrade() else {
                break;
            };
            let report = shield.sweep(now_ms());
            tracing::debug!(?report, "sweep pass");
        }
        tracing::debug!("sweep task stopped");
    });

    SweepHandle { stop_tx, task }
}
