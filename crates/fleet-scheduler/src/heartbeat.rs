//! Periodic dispatch trigger.
//!
//! Every tick funnels into the same [`DispatchEngine::run_cycle`] entry
//! point a manual `schedule run` uses; the dispatch lock keeps the two
//! from overlapping.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::engine::{CycleOptions, CycleReport, DispatchEngine};

pub struct Heartbeat {
    engine: Arc<DispatchEngine>,
    interval: Duration,
    actor: String,
}

impl Heartbeat {
    pub fn new(engine: Arc<DispatchEngine>, interval: Duration, actor: &str) -> Self {
        Self {
            engine,
            interval,
            actor: actor.to_string(),
        }
    }

    /// Run one cycle now. Engine errors are logged, not returned; the next
    /// tick is the retry.
    pub async fn beat(&self) -> Option<CycleReport> {
        let opts = CycleOptions {
            actor: self.actor.clone(),
            ..Default::default()
        };
        match self.engine.run_cycle(&opts).await {
            Ok(report) => {
                if let Some(skip) = &report.skipped {
                    info!(?skip, "heartbeat cycle skipped");
                } else {
                    info!(
                        dispatched = report.dispatched(),
                        deferred = report.deferred.len(),
                        quarantined = report.quarantined(),
                        "heartbeat cycle finished"
                    );
                }
                Some(report)
            }
            Err(e) => {
                error!(error = %e, "heartbeat dispatch cycle failed");
                None
            }
        }
    }

    /// Beat every `interval` until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "heartbeat started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.beat().await;
                }
                _ = shutdown.changed() => {
                    info!("heartbeat shutting down");
                    break;
                }
            }
        }
    }
}
