use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn, Instrument};

use crate::{CycleOutcome, IngestionCycle};

enum LoopMessage {
    Shutdown,
}

/// Handle to the background ingestion loop.
pub struct SchedulerHandle {
    sender: mpsc::Sender<LoopMessage>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop after the in-flight cycle, if any, and wait for the task to exit.
    pub async fn shutdown(self) {
        let _ = self.sender.send(LoopMessage::Shutdown).await;
        if let Err(err) = self.task.await {
            warn!(error = %err, "ingestion loop task ended abnormally");
        }
    }

    /// Stop immediately, dropping any in-flight cycle.
    pub fn abort(self) {
        self.task.abort();
    }
}

/// Run `cycle` every `interval`, starting one interval from now.
///
/// Cycles run inline on the loop task, so they never overlap; ticks missed
/// while a slow cycle runs are dropped rather than replayed.
pub fn spawn_ingestion_loop(cycle: Arc<IngestionCycle>, interval: Duration) -> SchedulerHandle {
    let (sender, receiver) = mpsc::channel(1);
    let task = tokio::spawn(run_loop(cycle, interval, receiver).in_current_span());
    SchedulerHandle { sender, task }
}

async fn run_loop(
    cycle: Arc<IngestionCycle>,
    interval: Duration,
    mut receiver: mpsc::Receiver<LoopMessage>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick completes immediately
    timer.tick().await;
    info!(interval_secs = interval.as_secs(), "ingestion loop started");

    loop {
        tokio::select! {
            _ = timer.tick() => {
                let report = cycle.run_once().await;
                match &report.outcome {
                    CycleOutcome::Written(result) => info!(
                        run_id = %report.run_id,
                        fetched = report.fetched,
                        inserted = result.inserted_count,
                        upserted = result.upserted_count,
                        "ingestion cycle complete"
                    ),
                    CycleOutcome::Empty => info!(run_id = %report.run_id, "ingestion cycle found nothing"),
                    CycleOutcome::Failed(_) => {}
                }
            }
            msg = receiver.recv() => {
                match msg {
                    Some(LoopMessage::Shutdown) | None => {
                        info!("ingestion loop stopped");
                        break;
                    }
                }
            }
        }
    }
}
