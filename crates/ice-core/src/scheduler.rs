//! Per-stream check scheduler
//!
//! Every `Ta` the scheduler takes the next pair from the stream's check list
//! and hands it to the executor, which runs the transaction in its own task.
//! When nothing is schedulable the scheduler pauses instead of exiting: TCP
//! checks may still be running and an inbound request can queue a triggered
//! check at any time, which resumes pacing immediately.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::checklist::CheckListState;
use crate::pair::CandidatePair;
use crate::stream::MediaStream;

/// Runs a check for a scheduled pair
pub trait CheckExecutor: Send + Sync + 'static {
    /// Start the check. Must not block; the transaction runs elsewhere.
    fn execute_check(self: Arc<Self>, stream: Arc<MediaStream>, pair: Arc<CandidatePair>, triggered: bool);
}

/// Spawn the pulse loop for `stream`
pub fn spawn_scheduler<E: CheckExecutor>(
    executor: Weak<E>,
    stream: Arc<MediaStream>,
    ta: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(stream = %stream.name(), ta_ms = ta.as_millis() as u64, "Scheduler started");

        loop {
            if *shutdown.borrow() || stream.state() != CheckListState::Running {
                break;
            }

            match stream.checklist().next_pair() {
                Some((pair, triggered)) => {
                    let Some(executor) = executor.upgrade() else {
                        break;
                    };
                    trace!(stream = %stream.name(), pair = %pair, triggered, "Pulse");
                    executor.execute_check(stream.clone(), pair, triggered);
                }
                None => {
                    debug!(stream = %stream.name(), "No schedulable pairs, pausing");
                    tokio::select! {
                        _ = stream.checklist().triggered_available() => {
                            debug!(stream = %stream.name(), "Triggered check queued, resuming");
                            continue;
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }

            tokio::select! {
                _ = sleep(ta) => {}
                _ = shutdown.changed() => break,
            }
        }

        debug!(stream = %stream.name(), "Scheduler stopped");
    })
}
