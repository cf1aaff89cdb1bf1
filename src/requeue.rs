//! Background re-dispatch of `QUEUED` records.
//!
//! A record stays `QUEUED` when its dispatch hit a full queue or when the
//! service stopped before a worker picked it up. The requeuer sweeps the
//! store on a fixed interval and feeds such records back into the work
//! queue, waiting for room instead of giving up when the queue is full.
//!
//! The first sweep covers every queued record. Later sweeps only take
//! records untouched for a whole interval, so items sitting in the queue
//! are rarely sent twice; when they are, the second claim is skipped.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::dispatch::{ChannelDispatcher, WorkItem};
use crate::error::{ExecutionError, HazardError, HazardResult, ValidationError};
use crate::lifecycle::LifecycleController;

enum Sweep {
    Done(usize),
    Stopped,
}

fn sweep(
    controller: &LifecycleController,
    dispatcher: &ChannelDispatcher,
    older_than: Option<chrono::Duration>,
    stop: &Receiver<()>,
) -> HazardResult<Sweep> {
    let backlog = controller.queued_backlog(older_than)?;
    let mut sent = 0;
    for id in backlog {
        if !dispatcher.send_until(WorkItem::new(id), stop)? {
            return Ok(Sweep::Stopped);
        }
        sent += 1;
    }
    Ok(Sweep::Done(sent))
}

/// Handle to the requeue thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct Requeuer {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Requeuer {
    /// Starts sweeping every `interval`.
    ///
    /// # Errors
    /// `InvalidParameters` if `interval` does not fit a timestamp offset;
    /// `Internal` if the thread cannot be spawned.
    pub fn start(
        controller: Arc<LifecycleController>,
        dispatcher: Arc<ChannelDispatcher>,
        interval: Duration,
    ) -> HazardResult<Self> {
        let age = chrono::Duration::from_std(interval).map_err(|e| ValidationError::InvalidConfig {
            field: "requeue_interval".to_string(),
            reason: e.to_string(),
        })?;
        let (stop, stop_rx) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("hazardsim-requeue".to_string())
            .spawn(move || {
                let mut older_than = None;
                loop {
                    match sweep(&controller, &dispatcher, older_than, &stop_rx) {
                        Ok(Sweep::Stopped) => break,
                        Ok(Sweep::Done(0)) => {}
                        Ok(Sweep::Done(sent)) => info!(sent, "requeued simulations"),
                        Err(HazardError::Execution(ExecutionError::Disconnected)) => {
                            debug!("work queue closed; requeuer stopping");
                            break;
                        }
                        Err(e) => warn!(error = %e, "requeue sweep failed; retrying next interval"),
                    }
                    older_than = Some(age);

                    select! {
                        recv(stop_rx) -> _ => break,
                        default(interval) => {}
                    }
                }
                debug!("requeuer exiting");
            })
            .map_err(|e| HazardError::internal(format!("failed to spawn requeue thread: {e}")))?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for it to exit.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("requeue thread panicked");
            }
        }
    }
}

impl Drop for Requeuer {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::work_channel;
    use crate::model::ModelRegistry;
    use crate::parameters::{HazardType, SimulationParameters};
    use crate::simulation::{EngineStamp, OwnerId, Simulation};
    use crate::storage::{InMemorySimulationStore, SimulationStore};

    fn seeded(n: usize) -> (Arc<LifecycleController>, Arc<ChannelDispatcher>, Receiver<WorkItem>) {
        let store = Arc::new(InMemorySimulationStore::new());
        let owner = OwnerId::new("alice").unwrap();
        for i in 0..n {
            let params = SimulationParameters::new(HazardType::Landslide, format!("A{i}"));
            let hash = params.parameter_hash();
            let engine = EngineStamp::new("stability", "1.2.0");
            store.insert(Simulation::queued(owner.clone(), params, hash, engine)).unwrap();
        }
        let (dispatcher, rx) = work_channel(2);
        let dispatcher = Arc::new(dispatcher);
        let controller = Arc::new(LifecycleController::new(
            store,
            dispatcher.clone(),
            Arc::new(ModelRegistry::builtin()),
        ));
        (controller, dispatcher, rx)
    }

    #[test]
    fn first_sweep_outlasts_a_full_queue() {
        let (controller, dispatcher, rx) = seeded(6);
        let requeuer = Requeuer::start(controller, dispatcher, Duration::from_secs(60)).unwrap();

        let mut seen: Vec<_> = (0..6)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap().simulation_id)
            .collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 6);

        requeuer.stop();
    }

    #[test]
    fn stop_interrupts_a_blocked_send() {
        let (controller, dispatcher, rx) = seeded(5);
        let requeuer =
            Requeuer::start(controller, Arc::clone(&dispatcher), Duration::from_secs(60)).unwrap();

        // Nobody drains the queue, so the thread is parked on a send.
        while dispatcher.pending() < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        requeuer.stop();
        assert_eq!(rx.len(), 2);
    }
}
