//! Work dispatch between the lifecycle controller and the worker pool.
//!
//! Dispatch is an explicit bounded channel handed to both sides. Sending
//! from a request never blocks: a full queue is reported back to the caller
//! as back-pressure. Only the background requeuer waits for room.

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

use crate::error::ExecutionError;
use crate::simulation::SimulationId;

/// Unit of work handed to the execution worker.
///
/// Carries only the id: the worker reads parameters from the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    /// Simulation to execute.
    pub simulation_id: SimulationId,
}

impl WorkItem {
    /// Creates a work item for `simulation_id`.
    #[must_use]
    pub const fn new(simulation_id: SimulationId) -> Self {
        Self { simulation_id }
    }
}

/// Hands work items to an execution backend without waiting for them.
pub trait WorkDispatcher: Send + Sync {
    /// Enqueue `item`.
    ///
    /// # Errors
    /// - `QueueFull` if the backend is saturated
    /// - `Disconnected` if no consumer remains
    fn dispatch(&self, item: WorkItem) -> Result<(), ExecutionError>;
}

/// Dispatcher backed by a bounded crossbeam channel.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    tx: Sender<WorkItem>,
    capacity: usize,
}

impl ChannelDispatcher {
    /// Wraps an existing sender.
    #[must_use]
    pub const fn new(tx: Sender<WorkItem>, capacity: usize) -> Self {
        Self { tx, capacity }
    }

    /// Queue capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Items currently waiting in the queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    /// Blocks until `item` is queued or `stop` fires.
    ///
    /// Returns `false` if stopped first. A disconnected `stop` counts as
    /// fired.
    ///
    /// # Errors
    /// `Disconnected` if no consumer remains.
    pub fn send_until(&self, item: WorkItem, stop: &Receiver<()>) -> Result<bool, ExecutionError> {
        select! {
            send(self.tx, item) -> res => {
                res.map(|()| true).map_err(|_| ExecutionError::Disconnected)
            }
            recv(stop) -> _ => Ok(false),
        }
    }
}

impl WorkDispatcher for ChannelDispatcher {
    fn dispatch(&self, item: WorkItem) -> Result<(), ExecutionError> {
        match self.tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(ExecutionError::QueueFull {
                capacity: self.capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(ExecutionError::Disconnected),
        }
    }
}

/// Creates a bounded work queue. Capacity is clamped to at least 1.
#[must_use]
pub fn work_channel(capacity: usize) -> (ChannelDispatcher, Receiver<WorkItem>) {
    let capacity = capacity.max(1);
    let (tx, rx) = bounded(capacity);
    (ChannelDispatcher::new(tx, capacity), rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_is_reported() {
        let (dispatcher, rx) = work_channel(1);
        let item = WorkItem::new(SimulationId::new());

        dispatcher.dispatch(item).unwrap();
        assert_eq!(dispatcher.pending(), 1);
        assert!(matches!(
            dispatcher.dispatch(WorkItem::new(SimulationId::new())),
            Err(ExecutionError::QueueFull { capacity: 1 })
        ));

        assert_eq!(rx.recv().unwrap(), item);
    }

    #[test]
    fn dropped_receiver_is_disconnected() {
        let (dispatcher, rx) = work_channel(4);
        drop(rx);
        assert!(matches!(
            dispatcher.dispatch(WorkItem::new(SimulationId::new())),
            Err(ExecutionError::Disconnected)
        ));
    }

    #[test]
    fn send_until_waits_for_room() {
        let (dispatcher, rx) = work_channel(1);
        let (_stop_tx, stop_rx) = bounded::<()>(1);
        let first = WorkItem::new(SimulationId::new());
        let second = WorkItem::new(SimulationId::new());
        dispatcher.dispatch(first).unwrap();

        let consumer = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            (rx.recv().unwrap(), rx.recv().unwrap())
        });
        assert!(dispatcher.send_until(second, &stop_rx).unwrap());
        assert_eq!(consumer.join().unwrap(), (first, second));
    }

    #[test]
    fn send_until_gives_up_when_stopped() {
        let (dispatcher, _rx) = work_channel(1);
        dispatcher.dispatch(WorkItem::new(SimulationId::new())).unwrap();

        let (stop_tx, stop_rx) = bounded::<()>(1);
        drop(stop_tx);
        assert!(!dispatcher.send_until(WorkItem::new(SimulationId::new()), &stop_rx).unwrap());
        assert_eq!(dispatcher.pending(), 1);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let (dispatcher, _rx) = work_channel(0);
        assert_eq!(dispatcher.capacity(), 1);
    }
}
