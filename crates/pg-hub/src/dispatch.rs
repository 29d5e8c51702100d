//! Inbound delivery queue
//!
//! Deliveries are never made inline. The engine appends them here and asks
//! for a flush; at most one flush task exists at a time, and it drains the
//! queue in batches until a re-check under the engine lock finds it empty.
//! Entries appended by callbacks during a drain are picked up by the same
//! task.

use crate::consumer::Consumer;
use crate::types::Event;

/// One pending callback invocation.
pub(crate) struct Delivery {
    pub consumer: Consumer,
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum FlushState {
    /// No flush task exists
    #[default]
    Idle,
    /// A flush task was spawned and has not started draining
    Pending,
    /// A flush task is draining
    Working,
}

#[derive(Default)]
pub(crate) struct DispatchQueue {
    pending: Vec<Delivery>,
    state: FlushState,
}

impl DispatchQueue {
    pub(crate) fn push(&mut self, consumer: Consumer, event: Event) {
        self.pending.push(Delivery { consumer, event });
    }

    /// Request a flush. Returns true if the caller must spawn a flush task.
    pub(crate) fn schedule(&mut self) -> bool {
        if self.state == FlushState::Idle && !self.pending.is_empty() {
            self.state = FlushState::Pending;
            return true;
        }
        false
    }

    /// Mark the flush task as draining.
    pub(crate) fn begin(&mut self) {
        self.state = FlushState::Working;
    }

    /// Take the next batch. An empty batch ends the drain and returns the
    /// queue to idle.
    pub(crate) fn take(&mut self) -> Vec<Delivery> {
        let batch = std::mem::take(&mut self.pending);
        if batch.is_empty() {
            self.state = FlushState::Idle;
        }
        batch
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;

    fn consumer(id: u64) -> Consumer {
        Consumer::detached(id, |_, _| {})
    }

    #[test]
    fn test_single_flush_task() {
        let mut queue = DispatchQueue::default();
        assert!(!queue.schedule(), "nothing to flush");

        queue.push(consumer(1), Event::control(Action::Connect));
        assert!(queue.schedule());
        assert!(!queue.schedule(), "flush already pending");

        queue.begin();
        queue.push(consumer(2), Event::control(Action::Connect));
        assert!(!queue.schedule(), "draining task picks up new entries");

        assert_eq!(queue.take().len(), 2);
        assert!(queue.take().is_empty());
        assert_eq!(queue.len(), 0);

        queue.push(consumer(3), Event::control(Action::Stop));
        assert!(queue.schedule(), "idle again after drain");
    }

    #[test]
    fn test_batches_keep_order() {
        let mut queue = DispatchQueue::default();
        for id in 0..4 {
            queue.push(consumer(id), Event::control(Action::Reconnect));
        }
        queue.schedule();
        queue.begin();

        let ids: Vec<u64> = queue.take().iter().map(|d| d.consumer.id()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }
}
