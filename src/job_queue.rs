//! Bounded FIFO of file-preparation requests, shared between the
//! SimTick worker (producer) and the FileIO worker (consumer).
//!
//! Adapted from a fixed-capacity ring buffer: allocation happens once at
//! startup and enqueue blocks (async, via `Notify`) when the queue is
//! full rather than growing unboundedly. The FileIO worker drains it on
//! its own tick interval rather than waiting on a notification.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

use crate::client_id::ClientId;

/// `frameNumber < 0` means "initialize only"; encoded as `None` here
/// rather than carrying the original signed-sentinel convention.
#[derive(Debug, Clone)]
pub struct FileRequest {
    pub sender: ClientId,
    pub file_name: String,
    pub frame_number: Option<u32>,
}

pub struct JobQueue {
    capacity: usize,
    items: Mutex<VecDeque<FileRequest>>,
    slot_available: Notify,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            slot_available: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-blocking enqueue. Returns the request back if the queue is
    /// at capacity.
    pub fn try_push(&self, request: FileRequest) -> Result<(), FileRequest> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(request);
        }
        items.push_back(request);
        Ok(())
    }

    /// Enqueue, waiting for a free slot if the queue is full.
    pub async fn push(&self, mut request: FileRequest) {
        loop {
            match self.try_push(request) {
                Ok(()) => return,
                Err(returned) => {
                    request = returned;
                    self.slot_available.notified().await;
                }
            }
        }
    }

    pub fn try_pop(&self) -> Option<FileRequest> {
        let mut items = self.items.lock();
        let popped = items.pop_front();
        drop(items);
        if popped.is_some() {
            self.slot_available.notify_one();
        }
        popped
    }

    /// Drain everything currently queued, for a FileIO tick.
    pub fn drain(&self) -> Vec<FileRequest> {
        let mut items = self.items.lock();
        let drained: Vec<FileRequest> = items.drain(..).collect();
        drop(items);
        if !drained.is_empty() {
            self.slot_available.notify_waiters();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(name: &str) -> FileRequest {
        FileRequest {
            sender: ClientId::new(),
            file_name: name.to_string(),
            frame_number: None,
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let q = JobQueue::new(4);
        q.try_push(req("a")).unwrap();
        q.try_push(req("b")).unwrap();
        assert_eq!(q.try_pop().unwrap().file_name, "a");
        assert_eq!(q.try_pop().unwrap().file_name, "b");
    }

    #[test]
    fn enqueue_past_capacity_is_rejected() {
        let q = JobQueue::new(1);
        q.try_push(req("a")).unwrap();
        let rejected = q.try_push(req("b"));
        assert!(rejected.is_err());
    }

    #[tokio::test]
    async fn push_waits_for_a_freed_slot() {
        let q = std::sync::Arc::new(JobQueue::new(1));
        q.try_push(req("a")).unwrap();

        let q2 = q.clone();
        let waiter = tokio::spawn(async move {
            q2.push(req("b")).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        q.try_pop().unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("push should complete once a slot frees")
            .unwrap();
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn drain_returns_everything_in_order() {
        let q = JobQueue::new(4);
        q.try_push(req("a")).unwrap();
        q.try_push(req("b")).unwrap();
        q.try_push(req("c")).unwrap();
        let drained = q.drain();
        let names: Vec<&str> = drained.iter().map(|r| r.file_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(q.is_empty());
    }
}
