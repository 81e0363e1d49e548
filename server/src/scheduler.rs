//! Deferred execution onto the simulation thread
//!
//! Network tasks never touch simulation state directly. They package the
//! work as an action and enqueue it here; the simulation thread drains the
//! queue once per tick and runs every action with exclusive access to the
//! simulation. The inbox mutex is held only for the push and for the buffer
//! swap at drain time, never while actions run.

use log::debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// A unit of work to run on the simulation thread
pub type Action<S> = Box<dyn FnOnce(&mut S) + Send>;

pub struct DeferredQueue<S> {
    inbox: Mutex<Vec<Action<S>>>,
    pending: AtomicBool,
}

impl<S> Default for DeferredQueue<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> DeferredQueue<S> {
    pub fn new() -> Self {
        Self {
            inbox: Mutex::new(Vec::new()),
            pending: AtomicBool::new(false),
        }
    }

    /// Queues an action for the next drain. Callable from any thread.
    pub fn enqueue<F>(&self, action: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        inbox.push(Box::new(action));
        self.pending.store(true, Ordering::Release);
    }

    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Runs every action queued so far, in enqueue order.
    ///
    /// Must only be called from the simulation thread. `scratch` is the
    /// thread's private drain buffer; it is swapped with the inbox so the
    /// lock is held for a pointer swap only. Actions enqueued while this runs
    /// wait for the next drain. Returns the number of actions run.
    pub fn drain(&self, scratch: &mut Vec<Action<S>>, sim: &mut S) -> usize {
        if !self.has_pending() {
            return 0;
        }

        scratch.clear();
        {
            let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::swap(&mut *inbox, scratch);
            self.pending.store(false, Ordering::Release);
        }

        let count = scratch.len();
        for action in scratch.drain(..) {
            action(sim);
        }
        if count > 0 {
            debug!("Drained {} deferred actions", count);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_drain_runs_in_enqueue_order() {
        let queue = DeferredQueue::<Vec<u32>>::new();
        for i in 0..100 {
            queue.enqueue(move |log: &mut Vec<u32>| log.push(i));
        }

        let mut scratch = Vec::new();
        let mut log = Vec::new();
        assert_eq!(queue.drain(&mut scratch, &mut log), 100);
        assert_eq!(log, (0..100).collect::<Vec<_>>());
        assert!(!queue.has_pending());
    }

    #[test]
    fn test_empty_drain_is_noop() {
        let queue = DeferredQueue::<u32>::new();
        let mut scratch = Vec::new();
        let mut counter = 0;
        assert_eq!(queue.drain(&mut scratch, &mut counter), 0);
        assert_eq!(counter, 0);
    }

    #[test]
    fn test_actions_enqueued_during_drain_wait_for_next_drain() {
        let queue = Arc::new(DeferredQueue::<Vec<&'static str>>::new());
        let inner = Arc::clone(&queue);
        queue.enqueue(move |log: &mut Vec<&'static str>| {
            log.push("first");
            inner.enqueue(|log: &mut Vec<&'static str>| log.push("second"));
        });

        let mut scratch = Vec::new();
        let mut log = Vec::new();
        assert_eq!(queue.drain(&mut scratch, &mut log), 1);
        assert_eq!(log, vec!["first"]);
        assert!(queue.has_pending());

        assert_eq!(queue.drain(&mut scratch, &mut log), 1);
        assert_eq!(log, vec!["first", "second"]);
    }

    #[test]
    fn test_per_producer_order_is_preserved() {
        let queue = Arc::new(DeferredQueue::<Vec<(usize, usize)>>::new());
        let producers = 4;
        let per_producer = 500;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        queue.enqueue(move |log: &mut Vec<(usize, usize)>| log.push((p, i)));
                    }
                })
            })
            .collect();

        let mut scratch = Vec::new();
        let mut log = Vec::new();
        // Drain concurrently with the producers to exercise the swap
        while log.len() < producers * per_producer {
            queue.drain(&mut scratch, &mut log);
            thread::yield_now();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        queue.drain(&mut scratch, &mut log);

        assert_eq!(log.len(), producers * per_producer);
        for p in 0..producers {
            let seen: Vec<usize> = log.iter().filter(|(q, _)| *q == p).map(|(_, i)| *i).collect();
            assert_eq!(seen, (0..per_producer).collect::<Vec<_>>());
        }
    }
}
