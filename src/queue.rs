use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use thiserror::Error;

/// Error returned by [`TaskQueue::push`] once the queue has been shut down.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("queue terminated")]
pub struct Terminated;

#[derive(Debug, PartialEq, Eq)]
pub enum Popped<T> {
    Item(T),
    Terminate,
}

#[derive(Debug, PartialEq, Eq)]
pub enum TimedPopped<T> {
    Item(T),
    Timeout,
    Terminate,
}

/// Multi-producer/multi-consumer FIFO with fixed capacity and cooperative
/// termination. Items are carried on a bounded crossbeam channel; shutdown
/// is signalled by dropping the sender of a second, empty channel so that
/// every blocked and future waiter observes the disconnect.
///
/// `terminate` removes nothing from the queue: items already queued keep
/// draining to poppers, new pushes fail fast, and pops return `Terminate`
/// once the queue is empty.
pub struct TaskQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    terminated: AtomicBool,
}

impl<T> TaskQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        let (shutdown_tx, shutdown_rx) = bounded(0);
        Self {
            tx,
            rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            terminated: AtomicBool::new(false),
        }
    }

    /// Blocks while the queue is full. Fails fast once the queue has been
    /// terminated; the item is dropped in that case.
    pub fn push(&self, item: T) -> Result<(), Terminated> {
        if self.is_terminated() {
            return Err(Terminated);
        }
        select! {
            send(self.tx, item) -> res => res.map_err(|_| Terminated),
            recv(self.shutdown_rx) -> _ => Err(Terminated),
        }
    }

    /// Blocks until an item is available or the queue is terminated and
    /// empty.
    pub fn pop(&self) -> Popped<T> {
        select! {
            recv(self.rx) -> msg => match msg {
                Ok(item) => Popped::Item(item),
                Err(_) => Popped::Terminate,
            },
            recv(self.shutdown_rx) -> _ => match self.rx.try_recv() {
                Ok(item) => Popped::Item(item),
                Err(_) => Popped::Terminate,
            },
        }
    }

    /// Like [`TaskQueue::pop`] but gives up at `deadline`.
    pub fn pop_until(&self, deadline: Instant) -> TimedPopped<T> {
        let timeout = deadline.saturating_duration_since(Instant::now());
        select! {
            recv(self.rx) -> msg => match msg {
                Ok(item) => TimedPopped::Item(item),
                Err(_) => TimedPopped::Terminate,
            },
            recv(self.shutdown_rx) -> _ => match self.rx.try_recv() {
                Ok(item) => TimedPopped::Item(item),
                Err(_) => TimedPopped::Terminate,
            },
            default(timeout) => TimedPopped::Timeout,
        }
    }

    /// Shut the queue down. Idempotent.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.shutdown_tx.lock().unwrap().take();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Number of items currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn fifo_order_from_single_producer() {
        let queue = TaskQueue::new(8);
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(queue.pop(), Popped::Item(i));
        }
    }

    #[test]
    fn push_blocks_until_popped() {
        let queue = Arc::new(TaskQueue::new(1));
        queue.push(0u32).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(1))
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.pop(), Popped::Item(0));
        producer.join().unwrap().unwrap();
        assert_eq!(queue.pop(), Popped::Item(1));
    }

    #[test]
    fn terminate_wakes_blocked_poppers() {
        let queue: Arc<TaskQueue<u32>> = Arc::new(TaskQueue::new(4));
        let popper = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        };

        thread::sleep(Duration::from_millis(50));
        queue.terminate();
        assert_eq!(popper.join().unwrap(), Popped::Terminate);
    }

    #[test]
    fn terminate_wakes_blocked_pushers() {
        let queue = Arc::new(TaskQueue::new(1));
        queue.push(0u32).unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(1))
        };

        thread::sleep(Duration::from_millis(50));
        queue.terminate();
        assert_eq!(producer.join().unwrap(), Err(Terminated));
    }

    #[test]
    fn queued_items_drain_after_terminate() {
        let queue = TaskQueue::new(4);
        queue.push(1u32).unwrap();
        queue.push(2u32).unwrap();
        queue.terminate();
        queue.terminate();

        assert_eq!(queue.push(3u32), Err(Terminated));
        assert_eq!(queue.pop(), Popped::Item(1));
        assert_eq!(queue.pop(), Popped::Item(2));
        assert_eq!(queue.pop(), Popped::Terminate);
        assert_eq!(queue.pop(), Popped::Terminate);
    }

    #[test]
    fn pop_until_times_out() {
        let queue: TaskQueue<u32> = TaskQueue::new(4);
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(queue.pop_until(deadline), TimedPopped::Timeout);
    }

    #[test]
    fn pop_until_returns_item_before_deadline() {
        let queue = TaskQueue::new(4);
        queue.push(7u32).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        assert_eq!(queue.pop_until(deadline), TimedPopped::Item(7));
    }

    #[test]
    fn pop_until_drains_then_terminates() {
        let queue = TaskQueue::new(4);
        queue.push(7u32).unwrap();
        queue.terminate();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(queue.pop_until(deadline), TimedPopped::Item(7));
        assert_eq!(queue.pop_until(deadline), TimedPopped::Terminate);
    }
}
