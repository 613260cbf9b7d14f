use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorKind, Result};
use crate::time::Time;

const OBJECT: &str = "queue";

/// Queue capacity meaning "no limit".
pub const QUEUE_INF: usize = 0;

struct Inner<T> {
    list: VecDeque<T>,
    closed: bool,
}

/// A blocking FIFO for inter-thread communication.
///
/// Enqueue blocks while the queue is at capacity and fails with
/// `Busy` once the queue is closed; a priority enqueue inserts at the
/// head ignoring capacity. Dequeue takes a nanosecond timeout:
/// negative blocks forever, zero returns immediately, positive fails
/// with `Timeout` on expiry. Wakeup is condition-variable based.
pub struct Queue<T> {
    inner: Mutex<Inner<T>>,
    avail: Condvar,
    room: Condvar,
    max: usize,
    drain: Option<Box<dyn Fn(T) + Send + Sync>>,
}

impl<T> Queue<T> {
    /// Creates a queue holding at most `max` messages (0 = unbounded)
    /// with an optional drain callback invoked per residual message
    /// on shutdown.
    pub fn new(max: usize, drain: Option<Box<dyn Fn(T) + Send + Sync>>) -> Self {
        Queue {
            inner: Mutex::new(Inner {
                list: VecDeque::new(),
                closed: false,
            }),
            avail: Condvar::new(),
            room: Condvar::new(),
            max,
            drain,
        }
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, Inner<T>>> {
        self.inner
            .lock()
            .map_err(|_| Error::new(ErrorKind::Lock, OBJECT, "queue mutex poisoned"))
    }

    /// Appends a message, blocking while the queue is at capacity.
    pub fn enqueue(&self, msg: T) -> Result<()> {
        let mut inner = self.guard()?;
        loop {
            if inner.closed {
                return Err(Error::new(ErrorKind::Busy, OBJECT, "queue is closed"));
            }
            if self.max == QUEUE_INF || inner.list.len() < self.max {
                break;
            }
            // poll for room; dequeue signals it when a slot frees up
            inner = self
                .room
                .wait_timeout(inner, Duration::from_millis(25))
                .map_err(|_| Error::new(ErrorKind::Lock, OBJECT, "queue mutex poisoned"))?
                .0;
        }
        inner.list.push_back(msg);
        drop(inner);
        self.avail.notify_one();
        Ok(())
    }

    /// Inserts a message at the head, ignoring capacity. Used for
    /// stop sentinels that must overtake pending work.
    pub fn enqueue_prio(&self, msg: T) -> Result<()> {
        let mut inner = self.guard()?;
        if inner.closed {
            return Err(Error::new(ErrorKind::Busy, OBJECT, "queue is closed"));
        }
        inner.list.push_front(msg);
        drop(inner);
        self.avail.notify_one();
        Ok(())
    }

    /// Removes the message at the head.
    ///
    /// `tmo` is in nanoseconds: negative blocks forever, zero returns
    /// immediately, positive blocks at most that long and fails with
    /// `Timeout` on expiry.
    pub fn dequeue(&self, tmo: Time) -> Result<T> {
        let deadline = if tmo > 0 {
            Some(Instant::now() + Duration::from_nanos(tmo as u64))
        } else {
            None
        };
        let mut inner = self.guard()?;
        loop {
            if let Some(msg) = inner.list.pop_front() {
                drop(inner);
                self.room.notify_one();
                return Ok(msg);
            }
            if tmo == 0 {
                return Err(Error::new(ErrorKind::Timeout, OBJECT, "with timeout=0"));
            }
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::new(ErrorKind::Timeout, OBJECT, "with timeout>0"));
                }
                inner = self
                    .avail
                    .wait_timeout(inner, deadline - now)
                    .map_err(|_| Error::new(ErrorKind::Lock, OBJECT, "queue mutex poisoned"))?
                    .0;
            } else {
                inner = self
                    .avail
                    .wait(inner)
                    .map_err(|_| Error::new(ErrorKind::Lock, OBJECT, "queue mutex poisoned"))?;
            }
        }
    }

    /// Closes the queue for `enqueue`.
    pub fn close(&self) -> Result<()> {
        self.guard()?.closed = true;
        self.avail.notify_all();
        Ok(())
    }

    /// Reopens a closed queue; no effect if it is open.
    pub fn open(&self) -> Result<()> {
        self.guard()?.closed = false;
        Ok(())
    }

    /// Removes all messages, invoking the drain callback on each.
    pub fn drain(&self) -> Result<()> {
        let mut inner = self.guard()?;
        while let Some(msg) = inner.list.pop_front() {
            if let Some(ref drain) = self.drain {
                drain(msg);
            }
        }
        self.room.notify_all();
        Ok(())
    }

    /// Closes and drains the queue.
    pub fn shutdown(&self) -> Result<()> {
        self.close()?;
        self.drain()
    }

    /// Current number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|i| i.list.len()).unwrap_or(0)
    }

    /// True if no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::MILLI;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn fifo_order() {
        let q: Queue<u32> = Queue::new(QUEUE_INF, None);
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        q.enqueue_prio(0).unwrap();
        assert_eq!(q.dequeue(-1).unwrap(), 0);
        assert_eq!(q.dequeue(-1).unwrap(), 1);
        assert_eq!(q.dequeue(-1).unwrap(), 2);
    }

    #[test]
    fn timeout_semantics() {
        let q: Queue<u32> = Queue::new(QUEUE_INF, None);
        let err = q.dequeue(0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let err = q.dequeue(5 * MILLI).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn closed_rejects_enqueue() {
        let q: Queue<u32> = Queue::new(QUEUE_INF, None);
        q.close().unwrap();
        assert_eq!(q.enqueue(1).unwrap_err().kind(), ErrorKind::Busy);
        q.open().unwrap();
        q.enqueue(1).unwrap();
    }

    #[test]
    fn shutdown_drains_residuals() {
        let n = Arc::new(AtomicUsize::new(0));
        let n2 = n.clone();
        let q: Queue<u32> = Queue::new(
            QUEUE_INF,
            Some(Box::new(move |_| {
                n2.fetch_add(1, Ordering::SeqCst);
            })),
        );
        q.enqueue(1).unwrap();
        q.enqueue(2).unwrap();
        q.shutdown().unwrap();
        assert_eq!(n.load(Ordering::SeqCst), 2);
        assert!(q.is_empty());
    }

    #[test]
    fn blocking_dequeue_wakes() {
        let q: Arc<Queue<u32>> = Arc::new(Queue::new(QUEUE_INF, None));
        let q2 = q.clone();
        let h = std::thread::spawn(move || q2.dequeue(-1).unwrap());
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.enqueue(7).unwrap();
        assert_eq!(h.join().unwrap(), 7);
    }
}
