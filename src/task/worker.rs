use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use log::error;

use crate::error::{Error, ErrorKind, Result};
use crate::task::{self, Queue};
use crate::time::{Time, MILLI};

const OBJECT: &str = "worker";

/// Interval for polling the worker state on `stop`.
const MINOR: Time = 10 * MILLI;

const STOPPED: u8 = 0;
const RUNNING: u8 = 1;

/// A message to a worker: either a job payload or the stop sentinel.
pub enum WorkerMsg<M> {
    /// A job to perform.
    Job(M),
    /// Breaks the worker loop. Sent with priority by `stop`.
    Stop,
}

/// A long-lived thread consuming a job queue.
///
/// The job callback runs with `Some(msg)` for each dequeued message
/// and with `None` whenever one period elapses without a message
/// (the periodic branch). Errors returned by the job are published to
/// the error queue when one is configured, otherwise logged.
pub struct Worker<M: Send + 'static> {
    name: String,
    queue: Arc<Queue<WorkerMsg<M>>>,
    state: Arc<AtomicU8>,
    handle: Option<JoinHandle<()>>,
}

impl<M: Send + 'static> Worker<M> {
    /// Spawns a worker named `name` with the given period (ns) and
    /// job callback. `errqueue` optionally receives job errors.
    pub fn new<F>(
        name: &str,
        period: Time,
        errqueue: Option<Arc<Queue<Error>>>,
        job: F,
    ) -> Result<Worker<M>>
    where
        F: FnMut(Option<M>) -> Result<()> + Send + 'static,
    {
        let queue: Arc<Queue<WorkerMsg<M>>> = Arc::new(Queue::new(0, None));
        Self::with_queue(name, period, queue, errqueue, job)
    }

    /// Like `new`, but consuming an existing queue; several workers
    /// sharing one queue form a pool.
    pub fn with_queue<F>(
        name: &str,
        period: Time,
        queue: Arc<Queue<WorkerMsg<M>>>,
        errqueue: Option<Arc<Queue<Error>>>,
        mut job: F,
    ) -> Result<Worker<M>>
    where
        F: FnMut(Option<M>) -> Result<()> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(STOPPED));
        let period = if period > 0 { period } else { -1 };

        let wname = name.to_owned();
        let wqueue = queue.clone();
        let wstate = state.clone();
        let handle = task::spawn(name, move || {
            wstate.store(RUNNING, Ordering::Release);
            loop {
                match wqueue.dequeue(period) {
                    Ok(WorkerMsg::Stop) => break,
                    Ok(WorkerMsg::Job(msg)) => {
                        if let Err(e) = job(Some(msg)) {
                            report(&wname, &errqueue, e);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Timeout => {
                        // periodic branch
                        if let Err(e) = job(None) {
                            report(&wname, &errqueue, e);
                        }
                    }
                    Err(e) => report(&wname, &errqueue, e),
                }
            }
            wstate.store(STOPPED, Ordering::Release);
        })?;

        // wait until the loop announces itself
        let worker = Worker {
            name: name.to_owned(),
            queue,
            state,
            handle: Some(handle),
        };
        worker.wait_for(RUNNING, SECOND_TMO)?;
        Ok(worker)
    }

    /// Enqueues a job for the worker.
    pub fn send(&self, msg: M) -> Result<()> {
        self.queue.enqueue(WorkerMsg::Job(msg))
    }

    /// The worker's job queue, for producers that outlive the borrow.
    pub fn queue(&self) -> Arc<Queue<WorkerMsg<M>>> {
        self.queue.clone()
    }

    /// True while the worker loop runs.
    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    fn wait_for(&self, state: u8, tmo: Time) -> Result<()> {
        let deadline = if tmo >= 0 {
            Some(Instant::now() + std::time::Duration::from_nanos(tmo as u64))
        } else {
            None
        };
        loop {
            if self.state.load(Ordering::Acquire) == state {
                return Ok(());
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(Error::new(ErrorKind::Timeout, &self.name, "waiting for state"));
                }
            }
            task::sleep(MINOR);
        }
    }

    /// Stops the worker: priority-enqueues the stop sentinel, polls
    /// the state every 10 ms until stopped or `tmo` expires, then
    /// joins the thread.
    ///
    /// The queue is left open: in a pool, siblings still consume it.
    /// The queue owner shuts it down after the last worker stopped.
    pub fn stop(&mut self, tmo: Time) -> Result<()> {
        if self.state.load(Ordering::Acquire) != STOPPED {
            self.queue.enqueue_prio(WorkerMsg::Stop)?;
            self.wait_for(STOPPED, tmo)?;
        }
        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| Error::new(ErrorKind::Thread, OBJECT, "worker thread panicked"))?;
        }
        Ok(())
    }
}

fn report(name: &str, errqueue: &Option<Arc<Queue<Error>>>, e: Error) {
    if let Some(q) = errqueue {
        if q.enqueue(e).is_ok() {
            return;
        }
        error!("worker {name}: error queue unavailable");
    } else {
        error!("worker {name}: {e}");
    }
}

impl<M: Send + 'static> Drop for Worker<M> {
    fn drop(&mut self) {
        let _ = self.stop(SECOND_TMO);
    }
}

const SECOND_TMO: Time = 1_000_000_000;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::SECOND;
    use std::sync::Mutex;

    #[test]
    fn runs_jobs_and_stops() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let mut wrk = Worker::new("t-jobs", 5 * MILLI, None, move |msg: Option<u64>| {
            if let Some(m) = msg {
                seen2.lock().unwrap().push(m);
            }
            Ok(())
        })
        .unwrap();
        for i in 0..5 {
            wrk.send(i).unwrap();
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
        wrk.stop(SECOND).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(!wrk.is_running());
    }

    #[test]
    fn periodic_branch_fires() {
        let ticks = Arc::new(Mutex::new(0u32));
        let ticks2 = ticks.clone();
        let mut wrk = Worker::new("t-tick", MILLI, None, move |msg: Option<()>| {
            if msg.is_none() {
                *ticks2.lock().unwrap() += 1;
            }
            Ok(())
        })
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(50));
        wrk.stop(SECOND).unwrap();
        assert!(*ticks.lock().unwrap() > 0);
    }

    /// Two workers exchange a pair through their queues, each keeping
    /// the smaller element and forwarding the rolled pair; seeded with
    /// (1,1) this produces the Fibonacci sequence.
    #[test]
    fn fibonacci_ping_pong() {
        let list = Arc::new(Mutex::new(Vec::new()));

        // channels to patch the cycle after both workers exist
        let (txa, rxa) = std::sync::mpsc::channel::<Worker<(u64, u64)>>();

        let list_b = list.clone();
        let peer_a: Arc<Mutex<Option<Worker<(u64, u64)>>>> = Arc::new(Mutex::new(None));
        let peer_a2 = peer_a.clone();
        let wrk_b = Worker::new("fib-b", SECOND, None, move |msg: Option<(u64, u64)>| {
            if let Some((x, y)) = msg {
                let mut peer = peer_a2.lock().unwrap();
                if peer.is_none() {
                    *peer = Some(rxa.recv().unwrap());
                }
                list_b.lock().unwrap().push(x);
                peer.as_ref().unwrap().send((y, x + y)).unwrap();
            }
            Ok(())
        })
        .unwrap();

        let list_a = list.clone();
        let wrk_b = Arc::new(Mutex::new(Some(wrk_b)));
        let wrk_b2 = wrk_b.clone();
        let wrk_a = Worker::new("fib-a", SECOND, None, move |msg: Option<(u64, u64)>| {
            if let Some((x, y)) = msg {
                list_a.lock().unwrap().push(x);
                if let Some(b) = wrk_b2.lock().unwrap().as_ref() {
                    b.send((y, x + y)).unwrap();
                }
            }
            Ok(())
        })
        .unwrap();

        txa.send(wrk_a).unwrap();
        if let Some(b) = wrk_b.lock().unwrap().as_ref() {
            b.send((1, 1)).unwrap();
        }

        let expect = vec![1u64, 1, 2, 3, 5, 8, 13, 21, 34, 55, 89, 144, 233, 377, 610, 987];
        for _ in 0..200 {
            if list.lock().unwrap().len() >= 16 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let got: Vec<u64> = list.lock().unwrap().iter().take(16).copied().collect();
        assert_eq!(got, expect);

        if let Some(mut b) = wrk_b.lock().unwrap().take() {
            b.stop(SECOND).unwrap();
        };
    }
}
