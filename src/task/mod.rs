//! Threads, locks, queues and workers.

mod lock;
mod queue;
mod worker;

pub use lock::{mlock, rlock, wlock};
pub use queue::Queue;
pub use worker::{Worker, WorkerMsg};

use std::thread;
use std::time::Duration;

use crate::error::{Error, ErrorKind, Result};
use crate::time::Time;

/// Spawns a named thread the way the server spawns pool workers.
pub fn spawn<F>(name: &str, f: F) -> Result<thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_owned())
        .spawn(f)
        .map_err(|e| Error::with_io(ErrorKind::Thread, "task", "spawning thread", e))
}

/// Sleeps for `ns` nanoseconds; negative durations return at once.
pub fn sleep(ns: Time) {
    if ns > 0 {
        thread::sleep(Duration::from_nanos(ns as u64));
    }
}
