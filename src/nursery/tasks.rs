//! Background threads of the nursery.
//!
//! A [`TaskGroup`] owns every thread the nursery spawns together with the shutdown flag they
//! observe, so stopping is always "cancel, then join".

use std::{
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{error::NurseryError, utill::HEART_BEAT_INTERVAL};

/// Shutdown flag handed to every task.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    /// Whether the group was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Relaxed)
    }

    /// Sleeps for `duration` unless cancelled earlier. Returns `false` when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(HEART_BEAT_INTERVAL));
        }
        false
    }
}

/// Threads spawned by the nursery.
#[derive(Default)]
pub struct TaskGroup {
    cancellation: Cancellation,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskGroup {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flag observed by the tasks of this group.
    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }

    /// Spawns a named task. Nothing is spawned once the group is cancelled.
    pub fn spawn<F>(&self, name: &str, task: F) -> Result<(), NurseryError>
    where
        F: FnOnce(Cancellation) + Send + 'static,
    {
        if self.cancellation.is_cancelled() {
            log::debug!("Not spawning {name}, nursery is stopping");
            return Ok(());
        }
        let cancellation = self.cancellation();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || task(cancellation))?;

        let mut threads = self.threads.lock()?;
        threads.retain(|thread| !thread.is_finished());
        threads.push(handle);
        Ok(())
    }

    /// Signals every task to stop.
    pub fn cancel(&self) {
        self.cancellation.0.store(true, Relaxed);
    }

    /// Waits for every task to return.
    pub fn join_all(&self) -> Result<(), NurseryError> {
        let threads = std::mem::take(&mut *self.threads.lock()?);
        log::info!("Joining {} threads", threads.len());

        let mut joined_count = 0;
        for thread in threads {
            let name = thread.thread().name().unwrap_or("unnamed").to_string();
            match thread.join() {
                Ok(()) => {
                    log::debug!("Thread {name} joined");
                    joined_count += 1;
                }
                Err(e) => log::error!("Error {e:?} while joining thread {name}"),
            }
        }

        log::info!("Successfully joined {joined_count} threads");
        Ok(())
    }
}
