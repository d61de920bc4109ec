//! Debounced task handle.
//!
//! Every `schedule` restarts a single timer; the job only runs once the
//! timer elapses without being rescheduled. `cancel` drops a pending job
//! and may be called any number of times.
//!
//! ```text
//! schedule ─┐ schedule ─┐ schedule ─┐
//!           ▼           ▼           ▼
//!           ├─ abort ───┼─ abort ───┼──── delay ────► job
//! ```
//!
//! Once the timer has fired the job is detached from the handle, so a
//! `cancel` racing with a running job never interrupts it halfway.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::lock;

#[derive(Default)]
struct Pending {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

/// A restartable, cancellable delayed job.
pub struct DebouncedTask {
    delay: Duration,
    pending: Arc<Mutex<Pending>>,
}

impl DebouncedTask {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(Pending::default())),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Restart the timer with `job` as the work to run when it elapses.
    ///
    /// Any previously scheduled job that has not fired yet is dropped.
    pub fn schedule<F>(&self, runtime: &Handle, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = lock(&self.pending);
        if let Some(previous) = pending.handle.take() {
            previous.abort();
        }
        pending.generation = pending.generation.wrapping_add(1);

        let generation = pending.generation;
        let slot = self.pending.clone();
        let delay = self.delay;
        pending.handle = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut pending = lock(&slot);
                if pending.generation != generation {
                    return;
                }
                pending.handle = None;
            }
            job.await;
        }));
    }

    /// Drop the pending job, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        let mut pending = lock(&self.pending);
        pending.generation = pending.generation.wrapping_add(1);
        match pending.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.pending).handle.is_some()
    }
}

impl Drop for DebouncedTask {
    fn drop(&mut self) {
        self.cancel();
    }
}
