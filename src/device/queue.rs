// SPDX-License-Identifier: AGPL-3.0-only

//! In-order execution queue backed by one worker thread per device.
//!
//! Jobs run in submission order. A job first waits on its dependency events
//! (which may belong to other devices' queues); if any dependency failed the
//! job is skipped and its own event carries the dependency's error.

use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;

use super::event::{EventSignal, SyncEvent};
use crate::error::{LatticeError, Result};

/// Work submitted to a device queue.
pub type Work = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

struct Job {
    label: &'static str,
    deps: Vec<SyncEvent>,
    work: Work,
    signal: EventSignal,
}

pub(crate) struct ExecQueue {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl std::fmt::Debug for ExecQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecQueue")
            .field("worker", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl ExecQueue {
    pub(crate) fn spawn(name: &str) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let worker = thread::Builder::new()
            .name(format!("queue-{name}"))
            .spawn(move || run_worker(&receiver))
            .map_err(|e| LatticeError::backend("queue spawn", e))?;
        let worker_id = worker.thread().id();
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    /// Submit `work` after `deps`; returns immediately.
    pub(crate) fn submit(&self, label: &'static str, deps: &[SyncEvent], work: Work) -> SyncEvent {
        let (event, signal) = SyncEvent::pending();
        let job = Job {
            label,
            deps: deps.iter().filter(|d| !d.is_empty()).cloned().collect(),
            work,
            signal,
        };
        let guard = self.sender.lock();
        match guard.as_ref() {
            Some(sender) => {
                if let Err(mpsc::SendError(job)) = sender.send(job) {
                    job.signal
                        .finish(Err(LatticeError::backend(label, "device queue closed")));
                }
            }
            None => job
                .signal
                .finish(Err(LatticeError::backend(label, "device queue closed"))),
        }
        event
    }
}

fn run_worker(receiver: &mpsc::Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        let Job {
            label,
            deps,
            work,
            signal,
        } = job;
        let outcome = match SyncEvent::wait_all(&deps) {
            Ok(()) => work(),
            Err(e) => Err(e),
        };
        if let Err(e) = &outcome {
            tracing::warn!(op = label, error = %e, "queued operation failed");
        }
        signal.finish(outcome);
    }
}

impl Drop for ExecQueue {
    fn drop(&mut self) {
        self.sender.lock().take();
        // The last device handle may be released from inside a job; never join ourselves.
        if thread::current().id() == self.worker_id {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn jobs_run_in_submission_order() {
        let queue = ExecQueue::spawn("order").expect("spawn");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut events = Vec::new();
        for i in 0..16 {
            let log = Arc::clone(&log);
            events.push(queue.submit(
                "push",
                &[],
                Box::new(move || {
                    log.lock().push(i);
                    Ok(())
                }),
            ));
        }
        SyncEvent::wait_all(&events).expect("all ran");
        assert_eq!(*log.lock(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn cross_queue_dependency_is_honoured() {
        let a = ExecQueue::spawn("a").expect("spawn a");
        let b = ExecQueue::spawn("b").expect("spawn b");
        let flag = Arc::new(Mutex::new(false));
        let first = {
            let flag = Arc::clone(&flag);
            a.submit(
                "set",
                &[],
                Box::new(move || {
                    std::thread::sleep(std::time::Duration::from_millis(20));
                    *flag.lock() = true;
                    Ok(())
                }),
            )
        };
        let seen = Arc::new(Mutex::new(false));
        let second = {
            let flag = Arc::clone(&flag);
            let seen = Arc::clone(&seen);
            b.submit(
                "read",
                &[first],
                Box::new(move || {
                    *seen.lock() = *flag.lock();
                    Ok(())
                }),
            )
        };
        second.wait().expect("second");
        assert!(*seen.lock());
    }

    #[test]
    fn failed_dependency_skips_job() {
        let queue = ExecQueue::spawn("fail").expect("spawn");
        let bad = queue.submit(
            "bad",
            &[],
            Box::new(|| Err(LatticeError::backend("bad", "injected"))),
        );
        let ran = Arc::new(Mutex::new(false));
        let next = {
            let ran = Arc::clone(&ran);
            queue.submit(
                "next",
                &[bad],
                Box::new(move || {
                    *ran.lock() = true;
                    Ok(())
                }),
            )
        };
        assert!(next.wait().is_err());
        assert!(!*ran.lock());
    }
}
