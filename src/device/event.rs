// SPDX-License-Identifier: AGPL-3.0-only

//! Completion events for queued device operations.
//!
//! A [`SyncEvent`] is either empty (a null handle, always satisfied) or
//! shares a completion slot with the queued job that signals it. Waiting is
//! idempotent: every call after completion returns the stored outcome
//! immediately.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{LatticeError, Result};

#[derive(Debug, Default)]
struct EventState {
    outcome: Mutex<Option<Result<()>>>,
    ready: Condvar,
}

/// Handle to the completion of an asynchronous device operation.
#[derive(Clone, Debug, Default)]
#[must_use = "an event should be waited on or passed as a dependency"]
pub struct SyncEvent {
    state: Option<Arc<EventState>>,
}

impl SyncEvent {
    /// An event that is already satisfied.
    pub const fn complete() -> Self {
        Self { state: None }
    }

    /// Fresh, unsignalled event plus the signaller half kept by the queue.
    pub(crate) fn pending() -> (Self, EventSignal) {
        let state = Arc::new(EventState::default());
        (
            Self {
                state: Some(Arc::clone(&state)),
            },
            EventSignal { state },
        )
    }

    /// Whether this event was created from a null handle.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.state.is_none()
    }

    /// Non-blocking completion check.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state
            .as_ref()
            .map_or(true, |s| s.outcome.lock().is_some())
    }

    /// Block until the operation finished.
    ///
    /// # Errors
    ///
    /// Returns the error the operation (or one of its dependencies) failed with.
    pub fn wait(&self) -> Result<()> {
        let Some(state) = &self.state else {
            return Ok(());
        };
        let mut outcome = state.outcome.lock();
        while outcome.is_none() {
            state.ready.wait(&mut outcome);
        }
        outcome.clone().unwrap_or(Ok(()))
    }

    /// Wait on every event, returning the first failure after all finished.
    ///
    /// # Errors
    ///
    /// Returns the first failing event's error.
    pub fn wait_all(events: &[Self]) -> Result<()> {
        let mut first_err = None;
        for event in events {
            if let Err(e) = event.wait() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Producer side of a [`SyncEvent`], owned by the job that completes it.
#[derive(Debug)]
pub(crate) struct EventSignal {
    state: Arc<EventState>,
}

impl EventSignal {
    pub(crate) fn finish(self, outcome: Result<()>) {
        *self.state.outcome.lock() = Some(outcome);
        self.state.ready.notify_all();
    }
}

impl Drop for EventSignal {
    // A job dropped without running (queue torn down) must not leave waiters hanging.
    fn drop(&mut self) {
        let mut outcome = self.state.outcome.lock();
        if outcome.is_none() {
            *outcome = Some(Err(LatticeError::backend(
                "event",
                "operation dropped before completion",
            )));
            self.state.ready.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_event_is_satisfied() {
        let ev = SyncEvent::complete();
        assert!(ev.is_empty());
        assert!(ev.is_complete());
        ev.wait().expect("first wait");
        ev.wait().expect("second wait");
    }

    #[test]
    fn wait_is_idempotent_after_signal() {
        let (ev, signal) = SyncEvent::pending();
        assert!(!ev.is_complete());
        signal.finish(Ok(()));
        ev.wait().expect("first wait");
        ev.wait().expect("second wait");
        assert!(ev.is_complete());
    }

    #[test]
    fn failure_is_seen_by_every_clone() {
        let (ev, signal) = SyncEvent::pending();
        let other = ev.clone();
        signal.finish(Err(LatticeError::backend("clear", "boom")));
        assert!(ev.wait().is_err());
        assert_eq!(ev.wait(), other.wait());
    }

    #[test]
    fn dropped_signal_fails_waiters() {
        let (ev, signal) = SyncEvent::pending();
        drop(signal);
        let err = ev.wait().expect_err("dropped job");
        assert!(err.to_string().contains("dropped"));
    }

    #[test]
    fn wait_across_threads() {
        let (ev, signal) = SyncEvent::pending();
        let waiter = {
            let ev = ev.clone();
            std::thread::spawn(move || ev.wait())
        };
        std::thread::sleep(std::time::Duration::from_millis(10));
        signal.finish(Ok(()));
        waiter.join().expect("join").expect("wait");
    }

    #[test]
    fn wait_all_reports_first_failure() {
        let (a, sa) = SyncEvent::pending();
        let (b, sb) = SyncEvent::pending();
        sa.finish(Ok(()));
        sb.finish(Err(LatticeError::backend("load", "bad")));
        let err = SyncEvent::wait_all(&[a, SyncEvent::complete(), b]).expect_err("b failed");
        assert!(err.to_string().contains("load"));
    }
}
