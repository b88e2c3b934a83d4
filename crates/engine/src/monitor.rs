//! Supervision of one long-running operation on behalf of a component.
//!
//! `run` spawns the operation and returns at once; `check_result` polls without blocking.
//! While the operation is in flight the poll answers with a retry signal tagged with the
//! component name, so a hook can simply `?` it and let the reconciler requeue.

use std::future::Future;
use std::sync::Mutex;

use keel_core::{Error, Operation, Result, RetryableError};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum Slot {
    Idle,
    Running { rx: oneshot::Receiver<bool>, handle: JoinHandle<()>, token: CancellationToken },
    Done(bool),
}

pub struct Monitor {
    component: String,
    slot: Mutex<Slot>,
}

impl Monitor {
    pub fn new(component: impl Into<String>) -> Self { Self { component: component.into(), slot: Mutex::new(Slot::Idle) } }

    pub fn component(&self) -> &str { &self.component }

    fn slot(&self) -> std::sync::MutexGuard<'_, Slot> { self.slot.lock().unwrap_or_else(|p| p.into_inner()) }

    /// Start `op` on its own task. The task posts `true` if `op` returns `Ok`, `false`
    /// otherwise. Starting a second operation before [`reset`](Self::reset) is `MonitorBusy`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run<F, Fut>(&self, op: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut slot = self.slot();
        if !matches!(*slot, Slot::Idle) {
            return Err(Error::MonitorBusy { component: self.component.clone() });
        }
        let (tx, rx) = oneshot::channel();
        let token = CancellationToken::new();
        let child = token.clone();
        let component = self.component.clone();
        let handle = tokio::spawn(async move {
            let ok = match op(child).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(component = %component, error = %e, "background operation failed");
                    false
                }
            };
            let _ = tx.send(ok);
        });
        info!(component = %self.component, "background operation started");
        *slot = Slot::Running { rx, handle, token };
        Ok(())
    }

    /// `Ok(outcome)` once the operation has finished, repeatedly until `reset`. While it is
    /// still running: `Err(Error::Retryable)` naming the component. Never started or reset:
    /// `Err(Error::MonitorNotRunning)`.
    pub fn check_result(&self) -> Result<bool> {
        let mut slot = self.slot();
        let outcome = match &mut *slot {
            Slot::Idle => return Err(Error::MonitorNotRunning { component: self.component.clone() }),
            Slot::Done(ok) => return Ok(*ok),
            Slot::Running { rx, .. } => match rx.try_recv() {
                Ok(ok) => ok,
                Err(TryRecvError::Empty) => {
                    debug!(component = %self.component, "background operation still running");
                    return Err(RetryableError::new(self.component.clone()).with_operation(Operation::Monitor).into());
                }
                // task dropped its sender without posting: aborted or panicked
                Err(TryRecvError::Closed) => false,
            },
        };
        *slot = Slot::Done(outcome);
        Ok(outcome)
    }

    /// True while an operation is in flight and its outcome has not been observed.
    pub fn is_running(&self) -> bool {
        match &*self.slot() {
            Slot::Running { handle, .. } => !handle.is_finished(),
            _ => false,
        }
    }

    /// Stop the in-flight operation: trips the token handed to it and aborts its task.
    /// The outcome becomes `false` until `reset`.
    pub fn cancel(&self) {
        let mut slot = self.slot();
        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Running { handle, token, .. } => {
                token.cancel();
                handle.abort();
                info!(component = %self.component, "background operation cancelled");
                *slot = Slot::Done(false);
            }
            other => *slot = other,
        }
    }

    /// Forget any outcome, cancelling the operation if it is still in flight.
    pub fn reset(&self) {
        if let Slot::Running { handle, token, .. } = std::mem::replace(&mut *self.slot(), Slot::Idle) {
            token.cancel();
            handle.abort();
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Slot::Running { handle, token, .. } = &*self.slot() {
            token.cancel();
            handle.abort();
        }
    }
}
