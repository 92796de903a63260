//! Alarms: one-shot reactor callbacks that race their own cancellation.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tracing::{debug, error};

use crate::command::CallbackHandle;
use crate::completion::CompletionPromise;
use crate::error::{NetworkError, Result};
use crate::finish_line::FinishLine;
use crate::interface::Inner;
use crate::reactor::{ReactorHandle, ReactorTimer};
use crate::{lock, panic_message};

pub(crate) type AlarmAction = Box<dyn FnOnce() + Send>;
pub(crate) type ScheduledAction = Box<dyn FnOnce(Result<()>) + Send>;

/// A pending alarm, owned by the interface's alarm registry until it fires,
/// is cancelled, or is drained by shutdown.
pub(crate) struct AlarmState {
    handle: CallbackHandle,
    when: Instant,
    finish_line: FinishLine,
    action: Mutex<Option<AlarmAction>>,
    promise: Mutex<Option<CompletionPromise<()>>>,
    timer: Mutex<Option<ReactorTimer>>,
}

impl AlarmState {
    pub(crate) fn new(
        handle: CallbackHandle,
        when: Instant,
        action: AlarmAction,
        promise: CompletionPromise<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            handle,
            when,
            finish_line: FinishLine::single(),
            action: Mutex::new(Some(action)),
            promise: Mutex::new(Some(promise)),
            timer: Mutex::new(None),
        })
    }

    /// Schedules the reactor timer that fires the alarm.
    pub(crate) fn arm(self: &Arc<Self>, inner: &Arc<Inner>, reactor: &ReactorHandle) {
        let alarm: Weak<Self> = Arc::downgrade(self);
        let interface: Weak<Inner> = Arc::downgrade(inner);
        let timer = reactor.set_timer(self.when, move || {
            let (Some(alarm), Some(interface)) = (alarm.upgrade(), interface.upgrade()) else {
                return;
            };
            if !alarm.claim() {
                return;
            }
            interface.forget_alarm(alarm.handle, &alarm);
            debug!(handle = %alarm.handle, "alarm fired");
            alarm.fire();
            interface.signal_work_available();
        });

        *lock(&self.timer) = Some(timer);
        // Cancelled or drained while the timer was being created.
        if self.finish_line.is_finished() {
            if let Some(timer) = lock(&self.timer).take() {
                timer.cancel();
            }
        }
    }

    /// Wins the right to resolve this alarm. The winner also stops the timer,
    /// so once this returns `true` the alarm can no longer fire.
    pub(crate) fn claim(&self) -> bool {
        if !self.finish_line.try_force() {
            return false;
        }
        if let Some(timer) = lock(&self.timer).take() {
            timer.cancel();
        }
        true
    }

    /// Runs the action and fulfills the promise with its outcome. Only the
    /// winner of [`AlarmState::claim`] calls this.
    pub(crate) fn fire(&self) {
        let outcome = match lock(&self.action).take() {
            Some(action) => invoke(action),
            None => Ok(()),
        };
        self.fulfill(outcome);
    }

    /// Resolves the alarm without firing it. The action is dropped uncalled.
    pub(crate) fn abandon(&self, reason: NetworkError) {
        debug!(handle = %self.handle, error = %reason, "alarm resolved without firing");
        drop(lock(&self.action).take());
        self.fulfill(Err(reason));
    }

    fn fulfill(&self, outcome: Result<()>) {
        if let Some(promise) = lock(&self.promise).take() {
            promise.fulfill(outcome);
        }
    }
}

/// Calls a reactor action, turning a panic into `Internal`.
fn invoke(action: impl FnOnce()) -> Result<()> {
    match panic::catch_unwind(AssertUnwindSafe(action)) {
        Ok(()) => Ok(()),
        Err(payload) => {
            let message = panic_message(&*payload);
            error!(panic = %message, "reactor action panicked");
            Err(NetworkError::Internal(message))
        }
    }
}

/// An action posted with `schedule`. If the reactor drops the task before it
/// runs, the action still runs once with `ShutdownInProgress`.
pub(crate) struct GuardedAction {
    action: Option<ScheduledAction>,
}

impl GuardedAction {
    pub(crate) fn new(action: ScheduledAction) -> Self {
        Self {
            action: Some(action),
        }
    }

    pub(crate) fn run(mut self, status: Result<()>) {
        if let Some(action) = self.action.take() {
            let _ = invoke(move || action(status));
        }
    }
}

impl Drop for GuardedAction {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            let _ = invoke(move || action(Err(NetworkError::ShutdownInProgress)));
        }
    }
}
