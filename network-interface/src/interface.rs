//! The network interface facade.
//!
//! [`NetworkInterface`] accepts commands and alarms from any thread, keeps the
//! in-flight registries, and owns the reactor thread's lifetime. Registry locks
//! guard membership only: they are never held across I/O or while a completion
//! callback runs.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::alarm::{AlarmState, GuardedAction, ScheduledAction};
use crate::command::{CallbackHandle, CommandResult, HostAndPort, RemoteCommandRequest, RemoteCommandResponse};
use crate::completion::CompletionFuture;
use crate::config::NetworkInterfaceOptions;
use crate::counters::{CounterSink, InterfaceCounters, InterfaceCountersSnapshot};
use crate::dispatch::CommandState;
use crate::error::{NetworkError, Result};
use crate::lock;
use crate::pool::{ConnectionPool, PoolStats};
use crate::reactor::{Reactor, ReactorHandle};

/// One-way lifecycle: default, then started, then stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Lifecycle {
    Default = 0,
    Started = 1,
    Stopped = 2,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Default,
            1 => Self::Started,
            _ => Self::Stopped,
        }
    }
}

/// Dispatches remote commands over pooled connections on a dedicated thread.
///
/// Share it behind an `Arc`; dropping the last owner shuts it down.
pub struct NetworkInterface {
    inner: Arc<Inner>,
}

/// State shared between the facade, the reactor and in-flight work.
pub(crate) struct Inner {
    pub(crate) options: NetworkInterfaceOptions,
    pub(crate) pool: Arc<dyn ConnectionPool>,
    pub(crate) counters: Arc<dyn CounterSink>,
    pub(crate) stats: InterfaceCounters,
    state: AtomicU8,
    reactor: OnceLock<ReactorHandle>,
    reactor_owner: Mutex<Option<Reactor>>,
    in_progress: Mutex<HashMap<CallbackHandle, Arc<CommandState>>>,
    in_progress_alarms: Mutex<HashMap<CallbackHandle, Arc<AlarmState>>>,
    live_requests: AtomicUsize,
    requests_idle: Notify,
    work_ready: Mutex<bool>,
    work_cond: Condvar,
}

impl NetworkInterface {
    pub fn new(
        options: NetworkInterfaceOptions,
        pool: Arc<dyn ConnectionPool>,
        counters: Arc<dyn CounterSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                pool,
                counters,
                stats: InterfaceCounters::default(),
                state: AtomicU8::new(Lifecycle::Default as u8),
                reactor: OnceLock::new(),
                reactor_owner: Mutex::new(None),
                in_progress: Mutex::new(HashMap::new()),
                in_progress_alarms: Mutex::new(HashMap::new()),
                live_requests: AtomicUsize::new(0),
                requests_idle: Notify::new(),
                work_ready: Mutex::new(false),
                work_cond: Condvar::new(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Inner> {
        &self.inner
    }

    pub fn instance_name(&self) -> &str {
        &self.inner.options.instance_name
    }

    /// Starts the reactor thread. An interface can only be started once.
    pub fn startup(&self) -> Result<()> {
        let mut owner = lock(&self.inner.reactor_owner);
        match self.inner.lifecycle() {
            Lifecycle::Default => {}
            Lifecycle::Started => {
                return Err(NetworkError::IllegalOperation(
                    "network interface already started".to_string(),
                ))
            }
            Lifecycle::Stopped => {
                return Err(NetworkError::IllegalOperation(
                    "network interface cannot be restarted after shutdown".to_string(),
                ))
            }
        }

        let mut reactor = Reactor::start(&self.inner.options.instance_name)
            .map_err(|err| NetworkError::Internal(format!("{err:#}")))?;

        if self
            .inner
            .state
            .compare_exchange(
                Lifecycle::Default as u8,
                Lifecycle::Started as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            reactor.stop();
            return Err(NetworkError::IllegalOperation(
                "network interface was shut down during startup".to_string(),
            ));
        }

        let _ = self.inner.reactor.set(reactor.handle().clone());
        *owner = Some(reactor);
        info!(instance = %self.inner.options.instance_name, "network interface started");
        Ok(())
    }

    /// Stops accepting work, resolves everything still in flight with
    /// `ShutdownInProgress`, and waits for the reactor thread to exit.
    ///
    /// Idempotent. When called from the reactor thread itself the thread is not
    /// joined.
    pub fn shutdown(&self) {
        let previous = Lifecycle::from_u8(
            self.inner
                .state
                .swap(Lifecycle::Stopped as u8, Ordering::AcqRel),
        );
        if previous == Lifecycle::Stopped {
            return;
        }
        info!(instance = %self.inner.options.instance_name, "shutting down network interface");
        self.inner.wake_all_waiters();

        if let Some(reactor) = self.inner.reactor.get().cloned() {
            if reactor.on_reactor_thread() {
                self.inner.drain_in_flight();
            } else {
                let inner = Arc::clone(&self.inner);
                let (done_tx, done_rx) = std_mpsc::channel();
                reactor.spawn(async move {
                    inner.drain_in_flight();
                    inner.wait_for_requests(inner.options.shutdown_grace).await;
                    let _ = done_tx.send(());
                });
                // An error here means the reactor already went away.
                let _ = done_rx.recv();
            }
        }

        // Take the owner out first so the registry lock is not held while joining.
        let owner = lock(&self.inner.reactor_owner).take();
        if let Some(mut reactor) = owner {
            reactor.stop();
        }
        self.inner.pool.shutdown();
        info!(instance = %self.inner.options.instance_name, "network interface stopped");
    }

    pub fn in_shutdown(&self) -> bool {
        self.inner.lifecycle() == Lifecycle::Stopped
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle() == Lifecycle::Started
    }

    /// Submits a command. `on_finish` runs exactly once on the reactor thread
    /// with the command's terminal outcome.
    ///
    /// Returns immediately; an `Err` means the command was rejected and
    /// `on_finish` will never run.
    pub fn start_command<F>(&self, handle: CallbackHandle, request: RemoteCommandRequest, on_finish: F) -> Result<()>
    where
        F: FnOnce(CommandResult) + Send + 'static,
    {
        request.validate()?;
        let reactor = self.inner.reactor()?;

        let state = CommandState::make(Arc::clone(&self.inner), handle, request, Box::new(on_finish));
        {
            let mut in_progress = lock(&self.inner.in_progress);
            // Checked under the registry lock so shutdown's drain cannot miss us.
            if !self.is_running() {
                return Err(NetworkError::NotRunning);
            }
            match in_progress.entry(handle) {
                Entry::Occupied(_) => return Err(NetworkError::DuplicateHandle(handle)),
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&state));
                }
            }
        }

        self.inner.stats.record_sent();
        debug!(
            handle = %handle,
            targets = state.request.target.len(),
            tolerance = state.request.failure_tolerance,
            "command accepted"
        );
        reactor.spawn(async move { state.start() });
        Ok(())
    }

    /// Promise-style variant of [`NetworkInterface::start_command`].
    pub fn run_command(
        &self,
        handle: CallbackHandle,
        request: RemoteCommandRequest,
    ) -> Result<CompletionFuture<RemoteCommandResponse>> {
        let (promise, future) = CompletionFuture::channel();
        self.start_command(handle, request, move |result| promise.fulfill(result))?;
        Ok(future)
    }

    /// Requests cancellation of an in-flight command. Unknown or already
    /// finished handles are ignored.
    pub fn cancel_command(&self, handle: CallbackHandle) {
        let Some(state) = lock(&self.inner.in_progress).get(&handle).cloned() else {
            debug!(handle = %handle, "cancel requested for a command that is not in flight");
            return;
        };
        let Ok(reactor) = self.inner.reactor() else {
            return;
        };
        reactor.spawn(async move {
            state.cancel(NetworkError::Cancelled);
        });
    }

    /// Schedules `action` to run on the reactor at `when`.
    ///
    /// The action only runs if the alarm fires. The returned future resolves
    /// with `Ok(())` after it ran, `Err(Cancelled)` if the alarm was cancelled
    /// first, or `Err(ShutdownInProgress)` if shutdown drained it.
    pub fn set_alarm<F>(&self, handle: CallbackHandle, when: Instant, action: F) -> Result<CompletionFuture<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let reactor = self.inner.reactor()?;
        let (promise, future) = CompletionFuture::channel();
        let state = AlarmState::new(handle, when, Box::new(action), promise);
        {
            let mut alarms = lock(&self.inner.in_progress_alarms);
            if !self.is_running() {
                return Err(NetworkError::NotRunning);
            }
            match alarms.entry(handle) {
                Entry::Occupied(_) => return Err(NetworkError::DuplicateHandle(handle)),
                Entry::Vacant(slot) => {
                    slot.insert(Arc::clone(&state));
                }
            }
        }

        debug!(handle = %handle, "alarm set");
        state.arm(&self.inner, &reactor);
        Ok(future)
    }

    /// Cancels a pending alarm. Once this returns the alarm can no longer
    /// fire and its action will never run. Unknown or already answered handles
    /// are ignored.
    pub fn cancel_alarm(&self, handle: CallbackHandle) {
        let Some(state) = lock(&self.inner.in_progress_alarms).get(&handle).cloned() else {
            debug!(handle = %handle, "cancel requested for an alarm that is not pending");
            return;
        };
        if !state.claim() {
            return;
        }
        self.inner.forget_alarm(handle, &state);
        state.abandon(NetworkError::Cancelled);
        self.inner.signal_work_available();
    }

    /// Runs `action` on the reactor as soon as possible.
    ///
    /// If the reactor stops before the action gets to run, it is invoked with
    /// `Err(ShutdownInProgress)` instead of being dropped.
    pub fn schedule<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        let reactor = self.inner.reactor()?;
        let action: ScheduledAction = Box::new(action);
        let guarded = GuardedAction::new(action);
        reactor.spawn(async move { guarded.run(Ok(())) });
        Ok(())
    }

    /// Blocks until work is signalled or the interface shuts down.
    pub fn wait_for_work(&self) {
        let mut ready = lock(&self.inner.work_ready);
        while !*ready && !self.in_shutdown() {
            ready = self
                .inner
                .work_cond
                .wait(ready)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *ready = false;
    }

    /// Like [`NetworkInterface::wait_for_work`], giving up at `when`.
    ///
    /// Returns `false` if the deadline passed with nothing signalled.
    pub fn wait_for_work_until(&self, when: Instant) -> bool {
        let mut ready = lock(&self.inner.work_ready);
        loop {
            if *ready || self.in_shutdown() {
                *ready = false;
                return true;
            }
            let now = Instant::now();
            if now >= when {
                return false;
            }
            let (guard, _) = self
                .inner
                .work_cond
                .wait_timeout(ready, when - now)
                .unwrap_or_else(PoisonError::into_inner);
            ready = guard;
        }
    }

    pub fn signal_work_available(&self) {
        self.inner.signal_work_available();
    }

    pub fn now(&self) -> Instant {
        Instant::now()
    }

    pub fn on_network_thread(&self) -> bool {
        self.inner
            .reactor
            .get()
            .is_some_and(ReactorHandle::on_reactor_thread)
    }

    pub fn drop_connections(&self, host: &HostAndPort) {
        info!(host = %host, "dropping pooled connections");
        self.inner.pool.drop_connections(host);
    }

    pub fn connection_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn counters(&self) -> InterfaceCountersSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn in_flight_commands(&self) -> usize {
        lock(&self.inner.in_progress).len()
    }

    pub fn pending_alarms(&self) -> usize {
        lock(&self.inner.in_progress_alarms).len()
    }

    /// Human-readable summary for logs and status pages.
    pub fn diagnostic_string(&self) -> String {
        let pool = self.connection_stats();
        let counters = self.counters();
        format!(
            "{name} ({state:?}): {commands} command(s) in flight, {alarms} alarm(s) pending, \
             {requests} live request(s); pool: {in_use} in use, {available} available, \
             {created} created; sent {sent}, succeeded {succeeded}, failed {failed}, \
             timed out {timed_out}, canceled {canceled}",
            name = self.inner.options.instance_name,
            state = self.inner.lifecycle(),
            commands = self.in_flight_commands(),
            alarms = self.pending_alarms(),
            requests = self.inner.live_requests.load(Ordering::Relaxed),
            in_use = pool.total_in_use,
            available = pool.total_available,
            created = pool.total_created,
            sent = counters.sent,
            succeeded = counters.succeeded,
            failed = counters.failed,
            timed_out = counters.timed_out,
            canceled = counters.canceled,
        )
    }
}

impl Drop for NetworkInterface {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn reactor(&self) -> Result<ReactorHandle> {
        self.reactor.get().cloned().ok_or(NetworkError::NotRunning)
    }

    /// Drops a finished command from the registry, unless the handle has
    /// already been reused by a different command.
    pub(crate) fn forget_command(&self, handle: CallbackHandle, state: &CommandState) {
        let mut in_progress = lock(&self.in_progress);
        if in_progress
            .get(&handle)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), state))
        {
            in_progress.remove(&handle);
        }
    }

    pub(crate) fn forget_alarm(&self, handle: CallbackHandle, state: &Arc<AlarmState>) {
        let mut alarms = lock(&self.in_progress_alarms);
        if alarms
            .get(&handle)
            .is_some_and(|current| Arc::ptr_eq(current, state))
        {
            alarms.remove(&handle);
        }
    }

    pub(crate) fn request_started(&self) {
        self.live_requests.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn request_finished(&self) {
        if self.live_requests.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.requests_idle.notify_waiters();
        }
    }

    pub(crate) fn signal_work_available(&self) {
        let mut ready = lock(&self.work_ready);
        if !*ready {
            *ready = true;
            self.work_cond.notify_one();
        }
    }

    fn wake_all_waiters(&self) {
        let _ready = lock(&self.work_ready);
        self.work_cond.notify_all();
    }

    /// Forces every registered command and alarm to a terminal outcome.
    /// Runs on the reactor.
    fn drain_in_flight(&self) {
        let alarms: Vec<_> = lock(&self.in_progress_alarms).drain().map(|(_, state)| state).collect();
        let commands: Vec<_> = lock(&self.in_progress).drain().map(|(_, state)| state).collect();
        if !alarms.is_empty() || !commands.is_empty() {
            info!(
                alarms = alarms.len(),
                commands = commands.len(),
                "resolving in-flight work for shutdown"
            );
        }

        for alarm in alarms {
            if alarm.claim() {
                alarm.abandon(NetworkError::ShutdownInProgress);
            }
        }
        for command in commands {
            command.cancel(NetworkError::ShutdownInProgress);
        }
    }

    /// Gives cancelled requests a chance to hand their connections back.
    async fn wait_for_requests(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let idle = self.requests_idle.notified();
            let live = self.live_requests.load(Ordering::Acquire);
            if live == 0 {
                return;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                warn!(live, "requests still running after shutdown grace period");
                return;
            }
        }
    }
}
