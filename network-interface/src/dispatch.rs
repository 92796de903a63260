//! Command lifecycle on the reactor.
//!
//! A [`CommandState`] lives in the interface's in-flight registry from
//! submission until one terminal outcome crosses its [`FinishLine`]. Requests
//! and the deadline timer only hold weak references to it, so once the winner
//! removes it from the registry nothing keeps a resolved command alive.
//!
//! Connection acquisition proceeds in rounds. Each round races one request per
//! eligible host; the first acquired connection carries the command and the
//! rest are handed back unused. A failure either ends the command (tolerance
//! used up) or, if it ended the round without a response, retires that round
//! and starts a new one over the hosts that have not failed yet. Each host
//! counts against the tolerance at most once.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::command::{CallbackHandle, CommandResult, RemoteCommandRequest, RemoteCommandResponse};
use crate::error::NetworkError;
use crate::finish_line::FinishLine;
use crate::interface::Inner;
use crate::pool::Received;
use crate::reactor::{ReactorHandle, ReactorTimer};
use crate::request::{AcquisitionRace, RequestState};
use crate::{lock, panic_message};

pub(crate) type OnFinish = Box<dyn FnOnce(CommandResult) + Send>;

#[derive(Debug, Default)]
struct Attempts {
    failures: usize,
    failed_hosts: Vec<bool>,
    rounds: usize,
}

impl Attempts {
    /// Marks a host failed, counting it once however many times it fails, and
    /// returns the hosts still eligible for another round.
    fn record_failure(&mut self, index: usize) -> Vec<usize> {
        if !self.failed_hosts[index] {
            self.failed_hosts[index] = true;
            self.failures += 1;
        }
        self.failed_hosts
            .iter()
            .enumerate()
            .filter(|(_, failed)| !**failed)
            .map(|(index, _)| index)
            .collect()
    }
}

/// What a request failure means for its command.
enum Next {
    Stale,
    Wait,
    Retry(Vec<usize>),
    Exhausted(NetworkError),
}

pub(crate) struct CommandState {
    pub(crate) handle: CallbackHandle,
    pub(crate) request: Arc<RemoteCommandRequest>,
    interface: Arc<Inner>,
    started: Instant,
    finish_line: FinishLine,
    on_finish: Mutex<Option<OnFinish>>,
    timer: Mutex<Option<ReactorTimer>>,
    cancel_tx: watch::Sender<bool>,
    attempts: Mutex<Attempts>,
    current_race: Mutex<Option<Arc<AcquisitionRace>>>,
}

impl CommandState {
    pub(crate) fn make(
        interface: Arc<Inner>,
        handle: CallbackHandle,
        request: RemoteCommandRequest,
        on_finish: OnFinish,
    ) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        let attempts = Attempts {
            failed_hosts: vec![false; request.target.len()],
            ..Attempts::default()
        };
        Arc::new(Self {
            handle,
            request: Arc::new(request),
            interface,
            started: Instant::now(),
            finish_line: FinishLine::single(),
            on_finish: Mutex::new(Some(on_finish)),
            timer: Mutex::new(None),
            cancel_tx,
            attempts: Mutex::new(attempts),
            current_race: Mutex::new(None),
        })
    }

    /// Arms the deadline and launches the first acquisition round. Runs on the
    /// reactor.
    pub(crate) fn start(self: Arc<Self>) {
        if self.finish_line.is_finished() {
            return;
        }
        let reactor = match self.interface.reactor() {
            Ok(reactor) => reactor,
            Err(err) => {
                self.try_finish(Err(err));
                return;
            }
        };

        if let Some(deadline) = self.request.deadline {
            if deadline <= Instant::now() {
                self.try_finish(Err(NetworkError::Timeout {
                    elapsed: self.started.elapsed(),
                }));
                return;
            }
            self.arm_timer(&reactor, deadline);
        }

        let hosts = (0..self.request.target.len()).collect();
        self.launch_round(&reactor, hosts);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finish_line.is_finished()
    }

    pub(crate) fn subscribe_cancellation(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub(crate) fn interface(&self) -> &Arc<Inner> {
        &self.interface
    }

    fn arm_timer(self: &Arc<Self>, reactor: &ReactorHandle, deadline: Instant) {
        let command = Arc::downgrade(self);
        let timer = reactor.set_timer(deadline, move || {
            if let Some(command) = command.upgrade() {
                let elapsed = command.started.elapsed();
                command.try_finish(Err(NetworkError::Timeout { elapsed }));
            }
        });
        *lock(&self.timer) = Some(timer);
        if self.finish_line.is_finished() {
            if let Some(timer) = lock(&self.timer).take() {
                timer.cancel();
            }
        }
    }

    fn launch_round(self: &Arc<Self>, reactor: &ReactorHandle, hosts: Vec<usize>) {
        let round = {
            let mut attempts = lock(&self.attempts);
            attempts.rounds += 1;
            attempts.rounds
        };
        debug!(
            handle = %self.handle,
            round,
            hosts = hosts.len(),
            "starting connection acquisition"
        );

        let race = Arc::new(AcquisitionRace::new(hosts.len(), round));
        let previous = lock(&self.current_race).replace(Arc::clone(&race));
        if let Some(previous) = previous {
            previous.retire();
        }
        for index in hosts {
            let request = RequestState::new(self, index, Arc::clone(&race));
            reactor.spawn(request.run());
        }
    }

    pub(crate) fn on_response(&self, index: usize, received: Received) {
        let response = RemoteCommandResponse {
            target: self.request.target[index].clone(),
            data: received.data,
            elapsed: self.started.elapsed(),
        };
        self.try_finish(Ok(response));
    }

    /// Absorbs a per-host failure, or fails the command once the tolerance is
    /// used up. `round_over` is set when the failure left its round without any
    /// request able to answer. Failures from a retired round are ignored.
    pub(crate) fn on_request_failure(
        self: &Arc<Self>,
        index: usize,
        round: usize,
        err: NetworkError,
        round_over: bool,
    ) {
        if self.finish_line.is_finished() {
            return;
        }

        let tolerance = self.request.failure_tolerance;
        let next = {
            let mut attempts = lock(&self.attempts);
            if round != attempts.rounds {
                Next::Stale
            } else {
                let remaining = attempts.record_failure(index);
                if attempts.failures > tolerance || (round_over && remaining.is_empty()) {
                    Next::Exhausted(NetworkError::ExhaustedRetries {
                        failures: attempts.failures,
                        last: Box::new(err.clone()),
                    })
                } else if round_over {
                    Next::Retry(remaining)
                } else {
                    Next::Wait
                }
            }
        };

        match next {
            Next::Stale => {
                debug!(handle = %self.handle, round, error = %err, "failure from a retired round ignored");
            }
            Next::Wait => {
                debug!(handle = %self.handle, error = %err, "host failure absorbed");
            }
            Next::Retry(hosts) => {
                info!(
                    handle = %self.handle,
                    error = %err,
                    remaining = hosts.len(),
                    "host failure absorbed; retrying remaining hosts"
                );
                match self.interface.reactor() {
                    Ok(reactor) => self.launch_round(&reactor, hosts),
                    Err(err) => {
                        self.try_finish(Err(err));
                    }
                }
            }
            Next::Exhausted(outcome) => {
                self.try_finish(Err(outcome));
            }
        }
    }

    /// Resolves the command with `reason` unless something else already has.
    /// Runs on the reactor.
    pub(crate) fn cancel(&self, reason: NetworkError) {
        if !self.try_finish(Err(reason)) {
            debug!(handle = %self.handle, "cancel ignored; command already finished");
        }
    }

    /// Crosses the finish line with `result`. Only the winner cancels the
    /// timer, stops live requests, leaves the registry and runs the callback.
    fn try_finish(&self, result: CommandResult) -> bool {
        if !self.finish_line.try_force() {
            return false;
        }

        if let Some(timer) = lock(&self.timer).take() {
            timer.cancel();
        }
        self.cancel_tx.send_replace(true);
        self.interface.forget_command(self.handle, self);
        self.interface.stats.record_outcome(&result);

        match &result {
            Ok(response) => debug!(
                handle = %self.handle,
                host = %response.target,
                elapsed_ms = response.elapsed.as_millis() as u64,
                "command succeeded"
            ),
            Err(err) if err.is_cancellation() => {
                debug!(handle = %self.handle, error = %err, "command cancelled")
            }
            Err(err) => warn!(handle = %self.handle, error = %err, "command failed"),
        }

        let callback = lock(&self.on_finish).take();
        if let Some(callback) = callback {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(result))) {
                error!(
                    handle = %self.handle,
                    panic = %panic_message(&*payload),
                    "completion callback panicked"
                );
            }
        }
        self.interface.signal_work_available();
        true
    }
}
