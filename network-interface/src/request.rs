//! One host-targeted attempt at a command.
//!
//! A request runs as a single reactor task: acquire a connection, send, await
//! the reply, hand the connection back. Every await is raced against the
//! command's cancellation signal, and every exit path (including a panic or the
//! reactor dropping the task) returns the connection exactly once.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error};

use crate::command::{CallbackHandle, HostAndPort, RemoteCommandRequest};
use crate::dispatch::CommandState;
use crate::error::NetworkError;
use crate::finish_line::FinishLine;
use crate::interface::Inner;
use crate::panic_message;
use crate::pool::{ConnectionHandle, ConnectionStatus, Received};

/// Decides which of a round's acquisitions carries the command.
///
/// The first acquired connection forces the line. Each failed acquisition
/// arrives weakly, so the last failure of a round with no winner claims it.
/// Starting the next round retires this one, which stops any acquisitions it
/// still has pending.
#[derive(Debug)]
pub(crate) struct AcquisitionRace {
    finish_line: FinishLine,
    round: usize,
    retired: watch::Sender<bool>,
}

impl AcquisitionRace {
    pub(crate) fn new(participants: usize, round: usize) -> Self {
        let (retired, _) = watch::channel(false);
        Self {
            finish_line: FinishLine::new(participants as u64),
            round,
            retired,
        }
    }

    pub(crate) fn retire(&self) {
        self.retired.send_replace(true);
    }

    fn is_retired(&self) -> bool {
        *self.retired.borrow()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestPhase {
    Created,
    AcquiringConnection,
    Sending,
    AwaitingResponse,
    Completed,
    Cancelled,
    Failed,
    ConnectionReturned,
}

/// How a request ended, as far as its command cares.
enum Report {
    Quiet,
    Failure { error: NetworkError, round_over: bool },
    Response(Received),
    Fatal(String),
}

pub(crate) struct RequestState {
    command: Weak<CommandState>,
    interface: Arc<Inner>,
    request: Arc<RemoteCommandRequest>,
    handle: CallbackHandle,
    index: usize,
    host: HostAndPort,
    race: Arc<AcquisitionRace>,
    cancelled: watch::Receiver<bool>,
    retired: watch::Receiver<bool>,
    conn: Option<ConnectionHandle>,
    phase: RequestPhase,
}

impl RequestState {
    pub(crate) fn new(command: &Arc<CommandState>, index: usize, race: Arc<AcquisitionRace>) -> Self {
        let interface = Arc::clone(command.interface());
        interface.request_started();
        Self {
            command: Arc::downgrade(command),
            request: Arc::clone(&command.request),
            handle: command.handle,
            index,
            host: command.request.target[index].clone(),
            retired: race.retired.subscribe(),
            race,
            cancelled: command.subscribe_cancellation(),
            conn: None,
            phase: RequestPhase::Created,
            interface,
        }
    }

    pub(crate) async fn run(mut self) {
        let outcome = AssertUnwindSafe(self.drive()).catch_unwind().await;
        let report = match outcome {
            Ok(report) => report,
            Err(payload) => {
                let message = panic_message(&*payload);
                error!(
                    handle = %self.handle,
                    host = %self.host,
                    phase = ?self.phase,
                    panic = %message,
                    "request panicked"
                );
                self.phase = RequestPhase::Failed;
                self.return_connection(ConnectionStatus::Unhealthy);
                Report::Fatal(message)
            }
        };

        let Some(command) = self.command.upgrade() else {
            return;
        };
        match report {
            Report::Quiet => {}
            Report::Failure { error, round_over } => {
                command.on_request_failure(self.index, self.race.round, error, round_over)
            }
            Report::Response(received) => command.on_response(self.index, received),
            Report::Fatal(message) => command.cancel(NetworkError::Internal(message)),
        }
    }

    async fn drive(&mut self) -> Report {
        if self.is_cancelled() || self.race.is_retired() {
            self.phase = RequestPhase::Cancelled;
            return Report::Quiet;
        }

        self.phase = RequestPhase::AcquiringConnection;
        let timeout = self.acquire_timeout();
        let acquired = tokio::select! {
            biased;
            _ = cancellation(&mut self.cancelled) => None,
            _ = cancellation(&mut self.retired) => None,
            acquired = self.interface.pool.get(&self.host, timeout) => Some(acquired),
        };
        let conn = match acquired {
            None => {
                self.phase = RequestPhase::Cancelled;
                return Report::Quiet;
            }
            Some(Err(err)) => {
                self.phase = RequestPhase::Failed;
                let error = if err.is_host_failure() {
                    err
                } else {
                    NetworkError::acquisition(&self.host, err)
                };
                return Report::Failure {
                    error,
                    round_over: self.race.finish_line.try_claim(),
                };
            }
            Some(Ok(conn)) => conn,
        };
        self.conn = Some(ConnectionHandle::new(conn));

        if !self.race.finish_line.try_force() {
            debug!(
                handle = %self.handle,
                host = %self.host,
                round = self.race.round,
                "lost acquisition race; returning connection unused"
            );
            self.phase = RequestPhase::Cancelled;
            self.return_connection(ConnectionStatus::Healthy);
            return Report::Quiet;
        }
        if self.is_cancelled() {
            self.phase = RequestPhase::Cancelled;
            self.return_connection(ConnectionStatus::Healthy);
            return Report::Quiet;
        }
        self.phase = RequestPhase::Sending;
        debug!(
            handle = %self.handle,
            host = %self.host,
            round = self.race.round,
            "won acquisition race"
        );

        let sent = {
            let Some(conn) = self.conn.as_mut().and_then(ConnectionHandle::connection) else {
                return Report::Fatal("connection vanished before send".to_string());
            };
            tokio::select! {
                biased;
                _ = cancellation(&mut self.cancelled) => None,
                sent = conn.send(&self.request) => Some(sent),
            }
        };
        match sent {
            None => return self.abandon(),
            Some(Err(err)) => {
                let error = if err.is_host_failure() {
                    err
                } else {
                    NetworkError::send(&self.host, err)
                };
                return self.fail(error);
            }
            Some(Ok(bytes)) => {
                self.interface.counters.hit_logical_out(bytes.logical);
                self.interface.counters.hit_physical_out(bytes.physical);
            }
        }

        self.phase = RequestPhase::AwaitingResponse;
        let received = {
            let Some(conn) = self.conn.as_mut().and_then(ConnectionHandle::connection) else {
                return Report::Fatal("connection vanished before receive".to_string());
            };
            tokio::select! {
                biased;
                _ = cancellation(&mut self.cancelled) => None,
                received = conn.receive() => Some(received),
            }
        };
        match received {
            None => self.abandon(),
            Some(Err(err)) => {
                let error = if err.is_host_failure() {
                    err
                } else {
                    NetworkError::receive(&self.host, err)
                };
                self.fail(error)
            }
            Some(Ok(received)) => {
                self.interface.counters.hit_logical_in(received.bytes.logical);
                self.interface.counters.hit_physical_in(received.bytes.physical);
                self.phase = RequestPhase::Completed;
                self.return_connection(ConnectionStatus::Healthy);
                Report::Response(received)
            }
        }
    }

    /// The command finished while I/O was outstanding; the exchange is left
    /// half done, so the connection cannot be reused.
    fn abandon(&mut self) -> Report {
        debug!(
            handle = %self.handle,
            host = %self.host,
            phase = ?self.phase,
            "request cancelled mid-exchange"
        );
        self.phase = RequestPhase::Cancelled;
        self.return_connection(ConnectionStatus::Unhealthy);
        Report::Quiet
    }

    /// The winning request failed after acquiring, which ends its round.
    fn fail(&mut self, error: NetworkError) -> Report {
        self.phase = RequestPhase::Failed;
        self.return_connection(ConnectionStatus::Unhealthy);
        Report::Failure {
            error,
            round_over: true,
        }
    }

    fn return_connection(&mut self, status: ConnectionStatus) {
        if let Some(mut conn) = self.conn.take() {
            conn.release(status);
            self.phase = RequestPhase::ConnectionReturned;
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow() || self.command.upgrade().map_or(true, |command| command.is_finished())
    }

    /// Never waits past the command's deadline.
    fn acquire_timeout(&self) -> Duration {
        let configured = self.interface.options.acquire_timeout;
        match self.request.deadline {
            Some(deadline) => configured.min(deadline.saturating_duration_since(Instant::now())),
            None => configured,
        }
    }
}

impl Drop for RequestState {
    fn drop(&mut self) {
        // An unreleased lease discards itself when dropped.
        self.conn = None;
        self.interface.request_finished();
    }
}

/// Resolves once the command has finished. A dropped sender counts too.
async fn cancellation(cancelled: &mut watch::Receiver<bool>) {
    let _ = cancelled.wait_for(|cancelled| *cancelled).await;
}
