//! A small command server for exercising the network interface end to end.
//!
//! It answers every [`WireRequest`] by echoing the command document. Two
//! command fields change that: `sleepMs` delays the reply and `fail` turns it
//! into an error reply carrying the given message.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tracing::{debug, info, warn};

use crate::counters::{CounterSink, NetworkCounter, NetworkCounterSnapshot, OpCounters, OpCountersSnapshot};
use crate::message::{read_message, write_message, WireReply, WireRequest};

pub struct CommandServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

#[derive(Default)]
struct ServerState {
    network: NetworkCounter,
    ops: OpCounters,
}

/// Shared read access to a running server's counters.
#[derive(Clone)]
pub struct ServerCounters {
    state: Arc<ServerState>,
}

impl ServerCounters {
    pub fn network(&self) -> NetworkCounterSnapshot {
        self.state.network.snapshot()
    }

    pub fn ops(&self) -> OpCountersSnapshot {
        self.state.ops.snapshot()
    }
}

impl CommandServer {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState::default()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn counters(&self) -> ServerCounters {
        ServerCounters {
            state: Arc::clone(&self.state),
        }
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let CommandServer { listener, state } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("command server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state);
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(result: std::io::Result<(TcpStream, SocketAddr)>, state: &Arc<ServerState>) {
    match result {
        Ok((stream, peer)) => {
            state.network.accepted_connection();
            spawn_connection_handler(stream, peer, state);
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, state: &Arc<ServerState>) {
    let state = Arc::clone(state);
    tokio::spawn(async move {
        debug!(peer = %peer, "connection accepted");
        if let Err(err) = handle_connection(stream, &state).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(stream: TcpStream, state: &ServerState) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    while let Some((request, bytes)) = read_message::<_, WireRequest>(&mut reader).await? {
        state.network.hit_logical_in(bytes.logical);
        state.network.hit_physical_in(bytes.physical);
        state.ops.got_op(request.op, true);

        let reply = answer(request).await;
        let sent = write_message(&mut writer, &reply).await?;
        state.network.hit_logical_out(sent.logical);
        state.network.hit_physical_out(sent.physical);
    }

    Ok(())
}

async fn answer(request: WireRequest) -> WireReply {
    if let Some(delay) = request.cmd.get("sleepMs").and_then(Value::as_u64) {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if let Some(message) = request.cmd.get("fail") {
        let message = message
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| message.to_string());
        return WireReply::Error {
            id: request.id,
            message,
        };
    }
    WireReply::Reply {
        id: request.id,
        data: request.cmd,
    }
}
