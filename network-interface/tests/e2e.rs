use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);
const RUN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn cli_runs_a_command_against_the_server() -> Result<()> {
    let binary = Path::new(env!("CARGO_BIN_EXE_network_interface"));

    let (mut server_child, mut server_stdout) = spawn_server(binary).await?;
    let addr = read_server_addr(&mut server_stdout).await?;

    // Drain additional server logs in the background so the pipe never fills.
    let server_log_task = tokio::spawn(async move {
        drain_stdout(server_stdout).await;
    });

    let response = run_command(binary, &[&addr], r#"{"ping":1,"note":"hello"}"#, &[]).await?;
    assert_eq!(response["data"]["ping"], 1);
    assert_eq!(response["data"]["note"], "hello");
    assert_eq!(response["target"]["port"].as_u64(), addr.rsplit(':').next().and_then(|port| port.parse().ok()));

    // An error reply with no tolerance left fails the process.
    let failed = run_process(binary, &[&addr], r#"{"ping":1,"fail":"not primary"}"#, &[]).await?;
    assert!(!failed.status.success());

    // A slow reply past the deadline fails too.
    let slow = run_process(binary, &[&addr], r#"{"ping":1,"sleepMs":2000}"#, &["--timeout-ms", "100"]).await?;
    assert!(!slow.status.success());

    let _ = server_child.kill().await;
    let _ = server_child.wait().await;
    let _ = server_log_task.await;

    Ok(())
}

async fn spawn_server(binary: &Path) -> Result<(Child, BufReader<ChildStdout>)> {
    let mut cmd = Command::new(binary);
    cmd.arg("serve")
        .arg("--listen")
        .arg("127.0.0.1:0")
        .env("RUST_LOG_STYLE", "never")
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    let mut child = cmd.spawn().context("failed to spawn server")?;
    let stdout = child
        .stdout
        .take()
        .context("server stdout missing after spawn")?;

    Ok((child, BufReader::new(stdout)))
}

async fn read_server_addr(reader: &mut BufReader<ChildStdout>) -> Result<String> {
    let line = read_line(reader)
        .await?
        .context("server did not emit listening address")?;
    let trimmed = line.trim();
    let addr = trimmed
        .split_whitespace()
        .last()
        .context("unexpected server banner format")?;
    if !addr.contains(':') {
        return Err(anyhow!("server banner missing socket: {trimmed}"));
    }
    Ok(addr.to_string())
}

async fn run_process(binary: &Path, hosts: &[&str], cmd: &str, extra: &[&str]) -> Result<std::process::Output> {
    let mut command = Command::new(binary);
    command.arg("run");
    for host in hosts {
        command.arg("--host").arg(host);
    }
    command
        .arg("--cmd")
        .arg(cmd)
        .args(extra)
        .env("RUST_LOG", "error")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::null())
        .stderr(Stdio::null());

    timeout(RUN_TIMEOUT, command.output())
        .await
        .context("run command did not finish")?
        .context("failed to run command")
}

async fn run_command(binary: &Path, hosts: &[&str], cmd: &str, extra: &[&str]) -> Result<Value> {
    let output = run_process(binary, hosts, cmd, extra).await?;
    if !output.status.success() {
        return Err(anyhow!("run exited with status {}", output.status));
    }
    let stdout = String::from_utf8(output.stdout).context("stdout is not utf-8")?;
    let last = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .context("run printed nothing")?;
    serde_json::from_str(last).with_context(|| format!("run printed non-JSON output: {last}"))
}

async fn read_line(reader: &mut BufReader<ChildStdout>) -> Result<Option<String>> {
    let mut line = String::new();
    let read_future = reader.read_line(&mut line);
    let bytes_io = match timeout(READ_TIMEOUT, read_future).await {
        Ok(result) => result,
        Err(_) => return Err(anyhow!("timed out waiting for line")),
    };
    let byte_count = bytes_io?;
    if byte_count == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

async fn drain_stdout(mut reader: BufReader<ChildStdout>) {
    let mut buffer = String::new();
    while reader
        .read_line(&mut buffer)
        .await
        .map(|bytes| {
            let has_data = bytes > 0;
            if has_data {
                buffer.clear();
            }
            has_data
        })
        .unwrap_or(false)
    {}
}
