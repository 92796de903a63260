use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

use crate::command::HostAndPort;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a command server that echoes every command it receives.
    Serve(ServeArgs),
    /// Send one command to any of the given hosts and print the response.
    Run(RunArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the server should bind to. Use 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:27100")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Candidate host, as host:port. Repeat for "any of N".
    #[arg(long = "host", required = true)]
    pub hosts: Vec<HostAndPort>,

    /// Database the command runs against.
    #[arg(long, default_value = "admin")]
    pub db: String,

    /// Command document as JSON.
    #[arg(long, default_value = r#"{"ping":1}"#)]
    pub cmd: String,

    /// Command deadline in milliseconds. Omit for no deadline.
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Host failures to absorb before the command fails.
    #[arg(long, default_value_t = 0)]
    pub max_failures: usize,

    /// Concurrent connections allowed per host.
    #[arg(long, default_value_t = 10)]
    pub max_connections: usize,

    #[arg(long, default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// Names the reactor thread and prefixes diagnostics.
    #[arg(long, default_value = "NetworkInterface")]
    pub instance_name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_repeated_hosts() {
        let cli = Cli::try_parse_from([
            "network_interface",
            "run",
            "--host",
            "127.0.0.1:1",
            "--host",
            "127.0.0.1:2",
            "--max-failures",
            "1",
            "--timeout-ms",
            "250",
        ])
        .expect("parse");

        let Command::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert_eq!(args.hosts.len(), 2);
        assert_eq!(args.hosts[1].port(), 2);
        assert_eq!(args.max_failures, 1);
        assert_eq!(args.timeout_ms, Some(250));
        assert_eq!(args.db, "admin");
    }

    #[test]
    fn run_requires_a_host() {
        assert!(Cli::try_parse_from(["network_interface", "run"]).is_err());
    }
}
