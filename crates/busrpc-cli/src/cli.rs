//! Clap CLI definitions for busrpc.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  busrpc relay                          Run a relay on the configured address
  busrpc nodes                          List the processes on the bus
  busrpc call worker-1 sum 20 30        Call `sum` on process worker-1
  busrpc send worker-1 reload '{}'      Send the `reload` message to worker-1";

/// busrpc: RPC and events between processes over a pub/sub broker.
#[derive(Parser)]
#[command(name = "busrpc", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a relay server until Ctrl+C.
    Relay {
        /// Address to listen on (overrides `relay.listen_addr`).
        #[arg(long)]
        listen: Option<String>,
    },
    /// Join the bus and list the processes that answer.
    Nodes {
        /// How long to wait for announcements, in milliseconds.
        #[arg(long, default_value_t = 500)]
        wait_ms: u64,
    },
    /// Call a method on a process and print the result.
    Call {
        /// Target process id.
        pid: String,
        /// Method name.
        method: String,
        /// Arguments, each parsed as JSON (bare words become strings).
        args: Vec<String>,
        /// How long to wait for the target to be discovered, in milliseconds.
        #[arg(long, default_value_t = 2000)]
        wait_ms: u64,
    },
    /// Send a message to a process.
    Send {
        /// Target process id.
        pid: String,
        /// Event name.
        event: String,
        /// Message data as JSON (a bare word becomes a string).
        #[arg(default_value = "null")]
        data: String,
        /// How long to wait for the target to be discovered, in milliseconds.
        #[arg(long, default_value_t = 2000)]
        wait_ms: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_call() {
        let cli = Cli::parse_from(["busrpc", "call", "p2", "sum", "20", "30"]);
        match cli.command {
            Commands::Call {
                pid,
                method,
                args,
                wait_ms,
            } => {
                assert_eq!(pid, "p2");
                assert_eq!(method, "sum");
                assert_eq!(args, vec!["20", "30"]);
                assert_eq!(wait_ms, 2000);
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn test_global_config_flag() {
        let cli = Cli::parse_from(["busrpc", "nodes", "--config", "/tmp/busrpc.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/busrpc.toml")));
        assert!(matches!(cli.command, Commands::Nodes { wait_ms: 500 }));
    }
}
