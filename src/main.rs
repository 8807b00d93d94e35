use std::sync::Arc;

use bytes::Bytes;
use clap::{Parser, Subcommand};
use cqrpc::{
    config::Config, logging, Client, HandlerFault, HandlerRegistry, Http2Transport, Server,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "cqrpc", about = "Unary RPC over a completion queue", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the echo and reverse methods until interrupted or the duration elapses.
    Serve {
        /// Overrides CQRPC_BIND_ADDR.
        #[arg(long)]
        bind: Option<String>,
        /// Seconds to serve for; 0 serves until interrupted. Overrides CQRPC_DURATION_SECS.
        #[arg(long)]
        duration: Option<u64>,
    },
    /// Issue one unary call and print the response payload.
    Call {
        target: String,
        method: String,
        payload: String,
        /// Request metadata as key=value, repeatable.
        #[arg(short = 'm', long = "metadata", value_parser = parse_pair)]
        metadata: Vec<(String, String)>,
        /// Call timeout in seconds. Overrides CQRPC_CALL_TIMEOUT_SECS.
        #[arg(long)]
        timeout: Option<u64>,
    },
}

fn parse_pair(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got {value:?}"))
}

fn demo_handlers() -> HandlerRegistry {
    HandlerRegistry::new()
        .with("/cqrpc.Demo/Echo", |request: Bytes| -> Result<Bytes, HandlerFault> {
            Ok(request)
        })
        .with("/cqrpc.Demo/Reverse", |request: Bytes| -> Result<Bytes, HandlerFault> {
            Ok(request.iter().rev().copied().collect::<Vec<u8>>().into())
        })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let transport = Http2Transport::new()?;

    match cli.command {
        Command::Serve { bind, duration } => {
            let mut server_config = config.server_config();
            if let Some(bind) = bind {
                server_config.bind_address = bind;
            }
            if let Some(duration) = duration {
                server_config = server_config.with_duration_secs(duration);
            }

            let server = Server::new(Arc::new(transport.clone()), demo_handlers())
                .with_config(server_config);
            let signal = server.shutdown_signal();
            transport.handle().spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    signal.trigger();
                }
            });

            let summary = server.serve()?;
            info!(
                reason = summary.stop_reason.as_str(),
                completed = summary.calls_completed,
                failed = summary.calls_failed,
                "server stopped"
            );
        }
        Command::Call {
            target,
            method,
            payload,
            metadata,
            timeout,
        } => {
            let flat: Vec<Bytes> = metadata
                .into_iter()
                .flat_map(|(key, value)| [Bytes::from(key), Bytes::from(value)])
                .collect();
            let client = Client::with_config(Arc::new(transport), config.client_config());
            let response = client.execute(
                &target,
                &method,
                Bytes::from(payload),
                &flat,
                timeout.map(std::time::Duration::from_secs),
            )?;
            if let Some(message) = response.message {
                println!("{}", String::from_utf8_lossy(&message));
            }
        }
    }
    Ok(())
}
