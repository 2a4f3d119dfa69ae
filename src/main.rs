//! pipehub CLI - run a broker or talk to one.
//!
//! This is the main binary entry point. See the `pipehub` library for the
//! broker itself; the subcommands here are a demo host (`serve`) and two
//! client harnesses (`send`, `bench`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

use pipehub::envelope::Envelope;
use pipehub::{BrokerConfig, Message, PipeBroker, PipeClient};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
/// mimalloc provides better multi-threaded performance than the system allocator.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

// CLI
#[derive(Parser)]
#[command(name = "pipehub")]
#[command(version)]
#[command(about = "Local inter-process message broker over Unix domain sockets")]
struct Cli {
    /// Broker socket path (defaults to a per-user path under /tmp).
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a broker and answer client envelopes until ctrl-c
    Serve,
    /// Connect, send one message, and print the reply
    Send {
        /// Client identifier to bind as
        #[arg(long, default_value = "pipehub-cli")]
        id: String,
        /// Request action name
        #[arg(long, default_value = "ping")]
        action: String,
        /// Request params, as a JSON document
        #[arg(long, default_value = "{}")]
        params: String,
        /// Send this raw text instead of a request envelope
        #[arg(long)]
        raw: Option<String>,
        /// Do not wait for a reply frame
        #[arg(long)]
        no_wait: bool,
    },
    /// Flood the broker with messages and report throughput
    Bench {
        /// Client identifier to bind as
        #[arg(long, default_value = "pipehub-bench")]
        id: String,
        /// Number of messages to send
        #[arg(long, default_value_t = 10_000)]
        count: u32,
        /// Payload size in bytes
        #[arg(long, default_value_t = 256)]
        size: usize,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();
    let socket = cli.socket.unwrap_or_else(pipehub::default_socket_path);

    match cli.command {
        Commands::Serve => run_serve(BrokerConfig::at_path(socket)),
        Commands::Send {
            id,
            action,
            params,
            raw,
            no_wait,
        } => run_send(&socket, &id, &action, &params, raw.as_deref(), no_wait),
        Commands::Bench { id, count, size } => run_bench(&socket, &id, count, size),
    }
}

// ─── serve ─────────────────────────────────────────────────────────────────

/// Run a broker and a reply loop over its inbox until ctrl-c.
///
/// The demo host answers the envelope vocabulary: `Hello` gets a `Welcome`,
/// `Request` gets a `Response` echoing the params, `Goodbye` disconnects the
/// client. Anything that is not an envelope is logged and dropped.
fn run_serve(config: BrokerConfig) -> Result<()> {
    let broker = Arc::new(PipeBroker::new(config));
    broker.start()?;
    println!("pipehub broker listening on {}", broker.socket_path().display());

    let broker_for_signal = Arc::clone(&broker);
    ctrlc::set_handler(move || {
        log::info!("[serve] ctrl-c, stopping broker");
        broker_for_signal.stop();
    })
    .context("install ctrl-c handler")?;

    // The reply loop doubles as the shutdown wait: wait_and_pop_received
    // returns None once stop() has run and the inbox is drained.
    while let Some(msg) = broker.wait_and_pop_received() {
        handle_message(&broker, &msg);
    }

    println!("pipehub broker stopped");
    Ok(())
}

/// Answer one received message.
fn handle_message(broker: &PipeBroker, msg: &Message) {
    let envelope = match Envelope::decode(&msg.payload) {
        Ok(envelope) => envelope,
        Err(_) => {
            log::info!(
                "[serve] '{}' sent {} non-envelope bytes",
                msg.client_id,
                msg.payload.len()
            );
            return;
        }
    };

    match envelope {
        Envelope::Hello { payload, .. } => {
            log::info!(
                "[serve] '{}' hello: {} v{} (pid {})",
                msg.client_id,
                payload.app_name,
                payload.app_version,
                payload.pid
            );
            broker.send_to_client(&msg.client_id, &Envelope::welcome(&msg.client_id).encode());
        }
        Envelope::Heartbeat { payload, .. } => {
            log::debug!("[serve] '{}' heartbeat seq={}", msg.client_id, payload.seq);
        }
        Envelope::Request { msg_id, payload, .. } => {
            log::info!("[serve] '{}' request '{}'", msg.client_id, payload.action);
            let reply = Envelope::response_to(
                &msg_id,
                &msg.client_id,
                serde_json::json!({
                    "status": "ok",
                    "action": payload.action,
                    "echo": payload.params,
                }),
            );
            broker.send_to_client(&msg.client_id, &reply.encode());
        }
        Envelope::Goodbye { payload, .. } => {
            log::info!("[serve] '{}' goodbye: {}", msg.client_id, payload.reason);
            broker.disconnect_client(&msg.client_id);
        }
        Envelope::Error { error, .. } => {
            log::warn!(
                "[serve] '{}' reported error {}: {}",
                msg.client_id,
                error.code,
                error.message
            );
        }
        // Server-originated types bounced back at us; nothing to answer.
        other => {
            log::warn!("[serve] '{}' sent unexpected {:?}", msg.client_id, other);
        }
    }
}

// ─── send ──────────────────────────────────────────────────────────────────

/// Connect, bind, send one payload, and optionally print the reply.
fn run_send(
    socket: &Path,
    id: &str,
    action: &str,
    params: &str,
    raw: Option<&str>,
    no_wait: bool,
) -> Result<()> {
    let mut client = PipeClient::connect(socket, id)?;

    if let Some(text) = raw {
        client.send(text.as_bytes())?;
    } else {
        let params: serde_json::Value =
            serde_json::from_str(params).context("--params must be valid JSON")?;
        client.send(&Envelope::request(id, action, params).encode())?;
    }

    if !no_wait {
        let reply = client.recv().context("wait for reply")?;
        match std::str::from_utf8(&reply) {
            Ok(text) => println!("{text}"),
            Err(_) => println!("({} binary bytes)", reply.len()),
        }
    }
    Ok(())
}

// ─── bench ─────────────────────────────────────────────────────────────────

/// Send `count` fixed-size payloads as fast as the socket accepts them.
///
/// Measures the submit side only; the broker's inbox absorbs the burst.
fn run_bench(socket: &Path, id: &str, count: u32, size: usize) -> Result<()> {
    let mut client = PipeClient::connect(socket, id)?;
    let payload = vec![b'x'; size];

    let started = Instant::now();
    for _ in 0..count {
        client.send(&payload)?;
    }
    let elapsed = started.elapsed();

    let secs = elapsed.as_secs_f64();
    let mib = (count as f64 * size as f64) / (1024.0 * 1024.0);
    println!(
        "sent {count} x {size} B in {:.3}s ({:.0} msg/s, {:.1} MiB/s)",
        secs,
        count as f64 / secs,
        mib / secs
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_handle_message_tolerates_non_envelope_payloads() {
        let broker = PipeBroker::new(BrokerConfig::at_path("/tmp/pipehub-cli-test.sock"));
        let msg = Message {
            client_id: "CLI-001".to_string(),
            payload: b"\xff\xfe not json".to_vec(),
            timestamp_ms: 1,
        };
        // Must log and return, never panic or reply.
        handle_message(&broker, &msg);
    }

    #[test]
    fn test_handle_message_goodbye_for_unknown_client_is_harmless() {
        let broker = PipeBroker::new(BrokerConfig::at_path("/tmp/pipehub-cli-test.sock"));
        let msg = Message {
            client_id: "ghost".to_string(),
            payload: Envelope::goodbye("ghost", "UserExit").encode(),
            timestamp_ms: 1,
        };
        handle_message(&broker, &msg);
    }
}
