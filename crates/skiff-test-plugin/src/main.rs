//! Test-helper plugin binary.
//!
//! Driven by a single positional subcommand; anything unknown exits with
//! code 2. Misbehaving modes exist on purpose so the host-side tests can
//! exercise handshake failures.

use std::io::Write;
use std::time::Duration;

use skiff::{serve, Protocol, ServeConfig};
use skiff_test_plugin::{counter_plugins, test_handshake};

#[tokio::main]
async fn main() {
    // Plugin logs go to stderr, where the host's pipeline picks them up.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mode = std::env::args().nth(1).unwrap_or_default();
    match mode.as_str() {
        "counter-rpc" => run_serve(Protocol::RequestResponse).await,
        "counter-grpc" => run_serve(Protocol::Streaming).await,
        "stderr-noise" => {
            emit_stderr_noise();
            run_serve(Protocol::RequestResponse).await;
        }
        "noisy-stdout-rpc" => {
            // Writes to stdout *after* serving starts, exercising the
            // stdout redirection into the RPC stdio stream.
            tokio::spawn(stdout_chatter());
            run_serve(Protocol::RequestResponse).await;
        }
        "noisy-stdout-grpc" => {
            tokio::spawn(stdout_chatter());
            run_serve(Protocol::Streaming).await;
        }
        "bad-handshake" => {
            print_line("definitely not a handshake");
            linger().await;
        }
        "wrong-core-version" => {
            print_line("99|1|tcp|127.0.0.1:1|request_response|");
            linger().await;
        }
        "wrong-user-version" => {
            print_line("1|11|tcp|127.0.0.1:1|request_response|");
            linger().await;
        }
        other => {
            eprintln!("unknown test plugin command: {other:?}");
            std::process::exit(2);
        }
    }
}

async fn run_serve(protocol: Protocol) {
    let config = ServeConfig::new(test_handshake(), counter_plugins()).protocol(protocol);
    if let Err(e) = serve(config).await {
        eprintln!("plugin failed: {e}");
        std::process::exit(1);
    }
}

/// Raw lines, a structured log record, and an oversized line for the
/// host's stderr pipeline tests. Emitted before serving so they land on
/// the real stderr pipe.
fn emit_stderr_noise() {
    let mut stderr = std::io::stderr().lock();
    writeln!(stderr, "plain noise line").unwrap();
    writeln!(
        stderr,
        "{{\"@level\":\"info\",\"@message\":\"structured noise\",\"key\":\"value\"}}"
    )
    .unwrap();
    writeln!(stderr, "{}", "x".repeat(200)).unwrap();
    stderr.flush().unwrap();
}

/// Periodic stdout output, flushed each line since the redirected stdout
/// is a pipe and would otherwise block-buffer. The initial delay keeps the
/// chatter safely after the handshake line.
async fn stdout_chatter() {
    tokio::time::sleep(Duration::from_millis(500)).await;
    loop {
        print_line("streamed stdout line");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn print_line(line: &str) {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{line}").unwrap();
    stdout.flush().unwrap();
}

/// Keep the process alive long enough for the host to finish judging the
/// handshake.
async fn linger() {
    tokio::time::sleep(Duration::from_secs(10)).await;
}
