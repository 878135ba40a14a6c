mod cli;

use std::process;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use cli::Cli;
use fast_core::{FastClient, FastClientConfig, FastError, RpcOptions};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "warn",
        1 => "fast_core=debug,warn",
        _ => "fast_core=trace,debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = match cli.parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("fastcall: {msg}");
            eprintln!("Try 'fastcall --help' for more details.");
            process::exit(2);
        }
    };

    let sock = match TcpStream::connect(&cli.address).await {
        Ok(sock) => sock,
        Err(e) => {
            eprintln!("fastcall: failed to connect to {}: {e}", cli.address);
            process::exit(1);
        }
    };

    let config = FastClientConfig {
        crc_mode: cli.crc_mode,
        ..FastClientConfig::default()
    };
    let client = FastClient::new(config, sock);

    let mut opts = RpcOptions::new(cli.method.clone(), args);
    if let Some(ms) = cli.timeout_ms {
        opts = opts.with_timeout(Duration::from_millis(ms));
    }

    let mut req = client.rpc(opts);
    let mut received = 0u64;
    let mut aborted_by_flag = false;
    let mut failure: Option<fast_core::FastRequestError> = None;

    while let Some(item) = req.next().await {
        match item {
            Ok(value) => {
                println!("{value}");
                received += 1;
                if Some(received) == cli.abort_after {
                    req.abort();
                    aborted_by_flag = true;
                }
            }
            Err(err) => failure = Some(err),
        }
    }

    if cli.snapshot {
        match serde_json::to_string_pretty(&client.snapshot()) {
            Ok(snap) => eprintln!("{snap}"),
            Err(e) => eprintln!("fastcall: failed to render snapshot: {e}"),
        }
    }

    if let Some(err) = failure {
        // An abort we asked for is a clean outcome, anything else is not.
        if aborted_by_flag && matches!(err.cause(), FastError::Aborted(_)) {
            eprintln!("fastcall: aborted after {received} values");
        } else {
            eprintln!("fastcall: {err}");
            process::exit(1);
        }
    }
}
