//! Demo Fast server used for manual poking and for the fastcall
//! integration tests.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use fast_core::{FastServer, FastServerConfig, RegistrationError, RpcContext, RpcError};

#[derive(Parser, Debug)]
#[command(name = "fastserve", about = "Demo Fast server with a handful of RPC methods")]
struct Cli {
    /// Port to listen on (0 for ephemeral)
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    port: u16,

    /// Suppress request logging
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if !cli.quiet {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("fast_core=debug,info")),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    let addr: std::net::SocketAddr = format!("127.0.0.1:{}", cli.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    println!("Listening on {}", listener.local_addr()?);

    let server = FastServer::new(FastServerConfig::default());
    register_demo_methods(&server)?;

    // Ctrl-c drains in-flight requests and then lets serve() return.
    let closer = server.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        closer.close().await;
    });

    server.serve(listener).await?;
    Ok(())
}

fn register_demo_methods(server: &FastServer) -> Result<(), RegistrationError> {
    server.register_rpc_method("date", date)?;
    server.register_rpc_method("echo", echo)?;
    server.register_rpc_method("yes", yes)?;
    server.register_rpc_method("fail", fail)?;
    server.register_rpc_method("sleep", sleep)?;
    Ok(())
}

/// Returns the server's current time in milliseconds since the epoch.
async fn date(mut rpc: RpcContext) {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    rpc.end(Some(json!({"timestamp": now.as_millis() as u64})))
        .await;
}

/// Emits each argument back to the caller, one value per argument.
async fn echo(mut rpc: RpcContext) {
    for arg in rpc.argv().to_vec() {
        rpc.write(arg).await;
    }
    rpc.end(None).await;
}

/// Emits `value` `count` times. Argument: `{"value": <any>, "count": N}`.
async fn yes(mut rpc: RpcContext) {
    let Some(opts) = rpc.argv().first().cloned() else {
        rpc.fail(RpcError::new("yes: expected an argument with value and count"))
            .await;
        return;
    };
    let count = opts.get("count").and_then(Value::as_u64).unwrap_or(1);
    let value = opts.get("value").cloned().unwrap_or(Value::Null);
    for _ in 0..count {
        rpc.write(value.clone()).await;
    }
    rpc.end(None).await;
}

/// Fails with a caller-chosen error. Argument:
/// `{"name": ..., "message": ..., "info": ...}`, all optional.
async fn fail(mut rpc: RpcContext) {
    let opts = rpc.argv().first().cloned().unwrap_or_else(|| json!({}));
    let name = opts
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("DemoError")
        .to_string();
    let message = opts
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("demo failure")
        .to_string();
    let mut err = RpcError::named(name, message);
    if let Some(info) = opts.get("info") {
        err = err.with_info(info.clone());
    }
    rpc.fail(err).await;
}

/// Sleeps before ending. Argument: `{"ms": N}` (default 1000).
async fn sleep(mut rpc: RpcContext) {
    let ms = rpc
        .argv()
        .first()
        .and_then(|v| v.get("ms"))
        .and_then(Value::as_u64)
        .unwrap_or(1000);
    tokio::time::sleep(Duration::from_millis(ms)).await;
    rpc.end(Some(json!({"slept_ms": ms}))).await;
}
