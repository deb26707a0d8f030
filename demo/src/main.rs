//! linerpc demo peer
//!
//! Speaks JSON-RPC 2.0 over stdin/stdout. Diagnostics go to stderr, so stdout
//! carries protocol lines only.
//!
//! Try it by hand:
//!
//! ```text
//! $ cargo run -p linerpc-demo
//! {"jsonrpc":"2.0","id":1,"method":"ping"}
//! {"jsonrpc":"2.0","id":1,"result":{}}
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use linerpc::{
    JsonRpcRequest, LogLevel, LoggingConfig, MessageHandler, Router, RouterConfig, RpcError,
    RpcResult, WeakRouter, notification_handler,
};
use serde_json::{Value, json};
use tracing::{info, warn};

/// Demo peer command line
#[derive(Parser, Debug)]
#[command(
    name = "linerpc-demo",
    version,
    about = "Bidirectional JSON-RPC 2.0 peer over stdin/stdout"
)]
struct Cli {
    /// Router configuration file (.toml, .yaml, .yml or .json)
    #[arg(long, short = 'c', env = "LINERPC_CONFIG")]
    config: Option<PathBuf>,

    /// Minimum level of logging notifications sent to the other peer
    #[arg(long)]
    log_level: Option<LogLevel>,

    /// Timeout for requests sent to the other peer, in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Write diagnostics to stderr as JSON lines
    #[arg(long)]
    structured_logs: bool,
}

impl Cli {
    fn router_config(&self) -> anyhow::Result<RouterConfig> {
        let mut config = match &self.config {
            Some(path) => RouterConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => RouterConfig::from_env().context("invalid LINERPC__ environment")?,
        };
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(ms) = self.timeout_ms {
            config.request_timeout_ms = ms;
        }
        Ok(config)
    }
}

/// Serves `ping`, `echo` and `relay`.
struct DemoHandler {
    router: WeakRouter,
}

#[async_trait]
impl MessageHandler for DemoHandler {
    async fn handle(&self, request: JsonRpcRequest) -> RpcResult<Value> {
        match request.method.as_str() {
            "ping" => Ok(json!({})),
            "echo" => Ok(request.params.unwrap_or(Value::Null)),
            "relay" => {
                let router = self.router.upgrade().ok_or_else(RpcError::stopped)?;
                router.log(LogLevel::Debug, "relaying to peer", request.params.clone())?;
                router.send_request("relay/echo", request.params).await
            }
            other => Err(RpcError::method_not_found(other)),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let runtime = tokio::runtime::Runtime::new().context("failed to build runtime")?;
    let result = runtime.block_on(run(cli));
    // A pending stdin read parks a blocking thread until the next byte arrives.
    runtime.shutdown_timeout(Duration::from_millis(250));
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let logging = LoggingConfig {
        structured: cli.structured_logs,
        ..LoggingConfig::default()
    };
    let _guard = logging.init().context("failed to initialize logging")?;

    let config = cli.router_config()?;
    info!(
        timeout = ?config.request_timeout(),
        log_level = %config.log_level,
        "Starting linerpc demo peer"
    );

    let router = Router::stdio(config);
    router.set_message_handler(DemoHandler {
        router: router.downgrade(),
    });
    router.on_notification(
        "notifications/cancelled",
        notification_handler(|notification| {
            warn!(params = ?notification.params, "Peer cancelled a request");
            Ok(())
        }),
    );

    router.start().await?;
    router.log(LogLevel::Info, "linerpc demo ready", None)?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("failed to listen for Ctrl-C")?;
            info!("Interrupted");
        }
        () = router.stopped() => info!("Inbound stream closed"),
    }

    // Bounded by the flush timeout when stdout is not being read
    router.stop().await;
    Ok(())
}
