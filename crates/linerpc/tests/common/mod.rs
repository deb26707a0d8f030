//! Shared harness: a router wired to an in-memory peer, plus capture of the
//! router's own diagnostics.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use linerpc::{Router, RouterConfig};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::prelude::*;

/// How long to wait for an expected line.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// The far end of the router's stream.
pub struct Peer {
    pub router: Router,
    to_router: Option<DuplexStream>,
    from_router: Lines<BufReader<DuplexStream>>,
}

impl Peer {
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    pub fn with_config(config: RouterConfig) -> Self {
        let (router_in, to_router) = tokio::io::duplex(64 * 1024);
        let (router_out, from_router) = tokio::io::duplex(64 * 1024);
        Self {
            router: Router::new(router_in, router_out, config),
            to_router: Some(to_router),
            from_router: BufReader::new(from_router).lines(),
        }
    }

    /// Router already started.
    pub async fn started() -> Self {
        let peer = Self::new();
        peer.router.start().await.expect("router should start");
        peer
    }

    pub async fn send_line(&mut self, line: &str) {
        let stream = self.to_router.as_mut().expect("input still open");
        stream.write_all(line.as_bytes()).await.expect("write");
        stream.write_all(b"\n").await.expect("write");
    }

    /// Write raw bytes followed by a newline.
    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        let stream = self.to_router.as_mut().expect("input still open");
        stream.write_all(bytes).await.expect("write");
        stream.write_all(b"\n").await.expect("write");
    }

    pub async fn send_json(&mut self, value: Value) {
        self.send_line(&value.to_string()).await;
    }

    /// Next line the router wrote, parsed.
    pub async fn recv(&mut self) -> Value {
        let line = tokio::time::timeout(RECV_TIMEOUT, self.from_router.next_line())
            .await
            .expect("timed out waiting for router output")
            .expect("read")
            .expect("router output closed");
        serde_json::from_str(&line).expect("router wrote invalid JSON")
    }

    /// Assert the router writes nothing for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(line) = tokio::time::timeout(window, self.from_router.next_line()).await {
            panic!("expected no output, got {line:?}");
        }
    }

    /// End the router's inbound stream.
    pub fn close_input(&mut self) {
        self.to_router = None;
    }
}

/// Diagnostics emitted by the router, as `(level, message)`.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

impl CapturedLogs {
    /// Capture events on this thread until the guard drops.
    ///
    /// Use with the default current-thread test runtime so spawned router
    /// tasks run on the capturing thread.
    pub fn install() -> (Self, DefaultGuard) {
        let logs = Self::default();
        let subscriber = tracing_subscriber::registry().with(logs.clone());
        let guard = tracing::subscriber::set_default(subscriber);
        (logs, guard)
    }

    pub fn at(&self, level: Level) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl<S: Subscriber> Layer<S> for CapturedLogs {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !event.metadata().target().starts_with("linerpc") {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.events
            .lock()
            .push((*event.metadata().level(), visitor.message));
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        }
    }
}

/// Let spawned router tasks run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
