//! The bidirectional router.
//!
//! A [`Router`] owns both halves of one line-delimited duplex stream. While
//! running, a reader task classifies every inbound line and routes it:
//!
//! ```text
//! inbound line ──► classify ─┬─► Response      ──► pending table (resolve waiter)
//!                            ├─► Request       ──► message handler (own task) ──► response
//!                            ├─► Notification  ──► notification handlers, in order
//!                            └─► Rejection     ──► error response if an id is known, else log
//! ```
//!
//! Everything written (responses, outgoing requests, notifications, log and
//! progress messages) goes through one FIFO queue drained by a writer task.
//! Responses can therefore leave in a different order than their requests
//! arrived; peers match on `id`, not position.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use linerpc_core::error::NO_HANDLER_MESSAGE;
use linerpc_core::{
    InboundMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, LogLevel,
    ProgressToken, Rejection, RequestId, RpcError, RpcResult, classify, recover_id,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::RouterConfig;
use crate::correlator::Correlator;
use crate::handler::{MessageHandler, NotificationHandler};
use crate::notifications::{NotificationTable, panic_message};
use crate::peer_log::{LOGGING_METHOD, PROGRESS_METHOD, PeerLog, progress_params};
use crate::transport::{
    InboundLine, LineReader, LineSink, Outbound, line_reader, line_sink, pump_outbound,
};

/// Lifecycle state of a [`Router`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouterState {
    /// Not consuming the inbound stream; writes are dropped
    #[default]
    Stopped,
    /// Consuming the inbound stream
    Running,
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped => f.write_str("stopped"),
            Self::Running => f.write_str("running"),
        }
    }
}

/// Handle to a bidirectional JSON-RPC router.
///
/// Cloning is cheap; all clones drive the same router. Construct one per
/// session and pass it to whoever needs to call the peer.
///
/// ```rust,no_run
/// use linerpc::{Router, RouterConfig, handler_fn};
/// use serde_json::json;
///
/// # async fn run() -> linerpc::RpcResult<()> {
/// let router = Router::stdio(RouterConfig::default());
/// router.set_message_handler(handler_fn(|request| async move {
///     Ok(json!({ "echo": request.params }))
/// }));
/// router.start().await?;
///
/// let roots = router.send_request("roots/list", None).await?;
/// # let _ = roots;
/// router.stop().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Router {
    inner: Arc<Inner>,
}

/// Non-owning handle to a [`Router`].
///
/// A message handler that calls back into its own router should hold one of
/// these; holding a [`Router`] would keep the router alive through its own
/// handler slot.
#[derive(Clone, Debug)]
pub struct WeakRouter {
    inner: Weak<Inner>,
}

impl WeakRouter {
    /// The router, unless every [`Router`] handle has been dropped.
    pub fn upgrade(&self) -> Option<Router> {
        self.inner.upgrade().map(|inner| Router { inner })
    }
}

struct Inner {
    config: RouterConfig,
    lifecycle: Mutex<Lifecycle>,
    state_changes: watch::Sender<RouterState>,
    io: tokio::sync::Mutex<Io>,
    correlator: Correlator,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
    notifications: NotificationTable,
    peer_log: PeerLog,
}

/// State checked on every write; never held across an await.
#[derive(Default)]
struct Lifecycle {
    state: RouterState,
    outbound: Option<Outbound>,
    shutdown: Option<CancellationToken>,
    /// The inbound stream ended; no response can arrive any more
    inbound_closed: bool,
}

/// Stream halves, parked here while stopped and lent to tasks while running.
struct Io {
    reader: Option<LineReader>,
    writer: Option<LineSink>,
    reader_task: Option<JoinHandle<Option<LineReader>>>,
    writer_task: Option<JoinHandle<LineSink>>,
    abandon_writer: Option<CancellationToken>,
}

impl Io {
    /// Wait for finishing tasks and take their stream halves back.
    ///
    /// A task handle is only cleared once the task has completed, so a
    /// cancelled call leaves everything for the next one. The writer gets
    /// `flush_timeout` to drain its queue before the rest is dropped.
    async fn reclaim(&mut self, flush_timeout: Duration) {
        if let Some(task) = self.reader_task.as_mut() {
            let outcome = task.await;
            self.reader_task = None;
            match outcome {
                Ok(reader) => self.reader = reader,
                Err(e) => error!(error = %e, "Reader task failed"),
            }
        }

        if let Some(task) = self.writer_task.as_mut() {
            let outcome = match tokio::time::timeout(flush_timeout, &mut *task).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(?flush_timeout, "Peer is not reading; dropping queued lines");
                    if let Some(abandon) = &self.abandon_writer {
                        abandon.cancel();
                    }
                    task.await
                }
            };
            self.writer_task = None;
            self.abandon_writer = None;
            match outcome {
                Ok(sink) => self.writer = Some(sink),
                Err(e) => error!(error = %e, "Writer task failed"),
            }
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("state", &self.state())
            .field("pending_requests", &self.pending_requests())
            .field("notifications", &self.inner.notifications)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a stopped router over the given stream halves.
    pub fn new<R, W>(reader: R, writer: W, config: RouterConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let io = Io {
            reader: Some(line_reader(Box::new(reader), config.max_message_size)),
            writer: Some(line_sink(Box::new(writer))),
            reader_task: None,
            writer_task: None,
            abandon_writer: None,
        };

        Self {
            inner: Arc::new(Inner {
                correlator: Correlator::new(config.max_pending_requests),
                peer_log: PeerLog::new(config.logger_name.clone(), config.log_level),
                config,
                lifecycle: Mutex::new(Lifecycle::default()),
                state_changes: watch::Sender::new(RouterState::Stopped),
                io: tokio::sync::Mutex::new(io),
                handler: RwLock::new(None),
                notifications: NotificationTable::default(),
            }),
        }
    }

    /// Create a stopped router over this process's stdin and stdout.
    pub fn stdio(config: RouterConfig) -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout(), config)
    }

    /// Handle that does not keep the router alive.
    pub fn downgrade(&self) -> WeakRouter {
        WeakRouter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Configuration the router was built with.
    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RouterState {
        self.inner.lifecycle.lock().state
    }

    /// Whether the router is running.
    pub fn is_active(&self) -> bool {
        self.state() == RouterState::Running
    }

    /// Begin consuming the inbound stream. No-op when already running.
    ///
    /// # Errors
    ///
    /// Returns a transport error when the inbound stream already reached its
    /// end in an earlier run.
    pub async fn start(&self) -> RpcResult<()> {
        let mut io = self.inner.io.lock().await;
        if self.is_active() {
            return Ok(());
        }
        io.reclaim(self.inner.config.flush_timeout()).await;

        let Some(reader) = io.reader.take() else {
            return Err(RpcError::transport("Inbound stream is closed"));
        };
        let Some(writer) = io.writer.take() else {
            io.reader = Some(reader);
            return Err(RpcError::transport("Outbound stream is unavailable"));
        };

        let (outbound, queue) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            lifecycle.state = RouterState::Running;
            lifecycle.outbound = Some(outbound);
            lifecycle.shutdown = Some(shutdown.clone());
            lifecycle.inbound_closed = false;
        }
        self.inner.state_changes.send_replace(RouterState::Running);

        let abandon = CancellationToken::new();
        io.abandon_writer = Some(abandon.clone());
        io.writer_task = Some(tokio::spawn(pump_outbound(writer, queue, abandon)));
        io.reader_task = Some(tokio::spawn(
            Arc::clone(&self.inner).read_loop(reader, shutdown),
        ));
        info!("Router started");
        Ok(())
    }

    /// Stop consuming the inbound stream.
    ///
    /// Every pending outgoing request is rejected with the "Router stopped"
    /// error. Lines queued before the stop are flushed, waiting at most the
    /// configured flush timeout for the peer to read them. Notification
    /// handlers and the message handler stay registered. Calling this on a
    /// stopped router only waits for that flush to finish.
    ///
    /// Cancel safe: if the future is dropped the router is still stopped,
    /// and the next `start` or `stop` picks the stream halves back up.
    pub async fn stop(&self) {
        let mut io = self.inner.io.lock().await;
        self.inner.halt("stop requested");
        io.reclaim(self.inner.config.flush_timeout()).await;
    }

    /// Resolve once the router is stopped, whether by [`stop`](Self::stop)
    /// or because the inbound stream ended.
    pub async fn stopped(&self) {
        let mut changes = self.inner.state_changes.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = changes.wait_for(|state| *state == RouterState::Stopped).await;
    }

    /// Install the request handler, replacing any previous one.
    pub fn set_message_handler(&self, handler: impl MessageHandler) {
        *self.inner.handler.write() = Some(Arc::new(handler));
        debug!("Message handler registered");
    }

    /// Add a handler for notifications named `method`.
    pub fn on_notification(&self, method: &str, handler: NotificationHandler) {
        self.inner.notifications.add(method, handler);
        debug!(method, "Notification handler registered");
    }

    /// Remove a handler previously added for `method`.
    ///
    /// Returns `false` when that exact handler was not registered.
    pub fn off_notification(&self, method: &str, handler: &NotificationHandler) -> bool {
        self.inner.notifications.remove(method, handler)
    }

    /// Call `method` on the peer with the configured default timeout.
    ///
    /// # Errors
    ///
    /// See [`send_request_with_timeout`](Self::send_request_with_timeout).
    pub async fn send_request(&self, method: &str, params: Option<Value>) -> RpcResult<Value> {
        self.send_request_with_timeout(method, params, self.inner.config.request_timeout())
            .await
    }

    /// Call `method` on the peer and wait for its response.
    ///
    /// # Errors
    ///
    /// - the peer's error, when the response carries one
    /// - a timeout error naming `method` and `timeout` when no response
    ///   arrives in time
    /// - the "Router stopped" error when the router is stopped, or stops
    ///   while waiting
    /// - an overloaded error when too many requests are already pending
    #[instrument(skip(self, params), fields(method = %method))]
    pub async fn send_request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> RpcResult<Value> {
        let (id, receiver) = {
            let lifecycle = self.inner.lifecycle.lock();
            let Some(outbound) = lifecycle.outbound.as_ref() else {
                return Err(RpcError::stopped());
            };
            if lifecycle.inbound_closed {
                return Err(RpcError::stopped());
            }

            let (id, receiver) = self.inner.correlator.register(method)?;
            let request = JsonRpcRequest::new(method, params, id.clone());
            let sent = serde_json::to_string(&request)
                .map_err(RpcError::from)
                .and_then(|line| outbound.send(line).map_err(|_| RpcError::stopped()));
            if let Err(e) = sent {
                self.inner.correlator.forget(&id);
                return Err(e);
            }
            (id, receiver)
        };

        trace!(%id, "Sent request");
        self.inner
            .correlator
            .wait(id, method, receiver, timeout)
            .await
    }

    /// Answer a request by id.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the result cannot be encoded.
    pub fn send_response(
        &self,
        id: RequestId,
        outcome: Result<Value, JsonRpcError>,
    ) -> RpcResult<()> {
        self.inner
            .write_message(&JsonRpcResponse::from_outcome(id, outcome))
    }

    /// Send a one-way notification.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the params cannot be encoded.
    pub fn send_notification(&self, method: &str, params: Option<Value>) -> RpcResult<()> {
        self.inner
            .write_message(&JsonRpcNotification::new(method, params))
    }

    /// Send a logging notification if `level` passes the current threshold.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `data` cannot be encoded.
    pub fn log(&self, level: LogLevel, message: impl Into<String>, data: Option<Value>) -> RpcResult<()> {
        match self.inner.peer_log.params(level, message.into(), data) {
            Some(params) => self.send_notification(LOGGING_METHOD, Some(params)),
            None => Ok(()),
        }
    }

    /// Send a progress notification for `token`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the params cannot be encoded.
    pub fn send_progress(
        &self,
        token: impl Into<ProgressToken>,
        progress: f64,
        total: Option<f64>,
    ) -> RpcResult<()> {
        let params = progress_params(&token.into(), progress, total);
        self.send_notification(PROGRESS_METHOD, Some(params))
    }

    /// Set the minimum level of logging notifications.
    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.peer_log.set_minimum(level);
        debug!(%level, "Log level changed");
    }

    /// Current minimum level of logging notifications.
    pub fn log_level(&self) -> LogLevel {
        self.inner.peer_log.minimum()
    }

    /// Number of outgoing requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.len()
    }
}

impl Inner {
    /// Running → Stopped. Returns `false` if already stopped.
    fn halt(&self, reason: &str) -> bool {
        let shutdown = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == RouterState::Stopped {
                return false;
            }
            lifecycle.state = RouterState::Stopped;
            lifecycle.outbound = None;
            lifecycle.shutdown.take()
        };

        if let Some(token) = shutdown {
            token.cancel();
        }
        self.state_changes.send_replace(RouterState::Stopped);
        let rejected = self.correlator.reject_all(&RpcError::stopped());
        info!(reason, rejected, "Router stopped");
        true
    }

    fn write_message<T: Serialize>(&self, message: &T) -> RpcResult<()> {
        let line = serde_json::to_string(message)?;
        let lifecycle = self.lifecycle.lock();
        match lifecycle.outbound.as_ref() {
            Some(outbound) if outbound.send(line).is_ok() => {}
            _ => trace!("Router stopped; dropping outbound message"),
        }
        Ok(())
    }

    fn reply_error(&self, id: RequestId, error: JsonRpcError) {
        if let Err(e) = self.write_message(&JsonRpcResponse::error(id, error)) {
            error!(error = %e, "Failed to encode error response");
        }
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: LineReader,
        shutdown: CancellationToken,
    ) -> Option<LineReader> {
        let mut in_flight = JoinSet::new();
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    in_flight.detach_all();
                    return Some(reader);
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                next = reader.next() => match next {
                    Some(Ok(line)) => self.route_line(line, &mut in_flight),
                    None => {
                        self.finish(in_flight, &shutdown, "inbound stream closed").await;
                        return None;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Failed to read inbound stream");
                        self.finish(in_flight, &shutdown, "inbound stream failed").await;
                        return None;
                    }
                },
            }
        }
    }

    /// Wind down after the inbound stream ended.
    ///
    /// Outgoing requests can no longer be answered and are rejected at once.
    /// Requests already handed to the handler still get their responses
    /// written before the outbound queue closes, unless `stop` cuts in.
    async fn finish(&self, mut in_flight: JoinSet<()>, shutdown: &CancellationToken, reason: &str) {
        self.lifecycle.lock().inbound_closed = true;
        let rejected = self.correlator.reject_all(&RpcError::stopped());
        debug!(
            in_flight = in_flight.len(),
            rejected, "Inbound stream ended; answering requests in flight"
        );

        tokio::select! {
            () = shutdown.cancelled() => in_flight.detach_all(),
            () = async { while in_flight.join_next().await.is_some() {} } => {}
        }
        self.halt(reason);
    }

    fn route_line(self: &Arc<Self>, line: InboundLine, in_flight: &mut JoinSet<()>) {
        let text = match line {
            InboundLine::Text(text) => text,
            InboundLine::Undecodable(text) => {
                let rejection = Rejection::Parse {
                    error: "line is not valid UTF-8".to_string(),
                    id: recover_id(&text),
                };
                self.on_rejection(&text, rejection);
                return;
            }
            InboundLine::Oversized(head) => {
                self.on_oversized(&head);
                return;
            }
        };

        match classify(&text) {
            Ok(InboundMessage::Response(response)) => self.on_response(response),
            Ok(InboundMessage::Notification(notification)) => {
                self.notifications.dispatch(&notification);
            }
            Ok(InboundMessage::Request(request)) => self.on_request(request, in_flight),
            Err(rejection) => self.on_rejection(&text, rejection),
        }
    }

    fn on_oversized(&self, head: &str) {
        let limit = self.config.max_message_size;
        match recover_id(head) {
            Some(id) => {
                warn!(%id, limit, "Rejecting oversized message");
                self.reply_error(
                    id,
                    JsonRpcError::invalid_request(format!(
                        "Message exceeds maximum size of {limit} bytes"
                    )),
                );
            }
            None => {
                error!(limit, "Dropping oversized message with no recoverable id");
            }
        }
    }

    fn on_response(&self, response: JsonRpcResponse) {
        let id = response.id.clone();
        if !self.correlator.resolve(response) {
            warn!(%id, "Received response for unknown request");
        }
    }

    fn on_request(self: &Arc<Self>, request: JsonRpcRequest, in_flight: &mut JoinSet<()>) {
        let Some(handler) = self.handler.read().clone() else {
            warn!(id = %request.id, method = %request.method, "No message handler registered");
            self.reply_error(request.id, JsonRpcError::internal_error(NO_HANDLER_MESSAGE));
            return;
        };

        let inner = Arc::clone(self);
        in_flight.spawn(async move {
            let id = request.id.clone();
            let method = request.method.clone();

            let response = match AssertUnwindSafe(handler.handle(request)).catch_unwind().await {
                Ok(Ok(result)) => JsonRpcResponse::success(id, result),
                Ok(Err(e)) => {
                    debug!(%id, %method, error = %e, "Request handler failed");
                    JsonRpcResponse::error(id, e)
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(%id, %method, error = %message, "Request handler panicked");
                    JsonRpcResponse::error(id, JsonRpcError::internal_error(message))
                }
            };

            if let Err(e) = inner.write_message(&response) {
                error!(error = %e, "Failed to encode response");
            }
        });
    }

    fn on_rejection(&self, line: &str, rejection: Rejection) {
        match &rejection {
            Rejection::Parse { error, .. } => {
                error!(line, error = %error, "Failed to parse inbound line");
            }
            Rejection::NotAnObject => {
                debug!(line, "Dropping non-object message");
                return;
            }
            Rejection::UnsupportedVersion { found, .. } => {
                warn!(line, ?found, "Rejecting message with unsupported JSON-RPC version");
            }
            Rejection::Malformed { reason, .. } => {
                warn!(line, reason = %reason, "Rejecting malformed message");
            }
            Rejection::MalformedResponse { id, reason } => {
                warn!(line, %id, reason = %reason, "Dropping malformed response");
                // Fail the waiter now instead of letting it time out
                self.correlator
                    .resolve(JsonRpcResponse::error(id.clone(), rejection.to_error()));
                return;
            }
        }

        if let Some(id) = rejection.reply_id() {
            self.reply_error(id.clone(), rejection.to_error());
        }
    }
}
