//! # linerpc
//!
//! A bidirectional JSON-RPC 2.0 router over one line-delimited duplex stream,
//! usually a child process's stdin and stdout.
//!
//! Either side may originate requests and notifications at any time. The
//! router:
//!
//! - **Frames** the stream as newline-delimited JSON, one message per line
//! - **Classifies** each inbound line as a request, response or notification
//! - **Correlates** responses with locally originated requests, with per-call
//!   timeouts
//! - **Dispatches** inbound requests to one [`MessageHandler`] and inbound
//!   notifications to per-method handlers
//! - **Logs to the peer** through level-filtered `notifications/message`
//!   messages and reports progress through `notifications/progress`
//!
//! Local diagnostics go through [`tracing`], never through the stream; see
//! [`LoggingConfig`] to install a stderr or file subscriber.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use linerpc::{LogLevel, Router, RouterConfig, RpcError, handler_fn, notification_handler};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RpcError> {
//!     let router = Router::stdio(RouterConfig::default());
//!
//!     router.set_message_handler(handler_fn(|request| async move {
//!         match request.method.as_str() {
//!             "ping" => Ok(json!({})),
//!             other => Err(RpcError::method_not_found(other)),
//!         }
//!     }));
//!     router.on_notification(
//!         "notifications/cancelled",
//!         notification_handler(|n| {
//!             tracing::info!(params = ?n.params, "Peer cancelled a request");
//!             Ok(())
//!         }),
//!     );
//!
//!     router.start().await?;
//!     router.log(LogLevel::Info, "ready", None)?;
//!     let answer = router.send_request("sampling/createMessage", Some(json!({}))).await?;
//!     # let _ = answer;
//!     router.stop().await;
//!     Ok(())
//! }
//! ```

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod config;
mod correlator;
pub mod handler;
mod notifications;
pub mod observability;
mod peer_log;
pub mod router;
mod transport;

pub use config::{ConfigError, RouterConfig, RouterConfigBuilder};
pub use handler::{HandlerFn, MessageHandler, NotificationHandler, handler_fn, notification_handler};
pub use observability::{LogOutput, LoggingConfig, LoggingGuard};
pub use peer_log::{LOGGING_METHOD, PROGRESS_METHOD};
pub use router::{Router, RouterState, WeakRouter};

pub use linerpc_core::{
    ErrorKind, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcResponsePayload, LogLevel, ProgressToken, RequestId, RpcError, RpcResult,
};
