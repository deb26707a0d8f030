//! Collaborator interfaces: the request handler and notification handlers.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use linerpc_core::{JsonRpcNotification, JsonRpcRequest, RpcResult};
use serde_json::Value;

/// The single handler that serves inbound requests.
///
/// Invocations run concurrently, one task per request; a slow call does not
/// hold up other requests or notifications. The returned value becomes the
/// response `result`, an error becomes the response `error`.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Serve one request.
    async fn handle(&self, request: JsonRpcRequest) -> RpcResult<Value>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, request: JsonRpcRequest) -> RpcResult<Value> {
        (**self).handle(request).await
    }
}

/// Adapter turning an async closure into a [`MessageHandler`].
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

impl<F> std::fmt::Debug for HandlerFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerFn").finish_non_exhaustive()
    }
}

/// Build a [`MessageHandler`] from an async closure.
///
/// ```rust
/// use linerpc::handler_fn;
/// use serde_json::json;
///
/// let handler = handler_fn(|request| async move {
///     Ok(json!({ "method": request.method }))
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(JsonRpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Value>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F>
where
    F: Fn(JsonRpcRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Value>> + Send + 'static,
{
    async fn handle(&self, request: JsonRpcRequest) -> RpcResult<Value> {
        (self.f)(request).await
    }
}

/// Handler for one notification method.
///
/// Registration and removal are by `Arc` identity: keep a clone of the handle
/// to pass to `off_notification` later.
pub type NotificationHandler = Arc<dyn Fn(&JsonRpcNotification) -> RpcResult<()> + Send + Sync>;

/// Wrap a closure as a [`NotificationHandler`].
pub fn notification_handler<F>(f: F) -> NotificationHandler
where
    F: Fn(&JsonRpcNotification) -> RpcResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}
