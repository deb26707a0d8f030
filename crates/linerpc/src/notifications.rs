//! Fan-out of inbound notifications to per-method handlers.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use linerpc_core::JsonRpcNotification;
use parking_lot::RwLock;
use tracing::{error, trace};

use crate::handler::NotificationHandler;

/// Method name to handlers, in registration order.
#[derive(Default)]
pub(crate) struct NotificationTable {
    handlers: RwLock<HashMap<String, Vec<NotificationHandler>>>,
}

impl std::fmt::Debug for NotificationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.handlers.read();
        f.debug_map()
            .entries(handlers.iter().map(|(method, list)| (method, list.len())))
            .finish()
    }
}

impl NotificationTable {
    pub(crate) fn add(&self, method: &str, handler: NotificationHandler) {
        self.handlers
            .write()
            .entry(method.to_string())
            .or_default()
            .push(handler);
    }

    /// Remove the first registration of `handler` for `method`.
    pub(crate) fn remove(&self, method: &str, handler: &NotificationHandler) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(method) else {
            return false;
        };
        let Some(position) = list.iter().position(|h| same_handler(h, handler)) else {
            return false;
        };
        list.remove(position);
        if list.is_empty() {
            handlers.remove(method);
        }
        true
    }

    pub(crate) fn count(&self, method: &str) -> usize {
        self.handlers.read().get(method).map_or(0, Vec::len)
    }

    /// Invoke every handler for the notification's method, in order.
    ///
    /// A failing or panicking handler is logged and skipped; the rest still
    /// run. Returns how many handlers were invoked.
    pub(crate) fn dispatch(&self, notification: &JsonRpcNotification) -> usize {
        // Snapshot so handlers may (un)register without deadlocking.
        let handlers = self
            .handlers
            .read()
            .get(&notification.method)
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            trace!(method = %notification.method, "No handlers for notification");
            return 0;
        }

        for handler in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(notification))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(method = %notification.method, error = %e, "Notification handler failed");
                }
                Err(panic) => {
                    error!(
                        method = %notification.method,
                        error = %panic_message(panic.as_ref()),
                        "Notification handler panicked"
                    );
                }
            }
        }
        handlers.len()
    }
}

fn same_handler(a: &NotificationHandler, b: &NotificationHandler) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
