//! Logging and progress notifications addressed to the peer.
//!
//! Unlike [`crate::observability`], which is local diagnostics, these are
//! protocol messages: they travel over the stream like any other
//! notification, filtered by a minimum level the peer can adjust.

use linerpc_core::{LogLevel, ProgressToken};
use parking_lot::RwLock;
use serde_json::{Value, json};

/// Method of logging notifications
pub const LOGGING_METHOD: &str = "notifications/message";

/// Method of progress notifications
pub const PROGRESS_METHOD: &str = "notifications/progress";

/// Level filter plus logger name.
#[derive(Debug)]
pub(crate) struct PeerLog {
    logger: String,
    minimum: RwLock<LogLevel>,
}

impl PeerLog {
    pub(crate) fn new(logger: impl Into<String>, minimum: LogLevel) -> Self {
        Self {
            logger: logger.into(),
            minimum: RwLock::new(minimum),
        }
    }

    pub(crate) fn set_minimum(&self, level: LogLevel) {
        *self.minimum.write() = level;
    }

    pub(crate) fn minimum(&self) -> LogLevel {
        *self.minimum.read()
    }

    /// Params of the logging notification, or `None` when `level` is below
    /// the threshold.
    ///
    /// `data` shapes the payload: an object gets `message` merged in, any
    /// other value is wrapped as `{message, value}`, and no data sends the
    /// bare message.
    pub(crate) fn params(&self, level: LogLevel, message: String, data: Option<Value>) -> Option<Value> {
        if !level.passes(self.minimum()) {
            return None;
        }

        let data = match data {
            Some(Value::Object(mut map)) => {
                map.insert("message".to_string(), Value::String(message));
                Value::Object(map)
            }
            Some(value) => json!({ "message": message, "value": value }),
            None => Value::String(message),
        };

        Some(json!({
            "level": level,
            "logger": self.logger,
            "data": data,
        }))
    }
}

/// Params of a progress notification.
pub(crate) fn progress_params(token: &ProgressToken, progress: f64, total: Option<f64>) -> Value {
    let mut params = json!({
        "progressToken": token,
        "progress": progress,
    });
    if let (Some(total), Value::Object(map)) = (total, &mut params) {
        map.insert("total".to_string(), json!(total));
    }
    params
}
