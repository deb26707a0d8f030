//! # linerpc core
//!
//! Runtime-free building blocks of the linerpc router:
//!
//! - [`jsonrpc`]: JSON-RPC 2.0 wire types
//! - [`error`]: the unified [`RpcError`] and its code taxonomy
//! - [`message`]: classification of inbound lines into requests, responses
//!   and notifications
//! - [`level`]: severity levels for logging notifications
//!
//! The async router itself lives in the `linerpc` crate.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all
)]
#![deny(unsafe_code)]

pub mod error;
pub mod jsonrpc;
pub mod level;
pub mod message;

pub use error::{ErrorKind, RpcError, RpcResult};
pub use jsonrpc::{
    JSONRPC_VERSION, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    JsonRpcResponsePayload, JsonRpcVersion, ProgressToken, RequestId,
};
pub use level::LogLevel;
pub use message::{InboundMessage, Rejection, classify, recover_id};
