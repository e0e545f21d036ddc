#![allow(clippy::return_self_not_must_use)]
#![doc = include_str!("../README.md")]

//! ## Architecture
//! The server is built on several key components:
//!
//! - `WebServer`: owns the controllers and options, starts the daemon with
//!   bounded retries and supervises it
//! - `Dispatcher`: source admission, first-match routing and completion
//!   forwarding
//! - `Controller` / `DynamicController`: request handlers invoked several
//!   times per request, with per-connection state in between
//! - `Reactor`: custom event loop for async I/O operations
//! - `Executor`: thread pool running one connection per worker
//!
//! ## Configuration
//! Server settings can be configured via:
//! - Environment variables (prefixed with `VIGIL_`)
//! - Configuration file (`config.toml`)
//! - `ServerOptions`, also at runtime through `OptionsHandle`
//!
//! ## Features
//! - `http2`: Enables HTTP/2 support (enabled by default)

pub use crate::allow::{client_ip, AllowList};
pub use crate::backend::{Backend, Daemon, NativeBackend};
pub use crate::config::{EngineConfig, ServerConfig, ServerOptions, TerminatePredicate};
pub use crate::controller::{
    BodyWait, Controller, Dynamic, DynamicController, Flow, RequestContext, ResponseParams,
    ResponseStatus, TerminationReason,
};
pub use crate::dispatch::Dispatcher;
pub use crate::engine::{Engine, EngineDaemon};
pub use crate::error::{Error, ExecutorError, ReactorError, Result};
pub use crate::http::{Bytes, HeaderMap, Method, PeerAddr, Reply, ReplyBody, RequestHead, StatusCode, Version};
pub use crate::server::{OptionsHandle, WebServer};
pub use crate::state::{ConnectionId, ConnectionState, StateRegistry};
pub use crate::tls::Certificate;

mod allow;
mod backend;
mod config;
mod controller;
mod dispatch;
mod engine;
mod error;
mod executor;
mod http;
mod net;
mod server;
mod state;
mod tls;

// Re-export common types
pub use hyper;
