//! Completion-queue driven unary RPC engine.
//!
//! Every step of a call is an op batch submitted against a [`CompletionQueue`];
//! completions come back tagged with the phase and the call they belong to.
//! [`Client`] drives one call to a single outcome, [`Server`] accepts calls one
//! at a time and dispatches them through a [`HandlerRegistry`].

pub mod batch;
pub mod call;
pub mod client;
pub mod completion;
pub mod config;
pub mod errors;
pub mod logging;
pub mod metadata;
pub mod server;
pub mod status;
pub mod transport;

pub use batch::{BatchBuilder, OpBatch};
pub use client::{call, Client, ClientConfig, UnaryResponse};
pub use completion::{Completion, CompletionQueue, Event, Tag};
pub use errors::{CallError, HandlerFault, HookError, ServeError, SubmitError, TransportError};
pub use metadata::Metadata;
pub use server::{
    serve, CommandHandler, Handler, HandlerRegistry, HookPoint, HookResult, Hooks, ServeSummary,
    Server, ServerConfig, ShutdownSignal, StopReason,
};
pub use status::{Code, Status};
pub use transport::{http2::Http2Transport, inproc::InprocNetwork};
