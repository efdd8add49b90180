//! Host runtime for a sandboxed, asyncify-instrumented core.
//!
//! The core cannot pause or do I/O. This crate gives it the illusion of both:
//! host imports that must wait unwind the core's stack, the awaited result
//! is delivered by rewinding it, and every call into the core is serialized
//! behind one gate.

pub mod bridge;
pub mod config;
pub mod gate;
pub mod handles;
pub mod services;
pub mod state;
pub mod stream;

pub(crate) mod dispatch;

mod app;
mod host;
mod runtime;

pub use bridge::{BridgeViolation, SuspendState};
pub use config::RuntimeConfig;
pub use gate::{ExclusiveGate, GateGuard};
pub use handles::{Handle, HandleTable};
pub use host::IMPORT_MODULE;
pub use runtime::{CoreRuntime, Lifecycle, LoadError};
pub use services::{
    ByteStream, FileSystem, HostFut, HostServices, HostStream, HttpResponse, Network,
    NetworkError, PersistError, Persistence, TextCoder, TimerId, Timers, Utf8Coder,
};
pub use stream::ChunkReader;
