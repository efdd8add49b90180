//! Collaborator contracts the runtime consumes.
//!
//! One implementation of each trait exists per deployment target. Every
//! trait is object safe and returns boxed `Send` futures so the runtime can
//! hold them behind `Arc<dyn _>` and move deferred work across await points.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use corehost_types::{Errno, FileOpenFlags, HeaderMultiMap, HttpRequest, ReplyErrorCode};
use futures_util::Stream;
use thiserror::Error;

/// Boxed future returned by every collaborator.
pub type HostFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Push-style body source handed back by [`Network::fetch`].
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, Errno>> + Send>>;

pub type TimerId = u64;

/// A byte stream addressed by handle from inside the core.
pub trait HostStream: Send {
    /// Read at most `max` bytes. An empty vector means end of stream.
    fn read(&mut self, max: usize) -> HostFut<'_, Result<Vec<u8>, Errno>>;
    /// Write `data`, returning how many bytes were accepted.
    fn write<'a>(&'a mut self, data: &'a [u8]) -> HostFut<'a, Result<usize, Errno>>;
    fn close(&mut self) -> HostFut<'_, Result<(), Errno>>;
}

pub trait FileSystem: Send + Sync {
    fn exists<'a>(&'a self, path: &'a str) -> HostFut<'a, bool>;
    fn open<'a>(
        &'a self,
        path: &'a str,
        flags: FileOpenFlags,
    ) -> HostFut<'a, Result<Box<dyn HostStream>, Errno>>;
}

pub struct HttpResponse {
    pub status: u16,
    pub headers: HeaderMultiMap,
    pub body: ByteStream,
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("request timed out")]
    Timeout,
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("host not found: {0}")]
    HostNotFound(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("{0}")]
    Other(String),
}

impl NetworkError {
    /// Error code sent back to the core in the reply.
    #[must_use]
    pub fn reply_code(&self) -> ReplyErrorCode {
        match self {
            Self::Timeout => ReplyErrorCode::NetworkTimeout,
            Self::InvalidUrl(_) => ReplyErrorCode::NetworkInvalidUrl,
            Self::HostNotFound(_) => ReplyErrorCode::NetworkHostNotFound,
            Self::ConnectionRefused(_) => ReplyErrorCode::NetworkConnectionRefused,
            Self::Other(_) => ReplyErrorCode::NetworkError,
        }
    }
}

pub trait Network: Send + Sync {
    /// Issue `request`. The returned future owns everything it needs, so it
    /// can be parked under a handle until the core asks for the response.
    fn fetch(&self, request: HttpRequest) -> HostFut<'static, Result<HttpResponse, NetworkError>>;
}

pub trait Timers: Send + Sync {
    /// Run `callback` once after `delay`.
    fn set_timeout(&self, delay: Duration, callback: HostFut<'static, ()>) -> TimerId;
    /// Cancel a timer; unknown or already fired ids are ignored.
    fn clear_timeout(&self, id: TimerId);
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("persistence failed: {0}")]
pub struct PersistError(pub String);

pub trait Persistence: Send + Sync {
    fn persist_metrics(&self, events: Vec<String>) -> HostFut<'_, Result<(), PersistError>>;
    fn persist_developer_dump(&self, events: Vec<String>)
    -> HostFut<'_, Result<(), PersistError>>;
}

pub trait TextCoder: Send + Sync {
    fn encode(&self, text: &str) -> Vec<u8>;
    fn decode(&self, bytes: &[u8]) -> Result<String, Errno>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Coder;

impl TextCoder for Utf8Coder {
    fn encode(&self, text: &str) -> Vec<u8> {
        text.as_bytes().to_vec()
    }

    fn decode(&self, bytes: &[u8]) -> Result<String, Errno> {
        String::from_utf8(bytes.to_vec()).map_err(|_| Errno::Inval)
    }
}

/// Everything the runtime needs from its environment.
#[derive(Clone)]
pub struct HostServices {
    pub fs: Arc<dyn FileSystem>,
    pub network: Arc<dyn Network>,
    pub timers: Arc<dyn Timers>,
    pub persistence: Arc<dyn Persistence>,
    pub text: Arc<dyn TextCoder>,
}

impl HostServices {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        network: Arc<dyn Network>,
        timers: Arc<dyn Timers>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self {
            fs,
            network,
            timers,
            persistence,
            text: Arc::new(Utf8Coder),
        }
    }
}
