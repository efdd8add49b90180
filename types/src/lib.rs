//! Core domain types for corehost.
//!
//! This crate contains the ABI codec, the wire messages and the error
//! taxonomy shared by the runtime and its adapters. No IO, no async.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory

pub mod abi;
pub mod error;
pub mod message;

pub use abi::{AbiError, AbiResult, Errno, Pair, PairEncoding};
pub use error::{
    DomainError, PerformError, UnexpectedError, UnexpectedKind, ValidationError,
};
pub use message::{
    CoreException, FileOpenFlags, FileOpenRequest, HeaderMultiMap, HttpRequest, IncomingMessage,
    MessageError, OutgoingMessage, PerformRequest, ReplyBody, ReplyErrorCode,
};
