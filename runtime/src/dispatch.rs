//! Routes one `message_exchange` request to a host operation.
//!
//! Requests that need no I/O are answered immediately. Requests that have to
//! wait produce a [`Dispatch::Deferred`] future whose [`Completion`] is
//! applied to the host state once the core has been rewound.

use std::sync::Arc;

use corehost_types::{
    Errno, FileOpenRequest, HttpRequest, IncomingMessage, MessageError, OutgoingMessage, ReplyBody,
    ReplyErrorCode,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::services::{HostFut, HostStream, HttpResponse, NetworkError};
use crate::state::{HostState, Outcome};
use crate::stream::ChunkReader;

pub enum Dispatch {
    Reply(OutgoingMessage),
    Deferred(HostFut<'static, Completion>),
}

/// Result of deferred work, applied with the store available again.
pub enum Completion {
    FileOpened(Result<Box<dyn HostStream>, Errno>),
    HttpHead(Result<HttpResponse, NetworkError>),
}

impl Completion {
    pub fn apply(self, state: &mut HostState) -> OutgoingMessage {
        match self {
            Self::FileOpened(Ok(stream)) => {
                match state.streams.insert(Arc::new(Mutex::new(stream))) {
                    Some(stream) => OutgoingMessage::Ok(ReplyBody::FileOpened { stream }),
                    None => handles_exhausted("stream"),
                }
            }
            Self::FileOpened(Err(errno)) => OutgoingMessage::errno(
                ReplyErrorCode::FileError,
                format!("failed to open file: {errno}"),
                errno.code(),
            ),
            Self::HttpHead(Ok(response)) => {
                let HttpResponse {
                    status,
                    headers,
                    body,
                } = response;
                let reader: Box<dyn HostStream> = Box::new(ChunkReader::new(body));
                let Some(body_stream) = state.streams.insert(Arc::new(Mutex::new(reader))) else {
                    return handles_exhausted("stream");
                };
                OutgoingMessage::Ok(ReplyBody::HttpHead {
                    status,
                    headers,
                    body_stream,
                })
            }
            Self::HttpHead(Err(err)) => OutgoingMessage::error(err.reply_code(), err.to_string()),
        }
    }
}

pub fn dispatch(state: &mut HostState, raw: &[u8]) -> Dispatch {
    if raw.len() > state.config.max_message_bytes {
        return Dispatch::Reply(too_large(raw.len(), state.config.max_message_bytes));
    }

    let message = match IncomingMessage::decode(raw) {
        Ok(message) => message,
        Err(err) => return Dispatch::Reply(malformed(&err)),
    };
    debug!(kind = message.kind(), "dispatching core message");

    match message {
        IncomingMessage::PerformInput => Dispatch::Reply(match state.perform.as_ref() {
            Some(perform) => OutgoingMessage::Ok(ReplyBody::PerformInput(perform.request.clone())),
            None => no_perform_state(),
        }),
        IncomingMessage::PerformOutputResult { result } => {
            Dispatch::Reply(store_outcome(state, Outcome::Result(result)))
        }
        IncomingMessage::PerformOutputError { error } => {
            Dispatch::Reply(store_outcome(state, Outcome::Error(error)))
        }
        IncomingMessage::PerformOutputException { exception } => {
            Dispatch::Reply(store_outcome(state, Outcome::Exception(exception)))
        }
        IncomingMessage::FileOpen(request) => file_open(state, request),
        IncomingMessage::HttpCall(request) => Dispatch::Reply(http_call(state, request)),
        IncomingMessage::HttpCallHead { handle } => http_call_head(state, handle),
        IncomingMessage::Unknown { kind } => Dispatch::Reply(OutgoingMessage::error(
            ReplyErrorCode::UnknownMessage,
            format!("unknown message kind {kind}"),
        )),
    }
}

pub fn too_large(len: usize, limit: usize) -> OutgoingMessage {
    OutgoingMessage::error(
        ReplyErrorCode::MessageTooLarge,
        format!("message of {len} bytes exceeds the {limit} byte limit"),
    )
}

fn handles_exhausted(what: &str) -> OutgoingMessage {
    OutgoingMessage::error(
        ReplyErrorCode::HandlesExhausted,
        format!("every {what} handle is in use"),
    )
}

fn malformed(err: &MessageError) -> OutgoingMessage {
    OutgoingMessage::error(ReplyErrorCode::MalformedMessage, err.to_string())
}

fn no_perform_state() -> OutgoingMessage {
    OutgoingMessage::error(ReplyErrorCode::NoPerformState, "no perform is in progress")
}

fn store_outcome(state: &mut HostState, outcome: Outcome) -> OutgoingMessage {
    let Some(perform) = state.perform.as_mut() else {
        return no_perform_state();
    };
    match perform.set_outcome(outcome) {
        Ok(()) => OutgoingMessage::Ok(ReplyBody::Stored),
        Err(_) => OutgoingMessage::error(
            ReplyErrorCode::OutcomeAlreadySet,
            "an outcome was already reported for this perform",
        ),
    }
}

fn file_open(state: &HostState, request: FileOpenRequest) -> Dispatch {
    let fs = Arc::clone(&state.services.fs);
    Dispatch::Deferred(Box::pin(async move {
        Completion::FileOpened(fs.open(&request.path, request.flags).await)
    }))
}

fn http_call(state: &mut HostState, request: HttpRequest) -> OutgoingMessage {
    debug!(method = %request.method, url = %request.url, "issuing fetch");
    let pending = state.services.network.fetch(request);
    match state.responses.insert(pending) {
        Some(handle) => OutgoingMessage::Ok(ReplyBody::HttpCalled { handle }),
        None => handles_exhausted("pending response"),
    }
}

fn http_call_head(state: &mut HostState, handle: u32) -> Dispatch {
    let Some(pending) = state.responses.remove(handle) else {
        return Dispatch::Reply(OutgoingMessage::error(
            ReplyErrorCode::InvalidHandle,
            format!("no pending response for handle {handle}"),
        ));
    };
    Dispatch::Deferred(Box::pin(async move { Completion::HttpHead(pending.await) }))
}
