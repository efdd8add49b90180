//! Wire messages exchanged through `message_exchange`.
//!
//! Requests from the core and replies from the host are JSON objects tagged
//! by `"kind"`. Binary bodies travel as plain integer arrays, which is what
//! serde produces for `Vec<u8>`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Header name to every value sent for it.
pub type HeaderMultiMap = BTreeMap<String, Vec<String>>;

// ============================================================================
// Perform envelope
// ============================================================================

/// Everything the core needs to run one use case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformRequest {
    pub profile_url: String,
    pub provider_url: String,
    pub map_url: String,
    pub usecase: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default = "empty_object")]
    pub parameters: Value,
    #[serde(default = "empty_object")]
    pub security: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl PerformRequest {
    pub fn new(
        profile_url: impl Into<String>,
        provider_url: impl Into<String>,
        map_url: impl Into<String>,
        usecase: impl Into<String>,
    ) -> Self {
        Self {
            profile_url: profile_url.into(),
            provider_url: provider_url.into(),
            map_url: map_url.into(),
            usecase: usecase.into(),
            input: Value::Null,
            parameters: empty_object(),
            security: empty_object(),
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Name of the first locator field that is blank, if any.
    #[must_use]
    pub fn first_blank_field(&self) -> Option<&'static str> {
        [
            ("usecase", &self.usecase),
            ("profile_url", &self.profile_url),
            ("provider_url", &self.provider_url),
            ("map_url", &self.map_url),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
    }
}

/// An exception raised by the core's own runtime rather than by the map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreException {
    pub error_code: String,
    pub message: String,
}

// ============================================================================
// Requests (core -> host)
// ============================================================================

/// Flags for `file-open`; absent flags are false.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileOpenFlags {
    pub read: bool,
    pub write: bool,
    pub append: bool,
    pub truncate: bool,
    pub create: bool,
    pub create_new: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOpenRequest {
    pub path: String,
    #[serde(flatten)]
    pub flags: FileOpenFlags,
}

/// An outbound HTTP request issued by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HeaderMultiMap,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message has no \"kind\" field")]
    MissingKind,
    #[error("malformed {kind} message: {source}")]
    Malformed {
        kind: String,
        source: serde_json::Error,
    },
}

/// Every request the host understands, decoded once from the wire.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum IncomingMessage {
    PerformInput,
    PerformOutputResult {
        result: Value,
    },
    PerformOutputError {
        error: Value,
    },
    PerformOutputException {
        exception: CoreException,
    },
    FileOpen(FileOpenRequest),
    HttpCall(HttpRequest),
    HttpCallHead {
        handle: u32,
    },
    /// A well-formed message whose kind this host does not handle.
    #[serde(skip)]
    Unknown {
        kind: String,
    },
}

impl IncomingMessage {
    const KINDS: &'static [&'static str] = &[
        "perform-input",
        "perform-output-result",
        "perform-output-error",
        "perform-output-exception",
        "file-open",
        "http-call",
        "http-call-head",
    ];

    pub fn decode(bytes: &[u8]) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_slice(bytes)?;
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingKind)?
            .to_owned();

        if !Self::KINDS.contains(&kind.as_str()) {
            return Ok(Self::Unknown { kind });
        }

        serde_json::from_value(value).map_err(|source| MessageError::Malformed { kind, source })
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        match self {
            Self::PerformInput => "perform-input",
            Self::PerformOutputResult { .. } => "perform-output-result",
            Self::PerformOutputError { .. } => "perform-output-error",
            Self::PerformOutputException { .. } => "perform-output-exception",
            Self::FileOpen(_) => "file-open",
            Self::HttpCall(_) => "http-call",
            Self::HttpCallHead { .. } => "http-call-head",
            Self::Unknown { kind } => kind,
        }
    }
}

// ============================================================================
// Replies (host -> core)
// ============================================================================

/// Error codes carried by `{"kind":"err"}` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyErrorCode {
    UnknownMessage,
    MalformedMessage,
    MessageTooLarge,
    NoPerformState,
    OutcomeAlreadySet,
    FileError,
    InvalidHandle,
    HandlesExhausted,
    NetworkError,
    NetworkTimeout,
    NetworkInvalidUrl,
    NetworkHostNotFound,
    NetworkConnectionRefused,
}

impl ReplyErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownMessage => "UnknownMessage",
            Self::MalformedMessage => "MalformedMessage",
            Self::MessageTooLarge => "MessageTooLarge",
            Self::NoPerformState => "NoPerformState",
            Self::OutcomeAlreadySet => "OutcomeAlreadySet",
            Self::FileError => "FileError",
            Self::InvalidHandle => "InvalidHandle",
            Self::HandlesExhausted => "HandlesExhausted",
            Self::NetworkError => "NetworkError",
            Self::NetworkTimeout => "NetworkTimeout",
            Self::NetworkInvalidUrl => "NetworkInvalidUrl",
            Self::NetworkHostNotFound => "NetworkHostNotFound",
            Self::NetworkConnectionRefused => "NetworkConnectionRefused",
        }
    }
}

/// Fields of a successful reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyBody {
    PerformInput(PerformRequest),
    Stored,
    FileOpened {
        stream: u32,
    },
    HttpCalled {
        handle: u32,
    },
    HttpHead {
        status: u16,
        headers: HeaderMultiMap,
        body_stream: u32,
    },
}

/// A reply written back into the core's memory.
#[derive(Debug, Clone, PartialEq)]
pub enum OutgoingMessage {
    Ok(ReplyBody),
    Err {
        error_code: ReplyErrorCode,
        message: String,
        errno: Option<u32>,
    },
}

impl OutgoingMessage {
    pub fn error(error_code: ReplyErrorCode, message: impl Into<String>) -> Self {
        Self::Err {
            error_code,
            message: message.into(),
            errno: None,
        }
    }

    pub fn errno(error_code: ReplyErrorCode, message: impl Into<String>, errno: u32) -> Self {
        Self::Err {
            error_code,
            message: message.into(),
            errno: Some(errno),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Ok(ReplyBody::PerformInput(request)) => json!({
                "kind": "ok",
                "profile_url": request.profile_url,
                "provider_url": request.provider_url,
                "map_url": request.map_url,
                "usecase": request.usecase,
                "map_input": request.input,
                "map_parameters": request.parameters,
                "map_security": request.security,
            }),
            Self::Ok(ReplyBody::Stored) => json!({ "kind": "ok" }),
            Self::Ok(ReplyBody::FileOpened { stream }) => json!({ "kind": "ok", "stream": stream }),
            Self::Ok(ReplyBody::HttpCalled { handle }) => json!({ "kind": "ok", "handle": handle }),
            Self::Ok(ReplyBody::HttpHead {
                status,
                headers,
                body_stream,
            }) => json!({
                "kind": "ok",
                "status": status,
                "headers": headers,
                "body_stream": body_stream,
            }),
            Self::Err {
                error_code,
                message,
                errno,
            } => {
                let mut value = json!({
                    "kind": "err",
                    "error_code": error_code.as_str(),
                    "message": message,
                });
                if let Some(errno) = errno {
                    value["errno"] = json!(errno);
                }
                value
            }
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        // Serializing a `Value` cannot fail.
        serde_json::to_vec(&self.to_value()).unwrap_or_default()
    }
}
