//! Host-side state stored inside the core's `wasmtime::Store`.

use std::sync::Arc;

use corehost_types::{CoreException, DomainError, PerformError, PerformRequest, UnexpectedKind};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::bridge::Bridge;
use crate::config::RuntimeConfig;
use crate::handles::HandleTable;
use crate::host::{CoreBindings, Resolved};
use crate::services::{HostFut, HostServices, HostStream, HttpResponse, NetworkError};

/// A stream handle. Shared so a deferred read can own it while the store is
/// handed back to the bridge.
pub type SharedStream = Arc<Mutex<Box<dyn HostStream>>>;

/// A fetch issued by `http-call` and not yet claimed by `http-call-head`.
pub type PendingResponse = HostFut<'static, Result<HttpResponse, NetworkError>>;

pub struct HostState {
    pub(crate) bridge: Bridge<Resolved>,
    pub(crate) bindings: Option<CoreBindings>,
    pub(crate) services: HostServices,
    pub(crate) config: RuntimeConfig,
    pub(crate) perform: Option<PerformState>,
    pub(crate) streams: HandleTable<SharedStream>,
    pub(crate) responses: HandleTable<PendingResponse>,
    pub(crate) messages: HandleTable<Vec<u8>>,
}

impl HostState {
    pub fn new(services: HostServices, config: RuntimeConfig) -> Self {
        let stash_limit = config.pair_encoding.max_second();
        Self {
            bridge: Bridge::new(),
            bindings: None,
            services,
            config,
            perform: None,
            streams: HandleTable::new(),
            responses: HandleTable::new(),
            messages: HandleTable::with_limit(stash_limit),
        }
    }

    /// Drop every live handle and anything parked in the bridge. Returns how
    /// many handles were released.
    pub fn release_handles(&mut self) -> usize {
        self.bridge.clear();
        self.perform = None;
        self.streams.drain().len() + self.responses.drain().len() + self.messages.drain().len()
    }
}

/// What the use case reported.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(Value),
    Exception(CoreException),
}

/// State of one in-flight perform.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformState {
    pub request: PerformRequest,
    outcome: Option<Outcome>,
}

impl PerformState {
    pub fn new(request: PerformRequest) -> Self {
        Self {
            request,
            outcome: None,
        }
    }

    /// Record the outcome. A second outcome is handed back and the first kept.
    pub fn set_outcome(&mut self, outcome: Outcome) -> Result<(), Outcome> {
        if self.outcome.is_some() {
            return Err(outcome);
        }
        self.outcome = Some(outcome);
        Ok(())
    }

    #[must_use]
    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn into_result(self) -> Result<Value, PerformError> {
        match self.outcome {
            Some(Outcome::Result(value)) => Ok(value),
            Some(Outcome::Error(value)) => Err(PerformError::Domain(DomainError { value })),
            Some(Outcome::Exception(exception)) => Err(PerformError::from_exception(exception)),
            None => Err(PerformError::unexpected(
                UnexpectedKind::MissingOutcome,
                format!("use case {} finished without an outcome", self.request.usecase),
            )),
        }
    }
}
