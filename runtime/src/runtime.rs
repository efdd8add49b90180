//! The orchestrator: load → init → perform → destroy.
//!
//! All core access goes through one [`ExclusiveGate`]. A failed call inside
//! the core discards the instance on the spot, salvages its developer dump
//! and pending metrics for persistence, and leaves the runtime in
//! [`Lifecycle::Compiled`] so the caller can `init` again.

use std::sync::{Arc, Weak};

use corehost_types::{Errno, FileOpenFlags, PerformError, PerformRequest, UnexpectedKind};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use wasmtime::{Engine, Module};

use crate::app::AppCore;
use crate::bridge::BridgeViolation;
use crate::config::RuntimeConfig;
use crate::gate::ExclusiveGate;
use crate::services::{HostServices, Persistence, TimerId};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unloaded,
    Compiled,
    Ready,
    TornDown,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("core file not found: {0}")]
    NotFound(String),
    #[error("failed to read core file {path}: {errno}")]
    Read { path: String, errno: Errno },
    #[error("failed to compile core: {0:#}")]
    Compile(anyhow::Error),
    #[error("a core is already initialized")]
    AlreadyInitialized,
    #[error("runtime has been destroyed")]
    Destroyed,
}

struct ArmedTimer {
    id: TimerId,
    generation: u64,
}

/// Everything guarded by the call gate.
struct Slot {
    lifecycle: Lifecycle,
    module: Option<Module>,
    core: Option<AppCore>,
    timer: Option<ArmedTimer>,
    next_generation: u64,
}

struct Shared {
    engine: Engine,
    services: HostServices,
    config: RuntimeConfig,
    slot: ExclusiveGate<Slot>,
}

#[derive(Clone)]
pub struct CoreRuntime {
    shared: Arc<Shared>,
}

impl CoreRuntime {
    pub fn new(services: HostServices, config: RuntimeConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                engine: Engine::default(),
                services,
                config,
                slot: ExclusiveGate::new(Slot {
                    lifecycle: Lifecycle::Unloaded,
                    module: None,
                    core: None,
                    timer: None,
                    next_generation: 0,
                }),
            }),
        }
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.shared.slot.acquire().await.lifecycle
    }

    /// Suspensions serviced by the current core instance.
    pub async fn suspensions(&self) -> u64 {
        let slot = self.shared.slot.acquire().await;
        slot.core.as_ref().map_or(0, AppCore::suspensions)
    }

    /// Compile a core from its binary (or text) form.
    pub async fn load_core(&self, bytes: &[u8]) -> Result<(), LoadError> {
        let module = Module::new(&self.shared.engine, bytes).map_err(LoadError::Compile)?;
        let mut slot = self.shared.slot.acquire().await;
        match slot.lifecycle {
            Lifecycle::TornDown => Err(LoadError::Destroyed),
            Lifecycle::Ready => Err(LoadError::AlreadyInitialized),
            Lifecycle::Unloaded | Lifecycle::Compiled => {
                slot.module = Some(module);
                slot.lifecycle = Lifecycle::Compiled;
                info!(bytes = bytes.len(), "core compiled");
                Ok(())
            }
        }
    }

    /// Read a core through the filesystem collaborator and compile it.
    pub async fn load_core_from(&self, path: &str) -> Result<(), LoadError> {
        let fs = &self.shared.services.fs;
        if !fs.exists(path).await {
            return Err(LoadError::NotFound(path.to_string()));
        }
        let read_err = |errno| LoadError::Read {
            path: path.to_string(),
            errno,
        };

        let flags = FileOpenFlags {
            read: true,
            ..FileOpenFlags::default()
        };
        let mut file = fs.open(path, flags).await.map_err(read_err)?;
        let mut bytes = Vec::new();
        loop {
            let chunk = file.read(READ_CHUNK).await.map_err(read_err)?;
            if chunk.is_empty() {
                break;
            }
            bytes.extend_from_slice(&chunk);
        }
        file.close().await.map_err(read_err)?;
        debug!(path, bytes = bytes.len(), "core file read");

        self.load_core(&bytes).await
    }

    /// Instantiate the compiled core and run its setup. Idempotent once ready.
    pub async fn init(&self) -> Result<(), PerformError> {
        let mut slot = self.shared.slot.acquire().await;
        match slot.lifecycle {
            Lifecycle::Ready => return Ok(()),
            Lifecycle::Compiled => {}
            other => return Err(not_ready(other)),
        }
        let Some(module) = slot.module.clone() else {
            return Err(not_ready(Lifecycle::Unloaded));
        };

        let mut core = AppCore::instantiate(
            &self.shared.engine,
            &module,
            self.shared.services.clone(),
            self.shared.config.clone(),
        )
        .map_err(|err| PerformError::unexpected(UnexpectedKind::Host, format!("{err:#}")))?;

        if let Err(err) = core.setup().await {
            return Err(self.shared.salvage(core, &err).await);
        }

        slot.core = Some(core);
        slot.lifecycle = Lifecycle::Ready;
        info!("core initialized");
        Ok(())
    }

    pub async fn perform(&self, request: PerformRequest) -> Result<Value, PerformError> {
        if let Some(field) = request.first_blank_field() {
            return Err(PerformError::validation(
                "PerformRequestValidationError",
                format!("{field} must not be empty"),
            ));
        }

        let mut slot = self.shared.slot.acquire().await;
        let lifecycle = slot.lifecycle;
        let Some(core) = slot.core.as_mut() else {
            return Err(not_ready(lifecycle));
        };

        debug!(usecase = %request.usecase, "perform started");
        match core.perform(request).await {
            Ok(state) => {
                self.arm_metrics_timer(&mut slot);
                state.into_result()
            }
            Err(err) => {
                self.cancel_metrics_timer(&mut slot);
                slot.lifecycle = Lifecycle::Compiled;
                match slot.core.take() {
                    Some(core) => Err(self.shared.salvage(core, &err).await),
                    None => Err(PerformError::unexpected(
                        classify(&err),
                        format!("{err:#}"),
                    )),
                }
            }
        }
    }

    /// Flush metrics, tear the core down and refuse further calls.
    pub async fn destroy(&self) -> Result<(), PerformError> {
        let mut slot = self.shared.slot.acquire().await;
        if slot.lifecycle == Lifecycle::TornDown {
            return Ok(());
        }
        self.cancel_metrics_timer(&mut slot);

        let result = match slot.core.take() {
            Some(mut core) => {
                let persistence = self.shared.services.persistence.as_ref();
                let finished = match flush_metrics(&mut core, persistence).await {
                    Ok(()) => core.teardown().await,
                    Err(err) => Err(err),
                };
                match finished {
                    Ok(()) => Ok(()),
                    Err(err) => Err(self.shared.salvage(core, &err).await),
                }
            }
            None => Ok(()),
        };

        slot.module = None;
        slot.lifecycle = Lifecycle::TornDown;
        info!("runtime destroyed");
        result
    }

    fn arm_metrics_timer(&self, slot: &mut Slot) {
        if slot.timer.is_some() {
            return;
        }
        let generation = slot.next_generation;
        slot.next_generation += 1;

        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let id = self.shared.services.timers.set_timeout(
            self.shared.config.metrics_flush_interval(),
            Box::pin(async move {
                if let Some(shared) = shared.upgrade() {
                    shared.flush_from_timer(generation).await;
                }
            }),
        );
        slot.timer = Some(ArmedTimer { id, generation });
        debug!(timer = id, "metrics flush armed");
    }

    fn cancel_metrics_timer(&self, slot: &mut Slot) {
        if let Some(timer) = slot.timer.take() {
            self.shared.services.timers.clear_timeout(timer.id);
        }
    }
}

impl Shared {
    /// Flush on behalf of the timer armed as `generation`. A trap in the
    /// metrics exports discards the core like any other failed call.
    async fn flush_from_timer(self: Arc<Self>, generation: u64) {
        let shared = Arc::clone(&self);
        self.slot
            .with_exclusive(move |slot| {
                Box::pin(async move {
                    if slot.timer.as_ref().map(|timer| timer.generation) != Some(generation) {
                        debug!(generation, "stale metrics timer ignored");
                        return;
                    }
                    slot.timer = None;
                    let Some(core) = slot.core.as_mut() else {
                        return;
                    };
                    let flushed = flush_metrics(core, shared.services.persistence.as_ref()).await;
                    if let Err(err) = flushed {
                        slot.lifecycle = Lifecycle::Compiled;
                        if let Some(core) = slot.core.take() {
                            shared.salvage(core, &err).await;
                        }
                    }
                })
            })
            .await;
    }

    /// Discard a core after a failed call and forward what it left behind.
    async fn salvage(&self, mut core: AppCore, err: &anyhow::Error) -> PerformError {
        let kind = classify(err);
        error!(error = %format!("{err:#}"), %kind, "core call failed; discarding instance");

        core.abandon_suspension();
        let released = core.release_handles();
        if released > 0 {
            debug!(released, "released handles of discarded core");
        }
        let dump = core.read_developer_dump().unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), "developer dump unavailable");
            Vec::new()
        });
        let metrics = core.read_metrics().unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), "metrics unavailable");
            Vec::new()
        });
        drop(core);

        let persistence = &self.services.persistence;
        if !dump.is_empty() {
            if let Err(err) = persistence.persist_developer_dump(dump).await {
                warn!(error = %err, "failed to persist developer dump");
            }
        }
        if !metrics.is_empty() {
            if let Err(err) = persistence.persist_metrics(metrics).await {
                warn!(error = %err, "failed to persist metrics");
            }
        }

        PerformError::unexpected(kind, format!("{err:#}"))
    }
}

/// Read, clear and forward the core's pending metrics. Only a failure of
/// the core itself is returned; persistence failures are logged.
async fn flush_metrics(core: &mut AppCore, persistence: &dyn Persistence) -> anyhow::Result<()> {
    let events = core.read_metrics()?;
    core.clear_metrics()?;
    if events.is_empty() {
        return Ok(());
    }
    let count = events.len();
    match persistence.persist_metrics(events).await {
        Ok(()) => debug!(count, "metrics flushed"),
        Err(err) => warn!(error = %err, "failed to persist metrics"),
    }
    Ok(())
}

fn classify(err: &anyhow::Error) -> UnexpectedKind {
    if err.downcast_ref::<BridgeViolation>().is_some() {
        UnexpectedKind::BridgeViolation
    } else {
        UnexpectedKind::Trap
    }
}

fn not_ready(lifecycle: Lifecycle) -> PerformError {
    let message = match lifecycle {
        Lifecycle::Unloaded => "no core has been loaded",
        Lifecycle::Compiled => "core is not initialized",
        Lifecycle::Ready => "core is unavailable",
        Lifecycle::TornDown => "runtime has been destroyed",
    };
    PerformError::unexpected(UnexpectedKind::Lifecycle, message)
}
