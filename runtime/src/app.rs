//! One instantiated core and the exports the runtime drives.

use anyhow::{Context, bail};
use corehost_types::PerformRequest;
use tracing::{debug, warn};
use wasmtime::{Engine, Linker, Memory, Module, Store, TypedFunc};

use crate::bridge::{AsyncifyControl, SuspendState, wrap_export};
use crate::config::RuntimeConfig;
use crate::host::{self, CoreBindings, Ctl};
use crate::services::{HostServices, TextCoder};
use crate::state::{HostState, PerformState};

struct CoreExports {
    memory: Memory,
    setup: TypedFunc<(), ()>,
    teardown: TypedFunc<(), ()>,
    perform: TypedFunc<(), ()>,
    get_metrics: TypedFunc<(), i32>,
    clear_metrics: TypedFunc<(), ()>,
    get_developer_dump: TypedFunc<(), i32>,
}

pub struct AppCore {
    store: Store<HostState>,
    exports: CoreExports,
}

impl AppCore {
    pub fn instantiate(
        engine: &Engine,
        module: &Module,
        services: HostServices,
        config: RuntimeConfig,
    ) -> anyhow::Result<Self> {
        let mut linker = Linker::new(engine);
        host::add_to_linker(&mut linker)?;

        let mut store = Store::new(engine, HostState::new(services, config));
        let instance = linker
            .instantiate(&mut store, module)
            .context("failed to instantiate core")?;
        let bindings = CoreBindings::resolve(&instance, &mut store)?;
        store.data_mut().bindings = Some(bindings);

        let exports = CoreExports {
            memory: instance
                .get_memory(&mut store, "memory")
                .context("core does not export memory")?,
            setup: instance.get_typed_func(&mut store, "core_setup")?,
            teardown: instance.get_typed_func(&mut store, "core_teardown")?,
            perform: instance.get_typed_func(&mut store, "core_perform")?,
            get_metrics: instance.get_typed_func(&mut store, "core_get_metrics")?,
            clear_metrics: instance.get_typed_func(&mut store, "core_clear_metrics")?,
            get_developer_dump: instance.get_typed_func(&mut store, "core_get_developer_dump")?,
        };
        Ok(Self { store, exports })
    }

    async fn call_bridged(&mut self, func: &TypedFunc<(), ()>) -> anyhow::Result<()> {
        let mut ctl = Ctl::new(&mut self.store)?;
        wrap_export(&mut ctl, |ctl| ctl.call(func, ())).await
    }

    pub async fn setup(&mut self) -> anyhow::Result<()> {
        let func = self.exports.setup.clone();
        self.call_bridged(&func).await
    }

    pub async fn teardown(&mut self) -> anyhow::Result<()> {
        let func = self.exports.teardown.clone();
        self.call_bridged(&func).await
    }

    /// Run one use case. The perform state is discarded on every exit path.
    pub async fn perform(&mut self, request: PerformRequest) -> anyhow::Result<PerformState> {
        self.store.data_mut().perform = Some(PerformState::new(request));
        let func = self.exports.perform.clone();
        let outcome = self.call_bridged(&func).await;
        let state = self.store.data_mut().perform.take();
        outcome?;
        state.context("perform state disappeared during the call")
    }

    pub fn read_metrics(&mut self) -> anyhow::Result<Vec<String>> {
        let ptr = self.exports.get_metrics.call(&mut self.store, ())?;
        self.read_arena(ptr).context("failed to read metrics arena")
    }

    pub fn clear_metrics(&mut self) -> anyhow::Result<()> {
        self.exports.clear_metrics.call(&mut self.store, ())
    }

    pub fn read_developer_dump(&mut self) -> anyhow::Result<Vec<String>> {
        let ptr = self.exports.get_developer_dump.call(&mut self.store, ())?;
        self.read_arena(ptr)
            .context("failed to read developer dump arena")
    }

    /// Total suspensions serviced for this instance.
    #[must_use]
    pub fn suspensions(&self) -> u64 {
        self.store.data().bridge.suspensions()
    }

    /// Bring asyncify back to `Normal` after a failed call so the arena
    /// getters can run.
    pub fn abandon_suspension(&mut self) {
        let Ok(mut ctl) = Ctl::new(&mut self.store) else {
            return;
        };
        let reset = match ctl.state() {
            Ok(SuspendState::Unwinding) => ctl.stop_unwind(),
            Ok(SuspendState::Rewinding) => ctl.stop_rewind(),
            Ok(SuspendState::Normal) | Err(_) => Ok(()),
        };
        if let Err(err) = reset {
            warn!(error = %err, "failed to reset asyncify state");
        }
    }

    pub fn release_handles(&mut self) -> usize {
        self.store.data_mut().release_handles()
    }

    fn read_arena(&mut self, ptr: i32) -> anyhow::Result<Vec<String>> {
        let memory = self.exports.memory;
        let mut descriptor = [0u8; 16];
        memory
            .read(&self.store, ptr as u32 as usize, &mut descriptor)
            .context("arena descriptor is outside core memory")?;
        let word = |i: usize| {
            u32::from_le_bytes([
                descriptor[i * 4],
                descriptor[i * 4 + 1],
                descriptor[i * 4 + 2],
                descriptor[i * 4 + 3],
            ]) as usize
        };

        let size = memory.data_size(&self.store);
        let mut bytes = Vec::new();
        for (start, len) in [(word(0), word(1)), (word(2), word(3))] {
            if len == 0 {
                continue;
            }
            if start.checked_add(len).is_none_or(|end| end > size) {
                bail!("arena range {start}+{len} is outside core memory");
            }
            let offset = bytes.len();
            bytes.resize(offset + len, 0);
            memory
                .read(&self.store, start, &mut bytes[offset..])
                .context("failed to read arena range")?;
        }
        debug!(bytes = bytes.len(), "read arena");
        Ok(split_events(&bytes, self.store.data().services.text.as_ref()))
    }
}

/// Split an arena into its NUL-separated events, dropping empty ones.
pub fn split_events(bytes: &[u8], coder: &dyn TextCoder) -> Vec<String> {
    bytes
        .split(|byte| *byte == 0)
        .filter(|event| !event.is_empty())
        .filter_map(|event| match coder.decode(event) {
            Ok(text) => Some(text),
            Err(errno) => {
                warn!(%errno, "dropping undecodable arena event");
                None
            }
        })
        .collect()
}
