//! Host imports of the `host_unstable` module.
//!
//! Every import runs under [`wrap_host_call`]: answered directly when no I/O
//! is needed, otherwise parked in the bridge while the core unwinds.

use anyhow::{Context, anyhow};
use corehost_types::{AbiResult, Errno, OutgoingMessage, Pair, PairEncoding};
use tracing::debug;
use wasmtime::{
    AsContextMut, Caller, Instance, Linker, Memory, Store, TypedFunc, WasmParams, WasmResults,
};

use crate::bridge::{
    AsyncifyControl, Bridge, BridgeViolation, HostStep, SuspendState, wrap_host_call,
};
use crate::dispatch::{Completion, Dispatch, dispatch, too_large};
use crate::state::HostState;

pub const IMPORT_MODULE: &str = "host_unstable";

/// Value delivered to an import when the core is rewound.
pub enum Resolved {
    Message(Completion),
    Read(Result<Vec<u8>, Errno>),
    Write(Result<usize, Errno>),
    Close(Result<(), Errno>),
}

/// Exports the host needs while the core is running.
#[derive(Clone)]
pub struct CoreBindings {
    memory: Memory,
    get_state: TypedFunc<(), i32>,
    start_unwind: TypedFunc<i32, ()>,
    stop_unwind: TypedFunc<(), ()>,
    start_rewind: TypedFunc<i32, ()>,
    stop_rewind: TypedFunc<(), ()>,
}

impl CoreBindings {
    pub fn resolve(instance: &Instance, mut store: impl AsContextMut) -> anyhow::Result<Self> {
        let mut store = store.as_context_mut();
        Ok(Self {
            memory: instance
                .get_memory(&mut store, "memory")
                .context("core does not export memory")?,
            get_state: instance.get_typed_func(&mut store, "asyncify_get_state")?,
            start_unwind: instance.get_typed_func(&mut store, "asyncify_start_unwind")?,
            stop_unwind: instance.get_typed_func(&mut store, "asyncify_stop_unwind")?,
            start_rewind: instance.get_typed_func(&mut store, "asyncify_start_rewind")?,
            stop_rewind: instance.get_typed_func(&mut store, "asyncify_stop_rewind")?,
        })
    }
}

/// Anything that owns the core's store: a [`Caller`] inside an import, or
/// the [`Store`] itself when driving an export.
pub trait StoreAccess: AsContextMut<Data = HostState> {
    fn host(&mut self) -> &mut HostState;
}

impl StoreAccess for Caller<'_, HostState> {
    fn host(&mut self) -> &mut HostState {
        self.data_mut()
    }
}

impl StoreAccess for Store<HostState> {
    fn host(&mut self) -> &mut HostState {
        self.data_mut()
    }
}

/// Asyncify control and memory access over a borrowed store.
pub struct Ctl<'s, S: StoreAccess> {
    store: &'s mut S,
    bindings: CoreBindings,
}

impl<'s, S: StoreAccess> Ctl<'s, S> {
    pub fn new(store: &'s mut S) -> anyhow::Result<Self> {
        let bindings = store
            .host()
            .bindings
            .clone()
            .context("core exports are not bound")?;
        Ok(Self { store, bindings })
    }

    pub fn host(&mut self) -> &mut HostState {
        self.store.host()
    }

    pub fn call<P: WasmParams, R: WasmResults>(
        &mut self,
        func: &TypedFunc<P, R>,
        params: P,
    ) -> anyhow::Result<R> {
        func.call(&mut *self.store, params)
    }

    /// Copy `len` bytes out of core memory. The range is checked before
    /// anything is allocated for it.
    fn read_bytes(&mut self, ptr: i32, len: i32) -> Result<Vec<u8>, Errno> {
        let (start, len) = (ptr as u32 as usize, len as u32 as usize);
        let size = self.bindings.memory.data_size(&*self.store);
        if start.checked_add(len).is_none_or(|end| end > size) {
            return Err(Errno::Fault);
        }
        let mut buf = vec![0; len];
        self.bindings
            .memory
            .read(&*self.store, start, &mut buf)
            .map_err(|_| Errno::Fault)?;
        Ok(buf)
    }

    fn write_bytes(&mut self, ptr: i32, bytes: &[u8]) -> Result<(), Errno> {
        self.bindings
            .memory
            .write(&mut *self.store, ptr as u32 as usize, bytes)
            .map_err(|_| Errno::Fault)
    }

    fn encoding(&mut self) -> PairEncoding {
        self.host().config.pair_encoding
    }

    fn data_addr(&mut self) -> i32 {
        self.host().config.asyncify_data_addr as i32
    }
}

impl<S: StoreAccess> AsyncifyControl for Ctl<'_, S> {
    type Value = Resolved;

    fn state(&mut self) -> anyhow::Result<SuspendState> {
        let raw = self.bindings.get_state.call(&mut *self.store, ())?;
        Ok(SuspendState::from_raw(raw)?)
    }

    fn start_unwind(&mut self) -> anyhow::Result<()> {
        let addr = self.data_addr();
        self.bindings.start_unwind.call(&mut *self.store, addr)
    }

    fn stop_unwind(&mut self) -> anyhow::Result<()> {
        self.bindings.stop_unwind.call(&mut *self.store, ())
    }

    fn start_rewind(&mut self) -> anyhow::Result<()> {
        let addr = self.data_addr();
        self.bindings.start_rewind.call(&mut *self.store, addr)
    }

    fn stop_rewind(&mut self) -> anyhow::Result<()> {
        self.bindings.stop_rewind.call(&mut *self.store, ())
    }

    fn reset_data(&mut self) -> anyhow::Result<()> {
        let config = &self.host().config;
        let (addr, header) = (config.asyncify_data_addr, config.asyncify_header());
        self.bindings
            .memory
            .write(&mut *self.store, addr as usize, &header)
            .context("asyncify data header is outside core memory")
    }

    fn bridge(&mut self) -> &mut Bridge<Resolved> {
        &mut self.host().bridge
    }
}

pub fn add_to_linker(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.func_wrap(IMPORT_MODULE, "message_exchange", message_exchange)?;
    linker.func_wrap(
        IMPORT_MODULE,
        "message_exchange_retrieve",
        message_exchange_retrieve,
    )?;
    linker.func_wrap(IMPORT_MODULE, "stream_read", stream_read)?;
    linker.func_wrap(IMPORT_MODULE, "stream_write", stream_write)?;
    linker.func_wrap(IMPORT_MODULE, "stream_close", stream_close)?;
    Ok(())
}

fn mismatch<R>() -> anyhow::Result<R> {
    Err(BridgeViolation::ResolvedMismatch.into())
}

fn encode_result<S: StoreAccess>(
    ctl: &mut Ctl<'_, S>,
    result: Result<u32, Errno>,
) -> anyhow::Result<i64> {
    let encoding = ctl.encoding();
    Ok(AbiResult::from(result).encode(encoding)? as i64)
}

/// Write `message` into the core's buffer, or stash it when it does not fit.
fn deliver<S: StoreAccess>(
    ctl: &mut Ctl<'_, S>,
    message: &OutgoingMessage,
    out_ptr: i32,
    out_len: i32,
) -> anyhow::Result<i64> {
    let bytes = message.encode();
    let size = u32::try_from(bytes.len()).context("reply does not fit in 32 bits")?;
    let handle = if size <= out_len as u32 {
        ctl.write_bytes(out_ptr, &bytes)
            .map_err(|errno| anyhow!("reply buffer is outside core memory: {errno}"))?;
        0
    } else {
        let handle = ctl
            .host()
            .messages
            .insert(bytes)
            .context("every message store handle is in use")?;
        debug!(size, out_len, handle, "reply stashed for retrieval");
        handle
    };
    let encoding = ctl.encoding();
    Ok(Pair::new(size, handle).encode(encoding)? as i64)
}

fn message_exchange(
    mut caller: Caller<'_, HostState>,
    msg_ptr: i32,
    msg_len: i32,
    out_ptr: i32,
    out_len: i32,
) -> anyhow::Result<i64> {
    let mut ctl = Ctl::new(&mut caller)?;
    wrap_host_call(
        &mut ctl,
        0,
        |ctl| {
            let limit = ctl.host().config.max_message_bytes;
            let len = msg_len as u32 as usize;
            if len > limit {
                let refusal = too_large(len, limit);
                return Ok(HostStep::Ready(deliver(ctl, &refusal, out_ptr, out_len)?));
            }
            let raw = ctl
                .read_bytes(msg_ptr, msg_len)
                .map_err(|errno| anyhow!("message is outside core memory: {errno}"))?;
            match dispatch(ctl.host(), &raw) {
                Dispatch::Reply(message) => {
                    Ok(HostStep::Ready(deliver(ctl, &message, out_ptr, out_len)?))
                }
                Dispatch::Deferred(future) => Ok(HostStep::Suspend(Box::pin(async move {
                    Resolved::Message(future.await)
                }))),
            }
        },
        |ctl, resolved| {
            let Resolved::Message(completion) = resolved else {
                return mismatch();
            };
            let message = completion.apply(ctl.host());
            deliver(ctl, &message, out_ptr, out_len)
        },
    )
}

fn retrieve<S: StoreAccess>(
    ctl: &mut Ctl<'_, S>,
    handle: u32,
    out_ptr: i32,
    out_len: i32,
) -> Result<u32, Errno> {
    let bytes = ctl
        .host()
        .messages
        .get(handle)
        .cloned()
        .ok_or(Errno::BadF)?;
    if bytes.len() > out_len as u32 as usize {
        return Err(Errno::Range);
    }
    ctl.write_bytes(out_ptr, &bytes)?;
    ctl.host().messages.remove(handle);
    Ok(bytes.len() as u32)
}

fn message_exchange_retrieve(
    mut caller: Caller<'_, HostState>,
    handle: i32,
    out_ptr: i32,
    out_len: i32,
) -> anyhow::Result<i64> {
    let mut ctl = Ctl::new(&mut caller)?;
    wrap_host_call(
        &mut ctl,
        0,
        |ctl| {
            let result = retrieve(ctl, handle as u32, out_ptr, out_len);
            Ok(HostStep::Ready(encode_result(ctl, result)?))
        },
        |_, _| mismatch(),
    )
}

fn stream_read(
    mut caller: Caller<'_, HostState>,
    handle: i32,
    out_ptr: i32,
    out_len: i32,
) -> anyhow::Result<i64> {
    let mut ctl = Ctl::new(&mut caller)?;
    wrap_host_call(
        &mut ctl,
        0,
        |ctl| {
            let Some(stream) = ctl.host().streams.get(handle as u32).cloned() else {
                return Ok(HostStep::Ready(encode_result(ctl, Err(Errno::BadF))?));
            };
            let max = (out_len.max(0) as usize).min(ctl.host().config.max_read_bytes);
            Ok(HostStep::Suspend(Box::pin(async move {
                let mut stream = stream.lock().await;
                Resolved::Read(stream.read(max).await)
            })))
        },
        |ctl, resolved| {
            let Resolved::Read(result) = resolved else {
                return mismatch();
            };
            let result = result.and_then(|bytes| {
                ctl.write_bytes(out_ptr, &bytes)?;
                Ok(bytes.len() as u32)
            });
            encode_result(ctl, result)
        },
    )
}

fn stream_write(
    mut caller: Caller<'_, HostState>,
    handle: i32,
    in_ptr: i32,
    in_len: i32,
) -> anyhow::Result<i64> {
    let mut ctl = Ctl::new(&mut caller)?;
    wrap_host_call(
        &mut ctl,
        0,
        |ctl| {
            let Some(stream) = ctl.host().streams.get(handle as u32).cloned() else {
                return Ok(HostStep::Ready(encode_result(ctl, Err(Errno::BadF))?));
            };
            let data = match ctl.read_bytes(in_ptr, in_len) {
                Ok(data) => data,
                Err(errno) => return Ok(HostStep::Ready(encode_result(ctl, Err(errno))?)),
            };
            Ok(HostStep::Suspend(Box::pin(async move {
                let mut stream = stream.lock().await;
                Resolved::Write(stream.write(&data).await)
            })))
        },
        |ctl, resolved| {
            let Resolved::Write(result) = resolved else {
                return mismatch();
            };
            encode_result(ctl, result.map(|n| n as u32))
        },
    )
}

fn stream_close(mut caller: Caller<'_, HostState>, handle: i32) -> anyhow::Result<i64> {
    let mut ctl = Ctl::new(&mut caller)?;
    wrap_host_call(
        &mut ctl,
        0,
        |ctl| {
            let Some(stream) = ctl.host().streams.remove(handle as u32) else {
                return Ok(HostStep::Ready(encode_result(ctl, Err(Errno::BadF))?));
            };
            Ok(HostStep::Suspend(Box::pin(async move {
                let mut stream = stream.lock().await;
                Resolved::Close(stream.close().await)
            })))
        },
        |ctl, resolved| {
            let Resolved::Close(result) = resolved else {
                return mismatch();
            };
            encode_result(ctl, result.map(|()| 0))
        },
    )
}
