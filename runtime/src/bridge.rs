//! Suspend/resume bridge for asyncify-instrumented cores.
//!
//! The core cannot pause, so a host operation that has to wait unwinds the
//! core's stack instead: the import parks its future in the [`Bridge`], asks
//! the core to unwind and returns a placeholder. [`wrap_export`] notices the
//! unwound export, awaits the parked future, then rewinds by calling the
//! export again. The core replays up to the same import, which now sees
//! `Rewinding` and hands back the resolved value.
//!
//! ```text
//!   Normal ──start_unwind──▶ Unwinding ──stop_unwind──▶ Normal
//!      ▲                                                  │
//!      └────────stop_rewind─── Rewinding ◀──start_rewind──┘
//! ```
//!
//! Any transition outside this cycle is a [`BridgeViolation`] and aborts the
//! call.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

/// Deferred host work parked while the core is unwound.
pub type HostFuture<V> = Pin<Box<dyn Future<Output = V> + Send>>;

/// Asyncify state as reported by `asyncify_get_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendState {
    Normal,
    Unwinding,
    Rewinding,
}

impl SuspendState {
    pub fn from_raw(raw: i32) -> Result<Self, BridgeViolation> {
        match raw {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Unwinding),
            2 => Ok(Self::Rewinding),
            other => Err(BridgeViolation::UnknownState(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeViolation {
    #[error("core reported unknown asyncify state {0}")]
    UnknownState(i32),
    #[error("export entered while {0:?}")]
    NotNormalAtEntry(SuspendState),
    #[error("host call made while the core is unwinding")]
    UnwindingAtHostCall,
    #[error("host call suspended while another operation is pending")]
    OverlappingSuspension,
    #[error("core unwound without a pending host operation")]
    NothingInFlight,
    #[error("rewind reached a host call with no resolved value")]
    NothingResolved,
    #[error("resolved value does not belong to the resuming host call")]
    ResolvedMismatch,
    #[error("state is {0:?} after stopping the unwind")]
    NotNormalAfterUnwind(SuspendState),
    #[error("export returned while still rewinding")]
    ReturnedWhileRewinding,
    #[error("export returned with a host operation still pending")]
    PendingLeftBehind,
}

enum Pending<V> {
    InFlight(HostFuture<V>),
    Resolved(V),
}

/// The single pending-value slot of one core instance.
pub struct Bridge<V> {
    pending: Option<Pending<V>>,
    suspensions: u64,
}

impl<V> Bridge<V> {
    pub fn new() -> Self {
        Self {
            pending: None,
            suspensions: 0,
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    /// Total suspensions since this bridge was created.
    #[must_use]
    pub fn suspensions(&self) -> u64 {
        self.suspensions
    }

    fn park(&mut self, future: HostFuture<V>) -> Result<(), BridgeViolation> {
        if self.pending.is_some() {
            return Err(BridgeViolation::OverlappingSuspension);
        }
        self.pending = Some(Pending::InFlight(future));
        Ok(())
    }

    fn take_in_flight(&mut self) -> Result<HostFuture<V>, BridgeViolation> {
        match self.pending.take() {
            Some(Pending::InFlight(future)) => Ok(future),
            Some(resolved @ Pending::Resolved(_)) => {
                self.pending = Some(resolved);
                Err(BridgeViolation::NothingInFlight)
            }
            None => Err(BridgeViolation::NothingInFlight),
        }
    }

    fn resolve(&mut self, value: V) {
        self.suspensions += 1;
        self.pending = Some(Pending::Resolved(value));
    }

    fn take_resolved(&mut self) -> Result<V, BridgeViolation> {
        match self.pending.take() {
            Some(Pending::Resolved(value)) => Ok(value),
            Some(in_flight @ Pending::InFlight(_)) => {
                self.pending = Some(in_flight);
                Err(BridgeViolation::NothingResolved)
            }
            None => Err(BridgeViolation::NothingResolved),
        }
    }

    /// Drop whatever is pending; used when the core instance is discarded.
    pub fn clear(&mut self) {
        self.pending = None;
    }
}

impl<V> Default for Bridge<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for Bridge<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = match self.pending {
            None => "idle",
            Some(Pending::InFlight(_)) => "in-flight",
            Some(Pending::Resolved(_)) => "resolved",
        };
        f.debug_struct("Bridge")
            .field("pending", &pending)
            .field("suspensions", &self.suspensions)
            .finish()
    }
}

/// Access to the core's asyncify exports and the bridge slot of its instance.
pub trait AsyncifyControl {
    type Value;

    fn state(&mut self) -> anyhow::Result<SuspendState>;
    fn start_unwind(&mut self) -> anyhow::Result<()>;
    fn stop_unwind(&mut self) -> anyhow::Result<()>;
    fn start_rewind(&mut self) -> anyhow::Result<()>;
    fn stop_rewind(&mut self) -> anyhow::Result<()>;
    /// Reset the unwind buffer header before a fresh export call.
    fn reset_data(&mut self) -> anyhow::Result<()>;
    fn bridge(&mut self) -> &mut Bridge<Self::Value>;
}

/// First half of a host operation: either answered on the spot or deferred.
pub enum HostStep<R, V> {
    Ready(R),
    Suspend(HostFuture<V>),
}

/// Run one host import under the bridge.
///
/// In `Normal` state `start` runs; a deferred answer is parked, the core is
/// asked to unwind and `placeholder` is returned. In `Rewinding` state the
/// resolved value is handed to `finish` instead.
pub fn wrap_host_call<C, R>(
    ctl: &mut C,
    placeholder: R,
    start: impl FnOnce(&mut C) -> anyhow::Result<HostStep<R, C::Value>>,
    finish: impl FnOnce(&mut C, C::Value) -> anyhow::Result<R>,
) -> anyhow::Result<R>
where
    C: AsyncifyControl,
{
    match ctl.state()? {
        SuspendState::Normal => match start(ctl)? {
            HostStep::Ready(value) => Ok(value),
            HostStep::Suspend(future) => {
                ctl.bridge().park(future)?;
                ctl.start_unwind()?;
                Ok(placeholder)
            }
        },
        SuspendState::Rewinding => {
            let value = ctl.bridge().take_resolved()?;
            ctl.stop_rewind()?;
            finish(ctl, value)
        }
        SuspendState::Unwinding => Err(BridgeViolation::UnwindingAtHostCall.into()),
    }
}

/// Drive an export to completion, servicing every suspension it makes.
pub async fn wrap_export<C, R>(
    ctl: &mut C,
    mut invoke: impl FnMut(&mut C) -> anyhow::Result<R>,
) -> anyhow::Result<R>
where
    C: AsyncifyControl,
{
    let state = ctl.state()?;
    if state != SuspendState::Normal {
        return Err(BridgeViolation::NotNormalAtEntry(state).into());
    }
    if !ctl.bridge().is_idle() {
        return Err(BridgeViolation::PendingLeftBehind.into());
    }
    ctl.reset_data()?;

    let mut suspensions = 0u32;
    loop {
        let value = invoke(ctl)?;
        match ctl.state()? {
            SuspendState::Normal => {
                if !ctl.bridge().is_idle() {
                    return Err(BridgeViolation::PendingLeftBehind.into());
                }
                if suspensions > 0 {
                    tracing::debug!(suspensions, "export resumed to completion");
                }
                return Ok(value);
            }
            SuspendState::Unwinding => {
                ctl.stop_unwind()?;
                let future = ctl.bridge().take_in_flight()?;
                suspensions += 1;
                tracing::debug!(suspension = suspensions, "core unwound; awaiting host operation");

                let resolved = future.await;

                let state = ctl.state()?;
                if state != SuspendState::Normal {
                    return Err(BridgeViolation::NotNormalAfterUnwind(state).into());
                }
                ctl.bridge().resolve(resolved);
                ctl.start_rewind()?;
            }
            SuspendState::Rewinding => {
                return Err(BridgeViolation::ReturnedWhileRewinding.into());
            }
        }
    }
}
