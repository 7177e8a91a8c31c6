//! The hypercall surface the runtime consumes.
//!
//! Everything above this crate talks to the hypervisor through
//! [`Hypervisor`], so the same event, grant, store and timer code runs on
//! bare metal (the hypercall page) and inside a hosted simulator.

use core::fmt;

use x86_64::VirtAddr;

use crate::grant::{MapGrantRef, UnmapGrantRef};
use crate::types::{DomId, Mfn, Port, ShutdownReason, Virq};

/// A failed hypercall: the negative errno the hypervisor returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypercallError(pub i64);

impl HypercallError {
    pub const EPERM: HypercallError = HypercallError(-1);
    pub const ENOENT: HypercallError = HypercallError(-2);
    pub const EAGAIN: HypercallError = HypercallError(-11);
    pub const ENOMEM: HypercallError = HypercallError(-12);
    pub const EFAULT: HypercallError = HypercallError(-14);
    pub const EBUSY: HypercallError = HypercallError(-16);
    pub const EEXIST: HypercallError = HypercallError(-17);
    pub const EINVAL: HypercallError = HypercallError(-22);
    pub const ENOSPC: HypercallError = HypercallError(-28);
    pub const ENOSYS: HypercallError = HypercallError(-38);
    pub const ETIME: HypercallError = HypercallError(-62);

    /// Turn a raw hypercall return value into a result.
    #[inline]
    pub fn check(rc: i64) -> Result<u64, HypercallError> {
        if rc < 0 {
            Err(HypercallError(rc))
        } else {
            Ok(rc as u64)
        }
    }

    fn name(self) -> Option<&'static str> {
        Some(match self.0 {
            -1 => "EPERM",
            -2 => "ENOENT",
            -11 => "EAGAIN",
            -12 => "ENOMEM",
            -14 => "EFAULT",
            -16 => "EBUSY",
            -17 => "EEXIST",
            -22 => "EINVAL",
            -28 => "ENOSPC",
            -38 => "ENOSYS",
            -62 => "ETIME",
            _ => return None,
        })
    }
}

impl fmt::Display for HypercallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "hypercall failed: {} ({})", name, self.0),
            None => write!(f, "hypercall failed: errno {}", self.0),
        }
    }
}

pub type HvResult<T> = Result<T, HypercallError>;

/// Hypercalls used by the guest runtime.
///
/// Implementations must be callable from the upcall path, hence `Sync`.
pub trait Hypervisor: Sync {
    // --- Event channels ---

    /// `EVTCHNOP_send`.
    fn evtchn_send(&self, port: Port) -> HvResult<()>;

    /// `EVTCHNOP_alloc_unbound`: a fresh local port `remote` may bind to.
    fn evtchn_alloc_unbound(&self, remote: DomId) -> HvResult<Port>;

    /// `EVTCHNOP_bind_interdomain`: connect a fresh local port to
    /// `remote_port` of `remote`. The hypervisor marks the new local port
    /// pending straight away.
    fn evtchn_bind_interdomain(&self, remote: DomId, remote_port: Port) -> HvResult<Port>;

    /// `EVTCHNOP_bind_virq`.
    fn evtchn_bind_virq(&self, virq: Virq, vcpu: u32) -> HvResult<Port>;

    /// `set_callbacks`: register the upcall and failsafe entry points.
    fn set_callbacks(&self, event: VirtAddr, failsafe: VirtAddr) -> HvResult<()>;

    // --- Grant tables ---

    /// `GNTTABOP_set_version`.
    fn gnttab_set_version(&self, version: u32) -> HvResult<()>;

    /// `GNTTABOP_get_version` for the calling domain.
    fn gnttab_get_version(&self) -> HvResult<u32>;

    /// `GNTTABOP_setup_table`: one frame per slot of `frames`.
    fn gnttab_setup_table(&self, frames: &mut [Mfn]) -> HvResult<()>;

    /// `GNTTABOP_get_status_frames`: the v2 status frames, one per slot of
    /// `frames`.
    fn gnttab_get_status_frames(&self, frames: &mut [Mfn]) -> HvResult<()>;

    /// `GNTTABOP_map_grant_ref`; the per-op status lands in `op.status`.
    fn gnttab_map_grant_ref(&self, op: &mut MapGrantRef) -> HvResult<()>;

    /// `GNTTABOP_unmap_grant_ref`; the per-op status lands in `op.status`.
    fn gnttab_unmap_grant_ref(&self, op: &mut UnmapGrantRef) -> HvResult<()>;

    // --- Memory ---

    /// `update_va_mapping`: point `va` at machine frame `mfn`.
    fn update_va_mapping(&self, va: VirtAddr, mfn: Mfn) -> HvResult<()>;

    // --- vCPU timer ---

    /// `VCPUOP_set_singleshot_timer` with an absolute deadline in ns.
    fn vcpu_set_singleshot_timer(&self, vcpu: u32, deadline_ns: u64) -> HvResult<()>;

    /// `VCPUOP_stop_periodic_timer`.
    fn vcpu_stop_periodic_timer(&self, vcpu: u32) -> HvResult<()>;

    // --- Scheduling ---

    /// `SCHEDOP_yield`.
    fn sched_yield(&self);

    /// `SCHEDOP_block`: sleep until an event arrives.
    fn sched_block(&self);

    /// `SCHEDOP_shutdown`. Never returns.
    fn sched_shutdown(&self, reason: ShutdownReason) -> !;

    /// `stack_switch`: kernel stack used on the next return from the
    /// hypervisor.
    fn stack_switch(&self, ss: u64, sp: u64) -> HvResult<()>;

    /// `fpu_taskswitch`: set or clear CR0.TS.
    fn fpu_taskswitch(&self, set: bool) -> HvResult<()>;

    // --- Console / CPU ---

    /// `CONSOLEIO_write`.
    fn console_write(&self, bytes: &[u8]);

    /// Raw time-stamp counter.
    fn read_tsc(&self) -> u64;
}
