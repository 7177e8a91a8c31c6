//! Context-switch detection around scheduler callbacks.
//!
//! A callback asks for a switch by rewriting the trapped register file. The
//! hypervisor keeps its own idea of the guest kernel stack, so when the
//! stack moves it has to be told, and the FPU state of the old context must
//! not leak into the new one.

use khal::{Hypervisor, ShutdownReason};
use klog::{error, trace, warn};

use crate::arch::RegisterFile;

/// Run `callback` on `regs`, then hand any stack change to the hypervisor.
///
/// A stack switch the hypervisor refuses leaves the guest on a stack it
/// does not know about, so that is fatal.
pub(super) fn switch_around<H, R>(hv: &H, regs: &mut RegisterFile, callback: impl FnOnce(&mut RegisterFile) -> R) -> R
where
    H: Hypervisor,
{
    let before = regs.stack();
    let result = callback(regs);
    let (ss, rsp) = regs.stack();
    if (ss, rsp) == before {
        return result;
    }

    trace!("switching stack {:#x}:{:#x} -> {:#x}:{:#x}", before.0, before.1, ss, rsp);
    if let Err(err) = hv.stack_switch(ss, rsp) {
        error!("stack switch to {:#x}:{:#x} refused: {}", ss, rsp, err);
        hv.sched_shutdown(ShutdownReason::Crash);
    }
    // Lazy FPU reload for the incoming context.
    if let Err(err) = hv.fpu_taskswitch(true) {
        warn!("fpu_taskswitch failed: {}", err);
    }
    result
}
