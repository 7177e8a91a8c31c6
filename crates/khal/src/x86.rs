//! Hypercalls through the hypercall page.
//!
//! The domain builder fills `hypercall_page` (reserved by the boot stub)
//! with one 32-byte trampoline per hypercall. Arguments go in
//! rdi, rsi, rdx, r10, r8 and the result comes back in rax. rcx, r11 and
//! every argument register are clobbered.

use core::arch::asm;
use core::ptr;

use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

use crate::grant::{MapGrantRef, UnmapGrantRef};
use crate::hypercall::{HvResult, HypercallError, Hypervisor};
use crate::types::{DomId, Mfn, Port, ShutdownReason, Virq};

extern "C" {
    static hypercall_page: [u8; 4096];
}

// --- Hypercall numbers ---

const HYPERVISOR_STACK_SWITCH: usize = 3;
const HYPERVISOR_SET_CALLBACKS: usize = 4;
const HYPERVISOR_FPU_TASKSWITCH: usize = 5;
const HYPERVISOR_UPDATE_VA_MAPPING: usize = 14;
const HYPERVISOR_CONSOLE_IO: usize = 18;
const HYPERVISOR_GRANT_TABLE_OP: usize = 20;
const HYPERVISOR_VCPU_OP: usize = 24;
const HYPERVISOR_SCHED_OP: usize = 29;
const HYPERVISOR_EVENT_CHANNEL_OP: usize = 32;

// --- Sub-operations ---

const EVTCHNOP_BIND_INTERDOMAIN: u64 = 0;
const EVTCHNOP_BIND_VIRQ: u64 = 1;
const EVTCHNOP_SEND: u64 = 4;
const EVTCHNOP_ALLOC_UNBOUND: u64 = 6;

const GNTTABOP_MAP_GRANT_REF: u64 = 0;
const GNTTABOP_UNMAP_GRANT_REF: u64 = 1;
const GNTTABOP_SETUP_TABLE: u64 = 2;
const GNTTABOP_SET_VERSION: u64 = 8;
const GNTTABOP_GET_STATUS_FRAMES: u64 = 9;
const GNTTABOP_GET_VERSION: u64 = 10;

const VCPUOP_STOP_PERIODIC_TIMER: u64 = 7;
const VCPUOP_SET_SINGLESHOT_TIMER: u64 = 8;
/// Fail with -ETIME if the deadline is already in the past.
const VCPU_SSHOTTMR_FUTURE: u32 = 1 << 0;

const SCHEDOP_YIELD: u64 = 0;
const SCHEDOP_BLOCK: u64 = 1;
const SCHEDOP_SHUTDOWN: u64 = 2;

const CONSOLEIO_WRITE: u64 = 0;

/// `UVMF_INVLPG`: flush the single TLB entry for the remapped address.
const UVMF_INVLPG: u64 = 2;

// --- Argument records ---

#[repr(C)]
struct EvtchnBindInterdomain {
    remote_dom: u16,
    remote_port: u32,
    local_port: u32,
}

#[repr(C)]
struct EvtchnBindVirq {
    virq: u32,
    vcpu: u32,
    port: u32,
}

#[repr(C)]
struct EvtchnSend {
    port: u32,
}

#[repr(C)]
struct EvtchnAllocUnbound {
    dom: u16,
    remote_dom: u16,
    port: u32,
}

#[repr(C)]
struct GnttabSetupTable {
    dom: u16,
    nr_frames: u32,
    status: i16,
    frame_list: *mut u64,
}

#[repr(C)]
struct GnttabGetStatusFrames {
    nr_frames: u32,
    dom: u16,
    status: i16,
    frame_list: *mut u64,
}

#[repr(C)]
struct GnttabSetVersion {
    version: u32,
}

#[repr(C)]
struct GnttabGetVersion {
    dom: u16,
    pad: u16,
    version: u32,
}

#[repr(C)]
struct VcpuSetSingleshotTimer {
    timeout_abs_ns: u64,
    flags: u32,
}

#[repr(C)]
struct SchedShutdown {
    reason: u32,
}

/// Issue hypercall `op` with up to three arguments.
///
/// # Safety
///
/// The hypercall page must have been populated by the domain builder and
/// every pointer argument must reference a live record of the layout the
/// hypervisor expects for `op`.
#[inline]
unsafe fn hypercall3(op: usize, a1: u64, a2: u64, a3: u64) -> i64 {
    let entry = ptr::addr_of!(hypercall_page).cast::<u8>().add(op * 32);
    let ret: i64;
    asm!(
        "call {entry}",
        entry = in(reg) entry,
        inlateout("rdi") a1 => _,
        inlateout("rsi") a2 => _,
        inlateout("rdx") a3 => _,
        lateout("rax") ret,
        lateout("rcx") _,
        lateout("r11") _,
        lateout("r10") _,
        lateout("r8") _,
    );
    ret
}

#[inline]
fn event_channel_op<T>(cmd: u64, arg: &mut T) -> HvResult<u64> {
    // SAFETY: `arg` is a live record matching `cmd`.
    HypercallError::check(unsafe {
        hypercall3(HYPERVISOR_EVENT_CHANNEL_OP, cmd, arg as *mut T as u64, 0)
    })
}

#[inline]
fn grant_table_op<T>(cmd: u64, arg: &mut T) -> HvResult<u64> {
    // SAFETY: `arg` is a single live record matching `cmd`.
    HypercallError::check(unsafe {
        hypercall3(HYPERVISOR_GRANT_TABLE_OP, cmd, arg as *mut T as u64, 1)
    })
}

#[inline]
fn sched_op(cmd: u64, arg: u64) -> HvResult<u64> {
    // SAFETY: `arg` is either zero or points at a live record for `cmd`.
    HypercallError::check(unsafe { hypercall3(HYPERVISOR_SCHED_OP, cmd, arg, 0) })
}

/// The real hypervisor, reached through the hypercall page.
pub struct XenHypercalls;

impl Hypervisor for XenHypercalls {
    fn evtchn_send(&self, port: Port) -> HvResult<()> {
        let mut op = EvtchnSend { port: port.0 };
        event_channel_op(EVTCHNOP_SEND, &mut op).map(drop)
    }

    fn evtchn_alloc_unbound(&self, remote: DomId) -> HvResult<Port> {
        let mut op = EvtchnAllocUnbound {
            dom: DomId::SELF.0,
            remote_dom: remote.0,
            port: 0,
        };
        event_channel_op(EVTCHNOP_ALLOC_UNBOUND, &mut op)?;
        Ok(Port(op.port))
    }

    fn evtchn_bind_interdomain(&self, remote: DomId, remote_port: Port) -> HvResult<Port> {
        let mut op = EvtchnBindInterdomain {
            remote_dom: remote.0,
            remote_port: remote_port.0,
            local_port: 0,
        };
        event_channel_op(EVTCHNOP_BIND_INTERDOMAIN, &mut op)?;
        Ok(Port(op.local_port))
    }

    fn evtchn_bind_virq(&self, virq: Virq, vcpu: u32) -> HvResult<Port> {
        let mut op = EvtchnBindVirq {
            virq: virq as u32,
            vcpu,
            port: 0,
        };
        event_channel_op(EVTCHNOP_BIND_VIRQ, &mut op)?;
        Ok(Port(op.port))
    }

    fn set_callbacks(&self, event: VirtAddr, failsafe: VirtAddr) -> HvResult<()> {
        // SAFETY: plain addresses, no records.
        HypercallError::check(unsafe {
            hypercall3(HYPERVISOR_SET_CALLBACKS, event.as_u64(), failsafe.as_u64(), 0)
        })
        .map(drop)
    }

    fn gnttab_set_version(&self, version: u32) -> HvResult<()> {
        let mut op = GnttabSetVersion { version };
        grant_table_op(GNTTABOP_SET_VERSION, &mut op).map(drop)
    }

    fn gnttab_get_version(&self) -> HvResult<u32> {
        let mut op = GnttabGetVersion {
            dom: DomId::SELF.0,
            pad: 0,
            version: 0,
        };
        grant_table_op(GNTTABOP_GET_VERSION, &mut op)?;
        Ok(op.version)
    }

    fn gnttab_setup_table(&self, frames: &mut [Mfn]) -> HvResult<()> {
        let mut op = GnttabSetupTable {
            dom: DomId::SELF.0,
            nr_frames: frames.len() as u32,
            status: 0,
            // Mfn is a transparent u64.
            frame_list: frames.as_mut_ptr().cast::<u64>(),
        };
        grant_table_op(GNTTABOP_SETUP_TABLE, &mut op)?;
        if op.status != 0 {
            return Err(HypercallError(i64::from(op.status)));
        }
        Ok(())
    }

    fn gnttab_get_status_frames(&self, frames: &mut [Mfn]) -> HvResult<()> {
        let mut op = GnttabGetStatusFrames {
            nr_frames: frames.len() as u32,
            dom: DomId::SELF.0,
            status: 0,
            frame_list: frames.as_mut_ptr().cast::<u64>(),
        };
        grant_table_op(GNTTABOP_GET_STATUS_FRAMES, &mut op)?;
        if op.status != 0 {
            return Err(HypercallError(i64::from(op.status)));
        }
        Ok(())
    }

    fn gnttab_map_grant_ref(&self, op: &mut MapGrantRef) -> HvResult<()> {
        grant_table_op(GNTTABOP_MAP_GRANT_REF, op).map(drop)
    }

    fn gnttab_unmap_grant_ref(&self, op: &mut UnmapGrantRef) -> HvResult<()> {
        grant_table_op(GNTTABOP_UNMAP_GRANT_REF, op).map(drop)
    }

    fn update_va_mapping(&self, va: VirtAddr, mfn: Mfn) -> HvResult<()> {
        let flags = PageTableFlags::PRESENT
            | PageTableFlags::WRITABLE
            | PageTableFlags::ACCESSED
            | PageTableFlags::DIRTY;
        let pte = (mfn.0 << 12) | flags.bits();
        // SAFETY: plain values, no records.
        HypercallError::check(unsafe {
            hypercall3(HYPERVISOR_UPDATE_VA_MAPPING, va.as_u64(), pte, UVMF_INVLPG)
        })
        .map(drop)
    }

    fn vcpu_set_singleshot_timer(&self, vcpu: u32, deadline_ns: u64) -> HvResult<()> {
        let mut op = VcpuSetSingleshotTimer {
            timeout_abs_ns: deadline_ns,
            flags: VCPU_SSHOTTMR_FUTURE,
        };
        // SAFETY: `op` is a live `vcpu_set_singleshot_timer`.
        HypercallError::check(unsafe {
            hypercall3(
                HYPERVISOR_VCPU_OP,
                VCPUOP_SET_SINGLESHOT_TIMER,
                u64::from(vcpu),
                &mut op as *mut _ as u64,
            )
        })
        .map(drop)
    }

    fn vcpu_stop_periodic_timer(&self, vcpu: u32) -> HvResult<()> {
        // SAFETY: no argument record.
        HypercallError::check(unsafe {
            hypercall3(HYPERVISOR_VCPU_OP, VCPUOP_STOP_PERIODIC_TIMER, u64::from(vcpu), 0)
        })
        .map(drop)
    }

    fn sched_yield(&self) {
        let _ = sched_op(SCHEDOP_YIELD, 0);
    }

    fn sched_block(&self) {
        let _ = sched_op(SCHEDOP_BLOCK, 0);
    }

    fn sched_shutdown(&self, reason: ShutdownReason) -> ! {
        let mut op = SchedShutdown {
            reason: reason as u32,
        };
        loop {
            let _ = sched_op(SCHEDOP_SHUTDOWN, &mut op as *mut _ as u64);
            self.sched_block();
        }
    }

    fn stack_switch(&self, ss: u64, sp: u64) -> HvResult<()> {
        // SAFETY: plain values, no records.
        HypercallError::check(unsafe { hypercall3(HYPERVISOR_STACK_SWITCH, ss, sp, 0) }).map(drop)
    }

    fn fpu_taskswitch(&self, set: bool) -> HvResult<()> {
        // SAFETY: plain value, no records.
        HypercallError::check(unsafe {
            hypercall3(HYPERVISOR_FPU_TASKSWITCH, u64::from(set), 0, 0)
        })
        .map(drop)
    }

    fn console_write(&self, bytes: &[u8]) {
        // SAFETY: the hypervisor reads `len` bytes from a live slice.
        unsafe {
            hypercall3(
                HYPERVISOR_CONSOLE_IO,
                CONSOLEIO_WRITE,
                bytes.len() as u64,
                bytes.as_ptr() as u64,
            );
        }
    }

    fn read_tsc(&self) -> u64 {
        let low: u32;
        let high: u32;
        // SAFETY: RDTSC has no side effects; the result comes back in EDX:EAX.
        unsafe {
            asm!("rdtsc", out("eax") low, out("edx") high, options(nomem, nostack));
        }
        ((high as u64) << 32) | (low as u64)
    }
}
