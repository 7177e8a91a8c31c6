// =============================================================================
// micro-PV — Bare-Metal Glue
// =============================================================================
//
// Symbols the boot stub and the upcall stub call into, plus the singletons
// they operate on. Only built for the guest target.
//
//   micropv_start(start_info)      map shared pages, start the logger and
//                                  bring the runtime up
//   micropv_scheduler_init(t, y)   hand over the scheduler callbacks
//   do_hypervisor_callback(regs)   body of the event upcall
//
// The stub owns the assembly side: `hypervisor_callback` saves registers
// into a `RegisterFile` on the stack and calls `do_hypervisor_callback`;
// `failsafe_callback` handles a bad segment reload on the way back.
// =============================================================================

use core::panic::PanicInfo;

use khal::grant::{GrantTableArea, PAGE_SIZE};
use khal::store::StoreRing;
use khal::x86::XenHypercalls;
use khal::{Hypervisor, Mfn, SharedInfo, ShutdownReason, StartInfo};
use klog::{error, info};
use x86_64::VirtAddr;

use crate::arch::RegisterFile;
use crate::config::RuntimeConfig;
use crate::sched::{TimerCallback, YieldCallback};
use crate::{Platform, Runtime};

/// A static that is remapped onto a hypervisor frame and must therefore
/// own its whole page.
#[repr(C, align(4096))]
struct Page<T>(T);

const _: () = assert!(core::mem::size_of::<Page<SharedInfo>>() == PAGE_SIZE);
const _: () = assert!(core::mem::size_of::<Page<StoreRing>>() == PAGE_SIZE);

static HV: XenHypercalls = XenHypercalls;
static RUNTIME: Runtime<XenHypercalls> = Runtime::new();
static SHARED_INFO: Page<SharedInfo> = Page(SharedInfo::new());
static STORE_RING: Page<StoreRing> = Page(StoreRing::new());
static GRANT_AREA: GrantTableArea = GrantTableArea::new();

unsafe extern "C" {
    fn hypervisor_callback();
    fn failsafe_callback();
}

fn page_addr<T>(page: &'static Page<T>) -> VirtAddr {
    VirtAddr::from_ptr(page as *const Page<T>)
}

/// The runtime the glue brought up.
pub fn runtime() -> &'static Runtime<XenHypercalls> {
    &RUNTIME
}

/// Bring the runtime up with the default configuration. Returns 0 on
/// success; any failure is fatal and never returns.
///
/// # Safety
///
/// `start_info` must be the page the domain builder passed to the guest
/// and stay mapped for the life of the domain.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn micropv_start(start_info: *const StartInfo) -> i32 {
    let config = RuntimeConfig::DEFAULT;
    let _ = klog::init(&HV, config.log_level);

    // SAFETY: guaranteed by the caller.
    let Some(start_info) = (unsafe { start_info.as_ref() }) else {
        error!("no start info page");
        HV.sched_shutdown(ShutdownReason::Crash)
    };
    info!("booting on {}, {} pages", start_info.magic_str(), start_info.nr_pages);

    if let Err(err) = HV.update_va_mapping(page_addr(&SHARED_INFO), Mfn(start_info.shared_info >> 12)) {
        error!("cannot map shared info: {}", err);
        HV.sched_shutdown(ShutdownReason::Crash);
    }
    if start_info.store_port().is_some() {
        if let Err(err) = HV.update_va_mapping(page_addr(&STORE_RING), Mfn(start_info.store_mfn)) {
            error!("cannot map xenstore ring: {}", err);
            HV.sched_shutdown(ShutdownReason::Crash);
        }
    }

    let platform = Platform {
        hv: &HV,
        shared: &SHARED_INFO.0,
        start_info,
        store_ring: &STORE_RING.0,
        grant_area: &GRANT_AREA,
        event_entry: VirtAddr::new(hypervisor_callback as unsafe extern "C" fn() as usize as u64),
        failsafe_entry: VirtAddr::new(failsafe_callback as unsafe extern "C" fn() as usize as u64),
    };
    if let Err(err) = RUNTIME.start(platform, &config) {
        error!("bring-up failed: {}", err);
        HV.sched_shutdown(ShutdownReason::Crash);
    }
    0
}

/// Attach the scheduler. A failure leaves no tick and is fatal.
#[unsafe(no_mangle)]
pub extern "C" fn micropv_scheduler_init(timer: TimerCallback, yield_: YieldCallback) {
    if let Err(err) = RUNTIME.start_preemption(timer, yield_) {
        error!("scheduler hook failed: {}", err);
        HV.sched_shutdown(ShutdownReason::Crash);
    }
}

/// Called by `hypervisor_callback` with the saved register file.
///
/// # Safety
///
/// `regs` must point at the register file the stub saved for this upcall.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn do_hypervisor_callback(regs: *mut RegisterFile) {
    // SAFETY: guaranteed by the caller; the frame lives until we return.
    if let Some(regs) = unsafe { regs.as_mut() } {
        RUNTIME.dispatch(regs);
    }
}

#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
    match info.location() {
        Some(location) => error!("PANIC at {}:{}: {}", location.file(), location.line(), info.message()),
        None => error!("PANIC: {}", info.message()),
    }
    HV.sched_shutdown(ShutdownReason::Crash)
}
