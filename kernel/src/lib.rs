// =============================================================================
// micro-PV — Guest Runtime Core
// =============================================================================
//
// Turns the raw Xen PV primitives into services a guest kernel can use:
//
//   event     one hypervisor upcall → per-port handlers
//   grant     share our frames with peers, map frames peers shared
//   store     xenstore requests and transactions over the shared ring
//   sched     timer and yield entry points for a scheduler built on top
//   time      monotonic and wall-clock time from the shared info page
//
// Bring-up order (`Runtime::start`):
//
//   events → clock → store → grants
//
// Preemption comes last and separately (`Runtime::start_preemption`)
// because it needs the scheduler's callbacks.
//
// Single vCPU throughout. Everything touched from both normal context and
// the upcall is guarded by a `sync::CriticalSection`.
// =============================================================================

#![cfg_attr(not(test), no_std)]

pub mod arch;
pub mod config;
pub mod event;
pub mod grant;
pub mod sched;
pub mod store;
pub mod sync;
pub mod time;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod entry;

use core::fmt;
use core::pin::Pin;

use khal::grant::GrantTableArea;
use khal::store::StoreRing;
use khal::{Hypervisor, SharedInfo, StartInfo};
use klog::info;
use spin::Once;
use x86_64::VirtAddr;

use crate::arch::RegisterFile;
use crate::config::RuntimeConfig;
use crate::event::{EventChannels, EventError};
use crate::grant::{GrantError, GrantTable};
use crate::sched::{Preemption, SchedError, TimerCallback, YieldCallback};
use crate::store::{Store, StoreError};
use crate::time::Clock;

/// Pages and entry points the boot code hands to [`Runtime::start`].
pub struct Platform<H: Hypervisor + 'static> {
    pub hv: &'static H,
    /// Shared info page, already mapped.
    pub shared: &'static SharedInfo,
    pub start_info: &'static StartInfo,
    /// Xenstore ring, already mapped if the builder advertised one.
    pub store_ring: &'static StoreRing,
    /// Virtual range the grant-table frames get mapped over.
    pub grant_area: &'static GrantTableArea,
    /// Upcall entry stub.
    pub event_entry: VirtAddr,
    /// Entry for faults on a bad segment reload in the upcall return path.
    pub failsafe_entry: VirtAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    AlreadyStarted,
    /// [`Runtime::start_preemption`] before [`Runtime::start`].
    NotStarted,
    Event(EventError),
    Store(StoreError),
    Grant(GrantError),
    Sched(SchedError),
}

impl From<EventError> for StartError {
    fn from(err: EventError) -> Self {
        StartError::Event(err)
    }
}

impl From<StoreError> for StartError {
    fn from(err: StoreError) -> Self {
        StartError::Store(err)
    }
}

impl From<GrantError> for StartError {
    fn from(err: GrantError) -> Self {
        StartError::Grant(err)
    }
}

impl From<SchedError> for StartError {
    fn from(err: SchedError) -> Self {
        StartError::Sched(err)
    }
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::AlreadyStarted => f.write_str("runtime already started"),
            StartError::NotStarted => f.write_str("runtime not started"),
            StartError::Event(err) => write!(f, "{}", err),
            StartError::Store(err) => write!(f, "{}", err),
            StartError::Grant(err) => write!(f, "{}", err),
            StartError::Sched(err) => write!(f, "{}", err),
        }
    }
}

/// The runtime's components, each filled in once during bring-up.
pub struct Runtime<H: Hypervisor + 'static> {
    events: Once<EventChannels<'static, H>>,
    clock: Once<Clock<'static, H>>,
    store: Once<Store<'static, H>>,
    grants: Once<GrantTable<'static, H>>,
    preemption: Once<Preemption<'static, H>>,
    config: Once<RuntimeConfig>,
}

impl<H: Hypervisor + 'static> Runtime<H> {
    pub const fn new() -> Self {
        Self {
            events: Once::new(),
            clock: Once::new(),
            store: Once::new(),
            grants: Once::new(),
            preemption: Once::new(),
            config: Once::new(),
        }
    }

    /// Bring up events, the clock, xenstore and the grant table, in that
    /// order.
    ///
    /// A guest without a xenstore channel still starts; its store calls
    /// fail with [`StoreError::NotConnected`].
    pub fn start(&'static self, platform: Platform<H>, config: &RuntimeConfig) -> Result<(), StartError> {
        if self.config.is_completed() {
            return Err(StartError::AlreadyStarted);
        }
        let config = *self.config.call_once(|| *config);
        let Platform {
            hv,
            shared,
            start_info,
            store_ring,
            grant_area,
            event_entry,
            failsafe_entry,
        } = platform;

        let events = self.events.call_once(|| EventChannels::new(hv, shared));
        events.init(event_entry, failsafe_entry)?;
        events.enable_all();

        self.clock.call_once(|| Clock::new(hv, shared, events));

        let store = self
            .store
            .call_once(|| Store::new(hv, events, store_ring, start_info, &config));
        Pin::static_ref(store).init()?;

        let grants = GrantTable::init(hv, events, grant_area, &config)?;
        let grants = self.grants.call_once(|| grants);

        info!(
            "micro-PV up: {}, dom{}, grants v{}",
            start_info.magic_str(),
            store.domain_id().map_or(-1, |d| i32::from(d.0)),
            grants.version()
        );
        Ok(())
    }

    /// Hook the scheduler's callbacks to the timer and yield events and arm
    /// the first tick.
    pub fn start_preemption(&'static self, timer: TimerCallback, yield_: YieldCallback) -> Result<(), StartError> {
        let (Some(events), Some(clock), Some(config)) = (self.events.get(), self.clock.get(), self.config.get())
        else {
            return Err(StartError::NotStarted);
        };
        if self.preemption.is_completed() {
            return Err(StartError::AlreadyStarted);
        }
        let preemption = self
            .preemption
            .call_once(|| Preemption::new(events.hv(), events, clock, config));
        Pin::static_ref(preemption).init(timer, yield_)?;
        Ok(())
    }

    /// Upcall body. Events arriving before bring-up are left pending.
    pub fn dispatch(&self, regs: &mut RegisterFile) {
        if let Some(events) = self.events.get() {
            events.dispatch_pending(Some(regs));
        }
    }

    pub fn events(&self) -> Option<&EventChannels<'static, H>> {
        self.events.get()
    }

    pub fn clock(&self) -> Option<&Clock<'static, H>> {
        self.clock.get()
    }

    pub fn store(&self) -> Option<&Store<'static, H>> {
        self.store.get()
    }

    pub fn grants(&self) -> Option<&GrantTable<'static, H>> {
        self.grants.get()
    }

    pub fn preemption(&self) -> Option<&Preemption<'static, H>> {
        self.preemption.get()
    }
}

impl<H: Hypervisor + 'static> Default for Runtime<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use khal::store::XBT_NIL;
    use khal::{DomId, HypercallError, Port, Virq};
    use khal_mock::{Call, MockHypervisor, Op};

    type TestRuntime = Runtime<MockHypervisor>;

    fn platform(hv: &'static MockHypervisor, start_info: StartInfo) -> Platform<MockHypervisor> {
        Platform {
            hv,
            shared: hv.shared(),
            start_info: Box::leak(Box::new(start_info)),
            store_ring: hv.store_ring(),
            grant_area: Box::leak(Box::new(GrantTableArea::new())),
            event_entry: VirtAddr::new(0x1000),
            failsafe_entry: VirtAddr::new(0x2000),
        }
    }

    fn started() -> (&'static MockHypervisor, &'static TestRuntime) {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        let runtime: &'static TestRuntime = Box::leak(Box::new(Runtime::new()));
        runtime
            .start(platform(hv, hv.start_info()), &RuntimeConfig::DEFAULT)
            .unwrap();
        (hv, runtime)
    }

    fn tick(_regs: &mut RegisterFile, _elapsed: u64) -> u64 {
        0
    }

    fn yielded(_regs: &mut RegisterFile) {}

    #[test]
    fn start_brings_components_up_in_order() {
        let (hv, runtime) = started();
        let calls = hv.calls();
        let callbacks = calls
            .iter()
            .position(|c| matches!(c, Call::SetCallbacks { .. }))
            .unwrap();
        let store = calls.iter().position(|c| *c == Call::EvtchnSend(khal_mock::STORE_PORT)).unwrap();
        let grants = calls.iter().position(|c| matches!(c, Call::GnttabSetupTable(_))).unwrap();
        assert!(callbacks < store && store < grants);

        assert_eq!(runtime.store().unwrap().domain_id(), Some(DomId(khal_mock::GUEST_DOMID)));
        assert_eq!(runtime.grants().unwrap().version(), 2);
        assert!(runtime.preemption().is_none());
    }

    #[test]
    fn start_twice_is_refused() {
        let (hv, runtime) = started();
        assert_eq!(
            runtime.start(platform(hv, hv.start_info()), &RuntimeConfig::DEFAULT),
            Err(StartError::AlreadyStarted)
        );
    }

    #[test]
    fn guest_without_store_still_starts() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        let runtime: &'static TestRuntime = Box::leak(Box::new(Runtime::new()));
        runtime
            .start(platform(hv, StartInfo::empty()), &RuntimeConfig::DEFAULT)
            .unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            runtime.store().unwrap().read(XBT_NIL, "domid", &mut buf),
            Err(StoreError::NotConnected)
        );
        assert!(runtime.grants().is_some());
    }

    #[test]
    fn grant_failure_aborts_start() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        hv.fail(Op::GnttabSetupTable, HypercallError::ENOMEM);
        let runtime: &'static TestRuntime = Box::leak(Box::new(Runtime::new()));
        assert_eq!(
            runtime.start(platform(hv, hv.start_info()), &RuntimeConfig::DEFAULT),
            Err(StartError::Grant(GrantError::Hypervisor(HypercallError::ENOMEM)))
        );
        assert!(runtime.grants().is_none());
    }

    #[test]
    fn preemption_needs_a_started_runtime() {
        let runtime: &'static TestRuntime = Box::leak(Box::new(Runtime::new()));
        assert_eq!(runtime.start_preemption(tick, yielded), Err(StartError::NotStarted));
    }

    #[test]
    fn preemption_arms_the_timer() {
        let (hv, runtime) = started();
        runtime.start_preemption(tick, yielded).unwrap();
        assert!(hv.virq_port(Virq::Timer).is_some());
        assert_eq!(hv.timer_deadline(), Some(RuntimeConfig::DEFAULT.timer_period_ns));
        assert_eq!(runtime.start_preemption(tick, yielded), Err(StartError::AlreadyStarted));
    }

    fn mark_rax(port: Port, regs: Option<&mut RegisterFile>, _context: event::EventContext) {
        if let Some(regs) = regs {
            regs.rax = u64::from(port.0);
        }
    }

    #[test]
    fn dispatch_reaches_bound_handlers() {
        let (hv, runtime) = started();
        let events = runtime.events().unwrap();
        events.bind_channel(Port(40), mark_rax, event::EventContext::NONE).unwrap();
        hv.raise(Port(40));
        let mut regs = RegisterFile::default();
        runtime.dispatch(&mut regs);
        assert_eq!(regs.rax, 40);
        assert_eq!(events.invocations(Port(40)), 1);
    }
}
