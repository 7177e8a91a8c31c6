// =============================================================================
// micro-PV — Event-Channel Dispatcher
// =============================================================================
//
// Xen delivers every event through a single upcall. Which ports fired is
// recorded in the shared info page as a two-level bitmap:
//
//   pending_sel (per vCPU)   one bit per 64-port bucket with work
//   evtchn_pending[word]     one bit per port
//   evtchn_mask[word]        one bit per port; masked ports never raise sel
//
// The dispatcher turns that into per-port handler calls. Upcall flow:
//
//   1. clear upcall_pending
//   2. swap pending_sel to 0
//   3. for each set selector bit, repeatedly take pending & !mask,
//      clear the lowest pending bit, then run its handler
//
// Clearing *before* the call means an event re-raised while the handler
// runs is seen on the next pass and not lost.
//
// Handlers are copied out of the table and run with no lock held, so they
// may bind, unbind or mask freely.
// =============================================================================

use core::fmt;

use khal::shared_info::{BITS_PER_WORD, NR_EVENT_CHANNELS};
use khal::{DomId, HypercallError, Hypervisor, Port, SharedInfo, Virq};
use klog::{debug, info, trace, warn};
use spin::Mutex;
use x86_64::VirtAddr;

use crate::arch::RegisterFile;
use crate::sync::{CriticalSection, Delivery};

/// Per-port event handler.
///
/// `regs` is the interrupted context when called from the upcall and
/// `None` when dispatch was forced from normal code (unmask or re-enable).
pub type Handler = fn(port: Port, regs: Option<&mut RegisterFile>, context: EventContext);

/// Opaque pointer handed back to a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventContext(*const ());

// SAFETY: the pointer is only dereferenced by the handler that registered
// it, on the single vCPU.
unsafe impl Send for EventContext {}
unsafe impl Sync for EventContext {}

impl EventContext {
    pub const NONE: EventContext = EventContext(core::ptr::null());

    pub fn new<T>(value: &T) -> Self {
        EventContext(value as *const T as *const ())
    }

    /// Recover the reference passed to [`EventContext::new`].
    ///
    /// # Safety
    ///
    /// `T` must be the type the context was created from, and the referent
    /// must still be alive.
    pub unsafe fn get<'t, T>(self) -> Option<&'t T> {
        // SAFETY: upheld by the caller.
        unsafe { self.0.cast::<T>().as_ref() }
    }
}

#[derive(Clone, Copy)]
struct Binding {
    handler: Handler,
    context: EventContext,
    count: u64,
    bound: bool,
}

const UNBOUND: Binding = Binding {
    handler: default_handler,
    context: EventContext::NONE,
    count: 0,
    bound: false,
};

fn default_handler(port: Port, _regs: Option<&mut RegisterFile>, _context: EventContext) {
    debug!("[{}] event received with no handler", port);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventError {
    /// Port outside the dispatcher's table.
    InvalidPort(Port),
    /// The hypervisor refused an event-channel operation.
    Hypervisor(HypercallError),
}

impl From<HypercallError> for EventError {
    fn from(err: HypercallError) -> Self {
        EventError::Hypervisor(err)
    }
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventError::InvalidPort(port) => write!(f, "{} out of range", port),
            EventError::Hypervisor(err) => write!(f, "event channel: {}", err),
        }
    }
}

#[inline]
fn check(port: Port) -> Result<(), EventError> {
    if port.index() < NR_EVENT_CHANNELS {
        Ok(())
    } else {
        Err(EventError::InvalidPort(port))
    }
}

/// Port → handler table plus the delivery controls of vCPU 0.
pub struct EventChannels<'a, H: Hypervisor> {
    hv: &'a H,
    shared: &'a SharedInfo,
    table: Mutex<[Binding; NR_EVENT_CHANNELS]>,
}

impl<'a, H: Hypervisor> EventChannels<'a, H> {
    pub const fn new(hv: &'a H, shared: &'a SharedInfo) -> Self {
        Self {
            hv,
            shared,
            table: Mutex::new([UNBOUND; NR_EVENT_CHANNELS]),
        }
    }

    /// Reset every binding, mask every port and register the upcall entry
    /// points.
    pub fn init(&self, event_entry: VirtAddr, failsafe_entry: VirtAddr) -> Result<(), EventError> {
        {
            let _cs = self.critical_section();
            let mut table = self.table.lock();
            table.iter_mut().for_each(|slot| *slot = UNBOUND);
        }
        for port in 0..NR_EVENT_CHANNELS as u32 {
            self.shared.set_mask(Port(port));
        }
        self.hv.set_callbacks(event_entry, failsafe_entry)?;
        info!("events: {} ports masked, callbacks registered", NR_EVENT_CHANNELS);
        Ok(())
    }

    #[inline]
    pub fn shared(&self) -> &'a SharedInfo {
        self.shared
    }

    #[inline]
    pub fn hv(&self) -> &'a H {
        self.hv
    }

    // ── Binding ────────────────────────────────────────────────

    /// Attach `handler` to `port`. The port's mask is left alone, so a
    /// freshly bound port stays masked until [`EventChannels::unmask`].
    pub fn bind(&self, port: Port, handler: Handler, context: EventContext) -> Result<Port, EventError> {
        check(port)?;
        let _cs = self.critical_section();
        let mut table = self.table.lock();
        let slot = &mut table[port.index()];
        if slot.bound {
            warn!("{} already has a handler, replacing it", port);
        }
        *slot = Binding {
            handler,
            context,
            count: 0,
            bound: true,
        };
        Ok(port)
    }

    /// Bind a virtual IRQ of vCPU 0 and unmask it.
    pub fn bind_virq(&self, virq: Virq, handler: Handler, context: EventContext) -> Result<Port, EventError> {
        let port = self.hv.evtchn_bind_virq(virq, 0)?;
        self.bind_channel(port, handler, context)
    }

    /// Bind an already-allocated port and unmask it.
    pub fn bind_channel(&self, port: Port, handler: Handler, context: EventContext) -> Result<Port, EventError> {
        self.bind(port, handler, context)?;
        self.unmask(port)?;
        debug!("bound {}", port);
        Ok(port)
    }

    /// Allocate a fresh local port that `remote` may connect to.
    pub fn alloc_unbound(&self, remote: DomId) -> Result<Port, EventError> {
        let port = self.hv.evtchn_alloc_unbound(remote)?;
        trace!("allocated {} for {}", port, remote);
        Ok(port)
    }

    /// Connect a fresh local port to `remote_port` of `remote`. The new
    /// port comes back already pending.
    pub fn bind_interdomain(&self, remote: DomId, remote_port: Port) -> Result<Port, EventError> {
        let port = self.hv.evtchn_bind_interdomain(remote, remote_port)?;
        trace!("{} connected to {}:{}", port, remote, remote_port);
        Ok(port)
    }

    /// Mask `port`, drop anything pending on it and restore the default
    /// handler. Unbinding an unbound port does nothing harmful.
    pub fn unbind(&self, port: Port) -> Result<(), EventError> {
        check(port)?;
        self.shared.set_mask(port);
        self.shared.clear_pending(port);
        let _cs = self.critical_section();
        self.table.lock()[port.index()] = UNBOUND;
        Ok(())
    }

    pub fn is_bound(&self, port: Port) -> bool {
        if port.index() >= NR_EVENT_CHANNELS {
            return false;
        }
        let _cs = self.critical_section();
        let bound = self.table.lock()[port.index()].bound;
        bound
    }

    /// Times the handler bound to `port` has run since it was bound.
    pub fn invocations(&self, port: Port) -> u64 {
        if port.index() >= NR_EVENT_CHANNELS {
            return 0;
        }
        let _cs = self.critical_section();
        let count = self.table.lock()[port.index()].count;
        count
    }

    // ── Per-port control ───────────────────────────────────────

    pub fn mask(&self, port: Port) -> Result<(), EventError> {
        check(port)?;
        self.shared.set_mask(port);
        Ok(())
    }

    /// Unmask `port`.
    ///
    /// The hypervisor only raises the selector when a port becomes pending
    /// while unmasked. If it fired while masked we raise the selector and
    /// upcall flag ourselves, and run dispatch now if delivery is enabled.
    pub fn unmask(&self, port: Port) -> Result<(), EventError> {
        check(port)?;
        self.shared.clear_mask(port);
        let vcpu = self.shared.vcpu(0);
        if self.shared.is_pending(port) && !vcpu.test_and_set_sel(port.index() / BITS_PER_WORD) {
            vcpu.set_upcall_pending();
            if !vcpu.upcalls_masked() {
                self.force_callback();
            }
        }
        Ok(())
    }

    /// Signal the other end of `port`.
    pub fn notify(&self, port: Port) -> Result<(), EventError> {
        self.hv.evtchn_send(port)?;
        Ok(())
    }

    // ── Delivery control ───────────────────────────────────────

    /// Mask the upcall for vCPU 0.
    pub fn disable_all(&self) {
        self.shared.vcpu(0).mask_upcalls();
    }

    /// Unmask the upcall and run whatever became pending while masked.
    pub fn enable_all(&self) {
        let vcpu = self.shared.vcpu(0);
        vcpu.unmask_upcalls();
        if vcpu.is_upcall_pending() {
            self.force_callback();
        }
    }

    /// Mask delivery until the returned guard drops.
    pub fn critical_section(&self) -> CriticalSection<'_> {
        CriticalSection::enter(self)
    }

    /// Run the upcall body from normal context, with the upcall masked so
    /// the hypervisor does not re-enter it.
    fn force_callback(&self) {
        let vcpu = self.shared.vcpu(0);
        let was_masked = vcpu.upcalls_masked();
        while vcpu.is_upcall_pending() {
            vcpu.mask_upcalls();
            self.dispatch_pending(None);
            if !was_masked {
                vcpu.unmask_upcalls();
            }
        }
    }

    // ── Upcall ─────────────────────────────────────────────────

    /// Body of the hypervisor upcall.
    pub fn dispatch_pending(&self, regs: Option<&mut RegisterFile>) {
        let mut regs = regs;
        let vcpu = self.shared.vcpu(0);
        vcpu.clear_upcall_pending();
        let mut selector = vcpu.take_pending_sel();

        while selector != 0 {
            let word = selector.trailing_zeros() as usize;
            selector &= selector - 1;
            loop {
                let active = self.shared.active_bits(word);
                if active == 0 {
                    break;
                }
                let port = Port((word * BITS_PER_WORD) as u32 + active.trailing_zeros());
                self.shared.clear_pending(port);
                self.run_handler(port, regs.as_deref_mut());
            }
        }
    }

    fn run_handler(&self, port: Port, regs: Option<&mut RegisterFile>) {
        if port.index() >= NR_EVENT_CHANNELS {
            warn!("dropping event on {}: beyond the handler table", port);
            return;
        }
        let (handler, context) = {
            let mut table = self.table.lock();
            let slot = &mut table[port.index()];
            slot.count += 1;
            (slot.handler, slot.context)
        };
        handler(port, regs, context);
    }
}

impl<H: Hypervisor> Delivery for EventChannels<'_, H> {
    fn disable(&self) -> bool {
        self.shared.vcpu(0).mask_upcalls()
    }

    fn enable(&self) {
        self.enable_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};
    use khal_mock::{Call, MockHypervisor, Op};

    fn setup() -> (&'static MockHypervisor, &'static EventChannels<'static, MockHypervisor>) {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        let events = Box::leak(Box::new(EventChannels::new(hv, hv.shared())));
        events.init(VirtAddr::new(0x1000), VirtAddr::new(0x2000)).unwrap();
        (hv, events)
    }

    fn count_calls(_port: Port, _regs: Option<&mut RegisterFile>, context: EventContext) {
        // SAFETY: every test registers an AtomicU32 it keeps alive.
        if let Some(counter) = unsafe { context.get::<AtomicU32>() } {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn init_masks_everything_and_registers_callbacks() {
        let (hv, events) = setup();
        assert!(hv.shared().is_masked(Port(0)));
        assert!(hv.shared().is_masked(Port(1023)));
        assert!(!events.is_bound(Port(4)));
        assert!(hv.calls().contains(&Call::SetCallbacks {
            event: 0x1000,
            failsafe: 0x2000,
        }));
    }

    #[test]
    fn single_event_runs_handler_once() {
        let (hv, events) = setup();
        let hits = Box::leak(Box::new(AtomicU32::new(0)));
        events.bind_channel(Port(5), count_calls, EventContext::new(hits)).unwrap();

        hv.raise(Port(5));
        events.dispatch_pending(None);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(events.invocations(Port(5)), 1);
        assert!(!hv.shared().is_pending(Port(5)));
        assert!(!hv.shared().vcpu(0).is_upcall_pending());
    }

    #[test]
    fn event_beyond_the_table_is_dropped_and_the_round_goes_on() {
        let (hv, events) = setup();
        let hits = Box::leak(Box::new(AtomicU32::new(0)));
        events.bind_channel(Port(5), count_calls, EventContext::new(hits)).unwrap();

        // Ports past the handler table are never masked by `init`.
        assert!(!hv.shared().is_masked(Port(1500)));
        hv.raise(Port(1500));
        hv.raise(Port(5));
        events.dispatch_pending(None);

        assert!(!hv.shared().is_pending(Port(1500)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(events.invocations(Port(1500)), 0);
        assert!(!hv.shared().vcpu(0).is_upcall_pending());
    }

    #[test]
    fn bind_rejects_ports_beyond_table() {
        let (_, events) = setup();
        assert_eq!(
            events.bind(Port(1024), count_calls, EventContext::NONE),
            Err(EventError::InvalidPort(Port(1024)))
        );
    }

    #[test]
    fn bind_leaves_port_masked() {
        let (hv, events) = setup();
        let hits = Box::leak(Box::new(AtomicU32::new(0)));
        events.bind(Port(9), count_calls, EventContext::new(hits)).unwrap();
        hv.raise(Port(9));
        events.dispatch_pending(None);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(hv.shared().is_pending(Port(9)));
    }

    #[test]
    fn unmask_replays_event_that_fired_while_masked() {
        let (hv, events) = setup();
        let hits = Box::leak(Box::new(AtomicU32::new(0)));
        events.bind(Port(9), count_calls, EventContext::new(hits)).unwrap();
        hv.raise(Port(9));

        events.unmask(Port(9)).unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!hv.shared().vcpu(0).upcalls_masked());
    }

    #[test]
    fn unmask_with_delivery_disabled_defers_to_enable_all() {
        let (hv, events) = setup();
        let hits = Box::leak(Box::new(AtomicU32::new(0)));
        events.bind(Port(70), count_calls, EventContext::new(hits)).unwrap();
        hv.raise(Port(70));

        events.disable_all();
        events.unmask(Port(70)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(hv.shared().vcpu(0).is_upcall_pending());

        events.enable_all();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn critical_section_holds_events_until_dropped() {
        let (hv, events) = setup();
        let hits = Box::leak(Box::new(AtomicU32::new(0)));
        events.bind_channel(Port(12), count_calls, EventContext::new(hits)).unwrap();
        {
            let _cs = events.critical_section();
            {
                let _inner = events.critical_section();
            }
            assert!(hv.shared().vcpu(0).upcalls_masked());
            hv.raise(Port(12));
            assert_eq!(hits.load(Ordering::SeqCst), 0);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!hv.shared().vcpu(0).upcalls_masked());
    }

    #[test]
    fn rebinding_replaces_handler_and_resets_count() {
        let (hv, events) = setup();
        let first = Box::leak(Box::new(AtomicU32::new(0)));
        let second = Box::leak(Box::new(AtomicU32::new(0)));
        events.bind_channel(Port(3), count_calls, EventContext::new(first)).unwrap();
        hv.raise(Port(3));
        events.dispatch_pending(None);

        events.bind(Port(3), count_calls, EventContext::new(second)).unwrap();
        assert_eq!(events.invocations(Port(3)), 0);
        hv.raise(Port(3));
        events.dispatch_pending(None);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unbind_is_idempotent_and_masks() {
        let (hv, events) = setup();
        events.bind_channel(Port(6), count_calls, EventContext::NONE).unwrap();
        hv.raise(Port(6));
        events.unbind(Port(6)).unwrap();
        events.unbind(Port(6)).unwrap();
        assert!(!events.is_bound(Port(6)));
        assert!(hv.shared().is_masked(Port(6)));
        assert!(!hv.shared().is_pending(Port(6)));
    }

    #[test]
    fn handler_may_unbind_its_own_port() {
        fn unbind_self(port: Port, _regs: Option<&mut RegisterFile>, context: EventContext) {
            // SAFETY: registered below with the leaked dispatcher.
            let events = unsafe { context.get::<EventChannels<'static, MockHypervisor>>() };
            if let Some(events) = events {
                events.unbind(port).unwrap();
            }
        }
        let (hv, events) = setup();
        events.bind_channel(Port(8), unbind_self, EventContext::new(events)).unwrap();
        hv.raise(Port(8));
        events.dispatch_pending(None);
        assert!(!events.is_bound(Port(8)));
    }

    #[test]
    fn pending_bit_is_clear_when_handler_runs() {
        fn observe(port: Port, _regs: Option<&mut RegisterFile>, context: EventContext) {
            // SAFETY: registered below with the leaked mock.
            let hv = unsafe { context.get::<MockHypervisor>() };
            if let Some(hv) = hv {
                assert!(!hv.shared().is_pending(port));
            }
        }
        let (hv, events) = setup();
        events.bind_channel(Port(40), observe, EventContext::new(hv)).unwrap();
        hv.raise(Port(40));
        events.dispatch_pending(None);
        assert_eq!(events.invocations(Port(40)), 1);
    }

    #[test]
    fn upcall_passes_register_file_to_handler() {
        fn bump_rax(_port: Port, regs: Option<&mut RegisterFile>, _context: EventContext) {
            if let Some(regs) = regs {
                regs.rax += 1;
            }
        }
        let (hv, events) = setup();
        events.bind_channel(Port(2), bump_rax, EventContext::NONE).unwrap();
        events.bind_channel(Port(65), bump_rax, EventContext::NONE).unwrap();
        hv.raise(Port(2));
        hv.raise(Port(65));

        let mut regs = RegisterFile::default();
        events.dispatch_pending(Some(&mut regs));
        assert_eq!(regs.rax, 2);
    }

    #[test]
    fn refused_virq_binding_is_reported() {
        let (hv, events) = setup();
        hv.fail(Op::EvtchnBindVirq, HypercallError::EINVAL);
        assert_eq!(
            events.bind_virq(Virq::Timer, count_calls, EventContext::NONE),
            Err(EventError::Hypervisor(HypercallError::EINVAL))
        );
    }

    #[test]
    fn notify_sends_on_port() {
        let (hv, events) = setup();
        events.notify(Port(17)).unwrap();
        assert_eq!(hv.count(|c| *c == Call::EvtchnSend(Port(17))), 1);
    }
}
