// =============================================================================
// micro-PV — Preemption Hook
// =============================================================================
//
// The runtime has no scheduler of its own. It gives one built on top two
// entry points, both carrying the trapped register file:
//
//   timer   VIRQ_TIMER fired; a single-shot deadline elapsed
//   yield   the running context asked to give up the vCPU
//
// Both go through `context::switch_around`, so a switch requested by the
// timer and a switch requested by a yield are applied the same way.
//
// Timer flow:
//
//   1. elapsed  = deadline
//   2. deadline = first deadline + k·period strictly after now
//   3. arm the single-shot timer at the new deadline
//   4. refresh the clock shadow
//   5. run the timer callback; a non-zero return becomes the new period
//
// Yields travel over a loopback event channel: a port allocated for our own
// domain, connected back to ourselves with an interdomain bind. Sends go in
// on the allocated end and arrive on the bound end. Xen marks the bound end
// pending at bind time, so the first yield event after bring-up is spurious
// and gets dropped.
//
// The hypervisor refuses a single-shot deadline that is already in the past
// (-ETIME). When the vCPU loses the CPU between reading the clock and arming
// the timer, the deadline is recomputed against a fresh clock and armed
// again until it sticks.
// =============================================================================

mod context;

use core::fmt;
use core::marker::PhantomPinned;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, Ordering};

use khal::{DomId, HypercallError, Hypervisor, Port, ShutdownReason, Virq};
use klog::{debug, error, info, trace, warn};
use spin::{Mutex, Once};

use crate::arch::RegisterFile;
use crate::config::RuntimeConfig;
use crate::event::{EventChannels, EventContext, EventError};
use crate::time::Clock;

/// Timer callback: trapped registers and the deadline that elapsed. Returns
/// the next period in nanoseconds, or 0 to keep the current one.
pub type TimerCallback = fn(regs: &mut RegisterFile, elapsed: u64) -> u64;

/// Yield callback: trapped registers of the context that yielded.
pub type YieldCallback = fn(regs: &mut RegisterFile);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Binding the timer VIRQ or the yield port failed.
    Event(EventError),
    /// The hypervisor refused to arm the timer.
    Timer(HypercallError),
    /// [`Preemption::init`] has not run.
    NotInitialised,
}

impl From<EventError> for SchedError {
    fn from(err: EventError) -> Self {
        SchedError::Event(err)
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::Event(err) => write!(f, "preemption: {}", err),
            SchedError::Timer(err) => write!(f, "preemption timer: {}", err),
            SchedError::NotInitialised => f.write_str("preemption not initialised"),
        }
    }
}

/// First `deadline + k * period` (k ≥ 1) strictly after `now`.
pub fn next_deadline(deadline: u64, period: u64, now: u64) -> u64 {
    let period = period.max(1);
    let next = deadline.saturating_add(period);
    if next > now {
        return next;
    }
    let missed = (now - next) / period + 1;
    next.saturating_add(missed.saturating_mul(period))
}

#[derive(Debug, Clone, Copy)]
struct TimerState {
    deadline: u64,
    period: u64,
}

/// Both ends of the loopback yield channel.
#[derive(Debug, Clone, Copy)]
struct YieldChannel {
    /// Where `yield_now` sends.
    send: Port,
    /// Where the event arrives; carries the handler.
    receive: Port,
}

#[derive(Clone, Copy)]
struct Callbacks {
    timer: TimerCallback,
    yield_: YieldCallback,
}

pub struct Preemption<'a, H: Hypervisor> {
    hv: &'a H,
    events: &'a EventChannels<'a, H>,
    clock: &'a Clock<'a, H>,
    timer: Mutex<TimerState>,
    callbacks: Once<Callbacks>,
    timer_port: Once<Port>,
    yield_channel: Once<YieldChannel>,
    first_yield_seen: AtomicBool,
    /// The event bindings point back at us.
    _pin: PhantomPinned,
}

impl<'a, H: Hypervisor> Preemption<'a, H> {
    pub fn new(hv: &'a H, events: &'a EventChannels<'a, H>, clock: &'a Clock<'a, H>, config: &RuntimeConfig) -> Self {
        Self {
            hv,
            events,
            clock,
            timer: Mutex::new(TimerState {
                deadline: 0,
                period: config.timer_period_ns.max(1),
            }),
            callbacks: Once::new(),
            timer_port: Once::new(),
            yield_channel: Once::new(),
            first_yield_seen: AtomicBool::new(false),
            _pin: PhantomPinned,
        }
    }

    /// Take over the vCPU timer and the yield port, and arm the first tick.
    ///
    /// If the timer VIRQ cannot be bound the error is returned and no tick
    /// is armed.
    pub fn init(self: Pin<&Self>, timer: TimerCallback, yield_: YieldCallback) -> Result<(), SchedError> {
        let this = self.get_ref();
        this.callbacks.call_once(|| Callbacks { timer, yield_ });

        if let Err(err) = this.hv.vcpu_stop_periodic_timer(0) {
            warn!("preemption: could not stop periodic timer: {}", err);
        }

        let context = EventContext::new(this);
        let timer_port = this.events.bind_virq(Virq::Timer, on_timer::<H>, context).map_err(|err| {
            error!("preemption: cannot bind timer VIRQ: {}", err);
            SchedError::from(err)
        })?;
        this.timer_port.call_once(|| timer_port);

        let send = this.events.alloc_unbound(DomId::SELF)?;
        let receive = this.events.bind_interdomain(DomId::SELF, send)?;
        this.yield_channel.call_once(|| YieldChannel { send, receive });
        this.events.bind_channel(receive, on_yield::<H>, context)?;

        let deadline = {
            let _cs = this.events.critical_section();
            let mut state = this.timer.lock();
            state.deadline = this.clock.monotonic_ns().saturating_add(state.period);
            drop(state);
            this.arm()
        }
        .map_err(SchedError::Timer)?;

        info!("preemption: timer on {}, yield {} -> {}, first tick at {}ns", timer_port, send, receive, deadline);
        Ok(())
    }

    /// Arm the single-shot timer at the stored deadline. A deadline the
    /// clock overtook before the hypervisor saw it is moved to the next
    /// period boundary ahead of a fresh reading and armed again. Returns
    /// the deadline that was armed.
    fn arm(&self) -> Result<u64, HypercallError> {
        let mut deadline = self.timer.lock().deadline;
        loop {
            match self.hv.vcpu_set_singleshot_timer(0, deadline) {
                Ok(()) => return Ok(deadline),
                Err(HypercallError::ETIME) => {
                    let now = self.clock.monotonic_ns();
                    let mut state = self.timer.lock();
                    state.deadline = next_deadline(state.deadline, state.period, now);
                    debug!("preemption: {}ns already passed at {}ns, moving to {}ns", deadline, now, state.deadline);
                    deadline = state.deadline;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Absolute time of the armed tick.
    pub fn deadline(&self) -> u64 {
        let _cs = self.events.critical_section();
        let deadline = self.timer.lock().deadline;
        deadline
    }

    pub fn period(&self) -> u64 {
        let _cs = self.events.critical_section();
        let period = self.timer.lock().period;
        period
    }

    /// Ask the scheduler to switch away from the current context.
    pub fn yield_now(&self) -> Result<(), SchedError> {
        let channel = self.yield_channel.get().ok_or(SchedError::NotInitialised)?;
        self.events.notify(channel.send)?;
        Ok(())
    }

    /// Sleep until an unmasked event arrives.
    pub fn block(&self) {
        self.hv.sched_block();
    }

    /// Give the physical CPU back to the hypervisor without sleeping.
    pub fn relinquish(&self) {
        self.hv.sched_yield();
    }

    // ── Upcall side ────────────────────────────────────────────

    fn tick(&self, regs: Option<&mut RegisterFile>) {
        let now = self.clock.monotonic_ns();
        let elapsed = {
            let mut state = self.timer.lock();
            let elapsed = state.deadline;
            state.deadline = next_deadline(state.deadline, state.period, now);
            elapsed
        };
        if let Err(err) = self.arm() {
            // Without a timer there is no next tick and no way back in.
            error!("preemption: re-arming timer failed: {}", err);
            self.hv.sched_shutdown(ShutdownReason::Crash);
        }
        self.clock.update();

        let Some(regs) = regs else {
            trace!("preemption: tick at {}ns outside the upcall", elapsed);
            return;
        };
        let Some(callbacks) = self.callbacks.get().copied() else {
            return;
        };
        let period = context::switch_around(self.hv, regs, |regs| (callbacks.timer)(regs, elapsed));
        if period != 0 {
            self.timer.lock().period = period;
        }
    }

    fn yielded(&self, regs: Option<&mut RegisterFile>) {
        if !self.first_yield_seen.swap(true, Ordering::AcqRel) {
            debug!("preemption: dropping bind-time yield event");
            return;
        }
        let Some(regs) = regs else {
            debug!("preemption: yield outside the upcall, no context to switch");
            return;
        };
        if let Some(callbacks) = self.callbacks.get().copied() {
            context::switch_around(self.hv, regs, callbacks.yield_);
        }
    }
}

impl<H: Hypervisor> Drop for Preemption<'_, H> {
    fn drop(&mut self) {
        let receive = self.yield_channel.get().map(|channel| &channel.receive);
        for port in [self.timer_port.get(), receive].into_iter().flatten() {
            let _ = self.events.unbind(*port);
        }
    }
}

fn on_timer<H: Hypervisor>(_port: Port, regs: Option<&mut RegisterFile>, context: EventContext) {
    // SAFETY: bound in `Preemption::init` with a pinned `Preemption`, and
    // unbound before it drops.
    if let Some(this) = unsafe { context.get::<Preemption<'_, H>>() } {
        this.tick(regs);
    }
}

fn on_yield<H: Hypervisor>(_port: Port, regs: Option<&mut RegisterFile>, context: EventContext) {
    // SAFETY: as for `on_timer`.
    if let Some(this) = unsafe { context.get::<Preemption<'_, H>>() } {
        this.yielded(regs);
    }
}
