//! Mock hypervisor for testing micro-PV.
//!
//! Implements [`khal::Hypervisor`] in-process so the event, grant, store
//! and timer code can run under `cargo test` without Xen:
//!
//! - every hypercall is recorded in order ([`Call`]) and can be made to fail;
//! - event delivery goes through a real [`SharedInfo`] owned by the mock;
//! - channels follow Xen's states: a send on an unbound port is dropped,
//!   and binding the other end marks the new local port pending;
//! - the TSC is a counter the test advances, with the vCPU time record set
//!   up so one tick is one nanosecond;
//! - peer grants can be offered and are mapped with real status codes;
//! - a [`StoreDaemon`] serves the xenstore ring whenever the guest yields
//!   or notifies the store port.

pub mod xenstore;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use khal::grant::{GrantStatus, MapFlags, MapGrantRef, UnmapGrantRef};
use khal::shared_info::TimeRecord;
use khal::store::StoreRing;
use khal::{DomId, HvResult, HypercallError, Hypervisor, Mfn, Port, SharedInfo, ShutdownReason, StartInfo, Virq};
use x86_64::VirtAddr;

pub use xenstore::{StoreDaemon, StoreRequest};

/// Port the simulated domain builder advertises for xenstore.
pub const STORE_PORT: Port = Port(1);

/// Machine frame of the simulated xenstore page.
pub const STORE_MFN: Mfn = Mfn(0xfeff0);

/// Domain id of the guest under test.
pub const GUEST_DOMID: u16 = 3;

/// First machine frame handed out by `GNTTABOP_setup_table`.
pub const GRANT_FRAME_BASE: u64 = 0x8000;

/// First machine frame handed out by `GNTTABOP_get_status_frames`.
pub const STATUS_FRAME_BASE: u64 = 0x9000;

/// A recorded hypercall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    EvtchnSend(Port),
    EvtchnAllocUnbound(DomId),
    EvtchnBindInterdomain(DomId, Port),
    EvtchnBindVirq(Virq, u32),
    SetCallbacks { event: u64, failsafe: u64 },
    GnttabSetVersion(u32),
    GnttabGetVersion,
    GnttabSetupTable(usize),
    GnttabGetStatusFrames(usize),
    GnttabMapGrantRef { dom: u16, gref: u32 },
    GnttabUnmapGrantRef { handle: u32 },
    UpdateVaMapping { va: u64, mfn: Mfn },
    SetSingleshotTimer(u64),
    StopPeriodicTimer,
    Yield,
    Block,
    Shutdown(ShutdownReason),
    StackSwitch { ss: u64, sp: u64 },
    FpuTaskswitch(bool),
}

/// Hypercalls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    EvtchnSend,
    EvtchnAllocUnbound,
    EvtchnBindInterdomain,
    EvtchnBindVirq,
    SetCallbacks,
    GnttabSetVersion,
    GnttabSetupTable,
    GnttabGetStatusFrames,
    GnttabMapGrantRef,
    UpdateVaMapping,
    SetSingleshotTimer,
    StackSwitch,
}

#[derive(Debug, Clone, Copy)]
struct OfferedGrant {
    frame: u64,
    readonly: bool,
}

struct State {
    calls: Vec<Call>,
    failures: BTreeMap<Op, HypercallError>,
    one_shot_failures: BTreeMap<Op, HypercallError>,
    next_port: u32,
    /// Ports allocated for our own domain and not yet connected.
    unbound: BTreeSet<u32>,
    /// Connected loopback pairs, both directions.
    peers: BTreeMap<u32, u32>,
    virqs: BTreeMap<u32, Port>,
    max_grant_version: u32,
    grant_version: u32,
    offered: BTreeMap<(u16, u32), OfferedGrant>,
    mapped: BTreeMap<u32, (u16, u32)>,
    next_handle: u32,
    timer_deadline: Option<u64>,
    console: Vec<u8>,
    store: StoreDaemon,
}

type Upcall = Arc<dyn Fn() + Send + Sync>;

pub struct MockHypervisor {
    shared: Box<SharedInfo>,
    ring: Box<StoreRing>,
    tsc: AtomicU64,
    state: Mutex<State>,
    upcall: Mutex<Option<Upcall>>,
}

impl MockHypervisor {
    /// A hypervisor offering grant-table v2 and a populated xenstore.
    pub fn new() -> Self {
        let shared = Box::new(SharedInfo::new());
        shared.vcpu(0).time.publish(&TimeRecord {
            version: 0,
            tsc_timestamp: 0,
            system_time: 0,
            tsc_to_system_mul: 1 << 31,
            tsc_shift: 1,
        });
        Self {
            shared,
            ring: Box::new(StoreRing::new()),
            tsc: AtomicU64::new(0),
            state: Mutex::new(State {
                calls: Vec::new(),
                failures: BTreeMap::new(),
                one_shot_failures: BTreeMap::new(),
                next_port: STORE_PORT.0 + 1,
                unbound: BTreeSet::new(),
                peers: BTreeMap::new(),
                virqs: BTreeMap::new(),
                max_grant_version: 2,
                grant_version: 1,
                offered: BTreeMap::new(),
                mapped: BTreeMap::new(),
                next_handle: 1,
                timer_deadline: None,
                console: Vec::new(),
                store: StoreDaemon::new(GUEST_DOMID),
            }),
            upcall: Mutex::new(None),
        }
    }

    /// Like [`MockHypervisor::new`] but only grant-table v1 is available.
    pub fn v1_only() -> Self {
        let mock = Self::new();
        mock.lock().max_grant_version = 1;
        mock
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: Call, op: Option<Op>) -> HvResult<()> {
        let mut state = self.lock();
        state.calls.push(call);
        let Some(op) = op else { return Ok(()) };
        if let Some(err) = state.one_shot_failures.remove(&op) {
            return Err(err);
        }
        match state.failures.get(&op).copied() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn pump_store(&self) {
        let published = self.lock().store.pump(&self.ring);
        if published {
            self.shared.raise(STORE_PORT, 0);
        }
    }

    /// Run the guest's upcall on return from a hypercall, as the
    /// hypervisor does, while an upcall is owed and vCPU 0 has not masked it.
    fn deliver(&self) {
        let vcpu = self.shared.vcpu(0);
        while vcpu.is_upcall_pending() && !vcpu.upcalls_masked() {
            let hook = self.upcall.lock().unwrap_or_else(|p| p.into_inner()).clone();
            let Some(hook) = hook else { return };
            vcpu.mask_upcalls();
            hook();
            vcpu.unmask_upcalls();
        }
    }

    // --- Shared pages ---

    pub fn shared(&self) -> &SharedInfo {
        &self.shared
    }

    pub fn store_ring(&self) -> &StoreRing {
        &self.ring
    }

    /// Start info advertising the simulated xenstore.
    pub fn start_info(&self) -> StartInfo {
        StartInfo::empty().with_store(STORE_MFN, STORE_PORT)
    }

    // --- Test controls ---

    /// Install the guest's upcall entry. Without one, events only mark the
    /// shared info page and the test dispatches by hand.
    pub fn set_upcall(&self, upcall: impl Fn() + Send + Sync + 'static) {
        *self.upcall.lock().unwrap_or_else(|p| p.into_inner()) = Some(Arc::new(upcall));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    /// Make every later `op` fail with `err`.
    pub fn fail(&self, op: Op, err: HypercallError) {
        self.lock().failures.insert(op, err);
    }

    /// Make only the next `op` fail with `err`.
    pub fn fail_once(&self, op: Op, err: HypercallError) {
        self.lock().one_shot_failures.insert(op, err);
    }

    pub fn clear_failure(&self, op: Op) {
        self.lock().failures.remove(&op);
    }

    pub fn set_tsc(&self, value: u64) {
        self.tsc.store(value, Ordering::SeqCst);
    }

    pub fn advance_tsc(&self, delta: u64) {
        self.tsc.fetch_add(delta, Ordering::SeqCst);
    }

    /// Deadline of the most recent single-shot timer request.
    pub fn timer_deadline(&self) -> Option<u64> {
        self.lock().timer_deadline
    }

    /// Port bound to `virq`, if the guest bound it.
    pub fn virq_port(&self, virq: Virq) -> Option<Port> {
        self.lock().virqs.get(&(virq as u32)).copied()
    }

    /// Deliver `virq` to vCPU 0.
    pub fn raise_virq(&self, virq: Virq) {
        if let Some(port) = self.virq_port(virq) {
            self.shared.raise(port, 0);
        }
    }

    /// Deliver an event on `port` as if a peer had signalled it.
    pub fn raise(&self, port: Port) {
        self.shared.raise(port, 0);
    }

    /// Let domain `dom` offer grant `gref` on machine frame `frame`.
    pub fn offer_grant(&self, dom: DomId, gref: u32, frame: u64, readonly: bool) {
        self.lock().offered.insert((dom.0, gref), OfferedGrant { frame, readonly });
    }

    pub fn mapped_handles(&self) -> usize {
        self.lock().mapped.len()
    }

    pub fn console_output(&self) -> String {
        String::from_utf8_lossy(&self.lock().console).into_owned()
    }

    /// Access the xenstore daemon.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut StoreDaemon) -> R) -> R {
        f(&mut self.lock().store)
    }
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Hypervisor for MockHypervisor {
    fn evtchn_send(&self, port: Port) -> HvResult<()> {
        self.record(Call::EvtchnSend(port), Some(Op::EvtchnSend))?;
        if port == STORE_PORT {
            self.pump_store();
        } else {
            // Unbound or unknown ports swallow the send.
            let peer = self.lock().peers.get(&port.0).copied();
            if let Some(peer) = peer {
                self.shared.raise(Port(peer), 0);
            }
        }
        self.deliver();
        Ok(())
    }

    fn evtchn_alloc_unbound(&self, remote: DomId) -> HvResult<Port> {
        self.record(Call::EvtchnAllocUnbound(remote), Some(Op::EvtchnAllocUnbound))?;
        let mut state = self.lock();
        let port = Port(state.next_port);
        state.next_port += 1;
        if remote == DomId::SELF {
            state.unbound.insert(port.0);
        }
        Ok(port)
    }

    fn evtchn_bind_interdomain(&self, remote: DomId, remote_port: Port) -> HvResult<Port> {
        self.record(
            Call::EvtchnBindInterdomain(remote, remote_port),
            Some(Op::EvtchnBindInterdomain),
        )?;
        let local = {
            let mut state = self.lock();
            if remote != DomId::SELF || !state.unbound.remove(&remote_port.0) {
                return Err(HypercallError::EINVAL);
            }
            let local = Port(state.next_port);
            state.next_port += 1;
            state.peers.insert(local.0, remote_port.0);
            state.peers.insert(remote_port.0, local.0);
            local
        };
        self.shared.raise(local, 0);
        Ok(local)
    }

    fn evtchn_bind_virq(&self, virq: Virq, vcpu: u32) -> HvResult<Port> {
        self.record(Call::EvtchnBindVirq(virq, vcpu), Some(Op::EvtchnBindVirq))?;
        let mut state = self.lock();
        let port = Port(state.next_port);
        state.next_port += 1;
        state.virqs.insert(virq as u32, port);
        Ok(port)
    }

    fn set_callbacks(&self, event: VirtAddr, failsafe: VirtAddr) -> HvResult<()> {
        self.record(
            Call::SetCallbacks {
                event: event.as_u64(),
                failsafe: failsafe.as_u64(),
            },
            Some(Op::SetCallbacks),
        )
    }

    fn gnttab_set_version(&self, version: u32) -> HvResult<()> {
        self.record(Call::GnttabSetVersion(version), Some(Op::GnttabSetVersion))?;
        let mut state = self.lock();
        if version == 0 || version > state.max_grant_version {
            return Err(HypercallError::EINVAL);
        }
        state.grant_version = version;
        Ok(())
    }

    fn gnttab_get_version(&self) -> HvResult<u32> {
        self.record(Call::GnttabGetVersion, None)?;
        Ok(self.lock().grant_version)
    }

    fn gnttab_setup_table(&self, frames: &mut [Mfn]) -> HvResult<()> {
        self.record(Call::GnttabSetupTable(frames.len()), Some(Op::GnttabSetupTable))?;
        for (i, frame) in frames.iter_mut().enumerate() {
            *frame = Mfn(GRANT_FRAME_BASE + i as u64);
        }
        Ok(())
    }

    fn gnttab_get_status_frames(&self, frames: &mut [Mfn]) -> HvResult<()> {
        self.record(Call::GnttabGetStatusFrames(frames.len()), Some(Op::GnttabGetStatusFrames))?;
        if self.lock().grant_version != 2 {
            return Err(HypercallError::EINVAL);
        }
        for (i, frame) in frames.iter_mut().enumerate() {
            *frame = Mfn(STATUS_FRAME_BASE + i as u64);
        }
        Ok(())
    }

    fn gnttab_map_grant_ref(&self, op: &mut MapGrantRef) -> HvResult<()> {
        self.record(
            Call::GnttabMapGrantRef {
                dom: op.dom,
                gref: op.gref,
            },
            Some(Op::GnttabMapGrantRef),
        )?;
        let mut state = self.lock();
        let Some(offer) = state.offered.get(&(op.dom, op.gref)).copied() else {
            op.status = GrantStatus::BAD_GNTREF.0;
            return Ok(());
        };
        let flags = MapFlags::from_bits_truncate(op.flags);
        if offer.readonly && !flags.contains(MapFlags::READONLY) {
            op.status = GrantStatus::PERMISSION_DENIED.0;
            return Ok(());
        }
        let handle = state.next_handle;
        state.next_handle += 1;
        state.mapped.insert(handle, (op.dom, op.gref));
        op.handle = handle;
        op.dev_bus_addr = offer.frame << 12;
        op.status = GrantStatus::OKAY.0;
        Ok(())
    }

    fn gnttab_unmap_grant_ref(&self, op: &mut UnmapGrantRef) -> HvResult<()> {
        self.record(Call::GnttabUnmapGrantRef { handle: op.handle }, None)?;
        let mut state = self.lock();
        op.status = match state.mapped.remove(&op.handle) {
            Some(_) => GrantStatus::OKAY.0,
            None => GrantStatus::BAD_HANDLE.0,
        };
        Ok(())
    }

    fn update_va_mapping(&self, va: VirtAddr, mfn: Mfn) -> HvResult<()> {
        self.record(
            Call::UpdateVaMapping {
                va: va.as_u64(),
                mfn,
            },
            Some(Op::UpdateVaMapping),
        )
    }

    fn vcpu_set_singleshot_timer(&self, _vcpu: u32, deadline_ns: u64) -> HvResult<()> {
        self.record(Call::SetSingleshotTimer(deadline_ns), Some(Op::SetSingleshotTimer))?;
        if deadline_ns < self.tsc.load(Ordering::SeqCst) {
            return Err(HypercallError::ETIME);
        }
        self.lock().timer_deadline = Some(deadline_ns);
        Ok(())
    }

    fn vcpu_stop_periodic_timer(&self, _vcpu: u32) -> HvResult<()> {
        self.record(Call::StopPeriodicTimer, None)
    }

    fn sched_yield(&self) {
        let _ = self.record(Call::Yield, None);
        self.pump_store();
        self.deliver();
    }

    fn sched_block(&self) {
        let _ = self.record(Call::Block, None);
        self.pump_store();
        let deadline = self.lock().timer_deadline.take();
        if let Some(deadline) = deadline {
            if self.tsc.load(Ordering::SeqCst) < deadline {
                self.set_tsc(deadline);
            }
            self.raise_virq(Virq::Timer);
        }
        self.deliver();
    }

    fn sched_shutdown(&self, reason: ShutdownReason) -> ! {
        let _ = self.record(Call::Shutdown(reason), None);
        panic!("domain shutdown: {:?}", reason);
    }

    fn stack_switch(&self, ss: u64, sp: u64) -> HvResult<()> {
        self.record(Call::StackSwitch { ss, sp }, Some(Op::StackSwitch))
    }

    fn fpu_taskswitch(&self, set: bool) -> HvResult<()> {
        self.record(Call::FpuTaskswitch(set), None)
    }

    fn console_write(&self, bytes: &[u8]) {
        self.lock().console.extend_from_slice(bytes);
    }

    fn read_tsc(&self) -> u64 {
        self.tsc.load(Ordering::SeqCst)
    }
}
