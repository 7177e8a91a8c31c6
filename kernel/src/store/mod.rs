// =============================================================================
// micro-PV — Xenstore Client
// =============================================================================
//
// Xenstore is the control plane between domains: a tree of small string
// values with per-node permissions, reached through a request ring and a
// response ring in one shared page, plus an event channel to kick the
// daemon.
//
// The ring carries exactly one request at a time and has no multiplexing,
// so every call goes through a single-flight gate:
//
//   busy        someone is mid-request
//   current_tx  the transaction that owns the channel (0 = none)
//
// A caller waits (yielding the vCPU) while the gate is busy, or while a
// transaction other than its own is open. Once through, it writes the
// header and payload, notifies the daemon, then reads the response header
// and payload back, checking the request id.
//
// A response whose request id does not match means the two ends have lost
// track of each other. There is no way to resynchronise, so the channel is
// marked dead and every later call fails immediately with `IdMismatch`.
//
// A transport failure once the request id is taken (ring stall past the
// spin limit, failed notify) leaves a partial request or response on the
// ring. The daemon may still pick the request up and apply it, and the
// next reply would no longer line up. The channel is marked dead the same
// way and later calls fail with `TransportFailure`.
// =============================================================================

mod ring;

use core::fmt::{self, Write as _};
use core::marker::PhantomPinned;
use core::pin::Pin;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use khal::store::{StoreRing, XsdSockMsg, XsdType, XBT_NIL, XENSTORE_PAYLOAD_MAX, XENSTORE_RING_SIZE};
use khal::{DomId, Hypervisor, Port, StartInfo};
use klog::{debug, error, info, warn};
use spin::{Mutex, Once};

use crate::arch::RegisterFile;
use crate::config::RuntimeConfig;
use crate::event::{EventChannels, EventContext};
use crate::sync::{CriticalSection, Delivery};

use self::ring::RingIo;

/// Longest error text kept from a backend error reply.
const ERROR_TEXT_MAX: usize = 63;

const UNKNOWN_DOMID: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The response did not answer our request. The channel is dead.
    IdMismatch,
    /// The daemon answered with an error, e.g. `ENOENT`.
    BackendError(heapless::String<64>),
    /// The caller's buffer was smaller than the payload.
    Truncated,
    /// The ring stalled past the configured limit or the daemon could not
    /// be notified. The request may still be applied by the daemon, and
    /// the channel is dead.
    TransportFailure,
    /// A transaction commit lost a race and must be redone.
    Conflict,
    /// Request larger than the ring or the daemon's payload limit.
    PayloadTooLarge,
    /// The payload could not be parsed.
    Malformed,
    /// No xenstore channel was advertised at boot.
    NotConnected,
}

impl StoreError {
    fn backend(text: &str) -> Self {
        let mut owned = heapless::String::new();
        let _ = owned.push_str(text);
        StoreError::BackendError(owned)
    }

    /// Whether this is the daemon saying the node does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::BackendError(text) if text.as_str() == "ENOENT")
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::IdMismatch => f.write_str("xenstore response id mismatch"),
            StoreError::BackendError(text) => write!(f, "xenstore error: {}", text),
            StoreError::Truncated => f.write_str("xenstore payload truncated"),
            StoreError::TransportFailure => f.write_str("xenstore transport failure"),
            StoreError::Conflict => f.write_str("xenstore transaction conflict"),
            StoreError::PayloadTooLarge => f.write_str("xenstore request too large"),
            StoreError::Malformed => f.write_str("malformed xenstore payload"),
            StoreError::NotConnected => f.write_str("no xenstore channel"),
        }
    }
}

// ── Gate ───────────────────────────────────────────────────────

struct Gate {
    busy: bool,
    current_tx: u32,
}

/// Ownership of the ring for one request. Dropping it frees the gate.
struct GateGuard<'s> {
    gate: &'s Mutex<Gate>,
    delivery: &'s dyn Delivery,
}

impl GateGuard<'_> {
    fn set_transaction(&self, tx: u32) {
        let _cs = CriticalSection::enter(self.delivery);
        self.gate.lock().current_tx = tx;
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let _cs = CriticalSection::enter(self.delivery);
        self.gate.lock().busy = false;
    }
}

fn on_response(_port: Port, _regs: Option<&mut RegisterFile>, context: EventContext) {
    // SAFETY: bound by `Store::init` with the pinned store's flag.
    if let Some(fired) = unsafe { context.get::<AtomicBool>() } {
        fired.store(true, Ordering::Release);
    }
}

/// Names returned by [`Store::list`].
pub struct Directory<'b> {
    rest: &'b [u8],
}

impl<'b> Iterator for Directory<'b> {
    type Item = &'b str;

    fn next(&mut self) -> Option<&'b str> {
        while !self.rest.is_empty() {
            let end = self.rest.iter().position(|&b| b == 0).unwrap_or(self.rest.len());
            let name = &self.rest[..end];
            self.rest = self.rest.get(end + 1..).unwrap_or(&[]);
            if name.is_empty() {
                continue;
            }
            match core::str::from_utf8(name) {
                Ok(name) => return Some(name),
                Err(_) => warn!("skipping non-UTF-8 directory entry"),
            }
        }
        None
    }
}

fn digits(buf: &[u8]) -> Result<&str, StoreError> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    core::str::from_utf8(&buf[..end])
        .map(str::trim)
        .map_err(|_| StoreError::Malformed)
}

// ── Client ─────────────────────────────────────────────────────

/// Xenstore client. Must be pinned before [`Store::init`], because the
/// event handler holds a pointer into it.
pub struct Store<'a, H: Hypervisor> {
    hv: &'a H,
    events: &'a EventChannels<'a, H>,
    ring: &'a StoreRing,
    port: Option<Port>,
    yield_while_waiting: bool,
    spin_limit: Option<u32>,
    gate: Mutex<Gate>,
    req_id: AtomicU32,
    event_fired: AtomicBool,
    /// Why the channel stopped, once it has.
    dead: Once<StoreError>,
    domid: AtomicU32,
    bound: AtomicBool,
    _pin: PhantomPinned,
}

impl<'a, H: Hypervisor> Store<'a, H> {
    pub fn new(
        hv: &'a H,
        events: &'a EventChannels<'a, H>,
        ring: &'a StoreRing,
        start_info: &StartInfo,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            hv,
            events,
            ring,
            port: start_info.store_port(),
            yield_while_waiting: config.store_yield_while_waiting,
            spin_limit: config.store_spin_limit,
            gate: Mutex::new(Gate {
                busy: false,
                current_tx: XBT_NIL,
            }),
            req_id: AtomicU32::new(0),
            event_fired: AtomicBool::new(false),
            dead: Once::new(),
            domid: AtomicU32::new(UNKNOWN_DOMID),
            bound: AtomicBool::new(false),
            _pin: PhantomPinned,
        }
    }

    /// Connect to the daemon: bind the store port, kick the backend, learn
    /// our domain id and make `data/` writable by us.
    pub fn init(self: Pin<&Self>) -> Result<(), StoreError> {
        let this = self.get_ref();
        let Some(port) = this.port else {
            info!("xenstore: no channel advertised, skipping");
            return Ok(());
        };

        this.events
            .bind_channel(port, on_response, EventContext::new(&this.event_fired))
            .map_err(|err| {
                error!("xenstore: cannot bind {}: {}", port, err);
                StoreError::TransportFailure
            })?;
        this.bound.store(true, Ordering::Release);

        // Data may already be in flight after a restore.
        if let Err(err) = this.events.notify(port) {
            warn!("xenstore: initial notify failed: {}", err);
        }

        let domid = this.read_integer(XBT_NIL, "domid")?;
        let domid = u16::try_from(domid).map_err(|_| StoreError::Malformed)?;
        this.domid.store(u32::from(domid), Ordering::Release);

        let mut perms: heapless::String<16> = heapless::String::new();
        let _ = write!(perms, "w{}", domid);
        if let Err(err) = this.set_perms(XBT_NIL, "data", &perms) {
            warn!("xenstore: could not open data/ to dom{}: {}", domid, err);
        }
        let mut buf = [0u8; 64];
        match this.get_perms(XBT_NIL, "data", &mut buf) {
            Ok(len) => debug!("xenstore: data/ perms {:?}", Directory { rest: &buf[..len] }.next()),
            Err(err) => warn!("xenstore: could not read data/ perms: {}", err),
        }

        info!("xenstore: connected on {}, we are dom{}", port, domid);
        Ok(())
    }

    /// Our domain id, once [`Store::init`] has read it.
    pub fn domain_id(&self) -> Option<DomId> {
        match self.domid.load(Ordering::Acquire) {
            UNKNOWN_DOMID => None,
            id => Some(DomId(id as u16)),
        }
    }

    /// Yield until the daemon has signalled the store port, then consume
    /// the signal.
    pub fn wait_for_event(&self) {
        while !self.event_fired.load(Ordering::Acquire) {
            self.hv.sched_yield();
        }
        let _cs = self.events.critical_section();
        self.event_fired.store(false, Ordering::Release);
    }

    // ── Request plumbing ───────────────────────────────────────

    fn relax(&self) {
        if self.yield_while_waiting {
            self.hv.sched_yield();
        } else {
            core::hint::spin_loop();
        }
    }

    fn acquire(&self, tx: u32) -> GateGuard<'_> {
        loop {
            {
                let _cs = self.events.critical_section();
                let mut gate = self.gate.lock();
                if !gate.busy && (gate.current_tx == XBT_NIL || gate.current_tx == tx) {
                    gate.busy = true;
                    return GateGuard {
                        gate: &self.gate,
                        delivery: self.events,
                    };
                }
            }
            self.relax();
        }
    }

    fn transact(&self, kind: XsdType, tx: u32, segments: &[&[u8]], response: &mut [u8]) -> Result<usize, StoreError> {
        let gate = self.acquire(tx);
        self.exchange(&gate, kind, tx, segments, response)
    }

    fn kill(&self, reason: StoreError) -> StoreError {
        self.dead.call_once(|| reason.clone());
        reason
    }

    /// One request/response round trip. The caller holds the gate.
    fn exchange(
        &self,
        _gate: &GateGuard<'_>,
        kind: XsdType,
        tx: u32,
        segments: &[&[u8]],
        response: &mut [u8],
    ) -> Result<usize, StoreError> {
        if let Some(reason) = self.dead.get() {
            return Err(reason.clone());
        }
        let port = self.port.ok_or(StoreError::NotConnected)?;
        let total: usize = segments.iter().map(|s| s.len()).sum();
        if total > XENSTORE_PAYLOAD_MAX || segments.iter().any(|s| s.len() > XENSTORE_RING_SIZE) {
            return Err(StoreError::PayloadTooLarge);
        }

        match self.round_trip(port, kind, tx, total, segments, response) {
            Err(StoreError::TransportFailure) => {
                error!("xenstore: {} left half done on the ring; channel is now dead", kind);
                Err(self.kill(StoreError::TransportFailure))
            }
            result => result,
        }
    }

    fn round_trip(
        &self,
        port: Port,
        kind: XsdType,
        tx: u32,
        total: usize,
        segments: &[&[u8]],
        response: &mut [u8],
    ) -> Result<usize, StoreError> {
        let io = RingIo {
            hv: self.hv,
            ring: self.ring,
            port,
            yield_while_waiting: self.yield_while_waiting,
            spin_limit: self.spin_limit,
        };
        let req_id = self.req_id.fetch_add(1, Ordering::Relaxed);
        io.write(&XsdSockMsg::new(kind, req_id, tx, total as u32).to_bytes())?;
        for segment in segments {
            io.write(segment)?;
        }
        self.events.notify(port).map_err(|err| {
            warn!("xenstore: notify failed: {}", err);
            StoreError::TransportFailure
        })?;

        let mut raw = [0u8; XsdSockMsg::SIZE];
        io.read(&mut raw)?;
        let header = XsdSockMsg::from_bytes(&raw);
        let len = header.len as usize;
        if len > XENSTORE_PAYLOAD_MAX {
            error!("xenstore: reply claims {} payload bytes, dropping channel", len);
            return Err(self.kill(StoreError::Malformed));
        }
        if header.req_id != req_id {
            if let Err(err) = io.discard(len) {
                warn!("xenstore: could not drain the stray reply: {}", err);
            }
            error!(
                "xenstore: sent {} id {}, reply carries id {}; channel is now dead",
                kind, req_id, header.req_id
            );
            return Err(self.kill(StoreError::IdMismatch));
        }

        if header.message_type() == Some(XsdType::Error) {
            let mut text = [0u8; ERROR_TEXT_MAX];
            let take = len.min(ERROR_TEXT_MAX);
            io.read(&mut text[..take])?;
            io.discard(len - take)?;
            let text = digits(&text[..take]).unwrap_or("EIO");
            let err = StoreError::backend(text);
            if err.is_not_found() {
                debug!("xenstore {}: {}", kind, text);
            } else {
                warn!("xenstore {}: {}", kind, text);
            }
            return Err(err);
        }

        let take = len.min(response.len());
        io.read(&mut response[..take])?;
        io.discard(len - take)?;
        if take < len {
            return Err(StoreError::Truncated);
        }
        Ok(len)
    }

    // ── Operations ─────────────────────────────────────────────

    /// Read `path` into `buf`, returning the value length.
    pub fn read(&self, tx: u32, path: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        self.transact(XsdType::Read, tx, &[path.as_bytes(), b"\0"], buf)
    }

    /// Read `path` as UTF-8 text.
    pub fn read_str<'b>(&self, tx: u32, path: &str, buf: &'b mut [u8]) -> Result<&'b str, StoreError> {
        let len = self.read(tx, path, buf)?;
        core::str::from_utf8(&buf[..len]).map_err(|_| StoreError::Malformed)
    }

    pub fn write(&self, tx: u32, path: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut ack = [0u8; 8];
        self.transact(XsdType::Write, tx, &[path.as_bytes(), b"\0", value], &mut ack)
            .map(drop)
    }

    pub fn remove(&self, tx: u32, path: &str) -> Result<(), StoreError> {
        let mut ack = [0u8; 8];
        self.transact(XsdType::Rm, tx, &[path.as_bytes(), b"\0"], &mut ack).map(drop)
    }

    pub fn mkdir(&self, tx: u32, path: &str) -> Result<(), StoreError> {
        let mut ack = [0u8; 8];
        self.transact(XsdType::Mkdir, tx, &[path.as_bytes(), b"\0"], &mut ack).map(drop)
    }

    /// Children of `path`, decoded from `buf`.
    pub fn list<'b>(&self, tx: u32, path: &str, buf: &'b mut [u8]) -> Result<Directory<'b>, StoreError> {
        let len = self.transact(XsdType::Directory, tx, &[path.as_bytes(), b"\0"], buf)?;
        Ok(Directory { rest: &buf[..len] })
    }

    /// Raw permission list of `path`: NUL-separated entries such as `n0`.
    pub fn get_perms(&self, tx: u32, path: &str, buf: &mut [u8]) -> Result<usize, StoreError> {
        self.transact(XsdType::GetPerms, tx, &[path.as_bytes(), b"\0"], buf)
    }

    /// Replace the permissions of `path` with a single entry like `w3`.
    pub fn set_perms(&self, tx: u32, path: &str, perms: &str) -> Result<(), StoreError> {
        let mut ack = [0u8; 8];
        self.transact(
            XsdType::SetPerms,
            tx,
            &[path.as_bytes(), b"\0", perms.as_bytes(), b"\0"],
            &mut ack,
        )
        .map(drop)
    }

    /// Home path of domain `domid`, e.g. `/local/domain/5`.
    pub fn get_domain_path(&self, domid: DomId, buf: &mut [u8]) -> Result<usize, StoreError> {
        let mut id: heapless::String<8> = heapless::String::new();
        let _ = write!(id, "{}", domid.0);
        let len = self.transact(XsdType::GetDomainPath, XBT_NIL, &[id.as_bytes(), b"\0"], buf)?;
        Ok(buf[..len].iter().position(|&b| b == 0).unwrap_or(len))
    }

    // ── Transactions ───────────────────────────────────────────

    /// Open a transaction. Other callers are held off until it ends.
    pub fn transaction_start(&self) -> Result<u32, StoreError> {
        let gate = self.acquire(XBT_NIL);
        let mut reply = [0u8; 16];
        let len = self.exchange(&gate, XsdType::TransactionStart, XBT_NIL, &[b"\0"], &mut reply)?;
        let id: u32 = digits(&reply[..len])?.parse().map_err(|_| StoreError::Malformed)?;
        if id == XBT_NIL {
            return Err(StoreError::Malformed);
        }
        gate.set_transaction(id);
        debug!("xenstore: transaction {} open", id);
        Ok(id)
    }

    /// Commit (`abort == false`) or abort transaction `tx`.
    ///
    /// A commit that raced with another writer fails with
    /// [`StoreError::Conflict`]; redo the whole transaction.
    pub fn transaction_end(&self, tx: u32, abort: bool) -> Result<(), StoreError> {
        let gate = self.acquire(tx);
        let marker: &[u8] = if abort { b"F\0" } else { b"T\0" };
        let mut ack = [0u8; 8];
        let result = self.exchange(&gate, XsdType::TransactionEnd, tx, &[marker], &mut ack);
        gate.set_transaction(XBT_NIL);
        match result {
            Ok(_) => Ok(()),
            Err(StoreError::BackendError(text)) if text.as_str() == "EAGAIN" => Err(StoreError::Conflict),
            Err(err) => Err(err),
        }
    }

    /// Write `value` unless `path` already holds exactly that. Returns
    /// whether a write happened.
    ///
    /// Outside a transaction, a local one wraps the read and the write and
    /// is retried until it commits.
    pub fn write_if_different(&self, tx: u32, path: &str, value: &[u8]) -> Result<bool, StoreError> {
        if tx != XBT_NIL {
            return self.compare_and_write(tx, path, value);
        }
        loop {
            let local = self.transaction_start()?;
            let changed = match self.compare_and_write(local, path, value) {
                Ok(changed) => changed,
                Err(err) => {
                    if let Err(abort) = self.transaction_end(local, true) {
                        warn!("xenstore: abort of transaction {} failed: {}", local, abort);
                    }
                    return Err(err);
                }
            };
            match self.transaction_end(local, false) {
                Ok(()) => return Ok(changed),
                Err(StoreError::Conflict) => debug!("xenstore: {} raced, retrying", path),
                Err(err) => return Err(err),
            }
        }
    }

    fn compare_and_write(&self, tx: u32, path: &str, value: &[u8]) -> Result<bool, StoreError> {
        let mut current = [0u8; XENSTORE_PAYLOAD_MAX];
        let same = match self.read(tx, path, &mut current) {
            Ok(len) => &current[..len] == value,
            Err(StoreError::Truncated) => false,
            Err(err) if err.is_not_found() => false,
            Err(err) => return Err(err),
        };
        if same {
            return Ok(false);
        }
        self.write(tx, path, value)?;
        Ok(true)
    }

    // ── Typed helpers ──────────────────────────────────────────

    pub fn read_integer(&self, tx: u32, path: &str) -> Result<i64, StoreError> {
        let mut buf = [0u8; 24];
        let len = self.read(tx, path, &mut buf)?;
        digits(&buf[..len])?.parse().map_err(|_| StoreError::Malformed)
    }

    pub fn write_integer(&self, tx: u32, path: &str, value: i64) -> Result<(), StoreError> {
        let mut text: heapless::String<24> = heapless::String::new();
        let _ = write!(text, "{}", value);
        self.write(tx, path, text.as_bytes())
    }

    /// Whether the toolstack has asked us to shut down.
    pub fn shutdown_requested(&self, tx: u32) -> Result<bool, StoreError> {
        let mut buf = [0u8; 32];
        match self.read(tx, "control/shutdown", &mut buf) {
            Ok(len) => Ok(len > 0),
            Err(StoreError::Truncated) => Ok(true),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl<H: Hypervisor> Drop for Store<'_, H> {
    fn drop(&mut self) {
        if let (Some(port), true) = (self.port, self.bound.load(Ordering::Acquire)) {
            let _ = self.events.unbind(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use khal::HypercallError;
    use khal_mock::{MockHypervisor, Op, StoreRequest, STORE_MFN, STORE_PORT};
    use x86_64::VirtAddr;

    type TestStore = Store<'static, MockHypervisor>;

    struct Fixture {
        hv: &'static MockHypervisor,
        events: &'static EventChannels<'static, MockHypervisor>,
        store: Pin<&'static TestStore>,
    }

    fn fixture_with(config: RuntimeConfig, start: StartInfo) -> Fixture {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        let events: &'static EventChannels<'static, MockHypervisor> =
            Box::leak(Box::new(EventChannels::new(hv, hv.shared())));
        events.init(VirtAddr::new(0x1000), VirtAddr::new(0x2000)).unwrap();
        let store: &'static TestStore = Box::leak(Box::new(Store::new(hv, events, hv.store_ring(), &start, &config)));
        let store = Pin::static_ref(store);
        store.init().unwrap();
        Fixture { hv, events, store }
    }

    fn advertised() -> StartInfo {
        StartInfo::empty().with_store(STORE_MFN, STORE_PORT)
    }

    fn fixture() -> Fixture {
        fixture_with(RuntimeConfig::DEFAULT, advertised())
    }

    fn requests_of(hv: &MockHypervisor, kind: XsdType) -> Vec<StoreRequest> {
        hv.with_store(|d| d.requests().iter().filter(|r| r.kind == Some(kind)).cloned().collect())
    }

    #[test]
    fn init_learns_domid_and_opens_data() {
        let fx = fixture();
        assert_eq!(fx.store.domain_id(), Some(DomId(3)));
        assert_eq!(fx.hv.with_store(|d| d.perms("data")), Some(vec!["w3".to_string()]));
        assert!(fx.events.is_bound(STORE_PORT));
        assert_eq!(requests_of(fx.hv, XsdType::GetPerms).len(), 1);
    }

    #[test]
    fn write_then_read_returns_value() {
        let fx = fixture();
        fx.store.write(XBT_NIL, "data/name", b"micro-pv").unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(fx.store.read_str(XBT_NIL, "data/name", &mut buf), Ok("micro-pv"));
        assert_eq!(fx.hv.with_store(|d| d.value("data/name")), Some(b"micro-pv".to_vec()));
        // Values go out without a terminator.
        assert_eq!(requests_of(fx.hv, XsdType::Write)[0].value, b"micro-pv");
    }

    #[test]
    fn missing_node_is_backend_error() {
        let fx = fixture();
        let mut buf = [0u8; 8];
        let err = fx.store.read(XBT_NIL, "data/absent", &mut buf).unwrap_err();
        assert_eq!(err, StoreError::backend("ENOENT"));
        assert!(err.is_not_found());
    }

    #[test]
    fn short_buffer_is_truncated_and_channel_stays_in_step() {
        let fx = fixture();
        fx.store.write(XBT_NIL, "data/long", b"0123456789").unwrap();
        let mut small = [0u8; 4];
        assert_eq!(fx.store.read(XBT_NIL, "data/long", &mut small), Err(StoreError::Truncated));
        assert_eq!(&small, b"0123");
        let mut buf = [0u8; 16];
        assert_eq!(fx.store.read(XBT_NIL, "data/long", &mut buf), Ok(10));
    }

    #[test]
    fn committed_transaction_becomes_visible() {
        let fx = fixture();
        let tx = fx.store.transaction_start().unwrap();
        fx.store.write(tx, "data/a", b"1").unwrap();
        assert_eq!(fx.hv.with_store(|d| d.value("data/a")), None);
        fx.store.transaction_end(tx, false).unwrap();
        assert_eq!(fx.hv.with_store(|d| d.value("data/a")), Some(b"1".to_vec()));
        assert_eq!(fx.hv.with_store(|d| d.open_transactions()), 0);
        let end = &requests_of(fx.hv, XsdType::TransactionEnd)[0];
        assert_eq!((end.tx_id, end.path.as_str()), (tx, "T"));
    }

    #[test]
    fn aborted_transaction_leaves_no_trace() {
        let fx = fixture();
        let tx = fx.store.transaction_start().unwrap();
        fx.store.write(tx, "data/a", b"1").unwrap();
        fx.store.transaction_end(tx, true).unwrap();
        assert_eq!(fx.hv.with_store(|d| d.value("data/a")), None);
        assert_eq!(requests_of(fx.hv, XsdType::TransactionEnd)[0].path, "F");
        // The gate is free again for plain calls.
        fx.store.write(XBT_NIL, "data/b", b"2").unwrap();
    }

    #[test]
    fn racing_commit_reports_conflict() {
        let fx = fixture();
        let tx = fx.store.transaction_start().unwrap();
        fx.store.write(tx, "data/a", b"1").unwrap();
        fx.hv.with_store(|d| d.external_write("data/other", b"x"));
        assert_eq!(fx.store.transaction_end(tx, false), Err(StoreError::Conflict));
        assert_eq!(fx.hv.with_store(|d| d.value("data/a")), None);
    }

    #[test]
    fn write_if_different_skips_equal_value() {
        let fx = fixture();
        fx.store.write(XBT_NIL, "data/state", b"4").unwrap();
        let before = requests_of(fx.hv, XsdType::Write).len();

        assert_eq!(fx.store.write_if_different(XBT_NIL, "data/state", b"4"), Ok(false));
        assert_eq!(requests_of(fx.hv, XsdType::Write).len(), before);

        assert_eq!(fx.store.write_if_different(XBT_NIL, "data/state", b"5"), Ok(true));
        assert_eq!(requests_of(fx.hv, XsdType::Write).len(), before + 1);
        assert_eq!(fx.hv.with_store(|d| d.value("data/state")), Some(b"5".to_vec()));
    }

    #[test]
    fn write_if_different_creates_missing_node() {
        let fx = fixture();
        assert_eq!(fx.store.write_if_different(XBT_NIL, "data/fresh", b"on"), Ok(true));
        assert_eq!(fx.hv.with_store(|d| d.value("data/fresh")), Some(b"on".to_vec()));
    }

    #[test]
    fn write_if_different_retries_after_conflict() {
        let fx = fixture();
        fx.hv.with_store(|d| d.force_conflicts(2));
        assert_eq!(fx.store.write_if_different(XBT_NIL, "data/k", b"v"), Ok(true));
        assert_eq!(requests_of(fx.hv, XsdType::TransactionStart).len(), 3);
        assert_eq!(fx.hv.with_store(|d| d.value("data/k")), Some(b"v".to_vec()));
    }

    #[test]
    fn list_returns_children() {
        let fx = fixture();
        fx.store.mkdir(XBT_NIL, "data/dev").unwrap();
        fx.store.write(XBT_NIL, "data/dev/vif", b"").unwrap();
        fx.store.write(XBT_NIL, "data/dev/vbd", b"").unwrap();
        let mut buf = [0u8; 64];
        let names: Vec<&str> = fx.store.list(XBT_NIL, "data/dev", &mut buf).unwrap().collect();
        assert_eq!(names, ["vbd", "vif"]);
    }

    #[test]
    fn remove_deletes_subtree() {
        let fx = fixture();
        fx.store.write(XBT_NIL, "data/dev/vif", b"1").unwrap();
        fx.store.remove(XBT_NIL, "data/dev").unwrap();
        assert_eq!(fx.hv.with_store(|d| d.value("data/dev/vif")), None);
        assert!(fx.store.remove(XBT_NIL, "data/dev").unwrap_err().is_not_found());
    }

    #[test]
    fn integers_round_trip_and_garbage_is_malformed() {
        let fx = fixture();
        fx.store.write_integer(XBT_NIL, "data/n", -42).unwrap();
        assert_eq!(fx.store.read_integer(XBT_NIL, "data/n"), Ok(-42));
        fx.store.write(XBT_NIL, "data/n", b"forty").unwrap();
        assert_eq!(fx.store.read_integer(XBT_NIL, "data/n"), Err(StoreError::Malformed));
    }

    #[test]
    fn id_mismatch_kills_the_channel() {
        let fx = fixture();
        fx.hv.with_store(|d| d.corrupt_next_reply());
        let mut buf = [0u8; 8];
        assert_eq!(fx.store.read(XBT_NIL, "domid", &mut buf), Err(StoreError::IdMismatch));

        let sent = fx.hv.with_store(|d| d.requests().len());
        assert_eq!(fx.store.write(XBT_NIL, "data/x", b"1"), Err(StoreError::IdMismatch));
        assert_eq!(fx.hv.with_store(|d| d.requests().len()), sent);
    }

    #[test]
    fn oversized_requests_are_refused_before_sending() {
        let fx = fixture();
        let sent = fx.hv.with_store(|d| d.requests().len());
        let big = vec![b'x'; XENSTORE_RING_SIZE + 1];
        assert_eq!(fx.store.write(XBT_NIL, "data/big", &big), Err(StoreError::PayloadTooLarge));
        assert_eq!(fx.hv.with_store(|d| d.requests().len()), sent);
    }

    #[test]
    fn failed_notify_is_transport_failure() {
        let fx = fixture();
        fx.hv.fail(Op::EvtchnSend, HypercallError::EINVAL);
        assert_eq!(fx.store.write(XBT_NIL, "data/x", b"1"), Err(StoreError::TransportFailure));
    }

    #[test]
    fn stalled_ring_gives_up_at_spin_limit() {
        let config = RuntimeConfig {
            store_spin_limit: Some(8),
            ..RuntimeConfig::DEFAULT
        };
        let fx = fixture_with(config, advertised());
        fx.hv.with_store(|d| d.set_stalled(true));
        let mut buf = [0u8; 8];
        assert_eq!(fx.store.read(XBT_NIL, "domid", &mut buf), Err(StoreError::TransportFailure));
    }

    #[test]
    fn stall_mid_request_kills_the_channel() {
        let config = RuntimeConfig {
            store_spin_limit: Some(8),
            ..RuntimeConfig::DEFAULT
        };
        let fx = fixture_with(config, advertised());
        fx.hv.with_store(|d| d.set_stalled(true));
        assert_eq!(fx.store.write(XBT_NIL, "data/x", b"1"), Err(StoreError::TransportFailure));

        // The daemon comes back and still applies the abandoned write.
        fx.hv.with_store(|d| d.set_stalled(false));
        fx.hv.sched_yield();
        assert_eq!(fx.hv.with_store(|d| d.value("data/x")), Some(b"1".to_vec()));

        let sent = fx.hv.with_store(|d| d.requests().len());
        let mut buf = [0u8; 8];
        assert_eq!(fx.store.read(XBT_NIL, "data/x", &mut buf), Err(StoreError::TransportFailure));
        assert_eq!(fx.store.write(XBT_NIL, "data/y", b"2"), Err(StoreError::TransportFailure));
        assert_eq!(fx.hv.with_store(|d| d.requests().len()), sent);
    }

    #[test]
    fn failed_notify_kills_the_channel() {
        let fx = fixture();
        fx.hv.fail_once(Op::EvtchnSend, HypercallError::EINVAL);
        assert_eq!(fx.store.write(XBT_NIL, "data/x", b"1"), Err(StoreError::TransportFailure));
        let mut buf = [0u8; 8];
        assert_eq!(fx.store.read(XBT_NIL, "domid", &mut buf), Err(StoreError::TransportFailure));
    }

    #[test]
    fn no_channel_means_not_connected() {
        let fx = fixture_with(RuntimeConfig::DEFAULT, StartInfo::empty());
        assert_eq!(fx.store.domain_id(), None);
        let mut buf = [0u8; 8];
        assert_eq!(fx.store.read(XBT_NIL, "domid", &mut buf), Err(StoreError::NotConnected));
    }

    #[test]
    fn domain_path_and_shutdown_flag() {
        let fx = fixture();
        let mut buf = [0u8; 32];
        let len = fx.store.get_domain_path(DomId(5), &mut buf).unwrap();
        assert_eq!(&buf[..len], b"/local/domain/5");

        assert_eq!(fx.store.shutdown_requested(XBT_NIL), Ok(false));
        fx.hv.with_store(|d| d.external_write("control/shutdown", b"poweroff"));
        assert_eq!(fx.store.shutdown_requested(XBT_NIL), Ok(true));
    }

    #[test]
    fn response_event_sets_flag_through_upcall() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        let events: &'static EventChannels<'static, MockHypervisor> =
            Box::leak(Box::new(EventChannels::new(hv, hv.shared())));
        events.init(VirtAddr::new(0x1000), VirtAddr::new(0x2000)).unwrap();
        hv.set_upcall(move || events.dispatch_pending(None));
        let start = hv.start_info();
        let store: &'static TestStore =
            Box::leak(Box::new(Store::new(hv, events, hv.store_ring(), &start, &RuntimeConfig::DEFAULT)));
        Pin::static_ref(store).init().unwrap();

        store.wait_for_event();
        assert!(events.invocations(STORE_PORT) >= 1);
        assert!(!store.event_fired.load(Ordering::Acquire));
    }

    #[test]
    fn concurrent_callers_are_serialised() {
        let fx = fixture();
        let store = fx.store.get_ref();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                for round in 0..10 {
                    let tx = store.transaction_start().unwrap();
                    store.write(tx, "data/t", format!("{}", round).as_bytes()).unwrap();
                    store.write(tx, "data/u", b"same").unwrap();
                    store.transaction_end(tx, false).unwrap();
                }
            });
            scope.spawn(|| {
                for round in 0..20 {
                    store.write_integer(XBT_NIL, "data/plain", round).unwrap();
                }
            });
        });

        assert_eq!(store.read_integer(XBT_NIL, "data/plain"), Ok(19));
        // No plain request ever slipped inside an open transaction.
        let log = fx.hv.with_store(|d| d.requests().to_vec());
        let mut open = None;
        for req in &log {
            match req.kind {
                Some(XsdType::TransactionStart) => open = Some(()),
                Some(XsdType::TransactionEnd) => open = None,
                _ if req.tx_id == XBT_NIL => assert!(open.is_none(), "plain request inside transaction"),
                _ => {}
            }
        }
        let mut ids: Vec<u32> = log.iter().map(|r| r.req_id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), log.len());
    }
}
