// =============================================================================
// micro-PV — Grant-Table Allocator
// =============================================================================
//
// Two directions of page sharing with other domains:
//
//   share / unshare     we own the frame and let a peer map it. The grant
//                       reference is an index into our own grant table,
//                       which the hypervisor reads to police the peer.
//   consume / release   a peer owns the frame and gave us a reference; we
//                       ask the hypervisor to map it and get back a handle.
//
// Entry update order matters because the hypervisor may read an entry at
// any time:
//
//   share    frame, domid  →  release  →  flags (PERMIT_ACCESS ...)
//   unshare  flags = 0 (only if no peer mapping)  →  frame, domid = 0
//
// A peer mapping shows up as READING/WRITING. Under v1 those bits sit in
// the entry flags, so one compare-exchange both checks and revokes. Under
// v2 they sit in a separate status word: the flags are cleared first, then
// the status is checked, and a live mapping puts the flags back.
//
// References below NR_RESERVED_ENTRIES belong to the toolstack (console
// and xenstore rings) and are never handed out.
// =============================================================================

pub mod freelist;
pub mod layout;

use core::fmt::{self, Write as _};
use core::ptr;
use core::sync::atomic::{fence, AtomicU16, Ordering};

use khal::grant::{
    GrantFlags, GrantStatus, GrantTableArea, MapFlags, MapGrantRef, UnmapGrantRef, NR_GRANT_FRAMES,
    NR_STATUS_FRAMES, PAGE_SIZE,
};
use khal::store::XBT_NIL;
use khal::{DomId, GrantHandleId, GrantRef, HypercallError, Hypervisor, Mfn, ShutdownReason};
use klog::{debug, error, info, trace, warn};
use spin::Mutex;
use x86_64::VirtAddr;

use crate::config::RuntimeConfig;
use crate::event::EventChannels;
use crate::store::{Store, StoreError};

use self::freelist::FreeList;
use self::layout::GrantLayout;

const DOMID_OFFSET: usize = 2;

/// A peer grant mapped into our address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantHandle {
    pub handle: GrantHandleId,
    pub dev_bus_addr: u64,
}

/// Decoded view of one of our grant entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrantEntry {
    pub flags: GrantFlags,
    pub domid: DomId,
    pub frame: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantError {
    /// The reference is not currently shared (double free, reserved or out
    /// of range).
    NotShared(GrantRef),
    /// A peer still has the frame mapped.
    InUse(GrantRef),
    MapFailed(GrantStatus),
    UnmapFailed(GrantStatus),
    Hypervisor(HypercallError),
    /// The frame number does not fit the negotiated entry layout.
    FrameOutOfRange(u64),
    TooManyFrames(usize),
    UnsupportedVersion(u32),
    /// The published name does not fit a store path.
    NameTooLong,
    Store(StoreError),
}

impl From<HypercallError> for GrantError {
    fn from(err: HypercallError) -> Self {
        GrantError::Hypervisor(err)
    }
}

impl From<StoreError> for GrantError {
    fn from(err: StoreError) -> Self {
        GrantError::Store(err)
    }
}

impl fmt::Display for GrantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GrantError::NotShared(gref) => write!(f, "{} is not shared", gref),
            GrantError::InUse(gref) => write!(f, "{} is still mapped by the peer", gref),
            GrantError::MapFailed(status) => write!(f, "grant map failed: {}", status),
            GrantError::UnmapFailed(status) => write!(f, "grant unmap failed: {}", status),
            GrantError::Hypervisor(err) => write!(f, "grant table: {}", err),
            GrantError::FrameOutOfRange(frame) => write!(f, "frame {:#x} too large for grant entry", frame),
            GrantError::TooManyFrames(n) => write!(f, "{} grant frames requested, at most {}", n, NR_GRANT_FRAMES),
            GrantError::UnsupportedVersion(v) => write!(f, "grant table version {} not supported", v),
            GrantError::NameTooLong => f.write_str("grant name too long"),
            GrantError::Store(err) => write!(f, "grant publish: {}", err),
        }
    }
}

pub struct GrantTable<'a, H: Hypervisor> {
    hv: &'a H,
    events: &'a EventChannels<'a, H>,
    area: &'a GrantTableArea,
    layout: &'static dyn GrantLayout,
    capacity: usize,
    /// Mapped v2 status frames; zero under v1.
    status_frames: usize,
    free: Mutex<FreeList>,
}

impl<'a, H: Hypervisor> GrantTable<'a, H> {
    /// Negotiate the entry layout, set up and map the table frames, and
    /// seed the free list.
    pub fn init(
        hv: &'a H,
        events: &'a EventChannels<'a, H>,
        area: &'a GrantTableArea,
        config: &RuntimeConfig,
    ) -> Result<Self, GrantError> {
        let frames = config.grant_frames;
        if frames == 0 || frames > NR_GRANT_FRAMES {
            return Err(GrantError::TooManyFrames(frames));
        }

        if config.grant_version != 1 {
            if let Err(err) = hv.gnttab_set_version(config.grant_version) {
                warn!("grants: v{} refused ({}), falling back to v1", config.grant_version, err);
                hv.gnttab_set_version(1)?;
            }
        }
        let version = hv.gnttab_get_version()?;
        let layout = layout::for_version(version).ok_or(GrantError::UnsupportedVersion(version))?;

        let mut mfns = [Mfn(0); NR_GRANT_FRAMES];
        hv.gnttab_setup_table(&mut mfns[..frames])?;
        for (i, mfn) in mfns[..frames].iter().enumerate() {
            hv.update_va_mapping(area.frame_addr(i), *mfn)?;
        }

        let status_frames = layout.status_frames(frames);
        if status_frames > NR_STATUS_FRAMES {
            return Err(GrantError::TooManyFrames(frames));
        }
        if status_frames > 0 {
            let mut status = [Mfn(0); NR_STATUS_FRAMES];
            hv.gnttab_get_status_frames(&mut status[..status_frames])?;
            for (i, mfn) in status[..status_frames].iter().enumerate() {
                hv.update_va_mapping(area.status_addr(i), *mfn)?;
            }
        }

        let capacity = frames * PAGE_SIZE / layout.entry_size();
        let mut free = FreeList::new();
        free.seed(capacity);
        info!("grants: v{}, {} frames, {} entries", version, frames, capacity);

        Ok(Self {
            hv,
            events,
            area,
            layout,
            capacity,
            status_frames,
            free: Mutex::new(free),
        })
    }

    pub fn version(&self) -> u32 {
        self.layout.version()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_count(&self) -> usize {
        let _cs = self.events.critical_section();
        let count = self.free.lock().free_count();
        count
    }

    pub fn is_shared(&self, gref: GrantRef) -> bool {
        let _cs = self.events.critical_section();
        let shared = self.free.lock().is_shared(gref);
        shared
    }

    // ── Entry access ───────────────────────────────────────────

    fn entry_ptr(&self, gref: GrantRef) -> *mut u8 {
        // SAFETY: callers only pass references below capacity, which lie
        // inside the area.
        unsafe { self.area.base().add(gref.index() * self.layout.entry_size()) }
    }

    fn flags(&self, gref: GrantRef) -> &AtomicU16 {
        // SAFETY: every entry starts with a 2-byte-aligned u16 flags word
        // that the hypervisor also updates atomically.
        unsafe { &*self.entry_ptr(gref).cast::<AtomicU16>() }
    }

    /// Word the hypervisor sets READING/WRITING in while a peer maps `gref`.
    fn usage(&self, gref: GrantRef) -> &AtomicU16 {
        if self.status_frames == 0 {
            return self.flags(gref);
        }
        // SAFETY: the status array holds one aligned u16 per reference
        // below capacity, and the mapped status frames cover all of them.
        unsafe { &*self.area.status_base().add(gref.index() * 2).cast::<AtomicU16>() }
    }

    /// Current contents of our entry `gref`.
    pub fn entry(&self, gref: GrantRef) -> Option<GrantEntry> {
        if gref.index() >= self.capacity() {
            return None;
        }
        let entry = self.entry_ptr(gref);
        // SAFETY: `gref` is in range, so `entry` is a live entry.
        let (domid, frame) = unsafe {
            (
                ptr::read_volatile(entry.add(DOMID_OFFSET).cast::<u16>()),
                self.layout.read_frame(entry),
            )
        };
        Some(GrantEntry {
            flags: GrantFlags::from_bits_retain(self.flags(gref).load(Ordering::Acquire)),
            domid: DomId(domid),
            frame,
        })
    }

    // ── Sharing our frames ─────────────────────────────────────

    /// Take a reference off the free list. Running out, or finding the list
    /// corrupt, is fatal.
    pub fn allocate(&self) -> GrantRef {
        let popped = {
            let _cs = self.events.critical_section();
            let popped = self.free.lock().pop();
            popped
        };
        match popped {
            Ok(gref) => gref,
            Err(head) => {
                error!("grants: free list head {} unusable (exhausted or corrupt)", head);
                self.hv.sched_shutdown(ShutdownReason::Crash)
            }
        }
    }

    /// Let `domain` map machine frame `frame`.
    pub fn share(&self, domain: DomId, frame: u64, readonly: bool) -> Result<GrantRef, GrantError> {
        if frame > self.layout.max_frame() {
            return Err(GrantError::FrameOutOfRange(frame));
        }
        let gref = self.allocate();
        let entry = self.entry_ptr(gref);
        // SAFETY: `gref` came off the free list, so nobody else writes this
        // entry and the peer ignores it while flags are zero.
        unsafe {
            ptr::write_volatile(entry.add(DOMID_OFFSET).cast::<u16>(), domain.0);
            self.layout.write_frame(entry, frame);
        }
        let mut flags = GrantFlags::PERMIT_ACCESS;
        if readonly {
            flags |= GrantFlags::READONLY;
        }
        // Frame and domid must be visible before the hypervisor sees flags.
        self.flags(gref).store(flags.bits(), Ordering::Release);
        debug!("grants: {} -> {} frame {:#x}{}", gref, domain, frame, if readonly { " ro" } else { "" });
        Ok(gref)
    }

    /// Revoke `gref` and return it to the free list.
    pub fn unshare(&self, gref: GrantRef) -> Result<(), GrantError> {
        let _cs = self.events.critical_section();
        let mut free = self.free.lock();
        if !free.is_shared(gref) {
            warn!("grants: unshare of {} which is not shared", gref);
            return Err(GrantError::NotShared(gref));
        }

        let in_use = GrantFlags::READING | GrantFlags::WRITING;
        let flags = self.flags(gref);
        if self.status_frames == 0 {
            let mut current = flags.load(Ordering::Acquire);
            loop {
                if GrantFlags::from_bits_retain(current).intersects(in_use) {
                    warn!("grants: {} still in use (flags {:#x})", gref, current);
                    return Err(GrantError::InUse(gref));
                }
                match flags.compare_exchange(current, 0, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => break,
                    Err(seen) => current = seen,
                }
            }
        } else {
            let previous = flags.swap(0, Ordering::AcqRel);
            fence(Ordering::SeqCst);
            let status = self.usage(gref).load(Ordering::Acquire);
            if GrantFlags::from_bits_retain(status).intersects(in_use) {
                flags.store(previous, Ordering::Release);
                warn!("grants: {} still in use (status {:#x})", gref, status);
                return Err(GrantError::InUse(gref));
            }
        }

        let entry = self.entry_ptr(gref);
        // SAFETY: flags are zero, so the hypervisor no longer honours the
        // entry and we still own it.
        unsafe {
            self.layout.write_frame(entry, 0);
            ptr::write_volatile(entry.add(DOMID_OFFSET).cast::<u16>(), 0);
        }
        free.push(gref);
        trace!("grants: {} released", gref);
        Ok(())
    }

    // ── Mapping peer frames ────────────────────────────────────

    /// Map `domain`'s grant `gref` at `local_addr`.
    pub fn consume(&self, domain: DomId, gref: GrantRef, local_addr: VirtAddr) -> Result<GrantHandle, GrantError> {
        let mut op = MapGrantRef {
            host_addr: local_addr.as_u64(),
            flags: MapFlags::HOST_MAP.bits(),
            gref: gref.0,
            dom: domain.0,
            ..MapGrantRef::default()
        };
        self.hv.gnttab_map_grant_ref(&mut op)?;
        let status = GrantStatus(op.status);
        if !status.is_okay() {
            warn!("grants: mapping {} of {} failed: {}", gref, domain, status);
            return Err(GrantError::MapFailed(status));
        }
        Ok(GrantHandle {
            handle: GrantHandleId(op.handle),
            dev_bus_addr: op.dev_bus_addr,
        })
    }

    /// Undo [`GrantTable::consume`].
    pub fn release(&self, handle: GrantHandle, local_addr: VirtAddr) -> Result<(), GrantError> {
        let mut op = UnmapGrantRef {
            host_addr: local_addr.as_u64(),
            dev_bus_addr: handle.dev_bus_addr,
            handle: handle.handle.0,
            status: 0,
        };
        self.hv.gnttab_unmap_grant_ref(&mut op)?;
        let status = GrantStatus(op.status);
        if !status.is_okay() {
            warn!("grants: unmapping handle {} failed: {}", handle.handle.0, status);
            return Err(GrantError::UnmapFailed(status));
        }
        Ok(())
    }

    // ── Publishing through xenstore ────────────────────────────

    fn data_path(name: &str) -> Result<heapless::String<64>, GrantError> {
        let mut path = heapless::String::new();
        write!(path, "data/{}", name).map_err(|_| GrantError::NameTooLong)?;
        Ok(path)
    }

    /// Share `frame` with `domain` and advertise the reference at
    /// `data/<name>`.
    pub fn publish(
        &self,
        store: &Store<'_, H>,
        name: &str,
        domain: DomId,
        frame: u64,
        readonly: bool,
    ) -> Result<GrantRef, GrantError> {
        let path = Self::data_path(name)?;
        let gref = self.share(domain, frame, readonly)?;
        if let Err(err) = store.write_integer(XBT_NIL, &path, i64::from(gref.0)) {
            if let Err(revoke) = self.unshare(gref) {
                warn!("grants: {} left shared after failed publish: {}", gref, revoke);
            }
            return Err(err.into());
        }
        info!("grants: published {} as {}", gref, path);
        Ok(gref)
    }

    /// Revoke the grant advertised at `data/<name>` and remove the node.
    pub fn unpublish(&self, store: &Store<'_, H>, name: &str) -> Result<GrantRef, GrantError> {
        let path = Self::data_path(name)?;
        let raw = store.read_integer(XBT_NIL, &path)?;
        let gref = GrantRef(u32::try_from(raw).map_err(|_| StoreError::Malformed)?);
        self.unshare(gref)?;
        store.remove(XBT_NIL, &path)?;
        Ok(gref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::pin::Pin;
    use khal::grant::NR_RESERVED_ENTRIES;
    use khal::StartInfo;
    use khal_mock::{Call, MockHypervisor, Op, GRANT_FRAME_BASE, STATUS_FRAME_BASE, STORE_MFN, STORE_PORT};

    type Table = GrantTable<'static, MockHypervisor>;

    fn events_for(hv: &'static MockHypervisor) -> &'static EventChannels<'static, MockHypervisor> {
        let events = Box::leak(Box::new(EventChannels::new(hv, hv.shared())));
        events.init(VirtAddr::new(0x1000), VirtAddr::new(0x2000)).unwrap();
        events
    }

    fn table_on(hv: &'static MockHypervisor, config: RuntimeConfig) -> Result<(Table, &'static GrantTableArea), GrantError> {
        let area: &'static GrantTableArea = Box::leak(Box::new(GrantTableArea::new()));
        let table = GrantTable::init(hv, events_for(hv), area, &config)?;
        Ok((table, area))
    }

    fn table() -> (&'static MockHypervisor, Table) {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        let (table, _) = table_on(hv, RuntimeConfig::DEFAULT).unwrap();
        (hv, table)
    }

    #[test]
    fn init_prefers_v2_and_maps_every_frame() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        let (table, area) = table_on(hv, RuntimeConfig::DEFAULT).unwrap();
        assert_eq!(table.version(), 2);
        assert_eq!(table.capacity(), 1024);
        assert_eq!(table.free_count(), 1024 - NR_RESERVED_ENTRIES);

        let calls = hv.calls();
        assert!(calls.contains(&Call::GnttabSetupTable(4)));
        for i in 0..4 {
            assert!(calls.contains(&Call::UpdateVaMapping {
                va: area.frame_addr(i).as_u64(),
                mfn: Mfn(GRANT_FRAME_BASE + i as u64),
            }));
        }
    }

    #[test]
    fn refused_v2_falls_back_to_v1() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::v1_only()));
        let (table, _) = table_on(hv, RuntimeConfig::DEFAULT).unwrap();
        assert_eq!(table.version(), 1);
        assert_eq!(table.capacity(), 2048);
        assert!(hv.calls().contains(&Call::GnttabSetVersion(1)));
    }

    #[test]
    fn setup_failure_is_reported() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        hv.fail(Op::GnttabSetupTable, HypercallError::ENOMEM);
        assert!(matches!(
            table_on(hv, RuntimeConfig::DEFAULT),
            Err(GrantError::Hypervisor(HypercallError::ENOMEM))
        ));
    }

    #[test]
    fn frame_count_is_bounded() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        let config = RuntimeConfig {
            grant_frames: 5,
            ..RuntimeConfig::DEFAULT
        };
        assert!(matches!(table_on(hv, config), Err(GrantError::TooManyFrames(5))));
    }

    #[test]
    fn readonly_share_fills_entry_and_ref_is_reused() {
        let (_, table) = table();
        let gref = table.share(DomId(7), 0x1234, true).unwrap();
        assert!((NR_RESERVED_ENTRIES..table.capacity()).contains(&gref.index()));
        assert_eq!(
            table.entry(gref),
            Some(GrantEntry {
                flags: GrantFlags::PERMIT_ACCESS | GrantFlags::READONLY,
                domid: DomId(7),
                frame: 0x1234,
            })
        );

        table.unshare(gref).unwrap();
        assert_eq!(
            table.entry(gref),
            Some(GrantEntry {
                flags: GrantFlags::empty(),
                domid: DomId(0),
                frame: 0,
            })
        );
        assert_eq!(table.share(DomId(7), 0x99, false), Ok(gref));
    }

    #[test]
    fn unshare_rejects_refs_that_are_not_shared() {
        let (_, table) = table();
        let gref = table.share(DomId(1), 5, false).unwrap();
        table.unshare(gref).unwrap();
        assert_eq!(table.unshare(gref), Err(GrantError::NotShared(gref)));
        assert_eq!(table.unshare(GrantRef(2)), Err(GrantError::NotShared(GrantRef(2))));
        assert_eq!(table.unshare(GrantRef(5000)), Err(GrantError::NotShared(GrantRef(5000))));
    }

    #[test]
    fn v2_maps_the_status_frame() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        let (_, area) = table_on(hv, RuntimeConfig::DEFAULT).unwrap();
        let calls = hv.calls();
        assert!(calls.contains(&Call::GnttabGetStatusFrames(1)));
        assert!(calls.contains(&Call::UpdateVaMapping {
            va: area.status_addr(0).as_u64(),
            mfn: Mfn(STATUS_FRAME_BASE),
        }));
    }

    #[test]
    fn v1_has_no_status_frames() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::v1_only()));
        table_on(hv, RuntimeConfig::DEFAULT).unwrap();
        assert_eq!(hv.count(|c| matches!(c, Call::GnttabGetStatusFrames(_))), 0);
    }

    #[test]
    fn status_frame_failure_is_reported() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        hv.fail(Op::GnttabGetStatusFrames, HypercallError::ENOSYS);
        assert!(matches!(
            table_on(hv, RuntimeConfig::DEFAULT),
            Err(GrantError::Hypervisor(HypercallError::ENOSYS))
        ));
    }

    #[test]
    fn v2_unshare_refuses_while_status_shows_a_mapping() {
        let (_, table) = table();
        let gref = table.share(DomId(1), 5, false).unwrap();
        table.usage(gref).fetch_or(GrantFlags::WRITING.bits(), Ordering::SeqCst);
        assert_eq!(table.unshare(gref), Err(GrantError::InUse(gref)));
        assert!(table.is_shared(gref));
        assert_eq!(
            table.entry(gref).map(|e| (e.flags, e.frame)),
            Some((GrantFlags::PERMIT_ACCESS, 5))
        );

        table.usage(gref).fetch_and(!GrantFlags::WRITING.bits(), Ordering::SeqCst);
        table.unshare(gref).unwrap();
        assert_eq!(table.entry(gref).map(|e| e.flags), Some(GrantFlags::empty()));
    }

    #[test]
    fn v2_status_words_do_not_alias_entry_flags() {
        let (_, table) = table();
        let gref = table.share(DomId(1), 5, false).unwrap();
        // A READING bit in the v2 entry flags is not how the hypervisor
        // reports a mapping, so it does not block the revoke.
        table.flags(gref).fetch_or(GrantFlags::READING.bits(), Ordering::SeqCst);
        table.unshare(gref).unwrap();
    }

    #[test]
    fn v1_unshare_refuses_while_flags_show_a_mapping() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::v1_only()));
        let (table, _) = table_on(hv, RuntimeConfig::DEFAULT).unwrap();
        let gref = table.share(DomId(1), 5, false).unwrap();
        table.usage(gref).fetch_or(GrantFlags::READING.bits(), Ordering::SeqCst);
        assert_eq!(table.unshare(gref), Err(GrantError::InUse(gref)));
        assert!(table.is_shared(gref));

        table.usage(gref).fetch_and(!GrantFlags::READING.bits(), Ordering::SeqCst);
        table.unshare(gref).unwrap();
    }

    #[test]
    fn v1_rejects_wide_frames() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::v1_only()));
        let (table, _) = table_on(hv, RuntimeConfig::DEFAULT).unwrap();
        assert_eq!(table.share(DomId(1), 1 << 33, false), Err(GrantError::FrameOutOfRange(1 << 33)));
        assert_eq!(table.free_count(), 2048 - NR_RESERVED_ENTRIES);
    }

    #[test]
    #[should_panic(expected = "domain shutdown")]
    fn exhausting_the_table_is_fatal() {
        let (_, table) = table();
        for _ in 0..table.capacity() - NR_RESERVED_ENTRIES {
            table.share(DomId(1), 1, false).unwrap();
        }
        let _ = table.share(DomId(1), 1, false);
    }

    #[test]
    fn consume_and_release_peer_grant() {
        let (hv, table) = table();
        hv.offer_grant(DomId(5), 20, 0x77, false);
        let local = VirtAddr::new(0x7000_0000);
        let handle = table.consume(DomId(5), GrantRef(20), local).unwrap();
        assert_eq!(handle.dev_bus_addr, 0x77 << 12);
        assert_eq!(hv.mapped_handles(), 1);

        table.release(handle, local).unwrap();
        assert_eq!(hv.mapped_handles(), 0);
        assert_eq!(table.release(handle, local), Err(GrantError::UnmapFailed(GrantStatus::BAD_HANDLE)));
    }

    #[test]
    fn consume_reports_map_status() {
        let (hv, table) = table();
        hv.offer_grant(DomId(5), 21, 0x78, true);
        let local = VirtAddr::new(0x7000_0000);
        assert_eq!(
            table.consume(DomId(5), GrantRef(21), local),
            Err(GrantError::MapFailed(GrantStatus::PERMISSION_DENIED))
        );
        assert_eq!(
            table.consume(DomId(5), GrantRef(99), local),
            Err(GrantError::MapFailed(GrantStatus::BAD_GNTREF))
        );
        assert_eq!(hv.mapped_handles(), 0);
    }

    #[test]
    fn publish_writes_ref_and_unpublish_revokes_it() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        let events = events_for(hv);
        let area: &'static GrantTableArea = Box::leak(Box::new(GrantTableArea::new()));
        let table = GrantTable::init(hv, events, area, &RuntimeConfig::DEFAULT).unwrap();
        let start = StartInfo::empty().with_store(STORE_MFN, STORE_PORT);
        let store: &'static Store<'static, MockHypervisor> = Box::leak(Box::new(Store::new(
            hv,
            events,
            hv.store_ring(),
            &start,
            &RuntimeConfig::DEFAULT,
        )));
        Pin::static_ref(store).init().unwrap();

        let gref = table.publish(store, "ring-ref", DomId(0), 0x4242, false).unwrap();
        let published = hv.with_store(|d| d.value("data/ring-ref")).unwrap();
        assert_eq!(published, gref.0.to_string().into_bytes());
        assert!(table.is_shared(gref));

        assert_eq!(table.unpublish(store, "ring-ref"), Ok(gref));
        assert!(!table.is_shared(gref));
        assert_eq!(hv.with_store(|d| d.value("data/ring-ref")), None);
    }

    #[test]
    fn failed_publish_gives_the_ref_back() {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        let events = events_for(hv);
        let area: &'static GrantTableArea = Box::leak(Box::new(GrantTableArea::new()));
        let table = GrantTable::init(hv, events, area, &RuntimeConfig::DEFAULT).unwrap();
        let store: &'static Store<'static, MockHypervisor> = Box::leak(Box::new(Store::new(
            hv,
            events,
            hv.store_ring(),
            &StartInfo::empty(),
            &RuntimeConfig::DEFAULT,
        )));
        let free = table.free_count();
        assert_eq!(
            table.publish(store, "ring-ref", DomId(0), 1, false),
            Err(GrantError::Store(StoreError::NotConnected))
        );
        assert_eq!(table.free_count(), free);
    }
}
