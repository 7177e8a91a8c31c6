//! Shared info page.
//!
//! One page written by the hypervisor and read (and partly written) by the
//! guest: per-vCPU upcall state, the event-channel pending/mask bitmaps, the
//! per-vCPU time record and the wall clock. Every field is an atomic because
//! the hypervisor updates it behind the guest's back.
//!
//! Time and wall clock are protected by a version counter: odd means an
//! update is in flight, and a reader retries until it sees the same even
//! version before and after copying the fields.

use core::mem::size_of;
use core::sync::atomic::{fence, AtomicI8, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::types::Port;

/// vCPU slots in the shared info page.
pub const MAX_VIRT_CPUS: usize = 32;

/// Ports this guest uses. The 2-level ABI addresses 4096 on x86_64.
pub const NR_EVENT_CHANNELS: usize = 1024;

/// Bits per pending/mask word.
pub const BITS_PER_WORD: usize = 64;

/// Words in each pending/mask bitmap.
pub const EVTCHN_WORDS: usize = 64;

// --- Per-vCPU time ---

/// `vcpu_time_info`: TSC → system time conversion parameters.
#[repr(C)]
pub struct VcpuTimeInfo {
    pub version: AtomicU32,
    _pad0: u32,
    pub tsc_timestamp: AtomicU64,
    pub system_time: AtomicU64,
    pub tsc_to_system_mul: AtomicU32,
    pub tsc_shift: AtomicI8,
    pub flags: AtomicU8,
    _pad1: [u8; 2],
}

/// A consistent copy of [`VcpuTimeInfo`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRecord {
    pub version: u32,
    pub tsc_timestamp: u64,
    pub system_time: u64,
    pub tsc_to_system_mul: u32,
    pub tsc_shift: i8,
}

impl VcpuTimeInfo {
    pub const fn new() -> Self {
        Self {
            version: AtomicU32::new(0),
            _pad0: 0,
            tsc_timestamp: AtomicU64::new(0),
            system_time: AtomicU64::new(0),
            tsc_to_system_mul: AtomicU32::new(0),
            tsc_shift: AtomicI8::new(0),
            flags: AtomicU8::new(0),
            _pad1: [0; 2],
        }
    }

    /// Seqlock read of the whole record.
    pub fn snapshot(&self) -> TimeRecord {
        loop {
            let version = self.version.load(Ordering::Acquire);
            if version & 1 != 0 {
                core::hint::spin_loop();
                continue;
            }
            let record = TimeRecord {
                version,
                tsc_timestamp: self.tsc_timestamp.load(Ordering::Relaxed),
                system_time: self.system_time.load(Ordering::Relaxed),
                tsc_to_system_mul: self.tsc_to_system_mul.load(Ordering::Relaxed),
                tsc_shift: self.tsc_shift.load(Ordering::Relaxed),
            };
            fence(Ordering::Acquire);
            if self.version.load(Ordering::Relaxed) == version {
                return record;
            }
        }
    }

    /// Publish a new record with the writer side of the seqlock.
    ///
    /// Only the hypervisor does this on real hardware; simulators use it.
    pub fn publish(&self, record: &TimeRecord) {
        let version = self.version.load(Ordering::Relaxed);
        self.version.store(version | 1, Ordering::Relaxed);
        fence(Ordering::Release);
        self.tsc_timestamp.store(record.tsc_timestamp, Ordering::Relaxed);
        self.system_time.store(record.system_time, Ordering::Relaxed);
        self.tsc_to_system_mul.store(record.tsc_to_system_mul, Ordering::Relaxed);
        self.tsc_shift.store(record.tsc_shift, Ordering::Relaxed);
        self.version.store((version | 1).wrapping_add(1), Ordering::Release);
    }
}

// --- Per-vCPU info ---

/// `arch_vcpu_info` on x86_64.
#[repr(C)]
pub struct ArchVcpuInfo {
    pub cr2: AtomicU64,
    _pad: u64,
}

/// `vcpu_info`: 64 bytes per vCPU.
#[repr(C)]
pub struct VcpuInfo {
    /// Set by the hypervisor when an upcall is owed.
    pub upcall_pending: AtomicU8,
    /// Set by the guest to hold off upcalls.
    pub upcall_mask: AtomicU8,
    _pad0: [u8; 6],
    /// One bit per pending/mask word with something pending.
    pub pending_sel: AtomicU64,
    pub arch: ArchVcpuInfo,
    pub time: VcpuTimeInfo,
}

impl VcpuInfo {
    pub const fn new() -> Self {
        Self {
            upcall_pending: AtomicU8::new(0),
            upcall_mask: AtomicU8::new(0),
            _pad0: [0; 6],
            pending_sel: AtomicU64::new(0),
            arch: ArchVcpuInfo {
                cr2: AtomicU64::new(0),
                _pad: 0,
            },
            time: VcpuTimeInfo::new(),
        }
    }

    /// Set the upcall mask, returning whether it was already set.
    #[inline]
    pub fn mask_upcalls(&self) -> bool {
        let was = self.upcall_mask.swap(1, Ordering::AcqRel) != 0;
        fence(Ordering::SeqCst);
        was
    }

    /// Clear the upcall mask.
    #[inline]
    pub fn unmask_upcalls(&self) {
        fence(Ordering::SeqCst);
        self.upcall_mask.store(0, Ordering::Release);
        fence(Ordering::SeqCst);
    }

    #[inline]
    pub fn upcalls_masked(&self) -> bool {
        self.upcall_mask.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn is_upcall_pending(&self) -> bool {
        self.upcall_pending.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn clear_upcall_pending(&self) {
        self.upcall_pending.store(0, Ordering::Release);
    }

    #[inline]
    pub fn set_upcall_pending(&self) {
        self.upcall_pending.store(1, Ordering::Release);
    }

    /// Atomically take the whole pending selector.
    #[inline]
    pub fn take_pending_sel(&self) -> u64 {
        self.pending_sel.swap(0, Ordering::AcqRel)
    }

    /// Set selector bit `word`, returning whether it was already set.
    #[inline]
    pub fn test_and_set_sel(&self, word: usize) -> bool {
        let bit = 1u64 << word;
        self.pending_sel.fetch_or(bit, Ordering::AcqRel) & bit != 0
    }
}

const _: () = assert!(size_of::<VcpuTimeInfo>() == 32);
const _: () = assert!(size_of::<VcpuInfo>() == 64);

// --- Shared info ---

/// `arch_shared_info` on x86_64.
#[repr(C)]
pub struct ArchSharedInfo {
    pub max_pfn: AtomicU64,
    pub pfn_to_mfn_frame_list_list: AtomicU64,
    pub nmi_reason: AtomicU64,
    pub p2m_cr3: AtomicU64,
    pub p2m_vaddr: AtomicU64,
    pub p2m_generation: AtomicU64,
}

/// The shared info page.
#[repr(C)]
pub struct SharedInfo {
    pub vcpu_info: [VcpuInfo; MAX_VIRT_CPUS],
    pub evtchn_pending: [AtomicU64; EVTCHN_WORDS],
    pub evtchn_mask: [AtomicU64; EVTCHN_WORDS],
    pub wc_version: AtomicU32,
    pub wc_sec: AtomicU32,
    pub wc_nsec: AtomicU32,
    pub wc_sec_hi: AtomicU32,
    pub arch: ArchSharedInfo,
}

const _: () = assert!(size_of::<SharedInfo>() <= 4096);

/// Wall-clock time at system time zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WallClock {
    pub sec: u64,
    pub nsec: u32,
}

#[inline]
fn split(port: Port) -> (usize, u64) {
    (port.index() / BITS_PER_WORD, 1u64 << (port.index() % BITS_PER_WORD))
}

impl SharedInfo {
    pub const fn new() -> Self {
        Self {
            vcpu_info: [const { VcpuInfo::new() }; MAX_VIRT_CPUS],
            evtchn_pending: [const { AtomicU64::new(0) }; EVTCHN_WORDS],
            evtchn_mask: [const { AtomicU64::new(0) }; EVTCHN_WORDS],
            wc_version: AtomicU32::new(0),
            wc_sec: AtomicU32::new(0),
            wc_nsec: AtomicU32::new(0),
            wc_sec_hi: AtomicU32::new(0),
            arch: ArchSharedInfo {
                max_pfn: AtomicU64::new(0),
                pfn_to_mfn_frame_list_list: AtomicU64::new(0),
                nmi_reason: AtomicU64::new(0),
                p2m_cr3: AtomicU64::new(0),
                p2m_vaddr: AtomicU64::new(0),
                p2m_generation: AtomicU64::new(0),
            },
        }
    }

    #[inline]
    pub fn vcpu(&self, cpu: usize) -> &VcpuInfo {
        &self.vcpu_info[cpu]
    }

    // --- Port bitmaps ---

    #[inline]
    pub fn is_pending(&self, port: Port) -> bool {
        let (word, bit) = split(port);
        self.evtchn_pending[word].load(Ordering::Acquire) & bit != 0
    }

    #[inline]
    pub fn set_pending(&self, port: Port) -> bool {
        let (word, bit) = split(port);
        self.evtchn_pending[word].fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    #[inline]
    pub fn clear_pending(&self, port: Port) {
        let (word, bit) = split(port);
        self.evtchn_pending[word].fetch_and(!bit, Ordering::AcqRel);
    }

    #[inline]
    pub fn is_masked(&self, port: Port) -> bool {
        let (word, bit) = split(port);
        self.evtchn_mask[word].load(Ordering::Acquire) & bit != 0
    }

    #[inline]
    pub fn set_mask(&self, port: Port) {
        let (word, bit) = split(port);
        self.evtchn_mask[word].fetch_or(bit, Ordering::AcqRel);
    }

    #[inline]
    pub fn clear_mask(&self, port: Port) {
        let (word, bit) = split(port);
        self.evtchn_mask[word].fetch_and(!bit, Ordering::AcqRel);
    }

    /// Pending and unmasked ports of bitmap word `word`.
    #[inline]
    pub fn active_bits(&self, word: usize) -> u64 {
        self.evtchn_pending[word].load(Ordering::Acquire)
            & !self.evtchn_mask[word].load(Ordering::Acquire)
    }

    /// Deliver an event the way the hypervisor does: mark the port pending
    /// and, if it is unmasked and newly pending, raise the selector bit and
    /// the upcall flag of `cpu`.
    ///
    /// Guests never call this on hardware; simulators do.
    pub fn raise(&self, port: Port, cpu: usize) {
        if self.set_pending(port) || self.is_masked(port) {
            return;
        }
        let vcpu = self.vcpu(cpu);
        if !vcpu.test_and_set_sel(port.index() / BITS_PER_WORD) {
            vcpu.set_upcall_pending();
        }
    }

    // --- Wall clock ---

    /// Seqlock read of the wall clock.
    pub fn wallclock(&self) -> WallClock {
        loop {
            let version = self.wc_version.load(Ordering::Acquire);
            if version & 1 != 0 {
                core::hint::spin_loop();
                continue;
            }
            let lo = self.wc_sec.load(Ordering::Relaxed) as u64;
            let hi = self.wc_sec_hi.load(Ordering::Relaxed) as u64;
            let nsec = self.wc_nsec.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if self.wc_version.load(Ordering::Relaxed) == version {
                return WallClock {
                    sec: (hi << 32) | lo,
                    nsec,
                };
            }
        }
    }

    /// Writer side of the wall-clock seqlock, for simulators.
    pub fn set_wallclock(&self, clock: WallClock) {
        let version = self.wc_version.load(Ordering::Relaxed);
        self.wc_version.store(version | 1, Ordering::Relaxed);
        fence(Ordering::Release);
        self.wc_sec.store(clock.sec as u32, Ordering::Relaxed);
        self.wc_sec_hi.store((clock.sec >> 32) as u32, Ordering::Relaxed);
        self.wc_nsec.store(clock.nsec, Ordering::Relaxed);
        self.wc_version.store((version | 1).wrapping_add(1), Ordering::Release);
    }
}

impl Default for SharedInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_sets_selector_and_upcall_once() {
        let shared = SharedInfo::new();
        let port = Port(70);
        shared.raise(port, 0);
        assert!(shared.is_pending(port));
        assert!(shared.vcpu(0).is_upcall_pending());
        assert_eq!(shared.vcpu(0).take_pending_sel(), 1 << 1);
    }

    #[test]
    fn raise_on_masked_port_only_marks_pending() {
        let shared = SharedInfo::new();
        let port = Port(3);
        shared.set_mask(port);
        shared.raise(port, 0);
        assert!(shared.is_pending(port));
        assert!(!shared.vcpu(0).is_upcall_pending());
        assert_eq!(shared.active_bits(0), 0);
    }

    #[test]
    fn time_snapshot_sees_published_record() {
        let shared = SharedInfo::new();
        let record = TimeRecord {
            version: 0,
            tsc_timestamp: 1000,
            system_time: 5_000_000,
            tsc_to_system_mul: 1 << 31,
            tsc_shift: 1,
        };
        shared.vcpu(0).time.publish(&record);
        let seen = shared.vcpu(0).time.snapshot();
        assert_eq!(seen.version, 2);
        assert_eq!(seen.system_time, 5_000_000);
        assert_eq!(seen.tsc_shift, 1);
    }

    #[test]
    fn wallclock_carries_high_seconds() {
        let shared = SharedInfo::new();
        shared.set_wallclock(WallClock { sec: (1 << 32) + 7, nsec: 9 });
        assert_eq!(shared.wallclock(), WallClock { sec: (1 << 32) + 7, nsec: 9 });
    }
}
