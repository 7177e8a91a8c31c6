//! Grant-table ABI.
//!
//! A grant table is a guest-owned array of records the hypervisor reads to
//! decide which foreign domain may touch which of our frames. Two record
//! layouts exist; the guest negotiates one with `GNTTABOP_set_version`.

use core::cell::UnsafeCell;
use core::fmt;
use core::mem::size_of;

use bitflags::bitflags;
use x86_64::VirtAddr;

/// Page size on x86_64 PV guests.
pub const PAGE_SIZE: usize = 4096;

/// Frames backing the local grant table.
pub const NR_GRANT_FRAMES: usize = 4;

/// Frames backing the v2 status array. Each reference has a 2-byte status
/// word, so one page covers every reference `NR_GRANT_FRAMES` v2 frames hold.
pub const NR_STATUS_FRAMES: usize = 1;

/// References below this index are reserved for the toolstack.
pub const NR_RESERVED_ENTRIES: usize = 8;

bitflags! {
    /// `GTF_*` flags of a shared grant entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GrantFlags: u16 {
        /// The peer may map or copy this frame.
        const PERMIT_ACCESS   = 1 << 0;
        /// The peer may transfer a frame into this entry.
        const ACCEPT_TRANSFER = 1 << 1;
        /// Peer mappings must be read-only.
        const READONLY        = 1 << 2;
        /// Set by the hypervisor while the peer holds a read mapping.
        const READING         = 1 << 3;
        /// Set by the hypervisor while the peer holds a write mapping.
        const WRITING         = 1 << 4;
        const PWT             = 1 << 5;
        const PCD             = 1 << 6;
        const PAT             = 1 << 7;
    }
}

bitflags! {
    /// `GNTMAP_*` flags for `GNTTABOP_map_grant_ref`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const DEVICE_MAP      = 1 << 0;
        const HOST_MAP        = 1 << 1;
        const READONLY        = 1 << 2;
        const APPLICATION_MAP = 1 << 3;
        const CONTAINS_PTE    = 1 << 4;
    }
}

// --- Entry layouts ---

/// Version 1 grant entry (8 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GrantEntryV1 {
    pub flags: u16,
    pub domid: u16,
    pub frame: u32,
}

/// Version 2 full-page grant entry (16 bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GrantEntryV2 {
    pub flags: u16,
    pub domid: u16,
    pub pad0: u32,
    pub frame: u64,
}

const _: () = assert!(size_of::<GrantEntryV1>() == 8);
const _: () = assert!(size_of::<GrantEntryV2>() == 16);

// --- Status codes ---

/// `GNTST_*` status of a grant-table operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct GrantStatus(pub i16);

impl GrantStatus {
    pub const OKAY: GrantStatus = GrantStatus(0);
    pub const GENERAL_ERROR: GrantStatus = GrantStatus(-1);
    pub const BAD_DOMAIN: GrantStatus = GrantStatus(-2);
    pub const BAD_GNTREF: GrantStatus = GrantStatus(-3);
    pub const BAD_HANDLE: GrantStatus = GrantStatus(-4);
    pub const BAD_VIRT_ADDR: GrantStatus = GrantStatus(-5);
    pub const BAD_DEV_ADDR: GrantStatus = GrantStatus(-6);
    pub const NO_DEVICE_SPACE: GrantStatus = GrantStatus(-7);
    pub const PERMISSION_DENIED: GrantStatus = GrantStatus(-8);
    pub const BAD_PAGE: GrantStatus = GrantStatus(-9);
    pub const BAD_COPY_ARG: GrantStatus = GrantStatus(-10);
    pub const ADDRESS_TOO_BIG: GrantStatus = GrantStatus(-11);
    pub const EAGAIN: GrantStatus = GrantStatus(-12);

    #[inline]
    pub const fn is_okay(self) -> bool {
        self.0 == 0
    }

    fn text(self) -> &'static str {
        match self.0 {
            0 => "okay",
            -1 => "undefined error",
            -2 => "unrecognised domain id",
            -3 => "unrecognised or inappropriate gntref",
            -4 => "unrecognised or inappropriate handle",
            -5 => "inappropriate virtual address to map",
            -6 => "inappropriate device address to unmap",
            -7 => "out of space in I/O MMU",
            -8 => "not enough privilege for operation",
            -9 => "specified page was invalid for op",
            -10 => "copy arguments cross page boundary",
            -11 => "page address size too large",
            -12 => "operation not done; try again",
            _ => "unknown status",
        }
    }
}

impl fmt::Display for GrantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.text(), self.0)
    }
}

// --- Operation records ---

/// Argument of `GNTTABOP_map_grant_ref`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct MapGrantRef {
    pub host_addr: u64,
    pub flags: u32,
    pub gref: u32,
    pub dom: u16,
    pub status: i16,
    pub handle: u32,
    pub dev_bus_addr: u64,
}

/// Argument of `GNTTABOP_unmap_grant_ref`.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct UnmapGrantRef {
    pub host_addr: u64,
    pub dev_bus_addr: u64,
    pub handle: u32,
    pub status: i16,
}

const _: () = assert!(size_of::<MapGrantRef>() == 32);
const _: () = assert!(size_of::<UnmapGrantRef>() == 24);

// --- Table memory ---

/// Page-aligned virtual range the grant-table frames are mapped over,
/// followed by the page the v2 status frame is mapped over.
///
/// The guest never owns these bytes in the usual sense: after
/// `GNTTABOP_setup_table` each page is remapped onto a hypervisor-supplied
/// frame, and the peer reads the records concurrently. All access therefore
/// goes through raw pointers with volatile stores.
#[repr(C, align(4096))]
pub struct GrantTableArea {
    pages: UnsafeCell<[[u8; PAGE_SIZE]; NR_GRANT_FRAMES]>,
    status: UnsafeCell<[[u8; PAGE_SIZE]; NR_STATUS_FRAMES]>,
}

// SAFETY: the area is only written through volatile raw-pointer accesses
// whose exclusivity is arranged by the grant allocator's free list.
unsafe impl Sync for GrantTableArea {}

impl GrantTableArea {
    pub const fn new() -> Self {
        Self {
            pages: UnsafeCell::new([[0; PAGE_SIZE]; NR_GRANT_FRAMES]),
            status: UnsafeCell::new([[0; PAGE_SIZE]; NR_STATUS_FRAMES]),
        }
    }

    /// Base pointer of the table.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.pages.get().cast()
    }

    /// Virtual address of table frame `frame`.
    #[inline]
    pub fn frame_addr(&self, frame: usize) -> VirtAddr {
        VirtAddr::from_ptr(self.base()) + (frame * PAGE_SIZE) as u64
    }

    /// Base pointer of the v2 status array.
    #[inline]
    pub fn status_base(&self) -> *mut u8 {
        self.status.get().cast()
    }

    /// Virtual address of status frame `frame`.
    #[inline]
    pub fn status_addr(&self, frame: usize) -> VirtAddr {
        VirtAddr::from_ptr(self.status_base()) + (frame * PAGE_SIZE) as u64
    }

    /// Size of the entry pages in bytes.
    #[inline]
    pub const fn len(&self) -> usize {
        NR_GRANT_FRAMES * PAGE_SIZE
    }
}

impl Default for GrantTableArea {
    fn default() -> Self {
        Self::new()
    }
}
