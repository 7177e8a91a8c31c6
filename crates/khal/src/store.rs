//! Xenstore wire protocol (`xs_wire.h`).
//!
//! Requests and responses travel through two 1024-byte byte rings in a
//! page shared with the store daemon. A message is a 16-byte header followed
//! by exactly `len` payload bytes.

use core::fmt;
use core::mem::size_of;
use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Bytes in each of the request and response rings.
pub const XENSTORE_RING_SIZE: usize = 1024;

/// Largest payload the daemon accepts.
pub const XENSTORE_PAYLOAD_MAX: usize = 4096;

/// `XBT_NIL`: operate outside any transaction.
pub const XBT_NIL: u32 = 0;

/// Ring index → byte offset.
#[inline]
pub const fn mask_xenstore_idx(idx: u32) -> usize {
    (idx as usize) & (XENSTORE_RING_SIZE - 1)
}

// --- Message types ---

/// Message types understood by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum XsdType {
    Directory = 1,
    Read = 2,
    GetPerms = 3,
    Watch = 4,
    Unwatch = 5,
    TransactionStart = 6,
    TransactionEnd = 7,
    Introduce = 8,
    Release = 9,
    GetDomainPath = 10,
    Write = 11,
    Mkdir = 12,
    Rm = 13,
    SetPerms = 14,
    WatchEvent = 15,
    Error = 16,
}

impl XsdType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Directory,
            2 => Self::Read,
            3 => Self::GetPerms,
            4 => Self::Watch,
            5 => Self::Unwatch,
            6 => Self::TransactionStart,
            7 => Self::TransactionEnd,
            8 => Self::Introduce,
            9 => Self::Release,
            10 => Self::GetDomainPath,
            11 => Self::Write,
            12 => Self::Mkdir,
            13 => Self::Rm,
            14 => Self::SetPerms,
            15 => Self::WatchEvent,
            16 => Self::Error,
            _ => return None,
        })
    }
}

impl fmt::Display for XsdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Directory => "DIRECTORY",
            Self::Read => "READ",
            Self::GetPerms => "GET_PERMS",
            Self::Watch => "WATCH",
            Self::Unwatch => "UNWATCH",
            Self::TransactionStart => "TRANSACTION_START",
            Self::TransactionEnd => "TRANSACTION_END",
            Self::Introduce => "INTRODUCE",
            Self::Release => "RELEASE",
            Self::GetDomainPath => "GET_DOMAIN_PATH",
            Self::Write => "WRITE",
            Self::Mkdir => "MKDIR",
            Self::Rm => "RM",
            Self::SetPerms => "SET_PERMS",
            Self::WatchEvent => "WATCH_EVENT",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

// --- Header ---

/// `xsd_sockmsg`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct XsdSockMsg {
    pub kind: u32,
    pub req_id: u32,
    pub tx_id: u32,
    pub len: u32,
}

const _: () = assert!(size_of::<XsdSockMsg>() == XsdSockMsg::SIZE);

impl XsdSockMsg {
    pub const SIZE: usize = 16;

    pub const fn new(kind: XsdType, req_id: u32, tx_id: u32, len: u32) -> Self {
        Self {
            kind: kind as u32,
            req_id,
            tx_id,
            len,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.kind.to_le_bytes());
        out[4..8].copy_from_slice(&self.req_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.tx_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.len.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        Self {
            kind: word(0),
            req_id: word(4),
            tx_id: word(8),
            len: word(12),
        }
    }

    #[inline]
    pub fn message_type(&self) -> Option<XsdType> {
        XsdType::from_raw(self.kind)
    }
}

// --- Shared ring ---

/// `xenstore_domain_interface`.
///
/// The producer writes bytes then publishes its index with release
/// ordering; the consumer reads the index with acquire ordering before
/// touching the bytes. Indices are free-running and masked on access.
#[repr(C)]
pub struct StoreRing {
    pub req: [AtomicU8; XENSTORE_RING_SIZE],
    pub rsp: [AtomicU8; XENSTORE_RING_SIZE],
    pub req_cons: AtomicU32,
    pub req_prod: AtomicU32,
    pub rsp_cons: AtomicU32,
    pub rsp_prod: AtomicU32,
}

const _: () = assert!(size_of::<StoreRing>() == 2 * XENSTORE_RING_SIZE + 16);

impl StoreRing {
    pub const fn new() -> Self {
        Self {
            req: [const { AtomicU8::new(0) }; XENSTORE_RING_SIZE],
            rsp: [const { AtomicU8::new(0) }; XENSTORE_RING_SIZE],
            req_cons: AtomicU32::new(0),
            req_prod: AtomicU32::new(0),
            rsp_cons: AtomicU32::new(0),
            rsp_prod: AtomicU32::new(0),
        }
    }

    /// Bytes queued in the request ring and not yet consumed.
    #[inline]
    pub fn request_backlog(&self) -> u32 {
        self.req_prod
            .load(Ordering::Acquire)
            .wrapping_sub(self.req_cons.load(Ordering::Acquire))
    }

    /// Bytes available in the response ring.
    #[inline]
    pub fn response_available(&self) -> u32 {
        self.rsp_prod
            .load(Ordering::Acquire)
            .wrapping_sub(self.rsp_cons.load(Ordering::Acquire))
    }
}

impl Default for StoreRing {
    fn default() -> Self {
        Self::new()
    }
}
