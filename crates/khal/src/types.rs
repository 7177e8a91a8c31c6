//! Small identifiers shared by every hypervisor interface.
//!
//! Each one is a transparent newtype over the integer width the Xen ABI
//! uses, so a port can never be passed where a grant reference is expected.

use core::fmt;

/// An event-channel port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Port(pub u32);

impl Port {
    /// Raw port number as a table index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {}", self.0)
    }
}

/// A domain identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct DomId(pub u16);

impl DomId {
    /// `DOMID_SELF`: the calling domain.
    pub const SELF: DomId = DomId(0x7FF0);
    /// Domain 0, the control domain.
    pub const DOM0: DomId = DomId(0);
}

impl fmt::Display for DomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == DomId::SELF {
            f.write_str("DOMID_SELF")
        } else {
            write!(f, "dom{}", self.0)
        }
    }
}

/// A machine frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Mfn(pub u64);

impl fmt::Display for Mfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mfn {:#x}", self.0)
    }
}

/// An index into a grant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GrantRef(pub u32);

impl GrantRef {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for GrantRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gref {}", self.0)
    }
}

/// A handle returned by the hypervisor for a mapped foreign grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct GrantHandleId(pub u32);

/// Virtual IRQs a guest can bind to an event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Virq {
    /// Per-vCPU single-shot / periodic timer.
    Timer = 0,
    /// Debug request (`xl debug-keys`).
    Debug = 1,
    /// Console data available (dom0 only).
    Console = 2,
    /// Exceptional event for a domain.
    DomExc = 3,
    /// Trace buffer has records available.
    Tbuf = 4,
    /// Debugger attached or detached.
    Debugger = 6,
    /// Hypervisor console ring has new data.
    ConRing = 8,
}

/// Reasons for `SCHEDOP_shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ShutdownReason {
    Poweroff = 0,
    Reboot = 1,
    Suspend = 2,
    Crash = 3,
    Watchdog = 4,
}
