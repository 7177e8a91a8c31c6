//! Hypervisor Abstraction Layer.
//!
//! The Xen PV ABI as seen by a 64-bit guest: the hypercall surface, the
//! shared info page, grant-table records, the xenstore ring and the start
//! info page. Bare-metal hypercalls live in [`x86`] and exist only when
//! building for the guest target.
#![cfg_attr(not(test), no_std)]

pub mod grant;
pub mod hypercall;
pub mod shared_info;
pub mod start_info;
pub mod store;
pub mod types;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86;

pub use hypercall::{HvResult, HypercallError, Hypervisor};
pub use shared_info::{SharedInfo, VcpuInfo};
pub use start_info::StartInfo;
pub use types::{DomId, GrantHandleId, GrantRef, Mfn, Port, ShutdownReason, Virq};
