// =============================================================================
// micro-PV — Architecture Support
// =============================================================================
//
// Only x86_64 PV guests exist. This module holds the CPU-side view of a
// trapped context: the register file the hypervisor upcall stub saves, and
// the helper that builds a fresh one for a new thread of execution.
//
// The upcall stub pushes registers in `pt_regs` order. Any change to
// `RegisterFile` must be mirrored in the assembly.
// =============================================================================

pub mod regs;

pub use regs::{initialise_context, RegisterFile};
