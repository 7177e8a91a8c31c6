//! Saved register file of an interrupted context.

use x86_64::registers::rflags::RFlags;
use x86_64::registers::segmentation::{Segment, CS, SS};
use x86_64::VirtAddr;

/// Registers as pushed by the upcall entry stub (`struct pt_regs`).
///
/// The preemption hook hands this to the scheduler, which may rewrite it
/// to resume a different context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct RegisterFile {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    /// Error code or hypercall number; unused on the upcall path.
    pub orig_rax: u64,
    // Hardware frame
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

const _: () = assert!(core::mem::size_of::<RegisterFile>() == 21 * 8);

impl RegisterFile {
    /// Kernel stack selector and pointer, the pair the hypervisor must
    /// learn about when it changes.
    #[inline]
    pub fn stack(&self) -> (u64, u64) {
        (self.ss, self.rsp)
    }
}

/// Build the register file for a context that starts at `entry` on the
/// stack `[stack, stack + size)`.
///
/// Code and stack selectors are the current ones; interrupts are enabled.
pub fn initialise_context(entry: VirtAddr, stack: VirtAddr, size: u64) -> RegisterFile {
    RegisterFile {
        rip: entry.as_u64(),
        cs: u64::from(CS::get_reg().0),
        ss: u64::from(SS::get_reg().0),
        rsp: stack.as_u64() + size,
        eflags: RFlags::INTERRUPT_FLAG.bits(),
        ..RegisterFile::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_starts_at_entry_with_stack_top() {
        let regs = initialise_context(VirtAddr::new(0x40_1000), VirtAddr::new(0x80_0000), 0x4000);
        assert_eq!(regs.rip, 0x40_1000);
        assert_eq!(regs.rsp, 0x80_4000);
        assert_eq!(regs.eflags, RFlags::INTERRUPT_FLAG.bits());
        assert_eq!(regs.cs, u64::from(CS::get_reg().0));
        assert_eq!(regs.ss, u64::from(SS::get_reg().0));
        assert_eq!(regs.rax, 0);
    }
}
