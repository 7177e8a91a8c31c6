// =============================================================================
// micro-PV — Event-Masked Critical Sections
// =============================================================================
//
// A PV guest has no CLI/STI. Instead the vCPU's `upcall_mask` byte in the
// shared info page tells the hypervisor not to deliver the event upcall.
// Any state touched both from normal context and from an event handler
// (binding table, grant free list, store gate) is mutated with the mask
// held.
//
// The guard remembers whether delivery was already masked when it was
// taken and only re-enables on drop if it was not, so nested sections
// leave the outer one intact:
//
//   let outer = events.critical_section();   // mask: 0 → 1
//   {
//       let inner = events.critical_section(); // mask: 1 → 1
//   }                                          // stays 1
//   drop(outer);                               // 1 → 0, pending events run
//
// =============================================================================

/// Something that can hold off event delivery.
pub trait Delivery: Sync {
    /// Mask delivery. Returns `true` if it was already masked.
    fn disable(&self) -> bool;

    /// Unmask delivery and run anything that became pending meanwhile.
    fn enable(&self);
}

/// RAII guard for a masked region.
///
/// Delivery is restored to its previous state when the guard drops.
#[must_use = "dropping the guard immediately re-enables delivery"]
pub struct CriticalSection<'a> {
    gate: &'a dyn Delivery,
    was_masked: bool,
}

impl<'a> CriticalSection<'a> {
    /// Mask delivery through `gate` until the guard drops.
    pub fn enter(gate: &'a dyn Delivery) -> Self {
        let was_masked = gate.disable();
        Self { gate, was_masked }
    }

    /// Whether this section is nested inside another one.
    #[inline]
    pub fn is_nested(&self) -> bool {
        self.was_masked
    }
}

impl Drop for CriticalSection<'_> {
    fn drop(&mut self) {
        if !self.was_masked {
            self.gate.enable();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeMask {
        masked: AtomicBool,
        enables: AtomicU32,
    }

    impl Delivery for FakeMask {
        fn disable(&self) -> bool {
            self.masked.swap(true, Ordering::SeqCst)
        }

        fn enable(&self) {
            self.masked.store(false, Ordering::SeqCst);
            self.enables.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl FakeMask {
        fn masked(&self) -> bool {
            self.masked.load(Ordering::SeqCst)
        }

        fn enables(&self) -> u32 {
            self.enables.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn nested_sections_restore_outer_state() {
        let mask = FakeMask::default();
        let outer = CriticalSection::enter(&mask);
        assert!(!outer.is_nested());
        {
            let inner = CriticalSection::enter(&mask);
            assert!(inner.is_nested());
        }
        assert!(mask.masked());
        assert_eq!(mask.enables(), 0);
        drop(outer);
        assert!(!mask.masked());
        assert_eq!(mask.enables(), 1);
    }

    #[test]
    fn section_inside_masked_context_never_unmasks() {
        let mask = FakeMask::default();
        mask.masked.store(true, Ordering::SeqCst);
        drop(CriticalSection::enter(&mask));
        assert!(mask.masked());
        assert_eq!(mask.enables(), 0);
    }
}
