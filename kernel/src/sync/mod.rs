// =============================================================================
// micro-PV — Synchronization
// =============================================================================
//
// One vCPU, two contexts: normal code and the event upcall. Shared state is
// protected by `spin::Mutex` *inside* a `CriticalSection`, never by the
// mutex alone, otherwise an upcall arriving while normal code holds the
// lock spins forever.
//
// Lock ordering: take the critical section first, then the mutex. Drop the
// mutex guard before the section so re-enabling delivery (which may run
// handlers) happens with no lock held.
// =============================================================================

pub mod critical;

pub use critical::{CriticalSection, Delivery};
