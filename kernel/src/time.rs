//! System time from the hypervisor's per-vCPU time record.
//!
//! Xen publishes, per vCPU, a system time in nanoseconds sampled at some
//! TSC value, plus the factors that convert TSC ticks to nanoseconds. The
//! guest keeps a shadow copy and extrapolates from the TSC:
//!
//! ```text
//! now = system_time + ((tsc - tsc_timestamp) << shift) * mul >> 32
//! ```
//!
//! A negative `shift` shifts right.

use khal::shared_info::{TimeRecord, WallClock};
use khal::{Hypervisor, SharedInfo};
use spin::Mutex;

use crate::sync::{CriticalSection, Delivery};

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Convert a TSC delta to nanoseconds.
#[inline]
pub fn scale_delta(delta: u64, mul: u32, shift: i8) -> u64 {
    let delta = u128::from(delta);
    let shifted = if shift < 0 {
        delta >> u32::from(shift.unsigned_abs())
    } else {
        delta << u32::from(shift.unsigned_abs())
    };
    ((shifted * u128::from(mul)) >> 32) as u64
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeOfDay {
    pub sec: u64,
    pub nsec: u32,
}

pub struct Clock<'a, H: Hypervisor> {
    hv: &'a H,
    shared: &'a SharedInfo,
    gate: &'a dyn Delivery,
    shadow: Mutex<TimeRecord>,
    wall: Mutex<WallClock>,
}

impl<'a, H: Hypervisor> Clock<'a, H> {
    /// A clock whose shadow is filled from the shared page straight away.
    pub fn new(hv: &'a H, shared: &'a SharedInfo, gate: &'a dyn Delivery) -> Self {
        let clock = Self {
            hv,
            shared,
            gate,
            shadow: Mutex::new(TimeRecord::default()),
            wall: Mutex::new(WallClock::default()),
        };
        clock.update();
        clock
    }

    /// Refresh both shadows from the shared info page.
    pub fn update(&self) {
        let record = self.shared.vcpu(0).time.snapshot();
        let wall = self.shared.wallclock();
        let _cs = CriticalSection::enter(self.gate);
        *self.shadow.lock() = record;
        *self.wall.lock() = wall;
    }

    fn shadow(&self) -> TimeRecord {
        let _cs = CriticalSection::enter(self.gate);
        let record = *self.shadow.lock();
        record
    }

    fn is_current(&self, shadow: &TimeRecord) -> bool {
        use core::sync::atomic::Ordering;
        shadow.version == self.shared.vcpu(0).time.version.load(Ordering::Acquire)
    }

    /// Nanoseconds of system time since the domain was created.
    pub fn monotonic_ns(&self) -> u64 {
        loop {
            let shadow = self.shadow();
            let delta = self.hv.read_tsc().wrapping_sub(shadow.tsc_timestamp);
            let now = shadow.system_time + scale_delta(delta, shadow.tsc_to_system_mul, shadow.tsc_shift);
            if self.is_current(&shadow) {
                return now;
            }
            self.update();
        }
    }

    pub fn time_of_day(&self) -> TimeOfDay {
        let now = self.monotonic_ns();
        let wall = {
            let _cs = CriticalSection::enter(self.gate);
            let wall = *self.wall.lock();
            wall
        };
        let nsec = u64::from(wall.nsec) + now;
        TimeOfDay {
            sec: wall.sec + nsec / NSEC_PER_SEC,
            nsec: (nsec % NSEC_PER_SEC) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventChannels;
    use khal_mock::MockHypervisor;

    fn clock() -> (&'static MockHypervisor, Clock<'static, MockHypervisor>) {
        let hv: &'static MockHypervisor = Box::leak(Box::new(MockHypervisor::new()));
        let events = Box::leak(Box::new(EventChannels::new(hv, hv.shared())));
        (hv, Clock::new(hv, hv.shared(), events))
    }

    #[test]
    fn scale_handles_both_shift_directions() {
        assert_eq!(scale_delta(1000, 1 << 31, 1), 1000);
        assert_eq!(scale_delta(1000, 1 << 31, -1), 250);
        assert_eq!(scale_delta(3, u32::MAX, 0), 2);
        assert_eq!(scale_delta(u64::MAX, 1 << 31, 1), u64::MAX);
    }

    #[test]
    fn monotonic_follows_tsc() {
        let (hv, clock) = clock();
        assert_eq!(clock.monotonic_ns(), 0);
        hv.set_tsc(5_000);
        assert_eq!(clock.monotonic_ns(), 5_000);
    }

    #[test]
    fn stale_shadow_is_refreshed() {
        let (hv, clock) = clock();
        hv.set_tsc(7_000);
        hv.shared().vcpu(0).time.publish(&TimeRecord {
            version: 0,
            tsc_timestamp: 5_000,
            system_time: 1_000_000,
            tsc_to_system_mul: 1 << 31,
            tsc_shift: 1,
        });
        assert_eq!(clock.monotonic_ns(), 1_002_000);
    }

    #[test]
    fn time_of_day_carries_into_seconds() {
        let (hv, clock) = clock();
        hv.shared().set_wallclock(WallClock {
            sec: 100,
            nsec: 999_999_000,
        });
        clock.update();
        hv.set_tsc(5_000);
        assert_eq!(clock.time_of_day(), TimeOfDay { sec: 101, nsec: 4_000 });
    }
}
