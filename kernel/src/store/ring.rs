//! Byte transport over the xenstore request/response rings.
//!
//! Bytes go in one at a time. A writer that finds the request ring full
//! publishes what it has, kicks the backend and waits; a reader that finds
//! the response ring empty hands back the slots it consumed and waits.

use core::sync::atomic::{fence, Ordering};

use khal::store::{mask_xenstore_idx, StoreRing, XENSTORE_RING_SIZE};
use khal::{Hypervisor, Port};
use klog::{debug, warn};

use super::StoreError;

const SCRATCH: usize = 256;

pub(super) struct RingIo<'r, H: Hypervisor> {
    pub hv: &'r H,
    pub ring: &'r StoreRing,
    pub port: Port,
    pub yield_while_waiting: bool,
    pub spin_limit: Option<u32>,
}

impl<H: Hypervisor> RingIo<'_, H> {
    fn wait(&self, spins: &mut u32) -> Result<(), StoreError> {
        *spins += 1;
        if let Some(limit) = self.spin_limit {
            if *spins > limit {
                warn!("xenstore ring stalled after {} waits", limit);
                return Err(StoreError::TransportFailure);
            }
        }
        if self.yield_while_waiting {
            self.hv.sched_yield();
        } else {
            core::hint::spin_loop();
        }
        Ok(())
    }

    /// Append `bytes` to the request ring and publish them.
    pub fn write(&self, bytes: &[u8]) -> Result<(), StoreError> {
        if bytes.len() > XENSTORE_RING_SIZE {
            return Err(StoreError::PayloadTooLarge);
        }
        let ring = self.ring;
        let mut prod = ring.req_prod.load(Ordering::Relaxed);
        let mut spins = 0;
        for &byte in bytes {
            while prod.wrapping_sub(ring.req_cons.load(Ordering::Acquire)) as usize >= XENSTORE_RING_SIZE {
                fence(Ordering::Release);
                ring.req_prod.store(prod, Ordering::Release);
                if let Err(err) = self.hv.evtchn_send(self.port) {
                    debug!("xenstore: kick while the ring is full failed: {}", err);
                }
                self.wait(&mut spins)?;
            }
            ring.req[mask_xenstore_idx(prod)].store(byte, Ordering::Relaxed);
            prod = prod.wrapping_add(1);
        }
        // Bytes must be visible before the producer index moves.
        fence(Ordering::Release);
        ring.req_prod.store(prod, Ordering::Release);
        Ok(())
    }

    /// Fill `buf` from the response ring.
    pub fn read(&self, buf: &mut [u8]) -> Result<(), StoreError> {
        let ring = self.ring;
        let mut cons = ring.rsp_cons.load(Ordering::Relaxed);
        let mut spins = 0;
        for slot in buf.iter_mut() {
            while ring.rsp_prod.load(Ordering::Acquire) == cons {
                ring.rsp_cons.store(cons, Ordering::Release);
                self.wait(&mut spins)?;
            }
            *slot = ring.rsp[mask_xenstore_idx(cons)].load(Ordering::Relaxed);
            cons = cons.wrapping_add(1);
        }
        fence(Ordering::AcqRel);
        ring.rsp_cons.store(cons, Ordering::Release);
        Ok(())
    }

    /// Consume and drop `len` response bytes.
    pub fn discard(&self, mut len: usize) -> Result<(), StoreError> {
        let mut scratch = [0u8; SCRATCH];
        while len > 0 {
            let chunk = len.min(SCRATCH);
            self.read(&mut scratch[..chunk])?;
            len -= chunk;
        }
        Ok(())
    }
}
