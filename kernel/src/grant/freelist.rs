//! Free list of grant references.
//!
//! An intrusive singly linked list threaded through an array indexed by
//! reference: `next[0]` is the head and `next[r]` the successor of `r`.
//! Reference 0 is reserved, so 0 doubles as the end marker. A shared
//! bitmap tracks which references are handed out; every non-reserved
//! reference below `capacity` is in exactly one of the two.

use khal::grant::{NR_GRANT_FRAMES, NR_RESERVED_ENTRIES, PAGE_SIZE};
use khal::GrantRef;

/// Most entries any layout can have (v1, 8-byte entries).
pub const MAX_ENTRIES: usize = NR_GRANT_FRAMES * PAGE_SIZE / 8;

const WORDS: usize = MAX_ENTRIES / 64;

pub struct FreeList {
    next: [u32; MAX_ENTRIES],
    shared: [u64; WORDS],
    capacity: usize,
    free: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self {
            next: [0; MAX_ENTRIES],
            shared: [0; WORDS],
            capacity: 0,
            free: 0,
        }
    }

    /// Reset to `[NR_RESERVED_ENTRIES, capacity)` all free.
    pub fn seed(&mut self, capacity: usize) {
        let capacity = capacity.min(MAX_ENTRIES);
        self.next = [0; MAX_ENTRIES];
        self.shared = [0; WORDS];
        self.capacity = capacity;
        self.free = 0;
        for r in NR_RESERVED_ENTRIES..capacity {
            self.link(r as u32);
        }
    }

    fn link(&mut self, r: u32) {
        self.next[r as usize] = self.next[0];
        self.next[0] = r;
        self.free += 1;
    }

    #[inline]
    fn in_range(&self, r: u32) -> bool {
        (NR_RESERVED_ENTRIES..self.capacity).contains(&(r as usize))
    }

    /// Take the head. A head outside the usable range (0 when empty, or
    /// anything else when the list is corrupt) is returned as the error.
    pub fn pop(&mut self) -> Result<GrantRef, u32> {
        let head = self.next[0];
        if !self.in_range(head) {
            return Err(head);
        }
        self.next[0] = self.next[head as usize];
        self.shared[head as usize / 64] |= 1 << (head % 64);
        self.free -= 1;
        Ok(GrantRef(head))
    }

    /// Return `r` to the list. Fails unless `r` is currently handed out.
    pub fn push(&mut self, r: GrantRef) -> bool {
        if !self.is_shared(r) {
            return false;
        }
        self.shared[r.index() / 64] &= !(1 << (r.0 % 64));
        self.link(r.0);
        true
    }

    pub fn is_shared(&self, r: GrantRef) -> bool {
        self.in_range(r.0) && self.shared[r.index() / 64] & (1 << (r.0 % 64)) != 0
    }

    #[inline]
    pub fn free_count(&self) -> usize {
        self.free
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Walk the list from the head.
    pub fn iter(&self) -> impl Iterator<Item = GrantRef> + '_ {
        let mut cur = self.next[0];
        core::iter::from_fn(move || {
            if cur == 0 {
                return None;
            }
            let r = cur;
            cur = self.next[r as usize];
            Some(GrantRef(r))
        })
        .take(self.capacity)
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}
