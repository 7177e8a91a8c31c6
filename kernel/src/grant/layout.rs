//! Grant entry layouts.
//!
//! Both versions start with `flags: u16, domid: u16`; they differ in entry
//! size, in where and how wide the frame number is, and in where the
//! hypervisor reports a peer mapping. v1 sets READING/WRITING in the entry's
//! own flags; v2 keeps them in a separate array of 2-byte status words. The
//! version is fixed at bring-up, so the table holds a
//! `&'static dyn GrantLayout`.

use core::mem::{offset_of, size_of};
use core::ptr;

use khal::grant::{GrantEntryV1, GrantEntryV2, PAGE_SIZE};

pub trait GrantLayout: Sync {
    fn version(&self) -> u32;

    /// Bytes per entry.
    fn entry_size(&self) -> usize;

    /// Largest frame number an entry can carry.
    fn max_frame(&self) -> u64;

    /// Status frames needed alongside `grant_frames` entry frames. Zero
    /// when the status lives in the entry flags.
    fn status_frames(&self, grant_frames: usize) -> usize;

    /// Store the frame number of the entry at `entry`.
    ///
    /// # Safety
    ///
    /// `entry` must point at a live entry of this layout.
    unsafe fn write_frame(&self, entry: *mut u8, frame: u64);

    /// # Safety
    ///
    /// `entry` must point at a live entry of this layout.
    unsafe fn read_frame(&self, entry: *const u8) -> u64;
}

pub struct V1;
pub struct V2;

impl GrantLayout for V1 {
    fn version(&self) -> u32 {
        1
    }

    fn entry_size(&self) -> usize {
        size_of::<GrantEntryV1>()
    }

    fn max_frame(&self) -> u64 {
        u64::from(u32::MAX)
    }

    fn status_frames(&self, _grant_frames: usize) -> usize {
        0
    }

    unsafe fn write_frame(&self, entry: *mut u8, frame: u64) {
        // SAFETY: caller guarantees `entry` is a v1 entry; `frame` was range
        // checked against `max_frame`.
        unsafe {
            ptr::write_volatile(
                entry.add(offset_of!(GrantEntryV1, frame)).cast::<u32>(),
                frame as u32,
            )
        }
    }

    unsafe fn read_frame(&self, entry: *const u8) -> u64 {
        // SAFETY: caller guarantees `entry` is a v1 entry.
        u64::from(unsafe { ptr::read_volatile(entry.add(offset_of!(GrantEntryV1, frame)).cast::<u32>()) })
    }
}

impl GrantLayout for V2 {
    fn version(&self) -> u32 {
        2
    }

    fn entry_size(&self) -> usize {
        size_of::<GrantEntryV2>()
    }

    fn max_frame(&self) -> u64 {
        u64::MAX
    }

    fn status_frames(&self, grant_frames: usize) -> usize {
        let entries = grant_frames * PAGE_SIZE / self.entry_size();
        (entries * size_of::<u16>()).div_ceil(PAGE_SIZE)
    }

    unsafe fn write_frame(&self, entry: *mut u8, frame: u64) {
        // SAFETY: caller guarantees `entry` is a v2 entry, 8-byte aligned
        // because the table is page aligned and entries are 16 bytes.
        unsafe { ptr::write_volatile(entry.add(offset_of!(GrantEntryV2, frame)).cast::<u64>(), frame) }
    }

    unsafe fn read_frame(&self, entry: *const u8) -> u64 {
        // SAFETY: as for `write_frame`.
        unsafe { ptr::read_volatile(entry.add(offset_of!(GrantEntryV2, frame)).cast::<u64>()) }
    }
}

static V1_LAYOUT: V1 = V1;
static V2_LAYOUT: V2 = V2;

/// The layout for grant-table `version`, if we speak it.
pub fn for_version(version: u32) -> Option<&'static dyn GrantLayout> {
    match version {
        1 => Some(&V1_LAYOUT),
        2 => Some(&V2_LAYOUT),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_match_abi_sizes() {
        let v1 = for_version(1).unwrap();
        let v2 = for_version(2).unwrap();
        assert_eq!((v1.version(), v1.entry_size()), (1, 8));
        assert_eq!((v2.version(), v2.entry_size()), (2, 16));
        assert!(for_version(3).is_none());
    }

    #[test]
    fn only_v2_needs_status_frames() {
        assert_eq!(V1.status_frames(4), 0);
        assert_eq!(V2.status_frames(1), 1);
        assert_eq!(V2.status_frames(4), 1);
        assert_eq!(V2.status_frames(9), 2);
    }

    #[test]
    fn v1_frame_sits_after_flags_and_domid() {
        let mut entry = [0u64; 1];
        let base = entry.as_mut_ptr().cast::<u8>();
        unsafe { V1.write_frame(base, 0xdead_beef) };
        assert_eq!(entry[0].to_le_bytes()[4..], 0xdead_beef_u32.to_le_bytes());
        assert_eq!(unsafe { V1.read_frame(base) }, 0xdead_beef);
    }

    #[test]
    fn v2_frame_is_full_width() {
        let mut entry = [0u64; 2];
        let base = entry.as_mut_ptr().cast::<u8>();
        unsafe { V2.write_frame(base, 1 << 40) };
        assert_eq!(entry, [0, 1 << 40]);
    }
}
