//! `start_info`: the page the domain builder hands a PV guest at boot.

use core::mem::size_of;

use crate::types::{Mfn, Port};

/// `MAX_GUEST_CMDLINE`.
pub const MAX_GUEST_CMDLINE: usize = 1024;

/// Console location for an unprivileged guest.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ConsoleInfo {
    pub mfn: u64,
    pub evtchn: u32,
    _pad: u32,
}

/// `start_info_t` on x86_64.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct StartInfo {
    /// `"xen-<version>-<platform>"`.
    pub magic: [u8; 32],
    pub nr_pages: u64,
    /// Machine address of the shared info page.
    pub shared_info: u64,
    pub flags: u32,
    _pad0: u32,
    pub store_mfn: u64,
    pub store_evtchn: u32,
    _pad1: u32,
    pub console: ConsoleInfo,
    pub pt_base: u64,
    pub nr_pt_frames: u64,
    pub mfn_list: u64,
    pub mod_start: u64,
    pub mod_len: u64,
    pub cmd_line: [u8; MAX_GUEST_CMDLINE],
    pub first_p2m_pfn: u64,
    pub nr_p2m_frames: u64,
}

const _: () = assert!(size_of::<ConsoleInfo>() == 16);

impl StartInfo {
    /// An empty record (no store, no console).
    pub const fn empty() -> Self {
        Self {
            magic: [0; 32],
            nr_pages: 0,
            shared_info: 0,
            flags: 0,
            _pad0: 0,
            store_mfn: 0,
            store_evtchn: 0,
            _pad1: 0,
            console: ConsoleInfo {
                mfn: 0,
                evtchn: 0,
                _pad: 0,
            },
            pt_base: 0,
            nr_pt_frames: 0,
            mfn_list: 0,
            mod_start: 0,
            mod_len: 0,
            cmd_line: [0; MAX_GUEST_CMDLINE],
            first_p2m_pfn: 0,
            nr_p2m_frames: 0,
        }
    }

    /// Record advertising a xenstore ring at `mfn` signalled through `port`.
    pub const fn with_store(mut self, mfn: Mfn, port: Port) -> Self {
        self.store_mfn = mfn.0;
        self.store_evtchn = port.0;
        self
    }

    /// The xenstore event channel, if the builder advertised one.
    pub fn store_port(&self) -> Option<Port> {
        (self.store_evtchn != 0).then_some(Port(self.store_evtchn))
    }

    /// Magic string up to the first NUL.
    pub fn magic_str(&self) -> &str {
        let end = self.magic.iter().position(|&b| b == 0).unwrap_or(self.magic.len());
        core::str::from_utf8(&self.magic[..end]).unwrap_or("")
    }
}
