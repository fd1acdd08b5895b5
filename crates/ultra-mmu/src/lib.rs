//! R4300i virtual → physical address translation with flattened TLB lookup maps.
//!
//! The 32-bit virtual space splits into fixed segments: two direct-mapped
//! kernel windows (`kseg0` cached, `kseg1` uncached) translate by constant
//! offset subtraction onto the same physical range; everything else (`kuseg`,
//! `kseg2`/`kseg3`) goes through the TLB.
//!
//! This crate does not model the 32-entry associative TLB itself; that lives
//! in the COP0 emulation, which notifies us of mapping changes. We keep two
//! *flattened* per-page lookup tables (one slot per 4KiB virtual page) so a
//! translation is a single indexed load, which is what the recompiler's guard
//! checks and the interpreter's address resolution both want.

#![forbid(unsafe_code)]

/// 32-bit virtual address in the emulated machine's address space.
pub type VAddr = u32;
/// 32-bit physical address on the emulated bus.
pub type PAddr = u32;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u32 = PAGE_SIZE - 1;

/// Number of 4KiB pages in the 32-bit virtual space.
const PAGE_COUNT: usize = 1 << 20;

pub const KSEG0_BASE: u32 = 0x8000_0000;
pub const KSEG1_BASE: u32 = 0xA000_0000;

/// Segment a virtual address belongs to. Classification is total and
/// deterministic: every address is in exactly one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    /// `0x8000_0000..=0x9FFF_FFFF`: cached view, paddr = vaddr - 0x8000_0000.
    Kseg0,
    /// `0xA000_0000..=0xBFFF_FFFF`: uncached view, paddr = vaddr - 0xA000_0000.
    Kseg1,
    /// `kuseg`/`kseg2`/`kseg3`: translation requires a TLB entry.
    Mapped,
}

impl Segment {
    #[inline]
    pub fn of(vaddr: VAddr) -> Segment {
        match vaddr {
            KSEG0_BASE..=0x9FFF_FFFF => Segment::Kseg0,
            KSEG1_BASE..=0xBFFF_FFFF => Segment::Kseg1,
            _ => Segment::Mapped,
        }
    }

    /// Fixed-offset translation for the direct-mapped segments; `None` for the
    /// TLB-mapped segment.
    #[inline]
    pub fn direct_translate(vaddr: VAddr) -> Option<PAddr> {
        match Segment::of(vaddr) {
            Segment::Kseg0 => Some(vaddr - KSEG0_BASE),
            Segment::Kseg1 => Some(vaddr - KSEG1_BASE),
            Segment::Mapped => None,
        }
    }
}

/// Flattened virtual-page lookup tables fed by TLB change notifications.
///
/// One slot per 4KiB virtual page, holding the physical page base. The write
/// map holds a slot only for pages mapped writable, so a store translation
/// through it fails on read-only mappings. Invariant: every page present in
/// the write map is present in the read map.
///
/// Mapping is idempotent: re-mapping a page overwrites its slots. Callers
/// serialize `map`/`unmap` against accesses to the same pages; there is no
/// internal locking.
pub struct TlbMaps {
    read: Box<[Option<PAddr>]>,
    write: Box<[Option<PAddr>]>,
}

impl TlbMaps {
    pub fn new() -> Self {
        Self {
            read: vec![None; PAGE_COUNT].into_boxed_slice(),
            write: vec![None; PAGE_COUNT].into_boxed_slice(),
        }
    }

    /// Install `len` bytes of mapping (rounded up to whole pages) from `vaddr`
    /// onto `paddr`. Pages past the end of the virtual space are ignored.
    pub fn map(&mut self, vaddr: VAddr, len: u32, paddr: PAddr, read_only: bool) {
        let pages = (u64::from(len) + u64::from(PAGE_MASK)) >> PAGE_SHIFT;
        let first = (vaddr >> PAGE_SHIFT) as usize;
        for i in 0..pages as usize {
            let Some(slot) = first.checked_add(i).filter(|p| *p < PAGE_COUNT) else {
                break;
            };
            let pbase = (paddr & !PAGE_MASK).wrapping_add((i as u32) << PAGE_SHIFT);
            self.read[slot] = Some(pbase);
            self.write[slot] = (!read_only).then_some(pbase);
        }
    }

    /// Clear `len` bytes of mapping (rounded up to whole pages) from `vaddr`
    /// in both maps.
    pub fn unmap(&mut self, vaddr: VAddr, len: u32) {
        let pages = (u64::from(len) + u64::from(PAGE_MASK)) >> PAGE_SHIFT;
        let first = (vaddr >> PAGE_SHIFT) as usize;
        for i in 0..pages as usize {
            let Some(slot) = first.checked_add(i).filter(|p| *p < PAGE_COUNT) else {
                break;
            };
            self.read[slot] = None;
            self.write[slot] = None;
        }
    }

    /// Drop every installed entry (machine reset).
    pub fn clear(&mut self) {
        self.read.fill(None);
        self.write.fill(None);
    }

    #[inline]
    pub fn read_lookup(&self, vaddr: VAddr) -> Option<PAddr> {
        self.read[(vaddr >> PAGE_SHIFT) as usize].map(|pbase| pbase | (vaddr & PAGE_MASK))
    }

    #[inline]
    pub fn write_lookup(&self, vaddr: VAddr) -> Option<PAddr> {
        self.write[(vaddr >> PAGE_SHIFT) as usize].map(|pbase| pbase | (vaddr & PAGE_MASK))
    }

    /// Translate for a read-class access. Direct-mapped segments always
    /// succeed; the mapped segment reports a miss as `None`, never a silent
    /// zero mapping.
    #[inline]
    pub fn translate_vaddr(&self, vaddr: VAddr) -> Option<PAddr> {
        Segment::direct_translate(vaddr).or_else(|| self.read_lookup(vaddr))
    }

    /// Translate for a store. Read-only mappings fail here even though they
    /// translate for reads.
    #[inline]
    pub fn translate_vaddr_write(&self, vaddr: VAddr) -> Option<PAddr> {
        Segment::direct_translate(vaddr).or_else(|| self.write_lookup(vaddr))
    }

    #[inline]
    pub fn valid_vaddr(&self, vaddr: VAddr) -> bool {
        self.translate_vaddr(vaddr).is_some()
    }
}

impl Default for TlbMaps {
    fn default() -> Self {
        Self::new()
    }
}
