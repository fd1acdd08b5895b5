use crate::FastMemError;
use bitflags::bitflags;
use region::{Allocation, Protection};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Guest pages are 4KiB and the arena is managed at that granule. Hosts with
/// larger pages cannot express per-guest-page protection and are rejected at
/// reservation time.
pub const PAGE_SIZE: usize = 0x1000;

/// One slot per 32-bit physical address.
pub const ARENA_LEN: u64 = 1 << 32;

const PAGE_COUNT: usize = 1 << 20;

bitflags! {
    /// Commit and protection state of one arena page.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageState: u8 {
        const COMMITTED = 1 << 0;
        const WRITE_PROTECTED = 1 << 1;
    }
}

/// A reserved 4GiB host mapping indexed by guest physical address.
///
/// Reservation commits nothing: every page starts inaccessible. `commit`
/// makes a range plain read/write memory, `write_protect`/`unprotect` toggle
/// store access on committed ranges, `decommit` returns a range to the
/// inaccessible state. All range arguments are rounded outward to whole
/// pages.
pub struct HostArena {
    alloc: Allocation,
    base: *mut u8,
    pages: Box<[PageState]>,
}

// The backing is anonymous memory owned by `alloc`; `base` is derived from it
// and there is no thread affinity.
unsafe impl Send for HostArena {}

impl HostArena {
    pub fn reserve() -> Result<Self, FastMemError> {
        let len = usize::try_from(ARENA_LEN).map_err(|_| FastMemError::Unsupported)?;
        if region::page::size() != PAGE_SIZE {
            return Err(FastMemError::Unsupported);
        }
        let mut alloc = region::alloc(len, Protection::NONE).map_err(FastMemError::Reserve)?;
        let base = alloc.as_mut_ptr::<u8>();
        debug!(base = ?base, "reserved guest arena");
        Ok(Self {
            alloc,
            base,
            pages: vec![PageState::empty(); PAGE_COUNT].into_boxed_slice(),
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.alloc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alloc.len() == 0
    }

    /// Host pointer for a physical address.
    #[inline]
    pub fn ptr_at(&self, paddr: u32) -> *mut u8 {
        self.base.wrapping_add(paddr as usize)
    }

    pub fn page_state(&self, paddr: u32) -> PageState {
        self.pages[(paddr as usize) / PAGE_SIZE]
    }

    /// Make `[paddr, paddr + len)` plain read/write memory.
    pub fn commit(&mut self, paddr: u32, len: usize) -> Result<(), FastMemError> {
        self.protect_range(paddr, len, Protection::READ_WRITE)?;
        self.mark(paddr, len, |s| {
            s.insert(PageState::COMMITTED);
            s.remove(PageState::WRITE_PROTECTED);
        });
        Ok(())
    }

    /// Make stores into `[paddr, paddr + len)` fault while reads keep working.
    pub fn write_protect(&mut self, paddr: u32, len: usize) -> Result<(), FastMemError> {
        self.protect_range(paddr, len, Protection::READ)?;
        self.mark(paddr, len, |s| s.insert(PageState::WRITE_PROTECTED));
        Ok(())
    }

    /// Undo [`Self::write_protect`].
    pub fn unprotect(&mut self, paddr: u32, len: usize) -> Result<(), FastMemError> {
        self.protect_range(paddr, len, Protection::READ_WRITE)?;
        self.mark(paddr, len, |s| {
            s.insert(PageState::COMMITTED);
            s.remove(PageState::WRITE_PROTECTED);
        });
        Ok(())
    }

    /// Return `[paddr, paddr + len)` to the inaccessible reserved state.
    pub fn decommit(&mut self, paddr: u32, len: usize) -> Result<(), FastMemError> {
        self.protect_range(paddr, len, Protection::NONE)?;
        self.mark(paddr, len, |s| *s = PageState::empty());
        Ok(())
    }

    fn protect_range(
        &mut self,
        paddr: u32,
        len: usize,
        prot: Protection,
    ) -> Result<(), FastMemError> {
        let start = (paddr as usize) & !(PAGE_SIZE - 1);
        let end = (paddr as usize)
            .saturating_add(len)
            .saturating_add(PAGE_SIZE - 1)
            & !(PAGE_SIZE - 1);
        let end = end.min(self.alloc.len());
        if end <= start {
            return Ok(());
        }
        // Safety: the range is inside our own reservation.
        unsafe { region::protect(self.base.add(start), end - start, prot) }
            .map_err(FastMemError::Protect)
    }

    fn mark(&mut self, paddr: u32, len: usize, f: impl Fn(&mut PageState)) {
        if len == 0 {
            return;
        }
        let first = (paddr as usize) / PAGE_SIZE;
        let last = ((paddr as usize).saturating_add(len - 1) / PAGE_SIZE).min(PAGE_COUNT - 1);
        for state in &mut self.pages[first..=last] {
            f(state);
        }
    }

    /// Everything back to inaccessible; used when a pooled arena is re-issued.
    fn reset_to_reserved(&mut self) -> Result<(), FastMemError> {
        // Safety: whole-reservation protect.
        unsafe { region::protect(self.base, self.alloc.len(), Protection::NONE) }
            .map_err(FastMemError::Protect)?;
        self.pages.fill(PageState::empty());
        Ok(())
    }
}

/// Process-wide arena pool. Reserving 4GiB can fail under address-space
/// pressure, so callers that know they will need the arena later reserve it
/// up front; a released arena goes back here instead of to the OS so the next
/// machine instance cannot lose the race.
static RESERVED: Mutex<Option<HostArena>> = Mutex::new(None);

fn pool() -> MutexGuard<'static, Option<HostArena>> {
    RESERVED.lock().unwrap_or_else(|e| e.into_inner())
}

/// Reserve the guest arena ahead of time. Idempotent.
pub fn reserve_memory() -> Result<(), FastMemError> {
    let mut slot = pool();
    if slot.is_none() {
        *slot = Some(HostArena::reserve()?);
    }
    Ok(())
}

/// Drop the pooled reservation, if any.
pub fn free_reserved_memory() {
    *pool() = None;
}

pub(crate) fn take_or_reserve() -> Result<HostArena, FastMemError> {
    if let Some(mut arena) = pool().take() {
        arena.reset_to_reserved()?;
        return Ok(arena);
    }
    HostArena::reserve()
}

pub(crate) fn release(arena: HostArena) {
    let mut slot = pool();
    if slot.is_none() {
        *slot = Some(arena);
    }
}
