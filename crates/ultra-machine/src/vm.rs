use crate::{VmError, VmResult};
use tracing::{debug, trace};
use ultra_fastmem::{FastMem, FastMemError, FaultAccess, FaultRecord, PageState};
use ultra_mem::map::{RDRAM_MAX_SIZE, SP_DMEM_BASE, SP_MEM_SIZE};
use ultra_mem::{BusConfig, MemResult, PhysicalBus, RamStore, Region};
use ultra_mmu::{TlbMaps, PAGE_MASK, PAGE_SIZE};

#[derive(Debug, Clone)]
pub struct MemoryVmConfig {
    /// Installed RDRAM: 4MiB stock, 8MiB with the expansion pak.
    pub rdram_size: u32,
    /// Mount the save window read-only; guest stores to it fail.
    pub saves_read_only: bool,
    /// Back guest RAM with the fault-driven host arena when available.
    pub use_fastmem: bool,
    /// Lockstep comparison runs force every access down the checked path.
    pub sync_system: bool,
}

impl Default for MemoryVmConfig {
    fn default() -> Self {
        Self {
            rdram_size: 0x0040_0000,
            saves_read_only: false,
            use_fastmem: true,
            sync_system: false,
        }
    }
}

impl MemoryVmConfig {
    fn bus_config(&self) -> BusConfig {
        BusConfig {
            rdram_size: self.rdram_size,
            saves_read_only: self.saves_read_only,
        }
    }
}

/// Everything the fault path needs behind one stable address: the bus, the
/// write watches, and the arena the watches protect. `MemoryVm` boxes this so
/// the raw pointer in the fault registration survives moves of the outer
/// handle.
struct VmCore {
    // Declared first: the fault registration must tear down before the rest
    // of the core goes away.
    fastmem: Option<FastMem>,
    bus: PhysicalBus,
    /// Write-watched physical ranges, page-aligned, end-exclusive.
    protected: Vec<(u32, u32)>,
    write_hook: Option<Box<dyn FnMut(u32) + Send>>,
}

impl VmCore {
    fn load(&mut self, paddr: u32, width: u32) -> MemResult<u64> {
        self.bus.load_paddr(paddr, width)
    }

    fn store(&mut self, paddr: u32, width: u32, value: u64) -> MemResult<()> {
        if self.release_watches(paddr, paddr.saturating_add(width)) {
            if let Some(hook) = &mut self.write_hook {
                hook(paddr);
            }
        }
        self.bus.store_paddr(paddr, width, value)
    }

    /// Store entry for the fault path. The interrupted instruction was a raw
    /// host store, so on committed RAM pages the bytes land exactly as that
    /// instruction would have written them; only pages with no committed
    /// backing re-encode through the bus. A store therefore leaves the same
    /// memory image whether or not it faulted.
    fn fault_store(&mut self, paddr: u32, width: u32, value: u64) -> bool {
        if self.release_watches(paddr, paddr.saturating_add(width)) {
            if let Some(hook) = &mut self.write_hook {
                hook(paddr);
            }
        }
        if let Some(fm) = &mut self.fastmem {
            let state = fm.arena().page_state(paddr);
            if state.contains(PageState::COMMITTED) && !state.contains(PageState::WRITE_PROTECTED)
            {
                let p = fm.arena().ptr_at(paddr);
                // Safety: the page is committed and the watch lift above made
                // it writable again.
                unsafe {
                    match width {
                        1 => p.write(value as u8),
                        2 => p.cast::<u16>().write_unaligned(value as u16),
                        4 => p.cast::<u32>().write_unaligned(value as u32),
                        _ => p.cast::<u64>().write_unaligned(value),
                    }
                }
                return true;
            }
        }
        self.bus.store_paddr(paddr, width, value).is_ok()
    }

    /// Drop every watch overlapping `[start, end)` and lift the matching
    /// arena protection. Returns whether anything was watched. Runs in signal
    /// context on the fault path, so protection failures cannot be reported;
    /// the watch is dropped either way and the store proceeds checked.
    fn release_watches(&mut self, start: u32, end: u32) -> bool {
        if self.protected.is_empty() {
            return false;
        }
        let mut hit = false;
        let mut i = 0;
        while i < self.protected.len() {
            let (s, e) = self.protected[i];
            if start < e && end > s {
                self.protected.swap_remove(i);
                if let Some(fm) = &mut self.fastmem {
                    if fm.arena().page_state(s).contains(PageState::WRITE_PROTECTED) {
                        let _ = fm.arena().unprotect(s, (e - s) as usize);
                    }
                }
                hit = true;
            } else {
                i += 1;
            }
        }
        hit
    }
}

/// Routes resolved host faults back into the core.
struct CoreFaultAccess {
    core: *mut VmCore,
}

// The machine unregisters the fault path before the core is dropped, and
// guest accesses are single-threaded.
unsafe impl Send for CoreFaultAccess {}

impl FaultAccess for CoreFaultAccess {
    fn load(&mut self, paddr: u32, width: u32) -> Option<u64> {
        // Safety: see the Send rationale above.
        let core = unsafe { &mut *self.core };
        core.load(paddr, width).ok()
    }

    fn store(&mut self, paddr: u32, width: u32, value: u64) -> bool {
        // Safety: see the Send rationale above.
        let core = unsafe { &mut *self.core };
        core.fault_store(paddr, width, value)
    }
}

/// The machine's memory subsystem: TLB-mapped translation over the physical
/// bus, with optional fault-driven RAM backing.
///
/// All sized accesses are big-endian, matching the bus. Stores into
/// write-watched ranges fire the protected-write hook once and lift the
/// watch before the write lands.
pub struct MemoryVm {
    core: Box<VmCore>,
    tlb: TlbMaps,
}

impl MemoryVm {
    pub fn new(config: &MemoryVmConfig) -> VmResult<Self> {
        let size = config.rdram_size;
        if size == 0 || size % PAGE_SIZE != 0 || size > RDRAM_MAX_SIZE {
            return Err(VmError::RdramSize { size });
        }

        let mut core = Box::new(VmCore {
            fastmem: None,
            bus: PhysicalBus::new(&config.bus_config()),
            protected: Vec::new(),
            write_hook: None,
        });

        if config.use_fastmem && !config.sync_system {
            match attach_fastmem(&mut core, &config.bus_config()) {
                Ok(()) => debug!("guest RAM backed by the fault-driven arena"),
                Err(err) => {
                    debug!(%err, "fault-driven backing unavailable; using checked accesses")
                }
            }
        }

        Ok(Self {
            core,
            tlb: TlbMaps::new(),
        })
    }

    /// Whether guest RAM sits in the fault-driven arena.
    pub fn fastmem_active(&self) -> bool {
        self.core.fastmem.is_some()
    }

    /// Reset the memory subsystem: drop TLB mappings and write watches, clear
    /// every register latch, and optionally erase RAM.
    pub fn reset(&mut self, erase_memory: bool) -> VmResult<()> {
        let watches = std::mem::take(&mut self.core.protected);
        if let Some(fm) = &mut self.core.fastmem {
            for (s, e) in watches {
                if fm.arena().page_state(s).contains(PageState::WRITE_PROTECTED) {
                    fm.arena().unprotect(s, (e - s) as usize)?;
                }
            }
            fm.clear_last_fault();
        }
        self.tlb.clear();
        self.core.bus.reset(erase_memory);
        Ok(())
    }

    // ---- translation ----

    pub fn translate_vaddr(&self, vaddr: u32) -> Option<u32> {
        self.tlb.translate_vaddr(vaddr)
    }

    pub fn valid_vaddr(&self, vaddr: u32) -> bool {
        self.tlb.valid_vaddr(vaddr)
    }

    /// Host pointer behind a virtual address, only when it resolves to plain
    /// RAM. Register space has no host pointer and needs the sized calls.
    ///
    /// The pointer exposes the raw byte array. Sized guest accesses store
    /// big-endian, so host-width accesses through the pointer see swapped
    /// values and must swap for themselves; fault-resolved stores into
    /// committed RAM land raw bytes under the same contract.
    pub fn vaddr_to_real_addr(&mut self, vaddr: u32) -> Option<*mut u8> {
        let paddr = self.tlb.translate_vaddr(vaddr)?;
        self.core.bus.real_addr(paddr)
    }

    fn translate_read(&self, vaddr: u32) -> VmResult<u32> {
        self.tlb
            .translate_vaddr(vaddr)
            .ok_or(VmError::UnmappedVirtual { vaddr })
    }

    fn translate_write(&self, vaddr: u32) -> VmResult<u32> {
        match self.tlb.translate_vaddr_write(vaddr) {
            Some(paddr) => Ok(paddr),
            None if self.tlb.translate_vaddr(vaddr).is_some() => {
                Err(VmError::ReadOnlyMapping { vaddr })
            }
            None => Err(VmError::UnmappedVirtual { vaddr }),
        }
    }

    // ---- TLB change notifications ----

    /// Install a mapping from the COP0 TLB emulation. Idempotent; write
    /// watches on the target physical pages are unaffected.
    pub fn tlb_mapped(&mut self, vaddr: u32, len: u32, paddr: u32, read_only: bool) {
        trace!(
            vaddr = format_args!("{vaddr:#010x}"),
            paddr = format_args!("{paddr:#010x}"),
            len,
            read_only,
            "tlb map"
        );
        self.tlb.map(vaddr, len, paddr, read_only);
    }

    pub fn tlb_unmapped(&mut self, vaddr: u32, len: u32) {
        trace!(vaddr = format_args!("{vaddr:#010x}"), len, "tlb unmap");
        self.tlb.unmap(vaddr, len);
    }

    // ---- sized virtual accesses ----

    pub fn lb_vaddr(&mut self, vaddr: u32) -> VmResult<u8> {
        self.load(vaddr, 1).map(|v| v as u8)
    }

    pub fn lh_vaddr(&mut self, vaddr: u32) -> VmResult<u16> {
        self.load(vaddr, 2).map(|v| v as u16)
    }

    pub fn lw_vaddr(&mut self, vaddr: u32) -> VmResult<u32> {
        self.load(vaddr, 4).map(|v| v as u32)
    }

    pub fn ld_vaddr(&mut self, vaddr: u32) -> VmResult<u64> {
        self.load(vaddr, 8)
    }

    pub fn sb_vaddr(&mut self, vaddr: u32, value: u8) -> VmResult<()> {
        self.store(vaddr, 1, u64::from(value))
    }

    pub fn sh_vaddr(&mut self, vaddr: u32, value: u16) -> VmResult<()> {
        self.store(vaddr, 2, u64::from(value))
    }

    pub fn sw_vaddr(&mut self, vaddr: u32, value: u32) -> VmResult<()> {
        self.store(vaddr, 4, u64::from(value))
    }

    pub fn sd_vaddr(&mut self, vaddr: u32, value: u64) -> VmResult<()> {
        self.store(vaddr, 8, value)
    }

    fn load(&mut self, vaddr: u32, width: u32) -> VmResult<u64> {
        let paddr = self.translate_read(vaddr)?;
        Ok(self.core.load(paddr, width)?)
    }

    fn store(&mut self, vaddr: u32, width: u32, value: u64) -> VmResult<()> {
        let paddr = self.translate_write(vaddr)?;
        Ok(self.core.store(paddr, width, value)?)
    }

    // ---- sized physical accesses (DMA engines, debugger) ----

    pub fn lb_paddr(&mut self, paddr: u32) -> VmResult<u8> {
        Ok(self.core.load(paddr, 1)? as u8)
    }

    pub fn lh_paddr(&mut self, paddr: u32) -> VmResult<u16> {
        Ok(self.core.load(paddr, 2)? as u16)
    }

    pub fn lw_paddr(&mut self, paddr: u32) -> VmResult<u32> {
        Ok(self.core.load(paddr, 4)? as u32)
    }

    pub fn ld_paddr(&mut self, paddr: u32) -> VmResult<u64> {
        Ok(self.core.load(paddr, 8)?)
    }

    pub fn sb_paddr(&mut self, paddr: u32, value: u8) -> VmResult<()> {
        Ok(self.core.store(paddr, 1, u64::from(value))?)
    }

    pub fn sh_paddr(&mut self, paddr: u32, value: u16) -> VmResult<()> {
        Ok(self.core.store(paddr, 2, u64::from(value))?)
    }

    pub fn sw_paddr(&mut self, paddr: u32, value: u32) -> VmResult<()> {
        Ok(self.core.store(paddr, 4, u64::from(value))?)
    }

    pub fn sd_paddr(&mut self, paddr: u32, value: u64) -> VmResult<()> {
        Ok(self.core.store(paddr, 8, value)?)
    }

    // ---- write watches ----

    /// Watch `[start_vaddr, end_vaddr]` (inclusive, the classic protection
    /// API shape) for stores. The first store into a watched page fires the
    /// hook, lifts the watch, and then lands normally.
    pub fn protect_memory(&mut self, start_vaddr: u32, end_vaddr: u32) -> VmResult<()> {
        if start_vaddr > end_vaddr {
            return Ok(());
        }
        // Translate the whole range before installing anything, so a miss
        // partway through leaves no watch behind.
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        let mut page = start_vaddr & !PAGE_MASK;
        loop {
            let paddr = self.translate_read(page)? & !PAGE_MASK;
            match ranges.last_mut() {
                Some((_, e)) if *e == paddr => *e = paddr.saturating_add(PAGE_SIZE),
                _ => ranges.push((paddr, paddr.saturating_add(PAGE_SIZE))),
            }
            match page.checked_add(PAGE_SIZE) {
                Some(next) if next <= end_vaddr => page = next,
                _ => break,
            }
        }
        for range in ranges {
            self.push_watch(range)?;
        }
        Ok(())
    }

    /// Drop watches overlapping `[start_vaddr, end_vaddr]` without firing the
    /// hook. Unmapped pages in the range are skipped.
    pub fn unprotect_memory(&mut self, start_vaddr: u32, end_vaddr: u32) -> VmResult<()> {
        if start_vaddr > end_vaddr {
            return Ok(());
        }
        let mut page = start_vaddr & !PAGE_MASK;
        loop {
            if let Some(paddr) = self.tlb.translate_vaddr(page) {
                let paddr = paddr & !PAGE_MASK;
                self.core
                    .release_watches(paddr, paddr.saturating_add(PAGE_SIZE));
            }
            match page.checked_add(PAGE_SIZE) {
                Some(next) if next <= end_vaddr => page = next,
                _ => break,
            }
        }
        Ok(())
    }

    /// Called once per store that hits a watched range, with the physical
    /// address of the store. May run inside the host fault handler, so keep
    /// it allocation- and lock-free.
    pub fn on_protected_write(&mut self, hook: impl FnMut(u32) + Send + 'static) {
        self.core.write_hook = Some(Box::new(hook));
    }

    fn push_watch(&mut self, (start, end): (u32, u32)) -> VmResult<()> {
        trace!(
            start = format_args!("{start:#010x}"),
            end = format_args!("{end:#010x}"),
            "write watch"
        );
        if let Some(fm) = &mut self.core.fastmem {
            if fm.arena().page_state(start).contains(PageState::COMMITTED) {
                fm.arena().write_protect(start, (end - start) as usize)?;
            }
        }
        self.core.protected.push((start, end));
        Ok(())
    }

    // ---- cartridge and raw buffers ----

    pub fn map_rom(&mut self, image: Vec<u8>) {
        self.core.bus.map_rom(image.into_boxed_slice());
    }

    pub fn unmap_rom(&mut self) -> Option<Box<[u8]>> {
        self.core.bus.unmap_rom()
    }

    /// Last value a guest store latched into the ROM window, if any.
    pub fn rom_written(&self) -> Option<u32> {
        self.core.bus.rom_written()
    }

    pub fn rdram(&self) -> &[u8] {
        self.core.bus.rdram()
    }

    pub fn rdram_mut(&mut self) -> &mut [u8] {
        self.core.bus.rdram_mut()
    }

    pub fn rdram_size(&self) -> u32 {
        self.core.bus.rdram_size()
    }

    pub fn dmem(&self) -> &[u8] {
        self.core.bus.dmem()
    }

    pub fn imem(&self) -> &[u8] {
        self.core.bus.imem()
    }

    pub fn pif_ram(&self) -> &[u8] {
        self.core.bus.pif_ram()
    }

    pub fn pif_ram_mut(&mut self) -> &mut [u8] {
        self.core.bus.pif_ram_mut()
    }

    pub fn region(&self, paddr: u32) -> Option<Region> {
        self.core.bus.region(paddr)
    }

    pub fn region_name(&self, paddr: u32) -> Option<&'static str> {
        self.core.bus.region_name(paddr)
    }

    /// Readable label for a physical address, for logs and the debugger.
    pub fn label_name(&self, paddr: u32) -> String {
        match self.core.bus.region_name(paddr) {
            Some(name) => format!("{name} ({paddr:#010x})"),
            None => format!("unmapped ({paddr:#010x})"),
        }
    }

    pub fn bus(&self) -> &PhysicalBus {
        &self.core.bus
    }

    pub fn bus_mut(&mut self) -> &mut PhysicalBus {
        &mut self.core.bus
    }

    /// The most recent access resolved through the fault path.
    pub fn last_fault(&self) -> Option<FaultRecord> {
        self.core.fastmem.as_ref().and_then(FastMem::last_fault)
    }
}

fn attach_fastmem(core: &mut Box<VmCore>, config: &BusConfig) -> Result<(), FastMemError> {
    let mut fm = FastMem::new()?;
    fm.arena().commit(0, config.rdram_size as usize)?;
    fm.arena().commit(SP_DMEM_BASE, SP_MEM_SIZE as usize)?;

    // Safety: the committed ranges stay committed and exclusively ours for
    // the life of the arena, which the core owns alongside the bus.
    let rdram = unsafe { RamStore::from_raw(fm.arena().ptr_at(0), config.rdram_size as usize) };
    let spmem =
        unsafe { RamStore::from_raw(fm.arena().ptr_at(SP_DMEM_BASE), SP_MEM_SIZE as usize) };
    core.bus = PhysicalBus::with_backing(rdram, spmem, config);
    core.fastmem = Some(fm);

    let ptr: *mut VmCore = &mut **core;
    if let Some(fm) = core.fastmem.as_mut() {
        if let Err(err) = fm.register(Box::new(CoreFaultAccess { core: ptr })) {
            // Rebuild on the heap before the arena goes back to the pool.
            core.bus = PhysicalBus::new(config);
            core.fastmem = None;
            return Err(err);
        }
    }
    Ok(())
}
