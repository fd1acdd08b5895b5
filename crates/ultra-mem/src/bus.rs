use crate::map::*;
use crate::mmio::{MmioHandler, RegisterFile};
use crate::{MemError, MemResult};
use tracing::debug;

/// Backing storage for a RAM window.
///
/// `Heap` is the portable default. `Raw` points into the reserved host arena
/// so that RAM sits at a fixed host offset for the fault-driven fast path; the
/// owner of the arena guarantees the pointed-to range stays committed and
/// exclusively ours for the life of the store.
pub enum RamStore {
    Heap(Box<[u8]>),
    Raw { ptr: *mut u8, len: usize },
}

// Raw only ever points into the arena owned by the same machine instance.
unsafe impl Send for RamStore {}

impl RamStore {
    pub fn heap(len: usize) -> Self {
        RamStore::Heap(vec![0; len].into_boxed_slice())
    }

    /// # Safety
    /// `ptr..ptr+len` must be committed read/write memory, exclusively owned
    /// by the caller, valid for the lifetime of the returned store.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        RamStore::Raw { ptr, len }
    }

    pub fn len(&self) -> usize {
        match self {
            RamStore::Heap(b) => b.len(),
            RamStore::Raw { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            RamStore::Heap(b) => b,
            // Safety: construction contract of `from_raw`.
            RamStore::Raw { ptr, len } => unsafe { core::slice::from_raw_parts(*ptr, *len) },
        }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            RamStore::Heap(b) => b,
            // Safety: construction contract of `from_raw`.
            RamStore::Raw { ptr, len } => unsafe { core::slice::from_raw_parts_mut(*ptr, *len) },
        }
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            RamStore::Heap(b) => b.as_mut_ptr(),
            RamStore::Raw { ptr, .. } => *ptr,
        }
    }
}

/// Identity of the region owning a physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Rdram,
    RdramRegs,
    SpDmem,
    SpImem,
    SpRegs,
    SpPcRegs,
    DpRegs,
    MiRegs,
    ViRegs,
    AiRegs,
    PiRegs,
    RiRegs,
    SiRegs,
    CartDom2Addr1,
    CartDom2Addr2,
    Rom,
    PifRom,
    PifRam,
}

impl Region {
    pub fn name(self) -> &'static str {
        match self {
            Region::Rdram => "RDRAM",
            Region::RdramRegs => "RDRAM registers",
            Region::SpDmem => "SP DMEM",
            Region::SpImem => "SP IMEM",
            Region::SpRegs => "SP registers",
            Region::SpPcRegs => "SP PC registers",
            Region::DpRegs => "DP command registers",
            Region::MiRegs => "MIPS interface",
            Region::ViRegs => "video interface",
            Region::AiRegs => "audio interface",
            Region::PiRegs => "peripheral interface",
            Region::RiRegs => "RDRAM interface",
            Region::SiRegs => "serial interface",
            Region::CartDom2Addr1 => "cartridge domain 2 address 1",
            Region::CartDom2Addr2 => "cartridge domain 2 address 2",
            Region::Rom => "cartridge ROM",
            Region::PifRom => "PIF ROM",
            Region::PifRam => "PIF RAM",
        }
    }
}

struct MmioRegion {
    start: u32,
    end: u32,
    region: Region,
    handler: Box<dyn MmioHandler + Send>,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub rdram_size: u32,
    /// Mount the save window (cartridge domain 2 address 2) read-only.
    pub saves_read_only: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            rdram_size: 0x0040_0000,
            saves_read_only: false,
        }
    }
}

/// The physical bus: region table plus dispatch.
///
/// Width and alignment are the caller's responsibility; the bus validates
/// range containment only. Sub-word and doubleword MMIO accesses are
/// synthesized from word operations on the owning handler.
pub struct PhysicalBus {
    rdram: RamStore,
    rdram_size: u32,
    /// DMEM then IMEM, one contiguous 8KiB block.
    spmem: RamStore,
    pif_rom: Box<[u8]>,
    pif_ram: Box<[u8]>,
    rom: Option<Box<[u8]>>,
    /// Last value stored into the ROM window, if any. The PI pipeline makes a
    /// ROM store latch the value rather than fail; DMA code reads it back.
    rom_written: Option<u32>,
    mmio: Vec<MmioRegion>,
}

impl PhysicalBus {
    pub fn new(config: &BusConfig) -> Self {
        let rdram_size = config.rdram_size.min(RDRAM_MAX_SIZE);
        Self::with_backing(
            RamStore::heap(rdram_size as usize),
            RamStore::heap(SP_MEM_SIZE as usize),
            config,
        )
    }

    /// Build the bus over externally-provided RAM backings (the host arena).
    pub fn with_backing(rdram: RamStore, spmem: RamStore, config: &BusConfig) -> Self {
        let rdram_size = config.rdram_size.min(RDRAM_MAX_SIZE);
        debug_assert_eq!(rdram.len(), rdram_size as usize);
        debug_assert_eq!(spmem.len(), SP_MEM_SIZE as usize);

        let mut bus = Self {
            rdram,
            rdram_size,
            spmem,
            pif_rom: vec![0; PIF_ROM_SIZE as usize].into_boxed_slice(),
            pif_ram: vec![0; PIF_RAM_SIZE as usize].into_boxed_slice(),
            rom: None,
            rom_written: None,
            mmio: Vec::new(),
        };
        bus.install_interface_blocks(config.saves_read_only);
        bus
    }

    fn install_interface_blocks(&mut self, saves_read_only: bool) {
        let blocks = [
            (RDRAM_REGS_BASE, RDRAM_REG_WORDS, Region::RdramRegs),
            (SP_REGS_BASE, SP_REG_WORDS, Region::SpRegs),
            (SP_PC_REGS_BASE, SP_PC_REG_WORDS, Region::SpPcRegs),
            (DP_REGS_BASE, DP_REG_WORDS, Region::DpRegs),
            (MI_REGS_BASE, MI_REG_WORDS, Region::MiRegs),
            (VI_REGS_BASE, VI_REG_WORDS, Region::ViRegs),
            (AI_REGS_BASE, AI_REG_WORDS, Region::AiRegs),
            (PI_REGS_BASE, PI_REG_WORDS, Region::PiRegs),
            (RI_REGS_BASE, RI_REG_WORDS, Region::RiRegs),
            (SI_REGS_BASE, SI_REG_WORDS, Region::SiRegs),
        ];
        for (base, words, region) in blocks {
            let end = base + (words as u32) * 4;
            self.register_mmio(base, end, region, Box::new(RegisterFile::new(base, words)));
        }

        // The two cartridge-domain windows alias a couple of real registers
        // across a large window.
        self.register_mmio(
            CART_DOM2_ADDR1_BASE,
            CART_DOM2_ADDR1_END,
            Region::CartDom2Addr1,
            Box::new(RegisterFile::mirrored(CART_DOM2_ADDR1_BASE, 2)),
        );
        let mut saves = RegisterFile::mirrored(CART_DOM2_ADDR2_BASE, 2);
        if saves_read_only {
            saves = saves.read_only();
        }
        self.register_mmio(
            CART_DOM2_ADDR2_BASE,
            CART_DOM2_ADDR2_END,
            Region::CartDom2Addr2,
            Box::new(saves),
        );
    }

    /// Register a handler over `[start, end)`. Regions must not overlap.
    pub fn register_mmio(
        &mut self,
        start: u32,
        end: u32,
        region: Region,
        handler: Box<dyn MmioHandler + Send>,
    ) {
        debug_assert!(start < end);
        let idx = self.mmio.partition_point(|r| r.start < start);
        if let Some(prev) = idx.checked_sub(1).and_then(|i| self.mmio.get(i)) {
            debug_assert!(prev.end <= start, "overlapping MMIO regions");
        }
        if let Some(next) = self.mmio.get(idx) {
            debug_assert!(end <= next.start, "overlapping MMIO regions");
        }
        self.mmio.insert(
            idx,
            MmioRegion {
                start,
                end,
                region,
                handler,
            },
        );
    }

    /// Map a ROM image at the cartridge window. Replaces any mapped image.
    pub fn map_rom(&mut self, image: Box<[u8]>) {
        debug!(size = image.len(), "mapping cartridge ROM");
        self.rom = Some(image);
        self.rom_written = None;
    }

    pub fn unmap_rom(&mut self) -> Option<Box<[u8]>> {
        if self.rom.is_some() {
            debug!("unmapping cartridge ROM");
        }
        self.rom.take()
    }

    pub fn rom_written(&self) -> Option<u32> {
        self.rom_written
    }

    pub fn take_rom_written(&mut self) -> Option<u32> {
        self.rom_written.take()
    }

    /// Reset bus state. RAM contents are erased only when asked; register
    /// latches always clear.
    pub fn reset(&mut self, erase_memory: bool) {
        if erase_memory {
            self.rdram.as_mut_slice().fill(0);
            self.spmem.as_mut_slice().fill(0);
            self.pif_ram.fill(0);
        }
        self.rom_written = None;
        for r in &mut self.mmio {
            r.handler.reset();
        }
    }

    // ---- raw buffer accessors (DMA / save collaborators) ----

    pub fn rdram(&self) -> &[u8] {
        self.rdram.as_slice()
    }

    pub fn rdram_mut(&mut self) -> &mut [u8] {
        self.rdram.as_mut_slice()
    }

    pub fn rdram_size(&self) -> u32 {
        self.rdram_size
    }

    pub fn dmem(&self) -> &[u8] {
        &self.spmem.as_slice()[..0x1000]
    }

    pub fn dmem_mut(&mut self) -> &mut [u8] {
        &mut self.spmem.as_mut_slice()[..0x1000]
    }

    pub fn imem(&self) -> &[u8] {
        &self.spmem.as_slice()[0x1000..]
    }

    pub fn imem_mut(&mut self) -> &mut [u8] {
        &mut self.spmem.as_mut_slice()[0x1000..]
    }

    pub fn pif_ram(&self) -> &[u8] {
        &self.pif_ram
    }

    pub fn pif_ram_mut(&mut self) -> &mut [u8] {
        &mut self.pif_ram
    }

    pub fn pif_rom_mut(&mut self) -> &mut [u8] {
        &mut self.pif_rom
    }

    // ---- region queries ----

    /// Which region owns `paddr`, if any.
    pub fn region(&self, paddr: u32) -> Option<Region> {
        if paddr < self.rdram_size {
            return Some(Region::Rdram);
        }
        if (SP_DMEM_BASE..SP_IMEM_BASE).contains(&paddr) {
            return Some(Region::SpDmem);
        }
        if (SP_IMEM_BASE..SP_DMEM_BASE + SP_MEM_SIZE).contains(&paddr) {
            return Some(Region::SpImem);
        }
        if (PIF_ROM_BASE..PIF_RAM_BASE).contains(&paddr) {
            return Some(Region::PifRom);
        }
        if (PIF_RAM_BASE..PIF_RAM_BASE + PIF_RAM_SIZE).contains(&paddr) {
            return Some(Region::PifRam);
        }
        if let Some(rom) = &self.rom {
            let end = ROM_BASE.saturating_add(rom.len() as u32);
            if (ROM_BASE..end).contains(&paddr) {
                return Some(Region::Rom);
            }
        }
        self.mmio_index(paddr).map(|i| self.mmio[i].region)
    }

    pub fn region_name(&self, paddr: u32) -> Option<&'static str> {
        self.region(paddr).map(Region::name)
    }

    /// Host pointer for a physical address, only when it lands in plain RAM
    /// (RDRAM, DMEM, IMEM). MMIO has no host pointer and must use sized calls.
    pub fn real_addr(&mut self, paddr: u32) -> Option<*mut u8> {
        if paddr < self.rdram_size {
            return Some(self.rdram.as_mut_ptr().wrapping_add(paddr as usize));
        }
        if (SP_DMEM_BASE..SP_DMEM_BASE + SP_MEM_SIZE).contains(&paddr) {
            let off = (paddr - SP_DMEM_BASE) as usize;
            return Some(self.spmem.as_mut_ptr().wrapping_add(off));
        }
        None
    }

    #[inline]
    fn mmio_index(&self, paddr: u32) -> Option<usize> {
        let idx = self.mmio.partition_point(|r| r.end <= paddr);
        self.mmio
            .get(idx)
            .filter(|r| r.start <= paddr)
            .map(|_| idx)
    }

    /// RAM-backed source bytes for `[paddr, paddr + len)`, if fully contained.
    fn ram_slice(&self, paddr: u32, len: u32) -> Option<&[u8]> {
        let len = len as usize;
        if paddr.checked_add(len as u32 - 1)? < self.rdram_size {
            let off = paddr as usize;
            return Some(&self.rdram.as_slice()[off..off + len]);
        }
        let sp_end = SP_DMEM_BASE + SP_MEM_SIZE;
        if (SP_DMEM_BASE..sp_end).contains(&paddr) && paddr + len as u32 <= sp_end {
            let off = (paddr - SP_DMEM_BASE) as usize;
            return Some(&self.spmem.as_slice()[off..off + len]);
        }
        let pif_end = PIF_RAM_BASE + PIF_RAM_SIZE;
        if (PIF_RAM_BASE..pif_end).contains(&paddr) && paddr + len as u32 <= pif_end {
            let off = (paddr - PIF_RAM_BASE) as usize;
            return Some(&self.pif_ram[off..off + len]);
        }
        None
    }

    fn ram_slice_mut(&mut self, paddr: u32, len: u32) -> Option<&mut [u8]> {
        let len = len as usize;
        if paddr.checked_add(len as u32 - 1)? < self.rdram_size {
            let off = paddr as usize;
            return Some(&mut self.rdram.as_mut_slice()[off..off + len]);
        }
        let sp_end = SP_DMEM_BASE + SP_MEM_SIZE;
        if (SP_DMEM_BASE..sp_end).contains(&paddr) && paddr + len as u32 <= sp_end {
            let off = (paddr - SP_DMEM_BASE) as usize;
            return Some(&mut self.spmem.as_mut_slice()[off..off + len]);
        }
        let pif_end = PIF_RAM_BASE + PIF_RAM_SIZE;
        if (PIF_RAM_BASE..pif_end).contains(&paddr) && paddr + len as u32 <= pif_end {
            let off = (paddr - PIF_RAM_BASE) as usize;
            return Some(&mut self.pif_ram[off..off + len]);
        }
        None
    }

    /// Read-only sources (cartridge ROM, PIF ROM).
    fn rom_slice(&self, paddr: u32, len: u32) -> Option<&[u8]> {
        if let Some(rom) = &self.rom {
            let end = ROM_BASE.saturating_add(rom.len() as u32);
            if (ROM_BASE..end).contains(&paddr) && paddr + len <= end {
                let off = (paddr - ROM_BASE) as usize;
                return Some(&rom[off..off + len as usize]);
            }
        }
        if (PIF_ROM_BASE..PIF_RAM_BASE).contains(&paddr) && paddr + len <= PIF_RAM_BASE {
            let off = (paddr - PIF_ROM_BASE) as usize;
            return Some(&self.pif_rom[off..off + len as usize]);
        }
        None
    }

    #[inline]
    fn in_rom_window(&self, paddr: u32) -> bool {
        match &self.rom {
            Some(rom) => {
                let end = ROM_BASE.saturating_add(rom.len() as u32);
                (ROM_BASE..end).contains(&paddr)
            }
            None => false,
        }
    }

    // ---- sized loads ----

    fn load(&mut self, paddr: u32, width: u32) -> MemResult<u64> {
        if let Some(bytes) = self.ram_slice(paddr, width) {
            return Ok(read_be(bytes));
        }
        if let Some(bytes) = self.rom_slice(paddr, width) {
            return Ok(read_be(bytes));
        }
        self.load_mmio(paddr, width)
    }

    /// Sub-word and doubleword accesses are synthesized from the handler's
    /// word operations: byte lanes follow big-endian significance.
    fn load_mmio(&mut self, paddr: u32, width: u32) -> MemResult<u64> {
        let idx = self.mmio_index(paddr).ok_or(MemError::Unmapped { paddr })?;
        match width {
            4 => Ok(u64::from(self.mmio[idx].handler.read_u32(paddr & !3)?)),
            1 => {
                let word = self.mmio[idx].handler.read_u32(paddr & !3)?;
                let shift = (3 - (paddr & 3)) * 8;
                Ok(u64::from((word >> shift) & 0xFF))
            }
            2 => {
                let word = self.mmio[idx].handler.read_u32(paddr & !3)?;
                let shift = (2 - (paddr & 2)) * 8;
                Ok(u64::from((word >> shift) & 0xFFFF))
            }
            8 => {
                let hi = self.load_mmio(paddr, 4)?;
                let lo = self.load_mmio(paddr.wrapping_add(4), 4)?;
                Ok(hi << 32 | lo)
            }
            _ => unreachable!("access width {width}"),
        }
    }

    pub fn lb_paddr(&mut self, paddr: u32) -> MemResult<u8> {
        self.load(paddr, 1).map(|v| v as u8)
    }

    pub fn lh_paddr(&mut self, paddr: u32) -> MemResult<u16> {
        self.load(paddr, 2).map(|v| v as u16)
    }

    pub fn lw_paddr(&mut self, paddr: u32) -> MemResult<u32> {
        self.load(paddr, 4).map(|v| v as u32)
    }

    pub fn ld_paddr(&mut self, paddr: u32) -> MemResult<u64> {
        self.load(paddr, 8)
    }

    /// Width-dispatching load used by the fault-resolution path.
    pub fn load_paddr(&mut self, paddr: u32, width: u32) -> MemResult<u64> {
        debug_assert!(matches!(width, 1 | 2 | 4 | 8));
        self.load(paddr, width)
    }

    // ---- sized stores ----

    fn store(&mut self, paddr: u32, width: u32, value: u64) -> MemResult<()> {
        if let Some(bytes) = self.ram_slice_mut(paddr, width) {
            write_be(bytes, value);
            return Ok(());
        }
        if self.in_rom_window(paddr) {
            // PI quirk: a ROM store latches the value instead of failing. No
            // logging here; this path is reachable from the fault handler.
            self.rom_written = Some(value as u32);
            return Ok(());
        }
        if (PIF_ROM_BASE..PIF_RAM_BASE).contains(&paddr) {
            return Err(MemError::ReadOnly { paddr });
        }
        self.store_mmio(paddr, width, value)
    }

    fn store_mmio(&mut self, paddr: u32, width: u32, value: u64) -> MemResult<()> {
        let idx = self.mmio_index(paddr).ok_or(MemError::Unmapped { paddr })?;
        match width {
            4 => self.mmio[idx].handler.write_u32(paddr & !3, value as u32),
            1 => {
                let aligned = paddr & !3;
                let shift = (3 - (paddr & 3)) * 8;
                let old = self.mmio[idx].handler.read_u32(aligned)?;
                let merged = (old & !(0xFF << shift)) | (((value as u32) & 0xFF) << shift);
                self.mmio[idx].handler.write_u32(aligned, merged)
            }
            2 => {
                let aligned = paddr & !3;
                let shift = (2 - (paddr & 2)) * 8;
                let old = self.mmio[idx].handler.read_u32(aligned)?;
                let merged = (old & !(0xFFFF << shift)) | (((value as u32) & 0xFFFF) << shift);
                self.mmio[idx].handler.write_u32(aligned, merged)
            }
            8 => {
                let old = self.load_mmio(paddr, 4)?;
                self.store_mmio(paddr, 4, value >> 32)?;
                if let Err(err) = self.store_mmio(paddr.wrapping_add(4), 4, value & 0xFFFF_FFFF) {
                    // Undo the high word so a failed doubleword store leaves
                    // no partial state.
                    let _ = self.store_mmio(paddr, 4, old);
                    return Err(err);
                }
                Ok(())
            }
            _ => unreachable!("access width {width}"),
        }
    }

    pub fn sb_paddr(&mut self, paddr: u32, value: u8) -> MemResult<()> {
        self.store(paddr, 1, u64::from(value))
    }

    pub fn sh_paddr(&mut self, paddr: u32, value: u16) -> MemResult<()> {
        self.store(paddr, 2, u64::from(value))
    }

    pub fn sw_paddr(&mut self, paddr: u32, value: u32) -> MemResult<()> {
        self.store(paddr, 4, u64::from(value))
    }

    pub fn sd_paddr(&mut self, paddr: u32, value: u64) -> MemResult<()> {
        self.store(paddr, 8, value)
    }

    /// Width-dispatching store used by the fault-resolution path.
    pub fn store_paddr(&mut self, paddr: u32, width: u32, value: u64) -> MemResult<()> {
        debug_assert!(matches!(width, 1 | 2 | 4 | 8));
        self.store(paddr, width, value)
    }
}

#[inline]
fn read_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| acc << 8 | u64::from(*b))
}

#[inline]
fn write_be(bytes: &mut [u8], value: u64) {
    let width = bytes.len();
    for (i, b) in bytes.iter_mut().enumerate() {
        *b = (value >> ((width - 1 - i) * 8)) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> PhysicalBus {
        PhysicalBus::new(&BusConfig::default())
    }

    #[test]
    fn rdram_round_trips_every_width() {
        let mut bus = bus();
        bus.sb_paddr(0x10, 0xAB).unwrap();
        assert_eq!(bus.lb_paddr(0x10).unwrap(), 0xAB);

        bus.sh_paddr(0x20, 0xBEEF).unwrap();
        assert_eq!(bus.lh_paddr(0x20).unwrap(), 0xBEEF);

        bus.sw_paddr(0x30, 0xDEAD_BEEF).unwrap();
        assert_eq!(bus.lw_paddr(0x30).unwrap(), 0xDEAD_BEEF);

        bus.sd_paddr(0x40, 0x0123_4567_89AB_CDEF).unwrap();
        assert_eq!(bus.ld_paddr(0x40).unwrap(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn ram_is_big_endian() {
        let mut bus = bus();
        bus.sw_paddr(0, 0xDEAD_BEEF).unwrap();
        assert_eq!(&bus.rdram()[..4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(bus.lb_paddr(0).unwrap(), 0xDE);
        assert_eq!(bus.lh_paddr(2).unwrap(), 0xBEEF);
    }

    #[test]
    fn dmem_imem_and_pif_ram_are_ram() {
        let mut bus = bus();
        bus.sw_paddr(SP_DMEM_BASE, 1).unwrap();
        bus.sw_paddr(SP_IMEM_BASE, 2).unwrap();
        bus.sw_paddr(PIF_RAM_BASE, 3).unwrap();
        assert_eq!(bus.lw_paddr(SP_DMEM_BASE).unwrap(), 1);
        assert_eq!(bus.lw_paddr(SP_IMEM_BASE).unwrap(), 2);
        assert_eq!(bus.lw_paddr(PIF_RAM_BASE).unwrap(), 3);
        assert_eq!(&bus.dmem()[..4], &[0, 0, 0, 1]);
        assert_eq!(&bus.imem()[..4], &[0, 0, 0, 2]);
        assert_eq!(&bus.pif_ram()[..4], &[0, 0, 0, 3]);
    }

    #[test]
    fn unmapped_addresses_fail_not_garbage() {
        let mut bus = bus();
        // Beyond RDRAM, before any register block.
        assert_eq!(
            bus.lw_paddr(0x0200_0000),
            Err(MemError::Unmapped { paddr: 0x0200_0000 })
        );
        assert_eq!(
            bus.sw_paddr(0x0200_0000, 1),
            Err(MemError::Unmapped { paddr: 0x0200_0000 })
        );
        // ROM window with no image mapped.
        assert_eq!(
            bus.lw_paddr(0x1000_0000),
            Err(MemError::Unmapped { paddr: 0x1000_0000 })
        );
        // Past the end of a register block.
        let past_mi = MI_REGS_BASE + (MI_REG_WORDS as u32) * 4;
        assert_eq!(bus.lw_paddr(past_mi), Err(MemError::Unmapped { paddr: past_mi }));
    }

    #[test]
    fn mi_registers_latch_independent_of_ram() {
        let mut bus = bus();
        bus.sw_paddr(MI_REGS_BASE + 0xC, 0x0000_0555).unwrap();
        assert_eq!(bus.lw_paddr(MI_REGS_BASE + 0xC).unwrap(), 0x0000_0555);
        // RAM at the aliasing low offset is untouched.
        assert_eq!(bus.lw_paddr(0xC).unwrap(), 0);
    }

    #[test]
    fn sub_word_mmio_synthesis_uses_big_endian_lanes() {
        let mut bus = bus();
        bus.sw_paddr(MI_REGS_BASE, 0x1122_3344).unwrap();
        assert_eq!(bus.lb_paddr(MI_REGS_BASE).unwrap(), 0x11);
        assert_eq!(bus.lb_paddr(MI_REGS_BASE + 3).unwrap(), 0x44);
        assert_eq!(bus.lh_paddr(MI_REGS_BASE + 2).unwrap(), 0x3344);

        bus.sb_paddr(MI_REGS_BASE + 1, 0xEE).unwrap();
        assert_eq!(bus.lw_paddr(MI_REGS_BASE).unwrap(), 0x11EE_3344);

        bus.sh_paddr(MI_REGS_BASE + 2, 0xBEEF).unwrap();
        assert_eq!(bus.lw_paddr(MI_REGS_BASE).unwrap(), 0x11EE_BEEF);
    }

    #[test]
    fn doubleword_mmio_is_two_words_high_first() {
        let mut bus = bus();
        bus.sd_paddr(SP_REGS_BASE, 0xAAAA_BBBB_CCCC_DDDD).unwrap();
        assert_eq!(bus.lw_paddr(SP_REGS_BASE).unwrap(), 0xAAAA_BBBB);
        assert_eq!(bus.lw_paddr(SP_REGS_BASE + 4).unwrap(), 0xCCCC_DDDD);
        assert_eq!(bus.ld_paddr(SP_REGS_BASE).unwrap(), 0xAAAA_BBBB_CCCC_DDDD);
    }

    #[test]
    fn failed_doubleword_mmio_store_rolls_back() {
        let mut bus = bus();
        // Last MI word: the high half of a doubleword fits, the low half
        // falls past the block.
        let last_mi = MI_REGS_BASE + 0xC;
        bus.sw_paddr(last_mi, 0x1111_2222).unwrap();
        assert!(bus.sd_paddr(last_mi, 0xAAAA_BBBB_CCCC_DDDD).is_err());
        assert_eq!(bus.lw_paddr(last_mi).unwrap(), 0x1111_2222);
    }

    #[test]
    fn rom_reads_after_mapping_and_latches_stores() {
        let mut bus = bus();
        let image: Vec<u8> = (0u32..0x100).map(|v| v as u8).collect();
        bus.map_rom(image.into_boxed_slice());

        assert_eq!(bus.lw_paddr(ROM_BASE).unwrap(), 0x0001_0203);
        assert_eq!(bus.lb_paddr(ROM_BASE + 0xFF).unwrap(), 0xFF);
        // Reads past the image fail.
        assert!(bus.lw_paddr(ROM_BASE + 0x100).is_err());

        // A store latches rather than failing or writing.
        bus.sw_paddr(ROM_BASE, 0xCAFE_F00D).unwrap();
        assert_eq!(bus.rom_written(), Some(0xCAFE_F00D));
        assert_eq!(bus.lw_paddr(ROM_BASE).unwrap(), 0x0001_0203);

        bus.unmap_rom();
        assert!(bus.lw_paddr(ROM_BASE).is_err());
    }

    #[test]
    fn pif_rom_is_read_only() {
        let mut bus = bus();
        bus.pif_rom_mut()[0] = 0x99;
        assert_eq!(bus.lb_paddr(PIF_ROM_BASE).unwrap(), 0x99);
        assert_eq!(
            bus.sw_paddr(PIF_ROM_BASE, 1),
            Err(MemError::ReadOnly { paddr: PIF_ROM_BASE })
        );
    }

    #[test]
    fn region_queries_name_the_owner() {
        let mut bus = bus();
        assert_eq!(bus.region(0x1000), Some(Region::Rdram));
        assert_eq!(bus.region(MI_REGS_BASE), Some(Region::MiRegs));
        assert_eq!(bus.region(0x0200_0000), None);
        assert_eq!(bus.region_name(VI_REGS_BASE), Some("video interface"));
        assert_eq!(bus.region(ROM_BASE), None);
        bus.map_rom(vec![0; 0x1000].into_boxed_slice());
        assert_eq!(bus.region(ROM_BASE), Some(Region::Rom));
    }

    #[test]
    fn real_addr_only_for_plain_ram() {
        let mut bus = bus();
        assert!(bus.real_addr(0x100).is_some());
        assert!(bus.real_addr(SP_DMEM_BASE).is_some());
        assert!(bus.real_addr(SP_IMEM_BASE + 0xFFC).is_some());
        assert!(bus.real_addr(MI_REGS_BASE).is_none());
        assert!(bus.real_addr(PIF_RAM_BASE).is_none());
        assert!(bus.real_addr(0x0200_0000).is_none());
    }

    #[test]
    fn reset_clears_latches_and_optionally_ram() {
        let mut bus = bus();
        bus.sw_paddr(0x0, 7).unwrap();
        bus.sw_paddr(MI_REGS_BASE, 9).unwrap();

        bus.reset(false);
        assert_eq!(bus.lw_paddr(0x0).unwrap(), 7);
        assert_eq!(bus.lw_paddr(MI_REGS_BASE).unwrap(), 0);

        bus.sw_paddr(MI_REGS_BASE, 9).unwrap();
        bus.reset(true);
        assert_eq!(bus.lw_paddr(0x0).unwrap(), 0);
        assert_eq!(bus.lw_paddr(MI_REGS_BASE).unwrap(), 0);
    }

    #[test]
    fn save_window_latches_through_its_own_handler() {
        let mut bus = bus();
        bus.sw_paddr(CART_DOM2_ADDR2_BASE, 0x1234_5678).unwrap();
        assert_eq!(bus.lw_paddr(CART_DOM2_ADDR2_BASE).unwrap(), 0x1234_5678);
        // Mirrored across the window.
        assert_eq!(bus.lw_paddr(CART_DOM2_ADDR2_BASE + 0x8).unwrap(), 0x1234_5678);
    }

    #[test]
    fn read_only_saves_reject_stores() {
        let mut bus = PhysicalBus::new(&BusConfig {
            saves_read_only: true,
            ..BusConfig::default()
        });
        assert_eq!(
            bus.sw_paddr(CART_DOM2_ADDR2_BASE, 1),
            Err(MemError::ReadOnly { paddr: CART_DOM2_ADDR2_BASE })
        );
        assert_eq!(bus.lw_paddr(CART_DOM2_ADDR2_BASE).unwrap(), 0);
    }
}
