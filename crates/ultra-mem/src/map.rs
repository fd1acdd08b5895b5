//! Physical memory map constants.
//!
//! Region bases and sizes are fixed by the hardware; only the RDRAM size
//! (4MiB base, 8MiB with the expansion pak) and the ROM size vary.

pub const RDRAM_BASE: u32 = 0x0000_0000;
/// Largest supported RDRAM size (expansion pak installed).
pub const RDRAM_MAX_SIZE: u32 = 0x0080_0000;

pub const RDRAM_REGS_BASE: u32 = 0x03F0_0000;

pub const SP_DMEM_BASE: u32 = 0x0400_0000;
pub const SP_IMEM_BASE: u32 = 0x0400_1000;
pub const SP_MEM_SIZE: u32 = 0x2000;
pub const SP_REGS_BASE: u32 = 0x0404_0000;
pub const SP_PC_REGS_BASE: u32 = 0x0408_0000;

pub const DP_REGS_BASE: u32 = 0x0410_0000;
pub const MI_REGS_BASE: u32 = 0x0430_0000;
pub const VI_REGS_BASE: u32 = 0x0440_0000;
pub const AI_REGS_BASE: u32 = 0x0450_0000;
pub const PI_REGS_BASE: u32 = 0x0460_0000;
pub const RI_REGS_BASE: u32 = 0x0470_0000;
pub const SI_REGS_BASE: u32 = 0x0480_0000;

/// Cartridge domain 2 address 1 (64DD registers).
pub const CART_DOM2_ADDR1_BASE: u32 = 0x0500_0000;
pub const CART_DOM2_ADDR1_END: u32 = 0x0600_0000;

/// Cartridge domain 2 address 2 (SRAM / flash save window).
pub const CART_DOM2_ADDR2_BASE: u32 = 0x0800_0000;
pub const CART_DOM2_ADDR2_END: u32 = 0x1000_0000;

/// Cartridge domain 1 address 2 (the ROM image).
pub const ROM_BASE: u32 = 0x1000_0000;

pub const PIF_ROM_BASE: u32 = 0x1FC0_0000;
pub const PIF_ROM_SIZE: u32 = 0x7C0;
pub const PIF_RAM_BASE: u32 = 0x1FC0_07C0;
pub const PIF_RAM_SIZE: u32 = 0x40;

/// Register counts per interface block (words).
pub const RDRAM_REG_WORDS: usize = 10;
pub const SP_REG_WORDS: usize = 8;
pub const SP_PC_REG_WORDS: usize = 2;
pub const DP_REG_WORDS: usize = 8;
pub const MI_REG_WORDS: usize = 4;
pub const VI_REG_WORDS: usize = 14;
pub const AI_REG_WORDS: usize = 6;
pub const PI_REG_WORDS: usize = 13;
pub const RI_REG_WORDS: usize = 8;
pub const SI_REG_WORDS: usize = 7;
