//! Physical address space of the emulated machine: region table, RAM backings
//! and a routing layer for memory-mapped hardware registers.
//!
//! [`PhysicalBus`] owns RDRAM, SP DMEM/IMEM, the PIF ROM/RAM pair, an
//! optionally-mapped cartridge ROM image, and one register block per hardware
//! interface. Every sized load/store against a physical address routes to
//! exactly one backing or fails with [`MemError::Unmapped`]; regions never
//! overlap.
//!
//! The bus is big-endian: RAM is stored in bus byte order and sized accesses
//! convert with big-endian semantics, so DMA'd ROM byte streams and CPU word
//! accesses agree without swapping.

mod bus;
pub mod map;
mod mmio;

pub use bus::{BusConfig, PhysicalBus, RamStore, Region};
pub use mmio::{MmioHandler, RegisterFile};

use thiserror::Error;

/// Failures of a physical-address access. These are ordinary values the CPU
/// layer turns into its own bus-error exception; nothing here panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemError {
    #[error("unmapped physical address {paddr:#010x}")]
    Unmapped { paddr: u32 },
    #[error("store to read-only physical address {paddr:#010x}")]
    ReadOnly { paddr: u32 },
}

pub type MemResult<T> = Result<T, MemError>;
