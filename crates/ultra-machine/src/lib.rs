//! The memory side of the emulated machine, assembled.
//!
//! [`MemoryVm`] glues the pieces together: virtual addresses translate
//! through the flattened TLB maps (`ultra-mmu`), resolve against the
//! physical bus (`ultra-mem`), and, where the host supports it, guest RAM is
//! backed by the fault-driven arena (`ultra-fastmem`) so translated host
//! pointers stay valid for direct access. On hosts without fault routing the
//! same API runs entirely on checked accesses.

mod vm;

pub use ultra_fastmem::{free_reserved_memory, reserve_memory, FaultRecord};
pub use ultra_mem::Region;
pub use vm::{MemoryVm, MemoryVmConfig};

use thiserror::Error;
use ultra_fastmem::FastMemError;
use ultra_mem::MemError;

#[derive(Debug, Error)]
pub enum VmError {
    #[error("unmapped virtual address {vaddr:#010x}")]
    UnmappedVirtual { vaddr: u32 },
    #[error("store through read-only mapping at {vaddr:#010x}")]
    ReadOnlyMapping { vaddr: u32 },
    #[error(transparent)]
    Mem(#[from] MemError),
    #[error(transparent)]
    FastMem(#[from] FastMemError),
    #[error("rdram size {size:#x} must be a positive multiple of 4KiB up to 8MiB")]
    RdramSize { size: u32 },
}

pub type VmResult<T> = Result<T, VmError>;
