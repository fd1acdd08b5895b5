//! Host-fault-driven guest memory.
//!
//! The whole 32-bit guest physical space is backed by one reserved 4GiB host
//! arena. Pages with plain RAM behind them get committed read/write, so guest
//! RAM accesses are raw host loads and stores at `base + paddr`. Everything
//! else stays inaccessible; touching it raises a host access fault, which we
//! catch, decode at the faulting instruction, service through a registered
//! [`FaultAccess`] object, and resume past.
//!
//! Setup is two-phase: [`FastMem::new`] acquires the arena (address space
//! only, nothing committed), the caller commits its RAM windows and builds
//! whatever structures point into the arena, then [`FastMem::register`] hooks
//! the fault path up. Platforms without fault routing still get the arena;
//! `register` reports [`FastMemError::Unsupported`] and the caller falls back
//! to checked accesses.

mod arena;
pub mod decode;
mod fastmem;
#[cfg(all(
    target_os = "linux",
    target_pointer_width = "64",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
mod handler;

pub use arena::{free_reserved_memory, reserve_memory, HostArena, PageState, ARENA_LEN, PAGE_SIZE};
pub use fastmem::FastMem;

use thiserror::Error;

/// Services a guest access the host could not perform directly.
///
/// Runs inside the host fault handler, so implementations must not allocate
/// or take locks that the faulting thread might already hold. Returning
/// `None`/`false` marks the fault unresolvable and the process dies with it.
pub trait FaultAccess: Send {
    /// Sized read at a physical address. `width` is 1, 2, 4 or 8 bytes; the
    /// value sits in the low bits of the result.
    fn load(&mut self, paddr: u32, width: u32) -> Option<u64>;

    /// Sized write at a physical address. `width` as for [`Self::load`].
    fn store(&mut self, paddr: u32, width: u32, value: u64) -> bool;
}

/// The most recently resolved fault, for diagnostics and cache invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub paddr: u32,
    pub width: u32,
    pub store: bool,
}

#[derive(Debug, Error)]
pub enum FastMemError {
    /// The host cannot back fault-driven memory (wrong page size, no 64-bit
    /// address space, or no fault routing for this OS/architecture).
    #[error("host platform cannot back fault-driven guest memory")]
    Unsupported,
    #[error("reserving guest address space failed: {0}")]
    Reserve(#[source] region::Error),
    #[error("changing host page protection failed: {0}")]
    Protect(#[source] region::Error),
    #[error("installing the host fault handler failed: {0}")]
    Install(#[source] std::io::Error),
    /// Only one access object may be registered per process.
    #[error("a fault-driven arena is already registered in this process")]
    AlreadyRegistered,
}
