use crate::arena::{self, HostArena};
use crate::{FastMemError, FaultAccess, FaultRecord};
use std::mem::ManuallyDrop;
use tracing::debug;

#[cfg(all(
    target_os = "linux",
    target_pointer_width = "64",
    any(target_arch = "x86_64", target_arch = "aarch64")
))]
use crate::handler;

// No fault routing on this target; the arena still works as plain memory.
#[cfg(not(all(
    target_os = "linux",
    target_pointer_width = "64",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
mod handler {
    use crate::{FastMemError, FaultAccess, FaultRecord};

    pub(crate) fn register(
        _base: *mut u8,
        _len: usize,
        _access: Box<dyn FaultAccess>,
    ) -> Result<(), FastMemError> {
        Err(FastMemError::Unsupported)
    }

    pub(crate) fn unregister() {}

    pub(crate) fn last_fault() -> Option<FaultRecord> {
        None
    }

    pub(crate) fn clear_last_fault() {}
}

/// Owner of the guest arena and, once registered, of the process fault path.
///
/// Dropping returns the arena to the process pool and tears down the
/// registration, in that order of importance: teardown happens first so no
/// fault can reach the access object after its referents die.
pub struct FastMem {
    arena: ManuallyDrop<HostArena>,
    registered: bool,
}

impl FastMem {
    /// Phase one: acquire the arena (pooled reservation if one exists).
    pub fn new() -> Result<Self, FastMemError> {
        let arena = arena::take_or_reserve()?;
        debug!(base = ?arena.base(), "guest arena acquired");
        Ok(Self {
            arena: ManuallyDrop::new(arena),
            registered: false,
        })
    }

    pub fn arena(&mut self) -> &mut HostArena {
        &mut self.arena
    }

    pub fn base(&self) -> *mut u8 {
        self.arena.base()
    }

    /// Phase two: route faults inside the arena to `access`. One registration
    /// per process; unsupported targets report [`FastMemError::Unsupported`].
    pub fn register(&mut self, access: Box<dyn FaultAccess>) -> Result<(), FastMemError> {
        if self.registered {
            return Err(FastMemError::AlreadyRegistered);
        }
        handler::register(self.arena.base(), self.arena.len(), access)?;
        self.registered = true;
        debug!("fault routing registered");
        Ok(())
    }

    /// The most recently fault-resolved access, if any.
    pub fn last_fault(&self) -> Option<FaultRecord> {
        handler::last_fault()
    }

    pub fn clear_last_fault(&self) {
        handler::clear_last_fault()
    }
}

impl Drop for FastMem {
    fn drop(&mut self) {
        if self.registered {
            handler::unregister();
        }
        // Safety: `arena` is never touched again after this take.
        let arena = unsafe { ManuallyDrop::take(&mut self.arena) };
        arena::release(arena);
    }
}
