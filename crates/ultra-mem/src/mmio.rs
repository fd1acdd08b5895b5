use crate::{MemError, MemResult};

/// Sized access into a memory-mapped hardware register block.
///
/// Registers on this bus are word-granular; the bus synthesizes 8/16/64-bit
/// accesses from 32-bit handler operations, so implementations only see
/// word-aligned addresses. Handlers are opaque to the bus beyond this trait:
/// routing needs identity and sized access, not device semantics.
pub trait MmioHandler {
    fn read_u32(&mut self, paddr: u32) -> MemResult<u32>;
    fn write_u32(&mut self, paddr: u32, value: u32) -> MemResult<()>;

    /// Machine reset. Default is stateless.
    fn reset(&mut self) {}
}

/// A plain word-latch register block.
///
/// Each interface region gets its own independently stateful instance. Device
/// behavior beyond "reads return the last written value" belongs to the
/// per-device emulations layered on top; this is the routing-correct default
/// every region starts from.
pub struct RegisterFile {
    base: u32,
    regs: Box<[u32]>,
    /// Mirror accesses beyond the register count back onto the block (large
    /// cartridge-domain windows alias their few real registers).
    mirror: bool,
    /// Reject stores. Used for the save window when the save media is
    /// mounted read-only.
    read_only: bool,
}

impl RegisterFile {
    pub fn new(base: u32, words: usize) -> Self {
        Self {
            base,
            regs: vec![0; words].into_boxed_slice(),
            mirror: false,
            read_only: false,
        }
    }

    pub fn mirrored(base: u32, words: usize) -> Self {
        Self {
            mirror: true,
            ..Self::new(base, words)
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    #[inline]
    fn index(&self, paddr: u32) -> MemResult<usize> {
        let word = ((paddr - self.base) >> 2) as usize;
        if self.mirror {
            Ok(word % self.regs.len())
        } else if word < self.regs.len() {
            Ok(word)
        } else {
            Err(MemError::Unmapped { paddr })
        }
    }
}

impl MmioHandler for RegisterFile {
    fn read_u32(&mut self, paddr: u32) -> MemResult<u32> {
        Ok(self.regs[self.index(paddr)?])
    }

    fn write_u32(&mut self, paddr: u32, value: u32) -> MemResult<()> {
        if self.read_only {
            return Err(MemError::ReadOnly { paddr });
        }
        let idx = self.index(paddr)?;
        self.regs[idx] = value;
        Ok(())
    }

    fn reset(&mut self) {
        self.regs.fill(0);
    }
}
