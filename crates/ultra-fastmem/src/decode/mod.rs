//! Faulting-instruction decoders.
//!
//! The fault handler has to know what the interrupted instruction was doing:
//! access width, load or store, which register to source or sink, and how far
//! to advance the program counter. Only the plain move forms compilers emit
//! for memory accesses are recognized; anything else is reported undecodable
//! and the fault is treated as fatal.
//!
//! Both decoders are pure functions over instruction bytes, independent of
//! the architecture they run on, so they are compiled and tested everywhere.

pub mod arm64;
pub mod x86;
