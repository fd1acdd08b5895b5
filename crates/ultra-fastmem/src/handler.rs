//! SIGSEGV-driven fault resolution (Linux, 64-bit x86/ARM).
//!
//! One registration per process: the handler routes faults whose address
//! falls inside the registered arena to the registered [`FaultAccess`],
//! patches the interrupted context (result register, program counter) and
//! returns to the faulting thread as if the access had succeeded. Any fault
//! it cannot attribute or resolve puts the default disposition back and
//! returns, so the kernel re-raises the original signal and the process dies
//! with it.
//!
//! Nothing here allocates or logs: the whole path has to be safe to run in
//! signal context.

use crate::{FastMemError, FaultAccess, FaultRecord};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering};

struct Registration {
    access: Box<dyn FaultAccess>,
}

static ARENA_BASE: AtomicUsize = AtomicUsize::new(0);
static ARENA_LEN: AtomicUsize = AtomicUsize::new(0);
static REGISTRATION: AtomicPtr<Registration> = AtomicPtr::new(ptr::null_mut());
/// A fault raised while resolving a fault means the access object itself
/// crashed; recursing would hang, so the second fault is fatal.
static IN_FLIGHT: AtomicBool = AtomicBool::new(false);
static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);
/// Packed [`FaultRecord`]: bit 63 valid, bit 40 store, bits 39:32 width,
/// bits 31:0 paddr. One word so readers never see a torn record.
static LAST_FAULT: AtomicU64 = AtomicU64::new(0);

pub(crate) fn register(
    base: *mut u8,
    len: usize,
    access: Box<dyn FaultAccess>,
) -> Result<(), FastMemError> {
    let reg = Box::into_raw(Box::new(Registration { access }));
    if REGISTRATION
        .compare_exchange(ptr::null_mut(), reg, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        // Safety: `reg` came from `Box::into_raw` above and was never shared.
        drop(unsafe { Box::from_raw(reg) });
        return Err(FastMemError::AlreadyRegistered);
    }
    ARENA_BASE.store(base as usize, Ordering::SeqCst);
    ARENA_LEN.store(len, Ordering::SeqCst);
    if let Err(err) = install() {
        unregister();
        return Err(err);
    }
    Ok(())
}

/// Tear down the registration. The caller guarantees no guest access that
/// could fault is in flight on another thread.
pub(crate) fn unregister() {
    ARENA_BASE.store(0, Ordering::SeqCst);
    ARENA_LEN.store(0, Ordering::SeqCst);
    LAST_FAULT.store(0, Ordering::SeqCst);
    let reg = REGISTRATION.swap(ptr::null_mut(), Ordering::SeqCst);
    if !reg.is_null() {
        // Safety: the pointer was published by `register` and is now
        // unpublished; we hold the only copy.
        drop(unsafe { Box::from_raw(reg) });
    }
}

pub(crate) fn last_fault() -> Option<FaultRecord> {
    let packed = LAST_FAULT.load(Ordering::Relaxed);
    if packed >> 63 == 0 {
        return None;
    }
    Some(FaultRecord {
        paddr: packed as u32,
        width: (packed >> 32) as u8 as u32,
        store: packed >> 40 & 1 != 0,
    })
}

pub(crate) fn clear_last_fault() {
    LAST_FAULT.store(0, Ordering::Relaxed);
}

fn record(paddr: u32, width: u32, store: bool) {
    let packed = 1 << 63 | u64::from(store) << 40 | u64::from(width) << 32 | u64::from(paddr);
    LAST_FAULT.store(packed, Ordering::Relaxed);
}

fn install() -> Result<(), FastMemError> {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }
    let action = SigAction::new(
        SigHandler::SigAction(segv_handler),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    // Safety: process-global handler installation; the handler only touches
    // the statics above and the interrupted thread's own context.
    unsafe { signal::sigaction(Signal::SIGSEGV, &action) }
        .map(|_| ())
        .map_err(|errno| {
            HANDLER_INSTALLED.store(false, Ordering::SeqCst);
            FastMemError::Install(io::Error::from_raw_os_error(errno as i32))
        })
}

/// Give the fault back to the kernel: restore the default disposition and
/// return, and the re-raised signal kills the process with the genuine fault.
fn die() {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // Safety: restoring the default disposition is always sound.
    let _ = unsafe { signal::sigaction(Signal::SIGSEGV, &action) };
}

extern "C" fn segv_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    if IN_FLIGHT.swap(true, Ordering::SeqCst) {
        die();
        return;
    }
    // Safety: the kernel hands us valid siginfo and ucontext pointers.
    let resolved = unsafe { resolve(info, ctx) };
    IN_FLIGHT.store(false, Ordering::SeqCst);
    if !resolved {
        die();
    }
}

unsafe fn resolve(info: *mut libc::siginfo_t, ctx: *mut libc::c_void) -> bool {
    let addr = (*info).si_addr() as usize;
    let base = ARENA_BASE.load(Ordering::SeqCst);
    let len = ARENA_LEN.load(Ordering::SeqCst);
    if base == 0 || addr < base || addr - base >= len {
        return false;
    }
    let paddr = (addr - base) as u32;

    let reg = REGISTRATION.load(Ordering::SeqCst);
    if reg.is_null() {
        return false;
    }
    arch::handle_fault(ctx, paddr, (*reg).access.as_mut())
}

fn truncate(value: u64, width: u32) -> u64 {
    if width >= 8 {
        value
    } else {
        value & ((1u64 << (width * 8)) - 1)
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::{record, truncate};
    use crate::decode::x86::{self, AccessKind, StoreOperand};
    use crate::FaultAccess;
    use iced_x86::Register;

    pub(super) unsafe fn handle_fault(
        ctx: *mut libc::c_void,
        paddr: u32,
        access: &mut dyn FaultAccess,
    ) -> bool {
        let ctx = &mut *(ctx as *mut libc::ucontext_t);
        let rip = ctx.uc_mcontext.gregs[libc::REG_RIP as usize] as usize;
        let code = std::slice::from_raw_parts(rip as *const u8, x86::MAX_INSTR_LEN);
        let Some(decoded) = x86::decode(code) else {
            return false;
        };

        match decoded.kind {
            AccessKind::Load { dest, sign_extend } => {
                let Some(value) = access.load(paddr, decoded.width) else {
                    return false;
                };
                if !write_gpr(ctx, dest, decoded.width, sign_extend, value) {
                    return false;
                }
                record(paddr, decoded.width, false);
            }
            AccessKind::Store { src } => {
                let value = match src {
                    StoreOperand::Imm(imm) => imm,
                    StoreOperand::Reg(reg) => match read_gpr(ctx, reg) {
                        Some(value) => value,
                        None => return false,
                    },
                };
                if !access.store(paddr, decoded.width, truncate(value, decoded.width)) {
                    return false;
                }
                record(paddr, decoded.width, true);
            }
        }

        ctx.uc_mcontext.gregs[libc::REG_RIP as usize] += decoded.len as i64;
        true
    }

    fn greg_index(reg: Register) -> Option<usize> {
        let idx = match reg.full_register() {
            Register::RAX => libc::REG_RAX,
            Register::RBX => libc::REG_RBX,
            Register::RCX => libc::REG_RCX,
            Register::RDX => libc::REG_RDX,
            Register::RSI => libc::REG_RSI,
            Register::RDI => libc::REG_RDI,
            Register::RBP => libc::REG_RBP,
            Register::RSP => libc::REG_RSP,
            Register::R8 => libc::REG_R8,
            Register::R9 => libc::REG_R9,
            Register::R10 => libc::REG_R10,
            Register::R11 => libc::REG_R11,
            Register::R12 => libc::REG_R12,
            Register::R13 => libc::REG_R13,
            Register::R14 => libc::REG_R14,
            Register::R15 => libc::REG_R15,
            _ => return None,
        };
        Some(idx as usize)
    }

    fn is_high_byte(reg: Register) -> bool {
        matches!(
            reg,
            Register::AH | Register::BH | Register::CH | Register::DH
        )
    }

    fn read_gpr(ctx: &libc::ucontext_t, reg: Register) -> Option<u64> {
        let full = ctx.uc_mcontext.gregs[greg_index(reg)?] as u64;
        Some(if is_high_byte(reg) { full >> 8 } else { full })
    }

    /// Write a loaded value into `dest` with hardware merge semantics:
    /// 64-bit replaces, 32-bit zeroes the upper half, 16/8-bit merge into
    /// the existing value.
    fn write_gpr(
        ctx: &mut libc::ucontext_t,
        dest: Register,
        width: u32,
        sign_extend: bool,
        value: u64,
    ) -> bool {
        let Some(idx) = greg_index(dest) else {
            return false;
        };
        let value = extend(value, width, sign_extend);
        let old = ctx.uc_mcontext.gregs[idx] as u64;
        let merged = match dest.size() {
            8 => value,
            4 => value & 0xFFFF_FFFF,
            2 => (old & !0xFFFF) | (value & 0xFFFF),
            1 if is_high_byte(dest) => (old & !0xFF00) | ((value & 0xFF) << 8),
            1 => (old & !0xFF) | (value & 0xFF),
            _ => return false,
        };
        ctx.uc_mcontext.gregs[idx] = merged as i64;
        true
    }

    fn extend(value: u64, width: u32, sign: bool) -> u64 {
        let value = truncate(value, width);
        if !sign || width >= 8 {
            return value;
        }
        let shift = 64 - width * 8;
        (((value << shift) as i64) >> shift) as u64
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::{record, truncate};
    use crate::decode::arm64::{self, AccessKind};
    use crate::FaultAccess;

    pub(super) unsafe fn handle_fault(
        ctx: *mut libc::c_void,
        paddr: u32,
        access: &mut dyn FaultAccess,
    ) -> bool {
        let ctx = &mut *(ctx as *mut libc::ucontext_t);
        let pc = ctx.uc_mcontext.pc as usize;
        let insn = (pc as *const u32).read();
        let Some(decoded) = arm64::decode(insn) else {
            return false;
        };

        match decoded.kind {
            AccessKind::Load {
                rt,
                sign_extend,
                dest64,
            } => {
                let Some(value) = access.load(paddr, decoded.width) else {
                    return false;
                };
                if rt != 31 {
                    ctx.uc_mcontext.regs[rt as usize] =
                        extend(value, decoded.width, sign_extend, dest64);
                }
                record(paddr, decoded.width, false);
            }
            AccessKind::Store { rt } => {
                let raw = if rt == 31 {
                    0
                } else {
                    ctx.uc_mcontext.regs[rt as usize]
                };
                if !access.store(paddr, decoded.width, truncate(raw, decoded.width)) {
                    return false;
                }
                record(paddr, decoded.width, true);
            }
        }

        ctx.uc_mcontext.pc += 4;
        true
    }

    fn extend(value: u64, width: u32, sign: bool, dest64: bool) -> u64 {
        let value = truncate(value, width);
        if !sign || width >= 8 {
            return value;
        }
        let shift = 64 - width * 8;
        let extended = (((value << shift) as i64) >> shift) as u64;
        if dest64 {
            extended
        } else {
            extended & 0xFFFF_FFFF
        }
    }
}
