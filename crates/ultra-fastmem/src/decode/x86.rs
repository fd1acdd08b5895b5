//! x86-64 memory-access decode on top of the `iced-x86` decoder.

use iced_x86::{Decoder, DecoderOptions, Mnemonic, OpKind, Register};

/// Longest legal x86 instruction.
pub const MAX_INSTR_LEN: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAccess {
    /// Instruction length in bytes; the resume point is this far past the
    /// fault address.
    pub len: usize,
    /// Access width in bytes (1, 2, 4 or 8).
    pub width: u32,
    pub kind: AccessKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Load {
        dest: Register,
        sign_extend: bool,
    },
    Store {
        src: StoreOperand,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperand {
    Reg(Register),
    Imm(u64),
}

/// Decode the instruction at the start of `code` if it is a recognized
/// memory access. `mov`, `movzx`, `movsx` and `movsxd` with one memory
/// operand cover what compilers emit for plain loads and stores;
/// read-modify-write forms and string ops are out of scope and fatal.
pub fn decode(code: &[u8]) -> Option<DecodedAccess> {
    let mut decoder = Decoder::new(64, code, DecoderOptions::NONE);
    let instr = decoder.decode();
    if instr.is_invalid() {
        return None;
    }
    let sign_extend = match instr.mnemonic() {
        Mnemonic::Mov | Mnemonic::Movzx => false,
        Mnemonic::Movsx | Mnemonic::Movsxd => true,
        _ => return None,
    };
    if instr.op_count() != 2 {
        return None;
    }

    let width = instr.memory_size().size() as u32;
    if !matches!(width, 1 | 2 | 4 | 8) {
        return None;
    }

    let kind = match (instr.op0_kind(), instr.op1_kind()) {
        (OpKind::Register, OpKind::Memory) => AccessKind::Load {
            dest: instr.op0_register(),
            sign_extend,
        },
        (OpKind::Memory, OpKind::Register) => AccessKind::Store {
            src: StoreOperand::Reg(instr.op1_register()),
        },
        (OpKind::Memory, _) => AccessKind::Store {
            src: StoreOperand::Imm(instr.immediate(1)),
        },
        _ => return None,
    };

    Some(DecodedAccess {
        len: instr.len(),
        width,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_load() {
        // mov eax, [rdx]
        let access = decode(&[0x8B, 0x02]).unwrap();
        assert_eq!(access.len, 2);
        assert_eq!(access.width, 4);
        assert_eq!(
            access.kind,
            AccessKind::Load {
                dest: Register::EAX,
                sign_extend: false
            }
        );
    }

    #[test]
    fn doubleword_load() {
        // mov rax, [rdx]
        let access = decode(&[0x48, 0x8B, 0x02]).unwrap();
        assert_eq!(access.len, 3);
        assert_eq!(access.width, 8);
        assert_eq!(
            access.kind,
            AccessKind::Load {
                dest: Register::RAX,
                sign_extend: false
            }
        );
    }

    #[test]
    fn zero_extending_byte_load() {
        // movzx eax, byte [rdx]
        let access = decode(&[0x0F, 0xB6, 0x02]).unwrap();
        assert_eq!(access.width, 1);
        assert_eq!(
            access.kind,
            AccessKind::Load {
                dest: Register::EAX,
                sign_extend: false
            }
        );
    }

    #[test]
    fn sign_extending_loads() {
        // movsx eax, word [rdx]
        let access = decode(&[0x0F, 0xBF, 0x02]).unwrap();
        assert_eq!(access.width, 2);
        assert_eq!(
            access.kind,
            AccessKind::Load {
                dest: Register::EAX,
                sign_extend: true
            }
        );

        // movsxd rax, dword [rdx]
        let access = decode(&[0x48, 0x63, 0x02]).unwrap();
        assert_eq!(access.width, 4);
        assert_eq!(
            access.kind,
            AccessKind::Load {
                dest: Register::RAX,
                sign_extend: true
            }
        );
    }

    #[test]
    fn register_stores() {
        // mov [rdx], al
        let access = decode(&[0x88, 0x02]).unwrap();
        assert_eq!(access.width, 1);
        assert_eq!(
            access.kind,
            AccessKind::Store {
                src: StoreOperand::Reg(Register::AL)
            }
        );

        // mov [rdx], ax
        let access = decode(&[0x66, 0x89, 0x02]).unwrap();
        assert_eq!(access.width, 2);

        // mov [rdx], eax
        let access = decode(&[0x89, 0x02]).unwrap();
        assert_eq!(access.width, 4);
        assert_eq!(
            access.kind,
            AccessKind::Store {
                src: StoreOperand::Reg(Register::EAX)
            }
        );

        // mov [rdx], r9
        let access = decode(&[0x4C, 0x89, 0x0A]).unwrap();
        assert_eq!(access.width, 8);
        assert_eq!(
            access.kind,
            AccessKind::Store {
                src: StoreOperand::Reg(Register::R9)
            }
        );
    }

    #[test]
    fn immediate_store() {
        // mov dword [rdx], 0xDEADBEEF
        let access = decode(&[0xC7, 0x02, 0xEF, 0xBE, 0xAD, 0xDE]).unwrap();
        assert_eq!(access.len, 6);
        assert_eq!(access.width, 4);
        assert_eq!(
            access.kind,
            AccessKind::Store {
                src: StoreOperand::Imm(0xDEAD_BEEF)
            }
        );
    }

    #[test]
    fn non_accesses_are_undecodable() {
        // nop
        assert_eq!(decode(&[0x90]), None);
        // add eax, [rdx] is a memory access but not a recognized move.
        assert_eq!(decode(&[0x03, 0x02]), None);
        // lea rax, [rdx] touches no memory.
        assert_eq!(decode(&[0x48, 0x8D, 0x02]), None);
        // empty buffer
        assert_eq!(decode(&[]), None);
    }
}
