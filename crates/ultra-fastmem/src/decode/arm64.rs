//! AArch64 memory-access decode.
//!
//! A64 load/store encodings are regular enough to pick apart with fixed
//! masks. Recognized forms: `LDR`/`STR` with unsigned immediate or register
//! offset, and the unscaled `LDUR`/`STUR` family, in every integer width
//! including the sign-extending loads. Writeback (pre/post-index) forms
//! change a base register as a side effect and are left undecodable.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAccess {
    /// Access width in bytes (1, 2, 4 or 8).
    pub width: u32,
    pub kind: AccessKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Load {
        /// Destination register number; 31 is the zero register and the
        /// loaded value is discarded.
        rt: u32,
        sign_extend: bool,
        /// Whether the destination is the full X register. A W destination
        /// clears the upper half.
        dest64: bool,
    },
    Store {
        /// Source register number; 31 stores zero.
        rt: u32,
    },
}

/// Decode one instruction word, little-endian as fetched from memory.
pub fn decode(insn: u32) -> Option<DecodedAccess> {
    // Load/store register: unsigned immediate, register offset, or unscaled
    // immediate. All three share the size/opc/Rt fields.
    let unsigned_imm = insn & 0x3B00_0000 == 0x3900_0000;
    let register_offset = insn & 0x3B20_0C00 == 0x3820_0800;
    let unscaled = insn & 0x3B20_0C00 == 0x3800_0000;
    if !(unsigned_imm || register_offset || unscaled) {
        return None;
    }

    let size = insn >> 30;
    let opc = (insn >> 22) & 3;
    let rt = insn & 0x1F;
    let width = 1 << size;

    let kind = match opc {
        0 => AccessKind::Store { rt },
        1 => AccessKind::Load {
            rt,
            sign_extend: false,
            dest64: size == 3,
        },
        // LDRS* to an X register. size == 3 here is PRFM, not a load.
        2 if size < 3 => AccessKind::Load {
            rt,
            sign_extend: true,
            dest64: true,
        },
        // LDRSB/LDRSH to a W register; wider forms are unallocated.
        3 if size < 2 => AccessKind::Load {
            rt,
            sign_extend: true,
            dest64: false,
        },
        _ => return None,
    };

    Some(DecodedAccess { width, kind })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_load_and_store() {
        // ldr w0, [x1]
        assert_eq!(
            decode(0xB940_0020),
            Some(DecodedAccess {
                width: 4,
                kind: AccessKind::Load {
                    rt: 0,
                    sign_extend: false,
                    dest64: false
                }
            })
        );
        // str w0, [x1]
        assert_eq!(
            decode(0xB900_0020),
            Some(DecodedAccess {
                width: 4,
                kind: AccessKind::Store { rt: 0 }
            })
        );
    }

    #[test]
    fn doubleword_load() {
        // ldr x2, [x3]
        assert_eq!(
            decode(0xF940_0062),
            Some(DecodedAccess {
                width: 8,
                kind: AccessKind::Load {
                    rt: 2,
                    sign_extend: false,
                    dest64: true
                }
            })
        );
    }

    #[test]
    fn narrow_widths() {
        // strb w5, [x6]
        assert_eq!(
            decode(0x3900_00C5),
            Some(DecodedAccess {
                width: 1,
                kind: AccessKind::Store { rt: 5 }
            })
        );
        // ldrh w7, [x8]
        assert_eq!(
            decode(0x7940_0107),
            Some(DecodedAccess {
                width: 2,
                kind: AccessKind::Load {
                    rt: 7,
                    sign_extend: false,
                    dest64: false
                }
            })
        );
    }

    #[test]
    fn sign_extending_load() {
        // ldrsw x4, [x5]
        assert_eq!(
            decode(0xB980_00A4),
            Some(DecodedAccess {
                width: 4,
                kind: AccessKind::Load {
                    rt: 4,
                    sign_extend: true,
                    dest64: true
                }
            })
        );
        // ldrsb w1, [x2]
        assert_eq!(
            decode(0x39C0_0041),
            Some(DecodedAccess {
                width: 1,
                kind: AccessKind::Load {
                    rt: 1,
                    sign_extend: true,
                    dest64: false
                }
            })
        );
    }

    #[test]
    fn offset_and_unscaled_forms() {
        // ldr w0, [x1, x2]
        assert_eq!(
            decode(0xB862_6820),
            Some(DecodedAccess {
                width: 4,
                kind: AccessKind::Load {
                    rt: 0,
                    sign_extend: false,
                    dest64: false
                }
            })
        );
        // ldur w0, [x1, #-4]
        assert_eq!(
            decode(0xB85F_C020),
            Some(DecodedAccess {
                width: 4,
                kind: AccessKind::Load {
                    rt: 0,
                    sign_extend: false,
                    dest64: false
                }
            })
        );
    }

    #[test]
    fn rejected_encodings() {
        // str w0, [x1, #4]! has base writeback.
        assert_eq!(decode(0xB800_4C20), None);
        // prfm pldl1keep, [x0] shares the unsigned-immediate shape.
        assert_eq!(decode(0xF980_0000), None);
        // bl is not a memory access.
        assert_eq!(decode(0x9400_0000), None);
        // add x0, x1, x2
        assert_eq!(decode(0x8B02_0020), None);
    }
}
