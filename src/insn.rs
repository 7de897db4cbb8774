//! eBPF instruction records.
//!
//! Program sections carry a flat stream of fixed size 8 byte instructions.
//! Only the encoding is defined here; execution lives in the simulated
//! kernel, and real verification is out of scope.

/// Size in bytes of a single encoded instruction.
pub const INSN_SIZE: usize = 8;

// opcode classes
pub(crate) const BPF_ALU64: u8 = 0x07;
pub(crate) const BPF_JMP: u8 = 0x05;

// alu/jmp source operand
pub(crate) const BPF_K: u8 = 0x00;

// alu and jmp operations
pub(crate) const BPF_MOV: u8 = 0xb0;
pub(crate) const BPF_EXIT: u8 = 0x90;

/// `mov64 dst, imm`
pub(crate) const MOV64_IMM: u8 = BPF_ALU64 | BPF_K | BPF_MOV;
/// `exit`
pub(crate) const EXIT: u8 = BPF_JMP | BPF_EXIT;

/// A single eBPF instruction.
///
/// Same wire layout as the kernel's `struct bpf_insn`, with the dst/src
/// register nibbles kept packed instead of exposed as bitfields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Insn {
    /// Operation code.
    pub code: u8,
    /// Destination register in the low nibble, source register in the high.
    pub regs: u8,
    /// Signed offset, used by jump and memory instructions.
    pub off: i16,
    /// Immediate operand.
    pub imm: i32,
}

impl Insn {
    /// Decodes one instruction from its 8 byte wire representation.
    pub fn from_bytes(bytes: [u8; INSN_SIZE]) -> Insn {
        Insn {
            code: bytes[0],
            regs: bytes[1],
            off: i16::from_le_bytes([bytes[2], bytes[3]]),
            imm: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Encodes the instruction into its 8 byte wire representation.
    pub fn to_bytes(self) -> [u8; INSN_SIZE] {
        let off = self.off.to_le_bytes();
        let imm = self.imm.to_le_bytes();
        [
            self.code, self.regs, off[0], off[1], imm[0], imm[1], imm[2], imm[3],
        ]
    }

    /// The destination register number.
    pub fn dst_reg(&self) -> u8 {
        self.regs & 0x0f
    }

    /// The source register number.
    pub fn src_reg(&self) -> u8 {
        self.regs >> 4
    }

    pub(crate) fn mov64_imm(dst: u8, imm: i32) -> Insn {
        Insn {
            code: MOV64_IMM,
            regs: dst & 0x0f,
            off: 0,
            imm,
        }
    }

    pub(crate) fn exit() -> Insn {
        Insn {
            code: EXIT,
            regs: 0,
            off: 0,
            imm: 0,
        }
    }
}
