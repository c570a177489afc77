//! Opcode tables
//!
//! Two opcode vocabularies exist, matching the two sides of decoding
//! (design §4.4):
//!
//! - [`RawOp`] is what's actually on the wire: DWARF expression opcodes
//!   plus the Infinity extensions reached through the `0xFA` wide-op
//!   escape. [`lookup`] is the static "op-table" the decoder consults —
//!   an opcode byte with no entry here is `UNHANDLED`.
//! - [`Op`] is what survives rewriting: the nine constant-loading opcodes
//!   collapse to one `Const`, `addr` gains a resolved [`Reloc`](crate::reloc::Reloc),
//!   casts vanish, and `deref`/`deref_int` specialise into sign/size/swap
//!   forms. `Op` is what [`Instruction`](crate::instruction::Instruction),
//!   the validator and the interpreter actually dispatch on.

use crate::error::{Error, Result};

/// The shape of an instruction's operand, used by the decoder to know how
/// many bytes to read and how to interpret them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    Fixed { bits: u8, signed: bool },
    Sleb,
    Uleb,
    /// A ULEB128 offset into the note's string table.
    Strp,
    /// Fixed-width, but the width is `code.wordsize`, not known statically.
    Addr,
}

/// An opcode exactly as it appears on the wire (after wide-op escaping).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawOp {
    Addr,
    Deref,
    Const1U,
    Const1S,
    Const2U,
    Const2S,
    Const4U,
    Const4S,
    Const8U,
    Const8S,
    ConstU,
    ConstS,
    Dup,
    Drop,
    Over,
    Pick,
    Swap,
    Rot,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Shra,
    Mul,
    Div,
    Mod,
    PlusUconst,
    Minus,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Bra,
    Skip,
    Nop,
    /// `lit0`..`lit31`, the literal baked into the opcode number itself.
    Lit(u8),
    Call,
    LoadExternal,
    DerefInt,
    CastInt2Ptr,
    CastPtr2Int,
    Warn,
    /// The synthetic return instruction the decoder appends after the last
    /// real byte; never actually present on the wire, but looked up the
    /// same way.
    Return,
}

const DW_OP_ADDR: u16 = 0x03;
const DW_OP_DEREF: u16 = 0x06;
const DW_OP_CONST1U: u16 = 0x08;
const DW_OP_CONST1S: u16 = 0x09;
const DW_OP_CONST2U: u16 = 0x0a;
const DW_OP_CONST2S: u16 = 0x0b;
const DW_OP_CONST4U: u16 = 0x0c;
const DW_OP_CONST4S: u16 = 0x0d;
const DW_OP_CONST8U: u16 = 0x0e;
const DW_OP_CONST8S: u16 = 0x0f;
const DW_OP_CONSTU: u16 = 0x10;
const DW_OP_CONSTS: u16 = 0x11;
const DW_OP_DUP: u16 = 0x12;
const DW_OP_DROP: u16 = 0x13;
const DW_OP_OVER: u16 = 0x14;
const DW_OP_PICK: u16 = 0x15;
const DW_OP_SWAP: u16 = 0x16;
const DW_OP_ROT: u16 = 0x17;
const DW_OP_AND: u16 = 0x1a;
const DW_OP_DIV: u16 = 0x1b;
const DW_OP_MINUS: u16 = 0x1c;
const DW_OP_MOD: u16 = 0x1d;
const DW_OP_MUL: u16 = 0x1e;
const DW_OP_OR: u16 = 0x21;
const DW_OP_PLUS_UCONST: u16 = 0x23;
const DW_OP_SHL: u16 = 0x24;
const DW_OP_SHR: u16 = 0x25;
const DW_OP_SHRA: u16 = 0x26;
const DW_OP_XOR: u16 = 0x27;
const DW_OP_BRA: u16 = 0x28;
const DW_OP_EQ: u16 = 0x29;
const DW_OP_GE: u16 = 0x2a;
const DW_OP_GT: u16 = 0x2b;
const DW_OP_LE: u16 = 0x2c;
const DW_OP_LT: u16 = 0x2d;
const DW_OP_NE: u16 = 0x2e;
const DW_OP_SKIP: u16 = 0x2f;
const DW_OP_LIT0: u16 = 0x30;
const DW_OP_LIT31: u16 = 0x4f;
const DW_OP_NOP: u16 = 0x96;

/// Escape byte introducing a ULEB128-encoded opcode `>= 0x100`.
pub const DW_OP_GNU_WIDE_OP: u8 = 0xfa;

const I8_OP_CALL: u16 = 0x100;
const I8_OP_LOAD_EXTERNAL: u16 = 0x101;
const I8_OP_DEREF_INT: u16 = 0x102;
const I8_OP_CAST_INT2PTR: u16 = 0x103;
const I8_OP_CAST_PTR2INT: u16 = 0x104;
const I8_OP_WARN: u16 = 0x105;
/// Synthetic return target, appended past the last decoded byte.
pub const OP_RETURN: u16 = 0x140;

/// Look up the `(op, arg1 shape, arg2 shape)` descriptor for a raw wire
/// opcode. `None` means "unknown opcode" — the caller surfaces
/// [`Error::Unhandled`].
pub fn lookup(code: u16) -> Option<(RawOp, Operand, Operand)> {
    use Operand::{Addr, Fixed, None as N, Sleb, Strp, Uleb};
    let fixed = |bits, signed| Fixed { bits, signed };
    Some(match code {
        DW_OP_ADDR => (RawOp::Addr, Addr, N),
        DW_OP_DEREF => (RawOp::Deref, N, N),
        DW_OP_CONST1U => (RawOp::Const1U, fixed(8, false), N),
        DW_OP_CONST1S => (RawOp::Const1S, fixed(8, true), N),
        DW_OP_CONST2U => (RawOp::Const2U, fixed(16, false), N),
        DW_OP_CONST2S => (RawOp::Const2S, fixed(16, true), N),
        DW_OP_CONST4U => (RawOp::Const4U, fixed(32, false), N),
        DW_OP_CONST4S => (RawOp::Const4S, fixed(32, true), N),
        DW_OP_CONST8U => (RawOp::Const8U, fixed(64, false), N),
        DW_OP_CONST8S => (RawOp::Const8S, fixed(64, true), N),
        DW_OP_CONSTU => (RawOp::ConstU, Uleb, N),
        DW_OP_CONSTS => (RawOp::ConstS, Sleb, N),
        DW_OP_DUP => (RawOp::Dup, N, N),
        DW_OP_DROP => (RawOp::Drop, N, N),
        DW_OP_OVER => (RawOp::Over, N, N),
        DW_OP_PICK => (RawOp::Pick, fixed(8, false), N),
        DW_OP_SWAP => (RawOp::Swap, N, N),
        DW_OP_ROT => (RawOp::Rot, N, N),
        DW_OP_AND => (RawOp::And, N, N),
        DW_OP_DIV => (RawOp::Div, N, N),
        DW_OP_MINUS => (RawOp::Minus, N, N),
        DW_OP_MOD => (RawOp::Mod, N, N),
        DW_OP_MUL => (RawOp::Mul, N, N),
        DW_OP_OR => (RawOp::Or, N, N),
        DW_OP_PLUS_UCONST => (RawOp::PlusUconst, Uleb, N),
        DW_OP_SHL => (RawOp::Shl, N, N),
        DW_OP_SHR => (RawOp::Shr, N, N),
        DW_OP_SHRA => (RawOp::Shra, N, N),
        DW_OP_XOR => (RawOp::Xor, N, N),
        DW_OP_BRA => (RawOp::Bra, fixed(16, true), N),
        DW_OP_EQ => (RawOp::Eq, N, N),
        DW_OP_GE => (RawOp::Ge, N, N),
        DW_OP_GT => (RawOp::Gt, N, N),
        DW_OP_LE => (RawOp::Le, N, N),
        DW_OP_LT => (RawOp::Lt, N, N),
        DW_OP_NE => (RawOp::Ne, N, N),
        DW_OP_SKIP => (RawOp::Skip, fixed(16, true), N),
        DW_OP_NOP => (RawOp::Nop, N, N),
        I8_OP_CALL => (RawOp::Call, N, N),
        I8_OP_LOAD_EXTERNAL => (RawOp::LoadExternal, Uleb, N),
        I8_OP_DEREF_INT => (RawOp::DerefInt, Sleb, N),
        I8_OP_CAST_INT2PTR => (RawOp::CastInt2Ptr, N, N),
        I8_OP_CAST_PTR2INT => (RawOp::CastPtr2Int, N, N),
        I8_OP_WARN => (RawOp::Warn, Strp, N),
        OP_RETURN => (RawOp::Return, N, N),
        DW_OP_LIT0..=DW_OP_LIT31 => (RawOp::Lit((code - DW_OP_LIT0) as u8), N, N),
        _ => return None,
    })
}

/// Decode a possibly wide-escaped opcode byte out of `bytes` starting at
/// `pos`, returning the numeric opcode and how many bytes it consumed.
pub fn decode_opcode_number(first_byte: u8, rest: &mut crate::readbuf::ReadBuf<'_>) -> Result<u16> {
    if first_byte != DW_OP_GNU_WIDE_OP {
        return Ok(first_byte as u16);
    }
    let extended = rest.read_uleb128()?;
    let code = extended
        .checked_add(0x100)
        .filter(|&c| c <= u16::MAX as u64)
        .ok_or_else(|| Error::Unhandled("wide opcode value out of range".into()))?;
    Ok(code as u16)
}

/// Sign of a specialised dereference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefSign {
    Unsigned,
    Signed,
}

/// Size (and, for multi-byte sizes, byte-order) of a specialised
/// dereference. `size()` returns the bit width; `needs_swap()` whether the
/// load must byte-swap the bytes read from the inferior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefSize {
    S8,
    S16Native,
    S16Reversed,
    S32Native,
    S32Reversed,
    S64Native,
    S64Reversed,
}

impl DerefSize {
    pub const fn bits(self) -> u32 {
        match self {
            Self::S8 => 8,
            Self::S16Native | Self::S16Reversed => 16,
            Self::S32Native | Self::S32Reversed => 32,
            Self::S64Native | Self::S64Reversed => 64,
        }
    }

    pub const fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    pub const fn needs_swap(self) -> bool {
        matches!(self, Self::S16Reversed | Self::S32Reversed | Self::S64Reversed)
    }

    /// Choose the size/order specialisation for a dereference of `bits`
    /// bits, given the code's declared byte order. `bits == 8` never
    /// swaps.
    pub fn select(bits: u32, reversed: bool) -> Result<Self> {
        Ok(match (bits, reversed) {
            (8, _) => Self::S8,
            (16, false) => Self::S16Native,
            (16, true) => Self::S16Reversed,
            (32, false) => Self::S32Native,
            (32, true) => Self::S32Reversed,
            (64, false) => Self::S64Native,
            (64, true) => Self::S64Reversed,
            _ => return Err(Error::Unhandled(format!("unsupported deref size {bits}"))),
        })
    }
}

/// The opcode held by an [`Instruction`](crate::instruction::Instruction).
///
/// Most variants are the final, post-rewrite form the interpreter actually
/// dispatches on. A handful exist only transiently, between decode and the
/// rewrite pass that consumes them — the same way the original C `op->code`
/// field carries opcode numbers from both the wire format and the
/// synthetic ones it rewrites into. [`Op::slot`] is defined only for the
/// final forms; calling it on a transient variant is a decode-pipeline bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Empty,
    Addr,
    /// The value lives in the instruction's `arg1`; this collapses all
    /// nine `const*` wire opcodes.
    Const,
    /// `lit0..lit31`.
    Lit(u8),
    Dup,
    Drop,
    Over,
    Pick,
    Swap,
    Rot,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Shra,
    Mul,
    Div,
    Mod,
    PlusUconst,
    Minus,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Bra,
    Call,
    LoadExternal,
    Deref {
        sign: DerefSign,
        size: DerefSize,
    },
    Warn,
    Return,

    // --- Transient: decoded from the wire, consumed by a rewrite pass ---
    /// Any of the nine `const*` wire opcodes; collapsed to `Const` by the
    /// pre-validate rewrite.
    ConstRaw,
    /// `DW_OP_skip`; erased by flow analysis.
    Skip,
    /// `DW_OP_nop`; erased by flow analysis.
    Nop,
    /// `DW_OP_deref`; specialised into `Deref` by the deref rewrite.
    DerefRaw,
    /// `I8_OP_deref_int`; specialised into `Deref` by the deref rewrite.
    DerefIntRaw,
    /// `I8_OP_cast_int2ptr`; erased by the cast-erase pass.
    CastInt2Ptr,
    /// `I8_OP_cast_ptr2int`; erased by the cast-erase pass.
    CastPtr2Int,
}

impl Op {
    /// Build the transient, pre-rewrite `Op` a [`RawOp`] decodes to.
    pub const fn from_raw(raw: RawOp) -> Self {
        match raw {
            RawOp::Addr => Self::Addr,
            RawOp::Deref => Self::DerefRaw,
            RawOp::Const1U
            | RawOp::Const1S
            | RawOp::Const2U
            | RawOp::Const2S
            | RawOp::Const4U
            | RawOp::Const4S
            | RawOp::Const8U
            | RawOp::Const8S
            | RawOp::ConstU
            | RawOp::ConstS => Self::ConstRaw,
            RawOp::Dup => Self::Dup,
            RawOp::Drop => Self::Drop,
            RawOp::Over => Self::Over,
            RawOp::Pick => Self::Pick,
            RawOp::Swap => Self::Swap,
            RawOp::Rot => Self::Rot,
            RawOp::And => Self::And,
            RawOp::Or => Self::Or,
            RawOp::Xor => Self::Xor,
            RawOp::Shl => Self::Shl,
            RawOp::Shr => Self::Shr,
            RawOp::Shra => Self::Shra,
            RawOp::Mul => Self::Mul,
            RawOp::Div => Self::Div,
            RawOp::Mod => Self::Mod,
            RawOp::PlusUconst => Self::PlusUconst,
            RawOp::Minus => Self::Minus,
            RawOp::Eq => Self::Eq,
            RawOp::Ne => Self::Ne,
            RawOp::Lt => Self::Lt,
            RawOp::Le => Self::Le,
            RawOp::Gt => Self::Gt,
            RawOp::Ge => Self::Ge,
            RawOp::Bra => Self::Bra,
            RawOp::Skip => Self::Skip,
            RawOp::Nop => Self::Nop,
            RawOp::Lit(n) => Self::Lit(n),
            RawOp::Call => Self::Call,
            RawOp::LoadExternal => Self::LoadExternal,
            RawOp::DerefInt => Self::DerefIntRaw,
            RawOp::CastInt2Ptr => Self::CastInt2Ptr,
            RawOp::CastPtr2Int => Self::CastPtr2Int,
            RawOp::Warn => Self::Warn,
            RawOp::Return => Self::Return,
        }
    }

    /// `true` for the `skip`/`nop` "fall-through-only" instructions flow
    /// analysis erases.
    pub const fn is_fall_through_only(self) -> bool {
        matches!(self, Self::Skip | Self::Nop)
    }

    /// Dense index into the dispatch tables, `0..Op::TABLE_SIZE`. Panics if
    /// called on a transient pre-rewrite variant.
    pub fn slot(self) -> usize {
        match self {
            Self::Empty => 0,
            Self::Addr => 1,
            Self::Const => 2,
            Self::Lit(n) => 3 + n as usize, // 3..=34
            Self::Dup => 35,
            Self::Drop => 36,
            Self::Over => 37,
            Self::Pick => 38,
            Self::Swap => 39,
            Self::Rot => 40,
            Self::And => 41,
            Self::Or => 42,
            Self::Xor => 43,
            Self::Shl => 44,
            Self::Shr => 45,
            Self::Shra => 46,
            Self::Mul => 47,
            Self::Div => 48,
            Self::Mod => 49,
            Self::PlusUconst => 50,
            Self::Minus => 51,
            Self::Eq => 52,
            Self::Ne => 53,
            Self::Lt => 54,
            Self::Le => 55,
            Self::Gt => 56,
            Self::Ge => 57,
            Self::Bra => 58,
            Self::Call => 59,
            Self::LoadExternal => 60,
            Self::Deref { sign, size } => {
                61 + match sign {
                    DerefSign::Unsigned => 0,
                    DerefSign::Signed => 7,
                } + match size {
                    DerefSize::S8 => 0,
                    DerefSize::S16Native => 1,
                    DerefSize::S16Reversed => 2,
                    DerefSize::S32Native => 3,
                    DerefSize::S32Reversed => 4,
                    DerefSize::S64Native => 5,
                    DerefSize::S64Reversed => 6,
                }
            }
            Self::Warn => 75,
            Self::Return => 76,
            Self::ConstRaw | Self::Skip | Self::Nop | Self::DerefRaw | Self::DerefIntRaw | Self::CastInt2Ptr | Self::CastPtr2Int => {
                unreachable!("transient opcode reached dispatch wire-up")
            }
        }
    }

    pub const TABLE_SIZE: usize = 77;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lit_opcodes_cover_the_full_range() {
        assert_eq!(lookup(DW_OP_LIT0).unwrap().0, RawOp::Lit(0));
        assert_eq!(lookup(DW_OP_LIT31).unwrap().0, RawOp::Lit(31));
        assert!(lookup(DW_OP_LIT31 + 1).is_none());
    }

    #[test]
    fn unknown_opcode_is_none() {
        assert!(lookup(0x22).is_none()); // DW_OP_plus: not in this dialect
    }

    #[test]
    fn slots_are_dense_and_unique() {
        let mut seen = [false; Op::TABLE_SIZE];
        let mut ops = vec![Op::Empty, Op::Addr, Op::Const, Op::Return, Op::Warn];
        for n in 0..32 {
            ops.push(Op::Lit(n));
        }
        for sign in [DerefSign::Unsigned, DerefSign::Signed] {
            for size in [
                DerefSize::S8,
                DerefSize::S16Native,
                DerefSize::S16Reversed,
                DerefSize::S32Native,
                DerefSize::S32Reversed,
                DerefSize::S64Native,
                DerefSize::S64Reversed,
            ] {
                ops.push(Op::Deref { sign, size });
            }
        }
        for op in ops {
            let slot = op.slot();
            assert!(slot < Op::TABLE_SIZE, "slot {slot} out of range");
            assert!(!seen[slot], "duplicate slot {slot}");
            seen[slot] = true;
        }
    }

    #[test]
    fn from_raw_keeps_constants_transient() {
        assert_eq!(Op::from_raw(RawOp::Const1U), Op::ConstRaw);
        assert_eq!(Op::from_raw(RawOp::ConstS), Op::ConstRaw);
        assert_eq!(Op::from_raw(RawOp::Deref), Op::DerefRaw);
        assert_eq!(Op::from_raw(RawOp::DerefInt), Op::DerefIntRaw);
        assert_eq!(Op::from_raw(RawOp::Lit(7)), Op::Lit(7));
    }

    #[test]
    #[should_panic(expected = "transient opcode")]
    fn slot_rejects_transient_opcodes() {
        let _ = Op::ConstRaw.slot();
    }
}
