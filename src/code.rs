//! Decoded, validated, dispatch-ready bytecode
//!
//! [`Code::new`] runs the full eight-phase pipeline a `Bytecode`/`CodeInfo`
//! chunk pair goes through before the interpreter can run it (design
//! §4.4): unpack the architecture descriptor, unpack the instruction
//! stream, resolve control flow, rewrite pre-validation constructs,
//! abstractly interpret every reachable path, specialise dereferences,
//! erase casts, then wire up dispatch slots. Each phase is total across
//! the itable built by the previous one; nothing here validates anything
//! the next phase doesn't also re-check, matching the reference
//! implementation's own belt-and-braces style.

use std::rc::Rc;

use crate::error::{DResult, Error, Locate, Located};
use crate::funcref::FuncRef;
use crate::instruction::Instruction;
use crate::note::{ChunkKind, Note};
use crate::opcode::{self, DerefSign, DerefSize, Op, Operand, RawOp};
use crate::readbuf::{ByteOrder, ReadBuf};
use crate::reloc::Reloc;
use crate::validator;
use crate::value::Value;

/// A function's decoded bytecode, ready for the interpreter.
#[derive(Debug)]
pub struct Code {
    pub(crate) wordsize: u32,
    pub(crate) byte_order: ByteOrder,
    pub(crate) max_stack: u64,
    pub(crate) itable: Vec<Instruction>,
    pub(crate) entry_point: usize,
    relocs: Vec<Rc<Reloc>>,
}

impl Code {
    /// Run the full decode pipeline for one function body.
    ///
    /// `externals` is this function's already-resolved-to-`FuncRef`
    /// external table (`Externals` chunk), in chunk order; `funcref` is the
    /// function's own signature, consulted both for its parameter/return
    /// types and as external index `0` (self-recursion).
    pub(crate) fn new(note: &Note, funcref: &Rc<FuncRef>, externals: &[Rc<FuncRef>]) -> DResult<Self> {
        let mut code = Self {
            wordsize: 0,
            byte_order: ByteOrder::Native,
            max_stack: 0,
            itable: Vec::new(),
            entry_point: 0,
            relocs: Vec::new(),
        };

        code.unpack_info(note, funcref)?;
        code.unpack_bytecode(note)?;
        code.setup_flow()?;
        code.rewrite_pre_validate(funcref, externals)?;
        validator::validate(&mut code, funcref)?;
        code.rewrite_derefs()?;
        code.remove_casts();
        code.setup_dispatch();

        Ok(code)
    }

    pub(crate) fn max_stack(&self) -> u64 {
        self.max_stack
    }

    pub(crate) fn itable(&self) -> &[Instruction] {
        &self.itable
    }

    pub(crate) fn entry_point(&self) -> usize {
        self.entry_point
    }

    #[cfg(test)]
    pub(crate) fn for_test(itable: Vec<Instruction>, entry_point: usize, max_stack: u64) -> Self {
        Self {
            wordsize: 64,
            byte_order: ByteOrder::Native,
            max_stack,
            itable,
            entry_point,
            relocs: Vec::new(),
        }
    }

    // ---- Phase 1: architecture descriptor + max_stack ----

    fn unpack_info(&mut self, note: &Note, funcref: &FuncRef) -> DResult<()> {
        let chunk = match note.find_unique(ChunkKind::CodeInfo)? {
            Some(chunk) => chunk,
            None => {
                self.max_stack = funcref.num_params() as u64;
                return Ok(());
            }
        };

        if chunk.version() != 1 {
            return Err(Located::new(
                Error::Unhandled(format!("unsupported CodeInfo chunk version {}", chunk.version())),
                chunk.note_offset(),
            ));
        }

        let mut cur = note.reader(chunk, ByteOrder::Native);
        let archspec_offset = cur.current_offset();
        let archspec = cur.read_u16().locate(chunk.note_offset() + archspec_offset)?;

        for wordsize in [32u32, 64] {
            for is_swapped in [false, true] {
                if archspec == archspec_of(wordsize, is_swapped) {
                    self.wordsize = wordsize;
                    self.byte_order = if is_swapped { ByteOrder::Reversed } else { ByteOrder::Native };
                    break;
                }
            }
            if self.wordsize != 0 {
                break;
            }
        }

        if self.wordsize == 0 {
            return Err(Located::new(
                Error::Unhandled(format!("unrecognised architecture specifier 0x{archspec:04x}")),
                chunk.note_offset() + archspec_offset,
            ));
        }

        let max_stack_offset = cur.current_offset();
        self.max_stack = cur.read_uleb128().locate(chunk.note_offset() + max_stack_offset)?;

        if self.max_stack < funcref.num_params() as u64 {
            return Err(Located::new(
                Error::Invalid("max_stack is smaller than the function's parameter count".into()),
                chunk.note_offset() + max_stack_offset,
            ));
        }

        Ok(())
    }

    // ---- Phase 2: instruction table ----

    fn unpack_bytecode(&mut self, note: &Note) -> DResult<()> {
        let chunk = note.find_unique(ChunkKind::Bytecode)?;
        let chunk = match chunk {
            Some(chunk) if chunk.version() != 3 => {
                return Err(Located::new(
                    Error::Unhandled(format!("unsupported Bytecode chunk version {}", chunk.version())),
                    chunk.note_offset(),
                ));
            }
            Some(chunk) => Some(chunk),
            None => None,
        };

        let code_size = chunk.map_or(0, |c| c.len());
        self.itable = (0..code_size + 1).map(|_| Instruction::empty()).collect();
        self.itable[code_size] = Instruction {
            opcode: Op::Return,
            ..Instruction::empty()
        };

        let Some(chunk) = chunk else {
            return Ok(());
        };

        let mut cur = note.reader(chunk, self.byte_order);
        while cur.bytes_left() > 0 {
            let instr_offset = cur.current_offset();
            let at = |off: usize| chunk.note_offset() + off;

            let first_byte = cur.read_u8().locate(at(instr_offset))?;
            let opnum = opcode::decode_opcode_number(first_byte, &mut cur).locate(at(instr_offset))?;

            let Some((raw, shape1, shape2)) = opcode::lookup(opnum) else {
                return Err(Located::new(
                    Error::Unhandled(format!("opcode 0x{opnum:x} not in optable")),
                    at(instr_offset),
                ));
            };

            let (arg1, warn1) = self.read_operand(&mut cur, shape1, at)?;
            let (arg2, warn2) = self.read_operand(&mut cur, shape2, at)?;

            let next = cur.current_offset();
            let mut instr = Instruction {
                opcode: Op::from_raw(raw),
                arg1,
                arg2,
                warn_message: warn1.or(warn2),
                fall_through: Some(next),
                ..Instruction::empty()
            };

            match raw {
                RawOp::Skip => {
                    instr.fall_through = Some(offset_by(next, instr.arg1.as_i64(), at(instr_offset))?);
                }
                RawOp::Bra => {
                    instr.branch_next = Some(offset_by(next, instr.arg1.as_i64(), at(instr_offset))?);
                }
                _ => {}
            }

            self.itable[instr_offset] = instr;
        }

        Ok(())
    }

    fn read_operand(
        &self,
        cur: &mut ReadBuf<'_>,
        shape: Operand,
        at: impl Fn(usize) -> usize,
    ) -> DResult<(Value, Option<Rc<str>>)> {
        let offset = cur.current_offset();

        let shape = if shape == Operand::Addr {
            match self.wordsize {
                8 => Operand::Fixed { bits: 8, signed: false },
                16 => Operand::Fixed { bits: 16, signed: false },
                32 => Operand::Fixed { bits: 32, signed: false },
                64 => Operand::Fixed { bits: 64, signed: false },
                _ => return Err(Located::new(Error::Unhandled("address operand needs a known wordsize".into()), at(offset))),
            }
        } else {
            shape
        };

        let value = match shape {
            Operand::None => return Ok((Value::word(0), None)),
            Operand::Fixed { bits: 8, signed: false } => Value::word(cur.read_u8().locate(at(offset))? as u64),
            Operand::Fixed { bits: 8, signed: true } => Value::int(cur.read_i8().locate(at(offset))? as i64),
            Operand::Fixed { bits: 16, signed: false } => Value::word(cur.read_u16().locate(at(offset))? as u64),
            Operand::Fixed { bits: 16, signed: true } => Value::int(cur.read_i16().locate(at(offset))? as i64),
            Operand::Fixed { bits: 32, signed: false } => Value::word(cur.read_u32().locate(at(offset))? as u64),
            Operand::Fixed { bits: 32, signed: true } => Value::int(cur.read_i32().locate(at(offset))? as i64),
            Operand::Fixed { bits: 64, signed: false } => Value::word(cur.read_u64().locate(at(offset))?),
            Operand::Fixed { bits: 64, signed: true } => Value::int(cur.read_i64().locate(at(offset))?),
            Operand::Fixed { .. } => return Err(Located::new(Error::Unhandled("unsupported fixed operand width".into()), at(offset))),
            Operand::Sleb => Value::int(cur.read_sleb128().locate(at(offset))?),
            Operand::Uleb => Value::word(cur.read_uleb128().locate(at(offset))?),
            Operand::Strp => {
                let s = cur.read_strp().locate(at(offset))?;
                return Ok((Value::word(0), Some(Rc::from(s))));
            }
            Operand::Addr => unreachable!("resolved to a Fixed shape above"),
        };

        Ok((value, None))
    }

    // ---- Phase 3: control flow ----

    fn setup_flow(&mut self) -> DResult<()> {
        self.entry_point = self.setup_flow_1(None, 0)?;

        for i in 0..self.itable.len() {
            if self.itable[i].is_empty() || matches!(self.itable[i].opcode, Op::Return) {
                continue;
            }
            if matches!(self.itable[i].opcode, Op::Bra) {
                let target = self.itable[i].branch_next.expect("bra always has a branch target");
                let resolved = self.setup_flow_1(Some(i), target)?;
                self.itable[i].branch_next = Some(resolved);
            }
            let target = self.itable[i].fall_through.expect("every live instruction has a fall_through");
            let resolved = self.setup_flow_1(Some(i), target)?;
            self.itable[i].fall_through = Some(resolved);
        }

        for instr in &mut self.itable {
            if instr.opcode.is_fall_through_only() {
                instr.erase();
            }
        }

        Ok(())
    }

    /// Follow a chain of `skip`/`nop` instructions starting at `next`,
    /// returning the first instruction that does something else. `op` is
    /// the instruction the branch being checked belongs to (`None` for the
    /// entry point), used only for error location.
    fn setup_flow_1(&mut self, op: Option<usize>, mut next: usize) -> DResult<usize> {
        let mut seen = std::collections::HashSet::new();

        loop {
            if next >= self.itable.len() || self.itable[next].is_empty() {
                return Err(Located::new(Error::Invalid("branch target is not a valid instruction".into()), op.unwrap_or(0)));
            }
            if !self.itable[next].opcode.is_fall_through_only() {
                return Ok(next);
            }

            let here = next;
            next = self.itable[here].fall_through.expect("fall-through-only instruction always has one");

            if !seen.insert(here) {
                return Err(Located::new(Error::Invalid("skip/nop chain never terminates".into()), here));
            }
        }
    }

    // ---- Phase 4: pre-validate rewrite ----

    fn rewrite_pre_validate(&mut self, funcref: &Rc<FuncRef>, externals: &[Rc<FuncRef>]) -> DResult<()> {
        for i in 0..self.itable.len() {
            match self.itable[i].opcode {
                Op::ConstRaw => self.itable[i].opcode = Op::Const,
                Op::Addr => {
                    let unrelocated = self.itable[i].arg1.as_u64();
                    let reloc = Rc::new(Reloc::new(unrelocated));
                    self.relocs.push(reloc.clone());
                    self.itable[i].addr1 = Some(reloc);
                }
                Op::LoadExternal => {
                    let index = self.itable[i].arg1.as_u64();
                    let target = if index == 0 {
                        funcref.clone()
                    } else {
                        externals
                            .get((index - 1) as usize)
                            .cloned()
                            .ok_or_else(|| Located::new(Error::Invalid("load_external index out of range".into()), i))?
                    };
                    self.itable[i].ext1 = Some(target);
                }
                _ => {}
            }
        }

        Ok(())
    }

    // ---- Phase 6: deref specialisation ----

    fn rewrite_derefs(&mut self) -> DResult<()> {
        const HOST_WORDSIZE: i64 = 64;

        for i in 0..self.itable.len() {
            let (size, is_signed) = match self.itable[i].opcode {
                Op::DerefRaw => (self.wordsize as i64, false),
                Op::DerefIntRaw => {
                    let raw = self.itable[i].arg1.as_i64();
                    if raw < 0 {
                        (-raw, true)
                    } else {
                        (raw, false)
                    }
                }
                _ => continue,
            };

            if size <= 0 {
                return Err(Located::new(Error::Unhandled("non-positive dereference size".into()), i));
            }

            let shift = log2_floor(size);
            if shift < 3 || (1i64 << shift) != size || size > HOST_WORDSIZE {
                return Err(Located::new(Error::Unhandled(format!("unsupported dereference size {size}")), i));
            }
            let shift = shift - 3;

            let is_swapped = shift > 0 && self.byte_order == ByteOrder::Reversed;
            let bits = 8u32 << shift;
            let size = DerefSize::select(bits, is_swapped).map_err(|e| Located::new(e, i))?;
            let sign = if is_signed { DerefSign::Signed } else { DerefSign::Unsigned };

            self.itable[i].opcode = Op::Deref { sign, size };
        }

        Ok(())
    }

    // ---- Phase 7: cast erasure ----

    fn remove_casts(&mut self) {
        for i in 0..self.itable.len() {
            if !matches!(self.itable[i].opcode, Op::CastInt2Ptr | Op::CastPtr2Int) {
                continue;
            }

            let target = self.itable[i].fall_through;
            if self.entry_point == i {
                self.entry_point = target.expect("cast always has a fall_through");
            }

            for j in 0..self.itable.len() {
                if self.itable[j].branch_next == Some(i) {
                    self.itable[j].branch_next = target;
                }
                if self.itable[j].fall_through == Some(i) {
                    self.itable[j].fall_through = target;
                }
            }

            self.itable[i].erase();
        }
    }

    // ---- Phase 8: dispatch wire-up ----

    fn setup_dispatch(&mut self) {
        for instr in &mut self.itable {
            if !instr.is_empty() {
                instr.dispatch_slot = Some(instr.opcode.slot());
            }
        }
    }
}

fn archspec_of(wordsize: u32, is_swapped: bool) -> u16 {
    let (msb, lsb) = if is_swapped { (b'8' as u32, b'i' as u32) } else { (b'i' as u32, b'8' as u32) };
    (((msb ^ wordsize) << 8) | (lsb ^ wordsize)) as u16
}

fn log2_floor(mut x: i64) -> i64 {
    let mut y = 0;
    x >>= 1;
    while x != 0 {
        y += 1;
        x >>= 1;
    }
    y
}

fn offset_by(base: usize, delta: i64, loc: usize) -> DResult<usize> {
    base.checked_add_signed(delta as isize)
        .ok_or_else(|| Located::new(Error::Invalid("branch target address overflow".into()), loc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ty::Type;

    fn uleb(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let mut byte = (v & 0x7f) as u8;
            v >>= 7;
            if v != 0 {
                byte |= 0x80;
            }
            out.push(byte);
            if v == 0 {
                break;
            }
        }
    }

    fn chunk_bytes(type_id: u64, version: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        uleb(type_id, &mut out);
        uleb(version, &mut out);
        uleb(payload.len() as u64, &mut out);
        out.extend_from_slice(payload);
        out
    }

    fn codeinfo(wordsize: u32, max_stack: u64) -> Vec<u8> {
        let archspec = archspec_of(wordsize, false);
        let mut payload = archspec.to_ne_bytes().to_vec();
        uleb(max_stack, &mut payload);
        chunk_bytes(5, 1, &payload)
    }

    fn note_with(codeinfo_bytes: Vec<u8>, bytecode: Vec<u8>) -> Note {
        let mut bytes = codeinfo_bytes;
        bytes.extend(chunk_bytes(2, 3, &bytecode));
        Note::parse(&bytes, None, 0).unwrap()
    }

    #[test]
    fn archspec_roundtrips_for_32_and_64() {
        assert_ne!(archspec_of(32, false), archspec_of(64, false));
        assert_ne!(archspec_of(32, false), archspec_of(32, true));
    }

    #[test]
    fn factorial_like_straight_line_code_decodes() {
        // lit1 ; return
        let bytecode = vec![0x31 /* lit1 */];
        let note = note_with(codeinfo(64, 4), bytecode);
        let funcref = Rc::new(FuncRef::new("", "f", vec![], vec![Type::Integer], true).unwrap());
        let code = Code::new(&note, &funcref, &[]).unwrap();
        assert_eq!(code.itable()[0].opcode, Op::Lit(1));
        assert!(matches!(code.itable()[1].opcode, Op::Return));
    }

    #[test]
    fn infinite_skip_loop_is_rejected() {
        // skip -3 loops back to itself forever.
        let bytecode = vec![0x2f, 0xfd, 0xff]; // DW_OP_skip, sleb128(-3)
        let note = note_with(codeinfo(64, 1), bytecode);
        let funcref = Rc::new(FuncRef::new("", "f", vec![], vec![], true).unwrap());
        let err = Code::new(&note, &funcref, &[]).unwrap_err();
        assert!(matches!(err.error, Error::Invalid(_)));
    }

    #[test]
    fn stack_type_mismatch_at_join_point_is_invalid() {
        // lit0 ; bra taken -> lit1 ; addr <reloc> ; return   (joins at return with mismatched types)
        // Simpler: construct a bra that joins integer and pointer paths into the same return point.
        // lit1 (arg integer on true branch) then bra skip to fallthrough which pushes addr (pointer),
        // both paths fall into `return`, which expects a single declared return type - pointer.
        // path A (fallthrough of bra): addr 0  -> pointer, matches
        // path B (branch_next of bra): lit1 -> integer, mismatches the declared pointer return.
        let mut bytecode = vec![0x30]; // lit0 (condition for bra)
        bytecode.push(0x28); // DW_OP_bra
        bytecode.extend_from_slice(&2i16.to_le_bytes()); // branch_next: +2 from here -> lands on lit1
        bytecode.push(0x03); // DW_OP_addr
        bytecode.extend_from_slice(&0u64.to_le_bytes()); // 64-bit address operand
        bytecode.push(0x31); // lit1 (branch target)
        let note = note_with(codeinfo(64, 4), bytecode);
        let funcref = Rc::new(FuncRef::new("", "f", vec![], vec![Type::Pointer], true).unwrap());
        let err = Code::new(&note, &funcref, &[]).unwrap_err();
        assert!(matches!(err.error, Error::Invalid(_)));
    }

    #[test]
    fn byte_swapped_deref_specialises_to_reversed_size() {
        // deref reads a pointer-sized value; with a byte-swapped CodeInfo, it
        // should specialise to a Reversed deref size once a pointer is on
        // the stack.
        let mut bytecode = vec![0x03]; // DW_OP_addr
        bytecode.extend_from_slice(&0u64.to_le_bytes());
        bytecode.push(0x06); // DW_OP_deref
        let archspec = archspec_of(64, true);
        let mut payload = archspec.to_ne_bytes().to_vec();
        uleb(4, &mut payload);
        let codeinfo_bytes = chunk_bytes(5, 1, &payload);
        let note = note_with(codeinfo_bytes, bytecode);
        let funcref = Rc::new(FuncRef::new("", "f", vec![], vec![Type::Pointer], true).unwrap());
        let code = Code::new(&note, &funcref, &[]).unwrap();
        // byte 0 is the addr opcode, bytes 1..=8 its 64-bit operand, so the
        // deref instruction starts at byte 9.
        let deref = &code.itable()[9];
        assert!(matches!(deref.opcode, Op::Deref { size: DerefSize::S64Reversed, .. }));
    }
}
