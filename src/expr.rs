//! The DWARF expression interpreter.
//!
//! A stack machine over 64-bit words. Location expressions name either a
//! memory address (the usual case), a register (`is_reg`/`in_reg` are the
//! side channel for that), or — with `DW_OP_stack_value` — the value
//! itself. `DW_OP_piece` accumulates composite locations.

use std::collections::BTreeMap;

use gimli::constants::*;
use gimli::Reader as _;

use crate::proc::{read_word, Memory};
use crate::{Error, Reader};

/// Everything an expression may consult: the frame's recovered registers,
/// its CFA and frame base, the owning object's load bias, and target
/// memory.
pub struct EvalContext<'a> {
    pub regs: &'a BTreeMap<u16, u64>,
    pub cfa: Option<u64>,
    pub frame_base: Option<u64>,
    pub bias: u64,
    pub addr_size: u8,
    pub endian: gimli::RunTimeEndian,
    pub memory: &'a dyn Memory,
}

impl EvalContext<'_> {
    fn reg(&self, n: u16) -> u64 {
        self.regs.get(&n).copied().unwrap_or(0)
    }
}

#[derive(Default)]
pub struct ExpressionStack {
    stack: Vec<u64>,
    /// Set when the expression names a register rather than an address.
    pub is_reg: bool,
    pub in_reg: u16,
    /// Set by `DW_OP_stack_value`: the result is the value itself.
    pub is_value: bool,
    /// Composite-location pieces as (value, byte size).
    pub pieces: Vec<(u64, u64)>,
}

impl ExpressionStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, v: u64) {
        self.stack.push(v);
    }

    fn pop(&mut self) -> Result<u64, Error> {
        self.stack
            .pop()
            .ok_or(Error::MalformedDwarf("expression stack underflow"))
    }

    /// Evaluates the expression in `r`, returning the top of stack.
    pub fn eval(&mut self, ctx: &EvalContext, r: Reader) -> Result<u64, Error> {
        self.eval_seeded(ctx, r, None)
    }

    /// Same, with an initial stack entry — CFI register-rule expressions
    /// start with the CFA pushed.
    pub fn eval_seeded(
        &mut self,
        ctx: &EvalContext,
        base: Reader,
        seed: Option<u64>,
    ) -> Result<u64, Error> {
        if let Some(v) = seed {
            self.push(v);
        }
        let mut r = base.clone();
        while !r.is_empty() {
            let op = r.read_u8()?;
            // Only a trailing DW_OP_reg* leaves the register marker set.
            self.is_reg = false;
            match op {
                0x30..=0x4f => self.push((op - 0x30) as u64), // DW_OP_lit*
                0x50..=0x6f => {
                    // DW_OP_reg*: the expression names a register.
                    self.is_reg = true;
                    self.in_reg = (op - 0x50) as u16;
                    self.push(ctx.reg(self.in_reg));
                }
                0x70..=0x8f => {
                    // DW_OP_breg*: register plus signed offset.
                    let off = r.read_sleb128()?;
                    self.push(ctx.reg((op - 0x70) as u16).wrapping_add(off as u64));
                }
                _ => self.eval_op(ctx, &base, &mut r, DwOp(op))?,
            }
            if self.is_value {
                break;
            }
        }
        self.pop()
    }

    fn eval_op(
        &mut self,
        ctx: &EvalContext,
        base: &Reader,
        r: &mut Reader,
        op: DwOp,
    ) -> Result<(), Error> {
        match op {
            DW_OP_addr => {
                let a = r.read_address(ctx.addr_size)?;
                self.push(a.wrapping_add(ctx.bias));
            }
            DW_OP_const1u => {
                let v = r.read_u8()?;
                self.push(v as u64);
            }
            DW_OP_const1s => {
                let v = r.read_u8()? as i8;
                self.push(v as i64 as u64);
            }
            DW_OP_const2u => {
                let v = r.read_u16()?;
                self.push(v as u64);
            }
            DW_OP_const2s => {
                let v = r.read_u16()? as i16;
                self.push(v as i64 as u64);
            }
            DW_OP_const4u => {
                let v = r.read_u32()?;
                self.push(v as u64);
            }
            DW_OP_const4s => {
                let v = r.read_u32()? as i32;
                self.push(v as i64 as u64);
            }
            DW_OP_const8u => {
                let v = r.read_u64()?;
                self.push(v);
            }
            DW_OP_const8s => {
                let v = r.read_u64()?;
                self.push(v);
            }
            DW_OP_constu => {
                let v = r.read_uleb128()?;
                self.push(v);
            }
            DW_OP_consts => {
                let v = r.read_sleb128()?;
                self.push(v as u64);
            }

            DW_OP_regx => {
                self.is_reg = true;
                self.in_reg = r.read_uleb128()? as u16;
                self.push(ctx.reg(self.in_reg));
            }
            DW_OP_bregx => {
                let reg = r.read_uleb128()? as u16;
                let off = r.read_sleb128()?;
                self.push(ctx.reg(reg).wrapping_add(off as u64));
            }
            DW_OP_fbreg => {
                let off = r.read_sleb128()?;
                let fb = ctx
                    .frame_base
                    .ok_or(Error::InvalidFrame("expression needs a frame base"))?;
                self.push(fb.wrapping_add(off as u64));
            }
            DW_OP_call_frame_cfa => {
                let cfa = ctx
                    .cfa
                    .ok_or(Error::InvalidFrame("expression needs a CFA"))?;
                self.push(cfa);
            }

            DW_OP_dup => {
                let v = self.pop()?;
                self.push(v);
                self.push(v);
            }
            DW_OP_drop => {
                self.pop()?;
            }
            DW_OP_over => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(a);
                self.push(b);
                self.push(a);
            }
            DW_OP_pick => {
                let n = r.read_u8()? as usize;
                let len = self.stack.len();
                let v = *self
                    .stack
                    .get(len.wrapping_sub(1).wrapping_sub(n))
                    .ok_or(Error::MalformedDwarf("expression stack underflow"))?;
                self.push(v);
            }
            DW_OP_swap => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(b);
                self.push(a);
            }
            DW_OP_rot => {
                let c = self.pop()?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(c);
                self.push(a);
                self.push(b);
            }

            DW_OP_deref => {
                let addr = self.pop()?;
                self.push(read_word(ctx.memory, ctx.endian, addr, ctx.addr_size)?);
            }
            DW_OP_deref_size => {
                let size = r.read_u8()?;
                let addr = self.pop()?;
                self.push(read_word(ctx.memory, ctx.endian, addr, size)?);
            }

            DW_OP_abs => {
                let v = self.pop()? as i64;
                self.push(v.unsigned_abs());
            }
            DW_OP_neg => {
                let v = self.pop()? as i64;
                self.push(v.wrapping_neg() as u64);
            }
            DW_OP_not => {
                let v = self.pop()?;
                self.push(!v);
            }
            DW_OP_and => self.binop(|a, b| a & b)?,
            DW_OP_or => self.binop(|a, b| a | b)?,
            DW_OP_xor => self.binop(|a, b| a ^ b)?,
            DW_OP_plus => self.binop(u64::wrapping_add)?,
            DW_OP_minus => self.binop(u64::wrapping_sub)?,
            DW_OP_mul => self.binop(u64::wrapping_mul)?,
            DW_OP_div => {
                let b = self.pop()? as i64;
                let a = self.pop()? as i64;
                if b == 0 {
                    return Err(Error::MalformedDwarf("division by zero in expression"));
                }
                self.push(a.wrapping_div(b) as u64);
            }
            DW_OP_mod => {
                let b = self.pop()?;
                let a = self.pop()?;
                if b == 0 {
                    return Err(Error::MalformedDwarf("division by zero in expression"));
                }
                self.push(a % b);
            }
            DW_OP_plus_uconst => {
                let c = r.read_uleb128()?;
                let v = self.pop()?;
                self.push(v.wrapping_add(c));
            }
            DW_OP_shl => self.binop(|a, b| a.checked_shl(b as u32).unwrap_or(0))?,
            DW_OP_shr => self.binop(|a, b| a.checked_shr(b as u32).unwrap_or(0))?,
            DW_OP_shra => {
                let b = self.pop()?;
                let a = self.pop()? as i64;
                self.push(a.checked_shr(b as u32).unwrap_or(a >> 63) as u64);
            }

            DW_OP_eq => self.cmp(|a, b| a == b)?,
            DW_OP_ne => self.cmp(|a, b| a != b)?,
            DW_OP_ge => self.cmp(|a, b| a >= b)?,
            DW_OP_gt => self.cmp(|a, b| a > b)?,
            DW_OP_le => self.cmp(|a, b| a <= b)?,
            DW_OP_lt => self.cmp(|a, b| a < b)?,

            DW_OP_skip => {
                let delta = r.read_u16()? as i16;
                branch(base, r, delta)?;
            }
            DW_OP_bra => {
                let delta = r.read_u16()? as i16;
                if self.pop()? != 0 {
                    branch(base, r, delta)?;
                }
            }

            DW_OP_piece => {
                let size = r.read_uleb128()?;
                // The current location description becomes one piece of a
                // composite; an empty stack is a legal "optimized out"
                // piece.
                let v = self.stack.pop().unwrap_or(0);
                self.pieces.push((v, size));
                self.is_reg = false;
            }
            DW_OP_stack_value => {
                self.is_value = true;
            }
            DW_OP_nop => {}

            other => return Err(Error::UnsupportedOpcode(other)),
        }
        Ok(())
    }

    fn binop(&mut self, f: impl FnOnce(u64, u64) -> u64) -> Result<(), Error> {
        let b = self.pop()?;
        let a = self.pop()?;
        self.push(f(a, b));
        Ok(())
    }

    /// Comparisons are signed, pushing 1 or 0.
    fn cmp(&mut self, f: impl FnOnce(i64, i64) -> bool) -> Result<(), Error> {
        let b = self.pop()? as i64;
        let a = self.pop()? as i64;
        self.push(f(a, b) as u64);
        Ok(())
    }
}

/// Repositions `r` to the signed byte offset `delta` from its current
/// position within the expression block `base`.
fn branch(base: &Reader, r: &mut Reader, delta: i16) -> Result<(), Error> {
    let pos = r.offset_from(base) as i64 + delta as i64;
    if pos < 0 || pos as usize > base.len() {
        return Err(Error::MalformedDwarf("expression branch out of bounds"));
    }
    let mut fresh = base.clone();
    fresh.skip(pos as usize)?;
    *r = fresh;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::Sect;
    use rangemap::RangeInclusiveMap;
    use std::sync::Arc;

    fn reader(bytes: Vec<u8>) -> Reader {
        gimli::EndianReader::new(
            Arc::from(bytes.into_boxed_slice()),
            gimli::RunTimeEndian::Little,
        )
    }

    fn ctx<'a>(
        regs: &'a BTreeMap<u16, u64>,
        memory: &'a RangeInclusiveMap<u64, Vec<u8>>,
    ) -> EvalContext<'a> {
        EvalContext {
            regs,
            cfa: Some(0xc000),
            frame_base: Some(0xf000),
            bias: 0,
            addr_size: 8,
            endian: gimli::RunTimeEndian::Little,
            memory,
        }
    }

    #[test]
    fn literals_and_arithmetic() {
        let regs = BTreeMap::new();
        let memory = RangeInclusiveMap::new();
        let mut e = Sect::new();
        e.u8(0x33); // lit3
        e.u8(DW_OP_constu.0).uleb(39);
        e.u8(DW_OP_plus.0);
        let mut stack = ExpressionStack::new();
        let v = stack.eval(&ctx(&regs, &memory), reader(e.into_vec())).unwrap();
        assert_eq!(v, 42);
        assert!(!stack.is_reg);
    }

    #[test]
    fn breg_and_fbreg() {
        let mut regs = BTreeMap::new();
        regs.insert(6u16, 0x8000u64); // rbp
        let memory = RangeInclusiveMap::new();

        let mut e = Sect::new();
        e.u8(0x70 + 6).sleb(-16); // breg6 - 16
        let v = ExpressionStack::new()
            .eval(&ctx(&regs, &memory), reader(e.into_vec()))
            .unwrap();
        assert_eq!(v, 0x8000 - 16);

        let mut e = Sect::new();
        e.u8(DW_OP_fbreg.0).sleb(8);
        let v = ExpressionStack::new()
            .eval(&ctx(&regs, &memory), reader(e.into_vec()))
            .unwrap();
        assert_eq!(v, 0xf008);
    }

    #[test]
    fn reg_marks_register_location() {
        let mut regs = BTreeMap::new();
        regs.insert(3u16, 7u64);
        let memory = RangeInclusiveMap::new();
        let mut e = Sect::new();
        e.u8(0x50 + 3); // reg3
        let mut stack = ExpressionStack::new();
        let v = stack.eval(&ctx(&regs, &memory), reader(e.into_vec())).unwrap();
        assert!(stack.is_reg);
        assert_eq!(stack.in_reg, 3);
        assert_eq!(v, 7);

        // Any trailing operation demotes the result to an address.
        let mut e = Sect::new();
        e.u8(0x50 + 3).u8(DW_OP_plus_uconst.0).uleb(1);
        let mut stack = ExpressionStack::new();
        let v = stack.eval(&ctx(&regs, &memory), reader(e.into_vec())).unwrap();
        assert!(!stack.is_reg);
        assert_eq!(v, 8);
    }

    #[test]
    fn deref_and_cfa() {
        let regs = BTreeMap::new();
        let mut memory = RangeInclusiveMap::new();
        memory.insert(0xc000..=0xc007, 0xdead_beefu64.to_le_bytes().to_vec());
        let mut e = Sect::new();
        e.u8(DW_OP_call_frame_cfa.0).u8(DW_OP_deref.0);
        let v = ExpressionStack::new()
            .eval(&ctx(&regs, &memory), reader(e.into_vec()))
            .unwrap();
        assert_eq!(v, 0xdead_beef);
    }

    #[test]
    fn conditional_branch_taken_and_not() {
        // lit1; bra +3 (over "lit0; skip +2"); lit5  => 5
        let regs = BTreeMap::new();
        let memory = RangeInclusiveMap::new();
        let mut e = Sect::new();
        e.u8(0x31); // lit1
        e.u8(DW_OP_bra.0).u16(1); // skip the next byte when nonzero
        e.u8(0x30); // lit0 (skipped)
        e.u8(0x35); // lit5
        let v = ExpressionStack::new()
            .eval(&ctx(&regs, &memory), reader(e.into_vec()))
            .unwrap();
        assert_eq!(v, 5);

        let mut e = Sect::new();
        e.u8(0x30); // lit0: branch not taken
        e.u8(DW_OP_bra.0).u16(1);
        e.u8(0x32); // lit2, executed
        let v = ExpressionStack::new()
            .eval(&ctx(&regs, &memory), reader(e.into_vec()))
            .unwrap();
        assert_eq!(v, 2);
    }

    #[test]
    fn stack_value_terminates() {
        let regs = BTreeMap::new();
        let memory = RangeInclusiveMap::new();
        let mut e = Sect::new();
        e.u8(0x3a); // lit10
        e.u8(DW_OP_stack_value.0);
        e.u8(DW_OP_deref.0); // must not run
        let mut stack = ExpressionStack::new();
        let v = stack.eval(&ctx(&regs, &memory), reader(e.into_vec())).unwrap();
        assert!(stack.is_value);
        assert_eq!(v, 10);
    }

    #[test]
    fn unknown_opcode_is_surfaced() {
        let regs = BTreeMap::new();
        let memory = RangeInclusiveMap::new();
        let mut e = Sect::new();
        e.u8(0xe0); // vendor range
        let err = ExpressionStack::new()
            .eval(&ctx(&regs, &memory), reader(e.into_vec()))
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOpcode(_)));
    }
}
