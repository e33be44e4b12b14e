//! Frame reconstruction: the unwind mechanisms, per-thread stack building,
//! and the variable/inline queries a renderer asks of a frame.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::rc::Rc;

use gimli::constants::*;
use gimli::Reader as _;

use crate::cfi::{CfaRule, CfiTable, RegisterRule};
use crate::expr::{EvalContext, ExpressionStack};
use crate::image::Phdr;
use crate::proc::{read_word, Memory, Process};
use crate::regs::{Arch, CoreRegisters};
use crate::units::{AttrValue, Contains, Die};
use crate::{Error, Info};

/// How a frame came to exist.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UnwindMechanism {
    /// Built directly from machine state; the innermost frame.
    MachineRegs,
    /// Derived from the previous frame via call-frame information.
    Dwarf,
    /// Derived by following the frame-pointer chain.
    FramePointer,
    /// The previous frame was hypothesized to be a call to a bad address.
    BadIpRecovery,
    /// Recovered from the register state a signal trampoline saved.
    Trampoline,
}

impl fmt::Display for UnwindMechanism {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            UnwindMechanism::MachineRegs => "machine registers",
            UnwindMechanism::Dwarf => "dwarf",
            UnwindMechanism::FramePointer => "frame pointer",
            UnwindMechanism::BadIpRecovery => "bad IP recovery",
            UnwindMechanism::Trampoline => "signal trampoline",
        })
    }
}

/// The loaded object resolved for a frame's IP.
#[derive(Clone)]
pub struct FrameObject {
    pub bias: u64,
    pub info: Rc<Info>,
    pub phdr: Phdr,
}

/// One activation on a thread's stack.
pub struct Frame {
    pub raw_ip: u64,
    pub mechanism: UnwindMechanism,
    /// Canonical frame address. The innermost frame has none.
    pub cfa: Option<u64>,
    /// Recovered registers by DWARF number; only what was actually
    /// recovered is present.
    pub regs: BTreeMap<u16, u64>,
    pub object: Option<FrameObject>,
    arch: Arch,
    function: RefCell<Option<Option<Die>>>,
}

impl Frame {
    /// The innermost frame of a thread, straight from its register file.
    pub fn from_machine_regs(arch: Arch, regs: &CoreRegisters) -> Frame {
        Frame {
            raw_ip: regs.rip,
            mechanism: UnwindMechanism::MachineRegs,
            cfa: None,
            regs: regs.dwarf_regs().collect(),
            object: None,
            arch,
            function: RefCell::new(None),
        }
    }

    fn derived(&self, mechanism: UnwindMechanism, raw_ip: u64, cfa: Option<u64>, regs: BTreeMap<u16, u64>) -> Frame {
        Frame {
            raw_ip,
            mechanism,
            cfa,
            regs,
            object: None,
            arch: self.arch,
            function: RefCell::new(None),
        }
    }

    pub fn reg(&self, n: u16) -> Option<u64> {
        self.regs.get(&n).copied()
    }

    /// The address used for scope lookups: the raw IP for frames whose PC
    /// is exact, one less for frames whose PC is a return address.
    pub fn scope_ip(&self) -> u64 {
        match self.mechanism {
            UnwindMechanism::MachineRegs | UnwindMechanism::Trampoline => self.raw_ip,
            _ => self.raw_ip.saturating_sub(1),
        }
    }

    /// The scope IP rebased to the owning object's link-time addresses.
    pub fn object_ip(&self) -> Option<u64> {
        let obj = self.object.as_ref()?;
        self.scope_ip().checked_sub(obj.bias)
    }

    /// The `DW_TAG_subprogram` covering this frame, resolved once.
    pub fn function(&self) -> Option<Die> {
        if let Some(cached) = self.function.borrow().as_ref() {
            return cached.clone();
        }
        let resolved = self
            .object
            .as_ref()
            .zip(self.object_ip())
            .and_then(|(obj, addr)| obj.info.subprogram_for(addr));
        *self.function.borrow_mut() = Some(resolved.clone());
        resolved
    }

    /// Inlined subroutines active at this frame's IP, innermost first.
    pub fn inline_chain(&self) -> Vec<Die> {
        let mut out = Vec::new();
        let (Some(addr), Some(func)) = (self.object_ip(), self.function()) else {
            return out;
        };
        let mut scope = func;
        while let Some(next) = find_inline(&scope, addr) {
            out.push(next.clone());
            scope = next;
        }
        out.reverse();
        out
    }

    /// The frame base, from the function's `DW_AT_frame_base` expression.
    pub fn frame_base(&self, process: &Process) -> Option<u64> {
        let func = self.function()?;
        let obj = self.object.as_ref()?;
        match func.attr(DW_AT_frame_base)? {
            AttrValue::Block { offset, length } => {
                let r = die_block(&obj.info, offset, length).ok()?;
                let mut stack = ExpressionStack::new();
                let ctx = EvalContext {
                    regs: &self.regs,
                    cfa: self.cfa,
                    frame_base: None,
                    bias: obj.bias,
                    addr_size: self.arch.word_size() as u8,
                    endian: process.endian(),
                    memory: process,
                };
                match stack.eval(&ctx, r) {
                    Ok(v) => Some(v),
                    Err(e) => {
                        log::debug!("frame base evaluation failed: {}", e);
                        None
                    }
                }
            }
            _ => None,
        }
    }

    /// Formal parameters of the frame's function, with evaluated values.
    pub fn args(&self, process: &Process) -> Vec<VarValue> {
        let Some(func) = self.function() else {
            return Vec::new();
        };
        let frame_base = self.frame_base(process);
        func.children()
            .filter(|d| d.tag() == DW_TAG_formal_parameter)
            .map(|d| self.var_value(process, &d, frame_base))
            .collect()
    }

    /// Local variables in scope at the frame's IP, with evaluated values.
    pub fn locals(&self, process: &Process) -> Vec<VarValue> {
        let mut out = Vec::new();
        let Some(func) = self.function() else {
            return out;
        };
        let addr = self.object_ip().unwrap_or(0);
        let frame_base = self.frame_base(process);
        self.collect_locals(process, &func, addr, frame_base, &mut out);
        out
    }

    fn collect_locals(
        &self,
        process: &Process,
        scope: &Die,
        addr: u64,
        frame_base: Option<u64>,
        out: &mut Vec<VarValue>,
    ) {
        for child in scope.children() {
            match child.tag() {
                DW_TAG_variable => out.push(self.var_value(process, &child, frame_base)),
                DW_TAG_lexical_block => {
                    if child.contains_address(addr) != Contains::No {
                        self.collect_locals(process, &child, addr, frame_base, out);
                    }
                }
                _ => {}
            }
        }
    }

    fn var_value(&self, process: &Process, die: &Die, frame_base: Option<u64>) -> VarValue {
        let name = die.name().unwrap_or_else(|| "?".to_string());
        let type_name = match die.attr_die(DW_AT_type) {
            Some(t) => t.type_name(),
            None => "void".to_string(),
        };
        let mut value = None;
        let mut in_register = None;
        if let Some(obj) = &self.object {
            match die.attr(DW_AT_location) {
                Some(AttrValue::Block { offset, length }) => {
                    if let Ok(r) = die_block(&obj.info, offset, length) {
                        let mut stack = ExpressionStack::new();
                        let ctx = EvalContext {
                            regs: &self.regs,
                            cfa: self.cfa,
                            frame_base,
                            bias: obj.bias,
                            addr_size: self.arch.word_size() as u8,
                            endian: process.endian(),
                            memory: process,
                        };
                        match stack.eval(&ctx, r) {
                            Ok(result) => {
                                if stack.is_reg {
                                    in_register = Some(stack.in_reg);
                                    value = Some(result);
                                } else if stack.is_value {
                                    value = Some(result);
                                } else {
                                    value = read_word(
                                        process,
                                        process.endian(),
                                        result,
                                        self.arch.word_size() as u8,
                                    )
                                    .ok();
                                }
                            }
                            Err(e) => log::debug!("location of {} unavailable: {}", name, e),
                        }
                    }
                }
                Some(_) => {
                    log::debug!("location lists are not evaluated; skipping {}", name);
                }
                None => {}
            }
        }
        VarValue {
            name,
            type_name,
            value,
            in_register,
        }
    }
}

/// A variable or argument with its evaluated location.
pub struct VarValue {
    pub name: String,
    pub type_name: String,
    pub value: Option<u64>,
    pub in_register: Option<u16>,
}

fn find_inline(scope: &Die, addr: u64) -> Option<Die> {
    for child in scope.children() {
        match child.tag() {
            DW_TAG_inlined_subroutine => {
                if child.contains_address(addr) == Contains::Yes {
                    return Some(child);
                }
            }
            DW_TAG_lexical_block => {
                if child.contains_address(addr) != Contains::No {
                    if let Some(hit) = find_inline(&child, addr) {
                        return Some(hit);
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn die_block(info: &Rc<Info>, offset: u64, length: u64) -> Result<crate::Reader, Error> {
    let mut r = crate::reader_at(&info.debug_info, offset)?;
    r.truncate(length as usize)?;
    Ok(r)
}

/// Produces the caller of `current`, trying each mechanism in priority
/// order, or `None` when the stack ends here.
pub fn unwind(process: &Process, current: &Frame) -> Option<Frame> {
    match unwind_dwarf(process, current) {
        Ok(frame) => return Some(frame),
        Err(e) => log::trace!("no CFI unwind at {:#x}: {}", current.raw_ip, e),
    }
    if let Some(frame) = unwind_trampoline(process, current) {
        return Some(frame);
    }
    if let Some(frame) = unwind_frame_pointer(process, current) {
        return Some(frame);
    }
    unwind_bad_ip(process, current)
}

fn unwind_dwarf(process: &Process, current: &Frame) -> Result<Frame, Error> {
    let obj = current
        .object
        .as_ref()
        .ok_or(Error::CfiMiss(current.raw_ip))?;
    let ip = current
        .object_ip()
        .ok_or(Error::CfiMiss(current.raw_ip))?;
    let arch = current.arch;

    let tables: Vec<Rc<CfiTable>> = obj
        .info
        .eh_frame()
        .into_iter()
        .chain(obj.info.debug_frame())
        .collect();
    let mut last = Error::CfiMiss(current.raw_ip);
    for table in tables {
        let row = match table.row_for(ip) {
            Ok(row) => row,
            Err(e) => {
                last = e;
                continue;
            }
        };

        // CFA first; register rules are relative to it.
        let cfa = match row.cfa {
            CfaRule::RegisterOffset { reg, offset } => current
                .reg(reg)
                .ok_or(Error::InvalidFrame("CFA register was not recovered"))?
                .wrapping_add(offset as u64),
            CfaRule::Expression(offset, length) => {
                let r = table.block_reader(offset, length)?;
                let mut stack = ExpressionStack::new();
                let ctx = EvalContext {
                    regs: &current.regs,
                    cfa: None,
                    frame_base: None,
                    bias: obj.bias,
                    addr_size: arch.word_size() as u8,
                    endian: process.endian(),
                    memory: process,
                };
                stack.eval(&ctx, r)?
            }
        };

        // Registers without a rule keep their value; explicit rules
        // override, and `undefined` drops the register.
        let mut regs = current.regs.clone();
        for (&reg, &rule) in &row.regs {
            let value = match rule {
                RegisterRule::Undefined => {
                    regs.remove(&reg);
                    continue;
                }
                RegisterRule::SameValue => match current.reg(reg) {
                    Some(v) => v,
                    None => continue,
                },
                RegisterRule::Offset(n) => read_word(
                    process,
                    process.endian(),
                    cfa.wrapping_add(n as u64),
                    arch.word_size() as u8,
                )?,
                RegisterRule::ValOffset(n) => cfa.wrapping_add(n as u64),
                RegisterRule::Register(src) => match current.reg(src) {
                    Some(v) => v,
                    None => continue,
                },
                RegisterRule::Expression(offset, length) => {
                    let addr = eval_rule_expression(
                        process, current, &table, obj, cfa, offset, length,
                    )?;
                    read_word(process, process.endian(), addr, arch.word_size() as u8)?
                }
                RegisterRule::ValExpression(offset, length) => eval_rule_expression(
                    process, current, &table, obj, cfa, offset, length,
                )?,
            };
            regs.insert(reg, value);
        }

        // The return-address column must have produced a value; an
        // undefined one is the end of the stack.
        if !row.regs.contains_key(&row.ra_reg) {
            return Err(Error::InvalidFrame("return address rule is undefined"));
        }
        let ra = regs
            .get(&row.ra_reg)
            .copied()
            .ok_or(Error::InvalidFrame("return address rule is undefined"))?;

        // The caller resumes with its stack pointer at the CFA.
        regs.insert(arch.sp_reg(), cfa);
        regs.insert(arch.ip_reg(), ra);
        return Ok(current.derived(UnwindMechanism::Dwarf, ra, Some(cfa), regs));
    }
    Err(last)
}

fn eval_rule_expression(
    process: &Process,
    current: &Frame,
    table: &CfiTable,
    obj: &FrameObject,
    cfa: u64,
    offset: u64,
    length: u64,
) -> Result<u64, Error> {
    let r = table.block_reader(offset, length)?;
    let mut stack = ExpressionStack::new();
    let ctx = EvalContext {
        regs: &current.regs,
        cfa: Some(cfa),
        frame_base: None,
        bias: obj.bias,
        addr_size: current.arch.word_size() as u8,
        endian: process.endian(),
        memory: process,
    };
    // Register-rule expressions start with the CFA on the stack.
    stack.eval_seeded(&ctx, r, Some(cfa))
}

/// x86-64 `rt_sigreturn` stubs: `mov $0xf,{%rax|%eax}; syscall`.
const SIGRETURN_MOVQ: [u8; 9] = [0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05];
const SIGRETURN_MOVL: [u8; 7] = [0xb8, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05];

fn unwind_trampoline(process: &Process, current: &Frame) -> Option<Frame> {
    let arch = current.arch;
    if arch != Arch::X86_64 {
        return None;
    }
    // The saved return address points exactly at the stub, so probe the
    // raw IP, not the scope IP.
    let mut code = [0u8; 9];
    let got = process.read_memory(current.raw_ip, &mut code).ok()?;
    let is_sigreturn =
        (got >= 9 && code == SIGRETURN_MOVQ) || (got >= 7 && code[..7] == SIGRETURN_MOVL);
    if !is_sigreturn {
        return None;
    }

    // The kernel left a ucontext_t on the stack; lift the whole register
    // file back out of its greg array.
    let sp = current.reg(arch.sp_reg())?;
    let gregs = sp.wrapping_add(arch.ucontext_gregs_offset());
    let word = arch.word_size();
    let mut regs = BTreeMap::new();
    for (i, slot) in arch.ucontext_gregs().iter().enumerate() {
        let Some(dwarf) = slot else { continue };
        let value = read_word(
            process,
            process.endian(),
            gregs + i as u64 * word,
            word as u8,
        )
        .ok()?;
        regs.insert(*dwarf, value);
    }
    let ip = regs.get(&arch.ip_reg()).copied()?;
    let cfa = regs.get(&arch.sp_reg()).copied();
    Some(current.derived(UnwindMechanism::Trampoline, ip, cfa, regs))
}

fn unwind_frame_pointer(process: &Process, current: &Frame) -> Option<Frame> {
    // Only meaningful when the IP was mapped but carried no CFI.
    current.object.as_ref()?;
    let arch = current.arch;
    let word = arch.word_size();
    let fp = current.reg(arch.fp_reg()).filter(|&fp| fp != 0)?;

    let saved_fp = read_word(process, process.endian(), fp, word as u8).ok()?;
    let pc = read_word(process, process.endian(), fp + word, word as u8).ok()?;
    if pc == 0 {
        return None;
    }
    let cfa = saved_fp.wrapping_add(word);
    let mut regs = BTreeMap::new();
    regs.insert(arch.fp_reg(), saved_fp);
    regs.insert(arch.sp_reg(), cfa);
    regs.insert(arch.ip_reg(), pc);
    Some(current.derived(UnwindMechanism::FramePointer, pc, Some(cfa), regs))
}

fn unwind_bad_ip(process: &Process, current: &Frame) -> Option<Frame> {
    // Hypothesis: the thread jumped through a bad pointer, so the word at
    // the stack pointer is the return address of that bogus call. Only
    // worth trying when the IP really is unmapped.
    if current.object.is_some() {
        return None;
    }
    let arch = current.arch;
    let word = arch.word_size();
    let sp = current.reg(arch.sp_reg())?;
    let ra = read_word(process, process.endian(), sp, word as u8).ok()?;
    if ra == 0 {
        return None;
    }
    let new_sp = sp.wrapping_add(word);
    let mut regs = current.regs.clone();
    regs.insert(arch.sp_reg(), new_sp);
    regs.insert(arch.ip_reg(), ra);
    Some(current.derived(UnwindMechanism::BadIpRecovery, ra, Some(new_sp), regs))
}

/// The frames of one thread, innermost first.
pub struct ThreadStack {
    pub tid: u32,
    pub frames: Vec<Frame>,
}

impl ThreadStack {
    /// Builds the stack by iterating the unwinder from a register
    /// snapshot, bounded by `Options::max_depth`. Loops are broken by
    /// never visiting the same CFA twice, and CFAs must strictly grow
    /// outward.
    pub fn unwind(process: &Process, tid: u32, regs: &CoreRegisters) -> ThreadStack {
        let max_depth = process.options.max_depth;
        let mut frames = Vec::new();
        let mut seen_cfas = HashSet::new();

        let mut cur = Frame::from_machine_regs(process.arch(), regs);
        cur.object = process
            .find_object(cur.raw_ip)
            .map(|(bias, info, phdr)| FrameObject { bias, info, phdr });

        while frames.len() < max_depth {
            let mut next = None;
            if let Some(mut candidate) = unwind(process, &cur) {
                let grows = match (candidate.cfa, cur.cfa) {
                    (Some(n), Some(p)) => n > p,
                    _ => true,
                };
                let fresh = candidate.cfa.map_or(true, |n| seen_cfas.insert(n));
                if candidate.raw_ip != 0 && grows && fresh {
                    candidate.object = process
                        .find_object(candidate.raw_ip)
                        .map(|(bias, info, phdr)| FrameObject { bias, info, phdr });
                    if candidate.object.is_some() {
                        next = Some(candidate);
                    }
                }
            }
            frames.push(cur);
            match next {
                Some(n) => cur = n,
                None => break,
            }
        }
        ThreadStack { tid, frames }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::proc::MapHost;
    use crate::testutil::{InfoBuilder, Sect};
    use crate::Options;
    use rangemap::RangeInclusiveMap;

    /// .eh_frame with two functions:
    ///   f [0x1000,0x1100): cfa = rsp + 16, ra at cfa - 8
    ///   g [0x2000,0x2100): cfa = rsp + 8, ra at cfa - 8
    fn eh_frame() -> Vec<u8> {
        fn push_record(out: &mut Vec<u8>, f: impl FnOnce(&mut Sect)) {
            let mut body = Sect::new();
            f(&mut body);
            let body = body.into_vec();
            out.extend_from_slice(&(body.len() as u32).to_le_bytes());
            out.extend_from_slice(&body);
        }
        let mut out = Vec::new();
        push_record(&mut out, |b| {
            b.u32(0); // CIE
            b.u8(1);
            b.cstr("zR");
            b.uleb(1);
            b.sleb(-8);
            b.u8(16);
            b.uleb(1);
            b.u8(0); // absptr
            b.u8(0x0c).uleb(7).uleb(8); // def_cfa rsp+8
            b.u8(0x80 | 16).uleb(1); // ra at cfa-8
        });
        let cie_len = out.len();
        push_record(&mut out, |b| {
            b.u32((cie_len + 4) as u32);
            b.u64(0x1000);
            b.u64(0x100);
            b.uleb(0);
            b.u8(0x40 | 4); // at +4
            b.u8(0x0e).uleb(16); // cfa = rsp + 16
        });
        let fde2_cie = out.len();
        push_record(&mut out, |b| {
            b.u32((fde2_cie + 4) as u32); // distance back to the CIE at 0
            b.u64(0x2000);
            b.u64(0x100);
            b.uleb(0);
        });
        // h [0x2800,0x2900): cfa pinned at rsp + 0 — a degenerate frame
        // that never grows the stack.
        let fde3_cie = out.len();
        push_record(&mut out, |b| {
            b.u32((fde3_cie + 4) as u32);
            b.u64(0x2800);
            b.u64(0x100);
            b.uleb(0);
            b.u8(0x0e).uleb(0); // def_cfa_offset 0
        });
        out.extend_from_slice(&0u32.to_le_bytes());
        out
    }

    fn test_process(memory: RangeInclusiveMap<u64, Vec<u8>>, max_depth: usize) -> Process {
        let host = MapHost {
            memory,
            threads: Vec::new(),
        };
        let process = Process::new(
            Box::new(host),
            Options {
                max_depth,
                ..Options::default()
            },
        );
        let info = InfoBuilder::new()
            .image_section(".eh_frame", 0, eh_frame())
            .load_segment(0x1000, 0x2000)
            .build();
        process.add_object(0, info);
        process
    }

    fn regs(rip: u64, rsp: u64, rbp: u64) -> CoreRegisters {
        CoreRegisters {
            rip,
            rsp,
            rbp,
            ..CoreRegisters::default()
        }
    }

    fn word(memory: &mut RangeInclusiveMap<u64, Vec<u8>>, addr: u64, value: u64) {
        // RangeInclusiveMap coalesces adjacent ranges whose values compare
        // equal, which would silently merge repeated words (same bytes) at
        // contiguous addresses into one oversized range. Tag each entry
        // with its address so otherwise-identical words stay distinct;
        // reads only ever consume the leading `value` bytes.
        let mut bytes = value.to_le_bytes().to_vec();
        bytes.extend_from_slice(&addr.to_le_bytes());
        memory.insert(addr..=addr + 7, bytes);
    }

    #[test]
    fn dwarf_unwind_through_two_frames() {
        let mut memory = RangeInclusiveMap::new();
        // f's frame: cfa = 0x7000 + 16 = 0x7010, ra at 0x7008 -> g.
        word(&mut memory, 0x7008, 0x2020);
        // g's frame: cfa = 0x7010 + 8 = 0x7018, ra at 0x7010 -> 0 (done).
        word(&mut memory, 0x7010, 0);

        let process = test_process(memory, 64);
        let stack = ThreadStack::unwind(&process, 1, &regs(0x1010, 0x7000, 0));

        assert_eq!(stack.frames.len(), 2);
        assert_eq!(stack.frames[0].mechanism, UnwindMechanism::MachineRegs);
        assert_eq!(stack.frames[0].raw_ip, 0x1010);
        assert_eq!(stack.frames[0].scope_ip(), 0x1010);
        assert_eq!(stack.frames[1].mechanism, UnwindMechanism::Dwarf);
        assert_eq!(stack.frames[1].raw_ip, 0x2020);
        // Return addresses point after the call; scope is one less.
        assert_eq!(stack.frames[1].scope_ip(), 0x201f);
        assert_eq!(stack.frames[1].cfa, Some(0x7010));
        // The caller's SP is the callee's CFA.
        assert_eq!(stack.frames[1].reg(7), Some(0x7010));
    }

    #[test]
    fn cfa_must_strictly_grow() {
        let mut memory = RangeInclusiveMap::new();
        // h's CFA equals its stack pointer, and it "returns" into itself;
        // the second derived frame would repeat the same CFA.
        word(&mut memory, 0x6ff8, 0x2810);
        let process = test_process(memory, 64);
        let stack = ThreadStack::unwind(&process, 1, &regs(0x2810, 0x7000, 0));
        assert_eq!(stack.frames.len(), 2);
        assert_eq!(stack.frames[1].cfa, Some(0x7000));
    }

    #[test]
    fn max_depth_bounds_the_walk() {
        let mut memory = RangeInclusiveMap::new();
        // An endless chain of g-frames, each CFA 8 above the last.
        for i in 0..64u64 {
            word(&mut memory, 0x7000 + i * 8, 0x2020);
        }
        let process = test_process(memory, 5);
        let stack = ThreadStack::unwind(&process, 1, &regs(0x2020, 0x7000, 0));
        assert_eq!(stack.frames.len(), 5);
    }

    #[test]
    fn zeroed_registers_terminate_immediately() {
        let process = test_process(RangeInclusiveMap::new(), 64);
        let stack = ThreadStack::unwind(&process, 1, &regs(0, 0, 0));
        assert_eq!(stack.frames.len(), 1);
        assert_eq!(stack.frames[0].mechanism, UnwindMechanism::MachineRegs);
    }

    #[test]
    fn bad_ip_recovery_after_jump_through_null() {
        let mut memory = RangeInclusiveMap::new();
        // The word at SP is the return address of the bogus call, into f.
        word(&mut memory, 0x7000, 0x1010);
        // f's frame unwinds by CFI: cfa = 0x7008 + 16 = 0x7018, ra at
        // cfa - 8 -> g, whose own return slot holds 0.
        word(&mut memory, 0x7010, 0x2020);
        word(&mut memory, 0x7018, 0);

        let process = test_process(memory, 64);
        let stack = ThreadStack::unwind(&process, 1, &regs(0, 0x7000, 0));

        assert_eq!(stack.frames.len(), 3);
        assert_eq!(stack.frames[0].raw_ip, 0);
        assert_eq!(stack.frames[0].mechanism, UnwindMechanism::MachineRegs);
        assert_eq!(stack.frames[1].mechanism, UnwindMechanism::BadIpRecovery);
        assert_eq!(stack.frames[1].raw_ip, 0x1010);
        assert_eq!(stack.frames[1].cfa, Some(0x7008));
        assert_eq!(stack.frames[2].mechanism, UnwindMechanism::Dwarf);
    }

    #[test]
    fn trampoline_restores_interrupted_registers() {
        let mut memory = RangeInclusiveMap::new();
        // A signal-return stub at 0x3000 (mapped, but carries no FDE).
        let mut stub = SIGRETURN_MOVQ.to_vec();
        stub.extend_from_slice(&[0; 7]);
        memory.insert(0x3000..=0x300f, stub);

        // ucontext gregs at sp + 40.
        let sp = 0x7100u64;
        let gregs = sp + 40;
        for i in 0..23u64 {
            word(&mut memory, gregs + i * 8, 0);
        }
        word(&mut memory, gregs + 16 * 8, 0x1010); // RIP slot: interrupted pc
        word(&mut memory, gregs + 15 * 8, 0x8000); // RSP slot
        word(&mut memory, gregs + 10 * 8, 0x8880); // RBP slot
        // The interrupted f frame then ends cleanly: ra at cfa - 8 is 0.
        word(&mut memory, 0x8008, 0);

        let host = MapHost {
            memory,
            threads: Vec::new(),
        };
        let process = Process::new(Box::new(host), Options::default());
        let info = InfoBuilder::new()
            .image_section(".eh_frame", 0, eh_frame())
            .load_segment(0x1000, 0x2000) // covers f/g
            .load_segment(0x3000, 0x100) // covers the stub
            .build();
        process.add_object(0, info);

        let stack = ThreadStack::unwind(&process, 1, &regs(0x3000, sp, 0));
        assert_eq!(stack.frames.len(), 2);
        let interrupted = &stack.frames[1];
        assert_eq!(interrupted.mechanism, UnwindMechanism::Trampoline);
        // The interrupted PC is preserved exactly.
        assert_eq!(interrupted.raw_ip, 0x1010);
        assert_eq!(interrupted.scope_ip(), 0x1010);
        assert_eq!(interrupted.reg(7), Some(0x8000));
        assert_eq!(interrupted.reg(6), Some(0x8880));
    }

    #[test]
    fn frame_pointer_fallback_when_no_cfi_covers() {
        let mut memory = RangeInclusiveMap::new();
        // fp chain: rbp=0x7800 -> saved rbp 0x7900, ra 0x1010.
        word(&mut memory, 0x7800, 0x7900);
        word(&mut memory, 0x7808, 0x1010);
        word(&mut memory, 0x7910, 0); // f then terminates

        let host = MapHost {
            memory,
            threads: Vec::new(),
        };
        let process = Process::new(Box::new(host), Options::default());
        // The object maps 0x5000 but the eh_frame has no FDE there.
        let info = InfoBuilder::new()
            .image_section(".eh_frame", 0, eh_frame())
            .load_segment(0x1000, 0x2000)
            .load_segment(0x5000, 0x100)
            .build();
        process.add_object(0, info);

        let stack = ThreadStack::unwind(&process, 1, &regs(0x5010, 0x7700, 0x7800));
        assert!(stack.frames.len() >= 2);
        let caller = &stack.frames[1];
        assert_eq!(caller.mechanism, UnwindMechanism::FramePointer);
        assert_eq!(caller.raw_ip, 0x1010);
        assert_eq!(caller.reg(6), Some(0x7900));
        assert_eq!(caller.cfa, Some(0x7908));
    }
}
