//! Call Frame Information: `.eh_frame` / `.debug_frame` parsing and the
//! interpretation of unwind programs.
//!
//! Parsing happens once per section, producing an FDE index sorted by
//! initial address. Answering "how do I unwind at IP" replays the CIE's
//! initial instructions and then the FDE's program up to that IP, yielding
//! one table row: a CFA rule plus per-register restore rules.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use gimli::constants::*;
use gimli::Reader as _;

use crate::{reader_at, reader_offset, Error, Reader};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CfiKind {
    EhFrame,
    DebugFrame,
}

/// How the CFA is computed at a given location.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CfaRule {
    RegisterOffset { reg: u16, offset: i64 },
    /// DWARF expression block at (section offset, length).
    Expression(u64, u64),
}

/// How one register of the caller is recovered.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegisterRule {
    Undefined,
    SameValue,
    /// Value stored at CFA + offset.
    Offset(i64),
    /// Value is CFA + offset itself.
    ValOffset(i64),
    /// Value lives in another register.
    Register(u16),
    /// Value stored at the address an expression computes.
    Expression(u64, u64),
    /// Value is what the expression computes.
    ValExpression(u64, u64),
}

/// A Common Information Entry, shared by the FDEs that point at it.
pub struct Cie {
    pub version: u8,
    pub addr_size: u8,
    pub code_align: u64,
    pub data_align: i64,
    pub ra_reg: u16,
    fde_encoding: u8,
    has_aug_data: bool,
    pub signal_frame: bool,
    /// (section offset, length) of the initial instructions.
    initial_instructions: (u64, u64),
}

/// A Frame Description Entry covering `[start, end)` in link-time
/// addresses.
pub struct Fde {
    pub start: u64,
    pub end: u64,
    cie: Rc<Cie>,
    instructions: (u64, u64),
}

/// One row of the conceptual unwind table, computed for a specific IP.
pub struct UnwindRow {
    pub cfa: CfaRule,
    pub regs: BTreeMap<u16, RegisterRule>,
    pub ra_reg: u16,
    pub signal_frame: bool,
}

pub struct CfiTable {
    kind: CfiKind,
    section_addr: u64,
    section: Reader,
    addr_size: u8,
    fdes: BTreeMap<u64, Fde>,
}

impl CfiTable {
    /// Parses a whole CFI section. Individually broken records are logged
    /// and skipped; the rest of the section stays usable.
    pub fn parse(
        kind: CfiKind,
        section_addr: u64,
        section: Reader,
        addr_size: u8,
    ) -> Result<CfiTable, Error> {
        let mut table = CfiTable {
            kind,
            section_addr,
            section: section.clone(),
            addr_size,
            fdes: BTreeMap::new(),
        };
        let mut cies: HashMap<u64, Rc<Cie>> = HashMap::new();
        let mut r = section.clone();
        while !r.is_empty() {
            let record_offset = reader_offset(&r, &section);
            let (length, format) = r.read_initial_length()?;
            if length == 0 {
                // .eh_frame terminator.
                break;
            }
            let entry_end = reader_offset(&r, &section) + length as u64;
            let id_pos = reader_offset(&r, &section);
            let id = r.read_offset(format)? as u64;
            let cie_id = match (kind, format) {
                (CfiKind::EhFrame, _) => 0,
                (CfiKind::DebugFrame, gimli::Format::Dwarf32) => 0xffff_ffff,
                (CfiKind::DebugFrame, gimli::Format::Dwarf64) => u64::MAX,
            };
            let outcome = if id == cie_id {
                table
                    .parse_cie(&mut r, entry_end)
                    .map(|cie| {
                        cies.insert(record_offset, Rc::new(cie));
                    })
            } else {
                let cie_offset = match kind {
                    CfiKind::EhFrame => id_pos.checked_sub(id),
                    CfiKind::DebugFrame => Some(id),
                };
                match cie_offset.and_then(|off| cies.get(&off).cloned()) {
                    Some(cie) => table.parse_fde(&mut r, entry_end, cie),
                    None => Err(Error::MalformedDwarf("FDE names an unknown CIE")),
                }
            };
            if let Err(e) = outcome {
                log::debug!("skipping CFI record at {:#x}: {}", record_offset, e);
            }
            r = reader_at(&section, entry_end)?;
        }
        Ok(table)
    }

    fn parse_cie(&self, r: &mut Reader, entry_end: u64) -> Result<Cie, Error> {
        let version = r.read_u8()?;
        if !matches!(version, 1 | 3 | 4) {
            return Err(Error::MalformedDwarf("unsupported CIE version"));
        }
        let augmentation = r.read_null_terminated_slice()?.to_slice()?.to_vec();
        let addr_size = if version >= 4 {
            let size = r.read_u8()?;
            let segment = r.read_u8()?;
            if segment != 0 {
                return Err(Error::MalformedDwarf("segmented CFI is not supported"));
            }
            size
        } else {
            self.addr_size
        };
        let code_align = r.read_uleb128()?;
        let data_align = r.read_sleb128()?;
        let ra_reg = if version == 1 {
            r.read_u8()? as u16
        } else {
            r.read_uleb128()? as u16
        };

        let mut fde_encoding = DW_EH_PE_absptr.0;
        let mut signal_frame = false;
        let mut has_aug_data = false;
        match augmentation.first().copied() {
            None => {}
            Some(b'z') => {
                has_aug_data = true;
                let aug_len = r.read_uleb128()?;
                let aug_end = reader_offset(r, &self.section) + aug_len;
                for &ch in &augmentation[1..] {
                    match ch {
                        b'R' => fde_encoding = r.read_u8()?,
                        b'L' => {
                            r.read_u8()?; // LSDA encoding
                        }
                        b'P' => {
                            let enc = r.read_u8()?;
                            let at = reader_offset(r, &self.section);
                            self.read_encoded(r, enc, addr_size, at)?;
                        }
                        b'S' => signal_frame = true,
                        _ => break, // cannot interpret further characters
                    }
                }
                *r = reader_at(&self.section, aug_end)?;
            }
            Some(b'e') if augmentation == b"eh" => {
                // Legacy GCC "eh" augmentation carries one pointer.
                r.read_address(addr_size)?;
            }
            Some(_) => return Err(Error::MalformedDwarf("unknown CIE augmentation")),
        }

        let here = reader_offset(r, &self.section);
        Ok(Cie {
            version,
            addr_size,
            code_align,
            data_align,
            ra_reg,
            fde_encoding,
            has_aug_data,
            signal_frame,
            initial_instructions: (here, entry_end - here),
        })
    }

    fn parse_fde(&mut self, r: &mut Reader, entry_end: u64, cie: Rc<Cie>) -> Result<(), Error> {
        let (start, range) = match self.kind {
            CfiKind::EhFrame => {
                let at = reader_offset(r, &self.section);
                let start = self.read_encoded(r, cie.fde_encoding, cie.addr_size, at)?;
                let range = self.read_encoded_size(r, cie.fde_encoding, cie.addr_size)?;
                (start, range)
            }
            CfiKind::DebugFrame => {
                let start = r.read_address(cie.addr_size)?;
                let range = r.read_address(cie.addr_size)?;
                (start, range)
            }
        };
        if cie.has_aug_data {
            let len = r.read_uleb128()?;
            r.skip(len as usize)?;
        }
        let here = reader_offset(r, &self.section);
        self.fdes.insert(
            start,
            Fde {
                start,
                end: start + range,
                cie,
                instructions: (here, entry_end - here),
            },
        );
        Ok(())
    }

    /// Decodes a `DW_EH_PE_*`-encoded pointer whose encoded form begins at
    /// section offset `at` (needed for pc-relative application).
    fn read_encoded(&self, r: &mut Reader, enc: u8, addr_size: u8, at: u64) -> Result<u64, Error> {
        if enc == DW_EH_PE_omit.0 {
            return Err(Error::MalformedDwarf("omitted CFI pointer"));
        }
        if enc & 0x80 != 0 {
            // DW_EH_PE_indirect needs target memory at parse time.
            return Err(Error::MalformedDwarf("indirect CFI pointers are not supported"));
        }
        let value = self.read_encoded_size(r, enc, addr_size)?;
        Ok(match enc & 0x70 {
            0x00 => value,
            x if x == DW_EH_PE_pcrel.0 => value.wrapping_add(self.section_addr + at),
            x if x == DW_EH_PE_datarel.0 => value.wrapping_add(self.section_addr),
            _ => return Err(Error::MalformedDwarf("unsupported CFI pointer application")),
        })
    }

    /// The value-format half of a pointer encoding, with no application.
    fn read_encoded_size(&self, r: &mut Reader, enc: u8, addr_size: u8) -> Result<u64, Error> {
        Ok(match enc & 0x0f {
            x if x == DW_EH_PE_absptr.0 => r.read_address(addr_size)?,
            x if x == DW_EH_PE_uleb128.0 => r.read_uleb128()?,
            x if x == DW_EH_PE_udata2.0 => r.read_u16()? as u64,
            x if x == DW_EH_PE_udata4.0 => r.read_u32()? as u64,
            x if x == DW_EH_PE_udata8.0 => r.read_u64()?,
            x if x == DW_EH_PE_sleb128.0 => r.read_sleb128()? as u64,
            x if x == DW_EH_PE_sdata2.0 => r.read_u16()? as i16 as i64 as u64,
            x if x == DW_EH_PE_sdata4.0 => r.read_u32()? as i32 as i64 as u64,
            x if x == DW_EH_PE_sdata8.0 => r.read_u64()?,
            _ => return Err(Error::MalformedDwarf("unsupported CFI pointer format")),
        })
    }

    /// The FDE covering a link-time address.
    pub fn fde_for(&self, ip: u64) -> Option<&Fde> {
        let (_, fde) = self.fdes.range(..=ip).next_back()?;
        (fde.end > ip).then_some(fde)
    }

    /// A reader over an expression block recorded by a rule.
    pub fn block_reader(&self, offset: u64, length: u64) -> Result<Reader, Error> {
        let mut r = reader_at(&self.section, offset)?;
        r.truncate(length as usize)?;
        Ok(r)
    }

    /// Computes the unwind-table row in effect at `ip`.
    pub fn row_for(&self, ip: u64) -> Result<UnwindRow, Error> {
        let fde = self.fde_for(ip).ok_or(Error::CfiMiss(ip))?;
        let cie = &fde.cie;

        let mut state = RowState::default();
        let (off, len) = cie.initial_instructions;
        let mut r = self.block_reader(off, len)?;
        self.run(&mut r, cie, fde.start, ip, &mut state, None)?;

        let initial = state.clone();
        let (off, len) = fde.instructions;
        let mut r = self.block_reader(off, len)?;
        self.run(&mut r, cie, fde.start, ip, &mut state, Some(&initial))?;

        let cfa = state
            .cfa
            .ok_or(Error::MalformedDwarf("CFI program defined no CFA rule"))?;
        Ok(UnwindRow {
            cfa,
            regs: state.regs,
            ra_reg: cie.ra_reg,
            signal_frame: cie.signal_frame,
        })
    }

    /// Executes CFI instructions until the row's location advances past
    /// `ip` or the program ends.
    fn run(
        &self,
        r: &mut Reader,
        cie: &Cie,
        start_loc: u64,
        ip: u64,
        state: &mut RowState,
        initial: Option<&RowState>,
    ) -> Result<(), Error> {
        let mut loc = start_loc;
        let mut remembered: Vec<RowState> = Vec::new();
        while !r.is_empty() {
            let op = r.read_u8()?;
            match op >> 6 {
                1 => {
                    // DW_CFA_advance_loc, delta packed in the low bits.
                    loc += (op & 0x3f) as u64 * cie.code_align;
                    if loc > ip {
                        return Ok(());
                    }
                }
                2 => {
                    // DW_CFA_offset, register packed in the low bits.
                    let factored = r.read_uleb128()?;
                    state.regs.insert(
                        (op & 0x3f) as u16,
                        RegisterRule::Offset(factored as i64 * cie.data_align),
                    );
                }
                3 => {
                    // DW_CFA_restore, register packed in the low bits.
                    let reg = (op & 0x3f) as u16;
                    restore_rule(state, initial, reg);
                }
                _ => match DwCfa(op) {
                    DW_CFA_nop => {}
                    DW_CFA_set_loc => {
                        let at = reader_offset(r, &self.section);
                        loc = self.read_encoded(r, cie.fde_encoding, cie.addr_size, at)?;
                        if loc > ip {
                            return Ok(());
                        }
                    }
                    DW_CFA_advance_loc1 => {
                        loc += r.read_u8()? as u64 * cie.code_align;
                        if loc > ip {
                            return Ok(());
                        }
                    }
                    DW_CFA_advance_loc2 => {
                        loc += r.read_u16()? as u64 * cie.code_align;
                        if loc > ip {
                            return Ok(());
                        }
                    }
                    DW_CFA_advance_loc4 => {
                        loc += r.read_u32()? as u64 * cie.code_align;
                        if loc > ip {
                            return Ok(());
                        }
                    }

                    DW_CFA_def_cfa => {
                        let reg = r.read_uleb128()? as u16;
                        let offset = r.read_uleb128()? as i64;
                        state.cfa = Some(CfaRule::RegisterOffset { reg, offset });
                    }
                    DW_CFA_def_cfa_sf => {
                        let reg = r.read_uleb128()? as u16;
                        let factored = r.read_sleb128()?;
                        state.cfa = Some(CfaRule::RegisterOffset {
                            reg,
                            offset: factored * cie.data_align,
                        });
                    }
                    DW_CFA_def_cfa_register => {
                        let new_reg = r.read_uleb128()? as u16;
                        match &mut state.cfa {
                            Some(CfaRule::RegisterOffset { reg, .. }) => *reg = new_reg,
                            _ => {
                                return Err(Error::MalformedDwarf(
                                    "def_cfa_register without a register CFA rule",
                                ))
                            }
                        }
                    }
                    DW_CFA_def_cfa_offset => {
                        let new_offset = r.read_uleb128()? as i64;
                        match &mut state.cfa {
                            Some(CfaRule::RegisterOffset { offset, .. }) => *offset = new_offset,
                            _ => {
                                return Err(Error::MalformedDwarf(
                                    "def_cfa_offset without a register CFA rule",
                                ))
                            }
                        }
                    }
                    DW_CFA_def_cfa_offset_sf => {
                        let factored = r.read_sleb128()?;
                        match &mut state.cfa {
                            Some(CfaRule::RegisterOffset { offset, .. }) => {
                                *offset = factored * cie.data_align
                            }
                            _ => {
                                return Err(Error::MalformedDwarf(
                                    "def_cfa_offset without a register CFA rule",
                                ))
                            }
                        }
                    }
                    DW_CFA_def_cfa_expression => {
                        let block = self.read_block(r)?;
                        state.cfa = Some(CfaRule::Expression(block.0, block.1));
                    }

                    DW_CFA_undefined => {
                        let reg = r.read_uleb128()? as u16;
                        state.regs.insert(reg, RegisterRule::Undefined);
                    }
                    DW_CFA_same_value => {
                        let reg = r.read_uleb128()? as u16;
                        state.regs.insert(reg, RegisterRule::SameValue);
                    }
                    DW_CFA_offset_extended => {
                        let reg = r.read_uleb128()? as u16;
                        let factored = r.read_uleb128()?;
                        state
                            .regs
                            .insert(reg, RegisterRule::Offset(factored as i64 * cie.data_align));
                    }
                    DW_CFA_offset_extended_sf => {
                        let reg = r.read_uleb128()? as u16;
                        let factored = r.read_sleb128()?;
                        state
                            .regs
                            .insert(reg, RegisterRule::Offset(factored * cie.data_align));
                    }
                    DW_CFA_val_offset => {
                        let reg = r.read_uleb128()? as u16;
                        let factored = r.read_uleb128()?;
                        state.regs.insert(
                            reg,
                            RegisterRule::ValOffset(factored as i64 * cie.data_align),
                        );
                    }
                    DW_CFA_val_offset_sf => {
                        let reg = r.read_uleb128()? as u16;
                        let factored = r.read_sleb128()?;
                        state
                            .regs
                            .insert(reg, RegisterRule::ValOffset(factored * cie.data_align));
                    }
                    DW_CFA_register => {
                        let reg = r.read_uleb128()? as u16;
                        let from = r.read_uleb128()? as u16;
                        state.regs.insert(reg, RegisterRule::Register(from));
                    }
                    DW_CFA_expression => {
                        let reg = r.read_uleb128()? as u16;
                        let block = self.read_block(r)?;
                        state
                            .regs
                            .insert(reg, RegisterRule::Expression(block.0, block.1));
                    }
                    DW_CFA_val_expression => {
                        let reg = r.read_uleb128()? as u16;
                        let block = self.read_block(r)?;
                        state
                            .regs
                            .insert(reg, RegisterRule::ValExpression(block.0, block.1));
                    }
                    DW_CFA_restore_extended => {
                        let reg = r.read_uleb128()? as u16;
                        restore_rule(state, initial, reg);
                    }

                    DW_CFA_remember_state => remembered.push(state.clone()),
                    DW_CFA_restore_state => {
                        *state = remembered
                            .pop()
                            .ok_or(Error::MalformedDwarf("restore_state with empty stack"))?;
                    }

                    // GNU extensions that carry data we don't need.
                    DW_CFA_GNU_args_size => {
                        r.read_uleb128()?;
                    }
                    DW_CFA_GNU_window_save => {}

                    _ => return Err(Error::MalformedDwarf("unknown CFI instruction")),
                },
            }
        }
        Ok(())
    }

    fn read_block(&self, r: &mut Reader) -> Result<(u64, u64), Error> {
        let len = r.read_uleb128()?;
        let off = reader_offset(r, &self.section);
        r.skip(len as usize)?;
        Ok((off, len))
    }
}

fn restore_rule(state: &mut RowState, initial: Option<&RowState>, reg: u16) {
    let rule = initial
        .and_then(|i| i.regs.get(&reg).copied())
        .unwrap_or(RegisterRule::Undefined);
    state.regs.insert(reg, rule);
}

#[derive(Clone, Default)]
struct RowState {
    cfa: Option<CfaRule>,
    regs: BTreeMap<u16, RegisterRule>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::Sect;
    use std::sync::Arc;

    fn reader(bytes: Vec<u8>) -> Reader {
        gimli::EndianReader::new(
            Arc::from(bytes.into_boxed_slice()),
            gimli::RunTimeEndian::Little,
        )
    }

    /// Assembles one record (length-prefixed) and appends it.
    fn push_record(out: &mut Vec<u8>, f: impl FnOnce(&mut Sect)) {
        let mut body = Sect::new();
        f(&mut body);
        let body = body.into_vec();
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&body);
    }

    /// A small .eh_frame: one CIE ("zR", absptr pointers, code align 1,
    /// data align -8, RA = r16) and one FDE covering [0x1000, 0x1100).
    fn sample_eh_frame() -> Vec<u8> {
        let mut out = Vec::new();
        push_record(&mut out, |b| {
            b.u32(0); // CIE id
            b.u8(1); // version
            b.cstr("zR");
            b.uleb(1); // code alignment
            b.sleb(-8); // data alignment
            b.u8(16); // return address register
            b.uleb(1); // augmentation data length
            b.u8(DW_EH_PE_absptr.0);
            // initial: DW_CFA_def_cfa r7+8; r16 at cfa-8
            b.u8(0x0c).uleb(7).uleb(8);
            b.u8(0x80 | 16).uleb(1);
        });
        let cie_len = out.len();
        push_record(&mut out, |b| {
            // cie_pointer: distance from this field back to the CIE start.
            b.u32((cie_len + 4) as u32);
            b.u64(0x1000); // initial location
            b.u64(0x100); // address range
            b.uleb(0); // augmentation data length
            // At +4: cfa offset grows to 16, rbp saved at cfa-16.
            b.u8(0x40 | 4); // advance_loc 4
            b.u8(0x0e).uleb(16); // def_cfa_offset 16
            b.u8(0x80 | 6).uleb(2); // rbp at cfa-16
        });
        out.extend_from_slice(&0u32.to_le_bytes()); // terminator
        out
    }

    #[test]
    fn finds_covering_fde() {
        let table =
            CfiTable::parse(CfiKind::EhFrame, 0, reader(sample_eh_frame()), 8).unwrap();
        assert!(table.fde_for(0xfff).is_none());
        assert_eq!(table.fde_for(0x1000).unwrap().end, 0x1100);
        assert_eq!(table.fde_for(0x10ff).unwrap().start, 0x1000);
        assert!(table.fde_for(0x1100).is_none());
    }

    #[test]
    fn row_advances_with_location() {
        let table =
            CfiTable::parse(CfiKind::EhFrame, 0, reader(sample_eh_frame()), 8).unwrap();

        let row = table.row_for(0x1002).unwrap();
        assert_eq!(row.cfa, CfaRule::RegisterOffset { reg: 7, offset: 8 });
        assert_eq!(row.regs.get(&16), Some(&RegisterRule::Offset(-8)));
        assert_eq!(row.regs.get(&6), None);
        assert_eq!(row.ra_reg, 16);

        let row = table.row_for(0x1004).unwrap();
        assert_eq!(row.cfa, CfaRule::RegisterOffset { reg: 7, offset: 16 });
        assert_eq!(row.regs.get(&6), Some(&RegisterRule::Offset(-16)));
        // The CIE-provided RA rule persists.
        assert_eq!(row.regs.get(&16), Some(&RegisterRule::Offset(-8)));
    }

    #[test]
    fn miss_is_distinguished() {
        let table =
            CfiTable::parse(CfiKind::EhFrame, 0, reader(sample_eh_frame()), 8).unwrap();
        assert!(matches!(table.row_for(0x2000), Err(Error::CfiMiss(0x2000))));
    }

    #[test]
    fn pcrel_fde_addresses() {
        // Same CIE but sdata4 pcrel addresses, section loaded at 0x5000.
        let mut out = Vec::new();
        push_record(&mut out, |b| {
            b.u32(0);
            b.u8(1);
            b.cstr("zR");
            b.uleb(1);
            b.sleb(-8);
            b.u8(16);
            b.uleb(1);
            b.u8(DW_EH_PE_pcrel.0 | DW_EH_PE_sdata4.0);
            b.u8(0x0c).uleb(7).uleb(8);
        });
        let cie_len = out.len();
        let fde_field_pos = out.len() + 4 + 4; // after length and cie ptr
        push_record(&mut out, |b| {
            b.u32((cie_len + 4) as u32);
            // Encoded start: target 0x6000 = 0x5000 + field_pos + value.
            let value = 0x6000i64 - (0x5000 + fde_field_pos as i64);
            b.u32(value as i32 as u32);
            b.u32(0x100); // range: size half only, no pcrel
            b.uleb(0);
        });
        out.extend_from_slice(&0u32.to_le_bytes());

        let table = CfiTable::parse(CfiKind::EhFrame, 0x5000, reader(out), 8).unwrap();
        let fde = table.fde_for(0x6080).unwrap();
        assert_eq!(fde.start, 0x6000);
        assert_eq!(fde.end, 0x6100);
    }

    #[test]
    fn debug_frame_flavor() {
        // .debug_frame: CIE id is all ones, version 3, plain addresses.
        let mut out = Vec::new();
        push_record(&mut out, |b| {
            b.u32(0xffff_ffff);
            b.u8(3);
            b.cstr("");
            b.uleb(1);
            b.sleb(-8);
            b.uleb(16);
            b.u8(0x0c).uleb(7).uleb(8);
            b.u8(0x80 | 16).uleb(1);
        });
        push_record(&mut out, |b| {
            b.u32(0); // CIE at section offset 0
            b.u64(0x4000);
            b.u64(0x40);
            b.u8(0x40 | 8); // advance_loc 8
            b.u8(0x0a); // remember_state
            b.u8(0x0e).uleb(32); // def_cfa_offset 32
            b.u8(0x40 | 8); // advance_loc 8 (now +16)
            b.u8(0x0b); // restore_state
        });

        let table = CfiTable::parse(CfiKind::DebugFrame, 0, reader(out), 8).unwrap();
        let row = table.row_for(0x4008).unwrap();
        assert_eq!(row.cfa, CfaRule::RegisterOffset { reg: 7, offset: 32 });
        let row = table.row_for(0x4010).unwrap();
        assert_eq!(row.cfa, CfaRule::RegisterOffset { reg: 7, offset: 8 });
    }
}
