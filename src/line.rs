//! `.debug_line` row search, for annotating frames with file and line.
//!
//! Runs the line-number program of the unit covering an address and keeps
//! the last row at or before it within its sequence. Nothing is cached:
//! the program is replayed per query, which is cheap at stack-print scale.

use std::rc::Rc;

use gimli::constants::*;
use gimli::Reader as _;

use crate::units::{AttrValue, Unit};
use crate::{reader_at, reader_offset, Error, Info, Reader};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceLine {
    pub file: String,
    pub line: u64,
    pub column: u64,
}

/// Finds the source line for `addr` (an object-relative address) using
/// `unit`'s statement list.
pub fn source_for(info: &Rc<Info>, unit: &Rc<Unit>, addr: u64) -> Option<SourceLine> {
    let offset = unit
        .root()?
        .attr_local(DW_AT_stmt_list)
        .and_then(AttrValue::udata)?;
    match run_program(info, unit, offset, addr) {
        Ok(hit) => hit,
        Err(e) => {
            log::debug!("line program at {:#x} failed: {}", offset, e);
            None
        }
    }
}

struct LineHeader {
    program_start: u64,
    end: u64,
    min_inst: u64,
    line_base: i64,
    line_range: u64,
    opcode_base: u8,
    std_lengths: Vec<u8>,
    dirs: Vec<String>,
    /// (name, directory index)
    files: Vec<(String, u64)>,
    /// v2-4 number files from 1; v5 from 0.
    file_base: u64,
}

impl LineHeader {
    fn file_name(&self, index: u64) -> String {
        let Some(slot) = index.checked_sub(self.file_base) else {
            return "?".to_string();
        };
        let Some((name, dir)) = self.files.get(slot as usize) else {
            return "?".to_string();
        };
        if name.starts_with('/') {
            return name.clone();
        }
        match self.dirs.get(*dir as usize) {
            Some(dir) if !dir.is_empty() => format!("{}/{}", dir, name),
            _ => name.clone(),
        }
    }
}

fn parse_header(info: &Rc<Info>, unit: &Rc<Unit>, offset: u64) -> Result<(LineHeader, Reader), Error> {
    let section = &info.debug_line;
    let mut r = reader_at(section, offset)?;
    let (length, format) = r.read_initial_length()?;
    let initial = match format {
        gimli::Format::Dwarf32 => 4u64,
        gimli::Format::Dwarf64 => 12,
    };
    let end = offset + initial + length as u64;
    let version = r.read_u16()?;
    if !(2..=5).contains(&version) {
        return Err(Error::MalformedDwarf("unsupported line table version"));
    }
    if version >= 5 {
        r.read_u8()?; // address_size
        let seg = r.read_u8()?;
        if seg != 0 {
            return Err(Error::MalformedDwarf("segmented line table"));
        }
    }
    let header_length = r.read_offset(format)? as u64;
    let program_start = reader_offset(&r, section) + header_length;
    let min_inst = r.read_u8()? as u64;
    if version >= 4 {
        r.read_u8()?; // maximum_operations_per_instruction
    }
    r.read_u8()?; // default_is_stmt
    let line_base = r.read_u8()? as i8 as i64;
    let line_range = r.read_u8()? as u64;
    let opcode_base = r.read_u8()?;
    let mut std_lengths = Vec::with_capacity(opcode_base.saturating_sub(1) as usize);
    for _ in 1..opcode_base {
        std_lengths.push(r.read_u8()?);
    }

    let mut dirs = Vec::new();
    let mut files = Vec::new();
    let file_base;
    if version < 5 {
        // Directory 0 is the compilation directory.
        dirs.push(
            unit.root()
                .and_then(|root| root.attr_string(DW_AT_comp_dir))
                .unwrap_or_default(),
        );
        loop {
            let s = read_header_str(&mut r)?;
            if s.is_empty() {
                break;
            }
            dirs.push(s);
        }
        loop {
            let name = read_header_str(&mut r)?;
            if name.is_empty() {
                break;
            }
            let dir = r.read_uleb128()?;
            r.read_uleb128()?; // mtime
            r.read_uleb128()?; // size
            files.push((name, dir));
        }
        file_base = 1;
    } else {
        dirs = parse_v5_entries(info, unit, &mut r, format)?
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        files = parse_v5_entries(info, unit, &mut r, format)?;
        file_base = 0;
    }

    let header = LineHeader {
        program_start,
        end,
        min_inst: min_inst.max(1),
        line_base,
        line_range: line_range.max(1),
        opcode_base,
        std_lengths,
        dirs,
        files,
        file_base,
    };
    let program = reader_at(section, header.program_start)?;
    Ok((header, program))
}

fn read_header_str(r: &mut Reader) -> Result<String, Error> {
    let bytes = r.read_null_terminated_slice()?;
    Ok(bytes.to_string_lossy()?.into_owned())
}

/// DWARF5 directory/file tables: a declared tuple format, then entries.
/// Only the forms compilers actually emit are interpreted.
fn parse_v5_entries(
    info: &Rc<Info>,
    unit: &Rc<Unit>,
    r: &mut Reader,
    format: gimli::Format,
) -> Result<Vec<(String, u64)>, Error> {
    let format_count = r.read_u8()?;
    let mut formats = Vec::with_capacity(format_count as usize);
    for _ in 0..format_count {
        let content = r.read_uleb128()?;
        let form = DwForm(r.read_uleb128()? as u16);
        formats.push((content, form));
    }
    let count = r.read_uleb128()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let mut path = String::new();
        let mut dir = 0u64;
        for &(content, form) in &formats {
            let text = match form {
                DW_FORM_string => Some(read_header_str(r)?),
                DW_FORM_line_strp => {
                    let off = r.read_offset(format)? as u64;
                    info.line_str_at(off)
                }
                DW_FORM_strp => {
                    let off = r.read_offset(format)? as u64;
                    info.str_at(off)
                }
                DW_FORM_strx | DW_FORM_udata => {
                    let v = r.read_uleb128()?;
                    if content == DW_LNCT_directory_index.0 as u64 {
                        dir = v;
                    } else if form == DW_FORM_strx {
                        // String index; resolvable through the unit.
                        if content == DW_LNCT_path.0 as u64 {
                            path = unit
                                .string(crate::units::StrRef::Idx(v))
                                .unwrap_or_default();
                        }
                    }
                    None
                }
                DW_FORM_data1 => {
                    let v = r.read_u8()? as u64;
                    if content == DW_LNCT_directory_index.0 as u64 {
                        dir = v;
                    }
                    None
                }
                DW_FORM_data2 => {
                    let v = r.read_u16()? as u64;
                    if content == DW_LNCT_directory_index.0 as u64 {
                        dir = v;
                    }
                    None
                }
                DW_FORM_data4 => {
                    r.read_u32()?;
                    None
                }
                DW_FORM_data8 => {
                    r.read_u64()?;
                    None
                }
                DW_FORM_data16 => {
                    r.skip(16)?; // MD5
                    None
                }
                other => return Err(Error::UnsupportedForm(other)),
            };
            if content == DW_LNCT_path.0 as u64 {
                if let Some(text) = text {
                    path = text;
                }
            }
        }
        out.push((path, dir));
    }
    Ok(out)
}

#[derive(Copy, Clone)]
struct Row {
    address: u64,
    file: u64,
    line: u64,
    column: u64,
}

fn run_program(
    info: &Rc<Info>,
    unit: &Rc<Unit>,
    offset: u64,
    target: u64,
) -> Result<Option<SourceLine>, Error> {
    let (header, mut r) = parse_header(info, unit, offset)?;
    let section = &info.debug_line;

    let mut row = Row {
        address: 0,
        file: 1,
        line: 1,
        column: 0,
    };
    let mut prev: Option<Row> = None;
    let mut best: Option<Row> = None;

    while reader_offset(&r, section) < header.end && !r.is_empty() {
        let op = r.read_u8()?;
        if op >= header.opcode_base {
            // Special opcode: advance address and line, then append a row.
            let adj = (op - header.opcode_base) as u64;
            row.address += (adj / header.line_range) * header.min_inst;
            row.line = row
                .line
                .wrapping_add((header.line_base + (adj % header.line_range) as i64) as u64);
            append(&mut prev, &mut best, row, target, false);
        } else if op == 0 {
            // Extended opcode.
            let len = r.read_uleb128()?;
            let next = reader_offset(&r, section) + len;
            let sub = DwLne(r.read_u8()?);
            match sub {
                DW_LNE_end_sequence => {
                    append(&mut prev, &mut best, row, target, true);
                    row = Row {
                        address: 0,
                        file: 1,
                        line: 1,
                        column: 0,
                    };
                    prev = None;
                }
                DW_LNE_set_address => {
                    let size = (len - 1) as u8;
                    row.address = r.read_address(size)?;
                }
                DW_LNE_define_file => {
                    // Pre-v5 dynamic file definition; consumed, unused.
                    read_header_str(&mut r)?;
                    r.read_uleb128()?;
                    r.read_uleb128()?;
                    r.read_uleb128()?;
                }
                DW_LNE_set_discriminator => {
                    r.read_uleb128()?;
                }
                _ => {}
            }
            r = reader_at(section, next)?;
        } else {
            match DwLns(op) {
                DW_LNS_copy => append(&mut prev, &mut best, row, target, false),
                DW_LNS_advance_pc => {
                    row.address += r.read_uleb128()? * header.min_inst;
                }
                DW_LNS_advance_line => {
                    row.line = row.line.wrapping_add(r.read_sleb128()? as u64);
                }
                DW_LNS_set_file => row.file = r.read_uleb128()?,
                DW_LNS_set_column => row.column = r.read_uleb128()?,
                DW_LNS_negate_stmt | DW_LNS_set_basic_block => {}
                DW_LNS_const_add_pc => {
                    let adj = (255 - header.opcode_base) as u64;
                    row.address += (adj / header.line_range) * header.min_inst;
                }
                DW_LNS_fixed_advance_pc => {
                    row.address += r.read_u16()? as u64;
                }
                DW_LNS_set_prologue_end | DW_LNS_set_epilogue_begin => {}
                DW_LNS_set_isa => {
                    r.read_uleb128()?;
                }
                _ => {
                    // Unknown standard opcode; its operands are ULEBs.
                    let count = header
                        .std_lengths
                        .get((op - 1) as usize)
                        .copied()
                        .unwrap_or(0);
                    for _ in 0..count {
                        r.read_uleb128()?;
                    }
                }
            }
        }
        if best.is_some() {
            break;
        }
    }

    Ok(best.map(|row| SourceLine {
        file: header.file_name(row.file),
        line: row.line,
        column: row.column,
    }))
}

/// Row-append bookkeeping: the row *before* the first one past the target
/// is the answer, provided the sequence actually covers the target.
fn append(prev: &mut Option<Row>, best: &mut Option<Row>, row: Row, target: u64, end: bool) {
    if best.is_none() {
        if let Some(p) = *prev {
            if p.address <= target && target < row.address {
                *best = Some(p);
            }
        }
    }
    *prev = if end { None } else { Some(row) };
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::{InfoBuilder, Sect};

    fn abbrev_with_stmt_list() -> Vec<u8> {
        let mut s = Sect::new();
        s.uleb(1)
            .uleb(DW_TAG_compile_unit.0 as u64)
            .u8(0)
            .uleb(DW_AT_stmt_list.0 as u64)
            .uleb(DW_FORM_sec_offset.0 as u64)
            .uleb(0)
            .uleb(0);
        s.uleb(0);
        s.into_vec()
    }

    // A v4 line program for one file "src/a.c":
    //   0x1000 line 2 / 0x1008 line 3 / end at 0x1010.
    fn line_section() -> Vec<u8> {
        let mut body = Sect::new();
        body.u16(4); // version
        let mut header = Sect::new();
        header.u8(1); // min_inst
        header.u8(1); // max_ops
        header.u8(1); // default_is_stmt
        header.u8((-5i8) as u8); // line_base
        header.u8(14); // line_range
        header.u8(13); // opcode_base
        for len in [0u8, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1] {
            header.u8(len);
        }
        header.cstr("src"); // include_directories[1]
        header.u8(0);
        header.cstr("a.c"); // file_names[1]
        header.uleb(1).uleb(0).uleb(0);
        header.u8(0);
        let header = header.into_vec();
        body.u32(header.len() as u32); // header_length
        body.bytes(&header);

        // Program.
        body.u8(0).uleb(9).u8(DW_LNE_set_address.0).u64(0x1000);
        body.u8(13 + 6); // special: addr +0, line +1 -> row (0x1000, 2)
        body.u8(13 + 6 + 14 * 8); // special: addr +8, line +1 -> row (0x1008, 3)
        body.u8(DW_LNS_advance_pc.0).uleb(8);
        body.u8(0).uleb(1).u8(DW_LNE_end_sequence.0);

        let body = body.into_vec();
        let mut out = Sect::new();
        out.u32(body.len() as u32);
        out.bytes(&body);
        out.into_vec()
    }

    fn build() -> Rc<crate::Info> {
        let mut info_sec = Sect::new();
        info_sec.unit_header_v4(|u| {
            u.uleb(1).u32(0);
        });
        InfoBuilder::new()
            .section(".debug_abbrev", abbrev_with_stmt_list())
            .section(".debug_info", info_sec.into_vec())
            .section(".debug_line", line_section())
            .build()
    }

    #[test]
    fn row_lookup_within_sequence() {
        let info = build();
        let unit = &info.units()[0];
        let hit = source_for(&info, unit, 0x1004).unwrap();
        assert_eq!(hit.file, "src/a.c");
        assert_eq!(hit.line, 2);
        let hit = source_for(&info, unit, 0x1008).unwrap();
        assert_eq!(hit.line, 3);
        let hit = source_for(&info, unit, 0x100f).unwrap();
        assert_eq!(hit.line, 3);
    }

    #[test]
    fn outside_the_sequence_is_none() {
        let info = build();
        let unit = &info.units()[0];
        assert!(source_for(&info, unit, 0xfff).is_none());
        assert!(source_for(&info, unit, 0x1010).is_none());
    }
}
