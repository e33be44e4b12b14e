//! Non-contiguous address range lists.
//!
//! DWARF4 keeps these in `.debug_ranges` as bare address pairs; DWARF5
//! moved to opcode-prefixed entries in `.debug_rnglists`, optionally
//! indirecting start/end addresses through `.debug_addr`.

use std::rc::Rc;

use gimli::constants::*;
use gimli::Reader as _;

use crate::units::Unit;
use crate::{reader_at, Error};

/// One interval of a range list. Entries written relative to the
/// compile-unit base stay that way until queried; entries made absolute by
/// a base-address selector (or an absolute entry kind) carry no base.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RawRange {
    pub start: u64,
    pub end: u64,
    pub absolute: bool,
}

impl RawRange {
    fn relative(start: u64, end: u64) -> Self {
        RawRange {
            start,
            end,
            absolute: false,
        }
    }

    fn absolute(start: u64, end: u64) -> Self {
        RawRange {
            start,
            end,
            absolute: true,
        }
    }

    /// Membership test, inclusive at both ends, applying `base` only to
    /// unit-relative entries.
    pub fn contains(&self, addr: u64, base: u64) -> bool {
        let base = if self.absolute { 0 } else { base };
        self.start + base <= addr && addr <= self.end + base
    }
}

/// Decodes the range list for `unit` at `offset` (the raw attribute value;
/// DWARF5 adds the unit's `DW_AT_rnglists_base` on top).
pub fn decode(unit: &Rc<Unit>, offset: u64) -> Result<Vec<RawRange>, Error> {
    let info = unit
        .info()
        .ok_or(Error::MalformedDwarf("unit outlived its info"))?;
    if unit.version < 5 {
        decode_debug_ranges(unit, &info.debug_ranges, offset)
    } else {
        let offset = unit.bases().rnglists_base + offset;
        decode_rnglists(unit, &info.debug_rnglists, offset)
    }
}

fn decode_debug_ranges(
    unit: &Rc<Unit>,
    section: &crate::Reader,
    offset: u64,
) -> Result<Vec<RawRange>, Error> {
    let mut r = reader_at(section, offset)?;
    let all_ones = match unit.addr_size {
        4 => 0xffff_ffff,
        _ => u64::MAX,
    };
    let mut out = Vec::new();
    let mut base = None;
    loop {
        let start = r.read_address(unit.addr_size)?;
        let end = r.read_address(unit.addr_size)?;
        if start == 0 && end == 0 {
            break;
        }
        if start == all_ones {
            // Base-address selector: the second word replaces the base for
            // the entries that follow.
            base = Some(end);
            continue;
        }
        out.push(match base {
            Some(b) => RawRange::absolute(b + start, b + end),
            None => RawRange::relative(start, end),
        });
    }
    Ok(out)
}

fn decode_rnglists(
    unit: &Rc<Unit>,
    section: &crate::Reader,
    offset: u64,
) -> Result<Vec<RawRange>, Error> {
    let mut r = reader_at(section, offset)?;
    let mut out = Vec::new();
    let mut base = None;
    loop {
        let kind = DwRle(r.read_u8()?);
        match kind {
            DW_RLE_end_of_list => break,
            DW_RLE_base_address => {
                base = Some(r.read_address(unit.addr_size)?);
            }
            DW_RLE_base_addressx => {
                let index = r.read_uleb128()?;
                base = Some(unit.addr_from_index(index)?);
            }
            DW_RLE_offset_pair => {
                let start = r.read_uleb128()?;
                let end = r.read_uleb128()?;
                out.push(match base {
                    Some(b) => RawRange::absolute(b + start, b + end),
                    None => RawRange::relative(start, end),
                });
            }
            DW_RLE_start_end => {
                let start = r.read_address(unit.addr_size)?;
                let end = r.read_address(unit.addr_size)?;
                out.push(RawRange::absolute(start, end));
            }
            DW_RLE_start_length => {
                let start = r.read_address(unit.addr_size)?;
                let len = r.read_uleb128()?;
                out.push(RawRange::absolute(start, start + len));
            }
            DW_RLE_startx_endx => {
                let start = unit.addr_from_index(r.read_uleb128()?)?;
                let end = unit.addr_from_index(r.read_uleb128()?)?;
                out.push(RawRange::absolute(start, end));
            }
            DW_RLE_startx_length => {
                let start = unit.addr_from_index(r.read_uleb128()?)?;
                let len = r.read_uleb128()?;
                out.push(RawRange::absolute(start, start + len));
            }
            _ => return Err(Error::MalformedDwarf("unknown range-list entry kind")),
        }
    }
    Ok(out)
}
