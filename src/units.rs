//! Compilation units and their lazily decoded DIE trees.
//!
//! A unit is parsed header-first; its DIEs are decoded one at a time, on
//! demand, and cached by `.debug_info` offset. Each raw DIE remembers three
//! tree links — parent, first child, next sibling — as plain offsets where
//! `0` means "not yet determined"; they are back-filled as iteration walks
//! past them, never recomputed.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use gimli::constants::*;
use gimli::Reader as _;
use indexmap::IndexMap;

use crate::{reader_at, reader_offset, Error, Info, Reader};

/// One attribute slot of an abbreviation: which attribute, how it is
/// encoded, and the payload for `DW_FORM_implicit_const`.
#[derive(Clone, Debug)]
pub struct FormEntry {
    pub attr: DwAt,
    pub form: DwForm,
    pub implicit: i64,
}

/// A decoded abbreviation: the shape shared by every DIE carrying its code.
#[derive(Debug)]
pub struct Abbrev {
    pub tag: DwTag,
    pub has_children: bool,
    pub forms: Vec<FormEntry>,
    /// Attribute name -> index into `forms`, preserving declaration order.
    pub attr_index: IndexMap<DwAt, usize>,
    /// Index of `DW_AT_sibling` in `forms`, when present.
    pub sibling_idx: Option<usize>,
}

/// Parses the abbreviation table at `offset` in `.debug_abbrev`.
fn parse_abbrevs(section: &Reader, offset: u64) -> Result<HashMap<u64, Rc<Abbrev>>, Error> {
    let mut r = reader_at(section, offset)?;
    let mut table = HashMap::new();
    loop {
        let code = r.read_uleb128()?;
        if code == 0 {
            break;
        }
        let tag = DwTag(r.read_uleb128()? as u16);
        let has_children = r.read_u8()? != 0;
        let mut forms = Vec::new();
        let mut attr_index = IndexMap::new();
        let mut sibling_idx = None;
        loop {
            let attr = DwAt(r.read_uleb128()? as u16);
            let form = DwForm(r.read_uleb128()? as u16);
            if attr.0 == 0 && form.0 == 0 {
                break;
            }
            let implicit = if form == DW_FORM_implicit_const {
                r.read_sleb128()?
            } else {
                0
            };
            if attr == DW_AT_sibling {
                sibling_idx = Some(forms.len());
            }
            attr_index.insert(attr, forms.len());
            forms.push(FormEntry { attr, form, implicit });
        }
        table.insert(
            code,
            Rc::new(Abbrev {
                tag,
                has_children,
                forms,
                attr_index,
                sibling_idx,
            }),
        );
    }
    Ok(table)
}

/// Which string section a string reference points into.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StrRef {
    /// Inline in `.debug_info` at this offset.
    Inline(u64),
    /// `.debug_str`.
    Str(u64),
    /// `.debug_line_str`.
    LineStr(u64),
    /// Index through `.debug_str_offsets`.
    Idx(u64),
    /// `.debug_str` of the alt-DWARF companion.
    Alt(u64),
}

/// How a DIE reference is scoped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RefKind {
    /// `.debug_info`-absolute, already rebased from a unit-relative form.
    Unit,
    /// `.debug_info`-absolute from `DW_FORM_ref_addr`.
    Section,
    /// Offset in the alt-DWARF companion file.
    Alt,
}

/// A decoded attribute value.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AttrValue {
    Addr(u64),
    /// Index into `.debug_addr`, not yet resolved.
    AddrIdx(u64),
    Udata(u64),
    Sdata(i64),
    Flag(bool),
    Str(StrRef),
    Ref(RefKind, u64),
    SecOffset(u64),
    Signature(u64),
    /// Byte range inside `.debug_info`; re-read on demand.
    Block { offset: u64, length: u64 },
}

impl AttrValue {
    pub fn udata(self) -> Option<u64> {
        match self {
            AttrValue::Udata(v) | AttrValue::SecOffset(v) | AttrValue::Addr(v) => Some(v),
            AttrValue::Sdata(v) => Some(v as u64),
            _ => None,
        }
    }

    pub fn sdata(self) -> Option<i64> {
        match self {
            AttrValue::Sdata(v) => Some(v),
            AttrValue::Udata(v) | AttrValue::SecOffset(v) => Some(v as i64),
            _ => None,
        }
    }

    pub fn flag(self) -> Option<bool> {
        match self {
            AttrValue::Flag(b) => Some(b),
            _ => None,
        }
    }

    pub fn block(self) -> Option<(u64, u64)> {
        match self {
            AttrValue::Block { offset, length } => Some((offset, length)),
            _ => None,
        }
    }
}

/// Per-unit bases for the indexed DWARF5 forms, read off the root DIE.
#[derive(Copy, Clone, Debug, Default)]
pub struct UnitBases {
    pub addr_base: u64,
    pub str_offsets_base: u64,
    pub rnglists_base: u64,
}

/// A compilation unit: header fields plus the DIE and range-list caches.
pub struct Unit {
    info: Weak<Info>,
    /// `.debug_info` offset of the unit header.
    pub offset: u64,
    /// One past the unit's last byte.
    pub end: u64,
    pub version: u16,
    pub addr_size: u8,
    pub format: gimli::Format,
    /// Offset of the root DIE.
    pub root_offset: u64,
    abbrevs: HashMap<u64, Rc<Abbrev>>,
    dies: RefCell<HashMap<u64, Rc<RawDie>>>,
    ranges: RefCell<HashMap<u64, Rc<Vec<crate::ranges::RawRange>>>>,
    bases: Cell<Option<UnitBases>>,
}

impl Unit {
    /// Parses one unit header. `r` is positioned at the header; `offset` is
    /// its `.debug_info` offset.
    pub fn parse_header(info: &Rc<Info>, r: &mut Reader, offset: u64) -> Result<Unit, Error> {
        let (length, format) = r.read_initial_length()?;
        let initial = match format {
            gimli::Format::Dwarf32 => 4u64,
            gimli::Format::Dwarf64 => 12,
        };
        let end = offset + initial + length as u64;
        let version = r.read_u16()?;
        if !(2..=5).contains(&version) {
            return Err(Error::MalformedDwarf("unsupported unit version"));
        }
        let (abbrev_offset, addr_size) = if version >= 5 {
            let unit_type = DwUt(r.read_u8()?);
            let addr_size = r.read_u8()?;
            let abbrev_offset = r.read_offset(format)? as u64;
            match unit_type {
                DW_UT_compile | DW_UT_partial => {}
                DW_UT_skeleton | DW_UT_split_compile => {
                    r.read_u64()?;
                }
                DW_UT_type | DW_UT_split_type => {
                    r.read_u64()?;
                    r.read_offset(format)?;
                }
                _ => return Err(Error::MalformedDwarf("unknown unit type")),
            }
            (abbrev_offset, addr_size)
        } else {
            let abbrev_offset = r.read_offset(format)? as u64;
            let addr_size = r.read_u8()?;
            (abbrev_offset, addr_size)
        };
        let root_offset = reader_offset(r, &info.debug_info);
        let abbrevs = parse_abbrevs(&info.debug_abbrev, abbrev_offset)?;
        Ok(Unit {
            info: Rc::downgrade(info),
            offset,
            end,
            version,
            addr_size,
            format,
            root_offset,
            abbrevs,
            dies: Default::default(),
            ranges: Default::default(),
            bases: Cell::new(None),
        })
    }

    pub fn info(&self) -> Option<Rc<Info>> {
        self.info.upgrade()
    }

    /// The unit's root DIE.
    pub fn root(self: &Rc<Self>) -> Option<Die> {
        self.die_at(None, self.root_offset)
    }

    /// Name of the unit, from the root DIE.
    pub fn name(self: &Rc<Self>) -> Option<String> {
        self.root()?.attr_string(DW_AT_name)
    }

    /// Indexed-form bases from the root DIE, computed once.
    pub fn bases(self: &Rc<Self>) -> UnitBases {
        if let Some(b) = self.bases.get() {
            return b;
        }
        let mut b = UnitBases::default();
        if self.version >= 5 {
            // DWARF5 defaults point just past each table's header.
            let header = match self.format {
                gimli::Format::Dwarf32 => 8,
                gimli::Format::Dwarf64 => 16,
            };
            b.addr_base = header;
            b.str_offsets_base = header;
            b.rnglists_base = 0;
        }
        if let Some(root) = self.root() {
            if let Some(v) = root.attr_local(DW_AT_addr_base).and_then(AttrValue::udata) {
                b.addr_base = v;
            }
            if let Some(v) = root
                .attr_local(DW_AT_str_offsets_base)
                .and_then(AttrValue::udata)
            {
                b.str_offsets_base = v;
            }
            if let Some(v) = root
                .attr_local(DW_AT_rnglists_base)
                .and_then(AttrValue::udata)
            {
                b.rnglists_base = v;
            }
        }
        self.bases.set(Some(b));
        b
    }

    /// Resolves an index into `.debug_addr`.
    pub fn addr_from_index(self: &Rc<Self>, index: u64) -> Result<u64, Error> {
        let info = self
            .info()
            .ok_or(Error::MalformedDwarf("unit outlived its info"))?;
        if info.debug_addr.is_empty() {
            return Err(Error::UnresolvedAddressIndex);
        }
        let offset = self.bases().addr_base + index * self.addr_size as u64;
        let mut r = reader_at(&info.debug_addr, offset)?;
        Ok(r.read_address(self.addr_size)?)
    }

    /// Resolves a string reference against the right section.
    pub fn string(self: &Rc<Self>, s: StrRef) -> Option<String> {
        let info = self.info()?;
        match s {
            StrRef::Inline(off) => info.info_str_at(off),
            StrRef::Str(off) => info.str_at(off),
            StrRef::LineStr(off) => info.line_str_at(off),
            StrRef::Alt(off) => info.alt()?.str_at(off),
            StrRef::Idx(index) => {
                let size = match self.format {
                    gimli::Format::Dwarf32 => 4,
                    gimli::Format::Dwarf64 => 8,
                };
                let offset = self.bases().str_offsets_base + index * size;
                let mut r = reader_at(&info.debug_str_offsets, offset).ok()?;
                let off = r.read_offset(self.format).ok()? as u64;
                info.str_at(off)
            }
        }
    }

    /// Range list at `offset` (pre-base), decoded once per unit.
    pub fn ranges_at(
        self: &Rc<Self>,
        offset: u64,
    ) -> Result<Rc<Vec<crate::ranges::RawRange>>, Error> {
        if let Some(hit) = self.ranges.borrow().get(&offset) {
            return Ok(hit.clone());
        }
        let list = Rc::new(crate::ranges::decode(self, offset)?);
        self.ranges.borrow_mut().insert(offset, list.clone());
        Ok(list)
    }

    /// Returns the DIE at a `.debug_info`-absolute offset, decoding it on
    /// first access. `offset` 0 is the null DIE. When `parent` is supplied
    /// it is recorded on the child if not already known; hitting an
    /// end-of-siblings marker instead back-fills the parent's next-sibling
    /// link and yields `None`.
    pub fn die_at(self: &Rc<Self>, parent: Option<&Die>, offset: u64) -> Option<Die> {
        if offset == 0 {
            return None;
        }
        if let Some(raw) = self.dies.borrow().get(&offset) {
            if let Some(p) = parent {
                if raw.parent.get() == 0 {
                    raw.parent.set(p.offset);
                }
            }
            return Some(Die {
                unit: self.clone(),
                offset,
                raw: raw.clone(),
            });
        }
        match self.decode(parent.map(|p| p.offset).unwrap_or(0), offset) {
            Ok(Decoded::End(end)) => {
                if let Some(p) = parent {
                    p.raw.next_sibling.set(end);
                }
                None
            }
            Ok(Decoded::Entry(raw)) => {
                self.dies.borrow_mut().insert(offset, raw.clone());
                Some(Die {
                    unit: self.clone(),
                    offset,
                    raw,
                })
            }
            Err(e) => {
                log::warn!("bad DIE at {:#x}: {}", offset, e);
                None
            }
        }
    }

    /// Decodes the raw DIE at `offset` per the abbreviation it names.
    fn decode(self: &Rc<Self>, parent_offset: u64, offset: u64) -> Result<Decoded, Error> {
        let info = self
            .info()
            .ok_or(Error::MalformedDwarf("unit outlived its info"))?;
        let mut r = reader_at(&info.debug_info, offset)?;
        let code = r.read_uleb128()?;
        if code == 0 {
            return Ok(Decoded::End(reader_offset(&r, &info.debug_info)));
        }
        let abbrev = self
            .abbrevs
            .get(&code)
            .ok_or(Error::MalformedDwarf("unknown abbreviation code"))?
            .clone();
        let mut values = Vec::with_capacity(abbrev.forms.len());
        for ent in &abbrev.forms {
            values.push(decode_value(&mut r, self, &info, ent)?);
        }
        let raw = RawDie {
            abbrev,
            values,
            parent: Cell::new(parent_offset),
            first_child: Cell::new(0),
            next_sibling: Cell::new(0),
        };
        // DW_AT_sibling lets sibling traversal skip the children entirely.
        if let Some(i) = raw.abbrev.sibling_idx {
            if let AttrValue::Ref(_, off) = raw.values[i] {
                raw.next_sibling.set(off);
            }
        }
        let here = reader_offset(&r, &info.debug_info);
        if raw.abbrev.has_children {
            raw.first_child.set(here);
        } else {
            // No children: the next DIE in the stream is our sibling.
            raw.next_sibling.set(here);
        }
        Ok(Decoded::Entry(Rc::new(raw)))
    }
}

enum Decoded {
    /// An end-of-siblings marker; the payload is the offset just past it.
    End(u64),
    Entry(Rc<RawDie>),
}

/// Consumes one attribute value from `r` according to its form.
fn decode_value(
    r: &mut Reader,
    unit: &Unit,
    info: &Info,
    entry: &FormEntry,
) -> Result<AttrValue, Error> {
    let mut form = entry.form;
    // DW_FORM_indirect names the real form in the data stream.
    while form == DW_FORM_indirect {
        form = DwForm(r.read_uleb128()? as u16);
    }
    let offset_size = unit.format;
    Ok(match form {
        DW_FORM_addr => AttrValue::Addr(r.read_address(unit.addr_size)?),
        DW_FORM_data1 => AttrValue::Udata(r.read_u8()? as u64),
        DW_FORM_data2 => AttrValue::Udata(r.read_u16()? as u64),
        DW_FORM_data4 => AttrValue::Udata(r.read_u32()? as u64),
        DW_FORM_data8 => AttrValue::Udata(r.read_u64()?),
        DW_FORM_sdata => AttrValue::Sdata(r.read_sleb128()?),
        DW_FORM_udata => AttrValue::Udata(r.read_uleb128()?),
        DW_FORM_implicit_const => AttrValue::Sdata(entry.implicit),

        DW_FORM_flag => AttrValue::Flag(r.read_u8()? != 0),
        DW_FORM_flag_present => AttrValue::Flag(true),

        DW_FORM_strp => {
            // DWARF v2 predates 64-bit DWARF; strp is always 4 bytes there.
            let off = if unit.version <= 2 {
                r.read_u32()? as u64
            } else {
                r.read_offset(offset_size)? as u64
            };
            AttrValue::Str(StrRef::Str(off))
        }
        DW_FORM_line_strp => AttrValue::Str(StrRef::LineStr(r.read_offset(offset_size)? as u64)),
        DW_FORM_GNU_strp_alt => AttrValue::Str(StrRef::Alt(r.read_offset(offset_size)? as u64)),
        DW_FORM_string => {
            let at = reader_offset(r, &info.debug_info);
            r.read_null_terminated_slice()?;
            AttrValue::Str(StrRef::Inline(at))
        }
        DW_FORM_strx => AttrValue::Str(StrRef::Idx(r.read_uleb128()?)),
        DW_FORM_strx1 => AttrValue::Str(StrRef::Idx(r.read_u8()? as u64)),
        DW_FORM_strx2 => AttrValue::Str(StrRef::Idx(r.read_u16()? as u64)),
        DW_FORM_strx3 => AttrValue::Str(StrRef::Idx(r.read_uint(3)?)),
        DW_FORM_strx4 => AttrValue::Str(StrRef::Idx(r.read_u32()? as u64)),

        DW_FORM_addrx => AttrValue::AddrIdx(r.read_uleb128()?),
        DW_FORM_addrx1 => AttrValue::AddrIdx(r.read_u8()? as u64),
        DW_FORM_addrx2 => AttrValue::AddrIdx(r.read_u16()? as u64),
        DW_FORM_addrx3 => AttrValue::AddrIdx(r.read_uint(3)?),
        DW_FORM_addrx4 => AttrValue::AddrIdx(r.read_u32()? as u64),

        DW_FORM_ref1 => AttrValue::Ref(RefKind::Unit, unit.offset + r.read_u8()? as u64),
        DW_FORM_ref2 => AttrValue::Ref(RefKind::Unit, unit.offset + r.read_u16()? as u64),
        DW_FORM_ref4 => AttrValue::Ref(RefKind::Unit, unit.offset + r.read_u32()? as u64),
        DW_FORM_ref8 => AttrValue::Ref(RefKind::Unit, unit.offset + r.read_u64()?),
        DW_FORM_ref_udata => AttrValue::Ref(RefKind::Unit, unit.offset + r.read_uleb128()?),
        DW_FORM_ref_addr => AttrValue::Ref(RefKind::Section, r.read_offset(offset_size)? as u64),
        DW_FORM_GNU_ref_alt => AttrValue::Ref(RefKind::Alt, r.read_offset(offset_size)? as u64),
        DW_FORM_ref_sig8 => AttrValue::Signature(r.read_u64()?),

        DW_FORM_sec_offset => AttrValue::SecOffset(r.read_offset(offset_size)? as u64),
        DW_FORM_loclistx | DW_FORM_rnglistx => AttrValue::Udata(r.read_uleb128()?),

        DW_FORM_block1 => {
            let n = r.read_u8()? as u64;
            block(r, info, n)?
        }
        DW_FORM_block2 => {
            let n = r.read_u16()? as u64;
            block(r, info, n)?
        }
        DW_FORM_block4 => {
            let n = r.read_u32()? as u64;
            block(r, info, n)?
        }
        DW_FORM_block | DW_FORM_exprloc => {
            let n = r.read_uleb128()?;
            block(r, info, n)?
        }
        DW_FORM_data16 => block(r, info, 16)?,

        other => return Err(Error::UnsupportedForm(other)),
    })
}

fn block(r: &mut Reader, info: &Info, length: u64) -> Result<AttrValue, Error> {
    let offset = reader_offset(r, &info.debug_info);
    r.skip(length as usize)?;
    Ok(AttrValue::Block { offset, length })
}

/// The decoded body of a DIE. Shared by every handle to the same offset;
/// only the three tree links are ever written after construction.
pub struct RawDie {
    abbrev: Rc<Abbrev>,
    values: Vec<AttrValue>,
    parent: Cell<u64>,
    first_child: Cell<u64>,
    next_sibling: Cell<u64>,
}

/// Address containment answer; `Unknown` means "recurse into children".
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Contains {
    Yes,
    No,
    Unknown,
}

/// A cheap handle to one Debugging Information Entry.
#[derive(Clone)]
pub struct Die {
    pub unit: Rc<Unit>,
    /// `.debug_info` offset; the DIE's identity.
    pub offset: u64,
    raw: Rc<RawDie>,
}

impl Die {
    pub fn tag(&self) -> DwTag {
        self.raw.abbrev.tag
    }

    pub fn has_children(&self) -> bool {
        self.raw.abbrev.has_children
    }

    /// Attribute lookup without indirection.
    pub fn attr_local(&self, name: DwAt) -> Option<AttrValue> {
        let &i = self.raw.abbrev.attr_index.get(&name)?;
        Some(self.raw.values[i])
    }

    /// Attribute lookup, retrying on the DIE's `DW_AT_abstract_origin` and
    /// `DW_AT_specification` targets when absent locally. Those attributes
    /// themselves, and `DW_AT_declaration`, never indirect.
    pub fn attr(&self, name: DwAt) -> Option<AttrValue> {
        if let Some(v) = self.attr_local(name) {
            return Some(v);
        }
        if name == DW_AT_declaration
            || name == DW_AT_abstract_origin
            || name == DW_AT_specification
        {
            return None;
        }
        for via in [DW_AT_abstract_origin, DW_AT_specification] {
            if let Some(target) = self.attr_die(via) {
                if target.offset != self.offset {
                    if let Some(v) = target.attr(name) {
                        return Some(v);
                    }
                }
            }
        }
        None
    }

    /// Resolves a reference-valued attribute to its target DIE. The
    /// referring unit is searched first; section-absolute offsets fall
    /// through to the whole-file unit index, alt references to the
    /// companion file.
    pub fn attr_die(&self, name: DwAt) -> Option<Die> {
        match self.attr(name)? {
            AttrValue::Ref(RefKind::Unit, off) | AttrValue::Ref(RefKind::Section, off) => {
                if off >= self.unit.offset && off < self.unit.end {
                    self.unit.die_at(None, off)
                } else {
                    let info = self.unit.info()?;
                    let die = info.die_at(off);
                    if die.is_none() {
                        log::debug!("{}", Error::UnresolvedReference(off));
                    }
                    die
                }
            }
            AttrValue::Ref(RefKind::Alt, off) => {
                let info = self.unit.info()?;
                match info.alt() {
                    Some(alt) => alt.die_at(off),
                    None => {
                        log::debug!("alt DIE reference {:#x} with no alt file loaded", off);
                        None
                    }
                }
            }
            _ => None,
        }
    }

    pub fn attr_string(&self, name: DwAt) -> Option<String> {
        match self.attr(name)? {
            AttrValue::Str(s) => self.unit.string(s),
            _ => None,
        }
    }

    /// Address-valued attribute, resolving `addrx` indices as needed.
    pub fn attr_address(&self, name: DwAt) -> Option<u64> {
        match self.attr(name)? {
            AttrValue::Addr(a) => Some(a),
            AttrValue::AddrIdx(i) => match self.unit.addr_from_index(i) {
                Ok(a) => Some(a),
                Err(e) => {
                    log::debug!("cannot resolve address index {}: {}", i, e);
                    None
                }
            },
            _ => None,
        }
    }

    pub fn name(&self) -> Option<String> {
        self.attr_string(DW_AT_name)
    }

    /// Whether this DIE's code ranges contain `addr`.
    pub fn contains_address(&self, addr: u64) -> Contains {
        let low = self.attr_local(DW_AT_low_pc);
        let high = self.attr_local(DW_AT_high_pc);
        let low_addr = low.and_then(|_| self.attr_address(DW_AT_low_pc));

        if let (Some(start), Some(high)) = (low_addr, high) {
            let end = match high {
                AttrValue::Addr(a) => a,
                // Any constant class is an offset from low_pc.
                other => match other.udata() {
                    Some(delta) => start + delta,
                    None => return Contains::Unknown,
                },
            };
            return if start <= addr && addr < end {
                Contains::Yes
            } else {
                Contains::No
            };
        }

        if let Some(off) = self.attr_local(DW_AT_ranges).and_then(AttrValue::udata) {
            let base = low_addr.unwrap_or(0);
            match self.unit.ranges_at(off) {
                Ok(list) => {
                    for range in list.iter() {
                        if range.contains(addr, base) {
                            return Contains::Yes;
                        }
                    }
                    return Contains::No;
                }
                Err(e) => {
                    log::debug!("range list at {:#x} undecodable: {}", off, e);
                    return Contains::Unknown;
                }
            }
        }
        Contains::Unknown
    }

    /// Depth-first search for the entry with `tag` covering `addr`.
    pub fn find_entry_for_addr(&self, addr: u64, tag: DwTag) -> Option<Die> {
        match self.contains_address(addr) {
            Contains::No => None,
            answer => {
                if answer == Contains::Yes && self.tag() == tag {
                    return Some(self.clone());
                }
                for child in self.children() {
                    if let Some(hit) = child.find_entry_for_addr(addr, tag) {
                        return Some(hit);
                    }
                }
                None
            }
        }
    }

    pub fn first_child(&self) -> Option<Die> {
        self.unit.die_at(Some(self), self.raw.first_child.get())
    }

    /// The next sibling. When the link is unknown (the DIE has children
    /// and no `DW_AT_sibling`), walking our own children finds the end
    /// marker, which back-fills it.
    pub fn next_sibling(&self, parent: Option<&Die>) -> Option<Die> {
        if self.raw.next_sibling.get() == 0 {
            let mut child = self.first_child();
            while let Some(c) = child {
                child = c.next_sibling(Some(self));
            }
        }
        self.unit.die_at(parent, self.raw.next_sibling.get())
    }

    pub fn children(&self) -> Children {
        Children {
            parent: self.clone(),
            next: self.first_child(),
        }
    }

    /// The parent DIE. A DIE first reached through a cross-reference does
    /// not know its parent; the fallback walks the whole unit tree, which
    /// back-fills parent links as a side effect.
    pub fn parent(&self) -> Option<Die> {
        if self.raw.parent.get() == 0 {
            if self.offset == self.unit.root_offset {
                return None;
            }
            log::warn!(
                "no parent offset for DIE at {:#x} in unit at {:#x}; walking the DIE tree",
                self.offset,
                self.unit.offset
            );
            fn walk(d: &Die) {
                for c in d.children() {
                    walk(&c);
                }
            }
            if let Some(root) = self.unit.root() {
                walk(&root);
            }
        }
        self.unit.die_at(None, self.raw.parent.get())
    }

    /// Renders the C-style name of a type DIE. Depth-bounded against
    /// pathological type graphs.
    pub fn type_name(&self) -> String {
        self.type_name_depth(32)
    }

    fn type_name_depth(&self, depth: u32) -> String {
        if depth == 0 {
            return "...".to_string();
        }
        if let Some(name) = self.name() {
            return name;
        }
        let base = |of: &Die| match of.attr_die(DW_AT_type) {
            Some(b) => b.type_name_depth(depth - 1),
            None => "void".to_string(),
        };
        match self.tag() {
            DW_TAG_pointer_type => format!("{} *", base(self)),
            DW_TAG_const_type => format!("{} const", base(self)),
            DW_TAG_volatile_type => format!("{} volatile", base(self)),
            DW_TAG_reference_type => format!("{}&", base(self)),
            DW_TAG_subroutine_type => {
                let mut s = format!("{}(", base(self));
                let mut sep = "";
                for arg in self.children() {
                    if arg.tag() != DW_TAG_formal_parameter {
                        continue;
                    }
                    s.push_str(sep);
                    match arg.attr_die(DW_AT_type) {
                        Some(t) => s.push_str(&t.type_name_depth(depth - 1)),
                        None => s.push_str("void"),
                    }
                    sep = ", ";
                }
                s.push(')');
                s
            }
            tag => format!("(unhandled tag {})", tag),
        }
    }

    #[cfg(test)]
    pub(crate) fn next_sibling_offset(&self) -> u64 {
        self.raw.next_sibling.get()
    }

    #[cfg(test)]
    pub(crate) fn parent_offset_raw(&self) -> u64 {
        self.raw.parent.get()
    }
}

/// Iterates the direct children of a DIE, in stream order.
pub struct Children {
    parent: Die,
    next: Option<Die>,
}

impl Iterator for Children {
    type Item = Die;

    fn next(&mut self) -> Option<Die> {
        let cur = self.next.take()?;
        self.next = cur.next_sibling(Some(&self.parent));
        Some(cur)
    }
}
