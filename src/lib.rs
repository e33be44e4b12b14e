//! Extracts symbolic call stacks from ELF core dumps by unwinding frames
//! through DWARF call-frame information, with fallbacks for code the CFI
//! does not cover.
//!
//! The pieces, innermost-out: [`units`] decodes compilation units and their
//! lazy DIE trees; [`cfi`] parses `.eh_frame`/`.debug_frame` and executes
//! unwind programs; [`expr`] evaluates DWARF location expressions against a
//! live frame; [`unwind`] chains the unwind mechanisms into per-thread
//! stacks; [`proc`] binds a target (a core file, or anything implementing
//! [`proc::Host`]) to its loaded objects.

pub mod cfi;
pub mod core_file;
pub mod expr;
pub mod image;
pub mod line;
pub mod proc;
pub mod ranges;
pub mod regs;
pub mod units;
pub mod unwind;

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use gimli::Reader as _;
use thiserror::Error;

use crate::image::Image;
use crate::units::{Die, Unit};

/// The byte cursor used for every DWARF section.
pub type Reader = gimli::EndianReader<gimli::RunTimeEndian, Arc<[u8]>>;

/// Positions a fresh cursor `offset` bytes into `section`.
pub(crate) fn reader_at(section: &Reader, offset: u64) -> Result<Reader, Error> {
    let mut r = section.clone();
    r.skip(offset as usize)?;
    Ok(r)
}

/// Current position of `r` relative to the start of `section`.
pub(crate) fn reader_offset(r: &Reader, section: &Reader) -> u64 {
    r.offset_from(section) as u64
}

#[derive(Debug, Error)]
pub enum Error {
    /// Structurally broken DWARF; fatal for the unit or record involved,
    /// never for its siblings.
    #[error("malformed DWARF: {0}")]
    MalformedDwarf(&'static str),
    #[error("truncated DWARF data: {0}")]
    Truncated(#[from] gimli::Error),
    #[error("unsupported form {0}")]
    UnsupportedForm(gimli::DwForm),
    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(gimli::DwOp),
    #[error("reference to {0:#x} lies outside every known unit")]
    UnresolvedReference(u64),
    #[error("indexed address form used but .debug_addr is unavailable")]
    UnresolvedAddressIndex,
    #[error("no FDE covers address {0:#x}")]
    CfiMiss(u64),
    #[error("cannot read target memory at {0:#x}")]
    MemoryRead(u64),
    #[error("invalid frame: {0}")]
    InvalidFrame(&'static str),
    #[error("unsupported architecture {0}")]
    UnsupportedArch(String),
    #[error("not a usable core file: {0}")]
    BadCore(&'static str),
    #[error("unknown thread {0}")]
    UnknownThread(u32),
    #[error(transparent)]
    BadObject(#[from] object::read::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Knobs shared by the library and the CLI.
#[derive(Clone, Debug)]
pub struct Options {
    /// Suppress file/line resolution.
    pub no_source: bool,
    /// Include argument values per frame.
    pub do_args: bool,
    /// Include local-variable values.
    pub do_locals: bool,
    /// Skip user-thread enumeration; report kernel LWPs only.
    pub no_thread_db: bool,
    /// Ordered (from, to) prefix substitutions applied when locating
    /// object and debug files.
    pub path_replacements: Vec<(String, String)>,
    /// Frame cap per thread.
    pub max_depth: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            no_source: false,
            do_args: false,
            do_locals: false,
            no_thread_db: false,
            path_replacements: Vec::new(),
            max_depth: 1024,
        }
    }
}

/// The DWARF view of one loaded object: section readers, the lazily
/// scanned unit list, CFI tables, and the alt-DWARF companion when the
/// object carries a `.gnu_debugaltlink`.
pub struct Info {
    image: Rc<Image>,
    pub(crate) debug_info: Reader,
    pub(crate) debug_abbrev: Reader,
    pub(crate) debug_str: Reader,
    pub(crate) debug_line_str: Reader,
    pub(crate) debug_str_offsets: Reader,
    pub(crate) debug_addr: Reader,
    pub(crate) debug_ranges: Reader,
    pub(crate) debug_rnglists: Reader,
    pub(crate) debug_line: Reader,

    /// Units keyed by their `.debug_info` offset. Populated on first use.
    units: RefCell<BTreeMap<u64, Rc<Unit>>>,
    units_scanned: Cell<bool>,

    eh_frame: RefCell<Option<Rc<cfi::CfiTable>>>,
    eh_frame_parsed: Cell<bool>,
    debug_frame: RefCell<Option<Rc<cfi::CfiTable>>>,
    debug_frame_parsed: Cell<bool>,

    alt: RefCell<Option<Rc<Info>>>,
}

impl Info {
    pub fn new(image: Rc<Image>) -> Rc<Info> {
        let sec = |name: &str, zname: &str| {
            let (_, data) = image
                .section(name)
                .or_else(|| image.section(zname))
                .unwrap_or((0, Arc::from(&[][..])));
            gimli::EndianReader::new(data, image.endian())
        };
        Rc::new(Info {
            debug_info: sec(".debug_info", ".zdebug_info"),
            debug_abbrev: sec(".debug_abbrev", ".zdebug_abbrev"),
            debug_str: sec(".debug_str", ".zdebug_str"),
            debug_line_str: sec(".debug_line_str", ".zdebug_line_str"),
            debug_str_offsets: sec(".debug_str_offsets", ".zdebug_str_offsets"),
            debug_addr: sec(".debug_addr", ".zdebug_addr"),
            debug_ranges: sec(".debug_ranges", ".zdebug_ranges"),
            debug_rnglists: sec(".debug_rnglists", ".zdebug_rnglists"),
            debug_line: sec(".debug_line", ".zdebug_line"),
            image,
            units: Default::default(),
            units_scanned: Cell::new(false),
            eh_frame: Default::default(),
            eh_frame_parsed: Cell::new(false),
            debug_frame: Default::default(),
            debug_frame_parsed: Cell::new(false),
            alt: Default::default(),
        })
    }

    pub fn image(&self) -> &Rc<Image> {
        &self.image
    }

    /// The alt-DWARF companion, once the image cache has linked it.
    pub fn alt(&self) -> Option<Rc<Info>> {
        self.alt.borrow().clone()
    }

    pub(crate) fn set_alt(&self, alt: Rc<Info>) {
        *self.alt.borrow_mut() = Some(alt);
    }

    /// All compilation units, scanning the section headers on first call.
    /// A malformed unit header stops the scan but keeps the units already
    /// found.
    pub fn units(self: &Rc<Self>) -> Vec<Rc<Unit>> {
        if !self.units_scanned.get() {
            self.units_scanned.set(true);
            let mut r = self.debug_info.clone();
            while !r.is_empty() {
                let offset = reader_offset(&r, &self.debug_info);
                match Unit::parse_header(self, &mut r, offset) {
                    Ok(unit) => {
                        let unit = Rc::new(unit);
                        self.units.borrow_mut().insert(offset, unit.clone());
                        match reader_at(&self.debug_info, unit.end) {
                            Ok(next) => r = next,
                            Err(_) => break,
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "stopping unit scan of {}: {}",
                            self.image.path().display(),
                            e
                        );
                        break;
                    }
                }
            }
        }
        self.units.borrow().values().cloned().collect()
    }

    /// The unit whose `.debug_info` extent contains `offset`.
    pub fn unit_for_offset(self: &Rc<Self>, offset: u64) -> Option<Rc<Unit>> {
        self.units();
        let units = self.units.borrow();
        let (_, unit) = units.range(..=offset).next_back()?;
        if unit.end > offset {
            Some(unit.clone())
        } else {
            None
        }
    }

    /// Resolves a section-absolute DIE offset, whichever unit owns it.
    pub fn die_at(self: &Rc<Self>, offset: u64) -> Option<Die> {
        let unit = self.unit_for_offset(offset)?;
        unit.die_at(None, offset)
    }

    /// The innermost `DW_TAG_subprogram` whose address ranges contain
    /// `addr` (an object-relative address).
    pub fn subprogram_for(self: &Rc<Self>, addr: u64) -> Option<Die> {
        for unit in self.units() {
            let Some(root) = unit.root() else { continue };
            match root.contains_address(addr) {
                units::Contains::No => continue,
                units::Contains::Yes | units::Contains::Unknown => {
                    if let Some(die) =
                        root.find_entry_for_addr(addr, gimli::constants::DW_TAG_subprogram)
                    {
                        return Some(die);
                    }
                }
            }
        }
        None
    }

    /// The parsed `.eh_frame` table, if the object has one.
    pub fn eh_frame(&self) -> Option<Rc<cfi::CfiTable>> {
        if !self.eh_frame_parsed.get() {
            self.eh_frame_parsed.set(true);
            *self.eh_frame.borrow_mut() = self.parse_cfi(cfi::CfiKind::EhFrame);
        }
        self.eh_frame.borrow().clone()
    }

    /// The parsed `.debug_frame` table, if the object has one.
    pub fn debug_frame(&self) -> Option<Rc<cfi::CfiTable>> {
        if !self.debug_frame_parsed.get() {
            self.debug_frame_parsed.set(true);
            *self.debug_frame.borrow_mut() = self.parse_cfi(cfi::CfiKind::DebugFrame);
        }
        self.debug_frame.borrow().clone()
    }

    fn parse_cfi(&self, kind: cfi::CfiKind) -> Option<Rc<cfi::CfiTable>> {
        let (name, zname) = match kind {
            cfi::CfiKind::EhFrame => (".eh_frame", ".zeh_frame"),
            cfi::CfiKind::DebugFrame => (".debug_frame", ".zdebug_frame"),
        };
        let (addr, data) = self
            .image
            .section(name)
            .or_else(|| self.image.section(zname))?;
        if data.is_empty() {
            return None;
        }
        let reader = gimli::EndianReader::new(data, self.image.endian());
        let addr_size = if self.image.is_64() { 8 } else { 4 };
        match cfi::CfiTable::parse(kind, addr, reader, addr_size) {
            Ok(table) => Some(Rc::new(table)),
            Err(e) => {
                log::warn!("ignoring {} of {}: {}", name, self.image.path().display(), e);
                None
            }
        }
    }

    /// Reads a NUL-terminated string out of `.debug_str`.
    pub(crate) fn str_at(&self, offset: u64) -> Option<String> {
        read_cstr(&self.debug_str, offset)
    }

    pub(crate) fn line_str_at(&self, offset: u64) -> Option<String> {
        read_cstr(&self.debug_line_str, offset)
    }

    /// Inline string stored directly in `.debug_info`.
    pub(crate) fn info_str_at(&self, offset: u64) -> Option<String> {
        read_cstr(&self.debug_info, offset)
    }
}

pub(crate) fn read_cstr(section: &Reader, offset: u64) -> Option<String> {
    let mut r = reader_at(section, offset).ok()?;
    let bytes = r.read_null_terminated_slice().ok()?;
    Some(bytes.to_string_lossy().ok()?.into_owned())
}

/// Deduplicates loaded DWARF infos by object path and wires up alt-DWARF
/// companions. One cache bounds the lifetime of every `Info` resolved
/// through it.
pub struct ImageCache {
    infos: RefCell<HashMap<PathBuf, Rc<Info>>>,
    path_replacements: Vec<(String, String)>,
}

impl ImageCache {
    pub fn new(path_replacements: Vec<(String, String)>) -> Self {
        ImageCache {
            infos: Default::default(),
            path_replacements,
        }
    }

    /// Applies the configured prefix substitutions to a path.
    pub fn replace_path(&self, path: &Path) -> PathBuf {
        let text = path.to_string_lossy();
        for (from, to) in &self.path_replacements {
            if let Some(rest) = text.strip_prefix(from.as_str()) {
                return PathBuf::from(format!("{}{}", to, rest));
            }
        }
        path.to_owned()
    }

    /// Loads (or returns the cached) `Info` for an object file.
    pub fn load(&self, path: &Path) -> Result<Rc<Info>, Error> {
        let path = self.replace_path(path);
        if let Some(hit) = self.infos.borrow().get(&path) {
            return Ok(hit.clone());
        }
        let image = Rc::new(Image::open(&path)?);
        let info = Info::new(image);
        self.infos.borrow_mut().insert(path.clone(), info.clone());

        if let Some(link) = info.image().alt_link().map(Path::to_owned) {
            let target = if link.is_absolute() {
                link
            } else {
                path.parent().unwrap_or(Path::new(".")).join(link)
            };
            match self.load(&target) {
                Ok(alt) => info.set_alt(alt),
                Err(e) => log::warn!(
                    "alt debug file {} for {} unavailable: {}",
                    target.display(),
                    path.display(),
                    e
                ),
            }
        }
        Ok(info)
    }

    /// Registers an `Info` built from bytes already in memory (tests, or
    /// objects recovered from a core).
    pub fn insert(&self, path: PathBuf, info: Rc<Info>) {
        self.infos.borrow_mut().insert(path, info);
    }
}

/// Builders for hand-assembled DWARF sections, shared by the module tests.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// A growable little-endian byte image.
    pub struct Sect {
        buf: Vec<u8>,
    }

    impl Sect {
        pub fn new() -> Self {
            Sect { buf: Vec::new() }
        }

        pub fn len(&self) -> usize {
            self.buf.len()
        }

        pub fn into_vec(self) -> Vec<u8> {
            self.buf
        }

        pub fn u8(&mut self, v: u8) -> &mut Self {
            self.buf.push(v);
            self
        }

        pub fn u16(&mut self, v: u16) -> &mut Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn u32(&mut self, v: u32) -> &mut Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn u64(&mut self, v: u64) -> &mut Self {
            self.buf.extend_from_slice(&v.to_le_bytes());
            self
        }

        pub fn uleb(&mut self, mut v: u64) -> &mut Self {
            loop {
                let mut byte = (v & 0x7f) as u8;
                v >>= 7;
                if v != 0 {
                    byte |= 0x80;
                }
                self.buf.push(byte);
                if v == 0 {
                    break;
                }
            }
            self
        }

        pub fn sleb(&mut self, mut v: i64) -> &mut Self {
            loop {
                let byte = (v & 0x7f) as u8;
                v >>= 7;
                let done = (v == 0 && byte & 0x40 == 0) || (v == -1 && byte & 0x40 != 0);
                if done {
                    self.buf.push(byte);
                    break;
                }
                self.buf.push(byte | 0x80);
            }
            self
        }

        pub fn cstr(&mut self, s: &str) -> &mut Self {
            self.buf.extend_from_slice(s.as_bytes());
            self.buf.push(0);
            self
        }

        pub fn bytes(&mut self, b: &[u8]) -> &mut Self {
            self.buf.extend_from_slice(b);
            self
        }

        /// Wraps `f`'s output in a DWARF4 32-bit unit header (address size
        /// 8, abbreviations at offset 0), patching the length afterwards.
        pub fn unit_header_v4(&mut self, f: impl FnOnce(&mut Sect)) {
            let start = self.buf.len();
            self.u32(0); // unit_length, patched below
            self.u16(4);
            self.u32(0); // debug_abbrev_offset
            self.u8(8);
            f(self);
            let len = (self.buf.len() - start - 4) as u32;
            self.buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
        }

        /// Same, for a DWARF5 compile-unit header.
        pub fn unit_header_v5(&mut self, f: impl FnOnce(&mut Sect)) {
            let start = self.buf.len();
            self.u32(0);
            self.u16(5);
            self.u8(gimli::constants::DW_UT_compile.0);
            self.u8(8);
            self.u32(0);
            f(self);
            let len = (self.buf.len() - start - 4) as u32;
            self.buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
        }
    }

    /// Assembles an `Info` directly from section images.
    pub struct InfoBuilder {
        sections: Vec<(String, Vec<u8>)>,
        image_sections: Vec<(String, u64, Vec<u8>)>,
        phdrs: Vec<crate::image::Phdr>,
    }

    impl InfoBuilder {
        pub fn new() -> Self {
            InfoBuilder {
                sections: Vec::new(),
                image_sections: Vec::new(),
                phdrs: Vec::new(),
            }
        }

        pub fn section(mut self, name: &str, data: Vec<u8>) -> Self {
            self.sections.push((name.to_string(), data));
            self
        }

        /// A section served through the image (CFI lives there), with its
        /// link-time address.
        pub fn image_section(mut self, name: &str, addr: u64, data: Vec<u8>) -> Self {
            self.image_sections.push((name.to_string(), addr, data));
            self
        }

        /// A PT_LOAD segment of the synthetic image.
        pub fn load_segment(mut self, vaddr: u64, memsz: u64) -> Self {
            self.phdrs.push(crate::image::Phdr {
                p_type: object::elf::PT_LOAD,
                vaddr,
                offset: 0,
                filesz: memsz,
                memsz,
                flags: 0,
            });
            self
        }

        pub fn build(self) -> Rc<Info> {
            let get = |name: &str| -> Reader {
                let data = self
                    .sections
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, d)| d.clone())
                    .unwrap_or_default();
                gimli::EndianReader::new(
                    Arc::from(data.into_boxed_slice()),
                    gimli::RunTimeEndian::Little,
                )
            };
            Rc::new(Info {
                debug_info: get(".debug_info"),
                debug_abbrev: get(".debug_abbrev"),
                debug_str: get(".debug_str"),
                debug_line_str: get(".debug_line_str"),
                debug_str_offsets: get(".debug_str_offsets"),
                debug_addr: get(".debug_addr"),
                debug_ranges: get(".debug_ranges"),
                debug_rnglists: get(".debug_rnglists"),
                debug_line: get(".debug_line"),
                image: Rc::new(crate::image::Image::for_test_with(
                    self.phdrs,
                    self.image_sections,
                )),
                units: Default::default(),
                units_scanned: Cell::new(false),
                eh_frame: Default::default(),
                eh_frame_parsed: Cell::new(false),
                debug_frame: Default::default(),
                debug_frame_parsed: Cell::new(false),
                alt: Default::default(),
            })
        }
    }
}
