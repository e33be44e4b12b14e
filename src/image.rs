//! The ELF object collaborator.
//!
//! Everything the engine needs from an ELF file — named sections, load
//! segments, symbols, the alt-debug link — is collected here at load time
//! through the `object` crate, so the rest of the crate never touches ELF
//! encoding details.

use object::read::elf::{FileHeader, ProgramHeader};
use object::{Object, ObjectSection, ObjectSymbol};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::Error;

/// One program header, reduced to the fields the unwinder consults.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Phdr {
    pub p_type: u32,
    pub vaddr: u64,
    pub offset: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub flags: u32,
}

impl Phdr {
    /// Whether `addr` (an object-relative virtual address) falls inside
    /// this segment's memory image.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.vaddr && addr < self.vaddr.wrapping_add(self.memsz)
    }
}

#[derive(Clone, Debug)]
struct Sym {
    addr: u64,
    size: u64,
    name: String,
}

/// A loaded ELF object: raw bytes plus the derived tables the engine
/// queries. Section payloads are copied out (and decompressed) on first
/// use and cached.
pub struct Image {
    path: PathBuf,
    data: Arc<[u8]>,
    endian: gimli::RunTimeEndian,
    is_64: bool,
    arch: crate::regs::Arch,
    phdrs: Vec<Phdr>,
    /// Defined symbols sorted by address, for nearest-symbol fallback.
    symbols: Vec<Sym>,
    /// name -> (section vaddr, payload) for sections read so far.
    sections: std::cell::RefCell<HashMap<String, Option<(u64, Arc<[u8]>)>>>,
    alt_link: Option<PathBuf>,
}

impl Image {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let data: Arc<[u8]> = Arc::from(std::fs::read(path)?.into_boxed_slice());
        Self::from_bytes(path.to_owned(), data)
    }

    pub fn from_bytes(path: PathBuf, data: Arc<[u8]>) -> Result<Self, Error> {
        let file = object::File::parse(&*data)?;
        let endian = if file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };
        let arch = match file.architecture() {
            object::Architecture::X86_64 => crate::regs::Arch::X86_64,
            object::Architecture::I386 => crate::regs::Arch::I386,
            other => return Err(Error::UnsupportedArch(format!("{:?}", other))),
        };

        let mut symbols: Vec<Sym> = file
            .symbols()
            .chain(file.dynamic_symbols())
            .filter(|sym| sym.address() != 0)
            .filter_map(|sym| {
                let name = sym.name().ok()?;
                if name.is_empty() {
                    return None;
                }
                Some(Sym {
                    addr: sym.address(),
                    size: sym.size(),
                    name: name.to_string(),
                })
            })
            .collect();
        symbols.sort_by_key(|s| s.addr);
        symbols.dedup_by(|a, b| a.addr == b.addr && a.name == b.name);

        let alt_link = file
            .section_by_name(".gnu_debugaltlink")
            .and_then(|sec| sec.uncompressed_data().ok())
            .and_then(|data| {
                // Path, NUL, then the companion's build id.
                let end = data.iter().position(|&b| b == 0)?;
                Some(PathBuf::from(String::from_utf8_lossy(&data[..end]).into_owned()))
            });

        let phdrs = parse_phdrs(&data)?;
        let is_64 = file.is_64();

        Ok(Image {
            path,
            data,
            endian,
            is_64,
            arch,
            phdrs,
            symbols,
            sections: Default::default(),
            alt_link,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn endian(&self) -> gimli::RunTimeEndian {
        self.endian
    }

    pub fn is_64(&self) -> bool {
        self.is_64
    }

    pub fn arch(&self) -> crate::regs::Arch {
        self.arch
    }

    pub fn phdrs(&self) -> &[Phdr] {
        &self.phdrs
    }

    /// The `.gnu_debugaltlink` target, if the object carries one.
    pub fn alt_link(&self) -> Option<&Path> {
        self.alt_link.as_deref()
    }

    /// The PT_LOAD segment covering an object-relative address.
    pub fn segment_for(&self, addr: u64) -> Option<&Phdr> {
        self.phdrs
            .iter()
            .find(|p| p.p_type == object::elf::PT_LOAD && p.contains(addr))
    }

    /// Returns the named section's payload (decompressed if need be) and
    /// its link-time address. Missing sections yield `None`, not an error.
    pub fn section(&self, name: &str) -> Option<(u64, Arc<[u8]>)> {
        if let Some(cached) = self.sections.borrow().get(name) {
            return cached.clone();
        }
        let loaded = object::File::parse(&*self.data).ok().and_then(|file| {
            let sec = file.section_by_name(name)?;
            let addr = sec.address();
            let data = sec.uncompressed_data().ok()?;
            Some((addr, Arc::from(&*data)))
        });
        self.sections
            .borrow_mut()
            .insert(name.to_string(), loaded.clone());
        loaded
    }

    /// A reader over the named section, empty if absent.
    pub fn section_reader(&self, name: &str) -> crate::Reader {
        let (_, data) = self
            .section(name)
            .unwrap_or((0, Arc::from(&[][..])));
        gimli::EndianReader::new(data, self.endian)
    }

    /// Nearest symbol at or below `addr`, with the offset into it.
    /// Symbols with a size only match addresses inside it.
    pub fn nearest_symbol(&self, addr: u64) -> Option<(&str, u64)> {
        let idx = self.symbols.partition_point(|s| s.addr <= addr);
        self.symbols[..idx].iter().rev().find_map(|sym| {
            let off = addr - sym.addr;
            if sym.size == 0 || off < sym.size {
                Some((sym.name.as_str(), off))
            } else {
                None
            }
        })
    }

    /// Raw file contents, for hosts that need to re-walk the headers.
    pub fn raw(&self) -> &Arc<[u8]> {
        &self.data
    }

    /// A blank image for tests that assemble sections by hand.
    #[cfg(test)]
    pub(crate) fn for_test() -> Image {
        Self::for_test_with(Vec::new(), Vec::new())
    }

    /// A synthetic image with explicit segments, sections and symbols.
    #[cfg(test)]
    pub(crate) fn for_test_with(phdrs: Vec<Phdr>, sections: Vec<(String, u64, Vec<u8>)>) -> Image {
        let image = Image {
            path: PathBuf::from("<test>"),
            data: Arc::from(&[][..]),
            endian: gimli::RunTimeEndian::Little,
            is_64: true,
            arch: crate::regs::Arch::X86_64,
            phdrs,
            symbols: Vec::new(),
            sections: Default::default(),
            alt_link: None,
        };
        for (name, addr, data) in sections {
            image
                .sections
                .borrow_mut()
                .insert(name, Some((addr, Arc::from(data.into_boxed_slice()))));
        }
        image
    }

    #[cfg(test)]
    pub(crate) fn add_test_symbol(&mut self, name: &str, addr: u64, size: u64) {
        self.symbols.push(Sym {
            addr,
            size,
            name: name.to_string(),
        });
        self.symbols.sort_by_key(|s| s.addr);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn nearest_symbol_respects_sizes() {
        let mut image = Image::for_test();
        image.add_test_symbol("sized", 0x1000, 0x10);
        image.add_test_symbol("sizeless", 0x2000, 0);

        assert_eq!(image.nearest_symbol(0x1000), Some(("sized", 0)));
        assert_eq!(image.nearest_symbol(0x100f), Some(("sized", 0xf)));
        // Past the sized symbol's extent there is no match.
        assert_eq!(image.nearest_symbol(0x1010), None);
        // A sizeless symbol matches any later address.
        assert_eq!(image.nearest_symbol(0x2345), Some(("sizeless", 0x345)));
        assert_eq!(image.nearest_symbol(0xfff), None);
    }

    #[test]
    fn segment_lookup() {
        let image = Image::for_test_with(
            vec![Phdr {
                p_type: object::elf::PT_LOAD,
                vaddr: 0x1000,
                offset: 0,
                filesz: 0x100,
                memsz: 0x200,
                flags: 0,
            }],
            Vec::new(),
        );
        assert!(image.segment_for(0x1000).is_some());
        assert!(image.segment_for(0x11ff).is_some());
        assert!(image.segment_for(0x1200).is_none());
        assert!(image.segment_for(0xfff).is_none());
    }
}

/// Reads the program-header table, covering both ELF classes.
pub(crate) fn parse_phdrs(data: &[u8]) -> Result<Vec<Phdr>, Error> {
    if data.get(4) == Some(&object::elf::ELFCLASS64) {
        let elf = object::elf::FileHeader64::<object::Endianness>::parse(data)?;
        let endian = elf.endian()?;
        Ok(elf
            .program_headers(endian, data)?
            .iter()
            .map(|ph| Phdr {
                p_type: ph.p_type(endian),
                vaddr: ph.p_vaddr(endian),
                offset: ph.p_offset(endian),
                filesz: ph.p_filesz(endian),
                memsz: ph.p_memsz(endian),
                flags: ph.p_flags(endian),
            })
            .collect())
    } else {
        let elf = object::elf::FileHeader32::<object::Endianness>::parse(data)?;
        let endian = elf.endian()?;
        Ok(elf
            .program_headers(endian, data)?
            .iter()
            .map(|ph| Phdr {
                p_type: ph.p_type(endian),
                vaddr: ph.p_vaddr(endian).into(),
                offset: ph.p_offset(endian).into(),
                filesz: ph.p_filesz(endian).into(),
                memsz: ph.p_memsz(endian).into(),
                flags: ph.p_flags(endian),
            })
            .collect())
    }
}
