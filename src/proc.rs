//! The process model: a capability trait for targets, the byte-addressable
//! memory seam, and the `Process` type binding a target to its loaded
//! objects.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::rc::Rc;

use gimli::Endianity;
use rangemap::RangeInclusiveMap;

use crate::image::Phdr;
use crate::regs::{Arch, CoreRegisters};
use crate::unwind::ThreadStack;
use crate::{Error, ImageCache, Info, Options};

/// Uniform byte-addressable reads over a target's address space.
///
/// `read_memory` returns the number of contiguous bytes that exist at
/// `address` — possibly fewer than requested, possibly zero. Holes are
/// valid target state, not failures; `Err` means the target itself could
/// not be consulted.
pub trait Memory {
    fn read_memory(&self, address: u64, dest: &mut [u8]) -> Result<usize, Error>;
}

/// Byte-segment images keyed by address range work as memory directly;
/// this is what core-file loads and tests use.
impl Memory for RangeInclusiveMap<u64, Vec<u8>> {
    fn read_memory(&self, address: u64, dest: &mut [u8]) -> Result<usize, Error> {
        let Some((range, segment)) = self.get_key_value(&address) else {
            return Ok(0);
        };
        let offset = address - range.start();

        let Ok(offset) = usize::try_from(offset) else {
            return Ok(0);
        };
        let end = offset.checked_add(dest.len()).unwrap_or(usize::MAX);
        let end = usize::min(end, segment.len());
        let Some(chunk) = end.checked_sub(offset) else {
            return Ok(0);
        };

        dest[..chunk].copy_from_slice(&segment[offset..end]);
        Ok(chunk)
    }
}

/// Reads one little/big-endian machine word, treating a short read as
/// failure.
pub fn read_word(
    mem: &dyn Memory,
    endian: gimli::RunTimeEndian,
    address: u64,
    size: u8,
) -> Result<u64, Error> {
    let mut buffer = [0u8; 8];
    let buffer = &mut buffer[..size as usize];
    let n = mem.read_memory(address, buffer)?;
    if n < size as usize {
        return Err(Error::MemoryRead(address));
    }
    Ok(match size {
        1 => u64::from(buffer[0]),
        2 => u64::from(endian.read_u16(buffer)),
        4 => u64::from(endian.read_u32(buffer)),
        8 => endian.read_u64(buffer),
        _ => return Err(Error::MalformedDwarf("unsupported word size")),
    })
}

/// One span of the target's address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct AddressRange {
    pub start: u64,
    pub file_size: u64,
    pub mem_size: u64,
}

/// A file mapping recorded by the target (NT_FILE for cores).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MappedFile {
    pub start: u64,
    pub end: u64,
    pub file_offset: u64,
    pub path: PathBuf,
}

/// What the engine needs from a stopped target. Core files satisfy this
/// trivially; a live-process host would wrap ptrace behind the same
/// surface.
pub trait Host {
    fn list_lwps(&self) -> Vec<u32>;
    fn get_regs(&self, lwp: u32) -> Result<CoreRegisters, Error>;
    fn address_space(&self) -> Vec<AddressRange>;
    fn read_memory(&self, address: u64, dest: &mut [u8]) -> Result<usize, Error>;

    fn mapped_files(&self) -> Vec<MappedFile> {
        Vec::new()
    }

    fn pid(&self) -> u32 {
        0
    }

    // Stop control is a no-op for intrinsically static targets.
    fn stop(&self, _lwp: u32) {}
    fn resume(&self, _lwp: u32) {}
    fn stop_all(&self) {}
    fn resume_all(&self) {}
}

/// Holds the whole target stopped for a scope. `clear` disarms the guard
/// and resumes early; otherwise dropping it resumes on every exit path.
pub struct StopGuard<'a> {
    host: Option<&'a dyn Host>,
}

impl<'a> StopGuard<'a> {
    pub fn new(host: &'a dyn Host) -> Self {
        host.stop_all();
        StopGuard { host: Some(host) }
    }

    pub fn clear(&mut self) {
        if let Some(host) = self.host.take() {
            host.resume_all();
        }
    }
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// A target bound to its loaded ELF objects and their DWARF.
pub struct Process {
    host: Box<dyn Host>,
    pub options: Options,
    cache: ImageCache,
    /// Load bias -> object info.
    objects: RefCell<BTreeMap<u64, Rc<Info>>>,
    arch: Cell<Option<Arch>>,
    endian: Cell<gimli::RunTimeEndian>,
}

impl Process {
    pub fn new(host: Box<dyn Host>, options: Options) -> Process {
        let cache = ImageCache::new(options.path_replacements.clone());
        Process {
            host,
            options,
            cache,
            objects: Default::default(),
            arch: Cell::new(None),
            endian: Cell::new(gimli::RunTimeEndian::Little),
        }
    }

    pub fn host(&self) -> &dyn Host {
        &*self.host
    }

    pub fn cache(&self) -> &ImageCache {
        &self.cache
    }

    pub fn arch(&self) -> Arch {
        self.arch.get().unwrap_or(Arch::X86_64)
    }

    pub fn endian(&self) -> gimli::RunTimeEndian {
        self.endian.get()
    }

    /// Registers an object mapped at `bias` (the difference between link
    /// and load addresses).
    pub fn add_object(&self, bias: u64, info: Rc<Info>) {
        if self.arch.get().is_none() {
            self.arch.set(Some(info.image().arch()));
            self.endian.set(info.image().endian());
        }
        self.objects.borrow_mut().insert(bias, info);
    }

    /// Loads every file mapping the host reports, plus an optional
    /// explicit executable for targets that don't report one.
    pub fn load_objects(&self, exec: Option<&std::path::Path>) {
        let mut by_path: BTreeMap<PathBuf, u64> = BTreeMap::new();
        for mapping in self.host.mapped_files() {
            let entry = by_path.entry(mapping.path).or_insert(mapping.start);
            *entry = (*entry).min(mapping.start);
        }
        if by_path.is_empty() {
            if let Some(path) = exec {
                match self.cache.load(path) {
                    Ok(info) => self.add_object(0, info),
                    Err(e) => log::warn!("cannot load {}: {}", path.display(), e),
                }
            }
            return;
        }
        for (path, start) in by_path {
            match self.cache.load(&path) {
                Ok(info) => {
                    let min_vaddr = info
                        .image()
                        .phdrs()
                        .iter()
                        .filter(|p| p.p_type == object::elf::PT_LOAD)
                        .map(|p| p.vaddr & !0xfff)
                        .min()
                        .unwrap_or(0);
                    let bias = start.saturating_sub(min_vaddr);
                    self.add_object(bias, info);
                }
                Err(e) => log::debug!("cannot load {}: {}", path.display(), e),
            }
        }
    }

    /// The object, its load bias, and the covering segment for an address
    /// in the target's address space.
    pub fn find_object(&self, addr: u64) -> Option<(u64, Rc<Info>, Phdr)> {
        for (&bias, info) in self.objects.borrow().iter() {
            let Some(rel) = addr.checked_sub(bias) else {
                continue;
            };
            if let Some(phdr) = info.image().segment_for(rel) {
                return Some((bias, info.clone(), *phdr));
            }
        }
        None
    }

    /// Nearest-symbol fallback naming for an address.
    pub fn find_symbol(&self, addr: u64) -> Option<(String, u64)> {
        let (bias, info, _) = self.find_object(addr)?;
        let (name, offset) = info.image().nearest_symbol(addr - bias)?;
        Some((name.to_string(), offset))
    }

    /// Unwinds every LWP of the target, innermost frame first, holding the
    /// target stopped for the duration.
    pub fn stacks(&self) -> Vec<ThreadStack> {
        let mut guard = StopGuard::new(&*self.host);
        let mut out = Vec::new();
        for lwp in self.host.list_lwps() {
            match self.host.get_regs(lwp) {
                Ok(regs) => out.push(ThreadStack::unwind(self, lwp, &regs)),
                Err(e) => log::warn!("no registers for LWP {}: {}", lwp, e),
            }
        }
        guard.clear();
        out
    }
}

impl Memory for Process {
    fn read_memory(&self, address: u64, dest: &mut [u8]) -> Result<usize, Error> {
        self.host.read_memory(address, dest)
    }
}

/// A synthetic host over a memory map and fixed register files.
#[cfg(test)]
pub(crate) struct MapHost {
    pub memory: RangeInclusiveMap<u64, Vec<u8>>,
    pub threads: Vec<(u32, CoreRegisters)>,
}

#[cfg(test)]
impl Host for MapHost {
    fn list_lwps(&self) -> Vec<u32> {
        self.threads.iter().map(|&(id, _)| id).collect()
    }

    fn get_regs(&self, lwp: u32) -> Result<CoreRegisters, Error> {
        self.threads
            .iter()
            .find(|&&(id, _)| id == lwp)
            .map(|&(_, regs)| regs)
            .ok_or(Error::UnknownThread(lwp))
    }

    fn address_space(&self) -> Vec<AddressRange> {
        self.memory
            .iter()
            .map(|(range, data)| AddressRange {
                start: *range.start(),
                file_size: data.len() as u64,
                mem_size: range.end() - range.start() + 1,
            })
            .collect()
    }

    fn read_memory(&self, address: u64, dest: &mut [u8]) -> Result<usize, Error> {
        self.memory.read_memory(address, dest)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn segment_map_reads_partial_and_missing() {
        let mut map = RangeInclusiveMap::new();
        map.insert(0x1000..=0x1003, vec![1, 2, 3, 4]);
        let mut buf = [0u8; 8];
        assert_eq!(map.read_memory(0x1000, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        assert_eq!(map.read_memory(0x1002, &mut buf).unwrap(), 2);
        assert_eq!(map.read_memory(0x2000, &mut buf).unwrap(), 0);
    }

    #[test]
    fn read_word_fails_on_hole() {
        let mut map = RangeInclusiveMap::new();
        map.insert(0x1000..=0x1003, vec![0x78, 0x56, 0x34, 0x12]);
        let word = read_word(&map, gimli::RunTimeEndian::Little, 0x1000, 4).unwrap();
        assert_eq!(word, 0x1234_5678);
        assert!(matches!(
            read_word(&map, gimli::RunTimeEndian::Little, 0x1002, 4),
            Err(Error::MemoryRead(0x1002))
        ));
    }

    #[test]
    fn stop_guard_resumes_once() {
        struct CountingHost {
            stops: StdRefCell<u32>,
            resumes: StdRefCell<u32>,
        }
        impl Host for CountingHost {
            fn list_lwps(&self) -> Vec<u32> {
                Vec::new()
            }
            fn get_regs(&self, lwp: u32) -> Result<CoreRegisters, Error> {
                Err(Error::UnknownThread(lwp))
            }
            fn address_space(&self) -> Vec<AddressRange> {
                Vec::new()
            }
            fn read_memory(&self, _address: u64, _dest: &mut [u8]) -> Result<usize, Error> {
                Ok(0)
            }
            fn stop_all(&self) {
                *self.stops.borrow_mut() += 1;
            }
            fn resume_all(&self) {
                *self.resumes.borrow_mut() += 1;
            }
        }

        let host = CountingHost {
            stops: StdRefCell::new(0),
            resumes: StdRefCell::new(0),
        };
        {
            let _guard = StopGuard::new(&host);
        }
        assert_eq!(*host.stops.borrow(), 1);
        assert_eq!(*host.resumes.borrow(), 1);

        let mut guard = StopGuard::new(&host);
        guard.clear();
        drop(guard);
        assert_eq!(*host.resumes.borrow(), 2);
    }
}
