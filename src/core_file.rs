//! A [`Host`] over ELF core dumps: PT_LOAD segments become the memory
//! image, NT_PRSTATUS notes become LWPs with register files, and NT_FILE
//! recovers the shared-object map.

use std::path::Path;

use gimli::Endianity;
use object::read::elf::{FileHeader, ProgramHeader};
use rangemap::RangeInclusiveMap;

use crate::proc::{AddressRange, Host, MappedFile, Memory};
use crate::regs::CoreRegisters;
use crate::Error;

/// Offset of `pr_reg` inside an x86-64 `elf_prstatus` note.
const PRSTATUS_REGS_OFFSET: usize = 112;
/// Offset of `pr_pid`.
const PRSTATUS_PID_OFFSET: usize = 32;

pub struct CoreHost {
    memory: RangeInclusiveMap<u64, Vec<u8>>,
    lwps: Vec<(u32, CoreRegisters)>,
    files: Vec<MappedFile>,
    ranges: Vec<AddressRange>,
    pid: u32,
}

impl CoreHost {
    pub fn open(path: &Path) -> Result<CoreHost, Error> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<CoreHost, Error> {
        let elf = object::elf::FileHeader64::<object::Endianness>::parse(data)?;
        let endian = elf.endian()?;
        if elf.e_type(endian) != object::elf::ET_CORE {
            return Err(Error::BadCore("not an ET_CORE object"));
        }
        let ge = match endian {
            object::Endianness::Little => gimli::RunTimeEndian::Little,
            object::Endianness::Big => gimli::RunTimeEndian::Big,
        };

        let mut host = CoreHost {
            memory: RangeInclusiveMap::new(),
            lwps: Vec::new(),
            files: Vec::new(),
            ranges: Vec::new(),
            pid: 0,
        };

        for ph in elf.program_headers(endian, data)? {
            match ph.p_type(endian) {
                object::elf::PT_LOAD => {
                    let vaddr = ph.p_vaddr(endian);
                    let filesz = ph.p_filesz(endian);
                    let memsz = ph.p_memsz(endian);
                    host.ranges.push(AddressRange {
                        start: vaddr,
                        file_size: filesz,
                        mem_size: memsz,
                    });
                    // Only the dumped prefix of a segment is readable;
                    // the rest was elided by the kernel.
                    if filesz > 0 {
                        let offset = ph.p_offset(endian) as usize;
                        let Some(bytes) = data.get(offset..offset + filesz as usize) else {
                            return Err(Error::BadCore("segment data out of bounds"));
                        };
                        host.memory
                            .insert(vaddr..=vaddr + filesz - 1, bytes.to_vec());
                    }
                }
                object::elf::PT_NOTE => {
                    let Some(mut notes) = ph.notes(endian, data)? else {
                        continue;
                    };
                    while let Some(note) = notes.next()? {
                        if note.name() != b"CORE" {
                            continue;
                        }
                        match note.n_type(endian) {
                            object::elf::NT_PRSTATUS => host.parse_prstatus(ge, note.desc()),
                            object::elf::NT_FILE => host.parse_file_note(ge, note.desc()),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        if host.lwps.is_empty() {
            return Err(Error::BadCore("no NT_PRSTATUS notes"));
        }
        Ok(host)
    }

    fn parse_prstatus(&mut self, endian: gimli::RunTimeEndian, desc: &[u8]) {
        if desc.len() < PRSTATUS_REGS_OFFSET + CoreRegisters::SLOTS * 8 {
            log::warn!("short NT_PRSTATUS note ({} bytes)", desc.len());
            return;
        }
        let pid = endian.read_u32(&desc[PRSTATUS_PID_OFFSET..PRSTATUS_PID_OFFSET + 4]);
        let mut words = [0u64; CoreRegisters::SLOTS];
        for (i, word) in words.iter_mut().enumerate() {
            let at = PRSTATUS_REGS_OFFSET + i * 8;
            *word = endian.read_u64(&desc[at..at + 8]);
        }
        // The first prstatus note is the faulting/interrupted thread.
        if self.lwps.is_empty() {
            self.pid = pid;
        }
        self.lwps.push((pid, CoreRegisters::from_slots(&words)));
    }

    fn parse_file_note(&mut self, endian: gimli::RunTimeEndian, desc: &[u8]) {
        if desc.len() < 16 {
            return;
        }
        let count = endian.read_u64(&desc[0..8]) as usize;
        let page_size = endian.read_u64(&desc[8..16]);
        let table_end = 16 + count * 24;
        let Some(table) = desc.get(16..table_end) else {
            log::warn!("short NT_FILE note");
            return;
        };
        let mut names = &desc[table_end.min(desc.len())..];
        for entry in table.chunks_exact(24) {
            let start = endian.read_u64(&entry[0..8]);
            let end = endian.read_u64(&entry[8..16]);
            let offset_pages = endian.read_u64(&entry[16..24]);
            let Some(nul) = names.iter().position(|&b| b == 0) else {
                log::warn!("NT_FILE name table truncated");
                return;
            };
            let path = String::from_utf8_lossy(&names[..nul]).into_owned();
            names = &names[nul + 1..];
            self.files.push(MappedFile {
                start,
                end,
                file_offset: offset_pages * page_size,
                path: path.into(),
            });
        }
    }
}

impl Host for CoreHost {
    fn list_lwps(&self) -> Vec<u32> {
        self.lwps.iter().map(|&(id, _)| id).collect()
    }

    fn get_regs(&self, lwp: u32) -> Result<CoreRegisters, Error> {
        self.lwps
            .iter()
            .find(|&&(id, _)| id == lwp)
            .map(|&(_, regs)| regs)
            .ok_or(Error::UnknownThread(lwp))
    }

    fn address_space(&self) -> Vec<AddressRange> {
        self.ranges.clone()
    }

    fn read_memory(&self, address: u64, dest: &mut [u8]) -> Result<usize, Error> {
        self.memory.read_memory(address, dest)
    }

    fn mapped_files(&self) -> Vec<MappedFile> {
        self.files.clone()
    }

    fn pid(&self) -> u32 {
        self.pid
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testutil::Sect;

    struct Segment {
        p_type: u32,
        vaddr: u64,
        data: Vec<u8>,
    }

    /// Assembles a minimal little-endian x86-64 core image.
    fn build_core(segments: &[Segment]) -> Vec<u8> {
        let ehsize = 64u64;
        let phentsize = 56u64;
        let phoff = ehsize;
        let mut data_off = phoff + phentsize * segments.len() as u64;

        let mut out = Sect::new();
        out.bytes(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.bytes(&[0; 8]);
        out.u16(object::elf::ET_CORE);
        out.u16(object::elf::EM_X86_64);
        out.u32(1); // e_version
        out.u64(0); // e_entry
        out.u64(phoff);
        out.u64(0); // e_shoff
        out.u32(0); // e_flags
        out.u16(64); // e_ehsize
        out.u16(phentsize as u16);
        out.u16(segments.len() as u16);
        out.u16(0).u16(0).u16(0); // shentsize/shnum/shstrndx

        for seg in segments {
            out.u32(seg.p_type);
            out.u32(0); // p_flags
            out.u64(data_off);
            out.u64(seg.vaddr);
            out.u64(seg.vaddr); // p_paddr
            out.u64(seg.data.len() as u64);
            out.u64(seg.data.len() as u64);
            out.u64(4); // p_align
            data_off += seg.data.len() as u64;
        }
        for seg in segments {
            out.bytes(&seg.data);
        }
        out.into_vec()
    }

    fn note(n_type: u32, desc: &[u8]) -> Vec<u8> {
        let mut s = Sect::new();
        s.u32(5); // namesz: "CORE\0"
        s.u32(desc.len() as u32);
        s.u32(n_type);
        s.bytes(b"CORE\0");
        s.bytes(&[0; 3]); // pad name to 4
        s.bytes(desc);
        let pad = (4 - desc.len() % 4) % 4;
        s.bytes(&vec![0; pad]);
        s.into_vec()
    }

    fn prstatus(pid: u32, rip: u64, rsp: u64) -> Vec<u8> {
        let mut desc = vec![0u8; PRSTATUS_REGS_OFFSET + CoreRegisters::SLOTS * 8 + 8];
        desc[PRSTATUS_PID_OFFSET..PRSTATUS_PID_OFFSET + 4].copy_from_slice(&pid.to_le_bytes());
        let rip_at = PRSTATUS_REGS_OFFSET + 16 * 8;
        desc[rip_at..rip_at + 8].copy_from_slice(&rip.to_le_bytes());
        let rsp_at = PRSTATUS_REGS_OFFSET + 19 * 8;
        desc[rsp_at..rsp_at + 8].copy_from_slice(&rsp.to_le_bytes());
        desc
    }

    fn file_note_desc() -> Vec<u8> {
        let mut s = Sect::new();
        s.u64(1); // count
        s.u64(0x1000); // page size
        s.u64(0x400000).u64(0x401000).u64(0); // start, end, pages
        s.cstr("/usr/bin/app");
        s.into_vec()
    }

    #[test]
    fn parses_threads_memory_and_mappings() {
        let mut notes = note(object::elf::NT_PRSTATUS, &prstatus(42, 0x401000, 0x7ffd_0000));
        notes.extend(note(object::elf::NT_PRSTATUS, &prstatus(43, 0x402000, 0x7ffe_0000)));
        notes.extend(note(object::elf::NT_FILE, &file_note_desc()));

        let core = build_core(&[
            Segment {
                p_type: object::elf::PT_NOTE,
                vaddr: 0,
                data: notes,
            },
            Segment {
                p_type: object::elf::PT_LOAD,
                vaddr: 0x7ffd_0000,
                data: vec![0xaa; 0x100],
            },
        ]);

        let host = CoreHost::from_bytes(&core).unwrap();
        assert_eq!(host.list_lwps(), vec![42, 43]);
        assert_eq!(host.pid(), 42);

        let regs = host.get_regs(42).unwrap();
        assert_eq!(regs.rip, 0x401000);
        assert_eq!(regs.rsp, 0x7ffd_0000);
        assert!(matches!(host.get_regs(99), Err(Error::UnknownThread(99))));

        let mut buf = [0u8; 4];
        assert_eq!(host.read_memory(0x7ffd_0010, &mut buf).unwrap(), 4);
        assert_eq!(buf, [0xaa; 4]);
        assert_eq!(host.read_memory(0x1000, &mut buf).unwrap(), 0);

        let files = host.mapped_files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, std::path::PathBuf::from("/usr/bin/app"));
        assert_eq!(files[0].start, 0x400000);
    }

    #[test]
    fn rejects_non_core_objects() {
        let mut bytes = build_core(&[]);
        // Flip e_type to ET_EXEC.
        bytes[16..18].copy_from_slice(&object::elf::ET_EXEC.to_le_bytes());
        assert!(matches!(
            CoreHost::from_bytes(&bytes),
            Err(Error::BadCore(_))
        ));
    }
}
