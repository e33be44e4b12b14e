//! Register conventions for the supported architectures.
//!
//! The unwinder works exclusively in terms of DWARF register numbers; this
//! module maps those onto the kernel's notion of a register file
//! (`user_regs_struct` order, as found in an NT_PRSTATUS note) and onto the
//! glibc `ucontext_t` greg array used when decoding signal trampolines.

/// Architectures with a register-numbering table.
///
/// Adding an architecture means adding its tables here; nothing else in the
/// unwinder is architecture-specific.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Arch {
    X86_64,
    I386,
}

impl Arch {
    /// DWARF number of the instruction pointer.
    pub fn ip_reg(self) -> u16 {
        match self {
            Arch::X86_64 => 16,
            Arch::I386 => 8,
        }
    }

    /// DWARF number of the stack pointer.
    pub fn sp_reg(self) -> u16 {
        match self {
            Arch::X86_64 => 7,
            Arch::I386 => 4,
        }
    }

    /// DWARF number of the frame pointer.
    pub fn fp_reg(self) -> u16 {
        match self {
            Arch::X86_64 => 6,
            Arch::I386 => 5,
        }
    }

    /// Size of a machine word, in bytes.
    pub fn word_size(self) -> u64 {
        match self {
            Arch::X86_64 => 8,
            Arch::I386 => 4,
        }
    }

    /// Offset from the stack pointer, inside a signal trampoline, of the
    /// `gregs` array of the kernel-saved `ucontext_t`.
    pub fn ucontext_gregs_offset(self) -> u64 {
        match self {
            // uc_flags + uc_link + uc_stack
            Arch::X86_64 => 40,
            Arch::I386 => 20,
        }
    }

    /// DWARF register numbers of the `ucontext_t` greg array, in array
    /// order. `None` marks slots with no DWARF equivalent (eflags, segment
    /// registers, fault bookkeeping).
    pub fn ucontext_gregs(self) -> &'static [Option<u16>] {
        match self {
            Arch::X86_64 => UCONTEXT_GREGS_X86_64,
            Arch::I386 => UCONTEXT_GREGS_I386,
        }
    }
}

// glibc x86-64 gregset order: R8..R15, RDI, RSI, RBP, RBX, RDX, RAX, RCX,
// RSP, RIP, EFL, CSGSFS, ERR, TRAPNO, OLDMASK, CR2.
const UCONTEXT_GREGS_X86_64: &[Option<u16>] = &[
    Some(8),
    Some(9),
    Some(10),
    Some(11),
    Some(12),
    Some(13),
    Some(14),
    Some(15),
    Some(5), // rdi
    Some(4), // rsi
    Some(6), // rbp
    Some(3), // rbx
    Some(1), // rdx
    Some(0), // rax
    Some(2), // rcx
    Some(7), // rsp
    Some(16), // rip
    None,
    None,
    None,
    None,
    None,
    None,
];

// glibc i386 gregset order: GS, FS, ES, DS, EDI, ESI, EBP, ESP, EBX, EDX,
// ECX, EAX, TRAPNO, ERR, EIP, CS, EFL, UESP, SS.
const UCONTEXT_GREGS_I386: &[Option<u16>] = &[
    None,
    None,
    None,
    None,
    Some(7), // edi
    Some(6), // esi
    Some(5), // ebp
    Some(4), // esp
    Some(3), // ebx
    Some(2), // edx
    Some(1), // ecx
    Some(0), // eax
    None,
    None,
    Some(8), // eip
    None,
    None,
    None,
    None,
];

/// A thread's register file in `user_regs_struct` order, as stored in the
/// `pr_reg` member of an NT_PRSTATUS note (x86-64 layout).
#[derive(Copy, Clone, Debug, Default)]
pub struct CoreRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl CoreRegisters {
    /// Number of 8-byte slots in the on-disk `pr_reg` block.
    pub const SLOTS: usize = 27;

    /// Builds a register file from the raw `pr_reg` words of a prstatus
    /// note. Short input yields zeroes for the missing tail.
    pub fn from_slots(words: &[u64]) -> Self {
        let mut padded = [0u64; Self::SLOTS];
        for (dst, src) in padded.iter_mut().zip(words) {
            *dst = *src;
        }
        let [r15, r14, r13, r12, rbp, rbx, r11, r10, r9, r8, rax, rcx, rdx, rsi, rdi, orig_rax, rip, cs, eflags, rsp, ss, fs_base, gs_base, ds, es, fs, gs] =
            padded;
        CoreRegisters {
            r15,
            r14,
            r13,
            r12,
            rbp,
            rbx,
            r11,
            r10,
            r9,
            r8,
            rax,
            rcx,
            rdx,
            rsi,
            rdi,
            orig_rax,
            rip,
            cs,
            eflags,
            rsp,
            ss,
            fs_base,
            gs_base,
            ds,
            es,
            fs,
            gs,
        }
    }

    /// Reads the register with the given x86-64 DWARF number.
    pub fn dwarf_reg(&self, regno: u16) -> Option<u64> {
        Some(match regno {
            0 => self.rax,
            1 => self.rdx,
            2 => self.rcx,
            3 => self.rbx,
            4 => self.rsi,
            5 => self.rdi,
            6 => self.rbp,
            7 => self.rsp,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            16 => self.rip,
            49 => self.eflags,
            _ => return None,
        })
    }

    /// DWARF register numbers present in this file, for seeding a frame.
    pub fn dwarf_regs(&self) -> impl Iterator<Item = (u16, u64)> + '_ {
        (0u16..=16).chain(std::iter::once(49)).filter_map(|n| {
            self.dwarf_reg(n).map(|v| (n, v))
        })
    }
}
