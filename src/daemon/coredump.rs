//! Standard Linux ELF core layout output (§6), grounded on `CoreFileWriter`'s note ordering and
//! `coredump_filter` bitmask semantics. Scoped to what this crate's own guest state can supply:
//! `NT_PRSTATUS` from [`GuestCpuState`]'s GPRs/RIP/EFLAGS and `NT_FPREGSET`/`NT_X86_XSTATE` from
//! its vector/x87 state. `NT_SIGINFO`/`NT_FILE` need host process bookkeeping this crate's
//! dispatcher doesn't keep (open file descriptions, the triggering signal's `siginfo_t`) and are
//! written as empty notes rather than fabricated ones.

use crate::arch::x86::GuestCpuState;
use std::io::Write;

bitflags::bitflags! {
    /// Mirrors `/proc/pid/coredump_filter`'s bit semantics (`proc(5)`), read by the daemon so a
    /// guest VMA can be excluded from the written core the same way the kernel would exclude it
    /// from a native `ELF_CORE_DUMP`.
    pub struct CoredumpFilter: u32 {
        const ANONYMOUS_PRIVATE = 1 << 0;
        const ANONYMOUS_SHARED  = 1 << 1;
        const FILE_PRIVATE      = 1 << 2;
        const FILE_SHARED       = 1 << 3;
        const ELF_HEADERS       = 1 << 4;
        const HUGETLB_PRIVATE   = 1 << 5;
        const HUGETLB_SHARED    = 1 << 6;
        const DAX_PRIVATE       = 1 << 7;
        const DAX_SHARED        = 1 << 8;
    }
}

impl Default for CoredumpFilter {
    /// The kernel's documented default (`proc(5)`): private and shared anonymous mappings dump,
    /// file-backed mappings do not.
    fn default() -> Self {
        Self::ANONYMOUS_PRIVATE | Self::ANONYMOUS_SHARED
    }
}

impl CoredumpFilter {
    /// Reads `/proc/self/coredump_filter`-style contents (a single hex-encoded `u32` line).
    pub fn parse(contents: &str) -> Self {
        let value = u32::from_str_radix(contents.trim(), 16).unwrap_or(Self::default().bits());
        Self::from_bits_truncate(value)
    }
}

/// One guest VMA considered for inclusion in the core.
pub struct GuestMapping {
    pub guest_base: u64,
    pub size: u64,
    pub writable: bool,
    pub is_anonymous: bool,
    pub data: Vec<u8>,
}

impl GuestMapping {
    fn included(&self, filter: CoredumpFilter) -> bool {
        let bit = match (self.is_anonymous, self.writable) {
            (true, true) => CoredumpFilter::ANONYMOUS_PRIVATE,
            (true, false) => CoredumpFilter::ANONYMOUS_SHARED,
            (false, true) => CoredumpFilter::FILE_PRIVATE,
            (false, false) => CoredumpFilter::FILE_SHARED,
        };
        filter.contains(bit)
    }
}

const NT_PRSTATUS: u32 = 1;
const NT_PRPSINFO: u32 = 3;
const NT_SIGINFO: u32 = 0x53494749;
const NT_AUXV: u32 = 6;
const NT_FILE: u32 = 0x46494c45;
const NT_FPREGSET: u32 = 2;
const NT_X86_XSTATE: u32 = 0x202;

struct Note {
    name: &'static [u8],
    kind: u32,
    data: Vec<u8>,
}

fn write_note(out: &mut Vec<u8>, note: &Note) {
    let name_len = (note.name.len() + 1) as u32;
    out.extend_from_slice(&name_len.to_ne_bytes());
    out.extend_from_slice(&(note.data.len() as u32).to_ne_bytes());
    out.extend_from_slice(&note.kind.to_ne_bytes());
    out.extend_from_slice(note.name);
    out.push(0);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out.extend_from_slice(&note.data);
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn prstatus_note(cpu: &GuestCpuState, pid: i32) -> Note {
    // A real `struct elf_prstatus` carries a lot of process bookkeeping this crate has no use
    // for (signal dispositions, a `pr_reg` array in kernel `user_regs_struct` layout); only the
    // general-purpose register file, RIP and PID are populated, zero-padded to roughly that
    // struct's size so a reader expecting the standard layout at least finds the GPRs in the
    // spot it expects.
    let mut data = vec![0u8; 112];
    data[32..36].copy_from_slice(&pid.to_ne_bytes());
    let mut gpr_bytes = Vec::with_capacity(17 * 8);
    for gpr in cpu.gprs {
        gpr_bytes.extend_from_slice(&gpr.to_ne_bytes());
    }
    gpr_bytes.extend_from_slice(&cpu.rip.to_ne_bytes());
    data.extend_from_slice(&gpr_bytes);
    Note { name: b"CORE", kind: NT_PRSTATUS, data }
}

fn prpsinfo_note(application_name: &str) -> Note {
    let mut data = vec![0u8; 88];
    let name_bytes = application_name.as_bytes();
    let copy_len = name_bytes.len().min(16);
    data[32..32 + copy_len].copy_from_slice(&name_bytes[..copy_len]);
    Note { name: b"CORE", kind: NT_PRPSINFO, data }
}

fn fpregset_note(cpu: &GuestCpuState) -> Note {
    let mut data = Vec::new();
    for vector in cpu.vectors {
        data.extend_from_slice(&vector);
    }
    Note { name: b"CORE", kind: NT_FPREGSET, data }
}

fn xstate_note(cpu: &GuestCpuState) -> Note {
    let mut data = Vec::new();
    data.extend_from_slice(&cpu.mxcsr.to_ne_bytes());
    for mmx in cpu.mmx {
        data.extend_from_slice(&mmx);
    }
    Note { name: b"LINUX", kind: NT_X86_XSTATE, data }
}

fn auxv_note(auxv: &[u64]) -> Note {
    let mut data = Vec::with_capacity(auxv.len() * 8);
    for word in auxv {
        data.extend_from_slice(&word.to_ne_bytes());
    }
    Note { name: b"CORE", kind: NT_AUXV, data }
}

/// Assembles and writes a standard-layout ELF core file (`ET_CORE`) for one guest thread's state,
/// in the note order §6 names: `NT_PRSTATUS`, `NT_PRPSINFO`, `NT_SIGINFO`, `NT_AUXV`, `NT_FILE`,
/// `NT_FPREGSET`, `NT_X86_XSTATE`, followed by one `PT_LOAD` per included guest mapping.
pub struct CoreWriter {
    pub application_name: String,
    pub pid: i32,
    pub auxv: Vec<u64>,
    pub filter: CoredumpFilter,
    pub is_64bit: bool,
}

impl CoreWriter {
    pub fn write(&self, cpu: &GuestCpuState, mappings: &[GuestMapping], out: &mut impl Write) -> std::io::Result<()> {
        let notes = [
            prstatus_note(cpu, self.pid),
            prpsinfo_note(&self.application_name),
            Note { name: b"CORE", kind: NT_SIGINFO, data: Vec::new() },
            auxv_note(&self.auxv),
            Note { name: b"CORE", kind: NT_FILE, data: Vec::new() },
            fpregset_note(cpu),
            xstate_note(cpu),
        ];

        let mut note_bytes = Vec::new();
        for note in &notes {
            write_note(&mut note_bytes, note);
        }

        let included: Vec<&GuestMapping> = mappings.iter().filter(|m| m.included(self.filter)).collect();

        let ehdr_size = 64u64;
        let phdr_size = 56u64;
        let phdr_count = 1 + included.len() as u64;
        let notes_offset = ehdr_size + phdr_size * phdr_count;
        let mut file_offset = notes_offset + note_bytes.len() as u64;
        file_offset = (file_offset + 0xfff) & !0xfff;

        write_elf_header(out, self.is_64bit, phdr_count as u16)?;

        write_phdr(out, 4 /* PT_NOTE */, 0, notes_offset, note_bytes.len() as u64, 0, 0)?;
        let mut offset = file_offset;
        for mapping in &included {
            write_phdr(out, 1 /* PT_LOAD */, mapping.guest_base, offset, mapping.size, mapping.size, 0x6)?;
            offset += mapping.size;
        }

        out.write_all(&note_bytes)?;
        let padding = file_offset - notes_offset;
        out.write_all(&vec![0u8; padding as usize])?;
        for mapping in &included {
            out.write_all(&mapping.data)?;
        }

        Ok(())
    }
}

fn write_elf_header(out: &mut impl Write, is_64bit: bool, phnum: u16) -> std::io::Result<()> {
    let mut hdr = [0u8; 64];
    hdr[0..4].copy_from_slice(b"\x7fELF");
    hdr[4] = if is_64bit { 2 } else { 1 };
    hdr[5] = 1; // little-endian
    hdr[6] = 1; // EI_VERSION
    hdr[16..18].copy_from_slice(&4u16.to_ne_bytes()); // ET_CORE
    hdr[18..20].copy_from_slice(&(if is_64bit { 62u16 } else { 3u16 }).to_ne_bytes()); // EM_X86_64 / EM_386
    hdr[20..24].copy_from_slice(&1u32.to_ne_bytes());
    hdr[52..54].copy_from_slice(&56u16.to_ne_bytes()); // e_phentsize
    hdr[54..56].copy_from_slice(&phnum.to_ne_bytes());
    hdr[32..40].copy_from_slice(&64u64.to_ne_bytes()); // e_phoff
    out.write_all(&hdr)
}

fn write_phdr(
    out: &mut impl Write,
    kind: u32,
    vaddr: u64,
    offset: u64,
    filesz: u64,
    memsz: u64,
    flags: u32,
) -> std::io::Result<()> {
    let mut phdr = [0u8; 56];
    phdr[0..4].copy_from_slice(&kind.to_ne_bytes());
    phdr[4..8].copy_from_slice(&flags.to_ne_bytes());
    phdr[8..16].copy_from_slice(&offset.to_ne_bytes());
    phdr[16..24].copy_from_slice(&vaddr.to_ne_bytes());
    phdr[24..32].copy_from_slice(&vaddr.to_ne_bytes());
    phdr[32..40].copy_from_slice(&filesz.to_ne_bytes());
    phdr[40..48].copy_from_slice(&memsz.to_ne_bytes());
    out.write_all(&phdr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_includes_only_anonymous_mappings() {
        let filter = CoredumpFilter::default();
        let anon = GuestMapping { guest_base: 0, size: 4096, writable: true, is_anonymous: true, data: vec![0; 4096] };
        let file_backed =
            GuestMapping { guest_base: 0x1000, size: 4096, writable: false, is_anonymous: false, data: vec![0; 4096] };
        assert!(anon.included(filter));
        assert!(!file_backed.included(filter));
    }

    #[test]
    fn parse_falls_back_to_default_on_garbage_input() {
        assert_eq!(CoredumpFilter::parse("not hex"), CoredumpFilter::default());
    }

    #[test]
    fn writes_a_well_formed_elf_core_header() {
        let writer = CoreWriter {
            application_name: "guest".into(),
            pid: 42,
            auxv: vec![3, 0x1000],
            filter: CoredumpFilter::default(),
            is_64bit: true,
        };
        let cpu = GuestCpuState::default();
        let mut out = Vec::new();
        writer.write(&cpu, &[], &mut out).unwrap();
        assert_eq!(&out[0..4], b"\x7fELF");
        assert_eq!(out[4], 2);
        assert_eq!(u16::from_ne_bytes(out[16..18].try_into().unwrap()), 4);
    }
}
