//! Binary encoding for one AOT cache file (§4.G): an 8-byte cookie, a sequence of
//! `{guest_hash, guest_length, ra_blob, ir_blob}` entries, and a trailing index of
//! `{guest_start_offset, file_offset}` pairs plus the file identifier string, so a reader can
//! validate the whole file belongs to the binary it is about to translate before trusting any
//! entry in it.
//!
//! [`crate::aot::AotCache`] parses the whole file into memory at open rather than keeping the
//! mapping around for lazy per-entry lookups: cache files are small relative to a process's
//! address space and this keeps `lookup` lock-free and allocation-free after open.

use crate::ir::{BlockExit, IrBlock, Node, Region};
use crate::opt::{Allocation, Location};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use std::path::Path;

use super::COOKIE;

pub struct OwnedEntry {
    pub guest_rip: u64,
    pub guest_hash: u64,
    pub guest_length: u32,
    pub ir: IrBlock,
    pub alloc: Allocation,
}

pub fn encode_file(identifier: &str, entries: &[OwnedEntry]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(COOKIE);

    let mut index: Vec<(u64, u64)> = Vec::with_capacity(entries.len());
    for entry in entries {
        let file_offset = out.len() as u64;
        out.write_u64::<LittleEndian>(entry.guest_hash).unwrap();
        out.write_u32::<LittleEndian>(entry.guest_length).unwrap();

        let ir_bytes = encode_ir(&entry.ir);
        out.write_u32::<LittleEndian>(ir_bytes.len() as u32).unwrap();
        out.extend_from_slice(&ir_bytes);

        let ra_bytes = encode_alloc(&entry.alloc);
        out.write_u32::<LittleEndian>(ra_bytes.len() as u32).unwrap();
        out.extend_from_slice(&ra_bytes);

        index.push((entry.guest_rip, file_offset));
    }
    index.sort_by_key(|&(rip, _)| rip);

    let footer_start = out.len();
    for (guest_start_offset, file_offset) in &index {
        out.write_u64::<LittleEndian>(*guest_start_offset).unwrap();
        out.write_u64::<LittleEndian>(*file_offset).unwrap();
    }
    out.write_u32::<LittleEndian>(index.len() as u32).unwrap();
    let id_bytes = identifier.as_bytes();
    out.write_u32::<LittleEndian>(id_bytes.len() as u32).unwrap();
    out.extend_from_slice(id_bytes);
    let footer_len = (out.len() - footer_start) as u64;
    out.write_u64::<LittleEndian>(footer_len).unwrap();

    out
}

/// Parses a cache file at `path`, returning `None` if it doesn't exist, is corrupt, or was
/// tagged with a different `expected_identifier` than the one we're about to translate under.
pub fn read_file(path: &Path, expected_identifier: &str) -> Option<Vec<OwnedEntry>> {
    let file = std::fs::File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    if len < COOKIE.len() as u64 + 8 {
        return None;
    }
    // SAFETY: `file` is opened read-only for the duration of this mapping and not modified
    // concurrently by this process.
    let mapping = mmap_rs::MmapOptions::new(len as usize)
        .ok()?
        .with_file(&file, 0)
        .map()
        .ok()?;
    let bytes: &[u8] = &mapping;

    if &bytes[..COOKIE.len()] != COOKIE {
        return None;
    }

    let footer_len = u64::from_le_bytes(bytes[bytes.len() - 8..].try_into().ok()?);
    let footer_start = (bytes.len() as u64).checked_sub(8 + footer_len)? as usize;

    let mut index = Vec::new();
    // Layout is `[pairs...][count:u32][id_len:u32][id bytes]`; `count`/`id_len` are only known
    // once the variable-length `id bytes` tail is located, so parse this back-to-front rather
    // than with a forward `Cursor`.
    let footer_bytes = &bytes[footer_start..bytes.len() - 8];
    if footer_bytes.len() < 8 {
        return None;
    }
    let id_len = u32::from_le_bytes(footer_bytes[footer_bytes.len() - 4..].try_into().ok()?) as usize;
    if footer_bytes.len() < 8 + id_len {
        return None;
    }
    let count = u32::from_le_bytes(
        footer_bytes[footer_bytes.len() - 8 - id_len..footer_bytes.len() - 4 - id_len]
            .try_into()
            .ok()?,
    ) as usize;
    let id_start = footer_bytes.len() - id_len;
    let identifier = std::str::from_utf8(&footer_bytes[id_start..]).ok()?;
    if identifier != expected_identifier {
        return None;
    }
    let pairs_end = footer_bytes.len() - 4 - 4 - id_len;
    if pairs_end != count * 16 {
        return None;
    }
    for chunk in footer_bytes[..pairs_end].chunks_exact(16) {
        let guest_start_offset = u64::from_le_bytes(chunk[0..8].try_into().ok()?);
        let file_offset = u64::from_le_bytes(chunk[8..16].try_into().ok()?);
        index.push((guest_start_offset, file_offset));
    }

    let mut out = Vec::with_capacity(index.len());
    for (guest_rip, file_offset) in index {
        let mut cursor = Cursor::new(&bytes[file_offset as usize..footer_start]);
        let guest_hash = cursor.read_u64::<LittleEndian>().ok()?;
        let guest_length = cursor.read_u32::<LittleEndian>().ok()?;

        let ir_len = cursor.read_u32::<LittleEndian>().ok()? as usize;
        let mut ir_bytes = vec![0u8; ir_len];
        cursor.read_exact(&mut ir_bytes).ok()?;
        let ir = decode_ir(&ir_bytes)?;

        let ra_len = cursor.read_u32::<LittleEndian>().ok()? as usize;
        let mut ra_bytes = vec![0u8; ra_len];
        cursor.read_exact(&mut ra_bytes).ok()?;
        let alloc = decode_alloc(&ra_bytes)?;

        out.push(OwnedEntry { guest_rip, guest_hash, guest_length, ir, alloc });
    }
    Some(out)
}

fn encode_ir(ir: &IrBlock) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(ir.consts.len() as u32).unwrap();
    for &c in &ir.consts {
        out.write_u64::<LittleEndian>(c).unwrap();
    }

    out.write_u32::<LittleEndian>(ir.nodes.len() as u32).unwrap();
    for node in &ir.nodes {
        out.write_u8(node.op as u8).unwrap();
        out.write_u8(node.reg_class as u8).unwrap();
        out.write_u8(node.element_size).unwrap();
        out.write_u8(node.num_elements).unwrap();
        out.write_u8(node.vector_mode.bits()).unwrap();
        for &operand in &node.operands {
            out.write_u32::<LittleEndian>(operand).unwrap();
        }
        out.write_u32::<LittleEndian>(node.imm).unwrap();
    }

    out.write_u32::<LittleEndian>(ir.regions.len() as u32).unwrap();
    for region in &ir.regions {
        out.write_u64::<LittleEndian>(region.guest_rip).unwrap();
        out.write_u32::<LittleEndian>(region.node_range.start).unwrap();
        out.write_u32::<LittleEndian>(region.node_range.end).unwrap();
        encode_exit(&mut out, &region.exit);
    }

    out.write_u64::<LittleEndian>(ir.guest_end_rip).unwrap();
    out
}

fn encode_exit(out: &mut Vec<u8>, exit: &BlockExit) {
    match *exit {
        BlockExit::Direct { next_rip } => {
            out.write_u8(0).unwrap();
            out.write_u64::<LittleEndian>(next_rip).unwrap();
        }
        BlockExit::Conditional { cond, taken_rip, not_taken_rip } => {
            out.write_u8(1).unwrap();
            out.write_u32::<LittleEndian>(cond).unwrap();
            out.write_u64::<LittleEndian>(taken_rip).unwrap();
            out.write_u64::<LittleEndian>(not_taken_rip).unwrap();
        }
        BlockExit::Indirect { target } => {
            out.write_u8(2).unwrap();
            out.write_u32::<LittleEndian>(target).unwrap();
        }
        BlockExit::Syscall { next_rip } => {
            out.write_u8(3).unwrap();
            out.write_u64::<LittleEndian>(next_rip).unwrap();
        }
        BlockExit::Halt { next_rip } => {
            out.write_u8(4).unwrap();
            out.write_u64::<LittleEndian>(next_rip).unwrap();
        }
    }
}

fn decode_ir(bytes: &[u8]) -> Option<IrBlock> {
    let mut cursor = Cursor::new(bytes);

    let num_consts = cursor.read_u32::<LittleEndian>().ok()? as usize;
    let mut consts = Vec::with_capacity(num_consts);
    for _ in 0..num_consts {
        consts.push(cursor.read_u64::<LittleEndian>().ok()?);
    }

    let num_nodes = cursor.read_u32::<LittleEndian>().ok()? as usize;
    let mut nodes = Vec::with_capacity(num_nodes);
    for _ in 0..num_nodes {
        let op = crate::ir::OpKind::from_raw(cursor.read_u8().ok()?);
        let reg_class = crate::ir::RegClass::from_raw(cursor.read_u8().ok()?);
        let element_size = cursor.read_u8().ok()?;
        let num_elements = cursor.read_u8().ok()?;
        let vector_mode = crate::ir::VectorMode::from_bits_truncate(cursor.read_u8().ok()?);
        let mut operands = [0u32; 3];
        for operand in &mut operands {
            *operand = cursor.read_u32::<LittleEndian>().ok()?;
        }
        let imm = cursor.read_u32::<LittleEndian>().ok()?;
        nodes.push(Node { op, reg_class, element_size, num_elements, vector_mode, operands, imm });
    }

    let num_regions = cursor.read_u32::<LittleEndian>().ok()? as usize;
    let mut regions = Vec::with_capacity(num_regions);
    for _ in 0..num_regions {
        let guest_rip = cursor.read_u64::<LittleEndian>().ok()?;
        let start = cursor.read_u32::<LittleEndian>().ok()?;
        let end = cursor.read_u32::<LittleEndian>().ok()?;
        let exit = decode_exit(&mut cursor)?;
        regions.push(Region { guest_rip, node_range: start..end, exit });
    }

    let guest_end_rip = cursor.read_u64::<LittleEndian>().ok()?;

    Some(IrBlock { nodes, consts, regions, guest_end_rip })
}

fn decode_exit(cursor: &mut Cursor<&[u8]>) -> Option<BlockExit> {
    Some(match cursor.read_u8().ok()? {
        0 => BlockExit::Direct { next_rip: cursor.read_u64::<LittleEndian>().ok()? },
        1 => BlockExit::Conditional {
            cond: cursor.read_u32::<LittleEndian>().ok()?,
            taken_rip: cursor.read_u64::<LittleEndian>().ok()?,
            not_taken_rip: cursor.read_u64::<LittleEndian>().ok()?,
        },
        2 => BlockExit::Indirect { target: cursor.read_u32::<LittleEndian>().ok()? },
        3 => BlockExit::Syscall { next_rip: cursor.read_u64::<LittleEndian>().ok()? },
        4 => BlockExit::Halt { next_rip: cursor.read_u64::<LittleEndian>().ok()? },
        _ => return None,
    })
}

fn encode_alloc(alloc: &Allocation) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(alloc.locations.len() as u32).unwrap();
    for loc in &alloc.locations {
        match *loc {
            Location::Gpr(reg) => {
                out.write_u8(0).unwrap();
                out.write_u32::<LittleEndian>(reg as u32).unwrap();
            }
            Location::Fpr(reg) => {
                out.write_u8(1).unwrap();
                out.write_u32::<LittleEndian>(reg as u32).unwrap();
            }
            Location::Spill(slot) => {
                out.write_u8(2).unwrap();
                out.write_u32::<LittleEndian>(slot).unwrap();
            }
        }
    }
    out
}

fn decode_alloc(bytes: &[u8]) -> Option<Allocation> {
    let mut cursor = Cursor::new(bytes);
    let count = cursor.read_u32::<LittleEndian>().ok()? as usize;
    let mut locations = Vec::with_capacity(count);
    for _ in 0..count {
        let loc = match cursor.read_u8().ok()? {
            0 => Location::Gpr(cursor.read_u32::<LittleEndian>().ok()? as u8),
            1 => Location::Fpr(cursor.read_u32::<LittleEndian>().ok()? as u8),
            2 => Location::Spill(cursor.read_u32::<LittleEndian>().ok()?),
            _ => return None,
        };
        locations.push(loc);
    }
    Some(Allocation { locations })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::RegClass;

    fn sample_entry() -> OwnedEntry {
        let mut ir = IrBlock::default();
        let c = ir.push_const(42);
        ir.regions.push(Region {
            guest_rip: 0x1000,
            node_range: 0..1,
            exit: BlockExit::Halt { next_rip: 0x1001 },
        });
        ir.guest_end_rip = 0x1001;
        let _ = c;
        let alloc = Allocation { locations: vec![Location::Gpr(3)] };
        OwnedEntry { guest_rip: 0x1000, guest_hash: 0xdead_beef, guest_length: 1, ir, alloc }
    }

    #[test]
    fn round_trips_a_single_entry_through_the_file_format() {
        let dir = std::env::temp_dir().join(format!("dbtx-aot-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cache.bin");

        let entries = vec![sample_entry()];
        let bytes = encode_file("test-binary-deadbeef-00", &entries);
        std::fs::write(&path, &bytes).unwrap();

        let loaded = read_file(&path, "test-binary-deadbeef-00").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].guest_rip, 0x1000);
        assert_eq!(loaded[0].guest_hash, 0xdead_beef);
        assert_eq!(loaded[0].ir.consts, vec![42]);
        assert_eq!(loaded[0].ir.regions.len(), 1);
        assert!(matches!(loaded[0].ir.regions[0].exit, BlockExit::Halt { next_rip: 0x1001 }));
        assert_eq!(loaded[0].alloc.locations.len(), 1);
        assert!(matches!(loaded[0].alloc.locations[0], Location::Gpr(3)));

        let _ = RegClass::Gpr;
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn mismatched_identifier_is_treated_as_absent() {
        let dir = std::env::temp_dir().join(format!("dbtx-aot-test-mismatch-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cache.bin");
        std::fs::write(&path, encode_file("written-as-this", &[sample_entry()])).unwrap();

        assert!(read_file(&path, "expected-something-else").is_none());
        std::fs::remove_dir_all(&dir).ok();
    }
}
