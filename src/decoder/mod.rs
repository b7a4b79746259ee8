//! The x86/x86-64 stream decoder (§4.B). Given guest bytes at a RIP, [`decode_one`] consumes the
//! legacy prefix stream, any REX/VEX extended-prefix byte(s), the opcode, ModR/M, SIB and
//! immediate/displacement bytes, and returns a [`DecodedOp`] that [`crate::lifter`] turns into IR.

pub mod opcodes;

use crate::error::Error;
pub use opcodes::Mnemonic;

/// Which addressing mode the guest is currently running in. 32-bit mode only ever exposes eight
/// general-purpose registers and has no REX byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    X86,
    X86_64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperandKind {
    Register,
    Memory,
    Immediate,
}

/// A single decoded operand. Memory operands are expressed in `base + index*scale + disp` form;
/// the lifter is responsible for turning that into an IR address computation.
#[derive(Clone, Copy, Debug)]
pub struct Operand {
    pub kind: OperandKind,
    pub size: u8,
    /// Register/immediate index, or the `rm`-encoded base register for memory operands.
    pub index: u8,
    pub base: Option<u8>,
    pub scale: u8,
    pub disp: i32,
    pub segment_override: Option<u8>,
}

impl Operand {
    pub(crate) fn register(index: u8, size: u8) -> Self {
        Self {
            kind: OperandKind::Register,
            size,
            index,
            base: None,
            scale: 1,
            disp: 0,
            segment_override: None,
        }
    }

    pub(crate) fn immediate(value: i32, size: u8) -> Self {
        Self {
            kind: OperandKind::Immediate,
            size,
            index: 0,
            base: None,
            scale: 1,
            disp: value,
            segment_override: None,
        }
    }
}

bitflags::bitflags! {
    pub struct Prefixes: u16 {
        const LOCK       = 1 << 0;
        const REP        = 1 << 1;
        const REPNE      = 1 << 2;
        const OPSIZE     = 1 << 3; // 0x66
        const ADDRSIZE   = 1 << 4; // 0x67
        const SEG_CS     = 1 << 5;
        const SEG_SS     = 1 << 6;
        const SEG_DS     = 1 << 7;
        const SEG_ES     = 1 << 8;
        const SEG_FS     = 1 << 9;
        const SEG_GS     = 1 << 10;
        const REX        = 1 << 11;
        const REX_W      = 1 << 12;
        const REX_R      = 1 << 13;
        const REX_X      = 1 << 14;
        const REX_B      = 1 << 15;
    }
}

/// A normalized VEX/XOP extended prefix record (§4.B), regardless of whether it was encoded with
/// the 2-byte (C5) or 3-byte (C4) form.
#[derive(Clone, Copy, Debug)]
pub struct VexInfo {
    /// The `vvvv` field, already inverted: the encoded source register, or `0b1111` when unused.
    pub vvvv: u8,
    /// `L` bit: selects 256-bit (true) vs 128-bit (false) vector length.
    pub wide: bool,
    pub w: bool,
    /// Selects which two/three-byte opcode map the trailing opcode byte indexes into.
    pub map_select: u8,
    pub pp: u8,
}

/// The decoded instruction, ready for [`crate::lifter`] to turn into IR.
#[derive(Clone, Debug)]
pub struct DecodedOp {
    pub rip: u64,
    pub mnemonic: Mnemonic,
    pub prefixes: Prefixes,
    pub vex: Option<VexInfo>,
    pub operand_size: u8,
    pub address_size: u8,
    pub operands: Vec<Operand>,
    pub next_ip: u64,
}

pub(crate) struct Cursor<'a> {
    pub(crate) bytes: &'a [u8],
    pub(crate) pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn u8(&mut self) -> Result<u8, ()> {
        let b = *self.bytes.get(self.pos).ok_or(())?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn i8(&mut self) -> Result<i8, ()> {
        Ok(self.u8()? as i8)
    }

    pub(crate) fn i32(&mut self) -> Result<i32, ()> {
        let bytes = self.bytes.get(self.pos..self.pos + 4).ok_or(())?;
        self.pos += 4;
        Ok(i32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub(crate) fn i16(&mut self) -> Result<i16, ()> {
        let bytes = self.bytes.get(self.pos..self.pos + 2).ok_or(())?;
        self.pos += 2;
        Ok(i16::from_le_bytes(bytes.try_into().unwrap()))
    }
}

/// Decodes exactly one instruction starting at `rip`, reading from `bytes` (which must start at
/// `rip` and extend at least `max_length` bytes, or to the end of the buffer if shorter).
pub fn decode_one(bytes: &[u8], rip: u64, mode: Mode) -> Result<DecodedOp, Error> {
    let mut cur = Cursor { bytes, pos: 0 };
    let mut prefixes = Prefixes::empty();

    // Legacy prefix loop (§4.B).
    loop {
        let byte = match cur.bytes.get(cur.pos) {
            Some(b) => *b,
            None => return Err(Error::Decode { rip }),
        };
        let flag = match byte {
            0xf0 => Prefixes::LOCK,
            0xf3 => Prefixes::REP,
            0xf2 => Prefixes::REPNE,
            0x66 => Prefixes::OPSIZE,
            0x67 => Prefixes::ADDRSIZE,
            0x2e => Prefixes::SEG_CS,
            0x36 => Prefixes::SEG_SS,
            0x3e => Prefixes::SEG_DS,
            0x26 => Prefixes::SEG_ES,
            0x64 => Prefixes::SEG_FS,
            0x65 => Prefixes::SEG_GS,
            _ => break,
        };
        prefixes |= flag;
        cur.pos += 1;
    }

    // REX, x86-64 only, must immediately precede the opcode.
    if mode == Mode::X86_64 {
        if let Some(&byte) = cur.bytes.get(cur.pos) {
            if (0x40..=0x4f).contains(&byte) {
                prefixes |= Prefixes::REX;
                if byte & 0x8 != 0 {
                    prefixes |= Prefixes::REX_W;
                }
                if byte & 0x4 != 0 {
                    prefixes |= Prefixes::REX_R;
                }
                if byte & 0x2 != 0 {
                    prefixes |= Prefixes::REX_X;
                }
                if byte & 0x1 != 0 {
                    prefixes |= Prefixes::REX_B;
                }
                cur.pos += 1;
            }
        }
    }

    // VEX (C4/C5). A VEX prefix with any LOCK/66/F2/F3 legacy prefix already consumed above is
    // an illegal encoding (§4.B tie-break rule).
    let mut vex = None;
    if let Some(&byte) = cur.bytes.get(cur.pos) {
        if byte == 0xc5 || byte == 0xc4 {
            if prefixes.intersects(
                Prefixes::LOCK | Prefixes::OPSIZE | Prefixes::REPNE | Prefixes::REP,
            ) || prefixes.contains(Prefixes::REX)
            {
                return Err(Error::IllegalPrefixCombo { rip });
            }
            cur.pos += 1;
            vex = Some(decode_vex(&mut cur, byte, rip)?);
        }
    }

    let rex_w = prefixes.contains(Prefixes::REX_W);
    let opsize_override = prefixes.contains(Prefixes::OPSIZE);
    let operand_size: u8 = if rex_w {
        8
    } else if opsize_override {
        2
    } else {
        4
    };
    let address_size: u8 = if mode == Mode::X86_64 {
        if prefixes.contains(Prefixes::ADDRSIZE) {
            4
        } else {
            8
        }
    } else if prefixes.contains(Prefixes::ADDRSIZE) {
        2
    } else {
        4
    };

    let opcode_byte = cur.u8().map_err(|_| Error::Decode { rip })?;
    let (mnemonic, operands) = opcodes::decode(
        &mut cur,
        opcode_byte,
        vex.as_ref(),
        &prefixes,
        operand_size,
        address_size,
        rip,
    )?;

    Ok(DecodedOp {
        rip,
        mnemonic,
        prefixes,
        vex,
        operand_size,
        address_size,
        operands,
        next_ip: rip + cur.pos as u64,
    })
}

fn decode_vex(cur: &mut Cursor, leading: u8, rip: u64) -> Result<VexInfo, Error> {
    if leading == 0xc5 {
        // 2-byte VEX: only accesses the 0F map, always REX.X=REX.B=0, W=0.
        let byte = cur.u8().map_err(|_| Error::Decode { rip })?;
        Ok(VexInfo {
            vvvv: (!byte >> 3) & 0xf,
            wide: byte & 0x4 != 0,
            w: false,
            map_select: 1,
            pp: byte & 0x3,
        })
    } else {
        let byte1 = cur.u8().map_err(|_| Error::Decode { rip })?;
        let byte2 = cur.u8().map_err(|_| Error::Decode { rip })?;
        Ok(VexInfo {
            vvvv: (!byte2 >> 3) & 0xf,
            wide: byte2 & 0x4 != 0,
            w: byte2 & 0x80 != 0,
            map_select: byte1 & 0x1f,
            pp: byte2 & 0x3,
        })
    }
}

/// ModR/M + SIB decoding (§4.B), shared by every opcode table entry that takes a memory/register
/// `rm` operand.
pub(crate) fn decode_modrm(
    cur: &mut Cursor,
    address_size: u8,
    prefixes: &Prefixes,
    reg_size: u8,
    rip: u64,
) -> Result<(Operand, u8), Error> {
    let modrm = cur.u8().map_err(|_| Error::Decode { rip })?;
    let md = modrm >> 6;
    let reg = ((modrm >> 3) & 0x7) | if prefixes.contains(Prefixes::REX_R) { 0x8 } else { 0 };
    let rm_field = modrm & 0x7;

    if md == 0b11 {
        let rm = rm_field | if prefixes.contains(Prefixes::REX_B) { 0x8 } else { 0 };
        return Ok((Operand::register(rm, reg_size), reg));
    }

    let (base, index, scale, mut disp_size) = if rm_field == 0b100 {
        let sib = cur.u8().map_err(|_| Error::Decode { rip })?;
        let scale = 1u8 << (sib >> 6);
        let index_field = ((sib >> 3) & 0x7) | if prefixes.contains(Prefixes::REX_X) { 0x8 } else { 0 };
        let base_field = (sib & 0x7) | if prefixes.contains(Prefixes::REX_B) { 0x8 } else { 0 };
        let index = if index_field == 0b100 { None } else { Some(index_field) };
        if (sib & 0x7) == 0b101 && md == 0b00 {
            (None, index, scale, 4)
        } else {
            (Some(base_field), index, scale, 0)
        }
    } else if rm_field == 0b101 && md == 0b00 {
        // RIP-relative addressing in 64-bit mode.
        (None, None, 1, 4)
    } else {
        let base = rm_field | if prefixes.contains(Prefixes::REX_B) { 0x8 } else { 0 };
        (Some(base), None, 1, 0)
    };

    if md == 0b01 {
        disp_size = 1;
    } else if md == 0b10 {
        disp_size = 4;
    }

    let disp = match disp_size {
        1 => cur.i8().map_err(|_| Error::Decode { rip })? as i32,
        2 => cur.i16().map_err(|_| Error::Decode { rip })? as i32,
        4 => cur.i32().map_err(|_| Error::Decode { rip })?,
        _ => 0,
    };

    let segment_override = segment_from_prefixes(prefixes);

    let _ = address_size;
    Ok((
        Operand {
            kind: OperandKind::Memory,
            size: reg_size,
            index: index.unwrap_or(0),
            base,
            scale: if index.is_some() { scale } else { 1 },
            disp,
            segment_override,
        },
        reg,
    ))
}

fn segment_from_prefixes(prefixes: &Prefixes) -> Option<u8> {
    if prefixes.contains(Prefixes::SEG_FS) {
        Some(4)
    } else if prefixes.contains(Prefixes::SEG_GS) {
        Some(5)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_nop_and_hlt() {
        let bytes = [0x90u8, 0xf4];
        let op = decode_one(&bytes, 0, Mode::X86_64).unwrap();
        assert_eq!(op.mnemonic, Mnemonic::Nop);
        assert_eq!(op.next_ip, 1);

        let op = decode_one(&bytes[1..], 1, Mode::X86_64).unwrap();
        assert_eq!(op.mnemonic, Mnemonic::Hlt);
        assert_eq!(op.next_ip, 2);
    }

    #[test]
    fn decodes_mov_rax_imm32_with_rex_w() {
        // 48 c7 c0 01 00 00 00  => mov rax, 1
        let bytes = [0x48, 0xc7, 0xc0, 0x01, 0x00, 0x00, 0x00];
        let op = decode_one(&bytes, 0x1000, Mode::X86_64).unwrap();
        assert_eq!(op.mnemonic, Mnemonic::MovImm);
        assert_eq!(op.operand_size, 8);
        assert_eq!(op.next_ip, 0x1007);
    }

    #[test]
    fn vex_with_illegal_lock_prefix_is_rejected() {
        // F0 (lock) C5 F8 58 C1  => lock vaddps xmm0, xmm0, xmm1 (illegal: VEX cannot take LOCK)
        let bytes = [0xf0, 0xc5, 0xf8, 0x58, 0xc1];
        let err = decode_one(&bytes, 0, Mode::X86_64).unwrap_err();
        assert!(matches!(err, Error::IllegalPrefixCombo { .. }));
    }

    #[test]
    fn decodes_two_byte_vex_vaddss() {
        // C5 FA 58 C1 => vaddss xmm0, xmm1, xmm1 (pp=F3 scalar single)
        let bytes = [0xc5, 0xfa, 0x58, 0xc1];
        let op = decode_one(&bytes, 0, Mode::X86_64).unwrap();
        assert_eq!(op.mnemonic, Mnemonic::VAddSs);
        assert!(op.vex.is_some());
        assert!(!op.vex.unwrap().wide);
    }
}
