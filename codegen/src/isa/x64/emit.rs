//! x86-64 binary encoding.
//!
//! One entry point, [`emit_inst`], encodes an [`InstNode`] whose register
//! operands are all physical into the current section, recording fixups for
//! label operands. Displacement fields always sit at the end of the
//! encoding, so the rel8/rel32 formulas in the relocation resolver line up
//! with the hardware's next-instruction-relative semantics.

use crate::buffer::CodeBuffer;
use crate::ir::{InstId, InstNode};
use crate::label::{Label, LabelManager, RelocKind};
use crate::operand::{Mem, Operand, Reg, RegType};
use crate::result::{CodegenResult, Error};
use crate::support::{fits_i32, fits_i8};

use super::X64Inst;

/// Encode the ModR/M byte.
#[inline]
fn encode_modrm(m0d: u8, reg_g: u8, rm_e: u8) -> u8 {
    debug_assert!(m0d < 4);
    ((m0d & 3) << 6) | ((reg_g & 7) << 3) | (rm_e & 7)
}

/// Encode the SIB byte (scale-index-base).
#[inline]
fn encode_sib(scale_log2: u8, index: u8, base: u8) -> u8 {
    debug_assert!(scale_log2 < 4);
    ((scale_log2 & 3) << 6) | ((index & 7) << 3) | (base & 7)
}

/// Operand width in bits for a gp register type.
fn gp_bits(rtype: RegType) -> u8 {
    match rtype {
        RegType::Gp8Lo | RegType::Gp8Hi => 8,
        RegType::Gp16 => 16,
        RegType::Gp32 => 32,
        _ => 64,
    }
}

/// ModRM/SIB encoding id of a register operand.
fn enc(reg: Reg) -> u8 {
    debug_assert!(!reg.is_virt(), "virtual register reached the encoder");
    match reg.rtype() {
        // ah/ch/dh/bh occupy encodings 4-7 of the no-REX byte file.
        RegType::Gp8Hi => reg.phys_id() + 4,
        _ => reg.phys_id(),
    }
}

/// A REX prefix under construction.
#[derive(Clone, Copy, Default)]
struct RexFlags {
    wide: bool,
    always_emit: bool,
}

impl RexFlags {
    fn set_w() -> Self {
        Self { wide: true, always_emit: false }
    }

    fn clear_w() -> Self {
        Self::default()
    }

    fn from_bits(bits: u8) -> Self {
        if bits == 64 { Self::set_w() } else { Self::clear_w() }
    }

    /// spl/bpl/sil/dil need a REX prefix even when all extension bits are
    /// clear.
    fn always_emit_if_8bit_needed(&mut self, reg: Reg) {
        if reg.rtype() == RegType::Gp8Lo && (4..=7).contains(&reg.phys_id()) {
            self.always_emit = true;
        }
    }

    fn emit(self, buf: &mut CodeBuffer, reg_g: u8, index: u8, base: u8) {
        let w = u8::from(self.wide);
        let r = (reg_g >> 3) & 1;
        let x = (index >> 3) & 1;
        let b = (base >> 3) & 1;
        let rex = 0x40 | (w << 3) | (r << 2) | (x << 1) | b;
        if rex != 0x40 || self.always_emit {
            buf.put1(rex);
        }
    }
}

/// Emit the 0x66 operand-size prefix for 16-bit forms.
fn emit_osize(buf: &mut CodeBuffer, bits: u8) {
    if bits == 16 {
        buf.put1(0x66);
    }
}

/// Emit ModRM (+SIB, +disp) for a register `rm` operand.
fn emit_modrm_reg(buf: &mut CodeBuffer, reg_g: u8, rm: u8) {
    buf.put1(encode_modrm(0b11, reg_g, rm));
}

/// Emit ModRM (+SIB) and displacement for a memory operand.
fn emit_modrm_mem(buf: &mut CodeBuffer, reg_g: u8, mem: &Mem) -> CodegenResult<()> {
    let disp = mem.disp;
    match (mem.base, mem.index) {
        (Some(base), None) => {
            let base_e = enc(base);
            if base_e & 7 == 4 {
                // rsp/r12 as base always takes a SIB byte.
                let (m0d, w) = disp_mod(disp, base_e);
                buf.put1(encode_modrm(m0d, reg_g, 4));
                buf.put1(encode_sib(0, 4, base_e));
                emit_disp(buf, w, disp);
            } else {
                let (m0d, w) = disp_mod(disp, base_e);
                buf.put1(encode_modrm(m0d, reg_g, base_e));
                emit_disp(buf, w, disp);
            }
        }
        (Some(base), Some(index)) => {
            let base_e = enc(base);
            let index_e = enc(index);
            if index_e & 7 == 4 && index_e < 8 {
                // rsp cannot be an index.
                return Err(Error::InvalidArgument);
            }
            let (m0d, w) = disp_mod(disp, base_e);
            buf.put1(encode_modrm(m0d, reg_g, 4));
            buf.put1(encode_sib(scale_log2(mem.scale), index_e, base_e));
            emit_disp(buf, w, disp);
        }
        (None, Some(index)) => {
            let index_e = enc(index);
            buf.put1(encode_modrm(0b00, reg_g, 4));
            buf.put1(encode_sib(scale_log2(mem.scale), index_e, 5));
            buf.put4(disp as u32);
        }
        (None, None) => {
            // Absolute disp32 via SIB with no base.
            buf.put1(encode_modrm(0b00, reg_g, 4));
            buf.put1(encode_sib(0, 4, 5));
            buf.put4(disp as u32);
        }
    }
    Ok(())
}

fn scale_log2(scale: u8) -> u8 {
    match scale {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => unreachable!("scale validated at operand construction"),
    }
}

/// Pick the mod field and displacement width for a [base+disp] form.
fn disp_mod(disp: i32, base_e: u8) -> (u8, u8) {
    if disp == 0 && base_e & 7 != 5 {
        (0b00, 0)
    } else if fits_i8(disp as i64) {
        (0b01, 1)
    } else {
        (0b10, 4)
    }
}

fn emit_disp(buf: &mut CodeBuffer, width: u8, disp: i32) {
    match width {
        0 => {}
        1 => buf.put1(disp as u8),
        _ => buf.put4(disp as u32),
    }
}

/// REX bits of a memory operand: (index, base) encodings.
fn mem_rex_ids(mem: &Mem) -> (u8, u8) {
    let index = mem.index.map_or(0, enc);
    let base = mem.base.map_or(0, enc);
    (index, base)
}

/// Emit a two- or three-byte VEX prefix.
///
/// `pp`: 0=none 1=66 2=F3 3=F2; `mmmmm`: 1=0F 2=0F38 3=0F3A; `l`: 0=128
/// 1=256; `vvvv` is the extra source register, inverted in the prefix.
#[allow(clippy::too_many_arguments)]
fn emit_vex(
    buf: &mut CodeBuffer,
    reg_g: u8,
    index: u8,
    base: u8,
    mmmmm: u8,
    w: bool,
    vvvv: u8,
    l: u8,
    pp: u8,
) {
    let r = (reg_g >> 3) & 1;
    let x = (index >> 3) & 1;
    let b = (base >> 3) & 1;
    if x == 0 && b == 0 && !w && mmmmm == 1 {
        buf.put1(0xC5);
        buf.put1(((!r & 1) << 7) | ((!vvvv & 0xf) << 3) | (l << 2) | pp);
    } else {
        buf.put1(0xC4);
        buf.put1(((!r & 1) << 7) | ((!x & 1) << 6) | ((!b & 1) << 5) | mmmmm);
        buf.put1((u8::from(w) << 7) | ((!vvvv & 0xf) << 3) | (l << 2) | pp);
    }
}

/// Record a fixup at the current offset and emit a zero placeholder.
fn emit_label_field(
    buf: &mut CodeBuffer,
    labels: &mut LabelManager,
    label: Label,
    kind: RelocKind,
) -> CodegenResult<()> {
    labels.add_fixup(label, buf.current(), buf.offset(), kind, 0)?;
    match kind.patch_size() {
        1 => buf.put1(0),
        4 => buf.put4(0),
        8 => buf.put8(0),
        _ => unreachable!(),
    }
    Ok(())
}

/// Group-1 ALU instructions share their encoding shape; `base` is the
/// (r/m, r) opcode and `digit` the /digit of the immediate form.
struct AluOp {
    base: u8,
    digit: u8,
}

fn alu_op(inst: X64Inst) -> Option<AluOp> {
    Some(match inst {
        X64Inst::Add => AluOp { base: 0x00, digit: 0 },
        X64Inst::Or => AluOp { base: 0x08, digit: 1 },
        X64Inst::And => AluOp { base: 0x20, digit: 4 },
        X64Inst::Sub => AluOp { base: 0x28, digit: 5 },
        X64Inst::Xor => AluOp { base: 0x30, digit: 6 },
        X64Inst::Cmp => AluOp { base: 0x38, digit: 7 },
        _ => return None,
    })
}

/// Emit opcode + modrm for the common (reg_g, rm_reg|rm_mem) shape with a
/// REX computed from the operands.
fn emit_rm(
    buf: &mut CodeBuffer,
    rex: RexFlags,
    opcode: &[u8],
    reg_g: u8,
    rm: &Operand,
) -> CodegenResult<()> {
    match rm {
        Operand::Reg(r) => {
            let mut rex = rex;
            rex.always_emit_if_8bit_needed(*r);
            rex.emit(buf, reg_g, 0, enc(*r));
            buf.put_bytes(opcode);
            emit_modrm_reg(buf, reg_g, enc(*r));
        }
        Operand::Mem(m) => {
            let (index, base) = mem_rex_ids(m);
            rex.emit(buf, reg_g, index, base);
            buf.put_bytes(opcode);
            emit_modrm_mem(buf, reg_g, m)?;
        }
        _ => return Err(Error::InvalidArgument),
    }
    Ok(())
}

/// Encode one instruction into the buffer.
pub fn emit_inst(
    node: &InstNode,
    buf: &mut CodeBuffer,
    labels: &mut LabelManager,
) -> CodegenResult<()> {
    let inst = match node.inst {
        InstId::X64(i) => i,
        #[cfg(feature = "aarch64")]
        _ => return Err(Error::InvalidArch),
    };
    let ops = &node.operands;

    match inst {
        X64Inst::Mov => match (&ops[0], &ops[1]) {
            (Operand::Reg(dst), Operand::Reg(src)) => {
                let bits = gp_bits(dst.rtype());
                emit_osize(buf, bits);
                let opcode: &[u8] = if bits == 8 { &[0x88] } else { &[0x89] };
                let mut rex = RexFlags::from_bits(bits);
                rex.always_emit_if_8bit_needed(*dst);
                rex.always_emit_if_8bit_needed(*src);
                emit_rm(buf, rex, opcode, enc(*src), &Operand::Reg(*dst))
            }
            (Operand::Reg(dst), Operand::Mem(m)) => {
                let bits = if m.size != 0 { m.size * 8 } else { gp_bits(dst.rtype()) };
                emit_osize(buf, bits);
                let opcode: &[u8] = if bits == 8 { &[0x8A] } else { &[0x8B] };
                emit_rm(buf, RexFlags::from_bits(bits), opcode, enc(*dst), &ops[1])
            }
            (Operand::Mem(m), Operand::Reg(src)) => {
                let bits = if m.size != 0 { m.size * 8 } else { gp_bits(src.rtype()) };
                emit_osize(buf, bits);
                let opcode: &[u8] = if bits == 8 { &[0x88] } else { &[0x89] };
                let mut rex = RexFlags::from_bits(bits);
                rex.always_emit_if_8bit_needed(*src);
                emit_rm(buf, rex, opcode, enc(*src), &ops[0])
            }
            (Operand::Reg(dst), Operand::Imm(imm)) => {
                let bits = imm.width.unwrap_or(gp_bits(dst.rtype()));
                let value = imm.value;
                match bits {
                    8 => {
                        let mut rex = RexFlags::clear_w();
                        rex.always_emit_if_8bit_needed(*dst);
                        rex.emit(buf, 0, 0, enc(*dst));
                        buf.put1(0xB0 + (enc(*dst) & 7));
                        buf.put1(value as u8);
                    }
                    16 => {
                        buf.put1(0x66);
                        RexFlags::clear_w().emit(buf, 0, 0, enc(*dst));
                        buf.put1(0xB8 + (enc(*dst) & 7));
                        buf.put2(value as u16);
                    }
                    32 => {
                        RexFlags::clear_w().emit(buf, 0, 0, enc(*dst));
                        buf.put1(0xB8 + (enc(*dst) & 7));
                        buf.put4(value as u32);
                    }
                    _ => {
                        if fits_i32(value) {
                            // Sign-extended c7 /0 keeps the encoding short.
                            RexFlags::set_w().emit(buf, 0, 0, enc(*dst));
                            buf.put1(0xC7);
                            emit_modrm_reg(buf, 0, enc(*dst));
                            buf.put4(value as u32);
                        } else {
                            RexFlags::set_w().emit(buf, 0, 0, enc(*dst));
                            buf.put1(0xB8 + (enc(*dst) & 7));
                            buf.put8(value as u64);
                        }
                    }
                }
                Ok(())
            }
            (Operand::Mem(m), Operand::Imm(imm)) => {
                let bits = imm.width.unwrap_or(if m.size != 0 { m.size * 8 } else { 32 });
                emit_osize(buf, bits);
                let rex = RexFlags::from_bits(bits);
                let opcode: &[u8] = if bits == 8 { &[0xC6] } else { &[0xC7] };
                emit_rm(buf, rex, opcode, 0, &ops[0])?;
                match bits {
                    8 => buf.put1(imm.value as u8),
                    16 => buf.put2(imm.value as u16),
                    _ => buf.put4(imm.value as u32),
                }
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        },

        X64Inst::Movzx => {
            let (dst, src) = (reg_op(&ops[0])?, &ops[1]);
            let src_bits = match src {
                Operand::Reg(r) => gp_bits(r.rtype()),
                Operand::Mem(m) => m.size * 8,
                _ => return Err(Error::InvalidArgument),
            };
            let opcode: &[u8] = match src_bits {
                8 => &[0x0F, 0xB6],
                16 => &[0x0F, 0xB7],
                _ => return Err(Error::InvalidArgument),
            };
            let rex = RexFlags::from_bits(gp_bits(dst.rtype()));
            emit_rm(buf, rex, opcode, enc(dst), src)
        }

        X64Inst::Add | X64Inst::Or | X64Inst::And | X64Inst::Sub | X64Inst::Xor | X64Inst::Cmp => {
            let op = alu_op(inst).unwrap();
            match (&ops[0], &ops[1]) {
                (Operand::Reg(dst), Operand::Reg(src)) => {
                    let bits = gp_bits(dst.rtype());
                    emit_osize(buf, bits);
                    let opcode = if bits == 8 { op.base } else { op.base + 1 };
                    let mut rex = RexFlags::from_bits(bits);
                    rex.always_emit_if_8bit_needed(*dst);
                    rex.always_emit_if_8bit_needed(*src);
                    emit_rm(buf, rex, &[opcode], enc(*src), &Operand::Reg(*dst))
                }
                (Operand::Reg(dst), Operand::Mem(_)) => {
                    let bits = gp_bits(dst.rtype());
                    emit_osize(buf, bits);
                    let opcode = if bits == 8 { op.base + 2 } else { op.base + 3 };
                    emit_rm(buf, RexFlags::from_bits(bits), &[opcode], enc(*dst), &ops[1])
                }
                (Operand::Mem(m), Operand::Reg(src)) => {
                    let bits = if m.size != 0 { m.size * 8 } else { gp_bits(src.rtype()) };
                    emit_osize(buf, bits);
                    let opcode = if bits == 8 { op.base } else { op.base + 1 };
                    emit_rm(buf, RexFlags::from_bits(bits), &[opcode], enc(*src), &ops[0])
                }
                (Operand::Reg(dst), Operand::Imm(imm)) => {
                    let bits = gp_bits(dst.rtype());
                    emit_osize(buf, bits);
                    let rex = RexFlags::from_bits(bits);
                    if bits != 8 && fits_i8(imm.value) {
                        emit_rm(buf, rex, &[0x83], op.digit, &ops[0])?;
                        buf.put1(imm.value as u8);
                    } else if bits == 8 {
                        emit_rm(buf, rex, &[0x80], op.digit, &ops[0])?;
                        buf.put1(imm.value as u8);
                    } else {
                        if !fits_i32(imm.value) {
                            return Err(Error::InvalidArgument);
                        }
                        emit_rm(buf, rex, &[0x81], op.digit, &ops[0])?;
                        if bits == 16 {
                            buf.put2(imm.value as u16);
                        } else {
                            buf.put4(imm.value as u32);
                        }
                    }
                    Ok(())
                }
                (Operand::Mem(m), Operand::Imm(imm)) => {
                    let bits = if m.size != 0 { m.size * 8 } else { 32 };
                    emit_osize(buf, bits);
                    let rex = RexFlags::from_bits(bits);
                    if bits != 8 && fits_i8(imm.value) {
                        emit_rm(buf, rex, &[0x83], op.digit, &ops[0])?;
                        buf.put1(imm.value as u8);
                    } else {
                        emit_rm(buf, rex, &[if bits == 8 { 0x80 } else { 0x81 }], op.digit, &ops[0])?;
                        if bits == 8 {
                            buf.put1(imm.value as u8);
                        } else if bits == 16 {
                            buf.put2(imm.value as u16);
                        } else {
                            buf.put4(imm.value as u32);
                        }
                    }
                    Ok(())
                }
                _ => Err(Error::InvalidArgument),
            }
        }

        X64Inst::Test => match (&ops[0], &ops[1]) {
            (Operand::Reg(a), Operand::Reg(b)) => {
                let bits = gp_bits(a.rtype());
                emit_osize(buf, bits);
                let opcode: &[u8] = if bits == 8 { &[0x84] } else { &[0x85] };
                emit_rm(buf, RexFlags::from_bits(bits), opcode, enc(*b), &ops[0])
            }
            (Operand::Reg(a), Operand::Imm(imm)) => {
                let bits = gp_bits(a.rtype());
                emit_osize(buf, bits);
                let opcode: &[u8] = if bits == 8 { &[0xF6] } else { &[0xF7] };
                emit_rm(buf, RexFlags::from_bits(bits), opcode, 0, &ops[0])?;
                match bits {
                    8 => buf.put1(imm.value as u8),
                    16 => buf.put2(imm.value as u16),
                    _ => buf.put4(imm.value as u32),
                }
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        },

        X64Inst::IMul => {
            let dst = reg_op(&ops[0])?;
            let bits = gp_bits(dst.rtype());
            emit_osize(buf, bits);
            emit_rm(buf, RexFlags::from_bits(bits), &[0x0F, 0xAF], enc(dst), &ops[1])
        }

        X64Inst::Shl | X64Inst::Shr | X64Inst::Sar => {
            let digit = match inst {
                X64Inst::Shl => 4,
                X64Inst::Shr => 5,
                _ => 7,
            };
            let dst_bits = match &ops[0] {
                Operand::Reg(r) => gp_bits(r.rtype()),
                Operand::Mem(m) => m.size * 8,
                _ => return Err(Error::InvalidArgument),
            };
            emit_osize(buf, dst_bits);
            let rex = RexFlags::from_bits(dst_bits);
            match &ops[1] {
                Operand::Imm(imm) => {
                    if imm.value == 1 {
                        emit_rm(buf, rex, &[if dst_bits == 8 { 0xD0 } else { 0xD1 }], digit, &ops[0])
                    } else {
                        emit_rm(buf, rex, &[if dst_bits == 8 { 0xC0 } else { 0xC1 }], digit, &ops[0])?;
                        buf.put1(imm.value as u8);
                        Ok(())
                    }
                }
                Operand::Reg(count) => {
                    // The count register must already be cl.
                    if enc(*count) != 1 {
                        return Err(Error::InvalidAssignment);
                    }
                    emit_rm(buf, rex, &[if dst_bits == 8 { 0xD2 } else { 0xD3 }], digit, &ops[0])
                }
                _ => Err(Error::InvalidArgument),
            }
        }

        X64Inst::Inc | X64Inst::Dec => {
            let digit = if inst == X64Inst::Inc { 0 } else { 1 };
            let bits = op_bits(&ops[0])?;
            emit_osize(buf, bits);
            let opcode: &[u8] = if bits == 8 { &[0xFE] } else { &[0xFF] };
            emit_rm(buf, RexFlags::from_bits(bits), opcode, digit, &ops[0])
        }

        X64Inst::Neg | X64Inst::Not => {
            let digit = if inst == X64Inst::Neg { 3 } else { 2 };
            let bits = op_bits(&ops[0])?;
            emit_osize(buf, bits);
            let opcode: &[u8] = if bits == 8 { &[0xF6] } else { &[0xF7] };
            emit_rm(buf, RexFlags::from_bits(bits), opcode, digit, &ops[0])
        }

        X64Inst::Lea => {
            let dst = reg_op(&ops[0])?;
            let rex = RexFlags::from_bits(gp_bits(dst.rtype()));
            match &ops[1] {
                Operand::Mem(_) => emit_rm(buf, rex, &[0x8D], enc(dst), &ops[1]),
                Operand::Label(l) => {
                    // RIP-relative lea: modrm mod=00 rm=101, disp patched.
                    rex.emit(buf, enc(dst), 0, 0);
                    buf.put1(0x8D);
                    buf.put1(encode_modrm(0b00, enc(dst), 5));
                    emit_label_field(buf, labels, *l, RelocKind::RipRel32)
                }
                _ => Err(Error::InvalidArgument),
            }
        }

        X64Inst::Push | X64Inst::Pop => {
            let base = if inst == X64Inst::Push { 0x50 } else { 0x58 };
            let reg = reg_op(&ops[0])?;
            // 64-bit push/pop never takes REX.W.
            RexFlags::clear_w().emit(buf, 0, 0, enc(reg));
            buf.put1(base + (enc(reg) & 7));
            Ok(())
        }

        X64Inst::Xchg => {
            let (a, b) = (reg_op(&ops[0])?, reg_op(&ops[1])?);
            let bits = gp_bits(a.rtype());
            emit_osize(buf, bits);
            let opcode: &[u8] = if bits == 8 { &[0x86] } else { &[0x87] };
            emit_rm(buf, RexFlags::from_bits(bits), opcode, enc(b), &ops[0])
        }

        X64Inst::Call => match &ops[0] {
            Operand::Label(l) => {
                buf.put1(0xE8);
                emit_label_field(buf, labels, *l, RelocKind::Rel32)
            }
            Operand::Reg(r) => {
                RexFlags::clear_w().emit(buf, 2, 0, enc(*r));
                buf.put1(0xFF);
                emit_modrm_reg(buf, 2, enc(*r));
                Ok(())
            }
            Operand::Imm(imm) => {
                // Absolute targets go through the reserved scratch register.
                let r10 = super::regs::r10();
                RexFlags::set_w().emit(buf, 0, 0, enc(r10));
                buf.put1(0xB8 + (enc(r10) & 7));
                buf.put8(imm.value as u64);
                RexFlags::clear_w().emit(buf, 2, 0, enc(r10));
                buf.put1(0xFF);
                emit_modrm_reg(buf, 2, enc(r10));
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        },

        X64Inst::Ret => {
            match ops.first() {
                Some(Operand::Imm(imm)) if imm.value != 0 => {
                    buf.put1(0xC2);
                    buf.put2(imm.value as u16);
                }
                _ => buf.put1(0xC3),
            }
            Ok(())
        }

        X64Inst::Jmp => match &ops[0] {
            Operand::Label(l) => {
                if node.options.short_form {
                    buf.put1(0xEB);
                    emit_label_field(buf, labels, *l, RelocKind::Rel8)
                } else {
                    buf.put1(0xE9);
                    emit_label_field(buf, labels, *l, RelocKind::Rel32)
                }
            }
            Operand::Reg(r) => {
                RexFlags::clear_w().emit(buf, 4, 0, enc(*r));
                buf.put1(0xFF);
                emit_modrm_reg(buf, 4, enc(*r));
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        },

        X64Inst::Jcc(cond) => {
            let l = label_op(&ops[0])?;
            if node.options.short_form {
                buf.put1(0x70 + cond.code());
                emit_label_field(buf, labels, l, RelocKind::Rel8)
            } else {
                buf.put1(0x0F);
                buf.put1(0x80 + cond.code());
                emit_label_field(buf, labels, l, RelocKind::Rel32)
            }
        }

        X64Inst::Nop => {
            buf.put1(0x90);
            Ok(())
        }

        X64Inst::Movups => match (&ops[0], &ops[1]) {
            (Operand::Reg(dst), rm @ (Operand::Reg(_) | Operand::Mem(_))) => {
                emit_sse(buf, None, &[0x0F, 0x10], *dst, rm)
            }
            (Operand::Mem(_), Operand::Reg(src)) => {
                emit_sse(buf, None, &[0x0F, 0x11], *src, &ops[0])
            }
            _ => Err(Error::InvalidArgument),
        },

        X64Inst::Movdqu => match (&ops[0], &ops[1]) {
            (Operand::Reg(dst), rm @ (Operand::Reg(_) | Operand::Mem(_))) => {
                emit_sse(buf, Some(0xF3), &[0x0F, 0x6F], *dst, rm)
            }
            (Operand::Mem(_), Operand::Reg(src)) => {
                emit_sse(buf, Some(0xF3), &[0x0F, 0x7F], *src, &ops[0])
            }
            _ => Err(Error::InvalidArgument),
        },

        X64Inst::Pxor => {
            let dst = reg_op(&ops[0])?;
            emit_sse(buf, Some(0x66), &[0x0F, 0xEF], dst, &ops[1])
        }

        X64Inst::Movq => match (&ops[0], &ops[1]) {
            (Operand::Reg(dst), Operand::Reg(src)) if dst.rtype() == RegType::Vec128 => {
                // movq xmm, r64.
                buf.put1(0x66);
                RexFlags::set_w().emit(buf, enc(*dst), 0, enc(*src));
                buf.put_bytes(&[0x0F, 0x6E]);
                emit_modrm_reg(buf, enc(*dst), enc(*src));
                Ok(())
            }
            (Operand::Reg(dst), Operand::Reg(src)) if src.rtype() == RegType::Vec128 => {
                // movq r64, xmm.
                buf.put1(0x66);
                RexFlags::set_w().emit(buf, enc(*src), 0, enc(*dst));
                buf.put_bytes(&[0x0F, 0x7E]);
                emit_modrm_reg(buf, enc(*src), enc(*dst));
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        },

        X64Inst::VMovups => {
            let l = |r: Reg| u8::from(r.rtype() == RegType::Vec256);
            match (&ops[0], &ops[1]) {
                (Operand::Reg(dst), Operand::Reg(src)) => {
                    emit_vex(buf, enc(*dst), 0, enc(*src), 1, false, 0, l(*dst), 0);
                    buf.put1(0x10);
                    emit_modrm_reg(buf, enc(*dst), enc(*src));
                    Ok(())
                }
                (Operand::Reg(dst), Operand::Mem(m)) => {
                    let (index, base) = mem_rex_ids(m);
                    emit_vex(buf, enc(*dst), index, base, 1, false, 0, l(*dst), 0);
                    buf.put1(0x10);
                    emit_modrm_mem(buf, enc(*dst), m)
                }
                (Operand::Mem(m), Operand::Reg(src)) => {
                    let (index, base) = mem_rex_ids(m);
                    emit_vex(buf, enc(*src), index, base, 1, false, 0, l(*src), 0);
                    buf.put1(0x11);
                    emit_modrm_mem(buf, enc(*src), m)
                }
                _ => Err(Error::InvalidArgument),
            }
        }

        X64Inst::VAddps => {
            let dst = reg_op(&ops[0])?;
            let src1 = reg_op(&ops[1])?;
            let l = u8::from(dst.rtype() == RegType::Vec256);
            match &ops[2] {
                Operand::Reg(src2) => {
                    emit_vex(buf, enc(dst), 0, enc(*src2), 1, false, enc(src1), l, 0);
                    buf.put1(0x58);
                    emit_modrm_reg(buf, enc(dst), enc(*src2));
                    Ok(())
                }
                Operand::Mem(m) => {
                    let (index, base) = mem_rex_ids(m);
                    emit_vex(buf, enc(dst), index, base, 1, false, enc(src1), l, 0);
                    buf.put1(0x58);
                    emit_modrm_mem(buf, enc(dst), m)
                }
                _ => Err(Error::InvalidArgument),
            }
        }

        X64Inst::VFmadd231sd => {
            let dst = reg_op(&ops[0])?;
            let src1 = reg_op(&ops[1])?;
            match &ops[2] {
                Operand::Reg(src2) => {
                    emit_vex(buf, enc(dst), 0, enc(*src2), 2, true, enc(src1), 0, 1);
                    buf.put1(0xB9);
                    emit_modrm_reg(buf, enc(dst), enc(*src2));
                    Ok(())
                }
                Operand::Mem(m) => {
                    let (index, base) = mem_rex_ids(m);
                    emit_vex(buf, enc(dst), index, base, 2, true, enc(src1), 0, 1);
                    buf.put1(0xB9);
                    emit_modrm_mem(buf, enc(dst), m)
                }
                _ => Err(Error::InvalidArgument),
            }
        }
    }
}

/// Legacy-SSE encoding: optional mandatory prefix, 0F-escape opcode, xmm
/// register in the reg field.
fn emit_sse(
    buf: &mut CodeBuffer,
    prefix: Option<u8>,
    opcode: &[u8],
    reg: Reg,
    rm: &Operand,
) -> CodegenResult<()> {
    if let Some(p) = prefix {
        buf.put1(p);
    }
    match rm {
        Operand::Reg(r) => {
            RexFlags::clear_w().emit(buf, enc(reg), 0, enc(*r));
            buf.put_bytes(opcode);
            emit_modrm_reg(buf, enc(reg), enc(*r));
            Ok(())
        }
        Operand::Mem(m) => {
            let (index, base) = mem_rex_ids(m);
            RexFlags::clear_w().emit(buf, enc(reg), index, base);
            buf.put_bytes(opcode);
            emit_modrm_mem(buf, enc(reg), m)
        }
        _ => Err(Error::InvalidArgument),
    }
}

fn reg_op(op: &Operand) -> CodegenResult<Reg> {
    op.as_reg().ok_or(Error::InvalidArgument)
}

fn label_op(op: &Operand) -> CodegenResult<Label> {
    op.as_label().ok_or(Error::InvalidArgument)
}

fn op_bits(op: &Operand) -> CodegenResult<u8> {
    match op {
        Operand::Reg(r) => Ok(gp_bits(r.rtype())),
        Operand::Mem(m) if m.size != 0 => Ok(m.size * 8),
        _ => Err(Error::InvalidArgument),
    }
}

/// Emit `n` bytes of NOP padding using the recommended multi-byte forms.
pub fn emit_nops(buf: &mut CodeBuffer, mut n: u32) {
    const NOPS: [&[u8]; 9] = [
        &[],
        &[0x90],
        &[0x66, 0x90],
        &[0x0F, 0x1F, 0x00],
        &[0x0F, 0x1F, 0x40, 0x00],
        &[0x0F, 0x1F, 0x44, 0x00, 0x00],
        &[0x66, 0x0F, 0x1F, 0x44, 0x00, 0x00],
        &[0x0F, 0x1F, 0x80, 0x00, 0x00, 0x00, 0x00],
        &[0x0F, 0x1F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x00],
    ];
    while n > 0 {
        let take = n.min(8) as usize;
        buf.put_bytes(NOPS[take]);
        n -= take as u32;
    }
}

#[cfg(test)]
mod tests {
    use super::super::regs::*;
    use super::super::Cond;
    use super::*;
    use crate::ir::InstOptions;
    use crate::operand::Imm;
    use smallvec::SmallVec;

    fn emit(inst: X64Inst, operands: &[Operand]) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        let mut labels = LabelManager::new();
        let node = InstNode {
            inst: InstId::X64(inst),
            operands: SmallVec::from_slice(operands),
            options: InstOptions::default(),
        };
        emit_inst(&node, &mut buf, &mut labels).unwrap();
        buf.section(buf.text()).data.clone()
    }

    #[test]
    fn mov_reg_reg() {
        assert_eq!(emit(X64Inst::Mov, &[rax().into(), rdi().into()]), [0x48, 0x89, 0xF8]);
        assert_eq!(emit(X64Inst::Mov, &[r8().into(), rax().into()]), [0x49, 0x89, 0xC0]);
        assert_eq!(
            emit(X64Inst::Mov, &[gpd(0).into(), gpd(1).into()]),
            [0x89, 0xC8] // mov eax, ecx
        );
    }

    #[test]
    fn add_reg_reg() {
        // add rdi, rsi — the leaf-add body's first instruction.
        assert_eq!(emit(X64Inst::Add, &[rdi().into(), rsi().into()]), [0x48, 0x01, 0xF7]);
    }

    #[test]
    fn alu_imm_forms() {
        // sub rsp, 40 fits imm8.
        assert_eq!(
            emit(X64Inst::Sub, &[rsp().into(), Imm::new(40).into()]),
            [0x48, 0x83, 0xEC, 0x28]
        );
        // add rsp, 1000 needs imm32.
        assert_eq!(
            emit(X64Inst::Add, &[rsp().into(), Imm::new(1000).into()]),
            [0x48, 0x81, 0xC4, 0xE8, 0x03, 0x00, 0x00]
        );
    }

    #[test]
    fn mov_mem_forms() {
        // mov qword [rbp-8], rax: rbp base forces disp8 even at zero.
        let m = Mem::base_disp(rbp(), -8).with_size(8);
        assert_eq!(emit(X64Inst::Mov, &[m.into(), rax().into()]), [0x48, 0x89, 0x45, 0xF8]);
        // mov rax, [rsp+8]: rsp base forces a SIB byte.
        let m = Mem::base_disp(rsp(), 8).with_size(8);
        assert_eq!(emit(X64Inst::Mov, &[rax().into(), m.into()]), [0x48, 0x8B, 0x44, 0x24, 0x08]);
        // mov byte [rcx+rax*1], dl — the byte-fill store shape.
        let m = Mem::base_index(rcx(), rax(), 1, 0).with_size(1);
        let dl = Reg::phys(RegType::Gp8Lo, 2);
        assert_eq!(emit(X64Inst::Mov, &[m.into(), dl.into()]), [0x88, 0x14, 0x01]);
    }

    #[test]
    fn push_pop_xchg() {
        assert_eq!(emit(X64Inst::Push, &[rbp().into()]), [0x55]);
        assert_eq!(emit(X64Inst::Push, &[r12().into()]), [0x41, 0x54]);
        assert_eq!(emit(X64Inst::Pop, &[rbp().into()]), [0x5D]);
        // xchg rax, rbx — the allocator's two-cycle break.
        assert_eq!(emit(X64Inst::Xchg, &[rax().into(), rbx().into()]), [0x48, 0x87, 0xD8]);
    }

    #[test]
    fn ret_forms() {
        assert_eq!(emit(X64Inst::Ret, &[]), [0xC3]);
        assert_eq!(emit(X64Inst::Ret, &[Imm::new(16).into()]), [0xC2, 0x10, 0x00]);
    }

    #[test]
    fn forward_jump_patches_over_nops() {
        // jmp L; 50 nops; L: — finalized bytes must spell E9 32 00 00 00.
        let mut buf = CodeBuffer::new();
        let mut labels = LabelManager::new();
        let l = labels.new_label();
        let node = InstNode {
            inst: InstId::X64(X64Inst::Jmp),
            operands: SmallVec::from_slice(&[l.into()]),
            options: InstOptions::default(),
        };
        emit_inst(&node, &mut buf, &mut labels).unwrap();
        for _ in 0..50 {
            buf.put1(0x90);
        }
        labels.bind(l, buf.text(), buf.offset()).unwrap();
        buf.resolve_fixups(&labels).unwrap();
        assert_eq!(&buf.section(buf.text()).data[..5], &[0xE9, 0x32, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn short_conditional_jump() {
        let mut buf = CodeBuffer::new();
        let mut labels = LabelManager::new();
        let l = labels.new_label();
        labels.bind(l, buf.text(), 0).unwrap();
        let node = InstNode {
            inst: InstId::X64(X64Inst::Jcc(Cond::Ne)),
            operands: SmallVec::from_slice(&[l.into()]),
            options: InstOptions { short_form: true },
        };
        emit_inst(&node, &mut buf, &mut labels).unwrap();
        buf.resolve_fixups(&labels).unwrap();
        // jnz rel8 back to offset 0: 75 FE.
        assert_eq!(buf.section(buf.text()).data, vec![0x75, 0xFE]);
    }

    #[test]
    fn shifts() {
        assert_eq!(
            emit(X64Inst::Shl, &[rax().into(), Imm::new(4).into()]),
            [0x48, 0xC1, 0xE0, 0x04]
        );
        assert_eq!(emit(X64Inst::Shl, &[rax().into(), rcx().into()]), [0x48, 0xD3, 0xE0]);
        assert_eq!(
            emit(X64Inst::Sar, &[gpd(2).into(), Imm::new(1).into()]),
            [0xD1, 0xFA]
        );
    }

    #[test]
    fn sse_and_vex() {
        // movups xmm0, xmm1.
        assert_eq!(emit(X64Inst::Movups, &[xmm(0).into(), xmm(1).into()]), [0x0F, 0x10, 0xC1]);
        // movups [rsp], xmm6.
        let m = Mem::base_disp(rsp(), 0).with_size(16);
        assert_eq!(
            emit(X64Inst::Movups, &[m.into(), xmm(6).into()]),
            [0x0F, 0x11, 0x34, 0x24]
        );
        // pxor xmm2, xmm3.
        assert_eq!(emit(X64Inst::Pxor, &[xmm(2).into(), xmm(3).into()]), [0x66, 0x0F, 0xEF, 0xD3]);
        // vmovups ymm0, ymm1 uses the 2-byte VEX prefix.
        assert_eq!(emit(X64Inst::VMovups, &[ymm(0).into(), ymm(1).into()]), [0xC5, 0xFC, 0x10, 0xC1]);
        // vaddps xmm0, xmm1, xmm2.
        assert_eq!(
            emit(X64Inst::VAddps, &[xmm(0).into(), xmm(1).into(), xmm(2).into()]),
            [0xC5, 0xF0, 0x58, 0xC2]
        );
        // vfmadd231sd xmm0, xmm1, xmm2 (three-byte VEX, 0F38 map, W1).
        assert_eq!(
            emit(X64Inst::VFmadd231sd, &[xmm(0).into(), xmm(1).into(), xmm(2).into()]),
            [0xC4, 0xE2, 0xF1, 0xB9, 0xC2]
        );
    }

    #[test]
    fn movq_between_files() {
        // movq xmm0, rax.
        assert_eq!(
            emit(X64Inst::Movq, &[xmm(0).into(), rax().into()]),
            [0x66, 0x48, 0x0F, 0x6E, 0xC0]
        );
        // movq rax, xmm0.
        assert_eq!(
            emit(X64Inst::Movq, &[rax().into(), xmm(0).into()]),
            [0x66, 0x48, 0x0F, 0x7E, 0xC0]
        );
    }

    #[test]
    fn call_and_lea_rip() {
        let mut buf = CodeBuffer::new();
        let mut labels = LabelManager::new();
        let l = labels.new_label();
        labels.bind(l, buf.text(), 0).unwrap();
        let call = InstNode {
            inst: InstId::X64(X64Inst::Call),
            operands: SmallVec::from_slice(&[l.into()]),
            options: InstOptions::default(),
        };
        emit_inst(&call, &mut buf, &mut labels).unwrap();
        let lea = InstNode {
            inst: InstId::X64(X64Inst::Lea),
            operands: SmallVec::from_slice(&[rax().into(), l.into()]),
            options: InstOptions::default(),
        };
        emit_inst(&lea, &mut buf, &mut labels).unwrap();
        buf.resolve_fixups(&labels).unwrap();
        let bytes = buf.section(buf.text()).data.clone();
        // call rel32 back to 0: E8 FB FF FF FF.
        assert_eq!(&bytes[..5], &[0xE8, 0xFB, 0xFF, 0xFF, 0xFF]);
        // lea rax, [rip-12]: 48 8D 05 F4 FF FF FF.
        assert_eq!(&bytes[5..12], &[0x48, 0x8D, 0x05, 0xF4, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn nop_padding() {
        let mut buf = CodeBuffer::new();
        emit_nops(&mut buf, 11);
        assert_eq!(buf.offset(), 11);
        let mut buf = CodeBuffer::new();
        emit_nops(&mut buf, 3);
        assert_eq!(buf.section(buf.text()).data, vec![0x0F, 0x1F, 0x00]);
    }

    fn r12() -> Reg {
        gpq(12)
    }
}
