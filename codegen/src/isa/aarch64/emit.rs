//! AArch64 binary encoding.
//!
//! Every instruction is one little-endian 32-bit word. Branch and ADR
//! fixups leave the immediate field zero; the relocation resolver splices
//! the displacement into the opcode word at finalize.

use crate::buffer::CodeBuffer;
use crate::ir::{InstId, InstNode};
use crate::label::{Label, LabelManager, RelocKind};
use crate::operand::{Mem, Operand, Reg, RegGroup, RegType};
use crate::result::{CodegenResult, Error};

use super::{A64Inst, PairMode};

/// The encoding id of a register operand.
fn enc(reg: Reg) -> u32 {
    debug_assert!(!reg.is_virt(), "virtual register reached the encoder");
    u32::from(reg.phys_id())
}

/// The sf bit: 1 for 64-bit gp operations.
fn sf(reg: Reg) -> u32 {
    u32::from(reg.rtype() != RegType::Gp32)
}

fn put(buf: &mut CodeBuffer, word: u32) {
    buf.put4(word);
}

fn reg_op(op: &Operand) -> CodegenResult<Reg> {
    op.as_reg().ok_or(Error::InvalidArgument)
}

fn label_op(op: &Operand) -> CodegenResult<Label> {
    op.as_label().ok_or(Error::InvalidArgument)
}

/// Record a branch-class fixup at the current offset, then emit the opcode
/// word with a zero immediate field.
fn put_with_fixup(
    buf: &mut CodeBuffer,
    labels: &mut LabelManager,
    word: u32,
    label: Label,
    kind: RelocKind,
) -> CodegenResult<()> {
    labels.add_fixup(label, buf.current(), buf.offset(), kind, 0)?;
    put(buf, word);
    Ok(())
}

/// add/sub immediate: imm12, optionally shifted left 12.
fn addsub_imm(op30: u32, set_flags: bool, rd: Reg, rn: Reg, imm: i64) -> CodegenResult<u32> {
    let (value, negate) = if imm < 0 { (-imm, true) } else { (imm, false) };
    let op30 = op30 ^ u32::from(negate);
    let base = (sf(rd) << 31) | (op30 << 30) | (u32::from(set_flags) << 29) | (0b10001 << 24);
    if value < (1 << 12) {
        Ok(base | ((value as u32) << 10) | (enc(rn) << 5) | enc(rd))
    } else if value < (1 << 24) && value & 0xfff == 0 {
        Ok(base | (1 << 22) | (((value >> 12) as u32) << 10) | (enc(rn) << 5) | enc(rd))
    } else {
        Err(Error::InvalidArgument)
    }
}

/// add/sub shifted register.
fn addsub_reg(op30: u32, set_flags: bool, rd: Reg, rn: Reg, rm: Reg) -> u32 {
    (sf(rd) << 31)
        | (op30 << 30)
        | (u32::from(set_flags) << 29)
        | (0b01011 << 24)
        | (enc(rm) << 16)
        | (enc(rn) << 5)
        | enc(rd)
}

/// Logical shifted register (and/orr/eor).
fn logical_reg(opc: u32, rd: Reg, rn: Reg, rm: Reg) -> u32 {
    (sf(rd) << 31) | (opc << 29) | (0b01010 << 24) | (enc(rm) << 16) | (enc(rn) << 5) | enc(rd)
}

/// ubfm/sbfm with N matching sf.
fn bitfield(sbfm: bool, rd: Reg, rn: Reg, immr: u32, imms: u32) -> u32 {
    let s = sf(rd);
    let opc = if sbfm { 0b00 } else { 0b10 };
    (s << 31) | (opc << 29) | (0b100110 << 23) | (s << 22) | (immr << 16) | (imms << 10) | (enc(rn) << 5) | enc(rd)
}

/// Variable shift (lslv/lsrv/asrv).
fn shift_var(op2: u32, rd: Reg, rn: Reg, rm: Reg) -> u32 {
    (sf(rd) << 31)
        | (0b0011010110 << 21)
        | (enc(rm) << 16)
        | (0b0010 << 12)
        | (op2 << 10)
        | (enc(rn) << 5)
        | enc(rd)
}

/// Load/store with an immediate offset. Picks the scaled unsigned form
/// when the offset fits, falling back to the 9-bit unscaled form.
fn ldst_imm(load: bool, rt: Reg, mem: &Mem) -> CodegenResult<u32> {
    let base = mem.base.ok_or(Error::InvalidArgument)?;
    // Vector registers access their low 64 bits (d-form) when the memory
    // operand says 8 bytes; the full 128 bits (q-form) otherwise.
    let is_q = rt.rtype() == RegType::Vec128 && mem.size != 8;
    let (size_log2, opc_base): (u32, u32) = match rt.rtype() {
        RegType::Vec128 if is_q => (4, 0x3c00_0000),
        RegType::Vec128 => (3, 0xfc00_0000),
        RegType::Gp32 => (2, 0xb800_0000),
        RegType::Gp8Lo => (0, 0x3800_0000),
        RegType::Gp16 => (1, 0x7800_0000),
        _ => (3, 0xf800_0000),
    };
    // For 128-bit accesses opc<1> moves into bit 23.
    let q_extra = u32::from(is_q) << 23;
    let load_bit = u32::from(load) << 22;
    let scale = 1i64 << size_log2;
    let disp = i64::from(mem.disp);

    if let Some(index) = mem.index {
        // Register offset form, no shift.
        if mem.disp != 0 || mem.scale != 1 {
            return Err(Error::NotImplemented);
        }
        return Ok(opc_base
            | q_extra
            | load_bit
            | (1 << 21)
            | (enc(index) << 16)
            | (0b011 << 13)
            | (0b10 << 10)
            | (enc(base) << 5)
            | enc(rt));
    }

    if disp >= 0 && disp % scale == 0 && disp / scale < (1 << 12) {
        // Unsigned scaled offset.
        Ok(opc_base
            | q_extra
            | load_bit
            | (1 << 24)
            | (((disp / scale) as u32) << 10)
            | (enc(base) << 5)
            | enc(rt))
    } else if (-256..256).contains(&disp) {
        // Unscaled 9-bit signed offset (ldur/stur).
        Ok(opc_base
            | q_extra
            | load_bit
            | (((disp as u32) & 0x1ff) << 12)
            | (enc(base) << 5)
            | enc(rt))
    } else {
        Err(Error::NotImplemented)
    }
}

/// Load/store pair of 64-bit registers.
fn ldst_pair(load: bool, mode: PairMode, rt: Reg, rt2: Reg, mem: &Mem) -> CodegenResult<u32> {
    let base = mem.base.ok_or(Error::InvalidArgument)?;
    let disp = i64::from(mem.disp);
    if disp % 8 != 0 || !(-512..512).contains(&disp) {
        return Err(Error::InvalidArgument);
    }
    let imm7 = ((disp / 8) as u32) & 0x7f;
    let is_vec = rt.rtype().group() == RegGroup::Vec;
    let opc: u32 = if is_vec { 0b01 << 30 } else { 0b10 << 30 };
    let vbit = u32::from(is_vec) << 26;
    let mode_bits: u32 = match mode {
        PairMode::SignedOffset => 0b010,
        PairMode::PreIndex => 0b011,
        PairMode::PostIndex => 0b001,
    };
    Ok(opc
        | (0b101 << 27)
        | vbit
        | (mode_bits << 23)
        | (u32::from(load) << 22)
        | (imm7 << 15)
        | (enc(rt2) << 10)
        | (enc(base) << 5)
        | enc(rt))
}

/// Encode one instruction into the buffer.
pub fn emit_inst(
    node: &InstNode,
    buf: &mut CodeBuffer,
    labels: &mut LabelManager,
) -> CodegenResult<()> {
    let inst = match node.inst {
        InstId::A64(i) => i,
        #[cfg(feature = "x64")]
        _ => return Err(Error::InvalidArch),
    };
    let ops = &node.operands;
    let sp_id = 31u32;

    match inst {
        A64Inst::MovZ { hw } | A64Inst::MovK { hw } => {
            let rd = reg_op(&ops[0])?;
            let imm = match &ops[1] {
                Operand::Imm(i) => i.value as u64 & 0xffff,
                _ => return Err(Error::InvalidArgument),
            };
            let opc: u32 = if matches!(inst, A64Inst::MovZ { .. }) { 0b10 } else { 0b11 };
            put(
                buf,
                (sf(rd) << 31)
                    | (opc << 29)
                    | (0b100101 << 23)
                    | (u32::from(hw) << 21)
                    | ((imm as u32) << 5)
                    | enc(rd),
            );
            Ok(())
        }

        A64Inst::Mov => match (&ops[0], &ops[1]) {
            (Operand::Reg(dst), Operand::Reg(src)) if dst.group() == RegGroup::Gp && src.group() == RegGroup::Gp => {
                if enc(*dst) == sp_id || enc(*src) == sp_id {
                    // mov to/from sp is add #0; orr would read xzr.
                    put(buf, addsub_imm(0, false, *dst, *src, 0)?);
                } else {
                    // orr rd, xzr, rm.
                    put(buf, logical_reg(0b01, *dst, Reg::phys(dst.rtype(), 31), *src));
                }
                Ok(())
            }
            (Operand::Reg(dst), Operand::Reg(src))
                if dst.group() == RegGroup::Vec && src.group() == RegGroup::Vec =>
            {
                // orr vd.16b, vn.16b, vn.16b.
                put(
                    buf,
                    0x4ea0_1c00 | (enc(*src) << 16) | (enc(*src) << 5) | enc(*dst),
                );
                Ok(())
            }
            (Operand::Reg(dst), Operand::Reg(src))
                if dst.group() == RegGroup::Vec && src.group() == RegGroup::Gp =>
            {
                // fmov dd, xn.
                put(buf, 0x9e67_0000 | (enc(*src) << 5) | enc(*dst));
                Ok(())
            }
            (Operand::Reg(dst), Operand::Reg(src))
                if dst.group() == RegGroup::Gp && src.group() == RegGroup::Vec =>
            {
                // fmov xd, dn.
                put(buf, 0x9e66_0000 | (enc(*src) << 5) | enc(*dst));
                Ok(())
            }
            (Operand::Reg(dst), Operand::Imm(imm)) => {
                if dst.group() != RegGroup::Gp || enc(*dst) == sp_id {
                    return Err(Error::InvalidArgument);
                }
                let value = imm.value as u64;
                if value <= 0xffff {
                    put(
                        buf,
                        (sf(*dst) << 31)
                            | (0b10 << 29)
                            | (0b100101 << 23)
                            | (((value as u32) & 0xffff) << 5)
                            | enc(*dst),
                    );
                } else {
                    // Wider immediates expand to a movz/movk sequence.
                    emit_mov_imm64(buf, dst.phys_id(), value);
                }
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        },

        A64Inst::Add | A64Inst::Sub => {
            let op30 = u32::from(inst == A64Inst::Sub);
            let (rd, rn, src) = three_op(ops)?;
            match src {
                Operand::Reg(rm) => {
                    if enc(rd) == sp_id || enc(rn) == sp_id {
                        return Err(Error::InvalidArgument);
                    }
                    put(buf, addsub_reg(op30, false, rd, rn, *rm));
                }
                Operand::Imm(imm) => put(buf, addsub_imm(op30, false, rd, rn, imm.value)?),
                _ => return Err(Error::InvalidArgument),
            }
            Ok(())
        }

        A64Inst::Cmp => {
            let rn = reg_op(&ops[0])?;
            let zr = Reg::phys(rn.rtype(), 31);
            match &ops[1] {
                Operand::Reg(rm) => put(buf, addsub_reg(1, true, zr, rn, *rm)),
                Operand::Imm(imm) => put(buf, addsub_imm(1, true, zr, rn, imm.value)?),
                _ => return Err(Error::InvalidArgument),
            }
            Ok(())
        }

        A64Inst::Mul => {
            let (rd, rn, src) = three_op(ops)?;
            let rm = match src {
                Operand::Reg(r) => *r,
                _ => return Err(Error::InvalidArgument),
            };
            // madd rd, rn, rm, xzr.
            put(
                buf,
                (sf(rd) << 31) | (0b0011011000 << 21) | (enc(rm) << 16) | (31 << 10) | (enc(rn) << 5) | enc(rd),
            );
            Ok(())
        }

        A64Inst::And | A64Inst::Orr | A64Inst::Eor => {
            let opc = match inst {
                A64Inst::And => 0b00,
                A64Inst::Orr => 0b01,
                _ => 0b10,
            };
            let (rd, rn, src) = three_op(ops)?;
            match src {
                Operand::Reg(rm) => put(buf, logical_reg(opc, rd, rn, *rm)),
                _ => return Err(Error::InvalidArgument),
            }
            Ok(())
        }

        A64Inst::Lsl | A64Inst::Lsr | A64Inst::Asr => {
            let (rd, rn, src) = three_op(ops)?;
            let bits = if sf(rd) == 1 { 64u32 } else { 32 };
            match src {
                Operand::Imm(imm) => {
                    let s = (imm.value as u32) % bits;
                    let word = match inst {
                        A64Inst::Lsl => {
                            bitfield(false, rd, rn, (bits - s) % bits, bits - 1 - s)
                        }
                        A64Inst::Lsr => bitfield(false, rd, rn, s, bits - 1),
                        _ => bitfield(true, rd, rn, s, bits - 1),
                    };
                    put(buf, word);
                }
                Operand::Reg(rm) => {
                    let op2 = match inst {
                        A64Inst::Lsl => 0b00,
                        A64Inst::Lsr => 0b01,
                        _ => 0b10,
                    };
                    put(buf, shift_var(op2, rd, rn, *rm));
                }
                _ => return Err(Error::InvalidArgument),
            }
            Ok(())
        }

        A64Inst::Ldr => {
            let rt = reg_op(&ops[0])?;
            let mem = ops[1].as_mem().ok_or(Error::InvalidArgument)?;
            put(buf, ldst_imm(true, rt, &mem)?);
            Ok(())
        }

        A64Inst::Str => {
            let rt = reg_op(&ops[1])?;
            let mem = ops[0].as_mem().ok_or(Error::InvalidArgument)?;
            put(buf, ldst_imm(false, rt, &mem)?);
            Ok(())
        }

        A64Inst::Ldp(mode) => {
            let rt = reg_op(&ops[0])?;
            let rt2 = reg_op(&ops[1])?;
            let mem = ops[2].as_mem().ok_or(Error::InvalidArgument)?;
            put(buf, ldst_pair(true, mode, rt, rt2, &mem)?);
            Ok(())
        }

        A64Inst::Stp(mode) => {
            let rt = reg_op(&ops[0])?;
            let rt2 = reg_op(&ops[1])?;
            let mem = ops[2].as_mem().ok_or(Error::InvalidArgument)?;
            put(buf, ldst_pair(false, mode, rt, rt2, &mem)?);
            Ok(())
        }

        A64Inst::Adr => {
            let rd = reg_op(&ops[0])?;
            let label = label_op(&ops[1])?;
            put_with_fixup(buf, labels, 0x1000_0000 | enc(rd), label, RelocKind::A64Adr21)
        }

        A64Inst::B => match &ops[0] {
            Operand::Label(l) => put_with_fixup(buf, labels, 0x1400_0000, *l, RelocKind::A64Branch26),
            _ => Err(Error::InvalidArgument),
        },

        A64Inst::BCond(cond) => {
            let l = label_op(&ops[0])?;
            put_with_fixup(
                buf,
                labels,
                0x5400_0000 | u32::from(cond.code()),
                l,
                RelocKind::A64Branch19,
            )
        }

        A64Inst::Cbz | A64Inst::Cbnz => {
            let rt = reg_op(&ops[0])?;
            let l = label_op(&ops[1])?;
            let op = u32::from(inst == A64Inst::Cbnz);
            put_with_fixup(
                buf,
                labels,
                (sf(rt) << 31) | (0b011010 << 25) | (op << 24) | enc(rt),
                l,
                RelocKind::A64Branch19,
            )
        }

        A64Inst::Bl => match &ops[0] {
            Operand::Label(l) => put_with_fixup(buf, labels, 0x9400_0000, *l, RelocKind::A64Branch26),
            Operand::Imm(imm) => {
                // Absolute target through the reserved scratch register:
                // movz/movk x16, then blr x16.
                emit_mov_imm64(buf, 16, imm.value as u64);
                put(buf, 0xd63f_0000 | (16 << 5));
                Ok(())
            }
            _ => Err(Error::InvalidArgument),
        },

        A64Inst::Blr => {
            let rn = reg_op(&ops[0])?;
            put(buf, 0xd63f_0000 | (enc(rn) << 5));
            Ok(())
        }

        A64Inst::Br => {
            let rn = reg_op(&ops[0])?;
            put(buf, 0xd61f_0000 | (enc(rn) << 5));
            Ok(())
        }

        A64Inst::Ret => {
            put(buf, 0xd65f_03c0);
            Ok(())
        }

        A64Inst::Nop => {
            put(buf, 0xd503_201f);
            Ok(())
        }

        A64Inst::FAddV4S => {
            let (rd, rn, src) = three_op(ops)?;
            let rm = match src {
                Operand::Reg(r) => *r,
                _ => return Err(Error::InvalidArgument),
            };
            put(buf, 0x4e20_d400 | (enc(rm) << 16) | (enc(rn) << 5) | enc(rd));
            Ok(())
        }
    }
}

fn three_op<'a>(
    ops: &'a smallvec::SmallVec<[Operand; 4]>,
) -> CodegenResult<(Reg, Reg, &'a Operand)> {
    if ops.len() == 3 {
        Ok((reg_op(&ops[0])?, reg_op(&ops[1])?, &ops[2]))
    } else {
        // Two-operand form: destination doubles as the first source.
        Ok((reg_op(&ops[0])?, reg_op(&ops[0])?, &ops[1]))
    }
}

/// Materialize a 64-bit immediate into a gp register with movz + movk.
pub fn emit_mov_imm64(buf: &mut CodeBuffer, rd: u8, value: u64) {
    let rd = u32::from(rd);
    let mut emitted = false;
    for hw in 0..4u32 {
        let chunk = (value >> (hw * 16)) & 0xffff;
        if chunk != 0 || (hw == 0 && value == 0) {
            let opc: u32 = if emitted { 0b11 } else { 0b10 };
            put(
                buf,
                (1 << 31) | (opc << 29) | (0b100101 << 23) | (hw << 21) | ((chunk as u32) << 5) | rd,
            );
            emitted = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::regs::*;
    use super::super::{A64Cond, A64Inst, PairMode};
    use super::*;
    use crate::ir::InstOptions;
    use crate::operand::Imm;
    use smallvec::SmallVec;

    fn emit(inst: A64Inst, operands: &[Operand]) -> u32 {
        let mut buf = CodeBuffer::new();
        let mut labels = LabelManager::new();
        let node = InstNode {
            inst: InstId::A64(inst),
            operands: SmallVec::from_slice(operands),
            options: InstOptions::default(),
        };
        emit_inst(&node, &mut buf, &mut labels).unwrap();
        buf.read_at(buf.text(), 0, 4) as u32
    }

    #[test]
    fn add_sub_forms() {
        // add x0, x1, x2.
        assert_eq!(emit(A64Inst::Add, &[xreg(0).into(), xreg(1).into(), xreg(2).into()]), 0x8b02_0020);
        // sub sp, sp, #32.
        assert_eq!(emit(A64Inst::Sub, &[sp().into(), sp().into(), Imm::new(32).into()]), 0xd100_83ff);
        // add sp, sp, #32.
        assert_eq!(emit(A64Inst::Add, &[sp().into(), sp().into(), Imm::new(32).into()]), 0x9100_83ff);
        // add w0, w0, #1.
        assert_eq!(emit(A64Inst::Add, &[wreg(0).into(), Imm::new(1).into()]), 0x1100_0400);
    }

    #[test]
    fn mov_forms() {
        // mov x0, x1 == orr x0, xzr, x1.
        assert_eq!(emit(A64Inst::Mov, &[xreg(0).into(), xreg(1).into()]), 0xaa01_03e0);
        // mov x16, sp == add x16, sp, #0.
        assert_eq!(emit(A64Inst::Mov, &[xreg(16).into(), sp().into()]), 0x9100_03f0);
        // movz x5, #42.
        assert_eq!(emit(A64Inst::MovZ { hw: 0 }, &[xreg(5).into(), Imm::new(42).into()]), 0xd280_0545);
        // fmov d0, x1 and back.
        assert_eq!(emit(A64Inst::Mov, &[vreg(0).into(), xreg(1).into()]), 0x9e67_0020);
        assert_eq!(emit(A64Inst::Mov, &[xreg(1).into(), vreg(0).into()]), 0x9e66_0001);
        // mov v0.16b, v1.16b.
        assert_eq!(emit(A64Inst::Mov, &[vreg(0).into(), vreg(1).into()]), 0x4ea1_1c20);
    }

    #[test]
    fn scratch_register_swap_sequence() {
        // mov x16, x0; mov x0, x1; mov x1, x16.
        assert_eq!(emit(A64Inst::Mov, &[xreg(16).into(), xreg(0).into()]), 0xaa00_03f0);
        assert_eq!(emit(A64Inst::Mov, &[xreg(0).into(), xreg(1).into()]), 0xaa01_03e0);
        assert_eq!(emit(A64Inst::Mov, &[xreg(1).into(), xreg(16).into()]), 0xaa10_03e1);
    }

    #[test]
    fn loads_and_stores() {
        // ldr x0, [sp, #16].
        let m = Mem::base_disp(sp(), 16).with_size(8);
        assert_eq!(emit(A64Inst::Ldr, &[xreg(0).into(), m.into()]), 0xf940_0be0);
        // str x0, [sp, #16].
        assert_eq!(emit(A64Inst::Str, &[m.into(), xreg(0).into()]), 0xf900_0be0);
        // stur x1, [x2, #-8] (unscaled).
        let m = Mem::base_disp(xreg(2), -8).with_size(8);
        assert_eq!(emit(A64Inst::Str, &[m.into(), xreg(1).into()]), 0xf81f_8041);
        // strb w3, [x0, x1].
        let m = Mem::base_index(xreg(0), xreg(1), 1, 0).with_size(1);
        let w3 = Reg::phys(RegType::Gp8Lo, 3);
        assert_eq!(emit(A64Inst::Str, &[m.into(), w3.into()]), 0x3821_6803);
        // ldr q0, [sp].
        let m = Mem::base_disp(sp(), 0).with_size(16);
        assert_eq!(emit(A64Inst::Ldr, &[vreg(0).into(), m.into()]), 0x3dc0_03e0);
    }

    #[test]
    fn frame_pair_idioms() {
        // stp x29, x30, [sp, #-16]!.
        let m = Mem::base_disp(sp(), -16);
        assert_eq!(
            emit(A64Inst::Stp(PairMode::PreIndex), &[fp().into(), lr().into(), m.into()]),
            0xa9bf_7bfd
        );
        // ldp x29, x30, [sp], #16.
        let m = Mem::base_disp(sp(), 16);
        assert_eq!(
            emit(A64Inst::Ldp(PairMode::PostIndex), &[fp().into(), lr().into(), m.into()]),
            0xa8c1_7bfd
        );
    }

    #[test]
    fn branches_and_fixups() {
        let mut buf = CodeBuffer::new();
        let mut labels = LabelManager::new();
        let l = labels.new_label();
        let b = InstNode {
            inst: InstId::A64(A64Inst::B),
            operands: SmallVec::from_slice(&[l.into()]),
            options: InstOptions::default(),
        };
        emit_inst(&b, &mut buf, &mut labels).unwrap();
        let bc = InstNode {
            inst: InstId::A64(A64Inst::BCond(A64Cond::Ne)),
            operands: SmallVec::from_slice(&[l.into()]),
            options: InstOptions::default(),
        };
        emit_inst(&bc, &mut buf, &mut labels).unwrap();
        labels.bind(l, buf.text(), buf.offset()).unwrap();
        buf.resolve_fixups(&labels).unwrap();
        // b forward 8 bytes = 2 words.
        assert_eq!(buf.read_at(buf.text(), 0, 4) as u32, 0x1400_0002);
        // b.ne forward 4 bytes = 1 word into bits 23..5.
        assert_eq!(buf.read_at(buf.text(), 4, 4) as u32, 0x5400_0021);
    }

    #[test]
    fn ret_and_calls() {
        assert_eq!(emit(A64Inst::Ret, &[]), 0xd65f_03c0);
        assert_eq!(emit(A64Inst::Blr, &[xreg(3).into()]), 0xd63f_0060);
        assert_eq!(emit(A64Inst::Br, &[xreg(3).into()]), 0xd61f_0060);
        assert_eq!(emit(A64Inst::Nop, &[]), 0xd503_201f);
    }

    #[test]
    fn shifts_and_mul() {
        // lsl x0, x1, #4 == ubfm x0, x1, #60, #59.
        assert_eq!(
            emit(A64Inst::Lsl, &[xreg(0).into(), xreg(1).into(), Imm::new(4).into()]),
            0xd37c_ec20
        );
        // lsr x0, x1, #4 == ubfm x0, x1, #4, #63.
        assert_eq!(
            emit(A64Inst::Lsr, &[xreg(0).into(), xreg(1).into(), Imm::new(4).into()]),
            0xd344_fc20
        );
        // mul x0, x1, x2 == madd x0, x1, x2, xzr.
        assert_eq!(
            emit(A64Inst::Mul, &[xreg(0).into(), xreg(1).into(), xreg(2).into()]),
            0x9b02_7c20
        );
        // lsl x0, x0, x1 (variable).
        assert_eq!(
            emit(A64Inst::Lsl, &[xreg(0).into(), xreg(1).into()]),
            0x9ac1_2000
        );
    }

    #[test]
    fn cmp_and_cbz() {
        // cmp x0, #7.
        assert_eq!(emit(A64Inst::Cmp, &[xreg(0).into(), Imm::new(7).into()]), 0xf100_1c1f);
        // cmp x0, x1.
        assert_eq!(emit(A64Inst::Cmp, &[xreg(0).into(), xreg(1).into()]), 0xeb01_001f);
        let mut buf = CodeBuffer::new();
        let mut labels = LabelManager::new();
        let l = labels.new_label();
        labels.bind(l, buf.text(), 0).unwrap();
        let node = InstNode {
            inst: InstId::A64(A64Inst::Cbnz),
            operands: SmallVec::from_slice(&[xreg(3).into(), l.into()]),
            options: InstOptions::default(),
        };
        emit_inst(&node, &mut buf, &mut labels).unwrap();
        buf.resolve_fixups(&labels).unwrap();
        // cbnz x3, back 0 words: imm19 = 0.
        assert_eq!(buf.read_at(buf.text(), 0, 4) as u32, 0xb500_0003);
    }

    #[test]
    fn imm64_materialization() {
        let mut buf = CodeBuffer::new();
        emit_mov_imm64(&mut buf, 16, 0x1234_0000_5678);
        // movz x16, #0x5678; movk x16, #0x1234, lsl #32.
        assert_eq!(buf.read_at(buf.text(), 0, 4) as u32, 0xd28a_cf10);
        assert_eq!(buf.read_at(buf.text(), 4, 4) as u32, 0xf2c2_4690);
        let mut buf = CodeBuffer::new();
        emit_mov_imm64(&mut buf, 0, 0);
        assert_eq!(buf.offset(), 4);
    }

    #[test]
    fn fadd_vector() {
        assert_eq!(
            emit(A64Inst::FAddV4S, &[vreg(0).into(), vreg(1).into(), vreg(2).into()]),
            0x4e22_d420
        );
    }
}
