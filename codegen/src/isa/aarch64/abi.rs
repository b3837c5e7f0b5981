//! AArch64 frame materialization and allocator move support.
//!
//! With a frame-pointer chain the prologue opens with
//! `stp x29, x30, [sp, #-16]!` followed by `mov x29, sp`; callee-saved
//! integer pairs push below with further pre-indexed stores, the stack
//! adjustment follows, and preserved vector registers save into the
//! reserved area above the outgoing-argument space.

use smallvec::{smallvec, SmallVec};

use crate::buffer::CodeBuffer;
use crate::frame::FuncFrame;
use crate::ir::{InstId, InstNode, InstOptions};
use crate::label::LabelManager;
use crate::operand::{Imm, Mem, Operand, Reg, RegGroup, RegType};
use crate::result::CodegenResult;

use super::{regs, A64Inst, PairMode};

fn inst(inst: A64Inst, operands: &[Operand]) -> InstNode {
    InstNode {
        inst: InstId::A64(inst),
        operands: SmallVec::from_slice(operands),
        options: InstOptions::default(),
    }
}

/// A register-to-register move within one group.
pub fn mov_rr(rtype: RegType, dst: u8, src: u8) -> InstNode {
    let rt = match rtype.group() {
        RegGroup::Vec => RegType::Vec128,
        _ => RegType::Gp64,
    };
    inst(A64Inst::Mov, &[Reg::phys(rt, dst).into(), Reg::phys(rt, src).into()])
}

/// Reload a spilled value from its slot.
pub fn load_slot(rtype: RegType, dst: u8, slot: Mem) -> InstNode {
    let rt = match rtype.group() {
        RegGroup::Vec => RegType::Vec128,
        _ => RegType::Gp64,
    };
    inst(A64Inst::Ldr, &[Reg::phys(rt, dst).into(), slot.with_size(rt.bytes() as u8).into()])
}

/// Save a register to its spill slot.
pub fn store_slot(rtype: RegType, slot: Mem, src: u8) -> InstNode {
    let rt = match rtype.group() {
        RegGroup::Vec => RegType::Vec128,
        _ => RegType::Gp64,
    };
    inst(A64Inst::Str, &[slot.with_size(rt.bytes() as u8).into(), Reg::phys(rt, src).into()])
}

/// Exchange two gp registers through the reserved scratch register: the
/// ISA has no native swap.
pub fn swap_gp(a: u8, b: u8) -> SmallVec<[InstNode; 3]> {
    let scratch = 16;
    smallvec![mov_rr(RegType::Gp64, scratch, a), mov_rr(RegType::Gp64, a, b), mov_rr(RegType::Gp64, b, scratch)]
}

/// Exchange two vector registers through a stack scratch slot.
pub fn swap_vec_via_slot(rtype: RegType, a: u8, b: u8, scratch: Mem) -> SmallVec<[InstNode; 3]> {
    smallvec![
        store_slot(rtype, scratch, a),
        mov_rr(rtype, a, b),
        load_slot(rtype, b, scratch),
    ]
}

/// The spill-slot address for a raw frame offset, before final layout.
pub fn slot_mem(offset: u32) -> Mem {
    let mut mem = Mem::base_disp(regs::sp(), offset as i32);
    mem.frame_slot = true;
    mem
}

/// Emit the prologue for a finalized frame.
pub fn emit_prologue(
    frame: &FuncFrame,
    buf: &mut CodeBuffer,
    labels: &mut LabelManager,
) -> CodegenResult<()> {
    use super::emit::emit_inst;
    debug_assert!(frame.is_finalized());

    if frame.preserved_fp() {
        let pre = Mem::base_disp(regs::sp(), -16);
        emit_inst(
            &inst(A64Inst::Stp(PairMode::PreIndex), &[regs::fp().into(), regs::lr().into(), pre.into()]),
            buf,
            labels,
        )?;
        emit_inst(&inst(A64Inst::Mov, &[regs::fp().into(), regs::sp().into()]), buf, labels)?;
    }

    let saves: Vec<u8> = frame.save_ids(RegGroup::Gp).collect();
    for pair in saves.chunks(2) {
        let pre = Mem::base_disp(regs::sp(), -16);
        if let [a, b] = pair {
            emit_inst(
                &inst(
                    A64Inst::Stp(PairMode::PreIndex),
                    &[regs::xreg(*a).into(), regs::xreg(*b).into(), pre.into()],
                ),
                buf,
                labels,
            )?;
        } else {
            // Odd tail pairs with xzr to keep sp 16-aligned.
            emit_inst(
                &inst(
                    A64Inst::Stp(PairMode::PreIndex),
                    &[regs::xreg(pair[0]).into(), regs::zero().into(), pre.into()],
                ),
                buf,
                labels,
            )?;
        }
    }

    let adjust = frame.stack_adjustment();
    if adjust > 0 {
        emit_inst(
            &inst(A64Inst::Sub, &[regs::sp().into(), regs::sp().into(), Imm::new(i64::from(adjust)).into()]),
            buf,
            labels,
        )?;
    }

    let mut vec_off = frame.vec_save_offset();
    for id in frame.save_ids(RegGroup::Vec) {
        // AAPCS64 only requires the low 64 bits of v8-v15.
        let slot = Mem::base_disp(regs::sp(), vec_off).with_size(8);
        emit_inst(
            &inst(A64Inst::Str, &[slot.into(), Reg::phys(RegType::Vec128, id).into()]),
            buf,
            labels,
        )?;
        vec_off += 8;
    }
    Ok(())
}

/// Emit the epilogue (including the return) for a finalized frame.
pub fn emit_epilogue(
    frame: &FuncFrame,
    buf: &mut CodeBuffer,
    labels: &mut LabelManager,
) -> CodegenResult<()> {
    use super::emit::emit_inst;
    debug_assert!(frame.is_finalized());

    let mut vec_off = frame.vec_save_offset();
    for id in frame.save_ids(RegGroup::Vec) {
        let slot = Mem::base_disp(regs::sp(), vec_off).with_size(8);
        emit_inst(
            &inst(A64Inst::Ldr, &[Reg::phys(RegType::Vec128, id).into(), slot.into()]),
            buf,
            labels,
        )?;
        vec_off += 8;
    }

    let adjust = frame.stack_adjustment();
    if adjust > 0 {
        emit_inst(
            &inst(A64Inst::Add, &[regs::sp().into(), regs::sp().into(), Imm::new(i64::from(adjust)).into()]),
            buf,
            labels,
        )?;
    }

    let saves: Vec<u8> = frame.save_ids(RegGroup::Gp).collect();
    for pair in saves.chunks(2).rev() {
        let post = Mem::base_disp(regs::sp(), 16);
        if let [a, b] = pair {
            emit_inst(
                &inst(
                    A64Inst::Ldp(PairMode::PostIndex),
                    &[regs::xreg(*a).into(), regs::xreg(*b).into(), post.into()],
                ),
                buf,
                labels,
            )?;
        } else {
            emit_inst(
                &inst(
                    A64Inst::Ldp(PairMode::PostIndex),
                    &[regs::xreg(pair[0]).into(), regs::zero().into(), post.into()],
                ),
                buf,
                labels,
            )?;
        }
    }

    if frame.preserved_fp() {
        let post = Mem::base_disp(regs::sp(), 16);
        emit_inst(
            &inst(A64Inst::Ldp(PairMode::PostIndex), &[regs::fp().into(), regs::lr().into(), post.into()]),
            buf,
            labels,
        )?;
    }

    emit_inst(&inst(A64Inst::Ret, &[]), buf, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callconv::CallConv;
    use crate::isa::Arch;

    fn words_of(frame: &FuncFrame) -> Vec<u32> {
        let mut buf = CodeBuffer::new();
        let mut labels = LabelManager::new();
        emit_prologue(frame, &mut buf, &mut labels).unwrap();
        emit_epilogue(frame, &mut buf, &mut labels).unwrap();
        let data = buf.section(buf.text()).data.clone();
        data.chunks(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect()
    }

    #[test]
    fn fp_chain_uses_stp_ldp() {
        let mut frame = FuncFrame::new(Arch::Aarch64, CallConv::Aapcs64);
        frame.set_preserved_fp(true);
        frame.note_call(0);
        frame.finalize().unwrap();
        let words = words_of(&frame);
        assert_eq!(words[0], 0xa9bf_7bfd); // stp x29, x30, [sp, #-16]!
        assert_eq!(words[1], 0x9100_03fd); // mov x29, sp
        assert_eq!(words[words.len() - 2], 0xa8c1_7bfd); // ldp x29, x30, [sp], #16
        assert_eq!(words[words.len() - 1], 0xd65f_03c0); // ret
    }

    #[test]
    fn preserved_pairs_save_and_restore_once() {
        let mut frame = FuncFrame::new(Arch::Aarch64, CallConv::Aapcs64);
        frame.set_preserved_fp(true);
        frame.note_call(0);
        frame.add_dirty(RegGroup::Gp, 19);
        frame.add_dirty(RegGroup::Gp, 20);
        frame.finalize().unwrap();
        let words = words_of(&frame);
        // stp x19, x20, [sp, #-16]! appears exactly once.
        let stp = 0xa9bf_53f3;
        assert_eq!(words.iter().filter(|&&w| w == stp).count(), 1);
        // ldp x19, x20, [sp], #16 appears exactly once.
        let ldp = 0xa8c1_53f3;
        assert_eq!(words.iter().filter(|&&w| w == ldp).count(), 1);
    }

    #[test]
    fn leaf_emits_only_ret() {
        let mut frame = FuncFrame::new(Arch::Aarch64, CallConv::Aapcs64);
        frame.finalize().unwrap();
        assert_eq!(words_of(&frame), vec![0xd65f_03c0]);
    }
}
