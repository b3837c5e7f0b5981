//! x86-64 frame materialization and allocator move support.
//!
//! The prologue establishes the frame in this order: frame-pointer chain,
//! callee-saved gp pushes (ascending id), stack adjustment, preserved vector
//! stores into the reserved area. The epilogue is the exact reverse,
//! finished by `ret` (or `ret imm` for callee-pops conventions).

use smallvec::{smallvec, SmallVec};

use crate::buffer::CodeBuffer;
use crate::frame::FuncFrame;
use crate::ir::{InstId, InstNode, InstOptions};
use crate::label::LabelManager;
use crate::operand::{Imm, Mem, Operand, Reg, RegGroup, RegType};
use crate::result::CodegenResult;

use super::{regs, X64Inst};

fn inst(inst: X64Inst, operands: &[Operand]) -> InstNode {
    InstNode {
        inst: InstId::X64(inst),
        operands: SmallVec::from_slice(operands),
        options: InstOptions::default(),
    }
}

/// A register-to-register move within one group.
pub fn mov_rr(rtype: RegType, dst: u8, src: u8) -> InstNode {
    let (op, rt) = match rtype.group() {
        RegGroup::Vec => (X64Inst::Movups, rtype),
        _ => (X64Inst::Mov, RegType::Gp64),
    };
    inst(op, &[Reg::phys(rt, dst).into(), Reg::phys(rt, src).into()])
}

/// Reload a spilled value from its slot.
pub fn load_slot(rtype: RegType, dst: u8, slot: Mem) -> InstNode {
    match rtype.group() {
        RegGroup::Vec => inst(X64Inst::Movups, &[Reg::phys(rtype, dst).into(), slot.into()]),
        _ => inst(
            X64Inst::Mov,
            &[Reg::phys(RegType::Gp64, dst).into(), slot.with_size(8).into()],
        ),
    }
}

/// Save a register to its spill slot.
pub fn store_slot(rtype: RegType, slot: Mem, src: u8) -> InstNode {
    match rtype.group() {
        RegGroup::Vec => inst(X64Inst::Movups, &[slot.into(), Reg::phys(rtype, src).into()]),
        _ => inst(
            X64Inst::Mov,
            &[slot.with_size(8).into(), Reg::phys(RegType::Gp64, src).into()],
        ),
    }
}

/// Exchange two gp registers in place.
pub fn swap_gp(a: u8, b: u8) -> InstNode {
    inst(X64Inst::Xchg, &[regs::gpq(a).into(), regs::gpq(b).into()])
}

/// Exchange two vector registers through a stack scratch slot, preserving
/// NaN payloads (the pxor triangle does not).
pub fn swap_vec_via_slot(rtype: RegType, a: u8, b: u8, scratch: Mem) -> SmallVec<[InstNode; 3]> {
    smallvec![
        inst(X64Inst::Movups, &[scratch.into(), Reg::phys(rtype, a).into()]),
        mov_rr(rtype, a, b),
        inst(X64Inst::Movups, &[Reg::phys(rtype, b).into(), scratch.into()]),
    ]
}

/// The spill-slot address for a raw frame offset, before final layout.
pub fn slot_mem(offset: u32) -> Mem {
    let mut mem = Mem::base_disp(regs::rsp(), offset as i32);
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
        emit_inst(&inst(X64Inst::Push, &[regs::rbp().into()]), buf, labels)?;
        emit_inst(&inst(X64Inst::Mov, &[regs::rbp().into(), regs::rsp().into()]), buf, labels)?;
    }

    for id in frame.save_ids(RegGroup::Gp) {
        emit_inst(&inst(X64Inst::Push, &[regs::gpq(id).into()]), buf, labels)?;
    }

    let adjust = frame.stack_adjustment();
    if adjust > 0 {
        emit_inst(
            &inst(X64Inst::Sub, &[regs::rsp().into(), Imm::new(i64::from(adjust)).into()]),
            buf,
            labels,
        )?;
    }

    let mut vec_off = frame.vec_save_offset();
    for id in frame.save_ids(RegGroup::Vec) {
        let slot = Mem::base_disp(regs::rsp(), vec_off).with_size(16);
        emit_inst(&inst(X64Inst::Movups, &[slot.into(), regs::xmm(id).into()]), buf, labels)?;
        vec_off += 16;
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
        let slot = Mem::base_disp(regs::rsp(), vec_off).with_size(16);
        emit_inst(&inst(X64Inst::Movups, &[regs::xmm(id).into(), slot.into()]), buf, labels)?;
        vec_off += 16;
    }

    let adjust = frame.stack_adjustment();
    if adjust > 0 {
        emit_inst(
            &inst(X64Inst::Add, &[regs::rsp().into(), Imm::new(i64::from(adjust)).into()]),
            buf,
            labels,
        )?;
    }

    let saves: Vec<u8> = frame.save_ids(RegGroup::Gp).collect();
    for id in saves.into_iter().rev() {
        emit_inst(&inst(X64Inst::Pop, &[regs::gpq(id).into()]), buf, labels)?;
    }

    if frame.preserved_fp() {
        emit_inst(&inst(X64Inst::Pop, &[regs::rbp().into()]), buf, labels)?;
    }

    let ret = if frame.callee_pop_size() > 0 {
        inst(X64Inst::Ret, &[Imm::new(i64::from(frame.callee_pop_size())).into()])
    } else {
        inst(X64Inst::Ret, &[])
    };
    emit_inst(&ret, buf, labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callconv::CallConv;
    use crate::isa::Arch;

    fn bytes_of(frame: &FuncFrame) -> (Vec<u8>, Vec<u8>) {
        let mut buf = CodeBuffer::new();
        let mut labels = LabelManager::new();
        emit_prologue(frame, &mut buf, &mut labels).unwrap();
        let split = buf.offset() as usize;
        emit_epilogue(frame, &mut buf, &mut labels).unwrap();
        let data = buf.section(buf.text()).data.clone();
        (data[..split].to_vec(), data[split..].to_vec())
    }

    #[test]
    fn leaf_frame_emits_only_ret() {
        let mut frame = FuncFrame::new(Arch::X64, CallConv::X64SystemV);
        frame.finalize().unwrap();
        let (prologue, epilogue) = bytes_of(&frame);
        assert!(prologue.is_empty());
        assert_eq!(epilogue, vec![0xC3]);
    }

    #[test]
    fn saved_registers_push_pop_in_reverse() {
        let mut frame = FuncFrame::new(Arch::X64, CallConv::X64SystemV);
        frame.note_call(0);
        frame.add_dirty(RegGroup::Gp, 3); // rbx
        frame.add_dirty(RegGroup::Gp, 12); // r12
        frame.finalize().unwrap();
        let (prologue, epilogue) = bytes_of(&frame);
        // push rbx; push r12; sub rsp, 8 (alignment pad).
        assert_eq!(prologue, vec![0x53, 0x41, 0x54, 0x48, 0x83, 0xEC, 0x08]);
        // add rsp, 8; pop r12; pop rbx; ret.
        assert_eq!(epilogue, vec![0x48, 0x83, 0xC4, 0x08, 0x41, 0x5C, 0x5B, 0xC3]);
    }

    #[test]
    fn fp_chain_brackets_the_frame() {
        let mut frame = FuncFrame::new(Arch::X64, CallConv::X64SystemV);
        frame.set_preserved_fp(true);
        frame.note_call(0);
        frame.finalize().unwrap();
        let (prologue, epilogue) = bytes_of(&frame);
        // push rbp; mov rbp, rsp — then rsp is 16-aligned already.
        assert_eq!(&prologue[..4], &[0x55, 0x48, 0x89, 0xE5]);
        assert_eq!(epilogue.last(), Some(&0xC3));
        assert_eq!(&epilogue[epilogue.len() - 2..epilogue.len() - 1], &[0x5D]); // pop rbp
    }

    #[test]
    fn windows_vec_saves_round_trip() {
        let mut frame = FuncFrame::new(Arch::X64, CallConv::X64Windows);
        frame.note_call(32);
        frame.add_dirty(RegGroup::Vec, 6);
        frame.finalize().unwrap();
        let (prologue, epilogue) = bytes_of(&frame);
        // movups [rsp+32], xmm6 appears exactly once in the prologue.
        let store = [0x0F, 0x11, 0x74, 0x24, 0x20];
        let load = [0x0F, 0x10, 0x74, 0x24, 0x20];
        assert_eq!(
            prologue.windows(store.len()).filter(|w| *w == store).count(),
            1
        );
        assert_eq!(epilogue.windows(load.len()).filter(|w| *w == load).count(), 1);
    }

    #[test]
    fn callee_pops_emits_ret_imm() {
        let mut frame = FuncFrame::new(Arch::X64, CallConv::X64SystemV);
        frame.set_callee_pop_size(16);
        frame.finalize().unwrap();
        let (_, epilogue) = bytes_of(&frame);
        assert_eq!(epilogue, vec![0xC2, 0x10, 0x00]);
    }
}
