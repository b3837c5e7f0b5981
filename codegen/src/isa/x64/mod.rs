//! x86-64 ISA definitions: instructions, registers and operand metadata.

pub mod abi;
pub mod emit;

use crate::callconv::CallConvScheme;
use crate::ir::{InstId, InstNode};
use crate::operand::{Operand, Reg, RegGroup, RegType};

/// Condition codes for `jcc`/`setcc`, in encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Cond {
    O = 0,
    No = 1,
    B = 2,
    Ae = 3,
    E = 4,
    Ne = 5,
    Be = 6,
    A = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Ge = 13,
    Le = 14,
    G = 15,
}

impl Cond {
    /// The low nibble of the opcode.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The inverse condition.
    pub fn invert(self) -> Self {
        // Conditions pair up by flipping the low bit.
        match self as u8 ^ 1 {
            0 => Cond::O,
            1 => Cond::No,
            2 => Cond::B,
            3 => Cond::Ae,
            4 => Cond::E,
            5 => Cond::Ne,
            6 => Cond::Be,
            7 => Cond::A,
            8 => Cond::S,
            9 => Cond::Ns,
            10 => Cond::P,
            11 => Cond::Np,
            12 => Cond::L,
            13 => Cond::Ge,
            14 => Cond::Le,
            _ => Cond::G,
        }
    }
}

/// x86-64 instructions the builder exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum X64Inst {
    Mov,
    Movzx,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    IMul,
    Shl,
    Shr,
    Sar,
    Inc,
    Dec,
    Neg,
    Not,
    Lea,
    Push,
    Pop,
    Xchg,
    Call,
    Ret,
    Jmp,
    Jcc(Cond),
    Nop,
    /// SSE 128-bit unaligned move.
    Movups,
    /// SSE2 128-bit unaligned integer move.
    Movdqu,
    /// SSE2 packed xor.
    Pxor,
    /// Move gp <-> xmm low lane (movd/movq by width).
    Movq,
    /// AVX unaligned move, 128/256 by operand type.
    VMovups,
    /// AVX packed single add.
    VAddps,
    /// FMA scalar double: dst = dst + src1 * src2.
    VFmadd231sd,
}

/// Physical register constructors. The id is the hardware encoding.
pub mod regs {
    #![allow(missing_docs)]

    use super::{Reg, RegType};

    /// A 64-bit gp register by hardware encoding.
    pub fn gpq(enc: u8) -> Reg {
        debug_assert!(enc < 16);
        Reg::phys(RegType::Gp64, enc)
    }

    /// A 32-bit gp register by hardware encoding.
    pub fn gpd(enc: u8) -> Reg {
        debug_assert!(enc < 16);
        Reg::phys(RegType::Gp32, enc)
    }

    /// An xmm register by hardware encoding.
    pub fn xmm(enc: u8) -> Reg {
        debug_assert!(enc < 32);
        Reg::phys(RegType::Vec128, enc)
    }

    /// A ymm register by hardware encoding.
    pub fn ymm(enc: u8) -> Reg {
        debug_assert!(enc < 32);
        Reg::phys(RegType::Vec256, enc)
    }

    pub fn rax() -> Reg {
        gpq(0)
    }
    pub fn rcx() -> Reg {
        gpq(1)
    }
    pub fn rdx() -> Reg {
        gpq(2)
    }
    pub fn rbx() -> Reg {
        gpq(3)
    }
    pub fn rsp() -> Reg {
        gpq(4)
    }
    pub fn rbp() -> Reg {
        gpq(5)
    }
    pub fn rsi() -> Reg {
        gpq(6)
    }
    pub fn rdi() -> Reg {
        gpq(7)
    }
    pub fn r8() -> Reg {
        gpq(8)
    }
    pub fn r9() -> Reg {
        gpq(9)
    }
    pub fn r10() -> Reg {
        gpq(10)
    }
    pub fn r11() -> Reg {
        gpq(11)
    }
}

pub use super::{BranchKind, InstInfo, OpRw};

/// Describe `node` for the register allocator.
///
/// `scheme` supplies the clobber set for plain `call` instructions; invoke
/// nodes carry their own signature instead.
pub fn inst_info(node: &InstNode, scheme: &CallConvScheme) -> InstInfo {
    let inst = match node.inst {
        InstId::X64(i) => i,
        #[cfg(feature = "aarch64")]
        _ => unreachable!("x64 info queried for a foreign instruction"),
    };
    let nops = node.operands.len();
    match inst {
        X64Inst::Mov | X64Inst::Movups | X64Inst::Movdqu | X64Inst::VMovups | X64Inst::Movq => {
            let mut info = InstInfo::simple(&[OpRw::W, OpRw::R]);
            info.is_move = matches!(
                (&node.operands[0], &node.operands[1]),
                (Operand::Reg(a), Operand::Reg(b)) if a.group() == b.group()
            );
            info
        }
        X64Inst::Movzx | X64Inst::Lea => InstInfo::simple(&[OpRw::W, OpRw::R]),
        X64Inst::Add | X64Inst::Sub | X64Inst::And | X64Inst::Or | X64Inst::Xor | X64Inst::IMul => {
            InstInfo::simple(&[OpRw::RW, OpRw::R])
        }
        X64Inst::Pxor | X64Inst::VFmadd231sd => {
            if nops == 3 {
                InstInfo::simple(&[OpRw::RW, OpRw::R, OpRw::R])
            } else {
                InstInfo::simple(&[OpRw::RW, OpRw::R])
            }
        }
        X64Inst::VAddps => InstInfo::simple(&[OpRw::W, OpRw::R, OpRw::R]),
        X64Inst::Cmp | X64Inst::Test => InstInfo::simple(&[OpRw::R, OpRw::R]),
        X64Inst::Shl | X64Inst::Shr | X64Inst::Sar => {
            let mut info = InstInfo::simple(&[OpRw::RW, OpRw::R]);
            // A register shift count lives in cl.
            if matches!(node.operands.get(1), Some(Operand::Reg(_))) {
                info.fixed.push((1, 1));
            }
            info
        }
        X64Inst::Inc | X64Inst::Dec | X64Inst::Neg | X64Inst::Not => {
            InstInfo::simple(&[OpRw::RW])
        }
        X64Inst::Push => InstInfo::simple(&[OpRw::R]),
        X64Inst::Pop => InstInfo::simple(&[OpRw::W]),
        X64Inst::Xchg => InstInfo::simple(&[OpRw::RW, OpRw::RW]),
        X64Inst::Call => {
            let mut info = InstInfo::simple(&[OpRw::R]);
            info.branch = BranchKind::Call;
            info.clobbers[RegGroup::Gp.index()] = !scheme.preserved_gp & 0xffff;
            info.clobbers[RegGroup::Vec.index()] = !scheme.preserved_vec;
            info
        }
        X64Inst::Ret => {
            let mut info = InstInfo::simple(&[]);
            info.branch = BranchKind::Ret;
            info
        }
        X64Inst::Jmp => {
            let mut info = InstInfo::simple(&[OpRw::R]);
            info.branch = BranchKind::Jump;
            info
        }
        X64Inst::Jcc(_) => {
            let mut info = InstInfo::simple(&[OpRw::R]);
            info.branch = BranchKind::CondJump;
            info
        }
        X64Inst::Nop => InstInfo::simple(&[]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callconv::CallConv;
    use crate::ir::InstOptions;
    use smallvec::SmallVec;

    fn node(inst: X64Inst, operands: &[Operand]) -> InstNode {
        InstNode {
            inst: InstId::X64(inst),
            operands: SmallVec::from_slice(operands),
            options: InstOptions::default(),
        }
    }

    #[test]
    fn mov_reg_reg_is_a_move() {
        let scheme = CallConv::X64SystemV.scheme();
        let n = node(X64Inst::Mov, &[regs::rax().into(), regs::rbx().into()]);
        let info = inst_info(&n, scheme);
        assert!(info.is_move);
        assert_eq!(info.rw[0], OpRw::W);
        assert_eq!(info.rw[1], OpRw::R);
        // mov r, imm is not a coalescing candidate.
        let n = node(X64Inst::Mov, &[regs::rax().into(), crate::operand::Imm::new(1).into()]);
        assert!(!inst_info(&n, scheme).is_move);
    }

    #[test]
    fn shift_count_is_fixed_to_cl() {
        let scheme = CallConv::X64SystemV.scheme();
        let n = node(X64Inst::Shl, &[regs::rax().into(), regs::rcx().into()]);
        let info = inst_info(&n, scheme);
        assert_eq!(info.fixed.as_slice(), &[(1, 1)]);
        let n = node(X64Inst::Shl, &[regs::rax().into(), crate::operand::Imm::new(3).into()]);
        assert!(inst_info(&n, scheme).fixed.is_empty());
    }

    #[test]
    fn call_clobbers_caller_saved() {
        let scheme = CallConv::X64SystemV.scheme();
        let n = node(X64Inst::Call, &[regs::rax().into()]);
        let info = inst_info(&n, scheme);
        // rbx (preserved) survives, rcx does not.
        assert_eq!(info.clobbers[RegGroup::Gp.index()] & (1 << 3), 0);
        assert_ne!(info.clobbers[RegGroup::Gp.index()] & (1 << 1), 0);
    }

    #[test]
    fn cond_invert_pairs() {
        assert_eq!(Cond::E.invert(), Cond::Ne);
        assert_eq!(Cond::L.invert(), Cond::Ge);
        assert_eq!(Cond::A.invert(), Cond::Be);
    }
}
