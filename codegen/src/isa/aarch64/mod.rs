//! AArch64 ISA definitions: instructions, registers and operand metadata.

pub mod abi;
pub mod emit;

use smallvec::SmallVec;

use crate::callconv::CallConvScheme;
use crate::ir::{InstId, InstNode};
use crate::operand::{Operand, Reg, RegGroup, RegType};

pub use super::{BranchKind, InstInfo, OpRw};

/// AArch64 condition codes, in encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum A64Cond {
    Eq = 0,
    Ne = 1,
    Hs = 2,
    Lo = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
}

impl A64Cond {
    /// The 4-bit condition field.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// The inverse condition.
    pub fn invert(self) -> Self {
        debug_assert!(!matches!(self, A64Cond::Al));
        match self as u8 ^ 1 {
            0 => A64Cond::Eq,
            1 => A64Cond::Ne,
            2 => A64Cond::Hs,
            3 => A64Cond::Lo,
            4 => A64Cond::Mi,
            5 => A64Cond::Pl,
            6 => A64Cond::Vs,
            7 => A64Cond::Vc,
            8 => A64Cond::Hi,
            9 => A64Cond::Ls,
            10 => A64Cond::Ge,
            11 => A64Cond::Lt,
            12 => A64Cond::Gt,
            _ => A64Cond::Le,
        }
    }
}

/// Addressing mode of a load/store pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PairMode {
    /// `[rn, #imm]`.
    SignedOffset,
    /// `[rn, #imm]!`.
    PreIndex,
    /// `[rn], #imm`.
    PostIndex,
}

/// AArch64 instructions the builder exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum A64Inst {
    /// movz: load a shifted 16-bit immediate, zeroing the rest.
    MovZ {
        /// Left shift in units of 16 bits (0-3).
        hw: u8,
    },
    /// movk: insert a shifted 16-bit immediate, keeping the rest.
    MovK {
        /// Left shift in units of 16 bits (0-3).
        hw: u8,
    },
    /// Register move: orr rd, xzr, rm (or add rd, rn, #0 against sp), and
    /// the vector/fmov forms by operand type.
    Mov,
    /// add (immediate or shifted register by operand type).
    Add,
    /// sub (immediate or shifted register).
    Sub,
    /// subs discarding the result.
    Cmp,
    /// madd with xzr accumulator.
    Mul,
    /// Bitwise and (shifted register).
    And,
    /// Bitwise or (shifted register).
    Orr,
    /// Bitwise exclusive or (shifted register).
    Eor,
    /// Logical shift left (immediate via ubfm, register via lslv).
    Lsl,
    /// Logical shift right.
    Lsr,
    /// Arithmetic shift right.
    Asr,
    /// Load: gp or vector by destination type, width by type/mem size.
    Ldr,
    /// Store: gp or vector by source type.
    Str,
    /// Load pair of 64-bit gp registers.
    Ldp(PairMode),
    /// Store pair of 64-bit gp registers.
    Stp(PairMode),
    /// PC-relative address of a label.
    Adr,
    /// Unconditional branch to a label.
    B,
    /// Conditional branch to a label.
    BCond(A64Cond),
    /// Compare-and-branch-if-zero.
    Cbz,
    /// Compare-and-branch-if-nonzero.
    Cbnz,
    /// Call a label.
    Bl,
    /// Call through a register.
    Blr,
    /// Indirect branch.
    Br,
    /// Return through x30.
    Ret,
    Nop,
    /// fadd v.4s.
    FAddV4S,
}

/// Physical register constructors. The id is the hardware encoding.
pub mod regs {
    use super::{Reg, RegType};

    /// A 64-bit integer register x0-x30, or sp/xzr as x31.
    pub fn xreg(num: u8) -> Reg {
        debug_assert!(num < 32);
        Reg::phys(RegType::Gp64, num)
    }

    /// A 32-bit view of an integer register.
    pub fn wreg(num: u8) -> Reg {
        debug_assert!(num < 32);
        Reg::phys(RegType::Gp32, num)
    }

    /// A 128-bit vector register v0-v31.
    pub fn vreg(num: u8) -> Reg {
        debug_assert!(num < 32);
        Reg::phys(RegType::Vec128, num)
    }

    /// The stack pointer.
    pub fn sp() -> Reg {
        xreg(31)
    }

    /// The frame pointer x29.
    pub fn fp() -> Reg {
        xreg(29)
    }

    /// The link register x30.
    pub fn lr() -> Reg {
        xreg(30)
    }

    /// The zero register (shares encoding 31 with sp; context decides).
    pub fn zero() -> Reg {
        xreg(31)
    }
}

/// Describe `node` for the register allocator.
pub fn inst_info(node: &InstNode, scheme: &CallConvScheme) -> InstInfo {
    let inst = match node.inst {
        InstId::A64(i) => i,
        #[cfg(feature = "x64")]
        _ => unreachable!("aarch64 info queried for a foreign instruction"),
    };
    let simple = |rw: &[OpRw]| InstInfo {
        rw: SmallVec::from_slice(rw),
        is_move: false,
        branch: BranchKind::None,
        fixed: SmallVec::new(),
        clobbers: [0; RegGroup::NUM_ALLOCATABLE],
    };
    match inst {
        A64Inst::Mov => {
            let mut info = simple(&[OpRw::W, OpRw::R]);
            info.is_move = matches!(
                (&node.operands[0], &node.operands[1]),
                (Operand::Reg(a), Operand::Reg(b)) if a.group() == b.group()
            );
            info
        }
        A64Inst::MovZ { .. } | A64Inst::Adr => simple(&[OpRw::W]),
        A64Inst::MovK { .. } => simple(&[OpRw::RW]),
        A64Inst::Add
        | A64Inst::Sub
        | A64Inst::Mul
        | A64Inst::And
        | A64Inst::Orr
        | A64Inst::Eor
        | A64Inst::Lsl
        | A64Inst::Lsr
        | A64Inst::Asr => {
            if node.operands.len() == 3 {
                simple(&[OpRw::W, OpRw::R, OpRw::R])
            } else {
                simple(&[OpRw::RW, OpRw::R])
            }
        }
        A64Inst::FAddV4S => simple(&[OpRw::W, OpRw::R, OpRw::R]),
        A64Inst::Cmp => simple(&[OpRw::R, OpRw::R]),
        A64Inst::Ldr => simple(&[OpRw::W, OpRw::R]),
        A64Inst::Str => simple(&[OpRw::R, OpRw::R]),
        A64Inst::Ldp(_) => simple(&[OpRw::W, OpRw::W, OpRw::R]),
        A64Inst::Stp(_) => simple(&[OpRw::R, OpRw::R, OpRw::R]),
        A64Inst::B => {
            let mut info = simple(&[OpRw::R]);
            info.branch = BranchKind::Jump;
            info
        }
        A64Inst::BCond(_) => {
            let mut info = simple(&[OpRw::R]);
            info.branch = BranchKind::CondJump;
            info
        }
        A64Inst::Cbz | A64Inst::Cbnz => {
            let mut info = simple(&[OpRw::R, OpRw::R]);
            info.branch = BranchKind::CondJump;
            info
        }
        A64Inst::Bl | A64Inst::Blr => {
            let mut info = simple(&[OpRw::R]);
            info.branch = BranchKind::Call;
            info.clobbers[RegGroup::Gp.index()] = !scheme.preserved_gp;
            info.clobbers[RegGroup::Vec.index()] = !scheme.preserved_vec;
            info
        }
        A64Inst::Br => {
            let mut info = simple(&[OpRw::R]);
            info.branch = BranchKind::Jump;
            info
        }
        A64Inst::Ret => {
            let mut info = simple(&[]);
            info.branch = BranchKind::Ret;
            info
        }
        A64Inst::Nop => simple(&[]),
    }
}
