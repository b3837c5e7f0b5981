//! Target-architecture definitions and the per-ISA encoder adapters.

use smallvec::SmallVec;

use crate::operand::{Reg, RegGroup, RegType};
use crate::result::{CodegenResult, Error};

#[cfg(feature = "aarch64")]
pub mod aarch64;
#[cfg(feature = "x64")]
pub mod x64;

/// How one operand of an instruction is accessed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpRw {
    /// The operand's old value is read.
    pub read: bool,
    /// The operand is written.
    pub write: bool,
}

impl OpRw {
    /// Read-only.
    pub const R: OpRw = OpRw { read: true, write: false };
    /// Write-only (mov-class destination).
    pub const W: OpRw = OpRw { read: false, write: true };
    /// Read-write.
    pub const RW: OpRw = OpRw { read: true, write: true };
}

/// Control-flow classification of an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchKind {
    /// Straight-line instruction.
    None,
    /// Unconditional jump to a label operand.
    Jump,
    /// Conditional jump to a label operand; falls through otherwise.
    CondJump,
    /// Function return.
    Ret,
    /// A call; control returns.
    Call,
}

/// Allocator-facing description of one instruction.
#[derive(Clone, Debug)]
pub struct InstInfo {
    /// Access kind per operand, by position.
    pub rw: SmallVec<[OpRw; 4]>,
    /// Register-to-register move eligible for coalescing and
    /// redundant-move elimination.
    pub is_move: bool,
    /// Control-flow class.
    pub branch: BranchKind,
    /// Forced physical id per operand position (e.g. the `cl` shift count).
    pub fixed: SmallVec<[(usize, u8); 2]>,
    /// Registers destroyed beyond the operands, per allocatable group.
    pub clobbers: [u32; RegGroup::NUM_ALLOCATABLE],
}

impl InstInfo {
    /// An instruction with the given per-operand accesses and no other
    /// effects.
    pub fn simple(rw: &[OpRw]) -> Self {
        InstInfo {
            rw: SmallVec::from_slice(rw),
            is_move: false,
            branch: BranchKind::None,
            fixed: SmallVec::new(),
            clobbers: [0; RegGroup::NUM_ALLOCATABLE],
        }
    }
}

/// A target instruction-set architecture. Each compilation targets exactly
/// one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 64-bit x86.
    X64,
    /// 32-bit x86. Calling-convention tables only; no encoder.
    X86,
    /// 64-bit Arm.
    Aarch64,
    /// 32-bit Arm. Calling-convention tables only; no encoder.
    Arm,
}

impl Arch {
    /// Pointer size in bytes.
    pub fn ptr_bytes(self) -> u32 {
        match self {
            Arch::X64 | Arch::Aarch64 => 8,
            Arch::X86 | Arch::Arm => 4,
        }
    }

    /// Number of registers in the given group's register file.
    pub fn reg_count(self, group: RegGroup) -> u32 {
        match (self, group) {
            (Arch::X64, RegGroup::Gp) => 16,
            (Arch::X64, RegGroup::Vec) => 32,
            (Arch::X64, RegGroup::Mask) => 8,
            (Arch::X86, RegGroup::Gp) => 8,
            (Arch::X86, RegGroup::Vec) => 8,
            (Arch::X86, RegGroup::Mask) => 8,
            (Arch::Aarch64, RegGroup::Gp) => 32,
            (Arch::Aarch64, RegGroup::Vec) => 32,
            (Arch::Aarch64, RegGroup::Mask) => 0,
            (Arch::Arm, RegGroup::Gp) => 16,
            (Arch::Arm, RegGroup::Vec) => 32,
            (Arch::Arm, RegGroup::Mask) => 0,
            (_, RegGroup::Extra) => 0,
        }
    }

    /// The stack pointer register.
    pub fn sp(self) -> Reg {
        match self {
            Arch::X64 => Reg::phys(RegType::Gp64, 4),
            Arch::X86 => Reg::phys(RegType::Gp32, 4),
            Arch::Aarch64 => Reg::phys(RegType::Gp64, 31),
            Arch::Arm => Reg::phys(RegType::Gp32, 13),
        }
    }

    /// The frame pointer register.
    pub fn fp(self) -> Reg {
        match self {
            Arch::X64 => Reg::phys(RegType::Gp64, 5),
            Arch::X86 => Reg::phys(RegType::Gp32, 5),
            Arch::Aarch64 => Reg::phys(RegType::Gp64, 29),
            Arch::Arm => Reg::phys(RegType::Gp32, 11),
        }
    }

    /// The two gp scratch registers permanently reserved for the pipeline
    /// (cycle breaking, large-immediate materialization). The allocator
    /// never hands these to a virtual register.
    pub fn scratch_pair(self) -> (u8, u8) {
        match self {
            Arch::X64 | Arch::X86 => (10, 11),
            Arch::Aarch64 | Arch::Arm => (16, 17),
        }
    }

    /// Gp registers that can never be allocated: the stack pointer, the
    /// scratch pair, and arch-reserved registers (x18 platform register,
    /// xzr).
    pub fn reserved_gp_mask(self) -> u32 {
        let (s0, s1) = self.scratch_pair();
        let scratch = (1 << s0) | (1 << s1);
        match self {
            Arch::X64 | Arch::X86 => (1 << self.sp().phys_id()) | scratch,
            Arch::Aarch64 => {
                (1 << 31) | (1 << 30) | (1 << 29) | (1 << 18) | scratch
            }
            Arch::Arm => (1 << 13) | (1 << 15) | scratch,
        }
    }

    /// The registers the allocator may hand to virtual registers, as an id
    /// mask per group. Excludes the stack pointer, the reserved scratch
    /// pair and arch-reserved registers.
    pub fn allocatable_mask(self, group: RegGroup) -> u32 {
        use crate::support::low_mask;
        match group {
            RegGroup::Gp => low_mask(self.reg_count(RegGroup::Gp)) & !self.reserved_gp_mask(),
            RegGroup::Vec => match self {
                // Stay within the non-EVEX file on x86-64.
                Arch::X64 => 0xffff,
                Arch::X86 => 0xff,
                _ => low_mask(self.reg_count(RegGroup::Vec)),
            },
            // k0 encodes "no mask" and is not allocatable.
            RegGroup::Mask => low_mask(self.reg_count(RegGroup::Mask)) & !1,
            RegGroup::Extra => 0,
        }
    }

    /// Validate a physical register operand against this register file.
    pub fn check_phys(self, reg: Reg) -> CodegenResult<()> {
        let group = reg.group();
        match group {
            RegGroup::Extra => {
                // Not allocatable, but segment/control/debug ids still have
                // small files; accept what the encoders can express.
                if reg.raw_id() >= 16 {
                    return Err(Error::InvalidPhysId(reg.raw_id()));
                }
            }
            _ => {
                let count = self.reg_count(group);
                if count == 0 {
                    return Err(Error::InvalidRegGroup);
                }
                if reg.raw_id() >= count {
                    return Err(Error::InvalidPhysId(reg.raw_id()));
                }
            }
        }
        // 8-bit-high and x86-only files do not exist off x86.
        if matches!(self, Arch::Aarch64 | Arch::Arm)
            && matches!(
                reg.rtype(),
                RegType::Gp8Hi
                    | RegType::X86Mm
                    | RegType::X86St
                    | RegType::Segment
                    | RegType::Bnd
                    | RegType::Tile
            )
        {
            return Err(Error::InvalidRegType);
        }
        Ok(())
    }

    /// Does this architecture have a byte-addressed, variable-length
    /// encoding (x86 family)?
    pub fn is_x86_family(self) -> bool {
        matches!(self, Arch::X64 | Arch::X86)
    }

    /// Does this architecture have an encoder in this build?
    pub fn has_encoder(self) -> bool {
        match self {
            #[cfg(feature = "x64")]
            Arch::X64 => true,
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phys_id_bounds() {
        let r15 = Reg::phys(RegType::Gp64, 15);
        assert!(Arch::X64.check_phys(r15).is_ok());
        let bad = Reg::phys(RegType::Gp64, 16);
        assert_eq!(Arch::X64.check_phys(bad), Err(Error::InvalidPhysId(16)));
        let x28 = Reg::phys(RegType::Gp64, 28);
        assert!(Arch::Aarch64.check_phys(x28).is_ok());
        let ah = Reg::phys(RegType::Gp8Hi, 4);
        assert_eq!(Arch::Aarch64.check_phys(ah), Err(Error::InvalidRegType));
    }

    #[test]
    fn scratch_regs_are_reserved() {
        let (a, b) = Arch::X64.scratch_pair();
        assert_eq!((a, b), (10, 11));
        assert_ne!(Arch::X64.reserved_gp_mask() & (1 << a), 0);
        let (a, b) = Arch::Aarch64.scratch_pair();
        assert_eq!((a, b), (16, 17));
        assert_ne!(Arch::Aarch64.reserved_gp_mask() & (1 << b), 0);
    }
}
