//! Instruction operands: register handles, memory operands, immediates and
//! label references.
//!
//! A register handle is either *physical* (its id indexes the target's
//! register file) or *virtual* (its id is drawn from the compilation's
//! virtual-id pool and will be rewritten by the register allocator). Both
//! forms share one representation so operands can flow through the builder,
//! the allocator and the encoder unchanged.

use crate::entity::entity_impl;
use crate::label::Label;

/// First register id denoting a virtual register. Physical ids of every
/// supported register file are far below this.
pub const VIRT_ID_BASE: u32 = 0x1_0000;

/// A virtual register handle into the compilation's virtual-register pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VirtReg(u32);
entity_impl!(VirtReg, "v");

/// Register banks the allocator works over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegGroup {
    /// General-purpose integer registers.
    Gp,
    /// Vector/floating-point registers (xmm/ymm/zmm, v0-v31).
    Vec,
    /// AVX-512 mask registers.
    Mask,
    /// Everything the allocator never touches (segment, control, ...).
    Extra,
}

impl RegGroup {
    /// Number of allocatable groups.
    pub const NUM_ALLOCATABLE: usize = 3;

    /// Index used for per-group tables. Only allocatable groups have one.
    pub fn index(self) -> usize {
        match self {
            RegGroup::Gp => 0,
            RegGroup::Vec => 1,
            RegGroup::Mask => 2,
            RegGroup::Extra => panic!("non-allocatable register group"),
        }
    }

    /// Is this a group the register allocator assigns from?
    pub fn is_allocatable(self) -> bool {
        !matches!(self, RegGroup::Extra)
    }
}

/// The physical type of a register operand.
///
/// For x86 general-purpose registers the same physical id denotes the low
/// bits of the wider register, so converting between widths changes only the
/// type, never the id. Likewise `xmm(i)` is the low lane of `ymm(i)` is the
/// low lane of `zmm(i)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegType {
    /// Low 8-bit general purpose (al, cl, ..., w0 low byte).
    Gp8Lo,
    /// High 8-bit x86 general purpose (ah, ch, dh, bh).
    Gp8Hi,
    /// 16-bit general purpose.
    Gp16,
    /// 32-bit general purpose.
    Gp32,
    /// 64-bit general purpose.
    Gp64,
    /// 128-bit vector (xmm / v.16b).
    Vec128,
    /// 256-bit vector (ymm).
    Vec256,
    /// 512-bit vector (zmm).
    Vec512,
    /// AVX-512 mask register (k0-k7).
    Mask,
    /// x86 MMX register.
    X86Mm,
    /// x86 FPU stack register.
    X86St,
    /// Segment register.
    Segment,
    /// Control register.
    Control,
    /// Debug register.
    Debug,
    /// Program counter (aarch64 pc pseudo-register).
    Pc,
    /// x86 bound register.
    Bnd,
    /// AMX tile register.
    Tile,
}

impl RegType {
    /// The register group this type allocates from.
    pub fn group(self) -> RegGroup {
        match self {
            RegType::Gp8Lo | RegType::Gp8Hi | RegType::Gp16 | RegType::Gp32 | RegType::Gp64 => {
                RegGroup::Gp
            }
            RegType::Vec128 | RegType::Vec256 | RegType::Vec512 => RegGroup::Vec,
            RegType::Mask => RegGroup::Mask,
            _ => RegGroup::Extra,
        }
    }

    /// Size of a register of this type in bytes. Zero for types without a
    /// meaningful byte width (pc, st).
    pub fn bytes(self) -> u32 {
        match self {
            RegType::Gp8Lo | RegType::Gp8Hi => 1,
            RegType::Gp16 | RegType::Segment => 2,
            RegType::Gp32 => 4,
            RegType::Gp64 | RegType::X86Mm | RegType::Mask | RegType::Pc => 8,
            RegType::Vec128 | RegType::Bnd => 16,
            RegType::Vec256 => 32,
            RegType::Vec512 => 64,
            RegType::Control | RegType::Debug => 8,
            RegType::X86St => 10,
            RegType::Tile => 1024,
        }
    }
}

/// A register operand: a type plus a physical or virtual id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Reg {
    rtype: RegType,
    id: u32,
}

impl Reg {
    /// A physical register of the given type.
    pub fn phys(rtype: RegType, id: u8) -> Self {
        Self { rtype, id: id as u32 }
    }

    /// A register operand naming a virtual register.
    pub fn virt(rtype: RegType, v: VirtReg) -> Self {
        Self { rtype, id: VIRT_ID_BASE + v.as_u32() }
    }

    /// The register type.
    pub fn rtype(self) -> RegType {
        self.rtype
    }

    /// The register group.
    pub fn group(self) -> RegGroup {
        self.rtype.group()
    }

    /// Is this a virtual register?
    pub fn is_virt(self) -> bool {
        self.id >= VIRT_ID_BASE
    }

    /// The virtual register this operand names, if it is virtual.
    pub fn as_virt(self) -> Option<VirtReg> {
        if self.is_virt() { Some(VirtReg::from_u32(self.id - VIRT_ID_BASE)) } else { None }
    }

    /// The physical id. Panics on virtual registers.
    pub fn phys_id(self) -> u8 {
        debug_assert!(!self.is_virt(), "physical id of a virtual register");
        self.id as u8
    }

    /// Raw id, physical or virtual-encoded.
    pub fn raw_id(self) -> u32 {
        self.id
    }

    /// The same register viewed at a different type. The id is preserved:
    /// for x86 gp this is the low-bits aliasing rule, for vectors the
    /// xmm ⊂ ymm ⊂ zmm lane rule.
    pub fn with_rtype(self, rtype: RegType) -> Self {
        Self { rtype, id: self.id }
    }
}

/// A memory operand: `[base + index * scale + disp]` with an access size.
///
/// Either register may itself be virtual before allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mem {
    /// Base register, if any.
    pub base: Option<Reg>,
    /// Index register, if any.
    pub index: Option<Reg>,
    /// Scale applied to the index register: 1, 2, 4 or 8.
    pub scale: u8,
    /// Signed 32-bit displacement.
    pub disp: i32,
    /// Access size in bytes; 0 when the instruction implies it.
    pub size: u8,
    /// When set, `disp` is an offset into the function's spill area and is
    /// rebased once the final frame layout is known.
    pub frame_slot: bool,
    /// When set, `disp` is an offset into the caller's argument area and
    /// is rebased once the final frame layout is known.
    pub arg_slot: bool,
}

impl Mem {
    /// `[base + disp]`.
    pub fn base_disp(base: Reg, disp: i32) -> Self {
        Self {
            base: Some(base),
            index: None,
            scale: 1,
            disp,
            size: 0,
            frame_slot: false,
            arg_slot: false,
        }
    }

    /// `[base + index * scale + disp]`.
    pub fn base_index(base: Reg, index: Reg, scale: u8, disp: i32) -> Self {
        debug_assert!(matches!(scale, 1 | 2 | 4 | 8));
        Self {
            base: Some(base),
            index: Some(index),
            scale,
            disp,
            size: 0,
            frame_slot: false,
            arg_slot: false,
        }
    }

    /// An absolute address with no registers.
    pub fn abs(disp: i32) -> Self {
        Self {
            base: None,
            index: None,
            scale: 1,
            disp,
            size: 0,
            frame_slot: false,
            arg_slot: false,
        }
    }

    /// The same location with the displacement adjusted by `delta`.
    pub fn with_offset(self, delta: i32) -> Self {
        Self { disp: self.disp.wrapping_add(delta), ..self }
    }

    /// The same location with a different access size.
    pub fn with_size(self, size: u8) -> Self {
        Self { size, ..self }
    }
}

/// An immediate operand: a signed 64-bit value with an optional width hint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Imm {
    /// The value, sign-extended to 64 bits.
    pub value: i64,
    /// Bit-width hint (8, 16, 32 or 64), if the caller cares.
    pub width: Option<u8>,
}

impl Imm {
    /// An immediate with no width hint.
    pub fn new(value: i64) -> Self {
        Self { value, width: None }
    }

    /// An immediate with an explicit width hint.
    pub fn with_width(value: i64, width: u8) -> Self {
        debug_assert!(matches!(width, 8 | 16 | 32 | 64));
        Self { value, width: Some(width) }
    }
}

impl From<i64> for Imm {
    fn from(value: i64) -> Self {
        Imm::new(value)
    }
}

impl From<i32> for Imm {
    fn from(value: i32) -> Self {
        Imm::new(value as i64)
    }
}

/// An instruction operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    /// A register, physical or virtual.
    Reg(Reg),
    /// A memory location.
    Mem(Mem),
    /// An immediate value.
    Imm(Imm),
    /// A label reference.
    Label(Label),
}

impl From<Reg> for Operand {
    fn from(r: Reg) -> Self {
        Operand::Reg(r)
    }
}

impl From<Mem> for Operand {
    fn from(m: Mem) -> Self {
        Operand::Mem(m)
    }
}

impl From<Imm> for Operand {
    fn from(i: Imm) -> Self {
        Operand::Imm(i)
    }
}

impl From<Label> for Operand {
    fn from(l: Label) -> Self {
        Operand::Label(l)
    }
}

impl Operand {
    /// The register, if this operand is one.
    pub fn as_reg(&self) -> Option<Reg> {
        match self {
            Operand::Reg(r) => Some(*r),
            _ => None,
        }
    }

    /// The memory operand, if this operand is one.
    pub fn as_mem(&self) -> Option<Mem> {
        match self {
            Operand::Mem(m) => Some(*m),
            _ => None,
        }
    }

    /// The label, if this operand is one.
    pub fn as_label(&self) -> Option<Label> {
        match self {
            Operand::Label(l) => Some(*l),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gp_aliasing_preserves_id() {
        let rdi = Reg::phys(RegType::Gp64, 7);
        let edi = rdi.with_rtype(RegType::Gp32);
        assert_eq!(edi.phys_id(), 7);
        assert_eq!(edi.rtype(), RegType::Gp32);
        assert_eq!(edi.group(), RegGroup::Gp);
    }

    #[test]
    fn vec_aliasing_preserves_id() {
        let zmm3 = Reg::phys(RegType::Vec512, 3);
        let xmm3 = zmm3.with_rtype(RegType::Vec128);
        assert_eq!(xmm3.phys_id(), 3);
        assert_eq!(xmm3.rtype().bytes(), 16);
    }

    #[test]
    fn virtual_ids_are_disjoint_from_physical() {
        let v = Reg::virt(RegType::Gp64, VirtReg::from_u32(0));
        assert!(v.is_virt());
        assert_eq!(v.as_virt(), Some(VirtReg::from_u32(0)));
        let p = Reg::phys(RegType::Gp64, 15);
        assert!(!p.is_virt());
        assert_eq!(p.as_virt(), None);
    }

    #[test]
    fn mem_views_are_pure() {
        let base = Reg::phys(RegType::Gp64, 5);
        let m = Mem::base_disp(base, 8).with_size(4);
        let m2 = m.with_offset(8);
        assert_eq!(m.disp, 8);
        assert_eq!(m2.disp, 16);
        assert_eq!(m2.size, 4);
    }
}
