//! Function signatures and their ABI expansion.
//!
//! A [`FuncSignature`] is the portable description of a function: calling
//! convention, return type and argument types. [`FuncDetail::init`] expands
//! it against the convention's register tables into concrete argument
//! locations (register id or stack offset), the used-register masks and the
//! stack-argument area size.

use smallvec::SmallVec;

use crate::callconv::CallConv;
use crate::isa::Arch;
use crate::operand::{Reg, RegGroup, RegType};
use crate::result::{CodegenResult, Error};
use crate::support::align_up;

/// Maximum number of declared arguments in a signature.
pub const MAX_FUNC_ARGS: usize = 32;

/// A portable value type flowing through function boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum TypeId {
    /// No value (void return).
    Void,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    /// Target pointer-sized integer.
    Ptr,
    /// IEEE single.
    F32,
    /// IEEE double.
    F64,
    /// 128-bit vector.
    V128,
    /// 256-bit vector.
    V256,
    /// 512-bit vector.
    V512,
}

impl TypeId {
    /// Size of the type in bytes on `arch`.
    pub fn bytes(self, arch: Arch) -> u32 {
        match self {
            TypeId::Void => 0,
            TypeId::I8 | TypeId::U8 => 1,
            TypeId::I16 | TypeId::U16 => 2,
            TypeId::I32 | TypeId::U32 | TypeId::F32 => 4,
            TypeId::I64 | TypeId::U64 | TypeId::F64 => 8,
            TypeId::Ptr => arch.ptr_bytes(),
            TypeId::V128 => 16,
            TypeId::V256 => 32,
            TypeId::V512 => 64,
        }
    }

    /// Is this a scalar float?
    pub fn is_float(self) -> bool {
        matches!(self, TypeId::F32 | TypeId::F64)
    }

    /// Is this a vector type?
    pub fn is_vec(self) -> bool {
        matches!(self, TypeId::V128 | TypeId::V256 | TypeId::V512)
    }

    /// The register group values of this type travel in, ignoring
    /// soft-float conventions.
    pub fn reg_group(self) -> RegGroup {
        if self.is_float() || self.is_vec() { RegGroup::Vec } else { RegGroup::Gp }
    }

    /// The register type a value of this type occupies on `arch`.
    pub fn reg_type(self, arch: Arch) -> RegType {
        match self {
            TypeId::V512 => RegType::Vec512,
            TypeId::V256 => RegType::Vec256,
            TypeId::V128 | TypeId::F32 | TypeId::F64 => RegType::Vec128,
            _ => {
                if self.bytes(arch) == 8 || matches!(self, TypeId::Ptr) && arch.ptr_bytes() == 8 {
                    RegType::Gp64
                } else {
                    RegType::Gp32
                }
            }
        }
    }
}

/// A function signature: calling convention, return type and argument
/// types, with an optional vararg pivot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FuncSignature {
    /// The calling convention.
    pub call_conv: CallConv,
    /// The return type; `Void` for none.
    pub ret: TypeId,
    /// Argument types in order.
    pub args: Vec<TypeId>,
    /// Index of the first vararg argument, if the function is variadic.
    pub vararg_index: Option<u32>,
}

impl FuncSignature {
    /// A non-variadic signature.
    pub fn new(call_conv: CallConv, ret: TypeId, args: &[TypeId]) -> Self {
        Self { call_conv, ret, args: args.to_vec(), vararg_index: None }
    }

    /// A variadic signature; `pivot` is the index of the first variable
    /// argument.
    pub fn with_varargs(call_conv: CallConv, ret: TypeId, args: &[TypeId], pivot: u32) -> Self {
        Self { call_conv, ret, args: args.to_vec(), vararg_index: Some(pivot) }
    }
}

/// One argument or return value lowered to its ABI location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuncValue {
    /// Passed in a register.
    Reg {
        /// The concrete physical register.
        reg: Reg,
        /// The portable type of the value.
        type_id: TypeId,
    },
    /// Passed on the stack at `offset` from the outgoing argument base.
    Stack {
        /// Byte offset within the caller's outgoing argument area.
        offset: i32,
        /// The portable type of the value.
        type_id: TypeId,
    },
    /// Passed indirectly through a hidden pointer. Reserved for aggregate
    /// support; the current type set never produces it.
    Indirect {
        /// The register carrying the pointer.
        reg: Reg,
        /// The pointed-to type.
        type_id: TypeId,
    },
}

impl FuncValue {
    /// The physical register, if the value travels in one.
    pub fn reg(&self) -> Option<Reg> {
        match self {
            FuncValue::Reg { reg, .. } | FuncValue::Indirect { reg, .. } => Some(*reg),
            FuncValue::Stack { .. } => None,
        }
    }

    /// The portable type of the value.
    pub fn type_id(&self) -> TypeId {
        match self {
            FuncValue::Reg { type_id, .. }
            | FuncValue::Stack { type_id, .. }
            | FuncValue::Indirect { type_id, .. } => *type_id,
        }
    }
}

/// The expanded signature: concrete locations for every argument and the
/// return value, plus the register-usage summary.
#[derive(Clone, Debug)]
pub struct FuncDetail {
    /// The convention this expansion used.
    pub call_conv: CallConv,
    /// Lowered argument locations, in declaration order.
    pub args: SmallVec<[FuncValue; 8]>,
    /// The lowered return value, if the function returns one.
    pub ret: Option<FuncValue>,
    /// Argument registers used, as id masks indexed by
    /// [`RegGroup::index`].
    pub used: [u32; RegGroup::NUM_ALLOCATABLE],
    /// Total bytes of stack-passed arguments (excluding shadow space).
    pub stack_arg_size: u32,
    /// Bytes the callee pops on return (`ret imm`), zero for caller-pops
    /// conventions.
    pub callee_pop_size: u32,
}

impl FuncDetail {
    /// Expand `sig` for a compilation targeting `arch`.
    ///
    /// Walks the arguments in order and classifies each as register or
    /// stack per the convention's rules: positional slots on Windows x64,
    /// soft-float gp passing on AAPCS, stack-only varargs on Apple AArch64,
    /// 16-byte alignment for over-8-byte stack arguments.
    pub fn init(sig: &FuncSignature, arch: Arch) -> CodegenResult<Self> {
        let scheme = sig.call_conv.scheme();
        if scheme.arch != arch {
            return Err(Error::InvalidArch);
        }
        if sig.args.len() > MAX_FUNC_ARGS {
            return Err(Error::InvalidArgument);
        }
        if let Some(pivot) = sig.vararg_index {
            if pivot as usize > sig.args.len() {
                return Err(Error::InvalidArgument);
            }
        }

        let word = arch.ptr_bytes();
        let mut detail = FuncDetail {
            call_conv: sig.call_conv,
            args: SmallVec::new(),
            ret: None,
            used: [0; RegGroup::NUM_ALLOCATABLE],
            stack_arg_size: 0,
            callee_pop_size: 0,
        };

        let mut next_gp = 0usize;
        let mut next_vec = 0usize;
        // Stack offsets start after the shadow space, which the caller
        // always reserves on conventions that have one.
        let mut next_stack = scheme.shadow_space;

        for (index, &ty) in sig.args.iter().enumerate() {
            if ty == TypeId::Void {
                return Err(Error::InvalidArgument);
            }
            let is_vararg = sig.vararg_index.map_or(false, |p| index as u32 >= p);
            let size = ty.bytes(arch).max(1);

            // Which file does this argument want?
            let wants_vec = ty.reg_group() == RegGroup::Vec && !scheme.float_args_in_gp;
            // Vararg floats on Windows x64 shadow into the gp slot so the
            // callee can spill them without knowing the types.
            let vararg_float_in_gp =
                is_vararg && wants_vec && scheme.positional_slots && !ty.is_vec();

            let forced_stack = is_vararg && scheme.vararg_on_stack;

            let assigned = if forced_stack {
                None
            } else if scheme.positional_slots {
                // Windows x64: argument n may only use slot n.
                let slot = index;
                if vararg_float_in_gp || !wants_vec {
                    scheme.gp_args.get(slot).map(|&id| (RegGroup::Gp, id))
                } else {
                    scheme.vec_args.get(slot).map(|&id| (RegGroup::Vec, id))
                }
            } else if wants_vec {
                let got = scheme.vec_args.get(next_vec).map(|&id| (RegGroup::Vec, id));
                if got.is_some() {
                    next_vec += 1;
                }
                got
            } else {
                // Soft-float doubles consume an aligned even/odd gp pair;
                // the recorded location is the even member.
                let double_in_gp = scheme.float_args_in_gp && size > word;
                if double_in_gp && next_gp % 2 != 0 {
                    next_gp += 1;
                }
                let needed = if double_in_gp { 2 } else { 1 };
                if next_gp + needed <= scheme.gp_args.len() {
                    let id = scheme.gp_args[next_gp];
                    next_gp += needed;
                    Some((RegGroup::Gp, id))
                } else {
                    next_gp = scheme.gp_args.len();
                    None
                }
            };

            match assigned {
                Some((group, id)) => {
                    let rtype = if group == RegGroup::Gp {
                        if word == 8 && (size == 8 || ty == TypeId::Ptr) {
                            RegType::Gp64
                        } else if word == 8 {
                            // Sub-word integers still occupy a full slot;
                            // the value lives in the low bits.
                            RegType::Gp32
                        } else {
                            RegType::Gp32
                        }
                    } else {
                        ty.reg_type(arch)
                    };
                    detail.used[group.index()] |= 1 << id;
                    detail.args.push(FuncValue::Reg { reg: Reg::phys(rtype, id), type_id: ty });
                }
                None => {
                    // Over-8-byte arguments get 16-byte stack alignment;
                    // everything else is word-aligned.
                    let align = if size > 8 { 16 } else { word };
                    next_stack = align_up(next_stack, align);
                    detail.args.push(FuncValue::Stack { offset: next_stack as i32, type_id: ty });
                    next_stack += align_up(size, word);
                }
            }
        }

        detail.stack_arg_size = next_stack - scheme.shadow_space;
        if scheme.callee_pops {
            detail.callee_pop_size = detail.stack_arg_size;
        }

        detail.ret = match sig.ret {
            TypeId::Void => None,
            ty if ty.reg_group() == RegGroup::Vec && !scheme.float_args_in_gp => {
                Some(FuncValue::Reg { reg: Reg::phys(ty.reg_type(arch), 0), type_id: ty })
            }
            ty => {
                if ty.bytes(arch) > word {
                    // Multi-register scalar returns (i64 on 32-bit) are not
                    // modeled.
                    return Err(Error::NotImplemented);
                }
                Some(FuncValue::Reg { reg: Reg::phys(ty.reg_type(arch), 0), type_id: ty })
            }
        };

        Ok(detail)
    }

    /// The number of lowered arguments.
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// The lowered location of argument `index`.
    pub fn arg(&self, index: usize) -> Option<&FuncValue> {
        self.args.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysv_six_gp_args_in_registers() {
        let sig = FuncSignature::new(CallConv::X64SystemV, TypeId::I64, &[TypeId::I64; 6]);
        let d = FuncDetail::init(&sig, Arch::X64).unwrap();
        let ids: Vec<u8> =
            d.args.iter().map(|a| a.reg().unwrap().phys_id()).collect();
        assert_eq!(ids, vec![7, 6, 2, 1, 8, 9]);
        assert_eq!(d.stack_arg_size, 0);
        assert_eq!(d.ret.unwrap().reg().unwrap().phys_id(), 0);
    }

    #[test]
    fn sysv_seventh_arg_spills_to_stack() {
        let sig = FuncSignature::new(CallConv::X64SystemV, TypeId::Void, &[TypeId::I64; 8]);
        let d = FuncDetail::init(&sig, Arch::X64).unwrap();
        assert_eq!(d.args[6], FuncValue::Stack { offset: 0, type_id: TypeId::I64 });
        assert_eq!(d.args[7], FuncValue::Stack { offset: 8, type_id: TypeId::I64 });
        assert_eq!(d.stack_arg_size, 16);
        assert!(d.ret.is_none());
    }

    #[test]
    fn windows_positional_slots() {
        // void(i8*, i32, i32) takes rcx, rdx, r8.
        let sig = FuncSignature::new(
            CallConv::X64Windows,
            TypeId::Void,
            &[TypeId::Ptr, TypeId::I32, TypeId::I32],
        );
        let d = FuncDetail::init(&sig, Arch::X64).unwrap();
        let ids: Vec<u8> = d.args.iter().map(|a| a.reg().unwrap().phys_id()).collect();
        assert_eq!(ids, vec![1, 2, 8]);
        // A float in position 1 takes xmm1, not xmm0.
        let sig =
            FuncSignature::new(CallConv::X64Windows, TypeId::Void, &[TypeId::I32, TypeId::F64]);
        let d = FuncDetail::init(&sig, Arch::X64).unwrap();
        assert_eq!(d.args[1].reg().unwrap().phys_id(), 1);
        assert_eq!(d.args[1].reg().unwrap().group(), RegGroup::Vec);
        // Stack args start after the 32-byte shadow space.
        let sig = FuncSignature::new(CallConv::X64Windows, TypeId::Void, &[TypeId::I64; 5]);
        let d = FuncDetail::init(&sig, Arch::X64).unwrap();
        assert_eq!(d.args[4], FuncValue::Stack { offset: 32, type_id: TypeId::I64 });
    }

    #[test]
    fn aapcs64_mixed_files() {
        let sig = FuncSignature::new(
            CallConv::Aapcs64,
            TypeId::F64,
            &[TypeId::I64, TypeId::F64, TypeId::I64, TypeId::F64],
        );
        let d = FuncDetail::init(&sig, Arch::Aarch64).unwrap();
        // Integer and vector files advance independently.
        assert_eq!(d.args[0].reg().unwrap().phys_id(), 0);
        assert_eq!(d.args[1].reg().unwrap().phys_id(), 0);
        assert_eq!(d.args[2].reg().unwrap().phys_id(), 1);
        assert_eq!(d.args[3].reg().unwrap().phys_id(), 1);
        assert_eq!(d.used[RegGroup::Gp.index()], 0b11);
        assert_eq!(d.used[RegGroup::Vec.index()], 0b11);
    }

    #[test]
    fn apple_varargs_go_on_stack() {
        let sig = FuncSignature::with_varargs(
            CallConv::AppleAarch64,
            TypeId::I32,
            &[TypeId::Ptr, TypeId::I64],
            1,
        );
        let d = FuncDetail::init(&sig, Arch::Aarch64).unwrap();
        assert!(d.args[0].reg().is_some());
        assert!(matches!(d.args[1], FuncValue::Stack { .. }));
        // The same signature under plain AAPCS64 stays in registers.
        let sig = FuncSignature::with_varargs(
            CallConv::Aapcs64,
            TypeId::I32,
            &[TypeId::Ptr, TypeId::I64],
            1,
        );
        let d = FuncDetail::init(&sig, Arch::Aarch64).unwrap();
        assert!(d.args[1].reg().is_some());
    }

    #[test]
    fn stdcall_callee_pop_size() {
        let sig = FuncSignature::new(CallConv::StdCall, TypeId::I32, &[TypeId::I32; 3]);
        let d = FuncDetail::init(&sig, Arch::X86).unwrap();
        assert_eq!(d.stack_arg_size, 12);
        assert_eq!(d.callee_pop_size, 12);
        let sig = FuncSignature::new(CallConv::CDecl, TypeId::I32, &[TypeId::I32; 3]);
        let d = FuncDetail::init(&sig, Arch::X86).unwrap();
        assert_eq!(d.callee_pop_size, 0);
    }

    #[test]
    fn arch_mismatch_and_limits() {
        let sig = FuncSignature::new(CallConv::X64SystemV, TypeId::Void, &[]);
        assert!(matches!(FuncDetail::init(&sig, Arch::Aarch64), Err(Error::InvalidArch)));
        let sig =
            FuncSignature::new(CallConv::X64SystemV, TypeId::Void, &[TypeId::I32; MAX_FUNC_ARGS + 1]);
        assert!(matches!(FuncDetail::init(&sig, Arch::X64), Err(Error::InvalidArgument)));
    }
}
