//! The mnemonic surface of the builder.
//!
//! Each method constructs an [`InstNode`] for the compilation's target
//! architecture and appends it at the cursor. Generic names (`mov`, `add`,
//! `jmp`, ...) map onto whichever instruction carries that meaning on the
//! target; x86-only forms return `InvalidArch` elsewhere.

use smallvec::SmallVec;

use crate::context::Compiler;
use crate::ir::{InstId, InstNode, InstOptions};
use crate::isa::Arch;
use crate::label::Label;
use crate::operand::Operand;
use crate::result::{CodegenResult, Error};

#[cfg(feature = "aarch64")]
use crate::isa::aarch64::{A64Cond, A64Inst};
#[cfg(feature = "x64")]
use crate::isa::x64::{Cond, X64Inst};

/// A portable condition for conditional jumps, translated per target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CondCode {
    /// Equal / zero.
    Eq,
    /// Not equal / not zero.
    Ne,
    /// Signed less-than.
    Lt,
    /// Signed less-or-equal.
    Le,
    /// Signed greater-than.
    Gt,
    /// Signed greater-or-equal.
    Ge,
    /// Unsigned below.
    B,
    /// Unsigned above.
    A,
}

impl Compiler {
    fn node(&mut self, inst: InstId, operands: &[Operand]) -> CodegenResult<()> {
        self.emit_node(InstNode {
            inst,
            operands: SmallVec::from_slice(operands),
            options: InstOptions::default(),
        })
    }

    fn node_short(&mut self, inst: InstId, operands: &[Operand]) -> CodegenResult<()> {
        self.emit_node(InstNode {
            inst,
            operands: SmallVec::from_slice(operands),
            options: InstOptions { short_form: true },
        })
    }

    fn x64_only(&mut self) -> CodegenResult<()> {
        if self.arch() != Arch::X64 {
            return Err(self.report(Error::InvalidArch, "x86-only mnemonic"));
        }
        Ok(())
    }

    /// Emit a generic instruction by id with explicit operands.
    pub fn emit(&mut self, inst: InstId, operands: &[Operand]) -> CodegenResult<()> {
        self.node(inst, operands)
    }

    /// `dst := src` (register, memory or immediate source).
    pub fn mov(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> CodegenResult<()> {
        let (dst, src) = (dst.into(), src.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Mov), &[dst, src]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => match src {
                Operand::Mem(_) => self.node(InstId::A64(A64Inst::Ldr), &[dst, src]),
                _ if matches!(dst, Operand::Mem(_)) => {
                    self.node(InstId::A64(A64Inst::Str), &[dst, src])
                }
                _ => self.node(InstId::A64(A64Inst::Mov), &[dst, src]),
            },
            _ => Err(self.report(Error::InvalidArch, "mov")),
        }
    }

    /// `dst += src`.
    pub fn add(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> CodegenResult<()> {
        let (dst, src) = (dst.into(), src.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Add), &[dst, src]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::Add), &[dst, src]),
            _ => Err(self.report(Error::InvalidArch, "add")),
        }
    }

    /// `dst -= src`.
    pub fn sub(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> CodegenResult<()> {
        let (dst, src) = (dst.into(), src.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Sub), &[dst, src]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::Sub), &[dst, src]),
            _ => Err(self.report(Error::InvalidArch, "sub")),
        }
    }

    /// `dst *= src` (signed).
    pub fn mul(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> CodegenResult<()> {
        let (dst, src) = (dst.into(), src.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::IMul), &[dst, src]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::Mul), &[dst, src]),
            _ => Err(self.report(Error::InvalidArch, "mul")),
        }
    }

    /// Bitwise and.
    pub fn and_(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> CodegenResult<()> {
        let (dst, src) = (dst.into(), src.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::And), &[dst, src]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::And), &[dst, src]),
            _ => Err(self.report(Error::InvalidArch, "and")),
        }
    }

    /// Bitwise or.
    pub fn or_(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> CodegenResult<()> {
        let (dst, src) = (dst.into(), src.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Or), &[dst, src]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::Orr), &[dst, src]),
            _ => Err(self.report(Error::InvalidArch, "or")),
        }
    }

    /// Bitwise exclusive or.
    pub fn xor_(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> CodegenResult<()> {
        let (dst, src) = (dst.into(), src.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Xor), &[dst, src]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::Eor), &[dst, src]),
            _ => Err(self.report(Error::InvalidArch, "xor")),
        }
    }

    /// Compare `a` and `b`, setting flags.
    pub fn cmp(&mut self, a: impl Into<Operand>, b: impl Into<Operand>) -> CodegenResult<()> {
        let (a, b) = (a.into(), b.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Cmp), &[a, b]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::Cmp), &[a, b]),
            _ => Err(self.report(Error::InvalidArch, "cmp")),
        }
    }

    /// Shift left.
    pub fn shl(&mut self, dst: impl Into<Operand>, n: impl Into<Operand>) -> CodegenResult<()> {
        let (dst, n) = (dst.into(), n.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Shl), &[dst, n]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::Lsl), &[dst, n]),
            _ => Err(self.report(Error::InvalidArch, "shl")),
        }
    }

    /// Logical shift right.
    pub fn shr(&mut self, dst: impl Into<Operand>, n: impl Into<Operand>) -> CodegenResult<()> {
        let (dst, n) = (dst.into(), n.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Shr), &[dst, n]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::Lsr), &[dst, n]),
            _ => Err(self.report(Error::InvalidArch, "shr")),
        }
    }

    /// Arithmetic shift right.
    pub fn sar(&mut self, dst: impl Into<Operand>, n: impl Into<Operand>) -> CodegenResult<()> {
        let (dst, n) = (dst.into(), n.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Sar), &[dst, n]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::Asr), &[dst, n]),
            _ => Err(self.report(Error::InvalidArch, "sar")),
        }
    }

    /// Increment by one.
    pub fn inc(&mut self, dst: impl Into<Operand>) -> CodegenResult<()> {
        let dst = dst.into();
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Inc), &[dst]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => {
                self.node(InstId::A64(A64Inst::Add), &[dst, crate::operand::Imm::new(1).into()])
            }
            _ => Err(self.report(Error::InvalidArch, "inc")),
        }
    }

    /// Decrement by one.
    pub fn dec(&mut self, dst: impl Into<Operand>) -> CodegenResult<()> {
        let dst = dst.into();
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Dec), &[dst]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => {
                self.node(InstId::A64(A64Inst::Sub), &[dst, crate::operand::Imm::new(1).into()])
            }
            _ => Err(self.report(Error::InvalidArch, "dec")),
        }
    }

    /// x86 `test a, b`.
    pub fn test(&mut self, a: impl Into<Operand>, b: impl Into<Operand>) -> CodegenResult<()> {
        self.x64_only()?;
        #[cfg(feature = "x64")]
        return self.node(InstId::X64(X64Inst::Test), &[a.into(), b.into()]);
        #[cfg(not(feature = "x64"))]
        unreachable!()
    }

    /// x86 `lea dst, [mem]` or `lea dst, [label]`.
    pub fn lea(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> CodegenResult<()> {
        let (dst, src) = (dst.into(), src.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Lea), &[dst, src]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => match src {
                Operand::Label(_) => self.node(InstId::A64(A64Inst::Adr), &[dst, src]),
                _ => Err(self.report(Error::InvalidArch, "lea")),
            },
            _ => Err(self.report(Error::InvalidArch, "lea")),
        }
    }

    /// Unconditional jump to `label`.
    pub fn jmp(&mut self, label: Label) -> CodegenResult<()> {
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Jmp), &[label.into()]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::B), &[label.into()]),
            _ => Err(self.report(Error::InvalidArch, "jmp")),
        }
    }

    /// Unconditional jump using the rel8 form; out-of-range targets fail
    /// at finalize.
    pub fn jmp_short(&mut self, label: Label) -> CodegenResult<()> {
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node_short(InstId::X64(X64Inst::Jmp), &[label.into()]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::B), &[label.into()]),
            _ => Err(self.report(Error::InvalidArch, "jmp_short")),
        }
    }

    /// Conditional jump on the given condition.
    pub fn jcc(&mut self, cond: CondCode, label: Label) -> CodegenResult<()> {
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => {
                let cc = match cond {
                    CondCode::Eq => Cond::E,
                    CondCode::Ne => Cond::Ne,
                    CondCode::Lt => Cond::L,
                    CondCode::Le => Cond::Le,
                    CondCode::Gt => Cond::G,
                    CondCode::Ge => Cond::Ge,
                    CondCode::B => Cond::B,
                    CondCode::A => Cond::A,
                };
                self.node(InstId::X64(X64Inst::Jcc(cc)), &[label.into()])
            }
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => {
                let cc = match cond {
                    CondCode::Eq => A64Cond::Eq,
                    CondCode::Ne => A64Cond::Ne,
                    CondCode::Lt => A64Cond::Lt,
                    CondCode::Le => A64Cond::Le,
                    CondCode::Gt => A64Cond::Gt,
                    CondCode::Ge => A64Cond::Ge,
                    CondCode::B => A64Cond::Lo,
                    CondCode::A => A64Cond::Hi,
                };
                self.node(InstId::A64(A64Inst::BCond(cc)), &[label.into()])
            }
            _ => Err(self.report(Error::InvalidArch, "jcc")),
        }
    }

    /// Jump if equal / zero.
    pub fn jz(&mut self, label: Label) -> CodegenResult<()> {
        self.jcc(CondCode::Eq, label)
    }

    /// Jump if not equal / nonzero.
    pub fn jnz(&mut self, label: Label) -> CodegenResult<()> {
        self.jcc(CondCode::Ne, label)
    }

    /// No-operation.
    pub fn nop(&mut self) -> CodegenResult<()> {
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Nop), &[]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::Nop), &[]),
            _ => Err(self.report(Error::InvalidArch, "nop")),
        }
    }

    /// Unaligned 128-bit vector move (load, store or register).
    pub fn movups(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> CodegenResult<()> {
        let (dst, src) = (dst.into(), src.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::Movups), &[dst, src]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => match (&dst, &src) {
                (_, Operand::Mem(_)) => self.node(InstId::A64(A64Inst::Ldr), &[dst, src]),
                (Operand::Mem(_), _) => self.node(InstId::A64(A64Inst::Str), &[dst, src]),
                _ => self.node(InstId::A64(A64Inst::Mov), &[dst, src]),
            },
            _ => Err(self.report(Error::InvalidArch, "movups")),
        }
    }

    /// Unaligned 128-bit integer vector move (x86 `movdqu`).
    pub fn movdqu(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> CodegenResult<()> {
        self.x64_only()?;
        #[cfg(feature = "x64")]
        return self.node(InstId::X64(X64Inst::Movdqu), &[dst.into(), src.into()]);
        #[cfg(not(feature = "x64"))]
        unreachable!()
    }

    /// Packed integer xor (x86 `pxor`).
    pub fn pxor(&mut self, dst: impl Into<Operand>, src: impl Into<Operand>) -> CodegenResult<()> {
        self.x64_only()?;
        #[cfg(feature = "x64")]
        return self.node(InstId::X64(X64Inst::Pxor), &[dst.into(), src.into()]);
        #[cfg(not(feature = "x64"))]
        unreachable!()
    }

    /// AVX unaligned vector move.
    pub fn vmovups(
        &mut self,
        dst: impl Into<Operand>,
        src: impl Into<Operand>,
    ) -> CodegenResult<()> {
        self.x64_only()?;
        #[cfg(feature = "x64")]
        return self.node(InstId::X64(X64Inst::VMovups), &[dst.into(), src.into()]);
        #[cfg(not(feature = "x64"))]
        unreachable!()
    }

    /// Packed single-precision add: `dst = a + b`.
    pub fn vaddps(
        &mut self,
        dst: impl Into<Operand>,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
    ) -> CodegenResult<()> {
        let (dst, a, b) = (dst.into(), a.into(), b.into());
        match self.arch() {
            #[cfg(feature = "x64")]
            Arch::X64 => self.node(InstId::X64(X64Inst::VAddps), &[dst, a, b]),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => self.node(InstId::A64(A64Inst::FAddV4S), &[dst, a, b]),
            _ => Err(self.report(Error::InvalidArch, "vaddps")),
        }
    }

    /// Scalar double fused multiply-add: `dst += a * b`.
    pub fn vfmadd231sd(
        &mut self,
        dst: impl Into<Operand>,
        a: impl Into<Operand>,
        b: impl Into<Operand>,
    ) -> CodegenResult<()> {
        self.x64_only()?;
        #[cfg(feature = "x64")]
        return self.node(InstId::X64(X64Inst::VFmadd231sd), &[dst.into(), a.into(), b.into()]);
        #[cfg(not(feature = "x64"))]
        unreachable!()
    }
}

#[cfg(test)]
#[cfg(feature = "x64")]
mod tests {
    use super::*;
    use crate::callconv::CallConv;
    use crate::func::{FuncSignature, TypeId};
    use crate::ir::NodeData;

    fn sysv_compiler() -> Compiler {
        Compiler::new(Arch::X64).unwrap()
    }

    #[test]
    fn mnemonics_append_nodes() {
        let mut c = sysv_compiler();
        let sig = FuncSignature::new(CallConv::X64SystemV, TypeId::I64, &[TypeId::I64]);
        c.func(sig).unwrap();
        let a = c.get_arg(0).unwrap();
        c.add(a, a).unwrap();
        c.func_ret(Some(a.into())).unwrap();
        c.end_func().unwrap();
        let kinds: Vec<&'static str> = c
            .list
            .iter()
            .map(|id| match &c.list.node(id).data {
                NodeData::Func(_) => "func",
                NodeData::Inst(_) => "inst",
                NodeData::FuncRet(_) => "ret",
                NodeData::Sentinel(_) => "end",
                _ => "?",
            })
            .collect();
        assert_eq!(kinds, vec!["func", "inst", "ret", "end"]);
    }

    #[test]
    fn x86_only_forms_reject_other_targets() {
        #[cfg(feature = "aarch64")]
        {
            let mut c = Compiler::new(Arch::Aarch64).unwrap();
            let x = c.new_virtual(crate::operand::RegGroup::Vec, 16).unwrap();
            assert!(matches!(c.pxor(x, x), Err(Error::InvalidArch)));
        }
    }

    #[test]
    fn bad_physical_ids_rejected_at_emit() {
        let mut c = sysv_compiler();
        let bad = crate::operand::Reg::phys(crate::operand::RegType::Gp64, 16);
        assert!(matches!(c.mov(bad, bad), Err(Error::InvalidPhysId(16))));
    }

    #[test]
    fn invalid_label_rejected_at_emit() {
        let mut c = sysv_compiler();
        let mut other = sysv_compiler();
        let foreign = other.new_label();
        let _ = other;
        // A label from another compilation is valid only by accident of
        // numbering; an out-of-range one is always caught.
        let _ = foreign;
        let l = c.new_label();
        c.jmp(l).unwrap();
        let bogus = Label::from_u32(999);
        assert!(matches!(c.jmp(bogus), Err(Error::InvalidLabel)));
    }
}
