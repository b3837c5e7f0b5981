//! Calling-convention identifiers and their per-ABI register tables.
//!
//! Each convention names, per register group: the ordered argument-passing
//! registers, the callee-preserved mask, stack alignment, red/shadow zones
//! and whether the callee pops its stack arguments. All tables are immutable
//! static data; nothing here is per-compilation state.

use crate::isa::Arch;

/// Calling convention identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// x86-32 C convention: everything on the stack, caller pops.
    CDecl,
    /// x86-32, callee pops (Win32 API surface).
    StdCall,
    /// x86-32, first two gp args in ecx/edx, callee pops.
    FastCall,
    /// x86-32 MSVC member functions: `this` in ecx, callee pops.
    ThisCall,
    /// x64 Windows with extended vector argument passing.
    VectorCall,
    /// System V AMD64 ABI (Linux, BSD, macOS).
    X64SystemV,
    /// Windows x64 ABI.
    X64Windows,
    /// Arm 32-bit AAPCS, soft-float variant: floats pass in gp registers.
    Aapcs,
    /// Arm 32-bit AAPCS, hard-float (VFP) variant.
    AapcsVfp,
    /// AArch64 AAPCS64.
    Aapcs64,
    /// Apple's AArch64 variant: varargs always pass on the stack.
    AppleAarch64,
}

impl CallConv {
    /// The architecture this convention belongs to.
    pub fn arch(self) -> Arch {
        match self {
            CallConv::CDecl | CallConv::StdCall | CallConv::FastCall | CallConv::ThisCall => {
                Arch::X86
            }
            CallConv::VectorCall | CallConv::X64SystemV | CallConv::X64Windows => Arch::X64,
            CallConv::Aapcs | CallConv::AapcsVfp => Arch::Arm,
            CallConv::Aapcs64 | CallConv::AppleAarch64 => Arch::Aarch64,
        }
    }

    /// The host C convention for a target architecture.
    pub fn host_default(arch: Arch) -> Self {
        match arch {
            Arch::X64 => {
                if cfg!(windows) {
                    CallConv::X64Windows
                } else {
                    CallConv::X64SystemV
                }
            }
            Arch::X86 => CallConv::CDecl,
            Arch::Aarch64 => {
                if cfg!(target_vendor = "apple") {
                    CallConv::AppleAarch64
                } else {
                    CallConv::Aapcs64
                }
            }
            Arch::Arm => CallConv::AapcsVfp,
        }
    }

    /// The static register tables for this convention.
    pub fn scheme(self) -> &'static CallConvScheme {
        match self {
            CallConv::CDecl => &CDECL,
            CallConv::StdCall => &STDCALL,
            CallConv::FastCall => &FASTCALL,
            CallConv::ThisCall => &THISCALL,
            CallConv::VectorCall => &VECTORCALL,
            CallConv::X64SystemV => &X64_SYSTEMV,
            CallConv::X64Windows => &X64_WINDOWS,
            CallConv::Aapcs => &AAPCS,
            CallConv::AapcsVfp => &AAPCS_VFP,
            CallConv::Aapcs64 => &AAPCS64,
            CallConv::AppleAarch64 => &APPLE_AARCH64,
        }
    }
}

/// The static shape of one calling convention.
#[derive(Debug)]
pub struct CallConvScheme {
    /// Architecture this scheme applies to.
    pub arch: Arch,
    /// Ordered gp argument registers.
    pub gp_args: &'static [u8],
    /// Ordered vector argument registers.
    pub vec_args: &'static [u8],
    /// Callee-preserved gp registers, as an id bit mask.
    pub preserved_gp: u32,
    /// Callee-preserved vector registers, as an id bit mask.
    pub preserved_vec: u32,
    /// Natural stack alignment at call sites, in bytes.
    pub stack_align: u32,
    /// Bytes below the stack pointer usable without allocation.
    pub red_zone: u32,
    /// Bytes the caller reserves above the return address for the callee
    /// (the Windows x64 shadow space).
    pub shadow_space: u32,
    /// True when register slots are positional: argument `n` may only use
    /// slot `n` of each register file (Windows x64 rule).
    pub positional_slots: bool,
    /// True when the callee pops its stack arguments on return.
    pub callee_pops: bool,
    /// True when floating arguments pass in gp registers (soft-float).
    pub float_args_in_gp: bool,
    /// True when all vararg arguments pass on the stack (Apple AArch64).
    pub vararg_on_stack: bool,
}

const fn mask(ids: &[u8]) -> u32 {
    let mut m = 0u32;
    let mut i = 0;
    while i < ids.len() {
        m |= 1 << ids[i];
        i += 1;
    }
    m
}

const fn range_mask(lo: u8, hi: u8) -> u32 {
    let mut m = 0u32;
    let mut i = lo;
    while i <= hi {
        m |= 1 << i;
        i += 1;
    }
    m
}

// x86-64 gp ids: rax=0 rcx=1 rdx=2 rbx=3 rsp=4 rbp=5 rsi=6 rdi=7 r8..r15.

static X64_SYSTEMV: CallConvScheme = CallConvScheme {
    arch: Arch::X64,
    gp_args: &[7, 6, 2, 1, 8, 9],
    vec_args: &[0, 1, 2, 3, 4, 5, 6, 7],
    preserved_gp: mask(&[3, 4, 5, 12, 13, 14, 15]),
    preserved_vec: 0,
    stack_align: 16,
    red_zone: 128,
    shadow_space: 0,
    positional_slots: false,
    callee_pops: false,
    float_args_in_gp: false,
    vararg_on_stack: false,
};

static X64_WINDOWS: CallConvScheme = CallConvScheme {
    arch: Arch::X64,
    gp_args: &[1, 2, 8, 9],
    vec_args: &[0, 1, 2, 3],
    preserved_gp: mask(&[3, 4, 5, 6, 7, 12, 13, 14, 15]),
    preserved_vec: range_mask(6, 15),
    stack_align: 16,
    red_zone: 0,
    shadow_space: 32,
    positional_slots: true,
    callee_pops: false,
    float_args_in_gp: false,
    vararg_on_stack: false,
};

static VECTORCALL: CallConvScheme = CallConvScheme {
    arch: Arch::X64,
    gp_args: &[1, 2, 8, 9],
    vec_args: &[0, 1, 2, 3, 4, 5],
    preserved_gp: mask(&[3, 4, 5, 6, 7, 12, 13, 14, 15]),
    preserved_vec: range_mask(6, 15),
    stack_align: 16,
    red_zone: 0,
    shadow_space: 32,
    positional_slots: true,
    callee_pops: false,
    float_args_in_gp: false,
    vararg_on_stack: false,
};

// x86-32 gp ids: eax=0 ecx=1 edx=2 ebx=3 esp=4 ebp=5 esi=6 edi=7.

static CDECL: CallConvScheme = CallConvScheme {
    arch: Arch::X86,
    gp_args: &[],
    vec_args: &[],
    preserved_gp: mask(&[3, 4, 5, 6, 7]),
    preserved_vec: 0,
    stack_align: 4,
    red_zone: 0,
    shadow_space: 0,
    positional_slots: false,
    callee_pops: false,
    float_args_in_gp: true,
    vararg_on_stack: false,
};

static STDCALL: CallConvScheme = CallConvScheme {
    arch: Arch::X86,
    gp_args: &[],
    vec_args: &[],
    preserved_gp: mask(&[3, 4, 5, 6, 7]),
    preserved_vec: 0,
    stack_align: 4,
    red_zone: 0,
    shadow_space: 0,
    positional_slots: false,
    callee_pops: true,
    float_args_in_gp: true,
    vararg_on_stack: false,
};

static FASTCALL: CallConvScheme = CallConvScheme {
    arch: Arch::X86,
    gp_args: &[1, 2],
    vec_args: &[],
    preserved_gp: mask(&[3, 4, 5, 6, 7]),
    preserved_vec: 0,
    stack_align: 4,
    red_zone: 0,
    shadow_space: 0,
    positional_slots: false,
    callee_pops: true,
    float_args_in_gp: true,
    vararg_on_stack: false,
};

static THISCALL: CallConvScheme = CallConvScheme {
    arch: Arch::X86,
    gp_args: &[1],
    vec_args: &[],
    preserved_gp: mask(&[3, 4, 5, 6, 7]),
    preserved_vec: 0,
    stack_align: 4,
    red_zone: 0,
    shadow_space: 0,
    positional_slots: false,
    callee_pops: true,
    float_args_in_gp: true,
    vararg_on_stack: false,
};

// Arm 32-bit: r0-r3 arguments, r4-r11 preserved, d8-d15 preserved (VFP).

static AAPCS: CallConvScheme = CallConvScheme {
    arch: Arch::Arm,
    gp_args: &[0, 1, 2, 3],
    vec_args: &[],
    preserved_gp: range_mask(4, 11) | mask(&[13]),
    preserved_vec: 0,
    stack_align: 8,
    red_zone: 0,
    shadow_space: 0,
    positional_slots: false,
    callee_pops: false,
    float_args_in_gp: true,
    vararg_on_stack: false,
};

static AAPCS_VFP: CallConvScheme = CallConvScheme {
    arch: Arch::Arm,
    gp_args: &[0, 1, 2, 3],
    vec_args: &[0, 1, 2, 3, 4, 5, 6, 7],
    preserved_gp: range_mask(4, 11) | mask(&[13]),
    preserved_vec: range_mask(8, 15),
    stack_align: 8,
    red_zone: 0,
    shadow_space: 0,
    positional_slots: false,
    callee_pops: false,
    float_args_in_gp: false,
    vararg_on_stack: false,
};

// AArch64: x0-x7 / v0-v7 arguments, x19-x28 preserved, v8-v15 low halves
// preserved, x29 frame pointer, x30 link register.

static AAPCS64: CallConvScheme = CallConvScheme {
    arch: Arch::Aarch64,
    gp_args: &[0, 1, 2, 3, 4, 5, 6, 7],
    vec_args: &[0, 1, 2, 3, 4, 5, 6, 7],
    preserved_gp: range_mask(19, 28) | mask(&[29, 30, 31]),
    preserved_vec: range_mask(8, 15),
    stack_align: 16,
    red_zone: 0,
    shadow_space: 0,
    positional_slots: false,
    callee_pops: false,
    float_args_in_gp: false,
    vararg_on_stack: false,
};

static APPLE_AARCH64: CallConvScheme = CallConvScheme {
    arch: Arch::Aarch64,
    gp_args: &[0, 1, 2, 3, 4, 5, 6, 7],
    vec_args: &[0, 1, 2, 3, 4, 5, 6, 7],
    preserved_gp: range_mask(19, 28) | mask(&[29, 30, 31]),
    preserved_vec: range_mask(8, 15),
    stack_align: 16,
    red_zone: 0,
    shadow_space: 0,
    positional_slots: false,
    callee_pops: false,
    float_args_in_gp: false,
    vararg_on_stack: true,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysv_argument_order() {
        let s = CallConv::X64SystemV.scheme();
        assert_eq!(s.gp_args, &[7, 6, 2, 1, 8, 9]); // rdi rsi rdx rcx r8 r9
        assert_eq!(s.red_zone, 128);
        assert_eq!(s.shadow_space, 0);
        assert!(!s.callee_pops);
    }

    #[test]
    fn windows_shadow_and_preserved_xmm() {
        let s = CallConv::X64Windows.scheme();
        assert_eq!(s.gp_args, &[1, 2, 8, 9]); // rcx rdx r8 r9
        assert_eq!(s.shadow_space, 32);
        assert!(s.positional_slots);
        // xmm6..xmm15 preserved.
        assert_eq!(s.preserved_vec, 0xffc0);
    }

    #[test]
    fn callee_pops_flags() {
        assert!(CallConv::StdCall.scheme().callee_pops);
        assert!(CallConv::ThisCall.scheme().callee_pops);
        assert!(!CallConv::CDecl.scheme().callee_pops);
    }

    #[test]
    fn aapcs64_preserves_fp_lr() {
        let s = CallConv::Aapcs64.scheme();
        assert_ne!(s.preserved_gp & (1 << 29), 0);
        assert_ne!(s.preserved_gp & (1 << 30), 0);
        assert_eq!(s.preserved_vec, 0xff00);
        assert!(!s.vararg_on_stack);
        assert!(CallConv::AppleAarch64.scheme().vararg_on_stack);
    }
}
