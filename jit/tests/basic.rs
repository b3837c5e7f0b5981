//! End-to-end tests: build functions through the compiler, finalize, map
//! and (on matching hosts) execute them.

use dropforge_codegen::{Arch, CallConv, Compiler, FuncSignature, Imm, Operand, TypeId};
use dropforge_jit::{build, host_arch, JitRuntime};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn sysv_sig(ret: TypeId, args: &[TypeId]) -> FuncSignature {
    FuncSignature::new(CallConv::X64SystemV, ret, args)
}

/// Scenario: add two i64 arguments under the SysV ABI. The finalized
/// bytes are the canonical three-instruction leaf function.
#[test]
fn add_two_args_bytes() {
    init_logging();
    let mut c = Compiler::new(Arch::X64).unwrap();
    c.func(sysv_sig(TypeId::I64, &[TypeId::I64, TypeId::I64])).unwrap();
    let a = c.get_arg(0).unwrap();
    let b = c.get_arg(1).unwrap();
    c.add(a, b).unwrap();
    c.func_ret(Some(a.into())).unwrap();
    c.end_func().unwrap();
    let code = c.finalize().unwrap();
    // add rdi, rsi; mov rax, rdi; ret.
    assert_eq!(code.bytes, vec![0x48, 0x01, 0xF7, 0x48, 0x89, 0xF8, 0xC3]);
    assert_eq!(code.entry, 0);
    assert_eq!(code.sections[0].name, ".text");
    assert!(code.sections[0].executable);
}

#[test]
fn finalize_is_idempotent() {
    let mut c = Compiler::new(Arch::X64).unwrap();
    c.func(sysv_sig(TypeId::I64, &[TypeId::I64, TypeId::I64])).unwrap();
    let a = c.get_arg(0).unwrap();
    let b = c.get_arg(1).unwrap();
    c.add(a, b).unwrap();
    c.func_ret(Some(a.into())).unwrap();
    c.end_func().unwrap();
    let once = c.finalize().unwrap();
    let twice = c.finalize().unwrap();
    assert_eq!(once.bytes, twice.bytes);
}

/// Scenario: a forward near-jump over fifty NOPs patches to disp 50.
#[test]
fn forward_jump_patches() {
    let mut c = Compiler::new(Arch::X64).unwrap();
    let l = c.new_label();
    c.jmp(l).unwrap();
    for _ in 0..50 {
        c.nop().unwrap();
    }
    c.bind(l).unwrap();
    let code = c.finalize().unwrap();
    assert_eq!(&code.bytes[..5], &[0xE9, 0x32, 0x00, 0x00, 0x00]);
}

/// Scenario: crossed call arguments force a register swap, emitted as one
/// xchg on x86-64.
#[test]
fn crossed_call_args_use_xchg() {
    let mut c = Compiler::new(Arch::X64).unwrap();
    c.func(sysv_sig(TypeId::I64, &[TypeId::I64, TypeId::I64])).unwrap();
    let a = c.get_arg(0).unwrap();
    let b = c.get_arg(1).unwrap();
    let callee = sysv_sig(TypeId::I64, &[TypeId::I64, TypeId::I64]);
    let ret = c
        .invoke(Operand::Imm(Imm::new(0x1000)), &callee, &[b.into(), a.into()], true)
        .unwrap()
        .unwrap();
    c.func_ret(Some(ret.into())).unwrap();
    c.end_func().unwrap();
    let code = c.finalize().unwrap();
    // xchg rsi, rdi in either operand order.
    let has_xchg = code.bytes.windows(3).any(|w| w == [0x48, 0x87, 0xFE] || w == [0x48, 0x87, 0xF7]);
    assert!(has_xchg, "expected xchg in {:02x?}", code.bytes);
}

/// Scenario: six register arguments fill rdi..r9 without touching the
/// stack below the frame.
#[test]
fn six_gp_args_stay_in_registers() {
    let mut c = Compiler::new(Arch::X64).unwrap();
    c.func(sysv_sig(TypeId::I64, &[])).unwrap();
    let callee = sysv_sig(TypeId::I64, &[TypeId::I64; 6]);
    let args: Vec<Operand> = (1..=6).map(|i| Operand::Imm(Imm::new(i))).collect();
    let ret = c
        .invoke(Operand::Imm(Imm::new(0x1000)), &callee, &args, true)
        .unwrap()
        .unwrap();
    c.func_ret(Some(ret.into())).unwrap();
    c.end_func().unwrap();
    let code = c.finalize().unwrap();
    // No outgoing-argument stack traffic: every `mov [rsp+..]` byte pair
    // would be 89 /r with a rsp-based SIB (modrm 0x44/0x84, sib 0x24).
    let stores_to_stack = code
        .bytes
        .windows(3)
        .filter(|w| w[0] == 0x89 && (w[1] == 0x44 || w[1] == 0x84) && w[2] == 0x24)
        .count();
    assert_eq!(stores_to_stack, 0, "unexpected stack stores in {:02x?}", code.bytes);
}

/// Scenario: a memset-like byte loop under the Windows x64 ABI. The
/// arguments arrive in rcx, rdx and r8; the body stores through rcx and
/// counts down in r8.
#[test]
fn windows_memset_loop_shape() {
    use dropforge_codegen::{Mem, RegType};

    let mut c = Compiler::new(Arch::X64).unwrap();
    let sig = FuncSignature::new(
        CallConv::X64Windows,
        TypeId::Void,
        &[TypeId::Ptr, TypeId::I32, TypeId::I32],
    );
    c.func(sig).unwrap();
    let dst = c.get_arg(0).unwrap();
    let value = c.get_arg(1).unwrap();
    let count = c.get_arg(2).unwrap();
    let top = c.new_label();
    c.bind(top).unwrap();
    let byte = Mem::base_disp(dst, 0).with_size(1);
    c.mov(byte, value.with_rtype(RegType::Gp8Lo)).unwrap();
    c.inc(dst).unwrap();
    c.dec(count.with_rtype(RegType::Gp32)).unwrap();
    c.jnz(top).unwrap();
    c.func_ret(None).unwrap();
    c.end_func().unwrap();
    let code = c.finalize().unwrap();
    let bytes = &code.bytes;
    // mov byte [rcx], dl.
    assert!(bytes.windows(2).any(|w| w == [0x88, 0x11]), "store missing in {bytes:02x?}");
    // inc rcx.
    assert!(bytes.windows(3).any(|w| w == [0x48, 0xFF, 0xC1]));
    // dec r8d.
    assert!(bytes.windows(3).any(|w| w == [0x41, 0xFF, 0xC8]));
    // Ends with ret.
    assert_eq!(bytes.last(), Some(&0xC3));
}

/// The AArch64 pipeline produces the canonical leaf add as well.
#[test]
fn aarch64_add_two_args_bytes() {
    let mut c = Compiler::new(Arch::Aarch64).unwrap();
    let sig = FuncSignature::new(CallConv::Aapcs64, TypeId::I64, &[TypeId::I64, TypeId::I64]);
    c.func(sig).unwrap();
    let a = c.get_arg(0).unwrap();
    let b = c.get_arg(1).unwrap();
    c.add(a, b).unwrap();
    c.func_ret(Some(a.into())).unwrap();
    c.end_func().unwrap();
    let code = c.finalize().unwrap();
    let words: Vec<u32> = code
        .bytes
        .chunks(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();
    // add x0, x0, x1; ret.
    assert_eq!(words, vec![0x8b01_0000, 0xd65f_03c0]);
}

#[test]
fn runtime_rejects_cross_arch_code() {
    let other = match host_arch() {
        Some(Arch::X64) => Arch::Aarch64,
        _ => Arch::X64,
    };
    let mut c = Compiler::new(other).unwrap();
    let sig = FuncSignature::new(
        match other {
            Arch::X64 => CallConv::X64SystemV,
            _ => CallConv::Aapcs64,
        },
        TypeId::I64,
        &[TypeId::I64],
    );
    c.func(sig).unwrap();
    let a = c.get_arg(0).unwrap();
    c.func_ret(Some(a.into())).unwrap();
    c.end_func().unwrap();
    let mut rt = JitRuntime::new();
    assert!(build(&mut c, &mut rt).is_err());
    assert!(rt.is_empty());
}

#[cfg(all(target_arch = "x86_64", unix))]
mod exec {
    use super::*;
    use dropforge_codegen::RegGroup;
    use dropforge_jit::ExecutableMemory;

    #[test]
    fn add_two_args_executes() {
        init_logging();
        let mut c = Compiler::new(Arch::X64).unwrap();
        c.func(sysv_sig(TypeId::I64, &[TypeId::I64, TypeId::I64])).unwrap();
        let a = c.get_arg(0).unwrap();
        let b = c.get_arg(1).unwrap();
        c.add(a, b).unwrap();
        c.func_ret(Some(a.into())).unwrap();
        c.end_func().unwrap();

        let mut rt = JitRuntime::new();
        let ptr = build(&mut c, &mut rt).unwrap();
        let f: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(ptr) };
        assert_eq!(f(2, 3), 5);
        assert_eq!(f(-7, 7), 0);
        assert!(rt.dispose(ptr));
        assert!(rt.is_empty());
    }

    #[test]
    fn countdown_loop_executes() {
        // sum = 0; do { sum += n; n -= 1 } while n != 0; return sum.
        let mut c = Compiler::new(Arch::X64).unwrap();
        c.func(sysv_sig(TypeId::I64, &[TypeId::I64])).unwrap();
        let n = c.get_arg(0).unwrap();
        let sum = c.new_virtual(RegGroup::Gp, 8).unwrap();
        let top = c.new_label();
        c.mov(sum, Imm::new(0)).unwrap();
        c.bind(top).unwrap();
        c.add(sum, n).unwrap();
        c.dec(n).unwrap();
        c.jnz(top).unwrap();
        c.func_ret(Some(sum.into())).unwrap();
        c.end_func().unwrap();

        let mut rt = JitRuntime::new();
        let ptr = build(&mut c, &mut rt).unwrap();
        let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(ptr) };
        assert_eq!(f(5), 15);
        assert_eq!(f(1), 1);
    }

    extern "C" fn sub_helper(a: i64, b: i64) -> i64 {
        a - b
    }

    extern "C" fn sum6_helper(a: i64, b: i64, c: i64, d: i64, e: i64, f: i64) -> i64 {
        a + 10 * b + 100 * c + 1000 * d + 10_000 * e + 100_000 * f
    }

    #[test]
    fn invoke_with_swapped_args_executes() {
        let mut c = Compiler::new(Arch::X64).unwrap();
        c.func(sysv_sig(TypeId::I64, &[TypeId::I64, TypeId::I64])).unwrap();
        let a = c.get_arg(0).unwrap();
        let b = c.get_arg(1).unwrap();
        let callee = sysv_sig(TypeId::I64, &[TypeId::I64, TypeId::I64]);
        let target = Operand::Imm(Imm::new(sub_helper as usize as i64));
        let ret = c.invoke(target, &callee, &[b.into(), a.into()], true).unwrap().unwrap();
        c.func_ret(Some(ret.into())).unwrap();
        c.end_func().unwrap();

        let mut rt = JitRuntime::new();
        let ptr = build(&mut c, &mut rt).unwrap();
        let f: extern "C" fn(i64, i64) -> i64 = unsafe { std::mem::transmute(ptr) };
        // f(a, b) computes sub(b, a).
        assert_eq!(f(10, 3), -7);
        assert_eq!(f(1, 100), 99);
    }

    #[test]
    fn invoke_with_six_args_executes() {
        let mut c = Compiler::new(Arch::X64).unwrap();
        c.func(sysv_sig(TypeId::I64, &[])).unwrap();
        let callee = sysv_sig(TypeId::I64, &[TypeId::I64; 6]);
        let target = Operand::Imm(Imm::new(sum6_helper as usize as i64));
        let args: Vec<Operand> = (1..=6).map(|i| Operand::Imm(Imm::new(i))).collect();
        let ret = c.invoke(target, &callee, &args, true).unwrap().unwrap();
        c.func_ret(Some(ret.into())).unwrap();
        c.end_func().unwrap();

        let mut rt = JitRuntime::new();
        let ptr = build(&mut c, &mut rt).unwrap();
        let f: extern "C" fn() -> i64 = unsafe { std::mem::transmute(ptr) };
        assert_eq!(f(), 654_321);
    }

    #[test]
    fn spill_pressure_across_a_call_executes() {
        // Eight values live across a call: some must survive in
        // callee-saved registers or spill slots.
        let mut c = Compiler::new(Arch::X64).unwrap();
        c.func(sysv_sig(TypeId::I64, &[TypeId::I64])).unwrap();
        let x = c.get_arg(0).unwrap();
        let vals: Vec<_> = (0..8)
            .map(|i| {
                let v = c.new_virtual(RegGroup::Gp, 8).unwrap();
                c.mov(v, x).unwrap();
                c.add(v, Imm::new(i)).unwrap();
                v
            })
            .collect();
        let callee = sysv_sig(TypeId::I64, &[TypeId::I64, TypeId::I64]);
        let target = Operand::Imm(Imm::new(sub_helper as usize as i64));
        let ret = c
            .invoke(target, &callee, &[vals[0].into(), vals[1].into()], true)
            .unwrap()
            .unwrap();
        // Fold everything into the return value.
        for v in &vals[2..] {
            c.add(ret, *v).unwrap();
        }
        c.func_ret(Some(ret.into())).unwrap();
        c.end_func().unwrap();

        let mut rt = JitRuntime::new();
        let ptr = build(&mut c, &mut rt).unwrap();
        let f: extern "C" fn(i64) -> i64 = unsafe { std::mem::transmute(ptr) };
        // sub(x, x+1) = -1; then + (x+2) + ... + (x+7).
        let x = 40i64;
        let expected = -1 + (2..8).map(|i| x + i).sum::<i64>();
        assert_eq!(f(x), expected);
    }
}
