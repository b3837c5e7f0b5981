//! Stack-frame layout for a compiled function.
//!
//! A [`FuncFrame`] is created from the function's signature, accumulates the
//! registers the allocator actually clobbers and the spill slots it
//! allocates, and computes the final prologue/epilogue layout in
//! [`FuncFrame::finalize`]. Spill-slot offsets are relative to the spill
//! anchor until then; the anchor is stable once finalize has run.
//!
//! Layout below the return address after the prologue, stack growing down:
//!
//! ```text
//! [sp + 0 ..)                outgoing call arguments + shadow space
//! [sp + call_args ..)        preserved vector save area
//! [sp + spill_anchor ..)     spill slots (local area)
//! [.. pushed gp registers ]
//! [.. return address      ]
//! ```
//!
//! A leaf function whose locals fit in the convention's red zone skips the
//! stack adjustment entirely and addresses spills below the stack pointer.

use crate::callconv::CallConv;
use crate::isa::Arch;
use crate::operand::RegGroup;
use crate::result::{CodegenResult, Error};
use crate::support::align_up;

/// Calling-convention-aware frame layout, accumulated during allocation and
/// frozen by `finalize`.
#[derive(Clone, Debug)]
pub struct FuncFrame {
    arch: Arch,
    call_conv: CallConv,
    /// Establish a frame pointer chain (push rbp / stp x29,x30).
    preserved_fp: bool,
    /// The body contains at least one call.
    has_calls: bool,
    /// Natural stack alignment at call sites.
    stack_align: u32,
    /// Red zone available below sp for leaf functions.
    red_zone: u32,
    /// Registers written by the body, per allocatable group.
    dirty: [u32; RegGroup::NUM_ALLOCATABLE],
    /// Callee-preserved registers per the convention, per group.
    preserved: [u32; RegGroup::NUM_ALLOCATABLE],
    /// Bytes of spill slots allocated so far.
    local_size: u32,
    /// Strictest alignment any spill slot asked for.
    local_align: u32,
    /// Outgoing argument area (max over call sites, includes shadow space).
    call_args_size: u32,
    /// Bytes the epilogue's `ret` pops beyond the return address.
    callee_pop_size: u32,

    // Computed by finalize().
    finalized: bool,
    push_save_bytes: u32,
    vec_save_bytes: u32,
    stack_adjustment: u32,
}

impl FuncFrame {
    /// A fresh frame for a function using `call_conv` on `arch`.
    pub fn new(arch: Arch, call_conv: CallConv) -> Self {
        let scheme = call_conv.scheme();
        Self {
            arch,
            call_conv,
            preserved_fp: false,
            has_calls: false,
            stack_align: scheme.stack_align,
            red_zone: scheme.red_zone,
            dirty: [0; RegGroup::NUM_ALLOCATABLE],
            preserved: [scheme.preserved_gp, scheme.preserved_vec, 0],
            local_size: 0,
            local_align: 1,
            call_args_size: 0,
            callee_pop_size: 0,
            finalized: false,
            push_save_bytes: 0,
            vec_save_bytes: 0,
            stack_adjustment: 0,
        }
    }

    /// The target architecture.
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The calling convention the function was compiled under.
    pub fn call_conv(&self) -> CallConv {
        self.call_conv
    }

    /// Request a frame-pointer chain.
    pub fn set_preserved_fp(&mut self, on: bool) {
        debug_assert!(!self.finalized);
        self.preserved_fp = on;
    }

    /// Is a frame-pointer chain established?
    pub fn preserved_fp(&self) -> bool {
        self.preserved_fp
    }

    /// Set how many bytes the epilogue's return pops (callee-pops ABIs).
    pub fn set_callee_pop_size(&mut self, bytes: u32) {
        debug_assert!(!self.finalized);
        self.callee_pop_size = bytes;
    }

    /// Bytes popped by `ret imm` in the epilogue.
    pub fn callee_pop_size(&self) -> u32 {
        self.callee_pop_size
    }

    /// Record a call site needing `stack_args` bytes of outgoing argument
    /// space (shadow space included by the caller of this method).
    pub fn note_call(&mut self, stack_args: u32) {
        debug_assert!(!self.finalized);
        self.has_calls = true;
        self.call_args_size = self.call_args_size.max(stack_args);
    }

    /// Does the body make calls?
    pub fn has_calls(&self) -> bool {
        self.has_calls
    }

    /// Record that the body writes physical register `id` of `group`.
    pub fn add_dirty(&mut self, group: RegGroup, id: u8) {
        debug_assert!(!self.finalized);
        self.dirty[group.index()] |= 1 << id;
    }

    /// The dirty mask for a group.
    pub fn dirty(&self, group: RegGroup) -> u32 {
        self.dirty[group.index()]
    }

    /// The convention's preserved mask for a group.
    pub fn preserved(&self, group: RegGroup) -> u32 {
        self.preserved[group.index()]
    }

    /// Registers that must be saved and restored: dirty ∩ preserved, minus
    /// the stack pointer and (when chained) the frame pointer, which the
    /// prologue handles separately.
    pub fn save_mask(&self, group: RegGroup) -> u32 {
        let mut m = self.dirty[group.index()] & self.preserved[group.index()];
        if group == RegGroup::Gp {
            m &= !(1 << self.arch.sp().phys_id());
            if self.preserved_fp {
                m &= !(1 << self.arch.fp().phys_id());
            }
            if self.arch == Arch::Aarch64 {
                // x29/x30 are saved by the stp pair, never by the loop.
                m &= !(1 << 29 | 1 << 30);
            }
        }
        m
    }

    /// Reserve a spill slot of `size` bytes aligned to `size`. Returns the
    /// slot's offset from the spill anchor; the offset never moves for the
    /// lifetime of the compilation.
    pub fn alloc_spill_slot(&mut self, size: u32) -> u32 {
        debug_assert!(!self.finalized);
        debug_assert!(size.is_power_of_two());
        let offset = align_up(self.local_size, size);
        self.local_size = offset + size;
        self.local_align = self.local_align.max(size);
        offset
    }

    /// Bytes of spill slots allocated.
    pub fn local_size(&self) -> u32 {
        self.local_size
    }

    /// Compute the final layout. Must run after allocation has recorded
    /// every dirty register, call site and spill slot.
    pub fn finalize(&mut self) -> CodegenResult<()> {
        if self.finalized {
            return Err(Error::InvalidState);
        }
        let word = self.arch.ptr_bytes();

        let gp_saves = self.save_mask(RegGroup::Gp).count_ones();
        self.push_save_bytes = match self.arch {
            // Each preserved pair is one stp, 16 bytes; odd counts round up.
            Arch::Aarch64 => align_up(gp_saves, 2) * 8,
            _ => gp_saves * word,
        };

        let vec_saves = self.save_mask(RegGroup::Vec).count_ones();
        self.vec_save_bytes = match self.arch {
            // AAPCS64 preserves only the low 64 bits of v8-v15; stp pairs.
            Arch::Aarch64 => align_up(vec_saves, 2) * 8,
            _ => vec_saves * 16,
        };

        let frame_core = self.call_args_size + self.vec_save_bytes + align_up(self.local_size, self.local_align);

        let use_red_zone = !self.has_calls
            && self.vec_save_bytes == 0
            && self.call_args_size == 0
            && frame_core <= self.red_zone;

        self.stack_adjustment = if use_red_zone {
            0
        } else if frame_core == 0 && !self.needs_alignment_pad() {
            0
        } else {
            // Keep sp aligned to the natural alignment at the body: the
            // return address plus pushed registers are already on the
            // stack when the adjustment happens.
            let pushed = self.entry_push_bytes();
            let misalign = (pushed + frame_core) % self.stack_align;
            frame_core + if misalign == 0 { 0 } else { self.stack_align - misalign }
        };

        self.finalized = true;
        log::debug!(
            "frame: push {}B, vec save {}B, locals {}B, adjust {}B",
            self.push_save_bytes,
            self.vec_save_bytes,
            self.local_size,
            self.stack_adjustment
        );
        Ok(())
    }

    /// Bytes on the stack at the adjustment point: return address (x86) or
    /// the stp pair (aarch64), plus pushed preserved registers.
    fn entry_push_bytes(&self) -> u32 {
        let ra = match self.arch {
            Arch::Aarch64 => {
                if self.preserved_fp { 16 } else { 0 }
            }
            _ => {
                let fp = if self.preserved_fp { self.arch.ptr_bytes() } else { 0 };
                self.arch.ptr_bytes() + fp
            }
        };
        ra + self.push_save_bytes
    }

    fn needs_alignment_pad(&self) -> bool {
        self.has_calls && self.entry_push_bytes() % self.stack_align != 0
    }

    /// Has `finalize` run?
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// The `sub sp` amount of the prologue. Valid after finalize.
    pub fn stack_adjustment(&self) -> u32 {
        debug_assert!(self.finalized);
        self.stack_adjustment
    }

    /// Offset from the post-prologue stack pointer to the spill area.
    /// Negative when the spill area lives in the red zone.
    pub fn spill_anchor(&self) -> i32 {
        debug_assert!(self.finalized);
        if self.stack_adjustment == 0 && self.local_size > 0 {
            -(align_up(self.local_size, self.local_align) as i32)
        } else {
            (self.call_args_size + self.vec_save_bytes) as i32
        }
    }

    /// Offset from the post-prologue stack pointer to the vector save area.
    pub fn vec_save_offset(&self) -> i32 {
        debug_assert!(self.finalized);
        self.call_args_size as i32
    }

    /// Offset from the post-prologue stack pointer to the base of the
    /// caller's argument area (just above the return address).
    pub fn incoming_arg_anchor(&self) -> i32 {
        debug_assert!(self.finalized);
        (self.stack_adjustment + self.entry_push_bytes()) as i32
    }

    /// Preserved-register save ids for a group, ascending.
    pub fn save_ids(&self, group: RegGroup) -> impl Iterator<Item = u8> + '_ {
        let mask = self.save_mask(group);
        (0..32u8).filter(move |id| mask & (1 << id) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_frame_is_empty() {
        // No calls, no dirty preserved registers, no locals.
        let mut f = FuncFrame::new(Arch::X64, CallConv::X64SystemV);
        f.add_dirty(RegGroup::Gp, 0); // rax is caller-saved
        f.finalize().unwrap();
        assert_eq!(f.stack_adjustment(), 0);
        assert_eq!(f.save_mask(RegGroup::Gp), 0);
    }

    #[test]
    fn red_zone_leaf_spills_without_sub() {
        let mut f = FuncFrame::new(Arch::X64, CallConv::X64SystemV);
        let a = f.alloc_spill_slot(8);
        let b = f.alloc_spill_slot(8);
        assert_eq!((a, b), (0, 8));
        f.finalize().unwrap();
        assert_eq!(f.stack_adjustment(), 0);
        assert_eq!(f.spill_anchor(), -16);
    }

    #[test]
    fn calls_force_aligned_adjustment() {
        let mut f = FuncFrame::new(Arch::X64, CallConv::X64SystemV);
        f.note_call(0);
        f.alloc_spill_slot(8);
        f.finalize().unwrap();
        // Return address (8) + adjustment must make sp 16-aligned.
        assert_eq!((8 + f.stack_adjustment()) % 16, 0);
        assert!(f.stack_adjustment() >= 8);
    }

    #[test]
    fn saved_registers_count_into_alignment() {
        let mut f = FuncFrame::new(Arch::X64, CallConv::X64SystemV);
        f.note_call(0);
        f.add_dirty(RegGroup::Gp, 3); // rbx
        f.add_dirty(RegGroup::Gp, 12); // r12
        f.add_dirty(RegGroup::Gp, 0); // rax, caller-saved, ignored
        f.finalize().unwrap();
        assert_eq!(f.save_ids(RegGroup::Gp).collect::<Vec<_>>(), vec![3, 12]);
        // ret addr + 2 pushes + adjustment aligned to 16.
        assert_eq!((8 + 16 + f.stack_adjustment()) % 16, 0);
    }

    #[test]
    fn spill_slot_offsets_are_stable_and_aligned() {
        let mut f = FuncFrame::new(Arch::X64, CallConv::X64SystemV);
        let a = f.alloc_spill_slot(4);
        let b = f.alloc_spill_slot(16);
        let c = f.alloc_spill_slot(4);
        assert_eq!(a, 0);
        assert_eq!(b, 16);
        assert_eq!(c, 32);
    }

    #[test]
    fn aarch64_pairs_round_up() {
        let mut f = FuncFrame::new(Arch::Aarch64, CallConv::Aapcs64);
        f.set_preserved_fp(true);
        f.note_call(0);
        f.add_dirty(RegGroup::Gp, 19);
        f.add_dirty(RegGroup::Gp, 20);
        f.add_dirty(RegGroup::Gp, 21);
        f.finalize().unwrap();
        // Three saves round to two stp pairs.
        assert_eq!(f.save_ids(RegGroup::Gp).collect::<Vec<_>>(), vec![19, 20, 21]);
        assert_eq!((f.stack_adjustment()) % 16, 0);
    }

    #[test]
    fn finalize_runs_once() {
        let mut f = FuncFrame::new(Arch::X64, CallConv::X64SystemV);
        f.finalize().unwrap();
        assert!(matches!(f.finalize(), Err(Error::InvalidState)));
    }
}
