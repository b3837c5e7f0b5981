//! Register allocation: liveness analysis, bundle bin-packing and the
//! per-instruction local allocator.
//!
//! The pipeline runs [`liveness::analyze`] over the node list, feeds the
//! result to [`bundle::bin_pack`] to pick home registers for coalesced
//! bundles, and finishes with [`local::run`], which rewrites every virtual
//! operand to a physical register, inserting loads, saves, moves and swaps
//! as it goes.

pub mod bundle;
pub mod liveness;
pub mod local;
pub mod moves;

use smallvec::SmallVec;

use crate::callconv::CallConvScheme;
use crate::ir::InstNode;
use crate::isa::{Arch, InstInfo};
use crate::operand::{RegGroup, RegType, VirtReg};

/// Per-compilation record of one virtual register.
#[derive(Clone, Debug)]
pub struct VirtRegData {
    /// The register class it allocates from.
    pub group: RegGroup,
    /// The register type operands referencing it carry.
    pub rtype: RegType,
    /// Value size in bytes (spill slot size).
    pub size: u32,
    /// Preferred physical register, from argument position or bin-packing.
    pub home: Option<u8>,
    /// Spill slot offset from the frame's spill anchor, once assigned.
    /// Assigned at most once; never moves afterwards.
    pub spill_slot: Option<u32>,
    /// For stack-passed arguments, the offset in the caller's argument
    /// area the value arrives at.
    pub incoming: Option<i32>,
}

impl VirtRegData {
    /// A fresh virtual register of `group` with `size` bytes.
    pub fn new(group: RegGroup, rtype: RegType, size: u32) -> Self {
        Self { group, rtype, size, home: None, spill_slot: None, incoming: None }
    }
}

/// A set of half-open `[a, b)` position intervals, kept sorted and merged.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LiveSpans(SmallVec<[(u32, u32); 4]>);

impl LiveSpans {
    /// No coverage.
    pub fn new() -> Self {
        Self::default()
    }

    /// The raw intervals.
    pub fn as_slice(&self) -> &[(u32, u32)] {
        &self.0
    }

    /// True if nothing is covered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add `[a, b)`, merging with touching or overlapping intervals.
    pub fn add(&mut self, a: u32, b: u32) {
        debug_assert!(a < b);
        let mut merged = (a, b);
        let mut out: SmallVec<[(u32, u32); 4]> = SmallVec::new();
        for &(x, y) in &self.0 {
            if y < merged.0 || x > merged.1 {
                out.push((x, y));
            } else {
                merged = (merged.0.min(x), merged.1.max(y));
            }
        }
        let at = out.iter().position(|&(x, _)| x > merged.0).unwrap_or(out.len());
        out.insert(at, merged);
        self.0 = out;
    }

    /// Do two span sets share any position?
    pub fn intersects(&self, other: &Self) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            let (a0, a1) = self.0[i];
            let (b0, b1) = other.0[j];
            if a0 < b1 && b0 < a1 {
                return true;
            }
            if a1 <= b0 {
                i += 1;
            } else {
                j += 1;
            }
        }
        false
    }

    /// Union with another span set.
    pub fn union_with(&mut self, other: &Self) {
        for &(a, b) in &other.0 {
            self.add(a, b);
        }
    }
}

/// Dispatch instruction metadata to the right ISA.
pub fn info_for(arch: Arch, node: &InstNode, scheme: &CallConvScheme) -> InstInfo {
    match arch {
        #[cfg(feature = "x64")]
        Arch::X64 => crate::isa::x64::inst_info(node, scheme),
        #[cfg(feature = "aarch64")]
        Arch::Aarch64 => crate::isa::aarch64::inst_info(node, scheme),
        _ => unreachable!("no encoder for {arch:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_merge_and_intersect() {
        let mut a = LiveSpans::new();
        a.add(0, 4);
        a.add(8, 12);
        a.add(4, 8); // bridges the gap
        assert_eq!(a.as_slice(), &[(0, 12)]);

        let mut b = LiveSpans::new();
        b.add(12, 20);
        assert!(!a.intersects(&b)); // half-open: [0,12) and [12,20) touch only
        b.add(11, 12);
        assert!(a.intersects(&b));
    }

    #[test]
    fn union_is_commutative_on_disjoint() {
        let mut a = LiveSpans::new();
        a.add(0, 2);
        let mut b = LiveSpans::new();
        b.add(6, 8);
        let mut ab = a.clone();
        ab.union_with(&b);
        let mut ba = b.clone();
        ba.union_with(&a);
        assert_eq!(ab, ba);
        assert_eq!(ab.as_slice(), &[(0, 2), (6, 8)]);
    }
}
