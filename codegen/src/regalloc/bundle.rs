//! Bundle construction, coalescing and global bin-packing.
//!
//! Every virtual register starts as a singleton bundle. Each
//! `mov vdst, vsrc` becomes a coalescing candidate; two bundles merge when
//! their live spans do not intersect and their members share a register
//! class. The surviving bundles are then bin-packed onto physical
//! registers: hint-honoring first, then lowest-id placement into per-
//! register span buckets. Bundles that fit nowhere stay unassigned and fall
//! to the local allocator, which will spill around them.

use smallvec::SmallVec;

use crate::entity::{EntityRef, PrimaryMap};
use crate::isa::Arch;
use crate::operand::{RegGroup, VirtReg};

use super::liveness::Liveness;
use super::{LiveSpans, VirtRegData};

/// A set of virtual registers that will share one physical register.
#[derive(Clone, Debug)]
pub struct Bundle {
    /// Member virtual registers.
    pub members: SmallVec<[VirtReg; 2]>,
    /// The register class all members share.
    pub group: RegGroup,
    /// Union of the members' live spans.
    pub spans: LiveSpans,
    /// Sum of width × frequency over members.
    pub priority: u64,
    /// Preferred physical register inherited from any member.
    pub home: Option<u8>,
    /// The physical register the bin-packer chose, if any.
    pub assigned: Option<u8>,
}

/// Coalesce move-related virtual registers and bin-pack the result.
///
/// On return, every virtual register that landed in an assigned bundle has
/// its `home` updated to the chosen physical register.
pub fn build_and_pack(
    arch: Arch,
    vregs: &mut PrimaryMap<VirtReg, VirtRegData>,
    live: &Liveness,
) -> Vec<Bundle> {
    // Singleton bundles.
    let mut bundle_of: Vec<usize> = (0..vregs.len()).collect();
    let mut bundles: Vec<Option<Bundle>> = vregs
        .iter()
        .map(|(v, data)| {
            Some(Bundle {
                members: SmallVec::from_slice(&[v]),
                group: data.group,
                spans: live.spans[v].clone(),
                priority: u64::from(data.size) * u64::from(live.freq[v].max(1)),
                home: data.home,
                assigned: None,
            })
        })
        .collect();

    // Coalesce. Merging never invalidates earlier merges: spans only grow.
    for &(dst, src) in &live.mov_pairs {
        let (a, b) = (bundle_of[dst.index()], bundle_of[src.index()]);
        if a == b {
            continue;
        }
        let (lo, hi) = (a.min(b), a.max(b));
        let (head, tail) = bundles.split_at_mut(hi);
        let (ba, bb) = (head[lo].as_mut().unwrap(), tail[0].as_mut().unwrap());
        if ba.group != bb.group || ba.spans.intersects(&bb.spans) {
            continue;
        }
        if let (Some(x), Some(y)) = (ba.home, bb.home) {
            if x != y {
                continue;
            }
        }
        // Merge hi into lo.
        let bb = bundles[hi].take().unwrap();
        let ba = bundles[lo].as_mut().unwrap();
        for &m in &bb.members {
            bundle_of[m.index()] = lo;
        }
        ba.members.extend_from_slice(&bb.members);
        ba.spans.union_with(&bb.spans);
        ba.priority += bb.priority;
        ba.home = ba.home.or(bb.home);
        log::trace!("coalesced {dst} and {src}");
    }

    let mut bundles: Vec<Bundle> = bundles.into_iter().flatten().collect();

    // Bin-pack each group: hints first pass, lowest feasible id second.
    for group in [RegGroup::Gp, RegGroup::Vec, RegGroup::Mask] {
        let allocatable = arch.allocatable_mask(group);
        let mut buckets: [LiveSpans; 32] = Default::default();

        let mut order: Vec<usize> = bundles
            .iter()
            .enumerate()
            .filter(|(_, b)| b.group == group && !b.spans.is_empty())
            .map(|(i, _)| i)
            .collect();
        order.sort_by_key(|&i| core::cmp::Reverse(bundles[i].priority));

        // Pass 1: honor home hints when the bucket is free.
        for &i in &order {
            let bundle = &mut bundles[i];
            if let Some(home) = bundle.home {
                if allocatable & (1 << home) != 0 && !buckets[home as usize].intersects(&bundle.spans)
                {
                    buckets[home as usize].union_with(&bundle.spans);
                    bundle.assigned = Some(home);
                }
            }
        }

        // Pass 2: lowest available id whose live bucket does not intersect.
        for &i in &order {
            let bundle = &mut bundles[i];
            if bundle.assigned.is_some() {
                continue;
            }
            for id in 0..32u8 {
                if allocatable & (1 << id) == 0 {
                    continue;
                }
                if !buckets[id as usize].intersects(&bundle.spans) {
                    buckets[id as usize].union_with(&bundle.spans);
                    bundle.assigned = Some(id);
                    break;
                }
            }
            // No fit: the local allocator handles this bundle via spills.
        }
    }

    // Propagate assignments back as home registers.
    for bundle in &bundles {
        if let Some(id) = bundle.assigned {
            for &m in &bundle.members {
                vregs[m].home = Some(id);
            }
        }
    }
    bundles
}

#[cfg(test)]
#[cfg(feature = "x64")]
mod tests {
    use super::*;
    use crate::callconv::CallConv;
    use crate::ir::{InstId, InstNode, InstOptions, NodeData, NodeList};
    use crate::isa::x64::X64Inst;
    use crate::operand::{Reg, RegType};
    use crate::regalloc::liveness::analyze;

    fn vreg(i: u32) -> Reg {
        Reg::virt(RegType::Gp64, VirtReg::from_u32(i))
    }

    fn pool(n: u32) -> PrimaryMap<VirtReg, VirtRegData> {
        let mut p = PrimaryMap::new();
        for _ in 0..n {
            p.push(VirtRegData::new(RegGroup::Gp, RegType::Gp64, 8));
        }
        p
    }

    #[test]
    fn move_related_registers_coalesce() {
        let mut list = NodeList::new();
        let mov = |l: &mut NodeList, d: u32, s: u32| {
            l.append(NodeData::Inst(InstNode {
                inst: InstId::X64(X64Inst::Mov),
                operands: SmallVec::from_slice(&[vreg(d).into(), vreg(s).into()]),
                options: InstOptions::default(),
            }));
        };
        // v1 dies into v0's definition: disjoint spans, same class.
        mov(&mut list, 0, 1);
        let scheme = CallConv::X64SystemV.scheme();
        let live = analyze(Arch::X64, &mut list, scheme, 2).unwrap();
        let mut vregs = pool(2);
        let bundles = build_and_pack(Arch::X64, &mut vregs, &live);
        let merged: Vec<_> = bundles.iter().filter(|b| b.members.len() == 2).collect();
        assert_eq!(merged.len(), 1);
        // Coalesced members share a physical home.
        assert_eq!(vregs[VirtReg::from_u32(0)].home, vregs[VirtReg::from_u32(1)].home);
        assert!(vregs[VirtReg::from_u32(0)].home.is_some());
        // Invariant: member spans of a coalesced bundle are pairwise
        // disjoint (their union equals the sum of parts).
        let b = merged[0];
        for (i, &m) in b.members.iter().enumerate() {
            for &n in &b.members[i + 1..] {
                assert!(!live.spans[m].intersects(&live.spans[n]));
            }
        }
    }

    #[test]
    fn interfering_registers_do_not_share() {
        let mut list = NodeList::new();
        // add v0, v1 keeps both alive at once.
        list.append(NodeData::Inst(InstNode {
            inst: InstId::X64(X64Inst::Add),
            operands: SmallVec::from_slice(&[vreg(0).into(), vreg(1).into()]),
            options: InstOptions::default(),
        }));
        let scheme = CallConv::X64SystemV.scheme();
        let live = analyze(Arch::X64, &mut list, scheme, 2).unwrap();
        let mut vregs = pool(2);
        let _ = build_and_pack(Arch::X64, &mut vregs, &live);
        let a = vregs[VirtReg::from_u32(0)].home;
        let b = vregs[VirtReg::from_u32(1)].home;
        assert!(a.is_some() && b.is_some());
        assert_ne!(a, b);
    }

    #[test]
    fn hints_win_when_free() {
        let mut list = NodeList::new();
        list.append(NodeData::Inst(InstNode {
            inst: InstId::X64(X64Inst::Inc),
            operands: SmallVec::from_slice(&[vreg(0).into()]),
            options: InstOptions::default(),
        }));
        let scheme = CallConv::X64SystemV.scheme();
        let live = analyze(Arch::X64, &mut list, scheme, 1).unwrap();
        let mut vregs = pool(1);
        vregs[VirtReg::from_u32(0)].home = Some(7); // rdi
        let _ = build_and_pack(Arch::X64, &mut vregs, &live);
        assert_eq!(vregs[VirtReg::from_u32(0)].home, Some(7));
    }

    #[test]
    fn reserved_registers_never_assigned() {
        let mut list = NodeList::new();
        for i in 0..16 {
            list.append(NodeData::Inst(InstNode {
                inst: InstId::X64(X64Inst::Inc),
                operands: SmallVec::from_slice(&[vreg(i).into()]),
                options: InstOptions::default(),
            }));
        }
        let scheme = CallConv::X64SystemV.scheme();
        let live = analyze(Arch::X64, &mut list, scheme, 16).unwrap();
        let mut vregs = pool(16);
        let _ = build_and_pack(Arch::X64, &mut vregs, &live);
        for (_, data) in vregs.iter() {
            if let Some(id) = data.home {
                assert!(id != 4 && id != 10 && id != 11, "reserved register {id} handed out");
            }
        }
    }
}
