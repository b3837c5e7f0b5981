//! Block discovery, instruction numbering and live-range analysis.
//!
//! Every instruction-like node receives an even position; uses read at the
//! position itself, definitions land at position + 1, which keeps half-open
//! spans well-formed for back-to-back redefinitions. Per-block gen/kill bit
//! vectors feed the standard backward dataflow:
//!
//! ```text
//! liveOut[B] = ⋃ liveIn[S]        over successors S
//! liveIn[B]  = (liveOut[B] \ kill[B]) ∪ gen[B]
//! ```

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::callconv::CallConvScheme;
use crate::entity::{EntityRef, SecondaryMap};
use crate::ir::{NodeData, NodeId, NodeList};
use crate::isa::{Arch, BranchKind, OpRw};
use crate::label::Label;
use crate::operand::{Operand, VirtReg};
use crate::result::{CodegenResult, Error};
use crate::support::BitVec;

use super::{info_for, LiveSpans};

/// Weight multiplier applied per enclosing loop.
const LOOP_WEIGHT: u32 = 10;

/// One basic block in linear layout order.
#[derive(Debug)]
pub struct Block {
    /// First node of the block (a label/block node or an instruction).
    pub first: NodeId,
    /// Last node of the block, inclusive.
    pub last: NodeId,
    /// Position of the first instruction in the block.
    pub start_pos: u32,
    /// Position just past the last instruction.
    pub end_pos: u32,
    /// Successor block indices.
    pub succs: SmallVec<[usize; 2]>,
    /// Predecessor block indices.
    pub preds: SmallVec<[usize; 2]>,
    /// Execution-frequency weight (×10 per enclosing loop).
    pub weight: u32,
    /// Virtual registers live on entry.
    pub live_in: BitVec,
    /// Virtual registers live on exit.
    pub live_out: BitVec,
    gen: BitVec,
    kill: BitVec,
}

/// The result of liveness analysis.
#[derive(Debug)]
pub struct Liveness {
    /// Blocks in linear order.
    pub blocks: Vec<Block>,
    /// Merged live spans per virtual register.
    pub spans: SecondaryMap<VirtReg, LiveSpans>,
    /// Weighted reference count per virtual register.
    pub freq: SecondaryMap<VirtReg, u32>,
    /// `mov vdst, vsrc` coalescing candidates.
    pub mov_pairs: Vec<(VirtReg, VirtReg)>,
    /// Which block a label starts.
    pub label_block: FxHashMap<Label, usize>,
}

/// Virtual-register references of one node, in operand order.
pub fn node_refs(
    arch: Arch,
    list: &NodeList,
    id: NodeId,
    scheme: &CallConvScheme,
) -> SmallVec<[(VirtReg, OpRw); 6]> {
    let mut refs: SmallVec<[(VirtReg, OpRw); 6]> = SmallVec::new();
    match &list.node(id).data {
        NodeData::Inst(inst) => {
            let info = info_for(arch, inst, scheme);
            for (i, op) in inst.operands.iter().enumerate() {
                let rw = info.rw.get(i).copied().unwrap_or(OpRw::R);
                match op {
                    Operand::Reg(r) => {
                        if let Some(v) = r.as_virt() {
                            refs.push((v, rw));
                        }
                    }
                    Operand::Mem(m) => {
                        // Address registers are always reads.
                        for r in [m.base, m.index].into_iter().flatten() {
                            if let Some(v) = r.as_virt() {
                                refs.push((v, OpRw::R));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        NodeData::Invoke(invoke) => {
            if let Operand::Reg(r) = &invoke.target {
                if let Some(v) = r.as_virt() {
                    refs.push((v, OpRw::R));
                }
            }
            for op in &invoke.args {
                if let Operand::Reg(r) = op {
                    if let Some(v) = r.as_virt() {
                        refs.push((v, OpRw::R));
                    }
                }
            }
            if let Some(ret) = invoke.ret {
                if let Some(v) = ret.as_virt() {
                    refs.push((v, OpRw::W));
                }
            }
        }
        NodeData::FuncRet(ops) => {
            for op in ops {
                if let Operand::Reg(r) = op {
                    if let Some(v) = r.as_virt() {
                        refs.push((v, OpRw::R));
                    }
                }
            }
        }
        NodeData::Func(func) => {
            for v in func.args.iter().flatten() {
                refs.push((*v, OpRw::W));
            }
        }
        _ => {}
    }
    refs
}

/// Is this node an instruction for numbering purposes?
fn is_inst_like(data: &NodeData) -> bool {
    matches!(
        data,
        NodeData::Inst(_) | NodeData::Invoke(_) | NodeData::FuncRet(_) | NodeData::Func(_)
    )
}

/// Control-flow classification of a node; labels of branch targets.
fn node_branch(
    arch: Arch,
    data: &NodeData,
    scheme: &CallConvScheme,
) -> (BranchKind, Option<Label>) {
    match data {
        NodeData::Inst(inst) => {
            let info = info_for(arch, inst, scheme);
            let target = inst.operands.first().and_then(|op| op.as_label());
            (info.branch, target)
        }
        NodeData::FuncRet(_) => (BranchKind::Ret, None),
        _ => (BranchKind::None, None),
    }
}

/// Run block discovery, numbering and the dataflow over `list`.
pub fn analyze(
    arch: Arch,
    list: &mut NodeList,
    scheme: &CallConvScheme,
    num_virt: usize,
) -> CodegenResult<Liveness> {
    // Number instruction-like nodes with even positions; block-opening
    // nodes take the position of the first following instruction.
    let mut pos = 0u32;
    let mut pending: SmallVec<[NodeId; 4]> = SmallVec::new();
    let mut cur = list.first();
    while let Some(id) = cur {
        let next = list.next(id);
        if is_inst_like(&list.node(id).data) {
            for p in pending.drain(..) {
                list.node_mut(p).pos = pos;
            }
            list.node_mut(id).pos = pos;
            pos += 2;
        } else {
            pending.push(id);
        }
        cur = next;
    }
    for p in pending.drain(..) {
        list.node_mut(p).pos = pos;
    }

    // Split the list into blocks and record edges.
    enum Edge {
        To(Label),
        FallThrough,
    }
    let mut blocks: Vec<Block> = Vec::new();
    let mut edges: Vec<(usize, Edge)> = Vec::new();
    let mut label_block: FxHashMap<Label, usize> = FxHashMap::default();

    let mut block_first: Option<NodeId> = None;
    let mut block_last: Option<NodeId> = None;
    let mut open_falls_through = false;

    let mut close =
        |blocks: &mut Vec<Block>, first: NodeId, last: NodeId, list: &NodeList| -> usize {
            let start_pos = list.node(first).pos;
            let end_pos = list.node(last).pos + 2;
            blocks.push(Block {
                first,
                last,
                start_pos,
                end_pos,
                succs: SmallVec::new(),
                preds: SmallVec::new(),
                weight: 1,
                live_in: BitVec::with_len(num_virt),
                live_out: BitVec::with_len(num_virt),
                gen: BitVec::with_len(num_virt),
                kill: BitVec::with_len(num_virt),
            });
            blocks.len() - 1
        };

    let mut cur = list.first();
    while let Some(id) = cur {
        let next = list.next(id);
        let data = &list.node(id).data;
        match data {
            NodeData::Label(l) | NodeData::Block(l) => {
                let label = *l;
                if let (Some(first), Some(last)) = (block_first, block_last) {
                    // Fall through from the open block into this one.
                    let b = close(&mut blocks, first, last, list);
                    if open_falls_through {
                        edges.push((b, Edge::FallThrough));
                    }
                }
                block_first = Some(id);
                block_last = Some(id);
                open_falls_through = true;
                if label_block.insert(label, blocks.len()).is_some() {
                    return Err(Error::InvalidLabel);
                }
            }
            _ => {
                if block_first.is_none() {
                    block_first = Some(id);
                    open_falls_through = true;
                }
                block_last = Some(id);
                let (branch, target) = node_branch(arch, data, scheme);
                match branch {
                    BranchKind::Jump => {
                        let b = close(&mut blocks, block_first.unwrap(), id, list);
                        if let Some(t) = target {
                            edges.push((b, Edge::To(t)));
                        }
                        block_first = None;
                        block_last = None;
                        open_falls_through = false;
                    }
                    BranchKind::CondJump => {
                        let b = close(&mut blocks, block_first.unwrap(), id, list);
                        if let Some(t) = target {
                            edges.push((b, Edge::To(t)));
                        }
                        edges.push((b, Edge::FallThrough));
                        block_first = None;
                        block_last = None;
                        open_falls_through = false;
                    }
                    BranchKind::Ret => {
                        let _ = close(&mut blocks, block_first.unwrap(), id, list);
                        block_first = None;
                        block_last = None;
                        open_falls_through = false;
                    }
                    BranchKind::None | BranchKind::Call => {}
                }
            }
        }
        cur = next;
    }
    if let (Some(first), Some(last)) = (block_first, block_last) {
        close(&mut blocks, first, last, list);
    }

    // A label bound after all code maps to no block; keep it out of the
    // CFG (it still binds during serialization).
    // Resolve edges.
    for (i, edge) in edges {
        let to = match edge {
            Edge::To(label) => match label_block.get(&label) {
                Some(&b) => b,
                None => continue,
            },
            Edge::FallThrough => {
                if i + 1 < blocks.len() {
                    i + 1
                } else {
                    continue;
                }
            }
        };
        if !blocks[i].succs.contains(&to) {
            blocks[i].succs.push(to);
            blocks[to].preds.push(i);
        }
    }

    // Backward branches multiply the weights of the enclosed blocks.
    let backedges: Vec<(usize, usize)> = blocks
        .iter()
        .enumerate()
        .flat_map(|(i, b)| b.succs.iter().filter(move |&&s| s <= i).map(move |&s| (s, i)))
        .collect();
    for (head, tail) in backedges {
        for block in &mut blocks[head..=tail] {
            block.weight = block.weight.saturating_mul(LOOP_WEIGHT).min(100_000);
        }
    }

    // Per-block gen/kill.
    let mut mov_pairs = Vec::new();
    for block in &mut blocks {
        let mut cur = Some(block.first);
        loop {
            let id = match cur {
                Some(id) => id,
                None => break,
            };
            for (v, rw) in node_refs(arch, list, id, scheme) {
                if rw.read && !block.kill.contains(v.index()) {
                    block.gen.insert(v.index());
                }
                if rw.write {
                    block.kill.insert(v.index());
                }
            }
            if let NodeData::Inst(inst) = &list.node(id).data {
                let info = info_for(arch, inst, scheme);
                if info.is_move {
                    if let (Some(d), Some(s)) = (
                        inst.operands[0].as_reg().and_then(|r| r.as_virt()),
                        inst.operands[1].as_reg().and_then(|r| r.as_virt()),
                    ) {
                        mov_pairs.push((d, s));
                    }
                }
            }
            if id == block.last {
                break;
            }
            cur = list.next(id);
        }
    }

    // Iterative dataflow to fixpoint.
    let mut changed = true;
    let mut rounds = 0u32;
    while changed {
        changed = false;
        rounds += 1;
        for i in (0..blocks.len()).rev() {
            let mut out = BitVec::with_len(num_virt);
            for &s in &blocks[i].succs {
                out.union_with(&blocks[s].live_in);
            }
            if out != blocks[i].live_out {
                blocks[i].live_out = out;
                changed = true;
            }
            let live_out = blocks[i].live_out.clone();
            let kill = blocks[i].kill.clone();
            let gen = blocks[i].gen.clone();
            if blocks[i].live_in.assign_dataflow(&live_out, &kill, &gen) {
                changed = true;
            }
        }
    }
    log::trace!("liveness fixpoint after {rounds} rounds over {} blocks", blocks.len());

    // Live spans and weighted frequencies, one forward sweep. A use at
    // position p keeps the register live over [p, p+1); a def occupies
    // [p+1, p+2). Closing uses before the def point is what lets a move's
    // source and destination coalesce.
    let mut spans: SecondaryMap<VirtReg, LiveSpans> = SecondaryMap::new();
    let mut freq: SecondaryMap<VirtReg, u32> = SecondaryMap::new();
    for block in &blocks {
        let mut open: FxHashMap<VirtReg, u32> = FxHashMap::default();
        let mut last_end: FxHashMap<VirtReg, u32> = FxHashMap::default();
        for v in block.live_in.iter() {
            let v = VirtReg::new(v);
            open.insert(v, block.start_pos);
            last_end.insert(v, block.start_pos + 1);
        }
        let mut cur = Some(block.first);
        loop {
            let id = match cur {
                Some(id) => id,
                None => break,
            };
            let pos = list.node(id).pos;
            for (v, rw) in node_refs(arch, list, id, scheme) {
                let at = if rw.read { pos } else { pos + 1 };
                open.entry(v).or_insert(at);
                let end = if rw.write { pos + 2 } else { pos + 1 };
                let slot = last_end.entry(v).or_insert(end);
                *slot = (*slot).max(end);
                freq[v] = freq[v].saturating_add(block.weight);
            }
            if id == block.last {
                break;
            }
            cur = list.next(id);
        }
        for (v, start) in open {
            let end = if block.live_out.contains(v.index()) {
                block.end_pos
            } else {
                last_end[&v]
            };
            if end > start {
                spans[v].add(start, end);
            }
        }
    }

    Ok(Liveness { blocks, spans, freq, mov_pairs, label_block })
}

#[cfg(test)]
#[cfg(feature = "x64")]
mod tests {
    use super::*;
    use crate::callconv::CallConv;
    use crate::ir::{InstId, InstNode, InstOptions, NodeData, NodeList};
    use crate::isa::x64::{Cond, X64Inst};
    use crate::label::LabelManager;
    use crate::operand::{Imm, Operand, Reg, RegType};

    fn vreg(i: u32) -> Reg {
        Reg::virt(RegType::Gp64, VirtReg::from_u32(i))
    }

    fn inst(list: &mut NodeList, inst: X64Inst, ops: &[Operand]) -> NodeId {
        list.append(NodeData::Inst(InstNode {
            inst: InstId::X64(inst),
            operands: SmallVec::from_slice(ops),
            options: InstOptions::default(),
        }))
    }

    #[test]
    fn straight_line_spans() {
        let mut list = NodeList::new();
        // v0 = v1; v2 = v0 + v2 (modeled as add v2, v0).
        inst(&mut list, X64Inst::Mov, &[vreg(0).into(), vreg(1).into()]);
        inst(&mut list, X64Inst::Add, &[vreg(2).into(), vreg(0).into()]);
        let scheme = CallConv::X64SystemV.scheme();
        let live = analyze(Arch::X64, &mut list, scheme, 3).unwrap();
        assert_eq!(live.blocks.len(), 1);
        // v1 is only read at position 0; its range closes before the def
        // point of the same instruction.
        assert_eq!(live.spans[VirtReg::from_u32(1)].as_slice(), &[(0, 1)]);
        // v0 defined at 1, last read at 2.
        assert_eq!(live.spans[VirtReg::from_u32(0)].as_slice(), &[(1, 3)]);
        // The move's source and destination do not interfere.
        assert!(!live.spans[VirtReg::from_u32(0)]
            .intersects(&live.spans[VirtReg::from_u32(1)]));
        assert_eq!(live.mov_pairs, vec![(VirtReg::from_u32(0), VirtReg::from_u32(1))]);
    }

    #[test]
    fn loop_weights_and_live_through() {
        let mut list = NodeList::new();
        let mut labels = LabelManager::new();
        let head = labels.new_label();
        // v0 defined before the loop, used after it: live through the body.
        inst(&mut list, X64Inst::Mov, &[vreg(0).into(), Imm::new(1).into()]);
        list.append(NodeData::Label(head));
        inst(&mut list, X64Inst::Dec, &[vreg(1).into()]);
        inst(&mut list, X64Inst::Jcc(Cond::Ne), &[head.into()]);
        inst(&mut list, X64Inst::Add, &[vreg(2).into(), vreg(0).into()]);
        let scheme = CallConv::X64SystemV.scheme();
        let live = analyze(Arch::X64, &mut list, scheme, 3).unwrap();
        assert_eq!(live.blocks.len(), 3);
        // The loop body runs hotter than the prelude.
        assert!(live.blocks[1].weight > live.blocks[0].weight);
        // v0 is live across the loop body block.
        let body = &live.blocks[1];
        assert!(body.live_in.contains(0));
        assert!(body.live_out.contains(0));
        // And its span covers the body.
        let span = &live.spans[VirtReg::from_u32(0)];
        assert!(span.as_slice().iter().any(|&(a, b)| a <= body.start_pos && b >= body.end_pos));
    }

    #[test]
    fn mem_operands_read_their_registers() {
        let mut list = NodeList::new();
        let mem = crate::operand::Mem::base_index(vreg(0), vreg(1), 1, 0).with_size(1);
        inst(&mut list, X64Inst::Mov, &[mem.into(), vreg(2).into()]);
        let scheme = CallConv::X64SystemV.scheme();
        let live = analyze(Arch::X64, &mut list, scheme, 3).unwrap();
        let b = &live.blocks[0];
        // All three participate; none is written.
        assert!(b.gen.contains(0));
        assert!(b.gen.contains(1));
        assert!(b.gen.contains(2));
        assert!(!b.kill.contains(0));
    }
}
