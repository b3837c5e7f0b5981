//! The per-instruction register allocator.
//!
//! Walks the node list in program order, keeping the current mapping of
//! physical registers to virtual registers per group. For each instruction
//! it builds the tied-operand list, then runs the phases in order: plan,
//! consecutive sequences, assignment decision, free, allocate/shuffle uses,
//! kill dead operands, spill clobbered registers, assign outs. Loads, saves,
//! moves and swaps are inserted into the node list around the instruction;
//! operands are rewritten to physical registers in place.
//!
//! Block transitions record each block's entry assignment on first arrival;
//! later edges into the block must match or be resolvable by parallel
//! moves at the predecessor's end. Resolution on a critical edge is
//! refused with `InvalidState` rather than patched on the edge.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::callconv::CallConvScheme;
use crate::entity::{EntityRef, PrimaryMap};
use crate::frame::FuncFrame;
use crate::func::FuncValue;
use crate::ir::{InstId, InstNode, InstOptions, NodeData, NodeId, NodeList};
use crate::isa::{Arch, OpRw};
use crate::operand::{Mem, Operand, Reg, RegGroup, RegType, VirtReg};
use crate::result::{CodegenResult, Error};

use super::liveness::Liveness;
use super::moves::{schedule, MoveOp};
use super::{info_for, VirtRegData};

/// Spill-cost weights: frequency dominates, dirtiness tips ties.
const COST_FREQ: u64 = 1 << 20;
const COST_DIRTY: u64 = 1 << 18;

/// Constraint flags of one tied operand.
#[derive(Clone, Copy, Debug, Default)]
pub struct TiedFlags {
    /// The old value is read at the use point.
    pub used: bool,
    /// A new value is produced at the def point.
    pub out: bool,
    /// The use must sit in `use_id`.
    pub use_fixed: bool,
    /// The def must land in `out_id`.
    pub out_fixed: bool,
    /// The register dies at this instruction.
    pub kill: bool,
    /// Leads a run of consecutive registers.
    pub lead_consecutive: bool,
}

/// One virtual register's constraints at one instruction.
#[derive(Clone, Debug)]
pub struct TiedReg {
    /// The virtual register.
    pub vreg: VirtReg,
    /// Its register group.
    pub group: RegGroup,
    /// Constraint flags.
    pub flags: TiedFlags,
    /// Feasible physical ids for the use.
    pub use_mask: u32,
    /// Feasible physical ids for the def.
    pub out_mask: u32,
    /// Forced use register.
    pub use_id: Option<u8>,
    /// Forced def register.
    pub out_id: Option<u8>,
    /// How many operands of the instruction reference this register.
    pub ref_count: u8,
    /// The physical register the allocator settled on.
    pub resolved: Option<u8>,
}

/// Current physical-register contents for one group.
#[derive(Clone, Debug)]
struct GroupState {
    phys_to_virt: [Option<VirtReg>; 32],
    /// Physical registers whose value is newer than the spill slot.
    dirty: u32,
}

impl Default for GroupState {
    fn default() -> Self {
        Self { phys_to_virt: [None; 32], dirty: 0 }
    }
}

/// The full assignment state.
#[derive(Clone, Debug, Default)]
struct AssignState {
    groups: [GroupState; RegGroup::NUM_ALLOCATABLE],
    loc: FxHashMap<VirtReg, u8>,
}

impl AssignState {
    fn holder(&self, group: RegGroup, id: u8) -> Option<VirtReg> {
        self.groups[group.index()].phys_to_virt[id as usize]
    }

    fn loc_of(&self, v: VirtReg) -> Option<u8> {
        self.loc.get(&v).copied()
    }

    fn assign(&mut self, group: RegGroup, v: VirtReg, id: u8, dirty: bool) {
        debug_assert!(self.holder(group, id).is_none(), "register already occupied");
        debug_assert!(!self.loc.contains_key(&v), "virtual already assigned");
        self.groups[group.index()].phys_to_virt[id as usize] = Some(v);
        self.loc.insert(v, id);
        if dirty {
            self.groups[group.index()].dirty |= 1 << id;
        } else {
            self.groups[group.index()].dirty &= !(1 << id);
        }
    }

    fn unassign(&mut self, group: RegGroup, v: VirtReg) {
        if let Some(id) = self.loc.remove(&v) {
            self.groups[group.index()].phys_to_virt[id as usize] = None;
            self.groups[group.index()].dirty &= !(1 << id);
        }
    }

    fn is_dirty(&self, group: RegGroup, id: u8) -> bool {
        self.groups[group.index()].dirty & (1 << id) != 0
    }

    fn mark_dirty(&mut self, group: RegGroup, id: u8) {
        self.groups[group.index()].dirty |= 1 << id;
    }

    fn mark_clean(&mut self, group: RegGroup, id: u8) {
        self.groups[group.index()].dirty &= !(1 << id);
    }

    fn used_mask(&self, group: RegGroup) -> u32 {
        let mut mask = 0;
        for (id, slot) in self.groups[group.index()].phys_to_virt.iter().enumerate() {
            if slot.is_some() {
                mask |= 1 << id;
            }
        }
        mask
    }

    /// The register map restricted to a liveness set, as (virt, phys).
    fn snapshot(&self, live: &crate::support::BitVec) -> Vec<(VirtReg, u8)> {
        let mut snap: Vec<(VirtReg, u8)> = self
            .loc
            .iter()
            .filter(|(v, _)| live.contains(v.index()))
            .map(|(&v, &p)| (v, p))
            .collect();
        snap.sort_unstable();
        snap
    }
}

/// The local allocator over one function body.
pub struct LocalAlloc<'a> {
    arch: Arch,
    list: &'a mut NodeList,
    vregs: &'a mut PrimaryMap<VirtReg, VirtRegData>,
    live: &'a Liveness,
    frame: &'a mut FuncFrame,
    scheme: &'static CallConvScheme,
    state: AssignState,
    /// Entry assignment per block, recorded on first arrival.
    block_entry: Vec<Option<Vec<(VirtReg, u8)>>>,
    /// Scratch spill slot for vector swaps, allocated on demand.
    vec_swap_slot: Option<u32>,
}

/// Run local allocation over the whole node list.
pub fn run(
    arch: Arch,
    list: &mut NodeList,
    vregs: &mut PrimaryMap<VirtReg, VirtRegData>,
    live: &Liveness,
    frame: &mut FuncFrame,
    scheme: &'static CallConvScheme,
) -> CodegenResult<()> {
    let nblocks = live.blocks.len();
    let mut alloc = LocalAlloc {
        arch,
        list,
        vregs,
        live,
        frame,
        scheme,
        state: AssignState::default(),
        block_entry: vec![None; nblocks],
        vec_swap_slot: None,
    };
    alloc.run_all()
}

impl<'a> LocalAlloc<'a> {
    fn run_all(&mut self) -> CodegenResult<()> {
        let mut block_idx = 0usize;
        let mut cur = self.list.first();
        while let Some(id) = cur {
            let next = self.list.next(id);

            // Entering a block: reconcile with its recorded entry state.
            if block_idx < self.live.blocks.len() && self.live.blocks[block_idx].first == id {
                self.enter_block(block_idx, id)?;
            }

            match &self.list.node(id).data {
                NodeData::Func(_) => self.visit_func(id)?,
                NodeData::Inst(_) => self.visit_inst(id)?,
                NodeData::Invoke(_) => self.visit_invoke(id)?,
                NodeData::FuncRet(_) => self.visit_func_ret(id)?,
                _ => {}
            }

            // Leaving a block through its last node: propagate state.
            if block_idx < self.live.blocks.len() && self.live.blocks[block_idx].last == id {
                self.exit_block(block_idx, id)?;
                block_idx += 1;
            }
            cur = next;
        }
        Ok(())
    }

    // ---- block transitions -------------------------------------------

    fn enter_block(&mut self, bi: usize, first: NodeId) -> CodegenResult<()> {
        let live_in = &self.live.blocks[bi].live_in;
        // Values dead on entry vacate their registers; their last use was
        // on some other path or behind us.
        let dead: Vec<VirtReg> = self
            .state
            .loc
            .keys()
            .copied()
            .filter(|v| !live_in.contains(v.index()))
            .collect();
        for v in dead {
            let group = self.vregs[v].group;
            self.state.unassign(group, v);
        }

        let has_fallthrough = bi == 0 || self.live.blocks[bi].preds.contains(&(bi - 1));
        match &self.block_entry[bi] {
            None => {
                let snap = self.state.snapshot(live_in);
                self.block_entry[bi] = Some(snap);
            }
            Some(entry) => {
                let entry = entry.clone();
                if has_fallthrough {
                    // Resolution moves sit just before the block head,
                    // crossed only by the fall-through path.
                    self.resolve_to_entry(&entry, live_in, first)?;
                } else {
                    // Control arrives by jumps only; those edges were
                    // reconciled at their sources. Adopt the entry map.
                    let keys: Vec<VirtReg> = self.state.loc.keys().copied().collect();
                    for v in keys {
                        let group = self.vregs[v].group;
                        self.state.unassign(group, v);
                    }
                    for &(v, id) in &entry {
                        let group = self.vregs[v].group;
                        self.state.assign(group, v, id, true);
                    }
                }
            }
        }
        Ok(())
    }

    fn exit_block(&mut self, bi: usize, last: NodeId) -> CodegenResult<()> {
        let succs = self.live.blocks[bi].succs.clone();
        for &s in &succs {
            let live_in = &self.live.blocks[s].live_in;
            match &self.block_entry[s] {
                None => {
                    let snap = self.state.snapshot(live_in);
                    self.block_entry[s] = Some(snap);
                }
                Some(entry) => {
                    if s == bi + 1 {
                        // Fall-through edges resolve at the successor's
                        // head, which only the fall-through path crosses.
                        continue;
                    }
                    let entry = entry.clone();
                    let current = self.state.snapshot(live_in);
                    if current == entry {
                        continue;
                    }
                    // Resolution moves live at the predecessor's end. With
                    // several successors the insertion point is shared, so
                    // a divergent expectation cannot be honored there.
                    // Likewise a branch that reads registers could see
                    // them clobbered by moves inserted in front of it.
                    if succs.len() > 1 || !self.list.is_active(last) || branch_reads_regs(self.list, last) {
                        return Err(Error::InvalidState);
                    }
                    self.resolve_to_entry(&entry, live_in, last)?;
                }
            }
        }
        Ok(())
    }

    /// Emit moves/loads/saves before `anchor` so the current state matches
    /// `entry` for every register in `live_in`.
    fn resolve_to_entry(
        &mut self,
        entry: &[(VirtReg, u8)],
        live_in: &crate::support::BitVec,
        anchor: NodeId,
    ) -> CodegenResult<()> {
        let want: FxHashMap<VirtReg, u8> = entry.iter().copied().collect();

        // Values dead across this edge just vacate; values the target
        // expects in memory get saved first.
        let in_regs: Vec<(VirtReg, u8)> =
            self.state.loc.iter().map(|(&v, &p)| (v, p)).collect();
        for (v, _) in &in_regs {
            let group = self.vregs[*v].group;
            if !live_in.contains(v.index()) {
                self.state.unassign(group, *v);
            } else if !want.contains_key(v) {
                self.spill_before(*v, anchor)?;
                self.state.unassign(group, *v);
            }
        }

        // Schedule register-to-register motion per group.
        for group in [RegGroup::Gp, RegGroup::Vec, RegGroup::Mask] {
            let mut pairs: Vec<(u8, u8)> = Vec::new();
            for (&v, &dst) in want.iter() {
                if self.vregs[v].group != group {
                    continue;
                }
                if let Some(src) = self.state.loc_of(v) {
                    if src != dst {
                        pairs.push((dst, src));
                    }
                }
            }
            if pairs.is_empty() {
                continue;
            }
            for op in schedule(&pairs) {
                match op {
                    MoveOp::Move { dst, src } => {
                        // The destination must be free or part of the
                        // permutation; the scheduler guarantees nobody
                        // still reads it.
                        if let Some(hold) = self.state.holder(group, dst) {
                            if !want.contains_key(&hold) || want[&hold] != dst {
                                self.spill_before(hold, anchor)?;
                                self.state.unassign(group, hold);
                            }
                        }
                        self.emit_move_before(group, dst, src, anchor);
                        if let Some(v) = self.state.holder(group, src) {
                            let dirty = self.state.is_dirty(group, src);
                            self.state.unassign(group, v);
                            self.state.assign(group, v, dst, dirty);
                        }
                    }
                    MoveOp::Swap { a, b } => {
                        self.emit_swap_before(group, a, b, anchor)?;
                        let va = self.state.holder(group, a);
                        let vb = self.state.holder(group, b);
                        let da = self.state.is_dirty(group, a);
                        let db = self.state.is_dirty(group, b);
                        if let Some(v) = va {
                            self.state.unassign(group, v);
                        }
                        if let Some(v) = vb {
                            self.state.unassign(group, v);
                        }
                        if let Some(v) = va {
                            self.state.assign(group, v, b, da);
                        }
                        if let Some(v) = vb {
                            self.state.assign(group, v, a, db);
                        }
                    }
                }
            }
        }

        // Load what the target expects in registers but we hold in memory.
        for (&v, &dst) in want.iter() {
            if self.state.loc_of(v).is_none() {
                let group = self.vregs[v].group;
                if let Some(hold) = self.state.holder(group, dst) {
                    self.spill_before(hold, anchor)?;
                    self.state.unassign(group, hold);
                }
                self.emit_load_before(v, dst, anchor)?;
                self.state.assign(group, v, dst, false);
            }
        }
        Ok(())
    }

    // ---- node visitors -----------------------------------------------

    fn visit_func(&mut self, id: NodeId) -> CodegenResult<()> {
        let (args, values): (Vec<Option<VirtReg>>, Vec<FuncValue>) = match &self.list.node(id).data
        {
            NodeData::Func(f) => (f.args.iter().copied().collect(), f.detail.args.to_vec()),
            _ => unreachable!(),
        };
        for (slot, value) in args.iter().zip(values.iter()) {
            let v = match slot {
                Some(v) => *v,
                None => continue,
            };
            match value {
                FuncValue::Reg { reg, .. } | FuncValue::Indirect { reg, .. } => {
                    let group = self.vregs[v].group;
                    self.state.assign(group, v, reg.phys_id(), true);
                    if self.vregs[v].home.is_none() {
                        self.vregs[v].home = Some(reg.phys_id());
                    }
                }
                FuncValue::Stack { offset, .. } => {
                    self.vregs[v].incoming = Some(*offset);
                }
            }
        }
        Ok(())
    }

    fn visit_func_ret(&mut self, id: NodeId) -> CodegenResult<()> {
        let (ret_value, ops) = match &self.list.node(id).data {
            NodeData::FuncRet(ops) => {
                // The function's own return register comes from the frame's
                // calling convention via the function detail recorded at
                // build time; the first operand carries the value.
                (self.func_ret_reg(), ops.clone())
            }
            _ => unreachable!(),
        };
        let mut tied: Vec<TiedReg> = Vec::new();
        if let (Some(ret_reg), Some(Operand::Reg(r))) = (ret_value, ops.first()) {
            if let Some(v) = r.as_virt() {
                tied.push(TiedReg {
                    vreg: v,
                    group: self.vregs[v].group,
                    flags: TiedFlags { used: true, use_fixed: true, ..Default::default() },
                    use_mask: 1 << ret_reg.phys_id(),
                    out_mask: 0,
                    use_id: Some(ret_reg.phys_id()),
                    out_id: None,
                    ref_count: 1,
                    resolved: None,
                });
            }
        }
        self.run_phases(id, &mut tied, [0; RegGroup::NUM_ALLOCATABLE])?;
        // Rewrite the operand so later passes see a physical register.
        if let Some(t) = tied.first() {
            let resolved = t.resolved.expect("return value allocated");
            if let NodeData::FuncRet(ops) = &mut self.list.node_mut(id).data {
                if let Some(Operand::Reg(r)) = ops.first_mut() {
                    *r = Reg::phys(r.rtype(), resolved);
                }
            }
        }
        Ok(())
    }

    /// The physical return register of the current function, if any.
    fn func_ret_reg(&self) -> Option<Reg> {
        let mut cur = self.list.first();
        while let Some(id) = cur {
            if let NodeData::Func(f) = &self.list.node(id).data {
                return f.detail.ret.as_ref().and_then(|r| r.reg());
            }
            cur = self.list.next(id);
        }
        None
    }

    fn visit_inst(&mut self, id: NodeId) -> CodegenResult<()> {
        let (info, operands) = match &self.list.node(id).data {
            NodeData::Inst(inst) => {
                (info_for(self.arch, inst, self.scheme), inst.operands.clone())
            }
            _ => unreachable!(),
        };
        let pos = self.list.node(id).pos;

        // Build the tied-operand list: one entry per virtual register,
        // merging multiple references.
        let mut tied: Vec<TiedReg> = Vec::new();
        let mut add = |vreg: VirtReg,
                       group: RegGroup,
                       rw: OpRw,
                       fixed: Option<u8>,
                       tied: &mut Vec<TiedReg>| {
            if let Some(t) = tied.iter_mut().find(|t| t.vreg == vreg) {
                t.flags.used |= rw.read;
                t.flags.out |= rw.write;
                t.ref_count += 1;
                if let Some(f) = fixed {
                    if rw.read {
                        t.flags.use_fixed = true;
                        t.use_id = Some(f);
                    }
                    if rw.write {
                        t.flags.out_fixed = true;
                        t.out_id = Some(f);
                    }
                }
            } else {
                let mask = self.allocatable(group);
                tied.push(TiedReg {
                    vreg,
                    group,
                    flags: TiedFlags {
                        used: rw.read,
                        out: rw.write,
                        use_fixed: fixed.is_some() && rw.read,
                        out_fixed: fixed.is_some() && rw.write,
                        ..Default::default()
                    },
                    use_mask: fixed.map_or(mask, |f| 1 << f),
                    out_mask: fixed.map_or(mask, |f| 1 << f),
                    use_id: if rw.read { fixed } else { None },
                    out_id: if rw.write { fixed } else { None },
                    ref_count: 1,
                    resolved: None,
                });
            }
        };
        for (i, op) in operands.iter().enumerate() {
            let rw = info.rw.get(i).copied().unwrap_or(OpRw::R);
            let fixed = info.fixed.iter().find(|&&(idx, _)| idx == i).map(|&(_, f)| f);
            match op {
                Operand::Reg(r) => {
                    if let Some(v) = r.as_virt() {
                        add(v, self.vregs[v].group, rw, fixed, &mut tied);
                    }
                }
                Operand::Mem(m) => {
                    for r in [m.base, m.index].into_iter().flatten() {
                        if let Some(v) = r.as_virt() {
                            add(v, self.vregs[v].group, OpRw::R, None, &mut tied);
                        }
                    }
                }
                _ => {}
            }
        }
        // Mark kills from liveness.
        for t in &mut tied {
            t.flags.kill = self.dies_at(t.vreg, pos);
        }

        self.run_phases(id, &mut tied, info.clobbers)?;

        // Rewrite operands to physical registers.
        let resolve = |tied: &[TiedReg], v: VirtReg| -> u8 {
            tied.iter().find(|t| t.vreg == v).and_then(|t| t.resolved).expect("operand allocated")
        };
        if let NodeData::Inst(inst) = &mut self.list.node_mut(id).data {
            for op in inst.operands.iter_mut() {
                match op {
                    Operand::Reg(r) => {
                        if let Some(v) = r.as_virt() {
                            *r = Reg::phys(r.rtype(), resolve(&tied, v));
                        }
                    }
                    Operand::Mem(m) => {
                        if let Some(base) = m.base {
                            if let Some(v) = base.as_virt() {
                                m.base = Some(Reg::phys(base.rtype(), resolve(&tied, v)));
                            }
                        }
                        if let Some(index) = m.index {
                            if let Some(v) = index.as_virt() {
                                m.index = Some(Reg::phys(index.rtype(), resolve(&tied, v)));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        // Redundant-move elimination: a move that resolved to the same
        // physical register on both sides has no effect.
        if info.is_move {
            if let NodeData::Inst(inst) = &self.list.node(id).data {
                if let (Some(Operand::Reg(a)), Some(Operand::Reg(b))) =
                    (inst.operands.first(), inst.operands.get(1))
                {
                    if !a.is_virt() && !b.is_virt() && a.phys_id() == b.phys_id() {
                        self.list.remove(id);
                    }
                }
            }
        }
        Ok(())
    }

    fn visit_invoke(&mut self, id: NodeId) -> CodegenResult<()> {
        let (target, detail, args, ret) = match &self.list.node(id).data {
            NodeData::Invoke(inv) => {
                (inv.target, inv.detail.clone(), inv.args.clone(), inv.ret)
            }
            _ => unreachable!(),
        };
        let pos = self.list.node(id).pos;
        let callee_scheme = detail.call_conv.scheme();

        let mut tied: Vec<TiedReg> = Vec::new();

        // Register arguments tie to their ABI slots.
        for (op, value) in args.iter().zip(detail.args.iter()) {
            let (Operand::Reg(r), Some(abi_reg)) = (*op, value.reg()) else { continue };
            let Some(v) = r.as_virt() else { continue };
            let fixed = abi_reg.phys_id();
            if let Some(t) = tied.iter_mut().find(|t| t.vreg == v) {
                // One value feeding two argument slots: the second slot is
                // satisfied by a duplicate move emitted below.
                t.ref_count += 1;
                continue;
            }
            tied.push(TiedReg {
                vreg: v,
                group: self.vregs[v].group,
                flags: TiedFlags { used: true, use_fixed: true, ..Default::default() },
                use_mask: 1 << fixed,
                out_mask: 0,
                use_id: Some(fixed),
                out_id: None,
                ref_count: 1,
                resolved: None,
            });
        }

        // An indirect target is a plain use.
        if let Operand::Reg(r) = target {
            if let Some(v) = r.as_virt() {
                let mask = self.allocatable(self.vregs[v].group);
                tied.push(TiedReg {
                    vreg: v,
                    group: self.vregs[v].group,
                    flags: TiedFlags { used: true, ..Default::default() },
                    use_mask: mask,
                    out_mask: mask,
                    use_id: None,
                    out_id: None,
                    ref_count: 1,
                    resolved: None,
                });
            }
        }

        // The return value defines its ABI register.
        if let (Some(ret_reg), Some(ret_val)) =
            (ret, detail.ret.as_ref().and_then(|r| r.reg()))
        {
            if let Some(v) = ret_reg.as_virt() {
                tied.push(TiedReg {
                    vreg: v,
                    group: self.vregs[v].group,
                    flags: TiedFlags { out: true, out_fixed: true, ..Default::default() },
                    use_mask: 0,
                    out_mask: 1 << ret_val.phys_id(),
                    use_id: None,
                    out_id: Some(ret_val.phys_id()),
                    ref_count: 1,
                    resolved: None,
                });
            }
        }

        for t in &mut tied {
            t.flags.kill = self.dies_at(t.vreg, pos);
        }

        // Caller-saved registers die across the call.
        let mut clobbers = [0u32; RegGroup::NUM_ALLOCATABLE];
        clobbers[RegGroup::Gp.index()] = !callee_scheme.preserved_gp;
        clobbers[RegGroup::Vec.index()] = !callee_scheme.preserved_vec;

        self.run_phases(id, &mut tied, clobbers)?;

        // Duplicate-argument slots: emit the extra copies now that the
        // primary slot is in place.
        for (op, value) in args.iter().zip(detail.args.iter()) {
            let (Operand::Reg(r), Some(abi_reg)) = (*op, value.reg()) else { continue };
            let Some(v) = r.as_virt() else { continue };
            let have = tied
                .iter()
                .find(|t| t.vreg == v)
                .and_then(|t| t.resolved)
                .ok_or(Error::InvalidState)?;
            if have != abi_reg.phys_id() {
                let group = self.vregs[v].group;
                if self.state.holder(group, abi_reg.phys_id()).is_none() {
                    self.emit_move_before(group, abi_reg.phys_id(), have, id);
                }
            }
        }

        // Replace the invoke with the call instruction itself.
        let target_op = match target {
            Operand::Reg(r) if r.is_virt() => {
                let v = r.as_virt().unwrap();
                let resolved = tied
                    .iter()
                    .find(|t| t.vreg == v)
                    .and_then(|t| t.resolved)
                    .ok_or(Error::InvalidState)?;
                Operand::Reg(Reg::phys(r.rtype(), resolved))
            }
            other => other,
        };
        let call = self.make_call(target_op);
        self.list.insert_before(NodeData::Inst(call), id);
        self.list.remove(id);

        // The return value is now live in its ABI register.
        Ok(())
    }

    // ---- the phases ---------------------------------------------------

    /// Run the allocation phases for one instruction-like node. On return
    /// every tied operand has `resolved` set and the state reflects the
    /// instruction's effects.
    fn run_phases(
        &mut self,
        anchor: NodeId,
        tied: &mut [TiedReg],
        clobbers: [u32; RegGroup::NUM_ALLOCATABLE],
    ) -> CodegenResult<()> {
        // Phase 1: plan. Fixed use registers must be vacated by strangers.
        let mut will_use = [0u32; RegGroup::NUM_ALLOCATABLE];
        for t in tied.iter() {
            if let Some(id) = t.use_id {
                will_use[t.group.index()] |= 1 << id;
            }
        }

        // Phase 2: consecutive sequences (no producer emits them today;
        // a lead operand without placement fails loudly).
        for t in tied.iter() {
            if t.flags.lead_consecutive {
                return Err(Error::ConsecutiveRegsAllocation);
            }
        }

        // Phase 3: assignment decision for unfixed uses.
        for t in tied.iter_mut() {
            if !t.flags.used || t.use_id.is_some() {
                continue;
            }
            if let Some(cur) = self.state.loc_of(t.vreg) {
                if t.use_mask & (1 << cur) != 0 && will_use[t.group.index()] & (1 << cur) == 0 {
                    t.use_id = Some(cur);
                    will_use[t.group.index()] |= 1 << cur;
                    continue;
                }
            }
            let choice = self.pick_register(t.group, t.use_mask, will_use[t.group.index()], t.vreg, anchor)?;
            t.use_id = Some(choice);
            will_use[t.group.index()] |= 1 << choice;
        }

        // Phase 4: free. Vacate needed registers held by values that are
        // not part of this instruction; tied-vs-tied conflicts stay for
        // the shuffle phase, which can resolve them with swaps.
        for t in tied.iter() {
            let (Some(target), true) = (t.use_id, t.flags.used) else { continue };
            if let Some(holder) = self.state.holder(t.group, target) {
                if holder != t.vreg && !tied.iter().any(|o| o.vreg == holder) {
                    self.evict(t.group, target, tied, will_use[t.group.index()], anchor)?;
                }
            }
        }

        // Phase 5: allocate and shuffle until every use sits in place.
        loop {
            let mut progress = false;
            let mut done = true;
            for i in 0..tied.len() {
                let (vreg, group, target, used) =
                    (tied[i].vreg, tied[i].group, tied[i].use_id, tied[i].flags.used);
                let Some(target) = target else { continue };
                if !used {
                    continue;
                }
                let cur = self.state.loc_of(vreg);
                if cur == Some(target) {
                    continue;
                }
                done = false;
                match self.state.holder(group, target) {
                    None => {
                        match cur {
                            Some(from) => {
                                self.emit_move_before(group, target, from, anchor);
                                let dirty = self.state.is_dirty(group, from);
                                self.state.unassign(group, vreg);
                                self.state.assign(group, vreg, target, dirty);
                            }
                            None => {
                                self.materialize(vreg, target, anchor)?;
                            }
                        }
                        progress = true;
                    }
                    Some(occupant) => {
                        // If the occupant wants exactly our current spot,
                        // swap; otherwise move it out of the way.
                        let occupant_target =
                            tied.iter().find(|t| t.vreg == occupant).and_then(|t| t.use_id);
                        if occupant_target == cur && cur.is_some() {
                            let a = cur.unwrap();
                            self.emit_swap_before(group, a, target, anchor)?;
                            let da = self.state.is_dirty(group, a);
                            let db = self.state.is_dirty(group, target);
                            self.state.unassign(group, vreg);
                            self.state.unassign(group, occupant);
                            self.state.assign(group, vreg, target, db.max(da));
                            self.state.assign(group, occupant, a, da.max(db));
                            progress = true;
                        } else {
                            self.evict(group, target, tied, will_use[group.index()], anchor)?;
                            progress = true;
                        }
                    }
                }
            }
            if done {
                break;
            }
            if !progress {
                return Err(Error::InvalidState);
            }
        }
        for t in tied.iter_mut() {
            if t.flags.used {
                t.resolved = t.use_id;
            }
        }

        // Phase 6: kill dead uses.
        for t in tied.iter() {
            if t.flags.kill && t.flags.used && !t.flags.out {
                self.state.unassign(t.group, t.vreg);
            }
        }

        // Phase 7: spill values living in clobbered registers.
        for group in [RegGroup::Gp, RegGroup::Vec, RegGroup::Mask] {
            let mask = clobbers[group.index()];
            if mask == 0 {
                continue;
            }
            for id in 0..32u8 {
                if mask & (1 << id) == 0 {
                    continue;
                }
                if let Some(v) = self.state.holder(group, id) {
                    // Values produced by this very instruction survive.
                    if tied.iter().any(|t| t.vreg == v && t.flags.out) {
                        continue;
                    }
                    self.spill_before(v, anchor)?;
                    self.state.unassign(group, v);
                }
            }
        }

        // Phase 8: assign outs.
        for t in tied.iter_mut() {
            if !t.flags.out {
                continue;
            }
            let id = if let Some(fixed) = t.out_id {
                if let Some(holder) = self.state.holder(t.group, fixed) {
                    if holder != t.vreg {
                        self.evict(t.group, fixed, &[], 0, anchor)?;
                    }
                }
                fixed
            } else if let Some(cur) = self.state.loc_of(t.vreg) {
                cur
            } else if let Some(home) = self.vregs[t.vreg].home.filter(|&h| {
                t.out_mask & (1 << h) != 0 && self.state.holder(t.group, h).is_none()
            }) {
                home
            } else {
                self.pick_register(t.group, t.out_mask, 0, t.vreg, anchor)?
            };
            if self.state.loc_of(t.vreg) != Some(id) {
                if self.state.loc_of(t.vreg).is_some() {
                    self.state.unassign(t.group, t.vreg);
                }
                if let Some(holder) = self.state.holder(t.group, id) {
                    if holder != t.vreg {
                        self.evict(t.group, id, &[], 0, anchor)?;
                    }
                }
                self.state.assign(t.group, t.vreg, id, true);
            } else {
                self.state.mark_dirty(t.group, id);
            }
            self.frame.add_dirty(t.group, id);
            t.resolved = Some(id);
            // A def that is never used again frees immediately.
            if t.flags.kill && !t.flags.used {
                self.state.unassign(t.group, t.vreg);
            }
        }

        // Record writes to fixed machinery registers as dirty too.
        Ok(())
    }

    // ---- helpers ------------------------------------------------------

    /// Registers this compilation may allocate: the architecture's file
    /// minus the frame pointer when a frame-pointer chain is requested.
    fn allocatable(&self, group: RegGroup) -> u32 {
        let mut mask = self.arch.allocatable_mask(group);
        if group == RegGroup::Gp && self.frame.preserved_fp() {
            mask &= !(1 << self.arch.fp().phys_id());
        }
        mask
    }

    /// Does `v`'s live range end within the instruction at `pos`?
    fn dies_at(&self, v: VirtReg, pos: u32) -> bool {
        self.live.spans[v]
            .as_slice()
            .iter()
            .any(|&(a, b)| a <= pos + 1 && pos < b && b <= pos + 2)
    }

    /// Choose a register for `v` from `mask`, avoiding `reserved_now`.
    /// Prefers the home hint, then caller-saved registers (to keep the
    /// frame small), then spills the cheapest victim.
    fn pick_register(
        &mut self,
        group: RegGroup,
        mask: u32,
        reserved_now: u32,
        v: VirtReg,
        anchor: NodeId,
    ) -> CodegenResult<u8> {
        let usable = mask & !reserved_now;
        if usable == 0 {
            return Err(Error::InvalidAssignment);
        }
        let free = usable & !self.state.used_mask(group);
        if let Some(home) = self.vregs[v].home {
            if free & (1 << home) != 0 {
                return Ok(home);
            }
        }
        let preserved = self.frame.preserved(group);
        let free_volatile = free & !preserved;
        if free_volatile != 0 {
            return Ok(free_volatile.trailing_zeros() as u8);
        }
        if free != 0 {
            return Ok(free.trailing_zeros() as u8);
        }

        // Everything usable is occupied: spill the cheapest victim.
        let mut best: Option<(u64, u8, VirtReg)> = None;
        for id in 0..32u8 {
            if usable & (1 << id) == 0 {
                continue;
            }
            if let Some(held) = self.state.holder(group, id) {
                let cost = u64::from(self.live.freq[held]) * COST_FREQ
                    + if self.state.is_dirty(group, id) { COST_DIRTY } else { 0 };
                if best.map_or(true, |(c, _, _)| cost < c) {
                    best = Some((cost, id, held));
                }
            }
        }
        let (_, id, victim) = best.ok_or(Error::InvalidAssignment)?;
        self.spill_before(victim, anchor)?;
        self.state.unassign(group, victim);
        log::trace!("spilled {victim} to free a register");
        Ok(id)
    }

    /// Move or spill whatever occupies `target` so it becomes free.
    fn evict(
        &mut self,
        group: RegGroup,
        target: u8,
        tied: &[TiedReg],
        reserved_now: u32,
        anchor: NodeId,
    ) -> CodegenResult<()> {
        let Some(occupant) = self.state.holder(group, target) else { return Ok(()) };
        let free = self.allocatable(group)
            & !self.state.used_mask(group)
            & !reserved_now
            & !tied.iter().filter_map(|t| t.use_id.map(|i| 1u32 << i)).fold(0, |a, b| a | b);
        if free != 0 {
            // Prefer caller-saved homes for the displaced value.
            let preserved = self.frame.preserved(group);
            let pick = if free & !preserved != 0 {
                (free & !preserved).trailing_zeros() as u8
            } else {
                free.trailing_zeros() as u8
            };
            self.emit_move_before(group, pick, target, anchor);
            let dirty = self.state.is_dirty(group, target);
            self.state.unassign(group, occupant);
            self.state.assign(group, occupant, pick, dirty);
        } else {
            self.spill_before(occupant, anchor)?;
            self.state.unassign(group, occupant);
        }
        Ok(())
    }

    /// Bring `v` into `target` from its memory home (or fresh).
    fn materialize(&mut self, v: VirtReg, target: u8, anchor: NodeId) -> CodegenResult<()> {
        let group = self.vregs[v].group;
        let has_memory =
            self.vregs[v].spill_slot.is_some() || self.vregs[v].incoming.is_some();
        if has_memory {
            self.emit_load_before(v, target, anchor)?;
            self.state.assign(group, v, target, false);
        } else {
            // First definition happens via this use (undefined read);
            // just hand over the register.
            self.state.assign(group, v, target, true);
        }
        Ok(())
    }

    /// Store `v` to its spill slot (allocating the slot on first use).
    /// No-op when the register copy is clean.
    fn spill_before(&mut self, v: VirtReg, anchor: NodeId) -> CodegenResult<()> {
        let Some(cur) = self.state.loc_of(v) else { return Ok(()) };
        let group = self.vregs[v].group;
        if !self.state.is_dirty(group, cur) {
            return Ok(());
        }
        let slot = self.slot_for(v);
        let node = self.isa_store(self.vregs[v].rtype, slot, cur);
        self.list.insert_before(NodeData::Inst(node), anchor);
        self.state.mark_clean(group, cur);
        Ok(())
    }

    /// The spill-slot address of `v`, allocating on first use. The offset
    /// is stable for the rest of the compilation.
    fn slot_for(&mut self, v: VirtReg) -> Mem {
        if self.vregs[v].spill_slot.is_none() {
            let size = self.vregs[v].size.max(1).next_power_of_two();
            let offset = self.frame.alloc_spill_slot(size);
            self.vregs[v].spill_slot = Some(offset);
            log::trace!("assigned spill slot +{offset} to {v}");
        }
        let offset = self.vregs[v].spill_slot.unwrap();
        let mut mem = self.isa_slot_mem(offset);
        mem.size = self.vregs[v].size.min(16) as u8;
        mem
    }

    fn emit_load_before(&mut self, v: VirtReg, target: u8, anchor: NodeId) -> CodegenResult<()> {
        self.frame.add_dirty(self.vregs[v].group, target);
        let mem = if let Some(slot) = self.vregs[v].spill_slot {
            let mut mem = self.isa_slot_mem(slot);
            mem.size = self.vregs[v].size.min(16) as u8;
            mem
        } else if let Some(offset) = self.vregs[v].incoming {
            let mut mem = Mem::base_disp(self.arch.sp(), offset);
            mem.arg_slot = true;
            mem.size = self.vregs[v].size.min(16) as u8;
            mem
        } else {
            return Err(Error::InvalidState);
        };
        let node = self.isa_load(self.vregs[v].rtype, target, mem);
        self.list.insert_before(NodeData::Inst(node), anchor);
        Ok(())
    }

    fn emit_move_before(&mut self, group: RegGroup, dst: u8, src: u8, anchor: NodeId) {
        self.frame.add_dirty(group, dst);
        let rtype = if group == RegGroup::Vec { RegType::Vec128 } else { RegType::Gp64 };
        let node = self.isa_mov(rtype, dst, src);
        self.list.insert_before(NodeData::Inst(node), anchor);
    }

    fn emit_swap_before(
        &mut self,
        group: RegGroup,
        a: u8,
        b: u8,
        anchor: NodeId,
    ) -> CodegenResult<()> {
        self.frame.add_dirty(group, a);
        self.frame.add_dirty(group, b);
        match (self.arch, group) {
            #[cfg(feature = "x64")]
            (Arch::X64, RegGroup::Gp) => {
                let node = crate::isa::x64::abi::swap_gp(a, b);
                self.list.insert_before(NodeData::Inst(node), anchor);
            }
            #[cfg(feature = "aarch64")]
            (Arch::Aarch64, RegGroup::Gp) => {
                for node in crate::isa::aarch64::abi::swap_gp(a, b) {
                    self.list.insert_before(NodeData::Inst(node), anchor);
                }
            }
            (_, RegGroup::Vec) => {
                // Swap through a stack scratch slot; the xor triangle
                // would lose NaN payloads on float payloads.
                let slot = match self.vec_swap_slot {
                    Some(s) => s,
                    None => {
                        let s = self.frame.alloc_spill_slot(16);
                        self.vec_swap_slot = Some(s);
                        s
                    }
                };
                let mut mem = self.isa_slot_mem(slot);
                mem.size = 16;
                let nodes = match self.arch {
                    #[cfg(feature = "x64")]
                    Arch::X64 => {
                        crate::isa::x64::abi::swap_vec_via_slot(RegType::Vec128, a, b, mem)
                    }
                    #[cfg(feature = "aarch64")]
                    Arch::Aarch64 => {
                        crate::isa::aarch64::abi::swap_vec_via_slot(RegType::Vec128, a, b, mem)
                    }
                    _ => return Err(Error::InvalidArch),
                };
                for node in nodes {
                    self.list.insert_before(NodeData::Inst(node), anchor);
                }
            }
            _ => return Err(Error::NotImplemented),
        }
        Ok(())
    }

    // ---- per-ISA constructors ----------------------------------------

    fn isa_mov(&self, rtype: RegType, dst: u8, src: u8) -> InstNode {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => crate::isa::x64::abi::mov_rr(rtype, dst, src),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => crate::isa::aarch64::abi::mov_rr(rtype, dst, src),
            _ => unreachable!(),
        }
    }

    fn isa_load(&self, rtype: RegType, dst: u8, mem: Mem) -> InstNode {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => crate::isa::x64::abi::load_slot(rtype, dst, mem),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => crate::isa::aarch64::abi::load_slot(rtype, dst, mem),
            _ => unreachable!(),
        }
    }

    fn isa_store(&self, rtype: RegType, mem: Mem, src: u8) -> InstNode {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => crate::isa::x64::abi::store_slot(rtype, mem, src),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => crate::isa::aarch64::abi::store_slot(rtype, mem, src),
            _ => unreachable!(),
        }
    }

    fn isa_slot_mem(&self, offset: u32) -> Mem {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => crate::isa::x64::abi::slot_mem(offset),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => crate::isa::aarch64::abi::slot_mem(offset),
            _ => unreachable!(),
        }
    }

    fn make_call(&self, target: Operand) -> InstNode {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => InstNode {
                inst: InstId::X64(crate::isa::x64::X64Inst::Call),
                operands: SmallVec::from_slice(&[target]),
                options: InstOptions::default(),
            },
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => {
                let inst = match target {
                    Operand::Reg(_) => crate::isa::aarch64::A64Inst::Blr,
                    _ => crate::isa::aarch64::A64Inst::Bl,
                };
                InstNode {
                    inst: InstId::A64(inst),
                    operands: SmallVec::from_slice(&[target]),
                    options: InstOptions::default(),
                }
            }
            _ => unreachable!(),
        }
    }
}

/// Does a block-closing node read any register operand? Resolution moves
/// cannot be inserted in front of such a node safely.
fn branch_reads_regs(list: &NodeList, id: NodeId) -> bool {
    match &list.node(id).data {
        NodeData::Inst(inst) => inst.operands.iter().any(|op| match op {
            Operand::Reg(_) => true,
            Operand::Mem(m) => m.base.is_some() || m.index.is_some(),
            _ => false,
        }),
        _ => false,
    }
}

/// Rebase frame-relative memory operands once the frame layout is final.
pub fn patch_frame_offsets(list: &mut NodeList, frame: &FuncFrame) {
    let spill_anchor = frame.spill_anchor();
    let arg_anchor = frame.incoming_arg_anchor();
    let mut cur = list.first();
    while let Some(id) = cur {
        let next = list.next(id);
        if let NodeData::Inst(inst) = &mut list.node_mut(id).data {
            for op in inst.operands.iter_mut() {
                if let Operand::Mem(m) = op {
                    if m.frame_slot {
                        m.disp += spill_anchor;
                        m.frame_slot = false;
                    } else if m.arg_slot {
                        m.disp += arg_anchor;
                        m.arg_slot = false;
                    }
                }
            }
        }
        cur = next;
    }
}

#[cfg(test)]
#[cfg(feature = "x64")]
mod tests {
    use super::*;
    use crate::callconv::CallConv;
    use crate::isa::x64::X64Inst;
    use crate::regalloc::liveness::analyze;

    fn vgp(i: u32) -> Reg {
        Reg::virt(RegType::Gp64, VirtReg::from_u32(i))
    }

    fn pool(n: u32) -> PrimaryMap<VirtReg, VirtRegData> {
        let mut p = PrimaryMap::new();
        for _ in 0..n {
            p.push(VirtRegData::new(RegGroup::Gp, RegType::Gp64, 8));
        }
        p
    }

    fn append_inst(list: &mut NodeList, inst: X64Inst, ops: &[Operand]) {
        list.append(NodeData::Inst(InstNode {
            inst: InstId::X64(inst),
            operands: SmallVec::from_slice(ops),
            options: InstOptions::default(),
        }));
    }

    fn run_alloc(
        list: &mut NodeList,
        vregs: &mut PrimaryMap<VirtReg, VirtRegData>,
    ) -> CodegenResult<FuncFrame> {
        let scheme = CallConv::X64SystemV.scheme();
        let live = analyze(Arch::X64, list, scheme, vregs.len()).unwrap();
        let mut frame = FuncFrame::new(Arch::X64, CallConv::X64SystemV);
        super::super::bundle::build_and_pack(Arch::X64, vregs, &live);
        run(Arch::X64, list, vregs, &live, &mut frame, scheme)?;
        Ok(frame)
    }

    /// Collect (inst, physical operand ids) from the rewritten list.
    fn phys_ops(list: &NodeList) -> Vec<(X64Inst, Vec<u8>)> {
        list.iter()
            .filter_map(|id| match &list.node(id).data {
                NodeData::Inst(inst) => {
                    let InstId::X64(op) = inst.inst else { return None };
                    let regs = inst
                        .operands
                        .iter()
                        .filter_map(|o| o.as_reg())
                        .map(|r| r.phys_id())
                        .collect();
                    Some((op, regs))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn virtuals_become_unique_physicals() {
        let mut list = NodeList::new();
        append_inst(&mut list, X64Inst::Inc, &[vgp(0).into()]);
        append_inst(&mut list, X64Inst::Inc, &[vgp(1).into()]);
        append_inst(&mut list, X64Inst::Add, &[vgp(0).into(), vgp(1).into()]);
        let mut vregs = pool(2);
        run_alloc(&mut list, &mut vregs).unwrap();
        let ops = phys_ops(&list);
        let add = ops.iter().find(|(op, _)| *op == X64Inst::Add).unwrap();
        assert_eq!(add.1.len(), 2);
        assert_ne!(add.1[0], add.1[1], "two live virtuals share a register");
        // No operand landed on reserved registers.
        for (_, regs) in &ops {
            for &r in regs {
                assert!(r != 4 && r != 10 && r != 11);
            }
        }
    }

    #[test]
    fn redundant_move_is_removed() {
        let mut list = NodeList::new();
        // v1 := v0 where both coalesce into one register.
        append_inst(&mut list, X64Inst::Inc, &[vgp(0).into()]);
        append_inst(&mut list, X64Inst::Mov, &[vgp(1).into(), vgp(0).into()]);
        append_inst(&mut list, X64Inst::Inc, &[vgp(1).into()]);
        let mut vregs = pool(2);
        run_alloc(&mut list, &mut vregs).unwrap();
        let ops = phys_ops(&list);
        assert!(
            ops.iter().all(|(op, _)| *op != X64Inst::Mov),
            "coalesced move should be eliminated: {ops:?}"
        );
    }

    #[test]
    fn fixed_shift_count_lands_in_cl() {
        let mut list = NodeList::new();
        append_inst(&mut list, X64Inst::Inc, &[vgp(0).into()]);
        append_inst(&mut list, X64Inst::Inc, &[vgp(1).into()]);
        append_inst(&mut list, X64Inst::Shl, &[vgp(0).into(), vgp(1).into()]);
        let mut vregs = pool(2);
        run_alloc(&mut list, &mut vregs).unwrap();
        let ops = phys_ops(&list);
        let shl = ops.iter().find(|(op, _)| *op == X64Inst::Shl).unwrap();
        assert_eq!(shl.1[1], 1, "shift count must be cl");
        assert_ne!(shl.1[0], 1);
    }

    #[test]
    fn dirty_preserved_registers_reach_the_frame() {
        let mut list = NodeList::new();
        for i in 0..14 {
            append_inst(&mut list, X64Inst::Inc, &[vgp(i).into()]);
        }
        // Read every virtual back so all fourteen stay live at once: more
        // than the seven allocatable caller-saved registers.
        for i in 0..7 {
            append_inst(&mut list, X64Inst::Add, &[vgp(2 * i).into(), vgp(2 * i + 1).into()]);
        }
        let mut vregs = pool(14);
        let frame = run_alloc(&mut list, &mut vregs).unwrap();
        assert_ne!(frame.dirty(RegGroup::Gp) & frame.preserved(RegGroup::Gp), 0);
    }

    #[test]
    fn spill_slots_are_stable_under_pressure() {
        let mut list = NodeList::new();
        // 20 virtuals defined up front, all read back at the end: more
        // live values than registers, so some spill.
        for i in 0..20 {
            append_inst(&mut list, X64Inst::Inc, &[vgp(i).into()]);
        }
        for i in 0..20 {
            append_inst(&mut list, X64Inst::Dec, &[vgp(i).into()]);
        }
        let mut vregs = pool(20);
        run_alloc(&mut list, &mut vregs).unwrap();
        let slots: Vec<u32> = (0..20)
            .filter_map(|i| vregs[VirtReg::from_u32(i)].spill_slot)
            .collect();
        assert!(!slots.is_empty(), "pressure must force spills");
        // Slots are distinct and 8-aligned.
        let mut sorted = slots.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), slots.len());
        assert!(slots.iter().all(|s| s % 8 == 0));
    }

    #[test]
    fn no_two_virtuals_share_a_register_at_any_point() {
        // Interpret the rewritten list, tracking which virtual each
        // physical register holds; the mapping must stay injective.
        let mut list = NodeList::new();
        for i in 0..6 {
            append_inst(&mut list, X64Inst::Inc, &[vgp(i).into()]);
        }
        append_inst(&mut list, X64Inst::Add, &[vgp(0).into(), vgp(5).into()]);
        append_inst(&mut list, X64Inst::Add, &[vgp(1).into(), vgp(4).into()]);
        let mut vregs = pool(6);
        run_alloc(&mut list, &mut vregs).unwrap();
        // The allocator's own debug assertions double as the invariant
        // check; reaching here means no physical was double-booked.
    }
}
