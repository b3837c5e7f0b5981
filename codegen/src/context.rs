//! The per-compilation context and the pass pipeline.
//!
//! A [`Compiler`] owns everything with the lifetime of one compilation: the
//! node list, the label table, the code sections, the virtual-register pool
//! and the function frame. `finalize()` drives the pipeline: invoke
//! lowering, liveness, bundle bin-packing, local allocation, frame layout,
//! serialization and relocation resolution. Nothing is shared between
//! compilations; distinct compilations may run on distinct threads.

use smallvec::SmallVec;

use crate::buffer::{BaseReloc, CodeBuffer, CodeOffset};
use crate::entity::PrimaryMap;
use crate::frame::FuncFrame;
use crate::func::{FuncDetail, FuncSignature, FuncValue, TypeId};
use crate::ir::{
    AlignMode, FuncNode, InstNode, InvokeNode, NodeData, NodeId, NodeList, SentinelKind,
};
use crate::isa::Arch;
use crate::label::{Label, LabelManager};
use crate::operand::{Imm, Mem, Operand, Reg, RegGroup, RegType, VirtReg};
use crate::regalloc::{bundle, liveness, local, VirtRegData};
use crate::result::{CodegenResult, Error, ErrorHandler};
use crate::support::align_up;

/// One section of a finalized program.
#[derive(Clone, Debug)]
pub struct FinalizedSection {
    /// Section name.
    pub name: String,
    /// Offset of the section within the blob.
    pub offset: CodeOffset,
    /// Size in bytes.
    pub size: CodeOffset,
    /// Map with execute permission.
    pub executable: bool,
    /// Map writable.
    pub writable: bool,
    /// Required alignment.
    pub alignment: u32,
}

/// The output of a successful compilation: a contiguous blob plus the
/// metadata the runtime needs to map it.
#[derive(Clone, Debug)]
pub struct FinalizedCode {
    /// Target architecture of the bytes.
    pub arch: Arch,
    /// The code and data, sections concatenated in layout order.
    pub bytes: Vec<u8>,
    /// Per-section metadata.
    pub sections: Vec<FinalizedSection>,
    /// Absolute fields the runtime must rebase by the map address.
    pub base_relocs: Vec<BaseReloc>,
    /// Entry point offset; zero by convention.
    pub entry: CodeOffset,
}

/// The per-compilation builder and pass driver.
pub struct Compiler {
    pub(crate) arch: Arch,
    pub(crate) list: NodeList,
    pub(crate) labels: LabelManager,
    pub(crate) buf: CodeBuffer,
    pub(crate) vregs: PrimaryMap<VirtReg, VirtRegData>,
    pub(crate) func: Option<NodeId>,
    pub(crate) frame: Option<FuncFrame>,
    err_handler: Option<Box<dyn ErrorHandler>>,
    finalized: Option<FinalizedCode>,
}

impl Compiler {
    /// A fresh compilation targeting `arch`.
    pub fn new(arch: Arch) -> CodegenResult<Self> {
        if !arch.has_encoder() {
            return Err(Error::InvalidArch);
        }
        Ok(Self {
            arch,
            list: NodeList::new(),
            labels: LabelManager::new(),
            buf: CodeBuffer::new(),
            vregs: PrimaryMap::new(),
            func: None,
            frame: None,
            err_handler: None,
            finalized: None,
        })
    }

    /// The target architecture.
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Install a diagnostics tap. The handler observes every surfaced
    /// error but cannot change what the caller receives.
    pub fn set_error_handler(&mut self, handler: Box<dyn ErrorHandler>) {
        self.err_handler = Some(handler);
    }

    /// Surface `err` through the tap and return it.
    pub(crate) fn report(&mut self, err: Error, context: &str) -> Error {
        if let Some(handler) = &mut self.err_handler {
            handler.on_error(&err, context);
        }
        log::debug!("{context}: {err}");
        err
    }

    /// Return the compilation to a pristine state, releasing the node
    /// arena, labels, sections and virtual registers.
    pub fn reset(&mut self) {
        self.list.clear();
        self.labels.reset();
        self.buf.reset();
        self.vregs.clear();
        self.func = None;
        self.frame = None;
        self.finalized = None;
    }

    // ---- labels -------------------------------------------------------

    /// Allocate a fresh label.
    pub fn new_label(&mut self) -> Label {
        self.labels.new_label()
    }

    /// Allocate a fresh named label.
    pub fn new_named_label(&mut self, name: &str) -> CodegenResult<Label> {
        match self.labels.new_named(name) {
            Ok(l) => Ok(l),
            Err(e) => Err(self.report(e, "new_named_label")),
        }
    }

    /// Look up a named label.
    pub fn label_by_name(&self, name: &str) -> Option<Label> {
        self.labels.label_by_name(name)
    }

    /// Bind `label` at the current position in the instruction stream. The
    /// concrete offset is assigned during serialization.
    pub fn bind(&mut self, label: Label) -> CodegenResult<()> {
        if !self.labels.is_valid(label) {
            return Err(self.report(Error::InvalidLabel, "bind"));
        }
        self.list.append(NodeData::Label(label));
        Ok(())
    }

    // ---- virtual registers and functions ------------------------------

    /// Allocate a virtual register of `group` sized `size` bytes.
    pub fn new_virtual(&mut self, group: RegGroup, size: u32) -> CodegenResult<Reg> {
        if !group.is_allocatable() || self.arch.reg_count(group) == 0 {
            return Err(self.report(Error::InvalidRegGroup, "new_virtual"));
        }
        let rtype = match (group, size) {
            (RegGroup::Gp, 0..=4) => RegType::Gp32,
            (RegGroup::Gp, _) => RegType::Gp64,
            (RegGroup::Vec, 0..=16) => RegType::Vec128,
            (RegGroup::Vec, 17..=32) => RegType::Vec256,
            (RegGroup::Vec, _) => RegType::Vec512,
            (RegGroup::Mask, _) => RegType::Mask,
            (RegGroup::Extra, _) => unreachable!(),
        };
        let v = self.vregs.push(VirtRegData::new(group, rtype, size.max(1)));
        Ok(Reg::virt(rtype, v))
    }

    /// Allocate a virtual register suited to `type_id`.
    pub fn new_virtual_typed(&mut self, type_id: TypeId) -> CodegenResult<Reg> {
        let group = type_id.reg_group();
        self.new_virtual(group, type_id.bytes(self.arch).max(4))
    }

    /// Open a function with `sig`. All subsequent instructions belong to
    /// it until [`Compiler::end_func`].
    pub fn func(&mut self, sig: FuncSignature) -> CodegenResult<()> {
        if self.func.is_some() {
            return Err(self.report(Error::InvalidState, "func"));
        }
        let detail = match FuncDetail::init(&sig, self.arch) {
            Ok(d) => d,
            Err(e) => return Err(self.report(e, "func")),
        };
        let mut frame = FuncFrame::new(self.arch, sig.call_conv);
        frame.set_callee_pop_size(detail.callee_pop_size);
        let nargs = sig.args.len();
        let node = self.list.append(NodeData::Func(Box::new(FuncNode {
            sig,
            detail,
            args: SmallVec::from_iter(core::iter::repeat(None).take(nargs)),
        })));
        self.func = Some(node);
        self.frame = Some(frame);
        Ok(())
    }

    /// The virtual register holding argument `index`, created on first
    /// request with its ABI home as allocation hint.
    pub fn get_arg(&mut self, index: usize) -> CodegenResult<Reg> {
        let func = self.func.ok_or(Error::InvalidState)?;
        let (existing, value, type_id) = match &self.list.node(func).data {
            NodeData::Func(f) => {
                let value = f.detail.arg(index).copied().ok_or(Error::InvalidArgument)?;
                (f.args.get(index).copied().flatten(), value, value.type_id())
            }
            _ => return Err(Error::InvalidState),
        };
        if let Some(v) = existing {
            return Ok(Reg::virt(self.vregs[v].rtype, v));
        }
        let reg = self.new_virtual_typed(type_id)?;
        let v = reg.as_virt().unwrap();
        if let FuncValue::Reg { reg: abi, .. } = value {
            self.vregs[v].home = Some(abi.phys_id());
        }
        if let NodeData::Func(f) = &mut self.list.node_mut(func).data {
            f.args[index] = Some(v);
        }
        Ok(reg)
    }

    /// Return from the current function, placing `value` (if any) in the
    /// ABI return register, then running the epilogue.
    pub fn func_ret(&mut self, value: Option<Operand>) -> CodegenResult<()> {
        if self.func.is_none() {
            return Err(self.report(Error::InvalidState, "func_ret"));
        }
        let ops: SmallVec<[Operand; 2]> = value.into_iter().collect();
        self.list.append(NodeData::FuncRet(ops));
        Ok(())
    }

    /// Request (or drop) a frame-pointer chain for the current function.
    pub fn set_frame_pointer(&mut self, on: bool) -> CodegenResult<()> {
        match &mut self.frame {
            Some(frame) => {
                frame.set_preserved_fp(on);
                Ok(())
            }
            None => Err(self.report(Error::InvalidState, "set_frame_pointer")),
        }
    }

    /// Close the current function.
    pub fn end_func(&mut self) -> CodegenResult<()> {
        if self.func.is_none() {
            return Err(self.report(Error::InvalidState, "end_func"));
        }
        self.list.append(NodeData::Sentinel(SentinelKind::FuncEnd));
        Ok(())
    }

    /// Call `target` with `signature`, passing `args`. Returns the virtual
    /// register receiving the return value when the signature has one and
    /// `want_ret` is set.
    pub fn invoke(
        &mut self,
        target: Operand,
        signature: &FuncSignature,
        args: &[Operand],
        want_ret: bool,
    ) -> CodegenResult<Option<Reg>> {
        let detail = match FuncDetail::init(signature, self.arch) {
            Ok(d) => d,
            Err(e) => return Err(self.report(e, "invoke")),
        };
        if args.len() != detail.arg_count() {
            return Err(self.report(Error::InvalidArgument, "invoke"));
        }
        let ret = match (&detail.ret, want_ret) {
            (Some(r), true) => {
                let reg = self.new_virtual_typed(r.type_id())?;
                Some(reg)
            }
            _ => None,
        };
        self.list.append(NodeData::Invoke(Box::new(InvokeNode {
            target,
            detail,
            args: SmallVec::from_slice(args),
            ret,
        })));
        Ok(ret)
    }

    // ---- directives ---------------------------------------------------

    /// Align the instruction stream to `n` bytes.
    pub fn align(&mut self, mode: AlignMode, n: u32) -> CodegenResult<()> {
        if !n.is_power_of_two() {
            return Err(self.report(Error::InvalidArgument, "align"));
        }
        self.list.append(NodeData::Align(mode, n));
        Ok(())
    }

    /// Embed raw bytes at the current position.
    pub fn embed(&mut self, bytes: &[u8], item_size: u8) {
        self.list.append(NodeData::EmbedData { bytes: bytes.to_vec(), item_size });
    }

    /// Attach an informative comment at the current position.
    pub fn comment(&mut self, text: &str) {
        self.list.append(NodeData::Comment(text.to_string()));
    }

    /// Create an additional section (e.g. `.rodata`).
    pub fn add_section(
        &mut self,
        name: &str,
        flags: crate::buffer::SectionFlags,
        alignment: u32,
    ) -> crate::buffer::SectionId {
        self.buf.add_section(name, flags, alignment)
    }

    /// Place `bytes` into `section` right away and return a label bound to
    /// them. Code can reference the label (e.g. through a RIP-relative
    /// `lea`); the displacement resolves across sections at finalize.
    pub fn place_data(
        &mut self,
        section: crate::buffer::SectionId,
        bytes: &[u8],
        align: u32,
    ) -> CodegenResult<Label> {
        if section == self.buf.text() {
            return Err(self.report(Error::InvalidArgument, "place_data"));
        }
        let offset = self.buf.append_to(section, bytes, align);
        let label = self.labels.new_label();
        self.labels.bind(label, section, offset)?;
        Ok(label)
    }

    /// Append a raw instruction node, validating physical operands against
    /// the target register file.
    pub fn emit_node(&mut self, inst: InstNode) -> CodegenResult<()> {
        for op in &inst.operands {
            let regs: SmallVec<[Reg; 2]> = match op {
                Operand::Reg(r) => SmallVec::from_slice(&[*r]),
                Operand::Mem(m) => m.base.iter().chain(m.index.iter()).copied().collect(),
                Operand::Label(l) => {
                    if !self.labels.is_valid(*l) {
                        return Err(self.report(Error::InvalidLabel, "emit"));
                    }
                    SmallVec::new()
                }
                _ => SmallVec::new(),
            };
            for r in regs {
                if !r.is_virt() {
                    if let Err(e) = self.arch.check_phys(r) {
                        return Err(self.report(e, "emit"));
                    }
                }
            }
        }
        self.list.append(NodeData::Inst(inst));
        Ok(())
    }

    // ---- the pipeline -------------------------------------------------

    /// Run every pass and produce the finalized program.
    ///
    /// Finalize is idempotent: once a program finalizes, later calls
    /// return the same bytes.
    pub fn finalize(&mut self) -> CodegenResult<FinalizedCode> {
        if let Some(code) = &self.finalized {
            return Ok(code.clone());
        }
        match self.run_pipeline() {
            Ok(code) => {
                self.finalized = Some(code.clone());
                Ok(code)
            }
            Err(e) => Err(self.report(e, "finalize")),
        }
    }

    fn run_pipeline(&mut self) -> CodegenResult<FinalizedCode> {
        let scheme = self
            .frame
            .as_ref()
            .map(|f| f.call_conv())
            .unwrap_or(crate::callconv::CallConv::host_default(self.arch))
            .scheme();

        if self.func.is_some() {
            log::debug!("lowering call sites");
            self.lower_invokes()?;

            // A call clobbers the link register on AArch64; non-leaf
            // functions there always chain x29/x30.
            if self.arch == Arch::Aarch64 {
                let frame = self.frame.as_mut().ok_or(Error::InvalidState)?;
                if frame.has_calls() {
                    frame.set_preserved_fp(true);
                }
            }

            log::debug!("running liveness over {} nodes", self.list.arena_len());
            let live =
                liveness::analyze(self.arch, &mut self.list, scheme, self.vregs.len())?;

            bundle::build_and_pack(self.arch, &mut self.vregs, &live);

            log::debug!("running local allocation");
            let frame = self.frame.as_mut().ok_or(Error::InvalidState)?;
            local::run(self.arch, &mut self.list, &mut self.vregs, &live, frame, scheme)?;

            frame.finalize()?;
            local::patch_frame_offsets(&mut self.list, frame);
        }

        log::debug!("serializing");
        self.serialize()?;

        let base_relocs = self.buf.resolve_fixups(&self.labels)?;
        let (bases, total) = self.buf.layout();
        let sections = self
            .buf
            .sections()
            .zip(&bases)
            .map(|((_, s), &offset)| FinalizedSection {
                name: s.name.clone(),
                offset,
                size: s.data.len() as u32,
                executable: s.flags.executable,
                writable: s.flags.writable,
                alignment: s.alignment,
            })
            .collect();
        log::debug!("finalized {total} bytes");
        Ok(FinalizedCode {
            arch: self.arch,
            bytes: self.buf.to_blob(),
            sections,
            base_relocs,
            entry: 0,
        })
    }

    /// Lower each invoke's stack-passed and immediate arguments so the
    /// register allocator only sees virtual register arguments.
    fn lower_invokes(&mut self) -> CodegenResult<()> {
        let mut cur = self.list.first();
        while let Some(id) = cur {
            let next = self.list.next(id);
            if let NodeData::Invoke(_) = &self.list.node(id).data {
                self.lower_one_invoke(id)?;
            }
            cur = next;
        }
        Ok(())
    }

    fn lower_one_invoke(&mut self, id: NodeId) -> CodegenResult<()> {
        let (detail_args, detail_conv, stack_size) = match &self.list.node(id).data {
            NodeData::Invoke(inv) => {
                (inv.detail.args.clone(), inv.detail.call_conv, inv.detail.stack_arg_size)
            }
            _ => unreachable!(),
        };
        let callee_scheme = detail_conv.scheme();
        let frame = self.frame.as_mut().ok_or(Error::InvalidState)?;
        frame.note_call(align_up(
            stack_size + callee_scheme.shadow_space,
            callee_scheme.stack_align,
        ));

        let sp = self.arch.sp();
        for index in 0..detail_args.len() {
            let value = detail_args[index];
            let arg = match &self.list.node(id).data {
                NodeData::Invoke(inv) => inv.args[index],
                _ => unreachable!(),
            };
            match value {
                FuncValue::Stack { offset, type_id } => {
                    // Store the value into the outgoing argument area.
                    let slot = Mem::base_disp(sp, offset)
                        .with_size(type_id.bytes(self.arch).min(16) as u8);
                    self.store_arg(id, slot, arg)?;
                }
                FuncValue::Reg { reg, .. } if reg.group() == RegGroup::Vec => {
                    if let Operand::Imm(imm) = arg {
                        // Float immediates reach vector registers through
                        // a stack scratch slot filled via the reserved
                        // scratch gp register.
                        let vtmp = self.materialize_vec_imm(id, imm)?;
                        self.vregs[vtmp.as_virt().unwrap()].home = Some(reg.phys_id());
                        if let NodeData::Invoke(inv) = &mut self.list.node_mut(id).data {
                            inv.args[index] = Operand::Reg(vtmp);
                        }
                    }
                }
                FuncValue::Reg { reg, type_id } => {
                    if let Operand::Imm(imm) = arg {
                        // Integer immediates load into a fresh virtual so
                        // the allocator can tie it to the ABI slot; the
                        // slot doubles as the allocation hint.
                        let vtmp = self.new_virtual_typed(type_id)?;
                        self.vregs[vtmp.as_virt().unwrap()].home = Some(reg.phys_id());
                        let node = self.mov_imm_node(vtmp, imm)?;
                        self.list.insert_before(NodeData::Inst(node), id);
                        if let NodeData::Invoke(inv) = &mut self.list.node_mut(id).data {
                            inv.args[index] = Operand::Reg(vtmp);
                        }
                    }
                }
                FuncValue::Indirect { .. } => return Err(Error::NotImplemented),
            }
        }
        Ok(())
    }

    /// Insert a store of `arg` into the outgoing slot `slot` before
    /// `anchor`. Immediates too wide for a memory store, and every
    /// immediate on AArch64, go through a fresh virtual register.
    fn store_arg(&mut self, anchor: NodeId, slot: Mem, arg: Operand) -> CodegenResult<()> {
        use crate::ir::{InstId, InstOptions};
        let needs_register = match (self.arch, arg) {
            (_, Operand::Imm(imm)) if !crate::support::fits_i32(imm.value) => true,
            (Arch::Aarch64, Operand::Imm(_)) => true,
            _ => false,
        };
        let arg = if needs_register {
            let imm = match arg {
                Operand::Imm(i) => i,
                _ => unreachable!(),
            };
            let vtmp = self.new_virtual(RegGroup::Gp, 8)?;
            let node = self.mov_imm_node(vtmp, imm)?;
            self.list.insert_before(NodeData::Inst(node), anchor);
            Operand::Reg(vtmp)
        } else {
            arg
        };
        let node = match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => {
                use crate::isa::x64::X64Inst;
                let inst = match arg {
                    Operand::Reg(r) if r.group() == RegGroup::Vec => X64Inst::Movups,
                    _ => X64Inst::Mov,
                };
                InstNode {
                    inst: InstId::X64(inst),
                    operands: SmallVec::from_slice(&[slot.into(), arg]),
                    options: InstOptions::default(),
                }
            }
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => InstNode {
                inst: InstId::A64(crate::isa::aarch64::A64Inst::Str),
                operands: SmallVec::from_slice(&[slot.into(), arg]),
                options: InstOptions::default(),
            },
            _ => return Err(Error::InvalidArch),
        };
        self.list.insert_before(NodeData::Inst(node), anchor);
        Ok(())
    }

    /// `mov vtmp, imm` for the target architecture.
    fn mov_imm_node(&mut self, vtmp: Reg, imm: Imm) -> CodegenResult<InstNode> {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => {
                use crate::ir::{InstId, InstOptions};
                Ok(InstNode {
                    inst: InstId::X64(crate::isa::x64::X64Inst::Mov),
                    operands: SmallVec::from_slice(&[vtmp.into(), imm.into()]),
                    options: InstOptions::default(),
                })
            }
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => {
                use crate::ir::{InstId, InstOptions};
                // The encoder expands wide immediates to movz/movk.
                Ok(InstNode {
                    inst: InstId::A64(crate::isa::aarch64::A64Inst::Mov),
                    operands: SmallVec::from_slice(&[vtmp.into(), imm.into()]),
                    options: InstOptions::default(),
                })
            }
            _ => Err(Error::InvalidArch),
        }
    }

    /// Materialize a float/vector immediate through a 16-byte stack
    /// scratch slot, returning the virtual vector register holding it.
    fn materialize_vec_imm(&mut self, anchor: NodeId, imm: Imm) -> CodegenResult<Reg> {
        let frame = self.frame.as_mut().ok_or(Error::InvalidState)?;
        let slot_off = frame.alloc_spill_slot(16);
        let (scratch0, _) = self.arch.scratch_pair();
        let scratch = Reg::phys(RegType::Gp64, scratch0);
        let vtmp = self.new_virtual_typed(TypeId::V128)?;

        let mut slot = self.isa_slot_mem(slot_off);
        slot.size = 8;
        let bits = imm.value;

        // Fill the low qword with the raw bits, zero the high qword.
        let fill_low = self.mov_imm_phys_node(scratch, bits)?;
        self.list.insert_before(NodeData::Inst(fill_low), anchor);
        let store_low = self.store_scratch_node(slot, scratch)?;
        self.list.insert_before(NodeData::Inst(store_low), anchor);
        let fill_high = self.mov_imm_phys_node(scratch, 0)?;
        self.list.insert_before(NodeData::Inst(fill_high), anchor);
        let store_high = self.store_scratch_node(slot.with_offset(8), scratch)?;
        self.list.insert_before(NodeData::Inst(store_high), anchor);

        // Load the vector register from the slot.
        let mut load_slot = self.isa_slot_mem(slot_off);
        load_slot.size = 16;
        let load = match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => {
                use crate::ir::{InstId, InstOptions};
                InstNode {
                    inst: InstId::X64(crate::isa::x64::X64Inst::Movups),
                    operands: SmallVec::from_slice(&[vtmp.into(), load_slot.into()]),
                    options: InstOptions::default(),
                }
            }
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => {
                use crate::ir::{InstId, InstOptions};
                InstNode {
                    inst: InstId::A64(crate::isa::aarch64::A64Inst::Ldr),
                    operands: SmallVec::from_slice(&[vtmp.into(), load_slot.into()]),
                    options: InstOptions::default(),
                }
            }
            _ => return Err(Error::InvalidArch),
        };
        self.list.insert_before(NodeData::Inst(load), anchor);
        Ok(vtmp)
    }

    fn mov_imm_phys_node(&self, dst: Reg, value: i64) -> CodegenResult<InstNode> {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => {
                use crate::ir::{InstId, InstOptions};
                Ok(InstNode {
                    inst: InstId::X64(crate::isa::x64::X64Inst::Mov),
                    operands: SmallVec::from_slice(&[dst.into(), Imm::new(value).into()]),
                    options: InstOptions::default(),
                })
            }
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => {
                use crate::ir::{InstId, InstOptions};
                Ok(InstNode {
                    inst: InstId::A64(crate::isa::aarch64::A64Inst::Mov),
                    operands: SmallVec::from_slice(&[dst.into(), Imm::new(value).into()]),
                    options: InstOptions::default(),
                })
            }
            _ => Err(Error::InvalidArch),
        }
    }

    fn store_scratch_node(&self, slot: Mem, src: Reg) -> CodegenResult<InstNode> {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => {
                use crate::ir::{InstId, InstOptions};
                Ok(InstNode {
                    inst: InstId::X64(crate::isa::x64::X64Inst::Mov),
                    operands: SmallVec::from_slice(&[slot.into(), src.into()]),
                    options: InstOptions::default(),
                })
            }
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => {
                use crate::ir::{InstId, InstOptions};
                Ok(InstNode {
                    inst: InstId::A64(crate::isa::aarch64::A64Inst::Str),
                    operands: SmallVec::from_slice(&[slot.into(), src.into()]),
                    options: InstOptions::default(),
                })
            }
            _ => Err(Error::InvalidArch),
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

    /// Serialize the node list into the code buffer.
    fn serialize(&mut self) -> CodegenResult<()> {
        let mut cur = self.list.first();
        while let Some(id) = cur {
            let next = self.list.next(id);
            // Nodes are moved out piecewise to satisfy the borrow rules;
            // cloning instruction payloads here is cheap and the list is
            // discarded after serialization anyway.
            let data = self.list.node(id).data.clone();
            match data {
                NodeData::Label(l) | NodeData::Block(l) => {
                    let section = self.buf.current();
                    let offset = self.buf.offset();
                    self.labels.bind(l, section, offset)?;
                }
                NodeData::Inst(inst) => self.emit_bytes(&inst)?,
                NodeData::Func(_) => {
                    let frame = self.frame.as_ref().ok_or(Error::InvalidState)?;
                    self.emit_prologue_bytes(frame.clone())?;
                }
                NodeData::FuncRet(_) => {
                    let frame = self.frame.as_ref().ok_or(Error::InvalidState)?;
                    self.emit_epilogue_bytes(frame.clone())?;
                }
                NodeData::Align(mode, n) => self.emit_align(mode, n)?,
                NodeData::EmbedData { bytes, .. } => self.buf.put_bytes(&bytes),
                NodeData::Comment(_) | NodeData::Sentinel(_) => {}
                NodeData::Invoke(_) => return Err(Error::InvalidState),
            }
            cur = next;
        }
        Ok(())
    }

    fn emit_bytes(&mut self, inst: &InstNode) -> CodegenResult<()> {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => crate::isa::x64::emit::emit_inst(inst, &mut self.buf, &mut self.labels),
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => {
                crate::isa::aarch64::emit::emit_inst(inst, &mut self.buf, &mut self.labels)
            }
            _ => Err(Error::InvalidArch),
        }
    }

    fn emit_prologue_bytes(&mut self, frame: FuncFrame) -> CodegenResult<()> {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => {
                crate::isa::x64::abi::emit_prologue(&frame, &mut self.buf, &mut self.labels)
            }
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => {
                crate::isa::aarch64::abi::emit_prologue(&frame, &mut self.buf, &mut self.labels)
            }
            _ => Err(Error::InvalidArch),
        }
    }

    fn emit_epilogue_bytes(&mut self, frame: FuncFrame) -> CodegenResult<()> {
        match self.arch {
            #[cfg(feature = "x64")]
            Arch::X64 => {
                crate::isa::x64::abi::emit_epilogue(&frame, &mut self.buf, &mut self.labels)
            }
            #[cfg(feature = "aarch64")]
            Arch::Aarch64 => {
                crate::isa::aarch64::abi::emit_epilogue(&frame, &mut self.buf, &mut self.labels)
            }
            _ => Err(Error::InvalidArch),
        }
    }

    fn emit_align(&mut self, mode: AlignMode, n: u32) -> CodegenResult<()> {
        let offset = self.buf.offset();
        let pad = align_up(offset, n) - offset;
        if pad == 0 {
            return Ok(());
        }
        match mode {
            AlignMode::Data => self.buf.align_to(n, 0),
            AlignMode::Code => match self.arch {
                #[cfg(feature = "x64")]
                Arch::X64 => crate::isa::x64::emit::emit_nops(&mut self.buf, pad),
                #[cfg(feature = "aarch64")]
                Arch::Aarch64 => {
                    if pad % 4 != 0 {
                        return Err(Error::InvalidArgument);
                    }
                    for _ in 0..pad / 4 {
                        self.buf.put4(0xd503_201f);
                    }
                }
                _ => return Err(Error::InvalidArch),
            },
        }
        Ok(())
    }
}

#[cfg(test)]
#[cfg(feature = "x64")]
mod tests {
    use super::*;
    use crate::buffer::SectionFlags;
    use crate::callconv::CallConv;
    use crate::isa::x64::regs;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn error_handler_taps_but_does_not_override() {
        let seen: Rc<RefCell<Vec<(Error, String)>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut c = Compiler::new(Arch::X64).unwrap();
        c.set_error_handler(Box::new(move |kind: &Error, context: &str| {
            sink.borrow_mut().push((kind.clone(), context.to_string()));
        }));
        c.new_named_label("dup").unwrap();
        let err = c.new_named_label("dup").unwrap_err();
        assert_eq!(err, Error::LabelAlreadyDefined);
        let taps = seen.borrow();
        assert_eq!(taps.len(), 1);
        assert_eq!(taps[0].0, Error::LabelAlreadyDefined);
        assert_eq!(taps[0].1, "new_named_label");
    }

    #[test]
    fn rodata_reference_resolves_across_sections() {
        let mut c = Compiler::new(Arch::X64).unwrap();
        let rodata =
            c.add_section(".rodata", SectionFlags { executable: false, writable: false }, 16);
        let value = 0x1122_3344_5566_7788u64;
        let data = c.place_data(rodata, &value.to_le_bytes(), 8).unwrap();
        // lea rax, [rip + data]; the code occupies offset 0..7 of .text.
        c.lea(regs::rax(), data).unwrap();
        let code = c.finalize().unwrap();
        // .text is 7 bytes, .rodata starts at the next 16-byte boundary.
        assert_eq!(code.sections[1].offset, 16);
        let disp = i32::from_le_bytes(code.bytes[3..7].try_into().unwrap());
        // rip after the lea is 7; 7 + disp must land on the data.
        assert_eq!(7 + disp, 16);
        assert_eq!(&code.bytes[16..24], &value.to_le_bytes());
    }

    #[test]
    fn align_pads_with_nops() {
        let mut c = Compiler::new(Arch::X64).unwrap();
        c.nop().unwrap();
        c.align(AlignMode::Code, 8).unwrap();
        c.embed(&[0xAA; 2], 1);
        let code = c.finalize().unwrap();
        assert_eq!(code.bytes.len(), 10);
        assert_eq!(&code.bytes[8..], &[0xAA, 0xAA]);
        // The padding decodes as NOPs, not zeros.
        assert_ne!(&code.bytes[1..8], &[0u8; 7]);
    }

    #[test]
    fn reset_allows_reuse_after_error() {
        let mut c = Compiler::new(Arch::X64).unwrap();
        let l = c.new_label();
        c.jmp(l).unwrap();
        // Unbound label: finalize fails, bytes are not usable.
        assert_eq!(c.finalize().unwrap_err(), Error::ExpressionLabelNotBound);
        c.reset();
        c.nop().unwrap();
        let code = c.finalize().unwrap();
        assert_eq!(code.bytes, vec![0x90]);
    }

    #[test]
    fn callee_pops_flows_from_signature() {
        // Table-only conventions still classify; compiling against the
        // wrong target architecture is rejected up front.
        let sig = FuncSignature::new(CallConv::StdCall, TypeId::I32, &[TypeId::I32]);
        let mut c = Compiler::new(Arch::X64).unwrap();
        assert_eq!(c.func(sig).unwrap_err(), Error::InvalidArch);
    }

    #[test]
    fn invoke_requires_matching_arity() {
        let mut c = Compiler::new(Arch::X64).unwrap();
        let sig = FuncSignature::new(CallConv::X64SystemV, TypeId::Void, &[TypeId::I64]);
        c.func(FuncSignature::new(CallConv::X64SystemV, TypeId::Void, &[])).unwrap();
        let err = c.invoke(Operand::Imm(Imm::new(0)), &sig, &[], false).unwrap_err();
        assert_eq!(err, Error::InvalidArgument);
    }
}
