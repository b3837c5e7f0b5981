//! The instruction IR: a doubly-linked list of typed nodes in an arena.
//!
//! Nodes live in a [`PrimaryMap`] arena and link to each other through
//! integer handles, so removal never deallocates and handles stay stable
//! until [`NodeList::clear`]. Passes iterate by re-reading `next` each step,
//! which keeps iteration stable when the current node is removed or when
//! spill/reload instructions are inserted around an anchor.

pub mod builder;

use smallvec::SmallVec;

use crate::entity::{entity_impl, PackedOption, PrimaryMap};
use crate::func::{FuncDetail, FuncSignature};
use crate::label::Label;
use crate::operand::{Operand, Reg, VirtReg};

#[cfg(feature = "aarch64")]
use crate::isa::aarch64::A64Inst;
#[cfg(feature = "x64")]
use crate::isa::x64::X64Inst;

/// A node handle into the IR arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);
entity_impl!(NodeId, "n");

/// An architecture-specific instruction identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstId {
    /// An x86-64 instruction.
    #[cfg(feature = "x64")]
    X64(X64Inst),
    /// An AArch64 instruction.
    #[cfg(feature = "aarch64")]
    A64(A64Inst),
}

/// Per-instruction emission options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InstOptions {
    /// Prefer the rel8 branch form. Out-of-range targets then fail at
    /// finalize; there is no relaxation pass.
    pub short_form: bool,
}

/// An instruction node: id, operands and options.
#[derive(Clone, Debug)]
pub struct InstNode {
    /// Which instruction.
    pub inst: InstId,
    /// Operand list; virtual registers allowed until allocation.
    pub operands: SmallVec<[Operand; 4]>,
    /// Emission options.
    pub options: InstOptions,
}

/// Alignment fill policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignMode {
    /// Pad with NOPs (code sections).
    Code,
    /// Pad with zeros (data sections).
    Data,
}

/// Sentinel node kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SentinelKind {
    /// Marks the end of a function body.
    FuncEnd,
}

/// A function entry node: the signature, its ABI expansion, and the virtual
/// registers holding the incoming arguments.
#[derive(Clone, Debug)]
pub struct FuncNode {
    /// The declared signature.
    pub sig: FuncSignature,
    /// The ABI expansion of the signature.
    pub detail: FuncDetail,
    /// Virtual registers created for the arguments, by index.
    pub args: SmallVec<[Option<VirtReg>; 8]>,
}

/// A call-site node, lowered against its own signature.
#[derive(Clone, Debug)]
pub struct InvokeNode {
    /// Call target: label, register or absolute immediate.
    pub target: Operand,
    /// The callee's ABI expansion.
    pub detail: FuncDetail,
    /// Argument values in callee declaration order.
    pub args: SmallVec<[Operand; 8]>,
    /// Receiver of the return value, if requested.
    pub ret: Option<Reg>,
}

/// The typed payload of a node.
#[derive(Clone, Debug)]
pub enum NodeData {
    /// A machine instruction.
    Inst(InstNode),
    /// A label bound at this position.
    Label(Label),
    /// An alignment directive.
    Align(AlignMode, u32),
    /// Raw bytes emitted into the current section.
    EmbedData {
        /// The bytes.
        bytes: Vec<u8>,
        /// Size of one logical item, for alignment bookkeeping.
        item_size: u8,
    },
    /// An informative comment; never emitted.
    Comment(String),
    /// A marker node.
    Sentinel(SentinelKind),
    /// Function entry.
    Func(Box<FuncNode>),
    /// Function return with the values to place in ABI return registers.
    FuncRet(SmallVec<[Operand; 2]>),
    /// A call site.
    Invoke(Box<InvokeNode>),
    /// Start of a basic block, carrying the block's label.
    Block(Label),
}

/// Node behavior flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeFlags(u16);

impl NodeFlags {
    /// Emits machine code.
    pub const IS_CODE: Self = Self(1 << 0);
    /// Emits data bytes.
    pub const IS_DATA: Self = Self(1 << 1);
    /// Purely informative (comments).
    pub const IS_INFORMATIVE: Self = Self(1 << 2);
    /// May be removed by passes.
    pub const IS_REMOVABLE: Self = Self(1 << 3);
    /// Known to have no architectural effect (e.g. `mov x, x`).
    pub const HAS_NO_EFFECT: Self = Self(1 << 4);
    /// Participates in allocation like an instruction (invoke, func-ret).
    pub const ACTS_AS_INST: Self = Self(1 << 5);
    /// Binds a position like a label (blocks).
    pub const ACTS_AS_LABEL: Self = Self(1 << 6);
    /// Currently linked into the list.
    pub const IS_ACTIVE: Self = Self(1 << 7);

    /// Union of two flag sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Does this set contain every flag of `other`?
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    fn set(&mut self, other: Self) {
        self.0 |= other.0;
    }

    fn unset(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl NodeData {
    fn default_flags(&self) -> NodeFlags {
        match self {
            NodeData::Inst(_) => NodeFlags::IS_CODE.union(NodeFlags::IS_REMOVABLE),
            NodeData::Label(_) | NodeData::Block(_) => NodeFlags::ACTS_AS_LABEL,
            NodeData::Align(..) => NodeFlags::IS_CODE,
            NodeData::EmbedData { .. } => NodeFlags::IS_DATA,
            NodeData::Comment(_) => {
                NodeFlags::IS_INFORMATIVE.union(NodeFlags::IS_REMOVABLE).union(NodeFlags::HAS_NO_EFFECT)
            }
            NodeData::Sentinel(_) => NodeFlags::HAS_NO_EFFECT,
            NodeData::Func(_) => NodeFlags::ACTS_AS_INST,
            NodeData::FuncRet(_) | NodeData::Invoke(_) => {
                NodeFlags::IS_CODE.union(NodeFlags::ACTS_AS_INST)
            }
        }
    }
}

/// One arena slot: payload plus links.
#[derive(Clone, Debug)]
pub struct Node {
    /// Previous node in program order.
    pub prev: PackedOption<NodeId>,
    /// Next node in program order.
    pub next: PackedOption<NodeId>,
    /// The payload.
    pub data: NodeData,
    /// Behavior flags.
    pub flags: NodeFlags,
    /// Even instruction position assigned by liveness numbering.
    pub pos: u32,
}

/// The doubly-linked node list over an arena.
#[derive(Debug, Default)]
pub struct NodeList {
    nodes: PrimaryMap<NodeId, Node>,
    first: PackedOption<NodeId>,
    last: PackedOption<NodeId>,
}

impl NodeList {
    /// An empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// First node in program order.
    pub fn first(&self) -> Option<NodeId> {
        self.first.expand()
    }

    /// Last node in program order.
    pub fn last(&self) -> Option<NodeId> {
        self.last.expand()
    }

    /// The node after `id`.
    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].next.expand()
    }

    /// The node before `id`.
    pub fn prev(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].prev.expand()
    }

    /// Borrow a node.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Mutably borrow a node.
    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id]
    }

    /// Is the node currently linked?
    pub fn is_active(&self, id: NodeId) -> bool {
        self.nodes[id].flags.contains(NodeFlags::IS_ACTIVE)
    }

    fn alloc(&mut self, data: NodeData) -> NodeId {
        let flags = data.default_flags();
        self.nodes.push(Node {
            prev: Default::default(),
            next: Default::default(),
            data,
            flags,
            pos: 0,
        })
    }

    /// Append a new node at the end of the list.
    pub fn append(&mut self, data: NodeData) -> NodeId {
        let id = self.alloc(data);
        let prev = self.last;
        self.nodes[id].prev = prev;
        self.nodes[id].flags.set(NodeFlags::IS_ACTIVE);
        match prev.expand() {
            Some(p) => self.nodes[p].next = id.into(),
            None => self.first = id.into(),
        }
        self.last = id.into();
        id
    }

    /// Insert a new node at the front of the list.
    pub fn prepend(&mut self, data: NodeData) -> NodeId {
        match self.first.expand() {
            Some(first) => self.insert_before(data, first),
            None => self.append(data),
        }
    }

    /// Insert a new node before `anchor`.
    pub fn insert_before(&mut self, data: NodeData, anchor: NodeId) -> NodeId {
        debug_assert!(self.is_active(anchor));
        let id = self.alloc(data);
        let prev = self.nodes[anchor].prev;
        self.nodes[id].prev = prev;
        self.nodes[id].next = anchor.into();
        self.nodes[id].flags.set(NodeFlags::IS_ACTIVE);
        self.nodes[anchor].prev = id.into();
        match prev.expand() {
            Some(p) => self.nodes[p].next = id.into(),
            None => self.first = id.into(),
        }
        id
    }

    /// Insert a new node after `anchor`.
    pub fn insert_after(&mut self, data: NodeData, anchor: NodeId) -> NodeId {
        debug_assert!(self.is_active(anchor));
        let id = self.alloc(data);
        let next = self.nodes[anchor].next;
        self.nodes[id].prev = anchor.into();
        self.nodes[id].next = next;
        self.nodes[id].flags.set(NodeFlags::IS_ACTIVE);
        self.nodes[anchor].next = id.into();
        match next.expand() {
            Some(n) => self.nodes[n].prev = id.into(),
            None => self.last = id.into(),
        }
        id
    }

    /// Unlink `id` from the list. The arena slot survives until `clear`;
    /// the node's own links are nulled.
    pub fn remove(&mut self, id: NodeId) {
        debug_assert!(self.is_active(id));
        let prev = self.nodes[id].prev;
        let next = self.nodes[id].next;
        match prev.expand() {
            Some(p) => self.nodes[p].next = next,
            None => self.first = next,
        }
        match next.expand() {
            Some(n) => self.nodes[n].prev = prev,
            None => self.last = prev,
        }
        let node = &mut self.nodes[id];
        node.prev = Default::default();
        node.next = Default::default();
        node.flags.unset(NodeFlags::IS_ACTIVE);
    }

    /// Drop every node and reset the arena.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.first = Default::default();
        self.last = Default::default();
    }

    /// Number of arena slots (including removed nodes).
    pub fn arena_len(&self) -> usize {
        self.nodes.len()
    }

    /// Iterate over the active nodes in program order.
    ///
    /// `next` is read before the current node is yielded, so removing the
    /// current node mid-iteration is safe; inserting after it is visible on
    /// the following step only if the iterator is rebuilt, which is why
    /// passes that insert use an explicit `next_of` loop instead.
    pub fn iter(&self) -> NodeIter<'_> {
        NodeIter { list: self, cur: self.first.expand() }
    }
}

/// Iterator over active nodes.
pub struct NodeIter<'a> {
    list: &'a NodeList,
    cur: Option<NodeId>,
}

impl<'a> Iterator for NodeIter<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let id = self.cur?;
        self.cur = self.list.next(id);
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(list: &mut NodeList, text: &str) -> NodeId {
        list.append(NodeData::Comment(text.to_string()))
    }

    fn texts(list: &NodeList) -> Vec<String> {
        list.iter()
            .map(|id| match &list.node(id).data {
                NodeData::Comment(t) => t.clone(),
                _ => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn append_and_order() {
        let mut list = NodeList::new();
        comment(&mut list, "a");
        comment(&mut list, "b");
        comment(&mut list, "c");
        assert_eq!(texts(&list), ["a", "b", "c"]);
    }

    #[test]
    fn insert_before_and_after() {
        let mut list = NodeList::new();
        let a = comment(&mut list, "a");
        let c = comment(&mut list, "c");
        list.insert_after(NodeData::Comment("b".into()), a);
        list.insert_before(NodeData::Comment("0".into()), a);
        list.insert_after(NodeData::Comment("d".into()), c);
        assert_eq!(texts(&list), ["0", "a", "b", "c", "d"]);
        assert_eq!(list.first(), list.prev(a));
        assert_eq!(list.last(), list.next(c));
    }

    #[test]
    fn remove_relinks_neighbors() {
        let mut list = NodeList::new();
        let a = comment(&mut list, "a");
        let b = comment(&mut list, "b");
        let c = comment(&mut list, "c");
        list.remove(b);
        assert_eq!(texts(&list), ["a", "c"]);
        assert_eq!(list.next(a), Some(c));
        assert_eq!(list.prev(c), Some(a));
        assert!(!list.is_active(b));
        // The arena slot survives.
        assert_eq!(list.arena_len(), 3);
        list.remove(a);
        list.remove(c);
        assert_eq!(list.first(), None);
        assert_eq!(list.last(), None);
    }

    #[test]
    fn removal_of_current_during_iteration() {
        let mut list = NodeList::new();
        comment(&mut list, "a");
        comment(&mut list, "b");
        comment(&mut list, "c");
        let mut seen = Vec::new();
        let mut cur = list.first();
        while let Some(id) = cur {
            let next = list.next(id);
            if let NodeData::Comment(t) = &list.node(id).data {
                seen.push(t.clone());
                if t == "b" {
                    list.remove(id);
                }
            }
            cur = next;
        }
        assert_eq!(seen, ["a", "b", "c"]);
        assert_eq!(texts(&list), ["a", "c"]);
    }

    #[test]
    fn clear_resets_arena() {
        let mut list = NodeList::new();
        comment(&mut list, "a");
        list.clear();
        assert_eq!(list.arena_len(), 0);
        assert_eq!(list.first(), None);
    }
}
