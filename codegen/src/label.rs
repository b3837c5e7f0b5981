//! Label allocation, binding and fixup recording.
//!
//! Labels are allocated eagerly and bound to a (section, offset) at most
//! once. References emitted before the label is bound record a [`Fixup`] at
//! the reference site; the relocation resolver patches them all when the
//! code holder finalizes.

use rustc_hash::FxHashMap;

use crate::buffer::{CodeOffset, SectionId};
use crate::entity::{entity_impl, PrimaryMap};
use crate::result::{CodegenResult, Error};

/// A label id into the label table.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);
entity_impl!(Label, "L");

/// The patch applied at a fixup site when its label's offset is known.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// 8-bit displacement relative to the end of the field.
    Rel8,
    /// 32-bit displacement relative to the end of the field.
    Rel32,
    /// x86-64 RIP-relative 32-bit displacement.
    RipRel32,
    /// 32-bit absolute offset (rebased by the runtime at map time).
    Abs32,
    /// 64-bit absolute offset (rebased by the runtime at map time).
    Abs64,
    /// AArch64 b/bl: 26-bit signed word offset in bits 25..0.
    A64Branch26,
    /// AArch64 b.cond/cbz: 19-bit signed word offset in bits 23..5.
    A64Branch19,
    /// AArch64 adr: 21-bit byte offset, low 2 bits in 30..29, high 19 in
    /// bits 23..5.
    A64Adr21,
}

impl RelocKind {
    /// Width in bytes of the field patched at the fixup site.
    pub fn patch_size(self) -> u8 {
        match self {
            RelocKind::Rel8 => 1,
            RelocKind::Rel32
            | RelocKind::RipRel32
            | RelocKind::Abs32
            | RelocKind::A64Branch26
            | RelocKind::A64Branch19
            | RelocKind::A64Adr21 => 4,
            RelocKind::Abs64 => 8,
        }
    }
}

/// A pending patch site referencing a label.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fixup {
    /// Section the patch site lives in.
    pub section: SectionId,
    /// Offset of the patch field within that section.
    pub at: CodeOffset,
    /// How to compute and splice the patched value.
    pub kind: RelocKind,
    /// Extra addend folded into absolute relocations.
    pub addend: i64,
}

#[derive(Clone, Debug, Default)]
struct LabelEntry {
    /// Bound (section, offset), if bound. Monotonic: set at most once.
    bound: Option<(SectionId, CodeOffset)>,
    fixups: Vec<Fixup>,
    name: Option<String>,
}

/// The per-compilation label table.
///
/// Append-only within a compilation; cleared by `reset()`.
#[derive(Debug, Default)]
pub struct LabelManager {
    labels: PrimaryMap<Label, LabelEntry>,
    names: FxHashMap<String, Label>,
}

impl LabelManager {
    /// Create an empty label table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of allocated labels.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True if no labels have been allocated.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Allocate a fresh anonymous label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelEntry::default())
    }

    /// Allocate a fresh named label. Names are unique per compilation.
    pub fn new_named(&mut self, name: &str) -> CodegenResult<Label> {
        if self.names.contains_key(name) {
            return Err(Error::LabelAlreadyDefined);
        }
        let label = self.labels.push(LabelEntry { name: Some(name.to_string()), ..Default::default() });
        self.names.insert(name.to_string(), label);
        Ok(label)
    }

    /// Look up a label by name.
    pub fn label_by_name(&self, name: &str) -> Option<Label> {
        self.names.get(name).copied()
    }

    /// Does `label` refer to a live table entry?
    pub fn is_valid(&self, label: Label) -> bool {
        self.labels.is_valid(label)
    }

    /// Bind `label` to an offset within a section. A label binds exactly
    /// once.
    pub fn bind(&mut self, label: Label, section: SectionId, offset: CodeOffset) -> CodegenResult<()> {
        let entry = self.labels.get_mut(label).ok_or(Error::InvalidLabel)?;
        if entry.bound.is_some() {
            return Err(Error::LabelAlreadyBound);
        }
        entry.bound = Some((section, offset));
        log::trace!("bound {} to {}+{:#x}", label, section, offset);
        Ok(())
    }

    /// Record a patch site referencing `label`.
    pub fn add_fixup(
        &mut self,
        label: Label,
        section: SectionId,
        at: CodeOffset,
        kind: RelocKind,
        addend: i64,
    ) -> CodegenResult<()> {
        let entry = self.labels.get_mut(label).ok_or(Error::InvalidLabel)?;
        entry.fixups.push(Fixup { section, at, kind, addend });
        Ok(())
    }

    /// Is the label bound to an offset yet?
    pub fn is_bound(&self, label: Label) -> bool {
        self.labels.get(label).map_or(false, |e| e.bound.is_some())
    }

    /// The (section, offset) the label is bound to, if bound.
    pub fn bound_offset(&self, label: Label) -> Option<(SectionId, CodeOffset)> {
        self.labels.get(label).and_then(|e| e.bound)
    }

    /// The label's name, if it has one.
    pub fn name(&self, label: Label) -> Option<&str> {
        self.labels.get(label).and_then(|e| e.name.as_deref())
    }

    /// Fixups recorded against `label`.
    pub fn fixups(&self, label: Label) -> &[Fixup] {
        self.labels.get(label).map_or(&[], |e| e.fixups.as_slice())
    }

    /// Iterate over all labels with their fixups. Used by the relocation
    /// resolver.
    pub fn iter(&self) -> impl Iterator<Item = (Label, Option<(SectionId, CodeOffset)>, &[Fixup])> {
        self.labels.iter().map(|(l, e)| (l, e.bound, e.fixups.as_slice()))
    }

    /// Release the whole table, returning the manager to its initial state.
    pub fn reset(&mut self) {
        self.labels.clear();
        self.names.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;

    fn text() -> SectionId {
        SectionId::new(0)
    }

    #[test]
    fn bind_once() {
        let mut lm = LabelManager::new();
        let l = lm.new_label();
        assert!(!lm.is_bound(l));
        lm.bind(l, text(), 16).unwrap();
        assert!(lm.is_bound(l));
        assert_eq!(lm.bound_offset(l), Some((text(), 16)));
        assert_eq!(lm.bind(l, text(), 32), Err(Error::LabelAlreadyBound));
        // The original binding stays.
        assert_eq!(lm.bound_offset(l), Some((text(), 16)));
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut lm = LabelManager::new();
        let a = lm.new_named("entry").unwrap();
        assert_eq!(lm.new_named("entry"), Err(Error::LabelAlreadyDefined));
        assert_eq!(lm.label_by_name("entry"), Some(a));
        assert_eq!(lm.name(a), Some("entry"));
    }

    #[test]
    fn fixups_accumulate_before_binding() {
        let mut lm = LabelManager::new();
        let l = lm.new_label();
        lm.add_fixup(l, text(), 1, RelocKind::Rel32, 0).unwrap();
        lm.add_fixup(l, text(), 9, RelocKind::Rel8, 0).unwrap();
        assert_eq!(lm.fixups(l).len(), 2);
        assert_eq!(lm.fixups(l)[1].kind.patch_size(), 1);
    }

    #[test]
    fn reset_clears_everything() {
        let mut lm = LabelManager::new();
        lm.new_named("x").unwrap();
        lm.reset();
        assert!(lm.is_empty());
        assert_eq!(lm.label_by_name("x"), None);
    }
}
