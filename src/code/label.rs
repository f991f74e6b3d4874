use crate::errors::Error;
use crate::util::Offset;
use std::collections::HashMap;
use std::fmt;

/// Opaque handle to "the instruction at this not-yet-known byte offset"
///
/// A label's identity is scoped to a single method body; labels are never
/// reused across methods. The label itself is just an id: all mutable state
/// (resolved offset, pending patches) lives in the [`LabelArena`].
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct Label(u32);

impl Label {
    /// Label for the first block in a method
    pub const START: Label = Label(0);

    pub(crate) const fn new(id: u32) -> Label {
        Label(id)
    }

    pub fn id(self) -> u32 {
        self.0
    }

    /// Was this label minted by a [`LabelArena`] (as opposed to whoever is
    /// driving the visitor)?
    pub(crate) fn is_synthetic(self) -> bool {
        self.0 >= SYNTHETIC_START
    }
}

impl fmt::Debug for Label {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_fmt(format_args!("l{}", self.0))
    }
}

/// Generates fresh labels, counting up from a starting point
///
/// Cloning does not split the generator source: the clone will produce the
/// same sequence of labels as the original.
#[derive(Clone)]
pub struct LabelGenerator(Label);

impl Default for LabelGenerator {
    fn default() -> LabelGenerator {
        LabelGenerator::new()
    }
}

impl LabelGenerator {
    pub fn new() -> LabelGenerator {
        LabelGenerator(Label::START)
    }

    pub fn fresh_label(&mut self) -> Label {
        let to_return = self.0;
        self.0 = Label(to_return.0 + 1);
        to_return
    }
}

/// Width of a deferred jump operand
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum PatchKind {
    /// Signed 16-bit relative offset
    Short,

    /// Signed 32-bit relative offset
    Wide,
}

/// A queued deferred write: once `label` resolves, the relative distance from
/// `base` gets written at byte offset `site`
#[derive(Debug)]
struct PatchSite {
    label: Label,
    site: usize,
    base: usize,
    kind: PatchKind,
}

/// Per-method table of label state
///
/// Tracks, for every label seen in one method body: whether anything
/// references it, the offset it resolved to (at most once), and the patch
/// sites waiting on it. Every referenced label must reach the resolved state
/// before final serialization; [`LabelArena::apply_patches`] is the single
/// pass that applies all deferred writes and reports the labels that never
/// made it.
pub struct LabelArena {
    states: HashMap<Label, LabelState>,
    patches: Vec<PatchSite>,

    /// Labels minted by this arena live in their own id range so they can
    /// never collide with labels minted by whoever is driving the visitor
    next_synthetic: u32,
}

#[derive(Default)]
struct LabelState {
    referenced: bool,
    offset: Option<Offset>,
}

/// First id handed out for arena-minted labels
const SYNTHETIC_START: u32 = 1 << 31;

impl Default for LabelArena {
    fn default() -> LabelArena {
        LabelArena::new()
    }
}

impl LabelArena {
    pub fn new() -> LabelArena {
        LabelArena {
            states: HashMap::new(),
            patches: vec![],
            next_synthetic: SYNTHETIC_START,
        }
    }

    /// Mint a fresh unresolved label
    pub fn fresh_label(&mut self) -> Label {
        let label = Label(self.next_synthetic);
        self.next_synthetic += 1;
        label
    }

    /// Record that emitted code refers to this label
    pub fn reference(&mut self, label: Label) {
        self.states.entry(label).or_default().referenced = true;
    }

    /// Fix the label's offset, exactly once
    pub fn resolve(&mut self, label: Label, offset: Offset) -> Result<(), Error> {
        let state = self.states.entry(label).or_default();
        if state.offset.is_some() {
            return Err(Error::LabelAlreadyPlaced(label));
        }
        state.offset = Some(offset);
        Ok(())
    }

    /// Offset the label resolved to, if it has
    pub fn offset(&self, label: Label) -> Option<Offset> {
        self.states.get(&label).and_then(|state| state.offset)
    }

    /// Queue a deferred operand write for a not-yet-resolved label
    pub fn add_patch(&mut self, label: Label, site: usize, base: usize, kind: PatchKind) {
        self.reference(label);
        self.patches.push(PatchSite {
            label,
            site,
            base,
            kind,
        });
    }

    /// Apply all queued patches in one pass
    ///
    /// Fails with [`Error::UnresolvedLabel`] on the first referenced label
    /// that never resolved; nothing is ever silently zero-filled.
    pub fn apply_patches(&mut self, code: &mut [u8]) -> Result<(), Error> {
        for patch in self.patches.drain(..) {
            let target = self
                .states
                .get(&patch.label)
                .and_then(|state| state.offset)
                .ok_or(Error::UnresolvedLabel(patch.label))?;
            let relative = target.0 as i64 - patch.base as i64;
            match patch.kind {
                PatchKind::Short => {
                    let relative =
                        i16::try_from(relative).expect("short jump should have been widened");
                    code[patch.site..patch.site + 2].copy_from_slice(&relative.to_be_bytes());
                }
                PatchKind::Wide => {
                    let relative = i32::try_from(relative).expect("wide jump overflow");
                    code[patch.site..patch.site + 4].copy_from_slice(&relative.to_be_bytes());
                }
            }
        }
        Ok(())
    }

    /// Check that every referenced label has been resolved
    pub fn check_all_resolved(&self) -> Result<(), Error> {
        for (label, state) in &self.states {
            if state.referenced && state.offset.is_none() {
                return Err(Error::UnresolvedLabel(*label));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolve_is_exactly_once() {
        let mut arena = LabelArena::new();
        let label = arena.fresh_label();
        assert!(arena.resolve(label, Offset(4)).is_ok());
        assert!(matches!(
            arena.resolve(label, Offset(8)),
            Err(Error::LabelAlreadyPlaced(_))
        ));
        assert_eq!(arena.offset(label), Some(Offset(4)));
    }

    #[test]
    fn forward_patch_is_applied() {
        let mut arena = LabelArena::new();
        let label = arena.fresh_label();

        // goto at offset 0 jumping forward to offset 6
        let mut code = vec![0xa7, 0, 0, 0x00, 0x00, 0x00, 0xb1];
        arena.add_patch(label, 1, 0, PatchKind::Short);
        arena.resolve(label, Offset(6)).unwrap();
        arena.apply_patches(&mut code).unwrap();
        assert_eq!(&code[1..3], &[0, 6]);
    }

    #[test]
    fn unresolved_reference_is_an_error() {
        let mut arena = LabelArena::new();
        let label = arena.fresh_label();
        arena.add_patch(label, 1, 0, PatchKind::Short);

        let mut code = vec![0; 8];
        assert!(matches!(
            arena.apply_patches(&mut code),
            Err(Error::UnresolvedLabel(_))
        ));

        let mut arena = LabelArena::new();
        let label = arena.fresh_label();
        arena.reference(label);
        assert!(matches!(
            arena.check_all_resolved(),
            Err(Error::UnresolvedLabel(_))
        ));
    }

    #[test]
    fn generator_and_arena_ranges_do_not_collide() {
        let mut generator = LabelGenerator::new();
        let mut arena = LabelArena::new();
        let from_generator = generator.fresh_label();
        let from_arena = arena.fresh_label();
        assert_ne!(from_generator, from_arena);
    }
}
