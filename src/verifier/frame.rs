use crate::descriptors::{ArrayType, MethodDescriptor, RefType};
use crate::errors::{Error, FrameErrorKind};
use crate::hierarchy::ClassHierarchy;
use crate::names::BinaryName;
use crate::util::Width;
use crate::verifier::{UninitializedSite, VerificationType};

/// Verification type during frame computation
pub type VType = VerificationType<RefType<BinaryName>, UninitializedSite>;

/// Snapshot of the local variables and operand stack at a point in the
/// bytecode
///
/// Locals are slot-indexed: a `long`/`double` occupies its own slot plus an
/// explicit [`VerificationType::Top`] continuation slot, which is what makes
/// per-slot merging of mismatched widths straightforward. The stack is
/// entry-indexed (a `long` is one entry of width two).
#[derive(Debug, Clone, Eq, PartialEq, Default)]
pub struct FrameState {
    pub locals: Vec<VType>,
    pub stack: Vec<VType>,
}

impl FrameState {
    /// Initial frame of a method, derived from its receiver kind and
    /// descriptor
    pub fn entry_frame(
        this_class: &BinaryName,
        descriptor: &MethodDescriptor<BinaryName>,
        is_static: bool,
        is_init: bool,
    ) -> FrameState {
        let mut locals = vec![];
        if is_init {
            locals.push(VType::UninitializedThis);
        } else if !is_static {
            locals.push(VType::Object(RefType::Object(this_class.clone())));
        }
        for parameter in &descriptor.parameters {
            let vtype = VType::from(parameter);
            let width = vtype.width();
            locals.push(vtype);
            if width == 2 {
                locals.push(VType::Top);
            }
        }
        FrameState {
            locals,
            stack: vec![],
        }
    }

    /// Slot width of the operand stack (`long`/`double` count for two)
    pub fn stack_width(&self) -> usize {
        self.stack.iter().map(Width::width).sum()
    }

    pub fn push(&mut self, vtype: VType) {
        self.stack.push(vtype);
    }

    pub fn pop(&mut self) -> Result<VType, FrameErrorKind> {
        self.stack.pop().ok_or(FrameErrorKind::EmptyStack)
    }

    /// Pop, insisting on the width of the popped entry (used by the untyped
    /// stack shuffling instructions, whose forms depend on operand widths)
    pub fn pop_width(&mut self, expected_width: usize) -> Result<VType, FrameErrorKind> {
        let vtype = self.pop()?;
        let found = vtype.width();
        if found == expected_width {
            Ok(vtype)
        } else {
            Err(FrameErrorKind::InvalidWidth(found))
        }
    }

    pub fn get_local(&self, index: u16) -> Result<VType, FrameErrorKind> {
        self.locals
            .get(index as usize)
            .cloned()
            .ok_or(FrameErrorKind::InvalidLocalIndex(index))
    }

    /// Store into a local slot, growing the frame as needed
    ///
    /// Storing over the second slot of a `long`/`double` invalidates the
    /// first, and storing a wide value claims the following slot as its
    /// continuation.
    pub fn set_local(&mut self, index: u16, vtype: VType) {
        let index = index as usize;
        let width = vtype.width();
        while self.locals.len() < index + width {
            self.locals.push(VType::Top);
        }

        // Clobbering the continuation slot of a wide value kills the value
        if index > 0 && self.locals[index - 1].width() == 2 {
            self.locals[index - 1] = VType::Top;
        }

        // A wide store also claims the continuation slot, which may itself
        // have been the start of another wide value
        if width == 2 {
            if self.locals[index + 1].width() == 2 {
                self.locals[index + 2] = VType::Top;
            }
            self.locals[index + 1] = VType::Top;
        }
        self.locals[index] = vtype;
    }

    /// Replace every occurrence of a type in the frame (used when `<init>`
    /// turns an uninitialized value into a real object)
    pub fn replace_all(&mut self, original: &VType, replacement: &VType) {
        for slot in self.locals.iter_mut().chain(self.stack.iter_mut()) {
            if slot == original {
                *slot = replacement.clone();
            }
        }
    }

    /// Update running maximums for locals and stack (both in slots)
    pub fn update_maximums(&self, max_locals: &mut usize, max_stack: &mut usize) {
        *max_locals = (*max_locals).max(self.locals.len());
        *max_stack = (*max_stack).max(self.stack_width());
    }

    /// Merge another frame into this one, per slot, returning whether
    /// anything changed
    ///
    /// This frame ends up being the least frame consistent with both inputs:
    /// slots that agree are kept, object types generalize to their nearest
    /// common superclass, and genuine disagreements become
    /// [`VerificationType::Top`]. A stack depth mismatch means the bytecode
    /// is malformed and is an error rather than a merge.
    pub fn merge_from(
        &mut self,
        incoming: &FrameState,
        hierarchy: &dyn ClassHierarchy,
    ) -> Result<bool, Error> {
        let mut changed = false;

        // Shorter locals mean the missing slots are undefined on that path
        let undefined = VType::Top;
        let target_len = self.locals.len().max(incoming.locals.len());
        if self.locals.len() < target_len {
            self.locals.resize(target_len, VType::Top);
            changed = true;
        }
        for (index, slot) in self.locals.iter_mut().enumerate() {
            let incoming_slot = incoming.locals.get(index).unwrap_or(&undefined);
            let merged = merge_types(slot, incoming_slot, hierarchy)?;
            if *slot != merged {
                *slot = merged;
                changed = true;
            }
        }

        if self.stack.len() != incoming.stack.len() {
            return Err(Error::FrameComputation {
                instruction: String::from("merge point"),
                kind: FrameErrorKind::StackDepthMismatch {
                    expected: self.stack.len(),
                    found: incoming.stack.len(),
                },
            });
        }
        for (slot, incoming_slot) in self.stack.iter_mut().zip(incoming.stack.iter()) {
            let merged = merge_types(slot, incoming_slot, hierarchy)?;
            if *slot != merged {
                *slot = merged;
                changed = true;
            }
        }

        Ok(changed)
    }
}

/// Merge two verification types
///
/// The result is `Top` only on genuine disagreement, never as a default:
/// equal types are kept, `Null` generalizes to any object type, and object
/// types generalize to their nearest common ancestor (`java/lang/Object`
/// when they are unrelated).
pub fn merge_types(
    left: &VType,
    right: &VType,
    hierarchy: &dyn ClassHierarchy,
) -> Result<VType, Error> {
    if left == right {
        return Ok(left.clone());
    }
    match (left, right) {
        (VType::Null, VType::Object(r)) => Ok(VType::Object(r.clone())),
        (VType::Object(r), VType::Null) => Ok(VType::Object(r.clone())),
        (VType::Object(r1), VType::Object(r2)) => {
            Ok(VType::Object(merge_ref_types(r1, r2, hierarchy)?))
        }

        // Everything else (primitive disagreements, wide vs. narrow,
        // uninitialized values from different sites) is unusable
        _ => Ok(VType::Top),
    }
}

/// Nearest common ancestor of two reference types
fn merge_ref_types(
    left: &RefType<BinaryName>,
    right: &RefType<BinaryName>,
    hierarchy: &dyn ClassHierarchy,
) -> Result<RefType<BinaryName>, Error> {
    fn total_dimensions(ref_type: &RefType<BinaryName>) -> usize {
        match ref_type {
            RefType::Object(_) => 0,
            RefType::ObjectArray(arr) => arr.additional_dimensions + 1,
            RefType::PrimitiveArray(arr) => arr.additional_dimensions + 1,
        }
    }

    /// `k`-dimensional array of `java/lang/Object` (plain Object for `k` 0)
    fn object_array(total_dims: usize) -> RefType<BinaryName> {
        if total_dims == 0 {
            RefType::Object(BinaryName::OBJECT)
        } else {
            RefType::ObjectArray(ArrayType {
                additional_dimensions: total_dims - 1,
                element_type: BinaryName::OBJECT,
            })
        }
    }

    let left_dims = total_dimensions(left);
    let right_dims = total_dimensions(right);

    if left_dims == 0 && right_dims == 0 {
        let (left_name, right_name) = match (left, right) {
            (RefType::Object(l), RefType::Object(r)) => (l, r),
            _ => unreachable!("zero-dimension types are object types"),
        };
        return Ok(RefType::Object(
            hierarchy.common_superclass(left_name, right_name)?,
        ));
    }

    if left_dims == right_dims {
        match (left, right) {
            // Same-shape object arrays merge their element classes
            (RefType::ObjectArray(l), RefType::ObjectArray(r)) => {
                let element = hierarchy.common_superclass(&l.element_type, &r.element_type)?;
                Ok(RefType::ObjectArray(ArrayType {
                    additional_dimensions: l.additional_dimensions,
                    element_type: element,
                }))
            }

            // Differing primitive elements only share the enclosing array
            // shape, one dimension up
            _ => Ok(object_array(left_dims - 1)),
        }
    } else {
        // Dimension mismatch: the deeper array is an object at the shallower
        // array's element depth, unless the shallow side bottoms out in a
        // primitive
        let min_dims = left_dims.min(right_dims);
        let shallow = if left_dims < right_dims { left } else { right };
        match shallow {
            RefType::PrimitiveArray(_) => Ok(object_array(min_dims - 1)),
            _ => Ok(object_array(min_dims)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::descriptors::{FieldType, ParseDescriptor};
    use crate::hierarchy::{ClassGraph, ClassGraphArenas};
    use crate::names::Name;

    fn object(name: &str) -> VType {
        VType::Object(RefType::Object(
            BinaryName::from_string(name.to_string()).unwrap(),
        ))
    }

    fn with_hierarchy(check: impl FnOnce(&dyn ClassHierarchy)) {
        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        graph.insert_java_lang_core();
        check(&graph);
    }

    #[test]
    fn merge_is_reflexive() {
        with_hierarchy(|hierarchy| {
            for vtype in [
                VType::Top,
                VType::Integer,
                VType::Float,
                VType::Long,
                VType::Double,
                VType::Null,
                VType::UninitializedThis,
                object("java/lang/String"),
            ] {
                assert_eq!(merge_types(&vtype, &vtype, hierarchy).unwrap(), vtype);
            }
        });
    }

    #[test]
    fn merge_is_symmetric() {
        with_hierarchy(|hierarchy| {
            let cases = [
                (VType::Integer, VType::Float),
                (VType::Null, object("java/lang/String")),
                (object("java/lang/Integer"), object("java/lang/String")),
                (VType::Long, object("java/lang/String")),
                (VType::Top, VType::Integer),
            ];
            for (a, b) in cases {
                assert_eq!(
                    merge_types(&a, &b, hierarchy).unwrap(),
                    merge_types(&b, &a, hierarchy).unwrap(),
                );
            }
        });
    }

    #[test]
    fn disagreements_become_top() {
        with_hierarchy(|hierarchy| {
            assert_eq!(
                merge_types(&VType::Integer, &VType::Float, hierarchy).unwrap(),
                VType::Top
            );
            assert_eq!(
                merge_types(&VType::Long, &VType::Integer, hierarchy).unwrap(),
                VType::Top
            );
            assert_eq!(
                merge_types(&VType::UninitializedThis, &VType::Integer, hierarchy).unwrap(),
                VType::Top
            );

            // ... but null against an object is not a disagreement
            assert_eq!(
                merge_types(&VType::Null, &object("java/lang/String"), hierarchy).unwrap(),
                object("java/lang/String")
            );
        });
    }

    #[test]
    fn objects_merge_to_common_ancestor() {
        with_hierarchy(|hierarchy| {
            assert_eq!(
                merge_types(
                    &object("java/lang/Integer"),
                    &object("java/lang/Long"),
                    hierarchy
                )
                .unwrap(),
                object("java/lang/Number")
            );
            assert_eq!(
                merge_types(
                    &object("java/lang/Integer"),
                    &object("java/lang/String"),
                    hierarchy
                )
                .unwrap(),
                object("java/lang/Object")
            );
        });
    }

    #[test]
    fn arrays_merge_structurally() {
        with_hierarchy(|hierarchy| {
            let int_array = VType::Object(RefType::parse("[I").unwrap());
            let long_array = VType::Object(RefType::parse("[J").unwrap());
            let integer_array = VType::Object(RefType::parse("[Ljava/lang/Integer;").unwrap());
            let long_box_array = VType::Object(RefType::parse("[Ljava/lang/Long;").unwrap());
            let number_array = VType::Object(RefType::parse("[Ljava/lang/Number;").unwrap());

            assert_eq!(
                merge_types(&int_array, &long_array, hierarchy).unwrap(),
                object("java/lang/Object")
            );
            assert_eq!(
                merge_types(&integer_array, &long_box_array, hierarchy).unwrap(),
                number_array
            );
        });
    }

    #[test]
    fn wide_store_claims_continuation_slot() {
        let mut frame = FrameState::default();
        frame.set_local(0, VType::Long);
        assert_eq!(frame.locals, vec![VType::Long, VType::Top]);

        // Clobbering the continuation kills the wide value
        frame.set_local(1, VType::Integer);
        assert_eq!(frame.locals, vec![VType::Top, VType::Integer]);
    }

    #[test]
    fn entry_frame_layout() {
        let descriptor = MethodDescriptor::parse("(IJLjava/lang/String;)V").unwrap();
        let frame = FrameState::entry_frame(&BinaryName::OBJECT, &descriptor, false, false);
        assert_eq!(
            frame.locals,
            vec![
                object("java/lang/Object"),
                VType::Integer,
                VType::Long,
                VType::Top,
                object("java/lang/String"),
            ]
        );
        assert!(frame.stack.is_empty());

        let static_frame = FrameState::entry_frame(
            &BinaryName::OBJECT,
            &MethodDescriptor {
                parameters: vec![FieldType::DOUBLE],
                return_type: None,
            },
            true,
            false,
        );
        assert_eq!(static_frame.locals, vec![VType::Double, VType::Top]);
    }
}
