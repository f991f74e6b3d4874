use crate::class_file::{
    Attribute, BytecodeArray, BytecodeIndex, ClassConstantIndex, Code, ConstantIndex,
    ExceptionHandler, LineNumberEntry, LineNumberTable, LocalVariableEntry, LocalVariableTable,
    Serialize, StackMapFrame, StackMapTable, Utf8ConstantIndex,
};
use crate::access_flags::MethodAccessFlags;
use crate::code::{
    fix_switch_padding, widen_oversized_jumps, BranchEvent, BranchInstruction, Instruction,
    JumpTargets, Label, LabelArena, LayoutBlock, PatchKind, SymbolicBranch, SymbolicInstruction,
    SIGNED_16BIT_JUMP_RANGE,
};
use crate::descriptors::{FieldType, MethodDescriptor, RefType, RenderDescriptor};
use crate::errors::Error;
use crate::names::{BinaryName, Name, UnqualifiedName};
use crate::util::{Offset, OffsetVec, Width};
use crate::verifier::{
    compute_frames, EngineBlock, FrameComputation, FrameState, UninitializedSite,
    VerificationType, VerificationTypeEvent, VType,
};
use crate::visitor::{FrameEvent, MethodVisitor, RawAttribute};
use crate::writer::{exceptions_attribute, ClassWriter};
use std::collections::{HashMap, HashSet, VecDeque};

/// Wire-form verification type
type WireType = VerificationType<ClassConstantIndex, BytecodeIndex>;

/// Block under construction or closed, still in symbolic form
struct SymbolicBlock {
    instructions: Vec<SymbolicInstruction>,
    branch_end: SymbolicBranch,
}

/// The encoder's method-level half
///
/// Consuming instruction events builds the basic block CFG in parallel:
/// placing a label or visiting a branch closes the block under construction.
/// Everything is held symbolically until `visit_end`, which runs the frame
/// engine (when requested), fixes the layout, widens oversized jumps, and
/// emits the final `Code` attribute into the class.
pub struct MethodWriter<'a, 'h> {
    class: &'a ClassWriter<'h>,

    access_flags: MethodAccessFlags,
    name_index: Utf8ConstantIndex,
    descriptor_index: Utf8ConstantIndex,
    descriptor: MethodDescriptor<BinaryName>,
    is_static: bool,
    is_init: bool,

    attributes: Vec<Attribute>,

    has_code: bool,
    arena: LabelArena,
    blocks: HashMap<Label, SymbolicBlock>,
    block_order: Vec<Label>,
    current: Option<(Label, Vec<SymbolicInstruction>)>,

    /// Frames supplied through `visit_frame`, keyed by the label they follow
    /// (ignored under `COMPUTE_FRAMES`)
    supplied_frames: HashMap<Label, FrameEvent>,

    try_catches: Vec<(Label, Label, Label, Option<RefType<BinaryName>>)>,
    line_numbers: Vec<(u16, Label)>,
    local_variables: Vec<(String, FieldType<BinaryName>, Label, Label, u16)>,
    declared_maxs: Option<(u16, u16)>,
}

impl<'a, 'h> MethodWriter<'a, 'h> {
    pub(crate) fn start(
        class: &'a ClassWriter<'h>,
        access_flags: MethodAccessFlags,
        name: &UnqualifiedName,
        descriptor: &MethodDescriptor<BinaryName>,
        exceptions: &[BinaryName],
    ) -> Result<MethodWriter<'a, 'h>, Error> {
        let _ = class.this_class_name()?;
        let name_index = class.constants.get_utf8(name.as_str())?;
        let descriptor_index = class.constants.get_utf8(descriptor.render())?;
        let mut attributes = vec![];
        if let Some(exceptions) = exceptions_attribute(class, exceptions)? {
            attributes.push(exceptions);
        }

        Ok(MethodWriter {
            class,
            access_flags,
            name_index,
            descriptor_index,
            descriptor: descriptor.clone(),
            is_static: access_flags.contains(MethodAccessFlags::STATIC),
            is_init: *name == UnqualifiedName::INIT,
            attributes,
            has_code: false,
            arena: LabelArena::new(),
            blocks: HashMap::new(),
            block_order: vec![],
            current: None,
            supplied_frames: HashMap::new(),
            try_catches: vec![],
            line_numbers: vec![],
            local_variables: vec![],
            declared_maxs: None,
        })
    }

    /// Close the block under construction
    fn close_current(&mut self, branch_end: SymbolicBranch) -> Result<(), Error> {
        let (label, instructions) = self
            .current
            .take()
            .expect("close_current with no open block");
        if self.blocks.contains_key(&label) {
            return Err(Error::LabelAlreadyPlaced(label));
        }
        self.blocks.insert(
            label,
            SymbolicBlock {
                instructions,
                branch_end,
            },
        );
        self.block_order.push(label);
        Ok(())
    }

    /// Block to append the next instruction to, opening an anonymous one for
    /// code that follows a terminal branch without a label (dead code)
    fn current_block(&mut self) -> &mut Vec<SymbolicInstruction> {
        if self.current.is_none() {
            let label = self.arena.fresh_label();
            self.current = Some((label, vec![]));
        }
        &mut self.current.as_mut().unwrap().1
    }

    fn finish_code(&mut self) -> Result<Attribute, Error> {
        // A trailing label with no instructions after it just marks the end
        // of the code (try/catch and debug ranges end there); an open block
        // with instructions means execution falls off the end of the method.
        let mut end_marker: Option<Label> = None;
        if let Some((label, instructions)) = self.current.take() {
            if instructions.is_empty() && !self.block_order.is_empty() {
                end_marker = Some(label);
            } else {
                return Err(Error::VisitOrder(
                    "method body must end in a return, throw, or goto",
                ));
            }
        }
        if self.block_order.is_empty() {
            return Err(Error::VisitOrder("code attribute with no instructions"));
        }
        if let Some(end_label) = end_marker {
            for block in self.blocks.values() {
                if block.branch_end.fallthrough_target() == Some(end_label) {
                    return Err(Error::VisitOrder(
                        "method body must end in a return, throw, or goto",
                    ));
                }
            }
        }

        // Resolve pool indices; blocks stay around in symbolic form too,
        // since the frame engine and the maxs walk need names and descriptors
        let mut ser_blocks: HashMap<Label, LayoutBlock> = HashMap::new();
        for (label, block) in &self.blocks {
            let instructions = block
                .instructions
                .iter()
                .map(|insn| self.serialize_instruction(insn))
                .collect::<Result<OffsetVec<_>, Error>>()?;
            ser_blocks.insert(
                *label,
                LayoutBlock {
                    instructions,
                    branch_end: block.branch_end.clone(),
                },
            );
        }

        // Exception handler coverage, per covered block
        let block_positions: HashMap<Label, usize> = self
            .block_order
            .iter()
            .enumerate()
            .map(|(position, label)| (*label, position))
            .collect();
        let mut handlers_by_block: HashMap<Label, Vec<(Label, RefType<BinaryName>)>> =
            HashMap::new();
        for (start, end, handler, catch_type) in &self.try_catches {
            let start_position = *block_positions
                .get(start)
                .ok_or(Error::UnresolvedLabel(*start))?;
            let end_position = match block_positions.get(end) {
                Some(position) => *position,
                None if end_marker == Some(*end) => self.block_order.len(),
                None => return Err(Error::UnresolvedLabel(*end)),
            };
            let catch_type = catch_type
                .clone()
                .unwrap_or(RefType::Object(BinaryName::THROWABLE));
            for covered in &self.block_order[start_position..end_position] {
                handlers_by_block
                    .entry(*covered)
                    .or_default()
                    .push((*handler, catch_type.clone()));
            }
        }

        // Frame computation (and with it, exact maximums)
        let this_class = self.class.this_class_name()?;
        let computation: Option<FrameComputation> = if self.class.options.compute_frames() {
            let hierarchy = self.class.hierarchy.ok_or(Error::MissingHierarchy)?;
            let entry_frame = FrameState::entry_frame(
                &this_class,
                &self.descriptor,
                self.is_static,
                self.is_init,
            );

            let engine_offsets: HashMap<Label, Vec<Offset>> = ser_blocks
                .iter()
                .map(|(label, block)| {
                    let offsets = block
                        .instructions
                        .iter()
                        .map(|(offset, _, _)| offset)
                        .collect();
                    (*label, offsets)
                })
                .collect();
            let engine_blocks: HashMap<Label, EngineBlock<'_>> = self
                .blocks
                .iter()
                .map(|(label, block)| {
                    let engine_block = EngineBlock {
                        instructions: &block.instructions,
                        insn_offsets: &engine_offsets[label],
                        branch_end: &block.branch_end,
                        handlers: handlers_by_block.get(label).cloned().unwrap_or_default(),
                    };
                    (*label, engine_block)
                })
                .collect();

            let computation = compute_frames(
                &self.block_order,
                &engine_blocks,
                &this_class,
                entry_frame,
                hierarchy,
            )?;

            // Dead code still has to verify: replace blocks the fixed point
            // never reached with an `athrow` stub
            for dead in &computation.dead_blocks {
                let stub = ser_blocks.get_mut(dead).expect("dead block exists");
                stub.instructions = OffsetVec::new();
                stub.branch_end = BranchInstruction::AThrow;
            }

            Some(computation)
        } else {
            None
        };

        // Maximums: engine-derived, height-walked, or taken from the caller
        let (max_stack, max_locals) = if let Some(computation) = &computation {
            (computation.max_stack, computation.max_locals)
        } else if self.class.options.compute_maxs() {
            self.walk_stack_heights(&handlers_by_block)?
        } else {
            let (max_stack, max_locals) = self
                .declared_maxs
                .ok_or(Error::VisitOrder("visit_maxs was never called"))?;
            (max_stack as usize, max_locals as usize)
        };
        let max_stack =
            u16::try_from(max_stack).map_err(|_| Error::MethodMaxStackOverflow(Offset(max_stack)))?;
        let max_locals = u16::try_from(max_locals)
            .map_err(|_| Error::MethodMaxLocalsOverflow(Offset(max_locals)))?;

        // Layout: switch padding first, then promote oversized jumps until
        // everything fits (offsets only grow, so this converges)
        fix_switch_padding(&self.block_order, &mut ser_blocks);
        widen_oversized_jumps(
            &mut self.block_order,
            &mut ser_blocks,
            &mut self.arena,
            &SIGNED_16BIT_JUMP_RANGE,
        );
        fix_switch_padding(&self.block_order, &mut ser_blocks);

        // Emission: resolve labels as blocks are placed, queue patches for
        // forward references, then apply them all in one pass
        let mut code_bytes: Vec<u8> = vec![];
        for label in &self.block_order {
            self.arena.resolve(*label, Offset(code_bytes.len()))?;
            let block = &ser_blocks[label];
            for (_, _, insn) in block.instructions.iter() {
                insn.serialize(&mut code_bytes).map_err(Error::IoError)?;
            }
            emit_branch(&block.branch_end, &mut code_bytes, &mut self.arena)?;
        }
        if let Some(end_label) = end_marker {
            self.arena.resolve(end_label, Offset(code_bytes.len()))?;
        }
        self.arena.apply_patches(&mut code_bytes)?;

        if code_bytes.len() > u16::MAX as usize {
            return Err(Error::MethodCodeOverflow(Offset(code_bytes.len())));
        }

        // Exception table, now that all offsets are known
        let exception_table = self
            .try_catches
            .iter()
            .map(|(start, end, handler, catch_type)| {
                let catch_type = match catch_type {
                    Some(ref_type) => self.class.ref_type_index(ref_type)?,
                    None => ClassConstantIndex(ConstantIndex(0)),
                };
                Ok(ExceptionHandler {
                    start_pc: self.pc(*start)?,
                    end_pc: self.pc(*end)?,
                    handler_pc: self.pc(*handler)?,
                    catch_type,
                })
            })
            .collect::<Result<Vec<ExceptionHandler>, Error>>()?;

        let mut code_attributes = vec![];

        // Stack map table
        let stack_map_frames = if let Some(computation) = &computation {
            self.computed_stack_map(computation, &ser_blocks)?
        } else {
            self.supplied_stack_map(&this_class)?
        };
        if !stack_map_frames.is_empty() {
            code_attributes.push(
                self.class
                    .constants
                    .get_attribute(StackMapTable(stack_map_frames))?,
            );
        }

        // Debug tables
        if !self.line_numbers.is_empty() {
            let entries = self
                .line_numbers
                .iter()
                .map(|(line, start)| {
                    Ok(LineNumberEntry {
                        start_pc: self.pc(*start)?,
                        line_number: *line,
                    })
                })
                .collect::<Result<Vec<LineNumberEntry>, Error>>()?;
            code_attributes.push(
                self.class
                    .constants
                    .get_attribute(LineNumberTable(entries))?,
            );
        }
        if !self.local_variables.is_empty() {
            let entries = self
                .local_variables
                .iter()
                .map(|(name, descriptor, start, end, index)| {
                    let start_pc = self.pc(*start)?;
                    let end_pc = self.pc(*end)?;
                    Ok(LocalVariableEntry {
                        start_pc,
                        length: end_pc.0.saturating_sub(start_pc.0),
                        name_index: self.class.constants.get_utf8(name.as_str())?,
                        descriptor_index: self.class.constants.get_utf8(descriptor.render())?,
                        index: *index,
                    })
                })
                .collect::<Result<Vec<LocalVariableEntry>, Error>>()?;
            code_attributes.push(
                self.class
                    .constants
                    .get_attribute(LocalVariableTable(entries))?,
            );
        }

        self.class.constants.get_attribute(Code {
            max_stack,
            max_locals,
            code_array: BytecodeArray(code_bytes),
            exception_table,
            attributes: code_attributes,
        })
    }

    /// Bytecode offset a label resolved to
    fn pc(&self, label: Label) -> Result<BytecodeIndex, Error> {
        let offset = self
            .arena
            .offset(label)
            .ok_or(Error::UnresolvedLabel(label))?;
        Ok(BytecodeIndex(offset.0 as u16))
    }

    fn serialize_instruction(
        &self,
        insn: &SymbolicInstruction,
    ) -> Result<crate::code::SerializableInstruction, Error> {
        insn.map(
            |class| self.class.ref_type_index(class),
            |constant| self.class.constant_data_index(constant),
            |field| self.class.field_ref_index(field),
            |method| self.class.method_ref_index(method),
            |indy| self.class.invoke_dynamic_index(indy),
        )
    }

    /// Stack map frames from the frame engine's fixed point
    ///
    /// A frame goes out for every block that is a jump target or handler
    /// entry, plus every block that cannot be fallen into (dead stubs after
    /// a terminal branch). Widening trampolines inherit the frame of their
    /// single successor.
    fn computed_stack_map(
        &self,
        computation: &FrameComputation,
        ser_blocks: &HashMap<Label, LayoutBlock>,
    ) -> Result<Vec<StackMapFrame>, Error> {
        let mut needs_frame: HashSet<Label> = HashSet::new();
        for block in ser_blocks.values() {
            match block.branch_end.jump_targets() {
                JumpTargets::None => (),
                JumpTargets::Regular(target) | JumpTargets::Wide(target) => {
                    needs_frame.insert(target);
                }
                JumpTargets::WideMany(targets) => needs_frame.extend(targets),
            }
        }
        for (_, _, handler, _) in &self.try_catches {
            needs_frame.insert(*handler);
        }
        let mut previous_fell_through = true;
        let mut frame_labels: Vec<Label> = vec![];
        for label in &self.block_order {
            if !previous_fell_through || needs_frame.contains(label) {
                if *label != self.block_order[0] || needs_frame.contains(label) {
                    frame_labels.push(*label);
                }
            }
            previous_fell_through = ser_blocks[label].branch_end.fallthrough_target().is_some();
        }

        /// Entry frame for a label, chasing through widening trampolines and
        /// falling back to the dead-stub frame
        fn frame_for(
            label: Label,
            computation: &FrameComputation,
            ser_blocks: &HashMap<Label, LayoutBlock>,
        ) -> FrameState {
            let mut label = label;
            loop {
                if let Some(frame) = computation.block_frames.get(&label) {
                    return frame.clone();
                }
                let block = &ser_blocks[&label];
                if block.instructions.is_empty() {
                    match block.branch_end.jump_targets() {
                        JumpTargets::Regular(target) | JumpTargets::Wide(target) => {
                            label = target;
                            continue;
                        }
                        _ => (),
                    }
                }
                return FrameState {
                    locals: vec![],
                    stack: vec![VType::Object(RefType::Object(BinaryName::THROWABLE))],
                };
            }
        }

        let mut wire_frames: Vec<(u16, Vec<WireType>, Vec<WireType>)> = vec![];
        for label in frame_labels {
            let offset = self.pc(label)?;
            let frame = frame_for(label, computation, ser_blocks);
            let (locals, stack) = self.frame_state_to_wire(&frame)?;
            wire_frames.push((offset.0, locals, stack));
        }

        let entry_frame = FrameState::entry_frame(
            &self.class.this_class_name()?,
            &self.descriptor,
            self.is_static,
            self.is_init,
        );
        let (initial_locals, _) = self.frame_state_to_wire(&entry_frame)?;
        Ok(delta_encode_frames(wire_frames, initial_locals))
    }

    /// Stack map frames passed through from `visit_frame` events
    fn supplied_stack_map(&self, this_class: &BinaryName) -> Result<Vec<StackMapFrame>, Error> {
        if self.supplied_frames.is_empty() {
            return Ok(vec![]);
        }

        let mut wire_frames: Vec<(u16, Vec<WireType>, Vec<WireType>)> = vec![];
        for (label, frame) in &self.supplied_frames {
            let offset = self.pc(*label)?;
            let locals = frame
                .locals
                .iter()
                .map(|vtype| self.event_type_to_wire(vtype))
                .collect::<Result<Vec<WireType>, Error>>()?;
            let stack = frame
                .stack
                .iter()
                .map(|vtype| self.event_type_to_wire(vtype))
                .collect::<Result<Vec<WireType>, Error>>()?;
            wire_frames.push((offset.0, locals, stack));
        }
        wire_frames.sort_by_key(|(offset, _, _)| *offset);

        let entry_frame =
            FrameState::entry_frame(this_class, &self.descriptor, self.is_static, self.is_init);
        let (initial_locals, _) = self.frame_state_to_wire(&entry_frame)?;
        Ok(delta_encode_frames(wire_frames, initial_locals))
    }

    /// Collapse a slot-indexed frame into wire entries: the continuation
    /// slot after a wide type is implicit on the wire, and trailing unusable
    /// slots carry no information
    fn frame_state_to_wire(
        &self,
        frame: &FrameState,
    ) -> Result<(Vec<WireType>, Vec<WireType>), Error> {
        let mut locals: Vec<WireType> = vec![];
        let mut skip_continuation = false;
        for slot in &frame.locals {
            if skip_continuation {
                skip_continuation = false;
                continue;
            }
            skip_continuation = slot.width() == 2;
            locals.push(self.engine_type_to_wire(slot)?);
        }
        while let Some(WireType::Top) = locals.last() {
            locals.pop();
        }

        let stack = frame
            .stack
            .iter()
            .map(|vtype| self.engine_type_to_wire(vtype))
            .collect::<Result<Vec<WireType>, Error>>()?;
        Ok((locals, stack))
    }

    fn engine_type_to_wire(&self, vtype: &VType) -> Result<WireType, Error> {
        vtype.map(
            |ref_type| self.class.ref_type_index(ref_type),
            |site: &UninitializedSite| {
                let block_offset = self
                    .arena
                    .offset(site.block)
                    .ok_or(Error::UnresolvedLabel(site.block))?;
                Ok(BytecodeIndex((block_offset.0 + site.offset_in_block.0) as u16))
            },
        )
    }

    fn event_type_to_wire(&self, vtype: &VerificationTypeEvent) -> Result<WireType, Error> {
        vtype.map(
            |ref_type| self.class.ref_type_index(ref_type),
            |label| self.pc(*label),
        )
    }

    /// Exact max stack/locals via a lightweight height simulation: no types,
    /// no merging, just slot counts propagated over the block graph
    fn walk_stack_heights(
        &self,
        handlers_by_block: &HashMap<Label, Vec<(Label, RefType<BinaryName>)>>,
    ) -> Result<(usize, usize), Error> {
        let argument_slots = self.descriptor.parameter_length(!self.is_static);
        let mut max_locals = argument_slots;
        let mut max_stack = 0usize;

        // Locals are counted over every instruction, reachable or not: dead
        // code is still emitted and still addresses its slots
        for block in self.blocks.values() {
            for insn in &block.instructions {
                if let Some(highest_slot) = highest_local_slot(insn) {
                    max_locals = max_locals.max(highest_slot);
                }
            }
        }

        let mut entry_heights: HashMap<Label, isize> = HashMap::new();
        let entry_label = self.block_order[0];
        entry_heights.insert(entry_label, 0);
        let mut worklist: VecDeque<Label> = VecDeque::from([entry_label]);

        let propagate =
            |target: Label,
             height: isize,
             entry_heights: &mut HashMap<Label, isize>,
             worklist: &mut VecDeque<Label>| {
                let known = entry_heights.entry(target).or_insert(isize::MIN);
                if height > *known {
                    *known = height;
                    worklist.push_back(target);
                }
            };

        while let Some(label) = worklist.pop_front() {
            let block = self
                .blocks
                .get(&label)
                .ok_or(Error::UnresolvedLabel(label))?;
            let mut height = entry_heights[&label];
            max_stack = max_stack.max(height.max(0) as usize);

            for insn in &block.instructions {
                let (pops, pushes) = stack_effect(insn);
                height = height - pops as isize + pushes as isize;
                max_stack = max_stack.max(height.max(0) as usize);
            }
            height -= branch_pops(&block.branch_end) as isize;

            for (handler, _) in handlers_by_block.get(&label).into_iter().flatten() {
                max_stack = max_stack.max(1);
                propagate(*handler, 1, &mut entry_heights, &mut worklist);
            }
            if let Some(fallthrough) = block.branch_end.fallthrough_target() {
                propagate(fallthrough, height, &mut entry_heights, &mut worklist);
            }
            match block.branch_end.jump_targets() {
                JumpTargets::None => (),
                JumpTargets::Regular(target) | JumpTargets::Wide(target) => {
                    propagate(target, height, &mut entry_heights, &mut worklist)
                }
                JumpTargets::WideMany(targets) => {
                    for target in targets {
                        propagate(target, height, &mut entry_heights, &mut worklist);
                    }
                }
            }
        }

        Ok((max_stack, max_locals))
    }
}

impl<'a, 'h> MethodVisitor for MethodWriter<'a, 'h> {
    fn visit_signature(&mut self, signature: &str) -> Result<(), Error> {
        let signature = self.class.constants.get_utf8(signature)?;
        let attribute = self
            .class
            .constants
            .get_attribute(crate::class_file::Signature { signature })?;
        self.attributes.push(attribute);
        Ok(())
    }

    fn visit_code(&mut self) -> Result<(), Error> {
        if self.has_code {
            return Err(Error::VisitOrder("visit_code called twice"));
        }
        self.has_code = true;
        let entry = self.arena.fresh_label();
        self.current = Some((entry, vec![]));
        Ok(())
    }

    fn visit_label(&mut self, label: Label) -> Result<(), Error> {
        match self.current.take() {
            // The synthetic entry block collapses into the first label the
            // caller places, instead of leaving an unnamed empty block
            Some((open_label, instructions))
                if instructions.is_empty()
                    && self.block_order.is_empty()
                    && open_label.is_synthetic() =>
            {
                self.current = Some((label, instructions));
                Ok(())
            }
            Some((open_label, instructions)) => {
                self.current = Some((open_label, instructions));
                self.close_current(BranchInstruction::FallThrough(label))?;
                self.current = Some((label, vec![]));
                Ok(())
            }
            None => {
                self.current = Some((label, vec![]));
                Ok(())
            }
        }
    }

    fn visit_frame(&mut self, frame: &FrameEvent) -> Result<(), Error> {
        if self.class.options.compute_frames() {
            return Ok(());
        }
        let label = match &self.current {
            Some((label, instructions)) if instructions.is_empty() => *label,
            _ => return Err(Error::VisitOrder("visit_frame must follow visit_label")),
        };
        self.supplied_frames.insert(label, frame.clone());
        Ok(())
    }

    fn visit_instruction(&mut self, insn: &SymbolicInstruction) -> Result<(), Error> {
        if !self.has_code {
            return Err(Error::VisitOrder("instruction before visit_code"));
        }
        self.current_block().push(insn.clone());
        Ok(())
    }

    fn visit_branch(&mut self, insn: &BranchEvent) -> Result<(), Error> {
        if !self.has_code {
            return Err(Error::VisitOrder("instruction before visit_code"));
        }
        // Make sure a block is open, then close it with this branch; a
        // conditional's implicit fallthrough opens the next block
        let _ = self.current_block();
        let branch =
            insn.map_labels(|label| *label, |label| *label, |_| self.arena.fresh_label());
        let fallthrough = branch.fallthrough_target();
        self.close_current(branch)?;
        if let Some(next) = fallthrough {
            self.current = Some((next, vec![]));
        }
        Ok(())
    }

    fn visit_try_catch(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&RefType<BinaryName>>,
    ) -> Result<(), Error> {
        self.try_catches
            .push((start, end, handler, catch_type.cloned()));
        Ok(())
    }

    fn visit_line_number(&mut self, line: u16, start: Label) -> Result<(), Error> {
        self.line_numbers.push((line, start));
        Ok(())
    }

    fn visit_local_variable(
        &mut self,
        name: &str,
        descriptor: &FieldType<BinaryName>,
        start: Label,
        end: Label,
        index: u16,
    ) -> Result<(), Error> {
        self.local_variables
            .push((name.to_string(), descriptor.clone(), start, end, index));
        Ok(())
    }

    fn visit_maxs(&mut self, max_stack: u16, max_locals: u16) -> Result<(), Error> {
        self.declared_maxs = Some((max_stack, max_locals));
        Ok(())
    }

    fn visit_attribute(&mut self, attribute: &RawAttribute) -> Result<(), Error> {
        let attribute = self.class.raw_attribute(attribute)?;
        self.attributes.push(attribute);
        Ok(())
    }

    fn visit_end(&mut self) -> Result<(), Error> {
        if self.has_code {
            let code = self.finish_code()?;
            self.attributes.push(code);
        }
        self.class.state.borrow_mut().methods.push(crate::class_file::Method {
            access_flags: self.access_flags,
            name_index: self.name_index,
            descriptor_index: self.descriptor_index,
            attributes: std::mem::take(&mut self.attributes),
        });
        Ok(())
    }
}

/// Emit one block-closing branch, resolving backward targets immediately and
/// queueing patch sites for forward ones
fn emit_branch(
    branch: &SymbolicBranch,
    code: &mut Vec<u8>,
    arena: &mut LabelArena,
) -> Result<(), Error> {
    use BranchInstruction::*;

    let base = code.len();
    let short_target = |arena: &mut LabelArena, label: Label, site: usize| -> i16 {
        arena.reference(label);
        match arena.offset(label) {
            Some(target) => i16::try_from(target.0 as i64 - base as i64)
                .expect("short jump should have been widened"),
            None => {
                arena.add_patch(label, site, base, PatchKind::Short);
                0
            }
        }
    };

    match branch {
        If(_, label, _) | IfICmp(_, label, _) | IfACmp(_, label, _) | IfNull(_, label, _)
        | Goto(label) => {
            let relative = short_target(arena, *label, base + 1);
            branch
                .map_labels(|_| relative, |_| 0i32, |_| ())
                .serialize(code)
                .map_err(Error::IoError)?;
        }
        GotoW(label) => {
            arena.reference(*label);
            let relative: i32 = match arena.offset(*label) {
                Some(target) => {
                    i32::try_from(target.0 as i64 - base as i64).expect("wide jump overflow")
                }
                None => {
                    arena.add_patch(*label, base + 1, base, PatchKind::Wide);
                    0
                }
            };
            branch
                .map_labels(|_| 0i16, |_| relative, |_| ())
                .serialize(code)
                .map_err(Error::IoError)?;
        }
        TableSwitch {
            padding,
            default,
            low,
            targets,
        } => {
            code.push(0xaa);
            code.extend(std::iter::repeat(0u8).take(*padding as usize));
            emit_wide_target(*default, base, code, arena).map_err(Error::IoError)?;
            low.serialize(code).map_err(Error::IoError)?;
            (low + targets.len() as i32 - 1)
                .serialize(code)
                .map_err(Error::IoError)?;
            for target in targets {
                emit_wide_target(*target, base, code, arena).map_err(Error::IoError)?;
            }
        }
        LookupSwitch {
            padding,
            default,
            targets,
        } => {
            code.push(0xab);
            code.extend(std::iter::repeat(0u8).take(*padding as usize));
            emit_wide_target(*default, base, code, arena).map_err(Error::IoError)?;
            (targets.len() as i32).serialize(code).map_err(Error::IoError)?;
            for (key, target) in targets {
                key.serialize(code).map_err(Error::IoError)?;
                emit_wide_target(*target, base, code, arena).map_err(Error::IoError)?;
            }
        }
        IReturn | LReturn | FReturn | DReturn | AReturn | Return | AThrow | FallThrough(_) => {
            branch
                .map_labels(|_| 0i16, |_| 0i32, |_| ())
                .serialize(code)
                .map_err(Error::IoError)?;
        }
    }
    Ok(())
}

fn emit_wide_target(
    label: Label,
    base: usize,
    code: &mut Vec<u8>,
    arena: &mut LabelArena,
) -> std::io::Result<()> {
    arena.reference(label);
    match arena.offset(label) {
        Some(target) => {
            let relative = i32::try_from(target.0 as i64 - base as i64).expect("wide jump overflow");
            relative.serialize(code)
        }
        None => {
            arena.add_patch(label, code.len(), base, PatchKind::Wide);
            0i32.serialize(code)
        }
    }
}

/// Delta-compress wire frames against each other (and the implicit initial
/// frame), choosing the most compact encoding that expresses each transition
fn delta_encode_frames(
    frames: Vec<(u16, Vec<WireType>, Vec<WireType>)>,
    initial_locals: Vec<WireType>,
) -> Vec<StackMapFrame> {
    let mut stack_map_frames = vec![];
    let mut previous_locals = initial_locals;
    let mut previous_offset: Option<u16> = None;

    for (offset, locals, stack) in frames {
        let offset_delta = match previous_offset {
            None => offset,
            Some(previous) if offset > previous => offset - previous - 1,
            Some(_) => continue,
        };
        let frame = select_stack_map_frame(offset_delta, locals, stack, &previous_locals);
        previous_locals = match &frame {
            StackMapFrame::Full { locals, .. } => locals.clone(),
            StackMapFrame::AppendLocalsNoStack { locals, .. } => {
                let mut extended = previous_locals;
                extended.extend(locals.iter().cloned());
                extended
            }
            StackMapFrame::ChopLocalsNoStack { chopped_k, .. } => {
                let new_len = previous_locals.len() - *chopped_k as usize;
                previous_locals.truncate(new_len);
                previous_locals
            }
            StackMapFrame::SameLocalsNoStack { .. }
            | StackMapFrame::SameLocalsOneStack { .. } => previous_locals,
        };
        previous_offset = Some(offset);
        stack_map_frames.push(frame);
    }

    stack_map_frames
}

/// Pick the most compact stack map frame variant for a transition
fn select_stack_map_frame(
    offset_delta: u16,
    locals: Vec<WireType>,
    stack: Vec<WireType>,
    previous_locals: &[WireType],
) -> StackMapFrame {
    match stack.len() {
        0 => {
            let this_len = locals.len();
            let previous_len = previous_locals.len();

            if this_len <= previous_len {
                let chopped = previous_len - this_len;
                let is_prefix = locals.iter().zip(previous_locals.iter()).all(|(a, b)| a == b);
                if is_prefix && chopped == 0 {
                    return StackMapFrame::SameLocalsNoStack { offset_delta };
                }
                if is_prefix && chopped < 4 {
                    return StackMapFrame::ChopLocalsNoStack {
                        offset_delta,
                        chopped_k: chopped as u8,
                    };
                }
            } else if this_len - previous_len < 4 {
                let previous_is_prefix = previous_locals
                    .iter()
                    .zip(locals.iter())
                    .all(|(a, b)| a == b);
                if previous_is_prefix {
                    return StackMapFrame::AppendLocalsNoStack {
                        offset_delta,
                        locals: locals[previous_len..].to_vec(),
                    };
                }
            }
        }
        1 if locals[..] == *previous_locals => {
            return StackMapFrame::SameLocalsOneStack {
                offset_delta,
                stack: stack.into_iter().next().unwrap(),
            };
        }
        _ => (),
    }

    StackMapFrame::Full {
        offset_delta,
        locals,
        stack,
    }
}

/// Stack slots an instruction pops and pushes (`long`/`double` count as two)
fn stack_effect(insn: &SymbolicInstruction) -> (usize, usize) {
    use Instruction::*;

    fn constant_width(data: &crate::code::ConstantData) -> usize {
        match data {
            crate::code::ConstantData::Long(_) | crate::code::ConstantData::Double(_) => 2,
            crate::code::ConstantData::Dynamic(dynamic) => {
                VType::from(&dynamic.descriptor).width()
            }
            _ => 1,
        }
    }

    fn field_width(field: &crate::code::FieldRef) -> usize {
        VType::from(&field.descriptor).width()
    }

    fn return_width(descriptor: &MethodDescriptor<BinaryName>) -> usize {
        descriptor
            .return_type
            .as_ref()
            .map(|return_type| VType::from(return_type).width())
            .unwrap_or(0)
    }

    match insn {
        Nop | IInc(_, _) => (0, 0),
        AConstNull | IConstM1 | IConst0 | IConst1 | IConst2 | IConst3 | IConst4 | IConst5
        | FConst0 | FConst1 | FConst2 | BiPush(_) | SiPush(_) => (0, 1),
        LConst0 | LConst1 | DConst0 | DConst1 => (0, 2),
        Ldc(data) | Ldc2(data) => (0, constant_width(data)),
        ILoad(_) | FLoad(_) | ALoad(_) => (0, 1),
        LLoad(_) | DLoad(_) => (0, 2),
        IALoad | FALoad | AALoad | BALoad | CALoad | SALoad => (2, 1),
        LALoad | DALoad => (2, 2),
        IStore(_) | FStore(_) | AStore(_) => (1, 0),
        LStore(_) | DStore(_) => (2, 0),
        IAStore | FAStore | AAStore | BAStore | CAStore | SAStore => (3, 0),
        LAStore | DAStore => (4, 0),
        Pop => (1, 0),
        Pop2 => (2, 0),
        Dup => (1, 2),
        DupX1 => (2, 3),
        DupX2 => (3, 4),
        Dup2 => (2, 4),
        Dup2X1 => (3, 5),
        Dup2X2 => (4, 6),
        Swap => (2, 2),
        IAdd | ISub | IMul | IDiv | IRem | IAnd | IOr | IXor | ISh(_) | FAdd | FSub | FMul
        | FDiv | FRem => (2, 1),
        LAdd | LSub | LMul | LDiv | LRem | LAnd | LOr | LXor | DAdd | DSub | DMul | DDiv
        | DRem => (4, 2),
        LSh(_) => (3, 2),
        INeg | FNeg | I2B | I2C | I2S | I2F | F2I => (1, 1),
        LNeg | DNeg | L2D | D2L => (2, 2),
        I2L | I2D | F2L | F2D => (1, 2),
        L2I | L2F | D2I | D2F => (2, 1),
        LCmp | DCmp(_) => (4, 1),
        FCmp(_) => (2, 1),
        GetStatic(field) => (0, field_width(field)),
        PutStatic(field) => (field_width(field), 0),
        GetField(field) => (1, field_width(field)),
        PutField(field) => (1 + field_width(field), 0),
        Invoke(invoke_type, method) => {
            let has_receiver = !matches!(invoke_type, crate::code::InvokeType::Static);
            (
                method.descriptor.parameter_length(has_receiver),
                return_width(&method.descriptor),
            )
        }
        InvokeDynamic(indy) => (
            indy.descriptor.parameter_length(false),
            return_width(&indy.descriptor),
        ),
        New(_) => (0, 1),
        NewArray(_) | ANewArray(_) | ArrayLength | CheckCast(_) | InstanceOf(_) => (1, 1),
        MultiANewArray(_, dimensions) => (*dimensions as usize, 1),
        MonitorEnter | MonitorExit => (1, 0),
    }
}

/// Slots a branch instruction pops before transferring control
fn branch_pops<Lbl, LblWide, LblNext>(branch: &BranchInstruction<Lbl, LblWide, LblNext>) -> usize {
    use BranchInstruction::*;
    match branch {
        Goto(_) | GotoW(_) | Return | FallThrough(_) => 0,
        If(_, _, _) | IfNull(_, _, _) | TableSwitch { .. } | LookupSwitch { .. } | IReturn
        | FReturn | AReturn | AThrow => 1,
        IfICmp(_, _, _) | IfACmp(_, _, _) => 2,
        LReturn | DReturn => 2,
    }
}

/// One past the highest local slot an instruction touches
fn highest_local_slot(insn: &SymbolicInstruction) -> Option<usize> {
    use Instruction::*;
    match insn {
        ILoad(index) | FLoad(index) | ALoad(index) | IStore(index) | FStore(index)
        | AStore(index) | IInc(index, _) => Some(*index as usize + 1),
        LLoad(index) | DLoad(index) | LStore(index) | DStore(index) => Some(*index as usize + 2),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn object(index: u16) -> WireType {
        WireType::Object(ClassConstantIndex(ConstantIndex(index)))
    }

    #[test]
    fn same_frame_when_nothing_changes() {
        let previous = vec![object(2), WireType::Integer];
        let frame = select_stack_map_frame(5, previous.clone(), vec![], &previous);
        assert_eq!(frame, StackMapFrame::SameLocalsNoStack { offset_delta: 5 });
    }

    #[test]
    fn one_stack_item_uses_compact_form() {
        let previous = vec![object(2)];
        let frame = select_stack_map_frame(9, previous.clone(), vec![WireType::Integer], &previous);
        assert_eq!(
            frame,
            StackMapFrame::SameLocalsOneStack {
                offset_delta: 9,
                stack: WireType::Integer,
            }
        );
    }

    #[test]
    fn appended_and_chopped_locals() {
        let previous = vec![object(2)];
        let appended = vec![object(2), WireType::Integer, WireType::Long];
        let frame = select_stack_map_frame(0, appended.clone(), vec![], &previous);
        assert_eq!(
            frame,
            StackMapFrame::AppendLocalsNoStack {
                offset_delta: 0,
                locals: vec![WireType::Integer, WireType::Long],
            }
        );

        let frame = select_stack_map_frame(0, previous.clone(), vec![], &appended);
        assert_eq!(
            frame,
            StackMapFrame::ChopLocalsNoStack {
                offset_delta: 0,
                chopped_k: 2,
            }
        );
    }

    #[test]
    fn incompatible_locals_fall_back_to_full() {
        let previous = vec![object(2), WireType::Integer];
        let locals = vec![object(3), WireType::Integer];
        let frame = select_stack_map_frame(1, locals.clone(), vec![], &previous);
        assert_eq!(
            frame,
            StackMapFrame::Full {
                offset_delta: 1,
                locals,
                stack: vec![],
            }
        );

        // Four appended locals are too many for the compact form
        let many: Vec<WireType> = std::iter::repeat(WireType::Integer).take(6).collect();
        assert!(matches!(
            select_stack_map_frame(1, many, vec![], &previous),
            StackMapFrame::Full { .. }
        ));
    }

    #[test]
    fn delta_chain_offsets() {
        let frames = vec![
            (4u16, vec![], vec![]),
            (10u16, vec![], vec![WireType::Integer]),
        ];
        let encoded = delta_encode_frames(frames, vec![]);
        assert_eq!(
            encoded,
            vec![
                StackMapFrame::SameLocalsNoStack { offset_delta: 4 },
                StackMapFrame::SameLocalsOneStack {
                    offset_delta: 5,
                    stack: WireType::Integer,
                },
            ]
        );
    }

    #[test]
    fn invoke_stack_effect_counts_slots() {
        use crate::code::MethodRef;
        use crate::descriptors::ParseDescriptor;

        let method = MethodRef {
            class: RefType::Object(BinaryName::OBJECT),
            name: UnqualifiedName::INIT,
            descriptor: MethodDescriptor::parse("(IJ)D").unwrap(),
            is_interface: false,
        };
        let insn: SymbolicInstruction =
            Instruction::Invoke(crate::code::InvokeType::Virtual, method);
        assert_eq!(stack_effect(&insn), (4, 2), "receiver + int + long in, double out");
    }
}
