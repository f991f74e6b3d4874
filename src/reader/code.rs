//! Decoding of the `Code` attribute
//!
//! Code is decoded in two passes. The first pass walks the bytecode once to
//! find every instruction boundary and every offset something refers to
//! (jump targets, exception ranges and handlers, stack map offsets,
//! `new` sites named by uninitialized verification types, debug tables).
//! Labels are created once per offset and cached, so two references to the
//! same offset always yield the same label. The second pass emits visitor
//! events in program order.

use crate::code::{
    BranchEvent, BranchInstruction, CompareMode, ConstantData, EqComparison, Instruction,
    InvokeType, Label, LabelGenerator, OrdComparison, ShiftType, SymbolicInstruction,
};
use crate::descriptors::{BaseType, FieldType, MethodDescriptor, ParseDescriptor, RefType};
use crate::errors::{Error, FormatError};
use crate::names::BinaryName;
use crate::reader::{BootstrapTable, ByteCursor, ClassReader, ReaderOptions};
use crate::verifier::{VerificationType, VerificationTypeEvent};
use crate::visitor::{FrameEvent, MethodVisitor};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Verification type as decoded from the wire, with uninitialized sites
/// still as absolute offsets
type ExpVType = VerificationType<RefType<BinaryName>, usize>;

/// Expanded (non-delta) stack map frame
struct ExpFrame {
    locals: Vec<ExpVType>,
    stack: Vec<ExpVType>,
}

/// One decoded instruction, with branch targets as absolute offsets
enum RawInsn {
    Plain(SymbolicInstruction),
    Branch(BranchInstruction<i64, i64, ()>),
}

pub(crate) struct MethodContext<'r> {
    pub this_class: &'r BinaryName,
    pub descriptor: &'r MethodDescriptor<BinaryName>,
    pub is_static: bool,
    pub is_init: bool,
}

pub(crate) fn read_code<V: MethodVisitor>(
    reader: &ClassReader<'_>,
    visitor: &mut V,
    body: &[u8],
    options: ReaderOptions,
    bootstrap: &BootstrapTable,
    ctx: MethodContext<'_>,
) -> Result<(), Error> {
    let mut cursor = ByteCursor::new(body);
    let max_stack = cursor.u16("max stack")?;
    let max_locals = cursor.u16("max locals")?;
    let code_length = cursor.u32("code length")? as usize;
    let code = cursor.take(code_length, "code array")?;

    let exception_count = cursor.u16("exception table length")?;
    let mut exception_table: Vec<(usize, usize, usize, Option<RefType<BinaryName>>)> =
        Vec::with_capacity(exception_count as usize);
    for _ in 0..exception_count {
        let start_pc = cursor.u16("exception start")? as usize;
        let end_pc = cursor.u16("exception end")? as usize;
        let handler_pc = cursor.u16("exception handler")? as usize;
        let catch_index = cursor.u16("exception catch type")?;
        let catch_type = if catch_index == 0 {
            None
        } else {
            Some(reader.class_ref(catch_index)?)
        };
        exception_table.push((start_pc, end_pc, handler_pc, catch_type));
    }

    // Code sub-attributes
    let mut line_numbers: Vec<(usize, u16)> = vec![];
    let mut local_variables: Vec<(String, FieldType<BinaryName>, usize, usize, u16)> = vec![];
    let mut stack_map_body: Option<&[u8]> = None;
    let attribute_count = cursor.u16("code attribute count")?;
    for _ in 0..attribute_count {
        let attr_name = reader.utf8(cursor.u16("attribute name")?)?;
        let length = cursor.u32("attribute length")? as usize;
        let attr_body = cursor.take(length, "attribute body")?;
        let mut attr_cursor = ByteCursor::new(attr_body);
        match attr_name {
            "LineNumberTable" if !options.contains(ReaderOptions::SKIP_DEBUG) => {
                let count = attr_cursor.u16("line number count")?;
                for _ in 0..count {
                    let start_pc = attr_cursor.u16("line number start")? as usize;
                    let line = attr_cursor.u16("line number")?;
                    line_numbers.push((start_pc, line));
                }
            }
            "LocalVariableTable" if !options.contains(ReaderOptions::SKIP_DEBUG) => {
                let count = attr_cursor.u16("local variable count")?;
                for _ in 0..count {
                    let start_pc = attr_cursor.u16("local variable start")? as usize;
                    let var_length = attr_cursor.u16("local variable length")? as usize;
                    let name = reader.utf8(attr_cursor.u16("local variable name")?)?;
                    let descriptor =
                        FieldType::parse(reader.utf8(attr_cursor.u16("local variable descriptor")?)?)?;
                    let index = attr_cursor.u16("local variable slot")?;
                    local_variables.push((
                        name.to_string(),
                        descriptor,
                        start_pc,
                        start_pc + var_length,
                        index,
                    ));
                }
            }
            "StackMapTable" if !options.contains(ReaderOptions::SKIP_FRAMES) => {
                stack_map_body = Some(attr_body);
            }
            other => {
                // Sub-attributes of `Code` this codec has no model for are
                // dropped rather than passed through: their payloads go
                // stale the moment instruction offsets shift
                log::debug!("dropping code attribute {}", other);
            }
        }
    }

    visitor.visit_code()?;

    // First pass: instruction boundaries and decoded instructions
    let mut instructions: Vec<(usize, RawInsn)> = vec![];
    let mut boundaries: HashSet<usize> = HashSet::new();
    let mut code_cursor = ByteCursor::new(code);
    while !code_cursor.at_end() {
        let offset = code_cursor.pos();
        boundaries.insert(offset);
        let insn = decode_instruction(reader, &mut code_cursor, bootstrap)?;
        instructions.push((offset, insn));
    }

    // Expand stack map frames (uninitialized offsets feed label discovery)
    let frames: Vec<(usize, ExpFrame)> = match stack_map_body {
        Some(body) => expand_stack_map(reader, body, &ctx)?,
        None => vec![],
    };

    // Offsets that need labels
    let mut label_offsets: BTreeSet<usize> = BTreeSet::new();
    let reference =
        |offset: usize, allow_end: bool, boundaries: &HashSet<usize>| -> Result<(), FormatError> {
            if boundaries.contains(&offset) || (allow_end && offset == code_length) {
                Ok(())
            } else {
                Err(FormatError::BadBytecodeOffset(offset))
            }
        };
    for (_, insn) in &instructions {
        if let RawInsn::Branch(branch) = insn {
            let mut check = |target: &i64| -> Result<(), FormatError> {
                if *target < 0 || !boundaries.contains(&(*target as usize)) {
                    return Err(FormatError::BadBytecodeOffset(*target as usize));
                }
                label_offsets.insert(*target as usize);
                Ok(())
            };
            match branch.jump_targets() {
                crate::code::JumpTargets::None => (),
                crate::code::JumpTargets::Regular(target)
                | crate::code::JumpTargets::Wide(target) => check(&target)?,
                crate::code::JumpTargets::WideMany(targets) => {
                    for target in &targets {
                        check(target)?;
                    }
                }
            }
        }
    }
    for (start_pc, end_pc, handler_pc, _) in &exception_table {
        reference(*start_pc, false, &boundaries)?;
        reference(*end_pc, true, &boundaries)?;
        reference(*handler_pc, false, &boundaries)?;
        label_offsets.insert(*start_pc);
        label_offsets.insert(*end_pc);
        label_offsets.insert(*handler_pc);
    }
    for (offset, frame) in &frames {
        reference(*offset, false, &boundaries)?;
        label_offsets.insert(*offset);
        for vtype in frame.locals.iter().chain(frame.stack.iter()) {
            if let VerificationType::Uninitialized(site) = vtype {
                reference(*site, false, &boundaries)?;
                label_offsets.insert(*site);
            }
        }
    }
    for (start_pc, _) in &line_numbers {
        reference(*start_pc, true, &boundaries)?;
        label_offsets.insert(*start_pc);
    }
    for (_, _, start_pc, end_pc, _) in &local_variables {
        reference(*start_pc, false, &boundaries)?;
        reference(*end_pc, true, &boundaries)?;
        label_offsets.insert(*start_pc);
        label_offsets.insert(*end_pc);
    }

    // Labels are assigned in offset order, one per offset
    let mut generator = LabelGenerator::new();
    let labels: BTreeMap<usize, Label> = label_offsets
        .iter()
        .map(|offset| (*offset, generator.fresh_label()))
        .collect();
    let label_at = |offset: usize| -> Label { labels[&offset] };

    // Second pass: events in program order
    let mut frames_iter = frames.into_iter().peekable();
    for (offset, insn) in &instructions {
        if let Some(label) = labels.get(offset) {
            visitor.visit_label(*label)?;
        }
        if let Some((frame_offset, _)) = frames_iter.peek() {
            if frame_offset == offset {
                let (_, frame) = frames_iter.next().unwrap();
                let event = FrameEvent {
                    locals: expand_types_to_event(frame.locals, &label_at),
                    stack: expand_types_to_event(frame.stack, &label_at),
                };
                visitor.visit_frame(&event)?;
            }
        }
        match insn {
            RawInsn::Plain(insn) => visitor.visit_instruction(insn)?,
            RawInsn::Branch(branch) => {
                let event: BranchEvent = branch.map_labels(
                    |target| label_at(*target as usize),
                    |target| label_at(*target as usize),
                    |()| (),
                );
                visitor.visit_branch(&event)?;
            }
        }
    }
    if let Some(label) = labels.get(&code_length) {
        visitor.visit_label(*label)?;
    }

    for (start_pc, end_pc, handler_pc, catch_type) in &exception_table {
        visitor.visit_try_catch(
            label_at(*start_pc),
            label_at(*end_pc),
            label_at(*handler_pc),
            catch_type.as_ref(),
        )?;
    }
    for (start_pc, line) in &line_numbers {
        visitor.visit_line_number(*line, label_at(*start_pc))?;
    }
    for (name, descriptor, start_pc, end_pc, index) in &local_variables {
        visitor.visit_local_variable(
            name,
            descriptor,
            label_at(*start_pc),
            label_at(*end_pc),
            *index,
        )?;
    }

    visitor.visit_maxs(max_stack, max_locals)
}

fn expand_types_to_event(
    types: Vec<ExpVType>,
    label_at: &impl Fn(usize) -> Label,
) -> Vec<VerificationTypeEvent> {
    types
        .into_iter()
        .map(|vtype| {
            vtype
                .map::<_, _, std::convert::Infallible>(
                    |class| Ok(class.clone()),
                    |site| Ok(label_at(*site)),
                )
                .unwrap()
        })
        .collect()
}

/// Decode one instruction at the cursor
fn decode_instruction(
    reader: &ClassReader<'_>,
    cursor: &mut ByteCursor<'_>,
    bootstrap: &BootstrapTable,
) -> Result<RawInsn, Error> {
    use Instruction::*;

    let insn_start = cursor.pos() as i64;
    let opcode = cursor.u8("opcode")?;

    let plain = |insn: SymbolicInstruction| Ok(RawInsn::Plain(insn));

    match opcode {
        0x00 => plain(Nop),
        0x01 => plain(AConstNull),
        0x02 => plain(IConstM1),
        0x03 => plain(IConst0),
        0x04 => plain(IConst1),
        0x05 => plain(IConst2),
        0x06 => plain(IConst3),
        0x07 => plain(IConst4),
        0x08 => plain(IConst5),
        0x09 => plain(LConst0),
        0x0a => plain(LConst1),
        0x0b => plain(FConst0),
        0x0c => plain(FConst1),
        0x0d => plain(FConst2),
        0x0e => plain(DConst0),
        0x0f => plain(DConst1),
        0x10 => plain(BiPush(cursor.i8("bipush operand")?)),
        0x11 => plain(SiPush(cursor.i16("sipush operand")?)),
        0x12 => {
            let index = cursor.u8("ldc operand")? as u16;
            plain(Ldc(reader.constant_data(index, bootstrap, 0)?))
        }
        0x13 => {
            let index = cursor.u16("ldc_w operand")?;
            plain(Ldc(reader.constant_data(index, bootstrap, 0)?))
        }
        0x14 => {
            let index = cursor.u16("ldc2_w operand")?;
            plain(Ldc2(reader.constant_data(index, bootstrap, 0)?))
        }
        0x15 => plain(ILoad(cursor.u8("iload operand")? as u16)),
        0x16 => plain(LLoad(cursor.u8("lload operand")? as u16)),
        0x17 => plain(FLoad(cursor.u8("fload operand")? as u16)),
        0x18 => plain(DLoad(cursor.u8("dload operand")? as u16)),
        0x19 => plain(ALoad(cursor.u8("aload operand")? as u16)),
        0x1a..=0x1d => plain(ILoad((opcode - 0x1a) as u16)),
        0x1e..=0x21 => plain(LLoad((opcode - 0x1e) as u16)),
        0x22..=0x25 => plain(FLoad((opcode - 0x22) as u16)),
        0x26..=0x29 => plain(DLoad((opcode - 0x26) as u16)),
        0x2a..=0x2d => plain(ALoad((opcode - 0x2a) as u16)),
        0x2e => plain(IALoad),
        0x2f => plain(LALoad),
        0x30 => plain(FALoad),
        0x31 => plain(DALoad),
        0x32 => plain(AALoad),
        0x33 => plain(BALoad),
        0x34 => plain(CALoad),
        0x35 => plain(SALoad),
        0x36 => plain(IStore(cursor.u8("istore operand")? as u16)),
        0x37 => plain(LStore(cursor.u8("lstore operand")? as u16)),
        0x38 => plain(FStore(cursor.u8("fstore operand")? as u16)),
        0x39 => plain(DStore(cursor.u8("dstore operand")? as u16)),
        0x3a => plain(AStore(cursor.u8("astore operand")? as u16)),
        0x3b..=0x3e => plain(IStore((opcode - 0x3b) as u16)),
        0x3f..=0x42 => plain(LStore((opcode - 0x3f) as u16)),
        0x43..=0x46 => plain(FStore((opcode - 0x43) as u16)),
        0x47..=0x4a => plain(DStore((opcode - 0x47) as u16)),
        0x4b..=0x4e => plain(AStore((opcode - 0x4b) as u16)),
        0x4f => plain(IAStore),
        0x50 => plain(LAStore),
        0x51 => plain(FAStore),
        0x52 => plain(DAStore),
        0x53 => plain(AAStore),
        0x54 => plain(BAStore),
        0x55 => plain(CAStore),
        0x56 => plain(SAStore),
        0x57 => plain(Pop),
        0x58 => plain(Pop2),
        0x59 => plain(Dup),
        0x5a => plain(DupX1),
        0x5b => plain(DupX2),
        0x5c => plain(Dup2),
        0x5d => plain(Dup2X1),
        0x5e => plain(Dup2X2),
        0x5f => plain(Swap),
        0x60 => plain(IAdd),
        0x61 => plain(LAdd),
        0x62 => plain(FAdd),
        0x63 => plain(DAdd),
        0x64 => plain(ISub),
        0x65 => plain(LSub),
        0x66 => plain(FSub),
        0x67 => plain(DSub),
        0x68 => plain(IMul),
        0x69 => plain(LMul),
        0x6a => plain(FMul),
        0x6b => plain(DMul),
        0x6c => plain(IDiv),
        0x6d => plain(LDiv),
        0x6e => plain(FDiv),
        0x6f => plain(DDiv),
        0x70 => plain(IRem),
        0x71 => plain(LRem),
        0x72 => plain(FRem),
        0x73 => plain(DRem),
        0x74 => plain(INeg),
        0x75 => plain(LNeg),
        0x76 => plain(FNeg),
        0x77 => plain(DNeg),
        0x78 => plain(ISh(ShiftType::Left)),
        0x79 => plain(LSh(ShiftType::Left)),
        0x7a => plain(ISh(ShiftType::ArithmeticRight)),
        0x7b => plain(LSh(ShiftType::ArithmeticRight)),
        0x7c => plain(ISh(ShiftType::LogicalRight)),
        0x7d => plain(LSh(ShiftType::LogicalRight)),
        0x7e => plain(IAnd),
        0x7f => plain(LAnd),
        0x80 => plain(IOr),
        0x81 => plain(LOr),
        0x82 => plain(IXor),
        0x83 => plain(LXor),
        0x84 => {
            let index = cursor.u8("iinc operand")? as u16;
            let diff = cursor.i8("iinc increment")? as i16;
            plain(IInc(index, diff))
        }
        0x85 => plain(I2L),
        0x86 => plain(I2F),
        0x87 => plain(I2D),
        0x88 => plain(L2I),
        0x89 => plain(L2F),
        0x8a => plain(L2D),
        0x8b => plain(F2I),
        0x8c => plain(F2L),
        0x8d => plain(F2D),
        0x8e => plain(D2I),
        0x8f => plain(D2L),
        0x90 => plain(D2F),
        0x91 => plain(I2B),
        0x92 => plain(I2C),
        0x93 => plain(I2S),
        0x94 => plain(LCmp),
        0x95 => plain(FCmp(CompareMode::L)),
        0x96 => plain(FCmp(CompareMode::G)),
        0x97 => plain(DCmp(CompareMode::L)),
        0x98 => plain(DCmp(CompareMode::G)),
        0x99..=0x9e => {
            let comparison = ord_comparison(opcode - 0x99);
            let target = insn_start + cursor.i16("branch offset")? as i64;
            Ok(RawInsn::Branch(BranchInstruction::If(comparison, target, ())))
        }
        0x9f..=0xa4 => {
            let comparison = ord_comparison(opcode - 0x9f);
            let target = insn_start + cursor.i16("branch offset")? as i64;
            Ok(RawInsn::Branch(BranchInstruction::IfICmp(
                comparison, target, (),
            )))
        }
        0xa5 | 0xa6 => {
            let comparison = if opcode == 0xa5 {
                EqComparison::EQ
            } else {
                EqComparison::NE
            };
            let target = insn_start + cursor.i16("branch offset")? as i64;
            Ok(RawInsn::Branch(BranchInstruction::IfACmp(
                comparison, target, (),
            )))
        }
        0xa7 => {
            let target = insn_start + cursor.i16("goto offset")? as i64;
            Ok(RawInsn::Branch(BranchInstruction::Goto(target)))
        }
        0xa8 => Err(FormatError::UnsupportedInstruction {
            opcode,
            mnemonic: "jsr",
        }
        .into()),
        0xa9 => Err(FormatError::UnsupportedInstruction {
            opcode,
            mnemonic: "ret",
        }
        .into()),
        0xaa => {
            let padding = (4 - ((insn_start as usize + 1) % 4)) % 4;
            cursor.skip(padding, "tableswitch padding")?;
            let default = insn_start + cursor.i32("tableswitch default")? as i64;
            let low = cursor.i32("tableswitch low")?;
            let high = cursor.i32("tableswitch high")?;
            if high < low {
                return Err(FormatError::BadAttributeLength { attribute: "Code" }.into());
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            let mut targets = Vec::with_capacity(count);
            for _ in 0..count {
                targets.push(insn_start + cursor.i32("tableswitch target")? as i64);
            }
            Ok(RawInsn::Branch(BranchInstruction::TableSwitch {
                padding: 0,
                default,
                low,
                targets,
            }))
        }
        0xab => {
            let padding = (4 - ((insn_start as usize + 1) % 4)) % 4;
            cursor.skip(padding, "lookupswitch padding")?;
            let default = insn_start + cursor.i32("lookupswitch default")? as i64;
            let pair_count = cursor.i32("lookupswitch pair count")?;
            if pair_count < 0 {
                return Err(FormatError::BadAttributeLength { attribute: "Code" }.into());
            }
            let mut targets = Vec::with_capacity(pair_count as usize);
            for _ in 0..pair_count {
                let key = cursor.i32("lookupswitch key")?;
                let target = insn_start + cursor.i32("lookupswitch target")? as i64;
                targets.push((key, target));
            }
            Ok(RawInsn::Branch(BranchInstruction::LookupSwitch {
                padding: 0,
                default,
                targets,
            }))
        }
        0xac => Ok(RawInsn::Branch(BranchInstruction::IReturn)),
        0xad => Ok(RawInsn::Branch(BranchInstruction::LReturn)),
        0xae => Ok(RawInsn::Branch(BranchInstruction::FReturn)),
        0xaf => Ok(RawInsn::Branch(BranchInstruction::DReturn)),
        0xb0 => Ok(RawInsn::Branch(BranchInstruction::AReturn)),
        0xb1 => Ok(RawInsn::Branch(BranchInstruction::Return)),
        0xb2 => {
            let field = reader.field_ref(cursor.u16("getstatic operand")?)?;
            plain(GetStatic(field))
        }
        0xb3 => {
            let field = reader.field_ref(cursor.u16("putstatic operand")?)?;
            plain(PutStatic(field))
        }
        0xb4 => {
            let field = reader.field_ref(cursor.u16("getfield operand")?)?;
            plain(GetField(field))
        }
        0xb5 => {
            let field = reader.field_ref(cursor.u16("putfield operand")?)?;
            plain(PutField(field))
        }
        0xb6 => {
            let method = reader.method_ref(cursor.u16("invokevirtual operand")?)?;
            plain(Invoke(InvokeType::Virtual, method))
        }
        0xb7 => {
            let method = reader.method_ref(cursor.u16("invokespecial operand")?)?;
            plain(Invoke(InvokeType::Special, method))
        }
        0xb8 => {
            let method = reader.method_ref(cursor.u16("invokestatic operand")?)?;
            plain(Invoke(InvokeType::Static, method))
        }
        0xb9 => {
            let method = reader.method_ref(cursor.u16("invokeinterface operand")?)?;
            let count = cursor.u8("invokeinterface count")?;
            let _ = cursor.u8("invokeinterface padding")?;
            plain(Invoke(InvokeType::Interface(count), method))
        }
        0xba => {
            let indy = reader.invoke_dynamic(cursor.u16("invokedynamic operand")?, bootstrap)?;
            cursor.skip(2, "invokedynamic padding")?;
            plain(InvokeDynamic(indy))
        }
        0xbb => {
            let class = reader.class_ref(cursor.u16("new operand")?)?;
            plain(New(class))
        }
        0xbc => {
            let atype = cursor.u8("newarray type")?;
            let base_type = match atype {
                4 => BaseType::Boolean,
                5 => BaseType::Char,
                6 => BaseType::Float,
                7 => BaseType::Double,
                8 => BaseType::Byte,
                9 => BaseType::Short,
                10 => BaseType::Int,
                11 => BaseType::Long,
                other => return Err(FormatError::BadNewArrayType(other).into()),
            };
            plain(NewArray(base_type))
        }
        0xbd => {
            let class = reader.class_ref(cursor.u16("anewarray operand")?)?;
            plain(ANewArray(class))
        }
        0xbe => plain(ArrayLength),
        0xbf => Ok(RawInsn::Branch(BranchInstruction::AThrow)),
        0xc0 => {
            let class = reader.class_ref(cursor.u16("checkcast operand")?)?;
            plain(CheckCast(class))
        }
        0xc1 => {
            let class = reader.class_ref(cursor.u16("instanceof operand")?)?;
            plain(InstanceOf(class))
        }
        0xc2 => plain(MonitorEnter),
        0xc3 => plain(MonitorExit),
        0xc4 => {
            let wide_opcode = cursor.u8("wide opcode")?;
            match wide_opcode {
                0x15 => plain(ILoad(cursor.u16("wide iload operand")?)),
                0x16 => plain(LLoad(cursor.u16("wide lload operand")?)),
                0x17 => plain(FLoad(cursor.u16("wide fload operand")?)),
                0x18 => plain(DLoad(cursor.u16("wide dload operand")?)),
                0x19 => plain(ALoad(cursor.u16("wide aload operand")?)),
                0x36 => plain(IStore(cursor.u16("wide istore operand")?)),
                0x37 => plain(LStore(cursor.u16("wide lstore operand")?)),
                0x38 => plain(FStore(cursor.u16("wide fstore operand")?)),
                0x39 => plain(DStore(cursor.u16("wide dstore operand")?)),
                0x3a => plain(AStore(cursor.u16("wide astore operand")?)),
                0x84 => {
                    let index = cursor.u16("wide iinc operand")?;
                    let diff = cursor.i16("wide iinc increment")?;
                    plain(IInc(index, diff))
                }
                0xa9 => Err(FormatError::UnsupportedInstruction {
                    opcode: wide_opcode,
                    mnemonic: "wide ret",
                }
                .into()),
                other => Err(FormatError::UnknownOpcode(other).into()),
            }
        }
        0xc5 => {
            let class = reader.class_ref(cursor.u16("multianewarray operand")?)?;
            let dimensions = cursor.u8("multianewarray dimensions")?;
            plain(MultiANewArray(class, dimensions))
        }
        0xc6 => {
            let target = insn_start + cursor.i16("ifnull offset")? as i64;
            Ok(RawInsn::Branch(BranchInstruction::IfNull(
                EqComparison::EQ,
                target,
                (),
            )))
        }
        0xc7 => {
            let target = insn_start + cursor.i16("ifnonnull offset")? as i64;
            Ok(RawInsn::Branch(BranchInstruction::IfNull(
                EqComparison::NE,
                target,
                (),
            )))
        }
        0xc8 => {
            let target = insn_start + cursor.i32("goto_w offset")? as i64;
            Ok(RawInsn::Branch(BranchInstruction::GotoW(target)))
        }
        0xc9 => Err(FormatError::UnsupportedInstruction {
            opcode,
            mnemonic: "jsr_w",
        }
        .into()),
        other => Err(FormatError::UnknownOpcode(other).into()),
    }
}

fn ord_comparison(offset: u8) -> OrdComparison {
    match offset {
        0 => OrdComparison::EQ,
        1 => OrdComparison::NE,
        2 => OrdComparison::LT,
        3 => OrdComparison::GE,
        4 => OrdComparison::GT,
        _ => OrdComparison::LE,
    }
}

/// Expand the delta-compressed `StackMapTable` into full frames at absolute
/// offsets
fn expand_stack_map(
    reader: &ClassReader<'_>,
    body: &[u8],
    ctx: &MethodContext<'_>,
) -> Result<Vec<(usize, ExpFrame)>, Error> {
    let mut cursor = ByteCursor::new(body);
    let frame_count = cursor.u16("stack map frame count")?;

    // The implicit frame at the front of the chain comes from the method
    // descriptor (entry-indexed: wide types are single entries here)
    let mut locals: Vec<ExpVType> = vec![];
    if ctx.is_init {
        locals.push(VerificationType::UninitializedThis);
    } else if !ctx.is_static {
        locals.push(VerificationType::Object(RefType::Object(
            ctx.this_class.clone(),
        )));
    }
    for parameter in &ctx.descriptor.parameters {
        locals.push(match parameter {
            FieldType::Base(BaseType::Float) => VerificationType::Float,
            FieldType::Base(BaseType::Long) => VerificationType::Long,
            FieldType::Base(BaseType::Double) => VerificationType::Double,
            FieldType::Base(_) => VerificationType::Integer,
            FieldType::Ref(ref_type) => VerificationType::Object(ref_type.clone()),
        });
    }

    let mut frames: Vec<(usize, ExpFrame)> = Vec::with_capacity(frame_count as usize);
    let mut offset: usize = 0;
    for index in 0..frame_count {
        let tag = cursor.u8("stack map frame tag")?;
        let (offset_delta, stack) = match tag {
            0..=63 => (tag as u16, vec![]),
            64..=127 => {
                let stack = vec![read_verification_type(reader, &mut cursor)?];
                ((tag - 64) as u16, stack)
            }
            247 => {
                let offset_delta = cursor.u16("stack map frame offset")?;
                let stack = vec![read_verification_type(reader, &mut cursor)?];
                (offset_delta, stack)
            }
            248..=250 => {
                let chopped = (251 - tag) as usize;
                let offset_delta = cursor.u16("stack map frame offset")?;
                if chopped > locals.len() {
                    return Err(FormatError::BadFrameTag(tag).into());
                }
                locals.truncate(locals.len() - chopped);
                (offset_delta, vec![])
            }
            251 => (cursor.u16("stack map frame offset")?, vec![]),
            252..=254 => {
                let appended = (tag - 251) as usize;
                let offset_delta = cursor.u16("stack map frame offset")?;
                for _ in 0..appended {
                    locals.push(read_verification_type(reader, &mut cursor)?);
                }
                (offset_delta, vec![])
            }
            255 => {
                let offset_delta = cursor.u16("stack map frame offset")?;
                let local_count = cursor.u16("stack map locals count")?;
                locals = (0..local_count)
                    .map(|_| read_verification_type(reader, &mut cursor))
                    .collect::<Result<Vec<ExpVType>, Error>>()?;
                let stack_count = cursor.u16("stack map stack count")?;
                let stack = (0..stack_count)
                    .map(|_| read_verification_type(reader, &mut cursor))
                    .collect::<Result<Vec<ExpVType>, Error>>()?;
                (offset_delta, stack)
            }
            other => return Err(FormatError::BadFrameTag(other).into()),
        };

        offset = if index == 0 {
            offset_delta as usize
        } else {
            offset + offset_delta as usize + 1
        };
        frames.push((
            offset,
            ExpFrame {
                locals: locals.clone(),
                stack,
            },
        ));
    }

    Ok(frames)
}

fn read_verification_type(
    reader: &ClassReader<'_>,
    cursor: &mut ByteCursor<'_>,
) -> Result<ExpVType, Error> {
    let tag = cursor.u8("verification type tag")?;
    Ok(match tag {
        0 => VerificationType::Top,
        1 => VerificationType::Integer,
        2 => VerificationType::Float,
        3 => VerificationType::Double,
        4 => VerificationType::Long,
        5 => VerificationType::Null,
        6 => VerificationType::UninitializedThis,
        7 => VerificationType::Object(reader.class_ref(cursor.u16("object type")?)?),
        8 => VerificationType::Uninitialized(cursor.u16("uninitialized offset")? as usize),
        other => return Err(FormatError::BadVerificationTypeTag(other).into()),
    })
}
