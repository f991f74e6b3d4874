//! End-to-end tests: generate classes through the writer, decode them with
//! the reader, and check that decode → encode → decode preserves the event
//! stream.

use classgraft::access_flags::{ClassAccessFlags, FieldAccessFlags, MethodAccessFlags};
use classgraft::class_file::Version;
use classgraft::code::{
    BranchInstruction, ConstantData, FieldRef, Instruction, InvokeType, LabelGenerator, MethodRef,
    OrdComparison,
};
use classgraft::descriptors::{FieldType, MethodDescriptor, ParseDescriptor, RefType};
use classgraft::errors::{Error, FormatError};
use classgraft::hierarchy::{ClassGraph, ClassGraphArenas};
use classgraft::names::{BinaryName, Name, UnqualifiedName};
use classgraft::reader::{ClassReader, ReaderOptions};
use classgraft::verifier::VerificationType;
use classgraft::visitor::{
    ClassHeader, ClassVisitor, Event, EventRecorder, FieldVisitor, MethodVisitor, RawAttribute,
};
use classgraft::writer::{ClassWriter, WriterOptions};

fn name(text: &str) -> BinaryName {
    BinaryName::from_string(text.to_string()).unwrap()
}

fn uname(text: &str) -> UnqualifiedName {
    UnqualifiedName::from_string(text.to_string()).unwrap()
}

fn header(class_name: &str) -> ClassHeader {
    ClassHeader {
        version: Version::JAVA11,
        access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
        this_class: name(class_name),
        super_class: Some(BinaryName::OBJECT),
        interfaces: vec![],
    }
}

fn decode(class_bytes: &[u8], options: ReaderOptions) -> Vec<Event> {
    let _ = env_logger::builder().is_test(true).try_init();
    let reader = ClassReader::new(class_bytes).expect("decode");
    let mut recorder = EventRecorder::new();
    reader.accept(&mut recorder, options).expect("accept");
    recorder.events()
}

/// `ALOAD 0; RETURN` with computed frames: max stack 1, max locals 1, and no
/// stack map frames at all (single basic block, no merge points)
#[test]
fn minimal_method_has_no_frames() {
    let arenas = ClassGraphArenas::new();
    let graph = ClassGraph::new(&arenas);
    graph.insert_java_lang_core();

    let writer = ClassWriter::new(WriterOptions::COMPUTE_FRAMES).with_hierarchy(&graph);
    let mut class = &writer;
    class.visit_header(&header("me/Minimal")).unwrap();
    let mut method = class
        .visit_method(
            MethodAccessFlags::PUBLIC,
            &uname("nothing"),
            &MethodDescriptor::parse("()V").unwrap(),
            &[],
        )
        .unwrap()
        .unwrap();
    method.visit_code().unwrap();
    method
        .visit_instruction(&Instruction::ALoad(0))
        .unwrap();
    method.visit_branch(&BranchInstruction::Return).unwrap();
    method.visit_end().unwrap();
    class.visit_end().unwrap();
    let class_bytes = writer.into_bytes().unwrap();

    let events = decode(&class_bytes, ReaderOptions::empty());
    assert!(
        events.iter().any(|event| matches!(
            event,
            Event::Maxs {
                max_stack: 1,
                max_locals: 1
            }
        )),
        "expected maxs 1/1 in {:?}",
        events
    );
    assert!(
        !events.iter().any(|event| matches!(event, Event::Frame(_))),
        "a straight-line method needs no stack map frames"
    );
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::Instruction(Instruction::ALoad(0)))));
}

/// Build a class exercising most of the surface: fields with constant
/// values, a constructor with a conditional, exceptions, try/catch, debug
/// tables, raw attributes
fn build_rich_class() -> Vec<u8> {
    let arenas = ClassGraphArenas::new();
    let graph = ClassGraph::new(&arenas);
    graph.insert_java_lang_core();

    let writer = ClassWriter::new(WriterOptions::COMPUTE_FRAMES).with_hierarchy(&graph);
    let mut class = &writer;
    class.visit_header(&header("me/alec/Point")).unwrap();
    class.visit_source("Point.java").unwrap();
    class.visit_nest_member(&name("me/alec/Point$Inner")).unwrap();
    class
        .visit_attribute(&RawAttribute {
            name: String::from("X-Custom"),
            info: vec![1, 2, 3, 4],
        })
        .unwrap();

    let mut field = class
        .visit_field(
            FieldAccessFlags::PUBLIC | FieldAccessFlags::FINAL,
            &uname("x"),
            &FieldType::INT,
        )
        .unwrap()
        .unwrap();
    field.visit_end().unwrap();
    let mut limit = class
        .visit_field(
            FieldAccessFlags::PUBLIC | FieldAccessFlags::STATIC | FieldAccessFlags::FINAL,
            &uname("LIMIT"),
            &FieldType::INT,
        )
        .unwrap()
        .unwrap();
    limit
        .visit_constant_value(&ConstantData::Integer(1024))
        .unwrap();
    limit.visit_end().unwrap();

    // public Point(int x) throws Exception: stores max(x, 0) into the field
    let mut generator = LabelGenerator::new();
    let negative = generator.fresh_label();
    let join = generator.fresh_label();
    let handler = generator.fresh_label();
    let try_start = generator.fresh_label();
    let end = generator.fresh_label();

    let mut constructor = class
        .visit_method(
            MethodAccessFlags::PUBLIC,
            &UnqualifiedName::INIT,
            &MethodDescriptor::parse("(I)V").unwrap(),
            &[name("java/lang/Exception")],
        )
        .unwrap()
        .unwrap();
    constructor.visit_code().unwrap();
    constructor.visit_label(try_start).unwrap();
    constructor.visit_line_number(10, try_start).unwrap();
    constructor
        .visit_instruction(&Instruction::ALoad(0))
        .unwrap();
    constructor
        .visit_instruction(&Instruction::Invoke(
            InvokeType::Special,
            MethodRef {
                class: RefType::Object(BinaryName::OBJECT),
                name: UnqualifiedName::INIT,
                descriptor: MethodDescriptor::parse("()V").unwrap(),
                is_interface: false,
            },
        ))
        .unwrap();
    constructor
        .visit_instruction(&Instruction::ILoad(1))
        .unwrap();
    constructor
        .visit_branch(&BranchInstruction::If(OrdComparison::LT, negative, ()))
        .unwrap();
    constructor
        .visit_instruction(&Instruction::ALoad(0))
        .unwrap();
    constructor
        .visit_instruction(&Instruction::ILoad(1))
        .unwrap();
    constructor
        .visit_branch(&BranchInstruction::Goto(join))
        .unwrap();
    constructor.visit_label(negative).unwrap();
    constructor
        .visit_instruction(&Instruction::ALoad(0))
        .unwrap();
    constructor
        .visit_instruction(&Instruction::IConst0)
        .unwrap();
    constructor.visit_label(join).unwrap();
    constructor
        .visit_instruction(&Instruction::PutField(FieldRef {
            class: name("me/alec/Point"),
            name: uname("x"),
            descriptor: FieldType::INT,
        }))
        .unwrap();
    constructor
        .visit_branch(&BranchInstruction::Return)
        .unwrap();
    constructor.visit_label(handler).unwrap();
    constructor
        .visit_branch(&BranchInstruction::AThrow)
        .unwrap();
    constructor.visit_label(end).unwrap();
    constructor
        .visit_try_catch(
            try_start,
            handler,
            handler,
            Some(&RefType::Object(name("java/lang/RuntimeException"))),
        )
        .unwrap();
    constructor
        .visit_local_variable(
            "this",
            &FieldType::Ref(RefType::Object(name("me/alec/Point"))),
            try_start,
            end,
            0,
        )
        .unwrap();
    constructor.visit_end().unwrap();

    class.visit_end().unwrap();
    writer.into_bytes().unwrap()
}

/// Decode → re-encode with no transformation → re-decode must yield an
/// identical event stream (pool indices are preserved through the copy-pool
/// optimization, so even labels line up)
#[test]
fn round_trip_identity() {
    let original = build_rich_class();
    let first_decode = decode(&original, ReaderOptions::empty());

    let reader = ClassReader::new(&original).unwrap();
    let writer = ClassWriter::with_pool_from(&reader, WriterOptions::empty()).unwrap();
    reader.accept(&mut (&writer), ReaderOptions::empty()).unwrap();
    let re_encoded = writer.into_bytes().unwrap();

    let second_decode = decode(&re_encoded, ReaderOptions::empty());
    assert_eq!(first_decode, second_decode);
}

/// Re-running the whole decode → recompute-frames → encode pipeline twice
/// produces identical bytes: the frame engine is deterministic
#[test]
fn frame_computation_is_idempotent() {
    let arenas = ClassGraphArenas::new();
    let graph = ClassGraph::new(&arenas);
    graph.insert_java_lang_core();

    let original = build_rich_class();
    let mut previous = original.clone();
    for _ in 0..2 {
        let reader = ClassReader::new(&previous).unwrap();
        let writer = ClassWriter::with_pool_from(&reader, WriterOptions::COMPUTE_FRAMES)
            .unwrap()
            .with_hierarchy(&graph);
        reader
            .accept(&mut (&writer), ReaderOptions::SKIP_FRAMES)
            .unwrap();
        let re_encoded = writer.into_bytes().unwrap();
        assert_eq!(
            decode(&previous, ReaderOptions::empty()),
            decode(&re_encoded, ReaderOptions::empty()),
            "recomputing frames must not change what the class says"
        );
        previous = re_encoded;
    }
}

/// An `if` merging an Integer on one path and a String on the other into the
/// same local slot must merge that slot to `java/lang/Object` at the join
#[test]
fn merge_at_join_generalizes_to_object() {
    let arenas = ClassGraphArenas::new();
    let graph = ClassGraph::new(&arenas);
    graph.insert_java_lang_core();

    let writer = ClassWriter::new(WriterOptions::COMPUTE_FRAMES).with_hierarchy(&graph);
    let mut class = &writer;
    class.visit_header(&header("me/Merge")).unwrap();

    let mut generator = LabelGenerator::new();
    let otherwise = generator.fresh_label();
    let join = generator.fresh_label();

    let mut method = class
        .visit_method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            &uname("pick"),
            &MethodDescriptor::parse(
                "(ILjava/lang/Integer;Ljava/lang/String;)Ljava/lang/Object;",
            )
            .unwrap(),
            &[],
        )
        .unwrap()
        .unwrap();
    method.visit_code().unwrap();
    method.visit_instruction(&Instruction::ILoad(0)).unwrap();
    method
        .visit_branch(&BranchInstruction::If(OrdComparison::EQ, otherwise, ()))
        .unwrap();
    method.visit_instruction(&Instruction::ALoad(1)).unwrap();
    method.visit_instruction(&Instruction::AStore(3)).unwrap();
    method
        .visit_branch(&BranchInstruction::Goto(join))
        .unwrap();
    method.visit_label(otherwise).unwrap();
    method.visit_instruction(&Instruction::ALoad(2)).unwrap();
    method.visit_instruction(&Instruction::AStore(3)).unwrap();
    method.visit_label(join).unwrap();
    method.visit_instruction(&Instruction::ALoad(3)).unwrap();
    method.visit_branch(&BranchInstruction::AReturn).unwrap();
    method.visit_end().unwrap();
    class.visit_end().unwrap();
    let class_bytes = writer.into_bytes().unwrap();

    let events = decode(&class_bytes, ReaderOptions::empty());
    let object_slot = VerificationType::Object(RefType::Object(BinaryName::OBJECT));
    let merged_frame = events.iter().any(|event| match event {
        Event::Frame(frame) => frame.locals.len() == 4 && frame.locals[3] == object_slot,
        _ => false,
    });
    assert!(
        merged_frame,
        "expected a frame whose fourth local merged to java/lang/Object: {:?}",
        events
            .iter()
            .filter(|event| matches!(event, Event::Frame(_)))
            .collect::<Vec<_>>()
    );
}

/// A backward branch over >32k of straight-line code must be promoted to
/// `goto_w`, and the result must still decode (and keep its meaning)
#[test]
fn oversized_backward_jump_is_widened() {
    let writer = ClassWriter::new(WriterOptions::COMPUTE_MAXS);
    let mut class = &writer;
    class.visit_header(&header("me/Wide")).unwrap();

    let mut generator = LabelGenerator::new();
    let top = generator.fresh_label();

    let mut method = class
        .visit_method(
            MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
            &uname("spin"),
            &MethodDescriptor::parse("()V").unwrap(),
            &[],
        )
        .unwrap()
        .unwrap();
    method.visit_code().unwrap();
    method.visit_label(top).unwrap();
    for _ in 0..16500 {
        method.visit_instruction(&Instruction::IConst0).unwrap();
        method.visit_instruction(&Instruction::Pop).unwrap();
    }
    method.visit_branch(&BranchInstruction::Goto(top)).unwrap();
    method.visit_end().unwrap();
    class.visit_end().unwrap();
    let class_bytes = writer.into_bytes().unwrap();

    let events = decode(&class_bytes, ReaderOptions::empty());
    let entry_label = events.iter().find_map(|event| match event {
        Event::LabelMark(label) => Some(*label),
        _ => None,
    });
    assert!(
        events.iter().any(|event| matches!(
            event,
            Event::Branch(BranchInstruction::GotoW(target)) if Some(*target) == entry_label
        )),
        "backward jump should have been re-encoded as goto_w"
    );
    let nops = events
        .iter()
        .filter(|event| matches!(event, Event::Instruction(Instruction::Nop)))
        .count();
    assert_eq!(nops, 2, "goto rewrite pads with two nops");

    // And the widened class still round-trips cleanly
    let reader = ClassReader::new(&class_bytes).unwrap();
    let writer = ClassWriter::with_pool_from(&reader, WriterOptions::empty()).unwrap();
    reader.accept(&mut (&writer), ReaderOptions::empty()).unwrap();
    assert_eq!(events, decode(&writer.into_bytes().unwrap(), ReaderOptions::empty()));
}

/// Exception handlers get a frame whose stack is exactly the caught type
#[test]
fn handler_frame_has_exception_on_stack() {
    let original = build_rich_class();
    let events = decode(&original, ReaderOptions::empty());

    let caught = VerificationType::Object(RefType::Object(name("java/lang/RuntimeException")));
    assert!(
        events.iter().any(|event| match event {
            Event::Frame(frame) => frame.stack == vec![caught.clone()],
            _ => false,
        }),
        "expected a handler frame with the caught exception on the stack"
    );
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::TryCatch { .. })));
}

/// The reader's skip flags are independent
#[test]
fn reader_skip_options() {
    let original = build_rich_class();

    let without_code = decode(&original, ReaderOptions::SKIP_CODE);
    assert!(!without_code
        .iter()
        .any(|event| matches!(event, Event::Code | Event::Instruction(_) | Event::Maxs { .. })));
    assert!(without_code
        .iter()
        .any(|event| matches!(event, Event::Method { .. })));

    let without_debug = decode(&original, ReaderOptions::SKIP_DEBUG);
    assert!(!without_debug.iter().any(|event| matches!(
        event,
        Event::Source(_) | Event::LineNumber(_, _) | Event::LocalVariable { .. }
    )));
    assert!(without_debug
        .iter()
        .any(|event| matches!(event, Event::Instruction(_))));

    let without_frames = decode(&original, ReaderOptions::SKIP_FRAMES);
    assert!(!without_frames
        .iter()
        .any(|event| matches!(event, Event::Frame(_))));
    assert!(without_frames
        .iter()
        .any(|event| matches!(event, Event::Instruction(_))));
}

/// Unknown attributes survive the round trip opaquely
#[test]
fn unknown_attributes_pass_through() {
    let original = build_rich_class();
    let events = decode(&original, ReaderOptions::empty());
    assert!(events.iter().any(|event| matches!(
        event,
        Event::Attribute(RawAttribute { name, info }) if name == "X-Custom" && info == &[1, 2, 3, 4]
    )));
}

/// Malformed inputs fail fast with distinct format errors
#[test]
fn format_errors_are_distinct() {
    assert!(matches!(
        ClassReader::new(&[0xDE, 0xAD, 0xBE, 0xEF, 0, 0, 0, 52]),
        Err(Error::Format(FormatError::BadMagic(0xDEADBEEF)))
    ));

    assert!(matches!(
        ClassReader::new(&[0xCA, 0xFE, 0xBA, 0xBE, 0, 0]),
        Err(Error::Format(FormatError::UnexpectedEof { .. }))
    ));

    // Version 99 is past anything this codec knows
    assert!(matches!(
        ClassReader::new(&[0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 99, 0, 1]),
        Err(Error::Format(FormatError::UnsupportedVersion { major: 99, .. }))
    ));

    // Constant pool with an unknown tag
    assert!(matches!(
        ClassReader::new(&[0xCA, 0xFE, 0xBA, 0xBE, 0, 0, 0, 52, 0, 2, 99]),
        Err(Error::Format(FormatError::BadConstantTag(99)))
    ));
}

/// A jump to a label that is never placed must be reported, never
/// zero-filled
#[test]
fn unplaced_label_is_an_error() {
    let writer = ClassWriter::new(WriterOptions::COMPUTE_MAXS);
    let mut class = &writer;
    class.visit_header(&header("me/Broken")).unwrap();

    let mut generator = LabelGenerator::new();
    let nowhere = generator.fresh_label();

    let mut method = class
        .visit_method(
            MethodAccessFlags::STATIC,
            &uname("broken"),
            &MethodDescriptor::parse("()V").unwrap(),
            &[],
        )
        .unwrap()
        .unwrap();
    method.visit_code().unwrap();
    let result = method
        .visit_branch(&BranchInstruction::Goto(nowhere))
        .and_then(|_| method.visit_end());
    assert!(matches!(result, Err(Error::UnresolvedLabel(_))));
}
