//! The visitor API: one callback per structural element of a class
//!
//! The decoder drives these callbacks; the encoder implements them.
//! Transformation stages compose by chain of responsibility: a stage holds
//! its next stage and forwards the calls it does not care about (every
//! callback has a no-op default, so a terminal consumer only implements what
//! it wants).
//!
//! Callbacks must arrive in a fixed relative order. For a class: header →
//! source/signature → inner classes and nest attributes → fields → methods →
//! raw attributes → end. Within a method: signature → code start → labels,
//! frames and instructions in program order → try/catch entries → debug
//! tables → maxs → end. Violating this order is a caller error, not
//! something the codec tolerates.

use crate::access_flags::{ClassAccessFlags, FieldAccessFlags, InnerClassAccessFlags, MethodAccessFlags};
use crate::class_file::Version;
use crate::code::{BranchEvent, ConstantData, Label, SymbolicInstruction};
use crate::descriptors::{FieldType, MethodDescriptor, RefType};
use crate::errors::Error;
use crate::names::{BinaryName, UnqualifiedName};
use crate::verifier::VerificationTypeEvent;
use std::cell::RefCell;
use std::rc::Rc;

/// Decoded class header
#[derive(Debug, Clone, PartialEq)]
pub struct ClassHeader {
    pub version: Version,
    pub access_flags: ClassAccessFlags,
    pub this_class: BinaryName,

    /// `None` only for `java/lang/Object`
    pub super_class: Option<BinaryName>,
    pub interfaces: Vec<BinaryName>,
}

/// Attribute this codec has no structural knowledge of, carried opaquely
///
/// The payload is passed through verbatim. If it embeds constant pool
/// indices, it stays meaningful only when the encoder reuses the source
/// class's pool (see `ClassWriter::with_pool_from`).
#[derive(Debug, Clone, PartialEq)]
pub struct RawAttribute {
    pub name: String,
    pub info: Vec<u8>,
}

/// Entry of the inner-classes table
#[derive(Debug, Clone, PartialEq)]
pub struct InnerClassInfo {
    pub inner_class: BinaryName,

    /// `None` when the class is not a member of another class
    pub outer_class: Option<BinaryName>,

    /// `None` when the class is anonymous
    pub inner_name: Option<String>,

    pub access_flags: InnerClassAccessFlags,
}

/// A stack map frame, in expanded (non-delta) form
///
/// The decoder expands the wire format's delta compression before emitting
/// frames; the encoder re-compresses when it serializes.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEvent {
    pub locals: Vec<VerificationTypeEvent>,
    pub stack: Vec<VerificationTypeEvent>,
}

/// Visitor over the structure of one class
pub trait ClassVisitor {
    type FieldV: FieldVisitor;
    type MethodV: MethodVisitor;

    fn visit_header(&mut self, _header: &ClassHeader) -> Result<(), Error> {
        Ok(())
    }

    fn visit_source(&mut self, _source_file: &str) -> Result<(), Error> {
        Ok(())
    }

    fn visit_signature(&mut self, _signature: &str) -> Result<(), Error> {
        Ok(())
    }

    fn visit_inner_class(&mut self, _inner_class: &InnerClassInfo) -> Result<(), Error> {
        Ok(())
    }

    fn visit_nest_host(&mut self, _host: &BinaryName) -> Result<(), Error> {
        Ok(())
    }

    fn visit_nest_member(&mut self, _member: &BinaryName) -> Result<(), Error> {
        Ok(())
    }

    /// Start visiting a field; `None` skips it
    fn visit_field(
        &mut self,
        _access_flags: FieldAccessFlags,
        _name: &UnqualifiedName,
        _descriptor: &FieldType<BinaryName>,
    ) -> Result<Option<Self::FieldV>, Error> {
        Ok(None)
    }

    /// Start visiting a method; `None` skips it
    fn visit_method(
        &mut self,
        _access_flags: MethodAccessFlags,
        _name: &UnqualifiedName,
        _descriptor: &MethodDescriptor<BinaryName>,
        _exceptions: &[BinaryName],
    ) -> Result<Option<Self::MethodV>, Error> {
        Ok(None)
    }

    fn visit_attribute(&mut self, _attribute: &RawAttribute) -> Result<(), Error> {
        Ok(())
    }

    fn visit_end(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Visitor over one field
pub trait FieldVisitor {
    fn visit_signature(&mut self, _signature: &str) -> Result<(), Error> {
        Ok(())
    }

    fn visit_constant_value(&mut self, _value: &ConstantData) -> Result<(), Error> {
        Ok(())
    }

    fn visit_attribute(&mut self, _attribute: &RawAttribute) -> Result<(), Error> {
        Ok(())
    }

    fn visit_end(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// Visitor over one method
pub trait MethodVisitor {
    fn visit_signature(&mut self, _signature: &str) -> Result<(), Error> {
        Ok(())
    }

    /// Start of the code attribute (absent for `abstract`/`native` methods)
    fn visit_code(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Mark the next instruction's position
    fn visit_label(&mut self, _label: Label) -> Result<(), Error> {
        Ok(())
    }

    /// Stack map frame for the position just marked by a label
    fn visit_frame(&mut self, _frame: &FrameEvent) -> Result<(), Error> {
        Ok(())
    }

    fn visit_instruction(&mut self, _insn: &SymbolicInstruction) -> Result<(), Error> {
        Ok(())
    }

    fn visit_branch(&mut self, _insn: &BranchEvent) -> Result<(), Error> {
        Ok(())
    }

    fn visit_try_catch(
        &mut self,
        _start: Label,
        _end: Label,
        _handler: Label,
        _catch_type: Option<&RefType<BinaryName>>,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn visit_line_number(&mut self, _line: u16, _start: Label) -> Result<(), Error> {
        Ok(())
    }

    fn visit_local_variable(
        &mut self,
        _name: &str,
        _descriptor: &FieldType<BinaryName>,
        _start: Label,
        _end: Label,
        _index: u16,
    ) -> Result<(), Error> {
        Ok(())
    }

    /// Declared (or previously computed) maximums; the encoder ignores these
    /// when it was asked to compute its own
    fn visit_maxs(&mut self, _max_stack: u16, _max_locals: u16) -> Result<(), Error> {
        Ok(())
    }

    fn visit_attribute(&mut self, _attribute: &RawAttribute) -> Result<(), Error> {
        Ok(())
    }

    fn visit_end(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// The do-nothing visitor, useful as the tail of a visitor chain or to skip
/// members wholesale
impl ClassVisitor for () {
    type FieldV = ();
    type MethodV = ();
}

impl FieldVisitor for () {}

impl MethodVisitor for () {}

/// Everything the visitor API can say, as an owned value
///
/// This is the event vocabulary used by [`EventRecorder`], mostly for tests
/// asserting that decode → encode → decode round-trips preserve the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Header(ClassHeader),
    Source(String),
    Signature(String),
    InnerClass(InnerClassInfo),
    NestHost(BinaryName),
    NestMember(BinaryName),
    Field {
        access_flags: FieldAccessFlags,
        name: UnqualifiedName,
        descriptor: FieldType<BinaryName>,
    },
    FieldSignature(String),
    FieldConstantValue(ConstantData),
    FieldAttribute(RawAttribute),
    FieldEnd,
    Method {
        access_flags: MethodAccessFlags,
        name: UnqualifiedName,
        descriptor: MethodDescriptor<BinaryName>,
        exceptions: Vec<BinaryName>,
    },
    MethodSignature(String),
    Code,
    LabelMark(Label),
    Frame(FrameEvent),
    Instruction(SymbolicInstruction),
    Branch(BranchEvent),
    TryCatch {
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<RefType<BinaryName>>,
    },
    LineNumber(u16, Label),
    LocalVariable {
        name: String,
        descriptor: FieldType<BinaryName>,
        start: Label,
        end: Label,
        index: u16,
    },
    Maxs {
        max_stack: u16,
        max_locals: u16,
    },
    MethodAttribute(RawAttribute),
    MethodEnd,
    Attribute(RawAttribute),
    End,
}

/// Visitor that records every event it sees
#[derive(Default, Clone)]
pub struct EventRecorder {
    events: Rc<RefCell<Vec<Event>>>,
}

impl EventRecorder {
    pub fn new() -> EventRecorder {
        EventRecorder::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }
}

impl ClassVisitor for EventRecorder {
    type FieldV = FieldRecorder;
    type MethodV = MethodRecorder;

    fn visit_header(&mut self, header: &ClassHeader) -> Result<(), Error> {
        self.events.borrow_mut().push(Event::Header(header.clone()));
        Ok(())
    }

    fn visit_source(&mut self, source_file: &str) -> Result<(), Error> {
        self.events
            .borrow_mut()
            .push(Event::Source(source_file.to_string()));
        Ok(())
    }

    fn visit_signature(&mut self, signature: &str) -> Result<(), Error> {
        self.events
            .borrow_mut()
            .push(Event::Signature(signature.to_string()));
        Ok(())
    }

    fn visit_inner_class(&mut self, inner_class: &InnerClassInfo) -> Result<(), Error> {
        self.events
            .borrow_mut()
            .push(Event::InnerClass(inner_class.clone()));
        Ok(())
    }

    fn visit_nest_host(&mut self, host: &BinaryName) -> Result<(), Error> {
        self.events.borrow_mut().push(Event::NestHost(host.clone()));
        Ok(())
    }

    fn visit_nest_member(&mut self, member: &BinaryName) -> Result<(), Error> {
        self.events
            .borrow_mut()
            .push(Event::NestMember(member.clone()));
        Ok(())
    }

    fn visit_field(
        &mut self,
        access_flags: FieldAccessFlags,
        name: &UnqualifiedName,
        descriptor: &FieldType<BinaryName>,
    ) -> Result<Option<FieldRecorder>, Error> {
        self.events.borrow_mut().push(Event::Field {
            access_flags,
            name: name.clone(),
            descriptor: descriptor.clone(),
        });
        Ok(Some(FieldRecorder {
            events: self.events.clone(),
        }))
    }

    fn visit_method(
        &mut self,
        access_flags: MethodAccessFlags,
        name: &UnqualifiedName,
        descriptor: &MethodDescriptor<BinaryName>,
        exceptions: &[BinaryName],
    ) -> Result<Option<MethodRecorder>, Error> {
        self.events.borrow_mut().push(Event::Method {
            access_flags,
            name: name.clone(),
            descriptor: descriptor.clone(),
            exceptions: exceptions.to_vec(),
        });
        Ok(Some(MethodRecorder {
            events: self.events.clone(),
        }))
    }

    fn visit_attribute(&mut self, attribute: &RawAttribute) -> Result<(), Error> {
        self.events
            .borrow_mut()
            .push(Event::Attribute(attribute.clone()));
        Ok(())
    }

    fn visit_end(&mut self) -> Result<(), Error> {
        self.events.borrow_mut().push(Event::End);
        Ok(())
    }
}

pub struct FieldRecorder {
    events: Rc<RefCell<Vec<Event>>>,
}

impl FieldVisitor for FieldRecorder {
    fn visit_signature(&mut self, signature: &str) -> Result<(), Error> {
        self.events
            .borrow_mut()
            .push(Event::FieldSignature(signature.to_string()));
        Ok(())
    }

    fn visit_constant_value(&mut self, value: &ConstantData) -> Result<(), Error> {
        self.events
            .borrow_mut()
            .push(Event::FieldConstantValue(value.clone()));
        Ok(())
    }

    fn visit_attribute(&mut self, attribute: &RawAttribute) -> Result<(), Error> {
        self.events
            .borrow_mut()
            .push(Event::FieldAttribute(attribute.clone()));
        Ok(())
    }

    fn visit_end(&mut self) -> Result<(), Error> {
        self.events.borrow_mut().push(Event::FieldEnd);
        Ok(())
    }
}

pub struct MethodRecorder {
    events: Rc<RefCell<Vec<Event>>>,
}

impl MethodVisitor for MethodRecorder {
    fn visit_signature(&mut self, signature: &str) -> Result<(), Error> {
        self.events
            .borrow_mut()
            .push(Event::MethodSignature(signature.to_string()));
        Ok(())
    }

    fn visit_code(&mut self) -> Result<(), Error> {
        self.events.borrow_mut().push(Event::Code);
        Ok(())
    }

    fn visit_label(&mut self, label: Label) -> Result<(), Error> {
        self.events.borrow_mut().push(Event::LabelMark(label));
        Ok(())
    }

    fn visit_frame(&mut self, frame: &FrameEvent) -> Result<(), Error> {
        self.events.borrow_mut().push(Event::Frame(frame.clone()));
        Ok(())
    }

    fn visit_instruction(&mut self, insn: &SymbolicInstruction) -> Result<(), Error> {
        self.events
            .borrow_mut()
            .push(Event::Instruction(insn.clone()));
        Ok(())
    }

    fn visit_branch(&mut self, insn: &BranchEvent) -> Result<(), Error> {
        self.events.borrow_mut().push(Event::Branch(insn.clone()));
        Ok(())
    }

    fn visit_try_catch(
        &mut self,
        start: Label,
        end: Label,
        handler: Label,
        catch_type: Option<&RefType<BinaryName>>,
    ) -> Result<(), Error> {
        self.events.borrow_mut().push(Event::TryCatch {
            start,
            end,
            handler,
            catch_type: catch_type.cloned(),
        });
        Ok(())
    }

    fn visit_line_number(&mut self, line: u16, start: Label) -> Result<(), Error> {
        self.events.borrow_mut().push(Event::LineNumber(line, start));
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
        self.events.borrow_mut().push(Event::LocalVariable {
            name: name.to_string(),
            descriptor: descriptor.clone(),
            start,
            end,
            index,
        });
        Ok(())
    }

    fn visit_maxs(&mut self, max_stack: u16, max_locals: u16) -> Result<(), Error> {
        self.events.borrow_mut().push(Event::Maxs {
            max_stack,
            max_locals,
        });
        Ok(())
    }

    fn visit_attribute(&mut self, attribute: &RawAttribute) -> Result<(), Error> {
        self.events
            .borrow_mut()
            .push(Event::MethodAttribute(attribute.clone()));
        Ok(())
    }

    fn visit_end(&mut self) -> Result<(), Error> {
        self.events.borrow_mut().push(Event::MethodEnd);
        Ok(())
    }
}
