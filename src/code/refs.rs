//! Symbolic operand payloads
//!
//! These are the fully pool-resolved values that flow through visitor events:
//! names and parsed descriptors instead of constant pool indices.

use crate::class_file::HandleKind;
use crate::descriptors::{FieldType, MethodDescriptor, RefType};
use crate::names::{BinaryName, UnqualifiedName};

/// Reference to a field (owner, name, parsed descriptor)
#[derive(Clone, Debug, PartialEq)]
pub struct FieldRef {
    pub class: BinaryName,
    pub name: UnqualifiedName,
    pub descriptor: FieldType<BinaryName>,
}

/// Reference to a method
///
/// The owner is a [`RefType`] because methods can be invoked on array types
/// (eg. `clone()` on `int[]`).
#[derive(Clone, Debug, PartialEq)]
pub struct MethodRef {
    pub class: RefType<BinaryName>,
    pub name: UnqualifiedName,
    pub descriptor: MethodDescriptor<BinaryName>,
    pub is_interface: bool,
}

/// Loadable constant, as used by `ldc`/`ldc2_w` operands and field
/// `ConstantValue` attributes
#[derive(Clone, Debug, PartialEq)]
pub enum ConstantData {
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    String(String),
    Class(RefType<BinaryName>),
    MethodHandle(Handle),
    MethodType(MethodDescriptor<BinaryName>),
    Dynamic(Box<DynamicRef>),
}

/// Method handle constant
#[derive(Clone, Debug, PartialEq)]
pub enum Handle {
    /// `getfield`/`getstatic`/`putfield`/`putstatic` handle kinds
    Field(HandleKind, FieldRef),

    /// The invocation handle kinds
    Method(HandleKind, MethodRef),
}

impl Handle {
    pub fn kind(&self) -> HandleKind {
        match self {
            Handle::Field(kind, _) => *kind,
            Handle::Method(kind, _) => *kind,
        }
    }
}

/// Bootstrap method: a handle plus its static arguments
#[derive(Clone, Debug, PartialEq)]
pub struct BootstrapMethod {
    pub handle: Handle,
    pub arguments: Vec<ConstantData>,
}

/// Operand of an `invokedynamic` instruction, with its bootstrap method
/// resolved out of the `BootstrapMethods` attribute
#[derive(Clone, Debug, PartialEq)]
pub struct InvokeDynamicRef {
    pub name: UnqualifiedName,
    pub descriptor: MethodDescriptor<BinaryName>,
    pub bootstrap: BootstrapMethod,
}

/// A dynamically-computed constant (`CONSTANT_Dynamic_info`)
#[derive(Clone, Debug, PartialEq)]
pub struct DynamicRef {
    pub name: UnqualifiedName,
    pub descriptor: FieldType<BinaryName>,
    pub bootstrap: BootstrapMethod,
}
