use crate::class_file::{BytecodeIndex, ClassConstantIndex, Serialize};
use crate::code::Label;
use crate::descriptors::{BaseType, FieldType, RefType};
use crate::names::BinaryName;
use crate::util::{Offset, Width};
use byteorder::WriteBytesExt;

/// Verification type, from [the JVMS type-checking hierarchy][0]
///
/// The two type parameters abstract over the representation of object types
/// and of uninitialized allocation sites:
///
///   - while frames are being computed, `Cls` is a resolved reference type
///     and `U` identifies the `new` instruction by basic block and offset
///   - in the wire format, `Cls` is a constant pool index and `U` is the
///     absolute bytecode offset of the `new` instruction
///
/// [0]: https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.10.1.2
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum VerificationType<Cls, U> {
    /// Unusable slot: the paths reaching this point disagree about what is
    /// here, so the bytecode must not read it
    Top,
    Integer,
    Float,
    Long,
    Double,
    Null,

    /// The `this` of a constructor before `<init>` has been called on it
    UninitializedThis,

    /// Object type
    Object(Cls),

    /// Result of a `new` whose `<init>` has not run yet; identified by the
    /// allocation site, not by the eventual type
    Uninitialized(U),
}

impl<Cls, U> VerificationType<Cls, U> {
    /// Is this a reference type?
    pub fn is_reference(&self) -> bool {
        match self {
            VerificationType::Top
            | VerificationType::Integer
            | VerificationType::Float
            | VerificationType::Double
            | VerificationType::Long => false,

            VerificationType::Null
            | VerificationType::UninitializedThis
            | VerificationType::Object(_)
            | VerificationType::Uninitialized(_) => true,
        }
    }

    pub fn map<Cls2, U2, E>(
        &self,
        map_class: impl FnOnce(&Cls) -> Result<Cls2, E>,
        map_uninitialized: impl FnOnce(&U) -> Result<U2, E>,
    ) -> Result<VerificationType<Cls2, U2>, E> {
        Ok(match self {
            VerificationType::Top => VerificationType::Top,
            VerificationType::Integer => VerificationType::Integer,
            VerificationType::Float => VerificationType::Float,
            VerificationType::Long => VerificationType::Long,
            VerificationType::Double => VerificationType::Double,
            VerificationType::Null => VerificationType::Null,
            VerificationType::UninitializedThis => VerificationType::UninitializedThis,
            VerificationType::Object(cls) => VerificationType::Object(map_class(cls)?),
            VerificationType::Uninitialized(site) => {
                VerificationType::Uninitialized(map_uninitialized(site)?)
            }
        })
    }
}

/// `long` and `double` occupy two slots; the slot following them is an
/// implicit top-like continuation that is never independently written.
impl<Cls, U> Width for VerificationType<Cls, U> {
    fn width(&self) -> usize {
        match self {
            VerificationType::Double | VerificationType::Long => 2,
            _ => 1,
        }
    }
}

impl Serialize for VerificationType<ClassConstantIndex, BytecodeIndex> {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        match self {
            VerificationType::Top => 0u8.serialize(writer)?,
            VerificationType::Integer => 1u8.serialize(writer)?,
            VerificationType::Float => 2u8.serialize(writer)?,
            VerificationType::Double => 3u8.serialize(writer)?,
            VerificationType::Long => 4u8.serialize(writer)?,
            VerificationType::Null => 5u8.serialize(writer)?,
            VerificationType::UninitializedThis => 6u8.serialize(writer)?,
            VerificationType::Object(cls) => {
                7u8.serialize(writer)?;
                cls.serialize(writer)?;
            }
            VerificationType::Uninitialized(offset) => {
                8u8.serialize(writer)?;
                offset.serialize(writer)?;
            }
        };
        Ok(())
    }
}

/// Verification type as it appears in visitor events: object types by name,
/// uninitialized sites as the label of their `new` instruction
pub type VerificationTypeEvent = VerificationType<RefType<BinaryName>, Label>;

/// After a `new` instruction, the top of the stack holds an uninitialized
/// value. The wire format wants the absolute offset of that `new`, but while
/// frames are being computed offsets can still shift, so the site is tracked
/// as (block, offset within block) instead. The eventual type is carried
/// along so the matching `<init>` call knows what to initialize to.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct UninitializedSite {
    /// Once the value is initialized, what will it be?
    pub class: BinaryName,

    /// Basic block containing the `new` instruction
    pub block: Label,

    /// Offset of the `new` instruction from the start of its block
    pub offset_in_block: Offset,
}

impl<U> From<&FieldType<BinaryName>> for VerificationType<RefType<BinaryName>, U> {
    fn from(field_type: &FieldType<BinaryName>) -> Self {
        match field_type {
            FieldType::Base(BaseType::Int)
            | FieldType::Base(BaseType::Char)
            | FieldType::Base(BaseType::Short)
            | FieldType::Base(BaseType::Byte)
            | FieldType::Base(BaseType::Boolean) => VerificationType::Integer,
            FieldType::Base(BaseType::Float) => VerificationType::Float,
            FieldType::Base(BaseType::Long) => VerificationType::Long,
            FieldType::Base(BaseType::Double) => VerificationType::Double,
            FieldType::Ref(ref_type) => VerificationType::Object(ref_type.clone()),
        }
    }
}
