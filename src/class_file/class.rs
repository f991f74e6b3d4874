use crate::access_flags::ClassAccessFlags;
use crate::class_file::{Attribute, ClassConstantIndex, Constant, Field, Method, Serialize, Version};
use crate::util::OffsetVec;
use byteorder::WriteBytesExt;

/// Assembled wire representation of a class file
///
/// See <https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html>
#[derive(Debug)]
pub struct ClassFile {
    pub version: Version,
    pub constants: OffsetVec<Constant>,
    pub access_flags: ClassAccessFlags,
    pub this_class: ClassConstantIndex,

    /// Index 0 only for `java/lang/Object` itself
    pub super_class: ClassConstantIndex,

    pub interfaces: Vec<ClassConstantIndex>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
}

impl ClassFile {
    /// Magic header bytes at the front of every serialized class file
    pub const MAGIC: u32 = 0xCAFE_BABE;
}

impl Serialize for ClassFile {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        ClassFile::MAGIC.serialize(writer)?;
        self.version.serialize(writer)?;
        self.constants.serialize(writer)?;
        self.access_flags.serialize(writer)?;
        self.this_class.serialize(writer)?;
        self.super_class.serialize(writer)?;
        self.interfaces.serialize(writer)?;
        self.fields.serialize(writer)?;
        self.methods.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}

/// The pool's length prefix is the offset one past the final entry (not the
/// number of entries), thanks to two-slot constants.
impl Serialize for OffsetVec<Constant> {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        (self.offset_len().0 as u16).serialize(writer)?;
        for (_, _, constant) in self.iter() {
            constant.serialize(writer)?;
        }
        Ok(())
    }
}
