use crate::access_flags::MethodAccessFlags;
use crate::class_file::{Attribute, Serialize, Utf8ConstantIndex};
use byteorder::WriteBytesExt;

/// Wire representation of a method
///
/// See <https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.6>
#[derive(Debug)]
pub struct Method {
    pub access_flags: MethodAccessFlags,
    pub name_index: Utf8ConstantIndex,
    pub descriptor_index: Utf8ConstantIndex,
    pub attributes: Vec<Attribute>,
}

impl Serialize for Method {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.access_flags.serialize(writer)?;
        self.name_index.serialize(writer)?;
        self.descriptor_index.serialize(writer)?;
        self.attributes.serialize(writer)?;
        Ok(())
    }
}
