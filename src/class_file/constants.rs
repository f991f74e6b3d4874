use crate::class_file::Serialize;
use crate::errors::FormatError;
use crate::util::Width;
use byteorder::WriteBytesExt;

/// Constant pool entry
///
/// Entries are stored here in their wire form: cross references between
/// entries are pool indices, not resolved values. The decoder resolves
/// indices into names and descriptors before anything reaches a visitor.
///
/// See <https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.4>
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// Constant UTF-8 encoded raw string value
    ///
    /// Despite the name, the wire encoding is not quite UTF-8 (the encoding
    /// of the null character and of supplementary characters differs).
    Utf8(String),

    /// Constant primitive of type `int`
    Integer(i32),

    /// Constant primitive of type `float`
    Float(f32),

    /// Constant primitive of type `long` (occupies two pool slots)
    Long(i64),

    /// Constant primitive of type `double` (occupies two pool slots)
    Double(f64),

    /// Class or interface (name may also be an array descriptor)
    Class(Utf8ConstantIndex),

    /// Constant object of type `java.lang.String`
    String(Utf8ConstantIndex),

    /// Field reference
    FieldRef(ClassConstantIndex, NameAndTypeConstantIndex),

    /// Method reference (combines `Methodref` and `InterfaceMethodref`)
    MethodRef {
        class: ClassConstantIndex,
        name_and_type: NameAndTypeConstantIndex,
        is_interface: bool,
    },

    /// Name and a type (for a field or a method)
    NameAndType {
        name: Utf8ConstantIndex,
        descriptor: Utf8ConstantIndex,
    },

    /// Constant object of type `java.lang.invoke.MethodHandle`
    MethodHandle {
        handle_kind: HandleKind,

        /// `FieldRef` for the field kinds, `MethodRef` for the rest
        member: ConstantIndex,
    },

    /// Method type
    MethodType { descriptor: Utf8ConstantIndex },

    /// Dynamically-computed constant
    Dynamic {
        /// Index into the `BootstrapMethods` attribute
        bootstrap_method: u16,
        name_and_type: NameAndTypeConstantIndex,
    },

    /// Dynamically-computed call site
    InvokeDynamic {
        /// Index into the `BootstrapMethods` attribute
        bootstrap_method: u16,
        name_and_type: NameAndTypeConstantIndex,
    },

    /// Module name
    Module(Utf8ConstantIndex),

    /// Package name
    Package(Utf8ConstantIndex),
}

impl Constant {
    /// Wire tag of the entry
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Utf8(_) => 1,
            Constant::Integer(_) => 3,
            Constant::Float(_) => 4,
            Constant::Long(_) => 5,
            Constant::Double(_) => 6,
            Constant::Class(_) => 7,
            Constant::String(_) => 8,
            Constant::FieldRef(_, _) => 9,
            Constant::MethodRef {
                is_interface: false,
                ..
            } => 10,
            Constant::MethodRef {
                is_interface: true, ..
            } => 11,
            Constant::NameAndType { .. } => 12,
            Constant::MethodHandle { .. } => 15,
            Constant::MethodType { .. } => 16,
            Constant::Dynamic { .. } => 17,
            Constant::InvokeDynamic { .. } => 18,
            Constant::Module(_) => 19,
            Constant::Package(_) => 20,
        }
    }
}

impl Serialize for Constant {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.tag().serialize(writer)?;
        match self {
            Constant::Utf8(string) => {
                let buffer: Vec<u8> = encode_modified_utf8(string);
                (buffer.len() as u16).serialize(writer)?;
                writer.write_all(&buffer)?;
            }
            Constant::Integer(integer) => integer.serialize(writer)?,
            Constant::Float(float) => float.serialize(writer)?,
            Constant::Long(long) => long.serialize(writer)?,
            Constant::Double(double) => double.serialize(writer)?,
            Constant::Class(name) => name.serialize(writer)?,
            Constant::String(utf8) => utf8.serialize(writer)?,
            Constant::FieldRef(class, name_and_type) => {
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::MethodRef {
                class,
                name_and_type,
                ..
            } => {
                class.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::NameAndType { name, descriptor } => {
                name.serialize(writer)?;
                descriptor.serialize(writer)?;
            }
            Constant::MethodHandle {
                handle_kind,
                member,
            } => {
                handle_kind.serialize(writer)?;
                member.serialize(writer)?;
            }
            Constant::MethodType { descriptor } => descriptor.serialize(writer)?,
            Constant::Dynamic {
                bootstrap_method,
                name_and_type,
            }
            | Constant::InvokeDynamic {
                bootstrap_method,
                name_and_type,
            } => {
                bootstrap_method.serialize(writer)?;
                name_and_type.serialize(writer)?;
            }
            Constant::Module(name) => name.serialize(writer)?,
            Constant::Package(name) => name.serialize(writer)?,
        };
        Ok(())
    }
}

/// All 8-byte constants take up two entries in the constant pool; everything
/// else takes one.
impl Width for Constant {
    fn width(&self) -> usize {
        match self {
            Constant::Long(_) | Constant::Double(_) => 2,
            _ => 1,
        }
    }
}

/// Modified UTF-8 format used in class files
///
/// The differences between this format and standard UTF-8:
///
///   * the null byte `\u{0000}` is encoded in 2-byte form, so encoded strings
///     never have embedded nulls
///   * only the 1-byte, 2-byte, and 3-byte formats are used
///   * supplementary characters are represented as surrogate pairs
pub fn encode_modified_utf8(string: &str) -> Vec<u8> {
    let mut buffer: Vec<u8> = vec![];
    for c in string.chars() {
        let len: usize = if c == '\u{0000}' { 2 } else { c.len_utf8() };
        let code: u32 = c as u32;

        match len {
            1 => buffer.push(code as u8),
            2 => {
                buffer.push((code >> 6 & 0x1F) as u8 | 0b1100_0000);
                buffer.push((code & 0x3F) as u8 | 0b1000_0000);
            }
            3 => {
                buffer.push((code >> 12 & 0x0F) as u8 | 0b1110_0000);
                buffer.push((code >> 6 & 0x3F) as u8 | 0b1000_0000);
                buffer.push((code & 0x3F) as u8 | 0b1000_0000);
            }

            // Supplementary characters: main divergence from UTF-8
            _ => {
                buffer.push(0b1110_1101);
                buffer.push(((code >> 16 & 0x0F) as u8).wrapping_sub(1) & 0x0F | 0b1010_0000);
                buffer.push((code >> 10 & 0x3F) as u8 | 0b1000_0000);

                buffer.push(0b1110_1101);
                buffer.push(((code >> 6 & 0x1F) as u8) | 0b1011_0000);
                buffer.push((code & 0x3F) as u8 | 0b1000_0000);
            }
        }
    }
    buffer
}

/// Inverse of [`encode_modified_utf8`]
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, FormatError> {
    let mut decoded = String::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let a = bytes[i] as u32;
        i += 1;

        // An embedded null byte means this was not produced by the encoder
        if a == 0 {
            return Err(FormatError::InvalidUtf8);
        }
        if a < 0x80 {
            decoded.push(a as u8 as char);
            continue;
        }

        let continuation = |i: &mut usize| -> Result<u32, FormatError> {
            let b = *bytes.get(*i).ok_or(FormatError::InvalidUtf8)? as u32;
            *i += 1;
            if b & 0b1100_0000 != 0b1000_0000 {
                return Err(FormatError::InvalidUtf8);
            }
            Ok(b & 0x3F)
        };

        let code = if a & 0b1110_0000 == 0b1100_0000 {
            (a & 0x1F) << 6 | continuation(&mut i)?
        } else if a & 0b1111_0000 == 0b1110_0000 {
            let b = continuation(&mut i)?;
            let c = continuation(&mut i)?;
            let code = (a & 0x0F) << 12 | b << 6 | c;

            // High surrogate: expect a 3-byte low surrogate to follow
            if (0xD800..0xDC00).contains(&code) {
                if bytes.get(i).copied() != Some(0b1110_1101) {
                    return Err(FormatError::InvalidUtf8);
                }
                i += 1;
                let e = continuation(&mut i)?;
                let f = continuation(&mut i)?;
                let low = 0xD000 | e << 6 | f;
                if !(0xDC00..0xE000).contains(&low) {
                    return Err(FormatError::InvalidUtf8);
                }
                0x10000 + ((code - 0xD800) << 10) + (low - 0xDC00)
            } else if (0xDC00..0xE000).contains(&code) {
                // Unpaired low surrogate
                return Err(FormatError::InvalidUtf8);
            } else {
                code
            }
        } else {
            return Err(FormatError::InvalidUtf8);
        };

        decoded.push(char::from_u32(code).ok_or(FormatError::InvalidUtf8)?);
    }

    Ok(decoded)
}

/// Type of method handle
///
/// See <https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.4.8>
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum HandleKind {
    GetField,
    GetStatic,
    PutField,
    PutStatic,
    InvokeVirtual,
    InvokeStatic,
    InvokeSpecial,
    NewInvokeSpecial,
    InvokeInterface,
}

impl HandleKind {
    pub fn tag(&self) -> u8 {
        match self {
            HandleKind::GetField => 1,
            HandleKind::GetStatic => 2,
            HandleKind::PutField => 3,
            HandleKind::PutStatic => 4,
            HandleKind::InvokeVirtual => 5,
            HandleKind::InvokeStatic => 6,
            HandleKind::InvokeSpecial => 7,
            HandleKind::NewInvokeSpecial => 8,
            HandleKind::InvokeInterface => 9,
        }
    }

    pub fn from_tag(tag: u8) -> Option<HandleKind> {
        Some(match tag {
            1 => HandleKind::GetField,
            2 => HandleKind::GetStatic,
            3 => HandleKind::PutField,
            4 => HandleKind::PutStatic,
            5 => HandleKind::InvokeVirtual,
            6 => HandleKind::InvokeStatic,
            7 => HandleKind::InvokeSpecial,
            8 => HandleKind::NewInvokeSpecial,
            9 => HandleKind::InvokeInterface,
            _ => return None,
        })
    }

    /// Does this handle kind refer to a field (as opposed to a method)?
    pub fn is_field_kind(&self) -> bool {
        matches!(
            self,
            HandleKind::GetField
                | HandleKind::GetStatic
                | HandleKind::PutField
                | HandleKind::PutStatic
        )
    }
}

impl Serialize for HandleKind {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.tag().serialize(writer)
    }
}

/// Raw index into the constant pool
#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct ConstantIndex(pub u16);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct Utf8ConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct StringConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct NameAndTypeConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct ClassConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct FieldRefConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct MethodRefConstantIndex(pub ConstantIndex);

#[derive(Copy, Clone, Hash, Eq, PartialEq, Debug)]
pub struct InvokeDynamicConstantIndex(pub ConstantIndex);

impl From<Utf8ConstantIndex> for ConstantIndex {
    fn from(idx: Utf8ConstantIndex) -> ConstantIndex {
        idx.0
    }
}

impl From<StringConstantIndex> for ConstantIndex {
    fn from(idx: StringConstantIndex) -> ConstantIndex {
        idx.0
    }
}

impl From<NameAndTypeConstantIndex> for ConstantIndex {
    fn from(idx: NameAndTypeConstantIndex) -> ConstantIndex {
        idx.0
    }
}

impl From<ClassConstantIndex> for ConstantIndex {
    fn from(idx: ClassConstantIndex) -> ConstantIndex {
        idx.0
    }
}

impl From<FieldRefConstantIndex> for ConstantIndex {
    fn from(idx: FieldRefConstantIndex) -> ConstantIndex {
        idx.0
    }
}

impl From<MethodRefConstantIndex> for ConstantIndex {
    fn from(idx: MethodRefConstantIndex) -> ConstantIndex {
        idx.0
    }
}

impl From<InvokeDynamicConstantIndex> for ConstantIndex {
    fn from(idx: InvokeDynamicConstantIndex) -> ConstantIndex {
        idx.0
    }
}

impl Serialize for ConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Serialize for Utf8ConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Serialize for StringConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Serialize for NameAndTypeConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Serialize for ClassConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Serialize for FieldRefConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Serialize for MethodRefConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

impl Serialize for InvokeDynamicConstantIndex {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.0.serialize(writer)
    }
}

#[cfg(test)]
mod modified_utf8_tests {
    use super::*;

    #[test]
    fn containing_null_byte() {
        assert_eq!(encode_modified_utf8("a\x00a"), vec![97, 192, 128, 97]);
        assert_eq!(decode_modified_utf8(&[97, 192, 128, 97]).unwrap(), "a\x00a");
    }

    #[test]
    fn simple_ascii() {
        assert_eq!(encode_modified_utf8("foo"), vec![102, 111, 111]);
        assert_eq!(decode_modified_utf8(&[102, 111, 111]).unwrap(), "foo");
    }

    #[test]
    fn two_and_three_byte_encodings() {
        let text = "Ą猫ऄ";
        let encoded = encode_modified_utf8(text);
        assert_eq!(encoded, vec![196, 132, 231, 140, 171, 224, 164, 132]);
        assert_eq!(decode_modified_utf8(&encoded).unwrap(), text);
    }

    #[test]
    fn supplementary_characters() {
        let text = "\u{10000}\u{dffff}\u{10FFFF}";
        let encoded = encode_modified_utf8(text);
        assert_eq!(
            encoded,
            vec![
                237, 160, 128, 237, 176, 128, 237, 172, 191, 237, 191, 191, 237, 175, 191, 237,
                191, 191
            ]
        );
        assert_eq!(decode_modified_utf8(&encoded).unwrap(), text);
    }

    #[test]
    fn rejects_embedded_null_and_truncation() {
        assert!(decode_modified_utf8(&[0]).is_err());
        assert!(decode_modified_utf8(&[196]).is_err());
        assert!(decode_modified_utf8(&[237, 160, 128]).is_err(), "unpaired surrogate");
    }
}
