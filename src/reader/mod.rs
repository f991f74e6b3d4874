//! The decoder: one linear forward pass over a class file, invoking a
//! visitor once per structural element with fully pool-resolved values
//!
//! The reader holds no mutable state: `accept` can be called any number of
//! times (eg. once with [`ReaderOptions::SKIP_CODE`] to look at the header,
//! then again in full).

mod code;
mod cursor;

pub(crate) use cursor::ByteCursor;

use crate::access_flags::{
    ClassAccessFlags, FieldAccessFlags, InnerClassAccessFlags, MethodAccessFlags,
};
use crate::class_file::{
    decode_modified_utf8, ClassFile, Constant, ConstantIndex, HandleKind, NameAndTypeConstantIndex,
    Utf8ConstantIndex, Version,
};
use crate::code::{
    BootstrapMethod, ConstantData, DynamicRef, FieldRef, Handle, InvokeDynamicRef, MethodRef,
};
use crate::descriptors::{FieldType, MethodDescriptor, ParseDescriptor, RefType};
use crate::errors::{Error, FormatError};
use crate::names::{BinaryName, Name, UnqualifiedName};
use crate::visitor::{ClassHeader, ClassVisitor, FieldVisitor, InnerClassInfo, MethodVisitor, RawAttribute};
use bitflags::bitflags;

bitflags! {
    /// Independently togglable decoder behaviors
    pub struct ReaderOptions: u32 {
        /// Skip debug information: source file, line numbers, local
        /// variable tables
        const SKIP_DEBUG = 1;

        /// Skip any `StackMapTable` already present in the input
        const SKIP_FRAMES = 2;

        /// Skip method bodies entirely (useful when only the shape of the
        /// class is needed)
        const SKIP_CODE = 4;
    }
}

/// Raw `BootstrapMethods` table: (method handle index, argument indices)
pub(crate) type BootstrapTable = Vec<(u16, Vec<u16>)>;

/// How deep `CONSTANT_Dynamic` bootstrap arguments may nest before the
/// decoder assumes the pool is cyclic
const MAX_CONSTANT_DEPTH: u8 = 8;

/// Decoder for one class file
pub struct ClassReader<'a> {
    bytes: &'a [u8],
    version: Version,

    /// Pool slot per index; `None` for index 0 and for the phantom second
    /// slot of `long`/`double` entries
    pool: Vec<Option<Constant>>,

    /// Byte position just past the constant pool
    body_start: usize,
}

impl<'a> ClassReader<'a> {
    /// Validate the header and pre-parse the constant pool
    pub fn new(bytes: &'a [u8]) -> Result<ClassReader<'a>, Error> {
        let mut cursor = ByteCursor::new(bytes);

        let magic = cursor.u32("magic")?;
        if magic != ClassFile::MAGIC {
            return Err(FormatError::BadMagic(magic).into());
        }
        let minor = cursor.u16("minor version")?;
        let major = cursor.u16("major version")?;
        let version = Version { minor, major };
        version.check_supported()?;

        let pool_count = cursor.u16("constant pool count")?;
        if pool_count == 0 {
            return Err(FormatError::BadConstantIndex(0).into());
        }
        let mut pool: Vec<Option<Constant>> = Vec::with_capacity(pool_count as usize);
        pool.push(None);
        while pool.len() < pool_count as usize {
            let constant = ClassReader::read_constant(&mut cursor)?;
            let two_slots = matches!(constant, Constant::Long(_) | Constant::Double(_));
            pool.push(Some(constant));
            if two_slots {
                if pool.len() == pool_count as usize {
                    return Err(FormatError::BadConstantIndex(pool_count - 1).into());
                }
                pool.push(None);
            }
        }

        Ok(ClassReader {
            bytes,
            version,
            pool,
            body_start: cursor.pos(),
        })
    }

    fn read_constant(cursor: &mut ByteCursor<'_>) -> Result<Constant, FormatError> {
        let tag = cursor.u8("constant tag")?;
        Ok(match tag {
            1 => {
                let length = cursor.u16("utf8 length")? as usize;
                let raw = cursor.take(length, "utf8 bytes")?;
                Constant::Utf8(decode_modified_utf8(raw)?)
            }
            3 => Constant::Integer(cursor.i32("integer constant")?),
            4 => Constant::Float(f32::from_bits(cursor.u32("float constant")?)),
            5 => Constant::Long(cursor.i64("long constant")?),
            6 => Constant::Double(f64::from_bits(cursor.u64("double constant")?)),
            7 => Constant::Class(Utf8ConstantIndex(ConstantIndex(cursor.u16("class name")?))),
            8 => Constant::String(Utf8ConstantIndex(ConstantIndex(cursor.u16("string value")?))),
            9 => Constant::FieldRef(
                crate::class_file::ClassConstantIndex(ConstantIndex(cursor.u16("fieldref class")?)),
                NameAndTypeConstantIndex(ConstantIndex(cursor.u16("fieldref name and type")?)),
            ),
            10 | 11 => Constant::MethodRef {
                class: crate::class_file::ClassConstantIndex(ConstantIndex(
                    cursor.u16("methodref class")?,
                )),
                name_and_type: NameAndTypeConstantIndex(ConstantIndex(
                    cursor.u16("methodref name and type")?,
                )),
                is_interface: tag == 11,
            },
            12 => Constant::NameAndType {
                name: Utf8ConstantIndex(ConstantIndex(cursor.u16("name")?)),
                descriptor: Utf8ConstantIndex(ConstantIndex(cursor.u16("descriptor")?)),
            },
            15 => {
                let kind_tag = cursor.u8("method handle kind")?;
                let handle_kind =
                    HandleKind::from_tag(kind_tag).ok_or(FormatError::BadConstantTag(kind_tag))?;
                Constant::MethodHandle {
                    handle_kind,
                    member: ConstantIndex(cursor.u16("method handle member")?),
                }
            }
            16 => Constant::MethodType {
                descriptor: Utf8ConstantIndex(ConstantIndex(cursor.u16("method type")?)),
            },
            17 => Constant::Dynamic {
                bootstrap_method: cursor.u16("dynamic bootstrap method")?,
                name_and_type: NameAndTypeConstantIndex(ConstantIndex(
                    cursor.u16("dynamic name and type")?,
                )),
            },
            18 => Constant::InvokeDynamic {
                bootstrap_method: cursor.u16("invokedynamic bootstrap method")?,
                name_and_type: NameAndTypeConstantIndex(ConstantIndex(
                    cursor.u16("invokedynamic name and type")?,
                )),
            },
            19 => Constant::Module(Utf8ConstantIndex(ConstantIndex(cursor.u16("module name")?))),
            20 => Constant::Package(Utf8ConstantIndex(ConstantIndex(cursor.u16("package name")?))),
            other => return Err(FormatError::BadConstantTag(other)),
        })
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Pool entries in their original order (the phantom slots of two-slot
    /// entries are implicit), as consumed by `ConstantsPool::import`
    pub fn constant_pool(&self) -> impl Iterator<Item = Constant> + '_ {
        self.pool.iter().flatten().cloned()
    }

    // ---------------------------------------------------------------------
    // Pool resolution

    pub(crate) fn entry(&self, index: u16) -> Result<&Constant, FormatError> {
        self.pool
            .get(index as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(FormatError::BadConstantIndex(index))
    }

    pub(crate) fn utf8(&self, index: u16) -> Result<&str, FormatError> {
        match self.entry(index)? {
            Constant::Utf8(text) => Ok(text),
            _ => Err(FormatError::ConstantTypeMismatch {
                index,
                expected: "Utf8",
            }),
        }
    }

    /// Resolve a `Class` entry into a reference type (the name may be an
    /// array descriptor)
    pub(crate) fn class_ref(&self, index: u16) -> Result<RefType<BinaryName>, FormatError> {
        match self.entry(index)? {
            Constant::Class(name) => RefType::parse_class_info(self.utf8(name.0 .0)?),
            _ => Err(FormatError::ConstantTypeMismatch {
                index,
                expected: "Class",
            }),
        }
    }

    /// Resolve a `Class` entry that must name a plain (non-array) class
    pub(crate) fn class_name(&self, index: u16) -> Result<BinaryName, FormatError> {
        match self.class_ref(index)? {
            RefType::Object(name) => Ok(name),
            _ => Err(FormatError::ConstantTypeMismatch {
                index,
                expected: "non-array Class",
            }),
        }
    }

    fn name_and_type(&self, index: u16) -> Result<(&str, &str), FormatError> {
        match self.entry(index)? {
            Constant::NameAndType { name, descriptor } => {
                Ok((self.utf8(name.0 .0)?, self.utf8(descriptor.0 .0)?))
            }
            _ => Err(FormatError::ConstantTypeMismatch {
                index,
                expected: "NameAndType",
            }),
        }
    }

    pub(crate) fn field_ref(&self, index: u16) -> Result<FieldRef, FormatError> {
        match self.entry(index)? {
            Constant::FieldRef(class, name_and_type) => {
                let class = self.class_name(class.0 .0)?;
                let (name, descriptor) = self.name_and_type(name_and_type.0 .0)?;
                Ok(FieldRef {
                    class,
                    name: UnqualifiedName::from_string(name.to_string())?,
                    descriptor: FieldType::parse(descriptor)?,
                })
            }
            _ => Err(FormatError::ConstantTypeMismatch {
                index,
                expected: "Fieldref",
            }),
        }
    }

    pub(crate) fn method_ref(&self, index: u16) -> Result<MethodRef, FormatError> {
        match self.entry(index)? {
            Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            } => {
                let class = self.class_ref(class.0 .0)?;
                let (name, descriptor) = self.name_and_type(name_and_type.0 .0)?;
                Ok(MethodRef {
                    class,
                    name: UnqualifiedName::from_string(name.to_string())?,
                    descriptor: MethodDescriptor::parse(descriptor)?,
                    is_interface: *is_interface,
                })
            }
            _ => Err(FormatError::ConstantTypeMismatch {
                index,
                expected: "Methodref",
            }),
        }
    }

    fn handle(&self, index: u16) -> Result<Handle, FormatError> {
        match self.entry(index)? {
            Constant::MethodHandle {
                handle_kind,
                member,
            } => {
                if handle_kind.is_field_kind() {
                    Ok(Handle::Field(*handle_kind, self.field_ref(member.0)?))
                } else {
                    Ok(Handle::Method(*handle_kind, self.method_ref(member.0)?))
                }
            }
            _ => Err(FormatError::ConstantTypeMismatch {
                index,
                expected: "MethodHandle",
            }),
        }
    }

    /// Resolve a loadable constant (`ldc` operand, field initializer,
    /// bootstrap argument)
    pub(crate) fn constant_data(
        &self,
        index: u16,
        bootstrap: &BootstrapTable,
        depth: u8,
    ) -> Result<ConstantData, FormatError> {
        if depth > MAX_CONSTANT_DEPTH {
            log::error!("constant pool entry {} nests too deep (cyclic?)", index);
            return Err(FormatError::BadConstantIndex(index));
        }
        Ok(match self.entry(index)? {
            Constant::Integer(value) => ConstantData::Integer(*value),
            Constant::Float(value) => ConstantData::Float(*value),
            Constant::Long(value) => ConstantData::Long(*value),
            Constant::Double(value) => ConstantData::Double(*value),
            Constant::String(utf8) => ConstantData::String(self.utf8(utf8.0 .0)?.to_string()),
            Constant::Class(_) => ConstantData::Class(self.class_ref(index)?),
            Constant::MethodHandle { .. } => ConstantData::MethodHandle(self.handle(index)?),
            Constant::MethodType { descriptor } => {
                ConstantData::MethodType(MethodDescriptor::parse(self.utf8(descriptor.0 .0)?)?)
            }
            Constant::Dynamic {
                bootstrap_method,
                name_and_type,
            } => {
                let (name, descriptor) = self.name_and_type(name_and_type.0 .0)?;
                ConstantData::Dynamic(Box::new(DynamicRef {
                    name: UnqualifiedName::from_string(name.to_string())?,
                    descriptor: FieldType::parse(descriptor)?,
                    bootstrap: self.bootstrap_method(*bootstrap_method, bootstrap, depth + 1)?,
                }))
            }
            _ => {
                return Err(FormatError::ConstantTypeMismatch {
                    index,
                    expected: "loadable constant",
                })
            }
        })
    }

    pub(crate) fn invoke_dynamic(
        &self,
        index: u16,
        bootstrap: &BootstrapTable,
    ) -> Result<InvokeDynamicRef, FormatError> {
        match self.entry(index)? {
            Constant::InvokeDynamic {
                bootstrap_method,
                name_and_type,
            } => {
                let (name, descriptor) = self.name_and_type(name_and_type.0 .0)?;
                Ok(InvokeDynamicRef {
                    name: UnqualifiedName::from_string(name.to_string())?,
                    descriptor: MethodDescriptor::parse(descriptor)?,
                    bootstrap: self.bootstrap_method(*bootstrap_method, bootstrap, 0)?,
                })
            }
            _ => Err(FormatError::ConstantTypeMismatch {
                index,
                expected: "InvokeDynamic",
            }),
        }
    }

    fn bootstrap_method(
        &self,
        bootstrap_index: u16,
        bootstrap: &BootstrapTable,
        depth: u8,
    ) -> Result<BootstrapMethod, FormatError> {
        let (handle_index, argument_indices) = bootstrap
            .get(bootstrap_index as usize)
            .ok_or(FormatError::BadConstantIndex(bootstrap_index))?;
        let handle = self.handle(*handle_index)?;
        let arguments = argument_indices
            .iter()
            .map(|argument| self.constant_data(*argument, bootstrap, depth + 1))
            .collect::<Result<Vec<ConstantData>, FormatError>>()?;
        Ok(BootstrapMethod { handle, arguments })
    }

    // ---------------------------------------------------------------------
    // The forward pass

    /// Drive a visitor over the class
    pub fn accept<V: ClassVisitor>(
        &self,
        visitor: &mut V,
        options: ReaderOptions,
    ) -> Result<(), Error> {
        let mut cursor = ByteCursor::new(self.bytes);
        cursor.skip(self.body_start, "class body")?;

        let access_flags = ClassAccessFlags::from_bits_truncate(cursor.u16("access flags")?);
        let this_class = self.class_name(cursor.u16("this class")?)?;
        let super_index = cursor.u16("super class")?;
        let super_class = if super_index == 0 {
            None
        } else {
            Some(self.class_name(super_index)?)
        };
        let interface_count = cursor.u16("interface count")?;
        let mut interfaces = Vec::with_capacity(interface_count as usize);
        for _ in 0..interface_count {
            interfaces.push(self.class_name(cursor.u16("interface")?)?);
        }

        // The class attributes sit physically after the members, but some of
        // them surface as events that must arrive first (and bootstrap
        // methods are needed to decode `invokedynamic`), so jump ahead and
        // collect them before walking the members.
        let members_start = cursor.pos();
        self.skip_members(&mut cursor)?;
        self.skip_members(&mut cursor)?;
        let class_attributes = self.read_class_attributes(&mut cursor, options)?;
        if !cursor.at_end() {
            log::warn!("{} trailing bytes after class attributes", cursor.remaining());
        }

        visitor.visit_header(&ClassHeader {
            version: self.version,
            access_flags,
            this_class: this_class.clone(),
            super_class,
            interfaces,
        })?;
        if let Some(source_file) = &class_attributes.source_file {
            visitor.visit_source(source_file)?;
        }
        if let Some(signature) = &class_attributes.signature {
            visitor.visit_signature(signature)?;
        }
        for inner_class in &class_attributes.inner_classes {
            visitor.visit_inner_class(inner_class)?;
        }
        if let Some(host) = &class_attributes.nest_host {
            visitor.visit_nest_host(host)?;
        }
        for member in &class_attributes.nest_members {
            visitor.visit_nest_member(member)?;
        }

        // Members
        let mut cursor = ByteCursor::new(self.bytes);
        cursor.skip(members_start, "class members")?;
        self.read_fields(&mut cursor, visitor, &class_attributes.bootstrap)?;
        self.read_methods(
            &mut cursor,
            visitor,
            options,
            &class_attributes.bootstrap,
            &this_class,
        )?;

        for attribute in &class_attributes.opaque {
            visitor.visit_attribute(attribute)?;
        }
        visitor.visit_end()
    }

    /// Skip over a fields or methods section using only length prefixes
    fn skip_members(&self, cursor: &mut ByteCursor<'_>) -> Result<(), Error> {
        let count = cursor.u16("member count")?;
        for _ in 0..count {
            cursor.skip(6, "member header")?;
            let attribute_count = cursor.u16("member attribute count")?;
            for _ in 0..attribute_count {
                cursor.skip(2, "attribute name")?;
                let length = cursor.u32("attribute length")? as usize;
                cursor.skip(length, "attribute body")?;
            }
        }
        Ok(())
    }

    fn read_class_attributes(
        &self,
        cursor: &mut ByteCursor<'a>,
        options: ReaderOptions,
    ) -> Result<ClassAttributes, Error> {
        let mut collected = ClassAttributes::default();

        let attribute_count = cursor.u16("class attribute count")?;
        for _ in 0..attribute_count {
            let name = self.utf8(cursor.u16("attribute name")?)?;
            let length = cursor.u32("attribute length")? as usize;
            let body = cursor.take(length, "attribute body")?;
            let mut body_cursor = ByteCursor::new(body);

            match name {
                "SourceFile" => {
                    let source_file = self.utf8(body_cursor.u16("source file")?)?;
                    if !options.contains(ReaderOptions::SKIP_DEBUG) {
                        collected.source_file = Some(source_file.to_string());
                    }
                }
                "Signature" => {
                    collected.signature =
                        Some(self.utf8(body_cursor.u16("signature")?)?.to_string());
                }
                "InnerClasses" => {
                    let count = body_cursor.u16("inner class count")?;
                    for _ in 0..count {
                        let inner_class = self.class_name(body_cursor.u16("inner class")?)?;
                        let outer_index = body_cursor.u16("outer class")?;
                        let outer_class = if outer_index == 0 {
                            None
                        } else {
                            Some(self.class_name(outer_index)?)
                        };
                        let name_index = body_cursor.u16("inner name")?;
                        let inner_name = if name_index == 0 {
                            None
                        } else {
                            Some(self.utf8(name_index)?.to_string())
                        };
                        let access_flags = InnerClassAccessFlags::from_bits_truncate(
                            body_cursor.u16("inner class access flags")?,
                        );
                        collected.inner_classes.push(InnerClassInfo {
                            inner_class,
                            outer_class,
                            inner_name,
                            access_flags,
                        });
                    }
                }
                "NestHost" => {
                    collected.nest_host = Some(self.class_name(body_cursor.u16("nest host")?)?);
                }
                "NestMembers" => {
                    let count = body_cursor.u16("nest member count")?;
                    for _ in 0..count {
                        collected
                            .nest_members
                            .push(self.class_name(body_cursor.u16("nest member")?)?);
                    }
                }
                "BootstrapMethods" => {
                    let count = body_cursor.u16("bootstrap method count")?;
                    for _ in 0..count {
                        let handle = body_cursor.u16("bootstrap method handle")?;
                        let argument_count = body_cursor.u16("bootstrap argument count")?;
                        let mut arguments = Vec::with_capacity(argument_count as usize);
                        for _ in 0..argument_count {
                            arguments.push(body_cursor.u16("bootstrap argument")?);
                        }
                        collected.bootstrap.push((handle, arguments));
                    }
                }
                other => collected.opaque.push(RawAttribute {
                    name: other.to_string(),
                    info: body.to_vec(),
                }),
            }
        }

        Ok(collected)
    }

    fn read_fields<V: ClassVisitor>(
        &self,
        cursor: &mut ByteCursor<'a>,
        visitor: &mut V,
        bootstrap: &BootstrapTable,
    ) -> Result<(), Error> {
        let count = cursor.u16("field count")?;
        for _ in 0..count {
            let access_flags = FieldAccessFlags::from_bits_truncate(cursor.u16("field access")?);
            let name = UnqualifiedName::from_string(
                self.utf8(cursor.u16("field name")?)?.to_string(),
            )?;
            let descriptor = FieldType::parse(self.utf8(cursor.u16("field descriptor")?)?)?;

            let mut signature: Option<String> = None;
            let mut constant_value: Option<ConstantData> = None;
            let mut opaque: Vec<RawAttribute> = vec![];
            let attribute_count = cursor.u16("field attribute count")?;
            for _ in 0..attribute_count {
                let attr_name = self.utf8(cursor.u16("attribute name")?)?;
                let length = cursor.u32("attribute length")? as usize;
                let body = cursor.take(length, "attribute body")?;
                let mut body_cursor = ByteCursor::new(body);
                match attr_name {
                    "ConstantValue" => {
                        let index = body_cursor.u16("constant value")?;
                        constant_value = Some(self.constant_data(index, bootstrap, 0)?);
                    }
                    "Signature" => {
                        signature = Some(self.utf8(body_cursor.u16("signature")?)?.to_string());
                    }
                    other => opaque.push(RawAttribute {
                        name: other.to_string(),
                        info: body.to_vec(),
                    }),
                }
            }

            if let Some(mut field_visitor) =
                visitor.visit_field(access_flags, &name, &descriptor)?
            {
                if let Some(signature) = &signature {
                    field_visitor.visit_signature(signature)?;
                }
                if let Some(constant_value) = &constant_value {
                    field_visitor.visit_constant_value(constant_value)?;
                }
                for attribute in &opaque {
                    field_visitor.visit_attribute(attribute)?;
                }
                field_visitor.visit_end()?;
            }
        }
        Ok(())
    }

    fn read_methods<V: ClassVisitor>(
        &self,
        cursor: &mut ByteCursor<'a>,
        visitor: &mut V,
        options: ReaderOptions,
        bootstrap: &BootstrapTable,
        this_class: &BinaryName,
    ) -> Result<(), Error> {
        let count = cursor.u16("method count")?;
        for _ in 0..count {
            let access_flags = MethodAccessFlags::from_bits_truncate(cursor.u16("method access")?);
            let name = UnqualifiedName::from_string(
                self.utf8(cursor.u16("method name")?)?.to_string(),
            )?;
            let descriptor = MethodDescriptor::parse(self.utf8(cursor.u16("method descriptor")?)?)?;

            let mut signature: Option<String> = None;
            let mut exceptions: Vec<BinaryName> = vec![];
            let mut code_body: Option<&'a [u8]> = None;
            let mut opaque: Vec<RawAttribute> = vec![];
            let attribute_count = cursor.u16("method attribute count")?;
            for _ in 0..attribute_count {
                let attr_name = self.utf8(cursor.u16("attribute name")?)?;
                let length = cursor.u32("attribute length")? as usize;
                let body = cursor.take(length, "attribute body")?;
                let mut body_cursor = ByteCursor::new(body);
                match attr_name {
                    "Code" => code_body = Some(body),
                    "Exceptions" => {
                        let exception_count = body_cursor.u16("exception count")?;
                        for _ in 0..exception_count {
                            exceptions.push(self.class_name(body_cursor.u16("exception")?)?);
                        }
                    }
                    "Signature" => {
                        signature = Some(self.utf8(body_cursor.u16("signature")?)?.to_string());
                    }
                    other => opaque.push(RawAttribute {
                        name: other.to_string(),
                        info: body.to_vec(),
                    }),
                }
            }

            if let Some(mut method_visitor) =
                visitor.visit_method(access_flags, &name, &descriptor, &exceptions)?
            {
                if let Some(signature) = &signature {
                    method_visitor.visit_signature(signature)?;
                }
                if let Some(body) = code_body {
                    if !options.contains(ReaderOptions::SKIP_CODE) {
                        let ctx = code::MethodContext {
                            this_class,
                            descriptor: &descriptor,
                            is_static: access_flags.contains(MethodAccessFlags::STATIC),
                            is_init: name == UnqualifiedName::INIT,
                        };
                        code::read_code(self, &mut method_visitor, body, options, bootstrap, ctx)?;
                    }
                }
                for attribute in &opaque {
                    method_visitor.visit_attribute(attribute)?;
                }
                method_visitor.visit_end()?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct ClassAttributes {
    source_file: Option<String>,
    signature: Option<String>,
    inner_classes: Vec<InnerClassInfo>,
    nest_host: Option<BinaryName>,
    nest_members: Vec<BinaryName>,
    bootstrap: BootstrapTable,
    opaque: Vec<RawAttribute>,
}
