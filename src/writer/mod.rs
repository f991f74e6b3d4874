//! The encoder: a visitor implementation that accumulates byte fragments per
//! member and assembles them, the constant pool, and all length prefixes
//! into a single buffer at the end
//!
//! Nothing is flushed until [`ClassWriter::into_bytes`]: pool indices and
//! jump offsets are only known once the whole class has been visited.

mod method;

pub use method::MethodWriter;

use crate::access_flags::{ClassAccessFlags, FieldAccessFlags, MethodAccessFlags};
use crate::class_file::{
    Attribute, BootstrapMethodEntry, BootstrapMethods, ClassConstantIndex, ClassFile, ConstantIndex,
    ConstantValue, ConstantsPool, Exceptions, Field, InnerClass, InnerClasses, Method, NestHost,
    NestMembers, Serialize, Signature, SourceFile, Utf8ConstantIndex, Version,
};
use crate::code::{BootstrapMethod, ConstantData, FieldRef, Handle, InvokeDynamicRef, MethodRef};
use crate::descriptors::{FieldType, MethodDescriptor, RefType, RenderDescriptor};
use crate::errors::Error;
use crate::hierarchy::ClassHierarchy;
use crate::names::{BinaryName, Name, UnqualifiedName};
use crate::reader::ClassReader;
use crate::visitor::{ClassHeader, ClassVisitor, FieldVisitor, InnerClassInfo, RawAttribute};
use bitflags::bitflags;
use std::cell::RefCell;

bitflags! {
    /// Independently togglable encoder behaviors
    pub struct WriterOptions: u32 {
        /// Recompute max stack and max locals, ignoring `visit_maxs`
        const COMPUTE_MAXS = 1;

        /// Recompute stack map frames from scratch, ignoring `visit_frame`
        /// (implies `COMPUTE_MAXS`); requires a hierarchy resolver
        const COMPUTE_FRAMES = 2;
    }
}

impl WriterOptions {
    pub(crate) fn compute_frames(self) -> bool {
        self.contains(WriterOptions::COMPUTE_FRAMES)
    }

    pub(crate) fn compute_maxs(self) -> bool {
        self.intersects(WriterOptions::COMPUTE_MAXS | WriterOptions::COMPUTE_FRAMES)
    }
}

pub(crate) struct ClassState {
    pub header: Option<HeaderState>,
    pub source_file: Option<Attribute>,
    pub signature: Option<Attribute>,
    pub inner_classes: Vec<InnerClass>,
    pub nest_host: Option<ClassConstantIndex>,
    pub nest_members: Vec<ClassConstantIndex>,
    pub fields: Vec<Field>,
    pub methods: Vec<Method>,
    pub attributes: Vec<Attribute>,
    pub bootstrap_methods: Vec<BootstrapMethodEntry>,
    pub bootstrap_lookup: Vec<(ConstantIndex, Vec<ConstantIndex>)>,
    pub finished: bool,
}

pub(crate) struct HeaderState {
    pub version: Version,
    pub access_flags: ClassAccessFlags,
    pub this_class_name: BinaryName,
    pub this_class: ClassConstantIndex,
    pub super_class: ClassConstantIndex,
    pub interfaces: Vec<ClassConstantIndex>,
}

/// The encoder's class-level half
///
/// Holds the shared [`ConstantsPool`] and collects finished members. All
/// interning goes through `&self` (the pool is interior-mutable), which is
/// what lets the method writers it hands out coexist with it.
pub struct ClassWriter<'h> {
    pub(crate) options: WriterOptions,
    pub(crate) constants: ConstantsPool,
    pub(crate) state: RefCell<ClassState>,
    pub(crate) hierarchy: Option<&'h dyn ClassHierarchy>,
}

impl<'h> ClassWriter<'h> {
    /// Encoder starting from an empty constant pool
    pub fn new(options: WriterOptions) -> ClassWriter<'h> {
        ClassWriter::with_pool(options, ConstantsPool::new())
    }

    /// Encoder reusing the constant pool of an already-decoded class
    ///
    /// Entries keep their original indices, so opaque attribute payloads and
    /// unchanged bytecode keep meaning the same thing, and nothing already
    /// in the pool is ever re-emitted under a new index.
    pub fn with_pool_from(
        reader: &ClassReader<'_>,
        options: WriterOptions,
    ) -> Result<ClassWriter<'h>, Error> {
        let pool = ConstantsPool::import(reader.constant_pool())?;
        Ok(ClassWriter::with_pool(options, pool))
    }

    fn with_pool(options: WriterOptions, constants: ConstantsPool) -> ClassWriter<'h> {
        ClassWriter {
            options,
            constants,
            state: RefCell::new(ClassState {
                header: None,
                source_file: None,
                signature: None,
                inner_classes: vec![],
                nest_host: None,
                nest_members: vec![],
                fields: vec![],
                methods: vec![],
                attributes: vec![],
                bootstrap_methods: vec![],
                bootstrap_lookup: vec![],
                finished: false,
            }),
            hierarchy: None,
        }
    }

    /// Provide the class hierarchy resolver `COMPUTE_FRAMES` merges through
    pub fn with_hierarchy(mut self, hierarchy: &'h dyn ClassHierarchy) -> ClassWriter<'h> {
        self.hierarchy = Some(hierarchy);
        self
    }

    /// Finish and serialize the class
    ///
    /// This is the only point at which bytes are produced; every failure
    /// before this produces no output at all.
    pub fn into_bytes(self) -> Result<Vec<u8>, Error> {
        let state = self.state.into_inner();
        if !state.finished {
            return Err(Error::VisitOrder("into_bytes before visit_end"));
        }
        let header = state
            .header
            .ok_or(Error::VisitOrder("class has no header"))?;

        let mut attributes = state.attributes;
        if let Some(source_file) = state.source_file {
            attributes.insert(0, source_file);
        }
        if let Some(signature) = state.signature {
            attributes.insert(0, signature);
        }
        if !state.inner_classes.is_empty() {
            attributes.push(
                self.constants
                    .get_attribute(InnerClasses(state.inner_classes))?,
            );
        }
        if let Some(host) = state.nest_host {
            attributes.push(self.constants.get_attribute(NestHost(host))?);
        }
        if !state.nest_members.is_empty() {
            attributes.push(
                self.constants
                    .get_attribute(NestMembers(state.nest_members))?,
            );
        }
        if !state.bootstrap_methods.is_empty() {
            attributes.push(
                self.constants
                    .get_attribute(BootstrapMethods(state.bootstrap_methods))?,
            );
        }

        let class_file = ClassFile {
            version: header.version,
            constants: self.constants.into_offset_vec(),
            access_flags: header.access_flags,
            this_class: header.this_class,
            super_class: header.super_class,
            interfaces: header.interfaces,
            fields: state.fields,
            methods: state.methods,
            attributes,
        };

        let mut class_bytes: Vec<u8> = vec![];
        class_file.serialize(&mut class_bytes).map_err(Error::IoError)?;
        Ok(class_bytes)
    }

    /// Name of the class being written (available once the header was
    /// visited)
    pub(crate) fn this_class_name(&self) -> Result<BinaryName, Error> {
        self.state
            .borrow()
            .header
            .as_ref()
            .map(|header| header.this_class_name.clone())
            .ok_or(Error::VisitOrder("member visited before class header"))
    }

    pub(crate) fn class_index(&self, name: &BinaryName) -> Result<ClassConstantIndex, Error> {
        let utf8 = self.constants.get_utf8(name.as_str())?;
        Ok(self.constants.get_class(utf8)?)
    }

    pub(crate) fn ref_type_index(
        &self,
        ref_type: &RefType<BinaryName>,
    ) -> Result<ClassConstantIndex, Error> {
        let utf8 = self.constants.get_utf8(ref_type.render_class_info())?;
        Ok(self.constants.get_class(utf8)?)
    }

    pub(crate) fn field_ref_index(
        &self,
        field: &FieldRef,
    ) -> Result<crate::class_file::FieldRefConstantIndex, Error> {
        let class = self.class_index(&field.class)?;
        let name = self.constants.get_utf8(field.name.as_str())?;
        let descriptor = self.constants.get_utf8(field.descriptor.render())?;
        let name_and_type = self.constants.get_name_and_type(name, descriptor)?;
        Ok(self.constants.get_field_ref(class, name_and_type)?)
    }

    pub(crate) fn method_ref_index(
        &self,
        method: &MethodRef,
    ) -> Result<crate::class_file::MethodRefConstantIndex, Error> {
        let class = self.ref_type_index(&method.class)?;
        let name = self.constants.get_utf8(method.name.as_str())?;
        let descriptor = self.constants.get_utf8(method.descriptor.render())?;
        let name_and_type = self.constants.get_name_and_type(name, descriptor)?;
        Ok(self
            .constants
            .get_method_ref(class, name_and_type, method.is_interface)?)
    }

    pub(crate) fn handle_index(&self, handle: &Handle) -> Result<ConstantIndex, Error> {
        let member: ConstantIndex = match handle {
            Handle::Field(_, field) => self.field_ref_index(field)?.into(),
            Handle::Method(_, method) => self.method_ref_index(method)?.into(),
        };
        Ok(self.constants.get_method_handle(handle.kind(), member)?)
    }

    /// Intern a loadable constant, returning the index `ldc`-family
    /// instructions will carry
    pub(crate) fn constant_data_index(&self, data: &ConstantData) -> Result<ConstantIndex, Error> {
        match data {
            ConstantData::Integer(value) => Ok(self.constants.get_integer(*value)?),
            ConstantData::Float(value) => Ok(self.constants.get_float(*value)?),
            ConstantData::Long(value) => Ok(self.constants.get_long(*value)?),
            ConstantData::Double(value) => Ok(self.constants.get_double(*value)?),
            ConstantData::String(value) => {
                let utf8 = self.constants.get_utf8(value.as_str())?;
                Ok(self.constants.get_string(utf8)?.into())
            }
            ConstantData::Class(ref_type) => Ok(self.ref_type_index(ref_type)?.into()),
            ConstantData::MethodHandle(handle) => self.handle_index(handle),
            ConstantData::MethodType(descriptor) => {
                let utf8 = self.constants.get_utf8(descriptor.render())?;
                Ok(self.constants.get_method_type(utf8)?)
            }
            ConstantData::Dynamic(dynamic) => {
                let bootstrap = self.bootstrap_method_index(&dynamic.bootstrap)?;
                let name = self.constants.get_utf8(dynamic.name.as_str())?;
                let descriptor = self.constants.get_utf8(dynamic.descriptor.render())?;
                let name_and_type = self.constants.get_name_and_type(name, descriptor)?;
                Ok(self.constants.get_dynamic(bootstrap, name_and_type)?)
            }
        }
    }

    pub(crate) fn invoke_dynamic_index(
        &self,
        indy: &InvokeDynamicRef,
    ) -> Result<crate::class_file::InvokeDynamicConstantIndex, Error> {
        let bootstrap = self.bootstrap_method_index(&indy.bootstrap)?;
        let name = self.constants.get_utf8(indy.name.as_str())?;
        let descriptor = self.constants.get_utf8(indy.descriptor.render())?;
        let name_and_type = self.constants.get_name_and_type(name, descriptor)?;
        Ok(self.constants.get_invoke_dynamic(bootstrap, name_and_type)?)
    }

    /// Deduplicate a bootstrap method into the `BootstrapMethods` table,
    /// returning its index therein
    fn bootstrap_method_index(&self, bootstrap: &BootstrapMethod) -> Result<u16, Error> {
        let handle = self.handle_index(&bootstrap.handle)?;
        let arguments = bootstrap
            .arguments
            .iter()
            .map(|argument| self.constant_data_index(argument))
            .collect::<Result<Vec<ConstantIndex>, Error>>()?;

        let mut state = self.state.borrow_mut();
        let key = (handle, arguments);
        if let Some(found) = state
            .bootstrap_lookup
            .iter()
            .position(|existing| *existing == key)
        {
            return Ok(found as u16);
        }
        let index = state.bootstrap_lookup.len() as u16;
        state.bootstrap_lookup.push(key.clone());
        state.bootstrap_methods.push(BootstrapMethodEntry {
            bootstrap_method: key.0,
            bootstrap_arguments: key.1,
        });
        Ok(index)
    }

    pub(crate) fn raw_attribute(&self, attribute: &RawAttribute) -> Result<Attribute, Error> {
        Ok(self
            .constants
            .get_raw_attribute(&attribute.name, attribute.info.clone())?)
    }

    fn signature_attribute(&self, signature: &str) -> Result<Attribute, Error> {
        let signature = self.constants.get_utf8(signature)?;
        self.constants.get_attribute(Signature { signature })
    }
}

impl<'a, 'h> ClassVisitor for &'a ClassWriter<'h> {
    type FieldV = FieldWriter<'a, 'h>;
    type MethodV = MethodWriter<'a, 'h>;

    fn visit_header(&mut self, header: &ClassHeader) -> Result<(), Error> {
        let this_class = self.class_index(&header.this_class)?;
        let super_class = match &header.super_class {
            Some(name) => self.class_index(name)?,
            None => ClassConstantIndex(ConstantIndex(0)),
        };
        let interfaces = header
            .interfaces
            .iter()
            .map(|interface| self.class_index(interface))
            .collect::<Result<Vec<ClassConstantIndex>, Error>>()?;

        let mut state = self.state.borrow_mut();
        if state.header.is_some() {
            return Err(Error::VisitOrder("class header visited twice"));
        }
        state.header = Some(HeaderState {
            version: header.version,
            access_flags: header.access_flags,
            this_class_name: header.this_class.clone(),
            this_class,
            super_class,
            interfaces,
        });
        Ok(())
    }

    fn visit_source(&mut self, source_file: &str) -> Result<(), Error> {
        let utf8 = self.constants.get_utf8(source_file)?;
        let attribute = self.constants.get_attribute(SourceFile(utf8))?;
        self.state.borrow_mut().source_file = Some(attribute);
        Ok(())
    }

    fn visit_signature(&mut self, signature: &str) -> Result<(), Error> {
        let attribute = self.signature_attribute(signature)?;
        self.state.borrow_mut().signature = Some(attribute);
        Ok(())
    }

    fn visit_inner_class(&mut self, inner_class: &InnerClassInfo) -> Result<(), Error> {
        let inner = self.class_index(&inner_class.inner_class)?;
        let outer = match &inner_class.outer_class {
            Some(name) => self.class_index(name)?,
            None => ClassConstantIndex(ConstantIndex(0)),
        };
        let inner_name = match &inner_class.inner_name {
            Some(name) => self.constants.get_utf8(name.as_str())?,
            None => Utf8ConstantIndex(ConstantIndex(0)),
        };
        self.state.borrow_mut().inner_classes.push(InnerClass {
            inner_class: inner,
            outer_class: outer,
            inner_name,
            access_flags: inner_class.access_flags,
        });
        Ok(())
    }

    fn visit_nest_host(&mut self, host: &BinaryName) -> Result<(), Error> {
        let host = self.class_index(host)?;
        self.state.borrow_mut().nest_host = Some(host);
        Ok(())
    }

    fn visit_nest_member(&mut self, member: &BinaryName) -> Result<(), Error> {
        let member = self.class_index(member)?;
        self.state.borrow_mut().nest_members.push(member);
        Ok(())
    }

    fn visit_field(
        &mut self,
        access_flags: FieldAccessFlags,
        name: &UnqualifiedName,
        descriptor: &FieldType<BinaryName>,
    ) -> Result<Option<FieldWriter<'a, 'h>>, Error> {
        // Fail fast if the header never arrived
        let _ = self.this_class_name()?;
        let name_index = self.constants.get_utf8(name.as_str())?;
        let descriptor_index = self.constants.get_utf8(descriptor.render())?;
        Ok(Some(FieldWriter {
            class: *self,
            access_flags,
            name_index,
            descriptor_index,
            attributes: vec![],
        }))
    }

    fn visit_method(
        &mut self,
        access_flags: MethodAccessFlags,
        name: &UnqualifiedName,
        descriptor: &MethodDescriptor<BinaryName>,
        exceptions: &[BinaryName],
    ) -> Result<Option<MethodWriter<'a, 'h>>, Error> {
        MethodWriter::start(*self, access_flags, name, descriptor, exceptions).map(Some)
    }

    fn visit_attribute(&mut self, attribute: &RawAttribute) -> Result<(), Error> {
        let attribute = self.raw_attribute(attribute)?;
        self.state.borrow_mut().attributes.push(attribute);
        Ok(())
    }

    fn visit_end(&mut self) -> Result<(), Error> {
        self.state.borrow_mut().finished = true;
        Ok(())
    }
}

/// The encoder's field-level half
pub struct FieldWriter<'a, 'h> {
    class: &'a ClassWriter<'h>,
    access_flags: FieldAccessFlags,
    name_index: Utf8ConstantIndex,
    descriptor_index: Utf8ConstantIndex,
    attributes: Vec<Attribute>,
}

impl<'a, 'h> FieldVisitor for FieldWriter<'a, 'h> {
    fn visit_signature(&mut self, signature: &str) -> Result<(), Error> {
        let attribute = self.class.signature_attribute(signature)?;
        self.attributes.push(attribute);
        Ok(())
    }

    fn visit_constant_value(&mut self, value: &ConstantData) -> Result<(), Error> {
        let index = self.class.constant_data_index(value)?;
        let attribute = self.class.constants.get_attribute(ConstantValue(index))?;
        self.attributes.push(attribute);
        Ok(())
    }

    fn visit_attribute(&mut self, attribute: &RawAttribute) -> Result<(), Error> {
        let attribute = self.class.raw_attribute(attribute)?;
        self.attributes.push(attribute);
        Ok(())
    }

    fn visit_end(&mut self) -> Result<(), Error> {
        self.class.state.borrow_mut().fields.push(Field {
            access_flags: self.access_flags,
            name_index: self.name_index,
            descriptor_index: self.descriptor_index,
            attributes: std::mem::take(&mut self.attributes),
        });
        Ok(())
    }
}

// Re-exported so `MethodWriter::start` can build the `Exceptions` attribute
pub(crate) fn exceptions_attribute(
    class: &ClassWriter<'_>,
    exceptions: &[BinaryName],
) -> Result<Option<Attribute>, Error> {
    if exceptions.is_empty() {
        return Ok(None);
    }
    let indices = exceptions
        .iter()
        .map(|exception| class.class_index(exception))
        .collect::<Result<Vec<ClassConstantIndex>, Error>>()?;
    Ok(Some(class.constants.get_attribute(Exceptions(indices))?))
}
