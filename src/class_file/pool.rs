use crate::class_file::{
    Attribute, AttributeLike, ClassConstantIndex, Constant, ConstantIndex, FieldRefConstantIndex,
    HandleKind, InvokeDynamicConstantIndex, MethodRefConstantIndex, NameAndTypeConstantIndex,
    Serialize, StringConstantIndex, Utf8ConstantIndex,
};
use crate::errors::{Error, FormatError};
use crate::util::{Offset, OffsetVec, Width};
use std::borrow::{Borrow, Cow};
use std::cell::RefCell;
use std::collections::HashMap;

/// Raised when the next entry would push the constant pool past 65535 slots
#[derive(Debug)]
pub struct ConstantPoolOverflow {
    pub constant: Constant,
    pub offset: u16,
}

/// Deduplicated constant pool builder (the encoder's symbol table)
///
/// The pool is append only: entries are interned through the `get_*` methods,
/// which always return the index of an existing structurally-equal entry when
/// one is already present. Only after the pool is fully built up can it be
/// consumed into a regular [`OffsetVec`] for serialization.
///
/// Interning takes `&self` so that the class writer and the method writers it
/// hands out can share one pool without threading `&mut` borrows through
/// every visitor call.
pub struct ConstantsPool {
    inner: RefCell<PoolInner>,
}

struct PoolInner {
    constants: OffsetVec<Constant>,

    utf8s: HashMap<String, Utf8ConstantIndex>,
    strings: HashMap<Utf8ConstantIndex, StringConstantIndex>,
    classes: HashMap<Utf8ConstantIndex, ClassConstantIndex>,
    name_and_types: HashMap<(Utf8ConstantIndex, Utf8ConstantIndex), NameAndTypeConstantIndex>,
    fieldrefs: HashMap<(ClassConstantIndex, NameAndTypeConstantIndex), FieldRefConstantIndex>,
    methodrefs: HashMap<(ClassConstantIndex, NameAndTypeConstantIndex, bool), MethodRefConstantIndex>,
    integers: HashMap<i32, ConstantIndex>,
    floats: HashMap<[u8; 4], ConstantIndex>,
    longs: HashMap<i64, ConstantIndex>,
    doubles: HashMap<[u8; 8], ConstantIndex>,
    method_handles: HashMap<(HandleKind, ConstantIndex), ConstantIndex>,
    method_types: HashMap<Utf8ConstantIndex, ConstantIndex>,
    dynamics: HashMap<(u16, NameAndTypeConstantIndex), ConstantIndex>,
    invoke_dynamics: HashMap<(u16, NameAndTypeConstantIndex), InvokeDynamicConstantIndex>,
    modules: HashMap<Utf8ConstantIndex, ConstantIndex>,
    packages: HashMap<Utf8ConstantIndex, ConstantIndex>,
}

impl PoolInner {
    /// Push a constant into the pool, provided there is space for it
    ///
    /// The largest valid index is 65535, indexing starts at 1, and some
    /// constants take two slots.
    fn push_constant(&mut self, constant: Constant) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let offset: u16 = self.constants.offset_len().0 as u16;
        if offset.checked_add(constant.width() as u16).is_none() {
            return Err(ConstantPoolOverflow { constant, offset });
        }
        self.constants.push(constant);
        Ok(ConstantIndex(offset))
    }
}

impl Default for ConstantsPool {
    fn default() -> ConstantsPool {
        ConstantsPool::new()
    }
}

impl ConstantsPool {
    /// Make a fresh empty constants pool
    pub fn new() -> ConstantsPool {
        ConstantsPool {
            inner: RefCell::new(PoolInner {
                constants: OffsetVec::new_starting_at(Offset(1)),
                utf8s: HashMap::new(),
                strings: HashMap::new(),
                classes: HashMap::new(),
                name_and_types: HashMap::new(),
                fieldrefs: HashMap::new(),
                methodrefs: HashMap::new(),
                integers: HashMap::new(),
                floats: HashMap::new(),
                longs: HashMap::new(),
                doubles: HashMap::new(),
                method_handles: HashMap::new(),
                method_types: HashMap::new(),
                dynamics: HashMap::new(),
                invoke_dynamics: HashMap::new(),
                modules: HashMap::new(),
                packages: HashMap::new(),
            }),
        }
    }

    /// Seed the pool with the entries of an already-decoded class, in their
    /// original order, so that original indices are preserved verbatim
    ///
    /// This is the "copy from source" optimization: when a class is decoded
    /// and re-encoded, bytecode that was carried over unchanged keeps meaning
    /// the same thing without rewriting, and later interning reuses the
    /// imported entries instead of appending duplicates.
    pub fn import<I>(entries: I) -> Result<ConstantsPool, Error>
    where
        I: IntoIterator<Item = Constant>,
    {
        let pool = ConstantsPool::new();
        {
            let inner = &mut *pool.inner.borrow_mut();
            for constant in entries {
                let index = inner.push_constant(constant.clone())?;
                match constant {
                    Constant::Utf8(text) => {
                        // First occurrence wins so interning is deterministic
                        inner
                            .utf8s
                            .entry(text)
                            .or_insert(Utf8ConstantIndex(index));
                    }
                    Constant::Integer(value) => {
                        inner.integers.entry(value).or_insert(index);
                    }
                    Constant::Float(value) => {
                        inner.floats.entry(value.to_be_bytes()).or_insert(index);
                    }
                    Constant::Long(value) => {
                        inner.longs.entry(value).or_insert(index);
                    }
                    Constant::Double(value) => {
                        inner.doubles.entry(value.to_be_bytes()).or_insert(index);
                    }
                    Constant::Class(utf8) => {
                        inner
                            .classes
                            .entry(utf8)
                            .or_insert(ClassConstantIndex(index));
                    }
                    Constant::String(utf8) => {
                        inner
                            .strings
                            .entry(utf8)
                            .or_insert(StringConstantIndex(index));
                    }
                    Constant::FieldRef(class, name_and_type) => {
                        inner
                            .fieldrefs
                            .entry((class, name_and_type))
                            .or_insert(FieldRefConstantIndex(index));
                    }
                    Constant::MethodRef {
                        class,
                        name_and_type,
                        is_interface,
                    } => {
                        inner
                            .methodrefs
                            .entry((class, name_and_type, is_interface))
                            .or_insert(MethodRefConstantIndex(index));
                    }
                    Constant::NameAndType { name, descriptor } => {
                        inner
                            .name_and_types
                            .entry((name, descriptor))
                            .or_insert(NameAndTypeConstantIndex(index));
                    }
                    Constant::MethodHandle {
                        handle_kind,
                        member,
                    } => {
                        inner
                            .method_handles
                            .entry((handle_kind, member))
                            .or_insert(index);
                    }
                    Constant::MethodType { descriptor } => {
                        inner.method_types.entry(descriptor).or_insert(index);
                    }
                    Constant::Dynamic {
                        bootstrap_method,
                        name_and_type,
                    } => {
                        inner
                            .dynamics
                            .entry((bootstrap_method, name_and_type))
                            .or_insert(index);
                    }
                    Constant::InvokeDynamic {
                        bootstrap_method,
                        name_and_type,
                    } => {
                        inner
                            .invoke_dynamics
                            .entry((bootstrap_method, name_and_type))
                            .or_insert(InvokeDynamicConstantIndex(index));
                    }
                    Constant::Module(utf8) => {
                        inner.modules.entry(utf8).or_insert(index);
                    }
                    Constant::Package(utf8) => {
                        inner.packages.entry(utf8).or_insert(index);
                    }
                }
            }
        }
        Ok(pool)
    }

    /// Number of pool slots used so far (what `constant_pool_count` will be)
    pub fn offset_len(&self) -> Offset {
        self.inner.borrow().constants.offset_len()
    }

    /// Consume the pool and return the final vector of constants
    pub fn into_offset_vec(self) -> OffsetVec<Constant> {
        self.inner.into_inner().constants
    }

    /// Look up the text of an already-interned utf8 constant
    pub fn lookup_utf8(&self, index: Utf8ConstantIndex) -> Result<String, FormatError> {
        let inner = self.inner.borrow();
        match inner.constants.get_offset(Offset(index.0 .0 as usize)).ok() {
            Some(Constant::Utf8(text)) => Ok(text.clone()),
            Some(_) => Err(FormatError::ConstantTypeMismatch {
                index: index.0 .0,
                expected: "Utf8",
            }),
            None => Err(FormatError::BadConstantIndex(index.0 .0)),
        }
    }

    /// Get or insert a utf8 constant
    pub fn get_utf8<'a, S: Into<Cow<'a, str>>>(
        &self,
        utf8: S,
    ) -> Result<Utf8ConstantIndex, ConstantPoolOverflow> {
        let cow = utf8.into();
        let inner = &mut *self.inner.borrow_mut();
        if let Some(idx) = inner.utf8s.get::<str>(cow.borrow()) {
            Ok(*idx)
        } else {
            let owned = cow.into_owned();
            let idx = Utf8ConstantIndex(inner.push_constant(Constant::Utf8(owned.clone()))?);
            inner.utf8s.insert(owned, idx);
            Ok(idx)
        }
    }

    /// Get or insert a string constant
    pub fn get_string(
        &self,
        utf8: Utf8ConstantIndex,
    ) -> Result<StringConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        if let Some(idx) = inner.strings.get(&utf8) {
            Ok(*idx)
        } else {
            let idx = StringConstantIndex(inner.push_constant(Constant::String(utf8))?);
            inner.strings.insert(utf8, idx);
            Ok(idx)
        }
    }

    /// Get or insert a class constant
    pub fn get_class(
        &self,
        name: Utf8ConstantIndex,
    ) -> Result<ClassConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        if let Some(idx) = inner.classes.get(&name) {
            Ok(*idx)
        } else {
            let idx = ClassConstantIndex(inner.push_constant(Constant::Class(name))?);
            inner.classes.insert(name, idx);
            Ok(idx)
        }
    }

    /// Get or insert a name & type constant
    pub fn get_name_and_type(
        &self,
        name: Utf8ConstantIndex,
        descriptor: Utf8ConstantIndex,
    ) -> Result<NameAndTypeConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        let key = (name, descriptor);
        if let Some(idx) = inner.name_and_types.get(&key) {
            Ok(*idx)
        } else {
            let constant = Constant::NameAndType { name, descriptor };
            let idx = NameAndTypeConstantIndex(inner.push_constant(constant)?);
            inner.name_and_types.insert(key, idx);
            Ok(idx)
        }
    }

    /// Get or insert a field reference constant
    pub fn get_field_ref(
        &self,
        class: ClassConstantIndex,
        name_and_type: NameAndTypeConstantIndex,
    ) -> Result<FieldRefConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        let key = (class, name_and_type);
        if let Some(idx) = inner.fieldrefs.get(&key) {
            Ok(*idx)
        } else {
            let constant = Constant::FieldRef(class, name_and_type);
            let idx = FieldRefConstantIndex(inner.push_constant(constant)?);
            inner.fieldrefs.insert(key, idx);
            Ok(idx)
        }
    }

    /// Get or insert a method reference constant
    pub fn get_method_ref(
        &self,
        class: ClassConstantIndex,
        name_and_type: NameAndTypeConstantIndex,
        is_interface: bool,
    ) -> Result<MethodRefConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        let key = (class, name_and_type, is_interface);
        if let Some(idx) = inner.methodrefs.get(&key) {
            Ok(*idx)
        } else {
            let constant = Constant::MethodRef {
                class,
                name_and_type,
                is_interface,
            };
            let idx = MethodRefConstantIndex(inner.push_constant(constant)?);
            inner.methodrefs.insert(key, idx);
            Ok(idx)
        }
    }

    /// Get or insert an integer constant
    pub fn get_integer(&self, value: i32) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        if let Some(idx) = inner.integers.get(&value) {
            Ok(*idx)
        } else {
            let idx = inner.push_constant(Constant::Integer(value))?;
            inner.integers.insert(value, idx);
            Ok(idx)
        }
    }

    /// Get or insert a float constant (keyed by raw bits, so NaNs dedup too)
    pub fn get_float(&self, value: f32) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        let bits = value.to_be_bytes();
        if let Some(idx) = inner.floats.get(&bits) {
            Ok(*idx)
        } else {
            let idx = inner.push_constant(Constant::Float(value))?;
            inner.floats.insert(bits, idx);
            Ok(idx)
        }
    }

    /// Get or insert a long constant
    pub fn get_long(&self, value: i64) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        if let Some(idx) = inner.longs.get(&value) {
            Ok(*idx)
        } else {
            let idx = inner.push_constant(Constant::Long(value))?;
            inner.longs.insert(value, idx);
            Ok(idx)
        }
    }

    /// Get or insert a double constant (keyed by raw bits)
    pub fn get_double(&self, value: f64) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        let bits = value.to_be_bytes();
        if let Some(idx) = inner.doubles.get(&bits) {
            Ok(*idx)
        } else {
            let idx = inner.push_constant(Constant::Double(value))?;
            inner.doubles.insert(bits, idx);
            Ok(idx)
        }
    }

    /// Get or insert a method handle constant
    pub fn get_method_handle(
        &self,
        handle_kind: HandleKind,
        member: ConstantIndex,
    ) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        let key = (handle_kind, member);
        if let Some(idx) = inner.method_handles.get(&key) {
            Ok(*idx)
        } else {
            let constant = Constant::MethodHandle {
                handle_kind,
                member,
            };
            let idx = inner.push_constant(constant)?;
            inner.method_handles.insert(key, idx);
            Ok(idx)
        }
    }

    /// Get or insert a method type constant
    pub fn get_method_type(
        &self,
        descriptor: Utf8ConstantIndex,
    ) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        if let Some(idx) = inner.method_types.get(&descriptor) {
            Ok(*idx)
        } else {
            let idx = inner.push_constant(Constant::MethodType { descriptor })?;
            inner.method_types.insert(descriptor, idx);
            Ok(idx)
        }
    }

    /// Get or insert a dynamically-computed constant
    pub fn get_dynamic(
        &self,
        bootstrap_method: u16,
        name_and_type: NameAndTypeConstantIndex,
    ) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        let key = (bootstrap_method, name_and_type);
        if let Some(idx) = inner.dynamics.get(&key) {
            Ok(*idx)
        } else {
            let constant = Constant::Dynamic {
                bootstrap_method,
                name_and_type,
            };
            let idx = inner.push_constant(constant)?;
            inner.dynamics.insert(key, idx);
            Ok(idx)
        }
    }

    /// Get or insert an invoke dynamic constant
    pub fn get_invoke_dynamic(
        &self,
        bootstrap_method: u16,
        name_and_type: NameAndTypeConstantIndex,
    ) -> Result<InvokeDynamicConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        let key = (bootstrap_method, name_and_type);
        if let Some(idx) = inner.invoke_dynamics.get(&key) {
            Ok(*idx)
        } else {
            let constant = Constant::InvokeDynamic {
                bootstrap_method,
                name_and_type,
            };
            let idx = InvokeDynamicConstantIndex(inner.push_constant(constant)?);
            inner.invoke_dynamics.insert(key, idx);
            Ok(idx)
        }
    }

    /// Get or insert a module constant
    pub fn get_module(&self, name: Utf8ConstantIndex) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        if let Some(idx) = inner.modules.get(&name) {
            Ok(*idx)
        } else {
            let idx = inner.push_constant(Constant::Module(name))?;
            inner.modules.insert(name, idx);
            Ok(idx)
        }
    }

    /// Get or insert a package constant
    pub fn get_package(
        &self,
        name: Utf8ConstantIndex,
    ) -> Result<ConstantIndex, ConstantPoolOverflow> {
        let inner = &mut *self.inner.borrow_mut();
        if let Some(idx) = inner.packages.get(&name) {
            Ok(*idx)
        } else {
            let idx = inner.push_constant(Constant::Package(name))?;
            inner.packages.insert(name, idx);
            Ok(idx)
        }
    }

    /// Serialize an attribute body and intern its name
    pub fn get_attribute<A: AttributeLike>(&self, attribute: A) -> Result<Attribute, Error> {
        let name_index = self.get_utf8(A::NAME)?;
        let mut info = vec![];
        attribute.serialize(&mut info).map_err(Error::IoError)?;
        Ok(Attribute { name_index, info })
    }

    /// Intern a raw attribute (name + opaque payload)
    pub fn get_raw_attribute(
        &self,
        name: &str,
        info: Vec<u8>,
    ) -> Result<Attribute, ConstantPoolOverflow> {
        let name_index = self.get_utf8(name)?;
        Ok(Attribute { name_index, info })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn utf8_interning_is_idempotent() {
        let pool = ConstantsPool::new();
        let idx1 = pool.get_utf8("java/lang/Object").unwrap();
        let idx2 = pool.get_utf8(String::from("java/lang/Object")).unwrap();
        assert_eq!(idx1, idx2);
        assert_eq!(pool.offset_len(), Offset(2), "one entry, starting at 1");
    }

    #[test]
    fn wide_constants_take_two_slots() {
        let pool = ConstantsPool::new();
        let long_idx = pool.get_long(42).unwrap();
        let next_idx = pool.get_utf8("x").unwrap();
        assert_eq!(long_idx, ConstantIndex(1));
        assert_eq!(ConstantIndex::from(next_idx), ConstantIndex(3));
    }

    #[test]
    fn import_preserves_indices() {
        let entries = vec![
            Constant::Utf8(String::from("Foo")),
            Constant::Class(Utf8ConstantIndex(ConstantIndex(1))),
            Constant::Long(7),
            Constant::Utf8(String::from("Bar")),
        ];
        let pool = ConstantsPool::import(entries).unwrap();

        assert_eq!(
            pool.get_utf8("Foo").unwrap(),
            Utf8ConstantIndex(ConstantIndex(1))
        );
        assert_eq!(
            pool.get_class(Utf8ConstantIndex(ConstantIndex(1))).unwrap(),
            ClassConstantIndex(ConstantIndex(2))
        );
        assert_eq!(pool.get_long(7).unwrap(), ConstantIndex(3));
        assert_eq!(
            pool.get_utf8("Bar").unwrap(),
            Utf8ConstantIndex(ConstantIndex(5))
        );
        assert_eq!(pool.offset_len(), Offset(6));
    }

    #[test]
    fn overflow_is_detected() {
        let pool = ConstantsPool::new();
        for i in 0..32767 {
            pool.get_long(i).unwrap();
        }
        assert_eq!(pool.offset_len(), Offset(65535));
        assert!(pool.get_long(99999).is_err());
        assert!(pool.get_utf8("no space").is_err());
    }
}
