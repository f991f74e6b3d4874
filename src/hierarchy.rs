//! Class hierarchy resolution, an injected collaborator of the frame engine
//!
//! Merging two object types needs to answer "what is the nearest common
//! superclass of A and B?", which only something with knowledge of the whole
//! class universe can do. The engine takes that knowledge as a
//! [`ClassHierarchy`] trait object; [`ClassGraph`] is the batteries-included
//! in-memory implementation.

use crate::errors::Error;
use crate::names::{BinaryName, Name};
use elsa::map::FrozenMap;
use std::collections::HashSet;
use typed_arena::Arena;

/// Resolver for superclass relationships
///
/// A failed lookup is fatal to frame computation ([`Error::MissingClass`]):
/// the engine never invents a relationship between types it cannot resolve.
/// Callers who want the conservative behavior instead can register unknown
/// classes as direct subclasses of `java/lang/Object`.
pub trait ClassHierarchy {
    /// Direct superclass, `None` only for `java/lang/Object`
    fn super_class(&self, class: &BinaryName) -> Result<Option<BinaryName>, Error>;

    /// Is this class an interface?
    fn is_interface(&self, class: &BinaryName) -> Result<bool, Error>;

    /// Nearest common superclass of two classes
    ///
    /// Interfaces have no useful meet in the superclass chain, so any
    /// interface operand generalizes straight to `java/lang/Object`.
    fn common_superclass(
        &self,
        left: &BinaryName,
        right: &BinaryName,
    ) -> Result<BinaryName, Error> {
        if left == right {
            return Ok(left.clone());
        }
        if self.is_interface(left)? || self.is_interface(right)? {
            return Ok(BinaryName::OBJECT);
        }

        let mut left_ancestors: HashSet<BinaryName> = HashSet::new();
        let mut next = Some(left.clone());
        while let Some(class) = next {
            next = self.super_class(&class)?;
            left_ancestors.insert(class);
        }

        let mut candidate = right.clone();
        loop {
            if left_ancestors.contains(&candidate) {
                return Ok(candidate);
            }
            match self.super_class(&candidate)? {
                Some(super_class) => candidate = super_class,
                None => return Ok(BinaryName::OBJECT),
            }
        }
    }
}

/// What the graph records about one class
struct ClassData<'g> {
    name: BinaryName,

    /// Missing only for `java/lang/Object`
    superclass: Option<&'g ClassData<'g>>,

    is_interface: bool,
}

pub struct ClassGraphArenas<'g> {
    class_arena: Arena<ClassData<'g>>,
}

impl<'g> ClassGraphArenas<'g> {
    pub fn new() -> Self {
        ClassGraphArenas {
            class_arena: Arena::new(),
        }
    }
}

impl<'g> Default for ClassGraphArenas<'g> {
    fn default() -> Self {
        ClassGraphArenas::new()
    }
}

/// In-memory class hierarchy
///
/// Classes are arena-allocated and linked by reference, with an append-only
/// name index, so registering classes needs only `&self`.
pub struct ClassGraph<'g> {
    arenas: &'g ClassGraphArenas<'g>,
    classes: FrozenMap<&'g BinaryName, &'g ClassData<'g>>,
}

impl<'g> ClassGraph<'g> {
    /// New graph containing only `java/lang/Object`
    pub fn new(arenas: &'g ClassGraphArenas<'g>) -> Self {
        let graph = ClassGraph {
            arenas,
            classes: FrozenMap::new(),
        };
        let object = &*graph.arenas.class_arena.alloc(ClassData {
            name: BinaryName::OBJECT,
            superclass: None,
            is_interface: false,
        });
        graph.classes.insert(&object.name, object);
        graph
    }

    /// Register a class under an already-registered superclass
    pub fn add_class(
        &'g self,
        name: BinaryName,
        superclass: &BinaryName,
        is_interface: bool,
    ) -> Result<(), Error> {
        let superclass = self
            .classes
            .get(superclass)
            .ok_or_else(|| Error::MissingClass(superclass.clone()))?;
        let data = &*self.arenas.class_arena.alloc(ClassData {
            name,
            superclass: Some(superclass),
            is_interface,
        });
        self.classes.insert(&data.name, data);
        Ok(())
    }

    pub fn contains(&'g self, name: &BinaryName) -> bool {
        self.classes.get(name).is_some()
    }

    /// Register the `java.lang` types the codec's own tests and common
    /// bytecode lean on
    pub fn insert_java_lang_core(&'g self) {
        let name = |text: &str| BinaryName::from_string(text.to_string()).unwrap();
        let object = BinaryName::OBJECT;

        for class in [
            "java/lang/String",
            "java/lang/Class",
            "java/lang/Number",
            "java/lang/Throwable",
            "java/lang/StringBuilder",
            "java/lang/System",
            "java/lang/invoke/MethodHandle",
            "java/lang/invoke/MethodType",
            "java/lang/invoke/CallSite",
        ] {
            self.add_class(name(class), &object, false).unwrap();
        }
        for interface in [
            "java/lang/CharSequence",
            "java/lang/Comparable",
            "java/lang/Cloneable",
            "java/lang/Runnable",
            "java/io/Serializable",
        ] {
            self.add_class(name(interface), &object, true).unwrap();
        }
        for boxed in [
            "java/lang/Integer",
            "java/lang/Long",
            "java/lang/Float",
            "java/lang/Double",
            "java/lang/Short",
            "java/lang/Byte",
        ] {
            self.add_class(name(boxed), &name("java/lang/Number"), false)
                .unwrap();
        }
        for (class, superclass) in [
            ("java/lang/Exception", "java/lang/Throwable"),
            ("java/lang/Error", "java/lang/Throwable"),
            ("java/lang/RuntimeException", "java/lang/Exception"),
            ("java/lang/IllegalStateException", "java/lang/RuntimeException"),
            ("java/lang/IllegalArgumentException", "java/lang/RuntimeException"),
        ] {
            self.add_class(name(class), &name(superclass), false).unwrap();
        }
    }
}

impl<'g> ClassHierarchy for ClassGraph<'g> {
    fn super_class(&self, class: &BinaryName) -> Result<Option<BinaryName>, Error> {
        let data = self
            .classes
            .get(class)
            .ok_or_else(|| Error::MissingClass(class.clone()))?;
        Ok(data.superclass.map(|superclass| superclass.name.clone()))
    }

    fn is_interface(&self, class: &BinaryName) -> Result<bool, Error> {
        let data = self
            .classes
            .get(class)
            .ok_or_else(|| Error::MissingClass(class.clone()))?;
        Ok(data.is_interface)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn name(text: &str) -> BinaryName {
        BinaryName::from_string(text.to_string()).unwrap()
    }

    #[test]
    fn common_superclass_walks_chains() {
        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        graph.insert_java_lang_core();

        assert_eq!(
            graph
                .common_superclass(&name("java/lang/Integer"), &name("java/lang/Long"))
                .unwrap(),
            name("java/lang/Number")
        );
        assert_eq!(
            graph
                .common_superclass(&name("java/lang/Integer"), &name("java/lang/String"))
                .unwrap(),
            BinaryName::OBJECT
        );
        assert_eq!(
            graph
                .common_superclass(
                    &name("java/lang/IllegalStateException"),
                    &name("java/lang/Error")
                )
                .unwrap(),
            name("java/lang/Throwable")
        );
        assert_eq!(
            graph
                .common_superclass(&name("java/lang/Number"), &name("java/lang/Integer"))
                .unwrap(),
            name("java/lang/Number"),
            "a class merged with its own subclass is itself"
        );
    }

    #[test]
    fn interfaces_generalize_to_object() {
        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        graph.insert_java_lang_core();

        assert_eq!(
            graph
                .common_superclass(&name("java/lang/CharSequence"), &name("java/lang/String"))
                .unwrap(),
            BinaryName::OBJECT
        );
    }

    #[test]
    fn unknown_classes_are_fatal() {
        let arenas = ClassGraphArenas::new();
        let graph = ClassGraph::new(&arenas);
        graph.insert_java_lang_core();

        assert!(matches!(
            graph.common_superclass(&name("com/example/Missing"), &name("java/lang/String")),
            Err(Error::MissingClass(_))
        ));
    }
}
