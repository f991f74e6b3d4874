//! Manipulate JVM class files as a stream of visitor events
//!
//! The codec has three moving parts: [`reader::ClassReader`] decodes class
//! bytes into visitor callbacks, [`writer::ClassWriter`] re-encodes those
//! callbacks into bytes, and the [`verifier`] engine re-derives the
//! stack map frames and stack/local maximums the output format wants,
//! using a caller-supplied [`hierarchy::ClassHierarchy`] to merge object
//! types at control flow joins.
//!
//! ### Example: generating a class from scratch
//!
//! ```
//! use classgraft::access_flags::{ClassAccessFlags, MethodAccessFlags};
//! use classgraft::class_file::Version;
//! use classgraft::code::{BranchInstruction, Instruction};
//! use classgraft::descriptors::{MethodDescriptor, ParseDescriptor};
//! use classgraft::hierarchy::{ClassGraph, ClassGraphArenas};
//! use classgraft::names::{BinaryName, Name, UnqualifiedName};
//! use classgraft::visitor::{ClassHeader, ClassVisitor, MethodVisitor};
//! use classgraft::writer::{ClassWriter, WriterOptions};
//!
//! # fn main() -> Result<(), classgraft::errors::Error> {
//! let arenas = ClassGraphArenas::new();
//! let graph = ClassGraph::new(&arenas);
//! graph.insert_java_lang_core();
//!
//! let writer = ClassWriter::new(WriterOptions::COMPUTE_FRAMES).with_hierarchy(&graph);
//! let mut class = &writer;
//! class.visit_header(&ClassHeader {
//!     version: Version::JAVA11,
//!     access_flags: ClassAccessFlags::PUBLIC | ClassAccessFlags::SUPER,
//!     this_class: BinaryName::from_string(String::from("me/Example"))?,
//!     super_class: Some(BinaryName::OBJECT),
//!     interfaces: vec![],
//! })?;
//!
//! let mut method = class
//!     .visit_method(
//!         MethodAccessFlags::PUBLIC | MethodAccessFlags::STATIC,
//!         &UnqualifiedName::from_string(String::from("zero"))?,
//!         &MethodDescriptor::parse("()I")?,
//!         &[],
//!     )?
//!     .unwrap();
//! method.visit_code()?;
//! method.visit_instruction(&Instruction::IConst0)?;
//! method.visit_branch(&BranchInstruction::IReturn)?;
//! method.visit_end()?;
//!
//! class.visit_end()?;
//! let class_bytes = writer.into_bytes()?;
//! assert_eq!(&class_bytes[0..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
//! # Ok(())
//! # }
//! ```

pub mod access_flags;
pub mod class_file;
pub mod code;
pub mod descriptors;
pub mod errors;
pub mod hierarchy;
pub mod names;
pub mod reader;
pub mod util;
pub mod verifier;
pub mod visitor;
pub mod writer;
