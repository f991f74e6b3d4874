use crate::class_file::ConstantPoolOverflow;
use crate::code::Label;
use crate::names::BinaryName;
use crate::util::Offset;

/// Errors for malformed or truncated input bytes
///
/// These are always fatal: the decoder never guesses around a bad tag or a
/// short buffer. Unknown *attributes* are not format errors (they are
/// self-delimited and passed through opaquely).
#[derive(Debug)]
pub enum FormatError {
    /// First four bytes were not `0xCAFEBABE`
    BadMagic(u32),

    /// Class file version this codec does not know how to decode
    UnsupportedVersion { major: u16, minor: u16 },

    /// Input ended before a structure was complete
    UnexpectedEof { reading: &'static str },

    /// Unknown constant pool tag
    BadConstantTag(u8),

    /// Constant pool index is zero, out of bounds, or points into the middle
    /// of a two-slot entry
    BadConstantIndex(u16),

    /// Constant pool entry at the index has the wrong tag
    ConstantTypeMismatch { index: u16, expected: &'static str },

    /// Invalid modified UTF-8 in a `CONSTANT_Utf8_info`
    InvalidUtf8,

    /// Class, field, or method name violates the format's naming rules
    BadName(String),

    /// Field or method descriptor failed to parse
    BadDescriptor(String),

    /// Opcode byte the codec does not recognize
    UnknownOpcode(u8),

    /// Opcode the codec recognizes but deliberately does not support
    /// (`jsr`/`ret` subroutines, which cannot coexist with stack map frames)
    UnsupportedInstruction { opcode: u8, mnemonic: &'static str },

    /// Unknown `newarray` element type tag
    BadNewArrayType(u8),

    /// Unknown `StackMapTable` frame tag
    BadFrameTag(u8),

    /// Unknown verification type tag inside a stack map frame
    BadVerificationTypeTag(u8),

    /// An attribute's length field disagrees with its actual content
    BadAttributeLength { attribute: &'static str },

    /// A jump or stack map frame referenced a bytecode offset that is not an
    /// instruction boundary
    BadBytecodeOffset(usize),
}

/// Kinds of failure the frame engine can hit while simulating a method body
///
/// Any of these mean the engine cannot produce frames for the method; they
/// are reported wrapped in [`Error::FrameComputation`] and no output is
/// produced.
#[derive(Debug)]
pub enum FrameErrorKind {
    /// An instruction popped from an empty operand stack
    EmptyStack,

    /// Operand had the wrong width (eg. `pop2` over a lone category-1 value)
    InvalidWidth(usize),

    /// Load/store referenced a local slot past `max_locals`
    InvalidLocalIndex(u16),

    /// Two control flow paths reach the same point with different stack depths
    StackDepthMismatch { expected: usize, found: usize },

    /// `invokespecial <init>` did not find an uninitialized receiver
    InvalidReceiver,

    /// An operand had a shape the instruction cannot work with (eg. `aaload`
    /// from something that is not an array)
    InvalidType,

    /// A descriptor needed during simulation failed to parse
    BadDescriptor(String),
}

/// Crate-level error type
#[derive(Debug)]
pub enum Error {
    /// Malformed input bytes
    Format(FormatError),

    /// Underlying writer failure while assembling output
    IoError(std::io::Error),

    /// Constant pool ran past 65535 slots
    ConstantPoolOverflow(ConstantPoolOverflow),

    /// A method body ran past the format's 65535 byte ceiling
    MethodCodeOverflow(Offset),

    /// Computed or declared operand stack height does not fit in a `u16`
    MethodMaxStackOverflow(Offset),

    /// Computed or declared local count does not fit in a `u16`
    MethodMaxLocalsOverflow(Offset),

    /// A label was referenced from emitted code but never placed
    UnresolvedLabel(Label),

    /// A label was placed at two different offsets
    LabelAlreadyPlaced(Label),

    /// The class hierarchy resolver has no entry for a class the frame
    /// engine needed to merge
    MissingClass(BinaryName),

    /// Frame computation was requested but no hierarchy resolver was
    /// provided to merge object types through
    MissingHierarchy,

    /// The frame engine could not compute frames for a method
    FrameComputation {
        instruction: String,
        kind: FrameErrorKind,
    },

    /// Visitor callbacks arrived out of the required order
    VisitOrder(&'static str),
}

impl From<FormatError> for Error {
    fn from(err: FormatError) -> Error {
        Error::Format(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IoError(err)
    }
}

impl From<ConstantPoolOverflow> for Error {
    fn from(err: ConstantPoolOverflow) -> Error {
        Error::ConstantPoolOverflow(err)
    }
}
