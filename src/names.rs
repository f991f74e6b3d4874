use crate::errors::FormatError;
use std::borrow::Cow;
use std::fmt::{Debug, Error as FmtError, Formatter};

/// Names of methods and fields
///
/// See <https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.2.2>
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct UnqualifiedName(Cow<'static, str>);

/// Names of classes and interfaces, in internal slash-separated form
///
/// See <https://docs.oracle.com/javase/specs/jvms/se17/html/jvms-4.html#jvms-4.2.1>
#[derive(Clone, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct BinaryName(Cow<'static, str>);

pub trait Name: Sized {
    /// Check if a string would be a valid name of this kind
    fn check_valid(name: impl AsRef<str>) -> Result<(), FormatError>;

    /// Extract the raw underlying string data
    fn as_cow(&self) -> &Cow<'static, str>;

    /// Extract the raw underlying string name
    fn as_str(&self) -> &str {
        self.as_cow().as_ref()
    }

    /// Try to construct a name from a string
    fn from_string(name: String) -> Result<Self, FormatError>;
}

impl Name for UnqualifiedName {
    fn check_valid(name: impl AsRef<str>) -> Result<(), FormatError> {
        let name = name.as_ref();
        if name.is_empty() {
            Err(FormatError::BadName(String::from("empty unqualified name")))
        } else if name != "<init>"
            && name != "<clinit>"
            && name.contains(&['.', ';', '[', '/', '<', '>'][..])
        {
            Err(FormatError::BadName(format!(
                "unqualified name '{}' contains an illegal character",
                name
            )))
        } else {
            Ok(())
        }
    }

    fn as_cow(&self) -> &Cow<'static, str> {
        &self.0
    }

    fn from_string(name: String) -> Result<Self, FormatError> {
        UnqualifiedName::check_valid(&name)?;
        Ok(UnqualifiedName(Cow::Owned(name)))
    }
}

impl Name for BinaryName {
    fn check_valid(name: impl AsRef<str>) -> Result<(), FormatError> {
        let name = name.as_ref();
        if name.is_empty() {
            return Err(FormatError::BadName(String::from("empty binary name")));
        }
        for segment in name.split('/') {
            if segment.is_empty() || segment.contains(&['.', ';', '['][..]) {
                return Err(FormatError::BadName(format!(
                    "binary name '{}' has an invalid segment",
                    name
                )));
            }
        }
        Ok(())
    }

    fn as_cow(&self) -> &Cow<'static, str> {
        &self.0
    }

    fn from_string(name: String) -> Result<Self, FormatError> {
        BinaryName::check_valid(&name)?;
        Ok(BinaryName(Cow::Owned(name)))
    }
}

impl UnqualifiedName {
    /// Instance initializer name
    pub const INIT: UnqualifiedName = UnqualifiedName(Cow::Borrowed("<init>"));

    /// Class initializer name
    pub const CLINIT: UnqualifiedName = UnqualifiedName(Cow::Borrowed("<clinit>"));
}

impl BinaryName {
    pub const OBJECT: BinaryName = BinaryName(Cow::Borrowed("java/lang/Object"));
    pub const STRING: BinaryName = BinaryName(Cow::Borrowed("java/lang/String"));
    pub const CLASS: BinaryName = BinaryName(Cow::Borrowed("java/lang/Class"));
    pub const THROWABLE: BinaryName = BinaryName(Cow::Borrowed("java/lang/Throwable"));
    pub const METHOD_HANDLE: BinaryName = BinaryName(Cow::Borrowed("java/lang/invoke/MethodHandle"));
    pub const METHOD_TYPE: BinaryName = BinaryName(Cow::Borrowed("java/lang/invoke/MethodType"));
}

impl AsRef<str> for UnqualifiedName {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl AsRef<str> for BinaryName {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

impl Debug for UnqualifiedName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

impl Debug for BinaryName {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), FmtError> {
        f.write_str(self.0.as_ref())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(BinaryName::from_string(String::from("java/lang/Object")).is_ok());
        assert!(BinaryName::from_string(String::from("Point")).is_ok());
        assert!(UnqualifiedName::from_string(String::from("toString")).is_ok());
        assert!(UnqualifiedName::from_string(String::from("<init>")).is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(BinaryName::from_string(String::from("")).is_err());
        assert!(BinaryName::from_string(String::from("java//lang")).is_err());
        assert!(BinaryName::from_string(String::from("java.lang.Object")).is_err());
        assert!(UnqualifiedName::from_string(String::from("a/b")).is_err());
        assert!(UnqualifiedName::from_string(String::from("<oops>")).is_err());
    }
}
