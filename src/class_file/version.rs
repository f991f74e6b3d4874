use crate::class_file::Serialize;
use crate::errors::FormatError;
use byteorder::WriteBytesExt;

/// Class file version
///
/// On the wire, minor comes before major.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Version {
    pub minor: u16,
    pub major: u16,
}

impl Version {
    pub const JAVA8: Version = Version { minor: 0, major: 52 };
    pub const JAVA9: Version = Version { minor: 0, major: 53 };
    pub const JAVA11: Version = Version { minor: 0, major: 55 };
    pub const JAVA17: Version = Version { minor: 0, major: 61 };
    pub const JAVA21: Version = Version { minor: 0, major: 65 };

    /// Earliest version this codec decodes (JDK 1.1)
    const OLDEST_SUPPORTED_MAJOR: u16 = 45;

    /// Check that this is a version the codec knows how to decode
    pub fn check_supported(&self) -> Result<(), FormatError> {
        if self.major < Version::OLDEST_SUPPORTED_MAJOR
            || self.major > Version::JAVA21.major
        {
            Err(FormatError::UnsupportedVersion {
                major: self.major,
                minor: self.minor,
            })
        } else {
            Ok(())
        }
    }

    /// Stack map frames are mandatory from 50.0 on (and `jsr`/`ret` invalid)
    pub fn requires_frames(&self) -> bool {
        self.major >= 50
    }
}

impl Serialize for Version {
    fn serialize<W: WriteBytesExt>(&self, writer: &mut W) -> std::io::Result<()> {
        self.minor.serialize(writer)?;
        self.major.serialize(writer)?;
        Ok(())
    }
}
