use std::error;
use std::fmt;
use std::io;

/// Errors that can be returned from disk image operations.  These are
/// generally converted into `io::Error`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiskError {
    /// The byte buffer is not one of the two recognized image sizes
    /// (174,848 or 196,608 bytes).
    InvalidImageSize,
    /// Bad track or sector
    InvalidTrackSector,
    /// Disk is full
    DiskFull,
    /// All directory slots are in use
    DirectoryFull,
    /// File not found
    NotFound,
    /// A file with the specified filename already exists
    Duplicate,
    /// REL record size out of range (2..=254)
    InvalidRecordSize,
    /// REL files must be added through the REL path
    UseAddRel,
    /// A sector chain loops, overruns the disk, or carries an invalid link
    CorruptChain,
    /// An underlying I/O failure (including write access to read-only media)
    IoError,
}

impl error::Error for DiskError {}

impl fmt::Display for DiskError {
    /// Provide human-readable descriptions of the errors
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", &self.message())
    }
}

#[allow(clippy::from_over_into)]
impl Into<io::Error> for DiskError {
    fn into(self) -> io::Error {
        use self::DiskError::*;
        use std::io::ErrorKind::*;
        match self {
            InvalidImageSize => io::Error::new(InvalidData, self),
            InvalidTrackSector => io::Error::new(InvalidInput, self),
            DiskFull => io::Error::new(Other, self),
            DirectoryFull => io::Error::new(Other, self),
            self::DiskError::NotFound => io::Error::new(io::ErrorKind::NotFound, self),
            Duplicate => io::Error::new(AlreadyExists, self),
            InvalidRecordSize => io::Error::new(InvalidInput, self),
            UseAddRel => io::Error::new(InvalidInput, self),
            CorruptChain => io::Error::new(InvalidData, self),
            IoError => io::Error::new(Other, self),
        }
    }
}

impl From<io::Error> for DiskError {
    fn from(error: io::Error) -> DiskError {
        match error.into_inner() {
            Some(e) => match e.downcast_ref::<DiskError>() {
                Some(disk_error) => disk_error.clone(),
                None => DiskError::IoError,
            },
            None => DiskError::IoError,
        }
    }
}

impl DiskError {
    /// If the provided `io::Error` contains a `DiskError`, return the
    /// underlying `DiskError`.  If not, return None.
    pub fn from_io_error(error: &io::Error) -> Option<DiskError> {
        match error.get_ref() {
            Some(e) => e.downcast_ref::<DiskError>().cloned(),
            None => None,
        }
    }

    /// This is sometimes useful instead of .into() when the compiler doesn't
    /// have enough information to perform type inference.
    pub fn to_io_error(&self) -> io::Error {
        let io_error: io::Error = self.clone().into();
        io_error
    }

    /// Provide terse descriptions of the errors.
    fn message(&self) -> &str {
        use self::DiskError::*;
        match *self {
            InvalidImageSize => "not a 35-track or 40-track disk image",
            InvalidTrackSector => "bad track or sector",
            DiskFull => "disk is full",
            DirectoryFull => "directory is full",
            NotFound => "file not found",
            Duplicate => "a file with the specified filename already exists",
            InvalidRecordSize => "record size must be 2..=254",
            UseAddRel => "REL files must be added with add_rel_file",
            CorruptChain => "corrupt sector chain",
            IoError => "I/O error",
        }
    }
}

impl PartialEq<io::Error> for DiskError {
    fn eq(&self, other: &io::Error) -> bool {
        matches!(DiskError::from_io_error(other), Some(ref e) if e == self)
    }
}

impl PartialEq<DiskError> for io::Error {
    fn eq(&self, other: &DiskError) -> bool {
        matches!(DiskError::from_io_error(self), Some(ref e) if e == other)
    }
}
