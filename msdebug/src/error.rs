use std::fmt;

use crate::codeview::types::TypeIndex;


/// A read from untrusted bytes that could not be satisfied.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum DecodeError {
    UnexpectedEof { offset: usize, wanted: usize, available: usize },
    OffsetOutOfRange { offset: usize, length: usize },
    UnknownNumericLeaf { tag: u16 },
}
impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof { offset, wanted, available }
                => write!(f, "wanted {} bytes at offset {:#X} but only {} are available", wanted, offset, available),
            Self::OffsetOutOfRange { offset, length }
                => write!(f, "offset {:#X} lies beyond the end of {} bytes of data", offset, length),
            Self::UnknownNumericLeaf { tag }
                => write!(f, "unknown numeric leaf type {:#06X}", tag),
        }
    }
}
impl std::error::Error for DecodeError {
}


/// Failure of a type-table parse pass.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum TypeTableError {
    Decode(DecodeError),
    UnknownFieldListMember { type_index: TypeIndex, kind: u16 },
}
impl fmt::Display for TypeTableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e)
                => write!(f, "decoding error: {}", e),
            Self::UnknownFieldListMember { type_index, kind }
                => write!(f, "field list {:#06X} contains member of unknown kind {:#06X}", type_index, kind),
        }
    }
}
impl std::error::Error for TypeTableError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::UnknownFieldListMember { .. } => None,
        }
    }
}
impl From<DecodeError> for TypeTableError {
    fn from(value: DecodeError) -> Self { Self::Decode(value) }
}


/// Sometimes things go wrong.
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Decode(DecodeError),
    TypeTable(TypeTableError),
    NotFound { name: String },
    UnknownSignature { signature: [u8; 4] },
    BadPdbHeader,
    MissingPdbStream { stream: u32 },
    BadImage { reason: &'static str },
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e)
                => write!(f, "I/O error: {}", e),
            Self::Decode(e)
                => write!(f, "decoding error: {}", e),
            Self::TypeTable(e)
                => write!(f, "type table error: {}", e),
            Self::NotFound { name }
                => write!(f, "debug file {:?} not found", name),
            Self::UnknownSignature { signature }
                => write!(f, "unknown debug information signature {:?}", signature),
            Self::BadPdbHeader
                => write!(f, "program database header is invalid"),
            Self::MissingPdbStream { stream }
                => write!(f, "program database stream {} is missing", stream),
            Self::BadImage { reason }
                => write!(f, "invalid image: {}", reason),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::TypeTable(e) => Some(e),
            Self::NotFound { .. } => None,
            Self::UnknownSignature { .. } => None,
            Self::BadPdbHeader => None,
            Self::MissingPdbStream { .. } => None,
            Self::BadImage { .. } => None,
        }
    }
}
impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self { Self::Io(value) }
}
impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self { Self::Decode(value) }
}
impl From<TypeTableError> for Error {
    fn from(value: TypeTableError) -> Self { Self::TypeTable(value) }
}
