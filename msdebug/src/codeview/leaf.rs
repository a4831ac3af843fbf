//! Numeric leaves and the kind tags of type and field-list records.


use from_to_repr::from_to_other;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::cursor::ByteCursor;
use crate::error::DecodeError;


/// A self-describing number embedded in a type or symbol record.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum NumericLeaf {
    Immediate(u16), // < 0x8000
    SignedChar(i8), // 0x8000
    SignedShort(i16), // 0x8001
    UnsignedShort(u16), // 0x8002
    SignedLong(i32), // 0x8003
    UnsignedLong(u32), // 0x8004
    Float32([u8; 4]), // 0x8005
    Float64([u8; 8]), // 0x8006
    Float80([u8; 10]), // 0x8007
    Float128([u8; 16]), // 0x8008
    SignedQuadWord(i64), // 0x8009
    UnsignedQuadWord(u64), // 0x800A
    Float48([u8; 6]), // 0x800B
    Complex32([u8; 8]), // 0x800C
    Complex64([u8; 16]), // 0x800D
    Complex80([u8; 20]), // 0x800E
    Complex128([u8; 32]), // 0x800F
    String(Vec<u8>), // 0x8010
}
impl NumericLeaf {
    pub fn read(cursor: &mut ByteCursor) -> Result<Self, DecodeError> {
        let value = cursor.read_u16()?;

        match value {
            0x0000..=0x7FFF => Ok(Self::Immediate(value)),
            0x8000 => Ok(Self::SignedChar(cursor.read_i8()?)),
            0x8001 => Ok(Self::SignedShort(cursor.read_i16()?)),
            0x8002 => Ok(Self::UnsignedShort(cursor.read_u16()?)),
            0x8003 => Ok(Self::SignedLong(cursor.read_i32()?)),
            0x8004 => Ok(Self::UnsignedLong(cursor.read_u32()?)),
            0x8005 => Ok(Self::Float32(cursor.read_bytes(4)?.try_into().unwrap())),
            0x8006 => Ok(Self::Float64(cursor.read_bytes(8)?.try_into().unwrap())),
            0x8007 => Ok(Self::Float80(cursor.read_bytes(10)?.try_into().unwrap())),
            0x8008 => Ok(Self::Float128(cursor.read_bytes(16)?.try_into().unwrap())),
            0x8009 => Ok(Self::SignedQuadWord(cursor.read_i64()?)),
            0x800A => Ok(Self::UnsignedQuadWord(cursor.read_u64()?)),
            0x800B => Ok(Self::Float48(cursor.read_bytes(6)?.try_into().unwrap())),
            0x800C => Ok(Self::Complex32(cursor.read_bytes(8)?.try_into().unwrap())),
            0x800D => Ok(Self::Complex64(cursor.read_bytes(16)?.try_into().unwrap())),
            0x800E => Ok(Self::Complex80(cursor.read_bytes(20)?.try_into().unwrap())),
            0x800F => Ok(Self::Complex128(cursor.read_bytes(32)?.try_into().unwrap())),
            0x8010 => {
                let length = usize::from(cursor.read_u16()?);
                Ok(Self::String(cursor.read_bytes(length)?.to_vec()))
            },
            other => {
                error!("unknown numeric leaf type {:#06X}", other);
                Err(DecodeError::UnknownNumericLeaf { tag: other })
            },
        }
    }

    /// Decodes a leaf at the start of `bytes`, returning the leaf and the number of bytes it
    /// occupies.
    pub fn take_from_bytes(bytes: &[u8]) -> Result<(Self, usize), DecodeError> {
        let mut cursor = ByteCursor::new(bytes);
        let leaf = Self::read(&mut cursor)?;
        Ok((leaf, cursor.position()))
    }

    /// The integral value of this leaf, if it is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Immediate(v) => Some((*v).into()),
            Self::SignedChar(v) => Some((*v).into()),
            Self::SignedShort(v) => Some((*v).into()),
            Self::UnsignedShort(v) => Some((*v).into()),
            Self::SignedLong(v) => Some((*v).into()),
            Self::UnsignedLong(v) => Some((*v).into()),
            Self::SignedQuadWord(v) => Some(*v),
            Self::UnsignedQuadWord(v) => Some(*v as i64),
            _ => None,
        }
    }
}

/// Reads a numeric leaf used as a size, offset or enumerator value.
///
/// Non-integral leaves have no meaningful value in those positions and count as 0.
pub(crate) fn read_numeric_value(cursor: &mut ByteCursor) -> Result<i64, DecodeError> {
    Ok(NumericLeaf::read(cursor)?.as_i64().unwrap_or(0))
}


#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[from_to_other(base_type = u16, derive_compare = "as_int")]
pub enum TypeLeafIndex {
    // 16-bit type indices
    Modifier = 0x0001,
    Pointer = 0x0002,
    Array = 0x0003,
    Class = 0x0004,
    Structure = 0x0005,
    Union = 0x0006,
    Enum = 0x0007,
    Procedure = 0x0008,
    MemberFunction = 0x0009,
    ArgumentList = 0x0201,
    FieldList = 0x0204,
    BitField = 0x0206,
    MethodList = 0x0207,

    // 32-bit type indices
    Modifier32 = 0x1001,
    Pointer32 = 0x1002,
    Array32 = 0x1003,
    Class32 = 0x1004,
    Structure32 = 0x1005,
    Union32 = 0x1006,
    Enum32 = 0x1007,
    Procedure32 = 0x1008,
    MemberFunction32 = 0x1009,
    ArgumentList32 = 0x1201,
    FieldList32 = 0x1203,
    BitField32 = 0x1205,
    MethodList32 = 0x1206,

    Other(u16),
}

/// Kinds of the records nested in a field list.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[from_to_other(base_type = u16, derive_compare = "as_int")]
pub enum FieldLeafIndex {
    // 16-bit type indices
    RealBaseClass = 0x0400,
    DirectVirtualBaseClass = 0x0401,
    IndirectVirtualBaseClass = 0x0402,
    EnumerationNameAndValue = 0x0403,
    FriendFunction = 0x0404,
    IndexToAnotherTypeRecord = 0x0405,
    DataMember = 0x0406,
    StaticDataMember = 0x0407,
    Method = 0x0408,
    NestedTypeDefinition = 0x0409,
    VirtualFunctionTablePointer = 0x040A,
    FriendClass = 0x040B,
    OneMethod = 0x040C,
    VirtualFunctionOffset = 0x040D,
    NestedTypeDefinitionEx = 0x040E,

    // 32-bit type indices
    RealBaseClass32 = 0x1400,
    DirectVirtualBaseClass32 = 0x1401,
    IndirectVirtualBaseClass32 = 0x1402,
    FriendFunction32 = 0x1403,
    IndexToAnotherTypeRecord32 = 0x1404,
    DataMember32 = 0x1405,
    StaticDataMember32 = 0x1406,
    Method32 = 0x1407,
    NestedTypeDefinition32 = 0x1408,
    VirtualFunctionTablePointer32 = 0x1409,
    FriendClass32 = 0x140A,
    OneMethod32 = 0x140B,
    VirtualFunctionOffset32 = 0x140C,
    NestedTypeDefinitionEx32 = 0x140D,

    Other(u16),
}
