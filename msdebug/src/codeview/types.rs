//! The CodeView type table and the registry it is decoded into.
//!
//! Type numbers below 0x1000 name built-in types (see [`builtin_type`]); every record of a type
//! table defines the next type number, starting at 0x1000. Records may reference type numbers that
//! are only defined later; such references stay unresolved until then.


#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::codeview::leaf::{read_numeric_value, FieldLeafIndex, TypeLeafIndex};
use crate::cursor::{slice_at, ByteCursor};
use crate::error::{DecodeError, TypeTableError};
use crate::sink::SymbolSink;


pub type TypeIndex = u32;

/// The first type number defined by a type table.
pub const FIRST_DEFINED_TYPE_INDEX: TypeIndex = 0x1000;

/// Pointers are near 32-bit pointers.
pub const POINTER_SIZE: u32 = 4;

const MAX_TYPE_NESTING: usize = 32;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum BasicType {
    Void,
    SignedChar,
    Short,
    Long,
    Quad,
    UnsignedChar,
    UnsignedShort,
    UnsignedLong,
    UnsignedQuad,
    Float32,
    Float64,
    RealChar,
    WideChar,
    Int,
    UnsignedInt,
}
impl BasicType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::SignedChar => "signed char",
            Self::Short => "short int",
            Self::Long => "long int",
            Self::Quad => "long long int",
            Self::UnsignedChar => "unsigned char",
            Self::UnsignedShort => "short unsigned int",
            Self::UnsignedLong => "long unsigned int",
            Self::UnsignedQuad => "long long unsigned int",
            Self::Float32 => "float",
            Self::Float64 => "double",
            Self::RealChar => "char",
            Self::WideChar => "short unsigned int",
            Self::Int => "int",
            Self::UnsignedInt => "unsigned int",
        }
    }

    pub fn size(&self) -> u32 {
        match self {
            Self::Void => 0,
            Self::SignedChar|Self::UnsignedChar|Self::RealChar => 1,
            Self::Short|Self::UnsignedShort|Self::WideChar => 2,
            Self::Long|Self::UnsignedLong|Self::Int|Self::UnsignedInt|Self::Float32 => 4,
            Self::Quad|Self::UnsignedQuad|Self::Float64 => 8,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum StructKind {
    Struct,
    Class,
    Union,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Member {
    pub name: Option<String>,
    pub type_index: TypeIndex,
    pub bit_offset: u32,

    /// 0 if the member's type was unknown when the member was decoded.
    pub bit_width: u32,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct Enumerator {
    pub name: Option<String>,
    pub value: i64,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum TypeRecord {
    Basic(BasicType),
    Pointer { pointee: TypeIndex },
    Array { name: Option<String>, element: TypeIndex, count: u32 },
    Bitfield { base: TypeIndex, bit_offset: u8, bit_width: u8 },
    Struct { kind: StructKind, name: Option<String>, size: u32, members: Vec<Member> },
    Enum { name: Option<String>, values: Vec<Enumerator> },
}
impl TypeRecord {
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Basic(basic) => Some(basic.name()),
            Self::Pointer { .. } => None,
            Self::Bitfield { .. } => None,
            Self::Array { name, .. } => name.as_deref(),
            Self::Struct { name, .. } => name.as_deref(),
            Self::Enum { name, .. } => name.as_deref(),
        }
    }
}


static BUILTIN_TYPES: &[(TypeIndex, TypeRecord)] = &[
    (0x0003, TypeRecord::Basic(BasicType::Void)),
    (0x0010, TypeRecord::Basic(BasicType::SignedChar)),
    (0x0011, TypeRecord::Basic(BasicType::Short)),
    (0x0012, TypeRecord::Basic(BasicType::Long)),
    (0x0013, TypeRecord::Basic(BasicType::Quad)),
    (0x0020, TypeRecord::Basic(BasicType::UnsignedChar)),
    (0x0021, TypeRecord::Basic(BasicType::UnsignedShort)),
    (0x0022, TypeRecord::Basic(BasicType::UnsignedLong)),
    (0x0023, TypeRecord::Basic(BasicType::UnsignedQuad)),
    (0x0040, TypeRecord::Basic(BasicType::Float32)),
    (0x0041, TypeRecord::Basic(BasicType::Float64)),
    (0x0070, TypeRecord::Basic(BasicType::RealChar)),
    (0x0071, TypeRecord::Basic(BasicType::WideChar)),
    (0x0074, TypeRecord::Basic(BasicType::Int)),
    (0x0075, TypeRecord::Basic(BasicType::UnsignedInt)),

    // 16:32 near pointers to the above
    (0x0403, TypeRecord::Pointer { pointee: 0x0003 }),
    (0x0410, TypeRecord::Pointer { pointee: 0x0010 }),
    (0x0411, TypeRecord::Pointer { pointee: 0x0011 }),
    (0x0412, TypeRecord::Pointer { pointee: 0x0012 }),
    (0x0413, TypeRecord::Pointer { pointee: 0x0013 }),
    (0x0420, TypeRecord::Pointer { pointee: 0x0020 }),
    (0x0421, TypeRecord::Pointer { pointee: 0x0021 }),
    (0x0422, TypeRecord::Pointer { pointee: 0x0022 }),
    (0x0423, TypeRecord::Pointer { pointee: 0x0023 }),
    (0x0440, TypeRecord::Pointer { pointee: 0x0040 }),
    (0x0441, TypeRecord::Pointer { pointee: 0x0041 }),
    (0x0470, TypeRecord::Pointer { pointee: 0x0070 }),
    (0x0471, TypeRecord::Pointer { pointee: 0x0071 }),
    (0x0474, TypeRecord::Pointer { pointee: 0x0074 }),
    (0x0475, TypeRecord::Pointer { pointee: 0x0075 }),
];

/// Looks up a built-in type; these are the same for every module.
pub fn builtin_type(index: TypeIndex) -> Option<&'static TypeRecord> {
    BUILTIN_TYPES.iter()
        .find(|(i, _)| *i == index)
        .map(|(_, record)| record)
}


/// Types defined by one module's type table.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct TypeRegistry {
    defined: Vec<Option<TypeRecord>>,
}
impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a record under a type number of 0x1000 or above.
    ///
    /// Built-in type numbers cannot be redefined; attempting to do so returns `false`.
    pub fn register(&mut self, index: TypeIndex, record: TypeRecord) -> bool {
        if index < FIRST_DEFINED_TYPE_INDEX {
            debug!("refusing to redefine built-in type {:#06X}", index);
            return false;
        }
        let slot = (index - FIRST_DEFINED_TYPE_INDEX) as usize;
        if slot >= self.defined.len() {
            self.defined.resize(slot + 1, None);
        }
        self.defined[slot] = Some(record);
        true
    }

    pub fn lookup(&self, index: TypeIndex) -> Option<&TypeRecord> {
        if index < FIRST_DEFINED_TYPE_INDEX {
            builtin_type(index)
        } else {
            self.defined
                .get((index - FIRST_DEFINED_TYPE_INDEX) as usize)
                .and_then(|r| r.as_ref())
        }
    }

    /// The size of a type in bytes, or `None` if it is not (yet) known.
    pub fn size_of(&self, index: TypeIndex) -> Option<u32> {
        self.size_of_nested(index, 0)
    }

    fn size_of_nested(&self, index: TypeIndex, depth: usize) -> Option<u32> {
        if depth > MAX_TYPE_NESTING {
            debug!("type {:#06X} nests too deeply to compute its size", index);
            return None;
        }
        match self.lookup(index)? {
            TypeRecord::Basic(basic) => Some(basic.size()),
            TypeRecord::Pointer { .. } => Some(POINTER_SIZE),
            TypeRecord::Array { element, count, .. } => {
                let element_size = self.size_of_nested(*element, depth + 1)?;
                element_size.checked_mul(*count)
            },
            TypeRecord::Bitfield { base, .. } => self.size_of_nested(*base, depth + 1),
            TypeRecord::Struct { size, .. } => Some(*size),
            TypeRecord::Enum { .. } => Some(4),
        }
    }

    pub fn find_member(&self, index: TypeIndex, name: &str) -> Option<&Member> {
        match self.lookup(index)? {
            TypeRecord::Struct { members, .. } => members
                .iter()
                .find(|m| m.name.as_deref() == Some(name)),
            _ => None,
        }
    }

    /// The number of type numbers at or above 0x1000 that have been allocated.
    pub fn defined_count(&self) -> usize {
        self.defined.len()
    }
}


/// State owned by a single module's debug information pass.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct TypeParseContext {
    pub registry: TypeRegistry,
}
impl TypeParseContext {
    pub fn new() -> Self {
        Self::default()
    }
}


/// Applies the anonymity rule: an empty name and the placeholder `__unnamed` both mean "no name".
pub(crate) fn type_name(name: Option<String>) -> Option<String> {
    name.filter(|n| !n.is_empty() && n != "__unnamed")
}


/// Decodes a type table into `ctx`, announcing every defined type to `sink`.
///
/// An unrecognized field-list member abandons the rest of the table; types registered up to that
/// point remain registered.
#[instrument(skip_all)]
pub fn parse_type_table(ctx: &mut TypeParseContext, bytes: &[u8], sink: &mut dyn SymbolSink) -> Result<(), TypeTableError> {
    let mut cursor = ByteCursor::new(bytes);
    let mut type_index = FIRST_DEFINED_TYPE_INDEX;

    while !cursor.is_at_end() {
        let record_start = cursor.position();
        let length = usize::from(cursor.read_u16()?);
        let record = slice_at(bytes, record_start + 2, length)?;

        if let Some(type_record) = parse_type_record(ctx, type_index, record)? {
            debug!("type {:#06X}: {:?}", type_index, type_record);
            sink.add_type(type_index, &type_record);
            ctx.registry.register(type_index, type_record);
        }

        cursor.seek(record_start + 2 + length)?;
        type_index += 1;
    }

    Ok(())
}

fn parse_type_record(ctx: &TypeParseContext, type_index: TypeIndex, record: &[u8]) -> Result<Option<TypeRecord>, TypeTableError> {
    let mut cursor = ByteCursor::new(record);
    let kind = TypeLeafIndex::from_base_type(cursor.read_u16()?);

    let type_record = match kind {
        TypeLeafIndex::Pointer => {
            let _attributes = cursor.read_u16()?;
            let pointee = cursor.read_u16()?.into();
            TypeRecord::Pointer { pointee }
        },
        TypeLeafIndex::Pointer32 => {
            let pointee = cursor.read_u32()?;
            let _attributes = cursor.read_u32()?;
            TypeRecord::Pointer { pointee }
        },
        TypeLeafIndex::Array|TypeLeafIndex::Array32 => {
            let element = if kind == TypeLeafIndex::Array {
                let element = cursor.read_u16()?.into();
                let _index_type = cursor.read_u16()?;
                element
            } else {
                let element = cursor.read_u32()?;
                let _index_type = cursor.read_u32()?;
                element
            };
            let byte_length = read_numeric_value(&mut cursor)?;
            let name = type_name(cursor.read_counted_string()?);

            let element_size = ctx.registry.size_of(element).unwrap_or(0);
            let count = if element_size == 0 {
                0
            } else {
                u32::try_from(byte_length.max(0) / i64::from(element_size)).unwrap_or(u32::MAX)
            };
            TypeRecord::Array { name, element, count }
        },
        TypeLeafIndex::BitField => {
            let bit_width = cursor.read_u8()?;
            let bit_offset = cursor.read_u8()?;
            let base = cursor.read_u16()?.into();
            TypeRecord::Bitfield { base, bit_offset, bit_width }
        },
        TypeLeafIndex::BitField32 => {
            let base = cursor.read_u32()?;
            let bit_width = cursor.read_u8()?;
            let bit_offset = cursor.read_u8()?;
            TypeRecord::Bitfield { base, bit_offset, bit_width }
        },
        TypeLeafIndex::FieldList|TypeLeafIndex::FieldList32 => {
            // field lists are referenced by the struct or enum that follows them; guess which it
            // will be from the first member
            let list = &record[cursor.position()..];
            let first_kind = ByteCursor::new(list).peek_u16().ok().map(FieldLeafIndex::from_base_type);
            if first_kind == Some(FieldLeafIndex::EnumerationNameAndValue) {
                let values = parse_enum_field_list(type_index, list)?;
                TypeRecord::Enum { name: None, values }
            } else {
                let members = parse_struct_field_list(ctx, type_index, list)?;
                TypeRecord::Struct { kind: StructKind::Struct, name: None, size: 0, members }
            }
        },
        TypeLeafIndex::Structure|TypeLeafIndex::Class => {
            let _member_count = cursor.read_u16()?;
            let field_list: TypeIndex = cursor.read_u16()?.into();
            let _properties = cursor.read_u16()?;
            let _derived = cursor.read_u16()?;
            let _vtable_shape = cursor.read_u16()?;
            let struct_kind = if kind == TypeLeafIndex::Class { StructKind::Class } else { StructKind::Struct };
            finish_struct(ctx, type_index, struct_kind, field_list, &mut cursor)?
        },
        TypeLeafIndex::Structure32|TypeLeafIndex::Class32 => {
            let _member_count = cursor.read_u16()?;
            let _properties = cursor.read_u16()?;
            let field_list = cursor.read_u32()?;
            let _derived = cursor.read_u32()?;
            let _vtable_shape = cursor.read_u32()?;
            let struct_kind = if kind == TypeLeafIndex::Class32 { StructKind::Class } else { StructKind::Struct };
            finish_struct(ctx, type_index, struct_kind, field_list, &mut cursor)?
        },
        TypeLeafIndex::Union => {
            let _member_count = cursor.read_u16()?;
            let field_list: TypeIndex = cursor.read_u16()?.into();
            let _properties = cursor.read_u16()?;
            finish_struct(ctx, type_index, StructKind::Union, field_list, &mut cursor)?
        },
        TypeLeafIndex::Union32 => {
            let _member_count = cursor.read_u16()?;
            let _properties = cursor.read_u16()?;
            let field_list = cursor.read_u32()?;
            finish_struct(ctx, type_index, StructKind::Union, field_list, &mut cursor)?
        },
        TypeLeafIndex::Enum => {
            let _value_count = cursor.read_u16()?;
            let _underlying_type = cursor.read_u16()?;
            let field_list: TypeIndex = cursor.read_u16()?.into();
            let _properties = cursor.read_u16()?;
            let name = type_name(cursor.read_counted_string()?);
            finish_enum(ctx, type_index, name, field_list)
        },
        TypeLeafIndex::Enum32 => {
            let _value_count = cursor.read_u16()?;
            let _properties = cursor.read_u16()?;
            let _underlying_type = cursor.read_u32()?;
            let field_list = cursor.read_u32()?;
            let name = type_name(cursor.read_counted_string()?);
            finish_enum(ctx, type_index, name, field_list)
        },
        _ => {
            debug!("skipping type {:#06X} of kind {:?}", type_index, kind);
            return Ok(None);
        },
    };
    Ok(Some(type_record))
}

fn finish_struct(
    ctx: &TypeParseContext,
    type_index: TypeIndex,
    kind: StructKind,
    field_list: TypeIndex,
    cursor: &mut ByteCursor,
) -> Result<TypeRecord, DecodeError> {
    let size = read_numeric_value(cursor)?;
    let name = type_name(cursor.read_counted_string()?);
    let size = u32::try_from(size.max(0)).unwrap_or(u32::MAX);

    let members = match ctx.registry.lookup(field_list) {
        Some(TypeRecord::Struct { members, .. }) => members.clone(),
        Some(other) => {
            warn!(
                "type {:#06X} ({:?}) references field list {:#06X} which is not a member list but {:?}; leaving it without members",
                type_index, name, field_list, other,
            );
            Vec::new()
        },
        None => {
            debug!("type {:#06X} ({:?}) references undefined field list {:#06X}", type_index, name, field_list);
            Vec::new()
        },
    };
    Ok(TypeRecord::Struct { kind, name, size, members })
}

fn finish_enum(ctx: &TypeParseContext, type_index: TypeIndex, name: Option<String>, field_list: TypeIndex) -> TypeRecord {
    let values = match ctx.registry.lookup(field_list) {
        Some(TypeRecord::Enum { values, .. }) => values.clone(),
        Some(other) => {
            warn!(
                "enum {:#06X} ({:?}) references field list {:#06X} which is not an enumerator list but {:?}; leaving it empty",
                type_index, name, field_list, other,
            );
            Vec::new()
        },
        None => {
            debug!("enum {:#06X} ({:?}) references undefined field list {:#06X}", type_index, name, field_list);
            Vec::new()
        },
    };
    TypeRecord::Enum { name, values }
}

/// Skips padding bytes between field-list members. Returns whether padding was found.
fn skip_padding(cursor: &mut ByteCursor) -> Result<bool, DecodeError> {
    let first = cursor.peek_u8()?;
    if first < 0xF0 {
        return Ok(false);
    }
    let skip = usize::from(first & 0x0F).max(1).min(cursor.remaining());
    cursor.skip(skip)?;
    Ok(true)
}

fn parse_enum_field_list(type_index: TypeIndex, list: &[u8]) -> Result<Vec<Enumerator>, TypeTableError> {
    let mut cursor = ByteCursor::new(list);
    let mut values = Vec::new();
    while !cursor.is_at_end() {
        if skip_padding(&mut cursor)? {
            continue;
        }

        let kind = cursor.read_u16()?;
        match FieldLeafIndex::from_base_type(kind) {
            FieldLeafIndex::EnumerationNameAndValue => {
                let _attributes = cursor.read_u16()?;
                let value = read_numeric_value(&mut cursor)?;
                let name = type_name(cursor.read_counted_string()?);
                values.push(Enumerator { name, value });
            },
            _ => {
                error!("unhandled member kind {:#06X} in enum field list {:#06X}", kind, type_index);
                return Err(TypeTableError::UnknownFieldListMember { type_index, kind });
            },
        }
    }
    Ok(values)
}

fn parse_struct_field_list(ctx: &TypeParseContext, type_index: TypeIndex, list: &[u8]) -> Result<Vec<Member>, TypeTableError> {
    let mut cursor = ByteCursor::new(list);
    let mut members = Vec::new();
    while !cursor.is_at_end() {
        if skip_padding(&mut cursor)? {
            continue;
        }

        let kind = cursor.read_u16()?;
        let field_kind = FieldLeafIndex::from_base_type(kind);
        match field_kind {
            FieldLeafIndex::DataMember|FieldLeafIndex::DataMember32 => {
                let member_type = if field_kind == FieldLeafIndex::DataMember {
                    let member_type = cursor.read_u16()?.into();
                    let _attributes = cursor.read_u16()?;
                    member_type
                } else {
                    let _attributes = cursor.read_u16()?;
                    cursor.read_u32()?
                };
                let offset = read_numeric_value(&mut cursor)?;
                let name = type_name(cursor.read_counted_string()?);
                members.push(make_member(ctx, name, member_type, offset));
            },

            // everything else is skipped
            FieldLeafIndex::RealBaseClass => {
                cursor.skip(2 + 2)?;
                read_numeric_value(&mut cursor)?;
            },
            FieldLeafIndex::RealBaseClass32 => {
                cursor.skip(2 + 4)?;
                read_numeric_value(&mut cursor)?;
            },
            FieldLeafIndex::DirectVirtualBaseClass|FieldLeafIndex::IndirectVirtualBaseClass => {
                cursor.skip(2 + 2 + 2)?;
                read_numeric_value(&mut cursor)?;
                read_numeric_value(&mut cursor)?;
            },
            FieldLeafIndex::DirectVirtualBaseClass32|FieldLeafIndex::IndirectVirtualBaseClass32 => {
                cursor.skip(2 + 4 + 4)?;
                read_numeric_value(&mut cursor)?;
                read_numeric_value(&mut cursor)?;
            },
            FieldLeafIndex::StaticDataMember|FieldLeafIndex::Method => {
                cursor.skip(2 + 2)?;
                cursor.read_counted_string()?;
            },
            FieldLeafIndex::StaticDataMember32|FieldLeafIndex::Method32 => {
                cursor.skip(2 + 4)?;
                cursor.read_counted_string()?;
            },
            FieldLeafIndex::NestedTypeDefinition|FieldLeafIndex::FriendFunction => {
                cursor.skip(2)?;
                cursor.read_counted_string()?;
            },
            FieldLeafIndex::NestedTypeDefinition32|FieldLeafIndex::FriendFunction32 => {
                cursor.skip(2 + 4)?;
                cursor.read_counted_string()?;
            },
            FieldLeafIndex::NestedTypeDefinitionEx => {
                cursor.skip(2 + 2)?;
                cursor.read_counted_string()?;
            },
            FieldLeafIndex::NestedTypeDefinitionEx32 => {
                cursor.skip(2 + 4)?;
                cursor.read_counted_string()?;
            },
            FieldLeafIndex::VirtualFunctionTablePointer|FieldLeafIndex::FriendClass|FieldLeafIndex::IndexToAnotherTypeRecord => {
                cursor.skip(2)?;
            },
            FieldLeafIndex::VirtualFunctionTablePointer32|FieldLeafIndex::FriendClass32|FieldLeafIndex::IndexToAnotherTypeRecord32 => {
                cursor.skip(2 + 4)?;
            },
            FieldLeafIndex::VirtualFunctionOffset => {
                cursor.skip(2 + 4)?;
            },
            FieldLeafIndex::VirtualFunctionOffset32 => {
                cursor.skip(2 + 4 + 4)?;
            },
            FieldLeafIndex::OneMethod|FieldLeafIndex::OneMethod32 => {
                let attributes = cursor.read_u16()?;
                if field_kind == FieldLeafIndex::OneMethod {
                    cursor.skip(2)?;
                } else {
                    cursor.skip(4)?;
                }
                let method_property = (attributes >> 2) & 0b111;
                if method_property == 4 || method_property == 6 {
                    // (pure) introducing virtual method: vtable offset
                    cursor.skip(4)?;
                }
                cursor.read_counted_string()?;
            },
            _ => {
                error!("unhandled member kind {:#06X} in struct field list {:#06X}", kind, type_index);
                return Err(TypeTableError::UnknownFieldListMember { type_index, kind });
            },
        }
    }
    Ok(members)
}

fn make_member(ctx: &TypeParseContext, name: Option<String>, type_index: TypeIndex, byte_offset: i64) -> Member {
    let byte_offset = u32::try_from(byte_offset.max(0)).unwrap_or(u32::MAX);
    let bit_offset = byte_offset.saturating_mul(8);
    match ctx.registry.lookup(type_index) {
        Some(TypeRecord::Bitfield { bit_offset: field_offset, bit_width, .. }) => Member {
            name,
            type_index,
            bit_offset: bit_offset.saturating_add((*field_offset).into()),
            bit_width: (*bit_width).into(),
        },
        _ => Member {
            name,
            type_index,
            bit_offset,
            bit_width: ctx.registry.size_of(type_index).unwrap_or(0).saturating_mul(8),
        },
    }
}
