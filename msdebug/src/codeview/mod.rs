//! Debug information in the CodeView format.
//!
//! NB09 and NB11 blocks carry their information in a directory of subsections; NB10 blocks only
//! name the program database holding it.


pub mod leaf;
pub mod lines;
pub mod symbols;
pub mod types;


use from_to_repr::from_to_other;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::LoadStatus;
use crate::codeview::lines::{parse_line_tables, LineTable};
use crate::codeview::types::{parse_type_table, TypeParseContext};
use crate::cursor::{slice_at, ByteCursor};
use crate::error::{DecodeError, Error, TypeTableError};
use crate::module::DebugModule;
use crate::pdb::process_pdb_file;
use crate::sink::SymbolSink;


pub const SIGNATURE_NB09: [u8; 4] = *b"NB09";
pub const SIGNATURE_NB10: [u8; 4] = *b"NB10";
pub const SIGNATURE_NB11: [u8; 4] = *b"NB11";


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct SubsectionDirectoryHeader {
    pub header_length: u16,
    pub entry_length: u16,
    pub entry_count: u32,
    pub next_directory_offset: u32,
    pub flags: u32,
}
impl SubsectionDirectoryHeader {
    pub fn read(cursor: &mut ByteCursor) -> Result<Self, DecodeError> {
        let header_buf = cursor.read_bytes(16)?;

        let header_length = u16::from_le_bytes(header_buf[0..2].try_into().unwrap());
        let entry_length = u16::from_le_bytes(header_buf[2..4].try_into().unwrap());
        let entry_count = u32::from_le_bytes(header_buf[4..8].try_into().unwrap());
        let next_directory_offset = u32::from_le_bytes(header_buf[8..12].try_into().unwrap());
        let flags = u32::from_le_bytes(header_buf[12..16].try_into().unwrap());

        Ok(Self {
            header_length,
            entry_length,
            entry_count,
            next_directory_offset,
            flags,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct SubsectionDirectoryEntry {
    pub subsection_type: SubsectionType, // u16
    pub module_index: u16,
    pub offset: u32,
    pub size_bytes: u32,
}
impl SubsectionDirectoryEntry {
    pub const SIZE: usize = 12;

    pub fn read(cursor: &mut ByteCursor) -> Result<Self, DecodeError> {
        let entry_buf = cursor.read_bytes(Self::SIZE)?;

        let subsection_type_u16 = u16::from_le_bytes(entry_buf[0..2].try_into().unwrap());
        let subsection_type = SubsectionType::from_base_type(subsection_type_u16);
        let module_index = u16::from_le_bytes(entry_buf[2..4].try_into().unwrap());
        let offset = u32::from_le_bytes(entry_buf[4..8].try_into().unwrap());
        let size_bytes = u32::from_le_bytes(entry_buf[8..12].try_into().unwrap());

        Ok(Self {
            subsection_type,
            module_index,
            offset,
            size_bytes,
        })
    }

    /// The subsection's bytes; `root` starts at the CodeView signature.
    pub fn data<'a>(&self, root: &'a [u8]) -> Result<&'a [u8], DecodeError> {
        slice_at(root, self.offset as usize, self.size_bytes as usize)
    }
}

#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[from_to_other(base_type = u16, derive_compare = "as_int")]
pub enum SubsectionType {
    Module = 0x120,
    Types = 0x121,
    PublicSymbolsLegacy = 0x122,
    PublicSymbols = 0x123,
    Symbols = 0x124,
    AlignSymbols = 0x125,
    SourceLineSegment = 0x126,
    SourceLineModule = 0x127,
    Libraries = 0x128,
    GlobalSymbols = 0x129,
    GlobalPublicSymbols = 0x12A,
    GlobalTypes = 0x12B,
    MakePCode = 0x12C,
    SegmentMap = 0x12D,
    SegmentName = 0x12E,
    PreCompile = 0x12F,
    PreCompileMap = 0x130,
    OffsetMap16 = 0x131,
    OffsetMap32 = 0x132,
    FileIndex = 0x133,
    StaticSymbols = 0x134,
    Other(u16),
}


/// Reads the subsection directory of an NB09 or NB11 block.
pub fn read_subsection_directory(root: &[u8]) -> Result<Vec<SubsectionDirectoryEntry>, DecodeError> {
    let mut cursor = ByteCursor::at(root, 4)?;
    let directory_offset = cursor.read_u32()? as usize;

    let mut header_cursor = ByteCursor::at(root, directory_offset)?;
    let header = SubsectionDirectoryHeader::read(&mut header_cursor)?;
    debug!("subsection directory: {:?}", header);

    let stride = usize::from(header.entry_length).max(SubsectionDirectoryEntry::SIZE);
    let first_entry = directory_offset + usize::from(header.header_length);
    let mut entries = Vec::new();
    for i in 0..header.entry_count as usize {
        let mut entry_cursor = ByteCursor::at(root, first_entry + i * stride)?;
        entries.push(SubsectionDirectoryEntry::read(&mut entry_cursor)?);
    }
    Ok(entries)
}


/// The contents of an NB10 block: a reference to a program database.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct PdbReference {
    pub timestamp: u32,
    pub age: u32,
    pub name: String,
}
impl PdbReference {
    /// Reads the reference; `root` starts at the CodeView signature.
    pub fn read(root: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = ByteCursor::at(root, 8)?;
        let timestamp = cursor.read_u32()?;
        let age = cursor.read_u32()?;
        let name = cursor.read_nul_terminated_string()?;
        Ok(Self {
            timestamp,
            age,
            name,
        })
    }
}


/// Loads CodeView debug information from the block at the start of `root`.
#[instrument(skip_all, fields(module = module.name()))]
pub fn process_codeview(module: &DebugModule, root: &[u8], ctx: &mut TypeParseContext, sink: &mut dyn SymbolSink) -> LoadStatus {
    LoadStatus::from_result(load_codeview(module, root, ctx, sink), module.name())
}

pub(crate) fn load_codeview(module: &DebugModule, root: &[u8], ctx: &mut TypeParseContext, sink: &mut dyn SymbolSink) -> Result<(), Error> {
    let signature: [u8; 4] = ByteCursor::new(root).read_bytes(4)?.try_into().unwrap();
    if signature == SIGNATURE_NB09 || signature == SIGNATURE_NB11 {
        load_subsections(module, root, ctx, sink)
    } else if signature == SIGNATURE_NB10 {
        let reference = PdbReference::read(root)?;
        debug!("CodeView information lives in {:?}", reference.name);
        process_pdb_file(module, &reference.name, reference.timestamp, ctx, sink)
    } else {
        error!("unknown CodeView signature {:?} in module {}", signature, module.name());
        Err(Error::UnknownSignature { signature })
    }
}

fn load_subsections(module: &DebugModule, root: &[u8], ctx: &mut TypeParseContext, sink: &mut dyn SymbolSink) -> Result<(), Error> {
    let entries = read_subsection_directory(root)?;

    // types first so that symbols can refer to them
    for entry in entries.iter().filter(|e| e.subsection_type == SubsectionType::GlobalTypes) {
        let data = entry.data(root)?;
        if let Err(e) = parse_global_types(ctx, data, sink) {
            error!("failed to parse global types of module {}: {}", module.name(), e);
        }
    }

    for (i, entry) in entries.iter().enumerate() {
        let subsection_type = entry.subsection_type;
        if subsection_type == SubsectionType::AlignSymbols {
            let line_tables = neighbouring_line_tables(root, &entries, i);
            let data = entry.data(root)?;
            let mut builder = module.symbol_builder(&ctx.registry, &mut *sink);
            builder.parse_symbol_stream(data, 4, data.len(), &line_tables)?;
        } else if subsection_type == SubsectionType::GlobalSymbols || subsection_type == SubsectionType::GlobalPublicSymbols {
            let data = entry.data(root)?;
            let records = global_symbol_records(data)?;
            let mut builder = module.symbol_builder(&ctx.registry, &mut *sink);
            builder.parse_symbol_stream(records, 0, records.len(), &[])?;
        } else {
            debug!("skipping subsection {:?} of module index {}", subsection_type, entry.module_index);
        }
    }

    Ok(())
}

/// Finds the line numbers belonging to the symbols at `entries[index]`.
///
/// They are in a source-module subsection of the same module right before or after the symbols;
/// the one before wins.
fn neighbouring_line_tables(root: &[u8], entries: &[SubsectionDirectoryEntry], index: usize) -> Vec<LineTable> {
    let entry = &entries[index];
    let next = entries.get(index + 1);
    let previous = index.checked_sub(1).and_then(|p| entries.get(p));

    let mut line_tables = Vec::new();
    for neighbour in [next, previous].into_iter().flatten() {
        if neighbour.module_index != entry.module_index || neighbour.subsection_type != SubsectionType::SourceLineModule {
            continue;
        }
        match neighbour.data(root).and_then(parse_line_tables) {
            Ok(tables) => line_tables = tables,
            Err(e) => warn!("ignoring line numbers of module index {}: {}", entry.module_index, e),
        }
    }
    line_tables
}

/// Decodes the type records of a global types subsection.
fn parse_global_types(ctx: &mut TypeParseContext, data: &[u8], sink: &mut dyn SymbolSink) -> Result<(), TypeTableError> {
    let mut cursor = ByteCursor::new(data);
    let _flags = cursor.read_u32()?;
    let type_count = cursor.read_u32()? as usize;
    cursor.skip(type_count.saturating_mul(4))?;
    parse_type_table(ctx, &data[cursor.position()..], sink)
}

/// Returns the symbol records of a global symbols subsection, leaving out the hash tables.
fn global_symbol_records(data: &[u8]) -> Result<&[u8], DecodeError> {
    let mut cursor = ByteCursor::new(data);
    let _symbol_hash_function_index = cursor.read_u16()?;
    let _address_hash_function_index = cursor.read_u16()?;
    let symbols_length = cursor.read_u32()? as usize;
    let _symbol_hash_table_length = cursor.read_u32()?;
    let _address_hash_table_length = cursor.read_u32()?;
    cursor.read_bytes(symbols_length)
}
