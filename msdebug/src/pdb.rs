//! Program databases (.PDB) in the multi-stream format of Visual C++ 4 to 6.
//!
//! The file is a sequence of fixed-size blocks. A table of contents lists the size of every stream
//! followed by the block numbers each stream occupies; streams are reassembled by concatenating
//! their blocks.


#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::codeview::lines::parse_line_tables;
use crate::codeview::types::{parse_type_table, TypeParseContext};
use crate::cursor::{slice_at, ByteCursor};
use crate::error::{DecodeError, Error};
use crate::locator::locate_and_map;
use crate::module::DebugModule;
use crate::sink::SymbolSink;


pub const IDENTIFICATION_PREFIX: &[u8] = b"Microsoft C/C++ program database ";

pub const ROOT_STREAM: u32 = 1;
pub const TYPES_STREAM: u32 = 2;
pub const SYMBOLS_STREAM: u32 = 3;

const KNOWN_ROOT_VERSIONS: [u32; 4] = [
    19950623, // VC 4.0
    19950814,
    19960307, // VC 5.0
    19970604, // VC 6.0
];
const KNOWN_TYPES_VERSIONS: [u32; 3] = [
    19950410, // VC 4.0
    19951122,
    19961031, // VC 5.0 and 6.0
];
const KNOWN_SYMBOLS_VERSIONS: [u32; 3] = [
    0, // VC 4.0
    19960307, // VC 5.0
    19970606, // VC 6.0
];

/// Types headers of versions before this one are the short variant.
const LONG_TYPES_HEADER_VERSION: u32 = 19960000;

/// Module descriptors of symbol header versions before this one are the short variant.
const LONG_MODULE_INFO_VERSION: u32 = 19970000;


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct PdbHeader {
    pub identification: Vec<u8>, // [u8; 40]
    pub signature: u32,
    pub block_size: u32,
    pub free_list_block: u16,
    pub allocated_blocks: u16,
    pub toc_size: u32,
    pub toc_reserved: u32,
    pub toc_blocks: Vec<u16>, // [u16; ceil(toc_size / block_size)]
}
impl PdbHeader {
    pub const FIXED_SIZE: usize = 60;

    pub fn read(bytes: &[u8]) -> Result<Self, Error> {
        if !bytes.starts_with(IDENTIFICATION_PREFIX) {
            error!("program database identification is missing");
            return Err(Error::BadPdbHeader);
        }

        let mut cursor = ByteCursor::new(bytes);
        let header_buf = cursor.read_bytes(Self::FIXED_SIZE)?;

        let identification = header_buf[0..40].to_vec();
        let signature = u32::from_le_bytes(header_buf[40..44].try_into().unwrap());
        let block_size = u32::from_le_bytes(header_buf[44..48].try_into().unwrap());
        let free_list_block = u16::from_le_bytes(header_buf[48..50].try_into().unwrap());
        let allocated_blocks = u16::from_le_bytes(header_buf[50..52].try_into().unwrap());
        let toc_size = u32::from_le_bytes(header_buf[52..56].try_into().unwrap());
        let toc_reserved = u32::from_le_bytes(header_buf[56..60].try_into().unwrap());

        if block_size == 0 {
            error!("program database has a block size of 0");
            return Err(Error::BadPdbHeader);
        }

        let toc_block_count = toc_size.div_ceil(block_size);
        let mut toc_blocks = Vec::with_capacity((toc_block_count as usize).min(cursor.remaining() / 2));
        for _ in 0..toc_block_count {
            toc_blocks.push(cursor.read_u16()?);
        }

        Ok(Self {
            identification,
            signature,
            block_size,
            free_list_block,
            allocated_blocks,
            toc_size,
            toc_reserved,
            toc_blocks,
        })
    }
}


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct StreamEntry {
    pub size: u32,
    pub reserved: u32,
}
impl StreamEntry {
    pub fn is_present(&self) -> bool {
        self.size != 0 && self.size != 0xFFFF_FFFF
    }

    pub fn block_count(&self, block_size: u32) -> u32 {
        if self.is_present() {
            self.size.div_ceil(block_size)
        } else {
            0
        }
    }
}


/// A program database with its table of contents decoded.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PdbFile<'a> {
    bytes: &'a [u8],
    header: PdbHeader,
    streams: Vec<StreamEntry>,
    block_lists: Vec<Vec<u16>>,
}
impl<'a> PdbFile<'a> {
    #[instrument(skip_all)]
    pub fn parse(bytes: &'a [u8]) -> Result<Self, Error> {
        let header = PdbHeader::read(bytes)?;
        debug!(
            "program database with block size {} and a {}-byte table of contents",
            header.block_size, header.toc_size,
        );
        let toc = read_blocks(bytes, header.block_size, &header.toc_blocks, header.toc_size)?;

        let mut cursor = ByteCursor::new(&toc);
        let stream_count = cursor.read_u32()?;
        let mut streams = Vec::with_capacity((stream_count as usize).min(cursor.remaining() / 8));
        for _ in 0..stream_count {
            let size = cursor.read_u32()?;
            let reserved = cursor.read_u32()?;
            streams.push(StreamEntry { size, reserved });
        }

        let mut block_lists = Vec::with_capacity(streams.len());
        for stream in &streams {
            let block_count = stream.block_count(header.block_size);
            let mut blocks = Vec::with_capacity((block_count as usize).min(cursor.remaining() / 2));
            for _ in 0..block_count {
                blocks.push(cursor.read_u16()?);
            }
            block_lists.push(blocks);
        }

        Ok(Self {
            bytes,
            header,
            streams,
            block_lists,
        })
    }

    pub fn header(&self) -> &PdbHeader { &self.header }
    pub fn streams(&self) -> &[StreamEntry] { &self.streams }

    /// Reassembles a stream; returns `None` if the stream does not exist or is empty.
    pub fn stream(&self, number: u32) -> Result<Option<Vec<u8>>, DecodeError> {
        let index = number as usize;
        let Some(entry) = self.streams.get(index) else {
            return Ok(None);
        };
        if !entry.is_present() {
            return Ok(None);
        }
        let data = read_blocks(self.bytes, self.header.block_size, &self.block_lists[index], entry.size)?;
        Ok(Some(data))
    }
}

/// Concatenates `blocks` and truncates the result to `size` bytes.
fn read_blocks(bytes: &[u8], block_size: u32, blocks: &[u16], size: u32) -> Result<Vec<u8>, DecodeError> {
    let block_size = block_size as usize;
    let mut data = Vec::with_capacity(blocks.len().saturating_mul(block_size).min(bytes.len()));
    for block in blocks {
        let block_bytes = slice_at(bytes, usize::from(*block) * block_size, block_size)?;
        data.extend_from_slice(block_bytes);
    }
    if data.len() < size as usize {
        return Err(DecodeError::UnexpectedEof {
            offset: data.len(),
            wanted: size as usize,
            available: data.len(),
        });
    }
    data.truncate(size as usize);
    Ok(data)
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct RootHeader {
    pub version: u32,
    pub timestamp: u32,
    pub age: u32,
    pub names_size: u32,
}
impl RootHeader {
    pub fn read(stream: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = ByteCursor::new(stream);
        let version = cursor.read_u32()?;
        let timestamp = cursor.read_u32()?;
        let age = cursor.read_u32()?;
        let names_size = cursor.read_u32()?;
        Ok(Self {
            version,
            timestamp,
            age,
            names_size,
        })
    }
}


/// The header of the types stream, whichever variant it was stored as.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct TypesHeader {
    pub version: u32,
    pub type_offset: u32,
    pub first_index: u32,
    pub last_index: u32,
    pub type_size: u32,
    pub hash_stream: u16,
}
impl TypesHeader {
    pub const SHORT_SIZE: u32 = 16;

    pub fn read(stream: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = ByteCursor::new(stream);
        let version = cursor.read_u32()?;
        if version < LONG_TYPES_HEADER_VERSION {
            let first_index = cursor.read_u16()?.into();
            let last_index = cursor.read_u16()?.into();
            let type_size = cursor.read_u32()?;
            let hash_stream = cursor.read_u16()?;
            let _padding = cursor.read_u16()?;
            Ok(Self {
                version,
                type_offset: Self::SHORT_SIZE,
                first_index,
                last_index,
                type_size,
                hash_stream,
            })
        } else {
            let type_offset = cursor.read_u32()?;
            let first_index = cursor.read_u32()?;
            let last_index = cursor.read_u32()?;
            let type_size = cursor.read_u32()?;
            let hash_stream = cursor.read_u16()?;
            let _padding = cursor.read_u16()?;
            // hash value and search tables follow; they are of no interest
            cursor.skip(8 * 4)?;
            Ok(Self {
                version,
                type_offset,
                first_index,
                last_index,
                type_size,
                hash_stream,
            })
        }
    }

    /// The type records within the types stream.
    pub fn records<'a>(&self, stream: &'a [u8]) -> Result<&'a [u8], DecodeError> {
        slice_at(stream, self.type_offset as usize, self.type_size as usize)
    }
}


/// The header of the symbols stream, whichever variant it was stored as.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct SymbolsHeader {
    pub header_size: u32,
    pub signature: u32,
    pub version: u32,
    pub age: u32,
    pub hash1_stream: u32,
    pub hash2_stream: u32,
    pub global_symbol_stream: u32,
    pub module_info_size: u32,
    pub offset_size: u32,
    pub hash_size: u32,
    pub source_module_size: u32,
    pub import_size: u32,
}
impl SymbolsHeader {
    pub const SHORT_SIZE: u32 = 24;
    pub const LONG_SIZE: u32 = 64;
    pub const LONG_SIGNATURE: u32 = 0xFFFF_FFFF;

    pub fn read(stream: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = ByteCursor::new(stream);
        let first = ByteCursor::new(stream).read_u32()?;
        if first != Self::LONG_SIGNATURE {
            let hash1_stream = cursor.read_u16()?.into();
            let hash2_stream = cursor.read_u16()?.into();
            let global_symbol_stream = cursor.read_u16()?.into();
            let _padding = cursor.read_u16()?;
            let module_info_size = cursor.read_u32()?;
            let offset_size = cursor.read_u32()?;
            let hash_size = cursor.read_u32()?;
            let source_module_size = cursor.read_u32()?;
            Ok(Self {
                header_size: Self::SHORT_SIZE,
                hash1_stream,
                hash2_stream,
                global_symbol_stream,
                module_info_size,
                offset_size,
                hash_size,
                source_module_size,
                ..Default::default()
            })
        } else {
            let signature = cursor.read_u32()?;
            let version = cursor.read_u32()?;
            let age = cursor.read_u32()?;
            let hash1_stream = cursor.read_u32()?;
            let hash2_stream = cursor.read_u32()?;
            let global_symbol_stream = cursor.read_u32()?;
            let module_info_size = cursor.read_u32()?;
            let offset_size = cursor.read_u32()?;
            let hash_size = cursor.read_u32()?;
            let source_module_size = cursor.read_u32()?;
            let import_size = cursor.read_u32()?;
            cursor.skip(5 * 4)?;
            Ok(Self {
                header_size: Self::LONG_SIZE,
                signature,
                version,
                age,
                hash1_stream,
                hash2_stream,
                global_symbol_stream,
                module_info_size,
                offset_size,
                hash_size,
                source_module_size,
                import_size,
            })
        }
    }
}


/// Where one module's symbols and line numbers are stored.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct ModuleInfo {
    pub stream: u16,
    pub symbol_size: u32,
    pub line_size: u32,
    pub module_name: String,
    pub object_name: String,
}
impl ModuleInfo {
    pub const SHORT_SIZE: usize = 48;
    pub const LONG_SIZE: usize = 64;

    pub fn read(cursor: &mut ByteCursor, long: bool) -> Result<Self, DecodeError> {
        let (fixed_size, stream_offset) = if long {
            (Self::LONG_SIZE, 34)
        } else {
            (Self::SHORT_SIZE, 26)
        };
        let fixed_buf = cursor.read_bytes(fixed_size)?;
        let stream = u16::from_le_bytes(fixed_buf[stream_offset..stream_offset+2].try_into().unwrap());
        let symbol_size = u32::from_le_bytes(fixed_buf[stream_offset+2..stream_offset+6].try_into().unwrap());
        let line_size = u32::from_le_bytes(fixed_buf[stream_offset+6..stream_offset+10].try_into().unwrap());

        let module_name = cursor.read_nul_terminated_string()?;
        let object_name = cursor.read_nul_terminated_string()?;
        cursor.align(4);

        Ok(Self {
            stream,
            symbol_size,
            line_size,
            module_name,
            object_name,
        })
    }
}

/// Reads the module descriptors that follow the symbols header.
pub fn read_module_infos(symbols_stream: &[u8], header: &SymbolsHeader) -> Result<Vec<ModuleInfo>, DecodeError> {
    let start = header.header_size as usize;
    let end = start + header.module_info_size as usize;
    // alignment is relative to the start of the stream
    let area = slice_at(symbols_stream, 0, end)?;
    let mut cursor = ByteCursor::at(area, start)?;

    let long = header.version >= LONG_MODULE_INFO_VERSION;
    let mut modules = Vec::new();
    while !cursor.is_at_end() {
        let module = ModuleInfo::read(&mut cursor, long)?;
        debug!("module {:?} in stream {}", module.module_name, module.stream);
        modules.push(module);
    }
    Ok(modules)
}


/// Loads the program database `name` on behalf of `module`.
///
/// `timestamp` is the one recorded in the referencing executable.
#[instrument(skip_all, fields(pdb = name))]
pub fn process_pdb_file(module: &DebugModule, name: &str, timestamp: u32, ctx: &mut TypeParseContext, sink: &mut dyn SymbolSink) -> Result<(), Error> {
    let mapped = locate_and_map(name, None, module.search_path())?;
    let pdb = PdbFile::parse(mapped.bytes())?;

    let root_stream = pdb.stream(ROOT_STREAM)?
        .ok_or(Error::MissingPdbStream { stream: ROOT_STREAM })?;
    let root = RootHeader::read(&root_stream)?;
    let types_stream = pdb.stream(TYPES_STREAM)?;
    let types = types_stream.as_deref().map(TypesHeader::read).transpose()?;
    let symbols_stream = pdb.stream(SYMBOLS_STREAM)?;
    let symbols = symbols_stream.as_deref().map(SymbolsHeader::read).transpose()?;

    if !KNOWN_ROOT_VERSIONS.contains(&root.version) {
        warn!("unknown root block version {} in {}", root.version, name);
    }
    if let Some(types) = &types {
        if !KNOWN_TYPES_VERSIONS.contains(&types.version) {
            warn!("unknown type information version {} in {}", types.version, name);
        }
    }
    if let Some(symbols) = &symbols {
        if !KNOWN_SYMBOLS_VERSIONS.contains(&symbols.version) {
            warn!("unknown symbol information version {} in {}", symbols.version, name);
        }
    }
    if root.timestamp != timestamp {
        warn!(
            "timestamp of {} ({:#010X}) does not match the one expected by {} ({:#010X})",
            name, root.timestamp, module.name(), timestamp,
        );
    }

    if let (Some(types), Some(types_stream)) = (&types, &types_stream) {
        let result = types.records(types_stream)
            .map_err(Error::from)
            .and_then(|records| parse_type_table(ctx, records, sink).map_err(Error::from));
        if let Err(e) = result {
            error!("failed to parse type information of {}: {}", name, e);
        }
    }

    let (Some(symbols), Some(symbols_stream)) = (symbols, symbols_stream) else {
        debug!("{} has no symbols", name);
        return Ok(());
    };
    if symbols.import_size != 0 {
        warn!("ignoring type server imports of {}", name);
    }

    if let Some(global_symbols) = pdb.stream(symbols.global_symbol_stream)? {
        let mut builder = module.symbol_builder(&ctx.registry, &mut *sink);
        builder.parse_symbol_stream(&global_symbols, 0, global_symbols.len(), &[])?;
    }

    for info in read_module_infos(&symbols_stream, &symbols)? {
        let Some(module_stream) = pdb.stream(info.stream.into())? else {
            debug!("module {:?} has no stream", info.module_name);
            continue;
        };

        let symbol_size = info.symbol_size as usize;
        let line_tables = if info.line_size == 0 {
            Vec::new()
        } else {
            match slice_at(&module_stream, symbol_size, info.line_size as usize).and_then(parse_line_tables) {
                Ok(tables) => tables,
                Err(e) => {
                    warn!("ignoring line numbers of module {:?}: {}", info.module_name, e);
                    Vec::new()
                },
            }
        };

        if symbol_size != 0 {
            let mut builder = module.symbol_builder(&ctx.registry, &mut *sink);
            builder.parse_symbol_stream(&module_stream, 4, symbol_size, &line_tables)?;
        }
    }

    Ok(())
}
