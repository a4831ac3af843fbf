//! COFF symbol and line number tables, as embedded in executables and .DBG files.


use from_to_repr::from_to_other;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::LoadStatus;
use crate::cursor::{slice_at, slice_from, ByteCursor};
use crate::error::{DecodeError, Error};
use crate::module::DebugModule;
use crate::sink::{LineTableEntry, SymbolId, SymbolKind, SymbolRecord, SymbolSink};


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct CoffSymbolsHeader {
    pub symbol_count: u32,
    pub symbol_table_offset: u32,
    pub line_number_count: u32,
    pub line_number_offset: u32,
    pub first_code_rva: u32,
    pub last_code_rva: u32,
    pub first_data_rva: u32,
    pub last_data_rva: u32,
}
impl CoffSymbolsHeader {
    pub const SIZE: usize = 32;

    pub fn read(cursor: &mut ByteCursor) -> Result<Self, DecodeError> {
        let header_buf = cursor.read_bytes(Self::SIZE)?;

        let symbol_count = u32::from_le_bytes(header_buf[0..4].try_into().unwrap());
        let symbol_table_offset = u32::from_le_bytes(header_buf[4..8].try_into().unwrap());
        let line_number_count = u32::from_le_bytes(header_buf[8..12].try_into().unwrap());
        let line_number_offset = u32::from_le_bytes(header_buf[12..16].try_into().unwrap());
        let first_code_rva = u32::from_le_bytes(header_buf[16..20].try_into().unwrap());
        let last_code_rva = u32::from_le_bytes(header_buf[20..24].try_into().unwrap());
        let first_data_rva = u32::from_le_bytes(header_buf[24..28].try_into().unwrap());
        let last_data_rva = u32::from_le_bytes(header_buf[28..32].try_into().unwrap());

        Ok(Self {
            symbol_count,
            symbol_table_offset,
            line_number_count,
            line_number_offset,
            first_code_rva,
            last_code_rva,
            first_data_rva,
            last_data_rva,
        })
    }
}


#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[from_to_other(base_type = u8, derive_compare = "as_int")]
pub enum StorageClass {
    EndOfFunction = 0xFF,
    Null = 0,
    Automatic = 1,
    External = 2,
    Static = 3,
    Register = 4,
    ExternalDefinition = 5,
    Label = 6,
    UndefinedLabel = 7,
    MemberOfStruct = 8,
    Argument = 9,
    StructTag = 10,
    MemberOfUnion = 11,
    UnionTag = 12,
    TypeDefinition = 13,
    UndefinedStatic = 14,
    EnumTag = 15,
    MemberOfEnum = 16,
    RegisterParam = 17,
    BitField = 18,
    Block = 100,
    Function = 101,
    EndOfStruct = 102,
    File = 103,
    Section = 104,
    WeakExternal = 105,
    Other(u8),
}

/// A name stored inline or, if the first four bytes are zero, as an offset into the string table.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum CoffName {
    Short([u8; 8]),
    StringTableOffset(u32),
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct CoffSymbol {
    pub name: CoffName,
    pub value: u32,
    pub section_number: i16,
    pub symbol_type: u16,
    pub storage_class: StorageClass, // u8
    pub aux_count: u8,
}
impl CoffSymbol {
    pub const SIZE: usize = 18;

    pub fn read(cursor: &mut ByteCursor) -> Result<Self, DecodeError> {
        let symbol_buf = cursor.read_bytes(Self::SIZE)?;

        let name = if symbol_buf[0..4] == [0, 0, 0, 0] {
            CoffName::StringTableOffset(u32::from_le_bytes(symbol_buf[4..8].try_into().unwrap()))
        } else {
            CoffName::Short(symbol_buf[0..8].try_into().unwrap())
        };
        let value = u32::from_le_bytes(symbol_buf[8..12].try_into().unwrap());
        let section_number = i16::from_le_bytes(symbol_buf[12..14].try_into().unwrap());
        let symbol_type = u16::from_le_bytes(symbol_buf[14..16].try_into().unwrap());
        let storage_class = StorageClass::from_base_type(symbol_buf[16]);
        let aux_count = symbol_buf[17];

        Ok(Self {
            name,
            value,
            section_number,
            symbol_type,
            storage_class,
            aux_count,
        })
    }

    /// Whether the derived type of this symbol is "function".
    pub fn is_function(&self) -> bool {
        self.symbol_type & 0x0030 == 0x0020
    }

    /// The symbol's name with a single leading underscore removed.
    pub fn name(&self, string_table: &[u8]) -> Result<String, DecodeError> {
        let full = match self.name {
            CoffName::Short(bytes) => ByteCursor::new(&bytes).read_padded_string(8)?,
            CoffName::StringTableOffset(offset) => ByteCursor::at(string_table, offset as usize)?
                .read_nul_terminated_string()?,
        };
        Ok(match full.strip_prefix('_') {
            Some(stripped) => stripped.to_owned(),
            None => full,
        })
    }
}

/// The auxiliary record following a section definition symbol.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct AuxSectionDefinition {
    pub length: u32,
    pub relocation_count: u16,
    pub line_number_count: u16,
}
impl AuxSectionDefinition {
    pub fn read(cursor: &mut ByteCursor) -> Result<Self, DecodeError> {
        let aux_buf = cursor.read_bytes(CoffSymbol::SIZE)?;
        let length = u32::from_le_bytes(aux_buf[0..4].try_into().unwrap());
        let relocation_count = u16::from_le_bytes(aux_buf[4..6].try_into().unwrap());
        let line_number_count = u16::from_le_bytes(aux_buf[6..8].try_into().unwrap());
        Ok(Self {
            length,
            relocation_count,
            line_number_count,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct CoffLineNumber {
    /// The RVA of the code; for line number 0, the index of the function's symbol instead.
    pub address: u32,
    pub line: u16,
}
impl CoffLineNumber {
    pub const SIZE: usize = 6;

    pub fn read(cursor: &mut ByteCursor) -> Result<Self, DecodeError> {
        let address = cursor.read_u32()?;
        let line = cursor.read_u16()?;
        Ok(Self { address, line })
    }
}


/// A compilation unit as seen through the symbol table.
#[derive(Clone, Debug)]
struct CoffFileEntry {
    file_name: String,
    start: u32,
    end: u32,
    line_table_index: Option<usize>,
    line_count: usize,
    entrypoints: Vec<(u64, SymbolId)>,
}
impl CoffFileEntry {
    fn new(file_name: String) -> Self {
        Self {
            file_name,
            start: u32::MAX,
            end: 0,
            line_table_index: None,
            line_count: 0,
            entrypoints: Vec::new(),
        }
    }

    fn contains(&self, rva: u32) -> bool {
        rva >= self.start && rva < self.end
    }
}


/// Loads the COFF symbols whose header is at the start of `root`.
#[instrument(skip_all, fields(module = module.name()))]
pub fn process_coff(module: &DebugModule, root: &[u8], sink: &mut dyn SymbolSink) -> LoadStatus {
    LoadStatus::from_result(load_coff(module, root, sink), module.name())
}

pub(crate) fn load_coff(module: &DebugModule, root: &[u8], sink: &mut dyn SymbolSink) -> Result<(), Error> {
    let header = CoffSymbolsHeader::read(&mut ByteCursor::new(root))?;
    debug!("COFF symbols: {:?}", header);

    let symbol_table_length = (header.symbol_count as usize).saturating_mul(CoffSymbol::SIZE);
    let symbol_table = slice_at(root, header.symbol_table_offset as usize, symbol_table_length)?;
    let string_table = slice_from(root, (header.symbol_table_offset as usize).saturating_add(symbol_table_length))?;
    let line_table_length = (header.line_number_count as usize).saturating_mul(CoffLineNumber::SIZE);
    let line_table = slice_at(root, header.line_number_offset as usize, line_table_length)?;

    let sections = module.sections();
    let load_base = module.load_base();
    let mut files: Vec<CoffFileEntry> = Vec::new();
    let mut current_file: Option<usize> = None;
    let mut line_table_index = 0;

    let mut cursor = ByteCursor::new(symbol_table);
    while !cursor.is_at_end() {
        let symbol = CoffSymbol::read(&mut cursor)?;
        let aux_length = usize::from(symbol.aux_count) * CoffSymbol::SIZE;
        let mut aux_cursor = cursor.sub_cursor(aux_length)?;

        if symbol.storage_class == StorageClass::File {
            let file_name = aux_cursor.read_padded_string(aux_length)?;
            debug!("new file {:?}", file_name);
            files.push(CoffFileEntry::new(file_name));
            current_file = Some(files.len() - 1);
            continue;
        }

        let current = match current_file {
            Some(current) => current,
            None => {
                files.push(CoffFileEntry::new("<none>".to_owned()));
                files.len() - 1
            },
        };
        current_file = Some(current);

        let section_base = if symbol.section_number > 0 {
            match sections.get(symbol.section_number as usize - 1) {
                Some(section) => Some(section.virtual_address),
                None => {
                    debug!("skipping symbol in nonexistent section {}", symbol.section_number);
                    continue;
                },
            }
        } else {
            None
        };

        if symbol.storage_class == StorageClass::Static && symbol.aux_count > 0 && symbol.symbol_type == 0 && symbol.section_number == 1 {
            // describes the text section contributed by the current file
            let aux = AuxSectionDefinition::read(&mut aux_cursor)?;
            let index = if files[current].line_table_index.is_some() {
                let duplicate = CoffFileEntry::new(files[current].file_name.clone());
                debug!("another text section for {:?}", duplicate.file_name);
                files.push(duplicate);
                current_file = Some(files.len() - 1);
                files.len() - 1
            } else {
                current
            };

            let start = section_base.unwrap_or(0).wrapping_add(symbol.value);
            let file = &mut files[index];
            file.start = file.start.min(start);
            file.end = file.end.max(start.wrapping_add(aux.length));
            file.line_table_index = Some(line_table_index);
            file.line_count = aux.line_number_count.into();
            line_table_index += usize::from(aux.line_number_count);
            continue;
        }

        let Some(section_base) = section_base else {
            continue;
        };
        let rva = section_base.wrapping_add(symbol.value);
        let address = load_base.wrapping_add(u64::from(rva));

        if symbol.storage_class == StorageClass::Static && symbol.aux_count == 0 && symbol.section_number == 1 {
            let name = symbol.name(string_table)?;
            debug!("static function {:?} at {:#X}", name, address);
            let mut record = SymbolRecord::new(name, SymbolKind::Function, address);
            record.source_file = Some(files[current].file_name.clone());
            let id = sink.add_symbol(record);
            files[current].entrypoints.push((address, id));
        } else if symbol.storage_class == StorageClass::External && symbol.is_function() {
            let name = symbol.name(string_table)?;
            debug!("global function {:?} at {:#X}", name, address);
            let owner = files.iter().position(|f| f.contains(rva));
            let mut record = SymbolRecord::new(name, SymbolKind::Function, address);
            record.source_file = owner.map(|o| files[o].file_name.clone());
            let id = sink.add_symbol(record);
            match owner {
                Some(owner) => files[owner].entrypoints.push((address, id)),
                None => sink.finish_function(id),
            }
        } else if symbol.storage_class == StorageClass::External {
            let name = symbol.name(string_table)?;
            debug!("global data {:?} at {:#X}", name, address);
            sink.add_symbol(SymbolRecord::new(name, SymbolKind::Data, address));
        }
    }

    for file in &mut files {
        file.entrypoints.sort_unstable();
        attribute_lines(file, line_table, load_base, sink)?;
        for (_, id) in &file.entrypoints {
            sink.finish_function(*id);
        }
    }

    Ok(())
}

/// Hands each line of a file's slice of the line number table to the function containing it.
fn attribute_lines(file: &CoffFileEntry, line_table: &[u8], load_base: u64, sink: &mut dyn SymbolSink) -> Result<(), DecodeError> {
    let Some(first_line) = file.line_table_index else {
        return Ok(());
    };
    if file.entrypoints.is_empty() {
        return Ok(());
    }

    let mut cursor = ByteCursor::at(line_table, first_line * CoffLineNumber::SIZE)?;
    let mut current = 0;
    for _ in 0..file.line_count {
        let line_number = CoffLineNumber::read(&mut cursor)?;
        if line_number.line == 0 {
            // function start marker
            continue;
        }

        let address = load_base.wrapping_add(u64::from(line_number.address));
        while current + 1 < file.entrypoints.len() && address >= file.entrypoints[current + 1].0 {
            current += 1;
        }
        let (function_address, id) = file.entrypoints[current];
        if address < function_address {
            debug!("line {} of {:?} precedes the first function", line_number.line, file.file_name);
            continue;
        }

        sink.add_line_number(id, LineTableEntry {
            line: line_number.line.into(),
            offset: (address - function_address) as u32,
        });
    }
    Ok(())
}


#[cfg(test)]
pub(crate) mod tests {
    use super::{process_coff, CoffSymbol};
    use crate::LoadStatus;
    use crate::image::SectionHeader;
    use crate::locator::SearchPathConfig;
    use crate::module::DebugModule;
    use crate::sink::{SymbolKind, SymbolTable};

    pub(crate) fn coff_symbol(name: &[u8], value: u32, section: i16, symbol_type: u16, storage_class: u8, aux_count: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; 8];
        bytes[..name.len()].copy_from_slice(name);
        bytes.extend_from_slice(&value.to_le_bytes());
        bytes.extend_from_slice(&section.to_le_bytes());
        bytes.extend_from_slice(&symbol_type.to_le_bytes());
        bytes.push(storage_class);
        bytes.push(aux_count);
        bytes
    }

    fn section_aux(length: u32, line_count: u16) -> Vec<u8> {
        let mut bytes = length.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0u16.to_le_bytes());
        bytes.extend_from_slice(&line_count.to_le_bytes());
        bytes.resize(CoffSymbol::SIZE, 0);
        bytes
    }

    /// Assembles a COFF symbols block: header, symbols, string table, line numbers.
    pub(crate) fn build_coff(symbols: &[Vec<u8>], symbol_count: u32, strings: &[u8], lines: &[(u32, u16)]) -> Vec<u8> {
        let symbol_bytes: Vec<u8> = symbols.concat();
        let symbol_offset = 32u32;
        let line_offset = symbol_offset + symbol_bytes.len() as u32 + 4 + strings.len() as u32;

        let mut bytes = Vec::new();
        for v in [symbol_count, symbol_offset, lines.len() as u32, line_offset, 0, 0, 0, 0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(&symbol_bytes);
        bytes.extend_from_slice(&(4 + strings.len() as u32).to_le_bytes());
        bytes.extend_from_slice(strings);
        for (address, line) in lines {
            bytes.extend_from_slice(&address.to_le_bytes());
            bytes.extend_from_slice(&line.to_le_bytes());
        }
        bytes
    }

    /// A file `main.c` with a 0x100-byte text section holding `main` and `helper`, plus a data
    /// symbol with a long name.
    pub(crate) fn sample_coff() -> Vec<u8> {
        let mut file_aux = b"main.c".to_vec();
        file_aux.resize(CoffSymbol::SIZE, 0);
        let mut long_name = vec![0u8; 4];
        long_name.extend_from_slice(&4u32.to_le_bytes());

        let symbols = vec![
            coff_symbol(b".file", 0, -2, 0, 103, 1),
            file_aux,
            coff_symbol(b".text", 0, 1, 0, 3, 1),
            section_aux(0x100, 4),
            coff_symbol(b"_main", 0x10, 1, 0x20, 2, 0),
            coff_symbol(b"_helper", 0x80, 1, 0, 3, 0),
            coff_symbol(b"", 0x4, 2, 0, 2, 0),
            coff_symbol(b"_orphan", 0x900, 1, 0x20, 2, 0),
        ];
        let mut symbols = symbols;
        let long_index = symbols.len() - 2;
        symbols[long_index][0..8].copy_from_slice(&long_name);

        build_coff(
            &symbols,
            8,
            b"_global_counter\0",
            &[(4, 0), (0x1010, 12), (0x1018, 13), (0x1080, 40)],
        )
    }

    pub(crate) fn coff_sections() -> Vec<SectionHeader> {
        vec![
            SectionHeader { name: *b".text\0\0\0", virtual_address: 0x1000, virtual_size: 0x1000, ..Default::default() },
            SectionHeader { name: *b".data\0\0\0", virtual_address: 0x2000, virtual_size: 0x1000, ..Default::default() },
        ]
    }

    #[test]
    fn test_coff_symbols_and_lines() {
        let module = DebugModule::new("coff.exe".to_owned(), 0x40_0000, 0, coff_sections(), SearchPathConfig::default());
        let mut sink = SymbolTable::new();
        assert_eq!(process_coff(&module, &sample_coff(), &mut sink), LoadStatus::Loaded);

        let main = sink.find_by_name("main").expect("main missing");
        assert_eq!(main.address, 0x40_1010);
        assert_eq!(main.kind, SymbolKind::Function);
        assert_eq!(main.source_file.as_deref(), Some("main.c"));
        let main_lines: Vec<(u32, u32)> = main.lines.iter().map(|l| (l.line, l.offset)).collect();
        assert_eq!(main_lines, vec![(12, 0), (13, 8)]);

        let helper = sink.find_by_name("helper").expect("helper missing");
        assert_eq!(helper.address, 0x40_1080);
        assert_eq!(helper.lines.len(), 1);
        assert_eq!(helper.lines[0].line, 40);

        let counter = sink.find_by_name("global_counter").expect("counter missing");
        assert_eq!(counter.kind, SymbolKind::Data);
        assert_eq!(counter.address, 0x40_2004);
        assert!(counter.source_file.is_none());

        let orphan = sink.find_by_name("orphan").expect("orphan missing");
        assert!(orphan.source_file.is_none());
        assert!(orphan.lines.is_empty());
    }

    #[test]
    fn test_load_base_near_top_wraps() {
        let module = DebugModule::new("coff.exe".to_owned(), 0xFFFF_FFFF_FFFF_F000, 0, coff_sections(), SearchPathConfig::default());
        let mut sink = SymbolTable::new();
        assert_eq!(process_coff(&module, &sample_coff(), &mut sink), LoadStatus::Loaded);

        let main = sink.find_by_name("main").expect("main missing");
        assert_eq!(main.address, 0x10);
        let main_lines: Vec<(u32, u32)> = main.lines.iter().map(|l| (l.line, l.offset)).collect();
        assert_eq!(main_lines, vec![(12, 0), (13, 8)]);
        assert_eq!(sink.find_by_name("global_counter").map(|s| s.address), Some(0x1004));
    }

    #[test]
    fn test_symbols_without_file_and_bad_sections() {
        let symbols = vec![
            coff_symbol(b"_early", 0x20, 1, 0, 3, 0),
            coff_symbol(b"_lost", 0x20, 7, 0x20, 2, 0),
        ];
        let coff = build_coff(&symbols, 2, b"", &[]);
        let module = DebugModule::new("coff.exe".to_owned(), 0, 0, coff_sections(), SearchPathConfig::default());
        let mut sink = SymbolTable::new();
        assert_eq!(process_coff(&module, &coff, &mut sink), LoadStatus::Loaded);

        assert_eq!(sink.find_by_name("early").and_then(|s| s.source_file.as_deref()), Some("<none>"));
        assert!(sink.find_by_name("lost").is_none());
    }

    #[test]
    fn test_truncated_symbol_table() {
        let mut coff = sample_coff();
        coff[0..4].copy_from_slice(&1000u32.to_le_bytes());
        let module = DebugModule::new("coff.exe".to_owned(), 0, 0, coff_sections(), SearchPathConfig::default());
        let mut sink = SymbolTable::new();
        assert_eq!(process_coff(&module, &coff, &mut sink), LoadStatus::Error);
    }
}
