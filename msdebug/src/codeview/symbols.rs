//! CodeView symbol records.


use from_to_repr::from_to_other;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::codeview::lines::LineTable;
use crate::codeview::types::{TypeIndex, TypeRegistry};
use crate::cursor::{slice_at, ByteCursor};
use crate::error::DecodeError;
use crate::image::SectionHeader;
use crate::omap::OmapTable;
use crate::sink::{LineTableEntry, LocalKind, LocalVariable, SymbolId, SymbolKind, SymbolRecord, SymbolSink};


#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[from_to_other(base_type = u16, derive_compare = "as_int")]
pub enum SymbolEntryType {
    Compile = 0x0001,
    Register = 0x0002,
    Constant = 0x0003,
    UserDefinedType = 0x0004,
    StartSearch = 0x0005,
    End = 0x0006,
    Skip = 0x0007,
    ObjectName = 0x0009,
    EndArguments = 0x000A,

    // 16-bit type indices
    FrameRelative = 0x0200,
    LocalData = 0x0201,
    GlobalData = 0x0202,
    Public = 0x0203,
    LocalProcedure = 0x0204,
    GlobalProcedure = 0x0205,
    Thunk = 0x0206,
    Block = 0x0207,
    With = 0x0208,
    Label = 0x0209,
    RegisterRelative = 0x020C,
    LocalThreadData = 0x020D,
    GlobalThreadData = 0x020E,

    ProcedureReference = 0x0400,
    DataReference = 0x0401,
    Align = 0x0402,
    LocalProcedureReference = 0x0403,

    // 32-bit type indices
    Register32 = 0x1001,
    Constant32 = 0x1002,
    UserDefinedType32 = 0x1003,
    FrameRelative32 = 0x1006,
    LocalData32 = 0x1007,
    GlobalData32 = 0x1008,
    Public32 = 0x1009,
    LocalProcedure32 = 0x100A,
    GlobalProcedure32 = 0x100B,
    VirtualFunctionTable32 = 0x100C,
    RegisterRelative32 = 0x100D,
    LocalThreadData32 = 0x100E,
    GlobalThreadData32 = 0x100F,

    Other(u16),
}


/// Where a symbol lives before it is turned into an address.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct SegmentedAddress {
    segment: u16,
    offset: u32,
}


/// Turns the symbol records of one module (or of a global symbol stream) into sink symbols.
pub struct SymbolBuilder<'a> {
    registry: &'a TypeRegistry,
    sections: &'a [SectionHeader],
    load_base: u64,
    omap: Option<&'a OmapTable>,
    sink: &'a mut dyn SymbolSink,
    current_function: Option<SymbolId>,
}
impl<'a> SymbolBuilder<'a> {
    pub fn new(
        registry: &'a TypeRegistry,
        sections: &'a [SectionHeader],
        load_base: u64,
        omap: Option<&'a OmapTable>,
        sink: &'a mut dyn SymbolSink,
    ) -> Self {
        Self {
            registry,
            sections,
            load_base,
            omap,
            sink,
            current_function: None,
        }
    }

    /// Decodes the records in `bytes[offset..end]`.
    ///
    /// `line_tables` are the source lines of the module the records belong to; procedures pick
    /// the table covering their start address.
    #[instrument(skip_all)]
    pub fn parse_symbol_stream(&mut self, bytes: &[u8], offset: usize, end: usize, line_tables: &[LineTable]) -> Result<(), DecodeError> {
        let result = self.parse_records(bytes, offset, end.min(bytes.len()), line_tables);
        self.finish_current_function();
        result
    }

    fn parse_records(&mut self, bytes: &[u8], offset: usize, end: usize, line_tables: &[LineTable]) -> Result<(), DecodeError> {
        let mut position = offset;
        while position < end {
            let mut header = ByteCursor::at(bytes, position)?;
            let length = usize::from(header.read_u16()?);
            let record = slice_at(bytes, position + 2, length)?;
            let mut next = position + 2 + length;

            if let Some(kind) = self.parse_record(record, line_tables)? {
                if kind == SymbolEntryType::ProcedureReference
                        || kind == SymbolEntryType::DataReference
                        || kind == SymbolEntryType::LocalProcedureReference {
                    // followed by a counted name that the length does not include
                    let name_length = usize::from(ByteCursor::at(bytes, next)?.read_u8()?);
                    next += (name_length + 1 + 3) & !3;
                }
            }

            position = next;
        }
        Ok(())
    }

    fn finish_current_function(&mut self) {
        if let Some(function) = self.current_function.take() {
            self.sink.finish_function(function);
        }
    }

    fn parse_record(&mut self, record: &[u8], line_tables: &[LineTable]) -> Result<Option<SymbolEntryType>, DecodeError> {
        if record.len() < 2 {
            // too short to even hold the kind
            return Ok(None);
        }
        let mut cursor = ByteCursor::new(record);
        let kind = SymbolEntryType::from_base_type(cursor.read_u16()?);

        match kind {
            SymbolEntryType::LocalData|SymbolEntryType::GlobalData|SymbolEntryType::Public => {
                let offset = cursor.read_u32()?;
                let segment = cursor.read_u16()?;
                let type_index = cursor.read_u16()?.into();
                let name = cursor.read_counted_string()?;
                self.add_symbol(name, SymbolKind::Data, type_index, SegmentedAddress { segment, offset }, 0, None);
            },
            SymbolEntryType::LocalData32|SymbolEntryType::GlobalData32|SymbolEntryType::Public32 => {
                let type_index = cursor.read_u32()?;
                let offset = cursor.read_u32()?;
                let segment = cursor.read_u16()?;
                let name = cursor.read_counted_string()?;
                self.add_symbol(name, SymbolKind::Data, type_index, SegmentedAddress { segment, offset }, 0, None);
            },
            SymbolEntryType::Thunk => {
                let _parent = cursor.read_u32()?;
                let _end = cursor.read_u32()?;
                let _next = cursor.read_u32()?;
                let offset = cursor.read_u32()?;
                let segment = cursor.read_u16()?;
                let thunk_length = cursor.read_u16()?;
                let _thunk_type = cursor.read_u8()?;
                let name = cursor.read_counted_string()?;
                self.add_symbol(name, SymbolKind::Thunk, 0, SegmentedAddress { segment, offset }, thunk_length.into(), None);
            },
            SymbolEntryType::LocalProcedure|SymbolEntryType::GlobalProcedure => {
                let _parent = cursor.read_u32()?;
                let _end = cursor.read_u32()?;
                let _next = cursor.read_u32()?;
                let procedure_length = cursor.read_u32()?;
                let debug_start = cursor.read_u32()?;
                let debug_end = cursor.read_u32()?;
                let offset = cursor.read_u32()?;
                let segment = cursor.read_u16()?;
                let type_index = cursor.read_u16()?.into();
                let _flags = cursor.read_u8()?;
                let name = cursor.read_counted_string()?;
                self.start_function(
                    name, type_index, SegmentedAddress { segment, offset },
                    procedure_length, debug_start, debug_end, line_tables,
                );
            },
            SymbolEntryType::LocalProcedure32|SymbolEntryType::GlobalProcedure32 => {
                let _parent = cursor.read_u32()?;
                let _end = cursor.read_u32()?;
                let _next = cursor.read_u32()?;
                let procedure_length = cursor.read_u32()?;
                let debug_start = cursor.read_u32()?;
                let debug_end = cursor.read_u32()?;
                let type_index = cursor.read_u32()?;
                let offset = cursor.read_u32()?;
                let segment = cursor.read_u16()?;
                let _flags = cursor.read_u8()?;
                let name = cursor.read_counted_string()?;
                self.start_function(
                    name, type_index, SegmentedAddress { segment, offset },
                    procedure_length, debug_start, debug_end, line_tables,
                );
            },
            SymbolEntryType::FrameRelative => {
                let frame_offset = cursor.read_i32()?;
                let type_index = cursor.read_u16()?.into();
                let name = cursor.read_counted_string()?;
                self.add_local(name, frame_offset, type_index);
            },
            SymbolEntryType::FrameRelative32 => {
                let frame_offset = cursor.read_i32()?;
                let type_index = cursor.read_u32()?;
                let name = cursor.read_counted_string()?;
                self.add_local(name, frame_offset, type_index);
            },
            SymbolEntryType::ProcedureReference|SymbolEntryType::DataReference|SymbolEntryType::LocalProcedureReference => {},
            other => {
                debug!("skipping symbol record of kind {:?}", other);
            },
        }
        Ok(Some(kind))
    }

    fn start_function(
        &mut self,
        name: Option<String>,
        type_index: TypeIndex,
        address: SegmentedAddress,
        length: u32,
        debug_start: u32,
        debug_end: u32,
        line_tables: &[LineTable],
    ) {
        self.finish_current_function();
        let line_table = line_tables.iter()
            .find(|t| t.covers(address.segment, address.offset));
        self.current_function = self.add_symbol(
            name,
            SymbolKind::Function,
            type_index,
            address,
            length,
            Some((line_table, debug_start, debug_end)),
        );
    }

    fn add_symbol(
        &mut self,
        name: Option<String>,
        kind: SymbolKind,
        type_index: TypeIndex,
        address: SegmentedAddress,
        size: u32,
        function_info: Option<(Option<&LineTable>, u32, u32)>,
    ) -> Option<SymbolId> {
        let Some(name) = name else {
            debug!("skipping nameless {:?} symbol at {:?}", kind, address);
            return None;
        };
        if address.segment == 0 || usize::from(address.segment) > self.sections.len() {
            debug!("skipping symbol {:?} in invalid segment {}", name, address.segment);
            return None;
        }
        let section = &self.sections[usize::from(address.segment) - 1];
        let link_rva = section.virtual_address.wrapping_add(address.offset);
        let rva = match self.omap {
            Some(omap) => match omap.translate(link_rva) {
                Some(rva) => rva,
                None => {
                    debug!("skipping symbol {:?} at discarded RVA {:#X}", name, link_rva);
                    return None;
                },
            },
            None => link_rva,
        };

        let mut symbol = SymbolRecord::new(name, kind, self.load_base.wrapping_add(u64::from(rva)));
        if size != 0 {
            symbol.size = Some(size);
        }
        if type_index != 0 {
            symbol.type_index = Some(type_index);
            symbol.type_record = self.registry.lookup(type_index).cloned();
        }

        let mut lines = Vec::new();
        if let Some((line_table, debug_start, debug_end)) = function_info {
            symbol.debug_start = Some(debug_start);
            symbol.debug_end = Some(debug_end);
            if let Some(line_table) = line_table {
                symbol.source_file = line_table.file_name.clone();
                lines = line_table.lines_in(address.offset, size)
                    .map(|(offset, line)| LineTableEntry {
                        line: line.into(),
                        offset: offset - address.offset,
                    })
                    .collect();
            }
        }

        debug!("{:?} {:?} at {:#X}", symbol.kind, symbol.name, symbol.address);
        let id = self.sink.add_symbol(symbol);
        for line in lines {
            self.sink.add_line_number(id, line);
        }
        Some(id)
    }

    fn add_local(&mut self, name: Option<String>, frame_offset: i32, type_index: TypeIndex) {
        let Some(function) = self.current_function else {
            debug!("ignoring frame-relative symbol {:?} outside of a function", name);
            return;
        };
        let Some(name) = name else {
            return;
        };
        let kind = if frame_offset > 0 { LocalKind::Parameter } else { LocalKind::Local };
        let (type_index, type_record) = if type_index == 0 {
            (None, None)
        } else {
            (Some(type_index), self.registry.lookup(type_index).cloned())
        };
        self.sink.add_local(function, LocalVariable {
            name,
            kind,
            frame_offset,
            type_index,
            type_record,
        });
    }
}
