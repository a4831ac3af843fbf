//! Where decoded symbols, types and line numbers end up.
//!
//! The loaders only ever talk to a [`SymbolSink`]; [`SymbolTable`] is a sink that keeps everything
//! in memory and answers the lookups a debugger needs.


use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::codeview::types::{TypeIndex, TypeRecord};


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct SymbolId(pub usize);

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum SymbolKind {
    Function,
    Data,
    Thunk,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub enum LocalKind {
    Local,
    Parameter,
}

/// A source line; `offset` is relative to the start of the owning function.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct LineTableEntry {
    pub line: u32,
    pub offset: u32,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct LocalVariable {
    pub name: String,
    pub kind: LocalKind,
    pub frame_offset: i32,
    pub type_index: Option<TypeIndex>,
    pub type_record: Option<TypeRecord>,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct SymbolRecord {
    pub name: String,
    pub kind: SymbolKind,
    pub address: u64,
    pub size: Option<u32>,
    pub type_index: Option<TypeIndex>,
    pub type_record: Option<TypeRecord>,
    pub source_file: Option<String>,
    pub lines: Vec<LineTableEntry>,
    pub locals: Vec<LocalVariable>,
    pub debug_start: Option<u32>,
    pub debug_end: Option<u32>,
}
impl SymbolRecord {
    pub fn new(name: String, kind: SymbolKind, address: u64) -> Self {
        Self {
            name,
            kind,
            address,
            size: None,
            type_index: None,
            type_record: None,
            source_file: None,
            lines: Vec::new(),
            locals: Vec::new(),
            debug_start: None,
            debug_end: None,
        }
    }

    pub fn contains(&self, address: u64) -> bool {
        match self.size {
            Some(size) => address >= self.address && address - self.address < u64::from(size),
            None => address == self.address,
        }
    }
}


/// The debugger's symbol database, as seen from the loaders.
pub trait SymbolSink {
    fn add_type(&mut self, index: TypeIndex, record: &TypeRecord);
    fn add_symbol(&mut self, symbol: SymbolRecord) -> SymbolId;
    fn add_line_number(&mut self, symbol: SymbolId, entry: LineTableEntry);
    fn add_local(&mut self, symbol: SymbolId, local: LocalVariable);

    /// Called once no more lines or locals will be added to a function.
    fn finish_function(&mut self, symbol: SymbolId);
}


#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct SymbolTable {
    symbols: Vec<SymbolRecord>,
    types: BTreeMap<TypeIndex, TypeRecord>,
}
impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbols(&self) -> &[SymbolRecord] {
        &self.symbols
    }

    pub fn symbol(&self, id: SymbolId) -> Option<&SymbolRecord> {
        self.symbols.get(id.0)
    }

    pub fn types(&self) -> &BTreeMap<TypeIndex, TypeRecord> {
        &self.types
    }

    pub fn type_by_index(&self, index: TypeIndex) -> Option<&TypeRecord> {
        self.types.get(&index)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&SymbolRecord> {
        self.symbols.iter().find(|s| s.name == name)
    }

    /// Finds the symbol covering `address`, preferring the one starting closest below it.
    pub fn find_by_address(&self, address: u64) -> Option<&SymbolRecord> {
        self.symbols.iter()
            .filter(|s| s.contains(address))
            .max_by_key(|s| s.address)
    }

    /// Finds the function covering `address` and the source line the address belongs to.
    pub fn line_for_address(&self, address: u64) -> Option<(&SymbolRecord, u32)> {
        let symbol = self.symbols.iter()
            .filter(|s| s.kind == SymbolKind::Function && !s.lines.is_empty() && address >= s.address)
            .filter(|s| s.contains(address) || s.size.is_none())
            .max_by_key(|s| s.address)?;
        let offset = address - symbol.address;
        let entry = symbol.lines.iter()
            .take_while(|l| u64::from(l.offset) <= offset)
            .last()?;
        Some((symbol, entry.line))
    }
}
impl SymbolSink for SymbolTable {
    fn add_type(&mut self, index: TypeIndex, record: &TypeRecord) {
        self.types.insert(index, record.clone());
    }

    fn add_symbol(&mut self, symbol: SymbolRecord) -> SymbolId {
        self.symbols.push(symbol);
        SymbolId(self.symbols.len() - 1)
    }

    fn add_line_number(&mut self, symbol: SymbolId, entry: LineTableEntry) {
        if let Some(s) = self.symbols.get_mut(symbol.0) {
            s.lines.push(entry);
        }
    }

    fn add_local(&mut self, symbol: SymbolId, local: LocalVariable) {
        if let Some(s) = self.symbols.get_mut(symbol.0) {
            s.locals.push(local);
        }
    }

    fn finish_function(&mut self, symbol: SymbolId) {
        if let Some(s) = self.symbols.get_mut(symbol.0) {
            s.lines.sort_by_key(|l| l.offset);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::{LineTableEntry, SymbolKind, SymbolRecord, SymbolSink, SymbolTable};

    fn function(name: &str, address: u64, size: u32) -> SymbolRecord {
        let mut symbol = SymbolRecord::new(name.to_owned(), SymbolKind::Function, address);
        symbol.size = Some(size);
        symbol
    }

    #[test]
    fn test_lookup_by_name_and_address() {
        let mut table = SymbolTable::new();
        table.add_symbol(function("outer", 0x1000, 0x100));
        table.add_symbol(function("inner", 0x1040, 0x10));
        table.add_symbol(SymbolRecord::new("counter".to_owned(), SymbolKind::Data, 0x3000));

        assert_eq!(table.find_by_name("inner").map(|s| s.address), Some(0x1040));
        assert!(table.find_by_name("missing").is_none());
        assert_eq!(table.find_by_address(0x1045).map(|s| s.name.as_str()), Some("inner"));
        assert_eq!(table.find_by_address(0x1050).map(|s| s.name.as_str()), Some("outer"));
        assert_eq!(table.find_by_address(0x3000).map(|s| s.name.as_str()), Some("counter"));
        assert!(table.find_by_address(0x3001).is_none());
        assert!(table.find_by_address(0x1100).is_none());
    }

    #[test]
    fn test_lines_sorted_when_finished() {
        let mut table = SymbolTable::new();
        let id = table.add_symbol(function("main", 0x2000, 0x40));
        table.add_line_number(id, LineTableEntry { line: 12, offset: 0x20 });
        table.add_line_number(id, LineTableEntry { line: 10, offset: 0x00 });
        table.add_line_number(id, LineTableEntry { line: 11, offset: 0x08 });
        table.finish_function(id);

        let offsets: Vec<u32> = table.symbol(id).unwrap().lines.iter().map(|l| l.offset).collect();
        assert_eq!(offsets, vec![0x00, 0x08, 0x20]);

        assert_eq!(table.line_for_address(0x2000).map(|(_, l)| l), Some(10));
        assert_eq!(table.line_for_address(0x2010).map(|(_, l)| l), Some(11));
        assert_eq!(table.line_for_address(0x203F).map(|(_, l)| l), Some(12));
        assert_eq!(table.line_for_address(0x2040), None);
    }
}
