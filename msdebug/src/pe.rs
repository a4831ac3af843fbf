//! Portable Executable images read straight from their file bytes.
//!
//! Only the parts needed to find debug information are decoded: the file header, the image base
//! and debug data directory from the optional header, and the section table.

use tracing::debug;

use crate::cursor::ByteCursor;
use crate::error::{DecodeError, Error};
use crate::image::{DebugDirectoryEntry, ImageCharacteristics, ImageSource, SectionHeader};


const SEGMENTED_HEADER_OFFSET_OFFSET: usize = 0x3C;
const DEBUG_DATA_DIRECTORY_INDEX: usize = 6;


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DataDirectoryEntry {
    pub address: u32,
    pub size: u32,
}


#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct PeImage<'a> {
    name: String,
    bytes: &'a [u8],
    load_base: u64,
    pub machine: u16,
    pub time_date_stamp: u32,
    pub symbol_table_pointer: u32, // COFF debug info, deprecated
    pub symbol_table_count: u32,
    pub characteristics: ImageCharacteristics,
    pub image_base: u64,
    pub data_directory_entries: Vec<DataDirectoryEntry>,
    sections: Vec<SectionHeader>,
    debug_directory: Vec<DebugDirectoryEntry>,
}
impl<'a> PeImage<'a> {
    /// Decodes the image headers; the image is assumed to be loaded at its preferred base.
    pub fn parse(name: &str, bytes: &'a [u8]) -> Result<Self, Error> {
        let mut cursor = ByteCursor::new(bytes);
        if cursor.read_bytes(2).map_err(|_| Error::BadImage { reason: "file too short for MZ header" })? != b"MZ" {
            return Err(Error::BadImage { reason: "MZ signature missing" });
        }

        cursor.seek(SEGMENTED_HEADER_OFFSET_OFFSET)?;
        let pe_header_offset: usize = cursor.read_u32()? as usize;
        cursor.seek(pe_header_offset)?;
        if cursor.read_bytes(4)? != b"PE\0\0" {
            return Err(Error::BadImage { reason: "PE signature missing" });
        }

        let header_buf = cursor.read_bytes(20)?;
        let machine = u16::from_le_bytes(header_buf[0..2].try_into().unwrap());
        let section_count = u16::from_le_bytes(header_buf[2..4].try_into().unwrap());
        let time_date_stamp = u32::from_le_bytes(header_buf[4..8].try_into().unwrap());
        let symbol_table_pointer = u32::from_le_bytes(header_buf[8..12].try_into().unwrap());
        let symbol_table_count = u32::from_le_bytes(header_buf[12..16].try_into().unwrap());
        let optional_header_size = u16::from_le_bytes(header_buf[16..18].try_into().unwrap());
        let characteristics = ImageCharacteristics::from_bits_retain(u16::from_le_bytes(header_buf[18..20].try_into().unwrap()));

        let optional_header_offset = cursor.position();
        let optional_header = cursor.sub_cursor(optional_header_size.into())?;
        let (image_base, data_directory_entries) = read_optional_header(optional_header)?;

        cursor.seek(optional_header_offset + usize::from(optional_header_size))?;
        let sections = SectionHeader::read_table(&mut cursor, section_count.into())?;

        let mut image = Self {
            name: name.to_owned(),
            bytes,
            load_base: image_base,
            machine,
            time_date_stamp,
            symbol_table_pointer,
            symbol_table_count,
            characteristics,
            image_base,
            data_directory_entries,
            sections,
            debug_directory: Vec::new(),
        };
        image.debug_directory = image.read_debug_directory()?;
        Ok(image)
    }

    /// Pretends the image has been loaded at a different address.
    pub fn with_load_base(mut self, load_base: u64) -> Self {
        self.load_base = load_base;
        self
    }

    pub fn virtual_to_raw(&self, virtual_addr: u32) -> Option<u32> {
        for entry in &self.sections {
            let size = entry.virtual_size.max(entry.raw_data_size);
            if virtual_addr >= entry.virtual_address && virtual_addr - entry.virtual_address < size {
                let offset = virtual_addr - entry.virtual_address;
                if offset >= entry.raw_data_size {
                    // that won't fit
                    return None;
                }
                return entry.raw_data_pointer.checked_add(offset);
            }
        }
        None
    }

    fn read_debug_directory(&self) -> Result<Vec<DebugDirectoryEntry>, DecodeError> {
        let Some(entry) = self.data_directory_entries.get(DEBUG_DATA_DIRECTORY_INDEX) else {
            return Ok(Vec::new());
        };
        if entry.address == 0 || entry.size == 0 {
            return Ok(Vec::new());
        }
        let Some(raw_offset) = self.virtual_to_raw(entry.address) else {
            debug!("debug directory RVA {:#010X} does not map to file contents", entry.address);
            return Ok(Vec::new());
        };
        DebugDirectoryEntry::read_directory(self.bytes, raw_offset as usize, entry.size as usize)
    }
}
impl<'a> ImageSource for PeImage<'a> {
    fn name(&self) -> &str { &self.name }
    fn load_base(&self) -> u64 { self.load_base }
    fn timestamp(&self) -> u32 { self.time_date_stamp }
    fn characteristics(&self) -> ImageCharacteristics { self.characteristics }
    fn section_headers(&self) -> &[SectionHeader] { &self.sections }
    fn debug_directory(&self) -> &[DebugDirectoryEntry] { &self.debug_directory }
    fn file_bytes(&self) -> &[u8] { self.bytes }
}

fn read_optional_header(mut cursor: ByteCursor) -> Result<(u64, Vec<DataDirectoryEntry>), Error> {
    if cursor.len() < 2 {
        // not enough for even the magic value
        return Ok((0, Vec::new()));
    }

    // PE32 has a 96-byte Windows header with 32-bit sizes, PE32+ a 112-byte one with 64-bit sizes
    let magic = cursor.read_u16()?;
    let (is_64, windows_header_size) = match magic {
        0x010B => (false, 96),
        0x020B => (true, 112),
        _ => return Err(Error::BadImage { reason: "unknown optional header magic" }),
    };
    if cursor.len() < windows_header_size {
        return Ok((0, Vec::new()));
    }

    let image_base = if is_64 {
        cursor.seek(24)?;
        cursor.read_u64()?
    } else {
        cursor.seek(28)?;
        cursor.read_u32()?.into()
    };

    cursor.seek(windows_header_size - 4)?;
    let data_directory_entry_count = cursor.read_u32()? as usize;
    let available_entries = cursor.remaining() / 8;
    let mut data_directory_entries = Vec::with_capacity(data_directory_entry_count.min(available_entries));
    for _ in 0..data_directory_entry_count.min(available_entries) {
        let address = cursor.read_u32()?;
        let size = cursor.read_u32()?;
        data_directory_entries.push(DataDirectoryEntry {
            address,
            size,
        });
    }
    Ok((image_base, data_directory_entries))
}
