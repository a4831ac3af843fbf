//! Structures describing a loaded executable image, as far as the debug information loaders need
//! them.


use bitflags::bitflags;
use from_to_repr::from_to_other;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::cursor::{slice_at, ByteCursor};
use crate::error::DecodeError;


/// Access to a loaded module's image, provided by whoever maps executables into memory.
pub trait ImageSource {
    /// The file name of the module.
    fn name(&self) -> &str;

    /// The address at which the module has been loaded.
    fn load_base(&self) -> u64;

    /// The link timestamp from the file header.
    fn timestamp(&self) -> u32;

    fn characteristics(&self) -> ImageCharacteristics;

    fn section_headers(&self) -> &[SectionHeader];

    /// The entries of the image's debug directory, if it has one.
    fn debug_directory(&self) -> &[DebugDirectoryEntry];

    /// The raw bytes of the image file; debug directory entries point into these.
    fn file_bytes(&self) -> &[u8];
}


bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    #[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
    pub struct ImageCharacteristics : u16 {
        const RELOCS_STRIPPED = 0x0001;
        const EXECUTABLE_IMAGE = 0x0002;

        /// COFF line numbers have been stripped.
        const LINE_NUMS_STRIPPED = 0x0004;

        /// COFF local symbols have been stripped.
        const LOCAL_SYMS_STRIPPED = 0x0008;

        const IS_32BIT_MACHINE = 0x0100;

        /// Debugging information has been moved into a separate .DBG file.
        const DEBUG_STRIPPED = 0x0200;

        const DLL = 0x2000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
    #[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
    pub struct SectionCharacteristics : u32 {
        const CONTAINS_CODE = 0x0000_0020;
        const CONTAINS_INITIALIZED_DATA = 0x0000_0040;
        const CONTAINS_UNINITIALIZED_DATA = 0x0000_0080;
        const MEM_DISCARDABLE = 0x0200_0000;
        const MEM_EXECUTE = 0x2000_0000;
        const MEM_READ = 0x4000_0000;
        const MEM_WRITE = 0x8000_0000;
    }
}


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub raw_data_size: u32,
    pub raw_data_pointer: u32,
    pub relocations_pointer: u32,
    pub line_numbers_pointer: u32,
    pub relocations_count: u16,
    pub line_numbers_count: u16,
    pub characteristics: SectionCharacteristics, // u32
}
impl SectionHeader {
    pub const SIZE: usize = 40;

    pub fn read(cursor: &mut ByteCursor) -> Result<Self, DecodeError> {
        let entry_buf = cursor.read_bytes(Self::SIZE)?;

        let name = entry_buf[0..8].try_into().unwrap();
        let virtual_size = u32::from_le_bytes(entry_buf[8..12].try_into().unwrap());
        let virtual_address = u32::from_le_bytes(entry_buf[12..16].try_into().unwrap());
        let raw_data_size = u32::from_le_bytes(entry_buf[16..20].try_into().unwrap());
        let raw_data_pointer = u32::from_le_bytes(entry_buf[20..24].try_into().unwrap());
        let relocations_pointer = u32::from_le_bytes(entry_buf[24..28].try_into().unwrap());
        let line_numbers_pointer = u32::from_le_bytes(entry_buf[28..32].try_into().unwrap());
        let relocations_count = u16::from_le_bytes(entry_buf[32..34].try_into().unwrap());
        let line_numbers_count = u16::from_le_bytes(entry_buf[34..36].try_into().unwrap());
        let characteristics = SectionCharacteristics::from_bits_retain(u32::from_le_bytes(entry_buf[36..40].try_into().unwrap()));

        Ok(Self {
            name,
            virtual_size,
            virtual_address,
            raw_data_size,
            raw_data_pointer,
            relocations_pointer,
            line_numbers_pointer,
            relocations_count,
            line_numbers_count,
            characteristics,
        })
    }

    pub fn read_table(cursor: &mut ByteCursor, count: usize) -> Result<Vec<Self>, DecodeError> {
        let mut sections = Vec::with_capacity(count.min(cursor.remaining() / Self::SIZE));
        for _ in 0..count {
            sections.push(Self::read(cursor)?);
        }
        Ok(sections)
    }

    pub fn name_str(&self) -> String {
        let end = self.name.iter().position(|b| *b == 0x00).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}


#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[from_to_other(base_type = u32, derive_compare = "as_int")]
pub enum DebugType {
    Unknown = 0,
    Coff = 1,
    CodeView = 2,
    FramePointerOmission = 3,
    Misc = 4,
    Exception = 5,
    Fixup = 6,
    OmapToSource = 7,
    OmapFromSource = 8,
    Borland = 9,
    Clsid = 11,
    Other(u32),
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct DebugDirectoryEntry {
    pub characteristics: u32,
    pub time_date_stamp: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub kind: DebugType,
    pub size: u32,
    pub virtual_address: u32, // generally 0 in .DBG files
    pub raw_data_pointer: u32,
}
impl DebugDirectoryEntry {
    pub const SIZE: usize = 28;

    pub fn read(cursor: &mut ByteCursor) -> Result<Self, DecodeError> {
        let buf = cursor.read_bytes(Self::SIZE)?;

        let characteristics = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let time_date_stamp = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        let major_version = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let minor_version = u16::from_le_bytes(buf[10..12].try_into().unwrap());
        let kind_u32 = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let kind = DebugType::from_base_type(kind_u32);
        let size = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let virtual_address = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        let raw_data_pointer = u32::from_le_bytes(buf[24..28].try_into().unwrap());

        Ok(Self {
            characteristics,
            time_date_stamp,
            major_version,
            minor_version,
            kind,
            size,
            virtual_address,
            raw_data_pointer,
        })
    }

    /// Reads `size_bytes / 28` consecutive entries.
    pub fn read_directory(bytes: &[u8], offset: usize, size_bytes: usize) -> Result<Vec<Self>, DecodeError> {
        let directory_bytes = slice_at(bytes, offset, size_bytes)?;
        let mut cursor = ByteCursor::new(directory_bytes);
        let count = size_bytes / Self::SIZE;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(Self::read(&mut cursor)?);
        }
        Ok(entries)
    }

    /// The bytes this entry describes within the file.
    pub fn data<'a>(&self, file_bytes: &'a [u8]) -> Result<&'a [u8], DecodeError> {
        slice_at(file_bytes, self.raw_data_pointer as usize, self.size as usize)
    }
}


/// The contents of a [`DebugType::Misc`] entry.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct MiscDebugInfo {
    pub data_type: u32,
    pub length: u32,
    pub unicode: bool,
    pub data: String,
}
impl MiscDebugInfo {
    /// `data` holds the name of the executable, which is also the stem of its .DBG file.
    pub const DATA_TYPE_EXE_NAME: u32 = 1;

    pub fn read(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = ByteCursor::new(bytes);
        let data_type = cursor.read_u32()?;
        let length = cursor.read_u32()?;
        let unicode = cursor.read_u8()? != 0;
        cursor.skip(3)?;

        let data_length = (length as usize).saturating_sub(12).min(cursor.remaining());
        let data_bytes = cursor.read_bytes(data_length)?;
        let data = if unicode {
            let words: Vec<u16> = data_bytes
                .chunks_exact(2)
                .map(|w| u16::from_le_bytes([w[0], w[1]]))
                .take_while(|w| *w != 0)
                .collect();
            String::from_utf16_lossy(&words)
        } else {
            let end = data_bytes.iter().position(|b| *b == 0x00).unwrap_or(data_bytes.len());
            String::from_utf8_lossy(&data_bytes[..end]).into_owned()
        };

        Ok(Self {
            data_type,
            length,
            unicode,
            data,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::{DebugDirectoryEntry, DebugType, MiscDebugInfo, SectionHeader};
    use crate::cursor::ByteCursor;

    #[test]
    fn test_section_header() {
        let mut data = Vec::new();
        data.extend_from_slice(b".text\0\0\0");
        data.extend_from_slice(&0x1234u32.to_le_bytes());
        data.extend_from_slice(&0x1000u32.to_le_bytes());
        data.extend_from_slice(&0x1400u32.to_le_bytes());
        data.extend_from_slice(&0x0400u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 12]);
        data.extend_from_slice(&0x6000_0020u32.to_le_bytes());

        let section = SectionHeader::read(&mut ByteCursor::new(&data))
            .expect("failed to read section header");
        assert_eq!(section.name_str(), ".text");
        assert_eq!(section.virtual_size, 0x1234);
        assert_eq!(section.virtual_address, 0x1000);
        assert_eq!(section.raw_data_pointer, 0x0400);

        assert!(SectionHeader::read(&mut ByteCursor::new(&data[..39])).is_err());
    }

    #[test]
    fn test_debug_directory() {
        let mut data = vec![0xAAu8; 4];
        for (kind, pointer) in [(2u32, 0x200u32), (8, 0x300)] {
            data.extend_from_slice(&[0u8; 12]);
            data.extend_from_slice(&kind.to_le_bytes());
            data.extend_from_slice(&0x40u32.to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
            data.extend_from_slice(&pointer.to_le_bytes());
        }

        let entries = DebugDirectoryEntry::read_directory(&data, 4, 56)
            .expect("failed to read debug directory");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, DebugType::CodeView);
        assert_eq!(entries[1].kind, DebugType::OmapFromSource);
        assert_eq!(entries[1].raw_data_pointer, 0x300);

        // the data lies outside our tiny buffer
        assert!(entries[0].data(&data).is_err());
    }

    #[test]
    fn test_misc_exe_name() {
        let mut data = Vec::new();
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&24u32.to_le_bytes());
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(b"foo.exe\0\0\0\0\0");

        let misc = MiscDebugInfo::read(&data).expect("failed to read misc info");
        assert_eq!(misc.data_type, MiscDebugInfo::DATA_TYPE_EXE_NAME);
        assert!(!misc.unicode);
        assert_eq!(misc.data, "foo.exe");
    }
}
