//! Separate debugging symbol files (.DBG) from the Windows NT 4 days.


use crate::cursor::ByteCursor;
use crate::error::DecodeError;
use crate::image::{DebugDirectoryEntry, SectionHeader};


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DbgFile {
    pub header: Header,
    pub section_table: Vec<SectionHeader>, // yup, same structure as PE
    pub exported_names: Vec<String>,
    pub debug_directories: Vec<DebugDirectoryEntry>, // [DebugDirectoryEntry; header.debug_directories_size / 28]
}
impl DbgFile {
    pub fn read(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = ByteCursor::new(bytes);
        let header = Header::read(&mut cursor)?;

        let section_table = SectionHeader::read_table(&mut cursor, header.section_count as usize)?;

        let mut exported_names_buf = cursor.read_bytes(header.exported_names_table_size as usize)?;
        while let Some(b) = exported_names_buf.last() {
            if *b != 0 {
                break;
            }
            exported_names_buf = &exported_names_buf[..exported_names_buf.len() - 1];
        }
        let exported_names: Vec<String> = if exported_names_buf.is_empty() {
            Vec::new()
        } else {
            exported_names_buf
                .split(|b| *b == 0x00)
                .map(|bs| String::from_utf8_lossy(bs).into_owned())
                .collect()
        };

        let debug_directories = DebugDirectoryEntry::read_directory(
            bytes,
            cursor.position(),
            header.debug_directories_size as usize,
        )?;

        Ok(Self {
            header,
            section_table,
            exported_names,
            debug_directories,
        })
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Header {
    pub signature: u16, // 0x4944
    pub flags: u16,
    pub machine: u16,
    pub characteristics: u16,
    pub time_date_stamp: u32,
    pub image_checksum: u32,
    pub image_base: u32,
    pub image_size: u32,
    pub section_count: u32,
    pub exported_names_table_size: u32,
    pub debug_directories_size: u32,
    pub section_alignment: u32,
    pub reserved: [u32; 2],
}
impl Header {
    pub const SIGNATURE: u16 = 0x4944; // b"DI"

    pub fn read(cursor: &mut ByteCursor) -> Result<Self, DecodeError> {
        let header_buf = cursor.read_bytes(48)?;

        let signature = u16::from_le_bytes(header_buf[0..2].try_into().unwrap());
        let flags = u16::from_le_bytes(header_buf[2..4].try_into().unwrap());
        let machine = u16::from_le_bytes(header_buf[4..6].try_into().unwrap());
        let characteristics = u16::from_le_bytes(header_buf[6..8].try_into().unwrap());
        let time_date_stamp = u32::from_le_bytes(header_buf[8..12].try_into().unwrap());
        let image_checksum = u32::from_le_bytes(header_buf[12..16].try_into().unwrap());
        let image_base = u32::from_le_bytes(header_buf[16..20].try_into().unwrap());
        let image_size = u32::from_le_bytes(header_buf[20..24].try_into().unwrap());
        let section_count = u32::from_le_bytes(header_buf[24..28].try_into().unwrap());
        let exported_names_table_size = u32::from_le_bytes(header_buf[28..32].try_into().unwrap());
        let debug_directories_size = u32::from_le_bytes(header_buf[32..36].try_into().unwrap());
        let section_alignment = u32::from_le_bytes(header_buf[36..40].try_into().unwrap());
        let reserved = [
            u32::from_le_bytes(header_buf[40..44].try_into().unwrap()),
            u32::from_le_bytes(header_buf[44..48].try_into().unwrap()),
        ];

        Ok(Self {
            signature,
            flags,
            machine,
            characteristics,
            time_date_stamp,
            image_checksum,
            image_base,
            image_size,
            section_count,
            exported_names_table_size,
            debug_directories_size,
            section_alignment,
            reserved,
        })
    }
}


#[cfg(test)]
pub(crate) mod tests {
    use super::{DbgFile, Header};
    use crate::image::DebugType;

    /// Assembles a .DBG file with no sections whose debug directory holds the given entries, with
    /// their data appended after the directory.
    pub(crate) fn build_dbg(timestamp: u32, exported_names: &[u8], debug_entries: &[(u32, Vec<u8>)]) -> Vec<u8> {
        let mut dbg = Vec::new();
        dbg.extend_from_slice(&Header::SIGNATURE.to_le_bytes());
        dbg.extend_from_slice(&[0u8; 6]);
        dbg.extend_from_slice(&timestamp.to_le_bytes());
        dbg.extend_from_slice(&[0u8; 12]);
        dbg.extend_from_slice(&0u32.to_le_bytes()); // sections
        dbg.extend_from_slice(&(exported_names.len() as u32).to_le_bytes());
        dbg.extend_from_slice(&((debug_entries.len() * 28) as u32).to_le_bytes());
        dbg.extend_from_slice(&[0u8; 12]);
        dbg.extend_from_slice(exported_names);

        let directory_offset = dbg.len();
        dbg.resize(directory_offset + debug_entries.len() * 28, 0);
        for (i, (kind, data)) in debug_entries.iter().enumerate() {
            let data_offset = dbg.len() as u32;
            dbg.extend_from_slice(data);
            let entry = directory_offset + i * 28;
            dbg[entry+12..entry+16].copy_from_slice(&kind.to_le_bytes());
            dbg[entry+16..entry+20].copy_from_slice(&(data.len() as u32).to_le_bytes());
            dbg[entry+24..entry+28].copy_from_slice(&data_offset.to_le_bytes());
        }
        dbg
    }

    #[test]
    fn test_read_dbg_file() {
        let bytes = build_dbg(0xCAFE, b"Foo\0Bar\0\0\0", &[(8, vec![0u8; 16]), (2, b"NB09".to_vec())]);
        let dbg = DbgFile::read(&bytes).expect("failed to read DBG file");

        assert_eq!(dbg.header.signature, Header::SIGNATURE);
        assert_eq!(dbg.header.time_date_stamp, 0xCAFE);
        assert_eq!(dbg.exported_names, vec!["Foo".to_owned(), "Bar".to_owned()]);
        assert_eq!(dbg.debug_directories.len(), 2);
        assert_eq!(dbg.debug_directories[0].kind, DebugType::OmapFromSource);
        assert_eq!(dbg.debug_directories[1].data(&bytes).unwrap(), b"NB09");
    }

    #[test]
    fn test_truncated_dbg_file() {
        let bytes = build_dbg(1, b"", &[(2, b"NB09".to_vec())]);
        assert!(DbgFile::read(&bytes[..60]).is_err());
    }
}
