//! Line numbers from a source-module subsection.


#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::cursor::ByteCursor;
use crate::error::DecodeError;


/// The lines of one source file within one segment.
///
/// `offsets[i]` (relative to the segment) belongs to source line `lines[i]`.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct LineTable {
    pub segment: u16,
    pub start: u32,
    pub end: u32,
    pub file_name: Option<String>,
    pub offsets: Vec<u32>,
    pub lines: Vec<u16>,
}
impl LineTable {
    /// Whether `offset` within `segment` falls into the range this table describes.
    pub fn covers(&self, segment: u16, offset: u32) -> bool {
        self.segment == segment && offset >= self.start && offset < self.end
    }

    /// The line entries falling into `[start, start + length)`.
    pub fn lines_in(&self, start: u32, length: u32) -> impl Iterator<Item = (u32, u16)> + '_ {
        let end = start.saturating_add(length);
        self.offsets.iter()
            .zip(self.lines.iter())
            .filter(move |(offset, _)| **offset >= start && **offset < end)
            .map(|(offset, line)| (*offset, *line))
    }
}


/// Decodes a source-module subsection into one line table per (file, segment) pair.
#[instrument(skip_all)]
pub fn parse_line_tables(bytes: &[u8]) -> Result<Vec<LineTable>, DecodeError> {
    let mut cursor = ByteCursor::new(bytes);
    let file_count = cursor.read_u16()?;
    let segment_count = cursor.read_u16()?;
    debug!("line subsection with {} files in {} segments", file_count, segment_count);

    let mut file_offsets = Vec::with_capacity(file_count.into());
    for _ in 0..file_count {
        file_offsets.push(cursor.read_u32()?);
    }

    let mut tables = Vec::new();
    for file_offset in file_offsets {
        let mut file_cursor = ByteCursor::at(bytes, file_offset as usize)?;
        let file_segment_count = file_cursor.read_u16()?;
        let _padding = file_cursor.read_u16()?;

        let mut block_offsets = Vec::with_capacity(file_segment_count.into());
        for _ in 0..file_segment_count {
            block_offsets.push(file_cursor.read_u32()?);
        }
        let mut ranges = Vec::with_capacity(file_segment_count.into());
        for _ in 0..file_segment_count {
            let start = file_cursor.read_u32()?;
            let end = file_cursor.read_u32()?;
            ranges.push((start, end));
        }
        let file_name = file_cursor.read_counted_string()?;

        for (block_offset, (start, end)) in block_offsets.into_iter().zip(ranges.into_iter()) {
            let mut block_cursor = ByteCursor::at(bytes, block_offset as usize)?;
            let segment = block_cursor.read_u16()?;
            let line_count = block_cursor.read_u16()?;

            let mut offsets = Vec::with_capacity(line_count.into());
            for _ in 0..line_count {
                offsets.push(block_cursor.read_u32()?);
            }
            let mut lines = Vec::with_capacity(line_count.into());
            for _ in 0..line_count {
                lines.push(block_cursor.read_u16()?);
            }

            debug!(
                "{:?}: {} lines in segment {} [{:#X}, {:#X})",
                file_name, line_count, segment, start, end,
            );
            tables.push(LineTable {
                segment,
                start,
                end,
                file_name: file_name.clone(),
                offsets,
                lines,
            });
        }
    }

    Ok(tables)
}
