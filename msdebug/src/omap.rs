//! Address remapping for images rearranged after linking.
//!
//! An OMAP table is a sequence of `(from, to)` pairs sorted by `from`. Entry `i` covers the
//! link-time addresses `[from[i], from[i+1])`; the last entry only terminates its predecessor.


#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use tracing::debug;


#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct OmapEntry {
    pub from: u32,
    pub to: u32,
}


#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
pub struct OmapTable {
    entries: Vec<OmapEntry>,
}
impl OmapTable {
    pub const ENTRY_SIZE: usize = 8;

    /// Decodes the raw contents of an OMAP-from-source debug directory entry.
    ///
    /// A trailing partial entry is ignored.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut entries: Vec<OmapEntry> = bytes
            .chunks_exact(Self::ENTRY_SIZE)
            .map(|chunk| OmapEntry {
                from: u32::from_le_bytes(chunk[0..4].try_into().unwrap()),
                to: u32::from_le_bytes(chunk[4..8].try_into().unwrap()),
            })
            .collect();
        if !entries.is_sorted_by_key(|e| e.from) {
            debug!("OMAP table is not sorted; sorting {} entries", entries.len());
            entries.sort_by_key(|e| e.from);
        }
        Self {
            entries,
        }
    }

    pub fn entries(&self) -> &[OmapEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Translates a link-time RVA into its final RVA.
    ///
    /// Returns `None` if the address lies outside the table or in a range the optimizer
    /// discarded. An empty table translates every address to itself.
    pub fn translate(&self, link_address: u32) -> Option<u32> {
        if self.entries.is_empty() {
            return Some(link_address);
        }

        // number of entries starting at or before the address
        let following = self.entries.partition_point(|e| e.from <= link_address);
        if following == 0 || following == self.entries.len() {
            return None;
        }
        let entry = self.entries[following - 1];
        if entry.to == 0 {
            return None;
        }
        entry.to.checked_add(link_address - entry.from)
    }
}
impl From<Vec<OmapEntry>> for OmapTable {
    fn from(mut value: Vec<OmapEntry>) -> Self {
        value.sort_by_key(|e| e.from);
        Self {
            entries: value,
        }
    }
}
