use std::fmt::{Debug, Formatter};
use std::io::Write;

use varint_rs::{VarintReader, VarintWriter};

use crate::{MosaicError, MosaicResult, TileId};

/// A `PMTiles` directory: entries sorted by tile id.
#[derive(Default, Clone)]
pub struct Directory {
    entries: Vec<DirEntry>,
}

impl Debug for Directory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Directory [entries: {}]", self.entries.len()))
    }
}

impl Directory {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    pub(crate) fn from_entries(entries: Vec<DirEntry>) -> Self {
        Self { entries }
    }

    pub(crate) fn push(&mut self, entry: DirEntry) {
        self.entries.push(entry);
    }

    /// Entries in tile id order.
    #[must_use]
    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// No entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the entry covering `tile_id`, either directly, through its run length,
    /// or as the leaf directory that may contain it.
    #[must_use]
    pub fn find_tile_id(&self, tile_id: TileId) -> Option<&DirEntry> {
        let tile_id = tile_id.value();
        match self.entries.binary_search_by(|e| e.tile_id.cmp(&tile_id)) {
            Ok(idx) => self.entries.get(idx),
            Err(next_id) => {
                // Adjust for 0-based indexing
                let previous_tile = self.entries.get(next_id.checked_sub(1)?)?;
                if previous_tile.is_leaf()
                    || tile_id - previous_tile.tile_id < u64::from(previous_tile.run_length)
                {
                    Some(previous_tile)
                } else {
                    None
                }
            }
        }
    }

    /// Serializes the directory in the varint layout of the `PMTiles` v3 format.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_usize_varint(self.entries.len())?;

        // Write tile IDs
        let mut last_tile_id = 0;
        for entry in &self.entries {
            writer.write_u64_varint(entry.tile_id - last_tile_id)?;
            last_tile_id = entry.tile_id;
        }

        // Write Run Lengths
        for entry in &self.entries {
            writer.write_u32_varint(entry.run_length)?;
        }

        // Write Lengths
        for entry in &self.entries {
            writer.write_u32_varint(entry.length)?;
        }

        // Write Offsets
        let mut last_entry: Option<&DirEntry> = None;
        for entry in &self.entries {
            let offset_to_write = match last_entry {
                Some(last) if entry.offset == last.offset + u64::from(last.length) => 0,
                _ => entry.offset + 1,
            };
            writer.write_u64_varint(offset_to_write)?;
            last_entry = Some(entry);
        }

        Ok(())
    }
}

impl TryFrom<&[u8]> for Directory {
    type Error = MosaicError;

    fn try_from(mut buffer: &[u8]) -> MosaicResult<Self> {
        let n_entries = buffer.read_usize_varint()?;

        let mut entries = vec![DirEntry::default(); n_entries];

        // Read tile IDs
        let mut next_tile_id = 0_u64;
        for entry in &mut entries {
            next_tile_id = next_tile_id
                .checked_add(buffer.read_u64_varint()?)
                .ok_or(MosaicError::InvalidEntry)?;
            entry.tile_id = next_tile_id;
        }

        // Read Run Lengths
        for entry in &mut entries {
            entry.run_length = buffer.read_u32_varint()?;
        }

        // Read Lengths
        for entry in &mut entries {
            entry.length = buffer.read_u32_varint()?;
        }

        // Read Offsets
        let mut last_entry: Option<&DirEntry> = None;
        for entry in &mut entries {
            let offset = buffer.read_u64_varint()?;
            entry.offset = if offset == 0 {
                let e = last_entry.ok_or(MosaicError::InvalidEntry)?;
                e.offset + u64::from(e.length)
            } else {
                offset - 1
            };
            last_entry = Some(entry);
        }

        Ok(Directory { entries })
    }
}

/// One directory entry: a run of tiles or a pointer to a leaf directory.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub(crate) tile_id: u64,
    pub(crate) offset: u64,
    pub(crate) length: u32,
    pub(crate) run_length: u32,
}

impl DirEntry {
    /// Leaf directory pointers have a run length of zero.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.run_length == 0
    }

    /// First tile id of the entry.
    #[must_use]
    pub fn tile_id(&self) -> u64 {
        self.tile_id
    }

    /// Offset into the tile data or leaf directory section.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Byte length of the data.
    #[must_use]
    pub fn length(&self) -> u32 {
        self.length
    }

    /// Consecutive tile ids sharing the data.
    #[must_use]
    pub fn run_length(&self) -> u32 {
        self.run_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tile_id: u64, offset: u64, length: u32, run_length: u32) -> DirEntry {
        DirEntry {
            tile_id,
            offset,
            length,
            run_length,
        }
    }

    fn sample() -> Directory {
        Directory::from_entries(vec![
            entry(0, 0, 100, 1),
            entry(1, 100, 50, 3),
            // Shares the payload of tile 0, so not contiguous
            entry(7, 0, 100, 1),
            entry(9, 150, 20, 1),
        ])
    }

    #[test]
    fn write_then_read_directory() {
        let dir = sample();
        let mut buf = Vec::new();
        dir.write_to(&mut buf).unwrap();

        let read = Directory::try_from(buf.as_slice()).unwrap();
        assert_eq!(read.entries(), dir.entries());
    }

    #[test]
    fn contiguous_offsets_are_compacted() {
        let contiguous = Directory::from_entries(vec![entry(0, 0, 10, 1), entry(1, 10, 10, 1)]);
        let mut buf = Vec::new();
        contiguous.write_to(&mut buf).unwrap();
        // count, 2 deltas, 2 run lengths, 2 lengths, offset+1 then 0
        assert_eq!(buf, vec![2, 0, 1, 1, 1, 10, 10, 1, 0]);
    }

    #[test]
    fn find_by_run_length() {
        let dir = sample();
        let id = |v| TileId::new(v).unwrap();
        assert_eq!(dir.find_tile_id(id(0)).unwrap().tile_id, 0);
        assert_eq!(dir.find_tile_id(id(3)).unwrap().tile_id, 1);
        assert!(dir.find_tile_id(id(4)).is_none());
        assert!(dir.find_tile_id(id(8)).is_none());
        assert!(dir.find_tile_id(id(10)).is_none());
    }

    #[test]
    fn find_in_leaf_pointer() {
        let dir = Directory::from_entries(vec![entry(0, 0, 300, 0), entry(500, 300, 200, 0)]);
        let found = dir.find_tile_id(TileId::new(499).unwrap()).unwrap();
        assert!(found.is_leaf());
        assert_eq!(found.offset, 0);
    }

    #[test]
    fn rejects_leading_zero_offset() {
        // One entry whose offset claims to follow a previous entry
        let err = Directory::try_from([1_u8, 0, 1, 10, 0].as_slice()).unwrap_err();
        assert!(matches!(err, MosaicError::InvalidEntry));
    }
}
