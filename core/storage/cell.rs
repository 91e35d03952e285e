//! Cell parsing and the local/overflow payload split.
//!
//! Cell layouts by page kind:
//!
//! ```text
//! table interior: [child:4][rowid:varint]
//! table leaf:     [payload size:varint][rowid:varint][local payload][overflow pgno:4]?
//! index interior: [child:4][payload size:varint][local payload][overflow pgno:4]?
//! index leaf:     [payload size:varint][local payload][overflow pgno:4]?
//! ```

use crate::{
    bail_corrupt_error,
    storage::{page::MemPage, sqlite3_ondisk::read_varint},
    Result,
};

/// Smallest number of bytes a cell may occupy in the content area, so that
/// it can always be turned back into a free block.
pub const MIN_CELL_SIZE: usize = 4;

/// Decoded description of one cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellInfo {
    /// Bytes before the payload: child pointer and size/key varints.
    pub header_len: usize,
    /// Rowid on table pages, payload size on index pages.
    pub key: i64,
    /// Data bytes of a table leaf cell, 0 elsewhere.
    pub data_len: u32,
    /// Total payload bytes, local and overflowing.
    pub payload_len: u32,
    /// Offset within the cell of the 4-byte first overflow page number, or 0.
    pub overflow_offset: usize,
    pub local_len: usize,
    /// Bytes the cell occupies in the content area.
    pub size: usize,
}

impl CellInfo {
    pub fn has_overflow(&self) -> bool {
        self.overflow_offset != 0
    }
}

/// Number of payload bytes stored on the page for a payload of `payload`
/// bytes. The modular formula is part of the file format.
pub fn local_payload_len(payload: u32, min_local: u32, max_local: u32, usable_size: u32) -> usize {
    if payload <= max_local {
        return payload as usize;
    }
    let surplus = min_local + (payload - min_local) % (usable_size - 4);
    if surplus <= max_local {
        surplus as usize
    } else {
        min_local as usize
    }
}

fn read_varint32(cell: &[u8], pos: usize) -> Result<(u32, usize)> {
    let Some(rest) = cell.get(pos..) else {
        bail_corrupt_error!("cell header truncated at offset {pos}");
    };
    let (value, len) = read_varint(rest)?;
    match u32::try_from(value) {
        Ok(value) => Ok((value, len)),
        Err(_) => bail_corrupt_error!("payload size {value} out of range"),
    }
}

impl MemPage {
    /// Parse cell bytes that belong to a page of this page's kind.
    pub fn parse_cell_bytes(&self, cell: &[u8]) -> Result<CellInfo> {
        let mut n = self.child_ptr_size();
        let key;
        let data_len;
        let payload_len;
        if self.int_key {
            if self.has_data {
                let (size, len) = read_varint32(cell, n)?;
                payload_len = size;
                n += len;
            } else {
                payload_len = 0;
            }
            let Some(rest) = cell.get(n..) else {
                bail_corrupt_error!("page {}: cell truncated before rowid", self.pgno());
            };
            let (rowid, len) = read_varint(rest)?;
            n += len;
            key = rowid as i64;
            data_len = payload_len;
        } else {
            let (size, len) = read_varint32(cell, n)?;
            n += len;
            payload_len = size;
            key = size as i64;
            data_len = 0;
        }

        let local_len = local_payload_len(
            payload_len,
            self.min_local,
            self.max_local,
            self.config.usable_size,
        );
        let (overflow_offset, size) = if local_len == payload_len as usize {
            (0, (n + local_len).max(MIN_CELL_SIZE))
        } else {
            (n + local_len, n + local_len + 4)
        };
        Ok(CellInfo {
            header_len: n,
            key,
            data_len,
            payload_len,
            overflow_offset,
            local_len,
            size,
        })
    }

    /// Parse cell `i`. Ignores staged overflow cells.
    pub fn parse_cell(&self, i: usize) -> Result<CellInfo> {
        self.parse_cell_bytes(self.find_cell(i)?)
    }

    /// Content-area size of the given cell bytes.
    pub fn cell_size_bytes(&self, cell: &[u8]) -> Result<usize> {
        Ok(self.parse_cell_bytes(cell)?.size)
    }

    pub fn cell_size(&self, i: usize) -> Result<usize> {
        Ok(self.parse_cell(i)?.size)
    }
}
