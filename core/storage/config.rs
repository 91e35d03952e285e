//! Tree-wide configuration shared by every page of one database file.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::{
    bail_corrupt_error,
    storage::sqlite3_ondisk::{
        header_offset, PageSize, PageView, DATABASE_HEADER_SIZE, PENDING_BYTE,
    },
    Result,
};

/// The smallest usable size the file format allows.
pub const MIN_USABLE_SIZE: u32 = 480;

/// Immutable snapshot of the shared tree state that page operations read.
///
/// Pages take a copy when they are checked out, so thresholds never change
/// underneath an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BtreeConfig {
    pub page_size: u32,
    pub reserved: u8,
    pub usable_size: u32,
    /// Local payload ceiling for index pages.
    pub max_local: u32,
    /// Local payload floor for index pages.
    pub min_local: u32,
    /// Local payload ceiling for table leaf pages.
    pub max_leaf: u32,
    /// Local payload floor for table leaf pages.
    pub min_leaf: u32,
    pub auto_vacuum: bool,
    pub secure_delete: bool,
}

impl BtreeConfig {
    pub fn new(page_size: u32, reserved: u8) -> Result<Self> {
        let Some(size) = PageSize::new(page_size) else {
            bail_corrupt_error!("invalid page size: {page_size}")
        };
        let page_size = size.get();
        let usable_size = page_size - reserved as u32;
        if usable_size < MIN_USABLE_SIZE {
            bail_corrupt_error!("usable size {usable_size} below minimum {MIN_USABLE_SIZE}");
        }
        let min_local = (usable_size - 12) * 32 / 255 - 23;
        Ok(Self {
            page_size,
            reserved,
            usable_size,
            max_local: (usable_size - 12) * 64 / 255 - 23,
            min_local,
            max_leaf: usable_size - 35,
            min_leaf: min_local,
            auto_vacuum: false,
            secure_delete: false,
        })
    }

    /// Decode the configuration stored in the database header of page 1.
    pub fn from_database_header(page1: &[u8]) -> Result<Self> {
        if page1.len() < DATABASE_HEADER_SIZE {
            bail_corrupt_error!("database header truncated: {} bytes", page1.len());
        }
        let size = PageSize::new_from_header_u16(page1.read_u16(header_offset::PAGE_SIZE)?)?;
        let reserved = page1.read_u8(header_offset::RESERVED_SPACE)?;
        let auto_vacuum = page1.read_u32(header_offset::LARGEST_ROOT_PAGE)? != 0;
        Ok(Self::new(size.get(), reserved)?.with_auto_vacuum(auto_vacuum))
    }

    pub fn with_auto_vacuum(mut self, auto_vacuum: bool) -> Self {
        self.auto_vacuum = auto_vacuum;
        self
    }

    pub fn with_secure_delete(mut self, secure_delete: bool) -> Self {
        self.secure_delete = secure_delete;
        self
    }

    /// Upper bound on the number of cells a single page can hold.
    pub fn max_cells(&self) -> usize {
        (self.page_size as usize - 8) / 6
    }

    pub fn pending_byte_page(&self) -> u32 {
        PENDING_BYTE / self.page_size + 1
    }

    /// Leaf entries written to a freelist trunk before a new trunk is started.
    /// Readers accept up to `usable/4 - 2`.
    pub fn freelist_trunk_capacity(&self) -> u32 {
        self.usable_size / 4 - 8
    }

    /// Payload bytes carried by one overflow page.
    pub fn overflow_page_payload(&self) -> usize {
        self.usable_size as usize - 4
    }
}
