//! The boundary between the page layer and whatever owns the page cache.
//!
//! A page is checked out with [`Pager::get`] or [`Pager::allocate`] and must be
//! handed back with [`Pager::release`]. While checked out, the [`DbPage`] owns
//! the page buffer, which makes the exclusive-reference contract a property of
//! the type system: two live handles for the same page cannot exist.

use crate::{io::Buffer, Result};

pub type Pgno = u32;

/// A page checked out from the pager.
#[derive(Debug)]
pub struct DbPage {
    pgno: Pgno,
    buffer: Buffer,
    writeable: bool,
}

impl DbPage {
    pub fn new(pgno: Pgno, buffer: Buffer) -> Self {
        Self {
            pgno,
            buffer,
            writeable: false,
        }
    }

    pub fn pgno(&self) -> Pgno {
        self.pgno
    }

    pub fn data(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    /// Mutable access to the page image. The pager must have marked the page
    /// writeable first.
    pub fn data_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.writeable, "page {} edited before being made writeable", self.pgno);
        self.buffer.as_mut_slice()
    }

    pub fn is_writeable(&self) -> bool {
        self.writeable
    }

    /// Only pager implementations flip this flag.
    pub fn set_writeable(&mut self, writeable: bool) {
        self.writeable = writeable;
    }

    pub fn into_buffer(self) -> Buffer {
        self.buffer
    }
}

/// Page cache, journal and file I/O live behind this trait.
pub trait Pager {
    fn page_size(&self) -> usize;

    /// Number of pages in the database file.
    fn page_count(&self) -> Pgno;

    /// Check out an existing page. Pages past the end of the file read as zeros.
    fn get(&mut self, pgno: Pgno) -> Result<DbPage>;

    /// Check out a fresh, writeable page, preferably close to `nearby`.
    fn allocate(&mut self, nearby: Pgno) -> Result<DbPage>;

    /// Journal the page if needed and mark it dirty.
    fn make_writeable(&mut self, page: &mut DbPage) -> Result<()>;

    /// The page content is garbage and need not reach the file.
    fn dont_write(&mut self, page: &mut DbPage);

    fn release(&mut self, page: DbPage);
}
