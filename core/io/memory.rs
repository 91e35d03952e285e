use std::collections::BTreeMap;

use tracing::trace;

use crate::{
    error::BtPageError,
    storage::pager::{DbPage, Pager, Pgno},
    Buffer, Result,
};

struct Slot {
    // None while the page is checked out
    buffer: Option<Buffer>,
    dirty: bool,
}

/// Pager that keeps every page in memory.
///
/// Backs the test suite and embedders that need no file at all. Page 1 exists
/// from the start; every other page appears on first `get` or `allocate`.
pub struct MemoryPager {
    page_size: usize,
    pages: BTreeMap<Pgno, Slot>,
    n_pages: Pgno,
    allocations_left: Option<usize>,
}

impl MemoryPager {
    pub fn new(page_size: usize) -> Self {
        let mut pager = Self {
            page_size,
            pages: BTreeMap::new(),
            n_pages: 0,
            allocations_left: None,
        };
        pager.ensure_page(1);
        pager
    }

    /// Make every allocation after the next `n` fail with `Full`.
    pub fn fail_allocations_after(&mut self, n: usize) {
        self.allocations_left = Some(n);
    }

    /// Number of pages currently checked out.
    pub fn checked_out(&self) -> usize {
        self.pages.values().filter(|slot| slot.buffer.is_none()).count()
    }

    pub fn is_dirty(&self, pgno: Pgno) -> bool {
        self.pages.get(&pgno).is_some_and(|slot| slot.dirty)
    }

    /// Peek at a page that is not checked out.
    pub fn page_data(&self, pgno: Pgno) -> Option<&[u8]> {
        self.pages
            .get(&pgno)
            .and_then(|slot| slot.buffer.as_ref())
            .map(Buffer::as_slice)
    }

    fn ensure_page(&mut self, pgno: Pgno) {
        let page_size = self.page_size;
        self.pages.entry(pgno).or_insert_with(|| Slot {
            buffer: Some(Buffer::new_zeroed(page_size)),
            dirty: false,
        });
        self.n_pages = self.n_pages.max(pgno);
    }

    fn check_out(&mut self, pgno: Pgno) -> Result<DbPage> {
        let slot = self
            .pages
            .get_mut(&pgno)
            .ok_or_else(|| BtPageError::Corrupt(format!("page {pgno} missing from pager")))?;
        match slot.buffer.take() {
            Some(buffer) => Ok(DbPage::new(pgno, buffer)),
            None => Err(BtPageError::PageInUse(pgno)),
        }
    }
}

impl Pager for MemoryPager {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> Pgno {
        self.n_pages
    }

    fn get(&mut self, pgno: Pgno) -> Result<DbPage> {
        if pgno == 0 {
            return Err(BtPageError::Corrupt("page number 0 requested".to_string()));
        }
        self.ensure_page(pgno);
        self.check_out(pgno)
    }

    fn allocate(&mut self, nearby: Pgno) -> Result<DbPage> {
        if let Some(left) = self.allocations_left.as_mut() {
            if *left == 0 {
                return Err(BtPageError::Full);
            }
            *left -= 1;
        }
        let pgno = self.n_pages + 1;
        trace!(pgno, nearby, "memory pager allocate");
        self.ensure_page(pgno);
        let mut page = self.check_out(pgno)?;
        self.make_writeable(&mut page)?;
        Ok(page)
    }

    fn make_writeable(&mut self, page: &mut DbPage) -> Result<()> {
        if let Some(slot) = self.pages.get_mut(&page.pgno()) {
            slot.dirty = true;
        }
        page.set_writeable(true);
        Ok(())
    }

    fn dont_write(&mut self, page: &mut DbPage) {
        if let Some(slot) = self.pages.get_mut(&page.pgno()) {
            slot.dirty = false;
        }
    }

    fn release(&mut self, page: DbPage) {
        let pgno = page.pgno();
        let page_size = self.page_size;
        let slot = self.pages.entry(pgno).or_insert_with(|| Slot {
            buffer: None,
            dirty: false,
        });
        debug_assert!(slot.buffer.is_none(), "page {pgno} released twice");
        let buffer = page.into_buffer();
        debug_assert_eq!(buffer.len(), page_size);
        slot.buffer = Some(buffer);
    }
}
