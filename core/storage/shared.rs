//! State shared by every page of one database file.

use tracing::trace;

use crate::{
    bail_corrupt_error,
    storage::{
        config::BtreeConfig,
        page::MemPage,
        pager::{DbPage, Pager, Pgno},
        ptrmap::is_ptrmap_page,
    },
    Result,
};

/// Owns the pager, the configuration snapshot and page 1.
///
/// Page 1 stays checked out for the lifetime of this value because the
/// freelist counters in its database header are touched by every page free.
/// Callers reach it through [`BtShared::page1`] instead of the pager.
pub struct BtShared<P: Pager> {
    pager: P,
    config: BtreeConfig,
    page1: MemPage,
}

impl<P: Pager> BtShared<P> {
    pub fn new(mut pager: P, config: BtreeConfig) -> Result<Self> {
        if pager.page_size() != config.page_size as usize {
            bail_corrupt_error!(
                "pager page size {} does not match configured {}",
                pager.page_size(),
                config.page_size
            );
        }
        let page1 = pager.get(1)?;
        Ok(Self {
            pager,
            config,
            page1: MemPage::new(page1, config),
        })
    }

    /// Read the configuration from the database header on page 1.
    pub fn open(mut pager: P) -> Result<Self> {
        let page1 = pager.get(1)?;
        let config = match BtreeConfig::from_database_header(page1.data()) {
            Ok(config) => config,
            Err(e) => {
                pager.release(page1);
                return Err(e);
            }
        };
        pager.release(page1);
        Self::new(pager, config)
    }

    /// Release page 1 and hand the pager back.
    pub fn close(self) -> P {
        let Self {
            mut pager, page1, ..
        } = self;
        pager.release(page1.into_db_page());
        pager
    }

    pub fn config(&self) -> &BtreeConfig {
        &self.config
    }

    pub fn pager(&self) -> &P {
        &self.pager
    }

    pub fn pager_mut(&mut self) -> &mut P {
        &mut self.pager
    }

    pub fn page1(&self) -> &MemPage {
        &self.page1
    }

    pub fn page1_mut(&mut self) -> &mut MemPage {
        &mut self.page1
    }

    pub(crate) fn make_page1_writeable(&mut self) -> Result<()> {
        self.pager.make_writeable(self.page1.db_page_mut())
    }

    pub fn page_count(&self) -> Pgno {
        self.pager.page_count()
    }

    pub fn get_page(&mut self, pgno: Pgno) -> Result<DbPage> {
        self.pager.get(pgno)
    }

    /// Check out a page as a b-tree page without decoding it.
    pub fn get_mem_page(&mut self, pgno: Pgno) -> Result<MemPage> {
        Ok(MemPage::new(self.pager.get(pgno)?, self.config))
    }

    /// Check out and decode an existing b-tree page.
    pub fn get_and_init_page(&mut self, pgno: Pgno) -> Result<MemPage> {
        if pgno == 0 || pgno > self.page_count() {
            bail_corrupt_error!("page {pgno} is past the end of the file");
        }
        let mut page = self.get_mem_page(pgno)?;
        if let Err(e) = page.init_page() {
            self.release_page(page);
            return Err(e);
        }
        Ok(page)
    }

    /// Allocate a writeable page, skipping pages the file format reserves.
    pub fn allocate_page(&mut self, nearby: Pgno) -> Result<DbPage> {
        loop {
            let page = self.pager.allocate(nearby)?;
            if !self.is_reserved_page(page.pgno()) {
                return Ok(page);
            }
            trace!(pgno = page.pgno(), "skip reserved page");
            self.pager.release(page);
        }
    }

    /// The pending-byte page is never used; under auto-vacuum neither are
    /// pointer-map pages.
    pub fn is_reserved_page(&self, pgno: Pgno) -> bool {
        pgno == self.config.pending_byte_page()
            || (self.config.auto_vacuum && is_ptrmap_page(&self.config, pgno))
    }

    pub fn make_writeable(&mut self, page: &mut DbPage) -> Result<()> {
        self.pager.make_writeable(page)
    }

    pub fn dont_write(&mut self, page: &mut DbPage) {
        self.pager.dont_write(page)
    }

    pub fn release(&mut self, page: DbPage) {
        self.pager.release(page)
    }

    /// Hand a page back to the pager. Pages are never released on drop.
    pub fn release_page(&mut self, page: MemPage) {
        self.pager.release(page.into_db_page())
    }
}
