//! Fixtures shared by the storage tests.

use crate::{
    io::MemoryPager,
    storage::{
        config::BtreeConfig,
        cell::MIN_CELL_SIZE,
        page::MemPage,
        pager::{Pager, Pgno},
        shared::BtShared,
        sqlite3_ondisk::{write_varint_to_vec, PageType},
    },
};

pub(crate) struct TestTree {
    pub bt: BtShared<MemoryPager>,
}

impl TestTree {
    pub fn new(page_size: u32) -> Self {
        Self::with_config(page_size, |config| config)
    }

    pub fn with_config(page_size: u32, f: impl FnOnce(BtreeConfig) -> BtreeConfig) -> Self {
        let config = f(BtreeConfig::new(page_size, 0).unwrap());
        let bt = BtShared::new(MemoryPager::new(page_size as usize), config).unwrap();
        Self { bt }
    }

    /// Allocate and format a fresh page.
    pub fn new_page(&mut self, ty: PageType) -> MemPage {
        let page = self.bt.allocate_page(0).unwrap();
        let mut page = MemPage::new(page, *self.bt.config());
        page.zero_page(ty.flags()).unwrap();
        page
    }

    pub fn release(&mut self, page: MemPage) {
        self.bt.release_page(page);
    }

    pub fn pager(&self) -> &MemoryPager {
        self.bt.pager()
    }

    pub fn pager_mut(&mut self) -> &mut MemoryPager {
        self.bt.pager_mut()
    }
}

/// A formatted page outside of any tree.
pub(crate) fn empty_page(pgno: Pgno, page_size: u32, ty: PageType) -> MemPage {
    let config = BtreeConfig::new(page_size, 0).unwrap();
    let mut pager = MemoryPager::new(page_size as usize);
    let mut page = pager.get(pgno).unwrap();
    pager.make_writeable(&mut page).unwrap();
    let mut page = MemPage::new(page, config);
    page.zero_page(ty.flags()).unwrap();
    page
}

/// A table leaf cell whose payload stays on the page.
pub(crate) fn table_leaf_cell(rowid: i64, data: &[u8]) -> Vec<u8> {
    let mut cell = Vec::new();
    write_varint_to_vec(data.len() as u64, &mut cell);
    write_varint_to_vec(rowid as u64, &mut cell);
    cell.extend_from_slice(data);
    cell.resize(cell.len().max(MIN_CELL_SIZE), 0);
    cell
}

/// An index leaf cell whose key stays on the page.
pub(crate) fn index_cell(key: &[u8]) -> Vec<u8> {
    let mut cell = Vec::new();
    write_varint_to_vec(key.len() as u64, &mut cell);
    cell.extend_from_slice(key);
    cell.resize(cell.len().max(MIN_CELL_SIZE), 0);
    cell
}
