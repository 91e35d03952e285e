//! The file-level freelist.
//!
//! Page 1 holds the first trunk page number at offset 32 and the number of
//! free pages at offset 36. A trunk page is `[next trunk:4][k:4][k leaf pgnos]`.

use tracing::{debug, warn};

use crate::{
    bail_corrupt_error,
    storage::{
        page::MemPage,
        pager::{DbPage, Pager, Pgno},
        ptrmap::PtrmapType,
        shared::BtShared,
        sqlite3_ondisk::{header_offset, PageView, PageViewMut},
    },
    Result,
};

impl<P: Pager> BtShared<P> {
    /// Total number of pages on the freelist.
    pub fn free_page_count(&self) -> Result<u32> {
        self.page1().data().read_u32(header_offset::FREELIST_PAGE_COUNT)
    }

    /// First freelist trunk page, 0 if the freelist is empty.
    pub fn first_trunk(&self) -> Result<Pgno> {
        self.page1().data().read_u32(header_offset::FIRST_FREELIST_TRUNK)
    }

    fn set_free_page_count(&mut self, count: u32) -> Result<()> {
        self.make_page1_writeable()?;
        self.page1_mut()
            .data_mut()
            .write_u32(header_offset::FREELIST_PAGE_COUNT, count)
    }

    fn set_first_trunk(&mut self, pgno: Pgno) -> Result<()> {
        self.make_page1_writeable()?;
        self.page1_mut()
            .data_mut()
            .write_u32(header_offset::FIRST_FREELIST_TRUNK, pgno)
    }
}

impl MemPage {
    /// Put this page on the freelist. The page reference is not released;
    /// the caller still hands it back to the pager.
    pub fn free_page<P: Pager>(&mut self, bt: &mut BtShared<P>) -> Result<()> {
        let pgno = self.pgno();
        debug_assert!(pgno > 1);
        self.is_init = false;

        let n = bt.free_page_count()?;
        bt.set_free_page_count(n + 1)?;

        if self.config.secure_delete {
            bt.make_writeable(&mut self.page)?;
            self.data_mut().fill(0);
        }
        bt.ptrmap_put(pgno, PtrmapType::FreePage, 0)?;

        if n == 0 {
            bt.make_writeable(&mut self.page)?;
            self.data_mut()[..8].fill(0);
            bt.set_first_trunk(pgno)?;
            debug!(pgno, "free page: first");
            return Ok(());
        }

        let trunk_pgno = bt.first_trunk()?;
        let mut trunk = bt.get_page(trunk_pgno)?;
        let result = self.add_to_trunk(bt, &mut trunk);
        bt.release(trunk);
        result
    }

    fn add_to_trunk<P: Pager>(&mut self, bt: &mut BtShared<P>, trunk: &mut DbPage) -> Result<()> {
        let pgno = self.pgno();
        let usable_size = self.config.usable_size;
        let k = trunk.data().read_u32(4)?;
        if k > usable_size / 4 - 2 {
            warn!(trunk = trunk.pgno(), k, "freelist trunk overfull");
            bail_corrupt_error!("freelist trunk {} claims {k} leaves", trunk.pgno());
        }

        if k >= self.config.freelist_trunk_capacity() {
            // the freed page becomes the new first trunk, with no leaves
            bt.make_writeable(&mut self.page)?;
            let data = self.data_mut();
            data.write_u32(0, trunk.pgno())?;
            data.write_u32(4, 0)?;
            bt.set_first_trunk(pgno)?;
            debug!(pgno, old_trunk = trunk.pgno(), "free page: new trunk");
        } else {
            bt.make_writeable(trunk)?;
            let data = trunk.data_mut();
            data.write_u32(4, k + 1)?;
            data.write_u32(8 + 4 * k as usize, pgno)?;
            if self.config.secure_delete {
                bt.dont_write(&mut self.page);
            }
            debug!(pgno, trunk = trunk.pgno(), "free page: leaf");
        }
        Ok(())
    }
}
