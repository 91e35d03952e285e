//! Decoded in-memory state of one b-tree page.
//!
//! A [`MemPage`] wraps a checked-out [`DbPage`] together with the fields
//! decoded from its header. The decoded fields are only meaningful after
//! [`MemPage::init_page`] or [`MemPage::zero_page`] succeeded.

use tracing::debug;

use crate::{
    bail_corrupt_error,
    storage::{
        btree::{offset, PageFlags},
        config::BtreeConfig,
        pager::{DbPage, Pager, Pgno},
        shared::BtShared,
        sqlite3_ondisk::{
            PageType, PageView, PageViewMut, CELL_PTR_SIZE_BYTES, DATABASE_HEADER_SIZE,
            INTERIOR_PAGE_HEADER_SIZE_BYTES, LEAF_PAGE_HEADER_SIZE_BYTES,
        },
    },
    Result,
};

/// A cell that did not fit on its page and waits for the balancer.
///
/// `index` is the position the cell would take in the cell-pointer array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverflowCell {
    pub index: usize,
    pub cell: Vec<u8>,
}

#[derive(Debug)]
pub struct MemPage {
    pub(crate) page: DbPage,
    pub(crate) config: BtreeConfig,
    pub(crate) is_init: bool,
    pub(crate) int_key: bool,
    pub(crate) leaf: bool,
    pub(crate) has_data: bool,
    pub(crate) max_local: u32,
    pub(crate) min_local: u32,
    /// Offset of the first cell pointer, i.e. header offset plus header size.
    pub(crate) cell_offset: usize,
    pub(crate) n_free: usize,
    pub(crate) n_cell: usize,
    pub(crate) mask_page: usize,
    pub(crate) overflow_cells: Vec<OverflowCell>,
}

impl MemPage {
    /// Wrap a checked-out page. The result is not initialised.
    pub fn new(page: DbPage, config: BtreeConfig) -> Self {
        Self {
            page,
            config,
            is_init: false,
            int_key: false,
            leaf: false,
            has_data: false,
            max_local: 0,
            min_local: 0,
            cell_offset: 0,
            n_free: 0,
            n_cell: 0,
            mask_page: config.page_size as usize - 1,
            overflow_cells: Vec::new(),
        }
    }

    pub fn pgno(&self) -> Pgno {
        self.page.pgno()
    }

    /// Page 1 starts with the 100-byte database header.
    pub fn hdr_offset(&self) -> usize {
        if self.pgno() == 1 {
            DATABASE_HEADER_SIZE
        } else {
            0
        }
    }

    pub fn data(&self) -> &[u8] {
        self.page.data()
    }

    pub(crate) fn data_mut(&mut self) -> &mut [u8] {
        self.page.data_mut()
    }

    pub fn db_page(&self) -> &DbPage {
        &self.page
    }

    pub fn db_page_mut(&mut self) -> &mut DbPage {
        &mut self.page
    }

    pub fn into_db_page(self) -> DbPage {
        self.page
    }

    pub fn config(&self) -> &BtreeConfig {
        &self.config
    }

    pub fn is_init(&self) -> bool {
        self.is_init
    }

    /// Forget the decoded state so the next `init_page` re-reads the header.
    pub fn invalidate(&mut self) {
        self.is_init = false;
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    pub fn int_key(&self) -> bool {
        self.int_key
    }

    pub fn has_data(&self) -> bool {
        self.has_data
    }

    pub fn max_local(&self) -> u32 {
        self.max_local
    }

    pub fn min_local(&self) -> u32 {
        self.min_local
    }

    pub fn cell_count(&self) -> usize {
        self.n_cell
    }

    pub fn n_free(&self) -> usize {
        self.n_free
    }

    /// Bytes from the start of the buffer to the first cell pointer,
    /// including the database header on page 1.
    pub fn header_size(&self) -> usize {
        self.cell_offset
    }

    /// 4 on interior pages, whose cells start with a child page number.
    pub fn child_ptr_size(&self) -> usize {
        if self.leaf {
            0
        } else {
            4
        }
    }

    pub fn overflow_cells(&self) -> &[OverflowCell] {
        &self.overflow_cells
    }

    /// Hand the staged cells to the balancer.
    pub fn take_overflow_cells(&mut self) -> Vec<OverflowCell> {
        std::mem::take(&mut self.overflow_cells)
    }

    pub fn page_type(&self) -> Result<PageType> {
        PageType::try_from(self.data().read_u8(self.hdr_offset() + offset::BTREE_PAGE_TYPE)?)
    }

    pub fn first_freeblock(&self) -> Result<usize> {
        Ok(self.data().read_u16(self.hdr_offset() + offset::BTREE_FIRST_FREEBLOCK)? as usize)
    }

    pub fn cell_content_area(&self) -> Result<usize> {
        Ok(self.data().read_u16(self.hdr_offset() + offset::BTREE_CELL_CONTENT_AREA)? as usize)
    }

    pub fn num_frag_free_bytes(&self) -> Result<u8> {
        self.data().read_u8(self.hdr_offset() + offset::BTREE_FRAGMENTED_BYTES_COUNT)
    }

    pub fn rightmost_pointer(&self) -> Result<Option<Pgno>> {
        if self.leaf {
            return Ok(None);
        }
        Ok(Some(self.data().read_u32(self.hdr_offset() + offset::BTREE_RIGHTMOST_PTR)?))
    }

    pub fn write_rightmost_ptr(&mut self, pgno: Pgno) -> Result<()> {
        debug_assert!(!self.leaf);
        let pos = self.hdr_offset() + offset::BTREE_RIGHTMOST_PTR;
        self.data_mut().write_u32(pos, pgno)
    }

    /// Decode the flag byte of the header. Only four combinations are legal:
    /// zerodata and leafdata|intkey, each with or without the leaf bit.
    pub fn decode_flags(&mut self, flag_byte: u8) -> Result<()> {
        let flags = PageFlags::from_bits_retain(flag_byte);
        let leaf = flags.contains(PageFlags::LEAF);
        let kind = flags.difference(PageFlags::LEAF);
        if kind == PageFlags::LEAFDATA | PageFlags::INTKEY {
            self.int_key = true;
            self.has_data = leaf;
            self.max_local = self.config.max_leaf;
            self.min_local = self.config.min_leaf;
        } else if kind == PageFlags::ZERODATA {
            self.int_key = false;
            self.has_data = false;
            self.max_local = self.config.max_local;
            self.min_local = self.config.min_local;
        } else {
            bail_corrupt_error!("page {}: illegal flags byte {flag_byte:#04x}", self.pgno());
        }
        self.leaf = leaf;
        Ok(())
    }

    /// Decode the header and validate the free-block chain.
    ///
    /// A success does not prove the page is well formed, only that no
    /// corruption was detected. Calling it on an initialised page is a no-op.
    pub fn init_page(&mut self) -> Result<()> {
        if self.is_init {
            return Ok(());
        }
        let hdr = self.hdr_offset();
        let usable_size = self.config.usable_size as usize;
        self.decode_flags(self.data().read_u8(hdr + offset::BTREE_PAGE_TYPE)?)?;

        let cell_offset = hdr
            + if self.leaf {
                LEAF_PAGE_HEADER_SIZE_BYTES
            } else {
                INTERIOR_PAGE_HEADER_SIZE_BYTES
            };
        let data = self.data();
        let top = data.read_u16(hdr + offset::BTREE_CELL_CONTENT_AREA)? as usize;
        let n_cell = data.read_u16(hdr + offset::BTREE_CELL_COUNT)? as usize;
        if n_cell > self.config.max_cells() {
            bail_corrupt_error!(
                "page {}: {n_cell} cells exceeds maximum {}",
                self.pgno(),
                self.config.max_cells()
            );
        }
        let cell_first = cell_offset + CELL_PTR_SIZE_BYTES * n_cell;
        if top < cell_first || top > usable_size {
            bail_corrupt_error!(
                "page {}: content area starts at {top}, outside [{cell_first}, {usable_size}]",
                self.pgno()
            );
        }

        let mut n_free = data.read_u8(hdr + offset::BTREE_FRAGMENTED_BYTES_COUNT)? as usize + top;
        let mut pc = data.read_u16(hdr + offset::BTREE_FIRST_FREEBLOCK)? as usize;
        while pc > 0 {
            if pc > usable_size - 4 || pc < top {
                bail_corrupt_error!("page {}: free block at {pc} is off the page", self.pgno());
            }
            let next = data.read_u16(pc)? as usize;
            let size = data.read_u16(pc + 2)? as usize;
            if pc + size > usable_size {
                bail_corrupt_error!("page {}: free block at {pc} overruns the page", self.pgno());
            }
            if next > 0 && next <= pc + size + 3 {
                bail_corrupt_error!(
                    "page {}: free blocks out of order ({pc} then {next})",
                    self.pgno()
                );
            }
            n_free += size;
            pc = next;
        }
        if n_free > usable_size {
            bail_corrupt_error!(
                "page {}: free space {n_free} exceeds usable size {usable_size}",
                self.pgno()
            );
        }

        self.cell_offset = cell_offset;
        self.n_cell = n_cell;
        self.n_free = n_free - cell_first;
        self.mask_page = self.config.page_size as usize - 1;
        self.overflow_cells.clear();
        self.is_init = true;
        Ok(())
    }

    /// Format the page as an empty b-tree page of the given kind.
    pub fn zero_page(&mut self, flags: PageFlags) -> Result<()> {
        self.decode_flags(flags.bits())?;
        let hdr = self.hdr_offset();
        let usable_size = self.config.usable_size;
        let first = hdr
            + if self.leaf {
                LEAF_PAGE_HEADER_SIZE_BYTES
            } else {
                INTERIOR_PAGE_HEADER_SIZE_BYTES
            };
        debug!(pgno = self.pgno(), flags = flags.bits(), "zero page");

        let data = self.data_mut();
        data.write_u8(hdr + offset::BTREE_PAGE_TYPE, flags.bits())?;
        // first free block and cell count in one go
        data.write_u32(hdr + offset::BTREE_FIRST_FREEBLOCK, 0)?;
        data.write_u16(hdr + offset::BTREE_CELL_CONTENT_AREA, usable_size as u16)?;
        data.write_u8(hdr + offset::BTREE_FRAGMENTED_BYTES_COUNT, 0)?;

        self.n_free = usable_size as usize - first;
        self.cell_offset = first;
        self.overflow_cells.clear();
        self.mask_page = self.config.page_size as usize - 1;
        self.n_cell = 0;
        self.is_init = true;
        Ok(())
    }

    /// Offset of the content of cell `i`. Ignores staged overflow cells.
    pub fn find_cell_offset(&self, i: usize) -> Result<usize> {
        debug_assert!(i < self.n_cell);
        let ptr = self.data().read_u16(self.cell_offset + CELL_PTR_SIZE_BYTES * i)? as usize;
        Ok(self.mask_page & ptr)
    }

    /// Bytes of cell `i`, running to the end of the usable area.
    pub fn find_cell(&self, i: usize) -> Result<&[u8]> {
        let pc = self.find_cell_offset(i)?;
        match self.data().get(pc..self.config.usable_size as usize) {
            Some(cell) => Ok(cell),
            None => bail_corrupt_error!("page {}: cell {i} at {pc} is off the page", self.pgno()),
        }
    }

    /// Child page of cell `i` on an interior page, or the rightmost child
    /// when `i` equals the cell count.
    pub fn child_pgno(&self, i: usize) -> Result<Pgno> {
        if self.leaf {
            bail_corrupt_error!("page {}: leaf pages have no children", self.pgno());
        }
        if i == self.n_cell {
            return self.data().read_u32(self.hdr_offset() + offset::BTREE_RIGHTMOST_PTR);
        }
        self.find_cell(i)?.read_u32(0)
    }

    /// The free-block chain as `(offset, size)` pairs, in chain order.
    pub fn free_blocks(&self) -> Result<Vec<(usize, usize)>> {
        let usable_size = self.config.usable_size as usize;
        let data = self.data();
        let mut blocks = Vec::new();
        let mut pc = self.first_freeblock()?;
        while pc > 0 {
            if blocks.len() > usable_size / 4 {
                bail_corrupt_error!("page {}: free-block chain loops", self.pgno());
            }
            blocks.push((pc, data.read_u16(pc + 2)? as usize));
            pc = data.read_u16(pc)? as usize;
        }
        Ok(blocks)
    }

    /// Copy the b-tree content of this page onto `to`, then reinitialise `to`
    /// and, under auto-vacuum, repoint the pointer map at it.
    pub fn copy_node_content<P: Pager>(&self, to: &mut MemPage, bt: &mut BtShared<P>) -> Result<()> {
        debug_assert!(self.is_init);
        let usable_size = self.config.usable_size as usize;
        let from_hdr = self.hdr_offset();
        let to_hdr = to.hdr_offset();
        debug_assert!(self.n_free >= to_hdr);

        let content = self.cell_content_area()?;
        if content > usable_size {
            bail_corrupt_error!("page {}: content area past usable size", self.pgno());
        }
        let header_len = self.cell_offset - from_hdr + CELL_PTR_SIZE_BYTES * self.n_cell;
        if content < to_hdr + header_len {
            bail_corrupt_error!(
                "page {}: content does not fit behind header of page {}",
                self.pgno(),
                to.pgno()
            );
        }
        let src = self.data();
        let dst = to.data_mut();
        dst[content..usable_size].copy_from_slice(&src[content..usable_size]);
        dst[to_hdr..to_hdr + header_len].copy_from_slice(&src[from_hdr..from_hdr + header_len]);

        to.is_init = false;
        to.init_page()?;
        if bt.config().auto_vacuum {
            to.set_child_ptrmaps(bt)?;
        }
        Ok(())
    }
}
