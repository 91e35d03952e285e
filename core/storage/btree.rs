use bitflags::bitflags;
use tracing::trace;

use crate::{
    bail_corrupt_error,
    storage::{
        page::{MemPage, OverflowCell},
        pager::{Pager, Pgno},
        shared::BtShared,
        sqlite3_ondisk::{PageView, PageViewMut, CELL_PTR_SIZE_BYTES},
    },
    Result,
};

/// The B-Tree page header is 12 bytes for interior pages and 8 bytes for leaf pages.
///
/// +--------+-----------------+-----------------+-----------------+--------+----- ..... ----+
/// | Page   | First Freeblock | Cell Count      | Cell Content    | Frag.  | Right-most     |
/// | Type   | Offset          |                 | Area Start      | Bytes  | pointer        |
/// +--------+-----------------+-----------------+-----------------+--------+----- ..... ----+
///     0        1        2        3        4        5        6        7        8       11
///
/// B-Tree Page: https://www.sqlite.org/fileformat.html
pub mod offset {
    pub const BTREE_PAGE_TYPE: usize = 0;
    pub const BTREE_FIRST_FREEBLOCK: usize = 1;
    pub const BTREE_CELL_COUNT: usize = 3;
    pub const BTREE_CELL_CONTENT_AREA: usize = 5;
    pub const BTREE_FRAGMENTED_BYTES_COUNT: usize = 7;
    pub const BTREE_RIGHTMOST_PTR: usize = 8;
}

bitflags! {
    /// Bits of the page-type byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFlags: u8 {
        const INTKEY = 0x01;
        const ZERODATA = 0x02;
        const LEAFDATA = 0x04;
        const LEAF = 0x08;

        const INDEX_INTERIOR = Self::ZERODATA.bits();
        const TABLE_INTERIOR = Self::INTKEY.bits() | Self::LEAFDATA.bits();
        const INDEX_LEAF = Self::ZERODATA.bits() | Self::LEAF.bits();
        const TABLE_LEAF = Self::INTKEY.bits() | Self::LEAFDATA.bits() | Self::LEAF.bits();
    }
}

impl MemPage {
    /// Insert `cell` so that it becomes cell `i`.
    ///
    /// When the page already has staged cells, or the cell does not fit,
    /// the cell is staged in the overflow list for the balancer and the page
    /// image is left untouched. With `child` set, the first four bytes of the
    /// stored cell are replaced by that page number.
    pub fn insert_cell<P: Pager>(
        &mut self,
        bt: &mut BtShared<P>,
        i: usize,
        cell: &[u8],
        child: Option<Pgno>,
    ) -> Result<()> {
        let size = cell.len();
        debug_assert!(i <= self.n_cell + self.overflow_cells.len());
        debug_assert!(self.n_cell <= self.config.max_cells());
        debug_assert!(child.is_some() || self.cell_size_bytes(cell).is_ok_and(|s| s == size));
        let skip = if child.is_some() { 4 } else { 0 };

        if !self.overflow_cells.is_empty() || size + CELL_PTR_SIZE_BYTES > self.n_free {
            let mut staged = cell.to_vec();
            if let Some(child) = child {
                staged.write_u32(0, child)?;
            }
            trace!(pgno = self.pgno(), index = i, size, "stage overflow cell");
            self.overflow_cells.push(OverflowCell {
                index: i,
                cell: staged,
            });
            return Ok(());
        }

        debug_assert!(self.page.is_writeable());
        let hdr = self.hdr_offset();
        let usable_size = self.config.usable_size as usize;
        let end = self.cell_offset + CELL_PTR_SIZE_BYTES * self.n_cell + CELL_PTR_SIZE_BYTES;
        let ins = self.cell_offset + CELL_PTR_SIZE_BYTES * i;
        let idx = self.allocate_space(size)?;
        if idx + size > usable_size {
            bail_corrupt_error!("page {}: cell allocated past usable size", self.pgno());
        }
        trace!(pgno = self.pgno(), index = i, size, offset = idx, "insert cell");

        self.n_cell += 1;
        self.n_free -= CELL_PTR_SIZE_BYTES + size;
        let n_cell = self.n_cell as u16;
        let data = self.data_mut();
        data[idx + skip..idx + size].copy_from_slice(&cell[skip..]);
        if let Some(child) = child {
            data.write_u32(idx, child)?;
        }
        data.copy_within(ins..end - CELL_PTR_SIZE_BYTES, ins + CELL_PTR_SIZE_BYTES);
        data.write_u16(ins, idx as u16)?;
        data.write_u16(hdr + offset::BTREE_CELL_COUNT, n_cell)?;

        if bt.config().auto_vacuum {
            self.ptrmap_put_ovfl_ptr(bt, cell)?;
        }
        Ok(())
    }

    /// Remove cell `i`, whose content occupies `size` bytes, from the page.
    /// The content is assumed to be copied elsewhere already.
    pub fn drop_cell(&mut self, i: usize, size: usize) -> Result<()> {
        debug_assert!(i < self.n_cell);
        debug_assert!(self.page.is_writeable());
        let actual = self.cell_size(i)?;
        if actual != size {
            bail_corrupt_error!(
                "page {}: cell {i} is {actual} bytes, caller expected {size}",
                self.pgno()
            );
        }
        let hdr = self.hdr_offset();
        let ptr = self.cell_offset + CELL_PTR_SIZE_BYTES * i;
        let pc = self.data().read_u16(ptr)? as usize;
        if pc < hdr + 6 + self.child_ptr_size() || pc + size > self.config.usable_size as usize {
            bail_corrupt_error!("page {}: cell {i} at {pc} is off the page", self.pgno());
        }
        trace!(pgno = self.pgno(), index = i, size, "drop cell");
        self.free_space(pc, size)?;

        let end = self.cell_offset + CELL_PTR_SIZE_BYTES * self.n_cell;
        self.n_cell -= 1;
        let n_cell = self.n_cell as u16;
        let data = self.data_mut();
        data.copy_within(ptr + CELL_PTR_SIZE_BYTES..end, ptr);
        data.write_u16(hdr + offset::BTREE_CELL_COUNT, n_cell)?;
        self.n_free += CELL_PTR_SIZE_BYTES;
        Ok(())
    }

    /// Like [`MemPage::find_cell`] but also sees cells staged in the overflow
    /// list, in the order the balancer will lay them out.
    pub fn find_overflow_cell(&self, i: usize) -> Result<&[u8]> {
        let mut i = i;
        for staged in &self.overflow_cells {
            if staged.index <= i {
                if staged.index == i {
                    return Ok(&staged.cell);
                }
                i -= 1;
            }
        }
        self.find_cell(i)
    }

    /// Bulk-load an empty page with `cells`, packed against the end of the
    /// usable area. The cells must fit.
    pub fn assemble_page(&mut self, cells: &[&[u8]]) -> Result<()> {
        let hdr = self.hdr_offset();
        let usable_size = self.config.usable_size as usize;
        debug_assert!(self.overflow_cells.is_empty());
        debug_assert!(self.page.is_writeable());
        debug_assert_eq!(self.n_cell, 0);
        debug_assert!(cells.len() <= self.config.max_cells());
        debug_assert!(
            cells.iter().map(|c| c.len() + CELL_PTR_SIZE_BYTES).sum::<usize>() <= self.n_free
        );
        if self.cell_content_area()? != usable_size {
            bail_corrupt_error!("page {}: assemble on a page that is not empty", self.pgno());
        }

        let cell_offset = self.cell_offset;
        let data = self.data_mut();
        let mut cell_body = usable_size;
        for (i, cell) in cells.iter().enumerate().rev() {
            cell_body -= cell.len();
            data.write_u16(cell_offset + CELL_PTR_SIZE_BYTES * i, cell_body as u16)?;
            data[cell_body..cell_body + cell.len()].copy_from_slice(cell);
        }
        data.write_u16(hdr + offset::BTREE_CELL_COUNT, cells.len() as u16)?;
        data.write_u16(hdr + offset::BTREE_CELL_CONTENT_AREA, cell_body as u16)?;
        self.n_free -= CELL_PTR_SIZE_BYTES * cells.len() + usable_size - cell_body;
        self.n_cell = cells.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        sqlite3_ondisk::PageType,
        testing::{index_cell, table_leaf_cell, TestTree},
    };

    #[test]
    fn test_page_flags_match_page_types() {
        assert_eq!(PageType::TableLeaf.flags(), PageFlags::TABLE_LEAF);
        assert_eq!(PageType::TableInterior.flags(), PageFlags::TABLE_INTERIOR);
        assert_eq!(PageType::IndexLeaf.flags(), PageFlags::INDEX_LEAF);
        assert_eq!(PageType::IndexInterior.flags(), PageFlags::INDEX_INTERIOR);
    }

    #[test]
    fn test_insert_then_drop_restores_free_space() {
        let mut tree = TestTree::new(4096);
        let mut page = tree.new_page(PageType::TableLeaf);
        assert_eq!(page.n_free(), 4088);
        assert_eq!(page.cell_count(), 0);

        let cell = table_leaf_cell(1, b"abc");
        page.insert_cell(&mut tree.bt, 0, &cell, None).unwrap();
        assert_eq!(page.cell_count(), 1);
        assert_eq!(page.n_free(), 4088 - cell.len() - 2);
        assert_eq!(page.parse_cell(0).unwrap().key, 1);

        page.drop_cell(0, cell.len()).unwrap();
        assert_eq!(page.cell_count(), 0);
        assert_eq!(page.n_free(), 4088);
        assert_eq!(page.cell_content_area().unwrap(), 4096);
        assert!(page.free_blocks().unwrap().is_empty());
        tree.release(page);
    }

    #[test]
    fn test_insert_keeps_pointer_order() {
        let mut tree = TestTree::new(1024);
        let mut page = tree.new_page(PageType::TableLeaf);
        for (i, rowid) in [(0, 10), (1, 30), (1, 20), (0, 5)] {
            page.insert_cell(&mut tree.bt, i, &table_leaf_cell(rowid, b"x"), None)
                .unwrap();
        }
        let keys: Vec<i64> = (0..page.cell_count())
            .map(|i| page.parse_cell(i).unwrap().key)
            .collect();
        assert_eq!(keys, vec![5, 10, 20, 30]);

        page.invalidate();
        page.init_page().unwrap();
        assert_eq!(page.cell_count(), 4);
        tree.release(page);
    }

    #[test]
    fn test_insert_with_child_pointer() {
        let mut tree = TestTree::new(1024);
        let mut page = tree.new_page(PageType::IndexInterior);
        let mut cell = vec![0xff; 4];
        cell.extend_from_slice(&index_cell(b"key"));
        page.insert_cell(&mut tree.bt, 0, &cell, Some(42)).unwrap();
        assert_eq!(page.child_pgno(0).unwrap(), 42);
        assert_eq!(&page.find_cell(0).unwrap()[4..cell.len()], &cell[4..]);
        tree.release(page);
    }

    #[test]
    fn test_full_page_stages_cell() {
        let mut tree = TestTree::new(512);
        let mut page = tree.new_page(PageType::TableLeaf);
        let big = table_leaf_cell(1, &[1; 400]);
        page.insert_cell(&mut tree.bt, 0, &big, None).unwrap();
        let before = page.data().to_vec();

        let second = table_leaf_cell(2, &[2; 200]);
        page.insert_cell(&mut tree.bt, 1, &second, None).unwrap();
        assert_eq!(page.cell_count(), 1);
        assert_eq!(page.overflow_cells().len(), 1);
        assert_eq!(page.data(), before.as_slice());

        // once something is staged, every insert is staged
        let tiny = table_leaf_cell(3, b"");
        page.insert_cell(&mut tree.bt, 0, &tiny, None).unwrap();
        assert_eq!(page.overflow_cells().len(), 2);
        assert_eq!(page.find_overflow_cell(0).unwrap(), tiny.as_slice());
        assert_eq!(page.find_overflow_cell(1).unwrap(), second.as_slice());
        assert_eq!(&page.find_overflow_cell(2).unwrap()[..big.len()], big.as_slice());

        let staged = page.take_overflow_cells();
        assert_eq!(staged[0].index, 1);
        assert!(page.overflow_cells().is_empty());
        tree.release(page);
    }

    #[test]
    fn test_drop_with_wrong_size_is_corrupt() {
        let mut tree = TestTree::new(1024);
        let mut page = tree.new_page(PageType::TableLeaf);
        let cell = table_leaf_cell(9, b"hello");
        page.insert_cell(&mut tree.bt, 0, &cell, None).unwrap();
        assert!(page.drop_cell(0, cell.len() + 1).unwrap_err().is_corrupt());
        assert_eq!(page.cell_count(), 1);
        tree.release(page);
    }

    #[test]
    fn test_drop_middle_cell_shifts_pointers() {
        let mut tree = TestTree::new(1024);
        let mut page = tree.new_page(PageType::TableLeaf);
        for rowid in 0..3 {
            let cell = table_leaf_cell(rowid, b"data");
            page.insert_cell(&mut tree.bt, rowid as usize, &cell, None).unwrap();
        }
        let size = page.cell_size(1).unwrap();
        page.drop_cell(1, size).unwrap();
        assert_eq!(page.parse_cell(0).unwrap().key, 0);
        assert_eq!(page.parse_cell(1).unwrap().key, 2);
        tree.release(page);
    }

    #[test]
    fn test_secure_delete_zeroes_dropped_cell() {
        let mut tree = TestTree::with_config(1024, |c| c.with_secure_delete(true));
        let mut page = tree.new_page(PageType::TableLeaf);
        let keep = table_leaf_cell(1, b"keep");
        let gone = table_leaf_cell(2, b"secret");
        page.insert_cell(&mut tree.bt, 0, &keep, None).unwrap();
        page.insert_cell(&mut tree.bt, 1, &gone, None).unwrap();
        let pc = page.find_cell_offset(1).unwrap();
        page.drop_cell(1, gone.len()).unwrap();
        // the first four bytes now hold the free-block header
        assert!(page.data()[pc + 4..pc + gone.len()].iter().all(|b| *b == 0));
        tree.release(page);
    }

    #[test]
    fn test_assemble_page() {
        let mut tree = TestTree::new(1024);
        let mut page = tree.new_page(PageType::IndexLeaf);
        let cells: Vec<Vec<u8>> = [b"aa".as_slice(), b"bbbb", b"c"]
            .into_iter()
            .map(index_cell)
            .collect();
        let refs: Vec<&[u8]> = cells.iter().map(Vec::as_slice).collect();
        page.assemble_page(&refs).unwrap();

        let total: usize = cells.iter().map(Vec::len).sum();
        assert_eq!(page.cell_count(), 3);
        assert_eq!(page.cell_content_area().unwrap(), 1024 - total);
        assert_eq!(page.n_free(), 1016 - total - 6);
        assert_eq!(page.find_cell_offset(0).unwrap(), 1024 - total);
        assert_eq!(&page.find_cell(2).unwrap()[..cells[2].len()], cells[2].as_slice());

        let n_free = page.n_free();
        page.invalidate();
        page.init_page().unwrap();
        assert_eq!(page.n_free(), n_free);
        tree.release(page);
    }
}
