//! Free-space management inside one b-tree page.
//!
//! Free bytes live in three places: the gap between the cell-pointer array
//! and the content area, the ascending chain of free blocks, and the
//! fragmented-byte counter for holes smaller than a free block. `n_free`
//! counts all three.

use tracing::debug;

use crate::{
    bail_corrupt_error,
    storage::{
        btree::offset,
        page::MemPage,
        sqlite3_ondisk::{PageView, PageViewMut, CELL_PTR_SIZE_BYTES},
    },
    Result,
};

/// Once this many bytes are fragmented, allocation defragments first.
const MAX_FRAGMENTED_BYTES: usize = 60;

/// Smallest hole worth tracking as a free block: `[next:2][size:2]`.
const MIN_FREE_BLOCK_SIZE: usize = 4;

impl MemPage {
    /// Reserve `n_byte` bytes of content space and return their offset.
    ///
    /// The caller has already checked that `n_free` covers the request; this
    /// never fails for lack of space, only for corruption.
    pub(crate) fn allocate_space(&mut self, n_byte: usize) -> Result<usize> {
        debug_assert!(self.page.is_writeable());
        debug_assert!(self.n_free >= n_byte);
        debug_assert!(self.overflow_cells.is_empty());
        let usable_size = self.config.usable_size as usize;
        debug_assert!(n_byte < usable_size - 8);

        let hdr = self.hdr_offset();
        let n_frag = self.num_frag_free_bytes()? as usize;
        let gap = self.cell_offset + CELL_PTR_SIZE_BYTES * self.n_cell;
        let mut top = self.cell_content_area()?;
        if gap > top {
            bail_corrupt_error!("page {}: cell pointers overrun content area", self.pgno());
        }

        if n_frag >= MAX_FRAGMENTED_BYTES {
            self.defragment_page()?;
            top = self.cell_content_area()?;
        } else if gap + CELL_PTR_SIZE_BYTES <= top {
            let mut addr = hdr + offset::BTREE_FIRST_FREEBLOCK;
            loop {
                let pc = self.data().read_u16(addr)? as usize;
                if pc == 0 {
                    break;
                }
                if pc > usable_size - 4 || pc < addr + 4 {
                    bail_corrupt_error!("page {}: free block at {pc} out of place", self.pgno());
                }
                let size = self.data().read_u16(pc + 2)? as usize;
                if size >= n_byte {
                    let leftover = size - n_byte;
                    let data = self.data_mut();
                    if leftover < MIN_FREE_BLOCK_SIZE {
                        // unlink the block; the remainder becomes fragmentation
                        let next = data.read_u16(pc)?;
                        data.write_u16(addr, next)?;
                        data.write_u8(
                            hdr + offset::BTREE_FRAGMENTED_BYTES_COUNT,
                            (n_frag + leftover) as u8,
                        )?;
                    } else if pc + size > usable_size {
                        bail_corrupt_error!("free block at {pc} overruns the page");
                    } else {
                        data.write_u16(pc + 2, leftover as u16)?;
                    }
                    return Ok(pc + leftover);
                }
                addr = pc;
            }
        }

        if gap + CELL_PTR_SIZE_BYTES + n_byte > top {
            self.defragment_page()?;
            top = self.cell_content_area()?;
            debug_assert!(gap + n_byte <= top);
        }
        top -= n_byte;
        self.data_mut()
            .write_u16(hdr + offset::BTREE_CELL_CONTENT_AREA, top as u16)?;
        Ok(top)
    }

    /// Return `size` bytes at `start` to the free-block chain, merging with
    /// neighbours and folding into the content area when possible.
    pub(crate) fn free_space(&mut self, start: usize, size: usize) -> Result<()> {
        debug_assert!(self.page.is_writeable());
        let hdr = self.hdr_offset();
        let usable_size = self.config.usable_size as usize;
        debug_assert!(start >= hdr + 6 + self.child_ptr_size());
        debug_assert!(start + size <= usable_size);
        let pgno = self.pgno();
        let secure_delete = self.config.secure_delete;
        let data = self.data_mut();

        // find the insertion point in the ascending chain
        let mut addr = hdr + offset::BTREE_FIRST_FREEBLOCK;
        let mut prev_end = 0;
        let mut pbegin = data.read_u16(addr)? as usize;
        while pbegin > 0 && pbegin < start {
            if pbegin <= addr {
                bail_corrupt_error!("page {pgno}: free blocks out of order at {pbegin}");
            }
            addr = pbegin;
            prev_end = pbegin + data.read_u16(pbegin + 2)? as usize;
            pbegin = data.read_u16(addr)? as usize;
        }
        if pbegin > usable_size - 4 {
            bail_corrupt_error!("page {pgno}: free block at {pbegin} is off the page");
        }
        // the freed range must not already be free
        if prev_end > start || (pbegin > 0 && pbegin < start + size) {
            bail_corrupt_error!("page {pgno}: freed range at {start} overlaps a free block");
        }

        if secure_delete {
            data[start..start + size].fill(0);
        }
        data.write_u16(addr, start as u16)?;
        data.write_u16(start, pbegin as u16)?;
        data.write_u16(start + 2, size as u16)?;

        // coalesce blocks separated by less than a free block's worth of bytes
        let frag_pos = hdr + offset::BTREE_FRAGMENTED_BYTES_COUNT;
        addr = hdr + offset::BTREE_FIRST_FREEBLOCK;
        loop {
            let pbegin = data.read_u16(addr)? as usize;
            if pbegin == 0 {
                break;
            }
            let pnext = data.read_u16(pbegin)? as usize;
            let psize = data.read_u16(pbegin + 2)? as usize;
            if pnext > 0 && pbegin + psize + 3 >= pnext {
                let n_frag = data.read_u8(frag_pos)? as usize;
                let Some(frag) = pnext.checked_sub(pbegin + psize).filter(|f| *f <= n_frag) else {
                    bail_corrupt_error!("page {pgno}: free blocks at {pbegin} and {pnext} overlap");
                };
                data.write_u8(frag_pos, (n_frag - frag) as u8)?;
                let next = data.read_u16(pnext)?;
                data.write_u16(pbegin, next)?;
                let merged = pnext + data.read_u16(pnext + 2)? as usize - pbegin;
                if pbegin + merged > usable_size {
                    bail_corrupt_error!("page {pgno}: merged free block at {pbegin} overruns the page");
                }
                data.write_u16(pbegin + 2, merged as u16)?;
            } else {
                addr = pbegin;
            }
        }

        // a free block at the start of the content area just moves the top
        let first = data.read_u16(hdr + offset::BTREE_FIRST_FREEBLOCK)? as usize;
        let top = data.read_u16(hdr + offset::BTREE_CELL_CONTENT_AREA)? as usize;
        if first == top {
            let next = data.read_u16(first)?;
            data.write_u16(hdr + offset::BTREE_FIRST_FREEBLOCK, next)?;
            let top = top + data.read_u16(first + 2)? as usize;
            if top > usable_size {
                bail_corrupt_error!("page {pgno}: content area moved past usable size");
            }
            data.write_u16(hdr + offset::BTREE_CELL_CONTENT_AREA, top as u16)?;
        }

        self.n_free += size;
        Ok(())
    }

    /// Move every cell to the end of the page so that all free space forms
    /// one gap between the cell-pointer array and the content area.
    pub(crate) fn defragment_page(&mut self) -> Result<()> {
        debug_assert!(self.page.is_writeable());
        debug_assert!(self.overflow_cells.is_empty());
        let hdr = self.hdr_offset();
        let usable_size = self.config.usable_size as usize;
        let cell_offset = self.cell_offset;
        let n_cell = self.n_cell;
        let cell_first = cell_offset + CELL_PTR_SIZE_BYTES * n_cell;
        let cell_last = usable_size - 4;
        debug!(pgno = self.pgno(), n_cell, "defragment page");

        let scratch = self.data()[..usable_size].to_vec();
        let mut cbrk = usable_size;
        for i in 0..n_cell {
            let addr = cell_offset + CELL_PTR_SIZE_BYTES * i;
            let pc = scratch.read_u16(addr)? as usize;
            if pc < cell_first || pc > cell_last {
                bail_corrupt_error!("page {}: cell {i} at {pc} is off the page", self.pgno());
            }
            let size = self.cell_size_bytes(&scratch[pc..])?;
            if size > cbrk || cbrk - size < cell_first || pc + size > usable_size {
                bail_corrupt_error!("page {}: cell {i} of size {size} does not fit", self.pgno());
            }
            cbrk -= size;
            let data = self.data_mut();
            data[cbrk..cbrk + size].copy_from_slice(&scratch[pc..pc + size]);
            data.write_u16(addr, cbrk as u16)?;
        }

        let data = self.data_mut();
        data.write_u16(hdr + offset::BTREE_CELL_CONTENT_AREA, cbrk as u16)?;
        data.write_u16(hdr + offset::BTREE_FIRST_FREEBLOCK, 0)?;
        data.write_u8(hdr + offset::BTREE_FRAGMENTED_BYTES_COUNT, 0)?;
        data[cell_first..cbrk].fill(0);
        if cbrk - cell_first != self.n_free {
            bail_corrupt_error!(
                "page {}: {} bytes free after defragment, expected {}",
                self.pgno(),
                cbrk - cell_first,
                self.n_free
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{
        sqlite3_ondisk::PageType,
        testing::{empty_page, table_leaf_cell, TestTree},
    };

    #[test]
    fn test_allocate_carves_from_top() {
        let mut page = empty_page(2, 1024, PageType::TableLeaf);
        assert_eq!(page.allocate_space(10).unwrap(), 1014);
        assert_eq!(page.allocate_space(20).unwrap(), 994);
        assert_eq!(page.cell_content_area().unwrap(), 994);
    }

    #[test]
    fn test_free_coalesces_and_folds_into_top() {
        let mut page = empty_page(2, 1024, PageType::TableLeaf);
        page.allocate_space(10).unwrap();
        page.allocate_space(10).unwrap();
        page.allocate_space(10).unwrap();
        page.free_space(1004, 10).unwrap();
        assert_eq!(page.free_blocks().unwrap(), vec![(1004, 10)]);
        assert_eq!(page.cell_content_area().unwrap(), 994);

        page.free_space(994, 10).unwrap();
        assert!(page.free_blocks().unwrap().is_empty());
        assert_eq!(page.cell_content_area().unwrap(), 1014);
    }

    #[test]
    fn test_free_absorbs_small_gap_into_fragment_count() {
        let mut page = empty_page(2, 1024, PageType::TableLeaf);
        page.allocate_space(10).unwrap(); // 1014
        page.allocate_space(2).unwrap(); // 1012, becomes a fragment
        page.allocate_space(10).unwrap(); // 1002
        page.allocate_space(8).unwrap(); // 994, keeps the top in place
        page.data_mut()
            .write_u8(offset::BTREE_FRAGMENTED_BYTES_COUNT, 2)
            .unwrap();
        page.free_space(1014, 10).unwrap();
        page.free_space(1002, 10).unwrap();
        assert_eq!(page.free_blocks().unwrap(), vec![(1002, 22)]);
        assert_eq!(page.num_frag_free_bytes().unwrap(), 0);
    }

    #[test]
    fn test_first_fit_with_small_leftover_becomes_fragment() {
        let mut page = empty_page(2, 1024, PageType::TableLeaf);
        page.allocate_space(10).unwrap(); // 1014
        page.allocate_space(4).unwrap(); // 1010
        page.free_space(1014, 10).unwrap();

        assert_eq!(page.allocate_space(8).unwrap(), 1016);
        assert!(page.free_blocks().unwrap().is_empty());
        assert_eq!(page.num_frag_free_bytes().unwrap(), 2);
    }

    #[test]
    fn test_first_fit_splits_large_block() {
        let mut page = empty_page(2, 1024, PageType::TableLeaf);
        page.allocate_space(10).unwrap(); // 1014
        page.allocate_space(4).unwrap(); // 1010
        page.free_space(1014, 10).unwrap();

        assert_eq!(page.allocate_space(4).unwrap(), 1020);
        assert_eq!(page.free_blocks().unwrap(), vec![(1014, 6)]);
        assert_eq!(page.num_frag_free_bytes().unwrap(), 0);
    }

    #[test]
    fn test_free_rejects_chain_pointing_backwards() {
        let mut page = empty_page(2, 1024, PageType::TableLeaf);
        page.allocate_space(100).unwrap();
        let data = page.data_mut();
        data.write_u16(offset::BTREE_FIRST_FREEBLOCK, 950).unwrap();
        data.write_u16(950, 940).unwrap();
        data.write_u16(952, 8).unwrap();
        data.write_u16(940, 0).unwrap();
        data.write_u16(942, 8).unwrap();
        assert!(page.free_space(1000, 8).unwrap_err().is_corrupt());
    }

    #[test]
    fn test_double_free_is_rejected_before_mutation() {
        let mut page = empty_page(2, 1024, PageType::TableLeaf);
        page.allocate_space(10).unwrap(); // 1014
        page.allocate_space(10).unwrap(); // 1004
        page.allocate_space(10).unwrap(); // 994
        page.free_space(1004, 10).unwrap();
        let before = page.data().to_vec();
        let n_free = page.n_free();

        assert!(page.free_space(1004, 10).unwrap_err().is_corrupt());
        assert!(page.free_space(1008, 4).unwrap_err().is_corrupt());
        assert!(page.free_space(1000, 8).unwrap_err().is_corrupt());
        assert_eq!(page.data(), before.as_slice());
        assert_eq!(page.n_free(), n_free);
    }

    #[test]
    fn test_defragment_packs_cells_at_end() {
        let mut tree = TestTree::new(1024);
        let mut page = tree.new_page(PageType::TableLeaf);
        let cells: Vec<Vec<u8>> = (0..4).map(|i| table_leaf_cell(i, &[i as u8; 30])).collect();
        for (i, cell) in cells.iter().enumerate() {
            page.insert_cell(&mut tree.bt, i, cell, None).unwrap();
        }
        let size = cells[1].len();
        page.drop_cell(1, size).unwrap();
        assert_eq!(page.free_blocks().unwrap().len(), 1);
        let n_free = page.n_free();

        page.defragment_page().unwrap();
        assert!(page.free_blocks().unwrap().is_empty());
        assert_eq!(page.num_frag_free_bytes().unwrap(), 0);
        assert_eq!(page.n_free(), n_free);
        assert_eq!(page.cell_content_area().unwrap(), 1024 - 3 * size);
        for (i, expected) in [&cells[0], &cells[2], &cells[3]].into_iter().enumerate() {
            assert_eq!(&page.find_cell(i).unwrap()[..size], expected.as_slice());
        }
        tree.release(page);
    }

    #[test]
    fn test_fragmentation_threshold_forces_defragment() {
        let mut tree = TestTree::new(1024);
        let mut page = tree.new_page(PageType::TableLeaf);
        let cell = table_leaf_cell(1, &[7; 20]);
        page.insert_cell(&mut tree.bt, 0, &cell, None).unwrap();
        // pretend 60 bytes below the cell are lost to fragmentation
        let top = page.cell_content_area().unwrap();
        let data = page.data_mut();
        data.write_u16(offset::BTREE_CELL_CONTENT_AREA, (top - 60) as u16)
            .unwrap();
        data.write_u8(offset::BTREE_FRAGMENTED_BYTES_COUNT, 60).unwrap();

        let at = page.allocate_space(8).unwrap();
        assert_eq!(at, 1024 - cell.len() - 8);
        assert_eq!(page.num_frag_free_bytes().unwrap(), 0);
        tree.release(page);
    }
}
