//! Pointer map: under auto-vacuum, every page past page 2 has a 5-byte
//! entry `[type:1][parent:4]` on a pointer-map page recording what points
//! at it, so pages can be relocated.
//!
//! Pointer-map pages recur every `usable_size / 5 + 1` pages starting at
//! page 2; the pending-byte page is skipped.

use tracing::warn;

use crate::{
    bail_corrupt_error,
    error::BtPageError,
    storage::{
        btree::offset,
        config::BtreeConfig,
        page::MemPage,
        pager::{Pager, Pgno},
        shared::BtShared,
        sqlite3_ondisk::{PageView, PageViewMut},
    },
    Result,
};

pub const PTRMAP_ENTRY_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PtrmapType {
    /// Root page of a b-tree; parent is 0.
    RootPage = 1,
    /// Page on the freelist; parent is 0.
    FreePage = 2,
    /// First page of an overflow chain; parent is the b-tree page of the cell.
    Overflow1 = 3,
    /// Later page of an overflow chain; parent is the previous overflow page.
    Overflow2 = 4,
    /// Non-root b-tree page; parent is the parent b-tree page.
    Btree = 5,
}

impl TryFrom<u8> for PtrmapType {
    type Error = BtPageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::RootPage),
            2 => Ok(Self::FreePage),
            3 => Ok(Self::Overflow1),
            4 => Ok(Self::Overflow2),
            5 => Ok(Self::Btree),
            _ => Err(BtPageError::Corrupt(format!("invalid pointer-map entry type: {value}"))),
        }
    }
}

/// Pointer-map page that holds the entry for `pgno`. 0 for page 1.
pub fn ptrmap_pageno(config: &BtreeConfig, pgno: Pgno) -> Pgno {
    if pgno < 2 {
        return 0;
    }
    let pages_per_map = config.usable_size / PTRMAP_ENTRY_SIZE as u32 + 1;
    let map_index = (pgno - 2) / pages_per_map;
    let ret = map_index * pages_per_map + 2;
    if ret == config.pending_byte_page() {
        ret + 1
    } else {
        ret
    }
}

pub fn is_ptrmap_page(config: &BtreeConfig, pgno: Pgno) -> bool {
    pgno >= 2 && ptrmap_pageno(config, pgno) == pgno
}

/// Byte offset of the entry for `pgno` on pointer-map page `ptrmap`.
pub fn ptrmap_offset(ptrmap: Pgno, pgno: Pgno) -> Result<usize> {
    if pgno <= ptrmap {
        bail_corrupt_error!("page {pgno} has no entry on pointer-map page {ptrmap}");
    }
    Ok(PTRMAP_ENTRY_SIZE * (pgno - ptrmap - 1) as usize)
}

impl<P: Pager> BtShared<P> {
    /// Record that `key` is referenced from `parent` as `ptr_type`.
    /// A no-op unless auto-vacuum is on.
    pub fn ptrmap_put(&mut self, key: Pgno, ptr_type: PtrmapType, parent: Pgno) -> Result<()> {
        if !self.config().auto_vacuum {
            return Ok(());
        }
        if key == 0 {
            bail_corrupt_error!("pointer-map entry for page 0");
        }
        let map = ptrmap_pageno(self.config(), key);
        let mut page = self.get_page(map)?;
        let result = ptrmap_offset(map, key).and_then(|pos| {
            let data = page.data();
            let current_type = data.read_u8(pos)?;
            let current_parent = data.read_u32(pos + 1)?;
            if current_type != ptr_type as u8 || current_parent != parent {
                self.make_writeable(&mut page)?;
                let data = page.data_mut();
                data.write_u8(pos, ptr_type as u8)?;
                data.write_u32(pos + 1, parent)?;
            }
            Ok(())
        });
        self.release(page);
        result
    }

    /// Read the entry for `key`, or `None` when auto-vacuum is off.
    pub fn ptrmap_get(&mut self, key: Pgno) -> Result<Option<(PtrmapType, Pgno)>> {
        if !self.config().auto_vacuum {
            return Ok(None);
        }
        let map = ptrmap_pageno(self.config(), key);
        let page = self.get_page(map)?;
        let result = ptrmap_offset(map, key).and_then(|pos| {
            let data = page.data();
            let ptr_type = PtrmapType::try_from(data.read_u8(pos)?)?;
            Ok(Some((ptr_type, data.read_u32(pos + 1)?)))
        });
        self.release(page);
        result
    }
}

impl MemPage {
    /// Register the overflow chain of `cell`, if any, as owned by this page.
    pub fn ptrmap_put_ovfl_ptr<P: Pager>(&self, bt: &mut BtShared<P>, cell: &[u8]) -> Result<()> {
        let info = self.parse_cell_bytes(cell)?;
        if info.has_overflow() {
            let ovfl = cell.read_u32(info.overflow_offset)?;
            bt.ptrmap_put(ovfl, PtrmapType::Overflow1, self.pgno())?;
        }
        Ok(())
    }

    /// Same as [`MemPage::ptrmap_put_ovfl_ptr`] for cell `i`, staged cells included.
    pub fn ptrmap_put_ovfl<P: Pager>(&self, bt: &mut BtShared<P>, i: usize) -> Result<()> {
        self.ptrmap_put_ovfl_ptr(bt, self.find_overflow_cell(i)?)
    }

    /// Point the pointer-map entries of every child and overflow chain
    /// referenced from this page back at this page.
    pub fn set_child_ptrmaps<P: Pager>(&mut self, bt: &mut BtShared<P>) -> Result<()> {
        let was_init = self.is_init;
        let result = self.init_page().and_then(|()| {
            let pgno = self.pgno();
            for i in 0..self.n_cell {
                let cell = self.find_cell(i)?;
                self.ptrmap_put_ovfl_ptr(bt, cell)?;
                if !self.leaf {
                    bt.ptrmap_put(cell.read_u32(0)?, PtrmapType::Btree, pgno)?;
                }
            }
            if let Some(right) = self.rightmost_pointer()? {
                bt.ptrmap_put(right, PtrmapType::Btree, pgno)?;
            }
            Ok(())
        });
        if result.is_err() {
            self.is_init = was_init;
        }
        result
    }

    /// Rewrite the pointer on this page that refers to page `from` so that it
    /// refers to `to`. `ptr_type` says where the pointer lives: the first
    /// four bytes of an overflow page, a cell's overflow field, or a child
    /// pointer.
    pub fn modify_page_pointer(&mut self, from: Pgno, to: Pgno, ptr_type: PtrmapType) -> Result<()> {
        debug_assert!(self.page.is_writeable());
        if ptr_type == PtrmapType::Overflow2 {
            if self.data().read_u32(0)? != from {
                bail_corrupt_error!("overflow page {} does not link to {from}", self.pgno());
            }
            return self.data_mut().write_u32(0, to);
        }

        let was_init = self.is_init;
        let result = self.init_page().and_then(|()| self.rewrite_child_pointer(from, to, ptr_type));
        self.is_init = was_init;
        result
    }

    fn rewrite_child_pointer(&mut self, from: Pgno, to: Pgno, ptr_type: PtrmapType) -> Result<()> {
        for i in 0..self.n_cell {
            let pc = self.find_cell_offset(i)?;
            let cell = self.find_cell(i)?;
            let field = if ptr_type == PtrmapType::Overflow1 {
                let info = self.parse_cell_bytes(cell)?;
                info.has_overflow().then_some(info.overflow_offset)
            } else {
                Some(0)
            };
            if let Some(field) = field {
                if cell.read_u32(field)? == from {
                    return self.data_mut().write_u32(pc + field, to);
                }
            }
        }
        let right = self.hdr_offset() + offset::BTREE_RIGHTMOST_PTR;
        if ptr_type != PtrmapType::Btree || self.leaf || self.data().read_u32(right)? != from {
            warn!(pgno = self.pgno(), from, "no pointer to relocated page");
            bail_corrupt_error!("page {} holds no pointer to page {from}", self.pgno());
        }
        self.data_mut().write_u32(right, to)
    }
}
