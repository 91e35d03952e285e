//! Building cells whose payload spills onto overflow pages, and tearing the
//! overflow chain down again.
//!
//! An overflow page is `[next pgno:4][payload]`; the last page in a chain
//! has a next pointer of 0.

use tracing::{debug, warn};

use crate::{
    bail_corrupt_error,
    storage::{
        cell::MIN_CELL_SIZE,
        page::MemPage,
        pager::{DbPage, Pager, Pgno},
        ptrmap::PtrmapType,
        shared::BtShared,
        sqlite3_ondisk::{write_varint_to_vec, PageView},
    },
    Result,
};

/// What goes into a new cell.
#[derive(Debug, Clone, Copy)]
pub enum CellContent<'a> {
    /// Table b-tree entry. `n_zero` zero bytes follow `data` in the payload.
    /// Interior table pages store the rowid only.
    Table {
        rowid: i64,
        data: &'a [u8],
        n_zero: u32,
    },
    /// Index b-tree entry; the key is the whole payload.
    Index { key: &'a [u8] },
}

/// Streams payload bytes: the source slice, then zero padding.
struct PayloadSource<'a> {
    data: &'a [u8],
}

impl PayloadSource<'_> {
    fn fill(&mut self, out: &mut [u8]) {
        let n = out.len().min(self.data.len());
        out[..n].copy_from_slice(&self.data[..n]);
        out[n..].fill(0);
        self.data = &self.data[n..];
    }
}

impl MemPage {
    /// Build the cell for `content` into `cell` and return its size.
    ///
    /// Payload that does not fit locally is written to freshly allocated
    /// overflow pages. If an allocation fails every page this call still
    /// holds is released, `cell` is cleared and the error is returned. A
    /// pointer-map entry already written for the first overflow page stays.
    pub fn fill_in_cell<P: Pager>(
        &self,
        bt: &mut BtShared<P>,
        cell: &mut Vec<u8>,
        content: CellContent<'_>,
    ) -> Result<usize> {
        cell.clear();
        if !self.leaf {
            cell.extend_from_slice(&[0; 4]);
        }
        let (key, source) = match content {
            CellContent::Table {
                rowid,
                data,
                n_zero,
            } => {
                if !self.int_key {
                    bail_corrupt_error!("page {}: table cell built for an index page", self.pgno());
                }
                if self.has_data {
                    write_varint_to_vec(data.len() as u64 + n_zero as u64, cell);
                }
                (rowid as u64, data)
            }
            CellContent::Index { key } => {
                if self.int_key {
                    bail_corrupt_error!("page {}: index cell built for a table page", self.pgno());
                }
                (key.len() as u64, key)
            }
        };
        write_varint_to_vec(key, cell);

        let info = self.parse_cell_bytes(cell)?;
        debug_assert_eq!(info.header_len, cell.len());
        let mut source = PayloadSource { data: source };

        let header_len = cell.len();
        cell.resize(header_len + info.local_len, 0);
        source.fill(&mut cell[header_len..]);
        if !info.has_overflow() {
            cell.resize(cell.len().max(MIN_CELL_SIZE), 0);
            debug_assert_eq!(cell.len(), info.size);
            return Ok(info.size);
        }

        cell.extend_from_slice(&[0; 4]);
        let mut remaining = info.payload_len as usize - info.local_len;
        let usable_payload = bt.config().overflow_page_payload();
        let auto_vacuum = bt.config().auto_vacuum;
        let mut prior: Option<DbPage> = None;
        let mut pgno_ovfl: Pgno = 0;
        while remaining > 0 {
            let ptrmap_parent = pgno_ovfl;
            let mut nearby = pgno_ovfl;
            if auto_vacuum {
                nearby += 1;
                while bt.is_reserved_page(nearby) {
                    nearby += 1;
                }
            }
            let mut page = match bt.allocate_page(nearby) {
                Ok(page) => page,
                Err(e) => {
                    warn!(pgno = self.pgno(), error = %e, "overflow page allocation failed");
                    if let Some(prior) = prior.take() {
                        bt.release(prior);
                    }
                    cell.clear();
                    return Err(e);
                }
            };
            let pgno = page.pgno();
            if auto_vacuum {
                let ptr_type = if ptrmap_parent == 0 {
                    PtrmapType::Overflow1
                } else {
                    PtrmapType::Overflow2
                };
                if let Err(e) = bt.ptrmap_put(pgno, ptr_type, ptrmap_parent) {
                    bt.release(page);
                    if let Some(prior) = prior.take() {
                        bt.release(prior);
                    }
                    cell.clear();
                    return Err(e);
                }
            }

            let link = pgno.to_be_bytes();
            match prior.take() {
                Some(mut prior) => {
                    prior.data_mut()[..4].copy_from_slice(&link);
                    bt.release(prior);
                }
                None => {
                    cell[info.overflow_offset..info.overflow_offset + 4].copy_from_slice(&link)
                }
            }
            let n = remaining.min(usable_payload);
            let data = page.data_mut();
            data[..4].fill(0);
            source.fill(&mut data[4..4 + n]);
            remaining -= n;
            debug!(pgno, parent = ptrmap_parent, bytes = n, "overflow page");
            pgno_ovfl = pgno;
            prior = Some(page);
        }
        if let Some(prior) = prior {
            bt.release(prior);
        }
        debug_assert_eq!(cell.len(), info.size);
        Ok(info.size)
    }

    /// Free the overflow chain of `cell`, if it has one.
    pub fn clear_cell<P: Pager>(&self, bt: &mut BtShared<P>, cell: &[u8]) -> Result<()> {
        let info = self.parse_cell_bytes(cell)?;
        if !info.has_overflow() {
            return Ok(());
        }
        let mut ovfl_pgno = cell.read_u32(info.overflow_offset)?;
        let usable_payload = bt.config().overflow_page_payload();
        let mut n_ovfl = (info.payload_len as usize - info.local_len).div_ceil(usable_payload);
        debug_assert!(ovfl_pgno == 0 || n_ovfl > 0);
        debug!(pgno = self.pgno(), first = ovfl_pgno, pages = n_ovfl, "clear overflow chain");

        while n_ovfl > 0 {
            n_ovfl -= 1;
            if ovfl_pgno < 2 || ovfl_pgno > bt.page_count() {
                warn!(pgno = self.pgno(), ovfl_pgno, "overflow chain leaves the file");
                bail_corrupt_error!("overflow page number {ovfl_pgno} out of range");
            }
            let mut page = bt.get_mem_page(ovfl_pgno)?;
            let next = if n_ovfl == 0 {
                Ok(0)
            } else {
                page.data().read_u32(0)
            };
            let result = next.and_then(|next| page.free_page(bt).map(|()| next));
            bt.release_page(page);
            ovfl_pgno = result?;
        }
        Ok(())
    }

    /// Free the overflow chain of cell `i`.
    pub fn clear_cell_at<P: Pager>(&self, bt: &mut BtShared<P>, i: usize) -> Result<()> {
        self.clear_cell(bt, self.find_cell(i)?)
    }
}
