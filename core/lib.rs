use crate::error::BtPageError;

pub mod error;
pub mod io;
pub mod storage;

pub use io::{Buffer, MemoryPager};
pub use storage::{
    BtShared, BtreeConfig, CellContent, CellInfo, DbPage, MemPage, OverflowCell, PageFlags,
    PageType, Pager, Pgno, PtrmapType,
};

pub type Result<T, E = BtPageError> = std::result::Result<T, E>;
