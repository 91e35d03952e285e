pub mod btree;
pub mod cell;
pub mod config;
pub mod freelist;
pub mod overflow;
pub mod page;
pub mod pager;
pub mod ptrmap;
pub mod shared;
mod space;
pub mod sqlite3_ondisk;

#[cfg(test)]
mod page_invariant_tests;
#[cfg(test)]
pub(crate) mod testing;

pub use btree::PageFlags;
pub use cell::CellInfo;
pub use config::BtreeConfig;
pub use overflow::CellContent;
pub use page::{MemPage, OverflowCell};
pub use pager::{DbPage, Pager, Pgno};
pub use ptrmap::PtrmapType;
pub use shared::BtShared;
pub use sqlite3_ondisk::PageType;
