//! Byte buffers backing pages and the in-memory pager backend.

pub mod buffer;
pub mod memory;

pub use buffer::Buffer;
pub use memory::MemoryPager;
