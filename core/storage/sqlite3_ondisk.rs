//! On-disk primitives of the SQLite file format that the page layer needs:
//! page size encoding, page types, varints and bounds-checked byte access.
//!
//! ```text
//! +-----------------+----------------+---------------------+----------------+
//! |                 |                |                     |                |
//! |   Page header   |  Cell pointer  |     Unallocated     |  Cell content  |
//! | (8 or 12 bytes) |     array      |        space        |      area      |
//! |                 |                |                     |                |
//! +-----------------+----------------+---------------------+----------------+
//! ```
//!
//! File format: https://www.sqlite.org/fileformat.html

use pack1::U16BE;

use crate::{bail_corrupt_error, error::BtPageError, storage::btree::PageFlags, Result};

pub const CELL_PTR_SIZE_BYTES: usize = 2;
pub const INTERIOR_PAGE_HEADER_SIZE_BYTES: usize = 12;
pub const LEAF_PAGE_HEADER_SIZE_BYTES: usize = 8;

/// Size of the database file header that prefixes page 1.
pub const DATABASE_HEADER_SIZE: usize = 100;

/// Offsets into the 100-byte database header on page 1.
pub mod header_offset {
    pub const PAGE_SIZE: usize = 16;
    pub const RESERVED_SPACE: usize = 20;
    pub const FIRST_FREELIST_TRUNK: usize = 32;
    pub const FREELIST_PAGE_COUNT: usize = 36;
    pub const LARGEST_ROOT_PAGE: usize = 52;
}

/// Byte offset of the lock byte range. The page holding it is never used.
pub const PENDING_BYTE: u32 = 0x4000_0000;

pub struct PageSize(U16BE);

impl PageSize {
    pub const MIN: u32 = 512;
    pub const MAX: u32 = 32768;
    pub const DEFAULT: u16 = 4096;

    pub const fn new(size: u32) -> Option<Self> {
        if size < PageSize::MIN || size > PageSize::MAX {
            return None;
        }

        // Page size must be power of 2
        if size.count_ones() != 1 {
            return None;
        }

        Some(Self(U16BE::new(size as u16)))
    }

    pub fn new_from_header_u16(value: u16) -> Result<Self> {
        match value {
            // 1 encodes 65536, which this layer does not support
            1 => bail_corrupt_error!("unsupported page size in database header: 65536"),
            n => {
                let Some(size) = Self::new(n as u32) else {
                    bail_corrupt_error!("invalid page size in database header: {n}")
                };
                Ok(size)
            }
        }
    }

    pub const fn get(self) -> u32 {
        self.0.get() as u32
    }

    pub const fn get_raw(self) -> u16 {
        self.0.get()
    }
}

impl Default for PageSize {
    fn default() -> Self {
        Self(U16BE::new(Self::DEFAULT))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    IndexInterior = 2,
    TableInterior = 5,
    IndexLeaf = 10,
    TableLeaf = 13,
}

impl PageType {
    pub fn is_table(&self) -> bool {
        match self {
            PageType::IndexInterior | PageType::IndexLeaf => false,
            PageType::TableInterior | PageType::TableLeaf => true,
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, PageType::IndexLeaf | PageType::TableLeaf)
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_retain(self as u8)
    }

    pub fn header_size(self) -> usize {
        if self.is_leaf() {
            LEAF_PAGE_HEADER_SIZE_BYTES
        } else {
            INTERIOR_PAGE_HEADER_SIZE_BYTES
        }
    }
}

impl TryFrom<u8> for PageType {
    type Error = BtPageError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            2 => Ok(Self::IndexInterior),
            5 => Ok(Self::TableInterior),
            10 => Ok(Self::IndexLeaf),
            13 => Ok(Self::TableLeaf),
            _ => Err(BtPageError::Corrupt(format!("Invalid page type: {value}"))),
        }
    }
}

/// Bounds-checked big-endian reads at page-relative offsets.
///
/// Every structural algorithm goes through these accessors, so an offset
/// taken from a corrupt page surfaces as `Corrupt` instead of a panic.
pub trait PageView {
    fn read_u8(&self, pos: usize) -> Result<u8>;
    fn read_u16(&self, pos: usize) -> Result<u16>;
    fn read_u32(&self, pos: usize) -> Result<u32>;
    /// Returns the decoded value and the number of bytes it occupied.
    fn read_varint(&self, pos: usize) -> Result<(u64, usize)>;
}

pub trait PageViewMut: PageView {
    fn write_u8(&mut self, pos: usize, value: u8) -> Result<()>;
    fn write_u16(&mut self, pos: usize, value: u16) -> Result<()>;
    fn write_u32(&mut self, pos: usize, value: u32) -> Result<()>;
    /// Returns the number of bytes written.
    fn write_varint(&mut self, pos: usize, value: u64) -> Result<usize>;
}

fn bytes_at<const N: usize>(buf: &[u8], pos: usize) -> Result<[u8; N]> {
    match pos.checked_add(N).and_then(|end| buf.get(pos..end)) {
        Some(bytes) => {
            let mut out = [0u8; N];
            out.copy_from_slice(bytes);
            Ok(out)
        }
        None => bail_corrupt_error!("read of {N} bytes at offset {pos} past end of page ({})", buf.len()),
    }
}

fn bytes_at_mut<const N: usize>(buf: &mut [u8], pos: usize) -> Result<&mut [u8]> {
    let len = buf.len();
    match pos.checked_add(N).and_then(|end| buf.get_mut(pos..end)) {
        Some(bytes) => Ok(bytes),
        None => bail_corrupt_error!("write of {N} bytes at offset {pos} past end of page ({len})"),
    }
}

impl PageView for [u8] {
    fn read_u8(&self, pos: usize) -> Result<u8> {
        Ok(bytes_at::<1>(self, pos)?[0])
    }

    fn read_u16(&self, pos: usize) -> Result<u16> {
        Ok(u16::from_be_bytes(bytes_at(self, pos)?))
    }

    fn read_u32(&self, pos: usize) -> Result<u32> {
        Ok(u32::from_be_bytes(bytes_at(self, pos)?))
    }

    fn read_varint(&self, pos: usize) -> Result<(u64, usize)> {
        match self.get(pos..) {
            Some(rest) => read_varint(rest),
            None => bail_corrupt_error!("varint at offset {pos} past end of page ({})", self.len()),
        }
    }
}

impl PageViewMut for [u8] {
    fn write_u8(&mut self, pos: usize, value: u8) -> Result<()> {
        bytes_at_mut::<1>(self, pos)?[0] = value;
        Ok(())
    }

    fn write_u16(&mut self, pos: usize, value: u16) -> Result<()> {
        bytes_at_mut::<2>(self, pos)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn write_u32(&mut self, pos: usize, value: u32) -> Result<()> {
        bytes_at_mut::<4>(self, pos)?.copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn write_varint(&mut self, pos: usize, value: u64) -> Result<usize> {
        let len = varint_len(value);
        let end = pos.saturating_add(len);
        if end > self.len() {
            bail_corrupt_error!("varint of {len} bytes at offset {pos} past end of page ({})", self.len());
        }
        Ok(write_varint(&mut self[pos..end], value))
    }
}

/// Decode a varint: up to eight 7-bit groups with the high bit as a
/// continuation flag, then an optional ninth byte contributing all 8 bits.
pub fn read_varint(buf: &[u8]) -> Result<(u64, usize)> {
    let mut v: u64 = 0;
    for i in 0..8 {
        match buf.get(i) {
            Some(c) => {
                v = (v << 7) | (c & 0x7f) as u64;
                if (c & 0x80) == 0 {
                    return Ok((v, i + 1));
                }
            }
            None => bail_corrupt_error!("Invalid varint"),
        }
    }
    match buf.get(8) {
        Some(&c) => Ok(((v << 8) | c as u64, 9)),
        None => bail_corrupt_error!("Invalid varint"),
    }
}

pub fn varint_len(value: u64) -> usize {
    if value & 0xff00_0000_0000_0000 != 0 {
        return 9;
    }
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Encode `value` at the start of `buf`, which must hold `varint_len(value)` bytes.
pub fn write_varint(buf: &mut [u8], value: u64) -> usize {
    let len = varint_len(value);
    if len == 9 {
        buf[8] = value as u8;
        let mut v = value >> 8;
        for i in (0..8).rev() {
            buf[i] = ((v & 0x7f) | 0x80) as u8;
            v >>= 7;
        }
        return 9;
    }

    let mut v = value;
    for i in (0..len).rev() {
        let continuation = if i == len - 1 { 0 } else { 0x80 };
        buf[i] = ((v & 0x7f) as u8) | continuation;
        v >>= 7;
    }
    len
}

pub fn write_varint_to_vec(value: u64, payload: &mut Vec<u8>) {
    let mut varint = [0u8; 9];
    let n = write_varint(&mut varint, value);
    payload.extend_from_slice(&varint[0..n]);
}
