use std::fmt;

/// Fixed-size byte buffer holding one page image.
///
/// The length never changes after construction: page-level code indexes into
/// it with page-relative offsets and relies on the size staying put.
pub enum Buffer {
    Heap(Box<[u8]>),
}

impl Buffer {
    /// create a new buffer from a vector
    pub fn new(data: Vec<u8>) -> Self {
        Self::Heap(data.into_boxed_slice())
    }

    pub fn new_zeroed(size: usize) -> Self {
        Self::Heap(vec![0; size].into_boxed_slice())
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Heap(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Self::Heap(buf) => buf,
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Self::Heap(buf) => buf,
        }
    }

    pub fn fill(&mut self, value: u8) {
        self.as_mut_slice().fill(value);
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Self {
        Self::new(self.as_slice().to_vec())
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Heap(buf) => write!(f, "Heap(len={})", buf.len()),
        }
    }
}
