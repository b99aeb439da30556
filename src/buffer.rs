//! Append-only byte arena used to assemble one outgoing command.
//!
//! Every write returns the logical offset at which it landed, measured from the start of the
//! buffer. Offsets stay valid for the lifetime of the buffer because nothing is ever removed or
//! moved; the only in-place write allowed is [`BinaryBuffer::overwrite`] over a region that was
//! already reserved (typically a header placeholder written with
//! [`BinaryBuffer::append_zero`]).
//!
//! # Example
//! ```rust
//! use xpulink::buffer::BinaryBuffer;
//!
//! let mut buf = BinaryBuffer::new();
//! let header = buf.append_zero(8).unwrap();
//! let blob = buf.append(b"hello").unwrap();
//!
//! assert_eq!(header, 0);
//! assert_eq!(blob, 8);
//! buf.overwrite(header, &[1; 8]).unwrap();
//! assert_eq!(&buf.as_slice()[..8], &[1; 8]);
//! ```
use std::num::NonZeroU32;

use thiserror::Error;

/// Size of the length prefix written by [`BinaryBuffer::append_sized`].
pub const SIZE_PREFIX: usize = size_of::<u32>();

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer would grow to {len} bytes, beyond the addressable offset range")]
    Overflow { len: usize },

    #[error("overwrite of {len} bytes at offset {offset} is outside the written region ({size} bytes)")]
    OutOfBounds { offset: u32, len: usize, size: usize },
}

/// A byte position inside a [`BinaryBuffer`], or nothing.
///
/// Zero is never a valid position for a blob because every buffer starts with its fixed header,
/// so on the wire `0` encodes "absent".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(Option<NonZeroU32>);

impl Offset {
    pub const ABSENT: Offset = Offset(None);

    /// Reads an offset field as stored on the wire.
    pub fn from_wire(raw: u32) -> Self {
        Self(NonZeroU32::new(raw))
    }

    pub fn to_wire(self) -> u32 {
        self.0.map_or(0, NonZeroU32::get)
    }

    pub fn get(self) -> Option<u32> {
        self.0.map(NonZeroU32::get)
    }

    pub fn is_absent(self) -> bool {
        self.0.is_none()
    }
}

impl From<Option<u32>> for Offset {
    fn from(value: Option<u32>) -> Self {
        Self::from_wire(value.unwrap_or(0))
    }
}

#[derive(Debug, Default, Clone)]
pub struct BinaryBuffer {
    data: Vec<u8>,
}

impl BinaryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
        }
    }

    /// Appends `bytes` and returns the offset of their first byte.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u32, BufferError> {
        let offset = self.reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(offset)
    }

    /// Reserves `n` zeroed bytes and returns their offset.
    pub fn append_zero(&mut self, n: usize) -> Result<u32, BufferError> {
        let offset = self.reserve(n)?;
        self.data.resize(self.data.len() + n, 0);
        Ok(offset)
    }

    /// Appends `bytes` preceded by a big-endian `u32` holding the total size, prefix included.
    pub fn append_sized(&mut self, bytes: &[u8]) -> Result<u32, BufferError> {
        let total = SIZE_PREFIX + bytes.len();
        let size = u32::try_from(total).map_err(|_| BufferError::Overflow {
            len: self.data.len() + total,
        })?;
        let offset = self.reserve(total)?;
        self.data.extend_from_slice(&size.to_be_bytes());
        self.data.extend_from_slice(bytes);
        Ok(offset)
    }

    /// Copies `bytes` over an already written region starting at `offset`.
    pub fn overwrite(&mut self, offset: u32, bytes: &[u8]) -> Result<(), BufferError> {
        let start = offset as usize;
        let end = start
            .checked_add(bytes.len())
            .filter(|end| *end <= self.data.len())
            .ok_or(BufferError::OutOfBounds {
                offset,
                len: bytes.len(),
                size: self.data.len(),
            })?;
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    // Offsets are u32 on the wire, so the whole buffer must stay addressable.
    fn reserve(&mut self, n: usize) -> Result<u32, BufferError> {
        let offset = self.data.len();
        let end = offset.checked_add(n).ok_or(BufferError::Overflow { len: usize::MAX })?;
        if end > u32::MAX as usize {
            return Err(BufferError::Overflow { len: end });
        }
        self.data.reserve(n);
        Ok(offset as u32)
    }
}

/// Reads a blob written by [`BinaryBuffer::append_sized`] at `offset`.
///
/// Returns `None` if the prefix or the blob it describes does not fit inside `data`.
pub fn read_sized(data: &[u8], offset: u32) -> Option<&[u8]> {
    let start = offset as usize;
    let prefix = data.get(start..start.checked_add(SIZE_PREFIX)?)?;
    let total = u32::from_be_bytes(prefix.try_into().ok()?) as usize;
    if total < SIZE_PREFIX {
        return None;
    }
    data.get(start + SIZE_PREFIX..start.checked_add(total)?)
}
