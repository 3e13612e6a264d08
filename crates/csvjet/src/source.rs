use std::io;

use bytes::Bytes;

use crate::errors::Result;

/// Default chunk size handed out by the in-memory source.
///
/// Small enough that multi-chunk behavior is exercised on realistic inputs.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Supplies successive byte chunks to a reader.
///
/// `Ok(None)` signals end of stream. The parser copies bytes out of the
/// returned chunk, so implementations may reuse their internal buffers.
pub trait ByteSource {
    fn read_chunk(&mut self) -> Result<Option<Bytes>>;
}

/// Byte source over an in-memory buffer, split into fixed-size chunks.
#[derive(Debug, Clone)]
pub struct SliceSource {
    data: Bytes,
    pos: usize,
    chunk_size: usize,
}

impl SliceSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        SliceSource {
            data: data.into(),
            pos: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    /// Override the chunk size. Mainly useful for exercising chunk-boundary
    /// handling in tests.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        assert_ne!(0, chunk_size);
        self.chunk_size = chunk_size;
        self
    }
}

impl ByteSource for SliceSource {
    fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let end = usize::min(self.pos + self.chunk_size, self.data.len());
        let chunk = self.data.slice(self.pos..end);
        self.pos = end;
        Ok(Some(chunk))
    }
}

impl From<&str> for SliceSource {
    fn from(s: &str) -> Self {
        SliceSource::new(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<&[u8]> for SliceSource {
    fn from(b: &[u8]) -> Self {
        SliceSource::new(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for SliceSource {
    fn from(b: Vec<u8>) -> Self {
        SliceSource::new(b)
    }
}

/// Byte source wrapping any `io::Read`.
#[derive(Debug)]
pub struct ReadSource<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: io::Read> ReadSource<R> {
    pub fn new(inner: R) -> Self {
        Self::with_buffer_size(inner, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_buffer_size(inner: R, size: usize) -> Self {
        assert_ne!(0, size);
        ReadSource {
            inner,
            buf: vec![0; size],
        }
    }
}

impl<R: io::Read> ByteSource for ReadSource<R> {
    fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.inner.read(&mut self.buf) {
                Ok(0) => return Ok(None),
                Ok(n) => return Ok(Some(Bytes::copy_from_slice(&self.buf[0..n]))),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}
