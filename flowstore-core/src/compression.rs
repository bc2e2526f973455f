/*!
Compression framing for the flow document.

The primary document is stored as a gzip stream. Adapters here wrap the file
handles used by the store so bytes are compressed on the way in and
decompressed on the way out without buffering the whole document. A raw
passthrough adapter exists for callers that already hold framed bytes.
*/

use flate2::{read::MultiGzDecoder, write::GzEncoder, Compression};
use std::io::{self, Read, Write};

use crate::{FlowStoreError, Result};

/// A writer that must be explicitly finished to complete its framing
///
/// Dropping a gzip encoder writes the trailer but discards any error doing
/// so. `finish` reports it.
pub trait FinishWrite: Write {
    /// Complete the framing and flush the underlying writer
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Compression abstraction for the flow document stream
pub trait CompressionAdapter: Send + Sync {
    /// Wrap a raw output so that bytes written to it are compressed
    fn wrap_for_write<'a>(&self, inner: Box<dyn Write + 'a>) -> Box<dyn FinishWrite + 'a>;

    /// Wrap a compressed input so that reads yield decompressed bytes
    fn wrap_for_read<'a>(&self, inner: Box<dyn Read + 'a>) -> Box<dyn Read + 'a>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;

    /// Compress an in-memory buffer
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut compressed = Vec::new();
        let mut writer = self.wrap_for_write(Box::new(&mut compressed));
        writer
            .write_all(data)
            .map_err(|e| FlowStoreError::compression(format!("Failed to write data for compression: {e}")))?;
        writer
            .finish()
            .map_err(|e| FlowStoreError::compression(format!("Failed to finish compression: {e}")))?;
        Ok(compressed)
    }

    /// Decompress an in-memory buffer
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut reader = self.wrap_for_read(Box::new(compressed_data));
        let mut decompressed = Vec::new();
        reader
            .read_to_end(&mut decompressed)
            .map_err(|e| FlowStoreError::compression(format!("Failed to decompress data: {e}")))?;
        Ok(decompressed)
    }
}

impl<W: Write> FinishWrite for GzEncoder<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut inner = GzEncoder::finish(*self)?;
        inner.flush()
    }
}

/// Gzip compression adapter
///
/// # Example
/// ```rust
/// use flowstore_core::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::new();
/// let compressed = compressor.compress(b"<flow/>")?;
/// assert_eq!(compressor.decompress(&compressed)?, b"<flow/>");
/// # Ok::<(), flowstore_core::FlowStoreError>(())
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a new gzip compressor with the specified compression level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level),
        }
    }

    /// Create a compressor for fast compression (level 1)
    pub fn fast() -> Self {
        Self::with_level(1)
    }

    /// Create a compressor for maximum compression (level 9)
    pub fn max() -> Self {
        Self::with_level(9)
    }

    pub fn level(&self) -> u32 {
        self.compression_level.level()
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn wrap_for_write<'a>(&self, inner: Box<dyn Write + 'a>) -> Box<dyn FinishWrite + 'a> {
        Box::new(GzEncoder::new(inner, self.compression_level))
    }

    fn wrap_for_read<'a>(&self, inner: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
        Box::new(MultiGzDecoder::new(inner))
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Writer that forwards bytes untouched
pub struct PassThrough<W: Write>(W);

impl<W: Write> Write for PassThrough<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> FinishWrite for PassThrough<W> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let mut inner = self.0;
        inner.flush()
    }
}

/// Raw passthrough adapter
///
/// Used for raw-mode loads and saves, where the caller hands over (or asks
/// for) the bytes exactly as they sit on disk.
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl NoCompression {
    pub fn new() -> Self {
        Self
    }
}

impl CompressionAdapter for NoCompression {
    fn wrap_for_write<'a>(&self, inner: Box<dyn Write + 'a>) -> Box<dyn FinishWrite + 'a> {
        Box::new(PassThrough(inner))
    }

    fn wrap_for_read<'a>(&self, inner: Box<dyn Read + 'a>) -> Box<dyn Read + 'a> {
        inner
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}
