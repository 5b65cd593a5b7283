//! Streaming decoders: codec support, line-delimited records, raw blocks

use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::core::error::Error;
use crate::core::types::Result;

/// Compression codec of a fetched payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Lz4,
    Gzip,
    Zstd,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Lz4 => "lz4",
            Codec::Gzip => "gzip",
            Codec::Zstd => "zstd",
        }
    }
}

/// Whether this runtime can decode the codec. Callers must check before
/// requesting a compressed variant and fall back to uncompressed data
/// when unsupported.
pub fn is_supported(codec: Codec) -> bool {
    matches!(codec, Codec::Lz4)
}

/// Decompress a whole size-prepended payload.
pub fn decompress(codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::Decode(format!("lz4: {}", e))),
        other => Err(Error::UnsupportedCodec(other.name())),
    }
}

/// Compress a payload with a supported codec (used by tooling and tests).
pub fn compress(codec: Codec, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        Codec::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        other => Err(Error::UnsupportedCodec(other.name())),
    }
}

/// Incremental decoder for line-delimited JSON records.
///
/// Feed byte blocks as they arrive; complete lines are decoded and
/// emitted immediately. A malformed line is skipped (and counted), never
/// aborting the stream.
pub struct LineDecoder<T> {
    buf: Vec<u8>,
    decoded: usize,
    skipped: usize,
    _record: PhantomData<T>,
}

impl<T: DeserializeOwned> LineDecoder<T> {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            decoded: 0,
            skipped: 0,
            _record: PhantomData,
        }
    }

    /// Records successfully decoded so far.
    pub fn decoded(&self) -> usize {
        self.decoded
    }

    /// Malformed records skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Feed one block; emit every record completed by it.
    pub fn push(&mut self, block: &[u8], mut emit: impl FnMut(T)) {
        self.buf.extend_from_slice(block);

        let mut start = 0;
        while let Some(nl) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + nl;
            self.decode_line_range(start, end, &mut emit);
            start = end + 1;
        }
        self.buf.drain(..start);
    }

    /// Flush the trailing unterminated line, if any.
    pub fn finish(&mut self, mut emit: impl FnMut(T)) {
        if !self.buf.is_empty() {
            let end = self.buf.len();
            self.decode_line_range(0, end, &mut emit);
            self.buf.clear();
        }
    }

    fn decode_line_range(&mut self, start: usize, end: usize, emit: &mut impl FnMut(T)) {
        let mut line = &self.buf[start..end];
        if line.ends_with(b"\r") {
            line = &line[..line.len() - 1];
        }
        if line.is_empty() {
            return;
        }
        match serde_json::from_slice::<T>(line) {
            Ok(record) => {
                self.decoded += 1;
                emit(record);
            }
            Err(e) => {
                self.skipped += 1;
                log::trace!("line decoder: skipping malformed record: {}", e);
            }
        }
    }
}

impl<T: DeserializeOwned> Default for LineDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}
