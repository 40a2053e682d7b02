use std::io::{self, Read};

use bytes::{Bytes, BytesMut};

use crate::error::MultipartError;

/// Bytes pulled from the source per refill.
const CHUNK_SIZE: usize = 8 * 1024;

/// Sliding lookahead buffer over the raw body source.
///
/// All boundary and header scanning works against `buf`; `fill` appends more
/// bytes from the source and accounts them against the whole-request cap.
#[derive(Debug)]
pub(crate) struct StreamBuffer<R> {
    stream: R,
    pub(crate) buf: BytesMut,
    /// EOF flag. If true, no more source reads will be attempted.
    pub(crate) eof: bool,
    /// Total bytes pulled from the source so far.
    read_total: u64,
    /// Whole-request cap.
    limit: Option<u64>,
}

impl<R: Read> StreamBuffer<R> {
    pub(crate) fn new(stream: R, limit: Option<u64>) -> Self {
        StreamBuffer {
            stream,
            buf: BytesMut::with_capacity(1_024), // pre-allocate 1KiB
            eof: false,
            read_total: 0,
            limit,
        }
    }

    /// Pulls one more chunk from the source into the buffer.
    ///
    /// No-op at EOF. Fails with `RequestSizeExceeded` as soon as the running
    /// total crosses the cap, before the oversized remainder is consumed.
    pub(crate) fn fill(&mut self) -> Result<(), MultipartError> {
        if self.eof {
            return Ok(());
        }

        let mut chunk = [0u8; CHUNK_SIZE];
        let n = loop {
            match self.stream.read(&mut chunk) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        };

        if n == 0 {
            self.eof = true;
            return Ok(());
        }

        self.read_total += n as u64;

        if let Some(limit) = self.limit {
            if self.read_total > limit {
                return Err(MultipartError::RequestSizeExceeded {
                    limit,
                    size: self.read_total,
                });
            }
        }

        self.buf.extend_from_slice(&chunk[..n]);

        Ok(())
    }

    /// Reads until the specified ending.
    ///
    /// Returns:
    ///
    /// - `Ok(Some(chunk))` - `needle` is found, with chunk ending after needle
    /// - `Err(Incomplete)` - `needle` is not found and we're at EOF
    /// - `Ok(None)` - `needle` is not found otherwise
    pub(crate) fn read_until(&mut self, needle: &[u8]) -> Result<Option<Bytes>, MultipartError> {
        match memchr::memmem::find(&self.buf, needle) {
            // buffer exhausted and EOF without finding needle
            None if self.eof => Err(MultipartError::Incomplete),

            // needle not yet found
            None => Ok(None),

            // needle found, split chunk out of buf
            Some(idx) => Ok(Some(self.buf.split_to(idx + needle.len()).freeze())),
        }
    }

    /// Reads bytes until new line delimiter (`\n`, `0x0A`).
    #[inline]
    pub(crate) fn readline(&mut self) -> Result<Option<Bytes>, MultipartError> {
        self.read_until(b"\n")
    }

    /// Reads bytes until new line delimiter or until EOF.
    #[inline]
    pub(crate) fn readline_or_eof(&mut self) -> Result<Option<Bytes>, MultipartError> {
        match self.readline() {
            Err(MultipartError::Incomplete) if self.eof => Ok(Some(self.buf.split().freeze())),
            line => line,
        }
    }
}
