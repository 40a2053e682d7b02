//! Multipart payload parsing.

use std::io::Read;

use bytes::Bytes;
use mime::Mime;

use crate::{
    buffer::StreamBuffer,
    disposition::ContentDisposition,
    error::MultipartError,
    field::{Field, PartMeta},
    headers::{self, PartHeaders},
};

/// Optional size caps applied while parsing a request.
///
/// Absent caps mean unlimited. Both are checked incrementally, so an
/// oversized upload is rejected while it streams in, not after it was
/// buffered.
#[derive(Debug, Clone, Default)]
pub struct Limits {
    /// Cap on raw bytes consumed from the source across the whole request.
    pub request_size: Option<u64>,

    /// Cap on a single part's body.
    pub part_size: Option<u64>,
}

#[derive(Debug, PartialEq)]
enum State {
    /// Skip data until the first boundary.
    Preamble,

    /// Reading a boundary line.
    Boundary,

    /// Reading part headers.
    Headers,

    /// A part body is being consumed.
    Body,

    /// Final boundary was read.
    Eof,

    /// An earlier error made the stream unusable.
    Failed,
}

/// The result of scanning the buffer for the next piece of a part body.
enum Scan {
    /// Body content, safe to hand out.
    Chunk(Bytes),

    /// The buffer has to be refilled before the scan can decide.
    NeedMore,

    /// The body's closing delimiter starts the buffer.
    BoundaryReached,
}

/// The server-side reader for `multipart/form-data` payloads.
///
/// `Multipart` is a single-pass cursor over one body source: each
/// [`next_field`](Self::next_field) call yields the next [`Field`], and the
/// returned field mutably borrows the reader, so a previous field's body can
/// never be touched once the parser has moved on. After any error the reader
/// is left in a terminal state and every further call fails.
#[derive(Debug)]
pub struct Multipart<R> {
    /// Request payload buffer.
    payload: StreamBuffer<R>,

    /// Request's Content-Type.
    ///
    /// Guaranteed to have "multipart" top-level media type, i.e., `multipart/*`.
    content_type: Mime,

    /// Field boundary.
    boundary: String,

    state: State,

    part_limit: Option<u64>,
}

impl<R: Read> Multipart<R> {
    /// Creates a multipart reader from the request's Content-Type value and
    /// its body source, with no size caps.
    pub fn new(content_type: &str, stream: R) -> Result<Self, MultipartError> {
        Self::with_limits(content_type, None, stream, Limits::default())
    }

    /// Creates a multipart reader with size caps.
    ///
    /// A declared `content_length` larger than the request cap is rejected
    /// here, before anything is read from the source.
    pub fn with_limits(
        content_type: &str,
        content_length: Option<u64>,
        stream: R,
        limits: Limits,
    ) -> Result<Self, MultipartError> {
        let (content_type, boundary) = Self::find_ct_and_boundary(content_type)?;

        if let (Some(declared), Some(limit)) = (content_length, limits.request_size) {
            if declared > limit {
                return Err(MultipartError::RequestSizeExceeded {
                    limit,
                    size: declared,
                });
            }
        }

        Ok(Multipart {
            payload: StreamBuffer::new(stream, limits.request_size),
            content_type,
            boundary,
            state: State::Preamble,
            part_limit: limits.part_size,
        })
    }

    /// Extract Content-Type and boundary info from the header value.
    pub(crate) fn find_ct_and_boundary(value: &str) -> Result<(Mime, String), MultipartError> {
        let content_type = value
            .parse::<Mime>()
            .map_err(|_| MultipartError::ContentTypeParse)?;

        if content_type.type_() != mime::MULTIPART {
            return Err(MultipartError::ContentTypeIncompatible);
        }

        let boundary = content_type
            .get_param(mime::BOUNDARY)
            .ok_or(MultipartError::BoundaryMissing)?
            .as_str()
            .to_owned();

        if boundary.is_empty() {
            return Err(MultipartError::BoundaryMissing);
        }

        Ok((content_type, boundary))
    }

    /// Advances to the next part and returns its descriptor.
    ///
    /// Any unread remainder of the previous part's body is skipped first.
    /// Returns `Ok(None)` once the final boundary was seen. After an error
    /// the stream is unusable and every further call fails.
    pub fn next_field(&mut self) -> Result<Option<Field<'_, R>>, MultipartError> {
        match self.advance() {
            Ok(Some(meta)) => Ok(Some(Field::new(self, meta))),
            Ok(None) => Ok(None),
            Err(err) => {
                self.state = State::Failed;
                Err(err)
            }
        }
    }

    fn advance(&mut self) -> Result<Option<PartMeta>, MultipartError> {
        match self.state {
            State::Failed => return Err(MultipartError::Incomplete),
            State::Eof => return Ok(None),

            // the previous field was dropped before its body was read to the
            // end; drain the remainder
            State::Body => while self.read_body_chunk()?.is_some() {},

            State::Preamble | State::Boundary | State::Headers => {}
        }

        if self.state == State::Preamble {
            let eof = loop {
                match Self::skip_until_boundary(&mut self.payload, &self.boundary)? {
                    Some(eof) => break eof,
                    None => self.payload.fill()?,
                }
            };

            if eof {
                self.state = State::Eof;
                return Ok(None);
            }

            self.state = State::Headers;
        }

        if self.state == State::Boundary {
            let eof = loop {
                match Self::read_boundary(&mut self.payload, &self.boundary)? {
                    Some(eof) => break eof,
                    None => self.payload.fill()?,
                }
            };

            if eof {
                self.state = State::Eof;
                return Ok(None);
            }

            self.state = State::Headers;
        }

        let part_headers = loop {
            match Self::read_part_headers(&mut self.payload)? {
                Some(part_headers) => break part_headers,
                None => self.payload.fill()?,
            }
        };

        let content_disposition = part_headers
            .get(headers::CONTENT_DISPOSITION)
            .and_then(|value| ContentDisposition::from_raw(value).ok())
            .filter(|cd| cd.is_form_data());

        let form_field_name = if self.content_type.subtype() == mime::FORM_DATA {
            // According to RFC 7578 §4.2, which relates to "multipart/form-data" requests
            // specifically, fields must have a Content-Disposition header, its disposition
            // type must be set as "form-data", and it must have a name parameter.

            let Some(cd) = &content_disposition else {
                return Err(MultipartError::ContentDispositionMissing);
            };

            let Some(field_name) = cd.get_name() else {
                return Err(MultipartError::ContentDispositionNameMissing);
            };

            field_name.to_owned()
        } else {
            String::new()
        };

        let field_content_type: Option<Mime> = part_headers
            .get(headers::CONTENT_TYPE)
            .and_then(|ct| ct.parse().ok());

        // nested multipart streams are not supported
        if let Some(mime) = &field_content_type {
            if mime.type_() == mime::MULTIPART {
                return Err(MultipartError::Nested);
            }
        }

        self.state = State::Body;

        Ok(Some(PartMeta {
            content_type: field_content_type,
            content_disposition,
            form_field_name,
            headers: part_headers,
        }))
    }

    pub(crate) fn part_limit(&self) -> Option<u64> {
        self.part_limit
    }

    /// Puts the reader into its terminal state.
    pub(crate) fn fail(&mut self) {
        self.state = State::Failed;
    }

    /// Reads the next chunk of the current part's body, marking the stream
    /// unusable on error.
    pub(crate) fn body_chunk(&mut self) -> Result<Option<Bytes>, MultipartError> {
        match self.read_body_chunk() {
            Err(err) => {
                self.state = State::Failed;
                Err(err)
            }
            ok => ok,
        }
    }

    fn read_body_chunk(&mut self) -> Result<Option<Bytes>, MultipartError> {
        if self.state != State::Body {
            return Ok(None);
        }

        loop {
            match Self::scan_body(&mut self.payload, &self.boundary)? {
                Scan::Chunk(bytes) => return Ok(Some(bytes)),

                Scan::NeedMore => {
                    if self.payload.eof {
                        return Err(MultipartError::Incomplete);
                    }
                    self.payload.fill()?;
                }

                Scan::BoundaryReached => {
                    // consume the line break that closes the body; the
                    // boundary line itself is read by `read_boundary`
                    if let Some(line) = self.payload.readline()? {
                        if &line[..] != b"\r\n" {
                            log::warn!(
                                "multipart field did not read all the data or it is malformed"
                            );
                        }
                    }

                    self.state = State::Boundary;
                    return Ok(None);
                }
            }
        }
    }

    /// Scans for body content with an unknown length, stopping in front of
    /// the closing delimiter.
    ///
    /// A delimiter that straddles a refill is never mis-read as content: the
    /// scan asks for more data instead and re-runs over the grown buffer.
    fn scan_body(
        payload: &mut StreamBuffer<R>,
        boundary: &str,
    ) -> Result<Scan, MultipartError> {
        let len = payload.buf.len();

        if len == 0 {
            return if payload.eof {
                Err(MultipartError::Incomplete)
            } else {
                Ok(Scan::NeedMore)
            };
        }

        // delimiter check at the head of the buffer
        if payload.buf.starts_with(b"\r\n--") {
            let delim_len = 4 + boundary.len();

            if len < delim_len + 2 {
                return Ok(Scan::NeedMore);
            }

            if &payload.buf[4..delim_len] == boundary.as_bytes()
                && (&payload.buf[delim_len..delim_len + 2] == b"\r\n"
                    || &payload.buf[delim_len..delim_len + 2] == b"--")
            {
                return Ok(Scan::BoundaryReached);
            }

            // not this part's delimiter; it is content
        }

        let mut pos = 0;

        loop {
            return match memchr::memmem::find(&payload.buf[pos..], b"\r") {
                Some(idx) => {
                    let cur = pos + idx;

                    // not enough buffered to tell a delimiter from content
                    if cur + 4 > len {
                        if cur > 0 {
                            Ok(Scan::Chunk(payload.buf.split_to(cur).freeze()))
                        } else {
                            Ok(Scan::NeedMore)
                        }
                    } else if &payload.buf[cur..cur + 4] == b"\r\n--" {
                        if cur != 0 {
                            Ok(Scan::Chunk(payload.buf.split_to(cur).freeze()))
                        } else {
                            // the head check already rejected this candidate
                            pos = cur + 1;
                            continue;
                        }
                    } else {
                        // not a delimiter
                        pos = cur + 1;
                        continue;
                    }
                }

                None => Ok(Scan::Chunk(payload.buf.split().freeze())),
            };
        }
    }

    /// Reads a field boundary line from the payload buffer (and discards it).
    ///
    /// Reads "in-between" and "final" boundaries. E.g. for boundary = "foo":
    ///
    /// ```plain
    /// --foo    <-- in-between fields
    /// --foo--  <-- end of request body, should be followed by EOF
    /// ```
    ///
    /// Returns:
    ///
    /// - `Ok(Some(true))` - final field boundary read (EOF)
    /// - `Ok(Some(false))` - field boundary read
    /// - `Ok(None)` - boundary not found, more data needs reading
    /// - `Err(BoundaryExpected)` - the line is not a boundary
    fn read_boundary(
        payload: &mut StreamBuffer<R>,
        boundary: &str,
    ) -> Result<Option<bool>, MultipartError> {
        let chunk = match payload.readline_or_eof()? {
            None => return Ok(None),
            Some(chunk) => chunk,
        };

        if !chunk.starts_with(b"--") || !chunk[2..].starts_with(boundary.as_bytes()) {
            return Err(MultipartError::BoundaryExpected);
        }

        let rest = &chunk[2 + boundary.len()..];

        if rest == b"\r\n" {
            // boundary is followed by a line break, more fields to come
            return Ok(Some(false));
        }

        // the final boundary is allowed to end without a line break
        if rest == b"--" || rest == b"--\r\n" {
            return Ok(Some(true));
        }

        Err(MultipartError::BoundaryExpected)
    }

    /// Discards preamble lines until the first boundary.
    ///
    /// A payload that opens directly with `--boundary` has a zero-length
    /// preamble, which is valid.
    fn skip_until_boundary(
        payload: &mut StreamBuffer<R>,
        boundary: &str,
    ) -> Result<Option<bool>, MultipartError> {
        loop {
            let chunk = match payload.readline()? {
                Some(chunk) => chunk,
                None => return Ok(None),
            };

            if chunk.starts_with(b"--") && chunk[2..].starts_with(boundary.as_bytes()) {
                let rest = &chunk[2 + boundary.len()..];

                if rest == b"\r\n" {
                    return Ok(Some(false));
                }

                if rest.starts_with(b"--") {
                    return Ok(Some(true));
                }
            }
        }
    }

    /// Reads a part's header block, terminated by a blank line.
    ///
    /// Returns `Ok(None)` when more data is needed. The raw block is capped
    /// whether or not the blank line was found, so neither an oversized
    /// well-formed block nor a stream with no blank line gets past it.
    fn read_part_headers(
        payload: &mut StreamBuffer<R>,
    ) -> Result<Option<PartHeaders>, MultipartError> {
        // a part may carry no headers at all
        if payload.buf.starts_with(b"\r\n") {
            let _ = payload.buf.split_to(2);
            return Ok(Some(PartHeaders::empty()));
        }

        if payload.buf.len() < 2 && !payload.eof {
            return Ok(None);
        }

        match payload.read_until(b"\r\n\r\n")? {
            Some(block) if block.len() > headers::MAX_HEADER_BLOCK => {
                Err(MultipartError::Headers)
            }

            Some(block) => PartHeaders::parse(&block).map(Some),

            None if payload.buf.len() > headers::MAX_HEADER_BLOCK => {
                Err(MultipartError::Headers)
            }

            None => Ok(None),
        }
    }
}
