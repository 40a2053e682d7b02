use std::io::{self, Read};

use bytes::{Buf as _, Bytes};
use mime::Mime;

use crate::{
    disposition::ContentDisposition, error::MultipartError, headers::PartHeaders,
    multipart::Multipart,
};

/// Metadata parsed from a part's header block.
pub(crate) struct PartMeta {
    pub(crate) content_type: Option<Mime>,
    pub(crate) content_disposition: Option<ContentDisposition>,
    pub(crate) form_field_name: String,
    pub(crate) headers: PartHeaders,
}

/// A single part in a multipart stream.
///
/// The body is readable exactly once, either chunk-wise through
/// [`read_chunk`](Self::read_chunk) or through the [`io::Read`] impl. A
/// `Field` mutably borrows its [`Multipart`], so the parser can not advance
/// while the field is alive; dropping a field with unread body bytes makes
/// the next [`Multipart::next_field`] call skip the remainder.
#[derive(Debug)]
pub struct Field<'a, R> {
    multipart: &'a mut Multipart<R>,

    /// Field's Content-Type, if supplied by the client.
    content_type: Option<Mime>,

    /// Field's Content-Disposition, if it was a valid `form-data` one.
    content_disposition: Option<ContentDisposition>,

    /// Form field name.
    ///
    /// A non-optional storage for form field names to avoid unwraps in error
    /// payloads. Will be an empty string in non-form contexts.
    ///
    // INVARIANT: always non-empty when request content-type is multipart/form-data.
    pub(crate) form_field_name: String,

    /// Field's header map.
    headers: PartHeaders,

    /// Body bytes handed out so far, for the per-part cap.
    read: u64,

    /// Remainder of a chunk partially consumed through `io::Read`.
    pending: Bytes,
}

impl<'a, R: Read> Field<'a, R> {
    pub(crate) fn new(multipart: &'a mut Multipart<R>, meta: PartMeta) -> Self {
        Field {
            multipart,
            content_type: meta.content_type,
            content_disposition: meta.content_disposition,
            form_field_name: meta.form_field_name,
            headers: meta.headers,
            read: 0,
            pending: Bytes::new(),
        }
    }

    /// Returns a reference to the field's header map.
    pub fn headers(&self) -> &PartHeaders {
        &self.headers
    }

    /// Returns a reference to the field's content (mime) type, if it is supplied by the client.
    ///
    /// According to [RFC 7578](https://www.rfc-editor.org/rfc/rfc7578#section-4.4), if it is not
    /// present, it should default to "text/plain". Note it is the responsibility of the client to
    /// provide the appropriate content type, there is no attempt to validate this by the server.
    pub fn content_type(&self) -> Option<&Mime> {
        self.content_type.as_ref()
    }

    /// Returns this field's parsed Content-Disposition header, if set.
    pub fn content_disposition(&self) -> Option<&ContentDisposition> {
        self.content_disposition.as_ref()
    }

    /// Returns the field's name, if set.
    ///
    /// Guaranteed to be present when the request content type is
    /// `multipart/form-data`; parts without one fail during
    /// [`Multipart::next_field`].
    pub fn name(&self) -> Option<&str> {
        self.content_disposition()?.get_name()
    }

    /// Returns the file name declared for this part, if any.
    ///
    /// A present-but-empty file name still marks the part as a file field.
    pub fn file_name(&self) -> Option<&str> {
        self.content_disposition()?.get_filename()
    }

    /// Returns `true` when the part carries no file name, i.e. it is a plain
    /// form field rather than a file upload.
    pub fn is_form_field(&self) -> bool {
        self.file_name().is_none()
    }

    /// Reads the next chunk of the field's body.
    ///
    /// Returns `Ok(None)` once the body is exhausted. Fails with
    /// [`MultipartError::PartSizeExceeded`] as soon as the body grows past
    /// the configured per-part cap; the parse is unusable afterwards.
    pub fn read_chunk(&mut self) -> Result<Option<Bytes>, MultipartError> {
        let chunk = self.multipart.body_chunk()?;

        if let Some(chunk) = &chunk {
            self.read += chunk.len() as u64;

            if let Some(limit) = self.multipart.part_limit() {
                if self.read > limit {
                    self.multipart.fail();
                    return Err(MultipartError::PartSizeExceeded {
                        field_name: self.form_field_name.clone(),
                        limit,
                        size: self.read,
                    });
                }
            }
        }

        Ok(chunk)
    }
}

impl<R: Read> Read for Field<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.read_chunk() {
                Ok(Some(chunk)) => self.pending = chunk,
                Ok(None) => return Ok(0),
                Err(MultipartError::Io(err)) => return Err(err),
                Err(err) => return Err(io::Error::other(err)),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);

        Ok(n)
    }
}
