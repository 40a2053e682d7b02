//! Error and Result module.

use std::io;

use derive_more::{Display, Error};

/// A set of errors that can occur while parsing multipart streams and storing
/// upload items.
#[derive(Debug, Display, Error)]
#[non_exhaustive]
pub enum MultipartError {
    /// Content-Type header could not be parsed as a mime type.
    #[display("Content-Type header is missing or can not be parsed")]
    ContentTypeParse,

    /// Content-Type is not `multipart/*`.
    #[display("Content-Type is not compatible with multipart parsing")]
    ContentTypeIncompatible,

    /// Multipart boundary parameter is not found in the Content-Type.
    #[display("multipart boundary is not found")]
    BoundaryMissing,

    /// A line where a boundary was required did not contain one.
    #[display("multipart stream is malformed: expected boundary")]
    BoundaryExpected,

    /// Multipart stream ended before the final boundary.
    #[display("multipart stream is incomplete")]
    Incomplete,

    /// Part header block is malformed or too large.
    #[display("part headers could not be parsed")]
    Headers,

    /// Nested multipart is not supported.
    #[display("nested multipart is not supported")]
    Nested,

    /// Content-Disposition header is not found or is not `form-data`.
    ///
    /// According to [RFC 7578 §4.2] a Content-Disposition header must always
    /// be present and equal to "form-data" in multipart/form-data requests.
    ///
    /// [RFC 7578 §4.2]: https://datatracker.ietf.org/doc/html/rfc7578#section-4.2
    #[display("no Content-Disposition `form-data` header")]
    ContentDispositionMissing,

    /// Content-Disposition `name` parameter is not found.
    #[display("no `name` parameter in Content-Disposition")]
    ContentDispositionNameMissing,

    /// A single part grew past the configured per-part cap.
    #[display("field `{field_name}` exceeds the size limit of {limit} bytes (read {size})")]
    PartSizeExceeded {
        /// Form field name of the offending part, empty if it had none.
        field_name: String,
        /// Configured per-part cap in bytes.
        limit: u64,
        /// Bytes observed before the parse was aborted.
        size: u64,
    },

    /// The request body grew past the configured whole-request cap.
    #[display("request exceeds the size limit of {limit} bytes (read {size})")]
    RequestSizeExceeded {
        /// Configured whole-request cap in bytes.
        limit: u64,
        /// Bytes observed before the parse was aborted.
        size: u64,
    },

    /// A file name contained a NUL character.
    ///
    /// The carried name has each NUL rendered as the two-character escape
    /// `\0`; all other characters are preserved verbatim.
    #[display("invalid file name: `{name}`")]
    InvalidFileName {
        /// The offending file name with NUL characters escaped.
        #[error(not(source))]
        name: String,
    },

    /// The requested charset label is not a known encoding.
    #[display("unsupported charset `{charset}`")]
    UnsupportedCharset {
        /// The label that failed to resolve.
        #[error(not(source))]
        charset: String,
    },

    /// Item content is not valid in the requested encoding.
    #[display("content can not be decoded as `{charset}`")]
    CharsetDecode {
        /// Resolved name of the encoding that rejected the content.
        #[error(not(source))]
        charset: String,
    },

    /// Reading the body source or operating on a backing file failed.
    #[display("{_0}")]
    Io(io::Error),
}

impl From<io::Error> for MultipartError {
    fn from(err: io::Error) -> Self {
        MultipartError::Io(err)
    }
}
