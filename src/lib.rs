//! Streaming `multipart/form-data` parsing with memory/disk buffered items.
//!
//! [`Multipart`] splits an untrusted body source into its parts without ever
//! holding the whole body in memory; each [`Field`] exposes the part's
//! metadata and a read-once body stream. [`FileItemFactory`] produces
//! [`FileItem`] sinks that buffer a part in memory up to a threshold and
//! transparently spill to a uniquely-named temp file beyond it.
//!
//! Parsing is synchronous pull: the caller drives every read, and one
//! request is parsed by exactly one cursor. Independent requests can be
//! parsed concurrently on separate sources.
//!
//! # Examples
//!
//! ```no_run
//! use std::io;
//!
//! use multipart_upload::{FileItem, FileItemFactory, Limits, Multipart, MultipartError};
//!
//! fn handle(content_type: &str, body: impl io::Read) -> Result<Vec<FileItem>, MultipartError> {
//!     let limits = Limits {
//!         request_size: Some(10 << 20),
//!         part_size: Some(2 << 20),
//!     };
//!     let mut multipart = Multipart::with_limits(content_type, None, body, limits)?;
//!     let factory = FileItemFactory::new().threshold(16 * 1024);
//!
//!     let mut items = Vec::new();
//!
//!     while let Some(mut field) = multipart.next_field()? {
//!         let mut item = factory.create_item(
//!             field.name().unwrap_or_default().to_owned(),
//!             field.content_type().cloned(),
//!             field.is_form_field(),
//!             field.file_name().map(ToOwned::to_owned),
//!         );
//!
//!         io::copy(&mut field, &mut item)?;
//!         items.push(item);
//!     }
//!
//!     // the caller owns the items now, including any backing temp files
//!     Ok(items)
//! }
//! ```

mod buffer;
mod disposition;
mod error;
mod factory;
mod field;
mod headers;
mod item;
mod multipart;


pub use self::disposition::{ContentDisposition, DispositionParam, DispositionType};
pub use self::error::MultipartError;
pub use self::factory::FileItemFactory;
pub use self::field::Field;
pub use self::headers::PartHeaders;
pub use self::item::{FileItem, ItemReader};
pub use self::multipart::{Limits, Multipart};
