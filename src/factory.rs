//! Construction of [`FileItem`]s with shared configuration.

use std::{
    env,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use encoding_rs::Encoding;
use mime::Mime;
use once_cell::sync::Lazy;
use rand::distr::{Alphanumeric, SampleString as _};

use crate::{
    error::MultipartError,
    item::{FileItem, DEFAULT_CHARSET},
};

/// Size below which item content is kept in memory.
const DEFAULT_SIZE_THRESHOLD: usize = 10 * 1024;

/// Process-wide component of generated temp file names, created once.
static UID: Lazy<String> = Lazy::new(|| Alphanumeric.sample_string(&mut rand::rng(), 8));

/// Counter used in unique identifier generation.
static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Returns an identifier that is unique within this process.
///
/// Zero-padded to 8 digits, widening naturally once the counter outgrows
/// them. The guarantee is uniqueness, not unpredictability; this is not a
/// security token.
fn unique_id() -> String {
    format!("{:08}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Creates [`FileItem`]s sharing a spillover threshold, a repository
/// directory for temp files, and a default content charset.
///
/// Generated temp file names combine a process-random identifier with an
/// atomically incremented counter, so concurrently created items never
/// collide inside a shared repository directory.
#[derive(Debug, Clone)]
pub struct FileItemFactory {
    threshold: usize,
    repository: Option<PathBuf>,
    default_charset: &'static Encoding,
}

impl FileItemFactory {
    pub fn new() -> Self {
        FileItemFactory {
            threshold: DEFAULT_SIZE_THRESHOLD,
            repository: None,
            default_charset: DEFAULT_CHARSET,
        }
    }

    /// Sets the size, in bytes, up to which item content is buffered in
    /// memory. A part of exactly this size stays in memory.
    pub fn threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Sets the directory that spilled temp files are created in.
    ///
    /// The default temporary file location is platform dependent.
    pub fn repository(mut self, dir: impl AsRef<Path>) -> Self {
        self.repository = Some(dir.as_ref().to_owned());
        self
    }

    /// Sets the charset items fall back to when a part declares none.
    pub fn default_charset(mut self, charset: &str) -> Result<Self, MultipartError> {
        self.default_charset = Encoding::for_label(charset.as_bytes()).ok_or_else(|| {
            MultipartError::UnsupportedCharset {
                charset: charset.to_owned(),
            }
        })?;
        Ok(self)
    }

    /// Creates a fresh, empty item for one part.
    pub fn create_item(
        &self,
        field_name: impl Into<String>,
        content_type: Option<Mime>,
        is_form_field: bool,
        file_name: Option<String>,
    ) -> FileItem {
        let dir = self.repository.clone().unwrap_or_else(env::temp_dir);
        let temp_path = dir.join(format!("upload_{}_{}.tmp", *UID, unique_id()));

        FileItem::new(
            field_name.into(),
            content_type,
            is_form_field,
            file_name,
            self.threshold,
            temp_path,
            self.default_charset,
        )
    }
}

impl Default for FileItemFactory {
    fn default() -> Self {
        Self::new()
    }
}
