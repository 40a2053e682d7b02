//! Buffered storage for a part's body, spilling to disk past a threshold.

use std::{
    fs::{self, File},
    io::{self, Cursor, Read, Write},
    path::{Path, PathBuf},
};

use bytes::BytesMut;
use encoding_rs::Encoding;
use mime::Mime;

use crate::error::MultipartError;

/// Content charset used when the sender supplied no explicit `charset=`
/// parameter. Media subtypes of the "text" type default to ISO-8859-1 when
/// received via HTTP; under WHATWG label rules that decodes as windows-1252.
pub(crate) const DEFAULT_CHARSET: &Encoding = encoding_rs::WINDOWS_1252;

/// The backing store for an item's content.
///
/// Exactly one of the two is ever populated; once the threshold is crossed
/// the switch to `Disk` is permanent for the instance.
enum Buffer {
    /// Content held in memory, at most `threshold` bytes.
    Memory(BytesMut),

    /// Content spilled to a uniquely-named temp file. `file` is the live
    /// write handle; it is flushed and dropped on first read access.
    Disk { path: PathBuf, file: Option<File> },
}

/// A fully-buffered part: form field value or uploaded file.
///
/// Obtained from a [`FileItemFactory`](crate::FileItemFactory) and filled
/// through the [`io::Write`] impl (usually `io::copy` from a
/// [`Field`](crate::Field)). Content stays in memory up to the configured
/// threshold and spills to a temp file beyond it.
///
/// The backing temp file lives as long as the caller lets it: there is no
/// drop-based cleanup, so either [`write_to`](Self::write_to) or
/// [`delete`](Self::delete) it (or point an external reaper at the
/// repository directory).
pub struct FileItem {
    field_name: String,
    content_type: Option<Mime>,
    is_form_field: bool,
    file_name: Option<String>,

    /// Explicitly cached size; set after a disk-backed `write_to`, since
    /// moving the backing file changes what "current size" means.
    size: Option<u64>,

    threshold: usize,
    temp_path: PathBuf,
    buffer: Buffer,
    default_charset: &'static Encoding,
}

impl FileItem {
    pub(crate) fn new(
        field_name: String,
        content_type: Option<Mime>,
        is_form_field: bool,
        file_name: Option<String>,
        threshold: usize,
        temp_path: PathBuf,
        default_charset: &'static Encoding,
    ) -> Self {
        FileItem {
            field_name,
            content_type,
            is_form_field,
            file_name,
            size: None,
            threshold,
            temp_path,
            buffer: Buffer::Memory(BytesMut::new()),
            default_charset,
        }
    }

    /// Name of the form field this item was read from.
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    /// The content type passed by the client, if any.
    pub fn content_type(&self) -> Option<&Mime> {
        self.content_type.as_ref()
    }

    /// Whether this item is a plain form field, as opposed to a file upload.
    pub fn is_form_field(&self) -> bool {
        self.is_form_field
    }

    /// Whether the content is held in memory. Turns `false` permanently once
    /// the threshold was crossed.
    pub fn is_in_memory(&self) -> bool {
        matches!(self.buffer, Buffer::Memory(_))
    }

    /// The original file name in the client's file system, if one was
    /// declared.
    ///
    /// A file name containing a NUL character fails with
    /// [`MultipartError::InvalidFileName`]; NUL-smuggling confuses several
    /// native filesystem APIs. The escaped name can be recovered from the
    /// error.
    pub fn name(&self) -> Result<Option<&str>, MultipartError> {
        match &self.file_name {
            Some(file_name) if file_name.contains('\u{0}') => {
                Err(MultipartError::InvalidFileName {
                    name: file_name.replace('\u{0}', "\\0"),
                })
            }
            Some(file_name) => Ok(Some(file_name.as_str())),
            None => Ok(None),
        }
    }

    /// Size of the content in bytes.
    ///
    /// In priority order: the size cached by a disk-backed
    /// [`write_to`](Self::write_to), the in-memory length, the live backing
    /// file length (0 once that file is gone).
    pub fn size(&self) -> u64 {
        if let Some(size) = self.size {
            return size;
        }

        match &self.buffer {
            Buffer::Memory(buf) => buf.len() as u64,
            Buffer::Disk { path, .. } => fs::metadata(path).map_or(0, |meta| meta.len()),
        }
    }

    /// Returns a copy of the content as bytes.
    ///
    /// Memory-backed items hand out a defensive copy (empty if nothing was
    /// ever written); disk-backed items read the whole backing file.
    pub fn get(&mut self) -> Result<Vec<u8>, MultipartError> {
        self.close_writer()?;

        match &self.buffer {
            Buffer::Memory(buf) => Ok(buf.to_vec()),
            Buffer::Disk { path, .. } => Ok(fs::read(path)?),
        }
    }

    /// Returns a reader over the content.
    ///
    /// Disk-backed content is streamed from the backing file, not copied
    /// into memory.
    pub fn reader(&mut self) -> Result<ItemReader, MultipartError> {
        self.close_writer()?;

        match &self.buffer {
            Buffer::Memory(buf) => Ok(ItemReader(ReaderKind::Memory(Cursor::new(buf.to_vec())))),
            Buffer::Disk { path, .. } => Ok(ItemReader(ReaderKind::Disk(File::open(path)?))),
        }
    }

    /// Decodes the content with the charset from the part's content type,
    /// falling back to the item's default charset.
    ///
    /// Legacy convenience behavior, kept deliberately distinct from
    /// [`string_with_charset`](Self::string_with_charset): any failure
    /// (unknown declared charset label, malformed content, backing file I/O)
    /// yields an empty string instead of an error.
    pub fn string(&mut self) -> String {
        let declared = self
            .content_type
            .as_ref()
            .and_then(|ct| ct.get_param(mime::CHARSET));

        let encoding = match declared {
            Some(charset) => match Encoding::for_label(charset.as_str().as_bytes()) {
                Some(encoding) => encoding,
                None => return String::new(),
            },
            None => self.default_charset,
        };

        match self.get() {
            Ok(data) => {
                let (text, _, had_errors) = encoding.decode(&data);
                if had_errors {
                    String::new()
                } else {
                    text.into_owned()
                }
            }
            Err(_) => String::new(),
        }
    }

    /// Decodes the content with the given charset label.
    ///
    /// Unlike [`string`](Self::string), failures surface: an unknown label
    /// fails with [`MultipartError::UnsupportedCharset`] and malformed
    /// content with [`MultipartError::CharsetDecode`]. Nothing is silently
    /// substituted.
    pub fn string_with_charset(&mut self, charset: &str) -> Result<String, MultipartError> {
        let encoding = Encoding::for_label(charset.as_bytes()).ok_or_else(|| {
            MultipartError::UnsupportedCharset {
                charset: charset.to_owned(),
            }
        })?;

        let data = self.get()?;
        let (text, _, had_errors) = encoding.decode(&data);

        if had_errors {
            return Err(MultipartError::CharsetDecode {
                charset: encoding.name().to_owned(),
            });
        }

        Ok(text.into_owned())
    }

    /// Finalizes the item to `dest`.
    ///
    /// Memory-backed content is written out directly. Disk-backed content is
    /// renamed over `dest` (an existing destination is removed first), with a
    /// copy-then-remove fallback when the rename crosses filesystems.
    ///
    /// For disk-backed items this works exactly once: the move consumes the
    /// backing file, so a second call fails with an I/O error instead of
    /// silently re-reading stale state.
    pub fn write_to(&mut self, dest: impl AsRef<Path>) -> Result<(), MultipartError> {
        let dest = dest.as_ref();
        self.close_writer()?;

        let moved_size = match &self.buffer {
            Buffer::Memory(buf) => {
                fs::write(dest, buf)?;
                None
            }

            Buffer::Disk { path, .. } => {
                // the length has to be taken before the file moves away
                let size = fs::metadata(path)?.len();

                if dest.exists() {
                    fs::remove_file(dest)?;
                }

                if fs::rename(path, dest).is_err() {
                    // rename can not cross filesystems; fall back to a copy
                    fs::copy(path, dest)?;
                    fs::remove_file(path)?;
                }

                Some(size)
            }
        };

        if let Some(size) = moved_size {
            self.size = Some(size);
        }

        Ok(())
    }

    /// Deletes the underlying storage, including any backing temp file.
    ///
    /// Clearing the in-memory buffer is idempotent. Deleting a backing file
    /// that no longer exists reports the filesystem error, so repeat calls
    /// on disk-backed items are best-effort.
    pub fn delete(&mut self) -> Result<(), MultipartError> {
        self.close_writer()?;

        match &mut self.buffer {
            Buffer::Memory(buf) => {
                *buf = BytesMut::new();
                Ok(())
            }
            Buffer::Disk { path, .. } => {
                fs::remove_file(&*path)?;
                Ok(())
            }
        }
    }

    /// Overrides the charset used by [`string`](Self::string) when the part
    /// declared none.
    pub fn set_default_charset(&mut self, charset: &str) -> Result<(), MultipartError> {
        self.default_charset = Encoding::for_label(charset.as_bytes()).ok_or_else(|| {
            MultipartError::UnsupportedCharset {
                charset: charset.to_owned(),
            }
        })?;
        Ok(())
    }

    /// Flushes and drops the live write handle, if any.
    fn close_writer(&mut self) -> io::Result<()> {
        if let Buffer::Disk { file, .. } = &mut self.buffer {
            if let Some(mut file) = file.take() {
                file.flush()?;
            }
        }
        Ok(())
    }
}

impl Write for FileItem {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match &mut self.buffer {
            Buffer::Memory(buf) if buf.len() + data.len() <= self.threshold => {
                buf.extend_from_slice(data);
            }

            Buffer::Memory(buf) => {
                log::debug!(
                    "field `{}` grew past {} bytes, spilling to {}",
                    self.field_name,
                    self.threshold,
                    self.temp_path.display(),
                );

                let mut file = File::create(&self.temp_path)?;
                file.write_all(buf)?;
                file.write_all(data)?;

                self.buffer = Buffer::Disk {
                    path: self.temp_path.clone(),
                    file: Some(file),
                };
            }

            Buffer::Disk {
                file: Some(file), ..
            } => file.write_all(data)?,

            Buffer::Disk { file: None, .. } => {
                return Err(io::Error::other("file item is no longer writable"));
            }
        }

        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Buffer::Disk {
            file: Some(file), ..
        } = &mut self.buffer
        {
            file.flush()
        } else {
            Ok(())
        }
    }
}

enum ReaderKind {
    Memory(Cursor<Vec<u8>>),
    Disk(File),
}

/// Reader over a [`FileItem`]'s content.
pub struct ItemReader(ReaderKind);

impl Read for ItemReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.0 {
            ReaderKind::Memory(cursor) => cursor.read(buf),
            ReaderKind::Disk(file) => file.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        env, process,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use assert_matches::assert_matches;

    use super::*;
    use crate::factory::FileItemFactory;

    static DEST_COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn dest_path() -> PathBuf {
        env::temp_dir().join(format!(
            "multipart-upload-test-{}-{}",
            process::id(),
            DEST_COUNTER.fetch_add(1, Ordering::Relaxed),
        ))
    }

    fn factory(threshold: usize) -> FileItemFactory {
        FileItemFactory::new().threshold(threshold)
    }

    fn form_item(factory: &FileItemFactory, value: &[u8]) -> FileItem {
        let mut item = factory.create_item("field", None, true, None);
        item.write_all(value).unwrap();
        item
    }

    #[test]
    fn stays_in_memory_at_exactly_the_threshold() {
        let factory = factory(4);

        let mut item = form_item(&factory, b"1234");
        assert!(item.is_in_memory());
        assert_eq!(item.size(), 4);
        assert_eq!(item.get().unwrap(), b"1234");
    }

    #[test]
    fn spills_one_byte_past_the_threshold() {
        let factory = factory(4);

        let mut item = form_item(&factory, b"12345");
        assert!(!item.is_in_memory());
        assert_eq!(item.size(), 5);
        assert_eq!(item.get().unwrap(), b"12345");

        item.delete().unwrap();
    }

    #[test]
    fn empty_item() {
        let factory = factory(1024);

        let mut item = factory.create_item("field", None, true, None);
        assert!(item.is_in_memory());
        assert_eq!(item.size(), 0);
        assert_eq!(item.get().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn incremental_writes_spill_once() {
        let factory = factory(8);

        let mut item = factory.create_item("field", None, true, None);
        item.write_all(b"aaaa").unwrap();
        assert!(item.is_in_memory());
        item.write_all(b"bbbb").unwrap();
        assert!(item.is_in_memory()); // exactly at the threshold
        item.write_all(b"c").unwrap();
        assert!(!item.is_in_memory());
        item.write_all(b"dd").unwrap();

        assert_eq!(item.get().unwrap(), b"aaaabbbbcdd");
        item.delete().unwrap();
    }

    #[test]
    fn reader_round_trip_memory_and_disk() {
        for threshold in [1024, 2] {
            let factory = factory(threshold);
            let mut item = form_item(&factory, b"roundtrip");

            let mut read_back = Vec::new();
            item.reader().unwrap().read_to_end(&mut read_back).unwrap();
            assert_eq!(read_back, b"roundtrip");

            if !item.is_in_memory() {
                item.delete().unwrap();
            }
        }
    }

    #[test]
    fn write_to_round_trip_memory_and_disk() {
        for threshold in [1024, 2] {
            let factory = factory(threshold);
            let mut item = form_item(&factory, b"finalized content");

            let dest = dest_path();
            item.write_to(&dest).unwrap();

            assert_eq!(fs::read(&dest).unwrap(), b"finalized content");
            assert_eq!(item.size(), 17);

            fs::remove_file(&dest).unwrap();
        }
    }

    #[test]
    fn disk_backed_write_to_works_only_once() {
        let factory = factory(2);
        let mut item = form_item(&factory, b"only once");

        let dest = dest_path();
        item.write_to(&dest).unwrap();

        // the backing temp file moved away with the first call
        assert_matches!(item.write_to(dest_path()), Err(MultipartError::Io(_)));

        fs::remove_file(&dest).unwrap();
    }

    #[test]
    fn write_to_replaces_existing_destination() {
        let factory = factory(1024);
        let mut item = form_item(&factory, b"new content");

        let dest = dest_path();
        fs::write(&dest, b"old content").unwrap();

        item.write_to(&dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"new content");

        fs::remove_file(&dest).unwrap();
    }

    #[test]
    fn delete_removes_the_backing_file() {
        let factory = factory(2);
        let mut item = form_item(&factory, b"spilled");
        assert!(!item.is_in_memory());

        item.delete().unwrap();
        assert_eq!(item.size(), 0); // backing file is gone

        // repeat deletion reports the filesystem error
        assert_matches!(item.delete(), Err(MultipartError::Io(_)));
    }

    #[test]
    fn delete_in_memory_is_idempotent() {
        let factory = factory(1024);
        let mut item = form_item(&factory, b"value");

        item.delete().unwrap();
        item.delete().unwrap();
        assert_eq!(item.get().unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn nul_in_file_name() {
        let factory = factory(1024);
        let item = factory.create_item(
            "upload",
            None,
            false,
            Some("a\u{0}b.txt".to_owned()),
        );

        assert_matches!(
            item.name(),
            Err(MultipartError::InvalidFileName { ref name }) if name == "a\\0b.txt"
        );
    }

    #[test]
    fn valid_file_name_passes_through() {
        let factory = factory(1024);
        let item = factory.create_item("upload", None, false, Some("fn.txt".to_owned()));

        assert_eq!(item.name().unwrap(), Some("fn.txt"));
        assert_eq!(item.field_name(), "upload");
        assert!(!item.is_form_field());
        assert_eq!(item.content_type(), None);
    }

    #[test]
    fn string_decodes_with_declared_charset() {
        let factory = factory(1024);
        let content_type: Mime = "text/plain; charset=utf-8".parse().unwrap();

        let mut item = factory.create_item("field", Some(content_type), true, None);
        item.write_all("grüße".as_bytes()).unwrap();

        assert_eq!(item.string(), "grüße");
        assert_eq!(item.string_with_charset("utf-8").unwrap(), "grüße");
    }

    #[test]
    fn string_with_unknown_charset() {
        let factory = factory(1024);
        let mut item = form_item(&factory, b"value");

        assert_matches!(
            item.string_with_charset("klingon-8"),
            Err(MultipartError::UnsupportedCharset { ref charset }) if charset == "klingon-8"
        );

        // the no-argument form swallows the same failure
        item.set_default_charset("klingon-8").unwrap_err();
        assert_eq!(item.string(), "value"); // default charset decodes anything
    }

    #[test]
    fn string_with_unknown_declared_charset_is_empty() {
        let factory = factory(1024);
        let content_type: Mime = "text/plain; charset=klingon-8".parse().unwrap();

        let mut item = factory.create_item("field", Some(content_type), true, None);
        item.write_all(b"value").unwrap();

        assert_eq!(item.string(), "");
    }

    #[test]
    fn string_with_charset_reports_malformed_content() {
        let factory = factory(1024);
        let mut item = factory.create_item("field", None, true, None);
        item.write_all(&[0xff, 0xfe, 0x41]).unwrap();

        assert_matches!(
            item.string_with_charset("utf-8"),
            Err(MultipartError::CharsetDecode { .. })
        );
    }
}
