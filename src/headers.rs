//! Part header block parsing and the header multimap.

use crate::error::MultipartError;

/// Most part header blocks carry 2-3 headers; anything past this is hostile.
pub(crate) const MAX_HEADERS: usize = 32;

/// Cap on the raw header block so a blank-line-free stream can not balloon
/// the lookahead buffer.
pub(crate) const MAX_HEADER_BLOCK: usize = 8 * 1024;

pub(crate) const CONTENT_DISPOSITION: &str = "Content-Disposition";
pub(crate) const CONTENT_TYPE: &str = "Content-Type";

/// Ordered multimap of a part's headers.
///
/// Insertion order is preserved across all headers. Name lookups are
/// ASCII-case-insensitive while stored names keep the spelling they arrived
/// with.
#[derive(Debug, Clone, Default)]
pub struct PartHeaders {
    inner: Vec<(String, String)>,
}

impl PartHeaders {
    pub(crate) fn empty() -> Self {
        PartHeaders { inner: Vec::new() }
    }

    /// Parses a raw header block, terminated by a blank line.
    ///
    /// Folded continuation lines are merged into the preceding logical line.
    /// Logical lines without a colon are dropped with a warning; multipart
    /// producers vary too much in strictness for them to be fatal.
    pub(crate) fn parse(block: &[u8]) -> Result<Self, MultipartError> {
        let mut logical: Vec<Vec<u8>> = Vec::new();

        for line in block.split(|&byte| byte == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if line.is_empty() {
                continue;
            }

            if line[0] == b' ' || line[0] == b'\t' {
                // folded continuation line, equivalent to a single space
                let continuation = line
                    .iter()
                    .position(|&byte| byte != b' ' && byte != b'\t')
                    .map_or(&[][..], |at| &line[at..]);

                match logical.last_mut() {
                    Some(prev) => {
                        prev.push(b' ');
                        prev.extend_from_slice(continuation);
                    }
                    None => log::warn!("part header block starts with a continuation line"),
                }

                continue;
            }

            logical.push(line.to_vec());
        }

        logical.retain(|line| {
            let keep = line.contains(&b':');
            if !keep {
                log::warn!(
                    "skipping malformed part header line: {:?}",
                    String::from_utf8_lossy(line)
                );
            }
            keep
        });

        if logical.len() > MAX_HEADERS {
            return Err(MultipartError::Headers);
        }

        let mut rebuilt = Vec::with_capacity(block.len() + 2);
        for line in &logical {
            rebuilt.extend_from_slice(line);
            rebuilt.extend_from_slice(b"\r\n");
        }
        rebuilt.extend_from_slice(b"\r\n");

        let mut parsed = [httparse::EMPTY_HEADER; MAX_HEADERS];

        match httparse::parse_headers(&rebuilt, &mut parsed) {
            Ok(httparse::Status::Complete((_, parsed))) => {
                let mut headers = PartHeaders {
                    inner: Vec::with_capacity(parsed.len()),
                };

                for header in parsed {
                    headers.inner.push((
                        header.name.to_owned(),
                        String::from_utf8_lossy(header.value).into_owned(),
                    ));
                }

                Ok(headers)
            }

            Ok(httparse::Status::Partial) | Err(_) => Err(MultipartError::Headers),
        }
    }

    /// Returns the first value for `name`, if any.
    pub fn get<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.get_all(name).next()
    }

    /// Returns all values for `name` in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.inner
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Iterates over all `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn ordered_multimap() {
        let headers = PartHeaders::parse(
            b"Content-Disposition: form-data; name=\"f\"\r\n\
              X-Trace: one\r\n\
              x-trace: two\r\n\
              \r\n",
        )
        .unwrap();

        assert_eq!(headers.len(), 3);
        assert_eq!(
            headers.get("content-disposition"),
            Some("form-data; name=\"f\""),
        );

        let values: Vec<_> = headers.get_all("X-TRACE").collect();
        assert_eq!(values, ["one", "two"]);

        // original spelling of the first occurrence is preserved
        let names: Vec<_> = headers.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["Content-Disposition", "X-Trace", "x-trace"]);
    }

    #[test]
    fn folded_lines_are_unfolded() {
        let headers = PartHeaders::parse(
            b"Content-Type: multipart/alternative;\r\n\
              \tcharset=utf-8\r\n\
              \r\n",
        )
        .unwrap();

        assert_eq!(
            headers.get("Content-Type"),
            Some("multipart/alternative; charset=utf-8"),
        );
    }

    #[test]
    fn colonless_lines_are_skipped() {
        let headers = PartHeaders::parse(
            b"this is not a header\r\n\
              Content-Type: text/plain\r\n\
              \r\n",
        )
        .unwrap();

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("Content-Type"), Some("text/plain"));
    }

    #[test]
    fn too_many_headers() {
        let mut block = Vec::new();
        for i in 0..(MAX_HEADERS + 1) {
            block.extend_from_slice(format!("X-Filler-{i}: v\r\n").as_bytes());
        }
        block.extend_from_slice(b"\r\n");

        assert_matches!(PartHeaders::parse(&block), Err(MultipartError::Headers));
    }

    #[test]
    fn empty_block() {
        let headers = PartHeaders::empty();
        assert!(headers.is_empty());
        assert_eq!(headers.get("anything"), None);
    }
}
