//! The `Content-Disposition` header and associated types.
//!
//! # References
//! - "The Content-Disposition Header Field": <https://datatracker.ietf.org/doc/html/rfc2183>
//! - "Returning Values from Forms: multipart/form-data":
//!   <https://datatracker.ietf.org/doc/html/rfc7578>

use crate::error::MultipartError;

/// Split at the index of the first `needle` if it exists or at the end.
fn split_once(haystack: &str, needle: char) -> (&str, &str) {
    haystack.find(needle).map_or_else(
        || (haystack, ""),
        |sc| {
            let (first, last) = haystack.split_at(sc);
            (first, last.split_at(1).1)
        },
    )
}

/// Split at the index of the first `needle` if it exists or at the end, trim the right of the
/// first part and the left of the last part.
fn split_once_and_trim(haystack: &str, needle: char) -> (&str, &str) {
    let (first, last) = split_once(haystack, needle);
    (first.trim_end(), last.trim_start())
}

/// The implied disposition of the content of the part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispositionType {
    /// Inline implies default processing.
    Inline,

    /// Attachment implies that the recipient should prompt the user to save the content locally.
    Attachment,

    /// Used in *multipart/form-data* as defined in
    /// [RFC 7578](https://datatracker.ietf.org/doc/html/rfc7578) to carry the field name and
    /// optional filename.
    FormData,

    /// Extension type. Should be handled by recipients the same way as Attachment.
    Ext(String),
}

impl<'a> From<&'a str> for DispositionType {
    fn from(origin: &'a str) -> DispositionType {
        if origin.eq_ignore_ascii_case("inline") {
            DispositionType::Inline
        } else if origin.eq_ignore_ascii_case("attachment") {
            DispositionType::Attachment
        } else if origin.eq_ignore_ascii_case("form-data") {
            DispositionType::FormData
        } else {
            DispositionType::Ext(origin.to_owned())
        }
    }
}

/// Parameter in [`ContentDisposition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispositionParam {
    /// For [`DispositionType::FormData`] (i.e. *multipart/form-data*), the name of a field from
    /// the form.
    Name(String),

    /// A plain file name. May be an empty string; an empty file name still marks the part as a
    /// file field.
    Filename(String),

    /// Any other parameter, including extended (`*`-suffixed) parameters, which are kept opaque;
    /// `filename*` [must not appear](https://datatracker.ietf.org/doc/html/rfc7578#section-4.2)
    /// in *multipart/form-data*. Recipients should ignore unrecognizable parameters.
    Unknown(String, String),
}

impl DispositionParam {
    /// Returns the name value if this parameter is a [`Name`](DispositionParam::Name).
    pub fn as_name(&self) -> Option<&str> {
        match self {
            DispositionParam::Name(name) => Some(name.as_str()),
            _ => None,
        }
    }

    /// Returns the filename value if this parameter is a
    /// [`Filename`](DispositionParam::Filename).
    pub fn as_filename(&self) -> Option<&str> {
        match self {
            DispositionParam::Filename(filename) => Some(filename.as_str()),
            _ => None,
        }
    }
}

/// A parsed `Content-Disposition` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDisposition {
    /// The disposition type.
    pub disposition: DispositionType,

    /// Disposition parameters in the order they appeared.
    pub parameters: Vec<DispositionParam>,
}

impl ContentDisposition {
    /// Parses a raw Content-Disposition header value.
    pub fn from_raw(value: &str) -> Result<Self, MultipartError> {
        let (disp_type, mut left) = split_once_and_trim(value.trim(), ';');
        if disp_type.is_empty() {
            return Err(MultipartError::Headers);
        }

        let mut cd = ContentDisposition {
            disposition: disp_type.into(),
            parameters: Vec::new(),
        };

        while !left.is_empty() {
            let (param_name, new_left) = split_once_and_trim(left, '=');
            if param_name.is_empty() || param_name == "*" || new_left.is_empty() {
                return Err(MultipartError::Headers);
            }
            left = new_left;

            if let Some(ext_name) = param_name.strip_suffix('*') {
                // extended parameters are carried opaquely
                let (ext_value, new_left) = split_once_and_trim(left, ';');
                left = new_left;
                cd.parameters.push(DispositionParam::Unknown(
                    format!("{ext_name}*"),
                    ext_value.to_owned(),
                ));
                continue;
            }

            let value = if left.starts_with('\"') {
                // quoted-string: defined in RFC 6266 -> RFC 2616 Section 3.6
                let mut escaping = false;
                let mut quoted_string = vec![];
                let mut end = None;

                // search for closing quote
                for (i, &c) in left.as_bytes().iter().skip(1).enumerate() {
                    if escaping {
                        escaping = false;
                        quoted_string.push(c);
                    } else if c == 0x5c {
                        // backslash
                        escaping = true;
                    } else if c == 0x22 {
                        // double quote
                        end = Some(i + 1); // cuz skipped 1 for the leading quote
                        break;
                    } else {
                        quoted_string.push(c);
                    }
                }

                left = &left[end.ok_or(MultipartError::Headers)? + 1..];
                left = split_once(left, ';').1.trim_start();

                String::from_utf8(quoted_string).map_err(|_| MultipartError::Headers)?
            } else {
                // token: can not contain a semicolon according to RFC 2616 Section 2.2
                let (token, new_left) = split_once_and_trim(left, ';');
                left = new_left;
                if token.is_empty() {
                    // quoted-string can be empty, but token can not
                    return Err(MultipartError::Headers);
                }
                token.to_owned()
            };

            let param = if param_name.eq_ignore_ascii_case("name") {
                DispositionParam::Name(value)
            } else if param_name.eq_ignore_ascii_case("filename") {
                DispositionParam::Filename(value)
            } else {
                DispositionParam::Unknown(param_name.to_owned(), value)
            };
            cd.parameters.push(param);
        }

        Ok(cd)
    }

    /// Returns `true` if type is [`FormData`](DispositionType::FormData).
    pub fn is_form_data(&self) -> bool {
        matches!(self.disposition, DispositionType::FormData)
    }

    /// Returns the value of *name* if it exists.
    pub fn get_name(&self) -> Option<&str> {
        self.parameters.iter().find_map(DispositionParam::as_name)
    }

    /// Returns the value of *filename* if it exists.
    pub fn get_filename(&self) -> Option<&str> {
        self.parameters
            .iter()
            .find_map(DispositionParam::as_filename)
    }
}
