//! Request body decoders.
//!
//! A decoder is chosen from the request's `Content-Type` and then fed the
//! body chunk by chunk. Feeding an empty chunk signals the end of the body;
//! the decoder answers with the decoded form fields and files, or an error.
//!
//! ```rust
//! use hearth::form::decoder_for;
//!
//! let mut decoder = decoder_for("application/x-www-form-urlencoded").unwrap();
//! assert!(decoder.feed(b"name=ada&lang=en&lang=").is_none());
//! assert!(decoder.feed(b"fr").is_none());
//! let decoded = decoder.feed(b"").unwrap().unwrap();
//! assert_eq!(decoded.form.get("name").map(String::as_str), Some("ada"));
//! assert_eq!(decoded.form.list("lang"), ["en", "fr"]);
//! ```

mod multipart;
mod urlencoded;

use std::collections::HashMap;
use std::io;
use std::str::FromStr;

use bytes::{Buf, Bytes};

use crate::error::{Error, HttpError};

pub use multipart::Multipart;
pub use urlencoded::UrlEncoded;

pub const MULTIPART: &str = "multipart/form-data";
pub const URLENCODED: &str = "application/x-www-form-urlencoded";

const TRUE_STRINGS: &[&str] = &["t", "true", "yes", "1", "on"];
const FALSE_STRINGS: &[&str] = &["f", "false", "no", "0", "off"];
const NONE_STRINGS: &[&str] = &["none", "null"];

/// What a decoder produced once the whole body went through it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Decoded {
    pub form: Form,
    pub files: Files,
}

/// Incremental body decoder. See the [module docs](self).
pub trait BodyDecoder: Send {
    /// Feeds the next chunk. Returns `None` while more input is expected.
    /// An empty chunk ends the body and always yields `Some`.
    fn feed(&mut self, chunk: &[u8]) -> Option<Result<Decoded, Error>>;
}

/// Picks the decoder for a `Content-Type` header value. The media type must
/// match exactly; anything else is [`Error::UnsupportedBody`].
pub fn decoder_for(content_type: &str) -> Result<Box<dyn BodyDecoder>, Error> {
    let media_type = content_type.split(';').next().unwrap_or_default().trim();
    match media_type {
        MULTIPART => Ok(Box::new(Multipart::new(content_type)?)),
        URLENCODED => Ok(Box::new(UrlEncoded::new())),
        other => Err(Error::UnsupportedBody(other.to_owned())),
    }
}

// ── MultiDict ─────────────────────────────────────────────────────────────────

/// A map from keys to one or more values, in arrival order per key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MultiDict<V> {
    entries: HashMap<String, Vec<V>>,
}

/// Decoded form fields.
pub type Form = MultiDict<String>;
/// Decoded query string parameters.
pub type Query = MultiDict<String>;
/// Uploaded files from a multipart body.
pub type Files = MultiDict<FilePart>;

impl<V> Default for MultiDict<V> {
    fn default() -> Self {
        Self { entries: HashMap::new() }
    }
}

impl<V> MultiDict<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// The first value for `key`.
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key).and_then(|values| values.first())
    }

    /// Every value for `key`; empty when absent.
    pub fn list(&self, key: &str) -> &[V] {
        self.entries.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn push(&mut self, key: impl Into<String>, value: V) {
        self.entries.entry(key.into()).or_default().push(value);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[V])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V> FromIterator<(K, V)> for MultiDict<V> {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut dict = Self::new();
        for (key, value) in iter {
            dict.push(key, value);
        }
        dict
    }
}

impl MultiDict<String> {
    /// The first value for `key`, or a `400` naming the missing key.
    pub fn require(&self, key: &str) -> Result<&str, HttpError> {
        self.get(key)
            .map(String::as_str)
            .ok_or_else(|| HttpError::bad_request(format!("Missing '{key}' key")))
    }

    /// The first value for `key` converted with [`FromStr`]. Absent is
    /// `Ok(None)`; a value that does not convert is a `400`.
    ///
    /// ```rust
    /// use hearth::form::Query;
    ///
    /// let query: Query = [("page", "3"), ("size", "big")].into_iter()
    ///     .map(|(k, v)| (k, v.to_owned()))
    ///     .collect();
    /// assert_eq!(query.parse::<u32>("page").unwrap(), Some(3));
    /// assert_eq!(query.parse::<u32>("offset").unwrap(), None);
    /// assert!(query.parse::<u32>("size").is_err());
    /// ```
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>, HttpError> {
        self.get(key)
            .map(|value| {
                value.parse().map_err(|_| {
                    HttpError::bad_request(format!(
                        "Wrong type for '{key}': expected {}",
                        std::any::type_name::<T>()
                    ))
                })
            })
            .transpose()
    }

    /// The first value for `key` read as a boolean: `t true yes 1 on` and
    /// `f false no 0 off`, case-insensitive. `none`, `null` and absence are
    /// `Ok(None)`; anything else is a `400`.
    pub fn flag(&self, key: &str) -> Result<Option<bool>, HttpError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let value = value.to_ascii_lowercase();
        if TRUE_STRINGS.contains(&value.as_str()) {
            Ok(Some(true))
        } else if FALSE_STRINGS.contains(&value.as_str()) {
            Ok(Some(false))
        } else if NONE_STRINGS.contains(&value.as_str()) {
            Ok(None)
        } else {
            Err(HttpError::bad_request(format!("Wrong boolean value for '{key}'")))
        }
    }
}

// ── FilePart ──────────────────────────────────────────────────────────────────

/// An uploaded file from a multipart body, held in memory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FilePart {
    pub(crate) filename: Option<String>,
    pub(crate) content_type: String,
    pub(crate) params: Vec<(String, String)>,
    pub(crate) content: Bytes,
}

impl FilePart {
    /// The client-side file name, decoded from `filename*` when present.
    pub fn filename(&self) -> Option<&str> {
        self.filename.as_deref()
    }

    /// The part's media type, without parameters.
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Parameters of the part's `Content-Type`, such as `charset`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    /// A fresh reader positioned at the start of the content.
    pub fn reader(&self) -> impl io::Read + use<> {
        self.content.clone().reader()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

// ── Header parameters ─────────────────────────────────────────────────────────

/// Splits a header value like `form-data; name="a;b"; filename*=utf-8''x`
/// into its leading token and its parameters. Parameter names are
/// lowercased; quoted values are unquoted. Values stay as bytes since
/// `filename*` may carry raw non-UTF-8 octets.
pub(crate) fn parse_params(value: &[u8]) -> (String, Vec<(String, Vec<u8>)>) {
    let mut segments = split_unquoted(value, b';').into_iter();
    let token = segments
        .next()
        .map(|s| String::from_utf8_lossy(s.trim_ascii()).to_ascii_lowercase())
        .unwrap_or_default();

    let params = segments
        .filter_map(|segment| {
            let eq = memchr::memchr(b'=', segment)?;
            let name = String::from_utf8_lossy(segment[..eq].trim_ascii()).to_ascii_lowercase();
            if name.is_empty() {
                return None;
            }
            Some((name, unquote(segment[eq + 1..].trim_ascii())))
        })
        .collect();
    (token, params)
}

fn split_unquoted(value: &[u8], separator: u8) -> Vec<&[u8]> {
    let mut segments = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (i, &b) in value.iter().enumerate() {
        if escaped {
            escaped = false;
        } else if quoted && b == b'\\' {
            escaped = true;
        } else if b == b'"' {
            quoted = !quoted;
        } else if b == separator && !quoted {
            segments.push(&value[start..i]);
            start = i + 1;
        }
    }
    segments.push(&value[start..]);
    segments
}

fn unquote(value: &[u8]) -> Vec<u8> {
    let Some(inner) = value.strip_prefix(b"\"").and_then(|v| v.strip_suffix(b"\"")) else {
        return value.to_vec();
    };
    let mut out = Vec::with_capacity(inner.len());
    let mut escaped = false;
    for &b in inner {
        if !escaped && b == b'\\' {
            escaped = true;
            continue;
        }
        escaped = false;
        out.push(b);
    }
    out
}

/// Decodes an RFC 5987 extended value, `charset'language'percent-encoded`.
/// Unknown charsets and malformed values yield `None`.
pub(crate) fn decode_ext_value(value: &[u8]) -> Option<String> {
    let mut pieces = value.splitn(3, |&b| b == b'\'');
    let charset = pieces.next()?;
    let _language = pieces.next()?;
    let encoded = pieces.next()?;
    let raw: Vec<u8> = percent_encoding::percent_decode(encoded).collect();

    match String::from_utf8_lossy(charset).to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" => String::from_utf8(raw).ok(),
        "iso-8859-1" | "iso8859-1" | "latin1" | "latin-1" => {
            Some(raw.into_iter().map(char::from).collect())
        }
        "us-ascii" | "ascii" => raw.is_ascii().then(|| raw.into_iter().map(char::from).collect()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> Form {
        pairs.iter().map(|&(k, v)| (k, v.to_owned())).collect()
    }

    #[test]
    fn unsupported_media_type() {
        let err = decoder_for("application/json").err().unwrap();
        assert!(matches!(&err, Error::UnsupportedBody(t) if t == "application/json"));
        assert_eq!(err.to_string(), "don't know how to parse application/json");
        assert!(decoder_for("multipart/form-data-ish; boundary=x").is_err());
    }

    #[test]
    fn media_type_parameters_are_ignored_for_dispatch() {
        assert!(decoder_for("application/x-www-form-urlencoded; charset=utf-8").is_ok());
        assert!(decoder_for("multipart/form-data; boundary=foo").is_ok());
    }

    #[test]
    fn multidict_keeps_value_order() {
        let dict = form(&[("a", "1"), ("b", "2"), ("a", "3")]);
        assert_eq!(dict.len(), 2);
        assert_eq!(dict.get("a").map(String::as_str), Some("1"));
        assert_eq!(dict.list("a"), ["1", "3"]);
        assert!(dict.list("missing").is_empty());
    }

    #[test]
    fn flags() {
        let dict = form(&[("a", "YES"), ("b", "off"), ("c", "null"), ("d", "maybe")]);
        assert_eq!(dict.flag("a").unwrap(), Some(true));
        assert_eq!(dict.flag("b").unwrap(), Some(false));
        assert_eq!(dict.flag("c").unwrap(), None);
        assert_eq!(dict.flag("missing").unwrap(), None);
        assert_eq!(dict.flag("d").unwrap_err().status(), crate::Status::BadRequest);
    }

    #[test]
    fn require_names_the_missing_key() {
        let err = form(&[]).require("id").unwrap_err();
        assert_eq!(err.message(), b"Missing 'id' key");
    }

    #[test]
    fn params_respect_quotes() {
        let (token, params) = parse_params(br#"Form-Data; name="a;b"; filename="say \"hi\".txt""#);
        assert_eq!(token, "form-data");
        assert_eq!(params[0], ("name".to_owned(), b"a;b".to_vec()));
        assert_eq!(params[1], ("filename".to_owned(), br#"say "hi".txt"#.to_vec()));
    }

    #[test]
    fn extended_values() {
        assert_eq!(decode_ext_value(b"utf-8''caf%C3%A9.png").as_deref(), Some("café.png"));
        assert_eq!(decode_ext_value(b"iso-8859-1''baz-\xe9.png").as_deref(), Some("baz-é.png"));
        assert_eq!(decode_ext_value(b"ISO-8859-1'en'%E9t%E9").as_deref(), Some("été"));
        assert_eq!(decode_ext_value(b"us-ascii''plain").as_deref(), Some("plain"));
        assert_eq!(decode_ext_value(b"koi8-r''x"), None);
        assert_eq!(decode_ext_value(b"no-quotes"), None);
    }

    #[test]
    fn file_reader_starts_at_the_beginning() {
        use std::io::Read;

        let part = FilePart {
            filename: Some("a.txt".into()),
            content_type: "text/plain".into(),
            params: vec![("charset".into(), "utf-8".into())],
            content: Bytes::from_static(b"abcdef"),
        };
        for _ in 0..2 {
            let mut out = String::new();
            part.reader().read_to_string(&mut out).unwrap();
            assert_eq!(out, "abcdef");
        }
        assert_eq!(part.param("Charset"), Some("utf-8"));
    }
}
