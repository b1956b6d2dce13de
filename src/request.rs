//! Incoming HTTP request type.

use std::collections::HashMap;
use std::sync::OnceLock;

use bytes::{Bytes, BytesMut};
use percent_encoding::percent_decode_str;

use crate::channel::BodyReader;
use crate::cookie::parse_cookie_header;
use crate::error::Error;
use crate::form::{self, Files, Form, Query};
use crate::headers::Headers;
use crate::method::Method;

/// An incoming HTTP request.
///
/// Everything up to the end of the head is available right away, along with
/// whatever body bytes arrived in the same reads ([`Request::body`]). The rest
/// of the body is pulled from the connection on demand with
/// [`Request::chunk`], [`Request::raw_body`] or [`Request::parse_body`].
/// Whatever a handler leaves unread is discarded before the next request on
/// the connection is parsed.
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Bytes,
    pub(crate) path: String,
    pub(crate) query_string: String,
    pub(crate) headers: Headers,
    pub(crate) body: BytesMut,
    pub(crate) keep_alive: bool,
    pub(crate) upgrade: bool,
    pub(crate) params: HashMap<String, String>,
    cookies: OnceLock<HashMap<String, String>>,
    query: OnceLock<Query>,
    form: Option<Form>,
    files: Option<Files>,
    reader: BodyReader,
}

impl Request {
    pub(crate) fn new(url: Bytes, reader: BodyReader) -> Self {
        let (path, query_string) = split_target(&url);
        Self {
            method: Method::Get,
            url,
            path,
            query_string,
            headers: Headers::new(),
            body: BytesMut::new(),
            keep_alive: true,
            upgrade: false,
            params: HashMap::new(),
            cookies: OnceLock::new(),
            query: OnceLock::new(),
            form: None,
            files: None,
            reader,
        }
    }

    pub fn method(&self) -> Method { self.method }

    /// The request target exactly as sent.
    pub fn url(&self) -> &[u8] { &self.url }

    /// The percent-decoded path, without the query string.
    pub fn path(&self) -> &str { &self.path }

    /// The raw query string, without the `?`.
    pub fn query_string(&self) -> &str { &self.query_string }

    pub fn headers(&self) -> &Headers { &self.headers }

    /// Body bytes received so far. After [`Request::raw_body`] this is the
    /// whole body.
    pub fn body(&self) -> &[u8] { &self.body }

    /// The connection stays open after this exchange.
    pub fn keep_alive(&self) -> bool { self.keep_alive }

    /// The client asked to switch protocols.
    pub fn is_upgrade(&self) -> bool { self.upgrade }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    /// The `Content-Type` header, or `""`.
    pub fn content_type(&self) -> &str {
        self.header("Content-Type").unwrap_or_default()
    }

    /// The `Host` header, or `""`.
    pub fn host(&self) -> &str {
        self.header("Host").unwrap_or_default()
    }

    /// Cookies sent with the request, parsed on first access.
    pub fn cookies(&self) -> &HashMap<String, String> {
        self.cookies
            .get_or_init(|| self.header("Cookie").map(parse_cookie_header).unwrap_or_default())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies().get(name).map(String::as_str)
    }

    /// Query string parameters, parsed leniently on first access: blank
    /// values are kept and malformed pairs are tolerated.
    pub fn query(&self) -> &Query {
        self.query.get_or_init(|| {
            form_urlencoded::parse(self.query_string.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect()
        })
    }

    /// Pulls the next piece of the body off the connection. `None` at the
    /// end of the body. Pulled bytes are not added to [`Request::body`].
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        self.reader.chunk().await
    }

    /// Reads the rest of the body into [`Request::body`] and returns all of
    /// it.
    pub async fn raw_body(&mut self) -> Result<&[u8], Error> {
        while let Some(chunk) = self.reader.chunk().await? {
            self.body.extend_from_slice(&chunk);
        }
        Ok(&self.body)
    }

    /// Decodes the body according to its `Content-Type` and stores the
    /// result, available through [`Request::form`] and [`Request::files`].
    ///
    /// Media types without a decoder are [`Error::UnsupportedBody`];
    /// malformed bodies are [`Error::BadRequest`].
    pub async fn parse_body(&mut self) -> Result<(), Error> {
        let mut decoder = form::decoder_for(self.content_type())?;

        let mut outcome = if self.body.is_empty() { None } else { decoder.feed(&self.body) };
        while outcome.is_none() {
            outcome = match self.reader.chunk().await? {
                Some(chunk) => decoder.feed(&chunk),
                None => decoder.feed(b""),
            };
        }

        if let Some(result) = outcome {
            let decoded = result?;
            self.form = Some(decoded.form);
            self.files = Some(decoded.files);
        }
        Ok(())
    }

    /// Decoded form fields, once [`Request::parse_body`] succeeded.
    pub fn form(&self) -> Option<&Form> {
        self.form.as_ref()
    }

    /// Uploaded files, once [`Request::parse_body`] succeeded.
    pub fn files(&self) -> Option<&Files> {
        self.files.as_ref()
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("query_string", &self.query_string)
            .field("headers", &self.headers)
            .field("keep_alive", &self.keep_alive)
            .field("upgrade", &self.upgrade)
            .finish_non_exhaustive()
    }
}

/// Splits a request target into decoded path and raw query. Absolute-form
/// targets (`http://host/path`) are reduced to their path; fragments are
/// dropped.
fn split_target(url: &[u8]) -> (String, String) {
    let target = String::from_utf8_lossy(url);
    let mut rest: &str = &target;
    if !rest.starts_with('/') {
        if let Some(i) = rest.find("://") {
            let authority_and_path = &rest[i + 3..];
            rest = authority_and_path
                .find('/')
                .map_or("/", |j| &authority_and_path[j..]);
        }
    }
    let rest = rest.split('#').next().unwrap_or_default();
    let (path, query) = rest.split_once('?').unwrap_or((rest, ""));
    (percent_decode_str(path).decode_utf8_lossy().into_owned(), query.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(target: &str) -> Request {
        Request::new(Bytes::copy_from_slice(target.as_bytes()), BodyReader::detached())
    }

    #[test]
    fn path_is_decoded_query_is_raw() {
        let req = request("/caf%C3%A9/a+b?name=ada+lovelace&x=%2F");
        assert_eq!(req.path(), "/café/a+b");
        assert_eq!(req.query_string(), "name=ada+lovelace&x=%2F");
        assert_eq!(req.url(), b"/caf%C3%A9/a+b?name=ada+lovelace&x=%2F");
    }

    #[test]
    fn absolute_form_and_fragment() {
        assert_eq!(request("http://example.org/feeds?x=1").path(), "/feeds");
        assert_eq!(request("http://example.org").path(), "/");
        assert_eq!(request("/a#frag").path(), "/a");
    }

    #[test]
    fn query_is_lenient_and_keeps_blanks() {
        let req = request("/search?q=rust+async&tag=a&tag=b&empty=&flag");
        let query = req.query();
        assert_eq!(query.get("q").map(String::as_str), Some("rust async"));
        assert_eq!(query.list("tag"), ["a", "b"]);
        assert_eq!(query.get("empty").map(String::as_str), Some(""));
        assert_eq!(query.get("flag").map(String::as_str), Some(""));
    }

    #[test]
    fn cookies_are_parsed_lazily() {
        let mut req = request("/");
        req.headers.join("cookie", "session=abc; theme=dark");
        assert_eq!(req.cookie("session"), Some("abc"));
        assert_eq!(req.cookies().len(), 2);
    }

    #[test]
    fn missing_headers_read_as_empty() {
        let req = request("/");
        assert_eq!(req.content_type(), "");
        assert_eq!(req.host(), "");
    }

    #[tokio::test]
    async fn parse_body_uses_the_buffered_prefix() {
        let mut req = request("/form");
        req.headers.join("content-type", "application/x-www-form-urlencoded");
        req.body.extend_from_slice(b"a=1&b=two&a=3");
        req.parse_body().await.unwrap();
        let form = req.form().unwrap();
        assert_eq!(form.list("a"), ["1", "3"]);
        assert_eq!(form.get("b").map(String::as_str), Some("two"));
        assert!(req.files().unwrap().is_empty());
    }

    #[tokio::test]
    async fn parse_body_rejects_unknown_media_types() {
        let mut req = request("/form");
        req.headers.join("content-type", "application/json");
        assert!(matches!(req.parse_body().await, Err(Error::UnsupportedBody(_))));
    }
}
