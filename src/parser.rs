//! Incremental HTTP/1.1 request parser.
//!
//! Bytes go in with [`Parser::feed`], events come out with
//! [`Parser::next_event`]. The parser keeps its state between calls, so a
//! request can arrive in any number of reads (one byte at a time included)
//! and produce the same method, URL, headers and body as if it had arrived in
//! a single read. Only the way the body is cut into [`Event::Body`] chunks
//! depends on how the input was split.
//!
//! ```rust
//! use hearth::{Event, Parser};
//!
//! let mut parser = Parser::default();
//! parser.feed(b"GET /feeds HTTP/1.1\r\nHost: local");
//! assert_eq!(parser.next_event().unwrap(), None);
//!
//! parser.feed(b"host\r\n\r\n");
//! assert!(matches!(parser.next_event().unwrap(), Some(Event::Url(_))));
//! assert!(matches!(parser.next_event().unwrap(), Some(Event::Header { .. })));
//! assert!(matches!(parser.next_event().unwrap(), Some(Event::HeadersComplete(_))));
//! assert_eq!(parser.next_event().unwrap(), Some(Event::MessageComplete));
//! ```
//!
//! The head is located by scanning for the blank line and then tokenized with
//! `httparse`. Bodies are framed per RFC 7230 §3.3.3: chunked when the final
//! transfer coding is `chunked`, otherwise `Content-Length`, otherwise empty.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::Error;
use crate::method::Method;

/// Longest line (request line, header field, chunk-size line) accepted.
pub const DEFAULT_MAX_FIELD_SIZE: usize = 64 * 1024;

/// Same bound hyper uses for the `httparse` header array.
const MAX_HEADERS: usize = 100;

/// A parsing event, in the order the parser emits them for one message:
/// `Url`, zero or more `Header`, `HeadersComplete`, zero or more `Body`,
/// `MessageComplete`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Event {
    /// The raw request target, exactly as sent.
    Url(Bytes),
    /// A header field with a non-empty value. Names are passed through as
    /// sent; values are trimmed.
    Header { name: String, value: String },
    HeadersComplete(Head),
    Body(Bytes),
    MessageComplete,
}

/// What the parser derived from a complete request head.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Head {
    pub method: Method,
    /// Minor version: `1` for HTTP/1.1, `0` for HTTP/1.0.
    pub version: u8,
    pub keep_alive: bool,
    /// The client asked to switch protocols. After this message the parser
    /// stops interpreting bytes; see [`Parser::take_remaining`].
    pub upgrade: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request: {0}")]
    Malformed(httparse::Error),
    #[error("invalid method")]
    InvalidMethod,
    #[error("field exceeds {0} bytes")]
    FieldTooLarge(usize),
    #[error("too many headers")]
    TooManyHeaders,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("unsupported Transfer-Encoding")]
    InvalidTransferEncoding,
    #[error("invalid chunked encoding")]
    InvalidChunk,
}

impl From<httparse::Error> for ParseError {
    fn from(e: httparse::Error) -> Self {
        match e {
            httparse::Error::TooManyHeaders => Self::TooManyHeaders,
            other => Self::Malformed(other),
        }
    }
}

impl From<ParseError> for Error {
    fn from(e: ParseError) -> Self {
        Error::BadRequest(e.to_string())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    Head,
    Length(u64),
    Chunked(Chunk),
    Upgraded,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

/// Resumable request parser. One per connection; it moves from one message
/// to the next on its own.
pub struct Parser {
    buf: BytesMut,
    state: State,
    events: VecDeque<Event>,
    max_field_size: usize,
    /// Offset into `buf` up to which the head terminator has been searched.
    scanned: usize,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FIELD_SIZE)
    }
}

impl Parser {
    pub fn new(max_field_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            state: State::Head,
            events: VecDeque::new(),
            max_field_size,
            scanned: 0,
        }
    }

    /// Appends newly read bytes.
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pulls the next event. `Ok(None)` means more input is needed.
    ///
    /// After an error the parser is unusable; the connection must be closed.
    pub fn next_event(&mut self) -> Result<Option<Event>, ParseError> {
        loop {
            if let Some(event) = self.events.pop_front() {
                return Ok(Some(event));
            }
            let progressed = match self.state {
                State::Head => self.advance_head()?,
                State::Length(remaining) => {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let n = self.take_body(remaining);
                    self.state = match remaining - n {
                        0 => {
                            self.events.push_back(Event::MessageComplete);
                            State::Head
                        }
                        left => State::Length(left),
                    };
                    true
                }
                State::Chunked(chunk) => self.advance_chunked(chunk)?,
                State::Upgraded => false,
            };
            if !progressed {
                return Ok(None);
            }
        }
    }

    /// No message is in progress and nothing is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == State::Head && self.buf.is_empty() && self.events.is_empty()
    }

    pub fn is_upgraded(&self) -> bool {
        self.state == State::Upgraded
    }

    /// Hands over every byte received but not consumed, typically the first
    /// frames of the protocol a connection upgraded to.
    pub fn take_remaining(&mut self) -> Bytes {
        self.buf.split().freeze()
    }

    fn take_body(&mut self, remaining: u64) -> u64 {
        let n = remaining.min(self.buf.len() as u64);
        let chunk = self.buf.split_to(n as usize).freeze();
        self.events.push_back(Event::Body(chunk));
        n
    }

    fn advance_head(&mut self) -> Result<bool, ParseError> {
        // RFC 7230 §3.5: ignore empty lines received before the request line.
        while self.buf.starts_with(b"\r\n") || self.buf.starts_with(b"\n") {
            let n = if self.buf[0] == b'\r' { 2 } else { 1 };
            self.buf.advance(n);
            self.scanned = 0;
        }

        match self.find_head_end() {
            Some(end) => {
                self.parse_head(end)?;
                Ok(true)
            }
            None => {
                self.check_partial_head()?;
                Ok(false)
            }
        }
    }

    /// Index one past the blank line ending the head, if buffered.
    fn find_head_end(&mut self) -> Option<usize> {
        let start = self.scanned;
        for i in memchr::memchr_iter(b'\n', &self.buf[start..]).map(|i| i + start) {
            match self.buf.get(i + 1) {
                Some(b'\n') => return Some(i + 2),
                Some(b'\r') => match self.buf.get(i + 2) {
                    Some(b'\n') => return Some(i + 3),
                    Some(_) => continue,
                    None => {
                        self.scanned = i;
                        return None;
                    }
                },
                Some(_) => continue,
                None => {
                    self.scanned = i;
                    return None;
                }
            }
        }
        self.scanned = self.buf.len();
        None
    }

    /// Rejects an incomplete head as early as its bytes allow: an over-long
    /// line, or a request line that can no longer become valid.
    fn check_partial_head(&self) -> Result<(), ParseError> {
        let line_start = memchr::memrchr(b'\n', &self.buf).map_or(0, |i| i + 1);
        if self.buf.len() - line_start > self.max_field_size {
            return Err(ParseError::FieldTooLarge(self.max_field_size));
        }
        if line_start == 0 {
            return Ok(());
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        req.parse(&self.buf)?;
        match req.method {
            Some(method) if method.parse::<Method>().is_err() => Err(ParseError::InvalidMethod),
            _ => Ok(()),
        }
    }

    fn parse_head(&mut self, end: usize) -> Result<(), ParseError> {
        let head = self.buf.split_to(end).freeze();
        self.scanned = 0;

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        if req.parse(&head)?.is_partial() {
            return Err(ParseError::Malformed(httparse::Error::NewLine));
        }

        let method: Method = req
            .method
            .and_then(|m| m.parse().ok())
            .ok_or(ParseError::InvalidMethod)?;
        let target = req.path.unwrap_or("/");
        if target.len() > self.max_field_size {
            return Err(ParseError::FieldTooLarge(self.max_field_size));
        }
        let version = req.version.unwrap_or(1);

        self.events.push_back(Event::Url(head.slice_ref(target.as_bytes())));

        let mut content_length: Option<u64> = None;
        let mut transfer_encoding = false;
        let mut chunked = false;
        let mut connection_close = false;
        let mut connection_keep_alive = false;
        let mut connection_upgrade = false;
        let mut upgrade_header = false;

        for header in req.headers.iter() {
            if header.name.len() + header.value.len() + 2 > self.max_field_size {
                return Err(ParseError::FieldTooLarge(self.max_field_size));
            }
            let value = String::from_utf8_lossy(header.value);
            let value = value.trim();

            if header.name.eq_ignore_ascii_case("content-length") {
                let length = parse_content_length(value)?;
                match content_length {
                    Some(existing) if existing != length => {
                        return Err(ParseError::InvalidContentLength);
                    }
                    _ => content_length = Some(length),
                }
            } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
                transfer_encoding = true;
                // Only the final coding matters, across repeated fields too.
                if let Some(last) = value.rsplit(',').map(str::trim).find(|t| !t.is_empty()) {
                    chunked = last.eq_ignore_ascii_case("chunked");
                }
            } else if header.name.eq_ignore_ascii_case("connection") {
                for token in value.split(',').map(str::trim) {
                    if token.eq_ignore_ascii_case("close") {
                        connection_close = true;
                    } else if token.eq_ignore_ascii_case("keep-alive") {
                        connection_keep_alive = true;
                    } else if token.eq_ignore_ascii_case("upgrade") {
                        connection_upgrade = true;
                    }
                }
            } else if header.name.eq_ignore_ascii_case("upgrade") {
                upgrade_header = true;
            }

            if !value.is_empty() {
                self.events.push_back(Event::Header {
                    name: header.name.to_owned(),
                    value: value.to_owned(),
                });
            }
        }

        let keep_alive = match version {
            0 => connection_keep_alive && !connection_close,
            _ => !connection_close,
        };
        let upgrade = method == Method::Connect || (upgrade_header && connection_upgrade);

        self.events.push_back(Event::HeadersComplete(Head { method, version, keep_alive, upgrade }));

        if upgrade {
            self.events.push_back(Event::MessageComplete);
            self.state = State::Upgraded;
            return Ok(());
        }

        self.state = if transfer_encoding {
            // RFC 7230 §3.3.3: a request whose final coding is not chunked
            // has no determinable length; both headers together is smuggling.
            if !chunked || content_length.is_some() {
                return Err(ParseError::InvalidTransferEncoding);
            }
            State::Chunked(Chunk::Size)
        } else {
            match content_length {
                Some(length) if length > 0 => State::Length(length),
                _ => {
                    self.events.push_back(Event::MessageComplete);
                    State::Head
                }
            }
        };
        Ok(())
    }

    fn advance_chunked(&mut self, chunk: Chunk) -> Result<bool, ParseError> {
        match chunk {
            Chunk::Size => match httparse::parse_chunk_size(&self.buf) {
                Ok(httparse::Status::Complete((consumed, size))) => {
                    self.buf.advance(consumed);
                    self.state = State::Chunked(match size {
                        0 => Chunk::Trailer,
                        size => Chunk::Data(size),
                    });
                    Ok(true)
                }
                Ok(httparse::Status::Partial) => {
                    if self.buf.len() > self.max_field_size {
                        return Err(ParseError::FieldTooLarge(self.max_field_size));
                    }
                    Ok(false)
                }
                Err(_) => Err(ParseError::InvalidChunk),
            },
            Chunk::Data(remaining) => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let n = self.take_body(remaining);
                self.state = State::Chunked(match remaining - n {
                    0 => Chunk::DataEnd,
                    left => Chunk::Data(left),
                });
                Ok(true)
            }
            Chunk::DataEnd => {
                if self.buf.first().is_some_and(|&b| b != b'\r') {
                    return Err(ParseError::InvalidChunk);
                }
                if self.buf.len() < 2 {
                    return Ok(false);
                }
                if &self.buf[..2] != b"\r\n" {
                    return Err(ParseError::InvalidChunk);
                }
                self.buf.advance(2);
                self.state = State::Chunked(Chunk::Size);
                Ok(true)
            }
            Chunk::Trailer => {
                let Some(i) = memchr::memchr(b'\n', &self.buf) else {
                    if self.buf.len() > self.max_field_size {
                        return Err(ParseError::FieldTooLarge(self.max_field_size));
                    }
                    return Ok(false);
                };
                let line_len = if i > 0 && self.buf[i - 1] == b'\r' { i - 1 } else { i };
                self.buf.advance(i + 1);
                if line_len == 0 {
                    self.events.push_back(Event::MessageComplete);
                    self.state = State::Head;
                }
                Ok(true)
            }
        }
    }
}

fn parse_content_length(value: &str) -> Result<u64, ParseError> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidContentLength);
    }
    value.parse().map_err(|_| ParseError::InvalidContentLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    const FEEDS: &[u8] = b"GET /feeds HTTP/1.1\r\n\
        Host: localhost:1707\r\n\
        User-Agent: Mozilla/5.0 (X11; Linux x86_64; rv:54.0) Gecko/20100101 Firefox/54.0\r\n\
        Accept: */*\r\n\
        Accept-Language: en-US,en;q=0.5\r\n\
        DNT: 1\r\n\
        Connection: keep-alive\r\n\
        \r\n";

    const POST: &[u8] = b"POST /feed HTTP/1.1\r\n\
        Host: localhost:1707\r\n\
        Content-Type: application/json\r\n\
        Content-Length: 31\r\n\
        \r\n\
        {\"link\": \"https://example.org\"}";

    const CHUNKED: &[u8] = b"POST /upload HTTP/1.1\r\n\
        Transfer-Encoding: chunked\r\n\
        \r\n\
        5;ext=1\r\nhello\r\n\
        7\r\n, world\r\n\
        0\r\n\
        X-Trailer: yes\r\n\
        \r\n";

    /// Everything a feed produced, with body chunks glued back together.
    #[derive(Debug, Default, PartialEq)]
    struct Parsed {
        url: Vec<u8>,
        headers: Vec<(String, String)>,
        head: Option<Head>,
        body: Vec<u8>,
        complete: bool,
    }

    fn collect(parser: &mut Parser, parsed: &mut Parsed) {
        while let Some(event) = parser.next_event().unwrap() {
            match event {
                Event::Url(url) => parsed.url = url.to_vec(),
                Event::Header { name, value } => parsed.headers.push((name, value)),
                Event::HeadersComplete(head) => parsed.head = Some(head),
                Event::Body(chunk) => parsed.body.extend_from_slice(&chunk),
                Event::MessageComplete => parsed.complete = true,
            }
        }
    }

    fn parse_split(input: &[u8], pieces: &[&[u8]]) -> Parsed {
        assert_eq!(pieces.concat(), input);
        let mut parser = Parser::default();
        let mut parsed = Parsed::default();
        for piece in pieces {
            parser.feed(piece);
            collect(&mut parser, &mut parsed);
        }
        parsed
    }

    fn parse_whole(input: &[u8]) -> Parsed {
        parse_split(input, &[input])
    }

    #[test]
    fn simple_get() {
        let parsed = parse_whole(FEEDS);
        let head = parsed.head.unwrap();
        assert_eq!(head.method, Method::Get);
        assert_eq!(head.version, 1);
        assert!(head.keep_alive);
        assert!(!head.upgrade);
        assert_eq!(parsed.url, b"/feeds");
        assert_eq!(parsed.headers.len(), 6);
        assert_eq!(parsed.headers[2], ("Accept".to_owned(), "*/*".to_owned()));
        assert!(parsed.complete);
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn every_two_way_split_matches_whole_feed() {
        for input in [FEEDS, POST, CHUNKED] {
            let whole = parse_whole(input);
            for at in 0..=input.len() {
                let (a, b) = input.split_at(at);
                assert_eq!(parse_split(input, &[a, b]), whole, "split at {at}");
            }
        }
    }

    #[test]
    fn one_byte_at_a_time_matches_whole_feed() {
        for input in [FEEDS, POST, CHUNKED] {
            let pieces: Vec<&[u8]> = input.chunks(1).collect();
            assert_eq!(parse_split(input, &pieces), parse_whole(input));
        }
    }

    #[test]
    fn content_length_body() {
        let parsed = parse_whole(POST);
        assert_eq!(parsed.head.unwrap().method, Method::Post);
        assert_eq!(parsed.body, br#"{"link": "https://example.org"}"#);
        assert!(parsed.complete);
    }

    #[test]
    fn chunked_body_skips_extensions_and_trailers() {
        let parsed = parse_whole(CHUNKED);
        assert_eq!(parsed.body, b"hello, world");
        assert!(parsed.complete);
    }

    #[test]
    fn pipelined_requests_are_parsed_in_order() {
        let mut parser = Parser::default();
        parser.feed(POST);
        parser.feed(b"GET /next HTTP/1.1\r\n\r\n");

        let mut first = Parsed::default();
        while let Some(event) = parser.next_event().unwrap() {
            let done = event == Event::MessageComplete;
            match event {
                Event::Body(chunk) => first.body.extend_from_slice(&chunk),
                Event::Url(url) => first.url = url.to_vec(),
                _ => {}
            }
            if done {
                break;
            }
        }
        assert_eq!(first.url, b"/feed");
        assert_eq!(first.body.len(), 31);

        let mut second = Parsed::default();
        collect(&mut parser, &mut second);
        assert_eq!(second.url, b"/next");
        assert!(second.complete);
        assert!(parser.is_idle());
    }

    #[test]
    fn empty_header_values_are_skipped() {
        let parsed = parse_whole(b"GET / HTTP/1.1\r\nX-Empty:\r\nHost: a\r\n\r\n");
        assert_eq!(parsed.headers, vec![("Host".to_owned(), "a".to_owned())]);
    }

    #[test]
    fn leading_blank_lines_are_ignored() {
        let parsed = parse_whole(b"\r\n\r\nGET /x HTTP/1.1\r\n\r\n");
        assert_eq!(parsed.url, b"/x");
        assert!(parsed.complete);
    }

    #[test]
    fn keep_alive_rules() {
        let cases: &[(&[u8], bool)] = &[
            (b"GET / HTTP/1.1\r\n\r\n", true),
            (b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", false),
            (b"GET / HTTP/1.0\r\n\r\n", false),
            (b"GET / HTTP/1.0\r\nConnection: Keep-Alive\r\n\r\n", true),
        ];
        for (input, expected) in cases {
            assert_eq!(parse_whole(input).head.unwrap().keep_alive, *expected);
        }
    }

    #[test]
    fn upgrade_stops_parsing_and_keeps_remaining_bytes() {
        let mut parser = Parser::default();
        parser.feed(
            b"GET /ws HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n\x81\x05hello",
        );
        let mut parsed = Parsed::default();
        collect(&mut parser, &mut parsed);
        assert!(parsed.head.unwrap().upgrade);
        assert!(parsed.complete);
        assert!(parser.is_upgraded());
        assert_eq!(&parser.take_remaining()[..], b"\x81\x05hello");
    }

    #[test]
    fn upgrade_header_without_connection_token_is_not_an_upgrade() {
        let parsed = parse_whole(b"GET /ws HTTP/1.1\r\nUpgrade: websocket\r\n\r\n");
        assert!(!parsed.head.unwrap().upgrade);
    }

    #[test]
    fn malformed_method_fails_before_the_head_completes() {
        let mut parser = Parser::default();
        parser.feed(b"Batushka\r\n{\"link\": \"https://example.org\"}");
        assert!(parser.next_event().is_err());
    }

    #[test]
    fn unknown_method_is_rejected() {
        let mut parser = Parser::default();
        parser.feed(b"BREW /pot HTTP/1.1\r\n");
        assert_eq!(parser.next_event(), Err(ParseError::InvalidMethod));
    }

    #[test]
    fn overlong_line_is_rejected() {
        let mut parser = Parser::new(32);
        parser.feed(b"GET / HTTP/1.1\r\nX-Long: ");
        assert_eq!(parser.next_event(), Ok(None));
        parser.feed(&[b'a'; 40]);
        assert_eq!(parser.next_event(), Err(ParseError::FieldTooLarge(32)));
    }

    #[test]
    fn framing_errors() {
        let cases: &[&[u8]] = &[
            b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n",
            b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n",
            b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n",
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n",
        ];
        for input in cases {
            let mut parser = Parser::default();
            parser.feed(input);
            let mut result = Ok(None);
            for _ in 0..8 {
                result = parser.next_event();
                if result.is_err() {
                    break;
                }
            }
            assert!(result.is_err(), "{}", String::from_utf8_lossy(input));
        }
    }

    #[test]
    fn bad_chunk_size_is_rejected() {
        let mut parser = Parser::default();
        parser.feed(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n");
        let err = loop {
            match parser.next_event() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected an error"),
                Err(e) => break e,
            }
        };
        assert_eq!(err, ParseError::InvalidChunk);
    }

    #[test]
    fn parse_errors_become_bad_requests() {
        let err: Error = ParseError::InvalidMethod.into();
        assert!(matches!(err, Error::BadRequest(m) if m == "invalid method"));
    }
}
