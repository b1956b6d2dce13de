//! Streaming `multipart/form-data` decoder (RFC 7578).

use bytes::{Buf, BytesMut};
use memchr::memmem;
use tracing::debug;

use super::{BodyDecoder, Decoded, FilePart, Files, Form, decode_ext_value, parse_params};
use crate::error::Error;

const UNPARSABLE: &str = "Unparsable multipart body";
/// RFC 2046 §5.1.1.
const MAX_BOUNDARY: usize = 70;
const MAX_PART_HEADERS: usize = 16;
const MAX_PART_HEAD_SIZE: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    /// Expecting the opening `--boundary`.
    Start,
    /// Just past a delimiter: `\r\n` opens a part, `--` closes the body.
    AfterDelimiter,
    Headers,
    Content,
    Epilogue,
    Done,
    Failed,
}

struct Part {
    name: String,
    file: Option<(Option<String>, String, Vec<(String, String)>)>,
    content: BytesMut,
}

/// Decodes a multipart body as it arrives. Part contents are buffered in
/// memory; everything else is processed incrementally, so a delimiter may be
/// split across any number of chunks.
pub struct Multipart {
    /// `\r\n--boundary`; the body itself opens with `--boundary`.
    delimiter: Vec<u8>,
    buf: BytesMut,
    state: State,
    part: Option<Part>,
    parts: usize,
    form: Form,
    files: Files,
}

impl Multipart {
    /// Builds a decoder from the request's full `Content-Type` value, which
    /// must carry a `boundary` parameter.
    pub fn new(content_type: &str) -> Result<Self, Error> {
        let (_, params) = parse_params(content_type.as_bytes());
        let boundary = params
            .into_iter()
            .find(|(name, _)| name == "boundary")
            .map(|(_, value)| value)
            .filter(|b| (1..=MAX_BOUNDARY).contains(&b.len()))
            .ok_or_else(|| {
                debug!(content_type, "missing or invalid multipart boundary");
                Error::BadRequest(UNPARSABLE.to_owned())
            })?;

        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(&boundary);
        Ok(Self {
            delimiter,
            buf: BytesMut::new(),
            state: State::Start,
            part: None,
            parts: 0,
            form: Form::new(),
            files: Files::new(),
        })
    }

    fn advance(&mut self) -> Result<(), &'static str> {
        loop {
            let progressed = match self.state {
                State::Start => self.read_opening()?,
                State::AfterDelimiter => self.read_after_delimiter()?,
                State::Headers => self.read_headers()?,
                State::Content => self.read_content(),
                State::Epilogue => {
                    self.buf.clear();
                    false
                }
                State::Done | State::Failed => false,
            };
            if !progressed {
                return Ok(());
            }
        }
    }

    fn read_opening(&mut self) -> Result<bool, &'static str> {
        let opening = &self.delimiter[2..];
        let n = self.buf.len().min(opening.len());
        if self.buf[..n] != opening[..n] {
            return Err("body does not start with the boundary");
        }
        if n < opening.len() {
            return Ok(false);
        }
        self.buf.advance(n);
        self.state = State::AfterDelimiter;
        Ok(true)
    }

    fn read_after_delimiter(&mut self) -> Result<bool, &'static str> {
        if self.buf.len() < 2 {
            return Ok(false);
        }
        match &self.buf[..2] {
            b"\r\n" => self.state = State::Headers,
            b"--" if self.parts == 0 => return Err("close delimiter before any part"),
            b"--" => self.state = State::Epilogue,
            _ => return Err("garbage after delimiter"),
        }
        self.buf.advance(2);
        Ok(true)
    }

    fn read_headers(&mut self) -> Result<bool, &'static str> {
        let Some(end) = memmem::find(&self.buf, b"\r\n\r\n") else {
            if self.buf.len() > MAX_PART_HEAD_SIZE {
                return Err("part headers too large");
            }
            return Ok(false);
        };
        let block = self.buf.split_to(end + 4);

        let mut headers = [httparse::EMPTY_HEADER; MAX_PART_HEADERS];
        let parsed = match httparse::parse_headers(&block, &mut headers) {
            Ok(httparse::Status::Complete((_, parsed))) => parsed,
            _ => return Err("malformed part headers"),
        };

        let mut disposition = None;
        let mut content_type = None;
        for header in parsed {
            if header.name.eq_ignore_ascii_case("content-disposition") {
                disposition = Some(parse_params(header.value));
            } else if header.name.eq_ignore_ascii_case("content-type") {
                content_type = Some(parse_params(header.value));
            }
        }

        let Some((kind, params)) = disposition else {
            return Err("part without Content-Disposition");
        };
        if kind != "form-data" {
            return Err("part disposition is not form-data");
        }
        let param = |name: &str| params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_slice());
        let Some(name) = param("name") else {
            return Err("part without a name");
        };
        let name = String::from_utf8_lossy(name).into_owned();

        let file = content_type.map(|(media_type, ct_params)| {
            let filename = param("filename*")
                .and_then(decode_ext_value)
                .or_else(|| param("filename").map(|f| String::from_utf8_lossy(f).into_owned()));
            let ct_params = ct_params
                .into_iter()
                .map(|(k, v)| (k, String::from_utf8_lossy(&v).into_owned()))
                .collect();
            (filename, media_type, ct_params)
        });

        self.part = Some(Part { name, file, content: BytesMut::new() });
        self.state = State::Content;
        Ok(true)
    }

    fn read_content(&mut self) -> bool {
        let Some(part) = self.part.as_mut() else {
            return false;
        };
        match memmem::find(&self.buf, &self.delimiter) {
            Some(i) => {
                part.content.extend_from_slice(&self.buf[..i]);
                self.buf.advance(i + self.delimiter.len());
                self.finish_part();
                self.state = State::AfterDelimiter;
                true
            }
            None => {
                // Hold back what could be the start of a split delimiter.
                let keep = self.delimiter.len() - 1;
                if self.buf.len() > keep {
                    let flushed = self.buf.split_to(self.buf.len() - keep);
                    part.content.extend_from_slice(&flushed);
                }
                false
            }
        }
    }

    fn finish_part(&mut self) {
        let Some(part) = self.part.take() else {
            return;
        };
        self.parts += 1;
        match part.file {
            Some((filename, content_type, params)) => self.files.push(
                part.name,
                FilePart { filename, content_type, params, content: part.content.freeze() },
            ),
            None => self.form.push(part.name, String::from_utf8_lossy(&part.content).into_owned()),
        }
    }

    fn fail(&mut self, reason: &'static str) -> Error {
        debug!(reason, "unparsable multipart body");
        self.state = State::Failed;
        self.buf.clear();
        Error::BadRequest(UNPARSABLE.to_owned())
    }
}

impl BodyDecoder for Multipart {
    fn feed(&mut self, chunk: &[u8]) -> Option<Result<Decoded, Error>> {
        match self.state {
            State::Failed => return Some(Err(Error::BadRequest(UNPARSABLE.to_owned()))),
            State::Done => return Some(Err(self.fail("fed after the end of the body"))),
            _ => {}
        }

        if chunk.is_empty() {
            return Some(match self.state {
                State::Epilogue => {
                    self.state = State::Done;
                    Ok(Decoded {
                        form: std::mem::take(&mut self.form),
                        files: std::mem::take(&mut self.files),
                    })
                }
                State::Start if self.buf.is_empty() => {
                    self.state = State::Done;
                    Ok(Decoded::default())
                }
                _ => Err(self.fail("body ended before the close delimiter")),
            });
        }

        self.buf.extend_from_slice(chunk);
        match self.advance() {
            Ok(()) => None,
            Err(reason) => Some(Err(self.fail(reason))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[&[u8]] = &[
        b"--foofoo\r\n",
        b"Content-Disposition: form-data; name=baz; filename=\"baz.png\"\r\n",
        b"Content-Type: image/png\r\n",
        b"\r\n",
        b"abcdef\r\n",
        b"--foofoo\r\n",
        b"Content-Disposition: form-data; name=\"text1\"\r\n",
        b"\r\n",
        b"abc\r\n--foofoo--",
    ];

    fn decode(content_type: &str, chunks: &[&[u8]]) -> Result<Decoded, Error> {
        let mut decoder = Multipart::new(content_type)?;
        for chunk in chunks {
            if let Some(result) = decoder.feed(chunk) {
                return result;
            }
        }
        decoder.feed(b"").unwrap()
    }

    fn check_sample(decoded: &Decoded) {
        assert_eq!(decoded.form.get("text1").map(String::as_str), Some("abc"));
        let file = decoded.files.get("baz").unwrap();
        assert_eq!(file.filename(), Some("baz.png"));
        assert_eq!(file.content_type(), "image/png");
        assert_eq!(&file.content()[..], b"abcdef");
    }

    #[test]
    fn decodes_fields_and_files() {
        let decoded = decode("multipart/form-data; boundary=foofoo", SAMPLE).unwrap();
        check_sample(&decoded);
    }

    #[test]
    fn chunking_does_not_matter() {
        let body = SAMPLE.concat();
        for size in [1, 2, 3, 7, 11, body.len()] {
            let chunks: Vec<&[u8]> = body.chunks(size).collect();
            let decoded = decode("multipart/form-data; boundary=foofoo", &chunks).unwrap();
            check_sample(&decoded);
        }
    }

    #[test]
    fn extended_filename_wins() {
        let chunks: &[&[u8]] = &[
            b"--foofoo\r\n",
            b"Content-Disposition: form-data; name=baz; filename=\"baz.png\"; ",
            b"filename*=\"iso-8859-1''baz-\xe9.png\"\r\n",
            b"Content-Type: image/png\r\n\r\n",
            b"abcdef\r\n--foofoo--",
        ];
        let decoded = decode("multipart/form-data; boundary=foofoo", chunks).unwrap();
        assert_eq!(decoded.files.get("baz").unwrap().filename(), Some("baz-é.png"));
    }

    #[test]
    fn repeated_names_accumulate() {
        let chunks: &[&[u8]] = &[
            b"--b\r\nContent-Disposition: form-data; name=tag\r\n\r\none",
            b"\r\n--b\r\nContent-Disposition: form-data; name=tag\r\n\r\ntwo",
            b"\r\n--b--\r\nepilogue is ignored",
        ];
        let decoded = decode("multipart/form-data; boundary=b", chunks).unwrap();
        assert_eq!(decoded.form.list("tag"), ["one", "two"]);
    }

    #[test]
    fn content_may_contain_boundary_lookalikes() {
        let chunks: &[&[u8]] = &[
            b"--foofoo\r\nContent-Disposition: form-data; name=t\r\n\r\n",
            b"a\r\n--foo not it\r\n--foofo",
            b"\r\n--foofoo--",
        ];
        let decoded = decode("multipart/form-data; boundary=foofoo", chunks).unwrap();
        assert_eq!(decoded.form.get("t").map(String::as_str), Some("a\r\n--foo not it\r\n--foofo"));
    }

    #[test]
    fn empty_body_decodes_to_nothing() {
        let decoded = decode("multipart/form-data; boundary=foofoo", &[]).unwrap();
        assert!(decoded.form.is_empty());
        assert!(decoded.files.is_empty());
    }

    #[test]
    fn close_delimiter_without_parts_fails() {
        let err = decode("multipart/form-data; boundary=foofoo", &[&b"--foofoo--foofoo--"[..]]);
        assert!(matches!(err, Err(Error::BadRequest(m)) if m == UNPARSABLE));
    }

    #[test]
    fn wrong_boundary_fails_immediately() {
        let mut decoder = Multipart::new("multipart/form-data; boundary=foofoo").unwrap();
        assert!(matches!(decoder.feed(b"--foobar\r\n"), Some(Err(Error::BadRequest(_)))));
        // Stays failed.
        assert!(matches!(decoder.feed(b""), Some(Err(_))));
    }

    #[test]
    fn truncated_body_fails() {
        let truncated = &SAMPLE[..6];
        assert!(decode("multipart/form-data; boundary=foofoo", truncated).is_err());
    }

    #[test]
    fn part_without_disposition_fails() {
        let chunks: &[&[u8]] = &[b"--foofoo\r\nContent-Type: text/plain\r\n\r\nx\r\n--foofoo--"];
        assert!(decode("multipart/form-data; boundary=foofoo", chunks).is_err());
    }

    #[test]
    fn boundary_is_required() {
        assert!(Multipart::new("multipart/form-data").is_err());
        assert!(Multipart::new("multipart/form-data; boundary=").is_err());
        assert!(Multipart::new("multipart/form-data; boundary=\"quoted\"").is_ok());
    }
}
