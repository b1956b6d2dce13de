//! Strict `application/x-www-form-urlencoded` decoder.

use bytes::{Buf, BytesMut};
use tracing::debug;

use super::{BodyDecoder, Decoded, Form};
use crate::error::Error;

const UNPARSABLE: &str = "Unparsable urlencoded body";

/// Decodes `key=value&key=value` bodies as they arrive. Unlike query
/// strings, bodies are parsed strictly: every pair needs an `=`, empty pairs
/// are rejected and so are malformed percent escapes.
pub struct UrlEncoded {
    pending: BytesMut,
    form: Form,
    seen_input: bool,
    failed: bool,
    done: bool,
}

impl UrlEncoded {
    pub fn new() -> Self {
        Self { pending: BytesMut::new(), form: Form::new(), seen_input: false, failed: false, done: false }
    }

    fn push_pair(&mut self, pair: &[u8]) -> Result<(), &'static str> {
        if pair.is_empty() {
            return Err("empty pair");
        }
        if memchr::memchr(b'=', pair).is_none() {
            return Err("pair without '='");
        }
        if !escapes_are_valid(pair) {
            return Err("malformed percent escape");
        }
        if let Some((key, value)) = form_urlencoded::parse(pair).next() {
            self.form.push(key.into_owned(), value.into_owned());
        }
        Ok(())
    }

    fn fail(&mut self, reason: &'static str) -> Error {
        debug!(reason, "unparsable urlencoded body");
        self.failed = true;
        self.pending.clear();
        Error::BadRequest(UNPARSABLE.to_owned())
    }
}

impl Default for UrlEncoded {
    fn default() -> Self {
        Self::new()
    }
}

impl BodyDecoder for UrlEncoded {
    fn feed(&mut self, chunk: &[u8]) -> Option<Result<Decoded, Error>> {
        if self.failed {
            return Some(Err(Error::BadRequest(UNPARSABLE.to_owned())));
        }
        if self.done {
            return Some(Err(self.fail("fed after the end of the body")));
        }

        if chunk.is_empty() {
            self.done = true;
            if self.seen_input {
                let last = self.pending.split();
                if let Err(reason) = self.push_pair(&last) {
                    return Some(Err(self.fail(reason)));
                }
            }
            return Some(Ok(Decoded { form: std::mem::take(&mut self.form), ..Default::default() }));
        }

        self.seen_input = true;
        self.pending.extend_from_slice(chunk);
        while let Some(i) = memchr::memchr(b'&', &self.pending) {
            let pair = self.pending.split_to(i);
            self.pending.advance(1);
            if let Err(reason) = self.push_pair(&pair) {
                return Some(Err(self.fail(reason)));
            }
        }
        None
    }
}

fn escapes_are_valid(pair: &[u8]) -> bool {
    memchr::memchr_iter(b'%', pair).all(|i| {
        pair.get(i + 1..i + 3)
            .is_some_and(|hex| hex.iter().all(u8::is_ascii_hexdigit))
    })
}
