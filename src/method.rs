//! HTTP method as a typed enum.
//!
//! Covers RFC 9110 standard methods, WebDAV extensions (RFC 4918 / 4791 / 3253 / 5323),
//! and `PURGE` used by nginx and Varnish for cache invalidation.
//!
//! The parser only accepts these tokens. Anything else on a request line is
//! answered with `400 Bad Request` before a handler is ever looked up.

use std::fmt;
use std::str::FromStr;

macro_rules! methods {
    ($( $variant:ident => $token:literal, )+) => {
        /// A known HTTP method.
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
        pub enum Method {
            $( $variant, )+
        }

        impl Method {
            /// Returns the uppercase wire representation (e.g. `"GET"`).
            pub fn as_str(self) -> &'static str {
                match self {
                    $( Self::$variant => $token, )+
                }
            }
        }

        /// Parses an uppercase method token. Case-sensitive per RFC 9110 §9.1.
        impl FromStr for Method {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $token => Ok(Self::$variant), )+
                    _ => Err(()),
                }
            }
        }
    };
}

methods! {
    // RFC 9110 ─────────────────────────────────────────────────────────────────
    Connect    => "CONNECT",
    Delete     => "DELETE",
    Get        => "GET",
    Head       => "HEAD",
    Options    => "OPTIONS",
    Patch      => "PATCH",
    Post       => "POST",
    Put        => "PUT",
    Trace      => "TRACE",
    // WebDAV RFC 4918 ──────────────────────────────────────────────────────────
    Copy       => "COPY",
    Lock       => "LOCK",
    Mkcol      => "MKCOL",
    Move       => "MOVE",
    Propfind   => "PROPFIND",
    Proppatch  => "PROPPATCH",
    Unlock     => "UNLOCK",
    // WebDAV extensions ────────────────────────────────────────────────────────
    Mkcalendar => "MKCALENDAR",
    Report     => "REPORT",
    Search     => "SEARCH",
    // Cache invalidation ───────────────────────────────────────────────────────
    Purge      => "PURGE",
}

impl Method {
    /// Responses to these methods never carry body octets.
    pub fn is_bodyless(self) -> bool {
        matches!(self, Self::Head | Self::Connect)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_sensitive() {
        assert_eq!("GET".parse::<Method>(), Ok(Method::Get));
        assert_eq!("get".parse::<Method>(), Err(()));
        assert_eq!("BATUSHKA".parse::<Method>(), Err(()));
    }

    #[test]
    fn head_and_connect_are_bodyless() {
        assert!(Method::Head.is_bodyless());
        assert!(Method::Connect.is_bodyless());
        assert!(!Method::Get.is_bodyless());
    }
}
