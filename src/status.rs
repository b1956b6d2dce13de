//! HTTP status codes as a closed, typed enum.
//!
//! A [`Status`] can only be one of the registered codes below. Converting an
//! arbitrary `u16` goes through [`Status::try_from`], which rejects anything
//! else with [`Error::InvalidStatus`](crate::Error::InvalidStatus).
//!
//! ```rust
//! use hearth::Status;
//!
//! assert_eq!(Status::Accepted.code(), 202);
//! assert_eq!(Status::Accepted.reason(), "Accepted");
//! assert!(Status::try_from(299).is_err());
//! ```

use std::fmt;

use crate::error::Error;

macro_rules! statuses {
    ($( $variant:ident = $code:literal, $reason:literal; )+) => {
        /// All status codes the engine knows how to render.
        #[allow(clippy::enum_variant_names)]
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
        pub enum Status {
            $( $variant, )+
        }

        impl Status {
            /// Numeric code, e.g. `404`.
            pub fn code(self) -> u16 {
                match self {
                    $( Self::$variant => $code, )+
                }
            }

            /// Reason phrase written on the status line, e.g. `"Not Found"`.
            pub fn reason(self) -> &'static str {
                match self {
                    $( Self::$variant => $reason, )+
                }
            }
        }

        impl TryFrom<u16> for Status {
            type Error = Error;

            fn try_from(code: u16) -> Result<Self, Error> {
                match code {
                    $( $code => Ok(Self::$variant), )+
                    other => Err(Error::InvalidStatus(other)),
                }
            }
        }
    };
}

statuses! {
    // ── 1xx Informational ─────────────────────────────────────────────────────
    Continue                      = 100, "Continue";
    SwitchingProtocols            = 101, "Switching Protocols";
    Processing                    = 102, "Processing";
    EarlyHints                    = 103, "Early Hints";

    // ── 2xx Success ───────────────────────────────────────────────────────────
    Ok                            = 200, "OK";
    Created                       = 201, "Created";
    Accepted                      = 202, "Accepted";
    NonAuthoritativeInformation   = 203, "Non-Authoritative Information";
    NoContent                     = 204, "No Content";
    ResetContent                  = 205, "Reset Content";
    PartialContent                = 206, "Partial Content";
    MultiStatus                   = 207, "Multi-Status";
    AlreadyReported               = 208, "Already Reported";
    ImUsed                        = 226, "IM Used";

    // ── 3xx Redirection ───────────────────────────────────────────────────────
    MultipleChoices               = 300, "Multiple Choices";
    MovedPermanently              = 301, "Moved Permanently";
    Found                         = 302, "Found";
    SeeOther                      = 303, "See Other";
    NotModified                   = 304, "Not Modified";
    UseProxy                      = 305, "Use Proxy";
    TemporaryRedirect             = 307, "Temporary Redirect";
    PermanentRedirect             = 308, "Permanent Redirect";

    // ── 4xx Client errors ─────────────────────────────────────────────────────
    BadRequest                    = 400, "Bad Request";
    Unauthorized                  = 401, "Unauthorized";
    PaymentRequired               = 402, "Payment Required";
    Forbidden                     = 403, "Forbidden";
    NotFound                      = 404, "Not Found";
    MethodNotAllowed              = 405, "Method Not Allowed";
    NotAcceptable                 = 406, "Not Acceptable";
    ProxyAuthenticationRequired   = 407, "Proxy Authentication Required";
    RequestTimeout                = 408, "Request Timeout";
    Conflict                      = 409, "Conflict";
    Gone                          = 410, "Gone";
    LengthRequired                = 411, "Length Required";
    PreconditionFailed            = 412, "Precondition Failed";
    ContentTooLarge               = 413, "Request Entity Too Large";
    UriTooLong                    = 414, "Request-URI Too Long";
    UnsupportedMediaType          = 415, "Unsupported Media Type";
    RangeNotSatisfiable           = 416, "Requested Range Not Satisfiable";
    ExpectationFailed             = 417, "Expectation Failed";
    ImATeapot                     = 418, "I'm a Teapot";
    MisdirectedRequest            = 421, "Misdirected Request";
    UnprocessableContent          = 422, "Unprocessable Entity";
    Locked                        = 423, "Locked";
    FailedDependency              = 424, "Failed Dependency";
    TooEarly                      = 425, "Too Early";
    UpgradeRequired               = 426, "Upgrade Required";
    PreconditionRequired          = 428, "Precondition Required";
    TooManyRequests               = 429, "Too Many Requests";
    RequestHeaderFieldsTooLarge   = 431, "Request Header Fields Too Large";
    UnavailableForLegalReasons    = 451, "Unavailable For Legal Reasons";

    // ── 5xx Server errors ─────────────────────────────────────────────────────
    InternalServerError           = 500, "Internal Server Error";
    NotImplemented                = 501, "Not Implemented";
    BadGateway                    = 502, "Bad Gateway";
    ServiceUnavailable            = 503, "Service Unavailable";
    GatewayTimeout                = 504, "Gateway Timeout";
    HttpVersionNotSupported       = 505, "HTTP Version Not Supported";
    VariantAlsoNegotiates         = 506, "Variant Also Negotiates";
    InsufficientStorage           = 507, "Insufficient Storage";
    LoopDetected                  = 508, "Loop Detected";
    NotExtended                   = 510, "Not Extended";
    NetworkAuthenticationRequired = 511, "Network Authentication Required";
}

impl Status {
    /// Responses with these statuses never carry body octets.
    pub fn is_bodyless(self) -> bool {
        matches!(
            self,
            Self::Continue
                | Self::SwitchingProtocols
                | Self::Processing
                | Self::NoContent
                | Self::NotModified
        )
    }
}

impl From<Status> for u16 {
    fn from(status: Status) -> u16 {
        status.code()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip() {
        for code in [100, 101, 200, 202, 304, 404, 426, 501, 511] {
            let status = Status::try_from(code).unwrap();
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(matches!(Status::try_from(299), Err(Error::InvalidStatus(299))));
        assert!(matches!(Status::try_from(0), Err(Error::InvalidStatus(0))));
        assert!(matches!(Status::try_from(1000), Err(Error::InvalidStatus(1000))));
    }

    #[test]
    fn bodyless_statuses() {
        let bodyless: Vec<u16> = [100u16, 101, 102, 200, 204, 304, 404]
            .into_iter()
            .filter(|&c| Status::try_from(c).unwrap().is_bodyless())
            .collect();
        assert_eq!(bodyless, vec![100, 101, 102, 204, 304]);
    }

    #[test]
    fn display_is_status_line_fragment() {
        assert_eq!(Status::UpgradeRequired.to_string(), "426 Upgrade Required");
    }
}
