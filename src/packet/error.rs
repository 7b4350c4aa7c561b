use std::io;

/// Protocol failures that surface to the client as an HTTP status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HttpError {
    #[error("400 Bad Request")]
    BadRequest,
    #[error("404 Not Found")]
    NotFound,
    #[error("405 Method Not Allowed")]
    MethodNotAllowed,
    #[error("408 Request Timeout")]
    RequestTimeout,
    #[error("418 I'm a teapot")]
    Teapot,
    #[error("500 Internal Server Error")]
    InternalServerError,
    #[error("502 Bad Gateway")]
    BadGateway,
    #[error("504 Gateway Timeout")]
    GatewayTimeout,
    #[error("505 HTTP Version Not Supported")]
    VersionNotSupported,
}

impl HttpError {
    pub fn code(self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::RequestTimeout => 408,
            Self::Teapot => 418,
            Self::InternalServerError => 500,
            Self::BadGateway => 502,
            Self::GatewayTimeout => 504,
            Self::VersionNotSupported => 505,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::RequestTimeout => "Request Timeout",
            Self::Teapot => "I'm a teapot",
            Self::InternalServerError => "Internal Server Error",
            Self::BadGateway => "Bad Gateway",
            Self::GatewayTimeout => "Gateway Timeout",
            Self::VersionNotSupported => "HTTP Version Not Supported",
        }
    }
}

/// Failure while reading one framed message off a socket.
///
/// IO errors (timeouts included) pass through untranslated so the caller can
/// map them per-direction: a client timeout is 408, an upstream one 504.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ReadError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::TimedOut)
    }
}
