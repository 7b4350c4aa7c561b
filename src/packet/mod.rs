mod error;
mod headers;
pub mod read;

pub use error::{HttpError, ReadError};
pub use headers::HeaderMap;

const MAX_HEADERS: usize = 64;

const ALLOWED_METHODS: [&str; 5] = ["HEAD", "GET", "PUT", "POST", "DELETE"];

/// One HTTP/1.x message: protocol line, ordered headers, body.
///
/// `parse_head` takes the bytes up to (excluding) the first blank line.
/// `encode` re-emits the canonical wire form with exactly one blank line
/// between headers and body.
pub trait Packet: Sized {
    fn parse_head(head: &[u8]) -> Result<Self, HttpError>;

    fn protocol_line(&self) -> String;

    fn headers(&self) -> &HeaderMap;

    fn headers_mut(&mut self) -> &mut HeaderMap;

    fn body(&self) -> &[u8];

    fn body_mut(&mut self) -> &mut Vec<u8>;

    fn validate(&self) -> Result<(), HttpError> {
        Ok(())
    }

    /// Replaces the body and keeps the framing headers truthful:
    /// `Content-Length` becomes the new length and the `chunked` token is
    /// dropped from `Transfer-Encoding` (the re-encoded message is always
    /// length-delimited).
    fn set_content(&mut self, body: Vec<u8>) {
        strip_chunked(self.headers_mut());
        let len = body.len().to_string();
        self.headers_mut().insert("Content-Length", len);
        *self.body_mut() = body;
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256 + self.body().len());
        out.extend_from_slice(self.protocol_line().as_bytes());
        out.extend_from_slice(b"\r\n");
        for (key, value) in self.headers().iter() {
            out.extend_from_slice(key);
            out.extend_from_slice(b": ");
            out.extend_from_slice(value);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(self.body());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacket {
    pub method: String,
    pub url: String,
    pub version: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Cleared by a transformer to short-circuit the upstream fetch.
    pub should_forward: bool,
}

impl Packet for RequestPacket {
    fn parse_head(head: &[u8]) -> Result<Self, HttpError> {
        let mut raw = Vec::with_capacity(head.len() + 4);
        raw.extend_from_slice(head);
        raw.extend_from_slice(b"\r\n\r\n");

        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut slots);
        match parsed.parse(&raw) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => return Err(HttpError::BadRequest),
            Err(httparse::Error::Version) => return Err(HttpError::VersionNotSupported),
            Err(_) => return Err(HttpError::BadRequest),
        }

        Ok(Self {
            method: parsed.method.ok_or(HttpError::BadRequest)?.to_string(),
            url: parsed.path.ok_or(HttpError::BadRequest)?.to_string(),
            version: match parsed.version.ok_or(HttpError::BadRequest)? {
                0 => "HTTP/1.0".to_string(),
                _ => "HTTP/1.1".to_string(),
            },
            headers: collect_headers(parsed.headers),
            body: Vec::new(),
            should_forward: true,
        })
    }

    fn protocol_line(&self) -> String {
        format!("{} {} {}", self.method, self.url, self.version)
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.body
    }

    fn validate(&self) -> Result<(), HttpError> {
        // The Host value must appear inside the request URL. Stricter than
        // RFC 7230, but it keeps the origin the client named and the origin
        // we connect to from diverging.
        match self.headers.get(b"Host") {
            Some(host) if find_subslice(self.url.as_bytes(), host).is_some() => {}
            _ => return Err(HttpError::BadRequest),
        }

        if self.version != "HTTP/1.1" && self.version != "HTTP/1.0" {
            return Err(HttpError::VersionNotSupported);
        }

        if !ALLOWED_METHODS.contains(&self.method.as_str()) {
            return Err(HttpError::MethodNotAllowed);
        }

        Ok(())
    }
}

impl RequestPacket {
    /// Upstream endpoint from the `Host` header. An explicit `:port` suffix
    /// must be a valid decimal port; otherwise 443 for `https` URLs, 80 for
    /// everything else.
    pub fn host_port(&self) -> Result<(String, u16), HttpError> {
        let host = self.headers.get(b"Host").ok_or(HttpError::BadRequest)?;
        let host = std::str::from_utf8(host).map_err(|_| HttpError::BadRequest)?;

        if let Some((name, port)) = host.split_once(':') {
            let port: u16 = port.parse().map_err(|_| HttpError::BadRequest)?;
            return Ok((name.to_string(), port));
        }

        let port = if self.url.starts_with("https") { 443 } else { 80 };
        Ok((host.to_string(), port))
    }

    pub fn connection_close(&self) -> bool {
        connection_close(&self.headers)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    pub version: String,
    pub code: u16,
    pub status: String,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl Packet for ResponsePacket {
    fn parse_head(head: &[u8]) -> Result<Self, HttpError> {
        let mut raw = Vec::with_capacity(head.len() + 4);
        raw.extend_from_slice(head);
        raw.extend_from_slice(b"\r\n\r\n");

        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut slots);
        match parsed.parse(&raw) {
            Ok(httparse::Status::Complete(_)) => {}
            // A half-formed or malformed status line is the origin's fault,
            // but from the client's point of view it is our failure.
            _ => return Err(HttpError::InternalServerError),
        }

        Ok(Self {
            version: match parsed.version.ok_or(HttpError::InternalServerError)? {
                0 => "HTTP/1.0".to_string(),
                _ => "HTTP/1.1".to_string(),
            },
            code: parsed.code.ok_or(HttpError::InternalServerError)?,
            status: parsed.reason.unwrap_or_default().to_string(),
            headers: collect_headers(parsed.headers),
            body: Vec::new(),
        })
    }

    fn protocol_line(&self) -> String {
        format!("{} {} {}", self.version, self.code, self.status)
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn body(&self) -> &[u8] {
        &self.body
    }

    fn body_mut(&mut self) -> &mut Vec<u8> {
        &mut self.body
    }
}

impl ResponsePacket {
    /// Synthesized error response: fixed HTML page, `Connection: close`,
    /// RFC-1123 `Date`.
    pub fn error_page(code: u16, reason: &str) -> Self {
        let html = format!(
            "<?xml version=\"1.0\" encoding=\"iso-8859-1\"?>\n\
             <!DOCTYPE html>\n\
             <html lang=\"en\">\n\
             \x20 <head>\n\
             \x20   <title>{code} - {reason}</title>\n\
             \x20 </head>\n\
             \x20 <body>\n\
             \x20   <h1>{code} - {reason}</h1>\n\
             \x20 </body>\n\
             </html>\n"
        );

        let mut res = Self {
            version: "HTTP/1.1".to_string(),
            code,
            status: reason.to_string(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        };
        res.headers.insert("Content-Type", "text/html");
        res.set_content(html.into_bytes());
        res.headers.insert("Connection", "close");
        res.headers.insert(
            "Date",
            chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
        res
    }

    pub fn from_error(err: HttpError) -> Self {
        Self::error_page(err.code(), err.reason())
    }

    pub fn connection_close(&self) -> bool {
        connection_close(&self.headers)
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for h in parsed {
        // Duplicate keys overwrite, last wins.
        headers.insert(h.name.as_bytes(), h.value);
    }
    headers
}

fn strip_chunked(headers: &mut HeaderMap) {
    let Some(te) = headers.get(b"Transfer-Encoding").map(<[u8]>::to_vec) else {
        return;
    };
    let kept: Vec<&[u8]> = te
        .split(|&b| b == b',')
        .map(|token| token.trim_ascii())
        .filter(|token| !token.is_empty() && *token != b"chunked")
        .collect();
    if kept.is_empty() {
        headers.remove(b"Transfer-Encoding");
    } else {
        headers.insert("Transfer-Encoding", kept.join(&b", "[..]));
    }
}

pub(crate) fn connection_close(headers: &HeaderMap) -> bool {
    headers
        .get(b"Connection")
        .is_some_and(|v| v.trim_ascii().eq_ignore_ascii_case(b"close"))
}

pub(crate) fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
