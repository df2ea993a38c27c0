use crate::{
    errors::ErrorKind,
    http::types::{self, HeaderMap},
    limits::ReqLimits,
    query,
};
use std::{borrow::Cow, mem};

/// A fully parsed HTTP request. Immutable after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    method: String,
    url: String,
    path: String,
    query: Vec<(String, String)>,
    version: String,
    headers: HeaderMap,
    body: Vec<u8>,
    remote_address: String,
}

// Public API
impl Request {
    /// Returns the request method token (e.g. `GET`).
    #[inline(always)]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns the raw request target, query string included, in its
    /// encoded form (e.g. `/search?q=a%20b`).
    #[inline(always)]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Returns the path component without the query string.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the `x.y` HTTP version string (e.g. `1.1`).
    #[inline(always)]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the decoded value of the first query parameter with this
    /// key. Duplicate keys keep their insertion order; lookup returns
    /// the first.
    #[inline]
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Returns every decoded query pair in insertion order.
    #[inline(always)]
    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    /// Returns the header value with case-insensitive name matching.
    /// For duplicate headers the last value wins.
    #[inline(always)]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Returns the request body bytes (empty without `Content-Length`).
    #[inline(always)]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Returns the body decoded as UTF-8, lossily.
    #[inline(always)]
    pub fn body_string(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// Returns the peer address string (e.g. `127.0.0.1:51234`).
    #[inline(always)]
    pub fn remote_address(&self) -> &str {
        &self.remote_address
    }
}

//

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Method,
    Path,
    QueryKey,
    QueryValue,
    HttpLit,
    VersionMajor,
    VersionMinor,
    LineLf,
    HeaderKey,
    Key2Value,
    HeaderValue,
    HeaderLf,
    BlankLf,
    Body,
    Final,
}

/// Byte-fed HTTP/1.1 request parser.
///
/// Fed one byte at a time via [`feed`](Parser::feed); tolerates any
/// fragmentation because all state lives in the machine. When `feed`
/// reports the terminal state the caller takes the request out with
/// [`take_request`](Parser::take_request) and calls
/// [`reset`](Parser::reset) to accept the next request on the same
/// connection. Every accumulation step enforces its [`ReqLimits`] cap
/// before buffering the byte.
#[derive(Debug)]
pub(crate) struct Parser {
    limits: ReqLimits,
    state: State,

    method: Vec<u8>,
    url: Vec<u8>,
    path: Vec<u8>,
    version: Vec<u8>,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Vec<u8>,

    // Scratch for the field currently being accumulated.
    key_buf: Vec<u8>,
    buf: Vec<u8>,

    lit_pos: usize,
    has_minor: bool,
    header_lines: usize,
    body_remaining: usize,
}

impl Parser {
    pub(crate) fn new(limits: ReqLimits) -> Self {
        Self {
            limits,
            state: State::Method,
            method: Vec::new(),
            url: Vec::new(),
            path: Vec::new(),
            version: Vec::new(),
            query: Vec::new(),
            headers: HeaderMap::default(),
            body: Vec::new(),
            key_buf: Vec::new(),
            buf: Vec::new(),
            lit_pos: 0,
            has_minor: false,
            header_lines: 0,
            body_remaining: 0,
        }
    }

    /// Clears all accumulated fields and returns to the initial state.
    pub(crate) fn reset(&mut self) {
        self.state = State::Method;
        self.method.clear();
        self.url.clear();
        self.path.clear();
        self.version.clear();
        self.query.clear();
        self.headers.clear();
        self.body.clear();
        self.key_buf.clear();
        self.buf.clear();
        self.lit_pos = 0;
        self.has_minor = false;
        self.header_lines = 0;
        self.body_remaining = 0;
    }

    /// Moves the accumulated fields into a [`Request`]. Only meaningful
    /// after `feed` returned `Ok(true)`; call [`reset`](Parser::reset)
    /// afterwards.
    pub(crate) fn take_request(&mut self, remote_address: String) -> Request {
        debug_assert_eq!(self.state, State::Final);

        Request {
            method: String::from_utf8_lossy(&self.method).into_owned(),
            url: String::from_utf8_lossy(&self.url).into_owned(),
            path: String::from_utf8_lossy(&self.path).into_owned(),
            query: mem::take(&mut self.query),
            version: String::from_utf8_lossy(&self.version).into_owned(),
            headers: mem::take(&mut self.headers),
            body: mem::take(&mut self.body),
            remote_address,
        }
    }

    /// Advances the machine by one byte. Returns `Ok(true)` exactly when
    /// the byte completed a request.
    pub(crate) fn feed(&mut self, byte: u8) -> Result<bool, ErrorKind> {
        // The single `continue` below is the one-byte pushback: the byte
        // is replayed in the state it transitioned into.
        loop {
            match self.state {
                State::Method => {
                    return match byte {
                        b' ' if self.method.is_empty() => Err(ErrorKind::InvalidMethod),
                        b' ' => {
                            self.state = State::Path;
                            Ok(false)
                        }
                        _ if is_ctl(byte) || self.method.len() >= self.limits.method_size => {
                            Err(ErrorKind::InvalidMethod)
                        }
                        _ => {
                            self.method.push(byte);
                            Ok(false)
                        }
                    };
                }

                State::Path => {
                    return match byte {
                        b' ' | b'?' if self.path.is_empty() => Err(ErrorKind::InvalidUrl),
                        b' ' => {
                            self.state = State::HttpLit;
                            Ok(false)
                        }
                        b'?' => {
                            self.push_url(byte)?;
                            self.state = State::QueryKey;
                            Ok(false)
                        }
                        _ if is_ctl(byte) => Err(ErrorKind::InvalidUrl),
                        _ => {
                            self.push_url(byte)?;
                            self.path.push(byte);
                            Ok(false)
                        }
                    };
                }

                State::QueryKey => {
                    return match byte {
                        b'=' if self.key_buf.is_empty() => {
                            Err(ErrorKind::Query(query::Error::EmptyKey))
                        }
                        b'=' => {
                            self.push_url(byte)?;
                            self.state = State::QueryValue;
                            Ok(false)
                        }
                        b'&' if self.key_buf.is_empty() => {
                            Err(ErrorKind::Query(query::Error::EmptyKey))
                        }
                        b'&' => {
                            self.push_url(byte)?;
                            self.commit_query_pair()?;
                            Ok(false)
                        }
                        b' ' => {
                            if !self.key_buf.is_empty() {
                                self.commit_query_pair()?;
                            }
                            self.state = State::HttpLit;
                            Ok(false)
                        }
                        _ if is_ctl(byte) => Err(ErrorKind::InvalidUrl),
                        _ => {
                            self.push_url(byte)?;
                            self.key_buf.push(byte);
                            Ok(false)
                        }
                    };
                }

                State::QueryValue => {
                    return match byte {
                        b'&' => {
                            self.push_url(byte)?;
                            self.commit_query_pair()?;
                            self.state = State::QueryKey;
                            Ok(false)
                        }
                        b' ' => {
                            self.commit_query_pair()?;
                            self.state = State::HttpLit;
                            Ok(false)
                        }
                        _ if is_ctl(byte) => Err(ErrorKind::InvalidUrl),
                        _ => {
                            self.push_url(byte)?;
                            self.buf.push(byte);
                            Ok(false)
                        }
                    };
                }

                State::HttpLit => {
                    return if byte == b"HTTP/"[self.lit_pos] {
                        self.lit_pos += 1;
                        if self.lit_pos == 5 {
                            self.state = State::VersionMajor;
                        }
                        Ok(false)
                    } else {
                        Err(ErrorKind::InvalidVersion)
                    };
                }

                State::VersionMajor => {
                    return match byte {
                        b'0'..=b'9' => self.push_version(byte),
                        b'.' if !self.version.is_empty() => {
                            self.push_version(byte)?;
                            self.state = State::VersionMinor;
                            Ok(false)
                        }
                        _ => Err(ErrorKind::InvalidVersion),
                    };
                }

                State::VersionMinor => {
                    return match byte {
                        b'0'..=b'9' => {
                            self.has_minor = true;
                            self.push_version(byte)
                        }
                        b'\r' if self.has_minor => {
                            self.state = State::LineLf;
                            Ok(false)
                        }
                        _ => Err(ErrorKind::InvalidVersion),
                    };
                }

                State::LineLf => {
                    return match byte {
                        b'\n' => {
                            self.state = State::HeaderKey;
                            Ok(false)
                        }
                        _ => Err(ErrorKind::InvalidVersion),
                    };
                }

                State::HeaderKey => {
                    return match byte {
                        b'\r' if self.key_buf.is_empty() => {
                            self.state = State::BlankLf;
                            Ok(false)
                        }
                        b':' if self.key_buf.is_empty() => Err(ErrorKind::InvalidHeader),
                        b':' => {
                            self.state = State::Key2Value;
                            Ok(false)
                        }
                        _ if is_ctl(byte) => Err(ErrorKind::InvalidHeader),
                        _ if self.key_buf.len() >= self.limits.header_name_size => {
                            Err(ErrorKind::InvalidHeader)
                        }
                        _ => {
                            self.key_buf.push(byte);
                            Ok(false)
                        }
                    };
                }

                State::Key2Value => match byte {
                    b' ' | b'\t' => return Ok(false),
                    b'\r' => {
                        self.commit_header()?;
                        self.state = State::HeaderLf;
                        return Ok(false);
                    }
                    b'\n' => return Err(ErrorKind::InvalidHeader),
                    _ => {
                        self.state = State::HeaderValue;
                        continue;
                    }
                },

                State::HeaderValue => {
                    return match byte {
                        b'\r' => {
                            self.commit_header()?;
                            self.state = State::HeaderLf;
                            Ok(false)
                        }
                        b'\n' => Err(ErrorKind::InvalidHeader),
                        _ if self.buf.len() >= self.limits.header_value_size => {
                            Err(ErrorKind::InvalidHeader)
                        }
                        _ => {
                            self.buf.push(byte);
                            Ok(false)
                        }
                    };
                }

                State::HeaderLf => {
                    return match byte {
                        b'\n' => {
                            self.state = State::HeaderKey;
                            Ok(false)
                        }
                        _ => Err(ErrorKind::InvalidHeader),
                    };
                }

                State::BlankLf => {
                    return match byte {
                        b'\n' => self.end_of_headers(),
                        _ => Err(ErrorKind::InvalidHeader),
                    };
                }

                State::Body => {
                    self.body.push(byte);
                    self.body_remaining -= 1;
                    return if self.body_remaining == 0 {
                        self.state = State::Final;
                        Ok(true)
                    } else {
                        Ok(false)
                    };
                }

                State::Final => {
                    debug_assert!(false, "feed called on a finished parser");
                    return Ok(true);
                }
            }
        }
    }
}

// Commit points
impl Parser {
    #[inline]
    fn push_url(&mut self, byte: u8) -> Result<(), ErrorKind> {
        if self.url.len() >= self.limits.url_size {
            return Err(ErrorKind::InvalidUrl);
        }
        self.url.push(byte);
        Ok(())
    }

    #[inline]
    fn push_version(&mut self, byte: u8) -> Result<bool, ErrorKind> {
        if self.version.len() >= self.limits.version_size {
            return Err(ErrorKind::InvalidVersion);
        }
        self.version.push(byte);
        Ok(false)
    }

    #[inline]
    fn commit_query_pair(&mut self) -> Result<(), ErrorKind> {
        let key = query::url_decode(&self.key_buf)?;
        let value = query::url_decode(&self.buf)?;

        self.query.push((key, value));
        self.key_buf.clear();
        self.buf.clear();
        Ok(())
    }

    #[inline]
    fn commit_header(&mut self) -> Result<(), ErrorKind> {
        self.header_lines += 1;
        if self.header_lines > self.limits.header_count {
            return Err(ErrorKind::TooManyHeaders);
        }

        let name = String::from_utf8_lossy(&self.key_buf).into_owned();
        let value = String::from_utf8_lossy(&self.buf).into_owned();
        self.headers.insert(name, value);

        self.key_buf.clear();
        self.buf.clear();
        Ok(())
    }

    fn end_of_headers(&mut self) -> Result<bool, ErrorKind> {
        if self.headers.get("transfer-encoding").is_some() {
            return Err(ErrorKind::UnsupportedTransferEncoding);
        }
        if self.version == b"1.1" && self.headers.get("host").is_none() {
            return Err(ErrorKind::MissingHost);
        }

        let length = match self.headers.get("content-length") {
            Some(value) => {
                types::slice_to_usize(value.as_bytes()).ok_or(ErrorKind::InvalidContentLength)?
            }
            None => {
                self.state = State::Final;
                return Ok(true);
            }
        };

        if length > self.limits.body_size {
            return Err(ErrorKind::BodyTooLarge);
        }
        if length == 0 {
            self.state = State::Final;
            return Ok(true);
        }

        self.body.reserve(length);
        self.body_remaining = length;
        self.state = State::Body;
        Ok(false)
    }
}

#[inline(always)]
const fn is_ctl(byte: u8) -> bool {
    byte <= 0x1f || byte == 0x7f
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(parser: &mut Parser, input: &[u8]) -> Result<Option<Request>, ErrorKind> {
        for (i, &byte) in input.iter().enumerate() {
            if parser.feed(byte)? {
                assert_eq!(i, input.len() - 1, "request finished before input ended");
                return Ok(Some(parser.take_request("test:0".to_string())));
            }
        }
        Ok(None)
    }

    fn parse(input: &str) -> Result<Request, ErrorKind> {
        let mut parser = Parser::new(ReqLimits::default());
        Ok(feed_all(&mut parser, input.as_bytes())?.expect("incomplete request"))
    }

    #[test]
    fn parse_valid_request() {
        #[rustfmt::skip]
        let cases = [
            (
                "GET / HTTP/1.1\r\nHost: x\r\n\r\n",
                ("GET", "/", "/", "1.1", vec![("host", "x")], &b""[..]),
            ),
            (
                "GET /api/users HTTP/1.1\r\nHost: x\r\n\r\n",
                ("GET", "/api/users", "/api/users", "1.1", vec![("host", "x")], &b""[..]),
            ),
            (
                "POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 9\r\n\r\ntest body",
                (
                    "POST", "/", "/", "1.1",
                    vec![("host", "x"), ("content-length", "9")],
                    &b"test body"[..],
                ),
            ),
            (
                "GET / HTTP/1.0\r\n\r\n",
                ("GET", "/", "/", "1.0", vec![], &b""[..]),
            ),
            (
                "DELETE /thing HTTP/1.0\r\nUser-Agent: curl\r\n\r\n",
                ("DELETE", "/thing", "/thing", "1.0", vec![("USER-AGENT", "curl")], &b""[..]),
            ),
            (
                "GET /a?x=1&y=2 HTTP/1.1\r\nHost: x\r\n\r\n",
                ("GET", "/a?x=1&y=2", "/a", "1.1", vec![("host", "x")], &b""[..]),
            ),
            (
                "GET / HTTP/1.1\r\nX-Empty:\r\nHost: x\r\n\r\n",
                ("GET", "/", "/", "1.1", vec![("x-empty", ""), ("host", "x")], &b""[..]),
            ),
            (
                "GET / HTTP/1.1\r\nX-Empty: \r\nHost: x\r\n\r\n",
                ("GET", "/", "/", "1.1", vec![("x-empty", "")], &b""[..]),
            ),
            (
                "GET / HTTP/1.1\r\nX-Pad: \t padded\r\nHost: x\r\n\r\n",
                ("GET", "/", "/", "1.1", vec![("x-pad", "padded")], &b""[..]),
            ),
        ];

        for (input, (method, url, path, version, headers, body)) in cases {
            let req = parse(input).unwrap_or_else(|e| panic!("{input:?}: {e}"));

            assert_eq!(req.method(), method, "{input:?}");
            assert_eq!(req.url(), url, "{input:?}");
            assert_eq!(req.path(), path, "{input:?}");
            assert_eq!(req.version(), version, "{input:?}");
            assert_eq!(req.body(), body, "{input:?}");
            for (name, value) in headers {
                assert_eq!(req.get(name), Some(value), "{input:?} header {name}");
            }
        }
    }

    #[test]
    fn parse_invalid_request() {
        #[rustfmt::skip]
        let cases = [
            (" GET / HTTP/1.1\r\nHost: x\r\n\r\n",       ErrorKind::InvalidMethod),
            ("GET  HTTP/1.1\r\nHost: x\r\n\r\n",         ErrorKind::InvalidUrl),
            ("GET /\rHTTP/1.1\r\nHost: x\r\n\r\n",       ErrorKind::InvalidUrl),
            ("GET / HTPP/1.1\r\nHost: x\r\n\r\n",        ErrorKind::InvalidVersion),
            ("GET / HTTP/x.1\r\nHost: x\r\n\r\n",        ErrorKind::InvalidVersion),
            ("GET / HTTP/1.\r\nHost: x\r\n\r\n",         ErrorKind::InvalidVersion),
            ("GET / HTTP/.1\r\nHost: x\r\n\r\n",         ErrorKind::InvalidVersion),
            ("GET / HTTP/11\r\nHost: x\r\n\r\n",         ErrorKind::InvalidVersion),
            ("GET / HTTP/1.1\nHost: x\r\n\r\n",          ErrorKind::InvalidVersion),
            ("GET / HTTP/1.1\r\nHost: x\n\r\n",          ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nHost x\r\n\r\n",         ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\n: x\r\n\r\n",            ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nHost: x\r\r\n",          ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\nHost: x\r\n\r\r",        ErrorKind::InvalidHeader),
            ("GET / HTTP/1.1\r\n\r\n",                   ErrorKind::MissingHost),
            (
                "GET / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
                ErrorKind::UnsupportedTransferEncoding,
            ),
            (
                "POST / HTTP/1.1\r\nHost: x\r\nContent-Length: ten\r\n\r\n",
                ErrorKind::InvalidContentLength,
            ),
            (
                "POST / HTTP/1.1\r\nHost: x\r\nContent-Length: -1\r\n\r\n",
                ErrorKind::InvalidContentLength,
            ),
            (
                "POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 10485761\r\n\r\n",
                ErrorKind::BodyTooLarge,
            ),
        ];

        for (input, expected) in cases {
            let mut parser = Parser::new(ReqLimits::default());
            assert_eq!(
                feed_all(&mut parser, input.as_bytes()).unwrap_err(),
                expected,
                "{input:?}"
            );
        }
    }

    #[test]
    fn query_forms() {
        #[rustfmt::skip]
        let cases = [
            ("/a?x=1",             vec![("x", "1")]),
            ("/a?x=1&y=2",         vec![("x", "1"), ("y", "2")]),
            ("/a?debug",           vec![("debug", "")]),
            ("/a?debug&x=1",       vec![("debug", ""), ("x", "1")]),
            ("/a?x=",              vec![("x", "")]),
            ("/a?x=a%20b&y=c+d",   vec![("x", "a b"), ("y", "c d")]),
            ("/a?k%3D=v%26",       vec![("k=", "v&")]),
            ("/a?x=1&x=2&x=3",     vec![("x", "1"), ("x", "2"), ("x", "3")]),
            ("/a?v=a=b=c",         vec![("v", "a=b=c")]),
            ("/a?",                vec![]),
        ];

        for (target, pairs) in cases {
            let req = parse(&format!("GET {target} HTTP/1.1\r\nHost: x\r\n\r\n"))
                .unwrap_or_else(|e| panic!("{target:?}: {e}"));

            let got: Vec<(&str, &str)> = req
                .query_pairs()
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            assert_eq!(got, pairs, "{target:?}");
        }

        // First-wins lookup over duplicate keys.
        let req = parse("GET /a?x=1&x=2 HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(req.query("x"), Some("1"));
        assert_eq!(req.query("missing"), None);
    }

    #[test]
    fn query_failures() {
        #[rustfmt::skip]
        let cases = [
            ("/a?=1",      ErrorKind::Query(query::Error::EmptyKey)),
            ("/a?x=1&&y",  ErrorKind::Query(query::Error::EmptyKey)),
            ("/a?&x=1",    ErrorKind::Query(query::Error::EmptyKey)),
            ("/a?x=%2",    ErrorKind::Query(query::Error::TruncatedEscape)),
            ("/a?x=%zz",   ErrorKind::Query(query::Error::InvalidEscape)),
            ("/a?x=%FF",   ErrorKind::Query(query::Error::Utf8)),
        ];

        for (target, expected) in cases {
            let mut parser = Parser::new(ReqLimits::default());
            let input = format!("GET {target} HTTP/1.1\r\nHost: x\r\n\r\n");
            assert_eq!(
                feed_all(&mut parser, input.as_bytes()).unwrap_err(),
                expected,
                "{target:?}"
            );
        }
    }

    #[test]
    fn check_limits() {
        let limits = ReqLimits::default();

        let long_method = "M".repeat(limits.method_size);
        let long_url = format!("/{}", "u".repeat(limits.url_size - 1));
        let long_name = "N".repeat(limits.header_name_size);
        let long_value = "v".repeat(limits.header_value_size);

        #[rustfmt::skip]
        let ok_cases = [
            format!("{long_method} / HTTP/1.1\r\nHost: x\r\n\r\n"),
            format!("GET {long_url} HTTP/1.1\r\nHost: x\r\n\r\n"),
            format!("GET / HTTP/1.1\r\nHost: x\r\n{long_name}: {long_value}\r\n\r\n"),
        ];
        for input in &ok_cases {
            parse(input).unwrap_or_else(|e| panic!("should fit in limits: {e}"));
        }

        #[rustfmt::skip]
        let err_cases = [
            (
                format!("{long_method}X / HTTP/1.1\r\nHost: x\r\n\r\n"),
                ErrorKind::InvalidMethod,
            ),
            (
                format!("GET {long_url}X HTTP/1.1\r\nHost: x\r\n\r\n"),
                ErrorKind::InvalidUrl,
            ),
            (
                format!("GET / HTTP/1.1\r\n{long_name}X: v\r\nHost: x\r\n\r\n"),
                ErrorKind::InvalidHeader,
            ),
            (
                format!("GET / HTTP/1.1\r\nN: {long_value}X\r\nHost: x\r\n\r\n"),
                ErrorKind::InvalidHeader,
            ),
            (
                format!(
                    "GET / HTTP/1.1\r\n{}\r\n",
                    "H: v\r\n".repeat(limits.header_count + 1)
                ),
                ErrorKind::TooManyHeaders,
            ),
        ];
        for (input, expected) in err_cases {
            let mut parser = Parser::new(ReqLimits::default());
            assert_eq!(feed_all(&mut parser, input.as_bytes()).unwrap_err(), expected);
        }

        // Exactly `header_count` lines are fine, duplicates included.
        let input = format!(
            "GET / HTTP/1.1\r\nHost: x\r\n{}\r\n",
            "H: v\r\n".repeat(limits.header_count - 1)
        );
        parse(&input).unwrap();
    }

    #[test]
    fn host_gating_is_version_exact() {
        assert_eq!(parse("GET / HTTP/1.1\r\n\r\n"), Err(ErrorKind::MissingHost));
        parse("GET / HTTP/1.0\r\n\r\n").unwrap();
        parse("GET / HTTP/2.0\r\n\r\n").unwrap();
        parse("GET / HTTP/1.1\r\nhOsT: x\r\n\r\n").unwrap();
    }

    #[test]
    fn duplicate_headers_last_wins() {
        let req = parse("GET / HTTP/1.1\r\nHost: x\r\nX-A: 1\r\nx-a: 2\r\n\r\n").unwrap();
        assert_eq!(req.get("x-a"), Some("2"));
        assert_eq!(req.get("X-A"), Some("2"));
    }

    #[test]
    fn zero_content_length_finishes_at_blank_line() {
        let req = parse("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert_eq!(req.body(), b"");
    }

    #[test]
    fn body_stops_at_content_length() {
        let input = b"POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 4\r\n\r\nabcdEXTRA";
        let mut parser = Parser::new(ReqLimits::default());

        let mut finished_at = None;
        for (i, &byte) in input.iter().enumerate() {
            if parser.feed(byte).unwrap() {
                finished_at = Some(i);
                break;
            }
        }

        let end = finished_at.expect("request should finish");
        assert_eq!(&input[end + 1..], b"EXTRA");
        assert_eq!(parser.take_request("test:0".into()).body(), b"abcd");
    }

    #[test]
    fn reset_accepts_next_request() {
        let mut parser = Parser::new(ReqLimits::default());

        let first = feed_all(
            &mut parser,
            b"POST /one HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\nhi",
        )
        .unwrap()
        .unwrap();
        assert_eq!(first.path(), "/one");
        assert_eq!(first.body(), b"hi");

        parser.reset();

        let second = feed_all(&mut parser, b"GET /two HTTP/1.1\r\nHost: y\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(second.method(), "GET");
        assert_eq!(second.path(), "/two");
        assert_eq!(second.get("host"), Some("y"));
        assert_eq!(second.body(), b"");
    }

    #[test]
    fn fragmentation_is_invisible() {
        let input = b"POST /p?a=1&b=two HTTP/1.1\r\nHost: h\r\nX-K: val\r\nContent-Length: 5\r\n\r\nhello";

        let whole = {
            let mut parser = Parser::new(ReqLimits::default());
            feed_all(&mut parser, input).unwrap().unwrap()
        };

        for chunk_size in [1, 2, 3, 7, 16, input.len()] {
            let mut parser = Parser::new(ReqLimits::default());
            let mut parsed = None;
            for chunk in input.chunks(chunk_size) {
                if let Some(req) = feed_all(&mut parser, chunk).unwrap() {
                    parsed = Some(req);
                }
            }
            assert_eq!(parsed.as_ref(), Some(&whole), "chunk size {chunk_size}");
        }
    }
}
