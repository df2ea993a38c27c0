//! HTTP response builder and serialiser.

use crate::{http::types::status_message, rt::event_loop::EventLoop, Completion};
use std::{
    cell::RefCell,
    rc::Rc,
    time::SystemTime,
};

type Wire = Box<dyn FnMut(&[u8])>;
type FinishFn = Box<dyn FnOnce(bool)>;

/// An outgoing HTTP response.
///
/// Mutable until sent: set the status and headers in any order, then
/// finish with one of the body methods. [`end`](Response::end) is the
/// single egress point: it serialises the status line, headers and body
/// as one contiguous write, decides keep-alive, and fires the
/// connection's finish hook. A response transitions from *open* to
/// *sent* exactly once; every later send is a no-op that returns an
/// already-completed [`Completion`].
///
/// Instances are created by the server and handed to the handler
/// together with the parsed [`Request`](crate::Request). The handle is
/// cheap to clone, which is how a handler keeps it alive across a timer
/// or deferred continuation.
///
/// # Examples
/// ```ignore
/// // In a handler:
/// res.status(201).set("X-Request-Id", "42").send("created")
/// ```
#[derive(Clone)]
pub struct Response {
    inner: Rc<RefCell<ResponseInner>>,
}

struct ResponseInner {
    lp: Rc<EventLoop>,
    status: u16,
    reason: String,
    headers: Vec<(String, String)>,
    version: String,
    request_connection: Option<String>,
    headers_sent: bool,
    wire: Option<Wire>,
    on_finish: Option<FinishFn>,
}

impl Response {
    pub(crate) fn new(
        lp: Rc<EventLoop>,
        version: String,
        request_connection: Option<String>,
        wire: Wire,
        on_finish: FinishFn,
    ) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ResponseInner {
                lp,
                status: 200,
                reason: status_message(200).into_owned(),
                headers: Vec::new(),
                version,
                request_connection,
                headers_sent: false,
                wire: Some(wire),
                on_finish: Some(on_finish),
            })),
        }
    }

    /// Sets the status code; the reason phrase follows the status table.
    pub fn status(&self, code: u16) -> &Self {
        let mut inner = self.inner.borrow_mut();
        inner.status = code;
        inner.reason = status_message(code).into_owned();
        drop(inner);
        self
    }

    /// Writes a header. Names are matched case-insensitively and the
    /// last write wins, keeping the first write's position.
    pub fn set(&self, name: &str, value: &str) -> &Self {
        set_header(&mut self.inner.borrow_mut().headers, name, value);
        self
    }

    /// Sets the status code and a batch of headers in one call.
    pub fn write_head(&self, code: u16, headers: &[(&str, &str)]) -> &Self {
        self.status(code);
        for (name, value) in headers {
            self.set(name, value);
        }
        self
    }

    /// Whether [`end`](Response::end) has already run.
    #[inline]
    pub fn is_sent(&self) -> bool {
        self.inner.borrow().headers_sent
    }

    /// Sends a plain-text body (`text/plain; charset=UTF-8` unless a
    /// `Content-Type` was set).
    #[inline]
    pub fn send(&self, text: &str) -> Completion {
        self.send_typed("text/plain; charset=UTF-8", text)
    }

    /// Sends an HTML body.
    #[inline]
    pub fn send_html(&self, html: &str) -> Completion {
        self.send_typed("text/html; charset=UTF-8", html)
    }

    /// Sends a JSON body (the caller supplies the serialised text).
    #[inline]
    pub fn send_json(&self, json: &str) -> Completion {
        self.send_typed("application/json; charset=UTF-8", json)
    }

    /// Sends the status code's reason phrase as the body.
    pub fn send_status(&self, code: u16) -> Completion {
        self.status(code);
        let reason = self.inner.borrow().reason.clone();
        self.send(&reason)
    }

    fn send_typed(&self, content_type: &str, body: &str) -> Completion {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.headers_sent && get_header(&inner.headers, "content-type").is_none() {
                set_header(&mut inner.headers, "Content-Type", content_type);
            }
        }
        self.end(body.as_bytes())
    }

    /// Finishes the response: single egress point for every body method.
    ///
    /// Idempotent: once sent, returns an already-completed token and
    /// does nothing else. The write is best-effort: a failed socket
    /// write is swallowed because the peer may already be gone.
    pub fn end(&self, body: &[u8]) -> Completion {
        let mut inner = self.inner.borrow_mut();
        if inner.headers_sent {
            let lp = Rc::clone(&inner.lp);
            drop(inner);
            return Completion::done(&lp);
        }
        inner.headers_sent = true;

        if get_header(&inner.headers, "date").is_none() {
            let date = httpdate::fmt_http_date(SystemTime::now());
            set_header(&mut inner.headers, "Date", &date);
        }
        set_header(&mut inner.headers, "Content-Length", &body.len().to_string());

        // The server's keep-alive decision always wins over anything a
        // handler wrote into the Connection header.
        let keep_alive = keep_alive(&inner.version, inner.request_connection.as_deref());
        set_header(
            &mut inner.headers,
            "Connection",
            if keep_alive { "keep-alive" } else { "close" },
        );

        let mut out = Vec::with_capacity(128 + body.len());
        out.extend_from_slice(b"HTTP/");
        out.extend_from_slice(inner.version.as_bytes());
        out.push(b' ');
        out.extend_from_slice(inner.status.to_string().as_bytes());
        out.push(b' ');
        out.extend_from_slice(inner.reason.as_bytes());
        out.extend_from_slice(b"\r\n");
        for (name, value) in &inner.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(body);

        if let Some(wire) = inner.wire.as_mut() {
            wire(&out);
        }

        let on_finish = inner.on_finish.take();
        let lp = Rc::clone(&inner.lp);
        drop(inner);

        if let Some(finish) = on_finish {
            finish(keep_alive);
        }
        Completion::done(&lp)
    }
}

/// Keep-alive negotiation: for HTTP/1.1 the connection persists unless
/// the request asked to `close`; anything older persists only when the
/// request asked for `keep-alive`.
fn keep_alive(version: &str, request_connection: Option<&str>) -> bool {
    let connection = request_connection.unwrap_or("");
    if version == "1.1" {
        !contains_token(connection, "close")
    } else {
        contains_token(connection, "keep-alive")
    }
}

fn contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

fn get_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn set_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    match headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        Some((_, existing)) => *existing = value.to_string(),
        None => headers.push((name.to_string(), value.to_string())),
    }
}
