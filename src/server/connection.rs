use crate::{
    http::{
        request::{Parser, Request},
        response::Response,
    },
    rt::{event_loop::panic_message, promise::Completion},
    server::server_impl::ServerInner,
};
use mio::{net::TcpStream, Token};
use std::{
    cell::{Cell, RefCell},
    io::{ErrorKind as IoErrorKind, Read, Write},
    panic::{self, AssertUnwindSafe},
    rc::Rc,
};

/// Best-effort reply for input the parser rejected; the connection is
/// closed right after.
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 11\r\nConnection: close\r\n\r\nBad Request";

/// Per-socket connection state.
///
/// Created on accept and destroyed through exactly one path:
/// [`close`](Connection::close) cancels the idle timer, deregisters the
/// socket, removes the record from the server's set and releases the
/// connection's loop reference. The socket itself closes when the last
/// `Rc` drops.
pub(crate) struct Connection {
    pub(crate) token: Cell<Token>,
    stream: RefCell<TcpStream>,
    remote_address: String,
    parser: RefCell<Parser>,
    read_buf: RefCell<Box<[u8]>>,
    idle: RefCell<Option<crate::rt::event_loop::TimerHandle>>,
    pub(crate) in_flight: Cell<bool>,
    closed: Cell<bool>,
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, remote_address: String, server: &ServerInner) -> Self {
        Self {
            token: Cell::new(Token(0)),
            stream: RefCell::new(stream),
            remote_address,
            parser: RefCell::new(Parser::new(server.req_limits.clone())),
            read_buf: RefCell::new(vec![0; server.conn_limits.read_buffer_size].into_boxed_slice()),
            idle: RefCell::new(None),
            in_flight: Cell::new(false),
            closed: Cell::new(false),
        }
    }

    pub(crate) fn stream_mut(&self) -> std::cell::RefMut<'_, TcpStream> {
        self.stream.borrow_mut()
    }

    /// Read-readiness entry point. Reads until `WouldBlock` (the poller
    /// is edge-triggered) and feeds every byte to the parser.
    pub(crate) fn on_readable(conn: &Rc<Connection>, server: &Rc<ServerInner>) {
        if conn.closed.get() {
            return;
        }

        if let Some(idle) = conn.idle.borrow_mut().take() {
            idle.cancel();
        }

        let mut buf = conn.read_buf.borrow_mut();
        loop {
            let read = conn.stream.borrow_mut().read(&mut buf[..]);
            match read {
                Ok(0) => {
                    tracing::debug!(peer = %conn.remote_address, "peer closed");
                    Connection::close(conn, server);
                    return;
                }
                Ok(n) => {
                    if !Connection::feed(conn, server, &buf[..n]) {
                        return;
                    }
                }
                Err(ref err) if err.kind() == IoErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == IoErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!(peer = %conn.remote_address, error = %err, "read failed");
                    Connection::close(conn, server);
                    return;
                }
            }
        }

        if !conn.closed.get() {
            Connection::arm_idle(conn, server);
        }
    }

    /// Feeds a chunk to the parser, dispatching a request every time the
    /// machine reaches its terminal state so back-to-back pipelined
    /// bytes keep flowing. Returns `false` once the connection closed.
    fn feed(conn: &Rc<Connection>, server: &Rc<ServerInner>, chunk: &[u8]) -> bool {
        for &byte in chunk {
            if conn.closed.get() {
                return false;
            }

            let step = conn.parser.borrow_mut().feed(byte);
            match step {
                Ok(false) => {}
                Ok(true) => {
                    let request = {
                        let mut parser = conn.parser.borrow_mut();
                        let request = parser.take_request(conn.remote_address.clone());
                        parser.reset();
                        request
                    };
                    tracing::debug!(
                        peer = %conn.remote_address,
                        method = %request.method(),
                        path = %request.path(),
                        "request"
                    );
                    Connection::dispatch(conn, server, request);
                }
                Err(err) => {
                    tracing::debug!(peer = %conn.remote_address, error = %err, "bad request");
                    conn.write_raw(BAD_REQUEST);
                    Connection::close(conn, server);
                    return false;
                }
            }
        }
        true
    }

    /// Hands a parsed request to the user handler, wiring the response's
    /// finish hook and the failure recovery for the returned completion.
    fn dispatch(conn: &Rc<Connection>, server: &Rc<ServerInner>, request: Request) {
        conn.in_flight.set(true);

        let response = Response::new(
            Rc::clone(&server.lp),
            request.version().to_string(),
            request.get("connection").map(str::to_string),
            Box::new({
                let conn = Rc::clone(conn);
                move |bytes: &[u8]| conn.write_raw(bytes)
            }),
            Box::new({
                let conn = Rc::clone(conn);
                let server = Rc::clone(server);
                move |keep_alive| {
                    conn.in_flight.set(false);
                    if keep_alive && !server.closing.get() && !conn.closed.get() {
                        Connection::arm_idle(&conn, &server);
                    } else {
                        Connection::close(&conn, &server);
                    }
                }
            }),
        );

        // A panic inside the handler becomes a failed completion, so the
        // recovery below covers sync and async failures alike.
        let handled = panic::catch_unwind(AssertUnwindSafe(|| {
            server.handler.handle(request, response.clone())
        }));
        let completion = match handled {
            Ok(completion) => completion,
            Err(payload) => Completion::failed(&server.lp, panic_message(payload.as_ref())),
        };

        let recover_conn = Rc::clone(conn);
        let recover_server = Rc::clone(server);
        completion.on_settled(move |result| {
            if let Err(err) = result {
                tracing::warn!(
                    peer = %recover_conn.remote_address,
                    error = %err,
                    "handler failed"
                );
                if !response.is_sent() {
                    response.status(500);
                    response.send(&err.message);
                    Connection::close(&recover_conn, &recover_server);
                }
            }
        });
    }

    pub(crate) fn arm_idle(conn: &Rc<Connection>, server: &Rc<ServerInner>) {
        if conn.closed.get() {
            return;
        }

        let handle = server.lp.set_timeout(server.conn_limits.idle_timeout, {
            let conn = Rc::clone(conn);
            let server = Rc::clone(server);
            move || {
                tracing::debug!(peer = %conn.remote_address, "idle timeout");
                Connection::close(&conn, &server);
            }
        });
        if let Some(previous) = conn.idle.borrow_mut().replace(handle) {
            previous.cancel();
        }
    }

    pub(crate) fn close(conn: &Rc<Connection>, server: &Rc<ServerInner>) {
        if conn.closed.replace(true) {
            return;
        }

        if let Some(idle) = conn.idle.borrow_mut().take() {
            idle.cancel();
        }
        let _ = server
            .lp
            .deregister(&mut *conn.stream.borrow_mut(), conn.token.get());
        server.connections.borrow_mut().remove(&conn.token.get());
        server.lp.unref();
        tracing::debug!(peer = %conn.remote_address, "connection closed");

        server.maybe_drained();
    }

    /// One contiguous write attempt; failures are swallowed because the
    /// peer may have gone away.
    fn write_raw(&self, bytes: &[u8]) {
        if self.closed.get() {
            return;
        }

        let mut stream = self.stream.borrow_mut();
        if let Err(err) = stream.write_all(bytes) {
            tracing::debug!(peer = %self.remote_address, error = %err, "response write failed");
        }
    }
}
