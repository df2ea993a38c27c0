use crate::{
    http::{request::Request, response::Response},
    limits::{ConnLimits, ReqLimits},
    rt::{event_loop::EventLoop, promise::Completion},
    server::connection::Connection,
};
use mio::{net::TcpListener, Interest, Token};
use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    io::ErrorKind as IoErrorKind,
    net::SocketAddr,
    rc::Rc,
};

/// A trait for handling HTTP requests.
///
/// The handler receives the parsed [`Request`] and an open [`Response`]
/// and returns a [`Completion`] that settles when its work is done. The
/// response does not have to be sent before returning: keep a clone of
/// it alive in a timer or continuation and send later.
///
/// Any `Fn(Request, Response) -> Completion` closure is a handler:
///
/// ```no_run
/// use solo_web::{Completion, EventLoop, Request, Response, Server};
/// use std::rc::Rc;
///
/// let lp = Rc::new(EventLoop::new().unwrap());
/// let server = Server::new(&lp, {
///     let lp = Rc::clone(&lp);
///     move |_req: Request, res: Response| {
///         res.send("Hello world!");
///         Completion::done(&lp)
///     }
/// });
/// server.listen(8080, "127.0.0.1", || {}).unwrap();
/// lp.run();
/// ```
pub trait Handler: 'static {
    fn handle(&self, request: Request, response: Response) -> Completion;
}

impl<F> Handler for F
where
    F: Fn(Request, Response) -> Completion + 'static,
{
    #[inline]
    fn handle(&self, request: Request, response: Response) -> Completion {
        self(request, response)
    }
}

/// A single-threaded HTTP/1.1 server driven by an [`EventLoop`].
///
/// The handle is cheap to clone; all clones refer to the same server.
#[derive(Clone)]
pub struct Server {
    inner: Rc<ServerInner>,
}

pub(crate) struct ServerInner {
    pub(crate) lp: Rc<EventLoop>,
    pub(crate) handler: Box<dyn Handler>,
    listener: RefCell<Option<TcpListener>>,
    listener_token: Cell<Option<Token>>,
    pub(crate) connections: RefCell<HashMap<Token, Rc<Connection>>>,
    pub(crate) closing: Cell<bool>,
    actual_port: Cell<u16>,
    on_drain: RefCell<Option<Box<dyn FnOnce()>>>,
    pub(crate) req_limits: ReqLimits,
    pub(crate) conn_limits: ConnLimits,
}

impl Server {
    /// Creates a server with default [`ReqLimits`] and [`ConnLimits`].
    pub fn new<H: Handler>(lp: &Rc<EventLoop>, handler: H) -> Self {
        Self::with_limits(lp, handler, ReqLimits::default(), ConnLimits::default())
    }

    /// Creates a server with explicit limits.
    pub fn with_limits<H: Handler>(
        lp: &Rc<EventLoop>,
        handler: H,
        req_limits: ReqLimits,
        conn_limits: ConnLimits,
    ) -> Self {
        Self {
            inner: Rc::new(ServerInner {
                lp: Rc::clone(lp),
                handler: Box::new(handler),
                listener: RefCell::new(None),
                listener_token: Cell::new(None),
                connections: RefCell::new(HashMap::new()),
                closing: Cell::new(false),
                actual_port: Cell::new(0),
                on_drain: RefCell::new(None),
                req_limits,
                conn_limits,
            }),
        }
    }

    /// Binds a non-blocking listener and starts accepting.
    ///
    /// Holds one loop reference while the listener is open.
    /// `on_listening` is scheduled as a microtask, so it fires after
    /// `listen` returns. Pass port `0` to bind an ephemeral port and
    /// read it back with [`actual_port`](Server::actual_port).
    ///
    /// # Errors
    ///
    /// Bind and registration failures surface to the caller.
    pub fn listen<F>(&self, port: u16, host: &str, on_listening: F) -> io::Result<()>
    where
        F: FnOnce() + 'static,
    {
        let addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|err| io::Error::new(IoErrorKind::InvalidInput, err))?;
        let mut listener = TcpListener::bind(addr)?;
        self.inner.actual_port.set(listener.local_addr()?.port());

        let token = self.inner.lp.register(&mut listener, Interest::READABLE, {
            let inner = Rc::clone(&self.inner);
            move |_| ServerInner::on_acceptable(&inner)
        })?;
        self.inner.listener_token.set(Some(token));
        *self.inner.listener.borrow_mut() = Some(listener);

        self.inner.lp.ref_();
        self.inner.lp.next_tick(on_listening);
        tracing::debug!(port = self.inner.actual_port.get(), "listening");
        Ok(())
    }

    /// The port the listener actually bound (useful with port `0`).
    #[inline]
    pub fn actual_port(&self) -> u16 {
        self.inner.actual_port.get()
    }

    /// Shuts the server down. Idempotent.
    ///
    /// New accepts stop immediately and idle keep-alive connections are
    /// closed at once. A connection whose handler is already running
    /// keeps living until its response resolves, then closes.
    /// `on_drain` is scheduled as a microtask once the live-connection
    /// count reaches zero, possibly right away.
    pub fn close<F>(&self, on_drain: F)
    where
        F: FnOnce() + 'static,
    {
        let inner = &self.inner;
        if inner.closing.replace(true) {
            return;
        }
        tracing::debug!("server closing");

        if let Some(mut listener) = inner.listener.borrow_mut().take() {
            if let Some(token) = inner.listener_token.take() {
                let _ = inner.lp.deregister(&mut listener, token);
            }
            inner.lp.unref();
        }

        *inner.on_drain.borrow_mut() = Some(Box::new(on_drain));

        // Snapshot: closing mutates the set while we walk it.
        let idle: Vec<Rc<Connection>> = inner
            .connections
            .borrow()
            .values()
            .filter(|conn| !conn.in_flight.get())
            .cloned()
            .collect();
        for conn in idle {
            Connection::close(&conn, inner);
        }

        inner.maybe_drained();
    }
}

impl ServerInner {
    fn on_acceptable(inner: &Rc<ServerInner>) {
        loop {
            let accepted = match &mut *inner.listener.borrow_mut() {
                Some(listener) => listener.accept(),
                None => return,
            };

            match accepted {
                Ok((stream, addr)) => {
                    if inner.closing.get() {
                        drop(stream);
                        continue;
                    }
                    if let Err(err) = ServerInner::add_connection(inner, stream, addr) {
                        tracing::warn!(peer = %addr, error = %err, "failed to register connection");
                    }
                }
                Err(ref err) if err.kind() == IoErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == IoErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    break;
                }
            }
        }
    }

    fn add_connection(
        inner: &Rc<ServerInner>,
        stream: mio::net::TcpStream,
        addr: SocketAddr,
    ) -> io::Result<()> {
        let conn = Rc::new(Connection::new(stream, addr.to_string(), inner));

        let token = inner.lp.register(&mut *conn.stream_mut(), Interest::READABLE, {
            let conn = Rc::clone(&conn);
            let inner = Rc::clone(inner);
            move |_| Connection::on_readable(&conn, &inner)
        })?;
        conn.token.set(token);

        inner.lp.ref_();
        inner.connections.borrow_mut().insert(token, Rc::clone(&conn));
        Connection::arm_idle(&conn, inner);
        tracing::debug!(peer = %addr, "connection accepted");
        Ok(())
    }

    /// Fires the drain callback once the server is closing and the last
    /// connection is gone.
    pub(crate) fn maybe_drained(&self) {
        if self.closing.get() && self.connections.borrow().is_empty() {
            if let Some(on_drain) = self.on_drain.borrow_mut().take() {
                self.lp.next_tick(on_drain);
            }
        }
    }
}
