//! solo_web - Single-threaded event-loop HTTP/1.1 server
//!
//! A small HTTP server built around one cooperative event loop: all
//! parsing, handler code, timers and socket I/O run on the thread that
//! calls [`EventLoop::run`]. Handlers return a deferred [`Completion`]
//! token, so a response can be finished later, from a timer or a
//! continuation, without ever blocking the thread.
//!
//! # What you get
//!
//! - **Strict phase ordering** - microtasks drain before timers, timers
//!   before I/O handlers, immediates after the poll, with the microtask
//!   queue drained again after every single macrotask.
//! - **Reference-counted liveness** - [`EventLoop::run`] returns when
//!   nothing keeps the loop alive: no open sockets, no armed timers, no
//!   queued work.
//! - **A byte-fed request parser** - tolerant of any fragmentation,
//!   strict about limits and malformed input.
//! - **Keep-alive done for you** - idle timeouts, `Connection`
//!   negotiation and graceful shutdown are part of the connection
//!   lifecycle.
//!
//! # Quick Start
//!
//! ```no_run
//! use solo_web::{Completion, EventLoop, Request, Response, Server};
//! use std::rc::Rc;
//!
//! let lp = Rc::new(EventLoop::new().unwrap());
//!
//! let server = Server::new(&lp, {
//!     let lp = Rc::clone(&lp);
//!     move |_req: Request, res: Response| {
//!         res.send("Hello world!");
//!         Completion::done(&lp)
//!     }
//! });
//!
//! server.listen(8080, "127.0.0.1", || println!("listening")).unwrap();
//! lp.run();
//! ```
//!
//! # Scope
//!
//! HTTP/1.1 and HTTP/1.0 with `Content-Length` bodies. No TLS, no
//! HTTP/2, no chunked transfer-encoding, no routing layer. Bring your
//! own dispatch inside the handler.

pub(crate) mod http {
    pub mod query;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod rt {
    pub(crate) mod event_loop;
    pub(crate) mod promise;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod server_impl;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::HandlerError,
    http::{query, request::Request, response::Response, types::status_message},
    rt::{
        event_loop::{EventLoop, LoopRemote, TimerHandle},
        promise::Completion,
    },
    server::server_impl::{Handler, Server},
};
