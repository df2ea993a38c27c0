//! Counts requests and answers them a little later, from a timer: the
//! response outlives the handler call without blocking the loop.

use solo_web::{Completion, EventLoop, Request, Response, Server};
use std::{cell::Cell, rc::Rc, time::Duration};

fn main() {
    tracing_subscriber::fmt::init();

    let lp = Rc::new(EventLoop::new().expect("event loop"));
    let counter = Rc::new(Cell::new(0u64));

    let server = Server::new(&lp, {
        let lp = Rc::clone(&lp);
        move |req: Request, res: Response| {
            counter.set(counter.get() + 1);
            let number = counter.get();

            if req.path() == "/slow" {
                let delayed = res.clone();
                lp.set_timeout(Duration::from_millis(500), move || {
                    delayed.send(&format!("request #{number}, eventually"));
                });
            } else {
                res.send(&format!("request #{number}"));
            }

            Completion::done(&lp)
        }
    });

    server
        .listen(8080, "127.0.0.1", || {
            println!("listening on http://127.0.0.1:8080 (try /slow)");
        })
        .expect("listen");

    lp.run();
}
