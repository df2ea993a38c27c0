use solo_web::{Completion, EventLoop, Request, Response, Server};
use std::rc::Rc;

fn main() {
    tracing_subscriber::fmt::init();

    let lp = Rc::new(EventLoop::new().expect("event loop"));

    let server = Server::new(&lp, {
        let lp = Rc::clone(&lp);
        move |_req: Request, res: Response| {
            res.send("Hello world!");
            Completion::done(&lp)
        }
    });

    server
        .listen(8080, "127.0.0.1", || {
            println!("listening on http://127.0.0.1:8080");
        })
        .expect("listen");

    lp.run();
}
