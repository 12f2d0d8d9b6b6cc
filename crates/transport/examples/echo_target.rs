use micro_transport::connection::{Connection, ParseError, RequestLine, ResponseStream};
use micro_transport::memory::MemoryPool;
use micro_transport::networking::{EventLoop, ServerAddress, TcpHandle};
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

fn main() {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::DEBUG).finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let address = match ServerAddress::from_url("http://localhost:8080") {
        Ok(address) => address,
        Err(e) => {
            error!(cause = %e, "invalid server address");
            return;
        }
    };

    let pool = MemoryPool::new();
    let mut event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            error!(cause = %e, "event loop init error");
            return;
        }
    };

    let listener = TcpHandle::init(&mut event_loop);
    let listening = listener.bind(&mut event_loop, &address).and_then(|()| {
        listener.listen(&mut event_loop, 128, move |event_loop, accepted| {
            let tcp = match accepted {
                Ok(tcp) => tcp,
                Err(e) => {
                    warn!(cause = %e, "failed to accept");
                    return;
                }
            };
            if let Err(e) = Connection::start(event_loop, tcp, pool.clone(), echo_target) {
                warn!(cause = %e, "failed to start connection");
            }
        })
    });
    if let Err(e) = listening {
        error!(cause = %e, "bind server error");
        return;
    }

    info!(%address, "start listening");
    if let Err(e) = event_loop.run() {
        error!(cause = %e, "event loop error");
    }
    event_loop.dispose();
}

fn echo_target(
    _: &mut EventLoop,
    connection: &Connection,
    request_line: Result<RequestLine, ParseError>,
) {
    let line = match request_line {
        Ok(line) => line,
        Err(e) => {
            warn!(cause = %e, "bad request, connection dropped");
            return;
        }
    };

    let body = format!("{} {}\r\n", line.method(), line.target());
    let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
    let stream = ResponseStream::new(connection.output().clone());
    if let Err(e) = stream.write(head.as_bytes()).and_then(|()| stream.write(body.as_bytes())) {
        warn!(cause = %e, "failed to write response");
    }
    stream.stop_accepting_writes();
}
