use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;

use http::Method;
use micro_transport::connection::{
    Connection, FrameControl, MAX_HEADER_SIZE, ParseError, ResponseStream, SocketOutput, StreamError,
};
use micro_transport::memory::MemoryPool;
use micro_transport::networking::{EventLoop, ServerAddress, TcpHandle};
use tokio_util::sync::CancellationToken;

type Requests = Rc<RefCell<Vec<Result<(Method, String), ParseError>>>>;

/// Serves a single connection through [`Connection`], handing every request line to `on_request`.
fn serve_once(
    event_loop: &mut EventLoop,
    pool: &MemoryPool,
    on_request: impl Fn(&mut EventLoop, &Connection) + 'static,
) -> (SocketAddr, Requests) {
    let requests: Requests = Rc::default();
    let listener = Rc::new(Cell::new(None::<TcpHandle>));
    let on_request = Rc::new(on_request);

    let handle = TcpHandle::init(event_loop);
    handle.bind(event_loop, &ServerAddress::from_url("http://localhost:0").unwrap()).unwrap();
    handle
        .listen(event_loop, 16, {
            let pool = pool.clone();
            let requests = Rc::clone(&requests);
            let listener = Rc::clone(&listener);
            move |event_loop, accepted| {
                if let Some(listener) = listener.take() {
                    listener.close(event_loop).unwrap();
                }
                let requests = Rc::clone(&requests);
                let on_request = Rc::clone(&on_request);
                Connection::start(event_loop, accepted.unwrap(), pool.clone(), move |event_loop, connection, line| {
                    let ok = line.is_ok();
                    requests.borrow_mut().push(line.map(|line| (line.method().clone(), line.target().to_owned())));
                    if ok {
                        on_request(event_loop, connection);
                    }
                })
                .unwrap();
            }
        })
        .unwrap();
    listener.set(Some(handle));

    let address = handle.local_addr(event_loop).unwrap();
    (address, requests)
}

const NO_CONTENT: &[u8] = b"HTTP/1.1 204 No Content\r\n\r\n";

#[test]
fn pipelined_request_lines_are_reported_in_order() {
    let mut event_loop = EventLoop::new().unwrap();
    let pool = MemoryPool::builder().block_size(16).build().unwrap();
    let (address, requests) = serve_once(&mut event_loop, &pool, |_, connection| {
        connection.output().write(NO_CONTENT).unwrap();
    });

    let peer = thread::spawn(move || {
        let mut stream = TcpStream::connect(address).unwrap();
        stream.write_all(b"GET /first HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n").unwrap();
        stream.write_all(b"DELETE /items/7 HTTP/1.0\r\n\r\n").unwrap();

        let mut responses = vec![0; NO_CONTENT.len() * 2];
        stream.read_exact(&mut responses).unwrap();
        responses
    });

    event_loop.run().unwrap();
    assert_eq!(peer.join().unwrap(), [NO_CONTENT, NO_CONTENT].concat());
    assert_eq!(
        *requests.borrow(),
        vec![Ok((Method::GET, "/first".to_owned())), Ok((Method::DELETE, "/items/7".to_owned()))]
    );
    assert_eq!(pool.stats().leased_blocks, 0);
    event_loop.dispose();
}

#[test]
fn malformed_request_line_closes_the_connection() {
    let mut event_loop = EventLoop::new().unwrap();
    let pool = MemoryPool::new();
    let (address, requests) = serve_once(&mut event_loop, &pool, |_, _| {});

    let peer = thread::spawn(move || {
        let mut stream = TcpStream::connect(address).unwrap();
        stream.write_all(b"BR@KEN / HTTP/1.1\r\n\r\n").unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).map(|_| rest).unwrap_or_default()
    });

    event_loop.run().unwrap();
    assert!(peer.join().unwrap().is_empty());
    assert_eq!(*requests.borrow(), vec![Err(ParseError::InvalidMethod)]);
    assert_eq!(pool.stats().leased_blocks, 0);
    event_loop.dispose();
}

#[test]
fn response_stream_writes_from_another_thread() {
    let mut event_loop = EventLoop::new().unwrap();
    let pool = MemoryPool::new();
    let (outputs, worker_outputs) = mpsc::channel::<SocketOutput>();
    let (address, _requests) = serve_once(&mut event_loop, &pool, move |_, connection| {
        outputs.send(connection.output().clone()).unwrap();
    });

    // the peer keeps the connection open until the worker is done with it
    let (finished, worker_finished) = mpsc::channel::<()>();
    let worker = thread::spawn(move || {
        let output = worker_outputs.recv().unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let result = runtime.block_on(async move {
            let stream = ResponseStream::new(output);
            stream.write_async(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\n", CancellationToken::new()).await?;
            stream.write_async(b"hello", CancellationToken::new()).await?;
            stream.flush_async(CancellationToken::new()).await?;

            stream.stop_accepting_writes();
            match stream.write(b"late") {
                Err(StreamError::Disposed) => Ok::<(), StreamError>(()),
                other => panic!("expected a disposed stream, got {other:?}"),
            }
        });
        finished.send(()).unwrap();
        result
    });

    let peer = thread::spawn(move || {
        let mut stream = TcpStream::connect(address).unwrap();
        stream.write_all(b"GET /hello HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();

        let expected = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        let mut response = vec![0; expected.len()];
        stream.read_exact(&mut response).unwrap();
        assert_eq!(response, expected);
        worker_finished.recv().unwrap();
    });

    event_loop.run().unwrap();
    peer.join().unwrap();
    worker.join().unwrap().unwrap();
    event_loop.dispose();
}

#[test]
fn writes_after_close_are_aborted() {
    let mut event_loop = EventLoop::new().unwrap();
    let pool = MemoryPool::new();
    let closed = Rc::new(RefCell::new(None));
    let (address, _requests) = serve_once(&mut event_loop, &pool, {
        let closed = Rc::clone(&closed);
        move |event_loop, connection| {
            connection.close(event_loop).unwrap();
            *closed.borrow_mut() = Some(connection.output().clone());
        }
    });

    let peer = thread::spawn(move || {
        let mut stream = TcpStream::connect(address).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
    });

    event_loop.run().unwrap();
    peer.join().unwrap();

    let output = closed.borrow_mut().take().unwrap();
    let stream = ResponseStream::new(output);
    let error = stream.write(b"too late").unwrap_err();
    assert!(matches!(error, StreamError::Aborted));
    assert_eq!(std::io::Error::from(error).kind(), std::io::ErrorKind::ConnectionAborted);
    assert_eq!(pool.stats().leased_blocks, 0);
    event_loop.dispose();
}

#[test]
fn exhausted_pool_closes_the_connection_not_the_loop() {
    let mut event_loop = EventLoop::new().unwrap();
    // room for 32 bytes, the request line below needs more before it completes
    let pool = MemoryPool::builder().block_size(16).blocks_per_slab(1).max_slabs(2).build().unwrap();
    let (address, requests) = serve_once(&mut event_loop, &pool, |_, _| {});

    let peer = thread::spawn(move || {
        let mut stream = TcpStream::connect(address).unwrap();
        stream.write_all(b"GET /aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa").unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).map(|_| rest).unwrap_or_default()
    });

    event_loop.run().unwrap();
    assert!(peer.join().unwrap().is_empty());
    assert!(requests.borrow().is_empty());
    assert_eq!(event_loop.handle_count(), 0);
    assert_eq!(pool.stats().leased_blocks, 0);
    event_loop.dispose();
}

#[test]
fn panicking_request_callback_closes_the_whole_connection() {
    let mut event_loop = EventLoop::new().unwrap();
    let pool = MemoryPool::new();
    let (address, requests) = serve_once(&mut event_loop, &pool, |_, _| panic!("request handler failed"));

    let peer = thread::spawn(move || {
        let mut stream = TcpStream::connect(address).unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).map(|_| rest).unwrap_or_default()
    });

    // returns only once the socket and its wake handle are both gone
    event_loop.run().unwrap();
    assert!(peer.join().unwrap().is_empty());
    assert_eq!(*requests.borrow(), vec![Ok((Method::GET, "/".to_owned()))]);
    assert_eq!(event_loop.handle_count(), 0);
    assert_eq!(pool.stats().leased_blocks, 0);
    event_loop.dispose();
}

#[test]
fn oversized_header_section_is_reported() {
    let mut event_loop = EventLoop::new().unwrap();
    let pool = MemoryPool::new();
    let (address, requests) = serve_once(&mut event_loop, &pool, |_, _| {});

    let peer = thread::spawn(move || {
        let mut stream = TcpStream::connect(address).unwrap();
        let mut request = b"GET / HTTP/1.1\r\nX-Filler: ".to_vec();
        request.resize(request.len() + MAX_HEADER_SIZE, b'a');
        let _ = stream.write_all(&request);
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).map(|_| rest).unwrap_or_default()
    });

    event_loop.run().unwrap();
    assert!(peer.join().unwrap().is_empty());

    let requests = requests.borrow();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0], Ok((Method::GET, "/".to_owned())));
    assert!(matches!(requests[1], Err(ParseError::TooLargeHeader { max_size: MAX_HEADER_SIZE, .. })));
    assert_eq!(pool.stats().leased_blocks, 0);
    event_loop.dispose();
}
