//! Connection adapter between loop sockets and HTTP parsing.
//!
//! # Components
//!
//! - [`Connection`]: reads an accepted [`TcpHandle`] into pooled blocks and reports every
//!   request line found in the stream
//! - [`parse_request_line`]: recognizes `METHOD SP target SP version CRLF` over a block chain
//! - [`SocketOutput`]: a [`FrameControl`] that copies response bytes into pool blocks and
//!   submits them on the loop thread
//! - [`ResponseStream`]: the write-only stream application code writes a response body to
//!
//! Header collection is left to the layers above. The adapter skips the header section of
//! every request and expects requests without a body, so a pipelined request line right after
//! the blank line is found as well. A header section longer than [`MAX_HEADER_SIZE`] is
//! reported as [`ParseError::TooLargeHeader`].
//!
//! Reads never wait for the pool. When it is exhausted the read fails and the connection is
//! closed.

mod error;
mod input;
mod output;
mod request_line;
mod response_stream;

pub use error::{ParseError, StreamError};
pub use input::SocketInput;
pub use output::SocketOutput;
pub use request_line::{MAX_REQUEST_LINE_SIZE, RequestLine, parse_request_line};
pub use response_stream::{FrameControl, ResponseStream};

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::ensure;
use crate::memory::{MemoryBlock, MemoryPool};
use crate::networking::{AsyncHandle, EventLoop, HandleState, NetError, TcpHandle};
use output::OutputQueue;

/// Size limit of the header section following a request line, blank line included
pub const MAX_HEADER_SIZE: usize = 8 * 1024;

/// Receives every request line of a connection, or the parse error that ended it.
pub type RequestCallback = dyn FnMut(&mut EventLoop, &Connection, Result<RequestLine, ParseError>);

/// An accepted socket wired to a receive buffer and a response output.
#[derive(Debug, Clone)]
pub struct Connection {
    tcp: TcpHandle,
    output: SocketOutput,
}

struct ReadState {
    input: SocketInput,
    in_head: bool,
    head_size: usize,
}

impl Connection {
    /// Starts reading `tcp`.
    ///
    /// `on_request` runs on the loop thread for each request line, in arrival order. A
    /// malformed line or an oversized header section is reported as an `Err` and closes the
    /// connection, as does the end of the stream, a read error or a panic in `on_request`.
    pub fn start(
        event_loop: &mut EventLoop,
        tcp: TcpHandle,
        pool: MemoryPool,
        on_request: impl FnMut(&mut EventLoop, &Connection, Result<RequestLine, ParseError>) + 'static,
    ) -> Result<Connection, NetError> {
        let queue = OutputQueue::default();
        let wake = AsyncHandle::init(event_loop, {
            let queue = queue.clone();
            move |event_loop, _| queue.drain(event_loop, &tcp)
        });
        let output = SocketOutput::new(pool.clone(), queue.clone(), wake.sender());
        let connection = Connection { tcp, output };

        // whoever closes the socket, the loop included, takes the wake handle down with it
        let hooked_wake = wake.clone();
        if let Err(e) = tcp.on_close(event_loop, move |event_loop| {
            let _ = hooked_wake.close(event_loop);
            queue.clear();
        }) {
            let _ = wake.close(event_loop);
            return Err(e);
        }

        let state = Rc::new(RefCell::new(ReadState::new(pool)));
        let alloc_state = Rc::clone(&state);
        let reader = connection.clone();
        let mut on_request = on_request;
        let started = tcp.read_start(
            event_loop,
            move |_, tcp, _| {
                alloc_state.borrow_mut().input.alloc().unwrap_or_else(|| {
                    warn!(handle = ?tcp.id(), "memory pool exhausted, failing the read");
                    MemoryBlock::from_slice(&[])
                })
            },
            move |event_loop, _, read, _| reader.on_read(event_loop, &state, read, &mut on_request),
        );

        if let Err(e) = started {
            let _ = connection.close(event_loop);
            return Err(e);
        }
        trace!(handle = ?tcp.id(), "connection started");
        Ok(connection)
    }

    pub fn tcp(&self) -> TcpHandle {
        self.tcp
    }

    /// Where response bytes for this connection are written to.
    pub fn output(&self) -> &SocketOutput {
        &self.output
    }

    /// Closes the socket and the wake handle.
    ///
    /// Writes already submitted complete with [`NetError::Aborted`]; writes still waiting in
    /// the output queue are dropped, their waiters see [`StreamError::Aborted`].
    pub fn close(&self, event_loop: &mut EventLoop) -> Result<(), NetError> {
        self.tcp.close(event_loop)
    }

    fn is_open(&self, event_loop: &EventLoop) -> bool {
        event_loop.handle_state(self.tcp.id()) == HandleState::Active
    }

    fn on_read(
        &self,
        event_loop: &mut EventLoop,
        state: &RefCell<ReadState>,
        read: io::Result<usize>,
        on_request: &mut RequestCallback,
    ) {
        match read {
            Ok(0) => {
                debug!(handle = ?self.tcp.id(), "connection closed by peer");
                self.shutdown(event_loop, state);
                return;
            }
            Err(e) => {
                debug!(handle = ?self.tcp.id(), cause = %e, "connection read failed");
                self.shutdown(event_loop, state);
                return;
            }
            Ok(_) => {}
        }

        while self.is_open(event_loop) {
            let parsed = {
                let mut state = state.borrow_mut();
                match state.skip_head() {
                    Ok(true) => state.next_line(),
                    Ok(false) => return,
                    Err(e) => Err(e),
                }
            };

            match parsed {
                Ok(Some(line)) => on_request(event_loop, self, Ok(line)),
                Ok(None) => return,
                Err(e) => {
                    warn!(handle = ?self.tcp.id(), cause = %e, "malformed request head, closing connection");
                    on_request(event_loop, self, Err(e));
                    self.shutdown(event_loop, state);
                    return;
                }
            }
        }
    }

    fn shutdown(&self, event_loop: &mut EventLoop, state: &RefCell<ReadState>) {
        let _ = self.close(event_loop);
        state.borrow_mut().input.release();
    }
}

impl ReadState {
    fn new(pool: MemoryPool) -> Self {
        Self { input: SocketInput::new(pool), in_head: false, head_size: 0 }
    }

    /// Parses the next request line and, once found, enters its header section.
    fn next_line(&mut self) -> Result<Option<RequestLine>, ParseError> {
        let mut cursor = self.input.start();
        let parsed = parse_request_line(&mut cursor);
        if let Ok(Some(_)) = parsed {
            self.input.consume(cursor);
            self.in_head = true;
            self.head_size = 0;
        }
        parsed
    }

    /// Consumes complete header lines up to and including the blank line.
    ///
    /// Returns `Ok(false)` while the blank line has not arrived yet, `Ok(true)` once no header
    /// section is pending.
    fn skip_head(&mut self) -> Result<bool, ParseError> {
        if !self.in_head {
            return Ok(true);
        }
        let mut cursor = self.input.start();
        if cursor.is_default() {
            return Ok(false);
        }
        loop {
            let mut line_end = cursor.clone();
            if line_end.seek(b'\n').is_none() {
                self.input.consume(cursor);
                let current_size = self.head_size + self.input.buffered();
                ensure!(current_size <= MAX_HEADER_SIZE, ParseError::too_large_header(current_size, MAX_HEADER_SIZE));
                return Ok(false);
            }
            let line_size = cursor.get_length(&line_end);
            let blank = line_size == 0 || (line_size == 1 && cursor.peek() == Some(b'\r'));
            self.head_size += line_size + 1;
            ensure!(self.head_size <= MAX_HEADER_SIZE, ParseError::too_large_header(self.head_size, MAX_HEADER_SIZE));

            line_end.skip(1);
            cursor = line_end;
            if blank {
                self.input.consume(cursor);
                self.in_head = false;
                return Ok(true);
            }
        }
    }
}
