use std::collections::VecDeque;
use std::io;
use std::mem;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use tracing::{debug, trace, warn};

use crate::ensure;
use crate::memory::MemoryBlock;
use crate::networking::event_loop::Deferred;
use crate::networking::handle::{HandleEntry, HandleId, HandleKind, HandleState};
use crate::networking::write_req::QueuedWrite;
use crate::networking::{EventLoop, NetError, ServerAddress};

type ConnectionCallback = Box<dyn FnMut(&mut EventLoop, io::Result<TcpHandle>)>;
type AllocCallback = Box<dyn FnMut(&mut EventLoop, TcpHandle, usize) -> MemoryBlock>;
type ReadCallback = Box<dyn FnMut(&mut EventLoop, TcpHandle, io::Result<usize>, &MemoryBlock)>;
type CloseCallback = Box<dyn FnOnce(&mut EventLoop)>;

enum Socket {
    Idle,
    Bound(RawSocket),
    Listener(TcpListener),
    Stream(TcpStream),
    Closed,
}

struct ReadCallbacks {
    alloc: AllocCallback,
    on_read: ReadCallback,
}

pub(crate) struct TcpEntry {
    socket: Socket,
    on_connection: Option<ConnectionCallback>,
    listening: bool,
    reader: Option<ReadCallbacks>,
    reading: bool,
    writes: VecDeque<QueuedWrite>,
    on_close: Option<CloseCallback>,
}

impl TcpEntry {
    fn new(socket: Socket) -> Self {
        Self {
            socket,
            on_connection: None,
            listening: false,
            reader: None,
            reading: false,
            writes: VecDeque::new(),
            on_close: None,
        }
    }

    pub(crate) fn take_on_close(&mut self) -> Option<CloseCallback> {
        self.on_close.take()
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.listening || self.reading || !self.writes.is_empty()
    }

    /// Queues a write behind the ones already pending on this connection.
    pub(crate) fn queue_write(&mut self, write: QueuedWrite) -> Result<(), NetError> {
        ensure!(matches!(self.socket, Socket::Stream(_)), NetError::invalid_state("writes need a connected tcp handle"));
        self.writes.push_back(write);
        Ok(())
    }

    /// Drops the socket and callbacks, handing back the writes that never completed.
    pub(crate) fn shutdown(&mut self, registry: &Registry) -> Vec<QueuedWrite> {
        let deregistered = match &mut self.socket {
            Socket::Listener(listener) => registry.deregister(listener),
            Socket::Stream(stream) => registry.deregister(stream),
            Socket::Idle | Socket::Bound(_) | Socket::Closed => Ok(()),
        };
        if let Err(e) = deregistered {
            trace!(cause = %e, "deregister on close failed");
        }

        self.socket = Socket::Closed;
        self.on_connection = None;
        self.listening = false;
        self.reader = None;
        self.reading = false;
        self.writes.drain(..).collect()
    }
}

/// A tcp listener or connection owned by an [`EventLoop`].
///
/// Listening handles come from [`init`](Self::init) + [`bind`](Self::bind) +
/// [`listen`](Self::listen); connection handles are delivered to the listen callback.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TcpHandle {
    id: HandleId,
}

impl TcpHandle {
    pub fn init(event_loop: &mut EventLoop) -> TcpHandle {
        TcpHandle { id: event_loop.insert_handle(HandleKind::Tcp(TcpEntry::new(Socket::Idle))) }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Binds a fresh socket to `address`.
    pub fn bind(&self, event_loop: &mut EventLoop, address: &ServerAddress) -> Result<(), NetError> {
        let addr = address.resolve()?;
        event_loop.with_tcp(self.id, |tcp, _, _| {
            ensure!(matches!(tcp.socket, Socket::Idle), NetError::invalid_state("tcp handle is already bound"));

            let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
            #[cfg(unix)]
            socket.set_reuse_address(true)?;
            socket.set_nonblocking(true)?;
            socket
                .bind(&addr.into())
                .map_err(|e| NetError::io(io::Error::new(e.kind(), format!("can't bind {address} ({addr}): {e}"))))?;

            tcp.socket = Socket::Bound(socket);
            Ok(())
        })?;
        debug!(%address, %addr, handle = ?self.id, "tcp handle bound");
        Ok(())
    }

    pub fn local_addr(&self, event_loop: &EventLoop) -> Result<SocketAddr, NetError> {
        match &event_loop.tcp_entry(self.id)?.socket {
            Socket::Bound(socket) => {
                socket.local_addr()?.as_socket().ok_or_else(|| NetError::invalid_state("socket has no inet address"))
            }
            Socket::Listener(listener) => Ok(listener.local_addr()?),
            Socket::Stream(stream) => Ok(stream.local_addr()?),
            Socket::Idle | Socket::Closed => Err(NetError::invalid_state("tcp handle is not bound")),
        }
    }

    pub fn peer_addr(&self, event_loop: &EventLoop) -> Result<SocketAddr, NetError> {
        match &event_loop.tcp_entry(self.id)?.socket {
            Socket::Stream(stream) => Ok(stream.peer_addr()?),
            _ => Err(NetError::invalid_state("tcp handle is not a connection")),
        }
    }

    /// Starts accepting connections on a bound handle.
    ///
    /// `on_connection` runs on the loop thread for every accepted connection. An `Err` reports
    /// a failed accept and carries no connection.
    pub fn listen(
        &self,
        event_loop: &mut EventLoop,
        backlog: i32,
        on_connection: impl FnMut(&mut EventLoop, io::Result<TcpHandle>) + 'static,
    ) -> Result<(), NetError> {
        let token = self.id.token();
        event_loop.with_tcp(self.id, |tcp, state, registry| {
            let socket = match mem::replace(&mut tcp.socket, Socket::Closed) {
                Socket::Bound(socket) => socket,
                other => {
                    tcp.socket = other;
                    return Err(NetError::invalid_state("listen needs a bound tcp handle"));
                }
            };
            if let Err(e) = socket.listen(backlog) {
                tcp.socket = Socket::Bound(socket);
                return Err(NetError::io(e));
            }

            let mut listener = TcpListener::from_std(std::net::TcpListener::from(socket));
            let registered = registry.register(&mut listener, token, Interest::READABLE);
            tcp.socket = Socket::Listener(listener);
            registered?;

            tcp.on_connection = Some(Box::new(on_connection));
            tcp.listening = true;
            *state = HandleState::Active;
            Ok(())
        })?;
        debug!(handle = ?self.id, backlog, "tcp handle listening");
        Ok(())
    }

    /// Starts delivering received bytes.
    ///
    /// Before every read `alloc` is asked for a block with free space; the size argument is a
    /// suggestion. `on_read` then gets the number of bytes appended to that block. `Ok(0)`
    /// is end of stream; after it, or after an `Err`, no further reads are delivered and the
    /// callback is expected to close the handle.
    ///
    /// `alloc` runs on the loop thread and must not wait for memory. When it has none to
    /// offer it returns a full block, such as `MemoryBlock::from_slice(&[])`, and the read
    /// fails with [`io::ErrorKind::OutOfMemory`].
    pub fn read_start(
        &self,
        event_loop: &mut EventLoop,
        alloc: impl FnMut(&mut EventLoop, TcpHandle, usize) -> MemoryBlock + 'static,
        on_read: impl FnMut(&mut EventLoop, TcpHandle, io::Result<usize>, &MemoryBlock) + 'static,
    ) -> Result<(), NetError> {
        event_loop.with_tcp(self.id, |tcp, state, _| {
            ensure!(matches!(tcp.socket, Socket::Stream(_)), NetError::invalid_state("reads need a connected tcp handle"));
            ensure!(!tcp.reading, NetError::invalid_state("tcp handle is already reading"));
            tcp.reader = Some(ReadCallbacks { alloc: Box::new(alloc), on_read: Box::new(on_read) });
            tcp.reading = true;
            *state = HandleState::Active;
            Ok(())
        })?;
        // data may have arrived before reading started
        event_loop.deferred.push_back(Deferred::Read(self.id));
        Ok(())
    }

    pub fn read_stop(&self, event_loop: &mut EventLoop) -> Result<(), NetError> {
        event_loop.with_tcp(self.id, |tcp, _, _| {
            tcp.reader = None;
            tcp.reading = false;
            Ok(())
        })
    }

    /// Registers `on_close` to run once when this handle is closed.
    ///
    /// The hook runs whoever closes the handle, the loop itself included when a callback of
    /// this handle panics or the loop is disposed. A later registration replaces the earlier
    /// one.
    pub fn on_close(&self, event_loop: &mut EventLoop, on_close: impl FnOnce(&mut EventLoop) + 'static) -> Result<(), NetError> {
        event_loop.with_tcp(self.id, |tcp, _, _| {
            tcp.on_close = Some(Box::new(on_close));
            Ok(())
        })
    }

    /// Closes the socket. Queued writes complete with [`NetError::Aborted`].
    pub fn close(&self, event_loop: &mut EventLoop) -> Result<(), NetError> {
        event_loop.close_handle(self.id)
    }
}

impl EventLoop {
    fn tcp_entry(&self, id: HandleId) -> Result<&TcpEntry, NetError> {
        match self.handles.get(id) {
            Some(HandleEntry { state: HandleState::Closing, .. }) | None => Err(NetError::Disposed),
            Some(HandleEntry { kind: HandleKind::Tcp(tcp), .. }) => Ok(tcp),
            Some(_) => Err(NetError::invalid_state("not a tcp handle")),
        }
    }

    /// Runs `f` on a live tcp entry together with its state and the reactor registry.
    pub(crate) fn with_tcp<R>(
        &mut self,
        id: HandleId,
        f: impl FnOnce(&mut TcpEntry, &mut HandleState, &Registry) -> Result<R, NetError>,
    ) -> Result<R, NetError> {
        let entry = self.handles.get_mut(id).ok_or(NetError::Disposed)?;
        ensure!(entry.state != HandleState::Closing, NetError::Disposed);
        let HandleKind::Tcp(tcp) = &mut entry.kind else {
            return Err(NetError::invalid_state("not a tcp handle"));
        };
        f(tcp, &mut entry.state, self.poll.registry())
    }

    pub(crate) fn on_readable(&mut self, id: HandleId) {
        let listener = matches!(
            self.handles.get(id),
            Some(HandleEntry { kind: HandleKind::Tcp(TcpEntry { socket: Socket::Listener(_), .. }), .. })
        );
        if listener {
            self.accept_ready(id);
        } else {
            self.read_ready(id);
        }
    }

    fn accept_ready(&mut self, id: HandleId) {
        loop {
            let accepted = match self.handles.get_mut(id) {
                Some(HandleEntry {
                    state: HandleState::Active,
                    kind: HandleKind::Tcp(TcpEntry { socket: Socket::Listener(listener), listening: true, .. }),
                }) => listener.accept(),
                _ => return,
            };

            let result = match accepted {
                Ok((stream, peer)) => self.adopt_stream(stream).inspect(|handle| {
                    debug!(listener = ?id, handle = ?handle.id, %peer, "connection accepted");
                }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!(listener = ?id, cause = %e, "failed to accept connection");
            }
            let failed = result.is_err();
            self.fire_connection(id, result);
            if failed {
                return;
            }
        }
    }

    fn adopt_stream(&mut self, mut stream: TcpStream) -> io::Result<TcpHandle> {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(cause = %e, "can't disable nagle on accepted connection");
        }
        let id = self.insert_handle(HandleKind::Tcp(TcpEntry::new(Socket::Idle)));
        if let Err(e) = self.poll.registry().register(&mut stream, id.token(), Interest::READABLE | Interest::WRITABLE) {
            self.handles.remove(id);
            return Err(e);
        }
        if let Some(HandleEntry { kind: HandleKind::Tcp(tcp), .. }) = self.handles.get_mut(id) {
            tcp.socket = Socket::Stream(stream);
        }
        Ok(TcpHandle { id })
    }

    fn fire_connection(&mut self, id: HandleId, result: io::Result<TcpHandle>) {
        let callback = match self.handles.get_mut(id) {
            Some(HandleEntry { state: HandleState::Active, kind: HandleKind::Tcp(tcp) }) => tcp.on_connection.take(),
            _ => None,
        };
        let Some(mut callback) = callback else {
            if let Ok(orphan) = result {
                let _ = self.close_handle(orphan.id);
            }
            return;
        };

        self.guarded(id, |event_loop| callback(event_loop, result));

        if let Some(HandleEntry { state: HandleState::Active, kind: HandleKind::Tcp(tcp) }) = self.handles.get_mut(id)
            && tcp.listening
            && tcp.on_connection.is_none()
        {
            tcp.on_connection = Some(callback);
        }
    }

    /// Reads until the socket would block, reading is stopped or the stream ends.
    pub(crate) fn read_ready(&mut self, id: HandleId) {
        let handle = TcpHandle { id };
        let suggested = self.options.read_buffer_size;
        loop {
            let Some(mut reader) = self.take_reader(id) else {
                return;
            };
            let Some(block) = self.guarded(id, |event_loop| (reader.alloc)(event_loop, handle, suggested)) else {
                return;
            };

            let result = match self.handles.get_mut(id) {
                Some(HandleEntry {
                    state: HandleState::Active,
                    kind: HandleKind::Tcp(TcpEntry { socket: Socket::Stream(stream), reading: true, .. }),
                }) => {
                    if block.available() == 0 {
                        Err(io::Error::new(io::ErrorKind::OutOfMemory, "no free space to read into"))
                    } else {
                        block.read_from(stream)
                    }
                }
                _ => return,
            };

            match &result {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.restore_reader(id, reader);
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.restore_reader(id, reader);
                    continue;
                }
                _ => {}
            }

            let finished = !matches!(result, Ok(read) if read > 0);
            match &result {
                Ok(0) => trace!(handle = ?id, "end of stream"),
                Ok(read) => trace!(handle = ?id, read, "bytes received"),
                Err(e) => debug!(handle = ?id, cause = %e, "read failed"),
            }
            self.guarded(id, |event_loop| (reader.on_read)(event_loop, handle, result, &block));

            if finished {
                if let Some(HandleEntry { kind: HandleKind::Tcp(tcp), .. }) = self.handles.get_mut(id)
                    && tcp.reader.is_none()
                {
                    tcp.reading = false;
                }
                return;
            }
            self.restore_reader(id, reader);
        }
    }

    fn take_reader(&mut self, id: HandleId) -> Option<ReadCallbacks> {
        match self.handles.get_mut(id) {
            Some(HandleEntry { state: HandleState::Active, kind: HandleKind::Tcp(tcp) }) if tcp.reading => tcp.reader.take(),
            _ => None,
        }
    }

    fn restore_reader(&mut self, id: HandleId, reader: ReadCallbacks) {
        if let Some(HandleEntry { state: HandleState::Active, kind: HandleKind::Tcp(tcp) }) = self.handles.get_mut(id)
            && tcp.reading
            && tcp.reader.is_none()
        {
            tcp.reader = Some(reader);
        }
    }

    /// Writes queued requests in order until the socket would block.
    pub(crate) fn flush_writes(&mut self, id: HandleId) {
        loop {
            let outcome = match self.handles.get_mut(id) {
                Some(HandleEntry { state: HandleState::Active | HandleState::Initialized, kind: HandleKind::Tcp(tcp) }) => {
                    let Socket::Stream(stream) = &mut tcp.socket else {
                        return;
                    };
                    let Some(front) = tcp.writes.front_mut() else {
                        return;
                    };
                    front.write_to(stream)
                }
                _ => return,
            };

            let result = match outcome {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(handle = ?id, cause = %e, "write failed");
                    Err(NetError::io(e))
                }
            };

            let finished = match self.handles.get_mut(id) {
                Some(HandleEntry { kind: HandleKind::Tcp(tcp), .. }) => tcp.writes.pop_front(),
                None => None,
                Some(_) => return,
            };
            if let Some(write) = finished {
                self.deferred.push_back(Deferred::Completion(write.finish(result)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn loopback() -> ServerAddress {
        ServerAddress::from_url("http://127.0.0.1:0").unwrap()
    }

    #[test]
    fn bind_then_listen_reports_local_addr() {
        let mut event_loop = EventLoop::new().unwrap();
        let tcp = TcpHandle::init(&mut event_loop);
        assert_eq!(event_loop.handle_state(tcp.id()), HandleState::Initialized);

        tcp.bind(&mut event_loop, &loopback()).unwrap();
        let bound = tcp.local_addr(&event_loop).unwrap();
        assert!(bound.ip().is_loopback());
        assert_ne!(bound.port(), 0);

        tcp.listen(&mut event_loop, 16, |_, _| {}).unwrap();
        assert_eq!(event_loop.handle_state(tcp.id()), HandleState::Active);
        assert_eq!(tcp.local_addr(&event_loop).unwrap(), bound);

        tcp.close(&mut event_loop).unwrap();
        event_loop.run().unwrap();
        assert_eq!(event_loop.handle_state(tcp.id()), HandleState::Disposed);
    }

    #[test]
    fn operations_out_of_order_are_rejected() {
        let mut event_loop = EventLoop::new().unwrap();
        let tcp = TcpHandle::init(&mut event_loop);

        assert!(matches!(tcp.listen(&mut event_loop, 16, |_, _| {}), Err(NetError::InvalidState { .. })));
        assert!(matches!(tcp.local_addr(&event_loop), Err(NetError::InvalidState { .. })));
        assert!(matches!(
            tcp.read_start(&mut event_loop, |_, _, _| MemoryBlock::from_slice(b""), |_, _, _, _| {}),
            Err(NetError::InvalidState { .. })
        ));

        tcp.bind(&mut event_loop, &loopback()).unwrap();
        assert!(matches!(tcp.bind(&mut event_loop, &loopback()), Err(NetError::InvalidState { .. })));
        event_loop.dispose();
    }

    #[test]
    fn closing_handle_fails_fast() {
        let mut event_loop = EventLoop::new().unwrap();
        let tcp = TcpHandle::init(&mut event_loop);
        tcp.close(&mut event_loop).unwrap();
        assert_eq!(event_loop.handle_state(tcp.id()), HandleState::Closing);

        assert!(matches!(tcp.bind(&mut event_loop, &loopback()), Err(NetError::Disposed)));
        assert!(matches!(tcp.close(&mut event_loop), Err(NetError::Disposed)));

        event_loop.run().unwrap();
        assert!(matches!(tcp.read_stop(&mut event_loop), Err(NetError::Disposed)));
        assert_eq!(event_loop.handle_count(), 0);
    }

    #[test]
    fn close_hook_runs_once() {
        let mut event_loop = EventLoop::new().unwrap();
        let tcp = TcpHandle::init(&mut event_loop);
        let calls = Rc::new(Cell::new(0));
        tcp.on_close(&mut event_loop, {
            let calls = Rc::clone(&calls);
            move |_| calls.set(calls.get() + 1)
        })
        .unwrap();

        tcp.close(&mut event_loop).unwrap();
        assert_eq!(calls.get(), 1);
        assert!(matches!(tcp.on_close(&mut event_loop, |_| {}), Err(NetError::Disposed)));

        event_loop.run().unwrap();
        assert_eq!(calls.get(), 1);
        assert_eq!(event_loop.handle_count(), 0);
    }

    #[test]
    fn dispose_runs_close_hooks() {
        let mut event_loop = EventLoop::new().unwrap();
        let tcp = TcpHandle::init(&mut event_loop);
        let closed = Rc::new(Cell::new(false));
        tcp.on_close(&mut event_loop, {
            let closed = Rc::clone(&closed);
            move |_| closed.set(true)
        })
        .unwrap();

        event_loop.dispose();
        assert!(closed.get());
    }

    #[test]
    fn bind_failure_names_the_address() {
        let mut event_loop = EventLoop::new().unwrap();
        let first = TcpHandle::init(&mut event_loop);
        first.bind(&mut event_loop, &loopback()).unwrap();
        first.listen(&mut event_loop, 16, |_, _| {}).unwrap();
        let port = first.local_addr(&event_loop).unwrap().port();

        let taken = ServerAddress::from_url(&format!("http://127.0.0.1:{port}")).unwrap();
        let second = TcpHandle::init(&mut event_loop);
        let error = second.bind(&mut event_loop, &taken).and_then(|()| second.listen(&mut event_loop, 16, |_, _| {}));
        match error {
            Err(NetError::Io { source }) => assert!(source.to_string().contains(&port.to_string()) || source.kind() == io::ErrorKind::AddrInUse),
            other => panic!("expected an io error, got {other:?}"),
        }
        event_loop.dispose();
    }
}
