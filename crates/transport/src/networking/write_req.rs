use std::io;

use tracing::debug;

use crate::ensure;
use crate::memory::{Cursor, MemoryBlock};
use crate::networking::event_loop::Deferred;
use crate::networking::handle::{HandleId, HandleState};
use crate::networking::{EventLoop, NetError, TcpHandle};

type WriteCallback = Box<dyn FnOnce(&mut EventLoop, Result<(), NetError>)>;

/// The bytes between two cursors, on their way to a socket.
///
/// Creating the request pins every block of the range, so the data stays valid while the
/// write is queued. The blocks are unpinned after the completion callback has run, whether
/// the write succeeded or not.
#[derive(Debug)]
pub struct WriteRequest {
    start: Cursor,
    end: Cursor,
    blocks: Vec<MemoryBlock>,
    len: usize,
}

impl WriteRequest {
    pub fn new(start: &Cursor, end: &Cursor) -> Result<Self, NetError> {
        let (Some(first), Some(last)) = (start.block(), end.block()) else {
            return Err(NetError::invalid_state("a write range needs two positioned cursors"));
        };

        let mut request = Self { start: start.clone(), end: end.clone(), blocks: Vec::new(), len: 0 };
        let mut block = first.clone();
        loop {
            ensure!(block.pin(), NetError::invalid_state("write range contains a released block"));
            request.blocks.push(block.clone());
            if block.ptr_eq(last) {
                break;
            }
            block = block.next().ok_or_else(|| NetError::invalid_state("end cursor does not follow the start cursor"))?;
        }

        request.len = start.get_length(end);
        Ok(request)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Queues the request on `tcp`.
    ///
    /// `callback` runs exactly once on the loop thread, after every write submitted earlier on
    /// the same connection has completed. If the handle is closed first it gets
    /// [`NetError::Aborted`]. When `submit` itself fails the request is dropped and the
    /// callback never runs.
    pub fn submit(
        self,
        event_loop: &mut EventLoop,
        tcp: &TcpHandle,
        callback: impl FnOnce(&mut EventLoop, Result<(), NetError>) + 'static,
    ) -> Result<(), NetError> {
        let id = tcp.id();
        let write = QueuedWrite::new(id, self, Box::new(callback));
        event_loop.with_tcp(id, |entry, state, _| {
            entry.queue_write(write)?;
            *state = HandleState::Active;
            Ok(())
        })?;
        event_loop.deferred.push_back(Deferred::Flush(id));
        Ok(())
    }
}

impl Drop for WriteRequest {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            block.unpin();
        }
    }
}

pub(crate) struct QueuedWrite {
    owner: HandleId,
    position: Cursor,
    remaining: usize,
    request: WriteRequest,
    callback: WriteCallback,
}

impl QueuedWrite {
    fn new(owner: HandleId, request: WriteRequest, callback: WriteCallback) -> Self {
        Self { owner, position: request.start.clone(), remaining: request.len, request, callback }
    }

    /// Writes the rest of the range, `Ok` once every byte was accepted by `writer`.
    ///
    /// Progress is kept across calls, so a `WouldBlock` resumes where it stopped.
    pub(crate) fn write_to<W: io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        while self.remaining > 0 {
            let Some(block) = self.position.block().cloned() else {
                return Ok(());
            };

            let written = {
                let storage = block.storage();
                let limit = if self.request.end.same_block(&self.position) { self.request.end.index() } else { storage.len() };
                let chunk = storage.get(self.position.index()..limit).unwrap_or_default();
                let chunk = &chunk[..chunk.len().min(self.remaining)];
                if chunk.is_empty() { None } else { Some(writer.write(chunk)?) }
            };

            match written {
                None => match block.next() {
                    Some(next) => self.position = Cursor::at_start(&next),
                    None => self.remaining = 0,
                },
                Some(0) => return Err(io::ErrorKind::WriteZero.into()),
                Some(count) => {
                    self.position.skip(count);
                    self.remaining -= count;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn finish(self, result: Result<(), NetError>) -> WriteCompletion {
        WriteCompletion { owner: self.owner, request: self.request, callback: self.callback, result }
    }

    pub(crate) fn abort(self) -> WriteCompletion {
        self.finish(Err(NetError::Aborted))
    }
}

pub(crate) struct WriteCompletion {
    owner: HandleId,
    request: WriteRequest,
    callback: WriteCallback,
    result: Result<(), NetError>,
}

impl WriteCompletion {
    pub(crate) fn complete(self, event_loop: &mut EventLoop) {
        let Self { owner, request, callback, result } = self;
        if let Err(e) = &result {
            debug!(handle = ?owner, bytes = request.len(), cause = %e, "write completed with error");
        }
        event_loop.guarded(owner, move |event_loop| callback(event_loop, result));
        drop(request);
    }
}
