use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};

use async_trait::async_trait;
use futures::channel::oneshot;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::{FrameControl, StreamError};
use crate::memory::{Cursor, MemoryBlock, MemoryPool};
use crate::networking::{AsyncSender, EventLoop, TcpHandle, WriteRequest};

type Completion = oneshot::Sender<Result<(), StreamError>>;

/// Payload copied into leased blocks, waiting for the loop thread to submit it.
struct Outgoing {
    start: Cursor,
    end: Cursor,
    blocks: Vec<MemoryBlock>,
    done: Option<Completion>,
}

impl Drop for Outgoing {
    fn drop(&mut self) {
        for block in self.blocks.drain(..) {
            block.unpin();
        }
    }
}

/// Writes handed over from other threads, drained on the loop thread.
#[derive(Clone, Default)]
pub(crate) struct OutputQueue {
    pending: Arc<Mutex<VecDeque<Outgoing>>>,
}

impl OutputQueue {
    /// Submits everything queued so far on `tcp`, in queue order.
    pub(crate) fn drain(&self, event_loop: &mut EventLoop, tcp: &TcpHandle) {
        let pending: Vec<Outgoing> = self.pending.lock().drain(..).collect();
        for mut outgoing in pending {
            let done = outgoing.done.take();
            let submitted = WriteRequest::new(&outgoing.start, &outgoing.end).and_then(|request| {
                trace!(handle = ?tcp.id(), len = request.len(), "submitting response bytes");
                request.submit(event_loop, tcp, move |_, result| {
                    if let Some(done) = done {
                        let _ = done.send(result.map_err(StreamError::from));
                    }
                })
            });
            // the request holds its own pins from here on
            drop(outgoing);

            if let Err(e) = submitted {
                debug!(handle = ?tcp.id(), cause = %e, "response write could not be submitted");
            }
        }
    }

    /// Drops every queued write, their waiters see [`StreamError::Aborted`].
    pub(crate) fn clear(&self) {
        let dropped: Vec<Outgoing> = self.pending.lock().drain(..).collect();
        if !dropped.is_empty() {
            debug!(writes = dropped.len(), "dropping queued response writes");
        }
    }

    fn push(&self, outgoing: Outgoing) {
        self.pending.lock().push_back(outgoing);
    }

    fn len(&self) -> usize {
        self.pending.lock().len()
    }
}

impl fmt::Debug for OutputQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputQueue").field("pending", &self.len()).finish()
    }
}

/// The [`FrameControl`] of a loop connection.
///
/// Every write is copied into blocks leased from the pool and queued; the connection's
/// async handle then submits it on the loop thread. Writes reach the socket in the order
/// they were made.
///
/// While the pool is exhausted a write from another thread waits for blocks to come back.
/// A write made on the loop thread never waits: it fails with
/// [`StreamError::PoolExhausted`] and nothing of it is queued.
#[derive(Clone)]
pub struct SocketOutput {
    pool: MemoryPool,
    queue: OutputQueue,
    sender: AsyncSender,
    loop_thread: ThreadId,
}

impl SocketOutput {
    /// Must be called on the thread running the loop `sender` belongs to.
    pub(crate) fn new(pool: MemoryPool, queue: OutputQueue, sender: AsyncSender) -> Self {
        Self { pool, queue, sender, loop_thread: thread::current().id() }
    }

    fn lease(&self) -> Result<MemoryBlock, StreamError> {
        if thread::current().id() == self.loop_thread {
            self.pool.try_lease().ok_or(StreamError::PoolExhausted)
        } else {
            Ok(self.pool.lease())
        }
    }

    fn enqueue(&self, data: &[u8], done: Option<Completion>) -> Result<(), StreamError> {
        let first = self.lease()?;
        let mut rest = &data[first.append(data)..];
        let mut blocks = vec![first];
        while !rest.is_empty() {
            let block = match self.lease() {
                Ok(block) => block,
                Err(e) => {
                    debug!(len = data.len(), "memory pool exhausted, response bytes not queued");
                    blocks.iter().for_each(MemoryBlock::unpin);
                    return Err(e);
                }
            };
            rest = &rest[block.append(rest)..];
            if let Some(last) = blocks.last() {
                last.set_next(block.clone());
            }
            blocks.push(block);
        }

        let start = blocks.first().map(Cursor::at_start).unwrap_or_default();
        let end = blocks.last().map(Cursor::at_end).unwrap_or_default();
        self.queue.push(Outgoing { start, end, blocks, done });

        if let Err(e) = self.sender.send() {
            debug!(cause = %e, "connection is gone, dropping response bytes");
            self.queue.clear();
            return Err(e.into());
        }
        Ok(())
    }

    async fn wait(&self, done: oneshot::Receiver<Result<(), StreamError>>, cancel: CancellationToken) -> Result<(), StreamError> {
        tokio::select! {
            result = done => result.unwrap_or(Err(StreamError::Aborted)),
            () = cancel.cancelled() => Err(StreamError::Cancelled),
        }
    }
}

#[async_trait]
impl FrameControl for SocketOutput {
    fn write(&self, data: &[u8]) -> Result<(), StreamError> {
        self.enqueue(data, None)
    }

    /// Queued bytes are already on their way, this only nudges the loop.
    fn flush(&self) -> Result<(), StreamError> {
        Ok(self.sender.send()?)
    }

    async fn write_async(&self, data: &[u8], cancel: CancellationToken) -> Result<(), StreamError> {
        let (done, completed) = oneshot::channel();
        self.enqueue(data, Some(done))?;
        self.wait(completed, cancel).await
    }

    /// Completes once every write queued before it reached the socket.
    async fn flush_async(&self, cancel: CancellationToken) -> Result<(), StreamError> {
        let (done, completed) = oneshot::channel();
        self.enqueue(&[], Some(done))?;
        self.wait(completed, cancel).await
    }
}

impl fmt::Debug for SocketOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketOutput").field("queue", &self.queue).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::AsyncHandle;
    use std::time::Duration;

    fn output(event_loop: &mut EventLoop, pool: &MemoryPool) -> (SocketOutput, AsyncHandle) {
        let queue = OutputQueue::default();
        let wake = AsyncHandle::init(event_loop, |_, _| {});
        (SocketOutput::new(pool.clone(), queue, wake.sender()), wake)
    }

    #[test]
    fn writes_are_copied_into_chained_blocks() {
        let pool = MemoryPool::builder().block_size(4).blocks_per_slab(8).build().unwrap();
        let mut event_loop = EventLoop::new().unwrap();
        let (output, _wake) = output(&mut event_loop, &pool);

        output.write(b"hello world").unwrap();
        assert_eq!(output.queue.len(), 1);
        assert_eq!(pool.stats().leased_blocks, 3);

        {
            let pending = output.queue.pending.lock();
            let queued = &pending[0];
            assert_eq!(queued.start.get_length(&queued.end), 11);
        }

        output.queue.clear();
        assert_eq!(pool.stats().leased_blocks, 0);
        event_loop.dispose();
    }

    #[test]
    fn closed_connection_aborts_writes() {
        let pool = MemoryPool::builder().block_size(16).blocks_per_slab(2).build().unwrap();
        let mut event_loop = EventLoop::new().unwrap();
        let (output, wake) = output(&mut event_loop, &pool);
        wake.close(&mut event_loop).unwrap();

        assert!(matches!(output.write(b"late"), Err(StreamError::Aborted)));
        assert!(matches!(output.flush(), Err(StreamError::Aborted)));
        assert_eq!(output.queue.len(), 0);
        assert_eq!(pool.stats().leased_blocks, 0);
        event_loop.dispose();
    }

    #[test]
    fn failed_submit_reports_aborted() {
        let pool = MemoryPool::builder().block_size(16).blocks_per_slab(2).build().unwrap();
        let mut event_loop = EventLoop::new().unwrap();
        let (output, _wake) = output(&mut event_loop, &pool);
        // never connected, so the write cannot be queued on it
        let tcp = TcpHandle::init(&mut event_loop);

        let (done, mut completed) = oneshot::channel();
        output.enqueue(b"payload", Some(done)).unwrap();
        output.queue.drain(&mut event_loop, &tcp);

        assert!(matches!(completed.try_recv(), Err(oneshot::Canceled)));
        assert_eq!(pool.stats().leased_blocks, 0);
        event_loop.dispose();
    }

    #[test]
    fn exhausted_pool_fails_writes_on_the_loop_thread() {
        let pool = MemoryPool::builder().block_size(4).blocks_per_slab(1).max_slabs(2).build().unwrap();
        let mut event_loop = EventLoop::new().unwrap();
        let (output, _wake) = output(&mut event_loop, &pool);

        assert!(matches!(output.write(b"too long for two blocks"), Err(StreamError::PoolExhausted)));
        assert_eq!(output.queue.len(), 0);
        assert_eq!(pool.stats().leased_blocks, 0);

        output.write(b"fits").unwrap();
        assert_eq!(output.queue.len(), 1);
        output.queue.clear();
        event_loop.dispose();
    }

    #[test]
    fn other_threads_wait_for_returned_blocks() {
        let pool = MemoryPool::builder().block_size(4).blocks_per_slab(1).max_slabs(1).build().unwrap();
        let mut event_loop = EventLoop::new().unwrap();
        let (output, _wake) = output(&mut event_loop, &pool);
        output.write(b"full").unwrap();

        let writer = {
            let output = output.clone();
            thread::spawn(move || output.write(b"next"))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!writer.is_finished());

        output.queue.clear();
        writer.join().unwrap().unwrap();
        assert_eq!(output.queue.len(), 1);

        output.queue.clear();
        assert_eq!(pool.stats().leased_blocks, 0);
        event_loop.dispose();
    }

    #[tokio::test]
    async fn cancelled_wait_reports_cancelled() {
        let pool = MemoryPool::builder().block_size(16).blocks_per_slab(2).build().unwrap();
        let mut event_loop = EventLoop::new().unwrap();
        let (output, _wake) = output(&mut event_loop, &pool);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(output.write_async(b"never sent", cancel).await, Err(StreamError::Cancelled)));
        assert_eq!(output.queue.len(), 1);

        output.queue.clear();
        event_loop.dispose();
    }
}
