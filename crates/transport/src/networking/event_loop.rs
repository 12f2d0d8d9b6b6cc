//! The single threaded reactor every handle belongs to.
//!
//! One turn of [`EventLoop::run`]:
//!
//! 1. fire callbacks for async sends that arrived since the last turn
//! 2. fire expired timers
//! 3. drain the deferred queue: reads requested by `read_start`, write flushes, write
//!    completions and removal of closed handles
//! 4. stop if requested, or if no handle is active and nothing is deferred
//! 5. poll the reactor and dispatch readiness to the handles
//!
//! Callbacks receive `&mut EventLoop` so they can create, use and close handles themselves.
//! A panicking callback is caught, logged and its handle closed; the loop keeps running.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::{Events, Poll, Token, Waker};
use tracing::{debug, error, trace, warn};

use crate::ensure;
use crate::memory::DEFAULT_BLOCK_SIZE;
use crate::networking::handle::{HandleEntry, HandleId, HandleKind, HandleState, HandleTable};
use crate::networking::write_req::WriteCompletion;
use crate::networking::NetError;

const WAKE_TOKEN: Token = Token(usize::MAX);

pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Tuning knobs of an [`EventLoop`].
#[derive(Debug, Clone)]
pub struct LoopOptions {
    pub(crate) event_capacity: usize,
    pub(crate) read_buffer_size: usize,
}

impl Default for LoopOptions {
    fn default() -> Self {
        Self { event_capacity: DEFAULT_EVENT_CAPACITY, read_buffer_size: DEFAULT_BLOCK_SIZE }
    }
}

impl LoopOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Readiness events handled per reactor poll
    pub fn with_event_capacity(mut self, event_capacity: usize) -> Self {
        self.event_capacity = event_capacity.max(1);
        self
    }

    /// Size suggested to the `alloc` callback of a reading tcp handle
    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size.max(1);
        self
    }
}

pub(crate) enum Deferred {
    Read(HandleId),
    Flush(HandleId),
    Completion(WriteCompletion),
    Remove(HandleId),
}

/// Requests [`EventLoop::run`] to return, from any thread.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    /// Same as [`EventLoop::stop`], a stop that arrives before `run` starts is discarded.
    pub fn stop(&self) -> Result<(), NetError> {
        self.stop.store(true, Ordering::Release);
        self.waker.wake().map_err(NetError::io)
    }
}

pub struct EventLoop {
    pub(crate) poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    woken: bool,
    running: bool,
    pub(crate) handles: HandleTable,
    pub(crate) deferred: VecDeque<Deferred>,
    pub(crate) timers: Vec<(Instant, HandleId)>,
    pub(crate) options: LoopOptions,
}

#[derive(Copy, Clone)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed() || event.is_error(),
        }
    }
}

impl EventLoop {
    pub fn new() -> Result<Self, NetError> {
        Self::with_options(LoopOptions::default())
    }

    pub fn with_options(options: LoopOptions) -> Result<Self, NetError> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        debug!(event_capacity = options.event_capacity, "event loop initialized");
        Ok(Self {
            poll,
            events: Events::with_capacity(options.event_capacity),
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            woken: false,
            running: false,
            handles: HandleTable::default(),
            deferred: VecDeque::new(),
            timers: Vec::new(),
            options,
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { stop: Arc::clone(&self.stop), waker: Arc::clone(&self.waker) }
    }

    /// Makes the current [`run`](Self::run) return once this turn is done.
    ///
    /// A stop requested while the loop is not running is discarded by the next `run`.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Current lifecycle state of the handle `id`, `Disposed` once it is gone.
    pub fn handle_state(&self, id: HandleId) -> HandleState {
        self.handles.get(id).map_or(HandleState::Disposed, |entry| entry.state)
    }

    /// Number of handles that have not been removed yet, closing ones included
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Runs the loop on the calling thread.
    ///
    /// Returns when no handle is active and no completion is pending, or when a stop was
    /// requested. Calling `run` from inside a callback is an error.
    pub fn run(&mut self) -> Result<(), NetError> {
        ensure!(!self.running, NetError::invalid_state("the event loop is already running"));
        self.running = true;
        self.stop.store(false, Ordering::Release);
        let result = self.run_turns();
        self.running = false;
        result
    }

    /// Closes every remaining handle and releases the reactor.
    ///
    /// Writes still queued on a tcp handle complete with [`NetError::Aborted`] before this
    /// returns.
    pub fn dispose(mut self) {
        let open: Vec<HandleId> =
            self.handles.ids().into_iter().filter(|id| self.handle_state(*id) != HandleState::Closing).collect();
        if !open.is_empty() {
            warn!(handles = open.len(), "disposing event loop with open handles");
        }
        for id in open {
            let _ = self.close_handle(id);
        }
        while !self.deferred.is_empty() {
            self.run_deferred();
        }
        debug!("event loop disposed");
    }

    fn run_turns(&mut self) -> Result<(), NetError> {
        let mut ready = Vec::with_capacity(self.options.event_capacity);
        self.woken = true;
        loop {
            if std::mem::take(&mut self.woken) {
                self.run_async();
            }
            self.run_timers(Instant::now());
            self.run_deferred();

            if self.stop.swap(false, Ordering::AcqRel) {
                debug!("event loop stop requested");
                return Ok(());
            }
            if !self.is_alive() {
                trace!("no active handles left, leaving event loop");
                return Ok(());
            }

            let timeout = self.poll_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(cause = %e, "reactor poll failed");
                return Err(NetError::io(e));
            }

            ready.extend(self.events.iter().map(Readiness::from));
            for readiness in ready.drain(..) {
                self.dispatch(readiness);
            }
        }
    }

    fn dispatch(&mut self, readiness: Readiness) {
        if readiness.token == WAKE_TOKEN {
            self.woken = true;
            return;
        }
        let Some(id) = self.handles.id_for(readiness.token) else {
            trace!(token = readiness.token.0, "readiness for a removed handle");
            return;
        };
        if readiness.readable {
            self.on_readable(id);
        }
        if readiness.writable {
            self.flush_writes(id);
        }
    }

    /// Runs the tasks deferred so far; tasks they defer in turn wait for the next pass.
    pub(crate) fn run_deferred(&mut self) {
        for _ in 0..self.deferred.len() {
            let Some(task) = self.deferred.pop_front() else {
                break;
            };
            match task {
                Deferred::Read(id) => self.read_ready(id),
                Deferred::Flush(id) => self.flush_writes(id),
                Deferred::Completion(completion) => completion.complete(self),
                Deferred::Remove(id) => {
                    if self.handles.remove(id).is_some() {
                        trace!(handle = ?id, "handle disposed");
                    }
                }
            }
        }
    }

    fn is_alive(&self) -> bool {
        !self.deferred.is_empty() || self.handles.entries().any(HandleEntry::keeps_loop_alive)
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if !self.deferred.is_empty() || self.woken {
            return Some(Duration::ZERO);
        }
        let now = Instant::now();
        self.timers
            .iter()
            .filter(|(_, id)| self.handles.get(*id).is_some_and(HandleEntry::keeps_loop_alive))
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
            .min()
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    pub(crate) fn insert_handle(&mut self, kind: HandleKind) -> HandleId {
        self.handles.insert(HandleEntry::new(kind))
    }

    /// The entry of a handle that accepts operations, `Disposed` once it is closing.
    pub(crate) fn live_entry(&mut self, id: HandleId) -> Result<&mut HandleEntry, NetError> {
        let entry = self.handles.get_mut(id).ok_or(NetError::Disposed)?;
        ensure!(entry.state != HandleState::Closing, NetError::Disposed);
        Ok(entry)
    }

    /// Moves the handle into `Closing` and schedules its removal.
    ///
    /// Queued writes complete with [`NetError::Aborted`], pending async sends and timers
    /// never fire. The close hook of a tcp handle runs before this returns.
    pub(crate) fn close_handle(&mut self, id: HandleId) -> Result<(), NetError> {
        let entry = self.handles.get_mut(id).ok_or(NetError::Disposed)?;
        ensure!(entry.state != HandleState::Closing, NetError::Disposed);
        entry.state = HandleState::Closing;

        let mut on_close = None;
        let aborted = match &mut entry.kind {
            HandleKind::Tcp(tcp) => {
                on_close = tcp.take_on_close();
                tcp.shutdown(self.poll.registry())
            }
            HandleKind::Async(async_entry) => {
                async_entry.close();
                Vec::new()
            }
            HandleKind::Timer(timer) => {
                timer.cancel();
                Vec::new()
            }
        };
        if !aborted.is_empty() {
            debug!(handle = ?id, writes = aborted.len(), "aborting queued writes");
        }
        self.deferred.extend(aborted.into_iter().map(|write| Deferred::Completion(write.abort())));
        self.deferred.push_back(Deferred::Remove(id));
        trace!(handle = ?id, "handle closing");

        if let Some(on_close) = on_close {
            self.guarded(id, on_close);
        }
        Ok(())
    }

    /// Runs a user callback owned by `owner`, closing the owner if the callback panics.
    pub(crate) fn guarded<R>(&mut self, owner: HandleId, callback: impl FnOnce(&mut EventLoop) -> R) -> Option<R> {
        match panic::catch_unwind(AssertUnwindSafe(|| callback(self))) {
            Ok(value) => Some(value),
            Err(payload) => {
                error!(handle = ?owner, panic = panic_message(&*payload), "callback panicked, closing its handle");
                let _ = self.close_handle(owner);
                None
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("handles", &self.handles.len())
            .field("deferred", &self.deferred.len())
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}
