use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use mio::Waker;
use tracing::trace;

use crate::ensure;
use crate::networking::handle::{HandleEntry, HandleId, HandleKind, HandleState};
use crate::networking::{EventLoop, NetError};

type AsyncCallback = Box<dyn FnMut(&mut EventLoop, &AsyncHandle)>;

#[derive(Debug)]
struct AsyncShared {
    pending: AtomicUsize,
    closed: AtomicBool,
    waker: Arc<Waker>,
}

impl AsyncShared {
    fn send(&self) -> Result<(), NetError> {
        ensure!(!self.closed.load(Ordering::Acquire), NetError::Disposed);
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.waker.wake().map_err(NetError::io)
    }
}

pub(crate) struct AsyncEntry {
    shared: Arc<AsyncShared>,
    callback: Option<AsyncCallback>,
}

impl AsyncEntry {
    pub(crate) fn close(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.pending.store(0, Ordering::Release);
        self.callback = None;
    }
}

/// Wakes the loop from other threads and runs a callback on the loop thread.
///
/// Every successful [`send`](AsyncSender::send) runs the callback exactly once, unless the
/// handle is closed before the loop gets to it.
#[derive(Debug, Clone)]
pub struct AsyncHandle {
    id: HandleId,
    shared: Arc<AsyncShared>,
}

/// The cross-thread half of an [`AsyncHandle`].
#[derive(Debug, Clone)]
pub struct AsyncSender {
    shared: Arc<AsyncShared>,
}

impl AsyncSender {
    /// Schedules one callback run. Fails with [`NetError::Disposed`] once the handle is closed.
    pub fn send(&self) -> Result<(), NetError> {
        self.shared.send()
    }
}

impl AsyncHandle {
    /// Registers `callback` on the loop. The handle is active right away and keeps
    /// [`EventLoop::run`] going until it is closed.
    pub fn init(event_loop: &mut EventLoop, callback: impl FnMut(&mut EventLoop, &AsyncHandle) + 'static) -> AsyncHandle {
        let shared = Arc::new(AsyncShared {
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            waker: event_loop.waker(),
        });
        let entry = AsyncEntry { shared: Arc::clone(&shared), callback: Some(Box::new(callback)) };
        let id = event_loop.insert_handle(HandleKind::Async(entry));
        if let Some(entry) = event_loop.handles.get_mut(id) {
            entry.state = HandleState::Active;
        }
        AsyncHandle { id, shared }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn send(&self) -> Result<(), NetError> {
        self.shared.send()
    }

    pub fn sender(&self) -> AsyncSender {
        AsyncSender { shared: Arc::clone(&self.shared) }
    }

    pub fn close(&self, event_loop: &mut EventLoop) -> Result<(), NetError> {
        event_loop.close_handle(self.id)
    }
}

impl EventLoop {
    /// Fires the callbacks for sends collected since the last wake.
    pub(crate) fn run_async(&mut self) {
        for id in self.handles.ids() {
            let sends = match self.handles.get(id) {
                Some(HandleEntry { state: HandleState::Active, kind: HandleKind::Async(entry) }) => {
                    entry.shared.pending.swap(0, Ordering::AcqRel)
                }
                _ => continue,
            };
            if sends > 0 {
                trace!(handle = ?id, sends, "async handle woken");
            }
            for _ in 0..sends {
                if !self.fire_async(id) {
                    break;
                }
            }
        }
    }

    fn fire_async(&mut self, id: HandleId) -> bool {
        let (mut callback, handle) = match self.handles.get_mut(id) {
            Some(HandleEntry { state: HandleState::Active, kind: HandleKind::Async(entry) }) => match entry.callback.take() {
                Some(callback) => (callback, AsyncHandle { id, shared: Arc::clone(&entry.shared) }),
                None => return false,
            },
            _ => return false,
        };

        self.guarded(id, |event_loop| callback(event_loop, &handle));

        match self.handles.get_mut(id) {
            Some(HandleEntry { state: HandleState::Active, kind: HandleKind::Async(entry) }) => {
                entry.callback = Some(callback);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::thread;

    #[test]
    fn callback_runs_once_per_send() {
        let mut event_loop = EventLoop::new().unwrap();
        let calls = Rc::new(Cell::new(0));

        let counter = Rc::clone(&calls);
        let handle = AsyncHandle::init(&mut event_loop, move |event_loop, handle| {
            counter.set(counter.get() + 1);
            if counter.get() == 3 {
                handle.close(event_loop).unwrap();
            }
        });

        let sender = handle.sender();
        let worker = thread::spawn(move || {
            for _ in 0..3 {
                sender.send().unwrap();
            }
        });
        worker.join().unwrap();

        event_loop.run().unwrap();
        assert_eq!(calls.get(), 3);
        assert_eq!(event_loop.handle_state(handle.id()), HandleState::Disposed);
        assert!(matches!(handle.send(), Err(NetError::Disposed)));
        event_loop.dispose();
    }

    #[test]
    fn sends_after_close_are_dropped() {
        let mut event_loop = EventLoop::new().unwrap();
        let calls = Rc::new(Cell::new(0));

        let counter = Rc::clone(&calls);
        let handle = AsyncHandle::init(&mut event_loop, move |_, _| counter.set(counter.get() + 1));
        handle.send().unwrap();
        handle.close(&mut event_loop).unwrap();
        assert!(matches!(handle.close(&mut event_loop), Err(NetError::Disposed)));

        event_loop.run().unwrap();
        assert_eq!(calls.get(), 0);
        event_loop.dispose();
    }

    #[test]
    fn panicking_callback_closes_only_its_handle() {
        let mut event_loop = EventLoop::new().unwrap();
        let survivor_calls = Rc::new(Cell::new(0));

        let faulty = AsyncHandle::init(&mut event_loop, |_, _| panic!("boom"));
        let counter = Rc::clone(&survivor_calls);
        let survivor = AsyncHandle::init(&mut event_loop, move |event_loop, handle| {
            counter.set(counter.get() + 1);
            handle.close(event_loop).unwrap();
        });

        faulty.send().unwrap();
        survivor.send().unwrap();
        event_loop.run().unwrap();

        assert_eq!(survivor_calls.get(), 1);
        assert_eq!(event_loop.handle_state(faulty.id()), HandleState::Disposed);
        event_loop.dispose();
    }
}
