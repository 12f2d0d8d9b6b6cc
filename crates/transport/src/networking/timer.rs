use std::time::{Duration, Instant};

use crate::networking::handle::{HandleEntry, HandleId, HandleKind, HandleState};
use crate::networking::{EventLoop, NetError};

type TimerCallback = Box<dyn FnOnce(&mut EventLoop)>;

pub(crate) struct TimerEntry {
    callback: Option<TimerCallback>,
}

impl TimerEntry {
    pub(crate) fn new(callback: TimerCallback) -> Self {
        Self { callback: Some(callback) }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.callback.is_some()
    }

    pub(crate) fn cancel(&mut self) {
        self.callback = None;
    }
}

/// A one-shot timer; the handle closes itself after firing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TimerHandle {
    id: HandleId,
}

impl TimerHandle {
    pub fn start(event_loop: &mut EventLoop, delay: Duration, callback: impl FnOnce(&mut EventLoop) + 'static) -> TimerHandle {
        let deadline = Instant::now() + delay;
        let id = event_loop.insert_handle(HandleKind::Timer(TimerEntry::new(Box::new(callback))));
        if let Some(entry) = event_loop.handles.get_mut(id) {
            entry.state = HandleState::Active;
        }
        event_loop.timers.push((deadline, id));
        TimerHandle { id }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Cancels the timer if it has not fired yet.
    pub fn close(&self, event_loop: &mut EventLoop) -> Result<(), NetError> {
        event_loop.close_handle(self.id)
    }
}

impl EventLoop {
    pub(crate) fn run_timers(&mut self, now: Instant) {
        if self.timers.is_empty() {
            return;
        }

        let mut expired = Vec::new();
        let handles = &self.handles;
        self.timers.retain(|(deadline, id)| {
            if handles.get(*id).is_none() {
                return false;
            }
            if *deadline <= now {
                expired.push((*deadline, *id));
                return false;
            }
            true
        });
        expired.sort_by_key(|(deadline, _)| *deadline);

        for (_, id) in expired {
            let callback = match self.handles.get_mut(id) {
                Some(HandleEntry { state: HandleState::Active, kind: HandleKind::Timer(timer) }) => timer.callback.take(),
                _ => None,
            };
            let Some(callback) = callback else {
                continue;
            };
            let _ = self.close_handle(id);
            self.guarded(id, callback);
        }
    }
}
