//! Loop-owned handle table.
//!
//! Every handle created on an [`EventLoop`](super::EventLoop) lives in a slot of this table.
//! User facing handle types only carry a [`HandleId`]: the slot index plus the generation the
//! slot had when the handle was created. Removing an entry bumps the slot generation, so a
//! stale id held after the handle was disposed never reaches the slot's next occupant.

use std::fmt;

use mio::Token;

use super::async_handle::AsyncEntry;
use super::tcp::TcpEntry;
use super::timer::TimerEntry;

/// Lifecycle of a loop handle.
///
/// `Initialized -> Active -> Closing -> Disposed`. Handles are only handed out by `init`-style
/// constructors, so the uninitialized state never escapes the loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandleState {
    /// Bound to a loop, no callback can fire yet
    Initialized,
    /// Callbacks may fire
    Active,
    /// `close` was called, the entry is removed on the next loop turn
    Closing,
    /// The entry is gone, every operation fails with [`NetError::Disposed`](super::NetError::Disposed)
    Disposed,
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct HandleId {
    index: usize,
    generation: u32,
}

impl HandleId {
    #[inline]
    pub(crate) fn token(self) -> Token {
        Token(self.index)
    }
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

pub(crate) enum HandleKind {
    Async(AsyncEntry),
    Tcp(TcpEntry),
    Timer(TimerEntry),
}

pub(crate) struct HandleEntry {
    pub(crate) state: HandleState,
    pub(crate) kind: HandleKind,
}

impl HandleEntry {
    pub(crate) fn new(kind: HandleKind) -> Self {
        Self { state: HandleState::Initialized, kind }
    }

    /// Whether this entry keeps [`EventLoop::run`](super::EventLoop::run) going
    pub(crate) fn keeps_loop_alive(&self) -> bool {
        match self.state {
            HandleState::Closing => true,
            HandleState::Initialized | HandleState::Disposed => false,
            HandleState::Active => match &self.kind {
                HandleKind::Async(_) => true,
                HandleKind::Tcp(tcp) => tcp.is_busy(),
                HandleKind::Timer(timer) => timer.is_pending(),
            },
        }
    }
}

struct Slot {
    generation: u32,
    entry: Option<HandleEntry>,
}

#[derive(Default)]
pub(crate) struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

impl HandleTable {
    pub(crate) fn insert(&mut self, entry: HandleEntry) -> HandleId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.entry = Some(entry);
                HandleId { index, generation: slot.generation }
            }
            None => {
                self.slots.push(Slot { generation: 0, entry: Some(entry) });
                HandleId { index: self.slots.len() - 1, generation: 0 }
            }
        }
    }

    pub(crate) fn get(&self, id: HandleId) -> Option<&HandleEntry> {
        self.slots.get(id.index).filter(|slot| slot.generation == id.generation).and_then(|slot| slot.entry.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: HandleId) -> Option<&mut HandleEntry> {
        self.slots.get_mut(id.index).filter(|slot| slot.generation == id.generation).and_then(|slot| slot.entry.as_mut())
    }

    /// Resolves a reactor token back to the live id occupying that slot.
    pub(crate) fn id_for(&self, token: Token) -> Option<HandleId> {
        let slot = self.slots.get(token.0)?;
        slot.entry.as_ref().map(|_| HandleId { index: token.0, generation: slot.generation })
    }

    pub(crate) fn remove(&mut self, id: HandleId) -> Option<HandleEntry> {
        let slot = self.slots.get_mut(id.index).filter(|slot| slot.generation == id.generation)?;
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(entry)
    }

    pub(crate) fn ids(&self) -> Vec<HandleId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.entry.is_some())
            .map(|(index, slot)| HandleId { index, generation: slot.generation })
            .collect()
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = &HandleEntry> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}
