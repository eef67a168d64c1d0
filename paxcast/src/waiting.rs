//! Wait/notify keyed by message id.
//!
//! A client `broadcast` registers its [`MsgId`] and then waits for the
//! matching Success. The completion flag is persistent: a Success that lands
//! before the waiter starts waiting is still observed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::types::MsgId;

#[derive(Debug, Default)]
struct Slot {
    done: bool,
    notify: Arc<Notify>,
}

/// Registry of locally-originated broadcasts awaiting completion.
#[derive(Debug, Default)]
pub struct WaitingRoom {
    slots: Mutex<HashMap<MsgId, Slot>>,
}

impl WaitingRoom {
    /// An empty waiting room.
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<MsgId, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `msg_id`. Registering twice keeps the existing state.
    pub fn register(&self, msg_id: MsgId) {
        self.slots().entry(msg_id).or_default();
    }

    /// Register `msg_id` for as long as the returned guard lives.
    ///
    /// Dropping the guard forgets the id, so a waiter that is cancelled
    /// mid-wait leaves no slot behind.
    pub fn track(&self, msg_id: MsgId) -> Registration<'_> {
        self.register(msg_id);
        Registration { room: self, msg_id }
    }

    /// Mark `msg_id` complete and wake its waiter.
    ///
    /// Ids that were never registered are ignored. Returns whether a
    /// registered id was completed.
    pub fn unblock(&self, msg_id: MsgId) -> bool {
        let mut slots = self.slots();
        match slots.get_mut(&msg_id) {
            Some(slot) => {
                slot.done = true;
                slot.notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Whether `msg_id` has completed.
    pub fn is_complete(&self, msg_id: MsgId) -> bool {
        self.slots().get(&msg_id).is_some_and(|s| s.done)
    }

    /// Remove `msg_id` if it completed. Returns whether it did.
    pub fn try_complete(&self, msg_id: MsgId) -> bool {
        let mut slots = self.slots();
        if slots.get(&msg_id).is_some_and(|s| s.done) {
            slots.remove(&msg_id);
            true
        } else {
            false
        }
    }

    /// Stop tracking `msg_id`.
    pub fn forget(&self, msg_id: MsgId) {
        self.slots().remove(&msg_id);
    }

    /// Wait up to `timeout` for `msg_id` to complete.
    ///
    /// Returns `true` and forgets the id on completion, `false` on timeout
    /// (the id stays registered so the caller can resend and wait again).
    pub async fn wait(&self, msg_id: MsgId, timeout: Duration) -> bool {
        let notify = {
            let mut slots = self.slots();
            let slot = slots.entry(msg_id).or_default();
            if slot.done {
                slots.remove(&msg_id);
                return true;
            }
            slot.notify.clone()
        };

        // notify_one stores a permit, so an unblock racing this line is kept.
        if tokio::time::timeout(timeout, notify.notified()).await.is_err() {
            return false;
        }
        self.try_complete(msg_id)
    }

    /// Number of tracked ids.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A tracked id, forgotten on drop. See [`WaitingRoom::track`].
#[derive(Debug)]
pub struct Registration<'a> {
    room: &'a WaitingRoom,
    msg_id: MsgId,
}

impl Registration<'_> {
    /// The tracked id.
    pub fn msg_id(&self) -> MsgId {
        self.msg_id
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.room.forget(self.msg_id);
    }
}
