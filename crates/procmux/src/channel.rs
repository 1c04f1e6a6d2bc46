//! Named rendezvous channels and their registry.
//!
//! A channel owns two FIFO wait queues (unmatched senders, unmatched
//! receivers) and is acquired through a two-tier protocol: the registry's
//! directory mutex covers only the name lookup, and per-channel exclusivity
//! is an `in_use` flag guarded by the channel's own short-lived state mutex.
//! A looker that finds the channel busy waits on the channel's "may-be-used"
//! condition (with the directory mutex, which the wait releases atomically)
//! and retries on wake; the channel may have been destroyed in the meantime.
//!
//! Holding a channel means owning the `in_use` flag, not a mutex guard. That
//! is the point: a send or receive acquires the channel inside a script
//! operation, and when the operation parks, the *scheduler* releases the
//! channel at the suspension point, a hand-off between threads that a guard
//! could not make.
//!
//! Lock order: directory → channel state. `unlock` re-acquires the directory
//! first so its signal happens-before a waiter's predicate re-check.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::list::ProcList;
use crate::types::{RuntimeError, MAX_CHANNEL_NAME};

// ── Channel ───────────────────────────────────────────────────────────────────

pub(crate) struct Channel {
    name: String,
    state: Mutex<ChanState>,
    /// Signaled on unlock, broadcast on destroy. Always waited on with the
    /// registry's directory mutex.
    may_be_used: Condvar,
}

pub(crate) struct ChanState {
    /// Set while one thread performs matching on this channel.
    pub in_use: bool,
    /// Parked unmatched senders, FIFO.
    pub send: ProcList,
    /// Parked unmatched receivers, FIFO.
    pub recv: ProcList,
}

impl Channel {
    fn new(name: &str) -> Arc<Channel> {
        Arc::new(Channel {
            name: name.to_string(),
            state: Mutex::new(ChanState {
                in_use: false,
                send: ProcList::new(),
                recv: ProcList::new(),
            }),
            may_be_used: Condvar::new(),
        })
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ChanState> {
        self.state.lock().expect("channel state poisoned")
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// The runtime's name → channel directory.
pub(crate) struct Registry {
    dir: Mutex<HashMap<String, Arc<Channel>>>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Registry { dir: Mutex::new(HashMap::new()) }
    }

    fn dir(&self) -> MutexGuard<'_, HashMap<String, Arc<Channel>>> {
        self.dir.lock().expect("channel directory poisoned")
    }

    /// Register a new channel under `name`.
    pub(crate) fn create(&self, name: &str) -> Result<(), RuntimeError> {
        if name.len() > MAX_CHANNEL_NAME {
            return Err(RuntimeError::InvalidArgument {
                message: format!("channel name longer than {MAX_CHANNEL_NAME} bytes"),
            });
        }
        let mut dir = self.dir();
        if dir.contains_key(name) {
            return Err(RuntimeError::ChannelExists { name: name.to_string() });
        }
        dir.insert(name.to_string(), Channel::new(name));
        Ok(())
    }

    /// Look up `name` without acquiring the channel. Diagnostic use only;
    /// the caller gets no exclusivity.
    pub(crate) fn unlocked_get(&self, name: &str) -> Option<Arc<Channel>> {
        self.dir().get(name).cloned()
    }

    /// Two-tier acquisition: return the channel with its `in_use` flag owned
    /// by the caller, or `None` if the name is absent.
    pub(crate) fn locked_get(&self, name: &str) -> Option<Arc<Channel>> {
        let mut dir = self.dir();
        loop {
            let chan = match dir.get(name) {
                Some(c) => Arc::clone(c),
                None => return None,
            };
            {
                let mut st = chan.state();
                if !st.in_use {
                    st.in_use = true;
                    drop(st);
                    return Some(chan);
                }
            }
            dir = chan
                .may_be_used
                .wait(dir)
                .expect("channel directory poisoned");
        }
    }

    /// Release a channel acquired by [`locked_get`](Registry::locked_get) and
    /// signal one waiter.
    pub(crate) fn unlock(&self, chan: &Channel) {
        let _dir = self.dir();
        chan.state().in_use = false;
        chan.may_be_used.notify_one();
    }

    /// Two-tier acquisition that also removes the entry from the directory,
    /// for destruction. Waiters are woken with a broadcast so they observe
    /// the disappearance and stop waiting. The caller still owns `in_use`
    /// and is responsible for unblocking the parked processes.
    pub(crate) fn remove_locked(&self, name: &str) -> Option<Arc<Channel>> {
        let mut dir = self.dir();
        loop {
            let chan = match dir.get(name) {
                Some(c) => Arc::clone(c),
                None => return None,
            };
            {
                let mut st = chan.state();
                if !st.in_use {
                    st.in_use = true;
                    drop(st);
                    dir.remove(name);
                    drop(dir);
                    chan.may_be_used.notify_all();
                    return Some(chan);
                }
            }
            dir = chan
                .may_be_used
                .wait(dir)
                .expect("channel directory poisoned");
        }
    }
}
