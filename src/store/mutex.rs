//! Software mutex serializing worker acquire/release sequences.
//!
//! Acquisition is FIFO. A holder that exceeds the staleness threshold is
//! forcibly released on the next acquisition attempt; its eventual release
//! call becomes a no-op because every grant carries an epoch and a token from
//! a superseded epoch no longer matches.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Proof of a successful acquisition. Must be passed back to
/// [`StoreMutex::release`]; a token from a force-released grant is ignored.
#[derive(Debug)]
pub struct LockToken {
    epoch: u64,
}

struct Holder {
    owner: String,
    since: Instant,
    epoch: u64,
}

struct Waiter {
    owner: String,
    tx: oneshot::Sender<LockToken>,
}

struct State {
    holder: Option<Holder>,
    epoch: u64,
    queue: VecDeque<Waiter>,
}

pub struct StoreMutex {
    name: &'static str,
    staleness: Duration,
    state: Mutex<State>,
}

impl StoreMutex {
    pub fn new(name: &'static str, staleness: Duration) -> Self {
        Self {
            name,
            staleness,
            state: Mutex::new(State {
                holder: None,
                epoch: 0,
                queue: VecDeque::new(),
            }),
        }
    }

    /// Acquires the mutex, waiting behind earlier callers.
    pub async fn acquire(&self, owner: &str) -> LockToken {
        loop {
            let rx = {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                self.reap_stale(&mut state);
                if state.holder.is_none() && state.queue.is_empty() {
                    return Self::grant(self.name, &mut state, owner.to_string());
                }
                let (tx, rx) = oneshot::channel();
                state.queue.push_back(Waiter {
                    owner: owner.to_string(),
                    tx,
                });
                rx
            };
            // Wake up periodically so a stale holder cannot park the queue.
            match tokio::time::timeout(self.staleness, rx).await {
                Ok(Ok(token)) => return token,
                Ok(Err(_)) | Err(_) => continue,
            }
        }
    }

    /// Releases the mutex. A token superseded by a staleness force-release
    /// does nothing, so a stuck holder cannot unlock the next owner.
    pub fn release(&self, token: LockToken) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = state.holder.as_ref().is_some_and(|h| h.epoch == token.epoch);
        if current {
            state.holder = None;
            self.hand_off(&mut state);
        } else {
            debug!(
                mutex = self.name,
                epoch = token.epoch,
                "ignoring release from superseded holder"
            );
        }
    }

    /// Whether the mutex is currently held (stale holders count).
    pub fn is_locked(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.holder.is_some()
    }

    fn reap_stale(&self, state: &mut State) {
        let stale = state
            .holder
            .as_ref()
            .is_some_and(|h| h.since.elapsed() >= self.staleness);
        if stale {
            if let Some(holder) = state.holder.take() {
                warn!(
                    mutex = self.name,
                    owner = %holder.owner,
                    held_for_ms = holder.since.elapsed().as_millis() as u64,
                    "force-releasing stale lock"
                );
            }
            self.hand_off(state);
        }
    }

    fn hand_off(&self, state: &mut State) {
        while let Some(waiter) = state.queue.pop_front() {
            let token = Self::grant(self.name, state, waiter.owner);
            match waiter.tx.send(token) {
                Ok(()) => return,
                Err(_) => {
                    // Waiter timed out and looped; drop its grant and retry.
                    state.holder = None;
                }
            }
        }
    }

    fn grant(name: &str, state: &mut State, owner: String) -> LockToken {
        state.epoch += 1;
        let epoch = state.epoch;
        debug!(mutex = name, owner = %owner, epoch, "lock acquired");
        state.holder = Some(Holder {
            owner,
            since: Instant::now(),
            epoch,
        });
        LockToken { epoch }
    }
}
