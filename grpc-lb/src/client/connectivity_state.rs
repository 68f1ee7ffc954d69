/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Tracking of a single connectivity state and fan-out to its watchers.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::client::ConnectivityState;
use crate::client::load_balancing::SubchannelState;

/// Receives connectivity state changes.
pub trait ConnectivityStateWatcher: Send + Sync {
    fn on_connectivity_state_change(&self, state: &SubchannelState);
}

/// Holds the current connectivity state of a subchannel (or any other entity
/// with a connectivity state) and notifies registered watchers when it
/// changes.
///
/// Watchers are always invoked without the tracker's lock held, so they may
/// call back into the tracker.  Callers of [`set_state`] are expected to be
/// serialized (e.g. by the transport driving the subchannel); the tracker then
/// delivers states to each watcher in the order they were set.
///
/// [`set_state`]: ConnectivityStateTracker::set_state
pub struct ConnectivityStateTracker {
    name: &'static str,
    inner: Mutex<TrackerInner>,
}

struct TrackerInner {
    state: SubchannelState,
    watchers: Vec<Arc<dyn ConnectivityStateWatcher>>,
}

impl ConnectivityStateTracker {
    pub fn new(name: &'static str, initial: ConnectivityState) -> Self {
        Self {
            name,
            inner: Mutex::new(TrackerInner {
                state: SubchannelState::new(initial),
                watchers: Vec::new(),
            }),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.lock().state.connectivity_state
    }

    /// Returns the current state together with its error, if any.
    pub fn snapshot(&self) -> SubchannelState {
        self.inner.lock().state.clone()
    }

    /// Registers `watcher` and immediately reports the current state to it.
    /// A tracker that has already shut down reports Shutdown and does not
    /// retain the watcher.
    pub fn add_watcher(&self, watcher: Arc<dyn ConnectivityStateWatcher>) {
        let current = {
            let mut inner = self.inner.lock();
            if inner.state.connectivity_state != ConnectivityState::Shutdown {
                inner.watchers.push(watcher.clone());
            }
            inner.state.clone()
        };
        tracing::trace!(tracker = self.name, state = %current, "watcher added");
        watcher.on_connectivity_state_change(&current);
    }

    pub fn remove_watcher(&self, watcher: &Arc<dyn ConnectivityStateWatcher>) {
        self.inner
            .lock()
            .watchers
            .retain(|w| !std::ptr::addr_eq(Arc::as_ptr(w), Arc::as_ptr(watcher)));
    }

    /// Records `state` and notifies every watcher if the connectivity state
    /// changed.  The error is always recorded, so a TransientFailure with a
    /// new error is visible through [`snapshot`] without a notification.
    /// After reporting Shutdown all watchers are released.
    ///
    /// [`snapshot`]: ConnectivityStateTracker::snapshot
    pub fn set_state(&self, state: SubchannelState) {
        let watchers = {
            let mut inner = self.inner.lock();
            let old = inner.state.connectivity_state;
            if old == ConnectivityState::Shutdown {
                return;
            }
            inner.state = state.clone();
            if old == state.connectivity_state {
                return;
            }
            tracing::debug!(tracker = self.name, from = %old, to = %state.connectivity_state, "connectivity state change");
            if state.connectivity_state == ConnectivityState::Shutdown {
                std::mem::take(&mut inner.watchers)
            } else {
                inner.watchers.clone()
            }
        };
        for w in watchers {
            w.on_connectivity_state_change(&state);
        }
    }
}
