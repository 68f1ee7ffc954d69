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

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::checker::HealthChecker;
use crate::client::ConnectivityState;
use crate::client::connectivity_state::ConnectivityStateWatcher;
use crate::client::load_balancing::{Subchannel, SubchannelState};
use crate::client::subchannel::InternalSubchannel;
use crate::client::work_serializer::WorkSerializer;

/// Fans the health of one subchannel out to its watchers, running one health
/// check stream per service name no matter how many watchers ask for it.
///
/// Created by the first [`HealthWatcher`] on a subchannel and dropped with
/// the last one.
pub struct HealthProducer {
    subchannel: Arc<InternalSubchannel>,
    raw_watcher: Arc<dyn ConnectivityStateWatcher>,
    inner: Mutex<ProducerInner>,
}

struct ProducerInner {
    // Last raw state of the subchannel.
    state: Option<SubchannelState>,
    checkers: HashMap<String, HealthChecker>,
    non_health_watchers: Vec<Arc<WatcherEntry>>,
}

/// A watcher together with the serializer its notifications run on.
pub(super) struct WatcherEntry {
    serializer: Arc<WorkSerializer>,
    watcher: Arc<dyn ConnectivityStateWatcher>,
}

impl WatcherEntry {
    /// Queues `state` for delivery.  Safe to call with locks held: the
    /// watcher itself only ever runs on the serializer.
    pub(super) fn notify(&self, state: SubchannelState) {
        let watcher = self.watcher.clone();
        self.serializer
            .run(move || watcher.on_connectivity_state_change(&state));
    }
}

// Registered with the subchannel; holds the producer weakly so the
// subchannel does not keep it alive.
struct RawStateWatcher {
    producer: Weak<HealthProducer>,
}

impl ConnectivityStateWatcher for RawStateWatcher {
    fn on_connectivity_state_change(&self, state: &SubchannelState) {
        if let Some(producer) = self.producer.upgrade() {
            producer.on_subchannel_state(state);
        }
    }
}

impl HealthProducer {
    pub(crate) fn new(subchannel: Arc<InternalSubchannel>) -> Arc<Self> {
        let producer = Arc::new_cyclic(|weak| Self {
            subchannel,
            raw_watcher: Arc::new(RawStateWatcher {
                producer: weak.clone(),
            }),
            inner: Mutex::new(ProducerInner {
                state: None,
                checkers: HashMap::new(),
                non_health_watchers: Vec::new(),
            }),
        });
        producer
            .subchannel
            .add_watcher(producer.raw_watcher.clone());
        producer
    }

    fn add_watcher(self: &Arc<Self>, service_name: Option<&str>, entry: Arc<WatcherEntry>) {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let Some(name) = service_name else {
            if let Some(state) = &inner.state {
                entry.notify(state.clone());
            }
            inner.non_health_watchers.push(entry);
            return;
        };
        let checker = inner.checkers.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(service = name, subchannel = %self.subchannel.address(), "creating health checker");
            let mut checker = HealthChecker::new(
                name.to_string(),
                Arc::downgrade(self),
                self.subchannel.runtime().clone(),
            );
            if let Some(state) = &inner.state {
                checker.on_subchannel_state(state, self.subchannel.connected_subchannel());
            }
            checker
        });
        checker.add_watcher(entry);
    }

    fn remove_watcher(&self, service_name: Option<&str>, entry: &Arc<WatcherEntry>) {
        let mut inner = self.inner.lock();
        let Some(name) = service_name else {
            inner
                .non_health_watchers
                .retain(|w| !Arc::ptr_eq(w, entry));
            return;
        };
        let Some(checker) = inner.checkers.get_mut(name) else {
            return;
        };
        if checker.remove_watcher(entry) {
            tracing::debug!(service = name, "last watcher gone; dropping health checker");
            inner.checkers.remove(name);
        }
    }

    fn on_subchannel_state(&self, state: &SubchannelState) {
        let connected = match state.connectivity_state {
            ConnectivityState::Ready => self.subchannel.connected_subchannel(),
            _ => None,
        };
        let mut inner = self.inner.lock();
        inner.state = Some(state.clone());
        for checker in inner.checkers.values_mut() {
            checker.on_subchannel_state(state, connected.clone());
        }
        // The producer is about to go away with the subchannel.
        if state.connectivity_state == ConnectivityState::Shutdown {
            return;
        }
        for w in &inner.non_health_watchers {
            w.notify(state.clone());
        }
    }

    /// Called by a checker's stream with the health it observed.  Reports
    /// from a stream that has since been replaced are ignored.
    pub(super) fn on_health_state(&self, service_name: &str, stream_id: u64, state: SubchannelState) {
        let mut inner = self.inner.lock();
        if let Some(checker) = inner.checkers.get_mut(service_name) {
            checker.on_stream_state(stream_id, state);
        }
    }

    #[cfg(test)]
    pub(super) fn checker_count(&self) -> usize {
        self.inner.lock().checkers.len()
    }
}

impl Drop for HealthProducer {
    fn drop(&mut self) {
        self.subchannel.remove_watcher(&self.raw_watcher);
    }
}

/// A registration with a subchannel's [`HealthProducer`].
///
/// With a service name, the watcher sees the health reported by the
/// `grpc.health.v1` service while the subchannel is Ready, and the raw state
/// otherwise.  Without one, it sees the raw state only.  Dropping the handle
/// detaches the watcher.
pub struct HealthWatcher {
    producer: Arc<HealthProducer>,
    service_name: Option<String>,
    entry: Arc<WatcherEntry>,
}

impl HealthWatcher {
    pub fn new(
        subchannel: &Arc<InternalSubchannel>,
        service_name: Option<String>,
        serializer: Arc<WorkSerializer>,
        watcher: Arc<dyn ConnectivityStateWatcher>,
    ) -> Self {
        let producer = subchannel.health_producer();
        let entry = Arc::new(WatcherEntry {
            serializer,
            watcher,
        });
        producer.add_watcher(service_name.as_deref(), entry.clone());
        Self {
            producer,
            service_name,
            entry,
        }
    }

    pub fn service_name(&self) -> Option<&str> {
        self.service_name.as_deref()
    }

    pub fn producer(&self) -> &Arc<HealthProducer> {
        &self.producer
    }
}

impl Drop for HealthWatcher {
    fn drop(&mut self) {
        self.producer
            .remove_watcher(self.service_name.as_deref(), &self.entry);
    }
}
