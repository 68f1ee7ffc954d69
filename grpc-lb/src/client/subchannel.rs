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

//! The channel's own subchannel: one address, the state of its connection,
//! and the data producers that share that connection.
//!
//! Establishing connections is the transport's job.  The transport watches
//! [`InternalSubchannel::connect_requested`], and reports progress through
//! [`InternalSubchannel::set_ready`] and [`InternalSubchannel::set_state`].

use std::fmt::Debug;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tonic::{Status, async_trait};

use crate::client::ConnectivityState;
use crate::client::connectivity_state::{ConnectivityStateTracker, ConnectivityStateWatcher};
use crate::client::health::HealthProducer;
use crate::client::load_balancing::{Subchannel, SubchannelState};
use crate::client::name_resolution::Address;
use crate::rt::Runtime;

/// An established connection to the subchannel's address.
pub trait ConnectedSubchannel: Send + Sync {
    /// Starts a server-streaming call to `method` (e.g.
    /// `/grpc.health.v1.Health/Watch`) with a single encoded request message.
    /// Dropping the returned call cancels it.
    fn start_streaming_call(&self, method: &'static str, request: Bytes) -> Box<dyn StreamingCall>;
}

/// The receiving side of a server-streaming call.
#[async_trait]
pub trait StreamingCall: Send {
    /// Returns the next encoded response message.  `Some(Err(_))` carries the
    /// status of a call that failed; `None` means the server finished the
    /// call with OK.
    async fn message(&mut self) -> Option<Result<Bytes, Status>>;
}

pub struct InternalSubchannel {
    address: Address,
    runtime: Arc<dyn Runtime>,
    tracker: ConnectivityStateTracker,
    connected: Mutex<Option<Arc<dyn ConnectedSubchannel>>>,
    // At most one health producer per subchannel; it lives as long as some
    // watcher holds it.
    health_producer: Mutex<Weak<HealthProducer>>,
    connect_requested: Notify,
}

impl InternalSubchannel {
    pub fn new(address: Address, runtime: Arc<dyn Runtime>) -> Arc<Self> {
        tracing::debug!(address = %address, "creating subchannel");
        Arc::new(Self {
            address,
            runtime,
            tracker: ConnectivityStateTracker::new("subchannel", ConnectivityState::Idle),
            connected: Mutex::new(None),
            health_producer: Mutex::new(Weak::new()),
            connect_requested: Notify::new(),
        })
    }

    pub(crate) fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn state(&self) -> ConnectivityState {
        self.tracker.state()
    }

    /// Registers a watcher of the raw connectivity state.  The current state
    /// is reported right away.
    pub fn add_watcher(&self, watcher: Arc<dyn ConnectivityStateWatcher>) {
        self.tracker.add_watcher(watcher);
    }

    pub fn remove_watcher(&self, watcher: &Arc<dyn ConnectivityStateWatcher>) {
        self.tracker.remove_watcher(watcher);
    }

    /// The current connection, if the subchannel is Ready.
    pub fn connected_subchannel(&self) -> Option<Arc<dyn ConnectedSubchannel>> {
        self.connected.lock().clone()
    }

    /// Completes once `connect` has been called since the last time this
    /// future completed.
    pub async fn connect_requested(&self) {
        self.connect_requested.notified().await;
    }

    /// Records a new connection and moves the subchannel to Ready.
    pub fn set_ready(&self, connected: Arc<dyn ConnectedSubchannel>) {
        // Watchers reacting to Ready must find the connection.
        *self.connected.lock() = Some(connected);
        self.tracker
            .set_state(SubchannelState::new(ConnectivityState::Ready));
    }

    /// Moves the subchannel to a state other than Ready, dropping its
    /// connection.
    pub fn set_state(&self, state: SubchannelState) {
        if state.connectivity_state == ConnectivityState::Ready {
            tracing::warn!(address = %self.address, "Ready requires a connection; use set_ready");
            return;
        }
        self.connected.lock().take();
        self.tracker.set_state(state);
    }

    /// Returns the subchannel's health producer, creating it if no watcher
    /// currently holds one.
    pub(crate) fn health_producer(self: &Arc<Self>) -> Arc<HealthProducer> {
        let mut slot = self.health_producer.lock();
        if let Some(producer) = slot.upgrade() {
            return producer;
        }
        let producer = HealthProducer::new(self.clone());
        *slot = Arc::downgrade(&producer);
        producer
    }
}

impl Subchannel for InternalSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {
        self.connect_requested.notify_one();
    }
}

impl Debug for InternalSubchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "InternalSubchannel({}, {})", self.address, self.tracker.state())
    }
}

impl Drop for InternalSubchannel {
    fn drop(&mut self) {
        tracing::debug!(address = %self.address, "dropping subchannel");
        self.connected.get_mut().take();
        self.tracker
            .set_state(SubchannelState::new(ConnectivityState::Shutdown));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::{ConnectedSubchannel, InternalSubchannel, StreamingCall};
    use crate::client::ConnectivityState;
    use crate::client::connectivity_state::ConnectivityStateWatcher;
    use crate::client::load_balancing::{Subchannel, SubchannelState};
    use crate::client::name_resolution::Address;
    use crate::rt::default_runtime;

    struct NoCalls;

    impl ConnectedSubchannel for NoCalls {
        fn start_streaming_call(
            &self,
            _method: &'static str,
            _request: Bytes,
        ) -> Box<dyn StreamingCall> {
            unimplemented!("no calls expected")
        }
    }

    struct ConnectionObserver {
        subchannel: std::sync::Weak<InternalSubchannel>,
        seen: Mutex<Vec<(ConnectivityState, bool)>>,
    }

    // Records whether the connection is visible when each state arrives.
    impl ConnectivityStateWatcher for ConnectionObserver {
        fn on_connectivity_state_change(&self, state: &SubchannelState) {
            let connected = self
                .subchannel
                .upgrade()
                .is_some_and(|sc| sc.connected_subchannel().is_some());
            self.seen.lock().push((state.connectivity_state, connected));
        }
    }

    #[tokio::test]
    async fn connect_wakes_the_transport() {
        let sc = InternalSubchannel::new(Address::tcp("10.0.0.1:80"), default_runtime());
        // The request is remembered even if nobody is waiting yet.
        sc.connect();
        tokio::time::timeout(Duration::from_secs(5), sc.connect_requested())
            .await
            .unwrap();
        assert_eq!(sc.address(), Address::tcp("10.0.0.1:80"));
    }

    #[tokio::test]
    async fn connection_is_visible_while_ready_only() {
        let sc = InternalSubchannel::new(Address::tcp("10.0.0.1:80"), default_runtime());
        let observer = Arc::new(ConnectionObserver {
            subchannel: Arc::downgrade(&sc),
            seen: Mutex::new(Vec::new()),
        });
        sc.add_watcher(observer.clone());

        sc.set_ready(Arc::new(NoCalls));
        sc.set_state(SubchannelState::new(ConnectivityState::Idle));
        // Ready without a connection is refused.
        sc.set_state(SubchannelState::new(ConnectivityState::Ready));

        assert_eq!(
            *observer.seen.lock(),
            vec![
                (ConnectivityState::Idle, false),
                (ConnectivityState::Ready, true),
                (ConnectivityState::Idle, false),
            ]
        );
        assert_eq!(sc.state(), ConnectivityState::Idle);
    }

    #[tokio::test]
    async fn health_producer_is_shared_while_held() {
        let sc = InternalSubchannel::new(Address::tcp("10.0.0.1:80"), default_runtime());
        let p1 = sc.health_producer();
        let p2 = sc.health_producer();
        assert!(Arc::ptr_eq(&p1, &p2));
        let old = Arc::downgrade(&p1);
        drop((p1, p2));
        assert!(old.upgrade().is_none());
        // A fresh producer is created once the old one is gone.
        let _p3 = sc.health_producer();
        assert_eq!(Arc::strong_count(&_p3), 1);
    }
}
