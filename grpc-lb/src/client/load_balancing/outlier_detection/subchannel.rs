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

use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use super::endpoint_state::AddressState;
use crate::client::ConnectivityState;
use crate::client::load_balancing::{ForwardingSubchannel, Subchannel, SubchannelState};

/// The subchannel handed to the child policy in place of the one created by
/// the channel.
///
/// While the wrapper is ejected the child is told the subchannel is in
/// TransientFailure, whatever its real state is.  The real state is still
/// recorded so it can be restored when the wrapper is unejected.
pub(crate) struct SubchannelWrapper {
    delegate: Arc<dyn Subchannel>,
    address_state: Option<Arc<AddressState>>,
    state: Mutex<WrapperState>,
}

struct WrapperState {
    ejected: bool,
    real: SubchannelState,
}

impl SubchannelWrapper {
    /// Wraps `delegate` and registers the wrapper with `address_state`, if
    /// the address is tracked.  The wrapper starts out ejected if the address
    /// currently is.
    pub(crate) fn new(
        delegate: Arc<dyn Subchannel>,
        address_state: Option<Arc<AddressState>>,
    ) -> Arc<Self> {
        let ejected = address_state.as_ref().is_some_and(|s| s.is_ejected());
        let wrapper = Arc::new(Self {
            delegate,
            address_state,
            state: Mutex::new(WrapperState {
                ejected,
                real: SubchannelState::new(ConnectivityState::Idle),
            }),
        });
        if let Some(s) = &wrapper.address_state {
            s.add_wrapper(&wrapper);
        }
        wrapper
    }

    /// Returns the wrapper behind `subchannel`, if it is one.
    pub(crate) fn downcast(subchannel: &Arc<dyn Subchannel>) -> Option<&SubchannelWrapper> {
        let any: &dyn Any = &**subchannel;
        any.downcast_ref::<SubchannelWrapper>()
    }

    pub(crate) fn wrapped(&self) -> &Arc<dyn Subchannel> {
        &self.delegate
    }

    pub(crate) fn address_state(&self) -> Option<&Arc<AddressState>> {
        self.address_state.as_ref()
    }

    pub(crate) fn is_ejected(&self) -> bool {
        self.state.lock().ejected
    }

    /// Returns true if the state reported to the child changed.
    pub(crate) fn set_ejected(&self, ejected: bool) -> bool {
        let mut state = self.state.lock();
        let changed = state.ejected != ejected;
        state.ejected = ejected;
        changed
    }

    /// Records the real state of the subchannel.  Returns whether the child
    /// should be told about it, which is not the case while ejected.
    pub(crate) fn record_state(&self, real: &SubchannelState) -> bool {
        let mut state = self.state.lock();
        state.real = real.clone();
        !state.ejected
    }

    /// The state the child should currently see for this subchannel.
    pub(crate) fn reported_state(&self) -> SubchannelState {
        let state = self.state.lock();
        if state.ejected {
            SubchannelState::transient_failure(self.ejection_message())
        } else {
            state.real.clone()
        }
    }

    pub(crate) fn ejection_message(&self) -> String {
        format!(
            "{}: subchannel ejected by outlier detection",
            self.delegate.address().address
        )
    }
}

impl ForwardingSubchannel for SubchannelWrapper {
    fn delegate(&self) -> Arc<dyn Subchannel> {
        self.delegate.clone()
    }
}

impl Drop for SubchannelWrapper {
    fn drop(&mut self) {
        if let Some(s) = &self.address_state {
            s.prune_wrappers();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::SubchannelWrapper;
    use crate::client::ConnectivityState;
    use crate::client::load_balancing::outlier_detection::endpoint_state::AddressState;
    use crate::client::load_balancing::test_utils::TestSubchannel;
    use crate::client::load_balancing::{Subchannel, SubchannelState};
    use crate::client::name_resolution::Address;

    fn real(addr: &str) -> Arc<dyn Subchannel> {
        Arc::new(TestSubchannel::new(
            Address::tcp(addr),
            mpsc::unbounded_channel().0,
        ))
    }

    #[test]
    fn reports_transient_failure_while_ejected() {
        let wrapper = SubchannelWrapper::new(real("10.0.0.1:80"), None);
        assert!(wrapper.record_state(&SubchannelState::new(ConnectivityState::Ready)));
        assert_eq!(wrapper.reported_state().connectivity_state, ConnectivityState::Ready);

        assert!(wrapper.set_ejected(true));
        assert!(!wrapper.set_ejected(true));
        let reported = wrapper.reported_state();
        assert_eq!(reported.connectivity_state, ConnectivityState::TransientFailure);
        assert_eq!(
            reported.last_connection_error.unwrap().to_string(),
            "10.0.0.1:80: subchannel ejected by outlier detection"
        );

        // Real updates are recorded but withheld.
        assert!(!wrapper.record_state(&SubchannelState::new(ConnectivityState::Idle)));

        assert!(wrapper.set_ejected(false));
        assert_eq!(wrapper.reported_state().connectivity_state, ConnectivityState::Idle);
    }

    #[test]
    fn registers_with_address_state_until_dropped() {
        let state = Arc::new(AddressState::default());
        let w1 = SubchannelWrapper::new(real("10.0.0.1:80"), Some(state.clone()));
        let w2 = SubchannelWrapper::new(real("10.0.0.1:80"), Some(state.clone()));
        assert_eq!(state.wrapper_count(), 2);

        let changed = state.set_ejected(true);
        assert_eq!(changed.len(), 2);
        assert!(w1.is_ejected() && w2.is_ejected());

        drop(changed);
        drop(w1);
        assert_eq!(state.wrapper_count(), 1);

        // Wrappers created for an ejected address start out ejected.
        let w3 = SubchannelWrapper::new(real("10.0.0.1:80"), Some(state.clone()));
        assert!(w3.is_ejected());
        drop((w2, w3));
        assert_eq!(state.wrapper_count(), 0);
    }

    #[test]
    fn downcast_finds_wrappers_only() {
        let plain = real("10.0.0.1:80");
        assert!(SubchannelWrapper::downcast(&plain).is_none());

        let wrapped: Arc<dyn Subchannel> = SubchannelWrapper::new(plain.clone(), None);
        let found = SubchannelWrapper::downcast(&wrapped).unwrap();
        assert!(Arc::ptr_eq(found.wrapped(), &plain));
        assert_eq!(wrapped.address(), Address::tcp("10.0.0.1:80"));
    }
}
