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

use std::sync::Arc;

use tonic::{Code, Status};

use super::endpoint_state::CallCounter;
use super::subchannel::SubchannelWrapper;
use crate::client::load_balancing::{PickResult, Picker, SubchannelCallTracker};
use crate::service::Request;

/// Wraps the child policy's picker.  Picks are routed exactly as the child
/// decides; the wrapper only swaps the channel's subchannel back in and, when
/// counting, attaches a tracker that records the call's outcome against the
/// picked endpoint.
pub(crate) struct OutlierDetectionPicker {
    child: Arc<dyn Picker>,
    counting_enabled: bool,
}

impl OutlierDetectionPicker {
    pub(crate) fn new(child: Arc<dyn Picker>, counting_enabled: bool) -> Self {
        Self {
            child,
            counting_enabled,
        }
    }
}

impl Picker for OutlierDetectionPicker {
    fn pick(&self, request: &Request) -> PickResult {
        let mut pick = match self.child.pick(request) {
            PickResult::Pick(pick) => pick,
            other => return other,
        };
        let Some(wrapper) = SubchannelWrapper::downcast(&pick.subchannel) else {
            return PickResult::Pick(pick);
        };
        // The child may not have seen the ejection yet.
        if wrapper.is_ejected() {
            return PickResult::Fail(Status::unavailable(wrapper.ejection_message()));
        }
        let counter = self
            .counting_enabled
            .then(|| wrapper.address_state().and_then(|s| s.counter()))
            .flatten();
        let real = wrapper.wrapped().clone();
        pick.subchannel = real;
        if let Some(counter) = counter {
            pick.call_tracker = Some(Box::new(OutcomeRecorder {
                inner: pick.call_tracker.take(),
                counter,
            }));
        }
        PickResult::Pick(pick)
    }
}

/// Records the outcome of one call, after notifying the tracker installed by
/// the child, if any.
struct OutcomeRecorder {
    inner: Option<Box<dyn SubchannelCallTracker>>,
    counter: Arc<CallCounter>,
}

impl SubchannelCallTracker for OutcomeRecorder {
    fn start(&self) {
        if let Some(inner) = &self.inner {
            inner.start();
        }
    }

    fn finish(self: Box<Self>, status: &Status) {
        let OutcomeRecorder { inner, counter } = *self;
        if let Some(inner) = inner {
            inner.finish(status);
        }
        if status.code() == Code::Ok {
            counter.add_success();
        } else {
            counter.add_failure();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::mpsc;
    use tonic::{Code, Status};

    use super::OutlierDetectionPicker;
    use crate::client::load_balancing::outlier_detection::endpoint_state::{
        AddressState, CallCounter,
    };
    use crate::client::load_balancing::outlier_detection::subchannel::SubchannelWrapper;
    use crate::client::load_balancing::test_utils::{TestSubchannel, new_request};
    use crate::client::load_balancing::{
        Pick, PickResult, Picker, Subchannel, SubchannelCallTracker,
    };
    use crate::client::name_resolution::Address;

    struct FixedPicker(Arc<dyn Subchannel>, Arc<AtomicUsize>);

    impl Picker for FixedPicker {
        fn pick(&self, _request: &crate::service::Request) -> PickResult {
            let mut pick = Pick::new(self.0.clone());
            pick.call_tracker = Some(Box::new(CountingTracker(self.1.clone())));
            PickResult::Pick(pick)
        }
    }

    struct CountingTracker(Arc<AtomicUsize>);

    impl SubchannelCallTracker for CountingTracker {
        fn finish(self: Box<Self>, _status: &Status) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        real: Arc<dyn Subchannel>,
        wrapper: Arc<SubchannelWrapper>,
        counter: Arc<CallCounter>,
        finished: Arc<AtomicUsize>,
        picker: OutlierDetectionPicker,
    }

    fn setup(counting: bool) -> Fixture {
        let real: Arc<dyn Subchannel> = Arc::new(TestSubchannel::new(
            Address::tcp("10.0.0.1:80"),
            mpsc::unbounded_channel().0,
        ));
        let state = Arc::new(AddressState::default());
        let counter = Arc::new(CallCounter::default());
        state.set_counter(Some(counter.clone()));
        let wrapper = SubchannelWrapper::new(real.clone(), Some(state));
        let finished = Arc::new(AtomicUsize::new(0));
        let picker = OutlierDetectionPicker::new(
            Arc::new(FixedPicker(wrapper.clone(), finished.clone())),
            counting,
        );
        Fixture {
            real,
            wrapper,
            counter,
            finished,
            picker,
        }
    }

    fn pick(picker: &OutlierDetectionPicker) -> Pick {
        match picker.pick(&new_request()) {
            PickResult::Pick(pick) => pick,
            other => panic!("unexpected pick result {other:?}"),
        }
    }

    #[test]
    fn unwraps_subchannel_and_counts_each_call_once() {
        let Fixture {
            real,
            counter,
            finished,
            picker,
            ..
        } = setup(true);

        let p = pick(&picker);
        assert!(Arc::ptr_eq(&p.subchannel, &real));
        let tracker = p.call_tracker.unwrap();
        tracker.start();
        tracker.finish(&Status::new(Code::Ok, ""));

        let p = pick(&picker);
        p.call_tracker.unwrap().finish(&Status::unavailable("reset"));

        let p = pick(&picker);
        p.call_tracker.unwrap().finish(&Status::internal("boom"));

        assert_eq!(finished.load(Ordering::SeqCst), 3);
        counter.rotate();
        let (rate, volume) = counter.success_rate_and_volume().unwrap();
        assert_eq!(volume, 3);
        assert!((rate - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn leaves_child_tracker_alone_when_not_counting() {
        let Fixture {
            real,
            counter,
            finished,
            picker,
            ..
        } = setup(false);
        let p = pick(&picker);
        assert!(Arc::ptr_eq(&p.subchannel, &real));
        p.call_tracker.unwrap().finish(&Status::new(Code::Ok, ""));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        counter.rotate();
        assert_eq!(counter.success_rate_and_volume(), None);
    }

    #[test]
    fn ejected_subchannel_fails_fast() {
        let Fixture {
            wrapper, picker, ..
        } = setup(true);
        wrapper.set_ejected(true);
        match picker.pick(&new_request()) {
            PickResult::Fail(status) => {
                assert_eq!(status.code(), Code::Unavailable);
                assert!(status.message().contains("subchannel ejected by outlier detection"));
                assert!(status.message().contains("10.0.0.1:80"));
            }
            other => panic!("unexpected pick result {other:?}"),
        }
    }

    #[test]
    fn passes_through_non_pick_results() {
        struct Queue;
        impl Picker for Queue {
            fn pick(&self, _request: &crate::service::Request) -> PickResult {
                PickResult::Queue
            }
        }
        let picker = OutlierDetectionPicker::new(Arc::new(Queue), true);
        assert!(matches!(picker.pick(&new_request()), PickResult::Queue));
    }
}
