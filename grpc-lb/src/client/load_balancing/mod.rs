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

//! The load balancing policy API and the policies built on top of it.
//!
//! The channel drives an [`LbPolicy`] serially: every method takes `&mut self`
//! together with a [`ChannelController`] through which the policy creates
//! subchannels and publishes pickers.  Policies that need to act outside of a
//! channel-initiated call ask for one through their [`WorkScheduler`].

use std::any::Any;
use std::error::Error;
use std::fmt::{Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::client::ConnectivityState;
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::rt::Runtime;
use crate::service::Request;

pub use crate::client::service_config::LbConfig;

pub mod outlier_detection;

mod registry;

#[cfg(test)]
pub(crate) mod test_utils;

pub(crate) use registry::GLOBAL_LB_REGISTRY;
pub use registry::LbPolicyRegistry;

/// A collection of data configured on the channel that is constructing this
/// LbPolicy.
pub struct LbPolicyOptions {
    /// A hook into the channel's work scheduler that allows the LbPolicy to
    /// request the ability to perform operations on the ChannelController.
    pub work_scheduler: Arc<dyn WorkScheduler>,
    /// The runtime used for the policy's timers.
    pub runtime: Arc<dyn Runtime>,
}

/// Used to asynchronously request a call into the LbPolicy's work method if
/// the LbPolicy needs to provide an update without waiting for an update
/// from the channel first.
pub trait WorkScheduler: Send + Sync {
    // Schedules a call into the LbPolicy's work method.  If there is already a
    // pending work call that has not yet started, this may not schedule another
    // call.
    fn schedule_work(&self);
}

/// A policy's configuration in its JSON form, as found in the service config.
#[derive(Debug, Clone)]
pub struct ParsedJsonLbConfig {
    pub value: serde_json::Value,
}

impl ParsedJsonLbConfig {
    pub fn from_value(value: serde_json::Value) -> Self {
        Self { value }
    }

    /// Deserializes the JSON into the policy's raw configuration type.
    pub fn convert_to<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.value)
    }
}

/// An LB policy factory that produces LbPolicy instances used by the channel
/// to manage connections and pick connections for RPCs.
pub trait LbPolicyBuilder: Send + Sync {
    /// Builds and returns a new LB policy instance.
    ///
    /// Note that build must not fail.  Any optional configuration is delivered
    /// via the LbPolicy's resolver_update method.
    ///
    /// An LbPolicy instance is assumed to begin in a Connecting state that
    /// queues RPCs until its first update.
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;

    /// Parses the JSON LB policy configuration into an internal representation.
    ///
    /// LB policies do not need to accept a configuration, in which case the
    /// default implementation returns Ok(None).
    fn parse_config(
        &self,
        _config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }
}

/// An LB policy instance.
///
/// LB policies are responsible for creating connections (modeled as
/// Subchannels) and producing Picker instances for picking connections for
/// RPCs.  A policy is shut down by dropping it.
pub trait LbPolicy: Send {
    /// Called by the channel when the name resolver produces a new set of
    /// resolved addresses or a new service config.
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Called by the channel when any subchannel created by the LB policy
    /// changes state.
    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    );

    /// Called by the channel when an RPC is attempted while the policy is
    /// Idle.
    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController);

    /// Asks the policy to reset the connection backoff of its subchannels.
    fn reset_backoff(&mut self, _channel_controller: &mut dyn ChannelController) {}

    /// Called by the channel in response to a call from the LB policy to the
    /// WorkScheduler's schedule_work method.
    fn work(&mut self, channel_controller: &mut dyn ChannelController);
}

/// Controls channel behaviors.
pub trait ChannelController: Send + Sync {
    /// Creates a new subchannel in IDLE state.
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel>;

    /// Provides a new snapshot of the LB policy's state to the channel.
    fn update_picker(&mut self, update: LbState);

    /// Signals the name resolver to attempt to re-resolve addresses.  Typically
    /// used when connections fail, indicating a possible change in the overall
    /// network configuration.
    fn request_resolution(&mut self);
}

/// Represents the current state of a Subchannel.
#[derive(Clone)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See SubChannel for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,
    // Set if connectivity state is TransientFailure to describe the most recent
    // connection error.  None for any other connectivity_state value.
    pub last_connection_error: Option<Arc<dyn Error + Send + Sync>>,
}

impl SubchannelState {
    pub fn new(connectivity_state: ConnectivityState) -> Self {
        Self {
            connectivity_state,
            last_connection_error: None,
        }
    }

    /// A TransientFailure state carrying `error` as its description.
    pub fn transient_failure(error: impl Into<String>) -> Self {
        let error: String = error.into();
        let error: Box<dyn Error + Send + Sync> = error.into();
        Self {
            connectivity_state: ConnectivityState::TransientFailure,
            last_connection_error: Some(Arc::from(error)),
        }
    }
}

impl Display for SubchannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.last_connection_error {
            Some(err) => write!(f, "{}: {}", self.connectivity_state, err),
            None => write!(f, "{}", self.connectivity_state),
        }
    }
}

impl Debug for SubchannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SubchannelState({self})")
    }
}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  A Picker is only used once for any RPC.  If pick() returns Queue,
/// the channel will queue the RPC until a new Picker is produced by the
/// LbPolicy, and will call pick() on the new Picker for the request.
///
/// Pickers are always paired with a ConnectivityState which the channel will
/// expose to applications so they can predict what might happens when
/// performing RPCs:
///
/// If the ConnectivityState is Idle, the Picker should ensure connections are
/// initiated by the LbPolicy that produced the Picker, and return a Queue
/// result so the request is attempted the next time a Picker is produced.
///
/// If the ConnectivityState is Connecting, the Picker should return a Queue
/// result and continue to wait for pending connections.
///
/// If the ConnectivityState is Ready, the Picker should return a Ready
/// Subchannel.
///
/// If the ConnectivityState is TransientFailure, the Picker should return an
/// Err with an error that describes why connections are failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function should not block.  If the Picker needs to do blocking or
    /// time-consuming work to service this request, it should return Queue, and
    /// the Pick call will be repeated by the channel when a new Picker is
    /// produced by the LbPolicy.
    fn pick(&self, request: &Request) -> PickResult;
}

pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    Pick(Pick),
    /// Indicates the LbPolicy is attempting to connect to a server to use for
    /// the request.
    Queue,
    /// Indicates that the request should fail with the included error status
    /// (with the code converted to UNAVAILABLE).  If the RPC is wait-for-ready,
    /// then it will not be terminated, but instead attempted on a new picker if
    /// one is produced before it is cancelled.
    Fail(Status),
    /// Indicates that the request should fail with the included status
    /// immediately, even if the RPC is wait-for-ready.
    Drop(Status),
}

impl Debug for PickResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pick(pick) => write!(f, "Pick({})", pick.subchannel.address()),
            Self::Queue => write!(f, "Queue"),
            Self::Fail(st) => write!(f, "Fail({st})"),
            Self::Drop(st) => write!(f, "Drop({st})"),
        }
    }
}

/// Data provided by the LB policy.
#[derive(Clone)]
pub struct LbState {
    pub connectivity_state: ConnectivityState,
    pub picker: Arc<dyn Picker>,
}

impl LbState {
    /// Returns a generic initial LbState which is Connecting and a picker which
    /// queues all picks.
    pub fn initial() -> Self {
        Self {
            connectivity_state: ConnectivityState::Connecting,
            picker: Arc::new(QueuingPicker {}),
        }
    }
}

/// Observes the lifetime of a single call made on a picked subchannel.
///
/// The channel calls `start` once the call is committed to the subchannel and
/// `finish` exactly once with the call's final status.
pub trait SubchannelCallTracker: Send + Sync {
    fn start(&self) {}
    fn finish(self: Box<Self>, status: &Status);
}

/// A collection of data used by the channel for routing a request.
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Arc<dyn Subchannel>,
    /// Metadata to be added to existing outgoing metadata.
    pub metadata: MetadataMap,
    /// Notified of the call's start and completion, if set.
    pub call_tracker: Option<Box<dyn SubchannelCallTracker>>,
}

impl Pick {
    pub fn new(subchannel: Arc<dyn Subchannel>) -> Self {
        Self {
            subchannel,
            metadata: MetadataMap::new(),
            call_tracker: None,
        }
    }
}

/// A Subchannel represents a method of communicating with a server which may be
/// connected or disconnected many times across its lifetime.
///
/// - Subchannels start IDLE.
///
/// - IDLE transitions to CONNECTING when connect() is called.
///
/// - CONNECTING transitions to READY on success or TRANSIENT_FAILURE on error.
///
/// - READY transitions to IDLE when the connection is lost.
///
/// - TRANSIENT_FAILURE transitions to CONNECTING when the reconnect backoff
///   timer has expired.  This timer scales exponentially and is reset when the
///   subchannel becomes READY.
///
/// When a Subchannel is dropped, it is disconnected, and no subsequent state
/// updates will be provided for it to the LB policy.
pub trait Subchannel: Any + Send + Sync {
    /// Returns the address of the Subchannel.
    fn address(&self) -> Address;

    /// Notifies the Subchannel to connect.
    fn connect(&self);

    /// Resets the reconnect backoff so the next connection attempt is made
    /// without delay.
    fn reset_backoff(&self) {}
}

impl Debug for dyn Subchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subchannel({})", self.address())
    }
}

impl Display for dyn Subchannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.address())
    }
}

/// A Subchannel that wraps another one and, unless overridden, forwards every
/// operation to it.  LB policies that decorate the subchannels created by
/// their children implement this trait.
pub trait ForwardingSubchannel: Any + Send + Sync {
    fn delegate(&self) -> Arc<dyn Subchannel>;

    fn address(&self) -> Address {
        self.delegate().address()
    }

    fn connect(&self) {
        self.delegate().connect()
    }

    fn reset_backoff(&self) {
        self.delegate().reset_backoff()
    }
}

impl<T: ForwardingSubchannel> Subchannel for T {
    fn address(&self) -> Address {
        ForwardingSubchannel::address(self)
    }

    fn connect(&self) {
        ForwardingSubchannel::connect(self)
    }

    fn reset_backoff(&self) {
        ForwardingSubchannel::reset_backoff(self)
    }
}

/// A non-owning handle to a Subchannel, usable as a map key.  Two handles are
/// equal iff they refer to the same Subchannel allocation.
#[derive(Clone)]
pub struct WeakSubchannel(Weak<dyn Subchannel>);

impl WeakSubchannel {
    pub fn new(subchannel: &Arc<dyn Subchannel>) -> Self {
        WeakSubchannel(Arc::downgrade(subchannel))
    }

    pub fn upgrade(&self) -> Option<Arc<dyn Subchannel>> {
        self.0.upgrade()
    }

    fn addr(&self) -> *const () {
        self.0.as_ptr() as *const ()
    }
}

impl Hash for WeakSubchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addr().hash(state);
    }
}

impl PartialEq for WeakSubchannel {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for WeakSubchannel {}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Queue
    }
}

/// Failing fails every pick with an UNAVAILABLE status carrying `error`.
pub struct Failing {
    pub error: String,
}

impl Picker for Failing {
    fn pick(&self, _request: &Request) -> PickResult {
        PickResult::Fail(Status::unavailable(self.error.clone()))
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::test_utils::{TestEvent, TestSubchannel, new_request};
    use super::{
        Failing, ForwardingSubchannel, ParsedJsonLbConfig, PickResult, Picker, Subchannel,
        SubchannelState, WeakSubchannel,
    };
    use crate::client::ConnectivityState;
    use crate::client::name_resolution::Address;

    struct Wrapper(Arc<dyn Subchannel>);

    impl ForwardingSubchannel for Wrapper {
        fn delegate(&self) -> Arc<dyn Subchannel> {
            self.0.clone()
        }
    }

    #[test]
    fn forwarding_subchannel_delegates() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let inner: Arc<dyn Subchannel> =
            Arc::new(TestSubchannel::new(Address::tcp("10.0.0.1:443"), tx));
        let wrapper: Arc<dyn Subchannel> = Arc::new(Wrapper(inner));
        assert_eq!(wrapper.address(), Address::tcp("10.0.0.1:443"));
        wrapper.connect();
        match rx.try_recv().unwrap() {
            TestEvent::Connect(addr) => assert_eq!(addr, Address::tcp("10.0.0.1:443")),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn weak_subchannel_keys_by_identity() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let a: Arc<dyn Subchannel> = Arc::new(TestSubchannel::new(Address::tcp("a:1"), tx.clone()));
        let b: Arc<dyn Subchannel> = Arc::new(TestSubchannel::new(Address::tcp("a:1"), tx));
        let mut map = HashMap::new();
        map.insert(WeakSubchannel::new(&a), 1);
        map.insert(WeakSubchannel::new(&b), 2);
        assert_eq!(map.get(&WeakSubchannel::new(&a.clone())), Some(&1));
        assert_eq!(map.get(&WeakSubchannel::new(&b)), Some(&2));

        let weak = WeakSubchannel::new(&a);
        drop(a);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn subchannel_state_display() {
        assert_eq!(SubchannelState::new(ConnectivityState::Ready).to_string(), "Ready");
        assert_eq!(
            SubchannelState::transient_failure("connection refused").to_string(),
            "TransientFailure: connection refused"
        );
    }

    #[test]
    fn failing_picker_fails_with_unavailable() {
        let picker = Failing {
            error: "all backends down".to_string(),
        };
        match picker.pick(&new_request()) {
            PickResult::Fail(status) => {
                assert_eq!(status.code(), tonic::Code::Unavailable);
                assert_eq!(status.message(), "all backends down");
            }
            other => panic!("unexpected pick result {other:?}"),
        }
    }

    #[test]
    fn parsed_json_config_converts() {
        #[derive(serde::Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Cfg {
            shuffle_address_list: bool,
        }
        let cfg = ParsedJsonLbConfig::from_value(serde_json::json!({"shuffleAddressList": true}));
        assert!(cfg.convert_to::<Cfg>().unwrap().shuffle_address_list);
        let bad = ParsedJsonLbConfig::from_value(serde_json::json!({"shuffleAddressList": 3}));
        assert!(bad.convert_to::<Cfg>().is_err());
    }
}
