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
use std::error::Error;
use std::fmt::Debug;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::load_balancing::{
    ChannelController, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions, LbState,
    ParsedJsonLbConfig, Subchannel, SubchannelState, WorkScheduler,
};
use crate::client::name_resolution::{Address, ResolverUpdate};
use crate::service::Request;

pub(crate) fn new_request() -> Request {
    Request::new(())
}

// A test subchannel that forwards connect calls to a channel.
// This allows tests to verify when a subchannel is asked to connect.
pub(crate) struct TestSubchannel {
    address: Address,
    tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl TestSubchannel {
    pub fn new(address: Address, tx_events: mpsc::UnboundedSender<TestEvent>) -> Self {
        Self { address, tx_events }
    }
}

impl Subchannel for TestSubchannel {
    fn address(&self) -> Address {
        self.address.clone()
    }

    fn connect(&self) {
        let _ = self.tx_events.send(TestEvent::Connect(self.address.clone()));
    }

    fn reset_backoff(&self) {
        let _ = self
            .tx_events
            .send(TestEvent::ResetBackoff(self.address.clone()));
    }
}

pub(crate) enum TestEvent {
    NewSubchannel(Arc<dyn Subchannel>),
    UpdatePicker(LbState),
    RequestResolution,
    Connect(Address),
    ResetBackoff(Address),
    ScheduleWork,
}

impl Debug for TestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NewSubchannel(sc) => write!(f, "NewSubchannel({})", sc.address()),
            Self::UpdatePicker(state) => write!(f, "UpdatePicker({})", state.connectivity_state),
            Self::RequestResolution => write!(f, "RequestResolution"),
            Self::Connect(addr) => write!(f, "Connect({addr})"),
            Self::ResetBackoff(addr) => write!(f, "ResetBackoff({addr})"),
            Self::ScheduleWork => write!(f, "ScheduleWork"),
        }
    }
}

/// A test channel controller that forwards calls to a channel.  This allows
/// tests to verify when a channel controller is asked to create subchannels or
/// update the picker.
pub(crate) struct TestChannelController {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl ChannelController for TestChannelController {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel: Arc<dyn Subchannel> =
            Arc::new(TestSubchannel::new(address.clone(), self.tx_events.clone()));
        self.tx_events
            .send(TestEvent::NewSubchannel(subchannel.clone()))
            .unwrap();
        subchannel
    }

    fn update_picker(&mut self, update: LbState) {
        self.tx_events
            .send(TestEvent::UpdatePicker(update))
            .unwrap();
    }

    fn request_resolution(&mut self) {
        self.tx_events.send(TestEvent::RequestResolution).unwrap();
    }
}

pub(crate) struct TestWorkScheduler {
    pub(crate) tx_events: mpsc::UnboundedSender<TestEvent>,
}

impl WorkScheduler for TestWorkScheduler {
    fn schedule_work(&self) {
        let _ = self.tx_events.send(TestEvent::ScheduleWork);
    }
}

type ResolverUpdateFn = dyn Fn(
        &mut Data,
        ResolverUpdate,
        Option<&LbConfig>,
        &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>>
    + Send
    + Sync;

type SubchannelUpdateFn =
    dyn Fn(&mut Data, Arc<dyn Subchannel>, &SubchannelState, &mut dyn ChannelController)
        + Send
        + Sync;

type ControllerFn = dyn Fn(&mut Data, &mut dyn ChannelController) + Send + Sync;

/// This struct holds `LbPolicy` trait stub functions that tests are expected
/// to implement.
#[derive(Clone, Default)]
pub(crate) struct PolicyFuncs {
    pub resolver_update: Option<Arc<ResolverUpdateFn>>,
    pub subchannel_update: Option<Arc<SubchannelUpdateFn>>,
    pub exit_idle: Option<Arc<ControllerFn>>,
    pub reset_backoff: Option<Arc<ControllerFn>>,
    pub work: Option<Arc<ControllerFn>>,
}

/// Data holds test data that will be passed all to functions in PolicyFuncs
#[derive(Default)]
pub(crate) struct Data {
    pub test_data: Option<Box<dyn Any + Send + Sync>>,
    /// The work scheduler the policy was built with.
    pub work_scheduler: Option<Arc<dyn WorkScheduler>>,
}

/// The stub `LbPolicy` that calls the provided functions.
pub(crate) struct StubPolicy {
    funcs: PolicyFuncs,
    data: Data,
}

impl LbPolicy for StubPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(f) = &self.funcs.resolver_update {
            return f(&mut self.data, update, config, channel_controller);
        }
        Ok(())
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        if let Some(f) = &self.funcs.subchannel_update {
            f(&mut self.data, subchannel, state, channel_controller);
        }
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(f) = &self.funcs.exit_idle {
            f(&mut self.data, channel_controller);
        }
    }

    fn reset_backoff(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(f) = &self.funcs.reset_backoff {
            f(&mut self.data, channel_controller);
        }
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        if let Some(f) = &self.funcs.work {
            f(&mut self.data, channel_controller);
        }
    }
}

/// This StubPolicyBuilder builds a StubPolicy.
pub(crate) struct StubPolicyBuilder {
    name: &'static str,
    funcs: PolicyFuncs,
}

impl StubPolicyBuilder {
    pub fn new(name: &'static str, funcs: PolicyFuncs) -> Self {
        Self { name, funcs }
    }
}

/// The config a StubPolicy accepts: any JSON object, kept verbatim.
#[derive(Debug)]
pub(crate) struct StubConfig(pub serde_json::Value);

impl LbPolicyBuilder for StubPolicyBuilder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(StubPolicy {
            funcs: self.funcs.clone(),
            data: Data {
                test_data: None,
                work_scheduler: Some(options.work_scheduler),
            },
        })
    }

    fn name(&self) -> &'static str {
        self.name
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        if !config.value.is_object() {
            return Err(format!("{}: config must be an object", self.name).into());
        }
        Ok(Some(LbConfig::new(StubConfig(config.value.clone()))))
    }
}
