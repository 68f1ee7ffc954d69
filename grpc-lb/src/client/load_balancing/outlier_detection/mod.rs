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

//! The outlier detection LB policy.
//!
//! Outlier detection sits between the channel and a child policy.  It counts
//! the outcome of every call made on the subchannels the child picks, and
//! once per interval ejects endpoints whose success rate is an outlier among
//! their peers, or whose failure percentage exceeds a fixed threshold.  An
//! ejected endpoint's subchannels are reported to the child as
//! TransientFailure until the ejection expires, so the child stops picking
//! them without any connection being closed.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once, Weak};

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::client::load_balancing::{
    ChannelController, GLOBAL_LB_REGISTRY, LbConfig, LbPolicy, LbPolicyBuilder, LbPolicyOptions,
    LbState, ParsedJsonLbConfig, Subchannel, SubchannelState, WeakSubchannel, WorkScheduler,
};
use crate::client::name_resolution::{Address, Endpoint, ResolverUpdate};
use crate::rt::Runtime;

mod config;
mod ejection;
mod endpoint_state;
mod picker;
mod subchannel;


pub use config::{
    ConfigError, FailurePercentageEjection, FieldError, OutlierDetectionConfig,
    SuccessRateEjection,
};

use ejection::{EjectionTimer, run_ejection_round};
use endpoint_state::{AddressMap, AddressState, EndpointKey, EndpointState};
use picker::OutlierDetectionPicker;
use subchannel::SubchannelWrapper;

pub static POLICY_NAME: &str = "outlier_detection_experimental";

/// An endpoint attribute that exempts the endpoint from outlier detection:
/// its calls are not counted and it is never ejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisableOutlierDetection;

struct Builder {}

impl LbPolicyBuilder for Builder {
    fn build(&self, options: LbPolicyOptions) -> Box<dyn LbPolicy> {
        Box::new(OutlierDetectionPolicy::new(options, StdRng::from_os_rng()))
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }

    fn parse_config(
        &self,
        config: &ParsedJsonLbConfig,
    ) -> Result<Option<LbConfig>, Box<dyn Error + Send + Sync>> {
        let cfg = OutlierDetectionConfig::from_json(config, &GLOBAL_LB_REGISTRY)?;
        Ok(Some(LbConfig::new(cfg)))
    }
}

/// Registers the outlier detection policy in the global registry.
pub fn reg() {
    static REGISTER_ONCE: Once = Once::new();
    REGISTER_ONCE.call_once(|| {
        GLOBAL_LB_REGISTRY.add_builder(Builder {});
    });
}

pub(crate) struct OutlierDetectionPolicy {
    work_scheduler: Arc<dyn WorkScheduler>,
    runtime: Arc<dyn Runtime>,
    child_work: Arc<ChildWorkScheduler>,
    config: Option<Arc<OutlierDetectionConfig>>,
    child: Option<Box<dyn LbPolicy>>,
    child_name: &'static str,
    // Last state published by the child, republished with a wrapping picker.
    child_state: Option<LbState>,
    picker_dirty: bool,
    tracking: Tracking,
    timer: Option<EjectionTimer>,
    rng: StdRng,
}

/// The endpoint and address maps, plus the wrapper created for each
/// subchannel, keyed by the subchannel the channel created.
#[derive(Default)]
struct Tracking {
    endpoints: BTreeMap<EndpointKey, EndpointState>,
    addresses: AddressMap,
    // States of addresses no longer tracked, still held by wrappers the
    // child kept.  Reused if the address is tracked again.
    retired: HashMap<Address, Weak<AddressState>>,
    wrappers: HashMap<WeakSubchannel, Weak<SubchannelWrapper>>,
}

impl OutlierDetectionPolicy {
    pub(crate) fn new(options: LbPolicyOptions, rng: StdRng) -> Self {
        let child_work = Arc::new(ChildWorkScheduler {
            parent: options.work_scheduler.clone(),
            pending: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        });
        Self {
            work_scheduler: options.work_scheduler,
            runtime: options.runtime,
            child_work,
            config: None,
            child: None,
            child_name: "",
            child_state: None,
            picker_dirty: false,
            tracking: Tracking::default(),
            timer: None,
            rng,
        }
    }

    fn counting_enabled(&self) -> bool {
        self.config.as_ref().is_some_and(|c| c.counting_enabled())
    }

    // Starts the timer when counting gets enabled, stops it when counting gets
    // disabled, and restarts it from its original start time when the
    // interval changes.
    fn update_timer(&mut self, old: Option<&OutlierDetectionConfig>, new: &OutlierDetectionConfig) {
        if !new.counting_enabled() {
            if self.timer.take().is_some() {
                tracing::debug!("ejection timer cancelled");
            }
            return;
        }
        let start_time = match &self.timer {
            None => self.runtime.now(),
            Some(timer) if old.is_some_and(|old| old.interval != new.interval) => {
                timer.start_time()
            }
            Some(_) => return,
        };
        self.timer = Some(EjectionTimer::new(
            &self.runtime,
            self.work_scheduler.clone(),
            start_time,
            new.interval,
        ));
    }

    fn maybe_rebuild_child(&mut self, config: &OutlierDetectionConfig) {
        if self.child.is_some() && self.child_name == config.child_policy_name() {
            return;
        }
        if self.child.is_some() {
            tracing::info!(
                from = self.child_name,
                to = config.child_policy_name(),
                "switching child policy"
            );
        }
        self.child_name = config.child_policy_name();
        self.child_state = None;
        self.child = Some(config.child_policy.build(LbPolicyOptions {
            work_scheduler: self.child_work.clone(),
            runtime: self.runtime.clone(),
        }));
    }

    /// Runs `f` against the child, handing it a controller that wraps the
    /// subchannels it creates and captures the pickers it publishes.
    fn call_child<R>(
        &mut self,
        channel_controller: &mut dyn ChannelController,
        f: impl FnOnce(&mut dyn LbPolicy, &mut dyn ChannelController) -> R,
    ) -> Option<R> {
        let child = self.child.as_mut()?;
        let mut helper = Helper {
            channel_controller,
            addresses: &self.tracking.addresses,
            wrappers: &mut self.tracking.wrappers,
            picker_update: None,
        };
        let result = f(child.as_mut(), &mut helper);
        if let Some(update) = helper.picker_update {
            self.child_state = Some(update);
            self.picker_dirty = true;
        }
        Some(result)
    }

    /// Tells the child about wrappers whose reported state changed.
    fn notify_child(
        &mut self,
        changed: Vec<Arc<SubchannelWrapper>>,
        channel_controller: &mut dyn ChannelController,
    ) {
        if changed.is_empty() {
            return;
        }
        self.call_child(channel_controller, |child, helper| {
            for wrapper in changed {
                let state = wrapper.reported_state();
                let subchannel: Arc<dyn Subchannel> = wrapper;
                child.subchannel_update(subchannel, &state, helper);
            }
        });
    }

    fn flush_picker(&mut self, channel_controller: &mut dyn ChannelController) {
        if !std::mem::take(&mut self.picker_dirty) {
            return;
        }
        let Some(state) = &self.child_state else {
            return;
        };
        channel_controller.update_picker(LbState {
            connectivity_state: state.connectivity_state,
            picker: Arc::new(OutlierDetectionPicker::new(
                state.picker.clone(),
                self.counting_enabled(),
            )),
        });
    }

    fn on_timer(&mut self, channel_controller: &mut dyn ChannelController) {
        let Some(config) = self.config.clone() else {
            return;
        };
        let now = self.runtime.now();
        let changed = run_ejection_round(
            &mut self.tracking.endpoints,
            &self.tracking.addresses,
            &config,
            now,
            &mut self.rng,
        );
        self.timer = Some(EjectionTimer::new(
            &self.runtime,
            self.work_scheduler.clone(),
            now,
            config.interval,
        ));
        self.notify_child(changed, channel_controller);
    }
}

impl LbPolicy for OutlierDetectionPolicy {
    fn resolver_update(
        &mut self,
        update: ResolverUpdate,
        config: Option<&LbConfig>,
        channel_controller: &mut dyn ChannelController,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let Some(config) = config.and_then(|c| c.convert_to::<OutlierDetectionConfig>()) else {
            return Err(format!("{POLICY_NAME}: missing or invalid LB policy config").into());
        };
        tracing::debug!(config = ?config, "received config");
        let old = self.config.replace(config.clone());
        self.update_timer(old.as_deref(), &config);

        let changed = match &update.endpoints {
            Ok(endpoints) => self
                .tracking
                .reconcile(endpoints, config.counting_enabled()),
            Err(e) => {
                tracing::debug!(error = %e, "resolver error; keeping tracked endpoints");
                Vec::new()
            }
        };

        // Changed wrappers belong to the current child, which a policy switch
        // is about to replace.
        self.notify_child(changed, channel_controller);
        self.maybe_rebuild_child(&config);
        let result = self
            .call_child(channel_controller, |child, helper| {
                child.resolver_update(update, config.child_config.as_ref(), helper)
            })
            .unwrap_or(Ok(()));

        // Counting may have been switched on or off.
        self.picker_dirty |= self.child_state.is_some();
        self.flush_picker(channel_controller);
        result
    }

    fn subchannel_update(
        &mut self,
        subchannel: Arc<dyn Subchannel>,
        state: &SubchannelState,
        channel_controller: &mut dyn ChannelController,
    ) {
        let key = WeakSubchannel::new(&subchannel);
        let Some(wrapper) = self.tracking.wrappers.get(&key).and_then(Weak::upgrade) else {
            tracing::debug!(subchannel = %subchannel, "ignoring update for unknown subchannel");
            self.tracking.wrappers.remove(&key);
            return;
        };
        if !wrapper.record_state(state) {
            return;
        }
        let wrapper: Arc<dyn Subchannel> = wrapper;
        self.call_child(channel_controller, |child, helper| {
            child.subchannel_update(wrapper, state, helper)
        });
        self.flush_picker(channel_controller);
    }

    fn exit_idle(&mut self, channel_controller: &mut dyn ChannelController) {
        self.call_child(channel_controller, |child, helper| child.exit_idle(helper));
        self.flush_picker(channel_controller);
    }

    fn reset_backoff(&mut self, channel_controller: &mut dyn ChannelController) {
        self.call_child(channel_controller, |child, helper| child.reset_backoff(helper));
        self.flush_picker(channel_controller);
    }

    fn work(&mut self, channel_controller: &mut dyn ChannelController) {
        if self.timer.as_ref().is_some_and(|t| t.take_fired()) {
            self.on_timer(channel_controller);
        }
        if self.child_work.pending.swap(false, Ordering::AcqRel) {
            self.call_child(channel_controller, |child, helper| child.work(helper));
        }
        self.flush_picker(channel_controller);
    }
}

impl Drop for OutlierDetectionPolicy {
    fn drop(&mut self) {
        self.child_work.shut_down.store(true, Ordering::Release);
        tracing::debug!("outlier detection policy shut down");
    }
}

impl Tracking {
    /// Brings the endpoint and address maps in line with `endpoints`.  Known
    /// endpoints keep their state; new ones start with fresh counters; those
    /// that disappeared are forgotten, addresses first.
    ///
    /// Returns the wrappers whose reported state changed.
    fn reconcile(
        &mut self,
        endpoints: &[Endpoint],
        counting_enabled: bool,
    ) -> Vec<Arc<SubchannelWrapper>> {
        let mut changed = Vec::new();
        let mut seen_endpoints = HashSet::new();
        let mut seen_addresses: HashSet<Address> = HashSet::new();
        for endpoint in endpoints {
            if endpoint.addresses.is_empty()
                || endpoint
                    .attributes
                    .get::<DisableOutlierDetection>()
                    .is_some()
            {
                continue;
            }
            let key: EndpointKey = endpoint.addresses.iter().cloned().collect();
            seen_addresses.extend(key.iter().cloned());
            match self.endpoints.get_mut(&key) {
                Some(ep) => {
                    if !counting_enabled {
                        changed.extend(ep.disable_ejection(&self.addresses));
                    }
                }
                None => {
                    let ep = EndpointState::new(key.clone());
                    for addr in &key {
                        let retired = &mut self.retired;
                        let state = self.addresses.entry(addr.clone()).or_insert_with(|| {
                            retired
                                .remove(addr)
                                .and_then(|state| state.upgrade())
                                .unwrap_or_default()
                        });
                        state.set_counter(Some(ep.counter().clone()));
                        // The address may have belonged to an ejected endpoint.
                        changed.extend(state.set_ejected(false));
                    }
                    tracing::debug!(endpoint = ?key, "tracking endpoint");
                    self.endpoints.insert(key.clone(), ep);
                }
            }
            seen_endpoints.insert(key);
        }

        self.addresses.retain(|addr, state| {
            if seen_addresses.contains(addr) {
                return true;
            }
            state.set_counter(None);
            changed.extend(state.set_ejected(false));
            self.retired.insert(addr.clone(), Arc::downgrade(state));
            false
        });
        self.retired.retain(|_, state| state.strong_count() > 0);
        self.endpoints.retain(|key, _| {
            let keep = seen_endpoints.contains(key);
            if !keep {
                tracing::debug!(endpoint = ?key, "no longer tracking endpoint");
            }
            keep
        });
        self.wrappers.retain(|_, w| w.strong_count() > 0);
        changed
    }
}

/// The ChannelController handed to the child policy.
struct Helper<'a> {
    channel_controller: &'a mut dyn ChannelController,
    addresses: &'a AddressMap,
    wrappers: &'a mut HashMap<WeakSubchannel, Weak<SubchannelWrapper>>,
    picker_update: Option<LbState>,
}

impl ChannelController for Helper<'_> {
    fn new_subchannel(&mut self, address: &Address) -> Arc<dyn Subchannel> {
        let subchannel = self.channel_controller.new_subchannel(address);
        let wrapper = SubchannelWrapper::new(subchannel.clone(), self.addresses.get(address).cloned());
        self.wrappers
            .insert(WeakSubchannel::new(&subchannel), Arc::downgrade(&wrapper));
        wrapper
    }

    fn update_picker(&mut self, update: LbState) {
        self.picker_update = Some(update);
    }

    fn request_resolution(&mut self) {
        self.channel_controller.request_resolution();
    }
}

/// The WorkScheduler handed to the child policy.  Requests are recorded so
/// that the next `work` call is forwarded to the child, and are dropped once
/// the policy has shut down.
struct ChildWorkScheduler {
    parent: Arc<dyn WorkScheduler>,
    pending: AtomicBool,
    shut_down: AtomicBool,
}

impl WorkScheduler for ChildWorkScheduler {
    fn schedule_work(&self) {
        if self.shut_down.load(Ordering::Acquire) {
            return;
        }
        self.pending.store(true, Ordering::Release);
        self.parent.schedule_work();
    }
}
