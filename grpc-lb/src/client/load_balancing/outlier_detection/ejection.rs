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

//! The periodic ejection timer and the two ejection algorithms it runs.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;

use super::config::OutlierDetectionConfig;
use super::endpoint_state::{AddressMap, EndpointKey, EndpointState};
use super::subchannel::SubchannelWrapper;
use crate::client::load_balancing::WorkScheduler;
use crate::rt::{BoxedTaskHandle, Runtime};

/// Fires once, `interval` after `start_time`, by requesting a call to the
/// policy's `work` method.  Dropping the timer cancels it.
pub(crate) struct EjectionTimer {
    start_time: Instant,
    fired: Arc<AtomicBool>,
    task: BoxedTaskHandle,
}

impl EjectionTimer {
    pub(crate) fn new(
        runtime: &Arc<dyn Runtime>,
        work_scheduler: Arc<dyn WorkScheduler>,
        start_time: Instant,
        interval: Duration,
    ) -> Self {
        // A deadline that already passed fires right away.
        let delay = start_time
            .checked_add(interval)
            .map_or(interval, |deadline| deadline.saturating_duration_since(runtime.now()));
        let fired = Arc::new(AtomicBool::new(false));
        let task = {
            let rt = runtime.clone();
            let fired = fired.clone();
            runtime.spawn(Box::pin(async move {
                rt.sleep(delay).await;
                fired.store(true, Ordering::Release);
                work_scheduler.schedule_work();
            }))
        };
        tracing::debug!(?delay, "ejection timer started");
        Self {
            start_time,
            fired,
            task,
        }
    }

    pub(crate) fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Returns true once after the timer fires.
    pub(crate) fn take_fired(&self) -> bool {
        self.fired.swap(false, Ordering::AcqRel)
    }
}

impl Drop for EjectionTimer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The success rate below which a candidate is an outlier:
/// `mean - stdev * (stdev_factor / 1000)`, using the population standard
/// deviation.
pub(crate) fn success_rate_threshold(rates: &[f64], stdev_factor: u32) -> f64 {
    let n = rates.len() as f64;
    let mean = rates.iter().sum::<f64>() / n;
    let variance = rates.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / n;
    mean - variance.sqrt() * (f64::from(stdev_factor) / 1000.0)
}

// The first ejection of a round is never blocked by the cap.
fn below_cap(ejected: usize, total: usize, max_ejection_percent: u32) -> bool {
    ejected == 0 || (100.0 * ejected as f64 / total as f64) < f64::from(max_ejection_percent)
}

/// Runs one evaluation round over every tracked endpoint: rotates the call
/// counters, ejects outliers by success rate and then by failure percentage,
/// and releases endpoints whose ejection has expired.
///
/// Returns the wrappers whose reported state changed.
pub(crate) fn run_ejection_round(
    endpoints: &mut BTreeMap<EndpointKey, EndpointState>,
    address_states: &AddressMap,
    config: &OutlierDetectionConfig,
    now: Instant,
    rng: &mut impl Rng,
) -> Vec<Arc<SubchannelWrapper>> {
    let mut eps: Vec<&mut EndpointState> = endpoints.values_mut().collect();
    let total = eps.len();
    let mut ejected = 0;
    let mut success_rate_candidates = Vec::new();
    let mut failure_percentage_candidates = Vec::new();
    for (i, ep) in eps.iter().enumerate() {
        ep.counter().rotate();
        if ep.is_ejected() {
            ejected += 1;
        }
        let Some((rate, volume)) = ep.counter().success_rate_and_volume() else {
            continue;
        };
        if let Some(sr) = &config.success_rate_ejection {
            if volume >= u64::from(sr.request_volume) {
                success_rate_candidates.push((i, rate));
            }
        }
        if let Some(fp) = &config.failure_percentage_ejection {
            if volume >= u64::from(fp.request_volume) {
                failure_percentage_candidates.push((i, rate));
            }
        }
    }

    let mut changed = Vec::new();

    if let Some(sr) = &config.success_rate_ejection {
        if !success_rate_candidates.is_empty()
            && success_rate_candidates.len() >= sr.minimum_hosts as usize
        {
            let rates: Vec<f64> = success_rate_candidates.iter().map(|(_, r)| *r).collect();
            let threshold = success_rate_threshold(&rates, sr.stdev_factor);
            tracing::debug!(threshold, candidates = rates.len(), "success rate ejection");
            for &(i, rate) in &success_rate_candidates {
                if rate >= threshold {
                    continue;
                }
                let roll: u32 = rng.random_range(1..100);
                if roll < sr.enforcement_percentage
                    && below_cap(ejected, total, config.max_ejection_percent)
                {
                    tracing::info!(endpoint = ?eps[i].addresses(), rate, threshold, "ejecting endpoint by success rate");
                    changed.extend(eps[i].eject(now, address_states));
                    ejected += 1;
                }
            }
        }
    }

    if let Some(fp) = &config.failure_percentage_ejection {
        if !failure_percentage_candidates.is_empty()
            && failure_percentage_candidates.len() >= fp.minimum_hosts as usize
        {
            for &(i, rate) in &failure_percentage_candidates {
                if eps[i].is_ejected() {
                    continue;
                }
                if 100.0 - rate <= f64::from(fp.threshold) {
                    continue;
                }
                let roll: u32 = rng.random_range(1..100);
                if roll < fp.enforcement_percentage
                    && below_cap(ejected, total, config.max_ejection_percent)
                {
                    tracing::info!(endpoint = ?eps[i].addresses(), failure_percentage = 100.0 - rate, "ejecting endpoint by failure percentage");
                    changed.extend(eps[i].eject(now, address_states));
                    ejected += 1;
                }
            }
        }
    }

    for ep in eps.iter_mut() {
        let was_ejected = ep.is_ejected();
        changed.extend(ep.maybe_uneject(
            now,
            config.base_ejection_time,
            config.max_ejection_time,
            address_states,
        ));
        if was_ejected && !ep.is_ejected() {
            tracing::info!(endpoint = ?ep.addresses(), "unejecting endpoint");
        }
    }
    changed
}
