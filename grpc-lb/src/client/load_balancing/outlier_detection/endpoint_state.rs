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

//! Per-endpoint call accounting and ejection bookkeeping.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::subchannel::SubchannelWrapper;
use crate::client::name_resolution::Address;

/// The canonical identity of an endpoint: its set of addresses, independent
/// of the order the resolver listed them in.
pub(crate) type EndpointKey = BTreeSet<Address>;

pub(crate) type AddressMap = HashMap<Address, Arc<AddressState>>;

#[derive(Default)]
struct Bucket {
    successes: AtomicU64,
    failures: AtomicU64,
}

/// Success and failure counters for one endpoint.
///
/// Calls are recorded into the live bucket without locking.  Once per
/// interval the buckets are rotated: the live bucket becomes the backup that
/// the ejection algorithms read, and the old backup is cleared and becomes
/// live.
#[derive(Default)]
pub(crate) struct CallCounter {
    buckets: [Bucket; 2],
    live: AtomicUsize,
}

impl CallCounter {
    fn live_bucket(&self) -> &Bucket {
        &self.buckets[self.live.load(Ordering::Acquire)]
    }

    pub(crate) fn add_success(&self) {
        self.live_bucket().successes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_failure(&self) {
        self.live_bucket().failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Must not be called concurrently with itself.
    pub(crate) fn rotate(&self) {
        let next = 1 - self.live.load(Ordering::Acquire);
        let bucket = &self.buckets[next];
        bucket.successes.store(0, Ordering::Relaxed);
        bucket.failures.store(0, Ordering::Relaxed);
        self.live.store(next, Ordering::Release);
    }

    /// Returns the success rate (0 to 100) and the number of calls recorded
    /// in the backup bucket, or None if it holds no calls.
    pub(crate) fn success_rate_and_volume(&self) -> Option<(f64, u64)> {
        let backup = &self.buckets[1 - self.live.load(Ordering::Acquire)];
        let successes = backup.successes.load(Ordering::Relaxed);
        let total = successes + backup.failures.load(Ordering::Relaxed);
        if total == 0 {
            return None;
        }
        Some((successes as f64 * 100.0 / total as f64, total))
    }
}

/// Ejection state of one endpoint.
pub(crate) struct EndpointState {
    addresses: EndpointKey,
    counter: Arc<CallCounter>,
    multiplier: u32,
    // Some iff the endpoint is currently ejected.
    ejection_time: Option<Instant>,
}

impl EndpointState {
    pub(crate) fn new(addresses: EndpointKey) -> Self {
        Self {
            addresses,
            counter: Arc::default(),
            multiplier: 0,
            ejection_time: None,
        }
    }

    pub(crate) fn counter(&self) -> &Arc<CallCounter> {
        &self.counter
    }

    pub(crate) fn addresses(&self) -> &EndpointKey {
        &self.addresses
    }

    #[cfg(test)]
    pub(crate) fn multiplier(&self) -> u32 {
        self.multiplier
    }

    #[cfg(test)]
    pub(crate) fn ejection_time(&self) -> Option<Instant> {
        self.ejection_time
    }

    pub(crate) fn is_ejected(&self) -> bool {
        self.ejection_time.is_some()
    }

    /// Ejects the endpoint and returns the wrappers whose reported state
    /// changed as a result.
    pub(crate) fn eject(
        &mut self,
        now: Instant,
        address_states: &AddressMap,
    ) -> Vec<Arc<SubchannelWrapper>> {
        self.ejection_time = Some(now);
        self.multiplier += 1;
        self.cascade(true, address_states)
    }

    pub(crate) fn uneject(&mut self, address_states: &AddressMap) -> Vec<Arc<SubchannelWrapper>> {
        self.ejection_time = None;
        self.cascade(false, address_states)
    }

    /// Called once per interval.  Decays the multiplier of an endpoint that is
    /// not ejected, or unejects it once
    /// `min(base * multiplier, max(base, max_ejection_time))` has elapsed
    /// since it was ejected.
    pub(crate) fn maybe_uneject(
        &mut self,
        now: Instant,
        base_ejection_time: Duration,
        max_ejection_time: Duration,
        address_states: &AddressMap,
    ) -> Vec<Arc<SubchannelWrapper>> {
        let Some(ejected_at) = self.ejection_time else {
            self.multiplier = self.multiplier.saturating_sub(1);
            return Vec::new();
        };
        let ejected_for = base_ejection_time
            .saturating_mul(self.multiplier)
            .min(base_ejection_time.max(max_ejection_time));
        match ejected_at.checked_add(ejected_for) {
            Some(deadline) if now >= deadline => self.uneject(address_states),
            _ => Vec::new(),
        }
    }

    /// Unejects the endpoint and forgets its ejection history.  Used when the
    /// config no longer counts calls.
    pub(crate) fn disable_ejection(
        &mut self,
        address_states: &AddressMap,
    ) -> Vec<Arc<SubchannelWrapper>> {
        self.multiplier = 0;
        if self.ejection_time.is_none() {
            return Vec::new();
        }
        self.uneject(address_states)
    }

    fn cascade(&self, ejected: bool, address_states: &AddressMap) -> Vec<Arc<SubchannelWrapper>> {
        self.addresses
            .iter()
            .filter_map(|addr| address_states.get(addr))
            .flat_map(|state| state.set_ejected(ejected))
            .collect()
    }
}

/// Tracking state for one address.
///
/// Wrappers created for the address register themselves here so that
/// ejection decisions about the owning endpoint reach them.  The link to the
/// endpoint's counters is read on the pick path and is therefore behind its
/// own lock.
#[derive(Default)]
pub(crate) struct AddressState {
    counter: Mutex<Option<Arc<CallCounter>>>,
    wrappers: Mutex<WrapperSet>,
}

#[derive(Default)]
struct WrapperSet {
    ejected: bool,
    wrappers: Vec<Weak<SubchannelWrapper>>,
}

impl AddressState {
    /// The counters of the endpoint this address currently belongs to.
    pub(crate) fn counter(&self) -> Option<Arc<CallCounter>> {
        self.counter.lock().clone()
    }

    pub(crate) fn set_counter(&self, counter: Option<Arc<CallCounter>>) {
        *self.counter.lock() = counter;
    }

    pub(crate) fn is_ejected(&self) -> bool {
        self.wrappers.lock().ejected
    }

    pub(crate) fn add_wrapper(&self, wrapper: &Arc<SubchannelWrapper>) {
        self.wrappers.lock().wrappers.push(Arc::downgrade(wrapper));
    }

    /// Drops registrations of wrappers that no longer exist.
    pub(crate) fn prune_wrappers(&self) {
        self.wrappers
            .lock()
            .wrappers
            .retain(|w| w.strong_count() > 0);
    }

    #[cfg(test)]
    pub(crate) fn wrapper_count(&self) -> usize {
        self.wrappers.lock().wrappers.len()
    }

    /// Records the ejection state for the address and applies it to every
    /// live wrapper.  Returns the wrappers whose reported state changed.
    pub(crate) fn set_ejected(&self, ejected: bool) -> Vec<Arc<SubchannelWrapper>> {
        let live: Vec<_> = {
            let mut set = self.wrappers.lock();
            set.ejected = ejected;
            set.wrappers.iter().filter_map(Weak::upgrade).collect()
        };
        // The lock is released before any wrapper can be dropped here, since
        // dropping a wrapper prunes this set.
        live.into_iter()
            .filter(|wrapper| wrapper.set_ejected(ejected))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use super::{AddressMap, AddressState, CallCounter, EndpointState};
    use crate::client::name_resolution::Address;

    fn endpoint(addrs: &[&str]) -> (EndpointState, AddressMap) {
        let key: BTreeSet<Address> = addrs.iter().map(|a| Address::tcp(*a)).collect();
        let map = key
            .iter()
            .map(|a| (a.clone(), Arc::new(AddressState::default())))
            .collect();
        (EndpointState::new(key), map)
    }

    #[test]
    fn counts_land_in_backup_after_rotation() {
        let counter = CallCounter::default();
        for _ in 0..3 {
            counter.add_success();
        }
        counter.add_failure();
        assert_eq!(counter.success_rate_and_volume(), None);

        counter.rotate();
        assert_eq!(counter.success_rate_and_volume(), Some((75.0, 4)));

        // New calls go to the live bucket and do not disturb the backup.
        counter.add_failure();
        assert_eq!(counter.success_rate_and_volume(), Some((75.0, 4)));
    }

    #[test]
    fn rotating_twice_without_calls_yields_no_data() {
        let counter = CallCounter::default();
        counter.add_success();
        counter.rotate();
        assert!(counter.success_rate_and_volume().is_some());
        counter.rotate();
        assert_eq!(counter.success_rate_and_volume(), None);
        counter.rotate();
        assert_eq!(counter.success_rate_and_volume(), None);
    }

    #[test]
    fn concurrent_counting() {
        let counter = Arc::new(CallCounter::default());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if i % 2 == 0 {
                            counter.add_success();
                        } else {
                            counter.add_failure();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        counter.rotate();
        assert_eq!(counter.success_rate_and_volume(), Some((50.0, 4000)));
    }

    #[test]
    fn multiplier_grows_while_ejected_and_decays_otherwise() {
        let (mut ep, map) = endpoint(&["10.0.0.1:80"]);
        let base = Duration::from_secs(10);
        let max = Duration::from_secs(300);
        let mut now = Instant::now();

        for round in 1..=4 {
            ep.eject(now, &map);
            assert_eq!(ep.multiplier(), round);
            now += Duration::from_secs(1);
            ep.maybe_uneject(now, base, max, &map);
            assert!(ep.is_ejected());
        }

        ep.uneject(&map);
        let mut last = ep.multiplier();
        for _ in 0..6 {
            ep.maybe_uneject(now, base, max, &map);
            assert!(ep.multiplier() < last || ep.multiplier() == 0);
            last = ep.multiplier();
        }
        assert_eq!(ep.multiplier(), 0);
    }

    #[test]
    fn uneject_deadline() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(45);
        // k = 1: min(30s, 45s); k = 2: min(60s, 45s).
        for (k, want) in [(1u32, Duration::from_secs(30)), (2, Duration::from_secs(45))] {
            let (mut ep, map) = endpoint(&["10.0.0.1:80"]);
            let t0 = Instant::now();
            for _ in 0..k {
                ep.eject(t0, &map);
            }
            ep.maybe_uneject(t0 + want - Duration::from_millis(1), base, max, &map);
            assert_eq!(ep.ejection_time(), Some(t0));
            ep.maybe_uneject(t0 + want, base, max, &map);
            assert!(!ep.is_ejected());
            assert_eq!(ep.multiplier(), k);
        }
    }

    #[test]
    fn max_ejection_time_below_base_uses_base() {
        let (mut ep, map) = endpoint(&["10.0.0.1:80"]);
        let t0 = Instant::now();
        ep.eject(t0, &map);
        ep.eject(t0, &map);
        let base = Duration::from_secs(10);
        ep.maybe_uneject(t0 + Duration::from_secs(9), base, Duration::from_secs(1), &map);
        assert!(ep.is_ejected());
        ep.maybe_uneject(t0 + base, base, Duration::from_secs(1), &map);
        assert!(!ep.is_ejected());
    }

    #[test]
    fn ejection_reaches_every_address() {
        let (mut ep, map) = endpoint(&["10.0.0.1:80", "[::1]:80"]);
        ep.eject(Instant::now(), &map);
        assert!(map.values().all(|s| s.is_ejected()));
        ep.disable_ejection(&map);
        assert!(map.values().all(|s| !s.is_ejected()));
        assert_eq!(ep.multiplier(), 0);
        assert!(!ep.is_ejected());
    }
}
