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

//! Client-side health checking, shared between all watchers of a subchannel.
//!
//! Every subchannel has at most one [`HealthProducer`].  Watchers attach to it
//! through a [`HealthWatcher`] handle, naming the health service they care
//! about.  Watchers naming the same service share a single
//! `/grpc.health.v1.Health/Watch` stream; watchers that name no service see
//! the subchannel's raw connectivity state.  Notifications are always
//! delivered on the watcher's [`WorkSerializer`].
//!
//! [`WorkSerializer`]: crate::client::work_serializer::WorkSerializer

mod checker;
mod producer;


pub use producer::{HealthProducer, HealthWatcher};

/// The method used for health check streams.
pub const HEALTH_WATCH_METHOD: &str = "/grpc.health.v1.Health/Watch";
