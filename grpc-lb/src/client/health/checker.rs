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

use std::sync::{Arc, Weak};

use bytes::Bytes;
use prost::Message;
use tonic::Code;

use super::HEALTH_WATCH_METHOD;
use super::producer::{HealthProducer, WatcherEntry};
use crate::client::ConnectivityState;
use crate::client::backoff::{DEFAULT_BACKOFF_CONFIG, ExponentialBackoff};
use crate::client::load_balancing::SubchannelState;
use crate::client::subchannel::ConnectedSubchannel;
use crate::rt::{BoxedTaskHandle, Runtime};

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct HealthCheckRequest {
    #[prost(string, tag = "1")]
    pub service: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct HealthCheckResponse {
    #[prost(enumeration = "ServingStatus", tag = "1")]
    pub status: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub(crate) enum ServingStatus {
    Unknown = 0,
    Serving = 1,
    NotServing = 2,
    ServiceUnknown = 3,
}

const BACKEND_UNHEALTHY: &str = "backend unhealthy";
const RETRY_AFTER_BACKOFF: &str = "health check call failed; will retry after backoff";

/// The health of one service on one subchannel, shared by every watcher
/// asking about that service.
///
/// While the subchannel is Ready the checker runs a health stream and reports
/// what it says; otherwise it has no stream and mirrors the subchannel's
/// state.
pub(super) struct HealthChecker {
    service_name: String,
    producer: Weak<HealthProducer>,
    runtime: Arc<dyn Runtime>,
    state: Option<SubchannelState>,
    watchers: Vec<Arc<WatcherEntry>>,
    stream: Option<HealthStream>,
    next_stream_id: u64,
}

// Dropping the handle cancels the stream.
struct HealthStream {
    id: u64,
    task: BoxedTaskHandle,
}

impl Drop for HealthStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl HealthChecker {
    pub(super) fn new(
        service_name: String,
        producer: Weak<HealthProducer>,
        runtime: Arc<dyn Runtime>,
    ) -> Self {
        Self {
            service_name,
            producer,
            runtime,
            state: None,
            watchers: Vec::new(),
            stream: None,
            next_stream_id: 0,
        }
    }

    pub(super) fn add_watcher(&mut self, entry: Arc<WatcherEntry>) {
        if let Some(state) = &self.state {
            entry.notify(state.clone());
        }
        self.watchers.push(entry);
    }

    /// Returns true if no watchers remain.
    pub(super) fn remove_watcher(&mut self, entry: &Arc<WatcherEntry>) -> bool {
        self.watchers.retain(|w| !Arc::ptr_eq(w, entry));
        self.watchers.is_empty()
    }

    pub(super) fn on_subchannel_state(
        &mut self,
        state: &SubchannelState,
        connected: Option<Arc<dyn ConnectedSubchannel>>,
    ) {
        if state.connectivity_state == ConnectivityState::Ready {
            if self.stream.is_some() {
                return;
            }
            let Some(connected) = connected else {
                tracing::warn!(service = %self.service_name, "subchannel Ready without a connection");
                return;
            };
            self.set_state(SubchannelState::new(ConnectivityState::Connecting));
            self.start_stream(connected);
            return;
        }
        if self.stream.take().is_some() {
            tracing::debug!(service = %self.service_name, "subchannel left Ready; health check stream stopped");
        }
        // Shutdown is never reported; the producer is going away.
        if state.connectivity_state != ConnectivityState::Shutdown {
            self.set_state(state.clone());
        }
    }

    pub(super) fn on_stream_state(&mut self, stream_id: u64, state: SubchannelState) {
        if self.stream.as_ref().is_some_and(|s| s.id == stream_id) {
            self.set_state(state);
        }
    }

    fn set_state(&mut self, state: SubchannelState) {
        let unchanged = self.state.as_ref().is_some_and(|old| {
            old.connectivity_state == state.connectivity_state
                && old.to_string() == state.to_string()
        });
        if unchanged {
            return;
        }
        for w in &self.watchers {
            w.notify(state.clone());
        }
        self.state = Some(state);
    }

    fn start_stream(&mut self, connected: Arc<dyn ConnectedSubchannel>) {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        let ctx = StreamContext {
            producer: self.producer.clone(),
            service_name: self.service_name.clone(),
            id,
        };
        let task = self
            .runtime
            .spawn(Box::pin(run_stream(ctx, connected, self.runtime.clone())));
        self.stream = Some(HealthStream { id, task });
    }
}

struct StreamContext {
    producer: Weak<HealthProducer>,
    service_name: String,
    id: u64,
}

impl StreamContext {
    /// Returns false once nobody is listening any more.
    fn report(&self, state: SubchannelState) -> bool {
        let Some(producer) = self.producer.upgrade() else {
            return false;
        };
        producer.on_health_state(&self.service_name, self.id, state);
        true
    }
}

pub(super) fn health_state(message: &Bytes) -> SubchannelState {
    match HealthCheckResponse::decode(message.clone()) {
        Ok(response) if response.status() == ServingStatus::Serving => {
            SubchannelState::new(ConnectivityState::Ready)
        }
        Ok(_) => SubchannelState::transient_failure(BACKEND_UNHEALTHY),
        Err(e) => SubchannelState::transient_failure(format!(
            "health check response parse error: {e}"
        )),
    }
}

// Watches the service until the task is aborted, restarting the call with
// backoff whenever it fails.
async fn run_stream(
    ctx: StreamContext,
    connected: Arc<dyn ConnectedSubchannel>,
    runtime: Arc<dyn Runtime>,
) {
    let mut backoff = match ExponentialBackoff::new(DEFAULT_BACKOFF_CONFIG) {
        Ok(backoff) => backoff,
        Err(e) => {
            tracing::error!(error = %e, "invalid health check backoff config");
            return;
        }
    };
    let request = Bytes::from(
        HealthCheckRequest {
            service: ctx.service_name.clone(),
        }
        .encode_to_vec(),
    );
    loop {
        tracing::debug!(service = %ctx.service_name, "starting health check stream");
        let mut call = connected.start_streaming_call(HEALTH_WATCH_METHOD, request.clone());
        let status = loop {
            match call.message().await {
                Some(Ok(message)) => {
                    backoff.reset();
                    if !ctx.report(health_state(&message)) {
                        return;
                    }
                }
                Some(Err(status)) if status.code() == Code::Unimplemented => {
                    tracing::error!(
                        service = %ctx.service_name,
                        "health checking requested but not implemented by the server; assuming healthy"
                    );
                    ctx.report(SubchannelState::new(ConnectivityState::Ready));
                    return;
                }
                Some(Err(status)) => break status,
                None => break tonic::Status::unavailable("health check stream ended"),
            }
        };
        drop(call);
        let delay = backoff.next_delay();
        tracing::debug!(service = %ctx.service_name, %status, ?delay, "health check stream failed");
        if !ctx.report(SubchannelState::transient_failure(RETRY_AFTER_BACKOFF)) {
            return;
        }
        runtime.sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use prost::Message;

    use super::{HealthCheckResponse, ServingStatus, health_state};
    use crate::client::ConnectivityState;

    fn response(status: ServingStatus) -> Bytes {
        Bytes::from(
            HealthCheckResponse {
                status: status as i32,
            }
            .encode_to_vec(),
        )
    }

    #[test]
    fn responses_map_to_connectivity_states() {
        assert_eq!(
            health_state(&response(ServingStatus::Serving)).connectivity_state,
            ConnectivityState::Ready
        );
        for status in [
            ServingStatus::Unknown,
            ServingStatus::NotServing,
            ServingStatus::ServiceUnknown,
        ] {
            assert_eq!(
                health_state(&response(status)).to_string(),
                "TransientFailure: backend unhealthy"
            );
        }
    }

    #[test]
    fn unparseable_response_is_a_failure_with_detail() {
        let state = health_state(&Bytes::from_static(&[0xff, 0xff]));
        assert_eq!(state.connectivity_state, ConnectivityState::TransientFailure);
        assert!(
            state
                .to_string()
                .contains("health check response parse error")
        );
    }
}
