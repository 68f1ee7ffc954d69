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

//! A single-flight, FIFO executor for callbacks belonging to one channel.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::rt::{BoxedTaskHandle, Runtime};

type Task = Box<dyn FnOnce() + Send>;

/// Runs submitted closures one at a time, strictly in submission order.
///
/// Closures may be submitted from any thread, including from inside a closure
/// that is currently running on the serializer; such a submission is queued
/// behind all work that is already pending and never runs re-entrantly.
///
/// The queue is drained by a single task spawned on the provided runtime.  The
/// task exits once the serializer is dropped and all pending work has run.
pub struct WorkSerializer {
    tx: mpsc::UnboundedSender<Task>,
    _drain_task: BoxedTaskHandle,
}

impl WorkSerializer {
    pub fn new(runtime: Arc<dyn Runtime>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let drain_task = runtime.spawn(Box::pin(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
        }));
        Arc::new(Self {
            tx,
            _drain_task: drain_task,
        })
    }

    /// Schedules `task` to run after all previously scheduled work.
    pub fn run(&self, task: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(task)).is_err() {
            tracing::debug!("work serializer closed; dropping task");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::sync::mpsc;

    use super::WorkSerializer;
    use crate::rt::default_runtime;

    #[tokio::test]
    async fn runs_tasks_in_submission_order() {
        let serializer = WorkSerializer::new(default_runtime());
        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..100 {
            let tx = tx.clone();
            serializer.run(move || tx.send(i).unwrap());
        }
        for want in 0..100 {
            assert_eq!(rx.recv().await.unwrap(), want);
        }
    }

    #[tokio::test]
    async fn nested_submission_runs_after_pending_work() {
        let serializer = WorkSerializer::new(default_runtime());
        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let inner_serializer = serializer.clone();
        let o = order.clone();
        let d = done_tx.clone();
        serializer.run(move || {
            o.lock().unwrap().push("outer");
            let o2 = o.clone();
            inner_serializer.run(move || {
                o2.lock().unwrap().push("nested");
                d.send(()).unwrap();
            });
            o.lock().unwrap().push("outer-end");
        });
        let o = order.clone();
        serializer.run(move || o.lock().unwrap().push("second"));

        done_rx.recv().await.unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["outer", "outer-end", "second", "nested"]
        );
    }
}
