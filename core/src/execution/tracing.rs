// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! Chrome trace format events for the shuffle write path.
//!
//! Events are only recorded when the crate is built with the `tracing` feature and the writer
//! was configured with tracing enabled. They are emitted through the `log` facade under the
//! `shuffle_trace` target so the configured log4rs appenders decide where they land.
//! See https://github.com/catapult-project/catapult/blob/main/tracing/README.md

#[cfg(feature = "tracing")]
use datafusion::common::instant::Instant;
#[cfg(feature = "tracing")]
use once_cell::sync::Lazy;

#[cfg(feature = "tracing")]
static RECORDER: Lazy<Recorder> = Lazy::new(Recorder::new);

#[cfg(feature = "tracing")]
struct Recorder {
    now: Instant,
}

#[cfg(feature = "tracing")]
impl Recorder {
    fn new() -> Self {
        Self {
            now: Instant::now(),
        }
    }

    fn log_event(&self, name: &str, ph: &str) {
        log::trace!(
            target: "shuffle_trace",
            "{{ \"name\": \"{name}\", \"cat\": \"SHUFFLE\", \"ph\": \"{ph}\", \"pid\": 1, \"tid\": {}, \"ts\": {} }},",
            Self::thread_id(),
            self.now.elapsed().as_micros()
        );
    }

    fn log_counter(&self, name: &str, value: usize) {
        log::trace!(
            target: "shuffle_trace",
            "{{ \"name\": \"{name}\", \"cat\": \"SHUFFLE\", \"ph\": \"C\", \"pid\": 1, \"tid\": {}, \"ts\": {}, \"args\": {{ \"{name}\": {value} }} }},",
            Self::thread_id(),
            self.now.elapsed().as_micros()
        );
    }

    fn thread_id() -> u64 {
        let thread_id = format!("{:?}", std::thread::current().id());
        thread_id
            .trim_start_matches("ThreadId(")
            .trim_end_matches(')')
            .parse()
            .unwrap_or_default()
    }
}

#[allow(unused_variables)]
fn trace_begin(name: &str) {
    #[cfg(feature = "tracing")]
    RECORDER.log_event(name, "B");
}

#[allow(unused_variables)]
fn trace_end(name: &str) {
    #[cfg(feature = "tracing")]
    RECORDER.log_event(name, "E");
}

#[allow(unused_variables)]
pub(crate) fn log_counter(name: &str, value: usize) {
    #[cfg(feature = "tracing")]
    RECORDER.log_counter(name, value);
}

struct TraceGuard<'a> {
    label: &'a str,
}

impl<'a> TraceGuard<'a> {
    fn new(label: &'a str) -> Self {
        trace_begin(label);
        Self { label }
    }
}

impl Drop for TraceGuard<'_> {
    fn drop(&mut self) {
        trace_end(self.label);
    }
}

/// Runs `f`, surrounding it with begin/end events when `enabled`.
pub(crate) fn with_trace<T, F>(label: &str, enabled: bool, f: F) -> T
where
    F: FnOnce() -> T,
{
    if enabled {
        let _guard = TraceGuard::new(label);
        f()
    } else {
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_trace_returns_closure_result() {
        assert_eq!(3, with_trace("add", true, || 1 + 2));
        assert_eq!(
            Err::<(), _>("failed"),
            with_trace("fail", false, || Err("failed"))
        );
        log_counter("memory_used", 1024);
    }
}
