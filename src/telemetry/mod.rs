// SPDX-License-Identifier: Apache-2.0

pub mod metrics_server;

use opentelemetry::global;
use opentelemetry::metrics::{Counter, Gauge, Meter};

use crate::tailer::BufferObserver;

pub fn get_meter() -> Meter {
    global::meter("tailmet")
}

/// Self-monitoring instruments for the line pipeline.
pub struct SelfMonitor {
    pub lines: Counter<u64>,
    pub tailer_errors: Counter<u64>,
}

impl SelfMonitor {
    pub fn new() -> Self {
        let meter = get_meter();
        Self {
            lines: meter
                .u64_counter("tailmet_lines")
                .with_description("Total number of log lines delivered through the line buffer.")
                .build(),
            tailer_errors: meter
                .u64_counter("tailmet_tailer_errors")
                .with_description("Number of recoverable tailer errors.")
                .build(),
        }
    }
}

impl Default for SelfMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Publishes the fan-in buffer depth as a gauge.
pub struct BufferLoadObserver {
    gauge: Gauge<u64>,
}

impl BufferLoadObserver {
    pub fn new() -> Self {
        Self {
            gauge: get_meter()
                .u64_gauge("tailmet_buffer_load")
                .with_description("Current number of lines waiting in the fan-in buffer.")
                .build(),
        }
    }
}

impl Default for BufferLoadObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferObserver for BufferLoadObserver {
    fn record(&self, len: usize) {
        self.gauge.record(len as u64, &[]);
    }
}
