//! Telemetry sink and metric names
//!
//! The core only emits measurements; exporters are wired by the host process
//! by implementing [`Telemetry`].
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use std::sync::{Arc, Mutex};
use tracing::debug;

pub const POOL_QUEUE_DEPTH: &str = "kms.pool.queue_depth";
pub const POOL_IN_FLIGHT: &str = "kms.pool.in_flight";
pub const POOL_SUBMITTED: &str = "kms.pool.submitted";
pub const POOL_SATURATED: &str = "kms.pool.saturated";
pub const POOL_COMPLETED: &str = "kms.pool.completed";
pub const POOL_FAILED: &str = "kms.pool.failed";
pub const POOL_LATENCY_MS: &str = "kms.pool.latency_ms";
pub const POOL_GENERATE_MS: &str = "kms.pool.generate_ms";

pub const BARRIER_ENCRYPT: &str = "kms.barrier.encrypt";
pub const BARRIER_DECRYPT: &str = "kms.barrier.decrypt";
pub const BARRIER_UNSEAL: &str = "kms.barrier.unseal";
pub const BARRIER_SEALED_REJECTIONS: &str = "kms.barrier.sealed_rejections";
pub const BARRIER_ROTATE: &str = "kms.barrier.rotate";

pub const ELASTIC_TRANSITION: &str = "kms.elastic.transition";

/// Metric label
pub type Label<'a> = (&'static str, &'a str);

/// Destination for counters, gauges and histograms
pub trait Telemetry: Send + Sync {
    fn counter(&self, name: &'static str, value: u64, labels: &[Label<'_>]);

    fn gauge(&self, name: &'static str, value: f64, labels: &[Label<'_>]);

    fn histogram(&self, name: &'static str, value: f64, labels: &[Label<'_>]);
}

/// Emits every measurement as a `tracing` debug event on target `kms::metrics`
#[derive(Debug, Default, Clone)]
pub struct TracingTelemetry;

impl TracingTelemetry {
    pub fn shared() -> Arc<dyn Telemetry> {
        Arc::new(Self)
    }
}

impl Telemetry for TracingTelemetry {
    fn counter(&self, name: &'static str, value: u64, labels: &[Label<'_>]) {
        debug!(target: "kms::metrics", metric = name, kind = "counter", value, labels = ?labels);
    }

    fn gauge(&self, name: &'static str, value: f64, labels: &[Label<'_>]) {
        debug!(target: "kms::metrics", metric = name, kind = "gauge", value, labels = ?labels);
    }

    fn histogram(&self, name: &'static str, value: f64, labels: &[Label<'_>]) {
        debug!(target: "kms::metrics", metric = name, kind = "histogram", value, labels = ?labels);
    }
}

/// Kind of a recorded measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

/// One measurement captured by [`RecordingTelemetry`]
#[derive(Debug, Clone)]
pub struct MetricEvent {
    pub name: &'static str,
    pub kind: MetricKind,
    pub value: f64,
    pub labels: Vec<(&'static str, String)>,
}

/// In-memory sink, mainly for tests and local diagnostics
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<MetricEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, name: &'static str, kind: MetricKind, value: f64, labels: &[Label<'_>]) {
        let event = MetricEvent {
            name,
            kind,
            value,
            labels: labels.iter().map(|(k, v)| (*k, v.to_string())).collect(),
        };
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Sum of all counter increments recorded under `name`
    pub fn counter_total(&self, name: &str) -> u64 {
        self.events()
            .iter()
            .filter(|e| e.kind == MetricKind::Counter && e.name == name)
            .map(|e| e.value as u64)
            .sum()
    }

    /// Most recent gauge value recorded under `name`
    pub fn last_gauge(&self, name: &str) -> Option<f64> {
        self.events()
            .iter()
            .rev()
            .find(|e| e.kind == MetricKind::Gauge && e.name == name)
            .map(|e| e.value)
    }

    pub fn histogram_count(&self, name: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.kind == MetricKind::Histogram && e.name == name)
            .count()
    }
}

impl Telemetry for RecordingTelemetry {
    fn counter(&self, name: &'static str, value: u64, labels: &[Label<'_>]) {
        self.record(name, MetricKind::Counter, value as f64, labels);
    }

    fn gauge(&self, name: &'static str, value: f64, labels: &[Label<'_>]) {
        self.record(name, MetricKind::Gauge, value, labels);
    }

    fn histogram(&self, name: &'static str, value: f64, labels: &[Label<'_>]) {
        self.record(name, MetricKind::Histogram, value, labels);
    }
}
