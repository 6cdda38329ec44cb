//! Bounded key-generation worker pool
//!
//! A fixed set of worker tasks drains a bounded queue. Generation itself runs
//! on the blocking thread pool so request tasks never spend CPU on it.
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


use crate::error::{PoolError, PoolResult};
use crate::material::{GenerationSpec, KeyMaterial, MaterialGenerator};
use kms_config::PoolSettings;
use kms_types::telemetry::{
    Telemetry, POOL_COMPLETED, POOL_FAILED, POOL_GENERATE_MS, POOL_IN_FLIGHT, POOL_LATENCY_MS,
    POOL_QUEUE_DEPTH, POOL_SATURATED, POOL_SUBMITTED,
};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pool sizing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub workers: usize,
    pub queue_bound: usize,
    pub shutdown_timeout: Duration,
}

impl PoolConfig {
    pub fn from_settings(name: impl Into<String>, settings: &PoolSettings) -> Self {
        Self {
            name: name.into(),
            workers: settings.workers,
            queue_bound: settings.queue_bound,
            shutdown_timeout: settings.shutdown_timeout(),
        }
    }
}

/// What `submit` does when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitPolicy {
    /// Fail with `Saturated` immediately
    FailFast,
    /// Wait for space up to `timeout`, then fail with `Timeout`
    Block { timeout: Duration },
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub queued: usize,
    pub in_flight: usize,
    pub submitted: u64,
    pub saturated: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
    submitted: AtomicU64,
    saturated: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

struct PoolTask {
    spec: GenerationSpec,
    reply: oneshot::Sender<PoolResult<KeyMaterial>>,
    cancel: CancellationToken,
    enqueued_at: Instant,
}

/// Handle to one submitted generation request
#[derive(Debug)]
pub struct PoolTicket {
    reply: oneshot::Receiver<PoolResult<KeyMaterial>>,
    cancel: CancellationToken,
}

impl PoolTicket {
    /// Abandon the request; a queued task is skipped, a running one discarded
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn wait(self) -> PoolResult<KeyMaterial> {
        tokio::select! {
            result = self.reply => result.unwrap_or(Err(PoolError::ShutDown)),
            _ = self.cancel.cancelled() => Err(PoolError::Cancelled),
        }
    }

    /// `wait` bounded by a caller deadline; the request is cancelled on expiry
    pub async fn wait_timeout(self, timeout: Duration) -> PoolResult<KeyMaterial> {
        let cancel = self.cancel.clone();
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(PoolError::Timeout)
            }
        }
    }
}

struct Shared {
    name: String,
    generator: Arc<dyn MaterialGenerator>,
    telemetry: Arc<dyn Telemetry>,
    counters: Counters,
}

impl Shared {
    fn publish_gauges(&self) {
        let labels = [("pool", self.name.as_str())];
        self.telemetry.gauge(
            POOL_QUEUE_DEPTH,
            self.counters.queued.load(Ordering::SeqCst) as f64,
            &labels,
        );
        self.telemetry.gauge(
            POOL_IN_FLIGHT,
            self.counters.in_flight.load(Ordering::SeqCst) as f64,
            &labels,
        );
    }

    fn count(&self, metric: &'static str, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.telemetry.counter(metric, 1, &[("pool", self.name.as_str())]);
    }
}

/// Fixed-size pool of key-generation workers over a bounded queue.
///
/// Capacity is `workers` running plus `queue_bound` waiting requests.
pub struct KeyGenPool {
    shared: Arc<Shared>,
    sender: Mutex<Option<mpsc::Sender<PoolTask>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl KeyGenPool {
    /// Start the workers; must be called from within a tokio runtime
    pub fn new(
        config: PoolConfig,
        generator: Arc<dyn MaterialGenerator>,
        telemetry: Arc<dyn Telemetry>,
    ) -> PoolResult<Self> {
        if config.workers == 0 {
            return Err(PoolError::InvalidConfig("workers must be at least 1".to_string()));
        }
        if config.queue_bound == 0 {
            return Err(PoolError::InvalidConfig("queue_bound must be at least 1".to_string()));
        }

        let (sender, receiver) = mpsc::channel(config.queue_bound);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            generator,
            telemetry,
            counters: Counters::default(),
        });

        let workers = (0..config.workers)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, shared.clone(), receiver.clone())))
            .collect();

        info!(
            pool = %config.name,
            workers = config.workers,
            queue_bound = config.queue_bound,
            "Key generation pool started"
        );

        Ok(Self {
            shared,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    /// Enqueue a generation request.
    ///
    /// `cancel`, when given, aborts the request while it waits for queue
    /// space, while it is queued, and while the ticket is awaited.
    pub async fn submit(
        &self,
        spec: GenerationSpec,
        policy: SubmitPolicy,
        cancel: Option<CancellationToken>,
    ) -> PoolResult<PoolTicket> {
        let sender = self
            .sender
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(PoolError::ShutDown)?;

        let cancel = cancel.unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(PoolError::Cancelled);
        }

        let (reply, ticket_rx) = oneshot::channel();
        let label = spec.label.clone();
        let task = PoolTask {
            spec,
            reply,
            cancel: cancel.clone(),
            enqueued_at: Instant::now(),
        };

        // Counted before the send so a fast worker never sees a negative depth
        self.shared.counters.queued.fetch_add(1, Ordering::SeqCst);

        let sent = match policy {
            SubmitPolicy::FailFast => match sender.try_send(task) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(PoolError::Saturated),
                Err(TrySendError::Closed(_)) => Err(PoolError::ShutDown),
            },
            SubmitPolicy::Block { timeout } => tokio::select! {
                sent = tokio::time::timeout(timeout, sender.send(task)) => match sent {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => Err(PoolError::ShutDown),
                    Err(_) => Err(PoolError::Timeout),
                },
                _ = cancel.cancelled() => Err(PoolError::Cancelled),
            },
        };

        if let Err(e) = sent {
            self.shared.counters.queued.fetch_sub(1, Ordering::SeqCst);
            if e == PoolError::Saturated {
                self.shared.count(POOL_SATURATED, &self.shared.counters.saturated);
            }
            debug!(pool = %self.shared.name, label = %label, error = %e, "Generation request rejected");
            return Err(e);
        }

        self.shared.count(POOL_SUBMITTED, &self.shared.counters.submitted);
        self.shared.publish_gauges();

        Ok(PoolTicket {
            reply: ticket_rx,
            cancel,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.shared.counters;
        PoolStats {
            queued: c.queued.load(Ordering::SeqCst),
            in_flight: c.in_flight.load(Ordering::SeqCst),
            submitted: c.submitted.load(Ordering::SeqCst),
            saturated: c.saturated.load(Ordering::SeqCst),
            completed: c.completed.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
            cancelled: c.cancelled.load(Ordering::SeqCst),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().map(|s| s.is_none()).unwrap_or(true)
    }

    /// Stop admitting work, let workers drain the queue, and abort whatever
    /// is still running after the shutdown timeout. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let sender = self.sender.lock().ok().and_then(|mut s| s.take());
        let handles = self
            .workers
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();

        if sender.is_none() && handles.is_empty() {
            return;
        }
        drop(sender);

        info!(pool = %self.shared.name, "Shutting down key generation pool");

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let drained = tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(handles)).await;

        if drained.is_err() {
            warn!(
                pool = %self.shared.name,
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "Pool did not drain in time, aborting workers"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        info!(pool = %self.shared.name, stats = ?self.stats(), "Key generation pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<PoolTask>>>,
) {
    debug!(pool = %shared.name, worker_id, "Worker started");

    loop {
        let task = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(task) = task else { break };

        shared.counters.queued.fetch_sub(1, Ordering::SeqCst);

        if task.cancel.is_cancelled() || task.reply.is_closed() {
            shared.counters.cancelled.fetch_add(1, Ordering::SeqCst);
            debug!(pool = %shared.name, label = %task.spec.label, "Skipping abandoned request");
            shared.publish_gauges();
            continue;
        }

        shared.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        shared.publish_gauges();

        let started = Instant::now();
        let generator = shared.generator.clone();
        let spec = task.spec.clone();
        let result = match tokio::task::spawn_blocking(move || generator.generate(&spec)).await {
            Ok(result) => result,
            Err(e) => Err(PoolError::Generation(format!("generation task failed: {}", e))),
        };

        let labels = [("pool", shared.name.as_str())];
        shared.telemetry.histogram(
            POOL_GENERATE_MS,
            started.elapsed().as_secs_f64() * 1000.0,
            &labels,
        );
        shared.counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        match &result {
            Ok(_) => shared.count(POOL_COMPLETED, &shared.counters.completed),
            Err(e) => {
                warn!(pool = %shared.name, label = %task.spec.label, error = %e, "Key generation failed");
                shared.count(POOL_FAILED, &shared.counters.failed);
            }
        }
        shared.telemetry.histogram(
            POOL_LATENCY_MS,
            task.enqueued_at.elapsed().as_secs_f64() * 1000.0,
            &labels,
        );
        shared.publish_gauges();

        if task.cancel.is_cancelled() {
            shared.counters.cancelled.fetch_add(1, Ordering::SeqCst);
            continue;
        }
        // Receiver gone: result discarded
        let _ = task.reply.send(result);
    }

    debug!(pool = %shared.name, worker_id, "Worker stopped");
}
