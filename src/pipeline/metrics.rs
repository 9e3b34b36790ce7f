//! Execution counters for a pipeline run.

use serde::{Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters shared by every worker and monitor of one pipeline run.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Items forwarded onto stage output channels
    pub items_forwarded: AtomicU64,

    /// Terminating markers emitted by workers
    pub markers_emitted: AtomicU64,

    /// Worker failures captured
    pub faults_captured: AtomicU64,

    /// Worker panics observed at join
    pub worker_panics: AtomicU64,

    /// Workers spawned across all stages
    pub workers_spawned: AtomicU64,

    /// Start time
    start_time: Option<Instant>,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record an item forwarded downstream.
    pub fn add_item(&self) {
        self.items_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminating marker emitted by a worker.
    pub fn add_marker(&self) {
        self.markers_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a captured worker failure.
    pub fn add_fault(&self) {
        self.faults_captured.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a worker panic.
    pub fn add_panic(&self) {
        self.worker_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a spawned worker.
    pub fn add_worker(&self) {
        self.workers_spawned.fetch_add(1, Ordering::Relaxed);
    }

    /// Get elapsed time since the run started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get throughput in items per second.
    pub fn items_per_second(&self) -> f64 {
        let items = self.items_forwarded.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            items as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_forwarded: self.items_forwarded.load(Ordering::Relaxed),
            markers_emitted: self.markers_emitted.load(Ordering::Relaxed),
            faults_captured: self.faults_captured.load(Ordering::Relaxed),
            worker_panics: self.worker_panics.load(Ordering::Relaxed),
            workers_spawned: self.workers_spawned.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            items_per_second: self.items_per_second(),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub items_forwarded: u64,
    pub markers_emitted: u64,
    pub faults_captured: u64,
    pub worker_panics: u64,
    pub workers_spawned: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub items_per_second: f64,
}

impl MetricsSnapshot {
    /// Save the snapshot to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Items: {} | Markers: {} | Faults: {} | Panics: {} | \
             Workers: {} | Rate: {:.1} items/s | Elapsed: {:.2}s",
            self.items_forwarded,
            self.markers_emitted,
            self.faults_captured,
            self.worker_panics,
            self.workers_spawned,
            self.items_per_second,
            self.elapsed.as_secs_f64(),
        )
    }
}
