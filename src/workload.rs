//! Deterministic three-phase benchmark: load, mixed operations, range scan.
//!
//! The whole workload is drawn up front from a generator seeded with
//! `BenchmarkConfig::seed`, so every backend in a run sees identical inputs.

use crate::options::StoreOptions;
use crate::registry::Registry;
use crate::{Error, KeyValueStore};
use log::{debug, error, info, warn};
use rand::distributions::Standard;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp;
use std::time::{Duration, Instant};

/// Instance name every backend is opened under.
pub const INSTANCE_NAME: &str = "bench";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkConfig {
    pub key_count: usize,
    pub value_size: usize,
    pub mixed_ops: usize,
    pub range_queries: usize,
    pub range_span: usize,
    pub seed: u64,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        BenchmarkConfig {
            key_count: 10_000,
            value_size: 128,
            mixed_ops: 20_000,
            range_queries: 200,
            range_span: 100,
            seed: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Get,
    Set,
    Delete,
}

impl OpKind {
    /// Maps a draw from `[0, 100)`: half reads, 40% overwrites, 10% deletes.
    fn from_draw(draw: u32) -> OpKind {
        match draw {
            0..=49 => OpKind::Get,
            50..=89 => OpKind::Set,
            _ => OpKind::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixedOp {
    pub kind: OpKind,
    /// Index into `Workload::keys`.
    pub key: usize,
}

/// `[start, end)` over key indexes. An `end` equal to the key count leaves the
/// scan unbounded above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeQuery {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub keys: Vec<Vec<u8>>,
    pub value: Vec<u8>,
    pub mixed: Vec<MixedOp>,
    pub ranges: Vec<RangeQuery>,
}

impl Workload {
    pub fn range_bounds(&self, query: &RangeQuery) -> (&[u8], Option<&[u8]>) {
        let end = self.keys.get(query.end).map(Vec::as_slice);
        (&self.keys[query.start], end)
    }
}

pub fn key_for(index: usize) -> Vec<u8> {
    format!("k-{:08}", index).into_bytes()
}

pub fn generate_workload(config: &BenchmarkConfig) -> Workload {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let keys: Vec<Vec<u8>> = (0..config.key_count).map(key_for).collect();
    let value = rand_vec(&mut rng, config.value_size);

    let (mixed, ranges) = if keys.is_empty() {
        (Vec::new(), Vec::new())
    } else {
        let mixed = (0..config.mixed_ops)
            .map(|_| {
                let key = rng.gen_range(0..keys.len());
                let kind = OpKind::from_draw(rng.gen_range(0..100));
                MixedOp { kind, key }
            })
            .collect();
        let ranges = (0..config.range_queries)
            .map(|_| {
                let start = rng.gen_range(0..keys.len());
                let end = cmp::min(start.saturating_add(config.range_span), keys.len());
                RangeQuery { start, end }
            })
            .collect();
        (mixed, ranges)
    };

    Workload {
        keys,
        value,
        mixed,
        ranges,
    }
}

fn rand_vec<R: Rng>(rng: &mut R, len: usize) -> Vec<u8> {
    rng.sample_iter(&Standard).take(len).collect()
}

#[derive(Debug, thiserror::Error)]
pub enum PhaseError {
    #[error("tempdir: {0}")]
    TempDir(std::io::Error),
    #[error("open db: {0}")]
    Open(Error),
    #[error("load set: {0}")]
    Load(Error),
    #[error("mixed get/set/delete: {0}")]
    Mixed(Error),
    #[error("range iterator: {0}")]
    RangeOpen(Error),
    #[error("range iterator error: {0}")]
    RangeDrain(Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub ops: usize,
    #[serde(with = "nanos")]
    pub duration: Duration,
    pub throughput_ops_per_sec: f64,
}

impl PhaseResult {
    fn new(ops: usize, duration: Duration) -> Self {
        PhaseResult {
            ops,
            duration,
            throughput_ops_per_sec: throughput(ops, duration),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeResult {
    pub ranges: usize,
    pub span: usize,
    #[serde(with = "nanos")]
    pub duration: Duration,
    pub throughput_ranges_per_sec: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendResult {
    pub backend: String,
    pub load: PhaseResult,
    pub mixed: PhaseResult,
    pub range_scan: RangeResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn throughput(count: usize, duration: Duration) -> f64 {
    let secs = duration.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

mod nanos {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}

/// Writes every key in ascending order with the shared payload.
pub fn run_load(store: &dyn KeyValueStore, workload: &Workload) -> Result<PhaseResult, Error> {
    let now = Instant::now();
    for key in &workload.keys {
        store.set(key, Some(workload.value.as_slice()))?;
    }
    Ok(PhaseResult::new(workload.keys.len(), now.elapsed()))
}

pub fn run_mixed(store: &dyn KeyValueStore, workload: &Workload) -> Result<PhaseResult, Error> {
    let mut hits = 0usize;
    let now = Instant::now();
    for op in &workload.mixed {
        let key = &workload.keys[op.key];
        match op.kind {
            OpKind::Get => {
                if store.get(key)?.is_some() {
                    hits += 1;
                }
            }
            OpKind::Set => store.set(key, Some(workload.value.as_slice()))?,
            OpKind::Delete => store.delete(key)?,
        }
    }
    let elapsed = now.elapsed();
    debug!("mixed: {} of {} ops were read hits", hits, workload.mixed.len());
    Ok(PhaseResult::new(workload.mixed.len(), elapsed))
}

/// Drains a forward iterator per query, checking its error once exhausted.
pub fn run_range_scan(
    store: &dyn KeyValueStore,
    workload: &Workload,
    span: usize,
) -> Result<RangeResult, PhaseError> {
    let mut scanned = 0usize;
    let now = Instant::now();
    for query in &workload.ranges {
        let (start, end) = workload.range_bounds(query);
        let mut it = store
            .iterator(Some(start), end)
            .map_err(PhaseError::RangeOpen)?;
        while it.valid() {
            scanned += it.key().len() + it.value().len();
            it.next();
        }
        it.error().map_err(PhaseError::RangeDrain)?;
        it.close().map_err(PhaseError::RangeDrain)?;
    }
    let duration = now.elapsed();
    debug!(
        "range: {} queries touched {} bytes",
        workload.ranges.len(),
        scanned
    );
    Ok(RangeResult {
        ranges: workload.ranges.len(),
        span,
        duration,
        throughput_ranges_per_sec: throughput(workload.ranges.len(), duration),
    })
}

/// One timed phase of one backend, relative to the start of the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpan {
    pub backend: String,
    pub phase: String,
    pub offset_ns: u64,
    pub duration_ns: u64,
}

/// Runs backends one after another, each in its own scratch directory.
pub struct Harness<'r> {
    registry: &'r Registry,
    config: BenchmarkConfig,
    options: StoreOptions,
    origin: Instant,
    timeline: Vec<PhaseSpan>,
}

impl<'r> Harness<'r> {
    pub fn new(registry: &'r Registry, config: BenchmarkConfig, options: StoreOptions) -> Self {
        Harness {
            registry,
            config,
            options,
            origin: Instant::now(),
            timeline: Vec::new(),
        }
    }

    pub fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    pub fn timeline(&self) -> &[PhaseSpan] {
        &self.timeline
    }

    /// A failing backend records its error and never stops the others.
    pub fn run_backend(&mut self, backend: &str) -> BackendResult {
        let mut result = BackendResult {
            backend: backend.to_string(),
            range_scan: RangeResult {
                span: self.config.range_span,
                ..RangeResult::default()
            },
            ..BackendResult::default()
        };
        if let Err(e) = self.drive(backend, &mut result) {
            error!("{}: {}", backend, e);
            result.error = Some(e.to_string());
        }
        result
    }

    fn drive(&mut self, backend: &str, result: &mut BackendResult) -> Result<(), PhaseError> {
        let workload = generate_workload(&self.config);
        let dir = tempfile::Builder::new()
            .prefix(&format!("dbbench-{}-", backend))
            .tempdir()
            .map_err(PhaseError::TempDir)?;
        let mut store = self
            .registry
            .open(backend, INSTANCE_NAME, dir.path(), &self.options)
            .map_err(PhaseError::Open)?;
        info!("{}: opened in {}", backend, dir.path().display());

        let outcome = self.phases(backend, &*store, &workload, result);

        if let Err(e) = store.close() {
            warn!("{}: close: {}", backend, e);
        }
        drop(store);
        if let Err(e) = dir.close() {
            warn!("{}: removing scratch directory: {}", backend, e);
        }
        outcome
    }

    fn phases(
        &mut self,
        backend: &str,
        store: &dyn KeyValueStore,
        workload: &Workload,
        result: &mut BackendResult,
    ) -> Result<(), PhaseError> {
        let started = Instant::now();
        result.load = run_load(store, workload).map_err(PhaseError::Load)?;
        self.record(backend, "load", started, result.load.duration);
        info!(
            "{}: load {} ops in {:?}",
            backend, result.load.ops, result.load.duration
        );

        let started = Instant::now();
        result.mixed = run_mixed(store, workload).map_err(PhaseError::Mixed)?;
        self.record(backend, "mixed", started, result.mixed.duration);
        info!(
            "{}: mixed {} ops in {:?}",
            backend, result.mixed.ops, result.mixed.duration
        );

        let started = Instant::now();
        result.range_scan = run_range_scan(store, workload, self.config.range_span)?;
        self.record(backend, "range_scan", started, result.range_scan.duration);
        info!(
            "{}: range {} scans in {:?}",
            backend, result.range_scan.ranges, result.range_scan.duration
        );
        Ok(())
    }

    fn record(&mut self, backend: &str, phase: &str, started: Instant, duration: Duration) {
        self.timeline.push(PhaseSpan {
            backend: backend.to_string(),
            phase: phase.to_string(),
            offset_ns: started.duration_since(self.origin).as_nanos() as u64,
            duration_ns: duration.as_nanos() as u64,
        });
    }
}
