use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, ensure, Context, Result};
use crossbeam_channel::Sender;

use crate::consensus::{assemble_outputs, concat_consensus, decode_window, CorrectedRead};
use crate::features::{build_window_features, WindowDecision, WindowFeatures};
use crate::inference::InferenceBatcher;
use crate::model::{resolve_batch_size, Device, InferenceBackend, ModelConfig};
use crate::overlaps::CorrectionAlignments;
use crate::queue::{Popped, TaskQueue, TimedPopped};
use crate::windows::extract_windows;

pub const INPUT_QUEUE_CAPACITY: usize = 1000;
pub const FEATURES_QUEUE_CAPACITY: usize = 1000;
pub const INFERRED_QUEUE_CAPACITY: usize = 500;
pub const DECODE_WORKERS: usize = 4;
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct CorrectionOptions {
    pub window_size: usize,
    pub min_coverage: usize,
    /// Minimum fraction of a window an overlap slice must cover to be
    /// included; 0.0 accepts any slice that consumes target bases.
    pub min_window_fraction: f32,
    /// Batch slot budget; 0 auto-sizes from device memory.
    pub batch_size: usize,
    /// Input (feature extraction) workers.
    pub threads: usize,
    /// Inference workers per device; forced to 1 on CPU.
    pub infer_threads: usize,
    pub devices: Vec<Device>,
    pub flush_timeout: Duration,
}

impl CorrectionOptions {
    pub fn from_model(config: &ModelConfig) -> Self {
        Self {
            window_size: config.window_size,
            min_coverage: config.min_coverage,
            min_window_fraction: 0.0,
            batch_size: 0,
            threads: 4,
            infer_threads: 1,
            devices: vec![Device::Cpu],
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    pub num_reads_corrected: usize,
    pub num_early_reads: usize,
    pub total_reads_in_input: usize,
    pub features_queue_depth: usize,
    pub inferred_queue_depth: usize,
}

/// Per-read completion tracking: consensus slots per window plus the count
/// of windows still awaiting inference. Both maps live under one mutex,
/// which is never held across a queue operation.
pub struct ReassemblyTracker {
    inner: Mutex<TrackerMaps>,
}

#[derive(Default)]
struct TrackerMaps {
    features_by_id: HashMap<String, Vec<String>>,
    pending_by_id: HashMap<String, usize>,
}

impl ReassemblyTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerMaps::default()),
        }
    }

    /// Register a read whose windows are partially trivial. Returns false
    /// when the name is already in flight (duplicates are dropped).
    pub fn register(&self, name: &str, slots: Vec<String>, pending: usize) -> bool {
        let mut maps = self.inner.lock().unwrap();
        if maps.features_by_id.contains_key(name) {
            return false;
        }
        maps.features_by_id.insert(name.to_string(), slots);
        maps.pending_by_id.insert(name.to_string(), pending);
        true
    }

    /// Give up on `count` windows that will never be decoded for `name`.
    /// Their slots stay empty and act as gaps; returns the slot vector
    /// when nothing else is pending so the read can still complete.
    pub fn cancel(&self, name: &str, count: usize) -> Option<Vec<String>> {
        let mut maps = self.inner.lock().unwrap();
        let Some(pending) = maps.pending_by_id.get_mut(name) else {
            return None;
        };
        *pending = pending.saturating_sub(count);
        if *pending > 0 {
            return None;
        }
        maps.pending_by_id.remove(name);
        maps.features_by_id.remove(name)
    }

    /// Record one decoded window. Returns the completed slot vector once
    /// the last pending window arrives; the maps are emptied for the read.
    pub fn complete(&self, name: &str, window_idx: usize, seq: String) -> Option<Vec<String>> {
        let mut maps = self.inner.lock().unwrap();
        let Some(slots) = maps.features_by_id.get_mut(name) else {
            log::warn!("decoded window for unknown read {}", name);
            return None;
        };
        match slots.get_mut(window_idx) {
            Some(slot) => *slot = seq,
            None => {
                log::warn!("window {} out of range for read {}", window_idx, name);
                return None;
            }
        }

        let pending = maps.pending_by_id.entry(name.to_string()).or_default();
        *pending = pending.saturating_sub(1);
        if *pending > 0 {
            return None;
        }
        maps.pending_by_id.remove(name);
        maps.features_by_id.remove(name)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().features_by_id.len()
    }
}

impl Default for ReassemblyTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct PipelineState {
    opts: CorrectionOptions,
    batch_size: usize,
    input_queue: TaskQueue<CorrectionAlignments>,
    features_queue: TaskQueue<WindowFeatures>,
    inferred_queue: TaskQueue<WindowFeatures>,
    gpu_mutexes: Vec<Mutex<()>>,
    tracker: ReassemblyTracker,
    output: Sender<CorrectedRead>,
    num_active_feature_threads: AtomicUsize,
    num_active_infer_threads: AtomicUsize,
    num_reads: AtomicUsize,
    num_early_reads: AtomicUsize,
    total_reads_in_input: AtomicUsize,
    fatal: Mutex<Option<String>>,
}

impl PipelineState {
    fn record_fatal(&self, err: &anyhow::Error) {
        let mut fatal = self.fatal.lock().unwrap();
        if fatal.is_none() {
            *fatal = Some(format!("{:#}", err));
        }
    }
}

/// The three-stage correction pipeline: input workers extract windows and
/// features, inference workers batch windows through the backend, decode
/// workers translate predictions and reassemble reads.
pub struct CorrectionPipeline {
    state: Arc<PipelineState>,
    input_handles: Vec<JoinHandle<()>>,
    infer_handles: Vec<JoinHandle<()>>,
    decode_handles: Vec<JoinHandle<()>>,
}

impl CorrectionPipeline {
    /// Spawn the worker pools. `make_backend` is called once per inference
    /// worker with the worker's device slot and device; any failure there
    /// is fatal and nothing is spawned.
    pub fn new<F>(
        opts: CorrectionOptions,
        mut make_backend: F,
        output: Sender<CorrectedRead>,
    ) -> Result<Self>
    where
        F: FnMut(usize, Device) -> Result<Box<dyn InferenceBackend>>,
    {
        ensure!(opts.window_size > 0, "window size must be positive");
        ensure!(!opts.devices.is_empty(), "no inference devices requested");

        let infer_threads = if opts.devices == [Device::Cpu] {
            1
        } else {
            opts.infer_threads.max(1)
        };

        let mut backends = Vec::new();
        for (slot, device) in opts.devices.iter().enumerate() {
            for _ in 0..infer_threads {
                let backend = make_backend(slot, *device)
                    .with_context(|| format!("failed to create backend on {}", device))?;
                backends.push((slot, backend));
            }
        }
        let batch_size = resolve_batch_size(opts.batch_size, backends[0].1.as_ref());

        let gpu_mutexes = opts.devices.iter().map(|_| Mutex::new(())).collect();
        let input_workers = opts.threads.max(1);
        let state = Arc::new(PipelineState {
            batch_size,
            input_queue: TaskQueue::new(INPUT_QUEUE_CAPACITY),
            features_queue: TaskQueue::new(FEATURES_QUEUE_CAPACITY),
            inferred_queue: TaskQueue::new(INFERRED_QUEUE_CAPACITY),
            gpu_mutexes,
            tracker: ReassemblyTracker::new(),
            output,
            num_active_feature_threads: AtomicUsize::new(input_workers),
            num_active_infer_threads: AtomicUsize::new(backends.len()),
            num_reads: AtomicUsize::new(0),
            num_early_reads: AtomicUsize::new(0),
            total_reads_in_input: AtomicUsize::new(0),
            fatal: Mutex::new(None),
            opts,
        });

        let input_handles = (0..input_workers)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || input_worker(&state))
            })
            .collect();
        let infer_handles = backends
            .into_iter()
            .map(|(slot, backend)| {
                let state = Arc::clone(&state);
                thread::spawn(move || infer_worker(&state, backend, slot))
            })
            .collect();
        let decode_handles = (0..DECODE_WORKERS)
            .map(|_| {
                let state = Arc::clone(&state);
                thread::spawn(move || decode_worker(&state))
            })
            .collect();

        Ok(Self {
            state,
            input_handles,
            infer_handles,
            decode_handles,
        })
    }

    /// Feed one message; blocks while the input queue is full.
    pub fn push(&self, msg: CorrectionAlignments) -> Result<()> {
        self.state
            .input_queue
            .push(msg)
            .map_err(|_| anyhow!("pipeline terminated"))
    }

    pub fn sample_stats(&self) -> PipelineStats {
        PipelineStats {
            num_reads_corrected: self.state.num_reads.load(Ordering::Relaxed),
            num_early_reads: self.state.num_early_reads.load(Ordering::Relaxed),
            total_reads_in_input: self.state.total_reads_in_input.load(Ordering::Relaxed),
            features_queue_depth: self.state.features_queue.len(),
            inferred_queue_depth: self.state.inferred_queue.len(),
        }
    }

    /// Shut the stages down in order (input, inference, decode), joining
    /// every worker, and surface any fatal inference error.
    pub fn terminate(&mut self) -> Result<()> {
        self.join_workers();
        if let Some(reason) = self.state.fatal.lock().unwrap().take() {
            bail!("inference failed: {}", reason);
        }
        Ok(())
    }

    fn join_workers(&mut self) {
        self.state.input_queue.terminate();
        for handle in self.input_handles.drain(..) {
            let _ = handle.join();
        }
        for handle in self.infer_handles.drain(..) {
            let _ = handle.join();
        }
        for handle in self.decode_handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for CorrectionPipeline {
    fn drop(&mut self) {
        self.join_workers();
    }
}

fn input_worker(state: &PipelineState) {
    loop {
        match state.input_queue.pop() {
            Popped::Item(msg) => {
                state.total_reads_in_input.fetch_add(1, Ordering::Relaxed);
                let name = msg.read_name.clone();
                if let Err(err) = process_message(state, msg) {
                    log::error!("dropping read {}: {:#}", name, err);
                }
            }
            Popped::Terminate => break,
        }
    }
    // The last input worker out closes the next stage.
    if state.num_active_feature_threads.fetch_sub(1, Ordering::AcqRel) == 1 {
        state.features_queue.terminate();
    }
}

fn process_message(state: &PipelineState, mut msg: CorrectionAlignments) -> Result<()> {
    msg.normalize();
    msg.check_consistent_overlaps()?;

    let windows = extract_windows(&msg, state.opts.window_size, state.opts.min_window_fraction)?;
    let mut slots = vec![String::new(); windows.len()];
    let mut queued = Vec::new();
    for (idx, ovls) in windows.iter().enumerate() {
        match build_window_features(
            &msg,
            idx,
            state.opts.window_size,
            ovls,
            state.opts.min_coverage,
        )? {
            WindowDecision::Trivial(seq) => slots[idx] = seq,
            WindowDecision::Infer(wf) => queued.push(wf),
        }
    }

    if queued.is_empty() {
        // Fast path: nothing to infer, the read completes here without
        // touching the tracker or the queues.
        state.num_early_reads.fetch_add(1, Ordering::Relaxed);
        emit_read(state, &msg.read_name, slots);
        return Ok(());
    }

    let queued_count = queued.len();
    if !state.tracker.register(&msg.read_name, slots, queued_count) {
        bail!("duplicate read name in flight");
    }
    let mut pushed = 0usize;
    for wf in queued {
        if state.features_queue.push(wf).is_err() {
            log::warn!(
                "features queue terminated while queueing read {}",
                msg.read_name
            );
            break;
        }
        pushed += 1;
    }
    if pushed < queued_count {
        // Windows that never reached the queue count as gaps; without
        // this the read's pending count can never reach zero.
        if let Some(slots) = state.tracker.cancel(&msg.read_name, queued_count - pushed) {
            emit_read(state, &msg.read_name, slots);
        }
    }
    Ok(())
}

fn emit_read(state: &PipelineState, name: &str, slots: Vec<String>) {
    state.num_reads.fetch_add(1, Ordering::Relaxed);
    let pieces = concat_consensus(&slots);
    if pieces.is_empty() {
        log::warn!("read {}: no confident consensus produced", name);
        return;
    }
    for record in assemble_outputs(name, pieces) {
        if state.output.send(record).is_err() {
            log::warn!("output receiver dropped; discarding corrected reads");
            return;
        }
    }
}

fn infer_worker(state: &PipelineState, backend: Box<dyn InferenceBackend>, device_slot: usize) {
    if let Err(err) = infer_loop(state, backend.as_ref(), device_slot) {
        log::error!(
            "inference worker on device slot {} failed: {:#}",
            device_slot,
            err
        );
        state.record_fatal(&err);
        // Unwind the upstream stages so the pipeline drains.
        state.input_queue.terminate();
        state.features_queue.terminate();
    }
    if state.num_active_infer_threads.fetch_sub(1, Ordering::AcqRel) == 1 {
        state.inferred_queue.terminate();
    }
}

fn infer_loop(
    state: &PipelineState,
    backend: &dyn InferenceBackend,
    device_slot: usize,
) -> Result<()> {
    let mut batcher = InferenceBatcher::new(state.batch_size);
    let device_mutex = &state.gpu_mutexes[device_slot];
    loop {
        let deadline = Instant::now() + state.opts.flush_timeout;
        match state.features_queue.pop_until(deadline) {
            TimedPopped::Item(wf) => {
                if batcher.needs_flush_for(&wf) {
                    batcher.flush(backend, device_mutex, &state.inferred_queue)?;
                }
                batcher.accept(wf);
            }
            TimedPopped::Timeout => {
                batcher.flush(backend, device_mutex, &state.inferred_queue)?;
            }
            TimedPopped::Terminate => {
                batcher.flush(backend, device_mutex, &state.inferred_queue)?;
                return Ok(());
            }
        }
    }
}

fn finish_window(state: &PipelineState, wf: &WindowFeatures) {
    let seq = match decode_window(wf) {
        Ok(seq) => seq,
        Err(err) => {
            log::error!(
                "failed to decode window {} of read {}: {:#}",
                wf.window_idx,
                wf.read_name,
                err
            );
            // The window still has to be accounted for; an empty slot
            // leaves a gap instead of stranding the read.
            String::new()
        }
    };
    if let Some(slots) = state.tracker.complete(&wf.read_name, wf.window_idx, seq) {
        emit_read(state, &wf.read_name, slots);
    }
}

fn decode_worker(state: &PipelineState) {
    loop {
        match state.inferred_queue.pop() {
            Popped::Item(wf) => finish_window(state, &wf),
            Popped::Terminate => break,
        }
    }
}
