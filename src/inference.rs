use std::sync::Mutex;

use anyhow::{anyhow, bail, ensure, Result};
use ndarray::{s, Array1, Array2, Array3};

use crate::consensus::CONSENSUS_BASES;
use crate::features::{WindowFeatures, NO_COVERAGE};
use crate::model::{BackendError, InferenceBackend, InferenceBatch};
use crate::queue::TaskQueue;

/// MSA columns per batch slot; a window claims `length / SLOT_WIDTH + 1`
/// slots. Empirical cap tied to model memory.
pub const SLOT_WIDTH: usize = 5120;

pub fn required_slots(wf: &WindowFeatures) -> usize {
    wf.length / SLOT_WIDTH + 1
}

/// Accumulates windows until the slot budget forces a flush, then collates
/// them, invokes the backend and fans the predictions back out per window.
pub struct InferenceBatcher {
    batch_size: usize,
    remaining_slots: usize,
    lengths: Vec<i32>,
    sizes: Vec<usize>,
    wfs: Vec<WindowFeatures>,
}

impl InferenceBatcher {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            remaining_slots: batch_size,
            lengths: Vec::new(),
            sizes: Vec::new(),
            wfs: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.wfs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.wfs.len()
    }

    pub fn remaining_slots(&self) -> usize {
        self.remaining_slots
    }

    /// Whether `wf` no longer fits and the accumulator must be flushed
    /// before accepting it.
    pub fn needs_flush_for(&self, wf: &WindowFeatures) -> bool {
        !self.is_empty() && required_slots(wf) > self.remaining_slots
    }

    pub fn accept(&mut self, wf: WindowFeatures) {
        self.remaining_slots = self.remaining_slots.saturating_sub(required_slots(&wf));
        self.lengths.push(wf.length as i32);
        self.sizes.push(wf.supported.len());
        self.wfs.push(wf);
    }

    /// Right-pad every window to the batch maxima: bases with
    /// [`NO_COVERAGE`], qualities with 0.0.
    fn collate(&self) -> InferenceBatch {
        let w_max = self.wfs.iter().map(|wf| wf.length).max().unwrap_or(0);
        let r_max = self.wfs.iter().map(|wf| wf.n_alns).max().unwrap_or(0);

        let mut bases = Array3::from_elem((self.wfs.len(), w_max, r_max), NO_COVERAGE);
        let mut quals = Array3::<f32>::zeros((self.wfs.len(), w_max, r_max));
        for (i, wf) in self.wfs.iter().enumerate() {
            bases
                .slice_mut(s![i, ..wf.length, ..wf.n_alns])
                .assign(&wf.bases);
            quals
                .slice_mut(s![i, ..wf.length, ..wf.n_alns])
                .assign(&wf.quals);
        }

        InferenceBatch {
            bases,
            quals,
            lengths: Array1::from_vec(self.lengths.clone()),
            indices: self.wfs.iter().map(|wf| wf.indices.clone()).collect(),
        }
    }

    /// Run the accumulated batch through the backend and forward every
    /// window, with its predictions, to the inferred queue. The device
    /// mutex serializes backend calls on one device; a transient failure
    /// is retried exactly once after clearing the allocator cache.
    pub fn flush(
        &mut self,
        backend: &dyn InferenceBackend,
        device_mutex: &Mutex<()>,
        inferred: &TaskQueue<WindowFeatures>,
    ) -> Result<()> {
        if self.wfs.is_empty() {
            return Ok(());
        }

        let batch = self.collate();
        let logits = {
            let _device = device_mutex.lock().unwrap();
            match backend.run(&batch) {
                Ok(logits) => logits,
                Err(BackendError::Transient(reason)) => {
                    log::warn!("transient backend failure, retrying once: {}", reason);
                    backend.clear_cache();
                    backend
                        .run(&batch)
                        .map_err(|e| anyhow!("backend failed after retry: {}", e))?
                }
                Err(err) => bail!(err),
            }
        };

        let total: usize = self.sizes.iter().sum();
        ensure!(
            logits.nrows() == total && logits.ncols() == CONSENSUS_BASES.len(),
            "backend returned logits of shape [{}, {}], expected [{}, {}]",
            logits.nrows(),
            logits.ncols(),
            total,
            CONSENSUS_BASES.len()
        );
        let classes = argmax_classes(&logits);

        let sizes = std::mem::take(&mut self.sizes);
        let wfs = std::mem::take(&mut self.wfs);
        self.lengths.clear();
        self.remaining_slots = self.batch_size;

        let mut offset = 0usize;
        for (mut wf, size) in wfs.into_iter().zip(sizes) {
            let preds = classes[offset..offset + size]
                .iter()
                .map(|&c| CONSENSUS_BASES[c as usize])
                .collect();
            offset += size;
            wf.inferred_bases = Some(preds);
            if inferred.push(wf).is_err() {
                bail!("inferred-features queue terminated during flush");
            }
        }

        Ok(())
    }
}

fn argmax_classes(logits: &Array2<f32>) -> Vec<u8> {
    logits
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.total_cmp(b))
                .map(|(i, _)| i as u8)
                .unwrap_or(0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::queue::Popped;

    fn window(length: usize, n_alns: usize, supported: Vec<usize>) -> WindowFeatures {
        let mut bases = Array2::from_elem((length, n_alns), NO_COVERAGE);
        for c in 0..length {
            bases[[c, 0]] = (c % 4) as i8;
        }
        WindowFeatures {
            read_name: "read".into(),
            window_idx: 0,
            quals: Array2::from_elem((length, n_alns), 0.5),
            indices: Array1::from_iter(supported.iter().map(|&c| c as i64)),
            length,
            n_alns,
            supported,
            inferred_bases: None,
            bases,
        }
    }

    /// Returns one-hot logits for a fixed class and counts invocations.
    struct OneHotBackend {
        class: usize,
        calls: AtomicUsize,
        batch_sizes: Mutex<Vec<usize>>,
        transient_failures: AtomicUsize,
    }

    impl OneHotBackend {
        fn new(class: usize) -> Self {
            Self {
                class,
                calls: AtomicUsize::new(0),
                batch_sizes: Mutex::new(Vec::new()),
                transient_failures: AtomicUsize::new(0),
            }
        }

        fn failing(class: usize, failures: usize) -> Self {
            let backend = Self::new(class);
            backend.transient_failures.store(failures, Ordering::SeqCst);
            backend
        }
    }

    impl InferenceBackend for OneHotBackend {
        fn run(&self, batch: &InferenceBatch) -> Result<Array2<f32>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .transient_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BackendError::Transient("out of memory".into()));
            }
            self.batch_sizes.lock().unwrap().push(batch.indices.len());
            let total: usize = batch.indices.iter().map(|ix| ix.len()).sum();
            let mut logits = Array2::zeros((total, CONSENSUS_BASES.len()));
            for mut row in logits.rows_mut() {
                row[self.class] = 1.0;
            }
            Ok(logits)
        }
    }

    #[test]
    fn slot_accounting() {
        assert_eq!(required_slots(&window(1, 2, vec![0])), 1);
        assert_eq!(required_slots(&window(5119, 2, vec![0])), 1);
        assert_eq!(required_slots(&window(5120, 2, vec![0])), 2);
        assert_eq!(required_slots(&window(12000, 2, vec![0])), 3);
    }

    #[test]
    fn oversized_windows_force_a_flush_between_them() {
        // Two 3-slot windows against a 4-slot budget: the second cannot
        // join the first batch.
        let backend = OneHotBackend::new(0);
        let mutex = Mutex::new(());
        let inferred = TaskQueue::new(16);
        let mut batcher = InferenceBatcher::new(4);

        let first = window(12000, 2, vec![0]);
        assert!(!batcher.needs_flush_for(&first));
        batcher.accept(first);
        assert_eq!(batcher.remaining_slots(), 1);

        let second = window(12000, 2, vec![0]);
        assert!(batcher.needs_flush_for(&second));
        batcher.flush(&backend, &mutex, &inferred).unwrap();
        batcher.accept(second);
        batcher.flush(&backend, &mutex, &inferred).unwrap();

        assert_eq!(*backend.batch_sizes.lock().unwrap(), vec![1, 1]);
    }

    #[test]
    fn collation_pads_with_the_reserved_values() {
        let mut batcher = InferenceBatcher::new(8);
        batcher.accept(window(4, 3, vec![1]));
        batcher.accept(window(2, 2, vec![0]));

        let batch = batcher.collate();
        assert_eq!(batch.bases.dim(), (2, 4, 3));
        assert_eq!(batch.lengths.to_vec(), vec![4, 2]);

        // The second window's rows beyond its own extent are padding.
        assert_eq!(batch.bases[[1, 0, 0]], 0);
        assert_eq!(batch.bases[[1, 2, 0]], NO_COVERAGE);
        assert_eq!(batch.bases[[1, 0, 2]], NO_COVERAGE);
        assert_eq!(batch.quals[[1, 0, 0]], 0.5);
        assert_eq!(batch.quals[[1, 2, 0]], 0.0);
        assert_eq!(batch.quals[[1, 0, 2]], 0.0);
    }

    #[test]
    fn flush_fans_predictions_back_per_window() {
        let backend = OneHotBackend::new(3);
        let mutex = Mutex::new(());
        let inferred = TaskQueue::new(16);
        let mut batcher = InferenceBatcher::new(8);

        batcher.accept(window(4, 2, vec![0, 2]));
        batcher.accept(window(4, 2, vec![1]));
        batcher.flush(&backend, &mutex, &inferred).unwrap();

        assert!(batcher.is_empty());
        assert_eq!(batcher.remaining_slots(), 8);
        assert_eq!(inferred.len(), 2);

        match inferred.pop() {
            Popped::Item(wf) => assert_eq!(wf.inferred_bases, Some(b"TT".to_vec())),
            Popped::Terminate => panic!("queue terminated"),
        }
        match inferred.pop() {
            Popped::Item(wf) => assert_eq!(wf.inferred_bases, Some(b"T".to_vec())),
            Popped::Terminate => panic!("queue terminated"),
        }
    }

    #[test]
    fn transient_failure_is_retried_once() {
        let backend = OneHotBackend::failing(0, 1);
        let mutex = Mutex::new(());
        let inferred = TaskQueue::new(16);
        let mut batcher = InferenceBatcher::new(8);

        batcher.accept(window(4, 2, vec![0]));
        batcher.flush(&backend, &mutex, &inferred).unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(inferred.len(), 1);
    }

    #[test]
    fn second_transient_failure_is_fatal() {
        let backend = OneHotBackend::failing(0, 2);
        let mutex = Mutex::new(());
        let inferred = TaskQueue::new(16);
        let mut batcher = InferenceBatcher::new(8);

        batcher.accept(window(4, 2, vec![0]));
        assert!(batcher.flush(&backend, &mutex, &inferred).is_err());
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert!(inferred.is_empty());
    }

    #[test]
    fn empty_flush_is_a_no_op() {
        let backend = OneHotBackend::new(0);
        let mutex = Mutex::new(());
        let inferred = TaskQueue::new(16);
        let mut batcher = InferenceBatcher::new(8);
        batcher.flush(&backend, &mutex, &inferred).unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
    }
}
