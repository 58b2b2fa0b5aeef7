use anyhow::{ensure, Result};
use ndarray::{Array1, Array2};

use crate::overlaps::{CigarOp, CorrectionAlignments};
use crate::windows::{window_ops, OverlapWindow};

pub const MIN_QSCORE: u8 = 33;
pub const MAX_QSCORE: u8 = 126;

/// MSA base classes in encoding order: forward bases, gap, reverse-strand
/// bases, ambiguous.
pub const BASE_CLASSES: &[u8; 10] = b"ACGT*acgt#";
pub const GAP_CLASS: i8 = 4;
pub const UNKNOWN_CLASS: i8 = 9;
/// Cell value for rows that do not cover a column; also the collation pad.
pub const NO_COVERAGE: i8 = 11;

#[inline]
pub fn encode_base(base: u8, fwd: bool) -> i8 {
    let class = match base.to_ascii_uppercase() {
        b'A' => 0,
        b'C' => 1,
        b'G' => 2,
        b'T' => 3,
        _ => return UNKNOWN_CLASS,
    };
    if fwd {
        class
    } else {
        class + 5
    }
}

/// Fold reverse-strand classes onto their forward counterparts for
/// agreement checks.
#[inline]
fn fold_strand(class: i8) -> i8 {
    if (5..=8).contains(&class) {
        class - 5
    } else {
        class
    }
}

#[inline]
pub fn normalize_qual(q: u8) -> f32 {
    q.saturating_sub(MIN_QSCORE) as f32 / (MAX_QSCORE - MIN_QSCORE) as f32
}

/// The MSA feature tensor of one window.
///
/// `bases` and `quals` are `[W, R]` with the target in row 0. `indices` is
/// the device-side tensor of supported column positions (one entry per
/// supported column, the positions the model emits predictions for);
/// `supported` is the same set host-side. `inferred_bases` is filled by the
/// inference stage.
#[derive(Debug, Clone)]
pub struct WindowFeatures {
    pub read_name: String,
    pub window_idx: usize,
    pub bases: Array2<i8>,
    pub quals: Array2<f32>,
    pub indices: Array1<i64>,
    pub length: usize,
    pub n_alns: usize,
    pub supported: Vec<usize>,
    pub inferred_bases: Option<Vec<u8>>,
}

/// What to do with a window: emit the target slice as-is, or send the
/// features through inference.
#[derive(Debug)]
pub enum WindowDecision {
    Trivial(String),
    Infer(WindowFeatures),
}

fn target_slice(aln: &CorrectionAlignments, wstart: usize, wend: usize) -> String {
    String::from_utf8_lossy(&aln.tseq[wstart..wend]).into_owned()
}

/// Build the MSA features for one window, or decide it is trivial.
///
/// A window is trivial when no overlap covers it or when no column passes
/// the supported criteria (coverage of at least `min_coverage` rows and at
/// least one row disagreeing with the target base).
pub fn build_window_features(
    aln: &CorrectionAlignments,
    window_idx: usize,
    window_size: usize,
    ovls: &[OverlapWindow],
    min_coverage: usize,
) -> Result<WindowDecision> {
    let wstart = window_idx * window_size;
    let wend = (wstart + window_size).min(aln.tseq.len());
    let tlen_w = wend - wstart;
    let n_alns = 1 + ovls.len();

    if ovls.is_empty() {
        return Ok(WindowDecision::Trivial(target_slice(aln, wstart, wend)));
    }

    // Longest insertion anchored at each target position across all rows.
    // A row's insertion anchors to the last target column it consumed in
    // this window; insertions arriving before the row consumed anything
    // here have no anchor and are dropped.
    let mut max_ins = vec![0u32; tlen_w];
    for ow in ovls {
        let mut t = ow.tstart;
        for op in window_ops(&aln.cigars[ow.overlap_idx], ow) {
            match op {
                CigarOp::Match(l) | CigarOp::Deletion(l) => t += l as usize,
                CigarOp::Insertion(l) => {
                    if t > ow.tstart {
                        let anchor = t - 1 - wstart;
                        max_ins[anchor] = max_ins[anchor].max(l);
                    }
                }
            }
        }
    }

    let mut col_of = Vec::with_capacity(tlen_w);
    let mut next_col = 0usize;
    for ins in &max_ins {
        col_of.push(next_col);
        next_col += 1 + *ins as usize;
    }
    let width = next_col;

    let mut bases = Array2::from_elem((width, n_alns), NO_COVERAGE);
    let mut quals = Array2::<f32>::zeros((width, n_alns));

    for i in 0..tlen_w {
        let c = col_of[i];
        bases[[c, 0]] = encode_base(aln.tseq[wstart + i], true);
        quals[[c, 0]] = normalize_qual(aln.tqual[wstart + i]);
        for j in 0..max_ins[i] as usize {
            bases[[c + 1 + j, 0]] = GAP_CLASS;
        }
    }

    for (r, ow) in ovls.iter().enumerate() {
        let row = r + 1;
        let fwd = aln.overlaps[ow.overlap_idx].fwd;
        let qseq = &aln.qseqs[ow.overlap_idx];
        let qqual = &aln.quals[ow.overlap_idx];

        let mut t = ow.tstart;
        let mut q = ow.qstart;
        for op in window_ops(&aln.cigars[ow.overlap_idx], ow) {
            match op {
                CigarOp::Match(l) => {
                    for _ in 0..l {
                        let c = col_of[t - wstart];
                        bases[[c, row]] = encode_base(qseq[q], fwd);
                        quals[[c, row]] = normalize_qual(qqual[q]);
                        t += 1;
                        q += 1;
                    }
                }
                CigarOp::Deletion(l) => {
                    for _ in 0..l {
                        bases[[col_of[t - wstart], row]] = GAP_CLASS;
                        t += 1;
                    }
                }
                CigarOp::Insertion(l) => {
                    if t == ow.tstart {
                        q += l as usize;
                        continue;
                    }
                    let anchor = col_of[t - 1 - wstart];
                    for j in 0..l as usize {
                        bases[[anchor + 1 + j, row]] = encode_base(qseq[q + j], fwd);
                        quals[[anchor + 1 + j, row]] = normalize_qual(qqual[q + j]);
                    }
                    q += l as usize;
                }
            }
        }

        ensure!(
            q == ow.qend,
            "read {} window {}: CIGAR slice consumed {} query bases, expected {}",
            aln.read_name,
            window_idx,
            q - ow.qstart,
            ow.qend - ow.qstart
        );
    }

    let mut supported = Vec::new();
    for c in 0..width {
        let target_class = fold_strand(bases[[c, 0]]);
        let mut coverage = 0usize;
        let mut disagrees = false;
        for r in 0..n_alns {
            let b = bases[[c, r]];
            if b == NO_COVERAGE {
                continue;
            }
            coverage += 1;
            if r > 0 && fold_strand(b) != target_class {
                disagrees = true;
            }
        }
        if coverage >= min_coverage && disagrees {
            supported.push(c);
        }
    }

    if supported.is_empty() {
        return Ok(WindowDecision::Trivial(target_slice(aln, wstart, wend)));
    }

    let indices = Array1::from_iter(supported.iter().map(|&c| c as i64));
    Ok(WindowDecision::Infer(WindowFeatures {
        read_name: aln.read_name.clone(),
        window_idx,
        bases,
        quals,
        indices,
        length: width,
        n_alns,
        supported,
        inferred_bases: None,
    }))
}
