use anyhow::{ensure, Result};

use crate::overlaps::{CigarOp, CorrectionAlignments};

/// The slice of one overlap that falls inside a single target window.
///
/// The CIGAR slice is fractional at both ends: `(idx, offset)` addresses a
/// position `offset` runs into `cigar[idx]`, so a run crossing a window
/// boundary is split exactly. An end offset of 0 excludes `cigar[end_idx]`
/// entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlapWindow {
    pub overlap_idx: usize,
    /// Absolute target position where this slice starts.
    pub tstart: usize,
    /// Query interval consumed by this slice, in target orientation.
    pub qstart: usize,
    pub qend: usize,
    pub cigar_start_idx: usize,
    pub cigar_start_offset: u32,
    pub cigar_end_idx: usize,
    pub cigar_end_offset: u32,
    /// Target bases consumed by this slice.
    pub t_len: usize,
}

pub fn window_count(tlen: usize, window_size: usize) -> usize {
    tlen.div_ceil(window_size)
}

struct SliceCursor {
    t: usize,
    q: usize,
    cigar_idx: usize,
    cigar_offset: u32,
}

/// Partition every overlap of `aln` into the fixed-width target windows it
/// intersects. Returns one entry per window; an overlap contributes to a
/// window only when its slice consumes target bases and covers at least
/// `min_fraction` of the window.
pub fn extract_windows(
    aln: &CorrectionAlignments,
    window_size: usize,
    min_fraction: f32,
) -> Result<Vec<Vec<OverlapWindow>>> {
    ensure!(window_size > 0, "window size must be positive");

    let tlen = aln.tseq.len();
    let n_windows = window_count(tlen, window_size);
    let mut windows = vec![Vec::new(); n_windows];

    for (overlap_idx, (overlap, cigar)) in aln.overlaps.iter().zip(&aln.cigars).enumerate() {
        let mut t = overlap.tstart;
        let mut q = overlap.qstart;
        let mut win = t / window_size;
        let mut slice = SliceCursor {
            t,
            q,
            cigar_idx: 0,
            cigar_offset: 0,
        };

        for (i, op) in cigar.iter().enumerate() {
            let (t_adv, q_adv) = op.advances();
            if t_adv == 0 {
                // Insertions never cross a target boundary; they stay in
                // whichever slice is currently open.
                q += q_adv as usize;
                continue;
            }

            let mut consumed = 0u32;
            while consumed < op.len() {
                let boundary = (win + 1) * window_size;
                let take = ((boundary - t) as u32).min(op.len() - consumed);
                t += take as usize;
                if q_adv > 0 {
                    q += take as usize;
                }
                consumed += take;

                if t == boundary {
                    emit(
                        &mut windows,
                        win,
                        overlap_idx,
                        &slice,
                        q,
                        i,
                        consumed,
                        t,
                        window_size,
                        tlen,
                        min_fraction,
                    );
                    win += 1;
                    slice = if consumed == op.len() {
                        SliceCursor {
                            t,
                            q,
                            cigar_idx: i + 1,
                            cigar_offset: 0,
                        }
                    } else {
                        SliceCursor {
                            t,
                            q,
                            cigar_idx: i,
                            cigar_offset: consumed,
                        }
                    };
                }
            }
        }

        if t > slice.t && win < n_windows {
            emit(
                &mut windows,
                win,
                overlap_idx,
                &slice,
                q,
                cigar.len(),
                0,
                t,
                window_size,
                tlen,
                min_fraction,
            );
        }
    }

    Ok(windows)
}

#[allow(clippy::too_many_arguments)]
fn emit(
    windows: &mut [Vec<OverlapWindow>],
    win: usize,
    overlap_idx: usize,
    slice: &SliceCursor,
    qend: usize,
    cigar_end_idx: usize,
    cigar_end_offset: u32,
    tend: usize,
    window_size: usize,
    tlen: usize,
    min_fraction: f32,
) {
    let t_len = tend - slice.t;
    if t_len == 0 {
        return;
    }
    let window_len = (tlen.min((win + 1) * window_size) - win * window_size) as f32;
    if (t_len as f32) < min_fraction * window_len {
        return;
    }
    windows[win].push(OverlapWindow {
        overlap_idx,
        tstart: slice.t,
        qstart: slice.q,
        qend,
        cigar_start_idx: slice.cigar_idx,
        cigar_start_offset: slice.cigar_offset,
        cigar_end_idx,
        cigar_end_offset,
        t_len,
    });
}

/// Materialize the CIGAR runs covered by an [`OverlapWindow`], clipping the
/// boundary runs to their offsets.
pub fn window_ops(cigar: &[CigarOp], ow: &OverlapWindow) -> Vec<CigarOp> {
    let end = if ow.cigar_end_offset > 0 {
        ow.cigar_end_idx + 1
    } else {
        ow.cigar_end_idx
    };

    let mut ops = Vec::with_capacity(end - ow.cigar_start_idx);
    for i in ow.cigar_start_idx..end {
        let mut len = cigar[i].len();
        if i == ow.cigar_end_idx && ow.cigar_end_offset > 0 {
            len = ow.cigar_end_offset;
        }
        if i == ow.cigar_start_idx {
            len -= ow.cigar_start_offset;
        }
        if len > 0 {
            ops.push(cigar[i].with_len(len));
        }
    }
    ops
}
