use std::str::FromStr;

use anyhow::{anyhow, ensure, Context, Result};

/// A single CIGAR operation run. `Match` consumes both target and query,
/// `Insertion` consumes query only, `Deletion` consumes target only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CigarOp {
    Match(u32),
    Insertion(u32),
    Deletion(u32),
}

impl CigarOp {
    pub fn len(&self) -> u32 {
        match self {
            Self::Match(l) | Self::Insertion(l) | Self::Deletion(l) => *l,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn with_len(&self, length: u32) -> Self {
        match self {
            Self::Match(_) => Self::Match(length),
            Self::Insertion(_) => Self::Insertion(length),
            Self::Deletion(_) => Self::Deletion(length),
        }
    }

    /// (target advance, query advance) for the full run.
    pub fn advances(&self) -> (u32, u32) {
        match self {
            Self::Match(l) => (*l, *l),
            Self::Insertion(l) => (0, *l),
            Self::Deletion(l) => (*l, 0),
        }
    }
}

impl FromStr for CigarOp {
    type Err = anyhow::Error;

    fn from_str(run: &str) -> Result<Self, Self::Err> {
        let count = run[..run.len() - 1]
            .parse::<u32>()
            .with_context(|| format!("failed to parse CIGAR run count: {}", run))?;
        match run
            .chars()
            .last()
            .with_context(|| format!("empty CIGAR run: {}", run))?
        {
            'M' | '=' | 'X' => Ok(CigarOp::Match(count)),
            'I' => Ok(CigarOp::Insertion(count)),
            'D' => Ok(CigarOp::Deletion(count)),
            c => Err(anyhow!("unknown CIGAR operation: {}", c)),
        }
    }
}

/// Split a CIGAR string into runs and parse each one.
pub fn parse_cigar(cigar: &str) -> Result<Vec<CigarOp>> {
    cigar
        .split_inclusive(char::is_alphabetic)
        .map(|run| {
            run.parse()
                .with_context(|| format!("failed to parse CIGAR run: {}", run))
        })
        .collect()
}

#[inline]
fn complement(base: u8) -> u8 {
    match base {
        b'A' => b'T',
        b'C' => b'G',
        b'G' => b'C',
        b'T' => b'A',
        b'a' => b't',
        b'c' => b'g',
        b'g' => b'c',
        b't' => b'a',
        _ => b'N',
    }
}

pub fn reverse_complement(seq: &[u8]) -> Vec<u8> {
    seq.iter().rev().map(|b| complement(*b)).collect()
}

/// An overlap of one query read against the target read, in target
/// orientation after [`CorrectionAlignments::normalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlap {
    pub tstart: usize,
    pub tend: usize,
    pub tlen: usize,
    pub qstart: usize,
    pub qend: usize,
    pub qlen: usize,
    pub fwd: bool,
}

/// One target read together with everything aligned against it: parallel
/// lists of query sequences, qualities, overlaps and CIGARs.
#[derive(Debug, Clone)]
pub struct CorrectionAlignments {
    pub read_name: String,
    pub tseq: Vec<u8>,
    pub tqual: Vec<u8>,
    pub qseqs: Vec<Vec<u8>>,
    pub quals: Vec<Vec<u8>>,
    pub overlaps: Vec<Overlap>,
    pub cigars: Vec<Vec<CigarOp>>,
}

impl CorrectionAlignments {
    /// Orient every reverse-strand query to the target strand so feature
    /// extraction can walk both axes left to right. Sequences are
    /// reverse-complemented, qualities reversed and query coordinates
    /// flipped; `fwd` keeps the original strand for row encoding.
    pub fn normalize(&mut self) {
        for (i, overlap) in self.overlaps.iter_mut().enumerate() {
            if overlap.fwd {
                continue;
            }
            self.qseqs[i] = reverse_complement(&self.qseqs[i]);
            self.quals[i].reverse();
            let (qstart, qend) = (overlap.qlen - overlap.qend, overlap.qlen - overlap.qstart);
            overlap.qstart = qstart;
            overlap.qend = qend;
        }
    }

    /// Validate recorded lengths, coordinate bounds and CIGAR spans for
    /// every overlap. A failure aborts the whole message.
    pub fn check_consistent_overlaps(&self) -> Result<()> {
        ensure!(
            self.qseqs.len() == self.overlaps.len()
                && self.quals.len() == self.overlaps.len()
                && self.cigars.len() == self.overlaps.len(),
            "read {}: ragged alignment lists",
            self.read_name
        );
        ensure!(
            self.tqual.len() == self.tseq.len(),
            "read {}: quality length {} does not match sequence length {}",
            self.read_name,
            self.tqual.len(),
            self.tseq.len()
        );

        for (i, overlap) in self.overlaps.iter().enumerate() {
            self.check_overlap(i, overlap)
                .with_context(|| format!("read {}: inconsistent overlap {}", self.read_name, i))?;
        }

        Ok(())
    }

    fn check_overlap(&self, i: usize, overlap: &Overlap) -> Result<()> {
        ensure!(
            overlap.tlen == self.tseq.len(),
            "recorded target length {} does not match sequence length {}",
            overlap.tlen,
            self.tseq.len()
        );
        ensure!(
            overlap.qlen == self.qseqs[i].len(),
            "recorded query length {} does not match sequence length {}",
            overlap.qlen,
            self.qseqs[i].len()
        );
        ensure!(
            self.quals[i].len() == self.qseqs[i].len(),
            "query quality length {} does not match sequence length {}",
            self.quals[i].len(),
            self.qseqs[i].len()
        );
        ensure!(
            overlap.tstart < overlap.tend && overlap.tend <= overlap.tlen,
            "target range {}..{} out of bounds for length {}",
            overlap.tstart,
            overlap.tend,
            overlap.tlen
        );
        ensure!(
            overlap.qstart < overlap.qend && overlap.qend <= overlap.qlen,
            "query range {}..{} out of bounds for length {}",
            overlap.qstart,
            overlap.qend,
            overlap.qlen
        );

        let (tspan, qspan) = self.cigars[i].iter().fold((0usize, 0usize), |(t, q), op| {
            let (ta, qa) = op.advances();
            (t + ta as usize, q + qa as usize)
        });
        ensure!(
            tspan == overlap.tend - overlap.tstart,
            "CIGAR consumes {} target bases but the overlap spans {}",
            tspan,
            overlap.tend - overlap.tstart
        );
        ensure!(
            qspan == overlap.qend - overlap.qstart,
            "CIGAR consumes {} query bases but the overlap spans {}",
            qspan,
            overlap.qend - overlap.qstart
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_overlap(tlen: usize, qlen: usize, fwd: bool) -> Overlap {
        Overlap {
            tstart: 0,
            tend: tlen,
            tlen,
            qstart: 0,
            qend: qlen,
            qlen,
            fwd,
        }
    }

    #[test]
    fn parse_cigar_accepts_match_aliases() {
        let ops = parse_cigar("4M2I3=1X2D").unwrap();
        assert_eq!(
            ops,
            vec![
                CigarOp::Match(4),
                CigarOp::Insertion(2),
                CigarOp::Match(3),
                CigarOp::Match(1),
                CigarOp::Deletion(2),
            ]
        );
    }

    #[test]
    fn parse_cigar_rejects_unknown_op() {
        assert!(parse_cigar("4M3S").is_err());
    }

    #[test]
    fn reverse_complement_handles_ambiguous() {
        assert_eq!(reverse_complement(b"ACGTN"), b"NACGT".to_vec());
    }

    #[test]
    fn normalize_flips_reverse_strand_queries() {
        let mut aln = CorrectionAlignments {
            read_name: "read".into(),
            tseq: b"ACGT".to_vec(),
            tqual: vec![b'?'; 4],
            qseqs: vec![b"AAACGT".to_vec()],
            quals: vec![b"012345".to_vec()],
            overlaps: vec![Overlap {
                tstart: 0,
                tend: 4,
                tlen: 4,
                qstart: 0,
                qend: 4,
                qlen: 6,
                fwd: false,
            }],
            cigars: vec![vec![CigarOp::Match(4)]],
        };

        aln.normalize();

        assert_eq!(aln.qseqs[0], b"ACGTTT".to_vec());
        assert_eq!(aln.quals[0], b"543210".to_vec());
        assert_eq!(aln.overlaps[0].qstart, 2);
        assert_eq!(aln.overlaps[0].qend, 6);
    }

    #[test]
    fn consistency_accepts_matching_cigar() {
        let aln = CorrectionAlignments {
            read_name: "read".into(),
            tseq: b"ACGTACGT".to_vec(),
            tqual: vec![b'?'; 8],
            qseqs: vec![b"ACGTACGT".to_vec()],
            quals: vec![vec![b'?'; 8]],
            overlaps: vec![full_overlap(8, 8, true)],
            cigars: vec![vec![CigarOp::Match(8)]],
        };
        assert!(aln.check_consistent_overlaps().is_ok());
    }

    #[test]
    fn consistency_rejects_bad_cigar_span() {
        let aln = CorrectionAlignments {
            read_name: "read".into(),
            tseq: b"ACGTACGT".to_vec(),
            tqual: vec![b'?'; 8],
            qseqs: vec![b"ACGTACGT".to_vec()],
            quals: vec![vec![b'?'; 8]],
            overlaps: vec![full_overlap(8, 8, true)],
            cigars: vec![vec![CigarOp::Match(7)]],
        };
        assert!(aln.check_consistent_overlaps().is_err());
    }

    #[test]
    fn consistency_rejects_wrong_recorded_length() {
        let aln = CorrectionAlignments {
            read_name: "read".into(),
            tseq: b"ACGTACGT".to_vec(),
            tqual: vec![b'?'; 8],
            qseqs: vec![b"ACGT".to_vec()],
            quals: vec![vec![b'?'; 4]],
            overlaps: vec![full_overlap(8, 8, true)],
            cigars: vec![vec![CigarOp::Match(8)]],
        };
        assert!(aln.check_consistent_overlaps().is_err());
    }
}
