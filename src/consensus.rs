use anyhow::{anyhow, ensure, Context, Result};

use crate::features::{WindowFeatures, BASE_CLASSES};

/// Output alphabet of the inference backend.
pub const CONSENSUS_BASES: [u8; 5] = *b"ACGT*";

/// A corrected output record. `name` carries a `:<k>` suffix when a read
/// was split into multiple sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectedRead {
    pub name: String,
    pub seq: String,
}

fn decode_class(class: i8) -> Result<u8> {
    let base = usize::try_from(class)
        .ok()
        .and_then(|i| BASE_CLASSES.get(i))
        .ok_or_else(|| anyhow!("invalid target-row base class {}", class))?;
    Ok(match *base {
        b'#' => b'N',
        b => b.to_ascii_uppercase(),
    })
}

/// Translate a window's predictions into its corrected string: the inferred
/// base at every supported column over a copy of the target row, gaps
/// stripped. An empty string is a valid result and marks a gap in the read.
pub fn decode_window(wf: &WindowFeatures) -> Result<String> {
    let inferred = wf
        .inferred_bases
        .as_ref()
        .with_context(|| format!("window {} of read {} has no predictions", wf.window_idx, wf.read_name))?;
    ensure!(
        inferred.len() == wf.supported.len(),
        "read {} window {}: {} predictions for {} supported columns",
        wf.read_name,
        wf.window_idx,
        inferred.len(),
        wf.supported.len()
    );

    let mut out = String::with_capacity(wf.length);
    let mut next = wf.supported.iter().zip(inferred.iter()).peekable();
    for col in 0..wf.length {
        let base = match next.peek() {
            Some(&(&c, &b)) if c == col => {
                next.next();
                b
            }
            _ => decode_class(wf.bases[[col, 0]])?,
        };
        if base != b'*' {
            out.push(base as char);
        }
    }
    Ok(out)
}

/// Concatenate per-window consensus strings: maximal runs of non-empty
/// strings are joined in order, empty strings act as separators.
pub fn concat_consensus(windows: &[String]) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut buf = String::new();
    for window in windows {
        if window.is_empty() {
            if !buf.is_empty() {
                pieces.push(std::mem::take(&mut buf));
            }
        } else {
            buf.push_str(window);
        }
    }
    if !buf.is_empty() {
        pieces.push(buf);
    }
    pieces
}

/// Turn the concatenated pieces of one read into output records, applying
/// the `:<k>` suffix rule when the read was split on gaps.
pub fn assemble_outputs(name: &str, mut pieces: Vec<String>) -> Vec<CorrectedRead> {
    if pieces.len() == 1 {
        return vec![CorrectedRead {
            name: name.to_string(),
            seq: pieces.remove(0),
        }];
    }
    pieces
        .into_iter()
        .enumerate()
        .map(|(k, seq)| CorrectedRead {
            name: format!("{}:{}", name, k),
            seq,
        })
        .collect()
}
