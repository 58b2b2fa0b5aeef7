use std::io::Write;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use noodles::fasta;
use noodles::fasta::record::{Definition, Sequence};

use crate::consensus::CorrectedRead;

pub fn corrected_to_record(read: &CorrectedRead) -> fasta::Record {
    let definition = Definition::new(read.name.clone().into_bytes(), None);
    let sequence = Sequence::from(read.seq.clone().into_bytes());
    fasta::Record::new(definition, sequence)
}

/// Drain corrected reads into a FASTA writer on a dedicated thread; the
/// thread exits when every sender is gone and reports how many records it
/// wrote.
pub fn spawn_fasta_writer<W>(
    mut writer: fasta::Writer<W>,
    receiver: Receiver<CorrectedRead>,
) -> JoinHandle<Result<usize>>
where
    W: Write + Send + 'static,
{
    thread::spawn(move || {
        let mut written = 0usize;
        while let Ok(read) = receiver.recv() {
            writer
                .write_record(&corrected_to_record(&read))
                .with_context(|| format!("failed to write corrected read {}", read.name))?;
            written += 1;
        }
        Ok(written)
    })
}
