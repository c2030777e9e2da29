use std::num::NonZeroUsize;

use crate::api::DetectionRecord;
use crate::error::SubmitError;

/// An ordered, non-empty group of records submitted in one exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    sequence: u64,
    records: Vec<DetectionRecord>,
}

impl Batch {
    pub fn new(sequence: u64, records: Vec<DetectionRecord>) -> Self {
        debug_assert!(!records.is_empty(), "batches are never empty");
        Self { sequence, records }
    }

    /// 0-based position of this batch in the run, for diagnostics.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn records(&self) -> &[DetectionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Lazily slices a record stream into [`Batch`]es of at most `batch_size`.
///
/// Only the batch being built is held in memory, so the source can be an
/// arbitrarily large reader-backed iterator.
pub struct Batcher<I> {
    records: I,
    batch_size: NonZeroUsize,
    next_sequence: u64,
}

impl<I> Batcher<I>
where
    I: Iterator<Item = DetectionRecord>,
{
    pub fn new<S>(records: S, batch_size: usize) -> Result<Self, SubmitError>
    where
        S: IntoIterator<IntoIter = I>,
    {
        let batch_size = NonZeroUsize::new(batch_size).ok_or_else(|| {
            SubmitError::InvalidConfiguration("batch_size must be greater than zero".into())
        })?;
        Ok(Self {
            records: records.into_iter(),
            batch_size,
            next_sequence: 0,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size.get()
    }
}

impl<I> Iterator for Batcher<I>
where
    I: Iterator<Item = DetectionRecord>,
{
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let records: Vec<DetectionRecord> =
            self.records.by_ref().take(self.batch_size.get()).collect();
        if records.is_empty() {
            return None;
        }
        let batch = Batch::new(self.next_sequence, records);
        self.next_sequence += 1;
        Some(batch)
    }
}
