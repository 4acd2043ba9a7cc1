use ml_core::{Batch, Elapsed};

/// What a loop callback sees at one iteration.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub elapsed: Elapsed,
    pub batch: Batch,
}

/// Iterator adapter returned by [`elapse`].
#[derive(Debug)]
pub struct Elapse<I> {
    batches: I,
    elapsed: Option<Elapsed>,
    last_batch_size: usize,
}

impl<I> Iterator for Elapse<I>
where
    I: Iterator<Item = Batch>,
{
    type Item = (Elapsed, Batch);

    fn next(&mut self) -> Option<Self::Item> {
        let batch = self.batches.next()?;
        let elapsed = match self.elapsed {
            None => Elapsed::create(),
            Some(prev) => prev.update(self.last_batch_size),
        };
        self.elapsed = Some(elapsed);
        self.last_batch_size = batch.batch_size();
        Some((elapsed, batch))
    }
}

/// Pairs every batch with the loop progress at which it is consumed.
///
/// The first batch is seen at step 0 with no samples counted; each later batch
/// advances the step by one and the samples by the previous batch's size.
pub fn elapse<I>(batches: I) -> Elapse<I::IntoIter>
where
    I: IntoIterator<Item = Batch>,
{
    Elapse {
        batches: batches.into_iter(),
        elapsed: None,
        last_batch_size: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn batch(n: usize) -> Batch {
        Batch::new().with("x", Array2::<f32>::zeros((n, 2)).into_dyn())
    }

    #[test]
    fn counts_steps_from_zero() {
        let seen: Vec<(u64, u64)> = elapse(vec![batch(4), batch(4), batch(2)])
            .map(|(e, _)| (e.steps, e.samples))
            .collect();
        assert_eq!(seen, vec![(0, 0), (1, 4), (2, 8)]);
    }
}
