use std::num::NonZeroU64;

use ndarray::Array1;
use training_loop_orchestration::{
    at, elapse, every, logs::METRICS, Batch, Every, History, Logs,
};

fn nz(n: u64) -> NonZeroU64 {
    NonZeroU64::new(n).unwrap()
}

fn batches(sizes: &[usize]) -> Vec<Batch> {
    sizes
        .iter()
        .map(|&n| Batch::new().with("x", Array1::<f32>::zeros(n).into_dyn()))
        .collect()
}

#[test]
fn step_trigger_follows_the_loop() {
    let mut log_every = every(nz(3));
    let mut offset = Every::steps(nz(4)).with_offset(1);

    let mut logged = Vec::new();
    let mut shifted = Vec::new();
    for (elapsed, _) in elapse(batches(&[2; 10])) {
        if log_every.fire(&elapsed) {
            logged.push(elapsed.steps);
        }
        if offset.fire(&elapsed) {
            shifted.push(elapsed.steps);
        }
    }

    assert_eq!(logged, vec![0, 3, 6, 9]);
    assert_eq!(shifted, vec![1, 5, 9]);
}

#[test]
fn sample_trigger_fires_at_most_once_per_period() {
    let mut trigger = Every::samples(nz(10));

    let mut fired = Vec::new();
    for (elapsed, _) in elapse(batches(&[3, 7, 4, 4, 9, 1, 2, 8, 5, 5])) {
        if trigger.fire(&elapsed) {
            fired.push(elapsed.samples);
        }
    }

    assert!(!fired.is_empty());
    assert!(fired[0] >= 10);
    for pair in fired.windows(2) {
        assert!(pair[1] - pair[0] >= 10, "fired at {pair:?}");
    }
}

#[test]
fn loop_stops_at_period_and_history_aligns_series() {
    let end = at(nz(5));
    let mut record = every(nz(2));
    let mut history = History::new();

    let mut last = 0;
    for (elapsed, batch) in elapse(batches(&[4; 100])) {
        if record.fire(&elapsed) {
            let logs = Logs::new().with(METRICS, "size", batch.batch_size() as f32);
            history.commit_logs(&elapsed, &logs);
        }
        last = elapsed.steps;
        if elapsed.reached(&end) {
            break;
        }
    }

    assert_eq!(last, 5);
    let series = history.collect(&["steps", "samples", "size"]);
    assert_eq!(series[0], vec![0.0, 2.0, 4.0]);
    assert_eq!(series[1], vec![0.0, 8.0, 16.0]);
    assert_eq!(series[2], vec![4.0; 3]);
}
