//! Fixed-size worker pool streaming results over a bounded channel.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use crossbeam_channel::{Receiver, bounded, unbounded};
use tracing::debug;

use crate::error::{Error, StorageError};

/// Results of a pool run, in completion order.
///
/// Dropping the stream cancels the run: idle workers stop picking up inputs
/// and busy ones exit after their current job.
pub struct PoolStream<T> {
    results: Receiver<T>,
    cancel: Arc<AtomicBool>,
    remaining: usize,
}

impl<T> PoolStream<T> {
    /// Jobs not yet delivered.
    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl<T> Iterator for PoolStream<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        if self.remaining == 0 {
            return None;
        }
        // Err means every worker has exited.
        let item = self.results.recv().ok()?;
        self.remaining -= 1;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

impl<T> Drop for PoolStream<T> {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

/// Run `job` over every input on `workers` threads.
///
/// `job` is expected to handle its own failures; a panicking job takes its
/// worker down and its result is never delivered.
pub fn spawn<I, T, F>(
    inputs: Vec<I>,
    workers: usize,
    buffer: usize,
    job: F,
) -> Result<PoolStream<T>, Error>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> T + Send + Sync + 'static,
{
    let remaining = inputs.len();
    let (job_tx, job_rx) = unbounded();
    for input in inputs {
        // The receiver is alive in this scope, so sending cannot fail.
        let _ = job_tx.send(input);
    }
    drop(job_tx);

    let (result_tx, result_rx) = bounded(buffer.max(1));
    let cancel = Arc::new(AtomicBool::new(false));
    let job = Arc::new(job);
    let workers = workers.clamp(1, remaining.max(1));
    debug!(jobs = remaining, workers, "starting worker pool");

    for i in 0..workers {
        let job_rx: Receiver<I> = job_rx.clone();
        let result_tx = result_tx.clone();
        let cancel = Arc::clone(&cancel);
        let job = Arc::clone(&job);
        thread::Builder::new()
            .name(format!("skycat-worker-{i}"))
            .spawn(move || {
                while !cancel.load(Ordering::SeqCst) {
                    let Ok(input) = job_rx.recv() else {
                        break;
                    };
                    if result_tx.send(job(input)).is_err() {
                        break;
                    }
                }
            })
            .map_err(StorageError::Io)?;
    }
    drop(result_tx);

    Ok(PoolStream {
        results: result_rx,
        cancel,
        remaining,
    })
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic::catch_unwind;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_every_input_delivered_once() {
        let stream = spawn((0..100u64).collect(), 4, 8, |x| x * 2).unwrap();
        let mut out: Vec<u64> = stream.collect();
        out.sort_unstable();
        assert_eq!(out, (0..100u64).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_empty_input() {
        let mut stream = spawn(Vec::<u32>::new(), 4, 8, |x| x).unwrap();
        assert_eq!(stream.remaining(), 0);
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_drop_cancels_outstanding_jobs() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let mut stream = spawn((0..1000u32).collect(), 1, 1, move |x| {
            counter.fetch_add(1, Ordering::SeqCst);
            x
        })
        .unwrap();
        assert!(stream.next().is_some());
        drop(stream);
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(ran.load(Ordering::SeqCst) < 1000);
    }

    #[test]
    fn test_panic_message() {
        let err = catch_unwind(|| panic!("bad cell")).unwrap_err();
        assert_eq!(panic_message(err), "bad cell");
        let err = catch_unwind(|| panic!("{} rows", 3)).unwrap_err();
        assert_eq!(panic_message(err), "3 rows");
    }
}
