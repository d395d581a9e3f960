//! Priority queue for jobs that could not be scheduled immediately.
//!
//! Entries are ordered by `(priority, sequence)`: lower priority values are
//! more urgent and equal priorities leave in arrival order. There is no
//! aging; a steady stream of urgent work can hold back less urgent jobs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use super::job::{Job, JobOutcome};

/// Queue overflow. Hands the rejected job back to the caller.
#[derive(Debug, thiserror::Error)]
#[error("Job queue is full ({capacity} entries)")]
pub struct QueueFull {
    pub capacity: usize,
    pub job: Box<Job>,
}

/// A job waiting for capacity.
#[derive(Debug)]
pub struct QueueEntry {
    pub job: Job,
    /// Channel to the waiting caller, if any.
    pub responder: Option<oneshot::Sender<JobOutcome>>,
    /// When the job first entered the queue.
    pub enqueued_at: Instant,
    seq: u64,
}

impl QueueEntry {
    /// Send the outcome to the waiting caller, if it is still listening.
    pub fn respond(self, outcome: JobOutcome) {
        if let Some(tx) = self.responder {
            let _ = tx.send(outcome);
        }
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap; reverse so the smallest (priority, seq) pops first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .job
            .priority
            .cmp(&self.job.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Bounded, linearizable priority queue.
pub struct JobQueue {
    heap: Mutex<BinaryHeap<QueueEntry>>,
    capacity: usize,
    next_seq: AtomicU64,
    /// Notifier for when new entries are added.
    notify: Arc<Notify>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            capacity,
            next_seq: AtomicU64::new(0),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Get a reference to the notifier for waiting on new entries.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a job. Fails immediately when the queue is full.
    pub fn enqueue(
        &self,
        job: Job,
        responder: Option<oneshot::Sender<JobOutcome>>,
    ) -> Result<(), QueueFull> {
        {
            let mut heap = self.heap.lock();
            if heap.len() >= self.capacity {
                return Err(QueueFull {
                    capacity: self.capacity,
                    job: Box::new(job),
                });
            }
            let seq = self.next_seq.fetch_add(1, AtomicOrdering::Relaxed);
            tracing::debug!(job_id = %job.id, priority = job.priority, depth = heap.len() + 1, "job queued");
            heap.push(QueueEntry {
                job,
                responder,
                enqueued_at: Instant::now(),
                seq,
            });
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Most urgent entry, if any.
    pub fn dequeue(&self) -> Option<QueueEntry> {
        self.heap.lock().pop()
    }

    /// Put back an entry taken by [`dequeue`](Self::dequeue) or
    /// [`drain`](Self::drain). It keeps its original position and is never
    /// rejected for capacity.
    pub fn requeue(&self, entry: QueueEntry) {
        self.heap.lock().push(entry);
    }

    /// Remove every entry, most urgent first.
    pub fn drain(&self) -> Vec<QueueEntry> {
        let mut heap = self.heap.lock();
        let mut entries = Vec::with_capacity(heap.len());
        while let Some(entry) = heap.pop() {
            entries.push(entry);
        }
        entries
    }

    /// Take a specific job out of the queue.
    pub fn remove(&self, job_id: &str) -> Option<QueueEntry> {
        let mut heap = self.heap.lock();
        if !heap.iter().any(|e| e.job.id == job_id) {
            return None;
        }
        let mut removed = None;
        let rest: Vec<QueueEntry> = std::mem::take(&mut *heap)
            .into_vec()
            .into_iter()
            .filter_map(|e| {
                if removed.is_none() && e.job.id == job_id {
                    removed = Some(e);
                    None
                } else {
                    Some(e)
                }
            })
            .collect();
        *heap = BinaryHeap::from(rest);
        removed
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.heap.lock().iter().any(|e| e.job.id == job_id)
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_job;

    fn job(prompt: &str, priority: u8) -> Job {
        let mut job = test_job(prompt);
        job.priority = priority;
        job
    }

    fn prompts(entries: &[QueueEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.job.prompt.as_str()).collect()
    }

    #[test]
    fn test_priority_then_fifo() {
        let queue = JobQueue::new(8);
        queue.enqueue(job("A", 1), None).unwrap();
        queue.enqueue(job("B", 1), None).unwrap();
        queue.enqueue(job("C", 0), None).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|e| e.job.prompt)
            .collect();
        assert_eq!(order, vec!["C", "A", "B"]);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_full_queue_rejects_and_returns_job() {
        let queue = JobQueue::new(2);
        queue.enqueue(job("A", 1), None).unwrap();
        queue.enqueue(job("B", 1), None).unwrap();

        let err = queue.enqueue(job("C", 0), None).unwrap_err();
        assert_eq!(err.capacity, 2);
        assert_eq!(err.job.prompt, "C");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_requeue_keeps_position() {
        let queue = JobQueue::new(4);
        queue.enqueue(job("A", 1), None).unwrap();
        queue.enqueue(job("B", 1), None).unwrap();

        let first = queue.dequeue().unwrap();
        assert_eq!(first.job.prompt, "A");
        queue.enqueue(job("D", 1), None).unwrap();
        queue.requeue(first);

        let drained = queue.drain();
        assert_eq!(prompts(&drained), vec!["A", "B", "D"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_requeue_ignores_capacity() {
        let queue = JobQueue::new(1);
        queue.enqueue(job("A", 1), None).unwrap();
        let entries = queue.drain();
        queue.enqueue(job("B", 0), None).unwrap();
        for entry in entries {
            queue.requeue(entry);
        }
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_remove() {
        let queue = JobQueue::new(4);
        let a = job("A", 2);
        let a_id = a.id.clone();
        queue.enqueue(a, None).unwrap();
        queue.enqueue(job("B", 1), None).unwrap();
        queue.enqueue(job("C", 3), None).unwrap();

        assert!(queue.contains(&a_id));
        let removed = queue.remove(&a_id).unwrap();
        assert_eq!(removed.job.prompt, "A");
        assert!(queue.remove(&a_id).is_none());
        assert_eq!(prompts(&queue.drain()), vec!["B", "C"]);
    }

    #[tokio::test]
    async fn test_respond_delivers_outcome() {
        let queue = JobQueue::new(1);
        let (tx, rx) = oneshot::channel();
        queue.enqueue(job("A", 1), Some(tx)).unwrap();

        let entry = queue.dequeue().unwrap();
        let response = entry.job.response(
            dispatch_common::JobStatus::Cancelled,
            Job::queued_scheduling(),
            None,
            None,
        );
        entry.respond(JobOutcome::completed(response));

        let outcome = rx.await.unwrap();
        assert_eq!(outcome.response.status, dispatch_common::JobStatus::Cancelled);
    }

    #[test]
    fn test_concurrent_enqueue_is_linearizable() {
        let queue = Arc::new(JobQueue::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        queue.enqueue(job(&format!("{}-{}", t, i), (i % 3) as u8), None).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let drained = queue.drain();
        assert_eq!(drained.len(), 400);
        assert!(drained.windows(2).all(|w| w[0].job.priority <= w[1].job.priority));
    }
}
