//! Piece digest verification, off the core task.
//!
//! Workers run on `spawn_blocking` threads and only ever see a detached,
//! fully assembled buffer; the buffer travels back with the verdict so its
//! next owner (persistence on success, the pool on failure) is decided on
//! the core task.

use bytes::BytesMut;
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct VerifyJob {
    pub piece: u32,
    pub expected: [u8; 20],
    pub buffer: BytesMut,
}

#[derive(Debug)]
pub struct Verdict {
    pub piece: u32,
    pub ok: bool,
    pub buffer: BytesMut,
    worker: usize,
}

#[derive(Debug)]
struct Worker {
    job_tx: mpsc::Sender<VerifyJob>,
    load: usize,
}

impl Worker {
    fn spawn(index: usize, verdict_tx: mpsc::Sender<Verdict>) -> Self {
        let (job_tx, mut job_rx) = mpsc::channel::<VerifyJob>(64);
        tokio::task::spawn_blocking(move || {
            while let Some(job) = job_rx.blocking_recv() {
                let digest: [u8; 20] = Sha1::digest(&job.buffer).into();
                let ok = digest == job.expected;
                if !ok {
                    tracing::warn!(piece = job.piece, "Piece digest mismatch");
                }
                let _ = verdict_tx.blocking_send(Verdict {
                    piece: job.piece,
                    ok,
                    buffer: job.buffer,
                    worker: index,
                });
            }
        });
        Self { job_tx, load: 0 }
    }
}

#[derive(Debug)]
pub struct Verifier {
    workers: Vec<Worker>,
    verdict_rx: mpsc::Receiver<Verdict>,
}

impl Verifier {
    pub fn new(worker_count: usize) -> Self {
        debug_assert!(worker_count > 0);
        tracing::debug!("Spawning {worker_count} digest workers");
        let (verdict_tx, verdict_rx) = mpsc::channel(128);
        let workers = (0..worker_count)
            .map(|i| Worker::spawn(i, verdict_tx.clone()))
            .collect();
        Self {
            workers,
            verdict_rx,
        }
    }

    /// Worker count from the host's physical cores, leaving room for the
    /// runtime itself.
    pub fn with_host_parallelism() -> Self {
        let system = sysinfo::System::new();
        let workers = system
            .physical_core_count()
            .map_or(2, |cores| (cores / 2).max(1));
        Self::new(workers)
    }

    pub async fn submit(&mut self, job: VerifyJob) {
        let worker = self
            .workers
            .iter_mut()
            .min_by_key(|w| w.load)
            .expect("at least one worker");
        worker.load += 1;
        worker.job_tx.send(job).await.expect("worker is alive");
    }

    /// Cancellation safe.
    pub async fn recv(&mut self) -> Verdict {
        let verdict = self
            .verdict_rx
            .recv()
            .await
            .expect("verifier keeps a sender per worker");
        self.workers[verdict.worker].load -= 1;
        verdict
    }

    pub fn try_recv(&mut self) -> Option<Verdict> {
        let verdict = self.verdict_rx.try_recv().ok()?;
        self.workers[verdict.worker].load -= 1;
        Some(verdict)
    }

    pub fn has_inflight(&self) -> bool {
        self.workers.iter().any(|w| w.load > 0)
    }
}
