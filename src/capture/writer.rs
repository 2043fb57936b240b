/// Bounded async write queue for captured interactions.
///
/// The proxy's hot path enqueues and moves on; a single worker drains
/// the queue and runs the encrypt-and-persist pipeline. Overflow drops
/// the job (the caller sees `false` and a counter ticks); transient
/// storage failures are retried a couple of times before the job is
/// abandoned. Shutdown closes the queue and drains what is left.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::capture::encryptor::{InteractionEncryptor, PlainInteraction};
use crate::error::CoreError;

const STORAGE_RETRIES: u32 = 2;

pub struct CaptureWriter {
    tx: mpsc::Sender<PlainInteraction>,
    depth: usize,
    dropped: Arc<AtomicU64>,
    handle: tokio::task::JoinHandle<()>,
}

impl CaptureWriter {
    pub fn spawn(encryptor: Arc<InteractionEncryptor>, depth: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<PlainInteraction>(depth);
        let dropped = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let user_id = job.user_id.clone();
                let mut attempt = 0;
                loop {
                    match encryptor.encrypt_interaction(&job).await {
                        Ok(id) => {
                            tracing::debug!(interaction_id = %id, "queued interaction persisted");
                            break;
                        }
                        Err(CoreError::Storage(e)) if attempt < STORAGE_RETRIES => {
                            attempt += 1;
                            tracing::warn!(
                                %user_id,
                                attempt,
                                error = %e,
                                "transient storage failure, retrying capture write"
                            );
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        Err(e) => {
                            tracing::warn!(%user_id, error = %e, "abandoning queued interaction");
                            break;
                        }
                    }
                }
            }
            tracing::debug!("capture writer drained");
        });

        Self {
            tx,
            depth,
            dropped,
            handle,
        }
    }

    /// Enqueue an interaction for encryption and persistence.
    /// Returns `false` when the queue is full and the job was dropped.
    pub fn enqueue(&self, job: PlainInteraction) -> bool {
        let used = self.depth - self.tx.capacity();
        if used * 10 >= self.depth * 8 {
            tracing::warn!(used, depth = self.depth, "capture write queue above 80%");
        }

        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("capture write queue full, dropping interaction");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("capture writer is shut down, dropping interaction");
                false
            }
        }
    }

    /// Number of jobs dropped on overflow since startup.
    pub fn dropped_jobs(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Close the queue and wait for the remaining jobs to persist.
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "capture writer task failed during shutdown");
        }
    }
}
