//! The receiving side: listen, pull blocks over every accepted
//! connection, verify and write them, then coordinate shutdown.
//!
//! Workers race the pending queue against the shutdown signal, so a
//! shutdown never interrupts a block mid-transfer: it is only observed
//! between pulls. The coordinator is the sole writer of the destination
//! file and the only task that sequences the shutdown phases.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::blocks::TransferPlan;
use crate::cipher::KeyMaterial;
use crate::error::TransferError;
use crate::progress::SpeedReporter;
use crate::protocol::{self, tag};
use crate::queue::PendingQueue;

/// Settings for the recv role.
#[derive(Debug, Clone)]
pub struct CollectConfig {
    pub file: PathBuf,
    pub port: u16,
    pub block_size: u64,
    pub key: KeyMaterial,
}

/// A verified plaintext block waiting for its positional write.
struct Completed {
    index: u64,
    payload: Vec<u8>,
}

/// Pulls the whole file from whatever suppliers dial in. Returns once
/// every block is written and every worker has acknowledged the stop.
pub async fn collect(cfg: CollectConfig) -> Result<()> {
    let file_size = tokio::fs::metadata(&cfg.file)
        .await
        .with_context(|| format!("stat {} (run create first?)", cfg.file.display()))?
        .len();
    let plan = TransferPlan::new(file_size, cfg.block_size);
    let listener = TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .with_context(|| format!("listen on port {}", cfg.port))?;
    info!(
        port = cfg.port,
        file_size,
        block_size = cfg.block_size,
        blocks = plan.block_count(),
        "collecting blocks"
    );

    let block_slots = usize::try_from(plan.block_count()).unwrap_or(usize::MAX).max(1);
    let queue = PendingQueue::new(plan.block_count());
    let (done_tx, done_rx) = mpsc::channel::<Completed>(block_slots);
    let (ack_tx, ack_rx) = mpsc::unbounded_channel::<()>();
    let (fatal_tx, fatal_rx) = mpsc::channel::<TransferError>(1);
    let live = Arc::new(AtomicUsize::new(0));
    let shutdown = CancellationToken::new();
    let reporter = SpeedReporter::spawn("recv", Some(file_size));

    let mut coordinator = tokio::spawn(
        Coordinator {
            path: cfg.file.clone(),
            plan,
            queue: queue.clone(),
            done: done_rx,
            acks: ack_rx,
            fatal: fatal_rx,
            live: Arc::clone(&live),
            shutdown: shutdown.clone(),
        }
        .run(),
    );

    let mut workers = JoinSet::new();
    let mut next_id = 0u64;
    let outcome = loop {
        tokio::select! {
            result = &mut coordinator => break result,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    next_id += 1;
                    live.fetch_add(1, Ordering::SeqCst);
                    info!(conn = next_id, %peer, "connection accepted");
                    let worker = Worker {
                        id: next_id,
                        plan,
                        key: cfg.key.clone(),
                        queue: queue.clone(),
                        done: done_tx.clone(),
                        ack: ack_tx.clone(),
                        fatal: fatal_tx.clone(),
                        live: Arc::clone(&live),
                        shutdown: shutdown.clone(),
                        bytes: reporter.sender(),
                    };
                    workers.spawn(worker.run(stream));
                }
                Err(err) => warn!(%err, "accept failed"),
            },
        }
    };

    // Covers coordinator exits that never reached the shutdown phase,
    // so parked workers still stop and tell their peers.
    shutdown.cancel();
    workers.shutdown().await;
    drop(listener);
    reporter.finish().await;

    outcome.context("shutdown coordinator failed")?
}

/// Sequences the transfer: fill the queue, write completions, close the
/// file, then stop the workers and count their acknowledgements.
struct Coordinator {
    path: PathBuf,
    plan: TransferPlan,
    queue: PendingQueue,
    done: mpsc::Receiver<Completed>,
    acks: mpsc::UnboundedReceiver<()>,
    fatal: mpsc::Receiver<TransferError>,
    live: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl Coordinator {
    async fn run(mut self) -> Result<()> {
        for index in 0..self.plan.block_count() {
            self.queue.put(index).await;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open {}", self.path.display()))?;

        let mut completed = 0u64;
        while completed < self.plan.block_count() {
            tokio::select! {
                Some(err) = self.fatal.recv() => {
                    // Desynchronized peer: keep what we have on disk,
                    // stop everyone, and let main map the exit status.
                    let _ = file.flush().await;
                    self.shutdown.cancel();
                    return Err(err.into());
                }
                received = self.done.recv() => {
                    let Some(block) = received else {
                        anyhow::bail!("completion stream closed early");
                    };
                    file.seek(SeekFrom::Start(self.plan.offset_of(block.index)))
                        .await?;
                    file.write_all(&block.payload).await?;
                    completed += 1;
                }
            }
        }

        file.flush().await.context("flush destination")?;
        drop(file);

        // A desync raised on one of the last blocks can lose the select
        // race to their completions; it still fails the transfer.
        if let Ok(err) = self.fatal.try_recv() {
            self.shutdown.cancel();
            return Err(err.into());
        }
        info!(blocks = completed, "file complete");

        // The live count is stable here: no blocks are left, so no
        // worker can be in an error path that skips its ack.
        let expected = self.live.load(Ordering::SeqCst);
        self.shutdown.cancel();
        for _ in 0..expected {
            if self.acks.recv().await.is_none() {
                break;
            }
        }
        info!(workers = expected, "all workers stopped");
        Ok(())
    }
}

/// One accepted connection: claim an index, pull it, repeat.
struct Worker {
    id: u64,
    plan: TransferPlan,
    key: KeyMaterial,
    queue: PendingQueue,
    done: mpsc::Sender<Completed>,
    ack: mpsc::UnboundedSender<()>,
    fatal: mpsc::Sender<TransferError>,
    live: Arc<AtomicUsize>,
    shutdown: CancellationToken,
    bytes: mpsc::UnboundedSender<u64>,
}

impl Worker {
    async fn run<S>(self, mut stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let claimed = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                index = self.queue.claim() => index,
            };
            let Some(index) = claimed else {
                // Shutdown: tell the peer, account for ourselves, leave.
                let _ = protocol::write_stop(&mut stream).await;
                let _ = self.ack.send(());
                self.live.fetch_sub(1, Ordering::SeqCst);
                return;
            };
            if let Err(err) = self.pull(&mut stream, index).await {
                // The requeue comes last: the transfer cannot finish
                // until this index is re-served, so the fatal and the
                // live-count drop are both visible before the final
                // completion can land.
                if err.is_fatal() {
                    error!(conn = self.id, index, %err, "protocol desynchronized");
                    let _ = self.fatal.try_send(err);
                } else {
                    warn!(conn = self.id, index, %err, "connection failed");
                }
                self.live.fetch_sub(1, Ordering::SeqCst);
                self.queue.put(index).await;
                return;
            }
        }
    }

    /// Requests one block and sees it through verification.
    async fn pull<S>(&self, stream: &mut S, index: u64) -> Result<(), TransferError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        protocol::write_request(stream, index).await?;

        let (frame_tag, returned) = protocol::read_frame_header(stream).await?;
        if frame_tag != tag::DATA {
            return Err(TransferError::UnexpectedFrame { tag: frame_tag });
        }
        if returned != index {
            return Err(TransferError::BlockMismatch {
                requested: index,
                received: returned,
            });
        }

        let len = self.plan.len_of(index) as usize;
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;
        let digest = protocol::read_digest(stream).await?;

        self.key.apply(&mut payload);
        if md5::compute(&payload).0 != digest {
            return Err(TransferError::HashMismatch { block: index });
        }

        let _ = self.bytes.send(len as u64);
        let _ = self.done.send(Completed { index, payload }).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_worker(plan: TransferPlan) -> (Worker, mpsc::Receiver<Completed>) {
        let (done_tx, done_rx) = mpsc::channel(8);
        let worker = Worker {
            id: 1,
            plan,
            key: KeyMaterial::derive("123456"),
            queue: PendingQueue::new(plan.block_count()),
            done: done_tx,
            ack: mpsc::unbounded_channel().0,
            fatal: mpsc::channel(1).0,
            live: Arc::new(AtomicUsize::new(1)),
            shutdown: CancellationToken::new(),
            bytes: mpsc::unbounded_channel().0,
        };
        (worker, done_rx)
    }

    #[tokio::test]
    async fn pull_verifies_and_completes() {
        let (worker, mut done_rx) = test_worker(TransferPlan::new(150, 100));
        let key = worker.key.clone();
        let (mut local, mut remote) = tokio::io::duplex(1024);

        let peer = tokio::spawn(async move {
            assert_eq!(protocol::read_tag(&mut remote).await.unwrap(), tag::REQUEST);
            let index = protocol::read_block_index(&mut remote).await.unwrap();
            assert_eq!(index, 0);

            let plaintext = vec![7u8; 100];
            let digest = md5::compute(&plaintext);
            let mut payload = plaintext;
            key.apply(&mut payload);
            protocol::write_data(&mut remote, index, &payload, &digest.0)
                .await
                .unwrap();
        });

        worker.pull(&mut local, 0).await.unwrap();
        peer.await.unwrap();

        let block = done_rx.recv().await.unwrap();
        assert_eq!(block.index, 0);
        assert_eq!(block.payload, vec![7u8; 100]);
    }

    #[tokio::test]
    async fn mismatched_index_is_fatal() {
        let (worker, _done_rx) = test_worker(TransferPlan::new(150, 100));
        let key = worker.key.clone();
        let (mut local, mut remote) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let _ = protocol::read_tag(&mut remote).await;
            let _ = protocol::read_block_index(&mut remote).await;

            let plaintext = vec![1u8; 100];
            let digest = md5::compute(&plaintext);
            let mut payload = plaintext;
            key.apply(&mut payload);
            // Answer for a block nobody asked about.
            let _ = protocol::write_data(&mut remote, 1, &payload, &digest.0).await;
        });

        let err = worker.pull(&mut local, 0).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::BlockMismatch {
                requested: 0,
                received: 1
            }
        ));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn foreign_tag_is_fatal() {
        let (worker, _done_rx) = test_worker(TransferPlan::new(10, 10));
        let (mut local, mut remote) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let _ = protocol::read_tag(&mut remote).await;
            let _ = protocol::read_block_index(&mut remote).await;
            let _ = tokio::io::AsyncWriteExt::write_all(&mut remote, &[9u8; 9]).await;
        });

        let err = worker.pull(&mut local, 0).await.unwrap_err();
        assert!(matches!(err, TransferError::UnexpectedFrame { tag: 9 }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn corrupted_payload_is_recoverable() {
        let (worker, _done_rx) = test_worker(TransferPlan::new(10, 10));
        let key = worker.key.clone();
        let (mut local, mut remote) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let _ = protocol::read_tag(&mut remote).await;
            let _ = protocol::read_block_index(&mut remote).await;

            let plaintext = vec![2u8; 10];
            let digest = md5::compute(&plaintext);
            let mut payload = plaintext;
            key.apply(&mut payload);
            payload[3] ^= 0xff;
            let _ = protocol::write_data(&mut remote, 0, &payload, &digest.0).await;
        });

        let err = worker.pull(&mut local, 0).await.unwrap_err();
        assert!(matches!(err, TransferError::HashMismatch { block: 0 }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn disconnect_mid_frame_is_recoverable() {
        let (worker, _done_rx) = test_worker(TransferPlan::new(100, 100));
        let (mut local, mut remote) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let _ = protocol::read_tag(&mut remote).await;
            let _ = protocol::read_block_index(&mut remote).await;
            // Start a data frame, then vanish.
            let _ = tokio::io::AsyncWriteExt::write_all(&mut remote, &[tag::DATA]).await;
        });

        let err = worker.pull(&mut local, 0).await.unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn a_posted_fatal_fails_the_run_even_when_every_block_lands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dest.bin");
        std::fs::write(&path, vec![0u8; 200]).unwrap();

        let plan = TransferPlan::new(200, 100);
        let (done_tx, done_rx) = mpsc::channel(2);
        let (_ack_tx, ack_rx) = mpsc::unbounded_channel();
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let coordinator = Coordinator {
            path,
            plan,
            queue: PendingQueue::new(plan.block_count()),
            done: done_rx,
            acks: ack_rx,
            fatal: fatal_rx,
            live: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        };
        let run = tokio::spawn(coordinator.run());

        // The error and the remaining completions race for the select;
        // the error must win no matter which arm fires first.
        fatal_tx
            .try_send(TransferError::BlockMismatch {
                requested: 0,
                received: 1,
            })
            .unwrap();
        for index in 0..2 {
            let payload = vec![index as u8; 100];
            done_tx.send(Completed { index, payload }).await.unwrap();
        }

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), run)
            .await
            .expect("coordinator should settle")
            .unwrap();
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::BlockMismatch { .. })
        ));
    }
}
