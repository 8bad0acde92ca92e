//! The sending side: dial the collector, then passively serve whatever
//! blocks it asks for until a stop frame arrives.
//!
//! A fixed pool of connection slots is kept saturated. A slot whose
//! connection dies (dial failure included) redials immediately, with no
//! backoff. The first stop frame observed on any connection ends the
//! pool: lost slots are no longer refilled and the process waits for
//! the remaining connections to finish.

use std::io::SeekFrom;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blocks::TransferPlan;
use crate::cipher::KeyMaterial;
use crate::error::TransferError;
use crate::progress::SpeedReporter;
use crate::protocol::{self, tag};

/// Settings for the send role.
#[derive(Debug, Clone)]
pub struct SupplyConfig {
    pub file: PathBuf,
    pub addr: String,
    pub workers: usize,
    pub block_size: u64,
    pub key: KeyMaterial,
}

/// How one connection's lifetime ended.
enum Outcome {
    /// A stop frame arrived; the transfer is complete.
    Stopped,
    /// Dial failure or connection error; the slot should redial.
    Lost,
}

/// Serves the source file until the collector announces completion.
pub async fn supply(cfg: SupplyConfig) -> Result<()> {
    let file_size = tokio::fs::metadata(&cfg.file)
        .await
        .with_context(|| format!("stat {}", cfg.file.display()))?
        .len();
    let plan = TransferPlan::new(file_size, cfg.block_size);
    info!(
        addr = %cfg.addr,
        file_size,
        block_size = cfg.block_size,
        blocks = plan.block_count(),
        workers = cfg.workers,
        "serving blocks"
    );

    let reporter = SpeedReporter::spawn("send", None);
    let stop = CancellationToken::new();
    let mut pool = JoinSet::new();
    let mut next_id = 0u64;

    let connection = |id: u64| Connection {
        id,
        file: cfg.file.clone(),
        addr: cfg.addr.clone(),
        plan,
        key: cfg.key.clone(),
        stop: stop.clone(),
        bytes: reporter.sender(),
    };

    for _ in 0..cfg.workers {
        next_id += 1;
        pool.spawn(connection(next_id).run());
    }

    while let Some(finished) = pool.join_next().await {
        match finished {
            Ok(Outcome::Stopped) => stop.cancel(),
            Ok(Outcome::Lost) => {
                if !stop.is_cancelled() {
                    next_id += 1;
                    pool.spawn(connection(next_id).run());
                }
            }
            Err(err) => {
                warn!(%err, "connection task failed");
                if !stop.is_cancelled() {
                    next_id += 1;
                    pool.spawn(connection(next_id).run());
                }
            }
        }
    }

    reporter.finish().await;
    info!("all connections closed");
    Ok(())
}

/// One dial attempt and, if it connects, one serving loop.
struct Connection {
    id: u64,
    file: PathBuf,
    addr: String,
    plan: TransferPlan,
    key: KeyMaterial,
    stop: CancellationToken,
    bytes: mpsc::UnboundedSender<u64>,
}

impl Connection {
    async fn run(self) -> Outcome {
        // A slot spawned just before the pool learned of the stop frame
        // must not dial a collector that is already shutting down.
        if self.stop.is_cancelled() {
            return Outcome::Stopped;
        }

        let mut stream = match TcpStream::connect(&self.addr).await {
            Ok(stream) => stream,
            Err(err) => {
                debug!(conn = self.id, %err, "dial failed");
                return Outcome::Lost;
            }
        };
        let _ = stream.set_nodelay(true);

        let mut file = match File::open(&self.file).await {
            Ok(file) => file,
            Err(err) => {
                warn!(conn = self.id, %err, "source open failed");
                return Outcome::Lost;
            }
        };
        info!(conn = self.id, "connection established");

        loop {
            let frame_tag = match protocol::read_tag(&mut stream).await {
                Ok(frame_tag) => frame_tag,
                Err(err) => {
                    debug!(conn = self.id, %err, "connection lost");
                    return Outcome::Lost;
                }
            };
            match frame_tag {
                tag::STOP => {
                    // Acknowledge before closing so the collector can
                    // account for this worker.
                    let _ = protocol::write_stop(&mut stream).await;
                    info!(conn = self.id, "stop received");
                    return Outcome::Stopped;
                }
                tag::REQUEST => {
                    let index = match protocol::read_block_index(&mut stream).await {
                        Ok(index) => index,
                        Err(err) => {
                            debug!(conn = self.id, %err, "connection lost");
                            return Outcome::Lost;
                        }
                    };
                    if let Err(err) = self.serve(&mut stream, &mut file, index).await {
                        warn!(conn = self.id, index, %err, "serving block failed");
                        return Outcome::Lost;
                    }
                }
                other => {
                    warn!(conn = self.id, tag = other, "unexpected frame tag");
                    return Outcome::Lost;
                }
            }
        }
    }

    /// Reads one block from disk, digests the plaintext, encrypts, and
    /// writes the data frame.
    async fn serve<S>(
        &self,
        stream: &mut S,
        file: &mut File,
        index: u64,
    ) -> Result<(), TransferError>
    where
        S: AsyncWrite + Unpin,
    {
        if !self.plan.contains(index) {
            return Err(TransferError::OutOfRange { block: index });
        }
        let len = self.plan.len_of(index) as usize;
        let mut payload = vec![0u8; len];
        file.seek(SeekFrom::Start(self.plan.offset_of(index))).await?;
        file.read_exact(&mut payload).await?;

        let digest = md5::compute(&payload);
        self.key.apply(&mut payload);
        protocol::write_data(stream, index, &payload, &digest.0).await?;

        let _ = self.bytes.send(len as u64);
        Ok(())
    }
}
