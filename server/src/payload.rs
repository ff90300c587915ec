//! Download payload
//!
//! One block of random bytes is generated at startup and handed out to every
//! download as a cheap `Bytes` clone, so concurrent transfers share a single
//! immutable buffer.

use bytes::Bytes;
use hyper::body::Sender;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

/// The client went away before the transfer finished.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("transfer interrupted after {sent_chunks} of {total_chunks} chunks")]
pub struct TransferInterrupted {
    pub sent_chunks: usize,
    pub total_chunks: usize,
}

/// Shared random block served by the download endpoint
#[derive(Debug, Clone)]
pub struct PayloadPool {
    block: Bytes,
}

impl PayloadPool {
    /// Fill a block of `chunk_size` bytes from the OS random source.
    pub fn generate(chunk_size: usize) -> Result<Self, rand::Error> {
        let mut block = vec![0u8; chunk_size];
        OsRng.try_fill_bytes(&mut block)?;
        Ok(Self {
            block: Bytes::from(block),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.block.len()
    }

    /// The shared block. Cloning does not copy the bytes.
    pub fn block(&self) -> Bytes {
        self.block.clone()
    }

    /// Send the block `chunks` times, waiting for each send to be accepted
    /// before starting the next. Stops at the first failed send.
    ///
    /// Returns the number of bytes handed to the transport.
    pub async fn serve(&self, chunks: usize, mut sender: Sender) -> Result<u64, TransferInterrupted> {
        let mut sent = 0u64;
        for i in 0..chunks {
            if sender.send_data(self.block.clone()).await.is_err() {
                crate::metrics::TRANSFERS_INTERRUPTED
                    .with_label_values(&["download"])
                    .inc();
                return Err(TransferInterrupted {
                    sent_chunks: i,
                    total_chunks: chunks,
                });
            }
            sent += self.block.len() as u64;
            crate::metrics::DOWNLOAD_BYTES.inc_by(self.block.len() as f64);
        }
        Ok(sent)
    }
}

/// Chunk-count policy for download requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadLimits {
    pub default_chunks: usize,
    pub max_chunks: usize,
}

impl Default for DownloadLimits {
    fn default() -> Self {
        Self {
            default_chunks: 4,
            max_chunks: 1024,
        }
    }
}

impl DownloadLimits {
    /// Resolve the `ckSize` query value into a chunk count.
    ///
    /// Missing or unparseable values fall back to the default; everything is
    /// clamped to `[0, max_chunks]`.
    pub fn chunk_count(&self, requested: Option<&str>) -> usize {
        let Some(raw) = requested.map(str::trim).filter(|s| !s.is_empty()) else {
            return self.default_chunks.min(self.max_chunks);
        };

        match raw.parse::<i64>() {
            Ok(n) if n <= 0 => 0,
            Ok(n) => usize::try_from(n).unwrap_or(usize::MAX).min(self.max_chunks),
            Err(_) => {
                tracing::warn!(
                    "Invalid chunk size {:?}, using default of {}",
                    raw,
                    self.default_chunks
                );
                self.default_chunks.min(self.max_chunks)
            }
        }
    }
}
