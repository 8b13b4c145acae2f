use crate::bucket::DEFAULT_MAX_CHUNK_BYTE_COUNT;
use std::path::PathBuf;
use std::time::Duration;
use subcoin_crypto::MultisetPublicKey;

/// Deepest reorg the staging area is protected against.
pub const DEFAULT_REORG_SAFETY_LAG: u32 = 288;

/// Configuration of the UTXO commitment subsystem.
#[derive(Debug, Clone)]
pub struct CommitmentConfig {
    /// Directory holding the chunk files.
    pub output_dir: PathBuf,
    /// A commitment is published at every block height divisible by this interval.
    pub publish_interval: u32,
    /// Number of most recent commitments retained on disk.
    pub max_commitments_to_keep: usize,
    /// Distance kept between the staging cursor and the chain tip.
    pub reorg_safety_lag: u32,
    /// Commitments are never published below this height.
    pub min_block_height: u32,
    pub max_chunk_byte_count: u64,
    /// Rows copied per batch by the baseline import.
    pub import_batch_size: usize,
    /// Rows read per batch while building a commitment.
    pub build_batch_size: usize,
    /// Commitments exempt from pruning.
    pub trusted_commitments: Vec<MultisetPublicKey>,
    /// Period of the background task when not triggered explicitly.
    pub tick_interval: Duration,
}

impl CommitmentConfig {
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            publish_interval: 10_000,
            max_commitments_to_keep: 2,
            reorg_safety_lag: DEFAULT_REORG_SAFETY_LAG,
            min_block_height: 650_000,
            max_chunk_byte_count: DEFAULT_MAX_CHUNK_BYTE_COUNT,
            import_batch_size: 65_536,
            build_batch_size: 4_096,
            trusted_commitments: Vec::new(),
            tick_interval: Duration::from_secs(60),
        }
    }

    /// Whether `height` is far enough up the chain to be worth a commitment.
    ///
    /// Commitments older than the retention window at the time they would be built are
    /// skipped, which avoids publishing during initial block download.
    pub(crate) fn is_close_to_head(&self, height: u32, best_header_number: u32) -> bool {
        let horizon =
            (self.max_commitments_to_keep as u32).saturating_mul(self.publish_interval);
        height > best_header_number.saturating_sub(horizon)
    }

    pub(crate) fn is_publish_height(&self, height: u32) -> bool {
        self.publish_interval > 0
            && height % self.publish_interval == 0
            && height >= self.min_block_height
    }
}
