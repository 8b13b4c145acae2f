//! Building a full commitment out of the staged UTXO set.

use crate::bucket::{BUCKET_COUNT, Bucket, BucketWriter, bucket_index, chunk_path};
use crate::db;
use crate::error::Result;
use crate::record::CommittedUtxo;
use bitcoin::BlockHash;
use parking_lot::Mutex;
use rayon::prelude::*;
use sqlx::sqlite::SqliteConnection;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use subcoin_crypto::{EcMultiset, MultisetPublicKey};

/// A UTXO commitment pinned to a block.
#[derive(Clone, Debug)]
pub struct Commitment {
    pub block_hash: BlockHash,
    pub block_height: u32,
    /// Combination of all bucket multisets.
    pub multiset: EcMultiset,
    /// Exactly [`BUCKET_COUNT`] buckets ordered by index.
    pub buckets: Vec<Bucket>,
}

impl Commitment {
    fn new(block_hash: BlockHash, block_height: u32, buckets: Vec<Bucket>) -> Self {
        let mut multiset = EcMultiset::new();
        for bucket in &buckets {
            multiset.combine(&bucket.multiset);
        }

        Self {
            block_hash,
            block_height,
            multiset,
            buckets,
        }
    }

    /// Public hash of the commitment.
    pub fn digest(&self) -> [u8; 32] {
        self.multiset.digest()
    }

    pub fn public_key(&self) -> MultisetPublicKey {
        self.multiset.public_key()
    }

    pub fn byte_count(&self) -> u64 {
        self.buckets.iter().map(Bucket::byte_count).sum()
    }

    pub fn utxo_count(&self) -> u64 {
        self.buckets.iter().map(Bucket::utxo_count).sum()
    }
}

/// Routes sorted records into [`BUCKET_COUNT`] bucket writers.
///
/// Batches are written to the buckets in parallel, each bucket keeps its records in the
/// order they were added.
pub struct CommitmentWriter {
    block_hash: BlockHash,
    writers: Vec<BucketWriter>,
}

impl CommitmentWriter {
    pub fn new(output_dir: &Path, block_hash: BlockHash, max_chunk_byte_count: u64) -> Result<Self> {
        std::fs::create_dir_all(output_dir)?;

        let writers = (0..BUCKET_COUNT)
            .map(|index| BucketWriter::new(index, output_dir, max_chunk_byte_count))
            .collect();

        Ok(Self {
            block_hash,
            writers,
        })
    }

    /// Adds a batch of records in ascending key order. Records without value are skipped.
    pub fn add_batch(&mut self, utxos: &[CommittedUtxo]) -> Result<()> {
        let mut groups: Vec<Vec<&CommittedUtxo>> = vec![Vec::new(); BUCKET_COUNT];
        for utxo in utxos.iter().filter(|utxo| utxo.amount > 0) {
            groups[bucket_index(&self.block_hash, &utxo.output_id())].push(utxo);
        }

        self.writers
            .par_iter_mut()
            .zip(groups.into_par_iter())
            .try_for_each(|(writer, group)| {
                group.into_iter().try_for_each(|utxo| writer.add_utxo(utxo))
            })
    }

    /// Closes every bucket, in parallel.
    pub fn close_buckets(&mut self) -> Result<Vec<Bucket>> {
        self.writers
            .par_iter_mut()
            .map(BucketWriter::close)
            .collect()
    }

    /// Closes every bucket and assembles the commitment.
    pub fn finish(mut self, block_height: u32) -> Result<Commitment> {
        let buckets = self.close_buckets()?;
        Ok(Commitment::new(self.block_hash, block_height, buckets))
    }

    /// Drops the pending proto files and returns the keys of every chunk finalized so far.
    pub fn abandon(&mut self) -> Vec<MultisetPublicKey> {
        self.writers
            .iter_mut()
            .flat_map(BucketWriter::abandon)
            .collect()
    }
}

/// Builds a commitment over everything currently in the staging table.
///
/// `conn` is usually the transaction of the block the commitment is pinned to, before the
/// block itself is applied. The bucket writers run on the blocking thread pool.
///
/// If the build fails, the chunk files it finalized are deleted again unless another
/// commitment references them.
pub(crate) async fn build_commitment(
    conn: &mut SqliteConnection,
    output_dir: &Path,
    block_hash: BlockHash,
    block_height: u32,
    max_chunk_byte_count: u64,
    batch_size: usize,
) -> Result<Commitment> {
    let now = Instant::now();

    tracing::info!(block_height, %block_hash, "Building UTXO commitment");

    let writer = Arc::new(Mutex::new(CommitmentWriter::new(
        output_dir,
        block_hash,
        max_chunk_byte_count,
    )?));

    let buckets = match write_buckets(conn, &writer, batch_size).await {
        Ok(buckets) => buckets,
        Err(err) => {
            let finalized = writer.lock().abandon();
            discard_chunks(conn, output_dir, finalized).await;
            return Err(err);
        }
    };

    let commitment = Commitment::new(block_hash, block_height, buckets);

    tracing::info!(
        block_height,
        %block_hash,
        hash = %hex::encode(commitment.digest()),
        utxo_count = commitment.utxo_count(),
        byte_count = commitment.byte_count(),
        elapsed = ?now.elapsed(),
        "Built UTXO commitment",
    );

    Ok(commitment)
}

async fn write_buckets(
    conn: &mut SqliteConnection,
    writer: &Arc<Mutex<CommitmentWriter>>,
    batch_size: usize,
) -> Result<Vec<Bucket>> {
    let mut last = None;

    loop {
        let batch = db::fetch_staged_utxos(conn, last.as_ref(), batch_size).await?;

        let Some(tail) = batch.last() else {
            break;
        };
        last.replace(tail.output_id());
        let exhausted = batch.len() < batch_size;

        let writer = writer.clone();
        tokio::task::spawn_blocking(move || writer.lock().add_batch(&batch)).await??;

        if exhausted {
            break;
        }
    }

    let writer = writer.clone();
    tokio::task::spawn_blocking(move || writer.lock().close_buckets()).await?
}

/// Deletes chunk files of a failed build that no commitment references.
async fn discard_chunks(
    conn: &mut SqliteConnection,
    output_dir: &Path,
    public_keys: Vec<MultisetPublicKey>,
) {
    for public_key in public_keys {
        match db::is_chunk_referenced(conn, &public_key).await {
            Ok(false) => {}
            Ok(true) => continue,
            Err(err) => {
                tracing::warn!(
                    ?err,
                    %public_key,
                    "Failed to look up chunk references, keeping chunk file",
                );
                continue;
            }
        }

        let path = chunk_path(output_dir, &public_key);
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::debug!(?path, "Discarded chunk file of failed build"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(?err, ?path, "Failed to discard chunk file of failed build"),
        }
    }
}
