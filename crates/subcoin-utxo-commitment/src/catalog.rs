//! Read side of published commitments, served to peers.

use crate::bucket::chunk_path;
use crate::db::CommitmentDatabase;
use crate::error::Result;
use bitcoin::BlockHash;
use std::path::PathBuf;
use subcoin_crypto::MultisetPublicKey;

/// Maximum number of commitments advertised at once.
pub const MAX_COMMITMENT_COUNT: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBucketBreakdown {
    pub public_key: MultisetPublicKey,
    pub byte_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketBreakdown {
    pub public_key: MultisetPublicKey,
    pub byte_count: u64,
    /// Only populated when the bucket is split into more than one chunk file.
    pub sub_buckets: Vec<SubBucketBreakdown>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitmentBreakdown {
    pub block_hash: BlockHash,
    pub block_height: u32,
    pub hash: [u8; 32],
    pub public_key: MultisetPublicKey,
    pub byte_count: u64,
    pub buckets: Vec<BucketBreakdown>,
}

/// Answers which commitments exist and serves their chunk files.
#[derive(Clone)]
pub struct CommitmentCatalog {
    db: CommitmentDatabase,
    output_dir: PathBuf,
}

impl CommitmentCatalog {
    pub fn new(db: CommitmentDatabase, output_dir: PathBuf) -> Self {
        Self { db, output_dir }
    }

    /// Returns the available commitments, most recent first.
    pub async fn list_available(&self) -> Result<Vec<CommitmentBreakdown>> {
        let commitments = self.db.list_commitments(MAX_COMMITMENT_COUNT).await?;

        let mut breakdowns = Vec::with_capacity(commitments.len());

        for commitment in commitments {
            let buckets = self
                .db
                .commitment_buckets(commitment.id)
                .await?
                .into_iter()
                .map(|bucket| {
                    let byte_count = bucket.chunks.iter().map(|chunk| chunk.byte_count).sum();
                    let sub_buckets = if bucket.chunks.len() > 1 {
                        bucket
                            .chunks
                            .iter()
                            .map(|chunk| SubBucketBreakdown {
                                public_key: chunk.public_key,
                                byte_count: chunk.byte_count,
                            })
                            .collect()
                    } else {
                        Vec::new()
                    };

                    BucketBreakdown {
                        public_key: bucket.public_key,
                        byte_count,
                        sub_buckets,
                    }
                })
                .collect::<Vec<_>>();

            breakdowns.push(CommitmentBreakdown {
                block_hash: commitment.block_hash,
                block_height: commitment.block_height,
                hash: commitment.hash,
                public_key: commitment.public_key,
                byte_count: buckets.iter().map(|bucket| bucket.byte_count).sum(),
                buckets,
            });
        }

        Ok(breakdowns)
    }

    /// Returns the chunk file named by `public_key`, `None` if it does not exist (anymore).
    pub async fn get_chunk_bytes(&self, public_key: &MultisetPublicKey) -> Result<Option<Vec<u8>>> {
        let path = chunk_path(&self.output_dir, public_key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(%public_key, "Requested UTXO commitment chunk not found");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Paths of all non-empty chunk files of the commitment pinned to `block_hash`, in bucket
    /// order. `None` if no such commitment exists.
    pub async fn chunk_paths(&self, block_hash: &BlockHash) -> Result<Option<Vec<PathBuf>>> {
        let commitments = self.db.list_commitments(i64::MAX as usize).await?;

        let Some(commitment) = commitments
            .into_iter()
            .find(|commitment| commitment.block_hash == *block_hash)
        else {
            return Ok(None);
        };

        let paths = self
            .db
            .commitment_buckets(commitment.id)
            .await?
            .into_iter()
            .flat_map(|bucket| bucket.chunks)
            .filter(|chunk| chunk.utxo_count > 0)
            .map(|chunk| chunk_path(&self.output_dir, &chunk.public_key))
            .collect();

        Ok(Some(paths))
    }
}
