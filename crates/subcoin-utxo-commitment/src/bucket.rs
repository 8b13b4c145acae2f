//! Partitioning of a commitment into buckets of size-bounded chunk files.
//!
//! Each bucket streams its records into a proto file. Once the next record would push the
//! file over the byte budget, the file is finalized: it is renamed to the hex encoded
//! public key of its own multiset, which makes every chunk content addressed.

use crate::error::{Error, Result};
use crate::record::{CommittedUtxo, OutputId};
use bitcoin::BlockHash;
use bitcoin::hashes::Hash;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use subcoin_crypto::{EcMultiset, MultisetPublicKey};

/// Number of buckets in every commitment.
pub const BUCKET_COUNT: usize = 128;

/// Default upper bound of a single chunk file.
pub const DEFAULT_MAX_CHUNK_BYTE_COUNT: u64 = 32 * 1024 * 1024;

/// File name of the placeholder chunk standing for a bucket without records.
pub const EMPTY_BUCKET_NAME: &str =
    "000000000000000000000000000000000000000000000000000000000000000000";

/// Returns the bucket an output belongs to in the commitment pinned to `block_hash`.
pub fn bucket_index(block_hash: &BlockHash, output_id: &OutputId) -> usize {
    let mut hasher = Sha256::new();
    hasher.update(block_hash.as_byte_array());
    hasher.update(output_id.txid.as_byte_array());
    hasher.update(output_id.vout.to_le_bytes());
    let digest = hasher.finalize();
    (digest[0] & 0x7F) as usize
}

/// Path of the chunk file named by `public_key`.
pub fn chunk_path(output_dir: &Path, public_key: &MultisetPublicKey) -> PathBuf {
    output_dir.join(public_key.to_string())
}

/// Creates the empty placeholder chunk if it does not exist yet.
pub fn ensure_empty_chunk(output_dir: &Path) -> Result<()> {
    let path = output_dir.join(EMPTY_BUCKET_NAME);
    if !path.try_exists()? {
        File::create(path)?;
    }
    Ok(())
}

/// A finalized chunk file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkFile {
    pub public_key: MultisetPublicKey,
    pub utxo_count: u64,
    pub byte_count: u64,
}

impl ChunkFile {
    fn empty() -> Self {
        Self {
            public_key: MultisetPublicKey::EMPTY,
            utxo_count: 0,
            byte_count: 0,
        }
    }
}

/// A closed bucket.
#[derive(Clone, Debug)]
pub struct Bucket {
    pub index: usize,
    /// Combination of the multisets of all chunks.
    pub multiset: EcMultiset,
    /// Never empty, a bucket without records holds the empty placeholder.
    pub chunks: Vec<ChunkFile>,
}

impl Bucket {
    pub fn public_key(&self) -> MultisetPublicKey {
        self.multiset.public_key()
    }

    pub fn byte_count(&self) -> u64 {
        self.chunks.iter().map(|chunk| chunk.byte_count).sum()
    }

    pub fn utxo_count(&self) -> u64 {
        self.chunks.iter().map(|chunk| chunk.utxo_count).sum()
    }
}

/// Writes the records of one bucket into chunk files.
///
/// Records must be added in ascending [`OutputId`] order.
pub struct BucketWriter {
    index: usize,
    output_dir: PathBuf,
    max_byte_count: u64,
    proto_path: PathBuf,
    // Opened lazily on the first record of a chunk.
    file: Option<BufWriter<File>>,
    chunk_multiset: EcMultiset,
    chunk_utxo_count: u64,
    chunk_byte_count: u64,
    bucket_multiset: EcMultiset,
    chunks: Vec<ChunkFile>,
    encode_buf: Vec<u8>,
}

impl BucketWriter {
    pub fn new(index: usize, output_dir: &Path, max_byte_count: u64) -> Self {
        Self {
            index,
            output_dir: output_dir.to_path_buf(),
            max_byte_count,
            proto_path: output_dir.join(format!("utxo-{index}.dat")),
            file: None,
            chunk_multiset: EcMultiset::new(),
            chunk_utxo_count: 0,
            chunk_byte_count: 0,
            bucket_multiset: EcMultiset::new(),
            chunks: Vec::new(),
            encode_buf: Vec::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Appends a record, finalizing the current chunk first if the record does not fit.
    pub fn add_utxo(&mut self, utxo: &CommittedUtxo) -> Result<()> {
        self.encode_buf.clear();
        utxo.encode_to(&mut self.encode_buf);
        let byte_count = self.encode_buf.len() as u64;

        if self.chunk_byte_count > 0 && self.chunk_byte_count + byte_count > self.max_byte_count {
            self.finalize_chunk()?;
        }

        if self.file.is_none() {
            self.file = Some(BufWriter::new(File::create(&self.proto_path)?));
        }
        if let Some(file) = &mut self.file {
            file.write_all(&self.encode_buf)?;
        }

        self.chunk_multiset.insert(&self.encode_buf);
        self.chunk_utxo_count += 1;
        self.chunk_byte_count += byte_count;

        Ok(())
    }

    /// Finalizes the pending chunk and returns the closed bucket.
    ///
    /// The writer keeps track of its chunk files so that they can still be abandoned if the
    /// commitment as a whole fails.
    pub fn close(&mut self) -> Result<Bucket> {
        if self.chunk_byte_count > 0 {
            self.finalize_chunk()?;
        }

        if self.chunks.is_empty() {
            ensure_empty_chunk(&self.output_dir)?;
            self.chunks.push(ChunkFile::empty());
        }

        Ok(Bucket {
            index: self.index,
            multiset: self.bucket_multiset.clone(),
            chunks: self.chunks.clone(),
        })
    }

    /// Drops the pending proto file and returns the keys of the chunks finalized so far.
    ///
    /// The empty placeholder is never returned, it is shared by every commitment.
    pub fn abandon(&mut self) -> Vec<MultisetPublicKey> {
        self.file.take();
        self.chunk_multiset = EcMultiset::new();
        self.chunk_utxo_count = 0;
        self.chunk_byte_count = 0;

        match std::fs::remove_file(&self.proto_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(?err, path = ?self.proto_path, "Failed to remove proto chunk file");
            }
        }

        self.bucket_multiset = EcMultiset::new();
        self.chunks
            .drain(..)
            .map(|chunk| chunk.public_key)
            .filter(|public_key| !public_key.is_empty())
            .collect()
    }

    fn finalize_chunk(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.get_ref().sync_all()?;
        }

        let multiset = std::mem::take(&mut self.chunk_multiset);
        let public_key = multiset.public_key();
        let byte_count = std::mem::take(&mut self.chunk_byte_count);
        let utxo_count = std::mem::take(&mut self.chunk_utxo_count);

        let target = chunk_path(&self.output_dir, &public_key);
        if target.try_exists()? {
            // Same contents produce the same name, anything else is a conflict.
            let existing = std::fs::metadata(&target)?.len();
            if existing != byte_count {
                return Err(Error::ChunkConflict {
                    path: target,
                    existing,
                    expected: byte_count,
                });
            }
            tracing::debug!(bucket = self.index, %public_key, "Chunk file already exists");
            std::fs::remove_file(&self.proto_path)?;
        } else {
            std::fs::rename(&self.proto_path, &target)?;
        }

        tracing::trace!(bucket = self.index, %public_key, utxo_count, byte_count, "Finalized chunk");

        self.bucket_multiset.combine(&multiset);
        self.chunks.push(ChunkFile {
            public_key,
            utxo_count,
            byte_count,
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;

    fn utxo(n: u8) -> CommittedUtxo {
        CommittedUtxo {
            txid: Txid::from_byte_array([n; 32]),
            vout: n as u32,
            height: 100 + n as u32,
            is_coinbase: n % 2 == 0,
            amount: 1_000 * n as i64,
            // 48 fixed bytes + 1 length byte + 11 script bytes.
            script_pubkey: vec![n; 11],
        }
    }

    fn read_chunk(output_dir: &Path, chunk: &ChunkFile) -> Vec<CommittedUtxo> {
        let bytes = std::fs::read(chunk_path(output_dir, &chunk.public_key)).unwrap();
        assert_eq!(bytes.len() as u64, chunk.byte_count);
        let mut cursor = bytes.as_slice();
        let mut utxos = Vec::new();
        while !cursor.is_empty() {
            utxos.push(CommittedUtxo::decode(&mut cursor).unwrap());
        }
        utxos
    }

    #[test]
    fn test_chunk_rollover() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BucketWriter::new(3, dir.path(), 150);

        let utxos = (1..=5).map(utxo).collect::<Vec<_>>();
        assert_eq!(utxos[0].encoded_len(), 60);

        // Two records fit in one chunk, the third crosses the budget.
        for utxo in &utxos[..3] {
            writer.add_utxo(utxo).unwrap();
        }
        assert_eq!(writer.chunks.len(), 1);

        // The fifth record crosses the budget a second time.
        for utxo in &utxos[3..] {
            writer.add_utxo(utxo).unwrap();
        }
        assert_eq!(writer.chunks.len(), 2);

        let bucket = writer.close().unwrap();
        assert_eq!(bucket.index, 3);
        assert_eq!(bucket.chunks.len(), 3);
        assert_eq!(
            bucket.chunks.iter().map(|c| c.utxo_count).collect::<Vec<_>>(),
            vec![2, 2, 1]
        );
        assert_eq!(bucket.byte_count(), 300);
        assert_eq!(bucket.utxo_count(), 5);

        let mut combined = EcMultiset::new();
        let mut read_back = Vec::new();
        for chunk in &bucket.chunks {
            let chunk_utxos = read_chunk(dir.path(), chunk);
            let mut multiset = EcMultiset::new();
            for utxo in &chunk_utxos {
                multiset.insert(&utxo.encode());
            }
            assert_eq!(multiset.public_key(), chunk.public_key);
            combined.combine(&multiset);
            read_back.extend(chunk_utxos);
        }
        assert_eq!(combined, bucket.multiset);
        assert_eq!(read_back, utxos);

        assert!(!dir.path().join("utxo-3.dat").exists());
    }

    #[test]
    fn test_bucket_digest_only_counts_finalized_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BucketWriter::new(0, dir.path(), 100);

        writer.add_utxo(&utxo(1)).unwrap();
        writer.add_utxo(&utxo(2)).unwrap();

        let mut first_chunk = EcMultiset::new();
        first_chunk.insert(&utxo(1).encode());
        assert_eq!(writer.bucket_multiset, first_chunk);
    }

    #[test]
    fn test_empty_bucket_yields_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BucketWriter::new(9, dir.path(), 100);
        let bucket = writer.close().unwrap();

        assert_eq!(bucket.chunks.len(), 1);
        let chunk = &bucket.chunks[0];
        assert_eq!(chunk.public_key, MultisetPublicKey::EMPTY);
        assert_eq!(chunk.public_key.to_string(), EMPTY_BUCKET_NAME);
        assert_eq!(chunk.utxo_count, 0);
        assert!(bucket.multiset.is_empty());

        let placeholder = dir.path().join(EMPTY_BUCKET_NAME);
        assert_eq!(std::fs::metadata(placeholder).unwrap().len(), 0);
    }

    #[test]
    fn test_oversized_record_gets_own_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BucketWriter::new(0, dir.path(), 10);
        writer.add_utxo(&utxo(1)).unwrap();
        writer.add_utxo(&utxo(2)).unwrap();
        let bucket = writer.close().unwrap();
        assert_eq!(bucket.chunks.len(), 2);
        assert!(bucket.chunks.iter().all(|chunk| chunk.utxo_count == 1));
    }

    #[test]
    fn test_existing_identical_chunk_is_reused() {
        let dir = tempfile::tempdir().unwrap();

        let build = || {
            let mut writer = BucketWriter::new(1, dir.path(), 1_000);
            writer.add_utxo(&utxo(1)).unwrap();
            writer.close()
        };

        let first = build().unwrap();
        let second = build().unwrap();
        assert_eq!(first.chunks, second.chunks);
    }

    #[test]
    fn test_conflicting_chunk_aborts() {
        let dir = tempfile::tempdir().unwrap();

        let mut multiset = EcMultiset::new();
        multiset.insert(&utxo(1).encode());
        std::fs::write(chunk_path(dir.path(), &multiset.public_key()), b"garbage").unwrap();

        let mut writer = BucketWriter::new(1, dir.path(), 1_000);
        writer.add_utxo(&utxo(1)).unwrap();
        assert!(matches!(writer.close(), Err(Error::ChunkConflict { existing: 7, .. })));
        assert!(dir.path().join("utxo-1.dat").exists());

        assert!(writer.abandon().is_empty());
        assert!(!dir.path().join("utxo-1.dat").exists());
    }

    #[test]
    fn test_abandon_returns_finalized_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = BucketWriter::new(2, dir.path(), 150);

        for n in 1..=3 {
            writer.add_utxo(&utxo(n)).unwrap();
        }
        assert_eq!(writer.chunks.len(), 1);
        let finalized = writer.chunks[0].public_key;

        assert_eq!(writer.abandon(), vec![finalized]);
        assert!(!dir.path().join("utxo-2.dat").exists());
        // Finalized chunks are left to the caller, which knows whether they are still referenced.
        assert!(chunk_path(dir.path(), &finalized).exists());

        let mut empty = BucketWriter::new(4, dir.path(), 150);
        empty.close().unwrap();
        assert!(empty.abandon().is_empty());
        assert!(dir.path().join(EMPTY_BUCKET_NAME).exists());
    }

    #[test]
    fn test_bucket_index_is_stable_and_bounded() {
        let block_hash = BlockHash::from_byte_array([7u8; 32]);
        let other_block = BlockHash::from_byte_array([8u8; 32]);

        let mut spread = std::collections::HashSet::new();
        let mut moved = 0;
        for n in 0..=255u8 {
            let output_id = utxo(n).output_id();
            let index = bucket_index(&block_hash, &output_id);
            assert!(index < BUCKET_COUNT);
            assert_eq!(index, bucket_index(&block_hash, &output_id));
            if index != bucket_index(&other_block, &output_id) {
                moved += 1;
            }
            spread.insert(index);
        }
        assert!(spread.len() > 64);
        assert!(moved > 128);
    }
}
