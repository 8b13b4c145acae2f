//! Turning received chunk files back into a live UTXO set.
//!
//! Chunk files are decoded into a tab separated ingest file first, which is then handed to the
//! live store as a single bulk load.

use crate::bucket::EMPTY_BUCKET_NAME;
use crate::error::{Error, Result};
use crate::live::LiveUtxoStore;
use crate::record::{CommittedUtxo, MAX_SPENDABLE_SCRIPT_BYTE_COUNT};
use bitcoin::Txid;
use bitcoin::hashes::Hash;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use subcoin_crypto::EcMultiset;

// Fixed fields, the largest CompactSize prefix and the largest script.
const MAX_ENCODED_UTXO_SIZE: usize = 48 + 9 + MAX_SPENDABLE_SCRIPT_BYTE_COUNT;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// One row of the ingest file.
#[derive(Debug, Serialize, Deserialize)]
struct IngestRow {
    transaction_hash: String,
    output_index: u32,
    block_height: u32,
    is_coinbase: u8,
    amount: i64,
    locking_script: String,
}

impl From<&CommittedUtxo> for IngestRow {
    fn from(utxo: &CommittedUtxo) -> Self {
        Self {
            transaction_hash: hex::encode_upper(utxo.output_id().txid_display_bytes()),
            output_index: utxo.vout,
            block_height: utxo.height,
            is_coinbase: utxo.is_coinbase as u8,
            amount: utxo.amount,
            locking_script: hex::encode_upper(&utxo.script_pubkey),
        }
    }
}

impl IngestRow {
    fn into_utxo(self, line: u64) -> Result<CommittedUtxo> {
        let malformed = |reason: String| Error::MalformedIngestRow { line, reason };

        let mut txid: [u8; 32] = hex::decode(&self.transaction_hash)
            .map_err(|err| malformed(format!("transaction hash: {err}")))?
            .try_into()
            .map_err(|_| malformed("transaction hash is not 32 bytes".to_string()))?;
        txid.reverse();

        let is_coinbase = match self.is_coinbase {
            0 => false,
            1 => true,
            flag => return Err(malformed(format!("coinbase flag {flag}"))),
        };

        let script_pubkey = hex::decode(&self.locking_script)
            .map_err(|err| malformed(format!("locking script: {err}")))?;
        if script_pubkey.len() > MAX_SPENDABLE_SCRIPT_BYTE_COUNT {
            return Err(malformed(format!("locking script of {} bytes", script_pubkey.len())));
        }

        Ok(CommittedUtxo {
            txid: Txid::from_byte_array(txid),
            vout: self.output_index,
            height: self.block_height,
            is_coinbase,
            amount: self.amount,
            script_pubkey,
        })
    }
}

/// Summary of [`build_ingest_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub utxo_count: u64,
    /// `false` if decoding stopped before the end of the input.
    pub complete: bool,
}

/// Decodes records from a sequence of files as if they were one contiguous byte stream.
struct ChunkStream {
    files: std::vec::IntoIter<PathBuf>,
    current: Option<File>,
    buf: Vec<u8>,
    pos: usize,
}

impl ChunkStream {
    fn new(chunk_files: &[PathBuf]) -> Self {
        Self {
            files: chunk_files.to_vec().into_iter(),
            current: None,
            buf: Vec::new(),
            pos: 0,
        }
    }

    /// Returns the next record, `None` at the end of the input or at the first malformed record.
    fn next_utxo(&mut self) -> Result<Option<CommittedUtxo>> {
        loop {
            let mut cursor = &self.buf[self.pos..];
            let available = cursor.len();

            if let Some(utxo) = CommittedUtxo::decode(&mut cursor) {
                self.pos += available - cursor.len();
                return Ok(Some(utxo));
            }

            // A full record fits in the buffer, more input would not help.
            if available >= MAX_ENCODED_UTXO_SIZE || !self.fill()? {
                return Ok(None);
            }
        }
    }

    /// Whether every input byte has been consumed.
    fn is_drained(&mut self) -> Result<bool> {
        Ok(self.pos == self.buf.len() && !self.fill()?)
    }

    // Appends more input to the buffer, returns `false` once every file is exhausted.
    fn fill(&mut self) -> Result<bool> {
        self.buf.drain(..self.pos);
        self.pos = 0;

        loop {
            let mut file = match self.current.take() {
                Some(file) => file,
                None => match self.files.next() {
                    Some(path) => File::open(path)?,
                    None => return Ok(false),
                },
            };

            let len = self.buf.len();
            self.buf.resize(len + READ_CHUNK_SIZE, 0);
            let read = file.read(&mut self.buf[len..])?;
            self.buf.truncate(len + read);

            if read > 0 {
                self.current = Some(file);
                return Ok(true);
            }
        }
    }
}

/// Decodes `chunk_files` in the given order into a bulk ingest file at `output`.
///
/// Decoding stops at the first malformed record, the rows written up to that point are kept
/// and the report is marked incomplete.
pub fn build_ingest_file(chunk_files: &[PathBuf], output: &Path) -> Result<IngestReport> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_path(output)?;

    let mut stream = ChunkStream::new(chunk_files);
    let mut utxo_count = 0u64;

    while let Some(utxo) = stream.next_utxo()? {
        writer.serialize(IngestRow::from(&utxo))?;
        utxo_count += 1;
    }

    writer.flush()?;

    let complete = stream.is_drained()?;
    if !complete {
        tracing::warn!(utxo_count, ?output, "Malformed UTXO commitment data, ingest file truncated");
    }

    Ok(IngestReport {
        utxo_count,
        complete,
    })
}

/// Parses the ingest file at `path` and bulk loads it into `store`.
///
/// Rows are parsed while they are loaded, all within one bulk load. A single malformed row
/// rejects the whole file and leaves the store untouched.
pub async fn load_ingest_file<S: LiveUtxoStore + ?Sized>(path: &Path, store: &S) -> Result<u64> {
    let reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_reader(File::open(path)?);

    let rows = reader
        .into_deserialize::<IngestRow>()
        .enumerate()
        .map(|(index, row)| row?.into_utxo(index as u64 + 1));

    let utxo_count = store.bulk_load(Box::new(rows)).await?;

    tracing::info!(utxo_count, ?path, "Loaded UTXO ingest file");

    Ok(utxo_count)
}

/// Result of [`verify_chunk_file`].
#[derive(Debug, Clone)]
pub struct ChunkVerification {
    pub multiset: EcMultiset,
    pub utxo_count: u64,
    /// Records appear in ascending key order.
    pub is_sorted: bool,
    /// Every byte of the file decoded into a record.
    pub complete: bool,
}

/// Recomputes the multiset of a chunk file so it can be checked against its content address.
///
/// A missing empty placeholder verifies as the empty multiset, every other file must exist.
pub fn verify_chunk_file(path: &Path) -> Result<ChunkVerification> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(err)
            if err.kind() == std::io::ErrorKind::NotFound
                && path
                    .file_stem()
                    .is_some_and(|stem| stem == EMPTY_BUCKET_NAME) =>
        {
            Vec::new()
        }
        Err(err) => return Err(err.into()),
    };

    let mut multiset = EcMultiset::new();
    let mut utxo_count = 0u64;
    let mut is_sorted = true;
    let mut previous = None;

    let mut complete = true;
    let mut cursor = bytes.as_slice();
    while !cursor.is_empty() {
        let start = cursor;
        let Some(utxo) = CommittedUtxo::decode(&mut cursor) else {
            complete = false;
            break;
        };
        multiset.insert(&start[..start.len() - cursor.len()]);
        utxo_count += 1;

        let output_id = utxo.output_id();
        if previous.is_some_and(|previous| previous >= output_id) {
            is_sorted = false;
        }
        previous.replace(output_id);
    }

    Ok(ChunkVerification {
        multiset,
        utxo_count,
        is_sorted,
        complete,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::LiveUtxoTable;

    fn random_utxos(count: usize) -> Vec<CommittedUtxo> {
        let mut rng = fastrand::Rng::with_seed(7);
        let mut utxos = (0..count)
            .map(|_| {
                let mut txid = [0u8; 32];
                rng.fill(&mut txid);
                CommittedUtxo {
                    txid: Txid::from_byte_array(txid),
                    vout: rng.u32(0..8),
                    height: rng.u32(0..800_000),
                    is_coinbase: rng.bool(),
                    amount: rng.i64(1..5_000_000_000),
                    script_pubkey: (0..rng.usize(0..60)).map(|_| rng.u8(..)).collect(),
                }
            })
            .collect::<Vec<_>>();
        utxos.sort_by_key(CommittedUtxo::output_id);
        utxos
    }

    fn encode_all(utxos: &[CommittedUtxo]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for utxo in utxos {
            utxo.encode_to(&mut bytes);
        }
        bytes
    }

    #[tokio::test]
    async fn test_records_spanning_files_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let utxos = random_utxos(20);
        let bytes = encode_all(&utxos);

        // Split the stream in the middle of records.
        let cuts = [0, 37, bytes.len() - 11, bytes.len()];
        let chunk_files = cuts
            .windows(2)
            .enumerate()
            .map(|(i, w)| {
                let path = dir.path().join(format!("chunk-{i}"));
                std::fs::write(&path, &bytes[w[0]..w[1]]).unwrap();
                path
            })
            .collect::<Vec<_>>();

        let ingest_path = dir.path().join("utxos.tsv");
        let report = build_ingest_file(&chunk_files, &ingest_path).unwrap();
        assert_eq!(
            report,
            IngestReport {
                utxo_count: 20,
                complete: true
            }
        );

        let first_line = std::fs::read_to_string(&ingest_path)
            .unwrap()
            .lines()
            .next()
            .unwrap()
            .to_string();
        let fields = first_line.split('\t').collect::<Vec<_>>();
        assert_eq!(fields.len(), 6);
        assert_eq!(
            fields[0],
            hex::encode_upper(utxos[0].output_id().txid_display_bytes())
        );

        let live = LiveUtxoTable::open(&dir.path().join("live.sqlite")).await.unwrap();
        assert_eq!(load_ingest_file(&ingest_path, &live).await.unwrap(), 20);
        assert_eq!(live.scan(None, 100).await.unwrap(), utxos);
    }

    #[test]
    fn test_truncated_input_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let utxos = random_utxos(5);
        let bytes = encode_all(&utxos);

        let chunk = dir.path().join("chunk");
        std::fs::write(&chunk, &bytes[..bytes.len() - 3]).unwrap();

        let ingest_path = dir.path().join("utxos.tsv");
        let report = build_ingest_file(&[chunk], &ingest_path).unwrap();
        assert_eq!(
            report,
            IngestReport {
                utxo_count: 4,
                complete: false
            }
        );
        assert_eq!(std::fs::read_to_string(&ingest_path).unwrap().lines().count(), 4);
    }

    #[test]
    fn test_no_chunk_files() {
        let dir = tempfile::tempdir().unwrap();
        let ingest_path = dir.path().join("utxos.tsv");
        let report = build_ingest_file(&[], &ingest_path).unwrap();
        assert_eq!(
            report,
            IngestReport {
                utxo_count: 0,
                complete: true
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_row_rejects_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = dir.path().join("chunk");
        std::fs::write(&chunk, encode_all(&random_utxos(2))).unwrap();

        let ingest_path = dir.path().join("utxos.tsv");
        build_ingest_file(&[chunk], &ingest_path).unwrap();

        let mut content = std::fs::read_to_string(&ingest_path).unwrap();
        content.push_str(&format!("{}\t0\t10\t2\t500\t51\n", "AB".repeat(32)));
        std::fs::write(&ingest_path, content).unwrap();

        let live = LiveUtxoTable::open(&dir.path().join("live.sqlite")).await.unwrap();
        let err = load_ingest_file(&ingest_path, &live).await.unwrap_err();
        assert!(matches!(err, Error::MalformedIngestRow { line: 3, .. }));
        assert_eq!(live.utxo_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_malformed_last_row_rolls_back_load() {
        let dir = tempfile::tempdir().unwrap();
        let chunk = dir.path().join("chunk");
        std::fs::write(&chunk, encode_all(&random_utxos(500))).unwrap();

        let ingest_path = dir.path().join("utxos.tsv");
        build_ingest_file(&[chunk], &ingest_path).unwrap();

        // Negative output index.
        let mut content = std::fs::read_to_string(&ingest_path).unwrap();
        content.push_str(&format!("{}\t-1\t10\t0\t500\t51\n", "CD".repeat(32)));
        std::fs::write(&ingest_path, content).unwrap();

        let live = LiveUtxoTable::open(&dir.path().join("live.sqlite")).await.unwrap();
        let err = load_ingest_file(&ingest_path, &live).await.unwrap_err();
        assert!(matches!(err, Error::Csv(_)), "{err:?}");
        assert_eq!(live.utxo_count().await.unwrap(), 0);

        // The same store accepts a well formed file afterwards.
        let valid = dir.path().join("valid.tsv");
        let utxos = random_utxos(3);
        let chunk = dir.path().join("chunk-valid");
        std::fs::write(&chunk, encode_all(&utxos)).unwrap();
        build_ingest_file(&[chunk], &valid).unwrap();
        assert_eq!(load_ingest_file(&valid, &live).await.unwrap(), 3);
        assert_eq!(live.scan(None, 10).await.unwrap(), utxos);
    }

    #[test]
    fn test_missing_empty_placeholder_verifies_as_empty() {
        let dir = tempfile::tempdir().unwrap();

        let placeholder = dir.path().join(EMPTY_BUCKET_NAME);
        let verification = verify_chunk_file(&placeholder).unwrap();
        assert!(verification.multiset.is_empty());
        assert_eq!(verification.utxo_count, 0);
        assert!(verification.complete);

        let with_extension = dir.path().join(format!("{EMPTY_BUCKET_NAME}.dat"));
        assert!(verify_chunk_file(&with_extension).unwrap().multiset.is_empty());

        let missing = dir.path().join(format!("{}.dat", "02".repeat(33)));
        assert!(matches!(verify_chunk_file(&missing), Err(Error::Io(_))));
    }

    #[test]
    fn test_verify_chunk_file() {
        let dir = tempfile::tempdir().unwrap();
        let utxos = random_utxos(10);

        let mut expected = EcMultiset::new();
        for utxo in &utxos {
            expected.insert(&utxo.encode());
        }

        let sorted = dir.path().join("sorted");
        std::fs::write(&sorted, encode_all(&utxos)).unwrap();
        let verification = verify_chunk_file(&sorted).unwrap();
        assert_eq!(verification.multiset.public_key(), expected.public_key());
        assert_eq!(verification.utxo_count, 10);
        assert!(verification.is_sorted);
        assert!(verification.complete);

        let mut reversed = utxos.clone();
        reversed.reverse();
        let unsorted = dir.path().join("unsorted");
        let mut bytes = encode_all(&reversed);
        bytes.push(0xff);
        std::fs::write(&unsorted, bytes).unwrap();
        let verification = verify_chunk_file(&unsorted).unwrap();
        assert_eq!(verification.multiset.public_key(), expected.public_key());
        assert!(!verification.is_sorted);
        assert!(!verification.complete);
    }
}
