//! SQLite persistence of the staging area and of the published commitment metadata.

use crate::bucket::{BUCKET_COUNT, ChunkFile};
use crate::commitment::Commitment;
use crate::error::{Error, Result};
use crate::record::{CommittedUtxo, OutputId};
use bitcoin::BlockHash;
use bitcoin::hashes::Hash;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use sqlx::{Sqlite, Transaction};
use std::path::Path;
use subcoin_crypto::MultisetPublicKey;

/// Highest block folded into the staging area.
pub(crate) const STAGING_CURSOR_KEY: &str = "staged_utxo_commitment_block_height";
/// Live store checkpoint the baseline import is copying.
pub(crate) const IMPORT_CHECKPOINT_KEY: &str = "staged_utxo_commitment_import_height";

/// `(transaction_hash, output_index, block_height, is_coinbase, amount, locking_script)`
pub(crate) type UtxoRow = (Vec<u8>, i64, i64, bool, i64, Vec<u8>);

/// Metadata of a published commitment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitmentRecord {
    pub id: i64,
    pub block_hash: BlockHash,
    pub block_height: u32,
    pub hash: [u8; 32],
    pub public_key: MultisetPublicKey,
}

/// Metadata of one bucket of a published commitment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BucketRecord {
    pub id: i64,
    pub index: usize,
    pub public_key: MultisetPublicKey,
    pub chunks: Vec<ChunkFile>,
}

/// SQLite database owned by the commitment subsystem.
#[derive(Clone)]
pub struct CommitmentDatabase {
    pool: SqlitePool,
}

impl CommitmentDatabase {
    /// Opens or creates the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .pragma("synchronous", "NORMAL");

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.init_schema().await?;

        Ok(db)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS staged_utxo_commitment (
                transaction_hash BLOB NOT NULL,
                output_index INTEGER NOT NULL,
                block_height INTEGER NOT NULL,
                is_coinbase INTEGER NOT NULL,
                amount INTEGER NOT NULL,
                locking_script BLOB NOT NULL,
                PRIMARY KEY (transaction_hash, output_index)
            ) WITHOUT ROWID;

            CREATE TABLE IF NOT EXISTS properties (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS utxo_commitments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                block_hash BLOB NOT NULL UNIQUE,
                block_height INTEGER NOT NULL,
                hash BLOB NOT NULL,
                public_key BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_commitments_height ON utxo_commitments(block_height DESC);

            CREATE TABLE IF NOT EXISTS utxo_commitment_buckets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                utxo_commitment_id INTEGER NOT NULL REFERENCES utxo_commitments(id) ON DELETE CASCADE,
                bucket_index INTEGER NOT NULL,
                public_key BLOB NOT NULL,
                UNIQUE (utxo_commitment_id, bucket_index)
            );

            CREATE TABLE IF NOT EXISTS utxo_commitment_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                utxo_commitment_bucket_id INTEGER NOT NULL REFERENCES utxo_commitment_buckets(id) ON DELETE CASCADE,
                sub_bucket_index INTEGER NOT NULL,
                public_key BLOB NOT NULL,
                utxo_count INTEGER NOT NULL,
                byte_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_commitment_files_key ON utxo_commitment_files(public_key);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    /// Returns the staging cursor, `None` until the baseline import has completed.
    pub async fn staging_cursor(&self) -> Result<Option<u32>> {
        let mut conn = self.pool.acquire().await?;
        load_property(&mut conn, STAGING_CURSOR_KEY).await
    }

    pub async fn staged_utxo_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM staged_utxo_commitment")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Returns up to `limit` commitments, most recent first.
    pub async fn list_commitments(&self, limit: usize) -> Result<Vec<CommitmentRecord>> {
        let mut conn = self.pool.acquire().await?;
        list_commitments(&mut conn, limit).await
    }

    /// Returns the buckets of a commitment ordered by bucket index.
    pub async fn commitment_buckets(&self, commitment_id: i64) -> Result<Vec<BucketRecord>> {
        let rows: Vec<(i64, i64, Vec<u8>)> = sqlx::query_as(
            "SELECT id, bucket_index, public_key FROM utxo_commitment_buckets
             WHERE utxo_commitment_id = ? ORDER BY bucket_index ASC",
        )
        .bind(commitment_id)
        .fetch_all(&self.pool)
        .await?;

        let mut buckets = Vec::with_capacity(rows.len());
        for (id, index, public_key) in rows {
            let files: Vec<(Vec<u8>, i64, i64)> = sqlx::query_as(
                "SELECT public_key, utxo_count, byte_count FROM utxo_commitment_files
                 WHERE utxo_commitment_bucket_id = ? ORDER BY sub_bucket_index ASC",
            )
            .bind(id)
            .fetch_all(&self.pool)
            .await?;

            let chunks = files
                .into_iter()
                .map(|(public_key, utxo_count, byte_count)| {
                    Ok(ChunkFile {
                        public_key: MultisetPublicKey::from_slice(&public_key)?,
                        utxo_count: utxo_count as u64,
                        byte_count: byte_count as u64,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            buckets.push(BucketRecord {
                id,
                index: index as usize,
                public_key: MultisetPublicKey::from_slice(&public_key)?,
                chunks,
            });
        }

        Ok(buckets)
    }
}

pub(crate) async fn load_property(conn: &mut SqliteConnection, key: &str) -> Result<Option<u32>> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT value FROM properties WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(|(value,)| value as u32))
}

pub(crate) async fn store_property(conn: &mut SqliteConnection, key: &str, value: u32) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO properties (key, value) VALUES (?, ?)")
        .bind(key)
        .bind(value as i64)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn delete_property(conn: &mut SqliteConnection, key: &str) -> Result<()> {
    sqlx::query("DELETE FROM properties WHERE key = ?")
        .bind(key)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ========== Staging Area ==========

pub(crate) async fn clear_staged_utxos(conn: &mut SqliteConnection) -> Result<()> {
    sqlx::query("DELETE FROM staged_utxo_commitment")
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn upsert_staged_utxos(
    conn: &mut SqliteConnection,
    utxos: &[CommittedUtxo],
) -> Result<()> {
    for utxo in utxos {
        sqlx::query(
            "INSERT INTO staged_utxo_commitment
                (transaction_hash, output_index, block_height, is_coinbase, amount, locking_script)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (transaction_hash, output_index) DO UPDATE SET
                block_height = excluded.block_height,
                is_coinbase = excluded.is_coinbase,
                amount = excluded.amount",
        )
        .bind(utxo.output_id().txid_display_bytes().as_slice())
        .bind(utxo.vout as i64)
        .bind(utxo.height as i64)
        .bind(utxo.is_coinbase)
        .bind(utxo.amount)
        .bind(utxo.script_pubkey.as_slice())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub(crate) async fn delete_staged_utxos(
    conn: &mut SqliteConnection,
    output_ids: &[OutputId],
) -> Result<()> {
    for output_id in output_ids {
        sqlx::query(
            "DELETE FROM staged_utxo_commitment WHERE transaction_hash = ? AND output_index = ?",
        )
        .bind(output_id.txid_display_bytes().as_slice())
        .bind(output_id.vout as i64)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// Reads the next `limit` staged records after `after` in ascending key order.
pub(crate) async fn fetch_staged_utxos(
    conn: &mut SqliteConnection,
    after: Option<&OutputId>,
    limit: usize,
) -> Result<Vec<CommittedUtxo>> {
    let rows: Vec<UtxoRow> = match after {
        Some(output_id) => {
            let txid = output_id.txid_display_bytes();
            sqlx::query_as(
                "SELECT transaction_hash, output_index, block_height, is_coinbase, amount, locking_script
                 FROM staged_utxo_commitment
                 WHERE transaction_hash > ?1 OR (transaction_hash = ?1 AND output_index > ?2)
                 ORDER BY transaction_hash ASC, output_index ASC
                 LIMIT ?3",
            )
            .bind(txid.as_slice())
            .bind(output_id.vout as i64)
            .bind(limit as i64)
            .fetch_all(&mut *conn)
            .await?
        }
        None => {
            sqlx::query_as(
                "SELECT transaction_hash, output_index, block_height, is_coinbase, amount, locking_script
                 FROM staged_utxo_commitment
                 ORDER BY transaction_hash ASC, output_index ASC
                 LIMIT ?",
            )
            .bind(limit as i64)
            .fetch_all(&mut *conn)
            .await?
        }
    };

    rows.into_iter().map(row_to_utxo).collect()
}

/// Highest staged key, the point a interrupted baseline import resumes after.
pub(crate) async fn last_staged_output(conn: &mut SqliteConnection) -> Result<Option<OutputId>> {
    let row: Option<(Vec<u8>, i64)> = sqlx::query_as(
        "SELECT transaction_hash, output_index FROM staged_utxo_commitment
         ORDER BY transaction_hash DESC, output_index DESC LIMIT 1",
    )
    .fetch_optional(&mut *conn)
    .await?;

    row.map(|(txid, vout)| {
        OutputId::from_display_bytes(&txid, vout as u32)
            .ok_or_else(|| Error::CorruptRow(hex::encode(&txid)))
    })
    .transpose()
}

pub(crate) fn row_to_utxo(row: UtxoRow) -> Result<CommittedUtxo> {
    let (txid, vout, height, is_coinbase, amount, script_pubkey) = row;
    let output_id = OutputId::from_display_bytes(&txid, vout as u32)
        .ok_or_else(|| Error::CorruptRow(hex::encode(&txid)))?;
    Ok(CommittedUtxo {
        txid: output_id.txid,
        vout: output_id.vout,
        height: height as u32,
        is_coinbase,
        amount,
        script_pubkey,
    })
}

// ========== Commitments ==========

pub(crate) async fn commitment_exists(
    conn: &mut SqliteConnection,
    block_hash: &BlockHash,
) -> Result<bool> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM utxo_commitments WHERE block_hash = ?")
        .bind(block_hash.as_byte_array().as_slice())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

/// Inserts the metadata of a freshly built commitment and returns its id.
pub(crate) async fn insert_commitment(
    conn: &mut SqliteConnection,
    commitment: &Commitment,
) -> Result<i64> {
    debug_assert_eq!(commitment.buckets.len(), BUCKET_COUNT);

    let commitment_id = sqlx::query(
        "INSERT INTO utxo_commitments (block_hash, block_height, hash, public_key) VALUES (?, ?, ?, ?)",
    )
    .bind(commitment.block_hash.as_byte_array().as_slice())
    .bind(commitment.block_height as i64)
    .bind(commitment.digest().as_slice())
    .bind(commitment.public_key().as_bytes().as_slice())
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    for bucket in &commitment.buckets {
        let bucket_id = sqlx::query(
            "INSERT INTO utxo_commitment_buckets (utxo_commitment_id, bucket_index, public_key) VALUES (?, ?, ?)",
        )
        .bind(commitment_id)
        .bind(bucket.index as i64)
        .bind(bucket.public_key().as_bytes().as_slice())
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        for (sub_bucket_index, chunk) in bucket.chunks.iter().enumerate() {
            sqlx::query(
                "INSERT INTO utxo_commitment_files
                    (utxo_commitment_bucket_id, sub_bucket_index, public_key, utxo_count, byte_count)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(bucket_id)
            .bind(sub_bucket_index as i64)
            .bind(chunk.public_key.as_bytes().as_slice())
            .bind(chunk.utxo_count as i64)
            .bind(chunk.byte_count as i64)
            .execute(&mut *conn)
            .await?;
        }
    }

    Ok(commitment_id)
}

pub(crate) async fn list_commitments(
    conn: &mut SqliteConnection,
    limit: usize,
) -> Result<Vec<CommitmentRecord>> {
    let rows: Vec<(i64, Vec<u8>, i64, Vec<u8>, Vec<u8>)> = sqlx::query_as(
        "SELECT id, block_hash, block_height, hash, public_key FROM utxo_commitments
         ORDER BY block_height DESC LIMIT ?",
    )
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|(id, block_hash, block_height, hash, public_key)| {
            let block_hash = BlockHash::from_slice(&block_hash)
                .map_err(|_| Error::CorruptRow(hex::encode(&block_hash)))?;
            let hash: [u8; 32] = hash
                .as_slice()
                .try_into()
                .map_err(|_| Error::CorruptRow(hex::encode(&hash)))?;
            Ok(CommitmentRecord {
                id,
                block_hash,
                block_height: block_height as u32,
                hash,
                public_key: MultisetPublicKey::from_slice(&public_key)?,
            })
        })
        .collect()
}

/// Content addresses of every chunk file of a commitment.
pub(crate) async fn commitment_file_keys(
    conn: &mut SqliteConnection,
    commitment_id: i64,
) -> Result<Vec<MultisetPublicKey>> {
    let rows: Vec<(Vec<u8>,)> = sqlx::query_as(
        "SELECT f.public_key FROM utxo_commitment_files f
         INNER JOIN utxo_commitment_buckets b ON b.id = f.utxo_commitment_bucket_id
         WHERE b.utxo_commitment_id = ?",
    )
    .bind(commitment_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|(public_key,)| Ok(MultisetPublicKey::from_slice(&public_key)?))
        .collect()
}

/// Deletes a commitment together with its bucket and file rows.
pub(crate) async fn delete_commitment(conn: &mut SqliteConnection, commitment_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM utxo_commitments WHERE id = ?")
        .bind(commitment_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Whether any remaining commitment still lists a chunk file with this content address.
pub(crate) async fn is_chunk_referenced(
    conn: &mut SqliteConnection,
    public_key: &MultisetPublicKey,
) -> Result<bool> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM utxo_commitment_files WHERE public_key = ? LIMIT 1")
            .bind(public_key.as_bytes().as_slice())
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row.is_some())
}
