//! Contract with the live UTXO store of the node.

use crate::chain::BlockUtxoDiff;
use crate::db::{self, UtxoRow};
use crate::error::Result;
use crate::record::{CommittedUtxo, OutputId};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
};
use std::path::Path;
use tokio::sync::Mutex;

/// Live UTXO store the staging area imports its baseline from and commitments are loaded into.
#[async_trait::async_trait]
pub trait LiveUtxoStore: Send + Sync {
    /// Height of the last block durably reflected by the store.
    async fn checkpoint_height(&self) -> Result<u32>;

    /// Lock excluding writers of the store, held across a consistent full scan.
    fn write_lock(&self) -> &Mutex<()>;

    /// Returns up to `limit` records after `after` in ascending [`OutputId`] order.
    async fn scan(&self, after: Option<OutputId>, limit: usize) -> Result<Vec<CommittedUtxo>>;

    /// Inserts all records atomically, either every record is stored or none is.
    ///
    /// Records are consumed one by one. The first error from `utxos` aborts the load and
    /// discards every record inserted before it. Returns the number of loaded records.
    async fn bulk_load(&self, utxos: UtxoStream<'_>) -> Result<u64>;
}

/// Records handed to [`LiveUtxoStore::bulk_load`], decoded lazily.
pub type UtxoStream<'a> = Box<dyn Iterator<Item = Result<CommittedUtxo>> + Send + 'a>;

const CHECKPOINT_KEY: &str = "committed_utxo_block_height";

/// SQLite table backing the committed UTXO set of the node.
pub struct LiveUtxoTable {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl LiveUtxoTable {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS committed_unspent_transaction_outputs (
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
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    pub async fn set_checkpoint_height(&self, height: u32) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO properties (key, value) VALUES (?, ?)")
            .bind(CHECKPOINT_KEY)
            .bind(height as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Applies a block and moves the checkpoint to it.
    pub async fn apply_diff(&self, diff: &BlockUtxoDiff, height: u32) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut tx = self.pool.begin().await?;

        for utxo in &diff.created {
            insert_utxo(&mut tx, utxo).await?;
        }

        for output_id in &diff.spent {
            sqlx::query(
                "DELETE FROM committed_unspent_transaction_outputs
                 WHERE transaction_hash = ? AND output_index = ?",
            )
            .bind(output_id.txid_display_bytes().as_slice())
            .bind(output_id.vout as i64)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("INSERT OR REPLACE INTO properties (key, value) VALUES (?, ?)")
            .bind(CHECKPOINT_KEY)
            .bind(height as i64)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }

    pub async fn utxo_count(&self) -> Result<u64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM committed_unspent_transaction_outputs")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

#[async_trait::async_trait]
impl LiveUtxoStore for LiveUtxoTable {
    async fn checkpoint_height(&self) -> Result<u32> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT value FROM properties WHERE key = ?")
            .bind(CHECKPOINT_KEY)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(height,)| height as u32).unwrap_or(0))
    }

    fn write_lock(&self) -> &Mutex<()> {
        &self.write_lock
    }

    async fn scan(&self, after: Option<OutputId>, limit: usize) -> Result<Vec<CommittedUtxo>> {
        let rows: Vec<UtxoRow> = match after {
            Some(output_id) => {
                let txid = output_id.txid_display_bytes();
                sqlx::query_as(
                    "SELECT transaction_hash, output_index, block_height, is_coinbase, amount, locking_script
                     FROM committed_unspent_transaction_outputs
                     WHERE transaction_hash > ?1 OR (transaction_hash = ?1 AND output_index > ?2)
                     ORDER BY transaction_hash ASC, output_index ASC
                     LIMIT ?3",
                )
                .bind(txid.as_slice())
                .bind(output_id.vout as i64)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT transaction_hash, output_index, block_height, is_coinbase, amount, locking_script
                     FROM committed_unspent_transaction_outputs
                     ORDER BY transaction_hash ASC, output_index ASC
                     LIMIT ?",
                )
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(db::row_to_utxo).collect()
    }

    async fn bulk_load(&self, utxos: UtxoStream<'_>) -> Result<u64> {
        let _guard = self.write_lock.lock().await;

        // Dropping the transaction on error rolls back every inserted row.
        let mut tx = self.pool.begin().await?;

        let mut utxo_count = 0u64;
        for utxo in utxos {
            insert_utxo(&mut tx, &utxo?).await?;
            utxo_count += 1;
        }

        tx.commit().await?;

        tracing::debug!(utxo_count, "Bulk loaded UTXOs");

        Ok(utxo_count)
    }
}

async fn insert_utxo(conn: &mut SqliteConnection, utxo: &CommittedUtxo) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO committed_unspent_transaction_outputs
            (transaction_hash, output_index, block_height, is_coinbase, amount, locking_script)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(utxo.output_id().txid_display_bytes().as_slice())
    .bind(utxo.vout as i64)
    .bind(utxo.height as i64)
    .bind(utxo.is_coinbase)
    .bind(utxo.amount)
    .bind(utxo.script_pubkey.as_slice())
    .execute(&mut *conn)
    .await?;
    Ok(())
}
