//! Staging area maintenance.
//!
//! The staging table mirrors the UTXO set as of the staging cursor, which trails the chain tip
//! by the reorg safety lag. It is seeded once from the live UTXO store and then advanced block by
//! block. Every block is applied in a single SQLite transaction that also moves the cursor, so a
//! crash at any point leaves the staging area exactly at the last fully applied block.
//!
//! Commitments are built from the staging table inside the transaction of the block they are
//! pinned to, before that block is applied, and old commitments are pruned once the
//! transaction is committed. Nothing is staged until the live store reaches the minimum
//! block height.

use crate::bucket::chunk_path;
use crate::chain::{BlockUtxoDiff, ChainSource};
use crate::commitment;
use crate::config::CommitmentConfig;
use crate::db::{self, CommitmentDatabase, IMPORT_CHECKPOINT_KEY, STAGING_CURSOR_KEY};
use crate::error::{Error, Result};
use crate::live::LiveUtxoStore;
use bitcoin::{Block, BlockHash};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, Notify};
use tokio::time::MissedTickBehavior;

/// Outcome of a baseline import attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStatus {
    /// The staging cursor is already set.
    AlreadyImported,
    /// The live store is too close to the chain tip, retried on the next tick.
    Deferred { checkpoint_height: u32, best_number: u32 },
    /// The live store has not reached the minimum block height yet, retried on the next tick.
    BelowMinBlockHeight { checkpoint_height: u32, min_block_height: u32 },
    /// Interrupted by the abort signal, resumed on the next attempt.
    Aborted { imported: u64 },
    Imported { checkpoint_height: u32, utxo_count: u64 },
}

/// Cloneable handle controlling a running [`StagingMaintainer`].
#[derive(Clone, Default)]
pub struct StagingHandle {
    trigger: Arc<Notify>,
    abort: Arc<AtomicBool>,
}

impl StagingHandle {
    /// Wakes the background task without waiting for the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Requests a graceful stop, honored between blocks and between import batches.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.trigger.notify_one();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

/// Keeps the staging area in sync with the chain and publishes commitments.
pub struct StagingMaintainer<C, L> {
    chain: Arc<C>,
    live: Arc<L>,
    db: CommitmentDatabase,
    config: CommitmentConfig,
    handle: StagingHandle,
    // Only one tick runs at a time.
    tick_lock: Mutex<()>,
}

impl<C, L> StagingMaintainer<C, L>
where
    C: ChainSource,
    L: LiveUtxoStore,
{
    pub fn new(chain: Arc<C>, live: Arc<L>, db: CommitmentDatabase, config: CommitmentConfig) -> Self {
        Self {
            chain,
            live,
            db,
            config,
            handle: StagingHandle::default(),
            tick_lock: Mutex::new(()),
        }
    }

    pub fn handle(&self) -> StagingHandle {
        self.handle.clone()
    }

    pub fn database(&self) -> &CommitmentDatabase {
        &self.db
    }

    /// Runs until aborted, waking up on every tick interval or explicit trigger.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.handle.trigger.notified() => {}
            }

            if self.handle.is_aborted() {
                tracing::info!("UTXO commitment staging stopped");
                return;
            }

            if let Err(err) = self.tick().await {
                tracing::error!(?err, "UTXO commitment staging failed, retrying on next tick");
            }
        }
    }

    /// Imports the baseline if needed and applies all blocks permitted by the reorg safety lag.
    ///
    /// Returns the number of applied blocks.
    pub async fn tick(&self) -> Result<u32> {
        let _guard = self.tick_lock.lock().await;

        match self.import_baseline().await? {
            ImportStatus::AlreadyImported | ImportStatus::Imported { .. } => {}
            ImportStatus::Deferred { .. }
            | ImportStatus::BelowMinBlockHeight { .. }
            | ImportStatus::Aborted { .. } => return Ok(0),
        }

        self.apply_pending_blocks().await
    }

    /// Copies the live UTXO store into the staging area, only while the staging cursor is unset.
    ///
    /// The live store stays write-locked for the entire scan. An interrupted import against the
    /// same live checkpoint resumes after the highest staged key.
    pub async fn import_baseline(&self) -> Result<ImportStatus> {
        let mut conn = self.db.pool().acquire().await?;

        if db::load_property(&mut conn, STAGING_CURSOR_KEY).await?.is_some() {
            return Ok(ImportStatus::AlreadyImported);
        }

        let _write_guard = self.live.write_lock().lock().await;

        let checkpoint_height = self.live.checkpoint_height().await?;
        let best_number = self.chain.best_number();

        if checkpoint_height < self.config.min_block_height {
            tracing::debug!(
                checkpoint_height,
                min_block_height = self.config.min_block_height,
                "Live UTXO set below minimum block height, skipping baseline import",
            );
            return Ok(ImportStatus::BelowMinBlockHeight {
                checkpoint_height,
                min_block_height: self.config.min_block_height,
            });
        }

        if checkpoint_height > best_number.saturating_sub(self.config.reorg_safety_lag) {
            tracing::info!(
                checkpoint_height,
                best_number,
                reorg_safety_lag = self.config.reorg_safety_lag,
                "Live UTXO set too close to chain tip, deferring baseline import",
            );
            return Ok(ImportStatus::Deferred {
                checkpoint_height,
                best_number,
            });
        }

        let mut last = match db::load_property(&mut conn, IMPORT_CHECKPOINT_KEY).await? {
            Some(height) if height == checkpoint_height => {
                let last = db::last_staged_output(&mut conn).await?;
                tracing::info!(checkpoint_height, ?last, "Resuming baseline import");
                last
            }
            _ => {
                let mut tx = self.db.begin().await?;
                db::clear_staged_utxos(&mut tx).await?;
                db::store_property(&mut tx, IMPORT_CHECKPOINT_KEY, checkpoint_height).await?;
                tx.commit().await?;
                tracing::info!(checkpoint_height, "Starting baseline import");
                None
            }
        };

        let batch_size = self.config.import_batch_size;
        let mut imported = 0u64;

        loop {
            if self.handle.is_aborted() {
                tracing::info!(imported, "Baseline import aborted");
                return Ok(ImportStatus::Aborted { imported });
            }

            let batch = self.live.scan(last, batch_size).await?;
            let Some(tail) = batch.last() else {
                break;
            };
            last.replace(tail.output_id());
            let exhausted = batch.len() < batch_size;

            let utxos = batch
                .into_iter()
                .filter(|utxo| utxo.amount > 0)
                .collect::<Vec<_>>();

            let mut tx = self.db.begin().await?;
            db::upsert_staged_utxos(&mut tx, &utxos).await?;
            tx.commit().await?;

            imported += utxos.len() as u64;
            tracing::debug!(imported, "Imported baseline batch");

            if exhausted {
                break;
            }
        }

        let mut tx = self.db.begin().await?;
        db::store_property(&mut tx, STAGING_CURSOR_KEY, checkpoint_height).await?;
        db::delete_property(&mut tx, IMPORT_CHECKPOINT_KEY).await?;
        tx.commit().await?;

        let utxo_count = self.db.staged_utxo_count().await?;

        tracing::info!(checkpoint_height, utxo_count, "Baseline import completed");

        Ok(ImportStatus::Imported {
            checkpoint_height,
            utxo_count,
        })
    }

    /// Applies blocks above the staging cursor until the reorg safety lag, the end of the chain
    /// or the abort signal stops it. Returns the number of applied blocks.
    pub async fn apply_pending_blocks(&self) -> Result<u32> {
        let Some(mut cursor) = self.db.staging_cursor().await? else {
            return Ok(0);
        };

        let mut parent_hash = self.chain.block_hash(cursor);
        let mut applied = 0;

        loop {
            if self.handle.is_aborted() {
                tracing::info!(cursor, "Staging aborted");
                break;
            }

            let height = cursor + 1;
            let best_number = self.chain.best_number();

            if height.saturating_add(self.config.reorg_safety_lag) > best_number {
                break;
            }

            let Some(block_hash) = self.chain.block_hash(height) else {
                break;
            };

            let block = self
                .chain
                .block(block_hash)
                .ok_or(Error::BlockNotFound(height))?;

            if let Some(parent_hash) = parent_hash {
                if block.header.prev_blockhash != parent_hash {
                    tracing::warn!(
                        height,
                        %block_hash,
                        %parent_hash,
                        "Block does not extend the staged chain, waiting for reorg to settle",
                    );
                    break;
                }
            }

            self.apply_block(&block, block_hash, height).await?;

            parent_hash = Some(block_hash);
            cursor = height;
            applied += 1;
        }

        if applied > 0 {
            tracing::debug!(cursor, applied, "Advanced staging cursor");
        }

        Ok(applied)
    }

    async fn apply_block(&self, block: &Block, block_hash: BlockHash, height: u32) -> Result<()> {
        let diff = BlockUtxoDiff::from_block(block, height);

        let mut tx = self.db.begin().await?;

        let mut published = false;

        // The commitment pinned to a block is the UTXO set that block is applied to, so it is
        // built before the block's own outputs are staged.
        if self.should_publish(height) {
            if db::commitment_exists(&mut tx, &block_hash).await? {
                tracing::debug!(height, %block_hash, "UTXO commitment already exists");
            } else {
                let commitment = commitment::build_commitment(
                    &mut tx,
                    &self.config.output_dir,
                    block_hash,
                    height,
                    self.config.max_chunk_byte_count,
                    self.config.build_batch_size,
                )
                .await?;
                db::insert_commitment(&mut tx, &commitment).await?;
                published = true;
            }
        }

        db::upsert_staged_utxos(&mut tx, &diff.created).await?;
        db::delete_staged_utxos(&mut tx, &diff.spent).await?;

        db::store_property(&mut tx, STAGING_CURSOR_KEY, height).await?;

        tx.commit().await?;

        tracing::trace!(
            height,
            created = diff.created.len(),
            spent = diff.spent.len(),
            "Applied block to staging area"
        );

        if published {
            tracing::info!(height, %block_hash, "Published UTXO commitment");
            self.prune_commitments().await?;
        }

        Ok(())
    }

    fn should_publish(&self, height: u32) -> bool {
        self.config.is_publish_height(height)
            && self
                .config
                .is_close_to_head(height, self.chain.best_header_number())
    }

    /// Deletes commitments outside the retention window together with their chunk files.
    ///
    /// Returns the number of deleted commitments.
    pub async fn prune_commitments(&self) -> Result<usize> {
        let mut conn = self.db.pool().acquire().await?;

        let commitments = db::list_commitments(&mut conn, i64::MAX as usize).await?;
        let trusted = self
            .config
            .trusted_commitments
            .iter()
            .collect::<HashSet<_>>();

        let mut deleted = 0;

        for commitment in commitments
            .iter()
            .skip(self.config.max_commitments_to_keep)
            .filter(|commitment| !trusted.contains(&commitment.public_key))
        {
            let chunk_keys = db::commitment_file_keys(&mut conn, commitment.id)
                .await?
                .into_iter()
                .collect::<HashSet<_>>();

            let mut tx = self.db.begin().await?;
            db::delete_commitment(&mut tx, commitment.id).await?;
            tx.commit().await?;

            for public_key in chunk_keys {
                if public_key.is_empty() || db::is_chunk_referenced(&mut conn, &public_key).await? {
                    continue;
                }

                let path = chunk_path(&self.config.output_dir, &public_key);
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        tracing::warn!(?path, "Chunk file of pruned commitment already gone");
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            tracing::info!(
                block_height = commitment.block_height,
                block_hash = %commitment.block_hash,
                "Deleted UTXO commitment",
            );

            deleted += 1;
        }

        Ok(deleted)
    }

    /// Whether the block at `height` must be kept around for the staging area.
    ///
    /// Blocks below the minimum height are never staged. The block at the cursor is still
    /// required, a reorg down to it is rolled forward from there.
    pub async fn requires_block(&self, height: u32) -> Result<bool> {
        if height < self.config.min_block_height {
            return Ok(false);
        }

        Ok(match self.db.staging_cursor().await? {
            Some(cursor) => height >= cursor,
            None => true,
        })
    }
}
