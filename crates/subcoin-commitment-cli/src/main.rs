//! # subcoin-commitment-cli
//!
//! `utxo-commitment` operates on the UTXO commitments published by a Subcoin node:
//!
//! - List the commitments available for download together with their bucket breakdown.
//! - Serve a single chunk file by its content address.
//! - Verify downloaded chunk files against their names.
//! - Turn chunk files into an ingest file and bulk load it into a fresh live UTXO table.

mod cli;

use self::cli::{App, Command};
use bitcoin::BlockHash;
use clap::Parser;
use std::path::{Path, PathBuf};
use subcoin_utxo_commitment::loader::{build_ingest_file, load_ingest_file, verify_chunk_file};
use subcoin_utxo_commitment::{
    CommitmentCatalog, CommitmentDatabase, LiveUtxoTable, MultisetPublicKey,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Commitment(#[from] subcoin_utxo_commitment::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("Chunk file {0} not found")]
    ChunkNotFound(MultisetPublicKey),
    #[error("No UTXO commitment for block {0}")]
    CommitmentNotFound(BlockHash),
    #[error("{0} of {1} chunk files failed verification")]
    VerificationFailed(usize, usize),
    #[error("Ingest file incomplete, malformed data after {0} UTXOs")]
    IncompleteIngest(u64),
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let app = App::parse();

    let filter = if app.log.is_empty() {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::new(app.log.join(","))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match app.command {
        Command::List { buckets } => {
            list_commitments(catalog(&app.db, &app.output_dir).await?, buckets).await
        }
        Command::GetChunk { public_key, out } => {
            let catalog = catalog(&app.db, &app.output_dir).await?;
            let bytes = catalog
                .get_chunk_bytes(&public_key)
                .await?
                .ok_or(CliError::ChunkNotFound(public_key))?;
            std::fs::write(&out, &bytes)?;
            tracing::info!(%public_key, byte_count = bytes.len(), ?out, "Saved chunk file");
            Ok(())
        }
        Command::Verify { files } => verify_chunk_files(&files),
        Command::BuildIngest {
            block_hash,
            chunks,
            out,
        } => {
            let chunk_files = match block_hash {
                Some(block_hash) => catalog(&app.db, &app.output_dir)
                    .await?
                    .chunk_paths(&block_hash)
                    .await?
                    .ok_or(CliError::CommitmentNotFound(block_hash))?,
                None => chunks,
            };

            let report = build_ingest_file(&chunk_files, &out)?;
            if !report.complete {
                return Err(CliError::IncompleteIngest(report.utxo_count));
            }

            tracing::info!(
                utxo_count = report.utxo_count,
                chunk_count = chunk_files.len(),
                ?out,
                "Built ingest file"
            );
            Ok(())
        }
        Command::Load {
            ingest,
            live_db,
            height,
        } => {
            let live = LiveUtxoTable::open(&live_db).await?;
            let utxo_count = load_ingest_file(&ingest, &live).await?;
            if let Some(height) = height {
                live.set_checkpoint_height(height).await?;
            }
            tracing::info!(utxo_count, total = live.utxo_count().await?, "Loaded UTXO commitment");
            Ok(())
        }
    }
}

async fn catalog(db: &Path, output_dir: &Path) -> Result<CommitmentCatalog, CliError> {
    let db = CommitmentDatabase::open(db).await?;
    Ok(CommitmentCatalog::new(db, output_dir.to_path_buf()))
}

async fn list_commitments(catalog: CommitmentCatalog, show_buckets: bool) -> Result<(), CliError> {
    let commitments = catalog.list_available().await?;

    if commitments.is_empty() {
        println!("No UTXO commitments available");
        return Ok(());
    }

    for commitment in commitments {
        println!(
            "#{} {} hash={} public_key={} bytes={}",
            commitment.block_height,
            commitment.block_hash,
            hex::encode(commitment.hash),
            commitment.public_key,
            commitment.byte_count,
        );

        if show_buckets {
            for (index, bucket) in commitment.buckets.iter().enumerate() {
                println!("  [{index:>3}] {} bytes={}", bucket.public_key, bucket.byte_count);
                for sub_bucket in &bucket.sub_buckets {
                    println!(
                        "        {} bytes={}",
                        sub_bucket.public_key, sub_bucket.byte_count
                    );
                }
            }
        }
    }

    Ok(())
}

fn verify_chunk_files(files: &[PathBuf]) -> Result<(), CliError> {
    let mut failed = 0;

    for path in files {
        let verification = verify_chunk_file(path)?;
        let public_key = verification.multiset.public_key();

        let expected = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<MultisetPublicKey>().ok());

        let valid = verification.complete && expected.is_none_or(|expected| expected == public_key);

        if valid {
            tracing::info!(
                ?path,
                %public_key,
                utxo_count = verification.utxo_count,
                sorted = verification.is_sorted,
                "Chunk file verified"
            );
        } else {
            tracing::error!(
                ?path,
                %public_key,
                ?expected,
                complete = verification.complete,
                "Chunk file does not match its content address"
            );
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(CliError::VerificationFailed(failed, files.len()));
    }

    Ok(())
}
