use bitcoin::BlockHash;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use subcoin_utxo_commitment::MultisetPublicKey;

const VERSION: &str = "0.1.0";

/// Subcoin UTXO Commitment
#[derive(Debug, Parser)]
#[clap(version = VERSION)]
#[clap(about = "Inspect, serve and load UTXO commitments")]
pub struct App {
    #[command(subcommand)]
    pub command: Command,

    /// Path of the commitment database.
    #[arg(long, value_name = "PATH", default_value = "./utxo-commitments/commitments.sqlite")]
    pub db: PathBuf,

    /// Directory holding the chunk files.
    #[arg(long, value_name = "PATH", default_value = "./utxo-commitments/chunks")]
    pub output_dir: PathBuf,

    /// Sets a custom logging filter (syntax: `<target>=<level>`).
    ///
    /// Log levels (least to most verbose) are `error`, `warn`, `info`, `debug`, and `trace`.
    ///
    /// By default, all targets log `info`. Multiple `<target>=<level>` entries can be
    /// specified and separated by a comma.
    ///
    /// *Example*: `--log warn,subcoin_utxo_commitment=debug`.
    #[arg(short = 'l', long, value_name = "LOG_PATTERN", num_args = 1..)]
    pub log: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the available commitments, most recent first.
    List {
        /// Also print every bucket of each commitment.
        #[arg(long)]
        buckets: bool,
    },

    /// Write the chunk file with the given content address to a local file.
    GetChunk {
        /// Public key naming the chunk file.
        public_key: MultisetPublicKey,

        /// Destination file.
        #[arg(long, short = 'o', value_name = "PATH")]
        out: PathBuf,
    },

    /// Recompute the multiset of chunk files and check it against their file names.
    Verify {
        /// Chunk files named `<public key>.dat`.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Decode chunk files into a tab separated ingest file.
    BuildIngest {
        /// Use every chunk file of the local commitment pinned to this block.
        #[arg(long, value_name = "HASH", conflicts_with = "chunks")]
        block_hash: Option<BlockHash>,

        /// Chunk files, decoded in the given order.
        #[arg(long, value_name = "PATH", num_args = 1..)]
        chunks: Vec<PathBuf>,

        /// Destination of the ingest file.
        #[arg(long, short = 'o', value_name = "PATH")]
        out: PathBuf,
    },

    /// Bulk load an ingest file into a live UTXO table.
    Load {
        /// Ingest file produced by `build-ingest`.
        ingest: PathBuf,

        /// Path of the live UTXO table.
        #[arg(long, value_name = "PATH")]
        live_db: PathBuf,

        /// Height of the commitment block, recorded as the checkpoint of the loaded set.
        #[arg(long, value_name = "HEIGHT")]
        height: Option<u32>,
    },
}
