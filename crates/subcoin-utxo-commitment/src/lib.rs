//! # UTXO Commitments
//!
//! A UTXO commitment is a snapshot of the entire unspent output set pinned to a block, split
//! into content addressed chunk files that can be served to peers and loaded by a new node
//! instead of replaying the chain.
//!
//! - [`record`]: binary format of a committed UTXO.
//! - [`bucket`]: partitioning of a commitment into buckets of size-bounded chunk files.
//! - [`staging`]: maintenance of the staging area the commitments are built from.
//! - [`loader`]: decoding chunk files back into the live UTXO store.
//! - [`CommitmentCatalog`]: listing commitments and serving chunk files.
//!
//! Every chunk, bucket and commitment is identified by an elliptic curve multiset hash, so
//! buckets can be built independently and in parallel while still agreeing on one digest.

pub mod bucket;
mod catalog;
mod chain;
mod commitment;
mod config;
mod db;
mod error;
mod live;
pub mod loader;
pub mod record;
pub mod staging;


pub use self::catalog::{
    BucketBreakdown, CommitmentBreakdown, CommitmentCatalog, MAX_COMMITMENT_COUNT,
    SubBucketBreakdown,
};
pub use self::chain::{BlockUtxoDiff, ChainSource};
pub use self::commitment::{Commitment, CommitmentWriter};
pub use self::config::{CommitmentConfig, DEFAULT_REORG_SAFETY_LAG};
pub use self::db::{BucketRecord, CommitmentDatabase, CommitmentRecord};
pub use self::error::{Error, Result};
pub use self::live::{LiveUtxoStore, LiveUtxoTable, UtxoStream};
pub use self::record::{CommittedUtxo, OutputId};
pub use self::staging::{ImportStatus, StagingHandle, StagingMaintainer};
pub use subcoin_crypto::{EcMultiset, MultisetPublicKey};
