//! Subcoin Crypto Primitives.

pub mod ecmh;

pub use ecmh::{EcMultiset, MultisetPublicKey};
