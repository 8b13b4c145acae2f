//! Elliptic curve multiset hash (ECMH) over secp256k1.
//!
//! Every item is mapped to a curve point with a try-and-increment hash, and a set of items
//! is represented by the sum of their points. Point addition is commutative and associative,
//! so accumulators built over disjoint groups can be combined in any order and still agree
//! with an accumulator built over the whole multiset in one pass.

use bitcoin::secp256k1::{PublicKey, Secp256k1, VerifyOnly};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static SECP256K1: LazyLock<Secp256k1<VerifyOnly>> = LazyLock::new(Secp256k1::verification_only);

/// Size of a serialized [`MultisetPublicKey`].
pub const PUBLIC_KEY_SIZE: usize = 33;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid multiset public key: {0}")]
    InvalidPublicKey(String),
}

/// Compressed form of the accumulated point, used as a content address.
///
/// The empty multiset (the point at infinity) is rendered as 33 zero bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MultisetPublicKey([u8; PUBLIC_KEY_SIZE]);

impl MultisetPublicKey {
    /// Public key of the empty multiset.
    pub const EMPTY: Self = Self([0u8; PUBLIC_KEY_SIZE]);

    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, Error> {
        let bytes: [u8; PUBLIC_KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::InvalidPublicKey(format!("expected 33 bytes, got {}", bytes.len())))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0u8; PUBLIC_KEY_SIZE]
    }
}

impl fmt::Display for MultisetPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for MultisetPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MultisetPublicKey({self})")
    }
}

impl FromStr for MultisetPublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|err| Error::InvalidPublicKey(err.to_string()))?;
        Self::from_slice(&bytes)
    }
}

/// Order independent hash of a multiset of byte strings.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EcMultiset {
    // `None` is the point at infinity.
    point: Option<PublicKey>,
}

impl EcMultiset {
    pub fn new() -> Self {
        Self { point: None }
    }

    /// Rebuilds an accumulator from its public key.
    pub fn from_public_key(public_key: &MultisetPublicKey) -> Result<Self, Error> {
        if public_key.is_empty() {
            return Ok(Self::new());
        }

        let point = PublicKey::from_slice(public_key.as_bytes())
            .map_err(|err| Error::InvalidPublicKey(err.to_string()))?;

        Ok(Self { point: Some(point) })
    }

    /// Adds one item to the multiset.
    pub fn insert(&mut self, data: &[u8]) {
        let item = hash_to_point(data);
        self.add_point(item);
    }

    /// Removes one occurrence of an item from the multiset.
    pub fn remove(&mut self, data: &[u8]) {
        let item = hash_to_point(data).negate(&SECP256K1);
        self.add_point(item);
    }

    /// Folds another accumulator into this one.
    pub fn combine(&mut self, other: &EcMultiset) {
        if let Some(point) = other.point {
            self.add_point(point);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.point.is_none()
    }

    /// SHA256 of the uncompressed point coordinates, 32 zero bytes for the empty multiset.
    pub fn digest(&self) -> [u8; 32] {
        match self.point {
            Some(point) => {
                let uncompressed = point.serialize_uncompressed();
                Sha256::digest(&uncompressed[1..]).into()
            }
            None => [0u8; 32],
        }
    }

    pub fn public_key(&self) -> MultisetPublicKey {
        self.point
            .map(|point| MultisetPublicKey(point.serialize()))
            .unwrap_or(MultisetPublicKey::EMPTY)
    }

    fn add_point(&mut self, point: PublicKey) {
        self.point = match self.point {
            // Sum is the point at infinity when the points cancel out.
            Some(current) => current.combine(&point).ok(),
            None => Some(point),
        };
    }
}

// Try-and-increment: the first `SHA256(le64(n) || SHA256(data))` that is a valid
// x-coordinate is lifted to the point with even y.
fn hash_to_point(data: &[u8]) -> PublicKey {
    let data_hash = Sha256::digest(data);

    let mut compressed = [0u8; PUBLIC_KEY_SIZE];
    compressed[0] = 0x02;

    for n in 0u64.. {
        let mut hasher = Sha256::new();
        hasher.update(n.to_le_bytes());
        hasher.update(data_hash);
        compressed[1..].copy_from_slice(&hasher.finalize());

        if let Ok(point) = PublicKey::from_slice(&compressed) {
            return point;
        }
    }

    unreachable!("Roughly half of all x-coordinates are on the curve")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const D1: [u8; 117] = hex!(
        "982051FD1E4BA744BBBE680E1FEE14677BA1A3C3540BF7B1CDB606E857233E0E\
        00000000010000000100F2052A0100000043410496B538E853519C726A2C91E6\
        1EC11600AE1390813A627C66FB8BE7947BE63C52DA7589379515D4E0A604F814\
        1781E62294721166BF621E73A82CBF2342C858EEAC"
    );
    const D2: [u8; 117] = hex!(
        "D5FDCC541E25DE1C7A5ADDEDF24858B8BB665C9F36EF744EE42C316022C90F9B\
        00000000020000000100F2052A010000004341047211A824F55B505228E4C3D5\
        194C1FCFAA15A456ABDF37F9B9D97A4040AFC073DEE6C89064984F03385237D9\
        2167C13E236446B417AB79A0FCAE412AE3316B77AC"
    );
    const D3: [u8; 117] = hex!(
        "44F672226090D85DB9A9F2FBFE5F0F9609B387AF7BE5B7FBB7A1767C831C9E99\
        00000000030000000100F2052A0100000043410494B9D3E76C5B1629ECF97FFF\
        95D7A4BBDAC87CC26099ADA28066C6FF1EB9191223CD897194A08D0C2726C574\
        7F1DB49E8CF90E75DC3E3550AE9B30086F3CD5AAAC"
    );

    fn multiset_of(items: &[&[u8]]) -> EcMultiset {
        let mut multiset = EcMultiset::new();
        for item in items {
            multiset.insert(item);
        }
        multiset
    }

    #[test]
    fn test_empty_multiset() {
        let multiset = EcMultiset::new();
        assert!(multiset.is_empty());
        assert_eq!(multiset.digest(), [0u8; 32]);
        assert_eq!(multiset.public_key(), MultisetPublicKey::EMPTY);
        assert_eq!(multiset.public_key().to_string(), "0".repeat(66));
    }

    #[test]
    fn test_single_item_digests() {
        assert_eq!(
            multiset_of(&[&D1]).digest(),
            hex!("F883195933A687170C34FA1ADEC66FE2861889279FB12C03A3FB0CA68AD87893")
        );
        assert_eq!(
            multiset_of(&[&D2]).digest(),
            hex!("EF85D123A15DA95D8AFF92623AD1E1C9FCDA3BAA801BD40BC567A83A6FDCF3E2")
        );
        assert_eq!(
            multiset_of(&[&D3]).digest(),
            hex!("CFADF40FC017FAFF5E04CCC0A2FAE0FD616E4226DD7C03B1334A7A610468EDFF")
        );
    }

    #[test]
    fn test_multiple_item_digests() {
        assert_eq!(
            multiset_of(&[&D1, &D2]).digest(),
            hex!("FABAFD38D07370982A34547DAF5B57B8A4398696D6FD2294788ABDA07B1FAAAF")
        );
        assert_eq!(
            multiset_of(&[&D1, &D2, &D3]).digest(),
            hex!("1CBCCDA23D7CE8C5A8B008008E1738E6BF9CFFB1D5B86A92A4E62B5394A636E2")
        );
    }

    #[test]
    fn test_remove_restores_previous_state() {
        let mut multiset = multiset_of(&[&D1, &D2, &D3]);
        multiset.remove(&D3);
        assert_eq!(multiset, multiset_of(&[&D1, &D2]));
        assert_eq!(
            multiset.digest(),
            hex!("FABAFD38D07370982A34547DAF5B57B8A4398696D6FD2294788ABDA07B1FAAAF")
        );

        multiset.remove(&D2);
        multiset.remove(&D1);
        assert!(multiset.is_empty());
        assert_eq!(multiset.digest(), [0u8; 32]);
    }

    #[test]
    fn test_insertion_order_does_not_matter() {
        let forward = multiset_of(&[&D1, &D2, &D3]);
        let backward = multiset_of(&[&D3, &D2, &D1]);
        let shuffled = multiset_of(&[&D2, &D3, &D1]);
        assert_eq!(forward.digest(), backward.digest());
        assert_eq!(forward.digest(), shuffled.digest());
    }

    #[test]
    fn test_adding_same_item_twice_is_not_idempotent() {
        assert_ne!(multiset_of(&[&D1, &D1]).digest(), multiset_of(&[&D1]).digest());
    }

    #[test]
    fn test_combine_matches_single_pass() {
        let expected = multiset_of(&[&D1, &D2, &D3]);

        let mut left = multiset_of(&[&D3]);
        left.combine(&multiset_of(&[&D1, &D2]));
        assert_eq!(left.digest(), expected.digest());

        let mut combined = EcMultiset::new();
        for group in [multiset_of(&[&D2]), EcMultiset::new(), multiset_of(&[&D3, &D1])] {
            combined.combine(&group);
        }
        assert_eq!(combined.digest(), expected.digest());
    }

    #[test]
    fn test_public_key_roundtrip() {
        let multiset = multiset_of(&[&D1, &D2]);
        let public_key = multiset.public_key();
        assert_eq!(public_key.as_bytes()[0] & 0xfe, 0x02);

        let parsed: MultisetPublicKey = public_key.to_string().parse().unwrap();
        assert_eq!(parsed, public_key);

        let restored = EcMultiset::from_public_key(&parsed).unwrap();
        assert_eq!(restored.digest(), multiset.digest());

        let restored_empty = EcMultiset::from_public_key(&MultisetPublicKey::EMPTY).unwrap();
        assert!(restored_empty.is_empty());
    }

    #[test]
    fn test_invalid_public_key_is_rejected() {
        assert!("abcd".parse::<MultisetPublicKey>().is_err());

        let mut bytes = [0xffu8; PUBLIC_KEY_SIZE];
        bytes[0] = 0x05;
        let public_key = MultisetPublicKey::from_bytes(bytes);
        assert!(EcMultiset::from_public_key(&public_key).is_err());
    }
}
