//! Binary format of a committed UTXO.
//!
//! ```text
//! txid (32, wire order) | vout (u32 LE) | packed height (u32 LE) | amount (i64 LE) | script_len (CompactSize) | script
//! ```
//!
//! The most significant bit of the packed height carries the coinbase flag, the remaining
//! 31 bits carry the block height.

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, ScriptBuf, TxOut, Txid};
use std::cmp::Ordering;

/// Largest locking script a spendable output may carry.
pub const MAX_SPENDABLE_SCRIPT_BYTE_COUNT: usize = 10_000;

const COINBASE_FLAG: u32 = 0x8000_0000;
const HEIGHT_MASK: u32 = !COINBASE_FLAG;

// txid + vout + packed height + amount.
const FIXED_FIELDS_SIZE: usize = 32 + 4 + 4 + 8;

/// Identifier of an output, ordered by the display form of the txid and then by vout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutputId {
    pub txid: Txid,
    pub vout: u32,
}

impl OutputId {
    pub fn new(txid: Txid, vout: u32) -> Self {
        Self { txid, vout }
    }

    /// Txid bytes in display (big-endian) order, as stored in the staging tables.
    pub fn txid_display_bytes(&self) -> [u8; 32] {
        let mut bytes = self.txid.to_byte_array();
        bytes.reverse();
        bytes
    }

    pub fn from_display_bytes(txid: &[u8], vout: u32) -> Option<Self> {
        let mut bytes: [u8; 32] = txid.try_into().ok()?;
        bytes.reverse();
        Some(Self {
            txid: Txid::from_byte_array(bytes),
            vout,
        })
    }
}

impl Ord for OutputId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.txid_display_bytes()
            .cmp(&other.txid_display_bytes())
            .then(self.vout.cmp(&other.vout))
    }
}

impl PartialOrd for OutputId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<OutPoint> for OutputId {
    fn from(outpoint: OutPoint) -> Self {
        Self {
            txid: outpoint.txid,
            vout: outpoint.vout,
        }
    }
}

/// An unspent output as it appears in a UTXO commitment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommittedUtxo {
    pub txid: Txid,
    pub vout: u32,
    /// Only the low 31 bits are representable.
    pub height: u32,
    pub is_coinbase: bool,
    pub amount: i64,
    pub script_pubkey: Vec<u8>,
}

impl CommittedUtxo {
    pub fn new(output_id: OutputId, txout: &TxOut, height: u32, is_coinbase: bool) -> Self {
        Self {
            txid: output_id.txid,
            vout: output_id.vout,
            height,
            is_coinbase,
            amount: txout.value.to_sat() as i64,
            script_pubkey: txout.script_pubkey.to_bytes(),
        }
    }

    pub fn output_id(&self) -> OutputId {
        OutputId::new(self.txid, self.vout)
    }

    /// Number of bytes [`Self::encode_to`] appends.
    pub fn encoded_len(&self) -> usize {
        let script_len = self.script_pubkey.len();
        FIXED_FIELDS_SIZE + compact_size_len(script_len as u64) + script_len
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_to(&mut buf);
        buf
    }

    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        let mut packed_height = self.height & HEIGHT_MASK;
        if self.is_coinbase {
            packed_height |= COINBASE_FLAG;
        }

        buf.extend_from_slice(self.txid.as_byte_array());
        buf.extend_from_slice(&self.vout.to_le_bytes());
        buf.extend_from_slice(&packed_height.to_le_bytes());
        buf.extend_from_slice(&self.amount.to_le_bytes());
        write_compact_size(buf, self.script_pubkey.len() as u64);
        buf.extend_from_slice(&self.script_pubkey);
    }

    /// Decodes one record and advances `cursor` past it.
    ///
    /// Returns `None` when the input runs out or declares an oversized script. The position
    /// of `cursor` after a failure is unspecified.
    pub fn decode(cursor: &mut &[u8]) -> Option<Self> {
        let txid = Txid::from_byte_array(take_array::<32>(cursor)?);
        let vout = u32::from_le_bytes(take_array(cursor)?);
        let packed_height = u32::from_le_bytes(take_array(cursor)?);
        let amount = i64::from_le_bytes(take_array(cursor)?);

        let script_len = read_compact_size(cursor)?;
        if script_len > MAX_SPENDABLE_SCRIPT_BYTE_COUNT as u64 {
            return None;
        }
        let script_pubkey = take(cursor, script_len as usize)?.to_vec();

        Some(Self {
            txid,
            vout,
            height: packed_height & HEIGHT_MASK,
            is_coinbase: packed_height & COINBASE_FLAG != 0,
            amount,
            script_pubkey,
        })
    }
}

/// Returns `true` if the output can never be spent and is left out of commitments.
pub fn is_unspendable(script_pubkey: &ScriptBuf) -> bool {
    script_pubkey.is_op_return() || script_pubkey.len() > MAX_SPENDABLE_SCRIPT_BYTE_COUNT
}

fn take<'a>(cursor: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
    if cursor.len() < len {
        return None;
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Some(head)
}

fn take_array<const N: usize>(cursor: &mut &[u8]) -> Option<[u8; N]> {
    take(cursor, N)?.try_into().ok()
}

fn compact_size_len(size: u64) -> usize {
    match size {
        0..=252 => 1,
        253..=0xFFFF => 3,
        0x10000..=0xFFFF_FFFF => 5,
        _ => 9,
    }
}

// https://github.com/bitcoin/bitcoin/blob/0903ce8dbc25d3823b03d52f6e6bff74d19e801e/src/serialize.h#L305
fn write_compact_size(buf: &mut Vec<u8>, size: u64) {
    if size < 253 {
        buf.push(size as u8);
    } else if size <= 0xFFFF {
        buf.push(253);
        buf.extend_from_slice(&(size as u16).to_le_bytes());
    } else if size <= 0xFFFF_FFFF {
        buf.push(254);
        buf.extend_from_slice(&(size as u32).to_le_bytes());
    } else {
        buf.push(255);
        buf.extend_from_slice(&size.to_le_bytes());
    }
}

fn read_compact_size(cursor: &mut &[u8]) -> Option<u64> {
    let size = match take_array::<1>(cursor)?[0] {
        253 => u16::from_le_bytes(take_array(cursor)?) as u64,
        254 => u32::from_le_bytes(take_array(cursor)?) as u64,
        255 => u64::from_le_bytes(take_array(cursor)?),
        n => n as u64,
    };
    Some(size)
}
