use crate::record::{CommittedUtxo, OutputId, is_unspendable};
use bitcoin::{Block, BlockHash};
use std::collections::{BTreeMap, BTreeSet};

/// Read access to the local chain.
pub trait ChainSource: Send + Sync {
    /// Height of the best block with its body available.
    fn best_number(&self) -> u32;

    /// Height of the best known header, can be ahead of [`Self::best_number`] during sync.
    fn best_header_number(&self) -> u32 {
        self.best_number()
    }

    /// Hash of the canonical block at `number`.
    fn block_hash(&self, number: u32) -> Option<BlockHash>;

    fn block(&self, block_hash: BlockHash) -> Option<Block>;
}

/// Effect of a block on the UTXO set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BlockUtxoDiff {
    /// Outputs created by the block and still unspent at its end.
    pub created: Vec<CommittedUtxo>,
    /// Outputs of earlier blocks spent by the block.
    pub spent: Vec<OutputId>,
}

impl BlockUtxoDiff {
    /// Both sides of the diff are sorted by [`OutputId`].
    pub fn from_block(block: &Block, height: u32) -> Self {
        let mut created = BTreeMap::new();
        let mut spent = BTreeSet::new();

        for (tx_index, tx) in block.txdata.iter().enumerate() {
            let txid = tx.compute_txid();
            let is_coinbase = tx_index == 0;

            if !is_coinbase {
                for input in &tx.input {
                    let output_id = OutputId::from(input.previous_output);
                    // Created and spent within this block, never becomes visible.
                    if created.remove(&output_id).is_none() {
                        spent.insert(output_id);
                    }
                }
            }

            for (vout, txout) in tx.output.iter().enumerate() {
                if is_unspendable(&txout.script_pubkey) {
                    continue;
                }
                let output_id = OutputId::new(txid, vout as u32);
                created.insert(
                    output_id,
                    CommittedUtxo::new(output_id, txout, height, is_coinbase),
                );
            }
        }

        Self {
            created: created.into_values().collect(),
            spent: spent.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{coinbase_tx, spend_tx, test_block};
    use bitcoin::hashes::Hash;

    #[test]
    fn test_in_block_spends_are_excluded() {
        let coinbase = coinbase_tx(1, &[50_000]);
        let split = spend_tx(&[(coinbase.compute_txid(), 0)], &[20_000, 29_000]);
        let spend_split = spend_tx(&[(split.compute_txid(), 1)], &[28_000]);
        let spend_earlier = spend_tx(&[(bitcoin::Txid::from_byte_array([9; 32]), 3)], &[1_000]);

        let split_txid = split.compute_txid();
        let spend_split_txid = spend_split.compute_txid();
        let spend_earlier_txid = spend_earlier.compute_txid();

        let block = test_block(
            bitcoin::BlockHash::all_zeros(),
            vec![coinbase, split, spend_split, spend_earlier],
        );
        let diff = BlockUtxoDiff::from_block(&block, 1);

        let created = diff.created.iter().map(|utxo| utxo.output_id()).collect::<BTreeSet<_>>();
        let expected = [
            OutputId::new(split_txid, 0),
            OutputId::new(spend_split_txid, 0),
            OutputId::new(spend_earlier_txid, 0),
        ]
        .into_iter()
        .collect::<BTreeSet<_>>();
        assert_eq!(created, expected);
        assert!(diff.created.iter().all(|utxo| !utxo.is_coinbase && utxo.height == 1));

        assert_eq!(
            diff.spent,
            vec![OutputId::new(bitcoin::Txid::from_byte_array([9; 32]), 3)]
        );
    }

    #[test]
    fn test_coinbase_outputs_are_flagged() {
        let block = test_block(bitcoin::BlockHash::all_zeros(), vec![coinbase_tx(7, &[10, 20])]);
        let diff = BlockUtxoDiff::from_block(&block, 7);
        assert_eq!(diff.created.len(), 2);
        assert!(diff.created.iter().all(|utxo| utxo.is_coinbase));
        assert!(diff.spent.is_empty());
        assert!(diff.created.windows(2).all(|w| w[0].output_id() < w[1].output_id()));
    }
}
