use crate::sha256::Hash;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum TxInput {
    // mints `amount` of `asset_id`; the nonce keeps otherwise equal issuances distinct
    Issuance {
        asset_id: Hash,
        amount: u64,
        nonce: Uuid,
    },
    Spend {
        spent_output_id: Hash,
    },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    pub asset_id: Hash,
    pub amount: u64,
    pub control_program: Vec<u8>,
    pub unique_id: Uuid,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Transaction { inputs, outputs }
    }
    pub fn id(&self) -> Hash {
        Hash::hash(self)
    }
    pub fn output_id(&self, index: usize) -> Hash {
        Hash::hash(&(self.id(), index as u64))
    }
    pub fn spent_output_ids(&self) -> impl Iterator<Item = &Hash> {
        self.inputs.iter().filter_map(|input| match input {
            TxInput::Spend { spent_output_id } => Some(spent_output_id),
            TxInput::Issuance { .. } => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_ids_differ_per_index() {
        let out = TxOutput {
            asset_id: Hash::zero(),
            amount: 5,
            control_program: vec![1, 2, 3],
            unique_id: Uuid::nil(),
        };
        let tx = Transaction::new(vec![], vec![out.clone(), out]);
        assert_ne!(tx.output_id(0), tx.output_id(1));
        assert_eq!(tx.output_id(0), tx.output_id(0));
    }

    #[test]
    fn spent_output_ids_skip_issuances() {
        let spent = Hash::hash(&"prev");
        let tx = Transaction::new(
            vec![
                TxInput::Issuance {
                    asset_id: Hash::zero(),
                    amount: 1,
                    nonce: Uuid::nil(),
                },
                TxInput::Spend {
                    spent_output_id: spent,
                },
            ],
            vec![],
        );
        assert_eq!(tx.spent_output_ids().collect::<Vec<_>>(), vec![&spent]);
    }
}
