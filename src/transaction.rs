//! Collaborative shuffle transaction.
//!
//! Every player builds the same unsigned transaction from the same inputs:
//!
//! * inputs ordered by `(txid, vout)`, each carrying a placeholder script
//!   that pushes its owner's public key until a signature arrives
//! * one mixed output per player at the shuffle amount, in the order of the
//!   final broadcast
//! * change outputs ordered by verification key, omitted below dust
//!
//! Signatures are legacy P2PKH `SIGHASH_ALL`. Signing is deterministic, so
//! all players end up with byte-identical transactions and txids.

use bitcoin::absolute::LockTime;
use bitcoin::ecdsa;
use bitcoin::hashes::Hash;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

/// Outputs below this value are not relayed and are dropped from the transaction.
pub const DUST_THRESHOLD: Amount = Amount::from_sat(546);

const INPUT_SEQUENCE: Sequence = Sequence(0xffff_fffe);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction has no participants")]
    Empty,
    #[error("{outputs} mixed outputs for {participants} participants")]
    OutputMismatch { outputs: usize, participants: usize },
    #[error("input {0} cannot cover the shuffle amount and fee")]
    InsufficientFunds(OutPoint),
    #[error("shuffle amount {0} is below dust")]
    BelowDust(Amount),
    #[error("input {0} is not part of this transaction")]
    UnknownInput(OutPoint),
    #[error("invalid signature for input {0}")]
    InvalidSignature(OutPoint),
    #[error("key does not own input {0}")]
    WrongKey(OutPoint),
    #[error("{0} inputs still unsigned")]
    Incomplete(usize),
    #[error("sighash computation failed: {0}")]
    Sighash(String),
}

/// One player's contribution to the transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub verification_key: String,
    pub outpoint: OutPoint,
    pub public_key: PublicKey,
    pub value: Amount,
    pub change_address: Address,
}

#[derive(Debug, Clone)]
pub struct ShuffleTransaction {
    transaction: Transaction,
    owners: Vec<PublicKey>,
    signed: Vec<bool>,
    amount: Amount,
}

impl ShuffleTransaction {
    /// Build the unsigned transaction.
    ///
    /// `outputs` are the shuffled addresses in final broadcast order. The
    /// shuffle amount is `fixed_amount` when given, otherwise the smallest
    /// input minus `fee`.
    pub fn build(
        participants: &[Participant],
        outputs: &[Address],
        fee: Amount,
        fixed_amount: Option<Amount>,
    ) -> Result<Self, TransactionError> {
        if participants.is_empty() {
            return Err(TransactionError::Empty);
        }
        if outputs.len() != participants.len() {
            return Err(TransactionError::OutputMismatch {
                outputs: outputs.len(),
                participants: participants.len(),
            });
        }

        let amount = match fixed_amount {
            Some(amount) => amount,
            None => {
                let smallest = participants
                    .iter()
                    .min_by_key(|p| p.value)
                    .ok_or(TransactionError::Empty)?;
                smallest
                    .value
                    .checked_sub(fee)
                    .ok_or(TransactionError::InsufficientFunds(smallest.outpoint))?
            }
        };
        if amount < DUST_THRESHOLD {
            return Err(TransactionError::BelowDust(amount));
        }

        let mut inputs: Vec<&Participant> = participants.iter().collect();
        inputs.sort_by(|a, b| {
            (a.outpoint.txid.to_string(), a.outpoint.vout)
                .cmp(&(b.outpoint.txid.to_string(), b.outpoint.vout))
        });

        let mut by_key: Vec<&Participant> = participants.iter().collect();
        by_key.sort_by(|a, b| a.verification_key.cmp(&b.verification_key));

        let mut change_outputs = Vec::new();
        for participant in by_key {
            let change = participant
                .value
                .checked_sub(amount)
                .and_then(|rest| rest.checked_sub(fee))
                .ok_or(TransactionError::InsufficientFunds(participant.outpoint))?;
            if change >= DUST_THRESHOLD {
                change_outputs.push(TxOut {
                    value: change,
                    script_pubkey: participant.change_address.script_pubkey(),
                });
            }
        }

        let transaction = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: inputs
                .iter()
                .map(|p| TxIn {
                    previous_output: p.outpoint,
                    script_sig: placeholder_script(&p.public_key),
                    sequence: INPUT_SEQUENCE,
                    witness: Witness::default(),
                })
                .collect(),
            output: outputs
                .iter()
                .map(|address| TxOut {
                    value: amount,
                    script_pubkey: address.script_pubkey(),
                })
                .chain(change_outputs)
                .collect(),
        };

        Ok(Self {
            owners: inputs.iter().map(|p| p.public_key).collect(),
            signed: vec![false; inputs.len()],
            transaction,
            amount,
        })
    }

    pub fn shuffle_amount(&self) -> Amount {
        self.amount
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn input_index(&self, outpoint: &OutPoint) -> Option<usize> {
        self.transaction
            .input
            .iter()
            .position(|input| input.previous_output == *outpoint)
    }

    pub fn is_signed(&self, outpoint: &OutPoint) -> bool {
        self.input_index(outpoint)
            .map(|index| self.signed[index])
            .unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.signed.iter().all(|signed| *signed)
    }

    /// Sign our own input and apply the signature
    ///
    /// # Returns
    /// DER signature with the sighash byte appended, as sent to peers
    pub fn sign_input(
        &mut self,
        outpoint: &OutPoint,
        key: &SecretKey,
    ) -> Result<Vec<u8>, TransactionError> {
        let index = self
            .input_index(outpoint)
            .ok_or(TransactionError::UnknownInput(*outpoint))?;
        let secp = Secp256k1::new();
        if PublicKey::from_secret_key(&secp, key) != self.owners[index] {
            return Err(TransactionError::WrongKey(*outpoint));
        }

        let digest = self.sighash(index)?;
        let signature = ecdsa::Signature::sighash_all(secp.sign_ecdsa(&digest, key));
        self.set_script_sig(index, &signature);
        Ok(signature.to_vec())
    }

    /// Verify a peer's signature for `outpoint` and apply it
    pub fn apply_signature(
        &mut self,
        outpoint: &OutPoint,
        signature: &[u8],
    ) -> Result<(), TransactionError> {
        let index = self
            .input_index(outpoint)
            .ok_or(TransactionError::UnknownInput(*outpoint))?;
        let signature = ecdsa::Signature::from_slice(signature)
            .map_err(|_| TransactionError::InvalidSignature(*outpoint))?;
        if signature.sighash_type != EcdsaSighashType::All {
            return Err(TransactionError::InvalidSignature(*outpoint));
        }

        let digest = self.sighash(index)?;
        Secp256k1::verification_only()
            .verify_ecdsa(&digest, &signature.signature, &self.owners[index])
            .map_err(|_| TransactionError::InvalidSignature(*outpoint))?;

        self.set_script_sig(index, &signature);
        Ok(())
    }

    /// The fully signed transaction
    pub fn finalize(&self) -> Result<Transaction, TransactionError> {
        let missing = self.signed.iter().filter(|signed| !**signed).count();
        if missing > 0 {
            return Err(TransactionError::Incomplete(missing));
        }
        Ok(self.transaction.clone())
    }

    fn sighash(&self, index: usize) -> Result<Message, TransactionError> {
        let script_code = p2pkh_script(&self.owners[index]);
        let sighash = SighashCache::new(&self.transaction)
            .legacy_signature_hash(index, &script_code, EcdsaSighashType::All.to_u32())
            .map_err(|e| TransactionError::Sighash(e.to_string()))?;
        Ok(Message::from_digest(sighash.to_byte_array()))
    }

    fn set_script_sig(&mut self, index: usize, signature: &ecdsa::Signature) {
        self.transaction.input[index].script_sig = Builder::new()
            .push_slice(signature.serialize())
            .push_key(&bitcoin::PublicKey::new(self.owners[index]))
            .into_script();
        self.signed[index] = true;
    }
}

fn placeholder_script(public_key: &PublicKey) -> ScriptBuf {
    Builder::new()
        .push_key(&bitcoin::PublicKey::new(*public_key))
        .into_script()
}

fn p2pkh_script(public_key: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&bitcoin::PublicKey::new(*public_key).pubkey_hash())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coin::legacy_address;
    use bitcoin::{Network, Txid};
    use std::str::FromStr;

    struct Fixture {
        keys: Vec<SecretKey>,
        participants: Vec<Participant>,
        outputs: Vec<Address>,
    }

    fn fixture(values: &[u64]) -> Fixture {
        let secp = Secp256k1::new();
        let txids = [
            "ff00000000000000000000000000000000000000000000000000000000000001",
            "0100000000000000000000000000000000000000000000000000000000000000",
            "7700000000000000000000000000000000000000000000000000000000000000",
        ];
        let mut keys = Vec::new();
        let mut participants = Vec::new();
        let mut outputs = Vec::new();
        for (i, value) in values.iter().enumerate() {
            let key = SecretKey::new(&mut rand::thread_rng());
            let public_key = PublicKey::from_secret_key(&secp, &key);
            let verification = PublicKey::from_secret_key(&secp, &SecretKey::new(&mut rand::thread_rng()));
            let change_key = PublicKey::from_secret_key(&secp, &SecretKey::new(&mut rand::thread_rng()));
            let output_key = PublicKey::from_secret_key(&secp, &SecretKey::new(&mut rand::thread_rng()));
            participants.push(Participant {
                verification_key: verification.to_string(),
                outpoint: OutPoint::new(Txid::from_str(txids[i % txids.len()]).unwrap(), i as u32),
                public_key,
                value: Amount::from_sat(*value),
                change_address: legacy_address(&change_key, Network::Bitcoin),
            });
            outputs.push(legacy_address(&output_key, Network::Bitcoin));
            keys.push(key);
        }
        Fixture {
            keys,
            participants,
            outputs,
        }
    }

    #[test]
    fn test_inputs_sorted_by_displayed_txid() {
        let f = fixture(&[100_000, 100_000, 100_000]);
        let tx = ShuffleTransaction::build(&f.participants, &f.outputs, Amount::from_sat(270), None)
            .unwrap();

        let order: Vec<String> = tx
            .transaction()
            .input
            .iter()
            .map(|i| i.previous_output.txid.to_string())
            .collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
        assert!(tx
            .transaction()
            .input
            .iter()
            .all(|i| i.sequence == INPUT_SEQUENCE && !i.script_sig.is_empty()));
    }

    #[test]
    fn test_mixed_outputs_follow_broadcast_order() {
        let f = fixture(&[100_000, 150_000, 120_000]);
        let tx = ShuffleTransaction::build(&f.participants, &f.outputs, Amount::from_sat(270), None)
            .unwrap();

        assert_eq!(tx.shuffle_amount(), Amount::from_sat(99_730));
        for (output, address) in tx.transaction().output.iter().zip(f.outputs.iter()) {
            assert_eq!(output.script_pubkey, address.script_pubkey());
            assert_eq!(output.value, Amount::from_sat(99_730));
        }
    }

    #[test]
    fn test_dust_change_suppressed() {
        // Smallest input has zero change, the second sits below dust.
        let f = fixture(&[100_000, 100_500, 160_000]);
        let tx = ShuffleTransaction::build(&f.participants, &f.outputs, Amount::from_sat(270), None)
            .unwrap();

        let outputs = &tx.transaction().output;
        assert_eq!(outputs.len(), 4);
        assert_eq!(outputs[3].value, Amount::from_sat(60_000));
        assert_eq!(
            outputs[3].script_pubkey,
            f.participants[2].change_address.script_pubkey()
        );
    }

    #[test]
    fn test_change_sorted_by_verification_key() {
        let f = fixture(&[100_000, 200_000, 300_000]);
        let tx = ShuffleTransaction::build(&f.participants, &f.outputs, Amount::from_sat(270), None)
            .unwrap();

        let mut expected: Vec<&Participant> = f.participants.iter().skip(1).collect();
        expected.sort_by(|a, b| a.verification_key.cmp(&b.verification_key));
        let change: Vec<ScriptBuf> = tx.transaction().output[3..]
            .iter()
            .map(|o| o.script_pubkey.clone())
            .collect();
        let expected: Vec<ScriptBuf> = expected
            .iter()
            .map(|p| p.change_address.script_pubkey())
            .collect();
        assert_eq!(change, expected);
    }

    #[test]
    fn test_fixed_amount_applies_dust_rule_to_everyone() {
        let f = fixture(&[100_000, 100_400, 150_000]);
        let tx = ShuffleTransaction::build(
            &f.participants,
            &f.outputs,
            Amount::from_sat(270),
            Some(Amount::from_sat(90_000)),
        )
        .unwrap();

        assert_eq!(tx.shuffle_amount(), Amount::from_sat(90_000));
        // 9_730, 10_130 and 59_730 change, all above dust.
        assert_eq!(tx.transaction().output.len(), 6);

        let short = ShuffleTransaction::build(
            &f.participants,
            &f.outputs,
            Amount::from_sat(270),
            Some(Amount::from_sat(100_000)),
        );
        assert!(matches!(short, Err(TransactionError::InsufficientFunds(_))));
    }

    #[test]
    fn test_build_rejects_mismatched_outputs() {
        let f = fixture(&[100_000, 100_000]);
        let result =
            ShuffleTransaction::build(&f.participants, &f.outputs[..1], Amount::from_sat(270), None);
        assert!(matches!(result, Err(TransactionError::OutputMismatch { .. })));
    }

    #[test]
    fn test_all_players_converge_on_same_txid() {
        let f = fixture(&[100_000, 110_000, 120_000]);
        let fee = Amount::from_sat(270);
        let mut copies: Vec<ShuffleTransaction> = (0..3)
            .map(|_| ShuffleTransaction::build(&f.participants, &f.outputs, fee, None).unwrap())
            .collect();

        for (i, participant) in f.participants.iter().enumerate() {
            let signature = copies[i]
                .sign_input(&participant.outpoint, &f.keys[i])
                .unwrap();
            for (j, copy) in copies.iter_mut().enumerate() {
                if j != i {
                    copy.apply_signature(&participant.outpoint, &signature).unwrap();
                }
            }
        }

        let txids: Vec<_> = copies
            .iter()
            .map(|c| c.finalize().unwrap().compute_txid())
            .collect();
        assert!(txids.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn test_invalid_signatures_rejected() {
        let f = fixture(&[100_000, 110_000]);
        let mut tx =
            ShuffleTransaction::build(&f.participants, &f.outputs, Amount::from_sat(270), None)
                .unwrap();

        // Signature from the wrong input's owner.
        let mut other = tx.clone();
        let signature = other
            .sign_input(&f.participants[1].outpoint, &f.keys[1])
            .unwrap();
        assert_eq!(
            tx.apply_signature(&f.participants[0].outpoint, &signature),
            Err(TransactionError::InvalidSignature(f.participants[0].outpoint))
        );
        assert_eq!(
            tx.apply_signature(&f.participants[0].outpoint, &[0x30, 0x01]),
            Err(TransactionError::InvalidSignature(f.participants[0].outpoint))
        );
        assert_eq!(
            tx.sign_input(&f.participants[0].outpoint, &f.keys[1]),
            Err(TransactionError::WrongKey(f.participants[0].outpoint))
        );
        assert!(matches!(tx.finalize(), Err(TransactionError::Incomplete(2))));
    }
}
