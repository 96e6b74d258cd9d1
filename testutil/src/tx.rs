//! Transaction generators.
use bitcoin::blockdata::script::Script;
use bitcoin::blockdata::transaction::{OutPoint, Transaction, TxIn, TxOut};
use bitcoin::blockdata::witness::Witness;
use bitcoin::{PackedLockTime, Sequence};

/// A syntactically valid, randomly-seeded transaction with a single dummy
/// input and output. Scripts are empty; nothing downstream of broadcast
/// coordination interprets them.
pub fn transaction(rng: &fastrand::Rng) -> Transaction {
    Transaction {
        version: 1,
        lock_time: PackedLockTime(0),
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: Script::new(),
            sequence: Sequence(0xffffffff),
            witness: Witness::default(),
        }],
        output: vec![TxOut {
            value: rng.u64(1_000..100_000_000),
            script_pubkey: Script::new(),
        }],
    }
}

/// A batch of `n` independent transactions.
pub fn transactions(rng: &fastrand::Rng, n: usize) -> Vec<Transaction> {
    (0..n).map(|_| transaction(rng)).collect()
}
