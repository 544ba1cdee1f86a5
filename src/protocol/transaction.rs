//! Claim and refund transaction construction.
//!
//! [`construct_transaction`] sweeps one or more swap outputs into their destination addresses.
//! Fees are split evenly across the spent outputs. Cooperative outputs are signed through the key
//! path with the counterparty, everything else through the script path. A failed cooperative claim
//! is downgraded to the script path, a failed cooperative refund is dropped from the transaction.
//!
//! Besides swap lockups, funds sitting in a funding address can be refunded the same way.

use std::collections::HashMap;

use bitcoin::{
    absolute::LockTime,
    consensus::encode::serialize_hex,
    hashes::Hash,
    secp256k1::{Keypair, Message, Secp256k1},
    sighash::{Prevouts, SighashCache},
    taproot::{self, ControlBlock, LeafVersion, TapLeafHash, TaprootSpendInfo},
    transaction::Version,
    Address, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness,
};

use super::{
    error::ProtocolError,
    musig2::{key_spend_sighash, SigningSession, SIGHASH_TYPE},
    swap_tree::{CooperativeTree, FundingTree, SwapTree},
};
use crate::{
    api::{
        ChainSwapSigningRequest, ClaimRequest, CounterpartyApi, FundingRefundRequest,
        RefundRequest,
    },
    swap::{Currency, SwapType},
};

/// Placeholder witness element used to size key path spends before they are signed.
const DUMMY_SIGNATURE: [u8; 64] = [0u8; 64];

/// Fee of a construction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Fee {
    /// Absolute fee in satoshis.
    Sats(u64),
    /// Fee rate. The absolute fee is `ceil(vsize * rate)`.
    SatsPerVbyte(f64),
}

/// Tree locking an output.
#[derive(Debug, Clone)]
pub enum LockupTree {
    /// Lockup of a swap.
    Swap(SwapTree),
    /// Funding address. Only its refund leaf exists.
    Funding(FundingTree),
}

impl LockupTree {
    /// Leaf spent through the script path and its control block.
    fn leaf(&self, refund: bool) -> Result<(&ScriptBuf, ControlBlock), ProtocolError> {
        match self {
            Self::Swap(tree) => {
                let leaf = if refund {
                    tree.refund_leaf()
                } else {
                    tree.claim_leaf()
                };
                Ok((leaf, tree.control_block(leaf)?))
            }
            Self::Funding(tree) if refund => Ok((tree.refund_leaf(), tree.control_block()?)),
            Self::Funding(_) => Err(ProtocolError::General(
                "funding addresses can only be refunded",
            )),
        }
    }
}

impl CooperativeTree for LockupTree {
    fn our_key(&self) -> &bitcoin::secp256k1::SecretKey {
        match self {
            Self::Swap(tree) => tree.our_key(),
            Self::Funding(tree) => tree.our_key(),
        }
    }

    fn counterparty_key(&self) -> &bitcoin::secp256k1::PublicKey {
        match self {
            Self::Swap(tree) => tree.counterparty_key(),
            Self::Funding(tree) => tree.counterparty_key(),
        }
    }

    fn spend_info(&self) -> &TaprootSpendInfo {
        match self {
            Self::Swap(tree) => tree.spend_info(),
            Self::Funding(tree) => tree.spend_info(),
        }
    }
}

impl From<SwapTree> for LockupTree {
    fn from(tree: SwapTree) -> Self {
        Self::Swap(tree)
    }
}

impl From<FundingTree> for LockupTree {
    fn from(tree: FundingTree) -> Self {
        Self::Funding(tree)
    }
}

/// One swap output to be spent.
#[derive(Debug, Clone)]
pub struct OutputDetails {
    /// Id of the swap the output belongs to.
    pub swap_id: String,
    /// Kind of swap.
    pub swap_type: SwapType,
    /// Transaction holding the output.
    pub lockup_transaction: Transaction,
    /// Index of the output in `lockup_transaction`.
    pub vout: u32,
    /// Where the funds go.
    pub address: Address,
    /// Tree locking the output.
    pub tree: LockupTree,
    /// Preimage for claims. Empty for refunds.
    pub preimage: Vec<u8>,
    /// Refund timeout, only used for non-cooperative refunds.
    pub timeout_block_height: u32,
    /// Whether to spend through the key path with the counterparty.
    pub cooperative: bool,
    /// Tree of the user lockup of a chain swap. Needed to co-sign the counterparty's claim
    /// in exchange for ours. A funding tree when the user lockup sits in a funding address.
    pub user_lockup_tree: Option<LockupTree>,
    /// Set when refunding a funding address directly rather than a swap.
    pub funding_address_id: Option<String>,
}

impl OutputDetails {
    /// Whether the output is refunded rather than claimed.
    pub fn is_refund(&self) -> bool {
        self.preimage.is_empty()
    }

    fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.lockup_transaction.compute_txid(), self.vout)
    }

    fn prevout(&self) -> Result<&TxOut, ProtocolError> {
        self.lockup_transaction
            .output
            .get(self.vout as usize)
            .ok_or(ProtocolError::MissingOutput(self.vout))
    }
}

/// Per swap outcome of a construction: the fee share paid, or why the output was dropped.
#[derive(Debug, Default)]
pub struct Results(HashMap<String, Result<u64, ProtocolError>>);

impl Results {
    fn set_fee(&mut self, id: &str, fee: u64) {
        self.0.insert(id.to_string(), Ok(fee));
    }

    /// The first error recorded for a swap sticks.
    fn set_err(&mut self, id: &str, err: ProtocolError) {
        if !matches!(self.0.get(id), Some(Err(_))) {
            self.0.insert(id.to_string(), Err(err));
        }
    }

    /// Outcome for `id`.
    pub fn get(&self, id: &str) -> Option<&Result<u64, ProtocolError>> {
        self.0.get(id)
    }

    /// Consumes the results.
    pub fn into_inner(self) -> HashMap<String, Result<u64, ProtocolError>> {
        self.0
    }

    /// Number of swaps with a result.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no swap has a result.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Builds and signs a transaction spending `outputs`.
///
/// Fails only when no output survives, in which case every swap has its own error in the
/// returned [`Results`] of the last round.
pub fn construct_transaction(
    currency: Currency,
    outputs: Vec<OutputDetails>,
    fee: Fee,
    api: Option<&dyn CounterpartyApi>,
) -> Result<(Transaction, Results), ProtocolError> {
    if currency != Currency::Btc {
        return Err(ProtocolError::UnsupportedCurrency(currency.to_string()));
    }

    let mut results = Results::default();
    let mut outputs = outputs;

    // Every extra round drops an output or downgrades a cooperative one.
    let max_rounds = outputs.len() + outputs.iter().filter(|o| o.cooperative).count() + 1;
    for round in 0..max_rounds {
        if outputs.is_empty() {
            return Err(ProtocolError::AllOutputsInvalid);
        }

        let (mut tx, prevouts, rejected) = match fee {
            Fee::Sats(sats) => build_transaction(&outputs, sats, &mut results)?,
            Fee::SatsPerVbyte(rate) => {
                let draft = build_transaction(&outputs, 0, &mut results)?;
                if draft.2.is_empty() {
                    let sats = (draft.0.vsize() as f64 * rate).ceil() as u64;
                    build_transaction(&outputs, sats, &mut results)?
                } else {
                    draft
                }
            }
        };

        if !rejected.is_empty() {
            log::debug!("Round {round}: dropping {} outputs that can not pay their fee", rejected.len());
            outputs.retain(|output| !rejected.contains(&output.swap_id));
            continue;
        }

        let mut changed = false;
        let mut next = Vec::with_capacity(outputs.len());
        for (index, output) in outputs.iter().enumerate() {
            if !output.cooperative {
                next.push(output.clone());
                continue;
            }
            match sign_cooperative(&mut tx, &prevouts, output, index, api) {
                Ok(()) => next.push(output.clone()),
                Err(e) if output.is_refund() => {
                    log::warn!(
                        "Could not refund swap {} cooperatively: {e}",
                        output.swap_id
                    );
                    results.set_err(&output.swap_id, e);
                    changed = true;
                }
                Err(e) => {
                    log::warn!(
                        "Could not claim swap {} cooperatively, falling back to script path: {e}",
                        output.swap_id
                    );
                    let mut downgraded = output.clone();
                    downgraded.cooperative = false;
                    next.push(downgraded);
                    changed = true;
                }
            }
        }

        if !changed {
            return Ok((tx, results));
        }
        outputs = next;
    }

    Err(ProtocolError::General("transaction construction did not converge"))
}

/// Builds the transaction with `fee` split over all outputs. Returns the ids of outputs that
/// cannot pay their share.
fn build_transaction(
    outputs: &[OutputDetails],
    fee: u64,
    results: &mut Results,
) -> Result<(Transaction, Vec<TxOut>, Vec<String>), ProtocolError> {
    let count = outputs.len() as u64;
    let fee_per_output = fee / count;
    let mut remainder = fee % count;

    let mut destinations: Vec<(ScriptBuf, u64)> = Vec::new();
    let mut prevouts = Vec::with_capacity(outputs.len());
    let mut rejected = Vec::new();

    for output in outputs {
        let share = fee_per_output + remainder;
        remainder = 0;

        let prevout = match output.prevout() {
            Ok(prevout) => prevout.clone(),
            Err(e) => {
                results.set_err(&output.swap_id, e);
                rejected.push(output.swap_id.clone());
                continue;
            }
        };
        let value = prevout.value.to_sat();
        if value < share {
            results.set_err(&output.swap_id, ProtocolError::ValueBelowFee { value, fee: share });
            rejected.push(output.swap_id.clone());
            continue;
        }

        results.set_fee(&output.swap_id, share);
        let script_pubkey = output.address.script_pubkey();
        match destinations.iter_mut().find(|(script, _)| *script == script_pubkey) {
            Some((_, amount)) => *amount += value - share,
            None => destinations.push((script_pubkey, value - share)),
        }
        prevouts.push(prevout);
    }

    if !rejected.is_empty() {
        return Ok((empty_transaction(), prevouts, rejected));
    }

    let lock_time = outputs
        .iter()
        .filter(|output| !output.cooperative && output.is_refund())
        .map(|output| output.timeout_block_height)
        .max()
        .unwrap_or(0);

    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(lock_time),
        input: outputs
            .iter()
            .map(|output| TxIn {
                previous_output: output.outpoint(),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ZERO,
                witness: Witness::new(),
            })
            .collect(),
        output: destinations
            .into_iter()
            .map(|(script_pubkey, value)| TxOut {
                value: Amount::from_sat(value),
                script_pubkey,
            })
            .collect(),
    };

    for (index, output) in outputs.iter().enumerate() {
        let witness = if output.cooperative {
            Witness::from_slice(&[DUMMY_SIGNATURE.as_slice()])
        } else {
            script_path_witness(&tx, &prevouts, output, index)?
        };
        tx.input[index].witness = witness;
    }

    Ok((tx, prevouts, rejected))
}

fn empty_transaction() -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: Vec::new(),
        output: Vec::new(),
    }
}

/// Signs input `index` through the claim or refund leaf.
fn script_path_witness(
    tx: &Transaction,
    prevouts: &[TxOut],
    output: &OutputDetails,
    index: usize,
) -> Result<Witness, ProtocolError> {
    let tree = &output.tree;
    let (leaf, control_block) = tree.leaf(output.is_refund())?;

    let sighash = SighashCache::new(tx).taproot_script_spend_signature_hash(
        index,
        &Prevouts::All(prevouts),
        TapLeafHash::from_script(leaf, LeafVersion::TapScript),
        SIGHASH_TYPE,
    )?;

    let secp = Secp256k1::new();
    let keypair = Keypair::from_secret_key(&secp, tree.our_key());
    let signature = taproot::Signature {
        signature: secp.sign_schnorr(&Message::from_digest(sighash.to_byte_array()), &keypair),
        sighash_type: SIGHASH_TYPE,
    };

    let mut witness = Witness::new();
    witness.push(signature.to_vec());
    if !output.is_refund() {
        witness.push(&output.preimage);
    }
    witness.push(leaf.as_bytes());
    witness.push(control_block.serialize());
    Ok(witness)
}

/// Exchanges partial signatures with the counterparty and writes the key path witness of `index`.
fn sign_cooperative(
    tx: &mut Transaction,
    prevouts: &[TxOut],
    output: &OutputDetails,
    index: usize,
    api: Option<&dyn CounterpartyApi>,
) -> Result<(), ProtocolError> {
    let api = api.ok_or(ProtocolError::General(
        "counterparty api is required for cooperative transactions",
    ))?;

    if let Some(id) = &output.funding_address_id {
        return sign_funding_refund(tx, prevouts, output, id, index, api);
    }

    let session = SigningSession::new(&output.tree)?;
    let transaction = serialize_hex(&*tx);
    let pub_nonce = session.public_nonce().to_vec();

    let refund_request = RefundRequest {
        pub_nonce: pub_nonce.clone(),
        transaction: transaction.clone(),
        index,
    };
    let claim_request = ClaimRequest {
        preimage: output.preimage.clone(),
        pub_nonce,
        transaction,
        index,
    };

    let signature = match output.swap_type {
        SwapType::Reverse => api.claim_reverse_swap(&output.swap_id, &claim_request)?,
        SwapType::Submarine => api.refund_swap(&output.swap_id, &refund_request)?,
        SwapType::Chain if output.is_refund() => {
            api.refund_chain_swap(&output.swap_id, &refund_request)?
        }
        SwapType::Chain => {
            let details = api.get_chain_swap_claim_details(&output.swap_id)?;
            let mut counterparty_claim =
                match (&details.funding_address_id, &output.user_lockup_tree) {
                    (Some(_), Some(tree @ LockupTree::Funding(_)))
                    | (None, Some(tree @ LockupTree::Swap(_))) => SigningSession::new(tree)?,
                    (Some(_), _) => {
                        return Err(ProtocolError::General(
                            "funding tree is required for cooperative claims of funded chain swaps",
                        ))
                    }
                    (None, _) => {
                        return Err(ProtocolError::General(
                            "refund swap tree is required for cooperative chain swap claims",
                        ))
                    }
                };
            let our_partial =
                counterparty_claim.sign(&details.transaction_hash, &details.pub_nonce)?;
            api.exchange_chain_swap_claim_signature(
                &output.swap_id,
                &ChainSwapSigningRequest {
                    preimage: output.preimage.clone(),
                    signature: Some(our_partial),
                    to_sign: Some(claim_request),
                },
            )?
        }
    };

    session.finalize(tx, prevouts, index, &signature)
}

/// Refunds funding address `id` through the key path, outside of any swap.
fn sign_funding_refund(
    tx: &mut Transaction,
    prevouts: &[TxOut],
    output: &OutputDetails,
    id: &str,
    index: usize,
    api: &dyn CounterpartyApi,
) -> Result<(), ProtocolError> {
    let LockupTree::Funding(tree) = &output.tree else {
        return Err(ProtocolError::General(
            "funding tree is required for funding address refunds",
        ));
    };

    let session = SigningSession::new(tree)?;
    let request = FundingRefundRequest {
        pub_nonce: session.public_nonce().to_vec(),
        transaction_hash: key_spend_sighash(tx, prevouts, index)?.to_vec(),
    };
    let signature = api.refund_funding_address(id, &request)?;
    session.finalize(tx, prevouts, index, &signature)
}
