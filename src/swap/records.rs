#![allow(missing_docs)]
//! Persisted swap records.

use bitcoin::{
    hashes::{sha256, Hash},
    secp256k1::PublicKey,
};
use serde::{Deserialize, Serialize};

use super::{Currency, Pair, SwapState, SwapType};
use crate::{
    fees::Percentage,
    protocol::{
        error::ProtocolError,
        swap_tree::{FundingTree, OurSide, SwapTree, TreeKind},
    },
    utill::SerializableSecretKey,
};

/// Submarine swap: we lock on-chain, the counterparty pays our invoice and claims.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Swap {
    pub id: String,
    pub pair: Pair,
    pub chan_ids: Vec<u64>,
    pub state: SwapState,
    pub error: String,
    pub status: String,
    pub created_at: u64,
    pub private_key: SerializableSecretKey,
    pub counterparty_public_key: PublicKey,
    /// Learned from the counterparty's claim. Empty until then.
    pub preimage: Vec<u8>,
    pub payment_hash: sha256::Hash,
    pub invoice: String,
    pub lockup_address: String,
    pub expected_amount: u64,
    pub timeout_block_height: u32,
    pub lockup_transaction_id: String,
    pub refund_transaction_id: String,
    pub refund_address: String,
    pub wallet_id: Option<u64>,
    pub is_auto: bool,
    pub service_fee_percent: Percentage,
    pub service_fee: Option<i64>,
    pub onchain_fee: Option<u64>,
}

impl Swap {
    /// Tree of the lockup. We hold the refund side.
    pub fn swap_tree(&self) -> Result<SwapTree, ProtocolError> {
        SwapTree::new(
            TreeKind::Submarine,
            OurSide::Refund,
            self.private_key.0,
            self.counterparty_public_key,
            self.payment_hash,
            self.timeout_block_height,
        )
    }
}

/// Reverse swap: we pay a Lightning invoice, the counterparty locks on-chain and we claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverseSwap {
    pub id: String,
    pub pair: Pair,
    pub chan_ids: Vec<u64>,
    pub state: SwapState,
    pub error: String,
    pub status: String,
    pub created_at: u64,
    pub paid_at: Option<u64>,
    pub accept_zero_conf: bool,
    pub private_key: SerializableSecretKey,
    pub counterparty_public_key: PublicKey,
    pub preimage: Vec<u8>,
    pub invoice: String,
    /// Where the claimed funds go. Empty to derive one from `wallet_id`.
    pub claim_address: String,
    pub onchain_amount: u64,
    pub invoice_amount: u64,
    pub timeout_block_height: u32,
    pub lockup_transaction_id: String,
    pub claim_transaction_id: String,
    pub routing_fee_msat: Option<u64>,
    /// Overrides the configured routing fee limit.
    pub routing_fee_limit_ppm: Option<u64>,
    /// The invoice is paid by someone else.
    pub external_pay: bool,
    pub wallet_id: Option<u64>,
    pub is_auto: bool,
    pub service_fee_percent: Percentage,
    pub service_fee: Option<i64>,
    pub onchain_fee: Option<u64>,
}

impl ReverseSwap {
    pub fn payment_hash(&self) -> sha256::Hash {
        sha256::Hash::hash(&self.preimage)
    }

    /// Tree of the lockup. We hold the claim side.
    pub fn swap_tree(&self) -> Result<SwapTree, ProtocolError> {
        SwapTree::new(
            TreeKind::Reverse,
            OurSide::Claim,
            self.private_key.0,
            self.counterparty_public_key,
            self.payment_hash(),
            self.timeout_block_height,
        )
    }
}

/// One on-chain leg of a chain swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSwapData {
    /// Id of the chain swap.
    pub id: String,
    pub currency: Currency,
    pub private_key: SerializableSecretKey,
    pub their_public_key: PublicKey,
    pub amount: u64,
    pub timeout_block_height: u32,
    pub lockup_address: String,
    pub lockup_transaction_id: String,
    /// Our claim or refund of this leg.
    pub transaction_id: String,
    /// Destination of our spend. Empty to derive one from `wallet_id`.
    pub address: String,
    pub wallet_id: Option<u64>,
}

impl ChainSwapData {
    fn tree(&self, side: OurSide, payment_hash: sha256::Hash) -> Result<SwapTree, ProtocolError> {
        SwapTree::new(
            TreeKind::Reverse,
            side,
            self.private_key.0,
            self.their_public_key,
            payment_hash,
            self.timeout_block_height,
        )
    }
}

/// One side of a chain swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Leg {
    /// Our lockup.
    From,
    /// The counterparty's lockup.
    To,
}

/// Chain swap: both sides lock on-chain. We lock `from_data` and claim `to_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainSwap {
    pub id: String,
    pub pair: Pair,
    pub state: SwapState,
    pub error: String,
    pub status: String,
    pub created_at: u64,
    pub accept_zero_conf: bool,
    pub preimage: Vec<u8>,
    pub is_auto: bool,
    pub service_fee_percent: Percentage,
    pub service_fee: Option<i64>,
    pub onchain_fee: Option<u64>,
    pub from_data: ChainSwapData,
    pub to_data: ChainSwapData,
}

impl ChainSwap {
    pub fn payment_hash(&self) -> sha256::Hash {
        sha256::Hash::hash(&self.preimage)
    }

    pub fn data(&self, leg: Leg) -> &ChainSwapData {
        match leg {
            Leg::From => &self.from_data,
            Leg::To => &self.to_data,
        }
    }

    pub fn data_mut(&mut self, leg: Leg) -> &mut ChainSwapData {
        match leg {
            Leg::From => &mut self.from_data,
            Leg::To => &mut self.to_data,
        }
    }

    /// Tree of our lockup. We hold the refund side.
    pub fn from_tree(&self) -> Result<SwapTree, ProtocolError> {
        self.from_data.tree(OurSide::Refund, self.payment_hash())
    }

    /// Tree of the counterparty's lockup. We hold the claim side.
    pub fn to_tree(&self) -> Result<SwapTree, ProtocolError> {
        self.to_data.tree(OurSide::Claim, self.payment_hash())
    }
}

/// Address the counterparty can later spend into a swap with our co-signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingAddress {
    pub id: String,
    pub currency: Currency,
    pub address: String,
    pub timeout_block_height: u32,
    pub counterparty_public_key: PublicKey,
    pub private_key: SerializableSecretKey,
    pub status: String,
    pub lockup_transaction_id: String,
    pub swap_id: String,
    pub created_at: u64,
}

impl FundingAddress {
    pub fn funding_tree(&self) -> Result<FundingTree, ProtocolError> {
        FundingTree::new(
            self.private_key.0,
            self.counterparty_public_key,
            self.timeout_block_height,
        )
    }
}

/// Any of the three swap kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum SomeSwap {
    Submarine(Swap),
    Reverse(ReverseSwap),
    Chain(ChainSwap),
}

impl SomeSwap {
    pub fn id(&self) -> &str {
        match self {
            SomeSwap::Submarine(swap) => &swap.id,
            SomeSwap::Reverse(swap) => &swap.id,
            SomeSwap::Chain(swap) => &swap.id,
        }
    }

    pub fn swap_type(&self) -> SwapType {
        match self {
            SomeSwap::Submarine(_) => SwapType::Submarine,
            SomeSwap::Reverse(_) => SwapType::Reverse,
            SomeSwap::Chain(_) => SwapType::Chain,
        }
    }

    pub fn state(&self) -> SwapState {
        match self {
            SomeSwap::Submarine(swap) => swap.state,
            SomeSwap::Reverse(swap) => swap.state,
            SomeSwap::Chain(swap) => swap.state,
        }
    }

    pub fn status(&self) -> &str {
        match self {
            SomeSwap::Submarine(swap) => &swap.status,
            SomeSwap::Reverse(swap) => &swap.status,
            SomeSwap::Chain(swap) => &swap.status,
        }
    }

    /// Whether listeners can stop following the swap.
    ///
    /// Submarine and chain swaps are final once successful or refunded and our lockup is known.
    /// Reverse swaps are final once successful with a known claim, refunded or abandoned. Local
    /// and counterparty errors are not: the swap stays followed and can still progress.
    pub fn is_final(&self) -> bool {
        match self {
            SomeSwap::Submarine(swap) => {
                matches!(swap.state, SwapState::Successful | SwapState::Refunded)
                    && !swap.lockup_transaction_id.is_empty()
            }
            SomeSwap::Reverse(swap) => match swap.state {
                SwapState::Successful => !swap.claim_transaction_id.is_empty(),
                SwapState::Pending | SwapState::Error | SwapState::ServerError => false,
                SwapState::Refunded | SwapState::Abandoned => true,
            },
            SomeSwap::Chain(swap) => {
                matches!(swap.state, SwapState::Successful | SwapState::Refunded)
                    && !swap.from_data.lockup_transaction_id.is_empty()
            }
        }
    }
}

impl From<Swap> for SomeSwap {
    fn from(swap: Swap) -> Self {
        SomeSwap::Submarine(swap)
    }
}

impl From<ReverseSwap> for SomeSwap {
    fn from(swap: ReverseSwap) -> Self {
        SomeSwap::Reverse(swap)
    }
}

impl From<ChainSwap> for SomeSwap {
    fn from(swap: ChainSwap) -> Self {
        SomeSwap::Chain(swap)
    }
}

/// Update sent to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapUpdate {
    pub swap: SomeSwap,
    pub is_final: bool,
}

impl From<SomeSwap> for SwapUpdate {
    fn from(swap: SomeSwap) -> Self {
        let is_final = swap.is_final();
        SwapUpdate { swap, is_final }
    }
}
