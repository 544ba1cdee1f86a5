//! Swap data model.
//!
//! Currencies, pairs, swap kinds and states shared by the state machines, the wire clients and the
//! store. The persisted records live in [`records`], the counterparty status vocabulary in
//! [`status`].

pub mod records;
pub mod status;

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

pub use records::{
    ChainSwap, ChainSwapData, FundingAddress, Leg, ReverseSwap, SomeSwap, Swap, SwapUpdate,
};
pub use status::{FundingStatus, SwapStatus};

/// An on-chain currency a swap can lock funds on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Currency {
    /// Bitcoin mainchain.
    #[serde(rename = "BTC")]
    Btc,
    /// Liquid Bitcoin sidechain.
    #[serde(rename = "L-BTC")]
    Liquid,
}

impl Currency {
    /// All supported currencies.
    pub const ALL: [Currency; 2] = [Currency::Btc, Currency::Liquid];

    /// Expected block interval in minutes.
    pub fn block_time_minutes(&self) -> u64 {
        match self {
            Currency::Btc => 10,
            Currency::Liquid => 1,
        }
    }

    /// Wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Btc => "BTC",
            Currency::Liquid => "L-BTC",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BTC" => Ok(Currency::Btc),
            "L-BTC" | "LBTC" | "LIQUID" => Ok(Currency::Liquid),
            other => Err(format!("invalid currency: {other}")),
        }
    }
}

/// Currency pair of a swap. `from` is what the user sends, `to` what they receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pair {
    /// Sending side.
    pub from: Currency,
    /// Receiving side.
    pub to: Currency,
}

impl Pair {
    /// Creates a new pair.
    pub fn new(from: Currency, to: Currency) -> Self {
        Self { from, to }
    }
}

impl fmt::Display for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.from, self.to)
    }
}

/// Kind of swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwapType {
    /// Submarine swap: the user locks on-chain, the counterparty pays a Lightning invoice.
    Submarine,
    /// Reverse swap: the user pays a Lightning invoice, the counterparty locks on-chain.
    Reverse,
    /// Chain swap: both sides lock on-chain.
    Chain,
}

impl fmt::Display for SwapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwapType::Submarine => write!(f, "submarine"),
            SwapType::Reverse => write!(f, "reverse"),
            SwapType::Chain => write!(f, "chain"),
        }
    }
}

/// Local lifecycle state of a swap.
///
/// `Successful`, `Refunded` and `Abandoned` are terminal. `Pending` and `Error` swaps are picked
/// up again on restart.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum SwapState {
    /// Swap is in progress.
    #[default]
    Pending,
    /// Swap completed.
    Successful,
    /// The counterparty reported a failure.
    ServerError,
    /// A local error occurred.
    Error,
    /// Funds were refunded.
    Refunded,
    /// Swap was abandoned by the user.
    Abandoned,
}

impl SwapState {
    /// Whether the swap has reached a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SwapState::Successful | SwapState::Refunded | SwapState::Abandoned
        )
    }

    /// Every state.
    pub const ALL: [SwapState; 6] = [
        SwapState::Pending,
        SwapState::Successful,
        SwapState::ServerError,
        SwapState::Error,
        SwapState::Refunded,
        SwapState::Abandoned,
    ];

    /// States picked up again on restart.
    pub const RECOVERABLE: [SwapState; 2] = [SwapState::Pending, SwapState::Error];
}

impl fmt::Display for SwapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SwapState::Pending => "PENDING",
            SwapState::Successful => "SUCCESSFUL",
            SwapState::ServerError => "SERVER_ERROR",
            SwapState::Error => "ERROR",
            SwapState::Refunded => "REFUNDED",
            SwapState::Abandoned => "ABANDONED",
        };
        f.write_str(s)
    }
}
